use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use text2sql::agent_prompts::GenerationRequest;
use text2sql::db::{Database, SqliteDatabase};
use text2sql::llm::LlmService;
use text2sql::{ask, ErrorKind, Pipeline, PipelineConfig, Session, Text2SqlError, ValidationResult};

/// Deterministic model stand-in: replays responses in order, repeating the last
struct ScriptedLlm {
    responses: Vec<String>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedLlm {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: responses.iter().map(|r| r.to_string()).collect(),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn complete(&self, request: &GenerationRequest) -> text2sql::Result<String> {
        let mut requests = self.requests.lock().unwrap();
        let idx = requests.len().min(self.responses.len() - 1);
        requests.push(request.clone());
        Ok(self.responses[idx].clone())
    }
}

/// Shop database: products, customers, orders (orders -> customers, products)
fn shop_db() -> Arc<dyn Database> {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE products (
             product_id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             price REAL NOT NULL,
             category TEXT
         );
         CREATE TABLE customers (
             customer_id INTEGER PRIMARY KEY,
             first_name TEXT,
             email TEXT
         );
         CREATE TABLE orders (
             order_id INTEGER PRIMARY KEY,
             customer_id INTEGER REFERENCES customers(customer_id),
             product_id INTEGER REFERENCES products(product_id),
             quantity INTEGER,
             order_date TEXT
         );
         INSERT INTO products (name, price, category) VALUES
             ('Laptop', 1200.0, 'Electronics'),
             ('Phone', 800.0, 'Electronics'),
             ('Desk', 350.0, 'Furniture'),
             ('Chair', 150.0, 'Furniture'),
             ('Monitor', 300.0, 'Electronics'),
             ('Pen', 2.5, 'Office'),
             ('Lamp', 45.0, 'Furniture');
         INSERT INTO customers (first_name, email) VALUES
             ('Ada', 'ada@example.com'),
             ('Linus', 'linus@example.com');
         INSERT INTO orders (customer_id, product_id, quantity, order_date) VALUES
             (1, 1, 1, '2024-01-05'),
             (2, 3, 2, '2024-02-11');",
    )
    .unwrap();
    Arc::new(SqliteDatabase::from_connection(conn))
}

async fn pipeline(llm: Arc<ScriptedLlm>, config: PipelineConfig) -> Pipeline {
    Pipeline::connect(shop_db(), llm, config).await.unwrap()
}

const TOP_FIVE: &str = "SELECT name, price FROM products ORDER BY price DESC LIMIT 5";

#[tokio::test]
async fn test_top_five_products_end_to_end() {
    let llm = ScriptedLlm::new(&[&format!("```sql\n{}\n```", TOP_FIVE)]);
    let pipeline = pipeline(llm.clone(), PipelineConfig::default()).await;
    let mut session = Session::new();

    let answer = pipeline
        .ask("What are the top 5 most expensive products?", &mut session)
        .await
        .unwrap();

    assert_eq!(answer.sql, TOP_FIVE);
    assert_eq!(answer.rows.row_count(), 5);
    assert_eq!(answer.attempts, 1);
    assert_eq!(answer.linked_tables[0], "products");

    let prices: Vec<f64> = (0..5)
        .map(|i| answer.rows.value(i, "price").and_then(|v| v.as_f64()).unwrap())
        .collect();
    assert!(prices.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(answer.rows.value(0, "name"), Some(&json!("Laptop")));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_unknown_table_exhausts_budget() {
    let llm = ScriptedLlm::new(&["SELECT * FROM nosuchtable"]);
    let pipeline = pipeline(llm.clone(), PipelineConfig::default()).await;
    let mut session = Session::new();

    let failure = pipeline.ask("show me everything", &mut session).await.unwrap_err();

    assert_eq!(failure.kind, ErrorKind::Exhausted);
    assert_eq!(failure.history.len(), 3);
    assert_eq!(llm.calls(), 3);
    assert!(failure
        .history
        .iter()
        .all(|a| matches!(&a.result, ValidationResult::SemanticError { unresolved_references }
            if unresolved_references.contains("nosuchtable"))));
    assert_eq!(
        failure.last_candidate.map(|c| c.sql),
        Some("SELECT * FROM nosuchtable".to_string())
    );
}

#[tokio::test]
async fn test_single_attempt_budget() {
    let llm = ScriptedLlm::new(&["SELECT * FROM nosuchtable"]);
    let config = PipelineConfig {
        max_correction_attempts: 1,
        ..PipelineConfig::default()
    };
    let pipeline = pipeline(llm.clone(), config).await;

    let failure = pipeline.ask("show me everything", &mut Session::new()).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Exhausted);
    assert_eq!(failure.history.len(), 1);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_write_statement_is_never_executed() {
    let llm = ScriptedLlm::new(&["DELETE FROM products"]);
    let db = shop_db();
    let pipeline = Pipeline::connect(Arc::clone(&db), llm, PipelineConfig::default())
        .await
        .unwrap();

    let failure = pipeline.ask("remove all products", &mut Session::new()).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Exhausted);
    assert_eq!(
        failure.history[0].result,
        ValidationResult::SafetyViolation {
            statement_type: "DELETE".to_string()
        }
    );

    let limits = text2sql::db::QueryLimits {
        max_rows: 100,
        timeout: std::time::Duration::from_secs(5),
    };
    let rows = db.query("SELECT COUNT(*) AS n FROM products", &limits).await.unwrap();
    assert_eq!(rows.value(0, "n"), Some(&json!(7)));
}

#[tokio::test]
async fn test_unknown_column_is_semantic_error() {
    let llm = ScriptedLlm::new(&["SELECT nonexistent_col FROM products"]);
    let pipeline = pipeline(llm, PipelineConfig::default()).await;

    let failure = pipeline.ask("what is the color of products", &mut Session::new()).await.unwrap_err();
    assert_eq!(
        failure.last_result,
        Some(ValidationResult::SemanticError {
            unresolved_references: BTreeSet::from(["nonexistent_col".to_string()])
        })
    );
}

#[tokio::test]
async fn test_self_correction_recovers() {
    let llm = ScriptedLlm::new(&["SELECT nme FROM products", "SELECT name FROM products WHERE price > 500"]);
    let pipeline = pipeline(llm.clone(), PipelineConfig::default()).await;

    let answer = pipeline
        .ask("which products cost more than 500?", &mut Session::new())
        .await
        .unwrap();
    assert_eq!(answer.attempts, 2);
    assert_eq!(answer.history.len(), 2);
    assert_eq!(answer.rows.row_count(), 2);

    let requests = llm.requests.lock().unwrap();
    let feedback = requests[1].prior_failure.as_ref().unwrap();
    assert_eq!(feedback.rejected_sql, "SELECT nme FROM products");
    assert!(feedback.suggestions.iter().any(|s| s == "nme -> products.name"));
}

#[tokio::test]
async fn test_same_question_same_answer() {
    let llm = ScriptedLlm::new(&[TOP_FIVE]);
    let pipeline = pipeline(llm, PipelineConfig::default()).await;
    let mut session = Session::new();

    let first = pipeline.ask("top 5 expensive products", &mut session).await.unwrap();
    let second = pipeline.ask("top 5 expensive products", &mut session).await.unwrap();
    assert_eq!(first.sql, second.sql);
    assert_eq!(first.rows, second.rows);
}

#[tokio::test]
async fn test_linker_never_empty() {
    let llm = ScriptedLlm::new(&[TOP_FIVE]);
    let pipeline = pipeline(llm, PipelineConfig::default()).await;

    for question in ["", "zzz qqq", "customer emails", "orders per product"] {
        assert!(!pipeline.link(question).is_empty(), "empty link for {:?}", question);
    }

    let linked = pipeline.link("how many orders per customer");
    assert!(linked.contains("orders"));
    assert!(linked.contains("customers"));
}

#[tokio::test]
async fn test_session_records_turns_and_feeds_context() {
    let llm = ScriptedLlm::new(&[TOP_FIVE, TOP_FIVE, "SELECT * FROM nosuchtable"]);
    let config = PipelineConfig {
        max_correction_attempts: 1,
        ..PipelineConfig::default()
    };
    let pipeline = pipeline(llm.clone(), config).await;
    let mut session = Session::new();

    pipeline.ask("top 5 products by price", &mut session).await.unwrap();
    pipeline.ask("and again", &mut session).await.unwrap();
    assert!(pipeline.ask("something broken", &mut session).await.is_err());

    let turns = session.turns();
    assert_eq!(turns.len(), 3);
    assert!(turns[0].succeeded && turns[1].succeeded);
    assert_eq!(turns[0].row_count, Some(5));
    assert!(!turns[2].succeeded);
    assert_eq!(turns[2].sql.as_deref(), Some("SELECT * FROM nosuchtable"));

    let requests = llm.requests.lock().unwrap();
    assert!(requests[0].conversation.is_empty());
    assert_eq!(requests[1].conversation.len(), 1);
    assert_eq!(requests[2].conversation.len(), 2);
}

#[tokio::test]
async fn test_empty_database_is_empty_schema() {
    let db: Arc<dyn Database> = Arc::new(SqliteDatabase::from_connection(Connection::open_in_memory().unwrap()));
    let llm = ScriptedLlm::new(&[TOP_FIVE]);

    let err = Pipeline::connect(Arc::clone(&db), llm.clone(), PipelineConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Text2SqlError::EmptySchema));

    let failure = ask("anything", db, llm.clone(), PipelineConfig::default(), &mut Session::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::EmptySchema);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_unreachable_database_is_connection_error() {
    let err = SqliteDatabase::open("/nonexistent/dir/shop.db").err().unwrap();
    let failure = text2sql::AskFailure::from(err);
    assert_eq!(failure.kind, ErrorKind::Connection);
}

/// Model stand-in whose service is always down
struct UnavailableLlm;

#[async_trait]
impl LlmService for UnavailableLlm {
    async fn complete(&self, _: &GenerationRequest) -> text2sql::Result<String> {
        Err(Text2SqlError::Generation("503 Service Unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_runtime_failure_is_execution_error() {
    let llm = ScriptedLlm::new(&["SELECT json_extract(name, '$.x') FROM products"]);
    let pipeline = pipeline(llm.clone(), PipelineConfig::default()).await;
    let mut session = Session::new();

    let failure = pipeline.ask("product name details", &mut session).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Execution);
    assert_eq!(llm.calls(), 1);
    assert_eq!(failure.history.len(), 1);
    assert_eq!(failure.history[0].result, ValidationResult::Valid);
    assert_eq!(
        failure.last_candidate.map(|c| c.sql),
        Some("SELECT json_extract(name, '$.x') FROM products".to_string())
    );
    assert!(!session.turns()[0].succeeded);
}

#[tokio::test]
async fn test_model_outage_is_generation_error() {
    let pipeline = Pipeline::connect(shop_db(), Arc::new(UnavailableLlm), PipelineConfig::default())
        .await
        .unwrap();

    let failure = pipeline.ask("top 5 products", &mut Session::new()).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Generation);
    assert!(failure.detail.contains("503"));
    assert!(failure.history.is_empty());
    assert!(failure.last_candidate.is_none());
}

#[tokio::test]
async fn test_invalid_config_is_config_error() {
    let llm = ScriptedLlm::new(&[TOP_FIVE]);
    let config = PipelineConfig {
        max_correction_attempts: 0,
        ..PipelineConfig::default()
    };

    let failure = ask("top 5 products", shop_db(), llm.clone(), config, &mut Session::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Config);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_reconnect_rebuilds_catalog() {
    let llm = ScriptedLlm::new(&["SELECT title FROM books"]);
    let mut pipeline = pipeline(llm, PipelineConfig::default()).await;
    assert_eq!(pipeline.catalog().len(), 3);

    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE books (book_id INTEGER PRIMARY KEY, title TEXT);
         INSERT INTO books (title) VALUES ('Dune'), ('Emma');",
    )
    .unwrap();
    pipeline
        .reconnect(Arc::new(SqliteDatabase::from_connection(conn)))
        .await
        .unwrap();

    assert_eq!(pipeline.catalog().len(), 1);
    assert!(pipeline.catalog().table("books").is_some());
    let answer = pipeline.ask("list book titles", &mut Session::new()).await.unwrap();
    assert_eq!(answer.rows.row_count(), 2);
}
