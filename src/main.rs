use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use text2sql::db::{Database, PostgresDatabase, ResultSet, SqliteDatabase};
use text2sql::{LlmConfig, OpenAiClient, Pipeline, PipelineConfig, Session};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

#[derive(Parser)]
#[command(name = "text2sql")]
#[command(about = "Answer natural-language questions with validated, read-only SQL")]
struct Args {
    /// The question in natural language
    question: Option<String>,

    /// SQLite file path or postgres:// URL (or set DATABASE_URL env var)
    #[arg(short, long)]
    database: Option<String>,

    /// PostgreSQL schema to introspect
    #[arg(long, default_value = "public")]
    pg_schema: String,

    /// Print the extracted catalog and exit
    #[arg(long)]
    schema: bool,

    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Show linked tables and the attempt history
    #[arg(short, long)]
    verbose: bool,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    max_rows: Option<usize>,

    /// Execution time limit in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = PipelineConfig::from_env()?;
    if let Some(n) = args.max_attempts {
        config.max_correction_attempts = n;
    }
    if let Some(k) = args.top_k {
        config.link_top_k = k;
    }
    if let Some(n) = args.max_rows {
        config.max_rows = n;
    }
    if let Some(secs) = args.timeout {
        config.execution_timeout = Duration::from_secs(secs);
    }
    config.validate()?;

    let url = args
        .database
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .context("no database given; pass --database or set DATABASE_URL")?;
    let db: Arc<dyn Database> = if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Arc::new(PostgresDatabase::connect(&url, args.pg_schema.clone()).await?)
    } else {
        Arc::new(SqliteDatabase::open(&url)?)
    };

    if args.schema {
        let catalog = text2sql::Catalog::extract(db.as_ref(), config.sample_values).await?;
        println!("{}", catalog.render_ddl());
        return Ok(());
    }

    let Some(question) = args.question.as_deref() else {
        bail!("no question given");
    };

    let mut llm_config = LlmConfig::from_env_with_key(args.api_key.clone())?;
    if let Some(model) = args.model.clone() {
        llm_config.model = model;
    }
    if let Some(base_url) = args.base_url.clone() {
        llm_config.base_url = base_url;
    }

    let llm = Arc::new(OpenAiClient::new(llm_config, config.llm_timeout)?);
    info!("Using model {}", llm.model());
    let pipeline = Pipeline::connect(db, llm, config).await?;

    let mut session = Session::new();
    match pipeline.ask(question, &mut session).await {
        Ok(answer) => {
            if args.verbose {
                eprintln!("Linked tables: {}", answer.linked_tables.join(", "));
                for attempt in &answer.history {
                    eprintln!(
                        "Attempt {}: {}\n  {}",
                        attempt.candidate.attempt_number, attempt.result, attempt.candidate.sql
                    );
                }
            }
            println!("{}\n", answer.sql);
            print_rows(&answer.rows, args.format)?;
            Ok(())
        }
        Err(failure) => {
            if args.verbose {
                for attempt in &failure.history {
                    eprintln!(
                        "Attempt {}: {}\n  {}",
                        attempt.candidate.attempt_number, attempt.result, attempt.candidate.sql
                    );
                }
            }
            Err(failure.into())
        }
    }
}

fn print_rows(rows: &ResultSet, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows.to_records())?);
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            writer.write_record(&rows.columns)?;
            for row in &rows.rows {
                writer.write_record(row.iter().map(render_cell))?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            let cells: Vec<Vec<String>> = rows.rows.iter().map(|r| r.iter().map(render_cell).collect()).collect();
            let widths: Vec<usize> = rows
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    cells
                        .iter()
                        .filter_map(|r| r.get(i))
                        .map(|s| s.chars().count())
                        .chain(std::iter::once(c.chars().count()))
                        .max()
                        .unwrap_or(0)
                })
                .collect();
            let line = |values: &[String]| {
                values
                    .iter()
                    .zip(&widths)
                    .map(|(v, w)| format!("{:<width$}", v, width = *w))
                    .collect::<Vec<_>>()
                    .join(" | ")
            };
            println!("{}", line(&rows.columns));
            println!("{}", widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-"));
            for row in &cells {
                println!("{}", line(row));
            }
            println!("\n({} rows{})", rows.row_count(), if rows.truncated { ", truncated" } else { "" });
        }
    }
    Ok(())
}

fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
