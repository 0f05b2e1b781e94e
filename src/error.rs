use thiserror::Error;

#[derive(Error, Debug)]
pub enum Text2SqlError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Schema is empty: no tables found in the target database")]
    EmptySchema,

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Text2SqlError>;
