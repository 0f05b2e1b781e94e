//! Schema linking: lexical retrieval of the tables relevant to a question

pub mod retriever;
pub mod vector_store;

pub use retriever::{LinkedSchema, LinkedTable, SchemaLinker};
