//! Error Classifier
//!
//! Classifies engine dry-run rejections into a taxonomy and pulls out the
//! name the engine could not resolve.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref TABLE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)no such table:\s*([^\s,]+)").unwrap(),
        Regex::new(r#"(?i)relation "([^"]+)" does not exist"#).unwrap(),
        Regex::new(r#"(?i)table "?([A-Za-z0-9_.]+)"? does not exist"#).unwrap(),
    ];
    static ref COLUMN_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)no such column:\s*([^\s,]+)").unwrap(),
        Regex::new(r#"(?i)column "?([A-Za-z0-9_.]+)"? does not exist"#).unwrap(),
    ];
    static ref AMBIGUOUS_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)ambiguous column name:\s*([^\s,]+)").unwrap(),
        Regex::new(r#"(?i)column reference "([^"]+)" is ambiguous"#).unwrap(),
    ];
    static ref MISSING_FROM: Regex =
        Regex::new(r#"(?i)missing FROM-clause entry for table "([^"]+)""#).unwrap();
}

/// Engine error classification taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlErrorClass {
    TableNotFound(String),
    ColumnNotFound(String),
    AmbiguousColumn(String),
    /// Qualifier used without the table in FROM
    MissingFromEntry(String),
    Other(String),
}

impl SqlErrorClass {
    /// The reference reported back to the model
    pub fn reference(&self) -> &str {
        match self {
            SqlErrorClass::TableNotFound(name)
            | SqlErrorClass::ColumnNotFound(name)
            | SqlErrorClass::AmbiguousColumn(name)
            | SqlErrorClass::MissingFromEntry(name)
            | SqlErrorClass::Other(name) => name,
        }
    }
}

impl fmt::Display for SqlErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlErrorClass::TableNotFound(name) => write!(f, "TableNotFound({})", name),
            SqlErrorClass::ColumnNotFound(name) => write!(f, "ColumnNotFound({})", name),
            SqlErrorClass::AmbiguousColumn(name) => write!(f, "AmbiguousColumn({})", name),
            SqlErrorClass::MissingFromEntry(name) => write!(f, "MissingFromEntry({})", name),
            SqlErrorClass::Other(msg) => write!(f, "Other({})", msg),
        }
    }
}

/// Error classifier
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an engine message into the taxonomy
    pub fn classify(&self, message: &str) -> SqlErrorClass {
        let message = message.trim();

        if let Some(name) = first_capture(&AMBIGUOUS_PATTERNS, message) {
            return SqlErrorClass::AmbiguousColumn(name);
        }

        if let Some(name) = first_capture(&COLUMN_PATTERNS, message) {
            return SqlErrorClass::ColumnNotFound(name);
        }

        if let Some(name) = first_capture(&TABLE_PATTERNS, message) {
            return SqlErrorClass::TableNotFound(name);
        }

        if let Some(caps) = MISSING_FROM.captures(message) {
            return SqlErrorClass::MissingFromEntry(caps[1].to_string());
        }

        SqlErrorClass::Other(message.to_string())
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn first_capture(patterns: &[Regex], message: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(message))
        .map(|caps| caps[1].trim_end_matches(['"', '\'']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sqlite_messages() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("no such table: nosuchtable"),
            SqlErrorClass::TableNotFound("nosuchtable".to_string())
        );
        assert_eq!(
            classifier.classify("no such column: c.emial"),
            SqlErrorClass::ColumnNotFound("c.emial".to_string())
        );
        assert_eq!(
            classifier.classify("ambiguous column name: customer_id"),
            SqlErrorClass::AmbiguousColumn("customer_id".to_string())
        );
    }

    #[test]
    fn test_classify_postgres_messages() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("relation \"nosuchtable\" does not exist"),
            SqlErrorClass::TableNotFound("nosuchtable".to_string())
        );
        assert_eq!(
            classifier.classify("column \"nonexistent_col\" does not exist"),
            SqlErrorClass::ColumnNotFound("nonexistent_col".to_string())
        );
        assert_eq!(
            classifier.classify("missing FROM-clause entry for table \"o\""),
            SqlErrorClass::MissingFromEntry("o".to_string())
        );
    }

    #[test]
    fn test_unknown_message_is_kept() {
        let classifier = ErrorClassifier::new();
        let class = classifier.classify("misuse of aggregate: max()");
        assert_eq!(class.reference(), "misuse of aggregate: max()");
    }
}
