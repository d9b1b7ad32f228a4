use thiserror::Error;

use crate::schema::SchemaViolation;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid name: {0}")]
    InvalidName(#[from] crate::validation::NameError),

    #[error("Spec validation failed: {}", format_violations(.0))]
    SchemaValidation(Vec<SchemaViolation>),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.path, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_validation_lists_every_violation() {
        let err = Error::SchemaValidation(vec![
            SchemaViolation::new("a", "expected integer"),
            SchemaViolation::new("b.c", "missing required property"),
        ]);
        let text = err.to_string();
        assert!(text.contains("a: expected integer"));
        assert!(text.contains("b.c: missing required property"));
    }
}
