use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerwiseError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shape mismatch in {operator}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        operator: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Unsupported operation: {op_type} (opset version {version})")]
    UnsupportedOperation { op_type: String, version: i64 },

    #[error("Unsupported attribute {attribute} on {op_type}: {detail}")]
    UnsupportedAttribute {
        op_type: String,
        attribute: String,
        detail: String,
    },

    #[error("Cache underflow: backward called on {operator} without a pending forward")]
    CacheUnderflow { operator: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LayerwiseError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        LayerwiseError::Configuration(msg.into())
    }

    pub(crate) fn shape(operator: &str, expected: &[usize], actual: &[usize]) -> Self {
        LayerwiseError::ShapeMismatch {
            operator: operator.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LayerwiseError>;
