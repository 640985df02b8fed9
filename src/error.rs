use thiserror::Error;

#[derive(Error, Debug)]
pub enum CifraError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment gateway error: {message}")]
    Gateway { message: String },

    #[error("Object storage error: {message}")]
    ObjectStore { message: String },

    #[error("Email delivery failed: {message}")]
    Email { message: String },

    #[error("Template rendering failed: {0}")]
    Template(#[from] askama::Error),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),
}

impl CifraError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CifraError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        CifraError::Storage {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CifraError>;
