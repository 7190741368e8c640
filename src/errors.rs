use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, BoxedError>;

/// Errors raised by cart mutations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CartError {
    #[error("Item is not in the cart: {0}")]
    InvalidItem(String),
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),
}

/// Errors from the persisted client storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed storage content: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported storage version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Errors from the order store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Which of the two order writes failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceStep {
    Header,
    Items,
}

impl std::fmt::Display for PersistenceStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceStep::Header => write!(f, "order header"),
            PersistenceStep::Items => write!(f, "order items"),
        }
    }
}

/// Errors surfaced to the caller of a checkout
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("The cart is empty")]
    EmptyCart,
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
    #[error("Failed to persist {step}: {source}")]
    Persistence {
        step: PersistenceStep,
        #[source]
        source: StoreError,
    },
    #[error("An order submission is already in progress")]
    SubmissionInProgress,
}

impl OrderError {
    /// The write that failed, for persistence errors
    pub fn failed_step(&self) -> Option<PersistenceStep> {
        match self {
            OrderError::Persistence { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Errors from the messaging collaborator. These are logged, never returned to a customer.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Failed to reach the messaging service: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Messaging service answered with status {0}")]
    Status(u16),
    #[error("Messaging service rejected the message: {0}")]
    Rejected(String),
    #[error("Malformed messaging payload: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from the menu source
#[derive(Debug, Error)]
pub enum MenuError {
    #[error("No menu source configured")]
    NotConfigured,
    #[error("Menu request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Failed to reach the menu source: {0}")]
    Transport(reqwest::Error),
    #[error("Menu source answered with status {0}")]
    Status(u16),
    #[error("Malformed menu payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Invalid menu row '{name}': {reason}")]
    InvalidRow { name: String, reason: String },
}

/// Errors found while reading the configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid URL for {0}. Should be http(s)://<host>[:<port>][/<path>]")]
    InvalidUrl(&'static str),
    #[error("Missing variable '{0}'")]
    MissingVariable(&'static str),
    #[error("Invalid value for '{0}'")]
    InvalidValue(&'static str),
}
