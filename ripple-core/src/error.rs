use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by user business logic. The cause is kept on the coordinator of the failed batch.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a user handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A job was enqueued for a group that already has one in flight. Scheduling is broken, the
    /// worker that sees this has to stop.
    #[error("Synchronization Error - {0}")]
    Synchronization(String),

    #[error("Skip Message Not Found - topic {topic}, partition {partition}, offset {offset:?}")]
    SkipMessageNotFound {
        topic: String,
        partition: i32,
        offset: Option<i64>,
    },

    #[error("Client Error - {0}")]
    Client(String),

    #[error("Producer Error - {0}")]
    Producer(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Unsupported Features - {0}")]
    UnsupportedFeatures(String),

    #[error("Transaction Already Initialized")]
    TransactionAlreadyInitialized,

    #[error("Handler Error - {0}")]
    Handler(String),

    #[error("Poll Error - {0}")]
    Poll(String),

    #[error("Shutdown Error - {0}")]
    Shutdown(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl Error {
    /// Fatal errors terminate the worker instead of going through the retry policies.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Synchronization(_))
    }
}

impl From<ripple_throttling::Error> for Error {
    fn from(value: ripple_throttling::Error) -> Self {
        Error::Config(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Config(value.to_string())
    }
}
