use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("PubSub error: {0}")]
    PubSub(#[from] redis::RedisError),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("No active user")]
    NoActiveUser,
    #[error("Session disposed")]
    Disposed,
    #[error("Internal error")]
    Internal,
}

pub type Result<T> = std::result::Result<T, AppError>;
