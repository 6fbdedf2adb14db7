use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid Limit - {0}")]
    InvalidLimit(String),

    #[error("Invalid Interval - {0}")]
    InvalidInterval(String),
}
