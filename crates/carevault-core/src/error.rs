use thiserror::Error;

pub type CarevaultResult<T> = Result<T, CarevaultError>;

#[derive(Debug, Error)]
pub enum CarevaultError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
