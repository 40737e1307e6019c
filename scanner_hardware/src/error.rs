use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("base read returned {0} bytes, expected 6")]
    BaseRead(usize),
    #[error("sample read timeout")]
    Timeout,
    #[error("No trigger on probe after full movement")]
    NoTrigger,
    #[error("printer is shut down: {0}")]
    Shutdown(String),
    #[error("{0}")]
    OutOfRange(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
