use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("bad destination spec '{0}'")]
    BadDest(String),

    #[error("malformed metadata block: {0}")]
    Metadata(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
