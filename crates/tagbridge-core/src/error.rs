use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid tag id: {0}")]
    InvalidTagId(String),

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Collaborator failed: {0}")]
    Collaborator(String),
}

pub type Result<T> = std::result::Result<T, Error>;
