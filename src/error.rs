use thiserror::Error;
use crate::defer::Failure;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum Error {
    #[error("deferred already settled")]
    AlreadySettled,
    #[error("{0}")]
    Rejected(Failure),
    #[error("deferred dropped while pending")]
    Abandoned,
    #[error("unknown handle {0}")]
    UnknownHandle(u64),
    #[error("boundary transport failed: {0}")]
    Transport(String),
}
