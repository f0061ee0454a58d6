use object_page_core::{StoreError, StoreOp};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(String),

    #[error("http client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Map a transport failure to the engine's store error.
pub(crate) fn transport(op: StoreOp, err: reqwest::Error) -> StoreError {
    if err.is_decode() {
        StoreError::Decode(format!("{op}: {err}"))
    } else {
        StoreError::Transport(format!("{op}: {err}"))
    }
}
