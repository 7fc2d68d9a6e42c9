use shared::error::BackendError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no active channel")]
    NoActiveChannel,
    #[error("message has no text or file")]
    EmptyMessage,
    #[error("access denied by backend: {0}")]
    AccessDenied(String),
    #[error("failed to subscribe: {0}")]
    Subscribe(#[source] BackendError),
    #[error("failed to publish message: {0}")]
    Publish(#[source] BackendError),
}
