use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message draft is empty: content or attachments required")]
    EmptyDraft,
    #[error("message is not in a retryable state")]
    NotRetryable,
}
