use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid conversation key: {0}")]
    InvalidConversationKey(String),

    #[error("Invalid local id: {0}")]
    InvalidLocalId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
