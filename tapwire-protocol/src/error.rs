use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown proxy event `{0}`")]
    UnknownEvent(String),
    #[error("malformed proxy event payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("proxy event payload must be a JSON object")]
    NotAnObject,
}
