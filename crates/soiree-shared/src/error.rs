use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid object id: {0:?}")]
    InvalidObjectId(String),

    #[error("Invalid email address: {0:?}")]
    InvalidEmail(String),

    #[error("Unknown {kind} value: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("Frame has no string `type` field")]
    MissingType,

    #[error("Malformed `{kind}` frame: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
