use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json encode: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid subscription: {0}")]
    InvalidSubscription(&'static str),
    #[error("invalid publish: {0}")]
    InvalidPublish(&'static str),
    #[error("unknown matcher `{0}`")]
    UnknownMatcher(String),
    #[error("engine publish outside the pub/sub namespace")]
    EngineFilter,
    #[error("cluster link is not running")]
    ClusterInactive,
    #[error("cluster role is already set for this process")]
    ClusterActive,
    #[error("frame {field} length {len} exceeds limit")]
    FrameOverflow { field: &'static str, len: usize },
    #[error("malformed frame: {0}")]
    FrameMalformed(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
