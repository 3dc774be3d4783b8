use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid dataset descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid recurrence '{expr}': {reason}")]
    InvalidRecurrence { expr: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
