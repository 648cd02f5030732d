use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("http request failed: {0}")]
    Http(String),
    #[error("unexpected status code {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("queue {0} is full")]
    QueueFull(String),
    #[error("queue {0} does not exist")]
    QueueNotFound(String),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
