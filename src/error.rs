use reqwest::StatusCode;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an error occurred with the database")]
    Sqlx(#[from] sqlx::Error),
    #[error("failed to apply schema")]
    Migrate(#[source] sqlx::Error),
    #[error("http request failed")]
    Http(#[from] reqwest::Error),
    #[error("http middleware failed")]
    Middleware(#[from] reqwest_middleware::Error),
    #[error("places api returned status {status}: {message}")]
    Api { status: String, message: String },
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("invalid csv")]
    Csv(#[from] csv::Error),
    #[error("unable to read workbook")]
    Xlsx(#[from] calamine::Error),
    #[error("failed to encode cache file")]
    CacheEncode(#[from] bincode::error::EncodeError),
    #[error("failed to decode cache file")]
    CacheDecode(#[from] bincode::error::DecodeError),
    #[error("unsupported source file {0}")]
    UnsupportedSource(PathBuf),
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("invalid url")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Whether retrying the same work later has a reasonable chance of succeeding.
    /// Everything else is a data or schema problem that needs a human.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlx(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            Self::Http(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(transient_status)
            }
            Self::Middleware(reqwest_middleware::Error::Reqwest(e)) => {
                e.is_timeout() || e.is_connect()
            }
            // the response cache wraps whatever failed on the way out, and that is the network
            // in practice
            Self::Middleware(reqwest_middleware::Error::Middleware(_)) => true,
            Self::Api { status, .. } => {
                matches!(status.as_str(), "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR")
            }
            Self::Io(_) => true,
            _ => false,
        }
    }
}

fn transient_status(s: StatusCode) -> bool {
    s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS
}
