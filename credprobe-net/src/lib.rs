mod http;
mod proxy;

pub use http::build_http_client;
pub use proxy::{dial, DEFAULT_DIAL_TIMEOUT};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("connect timeout")]
    Timeout,
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
