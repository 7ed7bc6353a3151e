use std::path::PathBuf;

// Configuration and startup errors, reported before any listener is started.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Both HTTP and HTTPS are disabled")]
    NothingToServe,
    #[error("HTTPS is enabled but has no connection source (local listener disabled and no relay host)")]
    NoConnectionSource,
    #[error("Invalid listen address {0}")]
    InvalidListenAddress(String),
    #[error("Invalid forward {0}, expected HOST=ADDRESS")]
    InvalidForward(String),
    #[error("Unable to read relay key {path}: {source}")]
    InvalidFabricsKey {
        path: PathBuf,
        source: russh::keys::Error,
    },
}
