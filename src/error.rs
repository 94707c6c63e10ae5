use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// `NoMatch` and `NoFace` are non-fatal sentinels the scheduler and pool
/// manager branch on directly; the rest map to HTTP status codes at the web
/// boundary (`web::rejection`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("no images match tag")]
    NoMatch,

    #[error("no face detected")]
    NoFace,

    #[error("invalid or unknown captcha id")]
    InvalidId,

    #[error("wrong captcha solution")]
    InvalidSolution,

    #[error("insufficient image pool for any configured tag")]
    InsufficientPool,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Transient(e.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Error::Transient(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transient(e.to_string())
    }
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        Error::Transient(e.to_string())
    }
}
