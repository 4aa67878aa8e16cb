//! Error taxonomy shared by the build pipeline, the distribution channel and
//! the installer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid entry point, missing plugin directory, bad config file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The bundler rejected the plugin sources.
    #[error("build failed: {0}")]
    Build(String),

    /// Archive is undecodable or lacks `plugin.json` / `main.js`.
    #[error("invalid plugin archive: {0}")]
    InvalidArchive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "io error: gone");
    }

    #[test]
    fn messages_carry_context() {
        let err = Error::InvalidArchive("missing main.js".into());
        assert_eq!(err.to_string(), "invalid plugin archive: missing main.js");
    }
}
