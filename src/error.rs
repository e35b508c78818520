use std::io;
use thiserror::Error;
use std::string::FromUtf8Error;

/// type alias for all operations in this crate that could fail with a [`LockerError`]
pub type Result<T> = std::result::Result<T, LockerError>;

/// Error variants used throughout the locker server and client.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum LockerError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for RSA key generation, load, and encrypt/decrypt failures
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),

    /// variant for errors reading or writing PEM encoded key files
    #[error("PEM key file error")]
    Pkcs1(#[from] rsa::pkcs1::Error),

    /// variant for AES encryption/decryption failures
    #[error("{}", .0)]
    Crypto(String),

    /// variant for malformed wire data: bad envelope, bad body, out-of-range lengths
    #[error("{}", .0)]
    Protocol(String),

    /// variant for a persistence file whose records could not be replayed
    #[error("corrupt data file: {}", .0)]
    Corrupt(String),

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// variant for an error constant returned by the server to a client
    #[error("{}", .0)]
    Server(String),

    /// catch-all variant for reporting error message strings
    #[error("{}", .0)]
    StringErr(String),

    /// a field that must be printable text was an invalid UTF-8 sequence
    #[error("{}", .0)]
    Utf8Error(#[from] FromUtf8Error),
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for LockerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
