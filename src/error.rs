//! Error types for the control-port filter.

use std::io;

/// A fatal error encountered while running a single client [`crate::session::Session`].
///
/// None of these are recoverable mid-session: whichever pump or setup step
/// produces one causes the whole session to tear down. Policy denials are
/// *not* errors; see [`crate::policy::Verdict::Deny`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A read, write, or open failed on either transport.
    #[error("transport I/O error: {0}")]
    TransportIO(#[source] io::Error),

    /// The daemon's `PROTOCOLINFO` or `AUTHCHALLENGE` reply could not be parsed.
    #[error("could not parse authentication reply: {0}")]
    AuthParse(String),

    /// The daemon advertised no authentication method we can use, or
    /// advertised COOKIE/SAFECOOKIE without a usable cookie file.
    #[error("no usable authentication method available")]
    AuthMethodUnavailable,

    /// The SAFECOOKIE server hash did not match what we computed.
    ///
    /// This may indicate an attacker impersonating the control daemon.
    #[error("SAFECOOKIE server hash did not verify")]
    ServerHashMismatch,

    /// The cookie file could not be read.
    #[error("could not read cookie file: {0}")]
    CookieRead(#[source] io::Error),

    /// The configuration document was invalid.
    ///
    /// Only ever produced at startup, never once the Supervisor is running.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::TransportIO(e)
    }
}

/// Convenience alias used throughout the crate's internals.
pub type Result<T> = std::result::Result<T, Error>;
