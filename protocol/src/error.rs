//! Protocol-level errors, narrow at this crate's boundary (see DESIGN.md's
//! error handling section): parsing and framing failures are distinguished
//! from each other here, then widened to [`cc_error::Error::InvalidObject`]
//! wherever a caller needs the pipeline-wide taxonomy instead.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("message shorter than the 8-byte size/tag header")]
    Truncated,

    #[error("declared size {declared} does not match {actual} bytes available")]
    SizeMismatch { declared: u32, actual: usize },

    #[error("object carries a proof-of-work block but only {have} of 48 bytes are present")]
    TruncatedPow { have: usize },

    #[error("unrecognized wire tag {0:#x}")]
    UnknownTag(u32),

    #[error("SOCKS4a reply shorter than 8 bytes")]
    SocksReplyTruncated,

    #[error("SOCKS4a setup rejected, status byte {0:#x}")]
    SocksRejected(u8),

    #[error("hostname exceeds the 88-byte onion hostname-file budget")]
    HostnameTooLong,
}

impl From<Error> for cc_error::Error {
    fn from(e: Error) -> Self {
        cc_error::Error::InvalidObject(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
