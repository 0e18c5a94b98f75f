use std::io;

use thiserror::Error;

/// Errors raised while loading captures, importing pcaps or serving clients.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The capture ended inside a record, or a record header is invalid.
    #[error("malformed capture at byte {offset}: {detail}")]
    MalformedCapture { offset: usize, detail: String },

    /// Writing to a client failed. Only ever affects that one client.
    #[error("connection fault: {0}")]
    ConnectionFault(#[source] io::Error),

    /// A payload too long for the signed 32-bit length field.
    #[error("packet {index} payload of {len} bytes does not fit a capture record")]
    PayloadTooLarge { index: usize, len: usize },

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap_file::PcapError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ReplayError>;
