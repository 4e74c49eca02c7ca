use thiserror::Error;

/// Errors raised while exchanging frames with the BMS.
///
/// The session layer collapses all of these into a single
/// communication-error flag; the variants stay distinct so logs and tests
/// can tell a dead transport from a corrupted frame.
#[derive(Error, Debug)]
pub enum Error {
    /// No complete frame arrived before the read deadline.
    #[error("Transport timed out before a complete frame arrived")]
    Timeout,

    /// The frame arrived but its envelope is wrong: bad start marker,
    /// wrong echoed command, a nonzero status code, or a length byte that
    /// disagrees with the received span.
    #[error("Response framing mismatch: {0}")]
    Framing(&'static str),

    /// The recomputed checksum disagrees with the transmitted one.
    #[error("Invalid checksum - calculated={calculated:#06X} received={received:#06X}")]
    Checksum { calculated: u16, received: u16 },

    /// Transport-level I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
