use std::io;

use thiserror::Error;

/// Failures a session or endpoint reports to its parent and, through the
/// pipe surface, to the protocol shell.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer's first eight bytes were not a valid protocol header.
    #[error("malformed protocol header")]
    BadHeader,

    /// The header parsed but the advertised protocol cannot talk to ours.
    #[error("peer protocol {0} rejected")]
    PeerRejected(u16),

    /// The header exchange did not finish within the allowed time.
    #[error("protocol header exchange timed out")]
    HandshakeTimeout,
}
