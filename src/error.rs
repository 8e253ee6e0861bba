use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::relay::Direction;

/// Terminal failures of a single tunnel. None of these are reported to the
/// client; the connection is simply closed.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("not a CONNECT request")]
    NotATunnelRequest,

    #[error("malformed CONNECT target")]
    MalformedTarget,

    #[error("failed to connect to {addr}: {source}")]
    UpstreamDial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
#[error("{direction} relay failed after {bytes} bytes: {source}")]
pub struct RelayError {
    pub direction: Direction,
    /// Bytes forwarded before the failure.
    pub bytes: u64,
    #[source]
    pub source: io::Error,
}

#[derive(Error, Debug)]
pub enum ListLoadError {
    #[error("failed to read {kind} file {path:?}: {source}")]
    Io {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// Resets and broken pipes are how tunnels normally end.
pub fn is_expected_error(e: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}
