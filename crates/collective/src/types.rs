/// Errors raised by collective operations and group setup.
#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    /// A peer closed its connection in the middle of a collective call.
    #[error("peer rank {0} disconnected")]
    PeerDisconnected(usize),

    /// Members contributed buffers of different lengths to the same call.
    #[error("buffer length mismatch: rank {rank} sent {got} values, expected {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },

    /// A root outside `0..world_size` was requested.
    #[error("invalid root rank {root} for world size {world_size}")]
    InvalidRoot { root: usize, world_size: usize },

    /// Malformed launcher environment or handshake.
    #[error("launch error: {0}")]
    Launch(String),

    /// Peers did not connect before the deadline.
    #[error("timed out after {0}s waiting for the process group to form")]
    ConnectTimeout(u64),

    /// Another member panicked while holding shared group state.
    #[error("process group state poisoned")]
    Poisoned,

    /// A frame on a group socket could not be encoded or decoded.
    #[error("wire codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// IO error on a group socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
