//! This module defines types used to configure the coordinator and its
//! parts.

use std::time::Duration;

use crate::{PeerId, BLOCK_LEN, MAX_BACKLOG};

/// The default client id used when the caller doesn't supply one.
pub const DEFAULT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for a single download.
///
/// The engine applies a default instance of this to every download, but
/// individual downloads may override it.
#[derive(Clone, Debug)]
pub struct CoordinatorConf {
    /// The ID of the client to announce to peers in the handshake.
    pub client_id: PeerId,

    /// How long to wait for a TCP connection to a peer to complete before
    /// giving up on it.
    pub connect_timeout: Duration,

    /// How long to wait, after connecting, for the peer's handshake and
    /// bitfield to arrive before giving up on it.
    ///
    /// There is deliberately no timeout covering the rest of the session:
    /// once past the bitfield exchange the coordinator relies on ordinary
    /// socket close detection and on peer churn, as described in the design.
    pub handshake_timeout: Duration,

    /// The number of outstanding block requests a session keeps queued up
    /// with a peer for the piece it is currently downloading.
    pub max_backlog: u32,

    /// The size of a block request, in bytes. Always 16 KiB on the wire;
    /// exposed here mainly so tests can use a smaller value.
    pub block_len: u32,
}

impl CoordinatorConf {
    /// Returns a configuration with reasonable defaults and the given client
    /// id.
    pub fn new(client_id: PeerId) -> Self {
        Self {
            client_id,
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
            max_backlog: MAX_BACKLOG,
            block_len: BLOCK_LEN,
        }
    }
}

impl Default for CoordinatorConf {
    /// Returns the default configuration, using [`DEFAULT_CLIENT_ID`].
    fn default() -> Self {
        Self::new(*DEFAULT_CLIENT_ID)
    }
}
