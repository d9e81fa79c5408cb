//! Protocol limits and session configuration.

use std::fmt;
use std::sync::Arc;

/// Lowest protocol version this implementation will negotiate.
pub const SFTP_VERSION_MIN: u32 = 3;
/// Highest protocol version this implementation understands.
pub const SFTP_VERSION_MAX: u32 = 6;

/// Largest frame accepted from a peer, excluding the length field.
///
/// Large enough for a 256kB write plus its header.
pub const MAX_PACKET_LEN: usize = 256 * 1024 + 1024;

/// Number of entries returned per READDIR response.
pub const READDIR_PAGE: usize = 100;

/// Server side clamp for a single READ request.
pub const MAX_READ_LEN: u32 = 256 * 1024;

pub const DEFAULT_BLOCK_SIZE: u32 = 32 * 1024;

/// Flow control window the client assumes if the transport doesn't tell.
pub const DEFAULT_WINDOW: u32 = 2 * 1024 * 1024;

/// Lower bound for the number of pipelined reads.
pub const MIN_OUTSTANDING: usize = 2;

pub const MAX_OUTSTANDING_WRITES: usize = 64;

/// Requests a server session processes at once. Further requests wait
/// to be read until one completes.
pub const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Encoded frames queued for the output writer
pub const OUTPUT_QUEUE_DEPTH: usize = 16;

/// Decides whether a directory entry name is listed.
#[derive(Clone)]
pub struct NameFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl NameFilter {
    pub fn new(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, name: &str) -> bool {
        (self.0)(name)
    }
}

impl fmt::Debug for NameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NameFilter")
    }
}

/// Per connection server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Highest version offered to clients, clamped to [`SFTP_VERSION_MAX`].
    pub max_version: u32,
    /// Total bytes a connection may upload. `None` is unlimited.
    pub upload_quota: Option<u64>,
    pub readdir_page: usize,
    pub max_read_len: u32,
    /// Applied to every directory listing.
    pub name_filter: Option<NameFilter>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_version: SFTP_VERSION_MAX,
            upload_quota: None,
            readdir_page: READDIR_PAGE,
            max_read_len: MAX_READ_LEN,
            name_filter: None,
        }
    }
}

/// Client settings, including the transfer pipeline tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Version sent in the INIT packet.
    pub version: u32,
    /// Requested length of each pipelined READ or WRITE.
    pub block_size: u32,
    /// Transport flow control window, used to size the read window.
    pub window_size: u32,
    pub max_outstanding_writes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: SFTP_VERSION_MAX,
            block_size: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW,
            max_outstanding_writes: 16,
        }
    }
}

impl ClientConfig {
    /// Number of reads of `block` bytes kept in flight, `window / block`
    /// with a floor. `block` is the size in use after any server limit.
    pub fn read_window(&self, block: u32) -> usize {
        (self.window_size as usize / block.max(1) as usize).max(MIN_OUTSTANDING)
    }

    pub fn write_window(&self) -> usize {
        self.max_outstanding_writes.clamp(1, MAX_OUTSTANDING_WRITES)
    }
}
