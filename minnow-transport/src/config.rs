//! Configuration for the proxy connection.

use std::time::Duration;

use crate::wire::MAX_FRAME_SIZE;

/// Configuration of a [`TransportClient`](crate::TransportClient).
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Timeout for the TCP connect.
    pub connect_timeout: Duration,

    /// Timeout for the proxy's JOIN_REPLY.
    pub join_timeout: Duration,

    /// Largest payload accepted in either direction.
    pub max_frame_size: usize,

    /// Size of the read buffer handed to the stream.
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
            read_buffer_size: 4096,
        }
    }
}

impl TransportConfig {
    /// Short timeouts for in-process or loopback proxies.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Override the frame size limit.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}
