//! The single physical connection between a node and its proxy.

use bytes::Bytes;
use minnow_core::{gen_uuid, JsonCodec, MessageCodec, MSG_PREFIX};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::handshake::{JoinReply, JoinRequest, JOIN_REPLY, SERIALIZER};
use crate::network::NetworkProvider;
use crate::uri::ProxyUri;
use crate::wire::{encode_frame, FrameDecoder};

/// Connect / send / receive / disconnect over one proxy connection.
///
/// `connect` includes the join handshake, so a connected client always knows
/// the proxy's runtime id. Any I/O or framing error drops the connection;
/// the caller decides when to reconnect.
pub struct TransportClient<N: NetworkProvider> {
    network: N,
    config: TransportConfig,
    stream: Option<N::TcpStream>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    proxy_id: Option<String>,
    uri: Option<ProxyUri>,
}

impl<N: NetworkProvider> TransportClient<N> {
    /// Create a disconnected client.
    pub fn new(network: N, config: TransportConfig) -> Self {
        let decoder = FrameDecoder::new(config.max_frame_size);
        let read_buf = vec![0u8; config.read_buffer_size];
        Self {
            network,
            config,
            stream: None,
            decoder,
            read_buf,
            proxy_id: None,
            uri: None,
        }
    }

    /// Whether a joined connection is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && self.proxy_id.is_some()
    }

    /// Runtime id of the proxy, once joined.
    pub fn proxy_id(&self) -> Option<&str> {
        self.proxy_id.as_deref()
    }

    /// URI of the current connection.
    pub fn uri(&self) -> Option<&ProxyUri> {
        self.uri.as_ref()
    }

    /// Connect to `uri` and join as `node_id`, returning the proxy's id.
    pub async fn connect(&mut self, uri: &ProxyUri, node_id: &str) -> TransportResult<String> {
        self.disconnect();

        let addr = uri.socket_addr();
        let stream = tokio::time::timeout(self.config.connect_timeout, self.network.connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        self.stream = Some(stream);
        self.uri = Some(uri.clone());
        tracing::debug!(proxy = %uri, "connected, joining");

        match self.join(node_id).await {
            Ok(proxy_id) => {
                tracing::info!(proxy = %uri, proxy_id = %proxy_id, "joined proxy");
                self.proxy_id = Some(proxy_id.clone());
                Ok(proxy_id)
            }
            Err(e) => {
                tracing::warn!(proxy = %uri, error = %e, "join failed");
                self.disconnect();
                Err(e)
            }
        }
    }

    async fn join(&mut self, node_id: &str) -> TransportResult<String> {
        let sid = gen_uuid(MSG_PREFIX);
        let request = JsonCodec
            .encode(&JoinRequest::new(node_id, &sid))
            .map_err(|e| TransportError::JoinFailed(e.to_string()))?;
        self.send(&request).await?;

        let payload = tokio::time::timeout(self.config.join_timeout, self.receive())
            .await
            .map_err(|_| TransportError::Timeout)??;
        let reply: JoinReply = JsonCodec
            .decode(&payload)
            .map_err(|e| TransportError::JoinFailed(e.to_string()))?;

        if reply.cmd != JOIN_REPLY {
            return Err(TransportError::JoinFailed(format!(
                "unexpected command '{}'",
                reply.cmd
            )));
        }
        if reply.serializer != SERIALIZER {
            return Err(TransportError::JoinFailed(format!(
                "unsupported serializer '{}'",
                reply.serializer
            )));
        }
        if reply.id.is_empty() {
            return Err(TransportError::JoinFailed("empty proxy id".to_string()));
        }
        Ok(reply.id)
    }

    /// Send one message.
    pub async fn send(&mut self, payload: &[u8]) -> TransportResult<()> {
        let frame = encode_frame(payload, self.config.max_frame_size)?;
        let stream = self.stream.as_mut().ok_or(TransportError::Disconnected)?;
        let result = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "send failed");
            self.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    /// Wait for the next complete message.
    ///
    /// Cancel-safe: bytes read before a cancellation stay buffered.
    pub async fn receive(&mut self) -> TransportResult<Bytes> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    self.disconnect();
                    return Err(e.into());
                }
            }

            let stream = self.stream.as_mut().ok_or(TransportError::Disconnected)?;
            let read = match stream.read(&mut self.read_buf).await {
                Ok(0) => {
                    self.disconnect();
                    return Err(TransportError::ConnectionClosed);
                }
                Ok(n) => n,
                Err(e) => {
                    self.disconnect();
                    return Err(e.into());
                }
            };
            self.decoder.extend(&self.read_buf[..read]);
        }
    }

    /// Drop the connection and any partially received frame.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(proxy = ?self.uri.as_ref().map(ToString::to_string), "disconnected");
        }
        self.proxy_id = None;
        self.decoder.clear();
    }
}
