//! TCP transport for the correlator.
//!
//! Line-oriented ASCII over a plain TCP socket, CRLF terminated. The socket is opened with
//! Nagle disabled, each request flushes stale input before writing, and every reply read
//! is bounded by the caller's timeout.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{Transport, TransportHandle};
use crate::error::{CorrelatorError, CorrelatorResult};
use crate::protocol::{Request, TERMINATOR};

/// Default TCP port of the correlator's command server.
pub const DEFAULT_PORT: u16 = 50000;

struct Link {
    stream: BufReader<TcpStream>,
    handle_session: uuid::Uuid,
}

/// Transport speaking the line protocol over TCP.
#[derive(Default)]
pub struct TcpTransport {
    link: Option<Link>,
}

impl TcpTransport {
    /// Create a transport with no open link.
    pub fn new() -> Self {
        Self::default()
    }

    fn link_for(&mut self, handle: &TransportHandle) -> CorrelatorResult<&mut Link> {
        match self.link.as_mut() {
            Some(link) if link.handle_session == handle.session() => Ok(link),
            _ => Err(CorrelatorError::Transport(format!(
                "handle {} is no longer valid",
                handle
            ))),
        }
    }

    fn invalidate(&mut self) {
        if self.link.take().is_some() {
            tracing::debug!("TCP link invalidated");
        }
    }

    async fn exchange(
        stream: &mut BufReader<TcpStream>,
        request: &str,
        limit: Duration,
    ) -> CorrelatorResult<String> {
        Self::discard_buffered(stream);

        let line = format!("{}{}", request, TERMINATOR);
        tracing::debug!(request, "correlator write");

        let write = async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await
        };
        match timeout(limit, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(CorrelatorError::Transport(format!(
                    "failed to write '{}': {}",
                    request, e
                )))
            }
            Err(_) => {
                return Err(CorrelatorError::Timeout {
                    request: request.to_string(),
                    timeout: limit,
                })
            }
        }

        let mut response = String::new();
        match timeout(limit, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(CorrelatorError::Transport(
                "connection closed by device".into(),
            )),
            Ok(Ok(_)) => {
                let trimmed = response.trim_end_matches(['\r', '\n']).to_string();
                tracing::debug!(reply = %trimmed, "correlator read");
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(CorrelatorError::Transport(format!(
                "failed to read reply to '{}': {}",
                request, e
            ))),
            Err(_) => Err(CorrelatorError::Timeout {
                request: request.to_string(),
                timeout: limit,
            }),
        }
    }

    fn discard_buffered(stream: &mut BufReader<TcpStream>) {
        let len = stream.buffer().len();
        if len > 0 {
            tracing::debug!("Discarding {} stale bytes from buffer", len);
            stream.consume(len);
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &mut self,
        address: &str,
        limit: Duration,
    ) -> CorrelatorResult<TransportHandle> {
        self.invalidate();

        let connect_error = |reason: String| CorrelatorError::Connect {
            address: address.to_string(),
            reason,
        };

        let stream = timeout(limit, TcpStream::connect(address))
            .await
            .map_err(|_| connect_error(format!("no answer within {:?}", limit)))?
            .map_err(|e| connect_error(e.to_string()))?;

        // Disable Nagle's algorithm for low latency
        stream
            .set_nodelay(true)
            .map_err(|e| connect_error(e.to_string()))?;

        let mut stream = BufReader::new(stream);
        let identity = Self::exchange(&mut stream, &Request::Identify.encode(), limit)
            .await
            .map_err(|e| connect_error(format!("handshake failed: {}", e)))?;
        if identity.is_empty() {
            return Err(connect_error("empty identity reply".into()));
        }

        let handle = TransportHandle::new(address, identity);
        tracing::info!(%handle, identity = handle.identity(), "Connected to correlator");
        self.link = Some(Link {
            stream,
            handle_session: handle.session(),
        });
        Ok(handle)
    }

    async fn send(
        &mut self,
        handle: &TransportHandle,
        request: &str,
        limit: Duration,
    ) -> CorrelatorResult<String> {
        let link = self.link_for(handle)?;
        let result = Self::exchange(&mut link.stream, request, limit).await;
        if let Err(err) = &result {
            tracing::warn!(%handle, error = %err, "TCP exchange failed, dropping link");
            self.invalidate();
        }
        result
    }

    async fn close(&mut self, handle: TransportHandle) {
        let owned = matches!(&self.link, Some(link) if link.handle_session == handle.session());
        if !owned {
            return;
        }
        if let Some(mut link) = self.link.take() {
            let _ = link.stream.get_mut().shutdown().await;
            tracing::info!(%handle, "Closed correlator link");
        }
    }

    fn is_open(&self, handle: &TransportHandle) -> bool {
        matches!(&self.link, Some(link) if link.handle_session == handle.session())
    }
}
