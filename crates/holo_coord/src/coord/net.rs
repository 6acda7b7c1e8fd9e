//! TCP endpoint driver.
//!
//! Each attached stream gets a reader task that turns frames into reactor
//! events and a writer task fed by an unbounded queue, so `Connection::send`
//! never waits on the socket. Frames are length-delimited.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::error::CoordError;
use super::reactor::ReactorHandle;
use super::types::{Connection, ConnectionState, DispatchHandler, EndpointId, Event};

/// Largest frame accepted from a peer.
pub(crate) const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Back-off after a failed `accept` so a persistent error does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Write half of a TCP endpoint.
pub struct TcpConnection {
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    peer: Option<SocketAddr>,
}

impl Connection for TcpConnection {
    fn send(&self, frame: Bytes) -> Result<(), CoordError> {
        if self.cancel.is_cancelled() {
            return Err(CoordError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .map_err(|_| CoordError::ConnectionClosed)
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl ReactorHandle {
    /// Register `stream` as a new endpoint and start driving it.
    ///
    /// `ConnectionState::Established` is queued before any data event.
    pub fn attach_tcp(&self, stream: TcpStream, handler: Arc<dyn DispatchHandler>) -> EndpointId {
        let peer = stream.peer_addr().ok();
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = ?err, "set_nodelay failed");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let connection = Arc::new(TcpConnection {
            tx,
            cancel: cancel.clone(),
            peer,
        });
        let endpoint = self.register(connection, handler);
        let _ = self.deliver(Event::StateChange {
            endpoint,
            state: ConnectionState::Established,
        });
        self.runtime_handle()
            .spawn(drive_stream(self.clone(), endpoint, stream, rx, cancel));
        endpoint
    }

    pub async fn connect_tcp(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn DispatchHandler>,
    ) -> anyhow::Result<EndpointId> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        Ok(self.attach_tcp(stream, handler))
    }

    /// Bind `addr` and attach every accepted connection with `handler`.
    ///
    /// Returns the bound address (useful with port 0). The accept loop stops
    /// when the reactor's runtime shuts down.
    pub fn listen_tcp(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn DispatchHandler>,
    ) -> anyhow::Result<SocketAddr> {
        let std_listener =
            std::net::TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
        std_listener
            .set_nonblocking(true)
            .context("set listener nonblocking")?;
        let local = std_listener.local_addr().context("listener local addr")?;

        let listener = {
            let _guard = self.runtime_handle().enter();
            TcpListener::from_std(std_listener).context("register listener with runtime")?
        };

        let reactor = self.clone();
        self.runtime_handle().spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if reactor.is_shutdown() {
                            break;
                        }
                        let endpoint = reactor.attach_tcp(stream, handler.clone());
                        tracing::debug!(endpoint, %peer, "accepted connection");
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, listen = %local, "accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        });
        tracing::info!(listen = %local, "tcp listener started");
        Ok(local)
    }
}

async fn drive_stream(
    reactor: ReactorHandle,
    endpoint: EndpointId,
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    let (mut sink, mut source) = Framed::new(stream, frame_codec()).split();

    let writer_cancel = cancel.clone();
    let writer_reactor = reactor.clone();
    tokio::spawn(async move {
        loop {
            // Drain queued frames before honouring a close.
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => frame,
                _ = writer_cancel.cancelled() => None,
            };
            let Some(frame) = frame else {
                break;
            };
            if let Err(err) = sink.send(frame).await {
                tracing::debug!(endpoint, error = ?err, "tcp write failed");
                let _ = writer_reactor.deliver(Event::StateChange {
                    endpoint,
                    state: ConnectionState::Error(err.to_string()),
                });
                writer_cancel.cancel();
                break;
            }
        }
        let _ = sink.close().await;
    });

    let state = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break ConnectionState::Closed,
            next = source.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                let event = Event::Data {
                    endpoint,
                    payload: frame.freeze(),
                };
                if reactor.deliver(event).is_err() {
                    break ConnectionState::Closed;
                }
            }
            Some(Err(err)) => break ConnectionState::Error(err.to_string()),
            None => break ConnectionState::Closed,
        }
    };

    cancel.cancel();
    tracing::debug!(endpoint, state = ?state, "tcp endpoint finished");
    let _ = reactor.deliver(Event::StateChange { endpoint, state });
}
