//! Async client for the lock server.
//!
//! One TCP connection carries many concurrent requests: a writer task drains
//! an outbound queue and a reader task routes each `ResponseFrame` to the
//! oneshot waiting on its request id. A queued lock simply keeps its oneshot
//! pending until the server answers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use holo_coord::coord::{
    CoordError, ErrorCode, HandleId, LockGrant, LockMode, LockRequest, LockStatus, RequestFrame,
    ResponseFrame, SessionId,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::protocol::{decode_u64, Command, SessionGrant, MAX_NAME_LEN};

/// Largest reply frame the client accepts.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Error reply from the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server error {status:#x} ({code:?}): {message}")]
pub struct RemoteError {
    pub status: u32,
    pub code: Option<ErrorCode>,
    pub message: String,
}

type PendingMap = HashMap<u32, oneshot::Sender<ResponseFrame>>;

pub struct LockClient {
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: Arc<Mutex<PendingMap>>,
    next_request_id: AtomicU32,
    session: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LockClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to lock server {addr}"))?;
        stream.set_nodelay(true).context("set_nodelay")?;
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        let (mut sink, mut source) = Framed::new(stream, codec).split();

        let (outbound, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    tracing::debug!(error = ?err, "lock client write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(next) = source.next().await {
                let frame = match next {
                    Ok(frame) => frame.freeze(),
                    Err(err) => {
                        tracing::debug!(error = ?err, "lock client read failed");
                        break;
                    }
                };
                let response = match ResponseFrame::decode(frame) {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::warn!(error = %err, "undecodable reply from lock server");
                        continue;
                    }
                };
                let waiter = lock_pending(&reader_pending).remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::debug!(
                        request_id = response.request_id,
                        status = response.status,
                        "reply for abandoned request"
                    ),
                }
            }
            // Dropping the senders fails every outstanding call.
            lock_pending(&reader_pending).clear();
        });

        Ok(Self {
            outbound,
            pending,
            next_request_id: AtomicU32::new(1),
            session: AtomicU64::new(0),
            reader,
            writer,
        })
    }

    /// Session bound by `open_session`/`attach_session`, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self.session.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn start(&self, command: u8, body: Bytes) -> anyhow::Result<oneshot::Receiver<ResponseFrame>> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(request_id, tx);
        let frame = RequestFrame {
            request_id,
            command,
            body,
        };
        if self.outbound.send(frame.encode()).is_err() {
            lock_pending(&self.pending).remove(&request_id);
            return Err(CoordError::ConnectionClosed).context("send request");
        }
        Ok(rx)
    }

    async fn finish(rx: oneshot::Receiver<ResponseFrame>) -> anyhow::Result<ResponseFrame> {
        rx.await
            .map_err(|_| CoordError::ConnectionClosed)
            .context("await reply")
    }

    /// Send a raw command and return the reply frame, error statuses included.
    pub async fn call_raw(&self, command: u8, body: Bytes) -> anyhow::Result<ResponseFrame> {
        let rx = self.start(command, body)?;
        Self::finish(rx).await
    }

    /// Send `command`; error statuses become `RemoteError`.
    pub async fn call(&self, command: Command) -> anyhow::Result<ResponseFrame> {
        let response = self.call_raw(command.code(), command.encode_body()).await?;
        check(response)
    }

    pub async fn open_session(&self) -> anyhow::Result<SessionGrant> {
        let response = self.call(Command::OpenSession).await?;
        let grant = SessionGrant::decode(response.body).context("decode session grant")?;
        self.session.store(grant.session, Ordering::Release);
        Ok(grant)
    }

    pub async fn attach_session(&self, session: SessionId) -> anyhow::Result<()> {
        self.call(Command::AttachSession { session }).await?;
        self.session.store(session, Ordering::Release);
        Ok(())
    }

    pub async fn keep_alive(&self) -> anyhow::Result<()> {
        self.call(Command::KeepAlive).await.map(|_| ())
    }

    pub async fn open(&self, name: &str) -> anyhow::Result<HandleId> {
        anyhow::ensure!(
            name.len() <= MAX_NAME_LEN,
            "handle name is {} bytes, limit is {MAX_NAME_LEN}",
            name.len()
        );
        let response = self
            .call(Command::Open {
                name: name.to_string(),
            })
            .await?;
        Ok(decode_u64(response.body, "handle")?)
    }

    pub async fn close(&self, handle: HandleId) -> anyhow::Result<()> {
        self.call(Command::Close { handle }).await.map(|_| ())
    }

    pub async fn release(&self, handle: HandleId) -> anyhow::Result<()> {
        self.call(Command::Release { handle }).await.map(|_| ())
    }

    pub async fn close_session(&self) -> anyhow::Result<()> {
        self.call(Command::CloseSession).await?;
        self.session.store(0, Ordering::Release);
        Ok(())
    }

    pub async fn stats(&self) -> anyhow::Result<serde_json::Value> {
        let response = self.call(Command::Stats).await?;
        serde_json::from_slice(&response.body).context("decode stats json")
    }

    /// Withdraw a queued lock request. Returns whether one was pending.
    pub async fn cancel_lock(&self, handle: HandleId) -> anyhow::Result<bool> {
        let response = self.call(Command::CancelLock { handle }).await?;
        Ok(response.body.first().copied().unwrap_or(0) != 0)
    }

    /// Try once without queueing. `None` means the lock is busy.
    pub async fn try_lock(&self, handle: HandleId, mode: LockMode) -> anyhow::Result<Option<u64>> {
        let response = self.lock_request(handle, mode, true).await?;
        match LockStatus::from_code(response.status) {
            Some(LockStatus::Granted) => Ok(Some(grant_generation(response)?)),
            Some(LockStatus::Busy) => Ok(None),
            _ => Err(unexpected(&response)),
        }
    }

    /// Wait for the lock, queueing behind incompatible holders.
    pub async fn lock(&self, handle: HandleId, mode: LockMode) -> anyhow::Result<u64> {
        let response = self.lock_request(handle, mode, false).await?;
        expect_grant(response)
    }

    /// Wait at most `timeout` for the lock.
    ///
    /// On expiry the queued request is withdrawn and the call fails with
    /// `CoordError::Timeout`, which is distinct from a try-lock denial. If the
    /// grant races the cancel, the lock is released again before returning.
    pub async fn lock_with_timeout(
        &self,
        handle: HandleId,
        mode: LockMode,
        timeout: Duration,
    ) -> anyhow::Result<u64> {
        let body = lock_body(handle, mode, false);
        let mut rx = self.start(Command::LOCK, body)?;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(reply) => {
                let response = reply
                    .map_err(|_| CoordError::ConnectionClosed)
                    .context("await lock reply")?;
                expect_grant(check(response)?)
            }
            Err(_) => {
                let cancelled = self.cancel_lock(handle).await?;
                if !cancelled {
                    // Nothing was queued: the original reply is already on its
                    // way. Only a grant made by this request is ours to undo.
                    let granted = Self::finish(rx)
                        .await
                        .is_ok_and(|response| {
                            LockStatus::from_code(response.status) == Some(LockStatus::Granted)
                        });
                    if granted {
                        if let Err(err) = self.release(handle).await {
                            tracing::debug!(handle, error = ?err, "release after lock timeout failed");
                        }
                    }
                }
                tracing::debug!(handle, ?timeout, "lock wait timed out");
                Err(anyhow::Error::new(CoordError::Timeout)
                    .context(format!("lock on handle {handle} not granted within {timeout:?}")))
            }
        }
    }

    async fn lock_request(
        &self,
        handle: HandleId,
        mode: LockMode,
        try_only: bool,
    ) -> anyhow::Result<ResponseFrame> {
        let response = self
            .call_raw(Command::LOCK, lock_body(handle, mode, try_only))
            .await?;
        check(response)
    }
}

impl Drop for LockClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn lock_pending(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_body(handle: HandleId, mode: LockMode, try_lock: bool) -> Bytes {
    LockRequest {
        handle,
        mode: mode.bits(),
        try_lock,
    }
    .encode()
}

fn check(response: ResponseFrame) -> anyhow::Result<ResponseFrame> {
    if response.is_error() {
        return Err(RemoteError {
            status: response.status,
            code: response.error_code(),
            message: response.message(),
        }
        .into());
    }
    Ok(response)
}

fn grant_generation(response: ResponseFrame) -> anyhow::Result<u64> {
    Ok(LockGrant::decode(&response.body)
        .context("decode lock grant")?
        .generation)
}

fn expect_grant(response: ResponseFrame) -> anyhow::Result<u64> {
    match LockStatus::from_code(response.status) {
        Some(LockStatus::Granted) => grant_generation(response),
        Some(LockStatus::Cancelled) => Err(anyhow::anyhow!("lock request was cancelled")),
        _ => Err(unexpected(&response)),
    }
}

fn unexpected(response: &ResponseFrame) -> anyhow::Error {
    anyhow::anyhow!(
        "unexpected lock reply status {} for request {}",
        response.status,
        response.request_id
    )
}

/// Server error code carried by `err`, if it came from an error reply.
pub fn remote_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.downcast_ref::<RemoteError>().and_then(|remote| remote.code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Single-connection server that answers the first lock request late
    /// with `lock_reply`, reports nothing queued for the cancel, and returns
    /// every command code it saw afterwards.
    async fn late_lock_reply_server(
        lock_reply: fn(u32) -> ResponseFrame,
    ) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let mut seen = Vec::new();
            loop {
                let next = tokio::time::timeout(Duration::from_millis(300), framed.next()).await;
                let Ok(Some(Ok(frame))) = next else {
                    break;
                };
                let request = RequestFrame::decode(frame.freeze()).unwrap();
                seen.push(request.command);
                let reply = match request.command {
                    Command::LOCK => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        lock_reply(request.request_id)
                    }
                    Command::CANCEL_LOCK => ResponseFrame {
                        request_id: request.request_id,
                        status: crate::protocol::STATUS_OK,
                        body: Bytes::from_static(&[0]),
                    },
                    _ => ResponseFrame {
                        request_id: request.request_id,
                        status: crate::protocol::STATUS_OK,
                        body: Bytes::new(),
                    },
                };
                framed.send(reply.encode()).await.unwrap();
            }
            seen
        });
        (addr, task)
    }

    #[tokio::test]
    async fn timeout_after_late_error_keeps_the_lock_already_held() {
        let (addr, server) = late_lock_reply_server(|request_id| {
            ResponseFrame::error(request_id, ErrorCode::AlreadyLocked.code(), "already locked")
        })
        .await;
        let client = LockClient::connect(addr).await.unwrap();

        let err = client
            .lock_with_timeout(7, LockMode::Exclusive, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<CoordError>(), Some(&CoordError::Timeout));

        let seen = server.await.unwrap();
        assert_eq!(seen, vec![Command::LOCK, Command::CANCEL_LOCK]);
    }

    #[tokio::test]
    async fn timeout_after_late_grant_releases_it() {
        let (addr, server) = late_lock_reply_server(|request_id| ResponseFrame {
            request_id,
            status: LockStatus::Granted.code(),
            body: LockGrant { generation: 3 }.encode(),
        })
        .await;
        let client = LockClient::connect(addr).await.unwrap();

        let err = client
            .lock_with_timeout(7, LockMode::Exclusive, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<CoordError>(), Some(&CoordError::Timeout));

        let seen = server.await.unwrap();
        assert_eq!(
            seen,
            vec![Command::LOCK, Command::CANCEL_LOCK, Command::RELEASE]
        );
    }
}
