//! Handles for payload sequences flowing through an exchange.
//!
//! - [`PayloadStream`] receives a sequence and grants credits back to the
//!   sender as it is consumed.
//! - [`PayloadSender`] sends a sequence, waiting for credits before each
//!   payload.
//! - [`Incoming`] / [`Outgoing`] are the MsgPack-typed versions.
//!
//! Dropping a stream before it ended cancels the exchange.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use super::Shared;
use crate::codec::MsgPackCodec;
use crate::error::{RelayError, Result};
use crate::exchange::{Exchange, ExchangeState, Role};
use crate::protocol::Frame;
use crate::stream_table::StreamKey;

/// Cancels or abandons an exchange when dropped while armed.
///
/// Only the exchange registered under `key` is touched; once it is gone the
/// guard does nothing, even if its id was handed out again.
pub(crate) struct ExchangeGuard {
    shared: Arc<Shared>,
    key: StreamKey,
    role: Role,
    armed: bool,
}

impl ExchangeGuard {
    pub(crate) fn new(shared: Arc<Shared>, key: StreamKey, role: Role) -> Self {
        Self {
            shared,
            key,
            role,
            armed: true,
        }
    }

    pub(crate) fn key(&self) -> StreamKey {
        self.key
    }

    /// The exchange reached its terminal signal; nothing to clean up.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }

    /// Release the exchange without telling the peer; the request never left.
    pub(crate) fn discard(mut self) {
        self.armed = false;
        self.shared.table.release_key(self.key);
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.key.id;
        match self.role {
            Role::Requester => {
                if let Some(mut exchange) = self.shared.table.release_key(self.key) {
                    exchange.fail(RelayError::Cancelled);
                    tracing::debug!(stream_id = id, "exchange cancelled by requester");
                    self.shared.send_control(Frame::cancel(id));
                }
            }
            Role::Responder => {
                if let Ok(true) = self.shared.table.update_key(self.key, Exchange::abandon_inbound) {
                    self.shared.send_control(Frame::cancel(id));
                }
            }
        }
    }
}

/// A finite sequence of payloads received on one exchange.
///
/// Ends with `None` after COMPLETE, or with one `Err` item on failure.
pub struct PayloadStream {
    // Dropped before `rx`, so the exchange is gone before the sink closes.
    guard: ExchangeGuard,
    rx: mpsc::Receiver<Result<Bytes>>,
    window: u32,
    consumed: u32,
    finished: bool,
}

impl PayloadStream {
    pub(crate) fn new(guard: ExchangeGuard, rx: mpsc::Receiver<Result<Bytes>>, window: u32) -> Self {
        Self {
            guard,
            rx,
            window: window.max(1),
            consumed: 0,
            finished: false,
        }
    }

    /// Stream id of the exchange.
    pub fn stream_id(&self) -> u32 {
        self.guard.key.id
    }

    /// Receive the next payload.
    ///
    /// Returns `None` once the sequence completed. After an `Err` item the
    /// stream is finished as well.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(payload)) => {
                self.consumed += 1;
                self.replenish().await;
                Some(Ok(payload))
            }
            Some(Err(e)) => {
                self.finish();
                Some(Err(e))
            }
            None => {
                self.finish();
                None
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.guard.disarm();
    }

    /// Grant credits back once half the window was consumed.
    async fn replenish(&mut self) {
        if self.consumed < (self.window / 2).max(1) {
            return;
        }
        let n = std::mem::take(&mut self.consumed);
        let key = self.guard.key;
        let id = key.id;
        let shared = &self.guard.shared;
        if shared.table.update_key(key, |exchange| exchange.grant_inbound(n)).is_err() {
            return;
        }
        if let Err(e) = shared.writer.send(&Frame::request_n(id, n)).await {
            tracing::debug!(stream_id = id, error = %e, "failed to send credits");
        }
    }

    /// Drain the rest of the sequence.
    pub async fn collect(mut self) -> Result<Vec<Bytes>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

/// Sends a payload sequence on one exchange.
///
/// Each payload waits for a credit granted by the peer. On the requester
/// side, dropping the sender completes the outbound direction.
pub struct PayloadSender {
    shared: Arc<Shared>,
    key: StreamKey,
    role: Role,
    credits: Arc<Semaphore>,
    done: bool,
}

impl PayloadSender {
    pub(crate) fn new(shared: Arc<Shared>, key: StreamKey, role: Role, credits: Arc<Semaphore>) -> Self {
        Self {
            shared,
            key,
            role,
            credits,
            done: false,
        }
    }

    /// Stream id of the exchange.
    pub fn stream_id(&self) -> u32 {
        self.key.id
    }

    /// Credits currently available without waiting.
    pub fn available_credits(&self) -> usize {
        self.credits.available_permits()
    }

    /// Send one payload, waiting for a credit first.
    ///
    /// # Errors
    ///
    /// [`RelayError::Cancelled`] once the peer stopped this direction, and
    /// [`RelayError::ConnectionClosed`] once the connection is gone.
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        if self.done {
            return Err(RelayError::Protocol("payload after completion".into()));
        }
        match self.credits.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => {
                return Err(if self.shared.is_closed() {
                    RelayError::ConnectionClosed
                } else {
                    RelayError::Cancelled
                });
            }
        }
        self.shared
            .writer
            .send(&Frame::payload(self.key.id, payload, false))
            .await
    }

    /// End the outbound direction.
    pub async fn complete(mut self) -> Result<()> {
        self.done = true;
        let id = self.key.id;
        let Ok((was_open, state)) = self.shared.table.update_key(self.key, close_outbound) else {
            return Ok(());
        };
        if !was_open {
            return Ok(());
        }
        let sent = self.shared.writer.send(&Frame::complete(id)).await;
        if state == ExchangeState::Terminated && self.role == Role::Requester {
            self.shared.table.release_key(self.key);
        }
        sent
    }
}

fn close_outbound(exchange: &mut Exchange) -> (bool, ExchangeState) {
    let was_open = exchange.finish_outbound();
    (was_open, exchange.state())
}

impl Drop for PayloadSender {
    fn drop(&mut self) {
        if self.done || self.role != Role::Requester {
            return;
        }
        if let Ok((true, state)) = self.shared.table.update_key(self.key, close_outbound) {
            self.shared.send_control(Frame::complete(self.key.id));
            if state == ExchangeState::Terminated {
                self.shared.table.release_key(self.key);
            }
        }
    }
}

/// A [`PayloadStream`] decoding each payload as `T`.
pub struct Incoming<T> {
    inner: PayloadStream,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Incoming<T> {
    /// Wrap a raw stream.
    pub fn new(inner: PayloadStream) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }

    /// Receive and decode the next value.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let payload = self.inner.next().await?;
        Some(payload.and_then(|bytes| MsgPackCodec::decode(&bytes)))
    }

    /// Drain and decode the rest of the sequence.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Unwrap the raw stream.
    pub fn into_inner(self) -> PayloadStream {
        self.inner
    }
}

/// A [`PayloadSender`] encoding each value with MsgPack.
pub struct Outgoing<T> {
    inner: PayloadSender,
    _phantom: PhantomData<fn(T)>,
}

impl<T: Serialize> Outgoing<T> {
    /// Wrap a raw sender.
    pub fn new(inner: PayloadSender) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }

    /// Encode and send one value.
    pub async fn send(&mut self, value: &T) -> Result<()> {
        let payload = MsgPackCodec::encode_bytes(value)?;
        self.inner.send(payload).await
    }

    /// End the outbound direction.
    pub async fn complete(self) -> Result<()> {
        self.inner.complete().await
    }

    /// Unwrap the raw sender.
    pub fn into_inner(self) -> PayloadSender {
        self.inner
    }
}
