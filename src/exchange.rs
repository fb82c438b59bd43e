//! Per-call state held in the stream table.
//!
//! An exchange has two directions that end independently: inbound (frames
//! from the peer, delivered to a sink) and outbound (frames we send, gated by
//! credits the peer granted). The exchange is finished once both are done.
//!
//! All methods are synchronous. They run under the stream table lock and
//! report what the connection must do next through [`Delivery`].

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::AbortHandle;

use crate::error::{RelayError, Result};
use crate::protocol::InteractionKind;

/// Upper bound on credits a peer can accumulate on one exchange.
///
/// Never above `Semaphore::MAX_PERMITS`, which is smaller than `i32::MAX`
/// on 32-bit targets.
pub(crate) const MAX_CREDITS: usize = if Semaphore::MAX_PERMITS < i32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    i32::MAX as usize
};

/// A peer-supplied credit count, clamped to what a semaphore can hold.
pub(crate) fn credits_from(n: u32) -> usize {
    (n as usize).min(MAX_CREDITS)
}

/// Which end of the exchange this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the initiating frame.
    Requester,
    /// The peer sent the initiating frame.
    Responder,
}

/// Lifecycle of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Both directions open.
    Open,
    /// One direction is done, waiting for the other to terminate.
    AwaitingTerminal,
    /// Both directions done.
    Terminated,
}

/// Where inbound payloads go.
#[derive(Debug)]
pub(crate) enum Sink {
    /// Nothing is read on this side.
    None,
    /// Exactly one value is expected.
    Single {
        tx: Option<oneshot::Sender<Result<Bytes>>>,
        value: Option<Bytes>,
    },
    /// A sequence, terminated by dropping the sender or an `Err` item.
    Many(mpsc::Sender<Result<Bytes>>),
}

/// What the connection must do after feeding a frame to an exchange.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// Nothing more to do.
    Continue,
    /// Both directions are done; release the stream id.
    Finished,
    /// The local consumer went away; send CANCEL and release if `finished`.
    StopInbound { finished: bool },
    /// The peer broke the exchange's rules; fail it.
    Violation(RelayError),
}

/// Snapshot of an exchange for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeInfo {
    /// Stream id.
    pub stream_id: u32,
    /// Interaction kind.
    pub kind: InteractionKind,
    /// Our role.
    pub role: Role,
    /// Current state.
    pub state: ExchangeState,
}

/// One logical call.
#[derive(Debug)]
pub struct Exchange {
    kind: InteractionKind,
    role: Role,
    state: ExchangeState,
    sink: Sink,
    inbound_open: bool,
    inbound_abandoned: bool,
    outbound_open: bool,
    /// Credits granted to the peer and not used yet; `None` when unmetered.
    inbound_credits: Option<u32>,
    /// Credits the peer granted us.
    outbound_credits: Option<Arc<Semaphore>>,
    task: Option<AbortHandle>,
    /// Registration number assigned by the stream table.
    generation: u64,
}

impl Exchange {
    /// A new exchange with both directions open and no sink.
    pub(crate) fn new(kind: InteractionKind, role: Role) -> Self {
        Self {
            kind,
            role,
            state: ExchangeState::Open,
            sink: Sink::None,
            inbound_open: true,
            inbound_abandoned: false,
            outbound_open: true,
            inbound_credits: None,
            outbound_credits: None,
            task: None,
            generation: 0,
        }
    }

    /// Deliver the single inbound value to `tx`.
    pub(crate) fn with_single_sink(mut self, tx: oneshot::Sender<Result<Bytes>>) -> Self {
        self.sink = Sink::Single {
            tx: Some(tx),
            value: None,
        };
        self
    }

    /// Deliver inbound payloads to `tx`, metered by `window` credits.
    ///
    /// `tx` must have room for `window + 1` items so a terminal error always fits.
    pub(crate) fn with_sequence_sink(mut self, tx: mpsc::Sender<Result<Bytes>>, window: u32) -> Self {
        self.sink = Sink::Many(tx);
        self.inbound_credits = Some(window);
        self
    }

    /// Gate outbound payloads on `credits`.
    pub(crate) fn with_outbound_credits(mut self, credits: Arc<Semaphore>) -> Self {
        self.outbound_credits = Some(credits);
        self
    }

    /// Nothing will be received on this exchange.
    pub(crate) fn inbound_closed(mut self) -> Self {
        self.inbound_open = false;
        self.refresh_state();
        self
    }

    /// Nothing more will be sent on this exchange.
    pub(crate) fn outbound_closed(mut self) -> Self {
        self.outbound_open = false;
        self.refresh_state();
        self
    }

    /// Interaction kind.
    pub fn kind(&self) -> InteractionKind {
        self.kind
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Whether the outbound direction is still open.
    pub fn is_outbound_open(&self) -> bool {
        self.outbound_open
    }

    /// Snapshot for diagnostics.
    pub fn info(&self, stream_id: u32) -> ExchangeInfo {
        ExchangeInfo {
            stream_id,
            kind: self.kind,
            role: self.role,
            state: self.state,
        }
    }

    fn refresh_state(&mut self) {
        self.state = match (self.inbound_open, self.outbound_open) {
            (true, true) => ExchangeState::Open,
            (false, false) => ExchangeState::Terminated,
            _ => ExchangeState::AwaitingTerminal,
        };
    }

    fn finished_or_continue(&mut self) -> Delivery {
        self.refresh_state();
        if self.state == ExchangeState::Terminated {
            Delivery::Finished
        } else {
            Delivery::Continue
        }
    }

    fn late_inbound(&self, what: &str) -> Delivery {
        if self.inbound_abandoned {
            Delivery::Continue
        } else {
            Delivery::Violation(RelayError::Protocol(format!(
                "{what} after the inbound direction ended"
            )))
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Attach the responder task so cancellation can abort it.
    pub(crate) fn attach_task(&mut self, task: AbortHandle) {
        self.task = Some(task);
    }

    /// A PAYLOAD frame arrived.
    pub(crate) fn on_payload(&mut self, payload: Bytes, complete: bool) -> Delivery {
        if !self.inbound_open {
            return self.late_inbound("payload");
        }
        if let Some(credits) = self.inbound_credits.as_mut() {
            if *credits == 0 {
                return Delivery::Violation(RelayError::Protocol(
                    "peer sent more payloads than it was granted".into(),
                ));
            }
            *credits -= 1;
        }

        match &mut self.sink {
            Sink::Single { tx, value } => {
                if value.is_some() {
                    return Delivery::Violation(RelayError::Protocol(
                        "second payload on a single-value exchange".into(),
                    ));
                }
                if complete {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(Ok(payload));
                    }
                } else {
                    *value = Some(payload);
                }
            }
            Sink::Many(tx) => match tx.try_send(Ok(payload)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    return Delivery::Violation(RelayError::Protocol(
                        "inbound buffer overflow".into(),
                    ));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.abandon_inbound();
                    let finished = self.state == ExchangeState::Terminated;
                    return Delivery::StopInbound { finished };
                }
            },
            Sink::None => {}
        }

        if complete {
            self.close_inbound();
        }
        self.finished_or_continue()
    }

    /// A COMPLETE frame arrived.
    pub(crate) fn on_complete(&mut self) -> Delivery {
        if !self.inbound_open {
            return self.late_inbound("complete");
        }
        if let Sink::Single { tx, value } = &mut self.sink {
            if let Some(tx) = tx.take() {
                let result = value
                    .take()
                    .ok_or_else(|| RelayError::Protocol("completed without a value".into()));
                let _ = tx.send(result);
            }
        }
        self.close_inbound();
        self.finished_or_continue()
    }

    fn close_inbound(&mut self) {
        self.inbound_open = false;
        self.sink = Sink::None;
    }

    /// A CANCEL frame arrived.
    ///
    /// From a requester it cancels the whole exchange. From a responder it
    /// only stops our outbound direction.
    pub(crate) fn on_cancel(&mut self) -> Delivery {
        match self.role {
            Role::Responder => {
                self.fail(RelayError::Cancelled);
                Delivery::Finished
            }
            Role::Requester => {
                self.stop_outbound();
                self.finished_or_continue()
            }
        }
    }

    /// A REQUEST_N frame arrived.
    pub(crate) fn on_request_n(&mut self, n: u32) -> Delivery {
        match &self.outbound_credits {
            Some(credits) if self.outbound_open => {
                let room = MAX_CREDITS.saturating_sub(credits.available_permits());
                credits.add_permits(credits_from(n).min(room));
                Delivery::Continue
            }
            Some(_) => Delivery::Continue,
            None => Delivery::Violation(RelayError::Protocol(format!(
                "credit grant on a {} exchange",
                self.kind
            ))),
        }
    }

    /// We granted the peer `n` more inbound credits.
    pub(crate) fn grant_inbound(&mut self, n: u32) {
        if let Some(credits) = self.inbound_credits.as_mut() {
            *credits = credits.saturating_add(n);
        }
    }

    /// Our outbound direction ended. Returns `true` if it was still open.
    pub(crate) fn finish_outbound(&mut self) -> bool {
        let was_open = self.outbound_open;
        self.stop_outbound();
        self.refresh_state();
        was_open
    }

    fn stop_outbound(&mut self) {
        self.outbound_open = false;
        if let Some(credits) = &self.outbound_credits {
            credits.close();
        }
    }

    /// The local consumer stopped reading. Returns `true` if the peer should
    /// be told to stop sending.
    pub(crate) fn abandon_inbound(&mut self) -> bool {
        let was_open = self.inbound_open;
        self.close_inbound();
        self.inbound_abandoned = true;
        self.refresh_state();
        was_open
    }

    /// Terminate both directions with `err`.
    pub(crate) fn fail(&mut self, err: RelayError) {
        match std::mem::replace(&mut self.sink, Sink::None) {
            Sink::Single { tx: Some(tx), .. } => {
                let _ = tx.send(Err(err));
            }
            Sink::Many(tx) => {
                let _ = tx.try_send(Err(err));
            }
            _ => {}
        }
        self.inbound_open = false;
        self.stop_outbound();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = ExchangeState::Terminated;
    }

    /// Whether the responder task has been attached.
    #[cfg(test)]
    pub(crate) fn has_task(&self) -> bool {
        self.task.is_some()
    }
}
