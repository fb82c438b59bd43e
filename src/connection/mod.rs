//! Connection multiplexer.
//!
//! A [`Connection`] owns one duplex byte stream. It spawns the writer task
//! and a receive loop, allocates stream ids, and exposes the four call
//! primitives. When a [`Router`] is attached it also serves requests the
//! peer initiates.
//!
//! # Example
//!
//! ```ignore
//! use relaywire::{Connection, Router};
//!
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let _server = Connection::server(server_io, router);
//! let client = Connection::client(client_io);
//!
//! let reply = client
//!     .request_response("/greet/jlong/36", Metadata::new(), payload)
//!     .await?;
//! ```
//!
//! # Tasks
//!
//! ```text
//! callers ──► WriterHandle ──► writer task ──► write half
//! read half ──► receive loop ──► stream table ──► sinks
//!                     └──► handler tasks (via Router)
//! ```

mod payloads;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

pub use payloads::{Incoming, Outgoing, PayloadSender, PayloadStream};
pub(crate) use payloads::ExchangeGuard;

use crate::codec::ErrorPayload;
use crate::error::{ErrorCode, RelayError, Result};
use crate::exchange::{credits_from, Delivery, Exchange, Role};
use crate::protocol::{Frame, FrameBuffer, FrameKind, InteractionKind, DEFAULT_MAX_FRAME_SIZE, MAX_STREAM_ID};
use crate::router::{Invocation, Outcome, RequestContext, Router};
use crate::stream_table::{Side, StreamKey, StreamTable, DEFAULT_REUSE_GRACE_PERIOD};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Metadata carried by initiating frames.
pub type Metadata = BTreeMap<String, String>;

/// Default flow-control window (payloads in flight per direction).
pub const DEFAULT_STREAM_WINDOW: u32 = 32;

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Read buffer size for the receive loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Which id space this end allocates from.
    pub side: Side,
    /// Credits granted per inbound sequence.
    pub stream_window: u32,
    /// Largest accepted frame body.
    pub max_frame_size: usize,
    /// Handlers allowed to run at once.
    pub max_concurrent_handlers: usize,
    /// Highest stream id before allocation wraps.
    pub max_stream_id: u32,
    /// How long a released id stays unavailable.
    pub reuse_grace_period: Duration,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            side: Side::Client,
            stream_window: DEFAULT_STREAM_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            max_stream_id: MAX_STREAM_ID,
            reuse_grace_period: DEFAULT_REUSE_GRACE_PERIOD,
            writer: WriterConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl ConnectionConfig {
    /// Defaults overridden by `RELAYWIRE_*` environment variables.
    ///
    /// Recognized: `RELAYWIRE_STREAM_WINDOW`, `RELAYWIRE_MAX_FRAME_SIZE`,
    /// `RELAYWIRE_MAX_CONCURRENT_HANDLERS`, `RELAYWIRE_MAX_PENDING_FRAMES`,
    /// `RELAYWIRE_BACKPRESSURE_TIMEOUT_MS` and `RELAYWIRE_REUSE_GRACE_MS`.
    /// Unparsable or zero values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<u32>("RELAYWIRE_STREAM_WINDOW").filter(|v| *v > 0) {
            config.stream_window = v;
        }
        if let Some(v) = env_parse::<usize>("RELAYWIRE_MAX_FRAME_SIZE").filter(|v| *v > 0) {
            config.max_frame_size = v;
        }
        if let Some(v) = env_parse::<usize>("RELAYWIRE_MAX_CONCURRENT_HANDLERS").filter(|v| *v > 0) {
            config.max_concurrent_handlers = v;
        }
        if let Some(v) = env_parse::<usize>("RELAYWIRE_MAX_PENDING_FRAMES").filter(|v| *v > 0) {
            config.writer.max_pending_frames = v;
        }
        if let Some(v) = env_parse::<u64>("RELAYWIRE_BACKPRESSURE_TIMEOUT_MS").filter(|v| *v > 0) {
            config.writer.backpressure_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("RELAYWIRE_REUSE_GRACE_MS") {
            config.reuse_grace_period = Duration::from_millis(v);
        }
        config
    }
}

/// Builder for configuring and starting a [`Connection`].
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    router: Option<Router>,
}

impl ConnectionBuilder {
    /// Create a builder with default settings (client side, no router).
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            router: None,
        }
    }

    /// Replace all settings.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set which id space this end allocates from.
    pub fn side(mut self, side: Side) -> Self {
        self.config.side = side;
        self
    }

    /// Serve peer-initiated requests with `router`.
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Set the flow-control window.
    ///
    /// Default: 32
    pub fn stream_window(mut self, window: u32) -> Self {
        self.config.stream_window = window.max(1);
        self
    }

    /// Set the largest accepted frame body.
    ///
    /// Default: 16 MB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// When this limit is reached, new requests are refused with a
    /// `Rejected` error; fire-and-forget requests are dropped with a warning.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the highest stream id before allocation wraps.
    pub fn max_stream_id(mut self, max: u32) -> Self {
        self.config.max_stream_id = max;
        self
    }

    /// Set how long a released stream id stays unavailable.
    ///
    /// Default: zero
    pub fn reuse_grace_period(mut self, period: Duration) -> Self {
        self.config.reuse_grace_period = period;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Start the connection over `io`.
    ///
    /// Spawns the writer task and the receive loop, so this must run inside
    /// a Tokio runtime.
    pub fn start<T>(self, io: T) -> Connection
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Connection::start(io, self.config, self.router)
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the connection handle, payload handles and tasks.
pub(crate) struct Shared {
    pub(crate) table: StreamTable,
    pub(crate) writer: WriterHandle,
    router: Option<Arc<Router>>,
    config: ConnectionConfig,
    handlers: Arc<Semaphore>,
    closed: watch::Sender<bool>,
    writer_task: AbortHandle,
    reader_task: Mutex<Option<AbortHandle>>,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Queue a control frame without waiting; failures are only logged.
    pub(crate) fn send_control(&self, frame: Frame) {
        if let Err(e) = self.writer.try_send(&frame) {
            tracing::debug!(stream_id = frame.stream_id, kind = ?frame.kind, error = %e, "dropped control frame");
        }
    }

    fn send_error(&self, stream_id: u32, payload: &ErrorPayload) {
        self.send_control(Frame::error(stream_id, payload.to_bytes()));
    }

    /// Fail every open exchange and stop both tasks. Idempotent.
    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let exchanges = self.table.drain();
        if !exchanges.is_empty() {
            tracing::debug!(open = exchanges.len(), "failing open exchanges on close");
        }
        for (_, mut exchange) in exchanges {
            exchange.fail(RelayError::ConnectionClosed);
        }
        self.writer_task.abort();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }

    fn apply(&self, stream_id: u32, delivery: Delivery) {
        match delivery {
            Delivery::Continue => {}
            Delivery::Finished => {
                self.table.release(stream_id);
            }
            Delivery::StopInbound { finished } => {
                self.send_control(Frame::cancel(stream_id));
                if finished {
                    self.table.release(stream_id);
                }
            }
            Delivery::Violation(err) => {
                tracing::warn!(stream_id, error = %err, "peer violated the exchange protocol");
                let Some(mut exchange) = self.table.release(stream_id) else {
                    return;
                };
                match exchange.role() {
                    Role::Requester => self.send_control(Frame::cancel(stream_id)),
                    Role::Responder => self.send_error(stream_id, &ErrorPayload::from_error(&err)),
                }
                exchange.fail(err);
            }
        }
    }
}

/// Handle to a running connection.
///
/// Cheap to clone; all clones share the same byte stream. The connection
/// stays up until [`close`](Self::close) is called or the peer goes away.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Start a client-side connection with default settings.
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::builder().start(io)
    }

    /// Start a server-side connection serving `router`.
    pub fn server<T>(io: T, router: Router) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::builder().side(Side::Server).router(router).start(io)
    }

    fn start<T>(io: T, config: ConnectionConfig, router: Option<Router>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, write_half) = tokio::io::split(io);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            table: StreamTable::with_limits(config.side, config.max_stream_id, config.reuse_grace_period),
            writer,
            router: router.map(Arc::new),
            handlers: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            config,
            closed,
            writer_task: writer_task.abort_handle(),
            reader_task: Mutex::new(None),
        });

        let task = tokio::spawn(run(reader, shared.clone(), writer_task));
        *shared.reader_task.lock() = Some(task.abort_handle());
        if shared.is_closed() {
            task.abort();
        }

        Connection { shared }
    }

    /// Configuration this connection runs with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            Err(RelayError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Register a requester exchange and send its initiating frame.
    async fn open_exchange(&self, exchange: Exchange, frame: impl FnOnce(u32) -> Frame) -> Result<ExchangeGuard> {
        self.ensure_open()?;
        let key = self.shared.table.allocate_and_register(exchange)?;
        let id = key.id;
        let guard = ExchangeGuard::new(self.shared.clone(), key, Role::Requester);
        // Registered after shutdown drained the table: nobody would fail it.
        if self.shared.is_closed() {
            guard.discard();
            return Err(RelayError::ConnectionClosed);
        }

        let frame = frame(id);
        tracing::trace!(stream_id = id, route = frame.route.as_deref(), kind = ?frame.kind, "opening exchange");
        if let Err(e) = self.shared.writer.send(&frame).await {
            guard.discard();
            return Err(e);
        }
        Ok(guard)
    }

    /// Send one request and await exactly one response.
    ///
    /// Dropping the returned future cancels the exchange.
    pub async fn request_response(&self, route: &str, metadata: Metadata, payload: Bytes) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        let exchange = Exchange::new(InteractionKind::RequestResponse, Role::Requester)
            .with_single_sink(tx)
            .outbound_closed();
        let mut guard = self
            .open_exchange(exchange, |id| {
                Frame::request(FrameKind::RequestResponse, id, route, payload).with_metadata(metadata)
            })
            .await?;

        let result = rx.await.unwrap_or(Err(RelayError::ConnectionClosed));
        guard.disarm();
        result
    }

    /// Send one request and receive a finite sequence of responses.
    pub async fn request_stream(&self, route: &str, metadata: Metadata, payload: Bytes) -> Result<PayloadStream> {
        let window = self.shared.config.stream_window.max(1);
        let (tx, rx) = mpsc::channel(window as usize + 1);
        let exchange = Exchange::new(InteractionKind::RequestStream, Role::Requester)
            .with_sequence_sink(tx, window)
            .outbound_closed();
        let guard = self
            .open_exchange(exchange, |id| {
                Frame::request(FrameKind::RequestStream, id, route, payload)
                    .with_metadata(metadata)
                    .with_request_n(window)
            })
            .await?;

        Ok(PayloadStream::new(guard, rx, window))
    }

    /// Open a bidirectional channel.
    ///
    /// Both directions end independently: complete the sender when input is
    /// done, and read the stream until it ends.
    pub async fn request_channel(&self, route: &str, metadata: Metadata) -> Result<(PayloadSender, PayloadStream)> {
        let window = self.shared.config.stream_window.max(1);
        let (tx, rx) = mpsc::channel(window as usize + 1);
        let credits = Arc::new(Semaphore::new(0));
        let exchange = Exchange::new(InteractionKind::RequestChannel, Role::Requester)
            .with_sequence_sink(tx, window)
            .with_outbound_credits(credits.clone());
        let guard = self
            .open_exchange(exchange, |id| {
                Frame::request(FrameKind::RequestChannel, id, route, Bytes::new())
                    .with_metadata(metadata)
                    .with_request_n(window)
            })
            .await?;

        let sender = PayloadSender::new(self.shared.clone(), guard.key(), Role::Requester, credits);
        Ok((sender, PayloadStream::new(guard, rx, window)))
    }

    /// Send a one-way request.
    ///
    /// Resolves once the frame is accepted by the writer; no exchange is kept.
    pub async fn fire_and_forget(&self, route: &str, metadata: Metadata, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        let id = self.shared.table.allocate()?;
        let frame = Frame::request(FrameKind::FireAndForget, id, route, payload).with_metadata(metadata);
        self.shared.writer.send(&frame).await
    }

    /// Close the connection, failing every open exchange with
    /// [`RelayError::ConnectionClosed`].
    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// Wait until the connection is closed, by either side.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Ids of all open exchanges.
    pub fn open_streams(&self) -> Vec<u32> {
        self.shared.table.open_ids()
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.shared.writer.is_backpressure_active()
    }

    /// Get the current pending frame count.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }
}

/// Receive loop plus writer supervision. Any exit closes the connection.
async fn run<R>(reader: R, shared: Arc<Shared>, mut writer_task: JoinHandle<Result<()>>)
where
    R: AsyncRead + Unpin,
{
    let result = tokio::select! {
        result = read_loop(reader, &shared) => result,
        result = &mut writer_task => match result {
            Ok(result) => result,
            Err(e) => Err(RelayError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
        },
    };

    match result {
        Ok(()) => tracing::debug!("Connection closed by peer"),
        Err(e) => tracing::error!("Read loop error: {}", e),
    }
    shared.shutdown();
}

/// Main read loop - reads frames and hands them to the stream table.
async fn read_loop<R>(mut reader: R, shared: &Arc<Shared>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(shared.config.max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(RelayError::Io(e)),
        };

        let frames = frame_buffer.push(&buf[..n])?;
        for frame in frames {
            handle_frame(shared, frame);
        }
    }
}

fn handle_frame(shared: &Arc<Shared>, frame: Frame) {
    if frame.kind.is_initiating() {
        accept(shared, frame);
        return;
    }

    let Frame {
        stream_id: id,
        kind,
        complete,
        request_n,
        payload,
        ..
    } = frame;
    let table = &shared.table;
    let delivery = match kind {
        FrameKind::Payload => table.update(id, |ex| ex.on_payload(payload, complete)),
        FrameKind::Complete => table.update(id, Exchange::on_complete),
        FrameKind::Cancel => table.update(id, Exchange::on_cancel),
        FrameKind::RequestN => table.update(id, |ex| ex.on_request_n(request_n)),
        FrameKind::Error => match table.release(id) {
            Some(mut exchange) => {
                exchange.fail(ErrorPayload::into_error(&payload));
                return;
            }
            None => Err(RelayError::UnknownStream(id)),
        },
        _ => return,
    };

    match delivery {
        Ok(delivery) => shared.apply(id, delivery),
        Err(e) => tracing::debug!(stream_id = id, ?kind, "dropping frame: {}", e),
    }
}

/// Serve a peer-initiated request.
fn accept(shared: &Arc<Shared>, frame: Frame) {
    let id = frame.stream_id;
    let Some(kind) = InteractionKind::from_frame_kind(frame.kind) else {
        return;
    };
    let destination = frame.route.clone().unwrap_or_default();
    let answers = kind != InteractionKind::FireAndForget;

    if id == 0 || shared.table.side().owns(id) {
        tracing::warn!(stream_id = id, route = %destination, "peer opened a stream with an id it does not own");
        if answers {
            let err = RelayError::Protocol(format!("stream id {id} belongs to the receiver"));
            shared.send_error(id, &ErrorPayload::from_error(&err));
        }
        return;
    }

    let Some(router) = shared.router.clone() else {
        tracing::debug!(stream_id = id, route = %destination, "no router attached, refusing request");
        if answers {
            shared.send_error(id, &ErrorPayload::from_error(&RelayError::NoRoute(destination)));
        }
        return;
    };

    let Ok(permit) = shared.handlers.clone().try_acquire_owned() else {
        tracing::warn!(stream_id = id, route = %destination, "Handler capacity reached, refusing request");
        if answers {
            shared.send_error(
                id,
                &ErrorPayload {
                    code: ErrorCode::Rejected,
                    message: "handler capacity reached".into(),
                },
            );
        }
        return;
    };

    let context = RequestContext::new(id, kind, destination).with_metadata(frame.metadata);
    let invocation = Invocation::new(context, frame.payload);

    if kind == InteractionKind::FireAndForget {
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = router.dispatch(invocation).await {
                tracing::warn!(stream_id = id, "fire-and-forget handler failed: {}", e);
            }
        });
        return;
    }

    let window = shared.config.stream_window.max(1);
    let mut exchange = Exchange::new(kind, Role::Responder);
    let mut credits = None;
    let mut inbound_rx = None;
    match kind {
        InteractionKind::RequestStream | InteractionKind::RequestChannel => {
            let granted = Arc::new(Semaphore::new(credits_from(frame.request_n)));
            exchange = exchange.with_outbound_credits(granted.clone());
            credits = Some(granted);
            if kind == InteractionKind::RequestChannel {
                let (tx, rx) = mpsc::channel(window as usize + 1);
                exchange = exchange.with_sequence_sink(tx, window);
                inbound_rx = Some(rx);
            } else {
                exchange = exchange.inbound_closed();
            }
        }
        _ => exchange = exchange.inbound_closed(),
    }

    let key = match shared.table.register(id, exchange) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(stream_id = id, "refusing request: {}", e);
            return;
        }
    };

    let mut invocation = invocation;
    if let Some(credits) = credits {
        invocation = invocation.with_outbound(PayloadSender::new(shared.clone(), key, Role::Responder, credits));
    }
    if let Some(rx) = inbound_rx {
        let guard = ExchangeGuard::new(shared.clone(), key, Role::Responder);
        invocation = invocation.with_inbound(PayloadStream::new(guard, rx, window));
    }

    let handler_shared = shared.clone();
    let handler = tokio::spawn(async move {
        if kind == InteractionKind::RequestChannel {
            handler_shared.writer.send(&Frame::request_n(id, window)).await?;
        }
        router.dispatch(invocation).await
    });
    // The receive loop handles CANCEL, so no cancel can slip in before this.
    let _ = shared.table.update_key(key, |ex| ex.attach_task(handler.abort_handle()));

    tokio::spawn(respond(shared.clone(), key, kind, handler, permit));
}

/// Await a handler and send the terminal frame for its exchange.
async fn respond(
    shared: Arc<Shared>,
    key: StreamKey,
    kind: InteractionKind,
    handler: JoinHandle<Result<Outcome>>,
    permit: OwnedSemaphorePermit,
) {
    let _permit = permit;
    let id = key.id;
    let result = match handler.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => return,
        Err(e) => {
            tracing::error!(stream_id = id, "Handler panicked: {}", e);
            Err(RelayError::Protocol("handler panicked".into()))
        }
    };

    let Some(exchange) = shared.table.release_key(key) else {
        return;
    };
    if !exchange.is_outbound_open() {
        return;
    }

    let frame = match (result, kind) {
        (Ok(Outcome::Value(value)), InteractionKind::RequestResponse) => Frame::payload(id, value, true),
        (Ok(Outcome::Done), InteractionKind::RequestStream | InteractionKind::RequestChannel) => Frame::complete(id),
        (Ok(outcome), _) => {
            tracing::error!(stream_id = id, %kind, ?outcome, "handler outcome does not fit the interaction");
            let err = RelayError::Protocol(format!("{kind} handler produced {outcome:?}"));
            Frame::error(id, ErrorPayload::from_error(&err).to_bytes())
        }
        (Err(e), _) => {
            tracing::debug!(stream_id = id, "handler failed: {}", e);
            Frame::error(id, ErrorPayload::from_error(&e).to_bytes())
        }
    };

    if let Err(e) = shared.writer.send(&frame).await {
        tracing::debug!(stream_id = id, "failed to send terminal frame: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_configuration() {
        let builder = Connection::builder()
            .side(Side::Server)
            .stream_window(0)
            .max_concurrent_handlers(512)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .max_stream_id(99)
            .reuse_grace_period(Duration::from_millis(250))
            .backpressure_timeout(Duration::from_secs(10));

        assert_eq!(builder.config.side, Side::Server);
        assert_eq!(builder.config.stream_window, 1);
        assert_eq!(builder.config.max_concurrent_handlers, 512);
        assert_eq!(builder.config.writer.max_pending_frames, 2048);
        assert_eq!(builder.config.writer.channel_capacity, 512);
        assert_eq!(builder.config.max_stream_id, 99);
        assert_eq!(builder.config.reuse_grace_period, Duration::from_millis(250));
        assert_eq!(builder.config.writer.backpressure_timeout, Duration::from_secs(10));
        assert!(builder.router.is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.side, Side::Client);
        assert_eq!(config.stream_window, DEFAULT_STREAM_WINDOW);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.max_stream_id, MAX_STREAM_ID);
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("RELAYWIRE_STREAM_WINDOW", "8");
        std::env::set_var("RELAYWIRE_MAX_FRAME_SIZE", "not a number");
        std::env::set_var("RELAYWIRE_BACKPRESSURE_TIMEOUT_MS", "1500");

        let config = ConnectionConfig::from_env();

        std::env::remove_var("RELAYWIRE_STREAM_WINDOW");
        std::env::remove_var("RELAYWIRE_MAX_FRAME_SIZE");
        std::env::remove_var("RELAYWIRE_BACKPRESSURE_TIMEOUT_MS");

        assert_eq!(config.stream_window, 8);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.writer.backpressure_timeout, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_calls_fail_after_close() {
        let (io, _peer) = tokio::io::duplex(1024);
        let conn = Connection::client(io);

        conn.close();
        conn.closed().await;

        assert!(conn.is_closed());
        let err = conn
            .request_response("/x", Metadata::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));
        assert!(matches!(
            conn.fire_and_forget("/x", Metadata::new(), Bytes::new()).await,
            Err(RelayError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_eof_fails_pending_call() {
        let (io, peer) = tokio::io::duplex(1024);
        let conn = Connection::client(io);

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request_response("/x", Metadata::new(), Bytes::new()).await })
        };
        tokio::task::yield_now().await;
        drop(peer);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));
        conn.closed().await;
        assert!(conn.open_streams().is_empty());
    }

    #[tokio::test]
    async fn test_request_without_router_is_refused() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Connection::client(a);
        let _server = Connection::builder().side(Side::Server).start(b);

        let err = client
            .request_response("/greet", Metadata::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_no_route());
    }
}
