//! Typed call stubs built from call descriptors.
//!
//! A [`CallDescriptor`] names a route template and the shape of a call. The
//! interaction kind follows from the input/output cardinality:
//!
//! | input        | output | interaction      |
//! |--------------|--------|------------------|
//! | none, single | single | request-response |
//! | none, single | many   | request-stream   |
//! | many         | many   | request-channel  |
//! | any          | none   | fire-and-forget  |
//!
//! A [`Stub`] binds a descriptor to a [`Connection`]. Its calls expand the
//! template, encode the input and return a future at once; nothing is
//! awaited until the caller polls it.
//!
//! # Example
//!
//! ```ignore
//! use relaywire::proxy::{CallDescriptor, ServiceProxy};
//!
//! let greetings = ServiceProxy::builder(connection)
//!     .method("greet", CallDescriptor::response("/greet/{name}/{age}")?)
//!     .method("greet_stream", CallDescriptor::stream("/greet/stream")?)
//!     .build();
//!
//! let reply: String = greetings.stub("greet")?.response(&[&"jlong", &36], &"Hello").await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::connection::{Connection, Incoming, Metadata, Outgoing};
use crate::error::{RelayError, Result};
use crate::protocol::InteractionKind;
use crate::router::{BoxFuture, RoutePattern, Segment};

/// How many values flow in one direction of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// No value.
    None,
    /// Exactly one value.
    Single,
    /// Zero or more values.
    Many,
}

/// Pick the interaction kind for an input/output shape.
///
/// # Errors
///
/// [`RelayError::InvalidDescriptor`] for many inputs with a single output,
/// which no interaction kind carries.
pub fn interaction_for(input: Cardinality, output: Cardinality) -> Result<InteractionKind> {
    match (input, output) {
        (_, Cardinality::None) => Ok(InteractionKind::FireAndForget),
        (Cardinality::None | Cardinality::Single, Cardinality::Single) => Ok(InteractionKind::RequestResponse),
        (Cardinality::None | Cardinality::Single, Cardinality::Many) => Ok(InteractionKind::RequestStream),
        (Cardinality::Many, Cardinality::Many) => Ok(InteractionKind::RequestChannel),
        (Cardinality::Many, Cardinality::Single) => Err(RelayError::InvalidDescriptor(
            "many inputs with a single output has no interaction kind".into(),
        )),
    }
}

/// A destination template; placeholders are filled positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTemplate {
    pattern: RoutePattern,
}

impl RouteTemplate {
    /// Parse a template such as `/greet/{name}/{age}`.
    ///
    /// Fails with `InvalidPattern` on malformed placeholders.
    pub fn parse(template: &str) -> Result<Self> {
        Ok(Self {
            pattern: RoutePattern::parse(template)?,
        })
    }

    /// The template text as written.
    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Number of arguments [`expand`](Self::expand) expects.
    pub fn arity(&self) -> usize {
        self.pattern.placeholder_count()
    }

    /// Substitute `args` into the placeholders, in order.
    ///
    /// # Errors
    ///
    /// [`RelayError::Binding`] on an arity mismatch, or for a value that is
    /// empty or contains `/` (it would change the segment count).
    pub fn expand(&self, args: &[&dyn fmt::Display]) -> Result<String> {
        if args.len() != self.arity() {
            return Err(RelayError::Binding {
                name: self.as_str().to_string(),
                reason: format!("expected {} arguments, got {}", self.arity(), args.len()),
            });
        }

        let mut args = args.iter();
        let mut parts = Vec::with_capacity(self.pattern.segments().len());
        for segment in self.pattern.segments() {
            match segment {
                Segment::Literal(literal) => parts.push(literal.clone()),
                Segment::Placeholder(name) => {
                    let value = args.next().map(|arg| arg.to_string()).unwrap_or_default();
                    if value.is_empty() || value.contains('/') {
                        return Err(RelayError::Binding {
                            name: name.clone(),
                            reason: format!("{value:?} is not a single path segment"),
                        });
                    }
                    parts.push(value);
                }
            }
        }
        Ok(parts.join("/"))
    }
}

impl fmt::Display for RouteTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one remote call.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    template: RouteTemplate,
    input: Cardinality,
    output: Cardinality,
    kind: InteractionKind,
    metadata: Metadata,
}

impl CallDescriptor {
    /// Describe a call by its shape.
    pub fn new(template: &str, input: Cardinality, output: Cardinality) -> Result<Self> {
        Ok(Self {
            template: RouteTemplate::parse(template)?,
            input,
            output,
            kind: interaction_for(input, output)?,
            metadata: Metadata::new(),
        })
    }

    /// Single value in, single value out.
    pub fn response(template: &str) -> Result<Self> {
        Self::new(template, Cardinality::Single, Cardinality::Single)
    }

    /// Single value in, sequence out.
    pub fn stream(template: &str) -> Result<Self> {
        Self::new(template, Cardinality::Single, Cardinality::Many)
    }

    /// Sequences both ways.
    pub fn channel(template: &str) -> Result<Self> {
        Self::new(template, Cardinality::Many, Cardinality::Many)
    }

    /// Single value in, nothing back.
    pub fn fire_and_forget(template: &str) -> Result<Self> {
        Self::new(template, Cardinality::Single, Cardinality::None)
    }

    /// Metadata sent with every call.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Route template expanded on every call.
    pub fn template(&self) -> &RouteTemplate {
        &self.template
    }

    /// How many values the caller sends.
    pub fn input(&self) -> Cardinality {
        self.input
    }

    /// How many values the caller receives.
    pub fn output(&self) -> Cardinality {
        self.output
    }

    /// Interaction kind selected from the two cardinalities.
    pub fn kind(&self) -> InteractionKind {
        self.kind
    }
}

/// A callable remote method bound to a connection.
#[derive(Clone)]
pub struct Stub {
    connection: Connection,
    descriptor: Arc<CallDescriptor>,
}

/// Route and payload ready to go on the wire.
struct Prepared {
    route: String,
    metadata: Metadata,
    payload: Bytes,
}

fn failed<T: Send + 'static>(err: RelayError) -> BoxFuture<'static, Result<T>> {
    Box::pin(async move { Err(err) })
}

impl Stub {
    /// Bind a descriptor to a connection.
    pub fn new(connection: Connection, descriptor: CallDescriptor) -> Self {
        Self {
            connection,
            descriptor: Arc::new(descriptor),
        }
    }

    /// The descriptor this stub calls through.
    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    fn prepare<T: Serialize + ?Sized>(
        &self,
        requested: InteractionKind,
        args: &[&dyn fmt::Display],
        input: Option<&T>,
    ) -> Result<Prepared> {
        let descriptor = &self.descriptor;
        if descriptor.kind != requested {
            return Err(RelayError::InteractionMismatch {
                route: descriptor.template.to_string(),
                registered: descriptor.kind,
                requested,
            });
        }
        let payload = match input {
            Some(value) if descriptor.input != Cardinality::None => MsgPackCodec::encode_bytes(value)?,
            _ => Bytes::new(),
        };
        Ok(Prepared {
            route: descriptor.template.expand(args)?,
            metadata: descriptor.metadata.clone(),
            payload,
        })
    }

    /// Call a request-response method.
    pub fn response<T, R>(&self, args: &[&dyn fmt::Display], input: &T) -> BoxFuture<'static, Result<R>>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let call = match self.prepare(InteractionKind::RequestResponse, args, Some(input)) {
            Ok(call) => call,
            Err(e) => return failed(e),
        };
        let connection = self.connection.clone();
        Box::pin(async move {
            let reply = connection
                .request_response(&call.route, call.metadata, call.payload)
                .await?;
            MsgPackCodec::decode(&reply)
        })
    }

    /// Call a request-stream method.
    pub fn stream<T, R>(&self, args: &[&dyn fmt::Display], input: &T) -> BoxFuture<'static, Result<Incoming<R>>>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let call = match self.prepare(InteractionKind::RequestStream, args, Some(input)) {
            Ok(call) => call,
            Err(e) => return failed(e),
        };
        let connection = self.connection.clone();
        Box::pin(async move {
            let stream = connection
                .request_stream(&call.route, call.metadata, call.payload)
                .await?;
            Ok(Incoming::new(stream))
        })
    }

    /// Open a request-channel method; feed the [`Outgoing`] and read the
    /// [`Incoming`].
    pub fn channel<T, R>(&self, args: &[&dyn fmt::Display]) -> BoxFuture<'static, Result<(Outgoing<T>, Incoming<R>)>>
    where
        T: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let call = match self.prepare::<()>(InteractionKind::RequestChannel, args, None) {
            Ok(call) => call,
            Err(e) => return failed(e),
        };
        let connection = self.connection.clone();
        Box::pin(async move {
            let (sender, stream) = connection.request_channel(&call.route, call.metadata).await?;
            Ok((Outgoing::new(sender), Incoming::new(stream)))
        })
    }

    /// Call a request-channel method with a known input sequence.
    ///
    /// The inputs are sent from a background task as credits arrive, so a
    /// long input never blocks reading the output.
    pub fn channel_with<T, R>(&self, args: &[&dyn fmt::Display], inputs: &[T]) -> BoxFuture<'static, Result<Incoming<R>>>
    where
        T: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let call = match self.prepare::<()>(InteractionKind::RequestChannel, args, None) {
            Ok(call) => call,
            Err(e) => return failed(e),
        };
        let encoded = match inputs.iter().map(|input| MsgPackCodec::encode_bytes(input)).collect::<Result<Vec<_>>>() {
            Ok(encoded) => encoded,
            Err(e) => return failed(e),
        };
        let connection = self.connection.clone();
        Box::pin(async move {
            let (mut sender, stream) = connection.request_channel(&call.route, call.metadata).await?;
            let stream_id = sender.stream_id();
            tokio::spawn(async move {
                for payload in encoded {
                    if let Err(e) = sender.send(payload).await {
                        tracing::debug!(stream_id, "channel input stopped: {}", e);
                        return;
                    }
                }
                if let Err(e) = sender.complete().await {
                    tracing::debug!(stream_id, "failed to complete channel input: {}", e);
                }
            });
            Ok(Incoming::new(stream))
        })
    }

    /// Call a fire-and-forget method.
    ///
    /// Resolves once the request is queued for writing.
    pub fn fire_and_forget<T>(&self, args: &[&dyn fmt::Display], input: &T) -> BoxFuture<'static, Result<()>>
    where
        T: Serialize + ?Sized,
    {
        let call = match self.prepare(InteractionKind::FireAndForget, args, Some(input)) {
            Ok(call) => call,
            Err(e) => return failed(e),
        };
        let connection = self.connection.clone();
        Box::pin(async move {
            connection
                .fire_and_forget(&call.route, call.metadata, call.payload)
                .await
        })
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub").field("descriptor", &self.descriptor).finish()
    }
}

/// Named stubs sharing one connection.
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    stubs: HashMap<String, Stub>,
}

impl ServiceProxy {
    /// Start a proxy whose stubs all share `connection`.
    pub fn builder(connection: Connection) -> ServiceProxyBuilder {
        ServiceProxyBuilder {
            connection,
            stubs: HashMap::new(),
        }
    }

    /// Look up a method.
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownMethod`] if no method has that name.
    pub fn stub(&self, method: &str) -> Result<&Stub> {
        self.stubs
            .get(method)
            .ok_or_else(|| RelayError::UnknownMethod(method.to_string()))
    }

    /// Method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stubs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Builder for [`ServiceProxy`].
pub struct ServiceProxyBuilder {
    connection: Connection,
    stubs: HashMap<String, Stub>,
}

impl ServiceProxyBuilder {
    /// Add a method; a later method with the same name replaces it.
    pub fn method(mut self, name: impl Into<String>, descriptor: CallDescriptor) -> Self {
        let stub = Stub::new(self.connection.clone(), descriptor);
        self.stubs.insert(name.into(), stub);
        self
    }

    /// Finish the proxy.
    pub fn build(self) -> ServiceProxy {
        ServiceProxy { stubs: self.stubs }
    }
}
