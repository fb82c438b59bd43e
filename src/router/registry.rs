//! Route registry and dispatch.
//!
//! Maps route patterns to handlers, each registered for one interaction
//! kind. Registration happens before the router is attached to a
//! connection; afterwards it is shared read-only behind an `Arc`.
//!
//! # Example
//!
//! ```
//! use relaywire::router::{RequestContext, Router};
//!
//! let router = Router::new()
//!     .response("/greet/{name}", |ctx: RequestContext, greeting: String| async move {
//!         let name: String = ctx.path("name")?;
//!         Ok(format!("{greeting}, {name}"))
//!     })
//!     .unwrap();
//!
//! assert_eq!(router.len(), 1);
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{PathVariables, RequestContext, RoutePattern};
use crate::codec::MsgPackCodec;
use crate::connection::{Incoming, Outgoing, PayloadSender, PayloadStream};
use crate::error::{RelayError, Result};
use crate::protocol::InteractionKind;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// MsgPack `nil`, decoded in place of an empty payload.
const NIL: [u8; 1] = [0xc0];

/// What a handler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The single response of a request-response exchange.
    Value(Bytes),
    /// The handler finished; streams and channels complete, fire-and-forget ends.
    Done,
}

/// One inbound request, handed to a handler.
pub struct Invocation {
    /// Request context; path variables are bound by the router.
    pub context: RequestContext,
    /// Payload of the initiating frame.
    pub payload: Bytes,
    /// Inbound payloads of a channel.
    pub inbound: Option<PayloadStream>,
    /// Outbound side of a stream or channel.
    pub outbound: Option<PayloadSender>,
}

impl Invocation {
    /// An invocation with no inbound or outbound sequence.
    pub fn new(context: RequestContext, payload: Bytes) -> Self {
        Self {
            context,
            payload,
            inbound: None,
            outbound: None,
        }
    }

    /// Attach the inbound sequence.
    pub fn with_inbound(mut self, inbound: PayloadStream) -> Self {
        self.inbound = Some(inbound);
        self
    }

    /// Attach the outbound sender.
    pub fn with_outbound(mut self, outbound: PayloadSender) -> Self {
        self.outbound = Some(outbound);
        self
    }

    fn take_outbound(&mut self) -> Result<PayloadSender> {
        self.outbound.take().ok_or_else(|| {
            RelayError::Protocol(format!("{} handler needs an outbound sender", self.context.kind()))
        })
    }

    fn take_inbound(&mut self) -> Result<PayloadStream> {
        self.inbound.take().ok_or_else(|| {
            RelayError::Protocol(format!("{} handler needs an inbound stream", self.context.kind()))
        })
    }
}

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle an invocation.
    fn call(&self, invocation: Invocation) -> BoxFuture<'static, Result<Outcome>>;
}

impl<F> Handler for F
where
    F: Fn(Invocation) -> BoxFuture<'static, Result<Outcome>> + Send + Sync + 'static,
{
    fn call(&self, invocation: Invocation) -> BoxFuture<'static, Result<Outcome>> {
        self(invocation)
    }
}

fn decode_input<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if payload.is_empty() {
        MsgPackCodec::decode(&NIL)
    } else {
        MsgPackCodec::decode(payload)
    }
}

/// Request-response handler over MsgPack values.
struct ResponseHandler<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> Handler for ResponseHandler<F, T, R, Fut>
where
    F: Fn(RequestContext, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, invocation: Invocation) -> BoxFuture<'static, Result<Outcome>> {
        let input: T = match decode_input(&invocation.payload) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(invocation.context, input);
        Box::pin(async move {
            let value = fut.await?;
            Ok(Outcome::Value(MsgPackCodec::encode_bytes(&value)?))
        })
    }
}

/// Request-stream handler: one input, values pushed to an [`Outgoing`].
struct StreamHandler<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> Handler for StreamHandler<F, T, R, Fut>
where
    F: Fn(RequestContext, T, Outgoing<R>) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, mut invocation: Invocation) -> BoxFuture<'static, Result<Outcome>> {
        let prepared = invocation
            .take_outbound()
            .and_then(|out| Ok((decode_input::<T>(&invocation.payload)?, out)));
        let (input, out) = match prepared {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(invocation.context, input, Outgoing::new(out));
        Box::pin(async move {
            fut.await?;
            Ok(Outcome::Done)
        })
    }
}

/// Request-channel handler: typed sequences in both directions.
struct ChannelHandler<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> Handler for ChannelHandler<F, T, R, Fut>
where
    F: Fn(RequestContext, Incoming<T>, Outgoing<R>) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, mut invocation: Invocation) -> BoxFuture<'static, Result<Outcome>> {
        let streams = invocation
            .take_inbound()
            .and_then(|inbound| Ok((inbound, invocation.take_outbound()?)));
        let (inbound, out) = match streams {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(invocation.context, Incoming::new(inbound), Outgoing::new(out));
        Box::pin(async move {
            fut.await?;
            Ok(Outcome::Done)
        })
    }
}

/// Fire-and-forget handler.
struct FireAndForgetHandler<F, T, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> Handler for FireAndForgetHandler<F, T, Fut>
where
    F: Fn(RequestContext, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, invocation: Invocation) -> BoxFuture<'static, Result<Outcome>> {
        let input: T = match decode_input(&invocation.payload) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(invocation.context, input);
        Box::pin(async move {
            fut.await?;
            Ok(Outcome::Done)
        })
    }
}

/// Entry for a registered route.
struct Route {
    pattern: RoutePattern,
    kind: InteractionKind,
    handler: Box<dyn Handler>,
}

/// Result of resolving a destination.
#[derive(Debug)]
pub struct Resolved<'a> {
    /// Pattern that matched.
    pub pattern: &'a RoutePattern,
    /// Values bound by the match.
    pub variables: PathVariables,
}

/// Registry mapping route patterns to handlers.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a new empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidPattern`] for a malformed pattern, and
    /// [`RelayError::AmbiguousRoute`] if an already registered pattern with
    /// the same number of placeholders matches some destination this one
    /// matches.
    pub fn register<H: Handler>(&mut self, pattern: &str, kind: InteractionKind, handler: H) -> Result<()> {
        let pattern = RoutePattern::parse(pattern)?;
        if let Some(existing) = self.routes.iter().find(|route| {
            route.pattern.placeholder_count() == pattern.placeholder_count()
                && route.pattern.overlaps(&pattern)
        }) {
            return Err(RelayError::AmbiguousRoute(
                pattern.to_string(),
                existing.pattern.to_string(),
            ));
        }

        tracing::debug!(route = %pattern, %kind, "registered route");
        self.routes.push(Route {
            pattern,
            kind,
            handler: Box::new(handler),
        });
        Ok(())
    }

    /// Register a request-response handler.
    ///
    /// The handler receives the decoded payload and returns the value sent back.
    pub fn response<F, T, R, Fut>(mut self, pattern: &str, handler: F) -> Result<Self>
    where
        F: Fn(RequestContext, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let typed = ResponseHandler {
            handler,
            _phantom: PhantomData,
        };
        self.register(pattern, InteractionKind::RequestResponse, typed)?;
        Ok(self)
    }

    /// Register a request-stream handler.
    ///
    /// Values sent on the [`Outgoing`] form the stream; returning `Ok`
    /// completes it and returning `Err` ends it with an error.
    pub fn stream<F, T, R, Fut>(mut self, pattern: &str, handler: F) -> Result<Self>
    where
        F: Fn(RequestContext, T, Outgoing<R>) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let typed = StreamHandler {
            handler,
            _phantom: PhantomData,
        };
        self.register(pattern, InteractionKind::RequestStream, typed)?;
        Ok(self)
    }

    /// Register a request-channel handler.
    pub fn channel<F, T, R, Fut>(mut self, pattern: &str, handler: F) -> Result<Self>
    where
        F: Fn(RequestContext, Incoming<T>, Outgoing<R>) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let typed = ChannelHandler {
            handler,
            _phantom: PhantomData,
        };
        self.register(pattern, InteractionKind::RequestChannel, typed)?;
        Ok(self)
    }

    /// Register a fire-and-forget handler.
    pub fn fire_and_forget<F, T, Fut>(mut self, pattern: &str, handler: F) -> Result<Self>
    where
        F: Fn(RequestContext, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let typed = FireAndForgetHandler {
            handler,
            _phantom: PhantomData,
        };
        self.register(pattern, InteractionKind::FireAndForget, typed)?;
        Ok(self)
    }

    fn find(&self, destination: &str, kind: InteractionKind) -> Result<(&Route, PathVariables)> {
        let (route, variables) = self
            .routes
            .iter()
            .filter_map(|route| route.pattern.matches(destination).map(|vars| (route, vars)))
            .min_by_key(|(route, _)| route.pattern.placeholder_count())
            .ok_or_else(|| RelayError::NoRoute(destination.to_string()))?;

        if route.kind != kind {
            return Err(RelayError::InteractionMismatch {
                route: destination.to_string(),
                registered: route.kind,
                requested: kind,
            });
        }
        Ok((route, variables))
    }

    /// Find the most specific route for a destination.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoRoute`] if nothing matches, and
    /// [`RelayError::InteractionMismatch`] if the match was registered for
    /// another interaction kind.
    pub fn resolve(&self, destination: &str, kind: InteractionKind) -> Result<Resolved<'_>> {
        let (route, variables) = self.find(destination, kind)?;
        Ok(Resolved {
            pattern: &route.pattern,
            variables,
        })
    }

    /// Route an invocation to its handler.
    ///
    /// Resolution happens immediately; the returned future runs the handler.
    pub fn dispatch(&self, mut invocation: Invocation) -> BoxFuture<'static, Result<Outcome>> {
        let destination = invocation.context.destination();
        let (route, variables) = match self.find(destination, invocation.context.kind()) {
            Ok(found) => found,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        tracing::debug!(
            stream_id = invocation.context.stream_id(),
            destination,
            route = %route.pattern,
            "dispatching"
        );
        invocation.context.set_variables(variables);
        route.handler.call(invocation)
    }

    /// Registered `(pattern, kind)` pairs in registration order.
    pub fn routes(&self) -> impl Iterator<Item = (&str, InteractionKind)> {
        self.routes.iter().map(|route| (route.pattern.as_str(), route.kind))
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(destination: &str, kind: InteractionKind, payload: Bytes) -> Invocation {
        Invocation::new(RequestContext::new(1, kind, destination), payload)
    }

    fn greeting_router() -> Router {
        Router::new()
            .response("/greet/{name}/{age}", |ctx: RequestContext, greeting: String| async move {
                let name: String = ctx.path("name")?;
                let age: u32 = ctx.path("age")?;
                Ok(format!("{greeting} {name} {age}"))
            })
            .unwrap()
            .response("/greet/jlong/{age}", |_ctx: RequestContext, _: ()| async move {
                Ok("specific".to_string())
            })
            .unwrap()
            .fire_and_forget("/log/{level}", |_ctx: RequestContext, _line: String| async move {
                Ok(())
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_binds_variables_and_payload() {
        let router = greeting_router();
        let payload = MsgPackCodec::encode_bytes("Hello").unwrap();

        let outcome = router
            .dispatch(invocation("/greet/mario/36", InteractionKind::RequestResponse, payload))
            .await
            .unwrap();

        let Outcome::Value(bytes) = outcome else {
            panic!("expected a value");
        };
        let reply: String = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(reply, "Hello mario 36");
    }

    #[test]
    fn test_most_specific_wins() {
        let router = greeting_router();

        let resolved = router
            .resolve("/greet/jlong/36", InteractionKind::RequestResponse)
            .unwrap();
        assert_eq!(resolved.pattern.as_str(), "/greet/jlong/{age}");
        assert_eq!(resolved.variables.raw("age"), Some("36"));
        assert!(resolved.variables.raw("name").is_none());
    }

    #[tokio::test]
    async fn test_empty_payload_decodes_as_unit() {
        let router = greeting_router();
        let outcome = router
            .dispatch(invocation("/greet/jlong/1", InteractionKind::RequestResponse, Bytes::new()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Value(MsgPackCodec::encode_bytes("specific").unwrap()));
    }

    #[tokio::test]
    async fn test_no_route() {
        let router = greeting_router();
        let err = router
            .dispatch(invocation("/missing", InteractionKind::RequestResponse, Bytes::new()))
            .await
            .unwrap_err();
        assert!(err.is_no_route());
    }

    #[test]
    fn test_interaction_mismatch() {
        let router = greeting_router();
        let err = router
            .resolve("/log/info", InteractionKind::RequestResponse)
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::InteractionMismatch {
                registered: InteractionKind::FireAndForget,
                requested: InteractionKind::RequestResponse,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_binding_error_reaches_caller() {
        let router = greeting_router();
        let payload = MsgPackCodec::encode_bytes("Hello").unwrap();
        let err = router
            .dispatch(invocation("/greet/mario/old", InteractionKind::RequestResponse, payload))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Binding { ref name, .. } if name == "age"));
    }

    #[tokio::test]
    async fn test_undecodable_payload() {
        let router = greeting_router();
        let payload = MsgPackCodec::encode_bytes(&42u8).unwrap();
        let err = router
            .dispatch(invocation("/greet/mario/1", InteractionKind::RequestResponse, payload))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MsgPackDecode(_)));
    }

    #[test]
    fn test_ambiguous_registration_rejected() {
        let mut router = greeting_router();

        let err = router
            .register("/greet/{who}/{years}", InteractionKind::RequestStream, |_inv: Invocation| {
                Box::pin(async { Ok(Outcome::Done) }) as BoxFuture<'static, Result<Outcome>>
            })
            .unwrap_err();
        assert!(matches!(err, RelayError::AmbiguousRoute(_, ref existing) if existing == "/greet/{name}/{age}"));

        // Same placeholder count, different positions, overlapping on /a/b.
        let mut router = Router::new();
        let raw = |_inv: Invocation| Box::pin(async { Ok(Outcome::Done) }) as BoxFuture<'static, Result<Outcome>>;
        router.register("/a/{x}", InteractionKind::FireAndForget, raw).unwrap();
        assert!(router.register("/{y}/b", InteractionKind::FireAndForget, raw).is_err());
        assert!(router.register("/{y}/{z}", InteractionKind::FireAndForget, raw).is_ok());
        assert_eq!(router.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_handler_without_sender() {
        let router = Router::new()
            .stream("/s", |_ctx: RequestContext, _: (), _out: Outgoing<u8>| async { Ok(()) })
            .unwrap();
        let err = router
            .dispatch(invocation("/s", InteractionKind::RequestStream, Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn test_routes_listing() {
        let router = greeting_router();
        let routes: Vec<_> = router.routes().collect();
        assert_eq!(routes[2], ("/log/{level}", InteractionKind::FireAndForget));
        assert!(!router.is_empty());
    }
}
