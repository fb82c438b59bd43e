//! Router module - route patterns, handler registration and dispatch.
//!
//! Provides:
//! - [`RoutePattern`] - `/greet/{name}/{age}` style patterns
//! - [`Router`] - maps patterns to handlers, one interaction kind each
//! - [`RequestContext`] - destination, metadata and path variables for a handler
//!
//! # Example
//!
//! ```ignore
//! use relaywire::router::{RequestContext, Router};
//! use relaywire::connection::{Incoming, Outgoing};
//!
//! let router = Router::new()
//!     .response("/greet/{name}", |ctx: RequestContext, greeting: String| async move {
//!         Ok(format!("{greeting}, {}", ctx.path::<String>("name")?))
//!     })?
//!     .stream("/count", |_ctx: RequestContext, n: u32, mut out: Outgoing<u32>| async move {
//!         for i in 0..n {
//!             out.send(&i).await?;
//!         }
//!         Ok(())
//!     })?
//!     .channel("/upper", |_ctx, mut words: Incoming<String>, mut out: Outgoing<String>| async move {
//!         while let Some(word) = words.next().await {
//!             out.send(&word?.to_uppercase()).await?;
//!         }
//!         Ok(())
//!     })?;
//! ```

mod context;
mod pattern;
mod registry;

pub use context::RequestContext;
pub use pattern::{PathVariables, RoutePattern};
pub(crate) use pattern::Segment;
pub use registry::{BoxFuture, Handler, Invocation, Outcome, Resolved, Router};
