//! Request context for handlers.
//!
//! Carries what a handler knows about the request besides its payload: the
//! concrete destination, the bound path variables, the initiating frame's
//! metadata and the stream it arrived on.
//!
//! # Example
//!
//! ```ignore
//! router.response("/greet/{name}/{age}", |ctx: RequestContext, greeting: String| async move {
//!     let name: String = ctx.path("name")?;
//!     let age: u32 = ctx.path("age")?;
//!     Ok(format!("{greeting}, {name} ({age})"))
//! })?;
//! ```

use std::fmt;
use std::str::FromStr;

use super::PathVariables;
use crate::connection::Metadata;
use crate::error::Result;
use crate::protocol::InteractionKind;

/// Context passed to request handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    stream_id: u32,
    kind: InteractionKind,
    destination: String,
    metadata: Metadata,
    variables: PathVariables,
}

impl RequestContext {
    /// Create a context for a request that has not been routed yet.
    pub fn new(stream_id: u32, kind: InteractionKind, destination: impl Into<String>) -> Self {
        Self {
            stream_id,
            kind,
            destination: destination.into(),
            metadata: Metadata::new(),
            variables: PathVariables::default(),
        }
    }

    /// Attach the initiating frame's metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn set_variables(&mut self, variables: PathVariables) {
        self.variables = variables;
    }

    /// Stream the request arrived on.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Interaction kind of the request.
    #[inline]
    pub fn kind(&self) -> InteractionKind {
        self.kind
    }

    /// Concrete destination, e.g. `/greet/jlong/36`.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Metadata sent with the initiating frame.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// All bound path variables.
    pub fn variables(&self) -> &PathVariables {
        &self.variables
    }

    /// A path variable coerced to `T`; fails with a binding error.
    pub fn path<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.variables.get(name)
    }
}
