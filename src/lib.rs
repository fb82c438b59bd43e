//! # relaywire
//!
//! Multiplexed RPC over one duplex byte stream.
//!
//! Many independent exchanges share a single connection, each identified by
//! a stream id. Four interaction kinds are supported:
//!
//! - **request-response**: one payload each way
//! - **request-stream**: one request, a finite sequence back
//! - **request-channel**: independent sequences in both directions
//! - **fire-and-forget**: one request, nothing back
//!
//! Sequences are flow controlled with credits (`REQUEST_N`), so a slow
//! consumer bounds what the producer may send.
//!
//! ## Architecture
//!
//! - [`protocol`]: binary frame layout and incremental decoding
//! - [`stream_table`]: stream id allocation and open exchanges
//! - [`connection`]: writer task, receive loop and the call primitives
//! - [`router`]: route patterns and handler dispatch
//! - [`proxy`]: typed stubs built from call descriptors
//!
//! ## Example
//!
//! ```ignore
//! use relaywire::{CallDescriptor, Connection, RequestContext, Router, Stub};
//!
//! #[tokio::main]
//! async fn main() -> relaywire::Result<()> {
//!     let router = Router::new()
//!         .response("/greet/{name}/{age}", |ctx: RequestContext, greeting: String| async move {
//!             let name: String = ctx.path("name")?;
//!             Ok(format!("{greeting}, {name}"))
//!         })?;
//!
//!     let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//!     let _server = Connection::server(server_io, router);
//!     let client = Connection::client(client_io);
//!
//!     let greet = Stub::new(client, CallDescriptor::response("/greet/{name}/{age}")?);
//!     let reply: String = greet.response(&[&"jlong", &36], "Hello").await?;
//!     assert_eq!(reply, "Hello, jlong");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod stream_table;
pub mod writer;

mod backpressure;

pub use connection::{Connection, ConnectionBuilder, ConnectionConfig, Incoming, Metadata, Outgoing, PayloadSender, PayloadStream};
pub use error::{ErrorCode, RelayError, Result};
pub use protocol::InteractionKind;
pub use proxy::{CallDescriptor, Cardinality, ServiceProxy, Stub};
pub use router::{RequestContext, Router};
pub use stream_table::Side;
