//! Greeting service - all four interaction kinds over TCP.
//!
//! This example demonstrates:
//! - Registering typed handlers on a `Router`
//! - Serving a TCP connection with `Connection::server`
//! - Calling it through a `ServiceProxy` built from call descriptors
//!
//! ```text
//! RUST_LOG=relaywire=debug cargo run --example greeting
//! ```

use relaywire::{CallDescriptor, Connection, Incoming, Outgoing, RequestContext, Router, ServiceProxy};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug)]
struct Greeting {
    message: String,
}

fn router() -> relaywire::Result<Router> {
    Router::new()
        .response("/greet/{name}/{age}", |ctx: RequestContext, greeting: String| async move {
            let name: String = ctx.path("name")?;
            let age: u32 = ctx.path("age")?;
            Ok(Greeting {
                message: format!("{greeting}, {name} ({age})"),
            })
        })?
        .stream(
            "/greet/stream",
            |_ctx: RequestContext, name: String, mut out: Outgoing<String>| async move {
                out.send(&name).await?;
                out.send(&name.to_uppercase()).await?;
                Ok(())
            },
        )?
        .channel(
            "/greet/channel",
            |_ctx: RequestContext, mut names: Incoming<String>, mut out: Outgoing<String>| async move {
                while let Some(name) = names.next().await {
                    out.send(&format!("Hello, {}", name?)).await?;
                }
                Ok(())
            },
        )?
        .fire_and_forget("/greet/fire", |ctx: RequestContext, name: String| async move {
            tracing::info!(stream_id = ctx.stream_id(), "fire-and-forget from {}", name);
            Ok(())
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let router = router()?;

    tokio::spawn(async move {
        match listener.accept().await {
            Ok((socket, peer)) => {
                tracing::info!(%peer, "accepted connection");
                Connection::server(socket, router).closed().await;
            }
            Err(e) => tracing::error!("accept failed: {}", e),
        }
    });

    let connection = Connection::client(TcpStream::connect(addr).await?);
    let greetings = ServiceProxy::builder(connection.clone())
        .method("greet", CallDescriptor::response("/greet/{name}/{age}")?)
        .method("stream", CallDescriptor::stream("/greet/stream")?)
        .method("channel", CallDescriptor::channel("/greet/channel")?)
        .method("fire", CallDescriptor::fire_and_forget("/greet/fire")?)
        .build();

    let greeting: Greeting = greetings.stub("greet")?.response(&[&"jlong", &36], "Hello").await?;
    println!("{}", greeting.message);

    let stream: Incoming<String> = greetings.stub("stream")?.stream(&[], "a").await?;
    println!("{:?}", stream.collect().await?);

    let replies: Incoming<String> = greetings.stub("channel")?.channel_with(&[], &["Mario", "Kimly"]).await?;
    println!("{:?}", replies.collect().await?);

    greetings.stub("fire")?.fire_and_forget(&[], "Kimly").await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    connection.close();
    Ok(())
}
