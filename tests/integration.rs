//! End-to-end tests for relaywire.
//!
//! A client and a server connection talk over an in-memory duplex stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};

use relaywire::codec::MsgPackCodec;
use relaywire::protocol::{Frame, FrameBuffer, FrameKind, Header};
use relaywire::{
    CallDescriptor, Cardinality, Connection, ErrorCode, Incoming, Metadata, Outgoing, RelayError, RequestContext,
    Router, ServiceProxy, Side, Stub,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Greeting {
    message: String,
}

fn greeting_router(fired: mpsc::UnboundedSender<String>) -> Router {
    Router::new()
        .response("/greet/{name}/{age}", |ctx: RequestContext, greeting: String| async move {
            let name: String = ctx.path("name")?;
            let age: u32 = ctx.path("age")?;
            assert_eq!(ctx.destination(), format!("/greet/{name}/{age}"));
            Ok(greeting)
        })
        .unwrap()
        .response("/greet/mono", |_ctx: RequestContext, greeting: Greeting| async move { Ok(greeting) })
        .unwrap()
        .response("/greet/none", |_ctx: RequestContext, _: ()| async move {
            Ok(Greeting {
                message: "Hello, world!".into(),
            })
        })
        .unwrap()
        .stream(
            "/greet/stream",
            |_ctx: RequestContext, name: String, mut out: Outgoing<String>| async move {
                out.send(&name).await?;
                out.send(&name.to_uppercase()).await?;
                Ok(())
            },
        )
        .unwrap()
        .channel(
            "/greet/channel",
            |_ctx: RequestContext, mut names: Incoming<String>, mut out: Outgoing<String>| async move {
                while let Some(name) = names.next().await {
                    out.send(&name?.to_uppercase()).await?;
                }
                Ok(())
            },
        )
        .unwrap()
        .fire_and_forget("/greet/fire", move |_ctx: RequestContext, name: String| {
            let fired = fired.clone();
            async move {
                let _ = fired.send(name);
                Ok(())
            }
        })
        .unwrap()
        .response("/fail", |_ctx: RequestContext, _: ()| async move {
            Err::<String, _>(RelayError::application("boom"))
        })
        .unwrap()
}

fn connect(router: Router) -> (Connection, Connection) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = Connection::server(server_io, router);
    let client = Connection::client(client_io);
    (client, server)
}

fn encode<T: Serialize>(value: &T) -> Bytes {
    MsgPackCodec::encode_bytes(value).unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Path variables are bound and the payload echoed back.
#[tokio::test]
async fn test_destination_variables_and_payload() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let greet = Stub::new(client.clone(), CallDescriptor::response("/greet/{name}/{age}").unwrap());
    let reply: String = greet.response(&[&"jlong", &36], "Hello").await.unwrap();

    assert_eq!(reply, "Hello");
    assert!(client.open_streams().is_empty());
}

#[tokio::test]
async fn test_request_response_typed() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let greeting = Greeting {
        message: "Hello, Mario".into(),
    };
    let reply = client
        .request_response("/greet/mono", Metadata::new(), encode(&greeting))
        .await
        .unwrap();

    let reply: Greeting = MsgPackCodec::decode(&reply).unwrap();
    assert_eq!(reply, greeting);
}

#[tokio::test]
async fn test_request_response_without_input() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let descriptor = CallDescriptor::new("/greet/none", Cardinality::None, Cardinality::Single).unwrap();
    let reply: Greeting = Stub::new(client, descriptor).response(&[], &()).await.unwrap();

    assert_eq!(reply.message, "Hello, world!");
}

#[tokio::test]
async fn test_request_stream() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let stub = Stub::new(client.clone(), CallDescriptor::stream("/greet/stream").unwrap());
    let stream: Incoming<String> = stub.stream(&[], "a").await.unwrap();
    let items = stream.collect().await.unwrap();

    assert_eq!(items, vec!["a".to_string(), "A".to_string()]);
    eventually(|| client.open_streams().is_empty()).await;
}

#[tokio::test]
async fn test_request_channel() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let stub = Stub::new(client, CallDescriptor::channel("/greet/channel").unwrap());
    let replies: Incoming<String> = stub.channel_with(&[], &["a", "b"]).await.unwrap();

    assert_eq!(replies.collect().await.unwrap(), vec!["A".to_string(), "B".to_string()]);
}

/// Both channel directions are driven by hand, interleaved.
#[tokio::test]
async fn test_channel_interleaved() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, server) = connect(greeting_router(tx));

    let stub = Stub::new(client.clone(), CallDescriptor::channel("/greet/channel").unwrap());
    let (mut names, mut replies) = stub.channel::<String, String>(&[]).await.unwrap();

    for name in ["x", "y", "z"] {
        names.send(&name.to_string()).await.unwrap();
        let reply = replies.next().await.unwrap().unwrap();
        assert_eq!(reply, name.to_uppercase());
    }
    names.complete().await.unwrap();

    assert!(replies.next().await.is_none());
    eventually(|| client.open_streams().is_empty() && server.open_streams().is_empty()).await;
}

#[tokio::test]
async fn test_fire_and_forget() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let proxy = ServiceProxy::builder(client.clone())
        .method("fire", CallDescriptor::fire_and_forget("/greet/fire").unwrap())
        .build();
    proxy.stub("fire").unwrap().fire_and_forget(&[], "Kimly").await.unwrap();

    let observed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(observed.as_deref(), Some("Kimly"));
    assert!(client.open_streams().is_empty());
}

#[tokio::test]
async fn test_unknown_route() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let err = client
        .request_response("/nowhere", Metadata::new(), Bytes::new())
        .await
        .unwrap_err();

    assert!(err.is_no_route(), "unexpected error: {err:?}");
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_interaction_mismatch() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let err = client
        .request_response("/greet/stream", Metadata::new(), encode(&"a"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InteractionMismatch);
}

#[tokio::test]
async fn test_binding_error() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let err = client
        .request_response("/greet/jlong/old", Metadata::new(), encode(&"Hello"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RelayError::Remote {
            code: ErrorCode::Binding,
            ..
        }
    ));
}

#[tokio::test]
async fn test_handler_error_reaches_caller() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (client, _server) = connect(greeting_router(tx));

    let err = client
        .request_response("/fail", Metadata::new(), Bytes::new())
        .await
        .unwrap_err();

    match err {
        RelayError::Remote { code, message } => {
            assert_eq!(code, ErrorCode::Application);
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_requests_are_multiplexed() {
    let router = Router::new()
        .response("/double/{n}", |ctx: RequestContext, _: ()| async move {
            let n: u64 = ctx.path("n")?;
            tokio::time::sleep(Duration::from_millis(50 - n % 50)).await;
            Ok(n * 2)
        })
        .unwrap();
    let (client, _server) = connect(router);
    let stub = Stub::new(
        client.clone(),
        CallDescriptor::new("/double/{n}", Cardinality::None, Cardinality::Single).unwrap(),
    );

    let calls: Vec<_> = (0..64u64)
        .map(|n| tokio::spawn(stub.response::<_, u64>(&[&n], &())))
        .collect();

    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), n as u64 * 2);
    }
    assert!(client.open_streams().is_empty());
}

struct DropSignal(mpsc::UnboundedSender<()>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Dropping a stream releases its id and stops the responder.
#[tokio::test]
async fn test_cancel_stream_stops_responder() {
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let router = Router::new()
        .stream("/ticks", move |_ctx: RequestContext, _: (), mut out: Outgoing<u64>| {
            let signal = DropSignal(stopped_tx.clone());
            async move {
                let _signal = signal;
                for i in 0.. {
                    out.send(&i).await?;
                }
                Ok(())
            }
        })
        .unwrap();
    let (client, server) = connect(router);

    let mut ticks = client
        .request_stream("/ticks", Metadata::new(), Bytes::new())
        .await
        .unwrap();
    for expected in 0..3u64 {
        let tick: u64 = MsgPackCodec::decode(&ticks.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(tick, expected);
    }
    drop(ticks);

    assert!(client.open_streams().is_empty());
    tokio::time::timeout(Duration::from_secs(2), stopped_rx.recv())
        .await
        .expect("responder was not stopped");
    eventually(|| server.open_streams().is_empty()).await;
}

/// A timeout around a call performs the same cleanup as cancellation.
#[tokio::test]
async fn test_timeout_cancels_request() {
    let router = Router::new()
        .response("/slow", |_ctx: RequestContext, _: ()| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .unwrap();
    let (client, server) = connect(router);

    let call = client.request_response("/slow", Metadata::new(), Bytes::new());
    assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());

    assert!(client.open_streams().is_empty());
    eventually(|| server.open_streams().is_empty()).await;
}

/// The producer never runs more than one window ahead of the consumer.
#[tokio::test]
async fn test_slow_consumer_is_bounded() {
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = produced.clone();
    let router = Router::new()
        .stream("/numbers", move |_ctx: RequestContext, count: u32, mut out: Outgoing<u32>| {
            let counter = counter.clone();
            async move {
                for i in 0..count {
                    out.send(&i).await?;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        })
        .unwrap();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let _server = Connection::server(server_io, router);
    let client = Connection::builder().stream_window(4).start(client_io);

    let mut numbers = client
        .request_stream("/numbers", Metadata::new(), encode(&100u32))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(produced.load(Ordering::SeqCst), 4);

    let mut received = Vec::new();
    while let Some(item) = numbers.next().await {
        received.push(MsgPackCodec::decode::<u32>(&item.unwrap()).unwrap());
    }
    assert_eq!(received, (0..100).collect::<Vec<_>>());
    assert_eq!(produced.load(Ordering::SeqCst), 100);
}

/// The responder ends a channel while the requester is still sending.
#[tokio::test]
async fn test_channel_responder_finishes_first() {
    let router = Router::new()
        .channel(
            "/first",
            |_ctx: RequestContext, mut input: Incoming<String>, mut out: Outgoing<String>| async move {
                if let Some(first) = input.next().await {
                    out.send(&first?).await?;
                }
                Ok(())
            },
        )
        .unwrap();
    let (client, _server) = connect(router);

    let (mut input, mut output) = client.request_channel("/first", Metadata::new()).await.unwrap();
    input.send(encode(&"only")).await.unwrap();

    let first: String = MsgPackCodec::decode(&output.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(first, "only");
    assert!(output.next().await.is_none());

    let err = input.send(encode(&"ignored")).await.unwrap_err();
    assert!(matches!(err, RelayError::Cancelled));
    eventually(|| client.open_streams().is_empty()).await;
}

/// Either end may initiate; the client side can serve requests too.
#[tokio::test]
async fn test_server_initiated_request() {
    let client_router = Router::new()
        .response("/whoami", |ctx: RequestContext, _: ()| async move { Ok(ctx.stream_id()) })
        .unwrap();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = Connection::builder().side(Side::Server).start(server_io);
    let _client = Connection::builder().router(client_router).start(client_io);

    let reply = server
        .request_response("/whoami", Metadata::new(), Bytes::new())
        .await
        .unwrap();
    let stream_id: u32 = MsgPackCodec::decode(&reply).unwrap();

    assert_eq!(stream_id % 2, 0);
}

#[tokio::test]
async fn test_close_fails_open_streams() {
    let router = Router::new()
        .stream("/never", |_ctx: RequestContext, _: (), _out: Outgoing<u32>| async move {
            std::future::pending::<()>().await;
            Ok(())
        })
        .unwrap();
    let (client, server) = connect(router);

    let mut stream = client
        .request_stream("/never", Metadata::new(), Bytes::new())
        .await
        .unwrap();
    client.close();

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, RelayError::ConnectionClosed));
    assert!(stream.next().await.is_none());

    tokio::time::timeout(Duration::from_secs(2), server.closed())
        .await
        .expect("peer did not notice the close");
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (mut raw, server_io) = tokio::io::duplex(64 * 1024);
    let server = Connection::builder()
        .side(Side::Server)
        .max_frame_size(1024)
        .router(Router::new())
        .start(server_io);

    let header = Header::new(1 << 20, 1, FrameKind::RequestResponse, 0);
    raw.write_all(&header.encode()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), server.closed())
        .await
        .expect("oversized frame did not close the connection");
    assert!(server.is_closed());
}

/// A finished stream that was never read to its end must not touch a later
/// call that reuses its stream id.
#[tokio::test]
async fn test_stale_stream_handle_ignores_reused_id() {
    let router = Router::new()
        .stream("/one", |_ctx: RequestContext, _: (), mut out: Outgoing<u32>| async move {
            out.send(&1).await?;
            Ok(())
        })
        .unwrap()
        .response("/echo", |_ctx: RequestContext, word: String| async move { Ok(word) })
        .unwrap()
        .response("/slow", |_ctx: RequestContext, _: ()| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok("late".to_string())
        })
        .unwrap();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let _server = Connection::server(server_io, router);
    let client = Connection::builder().max_stream_id(3).start(client_io);

    let mut first = client.request_stream("/one", Metadata::new(), Bytes::new()).await.unwrap();
    assert_eq!(first.stream_id(), 1);
    assert!(first.next().await.unwrap().is_ok());
    eventually(|| client.open_streams().is_empty()).await;

    let echoed = client
        .request_response("/echo", Metadata::new(), encode(&"three"))
        .await
        .unwrap();
    assert_eq!(MsgPackCodec::decode::<String>(&echoed).unwrap(), "three");

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.request_response("/slow", Metadata::new(), Bytes::new()).await })
    };
    eventually(|| client.open_streams() == vec![1]).await;
    drop(first);

    let reply = slow.await.unwrap().unwrap();
    assert_eq!(MsgPackCodec::decode::<String>(&reply).unwrap(), "late");
}

/// Frames for ids nobody has open are dropped; the connection keeps working.
#[tokio::test]
async fn test_unknown_stream_frame_is_dropped() {
    let (client_io, mut peer) = tokio::io::duplex(64 * 1024);
    let client = Connection::client(client_io);

    let stray = Frame::payload(99, encode(&"stray"), false).encode().unwrap();
    peer.write_all(&stray).await.unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request_response("/echo", Metadata::new(), encode(&"hi")).await })
    };

    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 4096];
    let request = loop {
        let n = peer.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed the connection");
        if let Some(frame) = frames.push(&buf[..n]).unwrap().into_iter().next() {
            break frame;
        }
    };
    assert_eq!(request.kind, FrameKind::RequestResponse);
    assert_eq!(request.route.as_deref(), Some("/echo"));

    let reply = Frame::payload(request.stream_id, request.payload.clone(), true).encode().unwrap();
    peer.write_all(&reply).await.unwrap();

    let reply = call.await.unwrap().unwrap();
    assert_eq!(MsgPackCodec::decode::<String>(&reply).unwrap(), "hi");
    assert!(!client.is_closed());
}

/// Running out of stream ids fails only the new call.
#[tokio::test]
async fn test_exhausted_ids_fail_new_call_only() {
    let gate = Arc::new(Semaphore::new(0));
    let held = gate.clone();
    let router = Router::new()
        .response("/held", move |_ctx: RequestContext, _: ()| {
            let gate = held.clone();
            async move {
                gate.acquire()
                    .await
                    .map_err(|_| RelayError::application("gate closed"))?
                    .forget();
                Ok("released".to_string())
            }
        })
        .unwrap()
        .response("/echo", |_ctx: RequestContext, word: String| async move { Ok(word) })
        .unwrap();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let _server = Connection::server(server_io, router);
    let client = Connection::builder().max_stream_id(3).start(client_io);

    let pending: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.request_response("/held", Metadata::new(), Bytes::new()).await })
        })
        .collect();
    eventually(|| client.open_streams().len() == 2).await;

    let err = client
        .request_response("/echo", Metadata::new(), encode(&"full"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Exhausted));
    assert!(!client.is_closed());

    gate.add_permits(1);
    eventually(|| client.open_streams().len() == 1).await;

    let echoed = client
        .request_response("/echo", Metadata::new(), encode(&"again"))
        .await
        .unwrap();
    assert_eq!(MsgPackCodec::decode::<String>(&echoed).unwrap(), "again");

    gate.add_permits(1);
    for call in pending {
        let reply = call.await.unwrap().unwrap();
        assert_eq!(MsgPackCodec::decode::<String>(&reply).unwrap(), "released");
    }
}
