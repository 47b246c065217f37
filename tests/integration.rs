//! End-to-end tests over real TCP sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use meshwire::protocol::{extension, CmdType, FrameBuffer, FrameCodec, Header, Heartbeat, Packet, Payload};
use meshwire::{
    Bindings, CallContext, Client, Compression, ErrorCode, Interface, Request, Response, Server,
    ServiceDescriptor, WireError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Query {
    limit: u32,
    tags: Vec<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    visible: u32,
    tags: Vec<String>,
}

#[derive(Default)]
struct Profiles {
    hits: AtomicUsize,
}

fn profile_service() -> ServiceDescriptor {
    let interface = Interface::new("ProfileService")
        .method::<(String, Query), Result<Profile, String>>("GetProfile")
        .method::<(u64,), Result<u64, String>>("Sleep")
        .method::<(String,), Result<String, String>>("Echo")
        .method_with_context::<(), Result<String, String>>("WhoAmI");

    let bindings = Bindings::new(Profiles::default())
        .bind("GetProfile", |svc: Arc<Profiles>, (name, query): (String, Query)| async move {
            svc.hits.fetch_add(1, Ordering::SeqCst);
            if name.is_empty() {
                return Err("name required".to_string());
            }
            Ok(Profile {
                name,
                visible: query.limit.min(10),
                tags: query.tags,
            })
        })
        .bind("Sleep", |_svc, (ms,): (u64,)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
        .bind("Echo", |_svc, (text,): (String,)| async move { Ok::<_, String>(text) })
        .bind_with_context("WhoAmI", |_svc, ctx: CallContext, (): ()| async move {
            Ok::<_, String>(format!(
                "{}@{}",
                ctx.property("user").unwrap_or("anonymous"),
                ctx.service_uri()
            ))
        });

    ServiceDescriptor::build("/service/profile", "*", bindings, &interface)
}

async fn start_server(timeout: Duration, compress: Compression) -> Server {
    Server::builder()
        .bind_address("127.0.0.1:0")
        .compression(compress)
        .process_timeout(timeout)
        .max_dispatcher_size(16)
        .shutdown_grace(Duration::ZERO)
        .service(profile_service())
        .start()
        .await
        .unwrap()
}

fn raw_frame(opaque: u32, command: CmdType, body: &[u8]) -> Vec<u8> {
    FrameCodec::new()
        .encode(&Packet::new(opaque, command, Bytes::copy_from_slice(body)))
        .unwrap()
}

/// Read frames from a raw socket until `count` have arrived.
async fn read_frames(stream: &mut TcpStream, count: usize) -> Vec<Packet> {
    let mut buffer = FrameBuffer::default();
    let mut packets = Vec::new();
    let mut buf = [0u8; 4096];
    while packets.len() < count {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("reply in time")
            .unwrap();
        assert!(n > 0, "connection closed early");
        packets.extend(buffer.push(&buf[..n]).unwrap());
    }
    packets
}

#[tokio::test]
async fn test_typed_call_round_trip() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let client = Client::connect(&server.local_addr().to_string()).await.unwrap();

    let query = Query {
        limit: 50,
        tags: vec!["a".into(), "b".into()],
    };
    let request = Request::new("/service/profile", "GetProfile")
        .arg("ann")
        .unwrap()
        .arg(&query)
        .unwrap();

    let response = client.invoke(&request).await.unwrap();
    assert!(response.is_success());
    assert_eq!(
        response.decode_result::<Profile>().unwrap(),
        Profile {
            name: "ann".into(),
            visible: 10,
            tags: vec!["a".into(), "b".into()],
        }
    );

    let invokes = server.list_invokes();
    assert_eq!(invokes.len(), 1);
    assert_eq!(invokes[0].service_name, "/service/profile");
    assert_eq!(invokes[0].methods[0].name, "GetProfile");
    assert_eq!(invokes[0].methods[0].count, 1);

    drop(client);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_business_error_travels_as_success() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let client = Client::connect(&server.local_addr().to_string()).await.unwrap();

    let request = Request::new("/service/profile", "GetProfile")
        .arg("")
        .unwrap()
        .arg(&Query { limit: 1, tags: vec![] })
        .unwrap();
    let response = client.invoke(&request).await.unwrap();

    assert_eq!(response.code(), Some(ErrorCode::Success));
    assert_eq!(response.message, "method invoke error: name required");
    assert!(response.result.is_none());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resolution_failures() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let client = Client::connect(&server.local_addr().to_string()).await.unwrap();

    let missing_service = client
        .invoke(&Request::new("/service/nowhere", "Echo").arg("x").unwrap())
        .await
        .unwrap();
    assert_eq!(missing_service.code(), Some(ErrorCode::ServiceNotFound));

    let missing_method = client
        .invoke(&Request::new("/service/profile", "Delete"))
        .await
        .unwrap();
    assert_eq!(missing_method.code(), Some(ErrorCode::MethodNotFound));

    let wrong_arity = client
        .invoke(&Request::new("/service/profile", "Echo"))
        .await
        .unwrap();
    assert_eq!(wrong_arity.code(), Some(ErrorCode::Serialization));

    let wrong_type = client
        .invoke(&Request::new("/service/profile", "Echo").arg(&42).unwrap())
        .await
        .unwrap();
    assert_eq!(wrong_type.code(), Some(ErrorCode::SerializationServer));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_context_properties_reach_method() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let client = Client::connect(&server.local_addr().to_string()).await.unwrap();

    let request = Request::new("/service/profile", "whoami").property("user", "ann");
    let response = client.invoke(&request).await.unwrap();
    assert_eq!(
        response.decode_result::<String>().unwrap(),
        "ann@/service/profile"
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_call_times_out_with_single_reply() {
    let server = start_server(Duration::from_millis(100), Compression::None).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let request = Request::new("/service/profile", "Sleep").arg(&400u64).unwrap();
    stream
        .write_all(&raw_frame(5, CmdType::Request, &request.encode().unwrap()))
        .await
        .unwrap();

    let reply = read_frames(&mut stream, 1).await.remove(0);
    assert_eq!(reply.opaque, 5);
    let response = Response::decode(reply.payload()).unwrap();
    assert_eq!(response.code(), Some(ErrorCode::TimeoutServer));

    // The late result must never be written.
    let mut buf = [0u8; 64];
    let late = tokio::time::timeout(Duration::from_millis(600), stream.read(&mut buf)).await;
    assert!(late.is_err(), "unexpected extra data after timeout reply");

    assert_eq!(server.accounting().totals().3, 1);
    drop(stream);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ping_echoes_opaque_and_timestamp() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let beat = Heartbeat { timestamp: 1_650_000_000_042 };
    let ping = Payload::Ping(beat).into_packet(77).unwrap();
    stream
        .write_all(&FrameCodec::new().encode(&ping).unwrap())
        .await
        .unwrap();

    let pong = read_frames(&mut stream, 1).await.remove(0);
    assert_eq!(pong.opaque, 77);
    assert_eq!(pong.command, CmdType::Pong);
    assert_eq!(Payload::decode(&pong).unwrap(), Payload::Pong(beat));

    drop(stream);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_split_across_writes() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let request = Request::new("/service/profile", "Echo").arg("piecewise").unwrap();
    let frame = raw_frame(9, CmdType::Request, &request.encode().unwrap());
    for chunk in frame.chunks(3) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let reply = read_frames(&mut stream, 1).await.remove(0);
    let response = Response::decode(reply.payload()).unwrap();
    assert_eq!(response.decode_result::<String>().unwrap(), "piecewise");

    drop(stream);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_compressed_body_closes_connection() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let body = [0x0A, 0xFE, 0x00];
    let header = Header::new(1, body.len() as u32, CmdType::Request, extension::SNAPPY);
    stream.write_all(&header.encode()).await.unwrap();
    stream.write_all(&body).await.unwrap();

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close the connection");
    match read {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("got {} bytes instead of a closed connection", n),
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_before_corrupt_frame_is_answered() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let request = Request::new("/service/profile", "Echo").arg("still here").unwrap();
    let mut chunk = raw_frame(5, CmdType::Request, &request.encode().unwrap());
    let body = [0x0A, 0xFE, 0x00];
    chunk.extend_from_slice(&Header::new(6, body.len() as u32, CmdType::Request, extension::SNAPPY).encode());
    chunk.extend_from_slice(&body);
    stream.write_all(&chunk).await.unwrap();

    let reply = read_frames(&mut stream, 1).await.remove(0);
    assert_eq!(reply.opaque, 5);
    assert_eq!(reply.command, CmdType::Response);
    let response = Response::decode(reply.payload()).unwrap();
    assert_eq!(response.decode_result::<String>().unwrap(), "still here");

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close the connection");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_compressed_round_trip() {
    let server = start_server(Duration::from_secs(2), Compression::Snappy).await;
    let client = Client::builder()
        .compression(true)
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    let text = "meshwire ".repeat(2000);
    let response = client
        .invoke(&Request::new("/service/profile", "Echo").arg(&text).unwrap())
        .await
        .unwrap();
    assert_eq!(response.decode_result::<String>().unwrap(), text);

    // Compressed bodies on the wire are smaller than what was sent.
    let network = server.network();
    assert!(network.write_bytes < text.len() as u64);

    drop(client);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_on_one_connection() {
    let server = start_server(Duration::from_secs(5), Compression::None).await;
    let client = Arc::new(Client::connect(&server.local_addr().to_string()).await.unwrap());

    let mut calls = Vec::new();
    for i in 0..50u64 {
        let client = Arc::clone(&client);
        calls.push(tokio::spawn(async move {
            // Later calls finish first, so replies come back out of order.
            let ms = 50 - i;
            let request = Request::new("/service/profile", "Sleep").arg(&ms).unwrap();
            let response = client.invoke(&request).await.unwrap();
            assert_eq!(response.decode_result::<u64>().unwrap(), ms);
        }));
    }
    for call in calls {
        call.await.unwrap();
    }

    let invokes = server.list_invokes();
    assert_eq!(invokes.len(), 1);
    assert_eq!(invokes[0].methods[0].count, 50);
    assert_eq!(server.accounting().totals().1, 50);

    drop(client);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_info_reports_connections() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let client = Client::connect(&server.local_addr().to_string()).await.unwrap();

    client.ping().await.unwrap();
    let info = client.info().await.unwrap();
    assert_eq!(info.network.connections, 1);
    assert!(info.network.read_count >= 2);

    drop(client);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_after_server_shutdown() {
    let server = start_server(Duration::from_secs(2), Compression::None).await;
    let client = Client::builder()
        .call_timeout(Duration::from_millis(500))
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();
    client.ping().await.unwrap();

    server.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client.ping().await.unwrap_err();
    assert!(matches!(
        err,
        WireError::ConnectionClosed | WireError::Timeout | WireError::Io(_)
    ));
}
