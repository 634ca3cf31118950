
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use harness::{
    bad_request, eventually, get_request, not_found, roundtrip, FacadeHandle, RecordingForward,
    SERVER_NAME, TEST_TIMEOUT,
};
use hostmux::{ListenerConfig, SniffConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn miss_gets_exact_404_and_close() {
    let (forward, _handed_off) = RecordingForward::new(&[]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let response = roundtrip(facade.listen_addr, &get_request("foo.example.com"))
        .await
        .unwrap();

    assert_eq!(
        response,
        format!(
            "HTTP/1.0 404 Not Found\r\nServer: {}\r\nContent-Length: 21\r\n\r\nTunnel foo not found\n",
            SERVER_NAME
        )
        .into_bytes()
    );
    assert_eq!(forward.calls(), vec!["foo".to_string()]);
    assert!(eventually(|| facade.stats.not_found.load(Ordering::Relaxed) == 1).await);
}

#[tokio::test]
async fn garbage_request_gets_exact_400_and_close() {
    let (forward, _handed_off) = RecordingForward::new(&["a"]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let response = roundtrip(facade.listen_addr, b"GARBAGE\r\n\r\n").await.unwrap();

    assert_eq!(response, bad_request());
    assert!(forward.calls().is_empty());
    assert_eq!(facade.stats.bad_requests.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn host_without_dot_is_bad_request() {
    let (forward, _handed_off) = RecordingForward::new(&["localhost"]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let response = roundtrip(facade.listen_addr, &get_request("localhost"))
        .await
        .unwrap();

    assert_eq!(response, bad_request());
    assert!(forward.calls().is_empty(), "forward must not be invoked");
}

#[tokio::test]
async fn missing_host_is_bad_request() {
    let (forward, _handed_off) = RecordingForward::new(&[]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let response = roundtrip(facade.listen_addr, b"GET / HTTP/1.0\r\n\r\n")
        .await
        .unwrap();

    assert_eq!(response, bad_request());
    assert!(forward.calls().is_empty());
}

#[tokio::test]
async fn client_closing_mid_head_gets_400() {
    let (forward, _handed_off) = RecordingForward::new(&["a"]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(facade.listen_addr).await?;
        stream.write_all(b"GET / HTTP/1.1\r\nHost: a.b.c").await?;
        stream.shutdown().await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(response)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response, bad_request());
    assert!(forward.calls().is_empty());
}

#[tokio::test]
async fn routing_key_is_leftmost_label() {
    let (forward, mut handed_off) = RecordingForward::new(&["a", "b"]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let mut first = TcpStream::connect(facade.listen_addr).await.unwrap();
    first.write_all(&get_request("a.b.com")).await.unwrap();
    let (key, request) = timeout(TEST_TIMEOUT, handed_off.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "a");
    assert_eq!(request.host(), "a.b.com");
    assert_eq!(request.method(), "GET");
    assert_eq!(request.path(), "/hello");

    let mut second = TcpStream::connect(facade.listen_addr).await.unwrap();
    second.write_all(&get_request("b.com")).await.unwrap();
    let (key, request) = timeout(TEST_TIMEOUT, handed_off.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "b");
    assert_eq!(request.host(), "b.com");

    assert_eq!(forward.calls(), vec!["a".to_string(), "b".to_string()]);
    assert!(eventually(|| facade.stats.forwarded.load(Ordering::Relaxed) == 2).await);
}

#[tokio::test]
async fn routing_key_keeps_case() {
    let (forward, _handed_off) = RecordingForward::new(&[]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let response = roundtrip(facade.listen_addr, &get_request("MyApp.example.com"))
        .await
        .unwrap();

    assert_eq!(response, not_found("MyApp"));
    assert_eq!(forward.calls(), vec!["MyApp".to_string()]);
}

#[tokio::test]
async fn hit_hands_off_every_byte_to_handler() {
    let (forward, mut handed_off) = RecordingForward::new(&["app"]);
    let facade = FacadeHandle::spawn(forward).await.unwrap();

    let head = b"POST /upload HTTP/1.1\r\nHost: app.example.com\r\nContent-Length: 16\r\n\r\n";
    let mut sent = head.to_vec();
    sent.extend_from_slice(b"first-half|");

    let mut client = TcpStream::connect(facade.listen_addr).await.unwrap();
    client.write_all(&sent).await.unwrap();

    let (key, request) = timeout(TEST_TIMEOUT, handed_off.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "app");

    // Bytes sent after the hand-off arrive behind the retained ones.
    client.write_all(b"tail!").await.unwrap();
    client.shutdown().await.unwrap();
    sent.extend_from_slice(b"tail!");

    let mut stream = request.into_stream();
    let mut received = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, sent);

    // The handler is the only writer: the client sees exactly its reply.
    stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
    drop(stream);
    let mut reply = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"HTTP/1.1 204 No Content\r\n\r\n");
}

#[tokio::test]
async fn body_stream_starts_after_head() {
    let (forward, mut handed_off) = RecordingForward::new(&["app"]);
    let facade = FacadeHandle::spawn(forward).await.unwrap();

    let mut client = TcpStream::connect(facade.listen_addr).await.unwrap();
    client
        .write_all(b"PUT /f HTTP/1.1\r\nHost: app.example.com\r\nContent-Length: 7\r\n\r\npayload")
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let (_, request) = timeout(TEST_TIMEOUT, handed_off.recv())
        .await
        .unwrap()
        .unwrap();
    let mut body = Vec::new();
    request
        .into_body_stream()
        .read_to_end(&mut body)
        .await
        .unwrap();
    assert_eq!(body, b"payload");
}

#[tokio::test]
async fn slow_client_does_not_delay_others() {
    let (forward, _handed_off) = RecordingForward::new(&[]);
    let facade = FacadeHandle::spawn(forward).await.unwrap();

    // Partial head, never completed while the others run.
    let mut slow = TcpStream::connect(facade.listen_addr).await.unwrap();
    slow.write_all(b"GET / HTTP/1.1\r\nHost: slow.exa").await.unwrap();

    let mut clients = Vec::new();
    for key in ["k1", "k2", "k3", "k4"] {
        let addr = facade.listen_addr;
        clients.push(tokio::spawn(async move {
            let response = roundtrip(addr, &get_request(&format!("{}.example.com", key))).await?;
            Ok::<_, std::io::Error>((key, response))
        }));
    }

    for client in clients {
        let (key, response) = timeout(TEST_TIMEOUT, client)
            .await
            .expect("fast client stalled")
            .unwrap()
            .unwrap();
        assert_eq!(response, not_found(key));
    }

    // The slow connection is still open and unanswered.
    assert!(facade.stats.connections_active.load(Ordering::Relaxed) >= 1);
    let mut buf = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(100), slow.read(&mut buf))
            .await
            .is_err(),
        "slow client must still be pending"
    );

    // Finishing the head completes it like any other.
    slow.write_all(b"mple.com\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, slow.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, not_found("slow"));
}

#[tokio::test]
async fn oversized_head_is_bad_request() {
    let (forward, _handed_off) = RecordingForward::new(&["a"]);
    let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
    config.sniff = SniffConfig {
        max_head_bytes: 256,
        ..SniffConfig::default()
    };
    let facade = FacadeHandle::spawn_with(config, forward.clone()).await.unwrap();

    // Exactly the limit and still no blank line, so every byte sent gets read.
    let mut request = b"GET / HTTP/1.1\r\nHost: a.example.com\r\nX-Filler: ".to_vec();
    request.resize(256, b'x');

    let response = roundtrip(facade.listen_addr, &request).await.unwrap();
    assert_eq!(response, bad_request());
    assert!(forward.calls().is_empty());
}

#[tokio::test]
async fn custom_server_name_in_responses() {
    let (forward, _handed_off) = RecordingForward::new(&[]);
    let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
    config.server_name = "webs.sh".to_string();
    let facade = FacadeHandle::spawn_with(config, forward).await.unwrap();

    let response = roundtrip(facade.listen_addr, &get_request("foo.webs.sh"))
        .await
        .unwrap();
    assert_eq!(
        response,
        b"HTTP/1.0 404 Not Found\r\nServer: webs.sh\r\nContent-Length: 21\r\n\r\nTunnel foo not found\n"
    );
}

#[tokio::test]
async fn cancellation_stops_accepting_but_keeps_handed_off_connections() {
    let (forward, mut handed_off) = RecordingForward::new(&["live"]);
    let facade = FacadeHandle::spawn(forward).await.unwrap();
    let addr = facade.listen_addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&get_request("live.example.com")).await.unwrap();
    let (_, request) = timeout(TEST_TIMEOUT, handed_off.recv())
        .await
        .unwrap()
        .unwrap();

    let stats = Arc::clone(&facade.stats);
    timeout(TEST_TIMEOUT, facade.shutdown())
        .await
        .unwrap()
        .unwrap();

    // The OS refuses new connections once the listening socket is gone.
    assert!(TcpStream::connect(addr).await.is_err());

    // The handed-off connection keeps working.
    let mut stream = request.into_body_stream();
    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"still here");

    stream.write_all(b"ack").await.unwrap();
    let mut ack = [0u8; 3];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"ack");
    assert!(eventually(|| stats.forwarded.load(Ordering::Relaxed) == 1).await);
}

#[tokio::test]
async fn obs_text_header_value_is_still_routed() {
    let (forward, mut handed_off) = RecordingForward::new(&["app"]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let sent: &[u8] = b"GET / HTTP/1.1\r\nHost: app.example.com\r\nX-Name: caf\xe9\r\n\r\n";
    let mut client = TcpStream::connect(facade.listen_addr).await.unwrap();
    client.write_all(sent).await.unwrap();
    client.shutdown().await.unwrap();

    let (key, request) = timeout(TEST_TIMEOUT, handed_off.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "app");

    let mut received = Vec::new();
    request.into_stream().read_to_end(&mut received).await.unwrap();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn duplicate_host_is_bad_request() {
    let (forward, _handed_off) = RecordingForward::new(&["a", "b"]);
    let facade = FacadeHandle::spawn(forward.clone()).await.unwrap();

    let response = roundtrip(
        facade.listen_addr,
        b"GET / HTTP/1.1\r\nHost: a.example.com\r\nHost: b.example.com\r\n\r\n",
    )
    .await
    .unwrap();

    assert_eq!(response, bad_request());
    assert!(forward.calls().is_empty());
}
