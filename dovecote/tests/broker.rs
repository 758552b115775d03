//! End-to-end scenarios over loopback TCP, speaking the real wire
//! protocol against a served broker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use dovecote::{Hub, ServerOptions};

async fn start_broker(opts: ServerOptions) -> (Arc<Hub>, SocketAddr) {
    dovecote::dev_tracing::init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Hub::new(opts);
    tokio::spawn(hub.clone().serve(listener));
    (hub, addr)
}

async fn wait_until<F: Fn() -> bool>(cond: F, deadline: Duration) {
    let start = tokio::time::Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Open a connection and consume the INFO banner.
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let info = client.read_line().await;
        assert!(info.starts_with("INFO "), "expected INFO banner, got {info:?}");
        client
    }

    /// Connect and disable verbose acks.
    async fn connect_quiet(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(b"CONNECT {\"verbose\":false}\r\n").await;
        client
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("read timed out")
            .unwrap();
        assert!(n > 0, "unexpected EOF");
        line.trim_end().to_string()
    }

    /// Round-trip a ping so everything sent before it has been processed
    /// and flushed by the broker.
    async fn sync(&mut self) {
        self.send(b"PING\r\n").await;
        assert_eq!(self.read_line().await, "PONG");
    }

    /// Read one delivery. Returns the header after `MSG ` and the payload.
    async fn read_msg(&mut self) -> (String, Vec<u8>) {
        let header = self.read_line().await;
        let rest = header
            .strip_prefix("MSG ")
            .unwrap_or_else(|| panic!("expected MSG, got {header:?}"))
            .to_string();
        let size: usize = rest.rsplit(' ').next().unwrap().parse().unwrap();
        let mut payload = vec![0u8; size + 2];
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_exact(&mut payload))
            .await
            .expect("payload read timed out")
            .unwrap();
        assert_eq!(&payload[size..], b"\r\n");
        payload.truncate(size);
        (rest, payload)
    }

    /// Count deliveries until the stream goes quiet for `window`.
    async fn drain_msgs(&mut self, window: Duration) -> usize {
        let mut count = 0;
        loop {
            let mut line = String::new();
            match tokio::time::timeout(window, self.reader.read_line(&mut line)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(_)) => {
                    let line = line.trim_end();
                    if let Some(rest) = line.strip_prefix("MSG ") {
                        let size: usize = rest.rsplit(' ').next().unwrap().parse().unwrap();
                        let mut payload = vec![0u8; size + 2];
                        self.reader.read_exact(&mut payload).await.unwrap();
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Assert the broker closes this connection, tolerating any output
    /// still buffered ahead of the close.
    async fn expect_closed(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.reader.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(_)) => {}
                Err(_) => panic!("connection was not closed"),
            }
        }
    }
}

#[tokio::test]
async fn simple_fanout() {
    let (hub, addr) = start_broker(ServerOptions::default()).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut b = Client::connect_quiet(addr).await;
    let mut c = Client::connect_quiet(addr).await;

    b.send(b"SUB foo 1\r\n").await;
    c.send(b"SUB foo 2\r\n").await;
    b.sync().await;
    c.sync().await;

    a.send(b"PUB foo 5\r\nhello\r\n").await;

    let (header, payload) = b.read_msg().await;
    assert_eq!(header, "foo 1 5");
    assert_eq!(payload, b"hello");

    let (header, payload) = c.read_msg().await;
    assert_eq!(header, "foo 2 5");
    assert_eq!(payload, b"hello");

    // The publisher itself gets nothing.
    a.sync().await;

    let stats = hub.stats();
    assert!(stats.in_msgs >= 1);
    assert!(stats.out_msgs >= 2);
    assert_eq!(stats.connections, 3);
}

#[tokio::test]
async fn reply_subject_forwarded() {
    let (_hub, addr) = start_broker(ServerOptions::default()).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut b = Client::connect_quiet(addr).await;

    b.send(b"SUB req 7\r\n").await;
    b.sync().await;

    a.send(b"PUB req inbox.42 2\r\nhi\r\n").await;
    let (header, payload) = b.read_msg().await;
    assert_eq!(header, "req 7 inbox.42 2");
    assert_eq!(payload, b"hi");
}

#[tokio::test]
async fn wildcard_matching() {
    let (_hub, addr) = start_broker(ServerOptions::default()).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut b = Client::connect_quiet(addr).await;

    b.send(b"SUB foo.* 1\r\n").await;
    b.sync().await;

    a.send(b"PUB foo.bar 2\r\nhi\r\n").await;
    let (header, payload) = b.read_msg().await;
    assert_eq!(header, "foo.bar 1 2");
    assert_eq!(payload, b"hi");

    // One token too deep for `foo.*`: nothing must arrive before the PONG.
    a.send(b"PUB foo.bar.baz 2\r\nhi\r\n").await;
    a.sync().await;
    b.sync().await;

    b.send(b"SUB bar.> 2\r\n").await;
    b.sync().await;

    a.send(b"PUB bar.x.y.z 1\r\nq\r\n").await;
    let (header, payload) = b.read_msg().await;
    assert_eq!(header, "bar.x.y.z 2 1");
    assert_eq!(payload, b"q");
    b.sync().await;
}

#[tokio::test]
async fn queue_group_exclusivity() {
    let (_hub, addr) = start_broker(ServerOptions::default()).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut b = Client::connect_quiet(addr).await;
    let mut c = Client::connect_quiet(addr).await;

    b.send(b"SUB work worker 1\r\n").await;
    c.send(b"SUB work worker 1\r\n").await;
    b.sync().await;
    c.sync().await;

    const N: usize = 1000;
    let mut batch = Vec::new();
    for _ in 0..N {
        batch.extend_from_slice(b"PUB work 2\r\nhi\r\n");
    }
    a.send(&batch).await;
    a.sync().await;

    let got_b = b.drain_msgs(Duration::from_millis(500)).await;
    let got_c = c.drain_msgs(Duration::from_millis(500)).await;

    // Exactly one group member sees each publish, and the random pick
    // spreads the load roughly evenly.
    assert_eq!(got_b + got_c, N);
    assert!(got_b >= 300, "skewed distribution: {got_b}/{got_c}");
    assert!(got_c >= 300, "skewed distribution: {got_b}/{got_c}");
}

#[tokio::test]
async fn queue_group_beside_plain_subscriber() {
    let (_hub, addr) = start_broker(ServerOptions::default()).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut plain = Client::connect_quiet(addr).await;
    let mut q1 = Client::connect_quiet(addr).await;
    let mut q2 = Client::connect_quiet(addr).await;

    plain.send(b"SUB evt 1\r\n").await;
    q1.send(b"SUB evt grp 1\r\n").await;
    q2.send(b"SUB evt grp 1\r\n").await;
    plain.sync().await;
    q1.sync().await;
    q2.sync().await;

    const N: usize = 50;
    let mut batch = Vec::new();
    for _ in 0..N {
        batch.extend_from_slice(b"PUB evt 1\r\nx\r\n");
    }
    a.send(&batch).await;
    a.sync().await;

    // Every publish reaches the plain subscriber and exactly one of the
    // two group members.
    assert_eq!(plain.drain_msgs(Duration::from_millis(500)).await, N);
    let q_total = q1.drain_msgs(Duration::from_millis(500)).await
        + q2.drain_msgs(Duration::from_millis(500)).await;
    assert_eq!(q_total, N);
}

#[tokio::test]
async fn unsubscribe_after_max_deliveries() {
    let (hub, addr) = start_broker(ServerOptions::default()).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut b = Client::connect_quiet(addr).await;

    b.send(b"SUB foo 1\r\nUNSUB 1 2\r\n").await;
    b.sync().await;

    a.send(b"PUB foo 1\r\na\r\nPUB foo 1\r\nb\r\nPUB foo 1\r\nc\r\n")
        .await;
    a.sync().await;

    let (_, payload) = b.read_msg().await;
    assert_eq!(payload, b"a");
    let (_, payload) = b.read_msg().await;
    assert_eq!(payload, b"b");

    // The third delivery crossed the limit: the subscription is gone from
    // the index and nothing else arrives ahead of the PONG.
    b.sync().await;
    assert!(hub.sublist().match_subject(b"foo").is_empty());
}

#[tokio::test]
async fn immediate_unsubscribe() {
    let (hub, addr) = start_broker(ServerOptions::default()).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut b = Client::connect_quiet(addr).await;

    b.send(b"SUB foo 1\r\n").await;
    b.sync().await;
    assert_eq!(hub.sublist().match_subject(b"foo").len(), 1);

    b.send(b"UNSUB 1\r\n").await;
    b.sync().await;
    assert!(hub.sublist().match_subject(b"foo").is_empty());

    a.send(b"PUB foo 2\r\nhi\r\n").await;
    a.sync().await;
    b.sync().await;
}

#[tokio::test]
async fn slow_consumer_evicted() {
    let opts = ServerOptions::default().with_flush_deadline(Duration::from_millis(150));
    let (hub, addr) = start_broker(opts).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut b = Client::connect_quiet(addr).await;
    b.send(b"SUB big 1\r\n").await;
    b.sync().await;
    assert_eq!(hub.num_sessions(), 2);

    // B stops reading; pushing a few hundred KiB through its writer has
    // to trip the flush deadline once the socket buffers fill.
    let payload = vec![b'x'; 512 * 1024];
    for _ in 0..6 {
        let mut publish = format!("PUB big {}\r\n", payload.len()).into_bytes();
        publish.extend_from_slice(&payload);
        publish.extend_from_slice(b"\r\n");
        a.send(&publish).await;
    }

    wait_until(|| hub.num_sessions() == 1, Duration::from_secs(10)).await;

    // The publisher is unaffected.
    a.sync().await;
    b.expect_closed().await;
}

#[tokio::test]
async fn stale_connection_closed() {
    let opts = ServerOptions::default()
        .with_ping_interval(Duration::from_millis(100))
        .with_max_pings_out(1);
    let (_hub, addr) = start_broker(opts).await;

    let mut b = Client::connect(addr).await;
    assert_eq!(b.read_line().await, "PING");
    // Never answering costs the connection one interval later.
    assert_eq!(b.read_line().await, "-ERR 'Stale Connection'");
    b.expect_closed().await;
}

#[tokio::test]
async fn pong_keeps_connection_alive() {
    let opts = ServerOptions::default()
        .with_ping_interval(Duration::from_millis(100))
        .with_max_pings_out(1);
    let (hub, addr) = start_broker(opts).await;

    let mut b = Client::connect_quiet(addr).await;
    for _ in 0..4 {
        assert_eq!(b.read_line().await, "PING");
        b.send(b"PONG\r\n").await;
    }
    assert_eq!(hub.num_sessions(), 1);
}

#[tokio::test]
async fn auth_token_enforced() {
    let opts = ServerOptions::default().with_auth_token("s3cret");
    let (_hub, addr) = start_broker(opts).await;

    let mut bad = Client::connect(addr).await;
    bad.send(b"CONNECT {\"verbose\":false,\"auth_token\":\"nope\"}\r\n")
        .await;
    assert_eq!(bad.read_line().await, "-ERR 'Authorization is Required'");
    bad.expect_closed().await;

    let mut good = Client::connect(addr).await;
    good.send(b"CONNECT {\"verbose\":false,\"auth_token\":\"s3cret\"}\r\n")
        .await;
    good.sync().await;
}

#[tokio::test]
async fn auth_timeout_enforced() {
    let opts = ServerOptions::default()
        .with_auth_token("s3cret")
        .with_auth_timeout(Duration::from_millis(150));
    let (_hub, addr) = start_broker(opts).await;

    let mut b = Client::connect(addr).await;
    // Saying nothing is answered with an eviction.
    assert_eq!(b.read_line().await, "-ERR 'Authorization is Required'");
    b.expect_closed().await;
}

#[tokio::test]
async fn parser_error_closes_connection() {
    let (_hub, addr) = start_broker(ServerOptions::default()).await;

    let mut b = Client::connect(addr).await;
    b.send(b"BOGUS\r\n").await;
    assert_eq!(b.read_line().await, "-ERR 'Parser Error'");
    b.expect_closed().await;
}

#[tokio::test]
async fn oversize_payload_rejected() {
    let opts = ServerOptions::default().with_max_payload(1024);
    let (_hub, addr) = start_broker(opts).await;

    let mut b = Client::connect_quiet(addr).await;
    b.send(b"PUB foo 2048\r\n").await;
    assert_eq!(b.read_line().await, "-ERR 'Maximum Payload Exceeded'");
    b.expect_closed().await;
}

#[tokio::test]
async fn verbose_acks_every_operation() {
    let (_hub, addr) = start_broker(ServerOptions::default()).await;

    let mut b = Client::connect(addr).await;
    b.send(b"CONNECT {\"verbose\":true}\r\n").await;
    assert_eq!(b.read_line().await, "+OK");

    b.send(b"SUB foo 1\r\n").await;
    assert_eq!(b.read_line().await, "+OK");

    // Publishing to itself: the ack precedes the delivery.
    b.send(b"PUB foo 2\r\nhi\r\n").await;
    assert_eq!(b.read_line().await, "+OK");
    let (header, payload) = b.read_msg().await;
    assert_eq!(header, "foo 1 2");
    assert_eq!(payload, b"hi");
}

#[tokio::test]
async fn pedantic_subject_warning_is_soft() {
    let (_hub, addr) = start_broker(ServerOptions::default()).await;

    let mut b = Client::connect(addr).await;
    b.send(b"CONNECT {\"verbose\":false,\"pedantic\":true}\r\n")
        .await;
    b.send(b"SUB foo.* 1\r\n").await;
    b.sync().await;

    // A wildcard publish subject draws a warning but the session lives on.
    b.send(b"PUB foo.* 2\r\nhi\r\n").await;
    assert_eq!(b.read_line().await, "-ERR 'Invalid Subject'");
    b.sync().await;
}

#[tokio::test]
async fn invalid_subscription_subject_rejected() {
    let (hub, addr) = start_broker(ServerOptions::default()).await;

    let mut b = Client::connect_quiet(addr).await;
    b.send(b"SUB foo..bar 1\r\n").await;
    assert_eq!(b.read_line().await, "-ERR 'Invalid Subject'");
    // The session survives and the index stayed clean.
    b.sync().await;
    assert_eq!(hub.sublist().count(), 0);
}

#[tokio::test]
async fn disconnect_unregisters_subscriptions() {
    let (hub, addr) = start_broker(ServerOptions::default()).await;

    let mut b = Client::connect_quiet(addr).await;
    b.send(b"SUB foo 1\r\nSUB bar.> 2\r\nSUB work grp 3\r\n").await;
    b.sync().await;
    assert_eq!(hub.sublist().count(), 3);

    drop(b);

    wait_until(
        || hub.num_sessions() == 0 && hub.sublist().count() == 0,
        Duration::from_secs(5),
    )
    .await;
    assert!(hub.sublist().match_subject(b"foo").is_empty());
    assert!(hub.sublist().match_subject(b"work").is_empty());
}

#[tokio::test]
async fn fragmented_writes_parse_cleanly() {
    let (_hub, addr) = start_broker(ServerOptions::default()).await;

    let mut a = Client::connect_quiet(addr).await;
    let mut b = Client::connect_quiet(addr).await;

    b.send(b"SUB foo 1\r\n").await;
    b.sync().await;

    // Trickle one publish through in awkward fragments.
    for chunk in [
        b"PU" as &[u8],
        b"B fo",
        b"o 5\r",
        b"\nhel",
        b"lo\r",
        b"\n",
    ] {
        a.send(chunk).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (header, payload) = b.read_msg().await;
    assert_eq!(header, "foo 1 5");
    assert_eq!(payload, b"hello");
}

#[tokio::test]
async fn info_banner_announces_auth() {
    let opts = ServerOptions::default().with_auth_token("t");
    let (_hub, addr) = start_broker(opts).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, _writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();

    let json: serde_json::Value =
        serde_json::from_str(line.trim_end().strip_prefix("INFO ").unwrap()).unwrap();
    assert_eq!(json["auth_required"], true);
    assert!(json["server_id"].is_string());
    assert!(json["max_payload"].is_number());
}
