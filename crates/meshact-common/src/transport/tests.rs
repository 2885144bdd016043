//! Tests for the transport layer
//!
//! These cover the codec and framing, then drive each transport end to end
//! with a small echo listener and a collecting reply sink.

#[cfg(test)]
mod tests {
    use crate::config::TransportConfig;
    use crate::protocol::{error, Body, Call, Envelope, MeshError, Message, Meta};
    use crate::transport::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Replies with the call's pattern; drops calls carrying `drop`
    struct Echo;

    #[async_trait]
    impl Inbound for Echo {
        async fn receive(&self, envelope: Envelope) -> Option<Envelope> {
            let call = envelope.call()?.clone();
            if call.pattern.contains_key("drop") {
                return None;
            }
            if let Some(ms) = call.pattern.get("sleep").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Some(Envelope::result(
                envelope.meta.reply(),
                json!({"pattern": call.pattern.to_string(), "args": call.args}),
            ))
        }

        fn malformed(&self, error: MeshError, meta: Option<Meta>) -> Envelope {
            let meta = meta
                .map(|m| m.reply())
                .unwrap_or_else(|| Meta::new("unknown", "unknown"));
            Envelope::error(meta, error.to_wire())
        }
    }

    /// Forwards every reply or failure into a channel
    struct Collect(mpsc::UnboundedSender<std::result::Result<Envelope, String>>);

    impl ReplySink for Collect {
        fn deliver(&self, reply: Envelope) -> bool {
            self.0.send(Ok(reply)).is_ok()
        }

        fn fail(&self, id: &str, error: MeshError) -> bool {
            self.0.send(Err(format!("{}: {}", id, error))).is_ok()
        }

        fn is_waiting(&self, _id: &str) -> bool {
            true
        }
    }

    type Replies = mpsc::UnboundedReceiver<std::result::Result<Envelope, String>>;

    /// Echoes calls and hands out every accepted connection
    struct Accepting {
        links: mpsc::UnboundedSender<Arc<dyn Channel>>,
        gone: mpsc::UnboundedSender<SocketAddr>,
        replies: Arc<Collect>,
    }

    #[async_trait]
    impl Inbound for Accepting {
        async fn receive(&self, envelope: Envelope) -> Option<Envelope> {
            let echo = Echo;
            echo.receive(envelope).await
        }

        fn malformed(&self, error: MeshError, meta: Option<Meta>) -> Envelope {
            Echo.malformed(error, meta)
        }

        fn connected(&self, _peer: SocketAddr, link: Arc<dyn Channel>) -> Option<Arc<dyn ReplySink>> {
            let _ = self.links.send(link);
            let replies: Arc<dyn ReplySink> = self.replies.clone();
            Some(replies)
        }

        fn disconnected(&self, peer: SocketAddr) {
            let _ = self.gone.send(peer);
        }
    }

    fn context() -> (ChannelContext, Replies) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = ChannelContext {
            replies: Arc::new(Collect(tx)),
            inbound: None,
        };
        (context, rx)
    }

    fn call(id: &str, text: &str) -> Envelope {
        let message = Message::parse(text).unwrap();
        Envelope::act(Meta::new(id, "tx-1"), Call::new(message.pattern, message.args))
    }

    async fn next(rx: &mut Replies) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("reply in time")
            .expect("channel open")
            .expect("delivered reply")
    }

    // ============================================================================
    // Codec Tests
    // ============================================================================

    #[test]
    fn test_encode_decode_envelope() {
        let original = call("m1/a", "c:1,d:A,e:{f:[1,2]}");
        let encoded = JsonCodec::encode(&original).unwrap();
        assert!(!encoded.is_empty());
        assert_eq!(JsonCodec::decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_invalid_data_returns_decode_error() {
        let cases: [&[u8]; 5] = [
            &[0xFF, 0xFF, 0xFF, 0xFF],
            br#"{"act":{"pattern":{"c":1}}}"#,
            br#"{"meta":{"id":"x"},"act":{"pattern":{"c":1}}}"#,
            br#"{"meta":{"id":"x","tx":"t"}}"#,
            br#"{"meta":{"id":"x","tx":"t"},"act":{"pattern":{"c":{"d":1}}}}"#,
        ];
        for data in cases {
            assert!(
                matches!(JsonCodec::decode(data), Err(MeshError::Decode(_))),
                "{}",
                String::from_utf8_lossy(data)
            );
        }
    }

    #[test]
    fn test_salvage_meta() {
        let data = br#"{"meta":{"id":"x1","tx":"t1"},"act":{"pattern":{"c":{"d":1}}}}"#;
        let meta = JsonCodec::salvage_meta(data).unwrap();
        assert_eq!((meta.id.as_str(), meta.tx.as_str()), ("x1", "t1"));
        assert!(JsonCodec::salvage_meta(b"{nope").is_none());
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32) + 1;
        tokio::io::AsyncWriteExt::write_all(&mut a, &len.to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(MeshError::Transport(_))
        ));
    }

    // ============================================================================
    // Stream Transport Tests
    // ============================================================================

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpTransport
            .listen(&TransportConfig::tcp(0), Arc::new(Echo))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let (context, mut rx) = context();
        let channel = TcpTransport
            .connect(&TransportConfig::tcp(port), context)
            .await
            .unwrap();

        channel.send(call("m1/a", "c:1,d:A,x:{y:1}")).await.unwrap();
        let reply = next(&mut rx).await;
        assert_eq!(reply.meta.id, "m1/a");
        assert_eq!(reply.meta.tx, "tx-1");
        assert_eq!(
            reply.body,
            Body::Result(json!({"pattern": "c:1,d:A", "args": {"x": {"y": 1}}}))
        );

        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(matches!(
            channel.send(call("m2/a", "c:1")).await,
            Err(MeshError::Closed)
        ));
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_replies_out_of_order() {
        let listener = TcpTransport
            .listen(&TransportConfig::tcp(0), Arc::new(Echo))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let (context, mut rx) = context();
        let channel = TcpTransport
            .connect(&TransportConfig::tcp(port), context)
            .await
            .unwrap();

        channel.send(call("slow/a", "c:1,sleep:300")).await.unwrap();
        channel.send(call("fast/a", "c:2")).await.unwrap();

        assert_eq!(next(&mut rx).await.meta.id, "fast/a");
        assert_eq!(next(&mut rx).await.meta.id, "slow/a");
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_malformed_frame_gets_decode_error() {
        let listener = TcpTransport
            .listen(&TransportConfig::tcp(0), Arc::new(Echo))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();

        write_frame(&mut stream, b"{not json").await.unwrap();
        let reply = JsonCodec::decode(&read_frame(&mut stream).await.unwrap().unwrap()).unwrap();
        match reply.body {
            Body::Error(wire) => assert_eq!(wire.code.as_deref(), Some(error::CODE_DECODE)),
            other => panic!("expected decode error, got {:?}", other),
        }

        // the connection survives, and recovered ids are echoed
        write_frame(
            &mut stream,
            br#"{"meta":{"id":"x1","tx":"t1"},"act":{"pattern":{"c":{"d":1}}}}"#,
        )
        .await
        .unwrap();
        let reply = JsonCodec::decode(&read_frame(&mut stream).await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.meta.id, "x1");
        assert_eq!(reply.meta.tx, "t1");
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_peer_hangup_fails_calls_in_flight() {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let hangup = tokio::spawn(async move {
            let (mut stream, _) = server.accept().await.unwrap();
            let mut prefix = [0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut prefix)
                .await
                .unwrap();
        });

        let (context, mut rx) = context();
        let channel = TcpTransport
            .connect(&TransportConfig::tcp(port), context)
            .await
            .unwrap();
        channel.send(call("m1/a", "c:1")).await.unwrap();
        hangup.await.unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("failed without waiting for a deadline")
            .unwrap()
            .unwrap_err();
        assert!(failure.starts_with("m1/a: connection error"), "{}", failure);

        // the connection is known dead, later calls fail the same way
        assert!(matches!(
            channel.send(call("m2/a", "c:1")).await,
            Err(MeshError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_listener_calls_back_over_accepted_connection() {
        let (links_tx, mut links) = mpsc::unbounded_channel();
        let (gone_tx, mut gone) = mpsc::unbounded_channel();
        let (server_tx, mut server_replies) = mpsc::unbounded_channel();
        let listener = TcpTransport
            .listen(
                &TransportConfig::tcp(0),
                Arc::new(Accepting {
                    links: links_tx,
                    gone: gone_tx,
                    replies: Arc::new(Collect(server_tx)),
                }),
            )
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let (client_tx, _client_replies) = mpsc::unbounded_channel();
        let context = ChannelContext {
            replies: Arc::new(Collect(client_tx)),
            inbound: Some(Arc::new(Echo)),
        };
        let channel = TcpTransport
            .connect(&TransportConfig::tcp(port), context)
            .await
            .unwrap();

        let link = tokio::time::timeout(Duration::from_secs(5), links.recv())
            .await
            .unwrap()
            .unwrap();
        link.send(call("back/1", "cb:1")).await.unwrap();
        let reply = next(&mut server_replies).await;
        assert_eq!(reply.meta.id, "back/1");
        assert_eq!(reply.body, Body::Result(json!({"pattern": "cb:1", "args": {}})));

        channel.close().await.unwrap();
        let peer = tokio::time::timeout(Duration::from_secs(5), gone.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(peer.ip().is_loopback());
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        drop(server);

        let (context, _rx) = context();
        let result = TcpTransport.connect(&TransportConfig::tcp(port), context).await;
        assert!(matches!(result, Err(MeshError::Connection(_))));
    }

    // ============================================================================
    // Request/Response Transport Tests
    // ============================================================================

    #[tokio::test]
    async fn test_http_round_trip_and_drop() {
        let listener = HttpTransport
            .listen(&TransportConfig::http(0), Arc::new(Echo))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let (context, mut rx) = context();
        let channel = HttpTransport
            .connect(&TransportConfig::http(port), context)
            .await
            .unwrap();

        channel.send(call("m1/a", "c:1,d:A")).await.unwrap();
        let reply = next(&mut rx).await;
        assert_eq!(reply.meta.id, "m1/a");
        assert_eq!(
            reply.body,
            Body::Result(json!({"pattern": "c:1,d:A", "args": {}}))
        );

        // a dropped message produces no reply at all
        channel.send(call("m2/a", "drop:1")).await.unwrap();
        let silent = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(silent.is_err());

        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_oversized_body_is_decode_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = HttpServer::bind("127.0.0.1:0", "/act")
            .await
            .unwrap()
            .with_max_body(16);
        let listener = server.start(Arc::new(Echo)).unwrap();
        let addr = listener.local_addr().unwrap();

        let body = format!(r#"{{"c":1,"pad":"{}"}}"#, "x".repeat(64));
        let request = format!(
            "POST /act HTTP/1.1\r\nhost: {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            addr,
            body.len(),
            body
        );
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
        assert!(response.contains(error::CODE_DECODE), "{}", response);
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connection_failure_reaches_sink() {
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        drop(server);

        let (context, mut rx) = context();
        let channel = HttpTransport
            .connect(&TransportConfig::http(port), context)
            .await
            .unwrap();
        channel.send(call("m1/a", "c:1")).await.unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(failure.unwrap_err().starts_with("m1/a"));
    }

    // ============================================================================
    // Memtest Transport Tests
    // ============================================================================

    #[tokio::test]
    async fn test_memtest_delivery_by_tag() {
        let mem = MemTransport::new();
        let listener = mem
            .listen(&TransportConfig::memtest().with_dest("D0"), Arc::new(Echo))
            .await
            .unwrap();
        assert!(listener.local_addr().is_none());
        assert_eq!(mem.listener_count(), 1);

        let (context, mut rx) = context();
        let channel = mem
            .connect(&TransportConfig::memtest().with_dest("D0"), context)
            .await
            .unwrap();
        channel.send(call("m1/a", "foo:1")).await.unwrap();
        assert_eq!(next(&mut rx).await.meta.id, "m1/a");

        listener.close().await.unwrap();
        listener.close().await.unwrap();
        assert_eq!(mem.listener_count(), 0);
        assert!(matches!(
            channel.send(call("m2/a", "foo:1")).await,
            Err(MeshError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_memtest_tag_conflict_and_isolation() {
        let mem = MemTransport::new();
        let config = TransportConfig::memtest();
        let _first = mem.listen(&config, Arc::new(Echo)).await.unwrap();
        assert!(matches!(
            mem.listen(&config, Arc::new(Echo)).await,
            Err(MeshError::Bind { .. })
        ));

        // a separate registry does not see the listener
        let other = MemTransport::new();
        let (context, _rx) = context();
        let channel = other.connect(&config, context).await.unwrap();
        assert!(channel.send(call("m1/a", "a:1")).await.is_err());
    }

    #[test]
    fn test_transport_set() {
        let transports = Transports::default();
        for kind in [
            crate::config::TransportKind::Tcp,
            crate::config::TransportKind::Http,
            crate::config::TransportKind::Memtest,
        ] {
            assert_eq!(transports.get(kind).unwrap().kind(), kind);
        }
        assert!(Transports::empty()
            .get(crate::config::TransportKind::Tcp)
            .is_err());
    }
}
