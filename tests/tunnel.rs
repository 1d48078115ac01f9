//! End-to-end tunnel tests over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use veil::{
    Error, HandshakeClient, HandshakeConfig, HandshakeKind, HandshakeMethod, HandshakeServer,
    SecureConn, SessionId, TokenPool, TunnelConfig,
};

fn endpoints(fast: bool) -> (HandshakeClient, HandshakeServer) {
    endpoints_with(fast, HandshakeMethod::TwoRtt)
}

fn endpoints_with(fast: bool, method: HandshakeMethod) -> (HandshakeClient, HandshakeServer) {
    let (mut client, mut server) = TunnelConfig::generate();
    for config in [&mut client, &mut server] {
        config.fast_handshake = fast;
        config.handshake = method;
        config.drain_after_error = false;
        config.read_timeout_secs = 2;
    }

    let build_client = HandshakeClient::new(
        Arc::new(client.identity().unwrap()),
        Arc::new(client.token_pool()),
        client.handshake_config(),
    );
    let build_server = HandshakeServer::new(
        Arc::new(server.identity().unwrap()),
        Arc::new(server.token_pool()),
        server.handshake_config(),
    );
    (build_client, build_server)
}

/// Accept connections forever and echo everything back.
async fn spawn_echo(server: HandshakeServer) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(server);

    let handle = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let server = server.clone();
            tokio::spawn(async move {
                let conn = match server.accept(stream).await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let (mut reader, mut writer) = conn.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    (addr, handle)
}

async fn read_exactly(conn: &SecureConn<TcpStream>, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        filled += conn.read(&mut out[filled..]).await.unwrap();
    }
    out
}

#[tokio::test]
async fn test_ping_over_tcp() {
    let (client, server) = endpoints(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = server.accept(stream).await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        (conn.session_id(), buf[..n].to_vec())
    });

    let session_id = SessionId::random();
    let stream = TcpStream::connect(addr).await.unwrap();
    let conn = client.connect_session(stream, session_id).await.unwrap();
    assert_eq!(conn.session_id(), session_id);
    conn.write(b"ping").await.unwrap();

    let (server_sid, received) = accept.await.unwrap();
    assert_eq!(server_sid, session_id);
    assert_eq!(received, b"ping");
}

#[tokio::test]
async fn test_close_is_seen_within_timeout() {
    let (client, server) = endpoints(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = server.accept(stream).await.unwrap();
        let mut buf = [0u8; 16];
        tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("read did not finish after peer close")
    });

    let conn = client
        .connect(TcpStream::connect(addr).await.unwrap())
        .await
        .unwrap();
    conn.close().await.unwrap();

    assert!(matches!(accept.await.unwrap(), Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_large_echo() {
    let (client, server) = endpoints(false);
    let (addr, _server) = spawn_echo(server).await;

    let conn = Arc::new(
        client
            .connect(TcpStream::connect(&addr).await.unwrap())
            .await
            .unwrap(),
    );
    let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();

    let writer = {
        let conn = conn.clone();
        let data = data.clone();
        tokio::spawn(async move { conn.write(&data).await.unwrap() })
    };
    assert_eq!(read_exactly(&conn, data.len()).await, data);
    assert_eq!(writer.await.unwrap(), data.len());
}

#[tokio::test]
async fn test_resumption_over_tcp() {
    let (client, server) = endpoints(true);
    let (addr, _server) = spawn_echo(server).await;
    let session_id = SessionId::random();

    // First connection is full and leaves a token behind.
    let stream = TcpStream::connect(&addr).await.unwrap();
    let mode = client.select_mode(session_id);
    let established = client.handshake(stream, mode).await.unwrap();
    assert!(matches!(established.kind(), HandshakeKind::Full));
    assert_eq!(client.tokens().len(), 1);
    drop(established);

    // Second connection resumes and is handed a fresh token.
    let stream = TcpStream::connect(&addr).await.unwrap();
    let mode = client.select_mode(session_id);
    let established = client.handshake(stream, mode).await.unwrap();
    assert!(matches!(established.kind(), HandshakeKind::Fast));
    assert_eq!(established.session_id(), session_id);
    assert_eq!(client.tokens().len(), 1);

    let conn = established.into_secure_conn();
    conn.write(b"resumed").await.unwrap();
    assert_eq!(read_exactly(&conn, 7).await, b"resumed");
}

#[tokio::test]
async fn test_unknown_token_falls_back_to_full() {
    let (client, server) = endpoints(true);
    let identity = server.identity().clone();
    let config = server.config().clone();
    let (addr, first) = spawn_echo(server).await;

    client
        .connect(TcpStream::connect(&addr).await.unwrap())
        .await
        .unwrap();
    assert_eq!(client.tokens().len(), 1);
    first.abort();

    // A restarted server has forgotten every token it issued.
    let restarted = HandshakeServer::new(identity, Arc::new(TokenPool::new()), config);
    let (addr, _second) = spawn_echo(restarted).await;

    let result = client
        .connect(TcpStream::connect(&addr).await.unwrap())
        .await;
    assert!(matches!(result, Err(Error::TokenNotFound)));
    assert!(client.tokens().is_empty());

    let conn = client
        .connect(TcpStream::connect(&addr).await.unwrap())
        .await
        .unwrap();
    conn.write(b"again").await.unwrap();
    assert_eq!(read_exactly(&conn, 5).await, b"again");
}

#[tokio::test]
async fn test_mismatched_keys_fail_over_tcp() {
    let (client, _) = endpoints(false);
    let (_, stranger) = endpoints(false);
    let (addr, _server) = spawn_echo(stranger).await;

    // The stranger rejects the client's signature and hangs up.
    let result = client
        .connect(TcpStream::connect(&addr).await.unwrap())
        .await;
    assert!(result.is_err());
    assert!(client.tokens().is_empty());
}

#[tokio::test]
async fn test_one_rtt_over_tcp() {
    let (client, server) = endpoints_with(false, HandshakeMethod::OneRtt);
    let (addr, _server) = spawn_echo(server).await;

    let session_id = SessionId::random();
    let stream = TcpStream::connect(&addr).await.unwrap();
    let established = client
        .handshake(stream, client.select_mode(session_id))
        .await
        .unwrap();
    assert_eq!(established.kind(), HandshakeKind::OneRtt);

    let conn = established.into_secure_conn();
    conn.write(b"disguised").await.unwrap();
    assert_eq!(read_exactly(&conn, 9).await, b"disguised");
}

#[tokio::test]
async fn test_one_rtt_stranger_gets_404() {
    let (_, server) = endpoints_with(false, HandshakeMethod::OneRtt);
    let (addr, _server) = spawn_echo(server).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"POST /file?token=abc HTTP/1.1\r\nIndex: 900\r\nContent-Length: 200\r\n\r\n")
        .await
        .unwrap();
    stream.write_all(&[0u8; 200]).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut response))
        .await
        .expect("server kept the connection open")
        .unwrap();
    assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn test_stream_copy_over_tcp() {
    let (client, server) = endpoints(false);
    let (addr, _server) = spawn_echo(server).await;

    let mut conn = client
        .connect(TcpStream::connect(&addr).await.unwrap())
        .await
        .unwrap();
    let data: Vec<u8> = (0..300_000u32).map(|i| (i * 13 % 256) as u8).collect();

    let (mut reader, mut writer) = tokio::io::split(&mut conn);
    let send = async {
        let mut source = data.as_slice();
        tokio::io::copy(&mut source, &mut writer).await.unwrap();
        writer.shutdown().await.unwrap();
    };
    let receive = async {
        let mut echoed = Vec::new();
        reader.read_to_end(&mut echoed).await.unwrap();
        echoed
    };
    let ((), echoed) = tokio::join!(send, receive);
    assert_eq!(echoed, data);
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let (client, _) = TunnelConfig::generate();
    let path = std::env::temp_dir().join(format!("veil-test-{}.toml", SessionId::random()));
    std::fs::write(&path, client.to_toml_string().unwrap()).unwrap();

    let loaded = TunnelConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.private_key, client.private_key);
    let defaults = HandshakeConfig::default();
    assert_eq!(loaded.handshake_config().read_timeout, defaults.read_timeout);
    assert_eq!(loaded.handshake_config().fast_handshake, defaults.fast_handshake);
}
