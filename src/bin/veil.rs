//! veil demo binary
//!
//! Usage: veil [OPTIONS]
//!
//! Options:
//!   -g, --generate                          Generate a client/server config pair
//!   -s, --server <FILE> <ADDR>              Run an echo server
//!   -c, --client <FILE> <ADDR> <MSG> [N]    Send MSG to an echo server N times
//!   -h, --help                              Print help information

use std::env;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};

use veil::{Error, HandshakeClient, HandshakeServer, SecureConn, SessionId, TunnelConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug), defaults to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-s" | "--server" => {
            if args.len() < 4 {
                eprintln!("Error: --server requires a config file and a listen address");
                return Ok(());
            }
            run_server(&args[2], &args[3]).await?;
        }
        "-c" | "--client" => {
            if args.len() < 5 {
                eprintln!("Error: --client requires a config file, a server address and a message");
                return Ok(());
            }
            let count = match args.get(5) {
                Some(n) => n.parse().context("count must be a number")?,
                None => 1,
            };
            run_client(&args[2], &args[3], &args[4], count).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"veil - authenticated, traffic-shaped tunnel handshake

USAGE:
    veil [OPTIONS]

OPTIONS:
    -g, --generate                          Generate a client/server config pair
    -s, --server <FILE> <ADDR>              Run an echo server
    -c, --client <FILE> <ADDR> <MSG> [N]    Send MSG to an echo server N times
    -h, --help                              Print help information

EXAMPLES:
    Generate configurations (split the output into two files):
        veil --generate

    Run the echo server:
        veil --server server.toml 0.0.0.0:9000

    Send three pings, resuming after the first:
        veil --client client.toml 127.0.0.1:9000 ping 3
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let (mut client, mut server) = TunnelConfig::generate();
    client.fast_handshake = true;
    server.fast_handshake = true;

    println!("# veil configuration pair");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("# ---- client.toml ----");
    println!("{}", client.to_toml_string()?);
    println!("# ---- server.toml ----");
    println!("{}", server.to_toml_string()?);

    Ok(())
}

async fn run_server(config_path: &str, addr: &str) -> anyhow::Result<()> {
    let config = TunnelConfig::from_file(config_path)?;
    let server = Arc::new(HandshakeServer::new(
        Arc::new(config.identity()?),
        Arc::new(config.token_pool()),
        config.handshake_config(),
    ));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {}", addr))?;
    tracing::info!("Echo server listening on {}", addr);
    tracing::info!(
        "Handshake: {:?}, fast handshake: {}",
        config.handshake,
        config.fast_handshake
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            let conn = match server.accept(stream).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let session_id = conn.session_id();
            tracing::info!("Session {} from {}", session_id, peer);

            let (mut reader, mut writer) = conn.into_split();
            match tokio::io::copy(&mut reader, &mut writer).await {
                Ok(total) => tracing::info!("Session {} done, echoed {} bytes", session_id, total),
                Err(e) => tracing::warn!("Session {} failed: {}", session_id, e),
            }
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Session {} shutdown: {}", session_id, e);
            }
        });
    }
}

async fn run_client(config_path: &str, addr: &str, message: &str, count: usize) -> anyhow::Result<()> {
    let config = TunnelConfig::from_file(config_path)?;
    let client = HandshakeClient::new(
        Arc::new(config.identity()?),
        Arc::new(config.token_pool()),
        config.handshake_config(),
    );
    let session_id = SessionId::random();

    for i in 0..count {
        let conn = dial(&client, addr, session_id).await?;
        conn.write(message.as_bytes()).await?;

        let mut reply = vec![0u8; message.len()];
        let mut filled = 0;
        while filled < reply.len() {
            filled += conn.read(&mut reply[filled..]).await?;
        }
        println!("[{}] {}", i + 1, String::from_utf8_lossy(&reply));
        conn.close().await?;
    }

    Ok(())
}

/// Dial and handshake, redialing once with a full handshake if the server
/// no longer knows our resumption token.
async fn dial(
    client: &HandshakeClient,
    addr: &str,
    session_id: SessionId,
) -> anyhow::Result<SecureConn<TcpStream>> {
    for attempt in 0..2 {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("cannot connect to {}", addr))?;
        stream.set_nodelay(true)?;

        let mode = client.select_mode(session_id);
        match client.handshake(stream, mode).await {
            Ok(established) => {
                tracing::info!(
                    "Session {}: {:?} handshake",
                    established.session_id(),
                    established.kind()
                );
                return Ok(established.into_secure_conn());
            }
            Err(Error::TokenNotFound) if attempt == 0 => {
                tracing::info!("Resumption rejected, falling back to full handshake");
            }
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::bail!("handshake with {} failed", addr)
}
