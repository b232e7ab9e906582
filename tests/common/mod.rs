#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use tpx_runtime::diagnostics::MemorySink;
use tpx_runtime::Engine;

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Engine whose diagnostics go to memory
pub fn quiet_engine() -> Engine {
    Engine::builder().diagnostic_sink(Arc::new(MemorySink::new())).build()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn brotli(data: &[u8]) -> Vec<u8> {
    let mut writer = brotli::CompressorWriter::new(Vec::new(), 4096, 5, 22);
    writer.write_all(data).unwrap();
    writer.into_inner()
}

/// Read an HTTP head (request line and headers) byte by byte
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap_or(0) == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// SHA-256 fingerprint of the fixture server certificate
pub fn server_fingerprint() -> String {
    let certs = tpx_runtime::tls::load_certs(&fixture("server.crt")).unwrap();
    tpx_runtime::tls::fingerprint(&certs[0].0)
}

/// HTTPS server presenting the fixture certificate; answers every request
/// with `body`. Returns its address and a count of accepted connections.
pub async fn tls_server(body: &'static str) -> (SocketAddr, Arc<Mutex<usize>>) {
    let certs = tpx_runtime::tls::load_certs(&fixture("server.crt")).unwrap();
    let key = tpx_runtime::tls::load_private_key(&fixture("server.key")).unwrap();
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(Mutex::new(0usize));

    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else { return };
            *counter.lock().unwrap() += 1;
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else { return };
                let _ = read_head(&mut tls).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = tls.write_all(response.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    (addr, connections)
}

/// HTTP proxy that only understands CONNECT. Records each request head and
/// answers with `status`; on 200 the tunnel is spliced to the requested target.
pub async fn connect_proxy(status: u16) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let heads = Arc::new(Mutex::new(Vec::new()));

    let seen = heads.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else { return };
            let seen = seen.clone();
            tokio::spawn(async move {
                let head = read_head(&mut client).await;
                seen.lock().unwrap().push(head.clone());
                let target = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                if status != 200 {
                    let reply = format!("HTTP/1.1 {} Rejected\r\nContent-Length: 0\r\n\r\n", status);
                    let _ = client.write_all(reply.as_bytes()).await;
                    return;
                }
                let Ok(mut upstream) = TcpStream::connect(target.as_str()).await else { return };
                let _ = client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await;
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });
    (addr, heads)
}

/// Forward proxy for plain HTTP: records the request head and answers itself
pub async fn forward_proxy(body: &'static str) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let heads = Arc::new(Mutex::new(Vec::new()));

    let seen = heads.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else { return };
            let seen = seen.clone();
            tokio::spawn(async move {
                let head = read_head(&mut client).await;
                seen.lock().unwrap().push(head);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = client.write_all(response.as_bytes()).await;
            });
        }
    });
    (addr, heads)
}

/// What a SOCKS5 client asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub credentials: Option<(String, String)>,
    pub atyp: u8,
    pub host: String,
    pub port: u16,
}

/// Minimal SOCKS5 server (no-auth or username/password, CONNECT only)
pub async fn socks5_server(require_auth: bool) -> (SocketAddr, Arc<Mutex<Vec<SocksRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let seen = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else { return };
            let seen = seen.clone();
            tokio::spawn(async move {
                if let Some((request, mut upstream)) = socks5_accept(&mut client, require_auth).await {
                    seen.lock().unwrap().push(request);
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                }
            });
        }
    });
    (addr, requests)
}

async fn socks5_accept(client: &mut TcpStream, require_auth: bool) -> Option<(SocksRequest, TcpStream)> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await.ok()?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await.ok()?;

    let mut credentials = None;
    if require_auth {
        if !methods.contains(&0x02) {
            client.write_all(&[0x05, 0xff]).await.ok()?;
            return None;
        }
        client.write_all(&[0x05, 0x02]).await.ok()?;
        let mut version = [0u8; 2];
        client.read_exact(&mut version).await.ok()?;
        let mut user = vec![0u8; version[1] as usize];
        client.read_exact(&mut user).await.ok()?;
        let mut plen = [0u8; 1];
        client.read_exact(&mut plen).await.ok()?;
        let mut pass = vec![0u8; plen[0] as usize];
        client.read_exact(&mut pass).await.ok()?;
        client.write_all(&[0x01, 0x00]).await.ok()?;
        credentials = Some((
            String::from_utf8_lossy(&user).into_owned(),
            String::from_utf8_lossy(&pass).into_owned(),
        ));
    } else {
        client.write_all(&[0x05, 0x00]).await.ok()?;
    }

    let mut header = [0u8; 4];
    client.read_exact(&mut header).await.ok()?;
    let atyp = header[3];
    let host = match atyp {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await.ok()?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await.ok()?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await.ok()?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => return None,
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await.ok()?;
    let port = u16::from_be_bytes(port);

    let upstream = TcpStream::connect((host.as_str(), port)).await.ok()?;
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await
        .ok()?;
    Some((
        SocksRequest {
            credentials,
            atyp,
            host,
            port,
        },
        upstream,
    ))
}
