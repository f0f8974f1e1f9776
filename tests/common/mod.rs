//! Test utilities and mocks for Sockmux
//!
//! This module provides common test utilities used across integration tests:
//! an echo target, SOCKS5 client helpers and a scripted remote relay peer
//! speaking the shared transport frame protocol.

#![allow(dead_code)]

use bytes::Bytes;
use sockmux::config::{ListenerConfig, RemoteConfig, SocksConfig};
use sockmux::protocol::{read_frame, write_frame, Command, Frame, RemoteStatus, TaskId};
use sockmux::socks::addr;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Listener config on an ephemeral loopback port
pub fn ephemeral_listener() -> ListenerConfig {
    ListenerConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
    }
}

/// Socks config with short timeouts
pub fn quick_socks() -> SocksConfig {
    SocksConfig {
        handshake_timeout: 2,
        connect_timeout: 2,
    }
}

/// Remote config pointing at `addr`
pub fn remote_config(addr: SocketAddr) -> RemoteConfig {
    RemoteConfig {
        addr: addr.to_string(),
        ack_timeout: 2,
        ..Default::default()
    }
}

/// Spawn a TCP server echoing everything back
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Wait until `probe` holds or the deadline passes
pub async fn eventually<F: FnMut() -> bool>(mut probe: F) -> bool {
    for _ in 0..100 {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    probe()
}

/// SOCKS5 CONNECT request for an IP target
pub fn connect_request(target: SocketAddr) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00];
    match target.ip() {
        IpAddr::V4(ip) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

/// SOCKS5 CONNECT request for a domain target
pub fn connect_domain_request(host: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

/// Negotiate no-auth with the proxy
pub async fn socks_greet(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut selected = [0u8; 2];
    stream.read_exact(&mut selected).await.unwrap();
    assert_eq!(selected, [0x05, 0x00]);
    stream
}

/// Run a full handshake and return the stream and the success reply
pub async fn socks_connect(proxy: SocketAddr, request: &[u8]) -> (TcpStream, [u8; 10]) {
    let mut stream = socks_greet(proxy).await;
    stream.write_all(request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    (stream, reply)
}

/// Read until EOF, failing the test if it takes too long
pub async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
        .await
        .expect("stream should reach EOF")
        .unwrap_or(0);
    rest
}

/// Scripted remote relay peer
///
/// Accepts any number of sessions. Each session must start with `AUTH`;
/// afterwards `NEW_TASK` is acknowledged, `CONNECT` dials the target from the
/// test process, `DATA` is forwarded and `CLOSE` shuts the target down.
pub struct FakeRelay {
    /// Address the relay listens on
    pub addr: SocketAddr,
    sessions: Arc<AtomicUsize>,
    authenticated: Arc<AtomicUsize>,
    tasks_closed: Arc<AtomicUsize>,
    kill: broadcast::Sender<()>,
}

impl FakeRelay {
    /// Start a relay accepting `username`/`password`
    pub async fn spawn(username: &str, password: &str) -> FakeRelay {
        let (listener, addr) = create_test_listener().await;
        let sessions = Arc::new(AtomicUsize::new(0));
        let authenticated = Arc::new(AtomicUsize::new(0));
        let tasks_closed = Arc::new(AtomicUsize::new(0));
        let (kill, _) = broadcast::channel(4);

        let creds = (username.to_string(), password.to_string());
        let relay = FakeRelay {
            addr,
            sessions: sessions.clone(),
            authenticated: authenticated.clone(),
            tasks_closed: tasks_closed.clone(),
            kill: kill.clone(),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                sessions.fetch_add(1, Ordering::SeqCst);
                let creds = creds.clone();
                let authenticated = authenticated.clone();
                let tasks_closed = tasks_closed.clone();
                let kill_rx = kill.subscribe();
                tokio::spawn(serve_session(
                    stream,
                    creds,
                    authenticated,
                    tasks_closed,
                    kill_rx,
                ));
            }
        });

        relay
    }

    /// Sessions accepted so far
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Sessions that passed authentication
    pub fn authenticated(&self) -> usize {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// `CLOSE` frames received from the client
    pub fn tasks_closed(&self) -> usize {
        self.tasks_closed.load(Ordering::SeqCst)
    }

    /// Drop every live session
    pub fn kill_sessions(&self) {
        let _ = self.kill.send(());
    }
}

async fn serve_session(
    stream: TcpStream,
    creds: (String, String),
    authenticated: Arc<AtomicUsize>,
    tasks_closed: Arc<AtomicUsize>,
    mut kill: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let auth = match read_frame(&mut reader).await {
        Ok(Some(frame)) if frame.command == Command::Auth => frame,
        _ => return,
    };
    let status = if auth_matches(&auth.payload, &creds) {
        RemoteStatus::Ok
    } else {
        RemoteStatus::BadCredentials
    };
    let _ = write_frame(&mut writer, &Frame::ack(Command::Auth, 0, status, &[])).await;
    if !status.is_ok() {
        return;
    }
    authenticated.fetch_add(1, Ordering::SeqCst);

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let mut targets: HashMap<TaskId, OwnedWriteHalf> = HashMap::new();

    loop {
        let frame = tokio::select! {
            _ = kill.recv() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => frame,
                _ => break,
            },
        };

        let tid = frame.tid;
        match frame.command {
            Command::NewTask => {
                let _ = out_tx
                    .send(Frame::ack(Command::NewTask, tid, RemoteStatus::Ok, &[]))
                    .await;
            }
            Command::Connect => match dial(&frame.payload).await {
                Some(stream) => {
                    let bound = match stream.local_addr() {
                        Ok(SocketAddr::V4(v4)) => {
                            let mut extra = v4.ip().octets().to_vec();
                            extra.extend_from_slice(&v4.port().to_be_bytes());
                            extra
                        }
                        _ => Vec::new(),
                    };
                    let (mut target_r, target_w) = stream.into_split();
                    targets.insert(tid, target_w);
                    let _ = out_tx
                        .send(Frame::ack(Command::Connect, tid, RemoteStatus::Ok, &bound))
                        .await;

                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        loop {
                            match target_r.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    let data = Bytes::copy_from_slice(&buf[..n]);
                                    if out_tx.send(Frame::data(tid, data)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        let _ = out_tx.send(Frame::close(tid)).await;
                    });
                }
                None => {
                    let _ = out_tx
                        .send(Frame::ack(
                            Command::Connect,
                            tid,
                            RemoteStatus::NoConnectionOnTask,
                            &[],
                        ))
                        .await;
                }
            },
            Command::Data => {
                if let Some(target) = targets.get_mut(&tid) {
                    let _ = target.write_all(&frame.payload).await;
                }
            }
            Command::Close => {
                tasks_closed.fetch_add(1, Ordering::SeqCst);
                if let Some(mut target) = targets.remove(&tid) {
                    let _ = target.shutdown().await;
                }
            }
            Command::Auth => break,
        }
    }

    writer_task.abort();
}

fn auth_matches(payload: &[u8], creds: &(String, String)) -> bool {
    let mut expected = vec![creds.0.len() as u8];
    expected.extend_from_slice(creds.0.as_bytes());
    expected.push(creds.1.len() as u8);
    expected.extend_from_slice(creds.1.as_bytes());
    payload == expected.as_slice()
}

async fn dial(payload: &[u8]) -> Option<TcpStream> {
    let (target, _) = addr::decode(payload, 0).ok()?;
    TcpStream::connect((target.host(), target.port())).await.ok()
}
