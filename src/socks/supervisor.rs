//! Per-connection supervision
//!
//! A [`ConnectionSupervisor`] owns one accepted client socket from the first
//! byte to teardown: it feeds client bytes to the [`HandshakeEngine`],
//! resolves the CONNECT target, sends the success reply and runs the relay.
//! Every failure is scoped to this connection and tears it down once.

use super::addr::ParsedAddress;
use super::consts::DEFAULT_BUFFER_SIZE;
use super::handshake::{ConnectionState, HandshakeEngine, HandshakeEvent};
use super::relay::{relay, RelayStats, StreamSink, StreamSource};
use super::resolver::{Peer, TargetResolver};
use crate::error::Socks5Error;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Owns one client connection
pub struct ConnectionSupervisor<S> {
    id: u64,
    client: S,
    engine: HandshakeEngine,
    resolver: Arc<dyn TargetResolver>,
    handshake_timeout: Duration,
    client_shut: bool,
}

impl<S> ConnectionSupervisor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a supervisor for an accepted client socket
    pub fn new(
        id: u64,
        client: S,
        resolver: Arc<dyn TargetResolver>,
        handshake_timeout: Duration,
    ) -> Self {
        ConnectionSupervisor {
            id,
            client,
            engine: HandshakeEngine::new(),
            resolver,
            handshake_timeout,
            client_shut: false,
        }
    }

    /// Connection id used in logs
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current protocol state
    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Drive the connection to completion
    ///
    /// Returns the relay byte counts, or the error that closed the connection.
    pub async fn run(mut self) -> Result<RelayStats, Socks5Error> {
        let target = match tokio::time::timeout(self.handshake_timeout, self.negotiate()).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => return Err(self.abort(e).await),
            Err(_) => {
                let e = io::Error::new(io::ErrorKind::TimedOut, "handshake timed out");
                return Err(self.abort(e.into()).await);
            }
        };

        info!(
            "[{}] CONNECT {} via {} resolver",
            self.id,
            target,
            self.resolver.name()
        );

        let established = match self.resolver.establish(&target).await {
            Ok(established) => established,
            Err(e) => return Err(self.abort(e).await),
        };

        let (reply, pipelined) = match self.engine.establish(established.bound) {
            Ok(parts) => parts,
            Err(e) => return Err(self.abort(e).await),
        };

        // On failure `established` is dropped here, which closes the peer.
        if let Err(e) = write_reply(&mut self.client, &reply).await {
            return Err(self.abort(e.into()).await);
        }

        debug!("[{}] Established, bound {}", self.id, established.bound);

        let id = self.id;
        let (client_r, client_w) = tokio::io::split(self.client);
        let client_rx = StreamSource::new(client_r);
        let client_tx = StreamSink::new(client_w);

        let result = match established.peer {
            Peer::Direct(stream) => {
                let (peer_r, peer_w) = stream.into_split();
                relay(
                    client_rx,
                    client_tx,
                    StreamSource::new(peer_r),
                    StreamSink::new(peer_w),
                    pipelined,
                )
                .await
            }
            Peer::Task(task) => {
                let (peer_tx, peer_rx) = task.into_split();
                relay(client_rx, client_tx, peer_rx, peer_tx, pipelined).await
            }
        };
        self.engine.close();

        match result {
            Ok(stats) => {
                info!(
                    "[{}] Closed {}: {} bytes up, {} bytes down",
                    id, target, stats.client_to_peer, stats.peer_to_client
                );
                Ok(stats)
            }
            Err(e) => {
                debug!("[{}] Relay to {} ended with error: {}", id, target, e);
                Err(Socks5Error::Transport(e))
            }
        }
    }

    /// Read and answer the handshake until a CONNECT target is decoded
    async fn negotiate(&mut self) -> Result<ParsedAddress, Socks5Error> {
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            while let Some(event) = self.engine.poll()? {
                match event {
                    HandshakeEvent::MethodSelected(reply) => {
                        write_reply(&mut self.client, &reply).await?;
                        debug!("[{}] Selected no-auth method", self.id);
                    }
                    HandshakeEvent::ConnectRequested(target) => return Ok(target),
                }
            }

            let n = self.client.read(&mut buf).await?;
            if n == 0 {
                return Err(Socks5Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed during handshake",
                )));
            }
            self.engine.feed(&buf[..n])?;
        }
    }

    /// Close the connection before relaying started
    ///
    /// Shuts the client socket down at most once and hands `err` back.
    async fn abort(&mut self, err: Socks5Error) -> Socks5Error {
        self.engine.close();
        if !self.client_shut {
            self.client_shut = true;
            if let Err(e) = self.client.shutdown().await {
                debug!("[{}] Client shutdown failed: {}", self.id, e);
            }
        }

        if err.is_protocol() {
            warn!("[{}] Rejected client: {}", self.id, err);
        } else {
            debug!("[{}] Connection failed: {}", self.id, err);
        }
        err
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &[u8]) -> io::Result<()> {
    writer.write_all(reply).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::resolver::Established;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::io::Builder;

    /// Resolver dialing a fixed local listener and counting calls
    #[derive(Debug)]
    struct FixedResolver {
        target: Option<SocketAddr>,
        calls: AtomicUsize,
    }

    impl FixedResolver {
        fn new(target: Option<SocketAddr>) -> Arc<Self> {
            Arc::new(FixedResolver {
                target,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TargetResolver for FixedResolver {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn establish(&self, target: &ParsedAddress) -> Result<Established, Socks5Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let addr = self
                .target
                .ok_or_else(|| Socks5Error::UpstreamUnreachable(target.to_string()))?;
            let stream = TcpStream::connect(addr).await?;
            let bound = stream.local_addr()?;
            Ok(Established {
                peer: Peer::Direct(stream),
                bound,
            })
        }
    }

    fn connect_request(port: u16) -> Vec<u8> {
        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&port.to_be_bytes());
        request
    }

    #[tokio::test]
    async fn test_version_mismatch_sends_nothing() {
        let client = Builder::new().read(&[0x04, 0x01, 0x00]).build();
        let resolver = FixedResolver::new(None);

        let supervisor =
            ConnectionSupervisor::new(1, client, resolver.clone(), Duration::from_secs(1));
        let err = supervisor.run().await.unwrap_err();

        assert!(matches!(err, Socks5Error::ProtocolVersionMismatch(4)));
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_methods_offered() {
        let client = Builder::new().read(&[0x05, 0x00]).build();
        let resolver = FixedResolver::new(None);

        let err = ConnectionSupervisor::new(2, client, resolver, Duration::from_secs(1))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::NoMethodsOffered));
    }

    #[tokio::test]
    async fn test_unsupported_command_never_dials() {
        let client = Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .build();
        let resolver = FixedResolver::new(None);

        let err = ConnectionSupervisor::new(3, client, resolver.clone(), Duration::from_secs(1))
            .run()
            .await
            .unwrap_err();

        assert_eq!(format!("{}", err), "Command not supported: 2 (bind)");
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_request_version_mismatch() {
        let client = Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x04, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .build();

        let err = ConnectionSupervisor::new(4, client, FixedResolver::new(None), Duration::from_secs(1))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::ProtocolVersionMismatch(4)));
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_without_reply() {
        let client = Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&connect_request(80))
            .build();
        let resolver = FixedResolver::new(None);

        let err = ConnectionSupervisor::new(5, client, resolver.clone(), Duration::from_secs(1))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Socks5Error::UpstreamUnreachable(_)));
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_client_eof_during_handshake() {
        let client = Builder::new().read(&[0x05, 0x01]).build();

        let err = ConnectionSupervisor::new(6, client, FixedResolver::new(None), Duration::from_secs(1))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (client, _keep_open) = duplex(64);

        let err = ConnectionSupervisor::new(
            7,
            client,
            FixedResolver::new(None),
            Duration::from_millis(50),
        )
        .run()
        .await
        .unwrap_err();

        match err {
            Socks5Error::Transport(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_fragmented_handshake_relays() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        let (mut client, server_side) = duplex(1024);
        let supervisor = ConnectionSupervisor::new(
            8,
            server_side,
            FixedResolver::new(Some(target_addr)),
            Duration::from_secs(5),
        );
        let handle = tokio::spawn(supervisor.run());

        // Method negotiation split across writes.
        client.write_all(&[0x05]).await.unwrap();
        client.write_all(&[0x01, 0x00]).await.unwrap();
        let mut selected = [0u8; 2];
        client.read_exact(&mut selected).await.unwrap();
        assert_eq!(selected, [0x05, 0x00]);

        // Request split mid-address, followed by pipelined payload.
        let request = connect_request(target_addr.port());
        client.write_all(&request[..5]).await.unwrap();
        let mut rest = request[5..].to_vec();
        rest.extend_from_slice(b"early");
        client.write_all(&rest).await.unwrap();

        let (mut upstream, peer_addr) = target.accept().await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), peer_addr.port());

        let mut early = [0u8; 5];
        upstream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");

        upstream.write_all(b"answer").await.unwrap();
        let mut answer = [0u8; 6];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"answer");

        // Peer closes; the client side is shut down and the supervisor ends.
        drop(upstream);
        let mut tail = Vec::new();
        client.read_to_end(&mut tail).await.unwrap();
        assert!(tail.is_empty());

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.client_to_peer, 5);
        assert_eq!(stats.peer_to_client, 6);
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let (client, mut other) = duplex(64);
        let mut supervisor = ConnectionSupervisor::new(
            9,
            client,
            FixedResolver::new(Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 1)))),
            Duration::from_secs(1),
        );

        supervisor.abort(Socks5Error::NoMethodsOffered).await;
        supervisor.abort(Socks5Error::NoMethodsOffered).await;
        assert_eq!(supervisor.state(), ConnectionState::Closed);

        let mut tail = Vec::new();
        other.read_to_end(&mut tail).await.unwrap();
        assert!(tail.is_empty());
    }
}
