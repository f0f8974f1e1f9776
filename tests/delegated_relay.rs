//! End-to-end tests for the delegated resolver over the shared transport

mod common;

use common::*;
use sockmux::client::RemoteSession;
use sockmux::config::ResolverType;
use sockmux::helper::RetryConfig;
use sockmux::socks::{create_resolver, ListenerFront};
use sockmux::{Config, TaskBroker};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

fn delegated_config(relay: &FakeRelay) -> Config {
    let mut config = Config {
        listener: ephemeral_listener(),
        socks: quick_socks(),
        remote: remote_config(relay.addr),
        ..Default::default()
    };
    config.resolver.resolver_type = ResolverType::Delegated;
    config
}

async fn start_delegated(relay: &FakeRelay) -> (ListenerFront, std::sync::Arc<TaskBroker>) {
    let config = delegated_config(relay);
    let broker = TaskBroker::connect(&config.remote).await.unwrap();
    let resolver = create_resolver(&config, Some(broker.clone())).unwrap();
    let front = ListenerFront::start(&config.listener, &config.socks, resolver)
        .await
        .unwrap();
    (front, broker)
}

#[tokio::test]
async fn test_echo_through_task() {
    let relay = FakeRelay::spawn("admin", "adminpw").await;
    let echo = spawn_echo_server().await;
    let (front, broker) = start_delegated(&relay).await;

    let (mut client, reply) = socks_connect(front.local_addr(), &connect_request(echo)).await;
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
    assert_eq!(broker.live_tasks(), 1);

    client.write_all(b"multiplexed").await.unwrap();
    let mut buf = [0u8; 11];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"multiplexed");

    drop(client);
    assert!(eventually(|| broker.live_tasks() == 0).await);
    assert!(eventually(|| relay.tasks_closed() == 1).await);

    front.stop().await;
}

#[tokio::test]
async fn test_many_clients_share_one_session() {
    let relay = FakeRelay::spawn("admin", "adminpw").await;
    let echo = spawn_echo_server().await;
    let (front, broker) = start_delegated(&relay).await;
    let proxy = front.local_addr();

    let mut handles = Vec::new();
    for i in 0..8u8 {
        handles.push(tokio::spawn(async move {
            let (mut client, _) = socks_connect(proxy, &connect_request(echo)).await;
            let payload = vec![i; 1024];
            client.write_all(&payload).await.unwrap();
            let mut buf = vec![0u8; 1024];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, payload);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(relay.sessions(), 1);
    assert!(eventually(|| broker.live_tasks() == 0).await);
    front.stop().await;
}

#[tokio::test]
async fn test_target_close_reaches_client() {
    let relay = FakeRelay::spawn("admin", "adminpw").await;
    let (target, target_addr) = create_test_listener().await;
    let (front, broker) = start_delegated(&relay).await;

    let (mut client, _) = socks_connect(front.local_addr(), &connect_request(target_addr)).await;
    let (mut upstream, _) = target.accept().await.unwrap();

    upstream.write_all(b"last words").await.unwrap();
    drop(upstream);

    assert_eq!(read_to_eof(&mut client).await, b"last words");
    assert!(eventually(|| broker.live_tasks() == 0).await);
    front.stop().await;
}

#[tokio::test]
async fn test_remote_dial_failure_closes_client() {
    let relay = FakeRelay::spawn("admin", "adminpw").await;
    let (target, target_addr) = create_test_listener().await;
    drop(target);
    let (front, broker) = start_delegated(&relay).await;

    let mut client = socks_greet(front.local_addr()).await;
    client.write_all(&connect_request(target_addr)).await.unwrap();

    assert!(read_to_eof(&mut client).await.is_empty());
    assert!(eventually(|| broker.live_tasks() == 0).await);
    front.stop().await;
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let relay = FakeRelay::spawn("admin", "other").await;
    let config = delegated_config(&relay);

    let err = TaskBroker::connect(&config.remote).await.err().unwrap();
    assert!(format!("{:#}", err).contains("Bad username or password"));
    assert_eq!(relay.authenticated(), 0);
}

#[tokio::test]
async fn test_session_loss_closes_tasks() {
    let relay = FakeRelay::spawn("admin", "adminpw").await;
    let (target, target_addr) = create_test_listener().await;
    let (front, broker) = start_delegated(&relay).await;

    let (mut client, _) = socks_connect(front.local_addr(), &connect_request(target_addr)).await;
    let _upstream = target.accept().await.unwrap();

    relay.kill_sessions();

    tokio::time::timeout(Duration::from_secs(2), broker.closed())
        .await
        .expect("session should end");
    assert!(read_to_eof(&mut client).await.is_empty());
    front.stop().await;
}

#[tokio::test]
async fn test_remote_session_reconnects() {
    let relay = FakeRelay::spawn("admin", "adminpw").await;
    let echo = spawn_echo_server().await;

    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut config = delegated_config(&relay);
    config.listener.port = port;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let session = RemoteSession::new(config).with_retry(RetryConfig {
        max_retries: 0,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
    });
    let handle = tokio::spawn(async move { session.run(&mut shutdown_rx).await });

    assert!(eventually(|| relay.authenticated() == 1).await);
    let proxy: std::net::SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut ready = false;
    for _ in 0..50 {
        if TcpStream::connect(proxy).await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ready);

    relay.kill_sessions();
    assert!(eventually(|| relay.authenticated() == 2).await);

    // The listener is back and serves through the new session.
    let mut served = false;
    for _ in 0..50 {
        if let Ok(mut stream) = TcpStream::connect(proxy).await {
            stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut selected = [0u8; 2];
            if stream.read_exact(&mut selected).await.is_ok() {
                stream.write_all(&connect_request(echo)).await.unwrap();
                let mut reply = [0u8; 10];
                if stream.read_exact(&mut reply).await.is_ok() {
                    served = true;
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(served);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
