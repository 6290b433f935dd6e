//! Connection lifecycle and reconnection against an in-memory server

mod common;

use async_trait::async_trait;
use common::{init_tracing, next_event, wait_for_state, Behavior, FakeServer, ServerEvent, AUTH};
use revtun_client::{
    ClientConfig, ClientConfigBuilder, ConnectionState, Connector, TunnelClient, TunnelError,
};
use revtun_session::{length_delimited, BoxTransport};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{duplex, DuplexStream};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn base_config() -> ClientConfigBuilder {
    ClientConfig::builder()
        .server("tunnel.example.com")
        .auth(AUTH)
        .remote("R:2222:localhost:22")
        .remote("3000:internal:80")
        .retry_interval(ms(20), ms(1000))
}

fn client(config: ClientConfig, server: &Arc<FakeServer>) -> TunnelClient {
    TunnelClient::with_connector(config, server.clone()).unwrap()
}

/// Dials that never complete
struct StalledDial;

#[async_trait]
impl Connector for StalledDial {
    async fn connect(&self) -> Result<BoxTransport, TunnelError> {
        std::future::pending().await
    }
}

/// Hands out transports whose peer never says anything
#[derive(Default)]
struct SilentPeer {
    peers: Mutex<Vec<DuplexStream>>,
}

#[async_trait]
impl Connector for SilentPeer {
    async fn connect(&self) -> Result<BoxTransport, TunnelError> {
        let (client_io, server_io) = duplex(64 * 1024);
        self.peers.lock().unwrap().push(server_io);
        Ok(Box::new(length_delimited(client_io)))
    }
}

/// Close, then expect the client to finish within a second
async fn close_promptly(client: &TunnelClient) {
    let started = Instant::now();
    client.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), client.wait())
        .await
        .expect("close did not stop the client")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.state(), ConnectionState::Stopped);
}

/// Gaps between consecutive dials
fn dial_gaps(server: &FakeServer) -> Vec<Duration> {
    server
        .dial_times()
        .windows(2)
        .map(|w| w[1].duration_since(w[0]))
        .collect()
}

#[tokio::test]
async fn test_connects_and_publishes_session() {
    init_tracing();

    let (server, mut events) = FakeServer::new();
    let server = Arc::new(server);
    let client = client(base_config().build().unwrap(), &server);

    client.start();
    let state = wait_for_state(&client, ConnectionState::is_connected).await;
    assert_eq!(
        state,
        ConnectionState::Connected {
            fingerprint: server.fingerprint()
        }
    );

    // The server received exactly the configured rules, in order
    assert_eq!(
        next_event(&mut events).await,
        ServerEvent::Config(client.rules().to_vec())
    );

    let session = client.session().await.expect("session published");
    assert_eq!(session.fingerprint(), server.fingerprint());
    assert!(!session.is_closed());

    client.close().await.unwrap();
    client.wait().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Stopped);
    assert!(client.session().await.is_none());
    assert!(session.is_closed());
    assert_eq!(server.dial_count(), 1);
}

#[tokio::test]
async fn test_fingerprint_prefix_accepted() {
    let (server, mut events) = FakeServer::new();
    let server = Arc::new(server);
    let prefix = server.fingerprint()[..11].to_string();
    let client = client(base_config().fingerprint(prefix).build().unwrap(), &server);

    client.start();
    wait_for_state(&client, ConnectionState::is_connected).await;
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_fingerprint_mismatch_stops_before_config() {
    let (server, mut events) = FakeServer::new();
    let server = Arc::new(server);
    let client = client(base_config().fingerprint("zz:zz").build().unwrap(), &server);

    let err = client.run().await.unwrap_err();
    match err {
        TunnelError::FingerprintMismatch { expected, actual } => {
            assert_eq!(expected, "zz:zz");
            assert_eq!(actual, server.fingerprint());
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(server.dial_count(), 1);
    assert!(events.try_recv().is_err());
    assert_eq!(client.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_config_rejection_is_fatal() {
    let (server, _events) = FakeServer::new();
    let server = Arc::new(server.then(Behavior::RejectConfig("unsupported rule: udp".into())));
    let client = client(base_config().build().unwrap(), &server);

    client.start();
    // Every waiter sees the same terminal error
    let (first, second) = tokio::join!(client.wait(), client.wait());
    let expected = TunnelError::ConfigRejected("unsupported rule: udp".to_string());
    assert_eq!(first.unwrap_err(), expected);
    assert_eq!(second.unwrap_err(), expected);
    assert_eq!(server.dial_count(), 1);
}

#[tokio::test]
async fn test_authentication_failure_not_retried() {
    let (server, _events) = FakeServer::new();
    let server = Arc::new(server.then(Behavior::RejectAuth));
    let client = client(base_config().build().unwrap(), &server);

    let err = client.run().await.unwrap_err();
    assert!(matches!(err, TunnelError::AuthenticationFailed(_)), "{err}");
    assert_eq!(server.dial_count(), 1);
}

#[tokio::test]
async fn test_dial_failures_back_off() {
    init_tracing();

    let (server, _events) = FakeServer::new();
    let server = Arc::new(server.fail_first(4));
    let client = client(base_config().build().unwrap(), &server);

    client.start();
    wait_for_state(&client, ConnectionState::is_connected).await;
    assert_eq!(server.dial_count(), 5);

    // 20ms, 40ms, 80ms, 160ms
    for (i, gap) in dial_gaps(&server).into_iter().enumerate() {
        let expected = ms(20) * 2u32.pow(i as u32);
        assert!(gap >= expected, "gap {i} was {gap:?}, expected >= {expected:?}");
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_interrupts_backoff() {
    let (server, _events) = FakeServer::new();
    let server = Arc::new(server.fail_first(usize::MAX));
    let config = base_config()
        .retry_interval(Duration::from_secs(10), Duration::from_secs(10))
        .build()
        .unwrap();
    let client = client(config, &server);

    client.start();
    let state = wait_for_state(&client, |s| {
        matches!(s, ConnectionState::Disconnected { retry_in: Some(_) })
    })
    .await;
    assert_eq!(
        state,
        ConnectionState::Disconnected {
            retry_in: Some(Duration::from_secs(10))
        }
    );

    let started = Instant::now();
    client.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), client.wait())
        .await
        .expect("close did not interrupt the backoff")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(server.dial_count(), 1);
}

#[tokio::test]
async fn test_graceful_disconnect_redials_immediately() {
    init_tracing();

    let (server, mut events) = FakeServer::new();
    let server = Arc::new(server.then(Behavior::CloseAfterConfig { graceful: true }));
    let config = base_config()
        .retry_interval(ms(500), Duration::from_secs(2))
        .build()
        .unwrap();
    let client = client(config, &server);

    client.start();
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));
    wait_for_state(&client, ConnectionState::is_connected).await;

    assert_eq!(server.dial_count(), 2);
    let gaps = dial_gaps(&server);
    assert!(gaps[0] < ms(500), "redial waited {:?}", gaps[0]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_abnormal_disconnect_waits_for_backoff() {
    init_tracing();

    let (server, mut events) = FakeServer::new();
    let server = Arc::new(server.then(Behavior::CloseAfterConfig { graceful: false }));
    let config = base_config()
        .retry_interval(ms(300), Duration::from_secs(2))
        .build()
        .unwrap();
    let client = client(config, &server);

    client.start();
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));

    assert_eq!(server.dial_count(), 2);
    let gaps = dial_gaps(&server);
    assert!(gaps[0] >= ms(300), "redial after {:?}", gaps[0]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_server_requests_and_channels_refused() {
    let (server, mut events) = FakeServer::new();
    let server = Arc::new(server.then(Behavior::Probe));
    let client = client(base_config().build().unwrap(), &server);

    client.start();
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));
    assert_eq!(
        next_event(&mut events).await,
        ServerEvent::Probed {
            request_accepted: false,
            channel_refused: true,
        }
    );

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (server, _events) = FakeServer::new();
    let server = Arc::new(server);
    let client = client(base_config().build().unwrap(), &server);

    client.start();
    wait_for_state(&client, ConnectionState::is_connected).await;

    client.close().await.unwrap();
    client.close().await.unwrap();
    client.wait().await.unwrap();

    // Starting again after close does nothing
    client.start();
    assert_eq!(client.state(), ConnectionState::Stopped);
    assert_eq!(server.dial_count(), 1);
}

#[tokio::test]
async fn test_keepalive_pings_current_session() {
    let (server, mut events) = FakeServer::new();
    let server = Arc::new(server);
    let config = base_config().keepalive(ms(50)).build().unwrap();
    let client = client(config, &server);

    client.start();
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));
    assert_eq!(next_event(&mut events).await, ServerEvent::Ping);
    assert_eq!(next_event(&mut events).await, ServerEvent::Ping);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_configuration_makes_no_dials() {
    let (server, _events) = FakeServer::new();
    let server = Arc::new(server);

    let bad_url = ClientConfig {
        server: "gopher://tunnel.example.com".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        TunnelClient::with_connector(bad_url, server.clone()),
        Err(TunnelError::InvalidServerUrl(_))
    ));

    let bad_rule = ClientConfig {
        server: "tunnel.example.com".to_string(),
        remotes: vec!["3000".to_string(), "R:99999".to_string()],
        ..Default::default()
    };
    let err = TunnelClient::with_connector(bad_rule, server.clone()).unwrap_err();
    assert!(matches!(err, TunnelError::InvalidRemoteSpec { ref spec, .. } if spec == "R:99999"));

    assert_eq!(server.dial_count(), 0);
}

#[tokio::test]
async fn test_close_interrupts_dial() {
    let client = TunnelClient::with_connector(base_config().build().unwrap(), Arc::new(StalledDial))
        .unwrap();

    client.start();
    wait_for_state(&client, |s| matches!(s, ConnectionState::Dialing { .. })).await;
    close_promptly(&client).await;
}

#[tokio::test]
async fn test_close_interrupts_handshake() {
    let connector = Arc::new(SilentPeer::default());
    let client = TunnelClient::with_connector(base_config().build().unwrap(), connector.clone())
        .unwrap();

    client.start();
    wait_for_state(&client, |s| *s == ConnectionState::Handshaking).await;
    close_promptly(&client).await;
    assert_eq!(connector.peers.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_successful_connection_resets_backoff() {
    init_tracing();

    let (server, mut events) = FakeServer::new();
    let server = Arc::new(
        server
            .fail_first(4)
            .then(Behavior::CloseAfterConfig { graceful: false }),
    );
    let config = base_config()
        .retry_interval(ms(50), Duration::from_secs(10))
        .build()
        .unwrap();
    let client = client(config, &server);

    client.start();
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));
    assert!(matches!(next_event(&mut events).await, ServerEvent::Config(_)));
    assert_eq!(server.dial_count(), 6);

    // 50ms, 100ms, 200ms, 400ms, then back to the minimum
    let gaps = dial_gaps(&server);
    assert!(gaps[3] >= ms(400), "last failure gap was {:?}", gaps[3]);
    assert!(gaps[4] >= ms(50), "redial after {:?}", gaps[4]);
    assert!(gaps[4] < ms(400), "backoff not reset, redial after {:?}", gaps[4]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_reports_transport_close_error() {
    let (server, _events) = FakeServer::new();
    let server = Arc::new(server.then(Behavior::BrokenClose));
    let client = client(base_config().build().unwrap(), &server);

    client.start();
    wait_for_state(&client, ConnectionState::is_connected).await;

    let err = client.close().await.unwrap_err();
    assert!(matches!(err, TunnelError::Session(_)), "{err}");
    client.wait().await.unwrap();
    assert_eq!(server.dial_count(), 1);
}
