//! End-to-end session tests over real loopback transports.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use gnss_bridge::{
    ConnectionState, EndpointKind, InputConfig, OutputConfig, OutputKind, Session,
    SessionConfig, SessionEvent, SessionState,
};

const GGA: &str =
    "$GNGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,47.0,M,,*51\r\n";
const RMC: &str =
    "$GNRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*74\r\n";

const WAIT: Duration = Duration::from_secs(5);

/// Grab an unused loopback UDP port.  The socket is dropped before use,
/// so a clash is possible but vanishingly unlikely in practice.
fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_for_event<F>(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut pred: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let ev = events.recv().await.expect("event channel closed");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

#[tokio::test]
async fn udp_in_to_udp_and_file_out() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let recv_port = receiver.local_addr().unwrap().port();
    let in_port = free_udp_port();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("nmea.log");

    let config = SessionConfig {
        input: InputConfig::Udp {
            port: in_port,
            bind: Some("127.0.0.1".parse().unwrap()),
        },
        outputs: vec![
            OutputConfig::enabled(OutputKind::Udp {
                host:      "127.0.0.1".into(),
                port:      recv_port,
                broadcast: false,
            }),
            OutputConfig::enabled(OutputKind::File {
                path:           log_path.clone(),
                timestamp_name: false,
            }),
        ],
        filter:     None,
        rate_limit: None,
    };

    let (mut session, mut events) = Session::new();
    session.start(config).await.unwrap();
    assert_eq!(session.state(), SessionState::Running);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let chunk = format!("{GGA}{RMC}");
    client
        .send_to(chunk.as_bytes(), ("127.0.0.1", in_port))
        .await
        .unwrap();

    // Both frames come out of the datagram sink, byte-identical.
    let mut buf = [0u8; 256];
    let (n, _) = timeout(WAIT, receiver.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], GGA.as_bytes());
    let (n, _) = timeout(WAIT, receiver.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], RMC.as_bytes());

    // The file sink runs its own writer; give it until it has both lines.
    wait_until(|| {
        std::fs::read_to_string(&log_path)
            .map(|s| s.len() == chunk.len())
            .unwrap_or(false)
    })
    .await;

    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(std::fs::read_to_string(&log_path).unwrap(), chunk);

    let snap = session.statistics();
    assert_eq!(snap.sentences_received, 2);
    assert_eq!(snap.bytes_received, chunk.len() as u64);
    assert_eq!(snap.sentences_sent, 4); // two sinks, two frames each
    assert_eq!(snap.checksum_errors, 0);
    assert!(snap.last_data.is_some());

    let mut states = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if let SessionEvent::StateChanged { new, .. } = ev {
            states.push(new);
        }
    }
    assert_eq!(
        states,
        vec![
            SessionState::Starting,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Stopped,
        ]
    );
}

#[tokio::test]
async fn checksum_failures_never_reach_sinks() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let recv_port = receiver.local_addr().unwrap().port();
    let in_port = free_udp_port();

    let config = SessionConfig {
        input: InputConfig::Udp {
            port: in_port,
            bind: Some("127.0.0.1".parse().unwrap()),
        },
        outputs: vec![OutputConfig::enabled(OutputKind::Udp {
            host:      "127.0.0.1".into(),
            port:      recv_port,
            broadcast: false,
        })],
        filter:     None,
        rate_limit: None,
    };

    let (mut session, _events) = Session::new();
    session.start(config).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bad = GGA.replace("*51", "*99");
    client
        .send_to(bad.as_bytes(), ("127.0.0.1", in_port))
        .await
        .unwrap();

    wait_until(|| session.statistics().checksum_errors == 1).await;
    let snap = session.statistics();
    assert_eq!(snap.sentences_received, 1);
    assert_eq!(snap.sentences_sent, 0);

    // Nothing must come out of the sink.
    let mut buf = [0u8; 256];
    assert!(
        timeout(Duration::from_millis(300), receiver.recv_from(&mut buf))
            .await
            .is_err()
    );

    session.stop().await;
}

#[tokio::test]
async fn tcp_source_reconnects_without_leaving_running() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let recv_port = receiver.local_addr().unwrap().port();

    let config = SessionConfig {
        input: InputConfig::Tcp {
            host:            "127.0.0.1".into(),
            port:            addr.port(),
            reconnect_delay: Duration::from_millis(100),
        },
        outputs: vec![OutputConfig::enabled(OutputKind::Udp {
            host:      "127.0.0.1".into(),
            port:      recv_port,
            broadcast: false,
        })],
        filter:     None,
        rate_limit: None,
    };

    let (mut session, mut events) = Session::new();
    session.start(config).await.unwrap();

    // First connection delivers a frame.
    let (mut conn, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    conn.write_all(GGA.as_bytes()).await.unwrap();
    let mut buf = [0u8; 256];
    let (n, _) = timeout(WAIT, receiver.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], GGA.as_bytes());

    // Kill the server; the source must park in reconnecting while the
    // session stays up.
    drop(conn);
    drop(listener);
    wait_for_event(&mut events, |ev| {
        matches!(
            ev,
            SessionEvent::Endpoint(e)
                if e.kind == EndpointKind::Source
                    && e.new == ConnectionState::Reconnecting
        )
    })
    .await;
    assert_eq!(session.state(), SessionState::Running);

    // Bring the server back on the same port; traffic resumes.
    let listener = timeout(WAIT, async {
        loop {
            match TcpListener::bind(addr).await {
                Ok(l) => return l,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("could not rebind listener");
    let (mut conn, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    wait_for_event(&mut events, |ev| {
        matches!(
            ev,
            SessionEvent::Endpoint(e)
                if e.kind == EndpointKind::Source && e.new == ConnectionState::Connected
        )
    })
    .await;

    conn.write_all(RMC.as_bytes()).await.unwrap();
    let (n, _) = timeout(WAIT, receiver.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], RMC.as_bytes());
    assert_eq!(session.state(), SessionState::Running);

    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn session_restarts_after_stop() {
    let in_port = free_udp_port();
    let dir = tempfile::tempdir().unwrap();

    let config = SessionConfig {
        input: InputConfig::Udp {
            port: in_port,
            bind: Some("127.0.0.1".parse().unwrap()),
        },
        outputs: vec![OutputConfig::enabled(OutputKind::File {
            path:           dir.path().join("nmea.log"),
            timestamp_name: false,
        })],
        filter:     None,
        rate_limit: None,
    };

    let (mut session, _events) = Session::new();
    session.start(config.clone()).await.unwrap();
    // A second start while running is a lifecycle error.
    assert!(session.start(config.clone()).await.is_err());
    assert_eq!(session.state(), SessionState::Running);

    session.stop().await;
    session.start(config).await.unwrap();
    assert_eq!(session.state(), SessionState::Running);
    session.stop().await;
}
