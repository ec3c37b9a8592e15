//! WebSocket client lifecycle against the mock service.
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{closed_addr, stalled_addr, MockServer, WsBehavior};
use hostwatch::events::{ConnectionStatus, EventKind, WsEvent};
use hostwatch::ws::{WsClient, WsSettings};
use hostwatch::{TelemetryMessage, TransportError};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn settings(url: String, interval_ms: u64, max_attempts: u32) -> WsSettings {
    WsSettings {
        url,
        connect_timeout: Duration::from_secs(1),
        reconnect_interval: Duration::from_millis(interval_ms),
        max_reconnect_attempts: max_attempts,
    }
}

fn connection_events(client: &WsClient) -> mpsc::UnboundedReceiver<(Instant, ConnectionStatus)> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(EventKind::Connection, move |ev| {
        if let WsEvent::Connection(status) = ev {
            let _ = tx.send((Instant::now(), status.clone()));
        }
    });
    rx
}

async fn next_status(rx: &mut mpsc::UnboundedReceiver<(Instant, ConnectionStatus)>) -> (Instant, ConnectionStatus) {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no connection event")
        .expect("event channel closed")
}

#[tokio::test]
async fn delivers_monitor_data_frames() {
    let server = MockServer::start(&[], WsBehavior::Hold).await;
    let client = WsClient::new(settings(server.ws_url(), 50, 3));
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on(EventKind::MonitorData, move |ev| {
        if let WsEvent::Telemetry(TelemetryMessage::MonitorData(snap)) = ev {
            let _ = tx.send(snap.clone());
        }
    });

    let opened = Arc::new(AtomicUsize::new(0));
    let o = opened.clone();
    client.connect(Some(Box::new(move || {
        o.fetch_add(1, Ordering::SeqCst);
    })), None);

    let snap = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(snap.system.unwrap().hostname, "ws-host");
    assert_eq!(snap.cpu.unwrap().usage, 33.0);
    assert!(client.is_connected());
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    // already open: on_open runs right away, no second socket
    let o = opened.clone();
    client.connect(Some(Box::new(move || {
        o.fetch_add(1, Ordering::SeqCst);
    })), None);
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    client.disconnect();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.mock.ws_connects(), 1);
}

#[tokio::test]
async fn normal_closure_does_not_reconnect() {
    let server = MockServer::start(&[], WsBehavior::CloseWith(1000)).await;
    let client = WsClient::new(settings(server.ws_url(), 50, 3));
    let mut events = connection_events(&client);
    client.connect(None, None);

    assert_eq!(next_status(&mut events).await.1, ConnectionStatus::Connected);
    match next_status(&mut events).await.1 {
        ConnectionStatus::Disconnected { code, .. } => assert_eq!(code, 1000),
        other => panic!("expected disconnect, got {other:?}"),
    }

    sleep(Duration::from_millis(300)).await;
    assert_eq!(server.mock.ws_connects(), 1);
    assert!(events.try_recv().is_err());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn abnormal_closure_reconnects_after_interval() {
    let server = MockServer::start(&[], WsBehavior::Abort).await;
    let client = WsClient::new(settings(server.ws_url(), 300, 3));
    let mut events = connection_events(&client);
    client.connect(None, None);

    assert_eq!(next_status(&mut events).await.1, ConnectionStatus::Connected);
    let dropped_at = loop {
        match next_status(&mut events).await {
            (at, ConnectionStatus::Disconnected { code, .. }) => {
                assert_eq!(code, 1006);
                break at;
            }
            // a reset may surface as a read error first
            (_, ConnectionStatus::Error { .. }) => continue,
            (_, other) => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(server.mock.ws_connects(), 1);

    let (reconnected_at, status) = next_status(&mut events).await;
    assert_eq!(status, ConnectionStatus::Connected);
    let gap = reconnected_at.duration_since(dropped_at);
    assert!(gap >= Duration::from_millis(290), "reconnected after {gap:?}");
    assert!(gap < Duration::from_secs(2), "reconnected after {gap:?}");
    assert_eq!(server.mock.ws_connects(), 2);
    client.disconnect();
}

#[tokio::test]
async fn exhausted_reconnects_fail_once() {
    let dead = closed_addr().await;
    let client = WsClient::new(settings(format!("ws://{dead}/api/monitor/ws"), 20, 3));
    let mut events = connection_events(&client);

    let errors = Arc::new(AtomicUsize::new(0));
    let e = errors.clone();
    client.connect(None, Some(Box::new(move |_: &TransportError| {
        e.fetch_add(1, Ordering::SeqCst);
    })));

    let mut error_events = 0;
    loop {
        match next_status(&mut events).await.1 {
            ConnectionStatus::Error { .. } => error_events += 1,
            ConnectionStatus::Failed => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    // the first attempt plus three reconnects
    assert_eq!(error_events, 4);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(client.reconnect_attempts(), 3);

    sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err(), "activity after failure");
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let dead = closed_addr().await;
    let client = WsClient::new(settings(format!("ws://{dead}/api/monitor/ws"), 200, 3));
    let mut events = connection_events(&client);
    client.connect(None, None);

    assert!(matches!(next_status(&mut events).await.1, ConnectionStatus::Error { .. }));
    client.disconnect();
    assert_eq!(client.reconnect_attempts(), 0);

    sleep(Duration::from_millis(500)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn connect_timeout_fails_the_attempt_and_reconnects() {
    let addr = stalled_addr().await;
    let client = WsClient::new(WsSettings {
        url: format!("ws://{addr}/api/monitor/ws"),
        connect_timeout: Duration::from_millis(300),
        reconnect_interval: Duration::from_millis(100),
        max_reconnect_attempts: 1,
    });
    let mut events = connection_events(&client);

    let timeouts = Arc::new(AtomicUsize::new(0));
    let t = timeouts.clone();
    let started = Instant::now();
    client.connect(None, Some(Box::new(move |err: &TransportError| {
        if matches!(err, TransportError::ConnectTimeout(_)) {
            t.fetch_add(1, Ordering::SeqCst);
        }
    })));

    let (first_at, status) = next_status(&mut events).await;
    match status {
        ConnectionStatus::Error { message } => assert!(message.contains("timed out"), "{message}"),
        other => panic!("expected connect error, got {other:?}"),
    }
    let waited = first_at.duration_since(started);
    assert!(waited >= Duration::from_millis(290), "gave up after {waited:?}");
    assert!(!client.is_connected());
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);

    // one reconnect: 100ms backoff plus another full timeout
    let (second_at, status) = next_status(&mut events).await;
    assert!(matches!(status, ConnectionStatus::Error { .. }), "{status:?}");
    let gap = second_at.duration_since(first_at);
    assert!(gap >= Duration::from_millis(390), "second attempt failed after {gap:?}");
    assert_eq!(next_status(&mut events).await.1, ConnectionStatus::Failed);
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_during_attempt_takes_over_its_callbacks() {
    let addr = stalled_addr().await;
    let client = WsClient::new(WsSettings {
        url: format!("ws://{addr}/api/monitor/ws"),
        connect_timeout: Duration::from_millis(200),
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: 0,
    });
    let mut events = connection_events(&client);

    let errors = Arc::new(AtomicUsize::new(0));
    client.connect(None, None);
    let e = errors.clone();
    client.connect(None, Some(Box::new(move |_: &TransportError| {
        e.fetch_add(1, Ordering::SeqCst);
    })));

    assert!(matches!(next_status(&mut events).await.1, ConnectionStatus::Error { .. }));
    assert_eq!(next_status(&mut events).await.1, ConnectionStatus::Failed);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}
