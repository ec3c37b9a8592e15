//! In-process stand-in for the monitoring service: the per-module HTTP
//! endpoints, `/health` and the WebSocket stream, with hit counters.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hostwatch::{MonitorConfig, MonitorState, MonitorStore};
use serde_json::json;

#[derive(Debug, Clone, Copy)]
pub enum WsBehavior {
    /// Send one snapshot and keep the socket open.
    Hold,
    /// Send one snapshot, then close with this code.
    CloseWith(u16),
    /// Send one snapshot, then drop the TCP connection without a close frame.
    Abort,
}

pub struct Mock {
    failing: Vec<&'static str>,
    ws: WsBehavior,
    hits: Mutex<HashMap<String, usize>>,
    ws_connects: AtomicUsize,
    down: AtomicBool,
}

impl Mock {
    pub fn hits(&self, module: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(module)
            .copied()
            .unwrap_or(0)
    }

    pub fn ws_connects(&self) -> usize {
        self.ws_connects.load(Ordering::SeqCst)
    }

    /// While down, every module endpoint answers 503.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub mock: Arc<Mock>,
}

impl MockServer {
    pub async fn start(failing: &[&'static str], ws: WsBehavior) -> Self {
        let mock = Arc::new(Mock {
            failing: failing.to_vec(),
            ws,
            hits: Mutex::new(HashMap::new()),
            ws_connects: AtomicUsize::new(0),
            down: AtomicBool::new(false),
        });
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/api/monitor/ws", get(ws_handler))
            .route("/api/monitor/:module", get(module_handler))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, mock }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api/monitor", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/monitor/ws", self.addr)
    }

    /// Fast timings pointed at this server.
    pub fn config(&self) -> MonitorConfig {
        fast_config(self.api_url(), self.ws_url())
    }
}

pub fn fast_config(api_base_url: String, ws_base_url: String) -> MonitorConfig {
    MonitorConfig {
        api_base_url,
        ws_base_url,
        polling_interval_ms: 100,
        request_timeout_ms: 1000,
        max_retries: 3,
        retry_backoff_ms: 10,
        pending_window_ms: 1000,
        connect_timeout_ms: 1000,
        reconnect_interval_ms: 50,
        max_reconnect_attempts: 3,
        reinit_debounce_ms: 50,
        ..MonitorConfig::default()
    }
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// An address that accepts TCP connections but never answers a handshake.
pub async fn stalled_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

async fn module_handler(Path(module): Path<String>, State(mock): State<Arc<Mock>>) -> Response {
    *mock.hits.lock().unwrap().entry(module.clone()).or_default() += 1;
    if mock.down.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "down").into_response();
    }
    if mock.failing.contains(&module.as_str()) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    let data = match module.as_str() {
        "system" => json!({"hostname": "h1", "platform": "linux", "uptime": 42, "loadAverage": [0.1, 0.2, 0.3]}),
        "cpu" => json!({"usage": 12.5, "cores": [10.0, 15.0], "frequency": 2400.0}),
        "memory" => json!({"total": 1000, "used": 400, "available": 600, "percent": 40.0}),
        "disk" => json!({"total": 100, "used": 50, "free": 50, "percent": 50.0, "readSpeed": 1.0, "writeSpeed": 2.0}),
        "network" => json!({"uploadSpeed": 1.5, "downloadSpeed": 3.0, "connections": {"tcp": 5}}),
        "processes" => json!([{"pid": 1, "name": "init", "cpuPercent": 0.1, "memoryPercent": 0.2, "status": "S"}]),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    Json(json!({"success": true, "data": data})).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(mock): State<Arc<Mock>>) -> Response {
    mock.ws_connects.fetch_add(1, Ordering::SeqCst);
    let behavior = mock.ws;
    ws.on_upgrade(move |socket| serve_socket(socket, behavior))
}

async fn serve_socket(mut socket: WebSocket, behavior: WsBehavior) {
    let frame = json!({
        "type": "monitor_data",
        "data": {"system": {"hostname": "ws-host"}, "cpu": {"usage": 33.0}}
    });
    if socket.send(Message::Text(frame.to_string())).await.is_err() {
        return;
    }
    match behavior {
        WsBehavior::Hold => while let Some(Ok(_)) = socket.recv().await {},
        WsBehavior::CloseWith(code) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: "bye".into(),
                })))
                .await;
            // let the client see the frame before the socket goes away
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        WsBehavior::Abort => drop(socket),
    }
}

/// Wait until the store's state satisfies `pred`, or panic after 5s.
pub async fn wait_for<F>(store: &MonitorStore, pred: F) -> MonitorState
where
    F: Fn(&MonitorState) -> bool,
{
    let mut rx = store.subscribe();
    let res = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&*state) {
                    return (*state).clone();
                }
            }
            if rx.changed().await.is_err() {
                panic!("store dropped");
            }
        }
    })
    .await;
    match res {
        Ok(state) => state,
        Err(_) => panic!("condition not reached; last state: {:?}", store.state()),
    }
}
