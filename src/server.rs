//! HTTP and WebSocket surface.
//!
//! - `GET /` liveness text
//! - `GET /status` current job descriptor in the status-query shape
//! - `GET /com` WebSocket: inbound commands, outbound telemetry
//!
//! Every `/com` connection is a telemetry subscriber for as long as it is open.
//! Replies to a connection's own commands (accepted, rejected, malformed) go to that
//! connection only.

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::CommandDispatcher;
use crate::experiment::{JobDescriptor, JobSupervisor};
use crate::telemetry::TelemetryRelay;

/// Liveness reply for `GET /`
pub const LIVENESS_TEXT: &str = "server is running";

/// How long shutdown waits for the active job to wind down
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    dispatcher: CommandDispatcher,
    relay: Arc<TelemetryRelay>,
}

impl AppState {
    /// State serving `supervisor` and `relay`
    pub fn new(supervisor: Arc<JobSupervisor>, relay: Arc<TelemetryRelay>) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(supervisor),
            relay,
        }
    }

    /// Supervisor behind the dispatcher
    pub fn supervisor(&self) -> &Arc<JobSupervisor> {
        self.dispatcher.supervisor()
    }
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Numeric status id, `null` before the first job
    pub status_id: Option<u8>,
    /// Status name, `Idle` before the first job
    pub status_name: String,
    /// Current job id
    pub job_id: Option<u64>,
    /// Progress of the current job
    pub progress_percent: f64,
}

impl From<Option<JobDescriptor>> for StatusResponse {
    fn from(descriptor: Option<JobDescriptor>) -> Self {
        match descriptor {
            Some(d) => Self {
                status_id: Some(d.status.id()),
                status_name: d.status.name().to_string(),
                job_id: Some(d.id),
                progress_percent: d.progress_percent,
            },
            None => Self {
                status_id: None,
                status_name: "Idle".to_string(),
                job_id: None,
                progress_percent: 0.0,
            },
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/status", get(status))
        .route("/com", get(com))
        .with_state(state)
}

async fn liveness() -> &'static str {
    LIVENESS_TEXT
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.supervisor().status().into())
}

async fn com(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one `/com` connection until either side closes it.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.relay.subscribe();
    let subscriber = subscription.id();
    info!(subscriber, "Client connected");

    // Direct replies for this connection only
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let dispatcher = state.dispatcher.clone();

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let reply = match dispatcher.dispatch(&text) {
                        Ok(outcome) => outcome.reply(),
                        Err(err) => err.to_string(),
                    };
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            Some(reply) = reply_rx.recv() => {
                if let Err(e) = sender.send(Message::Text(reply)).await {
                    debug!("WebSocket send error: {}", e);
                    break;
                }
            }
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if let Some(text) = event.to_wire() {
                    if let Err(e) = sender.send(Message::Text(text)).await {
                        debug!("WebSocket send error: {}", e);
                        break;
                    }
                }
            }
            _ = &mut recv_task => break,
        }
    }

    recv_task.abort();
    info!(subscriber, "Client disconnected");
}

/// Waits for Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {},
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Bind `addr` and serve until `shutdown` completes, then stop the active job.
pub async fn serve<F>(addr: &str, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    serve_listener(listener, state, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_listener<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr().context("listener has no local address")?;
    info!(%local, backend = state.supervisor().backend_name(), "Listening");

    let supervisor = Arc::clone(state.supervisor());
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    warn!("Shutting down, stopping active job");
    supervisor.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{JobRequest, JobStatus, SweepSpec};
    use crate::hardware::mock::MockOpener;
    use crate::hardware::{SourceType, Wiring};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    type WsClient =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn spawn_server() -> (
        std::net::SocketAddr,
        Arc<TelemetryRelay>,
        Arc<JobSupervisor>,
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        let relay = Arc::new(TelemetryRelay::spawn());
        let supervisor = Arc::new(JobSupervisor::new(
            Arc::new(MockOpener::new()),
            relay.publisher(),
        ));
        let state = AppState::new(Arc::clone(&supervisor), Arc::clone(&relay));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_listener(listener, state, async {
            let _ = stop_rx.await;
        }));
        (addr, relay, supervisor, stop_tx, server)
    }

    async fn connect(addr: std::net::SocketAddr) -> WsClient {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/com", addr))
            .await
            .unwrap();
        ws
    }

    async fn next_text(ws: &mut WsClient) -> String {
        loop {
            let frame = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no frame within 5s")
                .expect("socket closed")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return text.to_string();
            }
        }
    }

    async fn frames_until(ws: &mut WsClient, done: impl Fn(&[String]) -> bool) -> Vec<String> {
        let mut frames = Vec::new();
        while !done(&frames) {
            frames.push(next_text(ws).await);
        }
        frames
    }

    fn has(frames: &[String], text: &str) -> bool {
        frames.iter().any(|f| f == text)
    }

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn body(response: &str) -> &str {
        response.split("\r\n\r\n").nth(1).unwrap_or_default()
    }

    #[test]
    fn idle_status_shape() {
        let value = serde_json::to_value(StatusResponse::from(None)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "statusId": null,
                "statusName": "Idle",
                "jobId": null,
                "progressPercent": 0.0
            })
        );
    }

    #[tokio::test]
    async fn liveness_and_status_over_http() {
        let relay = Arc::new(TelemetryRelay::spawn());
        let supervisor = Arc::new(JobSupervisor::new(
            Arc::new(MockOpener::new()),
            relay.publisher(),
        ));
        let state = AppState::new(Arc::clone(&supervisor), relay);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_listener(listener, state, async {
            let _ = stop_rx.await;
        }));

        let root = get(addr, "/").await;
        assert!(root.starts_with("HTTP/1.1 200"));
        assert_eq!(body(&root), LIVENESS_TEXT);

        let handle = supervisor
            .start(JobRequest::sweep(
                "ASRL7::INSTR",
                SweepSpec {
                    source_type: SourceType::Voltage,
                    start: 0.0,
                    end: 1.0,
                    iteration_count: 3,
                    both_ways: false,
                    compliance_limit: 0.1,
                    wiring: Wiring::TwoWire,
                },
            ))
            .unwrap();
        handle.wait().await;

        let status = get(addr, "/status").await;
        let value: serde_json::Value = serde_json::from_str(body(&status)).unwrap();
        assert_eq!(value["statusId"], JobStatus::Finished.id());
        assert_eq!(value["statusName"], "Finished");
        assert_eq!(value["jobId"], handle.id());
        assert_eq!(value["progressPercent"], 100.0);

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn command_socket_replies_to_sender_and_broadcasts_telemetry() {
        let (addr, relay, supervisor, stop_tx, server) = spawn_server().await;
        let mut sender = connect(addr).await;
        let mut observer = connect(addr).await;

        timeout(Duration::from_secs(5), async {
            while relay.subscriber_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sockets never subscribed");

        sender.send(WsMessage::Text("{".into())).await.unwrap();
        let reply = next_text(&mut sender).await;
        assert!(reply.starts_with("Validation error"), "{reply}");
        assert!(supervisor.status().is_none());

        let start = r#"{"command":"start","instrumentAddress":"ASRL7::INSTR","sourceMode":"volt",
            "sweepStart":0,"sweepEnd":1,"iterationCount":3,"complianceLimit":0.01,"interStepDelayMs":0}"#;
        sender.send(WsMessage::Text(start.into())).await.unwrap();

        // The reply and the job's telemetry travel separately and may interleave
        let sent = frames_until(&mut sender, |f| {
            has(f, "Finished") && has(f, "Process started (job 1)")
        })
        .await;
        let seen = frames_until(&mut observer, |f| has(f, "Finished")).await;

        assert!(!seen.iter().any(|f| f.starts_with("Process started")));
        assert!(!seen.iter().any(|f| f.starts_with("Validation error")));

        for frames in [&sent, &seen] {
            assert!(has(frames, "setup completed"));
            let samples: Vec<serde_json::Value> = frames
                .iter()
                .filter(|f| f.starts_with('{'))
                .map(|f| serde_json::from_str(f).unwrap())
                .collect();
            assert_eq!(samples.len(), 3);
            assert_eq!(samples[2]["step"], 2);
            assert_eq!(samples[2]["voltage"], 1.0);
            let last_telemetry = frames.iter().rev().find(|f| !f.starts_with("Process started"));
            assert_eq!(last_telemetry.map(String::as_str), Some("Finished"));
        }

        drop(sender);
        drop(observer);
        stop_tx.send(()).unwrap();
        timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
