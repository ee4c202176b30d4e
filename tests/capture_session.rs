use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::mock::ScriptedTransport;
use cdp_adapter::{AdapterError, AdapterErrorKind, BrowserSession, CdpConfig};
use danmaku_capture::{
    AppConfig, BrowserLauncher, CaptureError, CaptureRequest, CaptureSession, EndedPolicy,
    Platform, SessionOutcome, SessionState,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const SESSION: &str = "S-1";

struct ScriptedLauncher {
    transport: Arc<ScriptedTransport>,
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self, config: &CdpConfig) -> Result<BrowserSession, AdapterError> {
        BrowserSession::acquire_with(self.transport.clone(), config).await
    }
}

struct Room {
    ended: bool,
}

impl Room {
    fn live() -> Self {
        Self { ended: false }
    }

    fn ended() -> Self {
        Self { ended: true }
    }

    fn script(self, transport: &ScriptedTransport) {
        transport.respond("Page.navigate", json!({ "frameId": "F-1", "loaderId": "L-1" }));
        let ended = self.ended;
        transport.respond_with("Runtime.evaluate", move |params| {
            let expression = params["expression"].as_str().unwrap_or_default();
            let value = if expression == "document.readyState" {
                json!("complete")
            } else if expression.contains("innerText") {
                json!(ended)
            } else if expression.contains("querySelector") {
                json!(true)
            } else {
                Value::Null
            };
            Ok(json!({ "result": { "type": "string", "value": value } }))
        });
    }
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.capture.tick_interval_ms = 10;
    config.capture.render_grace_ms = 0;
    config.capture.idle_window_ms = 10;
    config.capture.navigation_timeout_ms = 2_000;
    config.tap.idle_poll_ms = 5;
    config.tap.shutdown_grace_ms = 200;
    config
}

struct Harness {
    transport: Arc<ScriptedTransport>,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    task: JoinHandle<(CaptureSession, Result<SessionOutcome, CaptureError>)>,
    output: PathBuf,
    _dir: TempDir,
}

fn start(platform: Platform, config: AppConfig, transport: Arc<ScriptedTransport>) -> Harness {
    start_with_output(platform, config, transport, |dir| dir.join("capture.json"))
}

fn start_with_output<F>(
    platform: Platform,
    config: AppConfig,
    transport: Arc<ScriptedTransport>,
    output: F,
) -> Harness
where
    F: FnOnce(&Path) -> PathBuf,
{
    let dir = tempfile::tempdir().unwrap();
    let output = output(dir.path());
    let request = CaptureRequest {
        platform,
        room_id: "7361".into(),
        output: Some(output.clone()),
    };
    let mut session = CaptureSession::new(request, config).with_launcher(Arc::new(ScriptedLauncher {
        transport: transport.clone(),
    }));
    let state = session.state();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let result = session.run(token).await;
        (session, result)
    });
    Harness {
        transport,
        state,
        cancel,
        task,
        output,
        _dir: dir,
    }
}

impl Harness {
    async fn reach(&mut self, wanted: SessionState) {
        timeout(Duration::from_secs(3), self.state.wait_for(|state| *state == wanted))
            .await
            .expect("state reached in time")
            .expect("state channel open");
    }

    async fn finish(&mut self) -> (CaptureSession, Result<SessionOutcome, CaptureError>) {
        timeout(Duration::from_secs(5), &mut self.task)
            .await
            .expect("session finished in time")
            .expect("session task")
    }
}

fn saved(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

async fn eventually<F: Fn() -> bool>(cond: F) {
    timeout(Duration::from_secs(3), async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

fn chat(i: usize) -> Value {
    json!({
        "type": "chat",
        "user": {"nickname": format!("viewer-{i}")},
        "content": format!("line {i}")
    })
}

fn ws_frame(id: &str, payload: &Value) -> Value {
    json!({
        "requestId": id,
        "timestamp": 1.0,
        "response": { "opcode": 1, "mask": false, "payloadData": payload.to_string() }
    })
}

#[tokio::test]
async fn douyin_session_captures_network_and_socket_comments() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    let body = json!({
        "data": {
            "messages": [
                {"method": "WebcastChatMessage", "user": {"nickname": "Ann"}, "content": "666"},
                {"method": "WebcastChatMessage", "user": {"nickname": "Bob"}, "content": "hello"},
                {"method": "WebcastChatMessage", "content": "anonymous"},
                {"method": "WebcastGiftMessage", "common": {"describe": "Cy sent a rose"}},
                {"method": "WebcastRoomStatsMessage", "content": "ignored"}
            ]
        }
    });
    transport.respond(
        "Fetch.getResponseBody",
        json!({ "body": body.to_string(), "base64Encoded": false }),
    );

    let mut config = fast_config();
    config.capture.snapshot_every = 2;
    let mut harness = start(Platform::Douyin, config, transport);
    harness.reach(SessionState::Monitoring).await;

    let navigated = harness.transport.calls("Page.navigate");
    assert_eq!(navigated[0]["url"], "https://live.douyin.com/7361");

    let url = "https://live.douyin.com/webcast/im/fetch/?room_id=7361";
    harness.transport.emit(
        "Fetch.requestPaused",
        json!({ "requestId": "r-1", "request": { "url": url, "method": "GET" } }),
        Some(SESSION),
    );
    harness.transport.emit(
        "Fetch.requestPaused",
        json!({
            "requestId": "r-1",
            "request": { "url": url, "method": "GET" },
            "responseStatusCode": 200,
            "responseHeaders": []
        }),
        Some(SESSION),
    );
    let output = harness.output.clone();
    eventually(|| saved(&output).len() == 4).await;

    harness.transport.emit(
        "Network.webSocketCreated",
        json!({ "requestId": "ws-1", "url": "wss://webcast.douyin.com/push" }),
        Some(SESSION),
    );
    for i in 0..6 {
        let frame = json!({
            "method": "WebcastChatMessage",
            "user": {"nickname": format!("viewer-{i}")},
            "content": format!("frame {i}")
        });
        harness
            .transport
            .emit("Network.webSocketFrameReceived", ws_frame("ws-1", &frame), Some(SESSION));
    }

    eventually(|| saved(&output).len() == 10).await;

    harness.cancel.cancel();
    let (session, result) = harness.finish().await;
    let transport = &harness.transport;
    assert_eq!(result.unwrap(), SessionOutcome::Cancelled);
    assert_eq!(session.current_state(), SessionState::Closed);

    let records = saved(&output);
    assert_eq!(records.len(), 10);
    assert_eq!(records[0]["user"], "Ann");
    assert_eq!(records[0]["type"], "chat");
    assert_eq!(records[0]["platform"], "douyin");
    assert_eq!(records[0]["room_id"], "7361");
    assert_eq!(records[2]["user"], "unknown user");
    assert_eq!(records[3]["type"], "other");
    assert_eq!(records[3]["content"], "Cy sent a rose");
    assert!(records.iter().any(|r| r["content"] == "frame 5"));

    assert_eq!(transport.calls("Fetch.disable").len(), 1);
    assert_eq!(transport.calls("Browser.close").len(), 1);
    assert_eq!(transport.shutdown_count(), 1);
}

#[tokio::test]
async fn cleanup_runs_once() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    let mut harness = start(Platform::Douyin, fast_config(), transport);
    harness.reach(SessionState::Monitoring).await;
    harness.cancel.cancel();

    let (mut session, result) = harness.finish().await;
    let transport = &harness.transport;
    assert!(result.is_ok());
    session.cleanup().await;
    session.cleanup().await;

    assert_eq!(transport.calls("Target.closeTarget").len(), 1);
    assert_eq!(transport.calls("Browser.close").len(), 1);
    assert_eq!(transport.shutdown_count(), 1);
    assert_eq!(session.current_state(), SessionState::Closed);
}

#[tokio::test]
async fn launch_failure_still_writes_empty_snapshot() {
    let transport = ScriptedTransport::new();
    transport.fail_start(AdapterError::new(AdapterErrorKind::Launch).with_hint("no chrome"));
    let mut harness = start(Platform::Douyin, fast_config(), transport);
    let output = harness.output.clone();

    let (session, result) = harness.finish().await;
    assert!(matches!(result, Err(CaptureError::Launch(_))));
    assert_eq!(session.current_state(), SessionState::Closed);
    assert_eq!(std::fs::read_to_string(output).unwrap().trim(), "[]");
}

#[tokio::test]
async fn navigation_error_releases_browser() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    transport.respond(
        "Page.navigate",
        json!({ "frameId": "F-1", "errorText": "net::ERR_NAME_NOT_RESOLVED" }),
    );
    let mut harness = start(Platform::Taobao, fast_config(), transport);
    let output = harness.output.clone();

    let (_session, result) = harness.finish().await;
    let transport = &harness.transport;
    match result {
        Err(CaptureError::Navigation(message)) => {
            assert!(message.contains("ERR_NAME_NOT_RESOLVED"))
        }
        other => panic!("expected navigation failure, got {other:?}"),
    }
    assert!(transport.calls("Fetch.enable").is_empty());
    assert_eq!(transport.calls("Browser.close").len(), 1);
    assert_eq!(transport.shutdown_count(), 1);
    assert_eq!(saved(&output).len(), 0);
}

#[tokio::test]
async fn ended_room_stops_when_policy_says_so() {
    let transport = ScriptedTransport::new();
    Room::ended().script(&transport);
    let mut config = fast_config();
    config.capture.ended_policy = EndedPolicy::Stop;
    let mut harness = start(Platform::Douyin, config, transport);

    let (_session, result) = harness.finish().await;
    let transport = &harness.transport;
    assert_eq!(result.unwrap(), SessionOutcome::StreamEnded);
    assert!(transport.calls("Fetch.enable").is_empty());
}

#[tokio::test]
async fn ended_room_keeps_capturing_by_default() {
    let transport = ScriptedTransport::new();
    Room::ended().script(&transport);
    let mut harness = start(Platform::Douyin, fast_config(), transport);
    harness.reach(SessionState::Monitoring).await;
    assert_eq!(harness.transport.calls("Fetch.enable").len(), 1);

    harness.cancel.cancel();
    let (_session, result) = harness.finish().await;
    assert_eq!(result.unwrap(), SessionOutcome::Cancelled);
}

#[tokio::test]
async fn taobao_socket_chat_is_captured_until_browser_disconnects() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    let mut harness = start(Platform::Taobao, fast_config(), transport);
    harness.reach(SessionState::Monitoring).await;

    let navigated = harness.transport.calls("Page.navigate");
    assert_eq!(navigated[0]["url"], "https://live.taobao.com/live/7361");

    let chat = json!({"type": "chat", "user": {"nickname": "Ann"}, "content": "hi"});
    let heartbeat = json!({"type": "heartbeat"});
    harness
        .transport
        .emit("Network.webSocketFrameReceived", ws_frame("ws-9", &heartbeat), Some(SESSION));
    harness
        .transport
        .emit("Network.webSocketFrameReceived", ws_frame("ws-9", &chat), Some(SESSION));
    // Yield so the supervisor ingests the frame before the connection drops.
    sleep(Duration::from_millis(50)).await;
    harness.transport.disconnect();

    let output = harness.output.clone();
    let (session, result) = harness.finish().await;
    assert!(matches!(result, Err(CaptureError::BrowserDisconnected)));
    assert_eq!(session.current_state(), SessionState::Closed);

    let records = saved(&output);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["platform"], "taobao");
    assert_eq!(records[0]["content"], "hi");
}

#[tokio::test]
async fn cancel_during_navigation_is_a_clean_stop() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    transport.respond_with("Runtime.evaluate", |_| {
        Ok(json!({ "result": { "type": "string", "value": "loading" } }))
    });
    let mut config = fast_config();
    config.capture.navigation_timeout_ms = 60_000;
    let mut harness = start(Platform::Douyin, config, transport);
    harness.reach(SessionState::Navigating).await;
    eventually(|| !harness.transport.calls("Page.navigate").is_empty()).await;

    harness.cancel.cancel();
    let output = harness.output.clone();
    let (_session, result) = harness.finish().await;
    let transport = &harness.transport;
    assert_eq!(result.unwrap(), SessionOutcome::Cancelled);
    assert_eq!(transport.shutdown_count(), 1);
    assert_eq!(std::fs::read_to_string(output).unwrap().trim(), "[]");
}

#[tokio::test]
async fn snapshots_follow_the_comment_count_on_ticks() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    let mut config = fast_config();
    config.capture.snapshot_every = 20;
    let mut harness = start(Platform::Taobao, config, transport);
    harness.reach(SessionState::Monitoring).await;
    let output = harness.output.clone();

    for i in 0..20 {
        harness
            .transport
            .emit("Network.webSocketFrameReceived", ws_frame("ws-1", &chat(i)), Some(SESSION));
    }
    eventually(|| saved(&output).len() == 20).await;

    harness
        .transport
        .emit("Network.webSocketFrameReceived", ws_frame("ws-1", &chat(20)), Some(SESSION));
    // Ten ticks at 21 comments: not a multiple of 20, so the file is left alone.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(saved(&output).len(), 20);

    harness.cancel.cancel();
    let (session, result) = harness.finish().await;
    assert_eq!(result.unwrap(), SessionOutcome::Cancelled);
    assert_eq!(session.store().len(), 21);
    let records = saved(&output);
    assert_eq!(records.len(), 21);
    assert_eq!(records[20]["content"], "line 20");
}

#[tokio::test]
async fn failed_snapshots_do_not_end_the_session() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    let mut config = fast_config();
    config.capture.snapshot_every = 1;
    let mut harness = start_with_output(Platform::Taobao, config, transport, |dir| {
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, b"plain file").unwrap();
        blocker.join("capture.json")
    });
    harness.reach(SessionState::Monitoring).await;

    for i in 0..2 {
        harness
            .transport
            .emit("Network.webSocketFrameReceived", ws_frame("ws-1", &chat(i)), Some(SESSION));
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(*harness.state.borrow(), SessionState::Monitoring);

    harness.cancel.cancel();
    let output = harness.output.clone();
    let (session, result) = harness.finish().await;
    assert_eq!(result.unwrap(), SessionOutcome::Cancelled);
    assert_eq!(session.store().len(), 2);
    assert_eq!(session.current_state(), SessionState::Closed);
    assert!(!output.exists());
}

#[tokio::test]
async fn taobao_console_chat_is_stored() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    let mut harness = start(Platform::Taobao, fast_config(), transport);
    harness.reach(SessionState::Monitoring).await;

    let log = |text: String| {
        json!({ "type": "log", "args": [{ "type": "string", "value": text }] })
    };
    harness
        .transport
        .emit("Runtime.consoleAPICalled", log("弹幕 connection open".into()), Some(SESSION));
    harness
        .transport
        .emit("Runtime.consoleAPICalled", log(chat(7).to_string()), Some(SESSION));
    let output = harness.output.clone();
    sleep(Duration::from_millis(50)).await;

    harness.cancel.cancel();
    let (session, result) = harness.finish().await;
    assert_eq!(result.unwrap(), SessionOutcome::Cancelled);
    assert_eq!(session.store().len(), 1);
    let records = saved(&output);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["user"], "viewer-7");
    assert_eq!(records[0]["content"], "line 7");
    assert_eq!(records[0]["type"], "chat");
}

#[tokio::test]
async fn payloads_in_flight_at_disconnect_are_kept() {
    let transport = ScriptedTransport::new();
    Room::live().script(&transport);
    let mut harness = start(Platform::Taobao, fast_config(), transport);
    harness.reach(SessionState::Monitoring).await;

    for i in 0..3 {
        harness
            .transport
            .emit("Network.webSocketFrameReceived", ws_frame("ws-2", &chat(i)), Some(SESSION));
    }
    harness.transport.disconnect();

    let output = harness.output.clone();
    let (session, result) = harness.finish().await;
    assert!(matches!(result, Err(CaptureError::BrowserDisconnected)));
    assert_eq!(session.store().len(), 3);
    assert_eq!(saved(&output).len(), 3);
}
