use std::sync::Arc;
use std::time::Duration;

use printsync_agent::cmdlog::CommandHistory;
use printsync_agent::config::{RuntimeSettings, UpdateConfig};
use printsync_agent::gateway::Heater;
use printsync_agent::router::Router;
use printsync_agent::sampling::{SamplingPolicy, SharedSampling};
use printsync_agent::session::FrameHandler;
use printsync_agent::stream::failure_message;
use printsync_agent::testkit::{EchoSignaler, FakeGateway, RecordingCloud};
use printsync_agent::update::Updater;
use printsync_agent::{GatewayAction, SettingsWriter, settings_channel};
use printsync_protocol::{EnvelopeExtra, StreamSignal, WebcamTransforms};
use serde_json::{Value, json};
use tempfile::TempDir;

struct Rig {
    router: Router,
    gateway: Arc<FakeGateway>,
    cloud: Arc<RecordingCloud>,
    signaler: Arc<EchoSignaler>,
    sampling: SharedSampling,
    writer: SettingsWriter,
    dir: TempDir,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(FakeGateway::new());
    let cloud = Arc::new(RecordingCloud::new());
    let signaler = Arc::new(EchoSignaler::new());
    let sampling = SharedSampling::new(SamplingPolicy::default());
    let (writer, settings) = settings_channel(RuntimeSettings {
        auth_token: "tok".into(),
        ..RuntimeSettings::default()
    });
    let history = Arc::new(CommandHistory::new(dir.path().join("terminal.log"), 50, 20));
    let updater =
        Arc::new(Updater::new(UpdateConfig::default(), Duration::from_secs(1)).unwrap());
    let router = Router::new(
        settings,
        sampling.clone(),
        gateway.clone(),
        cloud.clone(),
        signaler.clone(),
        history,
        updater,
    );
    Rig {
        router,
        gateway,
        cloud,
        signaler,
        sampling,
        writer,
        dir,
    }
}

fn frame(mut body: Value) -> String {
    body["token"] = json!("tok");
    body["interface"] = json!("client");
    body.to_string()
}

impl Rig {
    async fn handle(&self, body: Value) -> EnvelopeExtra {
        self.router
            .handle_frame(&frame(body))
            .await
            .expect("frame should be accepted")
    }
}

#[tokio::test]
async fn presence_switches_the_sampling_rate() {
    let rig = rig();
    let extra = rig.handle(json!({"state": "online"})).await;
    assert!(extra.is_empty());
    assert!(rig.sampling.snapshot().user_online);

    rig.handle(json!({"state": "offline"})).await;
    assert!(!rig.sampling.snapshot().user_online);
}

#[tokio::test]
async fn frames_for_other_devices_are_dropped() {
    let rig = rig();
    let foreign = json!({"token": "other", "interface": "client", "state": "online"});
    assert!(rig.router.handle_frame(&foreign.to_string()).await.is_none());

    let no_interface = json!({"token": "tok", "state": "online"});
    assert!(rig.router.handle_frame(&no_interface.to_string()).await.is_none());

    assert!(rig.router.handle_frame("not json").await.is_none());
    assert!(!rig.sampling.snapshot().user_online);
}

#[tokio::test]
async fn stream_request_is_forwarded_once_per_auth_key() {
    let rig = rig();
    rig.writer.update(|s| {
        s.transforms = WebcamTransforms {
            flip_h: true,
            ..WebcamTransforms::default()
        }
    });

    let request = json!({"webrtc": "request", "auth_key": "k1", "data": {}});
    let extra = rig.handle(request.clone()).await;
    let answer = extra.webrtc_data.unwrap();
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["auth_key"], "k1");
    assert!(extra.transforms.unwrap().flip_h);
    assert!(rig.sampling.snapshot().last_stream_request.is_some());

    let repeat = rig.handle(request).await;
    assert!(repeat.is_empty());
    assert_eq!(rig.signaler.calls().len(), 1);

    let fresh = rig
        .handle(json!({"webrtc": "request", "auth_key": "k2", "data": {}}))
        .await;
    assert_eq!(fresh.webrtc_data.unwrap()["auth_key"], "k2");
    assert_eq!(rig.signaler.calls().len(), 2);
}

#[tokio::test]
async fn stream_request_without_a_key_still_counts_as_streaming() {
    let rig = rig();
    let extra = rig.handle(json!({"webrtc": "request", "data": {}})).await;
    assert!(extra.is_empty());
    assert!(rig.signaler.calls().is_empty());
    assert!(rig.sampling.snapshot().last_stream_request.is_some());
}

#[tokio::test]
async fn offers_and_candidates_pass_their_payload_through() {
    let rig = rig();
    let extra = rig
        .handle(json!({"webrtc": "offer", "data": {"sdp": "v=0"}}))
        .await;
    assert!(extra.webrtc_data.is_some());
    rig.handle(json!({"webrtc": "remote_candidate", "data": {"candidate": "c1"}}))
        .await;

    let calls = rig.signaler.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], (StreamSignal::Offer, json!({"sdp": "v=0"})));
    assert_eq!(calls[1].0, StreamSignal::Candidate);
}

#[tokio::test]
async fn streamer_failure_becomes_an_error_reply() {
    let rig = rig();
    rig.signaler.set_failing(true);
    let extra = rig
        .handle(json!({"webrtc": "offer", "data": {"sdp": "v=0"}}))
        .await;
    assert!(extra.webrtc_data.is_none());
    assert_eq!(
        extra.webrtc_error.as_deref(),
        Some(failure_message(StreamSignal::Offer))
    );
    assert!(extra.transforms.is_some());
}

#[tokio::test]
async fn status_query_reports_unseen_commands_once() {
    let rig = rig();
    rig.gateway.set_commands(&["G28", "M104 S200", "G1 X1"]);

    let extra = rig.handle(json!({"status": "query"})).await;
    assert_eq!(
        extra.terminal_commands.unwrap().command_list,
        vec!["G28", "M104 S200", "G1 X1"]
    );

    let again = rig.handle(json!({"status": "query"})).await;
    assert!(again.terminal_commands.unwrap().command_list.is_empty());

    let logged = std::fs::read_to_string(rig.dir.path().join("terminal.log")).unwrap();
    assert_eq!(logged.lines().count(), 3);
}

#[tokio::test]
async fn status_query_applies_the_cherry_pick_list() {
    let rig = rig();
    rig.writer.update(|s| s.cherry_pick = vec!["M104".into()]);
    rig.gateway.set_commands(&["G28", "M104 S200", "G1 X1"]);

    let extra = rig.handle(json!({"status": "query"})).await;
    assert_eq!(extra.terminal_commands.unwrap().command_list, vec!["M104 S200"]);
}

#[tokio::test]
async fn commands_reach_the_printer() {
    let rig = rig();
    rig.handle(json!({"motion": {"cmd": "home", "axes": ["x", "y"]}}))
        .await;
    rig.handle(json!({"temperature": {"cmd": "temperature", "heater": "bed", "value": "60"}}))
        .await;
    rig.handle(json!({"execute": {"cmd": "cancel"}})).await;
    rig.handle(json!({"gcode": {"cmd": "send", "lines": ["G28", "G1 X5"]}}))
        .await;
    rig.handle(json!({"files": {"cmd": "delete", "file": "old.gcode"}}))
        .await;

    assert_eq!(
        rig.gateway.actions(),
        vec![
            GatewayAction::Home {
                axes: vec!["x".into(), "y".into()]
            },
            GatewayAction::SetTemperature {
                heater: Heater::Bed,
                value: 60.0
            },
            GatewayAction::Cancel,
            GatewayAction::Gcode {
                script: "G28\nG1 X5".into()
            },
            GatewayAction::DeleteFile {
                filename: "old.gcode".into()
            },
        ]
    );
}

#[tokio::test]
async fn unknown_and_select_commands_do_nothing() {
    let rig = rig();
    let extra = rig.handle(json!({"lights": {"cmd": "on"}})).await;
    assert!(extra.is_empty());
    rig.handle(json!({"execute": {"cmd": "self_destruct"}})).await;
    rig.handle(json!({"files": {"cmd": "select", "file": "cube.gcode"}}))
        .await;
    rig.handle(json!({"temperature": {"cmd": "temperature", "heater": "chamber", "value": 40}}))
        .await;
    assert!(rig.gateway.actions().is_empty());
}

#[tokio::test]
async fn toggle_follows_the_printer_state() {
    let rig = rig();
    rig.handle(json!({"execute": {"cmd": "toggle"}})).await;
    assert!(rig.gateway.actions().is_empty());

    rig.gateway.set_paused();
    rig.handle(json!({"execute": {"cmd": "toggle"}})).await;

    let source = rig.dir.path().join("cube.gcode");
    std::fs::write(&source, "G28\n").unwrap();
    rig.gateway.set_printing("cube.gcode", &source);
    rig.handle(json!({"execute": {"cmd": "toggle"}})).await;

    assert_eq!(
        rig.gateway.actions(),
        vec![GatewayAction::Resume, GatewayAction::Pause]
    );
}

#[tokio::test]
async fn uploads_decode_inline_and_staged_content() {
    let rig = rig();
    rig.cloud.stage_file("bucket/big.gcode", b"M84\n");

    rig.handle(json!({"files": {"cmd": "upload", "file": "small.gcode", "content": "RzI4Cg=="}}))
        .await;
    rig.handle(json!({"files": {"cmd": "upload_big", "file": "big.gcode", "content": "bucket/big.gcode"}}))
        .await;
    // neither of these reaches the printer
    rig.handle(json!({"files": {"cmd": "upload", "file": "bad.gcode", "content": "%%%"}}))
        .await;
    rig.handle(json!({"files": {"cmd": "upload_big", "file": "gone.gcode", "content": "bucket/gone"}}))
        .await;

    assert_eq!(
        rig.gateway.actions(),
        vec![
            GatewayAction::UploadFile {
                filename: "small.gcode".into(),
                content: b"G28\n".to_vec()
            },
            GatewayAction::UploadFile {
                filename: "big.gcode".into(),
                content: b"M84\n".to_vec()
            },
        ]
    );
}

#[tokio::test]
async fn update_request_gets_a_plain_reply() {
    let rig = rig();
    let extra = rig.handle(json!({"update": "update"})).await;
    assert!(extra.is_empty());
}
