use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Form;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use printsync_agent::cloud::{FrameMeta, JobEndMeta, JobStartMeta};
use printsync_agent::config::RuntimeSettings;
use printsync_agent::error::AgentError;
use printsync_agent::{CloudApi, HttpCloud, SettingsWriter, TokenStatus, settings_channel};
use tokio::net::TcpListener;
use url::Url;

#[derive(Debug, Clone)]
struct Upload {
    path: &'static str,
    authorization: String,
    body: String,
}

#[derive(Clone, Default)]
struct Backend {
    uploads: Arc<Mutex<Vec<Upload>>>,
    reject_end: Arc<AtomicBool>,
}

impl Backend {
    fn record(&self, path: &'static str, headers: &HeaderMap, body: &Bytes) {
        let authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        self.uploads.lock().unwrap().push(Upload {
            path,
            authorization,
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }

    fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

async fn ping(headers: HeaderMap) -> StatusCode {
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some("good") => StatusCode::OK,
        Some("bad") => StatusCode::UNAUTHORIZED,
        _ => StatusCode::IM_A_TEAPOT,
    }
}

async fn start_job(State(backend): State<Backend>, headers: HeaderMap, body: Bytes) -> StatusCode {
    backend.record("start-job", &headers, &body);
    StatusCode::OK
}

async fn end_job(State(backend): State<Backend>, headers: HeaderMap, body: Bytes) -> StatusCode {
    if backend.reject_end.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    backend.record("end-job", &headers, &body);
    StatusCode::OK
}

async fn new_image(State(backend): State<Backend>, headers: HeaderMap, body: Bytes) -> StatusCode {
    backend.record("new-image", &headers, &body);
    StatusCode::OK
}

async fn staged_file(Form(form): Form<HashMap<String, String>>) -> (StatusCode, String) {
    match form.get("bucket_file").map(String::as_str) {
        Some("bucket/cube.gcode") => (StatusCode::OK, "G28\nM84\n".into()),
        _ => (StatusCode::NOT_FOUND, String::new()),
    }
}

async fn start_backend(backend: Backend) -> SocketAddr {
    let app = axum::Router::new()
        .route("/api/v1/printers/ping", get(ping))
        .route("/api/v1/print-jobs/remote/start-job", post(start_job))
        .route("/api/v1/print-jobs/remote/end-job", post(end_job))
        .route("/api/v1/images/print/predict/new-image", post(new_image))
        .route("/api/v1/print-jobs/printer/gcode/uploadfile", post(staged_file))
        .with_state(backend);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn loopback_available() -> bool {
    TcpListener::bind("127.0.0.1:0").await.is_ok()
}

fn client(addr: SocketAddr, token: &str) -> (HttpCloud, SettingsWriter) {
    let (writer, settings) = settings_channel(RuntimeSettings {
        auth_token: token.to_owned(),
        ..RuntimeSettings::default()
    });
    let api = Url::parse(&format!("http://{addr}/api/v1/")).unwrap();
    (
        HttpCloud::new(api, settings, Duration::from_secs(2)).unwrap(),
        writer,
    )
}

#[tokio::test]
async fn ping_maps_status_codes() {
    if !loopback_available().await {
        eprintln!("skipping ping_maps_status_codes: loopback bind not permitted");
        return;
    }
    let addr = start_backend(Backend::default()).await;
    let (cloud, _writer) = client(addr, "good");

    assert_eq!(cloud.ping("good").await, TokenStatus::Valid);
    assert_eq!(cloud.ping("bad").await, TokenStatus::Invalid);
    assert_eq!(cloud.ping("other").await, TokenStatus::Unexpected(418));
    assert_eq!(cloud.ping("").await, TokenStatus::Missing);
}

#[tokio::test]
async fn ping_without_a_backend_is_unreachable() {
    if !loopback_available().await {
        eprintln!("skipping ping_without_a_backend_is_unreachable: loopback bind not permitted");
        return;
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (cloud, _writer) = client(addr, "good");
    assert_eq!(cloud.ping("good").await, TokenStatus::Unreachable);
}

#[tokio::test]
async fn job_uploads_carry_metadata_files_and_token() {
    if !loopback_available().await {
        eprintln!("skipping job_uploads_carry_metadata_files_and_token: loopback bind not permitted");
        return;
    }
    let backend = Backend::default();
    let addr = start_backend(backend.clone()).await;
    let (cloud, writer) = client(addr, "tok-1");

    let dir = tempfile::tempdir().unwrap();
    let gcode = dir.path().join("cube.gcode");
    let csv = dir.path().join("print_log.csv");
    std::fs::write(&gcode, "G28\nG1 X10\n").unwrap();
    std::fs::write(&csv, "count,timestamp\n1,2024-01-01T00:00:00.000Z\n").unwrap();

    let start = JobStartMeta {
        name: "cube".into(),
        long_name: "cube_2024-01-01T00:00:00.000Z".into(),
        gcode_file: "cube.gcode".into(),
        start_time: "2024-01-01T00:00:00.000Z".into(),
    };
    cloud.upload_job_start(&start, &gcode).await.unwrap();

    // later requests pick up a refreshed token
    writer.set_auth_token("tok-2");
    let end = JobEndMeta {
        name: "cube".into(),
        long_name: start.long_name.clone(),
        csv_file: "print_log.csv".into(),
        gcode_file: "cube.gcode".into(),
        start_time: start.start_time.clone(),
        end_time: "2024-01-01T01:00:00.000Z".into(),
    };
    cloud.upload_job_end(&end, &csv, Some(&gcode)).await.unwrap();

    let uploads = backend.uploads();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].path, "start-job");
    assert_eq!(uploads[0].authorization, "tok-1");
    assert!(uploads[0].body.contains("name=\"gcode_obj\"; filename=\"cube.gcode\""));
    assert!(uploads[0].body.contains("\"long_name\":\"cube_2024-01-01T00:00:00.000Z\""));

    assert_eq!(uploads[1].path, "end-job");
    assert_eq!(uploads[1].authorization, "tok-2");
    assert!(uploads[1].body.contains("name=\"csv_obj\"; filename=\"print_log.csv\""));
    assert!(uploads[1].body.contains("name=\"gcode_obj\""));
    assert!(uploads[1].body.contains("\"end_time\":\"2024-01-01T01:00:00.000Z\""));
}

#[tokio::test]
async fn rejected_end_upload_is_an_error() {
    if !loopback_available().await {
        eprintln!("skipping rejected_end_upload_is_an_error: loopback bind not permitted");
        return;
    }
    let backend = Backend::default();
    backend.reject_end.store(true, Ordering::SeqCst);
    let addr = start_backend(backend.clone()).await;
    let (cloud, _writer) = client(addr, "tok");

    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("print_log.csv");
    std::fs::write(&csv, "count\n").unwrap();
    let end = JobEndMeta {
        name: "cube".into(),
        long_name: "cube_x".into(),
        csv_file: "print_log.csv".into(),
        gcode_file: String::new(),
        start_time: "a".into(),
        end_time: "b".into(),
    };

    let err = cloud.upload_job_end(&end, &csv, None).await.unwrap_err();
    assert!(matches!(err, AgentError::Status { status: 503, .. }));

    let missing = dir.path().join("missing.csv");
    let err = cloud.upload_job_end(&end, &missing, None).await.unwrap_err();
    assert!(matches!(err, AgentError::Io { .. }));
    assert!(backend.uploads().is_empty());
}

#[tokio::test]
async fn frames_upload_as_png_parts() {
    if !loopback_available().await {
        eprintln!("skipping frames_upload_as_png_parts: loopback bind not permitted");
        return;
    }
    let backend = Backend::default();
    let addr = start_backend(backend.clone()).await;
    let (cloud, _writer) = client(addr, "tok");

    let meta = FrameMeta {
        name: "image_7.png".into(),
        img_file: "image_7.png".into(),
        count: 7,
        timestamp: "2024-01-01T00:00:07.000Z".into(),
        flow_rate: 100.0,
        feed_rate: 100.0,
        z_offset: 0.0,
        hotend_target: 210.0,
        hotend_actual: 209.0,
        bed_target: 60.0,
        bed_actual: 59.5,
        nozzle_tip_coords_x: 10,
        nozzle_tip_coords_y: 12,
        flip_h: false,
        flip_v: true,
        rotate: false,
    };
    cloud.upload_frame(&meta, vec![0x89, b'P', b'N', b'G']).await.unwrap();

    let uploads = backend.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, "new-image");
    assert!(uploads[0].body.contains("name=\"image_obj\"; filename=\"image_7.png\""));
    assert!(uploads[0].body.contains("Content-Type: image/png"));
    assert!(uploads[0].body.contains("\"count\":7"));
}

#[tokio::test]
async fn staged_files_are_downloaded() {
    if !loopback_available().await {
        eprintln!("skipping staged_files_are_downloaded: loopback bind not permitted");
        return;
    }
    let addr = start_backend(Backend::default()).await;
    let (cloud, _writer) = client(addr, "tok");

    let body = cloud.fetch_staged_file("bucket/cube.gcode").await.unwrap();
    assert_eq!(body, b"G28\nM84\n");

    let err = cloud.fetch_staged_file("bucket/missing").await.unwrap_err();
    assert!(matches!(err, AgentError::Status { status: 404, .. }));
}
