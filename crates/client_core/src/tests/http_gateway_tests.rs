use std::sync::Arc;

use axum::{
    extract::Multipart,
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::{EntityPayload, Phase};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
};

use super::*;
use crate::{error::TransportErrorKind, gateway::SCHEDULE_PROPOSAL_ENTITY};

#[derive(Debug)]
struct Captured {
    headers: HeaderMap,
    body: Value,
}

#[derive(Debug)]
struct ReceivedField {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    data: Vec<u8>,
}

type Slot<T> = Arc<Mutex<Option<oneshot::Sender<T>>>>;

fn slot<T>() -> (Slot<T>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

async fn forward<T>(slot: &Slot<T>, value: T) {
    if let Some(tx) = slot.lock().await.take() {
        let _ = tx.send(value);
    }
}

async fn spawn_server(app: Router) -> Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}/api"))
}

fn gateway_for(base_url: &str, timeout: Duration) -> HttpGateway {
    HttpGateway::new(&Url::parse(base_url).expect("base url"), timeout).expect("gateway")
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn start_posts_role_and_maps_initial_state() {
    let (tx, rx) = slot::<Captured>();
    let app = Router::new().route(
        "/api/start",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                forward(&tx, Captured { headers, body }).await;
                Json(json!({
                    "session_id": "s-42",
                    "message": "Welcome! What are you setting up?",
                    "state": "initial"
                }))
            }
        }),
    );
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_secs(5));
    let intent = IntentId::generate();

    let handle = gateway
        .start(&StartConfig::Role("instructor".into()), intent)
        .await
        .expect("start");

    assert_eq!(handle.session_id, SessionId::from("s-42"));
    assert_eq!(handle.phase, Phase::FIRST_STEP);
    assert_eq!(
        handle.welcome.as_deref(),
        Some("Welcome! What are you setting up?")
    );

    let captured = rx.await.expect("request captured");
    assert_eq!(captured.body, json!({ "role": "instructor" }));
    let expected_key = intent.to_string();
    assert_eq!(
        header(&captured.headers, IDEMPOTENCY_KEY_HEADER),
        Some(expected_key.as_str())
    );
}

#[tokio::test]
async fn send_action_posts_message_and_decodes_delta() {
    let (tx, rx) = slot::<Captured>();
    let app = Router::new().route(
        "/api/message",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                forward(&tx, Captured { headers, body }).await;
                Json(json!({
                    "message": "Here is a draft schedule.",
                    "state": "confirming",
                    "message_id": "m-7",
                    "schedule_proposal": { "weeks": 12 },
                    "actions": ["confirm", "decline"]
                }))
            }
        }),
    );
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_secs(5));

    let delta = gateway
        .send_action(
            &SessionId::from("s-1"),
            &Action::Message("Twelve weeks, starting in March".into()),
            IntentId::generate(),
        )
        .await
        .expect("send action");

    assert_eq!(delta.phase, Some(Phase::Confirming));
    assert_eq!(delta.reply.as_deref(), Some("Here is a draft schedule."));
    assert_eq!(delta.ack_id, Some("m-7".into()));
    assert_eq!(delta.actions, vec!["confirm", "decline"]);
    assert_eq!(delta.upserts.len(), 1);
    assert_eq!(delta.upserts[0].id.as_str(), SCHEDULE_PROPOSAL_ENTITY);
    assert!(matches!(
        delta.upserts[0].payload,
        EntityPayload::ScheduleProposal { .. }
    ));

    let captured = rx.await.expect("request captured");
    assert_eq!(
        captured.body,
        json!({
            "session_id": "s-1",
            "message": "Twelve weeks, starting in March",
            "action": "message"
        })
    );
    assert!(header(&captured.headers, IDEMPOTENCY_KEY_HEADER).is_some());
}

#[tokio::test]
async fn upload_sends_multipart_with_guessed_mime() {
    let (tx, rx) = slot::<Vec<ReceivedField>>();
    let app = Router::new().route(
        "/api/upload",
        post(move |mut multipart: Multipart| {
            let tx = tx.clone();
            async move {
                let mut fields = Vec::new();
                while let Ok(Some(field)) = multipart.next_field().await {
                    let name = field.name().unwrap_or_default().to_string();
                    let file_name = field.file_name().map(str::to_string);
                    let content_type = field.content_type().map(str::to_string);
                    let data = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    fields.push(ReceivedField {
                        name,
                        file_name,
                        content_type,
                        data,
                    });
                }
                forward(&tx, fields).await;
                Json(json!({
                    "message": "Found 2 students.",
                    "upload_id": "u-1",
                    "file_result": { "recordCount": 2, "filename": "roster.csv" },
                    "state": "processing_files"
                }))
            }
        }),
    );
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_secs(5));
    let file = UploadFile::new("roster.csv", b"name\nAda\nGrace\n".to_vec());

    let delta = gateway
        .upload_file(&SessionId::from("s-9"), &file, IntentId::generate())
        .await
        .expect("upload");

    assert_eq!(delta.phase, Some(Phase::Active { step: 2 }));
    assert_eq!(delta.ack_id, Some("u-1".into()));
    assert_eq!(delta.file_result.map(|r| r.record_count), Some(2));

    let fields = rx.await.expect("multipart captured");
    let session_field = fields
        .iter()
        .find(|f| f.name == "session_id")
        .expect("session_id field");
    assert_eq!(session_field.data, b"s-9");
    let file_field = fields.iter().find(|f| f.name == "file").expect("file field");
    assert_eq!(file_field.file_name.as_deref(), Some("roster.csv"));
    assert_eq!(file_field.content_type.as_deref(), Some("text/csv"));
    assert_eq!(file_field.data, b"name\nAda\nGrace\n");
}

#[tokio::test]
async fn end_session_sends_session_header_and_accepts_no_content() {
    let (tx, rx) = slot::<HeaderMap>();
    let app = Router::new().route(
        "/api/session",
        delete(move |headers: HeaderMap| {
            let tx = tx.clone();
            async move {
                forward(&tx, headers).await;
                StatusCode::NO_CONTENT
            }
        }),
    );
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_secs(5));

    gateway
        .end_session(&SessionId::from("s-3"), IntentId::generate())
        .await
        .expect("end session");

    let headers = rx.await.expect("headers captured");
    assert_eq!(header(&headers, SESSION_ID_HEADER), Some("s-3"));
    assert!(header(&headers, IDEMPOTENCY_KEY_HEADER).is_some());
}

#[tokio::test]
async fn session_info_keeps_unknown_fields() {
    let app = Router::new().route(
        "/api/session/info",
        get(|headers: HeaderMap| async move {
            let id = header(&headers, SESSION_ID_HEADER).unwrap_or_default().to_string();
            Json(json!({ "time_remaining": 840, "session_id": id }))
        }),
    );
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_secs(5));

    let info = gateway
        .session_info(&SessionId::from("s-5"), IntentId::generate())
        .await
        .expect("session info");

    assert_eq!(info.time_remaining, Some(840));
    assert_eq!(info.extra.get("session_id"), Some(&json!("s-5")));
}

#[tokio::test]
async fn error_status_uses_api_error_message() {
    let app = Router::new().route(
        "/api/message",
        post(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": "session not found" })),
            )
        }),
    );
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_secs(5));

    let err = gateway
        .send_action(
            &SessionId::from("gone"),
            &Action::Confirm,
            IntentId::generate(),
        )
        .await
        .expect_err("404 must fail");

    assert_eq!(err.kind, TransportErrorKind::Server);
    assert_eq!(err.status, Some(404));
    assert_eq!(err.message, "session not found");
}

#[tokio::test]
async fn plain_text_error_body_is_kept_verbatim() {
    let app = Router::new().route(
        "/api/start",
        post(|| async { (StatusCode::BAD_GATEWAY, "upstream unavailable") }),
    );
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_secs(5));

    let err = gateway
        .start(&StartConfig::Organization("org-1".into()), IntentId::generate())
        .await
        .expect_err("502 must fail");

    assert_eq!(err.status, Some(502));
    assert_eq!(err.message, "upstream unavailable");
}

#[tokio::test]
async fn undecodable_success_body_is_a_server_error() {
    let app = Router::new().route("/api/start", post(|| async { "<html>oops</html>" }));
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_secs(5));

    let err = gateway
        .start(&StartConfig::Role("admin".into()), IntentId::generate())
        .await
        .expect_err("html is not a start response");

    assert_eq!(err.kind, TransportErrorKind::Server);
    assert!(err.message.starts_with("malformed response"));
}

#[tokio::test]
async fn slow_server_times_out() {
    let app = Router::new().route(
        "/api/message",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Json(json!({ "state": "gathering_info" }))
        }),
    );
    let base = spawn_server(app).await.expect("spawn server");
    let gateway = gateway_for(&base, Duration::from_millis(150));

    let err = gateway
        .send_action(
            &SessionId::from("s-1"),
            &Action::Message("hello".into()),
            IntentId::generate(),
        )
        .await
        .expect_err("request must time out");

    assert_eq!(err.kind, TransportErrorKind::Timeout);
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let gateway = gateway_for(&format!("http://{addr}/api"), Duration::from_secs(5));

    let err = gateway
        .end_session(&SessionId::from("s-1"), IntentId::generate())
        .await
        .expect_err("nothing is listening");

    assert_eq!(err.kind, TransportErrorKind::Network);
}
