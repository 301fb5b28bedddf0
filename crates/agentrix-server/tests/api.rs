use std::path::Path;
use std::sync::Arc;

use agentrix_server::config::FileConfig;
use agentrix_server::{AppState, Args, RuntimeConfig, router};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use clap::Parser;
use serde_json::{Value, json};
use tower::ServiceExt;

const API_KEY: &str = "secret-key";
const TOKEN: &str = "ui-token";

fn config(workdir: &Path, file: &str) -> RuntimeConfig {
    let args = Args::parse_from([
        "agentrix",
        "--host",
        "127.0.0.1",
        "--port",
        "0",
        "--workdir",
        workdir.to_str().expect("utf-8 path"),
    ]);
    let file: FileConfig = toml::from_str(file).expect("config toml");
    RuntimeConfig::resolve(&args, file, |_| None).expect("runtime config")
}

fn default_file(upstream: &Path) -> String {
    format!(
        r#"
        [automation]
        api_key = "{API_KEY}"
        rate_limit_max_attempts = 2

        [sessions]
        tokens = ["{TOKEN}"]
        mode = "direct"
        shell = "/bin/sh"
        shell_args = []
        ready_delay_ms = 50

        [git]
        clone_url_template = "{}/{{org}}/{{repo}}"
        "#,
        upstream.display()
    )
}

struct Harness {
    app: Router,
    state: Arc<AppState>,
    workdir: tempfile::TempDir,
}

fn harness_with(file: impl FnOnce(&Path) -> String) -> Harness {
    let workdir = tempfile::tempdir().expect("tempdir");
    let cfg = config(workdir.path(), &file(&workdir.path().join("upstream")));
    let state = Arc::new(AppState::from_config(&cfg).expect("state"));
    let app = router(Arc::clone(&state), &[]).expect("router");
    Harness {
        app,
        state,
        workdir,
    }
}

fn harness() -> Harness {
    harness_with(default_file)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value, Response<Body>) {
    let response = app.clone().oneshot(request).await.expect("oneshot");
    let status = response.status();
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value, Response::from_parts(parts, Body::empty()))
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .expect("request")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn launch(key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::post("/api/automation/launch")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

#[tokio::test]
async fn health_is_public() {
    let h = harness();
    let request = Request::get("/api/health").body(Body::empty()).expect("request");
    let (status, body, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn ui_routes_require_session_token() {
    let h = harness();

    let bare = Request::get("/api/sessions").body(Body::empty()).expect("request");
    let (status, body, _) = send(&h.app, bare).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let wrong = Request::get("/api/sessions")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&h.app, wrong).await.0, StatusCode::UNAUTHORIZED);

    let (status, body, _) = send(&h.app, get("/api/sessions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let by_query = Request::get(format!("/api/repos?token={TOKEN}"))
        .body(Body::empty())
        .expect("request");
    let (status, body, _) = send(&h.app, by_query).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({}));

    let by_cookie = Request::get("/api/tasks")
        .header(header::COOKIE, format!("agentrix_session={TOKEN}"))
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&h.app, by_cookie).await.0, StatusCode::OK);
}

#[tokio::test]
async fn launch_is_disabled_without_api_key() {
    let h = harness_with(|_| format!("[sessions]\ntokens = [\"{TOKEN}\"]\n"));
    let (status, body, _) = send(
        &h.app,
        launch(Some("anything"), json!({"repo": "acme/app", "command": "codex"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "service_unavailable");
}

#[tokio::test]
async fn launch_rejects_missing_or_wrong_key() {
    let h = harness();
    let payload = json!({"repo": "acme/app", "command": "codex"});
    assert_eq!(
        send(&h.app, launch(None, payload.clone())).await.0,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        send(&h.app, launch(Some("wrong"), payload)).await.0,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn launch_validates_payload() {
    let h = harness();
    let (status, body, _) = send(
        &h.app,
        launch(Some(API_KEY), json!({"repo": "acme", "command": "codex"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body, _) = send(
        &h.app,
        launch(Some(API_KEY), json!({"repo": "acme/app", "command": "vim"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["error"]["message"].as_str().expect("message");
    assert!(message.contains("codex"), "{message}");
}

#[tokio::test]
async fn launch_attempts_are_rate_limited() {
    let h = harness();
    let payload = json!({"repo": "not-valid"});
    for _ in 0..2 {
        assert_eq!(
            send(&h.app, launch(Some(API_KEY), payload.clone())).await.0,
            StatusCode::BAD_REQUEST
        );
    }
    let (status, body, response) = send(&h.app, launch(Some(API_KEY), payload)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "rate_limited");
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("retry-after");
    assert!((1..=60).contains(&retry_after));
}

#[tokio::test]
async fn plan_without_plan_service_fails_before_git() {
    let h = harness();
    let (status, body, _) = send(
        &h.app,
        launch(
            Some(API_KEY),
            json!({"repo": "acme/app", "command": "codex", "plan": true, "prompt": "Improve DX", "worktree": "dx"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["step"], "GENERATE_PLAN");
    assert!(!h.workdir.path().join("acme").exists());
}

#[tokio::test]
async fn launch_without_worktree_needs_a_branch_generator() {
    let h = harness();
    let (status, body, _) = send(
        &h.app,
        launch(
            Some(API_KEY),
            json!({"repo": "acme/app", "command": "codex", "prompt": "Improve DX"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "service_unavailable");
    assert_eq!(body["error"]["step"], "RESOLVE_BRANCH");
    assert!(!h.workdir.path().join("acme").exists());
}

#[tokio::test]
async fn failed_launch_reports_step_and_records_task() {
    let h = harness();
    let (status, body, _) = send(
        &h.app,
        launch(
            Some(API_KEY),
            json!({"repo": "acme/app", "command": "codex", "worktree": "Fix Login"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "internal_error");
    assert_eq!(body["error"]["step"], "ENSURE_REPO");

    let (status, body, _) = send(&h.app, get("/api/tasks")).await;
    assert_eq!(status, StatusCode::OK);
    let tasks = body["data"].as_array().expect("tasks");
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task["type"], "automation-launch");
    assert_eq!(task["status"], "failed");
    assert_eq!(task["metadata"]["branch"], "fix-login");
    assert_eq!(task["metadata"]["failedStep"], "ENSURE_REPO");
    assert_eq!(task["steps"][0]["status"], "completed");
    assert_eq!(task["steps"][1]["status"], "failed");

    let id = task["id"].as_str().expect("id");
    let (status, body, _) = send(&h.app, get(&format!("/api/tasks/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], id);

    let (status, _, _) = send(&h.app, get("/api/tasks/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn open_terminal_needs_an_existing_worktree() {
    let h = harness();
    let (status, body, _) = send(
        &h.app,
        post_json(
            "/api/terminal/open",
            json!({"org": "acme", "repo": "app", "branch": "main"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _, _) = send(
        &h.app,
        post_json("/api/terminal/open", json!({"org": "acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn open_resume_list_and_close_terminal() {
    let h = harness();
    std::fs::create_dir_all(h.workdir.path().join("acme/app/main")).expect("worktree dir");
    let open = json!({"org": "acme", "repo": "app", "branch": "main"});

    let (status, body, _) = send(&h.app, post_json("/api/terminal/open", open.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["created"], true);
    assert_eq!(body["data"]["usingTmux"], false);
    let id = body["data"]["sessionId"].as_str().expect("session id").to_string();

    let (_, body, _) = send(&h.app, post_json("/api/terminal/open", open)).await;
    assert_eq!(body["data"]["created"], false);
    assert_eq!(body["data"]["sessionId"], id.as_str());

    let (_, body, _) = send(&h.app, get("/api/sessions?org=acme&branch=main")).await;
    let sessions = body["data"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["kind"], "interactive");
    assert_eq!(sessions[0]["closed"], false);
    assert_eq!(sessions[0]["logEvictedBytes"], 0);

    let (_, body, _) = send(&h.app, get("/api/sessions?repo=web")).await;
    assert_eq!(body["data"], json!([]));

    let delete = Request::delete(format!("/api/sessions/{id}?closeRemote=true"))
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .expect("request");
    let (status, body, _) = send(&h.app, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["closed"], true);

    let missing = Request::delete("/api/sessions/nope")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&h.app, missing).await.0, StatusCode::NOT_FOUND);

    h.state.registry.shutdown().await;
}
