//! GitHub views against a local stand-in for the GitHub REST API.

use std::path::Path;
use std::sync::Arc;

use agentrix_server::config::FileConfig;
use agentrix_server::{AppState, Args, RuntimeConfig, router};
use axum::body::Body;
use axum::extract::Path as UrlPath;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{Value, json};
use tower::ServiceExt;

const TOKEN: &str = "ui-token";
const GITHUB_TOKEN: &str = "gh-secret";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {GITHUB_TOKEN}"))
}

fn user(login: &str) -> Value {
    json!({"login": login, "avatar_url": format!("https://avatars/{login}")})
}

async fn issues(headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({}))).into_response();
    }
    Json(json!([
        {"number": 7, "title": "Crash on start", "html_url": "https://gh/7",
         "labels": [{"name": "bug"}], "assignee": user("dev")},
        {"number": 8, "title": "Add login", "html_url": "https://gh/8",
         "labels": [], "assignee": null, "pull_request": {"url": "https://gh/pr/8"}}
    ]))
    .into_response()
}

async fn pulls(headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({}))).into_response();
    }
    Json(json!([
        {"number": 8, "title": "Add login", "html_url": "https://gh/pr/8",
         "labels": [{"name": "feature"}], "user": user("author")}
    ]))
    .into_response()
}

async fn issue(UrlPath((_, _, number)): UrlPath<(String, String, u32)>) -> impl IntoResponse {
    if number != 7 {
        return (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))).into_response();
    }
    Json(json!({
        "number": 7, "title": "Crash on start", "body": null, "html_url": "https://gh/7",
        "labels": [{"name": "bug"}], "assignee": null, "user": user("reporter"), "state": "open"
    }))
    .into_response()
}

async fn pull(UrlPath((_, _, number)): UrlPath<(String, String, u32)>) -> Json<Value> {
    Json(json!({
        "number": number, "title": "Add login", "body": "Adds a login page",
        "html_url": "https://gh/pr/8", "labels": [], "user": user("author"), "state": "closed"
    }))
}

async fn start_github() -> String {
    let app = Router::new()
        .route("/repos/{owner}/{repo}/issues", get(issues))
        .route("/repos/{owner}/{repo}/pulls", get(pulls))
        .route("/repos/{owner}/{repo}/issues/{number}", get(issue))
        .route("/repos/{owner}/{repo}/pulls/{number}", get(pull));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn app(workdir: &Path, github: &str) -> Router {
    let args = Args::parse_from([
        "agentrix",
        "--workdir",
        workdir.to_str().expect("utf-8 path"),
    ]);
    let file: FileConfig =
        toml::from_str(&format!("[sessions]\ntokens = [\"{TOKEN}\"]\n{github}")).expect("toml");
    let cfg = RuntimeConfig::resolve(&args, file, |_| None).expect("config");
    let state = Arc::new(AppState::from_config(&cfg).expect("state"));
    router(state, &[]).expect("router")
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::get(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("oneshot");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn views_are_unavailable_without_a_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(dir.path(), "");
    let (status, body) = get_json(&app, "/api/repos/acme/app/github").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "service_unavailable");
}

#[tokio::test]
async fn summary_separates_issues_from_pull_requests() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = start_github().await;
    let app = app(
        dir.path(),
        &format!("[github]\ntoken = \"{GITHUB_TOKEN}\"\napi_url = \"{api}\"\n"),
    );

    let (status, body) = get_json(&app, "/api/repos/acme/app/github").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let summary = &body["data"];
    assert_eq!(summary["openIssuesCount"], 1);
    assert_eq!(summary["openPrsCount"], 1);
    assert_eq!(summary["issues"][0]["number"], 7);
    assert_eq!(summary["issues"][0]["labels"], json!(["bug"]));
    assert_eq!(summary["issues"][0]["assignee"]["login"], "dev");
    assert_eq!(summary["pullRequests"][0]["user"]["login"], "author");
}

#[tokio::test]
async fn issue_and_pull_details() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = start_github().await;
    let app = app(
        dir.path(),
        &format!("[github]\ntoken = \"{GITHUB_TOKEN}\"\napi_url = \"{api}\"\n"),
    );

    let (status, body) = get_json(&app, "/api/repos/acme/app/issues/7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["body"], "");
    assert_eq!(body["data"]["state"], "open");
    assert!(body["data"].get("assignee").is_none());

    let (status, body) = get_json(&app, "/api/repos/acme/app/issues/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = get_json(&app, "/api/repos/acme/app/pulls/8").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["body"], "Adds a login page");
    assert_eq!(body["data"]["state"], "closed");
}

#[tokio::test]
async fn rejected_github_token_is_an_internal_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = start_github().await;
    let app = app(
        dir.path(),
        &format!("[github]\ntoken = \"wrong\"\napi_url = \"{api}\"\n"),
    );
    let (status, body) = get_json(&app, "/api/repos/acme/app/github").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        body["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("401")),
        "{body}"
    );
}
