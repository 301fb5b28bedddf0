use std::sync::Arc;

use agentrix_protocol::github::{IssueDetail, PullDetail, RepoSummary};
use agentrix_protocol::{
    ApiResponse, LaunchResponse, OpenTerminalRequest, OpenTerminalResponse, RepositorySnapshot,
    SessionIdentity, SessionKind, SessionSummary, Task,
};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use libagentrix::{AgentrixError, CloseOptions, SpawnOptions, validate_launch_payload, verify_api_key};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::info;

use crate::auth::presented_api_key;
use crate::error::{ApiError, ApiResult};
use crate::github::GitHubClient;
use crate::state::AppState;

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

/// `POST /api/automation/launch`
pub async fn launch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<LaunchResponse>>> {
    let presented = presented_api_key(&headers);
    verify_api_key(state.api_key.as_deref(), presented.as_deref())?;
    // Only authenticated callers reach the limiter, so the key is the bucket.
    state.check_rate_limit(presented.as_deref().unwrap_or_default())?;

    let payload: Value = parse_body(&body)?;
    let request = validate_launch_payload(&payload, &state.agent_commands)?;

    let (task_id, outcome) = state.runner.execute(&state.tasks, &request).await;
    let result = outcome?;
    Ok(Json(ApiResponse::success(LaunchResponse { task_id, result })))
}

/// `GET /api/tasks`
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Task>>> {
    Json(ApiResponse::success(state.tasks.list()))
}

/// `GET /api/tasks/{id}`
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Task>>> {
    let task = state
        .tasks
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("task not found: {id}")))?;
    Ok(Json(ApiResponse::success(task)))
}

/// `POST /api/terminal/open`: resume the default interactive session for a
/// worktree, or spawn one. Fresh sessions get the repository's init command.
pub async fn open_terminal(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<OpenTerminalResponse>>> {
    let request: OpenTerminalRequest = parse_body(&body)?;
    let (org, repo, branch) = (request.org.trim(), request.repo.trim(), request.branch.trim());
    if org.is_empty() || repo.is_empty() || branch.is_empty() {
        return Err(ApiError::bad_request("org, repo and branch are required"));
    }

    let identity = SessionIdentity::new(org, repo, branch);
    let worktree_path = state
        .git
        .locate_worktree(&state.workdir, org, repo, branch)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no worktree for {identity}")))?;

    let mut options = SpawnOptions::new(SessionKind::Interactive, worktree_path);
    options.name = request
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    options.mode = request.mode;
    options.initial_input = agentrix_git::init_command(&state.workdir, org, repo)
        .map(|command| vec![format!("{command}\r")])
        .unwrap_or_default();

    let spawned = state.registry.open_interactive(identity, options).await?;
    let session = spawned.session;
    Ok(Json(ApiResponse::success(OpenTerminalResponse {
        session_id: session.id().clone(),
        created: spawned.created,
        using_tmux: session.using_tmux(),
        tmux_session_name: session.tmux_session_name().map(ToOwned::to_owned),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionFilter {
    pub org: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
}

impl SessionFilter {
    fn matches(&self, identity: &SessionIdentity) -> bool {
        let field = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);
        field(&self.org, &identity.org)
            && field(&self.repo, &identity.repo)
            && field(&self.branch, &identity.branch)
    }
}

/// `GET /api/sessions`
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<SessionFilter>,
) -> Json<ApiResponse<Vec<SessionSummary>>> {
    let mut summaries = Vec::new();
    for session in state.registry.list().await {
        if filter.matches(session.identity()) {
            summaries.push(session.summary(state.idle_threshold).await);
        }
    }
    Json(ApiResponse::success(summaries))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseQuery {
    #[serde(default)]
    pub close_remote: bool,
}

/// `DELETE /api/sessions/{id}`
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<CloseQuery>,
) -> ApiResult<Json<ApiResponse<SessionSummary>>> {
    state
        .registry
        .close(
            &id,
            CloseOptions {
                close_remote: query.close_remote,
            },
        )
        .await?;
    info!(session_id = %id, close_remote = query.close_remote, "session closed by request");
    let session = state.registry.get_by_id(&id).await?;
    Ok(Json(ApiResponse::success(
        session.summary(state.idle_threshold).await,
    )))
}

/// `GET /api/repos`
pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ApiResponse<RepositorySnapshot>>> {
    let snapshot = state
        .git
        .discover_repositories(&state.workdir)
        .await
        .map_err(AgentrixError::Internal)?;
    Ok(Json(ApiResponse::success(snapshot)))
}

fn github(state: &AppState) -> ApiResult<&GitHubClient> {
    state.github.as_ref().ok_or_else(|| {
        AgentrixError::ServiceUnavailable("GitHub integration is not configured".to_string())
            .into()
    })
}

/// `GET /api/repos/{org}/{repo}/github`
pub async fn github_summary(
    State(state): State<Arc<AppState>>,
    Path((org, repo)): Path<(String, String)>,
) -> ApiResult<Json<ApiResponse<RepoSummary>>> {
    let summary = github(&state)?.repo_summary(&org, &repo).await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// `GET /api/repos/{org}/{repo}/issues/{number}`
pub async fn github_issue(
    State(state): State<Arc<AppState>>,
    Path((org, repo, number)): Path<(String, String, u32)>,
) -> ApiResult<Json<ApiResponse<IssueDetail>>> {
    let issue = github(&state)?.issue_detail(&org, &repo, number).await?;
    Ok(Json(ApiResponse::success(issue)))
}

/// `GET /api/repos/{org}/{repo}/pulls/{number}`
pub async fn github_pull(
    State(state): State<Arc<AppState>>,
    Path((org, repo, number)): Path<(String, String, u32)>,
) -> ApiResult<Json<ApiResponse<PullDetail>>> {
    let pull = github(&state)?.pull_detail(&org, &repo, number).await?;
    Ok(Json(ApiResponse::success(pull)))
}

/// `GET /api/health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_filter_matches_given_fields_only() {
        let identity = SessionIdentity::new("acme", "app", "main");
        assert!(SessionFilter::default().matches(&identity));
        assert!(
            SessionFilter {
                org: Some("acme".into()),
                branch: Some("main".into()),
                ..Default::default()
            }
            .matches(&identity)
        );
        assert!(
            !SessionFilter {
                repo: Some("web".into()),
                ..Default::default()
            }
            .matches(&identity)
        );
    }
}
