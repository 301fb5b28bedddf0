pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod generators;
pub mod github;
pub mod routes;
pub mod state;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub use config::{Args, RuntimeConfig};
pub use state::AppState;

/// Build the HTTP router. Everything except the automation endpoint and the
/// health check sits behind the session credential.
pub fn router(state: Arc<AppState>, allow_origins: &[String]) -> Result<Router> {
    let protected = Router::new()
        .route("/api/tasks", get(routes::list_tasks))
        .route("/api/tasks/{id}", get(routes::get_task))
        .route("/api/terminal/open", post(routes::open_terminal))
        .route("/api/terminal/socket", get(ws::terminal_socket))
        .route("/api/sessions", get(routes::list_sessions))
        .route("/api/sessions/{id}", delete(routes::close_session))
        .route("/api/repos", get(routes::list_repositories))
        .route("/api/repos/{org}/{repo}/github", get(routes::github_summary))
        .route("/api/repos/{org}/{repo}/issues/{number}", get(routes::github_issue))
        .route("/api/repos/{org}/{repo}/pulls/{number}", get(routes::github_pull))
        .route("/api/events", get(events::stream))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_session,
        ));

    let app = Router::new()
        .route("/api/automation/launch", post(routes::launch))
        .route("/api/health", get(routes::health))
        .merge(protected);

    let app = match build_cors(allow_origins)? {
        Some(cors) => app.layer(cors),
        None => app,
    };
    Ok(app.with_state(state))
}

/// CORS for the configured origins. `*` allows any; no origins means the UI
/// is served same-origin and no layer is needed.
fn build_cors(origins: &[String]) -> Result<Option<CorsLayer>> {
    if origins.is_empty() {
        return Ok(None);
    }
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    if origins.iter().any(|o| o == "*") {
        return Ok(Some(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(methods)
                .allow_headers(Any),
        ));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid --allow-origin value: {origin}"))?,
        );
    }
    Ok(Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(methods)
            .allow_headers(Any),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_origins() {
        assert!(build_cors(&[]).expect("empty").is_none());
        assert!(build_cors(&["*".to_string()]).expect("any").is_some());
        assert!(
            build_cors(&["http://localhost:5173".to_string()])
                .expect("list")
                .is_some()
        );
        assert!(build_cors(&["bad\norigin".to_string()]).is_err());
    }
}
