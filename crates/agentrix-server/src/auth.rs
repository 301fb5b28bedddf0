//! Credential extraction for the two guarded surfaces: the session token
//! that protects the UI routes and terminal socket, and the API key that
//! protects the automation endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, Uri, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "agentrix_session";
pub const API_KEY_HEADER: &str = "x-api-key";

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

/// Session token from `Authorization: Bearer`, the session cookie or a
/// `token` query parameter, in that order.
pub fn presented_session_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    bearer(headers)
        .or_else(|| cookie(headers, SESSION_COOKIE))
        .or_else(|| {
            Query::<HashMap<String, String>>::try_from_uri(uri)
                .ok()
                .and_then(|Query(mut params)| params.remove("token"))
        })
        .filter(|t| !t.is_empty())
}

/// API key from `x-api-key`, falling back to `Authorization: Bearer`.
pub fn presented_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .or_else(|| bearer(headers))
        .filter(|k| !k.is_empty())
}

pub fn token_matches(tokens: &[String], presented: &str) -> bool {
    tokens
        .iter()
        .any(|t| bool::from(t.as_bytes().ct_eq(presented.as_bytes())))
}

pub fn check_session(state: &AppState, headers: &HeaderMap, uri: &Uri) -> Result<(), ApiError> {
    match presented_session_token(headers, uri) {
        Some(token) if token_matches(&state.session_tokens, &token) => Ok(()),
        Some(_) => Err(ApiError::unauthorized("invalid session token")),
        None => Err(ApiError::unauthorized("missing session token")),
    }
}

/// Middleware for routes that need a valid session token.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match check_session(&state, request.headers(), request.uri()) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}
