use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, error};

use echohub_core::backend::Authenticator;
use echohub_core::HubError;

/// Routes served without a session.
const PUBLIC_PATHS: &[&str] = &["/health"];

/// Routes that run without a session but never see an `Identity`; the
/// handler decides how to refuse.
const SOFT_PATHS: &[&str] = &["/ws"];

#[derive(Clone)]
pub struct AuthState {
    pub authenticator: Arc<dyn Authenticator>,
    pub cookie_name: Arc<str>,
}

fn extract_cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get(header::COOKIE)?.to_str().ok()?;
    let prefix = format!("{name}=");
    cookie
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix(&prefix).map(str::to_string))
        .filter(|value| !value.is_empty())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Resolve the session cookie to an `Identity` and attach it to the request.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if PUBLIC_PATHS.contains(&path) {
        return next.run(request).await;
    }
    let soft = SOFT_PATHS.contains(&path);

    let outcome = match extract_cookie_value(request.headers(), &auth.cookie_name) {
        Some(token) => auth.authenticator.authenticate(&token).await,
        None => Err(HubError::Unauthorized("missing session cookie".into())),
    };

    match outcome {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(HubError::Unauthorized(reason)) => {
            debug!(path = request.uri().path(), reason, "unauthenticated request");
            if soft {
                next.run(request).await
            } else {
                error_response(StatusCode::UNAUTHORIZED, "Unauthorized")
            }
        }
        Err(e) => {
            error!(error_kind = e.error_kind(), error = %e, "session lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
