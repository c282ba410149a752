use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::ApiError, state::AppState};

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn is_ws_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// `Ok(None)` when the request carries no Origin (curl, the desktop shell's
/// native side); `Err` when the header is present but unreadable.
fn request_origin(headers: &HeaderMap) -> Result<Option<&str>, ()> {
    match headers.get(header::ORIGIN) {
        Some(v) => v.to_str().map(Some).map_err(|_| ()),
        None => Ok(None),
    }
}

pub(crate) fn origin_is_allowed(allowed: &[String], origin: &str) -> bool {
    let origin = origin.trim_end_matches('/');
    allowed.iter().any(|a| a == origin)
}

fn apply_cors(headers: &mut HeaderMap, origin: &str) {
    if let Ok(v) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
}

fn forbidden() -> Response {
    ApiError::new(StatusCode::FORBIDDEN, "origin_not_allowed", "origin not allowed").into_response()
}

// Middleware: Origin allowlist + CORS.
//
// Requests without an Origin pass. A disallowed origin only gets plain
// reads through, and those carry no CORS headers.
pub async fn origin_guard(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let origin = match request_origin(req.headers()) {
        Ok(origin) => origin.map(str::to_string),
        Err(()) => return forbidden(),
    };
    let allowed = origin
        .as_deref()
        .is_none_or(|o| origin_is_allowed(&state.config.allowed_origins, o));

    if req.method() == Method::OPTIONS {
        let Some(origin) = origin.filter(|_| allowed) else {
            return forbidden();
        };
        let mut res = StatusCode::NO_CONTENT.into_response();
        apply_cors(res.headers_mut(), &origin);
        return res;
    }

    if !allowed && (is_unsafe_method(req.method()) || is_ws_upgrade(req.headers())) {
        tracing::warn!(origin = origin.as_deref().unwrap_or_default(), method = %req.method(), "rejected cross-origin request");
        return forbidden();
    }

    let mut res = next.run(req).await;
    if let Some(origin) = origin.filter(|_| allowed) {
        apply_cors(res.headers_mut(), &origin);
    }
    res
}
