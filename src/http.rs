//! HTTP surface.
//!
//! ```text
//! GET /                              banner
//! GET /geosite                       published index (JSON)
//! GET /geosite/{name}[@filter]       rules, balanced mode
//! GET /geosite/{mode}/{name}[@filter]
//! ```
//!
//! Anything but `GET` is answered with 405 before routing.

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use geosite_core::Mode;
use geosite_service::{ErrorKind, GeositeService, IndexView, Served};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const BANNER: &str = concat!(
    "geosite ",
    env!("CARGO_PKG_VERSION"),
    "\n\nGET /geosite\nGET /geosite/{list}[@filter]\nGET /geosite/{strict|balanced|full}/{list}[@filter]\n"
);
const NOT_READY: &str = "geosite data not ready";
const TEXT: &str = "text/plain; charset=utf-8";
const JSON: &str = "application/json; charset=utf-8";

pub fn router(service: GeositeService) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/geosite", get(index))
        .route("/geosite/*rest", get(rules))
        .fallback(not_found)
        .layer(middleware::from_fn(only_get))
        .with_state(service)
}

async fn only_get(request: Request, next: Next) -> Response {
    if request.method() != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
    }
    next.run(request).await
}

async fn banner() -> &'static str {
    BANNER
}

async fn not_found() -> Response {
    not_found_response()
}

fn not_found_response() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn respond(status: StatusCode, content_type: &str, headers: &[(&'static str, &str)], body: String) -> Response {
    let mut builder = Response::builder().status(status).header(header::CONTENT_TYPE, content_type);
    for (name, value) in headers {
        builder = builder.header(HeaderName::from_static(name), *value);
    }
    builder.body(Body::from(body)).unwrap_or_else(|err| {
        tracing::error!(error = %err, "Failed to build response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

fn error_response(err: &geosite_service::Error) -> Response {
    match &**err {
        ErrorKind::InvalidName(_) => (StatusCode::BAD_REQUEST, "invalid name").into_response(),
        ErrorKind::NotReady => (StatusCode::SERVICE_UNAVAILABLE, NOT_READY).into_response(),
        ErrorKind::ListNotFound(name) => (StatusCode::NOT_FOUND, format!("list not found: {name}")).into_response(),
        _ => {
            tracing::error!(error = ?err, "Request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        },
    }
}

async fn index(State(service): State<GeositeService>) -> Response {
    let IndexView { pointer, index } = match service.index().await {
        Ok(view) => view,
        Err(err) if *err == ErrorKind::NotReady => {
            let body = serde_json::json!({ "ok": false, "error": NOT_READY }).to_string();
            return respond(StatusCode::SERVICE_UNAVAILABLE, JSON, &[], body);
        },
        Err(err) => return error_response(&err),
    };
    let body = match serde_json::to_string(&index) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(error = %err, "Failed to encode index");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        },
    };
    let generated_at = timestamp(pointer.snapshot.generated_at);
    let checked_at = timestamp(pointer.checked_at);
    let headers = [
        ("x-upstream-etag", pointer.etag()),
        ("x-generated-at", generated_at.as_str()),
        ("x-checked-at", checked_at.as_str()),
    ];
    respond(StatusCode::OK, JSON, &headers, body)
}

/// `mode` and decoded `name[@filter]` from the path after `/geosite/`.
///
/// The first segment is a mode only when more segments follow it.
fn parse_rules_path(rest: &str) -> Result<(Mode, String), Response> {
    let segments: Vec<&str> = rest.split('/').filter(|segment| !segment.is_empty()).collect();
    let (mode, name) = match segments.as_slice() {
        [] => return Err(not_found_response()),
        [first, name @ ..] if !name.is_empty() => match Mode::ALL.into_iter().find(|mode| mode.as_str() == *first) {
            Some(mode) => (mode, name),
            None => (Mode::default(), segments.as_slice()),
        },
        all => (Mode::default(), all),
    };
    match urlencoding::decode(&name.join("/")) {
        Ok(decoded) => Ok((mode, decoded.into_owned())),
        Err(_) => Err((StatusCode::BAD_REQUEST, "invalid path encoding").into_response()),
    }
}

async fn rules(State(service): State<GeositeService>, uri: Uri) -> Response {
    let rest = uri.path().strip_prefix("/geosite/").unwrap_or_default();
    let (mode, name) = match parse_rules_path(rest) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    match service.request(mode, &name).await {
        Ok(served) => rules_response(served),
        Err(err) => error_response(&err),
    }
}

fn rules_response(served: Served) -> Response {
    let mode = served.mode.to_string();
    let mut headers = vec![
        ("x-upstream-etag", served.etag.as_str()),
        ("x-mode", mode.as_str()),
        ("x-list", served.list.as_str()),
    ];
    if let Some(filter) = &served.filter {
        headers.push(("x-filter", filter.as_str()));
    }
    if served.stale {
        headers.push(("x-stale", "1"));
    }
    respond(StatusCode::OK, TEXT, &headers, served.body)
}
