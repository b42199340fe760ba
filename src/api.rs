//! Thin HTTP surface over the control plane.
//!
//! The conforming operation surface is the `Dms` facade; this router maps a
//! handful of session and queue operations onto JSON endpoints for
//! dashboards and editor clients. Handlers hold no business logic.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::audit::RequestMetadata;
use crate::service::Dms;
use crate::DmsError;

/// Build the router over an already-opened control plane
pub fn router(dms: Dms) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/validate", get(validate))
        .route("/api/auth/logout", post(logout))
        .route("/api/tasks", get(tasks))
        .with_state(dms)
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn error_response(err: DmsError) -> Response {
    let status = if err.is_internal() {
        tracing::error!(error = %err, code = err.error_code(), "internal error");
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        match &err {
            DmsError::InvalidCredentials
            | DmsError::Deactivated
            | DmsError::SessionSuperseded => StatusCode::UNAUTHORIZED,
            DmsError::SessionConflict | DmsError::Conflict { .. } | DmsError::Locked { .. } => {
                StatusCode::CONFLICT
            }
            DmsError::PermissionDenied { .. } | DmsError::ESignatureMismatch => {
                StatusCode::FORBIDDEN
            }
            DmsError::NotFound { .. } => StatusCode::NOT_FOUND,
            DmsError::AlreadyExists { .. } => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        }
    };
    let body = ErrorBody {
        error: err.error_code(),
        message: err.to_string(),
    };
    (status, Json(body)).into_response()
}

fn request_metadata(headers: &HeaderMap) -> RequestMetadata {
    RequestMetadata {
        ip_address: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    #[serde(default)]
    force: bool,
}

async fn login(
    State(dms): State<Dms>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Response {
    let meta = request_metadata(&headers);
    match dms
        .auth
        .login(&request.username, &request.password, request.force, &meta)
    {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn validate(State(dms): State<Dms>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(DmsError::InvalidCredentials);
    };
    match dms.auth.validate(&token) {
        Ok(probe) => (StatusCode::OK, Json(probe)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn logout(State(dms): State<Dms>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(DmsError::InvalidCredentials);
    };
    let meta = request_metadata(&headers);
    match dms.auth.logout(&token, &meta) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn tasks(State(dms): State<Dms>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(DmsError::InvalidCredentials);
    };
    let principal = match dms.auth.authenticate(&token) {
        Ok(p) => p,
        Err(err) => return error_response(err),
    };
    match dms.tasks.pending_tasks(&principal) {
        Ok(tasks) => (StatusCode::OK, Json(tasks)).into_response(),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request};
    use hyper::Body;
    use tower::ServiceExt; // for `oneshot`

    use crate::session::{Session, SessionProbe};

    async fn setup() -> (Router, Dms) {
        let dms = Dms::open_in_memory().unwrap();
        dms.principals
            .bootstrap_admin("root", "bootstrap-secret")
            .unwrap();
        (router(dms.clone()), dms)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).expect("valid JSON body")
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (router, _dms) = setup().await;
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_and_task_feed() {
        let (router, _dms) = setup().await;

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"username":"root","password":"bootstrap-secret"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session: Session = body_json(response).await;
        assert_eq!(session.username, "root");

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/tasks")
                    .header(header::AUTHORIZATION, format!("Bearer {}", session.token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let tasks: Vec<serde_json::Value> = body_json(response).await;
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_login_failure_is_unauthorized() {
        let (router, _dms) = setup().await;
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"username":"root","password":"wrong"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["error"], "AUTH_INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn test_second_login_conflicts() {
        let (router, _dms) = setup().await;
        let login_request = || {
            Request::builder()
                .method(Method::POST)
                .uri("/api/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"username":"root","password":"bootstrap-secret"}"#,
                ))
                .unwrap()
        };

        let first = router.clone().oneshot(login_request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = router.clone().oneshot(login_request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        // Forced login supersedes
        let forced = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"username":"root","password":"bootstrap-secret","force":true}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forced.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_validate_probe() {
        let (router, dms) = setup().await;
        let session = dms
            .auth
            .login("root", "bootstrap-secret", false, &Default::default())
            .unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/auth/validate")
                    .header(header::AUTHORIZATION, format!("Bearer {}", session.token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let probe: SessionProbe = body_json(response).await;
        assert!(probe.valid);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/auth/validate")
                    .header(header::AUTHORIZATION, "Bearer bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let probe: SessionProbe = body_json(response).await;
        assert!(!probe.valid);
        assert_eq!(probe.reason.as_deref(), Some("unknown"));
    }
}
