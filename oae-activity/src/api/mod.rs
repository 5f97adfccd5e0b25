//! HTTP/WebSocket surface of the activity module
//!
//! Identity arrives in gateway-injected headers (`x-oae-user`,
//! `x-oae-tenant`, `x-oae-admin`); the WebSocket path authenticates itself
//! with an expiring signature instead. Reads authorize through the principal
//! visibility rule and resolve to the matching visibility-suffixed feed.

pub mod activity;
pub mod push;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::convert::Infallible;

use crate::error::Result;
use crate::kv::KeyValue;
use crate::state::ActivityState;

/// Gateway header carrying the authenticated user id
pub const HEADER_USER: &str = "x-oae-user";
/// Gateway header carrying the user's tenant alias
pub const HEADER_TENANT: &str = "x-oae-tenant";
/// Gateway header marking administrators
pub const HEADER_ADMIN: &str = "x-oae-admin";

/// Who is making the request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiContext {
    /// Authenticated user id, absent for anonymous requests
    pub user_id: Option<String>,

    /// The user's tenant alias
    pub tenant_alias: Option<String>,

    /// Whether the user is a platform administrator
    pub is_admin: bool,
}

impl ApiContext {
    /// An unauthenticated context
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Whether a user is present
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

impl<S> FromRequestParts<S> for ApiContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Infallible> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            user_id: header(HEADER_USER),
            tenant_alias: header(HEADER_TENANT),
            is_admin: header(HEADER_ADMIN).as_deref() == Some("true"),
        })
    }
}

/// Assemble the activity module's router
#[must_use]
pub fn router(state: ActivityState) -> Router {
    Router::new()
        .route("/api/activity", get(activity::get_own_activity_stream))
        .route(
            "/api/activity/{resource_id}",
            get(activity::get_activity_stream).delete(activity::remove_activity_stream),
        )
        .route("/api/notifications", get(activity::get_notification_stream))
        .route(
            "/api/notifications/markRead",
            post(activity::mark_notifications_read),
        )
        .route("/api/push", get(push::push_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ready(
    axum::extract::State(state): axum::extract::State<ActivityState>,
) -> Result<Json<serde_json::Value>> {
    // A round-trip to the key-value store is the readiness signal
    state.kv().get("oae-activity:ready-probe").await?;
    Ok(Json(serde_json::json!({"status": "ready"})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    async fn context_for(request: Request<Body>) -> ApiContext {
        let (mut parts, _) = request.into_parts();
        ApiContext::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn test_context_from_headers() {
        let request = Request::builder()
            .header(HEADER_USER, "u:cam:alice")
            .header(HEADER_TENANT, "cam")
            .header(HEADER_ADMIN, "true")
            .body(Body::empty())
            .unwrap();

        let ctx = context_for(request).await;
        assert_eq!(ctx.user_id.as_deref(), Some("u:cam:alice"));
        assert_eq!(ctx.tenant_alias.as_deref(), Some("cam"));
        assert!(ctx.is_admin);
    }

    #[tokio::test]
    async fn test_missing_headers_mean_anonymous() {
        let request = Request::builder().body(Body::empty()).unwrap();
        let ctx = context_for(request).await;
        assert_eq!(ctx, ApiContext::anonymous());
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_admin_header_must_be_exactly_true() {
        let request = Request::builder()
            .header(HEADER_USER, "u:cam:alice")
            .header(HEADER_ADMIN, "yes")
            .body(Body::empty())
            .unwrap();
        let ctx = context_for(request).await;
        assert!(!ctx.is_admin);
    }
}
