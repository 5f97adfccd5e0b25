//! Feed and notification read handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    api::ApiContext,
    error::{Error, Result},
    model::{
        feed_id, is_resource_id, ActivityFormat, STREAM_ACTIVITY, STREAM_NOTIFICATION,
    },
    principal::PrincipalService,
    state::ActivityState,
    stores::FeedStore,
    streams::resolve_feed_suffix,
    transform::transform_activities,
};

const DEFAULT_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 25;

/// Query parameters of the feed endpoints
#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    /// Opaque paging token from a previous response
    pub start: Option<String>,

    /// Page size, clamped to 1..=25
    pub limit: Option<usize>,

    /// `activitystreams` (default) or `internal`
    pub format: Option<String>,
}

impl FeedQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn format(&self) -> Result<ActivityFormat> {
        match self.format.as_deref() {
            None => Ok(ActivityFormat::ActivityStreams),
            Some(name) => ActivityFormat::parse(name)
                .ok_or_else(|| Error::InvalidInput(format!("unknown format {}", name))),
        }
    }
}

async fn read_feed(
    state: &ActivityState,
    feed: &str,
    query: &FeedQuery,
) -> Result<Value> {
    let format = query.format()?;
    let page = state
        .feeds()
        .page(feed, query.start.as_deref(), query.limit())
        .await?;
    let items = transform_activities(state.registry(), format, &page.items).await;
    Ok(json!({
        "items": items,
        "nextToken": page.next_token,
    }))
}

/// `GET /api/activity` — the caller's own activity feed
pub async fn get_own_activity_stream(
    State(state): State<ActivityState>,
    ctx: ApiContext,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>> {
    let Some(user_id) = ctx.user_id.clone() else {
        return Err(Error::Unauthorized("authentication required".into()));
    };
    let feed = feed_id(&user_id, STREAM_ACTIVITY);
    Ok(Json(read_feed(&state, &feed, &query).await?))
}

/// `GET /api/activity/{resourceId}` — a resource's activity feed, resolved to
/// the visibility variant the caller may read
pub async fn get_activity_stream(
    State(state): State<ActivityState>,
    ctx: ApiContext,
    Path(resource_id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>> {
    if !is_resource_id(&resource_id) {
        return Err(Error::InvalidInput(format!(
            "malformed resource id {}",
            resource_id
        )));
    }
    let Some(principal) = state.principals().get_principal(&resource_id).await? else {
        return Err(Error::NotFound(format!("no such resource {}", resource_id)));
    };

    let suffix = resolve_feed_suffix(&ctx, &principal, state.tenants().as_ref()).await?;
    let feed = format!("{}{}", feed_id(&resource_id, STREAM_ACTIVITY), suffix);
    Ok(Json(read_feed(&state, &feed, &query).await?))
}

/// `DELETE /api/activity/{resourceId}` — admin-only removal of every suffixed
/// stream of a principal
pub async fn remove_activity_stream(
    State(state): State<ActivityState>,
    ctx: ApiContext,
    Path(resource_id): Path<String>,
) -> Result<StatusCode> {
    if !ctx.is_admin {
        return Err(Error::Unauthorized("administrator required".into()));
    }
    if !is_resource_id(&resource_id) {
        return Err(Error::InvalidInput(format!(
            "malformed resource id {}",
            resource_id
        )));
    }

    let stream_types: Vec<String> = state
        .registry()
        .stream_types()
        .map(|(name, _)| name.clone())
        .collect();
    for stream_type in stream_types {
        for suffix in ["", "#public", "#loggedin"] {
            let feed = format!("{}{}", feed_id(&resource_id, &stream_type), suffix);
            state.feeds().clear(&feed).await?;
        }
    }

    tracing::info!(resource_id = %resource_id, "Activity streams removed");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/notifications` — the caller's notification feed with its unread
/// counter and last-read time
pub async fn get_notification_stream(
    State(state): State<ActivityState>,
    ctx: ApiContext,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>> {
    let Some(user_id) = ctx.user_id.clone() else {
        return Err(Error::Unauthorized("authentication required".into()));
    };

    let feed = feed_id(&user_id, STREAM_NOTIFICATION);
    let mut body = read_feed(&state, &feed, &query).await?;

    let unread = state.notifications().unread_count(&user_id).await?;
    let last_read = state.notifications().last_read_millis(&user_id).await?;
    if let Value::Object(map) = &mut body {
        map.insert("unreadCount".to_string(), json!(unread));
        map.insert("lastReadMillis".to_string(), json!(last_read));
    }
    Ok(Json(body))
}

/// `POST /api/notifications/markRead`
pub async fn mark_notifications_read(
    State(state): State<ActivityState>,
    ctx: ApiContext,
) -> Result<Json<Value>> {
    let Some(user_id) = ctx.user_id.clone() else {
        return Err(Error::Unauthorized("authentication required".into()));
    };
    let last_read = state.notifications().mark_read(&user_id).await?;
    Ok(Json(json!({"lastReadMillis": last_read})))
}
