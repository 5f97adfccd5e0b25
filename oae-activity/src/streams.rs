//! Built-in stream types and their authorization
//!
//! The platform ships three stream types: `activity` (visibility-bucketed),
//! `notification` (per-user, carries the unread counter) and `email`
//! (feeds the digest scheduler, never pushed). Domain modules register
//! further stream types (e.g. `message`) themselves.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::{
    api::ApiContext,
    error::{Error, Result},
    model::{Visibility, STREAM_ACTIVITY, STREAM_EMAIL, STREAM_NOTIFICATION},
    principal::{Principal, PrincipalService},
    registry::{PushPhase, RegistryBuilder, StreamAuthorizer, StreamTypeOptions},
    tenant::TenantService,
};

/// Which variant of a visibility-bucketed feed a caller may read, per the
/// principal visibility rule
pub async fn resolve_feed_suffix(
    ctx: &ApiContext,
    principal: &Principal,
    tenants: &dyn TenantService,
) -> Result<&'static str> {
    // The owner and admins read the full feed
    if ctx.is_admin || ctx.user_id.as_deref() == Some(principal.id.as_str()) {
        return Ok("");
    }

    match (&ctx.tenant_alias, principal.visibility) {
        (Some(viewer_tenant), Visibility::Public | Visibility::LoggedIn) => {
            if tenants
                .can_interact(viewer_tenant, &principal.tenant_alias)
                .await?
            {
                Ok("#loggedin")
            } else if principal.visibility == Visibility::Public {
                Ok("#public")
            } else {
                Err(Error::Unauthorized("feed is not visible to you".into()))
            }
        }
        (None, Visibility::Public) => Ok("#public"),
        _ => Err(Error::Unauthorized("feed is not visible to you".into())),
    }
}

/// Authorizes activity-stream subscriptions with the principal visibility rule
#[derive(Debug)]
struct ActivityStreamAuthorizer {
    principals: Arc<dyn PrincipalService>,
    tenants: Arc<dyn TenantService>,
}

#[async_trait]
impl StreamAuthorizer for ActivityStreamAuthorizer {
    async fn authorize(
        &self,
        ctx: &ApiContext,
        resource_id: &str,
        _token: Option<&Value>,
    ) -> Result<()> {
        let Some(principal) = self.principals.get_principal(resource_id).await? else {
            return Err(Error::NotFound(format!("no such resource {}", resource_id)));
        };
        resolve_feed_suffix(ctx, &principal, self.tenants.as_ref())
            .await
            .map(|_| ())
    }
}

/// Only the stream owner may attach
#[derive(Debug)]
struct OwnerOnlyAuthorizer;

#[async_trait]
impl StreamAuthorizer for OwnerOnlyAuthorizer {
    async fn authorize(
        &self,
        ctx: &ApiContext,
        resource_id: &str,
        _token: Option<&Value>,
    ) -> Result<()> {
        if ctx.is_admin || ctx.user_id.as_deref() == Some(resource_id) {
            Ok(())
        } else {
            Err(Error::Unauthorized("not the stream owner".into()))
        }
    }
}

/// Nobody subscribes to email feeds
#[derive(Debug)]
struct DenyAllAuthorizer;

#[async_trait]
impl StreamAuthorizer for DenyAllAuthorizer {
    async fn authorize(
        &self,
        _ctx: &ApiContext,
        _resource_id: &str,
        _token: Option<&Value>,
    ) -> Result<()> {
        Err(Error::Unauthorized("stream is not subscribable".into()))
    }
}

/// Register the platform's built-in stream types
pub fn register_builtin_stream_types(
    builder: RegistryBuilder,
    principals: Arc<dyn PrincipalService>,
    tenants: Arc<dyn TenantService>,
) -> Result<RegistryBuilder> {
    builder
        .stream_type(
            STREAM_ACTIVITY,
            StreamTypeOptions {
                transient: false,
                visibility_bucketing: true,
                push_phase: PushPhase::Aggregation,
                authorizer: Arc::new(ActivityStreamAuthorizer {
                    principals,
                    tenants,
                }),
            },
        )?
        .stream_type(
            STREAM_NOTIFICATION,
            StreamTypeOptions {
                transient: false,
                visibility_bucketing: false,
                push_phase: PushPhase::Aggregation,
                authorizer: Arc::new(OwnerOnlyAuthorizer),
            },
        )?
        .stream_type(
            STREAM_EMAIL,
            StreamTypeOptions {
                transient: false,
                visibility_bucketing: false,
                push_phase: PushPhase::Aggregation,
                authorizer: Arc::new(DenyAllAuthorizer),
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;
    use crate::model::EmailPreference;
    use crate::principal::StaticPrincipalService;
    use crate::registry::Registry;
    use crate::tenant::StaticTenantService;

    fn principal(id: &str, visibility: Visibility) -> Principal {
        Principal {
            id: id.to_string(),
            display_name: "Someone".to_string(),
            visibility,
            email: None,
            email_preference: EmailPreference::Never,
            is_group: false,
            tenant_alias: "cam".to_string(),
        }
    }

    fn tenants() -> StaticTenantService {
        StaticTenantService::new(vec![
            TenantConfig {
                alias: "cam".to_string(),
                display_name: "Cambridge".to_string(),
                base_url: "https://cam.example".to_string(),
                email_domains: Vec::new(),
                timezone_offset_hours: 0,
                mail_hour: 8,
                mail_day: 1,
                signing_key: "key".to_string(),
                private: false,
            },
            TenantConfig {
                alias: "sealed".to_string(),
                display_name: "Sealed".to_string(),
                base_url: "https://sealed.example".to_string(),
                email_domains: Vec::new(),
                timezone_offset_hours: 0,
                mail_hour: 8,
                mail_day: 1,
                signing_key: "key".to_string(),
                private: true,
            },
        ])
    }

    fn ctx(user: Option<&str>, tenant: Option<&str>, admin: bool) -> ApiContext {
        ApiContext {
            user_id: user.map(str::to_string),
            tenant_alias: tenant.map(str::to_string),
            is_admin: admin,
        }
    }

    #[tokio::test]
    async fn test_owner_reads_full_feed() {
        let suffix = resolve_feed_suffix(
            &ctx(Some("u:cam:alice"), Some("cam"), false),
            &principal("u:cam:alice", Visibility::Private),
            &tenants(),
        )
        .await
        .unwrap();
        assert_eq!(suffix, "");
    }

    #[tokio::test]
    async fn test_admin_reads_full_feed() {
        let suffix = resolve_feed_suffix(
            &ctx(Some("u:cam:root"), Some("cam"), true),
            &principal("u:cam:alice", Visibility::Private),
            &tenants(),
        )
        .await
        .unwrap();
        assert_eq!(suffix, "");
    }

    #[tokio::test]
    async fn test_logged_in_viewer_gets_loggedin_variant() {
        let suffix = resolve_feed_suffix(
            &ctx(Some("u:cam:bob"), Some("cam"), false),
            &principal("u:cam:alice", Visibility::LoggedIn),
            &tenants(),
        )
        .await
        .unwrap();
        assert_eq!(suffix, "#loggedin");
    }

    #[tokio::test]
    async fn test_anonymous_viewer_gets_public_variant() {
        let suffix = resolve_feed_suffix(
            &ctx(None, None, false),
            &principal("u:cam:alice", Visibility::Public),
            &tenants(),
        )
        .await
        .unwrap();
        assert_eq!(suffix, "#public");
    }

    #[tokio::test]
    async fn test_anonymous_viewer_cannot_read_loggedin_feed() {
        let result = resolve_feed_suffix(
            &ctx(None, None, false),
            &principal("u:cam:alice", Visibility::LoggedIn),
            &tenants(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_private_feed_is_owner_only() {
        let result = resolve_feed_suffix(
            &ctx(Some("u:cam:bob"), Some("cam"), false),
            &principal("u:cam:alice", Visibility::Private),
            &tenants(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_non_interacting_tenant_falls_back_to_public() {
        let suffix = resolve_feed_suffix(
            &ctx(Some("u:sealed:eve"), Some("sealed"), false),
            &principal("u:cam:alice", Visibility::Public),
            &tenants(),
        )
        .await
        .unwrap();
        assert_eq!(suffix, "#public");
    }

    #[tokio::test]
    async fn test_builtin_registration() {
        let principals: Arc<dyn PrincipalService> = Arc::new(StaticPrincipalService::new());
        let tenant_service: Arc<dyn TenantService> = Arc::new(tenants());
        let registry: Registry =
            register_builtin_stream_types(Registry::builder(), principals, tenant_service)
                .unwrap()
                .build();

        assert!(registry.stream_type(STREAM_ACTIVITY).is_some());
        assert!(registry.stream_type(STREAM_NOTIFICATION).is_some());
        assert!(registry.stream_type(STREAM_EMAIL).is_some());
        assert!(registry
            .stream_type(STREAM_ACTIVITY)
            .unwrap()
            .visibility_bucketing);
    }
}
