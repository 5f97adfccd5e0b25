//! Tenant directory interface
//!
//! Tenants own resource ids (the middle segment of `{type}:{alias}:{local}`),
//! signing keys, mail delivery times and email domains. The directory itself
//! lives outside this subsystem; [`StaticTenantService`] serves the tenants
//! listed in configuration, which is also what tests use.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use crate::{config::TenantConfig, error::Result};

/// One tenant of the platform
#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    /// Tenant alias
    pub alias: String,

    /// Display name
    pub display_name: String,

    /// Base URL for rendered links
    pub base_url: String,

    /// Email domains owned by this tenant
    pub email_domains: Vec<String>,

    /// Offset of the tenant's timezone from UTC, in hours
    pub timezone_offset_hours: i32,

    /// Local hour of day digests are delivered
    pub mail_hour: u32,

    /// Local day of week (0 = Sunday) weekly digests are delivered
    pub mail_day: u32,

    /// Key for expiring resource signatures
    pub signing_key: String,

    /// Private tenants do not interact with other tenants
    pub private: bool,
}

impl From<TenantConfig> for Tenant {
    fn from(config: TenantConfig) -> Self {
        Self {
            alias: config.alias,
            display_name: config.display_name,
            base_url: config.base_url,
            email_domains: config.email_domains,
            timezone_offset_hours: config.timezone_offset_hours,
            mail_hour: config.mail_hour,
            mail_day: config.mail_day,
            signing_key: config.signing_key,
            private: config.private,
        }
    }
}

/// Read access to the platform's tenants
#[async_trait]
pub trait TenantService: Send + Sync + fmt::Debug {
    /// Look a tenant up by alias
    async fn get_tenant(&self, alias: &str) -> Result<Option<Tenant>>;

    /// The tenant's base URL
    async fn get_base_url(&self, alias: &str) -> Result<Option<String>> {
        Ok(self.get_tenant(alias).await?.map(|t| t.base_url))
    }

    /// Whether users of tenant `a` may interact with resources of tenant `b`
    async fn can_interact(&self, a: &str, b: &str) -> Result<bool>;

    /// The tenant whose configured email domain matches the address
    async fn get_tenant_by_email(&self, email: &str) -> Result<Option<Tenant>>;
}

/// [`TenantService`] over the tenants listed in configuration
#[derive(Debug, Default)]
pub struct StaticTenantService {
    tenants: HashMap<String, Tenant>,
}

impl StaticTenantService {
    /// Build from configuration
    #[must_use]
    pub fn new(configs: Vec<TenantConfig>) -> Self {
        let tenants = configs
            .into_iter()
            .map(|config| (config.alias.clone(), Tenant::from(config)))
            .collect();
        Self { tenants }
    }
}

#[async_trait]
impl TenantService for StaticTenantService {
    async fn get_tenant(&self, alias: &str) -> Result<Option<Tenant>> {
        Ok(self.tenants.get(alias).cloned())
    }

    async fn can_interact(&self, a: &str, b: &str) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        match (self.tenants.get(a), self.tenants.get(b)) {
            (Some(ta), Some(tb)) => Ok(!ta.private && !tb.private),
            _ => Ok(false),
        }
    }

    async fn get_tenant_by_email(&self, email: &str) -> Result<Option<Tenant>> {
        let Some((_, domain)) = email.rsplit_once('@') else {
            return Ok(None);
        };
        let domain = domain.to_ascii_lowercase();
        Ok(self
            .tenants
            .values()
            .find(|tenant| {
                tenant
                    .email_domains
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(&domain))
            })
            .cloned())
    }
}
