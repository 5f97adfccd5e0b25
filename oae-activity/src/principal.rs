//! Principal directory interface
//!
//! The principal domain module (users and groups) lives outside this
//! subsystem, but the pipeline needs a narrow view of it: visibility for feed
//! authorization, email address and preference for digests, and tenant
//! membership. [`StaticPrincipalService`] is the in-memory implementation
//! used by tests and dev runs.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;

use crate::{
    error::Result,
    model::{EmailPreference, Visibility},
};

/// The pipeline's view of a user or group
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    /// Resource id (`u:...` or `g:...`)
    pub id: String,

    /// Display name
    pub display_name: String,

    /// Visibility tier governing who may read this principal's feeds
    pub visibility: Visibility,

    /// Email address, absent for groups
    pub email: Option<String>,

    /// Digest cadence the user chose
    pub email_preference: EmailPreference,

    /// Whether this principal is a group
    pub is_group: bool,

    /// Tenant the principal belongs to
    pub tenant_alias: String,
}

/// Read access to principals
#[async_trait]
pub trait PrincipalService: Send + Sync + fmt::Debug {
    /// Look a principal up by id
    async fn get_principal(&self, id: &str) -> Result<Option<Principal>>;
}

/// In-memory [`PrincipalService`]
#[derive(Debug, Default)]
pub struct StaticPrincipalService {
    principals: DashMap<String, Principal>,
}

impl StaticPrincipalService {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a principal
    pub fn insert(&self, principal: Principal) {
        self.principals.insert(principal.id.clone(), principal);
    }
}

#[async_trait]
impl PrincipalService for StaticPrincipalService {
    async fn get_principal(&self, id: &str) -> Result<Option<Principal>> {
        Ok(self.principals.get(id).map(|p| p.clone()))
    }
}
