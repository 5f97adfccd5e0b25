//! Core data model of the activity pipeline
//!
//! Seeds come in from domain code, entities are produced for the three
//! activity roles, routes name destination feeds, and routed activities are
//! the unit queued for aggregation. JSON extension fields use the `oae:`
//! prefix (`oae:id`, `oae:collection`); persisted key layouts use the
//! `oae-activity:` prefix.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};

/// Built-in activity stream type, visibility-bucketed
pub const STREAM_ACTIVITY: &str = "activity";
/// Built-in per-user notification stream type
pub const STREAM_NOTIFICATION: &str = "notification";
/// Per-user email digest stream type
pub const STREAM_EMAIL: &str = "email";

/// JSON field carrying an entity's resource id
pub const FIELD_ID: &str = "oae:id";
/// JSON field carrying the members of a collection entity
pub const FIELD_COLLECTION: &str = "oae:collection";
/// JSON field carrying an entity's object type
pub const FIELD_OBJECT_TYPE: &str = "objectType";
/// JSON field carrying an entity's visibility tier
pub const FIELD_VISIBILITY: &str = "visibility";

/// Object type of an entity that wraps several distinct entities in one role
pub const OBJECT_TYPE_COLLECTION: &str = "collection";

/// Placeholder for a role that may vary inside an aggregate key
const PIVOT_VARIES: &str = "*";
/// Placeholder for a role with no entity inside an aggregate key
const PIVOT_ABSENT: &str = "-";

/// The three roles an entity can occupy in an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Actor,
    Object,
    Target,
}

impl Role {
    /// All roles in evaluation order
    pub const ALL: [Role; 3] = [Role::Actor, Role::Object, Role::Target];

    /// Singular name, as used in router configuration
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Actor => "actor",
            Role::Object => "object",
            Role::Target => "target",
        }
    }

    /// Plural name, as used in persisted role-map keys
    #[must_use]
    pub fn plural(&self) -> &'static str {
        match self {
            Role::Actor => "actors",
            Role::Object => "objects",
            Role::Target => "targets",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility tier of a principal or entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[serde(rename = "loggedin")]
    LoggedIn,
    Private,
}

impl Visibility {
    /// Parse the wire form (`public` / `loggedin` / `private`)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "loggedin" => Some(Self::LoggedIn),
            "private" => Some(Self::Private),
            _ => None,
        }
    }

    /// Wire form
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::LoggedIn => "loggedin",
            Self::Private => "private",
        }
    }

    /// Feed suffix for visibility-bucketed stream variants (`#public`,
    /// `#loggedin`); the private tier has no variant
    #[must_use]
    pub fn stream_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Public => Some("#public"),
            Self::LoggedIn => Some("#loggedin"),
            Self::Private => None,
        }
    }
}

/// Rendering applied to activities on the read and push surfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityFormat {
    /// Transformed entities suitable for activitystrea.ms consumers
    #[serde(rename = "activitystreams")]
    ActivityStreams,
    /// Stored records verbatim
    #[default]
    Internal,
}

impl ActivityFormat {
    /// Parse the wire form (`activitystreams` / `internal`)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "activitystreams" => Some(Self::ActivityStreams),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }

    /// Wire form
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActivityStreams => "activitystreams",
            Self::Internal => "internal",
        }
    }
}

/// How often a user wants activity mail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailPreference {
    Never,
    Immediate,
    Daily,
    Weekly,
}

impl EmailPreference {
    /// Wire form
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Immediate => "immediate",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    /// Parse the wire form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never" => Some(Self::Never),
            "immediate" => Some(Self::Immediate),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }

    /// How far back the email feed is read when collecting this preference
    #[must_use]
    pub fn lookback_millis(&self) -> i64 {
        match self {
            Self::Never => 0,
            Self::Immediate => 3_600_000,
            Self::Daily => 2 * 86_400_000,
            Self::Weekly => 14 * 86_400_000,
        }
    }
}

/// One of the up to three resources on an activity seed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedResource {
    /// The resource's type, which becomes the produced entity's objectType
    pub resource_type: String,

    /// The resource's id
    pub resource_id: String,

    /// Free-form payload handed to the entity producer
    #[serde(default)]
    pub resource_data: Map<String, Value>,
}

impl SeedResource {
    /// Create a seed resource without payload
    #[must_use]
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            resource_data: Map::new(),
        }
    }

    /// Attach payload data
    #[must_use]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.resource_data = data;
        self
    }

    fn validate(&self, role: Role) -> Result<()> {
        if self.resource_type.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} resource has no resourceType",
                role
            )));
        }
        if self.resource_id.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} resource has no resourceId",
                role
            )));
        }
        Ok(())
    }
}

/// Transient input used to generate an activity before entity data is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySeed {
    /// Registered activity type
    pub activity_type: String,

    /// The verb of the generated activity
    pub verb: String,

    /// When the triggering event happened, epoch milliseconds
    pub published_millis: i64,

    /// Who performed the action
    pub actor_resource: SeedResource,

    /// What was acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_resource: Option<SeedResource>,

    /// What the action was directed at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_resource: Option<SeedResource>,
}

impl ActivitySeed {
    /// Validate the seed shape. Router input errors fail the caller
    /// synchronously; everything downstream is asynchronous.
    pub fn validate(&self) -> Result<()> {
        if self.activity_type.is_empty() {
            return Err(Error::InvalidInput("seed has no activityType".into()));
        }
        if self.verb.is_empty() {
            return Err(Error::InvalidInput("seed has no verb".into()));
        }
        if self.published_millis <= 0 {
            return Err(Error::InvalidInput(
                "seed publishedMillis must be a positive timestamp".into(),
            ));
        }
        self.actor_resource.validate(Role::Actor)?;
        if let Some(object) = &self.object_resource {
            object.validate(Role::Object)?;
        }
        if let Some(target) = &self.target_resource {
            target.validate(Role::Target)?;
        }
        Ok(())
    }

    /// The seed resource occupying the given role, if any
    #[must_use]
    pub fn resource(&self, role: Role) -> Option<&SeedResource> {
        match role {
            Role::Actor => Some(&self.actor_resource),
            Role::Object => self.object_resource.as_ref(),
            Role::Target => self.target_resource.as_ref(),
        }
    }
}

/// A produced activity entity: a JSON object carrying at least `objectType`
/// and `oae:id`, plus whatever the producer added for the transformers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityEntity(pub Map<String, Value>);

impl ActivityEntity {
    /// Create a minimal entity
    #[must_use]
    pub fn new(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(
            FIELD_OBJECT_TYPE.to_string(),
            Value::String(object_type.into()),
        );
        map.insert(FIELD_ID.to_string(), Value::String(id.into()));
        Self(map)
    }

    /// Create an entity from producer data, overriding `objectType` and
    /// `oae:id` with the seed resource's values
    #[must_use]
    pub fn from_data(
        object_type: impl Into<String>,
        id: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        let mut map = data;
        map.insert(
            FIELD_OBJECT_TYPE.to_string(),
            Value::String(object_type.into()),
        );
        map.insert(FIELD_ID.to_string(), Value::String(id.into()));
        Self(map)
    }

    /// Wrap several distinct entities occupying the same role after
    /// aggregation. The member order is preserved.
    #[must_use]
    pub fn collection(entities: Vec<ActivityEntity>) -> Self {
        let mut map = Map::new();
        map.insert(
            FIELD_OBJECT_TYPE.to_string(),
            Value::String(OBJECT_TYPE_COLLECTION.to_string()),
        );
        map.insert(
            FIELD_COLLECTION.to_string(),
            Value::Array(entities.into_iter().map(|e| Value::Object(e.0)).collect()),
        );
        Self(map)
    }

    /// The entity's objectType
    #[must_use]
    pub fn object_type(&self) -> &str {
        self.0
            .get(FIELD_OBJECT_TYPE)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The entity's resource id
    #[must_use]
    pub fn id(&self) -> &str {
        self.0
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The entity's visibility tier; an entity without one counts as private
    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.0
            .get(FIELD_VISIBILITY)
            .and_then(Value::as_str)
            .and_then(Visibility::parse)
            .unwrap_or(Visibility::Private)
    }

    /// Raw field access
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a field
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }
}

/// A single (actor, verb, object, target, time) record in a feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Registered activity type
    pub activity_type: String,

    /// Globally unique id: published-millis `:` short-random
    pub activity_id: String,

    /// The verb
    pub verb: String,

    /// Publish time in epoch milliseconds
    pub published_millis: i64,

    /// Who performed the action
    pub actor: ActivityEntity,

    /// What was acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ActivityEntity>,

    /// What the action was directed at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ActivityEntity>,
}

impl Activity {
    /// Generate a fresh activity id for the given publish time
    #[must_use]
    pub fn generate_id(published_millis: i64) -> String {
        use rand::distr::Alphanumeric;
        use rand::Rng;

        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        format!("{}:{}", published_millis, suffix)
    }

    /// The entity occupying the given role, if any
    #[must_use]
    pub fn entity(&self, role: Role) -> Option<&ActivityEntity> {
        match role {
            Role::Actor => Some(&self.actor),
            Role::Object => self.object.as_ref(),
            Role::Target => self.target.as_ref(),
        }
    }
}

/// A destination feed for an activity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// The feed owner's resource id
    pub resource_id: String,

    /// The stream type, possibly carrying a visibility suffix
    /// (`activity#public`)
    pub stream_type: String,

    /// Transient routes are delivered to live subscribers but never persisted
    #[serde(default)]
    pub transient: bool,
}

impl Route {
    /// Create a route
    #[must_use]
    pub fn new(resource_id: impl Into<String>, stream_type: impl Into<String>, transient: bool) -> Self {
        Self {
            resource_id: resource_id.into(),
            stream_type: stream_type.into(),
            transient,
        }
    }

    /// The feed this route delivers to
    #[must_use]
    pub fn feed_id(&self) -> String {
        feed_id(&self.resource_id, &self.stream_type)
    }

    /// The stream type without any visibility suffix
    #[must_use]
    pub fn base_stream_type(&self) -> &str {
        self.stream_type
            .split('#')
            .next()
            .unwrap_or(&self.stream_type)
    }
}

/// The unit placed on the queue: one activity bound for one feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedActivity {
    /// Destination
    pub route: Route,

    /// The activity to deliver
    pub activity: Activity,
}

/// One `groupBy` entry of an activity type: the roles frozen by this pivot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pivot {
    /// Aggregate on the actor id
    #[serde(default)]
    pub actor: bool,

    /// Aggregate on the object id
    #[serde(default)]
    pub object: bool,

    /// Aggregate on the target id
    #[serde(default)]
    pub target: bool,
}

impl Pivot {
    /// Whether the given role is frozen by this pivot
    #[must_use]
    pub fn freezes(&self, role: Role) -> bool {
        match role {
            Role::Actor => self.actor,
            Role::Object => self.object,
            Role::Target => self.target,
        }
    }
}

/// Derive the stable aggregate key for a routed activity under one pivot.
///
/// Frozen roles contribute their entity id; roles that may vary contribute a
/// placeholder. With no pivot, all three roles are frozen so exact duplicates
/// collapse into one slot.
#[must_use]
pub fn aggregate_key(routed: &RoutedActivity, pivot: Option<&Pivot>) -> String {
    let all = Pivot {
        actor: true,
        object: true,
        target: true,
    };
    let pivot = pivot.unwrap_or(&all);

    let role_value = |role: Role| -> String {
        match routed.activity.entity(role) {
            Some(entity) if pivot.freezes(role) => entity.id().to_string(),
            Some(_) => PIVOT_VARIES.to_string(),
            None => PIVOT_ABSENT.to_string(),
        }
    };

    format!(
        "{}#{}#{}#{}#{}#{}",
        routed.route.stream_type,
        routed.route.resource_id,
        routed.activity.activity_type,
        role_value(Role::Actor),
        role_value(Role::Object),
        role_value(Role::Target),
    )
}

/// Derive all aggregate keys for a routed activity given its activity type's
/// `groupBy` pivots
#[must_use]
pub fn aggregate_keys(routed: &RoutedActivity, group_by: &[Pivot]) -> Vec<String> {
    if group_by.is_empty() {
        vec![aggregate_key(routed, None)]
    } else {
        group_by
            .iter()
            .map(|pivot| aggregate_key(routed, Some(pivot)))
            .collect()
    }
}

/// Status of one aggregate slot in the key-value store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStatus {
    /// The activity id currently delivered to feeds for this aggregate
    pub last_activity_id: String,

    /// When the aggregate was first created
    pub created_millis: i64,

    /// Last time an activity was merged in
    pub last_updated_millis: i64,

    /// Last time the aggregate was part of a collection
    pub last_collected_millis: i64,
}

/// Compose a feed id from its owner and stream type
#[must_use]
pub fn feed_id(owner_id: &str, stream_type: &str) -> String {
    format!("{}#{}", owner_id, stream_type)
}

/// Split a feed id into owner and stream type. Resource ids use `:`
/// separators, so the first `#` terminates the owner.
#[must_use]
pub fn split_feed_id(feed_id: &str) -> Option<(&str, &str)> {
    feed_id.split_once('#')
}

/// The tenant alias embedded in a resource id of shape
/// `{type}:{tenantAlias}:{local}`
#[must_use]
pub fn tenant_alias_of(resource_id: &str) -> Option<&str> {
    let mut parts = resource_id.splitn(3, ':');
    let prefix = parts.next()?;
    let alias = parts.next()?;
    let local = parts.next()?;
    if prefix.is_empty() || alias.is_empty() || local.is_empty() {
        None
    } else {
        Some(alias)
    }
}

/// Whether a resource id has the expected `{type}:{tenantAlias}:{local}` shape
#[must_use]
pub fn is_resource_id(resource_id: &str) -> bool {
    tenant_alias_of(resource_id).is_some()
}
