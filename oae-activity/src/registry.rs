//! Plug-in registry of activity types, entity types, associations and stream
//! types
//!
//! Domain modules register their types during a dedicated initialise phase;
//! the builder rejects duplicate registrations as configuration errors and
//! [`RegistryBuilder::build`] freezes the tables before the pipeline accepts
//! its first seed. Every lookup hands out shared immutable options; nothing
//! mutates after the freeze.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{
    api::ApiContext,
    error::{Error, Result},
    mailer::EmailTemplate,
    model::{ActivityEntity, ActivityFormat, Pivot, Role, SeedResource, FIELD_ID, FIELD_OBJECT_TYPE},
    router::AssociationsContext,
};

/// Produces the persistent entity for one seed resource
#[async_trait]
pub trait EntityProducer: Send + Sync {
    /// Build the entity. May perform I/O against the owning domain module.
    async fn produce(&self, resource: &SeedResource) -> Result<ActivityEntity>;
}

/// Transforms a stored entity into its display form for one format
#[async_trait]
pub trait EntityTransformer: Send + Sync {
    /// Render the entity. A failure drops the affected activity from the
    /// transform pass; other activities proceed.
    async fn transform(&self, entity: &ActivityEntity) -> Result<Value>;
}

/// Resolves a named association of an entity to resource ids
#[async_trait]
pub trait AssociationResolver: Send + Sync {
    /// Resolve the association. The context caches resolutions for the
    /// current routing pass and allows resolvers to consult other
    /// associations.
    async fn resolve(
        &self,
        ctx: &AssociationsContext,
        entity: &ActivityEntity,
    ) -> Result<Vec<String>>;
}

/// Supplies the propagation rules for an entity
#[async_trait]
pub trait PropagationProvider: Send + Sync {
    /// The rules deciding which routes may carry an activity containing this
    /// entity. Rules are disjunctive.
    async fn propagation(&self, entity: &ActivityEntity) -> Result<Vec<PropagationRule>>;
}

/// Authorizes a push subscription to one stream
#[async_trait]
pub trait StreamAuthorizer: Send + Sync {
    /// Allow or reject the subscription
    async fn authorize(
        &self,
        ctx: &ApiContext,
        resource_id: &str,
        token: Option<&Value>,
    ) -> Result<()>;
}

/// A per-entity policy narrowing the route set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationRule {
    /// Keep all routes
    All,
    /// Keep routes whose resource tenant equals the entity's tenant
    Tenant,
    /// Keep routes whose tenant may interact with the entity's tenant
    InteractingTenants,
    /// Keep only routes the entity's own role produced
    Routes,
    /// Keep only routes in the entity's `self` association
    SelfAssociation,
    /// Keep routes in the named association of the entity's role
    Association(String),
    /// Keep routes in a named association of a different role, identified by
    /// its entity's objectType
    ExternalAssociation {
        /// objectType of the role the association resolves against
        object_type: String,
        /// Association name on that role
        association: String,
    },
}

/// Phase at which a stream's activities are pushed to live subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPhase {
    /// Push individual activities as soon as they are routed
    Routing,
    /// Push aggregated activities once a collection delivers them
    Aggregation,
}

/// Per-stream routing configuration of one activity type
#[derive(Clone, Default)]
pub struct ActivityStreamConfig {
    /// Ordered association names per role; a leading `^` excludes the
    /// association's ids from the set accumulated so far
    pub router: HashMap<Role, Vec<String>>,

    /// Email template metadata, meaningful on the notification stream
    pub email: Option<EmailTemplate>,
}

impl fmt::Debug for ActivityStreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityStreamConfig")
            .field("router", &self.router)
            .field("email", &self.email)
            .finish()
    }
}

/// Registered options of one activity type
#[derive(Clone, Default)]
pub struct ActivityTypeOptions {
    /// Aggregation pivots; empty means exact duplicates collapse
    pub group_by: Vec<Pivot>,

    /// Stream configurations keyed by stream type
    pub streams: HashMap<String, ActivityStreamConfig>,
}

/// Registered options of one entity type; absent hooks fall back to defaults
#[derive(Clone, Default)]
pub struct EntityTypeOptions {
    /// Entity producer
    pub producer: Option<Arc<dyn EntityProducer>>,

    /// Transformers per format
    pub transformers: HashMap<ActivityFormat, Arc<dyn EntityTransformer>>,

    /// Propagation provider
    pub propagation: Option<Arc<dyn PropagationProvider>>,
}

/// Registered options of one stream type
#[derive(Clone)]
pub struct StreamTypeOptions {
    /// Transient streams deliver to live subscribers but never persist
    pub transient: bool,

    /// Whether `#public` / `#loggedin` variants are written
    pub visibility_bucketing: bool,

    /// When live subscribers see this stream's activities
    pub push_phase: PushPhase,

    /// Push subscription authorization
    pub authorizer: Arc<dyn StreamAuthorizer>,
}

impl fmt::Debug for StreamTypeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTypeOptions")
            .field("transient", &self.transient)
            .field("visibility_bucketing", &self.visibility_bucketing)
            .field("push_phase", &self.push_phase)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Defaults
// ============================================================================

/// Default producer: the seed resource's data with objectType and oae:id set
struct DefaultProducer;

#[async_trait]
impl EntityProducer for DefaultProducer {
    async fn produce(&self, resource: &SeedResource) -> Result<ActivityEntity> {
        Ok(ActivityEntity::from_data(
            resource.resource_type.clone(),
            resource.resource_id.clone(),
            resource.resource_data.clone(),
        ))
    }
}

/// Default transformer: `{objectType, oae:id}`
struct DefaultTransformer;

#[async_trait]
impl EntityTransformer for DefaultTransformer {
    async fn transform(&self, entity: &ActivityEntity) -> Result<Value> {
        let mut map = Map::new();
        map.insert(
            FIELD_OBJECT_TYPE.to_string(),
            Value::String(entity.object_type().to_string()),
        );
        map.insert(FIELD_ID.to_string(), Value::String(entity.id().to_string()));
        Ok(Value::Object(map))
    }
}

/// Default propagation: the entity's own routes
struct DefaultPropagation;

#[async_trait]
impl PropagationProvider for DefaultPropagation {
    async fn propagation(&self, _entity: &ActivityEntity) -> Result<Vec<PropagationRule>> {
        Ok(vec![PropagationRule::Routes])
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The frozen plug-in tables
pub struct Registry {
    activity_types: HashMap<String, Arc<ActivityTypeOptions>>,
    entity_types: HashMap<String, EntityTypeOptions>,
    associations: HashMap<(String, String), Arc<dyn AssociationResolver>>,
    stream_types: HashMap<String, Arc<StreamTypeOptions>>,
    default_producer: Arc<dyn EntityProducer>,
    default_transformer: Arc<dyn EntityTransformer>,
    default_propagation: Arc<dyn PropagationProvider>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("activity_types", &self.activity_types.len())
            .field("entity_types", &self.entity_types.len())
            .field("associations", &self.associations.len())
            .field("stream_types", &self.stream_types.len())
            .finish()
    }
}

impl Registry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Options of a registered activity type
    #[must_use]
    pub fn activity_type(&self, activity_type: &str) -> Option<Arc<ActivityTypeOptions>> {
        self.activity_types.get(activity_type).cloned()
    }

    /// Options of a registered stream type. Visibility-suffixed variants
    /// resolve to their base stream type.
    #[must_use]
    pub fn stream_type(&self, stream_type: &str) -> Option<Arc<StreamTypeOptions>> {
        let base = stream_type.split('#').next().unwrap_or(stream_type);
        self.stream_types.get(base).cloned()
    }

    /// All registered stream types
    #[must_use]
    pub fn stream_types(&self) -> impl Iterator<Item = (&String, &Arc<StreamTypeOptions>)> {
        self.stream_types.iter()
    }

    /// The producer for an object type, falling back to the default
    #[must_use]
    pub fn producer(&self, object_type: &str) -> Arc<dyn EntityProducer> {
        self.entity_types
            .get(object_type)
            .and_then(|options| options.producer.clone())
            .unwrap_or_else(|| self.default_producer.clone())
    }

    /// The transformer for an object type and format, falling back to the
    /// default
    #[must_use]
    pub fn transformer(
        &self,
        object_type: &str,
        format: ActivityFormat,
    ) -> Arc<dyn EntityTransformer> {
        self.entity_types
            .get(object_type)
            .and_then(|options| options.transformers.get(&format).cloned())
            .unwrap_or_else(|| self.default_transformer.clone())
    }

    /// The propagation provider for an object type, falling back to the
    /// default
    #[must_use]
    pub fn propagation(&self, object_type: &str) -> Arc<dyn PropagationProvider> {
        self.entity_types
            .get(object_type)
            .and_then(|options| options.propagation.clone())
            .unwrap_or_else(|| self.default_propagation.clone())
    }

    /// A registered association resolver
    #[must_use]
    pub fn association(
        &self,
        object_type: &str,
        name: &str,
    ) -> Option<Arc<dyn AssociationResolver>> {
        self.associations
            .get(&(object_type.to_string(), name.to_string()))
            .cloned()
    }
}

/// Builder collecting registrations during the initialise phase
#[derive(Default)]
pub struct RegistryBuilder {
    activity_types: HashMap<String, Arc<ActivityTypeOptions>>,
    entity_types: HashMap<String, EntityTypeOptions>,
    associations: HashMap<(String, String), Arc<dyn AssociationResolver>>,
    stream_types: HashMap<String, Arc<StreamTypeOptions>>,
}

impl RegistryBuilder {
    /// Register an activity type. Duplicate registration is a configuration
    /// error.
    pub fn activity_type(
        mut self,
        activity_type: impl Into<String>,
        options: ActivityTypeOptions,
    ) -> Result<Self> {
        let activity_type = activity_type.into();
        if self.activity_types.contains_key(&activity_type) {
            return Err(Error::InvalidInput(format!(
                "activity type {} registered twice",
                activity_type
            )));
        }
        self.activity_types.insert(activity_type, Arc::new(options));
        Ok(self)
    }

    /// Register an entity type. Duplicate registration is a configuration
    /// error.
    pub fn entity_type(
        mut self,
        object_type: impl Into<String>,
        options: EntityTypeOptions,
    ) -> Result<Self> {
        let object_type = object_type.into();
        if self.entity_types.contains_key(&object_type) {
            return Err(Error::InvalidInput(format!(
                "entity type {} registered twice",
                object_type
            )));
        }
        self.entity_types.insert(object_type, options);
        Ok(self)
    }

    /// Register an association resolver for (objectType, name). Duplicate
    /// registration is a configuration error.
    pub fn association(
        mut self,
        object_type: impl Into<String>,
        name: impl Into<String>,
        resolver: Arc<dyn AssociationResolver>,
    ) -> Result<Self> {
        let key = (object_type.into(), name.into());
        if self.associations.contains_key(&key) {
            return Err(Error::InvalidInput(format!(
                "association {}:{} registered twice",
                key.0, key.1
            )));
        }
        self.associations.insert(key, resolver);
        Ok(self)
    }

    /// Register a stream type. Duplicate registration is a configuration
    /// error.
    pub fn stream_type(
        mut self,
        stream_type: impl Into<String>,
        options: StreamTypeOptions,
    ) -> Result<Self> {
        let stream_type = stream_type.into();
        if self.stream_types.contains_key(&stream_type) {
            return Err(Error::InvalidInput(format!(
                "stream type {} registered twice",
                stream_type
            )));
        }
        self.stream_types.insert(stream_type, Arc::new(options));
        Ok(self)
    }

    /// Freeze the tables
    #[must_use]
    pub fn build(self) -> Registry {
        Registry {
            activity_types: self.activity_types,
            entity_types: self.entity_types,
            associations: self.associations,
            stream_types: self.stream_types,
            default_producer: Arc::new(DefaultProducer),
            default_transformer: Arc::new(DefaultTransformer),
            default_propagation: Arc::new(DefaultPropagation),
        }
    }
}
