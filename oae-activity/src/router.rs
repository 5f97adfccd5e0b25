//! Routing stage
//!
//! Turns one activity seed into queued routed activities: produces the role
//! entities, evaluates per-stream association lists into a route set, narrows
//! the set with each entity's propagation rules, drops self-notifications,
//! mirrors visibility-bucketed streams into `#public`/`#loggedin` variants,
//! assigns buckets and enqueues. Distinct seeds route independently and
//! concurrently; consistency comes from the aggregate store downstream.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::{
    bucket::bucket_number,
    bus::{PipelineBus, RoutedActivitiesEvent},
    error::{Error, Result},
    model::{
        tenant_alias_of, Activity, ActivityEntity, ActivitySeed, Role, Route, RoutedActivity,
        Visibility, FIELD_ID, FIELD_OBJECT_TYPE, STREAM_EMAIL, STREAM_NOTIFICATION,
    },
    registry::{ActivityStreamConfig, PropagationRule, Registry},
    stores::QueueStore,
    tenant::TenantService,
};

/// The association named by `SELF` propagation
pub const ASSOCIATION_SELF: &str = "self";

/// Per-seed association resolution with caching
///
/// Resolvers may consult other associations through the context; resolutions
/// are cached for the lifetime of one routing pass so repeated lookups (route
/// production, propagation) hit the domain module once.
pub struct AssociationsContext {
    registry: Arc<Registry>,
    cache: Mutex<HashMap<(String, String, String), Vec<String>>>,
}

impl AssociationsContext {
    /// Create a context for one routing pass
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a named association of an entity. An unregistered association
    /// resolves to no ids.
    pub async fn resolve(&self, entity: &ActivityEntity, name: &str) -> Result<Vec<String>> {
        let key = (
            entity.object_type().to_string(),
            entity.id().to_string(),
            name.to_string(),
        );

        if let Some(cached) = self.cache.lock().expect("cache poisoned").get(&key) {
            return Ok(cached.clone());
        }

        let Some(resolver) = self.registry.association(entity.object_type(), name) else {
            tracing::debug!(
                object_type = entity.object_type(),
                association = name,
                "No resolver registered for association"
            );
            return Ok(Vec::new());
        };

        let ids = resolver.resolve(self, entity).await?;
        self.cache
            .lock()
            .expect("cache poisoned")
            .insert(key, ids.clone());
        Ok(ids)
    }
}

/// The routing stage
pub struct Router {
    registry: Arc<Registry>,
    queue: QueueStore,
    tenants: Arc<dyn TenantService>,
    bus: PipelineBus,
    bucket_count: u32,
}

impl Router {
    /// Create a router
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        queue: QueueStore,
        tenants: Arc<dyn TenantService>,
        bus: PipelineBus,
        bucket_count: u32,
    ) -> Self {
        Self {
            registry,
            queue,
            tenants,
            bus,
            bucket_count,
        }
    }

    /// Route one seed: produce entities and routes, queue the survivors and
    /// emit the routed-activities event
    pub async fn route(&self, seed: ActivitySeed) -> Result<()> {
        let Some(type_options) = self.registry.activity_type(&seed.activity_type) else {
            return Err(Error::NotFound(format!(
                "unknown activity type {}",
                seed.activity_type
            )));
        };

        let entities = self.produce_entities(&seed).await?;
        let activity = Activity {
            activity_type: seed.activity_type.clone(),
            activity_id: Activity::generate_id(seed.published_millis),
            verb: seed.verb.clone(),
            published_millis: seed.published_millis,
            actor: entities[&Role::Actor].clone(),
            object: entities.get(&Role::Object).cloned(),
            target: entities.get(&Role::Target).cloned(),
        };

        let ctx = AssociationsContext::new(self.registry.clone());
        let mut all_routes: Vec<Route> = Vec::new();

        for (stream_type, stream_config) in &type_options.streams {
            let Some(stream_options) = self.registry.stream_type(stream_type) else {
                tracing::warn!(
                    stream_type = %stream_type,
                    activity_type = %seed.activity_type,
                    "Activity type references an unregistered stream type"
                );
                continue;
            };

            match self
                .routes_for_stream(&ctx, &activity, stream_type, stream_config)
                .await
            {
                Ok(mut routes) => {
                    if stream_options.visibility_bucketing {
                        routes = self.bucket_by_visibility(&activity, routes);
                    }
                    for route in &mut routes {
                        route.transient = stream_options.transient;
                    }
                    all_routes.extend(routes);
                }
                Err(e) => {
                    tracing::warn!(
                        stream_type = %stream_type,
                        activity_type = %seed.activity_type,
                        error = %e,
                        "Dropping stream from routing pass"
                    );
                }
            }
        }

        let routed: Vec<RoutedActivity> = all_routes
            .into_iter()
            .map(|route| RoutedActivity {
                route,
                activity: activity.clone(),
            })
            .collect();

        if routed.is_empty() {
            tracing::debug!(activity_type = %seed.activity_type, "Seed produced no routes");
            return Ok(());
        }

        let entries: Vec<(u32, RoutedActivity)> = routed
            .iter()
            .map(|r| {
                let bucket = bucket_number(
                    &format!("{}+{}", r.route.feed_id(), r.activity.activity_type),
                    self.bucket_count,
                );
                (bucket, r.clone())
            })
            .collect();
        self.queue.enqueue(&entries).await?;

        tracing::debug!(
            activity_type = %seed.activity_type,
            routes = routed.len(),
            "Seed routed and queued"
        );

        self.bus.publish_routed(RoutedActivitiesEvent {
            routed: Arc::new(routed),
        });
        Ok(())
    }

    /// Produce the role entities, forcing objectType and oae:id from the seed
    async fn produce_entities(
        &self,
        seed: &ActivitySeed,
    ) -> Result<HashMap<Role, ActivityEntity>> {
        let mut entities = HashMap::new();
        for role in Role::ALL {
            let Some(resource) = seed.resource(role) else {
                continue;
            };
            let producer = self.registry.producer(&resource.resource_type);
            let mut entity = producer.produce(resource).await?;
            entity.set(
                FIELD_OBJECT_TYPE,
                serde_json::Value::String(resource.resource_type.clone()),
            );
            entity.set(
                FIELD_ID,
                serde_json::Value::String(resource.resource_id.clone()),
            );
            entities.insert(role, entity);
        }
        Ok(entities)
    }

    /// Evaluate one stream's association lists and propagation rules
    async fn routes_for_stream(
        &self,
        ctx: &AssociationsContext,
        activity: &Activity,
        stream_type: &str,
        config: &ActivityStreamConfig,
    ) -> Result<Vec<Route>> {
        // Route production: ordered union/difference of association ids per role
        let mut role_ids: HashMap<Role, Vec<String>> = HashMap::new();
        for role in Role::ALL {
            let Some(entity) = activity.entity(role) else {
                continue;
            };
            let Some(names) = config.router.get(&role) else {
                continue;
            };

            let mut ids: Vec<String> = Vec::new();
            for name in names {
                if let Some(excluded) = name.strip_prefix('^') {
                    let remove: HashSet<String> =
                        ctx.resolve(entity, excluded).await?.into_iter().collect();
                    ids.retain(|id| !remove.contains(id));
                } else {
                    for id in ctx.resolve(entity, name).await? {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
            }
            role_ids.insert(role, ids);
        }

        let mut route_ids: Vec<String> = Vec::new();
        for role in Role::ALL {
            if let Some(ids) = role_ids.get(&role) {
                for id in ids {
                    if !route_ids.contains(id) {
                        route_ids.push(id.clone());
                    }
                }
            }
        }

        // Propagation: each role's entity narrows the set in turn
        for role in Role::ALL {
            if route_ids.is_empty() {
                break;
            }
            let Some(entity) = activity.entity(role) else {
                continue;
            };
            let rules = self
                .registry
                .propagation(entity.object_type())
                .propagation(entity)
                .await?;
            route_ids = self
                .apply_propagation(ctx, activity, role, entity, &rules, route_ids, &role_ids)
                .await?;
        }

        // No self-notifications on the notification and email streams
        let base = stream_type.split('#').next().unwrap_or(stream_type);
        if base == STREAM_NOTIFICATION || base == STREAM_EMAIL {
            let actor_id = activity.actor.id().to_string();
            route_ids.retain(|id| *id != actor_id);
        }

        Ok(route_ids
            .into_iter()
            .map(|id| Route::new(id, stream_type, false))
            .collect())
    }

    /// Keep the routes admitted by any of the entity's rules, preserving
    /// route order. Evaluation stops early once everything is admitted.
    #[allow(clippy::too_many_arguments)]
    async fn apply_propagation(
        &self,
        ctx: &AssociationsContext,
        activity: &Activity,
        role: Role,
        entity: &ActivityEntity,
        rules: &[PropagationRule],
        route_ids: Vec<String>,
        role_ids: &HashMap<Role, Vec<String>>,
    ) -> Result<Vec<String>> {
        let entity_tenant = tenant_alias_of(entity.id()).map(str::to_string);
        let mut admitted: HashSet<String> = HashSet::new();

        for rule in rules {
            if admitted.len() == route_ids.len() {
                break;
            }
            match rule {
                PropagationRule::All => {
                    admitted.extend(route_ids.iter().cloned());
                }
                PropagationRule::Tenant => {
                    let Some(entity_tenant) = &entity_tenant else {
                        continue;
                    };
                    for id in &route_ids {
                        if tenant_alias_of(id) == Some(entity_tenant.as_str()) {
                            admitted.insert(id.clone());
                        }
                    }
                }
                PropagationRule::InteractingTenants => {
                    let Some(entity_tenant) = &entity_tenant else {
                        continue;
                    };
                    for id in &route_ids {
                        let Some(route_tenant) = tenant_alias_of(id) else {
                            continue;
                        };
                        if self.tenants.can_interact(route_tenant, entity_tenant).await? {
                            admitted.insert(id.clone());
                        }
                    }
                }
                PropagationRule::Routes => {
                    if let Some(own) = role_ids.get(&role) {
                        admitted.extend(own.iter().cloned());
                    }
                }
                PropagationRule::SelfAssociation => {
                    admitted.extend(ctx.resolve(entity, ASSOCIATION_SELF).await?);
                }
                PropagationRule::Association(name) => {
                    admitted.extend(ctx.resolve(entity, name).await?);
                }
                PropagationRule::ExternalAssociation {
                    object_type,
                    association,
                } => {
                    // The association resolves against the first other role
                    // whose entity carries the named objectType
                    let external = Role::ALL.into_iter().find_map(|other| {
                        if other == role {
                            return None;
                        }
                        activity
                            .entity(other)
                            .filter(|e| e.object_type() == object_type)
                    });
                    if let Some(external) = external {
                        admitted.extend(ctx.resolve(external, association).await?);
                    }
                }
            }
        }

        Ok(route_ids
            .into_iter()
            .filter(|id| admitted.contains(id))
            .collect())
    }

    /// Mirror qualifying routes into `#public` / `#loggedin` variants when
    /// every present entity satisfies the tier
    fn bucket_by_visibility(&self, activity: &Activity, routes: Vec<Route>) -> Vec<Route> {
        let entities: Vec<&ActivityEntity> = Role::ALL
            .into_iter()
            .filter_map(|role| activity.entity(role))
            .collect();

        let all_public = entities
            .iter()
            .all(|e| e.visibility() == Visibility::Public);
        let all_loggedin = entities.iter().all(|e| {
            matches!(e.visibility(), Visibility::Public | Visibility::LoggedIn)
        });

        let mut suffixes: Vec<&str> = Vec::new();
        if all_public {
            suffixes.push("#public");
        }
        if all_loggedin {
            suffixes.push("#loggedin");
        }
        if suffixes.is_empty() {
            return routes;
        }

        let actor_id = activity.actor.id();
        let actor_is_user = activity.actor.object_type() == "user";
        let group_ids: HashSet<&str> = [Role::Object, Role::Target]
            .into_iter()
            .filter_map(|role| activity.entity(role))
            .filter(|e| e.object_type() == "group")
            .map(|e| e.id())
            .collect();

        let mut result = Vec::with_capacity(routes.len() * (1 + suffixes.len()));
        for route in routes {
            let qualifies = (actor_is_user && route.resource_id == actor_id)
                || group_ids.contains(route.resource_id.as_str());
            let variants: Vec<Route> = if qualifies {
                suffixes
                    .iter()
                    .map(|suffix| {
                        Route::new(
                            route.resource_id.clone(),
                            format!("{}{}", route.stream_type, suffix),
                            route.transient,
                        )
                    })
                    .collect()
            } else {
                Vec::new()
            };
            result.push(route);
            result.extend(variants);
        }
        result
    }
}
