//! Aggregate state in the key-value store
//!
//! Each aggregate key owns a status blob and three role maps
//! (actors/objects/targets) of entityKey → entity identity. Entities
//! themselves are stored once per content-hash identity, which breaks the
//! cyclic activity/entity references and lets many aggregates share one
//! entity value. TTL policy: any touch of status or role maps resets the idle
//! expiry; identity values and the per-feed active-key sets live for the max
//! expiry, and the active sets are trimmed of entries older than the max
//! expiry on every update.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    clock::Clock,
    error::Result,
    kv::KeyValue,
    model::{ActivityEntity, AggregateStatus, Role},
};

/// Per-role entity maps of one aggregate, keyed by entity id
pub type RoleEntityMaps = HashMap<Role, BTreeMap<String, ActivityEntity>>;

fn status_key(aggregate_key: &str) -> String {
    format!("oae-activity:aggregate:{}:status", aggregate_key)
}

fn entities_key(aggregate_key: &str, role: Role) -> String {
    format!(
        "oae-activity:aggregate:{}:{}:entities",
        aggregate_key,
        role.plural()
    )
}

fn identity_key(identity: &str) -> String {
    format!("oae-activity:entity:{}", identity)
}

fn active_key(feed_id: &str) -> String {
    format!("oae-activity:active-aggregates:{}", feed_id)
}

/// Content-hash identity of an entity value. `serde_json` maps are ordered,
/// so equal values always hash equally.
#[must_use]
pub fn entity_identity(entity: &ActivityEntity) -> String {
    let canonical = serde_json::to_string(entity).unwrap_or_default();
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

/// Stores aggregate status and denormalised entity content with idle/max TTLs
#[derive(Debug, Clone)]
pub struct AggregateStore {
    kv: Arc<dyn KeyValue>,
    clock: Arc<dyn Clock>,
    idle_expiry: Duration,
    max_expiry: Duration,
}

impl AggregateStore {
    /// Create an aggregate store
    #[must_use]
    pub fn new(
        kv: Arc<dyn KeyValue>,
        clock: Arc<dyn Clock>,
        idle_expiry: Duration,
        max_expiry: Duration,
    ) -> Self {
        Self {
            kv,
            clock,
            idle_expiry,
            max_expiry,
        }
    }

    /// The configured max expiry in milliseconds
    #[must_use]
    pub fn max_expiry_millis(&self) -> i64 {
        self.max_expiry.as_millis() as i64
    }

    /// Read statuses for many aggregate keys; missing keys are omitted
    pub async fn status_many(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, AggregateStatus>> {
        let status_keys: Vec<String> = keys.iter().map(|k| status_key(k)).collect();
        let values = self.kv.get_many(&status_keys).await?;

        let mut statuses = HashMap::new();
        for (key, value) in keys.iter().zip(values) {
            let Some(value) = value else { continue };
            match serde_json::from_str::<AggregateStatus>(&value) {
                Ok(status) => {
                    statuses.insert(key.clone(), status);
                }
                Err(e) => {
                    tracing::warn!(aggregate_key = %key, error = %e, "Dropping unparseable aggregate status");
                }
            }
        }
        Ok(statuses)
    }

    /// Write statuses and index each aggregate into its feed's active set,
    /// trimming entries older than the max expiry
    pub async fn index_status(
        &self,
        updates: &[(String, String, AggregateStatus)],
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let cutoff = now - self.max_expiry_millis();

        for (feed_id, aggregate_key, status) in updates {
            let value = serde_json::to_string(status)?;
            self.kv
                .set(&status_key(aggregate_key), &value, Some(self.idle_expiry))
                .await?;

            let active = active_key(feed_id);
            self.kv
                .zset_add(&active, &[(now, aggregate_key.clone())])
                .await?;
            self.kv.zset_remove_by_score(&active, 0, cutoff).await?;
            self.kv.expire(&active, self.max_expiry).await?;
        }
        Ok(())
    }

    /// The aggregate keys still active for each feed: entries whose score is
    /// at least `now − maxExpiry`
    pub async fn active_keys_for_feeds(
        &self,
        feed_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        let cutoff = self.clock.now_millis() - self.max_expiry_millis();
        let mut result = HashMap::new();
        for feed_id in feed_ids {
            let keys = self
                .kv
                .zset_range_by_score(&active_key(feed_id), cutoff, i64::MAX)
                .await?;
            result.insert(feed_id.clone(), keys);
        }
        Ok(result)
    }

    /// Load the role entity maps for many aggregate keys, resolving identity
    /// references. An identity that no longer resolves is logged and skipped.
    pub async fn load_aggregates(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, RoleEntityMaps>> {
        // First pass: read all role maps and gather the identities they reference
        let mut raw: HashMap<String, HashMap<Role, HashMap<String, String>>> = HashMap::new();
        let mut identities: Vec<String> = Vec::new();

        for key in keys {
            let mut roles = HashMap::new();
            for role in Role::ALL {
                let map = self.kv.hash_get_all(&entities_key(key, role)).await?;
                identities.extend(map.values().cloned());
                roles.insert(role, map);
            }
            raw.insert(key.clone(), roles);
        }

        identities.sort();
        identities.dedup();
        let identity_keys: Vec<String> = identities.iter().map(|i| identity_key(i)).collect();
        let values = self.kv.get_many(&identity_keys).await?;

        let mut entities: HashMap<String, ActivityEntity> = HashMap::new();
        for (identity, value) in identities.iter().zip(values) {
            let Some(value) = value else {
                tracing::warn!(identity = %identity, "Aggregate entity identity does not resolve");
                continue;
            };
            match serde_json::from_str::<ActivityEntity>(&value) {
                Ok(entity) => {
                    entities.insert(identity.clone(), entity);
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "Dropping unparseable entity value");
                }
            }
        }

        let mut result = HashMap::new();
        for (key, roles) in raw {
            let mut maps: RoleEntityMaps = HashMap::new();
            for (role, map) in roles {
                let resolved: BTreeMap<String, ActivityEntity> = map
                    .into_iter()
                    .filter_map(|(entity_key, identity)| {
                        entities
                            .get(&identity)
                            .cloned()
                            .map(|entity| (entity_key, entity))
                    })
                    .collect();
                if !resolved.is_empty() {
                    maps.insert(role, resolved);
                }
            }
            result.insert(key, maps);
        }
        Ok(result)
    }

    /// Merge role entities into the stored maps and write any new entity
    /// values into the identity store with the max expiry
    pub async fn save_aggregates(&self, partials: &[(String, RoleEntityMaps)]) -> Result<()> {
        for (aggregate_key, maps) in partials {
            for (role, entities) in maps {
                if entities.is_empty() {
                    continue;
                }

                let mut fields = Vec::with_capacity(entities.len());
                for (entity_key, entity) in entities {
                    let identity = entity_identity(entity);
                    let value = serde_json::to_string(entity)?;
                    // Identity values must outlive any aggregate referencing them
                    self.kv
                        .set(&identity_key(&identity), &value, Some(self.max_expiry))
                        .await?;
                    fields.push((entity_key.clone(), identity));
                }

                let map_key = entities_key(aggregate_key, *role);
                self.kv.hash_set(&map_key, &fields).await?;
                self.kv.expire(&map_key, self.idle_expiry).await?;
            }
        }
        Ok(())
    }

    /// Delete status and role maps for the given aggregate keys. The caller
    /// is responsible for removing them from the per-feed active sets; entity
    /// identity values are left to expire.
    pub async fn delete_aggregates(&self, keys: &[String]) -> Result<()> {
        let mut to_delete = Vec::with_capacity(keys.len() * 4);
        for key in keys {
            to_delete.push(status_key(key));
            for role in Role::ALL {
                to_delete.push(entities_key(key, role));
            }
        }
        self.kv.delete(&to_delete).await
    }

    /// Delete every active aggregate of the given feeds and clear their
    /// active sets
    pub async fn reset_feeds(&self, feed_ids: &[String]) -> Result<()> {
        for feed_id in feed_ids {
            let active = active_key(feed_id);
            let members: Vec<String> = self
                .kv
                .zset_range(&active, 0, -1)
                .await?
                .into_iter()
                .map(|(member, _)| member)
                .collect();
            if !members.is_empty() {
                self.delete_aggregates(&members).await?;
            }
            self.kv.delete(&[active]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryKeyValue;

    fn store() -> (Arc<ManualClock>, AggregateStore) {
        let clock = ManualClock::new(1_000_000);
        let kv = Arc::new(MemoryKeyValue::new(clock.clone()));
        let aggregate = AggregateStore::new(
            kv,
            clock.clone(),
            Duration::from_secs(3_600),
            Duration::from_secs(86_400),
        );
        (clock, aggregate)
    }

    fn status(last_activity_id: &str, created: i64) -> AggregateStatus {
        AggregateStatus {
            last_activity_id: last_activity_id.to_string(),
            created_millis: created,
            last_updated_millis: created,
            last_collected_millis: created,
        }
    }

    fn maps_with(role: Role, entities: &[(&str, &str)]) -> RoleEntityMaps {
        let mut maps = RoleEntityMaps::new();
        let entries: BTreeMap<String, ActivityEntity> = entities
            .iter()
            .map(|(object_type, id)| {
                (id.to_string(), ActivityEntity::new(*object_type, *id))
            })
            .collect();
        maps.insert(role, entries);
        maps
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let (_, store) = store();
        let key = "activity#u:cam:alice#content-share#u:cam:alice#*#-".to_string();
        store
            .index_status(&[(
                "u:cam:alice#activity".to_string(),
                key.clone(),
                status("1000:aaaa", 1_000_000),
            )])
            .await
            .unwrap();

        let statuses = store.status_many(&[key.clone()]).await.unwrap();
        assert_eq!(statuses[&key].last_activity_id, "1000:aaaa");

        let missing = store
            .status_many(&["nothing-here".to_string()])
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_status_idles_out() {
        let (clock, store) = store();
        let key = "k1".to_string();
        store
            .index_status(&[(
                "u:cam:alice#activity".to_string(),
                key.clone(),
                status("1000:aaaa", 1_000_000),
            )])
            .await
            .unwrap();

        clock.advance(3_600_001);
        let statuses = store.status_many(&[key]).await.unwrap();
        assert!(statuses.is_empty());
    }

    #[tokio::test]
    async fn test_touch_refreshes_idle_expiry() {
        let (clock, store) = store();
        let feed = "u:cam:alice#activity".to_string();
        let key = "k1".to_string();
        store
            .index_status(&[(feed.clone(), key.clone(), status("1000:aaaa", 1_000_000))])
            .await
            .unwrap();

        clock.advance(3_000_000);
        store
            .index_status(&[(feed, key.clone(), status("1000:aaaa", 1_000_000))])
            .await
            .unwrap();

        clock.advance(3_000_000);
        let statuses = store.status_many(&[key]).await.unwrap();
        assert_eq!(statuses.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load_resolves_identities() {
        let (_, store) = store();
        let key = "k1".to_string();
        let maps = maps_with(
            Role::Target,
            &[("group", "g:cam:devs"), ("user", "u:cam:carol")],
        );
        store
            .save_aggregates(&[(key.clone(), maps)])
            .await
            .unwrap();

        let loaded = store.load_aggregates(&[key.clone()]).await.unwrap();
        let targets = &loaded[&key][&Role::Target];
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["g:cam:devs"].object_type(), "group");
        assert_eq!(targets["u:cam:carol"].object_type(), "user");
    }

    #[tokio::test]
    async fn test_save_merges_role_maps() {
        let (_, store) = store();
        let key = "k1".to_string();
        store
            .save_aggregates(&[(key.clone(), maps_with(Role::Object, &[("content", "c:cam:a")]))])
            .await
            .unwrap();
        store
            .save_aggregates(&[(key.clone(), maps_with(Role::Object, &[("content", "c:cam:b")]))])
            .await
            .unwrap();

        let loaded = store.load_aggregates(&[key.clone()]).await.unwrap();
        assert_eq!(loaded[&key][&Role::Object].len(), 2);
    }

    #[tokio::test]
    async fn test_identities_outlive_idle_role_maps() {
        let (clock, store) = store();
        let key = "k1".to_string();
        store
            .save_aggregates(&[(key.clone(), maps_with(Role::Actor, &[("user", "u:cam:alice")]))])
            .await
            .unwrap();

        // Role maps idle out after an hour; identity values last the max expiry
        clock.advance(3_600_001);
        let loaded = store.load_aggregates(&[key.clone()]).await.unwrap();
        assert!(loaded[&key].is_empty());

        // A fresh save of the same entity reuses the surviving identity
        store
            .save_aggregates(&[(key.clone(), maps_with(Role::Actor, &[("user", "u:cam:alice")]))])
            .await
            .unwrap();
        let loaded = store.load_aggregates(&[key]).await.unwrap();
        assert_eq!(loaded["k1"][&Role::Actor].len(), 1);
    }

    #[tokio::test]
    async fn test_active_keys_trim_to_max_expiry() {
        let (clock, store) = store();
        let feed = "u:cam:alice#activity".to_string();
        store
            .index_status(&[(feed.clone(), "old".to_string(), status("1:a", 1_000_000))])
            .await
            .unwrap();

        clock.advance(86_400_001);
        store
            .index_status(&[(feed.clone(), "fresh".to_string(), status("2:b", 87_400_001))])
            .await
            .unwrap();

        let active = store.active_keys_for_feeds(&[feed.clone()]).await.unwrap();
        assert_eq!(active[&feed], vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_feeds_deletes_active_aggregates() {
        let (_, store) = store();
        let feed = "u:cam:alice#notification".to_string();
        let key = "k1".to_string();
        store
            .index_status(&[(feed.clone(), key.clone(), status("1:a", 1_000_000))])
            .await
            .unwrap();
        store
            .save_aggregates(&[(key.clone(), maps_with(Role::Actor, &[("user", "u:cam:bob")]))])
            .await
            .unwrap();

        store.reset_feeds(&[feed.clone()]).await.unwrap();

        assert!(store.status_many(&[key.clone()]).await.unwrap().is_empty());
        assert!(store.load_aggregates(&[key]).await.unwrap()["k1"].is_empty());
        let active = store.active_keys_for_feeds(&[feed.clone()]).await.unwrap();
        assert!(active[&feed].is_empty());
    }

    #[test]
    fn test_entity_identity_is_content_addressed() {
        let a = ActivityEntity::new("user", "u:cam:alice");
        let b = ActivityEntity::new("user", "u:cam:alice");
        let c = ActivityEntity::new("user", "u:cam:bob");
        assert_eq!(entity_identity(&a), entity_identity(&b));
        assert_ne!(entity_identity(&a), entity_identity(&c));
    }
}
