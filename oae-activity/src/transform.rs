//! Activity rendering for the read, push and email surfaces
//!
//! The `internal` format returns stored records verbatim; `activitystreams`
//! runs every entity through its registered transformer, including the
//! members of collection entities. A transformer failure drops the affected
//! activity from the pass and the rest proceed.

use serde_json::{Map, Value};

use crate::{
    error::Result,
    model::{
        Activity, ActivityEntity, ActivityFormat, Role, FIELD_COLLECTION, OBJECT_TYPE_COLLECTION,
    },
    registry::Registry,
};

async fn transform_entity(
    registry: &Registry,
    format: ActivityFormat,
    entity: &ActivityEntity,
) -> Result<Value> {
    if entity.object_type() == OBJECT_TYPE_COLLECTION {
        let members = entity
            .get(FIELD_COLLECTION)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut transformed = Vec::with_capacity(members.len());
        for member in members {
            let Value::Object(map) = member else { continue };
            let member = ActivityEntity(map);
            transformed.push(
                Box::pin(transform_entity(registry, format, &member)).await?,
            );
        }

        let mut map = Map::new();
        map.insert(
            "objectType".to_string(),
            Value::String(OBJECT_TYPE_COLLECTION.to_string()),
        );
        map.insert(FIELD_COLLECTION.to_string(), Value::Array(transformed));
        return Ok(Value::Object(map));
    }

    registry
        .transformer(entity.object_type(), format)
        .transform(entity)
        .await
}

/// Render one activity in the requested format
pub async fn transform_activity(
    registry: &Registry,
    format: ActivityFormat,
    activity: &Activity,
) -> Result<Value> {
    if format == ActivityFormat::Internal {
        return Ok(serde_json::to_value(activity)?);
    }

    let mut map = Map::new();
    map.insert(
        "oae:activityType".to_string(),
        Value::String(activity.activity_type.clone()),
    );
    map.insert(
        "oae:activityId".to_string(),
        Value::String(activity.activity_id.clone()),
    );
    map.insert("verb".to_string(), Value::String(activity.verb.clone()));
    map.insert(
        "published".to_string(),
        Value::Number(activity.published_millis.into()),
    );

    for role in Role::ALL {
        if let Some(entity) = activity.entity(role) {
            map.insert(
                role.as_str().to_string(),
                transform_entity(registry, format, entity).await?,
            );
        }
    }

    Ok(Value::Object(map))
}

/// Render many activities, dropping the ones whose transform fails
pub async fn transform_activities(
    registry: &Registry,
    format: ActivityFormat,
    activities: &[Activity],
) -> Vec<Value> {
    let mut rendered = Vec::with_capacity(activities.len());
    for activity in activities {
        match transform_activity(registry, format, activity).await {
            Ok(value) => rendered.push(value),
            Err(e) => {
                tracing::warn!(
                    activity_id = %activity.activity_id,
                    error = %e,
                    "Dropping activity from transform pass"
                );
            }
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EntityTransformer, EntityTypeOptions};
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FailingTransformer;

    #[async_trait]
    impl EntityTransformer for FailingTransformer {
        async fn transform(&self, _entity: &ActivityEntity) -> Result<Value> {
            Err(Error::Storage("entity lookup failed".into()))
        }
    }

    fn activity(target: Option<ActivityEntity>) -> Activity {
        Activity {
            activity_type: "content-share".to_string(),
            activity_id: "1000:aaaaaaaa".to_string(),
            verb: "share".to_string(),
            published_millis: 1_000,
            actor: ActivityEntity::new("user", "u:cam:alice"),
            object: Some(ActivityEntity::new("content", "c:cam:doc")),
            target,
        }
    }

    #[tokio::test]
    async fn test_internal_format_is_verbatim() {
        let registry = Registry::builder().build();
        let activity = activity(None);
        let rendered = transform_activity(&registry, ActivityFormat::Internal, &activity)
            .await
            .unwrap();
        assert_eq!(rendered, serde_json::to_value(&activity).unwrap());
    }

    #[tokio::test]
    async fn test_activitystreams_uses_default_transformer() {
        let registry = Registry::builder().build();
        let rendered =
            transform_activity(&registry, ActivityFormat::ActivityStreams, &activity(None))
                .await
                .unwrap();
        assert_eq!(rendered["actor"]["oae:id"], "u:cam:alice");
        assert_eq!(rendered["object"]["objectType"], "content");
        assert_eq!(rendered["oae:activityId"], "1000:aaaaaaaa");
    }

    #[tokio::test]
    async fn test_collection_members_are_transformed() {
        let registry = Registry::builder().build();
        let collection = ActivityEntity::collection(vec![
            ActivityEntity::new("group", "g:cam:devs"),
            ActivityEntity::new("user", "u:cam:carol"),
        ]);
        let rendered = transform_activity(
            &registry,
            ActivityFormat::ActivityStreams,
            &activity(Some(collection)),
        )
        .await
        .unwrap();

        let members = rendered["target"]["oae:collection"].as_array().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0]["oae:id"], "g:cam:devs");
    }

    #[tokio::test]
    async fn test_failed_transform_drops_only_that_activity() {
        let registry = Registry::builder()
            .entity_type(
                "content",
                EntityTypeOptions {
                    transformers: [(
                        ActivityFormat::ActivityStreams,
                        Arc::new(FailingTransformer) as Arc<dyn EntityTransformer>,
                    )]
                    .into(),
                    ..Default::default()
                },
            )
            .unwrap()
            .build();

        let with_content = activity(None);
        let mut without_content = activity(None);
        without_content.object = None;
        without_content.activity_id = "1001:bbbbbbbb".to_string();

        let rendered = transform_activities(
            &registry,
            ActivityFormat::ActivityStreams,
            &[with_content, without_content],
        )
        .await;

        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0]["oae:activityId"], "1001:bbbbbbbb");
    }
}
