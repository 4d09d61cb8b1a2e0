//! Refresh - Reconcile recorded state with what providers actually report

use crate::provider::{ProviderRegistry, ProviderResult};
use crate::snapshot::{StateRecord, StateSnapshot};

/// Read every recorded resource back from its provider
///
/// Resources the provider no longer finds are dropped, so the next plan
/// creates them again. Records whose kind has no provider are kept as-is.
pub async fn refresh_snapshot(
    snapshot: &StateSnapshot,
    registry: &ProviderRegistry,
) -> ProviderResult<StateSnapshot> {
    let mut refreshed = Vec::with_capacity(snapshot.len());

    for record in snapshot.records() {
        let Some(provider) = registry.get(&record.id.kind) else {
            log::warn!("no provider for {}; keeping recorded state", record.id);
            refreshed.push(record.clone());
            continue;
        };

        let state = provider
            .read(&record.id, &record.identifier)
            .await
            .map_err(|e| e.for_resource(record.id.clone()))?;

        if !state.exists {
            log::info!("{} no longer exists", record.id);
            continue;
        }

        let mut attributes = record.attributes.clone();
        attributes.extend(state.attributes);
        refreshed.push(StateRecord {
            id: record.id.clone(),
            identifier: state.identifier.unwrap_or_else(|| record.identifier.clone()),
            attributes,
            dependencies: record.dependencies.clone(),
        });
    }

    Ok(StateSnapshot::from_records(refreshed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BoxFuture, Provider, ProviderError, ResourceType};
    use crate::resource::{Resource, ResourceId, State, Value};
    use std::collections::HashMap;

    struct Inventory;

    impl Provider for Inventory {
        fn name(&self) -> &'static str {
            "inventory"
        }

        fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
            vec![]
        }

        fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
            let id = id.clone();
            let identifier = identifier.to_string();
            Box::pin(async move {
                match identifier.as_str() {
                    "gone" => Ok(State::not_found(id)),
                    "broken" => Err(ProviderError::new("access denied")),
                    _ => {
                        let attrs = HashMap::from([(
                            "size".to_string(),
                            Value::Int(20),
                        )]);
                        Ok(State::existing(id, attrs).with_identifier(identifier))
                    }
                }
            })
        }

        fn create(&self, _: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            Box::pin(async { Err(ProviderError::new("read only")) })
        }

        fn update(
            &self,
            _: &ResourceId,
            _: &str,
            _: &State,
            _: &Resource,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            Box::pin(async { Err(ProviderError::new("read only")) })
        }

        fn delete(&self, _: &ResourceId, _: &str) -> BoxFuture<'_, ProviderResult<()>> {
            Box::pin(async { Err(ProviderError::new("read only")) })
        }
    }

    #[tokio::test]
    async fn refresh_adopts_provider_values_and_drops_missing() {
        let registry = ProviderRegistry::new().with_fallback(std::sync::Arc::new(Inventory));
        let snapshot = StateSnapshot::from_records(vec![
            StateRecord::new(ResourceId::new("disk", "a"), "disk-1")
                .with_attribute("size", Value::Int(10))
                .with_attribute("name", Value::String("a".to_string())),
            StateRecord::new(ResourceId::new("disk", "b"), "gone"),
        ]);

        let refreshed = refresh_snapshot(&snapshot, &registry).await.unwrap();

        assert_eq!(refreshed.len(), 1);
        let a = refreshed.get(&ResourceId::new("disk", "a")).unwrap();
        assert_eq!(a.attributes["size"], Value::Int(20));
        assert_eq!(a.attributes["name"], Value::String("a".to_string()));
    }

    #[tokio::test]
    async fn refresh_propagates_read_errors() {
        let registry = ProviderRegistry::new().with_fallback(std::sync::Arc::new(Inventory));
        let snapshot = StateSnapshot::from_records(vec![StateRecord::new(
            ResourceId::new("disk", "c"),
            "broken",
        )]);

        let err = refresh_snapshot(&snapshot, &registry).await.unwrap_err();
        assert_eq!(err.resource_id, Some(ResourceId::new("disk", "c")));
    }

    #[tokio::test]
    async fn kinds_without_provider_are_kept() {
        let registry = ProviderRegistry::new();
        let snapshot = StateSnapshot::from_records(vec![StateRecord::new(
            ResourceId::new("disk", "a"),
            "disk-1",
        )]);

        let refreshed = refresh_snapshot(&snapshot, &registry).await.unwrap();
        assert_eq!(refreshed.records(), snapshot.records());
    }
}
