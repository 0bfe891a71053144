use std::sync::Arc;

use tracing::trace;

use crate::bridge::Bridge;
use crate::entity::{display_name, Entity, EntityKind, GroupHandle, LightHandle, SceneHandle, SensorHandle};
use crate::error::{ApiError, ResolveError};
use crate::registry::{Fetch, NameMap, Registry};

/// Hue error type for "resource not available".
const RESOURCE_NOT_AVAILABLE: u32 = 3;

fn lookup_error(kind: EntityKind, token: &str, err: ApiError) -> ResolveError {
    match err {
        ApiError::Bridge { kind: RESOURCE_NOT_AVAILABLE, .. } => ResolveError::NotFound {
            kind,
            token: token.to_string(),
        },
        other => ResolveError::Api(other),
    }
}

fn not_found(kind: EntityKind, token: &str) -> ResolveError {
    ResolveError::NotFound {
        kind,
        token: token.to_string(),
    }
}

/// Which bridges a name may resolve to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    /// Any registered bridge, by registry key.
    #[default]
    Registry,
    /// Only the bridge the command runs against. Used when one command is
    /// sent to every bridge, where `Kitchen` means each bridge's own group.
    Bridge,
}

/// Turns user tokens into entity handles.
///
/// A numeric token is an id on the given bridge and is fetched directly;
/// anything else is looked up by display name.
pub struct Resolver<'a> {
    registry: &'a Registry,
    scope: Scope,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self::with_scope(registry, Scope::Registry)
    }

    pub fn with_scope(registry: &'a Registry, scope: Scope) -> Self {
        Self { registry, scope }
    }

    fn by_name<T: Fetch>(&self, map: &NameMap<T>, token: &str, bridge: &Arc<Bridge>) -> Option<T> {
        match self.scope {
            Scope::Registry => map.get(token).cloned(),
            Scope::Bridge => map
                .iter()
                .find(|(key, item)| {
                    Arc::ptr_eq(item.bridge(), bridge)
                        && (key.as_str() == token || display_name(item.name()) == token)
                })
                .map(|(_, item)| item.clone()),
        }
    }

    /// A scene by name only, honouring the scope.
    pub async fn named_scene(&self, token: &str, bridge: &Arc<Bridge>) -> Option<SceneHandle> {
        self.by_name(&*self.registry.scene_map().await, token, bridge)
    }

    pub async fn resolve(
        &self,
        kind: EntityKind,
        token: &str,
        bridge: &Arc<Bridge>,
    ) -> Result<Entity, ResolveError> {
        Ok(match kind {
            EntityKind::Light => Entity::Light(self.light(token, bridge).await?),
            EntityKind::Group => Entity::Group(self.group(token, bridge).await?),
            EntityKind::Scene => Entity::Scene(self.scene(token, bridge).await?),
            EntityKind::Sensor => Entity::Sensor(self.sensor(token, bridge).await?),
        })
    }

    pub async fn light(&self, token: &str, bridge: &Arc<Bridge>) -> Result<LightHandle, ResolveError> {
        if let Ok(id) = token.parse::<u32>() {
            trace!("Fetching light {} from {}", id, bridge.id());
            let light = bridge
                .api()
                .get_light(id)
                .await
                .map_err(|e| lookup_error(EntityKind::Light, token, e))?;
            return Ok(LightHandle {
                bridge: bridge.clone(),
                light,
            });
        }
        self.by_name(&*self.registry.light_map().await, token, bridge)
            .ok_or_else(|| not_found(EntityKind::Light, token))
    }

    pub async fn group(&self, token: &str, bridge: &Arc<Bridge>) -> Result<GroupHandle, ResolveError> {
        if let Ok(id) = token.parse::<u32>() {
            trace!("Fetching group {} from {}", id, bridge.id());
            let group = bridge
                .api()
                .get_group(id)
                .await
                .map_err(|e| lookup_error(EntityKind::Group, token, e))?;
            return Ok(GroupHandle {
                bridge: bridge.clone(),
                group,
            });
        }
        self.by_name(&*self.registry.group_map().await, token, bridge)
            .ok_or_else(|| not_found(EntityKind::Group, token))
    }

    pub async fn sensor(&self, token: &str, bridge: &Arc<Bridge>) -> Result<SensorHandle, ResolveError> {
        if let Ok(id) = token.parse::<u32>() {
            trace!("Fetching sensor {} from {}", id, bridge.id());
            let sensor = bridge
                .api()
                .get_sensor(id)
                .await
                .map_err(|e| lookup_error(EntityKind::Sensor, token, e))?;
            return Ok(SensorHandle {
                bridge: bridge.clone(),
                sensor,
            });
        }
        self.by_name(&*self.registry.sensor_map().await, token, bridge)
            .ok_or_else(|| not_found(EntityKind::Sensor, token))
    }

    /// Scene ids are opaque strings, so the name map is tried first and the
    /// token is then treated as an id on `bridge`.
    pub async fn scene(&self, token: &str, bridge: &Arc<Bridge>) -> Result<SceneHandle, ResolveError> {
        if let Some(scene) = self.named_scene(token, bridge).await {
            return Ok(scene);
        }
        let scene = bridge
            .api()
            .get_scene(token)
            .await
            .map_err(|e| lookup_error(EntityKind::Scene, token, e))?;
        Ok(SceneHandle {
            bridge: bridge.clone(),
            scene,
        })
    }

    /// Scenes stored on `group`'s bridge for that group.
    pub async fn scenes_for_group(&self, group: &GroupHandle) -> Result<Vec<SceneHandle>, ResolveError> {
        let group_id = group.group.id.to_string();
        let scenes = group.bridge.api().get_scenes().await?;
        Ok(scenes
            .into_iter()
            .filter(|s| s.group.as_deref() == Some(group_id.as_str()))
            .map(|scene| SceneHandle {
                bridge: group.bridge.clone(),
                scene,
            })
            .collect())
    }

    /// A scene belonging to `group`, matched by id or name.
    pub async fn scene_in_group(
        &self,
        group: &GroupHandle,
        token: &str,
    ) -> Result<Option<SceneHandle>, ResolveError> {
        Ok(self.scenes_for_group(group).await?.into_iter().find(|s| {
            s.scene.id == token || s.scene.name == token || display_name(&s.scene.name) == token
        }))
    }
}
