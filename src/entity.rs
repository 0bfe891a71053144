use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::Bridge;
use crate::error::ApiError;
use crate::hue_client::Resource;
use crate::model::{Group, Light, LightState, Scene, Sensor, StateUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Light,
    Group,
    Scene,
    Sensor,
}

impl EntityKind {
    pub fn resource(self) -> Resource {
        match self {
            EntityKind::Light => Resource::Lights,
            EntityKind::Group => Resource::Groups,
            EntityKind::Scene => Resource::Scenes,
            EntityKind::Sensor => Resource::Sensors,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Light => "light",
            EntityKind::Group => "group",
            EntityKind::Scene => "scene",
            EntityKind::Sensor => "sensor",
        })
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" | "l" | "lights" => Ok(EntityKind::Light),
            "group" | "g" | "groups" => Ok(EntityKind::Group),
            "scene" | "sc" | "scenes" => Ok(EntityKind::Scene),
            "sensor" | "sensors" => Ok(EntityKind::Sensor),
            other => Err(format!("unknown entity kind {:?}", other)),
        }
    }
}

/// Key used in the registry name maps. The shell splits on whitespace, so
/// spaces in bridge names become underscores.
pub fn display_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// Something `set` can act on: a light, a group, or a sensor's config.
#[async_trait]
pub trait Target: Send + Sync {
    fn label(&self) -> String;
    fn bridge(&self) -> &Arc<Bridge>;
    /// Last fetched light state, if this target has one.
    fn current_state(&self) -> Option<&LightState>;
    async fn apply(&self, update: &StateUpdate) -> Result<(), ApiError>;
    async fn recall_scene(&self, scene_id: &str) -> Result<(), ApiError>;
    async fn refresh(&mut self) -> Result<(), ApiError>;
    /// Record an accepted update in the snapshot without asking the bridge.
    fn assume(&mut self, update: &StateUpdate);
    /// Light ids this target drives.
    fn member_lights(&self) -> Vec<u32>;
}

#[derive(Clone)]
pub struct LightHandle {
    pub bridge: Arc<Bridge>,
    pub light: Light,
}

#[derive(Clone)]
pub struct GroupHandle {
    pub bridge: Arc<Bridge>,
    pub group: Group,
}

#[derive(Clone)]
pub struct SceneHandle {
    pub bridge: Arc<Bridge>,
    pub scene: Scene,
}

#[derive(Clone)]
pub struct SensorHandle {
    pub bridge: Arc<Bridge>,
    pub sensor: Sensor,
}

#[derive(Clone)]
pub enum Entity {
    Light(LightHandle),
    Group(GroupHandle),
    Scene(SceneHandle),
    Sensor(SensorHandle),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Light(_) => EntityKind::Light,
            Entity::Group(_) => EntityKind::Group,
            Entity::Scene(_) => EntityKind::Scene,
            Entity::Sensor(_) => EntityKind::Sensor,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Entity::Light(h) => h.light.id.to_string(),
            Entity::Group(h) => h.group.id.to_string(),
            Entity::Scene(h) => h.scene.id.clone(),
            Entity::Sensor(h) => h.sensor.id.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::Light(h) => &h.light.name,
            Entity::Group(h) => &h.group.name,
            Entity::Scene(h) => &h.scene.name,
            Entity::Sensor(h) => &h.sensor.name,
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        match self {
            Entity::Light(h) => &h.bridge,
            Entity::Group(h) => &h.bridge,
            Entity::Scene(h) => &h.bridge,
            Entity::Sensor(h) => &h.bridge,
        }
    }

    /// State as JSON for `get`.
    pub fn state_json(&self) -> serde_json::Value {
        match self {
            Entity::Light(h) => serde_json::to_value(&h.light.state),
            Entity::Group(h) => serde_json::to_value(&h.group.action),
            Entity::Scene(h) => serde_json::to_value(&h.scene),
            Entity::Sensor(h) => Ok(h.sensor.state.clone()),
        }
        .unwrap_or_default()
    }
}

#[async_trait]
impl Target for LightHandle {
    fn label(&self) -> String {
        format!("light {} ({})", self.light.name, self.light.id)
    }

    fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    fn current_state(&self) -> Option<&LightState> {
        Some(&self.light.state)
    }

    async fn apply(&self, update: &StateUpdate) -> Result<(), ApiError> {
        self.bridge.api().set_light_state(self.light.id, update).await
    }

    async fn recall_scene(&self, scene_id: &str) -> Result<(), ApiError> {
        // Scenes live on groups; group 0 is every light on the bridge and the
        // bridge only touches the scene's own lights.
        let update = StateUpdate {
            scene: Some(scene_id.to_string()),
            ..Default::default()
        };
        self.bridge.api().set_group_action(0, &update).await
    }

    async fn refresh(&mut self) -> Result<(), ApiError> {
        self.light = self.bridge.api().get_light(self.light.id).await?;
        Ok(())
    }

    fn assume(&mut self, update: &StateUpdate) {
        self.light.state.merge(update);
    }

    fn member_lights(&self) -> Vec<u32> {
        vec![self.light.id]
    }
}

#[async_trait]
impl Target for GroupHandle {
    fn label(&self) -> String {
        format!("group {} ({})", self.group.name, self.group.id)
    }

    fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    fn current_state(&self) -> Option<&LightState> {
        Some(&self.group.action)
    }

    async fn apply(&self, update: &StateUpdate) -> Result<(), ApiError> {
        self.bridge.api().set_group_action(self.group.id, update).await
    }

    async fn recall_scene(&self, scene_id: &str) -> Result<(), ApiError> {
        let update = StateUpdate {
            scene: Some(scene_id.to_string()),
            ..Default::default()
        };
        self.apply(&update).await
    }

    async fn refresh(&mut self) -> Result<(), ApiError> {
        self.group = self.bridge.api().get_group(self.group.id).await?;
        Ok(())
    }

    fn assume(&mut self, update: &StateUpdate) {
        self.group.action.merge(update);
    }

    fn member_lights(&self) -> Vec<u32> {
        self.group.light_ids()
    }
}

#[async_trait]
impl Target for SensorHandle {
    fn label(&self) -> String {
        format!("sensor {} ({})", self.sensor.name, self.sensor.id)
    }

    fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    fn current_state(&self) -> Option<&LightState> {
        None
    }

    /// Sensors only understand `on`/`off`, which toggles their config.
    async fn apply(&self, update: &StateUpdate) -> Result<(), ApiError> {
        let only_on = StateUpdate {
            on: update.on,
            ..Default::default()
        };
        match update.on {
            Some(on) if *update == only_on => {
                let config = serde_json::json!({ "on": on });
                self.bridge.api().set_sensor_config(self.sensor.id, &config).await
            }
            _ => Err(ApiError::Unsupported(format!(
                "light state on sensor {}",
                self.sensor.name
            ))),
        }
    }

    async fn recall_scene(&self, _scene_id: &str) -> Result<(), ApiError> {
        Err(ApiError::Unsupported(format!(
            "scene recall on sensor {}",
            self.sensor.name
        )))
    }

    async fn refresh(&mut self) -> Result<(), ApiError> {
        self.sensor = self.bridge.api().get_sensor(self.sensor.id).await?;
        Ok(())
    }

    fn assume(&mut self, _update: &StateUpdate) {}

    fn member_lights(&self) -> Vec<u32> {
        Vec::new()
    }
}
