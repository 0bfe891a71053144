//! In-memory bridge used by unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::bridge::Bridge;
use crate::error::ApiError;
use crate::hue_client::{HueApi, Resource};
use crate::model::{
    BridgeInfo, Group, Light, LightState, NewGroup, NewLights, Rule, Scene, Schedule, Sensor,
    StateUpdate,
};

#[derive(Default)]
pub struct FakeState {
    pub info: BridgeInfo,
    pub lights: BTreeMap<u32, Light>,
    pub groups: BTreeMap<u32, Group>,
    pub scenes: BTreeMap<String, Scene>,
    pub sensors: BTreeMap<u32, Sensor>,
    pub schedules: BTreeMap<u32, Schedule>,
    pub rules: BTreeMap<u32, Rule>,
    pub new_lights: Vec<(u32, String)>,
    pub calls: Vec<String>,
    pub fail_on: Option<String>,
    pub username: String,
}

#[derive(Default)]
pub struct FakeBridge {
    pub state: Mutex<FakeState>,
}

fn not_found(what: String) -> ApiError {
    ApiError::Bridge {
        kind: 3,
        address: what.clone(),
        description: format!("resource, {}, not available", what),
    }
}

impl FakeBridge {
    pub fn new(bridge_id: &str) -> Self {
        let fake = FakeBridge::default();
        {
            let mut s = fake.state.lock().unwrap();
            s.info.bridgeid = bridge_id.to_string();
            s.info.name = format!("Bridge {}", bridge_id);
        }
        fake
    }

    pub fn light(self, id: u32, name: &str, bri: u8) -> Self {
        self.state.lock().unwrap().lights.insert(
            id,
            Light {
                id,
                name: name.to_string(),
                state: LightState {
                    on: true,
                    bri,
                    reachable: true,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        self
    }

    pub fn group(self, id: u32, name: &str, lights: &[u32]) -> Self {
        self.state.lock().unwrap().groups.insert(
            id,
            Group {
                id,
                name: name.to_string(),
                lights: lights.iter().map(|l| l.to_string()).collect(),
                kind: "Room".into(),
                ..Default::default()
            },
        );
        self
    }

    pub fn scene(self, id: &str, name: &str, group: u32) -> Self {
        self.state.lock().unwrap().scenes.insert(
            id.to_string(),
            Scene {
                id: id.to_string(),
                name: name.to_string(),
                kind: "GroupScene".into(),
                group: Some(group.to_string()),
                lights: Vec::new(),
            },
        );
        self
    }

    pub fn sensor(self, id: u32, name: &str) -> Self {
        self.state.lock().unwrap().sensors.insert(
            id,
            Sensor {
                id,
                name: name.to_string(),
                kind: "ZLLPresence".into(),
                config: serde_json::json!({"on": true}),
                ..Default::default()
            },
        );
        self
    }

    pub fn into_bridge(self, host: &str) -> (Arc<FakeBridge>, Bridge) {
        let fake = Arc::new(self);
        let info = fake.state.lock().unwrap().info.clone();
        let bridge = Bridge::new(host, "tester", info, fake.clone());
        (fake, bridge)
    }

    /// Fail every call whose log entry starts with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        self.state.lock().unwrap().fail_on = Some(prefix.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn light_state(&self, id: u32) -> LightState {
        self.state.lock().unwrap().lights[&id].state.clone()
    }

    fn record(&self, call: String) -> Result<std::sync::MutexGuard<'_, FakeState>, ApiError> {
        let mut s = self.state.lock().unwrap();
        let fail = s.fail_on.as_ref().is_some_and(|p| call.starts_with(p.as_str()));
        s.calls.push(call.clone());
        if fail {
            return Err(ApiError::Bridge {
                kind: 901,
                address: call,
                description: "internal error".into(),
            });
        }
        Ok(s)
    }

    /// Like `record` for calls that do not touch the fake's state.
    fn note(&self, call: String) -> Result<(), ApiError> {
        self.record(call).map(drop)
    }
}

#[async_trait]
impl HueApi for FakeBridge {
    async fn get_config(&self) -> Result<BridgeInfo, ApiError> {
        Ok(self.record("get_config".into())?.info.clone())
    }

    async fn get_capabilities(&self) -> Result<Value, ApiError> {
        self.note("get_capabilities".into())?;
        Ok(serde_json::json!({"lights": {"available": 50}}))
    }

    async fn create_user(&self, device_type: &str) -> Result<String, ApiError> {
        let mut s = self.record(format!("create_user {}", device_type))?;
        s.username = "0123456789abcdef0123456789abcdef01234567".into();
        Ok(s.username.clone())
    }

    async fn get_lights(&self) -> Result<Vec<Light>, ApiError> {
        Ok(self.record("get_lights".into())?.lights.values().cloned().collect())
    }

    async fn get_light(&self, id: u32) -> Result<Light, ApiError> {
        let s = self.record(format!("get_light {}", id))?;
        s.lights.get(&id).cloned().ok_or_else(|| not_found(format!("/lights/{}", id)))
    }

    async fn get_groups(&self) -> Result<Vec<Group>, ApiError> {
        Ok(self.record("get_groups".into())?.groups.values().cloned().collect())
    }

    async fn get_group(&self, id: u32) -> Result<Group, ApiError> {
        let s = self.record(format!("get_group {}", id))?;
        s.groups.get(&id).cloned().ok_or_else(|| not_found(format!("/groups/{}", id)))
    }

    async fn get_scenes(&self) -> Result<Vec<Scene>, ApiError> {
        Ok(self.record("get_scenes".into())?.scenes.values().cloned().collect())
    }

    async fn get_scene(&self, id: &str) -> Result<Scene, ApiError> {
        let s = self.record(format!("get_scene {}", id))?;
        s.scenes.get(id).cloned().ok_or_else(|| not_found(format!("/scenes/{}", id)))
    }

    async fn get_sensors(&self) -> Result<Vec<Sensor>, ApiError> {
        Ok(self.record("get_sensors".into())?.sensors.values().cloned().collect())
    }

    async fn get_sensor(&self, id: u32) -> Result<Sensor, ApiError> {
        let s = self.record(format!("get_sensor {}", id))?;
        s.sensors.get(&id).cloned().ok_or_else(|| not_found(format!("/sensors/{}", id)))
    }

    async fn get_schedules(&self) -> Result<Vec<Schedule>, ApiError> {
        Ok(self.record("get_schedules".into())?.schedules.values().cloned().collect())
    }

    async fn get_rules(&self) -> Result<Vec<Rule>, ApiError> {
        Ok(self.record("get_rules".into())?.rules.values().cloned().collect())
    }

    async fn set_light_state(&self, id: u32, update: &StateUpdate) -> Result<(), ApiError> {
        let mut s = self.record(format!("set_light_state {}", id))?;
        let light = s
            .lights
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("/lights/{}", id)))?;
        light.state.merge(update);
        Ok(())
    }

    async fn set_group_action(&self, id: u32, update: &StateUpdate) -> Result<(), ApiError> {
        let mut s = self.record(format!("set_group_action {}", id))?;
        if let Some(scene) = &update.scene {
            if !s.scenes.contains_key(scene) {
                return Err(not_found(format!("/scenes/{}", scene)));
            }
        }
        let members = match s.groups.get_mut(&id) {
            Some(group) => {
                group.action.merge(update);
                group.light_ids()
            }
            None if id == 0 => s.lights.keys().copied().collect(),
            None => return Err(not_found(format!("/groups/{}", id))),
        };
        if update.scene.is_none() {
            for light in members {
                if let Some(l) = s.lights.get_mut(&light) {
                    l.state.merge(update);
                }
            }
        }
        Ok(())
    }

    async fn set_sensor_config(&self, id: u32, config: &Value) -> Result<(), ApiError> {
        let mut s = self.record(format!("set_sensor_config {}", id))?;
        let sensor = s
            .sensors
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("/sensors/{}", id)))?;
        sensor.config = config.clone();
        Ok(())
    }

    async fn rename(&self, resource: Resource, id: &str, name: &str) -> Result<(), ApiError> {
        let mut s = self.record(format!("rename {} {} {}", resource.path(), id, name))?;
        let numeric: u32 = id.parse().unwrap_or_default();
        let slot = match resource {
            Resource::Lights => s.lights.get_mut(&numeric).map(|l| &mut l.name),
            Resource::Groups => s.groups.get_mut(&numeric).map(|g| &mut g.name),
            Resource::Sensors => s.sensors.get_mut(&numeric).map(|x| &mut x.name),
            _ => None,
        };
        match slot {
            Some(n) => {
                *n = name.to_string();
                Ok(())
            }
            None => Err(not_found(format!("/{}/{}", resource.path(), id))),
        }
    }

    async fn create_group(&self, group: &NewGroup) -> Result<String, ApiError> {
        let mut s = self.record(format!("create_group {} {}", group.name, group.kind))?;
        let id = s.groups.keys().max().copied().unwrap_or_default() + 1;
        s.groups.insert(
            id,
            Group {
                id,
                name: group.name.clone(),
                lights: group.lights.clone(),
                kind: group.kind.clone(),
                ..Default::default()
            },
        );
        Ok(id.to_string())
    }

    async fn set_group_lights(&self, id: u32, lights: &[String]) -> Result<(), ApiError> {
        let mut s = self.record(format!("set_group_lights {} {}", id, lights.join(",")))?;
        let group = s
            .groups
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("/groups/{}", id)))?;
        group.lights = lights.to_vec();
        Ok(())
    }

    async fn create(&self, resource: Resource, body: &Value) -> Result<String, ApiError> {
        let mut s = self.record(format!("create {}", resource.path()))?;
        let name = body["name"].as_str().unwrap_or_default().to_string();
        let id = match resource {
            Resource::Schedules => {
                let id = s.schedules.keys().max().copied().unwrap_or_default() + 1;
                s.schedules.insert(id, Schedule { id, name, ..Default::default() });
                id
            }
            Resource::Rules => {
                let id = s.rules.keys().max().copied().unwrap_or_default() + 1;
                s.rules.insert(id, Rule { id, name, ..Default::default() });
                id
            }
            Resource::Sensors => {
                let id = s.sensors.keys().max().copied().unwrap_or_default() + 1;
                s.sensors.insert(id, Sensor { id, name, ..Default::default() });
                id
            }
            _ => return Err(ApiError::Unsupported(format!("create {}", resource.path()))),
        };
        Ok(id.to_string())
    }

    async fn delete(&self, resource: Resource, id: &str) -> Result<(), ApiError> {
        let mut s = self.record(format!("delete {} {}", resource.path(), id))?;
        let numeric: u32 = id.parse().unwrap_or_default();
        let removed = match resource {
            Resource::Lights => s.lights.remove(&numeric).is_some(),
            Resource::Groups => s.groups.remove(&numeric).is_some(),
            Resource::Scenes => s.scenes.remove(id).is_some(),
            Resource::Sensors => s.sensors.remove(&numeric).is_some(),
            Resource::Schedules => s.schedules.remove(&numeric).is_some(),
            Resource::Rules => s.rules.remove(&numeric).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(not_found(format!("/{}/{}", resource.path(), id)))
        }
    }

    async fn find_lights(&self) -> Result<(), ApiError> {
        self.note("find_lights".into())?;
        Ok(())
    }

    async fn get_new_lights(&self) -> Result<NewLights, ApiError> {
        let s = self.record("get_new_lights".into())?;
        Ok(NewLights {
            lights: s.new_lights.clone(),
            last_scan: "active".into(),
        })
    }

    async fn update_config(&self, body: &Value) -> Result<(), ApiError> {
        self.note(format!("update_config {}", body))?;
        Ok(())
    }
}
