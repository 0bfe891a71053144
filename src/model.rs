//! Wire types for the Hue bridge REST API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Light state as reported by the bridge (`state` on lights, `action` on groups).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightState {
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub bri: u8,
    #[serde(default)]
    pub hue: u16,
    #[serde(default)]
    pub sat: u8,
    #[serde(default)]
    pub ct: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xy: Option<[f32; 2]>,
    #[serde(default)]
    pub effect: String,
    #[serde(default)]
    pub alert: String,
    #[serde(default)]
    pub colormode: String,
    #[serde(default)]
    pub reachable: bool,
}

impl LightState {
    /// Overlay the fields an update sets.
    pub fn merge(&mut self, update: &StateUpdate) {
        if let Some(on) = update.on {
            self.on = on;
        }
        if let Some(bri) = update.bri {
            self.bri = bri;
        }
        if let Some(hue) = update.hue {
            self.hue = hue;
        }
        if let Some(sat) = update.sat {
            self.sat = sat;
        }
        if let Some(ct) = update.ct {
            self.ct = ct;
        }
        if update.xy.is_some() {
            self.xy = update.xy;
        }
        if let Some(effect) = &update.effect {
            self.effect = effect.clone();
        }
        if let Some(alert) = &update.alert {
            self.alert = alert.clone();
        }
    }
}

/// Body for `PUT .../state` and `PUT .../action`. Only set fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bri: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hue: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sat: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ct: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xy: Option<[f32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transitiontime: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Light {
    #[serde(skip)]
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub modelid: String,
    #[serde(default)]
    pub productname: String,
    #[serde(default)]
    pub uniqueid: String,
    #[serde(default)]
    pub state: LightState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupState {
    #[serde(default)]
    pub all_on: bool,
    #[serde(default)]
    pub any_on: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    #[serde(skip)]
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lights: Vec<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub action: LightState,
    #[serde(default)]
    pub state: GroupState,
}

impl Group {
    pub fn light_ids(&self) -> Vec<u32> {
        self.lights.iter().filter_map(|id| id.parse().ok()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub lights: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sensor {
    #[serde(skip)]
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub modelid: String,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(skip)]
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub command: Value,
    #[serde(default)]
    pub localtime: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    #[serde(skip)]
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conditions: Value,
    #[serde(default)]
    pub actions: Value,
}

/// `GET /api/<user>/config`. Unauthenticated callers get the short form,
/// so everything is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bridgeid: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ipaddress: String,
    #[serde(default)]
    pub zigbeechannel: u8,
    #[serde(default)]
    pub swversion: String,
    #[serde(default)]
    pub apiversion: String,
    #[serde(default)]
    pub modelid: String,
    #[serde(default)]
    pub linkbutton: bool,
}

/// Body for `POST /groups`.
#[derive(Debug, Clone, Serialize)]
pub struct NewGroup {
    pub name: String,
    pub lights: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// Result of `GET /lights/new`.
#[derive(Debug, Clone, Default)]
pub struct NewLights {
    pub lights: Vec<(u32, String)>,
    pub last_scan: String,
}

impl NewLights {
    pub fn from_value(value: &Value) -> Self {
        let mut out = NewLights::default();
        if let Some(map) = value.as_object() {
            for (key, entry) in map {
                if key == "lastscan" {
                    out.last_scan = entry.as_str().unwrap_or_default().to_string();
                    continue;
                }
                if let Ok(id) = key.parse() {
                    let name = entry["name"].as_str().unwrap_or_default().to_string();
                    out.lights.push((id, name));
                }
            }
        }
        out.lights.sort_by_key(|(id, _)| *id);
        out
    }
}
