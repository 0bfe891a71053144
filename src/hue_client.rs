use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::error::ApiError;
use crate::model::{
    BridgeInfo, Group, Light, NewGroup, NewLights, Rule, Scene, Schedule, Sensor, StateUpdate,
};

/// Bridge collections addressable by `/api/<user>/<resource>/<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Lights,
    Groups,
    Scenes,
    Sensors,
    Schedules,
    Rules,
}

impl Resource {
    pub fn path(self) -> &'static str {
        match self {
            Resource::Lights => "lights",
            Resource::Groups => "groups",
            Resource::Scenes => "scenes",
            Resource::Sensors => "sensors",
            Resource::Schedules => "schedules",
            Resource::Rules => "rules",
        }
    }
}

/// The bridge operations the shell needs. Implemented over HTTP by
/// [`HueClient`]; tests substitute an in-memory bridge.
#[async_trait]
pub trait HueApi: Send + Sync {
    async fn get_config(&self) -> Result<BridgeInfo, ApiError>;
    async fn get_capabilities(&self) -> Result<Value, ApiError>;
    /// `POST /api` with a device type. Requires the link button to have been pressed.
    async fn create_user(&self, device_type: &str) -> Result<String, ApiError>;

    async fn get_lights(&self) -> Result<Vec<Light>, ApiError>;
    async fn get_light(&self, id: u32) -> Result<Light, ApiError>;
    async fn get_groups(&self) -> Result<Vec<Group>, ApiError>;
    async fn get_group(&self, id: u32) -> Result<Group, ApiError>;
    async fn get_scenes(&self) -> Result<Vec<Scene>, ApiError>;
    async fn get_scene(&self, id: &str) -> Result<Scene, ApiError>;
    async fn get_sensors(&self) -> Result<Vec<Sensor>, ApiError>;
    async fn get_sensor(&self, id: u32) -> Result<Sensor, ApiError>;
    async fn get_schedules(&self) -> Result<Vec<Schedule>, ApiError>;
    async fn get_rules(&self) -> Result<Vec<Rule>, ApiError>;

    async fn set_light_state(&self, id: u32, update: &StateUpdate) -> Result<(), ApiError>;
    async fn set_group_action(&self, id: u32, update: &StateUpdate) -> Result<(), ApiError>;
    async fn set_sensor_config(&self, id: u32, config: &Value) -> Result<(), ApiError>;

    async fn rename(&self, resource: Resource, id: &str, name: &str) -> Result<(), ApiError>;
    async fn create_group(&self, group: &NewGroup) -> Result<String, ApiError>;
    async fn set_group_lights(&self, id: u32, lights: &[String]) -> Result<(), ApiError>;
    async fn create(&self, resource: Resource, body: &Value) -> Result<String, ApiError>;
    async fn delete(&self, resource: Resource, id: &str) -> Result<(), ApiError>;

    async fn find_lights(&self) -> Result<(), ApiError>;
    async fn get_new_lights(&self) -> Result<NewLights, ApiError>;
    async fn update_config(&self, body: &Value) -> Result<(), ApiError>;
}

/// HTTP client for one bridge and one username.
#[derive(Debug, Clone)]
pub struct HueClient {
    http: reqwest::Client,
    base: String,
    username: String,
}

impl HueClient {
    /// `host` may carry a port. `proxy` is a `socks5://` URL.
    pub fn new(
        host: &str,
        username: &str,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            base: format!("http://{}/api", host),
            username: username.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base, self.username, path)
    }

    async fn get_value(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path);
        trace!("GET {}", url);
        let value: Value = self.http.get(&url).send().await?.json().await?;
        check(value)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let value = self.get_value(path).await?;
        serde_json::from_value(value).map_err(|e| ApiError::UnexpectedResponse(e.to_string()))
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        url: String,
        body: Option<&B>,
    ) -> Result<Value, ApiError> {
        trace!("{} {}", method, url);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let value: Value = request.send().await?.json().await?;
        check(value)
    }

    async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        self.send(reqwest::Method::PUT, self.url(path), Some(body))
            .await
            .map(|_| ())
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<String, ApiError> {
        let value = self
            .send(reqwest::Method::POST, self.url(path), Some(body))
            .await?;
        success_field(&value, "id")
    }

    async fn collection<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<(String, T)>, ApiError> {
        let value = self.get_value(path).await?;
        entries(value)
    }
}

/// Hue reports failures as `[{"error": {...}}]` with HTTP 200.
fn check(value: Value) -> Result<Value, ApiError> {
    if let Some(items) = value.as_array() {
        for item in items {
            if let Some(err) = item.get("error") {
                return Err(ApiError::Bridge {
                    kind: err["type"].as_u64().unwrap_or_default() as u32,
                    address: err["address"].as_str().unwrap_or_default().to_string(),
                    description: err["description"]
                        .as_str()
                        .unwrap_or("unknown error")
                        .to_string(),
                });
            }
        }
    }
    Ok(value)
}

fn success_field(value: &Value, field: &str) -> Result<String, ApiError> {
    value
        .as_array()
        .and_then(|items| items.iter().find_map(|i| i.get("success")))
        .and_then(|s| s.get(field))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ApiError::UnexpectedResponse(format!("missing success.{}", field)))
}

/// Decode an id-keyed object into entries sorted by id (numerically where possible).
fn entries<T: DeserializeOwned>(value: Value) -> Result<Vec<(String, T)>, ApiError> {
    let Value::Object(map) = value else {
        return Err(ApiError::UnexpectedResponse("expected an object".into()));
    };
    let mut out = Vec::with_capacity(map.len());
    for (id, entry) in map {
        let item = serde_json::from_value(entry)
            .map_err(|e| ApiError::UnexpectedResponse(format!("{}: {}", id, e)))?;
        out.push((id, item));
    }
    out.sort_by(|(a, _), (b, _)| match (a.parse::<u32>(), b.parse::<u32>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    });
    Ok(out)
}

fn numeric_entries<T: DeserializeOwned>(
    value: Vec<(String, T)>,
    mut set_id: impl FnMut(&mut T, u32),
) -> Vec<T> {
    value
        .into_iter()
        .filter_map(|(id, mut item)| {
            let id = id.parse().ok()?;
            set_id(&mut item, id);
            Some(item)
        })
        .collect()
}

#[async_trait]
impl HueApi for HueClient {
    async fn get_config(&self) -> Result<BridgeInfo, ApiError> {
        self.get_json("config").await
    }

    async fn get_capabilities(&self) -> Result<Value, ApiError> {
        self.get_value("capabilities").await
    }

    async fn create_user(&self, device_type: &str) -> Result<String, ApiError> {
        let body = serde_json::json!({ "devicetype": device_type });
        let value = self
            .send(reqwest::Method::POST, self.base.clone(), Some(&body))
            .await?;
        success_field(&value, "username")
    }

    async fn get_lights(&self) -> Result<Vec<Light>, ApiError> {
        let lights = self.collection("lights").await?;
        Ok(numeric_entries(lights, |l: &mut Light, id| l.id = id))
    }

    async fn get_light(&self, id: u32) -> Result<Light, ApiError> {
        let mut light: Light = self.get_json(&format!("lights/{}", id)).await?;
        light.id = id;
        Ok(light)
    }

    async fn get_groups(&self) -> Result<Vec<Group>, ApiError> {
        let groups = self.collection("groups").await?;
        Ok(numeric_entries(groups, |g: &mut Group, id| g.id = id))
    }

    async fn get_group(&self, id: u32) -> Result<Group, ApiError> {
        let mut group: Group = self.get_json(&format!("groups/{}", id)).await?;
        group.id = id;
        Ok(group)
    }

    async fn get_scenes(&self) -> Result<Vec<Scene>, ApiError> {
        let scenes: Vec<(String, Scene)> = self.collection("scenes").await?;
        Ok(scenes
            .into_iter()
            .map(|(id, mut scene)| {
                scene.id = id;
                scene
            })
            .collect())
    }

    async fn get_scene(&self, id: &str) -> Result<Scene, ApiError> {
        let mut scene: Scene = self.get_json(&format!("scenes/{}", id)).await?;
        scene.id = id.to_string();
        Ok(scene)
    }

    async fn get_sensors(&self) -> Result<Vec<Sensor>, ApiError> {
        let sensors = self.collection("sensors").await?;
        Ok(numeric_entries(sensors, |s: &mut Sensor, id| s.id = id))
    }

    async fn get_sensor(&self, id: u32) -> Result<Sensor, ApiError> {
        let mut sensor: Sensor = self.get_json(&format!("sensors/{}", id)).await?;
        sensor.id = id;
        Ok(sensor)
    }

    async fn get_schedules(&self) -> Result<Vec<Schedule>, ApiError> {
        let schedules = self.collection("schedules").await?;
        Ok(numeric_entries(schedules, |s: &mut Schedule, id| s.id = id))
    }

    async fn get_rules(&self) -> Result<Vec<Rule>, ApiError> {
        let rules = self.collection("rules").await?;
        Ok(numeric_entries(rules, |r: &mut Rule, id| r.id = id))
    }

    async fn set_light_state(&self, id: u32, update: &StateUpdate) -> Result<(), ApiError> {
        self.put(&format!("lights/{}/state", id), update).await
    }

    async fn set_group_action(&self, id: u32, update: &StateUpdate) -> Result<(), ApiError> {
        self.put(&format!("groups/{}/action", id), update).await
    }

    async fn set_sensor_config(&self, id: u32, config: &Value) -> Result<(), ApiError> {
        self.put(&format!("sensors/{}/config", id), config).await
    }

    async fn rename(&self, resource: Resource, id: &str, name: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({ "name": name });
        self.put(&format!("{}/{}", resource.path(), id), &body).await
    }

    async fn create_group(&self, group: &NewGroup) -> Result<String, ApiError> {
        self.post("groups", group).await
    }

    async fn set_group_lights(&self, id: u32, lights: &[String]) -> Result<(), ApiError> {
        let body = serde_json::json!({ "lights": lights });
        self.put(&format!("groups/{}", id), &body).await
    }

    async fn create(&self, resource: Resource, body: &Value) -> Result<String, ApiError> {
        self.post(resource.path(), body).await
    }

    async fn delete(&self, resource: Resource, id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("{}/{}", resource.path(), id));
        self.send::<Value>(reqwest::Method::DELETE, url, None)
            .await
            .map(|_| ())
    }

    async fn find_lights(&self) -> Result<(), ApiError> {
        let value = self
            .send(reqwest::Method::POST, self.url("lights"), Some(&serde_json::json!({})))
            .await?;
        trace!("search started: {}", value);
        Ok(())
    }

    async fn get_new_lights(&self) -> Result<NewLights, ApiError> {
        let value = self.get_value("lights/new").await?;
        Ok(NewLights::from_value(&value))
    }

    async fn update_config(&self, body: &Value) -> Result<(), ApiError> {
        self.put("config", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HueClient {
        let host = server.address().to_string();
        HueClient::new(&host, "tester", None, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn lists_lights_sorted_with_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tester/lights"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "10": {"name": "Porch", "state": {"on": false}},
                "2": {"name": "Desk", "state": {"on": true, "bri": 200}}
            })))
            .mount(&server)
            .await;

        let lights = client(&server).get_lights().await.unwrap();
        assert_eq!(lights.len(), 2);
        assert_eq!((lights[0].id, lights[0].name.as_str()), (2, "Desk"));
        assert_eq!((lights[1].id, lights[1].name.as_str()), (10, "Porch"));
        assert_eq!(lights[0].state.bri, 200);
    }

    #[tokio::test]
    async fn bridge_error_array_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tester/lights/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"error": {"type": 3, "address": "/lights/9", "description": "resource, /lights/9, not available"}}
            ])))
            .mount(&server)
            .await;

        let err = client(&server).get_light(9).await.unwrap_err();
        match err {
            ApiError::Bridge { kind, address, .. } => {
                assert_eq!(kind, 3);
                assert_eq!(address, "/lights/9");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn create_user_returns_username() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .and(body_json(serde_json::json!({"devicetype": "huesh#test"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"success": {"username": "abcdef0123456789abcdef0123456789abcdef01"}}
            ])))
            .mount(&server)
            .await;

        let username = client(&server).create_user("huesh#test").await.unwrap();
        assert_eq!(username, "abcdef0123456789abcdef0123456789abcdef01");
    }

    #[tokio::test]
    async fn set_light_state_sends_only_set_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/tester/lights/4/state"))
            .and(body_json(serde_json::json!({"on": true, "bri": 42})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"success": {"/lights/4/state/on": true}},
                {"success": {"/lights/4/state/bri": 42}}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let update = StateUpdate {
            on: Some(true),
            bri: Some(42),
            ..Default::default()
        };
        client(&server).set_light_state(4, &update).await.unwrap();
    }

    #[tokio::test]
    async fn create_group_returns_new_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tester/groups"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"success": {"id": "7"}}])),
            )
            .mount(&server)
            .await;

        let group = NewGroup {
            name: "Office".into(),
            lights: vec!["1".into(), "2".into()],
            kind: "LightGroup".into(),
            class: None,
        };
        assert_eq!(client(&server).create_group(&group).await.unwrap(), "7");
    }
}
