use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use indexmap::IndexMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::RegistryConfig;
use crate::entity::{display_name, EntityKind, GroupHandle, LightHandle, SceneHandle, SensorHandle};
use crate::error::ApiError;

/// Display name to entity, across every registered bridge.
pub type NameMap<T> = IndexMap<String, T>;

/// An entity kind the registry can aggregate.
#[async_trait]
pub trait Fetch: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// List the bridge's entities, then fetch each one by id.
    async fn fetch(bridge: &Arc<Bridge>) -> Result<Vec<Self>, ApiError>;

    fn name(&self) -> &str;

    fn bridge(&self) -> &Arc<Bridge>;
}

#[async_trait]
impl Fetch for LightHandle {
    const KIND: EntityKind = EntityKind::Light;

    async fn fetch(bridge: &Arc<Bridge>) -> Result<Vec<Self>, ApiError> {
        let listed = bridge.api().get_lights().await?;
        let mut out = Vec::with_capacity(listed.len());
        for item in listed {
            match bridge.api().get_light(item.id).await {
                Ok(light) => out.push(LightHandle {
                    bridge: bridge.clone(),
                    light,
                }),
                Err(e) => warn!("Failed to get light {} on {}: {}", item.id, bridge.id(), e),
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.light.name
    }

    fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}

#[async_trait]
impl Fetch for GroupHandle {
    const KIND: EntityKind = EntityKind::Group;

    async fn fetch(bridge: &Arc<Bridge>) -> Result<Vec<Self>, ApiError> {
        let listed = bridge.api().get_groups().await?;
        let mut out = Vec::with_capacity(listed.len());
        for item in listed {
            match bridge.api().get_group(item.id).await {
                Ok(group) => out.push(GroupHandle {
                    bridge: bridge.clone(),
                    group,
                }),
                Err(e) => warn!("Failed to get group {} on {}: {}", item.id, bridge.id(), e),
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.group.name
    }

    fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}

#[async_trait]
impl Fetch for SceneHandle {
    const KIND: EntityKind = EntityKind::Scene;

    async fn fetch(bridge: &Arc<Bridge>) -> Result<Vec<Self>, ApiError> {
        let listed = bridge.api().get_scenes().await?;
        let mut out = Vec::with_capacity(listed.len());
        for item in listed {
            match bridge.api().get_scene(&item.id).await {
                Ok(scene) => out.push(SceneHandle {
                    bridge: bridge.clone(),
                    scene,
                }),
                Err(e) => warn!("Failed to get scene {} on {}: {}", item.id, bridge.id(), e),
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.scene.name
    }

    fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}

#[async_trait]
impl Fetch for SensorHandle {
    const KIND: EntityKind = EntityKind::Sensor;

    async fn fetch(bridge: &Arc<Bridge>) -> Result<Vec<Self>, ApiError> {
        let listed = bridge.api().get_sensors().await?;
        let mut out = Vec::with_capacity(listed.len());
        for item in listed {
            match bridge.api().get_sensor(item.id).await {
                Ok(sensor) => out.push(SensorHandle {
                    bridge: bridge.clone(),
                    sensor,
                }),
                Err(e) => warn!("Failed to get sensor {} on {}: {}", item.id, bridge.id(), e),
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.sensor.name
    }

    fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}

struct Cached<T> {
    map: Arc<NameMap<T>>,
    generation: u64,
    uses_left: u32,
    built_at: Instant,
}

/// One kind's map. The mutex is held for the whole rebuild so concurrent
/// refreshes collapse into one; readers get an immutable snapshot.
struct KindCache<T> {
    slot: Mutex<Option<Cached<T>>>,
}

impl<T> KindCache<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

/// Every known bridge and the aggregated per-kind name maps.
pub struct Registry {
    bridges: RwLock<IndexMap<String, Arc<Bridge>>>,
    generation: AtomicU64,
    reuse: u32,
    ttl: Option<Duration>,
    lights: KindCache<LightHandle>,
    groups: KindCache<GroupHandle>,
    scenes: KindCache<SceneHandle>,
    sensors: KindCache<SensorHandle>,
}

impl Registry {
    pub fn new(settings: &RegistryConfig) -> Self {
        Self::with_policy(settings.reuse, settings.ttl())
    }

    pub fn with_policy(reuse: u32, ttl: Option<Duration>) -> Self {
        Self {
            bridges: RwLock::new(IndexMap::new()),
            generation: AtomicU64::new(0),
            reuse,
            ttl,
            lights: KindCache::new(),
            groups: KindCache::new(),
            scenes: KindCache::new(),
            sensors: KindCache::new(),
        }
    }

    /// Register a bridge. A bridge id seen before keeps its first registration.
    pub async fn add_bridge(&self, bridge: Bridge) -> Arc<Bridge> {
        let mut bridges = self.bridges.write().await;
        if let Some(existing) = bridges.get(bridge.id()) {
            warn!(
                "Bridge {} already registered at {}, ignoring {}",
                bridge.id(),
                existing.host,
                bridge.host
            );
            return existing.clone();
        }
        let bridge = Arc::new(bridge);
        info!("Registered bridge {} at {}", bridge.id(), bridge.host);
        bridges.insert(bridge.id().to_string(), bridge.clone());
        drop(bridges);
        self.invalidate();
        bridge
    }

    pub async fn bridges(&self) -> Vec<Arc<Bridge>> {
        self.bridges.read().await.values().cloned().collect()
    }

    pub async fn bridge_count(&self) -> usize {
        self.bridges.read().await.len()
    }

    /// Find a bridge by id, host or name.
    pub async fn bridge(&self, token: &str) -> Option<Arc<Bridge>> {
        self.bridges
            .read()
            .await
            .values()
            .find(|b| b.matches(token))
            .cloned()
    }

    /// Force every map to be rebuilt on its next access.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub async fn light_map(&self) -> Arc<NameMap<LightHandle>> {
        self.get(&self.lights).await
    }

    pub async fn group_map(&self) -> Arc<NameMap<GroupHandle>> {
        self.get(&self.groups).await
    }

    pub async fn scene_map(&self) -> Arc<NameMap<SceneHandle>> {
        self.get(&self.scenes).await
    }

    pub async fn sensor_map(&self) -> Arc<NameMap<SensorHandle>> {
        self.get(&self.sensors).await
    }

    /// Invalidate and rebuild every map. Returns (lights, groups, scenes, sensors).
    pub async fn refresh_all(&self) -> (usize, usize, usize, usize) {
        self.invalidate();
        let lights = self.light_map().await.len();
        let groups = self.group_map().await.len();
        let scenes = self.scene_map().await.len();
        let sensors = self.sensor_map().await.len();
        (lights, groups, scenes, sensors)
    }

    async fn get<T: Fetch>(&self, cache: &KindCache<T>) -> Arc<NameMap<T>> {
        let mut slot = cache.slot.lock().await;
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(cached) = slot.as_mut() {
            let expired = self
                .ttl
                .is_some_and(|ttl| cached.built_at.elapsed() >= ttl);
            if cached.generation == generation && cached.uses_left > 0 && !expired {
                cached.uses_left -= 1;
                return cached.map.clone();
            }
        }

        debug!("Refreshing {} map", T::KIND);
        let map = Arc::new(self.build::<T>().await);
        *slot = Some(Cached {
            map: map.clone(),
            generation,
            uses_left: self.reuse,
            built_at: Instant::now(),
        });
        map
    }

    async fn build<T: Fetch>(&self) -> NameMap<T> {
        let bridges = self.bridges().await;
        let fetched = join_all(bridges.iter().map(|b| T::fetch(b))).await;

        let mut map = NameMap::new();
        for (bridge, result) in bridges.iter().zip(fetched) {
            match result {
                Ok(items) => {
                    for item in items {
                        insert_unique(&mut map, display_name(item.name()), item, T::KIND);
                    }
                }
                Err(e) => warn!("Failed to list {}s on {}: {}", T::KIND, bridge.id(), e),
            }
        }
        map
    }
}

/// Insert under `base`, or the first free `base_N` (N >= 2) if taken.
fn insert_unique<T>(map: &mut NameMap<T>, base: String, item: T, kind: EntityKind) -> String {
    if !map.contains_key(&base) {
        map.insert(base.clone(), item);
        return base;
    }
    let mut n = 2;
    loop {
        let key = format!("{}_{}", base, n);
        if !map.contains_key(&key) {
            warn!("Duplicate {} name {}, registering as {}", kind, base, key);
            map.insert(key.clone(), item);
            return key;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBridge;

    async fn registry_with(fakes: Vec<(FakeBridge, &str)>, reuse: u32) -> (Registry, Vec<Arc<FakeBridge>>) {
        let registry = Registry::with_policy(reuse, None);
        let mut handles = Vec::new();
        for (fake, host) in fakes {
            let (fake, bridge) = fake.into_bridge(host);
            registry.add_bridge(bridge).await;
            handles.push(fake);
        }
        (registry, handles)
    }

    #[tokio::test]
    async fn duplicate_names_get_suffixed_per_bridge() {
        let a = FakeBridge::new("AAAA").group(1, "Kitchen", &[1]);
        let b = FakeBridge::new("BBBB").group(4, "Kitchen", &[2]);
        let (registry, _) = registry_with(vec![(a, "10.0.0.1"), (b, "10.0.0.2")], 10).await;

        let groups = registry.group_map().await;
        let keys: Vec<&str> = groups.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["Kitchen", "Kitchen_2"]);
        assert_eq!(groups["Kitchen"].bridge.id(), "AAAA");
        assert_eq!(groups["Kitchen"].group.id, 1);
        assert_eq!(groups["Kitchen_2"].bridge.id(), "BBBB");
        assert_eq!(groups["Kitchen_2"].group.id, 4);
    }

    #[tokio::test]
    async fn names_with_spaces_use_underscores() {
        let a = FakeBridge::new("AAAA").light(1, "Living room", 10);
        let (registry, _) = registry_with(vec![(a, "10.0.0.1")], 10).await;
        assert!(registry.light_map().await.contains_key("Living_room"));
    }

    #[tokio::test]
    async fn lists_then_gets_each_entity() {
        let a = FakeBridge::new("AAAA").light(1, "Desk", 10).light(2, "Porch", 20);
        let (registry, fakes) = registry_with(vec![(a, "10.0.0.1")], 10).await;

        let lights = registry.light_map().await;
        assert_eq!(lights.len(), 2);
        assert_eq!(
            fakes[0].calls(),
            vec!["get_lights", "get_light 1", "get_light 2"]
        );
    }

    #[tokio::test]
    async fn failed_get_skips_entity() {
        let a = FakeBridge::new("AAAA").light(1, "Desk", 10).light(2, "Porch", 20);
        let (registry, fakes) = registry_with(vec![(a, "10.0.0.1")], 10).await;
        fakes[0].fail_on("get_light 2");

        let lights = registry.light_map().await;
        assert!(lights.contains_key("Desk"));
        assert!(!lights.contains_key("Porch"));
    }

    #[tokio::test]
    async fn reuse_countdown_then_refresh() {
        let a = FakeBridge::new("AAAA").light(1, "Desk", 10);
        let (registry, fakes) = registry_with(vec![(a, "10.0.0.1")], 2).await;

        for _ in 0..3 {
            registry.light_map().await;
        }
        assert_eq!(fakes[0].count_calls("get_lights"), 1);
        registry.light_map().await;
        assert_eq!(fakes[0].count_calls("get_lights"), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let a = FakeBridge::new("AAAA").light(1, "Desk", 10);
        let (registry, fakes) = registry_with(vec![(a, "10.0.0.1")], 10).await;

        registry.light_map().await;
        registry.light_map().await;
        assert_eq!(fakes[0].count_calls("get_lights"), 1);
        registry.invalidate();
        registry.light_map().await;
        assert_eq!(fakes[0].count_calls("get_lights"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_maps() {
        let (fake, bridge) = FakeBridge::new("AAAA").light(1, "Desk", 10).into_bridge("10.0.0.1");
        let registry = Registry::with_policy(100, Some(Duration::from_secs(30)));
        registry.add_bridge(bridge).await;

        registry.light_map().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        registry.light_map().await;
        assert_eq!(fake.count_calls("get_lights"), 1);
        tokio::time::advance(Duration::from_secs(30)).await;
        registry.light_map().await;
        assert_eq!(fake.count_calls("get_lights"), 2);
    }

    #[tokio::test]
    async fn concurrent_refreshes_are_serialized() {
        let a = FakeBridge::new("AAAA").light(1, "Desk", 10);
        let (registry, fakes) = registry_with(vec![(a, "10.0.0.1")], 10).await;
        let registry = Arc::new(registry);

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.light_map().await.len() })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
        assert_eq!(fakes[0].count_calls("get_lights"), 1);
    }

    #[tokio::test]
    async fn duplicate_bridge_ids_keep_first() {
        let (_, first) = FakeBridge::new("AAAA").into_bridge("10.0.0.1");
        let (_, second) = FakeBridge::new("AAAA").into_bridge("10.0.0.9");
        let registry = Registry::with_policy(10, None);
        registry.add_bridge(first).await;
        let kept = registry.add_bridge(second).await;
        assert_eq!(kept.host, "10.0.0.1");
        assert_eq!(registry.bridge_count().await, 1);
        assert!(registry.bridge("10.0.0.1").await.is_some());
    }
}
