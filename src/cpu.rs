use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::color::{Gradient, Rgb};
use crate::entity::Target;
use crate::error::ApiError;
use crate::model::StateUpdate;

/// Hue value for an idle core (blue). Full load maps to 0 (red).
const IDLE_HUE: f32 = 46920.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// Whole target follows total load through the load gradient.
    Gradient,
    /// Each member light follows one core's load as a hue.
    PerCore,
}

/// CPU utilisation in percent.
pub trait LoadSource: Send + 'static {
    fn total(&mut self) -> f32;
    fn per_core(&mut self) -> Vec<f32>;
}

pub struct SystemLoad {
    system: sysinfo::System,
}

impl SystemLoad {
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_cpu();
        Self { system }
    }
}

impl Default for SystemLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSource for SystemLoad {
    fn total(&mut self) -> f32 {
        self.system.refresh_cpu();
        self.system.global_cpu_info().cpu_usage()
    }

    fn per_core(&mut self) -> Vec<f32> {
        self.system.refresh_cpu();
        self.system.cpus().iter().map(|c| c.cpu_usage()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Started,
    Stopped,
}

struct Running {
    label: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the single CPU visualization task. Toggling starts it when idle
/// and stops it when running.
pub struct CpuVisualizer {
    running: Mutex<Option<Running>>,
    interval: Duration,
    backoff: Duration,
}

impl CpuVisualizer {
    pub fn new(interval: Duration) -> Self {
        Self {
            running: Mutex::new(None),
            interval,
            backoff: Duration::from_secs(3),
        }
    }

    pub fn toggle(
        &self,
        mode: CpuMode,
        target: Box<dyn Target>,
        source: Box<dyn LoadSource>,
    ) -> Toggle {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = running.take() {
            if !task.handle.is_finished() {
                task.cancel.cancel();
                info!("Stopped CPU visualization on {}", task.label);
                return Toggle::Stopped;
            }
        }

        let label = target.label();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            mode,
            target,
            source,
            self.interval,
            self.backoff,
            cancel.clone(),
        ));
        info!("Started {:?} CPU visualization on {}", mode, label);
        *running = Some(Running {
            label,
            cancel,
            handle,
        });
        Toggle::Started
    }

    /// Stop the task if one is running. Returns whether anything was stopped.
    pub fn stop(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.take() {
            Some(task) if !task.handle.is_finished() => {
                task.cancel.cancel();
                info!("Stopped CPU visualization on {}", task.label);
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.as_ref().is_some_and(|t| !t.handle.is_finished())
    }
}

/// Map a core's load onto the hue wheel, blue when idle and red when busy.
pub fn core_hue(load: f32) -> u16 {
    let busy = load.clamp(0.0, 100.0) / 100.0;
    (IDLE_HUE * (1.0 - busy)).round() as u16
}

async fn run(
    mode: CpuMode,
    target: Box<dyn Target>,
    mut source: Box<dyn LoadSource>,
    interval: Duration,
    backoff: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let gradient = Gradient::load();
    let mut last_color: Option<Rgb> = None;
    let mut last_hues: HashMap<u32, u16> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = match mode {
            CpuMode::Gradient => {
                push_gradient(target.as_ref(), source.total(), &gradient, &mut last_color).await
            }
            CpuMode::PerCore => {
                let lights = target.member_lights();
                if lights.is_empty() {
                    warn!("{} has no lights to visualize", target.label());
                    break;
                }
                push_per_core(target.as_ref(), &lights, &source.per_core(), &mut last_hues).await
            }
        };

        if let Err(e) = result {
            warn!("CPU visualization update failed: {}, backing off {:?}", e, backoff);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
    debug!("CPU visualization task for {} exited", target.label());
}

async fn push_gradient(
    target: &dyn Target,
    load: f32,
    gradient: &Gradient,
    last: &mut Option<Rgb>,
) -> Result<(), ApiError> {
    let color = gradient.at(load.round() / 100.0);
    if *last == Some(color) {
        return Ok(());
    }
    let (xy, bri) = color.to_xy_bri();
    let update = StateUpdate {
        on: Some(true),
        xy: Some(xy),
        bri: Some(bri.max(1)),
        ..Default::default()
    };
    target.apply(&update).await?;
    *last = Some(color);
    Ok(())
}

async fn push_per_core(
    target: &dyn Target,
    lights: &[u32],
    loads: &[f32],
    last: &mut HashMap<u32, u16>,
) -> Result<(), ApiError> {
    if loads.is_empty() {
        return Ok(());
    }
    for (i, light) in lights.iter().enumerate() {
        let hue = core_hue(loads[i % loads.len()]);
        if last.get(light) == Some(&hue) {
            continue;
        }
        let update = StateUpdate {
            on: Some(true),
            hue: Some(hue),
            sat: Some(254),
            ..Default::default()
        };
        target.bridge().api().set_light_state(*light, &update).await?;
        last.insert(*light, hue);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{GroupHandle, LightHandle};
    use crate::testing::FakeBridge;
    use std::sync::Arc;

    struct FixedLoad(Vec<f32>);

    impl LoadSource for FixedLoad {
        fn total(&mut self) -> f32 {
            self.0.iter().sum::<f32>() / self.0.len() as f32
        }

        fn per_core(&mut self) -> Vec<f32> {
            self.0.clone()
        }
    }

    fn light_target(fake: FakeBridge) -> (Arc<FakeBridge>, Box<dyn Target>) {
        let (fake, bridge) = fake.into_bridge("10.0.0.1");
        let bridge = Arc::new(bridge);
        let light = fake.state.lock().unwrap().lights[&1].clone();
        (fake, Box::new(LightHandle { bridge, light }))
    }

    #[test]
    fn core_hue_runs_blue_to_red() {
        assert_eq!(core_hue(0.0), 46920);
        assert_eq!(core_hue(100.0), 0);
        assert_eq!(core_hue(250.0), 0);
        assert_eq!(core_hue(50.0), 23460);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_starts_then_stops() {
        let (fake, target) = light_target(FakeBridge::new("AAAA").light(1, "Desk", 100));
        let cpu = CpuVisualizer::new(Duration::from_millis(750));

        assert_eq!(
            cpu.toggle(CpuMode::Gradient, target, Box::new(FixedLoad(vec![10.0]))),
            Toggle::Started
        );
        assert!(cpu.is_running());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fake.count_calls("set_light_state 1"), 1);

        let (_, other) = light_target(FakeBridge::new("BBBB").light(1, "Lamp", 1));
        assert_eq!(
            cpu.toggle(CpuMode::Gradient, other, Box::new(FixedLoad(vec![10.0]))),
            Toggle::Stopped
        );
        assert!(!cpu.is_running());
        assert!(!cpu.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_push_backs_off() {
        let (fake, target) = light_target(FakeBridge::new("AAAA").light(1, "Desk", 100));
        fake.fail_on("set_light_state");
        let cpu = CpuVisualizer::new(Duration::from_millis(750));
        cpu.toggle(CpuMode::Gradient, target, Box::new(FixedLoad(vec![90.0])));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fake.count_calls("set_light_state"), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fake.count_calls("set_light_state"), 2);
        assert!(cpu.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn per_core_assigns_hues_to_member_lights() {
        let (fake, bridge) = FakeBridge::new("AAAA")
            .light(1, "Left", 100)
            .light(2, "Right", 100)
            .group(3, "Desk", &[1, 2])
            .into_bridge("10.0.0.1");
        let bridge = Arc::new(bridge);
        let group = fake.state.lock().unwrap().groups[&3].clone();
        let target = Box::new(GroupHandle { bridge, group });

        let cpu = CpuVisualizer::new(Duration::from_millis(750));
        cpu.toggle(CpuMode::PerCore, target, Box::new(FixedLoad(vec![0.0, 100.0])));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cpu.stop();

        assert_eq!(fake.light_state(1).hue, 46920);
        assert_eq!(fake.light_state(2).hue, 0);
        assert_eq!(fake.count_calls("set_light_state"), 2);
    }
}
