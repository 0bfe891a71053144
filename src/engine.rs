use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::actions::{self, Action};
use crate::bridge::Bridge;
use crate::cpu::{CpuMode, CpuVisualizer, SystemLoad, Toggle};
use crate::entity::{EntityKind, GroupHandle, Target};
use crate::error::{ApiError, CommandError, ResolveError};
use crate::model::StateUpdate;
use crate::registry::Registry;
use crate::resolver::{Resolver, Scope};

/// An action bound to the target that was active when it was parsed.
#[derive(Debug)]
pub struct Pending {
    pub slot: usize,
    pub action: Action,
}

/// A parsed `set` line, ready to run.
pub struct Plan {
    pub targets: Vec<Box<dyn Target>>,
    pub actions: Vec<Pending>,
    pub cpu: Option<(usize, CpuMode)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub applied: usize,
    pub cpu: Option<Toggle>,
}

fn value<'t>(tokens: &mut impl Iterator<Item = &'t str>, param: &'static str) -> Result<&'t str, CommandError> {
    tokens.next().ok_or(CommandError::NotEnoughArguments(param))
}

/// Interprets `set` arguments against one bridge scope.
pub struct Engine<'a> {
    registry: &'a Registry,
    cpu: &'a CpuVisualizer,
    bridge: Arc<Bridge>,
    timeout: Duration,
    scope: Scope,
}

impl<'a> Engine<'a> {
    pub fn new(registry: &'a Registry, cpu: &'a CpuVisualizer, bridge: Arc<Bridge>, timeout: Duration) -> Self {
        Self {
            registry,
            cpu,
            bridge,
            timeout,
            scope: Scope::Registry,
        }
    }

    /// Restrict name lookups, see [`Scope`].
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    fn resolver(&self) -> Resolver<'a> {
        Resolver::with_scope(self.registry, self.scope)
    }

    pub async fn execute(&self, args: &[&str]) -> Result<Outcome, CommandError> {
        let plan = self.parse(args).await?;
        self.run(plan).await
    }

    /// Walk the tokens once, resolving targets and validating parameters.
    pub async fn parse(&self, args: &[&str]) -> Result<Plan, CommandError> {
        let resolver = self.resolver();
        let mut targets: Vec<Box<dyn Target>> = Vec::new();
        // Set while the active target is a group, for scene lookups.
        let mut bound_group: Option<GroupHandle> = None;
        let mut actions = Vec::new();
        let mut cpu = None;
        let mut unbound = false;
        let mut tokens = args.iter().copied();

        while let Some(token) = tokens.next() {
            let action = match token {
                "light" | "l" => {
                    let name = value(&mut tokens, "light")?;
                    targets.push(Box::new(resolver.light(name, &self.bridge).await?));
                    bound_group = None;
                    continue;
                }
                "group" | "g" => {
                    let name = value(&mut tokens, "group")?;
                    let group = resolver.group(name, &self.bridge).await?;
                    bound_group = Some(group.clone());
                    targets.push(Box::new(group));
                    continue;
                }
                "sensor" => {
                    let name = value(&mut tokens, "sensor")?;
                    targets.push(Box::new(resolver.sensor(name, &self.bridge).await?));
                    bound_group = None;
                    continue;
                }
                "config" => return Err(CommandError::UnsupportedTarget("config")),
                "scene" | "sc" => {
                    let name = value(&mut tokens, "scene")?;
                    if targets.is_empty() {
                        // Bare scene: recall it on its own group.
                        let scene = resolver.scene(name, &self.bridge).await?;
                        let group_id = scene.scene.group.clone().unwrap_or_else(|| "0".to_string());
                        let group = resolver.group(&group_id, &scene.bridge).await?;
                        bound_group = Some(group.clone());
                        targets.push(Box::new(group));
                        Action::Scene(scene.scene.id)
                    } else {
                        let in_group = match &bound_group {
                            Some(group) => resolver.scene_in_group(group, name).await?,
                            None => None,
                        };
                        Action::Scene(in_group.map_or_else(|| name.to_string(), |s| s.scene.id))
                    }
                }
                "on" => Action::On,
                "off" => Action::Off,
                "alert" => Action::Alert,
                "brightness" | "bri" => actions::brightness(value(&mut tokens, "brightness")?)?,
                "brightness--" | "dim" => Action::Dim,
                "brightness++" | "brighten" => Action::Brighten,
                "color" | "colour" => actions::color(value(&mut tokens, "color")?)?,
                "hue" | "h" => actions::hue(value(&mut tokens, "hue")?)?,
                "saturation" | "sat" => actions::saturation(value(&mut tokens, "saturation")?)?,
                "temperature" | "temp" | "ct" => actions::temperature(value(&mut tokens, "temperature")?)?,
                "effect" | "e" => Action::Effect(value(&mut tokens, "effect")?.to_string()),
                "cpu" | "cpu2" => {
                    let mode = if token == "cpu" {
                        CpuMode::Gradient
                    } else {
                        CpuMode::PerCore
                    };
                    match targets.len().checked_sub(1) {
                        Some(slot) => cpu = Some((slot, mode)),
                        None => unbound = true,
                    }
                    continue;
                }
                other => return Err(CommandError::UnknownArgument(other.to_string())),
            };
            match targets.len().checked_sub(1) {
                Some(slot) => actions.push(Pending { slot, action }),
                None => unbound = true,
            }
        }

        if actions.is_empty() && cpu.is_none() && !unbound {
            return Err(CommandError::NoActionSpecified);
        }
        if targets.is_empty() || unbound {
            return Err(CommandError::NoTargetSpecified);
        }
        Ok(Plan {
            targets,
            actions,
            cpu,
        })
    }

    /// Run the queued actions in order, stopping at the first failure.
    pub async fn run(&self, plan: Plan) -> Result<Outcome, CommandError> {
        let Plan {
            mut targets,
            actions,
            cpu,
        } = plan;

        for (step, pending) in actions.iter().enumerate() {
            let target = &mut targets[pending.slot];
            let label = target.label();
            debug!("Step {}: {} on {}", step + 1, pending.action.verb(), label);
            let applied = self.apply(target.as_ref(), &pending.action).await?;

            match self.timed(target.refresh()).await {
                Ok(()) => debug!("{} now {:?}", label, target.current_state()),
                Err(e) => {
                    warn!("Failed to refresh {}, keeping the sent state: {}", label, e);
                    if let Some(update) = &applied {
                        target.assume(update);
                    }
                }
            }
        }

        let toggled = cpu.and_then(|(slot, mode)| {
            let target = targets.into_iter().nth(slot)?;
            Some(self.cpu.toggle(mode, target, Box::new(SystemLoad::new())))
        });

        Ok(Outcome {
            applied: actions.len(),
            cpu: toggled,
        })
    }

    /// Send one action. Returns the state update it sent, if any, so the
    /// snapshot can follow it when a refresh fails.
    async fn apply(&self, target: &dyn Target, action: &Action) -> Result<Option<StateUpdate>, CommandError> {
        let failed = |source: ApiError| CommandError::Action {
            verb: action.verb(),
            source,
        };
        match action {
            Action::Scene(token) => {
                let first = match self.timed(target.recall_scene(token)).await {
                    Ok(()) => return Ok(None),
                    Err(e) => e,
                };
                debug!("Scene {} not accepted as an id ({}), trying by name", token, first);
                let scene = self
                    .resolver()
                    .named_scene(token, target.bridge())
                    .await
                    .ok_or_else(|| {
                        CommandError::Resolve(ResolveError::NotFound {
                            kind: EntityKind::Scene,
                            token: token.clone(),
                        })
                    })?;
                self.timed(target.recall_scene(&scene.scene.id))
                    .await
                    .map_err(failed)?;
                Ok(None)
            }
            _ => {
                let update = action.update(target.current_state(), &target.label())?;
                self.timed(target.apply(&update)).await.map_err(failed)?;
                Ok(Some(update))
            }
        }
    }

    async fn timed<F>(&self, fut: F) -> Result<(), ApiError>
    where
        F: Future<Output = Result<(), ApiError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(ApiError::Timeout(self.timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBridge;

    struct Fixture {
        registry: Registry,
        cpu: CpuVisualizer,
        bridge: Arc<Bridge>,
        fake: Arc<FakeBridge>,
    }

    impl Fixture {
        async fn new() -> Self {
            let registry = Registry::with_policy(10, None);
            let (fake, bridge) = FakeBridge::new("AAAA")
                .light(1, "Desk", 100)
                .light(2, "Porch", 40)
                .group(1, "Kitchen", &[1, 2])
                .scene("abc-on-0", "Relax", 1)
                .sensor(7, "Motion")
                .into_bridge("10.0.0.1");
            let bridge = registry.add_bridge(bridge).await;
            Self {
                registry,
                cpu: CpuVisualizer::new(Duration::from_millis(750)),
                bridge,
                fake,
            }
        }

        async fn set(&self, line: &str) -> Result<Outcome, CommandError> {
            let args: Vec<&str> = line.split_whitespace().collect();
            Engine::new(&self.registry, &self.cpu, self.bridge.clone(), Duration::from_secs(1))
                .execute(&args)
                .await
        }
    }

    #[tokio::test]
    async fn relative_brightness_compounds_on_fresh_state() {
        let fx = Fixture::new().await;
        let outcome = fx.set("light Desk brightness 100 brightness++").await.unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(fx.fake.light_state(1).bri, 105);

        fx.set("l 1 dim dim").await.unwrap();
        assert_eq!(fx.fake.light_state(1).bri, 95);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_sent_state() {
        let fx = Fixture::new().await;
        fx.registry.light_map().await;
        fx.fake.fail_on("get_light 1");

        let outcome = fx.set("light Desk brightness 200 dim").await.unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(fx.fake.light_state(1).bri, 195);
    }

    #[tokio::test]
    async fn actions_run_in_order_and_stop_at_first_failure() {
        let fx = Fixture::new().await;
        fx.fake.fail_on("set_group_action");

        let err = fx
            .set("light Desk off group Kitchen on light Porch alert")
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Action { verb: "turn on", .. }));
        assert!(err.to_string().starts_with("failed to turn on:"));
        assert!(!fx.fake.light_state(1).on);
        assert_eq!(fx.fake.count_calls("set_light_state 1"), 1);
        assert_eq!(fx.fake.count_calls("set_light_state 2"), 0);
    }

    #[tokio::test]
    async fn each_action_keeps_its_own_target() {
        let fx = Fixture::new().await;
        fx.set("light Desk off light Porch bri 200").await.unwrap();
        assert!(!fx.fake.light_state(1).on);
        assert_eq!(fx.fake.light_state(1).bri, 100);
        assert_eq!(fx.fake.light_state(2).bri, 200);
    }

    #[tokio::test]
    async fn missing_action_or_target() {
        let fx = Fixture::new().await;
        assert!(matches!(fx.set("light Desk").await, Err(CommandError::NoActionSpecified)));
        assert!(matches!(fx.set("").await, Err(CommandError::NoActionSpecified)));
        assert!(matches!(fx.set("on").await, Err(CommandError::NoTargetSpecified)));
        assert!(matches!(
            fx.set("on light Desk").await,
            Err(CommandError::NoTargetSpecified)
        ));
        assert_eq!(fx.fake.count_calls("set_light_state"), 0);
    }

    #[tokio::test]
    async fn invalid_parameters_abort_before_any_call() {
        let fx = Fixture::new().await;
        let err = fx.set("light Desk on hue 70000").await.unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(matches!(
            fx.set("light Desk temp 100").await,
            Err(CommandError::OutOfRange { param: "temperature", .. })
        ));
        assert!(matches!(
            fx.set("light Desk color blue").await,
            Err(CommandError::InvalidFormat { param: "color", .. })
        ));
        assert!(matches!(
            fx.set("light Desk brightness").await,
            Err(CommandError::NotEnoughArguments("brightness"))
        ));
        assert!(matches!(
            fx.set("light Desk sparkle").await,
            Err(CommandError::UnknownArgument(t)) if t == "sparkle"
        ));
        assert!(matches!(
            fx.set("config on").await,
            Err(CommandError::UnsupportedTarget("config"))
        ));
        assert_eq!(fx.fake.count_calls("set_light_state"), 0);
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.set("light Garage on").await,
            Err(CommandError::Resolve(ResolveError::NotFound { kind: EntityKind::Light, .. }))
        ));
    }

    #[tokio::test]
    async fn scene_resolves_through_bound_group() {
        let fx = Fixture::new().await;
        fx.set("group Kitchen scene Relax").await.unwrap();
        assert_eq!(fx.fake.count_calls("set_group_action 1"), 1);
        assert_eq!(fx.fake.count_calls("get_scenes"), 1);
    }

    #[tokio::test]
    async fn scene_name_falls_back_to_scene_map() {
        let fx = Fixture::new().await;
        fx.set("light Desk scene Relax").await.unwrap();
        let calls = fx.fake.calls();
        assert_eq!(
            calls.iter().filter(|c| *c == "set_group_action 0").count(),
            2,
            "{calls:?}"
        );

        assert!(matches!(
            fx.set("group Kitchen scene Nope").await,
            Err(CommandError::Resolve(ResolveError::NotFound { kind: EntityKind::Scene, .. }))
        ));
    }

    #[tokio::test]
    async fn bare_scene_recalls_on_its_group() {
        let fx = Fixture::new().await;
        let outcome = fx.set("scene Relax").await.unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(fx.fake.count_calls("set_group_action 1"), 1);
    }

    #[tokio::test]
    async fn sensors_only_switch_on_and_off() {
        let fx = Fixture::new().await;
        fx.set("sensor Motion off").await.unwrap();
        assert_eq!(fx.fake.count_calls("set_sensor_config 7"), 1);

        let err = fx.set("sensor Motion bri 10").await.unwrap_err();
        assert!(matches!(err, CommandError::Action { verb: "set brightness", source: ApiError::Unsupported(_) }));
        assert!(matches!(
            fx.set("sensor Motion dim").await,
            Err(CommandError::NoStateFound(_))
        ));
    }

    #[tokio::test]
    async fn cpu_toggles_on_the_bound_target() {
        let fx = Fixture::new().await;
        let outcome = fx.set("light Desk cpu").await.unwrap();
        assert_eq!(outcome.cpu, Some(Toggle::Started));
        assert!(fx.cpu.is_running());

        let outcome = fx.set("light Desk cpu").await.unwrap();
        assert_eq!(outcome.cpu, Some(Toggle::Stopped));
        assert!(!fx.cpu.is_running());

        assert!(matches!(fx.set("cpu").await, Err(CommandError::NoTargetSpecified)));
    }
}
