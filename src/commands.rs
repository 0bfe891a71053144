use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::config::CommandConfig;
use crate::cpu::{CpuVisualizer, Toggle};
use crate::engine::Engine;
use crate::entity::{Entity, EntityKind};
use crate::error::CommandError;
use crate::hue_client::Resource;
use crate::model::{NewGroup, Scene};
use crate::prompt::{self, Decisions};
use crate::registry::Registry;
use crate::resolver::{Resolver, Scope};

const SCAN_POLL: Duration = Duration::from_millis(250);

/// One entry in the command table.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub usage: &'static str,
    pub description: &'static str,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "set",
        aliases: &[],
        usage: "set <light|group|sensor> <name|id> <action> [value].. [cpu|cpu2]",
        description: "change the state of lights, groups and sensors",
    },
    CommandSpec {
        name: "get",
        aliases: &[],
        usage: "get <light|group|scene|sensor|config> [name|id]",
        description: "print the state of an object as JSON",
    },
    CommandSpec {
        name: "create",
        aliases: &["new", "mk"],
        usage: "create group <name> <ids|a,b,c>.. [-entertainment] | create <schedule|rule|sensor> <name>",
        description: "create a new object on the bridge",
    },
    CommandSpec {
        name: "delete",
        aliases: &["del", "remove", "rm"],
        usage: "delete <light|group|schedule|rule|sensor> <name|id>",
        description: "delete an object from the bridge",
    },
    CommandSpec {
        name: "rename",
        aliases: &["mv"],
        usage: "rename <light|group|sensor> <name|id> <new name>",
        description: "rename an object on the bridge",
    },
    CommandSpec {
        name: "cp",
        aliases: &["copy"],
        usage: "cp <light> <group>",
        description: "add a light to a group",
    },
    CommandSpec {
        name: "lights",
        aliases: &["lslight"],
        usage: "lights",
        description: "list lights",
    },
    CommandSpec {
        name: "groups",
        aliases: &["lsgrp"],
        usage: "groups",
        description: "list groups and their lights",
    },
    CommandSpec {
        name: "scenes",
        aliases: &["lsscene"],
        usage: "scenes [group]",
        description: "list scenes, optionally only those of one group",
    },
    CommandSpec {
        name: "sensors",
        aliases: &["lssens"],
        usage: "sensors",
        description: "list sensors",
    },
    CommandSpec {
        name: "schedules",
        aliases: &["lssched", "crontab"],
        usage: "schedules",
        description: "list schedules",
    },
    CommandSpec {
        name: "rules",
        aliases: &["lsrule"],
        usage: "rules",
        description: "list rules",
    },
    CommandSpec {
        name: "ls",
        aliases: &["list"],
        usage: "ls [-la]",
        description: "list lights, groups, scenes and sensors; -la adds schedules and rules",
    },
    CommandSpec {
        name: "info",
        aliases: &["uname"],
        usage: "info",
        description: "show bridge information",
    },
    CommandSpec {
        name: "refresh",
        aliases: &[],
        usage: "refresh",
        description: "rebuild the cached name maps",
    },
    CommandSpec {
        name: "scan",
        aliases: &["search", "find"],
        usage: "scan",
        description: "search for new lights",
    },
    CommandSpec {
        name: "reboot",
        aliases: &[],
        usage: "reboot",
        description: "reboot the bridge",
    },
];

pub fn lookup(word: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|c| c.name == word || c.aliases.contains(&word))
}

pub fn help(topic: Option<&str>) -> Result<String> {
    let mut out = String::new();
    match topic {
        Some(word) => {
            let Some(spec) = lookup(word) else {
                bail!("unknown command: {}", word);
            };
            let _ = writeln!(out, "{} - {}", spec.name, spec.description);
            let _ = writeln!(out, "usage: {}", spec.usage);
            if !spec.aliases.is_empty() {
                let _ = writeln!(out, "aliases: {}", spec.aliases.join(", "));
            }
        }
        None => {
            for spec in COMMANDS {
                let _ = writeln!(out, "{:<10} {}", spec.name, spec.description);
            }
        }
    }
    Ok(out)
}

/// Object kinds accepted by `delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteKind {
    Light,
    Group,
    Sensor,
    Schedule,
    Rule,
}

impl DeleteKind {
    fn parse(token: &str) -> Result<Self, CommandError> {
        Ok(match token {
            "light" | "l" => DeleteKind::Light,
            "group" | "g" => DeleteKind::Group,
            "sensor" => DeleteKind::Sensor,
            "schedule" => DeleteKind::Schedule,
            "rule" => DeleteKind::Rule,
            other => return Err(CommandError::UnknownArgument(other.to_string())),
        })
    }
}

/// Shared state every bridge command runs against.
#[derive(Clone)]
pub struct Context {
    pub registry: Arc<Registry>,
    pub cpu: Arc<CpuVisualizer>,
    pub decisions: Arc<dyn Decisions>,
    pub settings: CommandConfig,
    pub scope: Scope,
}

impl Context {
    /// Run `spec` with `args` (command word excluded) against `bridge`.
    /// Returns the text to show the operator.
    pub async fn dispatch(&self, spec: &CommandSpec, bridge: &Arc<Bridge>, args: &[&str]) -> Result<String> {
        debug!("{} on {}: {:?}", spec.name, bridge.id(), args);
        match spec.name {
            "set" => self.set(bridge, args).await,
            "get" => self.get(bridge, args).await,
            "create" => self.create(bridge, args).await,
            "delete" => self.delete(bridge, args).await,
            "rename" => self.rename(bridge, args).await,
            "cp" => self.cp(bridge, args).await,
            "lights" => Ok(self.lights(bridge).await),
            "groups" => Ok(self.groups(bridge).await),
            "scenes" => self.scenes(bridge, args.first().copied()).await,
            "sensors" => self.sensors(bridge).await,
            "schedules" => self.schedules(bridge).await,
            "rules" => self.rules(bridge).await,
            "ls" => self.list(bridge, args).await,
            "info" => self.info(bridge).await,
            "refresh" => Ok(self.refresh().await),
            "scan" => self.scan(bridge).await,
            "reboot" => self.reboot(bridge).await,
            other => bail!("unknown command: {}", other),
        }
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::with_scope(&self.registry, self.scope)
    }

    async fn set(&self, bridge: &Arc<Bridge>, args: &[&str]) -> Result<String> {
        let engine = Engine::new(&self.registry, &self.cpu, bridge.clone(), self.settings.timeout())
            .with_scope(self.scope);
        let outcome = engine.execute(args).await?;
        let mut out = String::new();
        if outcome.applied > 0 {
            let _ = writeln!(out, "applied {} change(s)", outcome.applied);
        }
        match outcome.cpu {
            Some(Toggle::Started) => out.push_str("cpu visualization started\n"),
            Some(Toggle::Stopped) => out.push_str("cpu visualization stopped\n"),
            None => {}
        }
        Ok(out)
    }

    async fn get(&self, bridge: &Arc<Bridge>, args: &[&str]) -> Result<String> {
        let kind = args.first().ok_or(CommandError::NotEnoughArguments("target"))?;
        if matches!(*kind, "config" | "conf" | "cfg") {
            let config = bridge.api().get_config().await?;
            return Ok(serde_json::to_string_pretty(&config)? + "\n");
        }
        let kind: EntityKind = kind
            .parse()
            .map_err(|_| CommandError::UnknownArgument(kind.to_string()))?;
        let token = args.get(1).ok_or(CommandError::NotEnoughArguments("name"))?;
        let entity = self.resolver().resolve(kind, token, bridge).await?;
        let body = json!({
            "id": entity.id(),
            "name": entity.name(),
            "bridge": entity.bridge().id(),
            "state": entity.state_json(),
        });
        Ok(serde_json::to_string_pretty(&body)? + "\n")
    }

    async fn create(&self, bridge: &Arc<Bridge>, args: &[&str]) -> Result<String> {
        let kind = args.first().ok_or(CommandError::NotEnoughArguments("object type"))?;
        let name = args.get(1).ok_or(CommandError::NotEnoughArguments("name"))?;
        let id = match *kind {
            "group" | "g" => {
                let mut lights = Vec::new();
                let mut entertainment = false;
                for arg in &args[2..] {
                    if *arg == "-entertainment" {
                        entertainment = true;
                        continue;
                    }
                    for token in arg.split(',').filter(|t| !t.is_empty()) {
                        let light = self.resolver().light(token, bridge).await?;
                        lights.push(light.light.id.to_string());
                    }
                }
                let group = NewGroup {
                    name: name.to_string(),
                    lights,
                    kind: if entertainment { "Entertainment" } else { "LightGroup" }.to_string(),
                    class: entertainment.then(|| "Other".to_string()),
                };
                debug!("Creating group {:?}", group);
                bridge.api().create_group(&group).await?
            }
            "schedule" => bridge.api().create(Resource::Schedules, &json!({ "name": name })).await?,
            "rule" => bridge.api().create(Resource::Rules, &json!({ "name": name })).await?,
            "sensor" => {
                let body = json!({
                    "name": name,
                    "type": "CLIPGenericStatus",
                    "modelid": "huesh",
                    "manufacturername": "huesh",
                    "swversion": "1.0",
                    "uniqueid": uuid::Uuid::new_v4().to_string(),
                });
                bridge.api().create(Resource::Sensors, &body).await?
            }
            other => return Err(CommandError::UnknownArgument(other.to_string()).into()),
        };
        self.registry.invalidate();
        info!("Created {} {} with id {}", kind, name, id);
        Ok(format!("created {} {} ({})\n", kind, name, id))
    }

    async fn delete(&self, bridge: &Arc<Bridge>, args: &[&str]) -> Result<String> {
        let kind = DeleteKind::parse(args.first().ok_or(CommandError::NotEnoughArguments("object type"))?)?;
        let token = args.get(1).ok_or(CommandError::NotEnoughArguments("name"))?;

        let (owner, resource, id, name) = match kind {
            DeleteKind::Light => {
                let h = self.resolver().light(token, bridge).await?;
                (h.bridge, Resource::Lights, h.light.id.to_string(), h.light.name)
            }
            DeleteKind::Group => {
                let h = self.resolver().group(token, bridge).await?;
                (h.bridge, Resource::Groups, h.group.id.to_string(), h.group.name)
            }
            DeleteKind::Sensor => {
                let h = self.resolver().sensor(token, bridge).await?;
                (h.bridge, Resource::Sensors, h.sensor.id.to_string(), h.sensor.name)
            }
            DeleteKind::Schedule => {
                let schedules = bridge.api().get_schedules().await?;
                let s = schedules
                    .into_iter()
                    .find(|s| s.id.to_string() == *token || s.name == *token)
                    .with_context(|| format!("schedule {} not found", token))?;
                (bridge.clone(), Resource::Schedules, s.id.to_string(), s.name)
            }
            DeleteKind::Rule => {
                let rules = bridge.api().get_rules().await?;
                let r = rules
                    .into_iter()
                    .find(|r| r.id.to_string() == *token || r.name == *token)
                    .with_context(|| format!("rule {} not found", token))?;
                (bridge.clone(), Resource::Rules, r.id.to_string(), r.name)
            }
        };

        let question = format!("Delete {} {} ({}) from {}?", args[0], name, id, owner.id());
        if !prompt::confirm(&self.decisions, question).await {
            return Ok("cancelled\n".to_string());
        }
        owner.api().delete(resource, &id).await?;
        self.registry.invalidate();
        info!("Deleted {}/{} from {}", resource.path(), id, owner.id());
        Ok(format!("deleted {} {}\n", args[0], name))
    }

    async fn rename(&self, bridge: &Arc<Bridge>, args: &[&str]) -> Result<String> {
        let kind = args.first().ok_or(CommandError::NotEnoughArguments("object type"))?;
        let token = args.get(1).ok_or(CommandError::NotEnoughArguments("name"))?;
        if args.len() < 3 {
            return Err(CommandError::NotEnoughArguments("new name").into());
        }
        let new_name = args[2..].join(" ");

        let entity = match *kind {
            "light" | "l" => Entity::Light(self.resolver().light(token, bridge).await?),
            "group" | "g" => Entity::Group(self.resolver().group(token, bridge).await?),
            "sensor" => Entity::Sensor(self.resolver().sensor(token, bridge).await?),
            other => return Err(CommandError::UnknownArgument(other.to_string()).into()),
        };
        let owner = entity.bridge().clone();
        owner
            .api()
            .rename(entity.kind().resource(), &entity.id(), &new_name)
            .await?;
        self.registry.invalidate();
        Ok(format!("renamed {} {} to {}\n", entity.kind(), entity.name(), new_name))
    }

    async fn cp(&self, bridge: &Arc<Bridge>, args: &[&str]) -> Result<String> {
        let light_token = args.first().ok_or(CommandError::NotEnoughArguments("light"))?;
        let group_token = args.get(1).ok_or(CommandError::NotEnoughArguments("group"))?;
        let light = self.resolver().light(light_token, bridge).await?;
        let group = self.resolver().group(group_token, bridge).await?;
        if !Arc::ptr_eq(&light.bridge, &group.bridge) {
            bail!(
                "light {} and group {} are on different bridges",
                light.light.name,
                group.group.name
            );
        }

        let id = light.light.id.to_string();
        if group.group.lights.contains(&id) {
            return Ok(format!("{} is already in {}\n", light.light.name, group.group.name));
        }
        let mut lights = group.group.lights.clone();
        lights.push(id);
        group
            .bridge
            .api()
            .set_group_lights(group.group.id, &lights)
            .await?;
        self.registry.invalidate();
        info!("Added light {} to group {}", light.light.name, group.group.name);
        Ok(format!("added {} to {}\n", light.light.name, group.group.name))
    }

    async fn lights(&self, bridge: &Arc<Bridge>) -> String {
        let mut out = String::new();
        for (name, h) in self.registry.light_map().await.iter() {
            if !Arc::ptr_eq(&h.bridge, bridge) {
                continue;
            }
            let _ = writeln!(
                out,
                "[{:>3}] {:<24} {:<3} {}",
                h.light.id,
                name,
                if h.light.state.on { "on" } else { "off" },
                h.light.productname
            );
        }
        out
    }

    async fn groups(&self, bridge: &Arc<Bridge>) -> String {
        let lights = self.registry.light_map().await;
        let light_name = |id: &str| {
            lights
                .values()
                .find(|h| Arc::ptr_eq(&h.bridge, bridge) && h.light.id.to_string() == id)
                .map(|h| h.light.name.clone())
                .unwrap_or_else(|| "?".to_string())
        };

        let mut out = String::new();
        for (name, h) in self.registry.group_map().await.iter() {
            if !Arc::ptr_eq(&h.bridge, bridge) {
                continue;
            }
            let g = &h.group;
            let _ = writeln!(
                out,
                "[{:>3}] {:<24} {} {} {}",
                g.id,
                name,
                g.kind,
                g.class,
                if g.state.any_on { "on" } else { "off" }
            );
            for id in &g.lights {
                let _ = writeln!(out, "\t[{}] {}", id, light_name(id));
            }
        }
        out
    }

    async fn scenes(&self, bridge: &Arc<Bridge>, group: Option<&str>) -> Result<String> {
        let scenes: Vec<Scene> = match group {
            Some(token) => {
                let group = self.resolver().group(token, bridge).await?;
                self.resolver()
                    .scenes_for_group(&group)
                    .await?
                    .into_iter()
                    .map(|h| h.scene)
                    .collect()
            }
            None => bridge.api().get_scenes().await?,
        };
        let groups = self.registry.group_map().await;
        let group_name = |id: &str| {
            groups
                .values()
                .find(|h| Arc::ptr_eq(&h.bridge, bridge) && h.group.id.to_string() == id)
                .map(|h| h.group.name.clone())
                .unwrap_or_else(|| id.to_string())
        };

        let mut out = String::new();
        for scene in scenes {
            let scene_group = scene.group.clone().unwrap_or_default();
            let _ = writeln!(out, "{:<18} {:<24} {}", scene.id, scene.name, group_name(&scene_group));
        }
        Ok(out)
    }

    async fn sensors(&self, bridge: &Arc<Bridge>) -> Result<String> {
        let mut out = String::new();
        for s in bridge.api().get_sensors().await? {
            let _ = writeln!(out, "[{:>3}] {:<24} {}", s.id, s.name, s.kind);
        }
        Ok(out)
    }

    async fn schedules(&self, bridge: &Arc<Bridge>) -> Result<String> {
        let mut out = String::new();
        for s in bridge.api().get_schedules().await? {
            let _ = writeln!(out, "[{:>3}] {:<24} {} {}", s.id, s.name, s.localtime, s.description);
        }
        Ok(out)
    }

    async fn rules(&self, bridge: &Arc<Bridge>) -> Result<String> {
        let mut out = String::new();
        for r in bridge.api().get_rules().await? {
            let _ = writeln!(out, "[{:>3}] {:<24} {}", r.id, r.name, r.status);
        }
        Ok(out)
    }

    async fn list(&self, bridge: &Arc<Bridge>, args: &[&str]) -> Result<String> {
        let all = args
            .iter()
            .any(|a| a.starts_with('-') && (a.contains('l') || a.contains('a')));
        let mut out = String::new();
        out.push_str("# lights\n");
        out.push_str(&self.lights(bridge).await);
        out.push_str("# groups\n");
        out.push_str(&self.groups(bridge).await);
        out.push_str("# scenes\n");
        out.push_str(&self.scenes(bridge, None).await?);
        out.push_str("# sensors\n");
        out.push_str(&self.sensors(bridge).await?);
        if all {
            out.push_str("# schedules\n");
            out.push_str(&self.schedules(bridge).await?);
            out.push_str("# rules\n");
            out.push_str(&self.rules(bridge).await?);
        }
        Ok(out)
    }

    async fn info(&self, bridge: &Arc<Bridge>) -> Result<String> {
        let c = bridge.api().get_config().await?;
        let mut out = String::new();
        let _ = writeln!(out, "Name:        {}", c.name);
        let _ = writeln!(out, "ID:          {}", c.bridgeid);
        let _ = writeln!(out, "Host:        {}", bridge.host);
        let _ = writeln!(out, "MAC:         {}", c.mac);
        let _ = writeln!(out, "IP:          {}", c.ipaddress);
        let _ = writeln!(out, "Model:       {}", c.modelid);
        let _ = writeln!(out, "Software:    {} (API {})", c.swversion, c.apiversion);
        let _ = writeln!(out, "Channel:     {}", c.zigbeechannel);
        let _ = writeln!(out, "Link button: {}", c.linkbutton);
        Ok(out)
    }

    async fn refresh(&self) -> String {
        let (lights, groups, scenes, sensors) = self.registry.refresh_all().await;
        format!(
            "{} lights, {} groups, {} scenes, {} sensors\n",
            lights, groups, scenes, sensors
        )
    }

    /// Start a light search and poll until nothing new shows up for the
    /// configured idle period.
    async fn scan(&self, bridge: &Arc<Bridge>) -> Result<String> {
        let api = bridge.api();
        api.find_lights().await.context("failed to start light search")?;
        info!("Searching for new lights on {}...", bridge.id());

        let idle = self.settings.scan_idle();
        let mut deadline = Instant::now() + idle;
        let mut found: Vec<(u32, String)> = Vec::new();
        while Instant::now() < deadline {
            match api.get_new_lights().await {
                Ok(new) if new.lights.len() > found.len() => {
                    for (id, name) in new.lights.iter().skip(found.len()) {
                        info!("Discovered light {} ({})", name, id);
                    }
                    found = new.lights;
                    deadline = Instant::now() + idle;
                }
                Ok(_) => {}
                Err(e) => debug!("Polling new lights failed: {}", e),
            }
            tokio::time::sleep(SCAN_POLL).await;
        }

        if found.is_empty() {
            return Ok("no new lights found\n".to_string());
        }
        self.registry.invalidate();
        let mut out = String::new();
        for (id, name) in &found {
            let _ = writeln!(out, "[+] [{}] {}", id, name);
        }
        Ok(out)
    }

    async fn reboot(&self, bridge: &Arc<Bridge>) -> Result<String> {
        if !prompt::confirm(&self.decisions, format!("Reboot bridge {}?", bridge.id())).await {
            return Ok("cancelled\n".to_string());
        }
        bridge.api().update_config(&json!({ "reboot": true })).await?;
        info!("Reboot requested for {}", bridge.id());
        Ok("rebooting\n".to_string())
    }
}
