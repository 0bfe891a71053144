use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Result};
use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use crate::bridge::Bridge;
use crate::commands::{self, CommandSpec, Context};
use crate::error::CommandError;
use crate::logging::LogHandle;
use crate::prompt;
use crate::resolver::Scope;

const BUILTINS: &[(&str, &str)] = &[
    ("use <bridge>", "select the bridge commands run against"),
    ("bridges", "list connected bridges"),
    ("debug [level]", "show or change log verbosity"),
    ("help [command]", "show help"),
    ("clear", "clear the screen"),
    ("exit", "leave the shell"),
];

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue(String),
    Exit,
}

/// Line-oriented front end over the command table.
pub struct Shell {
    ctx: Arc<Context>,
    logs: Option<LogHandle>,
    selected: Option<Arc<Bridge>>,
}

impl Shell {
    pub fn new(ctx: Arc<Context>, logs: Option<LogHandle>) -> Self {
        Self {
            ctx,
            logs,
            selected: None,
        }
    }

    async fn prompt(&self) -> String {
        match &self.selected {
            Some(bridge) => format!("huesh[{}]> ", bridge.id()),
            None if self.ctx.registry.bridge_count().await == 1 => "huesh> ".to_string(),
            None => "huesh[*]> ".to_string(),
        }
    }

    /// Read commands from stdin until EOF or `exit`.
    pub async fn run(mut self) -> Result<()> {
        let mut reader = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut line = String::new();

        loop {
            stdout.write_all(self.prompt().await.as_bytes()).await?;
            stdout.flush().await?;

            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }

            match self.execute(&line).await {
                Ok(Flow::Exit) => break,
                Ok(Flow::Continue(out)) => {
                    stdout.write_all(out.as_bytes()).await?;
                }
                Err(e) => error!("{:#}", e),
            }
        }

        self.ctx.cpu.stop();
        Ok(())
    }

    pub async fn execute(&mut self, line: &str) -> Result<Flow> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&word, args)) = words.split_first() else {
            return Ok(Flow::Continue(String::new()));
        };

        match word {
            "exit" | "quit" => return Ok(Flow::Exit),
            "use" => return self.select(args.first().copied()).await.map(Flow::Continue),
            "bridges" => return Ok(Flow::Continue(self.list_bridges().await)),
            "debug" => return self.debug(args.first().copied()).map(Flow::Continue),
            "help" => return help(args.last().copied()).map(Flow::Continue),
            "clear" => return Ok(Flow::Continue("\x1b[H\x1b[2J".to_string())),
            _ => {}
        }

        let Some(spec) = commands::lookup(word) else {
            bail!("invalid command: {}", word);
        };
        let targets = match &self.selected {
            Some(bridge) => vec![bridge.clone()],
            None => self.ctx.registry.bridges().await,
        };
        match targets.len() {
            0 => bail!("no bridges connected"),
            1 => self
                .ctx
                .dispatch(spec, &targets[0], args)
                .await
                .map(Flow::Continue)
                .map_err(|e| with_usage(e, spec)),
            n => {
                if !prompt::confirm(&self.ctx.decisions, format!("Send to all {} bridges?", n)).await {
                    return Ok(Flow::Continue(String::new()));
                }
                Ok(Flow::Continue(self.fan_out(spec, targets, args).await))
            }
        }
    }

    /// One task per bridge. Names resolve only to each bridge's own
    /// entities. Failures are logged per bridge and do not stop the others.
    async fn fan_out(&self, spec: &'static CommandSpec, targets: Vec<Arc<Bridge>>, args: &[&str]) -> String {
        let args: Arc<Vec<String>> = Arc::new(args.iter().map(|a| a.to_string()).collect());
        let scoped = Arc::new(Context {
            scope: Scope::Bridge,
            ..(*self.ctx).clone()
        });
        let tasks = targets.into_iter().map(|bridge| {
            let ctx = scoped.clone();
            let args = args.clone();
            tokio::spawn(async move {
                let words: Vec<&str> = args.iter().map(String::as_str).collect();
                let result = ctx.dispatch(spec, &bridge, &words).await;
                (bridge, result)
            })
        });

        let mut out = String::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok((bridge, Ok(text))) => {
                    let _ = writeln!(out, "== {} ==", bridge.id());
                    out.push_str(&text);
                }
                Ok((bridge, Err(e))) => {
                    error!("{} failed on {}: {:#}", spec.name, bridge.id(), with_usage(e, spec))
                }
                Err(e) => error!("{} task failed: {}", spec.name, e),
            }
        }
        out
    }

    async fn select(&mut self, token: Option<&str>) -> Result<String> {
        let token = token.ok_or(CommandError::NotEnoughArguments("bridge"))?;
        let Some(bridge) = self.ctx.registry.bridge(token).await else {
            bail!("invalid bridge: {}", token);
        };
        info!("Switched to bridge {} at {}", bridge.id(), bridge.host);
        let out = format!("using {} ({})\n", bridge.id(), bridge.host);
        self.selected = Some(bridge);
        Ok(out)
    }

    async fn list_bridges(&self) -> String {
        let mut out = String::new();
        for bridge in self.ctx.registry.bridges().await {
            let marker = match &self.selected {
                Some(s) if Arc::ptr_eq(s, &bridge) => "*",
                _ => " ",
            };
            let _ = writeln!(
                out,
                "{} {:<18} {:<20} {}",
                marker,
                bridge.id(),
                bridge.host,
                bridge.info.name
            );
        }
        out
    }

    fn debug(&self, level: Option<&str>) -> Result<String> {
        let Some(logs) = &self.logs else {
            bail!("logging is not configured");
        };
        match level {
            None => Ok(format!("current log filter: {}\n", logs.current())),
            Some(level) => {
                logs.set_level(level)?;
                Ok(format!("log level set to {}\n", level))
            }
        }
    }
}

/// Argument errors get the command's usage line attached.
fn with_usage(e: anyhow::Error, spec: &CommandSpec) -> anyhow::Error {
    let invalid = e
        .downcast_ref::<CommandError>()
        .is_some_and(CommandError::is_invalid_argument);
    if invalid {
        e.context(format!("usage: {}", spec.usage))
    } else {
        e
    }
}

fn help(topic: Option<&str>) -> Result<String> {
    if let Some(topic) = topic {
        return commands::help(Some(topic));
    }
    let mut out = commands::help(None)?;
    out.push('\n');
    for (usage, description) in BUILTINS {
        let _ = writeln!(out, "{:<16} {}", usage, description);
    }
    Ok(out)
}
