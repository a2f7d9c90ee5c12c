//! Environment-driven settings.
//!
//! Every knob has a default, so an empty environment yields a runnable
//! in-memory worker. Per-kind variables use the kind's upper-cased name, e.g.
//! `SLUICE_PERMISSIONS_SYNC_MAX_FAILURES`.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};

use sluice_core::{JobKind, JobPolicies, JobPolicy, JobStage};
use sluice_infra::jobs::{CommandHandler, CommandSpec, WorkerConfig};
use sluice_infra::ranking::RankingConfig;

/// Commands configured for one job kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCommands {
    pub default: CommandSpec,
    pub stages: Vec<(JobStage, CommandSpec)>,
}

impl KindCommands {
    pub fn handler(&self, timeout: Option<Duration>) -> CommandHandler {
        let mut handler = CommandHandler::new(self.default.clone());
        for (stage, spec) in &self.stages {
            handler = handler.with_stage(*stage, spec.clone());
        }
        match timeout {
            Some(t) => handler.with_timeout(t),
            None => handler,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Postgres connection string; in-memory stores when absent.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub worker: WorkerConfig,
    pub policies: JobPolicies,
    pub commands: BTreeMap<JobKind, KindCommands>,
    pub command_timeout: Option<Duration>,
    pub ranking: RankingConfig,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env(lookup);

        let worker_id = match env.string("SLUICE_WORKER_ID") {
            Some(id) => id,
            None => default_worker_id()?,
        };

        let mut worker = WorkerConfig::default().with_worker_id(worker_id);
        if let Some(secs) = env.parse::<u64>("SLUICE_LEASE_TIMEOUT_SECS")? {
            worker = worker.with_lease_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = env.parse::<u64>("SLUICE_HEARTBEAT_INTERVAL_SECS")? {
            worker = worker.with_heartbeat_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = env.parse::<u64>("SLUICE_REAPER_INTERVAL_SECS")? {
            worker = worker.with_reaper_interval(Duration::from_secs(secs));
        }
        if let Some(ms) = env.parse::<u64>("SLUICE_POLL_INTERVAL_MS")? {
            worker = worker.with_poll_interval(Duration::from_millis(ms));
        }

        let mut policies = JobPolicies::default();
        let mut commands = BTreeMap::new();
        for kind in JobKind::ALL {
            let prefix = format!("SLUICE_{}", kind.as_str().to_uppercase());

            let max_failures = env.parse::<u32>(&format!("{prefix}_MAX_FAILURES"))?;
            let max_resets = env.parse::<u32>(&format!("{prefix}_MAX_RESETS"))?;
            if max_failures.is_some() || max_resets.is_some() {
                let mut policy = JobPolicy::default();
                if let Some(n) = max_failures {
                    policy = policy.with_max_failures(n);
                }
                if let Some(n) = max_resets {
                    policy = policy.with_max_resets(n);
                }
                policies = policies.with_kind(kind, policy);
            }

            if let Some(loops) = env.parse::<usize>(&format!("{prefix}_CONCURRENCY"))? {
                worker = worker.with_concurrency(kind, loops);
            }

            if let Some(cmds) = env.commands(kind, &prefix)? {
                commands.insert(kind, cmds);
            }
        }
        worker.validate().context("invalid worker timing")?;

        let mut ranking = RankingConfig::new(
            env.string("SLUICE_RANKING_GRAPH_KEY")
                .unwrap_or_else(|| RankingConfig::default().graph_key),
        );
        if let Some(hours) = env.parse::<u64>("SLUICE_RETENTION_HOURS")? {
            ranking = ranking.with_retention(Duration::from_secs(hours * 60 * 60));
        }

        Ok(Self {
            database_url: env.string("DATABASE_URL"),
            max_connections: env.parse("SLUICE_DB_MAX_CONNECTIONS")?.unwrap_or(10),
            worker,
            policies,
            commands,
            command_timeout: env
                .parse::<u64>("SLUICE_COMMAND_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            ranking,
        })
    }
}

fn default_worker_id() -> anyhow::Result<String> {
    let host = hostname::get().context("failed to read hostname")?;
    Ok(format!("{}:{}", host.to_string_lossy(), std::process::id()))
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Non-empty value of `key`.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(key)
            .map(|raw| raw.parse::<T>().map_err(|e| anyhow!("{key}={raw:?}: {e}")))
            .transpose()
    }

    fn command(&self, key: &str) -> anyhow::Result<Option<CommandSpec>> {
        match self.string(key) {
            Some(line) => CommandSpec::parse(&line)
                .map(Some)
                .ok_or_else(|| anyhow!("{key} is not a valid command line")),
            None => Ok(None),
        }
    }

    fn commands(&self, kind: JobKind, prefix: &str) -> anyhow::Result<Option<KindCommands>> {
        let default = self.command(&format!("{prefix}_COMMAND"))?;

        let mut stages = Vec::new();
        for stage in kind.stages() {
            let key = format!("{prefix}_{}_COMMAND", stage.as_str().to_uppercase());
            if let Some(spec) = self.command(&key)? {
                stages.push((*stage, spec));
            }
        }

        match default {
            Some(default) => Ok(Some(KindCommands { default, stages })),
            None if stages.is_empty() => Ok(None),
            None => bail!("stage commands for {kind} require {prefix}_COMMAND"),
        }
    }
}
