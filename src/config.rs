// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ecosystem file loading
//!
//! The file is a JSON document of the form `{ "apps": [ { ... } ] }`. Loosely typed fields
//! (`watch`, `args`, `instances`) are normalized here into an immutable [`AppSpec`], anything
//! malformed is reported as a configuration error before any app is started.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RESTARTS: u32 = 15;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(15);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(1600);
pub const DEFAULT_WATCH_DELAY: Duration = Duration::from_millis(300);

/// A cluster may oversubscribe the cores at most this many times
pub const MAX_INSTANCES_PER_CORE: usize = 16;

/// Paths that are never watched, tooling writes into these constantly
pub const DEFAULT_IGNORE: &[&str] = &[".git", ".hg", ".svn", "node_modules"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Fork,
    Cluster,
}

impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Fork
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Fork => f.write_str("fork"),
            ExecMode::Cluster => f.write_str("cluster"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchSpec {
    Disabled,
    Enabled {
        /// Absolute roots to watch
        paths: Vec<PathBuf>,
        /// Glob patterns, always including [`DEFAULT_IGNORE`]
        ignore: Vec<String>,
        debounce: Duration,
    },
}

impl WatchSpec {
    pub fn is_enabled(&self) -> bool {
        matches!(self, WatchSpec::Enabled { .. })
    }
}

/// Inputs to the restart policy, see [`crate::procs::RestartPolicy`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartSettings {
    pub min_uptime: Duration,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub stop_exit_codes: Vec<i32>,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            min_uptime: DEFAULT_MIN_UPTIME,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay: Duration::ZERO,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_backoff: DEFAULT_MAX_BACKOFF,
            stop_exit_codes: Vec::new(),
        }
    }
}

/// One supervised application, never mutated after load
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppSpec {
    pub name: String,
    pub cwd: PathBuf,
    pub autorestart: bool,
    pub watch: WatchSpec,
    pub exec_mode: ExecMode,
    pub instances: usize,
    pub script: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub restart: RestartSettings,
    pub kill_timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWatch {
    Flag(bool),
    Path(String),
    Paths(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArgs {
    Line(String),
    List(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInstances {
    Count(i64),
    Named(String),
}

#[derive(Deserialize)]
struct RawApp {
    name: Option<String>,
    cwd: Option<PathBuf>,
    autorestart: Option<bool>,
    watch: Option<RawWatch>,
    #[serde(default)]
    ignore_watch: Vec<String>,
    watch_delay: Option<u64>,
    #[serde(default)]
    exec_mode: ExecMode,
    instances: Option<RawInstances>,
    script: Option<String>,
    args: Option<RawArgs>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    min_uptime: Option<u64>,
    max_restarts: Option<u32>,
    restart_delay: Option<u64>,
    exp_backoff_restart_delay: Option<u64>,
    max_backoff_delay: Option<u64>,
    #[serde(default)]
    stop_exit_codes: Vec<i32>,
    kill_timeout: Option<u64>,
}

#[derive(Deserialize)]
struct RawEcosystem {
    apps: Vec<RawApp>,
}

/// Read and normalize an ecosystem file, relative `cwd`s resolve against the file's directory
pub fn load(path: &Path) -> Result<Vec<AppSpec>, Error> {
    let json = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("could not read {}: {}", path.display(), e)))?;

    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base = fs::canonicalize(&base).unwrap_or(base);

    parse(&json, &base)
}

/// Parse ecosystem JSON, `base_dir` is the default working directory
pub fn parse(json: &str, base_dir: &Path) -> Result<Vec<AppSpec>, Error> {
    let raw: RawEcosystem =
        serde_json::from_str(json).map_err(|e| Error::config(format!("malformed ecosystem file: {}", e)))?;

    if raw.apps.is_empty() {
        return Err(Error::config("no apps defined"));
    }

    let mut names = HashSet::new();
    let mut specs = Vec::with_capacity(raw.apps.len());
    for app in raw.apps {
        let spec = normalize(app, base_dir)?;
        if !names.insert(spec.name.clone()) {
            return Err(Error::config(format!("duplicate app name: {}", spec.name)));
        }
        specs.push(spec);
    }

    Ok(specs)
}

fn normalize(raw: RawApp, base_dir: &Path) -> Result<AppSpec, Error> {
    let name = raw
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| Error::config("app is missing a name"))?;

    if name == "all" {
        return Err(Error::config("\"all\" is reserved and cannot name an app"));
    }

    let script = raw
        .script
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::config(format!("{}: script is required", name)))?;

    let cwd = match raw.cwd {
        Some(cwd) if cwd.is_absolute() => cwd,
        Some(cwd) => base_dir.join(cwd),
        None => base_dir.to_path_buf(),
    };

    let args = match raw.args {
        None => Vec::new(),
        Some(RawArgs::Line(line)) => line.split_whitespace().map(str::to_string).collect(),
        Some(RawArgs::List(list)) => list,
    };

    let watch_paths = match raw.watch {
        None | Some(RawWatch::Flag(false)) => None,
        Some(RawWatch::Flag(true)) => Some(vec![cwd.clone()]),
        Some(RawWatch::Path(path)) => Some(vec![cwd.join(path)]),
        Some(RawWatch::Paths(paths)) if paths.is_empty() => Some(vec![cwd.clone()]),
        Some(RawWatch::Paths(paths)) => Some(paths.into_iter().map(|p| cwd.join(p)).collect()),
    };

    let watch = match watch_paths {
        None => WatchSpec::Disabled,
        Some(paths) => {
            let mut ignore: Vec<String> = DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect();
            for pattern in raw.ignore_watch {
                glob::Pattern::new(&pattern).map_err(|e| {
                    Error::config(format!("{}: bad ignore_watch pattern {}: {}", name, pattern, e))
                })?;
                ignore.push(pattern);
            }

            WatchSpec::Enabled {
                paths,
                ignore,
                debounce: raw
                    .watch_delay
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_WATCH_DELAY),
            }
        }
    };

    let instances = match raw.exec_mode {
        ExecMode::Fork => 1,
        ExecMode::Cluster => cluster_size(&name, raw.instances)?,
    };

    let defaults = RestartSettings::default();
    let restart = RestartSettings {
        min_uptime: raw
            .min_uptime
            .map(Duration::from_millis)
            .unwrap_or(defaults.min_uptime),
        max_restarts: raw.max_restarts.unwrap_or(defaults.max_restarts),
        restart_delay: raw
            .restart_delay
            .map(Duration::from_millis)
            .unwrap_or(defaults.restart_delay),
        backoff_base: raw
            .exp_backoff_restart_delay
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_base),
        max_backoff: raw
            .max_backoff_delay
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_backoff),
        stop_exit_codes: raw.stop_exit_codes,
    };

    if restart.backoff_base > restart.max_backoff {
        return Err(Error::config(format!(
            "{}: exp_backoff_restart_delay exceeds max_backoff_delay",
            name
        )));
    }

    Ok(AppSpec {
        name,
        cwd,
        autorestart: raw.autorestart.unwrap_or(true),
        watch,
        exec_mode: raw.exec_mode,
        instances,
        script,
        args,
        env: raw.env,
        restart,
        kill_timeout: raw
            .kill_timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_KILL_TIMEOUT),
    })
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `max` or `0` is every core, a negative count leaves that many cores free
fn cluster_size(name: &str, instances: Option<RawInstances>) -> Result<usize, Error> {
    let cores = available_parallelism() as i64;
    let count = match instances {
        None => cores,
        Some(RawInstances::Named(ref s)) if s == "max" => cores,
        Some(RawInstances::Named(s)) => {
            return Err(Error::config(format!("{}: invalid instances: {}", name, s)))
        }
        Some(RawInstances::Count(0)) => cores,
        Some(RawInstances::Count(n)) if n < 0 => cores + n,
        Some(RawInstances::Count(n)) => n,
    };

    let count = count.max(1) as usize;
    let limit = cores as usize * MAX_INSTANCES_PER_CORE;
    if count > limit {
        return Err(Error::config(format!(
            "{}: {} instances is more than the limit of {} on {} cores",
            name, count, limit, cores
        )));
    }

    Ok(count)
}
