// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{AppSpec, ExecMode, WatchSpec};
use crate::procs::{InstanceHandle, InstanceState, InstanceSupervisor, LogLine, Logger, Phase};
use crate::watch::FileWatcher;
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    /// Every instance is running
    Online,
    /// Some instances are down or cycling
    Degraded,
    /// Every instance is stopped
    Stopped,
    /// At least one instance gave up restarting
    Errored,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Health::Online => "online",
            Health::Degraded => "degraded",
            Health::Stopped => "stopped",
            Health::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Point in time view of all instances of one app
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub exec_mode: ExecMode,
    pub watching: bool,
    pub instances: Vec<InstanceState>,
}

impl ClusterStatus {
    pub fn running(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.phase == Phase::Running)
            .count()
    }

    pub fn health(&self) -> Health {
        if self.instances.iter().any(|i| i.phase == Phase::Errored) {
            Health::Errored
        } else if self.running() == self.instances.len() {
            Health::Online
        } else if self.instances.iter().all(|i| i.phase == Phase::Stopped) {
            Health::Stopped
        } else {
            Health::Degraded
        }
    }
}

/// All the instances of one app
///
/// Rules:
///   - one supervisor per instance, instances never share state
///   - restarts roll through the instances one at a time
///   - one file watcher per app, shared by the instances
pub struct ClusterManager {
    spec: Arc<AppSpec>,
    instances: Vec<InstanceHandle>,
    logger: Logger,
    // held for the lifetime of the subscriptions
    watcher: Option<FileWatcher>,
    rolling: Mutex<()>,
}

impl ClusterManager {
    /// Build the supervisors, all instances start out stopped. Must be called within a runtime.
    pub fn new(spec: AppSpec) -> Self {
        let spec = Arc::new(spec);
        let logger = Logger::new(&spec.name);

        let watcher = match &spec.watch {
            WatchSpec::Disabled => None,
            WatchSpec::Enabled {
                paths,
                ignore,
                debounce,
            } => match FileWatcher::new(paths.clone(), ignore.as_slice(), *debounce) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("{}: watch disabled, {}", spec.name, e);
                    None
                }
            },
        };

        let instances = (0..spec.instances)
            .map(|index| {
                InstanceSupervisor::spawn(
                    Arc::clone(&spec),
                    index,
                    watcher.as_ref().map(FileWatcher::subscribe),
                    logger.clone(),
                )
            })
            .collect();

        Self {
            spec,
            instances,
            logger,
            watcher,
            rolling: Mutex::new(()),
        }
    }

    pub fn spec(&self) -> &AppSpec {
        &self.spec
    }

    pub fn instances(&self) -> &[InstanceHandle] {
        &self.instances
    }

    pub async fn start(&self) -> Result<(), Error> {
        info!("{}: starting {} instances", self.spec.name, self.instances.len());
        join_all(self.instances.iter().map(InstanceHandle::start))
            .await
            .into_iter()
            .collect()
    }

    pub async fn stop(&self) -> Result<(), Error> {
        info!("{}: stopping", self.spec.name);
        join_all(self.instances.iter().map(InstanceHandle::stop))
            .await
            .into_iter()
            .collect()
    }

    pub async fn reset(&self) -> Result<(), Error> {
        join_all(self.instances.iter().map(InstanceHandle::reset))
            .await
            .into_iter()
            .collect()
    }

    /// Rolling restart, the next instance is restarted only once the previous is running again
    pub async fn restart(&self) -> Result<(), Error> {
        let _rolling = self.rolling.lock().await;
        info!("{}: rolling restart", self.spec.name);

        for instance in &self.instances {
            let mut state = instance.subscribe();
            let before = state.borrow().starts;

            instance.restart().await?;

            let settled = state
                .wait_for(|s| {
                    (s.phase == Phase::Running && s.starts > before)
                        || s.phase == Phase::Stopped
                        || s.phase == Phase::Errored
                })
                .await
                .map(|s| s.clone())
                .map_err(|_| Error::from("instance supervisor is gone"))?;

            if settled.phase != Phase::Running {
                warn!(
                    "{}: rolling restart aborted, {} is {}",
                    self.spec.name,
                    settled.id(),
                    settled.phase
                );
                return Err(format!("{} is {} after restart", settled.id(), settled.phase).into());
            }
        }

        Ok(())
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            name: self.spec.name.clone(),
            exec_mode: self.spec.exec_mode,
            watching: self.watcher.is_some(),
            instances: self.instances.iter().map(InstanceHandle::state).collect(),
        }
    }

    pub fn logs(&self, lines: usize) -> Vec<LogLine> {
        self.logger.tail(lines)
    }

    /// Stop every instance and end the supervisors
    pub async fn shutdown(&self) {
        for result in join_all(self.instances.iter().map(InstanceHandle::shutdown)).await {
            if let Err(e) = result {
                warn!("{}: shutdown: {}", self.spec.name, e);
            }
        }
    }
}
