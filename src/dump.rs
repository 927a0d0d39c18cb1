// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Instance snapshots persisted across supervisor restarts
//!
//! A pid found alive in the snapshot at startup belongs to a process that outlived its
//! supervisor, it cannot be reattached to so it is terminated before the apps start again.

use std::fs;
use std::io;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::procs::{ClusterStatus, Phase};
use crate::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub index: usize,
    pub pid: Option<u32>,
    pub phase: Phase,
    pub restart_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub instances: Vec<InstanceRecord>,
}

impl Snapshot {
    pub fn from_status<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a ClusterStatus>,
    {
        let instances = statuses
            .into_iter()
            .flat_map(|status| status.instances.iter())
            .map(|instance| InstanceRecord {
                name: instance.name.clone(),
                index: instance.index,
                pid: instance.pid,
                phase: instance.phase,
                restart_count: instance.restart_count,
            })
            .collect();

        Self { instances }
    }

    /// Write atomically, through a temporary file renamed over `path`
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let bytes = bincode::serialize(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        debug!("saved {} instances to {}", self.instances.len(), path.display());
        Ok(())
    }

    /// `None` if nothing has been saved yet
    pub fn load(path: &Path) -> Result<Option<Self>, Error> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(bincode::deserialize(&bytes)?))
    }

    /// Apps recorded with every instance stopped, these were stopped by the operator
    pub fn stopped_apps(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.instances.iter().map(|i| i.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.retain(|name| {
            self.instances
                .iter()
                .filter(|i| i.name == *name)
                .all(|i| i.phase == Phase::Stopped)
        });
        names
    }

    /// Records whose process is still alive
    pub fn orphans(&self) -> Vec<&InstanceRecord> {
        self.instances
            .iter()
            .filter(|i| i.pid.map(is_alive).unwrap_or(false))
            .collect()
    }

    /// Send SIGTERM to every orphan, returns how many were signaled
    pub fn reap_orphans(&self) -> usize {
        let mut reaped = 0;
        for orphan in self.orphans() {
            let pid = match orphan.pid {
                Some(pid) => pid,
                None => continue,
            };

            warn!(
                "{}:{} left running as pid {}, terminating",
                orphan.name, orphan.index, pid
            );
            match kill(Pid::from_raw(pid as libc::pid_t), Signal::SIGTERM) {
                Ok(()) => reaped += 1,
                Err(e) => info!("could not terminate orphan {}: {}", pid, e),
            }
        }
        reaped
    }
}

fn is_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as libc::pid_t), None) {
        Ok(()) => true,
        // exists, but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
