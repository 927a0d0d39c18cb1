// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::config::AppSpec;
use crate::dump::Snapshot;
use crate::ipc::Handler;
use crate::msg::{Request, Response, Target};
use crate::procs::{ClusterManager, ClusterStatus, LogLine};
use crate::Error;

/// Operator facing registry of every supervised app
///
/// Rules:
///   - commands are accepted once every targeted instance has recorded them
///   - an unknown app is an error and changes nothing
///   - repeating a command is harmless, stopping a stopped app succeeds
pub struct ControlPlane {
    apps: BTreeMap<String, ClusterManager>,
}

impl ControlPlane {
    /// Build a cluster for every app, nothing is started yet. Must be called within a runtime.
    pub fn init(specs: Vec<AppSpec>) -> Self {
        let apps = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), ClusterManager::new(spec)))
            .collect();

        Self { apps }
    }

    pub fn app_names(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }

    pub fn app(&self, name: &str) -> Option<&ClusterManager> {
        self.apps.get(name)
    }

    fn select(&self, target: &Target) -> Result<Vec<&ClusterManager>, Error> {
        match target {
            Target::All => Ok(self.apps.values().collect()),
            Target::App(name) => self
                .apps
                .get(name)
                .map(|app| vec![app])
                .ok_or_else(|| Error::unknown_app(name.as_str())),
        }
    }

    pub async fn start(&self, target: &Target) -> Result<Vec<ClusterStatus>, Error> {
        let apps = self.select(target)?;
        join_all(apps.iter().map(|app| app.start()))
            .await
            .into_iter()
            .collect::<Result<(), Error>>()?;
        self.status(target)
    }

    pub async fn stop(&self, target: &Target) -> Result<Vec<ClusterStatus>, Error> {
        let apps = self.select(target)?;
        join_all(apps.iter().map(|app| app.stop()))
            .await
            .into_iter()
            .collect::<Result<(), Error>>()?;
        self.status(target)
    }

    /// Rolling restart of each targeted app, apps roll concurrently
    pub async fn restart(&self, target: &Target) -> Result<Vec<ClusterStatus>, Error> {
        let apps = self.select(target)?;
        join_all(apps.iter().map(|app| app.restart()))
            .await
            .into_iter()
            .collect::<Result<(), Error>>()?;
        self.status(target)
    }

    pub async fn reset(&self, target: &Target) -> Result<Vec<ClusterStatus>, Error> {
        let apps = self.select(target)?;
        join_all(apps.iter().map(|app| app.reset()))
            .await
            .into_iter()
            .collect::<Result<(), Error>>()?;
        self.status(target)
    }

    pub fn status(&self, target: &Target) -> Result<Vec<ClusterStatus>, Error> {
        Ok(self
            .select(target)?
            .into_iter()
            .map(ClusterManager::status)
            .collect())
    }

    pub fn logs(&self, app: &str, lines: usize) -> Result<Vec<LogLine>, Error> {
        self.apps
            .get(app)
            .map(|app| app.logs(lines))
            .ok_or_else(|| Error::unknown_app(app))
    }

    pub fn snapshot(&self) -> Snapshot {
        let statuses: Vec<ClusterStatus> = self.apps.values().map(ClusterManager::status).collect();
        Snapshot::from_status(&statuses)
    }

    /// Start every app, except those a previous snapshot recorded as stopped
    pub async fn resume(&self, previous: Option<&Snapshot>) -> Result<(), Error> {
        let stopped = previous.map(Snapshot::stopped_apps).unwrap_or_default();

        for (name, app) in &self.apps {
            if stopped.contains(&name.as_str()) {
                info!("{} was stopped, leaving it stopped", name);
                continue;
            }
            app.start().await?;
        }

        Ok(())
    }

    /// Snapshot the apps as they run now, then shut them all down
    pub async fn teardown(&self) -> Snapshot {
        let snapshot = self.snapshot();
        self.shutdown().await;
        snapshot
    }

    /// Stop every app and end all supervisors
    pub async fn shutdown(&self) {
        info!("shutting down {} apps", self.apps.len());
        join_all(self.apps.values().map(ClusterManager::shutdown)).await;
    }
}

#[async_trait]
impl Handler for ControlPlane {
    async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Start(target) => self.start(&target).await.map(Response::Status),
            Request::Stop(target) => self.stop(&target).await.map(Response::Status),
            Request::Restart(target) => self.restart(&target).await.map(Response::Status),
            Request::Reset(target) => self.reset(&target).await.map(Response::Status),
            Request::Status(target) => self.status(&target).map(Response::Status),
            Request::Logs { app, lines } => self.logs(&app, lines).map(Response::Logs),
        };

        result.unwrap_or_else(|e| {
            warn!("request failed: {}", e);
            Response::from(e)
        })
    }
}
