// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::{FutureExt, StreamExt};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::AppSpec;
use crate::procs::{ExitResult, Logger, ProcessHandle, RestartPolicy, Stream};
use crate::watch::{WatchEvent, WatchStream};
use crate::Error;

/// Environment variable carrying the instance index to the child
pub const INSTANCE_ENV: &str = "MINIUM_INSTANCE";

const COMMAND_CAPACITY: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
    Restarting,
    Errored,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Exited => "exited",
            Phase::Restarting => "restarting",
            Phase::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// The state of one instance, published by its supervisor after every change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub name: String,
    pub index: usize,
    pub phase: Phase,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    /// Spawn attempts over the lifetime of the supervisor
    pub starts: u64,
    pub last_exit: Option<ExitResult>,
    pub last_error: Option<String>,
    pub started_at: Option<SystemTime>,
}

impl InstanceState {
    fn new(name: &str, index: usize) -> Self {
        Self {
            name: name.to_string(),
            index,
            phase: Phase::Stopped,
            pid: None,
            restart_count: 0,
            consecutive_failures: 0,
            starts: 0,
            last_exit: None,
            last_error: None,
            started_at: None,
        }
    }

    /// `name:index`
    pub fn id(&self) -> String {
        format!("{}:{}", self.name, self.index)
    }

    pub fn uptime(&self) -> Option<Duration> {
        match self.phase {
            Phase::Running => self
                .started_at
                .and_then(|started| SystemTime::now().duration_since(started).ok()),
            _ => None,
        }
    }
}

/// Requests to a supervisor, each is acknowledged once the transition is recorded
#[derive(Debug)]
enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Restart(oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Control side of a running [`InstanceSupervisor`]
#[derive(Clone, Debug)]
pub struct InstanceHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<InstanceState>,
}

impl InstanceHandle {
    async fn send(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) -> Result<(), Error> {
        let (ack, accepted) = oneshot::channel();
        self.commands
            .send(command(ack))
            .await
            .map_err(|_| Error::from("instance supervisor is gone"))?;
        accepted
            .await
            .map_err(|_| Error::from("instance supervisor dropped the command"))
    }

    pub async fn start(&self) -> Result<(), Error> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.send(Command::Stop).await
    }

    pub async fn restart(&self) -> Result<(), Error> {
        self.send(Command::Restart).await
    }

    /// Zero the restart and failure counters
    pub async fn reset(&self) -> Result<(), Error> {
        self.send(Command::Reset).await
    }

    /// Stop the process and end the supervisor
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.send(Command::Shutdown).await
    }

    pub fn state(&self) -> InstanceState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.state.clone()
    }
}

enum Flow {
    Continue,
    Shutdown,
}

enum RunningEvent {
    Exited(ExitResult),
    Command(Option<Command>),
    Changed(WatchEvent),
}

/// Owns one instance of an app and drives its lifecycle
///
/// Rules:
///   - the only owner of its process handle and state
///   - crashes are restarted under the restart policy
///   - file changes and manual restarts bypass the backoff
///   - a stop preempts any pending restart
pub struct InstanceSupervisor {
    spec: Arc<AppSpec>,
    policy: RestartPolicy,
    state: InstanceState,
    process: Option<ProcessHandle>,
    backoff: Duration,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<InstanceState>,
    watch: Option<WatchStream>,
    logger: Logger,
}

impl InstanceSupervisor {
    /// Spawn the supervisor task for instance `index` of `spec`, it starts out stopped
    pub fn spawn(
        spec: Arc<AppSpec>,
        index: usize,
        watch: Option<WatchStream>,
        logger: Logger,
    ) -> InstanceHandle {
        let state = InstanceState::new(&spec.name, index);
        let (status, state_rx) = watch::channel(state.clone());
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        let supervisor = Self {
            policy: RestartPolicy::new(spec.restart.clone()),
            spec,
            state,
            process: None,
            backoff: Duration::ZERO,
            commands,
            status,
            watch,
            logger,
        };
        tokio::spawn(supervisor.run());

        InstanceHandle {
            commands: commands_tx,
            state: state_rx,
        }
    }

    async fn run(mut self) {
        debug!("{} supervisor started", self.state.id());
        loop {
            let flow = match self.state.phase {
                Phase::Stopped | Phase::Errored => self.idle().await,
                Phase::Starting => {
                    self.start_process();
                    Flow::Continue
                }
                Phase::Running => self.supervise().await,
                Phase::Restarting => self.wait_backoff().await,
                // transient, only set while a step is in progress
                Phase::Stopping | Phase::Exited => {
                    warn!("{} left in {} phase", self.state.id(), self.state.phase);
                    self.transition(Phase::Stopped);
                    Flow::Continue
                }
            };

            if let Flow::Shutdown = flow {
                break;
            }
        }

        self.terminate().await;
        self.transition(Phase::Stopped);
        debug!("{} supervisor finished", self.state.id());
    }

    fn transition(&mut self, phase: Phase) {
        if self.state.phase != phase {
            debug!("{} {} -> {}", self.state.id(), self.state.phase, phase);
        }
        self.state.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.state.clone());
    }

    fn reset_counters(&mut self) {
        info!("{} counters reset", self.state.id());
        self.state.restart_count = 0;
        self.state.consecutive_failures = 0;
        self.publish();
    }

    /// Schedule an immediate restart, this is never a crash so the failure count is untouched
    fn restart_now(&mut self) {
        self.backoff = Duration::ZERO;
        self.transition(Phase::Restarting);
    }

    /// Stopped or errored, only commands move the instance
    async fn idle(&mut self) -> Flow {
        loop {
            let command = tokio::select! {
                command = self.commands.recv() => command,
                _ = next_change(&mut self.watch) => continue,
            };

            match command {
                None => return Flow::Shutdown,
                Some(Command::Start(ack)) => {
                    if self.state.phase == Phase::Errored {
                        self.state.consecutive_failures = 0;
                    }
                    self.transition(Phase::Starting);
                    let _ = ack.send(());
                    return Flow::Continue;
                }
                Some(Command::Restart(ack)) => {
                    if self.state.phase == Phase::Errored {
                        self.state.consecutive_failures = 0;
                    }
                    self.restart_now();
                    let _ = ack.send(());
                    return Flow::Continue;
                }
                Some(Command::Stop(ack)) => {
                    let _ = ack.send(());
                }
                Some(Command::Reset(ack)) => {
                    self.reset_counters();
                    let _ = ack.send(());
                }
                Some(Command::Shutdown(ack)) => {
                    let _ = ack.send(());
                    return Flow::Shutdown;
                }
            }
        }
    }

    fn start_process(&mut self) {
        self.state.starts += 1;

        let mut env = self.spec.env.clone();
        env.insert(INSTANCE_ENV.to_string(), self.state.index.to_string());

        let spawned = ProcessHandle::spawn(
            &self.spec.script,
            self.spec.args.as_slice(),
            &self.spec.cwd,
            &env,
        );

        match spawned {
            Ok(mut process) => {
                if let Some(stdout) = process.take_stdout() {
                    self.logger.attach(self.state.index, Stream::Stdout, stdout);
                }
                if let Some(stderr) = process.take_stderr() {
                    self.logger.attach(self.state.index, Stream::Stderr, stderr);
                }

                info!("{} started with pid {}", self.state.id(), process.pid());
                self.state.pid = Some(process.pid());
                self.state.started_at = Some(SystemTime::now());
                self.state.last_error = None;
                self.process = Some(process);

                // changes seen while the process was down are already reflected in this run
                if let Some(watch) = self.watch.as_mut() {
                    while let Some(Some(_)) = watch.next().now_or_never() {}
                }

                self.transition(Phase::Running);
            }
            Err(e) => {
                warn!("{} failed to start: {}", self.state.id(), e);
                self.state.last_error = Some(e.to_string());
                self.on_exit(ExitResult::spawn_failed());
            }
        }
    }

    async fn supervise(&mut self) -> Flow {
        if self.process.is_none() {
            self.transition(Phase::Stopped);
            return Flow::Continue;
        }

        let event = {
            let process = match self.process.as_mut() {
                Some(process) => process,
                None => return Flow::Continue,
            };

            tokio::select! {
                result = process.wait() => RunningEvent::Exited(result),
                command = self.commands.recv() => RunningEvent::Command(command),
                change = next_change(&mut self.watch) => RunningEvent::Changed(change),
            }
        };

        match event {
            RunningEvent::Exited(result) => {
                self.process = None;
                self.on_exit(result);
            }
            RunningEvent::Command(None) => return Flow::Shutdown,
            RunningEvent::Command(Some(command)) => match command {
                Command::Start(ack) => {
                    let _ = ack.send(());
                }
                Command::Stop(ack) => {
                    self.transition(Phase::Stopping);
                    let _ = ack.send(());
                    self.terminate().await;
                    self.transition(Phase::Stopped);
                }
                Command::Restart(ack) => {
                    self.transition(Phase::Stopping);
                    let _ = ack.send(());
                    self.terminate().await;
                    self.restart_now();
                }
                Command::Reset(ack) => {
                    self.reset_counters();
                    let _ = ack.send(());
                }
                Command::Shutdown(ack) => {
                    self.transition(Phase::Stopping);
                    self.terminate().await;
                    self.transition(Phase::Stopped);
                    let _ = ack.send(());
                    return Flow::Shutdown;
                }
            },
            RunningEvent::Changed(change) => {
                info!(
                    "{} restarting, {} {:?}",
                    self.state.id(),
                    change.path.display(),
                    change.kind
                );
                self.transition(Phase::Stopping);
                self.terminate().await;
                self.restart_now();
            }
        }

        Flow::Continue
    }

    /// SIGTERM, then SIGKILL once the kill timeout passes
    async fn terminate(&mut self) {
        let mut process = match self.process.take() {
            Some(process) => process,
            None => return,
        };

        // an exit racing the signal is fine, wait collects it either way
        if let Err(e) = process.signal(Signal::SIGTERM) {
            debug!("{} terminate: {}", self.state.id(), e);
        }

        let result = match time::timeout(self.spec.kill_timeout, process.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, killing",
                    self.state.id(),
                    self.spec.kill_timeout
                );
                if let Err(e) = process.signal(Signal::SIGKILL) {
                    debug!("{} kill: {}", self.state.id(), e);
                }
                process.wait().await
            }
        };

        info!("{} stopped, {}", self.state.id(), result.status);
        self.state.last_exit = Some(result);
        self.state.pid = None;
        self.publish();
    }

    fn on_exit(&mut self, result: ExitResult) {
        self.state.pid = None;
        self.state.last_exit = Some(result);
        self.transition(Phase::Exited);

        let decision = self.policy.decide(
            &result,
            self.state.consecutive_failures,
            self.spec.autorestart,
            result.duration,
        );
        self.state.consecutive_failures = decision.consecutive_failures;

        if decision.restart {
            info!(
                "{} exited with {}, {}, restarting in {:?}",
                self.state.id(),
                result.status,
                decision.reason,
                decision.delay
            );
            self.backoff = decision.delay;
            self.transition(Phase::Restarting);
        } else if decision.is_errored() {
            error!(
                "{} exited with {}, {} ({} consecutive), giving up",
                self.state.id(),
                result.status,
                decision.reason,
                decision.consecutive_failures
            );
            self.transition(Phase::Errored);
        } else {
            info!(
                "{} exited with {}, {}",
                self.state.id(),
                result.status,
                decision.reason
            );
            self.transition(Phase::Stopped);
        }
    }

    /// The restart delay, a stop cancels it and a start or restart cuts it short
    async fn wait_backoff(&mut self) -> Flow {
        let delay = time::sleep_until(Instant::now() + self.backoff);
        tokio::pin!(delay);

        loop {
            // a queued stop must win over an elapsed delay
            let command = tokio::select! {
                biased;
                command = self.commands.recv() => command,
                _ = &mut delay => {
                    self.state.restart_count += 1;
                    self.transition(Phase::Starting);
                    return Flow::Continue;
                }
                _ = next_change(&mut self.watch) => continue,
            };

            match command {
                None => return Flow::Shutdown,
                Some(Command::Stop(ack)) => {
                    self.transition(Phase::Stopped);
                    let _ = ack.send(());
                    return Flow::Continue;
                }
                Some(Command::Start(ack)) | Some(Command::Restart(ack)) => {
                    self.state.restart_count += 1;
                    self.transition(Phase::Starting);
                    let _ = ack.send(());
                    return Flow::Continue;
                }
                Some(Command::Reset(ack)) => {
                    self.reset_counters();
                    let _ = ack.send(());
                }
                Some(Command::Shutdown(ack)) => {
                    self.transition(Phase::Stopped);
                    let _ = ack.send(());
                    return Flow::Shutdown;
                }
            }
        }
    }
}

/// The next change, pending forever without a subscription or once it has ended
async fn next_change(watch: &mut Option<WatchStream>) -> WatchEvent {
    if let Some(stream) = watch.as_mut() {
        if let Some(change) = stream.next().await {
            return change;
        }
        debug!("watch subscription ended");
        *watch = None;
    }

    future::pending().await
}
