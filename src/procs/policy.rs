// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::time::Duration;

use crate::config::RestartSettings;
use crate::procs::ExitResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionReason {
    AutorestartDisabled,
    /// Exit code configured as a deliberate stop
    StopExitCode(i32),
    /// Too many consecutive short runs, the instance is errored
    CeilingExceeded,
    /// Exited before the minimum uptime, restart with backoff
    CrashLoop,
    /// Ran for at least the minimum uptime
    Stable,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::AutorestartDisabled => f.write_str("autorestart disabled"),
            DecisionReason::StopExitCode(code) => write!(f, "exit code {} stops the app", code),
            DecisionReason::CeilingExceeded => f.write_str("too many unstable restarts"),
            DecisionReason::CrashLoop => f.write_str("exited before min uptime"),
            DecisionReason::Stable => f.write_str("exited after min uptime"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartDecision {
    pub restart: bool,
    pub delay: Duration,
    pub reason: DecisionReason,
    /// Consecutive failure count after this exit
    pub consecutive_failures: u32,
}

impl RestartDecision {
    pub fn is_errored(&self) -> bool {
        self.reason == DecisionReason::CeilingExceeded
    }
}

/// Decides whether an exited instance is restarted, and after how long
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    settings: RestartSettings,
}

impl RestartPolicy {
    pub fn new(settings: RestartSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RestartSettings {
        &self.settings
    }

    /// Backoff after `failures` consecutive short runs, `base * 2^failures` capped at the max
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2_u32.saturating_pow(failures);
        self.settings
            .backoff_base
            .saturating_mul(factor)
            .min(self.settings.max_backoff)
    }

    pub fn decide(
        &self,
        exit: &ExitResult,
        consecutive_failures: u32,
        autorestart: bool,
        uptime: Duration,
    ) -> RestartDecision {
        let unstable = uptime < self.settings.min_uptime;
        let failures = if unstable {
            consecutive_failures.saturating_add(1)
        } else {
            0
        };

        let stop = |reason| RestartDecision {
            restart: false,
            delay: Duration::ZERO,
            reason,
            consecutive_failures: failures,
        };

        if !autorestart {
            return stop(DecisionReason::AutorestartDisabled);
        }

        if let Some(code) = exit.status.code() {
            if self.settings.stop_exit_codes.contains(&code) {
                return stop(DecisionReason::StopExitCode(code));
            }
        }

        if failures > self.settings.max_restarts {
            return stop(DecisionReason::CeilingExceeded);
        }

        if unstable {
            RestartDecision {
                restart: true,
                delay: self.backoff(consecutive_failures),
                reason: DecisionReason::CrashLoop,
                consecutive_failures: failures,
            }
        } else {
            RestartDecision {
                restart: true,
                delay: self.settings.restart_delay,
                reason: DecisionReason::Stable,
                consecutive_failures: failures,
            }
        }
    }
}
