// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Supervised processes, from a single OS process up to a cluster of instances

mod cluster;
mod handle;
mod logger;
mod policy;
mod supervisor;

pub use cluster::{ClusterManager, ClusterStatus, Health};
pub use handle::{ExitResult, ExitStatus, ProcessHandle};
pub use logger::{LogLine, Logger, Stream};
pub use policy::{DecisionReason, RestartDecision, RestartPolicy};
pub use supervisor::{InstanceHandle, InstanceState, InstanceSupervisor, Phase, INSTANCE_ENV};
