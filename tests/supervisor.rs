// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Instant};

use minium::config::{self, AppSpec};
use minium::msg::Target;
use minium::procs::{ClusterManager, Health, InstanceHandle, InstanceState, Phase};
use minium::ControlPlane;

/// An app running `sh -c <script>`, `overrides` replace the defaults
fn app(cwd: &Path, name: &str, script: &str, overrides: Value) -> AppSpec {
    let mut app = json!({
        "name": name,
        "script": "sh",
        "args": ["-c", script],
        "min_uptime": 500,
        "exp_backoff_restart_delay": 300,
        "kill_timeout": 1000,
    });

    if let (Some(app), Some(overrides)) = (app.as_object_mut(), overrides.as_object()) {
        for (key, value) in overrides {
            app.insert(key.clone(), value.clone());
        }
    }

    let ecosystem = json!({ "apps": [app] }).to_string();
    config::parse(&ecosystem, cwd)
        .expect("valid config")
        .remove(0)
}

async fn wait_until<F>(instance: &InstanceHandle, what: &str, predicate: F) -> InstanceState
where
    F: FnMut(&InstanceState) -> bool,
{
    let mut state = instance.subscribe();
    let settled = match timeout(Duration::from_secs(10), state.wait_for(predicate)).await {
        Ok(Ok(state)) => (*state).clone(),
        Ok(Err(_)) => panic!("supervisor ended waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}: {:?}", what, instance.state()),
    };
    settled
}

#[tokio::test]
async fn test_crash_then_stable_run_resets_failures() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = app(
        dir.path(),
        "web",
        // first run of each instance crashes immediately, later runs outlive min_uptime
        "f=ran.$MINIUM_INSTANCE; if [ -e $f ]; then sleep 0.8; exit 1; fi; touch $f; exit 1",
        json!({ "exec_mode": "cluster", "instances": 2, "restart_delay": 2000 }),
    );
    let cluster = ClusterManager::new(spec);
    assert_eq!(cluster.instances().len(), 2);
    cluster.start().await.expect("start");

    let instance = &cluster.instances()[0];
    let crashed = wait_until(instance, "first crash", |s| s.phase == Phase::Restarting).await;
    assert_eq!(crashed.consecutive_failures, 1);
    assert_eq!(crashed.starts, 1);
    assert_eq!(crashed.last_exit.map(|e| e.status.code()), Some(Some(1)));

    let stable = wait_until(instance, "stable exit", |s| {
        s.phase == Phase::Restarting && s.starts == 2
    })
    .await;
    assert_eq!(stable.consecutive_failures, 0);
    assert_eq!(stable.restart_count, 1);
    assert!(stable.last_exit.map(|e| e.duration).unwrap_or_default() >= Duration::from_millis(500));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_ceiling_errors_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = app(
        dir.path(),
        "crashy",
        "exit 1",
        json!({ "max_restarts": 2, "exp_backoff_restart_delay": 10, "max_backoff_delay": 20 }),
    );
    let cluster = ClusterManager::new(spec);
    cluster.start().await.expect("start");

    let instance = &cluster.instances()[0];
    let errored = wait_until(instance, "errored", |s| s.phase == Phase::Errored).await;
    assert_eq!(errored.starts, 3);
    assert_eq!(errored.consecutive_failures, 3);
    assert_eq!(cluster.status().health(), Health::Errored);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(instance.state().starts, 3);
    assert_eq!(instance.state().phase, Phase::Errored);

    cluster.reset().await.expect("reset");
    let reset = instance.state();
    assert_eq!(reset.restart_count, 0);
    assert_eq!(reset.consecutive_failures, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stop_preempts_backoff() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = app(
        dir.path(),
        "slow",
        "exit 1",
        json!({ "exp_backoff_restart_delay": 10000, "max_backoff_delay": 30000 }),
    );
    let cluster = ClusterManager::new(spec);
    cluster.start().await.expect("start");

    let instance = &cluster.instances()[0];
    wait_until(instance, "backoff", |s| s.phase == Phase::Restarting).await;

    let stopping = Instant::now();
    cluster.stop().await.expect("stop");
    assert_eq!(instance.state().phase, Phase::Stopped);
    assert!(stopping.elapsed() < Duration::from_secs(1));

    sleep(Duration::from_millis(300)).await;
    assert_eq!(instance.state().starts, 1);
    assert_eq!(instance.state().phase, Phase::Stopped);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stop_during_immediate_restarts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = app(
        dir.path(),
        "flappy",
        "exit 1",
        json!({ "exp_backoff_restart_delay": 1, "max_backoff_delay": 1, "max_restarts": 100000 }),
    );
    let cluster = ClusterManager::new(spec);
    cluster.start().await.expect("start");

    let instance = &cluster.instances()[0];
    wait_until(instance, "cycling", |s| s.starts > 5).await;

    cluster.stop().await.expect("stop");
    let stopped = wait_until(instance, "stopped", |s| s.phase == Phase::Stopped).await;

    sleep(Duration::from_millis(300)).await;
    let after = instance.state();
    assert_eq!(after.phase, Phase::Stopped);
    assert_eq!(after.starts, stopped.starts);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_watch_restart_is_not_a_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = app(
        dir.path(),
        "watched",
        "exec sleep 30",
        json!({ "watch": true, "watch_delay": 50 }),
    );
    let cluster = ClusterManager::new(spec);
    assert!(cluster.status().watching);
    cluster.start().await.expect("start");

    let instance = &cluster.instances()[0];
    let first = wait_until(instance, "running", |s| s.phase == Phase::Running).await;

    // let the watcher take its first snapshot
    sleep(Duration::from_millis(300)).await;
    fs::write(dir.path().join("index.js"), "changed").expect("write");

    let restarted = wait_until(instance, "restart on change", |s| {
        s.phase == Phase::Running && s.starts == 2
    })
    .await;
    assert_ne!(restarted.pid, first.pid);
    assert_eq!(restarted.consecutive_failures, 0);
    assert_eq!(restarted.restart_count, 1);

    // tooling writes are ignored
    fs::create_dir_all(dir.path().join("node_modules")).expect("mkdir");
    sleep(Duration::from_millis(300)).await;
    fs::write(dir.path().join("node_modules/dep.js"), "x").expect("write");
    sleep(Duration::from_millis(500)).await;
    assert_eq!(instance.state().starts, 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rolling_restart_keeps_others_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = app(
        dir.path(),
        "cluster",
        "exec sleep 30",
        json!({ "exec_mode": "cluster", "instances": 3 }),
    );
    let cluster = ClusterManager::new(spec);
    cluster.start().await.expect("start");

    for instance in cluster.instances() {
        wait_until(instance, "running", |s| s.phase == Phase::Running).await;
    }

    let max_down = Arc::new(AtomicUsize::new(0));
    let observers: Vec<_> = cluster
        .instances()
        .iter()
        .map(|instance| {
            let mut changes = instance.subscribe();
            let all: Vec<InstanceHandle> = cluster.instances().to_vec();
            let max_down = Arc::clone(&max_down);
            tokio::spawn(async move {
                while changes.changed().await.is_ok() {
                    let down = all
                        .iter()
                        .filter(|i| i.state().phase != Phase::Running)
                        .count();
                    max_down.fetch_max(down, Ordering::SeqCst);
                }
            })
        })
        .collect();

    cluster.restart().await.expect("rolling restart");

    for instance in cluster.instances() {
        let state = instance.state();
        assert_eq!(state.phase, Phase::Running);
        assert_eq!(state.starts, 2);
        assert_eq!(state.restart_count, 1);
    }
    assert!(max_down.load(Ordering::SeqCst) <= 1);
    assert_eq!(cluster.status().health(), Health::Online);

    for observer in observers {
        observer.abort();
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_retried_under_policy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = app(
        dir.path(),
        "missing",
        "",
        json!({ "max_restarts": 1, "exp_backoff_restart_delay": 10, "max_backoff_delay": 20 }),
    );
    spec.script = "/definitely/not/a/real/binary".to_string();

    let cluster = ClusterManager::new(spec);
    cluster.start().await.expect("start");

    let errored = wait_until(&cluster.instances()[0], "errored", |s| s.phase == Phase::Errored).await;
    assert_eq!(errored.starts, 2);
    assert!(errored.last_error.unwrap_or_default().contains("not found"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_no_autorestart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = app(dir.path(), "once", "exit 0", json!({ "autorestart": false }));
    let cluster = ClusterManager::new(spec);
    cluster.start().await.expect("start");

    let instance = &cluster.instances()[0];
    let stopped = wait_until(instance, "stopped", |s| s.phase == Phase::Stopped && s.starts == 1).await;
    assert_eq!(stopped.last_exit.map(|e| e.status.success()), Some(true));

    sleep(Duration::from_millis(200)).await;
    assert_eq!(instance.state().starts, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_output_keeps_app_alive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = app(
        dir.path(),
        "binary",
        "printf 'a\\377b\\n'; sleep 0.3; i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done; exit 0",
        json!({ "autorestart": false }),
    );
    let cluster = ClusterManager::new(spec);
    cluster.start().await.expect("start");

    let instance = &cluster.instances()[0];
    let stopped = wait_until(instance, "stopped", |s| s.phase == Phase::Stopped && s.starts == 1).await;
    assert_eq!(stopped.last_exit.map(|e| e.status.success()), Some(true));

    sleep(Duration::from_millis(200)).await;
    let logs = cluster.logs(1000);
    assert_eq!(logs.len(), 201);
    assert_eq!(logs[0].line, "a\u{fffd}b");
    assert_eq!(logs[200].line, "line199");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stop_all_with_one_backing_off() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = vec![
        app(
            dir.path(),
            "crashy",
            "exit 1",
            json!({ "exp_backoff_restart_delay": 10000, "max_backoff_delay": 30000 }),
        ),
        app(dir.path(), "steady", "echo hello; exec sleep 30", json!({})),
    ];
    let control = ControlPlane::init(specs);
    control.start(&Target::All).await.expect("start all");

    let crashy = &control.app("crashy").expect("crashy").instances()[0];
    let steady = &control.app("steady").expect("steady").instances()[0];
    wait_until(crashy, "backoff", |s| s.phase == Phase::Restarting).await;
    wait_until(steady, "running", |s| s.phase == Phase::Running).await;

    control.stop(&Target::All).await.expect("stop all");
    wait_until(crashy, "crashy stopped", |s| s.phase == Phase::Stopped).await;
    wait_until(steady, "steady stopped", |s| s.phase == Phase::Stopped).await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(crashy.state().starts, 1);

    // stopping again is a no-op success
    let statuses = control.stop(&Target::All).await.expect("stop again");
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.health() == Health::Stopped));

    let logs = control.logs("steady", 10).expect("logs");
    assert!(logs.iter().any(|l| l.line == "hello"));

    control.shutdown().await;
}

#[tokio::test]
async fn test_unknown_app() {
    let dir = tempfile::tempdir().expect("tempdir");
    let control = ControlPlane::init(vec![app(dir.path(), "web", "exec sleep 30", json!({}))]);
    let missing = Target::App("nope".to_string());

    let err = control.start(&missing).await.expect_err("unknown app");
    assert_eq!(err.exit_code(), 1);
    assert!(control.stop(&missing).await.is_err());
    assert!(control.restart(&missing).await.is_err());
    assert!(control.status(&missing).is_err());
    assert!(control.logs("nope", 10).is_err());

    // nothing was started
    let statuses = control.status(&Target::All).expect("status");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].health(), Health::Stopped);

    control.shutdown().await;
}

#[tokio::test]
async fn test_teardown_resumes_running_apps_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = || {
        vec![
            app(dir.path(), "api", "exec sleep 30", json!({})),
            app(dir.path(), "web", "exec sleep 30", json!({})),
        ]
    };

    let first = ControlPlane::init(specs());
    first
        .start(&Target::App("web".to_string()))
        .await
        .expect("start web");
    wait_until(
        &first.app("web").expect("web").instances()[0],
        "running",
        |s| s.phase == Phase::Running,
    )
    .await;
    let snapshot = first.teardown().await;
    assert_eq!(snapshot.stopped_apps(), vec!["api"]);

    let second = ControlPlane::init(specs());
    second.resume(Some(&snapshot)).await.expect("resume");

    let web = &second.app("web").expect("web").instances()[0];
    wait_until(web, "running", |s| s.phase == Phase::Running).await;
    assert_eq!(
        second.app("api").expect("api").instances()[0].state().phase,
        Phase::Stopped
    );

    second.shutdown().await;
}
