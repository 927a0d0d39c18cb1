// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use tokio::runtime;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use minium::dump::Snapshot;
use minium::msg::{Request, Response, Target};
use minium::procs::{ClusterStatus, LogLine, Stream};
use minium::{config, ipc, ControlPlane, Error};

const CONFIG: &str = "config";
const SOCKET: &str = "socket";
const DUMP: &str = "dump";
const TARGET: &str = "target";
const LINES: &str = "lines";

const DAEMON: &str = "daemon";
const START: &str = "start";
const STOP: &str = "stop";
const RESTART: &str = "restart";
const RESET: &str = "reset";
const STATUS: &str = "status";
const LOGS: &str = "logs";

const SAVE_INTERVAL: Duration = Duration::from_secs(5);

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn target_arg(self, required: bool) -> Self;
}

impl<'a, 'b> SetupClapApp for App<'a, 'b> {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }

    fn target_arg(self, required: bool) -> Self {
        self.arg(
            Arg::with_name(TARGET)
                .value_name("APP")
                .required(required)
                .help("app name, or all"),
        )
    }
}

fn daemon_sub_command() -> App<'static, 'static> {
    SubCommand::with_name(DAEMON)
        .about("run the supervisor in the foreground")
        .arg(
            Arg::with_name(CONFIG)
                .short("c")
                .long(CONFIG)
                .value_name("FILE")
                .required(true)
                .takes_value(true)
                .help("ecosystem file listing the apps to supervise"),
        )
        .arg(
            Arg::with_name(DUMP)
                .short("d")
                .long(DUMP)
                .value_name("FILE")
                .takes_value(true)
                .help("snapshot file used to detect processes left behind by a previous daemon"),
        )
}

fn default_socket() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("minium.sock")
}

fn main() {
    let args = App::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name(SOCKET)
                .short("s")
                .long(SOCKET)
                .value_name("PATH")
                .takes_value(true)
                .global(true)
                .help("control socket of the daemon"),
        )
        .subcommand(daemon_sub_command().setup_clap_app())
        .subcommand(
            SubCommand::with_name(START)
                .about("start an app")
                .target_arg(true),
        )
        .subcommand(SubCommand::with_name(STOP).about("stop an app").target_arg(true))
        .subcommand(
            SubCommand::with_name(RESTART)
                .about("rolling restart of an app")
                .target_arg(true),
        )
        .subcommand(
            SubCommand::with_name(RESET)
                .about("reset restart counters of an app")
                .target_arg(true),
        )
        .subcommand(
            SubCommand::with_name(STATUS)
                .about("show the state of every instance")
                .target_arg(false),
        )
        .subcommand(
            SubCommand::with_name(LOGS)
                .about("show recent output of an app")
                .target_arg(true)
                .arg(
                    Arg::with_name(LINES)
                        .short("n")
                        .long(LINES)
                        .value_name("NUMBER")
                        .takes_value(true)
                        .default_value("50")
                        .validator(|n| {
                            n.parse::<usize>()
                                .map(|_| ())
                                .map_err(|_| "number was expected".to_string())
                        }),
                ),
        )
        .get_matches();

    let runtime = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to initialize tokio runtime: {}", e);
            std::process::exit(2);
        }
    };

    let code = runtime.block_on(async move {
        let (name, sub_args) = args.subcommand();
        let sub_args = match sub_args {
            Some(sub_args) => sub_args,
            None => {
                println!("{}", args.usage());
                return 2;
            }
        };

        let socket = sub_args
            .value_of_os(SOCKET)
            .map(PathBuf::from)
            .unwrap_or_else(default_socket);

        if name == DAEMON {
            return match daemon(sub_args, &socket).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("minium: {}", e);
                    e.exit_code()
                }
            };
        }

        let target = Target::from(sub_args.value_of(TARGET).unwrap_or("all"));
        let request = match name {
            START => Request::Start(target),
            STOP => Request::Stop(target),
            RESTART => Request::Restart(target),
            RESET => Request::Reset(target),
            STATUS => Request::Status(target),
            LOGS => Request::Logs {
                app: target.to_string(),
                lines: sub_args
                    .value_of(LINES)
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(50),
            },
            other => {
                println!("unexpected argument: {}", other);
                println!("{}", args.usage());
                return 2;
            }
        };

        client(&socket, request).await
    });

    std::process::exit(code)
}

async fn daemon(args: &ArgMatches<'_>, socket: &Path) -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args
        .value_of_os(CONFIG)
        .map(PathBuf::from)
        .ok_or_else(|| Error::config("--config is required"))?;
    let specs = config::load(&config)?;
    info!("loaded {} apps from {}", specs.len(), config.display());

    let dump = args.value_of_os(DUMP).map(PathBuf::from);
    let previous = match dump.as_deref().map(Snapshot::load) {
        Some(Ok(previous)) => previous,
        Some(Err(e)) => {
            warn!("ignoring unreadable snapshot: {}", e);
            None
        }
        None => None,
    };
    if let Some(previous) = &previous {
        previous.reap_orphans();
    }

    let listener = ipc::bind(socket)?;
    let control = Arc::new(ControlPlane::init(specs));
    control.resume(previous.as_ref()).await?;
    info!("minium listening on {}", socket.display());

    let saver = dump.clone().map(|path| {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAVE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = control.snapshot().save(&path) {
                    warn!("failed to save snapshot to {}: {}", path.display(), e);
                }
            }
        })
    });

    let served = ipc::serve(listener, Arc::clone(&control), shutdown_signal()).await;

    if let Some(saver) = saver {
        saver.abort();
    }
    let last = control.teardown().await;

    if let Some(path) = dump {
        last.save(&path)?;
    }
    if let Err(e) = std::fs::remove_file(socket) {
        warn!("failed to remove {}: {}", socket.display(), e);
    }

    served
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = terminate.recv() => info!("terminated"),
    }
}

async fn client(socket: &Path, request: Request) -> i32 {
    match ipc::request(socket, &request).await {
        Ok(Response::Status(statuses)) => {
            print_status(&statuses);
            0
        }
        Ok(Response::Logs(lines)) => {
            print_logs(&lines);
            0
        }
        Ok(Response::Error { code, message }) => {
            eprintln!("minium: {}", message);
            code.exit_code()
        }
        Err(e) => {
            eprintln!("minium: {}", e);
            e.exit_code()
        }
    }
}

fn print_status(statuses: &[ClusterStatus]) {
    println!(
        "{:<20} {:>3} {:<8} {:<11} {:>7} {:>8} {:>8} {:>9}  {}",
        "app", "id", "mode", "phase", "pid", "restarts", "failures", "uptime", "last exit"
    );

    for status in statuses {
        for instance in &status.instances {
            println!(
                "{:<20} {:>3} {:<8} {:<11} {:>7} {:>8} {:>8} {:>9}  {}",
                status.name,
                instance.index,
                status.exec_mode,
                instance.phase,
                instance
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                instance.restart_count,
                instance.consecutive_failures,
                instance
                    .uptime()
                    .map(|u| format!("{}s", u.as_secs()))
                    .unwrap_or_else(|| "-".to_string()),
                instance
                    .last_error
                    .clone()
                    .or_else(|| instance.last_exit.map(|e| e.status.to_string()))
                    .unwrap_or_default(),
            );
        }
        println!(
            "{}: {} ({}/{} running{})",
            status.name,
            status.health(),
            status.running(),
            status.instances.len(),
            if status.watching { ", watching" } else { "" }
        );
    }
}

fn print_logs(lines: &[LogLine]) {
    for line in lines {
        let stream = match line.stream {
            Stream::Stdout => "out",
            Stream::Stderr => "err",
        };
        println!("{} {} | {}", line.instance, stream, line.line);
    }
}
