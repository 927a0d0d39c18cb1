// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Restart-on-change support
//!
//! The watcher polls the watched trees and compares modification times and sizes, bursts of
//! changes are coalesced into a single [`WatchEvent`] once the tree has been quiet for the
//! debounce window.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures::stream::{self, BoxStream, StreamExt};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::Error;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    /// First path changed in the burst
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: SystemTime,
    /// Number of changes coalesced into this event
    pub coalesced: usize,
}

/// Events from a [`FileWatcher`], dropping the stream unsubscribes
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Ignore rules, a pattern matches either the path relative to its root or any one component
#[derive(Clone, Debug)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self, Error> {
        let patterns = globs
            .iter()
            .map(|g| {
                Pattern::new(g.as_ref())
                    .map_err(|e| Error::watch(format!("bad pattern {}: {}", g.as_ref(), e)))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, relative: &Path) -> bool {
        self.patterns.iter().any(|p| {
            p.matches_path(relative)
                || relative
                    .components()
                    .any(|c| p.matches(&c.as_os_str().to_string_lossy()))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

type Tree = HashMap<PathBuf, Stamp>;

fn stamp(meta: &fs::Metadata) -> Stamp {
    Stamp {
        modified: meta.modified().ok(),
        len: meta.len(),
    }
}

/// Snapshot all the non-ignored files and directories below `roots`
fn scan(roots: &[PathBuf], ignore: &IgnoreSet) -> Tree {
    let mut tree = Tree::new();
    for root in roots {
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => scan_dir(root, root, ignore, &mut tree),
            Ok(meta) => {
                tree.insert(root.clone(), stamp(&meta));
            }
            Err(e) => trace!("{} not readable: {}", root.display(), e),
        }
    }
    tree
}

fn scan_dir(root: &Path, dir: &Path, ignore: &IgnoreSet, tree: &mut Tree) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            trace!("{} not readable: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(&path);
        if ignore.is_ignored(relative) {
            continue;
        }

        // DirEntry::metadata does not follow symlinks, so linked directories are never walked
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };

        if meta.is_dir() {
            scan_dir(root, &path, ignore, tree);
        }
        tree.insert(path, stamp(&meta));
    }
}

/// Changes between two snapshots, in path order so that reports are stable
fn diff(before: &Tree, after: &Tree) -> Vec<(PathBuf, ChangeKind)> {
    let mut changes: Vec<_> = after
        .iter()
        .filter_map(|(path, stamp)| match before.get(path) {
            None => Some((path.clone(), ChangeKind::Created)),
            Some(old) if old != stamp => Some((path.clone(), ChangeKind::Modified)),
            Some(_) => None,
        })
        .chain(
            before
                .keys()
                .filter(|path| !after.contains_key(*path))
                .map(|path| (path.clone(), ChangeKind::Removed)),
        )
        .collect();

    changes.sort();
    changes
}

/// Trailing edge debounce, an event is released once `window` passes without further changes
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: Option<(WatchEvent, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    pub fn push(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        match self.pending {
            Some((ref mut event, ref mut last)) => {
                event.coalesced += 1;
                *last = now;
            }
            None => {
                let event = WatchEvent {
                    path,
                    kind,
                    timestamp: SystemTime::now(),
                    coalesced: 1,
                };
                self.pending = Some((event, now));
            }
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<WatchEvent> {
        match self.pending {
            Some((_, last)) if now.saturating_duration_since(last) >= self.window => {
                self.pending.take().map(|(event, _)| event)
            }
            _ => None,
        }
    }
}

/// Polls a set of roots and broadcasts debounced change events to every subscriber
///
/// Dropping the watcher stops polling and ends all subscriptions.
#[derive(Debug)]
pub struct FileWatcher {
    sender: broadcast::Sender<WatchEvent>,
    task: JoinHandle<()>,
}

impl FileWatcher {
    pub fn new<S: AsRef<str>>(
        roots: Vec<PathBuf>,
        ignore: &[S],
        debounce: Duration,
    ) -> Result<Self, Error> {
        Self::with_interval(roots, ignore, debounce, POLL_INTERVAL)
    }

    pub fn with_interval<S: AsRef<str>>(
        roots: Vec<PathBuf>,
        ignore: &[S],
        debounce: Duration,
        interval: Duration,
    ) -> Result<Self, Error> {
        if roots.is_empty() {
            return Err(Error::watch("nothing to watch"));
        }

        for root in &roots {
            if !root.exists() {
                return Err(Error::watch(format!("{} does not exist", root.display())));
            }
        }

        let ignore = IgnoreSet::new(ignore)?;
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(poll(roots, ignore, debounce, interval, sender.clone()));

        Ok(Self { sender, task })
    }

    /// A new subscription, only changes detected after this call are delivered
    pub fn subscribe(&self) -> WatchStream {
        let receiver = self.sender.subscribe();

        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(missed)) => {
                        debug!("watch subscriber lagged, {} events dropped", missed)
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll(
    roots: Vec<PathBuf>,
    ignore: IgnoreSet,
    debounce: Duration,
    interval: Duration,
    sender: broadcast::Sender<WatchEvent>,
) {
    let scan_roots = roots.clone();
    let scan_ignore = ignore.clone();
    let mut tree = match tokio::task::spawn_blocking(move || scan(&scan_roots, &scan_ignore)).await {
        Ok(tree) => tree,
        Err(e) => {
            warn!("initial watch scan failed: {}", e);
            return;
        }
    };
    debug!("watching {} paths under {:?}", tree.len(), roots);

    let mut debouncer = Debouncer::new(debounce);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let scan_roots = roots.clone();
        let scan_ignore = ignore.clone();
        let next = match tokio::task::spawn_blocking(move || scan(&scan_roots, &scan_ignore)).await {
            Ok(next) => next,
            Err(e) => {
                warn!("watch scan failed: {}", e);
                continue;
            }
        };

        let now = Instant::now();
        for (path, kind) in diff(&tree, &next) {
            trace!("{:?} {}", kind, path.display());
            debouncer.push(path, kind, now);
        }
        tree = next;

        if let Some(event) = debouncer.poll(now) {
            debug!(
                "change detected: {:?} {} ({} coalesced)",
                event.kind,
                event.path.display(),
                event.coalesced
            );
            // no subscribers is not an error
            let _ = sender.send(event);
        }
    }
}
