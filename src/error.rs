// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Reasons a process could not be spawned
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("permission denied executing: {0}")]
    PermissionDenied(String),
    #[error("working directory does not exist: {}", .0.display())]
    CwdMissing(PathBuf),
    #[error("failed to spawn {0}: {1}")]
    Io(String, #[source] io::Error),
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error")]
    IoError(#[from] io::Error),
    #[error("nix error")]
    NixError(#[from] nix::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("spawn error: {0}")]
    SpawnError(#[from] SpawnError),
    #[error("process {0} is not running")]
    NotRunning(u32),
    #[error("watch error: {0}")]
    WatchError(String),
    #[error("no app named: {0}")]
    UnknownApp(String),
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::ConfigError(msg.into()))
    }

    pub fn watch(msg: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::WatchError(msg.into()))
    }

    pub fn unknown_app(name: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::UnknownApp(name.into()))
    }

    pub fn not_running(pid: u32) -> Self {
        Self::from_kind(ErrorKind::NotRunning(pid))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// The CLI exit code associated with this error, 1 for unknown apps and 2 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.0 {
            ErrorKind::UnknownApp(_) => 1,
            _ => 2,
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}
