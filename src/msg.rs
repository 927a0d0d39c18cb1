// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Messages between the CLI and the daemon
//!
//! Every frame is a big endian `u32` length followed by that many bytes of bincode.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ErrorKind;
use crate::procs::{ClusterStatus, LogLine};
use crate::Error;

pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Which apps a command applies to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    All,
    App(String),
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        match s {
            "all" => Target::All,
            name => Target::App(name.to_string()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("all"),
            Target::App(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Start(Target),
    Stop(Target),
    Restart(Target),
    Reset(Target),
    Status(Target),
    Logs { app: String, lines: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    Failed,
}

impl ErrorCode {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::NotFound => 1,
            ErrorCode::Failed => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Status(Vec<ClusterStatus>),
    Logs(Vec<LogLine>),
    Error { code: ErrorCode, message: String },
}

impl From<Error> for Response {
    fn from(err: Error) -> Self {
        let code = match err.kind() {
            ErrorKind::UnknownApp(_) => ErrorCode::NotFound,
            _ => ErrorCode::Failed,
        };

        Response::Error {
            code,
            message: err.to_string(),
        }
    }
}

pub async fn send_msg<W, T>(writer: &mut W, msg: &T) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(msg)?;
    if bytes.len() > MAX_FRAME {
        return Err(format!("message of {} bytes is too large", bytes.len()).into());
    }

    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn recv_msg<R, T>(reader: &mut R) -> Result<T, Error>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(format!("message of {} bytes is too large", len).into());
    }

    let mut bytes = vec![0_u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bincode::deserialize(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target() {
        assert_eq!(Target::from("all"), Target::All);
        assert_eq!(Target::from("web"), Target::App("web".to_string()));
        assert_eq!(Target::from("web").to_string(), "web");
    }

    #[test]
    fn test_error_response() {
        let response = Response::from(Error::unknown_app("nope"));
        match response {
            Response::Error { code, message } => {
                assert_eq!(code, ErrorCode::NotFound);
                assert_eq!(code.exit_code(), 1);
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected {:?}", other),
        }

        match Response::from(Error::config("bad")) {
            Response::Error { code, .. } => assert_eq!(code.exit_code(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = Request::Logs {
            app: "web".to_string(),
            lines: 20,
        };
        send_msg(&mut client, &request).await.expect("send");
        let received: Request = recv_msg(&mut server).await.expect("recv");
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_u32(MAX_FRAME as u32 + 1)
            .await
            .expect("write length");

        let result: Result<Request, _> = recv_msg(&mut server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(10).await.expect("write length");
        client.write_all(&[1, 2, 3]).await.expect("write body");
        drop(client);

        let result: Result<Request, _> = recv_msg(&mut server).await;
        assert!(result.is_err());
    }
}
