// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Inter-process communication between the CLI and the daemon.
//!
//! Rules:
//!  - one request and one response per connection
//!  - a failed connection never affects the supervised apps

use std::fs;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::msg::{self, Request, Response};
use crate::Error;

/// Answers requests received over the control socket
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Bind the control socket, replacing a stale socket file left by a previous daemon
pub fn bind(path: &Path) -> Result<UnixListener, Error> {
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(format!("a daemon is already listening on {}", path.display()).into());
        }
        fs::remove_file(path)?;
    }

    Ok(UnixListener::bind(path)?)
}

/// Accept connections until `shutdown` completes
pub async fn serve<H, F>(listener: UnixListener, handler: Arc<H>, shutdown: F) -> Result<(), Error>
where
    H: Handler,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        let stream = tokio::select! {
            _ = &mut shutdown => {
                info!("control socket closed");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("failed to accept control connection: {}", e);
                    continue;
                }
            },
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = respond(stream, handler.as_ref()).await {
                debug!("control connection failed: {}", e);
            }
        });
    }
}

async fn respond<H: Handler>(mut stream: UnixStream, handler: &H) -> Result<(), Error> {
    let request: Request = msg::recv_msg(&mut stream).await?;
    debug!("control request: {:?}", request);

    let response = handler.handle(request).await;
    msg::send_msg(&mut stream, &response).await
}

/// Send one request to the daemon listening on `path`
pub async fn request(path: &Path, request: &Request) -> Result<Response, Error> {
    let mut stream = UnixStream::connect(path).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            Error::from(format!("no daemon listening on {}", path.display()))
        }
        _ => Error::from(e),
    })?;

    msg::send_msg(&mut stream, request).await?;
    msg::recv_msg(&mut stream).await
}
