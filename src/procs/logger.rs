// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

pub const DEFAULT_CAPACITY: usize = 1000;

/// Longer lines are truncated, the rest of the line is read and dropped
pub const MAX_LINE: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub instance: usize,
    pub stream: Stream,
    pub timestamp: SystemTime,
    pub line: String,
}

/// Captures the output of every instance of one app
///
/// Rules:
///   - each line is forwarded to tracing under the `minium::app` target
///   - the most recent lines are kept in memory for `logs <app>`
#[derive(Clone, Debug)]
pub struct Logger {
    app: Arc<str>,
    lines: Arc<Mutex<VecDeque<LogLine>>>,
    capacity: usize,
}

impl Logger {
    pub fn new(app: &str) -> Self {
        Self::with_capacity(app, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(app: &str, capacity: usize) -> Self {
        Self {
            app: Arc::from(app),
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Read `output` line by line until it closes
    ///
    /// The output is drained to the end even when it is not valid UTF-8 or cannot be read,
    /// a closed pipe would kill the child with SIGPIPE on its next write.
    pub fn attach<R>(&self, instance: usize, stream: Stream, output: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logger = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(output);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match read_line(&mut reader, &mut buf, MAX_LINE).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if buf.last() == Some(&b'\n') {
                            buf.pop();
                        }
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                        logger.push(instance, stream, String::from_utf8_lossy(&buf).into_owned());
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("{}:{} output could not be read: {}", logger.app, instance, e);
                        break;
                    }
                }
            }
            debug!("{}:{} {:?} closed", logger.app, instance, stream);
        });
    }

    pub fn push(&self, instance: usize, stream: Stream, line: String) {
        match stream {
            Stream::Stdout => info!(target: "minium::app", "{}:{} | {}", self.app, instance, line),
            Stream::Stderr => warn!(target: "minium::app", "{}:{} | {}", self.app, instance, line),
        }

        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        while lines.len() >= self.capacity.max(1) {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            instance,
            stream,
            timestamp: SystemTime::now(),
            line,
        });
    }

    /// The last `count` lines, oldest first
    pub fn tail(&self, count: usize) -> Vec<LogLine> {
        let lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// One line into `buf`, keeping at most `max` bytes of it, returns the bytes consumed
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }

        let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let room = max.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let used = chunk.len();
        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer() {
        let logger = Logger::with_capacity("app", 3);
        for i in 0..5 {
            logger.push(0, Stream::Stdout, format!("line {}", i));
        }

        let tail = logger.tail(10);
        let text: Vec<_> = tail.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(text, vec!["line 2", "line 3", "line 4"]);

        let tail = logger.tail(1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].line, "line 4");
    }

    #[test]
    fn test_zero_capacity_keeps_one_line() {
        let logger = Logger::with_capacity("app", 0);
        for i in 0..5 {
            logger.push(0, Stream::Stdout, format!("line {}", i));
        }

        let tail = logger.tail(10);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].line, "line 4");
    }

    async fn settle(logger: &Logger, count: usize) -> Vec<LogLine> {
        for _ in 0..100 {
            if logger.tail(usize::MAX).len() >= count {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        logger.tail(usize::MAX)
    }

    #[tokio::test]
    async fn test_attach_invalid_utf8() {
        let logger = Logger::new("app");
        logger.attach(0, Stream::Stdout, &b"a\xffb\nafter\r\n"[..]);

        let tail = settle(&logger, 2).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "a\u{fffd}b");
        assert_eq!(tail[1].line, "after");
    }

    #[tokio::test]
    async fn test_attach_truncates_long_lines() {
        let logger = Logger::new("app");
        let mut output = vec![b'x'; MAX_LINE * 3];
        output.extend_from_slice(b"\nshort");
        logger.attach(0, Stream::Stdout, std::io::Cursor::new(output));

        let tail = settle(&logger, 2).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line.len(), MAX_LINE);
        assert_eq!(tail[1].line, "short");
    }

    #[tokio::test]
    async fn test_attach() {
        let logger = Logger::new("app");
        logger.attach(1, Stream::Stderr, &b"first\nsecond\n"[..]);

        for _ in 0..100 {
            if logger.tail(10).len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let tail = logger.tail(10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "first");
        assert_eq!(tail[1].instance, 1);
        assert_eq!(tail[1].stream, Stream::Stderr);
    }
}
