//! Minimal client for the daemon socket, used by the CLI and by hooks.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::protocol::{encode, ProtocolError, Request, Response};

pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(path: &Path) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(path).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), ProtocolError> {
        self.write.write_all(encode(request)?.as_bytes()).await?;
        Ok(())
    }

    /// Write one raw line, newline appended.
    pub async fn send_raw(&mut self, line: &str) -> Result<(), ProtocolError> {
        self.write.write_all(line.as_bytes()).await?;
        self.write.write_all(b"\n").await?;
        Ok(())
    }

    /// Next frame from the daemon, responses and subscription items alike.
    pub async fn recv(&mut self) -> Result<Response, ProtocolError> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(serde_json::from_str(&line)?),
                None => return Err(ProtocolError::Closed),
            }
        }
    }

    /// Send a request and wait for its response, skipping subscription items.
    pub async fn request(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        self.send(request).await?;
        loop {
            match self.recv().await? {
                Response::Event { .. } | Response::Gap { .. } => continue,
                response => return Ok(response),
            }
        }
    }
}
