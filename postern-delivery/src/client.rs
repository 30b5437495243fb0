//! SMTP client used by the outbound relay.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("unparsable response line '{0}'")]
    Parse(String),
}

/// A complete, possibly multi-line SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join(" / ")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

pub struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl SmtpClient {
    /// Connects and leaves the greeting unread; call [`SmtpClient::read_reply`]
    /// next.
    ///
    /// # Errors
    ///
    /// `Timeout` when the connect exceeds `timeout`, I/O errors otherwise.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
            timeout,
        })
    }

    async fn read_line(&mut self) -> Result<String, ClientError> {
        let mut line = String::new();
        let n = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Reads one full reply, following `XYZ-` continuation lines.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        let mut lines = Vec::new();
        let mut code = 0u16;

        loop {
            let line = self.read_line().await?;
            if line.len() < 3 {
                return Err(ClientError::Parse(line));
            }
            let parsed: u16 = line[..3]
                .parse()
                .map_err(|_| ClientError::Parse(line.clone()))?;
            if code == 0 {
                code = parsed;
            }

            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line.get(4..).unwrap_or("").to_string());
            if last {
                break;
            }
        }

        Ok(Reply { code, lines })
    }

    /// Sends one command line and reads the reply.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn command(&mut self, line: &str) -> Result<Reply, ClientError> {
        tokio::time::timeout(
            self.timeout,
            self.writer.write_all(format!("{line}\r\n").as_bytes()),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.timeout))??;

        self.read_reply().await
    }

    /// Transmits the message body with outbound dot-stuffing and the final
    /// `CRLF . CRLF`, then reads the acceptance reply.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn send_data(&mut self, raw: &[u8]) -> Result<Reply, ClientError> {
        let mut wire = Vec::with_capacity(raw.len() + 64);
        for line in raw.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                wire.push(b'.');
            }
            wire.extend_from_slice(line);
            wire.extend_from_slice(b"\r\n");
        }
        // split leaves one empty tail when raw ends with \n; drop that line.
        if raw.ends_with(b"\n") {
            wire.truncate(wire.len() - 2);
        }
        wire.extend_from_slice(b".\r\n");

        tokio::time::timeout(self.timeout, self.writer.write_all(&wire))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        self.read_reply().await
    }
}
