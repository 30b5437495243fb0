//! The client-facing byte stream: plaintext or TLS, with buffered
//! line-oriented reads and the STARTTLS upgrade.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, server::TlsStream};

use postern_crypto::{TlsError, TlsInfo};

pub const MAX_LINE_LENGTH: usize = 1024;

fn gone() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "connection detached mid-upgrade")
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    LineTooLong,

    #[error(transparent)]
    Tls(#[from] TlsError),
}

enum Inner<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    /// Transient placeholder while an in-place upgrade owns the stream;
    /// observable only if the upgrade future is cancelled mid-handshake.
    Detached,
}

pub struct Connection<S> {
    inner: Inner<S>,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn plain(stream: S) -> Self {
        Self {
            inner: Inner::Plain(stream),
            buf: Vec::with_capacity(4096),
        }
    }

    pub fn tls(stream: TlsStream<S>) -> Self {
        Self {
            inner: Inner::Tls(Box::new(stream)),
            buf: Vec::with_capacity(4096),
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.inner, Inner::Tls(_))
    }

    /// Performs the server-side handshake over the raw stream. Any
    /// buffered plaintext is discarded, since bytes pipelined ahead of a
    /// STARTTLS are attacker-controlled. A failed handshake hands the raw
    /// stream back so the session can still answer with a 454.
    ///
    /// # Errors
    ///
    /// Handshake and negotiation-info failures.
    pub async fn upgrade_in_place(
        &mut self,
        acceptor: &TlsAcceptor,
    ) -> Result<TlsInfo, ConnectionError> {
        self.buf.clear();

        match std::mem::replace(&mut self.inner, Inner::Detached) {
            Inner::Plain(stream) => match acceptor.accept(stream).into_fallible().await {
                Ok(tls_stream) => {
                    let info = TlsInfo::of(tls_stream.get_ref().1);
                    self.inner = Inner::Tls(Box::new(tls_stream));
                    Ok(info?)
                }
                Err((error, stream)) => {
                    self.inner = Inner::Plain(stream);
                    Err(ConnectionError::Io(error))
                }
            },
            Inner::Tls(stream) => {
                let info = TlsInfo::of(stream.get_ref().1)?;
                self.inner = Inner::Tls(stream);
                Ok(info)
            }
            Inner::Detached => Err(ConnectionError::Io(gone())),
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let mut wire = String::with_capacity(line.len() + 2);
        wire.push_str(line);
        wire.push_str("\r\n");

        match &mut self.inner {
            Inner::Plain(stream) => stream.write_all(wire.as_bytes()).await?,
            Inner::Tls(stream) => stream.write_all(wire.as_bytes()).await?,
            Inner::Detached => return Err(ConnectionError::Io(gone())),
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize, ConnectionError> {
        let mut chunk = [0u8; 4096];
        let n = match &mut self.inner {
            Inner::Plain(stream) => stream.read(&mut chunk).await?,
            Inner::Tls(stream) => stream.read(&mut chunk).await?,
            Inner::Detached => return Err(ConnectionError::Io(gone())),
        };
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Reads one CRLF (or bare LF) terminated line. `Ok(None)` is a clean
    /// EOF; a line longer than [`MAX_LINE_LENGTH`] is an error the session
    /// answers with `500`.
    ///
    /// # Errors
    ///
    /// `LineTooLong` or I/O failures.
    pub async fn read_line(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                if pos > MAX_LINE_LENGTH {
                    return Err(ConnectionError::LineTooLong);
                }
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.buf.len() > MAX_LINE_LENGTH {
                return Err(ConnectionError::LineTooLong);
            }

            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }
}
