//! A pooled connection to one cache node.
//!
//! A connection wraps the two halves of a full-duplex byte stream: a boxed
//! read half and a buffered write half, plus a reusable 24-byte header
//! scratch buffer. It remembers the address it belongs to; the pool map is
//! keyed by that address, so no back-pointer into the pool is needed.
//!
//! The `healthy` flag is cleared by the dispatcher when an operation fails
//! in a way that may have desynchronized the stream; unhealthy connections
//! are destroyed instead of released.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::addr::{AddrFamily, ServerAddr};
use crate::constants::HDR_LEN;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// A live connection to a cache node.
pub struct Connection {
    addr: ServerAddr,
    reader: ReadHalf,
    writer: BufWriter<WriteHalf>,
    hdr_buf: [u8; HDR_LEN],
    io_timeout: Duration,
    healthy: bool,
    authenticated: bool,
}

impl Connection {
    /// Dial the node and wrap the stream.
    ///
    /// The dial itself is bounded by `io_timeout`; an expired dial maps to
    /// [`Error::ConnectTimeout`] so probes can distinguish it from a
    /// refusal. The same timeout bounds every later read and write.
    pub async fn connect(addr: &ServerAddr, io_timeout: Duration) -> Result<Connection> {
        let (reader, writer): (ReadHalf, WriteHalf) = match addr.family() {
            AddrFamily::Tcp => {
                let stream = timeout(io_timeout, TcpStream::connect(addr.as_str()))
                    .await
                    .map_err(|_| Error::ConnectTimeout(addr.to_string()))??;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(unix)]
            AddrFamily::Unix => {
                let stream = timeout(io_timeout, UnixStream::connect(addr.as_str()))
                    .await
                    .map_err(|_| Error::ConnectTimeout(addr.to_string()))??;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(not(unix))]
            AddrFamily::Unix => return Err(Error::InvalidAddr(addr.to_string())),
        };

        Ok(Connection {
            addr: addr.clone(),
            reader,
            writer: BufWriter::new(writer),
            hdr_buf: [0u8; HDR_LEN],
            io_timeout,
            healthy: true,
            authenticated: false,
        })
    }

    /// The address this connection belongs to.
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// Write a request into the buffered writer without flushing.
    pub async fn transmit(&mut self, req: &Request) -> Result<usize> {
        match timeout(self.io_timeout, req.transmit(&mut self.writer)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Io(std::io::ErrorKind::TimedOut)),
        }
    }

    /// Flush buffered writes to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        match timeout(self.io_timeout, self.writer.flush()).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(Error::Io(std::io::ErrorKind::TimedOut)),
        }
    }

    /// Read one response frame.
    pub async fn read_response(&mut self) -> Result<Response> {
        match timeout(
            self.io_timeout,
            Response::receive(&mut self.reader, &mut self.hdr_buf),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(Error::Io(std::io::ErrorKind::TimedOut)),
        }
    }

    /// Whether the last operation left the stream trustworthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Mark the stream broken; the dispatcher will destroy it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Whether the SASL handshake has completed on this connection.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Record a completed SASL handshake.
    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("healthy", &self.healthy)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}
