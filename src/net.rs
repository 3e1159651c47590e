//! Async (Tokio) transport shared by the tracker and peer roles.
//!
//! `serve` is the single accept loop: one task per connection, bounded by a
//! semaphore, each reading exactly one request line before handing the
//! connection to the role's handler. `Connection` carries the timed I/O
//! helpers both the server and the client side use.

use crate::error::{LynxError, Result};
use crate::protocol::{timeouts, MAX_BODY_SIZE, MAX_REQUEST_LINE};
use crate::protocol_core::Request;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Connect and I/O deadlines
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(timeouts::CONNECT_MS),
            io: Duration::from_millis(timeouts::IO_BASE_MS),
        }
    }
}

impl Timeouts {
    fn request_line(&self) -> Duration {
        self.io.min(Duration::from_millis(timeouts::REQUEST_LINE_MS))
    }
}

/// One TCP connection with buffered reads and deadline-bound I/O
pub struct Connection {
    stream: BufReader<TcpStream>,
    pub peer: SocketAddr,
    timeouts: Timeouts,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, timeouts: Timeouts) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream: BufReader::new(stream),
            peer,
            timeouts,
        }
    }

    /// Dial `addr` (`host:port`) within the connect deadline
    pub async fn connect(addr: &str, timeouts: Timeouts) -> Result<Self> {
        let stream = match timeout(timeouts.connect, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(LynxError::Transport(format!("connect {addr}: {e}"))),
            Err(_) => {
                return Err(LynxError::Transport(format!(
                    "connect {addr}: timeout ({} ms)",
                    timeouts.connect.as_millis()
                )))
            }
        };
        let peer = stream
            .peer_addr()
            .map_err(|e| LynxError::Transport(format!("connect {addr}: {e}")))?;
        Ok(Self::new(stream, peer, timeouts))
    }

    /// Read one newline-terminated line (without the terminator). A line
    /// closed by EOF instead of `\n` is accepted.
    pub async fn read_line(&mut self) -> Result<String> {
        self.read_line_or_eof().await?.ok_or_else(|| {
            LynxError::Transport(format!(
                "{} closed the connection before sending a line",
                self.peer
            ))
        })
    }

    /// Like [`Connection::read_line`], but a connection closed before any byte
    /// arrived yields `None`
    pub async fn read_line_or_eof(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let limit = MAX_REQUEST_LINE as u64 + 1;
        let ms = self.timeouts.request_line();
        let n = match timeout(ms, (&mut self.stream).take(limit).read_until(b'\n', &mut buf)).await
        {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(LynxError::Transport(format!("read from {}: {e}", self.peer))),
            Err(_) => {
                return Err(LynxError::Transport(format!(
                    "line read timeout ({} ms) from {}",
                    ms.as_millis(),
                    self.peer
                )))
            }
        };
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') && buf.len() > MAX_REQUEST_LINE {
            return Err(LynxError::ProtocolSyntax(format!(
                "line longer than {MAX_REQUEST_LINE} bytes"
            )));
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| LynxError::ProtocolSyntax("line is not valid UTF-8".into()))
    }

    /// Read the rest of the stream (a framed body), bounded by `MAX_BODY_SIZE`
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let ms = self.timeouts.io;
        match timeout(
            ms,
            (&mut self.stream).take(MAX_BODY_SIZE + 1).read_to_end(&mut body),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(LynxError::Transport(format!("read from {}: {e}", self.peer))),
            Err(_) => {
                return Err(LynxError::Transport(format!(
                    "body read timeout ({} ms) from {}",
                    ms.as_millis(),
                    self.peer
                )))
            }
        }
        if body.len() as u64 > MAX_BODY_SIZE {
            return Err(LynxError::Transport(format!(
                "body from {} exceeds {MAX_BODY_SIZE} bytes",
                self.peer
            )));
        }
        Ok(body)
    }

    /// Write all bytes within a size-scaled deadline
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let ms = Duration::from_millis(timeouts::body_deadline_ms(
            self.timeouts.io.as_millis() as u64,
            buf.len() as u64,
        ));
        let stream = self.stream.get_mut();
        match timeout(ms, async {
            stream.write_all(buf).await?;
            stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LynxError::Transport(format!("write to {}: {e}", self.peer))),
            Err(_) => Err(LynxError::Transport(format!(
                "write timeout ({} ms) to {}",
                ms.as_millis(),
                self.peer
            ))),
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        if !line.ends_with('\n') {
            bytes.push(b'\n');
        }
        self.write_all(&bytes).await
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        self.write_all(request.to_line().as_bytes()).await
    }

    /// Close our write half so the other side sees EOF
    pub async fn finish(&mut self) -> Result<()> {
        self.stream
            .get_mut()
            .shutdown()
            .await
            .map_err(|e| LynxError::Transport(format!("shutdown to {}: {e}", self.peer)))
    }
}

/// Send a request line and collect the whole reply
pub async fn request_reply(addr: &str, request: &Request, timeouts: Timeouts) -> Result<Vec<u8>> {
    let mut conn = Connection::connect(addr, timeouts).await?;
    conn.send_request(request).await?;
    conn.finish().await?;
    conn.read_to_end().await
}

/// Send a request line followed by a framed body, then close
pub async fn send_with_body(
    addr: &str,
    request: &Request,
    body: &[u8],
    timeouts: Timeouts,
) -> Result<()> {
    let mut conn = Connection::connect(addr, timeouts).await?;
    conn.send_request(request).await?;
    conn.write_all(body).await?;
    conn.finish().await
}

/// Bind a listener; callers treat a failure here as fatal
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| LynxError::Transport(format!("bind {addr}: {e}")))
}

/// Accept loop: one task per connection, at most `max_connections` at once.
/// Errors are logged and confined to their connection.
pub async fn serve<H, Fut>(
    listener: TcpListener,
    role: &'static str,
    max_connections: usize,
    timeouts: Timeouts,
    handler: H,
) -> Result<()>
where
    H: Fn(Request, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let permits = Arc::new(Semaphore::new(max_connections.max(1)));
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(role, %addr, max_connections, "listening");
    }
    loop {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return Ok(());
        };
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(role, error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let mut conn = Connection::new(stream, peer, timeouts);
            let result = async {
                let Some(line) = conn.read_line_or_eof().await? else {
                    // reachability probe
                    return Ok(());
                };
                let request = Request::parse(&line)?;
                debug!(role, %peer, %request, "request");
                handler(request, conn).await
            }
            .await;
            match result {
                Ok(()) => {}
                Err(LynxError::ProtocolSyntax(msg)) => {
                    warn!(role, %peer, "syntax error, closing: {msg}")
                }
                Err(e) => warn!(role, %peer, error = %e, "request failed"),
            }
        });
    }
}

/// First non-loopback IPv4 address of this machine, `127.0.0.1` when none.
/// Connecting a UDP socket sends no packets; it only selects a route.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
