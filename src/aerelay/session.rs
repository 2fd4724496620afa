//! Client side of the control connection, shared by hosts and clients.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use crate::aerelay::codec::ControlCodec;
use crate::aerelay::net;
use crate::aerelay::protocol::{self, ConnectRequest, ErrorCode, Logon, Packet, ProtocolError};

const LOGOUT_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error("server refused: {0}")]
    Refused(ErrorCode),
    #[error("server logged us out")]
    LoggedOut,
    #[error("server closed the connection")]
    Closed,
    #[error("no traffic for two heartbeat intervals")]
    HeartbeatTimeout,
    #[error("unexpected {0} packet")]
    Unexpected(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub server_addr: String,
    pub room: String,
    pub token: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7000".into(),
            room: String::new(),
            token: String::new(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One control connection to the relay server.
///
/// Reads are driven by the owner's event loop through [`ControlSession::recv`];
/// when nothing arrived for a heartbeat interval the loop calls
/// [`ControlSession::on_read_timeout`], which pings once and gives up on the
/// second silent interval.
pub struct ControlSession {
    framed: Framed<TcpStream, ControlCodec>,
    server: SocketAddr,
    heartbeat: Duration,
    last_read: Instant,
    only_one_missed: bool,
    logged_in: bool,
    shutting_down: bool,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("server", &self.server)
            .field("logged_in", &self.logged_in)
            .finish_non_exhaustive()
    }
}

impl ControlSession {
    /// Dials the server and completes the version handshake.
    pub async fn connect(opts: &SessionOptions) -> Result<Self, SessionError> {
        let dial = async {
            let mut s = TcpStream::connect(opts.server_addr.trim()).await?;
            net::init_socket_pref(&s);
            protocol::write_hello(&mut s).await?;
            protocol::read_hello_reply(&mut s).await?;
            Ok::<_, ProtocolError>(s)
        };
        let stream = match tokio::time::timeout(opts.connect_timeout, dial).await {
            Ok(Ok(s)) => s,
            Ok(Err(ProtocolError::Rejected(code))) => return Err(SessionError::Refused(code)),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(SessionError::ConnectTimeout {
                    addr: opts.server_addr.clone(),
                })
            }
        };
        let server = stream.peer_addr()?;
        Ok(Self {
            framed: Framed::new(stream, ControlCodec::default()),
            server,
            heartbeat: opts.heartbeat_interval,
            last_read: Instant::now(),
            only_one_missed: false,
            logged_in: false,
            shutting_down: false,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Sends CONNECT and waits for LOGON. Any other answer ends the session.
    pub async fn login(&mut self, req: ConnectRequest, within: Duration) -> Result<Logon, SessionError> {
        self.send(Packet::Connect(req)).await?;
        let reply = match tokio::time::timeout(within, self.framed.next()).await {
            Ok(Some(r)) => r?,
            Ok(None) => return Err(SessionError::Closed),
            Err(_) => return Err(SessionError::Refused(ErrorCode::Timeout)),
        };
        self.mark_read();
        match reply {
            Packet::Logon(l) => {
                self.logged_in = true;
                Ok(l)
            }
            Packet::Error(code) => Err(SessionError::Refused(code)),
            Packet::Logout => Err(SessionError::LoggedOut),
            other => Err(SessionError::Unexpected(other.kind())),
        }
    }

    /// Next packet from the server. Cancel-safe, meant for `select!`.
    pub async fn recv(&mut self) -> Result<Packet, SessionError> {
        match self.framed.next().await {
            Some(Ok(pkt)) => {
                self.mark_read();
                Ok(pkt)
            }
            Some(Err(err)) => Err(err.into()),
            None => Err(SessionError::Closed),
        }
    }

    pub async fn send(&mut self, pkt: Packet) -> Result<(), SessionError> {
        self.framed.send(pkt).await?;
        Ok(())
    }

    /// When the owner loop should call [`ControlSession::on_read_timeout`].
    pub fn read_deadline(&self) -> Instant {
        self.last_read + self.heartbeat
    }

    fn mark_read(&mut self) {
        self.last_read = Instant::now();
        self.only_one_missed = false;
    }

    /// First silent interval: send a heartbeat. Second in a row: the
    /// connection is considered dead.
    pub async fn on_read_timeout(&mut self) -> Result<(), SessionError> {
        if self.only_one_missed {
            return Err(SessionError::HeartbeatTimeout);
        }
        self.only_one_missed = true;
        self.last_read = Instant::now();
        self.send(Packet::Heartbeat).await
    }

    pub async fn logout(&mut self) -> Result<(), SessionError> {
        if !self.logged_in {
            return Ok(());
        }
        self.logged_in = false;
        self.send(Packet::Logout).await
    }

    /// Logs out if needed, gives the server a moment to notice, then closes.
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        if self.logged_in {
            match tokio::time::timeout(LOGOUT_GRACE, self.logout()).await {
                Ok(Ok(())) => {
                    // Drain until the server closes or the grace period ends.
                    let _ = tokio::time::timeout(LOGOUT_GRACE, async {
                        while let Some(Ok(_)) = self.framed.next().await {}
                    })
                    .await;
                }
                Ok(Err(err)) => tracing::debug!(err=%err, "session: logout not sent"),
                Err(_) => tracing::debug!("session: logout timed out"),
            }
        }
        let _ = tokio::time::timeout(LOGOUT_GRACE, self.framed.get_mut().shutdown()).await;
    }
}
