use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

use super::link::{Link, RelayError};
use super::room::{Room, Slave};
use super::Server;
use crate::aerelay::codec::ControlCodec;
use crate::aerelay::protocol::{
    self, ConnectRequest, ErrorCode, Logon, Packet, ProtocolError, RelayState, EVERYONE,
    HELLO_OK, MASTER_INDEX, MAX_PORTS, SERVER_ORIGIN,
};

pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Wait = 0,
    Connected = 1,
    Established = 2,
    Disconnect = 3,
    Error = 4,
    Shutdown = 5,
    Finalized = 6,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Wait,
            1 => Self::Connected,
            2 => Self::Established,
            3 => Self::Disconnect,
            4 => Self::Error,
            5 => Self::Shutdown,
            _ => Self::Finalized,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Connected => "connected",
            Self::Established => "established",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
            Self::Finalized => "finalized",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Shutdown | Self::Finalized)
    }
}

/// Shared view of one connection, kept in the server's worker table.
#[derive(Debug)]
pub struct WorkerStats {
    id: u64,
    addr: SocketAddr,
    state: AtomicU8,
    room: Mutex<Option<(String, u32)>>,
    up: AtomicU64,
    down: AtomicU64,
    created_unix_ms: u64,
    abort: Notify,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub addr: String,
    pub state: &'static str,
    pub room: Option<String>,
    pub index: Option<u32>,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub created_unix_ms: u64,
}

impl WorkerStats {
    pub fn new(id: u64, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            state: AtomicU8::new(WorkerState::Wait as u8),
            room: Mutex::new(None),
            up: AtomicU64::new(0),
            down: AtomicU64::new(0),
            created_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            abort: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: WorkerState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn set_room(&self, room: &str, index: u32) {
        if let Ok(mut r) = self.room.lock() {
            *r = Some((room.to_string(), index));
        }
    }

    pub fn add_up(&self, n: usize) {
        self.up.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_down(&self, n: usize) {
        self.down.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn reset_counters(&self) {
        self.up.store(0, Ordering::Relaxed);
        self.down.store(0, Ordering::Relaxed);
    }

    /// Asks the worker task to drop its connection with an I/O error.
    pub fn abort(&self) {
        self.abort.notify_one();
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let room = self.room.lock().ok().and_then(|r| r.clone());
        WorkerSnapshot {
            id: self.id,
            addr: self.addr.to_string(),
            state: self.state().name(),
            index: room.as_ref().map(|(_, i)| *i),
            room: room.map(|(id, _)| id),
            up_bytes: self.up.load(Ordering::Relaxed),
            down_bytes: self.down.load(Ordering::Relaxed),
            created_unix_ms: self.created_unix_ms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl WorkerError {
    /// Resets and broken pipes are ordinary client churn.
    fn is_churn(&self) -> bool {
        let io = match self {
            WorkerError::Protocol(ProtocolError::Io(e)) => e,
            WorkerError::Relay(RelayError::Write(ProtocolError::Io(e))) => e,
            WorkerError::Relay(RelayError::PeerGone) => return true,
            _ => return false,
        };
        matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Exit {
    PeerClosed,
    Logout,
    PeerError(ErrorCode),
    Refused(ErrorCode),
    Dissolved,
    Kicked,
    HeartbeatTimeout,
    Aborted,
    Shutdown,
}

/// Task that owns one accepted connection from handshake to teardown.
pub(crate) struct Worker {
    server: Arc<Server>,
    stats: Arc<WorkerStats>,
    link: Arc<Link>,
    reader: FramedRead<BoxedReader, ControlCodec>,
    room: Option<Arc<Room>>,
    index: u32,
    events: Option<watch::Receiver<u64>>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub(crate) fn new(
        server: Arc<Server>,
        stats: Arc<WorkerStats>,
        reader: BoxedReader,
        link: Arc<Link>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            server,
            stats,
            link,
            reader: FramedRead::new(reader, ControlCodec::default()),
            room: None,
            index: MASTER_INDEX,
            events: None,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let addr = self.link.peer();
        let res = self.drive().await;
        let relay = self.server.opts.relay_timeout;
        let room_gone = self.room.as_ref().is_some_and(|r| r.is_dissolved());

        let mut terminal = WorkerState::Finalized;
        match res {
            Ok(Exit::Shutdown) => {
                terminal = WorkerState::Shutdown;
                tracing::debug!(addr=%addr, "server: worker stopped for shutdown");
            }
            Ok(Exit::Aborted) => {
                terminal = WorkerState::Error;
                self.link.send_error(ErrorCode::Io, relay).await;
                tracing::warn!(addr=%addr, "server: worker aborted");
            }
            Ok(exit) => {
                self.stats.set_state(WorkerState::Disconnect);
                if matches!(exit, Exit::PeerClosed | Exit::Logout) {
                    self.link.send(Packet::Logout, relay).await.ok();
                }
                tracing::debug!(addr=%addr, exit=?exit, "server: worker disconnected");
            }
            Err(err) if room_gone && self.index == MASTER_INDEX => {
                tracing::debug!(addr=%addr, err=%err, "server: room dissolved under master");
            }
            Err(err) => {
                terminal = WorkerState::Error;
                if err.is_churn() {
                    tracing::debug!(addr=%addr, err=%err, "server: worker connection dropped");
                } else {
                    tracing::warn!(addr=%addr, err=%err, "server: worker failed");
                    self.link.send_error(ErrorCode::Io, relay).await;
                }
            }
        }

        self.detach().await;
        self.link.close().await;
        self.stats.set_state(terminal);
        self.server.forget_worker(&self.stats);
    }

    async fn drive(&mut self) -> Result<Exit, WorkerError> {
        if let Some(exit) = self.handshake().await? {
            return Ok(exit);
        }
        self.stats.set_state(WorkerState::Connected);

        let hb = self.server.opts.heartbeat_timeout;
        let relay = self.server.opts.relay_timeout;
        let mut deadline = Instant::now() + hb;
        loop {
            let room = self.room.clone();
            let is_master = room.is_some() && self.index == MASTER_INDEX;
            tokio::select! {
                biased;
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        self.link.send_error(ErrorCode::Shutdown, relay).await;
                        return Ok(Exit::Shutdown);
                    }
                }
                _ = self.stats.abort.notified() => {
                    return Ok(Exit::Aborted);
                }
                _ = room_event(&mut self.events) => {
                    if let Some(room) = &room {
                        if !room.is_live() {
                            if !is_master {
                                self.link.send_error(ErrorCode::MasterDie, relay).await;
                            }
                            return Ok(Exit::Dissolved);
                        }
                        if !is_master && room.is_kicked(self.index) {
                            self.link.send_error(ErrorCode::Kicked, relay).await;
                            return Ok(Exit::Kicked);
                        }
                    }
                }
                _ = flush_wanted(room.as_deref(), is_master) => {
                    if let Some(room) = &room {
                        room.flush(&self.link, relay).await?;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.link.send_error(ErrorCode::Timeout, relay).await;
                    return Ok(Exit::HeartbeatTimeout);
                }
                frame = self.reader.next() => {
                    let pkt = match frame {
                        None => return Ok(Exit::PeerClosed),
                        Some(Ok(pkt)) => pkt,
                        Some(Err(ProtocolError::FrameTooLarge(n))) => {
                            tracing::debug!(addr=%self.link.peer(), size=n, "server: oversized frame");
                            self.link.send_error(ErrorCode::SystemLimit, relay).await;
                            return Ok(Exit::Refused(ErrorCode::SystemLimit));
                        }
                        Some(Err(err)) => return Err(err.into()),
                    };
                    deadline = Instant::now() + hb;
                    if let Some(exit) = self.dispatch(pkt).await? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<Option<Exit>, WorkerError> {
        let t = self.server.opts.handshake_timeout;
        let res = tokio::time::timeout(t, protocol::read_hello(self.reader.get_mut())).await;
        let code = match res {
            Ok(Ok(())) => {
                self.link.send_raw(HELLO_OK, t).await?;
                return Ok(None);
            }
            Err(_) => ErrorCode::Timeout,
            Ok(Err(ProtocolError::BadMagic)) => ErrorCode::BadHandshake,
            Ok(Err(ProtocolError::BadVersion(_))) => ErrorCode::VersionConflict,
            Ok(Err(err)) => return Err(err.into()),
        };
        tracing::debug!(addr=%self.link.peer(), code=%code, "server: handshake refused");
        self.link.send_raw(code.as_u8(), t).await?;
        Ok(Some(Exit::Refused(code)))
    }

    async fn dispatch(&mut self, pkt: Packet) -> Result<Option<Exit>, WorkerError> {
        let relay = self.server.opts.relay_timeout;
        match pkt {
            Packet::Heartbeat => {
                self.link.send(Packet::Heartbeat, relay).await?;
                Ok(None)
            }
            Packet::Logout => Ok(Some(Exit::Logout)),
            Packet::Connect(req) => self.on_connect(req).await,
            Packet::Error(code) => {
                tracing::debug!(addr=%self.link.peer(), code=%code, "server: peer reported error");
                Ok(Some(Exit::PeerError(code)))
            }
            pkt @ (Packet::Data(_)
            | Packet::KickSlave { .. }
            | Packet::RequestChannel { .. }
            | Packet::ChannelOpen { .. }
            | Packet::ChannelDeny { .. }
            | Packet::ChannelReset { .. }
            | Packet::ChannelClose { .. }
            | Packet::Msg { .. }
            | Packet::MsgOp { .. }
            | Packet::Nickname(_)
            | Packet::Onlines(_)
            | Packet::Ports(_)) => {
                let Some(room) = self.room.clone() else {
                    self.link.send_error(ErrorCode::NotConnected, relay).await;
                    return Ok(None);
                };
                match pkt {
                    Packet::Msg { peer, text } => self.on_chat(&room, peer, text).await,
                    Packet::MsgOp { op, arg } => {
                        if !room.chat_op(self.index, op, arg) {
                            tracing::debug!(room=%room.id(), index=self.index, op=?op, "server: chat op refused");
                        }
                        Ok(None)
                    }
                    Packet::Nickname(name) => {
                        room.set_nickname(self.index, name);
                        Ok(None)
                    }
                    Packet::Onlines(_) => {
                        self.link.send(Packet::Onlines(room.onlines()), relay).await?;
                        Ok(None)
                    }
                    pkt if self.index == MASTER_INDEX => self.on_master_packet(&room, pkt).await,
                    pkt => self.on_slave_packet(&room, pkt).await,
                }
            }
            other => {
                tracing::debug!(addr=%self.link.peer(), kind=other.kind(), "server: unexpected packet");
                self.link.send_error(ErrorCode::UnknownPacket, relay).await;
                Ok(Some(Exit::Refused(ErrorCode::UnknownPacket)))
            }
        }
    }

    async fn on_connect(&mut self, req: ConnectRequest) -> Result<Option<Exit>, WorkerError> {
        let relay = self.server.opts.relay_timeout;
        if self.room.is_some() {
            self.link.send_error(ErrorCode::AlreadyConnected, relay).await;
            return Ok(None);
        }

        let me = Slave {
            link: self.link.clone(),
            stats: self.stats.clone(),
        };
        let (room, index) = match self.server.handle_connect(&req, me) {
            Ok(v) => v,
            Err(code) => {
                tracing::info!(addr=%self.link.peer(), room=%req.room, owner=req.owner, code=%code, "server: connect refused");
                self.link.send_error(code, relay).await;
                return Ok(Some(Exit::Refused(code)));
            }
        };

        self.room = Some(room.clone());
        self.index = index;
        self.stats.set_room(room.id(), index);
        let mut events = room.subscribe();
        events.mark_changed();
        self.events = Some(events);

        self.link
            .send(
                Packet::Logon(Logon {
                    room_index: index,
                    flags: room.flags(),
                    motd: room.motd(),
                    ports: room.ports().to_vec(),
                }),
                relay,
            )
            .await?;

        if index != MASTER_INDEX {
            let joined = Packet::SlaveConnect {
                index,
                addr: self.link.peer(),
            };
            if let Some(exit) = self.to_master(&room, joined).await? {
                return Ok(Some(exit));
            }
        }

        self.stats.set_state(WorkerState::Established);
        let role = if index == MASTER_INDEX { "host" } else { "client" };
        tracing::info!(addr=%self.link.peer(), room=%room.id(), index, role, "server: joined room");
        Ok(None)
    }

    async fn on_slave_packet(&mut self, room: &Room, pkt: Packet) -> Result<Option<Exit>, WorkerError> {
        let relay = self.server.opts.relay_timeout;
        match pkt {
            Packet::Data(payload) => {
                let n = payload.len();
                let from = self.index;
                let exit = self
                    .to_master(room, Packet::ServerSlaveData { from, payload })
                    .await?;
                if exit.is_none() {
                    self.stats.add_up(n);
                    room.add_up(n);
                }
                Ok(exit)
            }
            Packet::RequestChannel { port_id, secret } => {
                if port_id as usize >= room.ports().len() {
                    self.link
                        .send(
                            Packet::ChannelDeny {
                                peer: SERVER_ORIGIN,
                                code: ErrorCode::SystemLimit,
                                reason: format!("no port #{port_id}"),
                            },
                            relay,
                        )
                        .await?;
                    return Ok(None);
                }
                let from = self.index;
                self.to_master(
                    room,
                    Packet::ChannelRequest {
                        from,
                        port_id,
                        secret,
                    },
                )
                .await
            }
            Packet::ChannelReset { pipe_id, .. } => {
                let peer = self.index;
                self.to_master(room, Packet::ChannelReset { peer, pipe_id })
                    .await
            }
            Packet::ChannelClose { pipe_id, .. } => {
                let peer = self.index;
                self.to_master(room, Packet::ChannelClose { peer, pipe_id })
                    .await
            }
            other => {
                tracing::debug!(addr=%self.link.peer(), kind=other.kind(), "server: host-only packet from client ignored");
                Ok(None)
            }
        }
    }

    async fn on_master_packet(&mut self, room: &Room, pkt: Packet) -> Result<Option<Exit>, WorkerError> {
        let relay = self.server.opts.relay_timeout;
        match pkt {
            Packet::Data(payload) => {
                let (frame, target) = protocol::split_master_data(payload)?;
                let n = frame.len();
                if let Some(slave) = self.relay_to(room, target, Packet::ServerData(frame)).await? {
                    slave.stats.add_down(n);
                    room.add_down(n);
                }
            }
            Packet::ChannelOpen {
                client,
                pipe_id,
                secret,
            } => {
                self.relay_to(room, client, Packet::ChannelResult { pipe_id, secret })
                    .await?;
            }
            Packet::ChannelDeny { peer, code, reason } => {
                let deny = Packet::ChannelDeny {
                    peer: MASTER_INDEX,
                    code,
                    reason,
                };
                self.relay_to(room, peer, deny).await?;
            }
            Packet::ChannelReset { peer, pipe_id } => {
                let pkt = Packet::ChannelReset {
                    peer: MASTER_INDEX,
                    pipe_id,
                };
                self.relay_to(room, peer, pkt).await?;
            }
            Packet::ChannelClose { peer, pipe_id } => {
                let pkt = Packet::ChannelClose {
                    peer: MASTER_INDEX,
                    pipe_id,
                };
                self.relay_to(room, peer, pkt).await?;
            }
            Packet::KickSlave { index } => {
                if room.kick(index, relay).await? {
                    tracing::info!(room=%room.id(), index, "server: host kicked client");
                }
            }
            Packet::Ports(ports) => {
                if ports.is_empty() || ports.len() > MAX_PORTS {
                    tracing::debug!(room=%room.id(), count=ports.len(), "server: port map refused");
                    return Ok(None);
                }
                room.set_ports(ports.clone());
                tracing::info!(room=%room.id(), ports=?ports, "server: port map changed");
                for (index, link) in room.slave_links() {
                    if let Err(err) = link.send(Packet::Ports(ports.clone()), relay).await {
                        tracing::debug!(room=%room.id(), index, err=%err, "server: port map not delivered");
                    }
                }
            }
            other => {
                tracing::debug!(addr=%self.link.peer(), kind=other.kind(), "server: client-only packet from host ignored");
            }
        }
        Ok(None)
    }

    /// Routes a chat message. A refused or undeliverable direct message is
    /// answered with MSG_FAIL; broadcasts skip members they cannot reach.
    async fn on_chat(&mut self, room: &Room, to: u32, text: String) -> Result<Option<Exit>, WorkerError> {
        let relay = self.server.opts.relay_timeout;
        let from = self.index;
        let Some(targets) = room.chat_targets(from, to) else {
            self.link.send(Packet::MsgFail { peer: to }, relay).await?;
            return Ok(None);
        };

        let mut failed = false;
        for target in targets {
            let pkt = Packet::Msg {
                peer: from,
                text: text.clone(),
            };
            if target == MASTER_INDEX {
                if let Some(exit) = self.to_master(room, pkt).await? {
                    return Ok(Some(exit));
                }
                continue;
            }
            let sent = match room.slave(target) {
                Some(slave) => slave.link.send(pkt, relay).await.is_ok(),
                None => false,
            };
            if !sent {
                tracing::debug!(room=%room.id(), from, target, "server: message not delivered");
                failed = true;
            }
        }
        if failed && to != EVERYONE {
            self.link.send(Packet::MsgFail { peer: to }, relay).await?;
        }
        Ok(None)
    }

    /// Slave to master: queued on the room, written by the master task.
    async fn to_master(&self, room: &Room, pkt: Packet) -> Result<Option<Exit>, WorkerError> {
        let relay = self.server.opts.relay_timeout;
        match room.register(pkt, relay).await {
            Ok(()) => Ok(None),
            Err(RelayError::RoomDissolved) | Err(RelayError::PeerGone) => {
                self.link.send_error(ErrorCode::MasterDie, relay).await;
                Ok(Some(Exit::Dissolved))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Master to slave: written straight to the slave's link. Delivery
    /// problems are reported to the master as STATE packets.
    async fn relay_to(&self, room: &Room, target: u32, pkt: Packet) -> Result<Option<Slave>, WorkerError> {
        let relay = self.server.opts.relay_timeout;
        let Some(slave) = room.slave(target) else {
            tracing::debug!(room=%room.id(), target, kind=pkt.kind(), "server: relay target gone");
            self.link.send(Packet::State(RelayState::Discard), relay).await?;
            return Ok(None);
        };

        let state = match slave.link.send(pkt, relay).await {
            Ok(()) => return Ok(Some(slave)),
            Err(RelayError::PeerGone) => RelayState::Discard,
            Err(RelayError::Timeout) => RelayState::Timeout,
            Err(RelayError::LockTimeout(d)) => {
                tracing::warn!(room=%room.id(), target, wait=?d, "server: client socket stuck, aborting it");
                slave.stats.abort();
                RelayState::Timeout
            }
            Err(err) => {
                tracing::debug!(room=%room.id(), target, err=%err, "server: relay write failed");
                RelayState::IoError
            }
        };
        self.link.send(Packet::State(state), relay).await?;
        Ok(None)
    }

    async fn detach(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        let relay = self.server.opts.relay_timeout;
        if self.index == MASTER_INDEX {
            if room.dissolve(relay).await {
                tracing::info!(room=%room.id(), "server: room dissolved");
            }
            self.server.remove_room(&room);
        } else if room.remove_slave(self.index) && room.is_live() {
            let index = self.index;
            if let Err(err) = room.register(Packet::SlaveDisconnect { index }, relay).await {
                tracing::debug!(room=%room.id(), index, err=%err, "server: leave notice not delivered");
            }
        }
    }
}

async fn room_event(rx: &mut Option<watch::Receiver<u64>>) {
    match rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

async fn flush_wanted(room: Option<&Room>, is_master: bool) {
    match room {
        Some(room) if is_master => room.flush_wanted().await,
        _ => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::aerelay::server::ServerOptions;

    fn assert_send<T: Send + 'static>(_: &T) {}

    #[tokio::test]
    async fn worker_task_can_be_spawned() {
        let server = Server::new(ServerOptions::default());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        // The peer hangs up before the handshake, so the task ends at once.
        let (r, peer_w) = tokio::io::duplex(64);
        drop(peer_w);
        let (w, _peer_r) = tokio::io::duplex(64);
        let (_tx, rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::new(1, addr));
        let link = Arc::new(Link::new(addr, Box::new(w)));
        let worker = Worker::new(server, stats, Box::new(r), link, rx);

        let fut = worker.run();
        assert_send(&fut);
        let task = tokio::spawn(fut);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
