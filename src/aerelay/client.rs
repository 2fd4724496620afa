//! Client role: joins a room and exposes the host's ports on local listeners.
//!
//! Every accepted local connection rides a pipe. When the local side closes,
//! the pipe is parked in a per-port pool instead of being torn down; the next
//! connection on that port takes it over with a CHANNEL_RESET, which makes the
//! host redial its service. Until the host echoes the reset back, anything it
//! sends on that pipe belongs to the old connection and is dropped. Pooled
//! pipes are closed after sitting idle.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::aerelay::chat::{self, ChatEvent, ChatFeed};
use crate::aerelay::cipher::{ChaChaPipe, PipeCipher, Side};
use crate::aerelay::net;
use crate::aerelay::pipe::{self, IdleClock, PipeEndpoint, PipeSender, SpliceEnd, Upstream};
use crate::aerelay::protocol::{
    self, ChatOp, ConnectRequest, Logon, Packet, Secret, MASTER_INDEX, MAX_PORTS, SERVER_ORIGIN,
};
use crate::aerelay::session::{ControlSession, SessionError, SessionOptions};

pub const CLIENT_MAX_PIPES: usize = 6;
const REAP_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub session: SessionOptions,
    /// Interface the local listeners bind to.
    pub bind_addr: String,
    /// Local port per exposed port, by position. Missing entries reuse the
    /// remote port number; 0 lets the OS pick.
    pub local_ports: Vec<u16>,
    pub max_pipes: usize,
    /// Zero disables reaping.
    pub pipe_idle_timeout: Duration,
    pub nickname: String,
    /// Hear messages from other clients, not just the host.
    pub chat: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            bind_addr: "127.0.0.1".into(),
            local_ports: Vec::new(),
            max_pipes: CLIENT_MAX_PIPES,
            pipe_idle_timeout: Duration::from_secs(600),
            nickname: String::new(),
            chat: false,
        }
    }
}

struct ClientPipe {
    port_id: u8,
    inbox: PipeSender,
    idle: IdleClock,
    pooled: bool,
    /// Resets sent that the host has not echoed yet.
    resets_unacked: u32,
}

/// A local connection waiting for its CHANNEL_RESULT. Answers arrive in
/// request order.
struct PendingPipe {
    port_id: u8,
    secret: Secret,
    local: TcpStream,
}

#[derive(Default)]
struct Pipes {
    live: HashMap<u32, ClientPipe>,
    free: HashMap<u8, Vec<PipeEndpoint>>,
    pending: VecDeque<PendingPipe>,
}

impl Pipes {
    fn in_use(&self) -> usize {
        self.live.len() + self.pending.len()
    }

    fn take_pooled(&mut self, port_id: u8) -> Option<PipeEndpoint> {
        let ep = self.free.get_mut(&port_id)?.pop()?;
        if let Some(p) = self.live.get_mut(&ep.pipe_id) {
            p.pooled = false;
            p.resets_unacked += 1;
        }
        Some(ep)
    }

    fn remove(&mut self, pipe_id: u32) -> Option<ClientPipe> {
        let p = self.live.remove(&pipe_id)?;
        if let Some(list) = self.free.get_mut(&p.port_id) {
            list.retain(|ep| ep.pipe_id != pipe_id);
        }
        Some(p)
    }

    /// Pooled pipes idle for longer than `limit`, or the single longest idle
    /// one when `limit` is `None`.
    fn stale(&self, limit: Option<Duration>) -> Vec<u32> {
        let pooled = self.live.iter().filter(|(_, p)| p.pooled);
        match limit {
            Some(limit) => pooled
                .filter(|(_, p)| p.idle.idle_for() > limit)
                .map(|(id, _)| *id)
                .collect(),
            None => pooled
                .max_by_key(|(_, p)| p.idle.idle_for())
                .map(|(id, _)| *id)
                .into_iter()
                .collect(),
        }
    }
}

struct Slot {
    /// Requested local port; 0 means OS-assigned.
    port: u16,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Local listeners, one slot per exposed port position.
struct Listeners {
    slots: Vec<Option<Slot>>,
    accept_tx: mpsc::Sender<(u8, TcpStream)>,
}

impl Listeners {
    fn new(accept_tx: mpsc::Sender<(u8, TcpStream)>) -> Self {
        Self {
            slots: Vec::new(),
            accept_tx,
        }
    }

    fn addrs(&self) -> Vec<SocketAddr> {
        self.slots.iter().flatten().map(|s| s.addr).collect()
    }

    /// Brings the listeners in line with `ports`. Slots whose local port is
    /// unchanged keep their socket. With `strict` the first bind failure is
    /// returned; otherwise it is logged and that position goes unserved.
    async fn apply(&mut self, opts: &ClientOptions, ports: &[u16], strict: bool) -> std::io::Result<()> {
        let wanted: Vec<u16> = ports
            .iter()
            .enumerate()
            .map(|(i, remote)| opts.local_ports.get(i).copied().unwrap_or(*remote))
            .collect();

        // Release first so a port that moved between positions can be rebound.
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let keep = matches!(slot, Some(s) if wanted.get(i) == Some(&s.port));
            if !keep {
                if let Some(s) = slot.take() {
                    s.task.abort();
                    let _ = s.task.await;
                }
            }
        }
        self.slots.truncate(wanted.len());
        self.slots.resize_with(wanted.len(), || None);

        for (i, port) in wanted.into_iter().enumerate() {
            if self.slots[i].is_some() {
                continue;
            }
            let bind = format!("{}:{}", opts.bind_addr.trim(), port);
            match self.bind(i as u8, port, &bind).await {
                Ok(slot) => self.slots[i] = Some(slot),
                Err(err) if strict => return Err(err),
                Err(err) => {
                    tracing::warn!(port=i, bind=%bind, err=%err, "client: listener bind failed");
                }
            }
        }
        Ok(())
    }

    async fn bind(&self, port_id: u8, port: u16, bind: &str) -> std::io::Result<Slot> {
        let ln = TcpListener::bind(bind).await?;
        let addr = ln.local_addr()?;
        let tx = self.accept_tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match ln.accept().await {
                    Ok((s, _)) => {
                        if tx.send((port_id, s)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(port=port_id, err=%err, "client: accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(Slot { port, addr, task })
    }

    async fn shutdown(&mut self) {
        for s in self.slots.drain(..).flatten() {
            s.task.abort();
            let _ = s.task.await;
        }
    }
}

pub struct Client {
    opts: ClientOptions,
    listening: watch::Sender<Vec<SocketAddr>>,
    /// Packets queued by the public API for the live session.
    cmd_tx: mpsc::Sender<Packet>,
    cmd_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    chat: ChatFeed,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.session.room.trim().is_empty() {
            anyhow::bail!("client: room is required");
        }
        if opts.local_ports.len() > MAX_PORTS {
            anyhow::bail!("client: at most {MAX_PORTS} local ports");
        }
        if opts.max_pipes == 0 {
            opts.max_pipes = CLIENT_MAX_PIPES;
        }
        chat::nickname(&opts.nickname)?;
        let (listening, _) = watch::channel(Vec::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        Ok(Self {
            opts,
            listening,
            cmd_tx,
            cmd_rx: tokio::sync::Mutex::new(cmd_rx),
            chat: ChatFeed::new("client"),
        })
    }

    /// Addresses of the local listeners while logged in; empty otherwise.
    pub fn listening(&self) -> watch::Receiver<Vec<SocketAddr>> {
        self.listening.subscribe()
    }

    pub fn chat_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.chat.subscribe()
    }

    async fn queue(&self, pkt: Packet) -> anyhow::Result<()> {
        self.cmd_tx
            .send(pkt)
            .await
            .map_err(|_| anyhow::anyhow!("client: not running"))
    }

    /// `to` is a room index (0 is the host) or [`protocol::EVERYONE`].
    pub async fn send_message(&self, to: u32, text: &str) -> anyhow::Result<()> {
        self.queue(chat::message(to, text)?).await
    }

    /// Whether to hear other clients. The host always gets through.
    pub async fn set_chat(&self, enabled: bool) -> anyhow::Result<()> {
        let op = if enabled { ChatOp::Enable } else { ChatOp::Disable };
        self.queue(Packet::MsgOp { op, arg: 0 }).await
    }

    pub async fn set_nickname(&self, name: &str) -> anyhow::Result<()> {
        self.queue(chat::nickname(name)?).await
    }

    /// The roster arrives as [`ChatEvent::Roster`].
    pub async fn request_onlines(&self) -> anyhow::Result<()> {
        self.queue(Packet::Onlines(Vec::new())).await
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        server=%self.opts.session.server_addr,
                        room=%self.opts.session.room,
                        err=%err,
                        backoff=%humantime::format_duration(backoff),
                        "client: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let mut sess = ControlSession::connect(&self.opts.session).await?;
        let req = ConnectRequest {
            owner: false,
            flags: 0,
            room: self.opts.session.room.clone(),
            token: self.opts.session.token.clone(),
            motd: String::new(),
            ports: Vec::new(),
        };
        let logon = sess.login(req, self.opts.session.connect_timeout).await?;
        if !logon.motd.is_empty() {
            tracing::info!(motd=%logon.motd, "client: motd");
        }
        if !self.opts.nickname.is_empty() {
            sess.send(Packet::Nickname(self.opts.nickname.clone())).await?;
        }
        if self.opts.chat {
            sess.send(Packet::MsgOp {
                op: ChatOp::Enable,
                arg: 0,
            })
            .await?;
        }

        let (accept_tx, mut accept_rx) = mpsc::channel::<(u8, TcpStream)>(64);
        let mut listeners = Listeners::new(accept_tx);
        let res = match listeners.apply(&self.opts, &logon.ports, true).await {
            Ok(()) => {
                let addrs = listeners.addrs();
                tracing::info!(
                    server=%sess.server_addr(),
                    room=%self.opts.session.room,
                    index=logon.room_index,
                    listening=?addrs,
                    encrypted=logon.encrypted(),
                    "client: joined room"
                );
                self.listening.send_replace(addrs);
                self.serve(&mut sess, &logon, &mut listeners, &mut accept_rx, &mut shutdown)
                    .await
            }
            Err(err) => Err(err.into()),
        };

        listeners.shutdown().await;
        self.listening.send_replace(Vec::new());
        sess.shutdown().await;
        res
    }

    async fn serve(
        &self,
        sess: &mut ControlSession,
        logon: &Logon,
        listeners: &mut Listeners,
        accept_rx: &mut mpsc::Receiver<(u8, TcpStream)>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let (up_tx, mut up_rx) = mpsc::channel::<Upstream>(256);
        let mut pipes = Pipes::default();
        let mut cmds = self.cmd_rx.lock().await;
        let mut tick = tokio::time::interval(REAP_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let res = loop {
            let read_deadline = sess.read_deadline();
            let step = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                    Ok(())
                }
                pkt = sess.recv() => match pkt.map(|p| self.chat.offer(p)) {
                    Ok(None) => Ok(()),
                    Ok(Some(Packet::Ports(ports))) => {
                        self.on_ports(sess, listeners, &mut pipes, ports).await
                    }
                    Ok(Some(pkt)) => on_packet(sess, logon, &mut pipes, pkt, &up_tx).await,
                    Err(err) => Err(err),
                },
                Some((port_id, local)) = accept_rx.recv() => {
                    self.on_accept(sess, &mut pipes, port_id, local, &up_tx).await
                }
                Some(up) = up_rx.recv() => on_upstream(sess, &mut pipes, up).await,
                Some(pkt) = cmds.recv() => sess.send(pkt).await,
                _ = tokio::time::sleep_until(read_deadline) => sess.on_read_timeout().await,
                _ = tick.tick() => self.reap_idle(sess, &mut pipes).await,
            };
            if let Err(err) = step {
                break Err(err);
            }
        };

        for (_, p) in pipes.live.drain() {
            p.inbox.close();
        }
        res
    }

    /// The host changed its port map: rebind what moved and drop pooled
    /// pipes for positions that no longer exist.
    async fn on_ports(
        &self,
        sess: &mut ControlSession,
        listeners: &mut Listeners,
        pipes: &mut Pipes,
        ports: Vec<u16>,
    ) -> Result<(), SessionError> {
        if ports.is_empty() || ports.len() > MAX_PORTS {
            tracing::debug!(count = ports.len(), "client: port map ignored");
            return Ok(());
        }
        // Refresh failures leave the position unserved rather than ending the session.
        let _ = listeners.apply(&self.opts, &ports, false).await;
        let addrs = listeners.addrs();
        tracing::info!(ports=?ports, listening=?addrs, "client: port map refreshed");
        self.listening.send_replace(addrs);

        let gone: Vec<u32> = pipes
            .live
            .iter()
            .filter(|(_, p)| p.pooled && p.port_id as usize >= ports.len())
            .map(|(id, _)| *id)
            .collect();
        close_pipes(sess, pipes, gone).await
    }

    async fn on_accept(
        &self,
        sess: &mut ControlSession,
        pipes: &mut Pipes,
        port_id: u8,
        local: TcpStream,
        up: &mpsc::Sender<Upstream>,
    ) -> Result<(), SessionError> {
        net::init_socket_pref(&local);

        if let Some(mut ep) = pipes.take_pooled(port_id) {
            let pipe_id = ep.pipe_id;
            let stale = ep.drain_stale();
            tracing::debug!(pipe=pipe_id, port=port_id, stale, "client: reusing pooled pipe");
            ep.idle.touch();
            sess.send(Packet::ChannelReset {
                peer: MASTER_INDEX,
                pipe_id,
            })
            .await?;
            tokio::spawn(client_pipe(ep, local, up.clone()));
            return Ok(());
        }

        if pipes.in_use() >= self.opts.max_pipes {
            // Make room by giving up the longest idle pooled pipe, if any.
            let victims = pipes.stale(None);
            if victims.is_empty() {
                tracing::warn!(port=port_id, max=self.opts.max_pipes, "client: pipe limit reached; dropping connection");
                return Ok(());
            }
            close_pipes(sess, pipes, victims).await?;
        }

        let secret: Secret = rand::random();
        sess.send(Packet::RequestChannel { port_id, secret }).await?;
        pipes.pending.push_back(PendingPipe {
            port_id,
            secret,
            local,
        });
        Ok(())
    }

    async fn reap_idle(&self, sess: &mut ControlSession, pipes: &mut Pipes) -> Result<(), SessionError> {
        let limit = self.opts.pipe_idle_timeout;
        if limit.is_zero() {
            return Ok(());
        }
        let idle = pipes.stale(Some(limit));
        if !idle.is_empty() {
            tracing::debug!(pipes=?idle, "client: idle pooled pipes reaped");
        }
        close_pipes(sess, pipes, idle).await
    }
}

async fn close_pipes(sess: &mut ControlSession, pipes: &mut Pipes, ids: Vec<u32>) -> Result<(), SessionError> {
    for pipe_id in ids {
        if let Some(p) = pipes.remove(pipe_id) {
            p.inbox.close();
            sess.send(Packet::ChannelClose {
                peer: MASTER_INDEX,
                pipe_id,
            })
            .await?;
        }
    }
    Ok(())
}

async fn on_packet(
    sess: &mut ControlSession,
    logon: &Logon,
    pipes: &mut Pipes,
    pkt: Packet,
    up: &mpsc::Sender<Upstream>,
) -> Result<(), SessionError> {
    match pkt {
        Packet::Heartbeat => {}
        Packet::ChannelResult { pipe_id, secret } => {
            let Some(pending) = pipes.pending.pop_front() else {
                return Err(SessionError::Unexpected("channel_result"));
            };
            let cipher: Option<Box<dyn PipeCipher>> = if logon.encrypted() {
                match ChaChaPipe::derive(&pending.secret, &secret, Side::Client) {
                    Ok(c) => Some(Box::new(c)),
                    Err(err) => {
                        tracing::warn!(pipe=pipe_id, err=%err, "client: pipe key derivation failed");
                        return sess
                            .send(Packet::ChannelClose {
                                peer: MASTER_INDEX,
                                pipe_id,
                            })
                            .await;
                    }
                }
            } else {
                None
            };

            let (ep, inbox) = PipeEndpoint::new(pipe_id, pending.port_id, cipher);
            pipes.live.insert(
                pipe_id,
                ClientPipe {
                    port_id: pending.port_id,
                    inbox,
                    idle: ep.idle.clone(),
                    pooled: false,
                    resets_unacked: 0,
                },
            );
            tracing::debug!(pipe=pipe_id, port=pending.port_id, "client: pipe open");
            tokio::spawn(client_pipe(ep, pending.local, up.clone()));
        }
        Packet::ChannelDeny { peer, code, reason } => {
            let Some(pending) = pipes.pending.pop_front() else {
                return Err(SessionError::Unexpected("channel_deny"));
            };
            let origin = if peer == SERVER_ORIGIN { "server" } else { "host" };
            tracing::warn!(
                origin,
                port=pending.port_id,
                code=%code,
                reason=%reason,
                "client: pipe denied"
            );
        }
        Packet::ServerData(payload) => {
            let (pipe_id, chunk) = match protocol::split_pipe_frame(payload) {
                Ok(v) => v,
                Err(err) => {
                    tracing::debug!(err=%err, "client: bad pipe frame");
                    return Ok(());
                }
            };
            let queued = match pipes.live.get(&pipe_id) {
                None => {
                    tracing::debug!(pipe=pipe_id, "client: data for unknown pipe");
                    return Ok(());
                }
                Some(p) if p.pooled || p.resets_unacked > 0 => {
                    tracing::debug!(pipe=pipe_id, bytes=chunk.len(), "client: dropping data of a finished connection");
                    return Ok(());
                }
                Some(p) => p.inbox.data(chunk),
            };
            if !queued {
                tracing::warn!(pipe=pipe_id, "client: pipe backlog full; closing");
                close_pipes(sess, pipes, vec![pipe_id]).await?;
            }
        }
        Packet::ChannelClose { pipe_id, .. } => {
            if let Some(p) = pipes.remove(pipe_id) {
                p.inbox.close();
                tracing::debug!(pipe=pipe_id, "client: pipe closed by host");
            }
        }
        Packet::ChannelReset { pipe_id, .. } => match pipes.live.get_mut(&pipe_id) {
            Some(p) if p.resets_unacked > 0 => {
                p.resets_unacked -= 1;
                tracing::debug!(pipe=pipe_id, "client: host redialed");
            }
            _ => tracing::debug!(pipe=pipe_id, "client: unsolicited reset ignored"),
        },
        Packet::State(s) => tracing::debug!(state=?s, "client: relay report"),
        Packet::Motd(m) => tracing::info!(motd=%m, "client: motd"),
        Packet::Logout => return Err(SessionError::LoggedOut),
        Packet::Error(code) => return Err(SessionError::Refused(code)),
        other => return Err(SessionError::Unexpected(other.kind())),
    }
    Ok(())
}

async fn on_upstream(sess: &mut ControlSession, pipes: &mut Pipes, up: Upstream) -> Result<(), SessionError> {
    match up {
        Upstream::Data { pipe_id, chunk } => {
            if pipes.live.contains_key(&pipe_id) {
                sess.send(Packet::Data(protocol::pipe_frame(pipe_id, &chunk)))
                    .await?;
            }
        }
        Upstream::Detached(ep) => {
            // Keep the pipe for the next connection on this port.
            if let Some(p) = pipes.live.get_mut(&ep.pipe_id) {
                p.pooled = true;
                p.idle.touch();
                pipes.free.entry(ep.port_id).or_default().push(ep);
            }
        }
        Upstream::ResetDone { .. } => {}
        Upstream::Closed {
            pipe_id,
            notify_peer,
        } => {
            if pipes.remove(pipe_id).is_some() && notify_peer {
                sess.send(Packet::ChannelClose {
                    peer: MASTER_INDEX,
                    pipe_id,
                })
                .await?;
            }
        }
    }
    Ok(())
}

async fn client_pipe(ep: PipeEndpoint, local: TcpStream, up: mpsc::Sender<Upstream>) {
    let msg = match pipe::splice(ep, local, &up).await {
        SpliceEnd::LocalClosed(ep) | SpliceEnd::Reset(ep) => Upstream::Detached(ep),
        SpliceEnd::RemoteClosed { .. } => return,
        SpliceEnd::Corrupt { pipe_id } => Upstream::Closed {
            pipe_id,
            notify_peer: true,
        },
    };
    let _ = up.send(msg).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::aerelay::codec::ControlCodec;
    use crate::aerelay::host::{Host, HostOptions};
    use crate::aerelay::protocol::{Online, EVERYONE};
    use crate::aerelay::server::{Server, ServerOptions};

    const T: Duration = Duration::from_secs(3);

    type Peer = Framed<TcpStream, ControlCodec>;

    async fn start_server() -> (Arc<Server>, SocketAddr, watch::Sender<bool>) {
        let server = Server::new(ServerOptions::default());
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.clone().serve(ln, rx));
        (server, addr, tx)
    }

    async fn recv(c: &mut Peer) -> Packet {
        tokio::time::timeout(T, c.next())
            .await
            .expect("timed out waiting for packet")
            .expect("connection closed")
            .expect("decode failed")
    }

    /// Opens the room as a hand-driven host.
    async fn scripted_host(addr: SocketAddr, ports: Vec<u16>) -> Peer {
        let mut s = TcpStream::connect(addr).await.unwrap();
        protocol::write_hello(&mut s).await.unwrap();
        protocol::read_hello_reply(&mut s).await.unwrap();
        let mut host = Framed::new(s, ControlCodec::default());
        host.send(Packet::Connect(ConnectRequest {
            owner: true,
            flags: 0,
            room: "svc".into(),
            token: "tok".into(),
            motd: String::new(),
            ports,
        }))
        .await
        .unwrap();
        assert!(matches!(recv(&mut host).await, Packet::Logon(_)));
        host
    }

    /// Answers the next channel request with `pipe_id`.
    async fn grant(host: &mut Peer, pipe_id: u32) {
        match recv(host).await {
            Packet::ChannelRequest { from, port_id, .. } => {
                assert_eq!(from, 1);
                assert_eq!(port_id, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
        host.send(Packet::ChannelOpen {
            client: 1,
            pipe_id,
            secret: [5; 32],
        })
        .await
        .unwrap();
    }

    async fn echo_service() -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 16 * 1024];
                    while let Ok(n) = s.read(&mut buf).await {
                        if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    async fn start_host(server: &Server, addr: SocketAddr, opts: HostOptions) -> (Arc<Host>, watch::Sender<bool>) {
        let host = Arc::new(Host::new(HostOptions {
            session: SessionOptions {
                server_addr: addr.to_string(),
                room: "svc".into(),
                token: "tok".into(),
                ..Default::default()
            },
            ..opts
        })
        .unwrap());
        let (stop, rx) = watch::channel(false);
        let h = host.clone();
        tokio::spawn(async move { h.run(rx).await });
        let deadline = tokio::time::Instant::now() + T;
        while server.snapshot_rooms().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "host never opened room");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (host, stop)
    }

    fn client_opts(server: SocketAddr) -> ClientOptions {
        ClientOptions {
            session: SessionOptions {
                server_addr: server.to_string(),
                room: "svc".into(),
                token: "tok".into(),
                ..Default::default()
            },
            local_ports: vec![0],
            ..Default::default()
        }
    }

    async fn start_client(opts: ClientOptions) -> (Arc<Client>, SocketAddr, watch::Sender<bool>) {
        let client = Arc::new(Client::new(opts).unwrap());
        let mut rx = client.listening();
        let (stop, stop_rx) = watch::channel(false);
        let c = client.clone();
        tokio::spawn(async move { c.run(stop_rx).await });
        let addrs = tokio::time::timeout(T, rx.wait_for(|a| !a.is_empty()))
            .await
            .expect("client never listened")
            .unwrap()
            .clone();
        (client, addrs[0], stop)
    }

    async fn next_chat(rx: &mut broadcast::Receiver<ChatEvent>) -> ChatEvent {
        tokio::time::timeout(T, rx.recv())
            .await
            .expect("timed out waiting for chat")
            .unwrap()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn closed_local_connection_parks_pipe_for_reuse() {
        let (_server, addr, _stop) = start_server().await;
        let mut host = scripted_host(addr, vec![9999]).await;

        let (_client, local, _client_stop) = start_client(client_opts(addr)).await;
        assert!(matches!(
            recv(&mut host).await,
            Packet::SlaveConnect { index: 1, .. }
        ));

        let mut app = TcpStream::connect(local).await.unwrap();
        grant(&mut host, 77).await;

        app.write_all(b"a").await.unwrap();
        assert_eq!(
            recv(&mut host).await,
            Packet::ServerSlaveData {
                from: 1,
                payload: protocol::pipe_frame(77, b"a"),
            }
        );
        host.send(Packet::Data(protocol::master_data(77, b"b", 1)))
            .await
            .unwrap();
        let mut got = [0u8; 1];
        app.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"b");

        drop(app);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut again = TcpStream::connect(local).await.unwrap();
        assert_eq!(
            recv(&mut host).await,
            Packet::ChannelReset { peer: 1, pipe_id: 77 }
        );
        host.send(Packet::ChannelReset { peer: 1, pipe_id: 77 })
            .await
            .unwrap();
        again.write_all(b"c").await.unwrap();
        assert_eq!(
            recv(&mut host).await,
            Packet::ServerSlaveData {
                from: 1,
                payload: protocol::pipe_frame(77, b"c"),
            }
        );
        host.send(Packet::Data(protocol::master_data(77, b"d", 1)))
            .await
            .unwrap();
        tokio::time::timeout(T, again.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"d");
    }

    #[tokio::test]
    async fn reused_pipe_only_delivers_data_sent_after_the_reset() {
        let (_server, addr, _stop) = start_server().await;
        let mut host = scripted_host(addr, vec![9999]).await;
        let (_client, local, _client_stop) = start_client(client_opts(addr)).await;
        assert!(matches!(recv(&mut host).await, Packet::SlaveConnect { .. }));

        let app = TcpStream::connect(local).await.unwrap();
        grant(&mut host, 5).await;
        drop(app);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The host has not seen a reset yet; its old connection still talks.
        host.send(Packet::Data(protocol::master_data(5, b"WHILE-POOLED", 1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut app = TcpStream::connect(local).await.unwrap();
        assert_eq!(
            recv(&mut host).await,
            Packet::ChannelReset { peer: 1, pipe_id: 5 }
        );
        host.send(Packet::Data(protocol::master_data(5, b"OLD-SESSION", 1)))
            .await
            .unwrap();
        host.send(Packet::ChannelReset { peer: 1, pipe_id: 5 })
            .await
            .unwrap();
        host.send(Packet::Data(protocol::master_data(5, b"new", 1)))
            .await
            .unwrap();

        let mut got = [0u8; 3];
        tokio::time::timeout(T, app.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"new");
        let mut more = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(200), app.read(&mut more))
                .await
                .is_err(),
            "no bytes beyond the new session's"
        );
    }

    #[tokio::test]
    async fn deny_without_a_pending_request_ends_the_session() {
        let (_server, addr, _stop) = start_server().await;
        let mut host = scripted_host(addr, vec![9999]).await;
        let (_client, _local, _client_stop) = start_client(client_opts(addr)).await;
        assert!(matches!(
            recv(&mut host).await,
            Packet::SlaveConnect { index: 1, .. }
        ));

        host.send(Packet::ChannelDeny {
            peer: 1,
            code: protocol::ErrorCode::SystemLimit,
            reason: "nothing asked".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            recv(&mut host).await,
            Packet::SlaveDisconnect { index: 1 }
        );
    }

    #[tokio::test]
    async fn port_map_refresh_rebinds_listeners() {
        let a = free_port();
        let b = loop {
            let p = free_port();
            if p != a {
                break p;
            }
        };
        let (_server, addr, _stop) = start_server().await;
        let mut host = scripted_host(addr, vec![a]).await;

        let mut opts = client_opts(addr);
        opts.local_ports.clear();
        let (client, first, _client_stop) = start_client(opts).await;
        assert_eq!(first.port(), a);
        assert!(matches!(recv(&mut host).await, Packet::SlaveConnect { .. }));
        let mut listening = client.listening();

        host.send(Packet::Ports(vec![a, b])).await.unwrap();
        let addrs = tokio::time::timeout(T, listening.wait_for(|l| l.len() == 2))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(addrs[0], first);
        assert_eq!(addrs[1].port(), b);

        let _app = TcpStream::connect(addrs[1]).await.unwrap();
        match recv(&mut host).await {
            Packet::ChannelRequest { port_id, .. } => assert_eq!(port_id, 1),
            other => panic!("unexpected: {other:?}"),
        }

        host.send(Packet::Ports(vec![b])).await.unwrap();
        let addrs = tokio::time::timeout(T, listening.wait_for(|l| l.len() == 1))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(addrs[0].port(), b);
        assert!(TcpStream::connect(first).await.is_err());

        let _app = TcpStream::connect(addrs[0]).await.unwrap();
        match recv(&mut host).await {
            Packet::ChannelRequest { port_id, .. } => assert_eq!(port_id, 0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bulk_interleaved_echo_through_the_relay() {
        const LEN: usize = 256 * 1024;
        let service = echo_service().await;
        let (server, addr, _stop) = start_server().await;
        let (_host, _host_stop) = start_host(
            &server,
            addr,
            HostOptions {
                ports: vec![service],
                ..Default::default()
            },
        )
        .await;
        let (_client, local, _client_stop) = start_client(client_opts(addr)).await;

        let mut apps = Vec::new();
        for seed in 0..2u8 {
            apps.push(tokio::spawn(async move {
                let data: Vec<u8> = (0..LEN).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
                let (mut rd, mut wr) = TcpStream::connect(local).await.unwrap().into_split();
                let sent = data.clone();
                let writer = tokio::spawn(async move {
                    for chunk in sent.chunks(7 * 1024) {
                        wr.write_all(chunk).await.unwrap();
                    }
                    wr
                });
                let mut got = vec![0u8; LEN];
                rd.read_exact(&mut got).await.unwrap();
                let _wr = writer.await.unwrap();
                assert!(got == data, "echo {seed} corrupted");
            }));
        }
        for app in apps {
            tokio::time::timeout(Duration::from_secs(20), app)
                .await
                .expect("echo stalled")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn clients_chat_only_after_opting_in() {
        let service = echo_service().await;
        let (server, addr, _stop) = start_server().await;
        let (host, _host_stop) = start_host(
            &server,
            addr,
            HostOptions {
                ports: vec![service],
                ..Default::default()
            },
        )
        .await;

        let mut opts = client_opts(addr);
        opts.nickname = "alice".into();
        opts.chat = true;
        let (alice, _, _alice_stop) = start_client(opts).await;
        let mut alice_rx = alice.chat_events();
        alice.request_onlines().await.unwrap();
        match next_chat(&mut alice_rx).await {
            ChatEvent::Roster(list) => assert!(list.contains(&Online {
                index: 1,
                nickname: "alice".into(),
            })),
            other => panic!("unexpected: {other:?}"),
        }

        let (bob, _, _bob_stop) = start_client(client_opts(addr)).await;
        let mut bob_rx = bob.chat_events();

        bob.send_message(1, "hi alice").await.unwrap();
        assert_eq!(
            next_chat(&mut alice_rx).await,
            ChatEvent::Message {
                from: 2,
                text: "hi alice".into(),
            }
        );

        // Bob never opted in.
        alice.send_message(2, "hi bob").await.unwrap();
        assert_eq!(next_chat(&mut alice_rx).await, ChatEvent::Undelivered { peer: 2 });

        host.send_message(EVERYONE, "welcome").await.unwrap();
        assert_eq!(
            next_chat(&mut bob_rx).await,
            ChatEvent::Message {
                from: MASTER_INDEX,
                text: "welcome".into(),
            }
        );
    }

    #[test]
    fn options_are_validated() {
        assert!(Client::new(ClientOptions::default()).is_err());
        let mut opts = client_opts("127.0.0.1:1".parse().unwrap());
        opts.max_pipes = 0;
        let client = Client::new(opts.clone()).unwrap();
        assert_eq!(client.opts.max_pipes, CLIENT_MAX_PIPES);
        opts.local_ports = vec![0; MAX_PORTS + 1];
        assert!(Client::new(opts).is_err());
    }
}
