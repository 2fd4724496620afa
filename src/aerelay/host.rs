//! Host role: owns a room and serves pipes from local services.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use crate::aerelay::chat::{self, ChatEvent, ChatFeed};
use crate::aerelay::cipher::{ChaChaPipe, PipeCipher, Side};
use crate::aerelay::net;
use crate::aerelay::pipe::{self, IdleClock, PipeEndpoint, PipeSender, SpliceEnd, Upstream};
use crate::aerelay::protocol::{
    self, ChatOp, ConnectRequest, ErrorCode, Packet, Secret, FLAG_ENCRYPTED, MASTER_INDEX,
    MAX_PORTS,
};
use crate::aerelay::session::{ControlSession, SessionError, SessionOptions};

pub const HOST_MAX_PIPES: usize = 100;
const REAP_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub session: SessionOptions,
    pub motd: String,
    /// Local service ports, exposed to clients in this order.
    pub ports: Vec<u16>,
    pub local_host: String,
    pub nickname: String,
    pub max_pipes: usize,
    pub encrypt_pipes: bool,
    pub dial_timeout: Duration,
    /// Zero disables reaping.
    pub pipe_idle_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            motd: String::new(),
            ports: Vec::new(),
            local_host: "127.0.0.1".into(),
            nickname: String::new(),
            max_pipes: HOST_MAX_PIPES,
            encrypt_pipes: false,
            dial_timeout: Duration::from_secs(5),
            pipe_idle_timeout: Duration::from_secs(600),
        }
    }
}

fn check_ports(ports: &[u16]) -> anyhow::Result<()> {
    if ports.is_empty() || ports.len() > MAX_PORTS {
        anyhow::bail!("host: expose between 1 and {MAX_PORTS} ports");
    }
    Ok(())
}

struct HostPipe {
    client: u32,
    inbox: PipeSender,
    idle: IdleClock,
}

pub struct Host {
    opts: HostOptions,
    ports: Arc<ArcSwap<Vec<u16>>>,
    /// Packets queued by the public API for the live session.
    cmd_tx: mpsc::Sender<Packet>,
    cmd_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    clients: Arc<Mutex<BTreeMap<u32, SocketAddr>>>,
    chat: ChatFeed,
}

impl Host {
    pub fn new(mut opts: HostOptions) -> anyhow::Result<Self> {
        if opts.session.room.trim().is_empty() {
            anyhow::bail!("host: room is required");
        }
        check_ports(&opts.ports)?;
        if opts.max_pipes == 0 {
            opts.max_pipes = HOST_MAX_PIPES;
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        Ok(Self {
            ports: Arc::new(ArcSwap::from_pointee(opts.ports.clone())),
            opts,
            cmd_tx,
            cmd_rx: tokio::sync::Mutex::new(cmd_rx),
            clients: Arc::new(Mutex::new(BTreeMap::new())),
            chat: ChatFeed::new("host"),
        })
    }

    /// Clients currently in the room, by room index.
    pub fn clients(&self) -> Vec<(u32, SocketAddr)> {
        match self.clients.lock() {
            Ok(c) => c.iter().map(|(i, a)| (*i, *a)).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// The port map currently exposed.
    pub fn ports(&self) -> Vec<u16> {
        self.ports.load().to_vec()
    }

    pub fn chat_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.chat.subscribe()
    }

    async fn queue(&self, pkt: Packet) -> anyhow::Result<()> {
        self.cmd_tx
            .send(pkt)
            .await
            .map_err(|_| anyhow::anyhow!("host: not running"))
    }

    /// Asks the server to kick a client out of the room.
    pub async fn kick(&self, index: u32) -> anyhow::Result<()> {
        self.queue(Packet::KickSlave { index }).await
    }

    /// Replaces the exposed port map. Open pipes keep their connection;
    /// later dials and redials use the new map.
    pub async fn refresh_ports(&self, ports: Vec<u16>) -> anyhow::Result<()> {
        check_ports(&ports)?;
        self.ports.store(Arc::new(ports.clone()));
        tracing::info!(ports=?ports, "host: port map refreshed");
        self.queue(Packet::Ports(ports)).await
    }

    /// `to` is a client index or [`protocol::EVERYONE`].
    pub async fn send_message(&self, to: u32, text: &str) -> anyhow::Result<()> {
        if to == MASTER_INDEX {
            anyhow::bail!("host: cannot message itself");
        }
        self.queue(chat::message(to, text)?).await
    }

    pub async fn chat_op(&self, op: ChatOp, arg: u32) -> anyhow::Result<()> {
        self.queue(Packet::MsgOp { op, arg }).await
    }

    pub async fn set_nickname(&self, name: &str) -> anyhow::Result<()> {
        self.queue(chat::nickname(name)?).await
    }

    /// The roster arrives as [`ChatEvent::Roster`].
    pub async fn request_onlines(&self) -> anyhow::Result<()> {
        self.queue(Packet::Onlines(Vec::new())).await
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
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
                        "host: disconnected; retrying"
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

    async fn run_once(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), SessionError> {
        let mut sess = ControlSession::connect(&self.opts.session).await?;
        let ports = self.ports();
        let req = ConnectRequest {
            owner: true,
            flags: if self.opts.encrypt_pipes { FLAG_ENCRYPTED } else { 0 },
            room: self.opts.session.room.clone(),
            token: self.opts.session.token.clone(),
            motd: self.opts.motd.clone(),
            ports: ports.clone(),
        };
        sess.login(req, self.opts.session.connect_timeout).await?;
        tracing::info!(
            server=%sess.server_addr(),
            room=%self.opts.session.room,
            ports=?ports,
            encrypted=self.opts.encrypt_pipes,
            "host: room open"
        );
        if !self.opts.nickname.is_empty() {
            sess.send(Packet::Nickname(self.opts.nickname.clone())).await?;
        }

        let (up_tx, mut up_rx) = mpsc::channel::<Upstream>(256);
        let mut pipes: HashMap<u32, HostPipe> = HashMap::new();
        let mut next_pipe_id: u32 = 1;
        let mut cmds = self.cmd_rx.lock().await;
        let mut tick = tokio::time::interval(REAP_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let res = loop {
            let read_deadline = sess.read_deadline();
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                pkt = sess.recv() => {
                    let step = match pkt {
                        Ok(pkt) => self.on_packet(&mut sess, &mut pipes, &mut next_pipe_id, pkt, &up_tx).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = step {
                        break Err(err);
                    }
                }
                Some(up) = up_rx.recv() => {
                    if let Err(err) = on_upstream(&mut sess, &mut pipes, up).await {
                        break Err(err);
                    }
                }
                Some(pkt) = cmds.recv() => {
                    if let Err(err) = sess.send(pkt).await {
                        break Err(err);
                    }
                }
                _ = tokio::time::sleep_until(read_deadline) => {
                    if let Err(err) = sess.on_read_timeout().await {
                        break Err(err);
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = self.reap_idle(&mut sess, &mut pipes).await {
                        break Err(err);
                    }
                }
            }
        };

        for (_, p) in pipes.drain() {
            p.inbox.close();
        }
        if let Ok(mut c) = self.clients.lock() {
            c.clear();
        }
        sess.shutdown().await;
        res
    }

    async fn on_packet(
        &self,
        sess: &mut ControlSession,
        pipes: &mut HashMap<u32, HostPipe>,
        next_pipe_id: &mut u32,
        pkt: Packet,
        up: &mpsc::Sender<Upstream>,
    ) -> Result<(), SessionError> {
        let Some(pkt) = self.chat.offer(pkt) else {
            return Ok(());
        };
        match pkt {
            Packet::Heartbeat => {}
            Packet::SlaveConnect { index, addr } => {
                if let Ok(mut c) = self.clients.lock() {
                    c.insert(index, addr);
                }
                tracing::info!(index, addr=%addr, "host: client joined");
            }
            Packet::SlaveDisconnect { index } => {
                if let Ok(mut c) = self.clients.lock() {
                    c.remove(&index);
                }
                pipes.retain(|_, p| {
                    if p.client == index {
                        p.inbox.close();
                        false
                    } else {
                        true
                    }
                });
                tracing::info!(index, "host: client left");
            }
            Packet::ChannelRequest {
                from,
                port_id,
                secret,
            } => {
                self.open_pipe(sess, pipes, next_pipe_id, from, port_id, secret, up)
                    .await?;
            }
            Packet::ServerSlaveData { from, payload } => {
                let (pipe_id, chunk) = match protocol::split_pipe_frame(payload) {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::debug!(from, err=%err, "host: bad pipe frame");
                        return Ok(());
                    }
                };
                let queued = match pipes.get(&pipe_id) {
                    Some(p) if p.client == from => p.inbox.data(chunk),
                    _ => {
                        tracing::debug!(from, pipe=pipe_id, "host: data for unknown pipe");
                        return Ok(());
                    }
                };
                if !queued {
                    tracing::warn!(client=from, pipe=pipe_id, "host: pipe backlog full; closing");
                    if let Some(p) = pipes.remove(&pipe_id) {
                        p.inbox.close();
                    }
                    sess.send(Packet::ChannelClose { peer: from, pipe_id }).await?;
                }
            }
            Packet::ChannelReset { peer, pipe_id } => match pipes.get(&pipe_id) {
                Some(p) if p.client == peer => p.inbox.reset(),
                _ => {
                    tracing::debug!(peer, pipe=pipe_id, "host: reset for unknown pipe");
                    sess.send(Packet::ChannelClose { peer, pipe_id }).await?;
                }
            },
            Packet::ChannelClose { peer, pipe_id } => {
                if pipes.get(&pipe_id).is_some_and(|p| p.client == peer) {
                    if let Some(p) = pipes.remove(&pipe_id) {
                        p.inbox.close();
                    }
                }
            }
            Packet::State(s) => tracing::debug!(state=?s, "host: relay report"),
            Packet::Motd(m) => tracing::debug!(motd=%m, "host: motd"),
            Packet::Logout => return Err(SessionError::LoggedOut),
            Packet::Error(code) => return Err(SessionError::Refused(code)),
            other => return Err(SessionError::Unexpected(other.kind())),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_pipe(
        &self,
        sess: &mut ControlSession,
        pipes: &mut HashMap<u32, HostPipe>,
        next_pipe_id: &mut u32,
        from: u32,
        port_id: u8,
        client_secret: Secret,
        up: &mpsc::Sender<Upstream>,
    ) -> Result<(), SessionError> {
        let known = self
            .clients
            .lock()
            .map(|c| c.contains_key(&from))
            .unwrap_or(false);
        let deny = if pipes.len() >= self.opts.max_pipes {
            Some((
                ErrorCode::SystemLimit,
                format!("host pipe limit {} reached", self.opts.max_pipes),
            ))
        } else if !known {
            Some((ErrorCode::NotConnected, "unknown client".to_string()))
        } else if port_id as usize >= self.ports.load().len() {
            Some((ErrorCode::SystemLimit, format!("no port #{port_id}")))
        } else {
            None
        };
        if let Some((code, reason)) = deny {
            tracing::info!(client=from, port=port_id, code=%code, reason=%reason, "host: pipe denied");
            return sess
                .send(Packet::ChannelDeny {
                    peer: from,
                    code,
                    reason,
                })
                .await;
        }

        let pipe_id = *next_pipe_id;
        *next_pipe_id = next_pipe_id.wrapping_add(1).max(1);

        let host_secret: Secret = rand::random();
        let cipher: Option<Box<dyn PipeCipher>> = if self.opts.encrypt_pipes {
            match ChaChaPipe::derive(&client_secret, &host_secret, Side::Host) {
                Ok(c) => Some(Box::new(c)),
                Err(err) => {
                    tracing::warn!(client=from, err=%err, "host: pipe key derivation failed");
                    return sess
                        .send(Packet::ChannelDeny {
                            peer: from,
                            code: ErrorCode::Io,
                            reason: "key derivation failed".into(),
                        })
                        .await;
                }
            }
        } else {
            None
        };

        sess.send(Packet::ChannelOpen {
            client: from,
            pipe_id,
            secret: host_secret,
        })
        .await?;

        let (ep, inbox) = PipeEndpoint::new(pipe_id, port_id, cipher);
        pipes.insert(
            pipe_id,
            HostPipe {
                client: from,
                inbox,
                idle: ep.idle.clone(),
            },
        );

        tracing::debug!(client=from, pipe=pipe_id, port=port_id, "host: pipe open");
        tokio::spawn(serve_pipe(
            ep,
            self.ports.clone(),
            self.opts.local_host.trim().to_string(),
            self.opts.dial_timeout,
            up.clone(),
        ));
        Ok(())
    }

    async fn reap_idle(
        &self,
        sess: &mut ControlSession,
        pipes: &mut HashMap<u32, HostPipe>,
    ) -> Result<(), SessionError> {
        let limit = self.opts.pipe_idle_timeout;
        if limit.is_zero() {
            return Ok(());
        }
        let idle: Vec<u32> = pipes
            .iter()
            .filter(|(_, p)| p.idle.idle_for() > limit)
            .map(|(id, _)| *id)
            .collect();
        for pipe_id in idle {
            if let Some(p) = pipes.remove(&pipe_id) {
                p.inbox.close();
                tracing::debug!(pipe=pipe_id, client=p.client, "host: idle pipe reaped");
                sess.send(Packet::ChannelClose {
                    peer: p.client,
                    pipe_id,
                })
                .await?;
            }
        }
        Ok(())
    }
}

async fn on_upstream(
    sess: &mut ControlSession,
    pipes: &mut HashMap<u32, HostPipe>,
    up: Upstream,
) -> Result<(), SessionError> {
    match up {
        Upstream::Data { pipe_id, chunk } => {
            if let Some(p) = pipes.get(&pipe_id) {
                let payload = protocol::master_data(pipe_id, &chunk, p.client);
                sess.send(Packet::Data(payload)).await?;
            }
        }
        Upstream::ResetDone { pipe_id } => {
            // Everything before this went out already; tell the client to
            // stop discarding.
            if let Some(p) = pipes.get(&pipe_id) {
                sess.send(Packet::ChannelReset {
                    peer: p.client,
                    pipe_id,
                })
                .await?;
            }
        }
        Upstream::Closed {
            pipe_id,
            notify_peer,
        } => {
            if let Some(p) = pipes.remove(&pipe_id) {
                if notify_peer {
                    sess.send(Packet::ChannelClose {
                        peer: p.client,
                        pipe_id,
                    })
                    .await?;
                }
            }
        }
        Upstream::Detached(ep) => {
            // Hosts do not pool; a detached pipe is a closed one.
            if let Some(p) = pipes.remove(&ep.pipe_id) {
                sess.send(Packet::ChannelClose {
                    peer: p.client,
                    pipe_id: ep.pipe_id,
                })
                .await?;
            }
        }
    }
    Ok(())
}

/// Dials the local service and splices it onto the pipe, redialing on reset.
/// The target is looked up on every dial so a refreshed port map applies.
async fn serve_pipe(
    mut ep: PipeEndpoint,
    ports: Arc<ArcSwap<Vec<u16>>>,
    local_host: String,
    dial_timeout: Duration,
    up: mpsc::Sender<Upstream>,
) {
    let pipe_id = ep.pipe_id;
    loop {
        let Some(port) = ports.load().get(ep.port_id as usize).copied() else {
            tracing::info!(pipe=pipe_id, port=ep.port_id, "host: port no longer exposed");
            break;
        };
        let target = format!("{local_host}:{port}");
        let local = match tokio::time::timeout(dial_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(s)) => s,
            Ok(Err(err)) => {
                tracing::warn!(pipe=pipe_id, target=%target, err=%err, "host: local service unreachable");
                break;
            }
            Err(_) => {
                tracing::warn!(pipe=pipe_id, target=%target, "host: local dial timed out");
                break;
            }
        };
        net::init_socket_pref(&local);

        match pipe::splice(ep, local, &up).await {
            SpliceEnd::Reset(e) => {
                tracing::debug!(pipe=pipe_id, "host: pipe reset, redialing");
                if up.send(Upstream::ResetDone { pipe_id }).await.is_err() {
                    return;
                }
                ep = e;
            }
            SpliceEnd::LocalClosed(_) | SpliceEnd::Corrupt { .. } => break,
            SpliceEnd::RemoteClosed { .. } => return,
        }
    }
    let _ = up
        .send(Upstream::Closed {
            pipe_id,
            notify_peer: true,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::watch;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::aerelay::codec::ControlCodec;
    use crate::aerelay::server::{Server, ServerOptions};

    const T: Duration = Duration::from_secs(3);

    /// Writes `greeting` to every connection, then echoes.
    async fn service(greeting: &'static [u8]) -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = ln.accept().await {
                tokio::spawn(async move {
                    if !greeting.is_empty() && s.write_all(greeting).await.is_err() {
                        return;
                    }
                    let mut buf = [0u8; 1024];
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

    async fn echo_service() -> u16 {
        service(b"").await
    }

    async fn start_server() -> (Arc<Server>, SocketAddr, watch::Sender<bool>) {
        let server = Server::new(ServerOptions::default());
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.clone().serve(ln, rx));
        (server, addr, tx)
    }

    async fn wait_for_room(server: &Server) {
        let deadline = tokio::time::Instant::now() + T;
        while server.snapshot_rooms().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "host never opened room");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn raw_client(addr: SocketAddr) -> Framed<TcpStream, ControlCodec> {
        let mut s = TcpStream::connect(addr).await.unwrap();
        protocol::write_hello(&mut s).await.unwrap();
        protocol::read_hello_reply(&mut s).await.unwrap();
        let mut c = Framed::new(s, ControlCodec::default());
        c.send(Packet::Connect(ConnectRequest {
            owner: false,
            flags: 0,
            room: "svc".into(),
            token: "tok".into(),
            motd: String::new(),
            ports: vec![],
        }))
        .await
        .unwrap();
        c
    }

    async fn recv(c: &mut Framed<TcpStream, ControlCodec>) -> Packet {
        tokio::time::timeout(T, c.next())
            .await
            .expect("timed out waiting for packet")
            .expect("connection closed")
            .expect("decode failed")
    }

    async fn open(c: &mut Framed<TcpStream, ControlCodec>, port_id: u8) -> u32 {
        c.send(Packet::RequestChannel {
            port_id,
            secret: [3; 32],
        })
        .await
        .unwrap();
        match recv(c).await {
            Packet::ChannelResult { pipe_id, .. } => pipe_id,
            other => panic!("unexpected: {other:?}"),
        }
    }

    fn host_opts(server: SocketAddr, service_port: u16, max_pipes: usize) -> HostOptions {
        HostOptions {
            session: SessionOptions {
                server_addr: server.to_string(),
                room: "svc".into(),
                token: "tok".into(),
                ..Default::default()
            },
            motd: "echo box".into(),
            ports: vec![service_port],
            max_pipes,
            ..Default::default()
        }
    }

    async fn start_host(opts: HostOptions, server: &Server) -> (Arc<Host>, watch::Sender<bool>) {
        let host = Arc::new(Host::new(opts).unwrap());
        let (stop, rx) = watch::channel(false);
        let h = host.clone();
        tokio::spawn(async move { h.run(rx).await });
        wait_for_room(server).await;
        (host, stop)
    }

    #[tokio::test]
    async fn host_serves_pipe_then_denies_past_its_cap() {
        let service = echo_service().await;
        let (server, addr, _stop) = start_server().await;
        let (host, _host_stop) = start_host(host_opts(addr, service, 1), &server).await;

        let mut c = raw_client(addr).await;
        match recv(&mut c).await {
            Packet::Logon(l) => {
                assert_eq!(l.room_index, 1);
                assert_eq!(l.motd, "echo box");
                assert_eq!(l.ports, vec![service]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let pipe_id = open(&mut c, 0).await;
        c.send(Packet::Data(protocol::pipe_frame(pipe_id, b"hi")))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut c).await,
            Packet::ServerData(protocol::pipe_frame(pipe_id, b"hi"))
        );

        c.send(Packet::RequestChannel {
            port_id: 0,
            secret: [4; 32],
        })
        .await
        .unwrap();
        match recv(&mut c).await {
            Packet::ChannelDeny { peer, code, reason } => {
                assert_eq!(peer, 0);
                assert_eq!(code, ErrorCode::SystemLimit);
                assert!(reason.contains("limit"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(host.clients().len(), 1);
    }

    #[tokio::test]
    async fn default_cap_denies_request_past_host_max_pipes() {
        let service = echo_service().await;
        let (server, addr, _stop) = start_server().await;
        let (_host, _host_stop) = start_host(host_opts(addr, service, 0), &server).await;

        let mut c = raw_client(addr).await;
        assert!(matches!(recv(&mut c).await, Packet::Logon(_)));

        for i in 0..=HOST_MAX_PIPES {
            c.send(Packet::RequestChannel {
                port_id: 0,
                secret: [i as u8; 32],
            })
            .await
            .unwrap();
        }
        let mut ids = std::collections::HashSet::new();
        for _ in 0..HOST_MAX_PIPES {
            match recv(&mut c).await {
                Packet::ChannelResult { pipe_id, .. } => assert!(ids.insert(pipe_id)),
                other => panic!("unexpected: {other:?}"),
            }
        }
        match recv(&mut c).await {
            Packet::ChannelDeny { code, .. } => assert_eq!(code, ErrorCode::SystemLimit),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_is_acknowledged_after_the_old_connection_drains() {
        let service = echo_service().await;
        let (server, addr, _stop) = start_server().await;
        let (_host, _host_stop) = start_host(host_opts(addr, service, 4), &server).await;

        let mut c = raw_client(addr).await;
        assert!(matches!(recv(&mut c).await, Packet::Logon(_)));
        let pipe_id = open(&mut c, 0).await;

        c.send(Packet::Data(protocol::pipe_frame(pipe_id, b"one")))
            .await
            .unwrap();
        c.send(Packet::ChannelReset { peer: 0, pipe_id }).await.unwrap();

        // The echo of "one" may or may not make it out, but never after the ack.
        loop {
            match recv(&mut c).await {
                Packet::ServerData(frame) => {
                    assert_eq!(frame, protocol::pipe_frame(pipe_id, b"one"));
                }
                Packet::ChannelReset { peer, pipe_id: id } => {
                    assert_eq!((peer, id), (0, pipe_id));
                    break;
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        c.send(Packet::Data(protocol::pipe_frame(pipe_id, b"two")))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut c).await,
            Packet::ServerData(protocol::pipe_frame(pipe_id, b"two"))
        );
    }

    #[tokio::test]
    async fn refreshed_port_map_reaches_clients_and_new_pipes() {
        let old = service(b"A").await;
        let new = service(b"B").await;
        let (server, addr, _stop) = start_server().await;
        let (host, _host_stop) = start_host(host_opts(addr, old, 4), &server).await;

        let mut c = raw_client(addr).await;
        assert!(matches!(recv(&mut c).await, Packet::Logon(_)));
        let first = open(&mut c, 0).await;
        assert_eq!(
            recv(&mut c).await,
            Packet::ServerData(protocol::pipe_frame(first, b"A"))
        );

        assert!(host.refresh_ports(vec![]).await.is_err());
        host.refresh_ports(vec![new]).await.unwrap();
        assert_eq!(recv(&mut c).await, Packet::Ports(vec![new]));
        assert_eq!(host.ports(), vec![new]);
        assert_eq!(server.snapshot_rooms()[0].ports, vec![new]);

        let second = open(&mut c, 0).await;
        assert_eq!(
            recv(&mut c).await,
            Packet::ServerData(protocol::pipe_frame(second, b"B"))
        );
    }

    #[tokio::test]
    async fn chat_reaches_both_ends() {
        let service = echo_service().await;
        let (server, addr, _stop) = start_server().await;
        let (host, _host_stop) = start_host(host_opts(addr, service, 4), &server).await;
        let mut events = host.chat_events();

        let mut c = raw_client(addr).await;
        assert!(matches!(recv(&mut c).await, Packet::Logon(_)));

        c.send(Packet::Msg {
            peer: MASTER_INDEX,
            text: "hello host".into(),
        })
        .await
        .unwrap();
        let ev = tokio::time::timeout(T, events.recv()).await.unwrap().unwrap();
        assert_eq!(
            ev,
            ChatEvent::Message {
                from: 1,
                text: "hello host".into(),
            }
        );

        assert!(host.send_message(MASTER_INDEX, "self").await.is_err());
        host.send_message(1, "hello client").await.unwrap();
        assert_eq!(
            recv(&mut c).await,
            Packet::Msg {
                peer: MASTER_INDEX,
                text: "hello client".into(),
            }
        );

        host.send_message(9, "nobody").await.unwrap();
        let ev = tokio::time::timeout(T, events.recv()).await.unwrap().unwrap();
        assert_eq!(ev, ChatEvent::Undelivered { peer: 9 });
    }

    #[tokio::test]
    async fn unreachable_service_closes_the_pipe() {
        // Grab a port with nothing listening on it.
        let dead = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap().port()
        };
        let (server, addr, _stop) = start_server().await;
        let (_host, _host_stop) = start_host(host_opts(addr, dead, 4), &server).await;

        let mut c = raw_client(addr).await;
        assert!(matches!(recv(&mut c).await, Packet::Logon(_)));
        let pipe_id = open(&mut c, 0).await;
        assert_eq!(
            recv(&mut c).await,
            Packet::ChannelClose { peer: 0, pipe_id }
        );
    }

    #[test]
    fn options_are_validated() {
        assert!(Host::new(HostOptions::default()).is_err());
        let mut opts = host_opts("127.0.0.1:1".parse().unwrap(), 80, 0);
        let host = Host::new(opts.clone()).unwrap();
        assert_eq!(host.opts.max_pipes, HOST_MAX_PIPES);
        opts.ports = vec![1; MAX_PORTS + 1];
        assert!(Host::new(opts).is_err());
    }
}
