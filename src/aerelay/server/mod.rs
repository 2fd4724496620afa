//! Relay server: accepts hosts and clients, groups them into rooms and
//! forwards control traffic and pipe data between them.

pub mod link;
pub mod room;
pub mod worker;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::aerelay::net;
use crate::aerelay::protocol::{ConnectRequest, ErrorCode, Packet};
use link::Link;
use room::{Room, RoomSnapshot, Slave};
use worker::{Worker, WorkerSnapshot, WorkerStats};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub max_conn: usize,
    pub max_conn_per_ip: usize,
    pub handshake_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub relay_timeout: Duration,
    pub can_create_room: bool,
    pub can_join_room: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: ":7000".into(),
            max_conn: 1024,
            max_conn_per_ip: 128,
            handshake_timeout: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(60),
            relay_timeout: Duration::from_secs(3),
            can_create_room: true,
            can_join_room: true,
        }
    }
}

/// Owns the room and worker tables. Shared by the accept loop, every worker
/// task and whoever holds the admin handle.
pub struct Server {
    opts: ServerOptions,
    rooms: DashMap<String, Arc<Room>>,
    workers: DashMap<u64, Arc<WorkerStats>>,
    ip_conns: DashMap<IpAddr, usize>,
    can_create_room: AtomicBool,
    can_join_room: AtomicBool,
    worker_seq: AtomicU64,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_addr", &self.opts.listen_addr)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(opts: ServerOptions) -> Arc<Self> {
        Arc::new(Self {
            can_create_room: AtomicBool::new(opts.can_create_room),
            can_join_room: AtomicBool::new(opts.can_join_room),
            opts,
            rooms: DashMap::new(),
            workers: DashMap::new(),
            ip_conns: DashMap::new(),
            worker_seq: AtomicU64::new(1),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        ctx: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(addr.as_ref()).await?;
        tracing::info!(addr=%ln.local_addr()?, "server: listening");
        self.serve(ln, ctx).await
    }

    /// Accept loop on an already bound listener. Returns after shutdown, once
    /// every worker has been told to stop.
    pub async fn serve(
        self: Arc<Self>,
        ln: TcpListener,
        ctx: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut shutdown = ctx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    match res {
                        Ok((sock, addr)) => self.admit(sock, addr, ctx.clone()).await,
                        Err(err) => {
                            tracing::warn!(err=%err, "server: accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }

        drop(ln);
        self.shutdown().await;
        Ok(())
    }

    async fn admit(self: &Arc<Self>, mut sock: TcpStream, addr: SocketAddr, ctx: tokio::sync::watch::Receiver<bool>) {
        if self.workers.len() >= self.opts.max_conn || !self.claim_ip(addr.ip()) {
            tracing::debug!(addr=%addr, "server: connection refused, limit reached");
            tokio::spawn(async move {
                let _ = tokio::time::timeout(
                    Duration::from_secs(1),
                    sock.write_u8(ErrorCode::LinkOverflow.as_u8()),
                )
                .await;
            });
            return;
        }
        net::init_socket_pref(&sock);

        let id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(WorkerStats::new(id, addr));
        self.workers.insert(id, stats.clone());

        let (r, w) = sock.into_split();
        let link = Arc::new(Link::new(addr, Box::new(w)));
        let worker = Worker::new(self.clone(), stats, Box::new(r), link, ctx);
        tokio::spawn(worker.run());
    }

    fn claim_ip(&self, ip: IpAddr) -> bool {
        let mut n = self.ip_conns.entry(ip).or_insert(0);
        if *n >= self.opts.max_conn_per_ip {
            return false;
        }
        *n += 1;
        true
    }

    fn release_ip(&self, ip: IpAddr) {
        if let Some(mut n) = self.ip_conns.get_mut(&ip) {
            *n = n.saturating_sub(1);
        }
        self.ip_conns.remove_if(&ip, |_, n| *n == 0);
    }

    pub(crate) fn forget_worker(&self, stats: &WorkerStats) {
        if self.workers.remove(&stats.id()).is_some() {
            self.release_ip(stats.addr().ip());
        }
    }

    /// Routes a CONNECT to room creation or room join. Creation and the
    /// "room exists" check happen under the same map entry lock, so two
    /// owners racing for one id cannot both win.
    pub(crate) fn handle_connect(
        &self,
        req: &ConnectRequest,
        me: Slave,
    ) -> Result<(Arc<Room>, u32), ErrorCode> {
        if req.room.is_empty() {
            return Err(ErrorCode::Auth);
        }
        match self.rooms.entry(req.room.clone()) {
            Entry::Vacant(v) => {
                if !req.owner {
                    return Err(ErrorCode::Auth);
                }
                if !self.can_create_room.load(Ordering::Relaxed) {
                    return Err(ErrorCode::SystemLimit);
                }
                let room = Arc::new(Room::new(req, me.link));
                v.insert(room.clone());
                Ok((room, 0))
            }
            Entry::Occupied(mut o) => {
                if req.owner {
                    // A dissolved room that is still being cleaned up can be reclaimed.
                    if o.get().is_live() {
                        return Err(ErrorCode::Auth);
                    }
                    if !self.can_create_room.load(Ordering::Relaxed) {
                        return Err(ErrorCode::SystemLimit);
                    }
                    let room = Arc::new(Room::new(req, me.link));
                    o.insert(room.clone());
                    return Ok((room, 0));
                }
                if !self.can_join_room.load(Ordering::Relaxed) {
                    return Err(ErrorCode::SystemLimit);
                }
                let room = o.get().clone();
                drop(o);
                let index = room.try_connect(&req.token, me)?;
                Ok((room, index))
            }
        }
    }

    pub(crate) fn remove_room(&self, room: &Arc<Room>) {
        self.rooms
            .remove_if(room.id(), |_, cur| Arc::ptr_eq(cur, room));
    }

    fn room(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    pub fn snapshot_rooms(&self) -> Vec<RoomSnapshot> {
        let mut out: Vec<RoomSnapshot> = self.rooms.iter().map(|r| r.snapshot()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn snapshot_workers(&self) -> Vec<WorkerSnapshot> {
        let mut out: Vec<WorkerSnapshot> = self.workers.iter().map(|w| w.snapshot()).collect();
        out.sort_by_key(|w| w.id);
        out
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn lock_room(&self, id: &str, locked: bool) -> bool {
        let Some(room) = self.room(id) else {
            return false;
        };
        room.set_locked(locked);
        tracing::info!(room=%id, locked, "server: room lock changed");
        true
    }

    pub async fn kick_slave(&self, id: &str, index: u32) -> bool {
        let Some(room) = self.room(id) else {
            return false;
        };
        room.kick(index, self.opts.relay_timeout)
            .await
            .unwrap_or(false)
    }

    /// Closes a room from the outside. The host is told it hit a system limit;
    /// clients see the master leave.
    pub async fn kick_room(&self, id: &str) -> bool {
        let Some(room) = self.room(id) else {
            return false;
        };
        if let Some(master) = room.master() {
            master
                .send_error(ErrorCode::SystemLimit, self.opts.relay_timeout)
                .await;
        }
        let dissolved = room.dissolve(self.opts.relay_timeout).await;
        self.remove_room(&room);
        if dissolved {
            tracing::info!(room=%id, "server: room kicked");
        }
        dissolved
    }

    pub fn change_token(&self, id: &str, token: &str) -> bool {
        let Some(room) = self.room(id) else {
            return false;
        };
        room.set_token(token.to_string());
        true
    }

    /// Replaces the room's MOTD and pushes it to every joined client.
    pub async fn update_motd(&self, id: &str, motd: &str) -> bool {
        let Some(room) = self.room(id) else {
            return false;
        };
        room.set_motd(motd.to_string());
        for (index, link) in room.slave_links() {
            if let Err(err) = link
                .send(Packet::Motd(motd.to_string()), self.opts.relay_timeout)
                .await
            {
                tracing::debug!(room=%id, index, err=%err, "server: motd not delivered");
            }
        }
        true
    }

    pub fn reset_stats(&self, id: &str) -> bool {
        let Some(room) = self.room(id) else {
            return false;
        };
        room.reset_stats();
        true
    }

    pub fn set_can_create_room(&self, v: bool) {
        self.can_create_room.store(v, Ordering::Relaxed);
    }

    pub fn set_can_join_room(&self, v: bool) {
        self.can_join_room.store(v, Ordering::Relaxed);
    }

    /// Dissolves every room and waits (bounded) for workers to drain. Workers
    /// themselves are stopped through the shutdown channel passed to `serve`.
    async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        for room in rooms {
            room.dissolve(self.opts.relay_timeout).await;
            self.remove_room(&room);
        }

        let give_up = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.workers.is_empty() && tokio::time::Instant::now() < give_up {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if !self.workers.is_empty() {
            tracing::warn!(left = self.workers.len(), "server: workers still running after shutdown");
        }
        tracing::info!("server: stopped");
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::aerelay::codec::ControlCodec;
    use bytes::Bytes;

    use crate::aerelay::protocol::{
        self, ChatOp, Logon, Online, RelayState, EVERYONE, MAGIC, MASTER_INDEX, SERVER_ORIGIN,
    };

    type Conn = Framed<TcpStream, ControlCodec>;

    const T: Duration = Duration::from_secs(3);

    async fn start(opts: ServerOptions) -> (Arc<Server>, SocketAddr, watch::Sender<bool>) {
        let server = Server::new(opts);
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.clone().serve(ln, rx));
        (server, addr, tx)
    }

    async fn dial(addr: SocketAddr) -> Conn {
        let mut s = TcpStream::connect(addr).await.unwrap();
        protocol::write_hello(&mut s).await.unwrap();
        protocol::read_hello_reply(&mut s).await.unwrap();
        Framed::new(s, ControlCodec::default())
    }

    fn connect(owner: bool, room: &str, token: &str) -> Packet {
        Packet::Connect(ConnectRequest {
            owner,
            flags: 0,
            room: room.into(),
            token: token.into(),
            motd: "hello there".into(),
            ports: vec![25565, 8080],
        })
    }

    async fn recv(c: &mut Conn) -> Packet {
        tokio::time::timeout(T, c.next())
            .await
            .expect("timed out waiting for packet")
            .expect("connection closed")
            .expect("decode failed")
    }

    async fn host(addr: SocketAddr, room: &str) -> Conn {
        let mut h = dial(addr).await;
        h.send(connect(true, room, "tok")).await.unwrap();
        match recv(&mut h).await {
            Packet::Logon(l) => assert_eq!(l.room_index, 0),
            other => panic!("unexpected: {other:?}"),
        }
        h
    }

    async fn client(addr: SocketAddr, room: &str, h: &mut Conn) -> (Conn, u32) {
        let mut c = dial(addr).await;
        c.send(connect(false, room, "tok")).await.unwrap();
        let index = match recv(&mut c).await {
            Packet::Logon(l) => l.room_index,
            other => panic!("unexpected: {other:?}"),
        };
        match recv(h).await {
            Packet::SlaveConnect { index: i, .. } => assert_eq!(i, index),
            other => panic!("unexpected: {other:?}"),
        }
        (c, index)
    }

    #[tokio::test]
    async fn handshake_rejects_bad_magic_and_version() {
        let (_srv, addr, _tx) = start(ServerOptions::default()).await;

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(&[1, 2, 3, 4, protocol::PROTOCOL_VERSION]).await.unwrap();
        assert_eq!(s.read_u8().await.unwrap(), ErrorCode::BadHandshake.as_u8());

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_u32(MAGIC).await.unwrap();
        s.write_u8(protocol::PROTOCOL_VERSION - 1).await.unwrap();
        assert_eq!(s.read_u8().await.unwrap(), ErrorCode::VersionConflict.as_u8());
    }

    #[tokio::test]
    async fn client_joins_with_index_one_and_host_is_told() {
        let (srv, addr, _tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;

        let mut c = dial(addr).await;
        c.send(connect(false, "lobby", "tok")).await.unwrap();
        assert_eq!(
            recv(&mut c).await,
            Packet::Logon(Logon {
                room_index: 1,
                flags: 0,
                motd: "hello there".into(),
                ports: vec![25565, 8080],
            })
        );
        match recv(&mut h).await {
            Packet::SlaveConnect { index, addr: a } => {
                assert_eq!(index, 1);
                assert_eq!(a.ip(), c.get_ref().local_addr().unwrap().ip());
            }
            other => panic!("unexpected: {other:?}"),
        }

        let rooms = srv.snapshot_rooms();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].slaves.len(), 1);
    }

    #[tokio::test]
    async fn wrong_token_and_missing_room_are_auth_errors() {
        let (_srv, addr, _tx) = start(ServerOptions::default()).await;
        let _h = host(addr, "lobby").await;

        let mut c = dial(addr).await;
        c.send(connect(false, "lobby", "nope")).await.unwrap();
        assert_eq!(recv(&mut c).await, Packet::Error(ErrorCode::Auth));

        let mut c = dial(addr).await;
        c.send(connect(false, "nowhere", "tok")).await.unwrap();
        assert_eq!(recv(&mut c).await, Packet::Error(ErrorCode::Auth));
    }

    #[tokio::test]
    async fn concurrent_owners_create_exactly_one_room() {
        let (srv, addr, _tx) = start(ServerOptions::default()).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            tasks.push(tokio::spawn(async move {
                let mut c = dial(addr).await;
                c.send(connect(true, "contested", "tok")).await.unwrap();
                let reply = recv(&mut c).await;
                (reply, c)
            }));
        }

        let mut winners = 0;
        let mut conns = Vec::new();
        for t in tasks {
            let (reply, c) = t.await.unwrap();
            match reply {
                Packet::Logon(l) => {
                    assert_eq!(l.room_index, 0);
                    winners += 1;
                }
                Packet::Error(code) => assert_eq!(code, ErrorCode::Auth),
                other => panic!("unexpected: {other:?}"),
            }
            conns.push(c);
        }
        assert_eq!(winners, 1);
        assert_eq!(srv.snapshot_rooms().len(), 1);
    }

    #[tokio::test]
    async fn relay_keeps_order_both_ways() {
        let (_srv, addr, _tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;
        let (mut c, index) = client(addr, "lobby", &mut h).await;

        for i in 0..50u32 {
            let frame = protocol::pipe_frame(7, &i.to_be_bytes());
            c.send(Packet::Data(frame)).await.unwrap();
        }
        for i in 0..50u32 {
            match recv(&mut h).await {
                Packet::ServerSlaveData { from, payload } => {
                    assert_eq!(from, index);
                    let (pipe_id, chunk) = protocol::split_pipe_frame(payload).unwrap();
                    assert_eq!(pipe_id, 7);
                    assert_eq!(&chunk[..], &i.to_be_bytes());
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        h.send(Packet::Data(protocol::master_data(7, b"pong", index)))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut c).await,
            Packet::ServerData(protocol::pipe_frame(7, b"pong"))
        );

        h.send(Packet::Data(protocol::master_data(7, b"lost", 99)))
            .await
            .unwrap();
        assert_eq!(recv(&mut h).await, Packet::State(RelayState::Discard));
    }

    #[tokio::test]
    async fn channel_handshake_is_forwarded() {
        let (_srv, addr, _tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;
        let (mut c, index) = client(addr, "lobby", &mut h).await;

        c.send(Packet::RequestChannel {
            port_id: 1,
            secret: [1; 32],
        })
        .await
        .unwrap();
        assert_eq!(
            recv(&mut h).await,
            Packet::ChannelRequest {
                from: index,
                port_id: 1,
                secret: [1; 32],
            }
        );

        h.send(Packet::ChannelOpen {
            client: index,
            pipe_id: 3,
            secret: [2; 32],
        })
        .await
        .unwrap();
        assert_eq!(
            recv(&mut c).await,
            Packet::ChannelResult {
                pipe_id: 3,
                secret: [2; 32],
            }
        );

        c.send(Packet::RequestChannel {
            port_id: 9,
            secret: [1; 32],
        })
        .await
        .unwrap();
        match recv(&mut c).await {
            Packet::ChannelDeny { peer, code, .. } => {
                assert_eq!(peer, SERVER_ORIGIN);
                assert_eq!(code, ErrorCode::SystemLimit);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn host_leaving_dissolves_room_and_frees_the_id() {
        let (srv, addr, _tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;
        let (mut c, _) = client(addr, "lobby", &mut h).await;

        drop(h);
        assert_eq!(recv(&mut c).await, Packet::Error(ErrorCode::MasterDie));

        let deadline = tokio::time::Instant::now() + T;
        while !srv.snapshot_rooms().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "room never removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _h2 = host(addr, "lobby").await;
    }

    #[tokio::test]
    async fn kicked_client_is_told_and_host_sees_it_leave() {
        let (_srv, addr, _tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;
        let (mut c, index) = client(addr, "lobby", &mut h).await;

        h.send(Packet::KickSlave { index }).await.unwrap();
        assert_eq!(recv(&mut c).await, Packet::Error(ErrorCode::Kicked));
        assert_eq!(recv(&mut h).await, Packet::SlaveDisconnect { index });
    }

    #[tokio::test]
    async fn per_ip_limit_refuses_before_handshake() {
        let (_srv, addr, _tx) = start(ServerOptions {
            max_conn_per_ip: 2,
            ..Default::default()
        })
        .await;
        let _a = dial(addr).await;
        let _b = dial(addr).await;

        let mut s = TcpStream::connect(addr).await.unwrap();
        assert_eq!(s.read_u8().await.unwrap(), ErrorCode::LinkOverflow.as_u8());
    }

    #[tokio::test]
    async fn admin_controls_reach_connected_peers() {
        let (srv, addr, _tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;
        let (mut c, _) = client(addr, "lobby", &mut h).await;

        assert!(srv.update_motd("lobby", "maintenance at noon").await);
        assert_eq!(recv(&mut c).await, Packet::Motd("maintenance at noon".into()));

        assert!(srv.lock_room("lobby", true));
        let mut late = dial(addr).await;
        late.send(connect(false, "lobby", "tok")).await.unwrap();
        assert_eq!(recv(&mut late).await, Packet::Error(ErrorCode::SystemLimit));

        srv.set_can_create_room(false);
        let mut other = dial(addr).await;
        other.send(connect(true, "second", "tok")).await.unwrap();
        assert_eq!(recv(&mut other).await, Packet::Error(ErrorCode::SystemLimit));

        assert!(srv.kick_room("lobby").await);
        assert_eq!(recv(&mut h).await, Packet::Error(ErrorCode::SystemLimit));
        assert_eq!(recv(&mut c).await, Packet::Error(ErrorCode::MasterDie));
    }

    #[tokio::test]
    async fn shutdown_notifies_connected_workers() {
        let (srv, addr, tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;

        tx.send(true).unwrap();
        assert_eq!(recv(&mut h).await, Packet::Error(ErrorCode::Shutdown));

        let deadline = tokio::time::Instant::now() + T;
        while srv.worker_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "workers never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn refused_peers_do_not_hold_up_accepts() {
        let (_srv, addr, _tx) = start(ServerOptions {
            max_conn: 1,
            ..Default::default()
        })
        .await;
        let first = dial(addr).await;

        // Refused sockets that never read their LINK_OVERFLOW byte.
        let mut idle = Vec::new();
        for _ in 0..8 {
            idle.push(TcpStream::connect(addr).await.unwrap());
        }
        let mut s = TcpStream::connect(addr).await.unwrap();
        assert_eq!(s.read_u8().await.unwrap(), ErrorCode::LinkOverflow.as_u8());

        drop(first);
        let deadline = tokio::time::Instant::now() + T;
        loop {
            let mut s = TcpStream::connect(addr).await.unwrap();
            protocol::write_hello(&mut s).await.unwrap();
            if protocol::read_hello_reply(&mut s).await.is_ok() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "accept loop stalled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn chat_is_routed_by_room_index() {
        let (_srv, addr, _tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;
        let (mut a, ia) = client(addr, "lobby", &mut h).await;
        let (mut b, ib) = client(addr, "lobby", &mut h).await;

        a.send(Packet::Msg {
            peer: MASTER_INDEX,
            text: "hi host".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            recv(&mut h).await,
            Packet::Msg {
                peer: ia,
                text: "hi host".into(),
            }
        );

        a.send(Packet::Msg {
            peer: ib,
            text: "psst".into(),
        })
        .await
        .unwrap();
        assert_eq!(recv(&mut a).await, Packet::MsgFail { peer: ib });

        // The roster reply orders b's switches before a's next message.
        b.send(Packet::Nickname("bee".into())).await.unwrap();
        b.send(Packet::MsgOp {
            op: ChatOp::Enable,
            arg: 0,
        })
        .await
        .unwrap();
        b.send(Packet::Onlines(Vec::new())).await.unwrap();
        assert_eq!(
            recv(&mut b).await,
            Packet::Onlines(vec![
                Online {
                    index: MASTER_INDEX,
                    nickname: String::new(),
                },
                Online {
                    index: ia,
                    nickname: String::new(),
                },
                Online {
                    index: ib,
                    nickname: "bee".into(),
                },
            ])
        );

        a.send(Packet::Msg {
            peer: ib,
            text: "psst".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            recv(&mut b).await,
            Packet::Msg {
                peer: ia,
                text: "psst".into(),
            }
        );

        h.send(Packet::Msg {
            peer: EVERYONE,
            text: "all hands".into(),
        })
        .await
        .unwrap();
        for c in [&mut a, &mut b] {
            assert_eq!(
                recv(c).await,
                Packet::Msg {
                    peer: MASTER_INDEX,
                    text: "all hands".into(),
                }
            );
        }

        h.send(Packet::MsgOp {
            op: ChatOp::Ban,
            arg: ia,
        })
        .await
        .unwrap();
        h.send(Packet::Onlines(Vec::new())).await.unwrap();
        assert!(matches!(recv(&mut h).await, Packet::Onlines(list) if list.len() == 3));
        a.send(Packet::Msg {
            peer: MASTER_INDEX,
            text: "let me in".into(),
        })
        .await
        .unwrap();
        assert_eq!(recv(&mut a).await, Packet::MsgFail { peer: MASTER_INDEX });
    }

    #[tokio::test]
    async fn host_port_map_reaches_clients() {
        let (srv, addr, _tx) = start(ServerOptions::default()).await;
        let mut h = host(addr, "lobby").await;
        let (mut c, _) = client(addr, "lobby", &mut h).await;

        h.send(Packet::Ports(vec![1234])).await.unwrap();
        assert_eq!(recv(&mut c).await, Packet::Ports(vec![1234]));
        assert_eq!(srv.snapshot_rooms()[0].ports, vec![1234]);

        // Port #1 went away with the new map.
        c.send(Packet::RequestChannel {
            port_id: 1,
            secret: [1; 32],
        })
        .await
        .unwrap();
        assert!(matches!(
            recv(&mut c).await,
            Packet::ChannelDeny { peer: SERVER_ORIGIN, .. }
        ));

        // Clients cannot change it.
        c.send(Packet::Ports(vec![1, 2])).await.unwrap();
        c.send(Packet::Onlines(Vec::new())).await.unwrap();
        assert!(matches!(recv(&mut c).await, Packet::Onlines(_)));
        assert_eq!(srv.snapshot_rooms()[0].ports, vec![1234]);
    }

    #[tokio::test]
    async fn clients_parked_behind_a_stalled_host_are_released_when_it_leaves() {
        let (srv, addr, _tx) = start(ServerOptions {
            relay_timeout: Duration::from_secs(30),
            ..Default::default()
        })
        .await;
        let mut h = host(addr, "lobby").await;

        // The host stops reading; clients keep sending until their workers
        // sit in the room queue.
        let mut readers = Vec::new();
        let mut floods = Vec::new();
        for _ in 0..3 {
            let (c, _) = client(addr, "lobby", &mut h).await;
            let (mut sink, stream) = c.split();
            readers.push(stream);
            floods.push(tokio::spawn(async move {
                let chunk = Bytes::from(vec![7u8; 60_000]);
                while sink
                    .send(Packet::Data(protocol::pipe_frame(1, &chunk)))
                    .await
                    .is_ok()
                {}
            }));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        drop(h);
        for mut rd in readers {
            let code = tokio::time::timeout(T, async {
                loop {
                    match rd.next().await {
                        Some(Ok(Packet::Error(code))) => return Some(code),
                        Some(Ok(_)) => continue,
                        _ => return None,
                    }
                }
            })
            .await
            .expect("client stayed parked after the host left");
            assert_eq!(code, Some(ErrorCode::MasterDie));
        }

        let deadline = tokio::time::Instant::now() + T;
        while !srv.snapshot_rooms().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "room never removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for f in floods {
            f.abort();
        }
    }
}
