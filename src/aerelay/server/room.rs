use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;

use super::link::{Link, RelayError};
use super::worker::WorkerStats;
use crate::aerelay::protocol::{
    ChatOp, ConnectRequest, ErrorCode, Online, Packet, EVERYONE, FLAG_ENCRYPTED, MASTER_INDEX,
};

const GATE_CLOSED: i8 = -1;
const GATE_IDLE: i8 = 0;
const GATE_QUEUED: i8 = 1;
const GATE_WRITING: i8 = 2;

/// Room-wide lock. Enqueuers, the master's flush and kicks each take it
/// exclusively; once closed it never opens again.
#[derive(Debug, Default)]
struct Gate {
    state: AtomicI8,
    released: Notify,
}

struct GateGuard<'a> {
    gate: &'a Gate,
    close_on_drop: bool,
}

impl Gate {
    async fn acquire(&self, as_state: i8, within: Duration) -> Result<GateGuard<'_>, RelayError> {
        let give_up = Instant::now() + within;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.compare_exchange(
                GATE_IDLE,
                as_state,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(GateGuard {
                        gate: self,
                        close_on_drop: false,
                    })
                }
                Err(GATE_CLOSED) => return Err(RelayError::RoomDissolved),
                Err(_) => {}
            }

            if tokio::time::timeout_at(give_up, notified).await.is_err() {
                return Err(RelayError::LockTimeout(within));
            }
        }
    }

    fn force_close(&self) {
        self.state.store(GATE_CLOSED, Ordering::Release);
        self.released.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == GATE_CLOSED
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let next = if self.close_on_drop {
            GATE_CLOSED
        } else {
            GATE_IDLE
        };
        self.gate.state.store(next, Ordering::Release);
        self.gate.released.notify_waiters();
    }
}

struct Pending {
    packet: Packet,
    done: oneshot::Sender<Result<(), RelayError>>,
}

/// Who may talk to whom. Clients opt in to receiving client messages;
/// the host always gets through.
#[derive(Debug, Default)]
struct Chat {
    enabled: HashSet<u32>,
    banned: HashSet<u32>,
    muted: bool,
    nicknames: HashMap<u32, String>,
}

#[derive(Clone)]
pub struct Slave {
    pub link: Arc<Link>,
    pub stats: Arc<WorkerStats>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RoomSnapshot {
    pub id: String,
    pub motd: String,
    pub ports: Vec<u16>,
    pub master: Option<String>,
    pub slaves: Vec<SlaveSnapshot>,
    pub locked: bool,
    pub encrypted: bool,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub created_unix_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlaveSnapshot {
    pub index: u32,
    pub addr: String,
}

/// A host's session plus the clients that joined it.
///
/// Slaves never write to the master socket directly: they queue packets with
/// [`Room::register`] and the master's own task drains the queue in FIFO order
/// with [`Room::flush`].
pub struct Room {
    id: String,
    token: RwLock<String>,
    motd: RwLock<String>,
    ports: ArcSwap<Vec<u16>>,
    flags: u8,
    master: ArcSwapOption<Link>,
    master_addr: String,
    slaves: Mutex<BTreeMap<u32, Slave>>,
    next_index: AtomicU32,
    gate: Gate,
    packets: Mutex<VecDeque<Pending>>,
    flush_wanted: Notify,
    kicked: Mutex<HashSet<u32>>,
    chat: Mutex<Chat>,
    events: watch::Sender<u64>,
    locked: AtomicBool,
    up: AtomicU64,
    down: AtomicU64,
    created_unix_ms: u64,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(req: &ConnectRequest, master: Arc<Link>) -> Self {
        let (events, _rx) = watch::channel(0u64);
        let created_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: req.room.clone(),
            token: RwLock::new(req.token.clone()),
            motd: RwLock::new(req.motd.clone()),
            ports: ArcSwap::from_pointee(req.ports.clone()),
            flags: req.flags & FLAG_ENCRYPTED,
            master_addr: master.peer().to_string(),
            master: ArcSwapOption::from(Some(master)),
            slaves: Mutex::new(BTreeMap::new()),
            next_index: AtomicU32::new(1),
            gate: Gate::default(),
            packets: Mutex::new(VecDeque::new()),
            flush_wanted: Notify::new(),
            kicked: Mutex::new(HashSet::new()),
            chat: Mutex::new(Chat::default()),
            events,
            locked: AtomicBool::new(false),
            up: AtomicU64::new(0),
            down: AtomicU64::new(0),
            created_unix_ms,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ports(&self) -> Arc<Vec<u16>> {
        self.ports.load_full()
    }

    pub fn set_ports(&self, ports: Vec<u16>) {
        self.ports.store(Arc::new(ports));
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn motd(&self) -> String {
        self.motd.read().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn set_motd(&self, motd: String) {
        if let Ok(mut m) = self.motd.write() {
            *m = motd;
        }
    }

    pub fn set_token(&self, token: String) {
        if let Ok(mut t) = self.token.write() {
            *t = token;
        }
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::Relaxed);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn is_live(&self) -> bool {
        self.master.load().is_some()
    }

    pub fn master(&self) -> Option<Arc<Link>> {
        self.master.load_full()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.events.subscribe()
    }

    pub fn add_up(&self, n: usize) {
        self.up.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_down(&self, n: usize) {
        self.down.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn reset_stats(&self) {
        self.up.store(0, Ordering::Relaxed);
        self.down.store(0, Ordering::Relaxed);
        if let Ok(slaves) = self.slaves.lock() {
            for s in slaves.values() {
                s.stats.reset_counters();
            }
        }
    }

    /// Admits a slave and hands out its index. Indices start at 1 and are
    /// never reused within one room.
    pub fn try_connect(&self, token: &str, slave: Slave) -> Result<u32, ErrorCode> {
        if !self.is_live() {
            return Err(ErrorCode::MasterDie);
        }
        let ok = self.token.read().map(|t| *t == token).unwrap_or(false);
        if !ok {
            return Err(ErrorCode::Auth);
        }
        if self.is_locked() {
            return Err(ErrorCode::SystemLimit);
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let mut slaves = self.slaves.lock().map_err(|_| ErrorCode::Io)?;
        slaves.insert(index, slave);
        Ok(index)
    }

    pub fn slave(&self, index: u32) -> Option<Slave> {
        self.slaves.lock().ok()?.get(&index).cloned()
    }

    pub fn slave_links(&self) -> Vec<(u32, Arc<Link>)> {
        match self.slaves.lock() {
            Ok(s) => s.iter().map(|(i, s)| (*i, s.link.clone())).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn remove_slave(&self, index: u32) -> bool {
        if let Ok(mut k) = self.kicked.lock() {
            k.remove(&index);
        }
        if let Ok(mut c) = self.chat.lock() {
            c.enabled.remove(&index);
            c.nicknames.remove(&index);
        }
        self.slaves
            .lock()
            .map(|mut s| s.remove(&index).is_some())
            .unwrap_or(false)
    }

    /// Applies a chat switch sent by `from`. Returns false when `from` may
    /// not use it.
    pub fn chat_op(&self, from: u32, op: ChatOp, arg: u32) -> bool {
        let Ok(mut c) = self.chat.lock() else {
            return false;
        };
        match op {
            ChatOp::Enable => {
                c.enabled.insert(from);
            }
            ChatOp::Disable => {
                c.enabled.remove(&from);
            }
            _ if from != MASTER_INDEX => return false,
            ChatOp::Ban => {
                c.banned.insert(arg);
            }
            ChatOp::Unban => {
                c.banned.remove(&arg);
            }
            ChatOp::MuteAll => c.muted = true,
            ChatOp::UnmuteAll => c.muted = false,
        }
        true
    }

    /// Members a message from `from` to `to` is delivered to, or `None` when
    /// it is refused. The sender is never among them.
    pub fn chat_targets(&self, from: u32, to: u32) -> Option<Vec<u32>> {
        let c = self.chat.lock().ok()?;
        if from != MASTER_INDEX && (c.muted || c.banned.contains(&from)) {
            return None;
        }
        let hears = |index: u32| from == MASTER_INDEX || c.enabled.contains(&index);
        let slaves = self.slaves.lock().ok()?;

        if to == EVERYONE {
            let mut out: Vec<u32> = slaves
                .keys()
                .copied()
                .filter(|i| *i != from && hears(*i))
                .collect();
            if from != MASTER_INDEX {
                out.insert(0, MASTER_INDEX);
            }
            return Some(out);
        }
        if to == from {
            return None;
        }
        if to == MASTER_INDEX {
            return Some(vec![MASTER_INDEX]);
        }
        (slaves.contains_key(&to) && hears(to)).then(|| vec![to])
    }

    pub fn set_nickname(&self, index: u32, name: String) {
        if let Ok(mut c) = self.chat.lock() {
            if name.is_empty() {
                c.nicknames.remove(&index);
            } else {
                c.nicknames.insert(index, name);
            }
        }
    }

    /// The master followed by every slave, with their nicknames.
    pub fn onlines(&self) -> Vec<Online> {
        let nicknames = match self.chat.lock() {
            Ok(c) => c.nicknames.clone(),
            Err(_) => HashMap::new(),
        };
        let mut indices = vec![MASTER_INDEX];
        if let Ok(s) = self.slaves.lock() {
            indices.extend(s.keys().copied());
        }
        indices
            .into_iter()
            .map(|index| Online {
                index,
                nickname: nicknames.get(&index).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Queues a packet for the master and waits until the master task wrote
    /// it. Fails fast with `RoomDissolved` once the room is torn down.
    pub async fn register(&self, packet: Packet, within: Duration) -> Result<(), RelayError> {
        let give_up = Instant::now() + within;
        let rx = {
            let _gate = self.gate.acquire(GATE_QUEUED, within).await?;
            let (done, rx) = oneshot::channel();
            match self.packets.lock() {
                Ok(mut q) => q.push_back(Pending { packet, done }),
                Err(_) => return Err(RelayError::RoomDissolved),
            }
            rx
        };
        self.flush_wanted.notify_one();

        match tokio::time::timeout_at(give_up, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(RelayError::RoomDissolved),
            Err(_) => Err(RelayError::Timeout),
        }
    }

    /// Resolves when slaves queued something. Only the master task awaits this.
    pub async fn flush_wanted(&self) {
        self.flush_wanted.notified().await
    }

    /// Writes every queued packet to the master, oldest first. A failed write
    /// fails the remaining waiters too and is returned to the master task.
    pub async fn flush(&self, master: &Link, within: Duration) -> Result<usize, RelayError> {
        let batch: Vec<Pending> = {
            let _gate = self.gate.acquire(GATE_WRITING, within).await?;
            match self.packets.lock() {
                Ok(mut q) => q.drain(..).collect(),
                Err(_) => return Err(RelayError::RoomDissolved),
            }
        };

        let n = batch.len();
        let mut it = batch.into_iter();
        while let Some(p) = it.next() {
            match master.send(p.packet, within).await {
                Ok(()) => {
                    let _ = p.done.send(Ok(()));
                }
                Err(err) => {
                    let _ = p.done.send(Err(RelayError::PeerGone));
                    for rest in it {
                        let _ = rest.done.send(Err(RelayError::PeerGone));
                    }
                    return Err(err);
                }
            }
        }
        Ok(n)
    }

    /// Marks a slave as kicked; its worker notices through [`Room::subscribe`].
    pub async fn kick(&self, index: u32, within: Duration) -> Result<bool, RelayError> {
        let _gate = self.gate.acquire(GATE_QUEUED, within).await?;
        let known = self
            .slaves
            .lock()
            .map(|s| s.contains_key(&index))
            .unwrap_or(false);
        if known {
            if let Ok(mut k) = self.kicked.lock() {
                k.insert(index);
            }
            self.events.send_modify(|v| *v += 1);
        }
        Ok(known)
    }

    pub fn is_kicked(&self, index: u32) -> bool {
        self.kicked
            .lock()
            .map(|k| k.contains(&index))
            .unwrap_or(false)
    }

    /// Tears the room down. Only the first call does anything; it returns
    /// whether this call was the one that dissolved the room.
    ///
    /// Every task blocked in [`Room::register`] is released with
    /// `RoomDissolved` by the time this returns.
    pub async fn dissolve(&self, within: Duration) -> bool {
        if self.master.swap(None).is_none() {
            return false;
        }

        match self.gate.acquire(GATE_WRITING, within).await {
            Ok(mut g) => g.close_on_drop = true,
            Err(err) => {
                tracing::debug!(room=%self.id, err=%err, "room: closing gate without lock");
                self.gate.force_close();
            }
        }

        let pending: Vec<Pending> = match self.packets.lock() {
            Ok(mut q) => q.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for p in pending {
            let _ = p.done.send(Err(RelayError::RoomDissolved));
        }

        self.events.send_modify(|v| *v += 1);
        true
    }

    pub fn is_dissolved(&self) -> bool {
        self.gate.is_closed() && !self.is_live()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let slaves = match self.slaves.lock() {
            Ok(s) => s
                .iter()
                .map(|(i, s)| SlaveSnapshot {
                    index: *i,
                    addr: s.link.peer().to_string(),
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        RoomSnapshot {
            id: self.id.clone(),
            motd: self.motd(),
            ports: self.ports().to_vec(),
            master: self.is_live().then(|| self.master_addr.clone()),
            slaves,
            locked: self.is_locked(),
            encrypted: self.flags & FLAG_ENCRYPTED != 0,
            up_bytes: self.up.load(Ordering::Relaxed),
            down_bytes: self.down.load(Ordering::Relaxed),
            created_unix_ms: self.created_unix_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::aerelay::codec::ControlCodec;

    const T: Duration = Duration::from_secs(2);

    fn link(port: u16) -> (Arc<Link>, FramedRead<tokio::io::DuplexStream, ControlCodec>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let peer: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        (
            Arc::new(Link::new(peer, Box::new(a))),
            FramedRead::new(b, ControlCodec::default()),
        )
    }

    fn room(master: Arc<Link>) -> Arc<Room> {
        Arc::new(Room::new(
            &ConnectRequest {
                owner: true,
                flags: 0,
                room: "lobby".into(),
                token: "tok".into(),
                motd: "hi".into(),
                ports: vec![25565],
            },
            master,
        ))
    }

    fn slave(port: u16) -> Slave {
        let (l, _rd) = link(port);
        let addr = l.peer();
        Slave {
            link: l,
            stats: Arc::new(WorkerStats::new(u64::from(port), addr)),
        }
    }

    #[tokio::test]
    async fn slaves_get_increasing_indices_and_need_the_token() {
        let (m, _rd) = link(1);
        let r = room(m);
        assert_eq!(r.try_connect("tok", slave(2)), Ok(1));
        assert_eq!(r.try_connect("tok", slave(3)), Ok(2));
        assert_eq!(r.try_connect("nope", slave(4)), Err(ErrorCode::Auth));

        r.set_locked(true);
        assert_eq!(r.try_connect("tok", slave(5)), Err(ErrorCode::SystemLimit));
        r.set_locked(false);

        assert!(r.remove_slave(1));
        assert_eq!(r.try_connect("tok", slave(6)), Ok(3));
    }

    #[tokio::test]
    async fn flush_writes_registered_packets_in_order() {
        let (m, mut rd) = link(1);
        let r = room(m.clone());

        let mut waiters = Vec::new();
        for i in 0..5u32 {
            let r = r.clone();
            waiters.push(tokio::spawn(async move {
                r.register(Packet::SlaveDisconnect { index: i }, T).await
            }));
            // Let each register enqueue before the next one starts.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        r.flush_wanted().await;
        assert_eq!(r.flush(&m, T).await.unwrap(), 5);
        for w in waiters {
            assert!(w.await.unwrap().is_ok());
        }
        for i in 0..5u32 {
            assert_eq!(
                rd.next().await.unwrap().unwrap(),
                Packet::SlaveDisconnect { index: i }
            );
        }
    }

    #[tokio::test]
    async fn dissolve_releases_every_blocked_register() {
        let (m, _rd) = link(1);
        let r = room(m);

        let mut waiters = Vec::new();
        for i in 0..32u32 {
            let r = r.clone();
            waiters.push(tokio::spawn(async move {
                r.register(Packet::KickSlave { index: i }, Duration::from_secs(30))
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(r.dissolve(T).await);
        assert!(!r.dissolve(T).await);
        assert!(r.is_dissolved());

        for w in waiters {
            let res = tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("register stayed blocked after dissolve")
                .unwrap();
            assert!(matches!(res, Err(RelayError::RoomDissolved)));
        }

        assert!(matches!(
            r.register(Packet::Heartbeat, T).await,
            Err(RelayError::RoomDissolved)
        ));
        assert_eq!(r.try_connect("tok", slave(9)), Err(ErrorCode::MasterDie));
    }

    #[tokio::test]
    async fn chat_reaches_only_members_who_listen() {
        let (m, _rd) = link(1);
        let r = room(m);
        let a = r.try_connect("tok", slave(2)).unwrap();
        let b = r.try_connect("tok", slave(3)).unwrap();

        // Clients hear each other only after opting in; the host always does.
        assert_eq!(r.chat_targets(a, b), None);
        assert_eq!(r.chat_targets(a, MASTER_INDEX), Some(vec![MASTER_INDEX]));
        assert_eq!(r.chat_targets(MASTER_INDEX, b), Some(vec![b]));
        assert!(r.chat_op(b, ChatOp::Enable, 0));
        assert_eq!(r.chat_targets(a, b), Some(vec![b]));
        assert_eq!(r.chat_targets(a, EVERYONE), Some(vec![MASTER_INDEX, b]));
        assert_eq!(r.chat_targets(MASTER_INDEX, EVERYONE), Some(vec![a, b]));
        assert_eq!(r.chat_targets(a, a), None);
        assert_eq!(r.chat_targets(a, 99), None);

        // Moderation is the host's.
        assert!(!r.chat_op(b, ChatOp::Ban, a));
        assert!(r.chat_op(MASTER_INDEX, ChatOp::Ban, a));
        assert_eq!(r.chat_targets(a, MASTER_INDEX), None);
        assert!(r.chat_op(MASTER_INDEX, ChatOp::Unban, a));
        assert!(r.chat_op(MASTER_INDEX, ChatOp::MuteAll, 0));
        assert_eq!(r.chat_targets(b, MASTER_INDEX), None);
        assert_eq!(r.chat_targets(MASTER_INDEX, b), Some(vec![b]));
        assert!(r.chat_op(MASTER_INDEX, ChatOp::UnmuteAll, 0));

        r.set_nickname(b, "bee".into());
        assert_eq!(
            r.onlines(),
            vec![
                Online { index: 0, nickname: String::new() },
                Online { index: a, nickname: String::new() },
                Online { index: b, nickname: "bee".into() },
            ]
        );
        assert!(r.remove_slave(b));
        assert_eq!(r.onlines().len(), 2);
        assert_eq!(r.chat_targets(a, b), None);
    }

    #[tokio::test]
    async fn port_map_can_be_replaced() {
        let (m, _rd) = link(1);
        let r = room(m);
        assert_eq!(*r.ports(), vec![25565]);
        r.set_ports(vec![80, 443]);
        assert_eq!(*r.ports(), vec![80, 443]);
        assert_eq!(r.snapshot().ports, vec![80, 443]);
    }

    #[tokio::test]
    async fn kick_bumps_events_for_known_slaves_only() {
        let (m, _rd) = link(1);
        let r = room(m);
        let idx = r.try_connect("tok", slave(2)).unwrap();
        let mut ev = r.subscribe();

        assert!(!r.kick(42, T).await.unwrap());
        assert!(!ev.has_changed().unwrap());

        assert!(r.kick(idx, T).await.unwrap());
        assert!(ev.has_changed().unwrap());
        ev.borrow_and_update();
        assert!(r.is_kicked(idx));
        assert!(!r.is_kicked(42));
    }
}
