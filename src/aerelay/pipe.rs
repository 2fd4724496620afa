//! A pipe joins one local TCP connection to a logical stream multiplexed over
//! the control connection. The session loop owns routing; each pipe runs in
//! its own task and talks to the loop through channels.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::aerelay::cipher::PipeCipher;

const READ_BUF: usize = 16 * 1024;
/// Unwritten bytes a pipe may hold before its owner closes it.
pub const INBOX_MAX_BYTES: usize = 4 << 20;

/// Session loop to pipe.
#[derive(Debug)]
pub enum PipeEvent {
    Data(Bytes),
    /// Host side only: drop the local connection and dial a fresh one.
    Reset,
    Close,
}

/// Pipe to session loop.
pub enum Upstream {
    Data { pipe_id: u32, chunk: Bytes },
    /// Local side closed but the pipe can be reused (client pooling).
    Detached(PipeEndpoint),
    /// Host side: the old local connection is gone and nothing more of it
    /// will be sent; the next data belongs to the redialed one.
    ResetDone { pipe_id: u32 },
    Closed { pipe_id: u32, notify_peer: bool },
}

/// The session loop's handle on a pipe's inbox. The queue itself is unbounded
/// so routing never waits on a pipe task; the byte count bounds it instead.
#[derive(Debug, Clone)]
pub struct PipeSender {
    tx: mpsc::UnboundedSender<PipeEvent>,
    queued: Arc<AtomicUsize>,
}

impl PipeSender {
    /// Queues a chunk. Returns false when the pipe already holds
    /// [`INBOX_MAX_BYTES`] unwritten bytes or is gone.
    pub fn data(&self, chunk: Bytes) -> bool {
        let n = chunk.len();
        if self.queued.fetch_add(n, Ordering::AcqRel) + n > INBOX_MAX_BYTES {
            self.queued.fetch_sub(n, Ordering::AcqRel);
            return false;
        }
        if self.tx.send(PipeEvent::Data(chunk)).is_err() {
            self.queued.fetch_sub(n, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn reset(&self) {
        let _ = self.tx.send(PipeEvent::Reset);
    }

    pub fn close(&self) {
        let _ = self.tx.send(PipeEvent::Close);
    }
}

/// Shared last-activity timestamp, read by the idle reaper.
#[derive(Debug, Clone)]
pub struct IdleClock {
    epoch: Instant,
    last_ms: Arc<AtomicU64>,
}

impl IdleClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

impl Default for IdleClock {
    fn default() -> Self {
        Self::new()
    }
}

/// What a pipe task owns while it is bound (or pooled).
pub struct PipeEndpoint {
    pub pipe_id: u32,
    pub port_id: u8,
    inbox: mpsc::UnboundedReceiver<PipeEvent>,
    pub cipher: Option<Box<dyn PipeCipher>>,
    pub idle: IdleClock,
    queued: Arc<AtomicUsize>,
}

impl PipeEndpoint {
    /// Creates the endpoint and the sender the session loop routes with.
    pub fn new(
        pipe_id: u32,
        port_id: u8,
        cipher: Option<Box<dyn PipeCipher>>,
    ) -> (Self, PipeSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let idle = IdleClock::new();
        idle.touch();
        (
            Self {
                pipe_id,
                port_id,
                inbox: rx,
                cipher,
                idle,
                queued: queued.clone(),
            },
            PipeSender { tx, queued },
        )
    }

    async fn next_event(&mut self) -> Option<PipeEvent> {
        let ev = self.inbox.recv().await;
        self.settle(&ev);
        ev
    }

    fn settle(&self, ev: &Option<PipeEvent>) {
        if let Some(PipeEvent::Data(b)) = ev {
            self.queued.fetch_sub(b.len(), Ordering::AcqRel);
        }
    }

    /// Discards whatever the previous local connection left unread.
    pub fn drain_stale(&mut self) -> usize {
        let mut n = 0;
        loop {
            let ev = self.inbox.try_recv().ok();
            self.settle(&ev);
            match ev {
                None | Some(PipeEvent::Close) => break,
                Some(_) => n += 1,
            }
        }
        n
    }
}

pub enum SpliceEnd {
    /// Local socket hit EOF or failed.
    LocalClosed(PipeEndpoint),
    /// The peer asked for a fresh local connection.
    Reset(PipeEndpoint),
    /// The peer or the session loop closed the pipe.
    RemoteClosed { pipe_id: u32 },
    /// A chunk failed to open; the pipe cannot continue.
    Corrupt { pipe_id: u32 },
}

/// Copies between `local` and the pipe until one side ends.
pub async fn splice(mut ep: PipeEndpoint, local: TcpStream, up: &mpsc::Sender<Upstream>) -> SpliceEnd {
    let (mut rd, mut wr) = local.into_split();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        tokio::select! {
            n = rd.read(&mut buf) => {
                let n = match n {
                    Ok(0) | Err(_) => return SpliceEnd::LocalClosed(ep),
                    Ok(n) => n,
                };
                ep.idle.touch();
                let chunk = match ep.cipher.as_mut() {
                    Some(c) => match c.seal(&buf[..n]) {
                        Ok(b) => b,
                        Err(err) => {
                            tracing::warn!(pipe=ep.pipe_id, err=%err, "pipe: seal failed");
                            return SpliceEnd::Corrupt { pipe_id: ep.pipe_id };
                        }
                    },
                    None => Bytes::copy_from_slice(&buf[..n]),
                };
                let msg = Upstream::Data { pipe_id: ep.pipe_id, chunk };
                if up.send(msg).await.is_err() {
                    return SpliceEnd::RemoteClosed { pipe_id: ep.pipe_id };
                }
            }
            ev = ep.next_event() => {
                match ev {
                    Some(PipeEvent::Data(b)) => {
                        ep.idle.touch();
                        let plain = match ep.cipher.as_mut() {
                            Some(c) => match c.open(&b) {
                                Ok(p) => p,
                                Err(err) => {
                                    tracing::warn!(pipe=ep.pipe_id, err=%err, "pipe: dropping corrupt chunk");
                                    return SpliceEnd::Corrupt { pipe_id: ep.pipe_id };
                                }
                            },
                            None => b,
                        };
                        if wr.write_all(&plain).await.is_err() {
                            return SpliceEnd::LocalClosed(ep);
                        }
                    }
                    Some(PipeEvent::Reset) => {
                        let _ = wr.shutdown().await;
                        return SpliceEnd::Reset(ep);
                    }
                    Some(PipeEvent::Close) | None => {
                        let _ = wr.shutdown().await;
                        return SpliceEnd::RemoteClosed { pipe_id: ep.pipe_id };
                    }
                }
            }
        }
    }
}
