use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;

use crate::aerelay::codec::ControlCodec;
use crate::aerelay::protocol::{ErrorCode, Packet, ProtocolError};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("peer gone")]
    PeerGone,
    #[error("write lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("room dissolved")]
    RoomDissolved,
    #[error("relay timed out")]
    Timeout,
    #[error("write: {0}")]
    Write(#[from] ProtocolError),
}

const AVAILABLE: u8 = 0;
const IN_RELAY: u8 = 1;
const REQUEST_HANGUP: u8 = 2;
const HUNG_UP: u8 = 3;

/// Who may write to a worker's socket right now.
///
/// Relays from other workers take the flag while they write. The owner hangs
/// up exactly once; after that every acquire fails with `PeerGone`.
#[derive(Debug, Default)]
pub struct BusyFlag {
    state: AtomicU8,
    released: Notify,
}

pub struct BusyGuard<'a> {
    flag: &'a BusyFlag,
}

impl BusyFlag {
    pub async fn acquire(&self, within: Duration) -> Result<BusyGuard<'_>, RelayError> {
        let give_up = Instant::now() + within;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self
                .state
                .compare_exchange(AVAILABLE, IN_RELAY, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(BusyGuard { flag: self }),
                Err(REQUEST_HANGUP) | Err(HUNG_UP) => return Err(RelayError::PeerGone),
                Err(_) => {}
            }

            if tokio::time::timeout_at(give_up, notified).await.is_err() {
                return Err(RelayError::LockTimeout(within));
            }
        }
    }

    /// Refuses new holders and waits for the current one, if any, to finish.
    pub async fn hang_up(&self) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.load(Ordering::Acquire) {
                HUNG_UP => return,
                AVAILABLE => {
                    if self
                        .state
                        .compare_exchange(AVAILABLE, HUNG_UP, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.released.notify_waiters();
                        return;
                    }
                    continue;
                }
                IN_RELAY => {
                    let _ = self.state.compare_exchange(
                        IN_RELAY,
                        REQUEST_HANGUP,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                _ => {}
            }
            notified.await;
        }
    }

    pub fn is_hung_up(&self) -> bool {
        self.state.load(Ordering::Acquire) == HUNG_UP
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let flag = self.flag;
        if flag
            .state
            .compare_exchange(IN_RELAY, AVAILABLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Owner asked to hang up while we held the socket.
            flag.state.store(HUNG_UP, Ordering::Release);
        }
        flag.released.notify_waiters();
    }
}

/// Write side of one worker connection. Every packet to that socket, from its
/// own worker or relayed by another, goes through here.
pub struct Link {
    peer: SocketAddr,
    busy: BusyFlag,
    writer: Mutex<FramedWrite<BoxedWriter, ControlCodec>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish_non_exhaustive()
    }
}

impl Link {
    pub fn new(peer: SocketAddr, writer: BoxedWriter) -> Self {
        Self {
            peer,
            busy: BusyFlag::default(),
            writer: Mutex::new(FramedWrite::new(writer, ControlCodec::default())),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.busy.is_hung_up()
    }

    /// Writes one packet. `within` bounds both the wait for the busy flag and
    /// the write itself.
    pub async fn send(&self, pkt: Packet, within: Duration) -> Result<(), RelayError> {
        let give_up = Instant::now() + within;
        let _guard = self.busy.acquire(within).await?;
        let mut w = self.writer.lock().await;
        match tokio::time::timeout_at(give_up, w.send(pkt)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(RelayError::Timeout),
        }
    }

    /// Raw byte written before the framed protocol starts (handshake reply,
    /// admission refusal).
    pub async fn send_raw(&self, b: u8, within: Duration) -> Result<(), RelayError> {
        let _guard = self.busy.acquire(within).await?;
        let mut w = self.writer.lock().await;
        let io = w.get_mut();
        let res = tokio::time::timeout(within, async {
            io.write_u8(b).await?;
            io.flush().await
        })
        .await;
        match res {
            Ok(r) => r.map_err(|e| RelayError::Write(ProtocolError::Io(e))),
            Err(_) => Err(RelayError::Timeout),
        }
    }

    /// Best-effort error report; the caller is about to close anyway.
    pub async fn send_error(&self, code: ErrorCode, within: Duration) {
        if let Err(err) = self.send(Packet::Error(code), within).await {
            tracing::debug!(peer=%self.peer, code=%code, err=%err, "link: error report not delivered");
        }
    }

    /// Hangs up and shuts the socket down. Idempotent.
    pub async fn close(&self) {
        if self.busy.is_hung_up() {
            return;
        }
        self.busy.hang_up().await;
        let mut w = self.writer.lock().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), w.get_mut().shutdown()).await;
    }
}
