//! Room chat as seen from a host or client session.

use tokio::sync::broadcast;

use crate::aerelay::protocol::{Online, Packet, MAX_MESSAGE_BYTES, MAX_NICKNAME_BYTES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// `from` is the sender's room index; 0 is the host.
    Message { from: u32, text: String },
    /// The server could not deliver a message addressed to `peer`.
    Undelivered { peer: u32 },
    Roster(Vec<Online>),
}

/// Fans chat events out to subscribers. With nobody subscribed they are
/// only logged.
#[derive(Debug)]
pub struct ChatFeed {
    role: &'static str,
    tx: broadcast::Sender<ChatEvent>,
}

impl ChatFeed {
    pub fn new(role: &'static str) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { role, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    /// Consumes chat packets; anything else is handed back.
    pub fn offer(&self, pkt: Packet) -> Option<Packet> {
        let ev = match pkt {
            Packet::Msg { peer, text } => {
                tracing::info!(role = self.role, from = peer, text = %text, "chat: message");
                ChatEvent::Message { from: peer, text }
            }
            Packet::MsgFail { peer } => {
                tracing::info!(role = self.role, peer, "chat: message not delivered");
                ChatEvent::Undelivered { peer }
            }
            Packet::Onlines(list) => ChatEvent::Roster(list),
            other => return Some(other),
        };
        let _ = self.tx.send(ev);
        None
    }
}

pub fn message(to: u32, text: &str) -> anyhow::Result<Packet> {
    if text.is_empty() {
        anyhow::bail!("chat: empty message");
    }
    if text.len() > MAX_MESSAGE_BYTES {
        anyhow::bail!("chat: message longer than {MAX_MESSAGE_BYTES} bytes");
    }
    Ok(Packet::Msg {
        peer: to,
        text: text.to_string(),
    })
}

pub fn nickname(name: &str) -> anyhow::Result<Packet> {
    if name.len() > MAX_NICKNAME_BYTES {
        anyhow::bail!("chat: nickname longer than {MAX_NICKNAME_BYTES} bytes");
    }
    Ok(Packet::Nickname(name.to_string()))
}
