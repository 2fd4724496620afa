use std::fmt;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: u32 = 0xAEAE_AEAE;
pub const PROTOCOL_VERSION: u8 = 42;
/// Single byte the server answers a valid handshake with.
pub const HELLO_OK: u8 = 0xC8;

pub const MAX_DATA_BYTES: u32 = 1 << 20; // 1 MiB
pub const MAX_PORTS: usize = 32;
pub const SECRET_LEN: usize = 32;
/// Longest chat text accepted on the wire; longer ones are a framing error.
pub const MAX_MESSAGE_BYTES: usize = 9999;
pub const MAX_NICKNAME_BYTES: usize = 255;

/// `peer` value on a CHANNEL_DENY that was produced by the server itself.
pub const SERVER_ORIGIN: u32 = u32::MAX;
/// Room index of the master (host) connection.
pub const MASTER_INDEX: u32 = 0;
/// MSG target meaning every other member of the room.
pub const EVERYONE: u32 = u32::MAX;

/// Room flag: pipes carry sealed chunks.
pub const FLAG_ENCRYPTED: u8 = 0x01;

pub type Secret = [u8; SECRET_LEN];

pub mod id {
    pub const HEARTBEAT: u8 = 0x01;
    pub const LOGOUT: u8 = 0x02;
    pub const CONNECT: u8 = 0x03;
    pub const LOGON: u8 = 0x04;
    pub const DATA: u8 = 0x05;
    pub const SERVER_DATA: u8 = 0x06;
    pub const SERVER_SLAVE_DATA: u8 = 0x07;
    pub const SLAVE_CONNECT: u8 = 0x08;
    pub const SLAVE_DISCONNECT: u8 = 0x09;
    pub const KICK_SLAVE: u8 = 0x0A;
    pub const REQUEST_CHANNEL: u8 = 0x0B;
    pub const CHANNEL_REQUEST: u8 = 0x0C;
    pub const CHANNEL_OPEN: u8 = 0x0D;
    pub const CHANNEL_RESULT: u8 = 0x0E;
    pub const CHANNEL_DENY: u8 = 0x0F;
    pub const CHANNEL_RESET: u8 = 0x10;
    pub const CHANNEL_CLOSE: u8 = 0x11;
    pub const STATE: u8 = 0x12;
    pub const MOTD: u8 = 0x13;
    pub const MSG: u8 = 0x14;
    pub const MSG_OP: u8 = 0x15;
    pub const MSG_FAIL: u8 = 0x16;
    pub const NICKNAME: u8 = 0x17;
    pub const ONLINES: u8 = 0x18;
    pub const PORTS: u8 = 0x19;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("handshake rejected: {0}")]
    Rejected(ErrorCode),
    #[error("unexpected handshake reply {0:#04x}")]
    BadReply(u8),
    #[error("frame too large: {0}")]
    FrameTooLarge(u32),
    #[error("{0} too long")]
    FieldTooLong(&'static str),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-byte error codes. Sent alone on the wire, usually right before the
/// sender closes the connection. CHANNEL_DENY reuses them as deny codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Io = 0x20,
    Auth = 0x21,
    UnknownPacket = 0x22,
    Shutdown = 0x23,
    MasterDie = 0x24,
    SystemLimit = 0x25,
    Timeout = 0x26,
    Kicked = 0x27,
    LinkOverflow = 0x28,
    VersionConflict = 0x29,
    AlreadyConnected = 0x2A,
    NotConnected = 0x2B,
    BadHandshake = 0x2C,
}

const ERROR_FIRST: u8 = 0x20;

const ERROR_CODES: [ErrorCode; 13] = [
    ErrorCode::Io,
    ErrorCode::Auth,
    ErrorCode::UnknownPacket,
    ErrorCode::Shutdown,
    ErrorCode::MasterDie,
    ErrorCode::SystemLimit,
    ErrorCode::Timeout,
    ErrorCode::Kicked,
    ErrorCode::LinkOverflow,
    ErrorCode::VersionConflict,
    ErrorCode::AlreadyConnected,
    ErrorCode::NotConnected,
    ErrorCode::BadHandshake,
];

const ERROR_NAMES: [&str; 13] = [
    "i/o error",
    "authentication failed",
    "unknown packet",
    "server shutting down",
    "room master left",
    "system limit reached",
    "timed out",
    "kicked",
    "too many connections",
    "version conflict",
    "already connected",
    "not connected",
    "bad handshake",
];

impl ErrorCode {
    pub fn from_u8(b: u8) -> Option<Self> {
        let i = b.checked_sub(ERROR_FIRST)? as usize;
        ERROR_CODES.get(i).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        ERROR_NAMES[(self as u8 - ERROR_FIRST) as usize]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}

/// Delivery report the server sends to a master whose DATA could not be relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayState {
    Discard = 1,
    Timeout = 2,
    IoError = 3,
}

impl RelayState {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Discard),
            2 => Some(Self::Timeout),
            3 => Some(Self::IoError),
            _ => None,
        }
    }
}

/// Chat switches. Enable/Disable apply to the sender; the rest are
/// honoured only from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChatOp {
    Enable = 0,
    Disable = 1,
    Ban = 2,
    Unban = 3,
    MuteAll = 4,
    UnmuteAll = 5,
}

impl ChatOp {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Enable),
            1 => Some(Self::Disable),
            2 => Some(Self::Ban),
            3 => Some(Self::Unban),
            4 => Some(Self::MuteAll),
            5 => Some(Self::UnmuteAll),
            _ => None,
        }
    }
}

/// One roster entry of an ONLINES reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Online {
    pub index: u32,
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub owner: bool,
    pub flags: u8,
    pub room: String,
    pub token: String,
    pub motd: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logon {
    pub room_index: u32,
    pub flags: u8,
    pub motd: String,
    pub ports: Vec<u16>,
}

impl Logon {
    pub fn encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Heartbeat,
    Logout,
    Connect(ConnectRequest),
    Logon(Logon),
    /// From a slave: pipe frame. From the master: pipe frame followed by the target index.
    Data(Bytes),
    ServerData(Bytes),
    ServerSlaveData {
        from: u32,
        payload: Bytes,
    },
    SlaveConnect {
        index: u32,
        addr: SocketAddr,
    },
    SlaveDisconnect {
        index: u32,
    },
    KickSlave {
        index: u32,
    },
    RequestChannel {
        port_id: u8,
        secret: Secret,
    },
    ChannelRequest {
        from: u32,
        port_id: u8,
        secret: Secret,
    },
    ChannelOpen {
        client: u32,
        pipe_id: u32,
        secret: Secret,
    },
    ChannelResult {
        pipe_id: u32,
        secret: Secret,
    },
    ChannelDeny {
        peer: u32,
        code: ErrorCode,
        reason: String,
    },
    ChannelReset {
        peer: u32,
        pipe_id: u32,
    },
    ChannelClose {
        peer: u32,
        pipe_id: u32,
    },
    State(RelayState),
    Motd(String),
    /// Outbound `peer` is the target (or [`EVERYONE`]); delivered `peer` is the sender.
    Msg {
        peer: u32,
        text: String,
    },
    MsgOp {
        op: ChatOp,
        arg: u32,
    },
    /// The message to `peer` was not delivered.
    MsgFail {
        peer: u32,
    },
    Nickname(String),
    /// Empty from a member: a roster request. From the server: the roster.
    Onlines(Vec<Online>),
    /// New port map: host to server, then server to every client.
    Ports(Vec<u16>),
    Error(ErrorCode),
    Unknown(u8),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Heartbeat => "heartbeat",
            Packet::Logout => "logout",
            Packet::Connect(_) => "connect",
            Packet::Logon(_) => "logon",
            Packet::Data(_) => "data",
            Packet::ServerData(_) => "server_data",
            Packet::ServerSlaveData { .. } => "server_slave_data",
            Packet::SlaveConnect { .. } => "slave_connect",
            Packet::SlaveDisconnect { .. } => "slave_disconnect",
            Packet::KickSlave { .. } => "kick_slave",
            Packet::RequestChannel { .. } => "request_channel",
            Packet::ChannelRequest { .. } => "channel_request",
            Packet::ChannelOpen { .. } => "channel_open",
            Packet::ChannelResult { .. } => "channel_result",
            Packet::ChannelDeny { .. } => "channel_deny",
            Packet::ChannelReset { .. } => "channel_reset",
            Packet::ChannelClose { .. } => "channel_close",
            Packet::State(_) => "state",
            Packet::Motd(_) => "motd",
            Packet::Msg { .. } => "msg",
            Packet::MsgOp { .. } => "msg_op",
            Packet::MsgFail { .. } => "msg_fail",
            Packet::Nickname(_) => "nickname",
            Packet::Onlines(_) => "onlines",
            Packet::Ports(_) => "ports",
            Packet::Error(_) => "error",
            Packet::Unknown(_) => "unknown",
        }
    }
}

pub async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), ProtocolError> {
    let mut b = [0u8; 5];
    b[..4].copy_from_slice(&MAGIC.to_be_bytes());
    b[4] = PROTOCOL_VERSION;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    let magic = r.read_u32().await?;
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_VERSION {
        return Err(ProtocolError::BadVersion(ver));
    }
    Ok(())
}

pub async fn read_hello_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    match r.read_u8().await? {
        HELLO_OK => Ok(()),
        b => match ErrorCode::from_u8(b) {
            Some(code) => Err(ProtocolError::Rejected(code)),
            None => Err(ProtocolError::BadReply(b)),
        },
    }
}

pub fn pipe_frame(pipe_id: u32, chunk: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(4 + chunk.len());
    b.put_u32(pipe_id);
    b.put_slice(chunk);
    b.freeze()
}

pub fn split_pipe_frame(mut payload: Bytes) -> Result<(u32, Bytes), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Malformed("pipe frame"));
    }
    let pipe_id = payload.get_u32();
    Ok((pipe_id, payload))
}

/// DATA payload from the master: the pipe frame with the target slave index appended.
pub fn master_data(pipe_id: u32, chunk: &[u8], target: u32) -> Bytes {
    let mut b = BytesMut::with_capacity(8 + chunk.len());
    b.put_u32(pipe_id);
    b.put_slice(chunk);
    b.put_u32(target);
    b.freeze()
}

pub fn split_master_data(mut payload: Bytes) -> Result<(Bytes, u32), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Malformed("master data"));
    }
    let tail = payload.split_off(payload.len() - 4);
    let target = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    Ok((payload, target))
}
