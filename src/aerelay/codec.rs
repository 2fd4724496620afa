//! Length-aware framing for the control channel.
//!
//! Every packet starts with its id byte. The remaining layout is fixed per id,
//! so the decoder waits until the whole packet is buffered before consuming
//! anything.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    id, ChatOp, ConnectRequest, ErrorCode, Logon, Online, Packet, ProtocolError, RelayState,
    Secret, MAX_DATA_BYTES, MAX_MESSAGE_BYTES, MAX_PORTS, SECRET_LEN,
};

#[derive(Debug, Clone)]
pub struct ControlCodec {
    max_data: u32,
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self {
            max_data: MAX_DATA_BYTES,
        }
    }
}

impl ControlCodec {
    pub fn with_max_data(max_data: u32) -> Self {
        Self { max_data }
    }

    /// Total length of the packet at the head of `src`, or `None` while the
    /// header itself is incomplete.
    fn frame_len(&self, src: &[u8]) -> Result<Option<usize>, ProtocolError> {
        let need = |n: usize| if src.len() < n { None } else { Some(()) };
        let n = match src[0] {
            id::HEARTBEAT | id::LOGOUT => 1,
            id::CONNECT => {
                if need(7).is_none() {
                    return Ok(None);
                }
                7 + src[3] as usize + src[4] as usize + src[5] as usize + 2 * src[6] as usize
            }
            id::LOGON => {
                if need(8).is_none() {
                    return Ok(None);
                }
                8 + src[6] as usize + 2 * src[7] as usize
            }
            id::DATA | id::SERVER_DATA => {
                if need(5).is_none() {
                    return Ok(None);
                }
                5 + self.data_len(&src[1..5])?
            }
            id::SERVER_SLAVE_DATA => {
                if need(9).is_none() {
                    return Ok(None);
                }
                9 + self.data_len(&src[5..9])?
            }
            id::SLAVE_CONNECT => {
                if need(8).is_none() {
                    return Ok(None);
                }
                match src[7] {
                    4 | 16 => 8 + src[7] as usize,
                    _ => return Err(ProtocolError::Malformed("slave address")),
                }
            }
            id::SLAVE_DISCONNECT | id::KICK_SLAVE => 5,
            id::REQUEST_CHANNEL => 2 + SECRET_LEN,
            id::CHANNEL_REQUEST => 6 + SECRET_LEN,
            id::CHANNEL_OPEN => 9 + SECRET_LEN,
            id::CHANNEL_RESULT => 5 + SECRET_LEN,
            id::CHANNEL_DENY => {
                if need(7).is_none() {
                    return Ok(None);
                }
                7 + src[6] as usize
            }
            id::CHANNEL_RESET | id::CHANNEL_CLOSE => 9,
            id::STATE => 2,
            id::MOTD => {
                if need(3).is_none() {
                    return Ok(None);
                }
                3 + u16::from_be_bytes([src[1], src[2]]) as usize
            }
            id::MSG => {
                if need(7).is_none() {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([src[5], src[6]]) as usize;
                if len > MAX_MESSAGE_BYTES {
                    return Err(ProtocolError::FrameTooLarge(len as u32));
                }
                7 + len
            }
            id::MSG_OP => 6,
            id::MSG_FAIL => 5,
            id::NICKNAME => {
                if need(2).is_none() {
                    return Ok(None);
                }
                2 + src[1] as usize
            }
            id::ONLINES => {
                if need(3).is_none() {
                    return Ok(None);
                }
                3 + u16::from_be_bytes([src[1], src[2]]) as usize
            }
            id::PORTS => {
                if need(2).is_none() {
                    return Ok(None);
                }
                if src[1] as usize > MAX_PORTS {
                    return Err(ProtocolError::FieldTooLong("port list"));
                }
                2 + 2 * src[1] as usize
            }
            _ => 1,
        };
        Ok(if src.len() < n { None } else { Some(n) })
    }

    fn data_len(&self, b: &[u8]) -> Result<usize, ProtocolError> {
        let n = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        if n > self.max_data {
            return Err(ProtocolError::FrameTooLarge(n));
        }
        Ok(n as usize)
    }
}

impl Decoder for ControlCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        if src.is_empty() {
            return Ok(None);
        }
        let Some(n) = self.frame_len(&src[..])? else {
            src.reserve(64);
            return Ok(None);
        };

        // An unknown byte that arrives alone is a bare error code.
        let lone = src.len() == 1;
        let mut b = src.split_to(n).freeze();
        let pid = b.get_u8();
        let pkt = match pid {
            id::HEARTBEAT => Packet::Heartbeat,
            id::LOGOUT => Packet::Logout,
            id::CONNECT => {
                let owner = b.get_u8() != 0;
                let flags = b.get_u8();
                let id_len = b.get_u8() as usize;
                let token_len = b.get_u8() as usize;
                let motd_len = b.get_u8() as usize;
                let port_count = b.get_u8() as usize;
                let room = take_string(&mut b, id_len);
                let token = take_string(&mut b, token_len);
                let motd = take_string(&mut b, motd_len);
                let ports = take_ports(&mut b, port_count)?;
                Packet::Connect(ConnectRequest {
                    owner,
                    flags,
                    room,
                    token,
                    motd,
                    ports,
                })
            }
            id::LOGON => {
                let room_index = b.get_u32();
                let flags = b.get_u8();
                let motd_len = b.get_u8() as usize;
                let port_count = b.get_u8() as usize;
                let motd = take_string(&mut b, motd_len);
                let ports = take_ports(&mut b, port_count)?;
                Packet::Logon(Logon {
                    room_index,
                    flags,
                    motd,
                    ports,
                })
            }
            id::DATA => {
                b.advance(4);
                Packet::Data(b)
            }
            id::SERVER_DATA => {
                b.advance(4);
                Packet::ServerData(b)
            }
            id::SERVER_SLAVE_DATA => {
                let from = b.get_u32();
                b.advance(4);
                Packet::ServerSlaveData { from, payload: b }
            }
            id::SLAVE_CONNECT => {
                let index = b.get_u32();
                let port = b.get_u16();
                let ip = match b.get_u8() {
                    4 => {
                        let mut o = [0u8; 4];
                        b.copy_to_slice(&mut o);
                        IpAddr::V4(Ipv4Addr::from(o))
                    }
                    _ => {
                        let mut o = [0u8; 16];
                        b.copy_to_slice(&mut o);
                        IpAddr::V6(Ipv6Addr::from(o))
                    }
                };
                Packet::SlaveConnect {
                    index,
                    addr: SocketAddr::new(ip, port),
                }
            }
            id::SLAVE_DISCONNECT => Packet::SlaveDisconnect { index: b.get_u32() },
            id::KICK_SLAVE => Packet::KickSlave { index: b.get_u32() },
            id::REQUEST_CHANNEL => {
                let port_id = b.get_u8();
                Packet::RequestChannel {
                    port_id,
                    secret: take_secret(&mut b),
                }
            }
            id::CHANNEL_REQUEST => {
                let from = b.get_u32();
                let port_id = b.get_u8();
                Packet::ChannelRequest {
                    from,
                    port_id,
                    secret: take_secret(&mut b),
                }
            }
            id::CHANNEL_OPEN => {
                let client = b.get_u32();
                let pipe_id = b.get_u32();
                Packet::ChannelOpen {
                    client,
                    pipe_id,
                    secret: take_secret(&mut b),
                }
            }
            id::CHANNEL_RESULT => {
                let pipe_id = b.get_u32();
                Packet::ChannelResult {
                    pipe_id,
                    secret: take_secret(&mut b),
                }
            }
            id::CHANNEL_DENY => {
                let peer = b.get_u32();
                let raw = b.get_u8();
                let reason_len = b.get_u8() as usize;
                Packet::ChannelDeny {
                    peer,
                    code: ErrorCode::from_u8(raw).unwrap_or(ErrorCode::Io),
                    reason: take_string(&mut b, reason_len),
                }
            }
            id::CHANNEL_RESET => Packet::ChannelReset {
                peer: b.get_u32(),
                pipe_id: b.get_u32(),
            },
            id::CHANNEL_CLOSE => Packet::ChannelClose {
                peer: b.get_u32(),
                pipe_id: b.get_u32(),
            },
            id::STATE => match RelayState::from_u8(b.get_u8()) {
                Some(s) => Packet::State(s),
                None => return Err(ProtocolError::Malformed("state")),
            },
            id::MOTD => {
                let len = b.get_u16() as usize;
                Packet::Motd(take_string(&mut b, len))
            }
            id::MSG => {
                let peer = b.get_u32();
                let len = b.get_u16() as usize;
                Packet::Msg {
                    peer,
                    text: take_string(&mut b, len),
                }
            }
            id::MSG_OP => {
                let Some(op) = ChatOp::from_u8(b.get_u8()) else {
                    return Err(ProtocolError::Malformed("chat op"));
                };
                Packet::MsgOp {
                    op,
                    arg: b.get_u32(),
                }
            }
            id::MSG_FAIL => Packet::MsgFail { peer: b.get_u32() },
            id::NICKNAME => {
                let len = b.get_u8() as usize;
                Packet::Nickname(take_string(&mut b, len))
            }
            id::ONLINES => {
                b.advance(2);
                Packet::Onlines(take_onlines(&mut b)?)
            }
            id::PORTS => {
                let count = b.get_u8() as usize;
                Packet::Ports(take_ports(&mut b, count)?)
            }
            other => match ErrorCode::from_u8(other) {
                Some(code) if lone => Packet::Error(code),
                _ => Packet::Unknown(other),
            },
        };
        Ok(Some(pkt))
    }
}

impl Encoder<Packet> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, pkt: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match pkt {
            Packet::Heartbeat => dst.put_u8(id::HEARTBEAT),
            Packet::Logout => dst.put_u8(id::LOGOUT),
            Packet::Connect(req) => {
                let id_len = short_len(&req.room, "room id")?;
                let token_len = short_len(&req.token, "token")?;
                let motd_len = short_len(&req.motd, "motd")?;
                let port_count = port_count(&req.ports)?;
                dst.reserve(7 + id_len as usize + token_len as usize + motd_len as usize);
                dst.put_u8(id::CONNECT);
                dst.put_u8(req.owner as u8);
                dst.put_u8(req.flags);
                dst.put_u8(id_len);
                dst.put_u8(token_len);
                dst.put_u8(motd_len);
                dst.put_u8(port_count);
                dst.put_slice(req.room.as_bytes());
                dst.put_slice(req.token.as_bytes());
                dst.put_slice(req.motd.as_bytes());
                for p in req.ports {
                    dst.put_u16(p);
                }
            }
            Packet::Logon(l) => {
                let motd_len = short_len(&l.motd, "motd")?;
                let port_count = port_count(&l.ports)?;
                dst.put_u8(id::LOGON);
                dst.put_u32(l.room_index);
                dst.put_u8(l.flags);
                dst.put_u8(motd_len);
                dst.put_u8(port_count);
                dst.put_slice(l.motd.as_bytes());
                for p in l.ports {
                    dst.put_u16(p);
                }
            }
            Packet::Data(payload) => self.put_data(id::DATA, &payload, dst)?,
            Packet::ServerData(payload) => self.put_data(id::SERVER_DATA, &payload, dst)?,
            Packet::ServerSlaveData { from, payload } => {
                let n = self.checked_len(&payload)?;
                dst.reserve(9 + payload.len());
                dst.put_u8(id::SERVER_SLAVE_DATA);
                dst.put_u32(from);
                dst.put_u32(n);
                dst.put_slice(&payload);
            }
            Packet::SlaveConnect { index, addr } => {
                dst.put_u8(id::SLAVE_CONNECT);
                dst.put_u32(index);
                dst.put_u16(addr.port());
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        dst.put_u8(4);
                        dst.put_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        dst.put_u8(16);
                        dst.put_slice(&ip.octets());
                    }
                }
            }
            Packet::SlaveDisconnect { index } => {
                dst.put_u8(id::SLAVE_DISCONNECT);
                dst.put_u32(index);
            }
            Packet::KickSlave { index } => {
                dst.put_u8(id::KICK_SLAVE);
                dst.put_u32(index);
            }
            Packet::RequestChannel { port_id, secret } => {
                dst.put_u8(id::REQUEST_CHANNEL);
                dst.put_u8(port_id);
                dst.put_slice(&secret);
            }
            Packet::ChannelRequest {
                from,
                port_id,
                secret,
            } => {
                dst.put_u8(id::CHANNEL_REQUEST);
                dst.put_u32(from);
                dst.put_u8(port_id);
                dst.put_slice(&secret);
            }
            Packet::ChannelOpen {
                client,
                pipe_id,
                secret,
            } => {
                dst.put_u8(id::CHANNEL_OPEN);
                dst.put_u32(client);
                dst.put_u32(pipe_id);
                dst.put_slice(&secret);
            }
            Packet::ChannelResult { pipe_id, secret } => {
                dst.put_u8(id::CHANNEL_RESULT);
                dst.put_u32(pipe_id);
                dst.put_slice(&secret);
            }
            Packet::ChannelDeny { peer, code, reason } => {
                // Reasons are informational; cut them at a char boundary instead of failing.
                let reason = truncate_utf8(&reason, u8::MAX as usize);
                dst.put_u8(id::CHANNEL_DENY);
                dst.put_u32(peer);
                dst.put_u8(code.as_u8());
                dst.put_u8(reason.len() as u8);
                dst.put_slice(reason.as_bytes());
            }
            Packet::ChannelReset { peer, pipe_id } => {
                dst.put_u8(id::CHANNEL_RESET);
                dst.put_u32(peer);
                dst.put_u32(pipe_id);
            }
            Packet::ChannelClose { peer, pipe_id } => {
                dst.put_u8(id::CHANNEL_CLOSE);
                dst.put_u32(peer);
                dst.put_u32(pipe_id);
            }
            Packet::State(s) => {
                dst.put_u8(id::STATE);
                dst.put_u8(s as u8);
            }
            Packet::Motd(motd) => {
                let motd = truncate_utf8(&motd, u16::MAX as usize);
                dst.put_u8(id::MOTD);
                dst.put_u16(motd.len() as u16);
                dst.put_slice(motd.as_bytes());
            }
            Packet::Msg { peer, text } => {
                if text.len() > MAX_MESSAGE_BYTES {
                    return Err(ProtocolError::FieldTooLong("message"));
                }
                dst.reserve(7 + text.len());
                dst.put_u8(id::MSG);
                dst.put_u32(peer);
                dst.put_u16(text.len() as u16);
                dst.put_slice(text.as_bytes());
            }
            Packet::MsgOp { op, arg } => {
                dst.put_u8(id::MSG_OP);
                dst.put_u8(op as u8);
                dst.put_u32(arg);
            }
            Packet::MsgFail { peer } => {
                dst.put_u8(id::MSG_FAIL);
                dst.put_u32(peer);
            }
            Packet::Nickname(name) => {
                let len = short_len(&name, "nickname")?;
                dst.put_u8(id::NICKNAME);
                dst.put_u8(len);
                dst.put_slice(name.as_bytes());
            }
            Packet::Onlines(list) => {
                // Entries that do not fit the u16 body are left out.
                let mut body = BytesMut::new();
                for o in &list {
                    let nick = truncate_utf8(&o.nickname, u8::MAX as usize);
                    if body.len() + 5 + nick.len() > u16::MAX as usize {
                        break;
                    }
                    body.put_u32(o.index);
                    body.put_u8(nick.len() as u8);
                    body.put_slice(nick.as_bytes());
                }
                dst.reserve(3 + body.len());
                dst.put_u8(id::ONLINES);
                dst.put_u16(body.len() as u16);
                dst.put_slice(&body);
            }
            Packet::Ports(ports) => {
                let count = port_count(&ports)?;
                dst.put_u8(id::PORTS);
                dst.put_u8(count);
                for p in ports {
                    dst.put_u16(p);
                }
            }
            Packet::Error(code) => dst.put_u8(code.as_u8()),
            Packet::Unknown(b) => dst.put_u8(b),
        }
        Ok(())
    }
}

impl ControlCodec {
    fn checked_len(&self, payload: &[u8]) -> Result<u32, ProtocolError> {
        let n: u32 = payload.len().try_into().unwrap_or(u32::MAX);
        if n > self.max_data {
            return Err(ProtocolError::FrameTooLarge(n));
        }
        Ok(n)
    }

    fn put_data(&self, pid: u8, payload: &Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let n = self.checked_len(payload)?;
        dst.reserve(5 + payload.len());
        dst.put_u8(pid);
        dst.put_u32(n);
        dst.put_slice(payload);
        Ok(())
    }
}

fn take_string(b: &mut Bytes, n: usize) -> String {
    let s = b.split_to(n);
    String::from_utf8_lossy(&s).into_owned()
}

fn take_ports(b: &mut Bytes, n: usize) -> Result<Vec<u16>, ProtocolError> {
    if n > MAX_PORTS {
        return Err(ProtocolError::FieldTooLong("port list"));
    }
    Ok((0..n).map(|_| b.get_u16()).collect())
}

fn take_onlines(b: &mut Bytes) -> Result<Vec<Online>, ProtocolError> {
    let mut out = Vec::new();
    while b.has_remaining() {
        if b.remaining() < 5 {
            return Err(ProtocolError::Malformed("onlines"));
        }
        let index = b.get_u32();
        let n = b.get_u8() as usize;
        if b.remaining() < n {
            return Err(ProtocolError::Malformed("onlines"));
        }
        out.push(Online {
            index,
            nickname: take_string(b, n),
        });
    }
    Ok(out)
}

fn take_secret(b: &mut Bytes) -> Secret {
    let mut s = [0u8; SECRET_LEN];
    b.copy_to_slice(&mut s);
    s
}

fn short_len(s: &str, what: &'static str) -> Result<u8, ProtocolError> {
    u8::try_from(s.len()).map_err(|_| ProtocolError::FieldTooLong(what))
}

fn port_count(ports: &[u16]) -> Result<u8, ProtocolError> {
    if ports.len() > MAX_PORTS {
        return Err(ProtocolError::FieldTooLong("port list"));
    }
    Ok(ports.len() as u8)
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
