//! Fixed binary layouts of the protocol, big-endian throughout.
//!
//! ~~~txt
//! Header (4):  type:u8 | sequence:u16 | reserved:u8
//! Member (13): timestamp:u64 | ip:u32 | state:u8
//! Update (23): update_id:u64 | ttl:u8 | update_type:u8 | Member
//! ~~~
//!
//! An `InitReply` payload is a plain concatenation of Member records.

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SwimError};
use crate::id::{random_update_id, MemberId};

pub const HEADER_LEN: usize = 4;
pub const MEMBER_LEN: usize = 13;
pub const UPDATE_LEN: usize = 8 + 1 + 1 + MEMBER_LEN;

/// Bitmask carried in the header `type` byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketType(u8);

impl PacketType {
    pub const PING: PacketType = PacketType(0x01);
    pub const ACK: PacketType = PacketType(0x02);
    pub const INIT_REQUEST: PacketType = PacketType(0x04);
    pub const INIT_REPLY: PacketType = PacketType(0x08);
    pub const SUSPECT: PacketType = PacketType(0x10);
    pub const RESUME: PacketType = PacketType(0x20);
    pub const LEAVE: PacketType = PacketType(0x40);
    pub const JOIN: PacketType = PacketType(0x80);

    pub fn from_bits(bits: u8) -> PacketType {
        PacketType(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: PacketType) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// The gossip update flag set on this packet, if any. When several are set
    /// the first of Suspect, Resume, Leave, Join wins.
    pub fn update_kind(self) -> Option<UpdateKind> {
        [UpdateKind::Suspect, UpdateKind::Resume, UpdateKind::Leave, UpdateKind::Join]
            .into_iter()
            .find(|kind| self.contains(kind.packet_type()))
    }
}

impl BitOr for PacketType {
    type Output = PacketType;

    fn bitor(self, rhs: PacketType) -> PacketType {
        PacketType(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketType({:#04x})", self.0)
    }
}

/// Bitmask of a member's state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemberState(u8);

impl MemberState {
    pub const ALIVE: MemberState = MemberState(0x01);
    pub const SUSPECT: MemberState = MemberState(0x02);
    pub const MONITOR: MemberState = MemberState(0x04);
    pub const INTRODUCER: MemberState = MemberState(0x08);

    pub fn from_bits(bits: u8) -> MemberState {
        MemberState(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: MemberState) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Same role bits, Alive swapped for Suspect.
    pub fn suspected(self) -> MemberState {
        MemberState((self.0 & !Self::ALIVE.0) | Self::SUSPECT.0)
    }

    /// Same role bits, Suspect swapped for Alive.
    pub fn resumed(self) -> MemberState {
        MemberState((self.0 & !Self::SUSPECT.0) | Self::ALIVE.0)
    }
}

impl BitOr for MemberState {
    type Output = MemberState;

    fn bitor(self, rhs: MemberState) -> MemberState {
        MemberState(self.0 | rhs.0)
    }
}

impl fmt::Debug for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberState({:#06b})", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum UpdateKind {
    Suspect,
    Resume,
    Leave,
    Join,
}

impl UpdateKind {
    pub fn packet_type(self) -> PacketType {
        match self {
            UpdateKind::Suspect => PacketType::SUSPECT,
            UpdateKind::Resume => PacketType::RESUME,
            UpdateKind::Leave => PacketType::LEAVE,
            UpdateKind::Join => PacketType::JOIN,
        }
    }

    fn get_code(self) -> u8 {
        self.packet_type().bits()
    }

    fn from_code(code: u8) -> Result<UpdateKind> {
        PacketType::from_bits(code)
            .update_kind()
            .filter(|kind| kind.get_code() == code)
            .ok_or_else(|| SwimError::Malformed(format!("unknown update type {:#04x}", code)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Header {
    pub packet_type: PacketType,
    pub sequence: u16,
}

impl Header {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_type.bits());
        buf.put_u16(self.sequence);
        buf.put_u8(0);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Header> {
        ensure_remaining(buf.remaining(), "header", HEADER_LEN)?;
        let packet_type = PacketType::from_bits(buf.get_u8());
        let sequence = buf.get_u16();
        // reserved
        buf.advance(1);
        Ok(Header { packet_type, sequence })
    }
}

/// One membership record as stored in the list and sent on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Member {
    pub id: MemberId,
    pub state: MemberState,
}

impl Member {
    pub fn new(id: MemberId, state: MemberState) -> Member {
        Member { id, state }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.id.timestamp);
        buf.put_u32(self.id.ip);
        buf.put_u8(self.state.bits());
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Member> {
        ensure_remaining(buf.remaining(), "member", MEMBER_LEN)?;
        let timestamp = buf.get_u64();
        let ip = buf.get_u32();
        let state = MemberState::from_bits(buf.get_u8());
        Ok(Member::new(MemberId::new(timestamp, ip), state))
    }
}

/// A gossip record announcing one membership change.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Update {
    pub update_id: u64,
    pub ttl: u8,
    pub kind: UpdateKind,
    pub member: Member,
}

impl Update {
    /// A freshly originated update with a random id.
    pub fn new(kind: UpdateKind, member: Member, ttl: u8) -> Update {
        Update { update_id: random_update_id(), ttl, kind, member }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.update_id);
        buf.put_u8(self.ttl);
        buf.put_u8(self.kind.get_code());
        self.member.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Update> {
        ensure_remaining(buf.remaining(), "update", UPDATE_LEN)?;
        let update_id = buf.get_u64();
        let ttl = buf.get_u8();
        let kind = UpdateKind::from_code(buf.get_u8())?;
        let member = Member::decode(buf)?;
        Ok(Update { update_id, ttl, kind, member })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes_mut = BytesMut::with_capacity(UPDATE_LEN);
        self.encode(&mut bytes_mut);
        bytes_mut.freeze()
    }
}

/// A header plus whatever bytes follow it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, sequence: u16, payload: Bytes) -> Packet {
        Packet { header: Header { packet_type, sequence }, payload }
    }

    pub fn encode(&self) -> Bytes {
        let mut bytes_mut = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.encode(&mut bytes_mut);
        bytes_mut.put_slice(&self.payload);
        bytes_mut.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Packet> {
        let header = Header::decode(&mut bytes)?;
        Ok(Packet { header, payload: bytes })
    }
}

pub fn encode_members<'a>(members: impl IntoIterator<Item = &'a Member>) -> Bytes {
    let mut bytes_mut = BytesMut::new();
    for member in members {
        member.encode(&mut bytes_mut);
    }
    bytes_mut.freeze()
}

/// Decodes `len / MEMBER_LEN` records; a trailing partial record is ignored.
pub fn decode_members(mut payload: Bytes) -> Vec<Member> {
    let count = payload.len() / MEMBER_LEN;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        match Member::decode(&mut payload) {
            Ok(member) => members.push(member),
            Err(_) => break,
        }
    }
    members
}

fn ensure_remaining(remaining: usize, what: &str, needed: usize) -> Result<()> {
    if remaining < needed {
        return Err(SwimError::too_short(what, needed, remaining));
    }
    Ok(())
}
