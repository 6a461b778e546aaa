//! NSF replication messages exchanged with the agent.
//!
//! ## Layout
//!
//! ```text
//! header (15): | first_trans (1) | ack_request (1) | msg_size (4) | msg_type (1) | seq (8) |
//! IE (47 + n): | cmd (1) | size (4) | table (32) | segment_size (4) | record_offset (4) |
//!              | first_seg (1) | last_seg (1) | payload (n) |
//! ```
//!
//! `msg_size` covers the header and every IE. `size` covers one IE header
//! and its payload; `segment_size` is the payload length.

use crate::codec::{
    finish, get_array, get_bool, get_u32, get_u64, get_u8, get_vec, need, put_name,
};
use crate::error::{ProtocolError, ProtocolResult};
use bytes::BufMut;
use syncdb_core::{TableName, TABLE_NAME_LEN};

/// Size of the message header.
pub const NSF_HEADER_LEN: usize = 15;

/// Size of an IE header.
pub const IE_HEADER_LEN: usize = 10 + TABLE_NAME_LEN + 5;

/// Replication role of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum NsfRole {
    /// Neither sending nor receiving.
    #[default]
    Disabled = 0,
    /// Active unit; sends changes.
    Manager = 1,
    /// Standby unit; applies changes.
    Backup = 2,
}

impl NsfRole {
    /// Converts a byte to a role.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Disabled),
            1 => Some(Self::Manager),
            2 => Some(Self::Backup),
            _ => None,
        }
    }

    /// Converts the role to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Short human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Manager => "manager",
            Self::Backup => "backup",
        }
    }
}

/// Kind of NSF message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NsfMsgType {
    /// Carries IEs (or nothing, for first_trans and ACK requests).
    Data = 1,
    /// Receiver has applied everything up to `seq`.
    Ack = 2,
    /// Receiver saw a gap after `seq`.
    Miss = 3,
}

impl NsfMsgType {
    /// Converts a byte to a message type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Data),
            2 => Some(Self::Ack),
            3 => Some(Self::Miss),
            _ => None,
        }
    }
}

/// IE command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IeCommand {
    /// Ignored by the receiver.
    Noop = 0,
    /// Remove the node whose key is the payload.
    Delete = 1,
    /// Drop every delete-pending node of the table.
    Purge = 2,
    /// One segment of a record.
    Set = 3,
}

impl IeCommand {
    /// Converts a byte to a command.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Noop),
            1 => Some(Self::Delete),
            2 => Some(Self::Purge),
            3 => Some(Self::Set),
            _ => None,
        }
    }
}

/// One replication instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoElement {
    /// What to do.
    pub cmd: IeCommand,
    /// Target table; `None` only for NOOP.
    pub table: Option<TableName>,
    /// Offset of the payload within the record (SET only).
    pub record_offset: u32,
    /// First segment of a record.
    pub first_seg: bool,
    /// Last segment of a record.
    pub last_seg: bool,
    /// Key (DELETE), whole record (tombstone DELETE) or record bytes (SET).
    pub payload: Vec<u8>,
}

impl InfoElement {
    /// An IE the receiver skips.
    pub fn noop() -> Self {
        Self {
            cmd: IeCommand::Noop,
            table: None,
            record_offset: 0,
            first_seg: true,
            last_seg: true,
            payload: Vec::new(),
        }
    }

    /// Drop the table's tombstones.
    pub fn purge(table: TableName) -> Self {
        Self {
            cmd: IeCommand::Purge,
            table: Some(table),
            ..Self::noop()
        }
    }

    /// Remove a node by key.
    pub fn delete(table: TableName, key: Vec<u8>) -> Self {
        Self {
            cmd: IeCommand::Delete,
            table: Some(table),
            payload: key,
            ..Self::noop()
        }
    }

    /// Delete a node the manager keeps as a tombstone.
    ///
    /// The payload is the whole record so the backup can hold an identical
    /// tombstone; `last_seg` is clear to tell it apart from a bare delete.
    pub fn tombstone(table: TableName, record: Vec<u8>) -> Self {
        Self {
            cmd: IeCommand::Delete,
            table: Some(table),
            last_seg: false,
            payload: record,
            ..Self::noop()
        }
    }

    /// Returns true for a DELETE built by [`InfoElement::tombstone`].
    pub fn is_tombstone(&self) -> bool {
        self.cmd == IeCommand::Delete && !self.last_seg
    }

    /// One segment of a record.
    pub fn set_segment(
        table: TableName,
        record_offset: u32,
        first_seg: bool,
        last_seg: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            cmd: IeCommand::Set,
            table: Some(table),
            record_offset,
            first_seg,
            last_seg,
            payload,
        }
    }

    /// Encoded length of this IE.
    pub fn encoded_len(&self) -> usize {
        IE_HEADER_LEN + self.payload.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> ProtocolResult<()> {
        let size = u32_len("IE", self.encoded_len())?;
        buf.put_u8(self.cmd as u8);
        buf.put_u32_le(size);
        match &self.table {
            Some(table) => put_name(buf, table),
            None => buf.put_slice(&[0; TABLE_NAME_LEN]),
        }
        buf.put_u32_le(u32_len("segment", self.payload.len())?);
        buf.put_u32_le(self.record_offset);
        buf.put_u8(u8::from(self.first_seg));
        buf.put_u8(u8::from(self.last_seg));
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_from(buf: &mut &[u8]) -> ProtocolResult<Self> {
        need(&*buf, "IE header", IE_HEADER_LEN)?;
        let tag = get_u8(buf, "IE command")?;
        let cmd = IeCommand::from_byte(tag).ok_or_else(|| ProtocolError::unknown_tag("IE command", tag))?;
        let size = get_u32(buf, "IE size")? as usize;
        let padded = get_array::<TABLE_NAME_LEN>(buf, "table name")?;
        let table = if padded.iter().all(|&b| b == 0) {
            None
        } else {
            Some(
                TableName::from_padded(padded)
                    .map_err(|e| ProtocolError::invalid("table name", e.to_string()))?,
            )
        };
        let segment_size = get_u32(buf, "segment size")? as usize;
        let record_offset = get_u32(buf, "record offset")?;
        let first_seg = get_bool(buf, "first segment")?;
        let last_seg = get_bool(buf, "last segment")?;
        if size != IE_HEADER_LEN + segment_size {
            return Err(ProtocolError::invalid(
                "IE size",
                format!("{size} does not match segment of {segment_size} bytes"),
            ));
        }
        if table.is_none() && cmd != IeCommand::Noop {
            return Err(ProtocolError::invalid("table name", "missing"));
        }
        let payload = get_vec(buf, "IE payload", segment_size)?;
        Ok(Self {
            cmd,
            table,
            record_offset,
            first_seg,
            last_seg,
            payload,
        })
    }
}

/// NSF message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NsfHeader {
    /// Start of a new stream; resets the receiver's sequence.
    pub first_trans: bool,
    /// Receiver must answer with an ACK.
    pub ack_request: bool,
    /// Message kind.
    pub msg_type: NsfMsgType,
    /// Sequence number.
    pub seq: u64,
}

/// A complete NSF message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsfMessage {
    /// Header.
    pub header: NsfHeader,
    /// Instructions, in order.
    pub ies: Vec<InfoElement>,
}

impl NsfMessage {
    /// Data message with no IEs yet.
    pub fn data(seq: u64) -> Self {
        Self::bare(NsfMsgType::Data, seq)
    }

    /// Stream start announcement.
    pub fn first_trans(seq: u64) -> Self {
        let mut msg = Self::data(seq);
        msg.header.first_trans = true;
        msg.header.ack_request = true;
        msg
    }

    /// Empty data message asking for an ACK.
    pub fn ack_request(seq: u64) -> Self {
        let mut msg = Self::data(seq);
        msg.header.ack_request = true;
        msg
    }

    /// Acknowledgement up to `seq`.
    pub fn ack(seq: u64) -> Self {
        Self::bare(NsfMsgType::Ack, seq)
    }

    /// Gap report; `seq` is the last sequence applied.
    pub fn miss(seq: u64) -> Self {
        Self::bare(NsfMsgType::Miss, seq)
    }

    fn bare(msg_type: NsfMsgType, seq: u64) -> Self {
        Self {
            header: NsfHeader {
                first_trans: false,
                ack_request: false,
                msg_type,
                seq,
            },
            ies: Vec::new(),
        }
    }

    /// Sequence number.
    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    /// Returns true if the message carries no IEs.
    pub fn is_empty(&self) -> bool {
        self.ies.is_empty()
    }

    /// Encoded length of the whole message.
    pub fn encoded_len(&self) -> usize {
        NSF_HEADER_LEN + self.ies.iter().map(InfoElement::encoded_len).sum::<usize>()
    }

    /// Encodes the message.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let len = self.encoded_len();
        let mut buf = Vec::with_capacity(len);
        buf.put_u8(u8::from(self.header.first_trans));
        buf.put_u8(u8::from(self.header.ack_request));
        buf.put_u32_le(u32_len("message", len)?);
        buf.put_u8(self.header.msg_type as u8);
        buf.put_u64_le(self.header.seq);
        for ie in &self.ies {
            ie.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    /// Decodes a message.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut buf = bytes;
        need(&buf, "NSF header", NSF_HEADER_LEN)?;
        let first_trans = get_bool(&mut buf, "first_trans")?;
        let ack_request = get_bool(&mut buf, "ack_request")?;
        let msg_size = get_u32(&mut buf, "message size")? as usize;
        let tag = get_u8(&mut buf, "NSF message type")?;
        let msg_type =
            NsfMsgType::from_byte(tag).ok_or_else(|| ProtocolError::unknown_tag("NSF message type", tag))?;
        let seq = get_u64(&mut buf, "sequence")?;
        if msg_size != bytes.len() {
            return Err(ProtocolError::invalid(
                "message size",
                format!("header says {msg_size}, datagram has {}", bytes.len()),
            ));
        }

        let mut ies = Vec::new();
        while !buf.is_empty() {
            ies.push(InfoElement::decode_from(&mut buf)?);
        }
        if msg_type != NsfMsgType::Data && !ies.is_empty() {
            return Err(ProtocolError::invalid("NSF message", "control message with IEs"));
        }
        finish(&buf)?;
        Ok(Self {
            header: NsfHeader {
                first_trans,
                ack_request,
                msg_type,
                seq,
            },
            ies,
        })
    }
}

fn u32_len(field: &'static str, len: usize) -> ProtocolResult<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::TooLarge {
        field,
        len,
        limit: u32::MAX as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> TableName {
        TableName::new(s).unwrap()
    }

    #[test]
    fn header_layout() {
        let bytes = NsfMessage::first_trans(7).encode().unwrap();
        assert_eq!(bytes.len(), NSF_HEADER_LEN);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..6], &15u32.to_le_bytes());
        assert_eq!(bytes[6], NsfMsgType::Data as u8);
        assert_eq!(&bytes[7..15], &7u64.to_le_bytes());
    }

    #[test]
    fn data_message_with_ies() {
        let mut msg = NsfMessage::data(3);
        msg.header.ack_request = true;
        msg.ies.push(InfoElement::purge(name("vlan")));
        msg.ies.push(InfoElement::delete(name("vlan"), vec![1, 0, 0, 0]));
        msg.ies
            .push(InfoElement::set_segment(name("vlan"), 0, true, false, vec![9; 5]));
        msg.ies
            .push(InfoElement::set_segment(name("vlan"), 5, false, true, vec![8; 3]));
        msg.ies.push(InfoElement::noop());

        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(bytes.len(), NSF_HEADER_LEN + 5 * IE_HEADER_LEN + 4 + 5 + 3);
        assert_eq!(NsfMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn tombstone_delete_is_distinguishable() {
        let mut msg = NsfMessage::data(4);
        msg.ies.push(InfoElement::tombstone(name("vlan"), vec![1, 0, 7, 7]));
        msg.ies.push(InfoElement::delete(name("vlan"), vec![1, 0]));
        let decoded = NsfMessage::decode(&msg.encode().unwrap()).unwrap();
        assert!(decoded.ies[0].is_tombstone());
        assert_eq!(decoded.ies[0].payload, vec![1, 0, 7, 7]);
        assert!(!decoded.ies[1].is_tombstone());
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut bytes = NsfMessage::ack(1).encode().unwrap();
        bytes.push(0);
        assert!(NsfMessage::decode(&bytes).is_err());

        let mut msg = NsfMessage::data(1);
        msg.ies.push(InfoElement::delete(name("T"), vec![1, 2]));
        let mut bytes = msg.encode().unwrap();
        // Corrupt the segment size.
        bytes[NSF_HEADER_LEN + 37] = 9;
        assert!(NsfMessage::decode(&bytes).is_err());
    }

    #[test]
    fn control_messages_carry_no_ies() {
        let mut msg = NsfMessage::miss(4);
        msg.ies.push(InfoElement::purge(name("T")));
        let bytes = msg.encode().unwrap();
        assert!(NsfMessage::decode(&bytes).is_err());
        assert_eq!(
            NsfMessage::decode(&NsfMessage::miss(4).encode().unwrap()).unwrap(),
            NsfMessage::miss(4)
        );
    }

    #[test]
    fn roles() {
        assert_eq!(NsfRole::from_byte(1), Some(NsfRole::Manager));
        assert_eq!(NsfRole::from_byte(3), None);
        assert_eq!(NsfRole::default(), NsfRole::Disabled);
    }
}
