//! Client command, reply and notification datagrams.
//!
//! ## Layout
//!
//! ```text
//! request:      | type (1) | client_id (2) | body... |
//! reply:        | REPLY (1) | request type (1) | result (1) | payload tag (1) | payload... |
//! notification: | NOTIFY (1) | event (1) | table name (32) |
//! ```
//!
//! Table names are 32 bytes, zero padded. Records carry a u32 length prefix
//! so that size mismatches are detected by the server rather than the codec.

use crate::codec::{
    finish, get_bool, get_fixed_text, get_len, get_name, get_record, get_string, get_u16, get_u32,
    get_u64, get_u8, put_fixed_text, put_name, put_record, put_string,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::nsf::NsfRole;
use bytes::BufMut;
use syncdb_core::{
    ClientId, CoreError, ReadOptions, RecordRead, TableFlags, TableKind, TableName, TableSpec,
    TableStatus,
};

/// Largest datagram either side will send.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Width of the client description field.
pub const DESCRIPTION_LEN: usize = 64;

/// Size of an encoded [`Notification`].
pub const NOTIFICATION_LEN: usize = 2 + syncdb_core::TABLE_NAME_LEN;

/// Message type tag, the first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Register a client.
    ClientRegister = 1,
    /// Dump server state to the log.
    Debug = 2,
    /// Query a registered client.
    ClientStatusGet = 3,
    /// Subscribe to a table's change notifications.
    TableChangeNotify = 4,
    /// Query a table's geometry and pending events.
    TableStatusGet = 5,
    /// Create an AVL table.
    AvlTableCreate = 6,
    /// Create a Record table.
    RecordTableCreate = 7,
    /// Delete a table.
    TableDelete = 8,
    /// Snapshot a table to disk.
    TableStore = 9,
    /// Insert a record.
    Insert = 10,
    /// Delete a record.
    Delete = 11,
    /// Replace a record.
    Set = 12,
    /// Replace part of a record.
    FieldSet = 13,
    /// Read a record.
    Get = 14,
    /// Read part of a record.
    FieldGet = 15,
    /// Read the next record in key order.
    GetNext = 16,
    /// Read the next record the caller has not seen.
    GetNextChanged = 17,
    /// Change the NSF role.
    NsfSyncEnable = 18,
    /// Server reply.
    Reply = 100,
    /// Change notification.
    Notify = 101,
}

impl MessageType {
    /// Converts a byte to a message type.
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::ClientRegister,
            2 => Self::Debug,
            3 => Self::ClientStatusGet,
            4 => Self::TableChangeNotify,
            5 => Self::TableStatusGet,
            6 => Self::AvlTableCreate,
            7 => Self::RecordTableCreate,
            8 => Self::TableDelete,
            9 => Self::TableStore,
            10 => Self::Insert,
            11 => Self::Delete,
            12 => Self::Set,
            13 => Self::FieldSet,
            14 => Self::Get,
            15 => Self::FieldGet,
            16 => Self::GetNext,
            17 => Self::GetNextChanged,
            18 => Self::NsfSyncEnable,
            100 => Self::Reply,
            101 => Self::Notify,
            _ => return None,
        })
    }

    /// Converts the message type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    /// Success.
    Ok = 0,
    /// Generic failure.
    Error = 1,
    /// The table does not exist.
    NoTable = 2,
    /// Record size does not match the table.
    SizeMismatch = 3,
    /// The table is full.
    Full = 4,
    /// No matching record.
    NotFound = 5,
    /// A live record with the key exists.
    EntryExists = 6,
    /// A table with the name exists.
    DuplicateName = 7,
    /// No client slot is free.
    MaxClients = 8,
}

impl ResultCode {
    /// Converts a byte to a result code.
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::NoTable,
            3 => Self::SizeMismatch,
            4 => Self::Full,
            5 => Self::NotFound,
            6 => Self::EntryExists,
            7 => Self::DuplicateName,
            8 => Self::MaxClients,
            _ => return None,
        })
    }

    /// Converts the result code to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Short human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::NoTable => "no-table",
            Self::SizeMismatch => "size-mismatch",
            Self::Full => "full",
            Self::NotFound => "not-found",
            Self::EntryExists => "entry-exists",
            Self::DuplicateName => "duplicate-name",
            Self::MaxClients => "max-clients",
        }
    }
}

impl From<&CoreError> for ResultCode {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::NoTable { .. } => Self::NoTable,
            CoreError::DuplicateName { .. } => Self::DuplicateName,
            CoreError::SizeMismatch { .. } => Self::SizeMismatch,
            CoreError::TableFull { .. } => Self::Full,
            CoreError::NotFound => Self::NotFound,
            CoreError::EntryExists => Self::EntryExists,
            CoreError::MaxClients { .. } => Self::MaxClients,
            CoreError::InvalidArgument { .. }
            | CoreError::Unsupported { .. }
            | CoreError::Snapshot { .. }
            | CoreError::Io(_)
            | CoreError::Invariant { .. } => Self::Error,
        }
    }
}

/// Flags carried by read commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadFlags(u8);

impl ReadFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Leave change bits untouched.
    pub const PRESERVE: Self = Self(1 << 0);
    /// Ignore the key and start from the first record (next reads only).
    pub const FROM_START: Self = Self(1 << 1);

    const KNOWN: u8 = 0x03;

    /// Builds flags from raw bits, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::KNOWN)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns these flags with `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Read options implied by the flags.
    #[must_use]
    pub const fn options(self) -> ReadOptions {
        ReadOptions {
            preserve: self.contains(Self::PRESERVE),
        }
    }
}

/// Body of a registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    /// Client process id, probed for liveness.
    pub pid: u32,
    /// Free-form description, truncated to [`DESCRIPTION_LEN`] bytes.
    pub description: String,
    /// Socket the server sends replies to.
    pub reply_path: String,
    /// Socket the server sends notifications to.
    pub notify_path: String,
}

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register a new client.
    ClientRegister(RegisterRequest),
    /// Dump server state.
    Debug,
    /// Query another (or the same) client.
    ClientStatusGet {
        /// Client to describe.
        target: ClientId,
    },
    /// Subscribe to change notifications.
    TableChangeNotify {
        /// Table name.
        table: TableName,
    },
    /// Query a table.
    TableStatusGet {
        /// Table name.
        table: TableName,
    },
    /// Create an AVL table.
    AvlTableCreate(TableSpec),
    /// Create a Record table.
    RecordTableCreate(TableSpec),
    /// Delete a table.
    TableDelete {
        /// Table name.
        table: TableName,
    },
    /// Snapshot a table to disk.
    TableStore {
        /// Table name.
        table: TableName,
    },
    /// Insert a record.
    Insert {
        /// Table name.
        table: TableName,
        /// Full record.
        record: Vec<u8>,
    },
    /// Delete by the key prefix of `record`.
    Delete {
        /// Table name.
        table: TableName,
        /// Record holding the key.
        record: Vec<u8>,
    },
    /// Replace a record.
    Set {
        /// Table name.
        table: TableName,
        /// Full record.
        record: Vec<u8>,
    },
    /// Replace `[offset, offset + len)` of a record.
    FieldSet {
        /// Table name.
        table: TableName,
        /// Window start.
        offset: u32,
        /// Window length.
        len: u32,
        /// Full record; bytes outside the window are ignored.
        record: Vec<u8>,
    },
    /// Read a record.
    Get {
        /// Table name.
        table: TableName,
        /// Read flags.
        flags: ReadFlags,
        /// Record holding the key.
        record: Vec<u8>,
    },
    /// Read `[offset, offset + len)` of a record.
    FieldGet {
        /// Table name.
        table: TableName,
        /// Read flags.
        flags: ReadFlags,
        /// Window start.
        offset: u32,
        /// Window length.
        len: u32,
        /// Record holding the key.
        record: Vec<u8>,
    },
    /// Read the record after the key.
    GetNext {
        /// Table name.
        table: TableName,
        /// Read flags.
        flags: ReadFlags,
        /// Record holding the key.
        record: Vec<u8>,
    },
    /// Read the next record the caller has not seen.
    GetNextChanged {
        /// Table name.
        table: TableName,
        /// Read flags.
        flags: ReadFlags,
        /// Record holding the key.
        record: Vec<u8>,
    },
    /// Change the NSF role.
    NsfSyncEnable {
        /// New role.
        role: NsfRole,
    },
}

impl Command {
    /// Returns the message type tag for this command.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ClientRegister(_) => MessageType::ClientRegister,
            Self::Debug => MessageType::Debug,
            Self::ClientStatusGet { .. } => MessageType::ClientStatusGet,
            Self::TableChangeNotify { .. } => MessageType::TableChangeNotify,
            Self::TableStatusGet { .. } => MessageType::TableStatusGet,
            Self::AvlTableCreate(_) => MessageType::AvlTableCreate,
            Self::RecordTableCreate(_) => MessageType::RecordTableCreate,
            Self::TableDelete { .. } => MessageType::TableDelete,
            Self::TableStore { .. } => MessageType::TableStore,
            Self::Insert { .. } => MessageType::Insert,
            Self::Delete { .. } => MessageType::Delete,
            Self::Set { .. } => MessageType::Set,
            Self::FieldSet { .. } => MessageType::FieldSet,
            Self::Get { .. } => MessageType::Get,
            Self::FieldGet { .. } => MessageType::FieldGet,
            Self::GetNext { .. } => MessageType::GetNext,
            Self::GetNextChanged { .. } => MessageType::GetNextChanged,
            Self::NsfSyncEnable { .. } => MessageType::NsfSyncEnable,
        }
    }

    /// Returns true if the command needs no prior registration.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::ClientRegister(_) | Self::Debug)
    }
}

/// A command with the sender's client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Sender. Ignored for anonymous commands.
    pub client_id: ClientId,
    /// The command.
    pub command: Command,
}

impl Request {
    /// Creates a request.
    pub fn new(client_id: ClientId, command: Command) -> Self {
        Self { client_id, command }
    }

    /// Encodes the request.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(self.command.message_type().as_byte());
        buf.put_u16_le(self.client_id.as_u16());

        match &self.command {
            Command::ClientRegister(reg) => {
                buf.put_u32_le(reg.pid);
                put_fixed_text::<DESCRIPTION_LEN>(&mut buf, &reg.description);
                put_string(&mut buf, "reply path", &reg.reply_path)?;
                put_string(&mut buf, "notify path", &reg.notify_path)?;
            }
            Command::Debug => {}
            Command::ClientStatusGet { target } => buf.put_u16_le(target.as_u16()),
            Command::TableChangeNotify { table }
            | Command::TableStatusGet { table }
            | Command::TableDelete { table }
            | Command::TableStore { table } => put_name(&mut buf, table),
            Command::AvlTableCreate(spec) => {
                put_name(&mut buf, &spec.name);
                buf.put_u32_le(spec.flags.bits());
                put_dim(&mut buf, "record size", spec.record_size)?;
                put_dim(&mut buf, "key size", spec.key_size)?;
                put_dim(&mut buf, "max records", spec.max_records)?;
                put_dim(&mut buf, "max live records", spec.max_non_deleted_records)?;
            }
            Command::RecordTableCreate(spec) => {
                put_name(&mut buf, &spec.name);
                buf.put_u32_le(spec.flags.bits());
                put_dim(&mut buf, "record size", spec.record_size)?;
            }
            Command::Insert { table, record }
            | Command::Delete { table, record }
            | Command::Set { table, record } => {
                put_name(&mut buf, table);
                put_record(&mut buf, record)?;
            }
            Command::FieldSet {
                table,
                offset,
                len,
                record,
            } => {
                put_name(&mut buf, table);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*len);
                put_record(&mut buf, record)?;
            }
            Command::Get {
                table,
                flags,
                record,
            }
            | Command::GetNext {
                table,
                flags,
                record,
            }
            | Command::GetNextChanged {
                table,
                flags,
                record,
            } => {
                put_name(&mut buf, table);
                buf.put_u8(flags.bits());
                put_record(&mut buf, record)?;
            }
            Command::FieldGet {
                table,
                flags,
                offset,
                len,
                record,
            } => {
                put_name(&mut buf, table);
                buf.put_u8(flags.bits());
                buf.put_u32_le(*offset);
                buf.put_u32_le(*len);
                put_record(&mut buf, record)?;
            }
            Command::NsfSyncEnable { role } => buf.put_u8(role.as_byte()),
        }
        check_size(&buf)?;
        Ok(buf)
    }

    /// Decodes a request datagram.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut buf = bytes;
        let tag = get_u8(&mut buf, "message type")?;
        let message_type =
            MessageType::from_byte(tag).ok_or_else(|| ProtocolError::unknown_tag("message type", tag))?;
        let client_id = ClientId::new(get_u16(&mut buf, "client id")?);

        let command = match message_type {
            MessageType::ClientRegister => Command::ClientRegister(RegisterRequest {
                pid: get_u32(&mut buf, "pid")?,
                description: get_fixed_text::<DESCRIPTION_LEN>(&mut buf, "description")?,
                reply_path: get_string(&mut buf, "reply path")?,
                notify_path: get_string(&mut buf, "notify path")?,
            }),
            MessageType::Debug => Command::Debug,
            MessageType::ClientStatusGet => Command::ClientStatusGet {
                target: ClientId::new(get_u16(&mut buf, "target client")?),
            },
            MessageType::TableChangeNotify => Command::TableChangeNotify {
                table: get_name(&mut buf)?,
            },
            MessageType::TableStatusGet => Command::TableStatusGet {
                table: get_name(&mut buf)?,
            },
            MessageType::AvlTableCreate => {
                let name = get_name(&mut buf)?;
                let flags = TableFlags::from_bits_truncate(get_u32(&mut buf, "flags")?);
                let record_size = get_len(&mut buf, "record size")?;
                let key_size = get_len(&mut buf, "key size")?;
                let max_records = get_len(&mut buf, "max records")?;
                let live_cap = get_len(&mut buf, "max live records")?;
                Command::AvlTableCreate(
                    TableSpec::avl(name, record_size, key_size, max_records)
                        .with_live_cap(live_cap)
                        .with_flags(flags),
                )
            }
            MessageType::RecordTableCreate => {
                let name = get_name(&mut buf)?;
                let flags = TableFlags::from_bits_truncate(get_u32(&mut buf, "flags")?);
                let record_size = get_len(&mut buf, "record size")?;
                Command::RecordTableCreate(TableSpec::record(name, record_size).with_flags(flags))
            }
            MessageType::TableDelete => Command::TableDelete {
                table: get_name(&mut buf)?,
            },
            MessageType::TableStore => Command::TableStore {
                table: get_name(&mut buf)?,
            },
            MessageType::Insert => Command::Insert {
                table: get_name(&mut buf)?,
                record: get_record(&mut buf)?,
            },
            MessageType::Delete => Command::Delete {
                table: get_name(&mut buf)?,
                record: get_record(&mut buf)?,
            },
            MessageType::Set => Command::Set {
                table: get_name(&mut buf)?,
                record: get_record(&mut buf)?,
            },
            MessageType::FieldSet => Command::FieldSet {
                table: get_name(&mut buf)?,
                offset: get_u32(&mut buf, "offset")?,
                len: get_u32(&mut buf, "length")?,
                record: get_record(&mut buf)?,
            },
            MessageType::Get => Command::Get {
                table: get_name(&mut buf)?,
                flags: ReadFlags::from_bits_truncate(get_u8(&mut buf, "read flags")?),
                record: get_record(&mut buf)?,
            },
            MessageType::FieldGet => Command::FieldGet {
                table: get_name(&mut buf)?,
                flags: ReadFlags::from_bits_truncate(get_u8(&mut buf, "read flags")?),
                offset: get_u32(&mut buf, "offset")?,
                len: get_u32(&mut buf, "length")?,
                record: get_record(&mut buf)?,
            },
            MessageType::GetNext => Command::GetNext {
                table: get_name(&mut buf)?,
                flags: ReadFlags::from_bits_truncate(get_u8(&mut buf, "read flags")?),
                record: get_record(&mut buf)?,
            },
            MessageType::GetNextChanged => Command::GetNextChanged {
                table: get_name(&mut buf)?,
                flags: ReadFlags::from_bits_truncate(get_u8(&mut buf, "read flags")?),
                record: get_record(&mut buf)?,
            },
            MessageType::NsfSyncEnable => {
                let tag = get_u8(&mut buf, "role")?;
                Command::NsfSyncEnable {
                    role: NsfRole::from_byte(tag).ok_or_else(|| ProtocolError::unknown_tag("role", tag))?,
                }
            }
            MessageType::Reply | MessageType::Notify => {
                return Err(ProtocolError::invalid("message type", "not a request"));
            }
        };
        finish(&buf)?;
        Ok(Self { client_id, command })
    }
}

fn put_dim(buf: &mut Vec<u8>, field: &'static str, value: usize) -> ProtocolResult<()> {
    let value = u32::try_from(value).map_err(|_| ProtocolError::TooLarge {
        field,
        len: value,
        limit: u32::MAX as usize,
    })?;
    buf.put_u32_le(value);
    Ok(())
}

fn get_dim(buf: &mut &[u8], field: &'static str) -> ProtocolResult<usize> {
    get_len(buf, field)
}

fn check_size(buf: &[u8]) -> ProtocolResult<()> {
    if buf.len() > MAX_DATAGRAM {
        return Err(ProtocolError::TooLarge {
            field: "datagram",
            len: buf.len(),
            limit: MAX_DATAGRAM,
        });
    }
    Ok(())
}

/// Description of a registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    /// Client id.
    pub client_id: ClientId,
    /// Process id.
    pub pid: u32,
    /// Description given at registration.
    pub description: String,
    /// Commands processed for the client.
    pub commands: u64,
    /// Change notifications sent to the client.
    pub notifications: u64,
    /// Purge notifications sent to the client.
    pub purges: u64,
}

/// Data returned with a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    /// Nothing.
    None,
    /// Newly assigned client id.
    ClientId(ClientId),
    /// Client description.
    ClientStatus(ClientStatus),
    /// Table description.
    TableStatus(TableStatus),
    /// A record read.
    Record(RecordRead),
    /// Free text (debug dump).
    Text(String),
}

impl ReplyPayload {
    fn tag(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::ClientId(_) => 1,
            Self::ClientStatus(_) => 2,
            Self::TableStatus(_) => 3,
            Self::Record(_) => 4,
            Self::Text(_) => 5,
        }
    }
}

/// Server reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Type of the command being answered.
    pub request_type: MessageType,
    /// Outcome.
    pub result: ResultCode,
    /// Returned data.
    pub payload: ReplyPayload,
}

impl Reply {
    /// Successful reply without data.
    pub fn ok(request_type: MessageType) -> Self {
        Self {
            request_type,
            result: ResultCode::Ok,
            payload: ReplyPayload::None,
        }
    }

    /// Failed reply.
    pub fn failed(request_type: MessageType, result: ResultCode) -> Self {
        Self {
            request_type,
            result,
            payload: ReplyPayload::None,
        }
    }

    /// Successful reply with data.
    pub fn with_payload(request_type: MessageType, payload: ReplyPayload) -> Self {
        Self {
            request_type,
            result: ResultCode::Ok,
            payload,
        }
    }

    /// Encodes the reply.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(16);
        buf.put_u8(MessageType::Reply.as_byte());
        buf.put_u8(self.request_type.as_byte());
        buf.put_u8(self.result.as_byte());
        buf.put_u8(self.payload.tag());
        match &self.payload {
            ReplyPayload::None => {}
            ReplyPayload::ClientId(id) => buf.put_u16_le(id.as_u16()),
            ReplyPayload::ClientStatus(status) => {
                buf.put_u16_le(status.client_id.as_u16());
                buf.put_u32_le(status.pid);
                put_fixed_text::<DESCRIPTION_LEN>(&mut buf, &status.description);
                buf.put_u64_le(status.commands);
                buf.put_u64_le(status.notifications);
                buf.put_u64_le(status.purges);
            }
            ReplyPayload::TableStatus(status) => {
                buf.put_u8(status.kind.as_byte());
                buf.put_u32_le(status.flags.bits());
                put_dim(&mut buf, "record size", status.record_size)?;
                put_dim(&mut buf, "key size", status.key_size)?;
                put_dim(&mut buf, "max records", status.max_records)?;
                put_dim(&mut buf, "max live records", status.max_non_deleted_records)?;
                put_dim(&mut buf, "records", status.num_records)?;
                put_dim(&mut buf, "live records", status.num_non_deleted_records)?;
                buf.put_u8(u8::from(status.created));
                buf.put_u8(u8::from(status.changed));
                buf.put_u8(u8::from(status.purged));
            }
            ReplyPayload::Record(read) => {
                buf.put_u8(u8::from(read.delete_pending));
                put_record(&mut buf, &read.data)?;
            }
            ReplyPayload::Text(text) => put_record(&mut buf, text.as_bytes())?,
        }
        check_size(&buf)?;
        Ok(buf)
    }

    /// Decodes a reply datagram.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut buf = bytes;
        let tag = get_u8(&mut buf, "message type")?;
        if tag != MessageType::Reply.as_byte() {
            return Err(ProtocolError::invalid("message type", format!("{tag} is not a reply")));
        }
        let tag = get_u8(&mut buf, "request type")?;
        let request_type =
            MessageType::from_byte(tag).ok_or_else(|| ProtocolError::unknown_tag("request type", tag))?;
        let tag = get_u8(&mut buf, "result")?;
        let result = ResultCode::from_byte(tag).ok_or_else(|| ProtocolError::unknown_tag("result", tag))?;

        let payload = match get_u8(&mut buf, "payload")? {
            0 => ReplyPayload::None,
            1 => ReplyPayload::ClientId(ClientId::new(get_u16(&mut buf, "client id")?)),
            2 => ReplyPayload::ClientStatus(ClientStatus {
                client_id: ClientId::new(get_u16(&mut buf, "client id")?),
                pid: get_u32(&mut buf, "pid")?,
                description: get_fixed_text::<DESCRIPTION_LEN>(&mut buf, "description")?,
                commands: get_u64(&mut buf, "commands")?,
                notifications: get_u64(&mut buf, "notifications")?,
                purges: get_u64(&mut buf, "purges")?,
            }),
            3 => {
                let tag = get_u8(&mut buf, "table kind")?;
                let kind =
                    TableKind::from_byte(tag).ok_or_else(|| ProtocolError::unknown_tag("table kind", tag))?;
                ReplyPayload::TableStatus(TableStatus {
                    kind,
                    flags: TableFlags::from_bits_truncate(get_u32(&mut buf, "flags")?),
                    record_size: get_dim(&mut buf, "record size")?,
                    key_size: get_dim(&mut buf, "key size")?,
                    max_records: get_dim(&mut buf, "max records")?,
                    max_non_deleted_records: get_dim(&mut buf, "max live records")?,
                    num_records: get_dim(&mut buf, "records")?,
                    num_non_deleted_records: get_dim(&mut buf, "live records")?,
                    created: get_bool(&mut buf, "created")?,
                    changed: get_bool(&mut buf, "changed")?,
                    purged: get_bool(&mut buf, "purged")?,
                })
            }
            4 => ReplyPayload::Record(RecordRead {
                delete_pending: get_bool(&mut buf, "delete pending")?,
                data: get_record(&mut buf)?,
            }),
            5 => {
                let bytes = get_record(&mut buf)?;
                ReplyPayload::Text(
                    String::from_utf8(bytes).map_err(|_| ProtocolError::invalid("text", "not UTF-8"))?,
                )
            }
            tag => return Err(ProtocolError::unknown_tag("payload", tag)),
        };
        finish(&buf)?;
        Ok(Self {
            request_type,
            result,
            payload,
        })
    }
}

/// What happened to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NotifyEvent {
    /// Records changed or the table was created.
    Changed = 1,
    /// Tombstones were purged; change tracking may have gaps.
    Purged = 2,
    /// The table was deleted.
    Deleted = 3,
}

impl NotifyEvent {
    /// Converts a byte to an event.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Changed),
            2 => Some(Self::Purged),
            3 => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Wake-up datagram sent to subscribed clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// What happened.
    pub event: NotifyEvent,
    /// Table it happened to.
    pub table: TableName,
}

impl Notification {
    /// Encodes the notification into its fixed-size form.
    pub fn encode(&self) -> [u8; NOTIFICATION_LEN] {
        let mut out = [0u8; NOTIFICATION_LEN];
        out[0] = MessageType::Notify.as_byte();
        out[1] = self.event as u8;
        out[2..].copy_from_slice(self.table.as_padded());
        out
    }

    /// Decodes a notification datagram.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut buf = bytes;
        let tag = get_u8(&mut buf, "message type")?;
        if tag != MessageType::Notify.as_byte() {
            return Err(ProtocolError::invalid("message type", format!("{tag} is not a notification")));
        }
        let tag = get_u8(&mut buf, "event")?;
        let event = NotifyEvent::from_byte(tag).ok_or_else(|| ProtocolError::unknown_tag("event", tag))?;
        let table = get_name(&mut buf)?;
        finish(&buf)?;
        Ok(Self { event, table })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> TableName {
        TableName::new(s).unwrap()
    }

    #[test]
    fn register_request_layout() {
        let req = Request::new(
            ClientId::new(0),
            Command::ClientRegister(RegisterRequest {
                pid: 4242,
                description: "fdb agent".into(),
                reply_path: "/run/syncdb/r.7".into(),
                notify_path: "/run/syncdb/n.7".into(),
            }),
        );
        let bytes = req.encode().unwrap();
        assert_eq!(bytes[0], MessageType::ClientRegister.as_byte());
        assert_eq!(&bytes[3..7], &4242u32.to_le_bytes());
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn avl_create_carries_geometry() {
        let spec = TableSpec::avl(name("T"), 8, 4, 2)
            .with_live_cap(1)
            .with_flags(TableFlags::NSF | TableFlags::STORABLE);
        let req = Request::new(ClientId::new(3), Command::AvlTableCreate(spec.clone()));
        let decoded = Request::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.client_id, ClientId::new(3));
        assert_eq!(decoded.command, Command::AvlTableCreate(spec));
    }

    #[test]
    fn get_next_flags() {
        let req = Request::new(
            ClientId::new(1),
            Command::GetNext {
                table: name("T"),
                flags: ReadFlags::FROM_START.with(ReadFlags::PRESERVE),
                record: vec![0; 8],
            },
        );
        let decoded = Request::decode(&req.encode().unwrap()).unwrap();
        let Command::GetNext { flags, .. } = decoded.command else {
            panic!("wrong command");
        };
        assert!(flags.contains(ReadFlags::FROM_START));
        assert!(flags.options().preserve);
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert!(Request::decode(&[]).is_err());
        assert!(matches!(
            Request::decode(&[99, 0, 0]),
            Err(ProtocolError::UnknownTag { tag: 99, .. })
        ));
        // Insert with a record length that runs past the datagram.
        let mut bytes = vec![MessageType::Insert.as_byte(), 1, 0];
        bytes.extend_from_slice(name("T").as_padded());
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(
            Request::decode(&bytes),
            Err(ProtocolError::Truncated { .. })
        ));
        // Trailing garbage.
        let mut bytes = Request::new(ClientId::new(1), Command::Debug).encode().unwrap();
        bytes.push(0);
        assert_eq!(Request::decode(&bytes), Err(ProtocolError::Trailing(1)));
    }

    #[test]
    fn reply_with_record() {
        let reply = Reply::with_payload(
            MessageType::GetNextChanged,
            ReplyPayload::Record(RecordRead {
                data: vec![1, 2, 3, 4],
                delete_pending: true,
            }),
        );
        let bytes = reply.encode().unwrap();
        assert_eq!(&bytes[..4], &[100, 17, 0, 4]);
        assert_eq!(Reply::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn reply_with_table_status() {
        let status = TableStatus {
            kind: TableKind::Avl,
            flags: TableFlags::NSF,
            record_size: 8,
            key_size: 4,
            max_records: 2,
            max_non_deleted_records: 2,
            num_records: 2,
            num_non_deleted_records: 1,
            created: false,
            changed: true,
            purged: false,
        };
        let reply = Reply::with_payload(MessageType::TableStatusGet, ReplyPayload::TableStatus(status));
        assert_eq!(Reply::decode(&reply.encode().unwrap()).unwrap(), reply);
    }

    #[test]
    fn error_codes_follow_core_errors() {
        assert_eq!(ResultCode::from(&CoreError::NotFound), ResultCode::NotFound);
        assert_eq!(ResultCode::from(&CoreError::table_full("T")), ResultCode::Full);
        assert_eq!(
            ResultCode::from(&CoreError::Unsupported {
                operation: "insert",
                kind: "record"
            }),
            ResultCode::Error
        );
    }

    #[test]
    fn notification_is_fixed_size() {
        let note = Notification {
            event: NotifyEvent::Purged,
            table: name("vlan"),
        };
        let bytes = note.encode();
        assert_eq!(bytes.len(), NOTIFICATION_LEN);
        assert_eq!(Notification::decode(&bytes).unwrap(), note);
        assert!(Notification::decode(&bytes[..10]).is_err());
    }
}
