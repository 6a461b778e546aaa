//! # SyncDB Protocol
//!
//! Wire formats for SyncDB.
//!
//! This crate provides:
//! - Client commands, replies and change notifications
//! - Result codes mapped from engine errors
//! - NSF replication messages and information elements (IEs)
//!
//! This is a pure protocol crate with no I/O operations. Integers are
//! little-endian; table names are 32 bytes, zero padded.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;
mod nsf;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ClientStatus, Command, MessageType, Notification, NotifyEvent, ReadFlags, RegisterRequest,
    Reply, ReplyPayload, Request, ResultCode, DESCRIPTION_LEN, MAX_DATAGRAM, NOTIFICATION_LEN,
};
pub use nsf::{
    IeCommand, InfoElement, NsfHeader, NsfMessage, NsfMsgType, NsfRole, IE_HEADER_LEN,
    NSF_HEADER_LEN,
};
