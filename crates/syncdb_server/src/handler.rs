//! Command dispatch.
//!
//! Every request yields at most one reply, produced synchronously. Change
//! masks, notifications and NSF dirty flags are all settled before the reply
//! is returned, so a client that sees the reply can rely on other clients
//! having been woken.

use crate::client;
use crate::error::{ServerError, ServerResult};
use crate::notify::notify;
use crate::server::{ReplyTo, Server};
use std::path::Path;
use syncdb_core::{ClientId, CoreError, CoreResult, TableKind, TableName, TableSpec};
use syncdb_protocol::{
    Command, MessageType, NotifyEvent, ReadFlags, RegisterRequest, Reply, ReplyPayload, Request,
    ResultCode, MAX_DATAGRAM,
};
use tracing::{debug, info, warn};

/// Reply header plus the text length prefix.
const TEXT_REPLY_OVERHEAD: usize = 8;

/// What a read command asks for.
#[derive(Clone, Copy)]
enum ReadKind {
    Exact,
    Next,
    NextChanged,
}

impl Server {
    /// Executes one request.
    ///
    /// Returns the reply and where it goes. Requests from unknown clients
    /// produce no reply. Only fatal errors are returned as `Err`.
    pub fn dispatch(
        &mut self,
        request: Request,
        source: Option<&Path>,
    ) -> ServerResult<(Option<Reply>, ReplyTo)> {
        let request_type = request.command.message_type();
        self.stats.commands += 1;

        match request.command {
            Command::ClientRegister(register) => Ok(self.register(&register)),
            Command::Debug => {
                let to = match source {
                    Some(path) => ReplyTo::Path(path.to_path_buf()),
                    None if self.clients.get(request.client_id).is_some() => {
                        ReplyTo::Client(request.client_id)
                    }
                    None => ReplyTo::Nobody,
                };
                let mut dump = self.debug_dump();
                client::truncate_utf8(&mut dump, MAX_DATAGRAM - TEXT_REPLY_OVERHEAD);
                Ok((Some(Reply::with_payload(request_type, ReplyPayload::Text(dump))), to))
            }
            command => {
                let client = request.client_id;
                let Some(entry) = self.clients.get_mut(client) else {
                    debug!(client = %client, ?request_type, "request from unknown client dropped");
                    self.stats.dropped += 1;
                    return Ok((None, ReplyTo::Nobody));
                };
                entry.count_command();

                let reply = match self.execute(client, command) {
                    Ok(reply) => reply,
                    Err(err) if err.is_fatal() => {
                        return Err(ServerError::Core(err));
                    }
                    Err(err) => {
                        debug!(client = %client, ?request_type, error = %err, "request failed");
                        Reply::failed(request_type, ResultCode::from(&err))
                    }
                };
                Ok((Some(reply), ReplyTo::Client(client)))
            }
        }
    }

    fn register(&mut self, register: &RegisterRequest) -> (Option<Reply>, ReplyTo) {
        let request_type = MessageType::ClientRegister;
        match self.clients.register(register) {
            Ok(id) => (
                Some(Reply::with_payload(request_type, ReplyPayload::ClientId(id))),
                ReplyTo::Client(id),
            ),
            Err(err) => {
                let result = match &err {
                    ServerError::Core(core) => ResultCode::from(core),
                    _ => ResultCode::Error,
                };
                warn!(pid = register.pid, error = %err, "registration failed");
                // The client has no slot, so answer from a throwaway socket.
                let reply = Reply::failed(request_type, result);
                match reply.encode() {
                    Ok(bytes) => {
                        if let Err(err) = client::send_once(Path::new(&register.reply_path), &bytes) {
                            debug!(error = %err, "registration failure not delivered");
                        }
                    }
                    Err(err) => debug!(error = %err, "registration failure not encoded"),
                }
                (None, ReplyTo::Nobody)
            }
        }
    }

    fn execute(&mut self, client: ClientId, command: Command) -> CoreResult<Reply> {
        let request_type = command.message_type();
        let ok = Reply::ok(request_type);
        match command {
            Command::ClientRegister(_) | Command::Debug => Err(CoreError::invariant(
                "anonymous command reached the client dispatcher",
            )),
            Command::ClientStatusGet { target } => {
                let entry = self.clients.get(target).ok_or(CoreError::NotFound)?;
                Ok(Reply::with_payload(
                    request_type,
                    ReplyPayload::ClientStatus(entry.status()),
                ))
            }
            Command::TableChangeNotify { table } => {
                self.tables.get_mut(&table)?.subscribe(client);
                debug!(client = %client, table = %table, "subscribed");
                Ok(ok)
            }
            Command::TableStatusGet { table } => {
                let status = self.tables.get_mut(&table)?.status(client);
                Ok(Reply::with_payload(request_type, ReplyPayload::TableStatus(status)))
            }
            Command::AvlTableCreate(spec) => {
                self.create_table(spec, TableKind::Avl)?;
                Ok(ok)
            }
            Command::RecordTableCreate(spec) => {
                self.create_table(spec, TableKind::Record)?;
                Ok(ok)
            }
            Command::TableDelete { table } => {
                let deleted = self.tables.delete(&table)?;
                notify(
                    &mut self.clients,
                    deleted.subscribers(),
                    table,
                    NotifyEvent::Deleted,
                    None,
                );
                Ok(ok)
            }
            Command::TableStore { table } => {
                let table = self.tables.get_mut(&table)?;
                self.store.save(table)?;
                Ok(ok)
            }
            Command::Insert { table, record } => {
                let outcome = self.tables.get_mut(&table)?.insert(&record)?;
                if outcome.purged > 0 {
                    self.notify_subscribers(table, NotifyEvent::Purged, None);
                }
                self.notify_subscribers(table, NotifyEvent::Changed, Some(client));
                Ok(ok)
            }
            Command::Delete { table, record } => {
                self.tables.get_mut(&table)?.remove(&record, Some(client))?;
                self.notify_subscribers(table, NotifyEvent::Changed, Some(client));
                Ok(ok)
            }
            Command::Set { table, record } => {
                self.tables.get_mut(&table)?.set(&record)?;
                self.notify_subscribers(table, NotifyEvent::Changed, Some(client));
                Ok(ok)
            }
            Command::FieldSet {
                table,
                offset,
                len,
                record,
            } => {
                self.tables
                    .get_mut(&table)?
                    .field_set(&record, offset as usize, len as usize)?;
                self.notify_subscribers(table, NotifyEvent::Changed, Some(client));
                Ok(ok)
            }
            Command::Get {
                table,
                flags,
                record,
            } => self.read(client, table, flags, &record, ReadKind::Exact),
            Command::GetNext {
                table,
                flags,
                record,
            } => self.read(client, table, flags, &record, ReadKind::Next),
            Command::GetNextChanged {
                table,
                flags,
                record,
            } => self.read(client, table, flags, &record, ReadKind::NextChanged),
            Command::FieldGet {
                table,
                flags,
                offset,
                len,
                record,
            } => {
                let read = self.tables.get_mut(&table)?.field_get(
                    &record,
                    offset as usize,
                    len as usize,
                    client,
                    flags.options(),
                )?;
                Ok(Reply::with_payload(request_type, ReplyPayload::Record(read)))
            }
            Command::NsfSyncEnable { role } => {
                info!(client = %client, role = role.as_str(), "nsf role requested");
                self.nsf.request_role(role);
                Ok(ok)
            }
        }
    }

    fn read(
        &mut self,
        client: ClientId,
        table: TableName,
        flags: ReadFlags,
        record: &[u8],
        kind: ReadKind,
    ) -> CoreResult<Reply> {
        let table = self.tables.get_mut(&table)?;
        let options = flags.options();
        let start = if flags.contains(ReadFlags::FROM_START) {
            None
        } else {
            Some(record)
        };
        let (read, request_type) = match kind {
            ReadKind::Exact => (table.get(record, client, options)?, MessageType::Get),
            ReadKind::Next => (table.get_next(start, client, options)?, MessageType::GetNext),
            ReadKind::NextChanged => (
                table.get_next_changed(start, client, options)?,
                MessageType::GetNextChanged,
            ),
        };
        Ok(Reply::with_payload(request_type, ReplyPayload::Record(read)))
    }

    fn create_table(&mut self, spec: TableSpec, kind: TableKind) -> CoreResult<()> {
        if spec.kind != kind {
            return Err(CoreError::invalid_argument(format!(
                "{} table requested with a {} create command",
                spec.kind.as_str(),
                kind.as_str()
            )));
        }
        let name = spec.name;
        let load = spec.flags.contains(syncdb_core::TableFlags::LOAD_FROM_FILE);
        let table = self.tables.create(spec)?;
        self.nsf.adopt_table(table);
        if load {
            if let Err(err) = self.store.load(table) {
                warn!(table = %name, error = %err, "snapshot load failed, table dropped");
                self.tables.delete(&name)?;
                return Err(err);
            }
        }
        Ok(())
    }

    fn notify_subscribers(&mut self, table: TableName, event: NotifyEvent, exclude: Option<ClientId>) {
        if let Some(found) = self.tables.find(&table) {
            notify(&mut self.clients, found.subscribers(), table, event, exclude);
        }
    }
}
