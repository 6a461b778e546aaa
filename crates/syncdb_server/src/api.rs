//! Blocking client library.
//!
//! [`SyncDbClient`] binds its reply and notification sockets, registers with
//! the server and then issues one command at a time, waiting for each reply.
//!
//! ```rust,ignore
//! use syncdb_server::SyncDbClient;
//!
//! let client = SyncDbClient::connect("/run/syncdb/syncdb.sock", "/tmp", "route-daemon")?;
//! client.subscribe(table)?;
//! client.insert(table, &record)?;
//! ```

use crate::error::{ServerError, ServerResult};
use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use syncdb_core::{ClientId, RecordRead, TableName, TableSpec, TableStatus};
use syncdb_protocol::{
    ClientStatus, Command, MessageType, Notification, NsfRole, ReadFlags, RegisterRequest, Reply,
    ReplyPayload, Request, ResultCode, MAX_DATAGRAM,
};
use tracing::debug;

/// Default time to wait for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

static ENDPOINT_SEQ: AtomicU32 = AtomicU32::new(0);

/// A bound endpoint socket, unlinked on drop.
#[derive(Debug)]
struct Endpoint {
    path: PathBuf,
    socket: UnixDatagram,
}

impl Endpoint {
    fn bind(dir: &Path, suffix: &str) -> io::Result<Self> {
        let seq = ENDPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("syncdb-{}-{seq}.{suffix}", std::process::id()));
        // A previous process with the same pid may have left it behind.
        let _ = fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)?;
        Ok(Self { path, socket })
    }

    fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %err, "could not unlink endpoint");
            }
        }
    }
}

fn exchange(
    socket: &UnixDatagram,
    server: &Path,
    request: &Request,
    timeout: Duration,
) -> ServerResult<Reply> {
    let bytes = request.encode()?;
    socket.send_to(&bytes, server)?;
    socket.set_read_timeout(Some(timeout))?;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let len = socket.recv(&mut buf)?;
    let reply = Reply::decode(&buf[..len])?;
    let expected = request.command.message_type();
    if reply.request_type != expected {
        return Err(ServerError::UnexpectedReply(format!(
            "{:?} reply to a {expected:?} request",
            reply.request_type
        )));
    }
    Ok(reply)
}

fn check(reply: Reply) -> ServerResult<ReplyPayload> {
    if reply.result != ResultCode::Ok {
        return Err(ServerError::Rejected {
            request: reply.request_type,
            result: reply.result,
        });
    }
    Ok(reply.payload)
}

fn unexpected(request: MessageType, payload: &ReplyPayload) -> ServerError {
    ServerError::UnexpectedReply(format!("{request:?} answered with {payload:?}"))
}

/// A registered connection to a SyncDB server.
#[derive(Debug)]
pub struct SyncDbClient {
    id: ClientId,
    server: PathBuf,
    timeout: Duration,
    reply: Endpoint,
    notify: Endpoint,
}

impl SyncDbClient {
    /// Binds endpoints in `endpoint_dir` and registers with the server
    /// listening on `server`.
    pub fn connect(
        server: impl Into<PathBuf>,
        endpoint_dir: impl AsRef<Path>,
        description: &str,
    ) -> ServerResult<Self> {
        let server = server.into();
        let dir = endpoint_dir.as_ref();
        let reply = Endpoint::bind(dir, "reply")?;
        let notify = Endpoint::bind(dir, "notify")?;

        let register = Command::ClientRegister(RegisterRequest {
            pid: std::process::id(),
            description: description.to_string(),
            reply_path: reply.path_string(),
            notify_path: notify.path_string(),
        });
        let request = Request::new(ClientId::new(0), register);
        let payload = check(exchange(&reply.socket, &server, &request, DEFAULT_REPLY_TIMEOUT)?)?;
        let ReplyPayload::ClientId(id) = payload else {
            return Err(unexpected(MessageType::ClientRegister, &payload));
        };
        debug!(client = %id, server = %server.display(), "registered");
        Ok(Self {
            id,
            server,
            timeout: DEFAULT_REPLY_TIMEOUT,
            reply,
            notify,
        })
    }

    /// Asks an unregistered server socket for its state dump.
    pub fn debug_dump(server: impl AsRef<Path>, endpoint_dir: impl AsRef<Path>) -> ServerResult<String> {
        let endpoint = Endpoint::bind(endpoint_dir.as_ref(), "debug")?;
        let request = Request::new(ClientId::new(0), Command::Debug);
        let reply = exchange(&endpoint.socket, server.as_ref(), &request, DEFAULT_REPLY_TIMEOUT)?;
        match check(reply)? {
            ReplyPayload::Text(text) => Ok(text),
            payload => Err(unexpected(MessageType::Debug, &payload)),
        }
    }

    /// Sets the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Id assigned by the server.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Sends a command and returns the raw reply, whatever its result code.
    pub fn request(&self, command: Command) -> ServerResult<Reply> {
        let request = Request::new(self.id, command);
        exchange(&self.reply.socket, &self.server, &request, self.timeout)
    }

    fn call(&self, command: Command) -> ServerResult<ReplyPayload> {
        check(self.request(command)?)
    }

    fn call_ok(&self, command: Command) -> ServerResult<()> {
        self.call(command).map(|_| ())
    }

    fn call_record(&self, command: Command) -> ServerResult<RecordRead> {
        let request = command.message_type();
        match self.call(command)? {
            ReplyPayload::Record(read) => Ok(read),
            payload => Err(unexpected(request, &payload)),
        }
    }

    /// Creates an AVL table.
    pub fn create_avl_table(&self, spec: TableSpec) -> ServerResult<()> {
        self.call_ok(Command::AvlTableCreate(spec))
    }

    /// Creates a Record table.
    pub fn create_record_table(&self, spec: TableSpec) -> ServerResult<()> {
        self.call_ok(Command::RecordTableCreate(spec))
    }

    /// Deletes a table.
    pub fn delete_table(&self, table: TableName) -> ServerResult<()> {
        self.call_ok(Command::TableDelete { table })
    }

    /// Writes a storable table to its snapshot file.
    pub fn store_table(&self, table: TableName) -> ServerResult<()> {
        self.call_ok(Command::TableStore { table })
    }

    /// Subscribes to change notifications for a table.
    pub fn subscribe(&self, table: TableName) -> ServerResult<()> {
        self.call_ok(Command::TableChangeNotify { table })
    }

    /// Reads and clears this client's pending events for a table.
    pub fn table_status(&self, table: TableName) -> ServerResult<TableStatus> {
        match self.call(Command::TableStatusGet { table })? {
            ReplyPayload::TableStatus(status) => Ok(status),
            payload => Err(unexpected(MessageType::TableStatusGet, &payload)),
        }
    }

    /// Describes any registered client.
    pub fn client_status(&self, target: ClientId) -> ServerResult<ClientStatus> {
        match self.call(Command::ClientStatusGet { target })? {
            ReplyPayload::ClientStatus(status) => Ok(status),
            payload => Err(unexpected(MessageType::ClientStatusGet, &payload)),
        }
    }

    /// Inserts or overwrites a record.
    pub fn insert(&self, table: TableName, record: &[u8]) -> ServerResult<()> {
        self.call_ok(Command::Insert {
            table,
            record: record.to_vec(),
        })
    }

    /// Deletes the record with the key of `record`.
    pub fn delete(&self, table: TableName, record: &[u8]) -> ServerResult<()> {
        self.call_ok(Command::Delete {
            table,
            record: record.to_vec(),
        })
    }

    /// Replaces an existing record.
    pub fn set(&self, table: TableName, record: &[u8]) -> ServerResult<()> {
        self.call_ok(Command::Set {
            table,
            record: record.to_vec(),
        })
    }

    /// Copies `record[offset..offset + len]` into the stored record.
    pub fn field_set(&self, table: TableName, offset: u32, len: u32, record: &[u8]) -> ServerResult<()> {
        self.call_ok(Command::FieldSet {
            table,
            offset,
            len,
            record: record.to_vec(),
        })
    }

    /// Reads the record with the key of `record`.
    pub fn get(&self, table: TableName, record: &[u8], flags: ReadFlags) -> ServerResult<RecordRead> {
        self.call_record(Command::Get {
            table,
            flags,
            record: record.to_vec(),
        })
    }

    /// Reads a window of a record; the rest of the returned buffer is zero.
    pub fn field_get(
        &self,
        table: TableName,
        offset: u32,
        len: u32,
        record: &[u8],
        flags: ReadFlags,
    ) -> ServerResult<RecordRead> {
        self.call_record(Command::FieldGet {
            table,
            flags,
            offset,
            len,
            record: record.to_vec(),
        })
    }

    /// Reads the record after `after`, or the first record when `None`.
    pub fn get_next(
        &self,
        table: TableName,
        after: Option<&[u8]>,
        flags: ReadFlags,
    ) -> ServerResult<RecordRead> {
        let (flags, record) = next_args(after, flags);
        self.call_record(Command::GetNext {
            table,
            flags,
            record,
        })
    }

    /// Like [`SyncDbClient::get_next`] but only returns records this client
    /// has not seen.
    pub fn get_next_changed(
        &self,
        table: TableName,
        after: Option<&[u8]>,
        flags: ReadFlags,
    ) -> ServerResult<RecordRead> {
        let (flags, record) = next_args(after, flags);
        self.call_record(Command::GetNextChanged {
            table,
            flags,
            record,
        })
    }

    /// Asks the server to change its NSF role.
    pub fn nsf_enable(&self, role: NsfRole) -> ServerResult<()> {
        self.call_ok(Command::NsfSyncEnable { role })
    }

    /// Fetches the state dump through this client's reply socket.
    pub fn debug(&self) -> ServerResult<String> {
        match self.call(Command::Debug)? {
            ReplyPayload::Text(text) => Ok(text),
            payload => Err(unexpected(MessageType::Debug, &payload)),
        }
    }

    /// Waits up to `timeout` for a wake-up. Returns `None` on timeout.
    pub fn next_notification(&self, timeout: Duration) -> ServerResult<Option<Notification>> {
        self.notify.socket.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 64];
        match self.notify.socket.recv(&mut buf) {
            Ok(len) => Ok(Some(Notification::decode(&buf[..len])?)),
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn next_args(after: Option<&[u8]>, flags: ReadFlags) -> (ReadFlags, Vec<u8>) {
    match after {
        Some(record) => (flags, record.to_vec()),
        None => (flags.with(ReadFlags::FROM_START), Vec::new()),
    }
}
