//! Client registry.
//!
//! Every registered process owns one slot in a bounded id space. Slots are
//! handed out by a rotating cursor so a freed id is not reused immediately.
//! Each client has two endpoints the server sends to: the reply socket and
//! the notification socket. Both are connected, non-blocking datagram
//! sockets so a slow client never stalls the server.

use crate::error::{ServerError, ServerResult};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{setsockopt, sockopt};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use syncdb_core::{ClientId, CoreError};
use syncdb_protocol::{ClientStatus, Notification, NotifyEvent, RegisterRequest, DESCRIPTION_LEN};
use tracing::{debug, info, warn};

/// A registered client.
#[derive(Debug)]
pub struct ClientEntry {
    id: ClientId,
    pid: u32,
    description: String,
    reply_path: PathBuf,
    notify_path: PathBuf,
    reply: UnixDatagram,
    notify: UnixDatagram,
    commands: u64,
    notifications: u64,
    purges: u64,
}

impl ClientEntry {
    fn open(id: ClientId, request: &RegisterRequest) -> io::Result<Self> {
        let reply = connect(Path::new(&request.reply_path))?;
        let notify = connect(Path::new(&request.notify_path))?;
        // Wake-ups are level triggered on the client side; queueing many of
        // them is pointless.
        if let Err(err) = setsockopt(&notify, sockopt::SndBuf, &1) {
            debug!(client = %id, error = %err, "could not shrink notify buffer");
        }
        let mut description = request.description.clone();
        truncate_utf8(&mut description, DESCRIPTION_LEN);
        Ok(Self {
            id,
            pid: request.pid,
            description,
            reply_path: PathBuf::from(&request.reply_path),
            notify_path: PathBuf::from(&request.notify_path),
            reply,
            notify,
            commands: 0,
            notifications: 0,
            purges: 0,
        })
    }

    /// Client id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Process id given at registration.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Description given at registration.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Status as reported to ClientStatusGet.
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            client_id: self.id,
            pid: self.pid,
            description: self.description.clone(),
            commands: self.commands,
            notifications: self.notifications,
            purges: self.purges,
        }
    }

    pub(crate) fn count_command(&mut self) {
        self.commands += 1;
    }

    /// Sends a reply datagram.
    pub fn send_reply(&self, bytes: &[u8]) -> io::Result<()> {
        self.reply.send(bytes).map(|_| ())
    }

    /// Sends a wake-up. Failures are logged and otherwise ignored.
    pub fn send_notification(&mut self, notification: &Notification) -> bool {
        match self.notify.send(&notification.encode()) {
            Ok(_) => {
                match notification.event {
                    NotifyEvent::Purged => self.purges += 1,
                    NotifyEvent::Changed | NotifyEvent::Deleted => self.notifications += 1,
                }
                true
            }
            Err(err) => {
                debug!(client = %self.id, error = %err, "notification not delivered");
                false
            }
        }
    }

    fn is_alive(&self) -> bool {
        let Ok(pid) = i32::try_from(self.pid) else {
            return false;
        };
        // EPERM means the process exists but belongs to someone else.
        !matches!(kill(Pid::from_raw(pid), None::<Signal>), Err(Errno::ESRCH))
    }

    fn unlink(&self) {
        for path in [&self.reply_path, &self.notify_path] {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %err, "could not unlink client socket");
                }
            }
        }
    }
}

fn connect(path: &Path) -> io::Result<UnixDatagram> {
    let socket = UnixDatagram::unbound()?;
    socket.connect(path)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

pub(crate) fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Sends one datagram to `path` from a throwaway socket.
pub(crate) fn send_once(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let socket = UnixDatagram::unbound()?;
    socket.set_nonblocking(true)?;
    socket.send_to(bytes, path).map(|_| ())
}

/// Registered clients indexed by id.
#[derive(Debug)]
pub struct ClientRegistry {
    slots: Vec<Option<ClientEntry>>,
    cursor: usize,
}

impl ClientRegistry {
    /// Creates a registry with `max` slots.
    pub fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
            cursor: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns true if no client is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a client and opens its endpoints.
    ///
    /// Fails with [`CoreError::MaxClients`] when every slot is taken; no state
    /// is left behind in that case.
    pub fn register(&mut self, request: &RegisterRequest) -> ServerResult<ClientId> {
        let capacity = self.slots.len();
        let Some(index) = (0..capacity)
            .map(|step| (self.cursor + step) % capacity)
            .find(|&i| self.slots[i].is_none())
        else {
            warn!(pid = request.pid, max = capacity, "client registration refused");
            return Err(CoreError::MaxClients { max: capacity }.into());
        };

        let id = ClientId::new(u16::try_from(index).map_err(|_| {
            ServerError::config(format!("client slot {index} out of range"))
        })?);
        let entry = ClientEntry::open(id, request)?;
        info!(
            client = %id,
            pid = entry.pid,
            description = %entry.description,
            "client registered"
        );
        self.slots[index] = Some(entry);
        self.cursor = (index + 1) % capacity;
        Ok(id)
    }

    /// Frees a slot, closing and unlinking the client's sockets.
    pub fn unregister(&mut self, id: ClientId) -> Option<ClientEntry> {
        let entry = self.slots.get_mut(id.index())?.take()?;
        entry.unlink();
        info!(client = %id, pid = entry.pid, "client unregistered");
        Some(entry)
    }

    /// Looks up a client.
    pub fn get(&self, id: ClientId) -> Option<&ClientEntry> {
        self.slots.get(id.index())?.as_ref()
    }

    /// Looks up a client mutably.
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientEntry> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Iterates over registered clients.
    pub fn iter(&self) -> impl Iterator<Item = &ClientEntry> {
        self.slots.iter().flatten()
    }

    /// Ids of clients whose process no longer exists.
    pub fn dead_clients(&self) -> Vec<ClientId> {
        self.iter()
            .filter(|entry| !entry.is_alive())
            .map(ClientEntry::id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    struct Endpoints {
        _dir: TempDir,
        reply: UnixDatagram,
        notify: UnixDatagram,
        request: RegisterRequest,
    }

    fn endpoints(pid: u32) -> Endpoints {
        let dir = tempdir().unwrap();
        let reply_path = dir.path().join("reply.sock");
        let notify_path = dir.path().join("notify.sock");
        let reply = UnixDatagram::bind(&reply_path).unwrap();
        let notify = UnixDatagram::bind(&notify_path).unwrap();
        Endpoints {
            request: RegisterRequest {
                pid,
                description: "test client".into(),
                reply_path: reply_path.to_string_lossy().into_owned(),
                notify_path: notify_path.to_string_lossy().into_owned(),
            },
            _dir: dir,
            reply,
            notify,
        }
    }

    #[test]
    fn ids_rotate_and_run_out() {
        let mut clients = ClientRegistry::new(2);
        let a = endpoints(std::process::id());
        let b = endpoints(std::process::id());
        let c = endpoints(std::process::id());

        let first = clients.register(&a.request).unwrap();
        let second = clients.register(&b.request).unwrap();
        assert_eq!((first.as_u16(), second.as_u16()), (0, 1));

        let err = clients.register(&c.request).unwrap_err();
        assert!(matches!(err, ServerError::Core(CoreError::MaxClients { max: 2 })));
        assert_eq!(clients.len(), 2);

        clients.unregister(first).unwrap();
        assert_eq!(clients.register(&c.request).unwrap().as_u16(), 0);
    }

    #[test]
    fn freed_slot_is_not_reused_first() {
        let mut clients = ClientRegistry::new(4);
        let a = endpoints(std::process::id());
        let b = endpoints(std::process::id());
        let first = clients.register(&a.request).unwrap();
        clients.unregister(first).unwrap();
        assert_eq!(clients.register(&b.request).unwrap().as_u16(), 1);
    }

    #[test]
    fn unregister_unlinks_sockets() {
        let mut clients = ClientRegistry::new(4);
        let a = endpoints(std::process::id());
        let id = clients.register(&a.request).unwrap();
        clients.unregister(id).unwrap();
        assert!(!Path::new(&a.request.reply_path).exists());
        assert!(!Path::new(&a.request.notify_path).exists());
        assert!(clients.get(id).is_none());
        assert!(clients.unregister(id).is_none());
    }

    #[test]
    fn endpoints_carry_replies_and_counted_notifications() {
        let mut clients = ClientRegistry::new(4);
        let a = endpoints(std::process::id());
        let id = clients.register(&a.request).unwrap();
        let entry = clients.get_mut(id).unwrap();

        entry.send_reply(b"hello").unwrap();
        let mut buf = [0u8; 64];
        let n = a.reply.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        let table = syncdb_core::TableName::new("T").unwrap();
        assert!(entry.send_notification(&Notification {
            event: NotifyEvent::Changed,
            table,
        }));
        assert!(entry.send_notification(&Notification {
            event: NotifyEvent::Purged,
            table,
        }));
        let n = a.notify.recv(&mut buf).unwrap();
        assert_eq!(Notification::decode(&buf[..n]).unwrap().event, NotifyEvent::Changed);

        let status = entry.status();
        assert_eq!(status.notifications, 1);
        assert_eq!(status.purges, 1);
        assert_eq!(status.description, "test client");
    }

    #[test]
    fn missing_endpoint_fails_registration() {
        let mut clients = ClientRegistry::new(4);
        let mut a = endpoints(std::process::id());
        a.request.notify_path = "/nonexistent/notify.sock".into();
        assert!(matches!(clients.register(&a.request), Err(ServerError::Io(_))));
        assert!(clients.is_empty());
    }

    #[test]
    fn liveness_probe_finds_dead_pids() {
        let mut clients = ClientRegistry::new(4);
        let live = endpoints(std::process::id());
        // pid_max on Linux is at most 2^22.
        let dead = endpoints(u32::MAX >> 1);
        clients.register(&live.request).unwrap();
        let dead_id = clients.register(&dead.request).unwrap();
        assert_eq!(clients.dead_clients(), vec![dead_id]);
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let mut s = "é".repeat(40);
        truncate_utf8(&mut s, DESCRIPTION_LEN);
        assert!(s.len() <= DESCRIPTION_LEN);
        assert_eq!(s.len() % 2, 0);
    }
}
