//! Server context.
//!
//! [`Server`] owns every mutable collection: tables, clients, the snapshot
//! store and the NSF replicator. The event loop feeds it datagrams and timer
//! ticks; nothing else touches its state.

use crate::client::{self, ClientRegistry};
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::notify::notify;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;
use syncdb_core::{TableRegistry, TableStore};
use syncdb_nsf::{AgentTransport, NsfReplicator};
use syncdb_protocol::{NotifyEvent, NsfMessage, Reply, Request};
use tracing::{debug, error, info, warn};

/// Where a reply goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTo {
    /// The registered reply socket of a client.
    Client(syncdb_core::ClientId),
    /// A socket path that is not (yet) a registered client.
    Path(PathBuf),
    /// Nowhere; the request is dropped.
    Nobody,
}

/// Server-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    /// Commands dispatched.
    pub commands: u64,
    /// Datagrams dropped as malformed or from unknown clients.
    pub dropped: u64,
    /// Replies that could not be delivered.
    pub reply_errors: u64,
    /// Clients removed by the liveness sweep.
    pub reaped: u64,
}

/// The SyncDB server state.
pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) tables: TableRegistry,
    pub(crate) clients: ClientRegistry,
    pub(crate) store: TableStore,
    pub(crate) nsf: NsfReplicator,
    pub(crate) agent: Box<dyn AgentTransport>,
    pub(crate) stats: ServerStats,
    started: Instant,
    last_sweep: Instant,
}

impl Server {
    /// Creates a server with no tables and no clients.
    pub fn new(config: ServerConfig, agent: Box<dyn AgentTransport>) -> ServerResult<Self> {
        config.validate()?;
        let now = Instant::now();
        Ok(Self {
            tables: TableRegistry::new(),
            clients: ClientRegistry::new(config.max_clients),
            store: TableStore::new(config.persist.clone()),
            nsf: NsfReplicator::new(config.nsf.clone())?,
            agent,
            stats: ServerStats::default(),
            started: now,
            last_sweep: now,
            config,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Tables.
    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// Tables, mutably.
    pub fn tables_mut(&mut self) -> &mut TableRegistry {
        &mut self.tables
    }

    /// Registered clients.
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Replicator.
    pub fn nsf(&self) -> &NsfReplicator {
        &self.nsf
    }

    /// Counters.
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Handles one datagram from the command socket.
    ///
    /// Malformed requests are dropped. Only a fatal error is returned; every
    /// other failure becomes a result code in the reply.
    pub fn handle_datagram(&mut self, bytes: &[u8], source: Option<&Path>) -> ServerResult<()> {
        let request = match Request::decode(bytes) {
            Ok(request) => request,
            Err(err) => {
                debug!(len = bytes.len(), error = %err, "malformed request dropped");
                self.stats.dropped += 1;
                return Ok(());
            }
        };
        let (reply, to) = self.dispatch(request, source)?;
        if let Some(reply) = reply {
            self.send_reply(&reply, &to);
        }
        Ok(())
    }

    pub(crate) fn send_reply(&mut self, reply: &Reply, to: &ReplyTo) {
        let bytes = match reply.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(request = ?reply.request_type, error = %err, "reply could not be encoded");
                self.stats.reply_errors += 1;
                return;
            }
        };
        let sent = match to {
            ReplyTo::Client(id) => match self.clients.get(*id) {
                Some(entry) => entry.send_reply(&bytes),
                None => return,
            },
            ReplyTo::Path(path) => client::send_once(path, &bytes),
            ReplyTo::Nobody => return,
        };
        if let Err(err) = sent {
            warn!(to = ?to, error = %err, "reply not delivered");
            self.stats.reply_errors += 1;
        }
    }

    /// Handles one datagram from the agent socket.
    pub fn handle_agent_datagram(&mut self, bytes: &[u8], now: Instant) -> ServerResult<()> {
        let msg = match NsfMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(len = bytes.len(), error = %err, "malformed nsf message dropped");
                self.stats.dropped += 1;
                return Ok(());
            }
        };
        let changes = match self
            .nsf
            .handle_message(msg, now, &mut self.tables, self.agent.as_mut())
        {
            Ok(changes) => changes,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(error = %err, "nsf message failed");
                return Ok(());
            }
        };
        for change in changes {
            let Some(table) = self.tables.find(&change.table) else {
                continue;
            };
            let subscribers = table.subscribers();
            if change.purged {
                notify(&mut self.clients, subscribers, change.table, NotifyEvent::Purged, None);
            }
            notify(&mut self.clients, subscribers, change.table, NotifyEvent::Changed, None);
        }
        Ok(())
    }

    /// Timer driven work: NSF and, on its own cadence, the liveness sweep.
    pub fn tick(&mut self, now: Instant) -> ServerResult<()> {
        if let Err(err) = self.nsf.tick(now, &mut self.tables, self.agent.as_mut()) {
            if err.is_fatal() {
                return Err(err.into());
            }
            warn!(error = %err, "nsf tick failed");
        }
        if now.saturating_duration_since(self.last_sweep) >= self.config.liveness_interval {
            self.last_sweep = now;
            self.sweep_clients();
        }
        Ok(())
    }

    /// Unregisters every client whose process is gone.
    pub fn sweep_clients(&mut self) -> usize {
        let dead = self.clients.dead_clients();
        for &id in &dead {
            info!(client = %id, "client process gone");
            self.remove_client(id);
            self.stats.reaped += 1;
        }
        dead.len()
    }

    /// Removes a client and every trace of it in the tables.
    pub fn remove_client(&mut self, id: syncdb_core::ClientId) -> bool {
        if self.clients.unregister(id).is_none() {
            return false;
        }
        let collected: usize = self
            .tables
            .iter_mut()
            .map(|table| table.forget_client(id))
            .sum();
        if collected > 0 {
            debug!(client = %id, collected, "tombstones released by departed client");
        }
        true
    }

    /// Human-readable dump of counters, clients and tables.
    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        let registry = self.tables.stats();
        let nsf = self.nsf.stats();
        let _ = writeln!(out, "syncdb {} up {}s", syncdb_core::VERSION, self.started.elapsed().as_secs());
        let _ = writeln!(
            out,
            "commands={} dropped={} reply_errors={} reaped={}",
            self.stats.commands, self.stats.dropped, self.stats.reply_errors, self.stats.reaped
        );
        let _ = writeln!(
            out,
            "tables={} avl={} record={} capacity_bytes={}",
            registry.tables, registry.avl_tables, registry.record_tables, registry.capacity_bytes
        );
        let _ = writeln!(
            out,
            "nsf role={} tx_seq={} rx_seq={} window={} ack_pending={}",
            self.nsf.role().as_str(),
            self.nsf.tx_seq(),
            self.nsf.rx_seq(),
            self.nsf.window_len(),
            self.nsf.ack_pending()
        );
        let _ = writeln!(out, "nsf {nsf}");

        let _ = writeln!(out, "clients {}/{}", self.clients.len(), self.clients.capacity());
        for entry in self.clients.iter() {
            let status = entry.status();
            let _ = writeln!(
                out,
                "  {} pid={} \"{}\" commands={} notifications={} purges={}",
                entry.id(),
                status.pid,
                status.description,
                status.commands,
                status.notifications,
                status.purges
            );
        }

        for table in self.tables.iter() {
            let counters = table.counters();
            let _ = writeln!(
                out,
                "table {} kind={} flags={:#x} record={} key={} records={}/{} live={} subscribers={}",
                table.name(),
                table.kind().as_str(),
                table.flags().bits(),
                table.record_size(),
                table.key_size(),
                table.num_records(),
                table.spec().max_records,
                table.num_non_deleted_records(),
                table.subscribers().len()
            );
            let _ = writeln!(
                out,
                "  inserts={} updates={} deletes={} purges={} reads={}",
                counters.inserts, counters.updates, counters.deletes, counters.purges, counters.reads
            );
            for (data, deleted) in table.records() {
                let _ = writeln!(out, "  {}{}", hex(data), if deleted { " (deleted)" } else { "" });
            }
        }
        out
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().fold(String::with_capacity(data.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("tables", &self.tables.len())
            .field("clients", &self.clients.len())
            .field("nsf_role", &self.nsf.role())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use syncdb_core::{PersistConfig, TableFlags, TableName, TableSpec};
    use syncdb_nsf::RecordingTransport;
    use syncdb_protocol::NsfRole;
    use tempfile::tempdir;

    fn server(dir: &Path) -> Server {
        let config = ServerConfig::new(dir).with_persist(PersistConfig::under(dir));
        Server::new(config, Box::new(RecordingTransport::new())).unwrap()
    }

    #[test]
    fn malformed_datagrams_are_dropped() {
        let dir = tempdir().unwrap();
        let mut server = server(dir.path());
        server.handle_datagram(&[0xff, 1], None).unwrap();
        server.handle_datagram(&[], None).unwrap();
        server.handle_agent_datagram(&[1, 2, 3], Instant::now()).unwrap();
        assert_eq!(server.stats().dropped, 3);
        assert_eq!(server.stats().commands, 0);
    }

    #[test]
    fn tick_drives_role_change() {
        let dir = tempdir().unwrap();
        let mut server = server(dir.path());
        server
            .tables_mut()
            .create(
                TableSpec::avl(TableName::new("T").unwrap(), 8, 4, 4).with_flags(TableFlags::NSF),
            )
            .unwrap();
        server.nsf.request_role(NsfRole::Manager);
        server.tick(Instant::now()).unwrap();
        assert_eq!(server.nsf().role(), NsfRole::Manager);
        assert!(server.nsf().ack_pending());
    }

    #[test]
    fn debug_dump_lists_tables_and_records() {
        let dir = tempdir().unwrap();
        let mut server = server(dir.path());
        let table = server
            .tables_mut()
            .create(TableSpec::avl(TableName::new("vlan").unwrap(), 4, 2, 4))
            .unwrap();
        table.insert(&[1, 0, 0xab, 0xcd]).unwrap();

        let dump = server.debug_dump();
        assert!(dump.contains("table vlan kind=avl"));
        assert!(dump.contains("0100abcd"));
        assert!(dump.contains("nsf role=disabled"));
    }

    #[test]
    fn sweep_waits_for_liveness_interval() {
        let dir = tempdir().unwrap();
        let mut server = server(dir.path());
        let start = server.last_sweep;
        server.tick(start + Duration::from_secs(1)).unwrap();
        assert_eq!(server.last_sweep, start);
        server.tick(start + Duration::from_secs(5)).unwrap();
        assert_eq!(server.last_sweep, start + Duration::from_secs(5));
    }
}
