//! Replicator state machine.
//!
//! One [`NsfReplicator`] exists per server. Its role decides what it does:
//!
//! - `Manager`: every tick collects dirty NSF tables into a burst of up to
//!   `window` messages, then waits for the ACK of the last one before
//!   sending more. Lost messages are recovered by MISS or ACK-timeout
//!   retransmission of the whole window.
//! - `Backup`: applies in-order Data messages to the local registry, answers
//!   ACK requests and reports gaps with a single MISS.
//! - `Disabled`: ignores everything.
//!
//! Role changes requested through [`NsfReplicator::request_role`] take
//! effect on the next tick.

use crate::config::NsfConfig;
use crate::error::NsfResult;
use crate::transport::AgentTransport;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;
use syncdb_core::{Table, TableName, TableRegistry};
use syncdb_protocol::{NsfMessage, NsfMsgType, NsfRole};
use tracing::{debug, info, warn};

/// Replication counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NsfStats {
    /// Messages handed to the transport, retransmissions included.
    pub messages_sent: u64,
    /// IEs packed into new messages.
    pub ies_sent: u64,
    /// Messages sent again after a MISS or ACK timeout.
    pub retransmits: u64,
    /// Empty ACK-request probes.
    pub ack_requests: u64,
    /// ACKs received.
    pub acks_received: u64,
    /// MISSes received.
    pub misses_received: u64,
    /// Full resyncs started.
    pub resyncs: u64,
    /// ACKs sent.
    pub acks_sent: u64,
    /// MISSes sent.
    pub misses_sent: u64,
    /// IEs applied to local tables.
    pub ies_applied: u64,
    /// Transport failures.
    pub send_errors: u64,
}

impl fmt::Display for NsfStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} ies={} retx={} ackreq={} acks_in={} misses_in={} resyncs={} acks_out={} misses_out={} applied={} errors={}",
            self.messages_sent,
            self.ies_sent,
            self.retransmits,
            self.ack_requests,
            self.acks_received,
            self.misses_received,
            self.resyncs,
            self.acks_sent,
            self.misses_sent,
            self.ies_applied,
            self.send_errors
        )
    }
}

/// A table modified by replicated data, for change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableChange {
    /// Table name.
    pub table: TableName,
    /// A PURGE was applied.
    pub purged: bool,
}

/// NSF sender/receiver.
#[derive(Debug)]
pub struct NsfReplicator {
    pub(crate) config: NsfConfig,
    pub(crate) role: NsfRole,
    pub(crate) pending_role: Option<NsfRole>,
    pub(crate) tx_seq: u64,
    pub(crate) rx_seq: u64,
    pub(crate) window: VecDeque<NsfMessage>,
    pub(crate) ack_pending: bool,
    pub(crate) ack_expected: u64,
    pub(crate) last_tx: Option<Instant>,
    pub(crate) last_ack: Option<Instant>,
    pub(crate) resync_pending: bool,
    pub(crate) staging: BTreeMap<TableName, Vec<u8>>,
    pub(crate) miss_reported: Option<u64>,
    pub(crate) stats: NsfStats,
}

impl NsfReplicator {
    /// Creates a disabled replicator.
    pub fn new(config: NsfConfig) -> NsfResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            role: NsfRole::Disabled,
            pending_role: None,
            tx_seq: 0,
            rx_seq: 0,
            window: VecDeque::new(),
            ack_pending: false,
            ack_expected: 0,
            last_tx: None,
            last_ack: None,
            resync_pending: false,
            staging: BTreeMap::new(),
            miss_reported: None,
            stats: NsfStats::default(),
        })
    }

    /// Current role.
    pub fn role(&self) -> NsfRole {
        self.role
    }

    /// Role that takes effect on the next tick, if any.
    pub fn pending_role(&self) -> Option<NsfRole> {
        self.pending_role
    }

    /// Last sequence number sent.
    pub fn tx_seq(&self) -> u64 {
        self.tx_seq
    }

    /// Last sequence number applied.
    pub fn rx_seq(&self) -> u64 {
        self.rx_seq
    }

    /// Unacknowledged messages.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Returns true while an ACK is outstanding.
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Counters.
    pub fn stats(&self) -> NsfStats {
        self.stats
    }

    /// Configuration.
    pub fn config(&self) -> &NsfConfig {
        &self.config
    }

    /// Brings a table created after the role was applied in line with it.
    ///
    /// An NSF table created on a manager is replicated from the start, so
    /// its deletes leave tombstones until they are sent.
    pub fn adopt_table(&self, table: &mut Table) {
        table.set_replicating(self.role == NsfRole::Manager);
    }

    /// Requests a role change at the next tick.
    pub fn request_role(&mut self, role: NsfRole) {
        info!(from = self.role.as_str(), to = role.as_str(), "nsf role change requested");
        self.pending_role = Some(role);
    }

    /// Periodic driver. Applies role changes, sends dirty data and runs the
    /// idle and ACK timers.
    pub fn tick(
        &mut self,
        now: Instant,
        tables: &mut TableRegistry,
        transport: &mut dyn AgentTransport,
    ) -> NsfResult<()> {
        if let Some(role) = self.pending_role.take() {
            self.apply_role(role, now, tables, transport);
        }
        if self.role != NsfRole::Manager {
            return Ok(());
        }

        if self.resync_pending {
            self.start_stream(self.tx_seq + 1, now, tables, transport);
            return Ok(());
        }
        if self.window.is_empty() {
            return self.send_pending(now, tables, transport);
        }
        if self.elapsed(self.last_ack, now) >= self.config.ack_timeout {
            warn!(window = self.window.len(), "nsf ack timeout, retransmitting window");
            self.retransmit_window(now, transport);
            self.last_ack = Some(now);
            return Ok(());
        }
        if self.elapsed(self.last_tx, now) >= self.config.idle_interval {
            self.probe(now, transport);
        }
        Ok(())
    }

    /// Handles a message received from the agent.
    ///
    /// Returns the tables a Backup modified so the caller can notify their
    /// subscribers.
    pub fn handle_message(
        &mut self,
        msg: NsfMessage,
        now: Instant,
        tables: &mut TableRegistry,
        transport: &mut dyn AgentTransport,
    ) -> NsfResult<Vec<TableChange>> {
        match (self.role, msg.header.msg_type) {
            (NsfRole::Manager, NsfMsgType::Ack) => {
                self.on_ack(msg.seq(), now, tables, transport)?;
                Ok(Vec::new())
            }
            (NsfRole::Manager, NsfMsgType::Miss) => {
                self.on_miss(msg.seq(), now, tables, transport);
                Ok(Vec::new())
            }
            (NsfRole::Backup, NsfMsgType::Data) => self.on_data(msg, tables, transport),
            (role, msg_type) => {
                debug!(
                    role = role.as_str(),
                    ?msg_type,
                    seq = msg.seq(),
                    "nsf message ignored in this role"
                );
                Ok(Vec::new())
            }
        }
    }

    fn apply_role(
        &mut self,
        role: NsfRole,
        now: Instant,
        tables: &mut TableRegistry,
        transport: &mut dyn AgentTransport,
    ) {
        let previous = self.role;
        self.reset();
        if previous == NsfRole::Manager {
            for table in tables.iter_mut() {
                table.set_replicating(false);
            }
        }
        self.role = role;
        info!(from = previous.as_str(), to = role.as_str(), "nsf role changed");
        if role == NsfRole::Manager {
            self.start_stream(0, now, tables, transport);
        }
    }

    /// Drops every piece of stream state. Counters survive.
    pub(crate) fn reset(&mut self) {
        self.tx_seq = 0;
        self.rx_seq = 0;
        self.window.clear();
        self.ack_pending = false;
        self.ack_expected = 0;
        self.last_tx = None;
        self.last_ack = None;
        self.resync_pending = false;
        self.staging.clear();
        self.miss_reported = None;
    }

    /// Starts a new stream at `seq`: every NSF table is marked for a full
    /// resync and `first_trans` is sent and held until acknowledged.
    pub(crate) fn start_stream(
        &mut self,
        seq: u64,
        now: Instant,
        tables: &mut TableRegistry,
        transport: &mut dyn AgentTransport,
    ) {
        self.window.clear();
        self.resync_pending = false;
        for table in tables.iter_mut().filter(|t| t.is_nsf()) {
            table.set_replicating(true);
            table.mark_nsf_resync();
        }
        if seq > 0 {
            self.stats.resyncs += 1;
        }

        let msg = NsfMessage::first_trans(seq);
        self.tx_seq = seq;
        self.transmit(&msg, transport);
        self.window.push_back(msg);
        self.ack_pending = true;
        self.ack_expected = seq;
        self.last_tx = Some(now);
        self.last_ack = Some(now);
        info!(seq, "nsf stream started");
    }

    pub(crate) fn transmit(&mut self, msg: &NsfMessage, transport: &mut dyn AgentTransport) {
        match transport.send(msg) {
            Ok(()) => self.stats.messages_sent += 1,
            Err(err) => {
                self.stats.send_errors += 1;
                warn!(seq = msg.seq(), error = %err, "nsf send failed");
            }
        }
    }

    fn elapsed(&self, since: Option<Instant>, now: Instant) -> std::time::Duration {
        since.map_or(std::time::Duration::MAX, |t| now.saturating_duration_since(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;
    use syncdb_core::{TableFlags, TableSpec};

    fn nsf_registry() -> TableRegistry {
        let mut registry = TableRegistry::new();
        registry
            .create(
                TableSpec::avl(TableName::new("T").unwrap(), 8, 4, 4).with_flags(TableFlags::NSF),
            )
            .unwrap();
        registry
    }

    #[test]
    fn role_change_waits_for_tick() {
        let mut nsf = NsfReplicator::new(NsfConfig::default()).unwrap();
        let mut tables = nsf_registry();
        let mut transport = RecordingTransport::new();

        nsf.request_role(NsfRole::Manager);
        assert_eq!(nsf.role(), NsfRole::Disabled);
        assert!(transport.sent().is_empty());

        nsf.tick(Instant::now(), &mut tables, &mut transport).unwrap();
        assert_eq!(nsf.role(), NsfRole::Manager);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].header.first_trans);
        assert!(sent[0].header.ack_request);
        assert!(nsf.ack_pending());
        assert!(tables.iter().all(|t| t.is_replicating()));
    }

    #[test]
    fn disabling_resets_stream_state() {
        let mut nsf = NsfReplicator::new(NsfConfig::default()).unwrap();
        let mut tables = nsf_registry();
        let mut transport = RecordingTransport::new();
        let now = Instant::now();

        nsf.request_role(NsfRole::Manager);
        nsf.tick(now, &mut tables, &mut transport).unwrap();
        assert_eq!(nsf.window_len(), 1);

        nsf.request_role(NsfRole::Disabled);
        nsf.tick(now, &mut tables, &mut transport).unwrap();
        assert_eq!(nsf.role(), NsfRole::Disabled);
        assert_eq!(nsf.window_len(), 0);
        assert!(!nsf.ack_pending());
        assert_eq!(nsf.tx_seq(), 0);
        assert!(tables.iter().all(|t| !t.is_replicating()));
    }

    #[test]
    fn table_created_on_a_manager_is_replicated() {
        let mut nsf = NsfReplicator::new(NsfConfig::default()).unwrap();
        let mut tables = nsf_registry();
        let mut transport = RecordingTransport::new();
        let spec = TableSpec::avl(TableName::new("late").unwrap(), 8, 4, 4);

        let mut early = Table::new(spec.clone().with_flags(TableFlags::NSF)).unwrap();
        nsf.adopt_table(&mut early);
        assert!(!early.is_replicating());

        nsf.request_role(NsfRole::Manager);
        nsf.tick(Instant::now(), &mut tables, &mut transport).unwrap();
        let mut late = Table::new(spec.clone().with_flags(TableFlags::NSF)).unwrap();
        nsf.adopt_table(&mut late);
        assert!(late.is_replicating());

        let mut local = Table::new(spec).unwrap();
        nsf.adopt_table(&mut local);
        assert!(!local.is_replicating());
    }

    #[test]
    fn disabled_replicator_ignores_messages() {
        let mut nsf = NsfReplicator::new(NsfConfig::default()).unwrap();
        let mut tables = nsf_registry();
        let mut transport = RecordingTransport::new();
        let changes = nsf
            .handle_message(NsfMessage::first_trans(5), Instant::now(), &mut tables, &mut transport)
            .unwrap();
        assert!(changes.is_empty());
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn send_failures_are_counted() {
        let mut nsf = NsfReplicator::new(NsfConfig::default()).unwrap();
        let mut tables = nsf_registry();
        let mut transport = RecordingTransport::new();
        transport.set_offline(true);

        nsf.request_role(NsfRole::Manager);
        nsf.tick(Instant::now(), &mut tables, &mut transport).unwrap();
        assert_eq!(nsf.stats().send_errors, 1);
        assert_eq!(nsf.window_len(), 1);
    }
}
