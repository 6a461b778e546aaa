//! Manager/backup replication over an in-memory agent.

use std::time::{Duration, Instant};
use syncdb_core::{ClientId, ReadOptions, TableFlags, TableName, TableRegistry, TableSpec};
use syncdb_nsf::{NsfConfig, NsfReplicator, RecordingTransport};
use syncdb_protocol::{NsfMessage, NsfMsgType, NsfRole, IE_HEADER_LEN, NSF_HEADER_LEN};

const RECORD: usize = 40;
const KEY: usize = 4;

fn avl_name() -> TableName {
    TableName::new("routes").unwrap()
}

fn record_name() -> TableName {
    TableName::new("globals").unwrap()
}

fn tables() -> TableRegistry {
    let mut tables = TableRegistry::new();
    tables
        .create(TableSpec::avl(avl_name(), RECORD, KEY, 64).with_flags(TableFlags::NSF))
        .unwrap();
    tables
        .create(TableSpec::record(record_name(), 12).with_flags(TableFlags::NSF))
        .unwrap();
    tables
}

fn record(id: u32, fill: u8) -> Vec<u8> {
    let mut data = vec![fill; RECORD];
    data[..KEY].copy_from_slice(&id.to_le_bytes());
    data
}

struct Node {
    nsf: NsfReplicator,
    tables: TableRegistry,
    out: RecordingTransport,
}

impl Node {
    fn new(config: NsfConfig, role: NsfRole, now: Instant) -> Self {
        let mut node = Self {
            nsf: NsfReplicator::new(config).unwrap(),
            tables: tables(),
            out: RecordingTransport::new(),
        };
        node.nsf.request_role(role);
        node.tick(now);
        node
    }

    fn tick(&mut self, now: Instant) {
        self.nsf.tick(now, &mut self.tables, &mut self.out).unwrap();
    }

    fn deliver(&mut self, msg: NsfMessage, now: Instant) {
        self.nsf
            .handle_message(msg, now, &mut self.tables, &mut self.out)
            .unwrap();
    }

    fn live(&self, name: &TableName) -> Vec<Vec<u8>> {
        self.tables.find(name).unwrap().live_records()
    }

    /// Every node, tombstones included, with its delete-pending flag.
    fn physical(&self, name: &TableName) -> Vec<(Vec<u8>, bool)> {
        self.tables
            .find(name)
            .unwrap()
            .records()
            .map(|(data, pending)| (data.to_vec(), pending))
            .collect()
    }

    fn create(&mut self, spec: TableSpec) {
        let table = self.tables.create(spec).unwrap();
        self.nsf.adopt_table(table);
    }
}

/// Small messages so every record needs three segments.
fn segmented() -> NsfConfig {
    NsfConfig::new()
        .with_max_message_size(NSF_HEADER_LEN + IE_HEADER_LEN + 16)
        .with_window(4)
}

/// Shuttles messages both ways until both sides go quiet. `lose` picks
/// manager messages the agent drops.
fn pump(
    manager: &mut Node,
    backup: &mut Node,
    now: Instant,
    mut lose: impl FnMut(&NsfMessage) -> bool,
) {
    for _ in 0..256 {
        let down = manager.out.take();
        let up_pending = !backup.out.sent().is_empty();
        if down.is_empty() && !up_pending {
            return;
        }
        for msg in down {
            if !lose(&msg) {
                backup.deliver(msg, now);
            }
        }
        for msg in backup.out.take() {
            manager.deliver(msg, now);
        }
    }
    panic!("replication did not settle");
}

fn assert_in_sync(manager: &Node, backup: &Node) {
    assert_eq!(manager.live(&avl_name()), backup.live(&avl_name()));
    assert_eq!(manager.live(&record_name()), backup.live(&record_name()));
    assert_eq!(manager.nsf.window_len(), 0);
    assert!(!manager.nsf.ack_pending());
}

#[test]
fn backup_converges_on_manager_tables() {
    let now = Instant::now();
    let mut manager = Node::new(NsfConfig::default(), NsfRole::Manager, now);
    let mut backup = Node::new(NsfConfig::default(), NsfRole::Backup, now);
    pump(&mut manager, &mut backup, now, |_| false);

    {
        let table = manager.tables.find_mut(&avl_name()).unwrap();
        for id in 0..10 {
            table.insert(&record(id, id as u8)).unwrap();
        }
    }
    manager
        .tables
        .find_mut(&record_name())
        .unwrap()
        .set(&[7; 12])
        .unwrap();
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);
    assert_in_sync(&manager, &backup);
    assert_eq!(backup.live(&avl_name()).len(), 10);
    assert_eq!(backup.live(&record_name()), vec![vec![7; 12]]);

    {
        let table = manager.tables.find_mut(&avl_name()).unwrap();
        table.remove(&record(3, 0), None).unwrap();
        table.remove(&record(8, 0), None).unwrap();
        table.set(&record(5, 0xee)).unwrap();
    }
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);
    assert_in_sync(&manager, &backup);
    assert_eq!(backup.live(&avl_name()).len(), 8);

    // Replicated tombstones do not linger on the manager.
    let table = manager.tables.find(&avl_name()).unwrap();
    assert_eq!(table.num_records(), table.num_non_deleted_records());
}

#[test]
fn records_larger_than_a_message_are_segmented() {
    let now = Instant::now();
    let mut manager = Node::new(segmented(), NsfRole::Manager, now);
    let mut backup = Node::new(segmented(), NsfRole::Backup, now);
    pump(&mut manager, &mut backup, now, |_| false);

    {
        let table = manager.tables.find_mut(&avl_name()).unwrap();
        for id in 0..12 {
            table.insert(&record(id, 0x40 + id as u8)).unwrap();
        }
    }
    manager.tick(now);
    assert!(manager.out.sent().len() <= 4);
    assert!(manager
        .out
        .sent()
        .iter()
        .all(|m| m.encoded_len() <= segmented().max_message_size));

    pump(&mut manager, &mut backup, now, |_| false);
    assert_in_sync(&manager, &backup);
    assert_eq!(backup.live(&avl_name()).len(), 12);
}

#[test]
fn lost_message_is_recovered_with_one_miss() {
    let config = segmented();
    for position in 0..3u64 {
        let now = Instant::now();
        let mut manager = Node::new(config.clone(), NsfRole::Manager, now);
        let mut backup = Node::new(config.clone(), NsfRole::Backup, now);
        pump(&mut manager, &mut backup, now, |_| false);
        let lost_seq = manager.nsf.tx_seq() + 1 + position;

        {
            let table = manager.tables.find_mut(&avl_name()).unwrap();
            table.insert(&record(1, 0xa1)).unwrap();
            table.insert(&record(2, 0xa2)).unwrap();
        }
        manager.tick(now);
        assert_eq!(manager.out.sent().len(), 3);

        let mut dropped = false;
        pump(&mut manager, &mut backup, now, |msg| {
            let lose = !dropped && msg.seq() == lost_seq;
            dropped |= lose;
            lose
        });
        assert!(dropped);

        // Losing the last message leaves nothing for the backup to detect a
        // gap with; the idle ACK request uncovers it.
        let later = now + config.idle_interval;
        manager.tick(later);
        pump(&mut manager, &mut backup, later, |_| false);

        assert_in_sync(&manager, &backup);
        assert_eq!(backup.live(&avl_name()).len(), 2, "lost message {position}");
        assert_eq!(backup.nsf.stats().misses_sent, 1, "lost message {position}");
        assert_eq!(manager.nsf.stats().misses_received, 1, "lost message {position}");
        assert_eq!(manager.nsf.stats().retransmits, 3 - position, "lost message {position}");
        assert_eq!(manager.nsf.stats().resyncs, 0, "lost message {position}");
    }
}

#[test]
fn restarted_backup_triggers_full_resync() {
    let now = Instant::now();
    let mut manager = Node::new(NsfConfig::default(), NsfRole::Manager, now);
    let mut backup = Node::new(NsfConfig::default(), NsfRole::Backup, now);
    pump(&mut manager, &mut backup, now, |_| false);

    {
        let table = manager.tables.find_mut(&avl_name()).unwrap();
        for id in 0..5 {
            table.insert(&record(id, 1)).unwrap();
        }
    }
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);
    assert_in_sync(&manager, &backup);

    // The backup comes back empty and has seen nothing of the stream.
    let mut backup = Node::new(NsfConfig::default(), NsfRole::Backup, now);
    manager
        .tables
        .find_mut(&avl_name())
        .unwrap()
        .insert(&record(9, 9))
        .unwrap();
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);

    assert_eq!(manager.nsf.stats().resyncs, 1);
    assert_in_sync(&manager, &backup);
    assert_eq!(backup.live(&avl_name()).len(), 6);
}

#[test]
fn silent_backup_is_probed_then_window_retransmitted() {
    let start = Instant::now();
    let config = NsfConfig::new()
        .with_idle_interval(Duration::from_secs(2))
        .with_ack_timeout(Duration::from_secs(5));
    let mut manager = Node::new(config.clone(), NsfRole::Manager, start);
    let mut backup = Node::new(config, NsfRole::Backup, start);

    // The first_trans announcement is lost.
    assert_eq!(manager.out.take().len(), 1);

    manager.tick(start + Duration::from_secs(1));
    assert!(manager.out.sent().is_empty());

    manager.tick(start + Duration::from_secs(3));
    let probes = manager.out.take();
    assert_eq!(probes.len(), 1);
    assert!(probes[0].is_empty() && probes[0].header.ack_request);
    assert!(!probes[0].header.first_trans);

    let later = start + Duration::from_secs(6);
    manager.tick(later);
    let sent = manager.out.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].header.first_trans);
    assert_eq!(sent[0].header.msg_type, NsfMsgType::Data);
    assert_eq!(manager.nsf.stats().retransmits, 1);

    pump(&mut manager, &mut backup, later, |_| false);
    assert_in_sync(&manager, &backup);
}

#[test]
fn table_created_after_handshake_replicates_deletes() {
    let now = Instant::now();
    let mut manager = Node::new(NsfConfig::default(), NsfRole::Manager, now);
    let mut backup = Node::new(NsfConfig::default(), NsfRole::Backup, now);
    pump(&mut manager, &mut backup, now, |_| false);

    let late = TableName::new("late").unwrap();
    let spec = TableSpec::avl(late, RECORD, KEY, 8).with_flags(TableFlags::NSF);
    manager.create(spec.clone());
    backup.create(spec);

    manager.tables.find_mut(&late).unwrap().insert(&record(1, 1)).unwrap();
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);
    assert_eq!(backup.live(&late), vec![record(1, 1)]);

    manager
        .tables
        .find_mut(&late)
        .unwrap()
        .remove(&record(1, 0), None)
        .unwrap();
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);

    assert!(backup.live(&late).is_empty());
    assert_eq!(manager.physical(&late), backup.physical(&late));
    assert!(manager.physical(&late).is_empty());
}

#[test]
fn tombstones_are_mirrored_while_the_manager_holds_them() {
    let now = Instant::now();
    let reader = ClientId::new(5);
    let mut manager = Node::new(NsfConfig::default(), NsfRole::Manager, now);
    let mut backup = Node::new(NsfConfig::default(), NsfRole::Backup, now);
    pump(&mut manager, &mut backup, now, |_| false);

    {
        let table = manager.tables.find_mut(&avl_name()).unwrap();
        table.subscribe(reader);
        table.insert(&record(1, 0x11)).unwrap();
        table.insert(&record(2, 0x22)).unwrap();
    }
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);

    manager
        .tables
        .find_mut(&avl_name())
        .unwrap()
        .remove(&record(1, 0), None)
        .unwrap();
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);

    let expected = vec![(record(1, 0x11), true), (record(2, 0x22), false)];
    assert_eq!(manager.physical(&avl_name()), expected);
    assert_eq!(backup.physical(&avl_name()), expected);

    // Once the reader has seen the delete the manager erases the node and
    // the backup follows.
    let read = manager
        .tables
        .find_mut(&avl_name())
        .unwrap()
        .get(&record(1, 0), reader, ReadOptions::CONSUME)
        .unwrap();
    assert!(read.delete_pending);
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);

    let expected = vec![(record(2, 0x22), false)];
    assert_eq!(manager.physical(&avl_name()), expected);
    assert_eq!(backup.physical(&avl_name()), expected);
}

#[test]
fn tombstones_reach_an_empty_backup_on_resync() {
    let now = Instant::now();
    let reader = ClientId::new(3);
    let mut manager = Node::new(NsfConfig::default(), NsfRole::Disabled, now);
    {
        let table = manager.tables.find_mut(&avl_name()).unwrap();
        table.subscribe(reader);
        for id in 0..4 {
            table.insert(&record(id, id as u8)).unwrap();
        }
        table.remove(&record(2, 0), None).unwrap();
    }

    let mut backup = Node::new(NsfConfig::default(), NsfRole::Backup, now);
    manager.nsf.request_role(NsfRole::Manager);
    manager.tick(now);
    pump(&mut manager, &mut backup, now, |_| false);

    assert_in_sync(&manager, &backup);
    assert_eq!(manager.physical(&avl_name()), backup.physical(&avl_name()));
    assert_eq!(backup.physical(&avl_name()).len(), 4);
    assert_eq!(backup.live(&avl_name()).len(), 3);
}
