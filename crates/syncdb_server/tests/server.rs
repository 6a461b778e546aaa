//! End-to-end tests: a running server driven through the client library.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use syncdb_core::{PersistConfig, TableFlags, TableName, TableSpec};
use syncdb_nsf::NsfConfig;
use syncdb_protocol::{Notification, NotifyEvent, NsfRole, ReadFlags, ResultCode};
use syncdb_server::{Daemon, ServerConfig, ServerError, ServerHandle, SyncDbClient, AGENT_SOCKET};
use tempfile::{tempdir, TempDir};

const QUIET: Duration = Duration::from_millis(100);
const WAIT: Duration = Duration::from_secs(2);

struct Node {
    handle: Option<ServerHandle>,
    socket: PathBuf,
    endpoints: PathBuf,
}

impl Node {
    fn start(config: ServerConfig, endpoints: &Path) -> Self {
        std::fs::create_dir_all(endpoints).unwrap();
        let socket = config.command_socket.clone();
        let handle = Daemon::bind(config).unwrap().spawn().unwrap();
        Self {
            handle: Some(handle),
            socket,
            endpoints: endpoints.to_path_buf(),
        }
    }

    fn client(&self, name: &str) -> SyncDbClient {
        SyncDbClient::connect(&self.socket, &self.endpoints, name).unwrap()
    }

    fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().unwrap();
        }
    }
}

fn config(root: &Path) -> ServerConfig {
    ServerConfig::new(root.join("run")).with_persist(PersistConfig::under(root.join("store")))
}

fn single(dir: &TempDir) -> Node {
    Node::start(config(dir.path()), &dir.path().join("clients"))
}

fn table(name: &str) -> TableName {
    TableName::new(name).unwrap()
}

fn rec(key: u32, value: u32) -> Vec<u8> {
    let mut r = key.to_le_bytes().to_vec();
    r.extend_from_slice(&value.to_le_bytes());
    r
}

fn code(result: Result<(), ServerError>) -> ResultCode {
    match result {
        Ok(()) => ResultCode::Ok,
        Err(err) => err.result_code().unwrap_or_else(|| panic!("transport failure: {err}")),
    }
}

fn live_records(client: &SyncDbClient, name: TableName) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut after: Option<Vec<u8>> = None;
    loop {
        match client.get_next(name, after.as_deref(), ReadFlags::PRESERVE) {
            Ok(read) => {
                if !read.delete_pending {
                    out.push(read.data.clone());
                }
                after = Some(read.data);
            }
            Err(err) if err.result_code() == Some(ResultCode::NotFound) => return out,
            Err(err) => panic!("enumeration failed: {err}"),
        }
    }
}

#[test]
fn capacity_limits_over_the_wire() {
    let dir = tempdir().unwrap();
    let node = single(&dir);
    let a = node.client("a");
    let t = table("T");

    a.create_avl_table(TableSpec::avl(t, 8, 4, 2)).unwrap();
    assert_eq!(code(a.insert(t, &rec(1, 10))), ResultCode::Ok);
    assert_eq!(code(a.insert(t, &rec(2, 20))), ResultCode::Ok);
    assert_eq!(code(a.insert(t, &rec(3, 30))), ResultCode::Full);
    assert_eq!(code(a.delete(t, &rec(1, 0))), ResultCode::Ok);
    assert_eq!(a.table_status(t).unwrap().num_non_deleted_records, 1);
    assert_eq!(code(a.insert(t, &rec(3, 30))), ResultCode::Ok);

    let read = a.get(t, &rec(3, 0), ReadFlags::NONE).unwrap();
    assert_eq!(read.data, rec(3, 30));
    node.stop();
}

#[test]
fn writer_is_not_woken_by_its_own_change() {
    let dir = tempdir().unwrap();
    let node = single(&dir);
    let a = node.client("a");
    let b = node.client("b");
    let t = table("T");

    a.create_avl_table(TableSpec::avl(t, 8, 4, 16)).unwrap();
    a.subscribe(t).unwrap();
    b.subscribe(t).unwrap();
    a.insert(t, &rec(1, 1)).unwrap();

    assert_eq!(
        b.next_notification(WAIT).unwrap(),
        Some(Notification {
            event: NotifyEvent::Changed,
            table: t
        })
    );
    assert_eq!(b.next_notification(QUIET).unwrap(), None);
    assert_eq!(a.next_notification(QUIET).unwrap(), None);

    let changed = b.get_next_changed(t, None, ReadFlags::NONE).unwrap();
    assert_eq!(changed.data, rec(1, 1));
    assert_eq!(
        b.get_next_changed(t, None, ReadFlags::NONE)
            .unwrap_err()
            .result_code(),
        Some(ResultCode::NotFound)
    );
    node.stop();
}

#[test]
fn record_tables_and_field_access() {
    let dir = tempdir().unwrap();
    let node = single(&dir);
    let a = node.client("a");
    let t = table("globals");

    a.create_record_table(TableSpec::record(t, 8)).unwrap();
    a.set(t, &rec(7, 70)).unwrap();
    a.field_set(t, 4, 4, &rec(0, 99)).unwrap();

    let read = a.get(t, &[0; 8], ReadFlags::NONE).unwrap();
    assert_eq!(read.data, rec(7, 99));
    let field = a.field_get(t, 0, 4, &[0; 8], ReadFlags::NONE).unwrap();
    assert_eq!(field.data, rec(7, 0));

    assert_eq!(code(a.insert(t, &rec(1, 1))), ResultCode::Error);
    assert_eq!(code(a.set(t, &[0; 3])), ResultCode::SizeMismatch);
    node.stop();
}

#[test]
fn deleting_a_table_wakes_subscribers() {
    let dir = tempdir().unwrap();
    let node = single(&dir);
    let a = node.client("a");
    let t = table("T");

    a.create_avl_table(TableSpec::avl(t, 8, 4, 4)).unwrap();
    a.subscribe(t).unwrap();
    a.delete_table(t).unwrap();

    let woken = a.next_notification(WAIT).unwrap().unwrap();
    assert_eq!(woken.event, NotifyEvent::Deleted);
    assert_eq!(code(a.insert(t, &rec(1, 1))), ResultCode::NoTable);
    node.stop();
}

#[test]
fn stored_table_survives_restart() {
    let dir = tempdir().unwrap();
    let t = table("vlans");
    let flags = TableFlags::STORABLE | TableFlags::LOAD_FROM_FILE;

    let node = single(&dir);
    let a = node.client("a");
    a.create_avl_table(TableSpec::avl(t, 8, 4, 8).with_flags(flags))
        .unwrap();
    for key in 1..=3 {
        a.insert(t, &rec(key, key * 100)).unwrap();
    }
    a.delete(t, &rec(2, 0)).unwrap();
    a.store_table(t).unwrap();
    drop(a);
    node.stop();

    let node = single(&dir);
    let b = node.client("b");
    b.create_avl_table(TableSpec::avl(t, 8, 4, 8).with_flags(flags))
        .unwrap();
    assert_eq!(live_records(&b, t), vec![rec(1, 100), rec(3, 300)]);
    node.stop();
}

#[test]
fn registration_is_refused_when_slots_run_out() {
    let dir = tempdir().unwrap();
    let node = Node::start(
        config(dir.path()).with_max_clients(2),
        &dir.path().join("clients"),
    );
    let _a = node.client("a");
    let b = node.client("b");

    let err = SyncDbClient::connect(&node.socket, &node.endpoints, "c").unwrap_err();
    assert_eq!(err.result_code(), Some(ResultCode::MaxClients));

    let status = b.client_status(b.id()).unwrap();
    assert_eq!(status.description, "b");
    assert_eq!(status.pid, std::process::id());
    node.stop();
}

#[test]
fn anonymous_debug_dump_and_garbage_input() {
    let dir = tempdir().unwrap();
    let node = single(&dir);
    let a = node.client("a");
    a.create_avl_table(TableSpec::avl(table("T"), 8, 4, 4))
        .unwrap();

    // Garbage is dropped without an answer; the server keeps serving.
    let junk = UnixDatagram::unbound().unwrap();
    junk.send_to(&[0xee, 0, 0, 1], &node.socket).unwrap();

    let dump = SyncDbClient::debug_dump(&node.socket, &node.endpoints).unwrap();
    assert!(dump.contains("table T kind=avl"), "{dump}");
    assert!(dump.contains("dropped=1"), "{dump}");
    assert!(a.debug().unwrap().contains("clients 1/"));
    node.stop();
}

#[test]
fn manager_replicates_to_backup() {
    let dir = tempdir().unwrap();
    let root_a = dir.path().join("a");
    let root_b = dir.path().join("b");
    let nsf = NsfConfig::new()
        .with_idle_interval(Duration::from_millis(50))
        .with_ack_timeout(Duration::from_millis(200));
    let tuned = |own: &Path, peer: &Path| {
        config(own)
            .with_agent_peer(peer.join("run").join(AGENT_SOCKET))
            .with_tick_interval(Duration::from_millis(20))
            .with_nsf(nsf.clone())
    };
    let manager = Node::start(tuned(&root_a, &root_b), &root_a.join("clients"));
    let backup = Node::start(tuned(&root_b, &root_a), &root_b.join("clients"));

    let t = table("routes");
    let spec = TableSpec::avl(t, 8, 4, 32).with_flags(TableFlags::NSF);
    let m = manager.client("m");
    let b = backup.client("b");
    m.create_avl_table(spec.clone()).unwrap();
    b.create_avl_table(spec).unwrap();
    b.subscribe(t).unwrap();

    b.nsf_enable(NsfRole::Backup).unwrap();
    m.nsf_enable(NsfRole::Manager).unwrap();
    for key in 1..=5 {
        m.insert(t, &rec(key, key)).unwrap();
    }
    m.delete(t, &rec(3, 0)).unwrap();
    m.set(t, &rec(5, 500)).unwrap();

    let expected = vec![rec(1, 1), rec(2, 2), rec(4, 4), rec(5, 500)];
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut replicated = live_records(&b, t);
    while replicated != expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
        replicated = live_records(&b, t);
    }
    assert_eq!(replicated, expected);

    let woken = b.next_notification(WAIT).unwrap().unwrap();
    assert_eq!(woken.table, t);
    assert!(SyncDbClient::debug_dump(&manager.socket, &manager.endpoints)
        .unwrap()
        .contains("nsf role=manager"));

    drop((m, b));
    manager.stop();
    backup.stop();
}
