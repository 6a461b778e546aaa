//! Change notifier.

use crate::client::ClientRegistry;
use syncdb_core::{ClientId, ClientMask, TableName};
use syncdb_protocol::{Notification, NotifyEvent};
use tracing::trace;

/// Sends a wake-up for `table` to every client in `subscribers` except
/// `exclude`. Returns the number of datagrams delivered.
pub fn notify(
    clients: &mut ClientRegistry,
    subscribers: ClientMask,
    table: TableName,
    event: NotifyEvent,
    exclude: Option<ClientId>,
) -> usize {
    let targets = match exclude {
        Some(client) => subscribers.without(client),
        None => subscribers,
    };
    let notification = Notification { event, table };
    let mut delivered = 0;
    for id in targets.iter() {
        if let Some(entry) = clients.get_mut(id) {
            if entry.send_notification(&notification) {
                delivered += 1;
            }
        }
    }
    trace!(table = %table, ?event, delivered, "notified subscribers");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;
    use syncdb_protocol::RegisterRequest;
    use tempfile::tempdir;

    #[test]
    fn skips_excluded_and_unregistered_clients() {
        let dir = tempdir().unwrap();
        let mut clients = ClientRegistry::new(8);
        let mut inboxes = Vec::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let reply = dir.path().join(format!("r{i}"));
            let notify = dir.path().join(format!("n{i}"));
            inboxes.push((
                UnixDatagram::bind(&reply).unwrap(),
                UnixDatagram::bind(&notify).unwrap(),
            ));
            ids.push(
                clients
                    .register(&RegisterRequest {
                        pid: std::process::id(),
                        description: format!("c{i}"),
                        reply_path: reply.to_string_lossy().into_owned(),
                        notify_path: notify.to_string_lossy().into_owned(),
                    })
                    .unwrap(),
            );
        }
        for (_, inbox) in &inboxes {
            inbox.set_nonblocking(true).unwrap();
        }

        let mut subscribers = ClientMask::EMPTY;
        subscribers.insert(ids[0]);
        subscribers.insert(ids[1]);
        // A stale bit for a slot nobody holds.
        subscribers.insert(ClientId::new(7));

        let table = TableName::new("T").unwrap();
        let delivered = notify(&mut clients, subscribers, table, NotifyEvent::Changed, Some(ids[0]));
        assert_eq!(delivered, 1);

        let mut buf = [0u8; 64];
        assert!(inboxes[0].1.recv(&mut buf).is_err());
        let n = inboxes[1].1.recv(&mut buf).unwrap();
        assert_eq!(
            Notification::decode(&buf[..n]).unwrap(),
            Notification {
                event: NotifyEvent::Changed,
                table
            }
        );
        assert!(inboxes[2].1.recv(&mut buf).is_err());
    }
}
