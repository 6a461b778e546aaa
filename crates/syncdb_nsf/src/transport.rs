//! Agent transport abstraction.
//!
//! The replicator never touches sockets directly. It hands finished messages
//! to an [`AgentTransport`]; the server wires in [`UnixAgentTransport`],
//! tests use [`RecordingTransport`].

use crate::error::NsfResult;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use syncdb_protocol::NsfMessage;

/// Outbound path to the SyncDB agent.
pub trait AgentTransport: Send {
    /// Sends one message. Delivery is best effort.
    fn send(&mut self, msg: &NsfMessage) -> NsfResult<()>;
}

/// Sends encoded messages to the agent's datagram socket.
#[derive(Debug)]
pub struct UnixAgentTransport {
    socket: UnixDatagram,
    peer: PathBuf,
}

impl UnixAgentTransport {
    /// Creates an unbound, non-blocking sender for `peer`.
    pub fn new(peer: impl Into<PathBuf>) -> NsfResult<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer: peer.into(),
        })
    }

    /// Returns the agent socket path.
    pub fn peer(&self) -> &Path {
        &self.peer
    }
}

impl AgentTransport for UnixAgentTransport {
    fn send(&mut self, msg: &NsfMessage) -> NsfResult<()> {
        let bytes = msg.encode()?;
        self.socket.send_to(&bytes, &self.peer)?;
        Ok(())
    }
}

/// A transport that keeps every message for later inspection.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Vec<NsfMessage>,
    offline: bool,
}

impl RecordingTransport {
    /// Creates a new recording transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Messages sent so far.
    pub fn sent(&self) -> &[NsfMessage] {
        &self.sent
    }

    /// Removes and returns every recorded message.
    pub fn take(&mut self) -> Vec<NsfMessage> {
        std::mem::take(&mut self.sent)
    }
}

impl AgentTransport for RecordingTransport {
    fn send(&mut self, msg: &NsfMessage) -> NsfResult<()> {
        if self.offline {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "agent offline").into());
        }
        // Round-trip through the codec so tests exercise the wire format.
        let decoded = NsfMessage::decode(&msg.encode()?)?;
        self.sent.push(decoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn recording_transport_records_and_fails_offline() {
        let mut transport = RecordingTransport::new();
        transport.send(&NsfMessage::ack(3)).unwrap();
        assert_eq!(transport.sent().len(), 1);

        transport.set_offline(true);
        assert!(transport.send(&NsfMessage::ack(4)).is_err());
        assert_eq!(transport.take(), vec![NsfMessage::ack(3)]);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn unix_transport_delivers_datagrams() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let agent = UnixDatagram::bind(&path).unwrap();

        let mut transport = UnixAgentTransport::new(&path).unwrap();
        transport.send(&NsfMessage::miss(11)).unwrap();

        let mut buf = [0u8; 64];
        let n = agent.recv(&mut buf).unwrap();
        assert_eq!(NsfMessage::decode(&buf[..n]).unwrap(), NsfMessage::miss(11));
    }

    #[test]
    fn unix_transport_reports_missing_peer() {
        let dir = tempdir().unwrap();
        let mut transport = UnixAgentTransport::new(dir.path().join("absent.sock")).unwrap();
        assert!(transport.send(&NsfMessage::ack(1)).is_err());
    }
}
