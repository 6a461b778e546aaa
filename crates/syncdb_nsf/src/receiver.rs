//! Backup side: applying Data messages in sequence order.

use crate::error::NsfResult;
use crate::state::{NsfReplicator, TableChange};
use crate::transport::AgentTransport;
use syncdb_core::{CoreError, TableName, TableRegistry};
use syncdb_protocol::{IeCommand, InfoElement, NsfMessage};
use tracing::{debug, info, warn};

impl NsfReplicator {
    pub(crate) fn on_data(
        &mut self,
        msg: NsfMessage,
        tables: &mut TableRegistry,
        transport: &mut dyn AgentTransport,
    ) -> NsfResult<Vec<TableChange>> {
        let seq = msg.seq();
        if msg.header.first_trans {
            info!(seq, "nsf stream started by manager");
            self.rx_seq = seq;
            self.staging.clear();
            self.miss_reported = None;
            self.send_ack(transport);
            return Ok(Vec::new());
        }

        if seq <= self.rx_seq {
            debug!(seq, rx_seq = self.rx_seq, "nsf duplicate ignored");
            if msg.header.ack_request {
                self.send_ack(transport);
            }
            return Ok(Vec::new());
        }

        // An empty message at seq only asks whether everything up to seq
        // arrived; a data message must be the very next one.
        let gap = if msg.is_empty() {
            seq > self.rx_seq
        } else {
            seq > self.rx_seq + 1
        };
        if gap && (!msg.is_empty() || msg.header.ack_request) {
            if self.miss_reported != Some(self.rx_seq) {
                warn!(seq, rx_seq = self.rx_seq, "nsf gap detected");
                self.miss_reported = Some(self.rx_seq);
                self.stats.misses_sent += 1;
                self.transmit(&NsfMessage::miss(self.rx_seq), transport);
            }
            return Ok(Vec::new());
        }
        if msg.is_empty() {
            return Ok(Vec::new());
        }

        let mut changes: Vec<TableChange> = Vec::new();
        for ie in &msg.ies {
            if let Some(change) = self.apply(ie, tables)? {
                match changes.iter_mut().find(|c| c.table == change.table) {
                    Some(existing) => existing.purged |= change.purged,
                    None => changes.push(change),
                }
            }
        }
        self.rx_seq = seq;
        self.miss_reported = None;
        if msg.header.ack_request {
            self.send_ack(transport);
        }
        Ok(changes)
    }

    fn send_ack(&mut self, transport: &mut dyn AgentTransport) {
        self.stats.acks_sent += 1;
        self.transmit(&NsfMessage::ack(self.rx_seq), transport);
    }

    /// Applies one IE. Errors the table rejects are logged and skipped;
    /// only fatal ones abort.
    fn apply(
        &mut self,
        ie: &InfoElement,
        tables: &mut TableRegistry,
    ) -> NsfResult<Option<TableChange>> {
        let Some(name) = ie.table else {
            return Ok(None);
        };
        match self.apply_to_table(name, ie, tables) {
            Ok(change) => {
                self.stats.ies_applied += 1;
                Ok(change)
            }
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                warn!(table = %name, cmd = ?ie.cmd, error = %err, "nsf IE rejected");
                Ok(None)
            }
        }
    }

    fn apply_to_table(
        &mut self,
        name: TableName,
        ie: &InfoElement,
        tables: &mut TableRegistry,
    ) -> Result<Option<TableChange>, CoreError> {
        let Some(table) = tables.find_mut(&name) else {
            debug!(table = %name, "nsf IE for unknown table skipped");
            return Ok(None);
        };
        let changed = |purged| Some(TableChange { table: name, purged });

        match ie.cmd {
            IeCommand::Noop => Ok(None),
            IeCommand::Purge => {
                let purged = table.purge_deleted();
                Ok((purged > 0).then(|| TableChange { table: name, purged: true }))
            }
            IeCommand::Delete if ie.is_tombstone() => {
                let deleted = table.hold_tombstone(&ie.payload)?;
                Ok(if deleted { changed(false) } else { None })
            }
            IeCommand::Delete => {
                let removed = table.delete_key_if_present(&ie.payload)?;
                Ok(if removed { changed(false) } else { None })
            }
            IeCommand::Set => {
                let size = table.record_size();
                let start = ie.record_offset as usize;
                let end = start + ie.payload.len();
                if end > size {
                    self.staging.remove(&name);
                    return Err(CoreError::SizeMismatch {
                        expected: size,
                        actual: end,
                    });
                }
                if ie.first_seg {
                    self.staging.insert(name, vec![0; size]);
                }
                let Some(buffer) = self.staging.get_mut(&name) else {
                    return Err(CoreError::invalid_argument("segment without a first segment"));
                };
                buffer[start..end].copy_from_slice(&ie.payload);
                if !ie.last_seg {
                    return Ok(None);
                }
                let record = self.staging.remove(&name).unwrap_or_default();
                table.put_record(&record)?;
                Ok(changed(false))
            }
        }
    }
}
