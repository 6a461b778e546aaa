//! Manager side: packing dirty tables into bursts, ACK and MISS handling.

use crate::error::NsfResult;
use crate::state::NsfReplicator;
use crate::transport::AgentTransport;
use std::time::Instant;
use syncdb_core::{TableKind, TableName, TableRegistry};
use syncdb_protocol::{InfoElement, NsfMessage, IE_HEADER_LEN, NSF_HEADER_LEN};
use tracing::{debug, warn};

/// Accumulates IEs into at most `max_messages` messages of at most
/// `max_size` bytes. The last message is always the open one.
#[derive(Debug)]
pub(crate) struct Packer {
    max_size: usize,
    max_messages: usize,
    messages: Vec<NsfMessage>,
    open_len: usize,
    ies: u64,
}

impl Packer {
    pub(crate) fn new(max_size: usize, max_messages: usize) -> Self {
        Self {
            max_size,
            max_messages,
            messages: vec![NsfMessage::data(0)],
            open_len: NSF_HEADER_LEN,
            ies: 0,
        }
    }

    fn room(&self) -> usize {
        self.max_size.saturating_sub(self.open_len)
    }

    fn open(&mut self) -> &mut NsfMessage {
        let last = self.messages.len() - 1;
        &mut self.messages[last]
    }

    /// Starts a new message. False if the window is exhausted.
    fn roll(&mut self) -> bool {
        if self.messages.len() >= self.max_messages {
            return false;
        }
        self.messages.push(NsfMessage::data(0));
        self.open_len = NSF_HEADER_LEN;
        true
    }

    fn append(&mut self, ie: InfoElement) {
        self.open_len += ie.encoded_len();
        self.ies += 1;
        self.open().ies.push(ie);
    }

    /// Returns true if the IE fits in an empty message.
    pub(crate) fn fits(&self, ie: &InfoElement) -> bool {
        ie.encoded_len() <= self.max_size - NSF_HEADER_LEN
    }

    /// Adds a single IE. False if it does not fit in the window.
    pub(crate) fn push(&mut self, ie: InfoElement) -> bool {
        if !self.fits(&ie) {
            warn!(size = ie.encoded_len(), "nsf IE larger than a message, dropped");
            return true;
        }
        if ie.encoded_len() > self.room() && !self.roll() {
            return false;
        }
        self.append(ie);
        true
    }

    /// Adds a whole record as SET segments. Either every segment fits in
    /// the window or nothing is added.
    pub(crate) fn push_record(&mut self, table: TableName, data: &[u8]) -> bool {
        let mark_messages = self.messages.len();
        let mark_ies = self.messages[mark_messages - 1].ies.len();
        let mark_len = self.open_len;
        let mark_count = self.ies;

        let mut offset = 0;
        while offset < data.len() {
            if self.room() <= IE_HEADER_LEN {
                if !self.roll() {
                    self.messages.truncate(mark_messages);
                    self.open().ies.truncate(mark_ies);
                    self.open_len = mark_len;
                    self.ies = mark_count;
                    return false;
                }
                continue;
            }
            let take = (self.room() - IE_HEADER_LEN).min(data.len() - offset);
            let end = offset + take;
            self.append(InfoElement::set_segment(
                table,
                offset as u32,
                offset == 0,
                end == data.len(),
                data[offset..end].to_vec(),
            ));
            offset = end;
        }
        true
    }

    pub(crate) fn ie_count(&self) -> u64 {
        self.ies
    }

    /// True until the first IE is added.
    pub(crate) fn is_fresh(&self) -> bool {
        self.ies == 0
    }

    /// Non-empty messages in order.
    pub(crate) fn finish(self) -> Vec<NsfMessage> {
        self.messages.into_iter().filter(|m| !m.is_empty()).collect()
    }
}

impl NsfReplicator {
    /// Packs every dirty NSF table into a burst and sends it. Only runs
    /// when nothing is waiting for an ACK.
    pub(crate) fn send_pending(
        &mut self,
        now: Instant,
        tables: &mut TableRegistry,
        transport: &mut dyn AgentTransport,
    ) -> NsfResult<()> {
        if !self.window.is_empty() {
            return Ok(());
        }
        let dirty: Vec<TableName> = tables
            .iter()
            .filter(|t| t.is_nsf() && t.nsf_dirty())
            .map(|t| *t.name())
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let mut packer = Packer::new(self.config.max_message_size, self.config.window);
        'tables: for name in dirty {
            let Some(table) = tables.find_mut(&name) else {
                continue;
            };
            if table.nsf_purge_pending() {
                if !packer.push(InfoElement::purge(name)) {
                    break;
                }
                table.clear_nsf_purge_pending();
            }
            match table.kind() {
                TableKind::Record => {
                    let data = table.record_data().unwrap_or_default().to_vec();
                    if !packer.push_record(name, &data) {
                        if !packer.is_fresh() {
                            break;
                        }
                        warn!(table = %name, size = data.len(), "record exceeds nsf window, skipped");
                    }
                }
                TableKind::Avl => {
                    // Tombstones erased here are dropped on the backup before
                    // any node IE, which may bring the key back.
                    for key in table.nsf_erased_keys() {
                        if !packer.push(InfoElement::delete(name, key.clone())) {
                            break 'tables;
                        }
                        table.clear_nsf_erased(&key);
                    }
                    for (key, deleted) in table.nsf_changed_nodes() {
                        let packed = if deleted {
                            let held = table
                                .held_tombstone(&key)
                                .map(|data| InfoElement::tombstone(name, data.to_vec()))
                                .filter(|ie| packer.fits(ie));
                            packer.push(held.unwrap_or_else(|| InfoElement::delete(name, key.clone())))
                        } else {
                            let data = table.node_data(&key).unwrap_or_default().to_vec();
                            packer.push_record(name, &data)
                        };
                        if !packed {
                            if !packer.is_fresh() {
                                break 'tables;
                            }
                            warn!(table = %name, "record exceeds nsf window, skipped");
                        }
                        table.clear_node_nsf(&key)?;
                    }
                }
            }
            table.clear_nsf_dirty();
        }

        let ies = packer.ie_count();
        let burst = packer.finish();
        if burst.is_empty() {
            return Ok(());
        }
        let count = burst.len();
        for (i, mut msg) in burst.into_iter().enumerate() {
            self.tx_seq += 1;
            msg.header.seq = self.tx_seq;
            msg.header.ack_request = i + 1 == count;
            self.transmit(&msg, transport);
            self.window.push_back(msg);
        }
        self.stats.ies_sent += ies;
        self.ack_pending = true;
        self.ack_expected = self.tx_seq;
        self.last_tx = Some(now);
        self.last_ack = Some(now);
        debug!(messages = count, ies, last_seq = self.tx_seq, "nsf burst sent");
        Ok(())
    }

    /// Sends an empty ACK request at the current sequence.
    pub(crate) fn probe(&mut self, now: Instant, transport: &mut dyn AgentTransport) {
        let msg = NsfMessage::ack_request(self.tx_seq);
        self.transmit(&msg, transport);
        self.stats.ack_requests += 1;
        self.last_tx = Some(now);
        debug!(seq = self.tx_seq, "nsf ack requested");
    }

    /// Sends every buffered message again; the last one requests an ACK.
    pub(crate) fn retransmit_window(&mut self, now: Instant, transport: &mut dyn AgentTransport) {
        let count = self.window.len();
        let messages: Vec<NsfMessage> = self
            .window
            .iter()
            .enumerate()
            .map(|(i, msg)| {
                let mut msg = msg.clone();
                if i + 1 == count {
                    msg.header.ack_request = true;
                }
                msg
            })
            .collect();
        for msg in &messages {
            self.transmit(msg, transport);
            self.stats.retransmits += 1;
        }
        self.last_tx = Some(now);
    }

    fn release_through(&mut self, seq: u64) {
        while self.window.front().is_some_and(|m| m.seq() <= seq) {
            self.window.pop_front();
        }
    }

    pub(crate) fn on_ack(
        &mut self,
        seq: u64,
        now: Instant,
        tables: &mut TableRegistry,
        transport: &mut dyn AgentTransport,
    ) -> NsfResult<()> {
        self.stats.acks_received += 1;
        self.last_ack = Some(now);
        if seq > self.tx_seq {
            warn!(seq, tx_seq = self.tx_seq, "nsf ack beyond last sent sequence");
            return Ok(());
        }
        self.release_through(seq);
        debug!(seq, window = self.window.len(), "nsf ack");
        if self.window.is_empty() {
            self.ack_pending = false;
            self.send_pending(now, tables, transport)?;
        }
        Ok(())
    }

    pub(crate) fn on_miss(
        &mut self,
        seq: u64,
        now: Instant,
        tables: &mut TableRegistry,
        transport: &mut dyn AgentTransport,
    ) {
        self.stats.misses_received += 1;
        let oldest = self.window.front().map(NsfMessage::seq);
        match oldest {
            Some(oldest) if seq + 1 < oldest => {
                warn!(seq, oldest, "nsf gap predates window, resyncing");
                self.start_stream(self.tx_seq + 1, now, tables, transport);
            }
            Some(_) => {
                self.release_through(seq);
                debug!(seq, window = self.window.len(), "nsf miss, retransmitting");
                self.retransmit_window(now, transport);
                self.last_ack = Some(now);
            }
            None if seq < self.tx_seq => {
                warn!(seq, tx_seq = self.tx_seq, "nsf miss with empty window, resyncing");
                self.start_stream(self.tx_seq + 1, now, tables, transport);
            }
            None => debug!(seq, "nsf miss ignored, nothing outstanding"),
        }
    }
}
