//! Packet-stream statistics, RFC 4737 flavoured.
//!
//! Loss and reordering are statistics-only concerns: they are counted,
//! never raised as errors. The reordering extent is approximated over a
//! short ring of recently seen sequence numbers rather than the full
//! history the RFC prescribes.

use std::net::SocketAddr;

const PSN_RING: usize = 32;

/// Ring of the most recent sequence numbers, in arrival order.
#[derive(Debug, Clone)]
struct SeqRing {
    buf: [u64; PSN_RING],
    len: usize,
    head: usize,
}

impl SeqRing {
    fn new() -> Self {
        SeqRing {
            buf: [0; PSN_RING],
            len: 0,
            head: 0,
        }
    }

    fn push(&mut self, seq: u64) {
        self.buf[self.head] = seq;
        self.head = (self.head + 1) % PSN_RING;
        self.len = (self.len + 1).min(PSN_RING);
    }

    fn clear(&mut self) {
        self.len = 0;
        self.head = 0;
    }

    /// Entries in arrival order, oldest first.
    fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let start = (self.head + PSN_RING - self.len) % PSN_RING;
        (0..self.len).map(move |i| self.buf[(start + i) % PSN_RING])
    }
}

/// Per-sender packet statistics.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub pkt_in: u64,
    pub pkt_ooo: u64,
    pub pkt_disc: u64,
    /// Sum of reordering extents (RFC 4737 §4.2.2, ring-approximated).
    pub ooosum: u64,
    expect: u64,
    max_seq: u64,
    min_seq: u64,
    psn: SeqRing,
}

impl Default for StreamStats {
    fn default() -> Self {
        StreamStats {
            pkt_in: 0,
            pkt_ooo: 0,
            pkt_disc: 0,
            ooosum: 0,
            expect: 0,
            max_seq: 0,
            min_seq: u64::MAX,
            psn: SeqRing::new(),
        }
    }
}

impl StreamStats {
    /// Account one received sequence number.
    pub fn record(&mut self, seq: u64) {
        self.pkt_in += 1;
        self.psn.push(seq);
        if seq >= self.expect {
            self.expect = seq + 1;
        } else {
            // a reordering; extent = number of ring entries that arrived
            // after this one should have
            self.pkt_ooo += 1;
            let later = self.psn.iter().filter(|&s| s >= seq).count() as u64;
            self.ooosum += later.saturating_sub(1);
        }
        if seq > self.max_seq || self.pkt_in == 1 {
            self.max_seq = seq;
        }
        if seq < self.min_seq {
            self.min_seq = seq;
        }
    }

    pub fn discard(&mut self, n: u64) {
        self.pkt_disc += n;
    }

    /// `max − min + 1 − received`; zero while nothing arrived.
    pub fn lost(&self) -> u64 {
        if self.pkt_in == 0 {
            return 0;
        }
        (self.max_seq - self.min_seq + 1).saturating_sub(self.pkt_in)
    }

    /// Restart the accounting at `seq` after a sender resync. The packet
    /// carrying `seq` counts as received.
    pub fn resync(&mut self, seq: u64) {
        self.pkt_in = 1;
        self.pkt_ooo = 0;
        self.ooosum = 0;
        self.expect = seq + 1;
        self.max_seq = seq;
        self.min_seq = seq;
        self.psn.clear();
        self.psn.push(seq);
    }
}

/// Bounded table of per-sender statistics; receivers facing multiple
/// senders key their accounting by source address.
#[derive(Debug, Default)]
pub struct SenderTable {
    senders: Vec<(SocketAddr, StreamStats)>,
}

impl SenderTable {
    pub const MAX_SENDERS: usize = 8;

    pub fn get_or_insert(&mut self, addr: SocketAddr) -> Option<&mut StreamStats> {
        if let Some(i) = self.senders.iter().position(|(a, _)| *a == addr) {
            return Some(&mut self.senders[i].1);
        }
        if self.senders.len() >= Self::MAX_SENDERS {
            return None;
        }
        self.senders.push((addr, StreamStats::default()));
        self.senders.last_mut().map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SocketAddr, &StreamStats)> {
        self.senders.iter().map(|(a, s)| (a, s))
    }

    pub fn totals(&self) -> StreamTotals {
        let mut t = StreamTotals::default();
        for (_, s) in &self.senders {
            t.pkt_in += s.pkt_in;
            t.pkt_lost += s.lost();
            t.pkt_ooo += s.pkt_ooo;
            t.pkt_disc += s.pkt_disc;
        }
        t
    }
}

/// Aggregate view over every sender of a receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTotals {
    pub pkt_in: u64,
    pub pkt_lost: u64,
    pub pkt_ooo: u64,
    pub pkt_disc: u64,
}
