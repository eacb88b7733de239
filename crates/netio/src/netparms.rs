//! Network parameters negotiated out-of-band over the command channel.

use serde::{Deserialize, Serialize};

use crate::protocol::Protocol;

/// Everything a network leg needs to know about its transfer. `slot_size`
/// is the stride a datagram occupies inside a block; `wire_size` is how
/// many payload bytes actually travel per datagram. They differ only when
/// the sending side compresses (`wire_size < slot_size`); the receiver
/// zero-pads the difference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetParms {
    pub protocol: Protocol,
    pub blocksize: usize,
    pub slot_size: usize,
    pub wire_size: usize,
    /// Per-network buffer count; doubles as the reorder readahead.
    pub nblock: usize,
    /// Send an ACK token back every this many received datagrams.
    pub ack_period: u32,
    /// Operator-set inter-packet delay in microseconds; the effective
    /// delay is the larger of this and the theoretical minimum.
    pub ipd_us: u64,
    /// Declared link rate in bits per second; 0 = unconstrained.
    pub link_rate_bps: u64,
    /// Socket buffer request (SO_SNDBUF/SO_RCVBUF).
    pub sockbuf: usize,
}

impl Default for NetParms {
    fn default() -> Self {
        NetParms {
            protocol: Protocol::Udps,
            blocksize: 128 * 8192,
            slot_size: 8192,
            wire_size: 8192,
            nblock: 8,
            ack_period: 1000,
            ipd_us: 0,
            link_rate_bps: 0,
            sockbuf: 4 * 1024 * 1024,
        }
    }
}

impl NetParms {
    /// Datagrams per block. Valid parameter sets divide evenly.
    pub fn dgrams_per_block(&self) -> usize {
        self.blocksize / self.slot_size
    }

    /// Sanity-check the size relations before a transfer starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.slot_size == 0 || self.blocksize == 0 {
            return Err("slot_size and blocksize must be non-zero".into());
        }
        if self.wire_size > self.slot_size {
            return Err(format!(
                "wire_size {} exceeds slot_size {}",
                self.wire_size, self.slot_size
            ));
        }
        if self.blocksize % self.slot_size != 0 {
            return Err(format!(
                "blocksize {} is not a multiple of slot_size {}",
                self.blocksize, self.slot_size
            ));
        }
        if self.nblock == 0 {
            return Err("nblock must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(NetParms::default().validate().is_ok());
    }

    #[test]
    fn compressed_wire_size_allowed() {
        let np = NetParms {
            wire_size: 4096,
            ..NetParms::default()
        };
        assert!(np.validate().is_ok());
        assert_eq!(np.dgrams_per_block(), 128);
    }

    #[test]
    fn oversize_wire_rejected() {
        let np = NetParms {
            wire_size: 9000,
            ..NetParms::default()
        };
        assert!(np.validate().is_err());
    }

    #[test]
    fn uneven_blocksize_rejected() {
        let np = NetParms {
            blocksize: 8192 * 3 + 1,
            ..NetParms::default()
        };
        assert!(np.validate().is_err());
    }
}
