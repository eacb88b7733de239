//! Inter-packet delay arithmetic.

use crate::netparms::NetParms;

/// Ethernet + IP + UDP framing overhead per datagram, as counted against
/// the declared link rate.
const WIRE_OVERHEAD: usize = 42;

/// The delay needed so a stream of datagrams does not exceed the declared
/// link rate. Zero when no rate is declared.
pub fn theoretical_ipd_us(np: &NetParms) -> u64 {
    if np.link_rate_bps == 0 {
        return 0;
    }
    let bits = ((np.wire_size + crate::wire::SEQNR_SIZE + WIRE_OVERHEAD) * 8) as u128;
    ((bits * 1_000_000) / np.link_rate_bps as u128) as u64
}

/// Effective inter-packet delay: the larger of the operator-set value and
/// the theoretical minimum.
pub fn ipd_us(np: &NetParms) -> u64 {
    np.ipd_us.max(theoretical_ipd_us(np))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_link_means_operator_value() {
        let np = NetParms {
            ipd_us: 120,
            link_rate_bps: 0,
            ..NetParms::default()
        };
        assert_eq!(ipd_us(&np), 120);
    }

    #[test]
    fn theoretical_wins_when_larger() {
        // 8192+8+42 bytes over a 100 Mbit/s link: ~659 us per packet
        let np = NetParms {
            ipd_us: 10,
            link_rate_bps: 100_000_000,
            ..NetParms::default()
        };
        let t = theoretical_ipd_us(&np);
        assert!(t > 600 && t < 700, "got {t}");
        assert_eq!(ipd_us(&np), t);
    }

    #[test]
    fn operator_wins_when_larger() {
        let np = NetParms {
            ipd_us: 10_000,
            link_rate_bps: 1_000_000_000,
            ..NetParms::default()
        };
        assert_eq!(ipd_us(&np), 10_000);
    }
}
