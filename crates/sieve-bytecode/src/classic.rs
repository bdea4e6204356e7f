//! Classic socket-filter instruction format
//!
//! Programs in this format have an accumulator `A`, an index register `X` and
//! sixteen 32-bit scratch words. They are migrated onto the current
//! instruction set before they can run.

use serde::{Deserialize, Serialize};

/// One classic instruction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(C)]
pub struct SockFilter {
    /// Opcode; widened to 16 bits so ancillary tags fit
    pub code: u16,
    /// Jump offset when the condition holds
    pub jt: u8,
    /// Jump offset when the condition fails
    pub jf: u8,
    /// Generic multiuse field
    pub k: u32,
}

impl SockFilter {
    /// Statement (non-jump) instruction
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    /// Conditional jump instruction
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    /// Classic class bits
    #[inline]
    pub const fn class(&self) -> u8 {
        (self.code & 0x07) as u8
    }
}

/// Number of scratch memory words
pub const MEMWORDS: u32 = 16;

/// Marker bit of an ancillary-tagged opcode
pub const BPF_ANC: u16 = 1 << 15;

/// Base of the ancillary offset range
pub const SKF_AD_OFF: i32 = -0x1000;
/// Base of network-header-relative packet offsets
pub const SKF_NET_OFF: i32 = -0x100000;
/// Base of link-layer-relative packet offsets
pub const SKF_LL_OFF: i32 = -0x200000;

/// Ancillary metadata kinds, offsets from [`SKF_AD_OFF`]
pub mod ancillary {
    /// Link-layer protocol
    pub const PROTOCOL: u32 = 0;
    /// Packet type (host, broadcast, ...)
    pub const PKTTYPE: u32 = 4;
    /// Receiving interface index
    pub const IFINDEX: u32 = 8;
    /// Netlink attribute lookup
    pub const NLATTR: u32 = 12;
    /// Nested netlink attribute lookup
    pub const NLATTR_NEST: u32 = 16;
    /// Packet mark
    pub const MARK: u32 = 20;
    /// Queue mapping
    pub const QUEUE: u32 = 24;
    /// Hardware address type of the device
    pub const HATYPE: u32 = 28;
    /// Receive hash
    pub const RXHASH: u32 = 32;
    /// Executing cpu / worker id
    pub const CPU: u32 = 36;
    /// `A ^= X`
    pub const ALU_XOR_X: u32 = 40;
    /// VLAN tag control information
    pub const VLAN_TAG: u32 = 44;
    /// Whether a VLAN tag is present
    pub const VLAN_TAG_PRESENT: u32 = 48;
    /// Payload offset
    pub const PAY_OFFSET: u32 = 52;
    /// Pseudo-random number
    pub const RANDOM: u32 = 56;
    /// VLAN protocol identifier
    pub const VLAN_TPID: u32 = 60;
    /// One past the last ancillary kind
    pub const MAX: u32 = 64;

    /// Every defined kind, in offset order
    pub const ALL: [u32; 16] = [
        PROTOCOL,
        PKTTYPE,
        IFINDEX,
        NLATTR,
        NLATTR_NEST,
        MARK,
        QUEUE,
        HATYPE,
        RXHASH,
        CPU,
        ALU_XOR_X,
        VLAN_TAG,
        VLAN_TAG_PRESENT,
        PAY_OFFSET,
        RANDOM,
        VLAN_TPID,
    ];
}

/// Absolute `k` that selects ancillary kind `kind`
#[inline]
pub const fn ancillary_k(kind: u32) -> u32 {
    SKF_AD_OFF.wrapping_add(kind as i32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancillary_offsets() {
        assert_eq!(ancillary_k(ancillary::PROTOCOL), 0xffff_f000);
        assert_eq!(ancillary_k(ancillary::VLAN_TPID), 0xffff_f03c);
        assert_eq!(ancillary::ALL.len() as u32 * 4, ancillary::MAX);
    }

    #[test]
    fn test_constructors() {
        let insn = SockFilter::jump(0x15, 0x800, 0, 1);
        assert_eq!(insn.class(), 0x05);
        assert_eq!(insn.jf, 1);
        assert_eq!(SockFilter::stmt(0x06, 0xffff).jt, 0);
    }
}
