//! Execution contexts
//!
//! A context owns the metadata block a program sees through R1 and the
//! packet bytes it may load from. Programs address both through the virtual
//! layout in [`crate::vm`].

use std::ops::Range;

use crate::vm::MM_PACKET;

/// Memory a single invocation runs against
#[derive(Debug)]
pub struct ContextRegions<'a> {
    /// Context block, mapped at [`crate::vm::MM_CTX`]
    pub ctx: &'a mut [u8],
    /// Packet bytes, mapped at [`crate::vm::MM_PACKET`]
    pub packet: &'a mut [u8],
    /// Index of the link-layer header in `packet`
    pub mac_offset: usize,
    /// Index of the network header in `packet`
    pub network_offset: usize,
}

/// Anything a program can be run against
pub trait ProgramContext {
    /// Borrow the memory for one invocation
    fn regions(&mut self) -> ContextRegions<'_>;

    /// Byte range of the per-invocation scratch area inside the context block
    fn scratch_range(&self) -> Option<Range<usize>> {
        None
    }
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(word)
}

fn write_u32(bytes: &mut [u8], off: usize, value: u32) {
    bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(word)
}

fn write_u64(bytes: &mut [u8], off: usize, value: u64) {
    bytes[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Field offsets of the socket-buffer context block
pub mod skb {
    /// Packet length, u32
    pub const LEN: usize = 0;
    /// Packet type, u32
    pub const PKT_TYPE: usize = 4;
    /// Packet mark, u32
    pub const MARK: usize = 8;
    /// Queue mapping, u32
    pub const QUEUE_MAPPING: usize = 12;
    /// Link-layer protocol, big-endian u16 in a u32 slot
    pub const PROTOCOL: usize = 16;
    /// Non-zero when a VLAN tag is present, u32
    pub const VLAN_PRESENT: usize = 20;
    /// VLAN tag control information, u32
    pub const VLAN_TCI: usize = 24;
    /// VLAN protocol, big-endian u16 in a u32 slot
    pub const VLAN_PROTO: usize = 28;
    /// Priority, u32
    pub const PRIORITY: usize = 32;
    /// Receiving interface index, u32
    pub const IFINDEX: usize = 36;
    /// Receive hash, u32
    pub const HASH: usize = 40;
    /// Hardware address type of the device, u32
    pub const HATYPE: usize = 44;
    /// Control-block scratch area, five u32 words
    pub const CB: usize = 48;
    /// Size of the control block
    pub const CB_LEN: usize = 20;
    /// Payload offset, u32
    pub const PAY_OFFSET: usize = 68;
    /// Start of packet data, u64 virtual address
    pub const DATA: usize = 72;
    /// End of packet data, u64 virtual address
    pub const DATA_END: usize = 80;
    /// Size of the block
    pub const SIZE: usize = 88;
}

/// Socket-buffer style context used by filters and classifiers
#[derive(Debug, Clone)]
pub struct SkBuffContext {
    meta: [u8; skb::SIZE],
    packet: Vec<u8>,
    mac_offset: usize,
    network_offset: usize,
}

impl SkBuffContext {
    /// Context over `packet`; the network header is assumed to follow a
    /// 14-byte Ethernet header when the packet is long enough.
    pub fn new(packet: Vec<u8>) -> Self {
        let network_offset = if packet.len() >= 14 { 14 } else { 0 };
        let mut ctx = Self {
            meta: [0; skb::SIZE],
            packet,
            mac_offset: 0,
            network_offset,
        };
        ctx.sync_packet();
        ctx
    }

    fn sync_packet(&mut self) {
        let len = self.packet.len() as u64;
        write_u32(&mut self.meta, skb::LEN, len as u32);
        write_u64(&mut self.meta, skb::DATA, MM_PACKET);
        write_u64(&mut self.meta, skb::DATA_END, MM_PACKET + len);
    }

    /// Replace the packet bytes
    pub fn set_packet(&mut self, packet: Vec<u8>) {
        self.packet = packet;
        self.sync_packet();
    }

    /// Packet bytes
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// Set header positions
    pub fn with_headers(mut self, mac_offset: usize, network_offset: usize) -> Self {
        self.mac_offset = mac_offset;
        self.network_offset = network_offset;
        self
    }

    /// Set the link-layer protocol (host order)
    pub fn with_protocol(mut self, protocol: u16) -> Self {
        self.set_protocol(protocol);
        self
    }

    /// Set the link-layer protocol (host order)
    pub fn set_protocol(&mut self, protocol: u16) {
        self.meta[skb::PROTOCOL..skb::PROTOCOL + 4].fill(0);
        self.meta[skb::PROTOCOL..skb::PROTOCOL + 2].copy_from_slice(&protocol.to_be_bytes());
    }

    /// Link-layer protocol (host order)
    pub fn protocol(&self) -> u16 {
        u16::from_be_bytes([self.meta[skb::PROTOCOL], self.meta[skb::PROTOCOL + 1]])
    }

    /// Set a VLAN tag
    pub fn with_vlan(mut self, tci: u16, proto: u16) -> Self {
        write_u32(&mut self.meta, skb::VLAN_PRESENT, 1);
        write_u32(&mut self.meta, skb::VLAN_TCI, u32::from(tci));
        self.meta[skb::VLAN_PROTO..skb::VLAN_PROTO + 4].fill(0);
        self.meta[skb::VLAN_PROTO..skb::VLAN_PROTO + 2].copy_from_slice(&proto.to_be_bytes());
        self
    }

    /// Set the packet mark
    pub fn with_mark(mut self, mark: u32) -> Self {
        write_u32(&mut self.meta, skb::MARK, mark);
        self
    }

    /// Packet mark
    pub fn mark(&self) -> u32 {
        read_u32(&self.meta, skb::MARK)
    }

    /// Set the receiving interface
    pub fn with_ifindex(mut self, ifindex: u32) -> Self {
        write_u32(&mut self.meta, skb::IFINDEX, ifindex);
        self
    }

    /// Set the packet type
    pub fn with_pkt_type(mut self, pkt_type: u32) -> Self {
        write_u32(&mut self.meta, skb::PKT_TYPE, pkt_type);
        self
    }

    /// Set the queue mapping
    pub fn with_queue_mapping(mut self, queue: u32) -> Self {
        write_u32(&mut self.meta, skb::QUEUE_MAPPING, queue);
        self
    }

    /// Set the receive hash
    pub fn with_hash(mut self, hash: u32) -> Self {
        write_u32(&mut self.meta, skb::HASH, hash);
        self
    }

    /// Set the device hardware type
    pub fn with_hatype(mut self, hatype: u32) -> Self {
        write_u32(&mut self.meta, skb::HATYPE, hatype);
        self
    }

    /// Set the payload offset
    pub fn with_pay_offset(mut self, offset: u32) -> Self {
        write_u32(&mut self.meta, skb::PAY_OFFSET, offset);
        self
    }

    /// Read a context field
    pub fn field_u32(&self, off: usize) -> u32 {
        read_u32(&self.meta, off)
    }

    /// Control-block scratch area
    pub fn cb(&self) -> &[u8] {
        &self.meta[skb::CB..skb::CB + skb::CB_LEN]
    }

    /// Mutable control-block scratch area
    pub fn cb_mut(&mut self) -> &mut [u8] {
        &mut self.meta[skb::CB..skb::CB + skb::CB_LEN]
    }
}

impl ProgramContext for SkBuffContext {
    fn regions(&mut self) -> ContextRegions<'_> {
        ContextRegions {
            ctx: &mut self.meta,
            packet: &mut self.packet,
            mac_offset: self.mac_offset,
            network_offset: self.network_offset,
        }
    }

    fn scratch_range(&self) -> Option<Range<usize>> {
        Some(skb::CB..skb::CB + skb::CB_LEN)
    }
}

/// Field offsets of the express-data-path context block
pub mod xdp_md {
    /// Start of packet data, u64 virtual address
    pub const DATA: usize = 0;
    /// End of packet data, u64 virtual address
    pub const DATA_END: usize = 8;
    /// Receiving interface index, u32
    pub const INGRESS_IFINDEX: usize = 16;
    /// Receive queue, u32
    pub const RX_QUEUE_INDEX: usize = 20;
    /// Size of the block
    pub const SIZE: usize = 24;
}

/// Context for programs that run before any socket buffer exists
#[derive(Debug, Clone)]
pub struct XdpContext {
    meta: [u8; xdp_md::SIZE],
    packet: Vec<u8>,
}

impl XdpContext {
    /// Context over `packet` received on `ifindex`, queue `rx_queue`
    pub fn new(packet: Vec<u8>, ifindex: u32, rx_queue: u32) -> Self {
        let mut meta = [0u8; xdp_md::SIZE];
        write_u64(&mut meta, xdp_md::DATA, MM_PACKET);
        write_u64(&mut meta, xdp_md::DATA_END, MM_PACKET + packet.len() as u64);
        write_u32(&mut meta, xdp_md::INGRESS_IFINDEX, ifindex);
        write_u32(&mut meta, xdp_md::RX_QUEUE_INDEX, rx_queue);
        Self { meta, packet }
    }

    /// Packet bytes
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// Receiving interface
    pub fn ingress_ifindex(&self) -> u32 {
        read_u32(&self.meta, xdp_md::INGRESS_IFINDEX)
    }

    /// Virtual end of packet data
    pub fn data_end(&self) -> u64 {
        read_u64(&self.meta, xdp_md::DATA_END)
    }
}

impl ProgramContext for XdpContext {
    fn regions(&mut self) -> ContextRegions<'_> {
        let network_offset = 14.min(self.packet.len());
        ContextRegions {
            ctx: &mut self.meta,
            packet: &mut self.packet,
            mac_offset: 0,
            network_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skb_layout() {
        let ctx = SkBuffContext::new(vec![0; 60]).with_protocol(0x0800).with_mark(7);
        assert_eq!(ctx.field_u32(skb::LEN), 60);
        assert_eq!(ctx.protocol(), 0x0800);
        assert_eq!(&ctx.meta[skb::PROTOCOL..skb::PROTOCOL + 2], &[0x08, 0x00]);
        assert_eq!(ctx.mark(), 7);
        assert_eq!(read_u64(&ctx.meta, skb::DATA_END), MM_PACKET + 60);
        assert_eq!(ctx.scratch_range(), Some(48..68));
    }

    #[test]
    fn test_xdp_layout() {
        let ctx = XdpContext::new(vec![1, 2, 3], 4, 5);
        assert_eq!(ctx.ingress_ifindex(), 4);
        assert_eq!(ctx.data_end(), MM_PACKET + 3);
    }
}
