//! Per-worker redirect decisions
//!
//! A forwarding program records where the current packet should go by
//! calling the `redirect` or `redirect_map` helper; the transport then
//! consumes that decision. Map-based forwarding batches packets per map and
//! the batch is flushed once per poll cycle, or earlier when a packet in the
//! same cycle targets a different map.
//!
//! ```text
//!   Idle --helper--> Pending{ifindex, map} --do_redirect/take_pending--> Idle
//! ```

use std::sync::Arc;
use thiserror::Error;

/// Program verdicts for express-data-path programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum XdpAction {
    /// Error path, drop
    Aborted = 0,
    /// Drop
    Drop = 1,
    /// Continue to the stack
    Pass = 2,
    /// Bounce out of the receiving interface
    Tx = 3,
    /// Forward according to the pending redirect
    Redirect = 4,
}

impl XdpAction {
    /// Map a program result onto an action
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Aborted,
            1 => Self::Drop,
            2 => Self::Pass,
            3 => Self::Tx,
            4 => Self::Redirect,
            _ => return None,
        })
    }
}

/// Report a program result outside the action set
pub fn warn_invalid_xdp_action(act: u32) {
    tracing::warn!(target: "sieve::redirect", act, "illegal XDP return value, expect packet loss");
}

/// Forwarding failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RedirectError {
    /// Nothing is pending
    #[error("no redirect pending")]
    NoTarget,

    /// The map has no entry for the key
    #[error("map has no forwarding entry for key {0}")]
    NoEntry(u32),

    /// Target device is administratively down
    #[error("device {0} is down")]
    DeviceDown(u32),

    /// Packet exceeds the target's MTU
    #[error("packet of {len} bytes exceeds limit {limit} of device {ifindex}")]
    MessageTooLong {
        /// Target device
        ifindex: u32,
        /// Packet length
        len: usize,
        /// Largest frame the device accepts
        limit: usize,
    },

    /// The map's queue is full
    #[error("forwarding queue full")]
    QueueFull,
}

/// Output map: a table of forwarding targets with a per-batch queue
pub trait ForwardMap: Send + Sync {
    /// Queue `packet` for the entry at `key`
    fn enqueue(&self, key: u32, packet: &[u8]) -> Result<(), RedirectError>;

    /// Transmit everything queued since the last flush
    fn flush(&self);

    /// Diagnostic name
    fn name(&self) -> &str {
        "map"
    }
}

/// Shared handle to an output map
pub type MapRef = Arc<dyn ForwardMap>;

fn same_map(a: &MapRef, b: &MapRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Redirect target that bypasses the direct-return fast path
pub const RI_F_RF_NO_DIRECT: u32 = 1 << 0;

/// Where a consumed decision points
#[derive(Clone)]
pub enum RedirectTarget {
    /// Transmit on an interface
    Device(u32),
    /// Entry `key` of `map`
    Map {
        /// Output map
        map: MapRef,
        /// Entry key
        key: u32,
    },
}

impl std::fmt::Debug for RedirectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(ifindex) => f.debug_tuple("Device").field(ifindex).finish(),
            Self::Map { map, key } => f
                .debug_struct("Map")
                .field("map", &map.name())
                .field("key", key)
                .finish(),
        }
    }
}

/// Minimal device description for forwarding checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetDevice {
    /// Interface index
    pub ifindex: u32,
    /// Maximum transmission unit
    pub mtu: u32,
    /// Link-layer header length
    pub hard_header_len: u32,
    /// Administratively up
    pub up: bool,
}

const VLAN_HLEN: usize = 4;

/// Check that `len` bytes can be forwarded out of `dev`
pub fn ok_fwd_dev(dev: &NetDevice, len: usize) -> Result<(), RedirectError> {
    if !dev.up {
        return Err(RedirectError::DeviceDown(dev.ifindex));
    }
    let limit = dev.mtu as usize + dev.hard_header_len as usize + VLAN_HLEN;
    if len > limit {
        return Err(RedirectError::MessageTooLong {
            ifindex: dev.ifindex,
            len,
            limit,
        });
    }
    Ok(())
}

/// Redirect state of one worker
#[derive(Default, Clone)]
pub struct RedirectInfo {
    /// Pending interface index, or map key when `map` is set
    pub ifindex: u32,
    /// Flags passed by the program
    pub flags: u32,
    /// Map of the pending decision
    pub map: Option<MapRef>,
    /// Map with packets queued in the current batch
    pub map_to_flush: Option<MapRef>,
    /// Engine-private flags
    pub kern_flags: u32,
}

impl std::fmt::Debug for RedirectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectInfo")
            .field("ifindex", &self.ifindex)
            .field("flags", &self.flags)
            .field("map", &self.map.as_ref().map(|m| m.name()))
            .field("map_to_flush", &self.map_to_flush.as_ref().map(|m| m.name()))
            .field("kern_flags", &self.kern_flags)
            .finish()
    }
}

impl RedirectInfo {
    /// Record a device target. Non-zero flags abort.
    pub fn redirect(&mut self, ifindex: u32, flags: u32) -> XdpAction {
        if flags != 0 {
            return XdpAction::Aborted;
        }
        self.ifindex = ifindex;
        self.flags = flags;
        self.map = None;
        XdpAction::Redirect
    }

    /// Record a map target. Non-zero flags abort.
    pub fn redirect_map(&mut self, map: MapRef, key: u32, flags: u32) -> XdpAction {
        if flags != 0 {
            return XdpAction::Aborted;
        }
        self.ifindex = key;
        self.flags = flags;
        self.map = Some(map);
        XdpAction::Redirect
    }

    /// Whether a decision is waiting
    pub fn is_pending(&self) -> bool {
        self.map.is_some() || self.ifindex != 0
    }

    /// Consume the pending decision without queueing anything
    pub fn take_pending(&mut self) -> Option<RedirectTarget> {
        let key = std::mem::take(&mut self.ifindex);
        match self.map.take() {
            Some(map) => Some(RedirectTarget::Map { map, key }),
            None if key != 0 => Some(RedirectTarget::Device(key)),
            None => None,
        }
    }

    /// Act on the pending decision for `packet`.
    ///
    /// Map targets are queued; a map other than the one queued earlier in
    /// this batch causes that earlier map to be flushed first. Device
    /// targets are returned to the caller for transmission.
    pub fn do_redirect(&mut self, packet: &[u8]) -> Result<RedirectTarget, RedirectError> {
        match self.take_pending() {
            Some(RedirectTarget::Map { map, key }) => {
                if let Some(active) = &self.map_to_flush
                    && !same_map(active, &map)
                {
                    self.flush();
                }
                map.enqueue(key, packet)?;
                self.map_to_flush = Some(Arc::clone(&map));
                tracing::trace!(target: "sieve::redirect", map = map.name(), key, "queued");
                Ok(RedirectTarget::Map { map, key })
            }
            Some(target) => Ok(target),
            None => Err(RedirectError::NoTarget),
        }
    }

    /// End of batch: flush the map queued in this batch
    pub fn flush(&mut self) {
        if let Some(map) = self.map_to_flush.take() {
            tracing::trace!(target: "sieve::redirect", map = map.name(), "flush");
            map.flush();
        }
    }

    /// Mark the current target as not eligible for direct return
    pub fn set_return_frame_no_direct(&mut self) {
        self.kern_flags |= RI_F_RF_NO_DIRECT;
    }

    /// Clear the no-direct mark
    pub fn clear_return_frame_no_direct(&mut self) {
        self.kern_flags &= !RI_F_RF_NO_DIRECT;
    }

    /// Whether the no-direct mark is set
    pub fn return_frame_no_direct(&self) -> bool {
        self.kern_flags & RI_F_RF_NO_DIRECT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        label: &'static str,
    }

    impl ForwardMap for Recorder {
        fn enqueue(&self, key: u32, _packet: &[u8]) -> Result<(), RedirectError> {
            self.log.lock().push(format!("{}:enqueue:{key}", self.label));
            Ok(())
        }

        fn flush(&self) {
            self.log.lock().push(format!("{}:flush", self.label));
        }

        fn name(&self) -> &str {
            self.label
        }
    }

    #[test]
    fn test_flags_abort() {
        let mut ri = RedirectInfo::default();
        assert_eq!(ri.redirect(3, 1), XdpAction::Aborted);
        assert!(!ri.is_pending());
        assert_eq!(ri.redirect(3, 0), XdpAction::Redirect);
        assert!(ri.is_pending());
    }

    #[test]
    fn test_last_write_wins() {
        let map: MapRef = Arc::new(Recorder::default());
        let mut ri = RedirectInfo::default();
        ri.redirect_map(map, 5, 0);
        ri.redirect(9, 0);
        assert!(ri.map.is_none());
        assert!(matches!(ri.take_pending(), Some(RedirectTarget::Device(9))));
        assert!(ri.take_pending().is_none());
    }

    #[test]
    fn test_no_direct_flag() {
        let mut ri = RedirectInfo::default();
        ri.set_return_frame_no_direct();
        assert!(ri.return_frame_no_direct());
        ri.clear_return_frame_no_direct();
        assert!(!ri.return_frame_no_direct());
    }

    #[test]
    fn test_ok_fwd_dev() {
        let dev = NetDevice {
            ifindex: 2,
            mtu: 1500,
            hard_header_len: 14,
            up: true,
        };
        assert!(ok_fwd_dev(&dev, 1518).is_ok());
        assert!(matches!(
            ok_fwd_dev(&dev, 1519),
            Err(RedirectError::MessageTooLong { limit: 1518, .. })
        ));
        let down = NetDevice { up: false, ..dev };
        assert_eq!(ok_fwd_dev(&down, 60), Err(RedirectError::DeviceDown(2)));
    }

    #[test]
    fn test_xdp_action_mapping() {
        assert_eq!(XdpAction::from_u32(4), Some(XdpAction::Redirect));
        assert_eq!(XdpAction::from_u32(5), None);
    }
}
