//! Program and attachment types

use serde::{Deserialize, Serialize};

/// Attachment context a program is written for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ProgType {
    /// Sentinel for programs migrated from the classic format
    #[default]
    Unspec = 0,
    /// Socket receive filter
    SocketFilter = 1,
    /// Kernel probe
    Kprobe = 2,
    /// Traffic-control classifier
    SchedCls = 3,
    /// Traffic-control action
    SchedAct = 4,
    /// Static tracepoint
    Tracepoint = 5,
    /// Express data path
    Xdp = 6,
    /// Perf event
    PerfEvent = 7,
    /// Cgroup socket buffer
    CgroupSkb = 8,
    /// Cgroup socket creation
    CgroupSock = 9,
    /// Lightweight tunnel input
    LwtIn = 10,
    /// Lightweight tunnel output
    LwtOut = 11,
    /// Lightweight tunnel transmit
    LwtXmit = 12,
    /// Socket operations
    SockOps = 13,
    /// Stream parser / verdict
    SkSkb = 14,
    /// Cgroup device access
    CgroupDevice = 15,
    /// Socket message verdict
    SkMsg = 16,
    /// Raw tracepoint
    RawTracepoint = 17,
    /// Cgroup socket address hooks
    CgroupSockAddr = 18,
    /// Segment-routing local action
    LwtSeg6local = 19,
    /// Infrared decoder
    LircMode2 = 20,
    /// Reuseport socket selection
    SkReuseport = 21,
    /// Flow dissector
    FlowDissector = 22,
    /// Cgroup sysctl access
    CgroupSysctl = 23,
}

impl ProgType {
    /// Whether the context is a socket buffer with a control-block area
    pub const fn has_skb_context(self) -> bool {
        matches!(
            self,
            Self::Unspec
                | Self::SocketFilter
                | Self::SchedCls
                | Self::SchedAct
                | Self::CgroupSkb
                | Self::LwtIn
                | Self::LwtOut
                | Self::LwtXmit
                | Self::SkSkb
                | Self::SkReuseport
                | Self::FlowDissector
        )
    }

    /// Short name used in diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unspec => "unspec",
            Self::SocketFilter => "socket_filter",
            Self::Kprobe => "kprobe",
            Self::SchedCls => "sched_cls",
            Self::SchedAct => "sched_act",
            Self::Tracepoint => "tracepoint",
            Self::Xdp => "xdp",
            Self::PerfEvent => "perf_event",
            Self::CgroupSkb => "cgroup_skb",
            Self::CgroupSock => "cgroup_sock",
            Self::LwtIn => "lwt_in",
            Self::LwtOut => "lwt_out",
            Self::LwtXmit => "lwt_xmit",
            Self::SockOps => "sock_ops",
            Self::SkSkb => "sk_skb",
            Self::CgroupDevice => "cgroup_device",
            Self::SkMsg => "sk_msg",
            Self::RawTracepoint => "raw_tracepoint",
            Self::CgroupSockAddr => "cgroup_sock_addr",
            Self::LwtSeg6local => "lwt_seg6local",
            Self::LircMode2 => "lirc_mode2",
            Self::SkReuseport => "sk_reuseport",
            Self::FlowDissector => "flow_dissector",
            Self::CgroupSysctl => "cgroup_sysctl",
        }
    }
}

/// Refinement of the program type chosen at load time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum AttachType {
    /// No refinement
    #[default]
    None = u32::MAX,
    /// Cgroup ingress
    CgroupInetIngress = 0,
    /// Cgroup egress
    CgroupInetEgress = 1,
    /// Socket creation
    CgroupInetSockCreate = 2,
    /// Socket operations
    CgroupSockOps = 3,
    /// Stream parser
    SkSkbStreamParser = 4,
    /// Stream verdict
    SkSkbStreamVerdict = 5,
    /// Device access
    CgroupDevice = 6,
    /// Message verdict
    SkMsgVerdict = 7,
    /// IPv4 bind
    CgroupInet4Bind = 8,
    /// IPv6 bind
    CgroupInet6Bind = 9,
    /// IPv4 connect
    CgroupInet4Connect = 10,
    /// IPv6 connect
    CgroupInet6Connect = 11,
    /// Flow dissector
    FlowDissector = 17,
    /// Sysctl access
    CgroupSysctl = 18,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skb_context_types() {
        assert!(ProgType::SocketFilter.has_skb_context());
        assert!(ProgType::Unspec.has_skb_context());
        assert!(!ProgType::Xdp.has_skb_context());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(ProgType::default(), ProgType::Unspec);
        assert_eq!(AttachType::default(), AttachType::None);
        assert_eq!(ProgType::Xdp as u32, 6);
        assert_eq!(ProgType::SchedCls.name(), "sched_cls");
    }
}
