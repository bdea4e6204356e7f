//! Helper functions callable from programs
//!
//! Helpers are plain functions keyed by id. Arguments arrive in R1-R5 and
//! the result is written to R0.

use rand::Rng;
use rustc_hash::FxHashMap;
use sieve_bytecode::helper_id;
use std::sync::OnceLock;
use std::time::Instant;

use crate::redirect::{MapRef, XdpAction};
use crate::worker::WorkerEnv;

/// What a helper may touch
pub struct HelperCtx<'a> {
    /// Worker environment
    pub env: &'a mut WorkerEnv,
    /// Packet of the current invocation
    pub packet: &'a [u8],
    /// Maps referenced by the running program
    pub maps: &'a [MapRef],
}

/// Helper signature
pub type HelperFn = fn(&mut HelperCtx<'_>, [u64; 5]) -> u64;

/// Tag of values produced by map-reference wide loads
pub const MAP_HANDLE_BASE: u64 = 0xffff_0000_0000_0000;

/// Handle of the program's `index`-th map
pub const fn map_handle(index: u32) -> u64 {
    MAP_HANDLE_BASE | index as u64
}

/// Resolve a handle produced by [`map_handle`]
pub fn resolve_map<'a>(maps: &'a [MapRef], handle: u64) -> Option<&'a MapRef> {
    if handle & MAP_HANDLE_BASE != MAP_HANDLE_BASE {
        return None;
    }
    maps.get(usize::try_from(handle & 0xffff_ffff).ok()?)
}

/// Id to function table
#[derive(Debug, Clone, Default)]
pub struct HelperRegistry {
    table: FxHashMap<i32, HelperFn>,
}

impl HelperRegistry {
    /// Registry with no helpers
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in helpers
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(helper_id::KTIME_GET_NS, ktime_get_ns);
        registry.register(helper_id::GET_PRANDOM_U32, get_prandom_u32);
        registry.register(helper_id::GET_SMP_PROCESSOR_ID, get_smp_processor_id);
        registry.register(helper_id::REDIRECT, redirect);
        registry.register(helper_id::REDIRECT_MAP, redirect_map);
        registry.register(helper_id::SKB_GET_NLATTR, skb_get_nlattr);
        registry.register(helper_id::SKB_GET_NLATTR_NEST, skb_get_nlattr_nest);
        registry
    }

    /// Install `f` under `id`, returning the previous function
    pub fn register(&mut self, id: i32, f: HelperFn) -> Option<HelperFn> {
        self.table.insert(id, f)
    }

    /// Function registered under `id`
    #[inline]
    pub fn get(&self, id: i32) -> Option<HelperFn> {
        self.table.get(&id).copied()
    }

    /// Number of registered helpers
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no helper is registered
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

fn ktime_get_ns(_ctx: &mut HelperCtx<'_>, _args: [u64; 5]) -> u64 {
    static BASE: OnceLock<Instant> = OnceLock::new();
    let base = BASE.get_or_init(Instant::now);
    u64::try_from(base.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn get_prandom_u32(ctx: &mut HelperCtx<'_>, _args: [u64; 5]) -> u64 {
    u64::from(ctx.env.rng.random::<u32>())
}

fn get_smp_processor_id(ctx: &mut HelperCtx<'_>, _args: [u64; 5]) -> u64 {
    u64::from(ctx.env.id)
}

fn redirect(ctx: &mut HelperCtx<'_>, args: [u64; 5]) -> u64 {
    ctx.env.redirect.redirect(args[0] as u32, args[1] as u32) as u64
}

fn redirect_map(ctx: &mut HelperCtx<'_>, args: [u64; 5]) -> u64 {
    let Some(map) = resolve_map(ctx.maps, args[0]) else {
        return XdpAction::Aborted as u64;
    };
    ctx.env
        .redirect
        .redirect_map(map.clone(), args[1] as u32, args[2] as u32) as u64
}

const NLA_HDRLEN: usize = 4;
const NLA_TYPE_MASK: u16 = !((1 << 15) | (1 << 14));

fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Offset of the first attribute of type `kind` in `bytes[start..end]`
fn nla_find(bytes: &[u8], start: usize, end: usize, kind: u16) -> Option<usize> {
    let mut pos = start;
    while pos + NLA_HDRLEN <= end {
        let len = usize::from(u16::from_le_bytes([bytes[pos], bytes[pos + 1]]));
        let ty = u16::from_le_bytes([bytes[pos + 2], bytes[pos + 3]]);
        if len < NLA_HDRLEN || pos + len > end {
            return None;
        }
        if ty & NLA_TYPE_MASK == kind {
            return Some(pos);
        }
        pos += nla_align(len);
    }
    None
}

/// `A = offset of attribute X at or after packet offset A`, 0 when absent
fn skb_get_nlattr(ctx: &mut HelperCtx<'_>, args: [u64; 5]) -> u64 {
    let packet = ctx.packet;
    let start = args[1] as u32 as usize;
    if start + NLA_HDRLEN > packet.len() {
        return 0;
    }
    nla_find(packet, start, packet.len(), args[2] as u16).map_or(0, |off| off as u64)
}

/// Like `skb_get_nlattr`, searching the payload of the attribute at A
fn skb_get_nlattr_nest(ctx: &mut HelperCtx<'_>, args: [u64; 5]) -> u64 {
    let packet = ctx.packet;
    let start = args[1] as u32 as usize;
    if start + NLA_HDRLEN > packet.len() {
        return 0;
    }
    let len = usize::from(u16::from_le_bytes([packet[start], packet[start + 1]]));
    if len < NLA_HDRLEN || len > packet.len() - start {
        return 0;
    }
    nla_find(packet, start + NLA_HDRLEN, start + len, args[2] as u16).map_or(0, |off| off as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;

    fn nla(kind: u16, payload: &[u8]) -> Vec<u8> {
        let len = (NLA_HDRLEN + payload.len()) as u16;
        let mut out = Vec::new();
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(payload);
        out.resize(nla_align(out.len()), 0);
        out
    }

    fn call(f: HelperFn, packet: &[u8], args: [u64; 5]) -> u64 {
        let mut state = WorkerState::with_seed(3, 1);
        let mut ctx = HelperCtx {
            env: &mut state.env,
            packet,
            maps: &[],
        };
        f(&mut ctx, args)
    }

    #[test]
    fn test_nlattr_lookup() {
        let mut packet = vec![0xee; 4];
        packet.extend(nla(1, &[1, 2, 3]));
        packet.extend(nla(7, &[9; 4]));
        assert_eq!(call(skb_get_nlattr, &packet, [0, 4, 7, 0, 0]), 12);
        assert_eq!(call(skb_get_nlattr, &packet, [0, 4, 2, 0, 0]), 0);
        assert_eq!(call(skb_get_nlattr, &packet, [0, 100, 7, 0, 0]), 0);
    }

    #[test]
    fn test_nested_nlattr_lookup() {
        let inner = [nla(3, &[0; 2]), nla(5, &[1; 4])].concat();
        let packet = nla(0x8001, &inner);
        assert_eq!(call(skb_get_nlattr_nest, &packet, [0, 0, 5, 0, 0]), 12);
        assert_eq!(call(skb_get_nlattr_nest, &packet, [0, 0, 6, 0, 0]), 0);
    }

    #[test]
    fn test_processor_id_and_redirect() {
        assert_eq!(call(get_smp_processor_id, &[], [0; 5]), 3);
        assert_eq!(call(redirect, &[], [4, 0, 0, 0, 0]), XdpAction::Redirect as u64);
        assert_eq!(call(redirect, &[], [4, 1, 0, 0, 0]), XdpAction::Aborted as u64);
        assert_eq!(call(redirect_map, &[], [map_handle(0), 1, 0, 0, 0]), 0);
    }

    #[test]
    fn test_builtins_registered() {
        let registry = HelperRegistry::with_builtins();
        assert_eq!(registry.len(), 7);
        assert!(registry.get(helper_id::KTIME_GET_NS).is_some());
        assert!(registry.get(1).is_none());
    }
}
