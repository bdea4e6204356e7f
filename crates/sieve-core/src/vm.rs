//! Machine state and operation semantics shared by every execution engine
//!
//! Virtual address layout:
//!
//! | base          | area          |
//! |---------------|---------------|
//! | `MM_CTX`      | context block |
//! | `MM_STACK`    | call frames   |
//! | `MM_PACKET`   | packet bytes  |
//!
//! Memory is little-endian. Packet loads through `LD_ABS`/`LD_IND` read in
//! network order.

use sieve_bytecode::classic::{SKF_LL_OFF, SKF_NET_OFF};
use sieve_bytecode::opcode::{alu, endian, jmp};
use sieve_bytecode::register::MAX_EXT_REG;
use sieve_bytecode::{MAX_BPF_STACK, Reg};

use crate::context::ContextRegions;
use crate::error::Fault;
use crate::helpers::{HelperCtx, HelperRegistry};
use crate::redirect::MapRef;
use crate::worker::WorkerState;

/// Base of the context block
pub const MM_CTX: u64 = 0x1_0000_0000;
/// Base of the stack
pub const MM_STACK: u64 = 0x2_0000_0000;
/// Base of packet data
pub const MM_PACKET: u64 = 0x3_0000_0000;

/// Deepest bpf-to-bpf call chain, counting the entry frame
pub const MAX_CALL_FRAMES: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct Frame {
    ret_pc: usize,
    saved: [u64; 5],
}

/// Register file and memory of one invocation
pub struct Vm<'a> {
    /// R0-R10 and AX
    pub regs: [u64; MAX_EXT_REG],
    ctx: &'a mut [u8],
    packet: &'a mut [u8],
    stack: &'a mut [u8],
    mac_offset: usize,
    network_offset: usize,
    frames: [Frame; MAX_CALL_FRAMES],
    depth: usize,
    helpers: &'a HelperRegistry,
    maps: &'a [MapRef],
    worker: &'a mut crate::worker::WorkerEnv,
}

impl<'a> Vm<'a> {
    /// Set up an invocation: R1 points at the context, R10 at the top of the
    /// first frame, everything else is zero.
    pub fn new(
        regions: ContextRegions<'a>,
        worker: &'a mut WorkerState,
        helpers: &'a HelperRegistry,
        maps: &'a [MapRef],
    ) -> Self {
        let ContextRegions {
            ctx,
            packet,
            mac_offset,
            network_offset,
        } = regions;
        let stack = &mut worker.stack[..];
        stack[..MAX_BPF_STACK].fill(0);

        let mut regs = [0u64; MAX_EXT_REG];
        regs[Reg::R1.index() as usize] = MM_CTX;
        regs[Reg::FP.index() as usize] = MM_STACK + MAX_BPF_STACK as u64;
        Self {
            regs,
            ctx,
            packet,
            stack,
            mac_offset,
            network_offset,
            frames: [Frame::default(); MAX_CALL_FRAMES],
            depth: 0,
            helpers,
            maps,
            worker: &mut worker.env,
        }
    }

    fn area(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        let (base, bytes) = if addr >= MM_PACKET {
            (MM_PACKET, &mut *self.packet)
        } else if addr >= MM_STACK {
            (MM_STACK, &mut *self.stack)
        } else if addr >= MM_CTX {
            (MM_CTX, &mut *self.ctx)
        } else {
            return None;
        };
        let start = usize::try_from(addr - base).ok()?;
        bytes.get_mut(start..start.checked_add(len)?)
    }

    /// Load `len` bytes at `addr`, zero-extended
    #[inline]
    pub fn load(&mut self, pc: usize, addr: u64, len: usize) -> Result<u64, Fault> {
        let bytes = self.area(addr, len).ok_or(Fault::MemoryAccess {
            pc,
            addr,
            len,
            write: false,
        })?;
        let mut word = [0u8; 8];
        word[..len].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    /// Store the low `len` bytes of `value` at `addr`
    #[inline]
    pub fn store(&mut self, pc: usize, addr: u64, len: usize, value: u64) -> Result<(), Fault> {
        let bytes = self.area(addr, len).ok_or(Fault::MemoryAccess {
            pc,
            addr,
            len,
            write: true,
        })?;
        bytes.copy_from_slice(&value.to_le_bytes()[..len]);
        Ok(())
    }

    /// `*(addr) += value` for 4- or 8-byte words
    pub fn xadd(&mut self, pc: usize, addr: u64, len: usize, value: u64) -> Result<(), Fault> {
        let old = self.load(pc, addr, len)?;
        let sum = if len == 4 {
            u64::from((old as u32).wrapping_add(value as u32))
        } else {
            old.wrapping_add(value)
        };
        self.store(pc, addr, len, sum)
    }

    /// Network-order packet load for `LD_ABS`/`LD_IND`; `None` when out of
    /// bounds
    pub fn load_packet(&self, off: i32, len: usize) -> Option<u64> {
        let start = if off >= 0 {
            off as usize
        } else if off >= SKF_NET_OFF {
            self.network_offset.checked_add((off - SKF_NET_OFF) as usize)?
        } else if off >= SKF_LL_OFF {
            self.mac_offset.checked_add((off - SKF_LL_OFF) as usize)?
        } else {
            return None;
        };
        let bytes = self.packet.get(start..start.checked_add(len)?)?;
        Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Invoke helper `id` with R1-R5, result in R0
    pub fn call_helper(&mut self, pc: usize, id: i32) -> Result<(), Fault> {
        let f = self.helpers.get(id).ok_or(Fault::UnknownHelper { pc, id })?;
        let args = [
            self.regs[1],
            self.regs[2],
            self.regs[3],
            self.regs[4],
            self.regs[5],
        ];
        let mut ctx = HelperCtx {
            env: &mut *self.worker,
            packet: &*self.packet,
            maps: self.maps,
        };
        self.regs[0] = f(&mut ctx, args);
        Ok(())
    }

    /// Enter a bpf-to-bpf call returning to `ret_pc`
    pub fn push_call(&mut self, pc: usize, ret_pc: usize) -> Result<(), Fault> {
        if self.depth + 1 >= MAX_CALL_FRAMES {
            return Err(Fault::CallDepth { pc });
        }
        self.frames[self.depth] = Frame {
            ret_pc,
            saved: [
                self.regs[6],
                self.regs[7],
                self.regs[8],
                self.regs[9],
                self.regs[10],
            ],
        };
        self.depth += 1;
        let frame = self.depth * MAX_BPF_STACK;
        self.stack[frame..frame + MAX_BPF_STACK].fill(0);
        self.regs[10] = MM_STACK + (frame + MAX_BPF_STACK) as u64;
        Ok(())
    }

    /// Leave the current call; `None` when the entry frame exits
    pub fn pop_return(&mut self) -> Option<usize> {
        if self.depth == 0 {
            return None;
        }
        self.depth -= 1;
        let frame = self.frames[self.depth];
        self.regs[6..=10].copy_from_slice(&frame.saved);
        Some(frame.ret_pc)
    }
}

/// 64-bit arithmetic; `None` for an unknown operation
#[inline]
pub fn alu64(op: u8, dst: u64, src: u64) -> Option<u64> {
    Some(match op {
        alu::ADD => dst.wrapping_add(src),
        alu::SUB => dst.wrapping_sub(src),
        alu::MUL => dst.wrapping_mul(src),
        alu::DIV => dst.checked_div(src).unwrap_or(0),
        alu::OR => dst | src,
        alu::AND => dst & src,
        alu::LSH => dst << (src & 63),
        alu::RSH => dst >> (src & 63),
        alu::NEG => dst.wrapping_neg(),
        alu::MOD => dst.checked_rem(src).unwrap_or(dst),
        alu::XOR => dst ^ src,
        alu::MOV => src,
        alu::ARSH => ((dst as i64) >> (src & 63)) as u64,
        _ => return None,
    })
}

/// 32-bit arithmetic, result zero-extended; `None` for an unknown operation
#[inline]
pub fn alu32(op: u8, dst: u32, src: u32) -> Option<u64> {
    let value = match op {
        alu::ADD => dst.wrapping_add(src),
        alu::SUB => dst.wrapping_sub(src),
        alu::MUL => dst.wrapping_mul(src),
        alu::DIV => dst.checked_div(src).unwrap_or(0),
        alu::OR => dst | src,
        alu::AND => dst & src,
        alu::LSH => dst << (src & 31),
        alu::RSH => dst >> (src & 31),
        alu::NEG => dst.wrapping_neg(),
        alu::MOD => dst.checked_rem(src).unwrap_or(dst),
        alu::XOR => dst ^ src,
        alu::MOV => src,
        alu::ARSH => ((dst as i32) >> (src & 31)) as u32,
        _ => return None,
    };
    Some(u64::from(value))
}

/// Byte-order conversion of the low `width` bits
#[inline]
pub fn byte_swap(kind: u8, width: i32, value: u64) -> Option<u64> {
    let to_be = kind == endian::TO_BE;
    Some(match width {
        16 if to_be => u64::from((value as u16).to_be()),
        16 => u64::from((value as u16).to_le()),
        32 if to_be => u64::from((value as u32).to_be()),
        32 => u64::from((value as u32).to_le()),
        64 if to_be => value.to_be(),
        64 => value.to_le(),
        _ => return None,
    })
}

/// Branch condition on 64-bit operands; `None` for an unknown operation
#[inline]
pub fn jmp64(op: u8, dst: u64, src: u64) -> Option<bool> {
    Some(match op {
        jmp::JEQ => dst == src,
        jmp::JGT => dst > src,
        jmp::JGE => dst >= src,
        jmp::JSET => dst & src != 0,
        jmp::JNE => dst != src,
        jmp::JSGT => (dst as i64) > (src as i64),
        jmp::JSGE => (dst as i64) >= (src as i64),
        jmp::JLT => dst < src,
        jmp::JLE => dst <= src,
        jmp::JSLT => (dst as i64) < (src as i64),
        jmp::JSLE => (dst as i64) <= (src as i64),
        _ => return None,
    })
}

/// Branch condition on the low 32 bits of each operand
#[inline]
pub fn jmp32(op: u8, dst: u64, src: u64) -> Option<bool> {
    let (dst, src) = (dst as u32, src as u32);
    Some(match op {
        jmp::JEQ => dst == src,
        jmp::JGT => dst > src,
        jmp::JGE => dst >= src,
        jmp::JSET => dst & src != 0,
        jmp::JNE => dst != src,
        jmp::JSGT => (dst as i32) > (src as i32),
        jmp::JSGE => (dst as i32) >= (src as i32),
        jmp::JLT => dst < src,
        jmp::JLE => dst <= src,
        jmp::JSLT => (dst as i32) < (src as i32),
        jmp::JSLE => (dst as i32) <= (src as i32),
        _ => return None,
    })
}

/// Packet offset of `LD_IND`: 32-bit wrapping sum of register and immediate
#[inline]
pub fn ind_offset(reg: u64, imm: i32) -> i32 {
    (reg as u32).wrapping_add(imm as u32) as i32
}

/// Absolute target of a relative branch from `pc`
#[inline]
pub fn branch_target(pc: usize, rel: i64) -> Result<usize, Fault> {
    let target = pc as i64 + 1 + rel;
    usize::try_from(target).map_err(|_| Fault::PcOutOfRange { pc: target })
}
