//! RISC-V unwinding: CFI, then the frame-pointer convention, then
//! scanning.
//!
//! With `-fno-omit-frame-pointer`, `s0` points at the CFA; the return
//! address is saved at `s0 - 8` and the caller's frame pointer at
//! `s0 - 16`.

use crate::context::RawContext;
use crate::frame::{CallStack, FrameTrust, StackFrame};
use crate::system_info::CpuArch;

use super::{cfi_caller_context, scan_for_return_address, WalkCtx};

static CALLEE_SAVES: &[&str] = &[
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
];

pub(super) fn caller_context(
    ctx: &WalkCtx,
    stack: &CallStack,
    scan_allowed: bool,
) -> Option<(RawContext, FrameTrust)> {
    let last_frame = stack.last_real_frame()?;

    if let Some(cfi) = ctx.db.find_cfi_frame_info(last_frame) {
        if let Some(context) = cfi_caller_context(ctx, &cfi, &last_frame.context, CALLEE_SAVES) {
            return Some((context, FrameTrust::Cfi));
        }
    }
    if let Some(context) = frame_pointer_caller(ctx, last_frame) {
        return Some((context, FrameTrust::FramePointer));
    }
    if scan_allowed {
        if let Some(context) = scan_caller(ctx, last_frame) {
            return Some((context, FrameTrust::Scan));
        }
    }
    None
}

fn frame_pointer_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let fp = last_frame.context.get("s0")?;
    if fp < 16 {
        return None;
    }
    let caller_pc = ctx.memory.read_u64(fp - 8)?;
    let caller_fp = ctx.memory.read_u64(fp - 16)?;
    let mut context = RawContext::new(CpuArch::Riscv);
    context.set("pc", caller_pc);
    context.set("sp", fp);
    context.set("s0", caller_fp);
    Some(context)
}

fn scan_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let sp = last_frame.context.get("sp")?;
    let is_context_frame = last_frame.trust == FrameTrust::Context;
    let (location, pc) = scan_for_return_address(ctx, sp, is_context_frame)?;
    let mut context = RawContext::new(CpuArch::Riscv);
    context.set("pc", pc);
    context.set("sp", location + 8);
    Some(context)
}
