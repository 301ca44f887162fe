//! PPC and PPC64 unwinding: CFI, then the back chain, then scanning.
//!
//! There is no separate frame pointer; each frame stores the previous
//! stack pointer at `0(r1)`, and the return address lives in the
//! caller's frame, at offset 8 (PPC) or 16 (PPC64).

use crate::context::RawContext;
use crate::frame::{CallStack, FrameTrust, StackFrame};
use crate::system_info::CpuArch;

use super::{cfi_caller_context, scan_for_return_address, WalkCtx};

#[rustfmt::skip]
static CALLEE_SAVES: &[&str] = &[
    "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22",
    "r23", "r24", "r25", "r26", "r27", "r28", "r29", "r30", "r31",
];

fn return_address_offset(arch: CpuArch) -> u64 {
    match arch {
        CpuArch::Ppc64 => 16,
        _ => 8,
    }
}

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
    if let Some(context) = back_chain_caller(ctx, last_frame) {
        return Some((context, FrameTrust::FramePointer));
    }
    if scan_allowed {
        if let Some(context) = scan_caller(ctx, last_frame) {
            return Some((context, FrameTrust::Scan));
        }
    }
    None
}

fn back_chain_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let arch = last_frame.context.arch();
    let sp = last_frame.context.get("r1")?;
    let caller_sp = ctx.read_word(sp)?;
    if caller_sp <= sp {
        return None;
    }
    // Thread entry points store 0 or 1 as the bottom return address;
    // treat both as the end of the stack rather than a phantom frame.
    let return_address = ctx.read_word(caller_sp + return_address_offset(arch))?;
    if return_address <= 1 {
        return None;
    }
    let mut context = RawContext::new(arch);
    context.set("srr0", return_address);
    context.set("r1", caller_sp);
    Some(context)
}

fn scan_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let sp = last_frame.context.get("r1")?;
    let is_context_frame = last_frame.trust == FrameTrust::Context;
    let (location, pc) = scan_for_return_address(ctx, sp, is_context_frame)?;
    let mut context = RawContext::new(last_frame.context.arch());
    context.set("srr0", pc);
    context.set("r1", location + ctx.word_size as u64);
    Some(context)
}
