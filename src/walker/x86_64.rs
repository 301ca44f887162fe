//! x86_64 unwinding: CFI, then the %rbp chain, then scanning.

use crate::context::RawContext;
use crate::frame::{CallStack, FrameTrust, StackFrame};
use crate::system_info::CpuArch;

use super::{cfi_caller_context, scan_for_return_address, WalkCtx};

static CALLEE_SAVES: &[&str] = &["rbx", "rbp", "r12", "r13", "r14", "r15"];

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
    let rbp = last_frame.context.get("rbp")?;
    let caller_rbp = ctx.memory.read_u64(rbp)?;
    let caller_rip = ctx.memory.read_u64(rbp + 8)?;
    let mut context = RawContext::new(CpuArch::X86_64);
    context.set("rip", caller_rip);
    context.set("rsp", rbp + 16);
    context.set("rbp", caller_rbp);
    Some(context)
}

fn scan_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let sp = last_frame.context.get("rsp")?;
    let is_context_frame = last_frame.trust == FrameTrust::Context;
    let (location, rip) = scan_for_return_address(ctx, sp, is_context_frame)?;
    let mut context = RawContext::new(CpuArch::X86_64);
    context.set("rip", rip);
    context.set("rsp", location + 8);
    Some(context)
}
