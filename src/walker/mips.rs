//! MIPS unwinding: CFI, then `$ra` for the frame that faulted, then
//! scanning. Without unwind data there is no way to recover a saved
//! `$ra` from an arbitrary frame, so the register itself is only
//! trusted straight out of the context.

use crate::context::RawContext;
use crate::frame::{CallStack, FrameTrust, StackFrame};
use crate::system_info::CpuArch;

use super::{cfi_caller_context, scan_for_return_address, WalkCtx};

static CALLEE_SAVES: &[&str] = &["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "gp", "fp"];

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
    if last_frame.trust == FrameTrust::Context {
        if let Some(context) = link_register_caller(last_frame) {
            return Some((context, FrameTrust::FramePointer));
        }
    }
    if scan_allowed {
        if let Some(context) = scan_caller(ctx, last_frame) {
            return Some((context, FrameTrust::Scan));
        }
    }
    None
}

fn link_register_caller(last_frame: &StackFrame) -> Option<RawContext> {
    let ra = last_frame.context.get("ra")?;
    let sp = last_frame.context.get("sp")?;
    if ra <= 1 {
        return None;
    }
    let mut context = RawContext::new(CpuArch::Mips);
    context.set("pc", ra);
    // The faulting function has not moved the stack pointer yet; the
    // first-unwind rule tolerates the equal SP.
    context.set("sp", sp);
    Some(context)
}

fn scan_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let sp = last_frame.context.get("sp")?;
    let is_context_frame = last_frame.trust == FrameTrust::Context;
    let (location, pc) = scan_for_return_address(ctx, sp, is_context_frame)?;
    let mut context = RawContext::new(CpuArch::Mips);
    context.set("pc", pc);
    context.set("sp", location + 4);
    Some(context)
}
