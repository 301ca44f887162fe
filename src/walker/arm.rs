//! ARM unwinding: CFI, then the frame-pointer pair (r7 on Apple
//! platforms, r11 elsewhere), then scanning. Thumb return addresses
//! carry their mode bit through; only the instruction back-off strips
//! it.

use crate::context::RawContext;
use crate::frame::{CallStack, FrameTrust, StackFrame};
use crate::system_info::{CpuArch, Os};

use super::{cfi_caller_context, scan_for_return_address, WalkCtx};

static CALLEE_SAVES: &[&str] = &["r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11"];

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

fn frame_pointer_register(os: Os) -> &'static str {
    match os {
        Os::Ios | Os::MacOs => "r7",
        _ => "r11",
    }
}

fn frame_pointer_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let fp_register = frame_pointer_register(ctx.os);
    let fp = last_frame.context.get(fp_register)?;
    if fp == 0 {
        return None;
    }
    // The saved pair is {caller fp, caller lr}; the return address into
    // the caller is our own lr.
    let caller_pc = last_frame.context.get("lr")?;
    let caller_fp = ctx.memory.read_u32(fp)?;
    let caller_lr = ctx.memory.read_u32(fp + 4)?;
    let mut context = RawContext::new(CpuArch::Arm);
    context.set("pc", caller_pc);
    context.set("lr", caller_lr as u64);
    context.set(fp_register, caller_fp as u64);
    context.set("sp", fp + 8);
    Some(context)
}

fn scan_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let sp = last_frame.context.get("sp")?;
    let is_context_frame = last_frame.trust == FrameTrust::Context;
    let (location, pc) = scan_for_return_address(ctx, sp, is_context_frame)?;
    let mut context = RawContext::new(CpuArch::Arm);
    context.set("pc", pc);
    context.set("sp", location + 4);
    Some(context)
}
