//! ARM64 unwinding: CFI, then the frame-pointer pair, then scanning,
//! with pointer-authentication stripping throughout.
//!
//! Signed return addresses keep their authentication code in the high
//! pointer bits. The mask of plausibly-real address bits is derived
//! from the highest loaded module's end address; a stripped value is
//! only believed when it lands inside a known module.

use crate::context::RawContext;
use crate::frame::{CallStack, FrameTrust, StackFrame};
use crate::module_list::ModuleList;
use crate::system_info::CpuArch;

use super::{cfi_caller_context, scan_for_return_address, WalkCtx};

// x19..x29 per the AArch64 procedure call standard.
static CALLEE_SAVES: &[&str] = &[
    "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "x29",
];

/// Smallest all-ones mask covering every loaded code address.
pub(super) fn ptr_auth_mask(modules: &ModuleList) -> u64 {
    let top = modules.max_known_address();
    if top == 0 {
        return u64::MAX;
    }
    let mut mask = top - 1;
    mask |= mask >> 1;
    mask |= mask >> 2;
    mask |= mask >> 4;
    mask |= mask >> 8;
    mask |= mask >> 16;
    mask |= mask >> 32;
    mask
}

fn ptr_auth_strip(modules: &ModuleList, mask: u64, ptr: u64) -> u64 {
    let stripped = ptr & mask;
    if modules.module_at(stripped).is_some() {
        stripped
    } else {
        ptr
    }
}

/// The context frame's link register may carry an authentication code;
/// strip it before the first unwind consumes it.
pub(super) fn strip_context_link_register(
    context: &mut RawContext,
    mask: u64,
    modules: &ModuleList,
) {
    if let Some(lr) = context.get("x30") {
        context.set("x30", ptr_auth_strip(modules, mask, lr));
    }
}

pub(super) fn caller_context(
    ctx: &WalkCtx,
    stack: &CallStack,
    scan_allowed: bool,
    mask: u64,
) -> Option<(RawContext, FrameTrust)> {
    let last_frame = stack.last_real_frame()?;

    if let Some(cfi) = ctx.db.find_cfi_frame_info(last_frame) {
        if let Some(mut context) =
            cfi_caller_context(ctx, &cfi, &last_frame.context, CALLEE_SAVES)
        {
            if let Some(pc) = context.get("pc") {
                context.set("pc", ptr_auth_strip(ctx.modules, mask, pc));
            }
            return Some((context, FrameTrust::Cfi));
        }
    }
    if let Some(context) = frame_pointer_caller(ctx, stack, last_frame, mask) {
        return Some((context, FrameTrust::FramePointer));
    }
    if scan_allowed {
        if let Some(context) = scan_caller(ctx, last_frame) {
            return Some((context, FrameTrust::Scan));
        }
    }
    None
}

fn frame_pointer_caller(
    ctx: &WalkCtx,
    stack: &CallStack,
    last_frame: &StackFrame,
    mask: u64,
) -> Option<RawContext> {
    let callee_lr = match last_frame.context.get("x30") {
        Some(lr) => lr,
        // An unwound frame that did not recover lr: the callee's saved
        // frame-pointer pair may still name it.
        None => recover_link_register(ctx, stack, last_frame, mask)?,
    };

    let fp = last_frame.context.get("x29")?;
    let (caller_fp, caller_lr, caller_sp) = if fp != 0 {
        (
            ctx.memory.read_u64(fp)?,
            ptr_auth_strip(ctx.modules, mask, ctx.memory.read_u64(fp + 8)?),
            fp + 16,
        )
    } else {
        (0, 0, last_frame.context.get("sp")?)
    };

    let mut context = RawContext::new(CpuArch::Arm64);
    context.set("pc", ptr_auth_strip(ctx.modules, mask, callee_lr));
    context.set("x30", caller_lr);
    context.set("x29", caller_fp);
    context.set("sp", caller_sp);
    Some(context)
}

/// Re-derive the callee's link register from the frame-pointer pair its
/// own callee saved, when the CFI for the callee did not recover lr.
fn recover_link_register(
    ctx: &WalkCtx,
    stack: &CallStack,
    last_frame: &StackFrame,
    mask: u64,
) -> Option<u64> {
    let fp = last_frame.context.get("x29")?;
    let sp = last_frame.context.get("sp")?;
    if fp <= sp {
        return None;
    }
    let callee = stack
        .frames
        .iter()
        .rev()
        .filter(|f| f.trust != FrameTrust::Inline)
        .nth(1)?;
    let callee_fp = callee.context.get("x29")?;
    if callee_fp == 0 {
        return None;
    }
    // Only trust the saved pair if it agrees with the frame pointer the
    // unwind recovered.
    let saved_fp = ctx.memory.read_u64(callee_fp)?;
    if saved_fp != fp {
        return None;
    }
    let saved_lr = ctx.memory.read_u64(callee_fp + 8)?;
    Some(ptr_auth_strip(ctx.modules, mask, saved_lr))
}

fn scan_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let sp = last_frame.context.get("sp")?;
    let is_context_frame = last_frame.trust == FrameTrust::Context;
    let (location, pc) = scan_for_return_address(ctx, sp, is_context_frame)?;
    let mut context = RawContext::new(CpuArch::Arm64);
    context.set("pc", pc);
    context.set("sp", location + 8);
    Some(context)
}
