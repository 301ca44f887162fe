//! x86 unwinding: `STACK WIN` frame data, then CFI, then the %ebp
//! chain, then scanning.

use crate::context::RawContext;
use crate::frame::{CallStack, FrameTrust, StackFrame};
use crate::system_info::CpuArch;
use crate::winframe::{eval_program_string, WinCalleeRegs, WindowsFrameInfo};

use super::{
    cfi_caller_context, grand_callee_parameter_size, scan_for_return_address, WalkCtx,
};

static CALLEE_SAVES: &[&str] = &["ebp", "ebx", "esi", "edi"];

pub(super) fn caller_context(
    ctx: &WalkCtx,
    stack: &CallStack,
    scan_allowed: bool,
) -> Option<(RawContext, FrameTrust)> {
    let last_frame = stack.last_real_frame()?;

    if let Some(info) = ctx.db.find_windows_frame_info(last_frame) {
        if let Some(context) = windows_frame_caller(ctx, stack, last_frame, &info) {
            return Some((context, FrameTrust::Cfi));
        }
    }
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

fn windows_frame_caller(
    ctx: &WalkCtx,
    stack: &CallStack,
    last_frame: &StackFrame,
    info: &WindowsFrameInfo,
) -> Option<RawContext> {
    let esp = last_frame.context.get("esp")? as u32;
    let ebp = last_frame.context.get("ebp")? as u32;
    let grand_callee = grand_callee_parameter_size(stack);

    match info.program_string.as_deref() {
        Some(program) => {
            let callee = WinCalleeRegs {
                esp,
                ebp,
                ebx: last_frame.context.get("ebx").map(|v| v as u32),
            };
            let regs = eval_program_string(info, program, callee, grand_callee, ctx.memory)?;
            let mut context = RawContext::new(CpuArch::X86);
            for (name, value) in &regs {
                context.set(name, *value as u64);
            }
            // A frame without instruction and stack pointers is useless.
            context.get("eip")?;
            context.get("esp")?;
            Some(context)
        }
        None => {
            // FPO: fixed frame dimensions, return address at the top of
            // the frame.
            let frame_size = info.frame_size(grand_callee) as u64;
            let eip = ctx.memory.read_u32(esp as u64 + frame_size)?;
            let mut context = RawContext::new(CpuArch::X86);
            context.set("eip", eip as u64);
            context.set("esp", esp as u64 + frame_size + 4);
            if info.allocates_base_pointer {
                let ebp_address = esp as u64
                    + grand_callee as u64
                    + info.saved_register_size as u64
                    - 8;
                context.set("ebp", ctx.memory.read_u32(ebp_address)? as u64);
            } else {
                // Forwarding functions leave %ebp and %ebx untouched;
                // propagating them helps the next frame.
                context.set("ebp", ebp as u64);
                if let Some(ebx) = last_frame.context.get("ebx") {
                    context.set("ebx", ebx);
                }
            }
            Some(context)
        }
    }
}

fn frame_pointer_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let ebp = last_frame.context.get("ebp")?;
    let caller_ebp = ctx.memory.read_u32(ebp)?;
    let caller_eip = ctx.memory.read_u32(ebp + 4)?;
    let mut context = RawContext::new(CpuArch::X86);
    context.set("eip", caller_eip as u64);
    context.set("esp", ebp + 8);
    context.set("ebp", caller_ebp as u64);
    Some(context)
}

fn scan_caller(ctx: &WalkCtx, last_frame: &StackFrame) -> Option<RawContext> {
    let sp = last_frame.context.get("esp")?;
    let is_context_frame = last_frame.trust == FrameTrust::Context;
    let (location, eip) = scan_for_return_address(ctx, sp, is_context_frame)?;
    let mut context = RawContext::new(CpuArch::X86);
    context.set("eip", eip);
    context.set("esp", location + 4);
    Some(context)
}
