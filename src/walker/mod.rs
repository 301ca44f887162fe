//! The stack walker: drives per-architecture unwind strategies across a
//! thread's stack and assembles the symbolicated call stack.

mod arm;
mod arm64;
mod mips;
mod ppc;
mod riscv;
mod x86;
mod x86_64;

use std::collections::{HashMap, VecDeque};

use fallible_iterator::FallibleIterator;
use tracing::trace;

use crate::cfi::CfiFrameInfo;
use crate::context::RawContext;
use crate::error::Error;
use crate::frame::{CallStack, FrameTrust, StackFrame};
use crate::memory::MemoryRegion;
use crate::module_list::ModuleList;
use crate::resolver::SymbolDatabase;
use crate::system_info::{CpuArch, Os, SystemInfo};

/// Knobs for one stack walk.
#[derive(Clone, Copy, Debug)]
pub struct WalkOptions {
    /// Upper bound on emitted frames, inline frames included.
    pub max_frames: usize,
    /// Stack scanning is only attempted while the stack is shorter than
    /// this.
    pub max_scanned_frames: usize,
    /// Allow a scan to follow a frame that was itself found by
    /// scanning. Off by default: two scans in a row compound guesses.
    pub scan_after_scan: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_frames: 1024,
            max_scanned_frames: 1024,
            scan_after_scan: false,
        }
    }
}

/// Everything a per-architecture strategy needs to look around.
pub(crate) struct WalkCtx<'a> {
    pub memory: &'a dyn MemoryRegion,
    pub modules: &'a ModuleList,
    pub db: &'a SymbolDatabase,
    pub os: Os,
    pub word_size: u8,
}

impl<'a> WalkCtx<'a> {
    fn read_word(&self, address: u64) -> Option<u64> {
        self.memory.read_word(address, self.word_size)
    }
}

/// Number of words inspected by a stack scan. The window right after
/// the context frame is larger because the faulting function may not
/// have pushed anything yet.
const SCAN_WORDS_FROM_CONTEXT: u64 = 40;
const SCAN_WORDS: u64 = 16;

pub(crate) fn instruction_seems_valid(ctx: &WalkCtx, address: u64) -> bool {
    address != 0 && ctx.modules.module_at(address).is_some()
}

/// Scan up the stack from `sp` for the first word that looks like a
/// return address. Returns the word's location and value.
pub(crate) fn scan_for_return_address(
    ctx: &WalkCtx,
    sp: u64,
    is_context_frame: bool,
) -> Option<(u64, u64)> {
    let words = if is_context_frame {
        SCAN_WORDS_FROM_CONTEXT
    } else {
        SCAN_WORDS
    };
    for i in 0..words {
        let location = sp.checked_add(i * ctx.word_size as u64)?;
        let candidate = ctx.read_word(location)?;
        if instruction_seems_valid(ctx, candidate) {
            trace!(location, candidate, "scan found plausible return address");
            return Some((location, candidate));
        }
    }
    None
}

/// Generic CFI step: snapshot the callee's valid registers, evaluate the
/// rules, and build the caller context. Callee-saved registers the rules
/// do not mention keep the callee's value; PC and SP fall back to `.ra`
/// and `.cfa`.
pub(crate) fn cfi_caller_context(
    ctx: &WalkCtx,
    cfi: &CfiFrameInfo,
    callee_context: &RawContext,
    callee_saves: &[&str],
) -> Option<RawContext> {
    let callee: HashMap<&str, u64> = callee_context.iter_valid().collect();
    let caller = cfi.find_caller_regs(&callee, ctx.word_size, ctx.memory)?;

    let arch = callee_context.arch();
    let mut new_context = RawContext::new(arch);
    for (name, value) in &caller {
        if !name.starts_with('.') {
            new_context.set(name, *value);
        }
    }
    for &reg in callee_saves {
        if !new_context.is_valid(reg) {
            if let Some(value) = callee_context.get(reg) {
                new_context.set(reg, value);
            }
        }
    }
    if new_context.instruction_pointer().is_none() {
        new_context.set_instruction_pointer(caller[".ra"]);
    }
    if new_context.stack_pointer().is_none() {
        new_context.set_stack_pointer(caller[".cfa"]);
    }
    Some(new_context)
}

/// Parameter size of the frame below the most recent real frame, for
/// x86 Windows unwinding.
pub(crate) fn grand_callee_parameter_size(stack: &CallStack) -> u32 {
    stack
        .frames
        .iter()
        .rev()
        .filter(|f| f.trust != FrameTrust::Inline)
        .nth(1)
        .map_or(0, |f| f.parameter_size)
}

/// End-of-stack and no-progress checks shared by every architecture.
fn terminate_walk(
    caller_pc: u64,
    caller_sp: u64,
    callee_sp: u64,
    first_unwind: bool,
    memory: &dyn MemoryRegion,
) -> bool {
    if caller_pc == 0 {
        return true;
    }
    // A caller frame must live higher on the stack than its callee. The
    // first unwind tolerates an equal SP: the faulting function may not
    // have set up a frame yet.
    if first_unwind {
        if caller_sp < callee_sp {
            return true;
        }
    } else if caller_sp <= callee_sp {
        return true;
    }
    let stack_end = memory.base_address() + memory.size();
    if caller_sp < memory.base_address() || caller_sp > stack_end {
        return true;
    }
    false
}

/// Distance from a return address back into its call instruction, so
/// line lookups land on the call site rather than the return site.
fn return_address_to_instruction(arch: CpuArch, return_address: u64) -> u64 {
    match arch {
        // Variable-width instructions; one byte in is enough.
        CpuArch::X86 | CpuArch::X86_64 => return_address.saturating_sub(1),
        CpuArch::Arm => {
            if return_address & 1 != 0 {
                // Thumb: the low bit flags the mode and is not part of
                // the address.
                (return_address & !1).saturating_sub(2)
            } else {
                return_address.saturating_sub(4)
            }
        }
        CpuArch::Arm64 | CpuArch::Mips | CpuArch::Riscv | CpuArch::Ppc => {
            return_address.saturating_sub(4)
        }
        CpuArch::Ppc64 => return_address.saturating_sub(8),
    }
}

enum ArchState {
    Plain,
    Arm64 { ptr_auth_mask: u64 },
}

/// Walks one thread's stack. Construction picks the architecture
/// strategy from the CPU context; [`get_context_frame`] and
/// [`get_caller_frame`] are the two primitive operations, and
/// [`iter_frames`] / [`walk_stack`] drive them to completion with
/// symbolication and inline expansion.
///
/// [`get_context_frame`]: Self::get_context_frame
/// [`get_caller_frame`]: Self::get_caller_frame
/// [`iter_frames`]: Self::iter_frames
pub struct Walker<'a> {
    context: &'a RawContext,
    memory: &'a dyn MemoryRegion,
    modules: &'a ModuleList,
    db: &'a SymbolDatabase,
    os: Os,
    options: WalkOptions,
    arch_state: ArchState,
}

impl<'a> Walker<'a> {
    pub fn new(
        system_info: &SystemInfo,
        context: &'a RawContext,
        memory: &'a dyn MemoryRegion,
        modules: &'a ModuleList,
        db: &'a SymbolDatabase,
        options: WalkOptions,
    ) -> Self {
        let arch_state = match context.arch() {
            CpuArch::Arm64 => ArchState::Arm64 {
                ptr_auth_mask: arm64::ptr_auth_mask(modules),
            },
            _ => ArchState::Plain,
        };
        Self {
            context,
            memory,
            modules,
            db,
            os: system_info.os,
            options,
            arch_state,
        }
    }

    fn walk_ctx(&self) -> WalkCtx<'_> {
        WalkCtx {
            memory: self.memory,
            modules: self.modules,
            db: self.db,
            os: self.os,
            word_size: self.context.arch().word_size(),
        }
    }

    /// The frame the CPU was executing when the snapshot was taken.
    /// `None` when the context has no valid instruction pointer.
    pub fn get_context_frame(&self) -> Option<StackFrame> {
        let mut context = self.context.clone();
        context.instruction_pointer()?;
        if let ArchState::Arm64 { ptr_auth_mask } = self.arch_state {
            arm64::strip_context_link_register(&mut context, ptr_auth_mask, self.modules);
        }
        let mut frame = StackFrame::from_context(context, FrameTrust::Context);
        frame.module = self.modules.module_at(frame.instruction).cloned();
        Some(frame)
    }

    /// Compute the caller of the most recent frame in `stack`, trying
    /// CFI, then frame-pointer (or back-chain) unwinding, then, when
    /// `stack_scan_allowed`, a bounded stack scan. `None` ends the walk.
    pub fn get_caller_frame(
        &self,
        stack: &CallStack,
        stack_scan_allowed: bool,
    ) -> Option<StackFrame> {
        let last_frame = stack.last_real_frame()?;
        let ctx = self.walk_ctx();
        let (context, trust) = match (&self.arch_state, last_frame.context.arch()) {
            (ArchState::Arm64 { ptr_auth_mask }, _) => {
                arm64::caller_context(&ctx, stack, stack_scan_allowed, *ptr_auth_mask)
            }
            (_, CpuArch::X86) => x86::caller_context(&ctx, stack, stack_scan_allowed),
            (_, CpuArch::X86_64) => x86_64::caller_context(&ctx, stack, stack_scan_allowed),
            (_, CpuArch::Arm) => arm::caller_context(&ctx, stack, stack_scan_allowed),
            (_, CpuArch::Ppc | CpuArch::Ppc64) => {
                ppc::caller_context(&ctx, stack, stack_scan_allowed)
            }
            (_, CpuArch::Mips) => mips::caller_context(&ctx, stack, stack_scan_allowed),
            (_, CpuArch::Riscv) => riscv::caller_context(&ctx, stack, stack_scan_allowed),
            (ArchState::Plain, CpuArch::Arm64) => unreachable!("arm64 state set at construction"),
        }?;

        let caller_pc = context.instruction_pointer()?;
        let caller_sp = context.stack_pointer()?;
        let callee_sp = last_frame.context.stack_pointer().unwrap_or(0);
        let first_unwind = last_frame.trust == FrameTrust::Context;
        if terminate_walk(caller_pc, caller_sp, callee_sp, first_unwind, self.memory) {
            trace!(caller_pc, caller_sp, "walk termination invariant hit");
            return None;
        }

        let mut frame = StackFrame::from_context(context, trust);
        frame.instruction = return_address_to_instruction(frame.context.arch(), caller_pc);
        frame.module = self.modules.module_at(frame.instruction).cloned();
        Some(frame)
    }

    /// Iterate the full stack, frame by frame, symbolizing each one and
    /// expanding inlined calls into synthetic frames.
    pub fn iter_frames(&self) -> FrameIterator<'_, 'a> {
        FrameIterator {
            walker: self,
            stack: CallStack::new(),
            pending: VecDeque::new(),
            emitted: 0,
            state: IteratorState::Start,
        }
    }
}

enum IteratorState {
    Start,
    Walking,
    Done,
}

/// Yields symbolized frames, innermost first, with inline-expansion
/// frames (trust [`FrameTrust::Inline`]) inserted before their
/// enclosing frame.
///
/// Completes with `Ok(None)` at the end of the stack; yields
/// [`Error::FrameLimitReached`] when the frame bound cut the walk
/// short, and [`Error::InvalidContext`] when there was nothing to walk.
pub struct FrameIterator<'w, 'a> {
    walker: &'w Walker<'a>,
    /// Real frames only; what the unwind strategies look at.
    stack: CallStack,
    pending: VecDeque<StackFrame>,
    emitted: usize,
    state: IteratorState,
}

impl<'w, 'a> FrameIterator<'w, 'a> {
    /// Symbolize a freshly unwound frame and queue it, preceded by its
    /// inline expansion.
    fn push_frame(&mut self, mut frame: StackFrame) {
        let mut inline_frames = Vec::new();
        self.walker
            .db
            .fill_source_line_info(&mut frame, &mut inline_frames);
        self.stack.frames.push(frame.clone());
        self.pending.extend(inline_frames);
        self.pending.push_back(frame);
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<StackFrame>, Error> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                if self.emitted >= self.walker.options.max_frames {
                    self.state = IteratorState::Done;
                    self.pending.clear();
                    return Err(Error::FrameLimitReached);
                }
                self.emitted += 1;
                return Ok(Some(frame));
            }
            match self.state {
                IteratorState::Start => {
                    self.state = IteratorState::Walking;
                    match self.walker.get_context_frame() {
                        Some(frame) => self.push_frame(frame),
                        None => {
                            self.state = IteratorState::Done;
                            return Err(Error::InvalidContext);
                        }
                    }
                }
                IteratorState::Walking => {
                    let last_trust = self
                        .stack
                        .last_real_frame()
                        .map_or(FrameTrust::Context, |f| f.trust);
                    let scan_allowed = (self.walker.options.scan_after_scan
                        || last_trust != FrameTrust::Scan)
                        && self.stack.frames.len() <= self.walker.options.max_scanned_frames;
                    match self.walker.get_caller_frame(&self.stack, scan_allowed) {
                        Some(frame) => self.push_frame(frame),
                        None => {
                            self.state = IteratorState::Done;
                            return Ok(None);
                        }
                    }
                }
                IteratorState::Done => return Ok(None),
            }
        }
    }
}

impl<'w, 'a> FallibleIterator for FrameIterator<'w, 'a> {
    type Item = StackFrame;
    type Error = Error;

    fn next(&mut self) -> Result<Option<StackFrame>, Error> {
        self.next()
    }
}

/// Walk one thread's stack to completion.
pub fn walk_stack(
    system_info: &SystemInfo,
    context: &RawContext,
    memory: &dyn MemoryRegion,
    modules: &ModuleList,
    db: &SymbolDatabase,
    options: WalkOptions,
) -> CallStack {
    let walker = Walker::new(system_info, context, memory, modules, db, options);
    let mut iterator = walker.iter_frames();
    let mut stack = CallStack::new();
    loop {
        match iterator.next() {
            Ok(Some(frame)) => stack.frames.push(frame),
            Ok(None) => break,
            Err(Error::FrameLimitReached) => {
                stack.frames_truncated = true;
                break;
            }
            Err(_) => break,
        }
    }
    stack
}
