use std::fmt;

use crate::context::RawContext;
use crate::module_list::ModuleInfo;

/// How a stack frame was recovered.
///
/// Ordered from least to most trustworthy, so `>` comparisons read
/// naturally: `FrameTrust::Cfi > FrameTrust::Scan`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameTrust {
    /// Synthetic frame for an inlined call, derived from its enclosing
    /// frame.
    Inline,
    /// Found by scanning the stack for plausible return addresses.
    Scan,
    /// Derived from a frame-pointer chain.
    FramePointer,
    /// Derived from call frame information.
    Cfi,
    /// The caller was already computed and cached by the snapshot writer.
    Prewalked,
    /// Given directly in the thread's CPU context.
    Context,
}

impl fmt::Display for FrameTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameTrust::Inline => "inline",
            FrameTrust::Scan => "scan",
            FrameTrust::FramePointer => "frame_pointer",
            FrameTrust::Cfi => "cfi",
            FrameTrust::Prewalked => "prewalked",
            FrameTrust::Context => "context",
        };
        f.write_str(name)
    }
}

/// One reconstructed call frame.
///
/// The walker fills in `instruction`, `trust`, `context` and `module`;
/// the resolver fills in the source info fields for modules it has
/// symbols for. Frames in modules without symbol data keep everything
/// else `None`.
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// The address to symbolicate. For the context frame this is the
    /// faulting instruction; for caller frames it is backed off from the
    /// return address so it lands inside the call instruction.
    pub instruction: u64,

    pub trust: FrameTrust,

    /// The registers recovered for this frame. Only the registers the
    /// unwind strategy reconstructed are valid.
    pub context: RawContext,

    pub module: Option<ModuleInfo>,

    pub function_name: Option<String>,
    /// Absolute address of the start of the enclosing function.
    pub function_base: Option<u64>,
    /// Bytes of outgoing parameters popped by the function on return.
    /// Used by x86 Windows unwinding.
    pub parameter_size: u32,
    /// More than one function in the module claimed this name/address.
    pub is_multiple: bool,

    pub source_file: Option<String>,
    pub source_line: Option<u32>,
    /// Absolute address of the start of the line record that covered
    /// `instruction`.
    pub source_line_base: Option<u64>,
}

impl StackFrame {
    pub fn from_context(context: RawContext, trust: FrameTrust) -> Self {
        let instruction = context.instruction_pointer().unwrap_or(0);
        Self {
            instruction,
            trust,
            context,
            module: None,
            function_name: None,
            function_base: None,
            parameter_size: 0,
            is_multiple: false,
            source_file: None,
            source_line: None,
            source_line_base: None,
        }
    }

    /// The exact return address stored for this frame, as opposed to the
    /// backed-off `instruction`.
    pub fn return_address(&self) -> Option<u64> {
        self.context.instruction_pointer()
    }
}

/// The ordered frames reconstructed for one thread, outermost last.
#[derive(Default, Debug)]
pub struct CallStack {
    pub frames: Vec<StackFrame>,
    /// True when the walk stopped at the frame limit rather than at the
    /// end of the stack.
    pub frames_truncated: bool,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently pushed frame that is not an inline expansion.
    pub fn last_real_frame(&self) -> Option<&StackFrame> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.trust != FrameTrust::Inline)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trust_ordering() {
        assert!(FrameTrust::Context > FrameTrust::Prewalked);
        assert!(FrameTrust::Prewalked > FrameTrust::Cfi);
        assert!(FrameTrust::Cfi > FrameTrust::FramePointer);
        assert!(FrameTrust::FramePointer > FrameTrust::Scan);
        assert!(FrameTrust::Scan > FrameTrust::Inline);
    }
}
