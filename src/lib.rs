//! Post-mortem stack walking and symbolication for crashed processes.
//!
//! `retrace` reconstructs a symbolic call stack from the raw snapshot of
//! a crashed process: a CPU register context, the memory pages backing
//! the thread's stack, and the list of loaded modules. Symbol and
//! unwind information comes from text symbol files (or a DWARF DIE
//! event stream) loaded into a [`SymbolDatabase`]; the walker recovers
//! caller frames with call-frame information where available, falling
//! back to frame-pointer chains and bounded stack scanning, and labels
//! every frame with how much it should be trusted.
//!
//! Reading minidumps or core files, extracting debug info from
//! binaries, and capturing the snapshot are the host's job; everything
//! here is deterministic computation over the data handed in.
//!
//! ```
//! use retrace::{
//!     walk_stack, CpuArch, MemorySnapshot, ModuleInfo, ModuleList, Os, RawContext,
//!     SymbolDatabase, SystemInfo, WalkOptions,
//! };
//!
//! let module = ModuleInfo::new("app", 0x400000, 0x10000);
//! let mut db = SymbolDatabase::new();
//! db.load_module(
//!     &module,
//!     b"MODULE linux x86 531EAE66D56B1A9C8124E2BE2AD7E1110 app\n\
//!       FILE 1 app.c\n\
//!       FUNC 1000 20 0 main\n\
//!       1000 20 7 1\n",
//! );
//!
//! let mut context = RawContext::new(CpuArch::X86);
//! context.set("eip", 0x401010);
//! context.set("esp", 0x80000);
//!
//! let stack_bytes = [0u8; 64];
//! let memory = MemorySnapshot::new(0x80000, &stack_bytes);
//! let modules = ModuleList::from_modules(vec![module]);
//! let system_info = SystemInfo::new(Os::Linux, CpuArch::X86);
//!
//! let stack = walk_stack(&system_info, &context, &memory, &modules, &db, WalkOptions::default());
//! let frame = &stack.frames[0];
//! assert_eq!(frame.function_name.as_deref(), Some("main"));
//! assert_eq!(frame.source_file.as_deref(), Some("app.c"));
//! assert_eq!(frame.source_line, Some(7));
//! ```

mod cfi;
mod context;
mod demangle;
mod display_utils;
mod dwarf;
mod error;
mod frame;
mod lang;
mod memory;
mod module;
mod module_list;
mod packed;
mod range_map;
mod reporter;
mod resolver;
mod sym;
mod system_info;
mod walker;
mod winframe;

pub use cfi::CfiFrameInfo;
pub use context::RawContext;
pub use demangle::{demangle, demangle_or_keep, detect_scheme, ManglingScheme};
pub use dwarf::{CuAssembler, InterCuTable, LineReadError, LineToModule, RangesReader};
pub use error::{Error, PackedError, RangeError};
pub use frame::{CallStack, FrameTrust, StackFrame};
pub use lang::SourceLanguage;
pub use memory::{Endian, MemoryRegion, MemorySnapshot};
pub use module::{CfiEntry, Function, Inline, InlineOrigin, Line, PublicSymbol, SymbolModule};
pub use module_list::{ModuleInfo, ModuleList};
pub use packed::PackedModule;
pub use reporter::{LogReporter, Reporter};
pub use resolver::{LoadResult, SymbolDatabase};
pub use sym::{parse_symbol_file, MAX_SYMBOL_LINE_LEN};
pub use system_info::{CpuArch, Os, SystemInfo};
pub use walker::{walk_stack, FrameIterator, WalkOptions, Walker};
pub use winframe::{eval_program_string, WinCalleeRegs, WindowsFrameInfo, WindowsFrameType};

/// The DWARF constant vocabulary consumed by [`CuAssembler`] events.
pub use gimli;
