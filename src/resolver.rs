//! The symbol database: loads per-module symbol data and answers frame
//! symbolication and unwind-info queries.
//!
//! Two interchangeable backends serve queries: the tree representation
//! built by the parser, and the flat serialized form from
//! [`serialize`](crate::packed). Both answer every query identically;
//! the shared logic below runs against an abstract view of either.

use std::collections::HashMap;

use tracing::trace;

use crate::cfi::CfiFrameInfo;
use crate::error::PackedError;
use crate::frame::{FrameTrust, StackFrame};
use crate::module::SymbolModule;
use crate::module_list::ModuleInfo;
use crate::packed::{self, PackedModule};
use crate::sym::parse_symbol_file;
use crate::winframe::WindowsFrameInfo;

/// Outcome of loading a symbol file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadResult {
    Loaded,
    /// The module loaded but parts of the input were malformed; queries
    /// run against whatever parsed.
    CorruptSymbols,
}

pub(crate) struct FuncView<'a> {
    pub name: &'a str,
    pub entry: u64,
    pub parameter_size: u32,
    pub is_multiple: bool,
    pub prefer_extern_name: bool,
}

#[derive(Clone, Copy)]
pub(crate) struct LineView {
    pub address: u64,
    pub file_id: u32,
    pub line: u32,
}

#[derive(Clone, Copy)]
pub(crate) struct InlineView {
    pub origin_id: u32,
    pub call_file: u32,
    pub call_line: u32,
    /// Start of the inline's range that covers the queried address.
    pub range_start: u64,
}

pub(crate) struct PublicView<'a> {
    pub address: u64,
    pub name: &'a str,
    pub parameter_size: u32,
    pub is_multiple: bool,
}

pub(crate) struct CfiRules<'a> {
    pub init: &'a str,
    /// The deltas at or below the queried address, in order.
    pub deltas: Vec<&'a str>,
}

/// The queries both resolver backends answer. Addresses are
/// module-relative.
pub(crate) trait SymbolView {
    fn is_corrupt(&self) -> bool;
    fn file_name(&self, id: u32) -> Option<&str>;
    fn origin_name(&self, id: u32) -> Option<&str>;
    /// Handle of the function covering `address`.
    fn function_at(&self, address: u64) -> Option<u32>;
    fn function(&self, handle: u32) -> Option<FuncView<'_>>;
    fn line_at(&self, handle: u32, address: u64) -> Option<LineView>;
    /// Inline chain covering `address`, innermost (deepest) first.
    fn inline_chain_at(&self, handle: u32, address: u64) -> Vec<InlineView>;
    fn public_at(&self, address: u64) -> Option<PublicView<'_>>;
    fn windows_frame_info_at(&self, address: u64) -> Option<WindowsFrameInfo>;
    fn cfi_rules_at(&self, address: u64) -> Option<CfiRules<'_>>;
}

impl SymbolView for SymbolModule {
    fn is_corrupt(&self) -> bool {
        self.is_corrupt
    }

    fn file_name(&self, id: u32) -> Option<&str> {
        SymbolModule::file_name(self, id)
    }

    fn origin_name(&self, id: u32) -> Option<&str> {
        self.inline_origin(id).map(|origin| origin.name.as_str())
    }

    fn function_at(&self, address: u64) -> Option<u32> {
        self.function_index_at(address).map(|i| i as u32)
    }

    fn function(&self, handle: u32) -> Option<FuncView<'_>> {
        let f = self.functions().get(handle as usize)?;
        Some(FuncView {
            name: &f.name,
            entry: f.entry(),
            parameter_size: f.parameter_size,
            is_multiple: f.is_multiple,
            prefer_extern_name: f.prefer_extern_name,
        })
    }

    fn line_at(&self, handle: u32, address: u64) -> Option<LineView> {
        let f = self.functions().get(handle as usize)?;
        let index = f.lines.partition_point(|line| line.address <= address);
        let line = f.lines.get(index.checked_sub(1)?)?;
        (address < line.end()).then_some(LineView {
            address: line.address,
            file_id: line.file_id,
            line: line.line,
        })
    }

    fn inline_chain_at(&self, handle: u32, address: u64) -> Vec<InlineView> {
        let Some(f) = self.functions().get(handle as usize) else {
            return Vec::new();
        };
        let mut chain: Vec<(u32, InlineView)> = f
            .inlines
            .iter()
            .filter_map(|inline| {
                let (range_start, _) = inline.range_at(address)?;
                Some((
                    inline.depth,
                    InlineView {
                        origin_id: inline.origin_id,
                        call_file: inline.call_file,
                        call_line: inline.call_line,
                        range_start,
                    },
                ))
            })
            .collect();
        chain.sort_by_key(|&(depth, _)| std::cmp::Reverse(depth));
        chain.into_iter().map(|(_, view)| view).collect()
    }

    fn public_at(&self, address: u64) -> Option<PublicView<'_>> {
        let public = SymbolModule::public_at(self, address)?;
        Some(PublicView {
            address: public.address,
            name: &public.name,
            parameter_size: public.parameter_size,
            is_multiple: public.is_multiple,
        })
    }

    fn windows_frame_info_at(&self, address: u64) -> Option<WindowsFrameInfo> {
        SymbolModule::windows_frame_info_at(self, address).cloned()
    }

    fn cfi_rules_at(&self, address: u64) -> Option<CfiRules<'_>> {
        let entry = self.cfi_entry_at(address)?;
        let deltas = entry
            .deltas
            .iter()
            .take_while(|&&(delta_address, _)| delta_address <= address)
            .map(|(_, rules)| rules.as_str())
            .collect();
        Some(CfiRules {
            init: &entry.init,
            deltas,
        })
    }
}

/// Fill a frame's source info and build its inline expansion frames,
/// innermost first.
pub(crate) fn fill_frame_from_view(
    view: &dyn SymbolView,
    module: &ModuleInfo,
    frame: &mut StackFrame,
    inline_frames: &mut Vec<StackFrame>,
) {
    let base = module.base_address;
    let Some(rva) = frame.instruction.checked_sub(base) else {
        return;
    };

    let Some(handle) = view.function_at(rva) else {
        // No function covers the address; a public symbol is the
        // fallback.
        if let Some(public) = view.public_at(rva) {
            frame.function_name = Some(public.name.to_string());
            frame.function_base = Some(base + public.address);
            frame.parameter_size = public.parameter_size;
            frame.is_multiple = public.is_multiple;
        }
        return;
    };
    let Some(function) = view.function(handle) else {
        return;
    };

    frame.function_name = Some(function.name.to_string());
    frame.function_base = Some(base + function.entry);
    frame.parameter_size = function.parameter_size;
    frame.is_multiple = function.is_multiple;
    if function.prefer_extern_name {
        // Debug info had no usable name here; a public symbol covering
        // the same code names it better.
        if let Some(public) = view.public_at(rva) {
            frame.function_name = Some(public.name.to_string());
            frame.function_base = Some(base + public.address);
            frame.parameter_size = public.parameter_size;
            frame.is_multiple = public.is_multiple;
        }
    }

    if let Some(line) = view.line_at(handle, rva) {
        frame.source_file = view.file_name(line.file_id).map(str::to_string);
        frame.source_line = Some(line.line);
        frame.source_line_base = Some(base + line.address);
    }

    let chain = view.inline_chain_at(handle, rva);
    if chain.is_empty() {
        return;
    }

    for (i, inline) in chain.iter().enumerate() {
        let mut inline_frame = StackFrame {
            instruction: frame.instruction,
            trust: FrameTrust::Inline,
            context: frame.context.clone(),
            module: Some(module.clone()),
            function_name: Some(
                view.origin_name(inline.origin_id)
                    .unwrap_or("<name omitted>")
                    .to_string(),
            ),
            function_base: Some(base + inline.range_start),
            parameter_size: 0,
            is_multiple: false,
            source_file: None,
            source_line: None,
            source_line_base: None,
        };
        if i == 0 {
            // The innermost inline owns the actual line record at this
            // address.
            inline_frame.source_file = frame.source_file.clone();
            inline_frame.source_line = frame.source_line;
            inline_frame.source_line_base = frame.source_line_base;
        } else {
            // Outer frames sit at the call site of the inline one level
            // deeper.
            let callee = &chain[i - 1];
            inline_frame.source_file = view.file_name(callee.call_file).map(str::to_string);
            inline_frame.source_line = Some(callee.call_line);
            inline_frame.source_line_base = Some(base + callee.range_start);
        }
        inline_frames.push(inline_frame);
    }

    // The enclosing function is now reported at the call site of its
    // outermost inlined call.
    let outermost = chain.last().unwrap();
    frame.source_file = view.file_name(outermost.call_file).map(str::to_string);
    frame.source_line = Some(outermost.call_line);
    frame.source_line_base = Some(base + outermost.range_start);
}

enum Backend {
    Parsed(SymbolModule),
    Packed(PackedModule),
}

impl Backend {
    fn view(&self) -> &dyn SymbolView {
        match self {
            Backend::Parsed(module) => module,
            Backend::Packed(module) => module,
        }
    }
}

/// Symbol data for all loaded modules, immutable between loads, keyed by
/// the module's code file.
///
/// Walks on different threads may query a shared database concurrently;
/// loading and unloading require exclusive access, which the borrow
/// checker enforces through `&mut self`.
#[derive(Default)]
pub struct SymbolDatabase {
    modules: HashMap<String, Backend>,
}

impl SymbolDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a text symbol file for `module`. A partially parseable
    /// file still loads, flagged [`LoadResult::CorruptSymbols`].
    pub fn load_module(&mut self, module: &ModuleInfo, symbol_bytes: &[u8]) -> LoadResult {
        let parsed = parse_symbol_file(symbol_bytes);
        self.load_assembled_module(module, parsed)
    }

    /// Load an already assembled [`SymbolModule`], e.g. one built by the
    /// DWARF CU assembler.
    pub fn load_assembled_module(
        &mut self,
        module: &ModuleInfo,
        mut symbols: SymbolModule,
    ) -> LoadResult {
        symbols.finalize();
        let result = if symbols.is_corrupt {
            LoadResult::CorruptSymbols
        } else {
            LoadResult::Loaded
        };
        self.modules
            .insert(module.key().to_string(), Backend::Parsed(symbols));
        result
    }

    /// Load a module from its serialized form without re-parsing.
    pub fn load_packed_module(
        &mut self,
        module: &ModuleInfo,
        data: Vec<u8>,
    ) -> Result<LoadResult, PackedError> {
        let packed = PackedModule::parse(data)?;
        let result = if packed.is_corrupt() {
            LoadResult::CorruptSymbols
        } else {
            LoadResult::Loaded
        };
        self.modules
            .insert(module.key().to_string(), Backend::Packed(packed));
        Ok(result)
    }

    /// Produce the serialized form of a loaded module.
    pub fn serialize_module(&self, module: &ModuleInfo) -> Option<Vec<u8>> {
        match self.modules.get(module.key())? {
            Backend::Parsed(symbols) => Some(packed::serialize(symbols)),
            Backend::Packed(packed) => Some(packed.data().to_vec()),
        }
    }

    pub fn unload_module(&mut self, module: &ModuleInfo) {
        self.modules.remove(module.key());
    }

    pub fn has_module(&self, module: &ModuleInfo) -> bool {
        self.modules.contains_key(module.key())
    }

    fn view_for_frame<'a>(&'a self, frame: &'a StackFrame) -> Option<(&'a dyn SymbolView, &'a ModuleInfo)> {
        let module = frame.module.as_ref()?;
        let backend = self.modules.get(module.key())?;
        Some((backend.view(), module))
    }

    /// Fill `frame`'s function/source fields from its module's symbols
    /// and push one synthetic frame per inlined call covering the
    /// address onto `inline_frames`, innermost first.
    pub fn fill_source_line_info(
        &self,
        frame: &mut StackFrame,
        inline_frames: &mut Vec<StackFrame>,
    ) {
        let Some(module) = frame.module.clone() else {
            return;
        };
        let Some(backend) = self.modules.get(module.key()) else {
            trace!(module = %module.code_file, "no symbols for module");
            return;
        };
        fill_frame_from_view(backend.view(), &module, frame, inline_frames);
    }

    /// The `STACK WIN` record covering the frame's instruction.
    pub fn find_windows_frame_info(&self, frame: &StackFrame) -> Option<WindowsFrameInfo> {
        let (view, module) = self.view_for_frame(frame)?;
        let rva = frame.instruction.checked_sub(module.base_address)?;
        view.windows_frame_info_at(rva)
    }

    /// The effective CFI rules covering the frame's instruction, parsed
    /// and ready to evaluate.
    pub fn find_cfi_frame_info(&self, frame: &StackFrame) -> Option<CfiFrameInfo> {
        let (view, module) = self.view_for_frame(frame)?;
        let rva = frame.instruction.checked_sub(module.base_address)?;
        let rules = view.cfi_rules_at(rva)?;
        CfiFrameInfo::from_rule_strings(
            std::iter::once(rules.init).chain(rules.deltas.iter().copied()),
        )
    }
}
