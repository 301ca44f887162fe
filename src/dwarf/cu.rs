use std::collections::{BTreeMap, HashMap};

use gimli::constants as dw;
use tracing::debug;

use crate::demangle;
use crate::dwarf::lines::{pair_lines_with_functions, LineReadError, LineToModule};
use crate::lang::SourceLanguage;
use crate::module::{Function, Inline, Line, SymbolModule};
use crate::reporter::Reporter;

const NAME_OMITTED: &str = "<name omitted>";

/// File id used for call sites whose file index the line program did not
/// define. Resolves to no file name.
const UNKNOWN_FILE: u32 = u32::MAX;

/// Reads `.debug_ranges` / `.debug_rnglists` entries on behalf of the CU
/// assembler. Implemented by the host's DWARF reader.
pub trait RangesReader {
    /// The `[start, end)` ranges at `offset`, already rebased against
    /// the CU base address.
    fn read_ranges(&mut self, offset: u64, base_address: u64) -> Option<Vec<(u64, u64)>>;
}

/// What the assembler remembers about a DIE for later references to its
/// offset.
#[derive(Clone, Default)]
struct DieRecord {
    /// Qualified prefix of the enclosing scope.
    scope: Option<String>,
    /// The DIE's own unqualified name.
    name: Option<String>,
    mangled: Option<String>,
    /// The fully resolved (qualified or demangled) name, for
    /// `abstract_origin` references.
    resolved: Option<String>,
}

/// Offset-keyed name data shared between compilation units of a module.
///
/// Passing the same table to every [`CuAssembler`] of a module makes
/// inter-CU `specification`/`abstract_origin` references resolvable.
#[derive(Default)]
pub struct InterCuTable {
    entries: HashMap<u64, DieRecord>,
}

impl InterCuTable {
    pub fn new() -> Self {
        Self::default()
    }
}

struct FuncBuilder {
    offset: u64,
    name: Option<String>,
    mangled: Option<String>,
    spec: Option<u64>,
    origin: Option<u64>,
    low_pc: Option<u64>,
    high_pc: Option<u64>,
    high_pc_is_size: bool,
    ranges_offset: Option<u64>,
    is_declaration: bool,
    is_inline: bool,
    /// Enclosing scope prefix at the point of declaration.
    scope: Option<String>,
    resolved: Option<String>,
    prefer_extern_name: bool,
    inlines: Vec<PendingInline>,
}

struct PendingInline {
    origin_id: u32,
    depth: u32,
    call_file_index: Option<u64>,
    call_line: u32,
    ranges: Vec<(u64, u64)>,
}

struct InlineBuilder {
    offset: u64,
    origin: Option<u64>,
    call_file_index: Option<u64>,
    call_line: u32,
    low_pc: Option<u64>,
    high_pc: Option<u64>,
    high_pc_is_size: bool,
    ranges_offset: Option<u64>,
    depth: u32,
}

enum DieKind {
    Root,
    /// Namespace or type scope; carries the full prefix including its
    /// own name once attributes are in.
    Scope { name: Option<String>, prefix: Option<String> },
    Function(FuncBuilder),
    Inlined(InlineBuilder),
    Block,
}

struct DieFrame {
    offset: u64,
    kind: DieKind,
}

struct PendingFunction {
    die_offset: u64,
    name: Option<String>,
    prefer_extern_name: bool,
    ranges: Vec<(u64, u64)>,
    inlines: Vec<PendingInline>,
}

/// Streaming assembler for one compilation unit.
///
/// The host's DWARF reader drives it DIE by DIE:
///
/// 1. [`start_die`](Self::start_die) for the root, then for each child
///    the reader descends into (skip the subtree when it returns false);
/// 2. the `attr_*` events for that DIE, then
///    [`end_attributes`](Self::end_attributes);
/// 3. [`end_die`](Self::end_die) once the DIE's children are done;
/// 4. [`finish`](Self::finish) after the root's `end_die`, which reads
///    the CU's line program, pairs lines with functions, and commits
///    everything to the module.
///
/// Nothing here aborts: malformed references are reported through the
/// [`Reporter`] and the affected entity is skipped or named
/// `<name omitted>`.
pub struct CuAssembler<'a> {
    module: &'a mut SymbolModule,
    reporter: &'a mut dyn Reporter,
    line_reader: &'a mut dyn LineToModule,
    ranges_reader: Option<&'a mut dyn RangesReader>,
    inter_cu: Option<&'a mut InterCuTable>,

    cu_offset: u64,
    language: SourceLanguage,
    comp_dir: String,
    stmt_list: Option<u64>,
    cu_low_pc: u64,

    per_cu: HashMap<u64, DieRecord>,
    stack: Vec<DieFrame>,
    functions: Vec<PendingFunction>,
}

impl<'a> CuAssembler<'a> {
    pub fn new(
        module: &'a mut SymbolModule,
        reporter: &'a mut dyn Reporter,
        line_reader: &'a mut dyn LineToModule,
        ranges_reader: Option<&'a mut dyn RangesReader>,
        inter_cu: Option<&'a mut InterCuTable>,
        cu_offset: u64,
    ) -> Self {
        Self {
            module,
            reporter,
            line_reader,
            ranges_reader,
            inter_cu,
            cu_offset,
            language: SourceLanguage::default(),
            comp_dir: String::new(),
            stmt_list: None,
            cu_low_pc: 0,
            per_cu: HashMap::new(),
            stack: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Begin a DIE. The first call is the compilation unit's root.
    /// Returns false when the DIE and its whole subtree are of no
    /// interest and should be skipped by the reader.
    pub fn start_die(&mut self, offset: u64, tag: dw::DwTag) -> bool {
        let kind = if self.stack.is_empty() {
            match tag {
                dw::DW_TAG_compile_unit | dw::DW_TAG_partial_unit => DieKind::Root,
                _ => return false,
            }
        } else {
            match tag {
                dw::DW_TAG_namespace
                | dw::DW_TAG_class_type
                | dw::DW_TAG_structure_type
                | dw::DW_TAG_union_type
                | dw::DW_TAG_enumeration_type => DieKind::Scope {
                    name: None,
                    prefix: self.current_prefix(),
                },
                dw::DW_TAG_subprogram => DieKind::Function(FuncBuilder {
                    offset,
                    name: None,
                    mangled: None,
                    spec: None,
                    origin: None,
                    low_pc: None,
                    high_pc: None,
                    high_pc_is_size: false,
                    ranges_offset: None,
                    is_declaration: false,
                    is_inline: false,
                    scope: self.current_prefix(),
                    resolved: None,
                    prefer_extern_name: false,
                    inlines: Vec::new(),
                }),
                dw::DW_TAG_inlined_subroutine => {
                    if !self.inside_function() {
                        return false;
                    }
                    DieKind::Inlined(InlineBuilder {
                        offset,
                        origin: None,
                        call_file_index: None,
                        call_line: 0,
                        low_pc: None,
                        high_pc: None,
                        high_pc_is_size: false,
                        ranges_offset: None,
                        depth: self.inline_depth(),
                    })
                }
                dw::DW_TAG_lexical_block => DieKind::Block,
                _ => return false,
            }
        };
        self.stack.push(DieFrame { offset, kind });
        true
    }

    fn current_prefix(&self) -> Option<String> {
        for frame in self.stack.iter().rev() {
            if let DieKind::Scope { prefix, .. } = &frame.kind {
                return prefix.clone();
            }
        }
        None
    }

    fn inside_function(&self) -> bool {
        self.stack
            .iter()
            .any(|frame| matches!(frame.kind, DieKind::Function(_)))
    }

    fn inline_depth(&self) -> u32 {
        self.stack
            .iter()
            .filter(|frame| matches!(frame.kind, DieKind::Inlined(_)))
            .count() as u32
    }

    pub fn attr_unsigned(&mut self, attr: dw::DwAt, form: dw::DwForm, value: u64) {
        let Some(frame) = self.stack.last_mut() else {
            return;
        };
        match &mut frame.kind {
            DieKind::Root => match attr {
                dw::DW_AT_language => {
                    self.language = SourceLanguage::from_dwarf(dw::DwLang(value as u16));
                }
                dw::DW_AT_stmt_list => self.stmt_list = Some(value),
                dw::DW_AT_low_pc => self.cu_low_pc = value,
                _ => {}
            },
            DieKind::Function(fb) => match attr {
                dw::DW_AT_low_pc => fb.low_pc = Some(value),
                dw::DW_AT_high_pc => {
                    fb.high_pc = Some(value);
                    // DWARF 3 and later may encode high_pc as a size in
                    // any non-address form.
                    fb.high_pc_is_size = form != dw::DW_FORM_addr;
                }
                dw::DW_AT_ranges => fb.ranges_offset = Some(value),
                dw::DW_AT_declaration => fb.is_declaration = value != 0,
                dw::DW_AT_inline => fb.is_inline = value != 0,
                _ => {}
            },
            DieKind::Inlined(ib) => match attr {
                dw::DW_AT_low_pc => ib.low_pc = Some(value),
                dw::DW_AT_high_pc => {
                    ib.high_pc = Some(value);
                    ib.high_pc_is_size = form != dw::DW_FORM_addr;
                }
                dw::DW_AT_ranges => ib.ranges_offset = Some(value),
                dw::DW_AT_call_file => ib.call_file_index = Some(value),
                dw::DW_AT_call_line => ib.call_line = value as u32,
                _ => {}
            },
            DieKind::Scope { .. } | DieKind::Block => {}
        }
    }

    pub fn attr_signed(&mut self, attr: dw::DwAt, value: i64) {
        // Some producers emit DW_AT_language (and other scalars) with a
        // signed form; fold them into the unsigned path.
        if value >= 0 {
            self.attr_unsigned(attr, dw::DW_FORM_udata, value as u64);
        }
    }

    pub fn attr_string(&mut self, attr: dw::DwAt, value: &str) {
        let comp_dir = attr == dw::DW_AT_comp_dir;
        let is_cu_name = attr == dw::DW_AT_name;
        let Some(frame) = self.stack.last_mut() else {
            return;
        };
        match &mut frame.kind {
            DieKind::Root => {
                if comp_dir {
                    self.comp_dir = value.to_string();
                } else if is_cu_name {
                    self.reporter.cu_name(value);
                }
            }
            DieKind::Scope { name, .. } => {
                if attr == dw::DW_AT_name {
                    *name = Some(value.to_string());
                }
            }
            DieKind::Function(fb) => match attr {
                dw::DW_AT_name => fb.name = Some(value.to_string()),
                dw::DW_AT_linkage_name | dw::DW_AT_MIPS_linkage_name => {
                    fb.mangled = Some(value.to_string());
                }
                _ => {}
            },
            DieKind::Inlined(_) | DieKind::Block => {}
        }
    }

    pub fn attr_reference(&mut self, attr: dw::DwAt, target: u64) {
        let Some(frame) = self.stack.last_mut() else {
            return;
        };
        match &mut frame.kind {
            DieKind::Function(fb) => match attr {
                dw::DW_AT_specification => fb.spec = Some(target),
                dw::DW_AT_abstract_origin => fb.origin = Some(target),
                _ => {}
            },
            DieKind::Inlined(ib) => {
                if attr == dw::DW_AT_abstract_origin {
                    ib.origin = Some(target);
                }
            }
            _ => {}
        }
    }

    /// Raw attribute payloads (location expressions and the like) carry
    /// nothing the assembler needs.
    pub fn attr_buffer(&mut self, _attr: dw::DwAt, _bytes: &[u8]) {}

    /// All attributes for the current DIE have been delivered.
    pub fn end_attributes(&mut self) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        let frame = match frame.kind {
            DieKind::Root => {
                self.line_reader.start_cu(&self.comp_dir);
                DieFrame {
                    offset: frame.offset,
                    kind: DieKind::Root,
                }
            }
            DieKind::Scope { name, prefix } => {
                let full_prefix = match &name {
                    Some(own) => self
                        .language
                        .qualify(prefix.as_deref(), own)
                        .or(prefix.clone()),
                    // Anonymous scopes are transparent.
                    None => prefix.clone(),
                };
                self.register(
                    frame.offset,
                    DieRecord {
                        scope: prefix,
                        name: name.clone(),
                        mangled: None,
                        resolved: full_prefix.clone(),
                    },
                );
                DieFrame {
                    offset: frame.offset,
                    kind: DieKind::Scope {
                        name,
                        prefix: full_prefix,
                    },
                }
            }
            DieKind::Function(mut fb) => {
                self.resolve_function_identity(&mut fb);
                self.register(
                    fb.offset,
                    DieRecord {
                        scope: fb.scope.clone(),
                        name: fb.name.clone(),
                        mangled: fb.mangled.clone(),
                        resolved: fb.resolved.clone(),
                    },
                );
                DieFrame {
                    offset: frame.offset,
                    kind: DieKind::Function(fb),
                }
            }
            other => DieFrame {
                offset: frame.offset,
                kind: other,
            },
        };
        self.stack.push(frame);
    }

    /// The current DIE and all its children are complete.
    pub fn end_die(&mut self) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        match frame.kind {
            DieKind::Function(fb) => self.finish_function(fb),
            DieKind::Inlined(ib) => self.finish_inlined(ib),
            _ => {}
        }
    }

    /// Merge the specification/abstract-origin chain into the builder
    /// and compute the final name.
    fn resolve_function_identity(&mut self, fb: &mut FuncBuilder) {
        if let Some(target) = fb.spec {
            if let Some(record) = self.lookup(fb.offset, target, RefKind::Specification) {
                // The qualified-name parent chain comes from the
                // specification; the definition's own name wins when
                // both have one.
                fb.scope = record.scope.clone();
                if fb.name.is_none() {
                    fb.name = record.name.clone();
                }
                if fb.mangled.is_none() {
                    fb.mangled = record.mangled.clone();
                }
            }
        }

        if fb.name.is_none() && fb.mangled.is_none() {
            if let Some(target) = fb.origin {
                if let Some(record) = self.lookup(fb.offset, target, RefKind::AbstractOrigin) {
                    fb.resolved = record.resolved;
                    return;
                }
            }
        }

        fb.resolved =
            self.compute_name(fb.name.as_deref(), fb.mangled.as_deref(), fb.scope.as_deref());
    }

    fn compute_name(
        &mut self,
        name: Option<&str>,
        mangled: Option<&str>,
        scope: Option<&str>,
    ) -> Option<String> {
        if self.language == SourceLanguage::Assembler {
            return None;
        }
        if self.language.uses_mangled_names() {
            let raw = mangled.or(name)?;
            return Some(match demangle::demangle(raw) {
                Ok(Some(demangled)) => demangled,
                Ok(None) => raw.to_string(),
                Err(()) => {
                    self.reporter.demangle_error(raw);
                    raw.to_string()
                }
            });
        }
        if let Some(mangled) = mangled {
            match demangle::demangle(mangled) {
                Ok(Some(demangled)) => return Some(demangled),
                Ok(None) => {}
                Err(()) => self.reporter.demangle_error(mangled),
            }
        }
        match name {
            Some(name) => self.language.qualify(scope, name),
            None => mangled.map(str::to_string),
        }
    }

    fn register(&mut self, offset: u64, record: DieRecord) {
        if let Some(table) = self.inter_cu.as_deref_mut() {
            table.entries.insert(offset, record.clone());
        }
        self.per_cu.insert(offset, record);
    }

    fn lookup(&mut self, die_offset: u64, target: u64, kind: RefKind) -> Option<DieRecord> {
        if let Some(record) = self.per_cu.get(&target) {
            return Some(record.clone());
        }
        if let Some(table) = self.inter_cu.as_deref_mut() {
            if let Some(record) = table.entries.get(&target) {
                return Some(record.clone());
            }
        } else if target < self.cu_offset {
            // The reference points before this CU and inter-CU handling
            // is off.
            self.reporter.unhandled_inter_cu_reference(die_offset, target);
            return None;
        }
        match kind {
            RefKind::Specification => self.reporter.unknown_specification(die_offset, target),
            RefKind::AbstractOrigin => self.reporter.unknown_abstract_origin(die_offset, target),
        }
        None
    }

    fn resolve_ranges(
        &mut self,
        low_pc: Option<u64>,
        high_pc: Option<u64>,
        high_pc_is_size: bool,
        ranges_offset: Option<u64>,
    ) -> Vec<(u64, u64)> {
        if let Some(offset) = ranges_offset {
            let base = self.cu_low_pc;
            return match self.ranges_reader.as_deref_mut() {
                Some(reader) => reader.read_ranges(offset, base).unwrap_or_default(),
                None => {
                    self.reporter.missing_section(".debug_ranges");
                    Vec::new()
                }
            };
        }
        let (Some(low), Some(high)) = (low_pc, high_pc) else {
            return Vec::new();
        };
        let end = if high_pc_is_size { low + high } else { high };
        if end <= low {
            return Vec::new();
        }
        vec![(low, end)]
    }

    fn finish_function(&mut self, fb: FuncBuilder) {
        if fb.is_declaration || fb.is_inline {
            // Declarations and abstract inline definitions only exist
            // to be referenced.
            return;
        }
        let ranges = self.resolve_ranges(fb.low_pc, fb.high_pc, fb.high_pc_is_size, fb.ranges_offset);
        if ranges.is_empty() {
            return;
        }
        self.functions.push(PendingFunction {
            die_offset: fb.offset,
            name: fb.resolved,
            prefer_extern_name: fb.prefer_extern_name,
            ranges,
            inlines: fb.inlines,
        });
    }

    fn finish_inlined(&mut self, ib: InlineBuilder) {
        let ranges = self.resolve_ranges(ib.low_pc, ib.high_pc, ib.high_pc_is_size, ib.ranges_offset);
        if ranges.is_empty() {
            return;
        }
        let origin_name = match ib.origin {
            Some(target) => self
                .lookup(ib.offset, target, RefKind::AbstractOrigin)
                .and_then(|record| record.resolved),
            None => None,
        };
        let origin_name = origin_name.unwrap_or_else(|| NAME_OMITTED.to_string());
        let origin_id = self.module.intern_inline_origin(&origin_name, None);

        let pending = PendingInline {
            origin_id,
            depth: ib.depth,
            call_file_index: ib.call_file_index,
            call_line: ib.call_line,
            ranges,
        };
        for frame in self.stack.iter_mut().rev() {
            if let DieKind::Function(fb) = &mut frame.kind {
                fb.inlines.push(pending);
                return;
            }
        }
        debug!(offset = ib.offset, "inlined subroutine outside any function");
    }

    /// Commit the compilation unit: read the line program, pair lines
    /// with functions, and add the functions to the module.
    pub fn finish(&mut self) {
        let mut lines: Vec<Line> = Vec::new();
        let mut file_map: BTreeMap<u64, u32> = BTreeMap::new();
        if let Some(offset) = self.stmt_list {
            match self
                .line_reader
                .read_program(offset, self.module, &mut lines, &mut file_map)
            {
                Ok(()) => {}
                Err(LineReadError::MissingSection(section)) => {
                    self.reporter.missing_section(section)
                }
                Err(LineReadError::BadOffset) => self.reporter.bad_line_info_offset(offset),
            }
        }
        lines.sort_by_key(|line| line.address);

        let mut functions: Vec<Function> = Vec::new();
        for pending in self.functions.drain(..) {
            let (name, prefer_extern_name) = match pending.name {
                Some(name) => (name, pending.prefer_extern_name),
                None => {
                    if self.language != SourceLanguage::Assembler {
                        self.reporter.unnamed_function(pending.die_offset);
                    }
                    (NAME_OMITTED.to_string(), true)
                }
            };
            let inlines = pending
                .inlines
                .into_iter()
                .map(|inline| Inline {
                    origin_id: inline.origin_id,
                    depth: inline.depth,
                    call_file: inline
                        .call_file_index
                        .and_then(|index| file_map.get(&index).copied())
                        .unwrap_or(UNKNOWN_FILE),
                    call_line: inline.call_line,
                    ranges: inline.ranges,
                })
                .collect();
            functions.push(Function {
                name,
                ranges: pending.ranges,
                parameter_size: 0,
                is_multiple: false,
                prefer_extern_name,
                lines: Vec::new(),
                inlines,
            });
        }
        functions.sort_by_key(|f| f.entry());

        pair_lines_with_functions(&mut functions, &lines, self.reporter);

        for function in functions {
            self.module.add_function(function);
        }
    }
}

#[derive(Clone, Copy)]
enum RefKind {
    Specification,
    AbstractOrigin,
}
