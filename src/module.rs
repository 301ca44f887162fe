use std::collections::btree_map::Entry as BTreeEntry;
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::range_map::RangeMap;
use crate::winframe::{WindowsFrameInfo, WindowsFrameType};

/// One source line record: `size` bytes of code at `address` compiled
/// from `line` of file `file_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    pub address: u64,
    pub size: u64,
    pub file_id: u32,
    pub line: u32,
}

impl Line {
    pub fn end(&self) -> u64 {
        self.address + self.size
    }
}

/// One inlined call inside a function, possibly covering several
/// discontiguous address ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inline {
    /// Which abstract subprogram was inlined here.
    pub origin_id: u32,
    /// Nesting level, 0 for calls made directly by the enclosing
    /// function.
    pub depth: u32,
    pub call_file: u32,
    pub call_line: u32,
    /// `[start, end)` pairs.
    pub ranges: Vec<(u64, u64)>,
}

impl Inline {
    pub fn range_at(&self, address: u64) -> Option<(u64, u64)> {
        self.ranges
            .iter()
            .copied()
            .find(|&(start, end)| address >= start && address < end)
    }
}

/// The abstract subprogram one or more [`Inline`]s refer to for their
/// name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineOrigin {
    pub name: String,
    pub declaration_file: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct Function {
    pub name: String,
    /// Sorted, non-overlapping `[start, end)` pairs.
    pub ranges: Vec<(u64, u64)>,
    pub parameter_size: u32,
    pub is_multiple: bool,
    /// Prefer the name of a public symbol at the same address, if one
    /// exists. Set for functions whose debug info had no usable name.
    pub prefer_extern_name: bool,
    /// Sorted by address, non-overlapping, within `ranges`.
    pub lines: Vec<Line>,
    /// Sorted by (depth, first range start).
    pub inlines: Vec<Inline>,
}

impl Function {
    /// The function's entry address: the start of its lowest range.
    pub fn entry(&self) -> u64 {
        self.ranges.first().map(|r| r.0).unwrap_or(0)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.ranges
            .iter()
            .any(|&(start, end)| address >= start && address < end)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicSymbol {
    pub address: u64,
    pub name: String,
    pub parameter_size: u32,
    pub is_multiple: bool,
}

/// One `STACK CFI INIT` region with its delta records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfiEntry {
    pub start: u64,
    /// exclusive
    pub end: u64,
    /// The `INIT` rule string, `reg: expr reg: expr …`.
    pub init: String,
    /// Rule patches, sorted by address, all within `[start, end)`.
    pub deltas: Vec<(u64, String)>,
}

/// The parsed symbol data for one module.
///
/// All entities live in typed collections owned here; cross references
/// (file ids, inline-origin ids) are plain integers, so there are no
/// ownership cycles. After [`finalize`](Self::finalize) the module is
/// immutable and all address indexes are in place.
#[derive(Default)]
pub struct SymbolModule {
    pub os: String,
    pub arch: String,
    pub debug_id: String,
    pub debug_file: String,
    /// The input had unparseable records. The data that did parse is
    /// still served.
    pub is_corrupt: bool,

    files: BTreeMap<u32, String>,
    files_by_name: HashMap<String, u32>,
    inline_origins: BTreeMap<u32, InlineOrigin>,
    origins_by_name: HashMap<String, u32>,

    functions: Vec<Function>,
    func_index: RangeMap<usize>,
    publics: Vec<PublicSymbol>,
    frame_data: Vec<WindowsFrameInfo>,
    frame_data_index: RangeMap<usize>,
    fpo: Vec<WindowsFrameInfo>,
    fpo_index: RangeMap<usize>,
    cfi: Vec<CfiEntry>,
    cfi_index: RangeMap<usize>,

    finalized: bool,
}

impl SymbolModule {
    pub fn new(
        os: impl Into<String>,
        arch: impl Into<String>,
        debug_id: impl Into<String>,
        debug_file: impl Into<String>,
    ) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            debug_id: debug_id.into(),
            debug_file: debug_file.into(),
            ..Self::default()
        }
    }

    /// Record a file under an id from the input. Duplicate ids are
    /// rejected.
    pub fn set_file(&mut self, id: u32, path: impl Into<String>) -> bool {
        match self.files.entry(id) {
            BTreeEntry::Occupied(_) => false,
            BTreeEntry::Vacant(slot) => {
                let path = path.into();
                self.files_by_name.entry(path.clone()).or_insert(id);
                slot.insert(path);
                true
            }
        }
    }

    /// Intern a file path, allocating an id if it is new.
    pub fn intern_file(&mut self, path: &str) -> u32 {
        if let Some(&id) = self.files_by_name.get(path) {
            return id;
        }
        let id = self.files.keys().next_back().map_or(0, |&last| last + 1);
        self.files.insert(id, path.to_string());
        self.files_by_name.insert(path.to_string(), id);
        id
    }

    pub fn set_inline_origin(&mut self, id: u32, name: impl Into<String>) -> bool {
        match self.inline_origins.entry(id) {
            BTreeEntry::Occupied(_) => false,
            BTreeEntry::Vacant(slot) => {
                let name = name.into();
                self.origins_by_name.entry(name.clone()).or_insert(id);
                slot.insert(InlineOrigin {
                    name,
                    declaration_file: None,
                });
                true
            }
        }
    }

    /// Intern an inline origin by name, allocating an id if it is new.
    pub fn intern_inline_origin(&mut self, name: &str, declaration_file: Option<u32>) -> u32 {
        if let Some(&id) = self.origins_by_name.get(name) {
            return id;
        }
        let id = self
            .inline_origins
            .keys()
            .next_back()
            .map_or(0, |&last| last + 1);
        self.inline_origins.insert(
            id,
            InlineOrigin {
                name: name.to_string(),
                declaration_file,
            },
        );
        self.origins_by_name.insert(name.to_string(), id);
        id
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn add_public(&mut self, public: PublicSymbol) {
        self.publics.push(public);
    }

    pub fn add_windows_frame_info(&mut self, info: WindowsFrameInfo) {
        match info.frame_type {
            WindowsFrameType::FrameData => self.frame_data.push(info),
            WindowsFrameType::Fpo => self.fpo.push(info),
            // Trap, TSS and standard-frame records exist in the wild but
            // carry nothing the walker uses.
            WindowsFrameType::Unknown => {}
        }
    }

    pub fn add_cfi_init(&mut self, start: u64, size: u64, rules: impl Into<String>) {
        self.cfi.push(CfiEntry {
            start,
            end: start + size,
            init: rules.into(),
            deltas: Vec::new(),
        });
    }

    /// Attach a `STACK CFI` delta to the most recent `INIT` region.
    /// Fails when no region is open or the address is outside it.
    pub fn add_cfi_delta(&mut self, address: u64, rules: impl Into<String>) -> bool {
        let Some(entry) = self.cfi.last_mut() else {
            return false;
        };
        if address < entry.start || address >= entry.end {
            return false;
        }
        entry.deltas.push((address, rules.into()));
        entry.deltas.sort_by_key(|&(addr, _)| addr);
        true
    }

    pub fn mark_corrupt(&mut self) {
        self.is_corrupt = true;
    }

    /// Sort everything and build the address indexes. Collisions mark
    /// the module corrupt and keep the first entry.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        for function in &mut self.functions {
            function.ranges.sort_by_key(|&(start, _)| start);
            normalize_lines(function);
            function
                .inlines
                .sort_by_key(|inline| (inline.depth, inline.ranges.first().map_or(0, |r| r.0)));
        }
        self.functions.sort_by_key(|f| f.entry());

        let mut entry_counts: HashMap<u64, u32> = HashMap::new();
        for function in &self.functions {
            *entry_counts.entry(function.entry()).or_insert(0) += 1;
        }

        let mut index = RangeMap::new();
        let mut corrupt = false;
        for (i, function) in self.functions.iter().enumerate() {
            let mut collided = false;
            for &(start, end) in &function.ranges {
                if start == end {
                    continue;
                }
                if index.insert(start, end, i).is_err() {
                    collided = true;
                }
            }
            if collided {
                debug!(
                    name = %function.name,
                    entry = function.entry(),
                    "dropping colliding function range"
                );
                // Same-entry duplicates come from identical-code folding;
                // anything else is a malformed file.
                if entry_counts[&function.entry()] <= 1 {
                    corrupt = true;
                }
            }
        }
        self.func_index = index;
        if corrupt {
            self.is_corrupt = true;
        }
        for function in &mut self.functions {
            if entry_counts[&function.entry()] > 1 {
                function.is_multiple = true;
            }
        }

        self.publics.sort_by(|a, b| {
            a.address
                .cmp(&b.address)
                .then_with(|| a.name.cmp(&b.name))
        });
        self.publics.dedup_by(|b, a| {
            if a.address == b.address {
                a.is_multiple |= a.name != b.name;
                true
            } else {
                false
            }
        });

        self.frame_data_index = build_win_index(&self.frame_data);
        self.fpo_index = build_win_index(&self.fpo);

        self.cfi.sort_by_key(|entry| entry.start);
        let mut cfi_index = RangeMap::new();
        for (i, entry) in self.cfi.iter().enumerate() {
            if cfi_index.insert(entry.start, entry.end, i).is_err() {
                self.is_corrupt = true;
            }
        }
        self.cfi_index = cfi_index;
    }

    pub fn file_name(&self, id: u32) -> Option<&str> {
        self.files.get(&id).map(String::as_str)
    }

    pub fn inline_origin(&self, id: u32) -> Option<&InlineOrigin> {
        self.inline_origins.get(&id)
    }

    pub fn files(&self) -> impl Iterator<Item = (u32, &str)> {
        self.files.iter().map(|(&id, path)| (id, path.as_str()))
    }

    pub fn inline_origins(&self) -> impl Iterator<Item = (u32, &InlineOrigin)> {
        self.inline_origins.iter().map(|(&id, origin)| (id, origin))
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn publics(&self) -> &[PublicSymbol] {
        &self.publics
    }

    pub fn cfi_entries(&self) -> &[CfiEntry] {
        &self.cfi
    }

    pub fn frame_data_records(&self) -> &[WindowsFrameInfo] {
        &self.frame_data
    }

    pub fn fpo_records(&self) -> &[WindowsFrameInfo] {
        &self.fpo
    }

    /// Index of the function covering `address`.
    pub fn function_index_at(&self, address: u64) -> Option<usize> {
        self.func_index.lookup(address).copied()
    }

    /// The public symbol with the greatest address not above `address`.
    pub fn public_at(&self, address: u64) -> Option<&PublicSymbol> {
        let index = match self
            .publics
            .binary_search_by_key(&address, |p| p.address)
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        self.publics.get(index)
    }

    /// The effective function index: one `(start, end, function index)`
    /// entry per surviving range, in address order.
    pub(crate) fn func_index_entries(&self) -> impl Iterator<Item = (u64, u64, usize)> + '_ {
        self.func_index.iter().map(|(start, end, &i)| (start, end, i))
    }

    pub(crate) fn frame_data_in_order(&self) -> impl Iterator<Item = &WindowsFrameInfo> {
        self.frame_data_index.iter().map(|(_, _, &i)| &self.frame_data[i])
    }

    pub(crate) fn fpo_in_order(&self) -> impl Iterator<Item = &WindowsFrameInfo> {
        self.fpo_index.iter().map(|(_, _, &i)| &self.fpo[i])
    }

    pub(crate) fn cfi_in_order(&self) -> impl Iterator<Item = &CfiEntry> {
        self.cfi_index.iter().map(|(_, _, &i)| &self.cfi[i])
    }

    pub fn windows_frame_info_at(&self, address: u64) -> Option<&WindowsFrameInfo> {
        // FrameData records carry strictly more information; prefer them
        // when both cover the address.
        if let Some(&i) = self.frame_data_index.lookup(address) {
            return self.frame_data.get(i);
        }
        self.fpo_index.lookup(address).and_then(|&i| self.fpo.get(i))
    }

    pub fn cfi_entry_at(&self, address: u64) -> Option<&CfiEntry> {
        self.cfi_index.lookup(address).and_then(|&i| self.cfi.get(i))
    }
}

fn build_win_index(records: &[WindowsFrameInfo]) -> RangeMap<usize> {
    let mut index = RangeMap::new();
    for (i, info) in records.iter().enumerate() {
        if index
            .insert(info.rva, info.rva + info.code_size, i)
            .is_err()
        {
            debug!(rva = info.rva, "dropping colliding STACK WIN record");
        }
    }
    index
}

/// Sort a function's lines, clamp them into its ranges, and drop
/// overlapping leftovers so that line lookups are unambiguous.
fn normalize_lines(function: &mut Function) {
    function.lines.sort_by_key(|line| line.address);
    let ranges = function.ranges.clone();
    let mut previous_end = 0;
    function.lines.retain_mut(|line| {
        if line.address < previous_end {
            return false;
        }
        let Some(&(start, end)) = ranges
            .iter()
            .find(|&&(start, end)| line.address >= start && line.address < end)
        else {
            return false;
        };
        debug_assert!(start <= line.address);
        if line.end() > end {
            line.size = end - line.address;
        }
        previous_end = line.end();
        true
    });
}
