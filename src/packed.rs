//! The serialized module form: a flat, versioned, little-endian buffer
//! with binary-searchable index tables and an interned string region.
//!
//! A packed module loads without re-parsing and answers every resolver
//! query identically to the tree form it was serialized from. The
//! layout is:
//!
//! ```text
//! magic "RTSM" | version u16 | flags u16
//! directory: 10 × (offset u32, count-or-byte-len u32)
//!   strings, files, inline origins, function index, function payload,
//!   publics, STACK WIN frame-data, STACK WIN fpo, CFI index, CFI payload
//! sections…
//! ```
//!
//! Index tables hold fixed-width records sorted by address; payload
//! records are variable-width and referenced by section-relative offset.

use std::collections::HashMap;

use crate::error::PackedError;
use crate::module::SymbolModule;
use crate::resolver::{CfiRules, FuncView, InlineView, LineView, PublicView, SymbolView};
use crate::winframe::{WindowsFrameInfo, WindowsFrameType};

const MAGIC: &[u8; 4] = b"RTSM";
const VERSION: u16 = 1;
const FLAG_CORRUPT: u16 = 1;

const HEADER_LEN: usize = 8;
const SECTION_COUNT: usize = 10;
const DIRECTORY_LEN: usize = SECTION_COUNT * 8;

const SEC_STRINGS: usize = 0;
const SEC_FILES: usize = 1;
const SEC_ORIGINS: usize = 2;
const SEC_FUNC_INDEX: usize = 3;
const SEC_FUNC_PAYLOAD: usize = 4;
const SEC_PUBLICS: usize = 5;
const SEC_WIN_FRAME_DATA: usize = 6;
const SEC_WIN_FPO: usize = 7;
const SEC_CFI_INDEX: usize = 8;
const SEC_CFI_PAYLOAD: usize = 9;

const FILE_RECORD: usize = 12;
const ORIGIN_RECORD: usize = 16;
const RANGE_INDEX_RECORD: usize = 20;
const PUBLIC_RECORD: usize = 24;
const WIN_RECORD: usize = 52;
const LINE_RECORD: usize = 24;

const FUNC_FLAG_MULTIPLE: u32 = 1;
const FUNC_FLAG_PREFER_EXTERN: u32 = 2;
const WIN_FLAG_ALLOCATES_BP: u32 = 1;
const WIN_FLAG_HAS_PROGRAM: u32 = 2;

/// Byte extent each section's records require, for load-time validation.
fn record_size(section: usize) -> Option<usize> {
    match section {
        SEC_FILES => Some(FILE_RECORD),
        SEC_ORIGINS => Some(ORIGIN_RECORD),
        SEC_FUNC_INDEX | SEC_CFI_INDEX => Some(RANGE_INDEX_RECORD),
        SEC_PUBLICS => Some(PUBLIC_RECORD),
        SEC_WIN_FRAME_DATA | SEC_WIN_FPO => Some(WIN_RECORD),
        _ => None,
    }
}

// ---------------------------------------------------------------------
// Serialization

#[derive(Default)]
struct Strings {
    blob: Vec<u8>,
    map: HashMap<String, (u32, u32)>,
}

impl Strings {
    fn intern(&mut self, s: &str) -> (u32, u32) {
        if let Some(&reference) = self.map.get(s) {
            return reference;
        }
        let reference = (self.blob.len() as u32, s.len() as u32);
        self.blob.extend_from_slice(s.as_bytes());
        self.map.insert(s.to_string(), reference);
        reference
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_str_ref(out: &mut Vec<u8>, reference: (u32, u32)) {
    push_u32(out, reference.0);
    push_u32(out, reference.1);
}

/// Serialize a finalized module into its flat form.
pub(crate) fn serialize(module: &SymbolModule) -> Vec<u8> {
    let mut strings = Strings::default();
    let mut sections: [Vec<u8>; SECTION_COUNT] = Default::default();

    for (id, path) in module.files() {
        let section = &mut sections[SEC_FILES];
        push_u32(section, id);
        let reference = strings.intern(path);
        push_str_ref(section, reference);
    }

    for (id, origin) in module.inline_origins() {
        let section = &mut sections[SEC_ORIGINS];
        push_u32(section, id);
        let reference = strings.intern(&origin.name);
        push_str_ref(section, reference);
        push_u32(section, origin.declaration_file.unwrap_or(u32::MAX));
    }

    let mut payload_offsets = Vec::with_capacity(module.functions().len());
    for function in module.functions() {
        let payload = &mut sections[SEC_FUNC_PAYLOAD];
        payload_offsets.push(payload.len() as u32);
        let name = strings.intern(&function.name);
        push_str_ref(payload, name);
        push_u64(payload, function.entry());
        push_u32(payload, function.parameter_size);
        let mut flags = 0;
        if function.is_multiple {
            flags |= FUNC_FLAG_MULTIPLE;
        }
        if function.prefer_extern_name {
            flags |= FUNC_FLAG_PREFER_EXTERN;
        }
        push_u32(payload, flags);
        push_u32(payload, function.lines.len() as u32);
        for line in &function.lines {
            push_u64(payload, line.address);
            push_u64(payload, line.size);
            push_u32(payload, line.file_id);
            push_u32(payload, line.line);
        }
        push_u32(payload, function.inlines.len() as u32);
        for inline in &function.inlines {
            push_u32(payload, inline.origin_id);
            push_u32(payload, inline.depth);
            push_u32(payload, inline.call_file);
            push_u32(payload, inline.call_line);
            push_u32(payload, inline.ranges.len() as u32);
            for &(start, end) in &inline.ranges {
                push_u64(payload, start);
                push_u64(payload, end);
            }
        }
    }

    for (start, end, function_index) in module.func_index_entries() {
        let section = &mut sections[SEC_FUNC_INDEX];
        push_u64(section, start);
        push_u64(section, end);
        push_u32(section, payload_offsets[function_index]);
    }

    for public in module.publics() {
        let section = &mut sections[SEC_PUBLICS];
        push_u64(section, public.address);
        push_u32(section, public.parameter_size);
        push_u32(section, public.is_multiple as u32);
        let name = strings.intern(&public.name);
        push_str_ref(section, name);
    }

    let win_sections = [
        (SEC_WIN_FRAME_DATA, module.frame_data_in_order().collect::<Vec<_>>()),
        (SEC_WIN_FPO, module.fpo_in_order().collect::<Vec<_>>()),
    ];
    for (section_index, records) in win_sections {
        for info in records {
            let reference = info
                .program_string
                .as_deref()
                .map(|program| strings.intern(program));
            let section = &mut sections[section_index];
            push_u64(section, info.rva);
            push_u64(section, info.code_size);
            push_u32(section, info.prolog_size);
            push_u32(section, info.epilog_size);
            push_u32(section, info.parameter_size);
            push_u32(section, info.saved_register_size);
            push_u32(section, info.local_size);
            push_u32(section, info.max_stack_size);
            let mut flags = 0;
            if info.allocates_base_pointer {
                flags |= WIN_FLAG_ALLOCATES_BP;
            }
            if reference.is_some() {
                flags |= WIN_FLAG_HAS_PROGRAM;
            }
            push_u32(section, flags);
            push_str_ref(section, reference.unwrap_or((0, 0)));
        }
    }

    for entry in module.cfi_in_order() {
        let init = strings.intern(&entry.init);
        let deltas: Vec<(u64, (u32, u32))> = entry
            .deltas
            .iter()
            .map(|(address, rules)| (*address, strings.intern(rules)))
            .collect();
        let payload = &mut sections[SEC_CFI_PAYLOAD];
        let payload_offset = payload.len() as u32;
        push_str_ref(payload, init);
        push_u32(payload, deltas.len() as u32);
        for (address, rules) in deltas {
            push_u64(payload, address);
            push_str_ref(payload, rules);
        }
        let index = &mut sections[SEC_CFI_INDEX];
        push_u64(index, entry.start);
        push_u64(index, entry.end);
        push_u32(index, payload_offset);
    }

    sections[SEC_STRINGS] = strings.blob;

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    let flags = if module.is_corrupt { FLAG_CORRUPT } else { 0 };
    out.extend_from_slice(&flags.to_le_bytes());

    let mut offset = (HEADER_LEN + DIRECTORY_LEN) as u32;
    for (index, section) in sections.iter().enumerate() {
        push_u32(&mut out, offset);
        let count_or_len = match record_size(index) {
            Some(size) => (section.len() / size) as u32,
            None => section.len() as u32,
        };
        push_u32(&mut out, count_or_len);
        offset += section.len() as u32;
    }
    for section in &sections {
        out.extend_from_slice(section);
    }
    out
}

// ---------------------------------------------------------------------
// The packed reader

#[derive(Clone, Copy, Default)]
struct Section {
    offset: usize,
    /// Record count for fixed-width sections, byte length otherwise.
    count_or_len: usize,
}

/// A module loaded from its serialized form. Holds the raw buffer and
/// answers queries straight out of it.
pub struct PackedModule {
    data: Vec<u8>,
    flags: u16,
    sections: [Section; SECTION_COUNT],
}

impl PackedModule {
    pub fn parse(data: Vec<u8>) -> Result<Self, PackedError> {
        if data.len() < HEADER_LEN + DIRECTORY_LEN {
            return Err(PackedError::Truncated);
        }
        if &data[0..4] != MAGIC {
            return Err(PackedError::BadMagic);
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(PackedError::UnsupportedVersion(version));
        }
        let flags = u16::from_le_bytes([data[6], data[7]]);

        let mut sections = [Section::default(); SECTION_COUNT];
        for (index, section) in sections.iter_mut().enumerate() {
            let at = HEADER_LEN + index * 8;
            let offset = u32::from_le_bytes(data[at..at + 4].try_into().unwrap()) as usize;
            let count_or_len =
                u32::from_le_bytes(data[at + 4..at + 8].try_into().unwrap()) as usize;
            let byte_len = match record_size(index) {
                Some(size) => count_or_len.checked_mul(size),
                None => Some(count_or_len),
            }
            .ok_or(PackedError::BadSectionDirectory)?;
            if offset.checked_add(byte_len).map_or(true, |end| end > data.len()) {
                return Err(PackedError::BadSectionDirectory);
            }
            *section = Section {
                offset,
                count_or_len,
            };
        }

        Ok(Self {
            data,
            flags,
            sections,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn u64_at(&self, offset: usize) -> Option<u64> {
        let bytes = self.data.get(offset..offset + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Resolve the `(offset, len)` string reference stored at `offset`.
    fn str_ref_at(&self, offset: usize) -> Option<&str> {
        let rel = self.u32_at(offset)? as usize;
        let len = self.u32_at(offset + 4)? as usize;
        let strings = self.sections[SEC_STRINGS];
        if rel + len > strings.count_or_len {
            return None;
        }
        let start = strings.offset + rel;
        std::str::from_utf8(self.data.get(start..start + len)?).ok()
    }

    fn record_at(&self, section: usize, index: usize) -> Option<usize> {
        let size = record_size(section)?;
        let sec = self.sections[section];
        (index < sec.count_or_len).then_some(sec.offset + index * size)
    }

    /// Greatest record index whose key is not above `address`.
    fn floor_search(
        &self,
        section: usize,
        key_at: impl Fn(usize) -> Option<u64>,
        address: u64,
    ) -> Option<usize> {
        let count = self.sections[section].count_or_len;
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if key_at(self.record_at(section, mid)?)? <= address {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }

    /// Range-index lookup shared by the function and CFI tables.
    fn range_index_at(&self, section: usize, address: u64) -> Option<u32> {
        let index = self.floor_search(section, |at| self.u64_at(at), address)?;
        let at = self.record_at(section, index)?;
        let end = self.u64_at(at + 8)?;
        (address < end).then(|| self.u32_at(at + 16))?
    }

    fn win_record_at(&self, section: usize, address: u64) -> Option<WindowsFrameInfo> {
        let index = self.floor_search(section, |at| self.u64_at(at), address)?;
        let at = self.record_at(section, index)?;
        let rva = self.u64_at(at)?;
        let code_size = self.u64_at(at + 8)?;
        if address >= rva + code_size {
            return None;
        }
        let flags = self.u32_at(at + 40)?;
        let program_string = if flags & WIN_FLAG_HAS_PROGRAM != 0 {
            Some(self.str_ref_at(at + 44)?.to_string())
        } else {
            None
        };
        Some(WindowsFrameInfo {
            frame_type: if section == SEC_WIN_FRAME_DATA {
                WindowsFrameType::FrameData
            } else {
                WindowsFrameType::Fpo
            },
            rva,
            code_size,
            prolog_size: self.u32_at(at + 16)?,
            epilog_size: self.u32_at(at + 20)?,
            parameter_size: self.u32_at(at + 24)?,
            saved_register_size: self.u32_at(at + 28)?,
            local_size: self.u32_at(at + 32)?,
            max_stack_size: self.u32_at(at + 36)?,
            allocates_base_pointer: flags & WIN_FLAG_ALLOCATES_BP != 0,
            program_string,
        })
    }

    fn func_payload(&self, handle: u32) -> Option<usize> {
        let section = self.sections[SEC_FUNC_PAYLOAD];
        let offset = handle as usize;
        (offset < section.count_or_len).then_some(section.offset + offset)
    }

    /// Offset of the function's line table and its length.
    fn func_lines(&self, payload: usize) -> Option<(usize, usize)> {
        let count = self.u32_at(payload + 24)? as usize;
        Some((payload + 28, count))
    }
}

impl SymbolView for PackedModule {
    fn is_corrupt(&self) -> bool {
        self.flags & FLAG_CORRUPT != 0
    }

    fn file_name(&self, id: u32) -> Option<&str> {
        let index = self.floor_search(SEC_FILES, |at| self.u32_at(at).map(u64::from), id as u64)?;
        let at = self.record_at(SEC_FILES, index)?;
        (self.u32_at(at)? == id).then(|| self.str_ref_at(at + 4))?
    }

    fn origin_name(&self, id: u32) -> Option<&str> {
        let index =
            self.floor_search(SEC_ORIGINS, |at| self.u32_at(at).map(u64::from), id as u64)?;
        let at = self.record_at(SEC_ORIGINS, index)?;
        (self.u32_at(at)? == id).then(|| self.str_ref_at(at + 4))?
    }

    fn function_at(&self, address: u64) -> Option<u32> {
        self.range_index_at(SEC_FUNC_INDEX, address)
    }

    fn function(&self, handle: u32) -> Option<FuncView<'_>> {
        let payload = self.func_payload(handle)?;
        let flags = self.u32_at(payload + 20)?;
        Some(FuncView {
            name: self.str_ref_at(payload)?,
            entry: self.u64_at(payload + 8)?,
            parameter_size: self.u32_at(payload + 16)?,
            is_multiple: flags & FUNC_FLAG_MULTIPLE != 0,
            prefer_extern_name: flags & FUNC_FLAG_PREFER_EXTERN != 0,
        })
    }

    fn line_at(&self, handle: u32, address: u64) -> Option<LineView> {
        let payload = self.func_payload(handle)?;
        let (lines, count) = self.func_lines(payload)?;
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.u64_at(lines + mid * LINE_RECORD)? <= address {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let at = lines + lo.checked_sub(1)? * LINE_RECORD;
        let line_address = self.u64_at(at)?;
        let size = self.u64_at(at + 8)?;
        (address < line_address + size).then_some(LineView {
            address: line_address,
            file_id: self.u32_at(at + 16)?,
            line: self.u32_at(at + 20)?,
        })
    }

    fn inline_chain_at(&self, handle: u32, address: u64) -> Vec<InlineView> {
        let mut chain: Vec<(u32, InlineView)> = Vec::new();
        let Some(payload) = self.func_payload(handle) else {
            return Vec::new();
        };
        let Some((lines, line_count)) = self.func_lines(payload) else {
            return Vec::new();
        };
        let mut at = lines + line_count * LINE_RECORD;
        let Some(inline_count) = self.u32_at(at) else {
            return Vec::new();
        };
        at += 4;
        for _ in 0..inline_count {
            let header = at;
            let Some(range_count) = self.u32_at(at + 16) else {
                return Vec::new();
            };
            at += 20;
            let mut covering = None;
            for _ in 0..range_count {
                let (Some(start), Some(end)) = (self.u64_at(at), self.u64_at(at + 8)) else {
                    return Vec::new();
                };
                if address >= start && address < end {
                    covering = Some(start);
                }
                at += 16;
            }
            if let Some(range_start) = covering {
                let (Some(origin_id), Some(depth), Some(call_file), Some(call_line)) = (
                    self.u32_at(header),
                    self.u32_at(header + 4),
                    self.u32_at(header + 8),
                    self.u32_at(header + 12),
                ) else {
                    return Vec::new();
                };
                chain.push((
                    depth,
                    InlineView {
                        origin_id,
                        call_file,
                        call_line,
                        range_start,
                    },
                ));
            }
        }
        chain.sort_by_key(|&(depth, _)| std::cmp::Reverse(depth));
        chain.into_iter().map(|(_, view)| view).collect()
    }

    fn public_at(&self, address: u64) -> Option<PublicView<'_>> {
        let index = self.floor_search(SEC_PUBLICS, |at| self.u64_at(at), address)?;
        let at = self.record_at(SEC_PUBLICS, index)?;
        Some(PublicView {
            address: self.u64_at(at)?,
            name: self.str_ref_at(at + 16)?,
            parameter_size: self.u32_at(at + 8)?,
            is_multiple: self.u32_at(at + 12)? != 0,
        })
    }

    fn windows_frame_info_at(&self, address: u64) -> Option<WindowsFrameInfo> {
        self.win_record_at(SEC_WIN_FRAME_DATA, address)
            .or_else(|| self.win_record_at(SEC_WIN_FPO, address))
    }

    fn cfi_rules_at(&self, address: u64) -> Option<CfiRules<'_>> {
        let payload_offset = self.range_index_at(SEC_CFI_INDEX, address)?;
        let section = self.sections[SEC_CFI_PAYLOAD];
        let payload = section.offset + payload_offset as usize;
        let init = self.str_ref_at(payload)?;
        let delta_count = self.u32_at(payload + 8)? as usize;
        let mut deltas = Vec::new();
        for index in 0..delta_count {
            let at = payload + 12 + index * 16;
            let delta_address = self.u64_at(at)?;
            if delta_address > address {
                break;
            }
            deltas.push(self.str_ref_at(at + 8)?);
        }
        Some(CfiRules { init, deltas })
    }
}
