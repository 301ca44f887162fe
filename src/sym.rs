//! Parser for the line-oriented text symbol file format.
//!
//! ```text
//! MODULE linux x86_64 4C4C44...0 libxul.so
//! FILE 1 /build/nsThread.cpp
//! INLINE_ORIGIN 2 mozilla::detail::log()
//! FUNC 1000 6e 0 nsThread::Run()
//! INLINE 0 42 1 2 1010 8
//! 1000 10 87 1
//! PUBLIC m 2170 0 start
//! STACK WIN 4 1000 6e 5 0 8 4 10 0 1 $T0 $ebp = ...
//! STACK CFI INIT 1000 6e .cfa: $esp 4 + .ra: .cfa 4 - ^
//! STACK CFI 1001 .cfa: $esp 8 +
//! ```
//!
//! Malformed and unrecognized records mark the module corrupt but do not
//! abort the parse; whatever parsed successfully is still served.
//! Addresses and sizes are unprefixed hex, everything else decimal.

use tracing::debug;

use crate::demangle::demangle_or_keep;
use crate::module::{Function, Inline, Line, PublicSymbol, SymbolModule};
use crate::winframe::{WindowsFrameInfo, WindowsFrameType};

/// Symbol lines longer than this reject the remainder of the file.
pub const MAX_SYMBOL_LINE_LEN: usize = 0x1_0000;

pub fn parse_symbol_file(bytes: &[u8]) -> SymbolModule {
    let mut lines = bytes.split(|&b| b == b'\n');

    let mut module = loop {
        match lines.next() {
            Some(line) => {
                let line = trim_record(line);
                if line.is_empty() {
                    continue;
                }
                match parse_module_record(line) {
                    Some(module) => break module,
                    None => {
                        debug!("symbol file does not start with a MODULE record");
                        let mut module = SymbolModule::default();
                        module.mark_corrupt();
                        return module;
                    }
                }
            }
            None => {
                let mut module = SymbolModule::default();
                module.mark_corrupt();
                return module;
            }
        }
    };

    let mut parser = Parser {
        module: &mut module,
        current_function: None,
    };
    for line in lines {
        if line.len() > MAX_SYMBOL_LINE_LEN {
            debug!(len = line.len(), "symbol line over the length bound");
            parser.module.mark_corrupt();
            break;
        }
        let Ok(line) = std::str::from_utf8(trim_record(line)) else {
            parser.module.mark_corrupt();
            continue;
        };
        if line.is_empty() {
            continue;
        }
        if !parser.record(line) {
            debug!(line, "malformed symbol record");
            parser.module.mark_corrupt();
        }
    }
    parser.flush_function();

    module.finalize();
    module
}

fn trim_record(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

fn parse_module_record(line: &[u8]) -> Option<SymbolModule> {
    let line = std::str::from_utf8(line).ok()?;
    let mut words = line.splitn(5, ' ');
    if words.next() != Some("MODULE") {
        return None;
    }
    let os = words.next()?;
    let arch = words.next()?;
    let debug_id = words.next()?;
    let debug_file = words.next()?;
    Some(SymbolModule::new(os, arch, debug_id, debug_file))
}

struct Parser<'m> {
    module: &'m mut SymbolModule,
    current_function: Option<Function>,
}

impl<'m> Parser<'m> {
    fn flush_function(&mut self) {
        if let Some(function) = self.current_function.take() {
            self.module.add_function(function);
        }
    }

    /// Parse one record. Returns false when the record is malformed.
    fn record(&mut self, line: &str) -> bool {
        let Some((keyword, rest)) = line.split_once(' ') else {
            return false;
        };
        match keyword {
            // Module identity was already consumed; a second MODULE
            // record is malformed.
            "MODULE" => false,
            // Optional metadata; all subkinds are fine to skip.
            "INFO" => {
                self.flush_function();
                true
            }
            "FILE" => {
                self.flush_function();
                self.file(rest)
            }
            "INLINE_ORIGIN" => {
                self.flush_function();
                self.inline_origin(rest)
            }
            "FUNC" => {
                self.flush_function();
                self.func(rest)
            }
            "PUBLIC" => {
                self.flush_function();
                self.public(rest)
            }
            "STACK" => {
                self.flush_function();
                self.stack(rest)
            }
            "INLINE" => self.inline(rest),
            _ => self.line_record(line),
        }
    }

    fn file(&mut self, rest: &str) -> bool {
        let Some((id, path)) = rest.split_once(' ') else {
            return false;
        };
        let Ok(id) = id.parse::<u32>() else {
            return false;
        };
        // Duplicate file ids are rejected.
        self.module.set_file(id, path)
    }

    fn inline_origin(&mut self, rest: &str) -> bool {
        let Some((id, name)) = rest.split_once(' ') else {
            return false;
        };
        let Ok(id) = id.parse::<u32>() else {
            return false;
        };
        self.module.set_inline_origin(id, demangle_or_keep(name))
    }

    fn func(&mut self, rest: &str) -> bool {
        let (is_multiple, rest) = strip_multiple_flag(rest);
        let mut words = rest.splitn(4, ' ');
        let (Some(address), Some(size), Some(parameter_size), Some(name)) = (
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next(),
        ) else {
            return false;
        };
        self.current_function = Some(Function {
            name: demangle_or_keep(name),
            ranges: vec![(address, address + size)],
            parameter_size: parameter_size as u32,
            is_multiple,
            prefer_extern_name: false,
            lines: Vec::new(),
            inlines: Vec::new(),
        });
        true
    }

    fn public(&mut self, rest: &str) -> bool {
        let (is_multiple, rest) = strip_multiple_flag(rest);
        let mut words = rest.splitn(3, ' ');
        let (Some(address), Some(parameter_size), Some(name)) = (
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next(),
        ) else {
            return false;
        };
        self.module.add_public(PublicSymbol {
            address,
            name: demangle_or_keep(name),
            parameter_size: parameter_size as u32,
            is_multiple,
        });
        true
    }

    fn inline(&mut self, rest: &str) -> bool {
        let Some(function) = self.current_function.as_mut() else {
            return false;
        };
        let mut words = rest.split(' ');
        let (Some(depth), Some(call_line), Some(call_file), Some(origin_id)) = (
            words.next().and_then(|w| w.parse::<u32>().ok()),
            words.next().and_then(|w| w.parse::<u32>().ok()),
            words.next().and_then(|w| w.parse::<u32>().ok()),
            words.next().and_then(|w| w.parse::<u32>().ok()),
        ) else {
            return false;
        };
        let mut ranges = Vec::new();
        loop {
            match (words.next(), words.next()) {
                (Some(address), Some(size)) => {
                    let (Some(address), Some(size)) = (parse_hex(address), parse_hex(size)) else {
                        return false;
                    };
                    ranges.push((address, address + size));
                }
                (None, _) => break,
                _ => return false,
            }
        }
        if ranges.is_empty() {
            return false;
        }
        function.inlines.push(Inline {
            origin_id,
            depth,
            call_file,
            call_line,
            ranges,
        });
        true
    }

    fn line_record(&mut self, line: &str) -> bool {
        let mut words = line.split(' ');
        let (Some(address), Some(size), Some(line_number), Some(file_id), None) = (
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(|w| w.parse::<u32>().ok()),
            words.next().and_then(|w| w.parse::<u32>().ok()),
            words.next(),
        ) else {
            return false;
        };
        let Some(function) = self.current_function.as_mut() else {
            // A line record with no open function has nowhere to go.
            return false;
        };
        function.lines.push(Line {
            address,
            size,
            file_id,
            line: line_number,
        });
        true
    }

    fn stack(&mut self, rest: &str) -> bool {
        match rest.split_once(' ') {
            Some(("WIN", rest)) => self.stack_win(rest),
            Some(("CFI", rest)) => self.stack_cfi(rest),
            _ => false,
        }
    }

    fn stack_win(&mut self, rest: &str) -> bool {
        let mut words = rest.splitn(11, ' ');
        let (
            Some(record_type),
            Some(rva),
            Some(code_size),
            Some(prolog_size),
            Some(epilog_size),
            Some(parameter_size),
            Some(saved_register_size),
            Some(local_size),
            Some(max_stack_size),
            Some(has_program),
            Some(last),
        ) = (
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next().and_then(parse_hex),
            words.next(),
        )
        else {
            return false;
        };
        let (program_string, allocates_base_pointer) = if has_program != 0 {
            (Some(last.to_string()), false)
        } else {
            (None, last != "0")
        };
        self.module.add_windows_frame_info(WindowsFrameInfo {
            frame_type: WindowsFrameType::from_record_type(record_type as u32),
            rva,
            code_size,
            prolog_size: prolog_size as u32,
            epilog_size: epilog_size as u32,
            parameter_size: parameter_size as u32,
            saved_register_size: saved_register_size as u32,
            local_size: local_size as u32,
            max_stack_size: max_stack_size as u32,
            allocates_base_pointer,
            program_string,
        });
        true
    }

    fn stack_cfi(&mut self, rest: &str) -> bool {
        if let Some(rest) = rest.strip_prefix("INIT ") {
            let mut words = rest.splitn(3, ' ');
            let (Some(address), Some(size), Some(rules)) = (
                words.next().and_then(parse_hex),
                words.next().and_then(parse_hex),
                words.next(),
            ) else {
                return false;
            };
            self.module.add_cfi_init(address, size, rules);
            true
        } else {
            let Some((address, rules)) = rest.split_once(' ') else {
                return false;
            };
            let Some(address) = parse_hex(address) else {
                return false;
            };
            // Deltas must land inside the preceding INIT range.
            self.module.add_cfi_delta(address, rules)
        }
    }
}

fn strip_multiple_flag(rest: &str) -> (bool, &str) {
    match rest.strip_prefix("m ") {
        Some(rest) => (true, rest),
        None => (false, rest),
    }
}

fn parse_hex(word: &str) -> Option<u64> {
    if word.is_empty() {
        return None;
    }
    u64::from_str_radix(word, 16).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(text: &str) -> SymbolModule {
        parse_symbol_file(text.as_bytes())
    }

    #[test]
    fn minimal_module() {
        let module = parse("MODULE linux x86_64 000000000000000000000000000000000 m\n");
        assert!(!module.is_corrupt);
        assert_eq!(module.arch, "x86_64");
        assert_eq!(module.debug_file, "m");
    }

    #[test]
    fn missing_module_record_is_corrupt() {
        let module = parse("FILE 1 a.c\n");
        assert!(module.is_corrupt);
    }

    #[test]
    fn function_with_lines() {
        let module = parse(
            "MODULE linux x86_64 0 m\n\
             FILE 1 a.c\n\
             FUNC 1000 20 0 f\n\
             1000 10 10 1\n\
             1010 10 11 1\n",
        );
        assert!(!module.is_corrupt);
        let i = module.function_index_at(0x1010).unwrap();
        let f = &module.functions()[i];
        assert_eq!(f.name, "f");
        assert_eq!(f.lines.len(), 2);
        assert_eq!(module.file_name(1), Some("a.c"));
    }

    #[test]
    fn mangled_names_are_demangled() {
        let module = parse(
            "MODULE linux x86_64 0 m\n\
             FUNC 2000 10 0 _ZN1n1fEi\n",
        );
        let i = module.function_index_at(0x2000).unwrap();
        assert_eq!(module.functions()[i].name, "n::f(int)");
    }

    #[test]
    fn windows_paths_and_spaces_in_names() {
        let module = parse(
            "MODULE windows x86 0 m\n\
             FILE 1 c:\\build site\\src\\a.cpp\n\
             PUBLIC 1000 4 operator new(unsigned int)\n",
        );
        assert!(!module.is_corrupt);
        assert_eq!(module.file_name(1), Some("c:\\build site\\src\\a.cpp"));
        assert_eq!(
            module.public_at(0x1000).unwrap().name,
            "operator new(unsigned int)"
        );
    }

    #[test]
    fn multiple_flags() {
        let module = parse(
            "MODULE linux x86 0 m\n\
             FUNC m 1000 10 0 folded\n\
             PUBLIC m 2000 0 folded_public\n",
        );
        let i = module.function_index_at(0x1000).unwrap();
        assert!(module.functions()[i].is_multiple);
        assert!(module.public_at(0x2000).unwrap().is_multiple);
    }

    #[test]
    fn inline_records() {
        let module = parse(
            "MODULE linux x86_64 0 m\n\
             FILE 1 a.c\n\
             INLINE_ORIGIN 0 foo\n\
             INLINE_ORIGIN 1 bar\n\
             FUNC 3000 40 0 main\n\
             INLINE 0 10 1 0 3000 20 3030 8\n\
             INLINE 1 20 1 1 3000 10\n\
             3000 40 1 1\n",
        );
        assert!(!module.is_corrupt);
        let i = module.function_index_at(0x3000).unwrap();
        let f = &module.functions()[i];
        assert_eq!(f.inlines.len(), 2);
        assert_eq!(f.inlines[0].depth, 0);
        assert_eq!(f.inlines[0].ranges, vec![(0x3000, 0x3020), (0x3030, 0x3038)]);
        assert_eq!(module.inline_origin(1).unwrap().name, "bar");
    }

    #[test]
    fn unknown_records_corrupt_but_keep_parsing() {
        let module = parse(
            "MODULE linux x86 0 m\n\
             WOBBLE 12 34\n\
             FUNC 1000 10 0 f\n",
        );
        assert!(module.is_corrupt);
        assert!(module.function_index_at(0x1005).is_some());
    }

    #[test]
    fn orphan_line_record_is_corrupt() {
        let module = parse(
            "MODULE linux x86 0 m\n\
             1000 10 5 1\n",
        );
        assert!(module.is_corrupt);
    }

    #[test]
    fn duplicate_file_id_rejected() {
        let module = parse(
            "MODULE linux x86 0 m\n\
             FILE 1 a.c\n\
             FILE 1 b.c\n",
        );
        assert!(module.is_corrupt);
        assert_eq!(module.file_name(1), Some("a.c"));
    }

    #[test]
    fn stack_win_record() {
        let module = parse(
            "MODULE windows x86 0 m\n\
             STACK WIN 4 1000 6e 5 0 8 4 10 0 1 $T0 $ebp = $eip $T0 4 + ^ =\n\
             STACK WIN 0 2000 20 3 0 4 4 0 0 0 1\n",
        );
        assert!(!module.is_corrupt);
        let fd = module.windows_frame_info_at(0x1010).unwrap();
        assert_eq!(fd.frame_type, WindowsFrameType::FrameData);
        assert_eq!(
            fd.program_string.as_deref(),
            Some("$T0 $ebp = $eip $T0 4 + ^ =")
        );
        let fpo = module.windows_frame_info_at(0x2000).unwrap();
        assert_eq!(fpo.frame_type, WindowsFrameType::Fpo);
        assert!(fpo.allocates_base_pointer);
    }

    #[test]
    fn stack_cfi_records() {
        let module = parse(
            "MODULE linux x86 0 m\n\
             STACK CFI INIT 1000 40 .cfa: $esp 4 + .ra: .cfa 4 - ^\n\
             STACK CFI 1004 .cfa: $esp 8 +\n",
        );
        assert!(!module.is_corrupt);
        let entry = module.cfi_entry_at(0x1004).unwrap();
        assert_eq!(entry.init, ".cfa: $esp 4 + .ra: .cfa 4 - ^");
        assert_eq!(entry.deltas, vec![(0x1004, ".cfa: $esp 8 +".to_string())]);
    }

    #[test]
    fn stray_cfi_delta_is_corrupt() {
        let module = parse(
            "MODULE linux x86 0 m\n\
             STACK CFI 1004 .cfa: $esp 8 +\n",
        );
        assert!(module.is_corrupt);
    }

    #[test]
    fn overlong_line_rejects_remainder() {
        let mut text = String::from("MODULE linux x86 0 m\n");
        text.push_str(&"x".repeat(MAX_SYMBOL_LINE_LEN + 1));
        text.push_str("\nFUNC 1000 10 0 f\n");
        let module = parse(&text);
        assert!(module.is_corrupt);
        assert!(module.function_index_at(0x1000).is_none());
    }
}
