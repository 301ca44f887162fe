//! Driving the DWARF CU assembler with synthetic DIE event streams.

use std::collections::BTreeMap;

use retrace::gimli::constants as dw;
use retrace::{
    CuAssembler, InterCuTable, Line, LineReadError, LineToModule, Reporter, SymbolModule,
};

#[derive(Default)]
struct CountingReporter {
    cu_names: Vec<String>,
    unknown_specifications: usize,
    unknown_abstract_origins: usize,
    missing_sections: Vec<String>,
    bad_line_offsets: usize,
    uncovered_functions: usize,
    uncovered_lines: usize,
    unnamed_functions: usize,
    demangle_errors: usize,
    inter_cu_references: usize,
}

impl Reporter for CountingReporter {
    fn cu_name(&mut self, name: &str) {
        self.cu_names.push(name.to_string());
    }
    fn unknown_specification(&mut self, _: u64, _: u64) {
        self.unknown_specifications += 1;
    }
    fn unknown_abstract_origin(&mut self, _: u64, _: u64) {
        self.unknown_abstract_origins += 1;
    }
    fn missing_section(&mut self, section: &str) {
        self.missing_sections.push(section.to_string());
    }
    fn bad_line_info_offset(&mut self, _: u64) {
        self.bad_line_offsets += 1;
    }
    fn uncovered_function(&mut self, _: &str, _: u64) {
        self.uncovered_functions += 1;
    }
    fn uncovered_line(&mut self, _: u64, _: u32) {
        self.uncovered_lines += 1;
    }
    fn unnamed_function(&mut self, _: u64) {
        self.unnamed_functions += 1;
    }
    fn demangle_error(&mut self, _: &str) {
        self.demangle_errors += 1;
    }
    fn unhandled_inter_cu_reference(&mut self, _: u64, _: u64) {
        self.inter_cu_references += 1;
    }
}

/// Line reader canned with files (1-based indices) and line records.
#[derive(Default)]
struct TestLineReader {
    files: Vec<&'static str>,
    /// (address, size, line number, 1-based file index)
    lines: Vec<(u64, u64, u32, usize)>,
}

impl LineToModule for TestLineReader {
    fn start_cu(&mut self, _compilation_dir: &str) {}

    fn read_program(
        &mut self,
        _offset: u64,
        module: &mut SymbolModule,
        lines: &mut Vec<Line>,
        files: &mut BTreeMap<u64, u32>,
    ) -> Result<(), LineReadError> {
        for (index, name) in self.files.iter().enumerate() {
            let id = module.intern_file(name);
            files.insert((index + 1) as u64, id);
        }
        for &(address, size, line, file_index) in &self.lines {
            lines.push(Line {
                address,
                size,
                file_id: files[&(file_index as u64)],
                line,
            });
        }
        Ok(())
    }
}

fn new_module() -> SymbolModule {
    SymbolModule::new("linux", "x86_64", "0", "unit-under-test")
}

#[test]
fn simple_function_with_lines() {
    let mut module = new_module();
    let mut reporter = CountingReporter::default();
    let mut line_reader = TestLineReader {
        files: vec!["src/worker.c"],
        lines: vec![(0x1000, 0x80, 10, 1), (0x1080, 0x80, 11, 1)],
    };
    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            None,
            0,
        );
        assert!(cu.start_die(0x1, dw::DW_TAG_compile_unit));
        cu.attr_string(dw::DW_AT_name, "worker.c");
        cu.attr_unsigned(dw::DW_AT_stmt_list, dw::DW_FORM_sec_offset, 0);
        cu.end_attributes();

        assert!(cu.start_die(0x10, dw::DW_TAG_subprogram));
        cu.attr_string(dw::DW_AT_name, "function1");
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x1000);
        // DWARF 4 size-form high_pc normalizes to low_pc + size.
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x100);
        cu.end_attributes();
        cu.end_die();

        cu.end_die();
        cu.finish();
    }
    module.finalize();

    assert_eq!(reporter.cu_names, vec!["worker.c"]);
    let index = module.function_index_at(0x1050).unwrap();
    let function = &module.functions()[index];
    assert_eq!(function.name, "function1");
    assert_eq!(function.ranges, vec![(0x1000, 0x1100)]);
    assert_eq!(function.lines.len(), 2);
    assert_eq!(module.file_name(function.lines[0].file_id), Some("src/worker.c"));
    assert_eq!(reporter.uncovered_functions, 0);
}

#[test]
fn declaration_definition_stitching() {
    let mut module = new_module();
    let mut reporter = CountingReporter::default();
    let mut line_reader = TestLineReader::default();
    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            None,
            0,
        );
        cu.start_die(0x1, dw::DW_TAG_compile_unit);
        cu.attr_string(dw::DW_AT_name, "widget.cc");
        cu.end_attributes();

        cu.start_die(0x10, dw::DW_TAG_namespace);
        cu.attr_string(dw::DW_AT_name, "ns");
        cu.end_attributes();

        cu.start_die(0x20, dw::DW_TAG_structure_type);
        cu.attr_string(dw::DW_AT_name, "Widget");
        cu.end_attributes();

        // Member function declaration: names and scope, no code.
        cu.start_die(0x30, dw::DW_TAG_subprogram);
        cu.attr_string(dw::DW_AT_name, "frob");
        cu.attr_unsigned(dw::DW_AT_declaration, dw::DW_FORM_flag_present, 1);
        cu.end_attributes();
        cu.end_die();

        cu.end_die(); // Widget
        cu.end_die(); // ns

        // Out-of-line definition referring back to the declaration.
        cu.start_die(0x100, dw::DW_TAG_subprogram);
        cu.attr_reference(dw::DW_AT_specification, 0x30);
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x2000);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data4, 0x40);
        cu.end_attributes();
        cu.end_die();

        cu.end_die();
        cu.finish();
    }
    module.finalize();

    assert_eq!(reporter.unknown_specifications, 0);
    let index = module.function_index_at(0x2000).unwrap();
    assert_eq!(module.functions()[index].name, "ns::Widget::frob");
}

#[test]
fn inlined_subroutine_chain() {
    let mut module = new_module();
    let mut reporter = CountingReporter::default();
    let mut line_reader = TestLineReader {
        files: vec!["inline.c"],
        lines: vec![(0x1000, 0x100, 5, 1)],
    };
    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            None,
            0,
        );
        cu.start_die(0x1, dw::DW_TAG_compile_unit);
        cu.attr_string(dw::DW_AT_name, "inline.c");
        cu.attr_unsigned(dw::DW_AT_stmt_list, dw::DW_FORM_sec_offset, 0);
        cu.end_attributes();

        // The abstract definition of the inlined function.
        cu.start_die(0x50, dw::DW_TAG_subprogram);
        cu.attr_string(dw::DW_AT_name, "frobnicate");
        cu.attr_unsigned(dw::DW_AT_inline, dw::DW_FORM_udata, 1);
        cu.end_attributes();
        cu.end_die();

        cu.start_die(0x100, dw::DW_TAG_subprogram);
        cu.attr_string(dw::DW_AT_name, "main");
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x1000);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x100);
        cu.end_attributes();

        cu.start_die(0x110, dw::DW_TAG_inlined_subroutine);
        cu.attr_reference(dw::DW_AT_abstract_origin, 0x50);
        cu.attr_unsigned(dw::DW_AT_call_file, dw::DW_FORM_udata, 1);
        cu.attr_unsigned(dw::DW_AT_call_line, dw::DW_FORM_udata, 42);
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x1010);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x20);
        cu.end_attributes();

        // A nested inlined call inside the first one.
        cu.start_die(0x120, dw::DW_TAG_inlined_subroutine);
        cu.attr_reference(dw::DW_AT_abstract_origin, 0x50);
        cu.attr_unsigned(dw::DW_AT_call_file, dw::DW_FORM_udata, 1);
        cu.attr_unsigned(dw::DW_AT_call_line, dw::DW_FORM_udata, 43);
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x1018);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x8);
        cu.end_attributes();
        cu.end_die();

        cu.end_die(); // outer inlined_subroutine
        cu.end_die(); // main
        cu.end_die(); // root
        cu.finish();
    }
    module.finalize();

    let index = module.function_index_at(0x1010).unwrap();
    let function = &module.functions()[index];
    assert_eq!(function.inlines.len(), 2);
    assert_eq!(function.inlines[0].depth, 0);
    assert_eq!(function.inlines[0].call_line, 42);
    assert_eq!(function.inlines[0].ranges, vec![(0x1010, 0x1030)]);
    assert_eq!(function.inlines[1].depth, 1);
    assert_eq!(function.inlines[1].call_line, 43);
    let origin = module.inline_origin(function.inlines[0].origin_id).unwrap();
    assert_eq!(origin.name, "frobnicate");
    // Call-site file indices resolve through the line program's table.
    assert_eq!(
        module.file_name(function.inlines[0].call_file),
        Some("inline.c")
    );
}

#[test]
fn unknown_specification_falls_back_to_name_omitted() {
    let mut module = new_module();
    let mut reporter = CountingReporter::default();
    let mut line_reader = TestLineReader::default();
    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            None,
            0,
        );
        cu.start_die(0x1, dw::DW_TAG_compile_unit);
        cu.attr_string(dw::DW_AT_name, "broken.c");
        cu.end_attributes();

        cu.start_die(0x10, dw::DW_TAG_subprogram);
        cu.attr_reference(dw::DW_AT_specification, 0x999);
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x4000);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x10);
        cu.end_attributes();
        cu.end_die();

        cu.end_die();
        cu.finish();
    }
    module.finalize();

    assert_eq!(reporter.unknown_specifications, 1);
    assert_eq!(reporter.unnamed_functions, 1);
    let index = module.function_index_at(0x4000).unwrap();
    let function = &module.functions()[index];
    assert_eq!(function.name, "<name omitted>");
    assert!(function.prefer_extern_name);
}

#[test]
fn inter_cu_reference_through_shared_table() {
    let mut module = new_module();
    let mut reporter = CountingReporter::default();
    let mut line_reader = TestLineReader::default();
    let mut table = InterCuTable::new();

    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            Some(&mut table),
            0,
        );
        cu.start_die(0x1, dw::DW_TAG_compile_unit);
        cu.attr_string(dw::DW_AT_name, "decls.cc");
        cu.end_attributes();

        cu.start_die(0x10, dw::DW_TAG_namespace);
        cu.attr_string(dw::DW_AT_name, "ns");
        cu.end_attributes();

        cu.start_die(0x30, dw::DW_TAG_subprogram);
        cu.attr_string(dw::DW_AT_name, "helper");
        cu.attr_unsigned(dw::DW_AT_declaration, dw::DW_FORM_flag_present, 1);
        cu.end_attributes();
        cu.end_die();

        cu.end_die();
        cu.end_die();
        cu.finish();
    }
    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            Some(&mut table),
            0x1000,
        );
        cu.start_die(0x1001, dw::DW_TAG_compile_unit);
        cu.attr_string(dw::DW_AT_name, "defs.cc");
        cu.end_attributes();

        cu.start_die(0x1010, dw::DW_TAG_subprogram);
        cu.attr_reference(dw::DW_AT_specification, 0x30);
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x3000);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x10);
        cu.end_attributes();
        cu.end_die();

        cu.end_die();
        cu.finish();
    }
    module.finalize();

    assert_eq!(reporter.unknown_specifications, 0);
    assert_eq!(reporter.inter_cu_references, 0);
    let index = module.function_index_at(0x3000).unwrap();
    assert_eq!(module.functions()[index].name, "ns::helper");
}

#[test]
fn inter_cu_reference_reported_when_disabled() {
    let mut module = new_module();
    let mut reporter = CountingReporter::default();
    let mut line_reader = TestLineReader::default();
    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            None,
            0x1000,
        );
        cu.start_die(0x1001, dw::DW_TAG_compile_unit);
        cu.attr_string(dw::DW_AT_name, "defs.cc");
        cu.end_attributes();

        cu.start_die(0x1010, dw::DW_TAG_subprogram);
        // Points before this CU: can only be an inter-CU reference.
        cu.attr_reference(dw::DW_AT_specification, 0x30);
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x3000);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x10);
        cu.end_attributes();
        cu.end_die();

        cu.end_die();
        cu.finish();
    }
    module.finalize();

    assert_eq!(reporter.inter_cu_references, 1);
    assert_eq!(reporter.unknown_specifications, 0);
}

#[test]
fn java_names_use_dot_separator() {
    let mut module = new_module();
    let mut reporter = CountingReporter::default();
    let mut line_reader = TestLineReader::default();
    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            None,
            0,
        );
        cu.start_die(0x1, dw::DW_TAG_compile_unit);
        cu.attr_string(dw::DW_AT_name, "App.java");
        // Signed language attributes are accepted too.
        cu.attr_signed(dw::DW_AT_language, dw::DW_LANG_Java.0 as i64);
        cu.end_attributes();

        cu.start_die(0x10, dw::DW_TAG_class_type);
        cu.attr_string(dw::DW_AT_name, "App");
        cu.end_attributes();

        cu.start_die(0x20, dw::DW_TAG_subprogram);
        cu.attr_string(dw::DW_AT_name, "run");
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x5000);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x20);
        cu.end_attributes();
        cu.end_die();

        cu.end_die();
        cu.end_die();
        cu.finish();
    }
    module.finalize();

    let index = module.function_index_at(0x5000).unwrap();
    assert_eq!(module.functions()[index].name, "App.run");
}

#[test]
fn rust_names_pass_through_the_demangler() {
    let mut module = new_module();
    let mut reporter = CountingReporter::default();
    let mut line_reader = TestLineReader::default();
    {
        let mut cu = CuAssembler::new(
            &mut module,
            &mut reporter,
            &mut line_reader,
            None,
            None,
            0,
        );
        cu.start_die(0x1, dw::DW_TAG_compile_unit);
        cu.attr_string(dw::DW_AT_name, "lib.rs");
        cu.attr_unsigned(
            dw::DW_AT_language,
            dw::DW_FORM_udata,
            u64::from(dw::DW_LANG_Rust.0),
        );
        cu.end_attributes();

        cu.start_die(0x10, dw::DW_TAG_subprogram);
        cu.attr_string(dw::DW_AT_name, "bar");
        cu.attr_string(dw::DW_AT_linkage_name, "_RNvC6_123foo3bar");
        cu.attr_unsigned(dw::DW_AT_low_pc, dw::DW_FORM_addr, 0x6000);
        cu.attr_unsigned(dw::DW_AT_high_pc, dw::DW_FORM_data8, 0x20);
        cu.end_attributes();
        cu.end_die();

        cu.end_die();
        cu.finish();
    }
    module.finalize();

    let index = module.function_index_at(0x6000).unwrap();
    assert_eq!(module.functions()[index].name, "123foo::bar");
    assert_eq!(reporter.demangle_errors, 0);
}
