//! Resolver-level scenarios: loading symbol files and symbolicating
//! single frames.

use retrace::{
    CpuArch, FrameTrust, LoadResult, ModuleInfo, RawContext, StackFrame, SymbolDatabase,
    WindowsFrameType,
};

fn frame_at(module: &ModuleInfo, instruction: u64) -> StackFrame {
    let mut frame = StackFrame::from_context(
        RawContext::new(CpuArch::X86_64),
        FrameTrust::Context,
    );
    frame.instruction = instruction;
    frame.module = Some(module.clone());
    frame
}

fn symbolize(db: &SymbolDatabase, module: &ModuleInfo, instruction: u64) -> (StackFrame, Vec<StackFrame>) {
    let mut frame = frame_at(module, instruction);
    let mut inline_frames = Vec::new();
    db.fill_source_line_info(&mut frame, &mut inline_frames);
    (frame, inline_frames)
}

#[test]
fn single_function_with_one_line() {
    let module = ModuleInfo::new("m", 0, 0x10000);
    let mut db = SymbolDatabase::new();
    let result = db.load_module(
        &module,
        b"MODULE linux x86_64 000000000000000000000000000000000 m\n\
          FILE 1 a.c\n\
          FUNC 1000 20 0 f\n\
          1000 20 10 1\n",
    );
    assert_eq!(result, LoadResult::Loaded);
    assert!(db.has_module(&module));

    let (frame, inline_frames) = symbolize(&db, &module, 0x1010);
    assert_eq!(frame.function_name.as_deref(), Some("f"));
    assert_eq!(frame.function_base, Some(0x1000));
    assert_eq!(frame.source_file.as_deref(), Some("a.c"));
    assert_eq!(frame.source_line, Some(10));
    assert_eq!(frame.source_line_base, Some(0x1000));
    assert!(inline_frames.is_empty());

    // Outside the function: nothing to say.
    let (frame, _) = symbolize(&db, &module, 0x1020);
    assert_eq!(frame.function_name, None);
}

#[test]
fn mangled_cpp_name_is_demangled() {
    let module = ModuleInfo::new("m", 0, 0x10000);
    let mut db = SymbolDatabase::new();
    db.load_module(
        &module,
        b"MODULE linux x86_64 0 m\n\
          FUNC 2000 10 0 _ZN1n1fEi\n",
    );
    let (frame, _) = symbolize(&db, &module, 0x2000);
    assert_eq!(frame.function_name.as_deref(), Some("n::f(int)"));
}

#[test]
fn inline_chain_innermost_first() {
    let module = ModuleInfo::new("m", 0, 0x10000);
    let mut db = SymbolDatabase::new();
    db.load_module(
        &module,
        b"MODULE linux x86_64 0 m\n\
          FILE 1 a.c\n\
          INLINE_ORIGIN 0 foo\n\
          INLINE_ORIGIN 1 bar\n\
          FUNC 3000 40 0 main\n\
          INLINE 0 10 1 0 3000 20\n\
          INLINE 1 20 1 1 3000 10\n\
          3000 40 1 1\n",
    );

    let (frame, inline_frames) = symbolize(&db, &module, 0x3000);
    assert_eq!(frame.function_name.as_deref(), Some("main"));
    assert_eq!(inline_frames.len(), 2);
    // Innermost first: bar (depth 1), then foo (depth 0).
    assert_eq!(inline_frames[0].function_name.as_deref(), Some("bar"));
    assert_eq!(inline_frames[1].function_name.as_deref(), Some("foo"));
    assert!(inline_frames
        .iter()
        .all(|f| f.trust == FrameTrust::Inline));

    // The innermost inline carries the line record at the address; each
    // enclosing frame sits at its callee's call site.
    assert_eq!(inline_frames[0].source_line, Some(1));
    assert_eq!(inline_frames[1].source_line, Some(20));
    assert_eq!(frame.source_line, Some(10));

    // An address covered by the function but only the outer inline.
    let (_, inline_frames) = symbolize(&db, &module, 0x3010);
    assert_eq!(inline_frames.len(), 1);
    assert_eq!(inline_frames[0].function_name.as_deref(), Some("foo"));
}

#[test]
fn public_symbol_fallback_and_func_preference() {
    let module = ModuleInfo::new("m", 0x400000, 0x10000);
    let mut db = SymbolDatabase::new();
    db.load_module(
        &module,
        b"MODULE linux x86_64 0 m\n\
          FUNC 1000 20 4 covered\n\
          PUBLIC 1000 8 shadowed\n\
          PUBLIC 3000 0 orphan\n",
    );

    // FUNC wins a tie at the same address.
    let (frame, _) = symbolize(&db, &module, 0x401000);
    assert_eq!(frame.function_name.as_deref(), Some("covered"));
    assert_eq!(frame.parameter_size, 4);

    // No function covers this; the nearest public below answers.
    let (frame, _) = symbolize(&db, &module, 0x403456);
    assert_eq!(frame.function_name.as_deref(), Some("orphan"));
    assert_eq!(frame.function_base, Some(0x403000));
}

#[test]
fn corrupt_file_still_answers() {
    let module = ModuleInfo::new("m", 0, 0x10000);
    let mut db = SymbolDatabase::new();
    let result = db.load_module(
        &module,
        b"MODULE linux x86_64 0 m\n\
          GARBAGE record here\n\
          FUNC 1000 20 0 f\n",
    );
    assert_eq!(result, LoadResult::CorruptSymbols);
    let (frame, _) = symbolize(&db, &module, 0x1008);
    assert_eq!(frame.function_name.as_deref(), Some("f"));
}

#[test]
fn unload_forgets_module() {
    let module = ModuleInfo::new("m", 0, 0x10000);
    let mut db = SymbolDatabase::new();
    db.load_module(&module, b"MODULE linux x86_64 0 m\nFUNC 1000 20 0 f\n");
    assert!(db.has_module(&module));
    db.unload_module(&module);
    assert!(!db.has_module(&module));
    let (frame, _) = symbolize(&db, &module, 0x1008);
    assert_eq!(frame.function_name, None);
}

#[test]
fn windows_frame_info_lookup() {
    let module = ModuleInfo::new("m", 0x400000, 0x10000);
    let mut db = SymbolDatabase::new();
    db.load_module(
        &module,
        b"MODULE windows x86 0 m\n\
          STACK WIN 4 1000 100 5 0 8 4 10 0 1 $T0 $ebp = $eip $T0 4 + ^ = $ebp $T0 ^ = $esp $T0 8 + =\n\
          STACK WIN 0 2000 20 3 0 4 4 0 0 0 0\n",
    );
    let frame = frame_at(&module, 0x401050);
    let info = db.find_windows_frame_info(&frame).unwrap();
    assert_eq!(info.frame_type, WindowsFrameType::FrameData);
    assert!(info.program_string.is_some());

    let frame = frame_at(&module, 0x402010);
    let info = db.find_windows_frame_info(&frame).unwrap();
    assert_eq!(info.frame_type, WindowsFrameType::Fpo);
    assert!(!info.allocates_base_pointer);

    let frame = frame_at(&module, 0x403000);
    assert!(db.find_windows_frame_info(&frame).is_none());
}

#[test]
fn cfi_frame_info_applies_deltas() {
    let module = ModuleInfo::new("m", 0x400000, 0x10000);
    let mut db = SymbolDatabase::new();
    db.load_module(
        &module,
        b"MODULE linux x86 0 m\n\
          STACK CFI INIT 1000 40 .cfa: $esp 4 + .ra: .cfa 4 - ^\n\
          STACK CFI 1010 .cfa: $esp 8 +\n",
    );

    use retrace::MemorySnapshot;

    let mut stack_bytes = Vec::new();
    stack_bytes.extend_from_slice(&0x11223344u32.to_le_bytes()); // [0xfff8]
    stack_bytes.extend_from_slice(&0x55667788u32.to_le_bytes()); // [0xfffc]
    stack_bytes.extend_from_slice(&0x99aabbccu32.to_le_bytes()); // [0x10000]
    let memory = MemorySnapshot::new(0xfff8, &stack_bytes);
    let callee = [("esp", 0xfff8u64)].into_iter().collect();

    // Before the delta applies: cfa = esp + 4, ra read at cfa - 4.
    let frame = frame_at(&module, 0x401004);
    let cfi = db.find_cfi_frame_info(&frame).unwrap();
    let caller = cfi.find_caller_regs(&callee, 4, &memory).unwrap();
    assert_eq!(caller[".cfa"], 0xfffc);
    assert_eq!(caller[".ra"], 0x11223344);

    // After the delta the frame grew by four bytes.
    let frame = frame_at(&module, 0x401010);
    let cfi = db.find_cfi_frame_info(&frame).unwrap();
    let caller = cfi.find_caller_regs(&callee, 4, &memory).unwrap();
    assert_eq!(caller[".cfa"], 0x10000);
    assert_eq!(caller[".ra"], 0x55667788);

    // Outside any INIT range.
    let frame = frame_at(&module, 0x401040);
    assert!(db.find_cfi_frame_info(&frame).is_none());
}
