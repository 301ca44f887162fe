//! The serialized resolver backend must answer every query exactly like
//! the parsed backend it came from.

use retrace::{
    CpuArch, FrameTrust, MemorySnapshot, ModuleInfo, RawContext, StackFrame, SymbolDatabase,
};

static SYMBOLS: &str = "MODULE linux x86_64 99B64A2AD4A digest_worker\n\
FILE 1 src/digest.c\n\
FILE 2 src/hex.c\n\
INFO CODE_ID 99B64A2A\n\
INLINE_ORIGIN 0 emit_nibble\n\
INLINE_ORIGIN 1 emit_byte\n\
FUNC 1000 80 0 digest_update\n\
1000 20 11 1\n\
1020 30 12 1\n\
1050 30 14 1\n\
FUNC 1080 40 8 digest_final\n\
INLINE 0 30 2 1 1090 18\n\
INLINE 1 52 2 0 1090 8\n\
1080 10 28 1\n\
1090 18 51 2\n\
10a8 18 31 1\n\
FUNC m 1100 10 0 folded_thunk\n\
PUBLIC 1000 0 digest_update_entry\n\
PUBLIC 2000 c start\n\
PUBLIC m 2100 0 folded_public\n\
STACK WIN 4 1000 80 5 0 8 4 10 0 1 $T0 $ebp = $eip $T0 4 + ^ = $ebp $T0 ^ = $esp $T0 8 + =\n\
STACK WIN 0 1080 40 3 0 4 4 0 0 0 1\n\
STACK CFI INIT 1000 80 .cfa: $rsp 8 + .ra: .cfa 8 - ^\n\
STACK CFI 1001 .cfa: $rsp 16 + $rbx: .cfa 24 - ^\n\
STACK CFI 1010 .cfa: $rsp 24 +\n\
GARBAGE to exercise the corrupt flag\n";

fn frame_at(module: &ModuleInfo, instruction: u64) -> StackFrame {
    let mut frame = StackFrame::from_context(
        RawContext::new(CpuArch::X86_64),
        FrameTrust::Context,
    );
    frame.instruction = instruction;
    frame.module = Some(module.clone());
    frame
}

/// Everything observable about one symbolication query.
type Answer = (
    Option<String>,
    Option<u64>,
    u32,
    bool,
    Option<String>,
    Option<u32>,
    Option<u64>,
    Vec<(Option<String>, Option<u64>, Option<String>, Option<u32>)>,
);

fn query(db: &SymbolDatabase, module: &ModuleInfo, address: u64) -> Answer {
    let mut frame = frame_at(module, address);
    let mut inline_frames = Vec::new();
    db.fill_source_line_info(&mut frame, &mut inline_frames);
    (
        frame.function_name,
        frame.function_base,
        frame.parameter_size,
        frame.is_multiple,
        frame.source_file,
        frame.source_line,
        frame.source_line_base,
        inline_frames
            .into_iter()
            .map(|f| (f.function_name, f.function_base, f.source_file, f.source_line))
            .collect(),
    )
}

#[test]
fn packed_backend_answers_identically() {
    let module = ModuleInfo::new("digest_worker", 0x7f0000000000, 0x10000);
    let mut parsed = SymbolDatabase::new();
    parsed.load_module(&module, SYMBOLS.as_bytes());

    let data = parsed.serialize_module(&module).unwrap();
    let mut packed = SymbolDatabase::new();
    packed.load_packed_module(&module, data).unwrap();

    let memory_bytes = vec![0xabu8; 64];
    let memory = MemorySnapshot::new(0x3000, &memory_bytes);
    let callee: std::collections::HashMap<&str, u64> =
        [("rsp", 0x3000u64), ("rbx", 0x1111u64)].into_iter().collect();

    // Sweep across every interesting boundary, plus both sides of each.
    for rva in (0x0ff0..0x2110).chain([0x0u64, 0xffff].into_iter()) {
        let address = module.base_address + rva;
        assert_eq!(
            query(&parsed, &module, address),
            query(&packed, &module, address),
            "symbolication diverged at rva {rva:#x}"
        );

        let frame = frame_at(&module, address);
        let parsed_win = parsed.find_windows_frame_info(&frame);
        let packed_win = packed.find_windows_frame_info(&frame);
        assert_eq!(parsed_win, packed_win, "STACK WIN diverged at rva {rva:#x}");

        let parsed_cfi = parsed.find_cfi_frame_info(&frame);
        let packed_cfi = packed.find_cfi_frame_info(&frame);
        assert_eq!(
            parsed_cfi.is_some(),
            packed_cfi.is_some(),
            "CFI presence diverged at rva {rva:#x}"
        );
        if let (Some(a), Some(b)) = (parsed_cfi, packed_cfi) {
            assert_eq!(a, b, "CFI rules diverged at rva {rva:#x}");
            let left = a.find_caller_regs(&callee, 8, &memory);
            let right = b.find_caller_regs(&callee, 8, &memory);
            assert_eq!(left, right, "CFI evaluation diverged at rva {rva:#x}");
        }
    }
}

#[test]
fn round_trip_preserves_corrupt_flag() {
    let module = ModuleInfo::new("digest_worker", 0, 0x10000);
    let mut parsed = SymbolDatabase::new();
    let first = parsed.load_module(&module, SYMBOLS.as_bytes());

    let data = parsed.serialize_module(&module).unwrap();
    let mut packed = SymbolDatabase::new();
    let second = packed.load_packed_module(&module, data).unwrap();
    assert_eq!(first, second);
}

#[test]
fn reserialization_is_stable() {
    let module = ModuleInfo::new("digest_worker", 0, 0x10000);
    let mut parsed = SymbolDatabase::new();
    parsed.load_module(&module, SYMBOLS.as_bytes());
    let first = parsed.serialize_module(&module).unwrap();

    let mut packed = SymbolDatabase::new();
    packed.load_packed_module(&module, first.clone()).unwrap();
    let second = packed.serialize_module(&module).unwrap();
    assert_eq!(first, second);
}

#[test]
fn garbage_packed_data_is_rejected() {
    use retrace::PackedError;
    let module = ModuleInfo::new("m", 0, 0x1000);
    let mut db = SymbolDatabase::new();
    assert_eq!(
        db.load_packed_module(&module, b"not a packed module".to_vec()),
        Err(PackedError::Truncated)
    );
    let mut data = vec![0u8; 0x100];
    data[..4].copy_from_slice(b"XXXX");
    assert_eq!(
        db.load_packed_module(&module, data),
        Err(PackedError::BadMagic)
    );
    assert!(!db.has_module(&module));
}
