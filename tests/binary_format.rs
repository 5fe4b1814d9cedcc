//! Frozen-binary structure: trailer, alignment, tail-first parse.

use wasmfreeze::{BinaryModule, Compiler, CompilerConfig};

fn build(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("test module is well-formed")
}

const MODULE: &str = r#"(module
    (import "builtin" "trap" (func $trap))
    (memory 2 10)
    (data (i32.const 8) "hello world")
    (table 2 funcref)
    (elem (i32.const 1) $named)
    (global $g (mut i32) (i32.const 7))
    (global $answer f64 (f64.const 2.5))
    (export "g" (global $g))
    (export "answer" (global $answer))
    (func $named (export "named") (param i32) (result i32)
        local.get 0)
    (func $start_fn global.get $g drop)
    (start $start_fn))"#;

#[test_log::test]
fn parse_round_trips_the_writer() {
    let binary = Compiler::new(CompilerConfig::new().stacktrace_records(12))
        .compile(&build(MODULE), &[])
        .unwrap();
    let bytes = binary.bytes();

    // The image is 4-byte aligned overall and ends in the 16-byte trailer.
    assert_eq!(bytes.len() % 4, 0);
    let module_size = u32::from_le_bytes(bytes[bytes.len() - 16..bytes.len() - 12].try_into().unwrap());
    assert_eq!(module_size as usize, bytes.len());

    let parsed = BinaryModule::parse(bytes).unwrap();
    assert_eq!(parsed.stacktrace_records, 12);
    assert!(!parsed.debug_mode);
    assert_eq!(parsed.initial_pages, Some(2));
    assert!(parsed.link_data_size % 8 == 0);

    // Exports carry the signature string and an embedded wrapper.
    let named = parsed.export("named").unwrap();
    assert_eq!(named.signature, "(i)i");
    assert_eq!(named.wrapper_offset % 4, 0);
    assert!(parsed.export("nope").is_none());

    // One import slot, dynamically linked.
    assert_eq!(parsed.link_status, vec![2]);
    assert_eq!(parsed.dynamic_imports.len(), 1);
    assert_eq!(parsed.dynamic_imports[0].module, "builtin");
    assert_eq!(parsed.dynamic_imports[0].signature, "()");
    assert_eq!(parsed.dynamic_imports[0].link_offset % 8, 0);

    // Table: entry 0 undefined, entry 1 populated.
    assert_eq!(parsed.table.len(), 2);
    assert_eq!(parsed.table[0], (0xFFFF_FFFF, 0xFFFF_FFFF));
    assert_ne!(parsed.table[1].1, 0xFFFF_FFFF);
    assert_eq!(parsed.table_wrappers.len(), 2);
    assert_eq!(parsed.table_wrappers[0], 0xFFFF_FFFF);

    // Globals: the mutable one has a slot, the immutable f64 its bits.
    assert_eq!(parsed.mutable_globals.len(), 1);
    let answer = parsed.exported_global("answer").unwrap();
    assert!(!answer.mutable);
    assert_eq!(answer.ty, wasmfreeze::ValType::F64);
    let g = parsed.exported_global("g").unwrap();
    assert!(g.mutable);

    // Start function present with an empty signature.
    assert_eq!(parsed.start.as_ref().unwrap().signature, "()");

    // The data segment survives with its bytes reachable in the image.
    assert_eq!(parsed.data_segments.len(), 1);
    let seg = parsed.data_segments[0];
    assert_eq!(seg.memory_offset, 8);
    assert_eq!(seg.len, 11);
    assert_eq!(
        &bytes[seg.image_start as usize..(seg.image_start + seg.len) as usize],
        b"hello world"
    );
}

#[test_log::test]
fn debug_mode_flag_and_map() {
    let binary = Compiler::new(CompilerConfig::new().debug_mode(true))
        .compile(
            &build(r#"(module (func (export "f") (result i32) i32.const 3))"#),
            &[],
        )
        .unwrap();
    let parsed = BinaryModule::parse(binary.bytes()).unwrap();
    assert!(parsed.debug_mode);
    let map = binary.debug_map().expect("debug map emitted");
    assert!(map.len() % 4 == 0);
    // Header: version, three link-data offsets, trap-entry offset.
    assert_eq!(u32::from_le_bytes(map[16..20].try_into().unwrap()), 4);
}

#[test_log::test]
fn hand_crafted_trailer_violations_are_rejected() {
    let binary = Compiler::default()
        .compile(&build("(module)"), &[])
        .unwrap();

    // Truncated image.
    assert!(BinaryModule::parse(&binary.bytes()[..8]).is_err());

    // Corrupt the module size.
    let mut corrupt = binary.bytes().to_vec();
    let at = corrupt.len() - 16;
    corrupt[at..at + 4].copy_from_slice(&0xDEADu32.to_le_bytes());
    assert!(BinaryModule::parse(&corrupt).is_err());

    // A stacktrace record count past the API bound is rejected even
    // though the encoding could carry it.
    let mut corrupt = binary.bytes().to_vec();
    let at = corrupt.len() - 8;
    corrupt[at..at + 4].copy_from_slice(&1000u32.to_le_bytes());
    assert!(BinaryModule::parse(&corrupt).is_err());
}
