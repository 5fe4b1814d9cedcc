//! Compile-plane rejection paths; host independent.

use wasmfreeze::{CompileError, Compiler, CompilerConfig};

fn compile(bytes: &[u8]) -> wasmfreeze::Result<wasmfreeze::CompiledBinary> {
    Compiler::new(CompilerConfig::default()).compile(bytes, &[])
}

fn compile_wat(wat: &str) -> wasmfreeze::Result<wasmfreeze::CompiledBinary> {
    compile(&wat::parse_str(wat).expect("test module is well-formed text"))
}

fn expect_validation(result: wasmfreeze::Result<wasmfreeze::CompiledBinary>) -> String {
    match result {
        Err(CompileError::Validation { message, .. }) => message,
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test_log::test]
fn magic_and_version() {
    assert!(matches!(
        compile(b"\0bad\x01\0\0\0"),
        Err(CompileError::Validation { .. })
    ));
    assert!(matches!(
        compile(b"\0asm\x02\0\0\0"),
        Err(CompileError::Validation { .. })
    ));
    // An empty module is fine.
    assert!(compile(b"\0asm\x01\0\0\0").is_ok());
}

#[test_log::test]
fn duplicate_and_misordered_sections() {
    // magic/version + two empty type sections (id 1, size 1, count 0).
    let twice: &[u8] = &[
        0, b'a', b's', b'm', 1, 0, 0, 0, //
        1, 1, 0, //
        1, 1, 0,
    ];
    assert_eq!(expect_validation(compile(twice)), "duplicate section");

    // memory section (5) before function section (3)
    let misordered: &[u8] = &[
        0, b'a', b's', b'm', 1, 0, 0, 0, //
        5, 1, 0, //
        3, 1, 0,
    ];
    assert_eq!(expect_validation(compile(misordered)), "section out of order");
}

#[test_log::test]
fn type_errors_are_caught() {
    // Body returns f32 where i32 is declared.
    let msg = expect_validation(compile_wat(
        r#"(module (func (result i32) f32.const 1))"#,
    ));
    assert!(msg.contains("type mismatch") || msg.contains("operand"), "{msg}");

    // Stack underflow.
    expect_validation(compile_wat(r#"(module (func i32.add drop))"#));

    // Leftover value.
    expect_validation(compile_wat(r#"(module (func i32.const 1))"#));

    // select arms must agree.
    expect_validation(compile_wat(
        r#"(module (func (result i32)
            i32.const 1
            f64.const 2
            i32.const 0
            select))"#,
    ));

    // Branch depth out of range.
    expect_validation(compile_wat(r#"(module (func br 2))"#));
}

#[test_log::test]
fn unreachable_code_is_still_typed() {
    // Dead code after a branch may conjure polymorphic values.
    assert!(compile_wat(
        r#"(module (func (result i32)
            block (result i32)
                i32.const 1
                br 0
                i32.add
            end))"#,
    )
    .is_ok());

    // An if without else must be type neutral.
    expect_validation(compile_wat(
        r#"(module (func (result i32)
            i32.const 1
            if (result i32)
                i32.const 2
            end))"#,
    ));
}

#[test_log::test]
fn alignment_immediates_are_checked() {
    expect_validation(compile_wat(
        r#"(module (memory 1) (func (result i32)
            i32.const 0
            i32.load align=8))"#,
    ));
}

#[test_log::test]
fn unsupported_features_are_named() {
    // Multiple return values are outside the MVP surface here.
    let result = compile_wat(
        r#"(module (func (export "two") (result i32 i32)
            i32.const 1
            i32.const 2))"#,
    );
    assert!(matches!(result, Err(CompileError::FeatureNotSupported(_))));

    // Imported tables are not supported.
    let result = compile_wat(r#"(module (import "env" "t" (table 1 funcref)))"#);
    assert!(matches!(result, Err(CompileError::FeatureNotSupported(_))));
}

#[test_log::test]
fn linking_errors() {
    let result = compile_wat(r#"(module (import "env" "f" (func)))"#);
    assert!(matches!(result, Err(CompileError::Linking { .. })));
}

#[test_log::test]
fn rejections_are_deterministic() {
    let bad = wat::parse_str(r#"(module (func (result i32) f32.const 1))"#).unwrap();
    let a = format!("{:?}", compile(&bad).unwrap_err());
    let b = format!("{:?}", compile(&bad).unwrap_err());
    assert_eq!(a, b);
}
