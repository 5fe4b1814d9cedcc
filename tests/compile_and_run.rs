//! End-to-end scenarios: compile wat-built modules, freeze, load, run.
#![cfg(all(
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64"),
    not(feature = "cross-rv32")
))]

use core::ffi::c_void;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use wasmfreeze::{
    AbiVersion, CallError, Compiler, CompilerConfig, Linkage, NativeSymbol, Runtime, TrapCode,
    WasmValue,
};

fn stack_top() -> *const u8 {
    let marker = 0u8;
    &marker as *const u8
}

fn build(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("test module is well-formed")
}

fn run_module(wat: &str) -> Runtime {
    let binary = Runtime::compile(&build(wat), &[]).unwrap();
    Runtime::init_from_compiled(binary.bytes(), &[]).unwrap()
}

#[test_log::test]
fn add_two() {
    let mut runtime = run_module(
        r#"(module
            (func (export "addTwo") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
    );
    let results = runtime
        .call_exported(
            "addTwo",
            stack_top(),
            &[WasmValue::I32(1), WasmValue::I32(2)],
        )
        .unwrap();
    assert_eq!(results.as_slice(), &[WasmValue::I32(3)]);
    assert!(runtime.has_exported_function("addTwo"));
    assert!(!runtime.has_exported_function("subTwo"));
}

#[test_log::test]
fn arithmetic_and_locals() {
    let mut runtime = run_module(
        r#"(module
            (func (export "fac") (param i32) (result i32)
                (local i32)
                i32.const 1
                local.set 1
                block
                    loop
                        local.get 0
                        i32.eqz
                        br_if 1
                        local.get 0
                        local.get 1
                        i32.mul
                        local.set 1
                        local.get 0
                        i32.const 1
                        i32.sub
                        local.set 0
                        br 0
                    end
                end
                local.get 1))"#,
    );
    let results = runtime
        .call_exported("fac", stack_top(), &[WasmValue::I32(5)])
        .unwrap();
    assert_eq!(results.as_slice(), &[WasmValue::I32(120)]);
}

#[test_log::test]
fn sixty_four_bit_and_floats() {
    let mut runtime = run_module(
        r#"(module
            (func (export "mix") (param i64 f64) (result f64)
                local.get 0
                f64.convert_i64_s
                local.get 1
                f64.add)
            (func (export "shift") (param i64 i64) (result i64)
                local.get 0
                local.get 1
                i64.shl))"#,
    );
    let results = runtime
        .call_exported(
            "mix",
            stack_top(),
            &[WasmValue::I64(40), WasmValue::from(2.5f64)],
        )
        .unwrap();
    assert_eq!(results[0].f64(), Some(42.5));

    let results = runtime
        .call_exported(
            "shift",
            stack_top(),
            &[WasmValue::I64(3), WasmValue::I64(4)],
        )
        .unwrap();
    assert_eq!(results[0].i64(), Some(48));
}

#[test_log::test]
fn select_and_if_else() {
    let mut runtime = run_module(
        r#"(module
            (func (export "pick") (param i32) (result i32)
                i32.const 11
                i32.const 22
                local.get 0
                select)
            (func (export "cond") (param i32) (result i32)
                local.get 0
                if (result i32)
                    i32.const 1
                else
                    i32.const 2
                end))"#,
    );
    let r = runtime
        .call_exported("pick", stack_top(), &[WasmValue::I32(1)])
        .unwrap();
    assert_eq!(r[0].i32(), Some(11));
    let r = runtime
        .call_exported("pick", stack_top(), &[WasmValue::I32(0)])
        .unwrap();
    assert_eq!(r[0].i32(), Some(22));
    let r = runtime
        .call_exported("cond", stack_top(), &[WasmValue::I32(0)])
        .unwrap();
    assert_eq!(r[0].i32(), Some(2));
}

static LOGGED: AtomicI32 = AtomicI32::new(0);
static LOG_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn host_log(value: i32, _ctx: *mut c_void) {
    LOGGED.store(value, Ordering::SeqCst);
    LOG_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test_log::test]
fn host_log_import() {
    let symbols = [NativeSymbol::new(
        "env",
        "log",
        "(i)",
        host_log as *const c_void,
        Linkage::Dynamic,
        AbiVersion::V1,
    )];
    let bytecode = build(
        r#"(module
            (import "env" "log" (func $log (param i32)))
            (func (export "run") (param i32)
                local.get 0
                call $log))"#,
    );
    let binary = Runtime::compile(&bytecode, &symbols).unwrap();
    let mut runtime = Runtime::init_from_compiled(binary.bytes(), &symbols).unwrap();
    LOG_CALLS.store(0, Ordering::SeqCst);
    runtime
        .call_exported("run", stack_top(), &[WasmValue::I32(42)])
        .unwrap();
    assert_eq!(LOG_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(LOGGED.load(Ordering::SeqCst), 42);
}

extern "C" fn host_sum_v2(params: *const u64, results: *mut u64, _ctx: *mut c_void) {
    // (ii)i with every slot 8 bytes wide
    unsafe {
        let a = *params as u32 as i32;
        let b = *params.add(1) as u32 as i32;
        *results = a.wrapping_add(b) as u32 as u64;
    }
}

#[test_log::test]
fn host_import_v2_abi() {
    let symbols = [NativeSymbol::new(
        "env",
        "sum",
        "(ii)i",
        host_sum_v2 as *const c_void,
        Linkage::Dynamic,
        AbiVersion::V2,
    )];
    let bytecode = build(
        r#"(module
            (import "env" "sum" (func $sum (param i32 i32) (result i32)))
            (func (export "go") (result i32)
                i32.const 19
                i32.const 23
                call $sum))"#,
    );
    let binary = Compiler::default().compile(&bytecode, &symbols).unwrap();
    let mut runtime = Runtime::init_from_compiled(binary.bytes(), &symbols).unwrap();
    let r = runtime.call_exported("go", stack_top(), &[]).unwrap();
    assert_eq!(r[0].i32(), Some(42));
}

fn expect_trap(err: CallError) -> wasmfreeze::Trap {
    match err {
        CallError::Trap(trap) => trap,
        CallError::Runtime(e) => panic!("expected a trap, got runtime error {e}"),
    }
}

#[test_log::test]
fn unreachable_traps() {
    let mut runtime = run_module(
        r#"(module (func (export "boom") unreachable))"#,
    );
    let trap = expect_trap(runtime.call_exported("boom", stack_top(), &[]).unwrap_err());
    assert_eq!(trap.code(), TrapCode::Unreachable);
}

#[test_log::test]
fn division_traps() {
    let mut runtime = run_module(
        r#"(module
            (func (export "div") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.div_s))"#,
    );
    let ok = runtime
        .call_exported("div", stack_top(), &[WasmValue::I32(7), WasmValue::I32(2)])
        .unwrap();
    assert_eq!(ok[0].i32(), Some(3));

    let trap = expect_trap(
        runtime
            .call_exported("div", stack_top(), &[WasmValue::I32(7), WasmValue::I32(0)])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::DivZero);

    let trap = expect_trap(
        runtime
            .call_exported(
                "div",
                stack_top(),
                &[WasmValue::I32(i32::MIN), WasmValue::I32(-1)],
            )
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::DivOverflow);
}

#[test_log::test]
fn trunc_overflow_traps() {
    let mut runtime = run_module(
        r#"(module
            (func (export "t") (param f32) (result i32)
                local.get 0
                i32.trunc_f32_s))"#,
    );
    let ok = runtime
        .call_exported("t", stack_top(), &[WasmValue::from(-7.9f32)])
        .unwrap();
    assert_eq!(ok[0].i32(), Some(-7));
    let trap = expect_trap(
        runtime
            .call_exported("t", stack_top(), &[WasmValue::from(1.0e10f32)])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::TruncOverflow);
}

#[test_log::test]
fn linear_memory_out_of_bounds_store() {
    let mut runtime = run_module(
        r#"(module
            (memory 1 100)
            (func (export "_start")
                i32.const 0x300000
                i32.const 7
                i32.store))"#,
    );
    let trap = expect_trap(
        runtime
            .call_exported("_start", stack_top(), &[])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::LinmemOutOfBoundsAccess);
}

#[test_log::test]
fn lazy_commit_and_memory_grow() {
    let mut runtime = run_module(
        r#"(module
            (memory 1 100)
            (func (export "poke") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.store
                local.get 0
                i32.load)
            (func (export "grow") (param i32) (result i32)
                local.get 0
                memory.grow)
            (func (export "size") (result i32)
                memory.size))"#,
    );
    // Touch a page that was never committed: the fault layer commits it.
    let r = runtime
        .call_exported(
            "poke",
            stack_top(),
            &[WasmValue::I32(0x8000), WasmValue::I32(1234)],
        )
        .unwrap();
    assert_eq!(r[0].i32(), Some(1234));

    let r = runtime.call_exported("size", stack_top(), &[]).unwrap();
    assert_eq!(r[0].i32(), Some(1));
    let r = runtime
        .call_exported("grow", stack_top(), &[WasmValue::I32(2)])
        .unwrap();
    assert_eq!(r[0].i32(), Some(1));
    let r = runtime.call_exported("size", stack_top(), &[]).unwrap();
    assert_eq!(r[0].i32(), Some(3));

    // The grown page is accessible now.
    let r = runtime
        .call_exported(
            "poke",
            stack_top(),
            &[WasmValue::I32(2 * 65536), WasmValue::I32(9)],
        )
        .unwrap();
    assert_eq!(r[0].i32(), Some(9));
}

#[test_log::test]
fn data_segments_initialize_memory() {
    let mut runtime = run_module(
        r#"(module
            (memory 1)
            (data (i32.const 16) "\2a\00\00\00")
            (func (export "read") (result i32)
                i32.const 16
                i32.load))"#,
    );
    let r = runtime.call_exported("read", stack_top(), &[]).unwrap();
    assert_eq!(r[0].i32(), Some(42));
}

#[test_log::test]
fn indirect_call_wrong_signature() {
    let mut runtime = run_module(
        r#"(module
            (type $empty (func))
            (type $takes (func (param i32)))
            (table 2 funcref)
            (elem (i32.const 0) $nop)
            (func $nop)
            (func (export "call_wrong")
                i32.const 7
                i32.const 0
                call_indirect (type $takes))
            (func (export "call_right")
                i32.const 0
                call_indirect (type $empty))
            (func (export "call_oob")
                i32.const 5
                call_indirect (type $empty))
            (func (export "call_hole")
                i32.const 1
                call_indirect (type $empty)))"#,
    );
    runtime.call_exported("call_right", stack_top(), &[]).unwrap();
    let trap = expect_trap(
        runtime
            .call_exported("call_wrong", stack_top(), &[])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::IndirectCallWrongSig);
    let trap = expect_trap(
        runtime
            .call_exported("call_oob", stack_top(), &[])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::IndirectCallOutOfBounds);
    let trap = expect_trap(
        runtime
            .call_exported("call_hole", stack_top(), &[])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::IndirectCallWrongSig);
}

#[test_log::test]
fn call_by_table_index_uses_the_frozen_wrapper() {
    let mut runtime = run_module(
        r#"(module
            (table 1 funcref)
            (elem (i32.const 0) $double)
            (func $double (param i32) (result i32)
                local.get 0
                i32.const 2
                i32.mul))"#,
    );
    let r = runtime
        .call_by_table_index(
            0,
            stack_top(),
            &[WasmValue::I32(21)],
            &[wasmfreeze::ValType::I32],
        )
        .unwrap();
    assert_eq!(r[0].i32(), Some(42));
}

#[test_log::test]
fn interruption_stops_an_infinite_loop() {
    let bytecode = build(
        r#"(module
            (func $spin (loop (br 0)))
            (start $spin))"#,
    );
    let binary = Runtime::compile(&bytecode, &[]).unwrap();
    let mut runtime = Runtime::init_from_compiled(binary.bytes(), &[]).unwrap();
    let handle = runtime.interrupt_handle();

    let trap = std::thread::scope(|scope| {
        scope.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            handle.request(TrapCode::RuntimeInterruptRequested);
        });
        expect_trap(runtime.start(stack_top()).unwrap_err())
    });
    assert_eq!(trap.code(), TrapCode::RuntimeInterruptRequested);
    // The spin function is the only live frame.
    assert_eq!(trap.stacktrace(), &[0]);
}

#[test_log::test]
fn deep_stacktrace_is_bounded_by_the_ring() {
    let wat = r#"(module
        (func $long (export "long") call $f1)
        (func $f1 call $f2)
        (func $f2 call $f3)
        (func $f3 call $f4)
        (func $f4 call $f5)
        (func $f5 call $f6)
        (func $f6 call $f7)
        (func $f7 call $f8)
        (func $f8 call $trap)
        (func $trap
            i32.const 0
            i32.const 0
            i32.div_s
            drop))"#;
    let bytecode = build(wat);

    let binary = Compiler::new(CompilerConfig::new().stacktrace_records(16))
        .compile(&bytecode, &[])
        .unwrap();
    let mut runtime = Runtime::init_from_compiled(binary.bytes(), &[]).unwrap();
    let trap = expect_trap(runtime.call_exported("long", stack_top(), &[]).unwrap_err());
    assert_eq!(trap.code(), TrapCode::DivZero);
    assert_eq!(trap.stacktrace(), &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);

    let binary = Compiler::new(CompilerConfig::new().stacktrace_records(3))
        .compile(&bytecode, &[])
        .unwrap();
    let mut runtime = Runtime::init_from_compiled(binary.bytes(), &[]).unwrap();
    let trap = expect_trap(runtime.call_exported("long", stack_top(), &[]).unwrap_err());
    assert_eq!(trap.stacktrace(), &[9, 8, 7]);
}

#[test_log::test]
fn exported_globals() {
    let mut runtime = run_module(
        r#"(module
            (global $answer i32 (i32.const 42))
            (global $counter (mut i64) (i64.const 5))
            (export "answer" (global $answer))
            (export "counter" (global $counter))
            (func (export "bump") (result i64)
                global.get $counter
                i64.const 1
                i64.add
                global.set $counter
                global.get $counter))"#,
    );
    assert_eq!(runtime.get_exported_global::<i32>("answer").unwrap().get(), 42);
    assert_eq!(runtime.get_exported_global::<i64>("counter").unwrap().get(), 5);
    let r = runtime.call_exported("bump", stack_top(), &[]).unwrap();
    assert_eq!(r[0].i64(), Some(6));
    assert_eq!(runtime.get_exported_global::<i64>("counter").unwrap().get(), 6);
    runtime
        .get_exported_global::<i64>("counter")
        .unwrap()
        .set(100)
        .unwrap();
    let r = runtime.call_exported("bump", stack_top(), &[]).unwrap();
    assert_eq!(r[0].i64(), Some(101));
    // Immutable handles reject writes, and types are checked.
    assert!(runtime
        .get_exported_global::<i32>("answer")
        .unwrap()
        .set(1)
        .is_err());
    assert!(runtime.get_exported_global::<f32>("answer").is_err());
}

#[test_log::test]
fn linked_memory_builtins() {
    let bytecode = build(
        r#"(module
            (import "builtin" "read_linked_memory_i32"
                (func $read (param i32) (result i32)))
            (func (export "peek") (param i32) (result i32)
                local.get 0
                call $read))"#,
    );
    let binary = Runtime::compile(&bytecode, &[]).unwrap();
    let mut runtime = Runtime::init_from_compiled(binary.bytes(), &[]).unwrap();

    let trap = expect_trap(
        runtime
            .call_exported("peek", stack_top(), &[WasmValue::I32(0)])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::LinkedMemoryNotLinked);

    runtime.link_memory(&7777i32.to_le_bytes());
    let r = runtime
        .call_exported("peek", stack_top(), &[WasmValue::I32(0)])
        .unwrap();
    assert_eq!(r[0].i32(), Some(7777));
    let trap = expect_trap(
        runtime
            .call_exported("peek", stack_top(), &[WasmValue::I32(4)])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::LinkedMemoryOutOfBounds);

    runtime.unlink_memory();
    let trap = expect_trap(
        runtime
            .call_exported("peek", stack_top(), &[WasmValue::I32(0)])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::LinkedMemoryNotLinked);
}

#[test_log::test]
fn permissive_imports_trap_when_called() {
    let bytecode = build(
        r#"(module
            (import "env" "missing" (func $missing))
            (func (export "safe") (result i32) i32.const 5)
            (func (export "calls_missing") call $missing))"#,
    );
    // Without permissive imports the compile fails outright.
    assert!(Compiler::default().compile(&bytecode, &[]).is_err());

    let binary = Compiler::new(CompilerConfig::new().permissive_imports(true))
        .compile(&bytecode, &[])
        .unwrap();
    let mut runtime = Runtime::init_from_compiled(binary.bytes(), &[]).unwrap();
    let r = runtime.call_exported("safe", stack_top(), &[]).unwrap();
    assert_eq!(r[0].i32(), Some(5));
    let trap = expect_trap(
        runtime
            .call_exported("calls_missing", stack_top(), &[])
            .unwrap_err(),
    );
    assert_eq!(trap.code(), TrapCode::CalledFunctionNotLinked);
}

#[test_log::test]
fn freeze_then_reload_is_observation_identical() {
    let bytecode = build(
        r#"(module
            (func (export "addTwo") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
    );
    let binary = Runtime::compile(&bytecode, &[]).unwrap();

    let mut first = Runtime::init_from_compiled(binary.bytes(), &[]).unwrap();
    let mut second = Runtime::init_from_compiled(binary.bytes(), &[]).unwrap();
    for (a, b) in [(1, 2), (i32::MAX, 1), (-7, 7)] {
        let args = [WasmValue::I32(a), WasmValue::I32(b)];
        let x = first.call_exported("addTwo", stack_top(), &args).unwrap();
        let y = second.call_exported("addTwo", stack_top(), &args).unwrap();
        assert_eq!(x, y);
    }
}

#[test_log::test]
fn deterministic_recompilation_is_byte_identical() {
    let bytecode = build(
        r#"(module
            (memory 1)
            (global (mut i32) (i32.const 3))
            (func (export "f") (param i32) (result i32)
                local.get 0
                global.get 0
                i32.add))"#,
    );
    let a = Compiler::default().compile(&bytecode, &[]).unwrap();
    let b = Compiler::default().compile(&bytecode, &[]).unwrap();
    assert_eq!(a.bytes(), b.bytes());
}

#[test_log::test]
fn high_register_pressure_mode_still_computes() {
    let binary = Compiler::new(CompilerConfig::new().force_high_register_pressure())
        .compile(
            &build(
                r#"(module
                    (func (export "sum4") (param i32 i32 i32 i32) (result i32)
                        local.get 0
                        local.get 1
                        i32.add
                        local.get 2
                        i32.add
                        local.get 3
                        i32.add))"#,
            ),
            &[],
        )
        .unwrap();
    let mut runtime = Runtime::init_from_compiled(binary.bytes(), &[]).unwrap();
    let r = runtime
        .call_exported(
            "sum4",
            stack_top(),
            &[
                WasmValue::I32(1),
                WasmValue::I32(2),
                WasmValue::I32(3),
                WasmValue::I32(4),
            ],
        )
        .unwrap();
    assert_eq!(r[0].i32(), Some(10));
}

#[test_log::test]
fn br_table_dispatch() {
    let mut runtime = run_module(
        r#"(module
            (func (export "route") (param i32) (result i32)
                block
                    block
                        block
                            local.get 0
                            br_table 0 1 2
                        end
                        i32.const 100
                        return
                    end
                    i32.const 200
                    return
                end
                i32.const 300))"#,
    );
    for (input, expected) in [(0, 100), (1, 200), (2, 300), (9, 300)] {
        let r = runtime
            .call_exported("route", stack_top(), &[WasmValue::I32(input)])
            .unwrap();
        assert_eq!(r[0].i32(), Some(expected), "br_table case {input}");
    }
}
