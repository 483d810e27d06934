//! End-to-end translation scenarios: each compiles a small module and
//! checks the artifact carries the exact guards, helpers and wiring the
//! compiled program needs at runtime.

mod common;

use common::{code_of, compile_wat, compile_wat_with};
use wasm2js::{PoolConstant, TargetConfig};

#[test_log::test]
fn times_two() {
    let artifact = compile_wat(
        r#"(module
             (func (export "times-two") (param i32) (result i32)
               local.get 0
               local.get 0
               i32.add))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("function F0(l0) {"));
    assert!(code.contains("l0 = l0 | 0;"));
    assert!(code.contains("return ((l0 + l0) | 0);"));
    assert!(code.contains("\"times-two\": F0"));
    assert!(code.contains("F0.sig = \"i->i\";"));
}

#[test_log::test]
fn div_trap_guards() {
    let artifact = compile_wat(
        r#"(module
             (func (export "div") (param i32 i32) (result i32)
               local.get 0
               local.get 1
               i32.div_s))"#,
    );
    let code = code_of(&artifact);
    // rhs == 0, and MIN / -1, both hoisted ahead of the division.
    assert!(code.contains("integer division by zero"));
    assert!(code.contains("integer overflow"));
    assert!(code.contains("return ((l0 / l1) | 0);"));
    let guards = code.find("integer division by zero").unwrap();
    let result = code.find("return ((l0 / l1) | 0);").unwrap();
    assert!(guards < result, "guards must precede the division");
}

#[test_log::test]
fn memory_ops() {
    let artifact = compile_wat(
        r#"(module
             (memory 1)
             (data (i32.const 8) "\aa\bb\cc\dd")
             (func (export "read") (result i32)
               i32.const 8
               i32.load))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("var M0 = rt.createMemory(1);"));
    // Segment bounds are verified before the write happens.
    assert!(code.contains("if ((dataOff0 >>> 0) + 4 > memSize) rt.linkError("));
    assert!(code.contains("HU8.set([170,187,204,221], dataOff0 >>> 0);"));
    let check = code.find("rt.linkError").unwrap();
    let write = code.find("HU8.set(").unwrap();
    assert!(check < write);
    // In-function access: guard plus aligned fast path.
    assert!(code.contains("if ((8 >>> 0) > (memSize - 4)) rt.trap(\"out of bounds memory access\");"));
    assert!(code.contains("HS32[(8 >>> 0) >>> 2]"));
}

#[test_log::test]
fn memory_ops_out_of_bounds_segment_still_compiles() {
    // A data segment crossing the page boundary is a link-time failure,
    // not a compile-time one; the artifact must carry the check.
    let artifact = compile_wat(
        r#"(module
             (memory 1)
             (data (i32.const 65533) "\aa\bb\cc\dd"))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("var dataOff0 = 65533;"));
    assert!(code.contains("if ((dataOff0 >>> 0) + 4 > memSize) rt.linkError("));
}

#[test_log::test]
fn grow_memory() {
    let artifact = compile_wat(
        r#"(module
             (memory 1 2)
             (func (export "grow") (param i32) (result i32)
               local.get 0
               memory.grow)
             (func (export "size") (result i32)
               memory.size))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("var M0 = rt.createMemory(1, 2);"));
    // grow lands in a temp so later statements cannot reorder it; the
    // view refresh rides on the grow callback.
    assert!(code.contains("ti0 = M0.grow(l0 >>> 0);"));
    assert!(code.contains("return ti0;"));
    assert!(code.contains("return ((memSize / 65536) | 0);"));
    assert!(code.contains("M0.onGrow(refreshViews);"));
}

#[test_log::test]
fn memory_size_is_exact_at_the_page_cap() {
    let artifact = compile_wat(
        r#"(module
             (memory 65535 65536)
             (func (export "fill") (result i32)
               i32.const 1
               memory.grow)
             (func (export "size") (result i32)
               memory.size))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("var M0 = rt.createMemory(65535, 65536);"));
    // Once the grow reaches the 65536-page ceiling, memSize is exactly
    // 2^32. `memSize >>> 16` would pass that through ToUint32 and report
    // 0 pages; the division form reports 65536.
    assert!(code.contains("return ((memSize / 65536) | 0);"));
    assert!(!code.contains("memSize >>> 16"));
}

#[test_log::test]
fn call_indirect_checks_signature() {
    let artifact = compile_wat(
        r#"(module
             (type $sig (func (param i32) (result i32)))
             (table 1 1 funcref)
             (elem (i32.const 0) $target)
             (func $target (type $sig) local.get 0)
             (func (export "call") (param i32) (result i32)
               local.get 0
               i32.const 0
               call_indirect (type $sig)))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("var T0 = rt.createTable(1, 1);"));
    assert!(code.contains("function tblCheck(idx, sig) {"));
    assert!(code.contains("if (idx >= T0.length) rt.trap(\"out of bounds table access\");"));
    assert!(code.contains("if (!fn) rt.trap(\"accessed uninitialized table element\");"));
    assert!(code.contains("if (fn.sig !== sig) rt.trap(\"indirect call signature mismatch\");"));
    assert!(code.contains("tblCheck(0, \"i->i\")"));
    assert!(code.contains("T0.set((elemOff0 >>> 0) + 0, F0);"));
    assert!(code.contains("if ((elemOff0 >>> 0) + 1 > T0.length) rt.linkError("));
}

#[test_log::test]
fn signalling_nan_round_trip() {
    let artifact = compile_wat(
        r#"(module
             (memory 1)
             (start $init)
             (func $init
               i32.const 0
               f32.const nan:0x000001
               f32.store)
             (func (export "reload") (result i32)
               i32.const 0
               f32.load
               i32.reinterpret_f32))"#,
    );
    // The payload cannot round-trip through source text: it rides in the
    // constant pool and through the NaN-preserving accessors.
    assert_eq!(artifact.constants(), &[PoolConstant::F32(0x7f80_0001)]);
    let code = code_of(&artifact);
    assert!(code.contains("rt.f32_store_nan(HU8, (0 >>> 0), constants[0]);"));
    assert!(code.contains("rt.i32_reinterpret_f32(rt.f32_load_nan(HU8, (0 >>> 0)))"));
    assert!(code.contains("F0();"), "start function must run during init");
}

#[test_log::test]
fn nan_helpers_elide_when_target_preserves_bits() {
    let source = r#"(module
         (memory 1)
         (func (export "f") (result f32)
           i32.const 0
           f32.load))"#;
    let honest = TargetConfig {
        little_endian: true,
        preserves_f32_nan_bits: true,
        preserves_f64_nan_bits: true,
    };
    let artifact = compile_wat_with(source, honest);
    let code = code_of(&artifact);
    assert!(code.contains("HF32[(0 >>> 0) >>> 2]"));
    assert!(!code.contains("f32_load_nan"));
}

#[test_log::test]
fn big_endian_targets_use_byte_serializers() {
    let source = r#"(module
         (memory 1)
         (func (export "f") (param i32) (result i32)
           local.get 0
           i32.load))"#;
    let config = TargetConfig {
        little_endian: false,
        ..TargetConfig::default()
    };
    let artifact = compile_wat_with(source, config);
    let code = code_of(&artifact);
    assert!(code.contains("rt.i32_load_unaligned(HU8, (l0 >>> 0))"));
    assert!(!code.contains("HS32[("));
}
