//! Lowering-shape tests: control flow, spilling, i64 helper routing and
//! the exact trap boundaries baked into conversions.

mod common;

use common::{code_of, compile_wat};

#[test_log::test]
fn block_branches_become_labelled_breaks() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param i32)
               (block $exit
                 (loop $top
                   local.get 0
                   br_if $exit
                   br $top))))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("L1: do {"));
    assert!(code.contains("L2: while (1) {"));
    assert!(code.contains("break L1;"));
    assert!(code.contains("continue L2;"));
    assert!(code.contains("} while (0);"));
}

#[test_log::test]
fn unbranched_blocks_splice_away() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param i32) (result i32)
               (block (result i32)
                 local.get 0)))"#,
    );
    let code = code_of(&artifact);
    // No branch targets the block: no label, no temp, just the value.
    assert!(!code.contains("do {"));
    assert!(code.contains("return l0;"));
}

#[test_log::test]
fn if_else_joins_through_a_temp() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param i32) (result i32)
               local.get 0
               if (result i32)
                 i32.const 1
               else
                 i32.const 2
               end))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("if (l0) {"));
    assert!(code.contains("ti0 = 1;"));
    assert!(code.contains("} else {"));
    assert!(code.contains("ti0 = 2;"));
    assert!(code.contains("return ti0;"));
}

#[test_log::test]
fn br_table_lowers_to_a_switch() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param i32)
               (block $a
                 (block $b
                   local.get 0
                   br_table $b $a))))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("switch (l0) {"));
    assert!(code.contains("case 0:"));
    assert!(code.contains("break L2;"));
    assert!(code.contains("default:"));
    assert!(code.contains("break L1;"));
}

#[test_log::test]
fn calls_spill_the_evaluation_stack() {
    let artifact = compile_wat(
        r#"(module
             (func $seven (result i32) i32.const 7)
             (func (export "f") (param i32) (result i32)
               local.get 0
               local.get 0
               i32.add
               call $seven
               i32.add))"#,
    );
    let code = code_of(&artifact);
    // The pending sum must be evaluated before the call's side effects,
    // and the call result lands in its own slot.
    assert!(code.contains("ti0 = ((l0 + l0) | 0);"));
    assert!(code.contains("ti1 = (F0() | 0);"));
    assert!(code.contains("return ((ti0 + ti1) | 0);"));
}

#[test_log::test]
fn branch_with_value_uses_the_target_temp() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param i32) (result i32)
               (block $b (result i32)
                 i32.const 5
                 local.get 0
                 br_if $b
                 drop
                 i32.const 9)))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("L1: do {"));
    // br_if carries 5 out through the block's result temp.
    assert!(code.contains("if (l0) {"));
    assert!(code.contains("break L1;"));
    assert!(code.contains("ti0 = 9;"));
    assert!(code.contains("return ti0;"));
}

#[test_log::test]
fn i64_routes_through_helpers() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param i64 i64) (result i64)
               local.get 0
               local.get 1
               i64.div_s))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("rt.i64_eq(l1, rt.i64_new(0, 0))"));
    assert!(code.contains("rt.i64_eq(l0, rt.i64_new(0, -2147483648))"));
    assert!(code.contains("rt.i64_eq(l1, rt.i64_new(-1, -1))"));
    assert!(code.contains("return rt.i64_div_s(l0, l1);"));
}

#[test_log::test]
fn i64_constants_split_into_halves() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (result i64)
               i64.const 0x123456789abcdef0))"#,
    );
    let code = code_of(&artifact);
    // low = 0x9abcdef0 (negative as i32), high = 0x12345678.
    assert!(code.contains("rt.i64_new(-1698898192, 305419896)"));
}

#[test_log::test]
fn trunc_guards_use_exact_boundaries() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param f64) (result i32)
               local.get 0
               i32.trunc_f64_s))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains(">= +(2147483648.0)"));
    assert!(code.contains("<= +(-2147483649.0)"));
    assert!(code.contains("integer overflow"));
    assert!(code.contains("!== +l0"));
    assert!(code.contains("invalid conversion to integer"));
    assert!(code.contains("return (l0 | 0);"));
}

#[test_log::test]
fn i64_trunc_signed_lower_bound_is_strict() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param f64) (result i64)
               local.get 0
               i64.trunc_f64_s))"#,
    );
    let code = code_of(&artifact);
    // -2^63 itself is a legal input; only values below it trap. The
    // boundary renders in shortest round-trip form (9223372036854776000),
    // which parses back to exactly 2^63.
    assert!(code.contains(">= +(9223372036854776"));
    assert!(code.contains("< +(-9223372036854776"));
    assert!(code.contains("rt.i64_from_f64_s(+l0)"));
}

#[test_log::test]
fn f32_arithmetic_rounds_to_single_precision() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param f32 f32) (result f32)
               local.get 0
               local.get 1
               f32.add))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("return rt.to_f32((l0 + l1));"));
}

#[test_log::test]
fn float_sign_ops_use_raw_bit_helpers() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param f64 f64) (result f64)
               local.get 0
               f64.neg
               local.get 1
               f64.copysign))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("rt.f64_copysign(rt.f64_neg(l0), l1)"));
}

#[test_log::test]
fn select_is_a_ternary() {
    let artifact = compile_wat(
        r#"(module
             (func (export "f") (param i32 i32 i32) (result i32)
               local.get 0
               local.get 1
               local.get 2
               select))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("return (l2 ? l0 : l1);"));
}

#[test_log::test]
fn global_reads_and_writes() {
    let artifact = compile_wat(
        r#"(module
             (global $g (mut i32) (i32.const 41))
             (func (export "bump")
               global.get $g
               i32.const 1
               i32.add
               global.set $g))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("var G0 = 41;"));
    assert!(code.contains("G0 = ((G0 + 1) | 0);"));
}

#[test_log::test]
fn i64_memory_access_splits_words() {
    let artifact = compile_wat(
        r#"(module
             (memory 1)
             (func (export "f") (param i32 i64)
               local.get 0
               local.get 1
               i64.store))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("HS32[(l0 >>> 0) >>> 2] = rt.i64_low(l1);"));
    assert!(code.contains("HS32[((l0 >>> 0) + 4) >>> 2] = rt.i64_high(l1);"));
    assert!(code.contains("(memSize - 8)"));
}

#[test_log::test]
fn narrow_loads_extend_correctly() {
    let artifact = compile_wat(
        r#"(module
             (memory 1)
             (func (export "s8") (param i32) (result i32)
               local.get 0
               i32.load8_s)
             (func (export "u16") (param i32) (result i32)
               local.get 0
               i32.load16_u)
             (func (export "x32") (param i32) (result i64)
               local.get 0
               i64.load32_u))"#,
    );
    let code = code_of(&artifact);
    assert!(code.contains("return HS8[(l0 >>> 0)];"));
    assert!(code.contains("return HU16[(l0 >>> 0) >>> 1];"));
    assert!(code.contains("return rt.i64_from_u32(HS32[(l0 >>> 0) >>> 2]);"));
}

#[test_log::test]
fn nan_payload_constants_are_pooled_once() {
    let artifact = compile_wat(
        r#"(module
             (func (export "a") (result f32) f32.const nan:0x200000)
             (func (export "b") (result f32) f32.const nan:0x200000)
             (func (export "c") (result f64) f64.const 1.5))"#,
    );
    assert_eq!(artifact.constants().len(), 1);
    let code = code_of(&artifact);
    assert!(code.contains("return constants[0];"));
    assert!(code.contains("return (1.5);"));
}

#[test_log::test]
fn canonical_nan_and_infinities_stay_inline() {
    let artifact = compile_wat(
        r#"(module
             (func (export "a") (result f64) f64.const nan)
             (func (export "b") (result f64) f64.const inf)
             (func (export "c") (result f64) f64.const -inf))"#,
    );
    assert!(artifact.constants().is_empty());
    let code = code_of(&artifact);
    assert!(code.contains("return NaN;"));
    assert!(code.contains("return Infinity;"));
    assert!(code.contains("return (-Infinity);"));
}
