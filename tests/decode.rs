//! Decode and validation coverage over whole modules, driven through the
//! public `validate` entry point plus a few hand-assembled byte cases.

mod common;

use common::wat_to_mvp;
use wasm2js::{validate, ModuleTranslator};

fn is_valid(source: &str) -> bool {
    validate(&wat_to_mvp(source))
}

#[test_log::test]
fn empty_module() {
    assert!(is_valid("(module)"));
}

#[test_log::test]
fn released_version_is_rejected() {
    // Unpatched `wat` output carries version 1; the translator speaks the
    // 0x0d pre-release only.
    let bytes = wat::parse_str("(module)").unwrap();
    assert!(!validate(&bytes));
}

#[test_log::test]
fn truncated_and_garbage_input() {
    assert!(!validate(b""));
    assert!(!validate(b"\0asm"));
    assert!(!validate(b"\0asl\x0d\0\0\0"));
    let mut bytes = wat_to_mvp("(module (memory 1))");
    bytes.truncate(bytes.len() - 1);
    assert!(!validate(&bytes));
}

#[test_log::test]
fn body_of_only_end() {
    assert!(is_valid("(module (func))"));
}

#[test_log::test]
fn if_without_else_and_empty_stack() {
    assert!(is_valid(
        "(module (func (param i32) local.get 0 if nop end))"
    ));
}

#[test_log::test]
fn if_with_result_requires_else() {
    assert!(!is_valid(
        "(module (func (result i32) i32.const 1 if (result i32) i32.const 2 end))"
    ));
}

#[test_log::test]
fn br_table_with_only_default() {
    assert!(is_valid(
        "(module (func (param i32) (block (local.get 0) (br_table 0))))"
    ));
}

#[test_log::test]
fn zero_length_segments() {
    assert!(is_valid(
        r#"(module
             (memory 1)
             (table 1 funcref)
             (func $f)
             (elem (i32.const 0))
             (data (i32.const 0) ""))"#
    ));
}

#[test_log::test]
fn stack_errors_are_rejected() {
    // Underflow.
    assert!(!is_valid("(module (func i32.add drop))"));
    // Type mismatch.
    assert!(!is_valid("(module (func (result i32) f32.const 1))"));
    // Leftover operand.
    assert!(!is_valid("(module (func i32.const 1))"));
}

#[test_log::test]
fn branch_depth_is_checked() {
    assert!(!is_valid("(module (func br 2))"));
    assert!(is_valid("(module (func br 0))"));
}

#[test_log::test]
fn unreachable_code_is_type_relaxed() {
    assert!(is_valid(
        "(module (func (result i32) unreachable i64.const 1 drop))"
    ));
    // A block opened inside dead code still checks its own body.
    assert!(!is_valid(
        "(module (func unreachable block i32.add drop end))"
    ));
}

#[test_log::test]
fn globals_and_init_exprs() {
    assert!(is_valid(
        r#"(module
             (import "env" "base" (global i32))
             (global i32 (global.get 0))
             (global (mut f64) (f64.const 0)))"#
    ));
    // Init expression referencing a non-imported global.
    assert!(!is_valid(
        r#"(module
             (global i32 (i32.const 1))
             (global i32 (global.get 0)))"#
    ));
    // Exporting a mutable global.
    assert!(!is_valid(
        r#"(module
             (global $m (mut i32) (i32.const 0))
             (export "m" (global $m)))"#
    ));
}

#[test_log::test]
fn immutable_global_cannot_be_written() {
    assert!(!is_valid(
        r#"(module
             (global $g i32 (i32.const 0))
             (func i32.const 1 global.set $g))"#
    ));
}

#[test_log::test]
fn alignment_flag_is_bounded() {
    // align=8 on a 4-byte access exceeds natural alignment.
    assert!(!is_valid(
        "(module (memory 1) (func (param i32) (result i32) local.get 0 i32.load align=8))"
    ));
    assert!(is_valid(
        "(module (memory 1) (func (param i32) (result i32) local.get 0 i32.load align=1))"
    ));
}

#[test_log::test]
fn memory_ops_require_a_memory() {
    assert!(!is_valid(
        "(module (func (param i32) (result i32) local.get 0 i32.load))"
    ));
    assert!(!is_valid("(module (func (result i32) memory.size))"));
}

#[test_log::test]
fn call_indirect_requires_a_table() {
    assert!(!is_valid(
        "(module (type (func)) (func i32.const 0 call_indirect (type 0)))"
    ));
}

#[test_log::test]
fn name_section_is_harvested() {
    let mut bytes = wat_to_mvp("(module (func))");
    // custom section: name "name", subsection 1 (function names),
    // one entry: index 0 -> "f".
    bytes.extend_from_slice(&[
        0x00, 0x0b, // id, payload_len
        0x04, b'n', b'a', b'm', b'e', // section name
        0x01, 0x04, // subsection id, len
        0x01, 0x00, 0x01, b'f', // one entry: func 0 named "f"
    ]);
    let translation = ModuleTranslator::new().translate(&bytes).unwrap();
    let names: Vec<_> = translation.module.func_names.values().copied().collect();
    assert_eq!(names, vec!["f"]);
}

#[test_log::test]
fn malformed_name_section_is_ignored() {
    let mut bytes = wat_to_mvp("(module (func))");
    bytes.extend_from_slice(&[
        0x00, 0x07, // id, payload_len
        0x04, b'n', b'a', b'm', b'e', // section name
        0x01, 0xff, // subsection claims a huge length
    ]);
    let translation = ModuleTranslator::new().translate(&bytes).unwrap();
    assert!(translation.module.func_names.is_empty());
}
