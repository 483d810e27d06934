//! The contract between emitted code and the embedder's runtime library.
//!
//! The artifact's entry point receives a context object (`rt` in the
//! emitted text) whose members it calls by the names below. The embedder
//! supplies the implementations; this module owns the names and the exact
//! semantics the emitted code assumes.
//!
//! # Expected semantics
//!
//! ## Core
//! - `trap(msg)`: raise a RuntimeError carrying `msg`. Never returns.
//! - `linkError(msg)`: raise a LinkError during module initialization.
//! - `createMemory(initial, maximum?)`: a linear-memory object exposing
//!   `buffer` (an ArrayBuffer of whole 64 KiB pages), `grow(pages)`
//!   returning the old page count or -1 (no side effect) when the new size
//!   would exceed `maximum` or 65536 pages, and `onGrow(cb)` registering a
//!   callback fired after every successful growth. Growth replaces
//!   `buffer`; subscribers must re-acquire their views.
//! - `createTable(initial, maximum?)`: a function-table object exposing
//!   `get(i)`, `set(i, fn)` and `length`.
//!
//! ## 64-bit integers
//! An opaque value type with 32-bit halves. Constructors: `i64_new(lo, hi)`,
//! `i64_from_i32(x)` (sign-extending), `i64_from_u32(x)`. Accessors:
//! `i64_low(v)`, `i64_high(v)` (both as signed i32). Arithmetic wraps
//! modulo 2^64; shifts mask their count to 6 bits; comparisons and
//! `i64_is_zero` return 0 or 1 as an i32; `i64_clz`/`i64_ctz`/`i64_popcnt`
//! return an i64. `i64_from_f64_s`/`i64_from_f64_u` truncate an in-range
//! double toward zero (the emitted guards rule out NaN and out-of-range
//! inputs); `i64_to_f64_s`/`i64_to_f64_u`/`i64_to_f32_s`/`i64_to_f32_u`
//! are correctly rounded to the destination format.
//!
//! ## Floats
//! - `to_f32(x)`: round to single precision; the identity on NaN values
//!   carrying a preserved bit pattern.
//! - `f32_abs`/`f32_neg`/`f32_copysign` and the `f64_` variants: operate on
//!   the sign bit of the raw bit pattern, so NaN signs and payloads are
//!   not disturbed by arithmetic rewriting.
//! - `nearest(x)`: round to the nearest integer, ties to even.
//! - `i32_reinterpret_f32`/`f32_reinterpret_i32` and the 64-bit pair:
//!   bit-pattern round trips through a scratch buffer, honoring any
//!   attached NaN bit pattern.
//!
//! ## Memory access
//! Unaligned helpers address the memory as a byte-addressable
//! little-endian view (first argument is the Uint8Array view, second the
//! byte address): `i32_load_unaligned`, `i32_load16_unaligned` (returns
//! the zero-extended 16 bits), `i32_store_unaligned`,
//! `i32_store16_unaligned`, `f32_load_unaligned`, `f32_store_unaligned`,
//! `f64_load_unaligned`, `f64_store_unaligned`.
//!
//! The NaN-bit-pattern preserving accessors are used when the target
//! cannot be trusted to keep payloads through its float registers:
//! `f32_load_nan(bytes, addr)` reads little-endian and, when the loaded
//! value is NaN, attaches the original 32 bits to the returned value;
//! `f32_store_nan(bytes, addr, v)` writes an attached pattern verbatim
//! when present. `f64_load_nan`/`f64_store_nan` are the 64-bit pair.
//!
//! ## 32-bit integer odds and ends
//! `i32_rotl`/`i32_rotr` rotate by the masked count; `i32_ctz(0)` is 32
//! and `i32_popcnt` counts set bits.

use crate::translate::{CmpOp, FloatUnOp, IntBinOp, IntUnOp};

/// The name the context object is bound to inside the artifact.
pub const CTX: &str = "rt";

pub const TRAP: &str = "trap";
pub const LINK_ERROR: &str = "linkError";
pub const CREATE_MEMORY: &str = "createMemory";
pub const CREATE_TABLE: &str = "createTable";
pub const TO_F32: &str = "to_f32";
pub const NEAREST: &str = "nearest";

/// Helper suffix for an i64 binary operator.
pub fn i64_binop(op: IntBinOp) -> &'static str {
    match op {
        IntBinOp::Add => "i64_add",
        IntBinOp::Sub => "i64_sub",
        IntBinOp::Mul => "i64_mul",
        IntBinOp::DivS => "i64_div_s",
        IntBinOp::DivU => "i64_div_u",
        IntBinOp::RemS => "i64_rem_s",
        IntBinOp::RemU => "i64_rem_u",
        IntBinOp::And => "i64_and",
        IntBinOp::Or => "i64_or",
        IntBinOp::Xor => "i64_xor",
        IntBinOp::Shl => "i64_shl",
        IntBinOp::ShrS => "i64_shr_s",
        IntBinOp::ShrU => "i64_shr_u",
        IntBinOp::Rotl => "i64_rotl",
        IntBinOp::Rotr => "i64_rotr",
    }
}

/// Helper suffix for an i64 comparison.
pub fn i64_cmp(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "i64_eq",
        CmpOp::Ne => "i64_ne",
        CmpOp::LtS => "i64_lt_s",
        CmpOp::LtU => "i64_lt_u",
        CmpOp::GtS => "i64_gt_s",
        CmpOp::GtU => "i64_gt_u",
        CmpOp::LeS => "i64_le_s",
        CmpOp::LeU => "i64_le_u",
        CmpOp::GeS => "i64_ge_s",
        CmpOp::GeU => "i64_ge_u",
        _ => unreachable!("float comparisons never reach the i64 helpers"),
    }
}

/// Helper suffix for an i64 unary counting operator.
pub fn i64_unop(op: IntUnOp) -> &'static str {
    match op {
        IntUnOp::Clz => "i64_clz",
        IntUnOp::Ctz => "i64_ctz",
        IntUnOp::Popcnt => "i64_popcnt",
        IntUnOp::Eqz => "i64_is_zero",
    }
}

/// Helper suffix for the raw-bit float sign operators, or `None` when the
/// operator lowers to plain `Math` calls.
pub fn float_sign_helper(op: FloatUnOp, is_f32: bool) -> Option<&'static str> {
    let name = match (op, is_f32) {
        (FloatUnOp::Abs, true) => "f32_abs",
        (FloatUnOp::Abs, false) => "f64_abs",
        (FloatUnOp::Neg, true) => "f32_neg",
        (FloatUnOp::Neg, false) => "f64_neg",
        _ => return None,
    };
    Some(name)
}
