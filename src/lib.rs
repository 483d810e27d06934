#![cfg_attr(feature = "no_std", no_std)]

extern crate alloc;
extern crate core;

mod compile;
mod errors;
pub mod indices;
mod opcode;
mod reader;
mod translate;
mod traps;
mod utils;

pub use compile::{compile, Artifact, PoolConstant, TargetConfig};
pub use errors::{CompileError, CompileErrorKind};
pub use translate::{
    ConstExpr, DataSegment, ElementSegment, Export, FuncType, FunctionBody, GlobalType, Import,
    Limits, ModuleTranslator, TranslatedModule, Translation, ValType,
};
pub use traps::Trap;

pub type Result<T> = core::result::Result<T, CompileError>;

/// WebAssembly page sizes are defined to be 64KiB.
pub const WASM_PAGE_SIZE: u32 = 0x10000;

/// The number of pages we can have before we run out of byte index space.
pub const WASM_MAX_PAGES: u32 = 1 << 16;

/// The binary format version this translator accepts. This is the MVP
/// pre-release version the opcode space below was frozen at.
pub const WASM_VERSION: u32 = 0x0d;

/// Modules declaring more locals than this in a single function are rejected.
pub const MAX_FUNCTION_LOCALS: u32 = 50_000;

/// Decode-only entry point: `true` iff `bytes` is a well-formed, valid MVP
/// module. This is the one place a [`CompileError`] is swallowed.
pub fn validate(bytes: &[u8]) -> bool {
    ModuleTranslator::new().translate(bytes).is_ok()
}
