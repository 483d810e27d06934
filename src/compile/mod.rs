mod compiler;
mod module_builder;
pub mod runtime;

use crate::translate::{FuncTranslator, FunctionIr, ModuleTranslator};
use crate::Result;
use alloc::vec::Vec;
use cranelift_entity::PrimaryMap;

/// Target-dependent lowering toggles.
#[derive(Debug, Clone, Copy)]
pub struct TargetConfig {
    /// Chooses typed-array fast paths for naturally aligned accesses over
    /// byte-level serializers.
    pub little_endian: bool,
    /// When false, every f32 load and store is wrapped in the
    /// NaN-bit-pattern fixup helpers.
    pub preserves_f32_nan_bits: bool,
    /// The f64 analogue.
    pub preserves_f64_nan_bits: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        // JavaScript engines canonicalize NaNs moving through number
        // registers, so the fixup helpers are on by default.
        Self {
            little_endian: true,
            preserves_f32_nan_bits: false,
            preserves_f64_nan_bits: false,
        }
    }
}

/// A large constant the artifact references as `constants[i]`: float bit
/// patterns that cannot round-trip through source text (NaN payloads).
/// The embedder materializes these before invoking the entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolConstant {
    F32(u32),
    F64(u64),
}

/// The finished translation: the target-code buffer plus the pre-parsed
/// constant pool it expects at instantiation.
#[derive(Debug)]
pub struct Artifact {
    code: Vec<u8>,
    constants: Vec<PoolConstant>,
}

impl Artifact {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn constants(&self) -> &[PoolConstant] {
        &self.constants
    }
}

/// Translate a binary module all the way to a target artifact: decode,
/// validate every function while building its IR, then lower.
pub fn compile(bytes: &[u8], config: TargetConfig) -> Result<Artifact> {
    let translation = ModuleTranslator::new().translate(bytes)?;

    let mut func_translator = FuncTranslator::new();
    let mut functions: PrimaryMap<_, FunctionIr> =
        PrimaryMap::with_capacity(translation.func_bodies.len());
    for (defined_index, body) in translation.func_bodies.iter() {
        functions.push(func_translator.translate_body(
            &translation.module,
            defined_index,
            body,
        )?);
    }

    let (code, constants) =
        module_builder::ModuleBuilder::new(&translation.module, config).build(&functions);
    tracing::debug!("emitted {} bytes of target code", code.len());

    let mut code = code.into_bytes();
    code.shrink_to_fit();
    Ok(Artifact { code, constants })
}
