#![allow(dead_code)]

use wasm2js::{compile, Artifact, TargetConfig};

/// Assemble a WAT module into the binary format the translator speaks.
///
/// `wat` emits the released version number; the translator targets the
/// frozen MVP pre-release (0x0d), whose encoding is otherwise identical,
/// so the version byte is rewritten.
pub fn wat_to_mvp(source: &str) -> Vec<u8> {
    let mut bytes = wat::parse_str(source).expect("test module must be valid WAT");
    bytes[4] = 0x0d;
    bytes
}

pub fn compile_wat(source: &str) -> Artifact {
    compile(&wat_to_mvp(source), TargetConfig::default()).expect("test module must compile")
}

pub fn compile_wat_with(source: &str, config: TargetConfig) -> Artifact {
    compile(&wat_to_mvp(source), config).expect("test module must compile")
}

pub fn code_of(artifact: &Artifact) -> &str {
    std::str::from_utf8(artifact.code()).expect("emitted code is UTF-8")
}
