use crate::compile::compiler::{w, Compiler};
use crate::compile::{runtime, PoolConstant, TargetConfig};
use crate::indices::{DefinedFuncIndex, EntityIndex};
use crate::translate::{ConstExpr, FunctionIr, Literal, TranslatedModule};
use crate::traps::Trap;
use alloc::string::String;
use alloc::vec::Vec;
use cranelift_entity::PrimaryMap;

/// Assembles the complete artifact around the per-function code: the entry
/// point header, import bindings, memory views, the indirect-call checker,
/// module initialization (elements, then data, then start) and the exports
/// object.
pub(crate) struct ModuleBuilder<'a, 'wasm> {
    c: Compiler<'a, 'wasm>,
}

impl<'a, 'wasm> ModuleBuilder<'a, 'wasm> {
    pub fn new(module: &'a TranslatedModule<'wasm>, config: TargetConfig) -> Self {
        Self {
            c: Compiler::new(module, config),
        }
    }

    pub fn build(
        mut self,
        functions: &PrimaryMap<DefinedFuncIndex, FunctionIr>,
    ) -> (String, Vec<PoolConstant>) {
        self.c.raw("function(rt, imports, constants) {\n");
        self.c.indent();
        self.c.line("\"use strict\";");

        self.bind_imports();
        self.create_defined_entities();
        self.emit_memory_views();
        self.emit_table_check();

        for ir in functions.values() {
            self.c.emit_function(ir);
        }

        self.emit_initialization();
        self.emit_exports();

        self.c.dedent();
        self.c.raw("}\n");

        self.c.finish()
    }

    /// Imported entities resolve positionally from the embedder's array,
    /// in module order.
    fn bind_imports(&mut self) {
        let module = self.c.module;
        for (pos, import) in module.imports.iter().enumerate() {
            self.c.start_line();
            match import.index {
                EntityIndex::Function(f) => {
                    w!(self.c, "var F{} = imports[{pos}];\n", f.as_u32());
                    let sig = module.type_of(f).sig_str();
                    self.c.start_line();
                    w!(self.c, "F{}.sig = \"{sig}\";\n", f.as_u32());
                }
                EntityIndex::Global(g) => {
                    w!(self.c, "var G{} = imports[{pos}];\n", g.as_u32());
                }
                EntityIndex::Memory(_) => {
                    w!(self.c, "var M0 = imports[{pos}];\n");
                }
                EntityIndex::Table(_) => {
                    w!(self.c, "var T0 = imports[{pos}];\n");
                }
            }
        }
    }

    fn create_defined_entities(&mut self) {
        let module = self.c.module;

        if module.memories.len() as u32 > module.num_imported_memories {
            let limits = module.memories.values().next().expect("length checked");
            self.c.start_line();
            w!(self.c, "var M0 = {}.{}({}", runtime::CTX, runtime::CREATE_MEMORY, limits.initial);
            if let Some(maximum) = limits.maximum {
                w!(self.c, ", {maximum}");
            }
            self.c.raw(");\n");
        }

        if module.tables.len() as u32 > module.num_imported_tables {
            let limits = module.tables.values().next().expect("length checked");
            self.c.start_line();
            w!(self.c, "var T0 = {}.{}({}", runtime::CTX, runtime::CREATE_TABLE, limits.initial);
            if let Some(maximum) = limits.maximum {
                w!(self.c, ", {maximum}");
            }
            self.c.raw(");\n");
        }

        // Declared globals; init expressions only reference imported
        // globals, which are all bound by now.
        for (defined, init) in self.c.module.global_initializers.iter() {
            let index = self.c.module.num_imported_globals + defined.as_u32();
            self.c.start_line();
            w!(self.c, "var G{index} = ");
            self.const_value(init);
            self.c.raw(";\n");
        }
    }

    fn const_value(&mut self, expr: &ConstExpr) {
        match expr {
            ConstExpr::I32(v) => self.c.literal(Literal::I32(*v)),
            ConstExpr::I64(v) => self.c.literal(Literal::I64(*v)),
            ConstExpr::F32(bits) => self.c.literal(Literal::F32(*bits)),
            ConstExpr::F64(bits) => self.c.literal(Literal::F64(*bits)),
            ConstExpr::GlobalGet(g) => {
                w!(self.c, "G{}", g.as_u32());
            }
        }
    }

    /// Typed views over the memory buffer plus the cached byte length.
    /// Growth replaces the buffer, so every view re-acquires on the grow
    /// callback.
    fn emit_memory_views(&mut self) {
        if self.c.module.memories.is_empty() {
            return;
        }
        self.c.line(
            "var HU8 = null, HS8 = null, HU16 = null, HS16 = null, HS32 = null, \
             HF32 = null, HF64 = null;",
        );
        self.c.line("var memSize = 0;");
        self.c.line("function refreshViews() {");
        self.c.indent();
        self.c.line("var b = M0.buffer;");
        self.c.line("HU8 = new Uint8Array(b);");
        self.c.line("HS8 = new Int8Array(b);");
        self.c.line("HU16 = new Uint16Array(b);");
        self.c.line("HS16 = new Int16Array(b);");
        self.c.line("HS32 = new Int32Array(b);");
        self.c.line("HF32 = new Float32Array(b);");
        self.c.line("HF64 = new Float64Array(b);");
        self.c.line("memSize = b.byteLength;");
        self.c.dedent();
        self.c.line("}");
        self.c.line("M0.onGrow(refreshViews);");
        self.c.line("refreshViews();");
    }

    /// The dynamic checks behind `call_indirect`: index in range, slot
    /// initialized, declared signature string matches the callee's.
    fn emit_table_check(&mut self) {
        if self.c.module.tables.is_empty() {
            return;
        }
        self.c.line("function tblCheck(idx, sig) {");
        self.c.indent();
        self.c.line("idx = idx >>> 0;");
        self.c.start_line();
        w!(
            self.c,
            "if (idx >= T0.length) rt.trap(\"{}\");\n",
            Trap::TableOutOfBounds.message()
        );
        self.c.line("var fn = T0.get(idx);");
        self.c.start_line();
        w!(
            self.c,
            "if (!fn) rt.trap(\"{}\");\n",
            Trap::IndirectCallToNull.message()
        );
        self.c.start_line();
        w!(
            self.c,
            "if (fn.sig !== sig) rt.trap(\"{}\");\n",
            Trap::BadSignature.message()
        );
        self.c.line("return fn;");
        self.c.dedent();
        self.c.line("}");
    }

    /// Module initialization, in order: element segments, data segments,
    /// start function. Every segment's bounds are checked before the first
    /// write so a failing module leaves table and memory untouched.
    fn emit_initialization(&mut self) {
        let module = self.c.module;
        let element_segments = &module.element_segments;
        let data_segments = &module.data_segments;

        for (k, segment) in element_segments.iter().enumerate() {
            self.c.start_line();
            w!(self.c, "var elemOff{k} = ");
            self.const_value(&segment.offset);
            self.c.raw(";\n");
        }
        for (k, segment) in data_segments.iter().enumerate() {
            self.c.start_line();
            w!(self.c, "var dataOff{k} = ");
            self.const_value(&segment.offset);
            self.c.raw(";\n");
        }

        for (k, segment) in element_segments.iter().enumerate() {
            self.c.start_line();
            w!(
                self.c,
                "if ((elemOff{k} >>> 0) + {} > T0.length) {}.{}(\"element segment does not fit table\");\n",
                segment.functions.len(),
                runtime::CTX,
                runtime::LINK_ERROR,
            );
        }
        for (k, segment) in data_segments.iter().enumerate() {
            self.c.start_line();
            w!(
                self.c,
                "if ((dataOff{k} >>> 0) + {} > memSize) {}.{}(\"data segment does not fit memory\");\n",
                segment.bytes.len(),
                runtime::CTX,
                runtime::LINK_ERROR,
            );
        }

        for (k, segment) in element_segments.iter().enumerate() {
            for (j, func) in segment.functions.iter().enumerate() {
                self.c.start_line();
                w!(
                    self.c,
                    "T0.set((elemOff{k} >>> 0) + {j}, F{});\n",
                    func.as_u32()
                );
            }
        }
        for (k, segment) in data_segments.iter().enumerate() {
            if segment.bytes.is_empty() {
                continue;
            }
            self.c.start_line();
            self.c.raw("HU8.set([");
            for (j, byte) in segment.bytes.iter().enumerate() {
                if j > 0 {
                    self.c.raw(",");
                }
                w!(self.c, "{byte}");
            }
            w!(self.c, "], dataOff{k} >>> 0);\n");
        }

        if let Some(start) = module.start {
            self.c.start_line();
            w!(self.c, "F{}();\n", start.as_u32());
        }
    }

    fn emit_exports(&mut self) {
        let module = self.c.module;
        if module.exports.is_empty() {
            self.c.line("return {};");
            return;
        }
        self.c.line("return {");
        self.c.indent();
        for export in &module.exports {
            self.c.start_line();
            self.c.raw("\"");
            let escaped = escape_js_string(export.name);
            self.c.raw(&escaped);
            self.c.raw("\": ");
            match export.index {
                EntityIndex::Function(f) => {
                    w!(self.c, "F{}", f.as_u32());
                }
                EntityIndex::Global(g) => {
                    w!(self.c, "G{}", g.as_u32());
                }
                EntityIndex::Memory(_) => self.c.raw("M0"),
                EntityIndex::Table(_) => self.c.raw("T0"),
            }
            self.c.raw(",\n");
        }
        self.c.dedent();
        self.c.line("};");
    }
}

/// Export names are arbitrary UTF-8; anything that could terminate or
/// confuse a double-quoted JS string literal is escaped.
fn escape_js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if (c as u32) < 0x20 => {
                let _ = core::fmt::Write::write_fmt(
                    &mut out,
                    format_args!("\\u{:04x}", c as u32),
                );
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping() {
        assert_eq!(escape_js_string("times-two"), "times-two");
        assert_eq!(escape_js_string("a\"b"), "a\\\"b");
        assert_eq!(escape_js_string("a\\b"), "a\\\\b");
        assert_eq!(escape_js_string("a\u{1}b"), "a\\u0001b");
    }
}
