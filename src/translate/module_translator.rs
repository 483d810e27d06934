use crate::errors::{CompileError, CompileErrorKind};
use crate::indices::{EntityIndex, FuncIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex};
use crate::opcode::{external_kind, section, type_tag};
use crate::reader::Reader;
use crate::translate::types::{
    read_limits, read_memory_limits, read_val_type, FuncType, GlobalType, ValType,
};
use crate::translate::{
    ConstExpr, DataSegment, ElementSegment, Export, FunctionBody, Import, Translation,
};
use crate::{Result, WASM_VERSION};
use alloc::borrow::ToOwned;
use alloc::vec::Vec;
use hashbrown::HashSet;

/// Decodes a complete module from a byte buffer, section by section.
///
/// Sections must appear in strictly ascending id order; custom sections (and
/// ids past the known range) may appear anywhere and are skipped. Imports
/// populate the front of each index space before local declarations are
/// appended, so every lookup during decoding is a constant-time index into
/// the tables being built.
#[derive(Default)]
pub struct ModuleTranslator<'wasm> {
    result: Translation<'wasm>,
    last_section: u8,
    num_declared_functions: u32,
    seen_code_section: bool,
}

impl<'wasm> ModuleTranslator<'wasm> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(mut self, bytes: &'wasm [u8]) -> Result<Translation<'wasm>> {
        let mut reader = Reader::new(bytes);
        self.parse_header(&mut reader)?;

        while !reader.is_eof() {
            self.parse_section(&mut reader)?;
        }

        if !self.seen_code_section && self.num_declared_functions != 0 {
            return Err(reader.err(CompileErrorKind::FunctionCountMismatch));
        }

        tracing::debug!(
            "translated module: {} types, {} functions ({} imported), {} exports",
            self.result.module.types.len(),
            self.result.module.functions.len(),
            self.result.module.num_imported_functions,
            self.result.module.exports.len(),
        );
        Ok(self.result)
    }

    fn parse_header(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let magic = reader.read_u32_le()?;
        if magic != 0x6d73_6100 {
            return Err(CompileError::new(CompileErrorKind::BadMagic, 0));
        }
        let version = reader.read_u32_le()?;
        if version != WASM_VERSION {
            return Err(CompileError::new(CompileErrorKind::BadVersion(version), 4));
        }
        Ok(())
    }

    fn parse_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let id_offset = reader.offset();
        let id = reader.read_var_u7()?;
        let payload_len = reader.read_var_u32()? as usize;
        let start = reader.pos();
        let end = start
            .checked_add(payload_len)
            .filter(|end| *end <= start + reader.bytes_remaining())
            .ok_or_else(|| reader.err(CompileErrorKind::UnexpectedEof))?;

        tracing::trace!("section id={id} payload={payload_len} bytes");

        if id == section::CUSTOM || id > section::LAST_KNOWN {
            // Custom sections carry no semantics; ids past the known range
            // are tolerated the same way.
            if id == section::CUSTOM {
                self.parse_custom_section(reader, end)?;
            }
            return reader.skip_to(end);
        }

        if id <= self.last_section {
            return Err(CompileError::new(
                CompileErrorKind::SectionOutOfOrder(id),
                id_offset,
            ));
        }
        self.last_section = id;

        match id {
            section::TYPE => self.parse_type_section(reader)?,
            section::IMPORT => self.parse_import_section(reader)?,
            section::FUNCTION => self.parse_function_section(reader)?,
            section::TABLE => self.parse_table_section(reader)?,
            section::MEMORY => self.parse_memory_section(reader)?,
            section::GLOBAL => self.parse_global_section(reader)?,
            section::EXPORT => self.parse_export_section(reader)?,
            section::START => self.parse_start_section(reader)?,
            section::ELEMENT => self.parse_element_section(reader)?,
            section::CODE => self.parse_code_section(reader)?,
            section::DATA => self.parse_data_section(reader)?,
            _ => unreachable!(),
        }

        // Trailing padding inside the declared payload is tolerated; having
        // consumed more than the payload is not.
        if reader.pos() > end {
            return Err(reader.err(CompileErrorKind::SectionSizeMismatch));
        }
        reader.skip_to(end)
    }

    fn parse_custom_section(&mut self, reader: &mut Reader<'wasm>, end: usize) -> Result<()> {
        let name = reader.read_name()?;
        if reader.pos() > end {
            return Err(reader.err(CompileErrorKind::SectionSizeMismatch));
        }
        let payload_offset = reader.offset();
        let payload = reader.read_bytes(end - reader.pos())?;
        if name == "name" {
            // Best effort only: a malformed name section never fails the
            // module, it is simply dropped.
            if self.parse_name_section(payload, payload_offset).is_err() {
                tracing::debug!("ignoring malformed name section");
                self.result.module.func_names.clear();
            }
        }
        Ok(())
    }

    fn parse_name_section(&mut self, payload: &'wasm [u8], base: usize) -> Result<()> {
        let mut reader = Reader::new_at(payload, base);
        while !reader.is_eof() {
            let name_type = reader.read_var_u7()?;
            let subsection_len = reader.read_var_u32()? as usize;
            if name_type == 1 {
                let count = reader.read_var_u32()?;
                for _ in 0..count {
                    let index = reader.read_var_u32()?;
                    let name = reader.read_name()?;
                    if (index as usize) < self.result.module.functions.len() {
                        self.result
                            .module
                            .func_names
                            .insert(FuncIndex::from_u32(index), name);
                    }
                }
            } else {
                let end = reader
                    .pos()
                    .checked_add(subsection_len)
                    .ok_or_else(|| reader.err(CompileErrorKind::UnexpectedEof))?;
                reader.skip_to(end)?;
            }
        }
        Ok(())
    }

    fn parse_type_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        for _ in 0..count {
            let offset = reader.offset();
            let form = reader.read_var_i7()?;
            if form != type_tag::FUNC {
                return Err(CompileError::new(
                    CompileErrorKind::BadTypeForm(form as u8),
                    offset,
                ));
            }
            let param_count = reader.read_var_u32()?;
            let mut params = Vec::with_capacity(param_count.min(64) as usize);
            for _ in 0..param_count {
                params.push(read_val_type(reader)?);
            }
            let result_count_offset = reader.offset();
            let result_count = reader.read_var_u32()?;
            let result = match result_count {
                0 => None,
                1 => Some(read_val_type(reader)?),
                _ => {
                    return Err(CompileError::new(
                        CompileErrorKind::TooManyResults,
                        result_count_offset,
                    ))
                }
            };
            self.result.module.types.push(FuncType {
                params: params.into_boxed_slice(),
                result,
            });
        }
        Ok(())
    }

    fn parse_import_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        for _ in 0..count {
            let module = reader.read_name()?;
            let field = reader.read_name()?;
            let kind_offset = reader.offset();
            let kind = reader.read_byte()?;
            let module_tables = &mut self.result.module;
            let index = match kind {
                external_kind::FUNCTION => {
                    let type_index = reader.read_var_u32()?;
                    if type_index as usize >= module_tables.types.len() {
                        return Err(CompileError::new(
                            CompileErrorKind::UnknownType(type_index),
                            kind_offset,
                        ));
                    }
                    module_tables.num_imported_functions += 1;
                    EntityIndex::Function(
                        module_tables
                            .functions
                            .push(TypeIndex::from_u32(type_index)),
                    )
                }
                external_kind::TABLE => {
                    let limits = Self::read_table_type(reader)?;
                    if !module_tables.tables.is_empty() {
                        return Err(CompileError::new(
                            CompileErrorKind::MultipleTables,
                            kind_offset,
                        ));
                    }
                    module_tables.num_imported_tables += 1;
                    EntityIndex::Table(module_tables.tables.push(limits))
                }
                external_kind::MEMORY => {
                    let limits = read_memory_limits(reader)?;
                    if !module_tables.memories.is_empty() {
                        return Err(CompileError::new(
                            CompileErrorKind::MultipleMemories,
                            kind_offset,
                        ));
                    }
                    module_tables.num_imported_memories += 1;
                    EntityIndex::Memory(module_tables.memories.push(limits))
                }
                external_kind::GLOBAL => {
                    let ty = read_val_type(reader)?;
                    let mutable_offset = reader.offset();
                    if reader.read_var_u1()? == 1 {
                        return Err(CompileError::new(
                            CompileErrorKind::MutableGlobalImport,
                            mutable_offset,
                        ));
                    }
                    module_tables.num_imported_globals += 1;
                    EntityIndex::Global(
                        module_tables
                            .globals
                            .push(GlobalType { ty, mutable: false }),
                    )
                }
                _ => {
                    return Err(CompileError::new(
                        CompileErrorKind::BadExternalKind(kind),
                        kind_offset,
                    ))
                }
            };
            self.result.module.imports.push(Import {
                module,
                field,
                index,
            });
        }
        Ok(())
    }

    fn read_table_type(reader: &mut Reader<'wasm>) -> Result<crate::translate::Limits> {
        let offset = reader.offset();
        let elem_type = reader.read_var_i7()?;
        if elem_type != type_tag::ANYFUNC {
            return Err(CompileError::new(
                CompileErrorKind::BadElementType(elem_type as u8),
                offset,
            ));
        }
        read_limits(reader)
    }

    fn parse_function_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        self.num_declared_functions = count;
        for _ in 0..count {
            let offset = reader.offset();
            let type_index = reader.read_var_u32()?;
            if type_index as usize >= self.result.module.types.len() {
                return Err(CompileError::new(
                    CompileErrorKind::UnknownType(type_index),
                    offset,
                ));
            }
            self.result
                .module
                .functions
                .push(TypeIndex::from_u32(type_index));
        }
        Ok(())
    }

    fn parse_table_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        for _ in 0..count {
            let offset = reader.offset();
            let limits = Self::read_table_type(reader)?;
            if !self.result.module.tables.is_empty() {
                return Err(CompileError::new(CompileErrorKind::MultipleTables, offset));
            }
            self.result.module.tables.push(limits);
        }
        Ok(())
    }

    fn parse_memory_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        for _ in 0..count {
            let offset = reader.offset();
            let limits = read_memory_limits(reader)?;
            if !self.result.module.memories.is_empty() {
                return Err(CompileError::new(
                    CompileErrorKind::MultipleMemories,
                    offset,
                ));
            }
            self.result.module.memories.push(limits);
        }
        Ok(())
    }

    fn parse_global_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        for _ in 0..count {
            let ty = read_val_type(reader)?;
            let mutable = reader.read_var_u1()? == 1;
            let init = ConstExpr::decode(reader, &self.result.module, ty)?;
            self.result.module.globals.push(GlobalType { ty, mutable });
            self.result.module.global_initializers.push(init);
        }
        Ok(())
    }

    fn parse_export_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        let mut seen = HashSet::new();
        for _ in 0..count {
            let name_offset = reader.offset();
            let name = reader.read_name()?;
            if !seen.insert(name) {
                return Err(CompileError::new(
                    CompileErrorKind::DuplicateExport(name.to_owned()),
                    name_offset,
                ));
            }
            let kind_offset = reader.offset();
            let kind = reader.read_byte()?;
            let index = reader.read_var_u32()?;
            let module_tables = &self.result.module;
            let index = match kind {
                external_kind::FUNCTION => {
                    if index as usize >= module_tables.functions.len() {
                        return Err(CompileError::new(
                            CompileErrorKind::UnknownFunction(index),
                            kind_offset,
                        ));
                    }
                    EntityIndex::Function(FuncIndex::from_u32(index))
                }
                external_kind::TABLE => {
                    if index as usize >= module_tables.tables.len() {
                        return Err(CompileError::new(
                            CompileErrorKind::UnknownTable(index),
                            kind_offset,
                        ));
                    }
                    EntityIndex::Table(TableIndex::from_u32(index))
                }
                external_kind::MEMORY => {
                    if index as usize >= module_tables.memories.len() {
                        return Err(CompileError::new(
                            CompileErrorKind::UnknownMemory(index),
                            kind_offset,
                        ));
                    }
                    EntityIndex::Memory(MemoryIndex::from_u32(index))
                }
                external_kind::GLOBAL => {
                    let global_index = GlobalIndex::from_u32(index);
                    match module_tables.globals.get(global_index) {
                        None => {
                            return Err(CompileError::new(
                                CompileErrorKind::UnknownGlobal(index),
                                kind_offset,
                            ))
                        }
                        Some(global) if global.mutable => {
                            return Err(CompileError::new(
                                CompileErrorKind::MutableGlobalExport,
                                kind_offset,
                            ))
                        }
                        Some(_) => EntityIndex::Global(global_index),
                    }
                }
                _ => {
                    return Err(CompileError::new(
                        CompileErrorKind::BadExternalKind(kind),
                        kind_offset,
                    ))
                }
            };
            self.result.module.exports.push(Export { name, index });
        }
        Ok(())
    }

    fn parse_start_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let offset = reader.offset();
        let index = reader.read_var_u32()?;
        let func_index = FuncIndex::from_u32(index);
        if index as usize >= self.result.module.functions.len() {
            return Err(CompileError::new(
                CompileErrorKind::UnknownFunction(index),
                offset,
            ));
        }
        let ty = self.result.module.type_of(func_index);
        if !ty.params.is_empty() || ty.result.is_some() {
            return Err(CompileError::new(
                CompileErrorKind::BadStartSignature,
                offset,
            ));
        }
        self.result.module.start = Some(func_index);
        Ok(())
    }

    fn parse_element_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        for _ in 0..count {
            let offset = reader.offset();
            let table_index = reader.read_var_u32()?;
            if table_index != 0 || self.result.module.tables.is_empty() {
                return Err(CompileError::new(
                    CompileErrorKind::UnknownTable(table_index),
                    offset,
                ));
            }
            let init = ConstExpr::decode(reader, &self.result.module, ValType::I32)?;
            let num_elements = reader.read_var_u32()?;
            let mut functions = Vec::with_capacity(num_elements.min(1024) as usize);
            for _ in 0..num_elements {
                let func_offset = reader.offset();
                let func_index = reader.read_var_u32()?;
                if func_index as usize >= self.result.module.functions.len() {
                    return Err(CompileError::new(
                        CompileErrorKind::UnknownFunction(func_index),
                        func_offset,
                    ));
                }
                functions.push(FuncIndex::from_u32(func_index));
            }
            self.result.module.element_segments.push(ElementSegment {
                table_index: TableIndex::from_u32(table_index),
                offset: init,
                functions,
            });
        }
        Ok(())
    }

    fn parse_code_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        self.seen_code_section = true;
        let count_offset = reader.offset();
        let count = reader.read_var_u32()?;
        if count != self.num_declared_functions {
            return Err(CompileError::new(
                CompileErrorKind::FunctionCountMismatch,
                count_offset,
            ));
        }
        for _ in 0..count {
            let body_size = reader.read_var_u32()? as usize;
            let offset = reader.offset();
            let bytes = reader.read_bytes(body_size)?;
            self.result.func_bodies.push(FunctionBody { offset, bytes });
        }
        Ok(())
    }

    fn parse_data_section(&mut self, reader: &mut Reader<'wasm>) -> Result<()> {
        let count = reader.read_var_u32()?;
        for _ in 0..count {
            let offset = reader.offset();
            let memory_index = reader.read_var_u32()?;
            if memory_index != 0 || self.result.module.memories.is_empty() {
                return Err(CompileError::new(
                    CompileErrorKind::UnknownMemory(memory_index),
                    offset,
                ));
            }
            let init = ConstExpr::decode(reader, &self.result.module, ValType::I32)?;
            let size = reader.read_var_u32()? as usize;
            let bytes = reader.read_bytes(size)?;
            self.result.module.data_segments.push(DataSegment {
                memory_index: MemoryIndex::from_u32(memory_index),
                offset: init,
                bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn module(sections: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut bytes = vec![0x00, 0x61, 0x73, 0x6d, 0x0d, 0x00, 0x00, 0x00];
        for (id, payload) in sections {
            bytes.push(*id);
            assert!(payload.len() < 0x80);
            bytes.push(payload.len() as u8);
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    fn translate(bytes: &[u8]) -> Result<Translation<'_>> {
        ModuleTranslator::new().translate(bytes)
    }

    #[test]
    fn empty_module() {
        let bytes = module(&[]);
        let translation = translate(&bytes).unwrap();
        assert!(translation.module.types.is_empty());
        assert!(translation.module.start.is_none());
    }

    #[test]
    fn bad_magic() {
        let err = translate(&[0x00, 0x61, 0x73, 0x00, 0x0d, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::BadMagic);
    }

    #[test]
    fn bad_version() {
        let err = translate(&[0x00, 0x61, 0x73, 0x6d, 0x01, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::BadVersion(1));
        assert_eq!(err.offset, 4);
    }

    #[test]
    fn sections_out_of_order() {
        // Memory section (5) before table section (4).
        let bytes = module(&[
            (section::MEMORY, vec![0x01, 0x00, 0x01]),
            (section::TABLE, vec![0x01, 0x70, 0x00, 0x00]),
        ]);
        let err = translate(&bytes).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::SectionOutOfOrder(4));
    }

    #[test]
    fn duplicate_section_id_is_out_of_order() {
        let bytes = module(&[(section::TYPE, vec![0x00]), (section::TYPE, vec![0x00])]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::SectionOutOfOrder(1)
        );
    }

    #[test]
    fn custom_sections_anywhere() {
        let bytes = module(&[
            (section::CUSTOM, vec![0x03, b'a', b'b', b'c', 0xff]),
            (section::TYPE, vec![0x00]),
            (section::CUSTOM, vec![0x00]),
        ]);
        assert!(translate(&bytes).is_ok());
    }

    #[test]
    fn unknown_section_id_is_tolerated() {
        let bytes = module(&[(0x0c, vec![0xaa, 0xbb]), (0x30, vec![])]);
        assert!(translate(&bytes).is_ok());
    }

    #[test]
    fn section_payload_overrun() {
        // Type section declares 1 entry but its payload is cut short.
        let mut bytes = module(&[]);
        bytes.extend_from_slice(&[section::TYPE, 0x01, 0x01]);
        assert!(translate(&bytes).is_err());
    }

    #[test]
    fn two_memories_rejected() {
        let bytes = module(&[(section::MEMORY, vec![0x02, 0x00, 0x01, 0x00, 0x01])]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::MultipleMemories
        );
    }

    #[test]
    fn imported_memory_plus_declared_memory_rejected() {
        let bytes = module(&[
            // import "e" "m" (memory 1)
            (
                section::IMPORT,
                vec![0x01, 0x01, b'e', 0x01, b'm', 0x02, 0x00, 0x01],
            ),
            (section::MEMORY, vec![0x01, 0x00, 0x01]),
        ]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::MultipleMemories
        );
    }

    #[test]
    fn mutable_global_import_rejected() {
        let bytes = module(&[(
            section::IMPORT,
            vec![0x01, 0x01, b'e', 0x01, b'g', 0x03, 0x7f, 0x01],
        )]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::MutableGlobalImport
        );
    }

    #[test]
    fn duplicate_export_rejected() {
        let bytes = module(&[
            (section::MEMORY, vec![0x01, 0x00, 0x01]),
            (
                section::EXPORT,
                vec![0x02, 0x01, b'm', 0x02, 0x00, 0x01, b'm', 0x02, 0x00],
            ),
        ]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::DuplicateExport("m".into())
        );
    }

    #[test]
    fn code_count_must_match_function_count() {
        let bytes = module(&[
            (section::TYPE, vec![0x01, 0x60, 0x00, 0x00]),
            (section::FUNCTION, vec![0x01, 0x00]),
            (section::CODE, vec![0x00]),
        ]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::FunctionCountMismatch
        );
    }

    #[test]
    fn missing_code_section_is_a_count_mismatch() {
        let bytes = module(&[
            (section::TYPE, vec![0x01, 0x60, 0x00, 0x00]),
            (section::FUNCTION, vec![0x01, 0x00]),
        ]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::FunctionCountMismatch
        );
    }

    #[test]
    fn global_init_expr_must_match_type() {
        // (global i32 (f32.const 0))
        let bytes = module(&[(
            section::GLOBAL,
            vec![0x01, 0x7f, 0x00, 0x43, 0x00, 0x00, 0x00, 0x00, 0x0b],
        )]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::BadInitExprType
        );
    }

    #[test]
    fn start_function_signature_checked() {
        // (type (func (param i32))) (func ...) (start 0)
        let bytes = module(&[
            (section::TYPE, vec![0x01, 0x60, 0x01, 0x7f, 0x00]),
            (section::FUNCTION, vec![0x01, 0x00]),
            (section::START, vec![0x00]),
            (section::CODE, vec![0x01, 0x02, 0x00, 0x0b]),
        ]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::BadStartSignature
        );
    }

    #[test]
    fn element_segment_requires_table() {
        let bytes = module(&[(section::ELEMENT, vec![0x01, 0x00, 0x41, 0x00, 0x0b, 0x00])]);
        assert_eq!(
            translate(&bytes).unwrap_err().kind,
            CompileErrorKind::UnknownTable(0)
        );
    }

    #[test]
    fn index_spaces_start_with_imports() {
        let bytes = module(&[
            (section::TYPE, vec![0x01, 0x60, 0x00, 0x00]),
            // import "e" "f" (func (type 0))
            (
                section::IMPORT,
                vec![0x01, 0x01, b'e', 0x01, b'f', 0x00, 0x00],
            ),
            (section::FUNCTION, vec![0x01, 0x00]),
            (section::CODE, vec![0x01, 0x02, 0x00, 0x0b]),
        ]);
        let translation = translate(&bytes).unwrap();
        assert_eq!(translation.module.functions.len(), 2);
        assert_eq!(translation.module.num_imported_functions, 1);
        assert!(translation.module.is_imported_func(FuncIndex::from_u32(0)));
        assert!(!translation.module.is_imported_func(FuncIndex::from_u32(1)));
        assert_eq!(translation.func_bodies.len(), 1);
    }
}
