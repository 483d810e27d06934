mod code_translator;
mod const_expr;
mod func_translator;
mod ir;
mod module_translator;
mod state;
mod types;

use crate::indices::{
    DefinedFuncIndex, DefinedGlobalIndex, EntityIndex, FuncIndex, GlobalIndex, MemoryIndex,
    TableIndex, TypeIndex,
};
use alloc::vec::Vec;
use cranelift_entity::PrimaryMap;
use hashbrown::HashMap;

pub use const_expr::ConstExpr;
pub use func_translator::{FuncTranslator, FunctionIr};
pub use ir::{
    BranchTarget, CmpOp, ConvertMode, Expr, FloatBinOp, FloatUnOp, IntBinOp, IntUnOp, Label,
    Literal, Stmt, TempVar, TrapCondition,
};
pub use module_translator::ModuleTranslator;
pub use types::{FuncType, GlobalType, Limits, ValType};

/// Everything the decoder extracts from a module: the module-level tables
/// plus the raw bytes of each function body, ready for per-function
/// validation and lowering.
#[derive(Debug, Default)]
pub struct Translation<'wasm> {
    pub module: TranslatedModule<'wasm>,
    pub func_bodies: PrimaryMap<DefinedFuncIndex, FunctionBody<'wasm>>,
}

/// A function body as found in the code section. `offset` is the absolute
/// position of `bytes` in the module, for error reporting.
#[derive(Debug)]
pub struct FunctionBody<'wasm> {
    pub offset: usize,
    pub bytes: &'wasm [u8],
}

/// Module-level tables built by the decoder. Imported entities occupy the
/// front of each index space, locally declared ones follow.
#[derive(Debug, Default)]
pub struct TranslatedModule<'wasm> {
    pub types: PrimaryMap<TypeIndex, FuncType>,
    pub functions: PrimaryMap<FuncIndex, TypeIndex>,
    pub tables: PrimaryMap<TableIndex, Limits>,
    pub memories: PrimaryMap<MemoryIndex, Limits>,
    pub globals: PrimaryMap<GlobalIndex, GlobalType>,
    pub global_initializers: PrimaryMap<DefinedGlobalIndex, ConstExpr>,

    pub imports: Vec<Import<'wasm>>,
    pub exports: Vec<Export<'wasm>>,
    pub start: Option<FuncIndex>,
    pub element_segments: Vec<ElementSegment>,
    pub data_segments: Vec<DataSegment<'wasm>>,

    /// Function names harvested from the `name` custom section. Only used
    /// to label emitted functions.
    pub func_names: HashMap<FuncIndex, &'wasm str>,

    pub num_imported_functions: u32,
    pub num_imported_tables: u32,
    pub num_imported_memories: u32,
    pub num_imported_globals: u32,
}

impl<'wasm> TranslatedModule<'wasm> {
    /// The signature of any function in the index space, imported or not.
    #[inline]
    pub fn type_of(&self, index: FuncIndex) -> &FuncType {
        &self.types[self.functions[index]]
    }

    #[inline]
    pub fn func_index(&self, index: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::from_u32(self.num_imported_functions + index.as_u32())
    }

    #[inline]
    pub fn defined_func_index(&self, index: FuncIndex) -> Option<DefinedFuncIndex> {
        if self.is_imported_func(index) {
            None
        } else {
            Some(DefinedFuncIndex::from_u32(
                index.as_u32() - self.num_imported_functions,
            ))
        }
    }

    #[inline]
    pub fn is_imported_func(&self, index: FuncIndex) -> bool {
        index.as_u32() < self.num_imported_functions
    }

    #[inline]
    pub fn is_imported_table(&self, index: TableIndex) -> bool {
        index.as_u32() < self.num_imported_tables
    }

    #[inline]
    pub fn is_imported_memory(&self, index: MemoryIndex) -> bool {
        index.as_u32() < self.num_imported_memories
    }

    #[inline]
    pub fn is_imported_global(&self, index: GlobalIndex) -> bool {
        index.as_u32() < self.num_imported_globals
    }

    #[inline]
    pub fn defined_global_index(&self, index: GlobalIndex) -> Option<DefinedGlobalIndex> {
        if self.is_imported_global(index) {
            None
        } else {
            Some(DefinedGlobalIndex::from_u32(
                index.as_u32() - self.num_imported_globals,
            ))
        }
    }

    pub fn num_defined_functions(&self) -> u32 {
        self.functions.len() as u32 - self.num_imported_functions
    }

    /// Position of an imported entity in the module-order imports list,
    /// which is also its position in the embedder's resolved-imports array.
    pub fn import_position(&self, entity: EntityIndex) -> Option<usize> {
        self.imports.iter().position(|import| import.index == entity)
    }
}

/// One import entry. `index` names the slot it occupies in its index space.
#[derive(Debug, PartialEq, Eq)]
pub struct Import<'wasm> {
    pub module: &'wasm str,
    pub field: &'wasm str,
    pub index: EntityIndex,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Export<'wasm> {
    pub name: &'wasm str,
    pub index: EntityIndex,
}

#[derive(Debug)]
pub struct ElementSegment {
    pub table_index: TableIndex,
    pub offset: ConstExpr,
    pub functions: Vec<FuncIndex>,
}

#[derive(Debug)]
pub struct DataSegment<'wasm> {
    pub memory_index: MemoryIndex,
    pub offset: ConstExpr,
    pub bytes: &'wasm [u8],
}
