use crate::errors::{CompileError, CompileErrorKind};
use crate::indices::GlobalIndex;
use crate::opcode;
use crate::reader::Reader;
use crate::translate::types::ValType;
use crate::translate::TranslatedModule;
use crate::Result;

/// A restricted constant expression: one constant op or a `get_global` of an
/// imported immutable global, terminated by `end`. Used to initialize
/// globals and segment offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    GlobalGet(GlobalIndex),
}

impl ConstExpr {
    /// Decode an init expression and check it evaluates to `expected`.
    ///
    /// `get_global` may only name a global that is already declared at this
    /// point in the module, imported, and immutable.
    pub fn decode(
        reader: &mut Reader<'_>,
        module: &TranslatedModule<'_>,
        expected: ValType,
    ) -> Result<Self> {
        let start = reader.offset();
        let op = reader.read_byte()?;
        let expr = match op {
            opcode::I32_CONST => ConstExpr::I32(reader.read_var_i32()?),
            opcode::I64_CONST => ConstExpr::I64(reader.read_var_i64()?),
            opcode::F32_CONST => ConstExpr::F32(reader.read_f32_le()?),
            opcode::F64_CONST => ConstExpr::F64(reader.read_f64_le()?),
            opcode::GET_GLOBAL => {
                let index = reader.read_var_u32()?;
                let global = module
                    .globals
                    .get(GlobalIndex::from_u32(index))
                    .ok_or(CompileError::new(
                        CompileErrorKind::UnknownGlobal(index),
                        start,
                    ))?;
                let index = GlobalIndex::from_u32(index);
                if !module.is_imported_global(index) || global.mutable {
                    return Err(CompileError::new(CompileErrorKind::BadInitExpr, start));
                }
                ConstExpr::GlobalGet(index)
            }
            _ => return Err(CompileError::new(CompileErrorKind::BadInitExpr, start)),
        };
        if reader.read_byte()? != opcode::END {
            return Err(CompileError::new(CompileErrorKind::BadInitExpr, start));
        }
        let actual = match expr {
            ConstExpr::I32(_) => ValType::I32,
            ConstExpr::I64(_) => ValType::I64,
            ConstExpr::F32(_) => ValType::F32,
            ConstExpr::F64(_) => ValType::F64,
            ConstExpr::GlobalGet(index) => module.globals[index].ty,
        };
        if actual != expected {
            return Err(CompileError::new(CompileErrorKind::BadInitExprType, start));
        }
        Ok(expr)
    }
}
