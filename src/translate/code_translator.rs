use crate::errors::{CompileError, CompileErrorKind};
use crate::indices::{FuncIndex, GlobalIndex, LocalIndex, TypeIndex};
use crate::opcode;
use crate::reader::Reader;
use crate::translate::ir::{
    BranchTarget, CmpOp, ConvertMode, Expr, FloatBinOp, FloatUnOp, IntBinOp, IntUnOp, Literal,
    Stmt, TrapCondition,
};
use crate::translate::state::{ControlFrame, FrameKind, FuncTranslationState};
use crate::translate::types::{read_block_type, ValType};
use crate::translate::TranslatedModule;
use crate::traps::Trap;
use crate::Result;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Read-only context an operator needs besides the translation state: the
/// module tables and the flattened local types (parameters first).
pub(crate) struct FuncEnvironment<'a, 'wasm> {
    pub module: &'a TranslatedModule<'wasm>,
    pub locals: &'a [ValType],
}

impl FuncEnvironment<'_, '_> {
    fn local_ty(&self, index: u32, offset: usize) -> Result<ValType> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or(CompileError::new(
                CompileErrorKind::UnknownLocal(index),
                offset,
            ))
    }

    fn global_ty(&self, index: u32, offset: usize) -> Result<crate::translate::GlobalType> {
        self.module
            .globals
            .get(GlobalIndex::from_u32(index))
            .copied()
            .ok_or(CompileError::new(
                CompileErrorKind::UnknownGlobal(index),
                offset,
            ))
    }
}

/// Translate one operator: pop its operand types, build IR, push results,
/// possibly emit a statement. Validation happens inline with construction.
pub(crate) fn translate_operator(
    op: u8,
    reader: &mut Reader<'_>,
    state: &mut FuncTranslationState,
    env: &FuncEnvironment<'_, '_>,
) -> Result<()> {
    use opcode as op_;

    match op {
        // ------------------------------------------------- control flow
        op_::UNREACHABLE => {
            state.emit(Stmt::Unreachable);
            state.mark_unreachable();
        }
        op_::NOP => {}
        op_::BLOCK => {
            let ty = read_block_type(reader)?;
            state.push_frame(FrameKind::Block, ty);
        }
        op_::LOOP => {
            let ty = read_block_type(reader)?;
            state.push_frame(FrameKind::Loop, ty);
        }
        op_::IF => {
            let ty = read_block_type(reader)?;
            let condition = state.pop_operand(Some(ValType::I32))?;
            state.push_frame(
                FrameKind::IfElse {
                    condition,
                    then_stmts: None,
                },
                ty,
            );
        }
        op_::ELSE => translate_else(state)?,
        op_::END => translate_end(state)?,
        op_::BR => {
            let depth = reader.read_var_u32()?;
            let (target, result_ty) = state.resolve_branch(depth)?;
            let value = match result_ty {
                Some(ty) => Some(state.pop_operand(Some(ty))?),
                None => None,
            };
            state.emit(Stmt::Branch { target, value });
            state.mark_unreachable();
        }
        op_::BR_IF => {
            let depth = reader.read_var_u32()?;
            let condition = state.pop_operand(Some(ValType::I32))?;
            let (target, result_ty) = state.resolve_branch(depth)?;
            let value = match result_ty {
                Some(ty) => {
                    // The value stays on the stack when the branch is not
                    // taken, so it must live in a tempvar.
                    let value = state.pop_operand(Some(ty))?;
                    let value = state.spill_operand(value);
                    state.push_operand(value.clone());
                    Some(value)
                }
                None => None,
            };
            state.emit(Stmt::BranchIf {
                condition,
                target,
                value,
            });
        }
        op_::BR_TABLE => translate_br_table(reader, state)?,
        op_::RETURN => {
            let result_ty = state.function_result_ty();
            let value = match result_ty {
                Some(ty) => Some(state.pop_operand(Some(ty))?),
                None => None,
            };
            state.emit(Stmt::Branch {
                target: BranchTarget::Return,
                value,
            });
            state.mark_unreachable();
        }

        // ------------------------------------------------- calls
        op_::CALL => {
            let offset = state.cur_offset;
            let index = reader.read_var_u32()?;
            if index as usize >= env.module.functions.len() {
                return Err(CompileError::new(
                    CompileErrorKind::UnknownFunction(index),
                    offset,
                ));
            }
            let func_index = FuncIndex::from_u32(index);
            let type_index = env.module.functions[func_index];
            let args = pop_call_args(state, type_index, env)?;
            let result_ty = env.module.types[type_index].result;
            emit_call(
                state,
                Expr::Call {
                    type_index,
                    index: func_index,
                    args,
                },
                result_ty,
            );
        }
        op_::CALL_INDIRECT => {
            let offset = state.cur_offset;
            let index = reader.read_var_u32()?;
            if index as usize >= env.module.types.len() {
                return Err(CompileError::new(
                    CompileErrorKind::UnknownType(index),
                    offset,
                ));
            }
            if reader.read_byte()? != 0 {
                return Err(CompileError::new(
                    CompileErrorKind::BadReservedByte,
                    offset,
                ));
            }
            if env.module.tables.is_empty() {
                return Err(CompileError::new(CompileErrorKind::UnknownTable(0), offset));
            }
            let type_index = TypeIndex::from_u32(index);
            let callee = state.pop_operand(Some(ValType::I32))?;
            let args = pop_call_args(state, type_index, env)?;
            let result_ty = env.module.types[type_index].result;
            emit_call(
                state,
                Expr::CallIndirect {
                    type_index,
                    index: Box::new(callee),
                    args,
                },
                result_ty,
            );
        }

        // ------------------------------------------------- parametric
        op_::DROP => {
            let value = state.pop_operand(None)?;
            // Only side-effecting expressions need a statement; a dropped
            // variable read or constant folds away entirely.
            if !value.is_trivial() && !matches!(value, Expr::Undefined) {
                state.emit(Stmt::Drop(value));
            }
        }
        op_::SELECT => {
            let condition = state.pop_operand(Some(ValType::I32))?;
            let if_false = state.pop_operand(None)?;
            let if_true = match if_false.ty() {
                Some(ty) => state.pop_operand(Some(ty))?,
                None => state.pop_operand(None)?,
            };
            state.push_operand(Expr::Select {
                condition: Box::new(condition),
                if_true: Box::new(if_true),
                if_false: Box::new(if_false),
            });
        }

        // ------------------------------------------------- variables
        op_::GET_LOCAL => {
            let index = reader.read_var_u32()?;
            let ty = env.local_ty(index, state.cur_offset)?;
            state.push_operand(Expr::GetLocal {
                ty,
                index: LocalIndex::from_u32(index),
            });
        }
        op_::SET_LOCAL => {
            let index = reader.read_var_u32()?;
            let ty = env.local_ty(index, state.cur_offset)?;
            let value = state.pop_operand(Some(ty))?;
            let index = LocalIndex::from_u32(index);
            state.spill_for_local_write(index);
            state.emit(Stmt::SetLocal { ty, index, value });
        }
        op_::TEE_LOCAL => {
            let index = reader.read_var_u32()?;
            let ty = env.local_ty(index, state.cur_offset)?;
            let value = state.pop_operand(Some(ty))?;
            let index = LocalIndex::from_u32(index);
            state.spill_for_local_write(index);
            state.emit(Stmt::SetLocal { ty, index, value });
            state.push_operand(Expr::GetLocal { ty, index });
        }
        op_::GET_GLOBAL => {
            let index = reader.read_var_u32()?;
            let global = env.global_ty(index, state.cur_offset)?;
            state.push_operand(Expr::GetGlobal {
                ty: global.ty,
                index: GlobalIndex::from_u32(index),
            });
        }
        op_::SET_GLOBAL => {
            let offset = state.cur_offset;
            let index = reader.read_var_u32()?;
            let global = env.global_ty(index, offset)?;
            if !global.mutable {
                return Err(CompileError::new(
                    CompileErrorKind::GlobalIsImmutable(index),
                    offset,
                ));
            }
            let value = state.pop_operand(Some(global.ty))?;
            let index = GlobalIndex::from_u32(index);
            state.spill_for_global_write(index);
            state.emit(Stmt::SetGlobal {
                ty: global.ty,
                index,
                value,
            });
        }

        // ------------------------------------------------- memory
        op_::I32_LOAD => translate_load(reader, state, env, ValType::I32, 4, false)?,
        op_::I64_LOAD => translate_load(reader, state, env, ValType::I64, 8, false)?,
        op_::F32_LOAD => translate_load(reader, state, env, ValType::F32, 4, false)?,
        op_::F64_LOAD => translate_load(reader, state, env, ValType::F64, 8, false)?,
        op_::I32_LOAD8_S => translate_load(reader, state, env, ValType::I32, 1, true)?,
        op_::I32_LOAD8_U => translate_load(reader, state, env, ValType::I32, 1, false)?,
        op_::I32_LOAD16_S => translate_load(reader, state, env, ValType::I32, 2, true)?,
        op_::I32_LOAD16_U => translate_load(reader, state, env, ValType::I32, 2, false)?,
        op_::I64_LOAD8_S => translate_load(reader, state, env, ValType::I64, 1, true)?,
        op_::I64_LOAD8_U => translate_load(reader, state, env, ValType::I64, 1, false)?,
        op_::I64_LOAD16_S => translate_load(reader, state, env, ValType::I64, 2, true)?,
        op_::I64_LOAD16_U => translate_load(reader, state, env, ValType::I64, 2, false)?,
        op_::I64_LOAD32_S => translate_load(reader, state, env, ValType::I64, 4, true)?,
        op_::I64_LOAD32_U => translate_load(reader, state, env, ValType::I64, 4, false)?,
        op_::I32_STORE => translate_store(reader, state, env, ValType::I32, 4)?,
        op_::I64_STORE => translate_store(reader, state, env, ValType::I64, 8)?,
        op_::F32_STORE => translate_store(reader, state, env, ValType::F32, 4)?,
        op_::F64_STORE => translate_store(reader, state, env, ValType::F64, 8)?,
        op_::I32_STORE8 => translate_store(reader, state, env, ValType::I32, 1)?,
        op_::I32_STORE16 => translate_store(reader, state, env, ValType::I32, 2)?,
        op_::I64_STORE8 => translate_store(reader, state, env, ValType::I64, 1)?,
        op_::I64_STORE16 => translate_store(reader, state, env, ValType::I64, 2)?,
        op_::I64_STORE32 => translate_store(reader, state, env, ValType::I64, 4)?,
        op_::CURRENT_MEMORY => {
            check_memory_op(reader, state, env)?;
            state.push_operand(Expr::CurrentMemory);
        }
        op_::GROW_MEMORY => {
            check_memory_op(reader, state, env)?;
            let delta = state.pop_operand(Some(ValType::I32))?;
            state.spill_for_call();
            if state.in_dead_code() {
                state.push_operand(Expr::Undefined);
            } else {
                let temp = state.acquire_temp(ValType::I32);
                state.emit(Stmt::SetTemp {
                    temp,
                    value: Expr::GrowMemory(Box::new(delta)),
                });
                state.push_operand(Expr::GetTemp(temp));
            }
        }

        // ------------------------------------------------- constants
        op_::I32_CONST => {
            let value = reader.read_var_i32()?;
            state.push_operand(Expr::Const(Literal::I32(value)));
        }
        op_::I64_CONST => {
            let value = reader.read_var_i64()?;
            state.push_operand(Expr::Const(Literal::I64(value)));
        }
        op_::F32_CONST => {
            let bits = reader.read_f32_le()?;
            state.push_operand(Expr::Const(Literal::F32(bits)));
        }
        op_::F64_CONST => {
            let bits = reader.read_f64_le()?;
            state.push_operand(Expr::Const(Literal::F64(bits)));
        }

        // ------------------------------------------------- i32 compare
        op_::I32_EQZ => int_eqz(state, ValType::I32)?,
        op_::I32_EQ => relop(state, ValType::I32, CmpOp::Eq)?,
        op_::I32_NE => relop(state, ValType::I32, CmpOp::Ne)?,
        op_::I32_LT_S => relop(state, ValType::I32, CmpOp::LtS)?,
        op_::I32_LT_U => relop(state, ValType::I32, CmpOp::LtU)?,
        op_::I32_GT_S => relop(state, ValType::I32, CmpOp::GtS)?,
        op_::I32_GT_U => relop(state, ValType::I32, CmpOp::GtU)?,
        op_::I32_LE_S => relop(state, ValType::I32, CmpOp::LeS)?,
        op_::I32_LE_U => relop(state, ValType::I32, CmpOp::LeU)?,
        op_::I32_GE_S => relop(state, ValType::I32, CmpOp::GeS)?,
        op_::I32_GE_U => relop(state, ValType::I32, CmpOp::GeU)?,

        // ------------------------------------------------- i64 compare
        op_::I64_EQZ => int_eqz(state, ValType::I64)?,
        op_::I64_EQ => relop(state, ValType::I64, CmpOp::Eq)?,
        op_::I64_NE => relop(state, ValType::I64, CmpOp::Ne)?,
        op_::I64_LT_S => relop(state, ValType::I64, CmpOp::LtS)?,
        op_::I64_LT_U => relop(state, ValType::I64, CmpOp::LtU)?,
        op_::I64_GT_S => relop(state, ValType::I64, CmpOp::GtS)?,
        op_::I64_GT_U => relop(state, ValType::I64, CmpOp::GtU)?,
        op_::I64_LE_S => relop(state, ValType::I64, CmpOp::LeS)?,
        op_::I64_LE_U => relop(state, ValType::I64, CmpOp::LeU)?,
        op_::I64_GE_S => relop(state, ValType::I64, CmpOp::GeS)?,
        op_::I64_GE_U => relop(state, ValType::I64, CmpOp::GeU)?,

        // ------------------------------------------------- float compare
        op_::F32_EQ => relop(state, ValType::F32, CmpOp::Eq)?,
        op_::F32_NE => relop(state, ValType::F32, CmpOp::Ne)?,
        op_::F32_LT => relop(state, ValType::F32, CmpOp::Lt)?,
        op_::F32_GT => relop(state, ValType::F32, CmpOp::Gt)?,
        op_::F32_LE => relop(state, ValType::F32, CmpOp::Le)?,
        op_::F32_GE => relop(state, ValType::F32, CmpOp::Ge)?,
        op_::F64_EQ => relop(state, ValType::F64, CmpOp::Eq)?,
        op_::F64_NE => relop(state, ValType::F64, CmpOp::Ne)?,
        op_::F64_LT => relop(state, ValType::F64, CmpOp::Lt)?,
        op_::F64_GT => relop(state, ValType::F64, CmpOp::Gt)?,
        op_::F64_LE => relop(state, ValType::F64, CmpOp::Le)?,
        op_::F64_GE => relop(state, ValType::F64, CmpOp::Ge)?,

        // ------------------------------------------------- i32 arithmetic
        op_::I32_CLZ => int_unary(state, ValType::I32, IntUnOp::Clz)?,
        op_::I32_CTZ => int_unary(state, ValType::I32, IntUnOp::Ctz)?,
        op_::I32_POPCNT => int_unary(state, ValType::I32, IntUnOp::Popcnt)?,
        op_::I32_ADD => int_binary(state, ValType::I32, IntBinOp::Add)?,
        op_::I32_SUB => int_binary(state, ValType::I32, IntBinOp::Sub)?,
        op_::I32_MUL => int_binary(state, ValType::I32, IntBinOp::Mul)?,
        op_::I32_DIV_S => int_division(state, ValType::I32, IntBinOp::DivS)?,
        op_::I32_DIV_U => int_division(state, ValType::I32, IntBinOp::DivU)?,
        op_::I32_REM_S => int_division(state, ValType::I32, IntBinOp::RemS)?,
        op_::I32_REM_U => int_division(state, ValType::I32, IntBinOp::RemU)?,
        op_::I32_AND => int_binary(state, ValType::I32, IntBinOp::And)?,
        op_::I32_OR => int_binary(state, ValType::I32, IntBinOp::Or)?,
        op_::I32_XOR => int_binary(state, ValType::I32, IntBinOp::Xor)?,
        op_::I32_SHL => int_binary(state, ValType::I32, IntBinOp::Shl)?,
        op_::I32_SHR_S => int_binary(state, ValType::I32, IntBinOp::ShrS)?,
        op_::I32_SHR_U => int_binary(state, ValType::I32, IntBinOp::ShrU)?,
        op_::I32_ROTL => int_binary(state, ValType::I32, IntBinOp::Rotl)?,
        op_::I32_ROTR => int_binary(state, ValType::I32, IntBinOp::Rotr)?,

        // ------------------------------------------------- i64 arithmetic
        op_::I64_CLZ => int_unary(state, ValType::I64, IntUnOp::Clz)?,
        op_::I64_CTZ => int_unary(state, ValType::I64, IntUnOp::Ctz)?,
        op_::I64_POPCNT => int_unary(state, ValType::I64, IntUnOp::Popcnt)?,
        op_::I64_ADD => int_binary(state, ValType::I64, IntBinOp::Add)?,
        op_::I64_SUB => int_binary(state, ValType::I64, IntBinOp::Sub)?,
        op_::I64_MUL => int_binary(state, ValType::I64, IntBinOp::Mul)?,
        op_::I64_DIV_S => int_division(state, ValType::I64, IntBinOp::DivS)?,
        op_::I64_DIV_U => int_division(state, ValType::I64, IntBinOp::DivU)?,
        op_::I64_REM_S => int_division(state, ValType::I64, IntBinOp::RemS)?,
        op_::I64_REM_U => int_division(state, ValType::I64, IntBinOp::RemU)?,
        op_::I64_AND => int_binary(state, ValType::I64, IntBinOp::And)?,
        op_::I64_OR => int_binary(state, ValType::I64, IntBinOp::Or)?,
        op_::I64_XOR => int_binary(state, ValType::I64, IntBinOp::Xor)?,
        op_::I64_SHL => int_binary(state, ValType::I64, IntBinOp::Shl)?,
        op_::I64_SHR_S => int_binary(state, ValType::I64, IntBinOp::ShrS)?,
        op_::I64_SHR_U => int_binary(state, ValType::I64, IntBinOp::ShrU)?,
        op_::I64_ROTL => int_binary(state, ValType::I64, IntBinOp::Rotl)?,
        op_::I64_ROTR => int_binary(state, ValType::I64, IntBinOp::Rotr)?,

        // ------------------------------------------------- f32 arithmetic
        op_::F32_ABS => float_unary(state, ValType::F32, FloatUnOp::Abs)?,
        op_::F32_NEG => float_unary(state, ValType::F32, FloatUnOp::Neg)?,
        op_::F32_CEIL => float_unary(state, ValType::F32, FloatUnOp::Ceil)?,
        op_::F32_FLOOR => float_unary(state, ValType::F32, FloatUnOp::Floor)?,
        op_::F32_TRUNC => float_unary(state, ValType::F32, FloatUnOp::Trunc)?,
        op_::F32_NEAREST => float_unary(state, ValType::F32, FloatUnOp::Nearest)?,
        op_::F32_SQRT => float_unary(state, ValType::F32, FloatUnOp::Sqrt)?,
        op_::F32_ADD => float_binary(state, ValType::F32, FloatBinOp::Add)?,
        op_::F32_SUB => float_binary(state, ValType::F32, FloatBinOp::Sub)?,
        op_::F32_MUL => float_binary(state, ValType::F32, FloatBinOp::Mul)?,
        op_::F32_DIV => float_binary(state, ValType::F32, FloatBinOp::Div)?,
        op_::F32_MIN => float_binary(state, ValType::F32, FloatBinOp::Min)?,
        op_::F32_MAX => float_binary(state, ValType::F32, FloatBinOp::Max)?,
        op_::F32_COPYSIGN => float_binary(state, ValType::F32, FloatBinOp::Copysign)?,

        // ------------------------------------------------- f64 arithmetic
        op_::F64_ABS => float_unary(state, ValType::F64, FloatUnOp::Abs)?,
        op_::F64_NEG => float_unary(state, ValType::F64, FloatUnOp::Neg)?,
        op_::F64_CEIL => float_unary(state, ValType::F64, FloatUnOp::Ceil)?,
        op_::F64_FLOOR => float_unary(state, ValType::F64, FloatUnOp::Floor)?,
        op_::F64_TRUNC => float_unary(state, ValType::F64, FloatUnOp::Trunc)?,
        op_::F64_NEAREST => float_unary(state, ValType::F64, FloatUnOp::Nearest)?,
        op_::F64_SQRT => float_unary(state, ValType::F64, FloatUnOp::Sqrt)?,
        op_::F64_ADD => float_binary(state, ValType::F64, FloatBinOp::Add)?,
        op_::F64_SUB => float_binary(state, ValType::F64, FloatBinOp::Sub)?,
        op_::F64_MUL => float_binary(state, ValType::F64, FloatBinOp::Mul)?,
        op_::F64_DIV => float_binary(state, ValType::F64, FloatBinOp::Div)?,
        op_::F64_MIN => float_binary(state, ValType::F64, FloatBinOp::Min)?,
        op_::F64_MAX => float_binary(state, ValType::F64, FloatBinOp::Max)?,
        op_::F64_COPYSIGN => float_binary(state, ValType::F64, FloatBinOp::Copysign)?,

        // ------------------------------------------------- conversions
        op_::I32_WRAP_I64 => convert(state, ValType::I64, ValType::I32, ConvertMode::Wrap)?,
        op_::I32_TRUNC_S_F32 => trunc(state, ValType::F32, ValType::I32, true)?,
        op_::I32_TRUNC_U_F32 => trunc(state, ValType::F32, ValType::I32, false)?,
        op_::I32_TRUNC_S_F64 => trunc(state, ValType::F64, ValType::I32, true)?,
        op_::I32_TRUNC_U_F64 => trunc(state, ValType::F64, ValType::I32, false)?,
        op_::I64_EXTEND_S_I32 => convert(state, ValType::I32, ValType::I64, ConvertMode::ExtendS)?,
        op_::I64_EXTEND_U_I32 => convert(state, ValType::I32, ValType::I64, ConvertMode::ExtendU)?,
        op_::I64_TRUNC_S_F32 => trunc(state, ValType::F32, ValType::I64, true)?,
        op_::I64_TRUNC_U_F32 => trunc(state, ValType::F32, ValType::I64, false)?,
        op_::I64_TRUNC_S_F64 => trunc(state, ValType::F64, ValType::I64, true)?,
        op_::I64_TRUNC_U_F64 => trunc(state, ValType::F64, ValType::I64, false)?,
        op_::F32_CONVERT_S_I32 => {
            convert(state, ValType::I32, ValType::F32, ConvertMode::ConvertS)?
        }
        op_::F32_CONVERT_U_I32 => {
            convert(state, ValType::I32, ValType::F32, ConvertMode::ConvertU)?
        }
        op_::F32_CONVERT_S_I64 => {
            convert(state, ValType::I64, ValType::F32, ConvertMode::ConvertS)?
        }
        op_::F32_CONVERT_U_I64 => {
            convert(state, ValType::I64, ValType::F32, ConvertMode::ConvertU)?
        }
        op_::F32_DEMOTE_F64 => convert(state, ValType::F64, ValType::F32, ConvertMode::Demote)?,
        op_::F64_CONVERT_S_I32 => {
            convert(state, ValType::I32, ValType::F64, ConvertMode::ConvertS)?
        }
        op_::F64_CONVERT_U_I32 => {
            convert(state, ValType::I32, ValType::F64, ConvertMode::ConvertU)?
        }
        op_::F64_CONVERT_S_I64 => {
            convert(state, ValType::I64, ValType::F64, ConvertMode::ConvertS)?
        }
        op_::F64_CONVERT_U_I64 => {
            convert(state, ValType::I64, ValType::F64, ConvertMode::ConvertU)?
        }
        op_::F64_PROMOTE_F32 => convert(state, ValType::F32, ValType::F64, ConvertMode::Promote)?,
        op_::I32_REINTERPRET_F32 => {
            convert(state, ValType::F32, ValType::I32, ConvertMode::Reinterpret)?
        }
        op_::I64_REINTERPRET_F64 => {
            convert(state, ValType::F64, ValType::I64, ConvertMode::Reinterpret)?
        }
        op_::F32_REINTERPRET_I32 => {
            convert(state, ValType::I32, ValType::F32, ConvertMode::Reinterpret)?
        }
        op_::F64_REINTERPRET_I64 => {
            convert(state, ValType::I64, ValType::F64, ConvertMode::Reinterpret)?
        }

        other => {
            return Err(CompileError::new(
                CompileErrorKind::UnknownOpcode(other),
                state.cur_offset,
            ))
        }
    }
    Ok(())
}

/// `else`: check the true branch produced its value, stash its statements
/// and restart translation on an empty operand stack for the false branch.
fn translate_else(state: &mut FuncTranslationState) -> Result<()> {
    let offset = state.cur_offset;
    if !matches!(
        state.frame_ref().kind,
        FrameKind::IfElse {
            then_stmts: None,
            ..
        }
    ) {
        return Err(CompileError::new(CompileErrorKind::ElseWithoutIf, offset));
    }

    state.flush_traps();
    if let Some(ty) = state.frame_ref().result_ty {
        let value = state.pop_operand(Some(ty))?;
        if !state.in_dead_code() {
            let temp = state
                .frame_ref()
                .result_temp
                .expect("live if-with-result always has a result temp");
            state.emit(Stmt::SetTemp { temp, value });
        }
    }
    if !state.frame_ref().stack.is_empty() {
        return Err(CompileError::new(CompileErrorKind::ExtraOperands, offset));
    }

    let frame = state.frame();
    let stmts = core::mem::take(&mut frame.stmts);
    match &mut frame.kind {
        FrameKind::IfElse { then_stmts, .. } => *then_stmts = Some(stmts),
        _ => unreachable!("checked above"),
    }
    frame.polymorphic = false;
    frame.stack.clear();
    frame.pending_traps.clear();
    Ok(())
}

/// `end`: pop the frame, materialize its result, and splice or wrap its
/// statements into the parent.
fn translate_end(state: &mut FuncTranslationState) -> Result<()> {
    let offset = state.cur_offset;
    state.flush_traps();

    if state.frames_len() == 1 {
        // Function end: fall-through returns the result value.
        if let Some(ty) = state.frame_ref().result_ty {
            let value = state.pop_operand(Some(ty))?;
            state.emit(Stmt::Branch {
                target: BranchTarget::Return,
                value: Some(value),
            });
        }
        if !state.frame_ref().stack.is_empty() {
            return Err(CompileError::new(CompileErrorKind::ExtraOperands, offset));
        }
        let frame = state.pop_function_frame()?;
        state.finished_body = Some(frame.stmts);
        return Ok(());
    }

    // `if` with a result type requires both arms.
    if let FrameKind::IfElse {
        then_stmts: None, ..
    } = state.frame_ref().kind
    {
        if state.frame_ref().result_ty.is_some() {
            return Err(CompileError::new(CompileErrorKind::MissingElse, offset));
        }
    }

    // Pop the fall-through value and decide how the parent will see it.
    let mut fall_through = None;
    if let Some(ty) = state.frame_ref().result_ty {
        let value = state.pop_operand(Some(ty))?;
        if !state.in_dead_code() {
            let (is_ifelse, is_block, branched_to, result_temp) = {
                let frame = state.frame_ref();
                (
                    matches!(frame.kind, FrameKind::IfElse { .. }),
                    matches!(frame.kind, FrameKind::Block),
                    frame.branched_to,
                    frame.result_temp,
                )
            };
            // An `if` joins both arms through its result temp, and a
            // branched-to block joins fall-through with its branches the
            // same way. Anything else hands the expression up as-is.
            if is_ifelse || (is_block && branched_to) {
                let temp = result_temp.expect("joining frames always have a result temp");
                state.emit(Stmt::SetTemp { temp, value });
            } else {
                fall_through = Some(value);
            }
        }
    }
    if !state.frame_ref().stack.is_empty() {
        return Err(CompileError::new(CompileErrorKind::ExtraOperands, offset));
    }

    let frame = state.pop_frame()?;
    let is_ifelse = matches!(frame.kind, FrameKind::IfElse { .. });
    let ControlFrame {
        kind,
        result_ty,
        stmts,
        dead,
        branched_to,
        label,
        result_temp,
        ..
    } = frame;

    // Splice the frame's statements into the parent. This bypasses
    // `emit`: temps read here were already scanned when first emitted.
    if !dead {
        let parent = state.frame();
        match kind {
            FrameKind::Block | FrameKind::FunctionBody => {
                if branched_to {
                    parent.stmts.push(Stmt::Block { label, body: stmts });
                } else {
                    parent.stmts.extend(stmts);
                }
            }
            FrameKind::Loop => {
                if branched_to {
                    parent.stmts.push(Stmt::Loop { label, body: stmts });
                } else {
                    parent.stmts.extend(stmts);
                }
            }
            FrameKind::IfElse {
                condition,
                then_stmts,
            } => {
                let (then_body, else_body) = match then_stmts {
                    Some(then_body) => (then_body, stmts),
                    None => (stmts, Vec::new()),
                };
                parent.stmts.push(Stmt::IfElse {
                    condition,
                    label: branched_to.then_some(label),
                    then_body,
                    else_body,
                });
            }
        }
    }

    // Hand the result to the parent.
    if result_ty.is_some() {
        let result = if dead {
            Expr::Undefined
        } else if let (true, Some(temp)) = (is_ifelse || branched_to, result_temp) {
            Expr::GetTemp(temp)
        } else {
            // With no joining temp the value arrives by fall-through, or
            // this end was unreachable and the value never exists.
            fall_through.unwrap_or(Expr::Undefined)
        };
        state.push_operand(result);
    }
    Ok(())
}

fn translate_br_table(reader: &mut Reader<'_>, state: &mut FuncTranslationState) -> Result<()> {
    let offset = state.cur_offset;
    let count = reader.read_var_u32()?;
    let mut depths = Vec::with_capacity(count.min(1024) as usize + 1);
    for _ in 0..count {
        depths.push(reader.read_var_u32()?);
    }
    let default_depth = reader.read_var_u32()?;

    let key = state.pop_operand(Some(ValType::I32))?;

    let (default, default_ty) = state.resolve_branch(default_depth)?;
    let mut targets = Vec::with_capacity(depths.len());
    for depth in depths {
        let (target, ty) = state.resolve_branch(depth)?;
        if ty != default_ty {
            return Err(CompileError::new(
                CompileErrorKind::TypeMismatch {
                    expected: default_ty.map_or("nothing", ValType::name),
                    found: ty.map_or("nothing", ValType::name),
                },
                offset,
            ));
        }
        targets.push(target);
    }

    let value = match default_ty {
        Some(ty) => {
            let value = state.pop_operand(Some(ty))?;
            // Evaluated once, assigned per arm.
            Some(state.spill_operand(value))
        }
        None => None,
    };

    state.emit(Stmt::BranchTable {
        key,
        targets,
        default,
        value,
    });
    state.mark_unreachable();
    Ok(())
}

fn pop_call_args(
    state: &mut FuncTranslationState,
    type_index: TypeIndex,
    env: &FuncEnvironment<'_, '_>,
) -> Result<Vec<Expr>> {
    let params = &env.module.types[type_index].params;
    let mut args = Vec::with_capacity(params.len());
    // Rightmost argument is on top of the stack.
    for ty in params.iter().rev() {
        args.push(state.pop_operand(Some(*ty))?);
    }
    args.reverse();
    Ok(args)
}

/// Emit a call. The remaining stack spills to temporaries first: the callee
/// may observe side effects through memory or globals. A result always
/// lands in a fresh temp so later statements cannot reorder it.
fn emit_call(state: &mut FuncTranslationState, call: Expr, result_ty: Option<ValType>) {
    state.spill_for_call();
    match result_ty {
        Some(ty) => {
            if state.in_dead_code() {
                state.push_operand(Expr::Undefined);
            } else {
                let temp = state.acquire_temp(ty);
                state.emit(Stmt::SetTemp { temp, value: call });
                state.push_operand(Expr::GetTemp(temp));
            }
        }
        None => state.emit(Stmt::Drop(call)),
    }
}

fn check_memory_op(
    reader: &mut Reader<'_>,
    state: &mut FuncTranslationState,
    env: &FuncEnvironment<'_, '_>,
) -> Result<()> {
    let offset = state.cur_offset;
    if reader.read_byte()? != 0 {
        return Err(CompileError::new(
            CompileErrorKind::BadReservedByte,
            offset,
        ));
    }
    if env.module.memories.is_empty() {
        return Err(CompileError::new(
            CompileErrorKind::UnknownMemory(0),
            offset,
        ));
    }
    Ok(())
}

fn read_mem_immediates(
    reader: &mut Reader<'_>,
    state: &FuncTranslationState,
    env: &FuncEnvironment<'_, '_>,
    width: u8,
) -> Result<(u32, u32)> {
    let offset = state.cur_offset;
    if env.module.memories.is_empty() {
        return Err(CompileError::new(
            CompileErrorKind::UnknownMemory(0),
            offset,
        ));
    }
    let align = reader.read_var_u32()?;
    let mem_offset = reader.read_var_u32()?;
    if align > width.trailing_zeros() {
        return Err(CompileError::new(
            CompileErrorKind::BadAlignment(align),
            offset,
        ));
    }
    Ok((align, mem_offset))
}

fn translate_load(
    reader: &mut Reader<'_>,
    state: &mut FuncTranslationState,
    env: &FuncEnvironment<'_, '_>,
    ty: ValType,
    width: u8,
    signed: bool,
) -> Result<()> {
    let (align, offset) = read_mem_immediates(reader, state, env, width)?;
    let addr = state.pop_operand(Some(ValType::I32))?;
    // The address feeds both the bounds check and the access.
    let addr = state.spill_operand(addr);
    state.append_trap(TrapCondition::MemoryBounds {
        addr: addr.clone(),
        offset_plus_size: u64::from(offset) + u64::from(width),
    });
    state.push_operand(Expr::Load {
        ty,
        width,
        signed,
        offset,
        align,
        addr: Box::new(addr),
    });
    Ok(())
}

fn translate_store(
    reader: &mut Reader<'_>,
    state: &mut FuncTranslationState,
    env: &FuncEnvironment<'_, '_>,
    ty: ValType,
    width: u8,
) -> Result<()> {
    let (align, offset) = read_mem_immediates(reader, state, env, width)?;
    let value = state.pop_operand(Some(ty))?;
    let addr = state.pop_operand(Some(ValType::I32))?;
    let addr = state.spill_operand(addr);
    // A full i64 store writes both halves, so the value is read twice.
    let value = if ty == ValType::I64 && width == 8 {
        state.spill_operand(value)
    } else {
        value
    };
    state.spill_for_store();
    state.append_trap(TrapCondition::MemoryBounds {
        addr: addr.clone(),
        offset_plus_size: u64::from(offset) + u64::from(width),
    });
    state.emit(Stmt::Store {
        ty,
        width,
        offset,
        align,
        addr,
        value,
    });
    Ok(())
}

fn int_unary(state: &mut FuncTranslationState, ty: ValType, op: IntUnOp) -> Result<()> {
    let value = state.pop_operand(Some(ty))?;
    state.push_operand(Expr::IntUnary {
        ty,
        op,
        value: Box::new(value),
    });
    Ok(())
}

fn int_eqz(state: &mut FuncTranslationState, ty: ValType) -> Result<()> {
    int_unary(state, ty, IntUnOp::Eqz)
}

fn int_binary(state: &mut FuncTranslationState, ty: ValType, op: IntBinOp) -> Result<()> {
    let rhs = state.pop_operand(Some(ty))?;
    let lhs = state.pop_operand(Some(ty))?;
    state.push_operand(Expr::IntBinary {
        ty,
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    });
    Ok(())
}

/// Division and remainder carry their trap guards: `rhs == 0` always, and
/// `lhs == MIN && rhs == -1` for signed division.
fn int_division(state: &mut FuncTranslationState, ty: ValType, op: IntBinOp) -> Result<()> {
    let rhs = state.pop_operand(Some(ty))?;
    let lhs = state.pop_operand(Some(ty))?;

    let rhs = state.spill_operand(rhs);
    let lhs = if op == IntBinOp::DivS {
        state.spill_operand(lhs)
    } else {
        lhs
    };

    let (zero, minus_one, min) = match ty {
        ValType::I32 => (
            Literal::I32(0),
            Literal::I32(-1),
            Literal::I32(i32::MIN),
        ),
        ValType::I64 => (
            Literal::I64(0),
            Literal::I64(-1),
            Literal::I64(i64::MIN),
        ),
        _ => unreachable!("division is integer-only"),
    };

    state.append_trap_if(
        compare(ty, CmpOp::Eq, rhs.clone(), Expr::Const(zero)),
        Trap::IntegerDivisionByZero,
    );
    if op == IntBinOp::DivS {
        let overflow = Expr::IntBinary {
            ty: ValType::I32,
            op: IntBinOp::And,
            lhs: Box::new(compare(ty, CmpOp::Eq, lhs.clone(), Expr::Const(min))),
            rhs: Box::new(compare(ty, CmpOp::Eq, rhs.clone(), Expr::Const(minus_one))),
        };
        state.append_trap_if(overflow, Trap::IntegerOverflow);
    }

    state.push_operand(Expr::IntBinary {
        ty,
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    });
    Ok(())
}

fn relop(state: &mut FuncTranslationState, ty: ValType, op: CmpOp) -> Result<()> {
    let rhs = state.pop_operand(Some(ty))?;
    let lhs = state.pop_operand(Some(ty))?;
    state.push_operand(compare(ty, op, lhs, rhs));
    Ok(())
}

fn compare(operand_ty: ValType, op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Compare {
        operand_ty,
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn float_unary(state: &mut FuncTranslationState, ty: ValType, op: FloatUnOp) -> Result<()> {
    let value = state.pop_operand(Some(ty))?;
    state.push_operand(Expr::FloatUnary {
        ty,
        op,
        value: Box::new(value),
    });
    Ok(())
}

fn float_binary(state: &mut FuncTranslationState, ty: ValType, op: FloatBinOp) -> Result<()> {
    let rhs = state.pop_operand(Some(ty))?;
    let lhs = state.pop_operand(Some(ty))?;
    state.push_operand(Expr::FloatBinary {
        ty,
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    });
    Ok(())
}

fn convert(
    state: &mut FuncTranslationState,
    from: ValType,
    to: ValType,
    mode: ConvertMode,
) -> Result<()> {
    let value = state.pop_operand(Some(from))?;
    state.push_operand(Expr::Convert {
        from,
        to,
        mode,
        value: Box::new(value),
    });
    Ok(())
}

/// Checked float-to-integer truncation. Three guards precede the
/// conversion: above range, below range, and NaN. The range constants are
/// the exact IEEE-754 boundaries of the target width in double precision,
/// where all comparisons take place.
fn trunc(
    state: &mut FuncTranslationState,
    from: ValType,
    to: ValType,
    signed: bool,
) -> Result<()> {
    let value = state.pop_operand(Some(from))?;
    let value = state.spill_operand(value);

    // Comparisons happen in f64; promoting an f32 operand is exact.
    let as_f64 = |value: Expr| -> Expr {
        if from == ValType::F32 {
            Expr::Convert {
                from: ValType::F32,
                to: ValType::F64,
                mode: ConvertMode::Promote,
                value: Box::new(value),
            }
        } else {
            value
        }
    };
    let bound = |bits: f64| Expr::Const(Literal::F64(bits.to_bits()));

    // Trap iff the truncated value cannot be represented: `x >= upper` and
    // either `x <= lower` or, for i64 signed, `x < MIN` (MIN itself is a
    // valid input and exactly representable).
    let (upper, lower, lower_op) = match (to, signed) {
        (ValType::I32, true) => (2_147_483_648.0, -2_147_483_649.0, CmpOp::Le),
        (ValType::I32, false) => (4_294_967_296.0, -1.0, CmpOp::Le),
        (ValType::I64, true) => (
            9_223_372_036_854_775_808.0,
            -9_223_372_036_854_775_808.0,
            CmpOp::Lt,
        ),
        (ValType::I64, false) => (18_446_744_073_709_551_616.0, -1.0, CmpOp::Le),
        _ => unreachable!("truncation targets are integers"),
    };

    state.append_trap_if(
        compare(ValType::F64, CmpOp::Ge, as_f64(value.clone()), bound(upper)),
        Trap::IntegerOverflow,
    );
    state.append_trap_if(
        compare(ValType::F64, lower_op, as_f64(value.clone()), bound(lower)),
        Trap::IntegerOverflow,
    );
    state.append_trap_if(
        compare(from, CmpOp::Ne, value.clone(), value.clone()),
        Trap::BadConversionToInteger,
    );

    state.push_operand(Expr::Convert {
        from,
        to,
        mode: if signed {
            ConvertMode::TruncS
        } else {
            ConvertMode::TruncU
        },
        value: Box::new(value),
    });
    Ok(())
}
