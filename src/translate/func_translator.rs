use crate::errors::{CompileError, CompileErrorKind};
use crate::indices::{DefinedFuncIndex, FuncIndex, TypeIndex};
use crate::reader::Reader;
use crate::translate::code_translator::{translate_operator, FuncEnvironment};
use crate::translate::state::FuncTranslationState;
use crate::translate::types::{read_val_type, ValType};
use crate::translate::{FunctionBody, Stmt, TranslatedModule};
use crate::{Result, MAX_FUNCTION_LOCALS};
use alloc::vec::Vec;

/// The typed statement tree for one validated function, ready for lowering.
#[derive(Debug)]
pub struct FunctionIr {
    pub func_index: FuncIndex,
    pub type_index: TypeIndex,
    /// Declared locals, flattened from their `(count, type)` runs.
    /// Parameters are not included.
    pub locals: Vec<ValType>,
    pub body: Vec<Stmt>,
    /// Spill slots needed per value type, indexed by [`ValType::index`].
    pub temp_maxima: [u32; 4],
}

/// Validates a function body against its signature while building its IR.
///
/// WebAssembly's structured control flow is checked with a stack of typed
/// control frames; a fresh translation state is set up per function and the
/// translator itself is reusable across all functions of a module.
#[derive(Default)]
pub struct FuncTranslator {}

impl FuncTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate_body(
        &mut self,
        module: &TranslatedModule<'_>,
        defined_index: DefinedFuncIndex,
        body: &FunctionBody<'_>,
    ) -> Result<FunctionIr> {
        let func_index = module.func_index(defined_index);
        let type_index = module.functions[func_index];
        let func_ty = &module.types[type_index];

        let mut reader = Reader::new_at(body.bytes, body.offset);
        tracing::trace!(
            "parse({} bytes, func {} {})",
            reader.bytes_remaining(),
            func_index.as_u32(),
            func_ty.sig_str(),
        );

        let locals = parse_local_decls(&mut reader, func_ty.params.len())?;
        let mut all_locals = Vec::with_capacity(func_ty.params.len() + locals.len());
        all_locals.extend_from_slice(&func_ty.params);
        all_locals.extend_from_slice(&locals);

        let env = FuncEnvironment {
            module,
            locals: &all_locals,
        };
        let mut state = FuncTranslationState::new(func_ty.result);

        loop {
            if state.finished_body.is_some() {
                break;
            }
            if reader.is_eof() {
                return Err(reader.err(CompileErrorKind::UnexpectedEof));
            }
            state.cur_offset = reader.offset();
            let op = reader.read_byte()?;
            translate_operator(op, &mut reader, &mut state, &env)?;
        }

        if !reader.is_eof() {
            return Err(reader.err(CompileErrorKind::TrailingBytes));
        }

        Ok(FunctionIr {
            func_index,
            type_index,
            locals,
            body: state.finished_body.take().expect("loop exited on Some"),
            temp_maxima: state.temp_maxima(),
        })
    }
}

/// Locals are declared as runs of `(count, type)` before the first opcode.
fn parse_local_decls(reader: &mut Reader<'_>, param_count: usize) -> Result<Vec<ValType>> {
    let mut locals = Vec::new();
    let run_count = reader.read_var_u32()?;
    let mut total = param_count as u64;
    for _ in 0..run_count {
        let offset = reader.offset();
        let count = reader.read_var_u32()?;
        let ty = read_val_type(reader)?;
        total += u64::from(count);
        if total > u64::from(MAX_FUNCTION_LOCALS) {
            return Err(CompileError::new(
                CompileErrorKind::ImplLimitExceeded,
                offset,
            ));
        }
        for _ in 0..count {
            locals.push(ty);
        }
    }
    Ok(locals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::ir::{BranchTarget, Expr, IntBinOp, Stmt};
    use crate::translate::types::FuncType;
    use alloc::vec;

    fn module_with_type(params: &[ValType], result: Option<ValType>) -> TranslatedModule<'static> {
        let mut module = TranslatedModule::default();
        let type_index = module.types.push(FuncType {
            params: params.to_vec().into_boxed_slice(),
            result,
        });
        module.functions.push(type_index);
        module
    }

    fn translate(
        module: &TranslatedModule<'_>,
        bytes: &[u8],
    ) -> Result<FunctionIr> {
        FuncTranslator::new().translate_body(
            module,
            DefinedFuncIndex::from_u32(0),
            &FunctionBody { offset: 0, bytes },
        )
    }

    #[test]
    fn add_two_locals() {
        let module = module_with_type(&[ValType::I32], Some(ValType::I32));
        // no locals; local.get 0; local.get 0; i32.add; end
        let ir = translate(&module, &[0x00, 0x20, 0x00, 0x20, 0x00, 0x6a, 0x0b]).unwrap();
        assert_eq!(ir.body.len(), 1);
        match &ir.body[0] {
            Stmt::Branch {
                target: BranchTarget::Return,
                value: Some(Expr::IntBinary {
                    op: IntBinOp::Add, ..
                }),
            } => {}
            other => panic!("unexpected body: {other:?}"),
        }
        assert_eq!(ir.temp_maxima, [0; 4]);
    }

    #[test]
    fn empty_body_is_just_end() {
        let module = module_with_type(&[], None);
        let ir = translate(&module, &[0x00, 0x0b]).unwrap();
        assert!(ir.body.is_empty());
    }

    #[test]
    fn missing_result_value() {
        let module = module_with_type(&[], Some(ValType::I32));
        assert_eq!(
            translate(&module, &[0x00, 0x0b]).unwrap_err().kind,
            CompileErrorKind::StackUnderflow
        );
    }

    #[test]
    fn leftover_operand_is_rejected() {
        let module = module_with_type(&[], None);
        // i32.const 1; end
        assert_eq!(
            translate(&module, &[0x00, 0x41, 0x01, 0x0b]).unwrap_err().kind,
            CompileErrorKind::ExtraOperands
        );
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let module = module_with_type(&[], Some(ValType::I32));
        // i64.const 1; end (result should be i32)
        let err = translate(&module, &[0x00, 0x42, 0x01, 0x0b]).unwrap_err();
        assert_eq!(
            err.kind,
            CompileErrorKind::TypeMismatch {
                expected: "i32",
                found: "i64"
            }
        );
    }

    #[test]
    fn bytes_after_final_end() {
        let module = module_with_type(&[], None);
        let err = translate(&module, &[0x00, 0x0b, 0x01]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::TrailingBytes);
    }

    #[test]
    fn truncated_body() {
        let module = module_with_type(&[], None);
        // block with no end, then eof
        let err = translate(&module, &[0x00, 0x02, 0x40]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnexpectedEof);
    }

    #[test]
    fn if_with_result_needs_else() {
        let module = module_with_type(&[], Some(ValType::I32));
        // i32.const 1; if (result i32); i32.const 2; end; end
        let bytes = &[0x00, 0x41, 0x01, 0x04, 0x7f, 0x41, 0x02, 0x0b, 0x0b];
        assert_eq!(
            translate(&module, bytes).unwrap_err().kind,
            CompileErrorKind::MissingElse
        );
    }

    #[test]
    fn unreachable_relaxes_typing() {
        let module = module_with_type(&[], Some(ValType::I32));
        // unreachable; i64.const 1; drop; end
        let ir = translate(&module, &[0x00, 0x00, 0x42, 0x01, 0x1a, 0x0b]).unwrap();
        assert_eq!(ir.body, vec![Stmt::Unreachable]);
    }

    #[test]
    fn division_emits_guards() {
        let module = module_with_type(&[ValType::I32, ValType::I32], Some(ValType::I32));
        // local.get 0; local.get 1; i32.div_s; end
        let ir = translate(&module, &[0x00, 0x20, 0x00, 0x20, 0x01, 0x6d, 0x0b]).unwrap();
        // Guards are pooled until the fall-through return materializes them.
        assert!(matches!(&ir.body[0], Stmt::TrapConditions(guards) if guards.len() == 2));
        assert!(matches!(
            &ir.body[1],
            Stmt::Branch {
                target: BranchTarget::Return,
                value: Some(_)
            }
        ));
    }

    #[test]
    fn local_runs_resolve_types() {
        let module = module_with_type(&[ValType::F32], None);
        // locals: 2 x i32, 1 x i64; local.get 3 is the i64
        let bytes = &[
            0x02, 0x02, 0x7f, 0x01, 0x7e, // local runs
            0x20, 0x03, 0x1a, // local.get 3; drop
            0x0b,
        ];
        let ir = translate(&module, bytes).unwrap();
        assert_eq!(ir.locals, vec![ValType::I32, ValType::I32, ValType::I64]);
    }

    #[test]
    fn out_of_range_local_is_rejected() {
        let module = module_with_type(&[], None);
        let err = translate(&module, &[0x00, 0x20, 0x05, 0x1a, 0x0b]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnknownLocal(5));
    }
}
