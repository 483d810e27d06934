use crate::errors::{CompileError, CompileErrorKind};
use crate::indices::{GlobalIndex, LocalIndex};
use crate::translate::ir::{BranchTarget, Expr, Label, Stmt, TempVar, TrapCondition};
use crate::translate::types::ValType;
use crate::traps::Trap;
use crate::Result;
use alloc::vec::Vec;
use smallvec::SmallVec;

/// What kind of control structure a frame represents.
#[derive(Debug)]
pub enum FrameKind {
    FunctionBody,
    Block,
    Loop,
    IfElse {
        condition: Expr,
        /// The completed true branch, moved out of `stmts` when `else` is
        /// reached. `None` until then.
        then_stmts: Option<Vec<Stmt>>,
    },
}

/// One entry of the control-flow stack.
///
/// Each frame owns a private operand stack; no operator may reach into the
/// frames below. `polymorphic` relaxes type checks and underflow after a
/// `br`/`return`/`unreachable` in this frame; `dead` marks a frame opened
/// inside already-unreachable code, whose statements are discarded wholesale.
#[derive(Debug)]
pub struct ControlFrame {
    pub kind: FrameKind,
    pub result_ty: Option<ValType>,
    /// What a branch to this frame carries: `None` for loops (a branch
    /// re-enters the loop with nothing), `result_ty` for everything else.
    pub branch_result_ty: Option<ValType>,
    pub stack: Vec<Expr>,
    pub stmts: Vec<Stmt>,
    pub pending_traps: Vec<TrapCondition>,
    pub dead: bool,
    pub polymorphic: bool,
    /// Whether any emitted branch targets this frame; decides if the
    /// lowered block needs a label and a result tempvar.
    pub branched_to: bool,
    pub label: Label,
    pub result_temp: Option<TempVar>,
}

impl ControlFrame {
    pub fn is_loop(&self) -> bool {
        matches!(self.kind, FrameKind::Loop)
    }
}

/// Per-function, per-type spill-slot pool with high-water marks.
///
/// Slots are handed out from two stacks keyed by value type; a released
/// slot is reused by the next same-typed spill in the same function.
#[derive(Debug, Default)]
pub struct TempPool {
    free: [Vec<u32>; 4],
    next: [u32; 4],
}

impl TempPool {
    pub fn acquire(&mut self, ty: ValType) -> TempVar {
        let slot = ty.index();
        let index = self.free[slot].pop().unwrap_or_else(|| {
            let index = self.next[slot];
            self.next[slot] += 1;
            index
        });
        TempVar { ty, index }
    }

    pub fn release(&mut self, temp: TempVar) {
        self.free[temp.ty.index()].push(temp.index);
    }

    /// How many slots of each type the function needs, indexed by
    /// [`ValType::index`].
    pub fn maxima(&self) -> [u32; 4] {
        self.next
    }
}

/// The mutable state threaded through per-opcode translation: the
/// control-flow stack, the spill pool, and the offset of the opcode being
/// translated (for error reporting).
pub struct FuncTranslationState {
    frames: Vec<ControlFrame>,
    pool: TempPool,
    next_label: u32,
    pub cur_offset: usize,
    /// The function body's statements, set when the final `end` pops the
    /// function-body frame.
    pub finished_body: Option<Vec<Stmt>>,
}

impl FuncTranslationState {
    pub fn new(result_ty: Option<ValType>) -> Self {
        let mut state = Self {
            frames: Vec::with_capacity(8),
            pool: TempPool::default(),
            next_label: 1,
            cur_offset: 0,
            finished_body: None,
        };
        state.frames.push(ControlFrame {
            kind: FrameKind::FunctionBody,
            result_ty,
            branch_result_ty: result_ty,
            stack: Vec::new(),
            stmts: Vec::new(),
            pending_traps: Vec::new(),
            dead: false,
            polymorphic: false,
            branched_to: false,
            label: Label(0),
            result_temp: None,
        });
        state
    }

    pub fn frames_len(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&mut self) -> &mut ControlFrame {
        self.frames.last_mut().expect("control stack is never empty")
    }

    pub fn frame_ref(&self) -> &ControlFrame {
        self.frames.last().expect("control stack is never empty")
    }

    pub fn temp_maxima(&self) -> [u32; 4] {
        self.pool.maxima()
    }

    /// The function's declared result type, for `return`.
    pub fn function_result_ty(&self) -> Option<ValType> {
        self.frames[0].result_ty
    }

    fn err(&self, kind: CompileErrorKind) -> CompileError {
        CompileError::new(kind, self.cur_offset)
    }

    /// Is code at the current point statically unreachable (either the
    /// frame was opened in dead code or a branch already left it)?
    pub fn in_dead_code(&self) -> bool {
        let frame = self.frame_ref();
        frame.dead || frame.polymorphic
    }

    // ------------------------------------------------------ operand stack

    pub fn push_operand(&mut self, expr: Expr) {
        self.frame().stack.push(expr);
    }

    /// Pop an operand, `expect`ing a type (or any type when `None`).
    /// Underflow is tolerated only in a polymorphic frame, where the
    /// placeholder [`Expr::Undefined`] matches every request.
    pub fn pop_operand(&mut self, expect: Option<ValType>) -> Result<Expr> {
        let offset = self.cur_offset;
        let frame = self.frames.last_mut().expect("control stack is never empty");
        let polymorphic = frame.polymorphic;
        match frame.stack.pop() {
            Some(expr) => {
                if let (Some(want), Some(got)) = (expect, expr.ty()) {
                    if want != got {
                        return Err(CompileError::new(
                            CompileErrorKind::TypeMismatch {
                                expected: want.name(),
                                found: got.name(),
                            },
                            offset,
                        ));
                    }
                }
                Ok(expr)
            }
            None if polymorphic => Ok(Expr::Undefined),
            None => Err(CompileError::new(CompileErrorKind::StackUnderflow, offset)),
        }
    }

    // ------------------------------------------------------ trap pooling

    /// Queue a runtime guard. Guards accumulate per frame and are
    /// materialized as one `TrapConditions` statement at the next point a
    /// side effect becomes observable.
    pub fn append_trap(&mut self, condition: TrapCondition) {
        if self.in_dead_code() {
            return;
        }
        self.frame().pending_traps.push(condition);
    }

    /// Shorthand for the common conditional guard.
    pub fn append_trap_if(&mut self, condition: Expr, trap: Trap) {
        self.append_trap(TrapCondition::If { condition, trap });
    }

    pub fn flush_traps(&mut self) {
        if self.in_dead_code() {
            return;
        }
        let frame = self.frame();
        if frame.pending_traps.is_empty() {
            return;
        }
        let conditions = core::mem::take(&mut frame.pending_traps);
        frame.stmts.push(Stmt::TrapConditions(conditions));
    }

    // ------------------------------------------------------ statements

    /// Append a statement to the current frame. Pending trap guards flush
    /// first so they execute before the statement's side effects; spill
    /// slots whose last read is inside `stmt` return to the pool.
    pub fn emit(&mut self, stmt: Stmt) {
        if self.in_dead_code() {
            return;
        }
        self.flush_traps();
        let mut reads = SmallVec::<[TempVar; 8]>::new();
        collect_stmt_temp_reads(&stmt, &mut reads);
        self.frame().stmts.push(stmt);
        self.release_unreferenced(&reads);
    }

    fn release_unreferenced(&mut self, candidates: &[TempVar]) {
        for &temp in candidates {
            if !self.is_temp_live(temp) {
                self.pool.release(temp);
            }
        }
    }

    /// A temp is still live while any frame's stack, pending guard,
    /// result slot or unfinished `if` condition can read it.
    fn is_temp_live(&self, temp: TempVar) -> bool {
        self.frames.iter().any(|frame| {
            frame.result_temp == Some(temp)
                || frame.stack.iter().any(|e| expr_reads_temp(e, temp))
                || frame
                    .pending_traps
                    .iter()
                    .any(|t| trap_condition_reads_temp(t, temp))
                || match &frame.kind {
                    FrameKind::IfElse { condition, .. } => expr_reads_temp(condition, temp),
                    _ => false,
                }
        })
    }

    // ------------------------------------------------------ spilling

    pub fn acquire_temp(&mut self, ty: ValType) -> TempVar {
        self.pool.acquire(ty)
    }

    /// Force `expr` into a trivially re-readable form: anything that is not
    /// already a variable read or constant is assigned to a fresh spill
    /// slot, and the slot read replaces it.
    pub fn spill_operand(&mut self, expr: Expr) -> Expr {
        // Anything without a known type came out of unreachable code and
        // can never be evaluated; it stays as-is.
        if expr.is_trivial() || expr.ty().is_none() || self.in_dead_code() {
            return expr;
        }
        let ty = expr.ty().expect("checked above");
        let temp = self.acquire_temp(ty);
        self.emit(Stmt::SetTemp { temp, value: expr });
        Expr::GetTemp(temp)
    }

    /// Spill every stack entry of the current frame that `keep` rejects.
    ///
    /// The stack is rebuilt before any spill statement is emitted so the
    /// release scan never sees a half-restored stack.
    fn spill_stack_where(&mut self, keep: impl Fn(&Expr) -> bool) {
        if self.in_dead_code() {
            return;
        }
        let stack = core::mem::take(&mut self.frame().stack);
        let mut rebuilt = Vec::with_capacity(stack.len());
        let mut spills = Vec::new();
        for expr in stack {
            if keep(&expr) || expr.ty().is_none() {
                rebuilt.push(expr);
            } else {
                let ty = expr.ty().expect("checked above");
                let temp = self.acquire_temp(ty);
                spills.push(Stmt::SetTemp { temp, value: expr });
                rebuilt.push(Expr::GetTemp(temp));
            }
        }
        self.frame().stack = rebuilt;
        for spill in spills {
            self.emit(spill);
        }
    }

    /// Calls and `grow_memory` can write globals and memory: only
    /// constants, locals and temps stay un-spilled across them.
    pub fn spill_for_call(&mut self) {
        self.spill_stack_where(|e| {
            matches!(e, Expr::Const(_) | Expr::GetLocal { .. } | Expr::GetTemp(_))
        });
    }

    /// Stores leave variables alone; composite entries still spill since
    /// they may contain loads of the bytes being overwritten.
    pub fn spill_for_store(&mut self) {
        self.spill_stack_where(Expr::is_trivial);
    }

    pub fn spill_for_local_write(&mut self, index: LocalIndex) {
        self.spill_stack_where(move |e| match e {
            Expr::GetLocal { index: i, .. } => *i != index,
            e => e.is_trivial(),
        });
    }

    pub fn spill_for_global_write(&mut self, index: GlobalIndex) {
        self.spill_stack_where(move |e| match e {
            Expr::GetGlobal { index: i, .. } => *i != index,
            e => e.is_trivial(),
        });
    }

    // ------------------------------------------------------ control frames

    /// Open a nested frame. The parent's stack is spilled down to constants
    /// and temps first, so nothing the child does can invalidate it, and
    /// the parent's pending guards flush so they run before the child.
    pub fn push_frame(&mut self, kind: FrameKind, result_ty: Option<ValType>) {
        self.flush_traps();
        self.spill_stack_where(|e| matches!(e, Expr::Const(_) | Expr::GetTemp(_)));

        let parent_dead = self.in_dead_code();
        let branch_result_ty = match kind {
            FrameKind::Loop => None,
            _ => result_ty,
        };
        // An `if` that produces a value always materializes it through a
        // tempvar: both arms assign it and the join point reads it.
        let result_temp = match (&kind, result_ty, parent_dead) {
            (FrameKind::IfElse { .. }, Some(ty), false) => Some(self.pool.acquire(ty)),
            _ => None,
        };
        let label = Label(self.next_label);
        self.next_label += 1;
        self.frames.push(ControlFrame {
            kind,
            result_ty,
            branch_result_ty,
            stack: Vec::new(),
            stmts: Vec::new(),
            pending_traps: Vec::new(),
            dead: parent_dead,
            polymorphic: false,
            branched_to: false,
            label,
            result_temp,
        });
    }

    pub fn pop_frame(&mut self) -> Result<ControlFrame> {
        if self.frames.len() == 1 {
            return Err(self.err(CompileErrorKind::ControlStackUnderflow));
        }
        Ok(self.frames.pop().expect("length checked above"))
    }

    /// The function-body frame, popped by the final `end`.
    pub fn pop_function_frame(&mut self) -> Result<ControlFrame> {
        debug_assert_eq!(self.frames.len(), 1);
        Ok(self.frames.pop().expect("control stack is never empty"))
    }

    /// Resolve a relative branch depth into a target, marking the frame as
    /// branched-to and materializing its result tempvar when the branch
    /// carries a value. Frames are not marked from dead code: unreachable
    /// branches must not force labels onto live blocks.
    pub fn resolve_branch(&mut self, depth: u32) -> Result<(BranchTarget, Option<ValType>)> {
        let index = (self.frames.len() - 1)
            .checked_sub(depth as usize)
            .ok_or_else(|| self.err(CompileErrorKind::BadBranchDepth(depth)))?;
        let live = !self.in_dead_code();
        let result_ty = self.frames[index].branch_result_ty;
        if index == 0 {
            return Ok((BranchTarget::Return, result_ty));
        }
        if live {
            self.frames[index].branched_to = true;
            if !self.frames[index].is_loop()
                && result_ty.is_some()
                && self.frames[index].result_temp.is_none()
            {
                let temp = self.pool.acquire(result_ty.expect("checked above"));
                self.frames[index].result_temp = Some(temp);
            }
        }
        let frame = &self.frames[index];
        let target = if frame.is_loop() {
            BranchTarget::Continue(frame.label)
        } else {
            BranchTarget::Break {
                label: frame.label,
                result_temp: frame.result_temp,
            }
        };
        Ok((target, result_ty))
    }

    /// Mark the current frame dead after a `br`/`return`/`unreachable`:
    /// the operand stack is discarded and type checks relax until the
    /// enclosing `end` or `else`.
    pub fn mark_unreachable(&mut self) {
        let frame = self.frame();
        frame.polymorphic = true;
        frame.stack.clear();
        frame.pending_traps.clear();
    }
}

fn trap_condition_reads_temp(condition: &TrapCondition, temp: TempVar) -> bool {
    match condition {
        TrapCondition::If { condition, .. } => expr_reads_temp(condition, temp),
        TrapCondition::MemoryBounds { addr, .. } => expr_reads_temp(addr, temp),
    }
}

fn expr_reads_temp(expr: &Expr, temp: TempVar) -> bool {
    let mut found = false;
    walk_expr(expr, &mut |e| {
        if let Expr::GetTemp(t) = e {
            if *t == temp {
                found = true;
            }
        }
    });
    found
}

fn walk_expr(expr: &Expr, visit: &mut impl FnMut(&Expr)) {
    visit(expr);
    match expr {
        Expr::IntUnary { value, .. }
        | Expr::FloatUnary { value, .. }
        | Expr::Convert { value, .. }
        | Expr::GrowMemory(value) => walk_expr(value, visit),
        Expr::IntBinary { lhs, rhs, .. }
        | Expr::FloatBinary { lhs, rhs, .. }
        | Expr::Compare { lhs, rhs, .. } => {
            walk_expr(lhs, visit);
            walk_expr(rhs, visit);
        }
        Expr::Load { addr, .. } => walk_expr(addr, visit),
        Expr::Call { args, .. } => {
            for arg in args {
                walk_expr(arg, visit);
            }
        }
        Expr::CallIndirect { index, args, .. } => {
            walk_expr(index, visit);
            for arg in args {
                walk_expr(arg, visit);
            }
        }
        Expr::Select {
            condition,
            if_true,
            if_false,
        } => {
            walk_expr(condition, visit);
            walk_expr(if_true, visit);
            walk_expr(if_false, visit);
        }
        Expr::Const(_)
        | Expr::GetLocal { .. }
        | Expr::GetGlobal { .. }
        | Expr::GetTemp(_)
        | Expr::CurrentMemory
        | Expr::Undefined => {}
    }
}

fn collect_expr_temp_reads(expr: &Expr, out: &mut SmallVec<[TempVar; 8]>) {
    walk_expr(expr, &mut |e| {
        if let Expr::GetTemp(temp) = e {
            if !out.contains(temp) {
                out.push(*temp);
            }
        }
    });
}

fn collect_stmt_temp_reads(stmt: &Stmt, out: &mut SmallVec<[TempVar; 8]>) {
    match stmt {
        Stmt::Drop(expr) => collect_expr_temp_reads(expr, out),
        Stmt::SetLocal { value, .. }
        | Stmt::SetGlobal { value, .. }
        | Stmt::SetTemp { value, .. } => collect_expr_temp_reads(value, out),
        Stmt::Store { addr, value, .. } => {
            collect_expr_temp_reads(addr, out);
            collect_expr_temp_reads(value, out);
        }
        Stmt::TrapConditions(conditions) => {
            for condition in conditions {
                match condition {
                    TrapCondition::If { condition, .. } => collect_expr_temp_reads(condition, out),
                    TrapCondition::MemoryBounds { addr, .. } => collect_expr_temp_reads(addr, out),
                }
            }
        }
        Stmt::Branch { value, .. } => {
            if let Some(value) = value {
                collect_expr_temp_reads(value, out);
            }
        }
        Stmt::BranchIf {
            condition, value, ..
        } => {
            collect_expr_temp_reads(condition, out);
            if let Some(value) = value {
                collect_expr_temp_reads(value, out);
            }
        }
        Stmt::BranchTable { key, value, .. } => {
            collect_expr_temp_reads(key, out);
            if let Some(value) = value {
                collect_expr_temp_reads(value, out);
            }
        }
        Stmt::Unreachable => {}
        Stmt::Block { body, .. } | Stmt::Loop { body, .. } => {
            for stmt in body {
                collect_stmt_temp_reads(stmt, out);
            }
        }
        Stmt::IfElse {
            condition,
            then_body,
            else_body,
            ..
        } => {
            collect_expr_temp_reads(condition, out);
            for stmt in then_body.iter().chain(else_body) {
                collect_stmt_temp_reads(stmt, out);
            }
        }
    }
}
