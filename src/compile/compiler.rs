use crate::compile::runtime;
use crate::compile::{PoolConstant, TargetConfig};
use crate::translate::{
    BranchTarget, CmpOp, ConvertMode, Expr, FloatBinOp, FloatUnOp, FunctionIr, IntBinOp, IntUnOp,
    Literal, Stmt, TempVar, TranslatedModule, TrapCondition, ValType,
};
use crate::traps::Trap;
use alloc::string::String;
use alloc::vec::Vec;

/// Append formatted text to the compiler's output buffer. Writing to a
/// `String` cannot fail.
macro_rules! w {
    ($self:expr, $($arg:tt)*) => {
        let _ = core::fmt::Write::write_fmt(&mut $self.out, format_args!($($arg)*));
    };
}
pub(crate) use w;

/// Renders validated function IR into JavaScript-flavoured target text.
///
/// This stage is purely mechanical: every trap condition, spill and type
/// coercion was already decided by the validator, so the walk over each
/// statement tree appends text and nothing else.
pub(crate) struct Compiler<'a, 'wasm> {
    pub module: &'a TranslatedModule<'wasm>,
    pub config: TargetConfig,
    pub out: String,
    pub constants: Vec<PoolConstant>,
    indent: usize,
}

impl<'a, 'wasm> Compiler<'a, 'wasm> {
    pub fn new(module: &'a TranslatedModule<'wasm>, config: TargetConfig) -> Self {
        Self {
            module,
            config,
            out: String::with_capacity(4096),
            constants: Vec::new(),
            indent: 0,
        }
    }

    // ---------------------------------------------------------- plumbing

    pub fn finish(self) -> (String, Vec<PoolConstant>) {
        (self.out, self.constants)
    }

    pub fn raw(&mut self, s: &str) {
        self.out.push_str(s);
    }

    pub fn start_line(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
    }

    pub fn line(&mut self, s: &str) {
        self.start_line();
        self.out.push_str(s);
        self.out.push('\n');
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn dedent(&mut self) {
        self.indent -= 1;
    }

    fn rt(&mut self, name: &str) {
        w!(self, "{}.{}", runtime::CTX, name);
    }

    fn temp(&mut self, temp: TempVar) {
        w!(self, "{}{}", temp_prefix(temp.ty), temp.index);
    }

    fn trap_call(&mut self, trap: Trap) {
        self.rt(runtime::TRAP);
        w!(self, "(\"{}\")", trap.message());
    }

    /// Intern a float bit pattern in the constant pool.
    fn pool_index(&mut self, constant: PoolConstant) -> usize {
        if let Some(found) = self.constants.iter().position(|c| *c == constant) {
            return found;
        }
        self.constants.push(constant);
        self.constants.len() - 1
    }

    // ---------------------------------------------------------- literals

    pub fn literal(&mut self, literal: Literal) {
        match literal {
            Literal::I32(v) => {
                if v < 0 {
                    w!(self, "({v})");
                } else {
                    w!(self, "{v}");
                }
            }
            Literal::I64(v) => {
                let lo = v as i32;
                let hi = (v >> 32) as i32;
                self.rt("i64_new");
                w!(self, "({lo}, {hi})");
            }
            Literal::F32(bits) => {
                let value = f32::from_bits(bits);
                if value.is_nan() {
                    if bits == 0x7fc0_0000 {
                        self.raw("NaN");
                    } else {
                        let index = self.pool_index(PoolConstant::F32(bits));
                        w!(self, "constants[{index}]");
                    }
                } else if value.is_infinite() {
                    self.raw(if value > 0.0 { "Infinity" } else { "(-Infinity)" });
                } else {
                    w!(self, "({:?})", f64::from(value));
                }
            }
            Literal::F64(bits) => {
                let value = f64::from_bits(bits);
                if value.is_nan() {
                    if bits == 0x7ff8_0000_0000_0000 {
                        self.raw("NaN");
                    } else {
                        let index = self.pool_index(PoolConstant::F64(bits));
                        w!(self, "constants[{index}]");
                    }
                } else if value.is_infinite() {
                    self.raw(if value > 0.0 { "Infinity" } else { "(-Infinity)" });
                } else {
                    w!(self, "({:?})", value);
                }
            }
        }
    }

    // ---------------------------------------------------------- expressions

    pub fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Const(literal) => self.literal(*literal),
            Expr::GetLocal { index, .. } => {
                w!(self, "l{}", index.as_u32());
            }
            Expr::GetGlobal { index, .. } => {
                w!(self, "G{}", index.as_u32());
            }
            Expr::GetTemp(temp) => self.temp(*temp),
            Expr::IntUnary { ty, op, value } => self.int_unary(*ty, *op, value),
            Expr::IntBinary { ty, op, lhs, rhs } => self.int_binary(*ty, *op, lhs, rhs),
            Expr::FloatUnary { ty, op, value } => self.float_unary(*ty, *op, value),
            Expr::FloatBinary { ty, op, lhs, rhs } => self.float_binary(*ty, *op, lhs, rhs),
            Expr::Compare {
                operand_ty,
                op,
                lhs,
                rhs,
            } => self.compare(*operand_ty, *op, lhs, rhs),
            Expr::Load {
                ty,
                width,
                signed,
                offset,
                align,
                addr,
            } => self.load(*ty, *width, *signed, *offset, *align, addr),
            Expr::Convert {
                from,
                to,
                mode,
                value,
            } => self.convert(*from, *to, *mode, value),
            Expr::Call { type_index, index, args } => {
                let result = self.module.types[*type_index].result;
                self.coerced_call(result, |c| {
                    w!(c, "F{}", index.as_u32());
                    c.call_args(args);
                });
            }
            Expr::CallIndirect {
                type_index,
                index,
                args,
            } => {
                let sig = self.module.types[*type_index].sig_str();
                let result = self.module.types[*type_index].result;
                self.coerced_call(result, |c| {
                    c.raw("tblCheck(");
                    c.expr(index);
                    w!(c, ", \"{sig}\")");
                    c.call_args(args);
                });
            }
            Expr::Select {
                condition,
                if_true,
                if_false,
            } => {
                self.raw("(");
                self.expr(condition);
                self.raw(" ? ");
                self.expr(if_true);
                self.raw(" : ");
                self.expr(if_false);
                self.raw(")");
            }
            Expr::GrowMemory(pages) => {
                self.raw("M0.grow(");
                self.expr(pages);
                self.raw(" >>> 0)");
            }
            // Plain division, not `>>> 16`: at the 65536-page ceiling
            // memSize is exactly 2^32, which ToUint32 would wrap to 0.
            Expr::CurrentMemory => self.raw("((memSize / 65536) | 0)"),
            Expr::Undefined => self.raw("(void 0)"),
        }
    }

    fn call_args(&mut self, args: &[Expr]) {
        self.raw("(");
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.raw(", ");
            }
            self.expr(arg);
        }
        self.raw(")");
    }

    /// Calls marshal their result back into the value domain of the
    /// declared type; imported functions can return anything.
    fn coerced_call(&mut self, result: Option<ValType>, render: impl FnOnce(&mut Self)) {
        match result {
            Some(ValType::I32) => {
                self.raw("(");
                render(self);
                self.raw(" | 0)");
            }
            Some(ValType::F32) => {
                self.rt(runtime::TO_F32);
                self.raw("(");
                render(self);
                self.raw(")");
            }
            Some(ValType::F64) => {
                self.raw("(+");
                render(self);
                self.raw(")");
            }
            Some(ValType::I64) | None => render(self),
        }
    }

    fn int_unary(&mut self, ty: ValType, op: IntUnOp, value: &Expr) {
        if ty == ValType::I64 {
            self.rt(runtime::i64_unop(op));
            self.raw("(");
            self.expr(value);
            self.raw(")");
            return;
        }
        match op {
            IntUnOp::Clz => {
                self.raw("Math.clz32(");
                self.expr(value);
                self.raw(")");
            }
            IntUnOp::Ctz => {
                self.rt("i32_ctz");
                self.raw("(");
                self.expr(value);
                self.raw(")");
            }
            IntUnOp::Popcnt => {
                self.rt("i32_popcnt");
                self.raw("(");
                self.expr(value);
                self.raw(")");
            }
            IntUnOp::Eqz => {
                self.raw("((");
                self.expr(value);
                self.raw(" === 0) | 0)");
            }
        }
    }

    fn int_binary(&mut self, ty: ValType, op: IntBinOp, lhs: &Expr, rhs: &Expr) {
        if ty == ValType::I64 {
            self.rt(runtime::i64_binop(op));
            self.raw("(");
            self.expr(lhs);
            self.raw(", ");
            self.expr(rhs);
            self.raw(")");
            return;
        }
        match op {
            IntBinOp::Add => self.i32_infix(lhs, "+", rhs, true),
            IntBinOp::Sub => self.i32_infix(lhs, "-", rhs, true),
            IntBinOp::Mul => {
                self.raw("Math.imul(");
                self.expr(lhs);
                self.raw(", ");
                self.expr(rhs);
                self.raw(")");
            }
            IntBinOp::DivS => self.i32_infix(lhs, "/", rhs, true),
            IntBinOp::RemS => self.i32_infix(lhs, "%", rhs, true),
            IntBinOp::DivU => self.i32_unsigned_infix(lhs, "/", rhs),
            IntBinOp::RemU => self.i32_unsigned_infix(lhs, "%", rhs),
            IntBinOp::And => self.i32_infix(lhs, "&", rhs, false),
            IntBinOp::Or => self.i32_infix(lhs, "|", rhs, false),
            IntBinOp::Xor => self.i32_infix(lhs, "^", rhs, false),
            IntBinOp::Shl => self.i32_infix(lhs, "<<", rhs, false),
            IntBinOp::ShrS => self.i32_infix(lhs, ">>", rhs, false),
            IntBinOp::ShrU => self.i32_infix(lhs, ">>>", rhs, true),
            IntBinOp::Rotl => {
                self.rt("i32_rotl");
                self.raw("(");
                self.expr(lhs);
                self.raw(", ");
                self.expr(rhs);
                self.raw(")");
            }
            IntBinOp::Rotr => {
                self.rt("i32_rotr");
                self.raw("(");
                self.expr(lhs);
                self.raw(", ");
                self.expr(rhs);
                self.raw(")");
            }
        }
    }

    /// `((a <op> b) | 0)` or `(a <op> b)` when the operator already yields
    /// a canonical signed 32-bit value.
    fn i32_infix(&mut self, lhs: &Expr, op: &str, rhs: &Expr, rewrap: bool) {
        self.raw(if rewrap { "((" } else { "(" });
        self.expr(lhs);
        w!(self, " {op} ");
        self.expr(rhs);
        self.raw(if rewrap { ") | 0)" } else { ")" });
    }

    /// `((((a >>> 0) <op> (b >>> 0)) >>> 0) | 0)`: unsigned division and
    /// remainder, truncated and brought back into the signed domain.
    fn i32_unsigned_infix(&mut self, lhs: &Expr, op: &str, rhs: &Expr) {
        self.raw("((((");
        self.expr(lhs);
        w!(self, " >>> 0) {op} (");
        self.expr(rhs);
        self.raw(" >>> 0)) >>> 0) | 0)");
    }

    fn float_unary(&mut self, ty: ValType, op: FloatUnOp, value: &Expr) {
        let is_f32 = ty == ValType::F32;
        if let Some(helper) = runtime::float_sign_helper(op, is_f32) {
            self.rt(helper);
            self.raw("(");
            self.expr(value);
            self.raw(")");
            return;
        }
        match op {
            FloatUnOp::Nearest => {
                self.rt(runtime::NEAREST);
                self.raw("(");
                self.expr(value);
                self.raw(")");
            }
            FloatUnOp::Sqrt if is_f32 => {
                self.rt(runtime::TO_F32);
                self.raw("(Math.sqrt(");
                self.expr(value);
                self.raw("))");
            }
            FloatUnOp::Sqrt => {
                self.raw("Math.sqrt(");
                self.expr(value);
                self.raw(")");
            }
            FloatUnOp::Ceil | FloatUnOp::Floor | FloatUnOp::Trunc => {
                let name = match op {
                    FloatUnOp::Ceil => "ceil",
                    FloatUnOp::Floor => "floor",
                    _ => "trunc",
                };
                w!(self, "Math.{name}(");
                self.expr(value);
                self.raw(")");
            }
            FloatUnOp::Abs | FloatUnOp::Neg => unreachable!("handled by the sign helpers"),
        }
    }

    fn float_binary(&mut self, ty: ValType, op: FloatBinOp, lhs: &Expr, rhs: &Expr) {
        let is_f32 = ty == ValType::F32;
        match op {
            FloatBinOp::Add | FloatBinOp::Sub | FloatBinOp::Mul | FloatBinOp::Div => {
                let sym = match op {
                    FloatBinOp::Add => "+",
                    FloatBinOp::Sub => "-",
                    FloatBinOp::Mul => "*",
                    _ => "/",
                };
                // The f64 operation is exact enough that rounding the
                // result to single precision is correctly rounded.
                if is_f32 {
                    self.rt(runtime::TO_F32);
                }
                self.raw("(");
                self.expr(lhs);
                w!(self, " {sym} ");
                self.expr(rhs);
                self.raw(")");
            }
            FloatBinOp::Min | FloatBinOp::Max => {
                let name = if op == FloatBinOp::Min { "min" } else { "max" };
                w!(self, "Math.{name}(");
                self.expr(lhs);
                self.raw(", ");
                self.expr(rhs);
                self.raw(")");
            }
            FloatBinOp::Copysign => {
                self.rt(if is_f32 { "f32_copysign" } else { "f64_copysign" });
                self.raw("(");
                self.expr(lhs);
                self.raw(", ");
                self.expr(rhs);
                self.raw(")");
            }
        }
    }

    fn compare(&mut self, operand_ty: ValType, op: CmpOp, lhs: &Expr, rhs: &Expr) {
        match operand_ty {
            ValType::I64 => {
                self.rt(runtime::i64_cmp(op));
                self.raw("(");
                self.expr(lhs);
                self.raw(", ");
                self.expr(rhs);
                self.raw(")");
            }
            ValType::I32 => {
                let (sym, unsigned) = match op {
                    CmpOp::Eq => ("===", false),
                    CmpOp::Ne => ("!==", false),
                    CmpOp::LtS => ("<", false),
                    CmpOp::LtU => ("<", true),
                    CmpOp::GtS => (">", false),
                    CmpOp::GtU => (">", true),
                    CmpOp::LeS => ("<=", false),
                    CmpOp::LeU => ("<=", true),
                    CmpOp::GeS => (">=", false),
                    CmpOp::GeU => (">=", true),
                    _ => unreachable!("float relations never have i32 operands"),
                };
                if unsigned {
                    self.raw("(((");
                    self.expr(lhs);
                    w!(self, " >>> 0) {sym} (");
                    self.expr(rhs);
                    self.raw(" >>> 0)) | 0)");
                } else {
                    self.raw("((");
                    self.expr(lhs);
                    w!(self, " {sym} ");
                    self.expr(rhs);
                    self.raw(") | 0)");
                }
            }
            ValType::F32 | ValType::F64 => {
                let sym = match op {
                    CmpOp::Eq => "===",
                    CmpOp::Ne => "!==",
                    CmpOp::Lt => "<",
                    CmpOp::Gt => ">",
                    CmpOp::Le => "<=",
                    CmpOp::Ge => ">=",
                    _ => unreachable!("signed relations never have float operands"),
                };
                // Unary plus unboxes values that carry an attached NaN
                // pattern; strict equality would compare object identity.
                self.raw("((+");
                self.expr(lhs);
                w!(self, " {sym} +");
                self.expr(rhs);
                self.raw(") | 0)");
            }
        }
    }

    // ---------------------------------------------------------- memory

    /// The effective byte address `((addr >>> 0) + offset)`.
    fn mem_addr(&mut self, addr: &Expr, offset: u64) {
        if offset == 0 {
            self.raw("(");
            self.expr(addr);
            self.raw(" >>> 0)");
        } else {
            self.raw("((");
            self.expr(addr);
            w!(self, " >>> 0) + {offset})");
        }
    }

    fn view_index(&mut self, view: &str, addr: &Expr, offset: u64, shift: u32) {
        w!(self, "{view}[");
        self.mem_addr(addr, offset);
        if shift > 0 {
            w!(self, " >>> {shift}");
        }
        self.raw("]");
    }

    fn aligned_fast_path(&mut self, width: u8, align: u32) -> bool {
        self.config.little_endian && align == width.trailing_zeros()
    }

    fn load(&mut self, ty: ValType, width: u8, signed: bool, offset: u32, align: u32, addr: &Expr) {
        let offset = u64::from(offset);
        match ty {
            ValType::I32 => self.load_i32(width, signed, offset, align, addr),
            ValType::I64 => {
                if width == 8 {
                    let fast = self.config.little_endian && align >= 2;
                    self.rt("i64_new");
                    self.raw("(");
                    if fast {
                        self.view_index("HS32", addr, offset, 2);
                        self.raw(", ");
                        self.view_index("HS32", addr, offset + 4, 2);
                    } else {
                        self.rt("i32_load_unaligned");
                        self.raw("(HU8, ");
                        self.mem_addr(addr, offset);
                        self.raw("), ");
                        self.rt("i32_load_unaligned");
                        self.raw("(HU8, ");
                        self.mem_addr(addr, offset + 4);
                        self.raw(")");
                    }
                    self.raw(")");
                } else {
                    // Narrow loads produce an i32 and widen through the
                    // signed or unsigned constructor.
                    self.rt(if signed { "i64_from_i32" } else { "i64_from_u32" });
                    self.raw("(");
                    self.load_i32(width, signed, offset, align, addr);
                    self.raw(")");
                }
            }
            ValType::F32 => {
                if !self.config.preserves_f32_nan_bits {
                    self.rt("f32_load_nan");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(")");
                } else if self.aligned_fast_path(4, align) {
                    self.view_index("HF32", addr, offset, 2);
                } else {
                    self.rt("f32_load_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(")");
                }
            }
            ValType::F64 => {
                if !self.config.preserves_f64_nan_bits {
                    self.rt("f64_load_nan");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(")");
                } else if self.aligned_fast_path(8, align) {
                    self.view_index("HF64", addr, offset, 3);
                } else {
                    self.rt("f64_load_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(")");
                }
            }
        }
    }

    fn load_i32(&mut self, width: u8, signed: bool, offset: u64, align: u32, addr: &Expr) {
        match width {
            1 => self.view_index(if signed { "HS8" } else { "HU8" }, addr, offset, 0),
            2 => {
                if self.aligned_fast_path(2, align) {
                    self.view_index(if signed { "HS16" } else { "HU16" }, addr, offset, 1);
                } else if signed {
                    self.raw("((");
                    self.rt("i32_load16_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(") << 16) >> 16)");
                } else {
                    self.rt("i32_load16_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(")");
                }
            }
            4 => {
                if self.aligned_fast_path(4, align) {
                    self.view_index("HS32", addr, offset, 2);
                } else {
                    self.rt("i32_load_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(")");
                }
            }
            _ => unreachable!("i32 loads are 1, 2 or 4 bytes wide"),
        }
    }

    // ---------------------------------------------------------- conversions

    fn convert(&mut self, from: ValType, to: ValType, mode: ConvertMode, value: &Expr) {
        match mode {
            ConvertMode::Wrap => {
                self.rt("i64_low");
                self.raw("(");
                self.expr(value);
                self.raw(")");
            }
            ConvertMode::ExtendS => {
                self.rt("i64_from_i32");
                self.raw("(");
                self.expr(value);
                self.raw(")");
            }
            ConvertMode::ExtendU => {
                self.rt("i64_from_u32");
                self.raw("(");
                self.expr(value);
                self.raw(")");
            }
            ConvertMode::TruncS if to == ValType::I32 => {
                self.raw("(");
                self.expr(value);
                self.raw(" | 0)");
            }
            ConvertMode::TruncU if to == ValType::I32 => {
                self.raw("((");
                self.expr(value);
                self.raw(" >>> 0) | 0)");
            }
            ConvertMode::TruncS => {
                self.rt("i64_from_f64_s");
                self.raw("(+");
                self.expr(value);
                self.raw(")");
            }
            ConvertMode::TruncU => {
                self.rt("i64_from_f64_u");
                self.raw("(+");
                self.expr(value);
                self.raw(")");
            }
            ConvertMode::ConvertS | ConvertMode::ConvertU => {
                self.convert_int_to_float(from, to, mode == ConvertMode::ConvertS, value);
            }
            ConvertMode::Demote => {
                self.rt(runtime::TO_F32);
                self.raw("(");
                self.expr(value);
                self.raw(")");
            }
            ConvertMode::Promote => {
                self.raw("(+");
                self.expr(value);
                self.raw(")");
            }
            ConvertMode::Reinterpret => {
                let helper = match (from, to) {
                    (ValType::F32, ValType::I32) => "i32_reinterpret_f32",
                    (ValType::I32, ValType::F32) => "f32_reinterpret_i32",
                    (ValType::F64, ValType::I64) => "i64_reinterpret_f64",
                    (ValType::I64, ValType::F64) => "f64_reinterpret_i64",
                    _ => unreachable!("reinterpret pairs equal widths"),
                };
                self.rt(helper);
                self.raw("(");
                self.expr(value);
                self.raw(")");
            }
        }
    }

    fn convert_int_to_float(&mut self, from: ValType, to: ValType, signed: bool, value: &Expr) {
        if from == ValType::I64 {
            let helper = match (to, signed) {
                (ValType::F32, true) => "i64_to_f32_s",
                (ValType::F32, false) => "i64_to_f32_u",
                (ValType::F64, true) => "i64_to_f64_s",
                (ValType::F64, false) => "i64_to_f64_u",
                _ => unreachable!("conversion targets are floats"),
            };
            self.rt(helper);
            self.raw("(");
            self.expr(value);
            self.raw(")");
            return;
        }
        // i32 sources: a signed int32 is already exact in f64; unsigned
        // re-coerces first. f32 results round once more.
        if to == ValType::F32 {
            self.rt(runtime::TO_F32);
        }
        self.raw("(");
        if signed {
            self.expr(value);
        } else {
            self.raw("(");
            self.expr(value);
            self.raw(" >>> 0)");
        }
        self.raw(")");
    }

    // ---------------------------------------------------------- statements

    pub fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Drop(expr) => {
                self.start_line();
                self.expr(expr);
                self.raw(";\n");
            }
            Stmt::SetLocal { index, value, .. } => {
                self.start_line();
                w!(self, "l{} = ", index.as_u32());
                self.expr(value);
                self.raw(";\n");
            }
            Stmt::SetGlobal { index, value, .. } => {
                self.start_line();
                w!(self, "G{} = ", index.as_u32());
                self.expr(value);
                self.raw(";\n");
            }
            Stmt::SetTemp { temp, value } => {
                self.start_line();
                self.temp(*temp);
                self.raw(" = ");
                self.expr(value);
                self.raw(";\n");
            }
            Stmt::Store {
                ty,
                width,
                offset,
                align,
                addr,
                value,
            } => self.store(*ty, *width, u64::from(*offset), *align, addr, value),
            Stmt::TrapConditions(conditions) => {
                for condition in conditions {
                    self.trap_condition(condition);
                }
            }
            Stmt::Branch { target, value } => self.branch(*target, value.as_ref()),
            Stmt::BranchIf {
                condition,
                target,
                value,
            } => {
                self.start_line();
                self.raw("if (");
                self.expr(condition);
                self.raw(") {\n");
                self.indent();
                self.branch(*target, value.as_ref());
                self.dedent();
                self.line("}");
            }
            Stmt::BranchTable {
                key,
                targets,
                default,
                value,
            } => {
                self.start_line();
                self.raw("switch (");
                self.expr(key);
                self.raw(") {\n");
                for (i, target) in targets.iter().enumerate() {
                    self.start_line();
                    w!(self, "case {i}:\n");
                    self.indent();
                    self.branch(*target, value.as_ref());
                    self.dedent();
                }
                self.line("default:");
                self.indent();
                self.branch(*default, value.as_ref());
                self.dedent();
                self.line("}");
            }
            Stmt::Unreachable => {
                self.start_line();
                self.trap_call(Trap::UnreachableCodeReached);
                self.raw(";\n");
            }
            Stmt::Block { label, body } => {
                self.start_line();
                w!(self, "L{}: do {{\n", label.0);
                self.indent();
                for stmt in body {
                    self.stmt(stmt);
                }
                self.dedent();
                self.line("} while (0);");
            }
            Stmt::Loop { label, body } => {
                self.start_line();
                w!(self, "L{}: while (1) {{\n", label.0);
                self.indent();
                for stmt in body {
                    self.stmt(stmt);
                }
                // Fall-through leaves the loop; only `continue` repeats it.
                self.line("break;");
                self.dedent();
                self.line("}");
            }
            Stmt::IfElse {
                condition,
                label,
                then_body,
                else_body,
            } => {
                if let Some(label) = label {
                    self.start_line();
                    w!(self, "L{}: do {{\n", label.0);
                    self.indent();
                }
                self.start_line();
                self.raw("if (");
                self.expr(condition);
                self.raw(") {\n");
                self.indent();
                for stmt in then_body {
                    self.stmt(stmt);
                }
                self.dedent();
                if else_body.is_empty() {
                    self.line("}");
                } else {
                    self.line("} else {");
                    self.indent();
                    for stmt in else_body {
                        self.stmt(stmt);
                    }
                    self.dedent();
                    self.line("}");
                }
                if label.is_some() {
                    self.dedent();
                    self.line("} while (0);");
                }
            }
        }
    }

    fn trap_condition(&mut self, condition: &TrapCondition) {
        match condition {
            TrapCondition::If { condition, trap } => {
                self.start_line();
                self.raw("if (");
                self.expr(condition);
                self.raw(") ");
                self.trap_call(*trap);
                self.raw(";\n");
            }
            TrapCondition::MemoryBounds {
                addr,
                offset_plus_size,
            } => {
                self.start_line();
                if *offset_plus_size > u64::from(u32::MAX) {
                    // The static displacement alone exceeds the address
                    // space: this access can never succeed.
                    self.trap_call(Trap::MemoryOutOfBounds);
                    self.raw(";\n");
                } else {
                    self.raw("if ((");
                    self.expr(addr);
                    w!(self, " >>> 0) > (memSize - {offset_plus_size})) ");
                    self.trap_call(Trap::MemoryOutOfBounds);
                    self.raw(";\n");
                }
            }
        }
    }

    fn branch(&mut self, target: BranchTarget, value: Option<&Expr>) {
        match target {
            BranchTarget::Break { label, result_temp } => {
                if let (Some(value), Some(temp)) = (value, result_temp) {
                    self.start_line();
                    self.temp(temp);
                    self.raw(" = ");
                    self.expr(value);
                    self.raw(";\n");
                }
                self.start_line();
                w!(self, "break L{};\n", label.0);
            }
            BranchTarget::Continue(label) => {
                self.start_line();
                w!(self, "continue L{};\n", label.0);
            }
            BranchTarget::Return => {
                self.start_line();
                match value {
                    Some(value) => {
                        self.raw("return ");
                        self.expr(value);
                        self.raw(";\n");
                    }
                    None => self.raw("return;\n"),
                }
            }
        }
    }

    fn store(&mut self, ty: ValType, width: u8, offset: u64, align: u32, addr: &Expr, value: &Expr) {
        match ty {
            ValType::I32 => {
                self.start_line();
                self.store_i32(width, offset, align, addr, |c| c.expr(value));
            }
            ValType::I64 => {
                if width == 8 {
                    let fast = self.config.little_endian && align >= 2;
                    if fast {
                        self.start_line();
                        self.view_index("HS32", addr, offset, 2);
                        self.raw(" = ");
                        self.rt("i64_low");
                        self.raw("(");
                        self.expr(value);
                        self.raw(");\n");
                        self.start_line();
                        self.view_index("HS32", addr, offset + 4, 2);
                        self.raw(" = ");
                        self.rt("i64_high");
                        self.raw("(");
                        self.expr(value);
                        self.raw(");\n");
                    } else {
                        self.start_line();
                        self.rt("i32_store_unaligned");
                        self.raw("(HU8, ");
                        self.mem_addr(addr, offset);
                        self.raw(", ");
                        self.rt("i64_low");
                        self.raw("(");
                        self.expr(value);
                        self.raw("));\n");
                        self.start_line();
                        self.rt("i32_store_unaligned");
                        self.raw("(HU8, ");
                        self.mem_addr(addr, offset + 4);
                        self.raw(", ");
                        self.rt("i64_high");
                        self.raw("(");
                        self.expr(value);
                        self.raw("));\n");
                    }
                } else {
                    self.start_line();
                    self.store_i32(width, offset, align, addr, |c| {
                        c.rt("i64_low");
                        c.raw("(");
                        c.expr(value);
                        c.raw(")");
                    });
                }
            }
            ValType::F32 => {
                self.start_line();
                if !self.config.preserves_f32_nan_bits {
                    self.rt("f32_store_nan");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(", ");
                    self.expr(value);
                    self.raw(");\n");
                } else if self.aligned_fast_path(4, align) {
                    self.view_index("HF32", addr, offset, 2);
                    self.raw(" = ");
                    self.expr(value);
                    self.raw(";\n");
                } else {
                    self.rt("f32_store_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(", ");
                    self.expr(value);
                    self.raw(");\n");
                }
            }
            ValType::F64 => {
                self.start_line();
                if !self.config.preserves_f64_nan_bits {
                    self.rt("f64_store_nan");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(", ");
                    self.expr(value);
                    self.raw(");\n");
                } else if self.aligned_fast_path(8, align) {
                    self.view_index("HF64", addr, offset, 3);
                    self.raw(" = ");
                    self.expr(value);
                    self.raw(";\n");
                } else {
                    self.rt("f64_store_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(", ");
                    self.expr(value);
                    self.raw(");\n");
                }
            }
        }
    }

    /// One store of an i32-domain value; the caller renders the value.
    fn store_i32(
        &mut self,
        width: u8,
        offset: u64,
        align: u32,
        addr: &Expr,
        value: impl Fn(&mut Self),
    ) {
        match width {
            1 => {
                self.view_index("HU8", addr, offset, 0);
                self.raw(" = ");
                value(self);
                self.raw(";\n");
            }
            2 => {
                if self.aligned_fast_path(2, align) {
                    self.view_index("HU16", addr, offset, 1);
                    self.raw(" = ");
                    value(self);
                    self.raw(";\n");
                } else {
                    self.rt("i32_store16_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(", ");
                    value(self);
                    self.raw(");\n");
                }
            }
            4 => {
                if self.aligned_fast_path(4, align) {
                    self.view_index("HS32", addr, offset, 2);
                    self.raw(" = ");
                    value(self);
                    self.raw(";\n");
                } else {
                    self.rt("i32_store_unaligned");
                    self.raw("(HU8, ");
                    self.mem_addr(addr, offset);
                    self.raw(", ");
                    value(self);
                    self.raw(");\n");
                }
            }
            _ => unreachable!("i32 stores are 1, 2 or 4 bytes wide"),
        }
    }

    // ---------------------------------------------------------- functions

    /// Emit one function: header with typed parameter coercions, declared
    /// locals zero-initialized, spill slots up to the computed maxima,
    /// then the statement tree.
    pub fn emit_function(&mut self, ir: &FunctionIr) {
        let func_ty = &self.module.types[ir.type_index];
        let param_count = func_ty.params.len();

        if let Some(name) = self.module.func_names.get(&ir.func_index) {
            self.start_line();
            w!(self, "// {name}\n");
        }
        self.start_line();
        w!(self, "function F{}(", ir.func_index.as_u32());
        for i in 0..param_count {
            if i > 0 {
                self.raw(", ");
            }
            w!(self, "l{i}");
        }
        self.raw(") {\n");
        self.indent();

        for (i, ty) in func_ty.params.iter().enumerate() {
            match ty {
                ValType::I32 => {
                    self.start_line();
                    w!(self, "l{i} = l{i} | 0;\n");
                }
                ValType::F32 => {
                    self.start_line();
                    w!(self, "l{i} = ");
                    self.rt(runtime::TO_F32);
                    w!(self, "(l{i});\n");
                }
                ValType::F64 => {
                    self.start_line();
                    w!(self, "l{i} = +l{i};\n");
                }
                // i64 values only arrive from other translated functions.
                ValType::I64 => {}
            }
        }

        if !ir.locals.is_empty() {
            self.start_line();
            self.raw("var ");
            for (i, ty) in ir.locals.iter().enumerate() {
                if i > 0 {
                    self.raw(", ");
                }
                w!(self, "l{} = ", param_count + i);
                match ty {
                    ValType::I64 => {
                        self.rt("i64_new");
                        self.raw("(0, 0)");
                    }
                    _ => self.raw("0"),
                }
            }
            self.raw(";\n");
        }

        let temp_decls: Vec<(ValType, u32)> = [ValType::I32, ValType::I64, ValType::F32, ValType::F64]
            .into_iter()
            .filter_map(|ty| {
                let count = ir.temp_maxima[ty.index()];
                (count > 0).then_some((ty, count))
            })
            .collect();
        if !temp_decls.is_empty() {
            self.start_line();
            self.raw("var ");
            let mut first = true;
            for (ty, count) in temp_decls {
                for i in 0..count {
                    if !first {
                        self.raw(", ");
                    }
                    first = false;
                    w!(self, "{}{i} = 0", temp_prefix(ty));
                }
            }
            self.raw(";\n");
        }

        for stmt in &ir.body {
            self.stmt(stmt);
        }

        self.dedent();
        self.line("}");
        self.start_line();
        w!(
            self,
            "F{}.sig = \"{}\";\n",
            ir.func_index.as_u32(),
            func_ty.sig_str()
        );
    }
}

fn temp_prefix(ty: ValType) -> &'static str {
    match ty {
        ValType::I32 => "ti",
        ValType::I64 => "tl",
        ValType::F32 => "tf",
        ValType::F64 => "td",
    }
}
