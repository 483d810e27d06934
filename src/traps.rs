/// Runtime failure conditions the emitted code can raise.
///
/// The translator never traps itself; it bakes these conditions into guard
/// statements ahead of every operation that can fail at runtime. The message
/// strings below are the exact strings passed to the embedder's `trap`
/// helper, so hosts can map them back to a trap kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum Trap {
    /// Code that was supposed to have been unreachable was reached.
    #[error("unreachable code executed")]
    UnreachableCodeReached,
    /// An out-of-bounds memory access.
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    /// Out-of-bounds access to the function table.
    #[error("out of bounds table access")]
    TableOutOfBounds,
    /// Indirect call to a null table entry.
    #[error("accessed uninitialized table element")]
    IndirectCallToNull,
    /// Signature mismatch on indirect call.
    #[error("indirect call signature mismatch")]
    BadSignature,
    /// An integer division by zero.
    #[error("integer division by zero")]
    IntegerDivisionByZero,
    /// Signed division overflow (`MIN / -1`).
    #[error("integer overflow")]
    IntegerOverflow,
    /// Failed float-to-int conversion.
    #[error("invalid conversion to integer")]
    BadConversionToInteger,
}

impl Trap {
    /// The message baked into emitted `trap(...)` calls.
    pub fn message(self) -> &'static str {
        match self {
            Trap::UnreachableCodeReached => "unreachable code executed",
            Trap::MemoryOutOfBounds => "out of bounds memory access",
            Trap::TableOutOfBounds => "out of bounds table access",
            Trap::IndirectCallToNull => "accessed uninitialized table element",
            Trap::BadSignature => "indirect call signature mismatch",
            Trap::IntegerDivisionByZero => "integer division by zero",
            Trap::IntegerOverflow => "integer overflow",
            Trap::BadConversionToInteger => "invalid conversion to integer",
        }
    }
}
