use crate::errors::CompileErrorKind;
use crate::opcode::type_tag;
use crate::reader::Reader;
use crate::{Result, WASM_MAX_PAGES};
use alloc::boxed::Box;
use alloc::string::String;

/// A WebAssembly value type. Void results and the stack-polymorphic
/// "unknown" are modelled as `Option<ValType>` / missing operands rather
/// than extra variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    pub fn from_tag(tag: i8) -> Option<Self> {
        match tag {
            type_tag::I32 => Some(ValType::I32),
            type_tag::I64 => Some(ValType::I64),
            type_tag::F32 => Some(ValType::F32),
            type_tag::F64 => Some(ValType::F64),
            _ => None,
        }
    }

    /// The single-character tag used in signature strings.
    pub fn sig_char(self) -> char {
        match self {
            ValType::I32 => 'i',
            ValType::I64 => 'l',
            ValType::F32 => 'f',
            ValType::F64 => 'd',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        }
    }

    /// Dense index used by the per-type tempvar pools.
    pub fn index(self) -> usize {
        match self {
            ValType::I32 => 0,
            ValType::I64 => 1,
            ValType::F32 => 2,
            ValType::F64 => 3,
        }
    }
}

/// Decode a value type from its one-byte signed tag.
pub fn read_val_type(reader: &mut Reader<'_>) -> Result<ValType> {
    let offset = reader.offset();
    let tag = reader.read_var_i7()?;
    ValType::from_tag(tag).ok_or_else(|| {
        crate::errors::CompileError::new(CompileErrorKind::BadValueType(tag as u8), offset)
    })
}

/// Decode a block type: either a value type or the empty tag.
pub fn read_block_type(reader: &mut Reader<'_>) -> Result<Option<ValType>> {
    let offset = reader.offset();
    let tag = reader.read_var_i7()?;
    if tag == type_tag::EMPTY {
        return Ok(None);
    }
    match ValType::from_tag(tag) {
        Some(ty) => Ok(Some(ty)),
        None => Err(crate::errors::CompileError::new(
            CompileErrorKind::BadValueType(tag as u8),
            offset,
        )),
    }
}

/// A function signature. The MVP permits at most one result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Box<[ValType]>,
    pub result: Option<ValType>,
}

impl FuncType {
    /// The canonical signature string, e.g. `"iif->d"` or `"->"` for
    /// `() -> ()`. Dynamic indirect-call checks compare these strings.
    pub fn sig_str(&self) -> String {
        let mut s = String::with_capacity(self.params.len() + 3);
        for p in self.params.iter() {
            s.push(p.sig_char());
        }
        s.push_str("->");
        if let Some(r) = self.result {
            s.push(r.sig_char());
        }
        s
    }
}

/// Resizable limits attached to tables and memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// Decode a limits record and enforce `initial <= maximum`.
pub fn read_limits(reader: &mut Reader<'_>) -> Result<Limits> {
    let flags = reader.read_var_u1()?;
    let initial = reader.read_var_u32()?;
    let maximum = if flags == 1 {
        let offset = reader.offset();
        let maximum = reader.read_var_u32()?;
        if maximum < initial {
            return Err(crate::errors::CompileError::new(
                CompileErrorKind::LimitsMinExceedsMax,
                offset,
            ));
        }
        Some(maximum)
    } else {
        None
    };
    Ok(Limits { initial, maximum })
}

/// Decode memory limits, additionally capped at 65536 pages (4 GiB).
pub fn read_memory_limits(reader: &mut Reader<'_>) -> Result<Limits> {
    let offset = reader.offset();
    let limits = read_limits(reader)?;
    if limits.initial > WASM_MAX_PAGES || limits.maximum.is_some_and(|max| max > WASM_MAX_PAGES) {
        return Err(crate::errors::CompileError::new(
            CompileErrorKind::MemoryTooLarge,
            offset,
        ));
    }
    Ok(limits)
}

/// A global's type: its value type plus declared mutability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub ty: ValType,
    pub mutable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_strings() {
        let ty = FuncType {
            params: Box::new([ValType::I32, ValType::I32, ValType::F32]),
            result: Some(ValType::F64),
        };
        assert_eq!(ty.sig_str(), "iif->d");

        let void = FuncType {
            params: Box::new([]),
            result: None,
        };
        assert_eq!(void.sig_str(), "->");

        let ret_i64 = FuncType {
            params: Box::new([ValType::I64]),
            result: Some(ValType::I64),
        };
        assert_eq!(ret_i64.sig_str(), "l->l");
    }

    #[test]
    fn limits_ordering_is_enforced() {
        let mut r = Reader::new(&[0x01, 0x05, 0x02]);
        assert_eq!(
            read_limits(&mut r).unwrap_err().kind,
            CompileErrorKind::LimitsMinExceedsMax
        );

        let mut r = Reader::new(&[0x01, 0x02, 0x05]);
        assert_eq!(
            read_limits(&mut r).unwrap(),
            Limits {
                initial: 2,
                maximum: Some(5)
            }
        );
    }

    #[test]
    fn memory_page_cap() {
        // initial = 65537 pages.
        let mut r = Reader::new(&[0x00, 0x81, 0x80, 0x04]);
        assert_eq!(
            read_memory_limits(&mut r).unwrap_err().kind,
            CompileErrorKind::MemoryTooLarge
        );

        // exactly 65536 pages is fine.
        let mut r = Reader::new(&[0x00, 0x80, 0x80, 0x04]);
        assert!(read_memory_limits(&mut r).is_ok());
    }
}
