//! Struct layout registry
//!
//! Maps `(record, member)` to the byte offset and native type of a member of
//! one of the host's internal records. Filled once at bootstrap from the
//! per-ABI record tables in [`bootstrap`], read-only afterward.

pub mod bootstrap;
pub mod record;

use std::fmt;

use cranelift_codegen::ir::{self, types};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::config::PointerWidth;
use crate::error::{BridgeError, BridgeResult};

/// Scalar or pointer type of a record member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeType {
    /// `signed char`
    Int8,
    /// `unsigned char`
    UInt8,
    /// `int`
    Int32,
    /// `unsigned int`
    UInt32,
    /// `int64_t`
    Int64,
    /// `uint64_t`
    UInt64,
    /// `long` (pointer sized)
    Long,
    /// `unsigned long` (pointer sized)
    ULong,
    /// `void *`
    Pointer,
    /// A host value word (pointer sized)
    Value,
    /// `double`
    Float64,
}

impl NativeType {
    /// Size in bytes
    pub fn size(self, width: PointerWidth) -> u32 {
        match self {
            NativeType::Int8 | NativeType::UInt8 => 1,
            NativeType::Int32 | NativeType::UInt32 => 4,
            NativeType::Int64 | NativeType::UInt64 | NativeType::Float64 => 8,
            NativeType::Long | NativeType::ULong | NativeType::Pointer | NativeType::Value => {
                width.bytes() as u32
            }
        }
    }

    /// Alignment in bytes (8-byte scalars are 4-aligned on 32-bit hosts)
    pub fn align(self, width: PointerWidth) -> u32 {
        self.size(width).min(width.bytes() as u32)
    }

    /// Whether loads sign-extend
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            NativeType::Int8 | NativeType::Int32 | NativeType::Int64 | NativeType::Long
        )
    }

    /// Code generator type for a target with the given pointer type
    pub fn ir_type(self, pointer_type: ir::Type) -> ir::Type {
        match self {
            NativeType::Int8 | NativeType::UInt8 => types::I8,
            NativeType::Int32 | NativeType::UInt32 => types::I32,
            NativeType::Int64 | NativeType::UInt64 => types::I64,
            NativeType::Float64 => types::F64,
            NativeType::Long | NativeType::ULong | NativeType::Pointer | NativeType::Value => {
                pointer_type
            }
        }
    }

    /// C spelling, for diagnostics
    pub fn c_name(self) -> &'static str {
        match self {
            NativeType::Int8 => "signed char",
            NativeType::UInt8 => "unsigned char",
            NativeType::Int32 => "int",
            NativeType::UInt32 => "unsigned int",
            NativeType::Int64 => "int64_t",
            NativeType::UInt64 => "uint64_t",
            NativeType::Long => "long",
            NativeType::ULong => "unsigned long",
            NativeType::Pointer => "void *",
            NativeType::Value => "VALUE",
            NativeType::Float64 => "double",
        }
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.c_name())
    }
}

/// Where a member lives and what it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FieldDescriptor {
    /// Byte offset from the start of the record
    pub offset: u32,
    /// Native type of the member
    pub native_type: NativeType,
}

impl FieldDescriptor {
    /// Read the member of the record at `base` in this process
    ///
    /// Signed members are sign-extended, floats are returned as their bits.
    ///
    /// # Safety
    ///
    /// `base` must point to a live record laid out for the host's own
    /// pointer width, large enough to contain the member.
    pub unsafe fn read_raw(&self, base: *const u8) -> u64 {
        let p = unsafe { base.add(self.offset as usize) };
        let width = PointerWidth::host();
        unsafe {
            match (self.native_type, self.native_type.size(width)) {
                (NativeType::Int8, _) => p.cast::<i8>().read_unaligned() as i64 as u64,
                (NativeType::UInt8, _) => p.read_unaligned() as u64,
                (NativeType::Int32, _) => p.cast::<i32>().read_unaligned() as i64 as u64,
                (NativeType::UInt32, _) => p.cast::<u32>().read_unaligned() as u64,
                (NativeType::Long, 4) => p.cast::<i32>().read_unaligned() as i64 as u64,
                (_, 4) => p.cast::<u32>().read_unaligned() as u64,
                _ => p.cast::<u64>().read_unaligned(),
            }
        }
    }

    /// Write the member of the record at `base`, truncating `bits`
    ///
    /// # Safety
    ///
    /// Same requirements as [`FieldDescriptor::read_raw`], plus write access.
    pub unsafe fn write_raw(&self, base: *mut u8, bits: u64) {
        let p = unsafe { base.add(self.offset as usize) };
        unsafe {
            match self.native_type.size(PointerWidth::host()) {
                1 => p.write_unaligned(bits as u8),
                4 => p.cast::<u32>().write_unaligned(bits as u32),
                _ => p.cast::<u64>().write_unaligned(bits),
            }
        }
    }
}

/// `record -> member -> descriptor`
#[derive(Debug, Clone, Default)]
pub struct TypeLayoutTable {
    types: FxHashMap<String, FxHashMap<String, FieldDescriptor>>,
    sizes: FxHashMap<String, u32>,
}

impl TypeLayoutTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite one member
    pub fn register(
        &mut self,
        type_name: &str,
        field: &str,
        offset: u32,
        native_type: NativeType,
    ) {
        self.types
            .entry(type_name.to_string())
            .or_default()
            .insert(field.to_string(), FieldDescriptor { offset, native_type });
    }

    /// Record the total size of a record
    pub fn register_size(&mut self, type_name: &str, size: u32) {
        self.types.entry(type_name.to_string()).or_default();
        self.sizes.insert(type_name.to_string(), size);
    }

    /// Find a member
    pub fn lookup(&self, type_name: &str, field: &str) -> BridgeResult<FieldDescriptor> {
        let fields = self.types.get(type_name).ok_or_else(|| BridgeError::UnknownType {
            type_name: type_name.to_string(),
        })?;
        fields.get(field).copied().ok_or_else(|| BridgeError::UnknownField {
            type_name: type_name.to_string(),
            field: field.to_string(),
        })
    }

    /// Whether a member is registered
    pub fn has(&self, type_name: &str, field: &str) -> bool {
        self.types
            .get(type_name)
            .is_some_and(|fields| fields.contains_key(field))
    }

    /// Offset of a member
    pub fn offset_of(&self, type_name: &str, field: &str) -> BridgeResult<u32> {
        self.lookup(type_name, field).map(|d| d.offset)
    }

    /// Total size of a record, when known
    pub fn size_of(&self, type_name: &str) -> Option<u32> {
        self.sizes.get(type_name).copied()
    }

    /// Registered record names, sorted
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Members of a record ordered by offset, then name
    pub fn fields(&self, type_name: &str) -> BridgeResult<Vec<(&str, FieldDescriptor)>> {
        let fields = self.types.get(type_name).ok_or_else(|| BridgeError::UnknownType {
            type_name: type_name.to_string(),
        })?;
        let mut out: Vec<(&str, FieldDescriptor)> =
            fields.iter().map(|(name, d)| (name.as_str(), *d)).collect();
        out.sort_by(|a, b| a.1.offset.cmp(&b.1.offset).then(a.0.cmp(b.0)));
        Ok(out)
    }

    /// Number of registered members across all records
    pub fn len(&self) -> usize {
        self.types.values().map(|fields| fields.len()).sum()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
