//! Primitive types of the glacier IR.
//!
//! The type system is a closed set of scalar and short-vector types. The
//! word type (i32 or i64) is a target parameter; i64 on a 32-bit target is
//! not natively addressable and is carried as a lo/hi variable pair.

/// A primitive IR type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    V4I1,
    V8I1,
    V16I1,
    V16I8,
    V8I16,
    V4I32,
    V4F32,
}

impl Type {
    /// Width of the type in bytes. i1 is stored in one byte.
    pub fn width_in_bytes(self) -> u32 {
        match self {
            Type::Void => 0,
            Type::I1 | Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::F32 => 4,
            Type::I64 | Type::F64 => 8,
            Type::V4I1 | Type::V8I1 | Type::V16I1 => 16,
            Type::V16I8 | Type::V8I16 | Type::V4I32 | Type::V4F32 => 16,
        }
    }

    /// log2 of the width in bytes, for address-mode shift computation.
    pub fn width_in_bytes_log2(self) -> u16 {
        debug_assert!(self.width_in_bytes().is_power_of_two());
        self.width_in_bytes().trailing_zeros() as u16
    }

    /// Required alignment in bytes.
    pub fn align_in_bytes(self) -> u32 {
        match self {
            Type::Void => 1,
            _ => self.width_in_bytes(),
        }
    }

    /// Number of elements; 1 for scalars.
    pub fn num_elements(self) -> u32 {
        match self {
            Type::V4I1 | Type::V4I32 | Type::V4F32 => 4,
            Type::V8I1 | Type::V8I16 => 8,
            Type::V16I1 | Type::V16I8 => 16,
            _ => 1,
        }
    }

    /// Element type of a vector; the type itself for scalars.
    pub fn element_type(self) -> Type {
        match self {
            Type::V4I1 | Type::V8I1 | Type::V16I1 => Type::I1,
            Type::V16I8 => Type::I8,
            Type::V8I16 => Type::I16,
            Type::V4I32 => Type::I32,
            Type::V4F32 => Type::F32,
            other => other,
        }
    }

    pub fn is_vector(self) -> bool {
        self.num_elements() > 1
    }

    pub fn is_scalar_integer(self) -> bool {
        matches!(self, Type::I1 | Type::I8 | Type::I16 | Type::I32 | Type::I64)
    }

    pub fn is_vector_integer(self) -> bool {
        matches!(
            self,
            Type::V4I1 | Type::V8I1 | Type::V16I1 | Type::V16I8 | Type::V8I16 | Type::V4I32
        )
    }

    pub fn is_integer(self) -> bool {
        self.is_scalar_integer() || self.is_vector_integer()
    }

    pub fn is_scalar_float(self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    pub fn is_vector_float(self) -> bool {
        self == Type::V4F32
    }

    pub fn is_float(self) -> bool {
        self.is_scalar_float() || self.is_vector_float()
    }

    /// True for i1 vectors, which have no in-memory representation of their
    /// own and are promoted to full-width integer vectors when operated on.
    pub fn is_vector_bool(self) -> bool {
        matches!(self, Type::V4I1 | Type::V8I1 | Type::V16I1)
    }

    /// Whether a value of this type can be loaded or stored directly.
    pub fn is_load_store(self) -> bool {
        !matches!(self, Type::Void | Type::V4I1 | Type::V8I1 | Type::V16I1)
    }

    /// True exactly for one-byte types (i8 and i1).
    pub fn is_byte_sized(self) -> bool {
        matches!(self, Type::I1 | Type::I8)
    }

    /// Result type of icmp/fcmp applied to operands of this type.
    pub fn compare_result_type(self) -> Type {
        match self {
            Type::I1 | Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::F32 | Type::F64 => {
                Type::I1
            }
            Type::V4I1 | Type::V4I32 | Type::V4F32 => Type::V4I1,
            Type::V8I1 | Type::V8I16 => Type::V8I1,
            Type::V16I1 | Type::V16I8 => Type::V16I1,
            Type::Void => Type::Void,
        }
    }

    /// Number of bits in a scalar integer type.
    pub fn scalar_int_bit_width(self) -> u32 {
        debug_assert!(self.is_scalar_integer());
        if self == Type::I1 {
            1
        } else {
            self.width_in_bytes() * 8
        }
    }

    /// Short lowercase name, matching the IR text form.
    pub fn name(self) -> &'static str {
        match self {
            Type::Void => "void",
            Type::I1 => "i1",
            Type::I8 => "i8",
            Type::I16 => "i16",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F32 => "f32",
            Type::F64 => "f64",
            Type::V4I1 => "v4i1",
            Type::V8I1 => "v8i1",
            Type::V16I1 => "v16i1",
            Type::V16I8 => "v16i8",
            Type::V8I16 => "v8i16",
            Type::V4I32 => "v4i32",
            Type::V4F32 => "v4f32",
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
