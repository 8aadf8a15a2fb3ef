//! Opaque data-type handles.
//!
//! Recovery only needs to know a type's size, its coarse meta-type, and the
//! ABI class the meta-type maps to. Everything else about the type system
//! lives outside this crate.

use std::fmt;
use std::sync::Arc;

/// Coarse classification of a data-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaType {
    Void,
    Unknown,
    Int,
    Uint,
    Bool,
    Code,
    Float,
    Ptr,
    Array,
    Struct,
}

/// Storage class a calling convention distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeClass {
    /// Matches any type.
    Unknown,
    /// Integers and other general purpose values.
    General,
    /// Floating-point values.
    Float,
    /// Pointers.
    Ptr,
    /// A pointer to a hidden return value.
    HiddenReturn,
    /// Vector register values.
    Vector,
}

impl MetaType {
    /// ABI class values of this meta-type are passed in.
    pub fn type_class(self) -> TypeClass {
        match self {
            MetaType::Float => TypeClass::Float,
            MetaType::Ptr => TypeClass::Ptr,
            _ => TypeClass::General,
        }
    }
}

/// A shared, immutable data-type handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataType {
    inner: Arc<TypeInner>,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct TypeInner {
    name: String,
    size: u32,
    meta: MetaType,
    align: u32,
}

impl DataType {
    /// Creates a named type.
    pub fn new(name: impl Into<String>, size: u32, meta: MetaType) -> Self {
        let align = match size {
            0 => 1,
            s if s.is_power_of_two() => s.min(8),
            _ => 1,
        };
        Self {
            inner: Arc::new(TypeInner {
                name: name.into(),
                size,
                meta,
                align,
            }),
        }
    }

    /// The void type.
    pub fn void() -> Self {
        Self::new("void", 0, MetaType::Void)
    }

    /// A sized type with no further information.
    pub fn unknown(size: u32) -> Self {
        Self::new(format!("undefined{}", size), size, MetaType::Unknown)
    }

    /// A signed or unsigned integer.
    pub fn int(size: u32, signed: bool) -> Self {
        if signed {
            Self::new(format!("int{}", size), size, MetaType::Int)
        } else {
            Self::new(format!("uint{}", size), size, MetaType::Uint)
        }
    }

    pub fn float(size: u32) -> Self {
        Self::new(format!("float{}", size), size, MetaType::Float)
    }

    pub fn bool() -> Self {
        Self::new("bool", 1, MetaType::Bool)
    }

    /// A pointer of `size` bytes to `target`.
    pub fn pointer(size: u32, target: &DataType) -> Self {
        Self::new(format!("{} *", target.name()), size, MetaType::Ptr)
    }

    /// A structure of the given size.
    pub fn structure(name: impl Into<String>, size: u32) -> Self {
        Self::new(name, size, MetaType::Struct)
    }

    /// A base type of the given size and meta-type.
    pub fn base(size: u32, meta: MetaType) -> Self {
        match meta {
            MetaType::Void => Self::void(),
            MetaType::Int => Self::int(size, true),
            MetaType::Uint => Self::int(size, false),
            MetaType::Float => Self::float(size),
            MetaType::Bool if size == 1 => Self::bool(),
            _ => Self::unknown(size),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> u32 {
        self.inner.size
    }

    pub fn meta(&self) -> MetaType {
        self.inner.meta
    }

    /// Alignment requirement in bytes.
    pub fn alignment(&self) -> u32 {
        self.inner.align
    }

    pub fn type_class(&self) -> TypeClass {
        self.inner.meta.type_class()
    }

    pub fn is_void(&self) -> bool {
        self.inner.meta == MetaType::Void
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
