//! The closed set of OpenPlant value type tags.

use crate::error::ProtocolError;
use std::fmt;

/// Extension tag of a row record inside a dataset page or request body.
pub const VT_ROW: i8 = 32;

/// Offset added to an element type to form a typed-array extension tag.
pub const ARRAY_TAG_BASE: i8 = 16;

/// Extension tag of an int32 key array.
pub const INT32_ARRAY: i8 = ARRAY_TAG_BASE + VarType::Int32 as i8;
/// Extension tag of an int64 key array.
pub const INT64_ARRAY: i8 = ARRAY_TAG_BASE + VarType::Int64 as i8;
/// Extension tag of a string key array.
pub const STRING_ARRAY: i8 = ARRAY_TAG_BASE + VarType::String as i8;

/// Single-byte type code used for column typing and inside dynamic cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum VarType {
    Null = 0,
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Float = 6,
    Double = 7,
    DateTime = 8,
    String = 9,
    Binary = 10,
    Object = 11,
    Map = 12,
    Structure = 13,
    Slice = 14,
}

/// Natural byte width per type tag; zero marks a variable-length type.
const FIXED_WIDTHS: [u8; 15] = [0, 1, 1, 2, 4, 8, 4, 8, 8, 0, 0, 0, 0, 0, 0];

const NAMES: [&str; 15] = [
    "Null",
    "Bool",
    "Int8",
    "Int16",
    "Int32",
    "Int64",
    "Float",
    "Double",
    "DateTime",
    "String",
    "Binary",
    "Object",
    "Map",
    "Structure",
    "Slice",
];

impl VarType {
    /// All tags in code order.
    pub const ALL: [VarType; 15] = [
        VarType::Null,
        VarType::Bool,
        VarType::Int8,
        VarType::Int16,
        VarType::Int32,
        VarType::Int64,
        VarType::Float,
        VarType::Double,
        VarType::DateTime,
        VarType::String,
        VarType::Binary,
        VarType::Object,
        VarType::Map,
        VarType::Structure,
        VarType::Slice,
    ];

    /// Returns the natural width of a fixed-length type, `None` otherwise.
    pub const fn fixed_width(self) -> Option<usize> {
        match FIXED_WIDTHS[self as usize] {
            0 => None,
            w => Some(w as usize),
        }
    }

    /// Returns whether values of this type always occupy a fixed width.
    pub const fn is_fixed(self) -> bool {
        FIXED_WIDTHS[self as usize] != 0
    }

    /// Integer, float, double types.
    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            VarType::Int8
                | VarType::Int16
                | VarType::Int32
                | VarType::Int64
                | VarType::Float
                | VarType::Double
        )
    }

    /// Slice, map and structure.
    pub const fn is_compound(self) -> bool {
        matches!(self, VarType::Slice | VarType::Map | VarType::Structure)
    }

    /// Types allowed as map keys.
    pub const fn is_map_key(self) -> bool {
        matches!(
            self,
            VarType::Int8
                | VarType::Int16
                | VarType::Int32
                | VarType::Int64
                | VarType::Float
                | VarType::Double
                | VarType::String
        )
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        NAMES[self as usize]
    }
}

impl TryFrom<u8> for VarType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        VarType::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::UnknownType(value))
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
