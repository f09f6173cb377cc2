//! The layout of the managed heap as generated code sees it.
//!
//! Heap object references are tagged: the low bit of a heap pointer is [HEAP_OBJECT_TAG], so a
//! field at (untagged) offset `off` is addressed as `[obj + off - HEAP_OBJECT_TAG]`. Small
//! integers ("smis") keep their 32-bit payload in the upper half of a word and have a clear low
//! bit.

use strum::{Display, FromRepr};

pub const POINTER_SIZE: i32 = 8;
pub const DOUBLE_SIZE: i32 = 8;
pub const HEAP_OBJECT_TAG: i32 = 1;
pub const SMI_TAG_MASK: i32 = 1;
/// Smis are shifted left by this much.
pub const SMI_SHIFT: i8 = 32;
pub const SMI_MAX: i64 = i32::MAX as i64;
pub const SMI_MIN: i64 = i32::MIN as i64;

/// Is `v` representable as a smi on this target? Every `i32` is.
pub fn is_valid_smi(v: i64) -> bool {
    (SMI_MIN..=SMI_MAX).contains(&v)
}

/// The raw word for smi `v`.
pub fn smi_word(v: i32) -> i64 {
    i64::from(v) << SMI_SHIFT
}

/// The operand that addresses field `offset` of a tagged object.
pub const fn field(offset: i32) -> i32 {
    offset - HEAP_OBJECT_TAG
}

/// A reference to a heap object that is known at compile time. Identity is the (tagged) address
/// of the object.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Handle(pub u64);

impl Handle {
    pub fn addr(&self) -> i64 {
        self.0 as i64
    }
}

pub const MAP_OFFSET: i32 = 0;

pub mod map {
    pub const INSTANCE_SIZE_OFFSET: i32 = 8;
    pub const INSTANCE_TYPE_OFFSET: i32 = 12;
    pub const BIT_FIELD_OFFSET: i32 = 13;
    pub const BIT_FIELD2_OFFSET: i32 = 14;
    pub const BIT_FIELD3_OFFSET: i32 = 16;
    pub const PROTOTYPE_OFFSET: i32 = 24;
    pub const CONSTRUCTOR_OFFSET: i32 = 32;
    /// In the bit field: objects of this map pretend to be `undefined`.
    pub const IS_UNDETECTABLE: u8 = 1 << 4;
    /// In bit field 3: the map has been deprecated and its instances may migrate.
    pub const IS_DEPRECATED: u32 = 1 << 24;
}

pub mod heap_number {
    pub const VALUE_OFFSET: i32 = 8;
    pub const SIZE: i32 = 16;
    /// The upper word of the NaN that marks a hole in a double array.
    pub const HOLE_NAN_UPPER32: u32 = 0xFFF7_FFFF;
    pub const HOLE_NAN: u64 = 0xFFF7_FFFF_FFF7_FFFF;
    /// The quiet NaN that all NaNs stored into double arrays are canonicalised to.
    pub const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;
}

pub mod fixed_array {
    pub const LENGTH_OFFSET: i32 = 8;
    pub const HEADER_SIZE: i32 = 16;
}

pub mod js_object {
    pub const PROPERTIES_OFFSET: i32 = 8;
    pub const ELEMENTS_OFFSET: i32 = 16;
    pub const HEADER_SIZE: i32 = 24;
}

pub mod js_function {
    pub const SHARED_FUNCTION_INFO_OFFSET: i32 = 24;
    pub const CONTEXT_OFFSET: i32 = 32;
    pub const PROTOTYPE_OR_INITIAL_MAP_OFFSET: i32 = 40;
    pub const CODE_ENTRY_OFFSET: i32 = 48;
}

pub mod shared_function_info {
    pub const INSTANCE_CLASS_NAME_OFFSET: i32 = 16;
    /// A formal parameter count that means "never adapt arguments".
    pub const DONT_ADAPT_ARGUMENTS_SENTINEL: i32 = -1;
}

pub mod string {
    /// The length, as a smi.
    pub const LENGTH_OFFSET: i32 = 8;
}

pub mod global_object {
    pub const GLOBAL_PROXY_OFFSET: i32 = 32;
}

pub mod cell {
    pub const VALUE_OFFSET: i32 = 8;
}

/// Contexts are fixed arrays with a few well-known leading slots.
pub mod context {
    use super::{fixed_array, POINTER_SIZE};

    pub const CLOSURE_INDEX: usize = 0;
    pub const PREVIOUS_INDEX: usize = 1;
    pub const EXTENSION_INDEX: usize = 2;
    pub const GLOBAL_OBJECT_INDEX: usize = 3;
    pub const MIN_CONTEXT_SLOTS: usize = 4;

    /// The untagged offset of context slot `idx`.
    pub fn slot_offset(idx: usize) -> i32 {
        fixed_array::HEADER_SIZE + i32::try_from(idx).unwrap() * POINTER_SIZE
    }
}

/// Memory pages are aligned to this and carry flags in their header.
pub mod page {
    pub const ALIGNMENT_MASK: i32 = !((1 << 20) - 1);
    pub const FLAGS_OFFSET: i32 = 8;
    pub const POINTERS_TO_HERE_ARE_INTERESTING: i32 = 1 << 1;
    pub const POINTERS_FROM_HERE_ARE_INTERESTING: i32 = 1 << 2;
    pub const IN_NEW_SPACE: i32 = (1 << 3) | (1 << 4);
    /// Bigger objects live in large object space, which has no inline allocation path.
    pub const MAX_REGULAR_HEAP_OBJECT_SIZE: i32 = 507_136;
}

/// Standard frame layout, relative to the frame pointer.
pub mod frame {
    pub const CALLER_PC_OFFSET: i32 = 8;
    pub const CALLER_FP_OFFSET: i32 = 0;
    pub const CONTEXT_OFFSET: i32 = -8;
    /// Holds the function in JS frames and the frame type marker in stub frames.
    pub const MARKER_OFFSET: i32 = -16;
    pub const FIXED_FRAME_SIZE_FROM_FP: i32 = 16;
    /// The smi payload of the marker of a stub frame.
    pub const STUB_MARKER: i32 = 4;
    /// The smi payload of the marker of an arguments adaptor frame.
    pub const ARGUMENTS_ADAPTOR_MARKER: i32 = 8;
}

/// Written into every freshly reserved stack slot when debug code is enabled.
pub const SLOTS_ZAP_VALUE: i64 = 0xbeef_deef_beef_deef_u64 as i64;
/// Written into registers a write barrier has consumed when debug code is enabled.
pub const ZAP_VALUE: i64 = 0xdead_beed_bead_beef_u64 as i64;

/// Instance types. Strings come first, so "is a string" is `type < FIRST_NONSTRING_TYPE`, and
/// spec objects come last, so "is an object" is `type >= FIRST_SPEC_OBJECT_TYPE`.
pub mod instance_type {
    pub const INTERNALIZED_STRING: u8 = 0x00;
    pub const STRING: u8 = 0x40;
    pub const FIRST_NONSTRING_TYPE: u8 = 0x80;
    pub const SYMBOL: u8 = 0x80;
    pub const HEAP_NUMBER: u8 = 0x81;
    pub const ODDBALL: u8 = 0x83;
    pub const MAP: u8 = 0x84;
    pub const FIXED_ARRAY: u8 = 0x90;
    pub const FIXED_DOUBLE_ARRAY: u8 = 0x91;
    pub const FIRST_SPEC_OBJECT_TYPE: u8 = 0xB0;
    pub const FIRST_NONCALLABLE_SPEC_OBJECT_TYPE: u8 = 0xB0;
    pub const JS_OBJECT: u8 = 0xB8;
    pub const JS_ARRAY: u8 = 0xBA;
    pub const LAST_NONCALLABLE_SPEC_OBJECT_TYPE: u8 = 0xFD;
    pub const JS_FUNCTION_PROXY: u8 = 0xFE;
    pub const JS_FUNCTION: u8 = 0xFF;
    pub const LAST_SPEC_OBJECT_TYPE: u8 = 0xFF;
    pub const LAST_TYPE: u8 = 0xFF;
}

/// The well-known objects reachable from the root register.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
pub enum RootIndex {
    UndefinedValue,
    NullValue,
    TheHoleValue,
    TrueValue,
    FalseValue,
    HeapNumberMap,
    FixedArrayMap,
    FixedDoubleArrayMap,
    OnePointerFillerMap,
    TwoPointerFillerMap,
    StackLimit,
    EmptyFixedArray,
}

impl RootIndex {
    /// The offset of this root from the root register.
    pub fn offset(self) -> i32 {
        i32::from(self as u8) * POINTER_SIZE
    }
}

/// How elements of an array are stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElementsKind {
    FastSmi,
    Fast,
    FastDouble,
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl ElementsKind {
    /// log2 of the element size in bytes.
    pub fn size_log2(self) -> u8 {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped => 0,
            Self::Int16 | Self::Uint16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::FastSmi | Self::Fast | Self::FastDouble | Self::Float64 => 3,
        }
    }

    /// Are elements raw (non-tagged) data in an external backing store?
    pub fn is_external(self) -> bool {
        !matches!(self, Self::FastSmi | Self::Fast | Self::FastDouble)
    }

    pub fn is_double(self) -> bool {
        matches!(self, Self::FastDouble | Self::Float64 | Self::Float32)
    }
}
