//! Deoptimisation data: the serialised translations that describe how to rebuild unoptimised
//! frames from an optimised frame, and the per-code-object table that indexes them.
//!
//! A translation is a stream of signed variable-length integers. Each integer is encoded as
//! `bits = (|v| << 1) | is_negative`, emitted 7 bits at a time, least significant first, with
//! each byte being `(bits << 1) | more`.

use crate::{heap::Handle, lir::BailoutId};
use strum::{Display, FromRepr};

mod replay;
pub use replay::{
    FrameFunction, MachineSnapshot, ReplayError, TranslatedFrame, TranslatedFrameKind,
    TranslatedValue,
};

/// The literal id that stands for the function being compiled.
pub const SELF_LITERAL_ID: i32 = -239;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
pub enum Opcode {
    Begin,
    JsFrame,
    ConstructStubFrame,
    GetterStubFrame,
    SetterStubFrame,
    ArgumentsAdaptorFrame,
    CompiledStubFrame,
    DuplicatedObject,
    ArgumentsObject,
    CapturedObject,
    Register,
    Int32Register,
    Uint32Register,
    DoubleRegister,
    StackSlot,
    Int32StackSlot,
    Uint32StackSlot,
    DoubleStackSlot,
    Literal,
}

impl Opcode {
    /// The number of operands following this opcode.
    pub fn operand_count(self) -> usize {
        match self {
            Self::CompiledStubFrame => 0,
            Self::GetterStubFrame
            | Self::SetterStubFrame
            | Self::DuplicatedObject
            | Self::ArgumentsObject
            | Self::CapturedObject
            | Self::Register
            | Self::Int32Register
            | Self::Uint32Register
            | Self::DoubleRegister
            | Self::StackSlot
            | Self::Int32StackSlot
            | Self::Uint32StackSlot
            | Self::DoubleStackSlot
            | Self::Literal => 1,
            Self::Begin | Self::ConstructStubFrame | Self::ArgumentsAdaptorFrame => 2,
            Self::JsFrame => 3,
        }
    }

    pub fn begins_frame(self) -> bool {
        matches!(
            self,
            Self::JsFrame
                | Self::ConstructStubFrame
                | Self::GetterStubFrame
                | Self::SetterStubFrame
                | Self::ArgumentsAdaptorFrame
                | Self::CompiledStubFrame
        )
    }
}

/// All the translations of one code object, back to back.
#[derive(Debug, Default)]
pub struct TranslationBuffer {
    bytes: Vec<u8>,
}

impl TranslationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, v: i32) {
        let mut bits = (u64::from(v.unsigned_abs()) << 1) | u64::from(v < 0);
        loop {
            let next = bits >> 7;
            self.bytes
                .push((((bits << 1) & 0xFF) as u8) | u8::from(next != 0));
            bits = next;
            if bits == 0 {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A writer for one translation.
pub struct Translation<'a> {
    buf: &'a mut TranslationBuffer,
    index: usize,
}

impl<'a> Translation<'a> {
    pub fn begin(buf: &'a mut TranslationBuffer, frame_count: i32, js_frame_count: i32) -> Self {
        let index = buf.len();
        let mut t = Self { buf, index };
        t.op(Opcode::Begin, &[frame_count, js_frame_count]);
        t
    }

    /// The offset of this translation in its buffer.
    pub fn index(&self) -> usize {
        self.index
    }

    fn op(&mut self, op: Opcode, operands: &[i32]) {
        debug_assert_eq!(op.operand_count(), operands.len());
        self.buf.add(i32::from(op as u8));
        for x in operands {
            self.buf.add(*x);
        }
    }

    pub fn begin_js_frame(&mut self, ast_id: BailoutId, literal_id: i32, height: i32) {
        self.op(Opcode::JsFrame, &[ast_id, literal_id, height]);
    }

    pub fn begin_construct_stub_frame(&mut self, literal_id: i32, height: i32) {
        self.op(Opcode::ConstructStubFrame, &[literal_id, height]);
    }

    pub fn begin_getter_stub_frame(&mut self, literal_id: i32) {
        self.op(Opcode::GetterStubFrame, &[literal_id]);
    }

    pub fn begin_setter_stub_frame(&mut self, literal_id: i32) {
        self.op(Opcode::SetterStubFrame, &[literal_id]);
    }

    pub fn begin_arguments_adaptor_frame(&mut self, literal_id: i32, height: i32) {
        self.op(Opcode::ArgumentsAdaptorFrame, &[literal_id, height]);
    }

    pub fn begin_compiled_stub_frame(&mut self) {
        self.op(Opcode::CompiledStubFrame, &[]);
    }

    pub fn begin_arguments_object(&mut self, length: i32) {
        self.op(Opcode::ArgumentsObject, &[length]);
    }

    pub fn begin_captured_object(&mut self, length: i32) {
        self.op(Opcode::CapturedObject, &[length]);
    }

    pub fn duplicate_object(&mut self, object_index: i32) {
        self.op(Opcode::DuplicatedObject, &[object_index]);
    }

    pub fn store_register(&mut self, code: u8) {
        self.op(Opcode::Register, &[i32::from(code)]);
    }

    pub fn store_int32_register(&mut self, code: u8) {
        self.op(Opcode::Int32Register, &[i32::from(code)]);
    }

    pub fn store_uint32_register(&mut self, code: u8) {
        self.op(Opcode::Uint32Register, &[i32::from(code)]);
    }

    pub fn store_double_register(&mut self, code: u8) {
        self.op(Opcode::DoubleRegister, &[i32::from(code)]);
    }

    pub fn store_stack_slot(&mut self, slot: i32) {
        self.op(Opcode::StackSlot, &[slot]);
    }

    pub fn store_int32_stack_slot(&mut self, slot: i32) {
        self.op(Opcode::Int32StackSlot, &[slot]);
    }

    pub fn store_uint32_stack_slot(&mut self, slot: i32) {
        self.op(Opcode::Uint32StackSlot, &[slot]);
    }

    pub fn store_double_stack_slot(&mut self, slot: i32) {
        self.op(Opcode::DoubleStackSlot, &[slot]);
    }

    pub fn store_literal(&mut self, literal_id: i32) {
        self.op(Opcode::Literal, &[literal_id]);
    }
}

/// Reads a translation one integer at a time.
#[derive(Clone)]
pub struct TranslationIterator<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> TranslationIterator<'a> {
    pub fn new(bytes: &'a [u8], index: usize) -> Self {
        Self { bytes, index }
    }

    pub fn has_next(&self) -> bool {
        self.index < self.bytes.len()
    }

    /// Decode the next integer, or `None` if the stream ends mid-integer (or has ended).
    pub fn next_int(&mut self) -> Option<i32> {
        let mut bits = 0u64;
        let mut shift = 0;
        loop {
            let b = *self.bytes.get(self.index)?;
            self.index += 1;
            bits |= u64::from(b >> 1) << shift;
            shift += 7;
            if b & 1 == 0 {
                break;
            }
            if shift > 35 {
                return None;
            }
        }
        let mag = i64::try_from(bits >> 1).ok()?;
        i32::try_from(if bits & 1 == 1 { -mag } else { mag }).ok()
    }

    pub fn next_opcode(&mut self) -> Option<Opcode> {
        self.next_int()
            .and_then(|x| u8::try_from(x).ok())
            .and_then(Opcode::from_repr)
    }

    pub fn peek_opcode(&self) -> Option<Opcode> {
        self.clone().next_opcode()
    }
}

/// A deoptimisation literal. Literals are compared by identity.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Literal {
    Smi(i32),
    /// A heap number, by the bits of its value.
    Number(u64),
    Object(Handle),
}

/// One deoptimisation point.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeoptEntry {
    pub ast_id: BailoutId,
    pub translation_index: usize,
    pub arguments_stack_height: usize,
    /// The return address offset for lazy deoptimisation points, -1 otherwise.
    pub pc: i32,
}

/// The deoptimisation data attached to a code object.
#[derive(Debug, Default)]
pub struct DeoptimizationData {
    pub translations: Vec<u8>,
    /// The first `inlined_function_count` literals are the inlined closures.
    pub inlined_function_count: usize,
    pub optimization_id: i32,
    pub shared_info: Option<Handle>,
    pub literals: Vec<Literal>,
    pub osr_ast_id: BailoutId,
    pub osr_pc_offset: i32,
    pub entries: Vec<DeoptEntry>,
}

impl DeoptimizationData {
    pub fn translation(&self, entry: usize) -> TranslationIterator<'_> {
        TranslationIterator::new(&self.translations, self.entries[entry].translation_index)
    }

    /// Rebuild the frames of deoptimisation point `entry` from machine state `snap`.
    pub fn replay(
        &self,
        entry: usize,
        snap: &MachineSnapshot,
    ) -> Result<Vec<TranslatedFrame>, ReplayError> {
        replay::replay(self.translation(entry), &self.literals, snap)
    }
}
