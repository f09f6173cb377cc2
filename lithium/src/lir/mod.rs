//! The low-level IR ("LIR") consumed by the backend.
//!
//! A [Chunk] is produced by the (external) register allocator: every [Operand] is already a
//! concrete register, stack slot, or constant pool entry. The backend only reads the chunk.
//!
//! Instructions are a closed sum type ([Inst]). Each variant carries the operands it needs and
//! the flags of the high-level value it was lowered from.

use crate::{
    heap::{ElementsKind, Handle, RootIndex},
    runtime::{AllocSpace, BailoutType, RuntimeFunction, Stub},
};
use index_vec::IndexVec;
use std::fmt;
use strum::Display;

mod env;
pub use env::{EnvArena, EnvIdx, EnvValue, Environment, FrameType, ObjectMapping, ValueTag};

index_vec::define_index_type! {
    /// A basic block. Blocks are emitted in index order.
    pub struct BlockIdx = u32;
}

index_vec::define_index_type! {
    /// An index into a [Chunk]'s constant pool.
    pub struct ConstIdx = u32;
}

/// An AST id used to find the unoptimised code's resumption point. -1 if there is none.
pub type BailoutId = i32;
pub const NO_BAILOUT_ID: BailoutId = -1;

/// Where a value lives after register allocation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operand {
    /// A general purpose register, by allocation index.
    Register(u8),
    /// A double register, by allocation index.
    DoubleRegister(u8),
    /// A spill slot. Negative indices are incoming parameters.
    StackSlot(i32),
    DoubleStackSlot(i32),
    Constant(ConstIdx),
}

impl Operand {
    pub fn is_register(&self) -> bool {
        matches!(self, Self::Register(_))
    }

    pub fn is_double_register(&self) -> bool {
        matches!(self, Self::DoubleRegister(_))
    }

    pub fn is_stack_slot(&self) -> bool {
        matches!(self, Self::StackSlot(_))
    }

    pub fn is_double_stack_slot(&self) -> bool {
        matches!(self, Self::DoubleStackSlot(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(x) => write!(f, "r{x}"),
            Self::DoubleRegister(x) => write!(f, "d{x}"),
            Self::StackSlot(x) => write!(f, "[stack:{x}]"),
            Self::DoubleStackSlot(x) => write!(f, "[double_stack:{x}]"),
            Self::Constant(x) => write!(f, "[constant:{}]", x.index()),
        }
    }
}

/// How a value is represented in machine terms.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum Representation {
    Int32,
    Smi,
    Double,
    Tagged,
    HeapObject,
    External,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstValue {
    Int32(i32),
    Double(f64),
    Object(Handle),
}

/// A constant pool entry. The representation is the one the optimiser chose for the literal and
/// is never re-inferred by the backend.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Constant {
    pub value: ConstValue,
    pub repr: Representation,
}

impl Constant {
    pub fn int32(v: i32) -> Self {
        Self {
            value: ConstValue::Int32(v),
            repr: Representation::Int32,
        }
    }

    pub fn smi(v: i32) -> Self {
        Self {
            value: ConstValue::Int32(v),
            repr: Representation::Smi,
        }
    }

    pub fn double(v: f64) -> Self {
        Self {
            value: ConstValue::Double(v),
            repr: Representation::Double,
        }
    }

    pub fn object(h: Handle) -> Self {
        Self {
            value: ConstValue::Object(h),
            repr: Representation::Tagged,
        }
    }

    /// The integer value of this constant, if it has one. Integral doubles count.
    pub fn integer_value(&self) -> Option<i32> {
        match self.value {
            ConstValue::Int32(x) => Some(x),
            ConstValue::Double(d) => {
                let i = d as i32;
                (f64::from(i) == d && !(d == 0.0 && d.is_sign_negative())).then_some(i)
            }
            ConstValue::Object(_) => None,
        }
    }

    pub fn number_value(&self) -> Option<f64> {
        match self.value {
            ConstValue::Int32(x) => Some(f64::from(x)),
            ConstValue::Double(d) => Some(d),
            ConstValue::Object(_) => None,
        }
    }
}

/// A parallel move. All sources are read before any destination is written.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Move {
    pub dst: Operand,
    pub src: Operand,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Targets {
    pub true_block: BlockIdx,
    pub false_block: BlockIdx,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LabelKind {
    Plain,
    LoopHeader,
    OsrEntry,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackCheckKind {
    FunctionEntry,
    BackEdge,
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    /// Evaluate the comparison on two known numbers. NaN compares unequal to everything.
    pub fn eval(self, l: f64, r: f64) -> bool {
        match self {
            Self::Eq => l == r,
            Self::Ne => l != r,
            Self::Lt => l < r,
            Self::Gt => l > r,
            Self::Le => l <= r,
            Self::Ge => l >= r,
        }
    }

    /// The comparison that holds when the operands are swapped.
    pub fn commute(self) -> Self {
        match self {
            Self::Eq | Self::Ne => self,
            Self::Lt => Self::Gt,
            Self::Gt => Self::Lt,
            Self::Le => Self::Ge,
            Self::Ge => Self::Le,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum BitOp {
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ShiftOp {
    Sar,
    Shr,
    Shl,
    Ror,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum MinMaxOp {
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Flags copied from the high-level value an arithmetic instruction was lowered from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArithFlags {
    pub can_overflow: bool,
    pub bailout_on_minus_zero: bool,
    pub can_be_div_by_zero: bool,
    /// Every use truncates the result to an int32, so inexact results are fine.
    pub all_uses_truncating: bool,
    pub left_can_be_negative: bool,
    pub left_can_be_min_int: bool,
    pub left_can_be_positive: bool,
    pub right_can_be_negative: bool,
}

impl ArithFlags {
    /// Every check enabled: the most conservative lowering.
    pub fn checked() -> Self {
        Self {
            can_overflow: true,
            bailout_on_minus_zero: true,
            can_be_div_by_zero: true,
            all_uses_truncating: false,
            left_can_be_negative: true,
            left_can_be_min_int: true,
            left_can_be_positive: true,
            right_can_be_negative: true,
        }
    }
}

/// A named field of a heap object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FieldAccess {
    /// The untagged offset of the field, either in the object or in its properties backing
    /// store.
    pub offset: i32,
    pub in_object: bool,
    /// `Int32` means an int32 stored as a smi, read and written through the smi's upper half.
    pub repr: Representation,
}

/// What a store must do to keep the collector's remembered set up to date.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteBarrier {
    /// The stored value can't be a new-space heap object.
    Omit,
    /// Emit a barrier. If `smi_check` is set the value may be a smi, which needs no barrier.
    Emit { smi_check: bool },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HoleCheck {
    None,
    /// Deoptimise on reading (or overwriting) the hole.
    Deopt,
    /// Load: replace the hole with `undefined`. Store: only store over the hole.
    Soft,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceTypeCheck {
    /// `first <= type <= last`.
    Interval { first: u8, last: u8 },
    /// `type & mask == tag`.
    MaskAndTag { mask: u8, tag: u8 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocFlags {
    pub space: AllocSpace,
    pub double_align: bool,
    /// Fill the allocation with one-pointer filler maps so the heap stays iterable before the
    /// object is initialised.
    pub prefill_with_filler: bool,
}

/// An LIR opcode with its operands.
///
/// Register conventions the register allocator must honour are noted per variant; the backend
/// asserts them.
#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    Label {
        block: BlockIdx,
        kind: LabelKind,
    },
    Gap {
        moves: Vec<Move>,
    },
    Goto {
        block: BlockIdx,
    },
    Branch {
        value: Operand,
        repr: Representation,
        targets: Targets,
    },
    Parameter,
    UnknownOsrValue,
    OsrEntry,
    StackCheck {
        kind: StackCheckKind,
    },
    LazyBailout,
    Deoptimize {
        kind: BailoutType,
        reason: &'static str,
    },
    /// `value` must be `rax`. `parameter_count` is a constant or a register holding a smi.
    Return {
        value: Operand,
        parameter_count: Operand,
    },
    Dummy,
    DummyUse {
        value: Operand,
    },

    ConstantI {
        result: Operand,
        value: i32,
    },
    ConstantS {
        result: Operand,
        value: i32,
    },
    ConstantD {
        result: Operand,
        value: f64,
    },
    ConstantT {
        result: Operand,
        value: Handle,
    },

    /// `result` must equal `left` unless the addition can't overflow.
    AddI {
        result: Operand,
        left: Operand,
        right: Operand,
        flags: ArithFlags,
    },
    /// `result` must equal `left`.
    SubI {
        result: Operand,
        left: Operand,
        right: Operand,
        flags: ArithFlags,
    },
    /// `result` must equal `left`.
    MulI {
        result: Operand,
        left: Operand,
        right: Operand,
        flags: ArithFlags,
    },
    /// `dividend` and `result` must be `rax`; `rdx` is clobbered.
    DivI {
        result: Operand,
        dividend: Operand,
        divisor: Operand,
        flags: ArithFlags,
    },
    /// `result` must differ from `dividend`.
    DivByPowerOf2I {
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    },
    /// `result` must be `rdx`; `rax` is clobbered. `dividend` must be neither. Unless it is zero,
    /// `|divisor|` must be at least 2 and below 2^31.
    DivByConstI {
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    },
    /// `dividend` and `result` must be `rax`; `rdx` is clobbered.
    FlooringDivI {
        result: Operand,
        dividend: Operand,
        divisor: Operand,
        flags: ArithFlags,
    },
    /// `result` must equal `dividend`.
    FlooringDivByPowerOf2I {
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    },
    /// `result` must be `rdx`; `rax` is clobbered. `dividend` must be neither. `temp` is needed
    /// unless the dividend's sign matches the divisor's. `divisor` is restricted as for
    /// [Inst::DivByConstI].
    FlooringDivByConstI {
        result: Operand,
        dividend: Operand,
        divisor: i32,
        temp: Option<Operand>,
        flags: ArithFlags,
    },
    /// `dividend` must be `rax` and `result` `rdx`.
    ModI {
        result: Operand,
        dividend: Operand,
        divisor: Operand,
        flags: ArithFlags,
    },
    /// `result` must equal `dividend`.
    ModByPowerOf2I {
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    },
    /// `result` must be `rax`; `rdx` is clobbered. `dividend` must be neither. `divisor` is
    /// restricted as for [Inst::DivByConstI].
    ModByConstI {
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    },
    /// `result` must equal `left`.
    BitI {
        op: BitOp,
        result: Operand,
        left: Operand,
        right: Operand,
    },
    /// `result` must equal `left`. A non-constant `right` must be `rcx`.
    ShiftI {
        op: ShiftOp,
        result: Operand,
        left: Operand,
        right: Operand,
        can_deopt: bool,
    },
    /// `result` must equal `left`.
    MathMinMax {
        op: MinMaxOp,
        repr: Representation,
        result: Operand,
        left: Operand,
        right: Operand,
    },
    /// `result` must equal `value`.
    MathAbs {
        repr: Representation,
        result: Operand,
        value: Operand,
    },
    MathClz32 {
        result: Operand,
        value: Operand,
    },
    MathSqrt {
        result: Operand,
        value: Operand,
    },
    /// `result` must equal `left`. `Mod` calls out to C: `left` must be `xmm0`, `right` `xmm1`
    /// and `result` `xmm0`.
    ArithmeticD {
        op: ArithOp,
        result: Operand,
        left: Operand,
        right: Operand,
    },

    CompareNumericAndBranch {
        op: CompareOp,
        repr: Representation,
        left: Operand,
        right: Operand,
        is_unsigned: bool,
        targets: Targets,
    },
    CmpObjectEqAndBranch {
        left: Operand,
        right: Operand,
        targets: Targets,
    },
    CmpHoleAndBranch {
        repr: Representation,
        value: Operand,
        targets: Targets,
    },
    CompareMinusZeroAndBranch {
        repr: Representation,
        value: Operand,
        targets: Targets,
    },
    IsObjectAndBranch {
        value: Operand,
        targets: Targets,
    },
    IsStringAndBranch {
        value: Operand,
        value_is_heap_object: bool,
        targets: Targets,
    },
    IsSmiAndBranch {
        value: Operand,
        targets: Targets,
    },
    IsUndetectableAndBranch {
        value: Operand,
        value_is_heap_object: bool,
        targets: Targets,
    },
    HasInstanceTypeAndBranch {
        value: Operand,
        first: u8,
        last: u8,
        value_is_heap_object: bool,
        targets: Targets,
    },
    /// Compare the class name of `value` with `class_name`. `temp` and `temp2` are clobbered.
    ClassOfTestAndBranch {
        value: Operand,
        temp: Operand,
        temp2: Operand,
        class_name: Handle,
        /// The class name is "Function".
        is_function_class: bool,
        /// The class name is "Object".
        is_object_class: bool,
        targets: Targets,
    },
    CmpMapAndBranch {
        value: Operand,
        map: Handle,
        targets: Targets,
    },
    /// Generic comparison through the compare stub: `left` in `rdx`, `right` in `rax`, result
    /// (true or false object) in `rax`.
    CmpT {
        op: CompareOp,
        result: Operand,
        left: Operand,
        right: Operand,
    },
    /// `left` in `rax`, `right` in `rdx`, result in `rax`.
    InstanceOf {
        result: Operand,
        left: Operand,
        right: Operand,
    },
    /// `value` in `rax`, result in `rax`.
    InstanceOfKnownGlobal {
        result: Operand,
        value: Operand,
        temp: Operand,
        function: Handle,
    },

    LoadRoot {
        result: Operand,
        index: RootIndex,
    },
    LoadNamedField {
        result: Operand,
        object: Operand,
        access: FieldAccess,
    },
    /// `temp` is needed for out-of-object stores and write barriers. A map barrier also needs
    /// `map_temp`.
    StoreNamedField {
        object: Operand,
        value: Operand,
        temp: Option<Operand>,
        map_temp: Option<Operand>,
        access: FieldAccess,
        transition: Option<Handle>,
        barrier: WriteBarrier,
        map_barrier: bool,
    },
    LoadContextSlot {
        result: Operand,
        context: Operand,
        slot: usize,
        hole_check: HoleCheck,
    },
    StoreContextSlot {
        context: Operand,
        value: Operand,
        temp: Operand,
        slot: usize,
        hole_check: HoleCheck,
        barrier: WriteBarrier,
    },
    LoadGlobalCell {
        result: Operand,
        cell: Handle,
        requires_hole_check: bool,
    },
    /// `temp` is needed for the hole check.
    StoreGlobalCell {
        value: Operand,
        cell: Handle,
        temp: Option<Operand>,
        requires_hole_check: bool,
    },
    /// `key` is an int32 register or constant. `base_offset` is added to the element address.
    LoadKeyed {
        result: Operand,
        elements: Operand,
        key: Operand,
        kind: ElementsKind,
        base_offset: i32,
        requires_hole_check: bool,
    },
    /// With a write barrier, `key` must be a register the store may clobber.
    StoreKeyed {
        elements: Operand,
        key: Operand,
        value: Operand,
        kind: ElementsKind,
        base_offset: i32,
        barrier: WriteBarrier,
        canonicalize_nan: bool,
    },
    BoundsCheck {
        index: Operand,
        length: Operand,
        allow_equality: bool,
        skip_check: bool,
    },

    CallRuntime {
        function: RuntimeFunction,
        save_doubles: bool,
    },
    CallStub {
        stub: Stub,
    },
    /// Callee closure in `rdi`, arguments pushed.
    CallKnownFunction {
        function: Handle,
        formal_parameter_count: i32,
        argc: i32,
    },
    /// Callee in `rdi`, arguments pushed.
    CallFunction {
        argc: usize,
    },
    PushArgument {
        value: Operand,
    },
    Drop {
        count: i32,
    },

    Allocate {
        result: Operand,
        size: Operand,
        temp: Operand,
        flags: AllocFlags,
    },

    Integer32ToDouble {
        result: Operand,
        value: Operand,
    },
    Uint32ToDouble {
        result: Operand,
        value: Operand,
    },
    /// `result` must equal `value`.
    NumberTagI {
        result: Operand,
        value: Operand,
    },
    /// `result` must equal `value`. `temp` is a general purpose register, `temp2` a double one.
    NumberTagU {
        result: Operand,
        value: Operand,
        temp: Operand,
        temp2: Operand,
    },
    NumberTagD {
        result: Operand,
        value: Operand,
        temp: Operand,
    },
    /// `result` must equal `value`.
    SmiTag {
        result: Operand,
        value: Operand,
    },
    /// `result` must equal `value`.
    SmiUntag {
        result: Operand,
        value: Operand,
        needs_check: bool,
    },
    NumberUntagD {
        result: Operand,
        value: Operand,
        convert_undefined_to_nan: bool,
        deopt_on_minus_zero: bool,
    },
    /// `result` must equal `value`. `temp` is a double register.
    TaggedToI {
        result: Operand,
        value: Operand,
        temp: Operand,
        truncating: bool,
        bailout_on_minus_zero: bool,
    },
    DoubleToI {
        result: Operand,
        value: Operand,
        truncating: bool,
        bailout_on_minus_zero: bool,
    },

    CheckSmi {
        value: Operand,
    },
    CheckNonSmi {
        value: Operand,
    },
    CheckInstanceType {
        value: Operand,
        check: InstanceTypeCheck,
    },
    CheckValue {
        value: Operand,
        object: Handle,
    },
    CheckMaps {
        value: Operand,
        maps: Vec<Handle>,
        has_migration_target: bool,
    },
}

impl Inst {
    /// Does this instruction call out of the generated code?
    pub fn is_call(&self) -> bool {
        match self {
            Self::CallRuntime { .. }
            | Self::CallStub { .. }
            | Self::CallKnownFunction { .. }
            | Self::CallFunction { .. }
            | Self::CmpT { .. }
            | Self::InstanceOf { .. } => true,
            Self::StackCheck { kind } => *kind == StackCheckKind::FunctionEntry,
            Self::ArithmeticD { op, .. } => *op == ArithOp::Mod,
            _ => false,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. } | Self::Label { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Label { .. } => "label",
            Self::Gap { .. } => "gap",
            Self::Goto { .. } => "goto",
            Self::Branch { .. } => "branch",
            Self::Parameter => "parameter",
            Self::UnknownOsrValue => "unknown-osr-value",
            Self::OsrEntry => "osr-entry",
            Self::StackCheck { .. } => "stack-check",
            Self::LazyBailout => "lazy-bailout",
            Self::Deoptimize { .. } => "deoptimize",
            Self::Return { .. } => "return",
            Self::Dummy => "dummy",
            Self::DummyUse { .. } => "dummy-use",
            Self::ConstantI { .. } => "constant-i",
            Self::ConstantS { .. } => "constant-s",
            Self::ConstantD { .. } => "constant-d",
            Self::ConstantT { .. } => "constant-t",
            Self::AddI { .. } => "add-i",
            Self::SubI { .. } => "sub-i",
            Self::MulI { .. } => "mul-i",
            Self::DivI { .. } => "div-i",
            Self::DivByPowerOf2I { .. } => "div-by-power-of-2-i",
            Self::DivByConstI { .. } => "div-by-const-i",
            Self::FlooringDivI { .. } => "flooring-div-i",
            Self::FlooringDivByPowerOf2I { .. } => "flooring-div-by-power-of-2-i",
            Self::FlooringDivByConstI { .. } => "flooring-div-by-const-i",
            Self::ModI { .. } => "mod-i",
            Self::ModByPowerOf2I { .. } => "mod-by-power-of-2-i",
            Self::ModByConstI { .. } => "mod-by-const-i",
            Self::BitI { .. } => "bit-i",
            Self::ShiftI { .. } => "shift-i",
            Self::MathMinMax { .. } => "math-min-max",
            Self::MathAbs { .. } => "math-abs",
            Self::MathClz32 { .. } => "math-clz32",
            Self::MathSqrt { .. } => "math-sqrt",
            Self::ArithmeticD { .. } => "arithmetic-d",
            Self::CompareNumericAndBranch { .. } => "compare-numeric-and-branch",
            Self::CmpObjectEqAndBranch { .. } => "cmp-object-eq-and-branch",
            Self::CmpHoleAndBranch { .. } => "cmp-hole-and-branch",
            Self::CompareMinusZeroAndBranch { .. } => "cmp-minus-zero-and-branch",
            Self::IsObjectAndBranch { .. } => "is-object-and-branch",
            Self::IsStringAndBranch { .. } => "is-string-and-branch",
            Self::IsSmiAndBranch { .. } => "is-smi-and-branch",
            Self::IsUndetectableAndBranch { .. } => "is-undetectable-and-branch",
            Self::HasInstanceTypeAndBranch { .. } => "has-instance-type-and-branch",
            Self::ClassOfTestAndBranch { .. } => "class-of-test-and-branch",
            Self::CmpMapAndBranch { .. } => "cmp-map-and-branch",
            Self::CmpT { .. } => "cmp-t",
            Self::InstanceOf { .. } => "instance-of",
            Self::InstanceOfKnownGlobal { .. } => "instance-of-known-global",
            Self::LoadRoot { .. } => "load-root",
            Self::LoadNamedField { .. } => "load-named-field",
            Self::StoreNamedField { .. } => "store-named-field",
            Self::LoadContextSlot { .. } => "load-context-slot",
            Self::StoreContextSlot { .. } => "store-context-slot",
            Self::LoadGlobalCell { .. } => "load-global-cell",
            Self::StoreGlobalCell { .. } => "store-global-cell",
            Self::LoadKeyed { .. } => "load-keyed",
            Self::StoreKeyed { .. } => "store-keyed",
            Self::BoundsCheck { .. } => "bounds-check",
            Self::CallRuntime { .. } => "call-runtime",
            Self::CallStub { .. } => "call-stub",
            Self::CallKnownFunction { .. } => "call-known-function",
            Self::CallFunction { .. } => "call-function",
            Self::PushArgument { .. } => "push-argument",
            Self::Drop { .. } => "drop",
            Self::Allocate { .. } => "allocate",
            Self::Integer32ToDouble { .. } => "int32-to-double",
            Self::Uint32ToDouble { .. } => "uint32-to-double",
            Self::NumberTagI { .. } => "number-tag-i",
            Self::NumberTagU { .. } => "number-tag-u",
            Self::NumberTagD { .. } => "number-tag-d",
            Self::SmiTag { .. } => "smi-tag",
            Self::SmiUntag { .. } => "smi-untag",
            Self::NumberUntagD { .. } => "number-untag-d",
            Self::TaggedToI { .. } => "tagged-to-i",
            Self::DoubleToI { .. } => "double-to-i",
            Self::CheckSmi { .. } => "check-smi",
            Self::CheckNonSmi { .. } => "check-non-smi",
            Self::CheckInstanceType { .. } => "check-instance-type",
            Self::CheckValue { .. } => "check-value",
            Self::CheckMaps { .. } => "check-maps",
        }
    }
}

/// The tagged values live across a safepoint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointerMap {
    operands: Vec<Operand>,
}

impl PointerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, op: Operand) {
        // Constants are never moved by the collector.
        if !op.is_constant() {
            self.operands.push(op);
        }
    }

    /// The live operands, each appearing once, in first-recorded order.
    pub fn normalized_operands(&self) -> Vec<Operand> {
        let mut out: Vec<Operand> = Vec::with_capacity(self.operands.len());
        for op in &self.operands {
            if !out.contains(op) {
                out.push(*op);
            }
        }
        out
    }
}

impl<const N: usize> From<[Operand; N]> for PointerMap {
    fn from(ops: [Operand; N]) -> Self {
        let mut pm = Self::new();
        for op in ops {
            pm.record(op);
        }
        pm
    }
}

/// An instruction plus the side information the backend needs for it.
#[derive(Clone, Debug, PartialEq)]
pub struct LInstruction {
    pub inst: Inst,
    /// The frame state to deoptimise to, if this instruction can deoptimise.
    pub env: Option<EnvIdx>,
    /// The live tagged values, if this instruction can reach a safepoint.
    pub pointer_map: Option<PointerMap>,
    pub position: Option<u32>,
}

impl LInstruction {
    pub fn new(inst: Inst) -> Self {
        Self {
            inst,
            env: None,
            pointer_map: None,
            position: None,
        }
    }

    pub fn with_env(mut self, env: EnvIdx) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_pointer_map(mut self, pm: PointerMap) -> Self {
        self.pointer_map = Some(pm);
        self
    }

    pub fn with_position(mut self, pos: u32) -> Self {
        self.position = Some(pos);
        self
    }
}

impl From<Inst> for LInstruction {
    fn from(inst: Inst) -> Self {
        Self::new(inst)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodeKind {
    OptimizedFunction,
    Stub,
}

/// Facts about the function being compiled.
#[derive(Clone, Debug, PartialEq)]
pub struct CompilationInfo {
    pub kind: CodeKind,
    /// The closure being compiled. `None` for stubs.
    pub closure: Option<Handle>,
    pub shared_info: Option<Handle>,
    pub strict: bool,
    pub native: bool,
    pub this_has_uses: bool,
    /// Excluding the receiver.
    pub num_parameters: usize,
    /// The size of the function's local context, including the fixed slots. Zero if the
    /// function needs no local context.
    pub num_heap_slots: usize,
    /// `(parameter index, context slot)` for parameters that live in the local context.
    pub context_parameters: Vec<(usize, usize)>,
    pub saves_caller_doubles: bool,
    pub optimization_id: i32,
    pub osr_ast_id: BailoutId,
    /// Does any non-deferred code call out?
    pub non_deferred_calling: bool,
    /// Does any deferred code call out?
    pub deferred_calling: bool,
    /// A stub that must build a frame even if it has no spill slots.
    pub requires_frame: bool,
}

impl CompilationInfo {
    pub fn function(closure: Handle, num_parameters: usize) -> Self {
        Self {
            kind: CodeKind::OptimizedFunction,
            closure: Some(closure),
            shared_info: None,
            strict: true,
            native: false,
            this_has_uses: false,
            num_parameters,
            num_heap_slots: 0,
            context_parameters: Vec::new(),
            saves_caller_doubles: false,
            optimization_id: 0,
            osr_ast_id: NO_BAILOUT_ID,
            non_deferred_calling: false,
            deferred_calling: false,
            requires_frame: false,
        }
    }

    pub fn stub() -> Self {
        Self {
            kind: CodeKind::Stub,
            closure: None,
            strict: true,
            ..Self::function(Handle(0), 0)
        }
    }

    pub fn is_stub(&self) -> bool {
        self.kind == CodeKind::Stub
    }

    pub fn is_optimizing(&self) -> bool {
        self.kind == CodeKind::OptimizedFunction
    }

    pub fn is_osr(&self) -> bool {
        self.osr_ast_id != NO_BAILOUT_ID
    }
}

/// The unit of code generation: one function's LIR.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub info: CompilationInfo,
    insts: Vec<LInstruction>,
    consts: IndexVec<ConstIdx, Constant>,
    envs: EnvArena,
    spill_slot_count: usize,
    num_blocks: usize,
    inlined_closures: Vec<Handle>,
    allocated_double_registers: Vec<u8>,
    osr_unoptimized_frame_slots: usize,
}

impl Chunk {
    pub fn new(info: CompilationInfo) -> Self {
        Self {
            info,
            insts: Vec::new(),
            consts: IndexVec::new(),
            envs: EnvArena::new(),
            spill_slot_count: 0,
            num_blocks: 0,
            inlined_closures: Vec::new(),
            allocated_double_registers: Vec::new(),
            osr_unoptimized_frame_slots: 0,
        }
    }

    pub fn insts(&self) -> &[LInstruction] {
        &self.insts
    }

    pub fn inst(&self, idx: usize) -> &LInstruction {
        &self.insts[idx]
    }

    pub fn push<I: Into<LInstruction>>(&mut self, inst: I) -> usize {
        self.insts.push(inst.into());
        self.insts.len() - 1
    }

    pub fn new_block(&mut self) -> BlockIdx {
        self.num_blocks += 1;
        BlockIdx::from_usize(self.num_blocks - 1)
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn add_const(&mut self, c: Constant) -> Operand {
        Operand::Constant(self.consts.push(c))
    }

    pub fn constant(&self, idx: ConstIdx) -> &Constant {
        &self.consts[idx]
    }

    pub fn envs(&self) -> &EnvArena {
        &self.envs
    }

    pub fn envs_mut(&mut self) -> &mut EnvArena {
        &mut self.envs
    }

    pub fn spill_slot_count(&self) -> usize {
        self.spill_slot_count
    }

    pub fn set_spill_slot_count(&mut self, n: usize) {
        self.spill_slot_count = n;
    }

    pub fn inlined_closures(&self) -> &[Handle] {
        &self.inlined_closures
    }

    pub fn add_inlined_closure(&mut self, h: Handle) {
        self.inlined_closures.push(h);
    }

    /// The double registers (by allocation index) the allocator used, in ascending order.
    pub fn allocated_double_registers(&self) -> &[u8] {
        &self.allocated_double_registers
    }

    pub fn mark_double_register_allocated(&mut self, idx: u8) {
        if let Err(i) = self.allocated_double_registers.binary_search(&idx) {
            self.allocated_double_registers.insert(i, idx);
        }
    }

    pub fn osr_unoptimized_frame_slots(&self) -> usize {
        self.osr_unoptimized_frame_slots
    }

    pub fn set_osr_unoptimized_frame_slots(&mut self, n: usize) {
        self.osr_unoptimized_frame_slots = n;
    }
}
