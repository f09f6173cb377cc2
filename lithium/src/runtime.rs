//! The services the managed runtime provides to the code generator: addresses of deoptimisation
//! entries, runtime functions, stubs and allocation pointers, and a handful of heap queries.

use crate::{heap::Handle, lir::CompareOp};
use strum::{Display, FromRepr};

/// How a deoptimisation is entered.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
pub enum BailoutType {
    /// Deoptimise immediately at a guard.
    Eager,
    /// Deoptimise when a call returns into this code after the code was invalidated.
    Lazy,
    /// An eager deoptimisation caused by insufficient type feedback.
    Soft,
}

/// The memory spaces the inline allocator can bump-allocate in. The discriminant is the space id
/// the runtime allocator expects.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum AllocSpace {
    New,
    OldPointer,
    OldData,
}

/// Functions implemented by the runtime and reached through the C entry stub.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum RuntimeFunction {
    TraceEnter,
    TraceExit,
    NewFunctionContext,
    StackGuard,
    AllocateHeapNumber,
    AllocateInTargetSpace,
    TryMigrateInstance,
}

impl RuntimeFunction {
    /// The number of arguments the function takes from the stack.
    pub fn arity(self) -> i32 {
        match self {
            Self::TraceEnter | Self::StackGuard | Self::AllocateHeapNumber => 0,
            Self::TraceExit | Self::NewFunctionContext | Self::TryMigrateInstance => 1,
            Self::AllocateInTargetSpace => 2,
        }
    }
}

/// Out-of-line code stubs the generated code calls.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Stub {
    /// The gateway into C++ runtime functions.
    CEntry { save_doubles: bool },
    /// The stack guard builtin.
    StackCheck,
    FastNewContext { slots: usize },
    /// Write barrier slow path. Registers are given as x64 register codes.
    RecordWrite {
        object: u8,
        value: u8,
        address: u8,
        save_doubles: bool,
        remembered_set: bool,
    },
    InstanceOf { inline_check: bool },
    Compare { op: CompareOp },
    CallFunction { argc: usize },
    /// Adapts the actual argument count in `rax` to the formal count in `rbx`.
    ArgumentsAdaptor,
    /// Truncate the double at `[base + offset]` to an int32 in `destination` (register codes).
    DoubleToI { base: u8, offset: i32, destination: u8 },
}

/// Addresses of runtime data and C functions.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum ExternalRef {
    AllocationTop(AllocSpace),
    AllocationLimit(AllocSpace),
    /// The counter decremented by the deoptimisation stress mode.
    StressDeoptCounter,
    /// A C function computing `fmod(xmm0, xmm1)` into `xmm0`.
    DoubleFpMod,
}

pub trait Runtime {
    /// The address of deoptimisation entry `id` of kind `kind`, or `None` if the runtime hasn't
    /// prepared that many entries.
    fn deopt_entry(&self, id: usize, kind: BailoutType) -> Option<u64>;
    /// The inverse of [Runtime::deopt_entry].
    fn deopt_entry_id(&self, addr: u64, kind: BailoutType) -> Option<usize>;
    fn runtime_entry(&self, f: RuntimeFunction) -> u64;
    fn stub_entry(&self, stub: Stub) -> u64;
    fn external(&self, r: ExternalRef) -> u64;
    /// Allocate a fresh cell holding `value`, or the hole if there is none. Code embeds the cell
    /// rather than objects that may move.
    fn new_cell(&self, value: Option<Handle>) -> Handle;
    fn in_new_space(&self, obj: Handle) -> bool;
}

#[cfg(test)]
pub(crate) mod test_runtime {
    use super::*;
    use std::cell::Cell;

    pub(crate) const DEOPT_BASE: u64 = 0x7000_0000;
    const DEOPT_ENTRY_SIZE: u64 = 16;
    const CELL_BASE: u64 = 0x5000_0001;

    /// A runtime whose addresses are made up but stable, suitable for inspecting generated code
    /// without running it.
    pub(crate) struct TestRuntime {
        pub(crate) max_deopt_entries: usize,
        pub(crate) new_space: Vec<Handle>,
        cells: Cell<u64>,
    }

    impl TestRuntime {
        pub(crate) fn new() -> Self {
            Self {
                max_deopt_entries: 64,
                new_space: Vec::new(),
                cells: Cell::new(0),
            }
        }
    }

    impl Runtime for TestRuntime {
        fn deopt_entry(&self, id: usize, kind: BailoutType) -> Option<u64> {
            if id >= self.max_deopt_entries {
                return None;
            }
            Some(
                DEOPT_BASE
                    + u64::from(kind as u8) * 0x10000
                    + u64::try_from(id).unwrap() * DEOPT_ENTRY_SIZE,
            )
        }

        fn deopt_entry_id(&self, addr: u64, kind: BailoutType) -> Option<usize> {
            let base = DEOPT_BASE + u64::from(kind as u8) * 0x10000;
            let off = addr.checked_sub(base)?;
            if off % DEOPT_ENTRY_SIZE != 0 {
                return None;
            }
            let id = usize::try_from(off / DEOPT_ENTRY_SIZE).unwrap();
            (id < self.max_deopt_entries).then_some(id)
        }

        fn runtime_entry(&self, f: RuntimeFunction) -> u64 {
            0x6100_0000 + f as u64 * 0x100
        }

        fn stub_entry(&self, stub: Stub) -> u64 {
            match stub {
                Stub::CEntry { save_doubles } => 0x6200_0000 + u64::from(save_doubles),
                Stub::StackCheck => 0x6200_1000,
                Stub::FastNewContext { .. } => 0x6200_2000,
                Stub::RecordWrite { .. } => 0x6200_3000,
                Stub::InstanceOf { .. } => 0x6200_4000,
                Stub::Compare { .. } => 0x6200_5000,
                Stub::CallFunction { .. } => 0x6200_6000,
                Stub::ArgumentsAdaptor => 0x6200_7000,
                Stub::DoubleToI { .. } => 0x6200_8000,
            }
        }

        fn external(&self, r: ExternalRef) -> u64 {
            match r {
                ExternalRef::AllocationTop(_) => 0x6300_0000,
                ExternalRef::AllocationLimit(_) => 0x6300_0008,
                ExternalRef::StressDeoptCounter => 0x6300_0100,
                ExternalRef::DoubleFpMod => 0x6300_1000,
            }
        }

        fn new_cell(&self, _value: Option<Handle>) -> Handle {
            let n = self.cells.get();
            self.cells.set(n + 1);
            Handle(CELL_BASE + n * 0x20)
        }

        fn in_new_space(&self, obj: Handle) -> bool {
            self.new_space.contains(&obj)
        }
    }

    #[test]
    fn deopt_entry_roundtrip() {
        let rt = TestRuntime::new();
        let a = rt.deopt_entry(3, BailoutType::Lazy).unwrap();
        assert_eq!(rt.deopt_entry_id(a, BailoutType::Lazy), Some(3));
        assert_eq!(rt.deopt_entry_id(a, BailoutType::Eager), None);
        assert_eq!(rt.deopt_entry(64, BailoutType::Eager), None);
    }
}
