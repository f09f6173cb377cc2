//! Resolving register allocated operands to machine locations.

use super::{Assemble, FP_REGS, GP_REGS, SCRATCH};
use crate::{
    compile::{BailoutReason, CompilationError},
    heap::{frame, Handle, POINTER_SIZE},
    lir::{ConstValue, Constant, Operand, Representation},
};
use dynasmrt::{
    dynasm,
    x64::{Rq, Rx},
    DynasmApi, Register as dynasmrtRegister,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Reg {
    GP(Rq),
    FP(Rx),
}

/// Where an operand lives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(super) enum Location {
    Register(Reg),
    /// `[base + disp]`.
    Memory { base: Rq, disp: i32 },
    Immediate(Constant),
}

impl Assemble<'_> {
    pub(super) fn resolve(&self, op: Operand) -> Location {
        match op {
            Operand::Register(i) => Location::Register(Reg::GP(GP_REGS[usize::from(i)])),
            Operand::DoubleRegister(i) => Location::Register(Reg::FP(FP_REGS[usize::from(i)])),
            Operand::StackSlot(i) | Operand::DoubleStackSlot(i) => {
                let (base, disp) = self.slot_address(i);
                Location::Memory { base, disp }
            }
            Operand::Constant(c) => Location::Immediate(*self.chunk.constant(c)),
        }
    }

    /// The address of spill slot `index`. Negative indices are incoming parameters.
    ///
    /// # Panics
    ///
    /// If a frameless stub addresses one of its own spill slots.
    fn slot_address(&self, index: i32) -> (Rq, i32) {
        if self.needs_eager_frame() {
            if index >= 0 {
                (
                    Rq::RBP,
                    -(index + 1) * POINTER_SIZE - frame::FIXED_FRAME_SIZE_FROM_FP,
                )
            } else {
                // Skip the return address and the saved frame pointer.
                (Rq::RBP, -(index + 1) * POINTER_SIZE + 2 * POINTER_SIZE)
            }
        } else {
            assert!(index < 0, "Frameless code can't use spill slot {index}");
            // Skip the return address.
            (Rq::RSP, -(index + 1) * POINTER_SIZE + POINTER_SIZE)
        }
    }

    /// # Panics
    ///
    /// If `op` isn't a general purpose register.
    pub(super) fn to_register(&self, op: Operand) -> Rq {
        match self.resolve(op) {
            Location::Register(Reg::GP(r)) => r,
            _ => panic!("{op} is not a general purpose register"),
        }
    }

    /// # Panics
    ///
    /// If `op` isn't a double register.
    pub(super) fn to_double_register(&self, op: Operand) -> Rx {
        match self.resolve(op) {
            Location::Register(Reg::FP(r)) => r,
            _ => panic!("{op} is not a double register"),
        }
    }

    /// # Panics
    ///
    /// If `op` isn't a stack slot.
    pub(super) fn to_memory(&self, op: Operand) -> (Rq, i32) {
        match self.resolve(op) {
            Location::Memory { base, disp } => (base, disp),
            _ => panic!("{op} is not a stack slot"),
        }
    }

    /// # Panics
    ///
    /// If `op` isn't a constant.
    pub(super) fn to_constant(&self, op: Operand) -> Constant {
        match op {
            Operand::Constant(c) => *self.chunk.constant(c),
            _ => panic!("{op} is not a constant"),
        }
    }

    /// The value of an integer constant.
    ///
    /// # Panics
    ///
    /// If `op` isn't a constant with an integer value.
    pub(super) fn to_integer32(&self, op: Operand) -> i32 {
        self.to_constant(op)
            .integer_value()
            .unwrap_or_else(|| panic!("{op} is not an integer constant"))
    }

    /// If `op` is an int32 or smi constant, its integer value.
    pub(super) fn int32_constant(&self, op: Operand) -> Option<i32> {
        match op {
            Operand::Constant(c) => {
                let c = self.chunk.constant(c);
                match c.repr {
                    Representation::Int32 | Representation::Smi => c.integer_value(),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Load a general purpose operand into `dst`.
    pub(super) fn load_operand(&mut self, dst: Rq, op: Operand) -> Result<(), CompilationError> {
        match self.resolve(op) {
            Location::Register(Reg::GP(r)) => {
                if r != dst {
                    dynasm!(self.asm; mov Rq(dst.code()), Rq(r.code()));
                }
            }
            Location::Register(Reg::FP(_)) => panic!("{op} is not a general purpose operand"),
            Location::Memory { base, disp } => {
                dynasm!(self.asm; mov Rq(dst.code()), [Rq(base.code()) + disp]);
            }
            Location::Immediate(c) => self.load_constant(dst, c)?,
        }
        Ok(())
    }

    /// Materialise a constant in `dst` in the representation the optimiser chose for it.
    pub(super) fn load_constant(&mut self, dst: Rq, c: Constant) -> Result<(), CompilationError> {
        match (c.value, c.repr) {
            (ConstValue::Int32(v), Representation::Int32) => {
                dynasm!(self.asm; mov Rd(dst.code()), v);
            }
            (ConstValue::Int32(v), _) => self.move_smi(dst, v),
            (ConstValue::Object(h), _) => self.move_handle(dst, h),
            (ConstValue::Double(_), Representation::Int32) => match c.integer_value() {
                Some(v) => dynasm!(self.asm; mov Rd(dst.code()), v),
                None => return Err(self.abort(BailoutReason::UnsupportedDoubleImmediate)),
            },
            (ConstValue::Double(_), Representation::Smi) => match c.integer_value() {
                Some(v) => self.move_smi(dst, v),
                None => return Err(self.abort(BailoutReason::UnsupportedDoubleImmediate)),
            },
            (ConstValue::Double(_), _) => {
                return Err(self.abort(BailoutReason::UnsupportedDoubleImmediate))
            }
        }
        Ok(())
    }

    /// Load a double operand into `dst`.
    pub(super) fn load_double(&mut self, dst: Rx, op: Operand) {
        match self.resolve(op) {
            Location::Register(Reg::FP(r)) => {
                if r != dst {
                    dynasm!(self.asm; movaps Rx(dst.code()), Rx(r.code()));
                }
            }
            Location::Register(Reg::GP(_)) => panic!("{op} is not a double operand"),
            Location::Memory { base, disp } => {
                dynasm!(self.asm; movsd Rx(dst.code()), [Rq(base.code()) + disp]);
            }
            Location::Immediate(c) => {
                let d = c
                    .number_value()
                    .unwrap_or_else(|| panic!("{op} is not a number"));
                self.load_double_bits(dst, d.to_bits());
            }
        }
    }

    /// Load the double with bit pattern `bits` into `dst`. Clobbers [SCRATCH].
    pub(super) fn load_double_bits(&mut self, dst: Rx, bits: u64) {
        if bits == 0 {
            dynasm!(self.asm; xorps Rx(dst.code()), Rx(dst.code()));
        } else {
            dynasm!(self.asm
                ; mov Rq(SCRATCH.code()), QWORD bits as i64
                ; movq Rx(dst.code()), Rq(SCRATCH.code())
            );
        }
    }

    pub(super) fn cg_constant_i(
        &mut self,
        result: Operand,
        v: i32,
    ) -> Result<(), CompilationError> {
        let dst = self.to_register(result);
        self.mov_imm64(dst, i64::from(v));
        Ok(())
    }

    pub(super) fn cg_constant_s(
        &mut self,
        result: Operand,
        v: i32,
    ) -> Result<(), CompilationError> {
        let dst = self.to_register(result);
        self.move_smi(dst, v);
        Ok(())
    }

    pub(super) fn cg_constant_d(
        &mut self,
        result: Operand,
        v: f64,
    ) -> Result<(), CompilationError> {
        let dst = self.to_double_register(result);
        self.load_double_bits(dst, v.to_bits());
        Ok(())
    }

    pub(super) fn cg_constant_t(
        &mut self,
        result: Operand,
        v: Handle,
    ) -> Result<(), CompilationError> {
        let dst = self.to_register(result);
        self.move_handle(dst, v);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::lir::{Chunk, CompilationInfo, Inst, LabelKind};

    #[test]
    fn slots_with_frame() {
        let mut c = function_chunk(2);
        c.set_spill_slot_count(3);
        with_assemble(&c, |a| {
            assert_eq!(
                a.resolve(Operand::StackSlot(0)),
                Location::Memory {
                    base: Rq::RBP,
                    disp: -24
                }
            );
            assert_eq!(a.to_memory(Operand::DoubleStackSlot(2)), (Rq::RBP, -40));
            assert_eq!(a.to_memory(Operand::StackSlot(-1)), (Rq::RBP, 16));
            assert_eq!(a.to_memory(Operand::StackSlot(-3)), (Rq::RBP, 32));
            assert_eq!(a.to_register(Operand::Register(8)), Rq::R11);
            assert_eq!(a.to_double_register(Operand::DoubleRegister(14)), Rx::XMM14);
        });
    }

    #[test]
    fn slots_without_frame() {
        let c = Chunk::new(CompilationInfo::stub());
        with_assemble(&c, |a| {
            assert_eq!(a.to_memory(Operand::StackSlot(-1)), (Rq::RSP, 8));
            assert_eq!(a.to_memory(Operand::StackSlot(-2)), (Rq::RSP, 16));
        });
    }

    #[test]
    #[should_panic]
    fn frameless_spill_slot() {
        let c = Chunk::new(CompilationInfo::stub());
        with_assemble(&c, |a| {
            a.to_memory(Operand::StackSlot(0));
        });
    }

    #[test]
    #[should_panic]
    fn wrong_register_kind() {
        let c = function_chunk(0);
        with_assemble(&c, |a| {
            a.to_register(Operand::DoubleRegister(0));
        });
    }

    #[test]
    fn constants_use_chunk_representation() {
        let mut c = function_chunk(0);
        let i = c.add_const(Constant::int32(7));
        let s = c.add_const(Constant::smi(7));
        let big = c.add_const(Constant::smi(-1));
        with_assemble(&c, |a| {
            a.load_operand(Rq::RAX, i).unwrap();
            a.load_operand(Rq::RBX, s).unwrap();
            a.load_operand(Rq::RCX, big).unwrap();
            a.load_constant(Rq::RDX, Constant::smi(0)).unwrap();
        })
        .matches(
            "
              mov eax, 7
              mov rbx, 0x700000000
              mov rcx, 0xffffffff00000000
              xor edx, edx
            ",
        );
    }

    #[test]
    fn double_immediate_in_integer_context_aborts() {
        let mut c = function_chunk(0);
        let d = c.add_const(Constant::double(1.5));
        let r = c.add_const(Constant::double(2.0));
        with_assemble(&c, |a| {
            let mut two = Constant::double(2.0);
            two.repr = Representation::Int32;
            a.load_constant(Rq::RAX, two).unwrap();
            assert!(matches!(
                a.load_operand(Rq::RAX, d),
                Err(CompilationError::Aborted(
                    BailoutReason::UnsupportedDoubleImmediate
                ))
            ));
            assert!(a.load_operand(Rq::RAX, r).is_err());
        });
    }

    #[test]
    fn double_constants() {
        let mut c = function_chunk(0);
        let b = c.new_block();
        c.push(Inst::Label {
            block: b,
            kind: LabelKind::Plain,
        });
        c.push(Inst::ConstantD {
            result: Operand::DoubleRegister(0),
            value: 0.0,
        });
        c.push(Inst::ConstantD {
            result: Operand::DoubleRegister(1),
            value: 1.0,
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> constant-d
              xorps xmm0, xmm0
              ; <@2> constant-d
              mov r10, 0x3ff0000000000000
              movq xmm1, r10
              ...
            ",
        );
    }
}
