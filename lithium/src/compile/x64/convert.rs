//! Conversions between untagged numbers and their tagged forms.

use super::{
    deferred::DeferredKind, memory::AllocSize, operand::Location, Assemble, Cond, DOUBLE_SCRATCH,
    RESULT, SCRATCH,
};
use crate::{
    compile::CompilationError,
    heap::{field, heap_number, RootIndex, MAP_OFFSET, SMI_MAX, SMI_SHIFT},
    lir::Operand,
    runtime::{AllocSpace, RuntimeFunction, Stub},
};
use dynasmrt::{
    dynasm,
    x64::{Rq, Rx},
    DynamicLabel, DynasmApi, DynasmLabelApi, Register as dynasmrtRegister,
};

impl Assemble<'_> {
    /// Allocate an uninitialised heap number in `result`, jumping to `gc` if inline allocation
    /// fails. Clobbers `temp` and [SCRATCH].
    fn allocate_heap_number(&mut self, result: Rq, temp: Rq, gc: DynamicLabel) {
        if !self.config.inline_new {
            self.jmp(gc);
            return;
        }
        self.allocate(
            result,
            AllocSize::Const(heap_number::SIZE),
            temp,
            AllocSpace::New,
            gc,
        );
        self.load_root(SCRATCH, RootIndex::HeapNumberMap);
        dynasm!(self.asm; mov [Rq(result.code()) + field(MAP_OFFSET)], Rq(SCRATCH.code()));
    }

    /// Set the flags for a comparison of `obj`'s map with the heap number map. Clobbers
    /// [SCRATCH].
    fn cmp_heap_number_map(&mut self, obj: Rq) {
        self.load_root(SCRATCH, RootIndex::HeapNumberMap);
        dynasm!(self.asm; cmp [Rq(obj.code()) + field(MAP_OFFSET)], Rq(SCRATCH.code()));
    }

    /// Truncate `value` to an int32 in `dst` with JS `ToInt32` semantics. Values out of int64
    /// range go through the truncation stub.
    fn truncate_double_to_i(&mut self, dst: Rq, value: Rx) {
        let (r, v) = (dst.code(), value.code());
        dynasm!(self.asm
            ; cvttsd2si Rq(r), Rx(v)
            // The conversion yields 0x8000000000000000 on failure, the only value for which
            // subtracting one overflows.
            ; cmp Rq(r), 1
            ; jno >done
            ; sub rsp, 8
            ; movsd [rsp], Rx(v)
        );
        let stub = self.rt.stub_entry(Stub::DoubleToI {
            base: Rq::RSP.code(),
            offset: 0,
            destination: r,
        });
        self.call_address(stub);
        dynasm!(self.asm
            ; add rsp, 8
            ; done:
            ; mov Rd(r), Rd(r)
        );
    }

    /// Convert `value` to an int32 in `dst`, deoptimising unless the conversion is exact.
    /// Clobbers `scratch`.
    fn exact_double_to_i(
        &mut self,
        iidx: usize,
        dst: Rq,
        value: Rx,
        scratch: Rx,
        bailout_on_minus_zero: bool,
    ) -> Result<(), CompilationError> {
        let (r, v, s) = (dst.code(), value.code(), scratch.code());
        dynasm!(self.asm
            ; cvttsd2si Rd(r), Rx(v)
            ; xorps Rx(s), Rx(s)
            ; cvtsi2sd Rx(s), Rd(r)
            ; ucomisd Rx(s), Rx(v)
        );
        self.deoptimize_if(Some(Cond::NotEqual), iidx, "lost precision")?;
        self.deoptimize_if(Some(Cond::ParityEven), iidx, "NaN")?;
        if bailout_on_minus_zero {
            // A zero result came from +0 or -0: the sign bit tells them apart.
            let done = self.asm.new_dynamic_label();
            dynasm!(self.asm; test Rd(r), Rd(r));
            self.jcc(Cond::NotEqual, done);
            dynasm!(self.asm
                ; movmskpd Rd(r), Rx(v)
                ; and Rd(r), 1
            );
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "minus zero")?;
            self.bind(done);
        }
        Ok(())
    }

    pub(super) fn cg_integer32_to_double(
        &mut self,
        result: Operand,
        value: Operand,
    ) -> Result<(), CompilationError> {
        let d = self.to_double_register(result).code();
        dynasm!(self.asm; xorps Rx(d), Rx(d));
        match self.resolve(value) {
            Location::Memory { base, disp } => {
                dynasm!(self.asm; cvtsi2sd Rx(d), DWORD [Rq(base.code()) + disp])
            }
            _ => {
                let r = self.to_register(value).code();
                dynasm!(self.asm; cvtsi2sd Rx(d), Rd(r));
            }
        }
        Ok(())
    }

    pub(super) fn cg_uint32_to_double(
        &mut self,
        result: Operand,
        value: Operand,
    ) -> Result<(), CompilationError> {
        let d = self.to_double_register(result);
        let r = self.to_register(value);
        self.load_uint32(d, r);
        Ok(())
    }

    /// Convert the uint32 in `value` to a double in `dst`. Clobbers [SCRATCH].
    fn load_uint32(&mut self, dst: Rx, value: Rq) {
        let (d, s) = (dst.code(), SCRATCH.code());
        // Zero extended, every uint32 is a non-negative int64.
        dynasm!(self.asm
            ; mov Rd(s), Rd(value.code())
            ; xorps Rx(d), Rx(d)
            ; cvtsi2sd Rx(d), Rq(s)
        );
    }

    /// Smis hold 32-bit payloads, so every int32 can be tagged without a check.
    pub(super) fn cg_number_tag_i(
        &mut self,
        _iidx: usize,
        result: Operand,
        value: Operand,
    ) -> Result<(), CompilationError> {
        self.cg_smi_tag(result, value)
    }

    pub(super) fn cg_number_tag_u(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        temp: Operand,
        temp2: Operand,
    ) -> Result<(), CompilationError> {
        assert_eq!(result, value);
        let r = self.to_register(value).code();
        let d = self.defer(
            DeferredKind::NumberTagU {
                result,
                value,
                temp,
                temp2,
            },
            iidx,
        );
        dynasm!(self.asm; cmp Rd(r), SMI_MAX as i32);
        self.jcc(Cond::Above, d.entry);
        dynasm!(self.asm; shl Rq(r), SMI_SHIFT);
        self.bind(d.exit);
        Ok(())
    }

    pub(super) fn deferred_number_tag_u(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        temp: Operand,
        temp2: Operand,
    ) {
        assert_eq!(result, value);
        let reg = self.to_register(value);
        let t = self.to_register(temp);
        let x = self.to_double_register(temp2);
        // Allocatable double registers survive the runtime call.
        self.load_uint32(x, reg);
        let slow = self.asm.new_dynamic_label();
        let done = self.asm.new_dynamic_label();
        if self.config.inline_new {
            self.allocate_heap_number(reg, t, slow);
            self.jmp(done);
        }

        self.bind(slow);
        // `reg` is in the pointer map but holds an integer until the call returns.
        self.move_smi(reg, 0);
        self.push_safepoint_registers();
        self.call_runtime_from_deferred(iidx, RuntimeFunction::AllocateHeapNumber);
        self.store_to_safepoint_register_slot(reg, RESULT);
        self.pop_safepoint_registers();

        self.bind(done);
        dynasm!(self.asm
            ; movsd [Rq(reg.code()) + field(heap_number::VALUE_OFFSET)], Rx(x.code())
        );
    }

    pub(super) fn cg_number_tag_d(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        temp: Operand,
    ) -> Result<(), CompilationError> {
        let reg = self.to_register(result);
        let t = self.to_register(temp);
        let v = self.to_double_register(value);
        let d = self.defer(DeferredKind::NumberTagD { result }, iidx);
        self.allocate_heap_number(reg, t, d.entry);
        self.bind(d.exit);
        dynasm!(self.asm
            ; movsd [Rq(reg.code()) + field(heap_number::VALUE_OFFSET)], Rx(v.code())
        );
        Ok(())
    }

    pub(super) fn deferred_number_tag_d(&mut self, iidx: usize, result: Operand) {
        let reg = self.to_register(result);
        // `reg` is in the pointer map, so it must hold a valid tagged value across the call.
        self.move_smi(reg, 0);
        self.push_safepoint_registers();
        self.call_runtime_from_deferred(iidx, RuntimeFunction::AllocateHeapNumber);
        dynasm!(self.asm; mov Rq(SCRATCH.code()), Rq(RESULT.code()));
        self.pop_safepoint_registers();
        dynasm!(self.asm; mov Rq(reg.code()), Rq(SCRATCH.code()));
    }

    pub(super) fn cg_smi_tag(
        &mut self,
        result: Operand,
        value: Operand,
    ) -> Result<(), CompilationError> {
        assert_eq!(result, value);
        let r = self.to_register(value).code();
        dynasm!(self.asm; shl Rq(r), SMI_SHIFT);
        Ok(())
    }

    pub(super) fn cg_smi_untag(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        needs_check: bool,
    ) -> Result<(), CompilationError> {
        assert_eq!(result, value);
        let r = self.to_register(value);
        if needs_check {
            self.test_smi(r);
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "not a Smi")?;
        } else if self.config.debug_code {
            self.test_smi(r);
            dynasm!(self.asm
                ; jz >ok
                ; int3
                ; ok:
            );
        }
        dynasm!(self.asm; sar Rq(r.code()), SMI_SHIFT);
        Ok(())
    }

    pub(super) fn cg_number_untag_d(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        convert_undefined_to_nan: bool,
        deopt_on_minus_zero: bool,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        let dst = self.to_double_register(result);
        let (d, s) = (dst.code(), SCRATCH.code());
        let load_smi = self.asm.new_dynamic_label();
        let convert = self.asm.new_dynamic_label();
        let done = self.asm.new_dynamic_label();

        self.test_smi(r);
        self.jcc(Cond::Equal, load_smi);
        self.cmp_heap_number_map(r);
        // Every heap object is at least two words long, so the load is safe before the map check
        // has been acted on.
        dynasm!(self.asm; movsd Rx(d), [Rq(r.code()) + field(heap_number::VALUE_OFFSET)]);
        if convert_undefined_to_nan {
            self.jcc(Cond::NotEqual, convert);
        } else {
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "not a heap number")?;
        }
        if deopt_on_minus_zero {
            let x = DOUBLE_SCRATCH.code();
            dynasm!(self.asm
                ; xorps Rx(x), Rx(x)
                ; ucomisd Rx(x), Rx(d)
            );
            self.jcc(Cond::NotEqual, done);
            self.jcc(Cond::ParityEven, done);
            dynasm!(self.asm
                ; movmskpd Rd(s), Rx(d)
                ; test Rd(s), 1
            );
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "minus zero")?;
        }
        self.jmp(done);

        if convert_undefined_to_nan {
            self.bind(convert);
            self.compare_root(r, RootIndex::UndefinedValue);
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "not a heap number/undefined")?;
            self.load_double_bits(dst, heap_number::CANONICAL_NAN);
            self.jmp(done);
        }

        self.bind(load_smi);
        dynasm!(self.asm
            ; mov Rq(s), Rq(r.code())
            ; sar Rq(s), SMI_SHIFT
            ; xorps Rx(d), Rx(d)
            ; cvtsi2sd Rx(d), Rd(s)
        );
        self.bind(done);
        Ok(())
    }

    pub(super) fn cg_tagged_to_i(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        temp: Operand,
        truncating: bool,
        bailout_on_minus_zero: bool,
    ) -> Result<(), CompilationError> {
        assert_eq!(result, value);
        let r = self.to_register(value);
        let d = self.defer(
            DeferredKind::TaggedToI {
                result,
                value,
                temp,
                truncating,
                bailout_on_minus_zero,
            },
            iidx,
        );
        self.test_smi(r);
        self.jcc(Cond::NotEqual, d.entry);
        dynasm!(self.asm; sar Rq(r.code()), SMI_SHIFT);
        self.bind(d.exit);
        Ok(())
    }

    /// Convert the heap object in `value` to an int32 in place, or deoptimise.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn deferred_tagged_to_i(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        temp: Operand,
        truncating: bool,
        bailout_on_minus_zero: bool,
        exit: DynamicLabel,
    ) -> Result<(), CompilationError> {
        assert_eq!(result, value);
        let r = self.to_register(value);
        let x = DOUBLE_SCRATCH;
        self.cmp_heap_number_map(r);
        if truncating {
            let no_heap_number = self.asm.new_dynamic_label();
            let check_bools = self.asm.new_dynamic_label();
            let check_false = self.asm.new_dynamic_label();
            self.jcc(Cond::NotEqual, no_heap_number);
            dynasm!(self.asm
                ; movsd Rx(x.code()), [Rq(r.code()) + field(heap_number::VALUE_OFFSET)]
            );
            self.truncate_double_to_i(r, x);
            self.jmp(exit);

            // Undefined and false truncate to zero, true to one.
            self.bind(no_heap_number);
            self.compare_root(r, RootIndex::UndefinedValue);
            self.jcc(Cond::NotEqual, check_bools);
            self.mov_imm64(r, 0);
            self.jmp(exit);

            self.bind(check_bools);
            self.compare_root(r, RootIndex::TrueValue);
            self.jcc(Cond::NotEqual, check_false);
            self.mov_imm64(r, 1);
            self.jmp(exit);

            self.bind(check_false);
            self.compare_root(r, RootIndex::FalseValue);
            self.deoptimize_if(
                Some(Cond::NotEqual),
                iidx,
                "not a heap number/undefined/true/false",
            )?;
            self.mov_imm64(r, 0);
        } else {
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "not a heap number")?;
            dynasm!(self.asm
                ; movsd Rx(x.code()), [Rq(r.code()) + field(heap_number::VALUE_OFFSET)]
            );
            let scratch = self.to_double_register(temp);
            self.exact_double_to_i(iidx, r, x, scratch, bailout_on_minus_zero)?;
        }
        Ok(())
    }

    pub(super) fn cg_double_to_i(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        truncating: bool,
        bailout_on_minus_zero: bool,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(result);
        let v = self.to_double_register(value);
        if truncating {
            self.truncate_double_to_i(r, v);
            Ok(())
        } else {
            self.exact_double_to_i(iidx, r, v, DOUBLE_SCRATCH, bailout_on_minus_zero)
        }
    }
}
