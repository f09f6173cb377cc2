//! Building and tearing down frames: the prologue, the OSR entry, stack checks and returns.

use super::{
    calls::SafepointMode, deferred::DeferredKind, Assemble, Cond, CONTEXT,
    FAST_NEW_CONTEXT_MAX_SLOTS, FP_REGS, FUNCTION, LAZY_DEOPT_PATCH_SIZE, RESULT, SCRATCH,
};
use crate::{
    compile::CompilationError,
    heap::{
        context, field, frame, global_object, RootIndex, DOUBLE_SIZE, POINTER_SIZE,
        SLOTS_ZAP_VALUE,
    },
    lir::{Operand, StackCheckKind},
    runtime::{RuntimeFunction, Stub},
    safepoint::DeoptMode,
};
use dynasmrt::{dynasm, x64::Rq, DynasmApi, DynasmLabelApi, Register as dynasmrtRegister};

impl Assemble<'_> {
    pub(super) fn generate_prologue(&mut self) -> Result<(), CompilationError> {
        let info = self.info();
        if info.is_optimizing() && !info.strict && !info.native && info.this_has_uses {
            // Sloppy mode functions see the global proxy, not undefined, as their receiver.
            let receiver = i32::try_from(info.num_parameters + 1).unwrap() * POINTER_SIZE;
            let global = field(context::slot_offset(context::GLOBAL_OBJECT_INDEX));
            dynasm!(self.asm; mov rcx, [rsp + receiver]);
            self.compare_root(Rq::RCX, RootIndex::UndefinedValue);
            dynasm!(self.asm
                ; jne >ok
                ; mov rcx, [Rq(CONTEXT.code()) + global]
                ; mov rcx, [rcx + field(global_object::GLOBAL_PROXY_OFFSET)]
                ; mov [rsp + receiver], rcx
                ; ok:
            );
        }

        self.prologue_offset = self.asm.offset().0;
        if self.needs_eager_frame() {
            assert!(!self.frame_is_built);
            self.frame_is_built = true;
            // The fixed register forms of `push` encode without a REX prefix.
            debug_assert!(CONTEXT == Rq::RSI && FUNCTION == Rq::RDI);
            dynasm!(self.asm
                ; push rbp
                ; mov rbp, rsp
                ; push rsi
            );
            if self.is_stub() {
                self.move_smi(SCRATCH, frame::STUB_MARKER);
                dynasm!(self.asm; push Rq(SCRATCH.code()));
            } else {
                dynasm!(self.asm; push rdi);
            }
            self.no_frame_ranges
                .push((self.prologue_offset, self.asm.offset().0));
        }

        let slots = i32::try_from(self.chunk.spill_slot_count()).unwrap();
        if slots > 0 {
            dynasm!(self.asm; sub rsp, slots * POINTER_SIZE);
            if self.config.debug_code {
                dynasm!(self.asm
                    ; push rax
                    ; mov eax, slots
                    ; mov Rq(SCRATCH.code()), QWORD SLOTS_ZAP_VALUE
                    ; zap:
                    ; mov [rsp + rax * 8], Rq(SCRATCH.code())
                    ; dec eax
                    ; jnz <zap
                    ; pop rax
                );
            }
            if self.info().saves_caller_doubles {
                self.save_caller_doubles();
            }
        }

        if self.info().num_heap_slots > 0 {
            self.allocate_local_context();
        }

        if self.config.trace && self.info().is_optimizing() {
            self.call_runtime_no_lazy_deopt(RuntimeFunction::TraceEnter);
        }
        Ok(())
    }

    /// Allocate the function's context, make it current, and copy context-allocated parameters
    /// into it.
    fn allocate_local_context(&mut self) {
        self.comment("Allocate local context".to_owned());
        let info = self.info();
        let slots = info.num_heap_slots - context::MIN_CONTEXT_SLOTS;
        // The function is still in `rdi`.
        if slots <= FAST_NEW_CONTEXT_MAX_SLOTS {
            let stub = self.rt.stub_entry(Stub::FastNewContext { slots });
            self.call_address(stub);
            self.record_empty_safepoint(DeoptMode::NoLazyDeopt);
        } else {
            dynasm!(self.asm; push Rq(FUNCTION.code()));
            self.call_runtime_no_lazy_deopt(RuntimeFunction::NewFunctionContext);
        }
        let cx = CONTEXT.code();
        dynasm!(self.asm
            ; mov Rq(cx), rax
            ; mov [rbp + frame::CONTEXT_OFFSET], rax
        );
        let n = info.num_parameters;
        for (param, slot) in &info.context_parameters {
            assert!(*param < n);
            let param_offset = frame::FIXED_FRAME_SIZE_FROM_FP
                + i32::try_from(n - 1 - param).unwrap() * POINTER_SIZE;
            let slot_offset = field(context::slot_offset(*slot));
            dynasm!(self.asm
                ; mov rax, [rbp + param_offset]
                ; mov [Rq(cx) + slot_offset], rax
            );
            self.record_write_field(CONTEXT, slot_offset, RESULT, Rq::RBX, true);
        }
        self.comment("End allocate local context".to_owned());
    }

    /// Enter optimised code from the middle of an unoptimised frame. Only the first OSR
    /// instruction emits anything.
    pub(super) fn generate_osr_prologue(&mut self) {
        if self.osr_pc_offset.is_some() {
            return;
        }
        self.osr_pc_offset = Some(self.asm.offset().0);
        // The unoptimised frame's slots become the first of ours.
        let slots = self
            .chunk
            .spill_slot_count()
            .checked_sub(self.chunk.osr_unoptimized_frame_slots())
            .unwrap_or_else(|| panic!("OSR frame has more slots than the optimised frame"));
        let slots = i32::try_from(slots).unwrap();
        dynasm!(self.asm; sub rsp, slots * POINTER_SIZE);
    }

    pub(super) fn cg_stack_check(
        &mut self,
        iidx: usize,
        kind: StackCheckKind,
    ) -> Result<(), CompilationError> {
        self.compare_root(Rq::RSP, RootIndex::StackLimit);
        match kind {
            StackCheckKind::FunctionEntry => {
                dynasm!(self.asm; jae >done);
                let addr = self.rt.stub_entry(Stub::StackCheck);
                self.call_code(iidx, addr, SafepointMode::Simple);
                dynasm!(self.asm; done:);
            }
            StackCheckKind::BackEdge => {
                let d = self.defer(DeferredKind::StackCheck, iidx);
                self.jcc(Cond::Below, d.entry);
                self.ensure_space_for_lazy_deopt(LAZY_DEOPT_PATCH_SIZE);
                self.bind(d.exit);
                // The deferred call records this environment's index with its safepoint.
                let env = self
                    .chunk
                    .inst(iidx)
                    .env
                    .unwrap_or_else(|| panic!("Stack check {iidx} has no environment"));
                self.register_environment_for_deoptimization(env, DeoptMode::LazyDeopt)?;
            }
        }
        Ok(())
    }

    /// Call the stack guard with every register saved. The loop resumes at the exit label, which
    /// is also where a lazy deoptimisation resumes.
    pub(super) fn deferred_stack_check(&mut self, iidx: usize) {
        self.push_safepoint_registers();
        self.call_runtime_from_deferred(iidx, RuntimeFunction::StackGuard);
        self.record_safepoint_with_lazy_deopt(iidx, SafepointMode::WithRegisters);
        let env = self
            .chunk
            .inst(iidx)
            .env
            .and_then(|x| self.env_deopt_index[x])
            .unwrap_or_else(|| panic!("Stack check {iidx} has no registered environment"));
        self.safepoints.record_lazy_deoptimization_index(env);
        self.pop_safepoint_registers();
    }

    /// Tear down the frame and return, popping `parameter_count` arguments and the receiver.
    pub(super) fn cg_return(
        &mut self,
        value: Operand,
        parameter_count: Operand,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(value), RESULT);
        if self.config.trace && self.info().is_optimizing() {
            // The runtime hands the pushed value back in `rax`.
            dynasm!(self.asm
                ; push rax
                ; mov Rq(CONTEXT.code()), [rbp + frame::CONTEXT_OFFSET]
            );
            self.call_runtime_no_lazy_deopt(RuntimeFunction::TraceExit);
        }
        if self.info().saves_caller_doubles {
            self.restore_caller_doubles();
        }
        let mut no_frame_start = None;
        if self.needs_eager_frame() {
            dynasm!(self.asm
                ; mov rsp, rbp
                ; pop rbp
            );
            no_frame_start = Some(self.asm.offset().0);
        }
        if parameter_count.is_constant() {
            let n = self.to_integer32(parameter_count);
            let bytes = (n + 1) * POINTER_SIZE;
            match u16::try_from(bytes) {
                Ok(x) => dynasm!(self.asm; ret x as i16),
                Err(_) => dynasm!(self.asm
                    ; pop rcx
                    ; add rsp, bytes
                    ; jmp rcx
                ),
            }
        } else {
            // Only stubs take their argument count dynamically: it's a smi, and there's no
            // receiver to drop.
            let reg = self.to_register(parameter_count);
            let ret = if reg == Rq::RCX { Rq::RBX } else { Rq::RCX };
            dynasm!(self.asm
                ; sar Rq(reg.code()), 32
                ; pop Rq(ret.code())
                ; lea rsp, [rsp + Rq(reg.code()) * 8]
                ; jmp Rq(ret.code())
            );
        }
        if let Some(start) = no_frame_start {
            self.no_frame_ranges.push((start, self.asm.offset().0));
        }
        Ok(())
    }

    /// Spill the double registers this code clobbers to the bottom of the frame.
    pub(super) fn save_caller_doubles(&mut self) {
        debug_assert!(self.needs_eager_frame());
        self.comment("Save clobbered callee double registers".to_owned());
        let chunk = self.chunk;
        for (i, r) in chunk.allocated_double_registers().iter().enumerate() {
            let disp = i32::try_from(i).unwrap() * DOUBLE_SIZE;
            let r = FP_REGS[usize::from(*r)].code();
            dynasm!(self.asm; movsd [rsp + disp], Rx(r));
        }
    }

    pub(super) fn restore_caller_doubles(&mut self) {
        self.comment("Restore clobbered callee double registers".to_owned());
        let chunk = self.chunk;
        for (i, r) in chunk.allocated_double_registers().iter().enumerate() {
            let disp = i32::try_from(i).unwrap() * DOUBLE_SIZE;
            let r = FP_REGS[usize::from(*r)].code();
            dynasm!(self.asm; movsd Rx(r), [rsp + disp]);
        }
    }
}
