//! Calls out of generated code, and the safepoints that must follow every one of them.

use super::{Assemble, Cond, CONTEXT, FUNCTION, GP_REGS, RESULT, SCRATCH};
use crate::{
    compile::CompilationError,
    heap::{field, frame, js_function, shared_function_info, Handle, RootIndex, POINTER_SIZE},
    lir::{CompareOp, Operand, PointerMap},
    runtime::{RuntimeFunction, Stub},
    safepoint::{DeoptMode, SafepointKind},
};
use dynasmrt::{dynasm, x64::Rq, DynasmApi, DynasmLabelApi, Register as dynasmrtRegister};

/// The padding below the pushed registers that makes a register-saving safepoint frame
/// [lsmp::NUM_SAFEPOINT_REGISTERS] words high.
const SAFEPOINT_REGISTERS_PADDING: i32 =
    (lsmp::NUM_SAFEPOINT_REGISTERS - GP_REGS.len()) as i32 * POINTER_SIZE;

/// Which kind of safepoint a call records.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum SafepointMode {
    Simple,
    /// The call is made from deferred code with all registers pushed.
    WithRegisters,
}

/// The offset from `rsp` of the slot `reg` is saved in while registers are pushed for a
/// safepoint.
///
/// # Panics
///
/// If `reg` isn't allocatable.
pub(super) fn safepoint_register_slot(reg: Rq) -> i32 {
    let i = GP_REGS
        .iter()
        .position(|x| *x == reg)
        .unwrap_or_else(|| panic!("{reg:?} is not saved at safepoints"));
    SAFEPOINT_REGISTERS_PADDING + i32::try_from(GP_REGS.len() - 1 - i).unwrap() * POINTER_SIZE
}

impl Assemble<'_> {
    /// Record a safepoint at the current offset for the tagged values in `pm`.
    ///
    /// # Panics
    ///
    /// If `kind` isn't the kind the surrounding code may record.
    pub(super) fn record_safepoint(
        &mut self,
        pm: &PointerMap,
        kind: SafepointKind,
        arguments: usize,
        mode: DeoptMode,
    ) {
        assert_eq!(kind, self.expected_safepoint_kind);
        let mut slots = Vec::new();
        let mut regs = Vec::new();
        for op in pm.normalized_operands() {
            match op {
                Operand::StackSlot(i) => slots.push(i),
                Operand::Register(_) if kind.has_registers() => {
                    regs.push(self.to_register(op).code())
                }
                _ => (),
            }
        }
        let pc = self.asm.offset().0;
        self.safepoints
            .define_safepoint(pc, kind, arguments, mode, &slots, &regs);
    }

    /// Record a safepoint with no live tagged values.
    pub(super) fn record_empty_safepoint(&mut self, mode: DeoptMode) {
        self.record_safepoint(&PointerMap::new(), SafepointKind::Simple, 0, mode);
    }

    pub(super) fn pointer_map(&self, iidx: usize) -> PointerMap {
        self.chunk
            .inst(iidx)
            .pointer_map
            .clone()
            .unwrap_or_default()
    }

    pub(super) fn record_safepoint_with_lazy_deopt(&mut self, iidx: usize, mode: SafepointMode) {
        let pm = self.pointer_map(iidx);
        let kind = match mode {
            SafepointMode::Simple => SafepointKind::Simple,
            SafepointMode::WithRegisters => SafepointKind::WithRegisters,
        };
        self.record_safepoint(&pm, kind, 0, DeoptMode::LazyDeopt);
    }

    /// Call `addr`, clobbering [SCRATCH]. No safepoint is recorded.
    pub(super) fn call_address(&mut self, addr: u64) {
        dynasm!(self.asm
            ; mov Rq(SCRATCH.code()), QWORD addr as i64
            ; call Rq(SCRATCH.code())
        );
    }

    /// Call code at `addr` on behalf of instruction `iidx`.
    pub(super) fn call_code(&mut self, iidx: usize, addr: u64, mode: SafepointMode) {
        self.call_address(addr);
        self.record_safepoint_with_lazy_deopt(iidx, mode);
    }

    /// Set up the registers the C entry stub expects and call it.
    fn call_c_entry(&mut self, f: RuntimeFunction, save_doubles: bool) {
        let entry = self.rt.runtime_entry(f);
        dynasm!(self.asm
            ; mov eax, f.arity()
            ; mov rbx, QWORD entry as i64
        );
        let stub = self.rt.stub_entry(Stub::CEntry { save_doubles });
        self.call_address(stub);
    }

    /// Call runtime function `f`, whose arguments have been pushed.
    pub(super) fn call_runtime(&mut self, iidx: usize, f: RuntimeFunction, save_doubles: bool) {
        self.call_c_entry(f, save_doubles);
        self.record_safepoint_with_lazy_deopt(iidx, SafepointMode::Simple);
    }

    /// Call runtime function `f` from code that records no lazy deoptimisation point for it.
    pub(super) fn call_runtime_no_lazy_deopt(&mut self, f: RuntimeFunction) {
        self.call_c_entry(f, false);
        self.record_empty_safepoint(DeoptMode::NoLazyDeopt);
    }

    /// Call runtime function `f` from deferred code inside a safepoint register scope.
    pub(super) fn call_runtime_from_deferred(&mut self, iidx: usize, f: RuntimeFunction) {
        dynasm!(self.asm; mov Rq(CONTEXT.code()), [rbp + frame::CONTEXT_OFFSET]);
        self.call_c_entry(f, true);
        let pm = self.pointer_map(iidx);
        self.record_safepoint(
            &pm,
            SafepointKind::WithRegisters,
            usize::try_from(f.arity()).unwrap(),
            DeoptMode::NoLazyDeopt,
        );
    }

    /// Save every allocatable register so that deferred code can call out and the collector can
    /// find (and update) pointers held in registers.
    pub(super) fn push_safepoint_registers(&mut self) {
        assert_eq!(self.expected_safepoint_kind, SafepointKind::Simple);
        for r in GP_REGS {
            dynasm!(self.asm; push Rq(r.code()));
        }
        dynasm!(self.asm; lea rsp, [rsp - SAFEPOINT_REGISTERS_PADDING]);
        self.expected_safepoint_kind = SafepointKind::WithRegisters;
    }

    pub(super) fn pop_safepoint_registers(&mut self) {
        assert_eq!(self.expected_safepoint_kind, SafepointKind::WithRegisters);
        dynasm!(self.asm; lea rsp, [rsp + SAFEPOINT_REGISTERS_PADDING]);
        for r in GP_REGS.iter().rev() {
            dynasm!(self.asm; pop Rq(r.code()));
        }
        self.expected_safepoint_kind = SafepointKind::Simple;
    }

    /// Overwrite the saved value of `reg` so that popping the safepoint registers leaves `src`'s
    /// value in `reg`.
    pub(super) fn store_to_safepoint_register_slot(&mut self, reg: Rq, src: Rq) {
        dynasm!(self.asm; mov [rsp + safepoint_register_slot(reg)], Rq(src.code()));
    }

    pub(super) fn cg_call_stub(&mut self, iidx: usize, stub: Stub) {
        let addr = self.rt.stub_entry(stub);
        self.call_code(iidx, addr, SafepointMode::Simple);
    }

    /// Call a known JS function. The callee is in `rdi`.
    pub(super) fn cg_call_known_function(
        &mut self,
        iidx: usize,
        function: Handle,
        formal_parameter_count: i32,
        argc: i32,
    ) -> Result<(), CompilationError> {
        let dont_adapt = formal_parameter_count
            == shared_function_info::DONT_ADAPT_ARGUMENTS_SENTINEL
            || formal_parameter_count == argc;
        let f = FUNCTION.code();
        dynasm!(self.asm; mov Rq(CONTEXT.code()), [Rq(f) + field(js_function::CONTEXT_OFFSET)]);
        if dont_adapt {
            self.comment(format!("call {:#x} directly", function.0));
            dynasm!(self.asm
                ; mov eax, argc
                ; call QWORD [Rq(f) + field(js_function::CODE_ENTRY_OFFSET)]
            );
            self.record_safepoint_with_lazy_deopt(iidx, SafepointMode::Simple);
        } else {
            dynasm!(self.asm
                ; mov eax, argc
                ; mov ebx, formal_parameter_count
            );
            let adaptor = self.rt.stub_entry(Stub::ArgumentsAdaptor);
            self.call_code(iidx, adaptor, SafepointMode::Simple);
        }
        Ok(())
    }

    /// Call the function in `rdi` with `argc` pushed arguments.
    pub(super) fn cg_call_function(&mut self, iidx: usize, argc: usize) {
        self.cg_call_stub(iidx, Stub::CallFunction { argc });
    }

    pub(super) fn cg_push_argument(&mut self, value: Operand) -> Result<(), CompilationError> {
        match value {
            Operand::Register(_) => {
                let r = self.to_register(value);
                dynasm!(self.asm; push Rq(r.code()));
            }
            Operand::StackSlot(_) => {
                let (base, disp) = self.to_memory(value);
                dynasm!(self.asm; push QWORD [Rq(base.code()) + disp]);
            }
            Operand::Constant(_) => {
                let c = self.to_constant(value);
                self.load_constant(SCRATCH, c)?;
                dynasm!(self.asm; push Rq(SCRATCH.code()));
            }
            Operand::DoubleRegister(_) | Operand::DoubleStackSlot(_) => {
                panic!("Can't push double {value} as an argument")
            }
        }
        Ok(())
    }

    pub(super) fn cg_drop(&mut self, count: i32) {
        dynasm!(self.asm; add rsp, count * POINTER_SIZE);
    }

    /// Generic comparison. `left` is in `rdx`, `right` in `rax`, and the boolean result lands in
    /// `rax`.
    pub(super) fn cg_cmp_t(
        &mut self,
        iidx: usize,
        op: CompareOp,
        result: Operand,
        left: Operand,
        right: Operand,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(left), Rq::RDX);
        assert_eq!(self.to_register(right), RESULT);
        let dst = self.to_register(result);
        assert_eq!(dst, RESULT);
        let addr = self.rt.stub_entry(Stub::Compare { op });
        self.call_code(iidx, addr, SafepointMode::Simple);
        // The stub leaves a negative, zero or positive number in `rax`.
        let true_value = self.asm.new_dynamic_label();
        dynasm!(self.asm; test rax, rax);
        self.jcc(Cond::from_compare(op, false), true_value);
        self.load_root(dst, RootIndex::FalseValue);
        dynasm!(self.asm; jmp >done);
        self.bind(true_value);
        self.load_root(dst, RootIndex::TrueValue);
        dynasm!(self.asm; done:);
        Ok(())
    }

    /// `left instanceof right`, with `left` in `rax` and `right` in `rdx`.
    pub(super) fn cg_instance_of(
        &mut self,
        iidx: usize,
        result: Operand,
        left: Operand,
        right: Operand,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(left), RESULT);
        assert_eq!(self.to_register(right), Rq::RDX);
        let dst = self.to_register(result);
        assert_eq!(dst, RESULT);
        let addr = self.rt.stub_entry(Stub::InstanceOf {
            inline_check: false,
        });
        self.call_code(iidx, addr, SafepointMode::Simple);
        // The stub returns zero for true.
        dynasm!(self.asm
            ; test rax, rax
            ; jz >true_value
        );
        self.load_root(dst, RootIndex::FalseValue);
        dynasm!(self.asm
            ; jmp >done
            ; true_value:
        );
        self.load_root(dst, RootIndex::TrueValue);
        dynasm!(self.asm; done:);
        Ok(())
    }
}
