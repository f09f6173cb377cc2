//! Comparisons, branches on type tests, and the checks that deoptimise when a value isn't what the
//! optimiser assumed it to be.

use super::{
    deferred::DeferredKind,
    operand::{Location, Reg},
    Assemble, Cond, DOUBLE_SCRATCH, RESULT, SCRATCH,
};
use crate::{
    compile::CompilationError,
    heap::{
        cell, field, heap_number, instance_type, js_function, map, shared_function_info, string,
        Handle, RootIndex, MAP_OFFSET,
    },
    lir::{CompareOp, InstanceTypeCheck, Operand, Representation, Targets},
    runtime::{RuntimeFunction, Stub},
    safepoint::{DeoptMode, SafepointKind},
};
use dynasmrt::{dynasm, x64::Rq, DynasmApi, DynasmLabelApi, Register as dynasmrtRegister};

/// The bytes from the start of the delta push to the instanceof stub's return address: `mov
/// r10d, imm32; push r10`, then `mov r10, imm64; call r10`.
const INSTANCE_OF_DELTA_TAIL: usize = 6 + 2 + 13;

/// The value and condition with which a single `cmp` of an instance type tests for the interval
/// `first..=last`.
///
/// # Panics
///
/// If the interval is bounded at both ends.
fn instance_type_test(first: u8, last: u8) -> (u8, Cond) {
    if first == last {
        (first, Cond::Equal)
    } else if last == instance_type::LAST_TYPE {
        (first, Cond::AboveEqual)
    } else if first == 0 {
        (last, Cond::BelowEqual)
    } else {
        panic!("Instance types {first:#x}..={last:#x} can't be tested with one comparison")
    }
}

impl Assemble<'_> {
    /// Set the zero flag if `op`, a register or stack slot, holds a smi.
    fn test_smi_operand(&mut self, op: Operand) {
        match self.resolve(op) {
            Location::Register(Reg::GP(r)) => self.test_smi(r),
            Location::Memory { base, disp } => {
                dynasm!(self.asm; test BYTE [Rq(base.code()) + disp], 1)
            }
            _ => panic!("{op} is not a tagged operand"),
        }
    }

    /// Load the map of heap object `obj` into `dst` and compare its instance type with `ty`.
    fn cmp_object_type(&mut self, obj: Rq, ty: u8, dst: Rq) {
        dynasm!(self.asm
            ; mov Rq(dst.code()), [Rq(obj.code()) + field(MAP_OFFSET)]
            ; cmp BYTE [Rq(dst.code()) + field(map::INSTANCE_TYPE_OFFSET)], ty as i8
        );
    }

    /// Compare the map of heap object `obj` with `m`. Clobbers [SCRATCH].
    fn cmp_map(&mut self, obj: Rq, m: Handle) {
        self.move_handle(SCRATCH, m);
        dynasm!(self.asm; cmp [Rq(obj.code()) + field(MAP_OFFSET)], Rq(SCRATCH.code()));
    }

    pub(super) fn cg_branch(
        &mut self,
        value: Operand,
        repr: Representation,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        match repr {
            Representation::Int32 => {
                let r = self.to_register(value).code();
                dynasm!(self.asm; test Rd(r), Rd(r));
                self.emit_branch(targets, Cond::NotEqual);
            }
            Representation::Smi | Representation::External => {
                let r = self.to_register(value).code();
                dynasm!(self.asm; test Rq(r), Rq(r));
                self.emit_branch(targets, Cond::NotEqual);
            }
            Representation::Double => {
                // NaN compares unordered, which sets the zero flag: NaN is false.
                let v = self.to_double_register(value).code();
                let s = DOUBLE_SCRATCH.code();
                dynasm!(self.asm
                    ; xorps Rx(s), Rx(s)
                    ; ucomisd Rx(v), Rx(s)
                );
                self.emit_branch(targets, Cond::NotEqual);
            }
            Representation::Tagged | Representation::HeapObject => {
                self.to_boolean_branch(value, repr == Representation::Tagged, targets)
            }
        }
        Ok(())
    }

    /// Branch on the truthiness of an arbitrary tagged value.
    fn to_boolean_branch(&mut self, value: Operand, maybe_smi: bool, targets: Targets) {
        let r = self.to_register(value);
        let t = self.block_label(targets.true_block);
        let f = self.block_label(targets.false_block);
        self.compare_root(r, RootIndex::UndefinedValue);
        self.jcc(Cond::Equal, f);
        self.compare_root(r, RootIndex::TrueValue);
        self.jcc(Cond::Equal, t);
        self.compare_root(r, RootIndex::FalseValue);
        self.jcc(Cond::Equal, f);
        self.compare_root(r, RootIndex::NullValue);
        self.jcc(Cond::Equal, f);
        let v = r.code();
        if maybe_smi {
            // Smi zero is the only false smi.
            dynasm!(self.asm; test Rq(v), Rq(v));
            self.jcc(Cond::Equal, f);
            self.test_smi(r);
            self.jcc(Cond::Equal, t);
        }
        let m = SCRATCH.code();
        let ty = field(map::INSTANCE_TYPE_OFFSET);
        dynasm!(self.asm
            ; mov Rq(m), [Rq(v) + field(MAP_OFFSET)]
            ; test BYTE [Rq(m) + field(map::BIT_FIELD_OFFSET)], map::IS_UNDETECTABLE as i8
        );
        self.jcc(Cond::NotEqual, f);
        dynasm!(self.asm
            ; cmp BYTE [Rq(m) + ty], instance_type::FIRST_SPEC_OBJECT_TYPE as i8
        );
        self.jcc(Cond::AboveEqual, t);

        let not_string = self.asm.new_dynamic_label();
        dynasm!(self.asm; cmp BYTE [Rq(m) + ty], instance_type::FIRST_NONSTRING_TYPE as i8);
        self.jcc(Cond::AboveEqual, not_string);
        dynasm!(self.asm; cmp QWORD [Rq(v) + field(string::LENGTH_OFFSET)], 0);
        self.jcc(Cond::NotEqual, t);
        self.jmp(f);
        self.bind(not_string);

        dynasm!(self.asm; cmp BYTE [Rq(m) + ty], instance_type::SYMBOL as i8);
        self.jcc(Cond::Equal, t);

        let not_heap_number = self.asm.new_dynamic_label();
        self.compare_root(SCRATCH, RootIndex::HeapNumberMap);
        self.jcc(Cond::NotEqual, not_heap_number);
        let s = DOUBLE_SCRATCH.code();
        dynasm!(self.asm
            ; xorps Rx(s), Rx(s)
            ; ucomisd Rx(s), [Rq(v) + field(heap_number::VALUE_OFFSET)]
        );
        self.jcc(Cond::Equal, f);
        self.jmp(t);
        self.bind(not_heap_number);

        // Every other heap object is true.
        self.emit_goto(targets.true_block);
    }

    pub(super) fn cg_compare_numeric_and_branch(
        &mut self,
        op: CompareOp,
        repr: Representation,
        left: Operand,
        right: Operand,
        is_unsigned: bool,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        if let (Operand::Constant(_), Operand::Constant(_)) = (left, right) {
            let number = |x: Operand| {
                self.to_constant(x)
                    .number_value()
                    .unwrap_or_else(|| panic!("{x} is not a number"))
            };
            let block = if op.eval(number(left), number(right)) {
                targets.true_block
            } else {
                targets.false_block
            };
            self.emit_goto(block);
            return Ok(());
        }

        if repr == Representation::Double {
            let l = self.to_double_register(left).code();
            let r = self.to_double_register(right).code();
            dynasm!(self.asm; ucomisd Rx(l), Rx(r));
            // Unordered operands make every comparison false.
            self.emit_false_branch(targets, Cond::ParityEven);
            self.emit_branch(targets, Cond::from_compare(op, true));
            return Ok(());
        }

        let smi = repr == Representation::Smi;
        let op = if let Operand::Constant(_) = right {
            let v = self.to_integer32(right);
            let l = self.to_register(left).code();
            if smi {
                self.move_smi(SCRATCH, v);
                dynasm!(self.asm; cmp Rq(l), Rq(SCRATCH.code()));
            } else {
                dynasm!(self.asm; cmp Rd(l), v);
            }
            op
        } else if let Operand::Constant(_) = left {
            let v = self.to_integer32(left);
            if smi {
                self.move_smi(SCRATCH, v);
            }
            let s = SCRATCH.code();
            match (self.resolve(right), smi) {
                (Location::Register(Reg::GP(r)), true) => {
                    dynasm!(self.asm; cmp Rq(r.code()), Rq(s))
                }
                (Location::Register(Reg::GP(r)), false) => dynasm!(self.asm; cmp Rd(r.code()), v),
                (Location::Memory { base, disp }, true) => {
                    dynasm!(self.asm; cmp [Rq(base.code()) + disp], Rq(s))
                }
                (Location::Memory { base, disp }, false) => {
                    dynasm!(self.asm; cmp DWORD [Rq(base.code()) + disp], v)
                }
                _ => panic!("{right} is not an integer operand"),
            }
            op.commute()
        } else {
            let l = self.to_register(left);
            if smi {
                match self.resolve(right) {
                    Location::Register(Reg::GP(r)) => {
                        dynasm!(self.asm; cmp Rq(l.code()), Rq(r.code()))
                    }
                    Location::Memory { base, disp } => {
                        dynasm!(self.asm; cmp Rq(l.code()), [Rq(base.code()) + disp])
                    }
                    _ => panic!("{right} is not an integer operand"),
                }
            } else {
                self.cmp32(l, right);
            }
            op
        };
        self.emit_branch(targets, Cond::from_compare(op, is_unsigned));
        Ok(())
    }

    pub(super) fn cg_cmp_object_eq_and_branch(
        &mut self,
        left: Operand,
        right: Operand,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        let l = self.to_register(left).code();
        match self.resolve(right) {
            Location::Register(Reg::GP(r)) => dynasm!(self.asm; cmp Rq(l), Rq(r.code())),
            Location::Memory { base, disp } => {
                dynasm!(self.asm; cmp Rq(l), [Rq(base.code()) + disp])
            }
            Location::Immediate(c) => {
                self.load_constant(SCRATCH, c)?;
                dynasm!(self.asm; cmp Rq(l), Rq(SCRATCH.code()));
            }
            Location::Register(Reg::FP(_)) => panic!("{right} is not a tagged operand"),
        }
        self.emit_branch(targets, Cond::Equal);
        Ok(())
    }

    pub(super) fn cg_cmp_hole_and_branch(
        &mut self,
        repr: Representation,
        value: Operand,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        if repr == Representation::Double {
            let v = self.to_double_register(value).code();
            // Only a NaN can be the hole.
            dynasm!(self.asm; ucomisd Rx(v), Rx(v));
            self.emit_false_branch(targets, Cond::ParityOdd);
            let s = SCRATCH.code();
            dynasm!(self.asm
                ; movq Rq(s), Rx(v)
                ; shr Rq(s), 32
                ; cmp Rd(s), heap_number::HOLE_NAN_UPPER32 as i32
            );
        } else {
            let r = self.to_register(value);
            self.compare_root(r, RootIndex::TheHoleValue);
        }
        self.emit_branch(targets, Cond::Equal);
        Ok(())
    }

    pub(super) fn cg_compare_minus_zero_and_branch(
        &mut self,
        repr: Representation,
        value: Operand,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        assert_ne!(repr, Representation::Int32);
        if repr == Representation::Double {
            let v = self.to_double_register(value).code();
            let s = DOUBLE_SCRATCH.code();
            dynasm!(self.asm
                ; xorps Rx(s), Rx(s)
                ; ucomisd Rx(s), Rx(v)
            );
            self.emit_false_branch(targets, Cond::NotEqual);
            self.emit_false_branch(targets, Cond::ParityEven);
            // Zero; check the sign.
            dynasm!(self.asm
                ; movmskpd Rd(SCRATCH.code()), Rx(v)
                ; test Rd(SCRATCH.code()), 1
            );
            self.emit_branch(targets, Cond::NotEqual);
        } else {
            let r = self.to_register(value);
            let v = r.code();
            self.test_smi(r);
            self.emit_false_branch(targets, Cond::Equal);
            dynasm!(self.asm; mov Rq(SCRATCH.code()), [Rq(v) + field(MAP_OFFSET)]);
            self.compare_root(SCRATCH, RootIndex::HeapNumberMap);
            self.emit_false_branch(targets, Cond::NotEqual);
            // -0.0 is the only heap number whose upper word is 0x80000000 and lower word zero.
            // `0x80000000 - 1` is the only subtraction of one that overflows.
            let upper = field(heap_number::VALUE_OFFSET + 4);
            let lower = field(heap_number::VALUE_OFFSET);
            dynasm!(self.asm; cmp DWORD [Rq(v) + upper], 1);
            self.emit_false_branch(targets, Cond::NoOverflow);
            dynasm!(self.asm; cmp DWORD [Rq(v) + lower], 0);
            self.emit_branch(targets, Cond::Equal);
        }
        Ok(())
    }

    /// Is `value` a non-callable spec object or null?
    pub(super) fn cg_is_object_and_branch(
        &mut self,
        value: Operand,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        assert_ne!(r, SCRATCH);
        self.test_smi(r);
        self.emit_false_branch(targets, Cond::Equal);
        self.compare_root(r, RootIndex::NullValue);
        self.emit_true_branch(targets, Cond::Equal);
        let s = SCRATCH.code();
        dynasm!(self.asm
            ; mov Rq(s), [Rq(r.code()) + field(MAP_OFFSET)]
            // Undetectable objects behave like undefined.
            ; test BYTE [Rq(s) + field(map::BIT_FIELD_OFFSET)], map::IS_UNDETECTABLE as i8
        );
        self.emit_false_branch(targets, Cond::NotEqual);
        dynasm!(self.asm
            ; movzx Rd(s), BYTE [Rq(s) + field(map::INSTANCE_TYPE_OFFSET)]
            ; cmp Rd(s), i32::from(instance_type::FIRST_NONCALLABLE_SPEC_OBJECT_TYPE)
        );
        self.emit_false_branch(targets, Cond::Below);
        dynasm!(self.asm
            ; cmp Rd(s), i32::from(instance_type::LAST_NONCALLABLE_SPEC_OBJECT_TYPE)
        );
        self.emit_branch(targets, Cond::BelowEqual);
        Ok(())
    }

    pub(super) fn cg_is_string_and_branch(
        &mut self,
        value: Operand,
        value_is_heap_object: bool,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        if !value_is_heap_object {
            self.test_smi(r);
            self.emit_false_branch(targets, Cond::Equal);
        }
        self.cmp_object_type(r, instance_type::FIRST_NONSTRING_TYPE, SCRATCH);
        self.emit_branch(targets, Cond::Below);
        Ok(())
    }

    pub(super) fn cg_is_smi_and_branch(
        &mut self,
        value: Operand,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        self.test_smi_operand(value);
        self.emit_branch(targets, Cond::Equal);
        Ok(())
    }

    pub(super) fn cg_is_undetectable_and_branch(
        &mut self,
        value: Operand,
        value_is_heap_object: bool,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        if !value_is_heap_object {
            self.test_smi(r);
            self.emit_false_branch(targets, Cond::Equal);
        }
        let s = SCRATCH.code();
        dynasm!(self.asm
            ; mov Rq(s), [Rq(r.code()) + field(MAP_OFFSET)]
            ; test BYTE [Rq(s) + field(map::BIT_FIELD_OFFSET)], map::IS_UNDETECTABLE as i8
        );
        self.emit_branch(targets, Cond::NotEqual);
        Ok(())
    }

    pub(super) fn cg_has_instance_type_and_branch(
        &mut self,
        value: Operand,
        first: u8,
        last: u8,
        value_is_heap_object: bool,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        if !value_is_heap_object {
            self.test_smi(r);
            self.emit_false_branch(targets, Cond::Equal);
        }
        let (ty, cond) = instance_type_test(first, last);
        self.cmp_object_type(r, ty, SCRATCH);
        self.emit_branch(targets, cond);
        Ok(())
    }

    /// Does `value`'s class name equal `class_name`? Objects whose map's constructor isn't a
    /// function have class "Object", and callable objects have class "Function".
    #[allow(clippy::too_many_arguments)]
    pub(super) fn cg_class_of_test_and_branch(
        &mut self,
        value: Operand,
        temp: Operand,
        temp2: Operand,
        class_name: Handle,
        is_function_class: bool,
        is_object_class: bool,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        let v = self.to_register(value);
        let t = self.to_register(temp);
        let t2 = self.to_register(temp2);
        assert!(v != t && v != t2 && t != t2);
        let is_true = self.block_label(targets.true_block);
        let is_false = self.block_label(targets.false_block);
        let (tc, t2c) = (t.code(), t2.code());

        self.test_smi(v);
        self.jcc(Cond::Equal, is_false);
        if is_function_class {
            self.cmp_object_type(v, instance_type::FIRST_SPEC_OBJECT_TYPE, t);
            self.jcc(Cond::Below, is_false);
            // Callable types sit at the top of the spec object range.
            dynasm!(self.asm
                ; cmp BYTE [Rq(tc) + field(map::INSTANCE_TYPE_OFFSET)],
                    instance_type::JS_FUNCTION_PROXY as i8
            );
            self.jcc(Cond::AboveEqual, is_true);
        } else {
            let first = i32::from(instance_type::FIRST_NONCALLABLE_SPEC_OBJECT_TYPE);
            let width = i32::from(instance_type::LAST_NONCALLABLE_SPEC_OBJECT_TYPE) - first;
            dynasm!(self.asm
                ; mov Rq(tc), [Rq(v.code()) + field(MAP_OFFSET)]
                ; movzx Rd(t2c), BYTE [Rq(tc) + field(map::INSTANCE_TYPE_OFFSET)]
                ; sub Rd(t2c), first
                ; cmp Rd(t2c), width
            );
            self.jcc(Cond::Above, is_false);
        }

        // `t` holds the map of a non-callable spec object.
        dynasm!(self.asm; mov Rq(tc), [Rq(tc) + field(map::CONSTRUCTOR_OFFSET)]);
        self.cmp_object_type(t, instance_type::JS_FUNCTION, SCRATCH);
        self.jcc(
            Cond::NotEqual,
            if is_object_class { is_true } else { is_false },
        );
        dynasm!(self.asm
            ; mov Rq(tc), [Rq(tc) + field(js_function::SHARED_FUNCTION_INFO_OFFSET)]
            ; mov Rq(tc), [Rq(tc) + field(shared_function_info::INSTANCE_CLASS_NAME_OFFSET)]
        );
        // Class names are internalized, so identity suffices.
        self.cmp_handle(t, class_name);
        self.emit_branch(targets, Cond::Equal);
        Ok(())
    }

    pub(super) fn cg_cmp_map_and_branch(
        &mut self,
        value: Operand,
        m: Handle,
        targets: Targets,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        self.cmp_map(r, m);
        self.emit_branch(targets, Cond::Equal);
        Ok(())
    }

    /// `value instanceof function` for a function known at compile time. The stub called from the
    /// slow path patches the inline cache: the cell compared against the map and the root loaded
    /// on a hit.
    pub(super) fn cg_instance_of_known_global(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        temp: Operand,
        function: Handle,
    ) -> Result<(), CompilationError> {
        let obj = self.to_register(value);
        let dst = self.to_register(result);
        let t = self.to_register(temp);
        let false_result = self.asm.new_dynamic_label();
        let cache_miss = self.asm.new_dynamic_label();
        let done = self.asm.new_dynamic_label();

        self.test_smi(obj);
        self.jcc(Cond::Equal, false_result);
        dynasm!(self.asm; mov Rq(t.code()), [Rq(obj.code()) + field(MAP_OFFSET)]);
        let map_check = self.asm.offset().0;
        let d = self.defer(
            DeferredKind::InstanceOfKnownGlobal {
                result,
                value,
                function,
                map_check,
            },
            iidx,
        );
        let cache = self.rt.new_cell(None);
        self.move_handle(SCRATCH, cache);
        dynasm!(self.asm
            ; cmp Rq(t.code()), [Rq(SCRATCH.code()) + field(cell::VALUE_OFFSET)]
        );
        self.jcc(Cond::NotEqual, cache_miss);
        // Patched to load true or false.
        self.load_root(dst, RootIndex::TheHoleValue);
        self.jmp(done);

        self.bind(cache_miss);
        self.compare_root(obj, RootIndex::NullValue);
        self.jcc(Cond::Equal, false_result);
        // Strings are instances of nothing.
        self.cmp_object_type(obj, instance_type::FIRST_NONSTRING_TYPE, SCRATCH);
        self.jcc(Cond::AboveEqual, d.entry);

        self.bind(false_result);
        self.load_root(dst, RootIndex::FalseValue);
        self.bind(d.exit);
        self.bind(done);
        Ok(())
    }

    pub(super) fn deferred_instance_of_known_global(
        &mut self,
        iidx: usize,
        result: Operand,
        value: Operand,
        function: Handle,
        map_check: usize,
    ) -> Result<(), CompilationError> {
        let dst = self.to_register(result);
        self.push_safepoint_registers();
        let obj = self.to_register(value);
        dynasm!(self.asm; push Rq(obj.code()));
        self.move_handle(SCRATCH, function);
        dynasm!(self.asm; push Rq(SCRATCH.code()));
        // The stub finds the inline cache this far before its return address.
        let delta = self.asm.offset().0 + INSTANCE_OF_DELTA_TAIL - map_check;
        dynasm!(self.asm
            ; mov Rd(SCRATCH.code()), i32::try_from(delta).unwrap()
            ; push Rq(SCRATCH.code())
        );
        let stub = self.rt.stub_entry(Stub::InstanceOf { inline_check: true });
        self.call_address(stub);
        debug_assert_eq!(self.asm.offset().0 - map_check, delta);
        // The stub drops the delta before it can reach a safepoint.
        let pm = self.pointer_map(iidx);
        self.record_safepoint(&pm, SafepointKind::WithRegisters, 2, DeoptMode::LazyDeopt);
        let env = self
            .chunk
            .inst(iidx)
            .env
            .unwrap_or_else(|| panic!("Instruction {iidx} has no environment"));
        let idx = self.register_environment_for_deoptimization(env, DeoptMode::LazyDeopt)?;
        self.safepoints.record_lazy_deoptimization_index(idx);
        // Keep the stub's answer across the register restore.
        dynasm!(self.asm; mov Rq(SCRATCH.code()), Rq(RESULT.code()));
        self.pop_safepoint_registers();

        // The stub returns zero for true.
        let s = SCRATCH.code();
        dynasm!(self.asm
            ; test Rq(s), Rq(s)
            ; jnz >load_false
        );
        self.load_root(dst, RootIndex::TrueValue);
        dynasm!(self.asm
            ; jmp >done
            ; load_false:
        );
        self.load_root(dst, RootIndex::FalseValue);
        dynasm!(self.asm; done:);
        Ok(())
    }

    pub(super) fn cg_check_smi(
        &mut self,
        iidx: usize,
        value: Operand,
    ) -> Result<(), CompilationError> {
        self.test_smi_operand(value);
        self.deoptimize_if(Some(Cond::NotEqual), iidx, "not a Smi")
    }

    pub(super) fn cg_check_non_smi(
        &mut self,
        iidx: usize,
        value: Operand,
    ) -> Result<(), CompilationError> {
        self.test_smi_operand(value);
        self.deoptimize_if(Some(Cond::Equal), iidx, "Smi")
    }

    pub(super) fn cg_check_instance_type(
        &mut self,
        iidx: usize,
        value: Operand,
        check: InstanceTypeCheck,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        let s = SCRATCH.code();
        let ty = field(map::INSTANCE_TYPE_OFFSET);
        dynasm!(self.asm; mov Rq(s), [Rq(r.code()) + field(MAP_OFFSET)]);
        match check {
            InstanceTypeCheck::Interval { first, last } => {
                dynasm!(self.asm; cmp BYTE [Rq(s) + ty], first as i8);
                if first == last {
                    self.deoptimize_if(Some(Cond::NotEqual), iidx, "wrong instance type")?;
                } else {
                    self.deoptimize_if(Some(Cond::Below), iidx, "wrong instance type")?;
                    if last != instance_type::LAST_TYPE {
                        dynasm!(self.asm; cmp BYTE [Rq(s) + ty], last as i8);
                        self.deoptimize_if(Some(Cond::Above), iidx, "wrong instance type")?;
                    }
                }
            }
            InstanceTypeCheck::MaskAndTag { mask, tag } if mask.is_power_of_two() => {
                assert!(tag == 0 || tag == mask);
                dynasm!(self.asm; test BYTE [Rq(s) + ty], mask as i8);
                let cond = if tag == 0 {
                    Cond::NotEqual
                } else {
                    Cond::Equal
                };
                self.deoptimize_if(Some(cond), iidx, "wrong instance type")?;
            }
            InstanceTypeCheck::MaskAndTag { mask, tag } => {
                dynasm!(self.asm
                    ; movzx Rd(s), BYTE [Rq(s) + ty]
                    ; and Rb(s), mask as i8
                    ; cmp Rb(s), tag as i8
                );
                self.deoptimize_if(Some(Cond::NotEqual), iidx, "wrong instance type")?;
            }
        }
        Ok(())
    }

    /// Deoptimise unless `value` is `object`. Objects that may still move are compared through a
    /// cell the collector keeps up to date.
    pub(super) fn cg_check_value(
        &mut self,
        iidx: usize,
        value: Operand,
        object: Handle,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        if self.rt.in_new_space(object) {
            let c = self.rt.new_cell(Some(object));
            self.move_handle(SCRATCH, c);
            dynasm!(self.asm
                ; cmp Rq(r.code()), [Rq(SCRATCH.code()) + field(cell::VALUE_OFFSET)]
            );
        } else {
            self.cmp_handle(r, object);
        }
        self.deoptimize_if(Some(Cond::NotEqual), iidx, "value mismatch")
    }

    /// Deoptimise unless `value`'s map is one of `maps`. If a map may be deprecated, a slow path
    /// first tries to migrate the instance and then checks again.
    pub(super) fn cg_check_maps(
        &mut self,
        iidx: usize,
        value: Operand,
        maps: &[Handle],
        has_migration_target: bool,
    ) -> Result<(), CompilationError> {
        let (last, rest) = maps
            .split_last()
            .unwrap_or_else(|| panic!("Map check {iidx} has no maps"));
        let r = self.to_register(value);
        let migrate = has_migration_target.then(|| {
            let d = self.defer(DeferredKind::CheckMaps { value }, iidx);
            // The slow path returns here to recheck the migrated instance.
            self.bind(d.exit);
            d
        });
        let success = self.asm.new_dynamic_label();
        for m in rest {
            self.cmp_map(r, *m);
            self.jcc(Cond::Equal, success);
        }
        self.cmp_map(r, *last);
        match migrate {
            Some(d) => self.jcc(Cond::NotEqual, d.entry),
            None => self.deoptimize_if(Some(Cond::NotEqual), iidx, "wrong map")?,
        }
        self.bind(success);
        Ok(())
    }

    pub(super) fn deferred_instance_migration(
        &mut self,
        iidx: usize,
        value: Operand,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(value);
        self.push_safepoint_registers();
        dynasm!(self.asm; push Rq(r.code()));
        self.call_runtime_from_deferred(iidx, RuntimeFunction::TryMigrateInstance);
        // The runtime returns a smi if the instance couldn't be migrated.
        self.test_smi(RESULT);
        self.pop_safepoint_registers();
        self.deoptimize_if(Some(Cond::Equal), iidx, "instance migration failed")
    }
}
