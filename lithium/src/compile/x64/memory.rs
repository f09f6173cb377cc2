//! Loads, stores, write barriers and inline allocation.

use super::{deferred::DeferredKind, Assemble, Cond, DOUBLE_SCRATCH, RESULT, SCRATCH};
use crate::{
    compile::{BailoutReason, CompilationError},
    heap::{
        cell, context, field, heap_number, js_object, page, smi_word, ElementsKind, Handle,
        RootIndex, MAP_OFFSET, POINTER_SIZE, ZAP_VALUE,
    },
    lir::{
        AllocFlags, ConstValue, Constant, FieldAccess, HoleCheck, Operand, Representation,
        WriteBarrier,
    },
    runtime::{AllocSpace, ExternalRef, RuntimeFunction, Stub},
};
use dynasmrt::{
    dynasm,
    x64::{Rq, Rx},
    DynamicLabel, DynasmApi, Register as dynasmrtRegister,
};

/// The size of an inline allocation.
#[derive(Clone, Copy, Debug)]
pub(super) enum AllocSize {
    Const(i32),
    /// An int32 register.
    Reg(Rq),
}

/// The raw word a tagged constant is stored as.
fn tagged_word(c: Constant) -> Option<i64> {
    match c.value {
        ConstValue::Object(h) => Some(h.addr()),
        _ => c.integer_value().map(smi_word),
    }
}

impl Assemble<'_> {
    /// Jump to `l` if none of the `mask` flags are set on the page `obj` lives on. Clobbers
    /// [SCRATCH].
    fn jump_if_page_flags_clear(&mut self, obj: Rq, mask: i32, l: DynamicLabel) {
        self.mov_imm64(SCRATCH, i64::from(page::ALIGNMENT_MASK));
        dynasm!(self.asm
            ; and Rq(SCRATCH.code()), Rq(obj.code())
            ; test DWORD [Rq(SCRATCH.code()) + page::FLAGS_OFFSET], mask
        );
        self.jcc(Cond::Equal, l);
    }

    /// Tell the collector that `value` was stored at `address` inside `object`. Clobbers
    /// `address` and [SCRATCH].
    pub(super) fn record_write(&mut self, object: Rq, address: Rq, value: Rq, smi_check: bool) {
        assert!(object != value && object != address && value != address);
        let done = self.asm.new_dynamic_label();
        if smi_check {
            self.test_smi(value);
            self.jcc(Cond::Equal, done);
        }
        self.jump_if_page_flags_clear(value, page::POINTERS_TO_HERE_ARE_INTERESTING, done);
        self.jump_if_page_flags_clear(object, page::POINTERS_FROM_HERE_ARE_INTERESTING, done);
        let stub = self.rt.stub_entry(Stub::RecordWrite {
            object: object.code(),
            value: value.code(),
            address: address.code(),
            save_doubles: self.info().saves_caller_doubles,
            remembered_set: true,
        });
        self.call_address(stub);
        self.bind(done);
        if self.config.debug_code {
            self.mov_imm64(address, ZAP_VALUE);
            self.mov_imm64(value, ZAP_VALUE);
        }
    }

    /// [Assemble::record_write] for a store to `[object + disp]`. `scratch` receives the field
    /// address.
    pub(super) fn record_write_field(
        &mut self,
        object: Rq,
        disp: i32,
        value: Rq,
        scratch: Rq,
        smi_check: bool,
    ) {
        let done = self.asm.new_dynamic_label();
        if smi_check {
            self.test_smi(value);
            self.jcc(Cond::Equal, done);
        }
        dynasm!(self.asm; lea Rq(scratch.code()), [Rq(object.code()) + disp]);
        self.record_write(object, scratch, value, false);
        self.bind(done);
    }

    /// The write barrier for a map store. Maps are never in new space, so only the map's page
    /// is checked.
    fn record_write_for_map(&mut self, object: Rq, map: Rq, address: Rq) {
        let done = self.asm.new_dynamic_label();
        self.jump_if_page_flags_clear(map, page::POINTERS_TO_HERE_ARE_INTERESTING, done);
        dynasm!(self.asm; lea Rq(address.code()), [Rq(object.code()) + field(MAP_OFFSET)]);
        let stub = self.rt.stub_entry(Stub::RecordWrite {
            object: object.code(),
            value: map.code(),
            address: address.code(),
            save_doubles: self.info().saves_caller_doubles,
            remembered_set: false,
        });
        self.call_address(stub);
        self.bind(done);
    }

    pub(super) fn cg_load_named_field(
        &mut self,
        result: Operand,
        object: Operand,
        access: FieldAccess,
    ) -> Result<(), CompilationError> {
        let obj = self.to_register(object);
        if access.repr == Representation::Double {
            assert!(access.in_object);
            let dst = self.to_double_register(result);
            dynasm!(self.asm; movsd Rx(dst.code()), [Rq(obj.code()) + field(access.offset)]);
            return Ok(());
        }
        let dst = self.to_register(result);
        let base = if access.in_object {
            obj
        } else {
            dynasm!(self.asm
                ; mov Rq(dst.code()), [Rq(obj.code()) + field(js_object::PROPERTIES_OFFSET)]
            );
            dst
        };
        if access.repr == Representation::Int32 {
            // Read the payload half of the smi.
            dynasm!(self.asm; mov Rd(dst.code()), [Rq(base.code()) + field(access.offset) + 4]);
        } else {
            dynasm!(self.asm; mov Rq(dst.code()), [Rq(base.code()) + field(access.offset)]);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn cg_store_named_field(
        &mut self,
        object: Operand,
        value: Operand,
        temp: Option<Operand>,
        map_temp: Option<Operand>,
        access: FieldAccess,
        transition: Option<Handle>,
        barrier: WriteBarrier,
        map_barrier: bool,
    ) -> Result<(), CompilationError> {
        let obj = self.to_register(object);
        let temp_reg = |a: &Self| {
            a.to_register(temp.unwrap_or_else(|| panic!("Field store needs a temporary")))
        };
        if access.repr == Representation::Double {
            assert!(access.in_object && transition.is_none());
            let v = self.to_double_register(value);
            dynasm!(self.asm; movsd [Rq(obj.code()) + field(access.offset)], Rx(v.code()));
            return Ok(());
        }

        if let Some(map) = transition {
            if map_barrier {
                let m = self.to_register(
                    map_temp.unwrap_or_else(|| panic!("Map write barrier needs a temporary")),
                );
                let t = temp_reg(self);
                self.move_handle(m, map);
                dynasm!(self.asm; mov [Rq(obj.code()) + field(MAP_OFFSET)], Rq(m.code()));
                self.record_write_for_map(obj, m, t);
            } else {
                self.move_handle(SCRATCH, map);
                dynasm!(self.asm; mov [Rq(obj.code()) + field(MAP_OFFSET)], Rq(SCRATCH.code()));
            }
        }

        let base = if access.in_object {
            obj
        } else {
            let t = temp_reg(self);
            dynasm!(self.asm
                ; mov Rq(t.code()), [Rq(obj.code()) + field(js_object::PROPERTIES_OFFSET)]
            );
            t
        };
        let int32 = access.repr == Representation::Int32;
        let disp = field(access.offset) + if int32 { 4 } else { 0 };
        match (value, int32) {
            (Operand::Register(_), true) => {
                let v = self.to_register(value);
                dynasm!(self.asm; mov [Rq(base.code()) + disp], Rd(v.code()));
            }
            (Operand::Register(_), false) => {
                let v = self.to_register(value);
                dynasm!(self.asm; mov [Rq(base.code()) + disp], Rq(v.code()));
            }
            (Operand::Constant(_), true) => {
                let v = self.to_integer32(value);
                dynasm!(self.asm; mov DWORD [Rq(base.code()) + disp], v);
            }
            (_, true) => {
                self.load_operand(SCRATCH, value)?;
                dynasm!(self.asm; mov [Rq(base.code()) + disp], Rd(SCRATCH.code()));
            }
            (_, false) => {
                self.load_operand(SCRATCH, value)?;
                dynasm!(self.asm; mov [Rq(base.code()) + disp], Rq(SCRATCH.code()));
            }
        }

        if let WriteBarrier::Emit { smi_check } = barrier {
            let v = self.to_register(value);
            // An out-of-object store has the properties array in `temp`, so the object register
            // is free for the address.
            let address = if access.in_object {
                temp_reg(self)
            } else {
                obj
            };
            self.record_write_field(base, disp, v, address, smi_check);
        }
        Ok(())
    }

    pub(super) fn cg_load_context_slot(
        &mut self,
        iidx: usize,
        result: Operand,
        context: Operand,
        slot: usize,
        hole_check: HoleCheck,
    ) -> Result<(), CompilationError> {
        let dst = self.to_register(result);
        let cx = self.to_register(context);
        dynasm!(self.asm
            ; mov Rq(dst.code()), [Rq(cx.code()) + field(context::slot_offset(slot))]
        );
        match hole_check {
            HoleCheck::None => (),
            HoleCheck::Deopt => {
                self.compare_root(dst, RootIndex::TheHoleValue);
                self.deoptimize_if(Some(Cond::Equal), iidx, "hole")?;
            }
            HoleCheck::Soft => {
                let skip = self.asm.new_dynamic_label();
                self.compare_root(dst, RootIndex::TheHoleValue);
                self.jcc(Cond::NotEqual, skip);
                self.load_root(dst, RootIndex::UndefinedValue);
                self.bind(skip);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn cg_store_context_slot(
        &mut self,
        iidx: usize,
        context: Operand,
        value: Operand,
        temp: Operand,
        slot: usize,
        hole_check: HoleCheck,
        barrier: WriteBarrier,
    ) -> Result<(), CompilationError> {
        let cx = self.to_register(context);
        let disp = field(context::slot_offset(slot));
        let skip = self.asm.new_dynamic_label();
        if hole_check != HoleCheck::None {
            self.load_root(SCRATCH, RootIndex::TheHoleValue);
            dynasm!(self.asm; cmp [Rq(cx.code()) + disp], Rq(SCRATCH.code()));
            if hole_check == HoleCheck::Deopt {
                self.deoptimize_if(Some(Cond::Equal), iidx, "hole")?;
            } else {
                self.jcc(Cond::NotEqual, skip);
            }
        }
        let v = match value {
            Operand::Register(_) => self.to_register(value),
            _ => {
                self.load_operand(SCRATCH, value)?;
                SCRATCH
            }
        };
        dynasm!(self.asm; mov [Rq(cx.code()) + disp], Rq(v.code()));
        if let WriteBarrier::Emit { smi_check } = barrier {
            let v = self.to_register(value);
            let t = self.to_register(temp);
            self.record_write_field(cx, disp, v, t, smi_check);
        }
        self.bind(skip);
        Ok(())
    }

    pub(super) fn cg_load_global_cell(
        &mut self,
        iidx: usize,
        result: Operand,
        cell: Handle,
        requires_hole_check: bool,
    ) -> Result<(), CompilationError> {
        let dst = self.to_register(result);
        self.move_handle(dst, cell);
        dynasm!(self.asm; mov Rq(dst.code()), [Rq(dst.code()) + field(cell::VALUE_OFFSET)]);
        if requires_hole_check {
            self.compare_root(dst, RootIndex::TheHoleValue);
            self.deoptimize_if(Some(Cond::Equal), iidx, "hole")?;
        }
        Ok(())
    }

    /// Global cells are old-space objects holding old-space values, so no write barrier is
    /// needed.
    pub(super) fn cg_store_global_cell(
        &mut self,
        iidx: usize,
        value: Operand,
        cell: Handle,
        temp: Option<Operand>,
        requires_hole_check: bool,
    ) -> Result<(), CompilationError> {
        let v = self.to_register(value);
        let disp = field(cell::VALUE_OFFSET);
        if requires_hole_check {
            let c = self.to_register(
                temp.unwrap_or_else(|| panic!("Global cell hole check needs a temporary")),
            );
            self.move_handle(c, cell);
            self.load_root(SCRATCH, RootIndex::TheHoleValue);
            dynasm!(self.asm; cmp [Rq(c.code()) + disp], Rq(SCRATCH.code()));
            self.deoptimize_if(Some(Cond::Equal), iidx, "hole")?;
            dynasm!(self.asm; mov [Rq(c.code()) + disp], Rq(v.code()));
        } else {
            self.move_handle(SCRATCH, cell);
            dynasm!(self.asm; mov [Rq(SCRATCH.code()) + disp], Rq(v.code()));
        }
        Ok(())
    }

    /// The address of element `key` of `elements` as `(base, disp)`. A register key is sign
    /// extended in place and the scaled address is computed into [SCRATCH].
    fn element_address(
        &mut self,
        elements: Rq,
        key: Operand,
        kind: ElementsKind,
        base_offset: i32,
    ) -> Result<(Rq, i32), CompilationError> {
        let shift = kind.size_log2();
        if let Some(k) = self.int32_constant(key) {
            if k as u32 & 0xF000_0000 != 0 {
                return Err(self.abort(BailoutReason::ArrayIndexConstantValueTooBig));
            }
            return Ok((elements, (k << shift) + base_offset));
        }
        let (e, k, s) = (
            elements.code(),
            self.to_register(key).code(),
            SCRATCH.code(),
        );
        dynasm!(self.asm; movsxd Rq(k), Rd(k));
        match shift {
            0 => dynasm!(self.asm; lea Rq(s), [Rq(e) + Rq(k)]),
            1 => dynasm!(self.asm; lea Rq(s), [Rq(e) + Rq(k) * 2]),
            2 => dynasm!(self.asm; lea Rq(s), [Rq(e) + Rq(k) * 4]),
            3 => dynasm!(self.asm; lea Rq(s), [Rq(e) + Rq(k) * 8]),
            _ => unreachable!(),
        }
        Ok((SCRATCH, base_offset))
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn cg_load_keyed(
        &mut self,
        iidx: usize,
        result: Operand,
        elements: Operand,
        key: Operand,
        kind: ElementsKind,
        base_offset: i32,
        requires_hole_check: bool,
    ) -> Result<(), CompilationError> {
        let el = self.to_register(elements);
        let (b, disp) = self.element_address(el, key, kind, base_offset)?;
        let b = b.code();
        match kind {
            ElementsKind::FastDouble | ElementsKind::Float64 => {
                if requires_hole_check {
                    dynasm!(self.asm
                        ; cmp DWORD [Rq(b) + disp + 4], heap_number::HOLE_NAN_UPPER32 as i32
                    );
                    self.deoptimize_if(Some(Cond::Equal), iidx, "hole")?;
                }
                let dst = self.to_double_register(result).code();
                dynasm!(self.asm; movsd Rx(dst), [Rq(b) + disp]);
            }
            ElementsKind::Float32 => {
                let dst = self.to_double_register(result).code();
                dynasm!(self.asm; cvtss2sd Rx(dst), [Rq(b) + disp]);
            }
            ElementsKind::Int8 => {
                let dst = self.to_register(result).code();
                dynasm!(self.asm; movsx Rd(dst), BYTE [Rq(b) + disp]);
            }
            ElementsKind::Uint8 | ElementsKind::Uint8Clamped => {
                let dst = self.to_register(result).code();
                dynasm!(self.asm; movzx Rd(dst), BYTE [Rq(b) + disp]);
            }
            ElementsKind::Int16 => {
                let dst = self.to_register(result).code();
                dynasm!(self.asm; movsx Rd(dst), WORD [Rq(b) + disp]);
            }
            ElementsKind::Uint16 => {
                let dst = self.to_register(result).code();
                dynasm!(self.asm; movzx Rd(dst), WORD [Rq(b) + disp]);
            }
            ElementsKind::Int32 => {
                let dst = self.to_register(result).code();
                dynasm!(self.asm; mov Rd(dst), [Rq(b) + disp]);
            }
            ElementsKind::Uint32 => {
                let dst = self.to_register(result).code();
                dynasm!(self.asm
                    ; mov Rd(dst), [Rq(b) + disp]
                    ; test Rd(dst), Rd(dst)
                );
                // Values above int32 range have no int32 representation.
                self.deoptimize_if(Some(Cond::Sign), iidx, "negative value")?;
            }
            ElementsKind::FastSmi | ElementsKind::Fast => {
                let dst = self.to_register(result);
                dynasm!(self.asm; mov Rq(dst.code()), [Rq(b) + disp]);
                if requires_hole_check {
                    if kind == ElementsKind::FastSmi {
                        self.test_smi(dst);
                        self.deoptimize_if(Some(Cond::NotEqual), iidx, "not a smi")?;
                    } else {
                        self.compare_root(dst, RootIndex::TheHoleValue);
                        self.deoptimize_if(Some(Cond::Equal), iidx, "hole")?;
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn cg_store_keyed(
        &mut self,
        elements: Operand,
        key: Operand,
        value: Operand,
        kind: ElementsKind,
        base_offset: i32,
        barrier: WriteBarrier,
        canonicalize_nan: bool,
    ) -> Result<(), CompilationError> {
        let el = self.to_register(elements);
        if kind.is_double() {
            let v = self.to_double_register(value);
            // Convert before the address computation takes SCRATCH.
            let src = match kind {
                ElementsKind::FastDouble if canonicalize_nan => {
                    self.canonicalize_nan(DOUBLE_SCRATCH, v);
                    DOUBLE_SCRATCH
                }
                ElementsKind::Float32 => {
                    dynasm!(self.asm; cvtsd2ss Rx(DOUBLE_SCRATCH.code()), Rx(v.code()));
                    DOUBLE_SCRATCH
                }
                _ => v,
            };
            let (b, disp) = self.element_address(el, key, kind, base_offset)?;
            if kind == ElementsKind::Float32 {
                dynasm!(self.asm; movss [Rq(b.code()) + disp], Rx(src.code()));
            } else {
                dynasm!(self.asm; movsd [Rq(b.code()) + disp], Rx(src.code()));
            }
            return Ok(());
        }

        let (b, disp) = self.element_address(el, key, kind, base_offset)?;
        let b = b.code();
        if kind.is_external() {
            match value {
                Operand::Register(_) => {
                    let v = self.to_register(value).code();
                    match kind.size_log2() {
                        0 => dynasm!(self.asm; mov [Rq(b) + disp], Rb(v)),
                        1 => dynasm!(self.asm; mov [Rq(b) + disp], Rw(v)),
                        _ => dynasm!(self.asm; mov [Rq(b) + disp], Rd(v)),
                    }
                }
                _ => {
                    let v = self.to_integer32(value);
                    match kind.size_log2() {
                        0 => dynasm!(self.asm; mov BYTE [Rq(b) + disp], v as i8),
                        1 => dynasm!(self.asm; mov WORD [Rq(b) + disp], v as i16),
                        _ => dynasm!(self.asm; mov DWORD [Rq(b) + disp], v),
                    }
                }
            }
            return Ok(());
        }

        match value {
            Operand::Register(_) => {
                let v = self.to_register(value).code();
                dynasm!(self.asm; mov [Rq(b) + disp], Rq(v));
            }
            Operand::Constant(_) => {
                let c = self.to_constant(value);
                let Some(word) = tagged_word(c) else {
                    return Err(self.abort(BailoutReason::UnsupportedDoubleImmediate));
                };
                if b == SCRATCH.code() {
                    // The address is in SCRATCH: store the word in halves.
                    let (lo, hi) = (word as i32, (word >> 32) as i32);
                    dynasm!(self.asm
                        ; mov DWORD [Rq(b) + disp], lo
                        ; mov DWORD [Rq(b) + disp + 4], hi
                    );
                } else {
                    self.mov_imm64(SCRATCH, word);
                    dynasm!(self.asm; mov [Rq(b) + disp], Rq(SCRATCH.code()));
                }
            }
            _ => panic!("Can't store {value} into an elements array"),
        }

        if let WriteBarrier::Emit { smi_check } = barrier {
            let v = self.to_register(value);
            let k = self.to_register(key);
            dynasm!(self.asm; lea Rq(k.code()), [Rq(b) + disp]);
            self.record_write(el, k, v, smi_check);
        }
        Ok(())
    }

    /// Copy `src` to `dst`, replacing any NaN with the canonical NaN. Clobbers [SCRATCH].
    fn canonicalize_nan(&mut self, dst: Rx, src: Rx) {
        let have_value = self.asm.new_dynamic_label();
        dynasm!(self.asm
            ; movaps Rx(dst.code()), Rx(src.code())
            ; ucomisd Rx(src.code()), Rx(src.code())
        );
        self.jcc(Cond::ParityOdd, have_value);
        self.load_double_bits(dst, heap_number::CANONICAL_NAN);
        self.bind(have_value);
    }

    /// Deoptimise unless `index` is below `length` (or equal to it, if `allow_equality`).
    pub(super) fn cg_bounds_check(
        &mut self,
        iidx: usize,
        index: Operand,
        length: Operand,
        allow_equality: bool,
        skip_check: bool,
    ) -> Result<(), CompilationError> {
        if skip_check && !self.config.debug_code {
            return Ok(());
        }
        // The condition under which `length cmp index` fails the check.
        let mut cond = if allow_equality {
            Cond::Below
        } else {
            Cond::BelowEqual
        };
        match (self.int32_constant(length), self.int32_constant(index)) {
            (Some(l), Some(i)) => {
                let (l, i) = (l as u32, i as u32);
                if i < l || (allow_equality && i == l) {
                    return Ok(());
                }
                return self.bounds_failure(iidx, None, skip_check);
            }
            (Some(l), None) => {
                let i = self.to_register(index);
                dynasm!(self.asm; cmp Rd(i.code()), l);
                cond = match cond {
                    Cond::Below => Cond::Above,
                    _ => Cond::AboveEqual,
                };
            }
            (None, Some(i)) => match length {
                Operand::Register(_) => {
                    let l = self.to_register(length);
                    dynasm!(self.asm; cmp Rd(l.code()), i);
                }
                _ => {
                    let (base, disp) = self.to_memory(length);
                    dynasm!(self.asm; cmp DWORD [Rq(base.code()) + disp], i);
                }
            },
            (None, None) => {
                let i = self.to_register(index);
                match length {
                    Operand::Register(_) => {
                        let l = self.to_register(length);
                        dynasm!(self.asm; cmp Rd(l.code()), Rd(i.code()));
                    }
                    _ => {
                        let (base, disp) = self.to_memory(length);
                        dynasm!(self.asm; cmp [Rq(base.code()) + disp], Rd(i.code()));
                    }
                }
            }
        }
        self.bounds_failure(iidx, Some(cond), skip_check)
    }

    /// Leave code whose bounds check failed. A check the optimiser proved redundant traps
    /// instead.
    fn bounds_failure(
        &mut self,
        iidx: usize,
        cond: Option<Cond>,
        skip_check: bool,
    ) -> Result<(), CompilationError> {
        if !skip_check {
            return self.deoptimize_if(cond, iidx, "out of bounds");
        }
        match cond {
            Some(c) => {
                let done = self.asm.new_dynamic_label();
                self.jcc(c.negate(), done);
                dynasm!(self.asm; int3);
                self.bind(done);
            }
            None => dynasm!(self.asm; int3),
        }
        Ok(())
    }

    /// Bump-allocate `size` bytes in `space` and leave the tagged object in `result`. Jumps to
    /// `gc` if the space is exhausted or inline allocation is disabled. Clobbers `top` and
    /// [SCRATCH].
    pub(super) fn allocate(
        &mut self,
        result: Rq,
        size: AllocSize,
        top: Rq,
        space: AllocSpace,
        gc: DynamicLabel,
    ) {
        if !self.config.inline_new {
            self.jmp(gc);
            return;
        }
        assert!(result != top);
        let top_addr = self.rt.external(ExternalRef::AllocationTop(space)) as i64;
        let limit_addr = self.rt.external(ExternalRef::AllocationLimit(space)) as i64;
        let (r, t, s) = (result.code(), top.code(), SCRATCH.code());
        dynasm!(self.asm
            ; mov Rq(s), QWORD top_addr
            ; mov Rq(r), [Rq(s)]
        );
        match size {
            AllocSize::Const(n) => dynasm!(self.asm
                ; mov Rq(t), Rq(r)
                ; add Rq(t), n
            ),
            AllocSize::Reg(n) => dynasm!(self.asm
                ; mov Rd(t), Rd(n.code())
                ; add Rq(t), Rq(r)
            ),
        }
        // Carry means the top wrapped around.
        self.jcc(Cond::Below, gc);
        dynasm!(self.asm
            ; mov Rq(s), QWORD limit_addr
            ; cmp Rq(t), [Rq(s)]
        );
        self.jcc(Cond::Above, gc);
        dynasm!(self.asm
            ; mov Rq(s), QWORD top_addr
            ; mov [Rq(s)], Rq(t)
            ; inc Rq(r)
        );
    }

    pub(super) fn cg_allocate(
        &mut self,
        iidx: usize,
        result: Operand,
        size: Operand,
        temp: Operand,
        flags: AllocFlags,
    ) -> Result<(), CompilationError> {
        let dst = self.to_register(result);
        let t = self.to_register(temp);
        let d = self.defer(
            DeferredKind::Allocate {
                result,
                size,
                space: flags.space,
            },
            iidx,
        );
        // Doubles need no extra alignment: allocation is always pointer aligned on x64.
        let sz = match self.int32_constant(size) {
            Some(n) => AllocSize::Const(n),
            None => AllocSize::Reg(self.to_register(size)),
        };
        match sz {
            AllocSize::Const(n) if n > page::MAX_REGULAR_HEAP_OBJECT_SIZE => self.jmp(d.entry),
            _ => self.allocate(dst, sz, t, flags.space, d.entry),
        }
        self.bind(d.exit);

        if flags.prefill_with_filler {
            // The loop counts down the words after the map and needs at least one of them.
            let done = self.asm.new_dynamic_label();
            match sz {
                AllocSize::Const(n) if n <= POINTER_SIZE => return Ok(()),
                AllocSize::Const(n) => self.mov_imm64(t, i64::from(n / POINTER_SIZE - 1)),
                AllocSize::Reg(n) => {
                    dynasm!(self.asm
                        ; mov Rd(t.code()), Rd(n.code())
                        ; shr Rd(t.code()), 3
                        ; dec Rd(t.code())
                    );
                    self.jcc(Cond::Equal, done);
                }
            }
            let (r, t) = (dst.code(), t.code());
            // The first word is left for the map.
            self.load_root(SCRATCH, RootIndex::OnePointerFillerMap);
            let fill = self.asm.new_dynamic_label();
            self.bind(fill);
            dynasm!(self.asm
                ; mov [Rq(r) + Rq(t) * 8 + field(0)], Rq(SCRATCH.code())
                ; dec Rd(t)
            );
            self.jcc(Cond::NotEqual, fill);
            self.bind(done);
        }
        Ok(())
    }

    pub(super) fn deferred_allocate(
        &mut self,
        iidx: usize,
        result: Operand,
        size: Operand,
        space: AllocSpace,
    ) -> Result<(), CompilationError> {
        let dst = self.to_register(result);
        // The collector may see `result` before the call returns.
        self.move_smi(dst, 0);
        self.push_safepoint_registers();
        match self.int32_constant(size) {
            Some(n) => {
                self.move_smi(SCRATCH, n);
                dynasm!(self.asm; push Rq(SCRATCH.code()));
            }
            None => {
                let s = self.to_register(size);
                dynasm!(self.asm
                    ; shl Rq(s.code()), 32
                    ; push Rq(s.code())
                );
            }
        }
        self.move_smi(SCRATCH, i32::from(space as u8));
        dynasm!(self.asm; push Rq(SCRATCH.code()));
        self.call_runtime_from_deferred(iidx, RuntimeFunction::AllocateInTargetSpace);
        self.store_to_safepoint_register_slot(dst, RESULT);
        self.pop_safepoint_registers();
        Ok(())
    }
}
