//! Deoptimisation support: turning environments into translations, emitting the guards that
//! leave optimised code, and the jump table those guards branch to.

use super::{Assemble, Cond, CONTEXT, FP_REGS, GP_REGS, SCRATCH};
use crate::{
    compile::{BailoutReason, CompilationError},
    deopt::{DeoptEntry, DeoptimizationData, Literal, Translation, SELF_LITERAL_ID},
    heap::{frame, Handle},
    lir::{
        Chunk, ConstValue, EnvIdx, EnvValue, Environment, FrameType, ObjectMapping, Operand,
        ValueTag,
    },
    log::Verbosity,
    runtime::{BailoutType, ExternalRef},
    safepoint::DeoptMode,
};
use dynasmrt::{dynasm, DynamicLabel, DynasmApi, DynasmLabelApi, Register as dynasmrtRegister};

/// A shared exit to a deoptimisation entry.
#[derive(Clone, Debug)]
pub(super) struct JumpTableEntry {
    label: DynamicLabel,
    address: u64,
    kind: BailoutType,
    /// The guard runs before a frame is built, so the exit must build one.
    needs_frame: bool,
    reason: String,
}

/// Return the index of `lit` in `literals`, adding it if it isn't already there.
fn define_literal(literals: &mut Vec<Literal>, lit: Literal) -> usize {
    match literals.iter().position(|x| *x == lit) {
        Some(i) => i,
        None => {
            literals.push(lit);
            literals.len() - 1
        }
    }
}

fn literal_id(literals: &mut Vec<Literal>, lit: Literal) -> Result<i32, CompilationError> {
    operand(define_literal(literals, lit))
}

/// Translation operands are written as `i32`s.
fn operand(x: usize) -> Result<i32, CompilationError> {
    i32::try_from(x)
        .map_err(|_| CompilationError::LimitExceeded(format!("Translation operand {x} too large")))
}

/// Walks an environment's values, tracking which captured object and which dematerialised value
/// comes next.
struct ValueWriter<'c> {
    chunk: &'c Chunk,
    env: &'c Environment,
    object_index: usize,
    dematerialized_index: usize,
}

impl ValueWriter<'_> {
    fn write(
        &mut self,
        t: &mut Translation,
        literals: &mut Vec<Literal>,
        v: EnvValue,
    ) -> Result<(), CompilationError> {
        let (op, tag) = match v {
            EnvValue::MaterializationMarker => {
                let idx = self.object_index;
                self.object_index += 1;
                match self.env.object_mapping(idx) {
                    ObjectMapping::Duplicate { of } => t.duplicate_object(operand(of)?),
                    ObjectMapping::New {
                        length,
                        is_arguments,
                    } => {
                        if is_arguments {
                            t.begin_arguments_object(operand(length)?);
                        } else {
                            t.begin_captured_object(operand(length)?);
                        }
                        let start = self.env.translation_size() + self.dematerialized_index;
                        self.dematerialized_index += length;
                        for i in 0..length {
                            let field = self.env.value_at(start + i);
                            self.write(t, literals, field)?;
                        }
                    }
                }
                return Ok(());
            }
            EnvValue::Operand(op, tag) => (op, tag),
        };
        match op {
            Operand::StackSlot(i) => match tag {
                ValueTag::Int32 => t.store_int32_stack_slot(i),
                ValueTag::Uint32 => t.store_uint32_stack_slot(i),
                ValueTag::Tagged => t.store_stack_slot(i),
                ValueTag::Double => t.store_double_stack_slot(i),
            },
            Operand::DoubleStackSlot(i) => t.store_double_stack_slot(i),
            Operand::Register(i) => {
                let code = GP_REGS[usize::from(i)].code();
                match tag {
                    ValueTag::Int32 => t.store_int32_register(code),
                    ValueTag::Uint32 => t.store_uint32_register(code),
                    ValueTag::Tagged => t.store_register(code),
                    ValueTag::Double => panic!("Double value in general purpose register {op}"),
                }
            }
            Operand::DoubleRegister(i) => t.store_double_register(FP_REGS[usize::from(i)].code()),
            Operand::Constant(c) => {
                let c = self.chunk.constant(c);
                let lit = match (c.value, c.integer_value()) {
                    (ConstValue::Object(h), _) => Literal::Object(h),
                    (_, Some(x)) | (ConstValue::Int32(x), None) => Literal::Smi(x),
                    (ConstValue::Double(d), None) => Literal::Number(d.to_bits()),
                };
                t.store_literal(literal_id(literals, lit)?);
            }
        }
        Ok(())
    }
}

/// Write the frame description of `env`, and all its values, to `t`.
fn write_frame(
    t: &mut Translation,
    literals: &mut Vec<Literal>,
    chunk: &Chunk,
    env: &Environment,
) -> Result<(), CompilationError> {
    let size = env.translation_size();
    let closure_id = |literals: &mut Vec<Literal>| match chunk.info.closure {
        Some(c) if c == env.closure => Ok(SELF_LITERAL_ID),
        _ => literal_id(literals, Literal::Object(env.closure)),
    };
    match env.frame_type {
        FrameType::JsFunction => {
            let id = closure_id(literals)?;
            t.begin_js_frame(env.ast_id, id, operand(env.height())?);
        }
        FrameType::JsConstruct => {
            let id = closure_id(literals)?;
            t.begin_construct_stub_frame(id, operand(size)?);
        }
        FrameType::JsGetter => {
            assert_eq!(size, 1);
            let id = closure_id(literals)?;
            t.begin_getter_stub_frame(id);
        }
        FrameType::JsSetter => {
            assert_eq!(size, 2);
            let id = closure_id(literals)?;
            t.begin_setter_stub_frame(id);
        }
        FrameType::ArgumentsAdaptor => {
            let id = closure_id(literals)?;
            t.begin_arguments_adaptor_frame(id, operand(size)?);
        }
        FrameType::Stub => t.begin_compiled_stub_frame(),
    }
    let mut w = ValueWriter {
        chunk,
        env,
        object_index: 0,
        dematerialized_index: 0,
    };
    for v in env.values() {
        w.write(t, literals, *v)?;
    }
    Ok(())
}

impl Assemble<'_> {
    /// Make the closures inlined into this function the first deoptimisation literals.
    pub(super) fn seed_inlined_closures(&mut self) {
        for h in self.chunk.inlined_closures() {
            define_literal(&mut self.literals, Literal::Object(*h));
        }
    }

    /// Write a translation for `env` (and its outer environments) and return its deoptimisation
    /// index. Registering an environment a second time returns the first registration's index.
    pub(super) fn register_environment_for_deoptimization(
        &mut self,
        env: EnvIdx,
        mode: DeoptMode,
    ) -> Result<usize, CompilationError> {
        if let Some(idx) = self.env_deopt_index[env] {
            return Ok(idx);
        }
        let chunk = self.chunk;
        let envs = chunk.envs();
        let chain = envs.chain(env);
        let js_frames = chain
            .iter()
            .filter(|x| envs[**x].frame_type == FrameType::JsFunction)
            .count();
        let mut t = Translation::begin(
            &mut self.translations,
            operand(chain.len())?,
            operand(js_frames)?,
        );
        for x in &chain {
            write_frame(&mut t, &mut self.literals, chunk, &envs[*x])?;
        }
        let translation_index = t.index();

        let e = &envs[env];
        let pc = match mode {
            DeoptMode::LazyDeopt => operand(self.asm.offset().0)?,
            DeoptMode::NoLazyDeopt => -1,
        };
        let idx = self.deopt_entries.len();
        self.deopt_entries.push(DeoptEntry {
            ast_id: e.ast_id,
            translation_index,
            arguments_stack_height: e.arguments_stack_height,
            pc,
        });
        self.env_deopt_index[env] = Some(idx);
        self.log.log(
            Verbosity::CodegenEvent,
            &format!(
                "registered environment {} ({} frames) as deoptimization index {idx}",
                env.index(),
                chain.len()
            ),
        );
        Ok(idx)
    }

    /// Deoptimise if `cond` holds, or unconditionally if `cond` is `None`, using the default
    /// bailout kind for this code.
    pub(super) fn deoptimize_if(
        &mut self,
        cond: Option<Cond>,
        iidx: usize,
        reason: &str,
    ) -> Result<(), CompilationError> {
        let kind = if self.is_stub() {
            BailoutType::Lazy
        } else {
            BailoutType::Eager
        };
        self.deoptimize_if_kind(cond, iidx, kind, reason)
    }

    /// # Panics
    ///
    /// If instruction `iidx` has no environment.
    pub(super) fn deoptimize_if_kind(
        &mut self,
        cond: Option<Cond>,
        iidx: usize,
        kind: BailoutType,
        reason: &str,
    ) -> Result<(), CompilationError> {
        let env = self
            .chunk
            .inst(iidx)
            .env
            .unwrap_or_else(|| panic!("Instruction {iidx} can deoptimize but has no environment"));
        let id = self.register_environment_for_deoptimization(env, DeoptMode::NoLazyDeopt)?;
        let Some(entry) = self.rt.deopt_entry(id, kind) else {
            return Err(self.abort(BailoutReason::BailoutWasNotPrepared));
        };

        if self.config.deopt_every_n_times != 0 && !self.is_stub() {
            self.emit_deopt_stress_check(entry);
        }

        if self.config.trap_on_deopt {
            match cond {
                Some(c) => {
                    let skip = self.asm.new_dynamic_label();
                    self.jcc(c.negate(), skip);
                    dynasm!(self.asm; int3);
                    self.bind(skip);
                }
                None => dynasm!(self.asm; int3),
            }
        }

        if cond.is_none() && self.frame_is_built && !self.info().saves_caller_doubles {
            self.comment(format!("deoptimize: {reason}"));
            self.call_address(entry);
            return Ok(());
        }
        let needs_frame = !self.frame_is_built;
        let label = match self.jump_table.last() {
            Some(e) if e.address == entry && e.kind == kind && e.needs_frame == needs_frame => {
                e.label
            }
            _ => {
                let label = self.asm.new_dynamic_label();
                self.jump_table.push(JumpTableEntry {
                    label,
                    address: entry,
                    kind,
                    needs_frame,
                    reason: reason.to_owned(),
                });
                label
            }
        };
        match cond {
            Some(c) => self.jcc(c, label),
            None => self.jmp(label),
        }
        Ok(())
    }

    /// Count down the shared stress counter and deoptimise when it hits zero, resetting it.
    /// Flags and registers are preserved on the path that doesn't deoptimise.
    fn emit_deopt_stress_check(&mut self, entry: u64) {
        debug_assert!(self.frame_is_built);
        let counter = self.rt.external(ExternalRef::StressDeoptCounter);
        let n = i32::try_from(self.config.deopt_every_n_times).unwrap_or(i32::MAX);
        dynasm!(self.asm
            ; pushfq
            ; push rax
            ; mov Rq(SCRATCH.code()), QWORD counter as i64
            ; mov eax, [Rq(SCRATCH.code())]
            ; sub eax, 1
            ; jnz >no_deopt
        );
        if self.config.trap_on_deopt {
            dynasm!(self.asm; int3);
        }
        dynasm!(self.asm
            ; mov eax, n
            ; mov [Rq(SCRATCH.code())], eax
            ; pop rax
            ; popfq
        );
        self.call_address(entry);
        // `call_address` clobbered the scratch register only on the path that never returns.
        dynasm!(self.asm
            ; no_deopt:
            ; mov [Rq(SCRATCH.code())], eax
            ; pop rax
            ; popfq
        );
    }

    pub(super) fn cg_deoptimize(
        &mut self,
        iidx: usize,
        kind: BailoutType,
        reason: &str,
    ) -> Result<(), CompilationError> {
        // Stubs can't be eagerly deoptimised: there's no unoptimised code to resume.
        let kind = if self.is_stub() && kind == BailoutType::Eager {
            BailoutType::Lazy
        } else {
            kind
        };
        self.deoptimize_if_kind(None, iidx, kind, reason)
    }

    /// Attach instruction `iidx`'s environment to the safepoints of the preceding call.
    pub(super) fn cg_lazy_bailout(&mut self, iidx: usize) -> Result<(), CompilationError> {
        self.last_lazy_deopt_pc = self.asm.offset().0;
        let env = self
            .chunk
            .inst(iidx)
            .env
            .unwrap_or_else(|| panic!("Lazy bailout {iidx} has no environment"));
        let idx = self.register_environment_for_deoptimization(env, DeoptMode::LazyDeopt)?;
        self.safepoints.record_lazy_deoptimization_index(idx);
        Ok(())
    }

    pub(super) fn generate_jump_table(&mut self) -> Result<(), CompilationError> {
        let table = std::mem::take(&mut self.jump_table);
        if !table.is_empty() {
            self.comment("-------------------- Jump table --------------------".to_owned());
        }
        let mut needs_frame: Option<DynamicLabel> = None;
        for e in table {
            self.bind(e.label);
            self.comment(format!("deoptimize: {}", e.reason));
            if e.needs_frame {
                debug_assert!(!self.info().saves_caller_doubles);
                dynasm!(self.asm; mov Rq(SCRATCH.code()), QWORD e.address as i64);
                match needs_frame {
                    Some(l) => self.jmp(l),
                    None => {
                        let l = self.asm.new_dynamic_label();
                        self.bind(l);
                        needs_frame = Some(l);
                        // There is no function to put in the frame, so push a stub marker
                        // instead.
                        let cx = CONTEXT.code();
                        dynasm!(self.asm
                            ; mov Rq(cx), [rbp + frame::CONTEXT_OFFSET]
                            ; push rbp
                            ; mov rbp, rsp
                            ; push Rq(cx)
                        );
                        self.move_smi(CONTEXT, frame::STUB_MARKER);
                        dynasm!(self.asm
                            ; push Rq(cx)
                            ; mov Rq(cx), [rsp + 8]
                            ; call Rq(SCRATCH.code())
                        );
                    }
                }
            } else {
                if self.info().saves_caller_doubles {
                    self.restore_caller_doubles();
                }
                self.call_address(e.address);
            }
        }
        Ok(())
    }

    /// The number of distinct inlined closures, which are the first literals.
    fn inlined_function_count(&self) -> usize {
        let mut seen: Vec<Handle> = Vec::new();
        for h in self.chunk.inlined_closures() {
            if !seen.contains(h) {
                seen.push(*h);
            }
        }
        seen.len()
    }

    /// Hand over the deoptimisation data gathered during code generation.
    pub(super) fn deoptimization_data(&mut self) -> Result<DeoptimizationData, CompilationError> {
        let osr_pc_offset = self.osr_pc_offset.map_or(Ok(-1), operand)?;
        let info = self.info();
        Ok(DeoptimizationData {
            translations: std::mem::take(&mut self.translations).into_bytes(),
            inlined_function_count: self.inlined_function_count(),
            optimization_id: info.optimization_id,
            shared_info: info.shared_info,
            literals: std::mem::take(&mut self.literals),
            osr_ast_id: info.osr_ast_id,
            osr_pc_offset,
            entries: std::mem::take(&mut self.deopt_entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::{
        config::CodegenConfig,
        deopt::{
            FrameFunction, MachineSnapshot, TranslatedFrame, TranslatedFrameKind, TranslatedValue,
        },
        lir::{Constant, Inst, LInstruction, LabelKind, NO_BAILOUT_ID},
        runtime::{test_runtime::TestRuntime, Stub},
    };

    /// A chunk with one block whose only instruction deoptimises to `env`.
    fn deopt_chunk(mut c: crate::lir::Chunk, env: EnvIdx) -> crate::lir::Chunk {
        let b = c.new_block();
        c.push(Inst::Label {
            block: b,
            kind: LabelKind::Plain,
        });
        c.push(
            LInstruction::new(Inst::Deoptimize {
                kind: BailoutType::Eager,
                reason: "test",
            })
            .with_env(env),
        );
        c
    }

    #[test]
    fn function_frame() {
        let mut c = function_chunk(1);
        c.set_spill_slot_count(1);
        let k = c.add_const(Constant::smi(7));
        let env = add_env(&mut c, 4);
        c.envs_mut()
            .get_mut(env)
            .push_value(Operand::Register(1), ValueTag::Int32)
            .push_value(k, ValueTag::Tagged)
            .push_value(Operand::DoubleStackSlot(0), ValueTag::Double);
        let c = deopt_chunk(c, env);
        let co = codegen(&c);
        match_asm(
            &co,
            "
              ...
              ; <@1> deoptimize
              ; deoptimize: test
              mov r10, 0x70000000
              call r10
              ...
            ",
        );

        let dd = co.deoptimization_data();
        assert_eq!(dd.entries.len(), 1);
        assert_eq!(dd.entries[0].ast_id, 4);
        assert_eq!(dd.entries[0].pc, -1);
        assert_eq!(dd.literals, vec![Literal::Smi(7)]);
        assert_eq!(dd.osr_pc_offset, -1);

        let mut snap = MachineSnapshot::default();
        snap.slots.insert(-2, 0x11);
        snap.slots.insert(-1, 0x22);
        snap.slots.insert(0, 2.5f64.to_bits());
        snap.registers[3] = 0xFFFF_FFFF;
        assert_eq!(
            dd.replay(0, &snap).unwrap(),
            vec![TranslatedFrame {
                kind: TranslatedFrameKind::JsFunction {
                    ast_id: 4,
                    function: FrameFunction::Compiling,
                    height: 3
                },
                values: vec![
                    TranslatedValue::Tagged(0x11),
                    TranslatedValue::Tagged(0x22),
                    TranslatedValue::Int32(-1),
                    TranslatedValue::Literal(Literal::Smi(7)),
                    TranslatedValue::Double(2.5),
                ]
            }]
        );
    }

    #[test]
    fn inlined_frames_and_captured_objects() {
        let inlined = Handle(0x2001);
        let mut c = function_chunk(0);
        c.add_inlined_closure(inlined);
        c.add_inlined_closure(inlined);
        let outer = add_env(&mut c, 2);
        let mut adaptor = Environment::new(
            inlined,
            FrameType::ArgumentsAdaptor,
            NO_BAILOUT_ID,
            2,
            Some(outer),
        );
        adaptor
            .push_value(Operand::StackSlot(-1), ValueTag::Tagged)
            .push_value(Operand::Register(0), ValueTag::Tagged);
        let adaptor = c.envs_mut().push(adaptor);
        let mut inner = Environment::new(inlined, FrameType::JsFunction, 9, 1, Some(adaptor));
        inner
            .push_value(Operand::Register(0), ValueTag::Tagged)
            .push_marker()
            .push_object(
                true,
                &[EnvValue::Operand(Operand::Register(2), ValueTag::Tagged)],
            )
            .push_marker()
            .push_duplicate(0);
        let inner = c.envs_mut().push(inner);
        let c = deopt_chunk(c, inner);
        let co = codegen(&c);
        let dd = co.deoptimization_data();
        assert_eq!(dd.inlined_function_count, 1);
        assert_eq!(dd.literals, vec![Literal::Object(inlined)]);
        assert_eq!(dd.entries[0].ast_id, 9);

        let mut snap = MachineSnapshot::default();
        snap.slots.insert(-1, 0x11);
        snap.registers[0] = 0xA0;
        snap.registers[2] = 0xD0;
        let f = FrameFunction::Literal(Literal::Object(inlined));
        assert_eq!(
            dd.replay(0, &snap).unwrap(),
            vec![
                TranslatedFrame {
                    kind: TranslatedFrameKind::JsFunction {
                        ast_id: 2,
                        function: FrameFunction::Compiling,
                        height: 0
                    },
                    values: vec![TranslatedValue::Tagged(0x11)]
                },
                TranslatedFrame {
                    kind: TranslatedFrameKind::ArgumentsAdaptor {
                        function: f,
                        height: 2
                    },
                    values: vec![TranslatedValue::Tagged(0x11), TranslatedValue::Tagged(0xA0)]
                },
                TranslatedFrame {
                    kind: TranslatedFrameKind::JsFunction {
                        ast_id: 9,
                        function: f,
                        height: 2
                    },
                    values: vec![
                        TranslatedValue::Tagged(0xA0),
                        TranslatedValue::Object {
                            is_arguments: true,
                            fields: vec![TranslatedValue::Tagged(0xD0)]
                        },
                        TranslatedValue::Duplicate(0),
                    ]
                },
            ]
        );
    }

    #[test]
    fn registration_is_idempotent() {
        let mut c = function_chunk(0);
        let env = add_env(&mut c, 1);
        let other = add_env(&mut c, 2);
        with_assemble(&c, |a| {
            let i = a
                .register_environment_for_deoptimization(env, DeoptMode::NoLazyDeopt)
                .unwrap();
            assert_eq!(
                a.register_environment_for_deoptimization(env, DeoptMode::LazyDeopt)
                    .unwrap(),
                i
            );
            assert_eq!(
                a.register_environment_for_deoptimization(other, DeoptMode::NoLazyDeopt)
                    .unwrap(),
                i + 1
            );
            assert_eq!(a.deopt_entries.len(), 2);
        });
    }

    #[test]
    fn jump_table_sharing() {
        let mut c = function_chunk(0);
        let e0 = add_env(&mut c, 1);
        let e1 = add_env(&mut c, 2);
        let i0 = c.push(LInstruction::new(Inst::Dummy).with_env(e0));
        let i1 = c.push(LInstruction::new(Inst::Dummy).with_env(e1));
        with_assemble(&c, |a| {
            a.frame_is_built = true;
            a.deoptimize_if(Some(Cond::Equal), i0, "a").unwrap();
            a.deoptimize_if(Some(Cond::Overflow), i0, "b").unwrap();
            assert_eq!(a.jump_table.len(), 1);
            a.deoptimize_if(Some(Cond::Equal), i1, "c").unwrap();
            assert_eq!(a.jump_table.len(), 2);
            a.deoptimize_if_kind(Some(Cond::Equal), i1, BailoutType::Soft, "d")
                .unwrap();
            assert_eq!(a.jump_table.len(), 3);
            a.frame_is_built = false;
            a.deoptimize_if_kind(Some(Cond::Equal), i1, BailoutType::Soft, "e")
                .unwrap();
            a.deoptimize_if_kind(Some(Cond::Less), i0, BailoutType::Soft, "f")
                .unwrap();
            assert_eq!(a.jump_table.len(), 5);
            a.generate_jump_table().unwrap();
        })
        .matches(
            "
              je {{a}}
              jo {{a}}
              je {{c}}
              je {{d}}
              je {{e}}
              jl {{f}}
              ; -------------------- jump table --------------------
              ; deoptimize: a
              mov r10, 0x70000000
              call r10
              ; deoptimize: c
              mov r10, 0x70000010
              call r10
              ; deoptimize: d
              mov r10, 0x70020010
              call r10
              ; deoptimize: e
              mov r10, 0x70020010
              mov rsi, [rbp-8]
              push rbp
              mov rbp, rsp
              push rsi
              mov rsi, 0x400000000
              push rsi
              mov rsi, [rsp+8]
              call r10
              ; deoptimize: f
              mov r10, 0x70020000
              jmp {{frame}}
            ",
        );
    }

    #[test]
    fn unprepared_bailout_aborts() {
        let mut c = function_chunk(0);
        let env = add_env(&mut c, 1);
        let c = deopt_chunk(c, env);
        let mut rt = TestRuntime::new();
        rt.max_deopt_entries = 0;
        assert!(matches!(
            try_codegen_with(&c, &CodegenConfig::default(), &rt),
            Err(CompilationError::Aborted(
                BailoutReason::BailoutWasNotPrepared
            ))
        ));
    }

    #[test]
    fn stress_counter() {
        let mut c = function_chunk(0);
        let env = add_env(&mut c, 1);
        let c = deopt_chunk(c, env);
        let config = CodegenConfig {
            deopt_every_n_times: 3,
            ..Default::default()
        };
        match_asm(
            &codegen_with(&c, &config),
            "
              ...
              ; <@1> deoptimize
              pushf
              push rax
              mov r10, 0x63000100
              mov eax, [r10]
              sub eax, 1
              jne {{no_deopt}}
              mov eax, 3
              mov [r10], eax
              pop rax
              popf
              mov r10, 0x70000000
              call r10
              mov [r10], eax
              pop rax
              popf
              ; deoptimize: test
              mov r10, 0x70000000
              call r10
              ...
            ",
        );
    }

    #[test]
    fn lazy_bailout_attaches_to_call() {
        let mut c = function_chunk(0);
        let env = add_env(&mut c, 6);
        let b = c.new_block();
        c.push(Inst::Label {
            block: b,
            kind: LabelKind::Plain,
        });
        c.push(Inst::CallStub {
            stub: Stub::StackCheck,
        });
        c.push(LInstruction::new(Inst::LazyBailout).with_env(env));
        let co = codegen(&c);
        let table = co.safepoint_table().unwrap().unwrap();
        let sp = &table.entries()[0];
        assert_eq!(sp.deopt_index, Some(0));
        let dd = co.deoptimization_data();
        assert_eq!(dd.entries[0].pc, i32::try_from(sp.pc).unwrap());
        assert_eq!(dd.entries[0].ast_id, 6);
    }

    #[test]
    fn oversized_operands_are_compilation_errors() {
        assert_eq!(operand(7).unwrap(), 7);
        assert_eq!(operand(0x7FFF_FFFF).unwrap(), i32::MAX);
        assert!(matches!(
            operand(0x8000_0000),
            Err(CompilationError::LimitExceeded(_))
        ));
        let mut literals = vec![Literal::Smi(1)];
        assert_eq!(literal_id(&mut literals, Literal::Smi(2)).unwrap(), 1);
        assert!(matches!(
            operand(usize::MAX),
            Err(CompilationError::LimitExceeded(_))
        ));
    }
}
