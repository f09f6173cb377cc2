//! Out-of-line slow paths.
//!
//! Main-line code that needs a rarely taken slow path records a [Deferred] and jumps to its entry
//! label. After the body has been emitted, [Assemble::generate_deferred_code] emits every slow path
//! in request order, each ending with a jump back to its exit label.

use super::{Assemble, SCRATCH};
use crate::{
    compile::CompilationError,
    heap::{frame, Handle},
    lir::Operand,
    runtime::AllocSpace,
};
use dynasmrt::{dynasm, DynamicLabel, DynasmApi, Register as dynasmrtRegister};

/// What a slow path does. Each variant carries the operands its body needs.
#[derive(Clone, Debug, PartialEq)]
pub(super) enum DeferredKind {
    /// Call the stack guard from a loop back edge.
    StackCheck,
    /// Box a uint32 too big to be a smi.
    NumberTagU {
        result: Operand,
        value: Operand,
        temp: Operand,
        temp2: Operand,
    },
    /// Allocate a heap number through the runtime after inline allocation failed.
    NumberTagD { result: Operand },
    /// Convert a heap object to an int32.
    TaggedToI {
        result: Operand,
        value: Operand,
        temp: Operand,
        truncating: bool,
        bailout_on_minus_zero: bool,
    },
    /// Allocate through the runtime after inline allocation failed.
    Allocate {
        result: Operand,
        size: Operand,
        space: AllocSpace,
    },
    /// Call the instanceof stub, which patches the inline cache at `map_check`.
    InstanceOfKnownGlobal {
        result: Operand,
        value: Operand,
        function: Handle,
        map_check: usize,
    },
    /// Try to migrate an instance of a deprecated map, then recheck the maps.
    CheckMaps { value: Operand },
}

/// A requested slow path.
#[derive(Clone, Debug)]
pub(super) struct Deferred {
    pub(super) kind: DeferredKind,
    /// The instruction the slow path belongs to.
    pub(super) inst: usize,
    pub(super) entry: DynamicLabel,
    /// Where the slow path resumes main-line code. Bound by the requester.
    pub(super) exit: DynamicLabel,
}

impl Assemble<'_> {
    /// Request a slow path for instruction `iidx`. The caller jumps to the returned entry and
    /// binds the returned exit.
    pub(super) fn defer(&mut self, kind: DeferredKind, iidx: usize) -> Deferred {
        let d = Deferred {
            kind,
            inst: iidx,
            entry: self.asm.new_dynamic_label(),
            exit: self.asm.new_dynamic_label(),
        };
        self.deferred.push(d.clone());
        d
    }

    pub(super) fn generate_deferred_code(&mut self) -> Result<(), CompilationError> {
        let deferred = std::mem::take(&mut self.deferred);
        for d in deferred {
            self.current_instruction = d.inst;
            self.comment(format!(
                "<@{}> -------------------- Deferred {} --------------------",
                d.inst,
                self.chunk.inst(d.inst).inst.name()
            ));
            self.bind(d.entry);
            let needs_frame = self.needs_deferred_frame();
            if needs_frame {
                self.comment("Build frame".to_owned());
                assert!(!self.frame_is_built);
                assert!(self.is_stub());
                self.frame_is_built = true;
                // Build the frame without touching the context register.
                dynasm!(self.asm
                    ; push rbp
                    ; push QWORD [rbp + frame::CONTEXT_OFFSET]
                );
                self.move_smi(SCRATCH, frame::STUB_MARKER);
                dynasm!(self.asm
                    ; push Rq(SCRATCH.code())
                    ; lea rbp, [rsp + 16]
                );
                self.comment("Deferred code".to_owned());
            }
            match d.kind {
                DeferredKind::StackCheck => self.deferred_stack_check(d.inst),
                DeferredKind::NumberTagU {
                    result,
                    value,
                    temp,
                    temp2,
                } => self.deferred_number_tag_u(d.inst, result, value, temp, temp2),
                DeferredKind::NumberTagD { result } => self.deferred_number_tag_d(d.inst, result),
                DeferredKind::TaggedToI {
                    result,
                    value,
                    temp,
                    truncating,
                    bailout_on_minus_zero,
                } => self.deferred_tagged_to_i(
                    d.inst,
                    result,
                    value,
                    temp,
                    truncating,
                    bailout_on_minus_zero,
                    d.exit,
                )?,
                DeferredKind::Allocate {
                    result,
                    size,
                    space,
                } => self.deferred_allocate(d.inst, result, size, space)?,
                DeferredKind::InstanceOfKnownGlobal {
                    result,
                    value,
                    function,
                    map_check,
                } => self.deferred_instance_of_known_global(
                    d.inst, result, value, function, map_check,
                )?,
                DeferredKind::CheckMaps { value } => {
                    self.deferred_instance_migration(d.inst, value)?
                }
            }
            if needs_frame {
                self.comment("Destroy frame".to_owned());
                assert!(self.frame_is_built);
                self.frame_is_built = false;
                dynasm!(self.asm
                    ; mov rsp, rbp
                    ; pop rbp
                );
            }
            self.jmp(d.exit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::lir::{
        Chunk, CompilationInfo, Inst, LInstruction, LabelKind, Operand, PointerMap,
        StackCheckKind,
    };

    #[test]
    fn back_edge_stack_check() {
        let mut c = function_chunk(0);
        let env = add_env(&mut c, 4);
        let b = c.new_block();
        c.push(Inst::Label {
            block: b,
            kind: LabelKind::LoopHeader,
        });
        c.push(
            LInstruction::new(Inst::StackCheck {
                kind: StackCheckKind::BackEdge,
            })
            .with_env(env)
            .with_pointer_map(PointerMap::from([Operand::Register(1)])),
        );
        let co = codegen(&c);
        match_asm(
            &co,
            "
              ...
              ; <@1> stack-check
              cmp rsp, [r13+0x50]
              jb {{entry}}
              ...
              ; <@1> -------------------- deferred stack-check --------------------
              push rax
              ...
              push r15
              lea rsp, [rsp-0x28]
              mov rsi, [rbp-8]
              mov eax, 0
              mov rbx, 0x61000300
              mov r10, 0x62000001
              call r10
              lea rsp, [rsp+0x28]
              pop r15
              ...
              pop rax
              jmp {{exit}}
              ...
            ",
        );
        let table = co.safepoint_table().unwrap().unwrap();
        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].deopt_index, Some(0));
        assert!(entries[0].has_registers());
        // `rbx` is register code 3.
        assert_eq!(entries[0].pointer_registers(), &[3]);
        // The lazy deoptimisation point is the loop's resumption point, not the call.
        assert!(co.deoptimization_data().entries[0].pc < i32::try_from(entries[0].pc).unwrap());
    }

    #[test]
    fn frameless_stub_builds_deferred_frame() {
        let mut info = CompilationInfo::stub();
        info.deferred_calling = true;
        let mut c = Chunk::new(info);
        let b = c.new_block();
        c.push(Inst::Label {
            block: b,
            kind: LabelKind::Plain,
        });
        c.push(Inst::NumberTagD {
            result: Operand::Register(0),
            value: Operand::DoubleRegister(0),
            temp: Operand::Register(1),
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> -------------------- deferred number-tag-d --------------------
              ; build frame
              push rbp
              push qword [rbp-8]
              mov r10, 0x400000000
              push r10
              lea rbp, [rsp+0x10]
              ; deferred code
              ...
              ; destroy frame
              mov rsp, rbp
              pop rbp
              jmp {{exit}}
              ...
            ",
        );
    }
}
