//! The x64 code generator.
//!
//! Conventions used in this module:
//!   * Functions with a `cg_X` prefix generate code for an [Inst] variant `X`.
//!   * Helper function arguments are in order `(<destination>, <source_1>, ... <source_n>)`.
//!
//! Notes:
//!
//!   * Operands arrive register allocated: this module never chooses a register for a value, it
//!     only uses the fixed scratch registers [SCRATCH] and [DOUBLE_SCRATCH].
//!
//!   * Int32 values in 64-bit registers make no promise about their upper 32 bits. Smis are full
//!     64-bit words.

use super::{BailoutReason, CodeObject, CompilationError};
use crate::{
    config::CodegenConfig,
    deopt::{DeoptEntry, Literal, TranslationBuffer},
    heap::{self, smi_word, Handle, RootIndex},
    lir::{BlockIdx, Chunk, CompareOp, CompilationInfo, EnvIdx, Inst, Targets},
    log::{asm_phase, log_asm, AsmPhase, Log, Verbosity},
    runtime::Runtime,
    safepoint::{SafepointKind, SafepointTableBuilder},
};
use dynasmrt::{
    dynasm,
    x64::{Rq, Rx, X64Relocation},
    DynamicLabel, DynasmApi, DynasmLabelApi, Register as dynasmrtRegister, VecAssembler,
};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
use index_vec::IndexVec;
use indexmap::IndexMap;
use static_assertions::const_assert;
use std::error::Error;

mod arith;
mod calls;
mod compare;
mod convert;
mod deferred;
mod frame;
mod gap;
mod memory;
mod operand;
#[cfg(test)]
mod testing;
mod translate;

use deferred::Deferred;
use translate::JumpTableEntry;

/// Holds the current context.
const CONTEXT: Rq = Rq::RSI;
/// Holds the callee in JS calls.
const FUNCTION: Rq = Rq::RDI;
/// Holds call results.
const RESULT: Rq = Rq::RAX;
/// Never allocated: free for any code sequence to clobber.
const SCRATCH: Rq = Rq::R10;
/// Points at the root array.
const ROOTS: Rq = Rq::R13;
const DOUBLE_SCRATCH: Rx = Rx::XMM15;

/// The allocatable general purpose registers, by allocation index.
const GP_REGS: [Rq; 11] = [
    Rq::RAX,
    Rq::RBX,
    Rq::RDX,
    Rq::RCX,
    Rq::RSI,
    Rq::RDI,
    Rq::R8,
    Rq::R9,
    Rq::R11,
    Rq::R14,
    Rq::R15,
];

/// The allocatable double registers, by allocation index.
const FP_REGS: [Rx; 15] = [
    Rx::XMM0,
    Rx::XMM1,
    Rx::XMM2,
    Rx::XMM3,
    Rx::XMM4,
    Rx::XMM5,
    Rx::XMM6,
    Rx::XMM7,
    Rx::XMM8,
    Rx::XMM9,
    Rx::XMM10,
    Rx::XMM11,
    Rx::XMM12,
    Rx::XMM13,
    Rx::XMM14,
];

const_assert!(GP_REGS.len() <= lsmp::NUM_SAFEPOINT_REGISTERS);

/// The size of the call sequence the deoptimiser patches over a lazy deoptimisation point.
const LAZY_DEOPT_PATCH_SIZE: usize = 13;

/// Contexts up to this many slots are allocated by a stub rather than the runtime.
const FAST_NEW_CONTEXT_MAX_SLOTS: usize = 64;

/// A front end for the x64 code generator.
pub(crate) struct X64CodeGen {
    config: CodegenConfig,
    log: Log,
}

impl X64CodeGen {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        Self::with_config(CodegenConfig::from_env()?)
    }

    pub(crate) fn with_config(config: CodegenConfig) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            config,
            log: Log::new()?,
        })
    }
}

impl super::CodeGen for X64CodeGen {
    fn codegen(&self, chunk: &Chunk, rt: &dyn Runtime) -> Result<CodeObject, CompilationError> {
        let co = Assemble::new(chunk, rt, &self.config, &self.log).codegen()?;
        if let Some(phase) = asm_phase() {
            let dis = co
                .disassemble(phase == AsmPhase::AsmFull)
                .map_err(|e| CompilationError::InternalError(e.to_string()))?;
            log_asm(&format!("--- Begin asm ---\n{dis}\n--- End asm ---\n"));
        }
        Ok(co)
    }
}

/// The progress of one code generation pass. [Status::Aborted] is absorbing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Status {
    Unused,
    Generating,
    Done,
    Aborted,
}

/// An x64 condition code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cond {
    Equal,
    NotEqual,
    Less,
    GreaterEqual,
    LessEqual,
    Greater,
    Below,
    AboveEqual,
    BelowEqual,
    Above,
    Overflow,
    NoOverflow,
    Sign,
    NotSign,
    ParityEven,
    ParityOdd,
}

impl Cond {
    fn negate(self) -> Self {
        match self {
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::Less => Self::GreaterEqual,
            Self::GreaterEqual => Self::Less,
            Self::LessEqual => Self::Greater,
            Self::Greater => Self::LessEqual,
            Self::Below => Self::AboveEqual,
            Self::AboveEqual => Self::Below,
            Self::BelowEqual => Self::Above,
            Self::Above => Self::BelowEqual,
            Self::Overflow => Self::NoOverflow,
            Self::NoOverflow => Self::Overflow,
            Self::Sign => Self::NotSign,
            Self::NotSign => Self::Sign,
            Self::ParityEven => Self::ParityOdd,
            Self::ParityOdd => Self::ParityEven,
        }
    }

    /// The condition testing `op` after a `cmp` (or, if `unsigned`, after a `cmp` of unsigned
    /// values or a `ucomisd`).
    fn from_compare(op: CompareOp, unsigned: bool) -> Self {
        match (op, unsigned) {
            (CompareOp::Eq, _) => Self::Equal,
            (CompareOp::Ne, _) => Self::NotEqual,
            (CompareOp::Lt, false) => Self::Less,
            (CompareOp::Gt, false) => Self::Greater,
            (CompareOp::Le, false) => Self::LessEqual,
            (CompareOp::Ge, false) => Self::GreaterEqual,
            (CompareOp::Lt, true) => Self::Below,
            (CompareOp::Gt, true) => Self::Above,
            (CompareOp::Le, true) => Self::BelowEqual,
            (CompareOp::Ge, true) => Self::AboveEqual,
        }
    }
}

/// The x64 code generator for one chunk.
struct Assemble<'a> {
    chunk: &'a Chunk,
    rt: &'a dyn Runtime,
    config: &'a CodegenConfig,
    log: &'a Log,
    asm: VecAssembler<X64Relocation>,
    status: Status,
    /// The index of the instruction being lowered.
    current_instruction: usize,
    current_block: Option<BlockIdx>,
    block_labels: IndexVec<BlockIdx, DynamicLabel>,
    /// Maps assembly offsets to comments.
    ///
    /// Comments are used by the disassembler for debugging and testing only.
    comments: IndexMap<usize, Vec<String>>,
    safepoints: SafepointTableBuilder,
    /// The kind of safepoint the code currently being generated may record.
    expected_safepoint_kind: SafepointKind,
    translations: TranslationBuffer,
    /// The deoptimisation literal array. Deduplicated by identity.
    literals: Vec<Literal>,
    /// One entry per registered environment, in registration order.
    deopt_entries: Vec<DeoptEntry>,
    /// For each environment, its deoptimisation index once registered.
    env_deopt_index: IndexVec<EnvIdx, Option<usize>>,
    jump_table: Vec<JumpTableEntry>,
    /// Out-of-line code, in the order it was requested.
    deferred: Vec<Deferred>,
    frame_is_built: bool,
    osr_pc_offset: Option<usize>,
    last_lazy_deopt_pc: usize,
    prologue_offset: usize,
    no_frame_ranges: Vec<(usize, usize)>,
    source_positions: Vec<(usize, u32)>,
}

impl<'a> Assemble<'a> {
    fn new(
        chunk: &'a Chunk,
        rt: &'a dyn Runtime,
        config: &'a CodegenConfig,
        log: &'a Log,
    ) -> Box<Assemble<'a>> {
        let mut asm = VecAssembler::<X64Relocation>::new(0);
        let block_labels = (0..chunk.num_blocks())
            .map(|_| asm.new_dynamic_label())
            .collect::<IndexVec<BlockIdx, _>>();
        Box::new(Self {
            chunk,
            rt,
            config,
            log,
            asm,
            status: Status::Unused,
            current_instruction: 0,
            current_block: None,
            block_labels,
            comments: IndexMap::new(),
            safepoints: SafepointTableBuilder::new(),
            expected_safepoint_kind: SafepointKind::Simple,
            translations: TranslationBuffer::new(),
            literals: Vec::new(),
            deopt_entries: Vec::new(),
            env_deopt_index: IndexVec::from_vec(vec![None; chunk.envs().len()]),
            jump_table: Vec::new(),
            deferred: Vec::new(),
            frame_is_built: false,
            osr_pc_offset: None,
            last_lazy_deopt_pc: 0,
            prologue_offset: 0,
            no_frame_ranges: Vec::new(),
            source_positions: Vec::new(),
        })
    }

    fn codegen(mut self: Box<Self>) -> Result<CodeObject, CompilationError> {
        assert_eq!(self.status, Status::Unused);
        self.status = Status::Generating;
        self.log.log(
            Verbosity::CodegenEvent,
            &format!(
                "generating code for {} instructions ({} blocks, {} spill slots)",
                self.chunk.insts().len(),
                self.chunk.num_blocks(),
                self.chunk.spill_slot_count()
            ),
        );
        if i32::try_from(self.chunk.spill_slot_count())
            .ok()
            .and_then(|x| x.checked_mul(heap::POINTER_SIZE))
            .is_none()
        {
            return Err(self.abort(BailoutReason::TooManySpillSlots));
        }

        self.seed_inlined_closures();
        self.generate_prologue()?;
        self.generate_body()?;
        self.generate_deferred_code()?;
        self.generate_jump_table()?;
        self.status = Status::Done;
        self.finish_code()
    }

    fn info(&self) -> &'a CompilationInfo {
        &self.chunk.info
    }

    fn generate_body(&mut self) -> Result<(), CompilationError> {
        let chunk = self.chunk;
        for (iidx, li) in chunk.insts().iter().enumerate() {
            self.current_instruction = iidx;
            if li.inst.is_call() {
                self.ensure_space_for_lazy_deopt(LAZY_DEOPT_PATCH_SIZE);
            }
            if !matches!(li.inst, Inst::LazyBailout) && !li.inst.is_gap() {
                self.safepoints.bump_last_lazy_safepoint_index();
            }
            if let Some(pos) = li.position {
                self.source_positions.push((self.asm.offset().0, pos));
            }
            // Labels print their own block header.
            if !matches!(&li.inst, Inst::Label { .. })
                && !matches!(&li.inst, Inst::Gap { moves } if moves.is_empty())
            {
                self.comment(format!("<@{iidx}> {}", li.inst.name()));
            }
            self.cg_inst(iidx, &li.inst)?;
        }
        self.ensure_space_for_lazy_deopt(LAZY_DEOPT_PATCH_SIZE);
        Ok(())
    }

    /// Lower one instruction.
    fn cg_inst(&mut self, iidx: usize, inst: &'a Inst) -> Result<(), CompilationError> {
        match inst {
            Inst::Label { block, kind } => {
                self.cg_label(*block, *kind);
                Ok(())
            }
            Inst::Gap { moves } => self.cg_gap(moves),
            Inst::Goto { block } => {
                self.emit_goto(*block);
                Ok(())
            }
            Inst::Branch {
                value,
                repr,
                targets,
            } => self.cg_branch(*value, *repr, *targets),
            Inst::Parameter => Ok(()),
            Inst::UnknownOsrValue | Inst::OsrEntry => {
                self.generate_osr_prologue();
                Ok(())
            }
            Inst::StackCheck { kind } => self.cg_stack_check(iidx, *kind),
            Inst::LazyBailout => self.cg_lazy_bailout(iidx),
            Inst::Deoptimize { kind, reason } => self.cg_deoptimize(iidx, *kind, reason),
            Inst::Return {
                value,
                parameter_count,
            } => self.cg_return(*value, *parameter_count),
            Inst::Dummy | Inst::DummyUse { .. } => Ok(()),
            Inst::ConstantI { result, value } => self.cg_constant_i(*result, *value),
            Inst::ConstantS { result, value } => self.cg_constant_s(*result, *value),
            Inst::ConstantD { result, value } => self.cg_constant_d(*result, *value),
            Inst::ConstantT { result, value } => self.cg_constant_t(*result, *value),
            Inst::AddI {
                result,
                left,
                right,
                flags,
            } => self.cg_add_i(iidx, *result, *left, *right, *flags),
            Inst::SubI {
                result,
                left,
                right,
                flags,
            } => self.cg_sub_i(iidx, *result, *left, *right, *flags),
            Inst::MulI {
                result,
                left,
                right,
                flags,
            } => self.cg_mul_i(iidx, *result, *left, *right, *flags),
            Inst::DivI {
                result,
                dividend,
                divisor,
                flags,
            } => self.cg_div_i(iidx, *result, *dividend, *divisor, *flags),
            Inst::DivByPowerOf2I {
                result,
                dividend,
                divisor,
                flags,
            } => self.cg_div_by_power_of_2_i(iidx, *result, *dividend, *divisor, *flags),
            Inst::DivByConstI {
                result,
                dividend,
                divisor,
                flags,
            } => self.cg_div_by_const_i(iidx, *result, *dividend, *divisor, *flags),
            Inst::FlooringDivI {
                result,
                dividend,
                divisor,
                flags,
            } => self.cg_flooring_div_i(iidx, *result, *dividend, *divisor, *flags),
            Inst::FlooringDivByPowerOf2I {
                result,
                dividend,
                divisor,
                flags,
            } => self.cg_flooring_div_by_power_of_2_i(iidx, *result, *dividend, *divisor, *flags),
            Inst::FlooringDivByConstI {
                result,
                dividend,
                divisor,
                temp,
                flags,
            } => self.cg_flooring_div_by_const_i(
                iidx, *result, *dividend, *divisor, *temp, *flags,
            ),
            Inst::ModI {
                result,
                dividend,
                divisor,
                flags,
            } => self.cg_mod_i(iidx, *result, *dividend, *divisor, *flags),
            Inst::ModByPowerOf2I {
                result,
                dividend,
                divisor,
                flags,
            } => self.cg_mod_by_power_of_2_i(iidx, *result, *dividend, *divisor, *flags),
            Inst::ModByConstI {
                result,
                dividend,
                divisor,
                flags,
            } => self.cg_mod_by_const_i(iidx, *result, *dividend, *divisor, *flags),
            Inst::BitI {
                op,
                result,
                left,
                right,
            } => self.cg_bit_i(*op, *result, *left, *right),
            Inst::ShiftI {
                op,
                result,
                left,
                right,
                can_deopt,
            } => self.cg_shift_i(iidx, *op, *result, *left, *right, *can_deopt),
            Inst::MathMinMax {
                op,
                repr,
                result,
                left,
                right,
            } => self.cg_math_min_max(*op, *repr, *result, *left, *right),
            Inst::MathAbs {
                repr,
                result,
                value,
            } => self.cg_math_abs(iidx, *repr, *result, *value),
            Inst::MathClz32 { result, value } => self.cg_math_clz32(*result, *value),
            Inst::MathSqrt { result, value } => self.cg_math_sqrt(*result, *value),
            Inst::ArithmeticD {
                op,
                result,
                left,
                right,
            } => self.cg_arithmetic_d(*op, *result, *left, *right),
            Inst::CompareNumericAndBranch {
                op,
                repr,
                left,
                right,
                is_unsigned,
                targets,
            } => self.cg_compare_numeric_and_branch(
                *op,
                *repr,
                *left,
                *right,
                *is_unsigned,
                *targets,
            ),
            Inst::CmpObjectEqAndBranch {
                left,
                right,
                targets,
            } => self.cg_cmp_object_eq_and_branch(*left, *right, *targets),
            Inst::CmpHoleAndBranch {
                repr,
                value,
                targets,
            } => self.cg_cmp_hole_and_branch(*repr, *value, *targets),
            Inst::CompareMinusZeroAndBranch {
                repr,
                value,
                targets,
            } => self.cg_compare_minus_zero_and_branch(*repr, *value, *targets),
            Inst::IsObjectAndBranch { value, targets } => {
                self.cg_is_object_and_branch(*value, *targets)
            }
            Inst::IsStringAndBranch {
                value,
                value_is_heap_object,
                targets,
            } => self.cg_is_string_and_branch(*value, *value_is_heap_object, *targets),
            Inst::IsSmiAndBranch { value, targets } => self.cg_is_smi_and_branch(*value, *targets),
            Inst::IsUndetectableAndBranch {
                value,
                value_is_heap_object,
                targets,
            } => self.cg_is_undetectable_and_branch(*value, *value_is_heap_object, *targets),
            Inst::HasInstanceTypeAndBranch {
                value,
                first,
                last,
                value_is_heap_object,
                targets,
            } => self.cg_has_instance_type_and_branch(
                *value,
                *first,
                *last,
                *value_is_heap_object,
                *targets,
            ),
            Inst::ClassOfTestAndBranch {
                value,
                temp,
                temp2,
                class_name,
                is_function_class,
                is_object_class,
                targets,
            } => self.cg_class_of_test_and_branch(
                *value,
                *temp,
                *temp2,
                *class_name,
                *is_function_class,
                *is_object_class,
                *targets,
            ),
            Inst::CmpMapAndBranch {
                value,
                map,
                targets,
            } => self.cg_cmp_map_and_branch(*value, *map, *targets),
            Inst::CmpT {
                op,
                result,
                left,
                right,
            } => self.cg_cmp_t(iidx, *op, *result, *left, *right),
            Inst::InstanceOf {
                result,
                left,
                right,
            } => self.cg_instance_of(iidx, *result, *left, *right),
            Inst::InstanceOfKnownGlobal {
                result,
                value,
                temp,
                function,
            } => self.cg_instance_of_known_global(iidx, *result, *value, *temp, *function),
            Inst::LoadRoot { result, index } => {
                let dst = self.to_register(*result);
                self.load_root(dst, *index);
                Ok(())
            }
            Inst::LoadNamedField {
                result,
                object,
                access,
            } => self.cg_load_named_field(*result, *object, *access),
            Inst::StoreNamedField {
                object,
                value,
                temp,
                map_temp,
                access,
                transition,
                barrier,
                map_barrier,
            } => self.cg_store_named_field(
                *object,
                *value,
                *temp,
                *map_temp,
                *access,
                *transition,
                *barrier,
                *map_barrier,
            ),
            Inst::LoadContextSlot {
                result,
                context,
                slot,
                hole_check,
            } => self.cg_load_context_slot(iidx, *result, *context, *slot, *hole_check),
            Inst::StoreContextSlot {
                context,
                value,
                temp,
                slot,
                hole_check,
                barrier,
            } => self.cg_store_context_slot(
                iidx,
                *context,
                *value,
                *temp,
                *slot,
                *hole_check,
                *barrier,
            ),
            Inst::LoadGlobalCell {
                result,
                cell,
                requires_hole_check,
            } => self.cg_load_global_cell(iidx, *result, *cell, *requires_hole_check),
            Inst::StoreGlobalCell {
                value,
                cell,
                temp,
                requires_hole_check,
            } => self.cg_store_global_cell(iidx, *value, *cell, *temp, *requires_hole_check),
            Inst::LoadKeyed {
                result,
                elements,
                key,
                kind,
                base_offset,
                requires_hole_check,
            } => self.cg_load_keyed(
                iidx,
                *result,
                *elements,
                *key,
                *kind,
                *base_offset,
                *requires_hole_check,
            ),
            Inst::StoreKeyed {
                elements,
                key,
                value,
                kind,
                base_offset,
                barrier,
                canonicalize_nan,
            } => self.cg_store_keyed(
                *elements,
                *key,
                *value,
                *kind,
                *base_offset,
                *barrier,
                *canonicalize_nan,
            ),
            Inst::BoundsCheck {
                index,
                length,
                allow_equality,
                skip_check,
            } => self.cg_bounds_check(iidx, *index, *length, *allow_equality, *skip_check),
            Inst::CallRuntime {
                function,
                save_doubles,
            } => {
                self.call_runtime(iidx, *function, *save_doubles);
                Ok(())
            }
            Inst::CallStub { stub } => {
                self.cg_call_stub(iidx, *stub);
                Ok(())
            }
            Inst::CallKnownFunction {
                function,
                formal_parameter_count,
                argc,
            } => self.cg_call_known_function(iidx, *function, *formal_parameter_count, *argc),
            Inst::CallFunction { argc } => {
                self.cg_call_function(iidx, *argc);
                Ok(())
            }
            Inst::PushArgument { value } => self.cg_push_argument(*value),
            Inst::Drop { count } => {
                self.cg_drop(*count);
                Ok(())
            }
            Inst::Allocate {
                result,
                size,
                temp,
                flags,
            } => self.cg_allocate(iidx, *result, *size, *temp, *flags),
            Inst::Integer32ToDouble { result, value } => {
                self.cg_integer32_to_double(*result, *value)
            }
            Inst::Uint32ToDouble { result, value } => self.cg_uint32_to_double(*result, *value),
            Inst::NumberTagI { result, value } => self.cg_number_tag_i(iidx, *result, *value),
            Inst::NumberTagU {
                result,
                value,
                temp,
                temp2,
            } => self.cg_number_tag_u(iidx, *result, *value, *temp, *temp2),
            Inst::NumberTagD {
                result,
                value,
                temp,
            } => self.cg_number_tag_d(iidx, *result, *value, *temp),
            Inst::SmiTag { result, value } => self.cg_smi_tag(*result, *value),
            Inst::SmiUntag {
                result,
                value,
                needs_check,
            } => self.cg_smi_untag(iidx, *result, *value, *needs_check),
            Inst::NumberUntagD {
                result,
                value,
                convert_undefined_to_nan,
                deopt_on_minus_zero,
            } => self.cg_number_untag_d(
                iidx,
                *result,
                *value,
                *convert_undefined_to_nan,
                *deopt_on_minus_zero,
            ),
            Inst::TaggedToI {
                result,
                value,
                temp,
                truncating,
                bailout_on_minus_zero,
            } => self.cg_tagged_to_i(
                iidx,
                *result,
                *value,
                *temp,
                *truncating,
                *bailout_on_minus_zero,
            ),
            Inst::DoubleToI {
                result,
                value,
                truncating,
                bailout_on_minus_zero,
            } => self.cg_double_to_i(iidx, *result, *value, *truncating, *bailout_on_minus_zero),
            Inst::CheckSmi { value } => self.cg_check_smi(iidx, *value),
            Inst::CheckNonSmi { value } => self.cg_check_non_smi(iidx, *value),
            Inst::CheckInstanceType { value, check } => {
                self.cg_check_instance_type(iidx, *value, *check)
            }
            Inst::CheckValue { value, object } => self.cg_check_value(iidx, *value, *object),
            Inst::CheckMaps {
                value,
                maps,
                has_migration_target,
            } => self.cg_check_maps(iidx, *value, maps, *has_migration_target),
        }
    }

    /// Push `n` bytes of NOP-equivalent instructions.
    fn push_nops(&mut self, mut n: usize) {
        while n > 0 {
            match n {
                1 => self.asm.push(0x90),
                2 => self.asm.extend([0x66, 0x90]),
                3 => self.asm.extend([0x0F, 0x1F, 0x00]),
                4 => self.asm.extend([0x0F, 0x1F, 0x40, 0x00]),
                5 => self.asm.extend([0x0F, 0x1F, 0x44, 0x00, 0x00]),
                6 => self.asm.extend([0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00]),
                7 => self.asm.extend([0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00]),
                8 => self
                    .asm
                    .extend([0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]),
                _ => {
                    self.asm
                        .extend([0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
                    n -= 9;
                    continue;
                }
            }
            break;
        }
    }

    /// Make sure the deoptimiser can patch a call over the previous lazy deoptimisation point
    /// without overwriting the next one.
    fn ensure_space_for_lazy_deopt(&mut self, space: usize) {
        if self.info().is_stub() {
            return;
        }
        let pc = self.asm.offset().0;
        if pc < self.last_lazy_deopt_pc + space {
            self.push_nops(self.last_lazy_deopt_pc + space - pc);
        }
        self.last_lazy_deopt_pc = self.asm.offset().0;
    }

    /// Add a comment at the current offset.
    fn comment(&mut self, line: String) {
        self.comments
            .entry(self.asm.offset().0)
            .or_default()
            .push(line);
    }

    /// Give up on this chunk.
    fn abort(&mut self, reason: BailoutReason) -> CompilationError {
        self.log.log(
            Verbosity::CodegenEvent,
            &format!("aborting code generation: {reason}"),
        );
        self.status = Status::Aborted;
        CompilationError::Aborted(reason)
    }

    fn is_stub(&self) -> bool {
        self.info().is_stub()
    }

    /// Does the function build its frame in the prologue?
    fn needs_eager_frame(&self) -> bool {
        let info = self.info();
        self.chunk.spill_slot_count() > 0
            || info.non_deferred_calling
            || !info.is_stub()
            || info.requires_frame
    }

    /// Does deferred code build a temporary frame?
    fn needs_deferred_frame(&self) -> bool {
        !self.needs_eager_frame() && self.info().deferred_calling
    }

    fn block_label(&self, block: BlockIdx) -> DynamicLabel {
        self.block_labels[block]
    }

    /// The block emitted after the current one, if any.
    fn next_emitted_block(&self) -> Option<BlockIdx> {
        let next = self.current_block?.index() + 1;
        (next < self.chunk.num_blocks()).then(|| BlockIdx::from_usize(next))
    }

    fn cg_label(&mut self, block: BlockIdx, kind: crate::lir::LabelKind) {
        let suffix = match kind {
            crate::lir::LabelKind::Plain => "",
            crate::lir::LabelKind::LoopHeader => " (loop header)",
            crate::lir::LabelKind::OsrEntry => " (OSR entry)",
        };
        self.comment(format!(
            "-------------------- B{}{suffix} --------------------",
            block.index()
        ));
        let l = self.block_label(block);
        dynasm!(self.asm; =>l);
        self.current_block = Some(block);
    }

    /// Jump to `l` if `cond` holds.
    fn jcc(&mut self, cond: Cond, l: DynamicLabel) {
        match cond {
            Cond::Equal => dynasm!(self.asm; je =>l),
            Cond::NotEqual => dynasm!(self.asm; jne =>l),
            Cond::Less => dynasm!(self.asm; jl =>l),
            Cond::GreaterEqual => dynasm!(self.asm; jge =>l),
            Cond::LessEqual => dynasm!(self.asm; jle =>l),
            Cond::Greater => dynasm!(self.asm; jg =>l),
            Cond::Below => dynasm!(self.asm; jb =>l),
            Cond::AboveEqual => dynasm!(self.asm; jae =>l),
            Cond::BelowEqual => dynasm!(self.asm; jbe =>l),
            Cond::Above => dynasm!(self.asm; ja =>l),
            Cond::Overflow => dynasm!(self.asm; jo =>l),
            Cond::NoOverflow => dynasm!(self.asm; jno =>l),
            Cond::Sign => dynasm!(self.asm; js =>l),
            Cond::NotSign => dynasm!(self.asm; jns =>l),
            Cond::ParityEven => dynasm!(self.asm; jp =>l),
            Cond::ParityOdd => dynasm!(self.asm; jnp =>l),
        }
    }

    fn jmp(&mut self, l: DynamicLabel) {
        dynasm!(self.asm; jmp =>l);
    }

    fn bind(&mut self, l: DynamicLabel) {
        dynasm!(self.asm; =>l);
    }

    /// Continue at `block`, jumping only if it isn't emitted next.
    fn emit_goto(&mut self, block: BlockIdx) {
        if self.next_emitted_block() != Some(block) {
            let l = self.block_label(block);
            self.jmp(l);
        }
    }

    /// Branch to the true target if `cond` holds and to the false target otherwise, falling
    /// through where possible.
    fn emit_branch(&mut self, targets: Targets, cond: Cond) {
        let next = self.next_emitted_block();
        if targets.true_block == targets.false_block {
            self.emit_goto(targets.true_block);
        } else if next == Some(targets.true_block) {
            let l = self.block_label(targets.false_block);
            self.jcc(cond.negate(), l);
        } else {
            let l = self.block_label(targets.true_block);
            self.jcc(cond, l);
            if next != Some(targets.false_block) {
                let l = self.block_label(targets.false_block);
                self.jmp(l);
            }
        }
    }

    /// Jump to the false target if `cond` holds.
    fn emit_false_branch(&mut self, targets: Targets, cond: Cond) {
        let l = self.block_label(targets.false_block);
        self.jcc(cond, l);
    }

    /// Jump to the true target if `cond` holds.
    fn emit_true_branch(&mut self, targets: Targets, cond: Cond) {
        let l = self.block_label(targets.true_block);
        self.jcc(cond, l);
    }

    fn load_root(&mut self, dst: Rq, idx: RootIndex) {
        dynasm!(self.asm; mov Rq(dst.code()), [Rq(ROOTS.code()) + idx.offset()]);
    }

    fn compare_root(&mut self, reg: Rq, idx: RootIndex) {
        dynasm!(self.asm; cmp Rq(reg.code()), [Rq(ROOTS.code()) + idx.offset()]);
    }

    /// Load a 64-bit immediate into `dst` using the shortest encoding.
    fn mov_imm64(&mut self, dst: Rq, v: i64) {
        if v == 0 {
            dynasm!(self.asm; xor Rd(dst.code()), Rd(dst.code()));
        } else if let Ok(x) = u32::try_from(v) {
            dynasm!(self.asm; mov Rd(dst.code()), x as i32);
        } else if let Ok(x) = i32::try_from(v) {
            dynasm!(self.asm; mov Rq(dst.code()), x);
        } else {
            dynasm!(self.asm; mov Rq(dst.code()), QWORD v);
        }
    }

    fn move_smi(&mut self, dst: Rq, v: i32) {
        self.mov_imm64(dst, smi_word(v));
    }

    fn move_handle(&mut self, dst: Rq, h: Handle) {
        dynasm!(self.asm; mov Rq(dst.code()), QWORD h.addr());
    }

    /// Compare `reg` with the embedded object `h`.
    fn cmp_handle(&mut self, reg: Rq, h: Handle) {
        self.move_handle(SCRATCH, h);
        dynasm!(self.asm; cmp Rq(reg.code()), Rq(SCRATCH.code()));
    }

    /// Set the zero flag if `reg` holds a smi.
    fn test_smi(&mut self, reg: Rq) {
        dynasm!(self.asm; test Rd(reg.code()), heap::SMI_TAG_MASK);
    }

    fn finish_code(mut self: Box<Self>) -> Result<CodeObject, CompilationError> {
        debug_assert_eq!(self.status, Status::Done);
        let pad = (8 - self.asm.offset().0 % 8) % 8;
        self.push_nops(pad);
        let instruction_size = self.asm.offset().0;
        let stack_slots = self.chunk.spill_slot_count();
        let weak_objects = self.weak_objects();
        let deopt_data = self.deoptimization_data()?;
        let Self {
            asm,
            safepoints,
            comments,
            prologue_offset,
            no_frame_ranges,
            source_positions,
            chunk,
            log,
            ..
        } = *self;

        let mut code = asm
            .finalize()
            .map_err(|e| CompilationError::InternalError(format!("When finalizing: {e}")))?;
        debug_assert_eq!(code.len(), instruction_size);
        let safepoint_table_offset = if chunk.info.is_stub() && safepoints.is_empty() {
            None
        } else {
            let off = code.len();
            safepoints.emit(&mut code, stack_slots);
            Some(off)
        };
        log.log(
            Verbosity::CodegenEvent,
            &format!(
                "finished code: {instruction_size} bytes, {} safepoints, {} deoptimization points",
                safepoints.len(),
                deopt_data.entries.len()
            ),
        );
        Ok(CodeObject {
            code,
            instruction_size,
            stack_slots,
            safepoint_table_offset,
            deopt_data,
            weak_objects,
            prologue_offset,
            no_frame_ranges,
            comments,
            source_positions,
        })
    }

    /// The objects optimized code embeds but must not keep alive.
    fn weak_objects(&self) -> Vec<Handle> {
        let mut objs = Vec::new();
        if !self.info().is_optimizing() {
            return objs;
        }
        let mut add = |h: Handle| {
            if !objs.contains(&h) {
                objs.push(h);
            }
        };
        for li in self.chunk.insts() {
            match &li.inst {
                Inst::CheckMaps { maps, .. } => maps.iter().for_each(|x| add(*x)),
                Inst::CmpMapAndBranch { map, .. } => add(*map),
                Inst::StoreNamedField {
                    transition: Some(map),
                    ..
                } => add(*map),
                Inst::InstanceOfKnownGlobal { function, .. } => add(*function),
                _ => (),
            }
        }
        objs
    }
}

/// Disassembles emitted code for testing and debugging purposes.
pub(crate) struct AsmPrinter<'a> {
    code: &'a [u8],
    comments: &'a IndexMap<usize, Vec<String>>,
    /// When true, instruction offset and address are included in the output.
    with_addrs: bool,
}

impl<'a> AsmPrinter<'a> {
    pub(crate) fn new(
        code: &'a [u8],
        comments: &'a IndexMap<usize, Vec<String>>,
        with_addrs: bool,
    ) -> Self {
        Self {
            code,
            comments,
            with_addrs,
        }
    }

    /// Returns the disassembled code.
    pub(crate) fn to_string(&self) -> Result<String, Box<dyn Error>> {
        let mut out = Vec::new();
        let mut dec = Decoder::with_ip(64, self.code, 0, DecoderOptions::NONE);
        let mut fmt = NasmFormatter::new();
        let opts = fmt.options_mut();
        opts.set_branch_leading_zeros(false);
        opts.set_hex_prefix("0x");
        opts.set_hex_suffix("");
        opts.set_rip_relative_addresses(true);
        opts.set_show_branch_size(false);
        opts.set_space_after_operand_separator(true);
        let mut insn = Instruction::default();
        let mut istr = String::new();
        while dec.can_decode() {
            dec.decode_out(&mut insn);
            let ip = insn.ip();
            if insn.is_invalid() {
                return Err(format!("Invalid instruction at offset {ip:#x}").into());
            }
            let off = usize::try_from(ip)?;
            if let Some(lines) = self.comments.get(&off) {
                for line in lines {
                    out.push(format!("; {line}"));
                }
            }
            istr.clear();
            fmt.format(&insn, &mut istr);
            if self.with_addrs {
                out.push(format!("{ip:016x} {off:08x}: {istr}"));
            } else {
                out.push(istr.clone());
            }
        }
        // Labels bound at the very end of the code have no instruction to hang off.
        if let Some(lines) = self.comments.get(&self.code.len()) {
            for line in lines {
                out.push(format!("; {line}"));
            }
        }
        Ok(out.join("\n"))
    }
}
