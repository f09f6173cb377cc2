//! Helpers shared by the x64 backend's tests.
//!
//! Generated code is matched with `fm` patterns against its disassembly. Use `{{name}}` to match
//! (and bind) non-literal text such as branch targets.

use super::{AsmPrinter, Assemble, Status};
use crate::{
    compile::{CodeObject, CompilationError},
    config::CodegenConfig,
    heap::Handle,
    lir::{
        Chunk, CompilationInfo, EnvIdx, Environment, FrameType, Inst, LInstruction, LabelKind,
        Operand, ValueTag,
    },
    log::Log,
    runtime::test_runtime::TestRuntime,
};
use dynasmrt::{x64::Rq, DynasmApi, Register as dynasmrtRegister};
use fm::{FMBuilder, FMatcher};
use iced_x86::{
    ConditionCode, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register,
};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Use `{{name}}` to match non-literal strings in tests.
    static ref PTN_RE: Regex = {
        Regex::new(r"\{\{.+?\}\}").unwrap()
    };

    static ref TEXT_RE: Regex = {
        Regex::new(r"[a-zA-Z0-9\._]+").unwrap()
    };
}

/// The closure the test chunks compile.
pub(crate) const TEST_CLOSURE: Handle = Handle(0x1001);

fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

/// Match disassembly `dis` against `ptn`.
pub(crate) fn match_text(dis: &str, ptn: &str) {
    // The disassembler prints hex in mixed case, so lowercase both pattern and text.
    let ptn = ptn.to_lowercase();
    match fmatcher(&ptn).matches(&dis.to_lowercase()) {
        Ok(()) => (),
        Err(e) => panic!("{e}\n\n{dis}"),
    }
}

pub(crate) fn match_asm(co: &CodeObject, ptn: &str) {
    match_text(&co.disassemble(false).unwrap(), ptn);
}

/// An optimised function chunk with `num_parameters` parameters.
pub(crate) fn function_chunk(num_parameters: usize) -> Chunk {
    Chunk::new(CompilationInfo::function(TEST_CLOSURE, num_parameters))
}

/// Add an outermost environment for the compiled closure with the receiver and parameters in
/// their incoming slots.
pub(crate) fn add_env(chunk: &mut Chunk, ast_id: i32) -> EnvIdx {
    let n = chunk.info.num_parameters;
    let mut env = Environment::new(TEST_CLOSURE, FrameType::JsFunction, ast_id, n + 1, None);
    for i in 0..=n {
        let slot = -i32::try_from(n + 1 - i).unwrap();
        env.push_value(Operand::StackSlot(slot), ValueTag::Tagged);
    }
    chunk.envs_mut().push(env)
}

/// A function chunk whose single block holds the instructions `f` returns, each with a
/// deoptimisation environment. The first instruction is `<@1>`.
pub(crate) fn single_block<F>(f: F) -> Chunk
where
    F: FnOnce(&mut Chunk) -> Vec<Inst>,
{
    let mut c = function_chunk(0);
    let env = add_env(&mut c, 1);
    let b = c.new_block();
    c.push(Inst::Label {
        block: b,
        kind: LabelKind::Plain,
    });
    for inst in f(&mut c) {
        c.push(LInstruction::new(inst).with_env(env));
    }
    c
}

pub(crate) fn try_codegen_with(
    chunk: &Chunk,
    config: &CodegenConfig,
    rt: &TestRuntime,
) -> Result<CodeObject, CompilationError> {
    let log = Log::new().unwrap();
    Assemble::new(chunk, rt, config, &log).codegen()
}

pub(crate) fn codegen_with(chunk: &Chunk, config: &CodegenConfig) -> CodeObject {
    try_codegen_with(chunk, config, &TestRuntime::new()).unwrap()
}

pub(crate) fn codegen(chunk: &Chunk) -> CodeObject {
    codegen_with(chunk, &CodegenConfig::default())
}

pub(crate) fn codegen_and_test(chunk: &Chunk, ptn: &str) {
    match_asm(&codegen(chunk), ptn);
}

/// The disassembly of code emitted directly through an [Assemble].
pub(crate) struct Emitted(String);

impl Emitted {
    pub(crate) fn matches(&self, ptn: &str) {
        match_text(&self.0, ptn);
    }
}

/// Run `f` against a fresh [Assemble] for `chunk` and disassemble whatever it emitted.
pub(crate) fn with_assemble<F>(chunk: &Chunk, f: F) -> Emitted
where
    F: FnOnce(&mut Assemble<'_>),
{
    let rt = TestRuntime::new();
    let config = CodegenConfig::default();
    let log = Log::new().unwrap();
    let mut a = Assemble::new(chunk, &rt, &config, &log);
    a.status = Status::Generating;
    f(&mut a);
    let Assemble { asm, comments, .. } = *a;
    let code = asm.finalize().unwrap();
    Emitted(AsmPrinter::new(&code, &comments, false).to_string().unwrap())
}

fn comment_offset(co: &CodeObject, f: impl Fn(&str) -> bool) -> Option<usize> {
    co.comments
        .iter()
        .find(|(_, lines)| lines.iter().any(|l| f(l.as_str())))
        .map(|(off, _)| *off)
}

/// The offset of block `block`'s code in `co`.
pub(crate) fn block_offset(co: &CodeObject, block: usize) -> u64 {
    let header = format!("-------------------- B{block} ");
    let off = comment_offset(co, |l| l.starts_with(&header))
        .unwrap_or_else(|| panic!("No block B{block}"));
    u64::try_from(off).unwrap()
}

/// The targets of the jumps emitted for instruction `iidx` of `co`.
pub(crate) fn branch_targets(co: &CodeObject, iidx: usize) -> Vec<u64> {
    let prefix = format!("<@{iidx}> ");
    let start = comment_offset(co, |l| l.starts_with(&prefix))
        .unwrap_or_else(|| panic!("No instruction <@{iidx}>"));
    let end = co
        .comments
        .keys()
        .copied()
        .filter(|off| *off > start)
        .min()
        .unwrap_or(co.instruction_size);
    let mut dec = Decoder::with_ip(
        64,
        &co.instructions()[start..end],
        u64::try_from(start).unwrap(),
        DecoderOptions::NONE,
    );
    let targets = dec
        .iter()
        .filter(|i| i.is_jmp_short_or_near() || i.is_jcc_short_or_near())
        .map(|i| i.near_branch_target())
        .collect();
    targets
}

/// How a run of emitted code ended.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Exit {
    /// Returned, leaving these general purpose registers (indexed by register code).
    Returned([u64; 16]),
    /// Called out. Code run through [run_body] only calls to deoptimise.
    Called,
}

impl Exit {
    /// The low half of `r` as an `i32`, or `None` if the code called out.
    pub(crate) fn int32(&self, r: Rq) -> Option<i32> {
        match self {
            Exit::Returned(regs) => Some(regs[usize::from(r.code())] as u32 as i32),
            Exit::Called => None,
        }
    }
}

enum Flow {
    Next,
    Jump(u64),
    Return,
    Call,
}

fn width_mask(width: u32) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1 << width) - 1
    }
}

fn sign_extend(v: u64, width: u32) -> i64 {
    ((v << (64 - width)) as i64) >> (64 - width)
}

fn reg_width(r: Register) -> u32 {
    u32::try_from(r.size() * 8).unwrap()
}

/// Just enough of an x64 to run the integer code the backend emits for arithmetic: the general
/// purpose registers and the status flags. Anything touching memory panics.
#[derive(Default)]
struct Machine {
    regs: [u64; 16],
    zf: bool,
    sf: bool,
    cf: bool,
    of: bool,
}

impl Machine {
    fn reg(&self, r: Register) -> u64 {
        assert!(r.is_gpr(), "Unsupported register {r:?}");
        self.regs[r.full_register().number()] & width_mask(reg_width(r))
    }

    fn set_reg(&mut self, r: Register, v: u64) {
        let full = &mut self.regs[r.full_register().number()];
        match reg_width(r) {
            64 => *full = v,
            // 32 bit writes clear the upper half.
            32 => *full = v & 0xFFFF_FFFF,
            _ => panic!("Unsupported destination {r:?}"),
        }
    }

    /// The register that operand `i` of `ins` names, panicking for anything else.
    fn reg_operand(ins: &Instruction, i: u32) -> Register {
        match ins.op_kind(i) {
            OpKind::Register => ins.op_register(i),
            _ => panic!("Unsupported operand {i} in {ins}"),
        }
    }

    fn operand(&self, ins: &Instruction, i: u32) -> u64 {
        match ins.op_kind(i) {
            OpKind::Register => self.reg(ins.op_register(i)),
            OpKind::Memory => panic!("Memory access in {ins}"),
            _ => ins.immediate(i),
        }
    }

    fn set_result_flags(&mut self, res: u64, width: u32) {
        self.zf = res & width_mask(width) == 0;
        self.sf = (res >> (width - 1)) & 1 == 1;
    }

    fn alu(&mut self, m: Mnemonic, a: u64, b: u64, width: u32) -> u64 {
        let mask = width_mask(width);
        let (a, b) = (a & mask, b & mask);
        let neg = |x: u64| (x >> (width - 1)) & 1 == 1;
        let res = match m {
            Mnemonic::Add | Mnemonic::Inc => {
                let r = a.wrapping_add(b) & mask;
                self.cf = r < a;
                self.of = neg(a) == neg(b) && neg(r) != neg(a);
                r
            }
            Mnemonic::Sub | Mnemonic::Cmp | Mnemonic::Dec => {
                let r = a.wrapping_sub(b) & mask;
                self.cf = a < b;
                self.of = neg(a) != neg(b) && neg(r) != neg(a);
                r
            }
            Mnemonic::And | Mnemonic::Test | Mnemonic::Or | Mnemonic::Xor => {
                self.cf = false;
                self.of = false;
                match m {
                    Mnemonic::Or => a | b,
                    Mnemonic::Xor => a ^ b,
                    _ => a & b,
                }
            }
            _ => unreachable!(),
        };
        self.set_result_flags(res, width);
        res
    }

    fn holds(&self, cc: ConditionCode) -> bool {
        match cc {
            ConditionCode::o => self.of,
            ConditionCode::no => !self.of,
            ConditionCode::b => self.cf,
            ConditionCode::ae => !self.cf,
            ConditionCode::e => self.zf,
            ConditionCode::ne => !self.zf,
            ConditionCode::be => self.cf || self.zf,
            ConditionCode::a => !self.cf && !self.zf,
            ConditionCode::s => self.sf,
            ConditionCode::ns => !self.sf,
            ConditionCode::l => self.sf != self.of,
            ConditionCode::ge => self.sf == self.of,
            ConditionCode::le => self.zf || self.sf != self.of,
            ConditionCode::g => !self.zf && self.sf == self.of,
            _ => panic!("Unsupported condition {cc:?}"),
        }
    }

    fn step(&mut self, ins: &Instruction) -> Flow {
        let m = ins.mnemonic();
        match m {
            Mnemonic::Ret => return Flow::Return,
            Mnemonic::Call => return Flow::Call,
            Mnemonic::Nop => (),
            Mnemonic::Jmp => return Flow::Jump(ins.near_branch_target()),
            _ if ins.is_jcc_short_or_near() => {
                if self.holds(ins.condition_code()) {
                    return Flow::Jump(ins.near_branch_target());
                }
            }
            Mnemonic::Mov => {
                let v = self.operand(ins, 1);
                self.set_reg(Self::reg_operand(ins, 0), v);
            }
            Mnemonic::Lea => {
                let mut addr = ins.memory_displacement64();
                if ins.memory_base() != Register::None {
                    addr = addr.wrapping_add(self.reg(ins.memory_base()));
                }
                if ins.memory_index() != Register::None {
                    let scale = u64::from(ins.memory_index_scale());
                    addr = addr.wrapping_add(self.reg(ins.memory_index()).wrapping_mul(scale));
                }
                self.set_reg(Self::reg_operand(ins, 0), addr);
            }
            Mnemonic::Add | Mnemonic::Sub | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor => {
                let r = Self::reg_operand(ins, 0);
                let b = self.operand(ins, 1);
                let v = self.alu(m, self.reg(r), b, reg_width(r));
                self.set_reg(r, v);
            }
            Mnemonic::Cmp | Mnemonic::Test => {
                let r = Self::reg_operand(ins, 0);
                let b = self.operand(ins, 1);
                self.alu(m, self.reg(r), b, reg_width(r));
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let r = Self::reg_operand(ins, 0);
                let cf = self.cf;
                let v = self.alu(m, self.reg(r), 1, reg_width(r));
                self.cf = cf;
                self.set_reg(r, v);
            }
            Mnemonic::Neg => {
                let r = Self::reg_operand(ins, 0);
                let width = reg_width(r);
                let a = self.reg(r);
                let v = self.alu(Mnemonic::Sub, 0, a, width);
                self.cf = a != 0;
                self.set_reg(r, v);
            }
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let r = Self::reg_operand(ins, 0);
                let width = reg_width(r);
                let count = self.operand(ins, 1) & u64::from(width - 1);
                if count != 0 {
                    let a = self.reg(r);
                    let v = match m {
                        Mnemonic::Shl => a << count,
                        Mnemonic::Shr => a >> count,
                        _ => (sign_extend(a, width) >> count) as u64,
                    } & width_mask(width);
                    self.set_result_flags(v, width);
                    self.set_reg(r, v);
                }
            }
            Mnemonic::Cdq => {
                let eax = self.regs[0] as u32 as i32;
                self.regs[2] = u64::from((eax >> 31) as u32);
            }
            Mnemonic::Imul if ins.op_count() == 1 => {
                let r = Self::reg_operand(ins, 0);
                assert_eq!(reg_width(r), 32, "Unsupported {ins}");
                let p = i64::from(self.regs[0] as u32 as i32) * sign_extend(self.reg(r), 32);
                self.regs[0] = u64::from(p as u32);
                self.regs[2] = u64::from((p >> 32) as u32);
                self.of = p != i64::from(p as i32);
                self.cf = self.of;
            }
            Mnemonic::Imul => {
                let r = Self::reg_operand(ins, 0);
                let width = reg_width(r);
                let (a, b) = match ins.op_count() {
                    2 => (self.reg(r), self.operand(ins, 1)),
                    _ => (self.operand(ins, 1), self.operand(ins, 2)),
                };
                let p = i128::from(sign_extend(a & width_mask(width), width))
                    * i128::from(sign_extend(b & width_mask(width), width));
                let v = (p as u64) & width_mask(width);
                self.of = p != i128::from(sign_extend(v, width));
                self.cf = self.of;
                self.set_reg(r, v);
            }
            Mnemonic::Idiv => {
                let r = Self::reg_operand(ins, 0);
                assert_eq!(reg_width(r), 32, "Unsupported {ins}");
                let dividend = ((self.regs[2] << 32) | (self.regs[0] & 0xFFFF_FFFF)) as i64;
                let divisor = sign_extend(self.reg(r), 32);
                let q = dividend
                    .checked_div(divisor)
                    .and_then(|q| i32::try_from(q).ok())
                    .unwrap_or_else(|| panic!("Divide error: {dividend} / {divisor}"));
                let rem = (dividend % divisor) as i32;
                self.regs[0] = u64::from(q as u32);
                self.regs[2] = u64::from(rem as u32);
            }
            _ => panic!("Unsupported instruction {ins}"),
        }
        Flow::Next
    }

    fn run(mut self, code: &[u8]) -> Exit {
        let mut dec = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        let mut ins = Instruction::default();
        loop {
            assert!(dec.can_decode(), "Ran off the end of the code");
            dec.decode_out(&mut ins);
            assert!(!ins.is_invalid(), "Invalid instruction at {:#x}", ins.ip());
            match self.step(&ins) {
                Flow::Next => (),
                Flow::Jump(target) => {
                    dec.set_position(usize::try_from(target).unwrap()).unwrap();
                    dec.set_ip(target);
                }
                Flow::Return => return Exit::Returned(self.regs),
                Flow::Call => return Exit::Called,
            }
        }
    }
}

/// Generate `chunk`'s instructions, without a prologue, and run them with each register in
/// `inputs` holding its value. The code returns when it falls off the end of the last block.
pub(crate) fn run_body(chunk: &Chunk, inputs: &[(Rq, i32)]) -> Exit {
    let rt = TestRuntime::new();
    let config = CodegenConfig::default();
    let log = Log::new().unwrap();
    let mut a = Assemble::new(chunk, &rt, &config, &log);
    a.status = Status::Generating;
    // Deoptimisation exits then call their entries directly.
    a.frame_is_built = true;
    for (iidx, li) in chunk.insts().iter().enumerate() {
        a.current_instruction = iidx;
        a.cg_inst(iidx, &li.inst).unwrap();
    }
    a.asm.push(0xC3);
    a.generate_jump_table().unwrap();
    let Assemble { asm, .. } = *a;
    let code = asm.finalize().unwrap();
    let mut m = Machine::default();
    for (r, v) in inputs {
        m.regs[usize::from(r.code())] = u64::from(*v as u32);
    }
    m.run(&code)
}
