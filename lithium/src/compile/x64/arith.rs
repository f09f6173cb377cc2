//! Integer and double arithmetic.

use super::{
    operand::{Location, Reg},
    Assemble, Cond, DOUBLE_SCRATCH, SCRATCH,
};
use crate::{
    compile::CompilationError,
    lir::{ArithFlags, ArithOp, BitOp, MinMaxOp, Operand, Representation, ShiftOp},
    runtime::ExternalRef,
};
use dynasmrt::{
    dynasm,
    x64::{Rq, Rx},
    DynamicLabel, DynasmApi, Register as dynasmrtRegister,
};

/// Emit the 32-bit `$op l, right` for whichever form `right` resolved to.
macro_rules! op32 {
    ($a:ident, $op:ident, $l:expr, $right:expr) => {{
        let l = $l.code();
        match $a.resolve($right) {
            Location::Register(Reg::GP(r)) => dynasm!($a.asm; $op Rd(l), Rd(r.code())),
            Location::Memory { base, disp } => {
                dynasm!($a.asm; $op Rd(l), [Rq(base.code()) + disp])
            }
            Location::Immediate(_) => {
                let v = $a.to_integer32($right);
                dynasm!($a.asm; $op Rd(l), v)
            }
            Location::Register(Reg::FP(_)) => panic!("{} is not an integer operand", $right),
        }
    }};
}

/// The same, with 64-bit registers and memory. Constants are loaded as smis through [SCRATCH].
macro_rules! op64 {
    ($a:ident, $op:ident, $l:expr, $right:expr) => {{
        let l = $l.code();
        match $a.resolve($right) {
            Location::Register(Reg::GP(r)) => dynasm!($a.asm; $op Rq(l), Rq(r.code())),
            Location::Memory { base, disp } => {
                dynasm!($a.asm; $op Rq(l), [Rq(base.code()) + disp])
            }
            Location::Immediate(_) => {
                let v = $a.to_integer32($right);
                $a.move_smi(SCRATCH, v);
                dynasm!($a.asm; $op Rq(l), Rq(SCRATCH.code()))
            }
            Location::Register(Reg::FP(_)) => panic!("{} is not an integer operand", $right),
        }
    }};
}

/// The magic multiplier and shift that turn signed division by `d` into a multiplication.
///
/// Computes the smallest multiplier `m` and shift `s` such that for every int32 `n`, the upper
/// word of `n * m` (plus `n` if `m` doesn't fit in an int32), arithmetically shifted right by
/// `s` and corrected by one for negative `n`, is `n / d` rounded toward zero. See Hacker's
/// Delight, section 10-4.
///
/// # Panics
///
/// If `d` isn't in `2..2^31`.
pub(super) fn signed_division_magic(d: u32) -> (u32, u32) {
    assert!((2..=i32::MAX as u32).contains(&d), "No magic number for {d}");
    const MIN: u32 = 1 << 31;
    let anc = MIN - 1 - MIN % d;
    let mut p = 31;
    let (mut q1, mut r1) = (MIN / anc, MIN % anc);
    let (mut q2, mut r2) = (MIN / d, MIN % d);
    loop {
        p += 1;
        q1 = q1.wrapping_mul(2);
        r1 = r1.wrapping_mul(2);
        if r1 >= anc {
            q1 = q1.wrapping_add(1);
            r1 = r1.wrapping_sub(anc);
        }
        q2 = q2.wrapping_mul(2);
        r2 = r2.wrapping_mul(2);
        if r2 >= d {
            q2 = q2.wrapping_add(1);
            r2 = r2.wrapping_sub(d);
        }
        let delta = d - r2;
        if !(q1 < delta || (q1 == delta && r1 == 0)) {
            break;
        }
    }
    (q2.wrapping_add(1), p - 32)
}

impl Assemble<'_> {
    /// `cmp l, right` on 32-bit values.
    pub(super) fn cmp32(&mut self, l: Rq, right: Operand) {
        op32!(self, cmp, l, right);
    }

    /// Leave `dividend / divisor`, rounded toward zero, in `rdx`. Clobbers `rax`.
    fn truncating_div(&mut self, dividend: Rq, divisor: u32) {
        assert!(dividend != Rq::RAX && dividend != Rq::RDX);
        let (mul, shift) = signed_division_magic(divisor);
        let d = dividend.code();
        dynasm!(self.asm
            ; mov eax, mul as i32
            ; imul Rd(d)
        );
        if mul & (1 << 31) != 0 {
            dynasm!(self.asm; add edx, Rd(d));
        }
        if shift > 0 {
            let shift = shift as i8;
            dynasm!(self.asm; sar edx, shift);
        }
        dynasm!(self.asm
            ; mov eax, Rd(d)
            ; shr eax, 31
            ; add edx, eax
        );
    }

    pub(super) fn cg_add_i(
        &mut self,
        iidx: usize,
        result: Operand,
        left: Operand,
        right: Operand,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        let l = self.to_register(left);
        let dst = self.to_register(result);
        if !flags.can_overflow && dst != l {
            // `lea` computes the sum without touching either input.
            let (d, l) = (dst.code(), l.code());
            match self.int32_constant(right) {
                Some(v) => dynasm!(self.asm; lea Rd(d), [Rq(l) + v]),
                None => {
                    let r = self.to_register(right).code();
                    dynasm!(self.asm; lea Rd(d), [Rq(l) + Rq(r)]);
                }
            }
            return Ok(());
        }
        assert_eq!(dst, l);
        op32!(self, add, l, right);
        if flags.can_overflow {
            self.deoptimize_if(Some(Cond::Overflow), iidx, "overflow")?;
        }
        Ok(())
    }

    pub(super) fn cg_sub_i(
        &mut self,
        iidx: usize,
        result: Operand,
        left: Operand,
        right: Operand,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        let l = self.to_register(left);
        assert_eq!(self.to_register(result), l);
        op32!(self, sub, l, right);
        if flags.can_overflow {
            self.deoptimize_if(Some(Cond::Overflow), iidx, "overflow")?;
        }
        Ok(())
    }

    pub(super) fn cg_mul_i(
        &mut self,
        iidx: usize,
        result: Operand,
        left: Operand,
        right: Operand,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        let l = self.to_register(left);
        assert_eq!(self.to_register(result), l);
        let lc = l.code();
        if flags.bailout_on_minus_zero {
            // Keep the left operand for the sign check below.
            dynasm!(self.asm; mov Rd(SCRATCH.code()), Rd(lc));
        }
        let constant = self.int32_constant(right);
        match constant {
            Some(-1) => dynasm!(self.asm; neg Rd(lc)),
            Some(0) => dynasm!(self.asm; xor Rd(lc), Rd(lc)),
            Some(2) => dynasm!(self.asm; add Rd(lc), Rd(lc)),
            // Without overflow checks the flags don't matter, so cheaper forms will do.
            Some(1) if !flags.can_overflow => (),
            Some(3) if !flags.can_overflow => {
                dynasm!(self.asm; lea Rd(lc), [Rq(lc) + Rq(lc) * 2])
            }
            Some(5) if !flags.can_overflow => {
                dynasm!(self.asm; lea Rd(lc), [Rq(lc) + Rq(lc) * 4])
            }
            Some(9) if !flags.can_overflow => {
                dynasm!(self.asm; lea Rd(lc), [Rq(lc) + Rq(lc) * 8])
            }
            Some(4) if !flags.can_overflow => dynasm!(self.asm; shl Rd(lc), 2),
            Some(8) if !flags.can_overflow => dynasm!(self.asm; shl Rd(lc), 3),
            Some(16) if !flags.can_overflow => dynasm!(self.asm; shl Rd(lc), 4),
            Some(v) => dynasm!(self.asm; imul Rd(lc), Rd(lc), v),
            None => match self.resolve(right) {
                Location::Register(Reg::GP(r)) => dynasm!(self.asm; imul Rd(lc), Rd(r.code())),
                Location::Memory { base, disp } => {
                    dynasm!(self.asm; imul Rd(lc), [Rq(base.code()) + disp])
                }
                _ => panic!("{right} is not an integer operand"),
            },
        }
        if flags.can_overflow {
            self.deoptimize_if(Some(Cond::Overflow), iidx, "overflow")?;
        }
        if flags.bailout_on_minus_zero {
            // A zero product is -0 if either operand was negative.
            let done = self.asm.new_dynamic_label();
            dynasm!(self.asm; test Rd(lc), Rd(lc));
            self.jcc(Cond::NotEqual, done);
            match constant {
                Some(v) if v < 0 => self.deoptimize_if(None, iidx, "minus zero")?,
                Some(0) => {
                    dynasm!(self.asm; cmp Rd(SCRATCH.code()), 0);
                    self.deoptimize_if(Some(Cond::Less), iidx, "minus zero")?;
                }
                Some(_) => (),
                None => {
                    op32!(self, or, SCRATCH, right);
                    self.deoptimize_if(Some(Cond::Sign), iidx, "minus zero")?;
                }
            }
            self.bind(done);
        }
        Ok(())
    }

    /// The checks `idiv` needs before dividing `rax` by `divisor`. If every use truncates, the
    /// quotient of `i32::MIN / -1` is `i32::MIN`, which is already in `rax`: the returned label
    /// must then be bound after the division.
    fn checked_division_prologue(
        &mut self,
        iidx: usize,
        divisor: Rq,
        flags: ArithFlags,
    ) -> Result<Option<DynamicLabel>, CompilationError> {
        let d = divisor.code();
        if flags.can_be_div_by_zero {
            dynasm!(self.asm; test Rd(d), Rd(d));
            self.deoptimize_if(Some(Cond::Equal), iidx, "division by zero")?;
        }
        if flags.bailout_on_minus_zero {
            // 0 / -x is -0.
            let nonzero = self.asm.new_dynamic_label();
            dynasm!(self.asm; test eax, eax);
            self.jcc(Cond::NotEqual, nonzero);
            dynasm!(self.asm; test Rd(d), Rd(d));
            self.deoptimize_if(Some(Cond::Sign), iidx, "minus zero")?;
            self.bind(nonzero);
        }
        let mut skip = None;
        if flags.can_overflow {
            // `idiv` faults on i32::MIN / -1.
            let no_overflow = self.asm.new_dynamic_label();
            dynasm!(self.asm; cmp eax, i32::MIN);
            self.jcc(Cond::NotEqual, no_overflow);
            dynasm!(self.asm; cmp Rd(d), -1);
            if flags.all_uses_truncating {
                let l = self.asm.new_dynamic_label();
                self.jcc(Cond::Equal, l);
                skip = Some(l);
            } else {
                self.deoptimize_if(Some(Cond::Equal), iidx, "overflow")?;
            }
            self.bind(no_overflow);
        }
        Ok(skip)
    }

    fn assert_divide_registers(&self, dividend: Operand, divisor: Operand) -> Rq {
        assert_eq!(self.to_register(dividend), Rq::RAX);
        let d = self.to_register(divisor);
        assert!(d != Rq::RAX && d != Rq::RDX);
        d
    }

    pub(super) fn cg_div_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: Operand,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(result), Rq::RAX);
        let d = self.assert_divide_registers(dividend, divisor);
        let skip = self.checked_division_prologue(iidx, d, flags)?;
        dynasm!(self.asm
            ; cdq
            ; idiv Rd(d.code())
        );
        if !flags.all_uses_truncating {
            dynasm!(self.asm; test edx, edx);
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "lost precision")?;
        }
        if let Some(l) = skip {
            self.bind(l);
        }
        Ok(())
    }

    pub(super) fn cg_div_by_power_of_2_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert!(divisor.unsigned_abs().is_power_of_two());
        let d = self.to_register(dividend);
        let r = self.to_register(result);
        assert!(r != d);
        let (d, r) = (d.code(), r.code());
        if flags.bailout_on_minus_zero && divisor < 0 {
            dynasm!(self.asm; test Rd(d), Rd(d));
            self.deoptimize_if(Some(Cond::Equal), iidx, "minus zero")?;
        }
        if flags.can_overflow && divisor == -1 && !flags.all_uses_truncating {
            dynasm!(self.asm; cmp Rd(d), i32::MIN);
            self.deoptimize_if(Some(Cond::Equal), iidx, "overflow")?;
        }
        if !flags.all_uses_truncating && divisor != 1 && divisor != -1 {
            let mask = (divisor.unsigned_abs() - 1) as i32;
            dynasm!(self.asm; test Rd(d), mask);
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "lost precision")?;
        }
        dynasm!(self.asm; mov Rd(r), Rd(d));
        let shift = divisor.unsigned_abs().trailing_zeros();
        if shift > 0 {
            // Bias negative dividends by `|divisor| - 1` so that the shift rounds toward zero.
            if shift > 1 {
                dynasm!(self.asm; sar Rd(r), 31);
            }
            let (rs, s) = ((32 - shift) as i8, shift as i8);
            dynasm!(self.asm
                ; shr Rd(r), rs
                ; add Rd(r), Rd(d)
                ; sar Rd(r), s
            );
        }
        if divisor < 0 {
            dynasm!(self.asm; neg Rd(r));
        }
        Ok(())
    }

    pub(super) fn cg_div_by_const_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(result), Rq::RDX);
        let d = self.to_register(dividend);
        if divisor == 0 {
            return self.deoptimize_if(None, iidx, "division by zero");
        }
        if flags.bailout_on_minus_zero && divisor < 0 {
            dynasm!(self.asm; test Rd(d.code()), Rd(d.code()));
            self.deoptimize_if(Some(Cond::Equal), iidx, "minus zero")?;
        }
        self.truncating_div(d, divisor.unsigned_abs());
        if divisor < 0 {
            dynasm!(self.asm; neg edx);
        }
        if !flags.all_uses_truncating {
            dynasm!(self.asm
                ; mov eax, edx
                ; imul eax, eax, divisor
                ; sub eax, Rd(d.code())
            );
            self.deoptimize_if(Some(Cond::NotEqual), iidx, "lost precision")?;
        }
        Ok(())
    }

    pub(super) fn cg_flooring_div_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: Operand,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(result), Rq::RAX);
        let d = self.assert_divide_registers(dividend, divisor);
        let skip = self.checked_division_prologue(iidx, d, flags)?;
        let done = self.asm.new_dynamic_label();
        dynasm!(self.asm
            ; cdq
            ; idiv Rd(d.code())
            ; test edx, edx
        );
        self.jcc(Cond::Equal, done);
        // A nonzero remainder whose sign differs from the divisor's means the quotient was
        // rounded up.
        dynasm!(self.asm
            ; xor edx, Rd(d.code())
            ; sar edx, 31
            ; add eax, edx
        );
        self.bind(done);
        if let Some(l) = skip {
            self.bind(l);
        }
        Ok(())
    }

    pub(super) fn cg_flooring_div_by_power_of_2_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert!(divisor.unsigned_abs().is_power_of_two());
        let d = self.to_register(dividend);
        assert_eq!(self.to_register(result), d);
        let d = d.code();
        if divisor == 1 {
            return Ok(());
        }
        let shift = divisor.unsigned_abs().trailing_zeros() as i8;
        if divisor > 1 {
            dynasm!(self.asm; sar Rd(d), shift);
            return Ok(());
        }
        dynasm!(self.asm; neg Rd(d));
        if flags.bailout_on_minus_zero {
            self.deoptimize_if(Some(Cond::Equal), iidx, "minus zero")?;
        }
        if divisor == -1 {
            if flags.left_can_be_min_int && !flags.all_uses_truncating {
                self.deoptimize_if(Some(Cond::Overflow), iidx, "overflow")?;
            }
            return Ok(());
        }
        if !flags.left_can_be_min_int {
            dynasm!(self.asm; sar Rd(d), shift);
            return Ok(());
        }
        // Negating i32::MIN overflowed: the quotient is a constant.
        let (not_min_int, done) = (self.asm.new_dynamic_label(), self.asm.new_dynamic_label());
        self.jcc(Cond::NoOverflow, not_min_int);
        dynasm!(self.asm; mov Rd(d), i32::MIN / divisor);
        self.jmp(done);
        self.bind(not_min_int);
        dynasm!(self.asm; sar Rd(d), shift);
        self.bind(done);
        Ok(())
    }

    pub(super) fn cg_flooring_div_by_const_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: i32,
        temp: Option<Operand>,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(result), Rq::RDX);
        let d = self.to_register(dividend);
        if divisor == 0 {
            return self.deoptimize_if(None, iidx, "division by zero");
        }
        if flags.bailout_on_minus_zero && divisor < 0 {
            dynasm!(self.asm; test Rd(d.code()), Rd(d.code()));
            self.deoptimize_if(Some(Cond::Equal), iidx, "minus zero")?;
        }
        let abs = divisor.unsigned_abs();
        if (divisor > 0 && !flags.left_can_be_negative)
            || (divisor < 0 && !flags.left_can_be_positive)
        {
            // Flooring and truncating agree.
            self.truncating_div(d, abs);
            if divisor < 0 {
                dynasm!(self.asm; neg edx);
            }
            return Ok(());
        }
        let t = self.to_register(
            temp.unwrap_or_else(|| panic!("Flooring division by {divisor} needs a temporary")),
        );
        assert!(t != d && t != Rq::RAX && t != Rq::RDX);
        let (needs_adjustment, done) = (self.asm.new_dynamic_label(), self.asm.new_dynamic_label());
        dynasm!(self.asm; cmp Rd(d.code()), 0);
        self.jcc(
            if divisor > 0 { Cond::Less } else { Cond::Greater },
            needs_adjustment,
        );
        self.truncating_div(d, abs);
        if divisor < 0 {
            dynasm!(self.asm; neg edx);
        }
        self.jmp(done);
        // Operands of different signs: floor(n / d) is ((n + sign(d)) / d) - 1, truncated.
        self.bind(needs_adjustment);
        let bias = if divisor > 0 { 1 } else { -1 };
        dynasm!(self.asm; lea Rd(t.code()), [Rq(d.code()) + bias]);
        self.truncating_div(t, abs);
        if divisor < 0 {
            dynasm!(self.asm; neg edx);
        }
        dynasm!(self.asm; dec edx);
        self.bind(done);
        Ok(())
    }

    pub(super) fn cg_mod_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: Operand,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(result), Rq::RDX);
        let d = self.assert_divide_registers(dividend, divisor).code();
        let done = self.asm.new_dynamic_label();
        if flags.can_be_div_by_zero {
            dynasm!(self.asm; test Rd(d), Rd(d));
            self.deoptimize_if(Some(Cond::Equal), iidx, "division by zero")?;
        }
        if flags.can_overflow {
            // i32::MIN % -1 is -0, which `idiv` can't compute anyway.
            let no_overflow = self.asm.new_dynamic_label();
            dynasm!(self.asm; cmp eax, i32::MIN);
            self.jcc(Cond::NotEqual, no_overflow);
            dynasm!(self.asm; cmp Rd(d), -1);
            if flags.bailout_on_minus_zero {
                self.deoptimize_if(Some(Cond::Equal), iidx, "minus zero")?;
            } else {
                self.jcc(Cond::NotEqual, no_overflow);
                self.mov_imm64(Rq::RDX, 0);
                self.jmp(done);
            }
            self.bind(no_overflow);
        }
        dynasm!(self.asm; cdq);
        if flags.bailout_on_minus_zero {
            // A negative dividend with a zero remainder gives -0.
            let positive = self.asm.new_dynamic_label();
            dynasm!(self.asm; test eax, eax);
            self.jcc(Cond::NotSign, positive);
            dynasm!(self.asm
                ; idiv Rd(d)
                ; test edx, edx
            );
            self.deoptimize_if(Some(Cond::Equal), iidx, "minus zero")?;
            self.jmp(done);
            self.bind(positive);
        }
        dynasm!(self.asm; idiv Rd(d));
        self.bind(done);
        Ok(())
    }

    pub(super) fn cg_mod_by_power_of_2_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert!(divisor.unsigned_abs().is_power_of_two());
        let d = self.to_register(dividend);
        assert_eq!(self.to_register(result), d);
        let d = d.code();
        let mask = (divisor.unsigned_abs() - 1) as i32;
        let (positive, done) = (self.asm.new_dynamic_label(), self.asm.new_dynamic_label());
        if flags.left_can_be_negative {
            dynasm!(self.asm; test Rd(d), Rd(d));
            self.jcc(Cond::NotSign, positive);
            // Also right for i32::MIN.
            dynasm!(self.asm
                ; neg Rd(d)
                ; and Rd(d), mask
                ; neg Rd(d)
            );
            if flags.bailout_on_minus_zero {
                self.deoptimize_if(Some(Cond::Equal), iidx, "minus zero")?;
            }
            self.jmp(done);
        }
        self.bind(positive);
        dynasm!(self.asm; and Rd(d), mask);
        self.bind(done);
        Ok(())
    }

    pub(super) fn cg_mod_by_const_i(
        &mut self,
        iidx: usize,
        result: Operand,
        dividend: Operand,
        divisor: i32,
        flags: ArithFlags,
    ) -> Result<(), CompilationError> {
        assert_eq!(self.to_register(result), Rq::RAX);
        let d = self.to_register(dividend);
        if divisor == 0 {
            return self.deoptimize_if(None, iidx, "division by zero");
        }
        let abs = divisor.unsigned_abs();
        self.truncating_div(d, abs);
        let (d, abs) = (d.code(), abs as i32);
        dynasm!(self.asm
            ; imul edx, edx, abs
            ; mov eax, Rd(d)
            ; sub eax, edx
        );
        if flags.bailout_on_minus_zero {
            let nonzero = self.asm.new_dynamic_label();
            self.jcc(Cond::NotEqual, nonzero);
            dynasm!(self.asm; cmp Rd(d), 0);
            self.deoptimize_if(Some(Cond::Less), iidx, "minus zero")?;
            self.bind(nonzero);
        }
        Ok(())
    }

    pub(super) fn cg_bit_i(
        &mut self,
        op: BitOp,
        result: Operand,
        left: Operand,
        right: Operand,
    ) -> Result<(), CompilationError> {
        let l = self.to_register(left);
        assert_eq!(self.to_register(result), l);
        match op {
            BitOp::Xor if self.int32_constant(right) == Some(-1) => {
                dynasm!(self.asm; not Rd(l.code()))
            }
            BitOp::And => op32!(self, and, l, right),
            BitOp::Or => op32!(self, or, l, right),
            BitOp::Xor => op32!(self, xor, l, right),
        }
        Ok(())
    }

    pub(super) fn cg_shift_i(
        &mut self,
        iidx: usize,
        op: ShiftOp,
        result: Operand,
        left: Operand,
        right: Operand,
        can_deopt: bool,
    ) -> Result<(), CompilationError> {
        let l = self.to_register(left);
        assert_eq!(self.to_register(result), l);
        let l = l.code();
        let Some(count) = self.int32_constant(right) else {
            assert_eq!(self.to_register(right), Rq::RCX);
            match op {
                ShiftOp::Ror => dynasm!(self.asm; ror Rd(l), cl),
                ShiftOp::Sar => dynasm!(self.asm; sar Rd(l), cl),
                ShiftOp::Shl => dynasm!(self.asm; shl Rd(l), cl),
                ShiftOp::Shr => {
                    dynasm!(self.asm; shr Rd(l), cl);
                    if can_deopt {
                        dynasm!(self.asm; test Rd(l), Rd(l));
                        self.deoptimize_if(Some(Cond::Sign), iidx, "negative value")?;
                    }
                }
            }
            return Ok(());
        };
        let count = (count & 0x1f) as i8;
        if count == 0 {
            // Only an unsigned shift by zero can produce a value that isn't an int32.
            if op == ShiftOp::Shr && can_deopt {
                dynasm!(self.asm; test Rd(l), Rd(l));
                self.deoptimize_if(Some(Cond::Sign), iidx, "negative value")?;
            }
            return Ok(());
        }
        match op {
            ShiftOp::Ror => dynasm!(self.asm; ror Rd(l), count),
            ShiftOp::Sar => dynasm!(self.asm; sar Rd(l), count),
            ShiftOp::Shl => dynasm!(self.asm; shl Rd(l), count),
            ShiftOp::Shr => dynasm!(self.asm; shr Rd(l), count),
        }
        Ok(())
    }

    pub(super) fn cg_math_min_max(
        &mut self,
        op: MinMaxOp,
        repr: Representation,
        result: Operand,
        left: Operand,
        right: Operand,
    ) -> Result<(), CompilationError> {
        match repr {
            Representation::Int32 | Representation::Smi => {
                let l = self.to_register(left);
                assert_eq!(self.to_register(result), l);
                let cond = match op {
                    MinMaxOp::Min => Cond::LessEqual,
                    MinMaxOp::Max => Cond::GreaterEqual,
                };
                let return_left = self.asm.new_dynamic_label();
                if repr == Representation::Smi {
                    op64!(self, cmp, l, right);
                    self.jcc(cond, return_left);
                    match self.resolve(right) {
                        // The constant is still in the scratch register.
                        Location::Immediate(_) => {
                            dynasm!(self.asm; mov Rq(l.code()), Rq(SCRATCH.code()))
                        }
                        _ => self.load_operand(l, right)?,
                    }
                } else {
                    op32!(self, cmp, l, right);
                    self.jcc(cond, return_left);
                    op32!(self, mov, l, right);
                }
                self.bind(return_left);
            }
            Representation::Double => {
                let l = self.to_double_register(left);
                assert_eq!(self.to_double_register(result), l);
                let r = self.to_double_register(right);
                self.double_min_max(op, l, r);
            }
            _ => panic!("Can't take the {op} of {repr:?} values"),
        }
        Ok(())
    }

    /// `l = min(l, r)` (or max) with JavaScript semantics: NaN wins, and -0 is less than +0.
    fn double_min_max(&mut self, op: MinMaxOp, l: Rx, r: Rx) {
        let cond = match op {
            MinMaxOp::Min => Cond::Below,
            MinMaxOp::Max => Cond::Above,
        };
        let check_nan_left = self.asm.new_dynamic_label();
        let check_zero = self.asm.new_dynamic_label();
        let return_left = self.asm.new_dynamic_label();
        let return_right = self.asm.new_dynamic_label();
        let (lc, rc, s) = (l.code(), r.code(), DOUBLE_SCRATCH.code());
        dynasm!(self.asm; ucomisd Rx(lc), Rx(rc));
        self.jcc(Cond::ParityEven, check_nan_left);
        self.jcc(Cond::Equal, check_zero);
        self.jcc(cond, return_left);
        self.jmp(return_right);

        self.bind(check_zero);
        dynasm!(self.asm
            ; xorps Rx(s), Rx(s)
            ; ucomisd Rx(lc), Rx(s)
        );
        self.jcc(Cond::NotEqual, return_left);
        // Both are zeros of either sign.
        match op {
            MinMaxOp::Min => dynasm!(self.asm; orps Rx(lc), Rx(rc)),
            MinMaxOp::Max => dynasm!(self.asm; addsd Rx(lc), Rx(rc)),
        }
        self.jmp(return_left);

        self.bind(check_nan_left);
        dynasm!(self.asm; ucomisd Rx(lc), Rx(lc));
        self.jcc(Cond::ParityEven, return_left);
        self.bind(return_right);
        dynasm!(self.asm; movaps Rx(lc), Rx(rc));
        self.bind(return_left);
    }

    pub(super) fn cg_math_abs(
        &mut self,
        iidx: usize,
        repr: Representation,
        result: Operand,
        value: Operand,
    ) -> Result<(), CompilationError> {
        match repr {
            Representation::Double => {
                let v = self.to_double_register(value);
                assert_eq!(self.to_double_register(result), v);
                let (v, s) = (v.code(), DOUBLE_SCRATCH.code());
                // Clears the sign bit, NaNs included.
                dynasm!(self.asm
                    ; xorps Rx(s), Rx(s)
                    ; subsd Rx(s), Rx(v)
                    ; andps Rx(v), Rx(s)
                );
            }
            Representation::Int32 | Representation::Smi => {
                let v = self.to_register(value);
                assert_eq!(self.to_register(result), v);
                let v = v.code();
                let positive = self.asm.new_dynamic_label();
                if repr == Representation::Smi {
                    dynasm!(self.asm; test Rq(v), Rq(v));
                    self.jcc(Cond::NotSign, positive);
                    dynasm!(self.asm; neg Rq(v));
                } else {
                    dynasm!(self.asm; test Rd(v), Rd(v));
                    self.jcc(Cond::NotSign, positive);
                    dynasm!(self.asm; neg Rd(v));
                }
                // Only the most negative value stays negative.
                self.deoptimize_if(Some(Cond::Sign), iidx, "overflow")?;
                self.bind(positive);
            }
            _ => panic!("Can't take the absolute value of a {repr:?}"),
        }
        Ok(())
    }

    pub(super) fn cg_math_clz32(
        &mut self,
        result: Operand,
        value: Operand,
    ) -> Result<(), CompilationError> {
        let r = self.to_register(result);
        let nonzero = self.asm.new_dynamic_label();
        match self.resolve(value) {
            Location::Register(Reg::GP(v)) => dynasm!(self.asm; bsr Rd(r.code()), Rd(v.code())),
            Location::Memory { base, disp } => {
                dynasm!(self.asm; bsr Rd(r.code()), [Rq(base.code()) + disp])
            }
            _ => panic!("{value} is not an integer operand"),
        }
        self.jcc(Cond::NotEqual, nonzero);
        // 63 ^ 31 == 32.
        self.mov_imm64(r, 63);
        self.bind(nonzero);
        dynasm!(self.asm; xor Rd(r.code()), 31);
        Ok(())
    }

    pub(super) fn cg_math_sqrt(
        &mut self,
        result: Operand,
        value: Operand,
    ) -> Result<(), CompilationError> {
        let r = self.to_double_register(result).code();
        match self.resolve(value) {
            Location::Register(Reg::FP(v)) => dynasm!(self.asm; sqrtsd Rx(r), Rx(v.code())),
            Location::Memory { base, disp } => {
                dynasm!(self.asm; sqrtsd Rx(r), [Rq(base.code()) + disp])
            }
            _ => panic!("{value} is not a double operand"),
        }
        Ok(())
    }

    pub(super) fn cg_arithmetic_d(
        &mut self,
        op: ArithOp,
        result: Operand,
        left: Operand,
        right: Operand,
    ) -> Result<(), CompilationError> {
        let l = self.to_double_register(left);
        assert_eq!(self.to_double_register(result), l);
        if op == ArithOp::Mod {
            assert_eq!(l, Rx::XMM0);
            assert_eq!(self.to_double_register(right), Rx::XMM1);
            self.call_fmod();
            return Ok(());
        }
        let l = l.code();
        match (op, self.resolve(right)) {
            (ArithOp::Add, Location::Register(Reg::FP(r))) => {
                dynasm!(self.asm; addsd Rx(l), Rx(r.code()))
            }
            (ArithOp::Sub, Location::Register(Reg::FP(r))) => {
                dynasm!(self.asm; subsd Rx(l), Rx(r.code()))
            }
            (ArithOp::Mul, Location::Register(Reg::FP(r))) => {
                dynasm!(self.asm; mulsd Rx(l), Rx(r.code()))
            }
            (ArithOp::Div, Location::Register(Reg::FP(r))) => {
                dynasm!(self.asm; divsd Rx(l), Rx(r.code()))
            }
            (ArithOp::Add, Location::Memory { base, disp }) => {
                dynasm!(self.asm; addsd Rx(l), [Rq(base.code()) + disp])
            }
            (ArithOp::Sub, Location::Memory { base, disp }) => {
                dynasm!(self.asm; subsd Rx(l), [Rq(base.code()) + disp])
            }
            (ArithOp::Mul, Location::Memory { base, disp }) => {
                dynasm!(self.asm; mulsd Rx(l), [Rq(base.code()) + disp])
            }
            (ArithOp::Div, Location::Memory { base, disp }) => {
                dynasm!(self.asm; divsd Rx(l), [Rq(base.code()) + disp])
            }
            _ => panic!("{right} is not a double operand"),
        }
        if op == ArithOp::Div {
            // Breaks the dependency on the divider's latency for later users.
            dynasm!(self.asm; movaps Rx(l), Rx(l));
        }
        Ok(())
    }

    /// `xmm0 = fmod(xmm0, xmm1)`, called with the stack aligned for C.
    fn call_fmod(&mut self) {
        let s = SCRATCH.code();
        dynasm!(self.asm
            ; mov Rq(s), rsp
            ; sub rsp, 8
            ; and rsp, -16
            ; mov [rsp], Rq(s)
        );
        let f = self.rt.external(ExternalRef::DoubleFpMod);
        self.call_address(f);
        dynasm!(self.asm; mov rsp, [rsp]);
    }
}

#[cfg(test)]
mod tests {
    use super::{super::testing::*, signed_division_magic};
    use crate::lir::{
        ArithFlags, ArithOp, BitOp, Constant, Inst, MinMaxOp, Operand, Representation, ShiftOp,
    };
    use dynasmrt::x64::Rq;

    fn reg(i: u8) -> Operand {
        Operand::Register(i)
    }

    fn dreg(i: u8) -> Operand {
        Operand::DoubleRegister(i)
    }

    #[test]
    fn magic_numbers() {
        assert_eq!(signed_division_magic(3), (0x5555_5556, 0));
        assert_eq!(signed_division_magic(5), (0x6666_6667, 1));
        assert_eq!(signed_division_magic(6), (0x2aaa_aaab, 0));
        assert_eq!(signed_division_magic(7), (0x9249_2493, 2));
        assert_eq!(signed_division_magic(10), (0x6666_6667, 2));
        assert_eq!(signed_division_magic(100), (0x51eb_851f, 5));
        assert_eq!(signed_division_magic(641), (0x0066_3d81, 0));
        assert_eq!(signed_division_magic(0x7fff_ffff), (0x4000_0001, 29));
    }

    #[test]
    #[should_panic]
    fn no_magic_for_one() {
        signed_division_magic(1);
    }

    /// Run the instruction sequence emitted for a truncating division.
    fn magic_divide(n: i32, d: u32) -> i32 {
        let (mul, shift) = signed_division_magic(d);
        let mut hi = ((i64::from(n) * i64::from(mul as i32)) >> 32) as i32;
        if mul & (1 << 31) != 0 {
            hi = hi.wrapping_add(n);
        }
        hi >>= shift;
        hi.wrapping_add(((n as u32) >> 31) as i32)
    }

    #[test]
    fn magic_division_truncates() {
        let ns = [
            0,
            1,
            -1,
            2,
            -2,
            7,
            -7,
            12345,
            -12345,
            0x1234_5678,
            -0x1234_5678,
            i32::MAX,
            i32::MAX - 1,
            i32::MIN,
            i32::MIN + 1,
        ];
        for d in (2..300).chain([641, 1 << 20, 1_000_000_007, i32::MAX as u32]) {
            for n in ns {
                let expect = i32::try_from(i64::from(n) / i64::from(d)).unwrap();
                assert_eq!(magic_divide(n, d), expect, "{n} / {d}");
            }
        }
    }

    #[test]
    fn add_and_sub() {
        let c = single_block(|c| {
            let five = c.add_const(Constant::int32(5));
            vec![
                Inst::AddI {
                    result: reg(1),
                    left: reg(0),
                    right: five,
                    flags: ArithFlags::default(),
                },
                Inst::AddI {
                    result: reg(1),
                    left: reg(0),
                    right: reg(2),
                    flags: ArithFlags::default(),
                },
                Inst::AddI {
                    result: reg(0),
                    left: reg(0),
                    right: Operand::StackSlot(0),
                    flags: ArithFlags {
                        can_overflow: true,
                        ..Default::default()
                    },
                },
                Inst::SubI {
                    result: reg(0),
                    left: reg(0),
                    right: five,
                    flags: ArithFlags {
                        can_overflow: true,
                        ..Default::default()
                    },
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> add-i
              lea ebx, [rax+5]
              ; <@2> add-i
              lea ebx, [rax+rdx]
              ; <@3> add-i
              add eax, [rbp-0x18]
              jo {{deopt}}
              ; <@4> sub-i
              sub eax, 5
              jo {{deopt}}
              ...
              ; -------------------- jump table --------------------
              ; deoptimize: overflow
              ...
            ",
        );
    }

    #[test]
    fn mul_by_constants() {
        let c = single_block(|c| {
            let mut insts = Vec::new();
            for v in [3, 4, 1, 100, -1] {
                let k = c.add_const(Constant::int32(v));
                insts.push(Inst::MulI {
                    result: reg(0),
                    left: reg(0),
                    right: k,
                    flags: ArithFlags::default(),
                });
            }
            let three = c.add_const(Constant::int32(3));
            insts.push(Inst::MulI {
                result: reg(0),
                left: reg(0),
                right: three,
                flags: ArithFlags {
                    can_overflow: true,
                    ..Default::default()
                },
            });
            insts
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> mul-i
              lea eax, [rax+rax*2]
              ; <@2> mul-i
              shl eax, 2
              ; <@3> mul-i
              ; <@4> mul-i
              imul eax, 0x64
              ; <@5> mul-i
              neg eax
              ; <@6> mul-i
              imul eax, 3
              jo {{deopt}}
              ...
            ",
        );
    }

    #[test]
    fn mul_minus_zero() {
        let c = single_block(|c| {
            let zero = c.add_const(Constant::int32(0));
            let minus_two = c.add_const(Constant::int32(-2));
            let flags = ArithFlags {
                bailout_on_minus_zero: true,
                ..Default::default()
            };
            vec![
                Inst::MulI {
                    result: reg(0),
                    left: reg(0),
                    right: reg(1),
                    flags: ArithFlags::checked(),
                },
                Inst::MulI {
                    result: reg(0),
                    left: reg(0),
                    right: zero,
                    flags,
                },
                Inst::MulI {
                    result: reg(0),
                    left: reg(0),
                    right: minus_two,
                    flags,
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> mul-i
              mov r10d, eax
              imul eax, ebx
              jo {{deopt}}
              test eax, eax
              jne {{done1}}
              or r10d, ebx
              js {{deopt}}
              ; <@2> mul-i
              mov r10d, eax
              xor eax, eax
              test eax, eax
              jne {{done2}}
              cmp r10d, 0
              jl {{deopt}}
              ; <@3> mul-i
              mov r10d, eax
              imul eax, {{minus_two}}
              test eax, eax
              jne {{done3}}
              ; deoptimize: minus zero
              mov r10, 0x70000000
              call r10
              ...
            ",
        );
    }

    #[test]
    fn checked_division() {
        let c = single_block(|_| {
            vec![Inst::DivI {
                result: reg(0),
                dividend: reg(0),
                divisor: reg(1),
                flags: ArithFlags::checked(),
            }]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> div-i
              test ebx, ebx
              je {{deopt}}
              test eax, eax
              jne {{nonzero}}
              test ebx, ebx
              js {{deopt}}
              cmp eax, 0x80000000
              jne {{no_overflow}}
              cmp ebx, {{minus_one}}
              je {{deopt}}
              cdq
              idiv ebx
              test edx, edx
              jne {{deopt}}
              ...
              ; deoptimize: division by zero
              ...
            ",
        );
    }

    #[test]
    fn truncating_division_skips_min_int_by_minus_one() {
        let c = single_block(|_| {
            vec![
                Inst::DivI {
                    result: reg(0),
                    dividend: reg(0),
                    divisor: reg(1),
                    flags: ArithFlags {
                        can_overflow: true,
                        all_uses_truncating: true,
                        ..Default::default()
                    },
                },
                Inst::FlooringDivI {
                    result: reg(0),
                    dividend: reg(0),
                    divisor: reg(1),
                    flags: ArithFlags::default(),
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> div-i
              cmp eax, 0x80000000
              jne {{no_overflow}}
              cmp ebx, {{minus_one}}
              je {{skip}}
              cdq
              idiv ebx
              ; <@2> flooring-div-i
              cdq
              idiv ebx
              test edx, edx
              je {{done}}
              xor edx, ebx
              sar edx, 0x1f
              add eax, edx
              ...
            ",
        );
    }

    #[test]
    fn division_by_powers_of_two() {
        let c = single_block(|_| {
            vec![
                Inst::DivByPowerOf2I {
                    result: reg(1),
                    dividend: reg(0),
                    divisor: 4,
                    flags: ArithFlags {
                        all_uses_truncating: true,
                        ..Default::default()
                    },
                },
                Inst::DivByPowerOf2I {
                    result: reg(1),
                    dividend: reg(0),
                    divisor: -2,
                    flags: ArithFlags::checked(),
                },
                Inst::FlooringDivByPowerOf2I {
                    result: reg(0),
                    dividend: reg(0),
                    divisor: 8,
                    flags: ArithFlags::checked(),
                },
                Inst::FlooringDivByPowerOf2I {
                    result: reg(0),
                    dividend: reg(0),
                    divisor: -4,
                    flags: ArithFlags::checked(),
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> div-by-power-of-2-i
              mov ebx, eax
              sar ebx, 0x1f
              shr ebx, 0x1e
              add ebx, eax
              sar ebx, 2
              ; <@2> div-by-power-of-2-i
              test eax, eax
              je {{deopt}}
              test eax, 1
              jne {{deopt}}
              mov ebx, eax
              shr ebx, 0x1f
              add ebx, eax
              sar ebx, 1
              neg ebx
              ; <@3> flooring-div-by-power-of-2-i
              sar eax, 3
              ; <@4> flooring-div-by-power-of-2-i
              neg eax
              je {{deopt}}
              jno {{not_min_int}}
              mov eax, {{quotient}}
              jmp {{done}}
              sar eax, 2
              ...
            ",
        );
    }

    #[test]
    fn division_by_constants() {
        let c = single_block(|_| {
            vec![
                Inst::DivByConstI {
                    result: reg(2),
                    dividend: reg(1),
                    divisor: 3,
                    flags: ArithFlags::checked(),
                },
                Inst::DivByConstI {
                    result: reg(2),
                    dividend: reg(1),
                    divisor: -7,
                    flags: ArithFlags {
                        all_uses_truncating: true,
                        ..Default::default()
                    },
                },
                Inst::DivByConstI {
                    result: reg(2),
                    dividend: reg(1),
                    divisor: 0,
                    flags: ArithFlags::checked(),
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> div-by-const-i
              mov eax, 0x55555556
              imul ebx
              mov eax, ebx
              shr eax, 0x1f
              add edx, eax
              mov eax, edx
              imul eax, 3
              sub eax, ebx
              jne {{deopt}}
              ; <@2> div-by-const-i
              mov eax, 0x92492493
              imul ebx
              add edx, ebx
              sar edx, 2
              mov eax, ebx
              shr eax, 0x1f
              add edx, eax
              neg edx
              ; <@3> div-by-const-i
              ; deoptimize: division by zero
              mov r10, 0x70000000
              call r10
              ...
            ",
        );
    }

    #[test]
    fn flooring_division_by_constant() {
        let c = single_block(|_| {
            vec![
                Inst::FlooringDivByConstI {
                    result: reg(2),
                    dividend: reg(1),
                    divisor: 3,
                    temp: None,
                    flags: ArithFlags::default(),
                },
                Inst::FlooringDivByConstI {
                    result: reg(2),
                    dividend: reg(1),
                    divisor: 3,
                    temp: Some(reg(3)),
                    flags: ArithFlags {
                        left_can_be_negative: true,
                        ..Default::default()
                    },
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> flooring-div-by-const-i
              mov eax, 0x55555556
              imul ebx
              mov eax, ebx
              shr eax, 0x1f
              add edx, eax
              ; <@2> flooring-div-by-const-i
              cmp ebx, 0
              jl {{adjust}}
              mov eax, 0x55555556
              imul ebx
              mov eax, ebx
              shr eax, 0x1f
              add edx, eax
              jmp {{done}}
              lea ecx, [rbx+1]
              mov eax, 0x55555556
              imul ecx
              mov eax, ecx
              shr eax, 0x1f
              add edx, eax
              dec edx
              ...
            ",
        );
    }

    #[test]
    #[should_panic(expected = "needs a temporary")]
    fn flooring_division_needs_temp() {
        let c = single_block(|_| {
            vec![Inst::FlooringDivByConstI {
                result: reg(2),
                dividend: reg(1),
                divisor: 3,
                temp: None,
                flags: ArithFlags::checked(),
            }]
        });
        codegen(&c);
    }

    #[test]
    fn modulus() {
        let c = single_block(|_| {
            vec![
                Inst::ModI {
                    result: reg(2),
                    dividend: reg(0),
                    divisor: reg(1),
                    flags: ArithFlags {
                        can_overflow: true,
                        ..Default::default()
                    },
                },
                Inst::ModI {
                    result: reg(2),
                    dividend: reg(0),
                    divisor: reg(1),
                    flags: ArithFlags {
                        bailout_on_minus_zero: true,
                        ..Default::default()
                    },
                },
                Inst::ModByPowerOf2I {
                    result: reg(0),
                    dividend: reg(0),
                    divisor: 8,
                    flags: ArithFlags::checked(),
                },
                Inst::ModByConstI {
                    result: reg(0),
                    dividend: reg(1),
                    divisor: 3,
                    flags: ArithFlags::checked(),
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> mod-i
              cmp eax, 0x80000000
              jne {{no_overflow}}
              cmp ebx, {{minus_one}}
              jne {{no_overflow}}
              xor edx, edx
              jmp {{done1}}
              cdq
              idiv ebx
              ; <@2> mod-i
              cdq
              test eax, eax
              jns {{positive}}
              idiv ebx
              test edx, edx
              je {{deopt}}
              jmp {{done2}}
              idiv ebx
              ; <@3> mod-by-power-of-2-i
              test eax, eax
              jns {{positive2}}
              neg eax
              and eax, 7
              neg eax
              je {{deopt}}
              jmp {{done3}}
              and eax, 7
              ; <@4> mod-by-const-i
              mov eax, 0x55555556
              imul ebx
              mov eax, ebx
              shr eax, 0x1f
              add edx, eax
              imul edx, 3
              mov eax, ebx
              sub eax, edx
              jne {{nonzero}}
              cmp ebx, 0
              jl {{deopt}}
              ...
            ",
        );
    }

    #[test]
    fn bits_and_shifts() {
        let c = single_block(|c| {
            let minus_one = c.add_const(Constant::int32(-1));
            let k = c.add_const(Constant::int32(0xff));
            let zero = c.add_const(Constant::int32(0));
            let thirty_three = c.add_const(Constant::int32(33));
            vec![
                Inst::BitI {
                    op: BitOp::Xor,
                    result: reg(0),
                    left: reg(0),
                    right: minus_one,
                },
                Inst::BitI {
                    op: BitOp::And,
                    result: reg(0),
                    left: reg(0),
                    right: k,
                },
                Inst::BitI {
                    op: BitOp::Or,
                    result: reg(0),
                    left: reg(0),
                    right: reg(1),
                },
                Inst::ShiftI {
                    op: ShiftOp::Shr,
                    result: reg(0),
                    left: reg(0),
                    right: reg(3),
                    can_deopt: true,
                },
                Inst::ShiftI {
                    op: ShiftOp::Shl,
                    result: reg(0),
                    left: reg(0),
                    right: thirty_three,
                    can_deopt: false,
                },
                Inst::ShiftI {
                    op: ShiftOp::Sar,
                    result: reg(0),
                    left: reg(0),
                    right: zero,
                    can_deopt: false,
                },
                Inst::ShiftI {
                    op: ShiftOp::Shr,
                    result: reg(0),
                    left: reg(0),
                    right: zero,
                    can_deopt: true,
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> bit-i
              not eax
              ; <@2> bit-i
              and eax, 0xff
              ; <@3> bit-i
              or eax, ebx
              ; <@4> shift-i
              shr eax, cl
              test eax, eax
              js {{deopt}}
              ; <@5> shift-i
              shl eax, 1
              ; <@6> shift-i
              ; <@7> shift-i
              test eax, eax
              js {{deopt}}
              ...
            ",
        );
    }

    #[test]
    fn integer_min_max() {
        let c = single_block(|c| {
            let ten = c.add_const(Constant::int32(10));
            let smi = c.add_const(Constant::smi(10));
            vec![
                Inst::MathMinMax {
                    op: MinMaxOp::Min,
                    repr: Representation::Int32,
                    result: reg(0),
                    left: reg(0),
                    right: ten,
                },
                Inst::MathMinMax {
                    op: MinMaxOp::Max,
                    repr: Representation::Int32,
                    result: reg(0),
                    left: reg(0),
                    right: reg(1),
                },
                Inst::MathMinMax {
                    op: MinMaxOp::Max,
                    repr: Representation::Smi,
                    result: reg(0),
                    left: reg(0),
                    right: smi,
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> math-min-max
              cmp eax, 0xa
              jle {{l1}}
              mov eax, 0xa
              ; <@2> math-min-max
              cmp eax, ebx
              jge {{l2}}
              mov eax, ebx
              ; <@3> math-min-max
              mov r10, 0xa00000000
              cmp rax, r10
              jge {{l3}}
              mov rax, r10
              ...
            ",
        );
    }

    #[test]
    fn double_min() {
        let c = single_block(|_| {
            vec![Inst::MathMinMax {
                op: MinMaxOp::Min,
                repr: Representation::Double,
                result: dreg(2),
                left: dreg(2),
                right: dreg(3),
            }]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> math-min-max
              ucomisd xmm2, xmm3
              jp {{check_nan_left}}
              je {{check_zero}}
              jb {{return_left}}
              jmp {{return_right}}
              xorps xmm15, xmm15
              ucomisd xmm2, xmm15
              jne {{return_left}}
              orps xmm2, xmm3
              jmp {{return_left}}
              ucomisd xmm2, xmm2
              jp {{return_left}}
              movaps xmm2, xmm3
              ...
            ",
        );
    }

    #[test]
    fn abs_clz32_and_sqrt() {
        let c = single_block(|_| {
            vec![
                Inst::MathAbs {
                    repr: Representation::Int32,
                    result: reg(0),
                    value: reg(0),
                },
                Inst::MathAbs {
                    repr: Representation::Double,
                    result: dreg(1),
                    value: dreg(1),
                },
                Inst::MathClz32 {
                    result: reg(1),
                    value: reg(0),
                },
                Inst::MathSqrt {
                    result: dreg(0),
                    value: Operand::DoubleStackSlot(1),
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> math-abs
              test eax, eax
              jns {{positive}}
              neg eax
              js {{deopt}}
              ; <@2> math-abs
              xorps xmm15, xmm15
              subsd xmm15, xmm1
              andps xmm1, xmm15
              ; <@3> math-clz32
              bsr ebx, eax
              jne {{nonzero}}
              mov ebx, 0x3f
              xor ebx, 0x1f
              ; <@4> math-sqrt
              sqrtsd xmm0, [rbp-0x20]
              ...
            ",
        );
    }

    #[test]
    fn double_arithmetic() {
        let c = single_block(|_| {
            vec![
                Inst::ArithmeticD {
                    op: ArithOp::Add,
                    result: dreg(2),
                    left: dreg(2),
                    right: dreg(3),
                },
                Inst::ArithmeticD {
                    op: ArithOp::Div,
                    result: dreg(2),
                    left: dreg(2),
                    right: Operand::DoubleStackSlot(0),
                },
                Inst::ArithmeticD {
                    op: ArithOp::Mod,
                    result: dreg(0),
                    left: dreg(0),
                    right: dreg(1),
                },
            ]
        });
        codegen_and_test(
            &c,
            "
              ...
              ; <@1> arithmetic-d
              addsd xmm2, xmm3
              ; <@2> arithmetic-d
              divsd xmm2, [rbp-0x18]
              movaps xmm2, xmm2
              ; <@3> arithmetic-d
              mov r10, rsp
              sub rsp, 8
              and rsp, {{align}}
              mov [rsp], r10
              mov r10, 0x63001000
              call r10
              mov rsp, [rsp]
              ...
            ",
        );
    }

    /// Run `inst` with `rax` and `rbx` holding `a` and `b`. Returns `out`, or `None` if `inst`
    /// deoptimised.
    fn run(inst: Inst, a: i32, b: i32, out: Rq) -> Option<i32> {
        let c = single_block(move |_| vec![inst]);
        run_body(&c, &[(Rq::RAX, a), (Rq::RBX, b)]).int32(out)
    }

    #[test]
    fn addition_overflow() {
        let add = |result, can_overflow| Inst::AddI {
            result,
            left: reg(0),
            right: reg(1),
            flags: ArithFlags {
                can_overflow,
                ..Default::default()
            },
        };
        assert_eq!(run(add(reg(0), true), 0x7FFF_FFFF, 1, Rq::RAX), None);
        assert_eq!(run(add(reg(0), true), 0x7FFF_FFFE, 1, Rq::RAX), Some(i32::MAX));
        assert_eq!(run(add(reg(0), true), -5, 3, Rq::RAX), Some(-2));
        // Without the check the sum wraps.
        assert_eq!(run(add(reg(0), false), 0x7FFF_FFFF, 1, Rq::RAX), Some(i32::MIN));
        assert_eq!(run(add(reg(2), false), 0x7FFF_FFFF, 1, Rq::RDX), Some(i32::MIN));

        let sub = Inst::SubI {
            result: reg(0),
            left: reg(0),
            right: reg(1),
            flags: ArithFlags {
                can_overflow: true,
                ..Default::default()
            },
        };
        assert_eq!(run(sub, i32::MIN, 1, Rq::RAX), None);
    }

    #[test]
    fn division_results() {
        let div = |flags| Inst::DivI {
            result: reg(0),
            dividend: reg(0),
            divisor: reg(1),
            flags,
        };
        let truncating = ArithFlags {
            can_overflow: true,
            all_uses_truncating: true,
            ..Default::default()
        };
        assert_eq!(run(div(truncating), i32::MIN, -1, Rq::RAX), Some(i32::MIN));
        assert_eq!(run(div(truncating), 7, 2, Rq::RAX), Some(3));
        assert_eq!(run(div(truncating), -7, 2, Rq::RAX), Some(-3));
        assert_eq!(run(div(ArithFlags::checked()), -12, 4, Rq::RAX), Some(-3));
        assert_eq!(run(div(ArithFlags::checked()), i32::MIN, -1, Rq::RAX), None);
        assert_eq!(run(div(ArithFlags::checked()), 7, 2, Rq::RAX), None);
        assert_eq!(run(div(ArithFlags::checked()), 7, 0, Rq::RAX), None);
        // 0 / -3 is -0.
        assert_eq!(run(div(ArithFlags::checked()), 0, -3, Rq::RAX), None);

        let by_const = |dividend| {
            run(
                Inst::DivByConstI {
                    result: reg(2),
                    dividend: reg(1),
                    divisor: -3,
                    flags: ArithFlags::checked(),
                },
                0,
                dividend,
                Rq::RDX,
            )
        };
        assert_eq!(by_const(-9), Some(3));
        assert_eq!(by_const(i32::MIN + 2), Some(715_827_882));
        assert_eq!(by_const(7), None);
    }

    #[test]
    fn flooring_division_results() {
        let floor = |flags| Inst::FlooringDivI {
            result: reg(0),
            dividend: reg(0),
            divisor: reg(1),
            flags,
        };
        let flags = ArithFlags::default();
        assert_eq!(run(floor(flags), -7, 2, Rq::RAX), Some(-4));
        assert_eq!(run(floor(flags), 7, -2, Rq::RAX), Some(-4));
        assert_eq!(run(floor(flags), -7, -2, Rq::RAX), Some(3));
        assert_eq!(run(floor(flags), 7, 2, Rq::RAX), Some(3));
        assert_eq!(run(floor(flags), -8, 2, Rq::RAX), Some(-4));
        let truncating = ArithFlags {
            can_overflow: true,
            all_uses_truncating: true,
            ..Default::default()
        };
        assert_eq!(run(floor(truncating), i32::MIN, -1, Rq::RAX), Some(i32::MIN));

        let by_power_of_2 = Inst::FlooringDivByPowerOf2I {
            result: reg(0),
            dividend: reg(0),
            divisor: 2,
            flags,
        };
        assert_eq!(run(by_power_of_2, -7, 0, Rq::RAX), Some(-4));

        let by_const = |divisor, dividend| {
            run(
                Inst::FlooringDivByConstI {
                    result: reg(2),
                    dividend: reg(1),
                    divisor,
                    temp: Some(reg(3)),
                    flags: ArithFlags {
                        left_can_be_negative: true,
                        left_can_be_positive: true,
                        ..Default::default()
                    },
                },
                0,
                dividend,
                Rq::RDX,
            )
        };
        assert_eq!(by_const(3, -7), Some(-3));
        assert_eq!(by_const(3, -6), Some(-2));
        assert_eq!(by_const(3, 7), Some(2));
        assert_eq!(by_const(-3, 7), Some(-3));
        assert_eq!(by_const(-3, -7), Some(2));
    }

    #[test]
    fn modulus_results() {
        let modi = |flags| Inst::ModI {
            result: reg(2),
            dividend: reg(0),
            divisor: reg(1),
            flags,
        };
        let flags = ArithFlags::default();
        assert_eq!(run(modi(flags), -7, 2, Rq::RDX), Some(-1));
        assert_eq!(run(modi(flags), 7, -2, Rq::RDX), Some(1));
        assert_eq!(run(modi(ArithFlags::checked()), -7, -2, Rq::RDX), Some(-1));
        // -4 % 2 is -0.
        assert_eq!(run(modi(ArithFlags::checked()), -4, 2, Rq::RDX), None);
        assert_eq!(run(modi(ArithFlags::checked()), 4, 0, Rq::RDX), None);
        let overflow = ArithFlags {
            can_overflow: true,
            ..Default::default()
        };
        assert_eq!(run(modi(overflow), i32::MIN, -1, Rq::RDX), Some(0));

        let by_power_of_2 = |dividend| {
            run(
                Inst::ModByPowerOf2I {
                    result: reg(0),
                    dividend: reg(0),
                    divisor: -4,
                    flags: ArithFlags {
                        left_can_be_negative: true,
                        ..Default::default()
                    },
                },
                dividend,
                0,
                Rq::RAX,
            )
        };
        assert_eq!(by_power_of_2(-7), Some(-3));
        assert_eq!(by_power_of_2(7), Some(3));
        assert_eq!(by_power_of_2(i32::MIN), Some(0));

        let by_const = |divisor, dividend| {
            run(
                Inst::ModByConstI {
                    result: reg(0),
                    dividend: reg(1),
                    divisor,
                    flags,
                },
                0,
                dividend,
                Rq::RAX,
            )
        };
        assert_eq!(by_const(3, -7), Some(-1));
        assert_eq!(by_const(-3, 7), Some(1));
        assert_eq!(by_const(10, i32::MIN), Some(-8));
    }
}
