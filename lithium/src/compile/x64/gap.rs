//! Resolving parallel moves into sequential ones.
//!
//! A gap's moves all read their sources before any destination is written. We emit them one at a
//! time: a move whose destination no other pending move reads can go immediately; when every
//! pending move is blocked the remaining moves form cycles, which are broken with swaps.

use super::{
    operand::{Location, Reg},
    Assemble, DOUBLE_SCRATCH, SCRATCH,
};
use crate::{compile::CompilationError, lir::Move, lir::Operand};
use dynasmrt::{dynasm, DynasmApi, Register as dynasmrtRegister};

/// One step of a sequentialised parallel move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(super) enum Step {
    Move(Move),
    Swap(Operand, Operand),
}

/// Stack slots and double stack slots with the same index are the same memory.
fn same_location(a: Operand, b: Operand) -> bool {
    match (a, b) {
        (
            Operand::StackSlot(x) | Operand::DoubleStackSlot(x),
            Operand::StackSlot(y) | Operand::DoubleStackSlot(y),
        ) => x == y,
        _ => a == b,
    }
}

/// Order `moves` so that performing the returned steps sequentially has the effect of performing
/// `moves` in parallel.
pub(super) fn resolve_parallel_moves(moves: &[Move]) -> Vec<Step> {
    let mut pending = moves
        .iter()
        .filter(|m| !same_location(m.src, m.dst))
        .copied()
        .collect::<Vec<_>>();
    let mut steps = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending.iter().position(|m| {
            !pending
                .iter()
                .any(|other| other != m && same_location(other.src, m.dst))
        });
        match ready {
            Some(i) => steps.push(Step::Move(pending.remove(i))),
            None => {
                // Every destination is still to be read: all remaining moves are in cycles.
                let m = pending.remove(0);
                steps.push(Step::Swap(m.src, m.dst));
                for other in pending.iter_mut() {
                    if same_location(other.src, m.src) {
                        other.src = m.dst;
                    } else if same_location(other.src, m.dst) {
                        other.src = m.src;
                    }
                }
                pending.retain(|m| !same_location(m.src, m.dst));
            }
        }
    }
    steps
}

impl Assemble<'_> {
    pub(super) fn cg_gap(&mut self, moves: &[Move]) -> Result<(), CompilationError> {
        for step in resolve_parallel_moves(moves) {
            match step {
                Step::Move(m) => self.emit_move(m)?,
                Step::Swap(a, b) => self.emit_swap(a, b),
            }
        }
        Ok(())
    }

    fn emit_move(&mut self, m: Move) -> Result<(), CompilationError> {
        match (self.resolve(m.dst), self.resolve(m.src)) {
            (Location::Register(Reg::GP(d)), _) => self.load_operand(d, m.src)?,
            (Location::Register(Reg::FP(d)), _) => self.load_double(d, m.src),
            (Location::Memory { base, disp }, Location::Register(Reg::GP(s))) => {
                dynasm!(self.asm; mov [Rq(base.code()) + disp], Rq(s.code()));
            }
            (Location::Memory { base, disp }, Location::Register(Reg::FP(s))) => {
                dynasm!(self.asm; movsd [Rq(base.code()) + disp], Rx(s.code()));
            }
            (Location::Memory { base, disp }, Location::Memory { .. }) => {
                if m.src.is_double_stack_slot() {
                    self.load_double(DOUBLE_SCRATCH, m.src);
                    dynasm!(self.asm; movsd [Rq(base.code()) + disp], Rx(DOUBLE_SCRATCH.code()));
                } else {
                    self.load_operand(SCRATCH, m.src)?;
                    dynasm!(self.asm; mov [Rq(base.code()) + disp], Rq(SCRATCH.code()));
                }
            }
            (Location::Memory { base, disp }, Location::Immediate(c)) => {
                if m.dst.is_double_stack_slot() {
                    self.load_double(DOUBLE_SCRATCH, m.src);
                    dynasm!(self.asm; movsd [Rq(base.code()) + disp], Rx(DOUBLE_SCRATCH.code()));
                } else {
                    self.load_constant(SCRATCH, c)?;
                    dynasm!(self.asm; mov [Rq(base.code()) + disp], Rq(SCRATCH.code()));
                }
            }
            (Location::Immediate(_), _) => panic!("Move into constant {}", m.dst),
        }
        Ok(())
    }

    fn emit_swap(&mut self, a: Operand, b: Operand) {
        match (self.resolve(a), self.resolve(b)) {
            (Location::Register(Reg::GP(x)), Location::Register(Reg::GP(y))) => {
                dynasm!(self.asm; xchg Rq(x.code()), Rq(y.code()));
            }
            (Location::Register(Reg::GP(r)), Location::Memory { base, disp })
            | (Location::Memory { base, disp }, Location::Register(Reg::GP(r))) => {
                dynasm!(self.asm
                    ; mov Rq(SCRATCH.code()), [Rq(base.code()) + disp]
                    ; mov [Rq(base.code()) + disp], Rq(r.code())
                    ; mov Rq(r.code()), Rq(SCRATCH.code())
                );
            }
            (
                Location::Memory {
                    base: b1,
                    disp: d1,
                },
                Location::Memory {
                    base: b2,
                    disp: d2,
                },
            ) => {
                dynasm!(self.asm
                    ; mov Rq(SCRATCH.code()), [Rq(b1.code()) + d1]
                    ; movsd Rx(DOUBLE_SCRATCH.code()), [Rq(b2.code()) + d2]
                    ; movsd [Rq(b1.code()) + d1], Rx(DOUBLE_SCRATCH.code())
                    ; mov [Rq(b2.code()) + d2], Rq(SCRATCH.code())
                );
            }
            (Location::Register(Reg::FP(x)), Location::Register(Reg::FP(y))) => {
                dynasm!(self.asm
                    ; movaps Rx(DOUBLE_SCRATCH.code()), Rx(x.code())
                    ; movaps Rx(x.code()), Rx(y.code())
                    ; movaps Rx(y.code()), Rx(DOUBLE_SCRATCH.code())
                );
            }
            (Location::Register(Reg::FP(r)), Location::Memory { base, disp })
            | (Location::Memory { base, disp }, Location::Register(Reg::FP(r))) => {
                dynasm!(self.asm
                    ; movsd Rx(DOUBLE_SCRATCH.code()), [Rq(base.code()) + disp]
                    ; movsd [Rq(base.code()) + disp], Rx(r.code())
                    ; movaps Rx(r.code()), Rx(DOUBLE_SCRATCH.code())
                );
            }
            _ => panic!("Can't swap {a} and {b}"),
        }
    }
}
