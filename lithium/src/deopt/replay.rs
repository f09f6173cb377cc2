//! Replaying a translation against a snapshot of machine state. This is what the deoptimiser
//! does when it rebuilds unoptimised frames; here it is used to check that translations say what
//! the code generator meant.

use super::{Literal, Opcode, TranslationIterator, SELF_LITERAL_ID};
use crate::lir::BailoutId;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ReplayError {
    #[error("Translation ends unexpectedly")]
    Truncated,
    #[error("Expected {expected} but found {found:?}")]
    Unexpected {
        expected: &'static str,
        found: Option<Opcode>,
    },
    #[error("No literal {0}")]
    NoSuchLiteral(i32),
    #[error("Stack slot {0} not in snapshot")]
    MissingSlot(i32),
    #[error("Register code {0} out of range")]
    BadRegister(i32),
    #[error("Duplicate of unknown object {0}")]
    BadDuplicate(i32),
}

/// The state of an optimised frame at a deoptimisation point.
#[derive(Clone, Debug, Default)]
pub struct MachineSnapshot {
    /// General purpose registers by x64 register code.
    pub registers: [u64; 16],
    /// `xmm` registers by code.
    pub doubles: [f64; 16],
    /// Raw stack slot contents by slot index (negative for parameters).
    pub slots: HashMap<i32, u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TranslatedValue {
    Tagged(u64),
    Int32(i32),
    Uint32(u32),
    Double(f64),
    Literal(Literal),
    Object {
        is_arguments: bool,
        fields: Vec<TranslatedValue>,
    },
    /// The same object as the frame's `n`th materialised object.
    Duplicate(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FrameFunction {
    /// The function whose optimised code is being deoptimised.
    Compiling,
    Literal(Literal),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TranslatedFrameKind {
    JsFunction {
        ast_id: BailoutId,
        function: FrameFunction,
        height: usize,
    },
    Construct {
        function: FrameFunction,
        height: usize,
    },
    Getter {
        function: FrameFunction,
    },
    Setter {
        function: FrameFunction,
    },
    ArgumentsAdaptor {
        function: FrameFunction,
        height: usize,
    },
    CompiledStub,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TranslatedFrame {
    pub kind: TranslatedFrameKind,
    pub values: Vec<TranslatedValue>,
}

pub(super) fn replay(
    mut it: TranslationIterator,
    literals: &[Literal],
    snap: &MachineSnapshot,
) -> Result<Vec<TranslatedFrame>, ReplayError> {
    let mut r = Replayer {
        literals,
        snap,
        objects: 0,
    };
    match it.next_opcode() {
        Some(Opcode::Begin) => (),
        found => {
            return Err(ReplayError::Unexpected {
                expected: "BEGIN",
                found,
            })
        }
    }
    let frame_count = r.operand(&mut it)?;
    r.operand(&mut it)?;
    let mut frames = Vec::new();
    for _ in 0..frame_count {
        let kind = r.frame(&mut it)?;
        r.objects = 0;
        let mut values = Vec::new();
        while let Some(op) = it.peek_opcode() {
            if op.begins_frame() || op == Opcode::Begin {
                break;
            }
            values.push(r.value(&mut it)?);
        }
        frames.push(TranslatedFrame { kind, values });
    }
    Ok(frames)
}

struct Replayer<'a> {
    literals: &'a [Literal],
    snap: &'a MachineSnapshot,
    /// The number of objects (including duplicates) seen so far in the current frame.
    objects: usize,
}

impl Replayer<'_> {
    fn operand(&self, it: &mut TranslationIterator) -> Result<i32, ReplayError> {
        it.next_int().ok_or(ReplayError::Truncated)
    }

    fn count(&self, it: &mut TranslationIterator) -> Result<usize, ReplayError> {
        let x = self.operand(it)?;
        usize::try_from(x).map_err(|_| ReplayError::Truncated)
    }

    fn function(&self, it: &mut TranslationIterator) -> Result<FrameFunction, ReplayError> {
        match self.operand(it)? {
            SELF_LITERAL_ID => Ok(FrameFunction::Compiling),
            x => Ok(FrameFunction::Literal(self.literal(x)?)),
        }
    }

    fn literal(&self, id: i32) -> Result<Literal, ReplayError> {
        usize::try_from(id)
            .ok()
            .and_then(|x| self.literals.get(x))
            .copied()
            .ok_or(ReplayError::NoSuchLiteral(id))
    }

    fn frame(&self, it: &mut TranslationIterator) -> Result<TranslatedFrameKind, ReplayError> {
        match it.next_opcode() {
            Some(Opcode::JsFrame) => {
                let ast_id = self.operand(it)?;
                let function = self.function(it)?;
                let height = self.count(it)?;
                Ok(TranslatedFrameKind::JsFunction {
                    ast_id,
                    function,
                    height,
                })
            }
            Some(Opcode::ConstructStubFrame) => {
                let function = self.function(it)?;
                let height = self.count(it)?;
                Ok(TranslatedFrameKind::Construct { function, height })
            }
            Some(Opcode::GetterStubFrame) => Ok(TranslatedFrameKind::Getter {
                function: self.function(it)?,
            }),
            Some(Opcode::SetterStubFrame) => Ok(TranslatedFrameKind::Setter {
                function: self.function(it)?,
            }),
            Some(Opcode::ArgumentsAdaptorFrame) => {
                let function = self.function(it)?;
                let height = self.count(it)?;
                Ok(TranslatedFrameKind::ArgumentsAdaptor { function, height })
            }
            Some(Opcode::CompiledStubFrame) => Ok(TranslatedFrameKind::CompiledStub),
            found => Err(ReplayError::Unexpected {
                expected: "a frame",
                found,
            }),
        }
    }

    fn register(&self, it: &mut TranslationIterator) -> Result<u64, ReplayError> {
        let code = self.operand(it)?;
        usize::try_from(code)
            .ok()
            .and_then(|x| self.snap.registers.get(x))
            .copied()
            .ok_or(ReplayError::BadRegister(code))
    }

    fn slot(&self, it: &mut TranslationIterator) -> Result<u64, ReplayError> {
        let slot = self.operand(it)?;
        self.snap
            .slots
            .get(&slot)
            .copied()
            .ok_or(ReplayError::MissingSlot(slot))
    }

    fn value(&mut self, it: &mut TranslationIterator) -> Result<TranslatedValue, ReplayError> {
        // Truncation to the low 32 bits is how untagged integers live in 64-bit locations.
        Ok(match it.next_opcode() {
            Some(Opcode::Register) => TranslatedValue::Tagged(self.register(it)?),
            Some(Opcode::Int32Register) => TranslatedValue::Int32(self.register(it)? as i32),
            Some(Opcode::Uint32Register) => TranslatedValue::Uint32(self.register(it)? as u32),
            Some(Opcode::DoubleRegister) => {
                let code = self.operand(it)?;
                let d = usize::try_from(code)
                    .ok()
                    .and_then(|x| self.snap.doubles.get(x))
                    .ok_or(ReplayError::BadRegister(code))?;
                TranslatedValue::Double(*d)
            }
            Some(Opcode::StackSlot) => TranslatedValue::Tagged(self.slot(it)?),
            Some(Opcode::Int32StackSlot) => TranslatedValue::Int32(self.slot(it)? as i32),
            Some(Opcode::Uint32StackSlot) => TranslatedValue::Uint32(self.slot(it)? as u32),
            Some(Opcode::DoubleStackSlot) => TranslatedValue::Double(f64::from_bits(self.slot(it)?)),
            Some(Opcode::Literal) => {
                let id = self.operand(it)?;
                TranslatedValue::Literal(self.literal(id)?)
            }
            Some(Opcode::DuplicatedObject) => {
                let id = self.operand(it)?;
                match usize::try_from(id) {
                    Ok(x) if x < self.objects => {
                        self.objects += 1;
                        TranslatedValue::Duplicate(x)
                    }
                    _ => return Err(ReplayError::BadDuplicate(id)),
                }
            }
            Some(op @ (Opcode::ArgumentsObject | Opcode::CapturedObject)) => {
                let length = self.count(it)?;
                self.objects += 1;
                let fields = (0..length)
                    .map(|_| self.value(it))
                    .collect::<Result<Vec<_>, _>>()?;
                TranslatedValue::Object {
                    is_arguments: op == Opcode::ArgumentsObject,
                    fields,
                }
            }
            found => {
                return Err(ReplayError::Unexpected {
                    expected: "a value",
                    found,
                })
            }
        })
    }
}
