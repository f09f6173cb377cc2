//! Deoptimisation environments.
//!
//! An [Environment] describes one unoptimised frame's live values at an instruction. Inlined
//! calls produce chains of environments linked by `outer`. Environments live in an [EnvArena] and
//! refer to each other by [EnvIdx]: an environment only ever points at its (older) outer
//! environment, never at its inner ones.

use super::{BailoutId, Operand};
use crate::heap::Handle;
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::ops::Index;

index_vec::define_index_type! {
    pub struct EnvIdx = u32;
}

/// The kind of unoptimised frame an environment reconstructs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameType {
    JsFunction,
    JsConstruct,
    JsGetter,
    JsSetter,
    ArgumentsAdaptor,
    Stub,
}

/// How a live value is represented in the optimised frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueTag {
    Tagged,
    Int32,
    Uint32,
    Double,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EnvValue {
    Operand(Operand, ValueTag),
    /// Stands for a captured (dematerialised) object: the next entry in the environment's object
    /// list says how to rebuild it.
    MaterializationMarker,
}

/// How to rebuild one captured object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectMapping {
    /// A fresh object with `length` fields, taken in order from the environment's dematerialised
    /// values.
    New { length: usize, is_arguments: bool },
    /// The same object as the `of`th captured object of this environment.
    Duplicate { of: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Environment {
    pub closure: Handle,
    pub frame_type: FrameType,
    pub ast_id: BailoutId,
    pub parameter_count: usize,
    pub arguments_stack_height: usize,
    values: Vec<EnvValue>,
    objects: Vec<ObjectMapping>,
    dematerialized: Vec<EnvValue>,
    outer: Option<EnvIdx>,
}

impl Environment {
    pub fn new(
        closure: Handle,
        frame_type: FrameType,
        ast_id: BailoutId,
        parameter_count: usize,
        outer: Option<EnvIdx>,
    ) -> Self {
        Self {
            closure,
            frame_type,
            ast_id,
            parameter_count,
            arguments_stack_height: 0,
            values: Vec::new(),
            objects: Vec::new(),
            dematerialized: Vec::new(),
            outer,
        }
    }

    /// Append a frame value (a parameter, local, or expression stack entry).
    pub fn push_value(&mut self, op: Operand, tag: ValueTag) -> &mut Self {
        self.values.push(EnvValue::Operand(op, tag));
        self
    }

    /// Append a frame value that is a captured object. Follow with [Self::push_object] or
    /// [Self::push_duplicate].
    pub fn push_marker(&mut self) -> &mut Self {
        self.values.push(EnvValue::MaterializationMarker);
        self
    }

    /// Describe the next captured object. `fields` may themselves contain markers, whose objects
    /// must be described after this one, in the order the markers appear.
    pub fn push_object(&mut self, is_arguments: bool, fields: &[EnvValue]) -> &mut Self {
        self.objects.push(ObjectMapping::New {
            length: fields.len(),
            is_arguments,
        });
        self.dematerialized.extend_from_slice(fields);
        self
    }

    /// Describe the next captured object as a repeat of captured object `of`.
    pub fn push_duplicate(&mut self, of: usize) -> &mut Self {
        assert!(of < self.objects.len());
        self.objects.push(ObjectMapping::Duplicate { of });
        self
    }

    /// The number of frame values, not counting dematerialised fields.
    pub fn translation_size(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[EnvValue] {
        &self.values
    }

    /// Value `idx`, where indices past the frame values address dematerialised fields.
    pub fn value_at(&self, idx: usize) -> EnvValue {
        match self.values.get(idx) {
            Some(x) => *x,
            None => self.dematerialized[idx - self.values.len()],
        }
    }

    pub fn object_mapping(&self, idx: usize) -> ObjectMapping {
        self.objects[idx]
    }

    pub fn outer(&self) -> Option<EnvIdx> {
        self.outer
    }

    /// The unoptimised frame's height: its values minus its parameters (and receiver).
    pub fn height(&self) -> usize {
        self.translation_size() - self.parameter_count
    }
}

/// Owns every environment of a chunk.
#[derive(Clone, Debug, Default)]
pub struct EnvArena {
    envs: IndexVec<EnvIdx, Environment>,
}

impl EnvArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, env: Environment) -> EnvIdx {
        if let Some(outer) = env.outer {
            assert!(outer < self.envs.len_idx());
        }
        self.envs.push(env)
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    pub fn get_mut(&mut self, idx: EnvIdx) -> &mut Environment {
        &mut self.envs[idx]
    }

    /// The chain ending at `idx`, outermost first.
    pub fn chain(&self, idx: EnvIdx) -> SmallVec<[EnvIdx; 4]> {
        let mut chain = SmallVec::new();
        let mut cur = Some(idx);
        while let Some(x) = cur {
            chain.push(x);
            cur = self.envs[x].outer;
        }
        chain.reverse();
        chain
    }
}

impl Index<EnvIdx> for EnvArena {
    type Output = Environment;

    fn index(&self, idx: EnvIdx) -> &Self::Output {
        &self.envs[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_order() {
        let mut a = EnvArena::new();
        let outer = a.push(Environment::new(Handle(1), FrameType::JsFunction, 3, 1, None));
        let mid = a.push(Environment::new(
            Handle(2),
            FrameType::ArgumentsAdaptor,
            -1,
            2,
            Some(outer),
        ));
        let inner = a.push(Environment::new(Handle(3), FrameType::JsFunction, 7, 1, Some(mid)));
        assert_eq!(a.chain(inner).as_slice(), &[outer, mid, inner]);
        assert_eq!(a.chain(outer).as_slice(), &[outer]);
    }

    #[test]
    fn dematerialized_values_follow_frame_values() {
        let mut e = Environment::new(Handle(1), FrameType::JsFunction, 0, 1, None);
        e.push_value(Operand::StackSlot(-2), ValueTag::Tagged)
            .push_marker()
            .push_object(
                true,
                &[
                    EnvValue::Operand(Operand::Register(0), ValueTag::Tagged),
                    EnvValue::Operand(Operand::Register(1), ValueTag::Int32),
                ],
            )
            .push_value(Operand::DoubleRegister(0), ValueTag::Double);
        assert_eq!(e.translation_size(), 3);
        assert_eq!(e.height(), 2);
        assert_eq!(
            e.value_at(4),
            EnvValue::Operand(Operand::Register(1), ValueTag::Int32)
        );
        assert_eq!(
            e.object_mapping(0),
            ObjectMapping::New {
                length: 2,
                is_arguments: true
            }
        );
    }
}
