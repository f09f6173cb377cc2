//! Turning a [Chunk] into machine code.

use crate::{
    config::CodegenConfig,
    deopt::DeoptimizationData,
    heap::Handle,
    lir::Chunk,
    runtime::Runtime,
};
use indexmap::IndexMap;
use std::error::Error;
use strum::Display;
use thiserror::Error;

pub(crate) mod x64;

/// A failure to generate code for a chunk.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Code generation failed for reasons that might interest someone driving the compiler but
    /// not the end user.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong that is probably the result of a bug in the backend.
    InternalError(String),
    #[error("Internal error: {0}")]
    /// A limit was exceeded (e.g. a frame too big to address).
    LimitExceeded(String),
    #[error("Internal error: {0:}")]
    /// An external resource was exhausted.
    ResourceExhausted(Box<dyn Error>),
    #[error("Aborted: {0}")]
    /// Code generation hit a case it can't handle. The chunk should be run unoptimised.
    Aborted(BailoutReason),
}

/// Why a code generation pass gave up.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum BailoutReason {
    #[strum(to_string = "bailout was not prepared")]
    BailoutWasNotPrepared,
    #[strum(to_string = "unsupported double immediate")]
    UnsupportedDoubleImmediate,
    #[strum(to_string = "too many spill slots")]
    TooManySpillSlots,
    #[strum(to_string = "array index constant value too big")]
    ArrayIndexConstantValueTooBig,
}

/// The trait every code generator backend implements.
pub trait CodeGen {
    /// Generate code for `chunk`. The chunk is only read.
    fn codegen(&self, chunk: &Chunk, rt: &dyn Runtime) -> Result<CodeObject, CompilationError>;
}

/// The code generator for the host architecture.
pub fn default_codegen() -> Result<Box<dyn CodeGen>, Box<dyn Error>> {
    #[cfg(target_arch = "x86_64")]
    return Ok(Box::new(x64::X64CodeGen::new()?));

    #[allow(unreachable_code)]
    Err("No code generator supported on this platform".into())
}

/// The code generator for the host architecture, with an explicit policy instead of one read
/// from the environment.
pub fn codegen_with_config(config: CodegenConfig) -> Result<Box<dyn CodeGen>, Box<dyn Error>> {
    #[cfg(target_arch = "x86_64")]
    return Ok(Box::new(x64::X64CodeGen::with_config(config)?));

    #[allow(unreachable_code)]
    Err("No code generator supported on this platform".into())
}

/// Finished code plus the metadata the runtime needs to run it.
#[derive(Debug)]
pub struct CodeObject {
    /// Instructions followed by the safepoint table.
    pub(crate) code: Vec<u8>,
    /// The length of the instruction part of `code`.
    pub(crate) instruction_size: usize,
    pub(crate) stack_slots: usize,
    pub(crate) safepoint_table_offset: Option<usize>,
    pub(crate) deopt_data: DeoptimizationData,
    /// Objects embedded in the code that must not keep it alive.
    pub(crate) weak_objects: Vec<Handle>,
    pub(crate) prologue_offset: usize,
    /// Code ranges in which no frame is set up.
    pub(crate) no_frame_ranges: Vec<(usize, usize)>,
    /// Maps code offsets to comments.
    pub(crate) comments: IndexMap<usize, Vec<String>>,
    /// `(code offset, source position)` pairs in code order.
    pub(crate) source_positions: Vec<(usize, u32)>,
}

impl CodeObject {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn instructions(&self) -> &[u8] {
        &self.code[..self.instruction_size]
    }

    pub fn stack_slots(&self) -> usize {
        self.stack_slots
    }

    /// The offset of the safepoint table in [Self::code]. Stubs that never build a frame have
    /// none.
    pub fn safepoint_table_offset(&self) -> Option<usize> {
        self.safepoint_table_offset
    }

    pub fn safepoint_table(&self) -> Option<Result<lsmp::SafepointTable, lsmp::ParseError>> {
        self.safepoint_table_offset
            .map(|off| lsmp::SafepointTable::parse(&self.code[off..]))
    }

    pub fn deoptimization_data(&self) -> &DeoptimizationData {
        &self.deopt_data
    }

    pub fn weak_objects(&self) -> &[Handle] {
        &self.weak_objects
    }

    pub fn prologue_offset(&self) -> usize {
        self.prologue_offset
    }

    pub fn no_frame_ranges(&self) -> &[(usize, usize)] {
        &self.no_frame_ranges
    }

    pub fn source_positions(&self) -> &[(usize, u32)] {
        &self.source_positions
    }

    /// Disassemble the instructions, interleaved with codegen comments, for testing and
    /// debugging.
    pub fn disassemble(&self, with_addrs: bool) -> Result<String, Box<dyn Error>> {
        x64::AsmPrinter::new(self.instructions(), &self.comments, with_addrs).to_string()
    }
}
