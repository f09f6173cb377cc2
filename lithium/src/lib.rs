//! Lithium: the last stage of an optimising compiler. It lowers a register-allocated low-level IR
//! ("LIR") into x64 machine code and records the metadata a managed runtime needs to run that
//! code: safepoint tables for the garbage collector and translations for deoptimisation.

#![allow(clippy::comparison_chain)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]

pub mod compile;
pub mod config;
pub mod deopt;
pub mod heap;
pub mod lir;
mod log;
pub mod runtime;
pub mod safepoint;

pub use compile::{
    codegen_with_config, default_codegen, BailoutReason, CodeGen, CodeObject, CompilationError,
};
pub use config::CodegenConfig;
