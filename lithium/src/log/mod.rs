//! The implementation of the `LITHIUM_LOG*` environment variables.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

/// How verbose should the backend's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log code generation events (start, abort, finish of a function).
    CodegenEvent,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        Self::from_spec(env::var("LITHIUM_LOG").ok().as_deref())
    }

    fn from_spec(spec: Option<&str>) -> Result<Self, Box<dyn Error>> {
        let Some(s) = spec else {
            return Ok(Self {
                path: None,
                level: Verbosity::Error,
            });
        };
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            ["-", level] => (None, level),
            [path, level] => {
                let path = PathBuf::from(path);
                // Truncate any previous log so that appends start from an empty file.
                File::create(&path).ok();
                (Some(path), level)
            }
            [level] => (None, level),
            [..] => return Err("LITHIUM_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid LITHIUM_LOG level '{s}': {e}"))?;
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("LITHIUM_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "lithium-error",
                Verbosity::Warning => "lithium-warning",
                Verbosity::CodegenEvent => "lithium-codegen-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => eprintln!("{prefix}: {msg}"),
            }
        }
    }
}

/// Which forms of generated code should be dumped?
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum AsmPhase {
    /// Disassembly with comments.
    Asm,
    /// Disassembly with comments, each instruction prefixed by its address and offset.
    AsmFull,
}

impl AsmPhase {
    fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        match s {
            "asm" => Ok(Self::Asm),
            "asm-full" => Ok(Self::AsmFull),
            _ => Err(format!("Invalid LITHIUM_LOG_ASM value: {s}").into()),
        }
    }
}

mod internals {
    use super::AsmPhase;
    use std::{env, fs::File, io::Write, sync::LazyLock};

    static LOG_ASM: LazyLock<Option<(String, AsmPhase)>> = LazyLock::new(|| {
        let x = env::var("LITHIUM_LOG_ASM").ok()?;
        let (path, phase) = match x.split(':').collect::<Vec<_>>().as_slice() {
            [path, phase] => (*path, *phase),
            [phase] => ("-", *phase),
            _ => panic!("LITHIUM_LOG_ASM must be of the format '[<path>:]<asm|asm-full>'"),
        };
        let phase = AsmPhase::from_str(phase).unwrap();
        if path != "-" {
            File::create(path).ok();
        }
        Some((path.to_string(), phase))
    });

    /// The requested [AsmPhase], if any.
    pub(crate) fn asm_phase() -> Option<AsmPhase> {
        LOG_ASM.as_ref().map(|(_, x)| *x)
    }

    pub(crate) fn log_asm(s: &str) {
        match LOG_ASM.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{asm_phase, log_asm};

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_spec() {
        let l = Log::from_spec(None).unwrap();
        assert_eq!(l.level, Verbosity::Error);
        assert!(l.path.is_none());
        let l = Log::from_spec(Some("3")).unwrap();
        assert_eq!(l.level, Verbosity::CodegenEvent);
        let l = Log::from_spec(Some("-:2")).unwrap();
        assert_eq!(l.level, Verbosity::Warning);
        assert!(l.path.is_none());
        assert!(Log::from_spec(Some("4")).is_err());
        assert!(Log::from_spec(Some("x")).is_err());
        assert!(Log::from_spec(Some("a:b:1")).is_err());
        assert!(AsmPhase::from_str("asm-full").is_ok());
        assert!(AsmPhase::from_str("ir").is_err());
    }

    #[test]
    fn log_to_file() {
        let tf = NamedTempFile::new().unwrap();
        let p = tf.path().to_str().unwrap();
        let l = Log::from_spec(Some(&format!("{p}:2"))).unwrap();
        l.log(Verbosity::Warning, "w");
        l.log(Verbosity::CodegenEvent, "not logged");
        l.log(Verbosity::Error, "e");
        assert_eq!(
            fs::read_to_string(tf.path()).unwrap(),
            "lithium-warning: w\nlithium-error: e\n"
        );
    }
}
