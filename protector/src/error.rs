use std::{fmt, io};

/// Errors that abort a protection run.
#[derive(Debug)]
pub enum ProtectError {
    /// The host image could not be parsed or is missing a required piece.
    InvalidHostPe(String),
    /// A section the pipeline depends on is absent.
    MissingSection(&'static str),
    /// The interpreter sidecar is unreadable, malformed or incomplete.
    InvalidInterpreter(String),
    /// The interpreter sidecar does not export a required symbol.
    MissingExport(&'static str),
    /// A virtualizable instruction changes flags the interpreter cannot
    /// reproduce; refusing to emit a silently broken binary.
    UnsupportedInstruction(u64),
    /// A fixup carries a value size other than 4 or 8 bytes.
    UnsupportedFixupSize(u8),
    /// A named shellcode slot was referenced but never emitted.
    UnknownShellcodeVariable(&'static str),
    Pe(exe::Error),
    Io(io::Error),
    PKBuffer(exe::PKError),
}

impl fmt::Display for ProtectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectError::InvalidHostPe(what) => {
                write!(f, "invalid host executable: {}", what)
            }
            ProtectError::MissingSection(name) => {
                write!(f, "section '{}' was not found", name)
            }
            ProtectError::InvalidInterpreter(what) => {
                write!(f, "invalid interpreter sidecar: {}", what)
            }
            ProtectError::MissingExport(name) => {
                write!(f, "interpreter does not export '{}'", name)
            }
            ProtectError::UnsupportedInstruction(address) => {
                write!(
                    f,
                    "instruction at 0x{:08X} changes eflags and cannot be virtualized",
                    address
                )
            }
            ProtectError::UnsupportedFixupSize(size) => {
                write!(f, "unsupported fixup size: {}", size)
            }
            ProtectError::UnknownShellcodeVariable(name) => {
                write!(f, "unknown shellcode variable '{}'", name)
            }
            ProtectError::Pe(e) => write!(f, "pe error: {:?}", e),
            ProtectError::Io(e) => write!(f, "io error: {}", e),
            ProtectError::PKBuffer(e) => write!(f, "pe buffer error: {:?}", e),
        }
    }
}

impl std::error::Error for ProtectError {}

impl From<exe::Error> for ProtectError {
    fn from(e: exe::Error) -> Self {
        ProtectError::Pe(e)
    }
}

impl From<io::Error> for ProtectError {
    fn from(e: io::Error) -> Self {
        ProtectError::Io(e)
    }
}

impl From<exe::PKError> for ProtectError {
    fn from(e: exe::PKError) -> Self {
        ProtectError::PKBuffer(e)
    }
}
