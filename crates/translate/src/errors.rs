//! The error taxonomy of the translator.
//!
//! Every user-visible failure is an explicit error value; internal invariant
//! violations (a basic block missing from the map, an empty block map after
//! translation, a module without `.text`) are bugs and panic instead.

use std::path::PathBuf;

use thiserror::Error;

/// A convenient alias for the result of a translation operation.
pub type TranslationResult<T> = Result<T, TranslationError>;

/// Errors surfaced while translating guest objects.
///
/// Any of these aborts the current translation immediately; no partial output
/// is ever written.
#[derive(Debug, Error)]
pub enum TranslationError {
    /// The decoder rejected an instruction word.
    #[error("invalid instruction encoding at address {addr:#010x}: {raw:#010x}")]
    InvalidInstructionEncoding { addr: u32, raw: u32 },

    /// An ELF relocation type outside the supported subset.
    #[error("unknown relocation type {rtype} at address {addr:#010x}")]
    UnknownRelocationType { rtype: u32, addr: u32 },

    /// A HI/LO relocation pair was broken, or the cursor observed
    /// relocations out of ascending offset order.
    #[error("unexpected relocation at address {addr:#010x}")]
    UnexpectedRelocation { addr: u32 },

    /// An external symbol is not provided by the libc import table.
    #[error("function not found: {name}")]
    FunctionNotFound { name: String },

    /// A data relocation points past the end of its section.
    #[error("out of bounds relocation: symbol {sym} at {addr:#010x} in section of {size:#x} bytes")]
    OutOfBoundsRelocation { sym: String, addr: u32, size: u32 },

    /// A non-zero word inside a zero-padding tail of a text section.
    #[error("non-zero byte in padding at address {addr:#010x}")]
    NonZeroByteInPadding { addr: u32 },

    /// Reading an input file failed.
    #[error("cannot read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    /// The input is not a relocatable RV32 little-endian ELF object.
    #[error("bad object file {}: {msg}", .path.display())]
    BadObject { path: PathBuf, msg: String },

    /// The emitted IR failed structural verification.
    #[error("emitted IR for {func} failed verification: {detail}")]
    Verification { func: String, detail: String },

    /// Mutually incompatible options were requested.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An instruction the decoder accepts but the translator cannot lower
    /// under the current options.
    #[error("unsupported instruction at {addr:#010x}: {what}")]
    Unsupported { addr: u32, what: String },

    /// A CSR access outside the supported read-only set.
    #[error("unsupported CSR access at {addr:#010x}: csr {csr:#05x}")]
    UnsupportedCsr { addr: u32, csr: u16 },

    /// An indirect jump site was found but no address-taken labels were
    /// registered for the function.
    #[error("indirect jump at {addr:#010x} in {func} has no registered targets")]
    EmptyIndirectTargetSet { addr: u32, func: String },

    /// Failure bubbled up from the Cranelift module layer.
    #[error("module error")]
    Module(#[from] cranelift_module::ModuleError),

    /// Failure while emitting the final object file.
    #[error("object emission failed: {0}")]
    Emit(String),
}
