//! Translation options.

use std::path::PathBuf;

use crate::constants::DEFAULT_STACK_SIZE;
use crate::errors::{TranslationError, TranslationResult};

/// How guest registers are materialised in the emitted IR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegMode {
    /// Every guest register is a module-scope mutable variable.
    Globals,
    /// Per-function slots, loaded from the globals at entry and written
    /// back at exit.
    Locals,
    /// Like `Locals`, but only the ABI subsets are synchronised at call
    /// boundaries.
    Abi,
}

impl RegMode {
    /// Whether this mode keeps per-function register slots.
    pub fn local_regs(self) -> bool {
        !matches!(self, RegMode::Globals)
    }
}

impl std::str::FromStr for RegMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "globals" => Ok(RegMode::Globals),
            "locals" => Ok(RegMode::Locals),
            "abi" => Ok(RegMode::Abi),
            _ => Err(format!("unknown register mode `{s}`")),
        }
    }
}

/// Knobs controlling a translation run.
#[derive(Clone, Debug)]
pub struct Options {
    pub regs: RegMode,
    pub stack_size: u32,
    /// Emit a diagnostic `printf` in the icaller default case.
    pub use_libc: bool,
    /// Address-to-source sidecar file.
    pub a2s: Option<PathBuf>,
    /// Disable icaller generation (and reject guest indirect calls).
    pub hard_float_abi: bool,
    /// Route repeated loads from fixed `sp` offsets through dedicated slots.
    pub opt_stack: bool,
    /// Check that data relocations stay inside their section.
    pub sym_bounds_check: bool,
    /// Model `fflags`/`frm`/`fcsr` accesses on the `rv_fcsr` global.
    pub enable_fcsr: bool,
    /// Guard float-to-int conversions with explicit validity checks.
    pub enable_fcvt_validation: bool,
    /// Synchronise local registers with the globals around external calls.
    pub sync_on_external_calls: bool,
    /// Include the F registers in register synchronisation.
    pub sync_fregs: bool,
    /// Restrict icaller external dispatch to integer-only signatures.
    pub icall_int_only: bool,
    /// Log the guest assembly rendition of every translated instruction.
    pub commented_asm: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            regs: RegMode::Globals,
            stack_size: DEFAULT_STACK_SIZE,
            use_libc: false,
            a2s: None,
            hard_float_abi: false,
            opt_stack: false,
            sym_bounds_check: false,
            enable_fcsr: false,
            enable_fcvt_validation: false,
            sync_on_external_calls: false,
            sync_fregs: false,
            icall_int_only: false,
            commented_asm: false,
        }
    }
}

impl Options {
    /// Reject option combinations with no defined behaviour.
    pub fn validate(&self) -> TranslationResult<()> {
        if self.hard_float_abi && self.regs.local_regs() {
            return Err(TranslationError::Config(format!(
                "--hard-float-abi requires --regs globals, not {:?}",
                self.regs
            )));
        }
        if self.hard_float_abi && self.sync_fregs {
            return Err(TranslationError::Config(
                "--sync-fregs has no effect with --hard-float-abi".into(),
            ));
        }
        if self.stack_size == 0 || self.stack_size % 16 != 0 {
            return Err(TranslationError::Config(format!(
                "stack size must be a non-zero multiple of 16, got {}",
                self.stack_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn hard_float_abi_rejects_local_regs() {
        let opts = Options {
            hard_float_abi: true,
            regs: RegMode::Locals,
            ..Options::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(TranslationError::Config(_))
        ));
    }

    #[test]
    fn stack_size_must_be_aligned() {
        let opts = Options {
            stack_size: 100,
            ..Options::default()
        };
        assert!(opts.validate().is_err());
    }
}
