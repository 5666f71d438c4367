//! The guest register file.
//!
//! Thirty-two X registers (`x0` reads as constant zero, writes to it are
//! discarded), thirty-two 64-bit F registers and `fcsr`. In `Globals` mode
//! every access goes straight to the module-scope variables; in `Locals` and
//! `Abi` modes each function keeps stack slots that are synchronised with
//! the globals at the boundaries selected by [`SyncFlags`].

use bitflags::bitflags;
use cranelift_codegen::ir;

use crate::options::RegMode;

pub const ZERO: u8 = 0;
pub const RA: u8 = 1;
pub const SP: u8 = 2;
pub const T0: u8 = 5;
pub const A0: u8 = 10;
pub const A1: u8 = 11;
pub const A7: u8 = 17;

bitflags! {
    /// Which register subsets a synchronisation point covers. Flags compose
    /// by union.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        const CALL          = 0x01;
        const CALL_RETURNED = 0x02;
        const FUNC_START    = 0x04;
        const FUNC_RETURN   = 0x08;
        const LOAD          = 0x10;
        const ABI           = 0x20;
        const RET_REGS_ONLY = 0x40;
        const XREG          = 0x80;
    }
}

/// Direction of a synchronisation: local slots <- globals, or the reverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    Load,
    Store,
}

/// Per-register bookkeeping.
#[derive(Default)]
pub struct RegState {
    pub slot: Option<ir::StackSlot>,
    /// Body reads; synchronisation traffic is not counted.
    pub reads: u32,
    /// Body writes.
    pub writes: u32,
    /// Written since the last store-sync.
    pub dirty: bool,
    /// Loads/stores emitted by synchronisation, removable by `clean_regs`.
    pub sync_insts: Vec<ir::Inst>,
}

impl RegState {
    pub fn touched(&self) -> bool {
        self.reads > 0 || self.writes > 0
    }
}

pub struct RegisterFile {
    pub mode: RegMode,
    pub x: [RegState; 32],
    pub f: [RegState; 32],
}

impl RegisterFile {
    pub fn new(mode: RegMode) -> Self {
        RegisterFile {
            mode,
            x: std::array::from_fn(|_| RegState::default()),
            f: std::array::from_fn(|_| RegState::default()),
        }
    }

    pub fn local(&self) -> bool {
        self.mode.local_regs()
    }

    /// The X registers covered by a synchronisation with the given flags.
    pub fn x_sync_set(&self, flags: SyncFlags) -> Vec<u8> {
        if self.mode == RegMode::Globals {
            return Vec::new();
        }
        if flags.contains(SyncFlags::RET_REGS_ONLY) {
            return vec![A0, A1];
        }
        match self.mode {
            RegMode::Locals => (1..32).collect(),
            RegMode::Abi => abi_x_set(flags),
            RegMode::Globals => unreachable!(),
        }
    }

    /// The F registers covered by a synchronisation with the given flags.
    pub fn f_sync_set(&self, flags: SyncFlags, sync_fregs: bool) -> Vec<u8> {
        if self.mode == RegMode::Globals || !sync_fregs || flags.contains(SyncFlags::XREG) {
            return Vec::new();
        }
        if flags.contains(SyncFlags::RET_REGS_ONLY) {
            return vec![A0, A1];
        }
        match self.mode {
            RegMode::Locals => (0..32).collect(),
            RegMode::Abi => abi_f_set(flags),
            RegMode::Globals => unreachable!(),
        }
    }
}

/// ABI-mode X subsets: arguments and saved registers flow in at function
/// start and around calls, return registers flow back.
fn abi_x_set(flags: SyncFlags) -> Vec<u8> {
    let saved = || (18..28).chain([8u8, 9]).collect::<Vec<_>>();
    let args = || (A0..=A7).collect::<Vec<_>>();
    if flags.contains(SyncFlags::FUNC_START) {
        let mut v = vec![RA, SP];
        v.extend(saved());
        v.extend(args());
        v
    } else if flags.contains(SyncFlags::FUNC_RETURN) {
        let mut v = vec![SP, A0, A1];
        v.extend(saved());
        v
    } else if flags.contains(SyncFlags::CALL) {
        let mut v = vec![SP];
        v.extend(saved());
        v.extend(args());
        v
    } else if flags.contains(SyncFlags::CALL_RETURNED) {
        vec![A0, A1]
    } else {
        Vec::new()
    }
}

fn abi_f_set(flags: SyncFlags) -> Vec<u8> {
    let saved = || (18..28).chain([8u8, 9]).collect::<Vec<_>>();
    let args = || (A0..=A7).collect::<Vec<_>>();
    if flags.contains(SyncFlags::FUNC_START) || flags.contains(SyncFlags::CALL) {
        let mut v = saved();
        v.extend(args());
        v
    } else if flags.contains(SyncFlags::FUNC_RETURN) {
        let mut v = vec![A0, A1];
        v.extend(saved());
        v
    } else if flags.contains(SyncFlags::CALL_RETURNED) {
        vec![A0, A1]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_mode_never_syncs() {
        let rf = RegisterFile::new(RegMode::Globals);
        assert!(rf.x_sync_set(SyncFlags::FUNC_START).is_empty());
    }

    #[test]
    fn locals_mode_syncs_everything() {
        let rf = RegisterFile::new(RegMode::Locals);
        let set = rf.x_sync_set(SyncFlags::FUNC_START);
        assert_eq!(set.len(), 31);
        assert!(!set.contains(&ZERO));
    }

    #[test]
    fn abi_mode_syncs_subsets() {
        let rf = RegisterFile::new(RegMode::Abi);
        let start = rf.x_sync_set(SyncFlags::FUNC_START);
        assert!(start.contains(&RA));
        assert!(start.contains(&SP));
        assert!(start.contains(&A0));
        assert!(!start.contains(&T0));
        let ret = rf.x_sync_set(SyncFlags::CALL_RETURNED);
        assert_eq!(ret, vec![A0, A1]);
    }

    #[test]
    fn ret_regs_only_overrides() {
        let rf = RegisterFile::new(RegMode::Locals);
        let set = rf.x_sync_set(SyncFlags::FUNC_RETURN | SyncFlags::RET_REGS_ONLY);
        assert_eq!(set, vec![A0, A1]);
    }
}
