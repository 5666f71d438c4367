//! The relocation cursor: a stateful iterator over one section's sorted
//! relocation list, producing the symbolic value that replaces a guest
//! immediate.
//!
//! Some relocations apply to two consecutive instructions (`R_RISCV_CALL`
//! covers an `auipc`+`jalr` pair); the cursor keeps a pending-next address
//! for the LO half and remembers the last resolved symbol so a
//! `R_RISCV_PCREL_LO12_I` can pair with its HI20.

use object::elf;

use crate::constants::{HI20_MASK, INSTRUCTION_SIZE, INVALID_ADDR, LO12_MASK};
use crate::context::Context;
use crate::errors::{TranslationError, TranslationResult};
use crate::guest::{GuestModule, GuestReloc};
use crate::libc::ImportKind;

/// What a consumed relocation resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocTarget {
    /// An imported external function at a synthetic address.
    ExtFunc { addr: u32 },
    /// An imported external data object, addressed through its runtime
    /// mirror global.
    ExtData { data: cranelift_module::DataId },
    /// A guest function at a guest code address.
    Func { addr: u32 },
    /// Guest data at a byte offset inside the shadow image.
    Data { offs: u32 },
}

/// The value replacing a guest immediate.
#[derive(Clone, Copy, Debug)]
pub struct RelocValue {
    pub target: RelocTarget,
    /// `LO12_MASK` or `HI20_MASK`, already selected by the relocation type.
    pub mask: u32,
}

impl RelocValue {
    pub fn is_lo(&self) -> bool {
        self.mask == LO12_MASK
    }
}

pub struct RelocationCursor {
    relocs: Vec<GuestReloc>,
    ri: usize,
    rlast: usize,
    /// Address of the pending LO half of a two-instruction relocation.
    next: u32,
    /// Last resolved target, consulted by `R_RISCV_PCREL_LO12_I`.
    last: Option<RelocTarget>,
}

impl RelocationCursor {
    pub fn new(relocs: Vec<GuestReloc>) -> Self {
        RelocationCursor {
            relocs,
            ri: 0,
            rlast: 0,
            next: INVALID_ADDR,
            last: None,
        }
    }

    /// A cursor positioned at the first relocation at or after `addr`, for
    /// eagerly re-translated ranges.
    pub fn at(relocs: Vec<GuestReloc>, addr: u32) -> Self {
        let ri = relocs.partition_point(|r| r.offset < addr);
        RelocationCursor {
            relocs,
            ri,
            rlast: ri,
            next: INVALID_ADDR,
            last: None,
        }
    }

    /// Advance past every relocation sharing the consumed address.
    fn advance(&mut self, addr: u32, had_next: bool) {
        self.rlast = self.ri;
        let reladdr = if had_next {
            addr - INSTRUCTION_SIZE
        } else {
            addr
        };
        loop {
            self.ri += 1;
            if self.ri >= self.relocs.len() || self.relocs[self.ri].offset != reladdr {
                break;
            }
        }
    }

    /// Resolve the relocation applying to the instruction at `addr`, if any.
    pub fn handle(
        &mut self,
        addr: u32,
        ctx: &mut Context,
        guest: &GuestModule,
    ) -> TranslationResult<Option<RelocValue>> {
        let had_next = self.next != INVALID_ADDR;
        let rel;
        if had_next {
            if addr != self.next {
                return Err(TranslationError::UnexpectedRelocation { addr });
            }
            self.next = INVALID_ADDR;
            rel = self.relocs[self.ri];
        } else {
            // Relocations left behind at padding addresses are harmless for
            // the skippable types; anything else means the cursor fell out
            // of ascending order.
            while self.ri < self.relocs.len() && self.relocs[self.ri].offset < addr {
                let stale = self.relocs[self.ri];
                if !matches!(stale.rtype, elf::R_RISCV_ALIGN | elf::R_RISCV_BRANCH) {
                    return Err(TranslationError::UnexpectedRelocation { addr: stale.offset });
                }
                self.ri += 1;
            }
            if self.ri >= self.relocs.len() {
                return Ok(None);
            }
            rel = self.relocs[self.ri];
            if rel.offset != addr {
                return Ok(None);
            }
        }

        let mut is_lo = false;
        let mut is_next_too = false;
        let mut from_last = false;
        match rel.rtype {
            elf::R_RISCV_CALL | elf::R_RISCV_CALL_PLT => {
                if had_next {
                    is_lo = true;
                } else {
                    is_next_too = true;
                }
            }
            elf::R_RISCV_PCREL_HI20 | elf::R_RISCV_HI20 => {}
            elf::R_RISCV_PCREL_LO12_I => {
                is_lo = true;
                from_last = true;
            }
            elf::R_RISCV_LO12_I => is_lo = true,
            elf::R_RISCV_ALIGN | elf::R_RISCV_BRANCH => {
                self.advance(addr, had_next);
                self.last = None;
                return Ok(None);
            }
            rtype => {
                return Err(TranslationError::UnknownRelocationType { rtype, addr });
            }
        }

        let target = if from_last {
            // symbol info lives on the paired HI20 relocation
            match self.last {
                Some(t) => t,
                None => return Err(TranslationError::UnexpectedRelocation { addr }),
            }
        } else {
            self.resolve(rel, ctx, guest)?
        };

        if is_next_too {
            self.next = addr + INSTRUCTION_SIZE;
        } else {
            self.advance(addr, had_next);
        }
        self.last = Some(target);

        let mask = if is_lo { LO12_MASK } else { HI20_MASK };
        log::debug!("reloc at {addr:#x}: {target:?} mask {mask:#x}");
        Ok(Some(RelocValue { target, mask }))
    }

    fn resolve(
        &self,
        rel: GuestReloc,
        ctx: &mut Context,
        guest: &GuestModule,
    ) -> TranslationResult<RelocTarget> {
        let sym = &guest.symbols[rel.sym];
        if sym.is_external() {
            let import = ctx.importer.import(&mut ctx.module, &sym.name, sym.kind)?;
            return Ok(match import.kind {
                ImportKind::Func => RelocTarget::ExtFunc {
                    addr: import.ext_addr,
                },
                ImportKind::Data => RelocTarget::ExtData {
                    data: import.data.expect("data import carries a DataId"),
                },
            });
        }

        let sec_idx = sym
            .section
            .expect("defined symbol without section in relocation");
        let sec = &guest.sections[sec_idx];
        if sec.is_text() {
            Ok(RelocTarget::Func {
                addr: (sym.addr as i64 + rel.addend) as u32,
            })
        } else {
            if ctx.opts.sym_bounds_check && sym.addr >= sec.size {
                return Err(TranslationError::OutOfBoundsRelocation {
                    sym: sym.name.clone(),
                    addr: sym.addr,
                    size: sec.size,
                });
            }
            Ok(RelocTarget::Data {
                offs: (sec.shadow_offs as i64 + sym.addr as i64 + rel.addend) as u32,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(offset: u32, rtype: u32, sym: usize) -> GuestReloc {
        GuestReloc {
            offset,
            rtype,
            sym,
            addend: 0,
        }
    }

    #[test]
    fn cursor_positions_at_address() {
        let c = RelocationCursor::at(
            vec![r(0, elf::R_RISCV_HI20, 0), r(8, elf::R_RISCV_LO12_I, 0)],
            4,
        );
        assert_eq!(c.ri, 1);
    }

    #[test]
    fn advance_skips_shared_offsets() {
        let mut c = RelocationCursor::new(vec![
            r(0, elf::R_RISCV_CALL, 0),
            r(0, 51, 0), // a paired entry at the same offset
            r(8, elf::R_RISCV_HI20, 0),
        ]);
        c.advance(0, false);
        assert_eq!(c.ri, 2);
        assert_eq!(c.rlast, 0);
    }

}
