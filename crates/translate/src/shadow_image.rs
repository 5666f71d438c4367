//! The shadow image: one byte array per guest module covering every loadable
//! section, in declaration order, 4-aligned.
//!
//! Word relocations inside data sections are resolved while building the
//! image: words naming guest code become guest addresses (indirect calls
//! dispatch on those through the icaller), words naming external functions
//! become their synthetic import addresses, and words pointing at guest data
//! become data relocations against the image itself when the host pointer
//! width allows a 32-bit slot.

use cranelift_module::{DataDescription, DataId, Linkage, Module};
use cranelift_object::ObjectModule;
use object::elf;

use crate::errors::{TranslationError, TranslationResult};
use crate::guest::{GuestModule, GuestSectionKind};
use crate::libc::{ImportKind, LibcImporter};

pub struct ShadowImage {
    pub data_id: DataId,
    pub size: u32,
}

impl ShadowImage {
    /// Lay out, relocate and define the image global for one guest module.
    pub fn build(
        module: &mut ObjectModule,
        importer: &mut LibcImporter,
        guest: &GuestModule,
        name: &str,
    ) -> TranslationResult<ShadowImage> {
        let mut image = vec![0u8; guest.image_size as usize];
        for sec in &guest.sections {
            let at = sec.shadow_offs as usize;
            assert!(
                at + sec.size as usize <= image.len(),
                "section {} overruns the shadow image",
                sec.name
            );
            if sec.kind != GuestSectionKind::Bss {
                image[at..at + sec.data.len()].copy_from_slice(&sec.data);
            }
        }

        let data_id = module.declare_data(name, Linkage::Export, true, false)?;
        let mut desc = DataDescription::new();
        let ptr32 = module.isa().pointer_bytes() == 4;

        // Resolve word relocations in the data sections.
        for sec in guest.sections.iter().filter(|s| !s.is_text()) {
            for rel in &sec.relocs {
                if rel.rtype != elf::R_RISCV_32 {
                    return Err(TranslationError::UnknownRelocationType {
                        rtype: rel.rtype,
                        addr: rel.offset,
                    });
                }
                let sym = &guest.symbols[rel.sym];
                let at = (sec.shadow_offs + rel.offset) as usize;
                if sym.is_external() {
                    let import = importer.import(module, &sym.name, sym.kind)?;
                    if import.kind == ImportKind::Func {
                        let val = (import.ext_addr as i64 + rel.addend) as u32;
                        image[at..at + 4].copy_from_slice(&val.to_le_bytes());
                        continue;
                    }
                    log::warn!(
                        "unrelocated external data word for {} at {:#x}",
                        sym.name,
                        rel.offset
                    );
                    continue;
                }
                let target_sec = &guest.sections[sym.section.expect("defined symbol")];
                if target_sec.is_text() {
                    let val = (sym.addr as i64 + rel.addend) as u32;
                    image[at..at + 4].copy_from_slice(&val.to_le_bytes());
                } else if ptr32 {
                    let target = target_sec.shadow_offs as i64 + sym.addr as i64 + rel.addend;
                    let gv = module.declare_data_in_data(data_id, &mut desc);
                    desc.write_data_addr(at as u32, gv, target);
                } else {
                    // a 4-byte host pointer does not fit on this target
                    log::warn!(
                        "cannot relocate 32-bit data pointer to {} at {:#x} on a 64-bit host",
                        sym.name,
                        rel.offset
                    );
                }
            }
        }

        desc.define(image.into_boxed_slice());
        desc.set_align(8);
        module.define_data(data_id, &desc)?;

        log::info!(
            "shadow image {} covers {} sections, {} bytes",
            name,
            guest.sections.len(),
            guest.image_size
        );
        Ok(ShadowImage {
            data_id,
            size: guest.image_size,
        })
    }
}
