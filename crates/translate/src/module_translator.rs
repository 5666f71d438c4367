//! Translation skeleton that walks guest object files and drives every
//! section, symbol and function through the translation pipeline, then
//! finishes the output module.

use std::path::Path;
use std::rc::Rc;

use crate::context::{Context, FuncInfo};
use crate::errors::{TranslationError, TranslationResult};
use crate::func_translator::FuncTranslator;
use crate::guest::GuestModule;
use crate::icaller::{generate_icaller, generate_is_external};
use crate::options::Options;
use crate::relocation::RelocationCursor;
use crate::shadow_image::ShadowImage;
use crate::syscall;

pub struct Translator {
    ctx: Context,
    modules_translated: usize,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("modules_translated", &self.modules_translated)
            .finish_non_exhaustive()
    }
}

impl Translator {
    /// Build a session: host ISA, output module, register file globals,
    /// guest stack and the syscall handler.
    pub fn new(opts: Options) -> TranslationResult<Translator> {
        let mut ctx = Context::new(opts)?;
        syscall::generate(&mut ctx)?;
        Ok(Translator {
            ctx,
            modules_translated: 0,
        })
    }

    /// Translate one guest object file.
    pub fn translate_file(&mut self, path: &Path) -> TranslationResult<()> {
        let bytes = std::fs::read(path).map_err(|cause| TranslationError::Io {
            path: path.to_path_buf(),
            cause,
        })?;
        self.translate_bytes(path, &bytes)
    }

    /// Translate one guest object already loaded into memory.
    pub fn translate_bytes(&mut self, path: &Path, bytes: &[u8]) -> TranslationResult<()> {
        let guest = Rc::new(GuestModule::parse(path, bytes)?);
        log::info!(
            "translating module {} ({} sections, {} symbols)",
            guest.name,
            guest.sections.len(),
            guest.symbols.len()
        );

        let shadow_name = if self.modules_translated == 0 {
            crate::constants::SHADOW_MEMORY_NAME.to_string()
        } else {
            format!(
                "{}{}",
                crate::constants::SHADOW_MEMORY_NAME,
                self.modules_translated
            )
        };
        let shadow = ShadowImage::build(
            &mut self.ctx.module,
            &mut self.ctx.importer,
            &guest,
            &shadow_name,
        )?;

        // declare every guest function first so forward calls resolve
        let text_sections: Vec<usize> = guest
            .sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_text())
            .map(|(i, _)| i)
            .collect();
        for &si in &text_sections {
            for f in guest.functions(si) {
                assert!(f.end % 4 == 0, "function end {:#x} not 4-aligned", f.end);
                self.ctx.add_func(&f.name, f.addr, f.end)?;
            }
        }

        // one relocation cursor per section, shared by its functions
        for &si in &text_sections {
            let mut cursor = RelocationCursor::new(guest.sections[si].relocs.clone());
            for f in guest.functions(si) {
                let ft = FuncTranslator::new(
                    &mut self.ctx,
                    guest.clone(),
                    si,
                    shadow.data_id,
                    &mut cursor,
                    f.addr,
                );
                ft.run()?;
            }
        }

        self.modules_translated += 1;
        Ok(())
    }

    /// Generate the dispatch machinery and emit the finished object.
    pub fn finish(mut self) -> TranslationResult<Vec<u8>> {
        generate_icaller(&mut self.ctx)?;
        generate_is_external(&mut self.ctx)?;
        self.emit()
    }

    /// Emit only the syscall handler module (`--gen-sc-handler`).
    pub fn finish_syscall_module(self) -> TranslationResult<Vec<u8>> {
        self.emit()
    }

    fn emit(self) -> TranslationResult<Vec<u8>> {
        let product = self.ctx.module.finish();
        product
            .emit()
            .map_err(|e| TranslationError::Emit(e.to_string()))
    }

    // ---- introspection, used by tests and diagnostics ----

    /// The translated guest functions, in ascending address order.
    pub fn functions(&self) -> impl Iterator<Item = &FuncInfo> {
        self.ctx.funcs.values()
    }

    /// CLIF rendition of a translated function body.
    pub fn function_ir(&self, name: &str) -> Option<&str> {
        let addr = self.ctx.funcs_by_name.get(name)?;
        self.ctx.funcs.get(addr)?.clif.as_deref()
    }

    /// Address-to-source sidecar lines accumulated so far.
    pub fn a2s_lines(&self) -> &[String] {
        &self.ctx.a2s
    }

    /// Symbols imported from the runtime, with their synthetic addresses.
    pub fn imports(&self) -> impl Iterator<Item = (&str, u32)> {
        self.ctx
            .importer
            .imports()
            .iter()
            .map(|i| (i.name.as_str(), i.ext_addr))
    }
}
