//! The translation session.
//!
//! One `Context` lives for a whole run. It owns the output Cranelift module,
//! the global register file, the guest stack, the function registry and the
//! libc importer; every other component borrows it. Functions are identified
//! by guest address, basic blocks by `(function, address)` keys, so no
//! component needs a back-pointer.

use std::collections::{BTreeMap, HashMap};

use cranelift_codegen::ir::{types, AbiParam, Signature, Type};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};

use crate::errors::{TranslationError, TranslationResult};
use crate::libc::LibcImporter;
use crate::options::Options;

/// One guest function known to the session.
#[derive(Debug)]
pub struct FuncInfo {
    pub name: String,
    pub func_id: FuncId,
    pub addr: u32,
    pub end: u32,
    pub is_main: bool,
    pub translated: bool,
    /// CLIF rendition of the translated body, kept for diagnostics.
    pub clif: Option<String>,
    /// Guest addresses of the function's basic blocks, ascending.
    pub bb_addrs: Vec<u32>,
    /// Per-register body read/write counts, for diagnostics.
    pub xreg_reads: [u32; 32],
    pub xreg_writes: [u32; 32],
}

pub struct Context {
    pub opts: Options,
    pub module: ObjectModule,
    pub ptr_ty: Type,

    /// `rv_x0 .. rv_x31`; index 0 is read-only and never accessed.
    pub xregs: Vec<DataId>,
    /// `rv_f0 .. rv_f31`, 64-bit bit patterns.
    pub fregs: Vec<DataId>,
    pub fcsr: DataId,
    pub stack: DataId,
    pub stack_size: u32,
    /// Scratch word the icaller target is staged through.
    pub icaller_target: DataId,

    /// Guest functions keyed by guest address.
    pub funcs: BTreeMap<u32, FuncInfo>,
    pub funcs_by_name: HashMap<String, u32>,

    pub importer: LibcImporter,

    /// Module-wide write counts per X register; the caller's argument
    /// cut-off consults these in `Globals` mode.
    pub xreg_written: [u32; 32],

    pub rv_syscall: Option<FuncId>,
    icaller: Option<FuncId>,
    is_external: Option<FuncId>,
    sbtabort: Option<FuncId>,
    syscall_init: Option<FuncId>,
    get_cycles: Option<FuncId>,
    get_time: Option<FuncId>,
    get_instret: Option<FuncId>,

    /// Address-to-source sidecar lines.
    pub a2s: Vec<String>,
}

impl Context {
    pub fn new(opts: Options) -> TranslationResult<Context> {
        opts.validate()?;

        let mut flag_builder = settings::builder();
        let set = |b: &mut settings::Builder, k: &str, v: &str| {
            b.set(k, v)
                .map_err(|e| TranslationError::Config(format!("isa flag {k}: {e}")))
        };
        set(&mut flag_builder, "is_pic", "true")?;
        set(&mut flag_builder, "enable_verifier", "true")?;
        let isa_builder = cranelift_native::builder()
            .map_err(|m| TranslationError::Config(format!("host isa: {m}")))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| TranslationError::Config(format!("host isa: {e}")))?;
        let ptr_ty = isa.pointer_type();

        let builder = ObjectBuilder::new(isa, "sbt", cranelift_module::default_libcall_names())?;
        let mut module = ObjectModule::new(builder);

        // The guest register file, as module-scope variables.
        let mut xregs = Vec::with_capacity(32);
        for i in 0..32 {
            let writable = i != 0;
            let id = module.declare_data(&format!("rv_x{i}"), Linkage::Export, writable, false)?;
            define_zeroinit(&mut module, id, 4, 4)?;
            xregs.push(id);
        }
        let mut fregs = Vec::with_capacity(32);
        for i in 0..32 {
            let id = module.declare_data(&format!("rv_f{i}"), Linkage::Export, true, false)?;
            define_zeroinit(&mut module, id, 8, 8)?;
            fregs.push(id);
        }
        let fcsr = module.declare_data("rv_fcsr", Linkage::Export, true, false)?;
        define_zeroinit(&mut module, fcsr, 4, 4)?;

        let stack = module.declare_data(crate::constants::STACK_NAME, Linkage::Export, true, false)?;
        define_zeroinit(&mut module, stack, opts.stack_size as usize, 16)?;

        let icaller_target =
            module.declare_data("rv_icaller_target", Linkage::Export, true, false)?;
        define_zeroinit(&mut module, icaller_target, 4, 4)?;

        Ok(Context {
            stack_size: opts.stack_size,
            opts,
            module,
            ptr_ty,
            xregs,
            fregs,
            fcsr,
            stack,
            icaller_target,
            funcs: BTreeMap::new(),
            funcs_by_name: HashMap::new(),
            importer: LibcImporter::new(),
            xreg_written: [0; 32],
            rv_syscall: None,
            icaller: None,
            is_external: None,
            sbtabort: None,
            syscall_init: None,
            get_cycles: None,
            get_time: None,
            get_instret: None,
            a2s: Vec::new(),
        })
    }

    /// Register a guest function, declaring it in the output module.
    pub fn add_func(
        &mut self,
        name: &str,
        addr: u32,
        end: u32,
    ) -> TranslationResult<FuncId> {
        if let Some(existing) = self.funcs.get(&addr) {
            return Err(TranslationError::Config(format!(
                "function {name} collides with {} at address {addr:#010x}",
                existing.name
            )));
        }
        let is_main = name == "main";
        let mut sig = Signature::new(self.module.isa().default_call_conv());
        if is_main {
            sig.params.push(AbiParam::new(types::I32));
            sig.params.push(AbiParam::new(self.ptr_ty));
            sig.returns.push(AbiParam::new(types::I32));
        }
        let func_id = self.module.declare_function(name, Linkage::Export, &sig)?;
        self.funcs.insert(
            addr,
            FuncInfo {
                name: name.to_string(),
                func_id,
                addr,
                end,
                is_main,
                translated: false,
                clif: None,
                bb_addrs: Vec::new(),
                xreg_reads: [0; 32],
                xreg_writes: [0; 32],
            },
        );
        self.funcs_by_name.insert(name.to_string(), addr);
        Ok(func_id)
    }

    pub fn func_by_addr(&self, addr: u32) -> Option<&FuncInfo> {
        self.funcs.get(&addr)
    }

    /// Declare a plain external function import on first use.
    fn import_ext(
        &mut self,
        name: &str,
        params: &[Type],
        returns: &[Type],
    ) -> TranslationResult<FuncId> {
        let mut sig = Signature::new(self.module.isa().default_call_conv());
        for &p in params {
            sig.params.push(AbiParam::new(p));
        }
        for &r in returns {
            sig.returns.push(AbiParam::new(r));
        }
        Ok(self.module.declare_function(name, Linkage::Import, &sig)?)
    }

    /// The generated indirect-call dispatcher, declared on first use and
    /// defined when the module is finished.
    pub fn icaller_id(&mut self) -> TranslationResult<FuncId> {
        if let Some(id) = self.icaller {
            return Ok(id);
        }
        let mut sig = Signature::new(self.module.isa().default_call_conv());
        for _ in 0..9 {
            sig.params.push(AbiParam::new(types::I32));
        }
        let id = self
            .module
            .declare_function("rv32_icaller", Linkage::Export, &sig)?;
        self.icaller = Some(id);
        Ok(id)
    }

    pub fn is_external_id(&mut self) -> TranslationResult<FuncId> {
        if let Some(id) = self.is_external {
            return Ok(id);
        }
        let mut sig = Signature::new(self.module.isa().default_call_conv());
        sig.params.push(AbiParam::new(types::I32));
        sig.returns.push(AbiParam::new(types::I32));
        let id = self
            .module
            .declare_function("rv32_isExternal", Linkage::Export, &sig)?;
        self.is_external = Some(id);
        Ok(id)
    }

    pub fn sbtabort(&mut self) -> TranslationResult<FuncId> {
        if let Some(id) = self.sbtabort {
            return Ok(id);
        }
        let id = self.import_ext("sbtabort", &[], &[])?;
        self.sbtabort = Some(id);
        Ok(id)
    }

    pub fn syscall_init(&mut self) -> TranslationResult<FuncId> {
        if let Some(id) = self.syscall_init {
            return Ok(id);
        }
        let id = self.import_ext("rv_syscall_init", &[], &[])?;
        self.syscall_init = Some(id);
        Ok(id)
    }

    /// Runtime counter intrinsics backing the CSR reads.
    pub fn counter(&mut self, which: Counter) -> TranslationResult<FuncId> {
        let slot = match which {
            Counter::Cycles => &mut self.get_cycles,
            Counter::Time => &mut self.get_time,
            Counter::Instret => &mut self.get_instret,
        };
        if let Some(id) = *slot {
            return Ok(id);
        }
        let name = match which {
            Counter::Cycles => "get_cycles",
            Counter::Time => "get_time",
            Counter::Instret => "get_instret",
        };
        let mut sig = Signature::new(self.module.isa().default_call_conv());
        sig.returns.push(AbiParam::new(types::I64));
        let id = self.module.declare_function(name, Linkage::Import, &sig)?;
        match which {
            Counter::Cycles => self.get_cycles = Some(id),
            Counter::Time => self.get_time = Some(id),
            Counter::Instret => self.get_instret = Some(id),
        }
        Ok(id)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Counter {
    Cycles,
    Time,
    Instret,
}

fn define_zeroinit(
    module: &mut ObjectModule,
    id: DataId,
    size: usize,
    align: u64,
) -> TranslationResult<()> {
    let mut desc = DataDescription::new();
    desc.define_zeroinit(size);
    desc.set_align(align);
    module.define_data(id, &desc)?;
    Ok(())
}
