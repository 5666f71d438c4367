//! The function translator: prologue and epilogue, the instruction-driving
//! loop, register synchronisation, spill slots and the indirect-branch
//! fixup pass.
//!
//! Guest functions are lowered onto a bare [`ir::Function`] through
//! [`FuncCursor`], never through `cranelift_frontend`: the basic-block
//! manager must be able to split blocks that are already filled, which the
//! frontend's SSA bookkeeping does not allow. Values never flow between
//! blocks except through register storage, so no block parameters are
//! needed.

use std::collections::BTreeSet;
use std::rc::Rc;

use cranelift_codegen::cursor::{Cursor, FuncCursor};
use cranelift_codegen::ir::{
    self, condcodes::IntCC, types, Block, InstBuilder, MemFlags, StackSlotData, StackSlotKind,
    UserFuncName, Value,
};
use cranelift_codegen::verifier::verify_function;
use cranelift_module::{DataId, FuncId, Module};
use cranelift_object::ObjectModule;

use crate::blocks::BlockMap;
use crate::code_translator::translate_inst;
use crate::constants::{ARGV_AREA, INSTRUCTION_SIZE};
use crate::context::Context;
use crate::decode::{Decoded, Disassembler};
use crate::errors::{TranslationError, TranslationResult};
use crate::guest::GuestModule;
use crate::options::RegMode;
use crate::register_file::{RegisterFile, SyncDirection, SyncFlags, A0, A1, SP};
use crate::relocation::{RelocTarget, RelocValue, RelocationCursor};

/// A cheap emission context over the function under construction. Every
/// instruction is appended at the bottom of one block.
pub(crate) struct Emitter<'e> {
    pub module: &'e mut ObjectModule,
    pub func: &'e mut ir::Function,
    pub block: Block,
    pub ptr_ty: ir::Type,
}

impl<'e> Emitter<'e> {
    /// A fresh cursor positioned at the bottom of the current block.
    pub fn cur(&mut self) -> FuncCursor<'_> {
        FuncCursor::new(self.func).at_bottom(self.block)
    }

    pub fn iconst32(&mut self, v: u32) -> Value {
        self.cur().ins().iconst(types::I32, v as i32 as i64)
    }

    /// Host address of a module-scope variable.
    pub fn global_addr(&mut self, id: DataId) -> Value {
        let gv = self.module.declare_data_in_func(id, self.func);
        let ptr_ty = self.ptr_ty;
        self.cur().ins().symbol_value(ptr_ty, gv)
    }

    pub fn load_global(&mut self, id: DataId, ty: ir::Type) -> Value {
        let addr = self.global_addr(id);
        self.cur().ins().load(ty, MemFlags::trusted(), addr, 0)
    }

    pub fn store_global(&mut self, id: DataId, v: Value) {
        let addr = self.global_addr(id);
        self.cur().ins().store(MemFlags::trusted(), v, addr, 0);
    }

    /// Widen a guest address to a host pointer.
    pub fn guest_ptr(&mut self, v32: Value) -> Value {
        if self.ptr_ty == types::I32 {
            v32
        } else {
            let ptr_ty = self.ptr_ty;
            self.cur().ins().uextend(ptr_ty, v32)
        }
    }

    /// Truncate a host pointer to a guest address.
    pub fn host_to_i32(&mut self, p: Value) -> Value {
        if self.ptr_ty == types::I32 {
            p
        } else {
            self.cur().ins().ireduce(types::I32, p)
        }
    }

    /// Call a declared function and return its results.
    pub fn call_fn(&mut self, id: FuncId, args: &[Value]) -> Vec<Value> {
        let fref = self.module.declare_func_in_func(id, self.func);
        let call = self.cur().ins().call(fref, args);
        self.func.dfg.inst_results(call).to_vec()
    }
}

/// Spill-slot tracking for `--opt-stack`.
#[derive(Default)]
struct SpillState {
    /// False once `sp` was modified in a way we cannot follow.
    tracked: bool,
    /// Current `sp` offset relative to its value at function entry.
    sp_delta: i64,
    /// Slots keyed by canonical (entry-relative) frame offset.
    slots: std::collections::BTreeMap<i64, (ir::StackSlot, ir::Type)>,
}

pub struct FuncTranslator<'a> {
    pub(crate) ctx: &'a mut Context,
    pub(crate) guest: Rc<GuestModule>,
    pub(crate) sec_idx: usize,
    pub(crate) shadow: DataId,
    pub(crate) reloc: &'a mut RelocationCursor,

    pub(crate) name: String,
    func_id: FuncId,
    pub(crate) addr: u32,
    pub(crate) end: u32,
    pub(crate) is_main: bool,

    pub(crate) func: ir::Function,
    pub(crate) blocks: BlockMap,
    pub(crate) cur: Block,
    pub(crate) regs: RegisterFile,

    pub(crate) cur_pc: u32,
    recorded: bool,
    disasm: Disassembler,
    depth: u32,

    ind_sites: Vec<u32>,
    ind_targets: BTreeSet<u32>,
    ijump_dispatch: Option<Block>,
    ijump_slot: Option<ir::StackSlot>,

    spill: SpillState,
    sp_delta_pending: Option<i64>,
}

impl<'a> FuncTranslator<'a> {
    pub fn new(
        ctx: &'a mut Context,
        guest: Rc<GuestModule>,
        sec_idx: usize,
        shadow: DataId,
        reloc: &'a mut RelocationCursor,
        addr: u32,
    ) -> Self {
        let info = ctx.funcs.get(&addr).expect("function not registered");
        let name = info.name.clone();
        let func_id = info.func_id;
        let end = info.end;
        let is_main = info.is_main;

        let sig = ctx
            .module
            .declarations()
            .get_function_decl(func_id)
            .signature
            .clone();
        let func = ir::Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);
        let mode = ctx.opts.regs;

        FuncTranslator {
            ctx,
            guest,
            sec_idx,
            shadow,
            reloc,
            name,
            func_id,
            addr,
            end,
            is_main,
            func,
            blocks: BlockMap::new(),
            cur: Block::from_u32(0), // replaced by start()
            regs: RegisterFile::new(mode),
            cur_pc: addr,
            recorded: true,
            disasm: Disassembler::new(),
            depth: 0,
            ind_sites: Vec::new(),
            ind_targets: BTreeSet::new(),
            ijump_dispatch: None,
            ijump_slot: None,
            spill: SpillState {
                tracked: true,
                ..SpillState::default()
            },
            sp_delta_pending: None,
        }
    }

    /// Translate the whole function and define it in the output module.
    pub fn run(mut self) -> TranslationResult<()> {
        log::info!(
            "translating {} at [{:#x}, {:#x})",
            self.name,
            self.addr,
            self.end
        );
        self.start()?;
        self.translate_range(self.addr, self.end)?;
        if !self.is_terminated(self.cur) {
            self.freturn()?;
        }
        self.fixup_indirect()?;
        self.clean_regs();
        self.seal_dangling_blocks();

        assert!(!self.blocks.is_empty(), "empty BB map after translation");

        let display = self.func.display().to_string();
        log::debug!("{display}");
        if let Err(errors) = verify_function(&self.func, self.ctx.module.isa()) {
            return Err(TranslationError::Verification {
                func: self.name.clone(),
                detail: errors.to_string(),
            });
        }

        let mut clif_ctx = cranelift_codegen::Context::for_function(self.func);
        self.ctx.module.define_function(self.func_id, &mut clif_ctx)?;

        let info = self.ctx.funcs.get_mut(&self.addr).unwrap();
        info.translated = true;
        info.clif = Some(display);
        info.bb_addrs = self.blocks.addrs();
        for i in 0..32 {
            info.xreg_reads[i] = self.regs.x[i].reads;
            info.xreg_writes[i] = self.regs.x[i].writes;
        }
        Ok(())
    }

    // ---- emission plumbing ----

    /// Run `f` with an emitter at the bottom of the current block, recording
    /// the first instruction produced for the current guest PC.
    pub(crate) fn emit<R>(&mut self, f: impl FnOnce(&mut Emitter) -> R) -> R {
        let before = self.func.layout.last_inst(self.cur);
        let mut em = Emitter {
            module: &mut self.ctx.module,
            func: &mut self.func,
            block: self.cur,
            ptr_ty: self.ctx.ptr_ty,
        };
        let r = f(&mut em);
        if !self.recorded {
            let first = match before {
                Some(i) => self.func.layout.next_inst(i),
                None => self.func.layout.first_inst(self.cur),
            };
            if let Some(first) = first {
                self.blocks.record_inst(self.cur_pc, first);
                self.recorded = true;
            }
        }
        r
    }

    /// Like `emit`, returning every instruction the closure appended.
    fn emit_collect(&mut self, f: impl FnOnce(&mut Emitter)) -> Vec<ir::Inst> {
        let before = self.func.layout.last_inst(self.cur);
        self.emit(f);
        let mut insts = Vec::new();
        let mut it = match before {
            Some(i) => self.func.layout.next_inst(i),
            None => self.func.layout.first_inst(self.cur),
        };
        while let Some(i) = it {
            insts.push(i);
            it = self.func.layout.next_inst(i);
        }
        insts
    }

    /// An untracked helper block tied to the current guest PC.
    pub(crate) fn new_ubb(&mut self) -> Block {
        self.blocks.new_ubb(&mut self.func, self.cur_pc)
    }

    pub(crate) fn is_terminated(&self, block: Block) -> bool {
        match self.func.layout.last_inst(block) {
            Some(i) => self.func.dfg.insts[i].opcode().is_terminator(),
            None => false,
        }
    }

    // ---- register access ----

    fn xslot(&mut self, r: u8) -> ir::StackSlot {
        if let Some(s) = self.regs.x[r as usize].slot {
            return s;
        }
        let s = self
            .func
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4));
        self.regs.x[r as usize].slot = Some(s);
        s
    }

    fn fslot(&mut self, r: u8) -> ir::StackSlot {
        if let Some(s) = self.regs.f[r as usize].slot {
            return s;
        }
        let s = self
            .func
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 8));
        self.regs.f[r as usize].slot = Some(s);
        s
    }

    /// Current value of an X register. `x0` reads as constant zero.
    pub(crate) fn read_xreg(&mut self, r: u8) -> Value {
        if r == 0 {
            return self.emit(|em| em.iconst32(0));
        }
        self.regs.x[r as usize].reads += 1;
        if self.regs.local() {
            let slot = self.xslot(r);
            self.emit(|em| em.cur().ins().stack_load(types::I32, slot, 0))
        } else {
            let id = self.ctx.xregs[r as usize];
            self.emit(|em| em.load_global(id, types::I32))
        }
    }

    /// Store to an X register. Writes to `x0` are discarded.
    pub(crate) fn write_xreg(&mut self, r: u8, v: Value) {
        if r == 0 {
            return;
        }
        let st = &mut self.regs.x[r as usize];
        st.writes += 1;
        st.dirty = true;
        self.ctx.xreg_written[r as usize] += 1;
        if r == SP {
            self.note_sp_write();
        }
        if self.regs.local() {
            let slot = self.xslot(r);
            self.emit(|em| {
                em.cur().ins().stack_store(v, slot, 0);
            });
        } else {
            let id = self.ctx.xregs[r as usize];
            self.emit(|em| em.store_global(id, v));
        }
    }

    /// Raw 64-bit pattern of an F register.
    pub(crate) fn read_freg(&mut self, r: u8) -> Value {
        self.regs.f[r as usize].reads += 1;
        if self.regs.local() {
            let slot = self.fslot(r);
            self.emit(|em| em.cur().ins().stack_load(types::I64, slot, 0))
        } else {
            let id = self.ctx.fregs[r as usize];
            self.emit(|em| em.load_global(id, types::I64))
        }
    }

    pub(crate) fn write_freg(&mut self, r: u8, v: Value) {
        let st = &mut self.regs.f[r as usize];
        st.writes += 1;
        st.dirty = true;
        if self.regs.local() {
            let slot = self.fslot(r);
            self.emit(|em| {
                em.cur().ins().stack_store(v, slot, 0);
            });
        } else {
            let id = self.ctx.fregs[r as usize];
            self.emit(|em| em.store_global(id, v));
        }
    }

    /// Whether the register ever received a value in this function. Used by
    /// the caller to cut off the argument list.
    pub(crate) fn xreg_written(&self, r: u8) -> bool {
        if self.regs.mode == RegMode::Globals {
            self.ctx_written(r)
        } else {
            self.regs.x[r as usize].writes > 0
        }
    }

    fn ctx_written(&self, r: u8) -> bool {
        self.ctx.xreg_written[r as usize] > 0
    }

    // ---- synchronisation ----

    pub(crate) fn sync_regs(&mut self, dir: SyncDirection, flags: SyncFlags) {
        let xs = self.regs.x_sync_set(flags);
        let fs = self.regs.f_sync_set(flags, self.ctx.opts.sync_fregs);
        for r in xs {
            self.sync_one_x(dir, r);
        }
        for r in fs {
            self.sync_one_f(dir, r);
        }
    }

    fn sync_one_x(&mut self, dir: SyncDirection, r: u8) {
        debug_assert!(r != 0);
        let slot = self.xslot(r);
        let id = self.ctx.xregs[r as usize];
        let insts = self.emit_collect(|em| match dir {
            SyncDirection::Load => {
                let v = em.load_global(id, types::I32);
                em.cur().ins().stack_store(v, slot, 0);
            }
            SyncDirection::Store => {
                let v = em.cur().ins().stack_load(types::I32, slot, 0);
                em.store_global(id, v);
            }
        });
        if dir == SyncDirection::Store {
            self.regs.x[r as usize].dirty = false;
        }
        self.regs.x[r as usize].sync_insts.extend(insts);
    }

    fn sync_one_f(&mut self, dir: SyncDirection, r: u8) {
        let slot = self.fslot(r);
        let id = self.ctx.fregs[r as usize];
        let insts = self.emit_collect(|em| match dir {
            SyncDirection::Load => {
                let v = em.load_global(id, types::I64);
                em.cur().ins().stack_store(v, slot, 0);
            }
            SyncDirection::Store => {
                let v = em.cur().ins().stack_load(types::I64, slot, 0);
                em.store_global(id, v);
            }
        });
        if dir == SyncDirection::Store {
            self.regs.f[r as usize].dirty = false;
        }
        self.regs.f[r as usize].sync_insts.extend(insts);
    }

    /// After the body is lowered, drop the synchronisation traffic of
    /// registers the body never touched.
    fn clean_regs(&mut self) {
        for bank in [&mut self.regs.x, &mut self.regs.f] {
            for st in bank.iter_mut() {
                if st.reads == 0 && st.writes == 0 && !st.sync_insts.is_empty() {
                    for inst in st.sync_insts.drain(..) {
                        self.func.layout.remove_inst(inst);
                    }
                }
            }
        }
    }

    // ---- lifecycle ----

    fn start(&mut self) -> TranslationResult<()> {
        let entry = self.blocks.new_bb(&mut self.func, self.addr);
        self.cur = entry;
        if self.is_main {
            self.func.dfg.append_block_param(entry, types::I32);
            let ptr_ty = self.ctx.ptr_ty;
            self.func.dfg.append_block_param(entry, ptr_ty);
        }
        self.sync_regs(SyncDirection::Load, SyncFlags::FUNC_START);
        if self.is_main {
            self.emit_main_init()?;
        }
        Ok(())
    }

    /// `main` prologue: stack pointer, argc/argv marshaling, runtime init.
    fn emit_main_init(&mut self) -> TranslationResult<()> {
        let entry = self.blocks.find(self.addr).unwrap();
        let params = self.func.dfg.block_params(entry).to_vec();
        let (argc, argv) = (params[0], params[1]);
        let stack = self.ctx.stack;
        let stack_size = self.ctx.stack_size;

        // sp and a1 point at a copy of argv at the top of the guest stack
        let base = self.emit(|em| {
            let p = em.global_addr(stack);
            let top = em.cur().ins().iadd_imm(p, stack_size as i64);
            let top32 = em.host_to_i32(top);
            em.cur().ins().iadd_imm(top32, -(ARGV_AREA as i64))
        });
        self.write_xreg(A0, argc);
        self.write_xreg(A1, base);
        self.write_xreg(SP, base);

        let islot = self
            .func
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4));
        let head = self.blocks.new_ubb(&mut self.func, self.addr);
        let body = self.blocks.new_ubb(&mut self.func, self.addr);
        let cont = self.blocks.new_ubb(&mut self.func, self.addr);

        self.emit(|em| {
            let zero = em.iconst32(0);
            em.cur().ins().stack_store(zero, islot, 0);
            em.cur().ins().jump(head, &[]);
        });

        self.cur = head;
        self.emit(|em| {
            let i = em.cur().ins().stack_load(types::I32, islot, 0);
            let more = em.cur().ins().icmp(IntCC::SignedLessThan, i, argc);
            em.cur().ins().brif(more, body, &[], cont, &[]);
        });

        self.cur = body;
        let ptr_bytes = self.ctx.module.isa().pointer_bytes() as i64;
        self.emit(|em| {
            let i = em.cur().ins().stack_load(types::I32, islot, 0);
            let idx = em.guest_ptr(i);
            let off = em.cur().ins().imul_imm(idx, ptr_bytes);
            let src = em.cur().ins().iadd(argv, off);
            let ptr_ty = em.ptr_ty;
            let p = em.cur().ins().load(ptr_ty, MemFlags::new(), src, 0);
            let p32 = em.host_to_i32(p);
            let four = em.cur().ins().imul_imm(i, 4);
            let dst32 = em.cur().ins().iadd(base, four);
            let dst = em.guest_ptr(dst32);
            em.cur().ins().store(MemFlags::new(), p32, dst, 0);
            let next = em.cur().ins().iadd_imm(i, 1);
            em.cur().ins().stack_store(next, islot, 0);
            em.cur().ins().jump(head, &[]);
        });

        self.cur = cont;
        let init = self.ctx.syscall_init()?;
        self.emit(|em| {
            em.call_fn(init, &[]);
        });
        Ok(())
    }

    /// Emit the function return: synchronise and return `a0` in `main`,
    /// nothing elsewhere.
    pub(crate) fn freturn(&mut self) -> TranslationResult<()> {
        self.sync_regs(SyncDirection::Store, SyncFlags::FUNC_RETURN);
        if self.is_main {
            let a0 = self.read_xreg(A0);
            self.emit(|em| {
                em.cur().ins().return_(&[a0]);
            });
        } else {
            self.emit(|em| {
                em.cur().ins().return_(&[]);
            });
        }
        Ok(())
    }

    /// Drive instruction translation over `[start, end)`.
    fn translate_range(&mut self, start: u32, end: u32) -> TranslationResult<()> {
        let data_len = self.guest.sections[self.sec_idx].data.len() as u32;
        let mut pc = start;
        while pc < end {
            if let Some(bb) = self.blocks.find(pc) {
                if bb != self.cur {
                    if !self.is_terminated(self.cur) {
                        self.emit(|em| {
                            em.cur().ins().jump(bb, &[]);
                        });
                    }
                    self.cur = bb;
                }
            } else if self.is_terminated(self.cur) {
                // code after a terminator with no known leader yet
                let bb = self.blocks.new_bb(&mut self.func, pc);
                self.cur = bb;
            }

            if pc + INSTRUCTION_SIZE > data_len {
                break;
            }
            let raw = self.guest.word_at(self.sec_idx, pc);
            let inst = match self.disasm.disasm(pc, raw)? {
                Decoded::Padding => {
                    pc += INSTRUCTION_SIZE;
                    continue;
                }
                Decoded::Inst(i) => i,
            };

            self.cur_pc = pc;
            self.recorded = false;
            let reloc = self.reloc.handle(pc, self.ctx, &self.guest)?;
            if self.ctx.opts.commented_asm {
                log::debug!("{pc:08x}:   {inst}");
            }
            if self.ctx.opts.a2s.is_some() {
                let line = format!(
                    "{:08x} {}+{:#x}  {}",
                    pc,
                    self.name,
                    pc - self.addr,
                    inst
                );
                self.ctx.a2s.push(line);
            }

            translate_inst(self, &inst, reloc)?;
            if !self.recorded {
                // anchor so the PC keeps a first-instruction mapping
                self.emit(|em| {
                    em.cur().ins().nop();
                });
            }
            pc += INSTRUCTION_SIZE;
        }
        Ok(())
    }

    // ---- branch target discovery ----

    /// Find or create the block for a branch target, splitting or eagerly
    /// re-translating when the target lies behind the cursor.
    pub(crate) fn branch_target_bb(&mut self, target: u32) -> TranslationResult<Block> {
        if let Some(b) = self.blocks.find(target) {
            return Ok(b);
        }
        if target > self.cur_pc {
            return Ok(self.blocks.new_bb(&mut self.func, target));
        }
        if target == self.cur_pc {
            // a self-targeting instruction becomes its own block leader
            let block = self.blocks.new_bb(&mut self.func, target);
            if !self.is_terminated(self.cur) {
                self.emit(|em| {
                    em.cur().ins().jump(block, &[]);
                });
            }
            self.cur = block;
            return Ok(block);
        }
        match self.blocks.containing(target) {
            Some((_, containing)) => {
                let splitting_cur = containing == self.cur;
                let block = self.blocks.split(&mut self.func, target);
                if splitting_cur {
                    self.cur = block;
                }
                Ok(block)
            }
            None => {
                // the target precedes every translated block: translate the
                // gap eagerly into a fresh block
                let (stop, _) = self
                    .blocks
                    .lower_bound(target)
                    .expect("BB map empty during branch discovery");
                let block = self.blocks.new_bb(&mut self.func, target);
                self.retranslate_range(target, stop, block)?;
                Ok(block)
            }
        }
    }

    fn retranslate_range(&mut self, start: u32, stop: u32, block: Block) -> TranslationResult<()> {
        self.depth += 1;
        assert!(self.depth < 64, "runaway branch target re-translation");

        let saved_cur = self.cur;
        let saved_pc = self.cur_pc;
        let saved_recorded = self.recorded;
        let saved_disasm = std::mem::take(&mut self.disasm);
        let relocs = self.guest.sections[self.sec_idx].relocs.clone();
        let mut cursor = RelocationCursor::at(relocs, start);
        std::mem::swap(self.reloc, &mut cursor);

        self.cur = block;
        let r = self.translate_range(start, stop);
        if r.is_ok() && !self.is_terminated(self.cur) {
            let dest = self.blocks.find(stop).expect("stop block vanished");
            self.emit(|em| {
                em.cur().ins().jump(dest, &[]);
            });
        }

        std::mem::swap(self.reloc, &mut cursor);
        self.disasm = saved_disasm;
        self.cur = saved_cur;
        self.cur_pc = saved_pc;
        self.recorded = saved_recorded;
        self.depth -= 1;
        r
    }

    // ---- relocation values ----

    /// Lower a resolved relocation to the IR value replacing the immediate.
    pub(crate) fn reloc_ir_value(&mut self, rv: RelocValue) -> Value {
        let shadow = self.shadow;
        match rv.target {
            RelocTarget::ExtFunc { addr } | RelocTarget::Func { addr } => {
                self.emit(|em| em.iconst32(addr & rv.mask))
            }
            RelocTarget::ExtData { data } => self.emit(|em| {
                let p = em.global_addr(data);
                let v = em.host_to_i32(p);
                em.cur().ins().band_imm(v, rv.mask as i32 as i64)
            }),
            RelocTarget::Data { offs } => self.emit(|em| {
                let p = em.global_addr(shadow);
                let full = em.cur().ins().iadd_imm(p, offs as i64);
                let v = em.host_to_i32(full);
                em.cur().ins().band_imm(v, rv.mask as i32 as i64)
            }),
        }
    }

    /// Track label loads so the indirect-branch fixup knows its targets.
    pub(crate) fn note_label_value(&mut self, rv: &RelocValue) -> TranslationResult<()> {
        if let RelocTarget::Func { addr } = rv.target {
            if rv.is_lo()
                && addr > self.addr
                && addr < self.end
                && !self.ctx.funcs.contains_key(&addr)
            {
                let bb = self.branch_target_bb(addr)?;
                let _ = bb;
                self.ind_targets.insert(addr);
            }
        }
        Ok(())
    }

    // ---- indirect jumps ----

    /// Lower `jalr x0` with a dynamic target: stage the target in a slot and
    /// jump to the per-function dispatch block filled in by the fixup pass.
    pub(crate) fn emit_ijump(&mut self, target: Value) -> TranslationResult<()> {
        let slot = match self.ijump_slot {
            Some(s) => s,
            None => {
                let s = self
                    .func
                    .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4));
                self.ijump_slot = Some(s);
                s
            }
        };
        let dispatch = match self.ijump_dispatch {
            Some(b) => b,
            None => {
                let b = self.blocks.new_ubb(&mut self.func, self.cur_pc);
                self.ijump_dispatch = Some(b);
                b
            }
        };
        self.ind_sites.push(self.cur_pc);
        self.emit(|em| {
            em.cur().ins().stack_store(target, slot, 0);
            em.cur().ins().jump(dispatch, &[]);
        });
        Ok(())
    }

    /// Populate the dispatch block with a switch over every registered
    /// address-taken label.
    fn fixup_indirect(&mut self) -> TranslationResult<()> {
        let Some(dispatch) = self.ijump_dispatch else {
            return Ok(());
        };
        assert!(!self.ind_sites.is_empty(), "dispatch block without sites");
        if self.ind_targets.is_empty() {
            return Err(TranslationError::EmptyIndirectTargetSet {
                addr: self.ind_sites[0],
                func: self.name.clone(),
            });
        }

        let slot = self.ijump_slot.unwrap();
        let abort = self.ctx.sbtabort()?;
        let fallback = self.blocks.new_ubb(&mut self.func, self.ind_sites[0]);

        self.cur = fallback;
        self.emit(|em| {
            em.call_fn(abort, &[]);
        });
        // sbtabort does not return; satisfy the verifier anyway
        self.freturn()?;

        let cases: Vec<(u32, Block)> = self
            .ind_targets
            .iter()
            .map(|&a| (a, self.blocks.find(a).expect("registered target lost")))
            .collect();

        self.cur = dispatch;
        let target = self.emit(|em| em.cur().ins().stack_load(types::I32, slot, 0));
        let func = &mut self.func;
        crate::icaller::emit_u32_switch(func, dispatch, target, &cases, fallback);
        Ok(())
    }

    // ---- spills ----

    /// Announce that the next `sp` write is a constant adjustment, keeping
    /// the frame offset tracking alive.
    pub(crate) fn prepare_sp_delta(&mut self, d: i64) {
        self.sp_delta_pending = Some(d);
    }

    fn note_sp_write(&mut self) {
        match self.sp_delta_pending.take() {
            Some(d) if self.spill.tracked => self.spill.sp_delta += d,
            _ => self.spill.tracked = false,
        }
    }

    /// A dedicated slot for a `sp+imm` access, when spill routing applies.
    pub(crate) fn spill_slot(
        &mut self,
        base: u8,
        imm: i32,
        ty: ir::Type,
    ) -> TranslationResult<Option<ir::StackSlot>> {
        if !self.ctx.opts.opt_stack || base != SP || !self.spill.tracked {
            return Ok(None);
        }
        let key = self.spill.sp_delta + imm as i64;
        if let Some(&(slot, slot_ty)) = self.spill.slots.get(&key) {
            if slot_ty != ty {
                return Err(TranslationError::Unsupported {
                    addr: self.cur_pc,
                    what: format!(
                        "mixed-type stack access at frame offset {key}; retry without --opt-stack"
                    ),
                });
            }
            return Ok(Some(slot));
        }
        let slot = self.func.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            ty.bytes(),
        ));
        self.spill.slots.insert(key, (slot, ty));
        Ok(Some(slot))
    }

    // ---- epilogue plumbing ----

    /// Give every block left without a terminator a function return, so the
    /// layout stays verifiable even around padding and dead code.
    fn seal_dangling_blocks(&mut self) {
        let blocks: Vec<Block> = {
            let layout = &self.func.layout;
            layout.blocks().collect()
        };
        for b in blocks {
            if !self.is_terminated(b) {
                self.cur = b;
                if self.is_main {
                    self.emit(|em| {
                        let zero = em.iconst32(0);
                        em.cur().ins().return_(&[zero]);
                    });
                } else {
                    self.emit(|em| {
                        em.cur().ins().return_(&[]);
                    });
                }
            }
        }
    }

    // ---- calls ----

    /// Direct call to a guest function.
    pub(crate) fn emit_internal_call(&mut self, target: u32) -> TranslationResult<()> {
        let info = self
            .ctx
            .funcs
            .get(&target)
            .ok_or_else(|| TranslationError::Unsupported {
                addr: self.cur_pc,
                what: format!("call target {target:#010x} is not a known function"),
            })?;
        if info.is_main {
            return Err(TranslationError::Unsupported {
                addr: self.cur_pc,
                what: "guest call to main".into(),
            });
        }
        let id = info.func_id;
        self.sync_regs(SyncDirection::Store, SyncFlags::CALL);
        self.emit(|em| {
            em.call_fn(id, &[]);
        });
        self.sync_regs(SyncDirection::Load, SyncFlags::CALL_RETURNED);
        Ok(())
    }

    /// `ecall`: dispatch through the generated `rv_syscall`.
    pub(crate) fn emit_syscall(&mut self) -> TranslationResult<()> {
        if self.regs.local() {
            self.sync_regs(SyncDirection::Store, SyncFlags::CALL | SyncFlags::XREG);
        }
        let rv_syscall = self.ctx.rv_syscall.expect("rv_syscall not generated");
        let n = self.read_xreg(crate::register_file::A7);
        let ret = self.emit(|em| em.call_fn(rv_syscall, &[n]))[0];
        self.write_xreg(A0, ret);
        Ok(())
    }
}
