//! The generated indirect-call machinery: `rv32_icaller` turns a runtime
//! guest code address into a direct call, `rv32_isExternal` classifies an
//! address against the synthetic import address space.

use cranelift_codegen::cursor::{Cursor, FuncCursor};
use cranelift_codegen::ir::{
    self, condcodes::IntCC, types, Block, InstBuilder, UserFuncName, Value,
};
use cranelift_codegen::verifier::verify_function;
use cranelift_module::{DataDescription, Linkage, Module};
use object::SymbolKind;

use crate::caller::{marshal_and_call, word_count, CallRet};
use crate::constants::FIRST_EXT_FUNC_ADDR;
use crate::context::Context;
use crate::errors::{TranslationError, TranslationResult};
use crate::func_translator::Emitter;
use crate::libc::ImportKind;
use crate::register_file::A0;

/// Emit a sparse switch over unsigned 32-bit keys as a binary search of
/// `brif` chains. `cases` must be sorted ascending; control enters at the
/// bottom of `block`.
pub(crate) fn emit_u32_switch(
    func: &mut ir::Function,
    block: Block,
    val: Value,
    cases: &[(u32, Block)],
    default: Block,
) {
    debug_assert!(cases.windows(2).all(|w| w[0].0 < w[1].0), "unsorted cases");
    if cases.len() <= 4 {
        let mut b = block;
        if cases.is_empty() {
            FuncCursor::new(func).at_bottom(b).ins().jump(default, &[]);
            return;
        }
        for (i, &(k, dest)) in cases.iter().enumerate() {
            let next = if i + 1 == cases.len() {
                default
            } else {
                let n = func.dfg.make_block();
                func.layout.append_block(n);
                n
            };
            let mut cur = FuncCursor::new(func).at_bottom(b);
            let c = cur.ins().icmp_imm(IntCC::Equal, val, k as i32 as i64);
            cur.ins().brif(c, dest, &[], next, &[]);
            b = next;
        }
    } else {
        let mid = cases.len() / 2;
        let pivot = cases[mid].0;
        let left = func.dfg.make_block();
        let right = func.dfg.make_block();
        func.layout.append_block(left);
        func.layout.append_block(right);
        let mut cur = FuncCursor::new(func).at_bottom(block);
        let c = cur
            .ins()
            .icmp_imm(IntCC::UnsignedGreaterThanOrEqual, val, pivot as i32 as i64);
        cur.ins().brif(c, right, &[], left, &[]);
        emit_u32_switch(func, left, val, &cases[..mid], default);
        emit_u32_switch(func, right, val, &cases[mid..], default);
    }
}

/// Generate `rv32_icaller(target, a0..a7)`: one case per known function,
/// internal targets called directly, external targets marshaled with the
/// return routed to the global register file.
pub fn generate_icaller(ctx: &mut Context) -> TranslationResult<()> {
    if ctx.opts.hard_float_abi {
        log::info!("icaller generation disabled by --hard-float-abi");
        return Ok(());
    }
    let func_id = ctx.icaller_id()?;
    let sbtabort = ctx.sbtabort()?;

    // diagnostic printf for the default case
    let diag = if ctx.opts.use_libc {
        let printf = ctx
            .importer
            .import(&mut ctx.module, "printf", SymbolKind::Text)?
            .clone();
        let fmt = ctx
            .module
            .declare_data("rv32_icaller_fmt", Linkage::Local, false, false)?;
        let mut desc = DataDescription::new();
        desc.define(
            b"sbt: icaller: invalid function address 0x%08x\n\0"
                .to_vec()
                .into_boxed_slice(),
        );
        desc.set_align(1);
        ctx.module.define_data(fmt, &desc)?;
        Some((printf, fmt))
    } else {
        None
    };

    let xregs = ctx.xregs.clone();
    let funcs: Vec<(u32, cranelift_module::FuncId, bool, String)> = ctx
        .funcs
        .values()
        .map(|f| (f.addr, f.func_id, f.is_main, f.name.clone()))
        .collect();
    let imports = ctx.importer.imports().to_vec();

    let sig = ctx
        .module
        .declarations()
        .get_function_decl(func_id)
        .signature
        .clone();
    let mut func = ir::Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);
    let entry = func.dfg.make_block();
    func.layout.append_block(entry);
    for _ in 0..9 {
        func.dfg.append_block_param(entry, types::I32);
    }
    let params = func.dfg.block_params(entry).to_vec();
    let target = params[0];
    let words = &params[1..];

    fn em<'e>(ctx: &'e mut Context, func: &'e mut ir::Function, block: Block) -> Emitter<'e> {
        Emitter {
            ptr_ty: ctx.ptr_ty,
            module: &mut ctx.module,
            func,
            block,
        }
    }

    // forward the argument words into the global register file
    {
        let mut e = em(ctx, &mut func, entry);
        for (i, &w) in words.iter().enumerate() {
            e.store_global(xregs[A0 as usize + i], w);
        }
    }

    let mut cases: Vec<(u32, Block)> = Vec::new();
    for (addr, id, is_main, name) in &funcs {
        if *is_main {
            log::warn!("skipping {name} in the icaller dispatch (main signature)");
            continue;
        }
        let bb = func.dfg.make_block();
        func.layout.append_block(bb);
        let mut e = em(ctx, &mut func, bb);
        e.call_fn(*id, &[]);
        e.cur().ins().return_(&[]);
        cases.push((*addr, bb));
    }
    for import in &imports {
        if import.kind != ImportKind::Func {
            continue;
        }
        let sig = import.sig.as_ref().expect("function import without signature");
        if ctx.opts.icall_int_only && sig.uses_float() {
            log::warn!(
                "skipping {} in the icaller dispatch (--icall-int-only)",
                import.name
            );
            continue;
        }
        let bb = func.dfg.make_block();
        func.layout.append_block(bb);
        let mut e = em(ctx, &mut func, bb);
        let n = word_count(sig);
        let mut call_words: Vec<Value> = words.to_vec();
        while call_words.len() < n {
            let z = e.iconst32(0);
            call_words.push(z);
        }
        let ret = marshal_and_call(&mut e, sig, import.func.unwrap(), &call_words[..n]);
        match ret {
            CallRet::None => {}
            CallRet::I32(v) => e.store_global(xregs[A0 as usize], v),
            CallRet::PairLoHi(lo, hi) => {
                e.store_global(xregs[A0 as usize], lo);
                e.store_global(xregs[A0 as usize + 1], hi);
            }
        }
        e.cur().ins().return_(&[]);
        cases.push((import.ext_addr, bb));
    }
    cases.sort_by_key(|&(k, _)| k);

    let default = func.dfg.make_block();
    func.layout.append_block(default);
    {
        let mut e = em(ctx, &mut func, default);
        if let Some((printf, fmt)) = diag {
            let sig = printf.sig.as_ref().unwrap();
            let p = e.global_addr(fmt);
            let p32 = e.host_to_i32(p);
            let zero = e.iconst32(0);
            let n = word_count(sig);
            let mut dwords = vec![p32, target];
            while dwords.len() < n {
                dwords.push(zero);
            }
            marshal_and_call(&mut e, sig, printf.func.unwrap(), &dwords[..n]);
        }
        e.call_fn(sbtabort, &[]);
        e.cur().ins().return_(&[]);
    }

    emit_u32_switch(&mut func, entry, target, &cases, default);
    define(ctx, "rv32_icaller", func_id, func)
}

/// Generate `rv32_isExternal(addr)`.
pub fn generate_is_external(ctx: &mut Context) -> TranslationResult<()> {
    let func_id = ctx.is_external_id()?;
    let sig = ctx
        .module
        .declarations()
        .get_function_decl(func_id)
        .signature
        .clone();
    let mut func = ir::Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);
    let entry = func.dfg.make_block();
    func.layout.append_block(entry);
    func.dfg.append_block_param(entry, types::I32);
    let addr = func.dfg.block_params(entry)[0];
    let mut cur = FuncCursor::new(&mut func).at_bottom(entry);
    let c = cur.ins().icmp_imm(
        IntCC::UnsignedGreaterThanOrEqual,
        addr,
        FIRST_EXT_FUNC_ADDR as i32 as i64,
    );
    let r = cur.ins().uextend(types::I32, c);
    cur.ins().return_(&[r]);
    define(ctx, "rv32_isExternal", func_id, func)
}

fn define(
    ctx: &mut Context,
    name: &str,
    func_id: cranelift_module::FuncId,
    func: ir::Function,
) -> TranslationResult<()> {
    if let Err(errors) = verify_function(&func, ctx.module.isa()) {
        return Err(TranslationError::Verification {
            func: name.to_string(),
            detail: errors.to_string(),
        });
    }
    let mut clif_ctx = cranelift_codegen::Context::for_function(func);
    ctx.module.define_function(func_id, &mut clif_ctx)?;
    Ok(())
}
