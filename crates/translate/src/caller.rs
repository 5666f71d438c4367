//! External-function calls: collect argument words from the a-registers,
//! coerce them to the import's declared parameter types, emit the call and
//! route the return value back into the guest register file.

use cranelift_codegen::ir::{types, InstBuilder, MemFlags, Value};
use smallvec::SmallVec;

use crate::errors::TranslationResult;
use crate::func_translator::{Emitter, FuncTranslator};
use crate::libc::{ArgType, ExtSig, Import, RetType};
use crate::register_file::{SyncDirection, SyncFlags, A0, A1, A7};

/// How the called function returned its value.
pub(crate) enum CallRet {
    None,
    I32(Value),
    /// A 64-bit value split into the low and high words for `a0`/`a1`.
    PairLoHi(Value, Value),
}

/// Number of argument words the marshaled call consumes, including the
/// return-by-reference pointer of 128-bit float returns.
pub(crate) fn word_count(sig: &ExtSig) -> usize {
    let mut words = 0;
    for i in 0..sig.total_args() {
        words += sig.args.get(i).map_or(1, |a| a.words());
    }
    if sig.ret == RetType::F128 {
        words += 1;
    }
    words
}

/// Coerce `words` into the import's parameter list, call it, and classify
/// the return. Context-independent so both guest call sites and the icaller
/// can use it.
pub(crate) fn marshal_and_call(
    em: &mut Emitter,
    sig: &ExtSig,
    func_id: cranelift_module::FuncId,
    words: &[Value],
) -> CallRet {
    let mut it = words.iter().copied();
    let mut next = || it.next().expect("argument word list ran dry");

    let mut args: SmallVec<[Value; 8]> = SmallVec::new();
    if sig.ret == RetType::F128 {
        // the callee writes its result through this reference
        let r = next();
        args.push(r);
    }

    for i in 0..sig.total_args() {
        let v = next();
        match sig.args.get(i) {
            // fixed i32 parameters and variadic word slots
            Some(ArgType::I32) | None => args.push(v),
            Some(ArgType::F32) => {
                let f = em.cur().ins().bitcast(types::F32, MemFlags::new(), v);
                args.push(f);
            }
            Some(ArgType::F64) => {
                let hi = next();
                let lo64 = em.cur().ins().uextend(types::I64, v);
                let hi64 = em.cur().ins().uextend(types::I64, hi);
                let hi_sh = em.cur().ins().ishl_imm(hi64, 32);
                let merged = em.cur().ins().bor(hi_sh, lo64);
                let f = em.cur().ins().bitcast(types::F64, MemFlags::new(), merged);
                args.push(f);
            }
            Some(ArgType::F128) => {
                // the word is the address of the 128-bit value
                let p = em.guest_ptr(v);
                let x = em.cur().ins().load(types::I128, MemFlags::new(), p, 0);
                args.push(x);
            }
        }
    }

    let rets = em.call_fn(func_id, &args);
    match sig.ret {
        RetType::Void => CallRet::None,
        RetType::I32 => CallRet::I32(rets[0]),
        RetType::F32 => {
            let v = em.cur().ins().bitcast(types::I32, MemFlags::new(), rets[0]);
            CallRet::I32(v)
        }
        RetType::F64 => {
            let bits = em.cur().ins().bitcast(types::I64, MemFlags::new(), rets[0]);
            let lo = em.cur().ins().ireduce(types::I32, bits);
            let hi64 = em.cur().ins().ushr_imm(bits, 32);
            let hi = em.cur().ins().ireduce(types::I32, hi64);
            CallRet::PairLoHi(lo, hi)
        }
        RetType::F128 => CallRet::None,
    }
}

/// Emit a complete external call at a guest call site. With `tail` set the
/// call is followed by a function return (a `jalr x0` to an import).
pub(crate) fn emit_external_call(
    ft: &mut FuncTranslator,
    import: &Import,
    tail: bool,
) -> TranslationResult<()> {
    let sig = import
        .sig
        .clone()
        .expect("external call target is a data import");
    let func_id = import.func.expect("external call target has no FuncId");

    let sync = ft.regs.local() && ft.ctx.opts.sync_on_external_calls;
    if sync {
        ft.sync_regs(SyncDirection::Store, SyncFlags::CALL);
    }

    let words = collect_arg_words(ft, word_count(&sig));
    let ret = ft.emit(|em| marshal_and_call(em, &sig, func_id, &words));
    route_return(ft, ret);

    if sync {
        ft.sync_regs(SyncDirection::Load, SyncFlags::CALL_RETURNED);
    }
    if tail {
        ft.freturn()?;
    }
    Ok(())
}

/// Read `n` argument words from `a0..`, switching to constant zero at the
/// first register the function never wrote (and past `a7`).
fn collect_arg_words(ft: &mut FuncTranslator, n: usize) -> SmallVec<[Value; 8]> {
    let mut words: SmallVec<[Value; 8]> = SmallVec::new();
    let mut pass_zero = false;
    for i in 0..n {
        let r = A0 + i as u8;
        if r > A7 || (!pass_zero && !ft.xreg_written(r)) {
            pass_zero = true;
        }
        let v = if pass_zero {
            ft.emit(|em| em.iconst32(0))
        } else {
            ft.read_xreg(r)
        };
        words.push(v);
    }
    words
}

fn route_return(ft: &mut FuncTranslator, ret: CallRet) {
    match ret {
        CallRet::None => {}
        CallRet::I32(v) => ft.write_xreg(A0, v),
        CallRet::PairLoHi(lo, hi) => {
            ft.write_xreg(A0, lo);
            ft.write_xreg(A1, hi);
        }
    }
}
