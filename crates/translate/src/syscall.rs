//! The generated syscall handler.
//!
//! `rv_syscall(n)` maps RISC-V syscall numbers to host syscall numbers and
//! argument counts with a first switch, then performs the call through the
//! host stubs `syscall0..syscall4` with a second switch over the argument
//! count. Arguments travel through the global register file. Unknown guest
//! syscalls become host `exit(99)`.

use cranelift_codegen::ir::{self, types, AbiParam, InstBuilder, MemFlags, Signature, UserFuncName};
use cranelift_codegen::verifier::verify_function;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Switch};
use cranelift_module::{DataId, FuncId, Linkage, Module};

use crate::context::Context;
use crate::errors::{TranslationError, TranslationResult};
use crate::register_file::{A0, A7, T0};

/// RISC-V syscall number, host syscall number, fixed argument count.
const SYSCALLS: &[(u32, u32, u32)] = &[
    (93, 1, 1), // exit
    (64, 4, 3), // write
];

const HOST_EXIT: u32 = 1;

pub fn generate(ctx: &mut Context) -> TranslationResult<()> {
    let cc = ctx.module.isa().default_call_conv();

    // host syscall stubs: syscallN(nr, arg0..argN-1)
    let mut stubs: Vec<FuncId> = Vec::with_capacity(5);
    for n in 0..5u32 {
        let mut sig = Signature::new(cc);
        for _ in 0..=n {
            sig.params.push(AbiParam::new(types::I32));
        }
        sig.returns.push(AbiParam::new(types::I32));
        stubs.push(
            ctx.module
                .declare_function(&format!("syscall{n}"), Linkage::Import, &sig)?,
        );
    }

    let mut sig = Signature::new(cc);
    sig.params.push(AbiParam::new(types::I32));
    sig.returns.push(AbiParam::new(types::I32));
    let func_id = ctx
        .module
        .declare_function("rv_syscall", Linkage::Export, &sig)?;

    let mut func =
        ir::Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);
    let mut fbc = FunctionBuilderContext::new();
    {
        let mut b = FunctionBuilder::new(&mut func, &mut fbc);
        let ptr_ty = ctx.ptr_ty;
        let xregs = ctx.xregs.clone();

        let load_reg = |b: &mut FunctionBuilder<'_>, module: &mut dyn Module, id: DataId| {
            let gv = module.declare_data_in_func(id, b.func);
            let p = b.ins().symbol_value(ptr_ty, gv);
            b.ins().load(types::I32, MemFlags::trusted(), p, 0)
        };
        let store_reg = |b: &mut FunctionBuilder<'_>,
                         module: &mut dyn Module,
                         id: DataId,
                         v: ir::Value| {
            let gv = module.declare_data_in_func(id, b.func);
            let p = b.ins().symbol_value(ptr_ty, gv);
            b.ins().store(MemFlags::trusted(), v, p, 0);
        };
        let store_reg_imm =
            |b: &mut FunctionBuilder<'_>, module: &mut dyn Module, id: DataId, v: u32| {
                let c = b.ins().iconst(types::I32, v as i32 as i64);
                let gv = module.declare_data_in_func(id, b.func);
                let p = b.ins().symbol_value(ptr_ty, gv);
                b.ins().store(MemFlags::trusted(), c, p, 0);
            };

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        let sw2 = b.create_block();
        let exit = b.create_block();
        let unknown = b.create_block();

        // first switch: guest syscall number selects the host number and
        // the argument count
        b.switch_to_block(entry);
        let sc = b.block_params(entry)[0];
        let mut sw1 = Switch::new();
        let mut rv_cases = Vec::new();
        for &(rv, _, _) in SYSCALLS {
            let bb = b.create_block();
            sw1.set_entry(rv as u128, bb);
            rv_cases.push(bb);
        }
        sw1.emit(&mut b, sc, unknown);

        for (i, &(_, host, nargs)) in SYSCALLS.iter().enumerate() {
            b.switch_to_block(rv_cases[i]);
            store_reg_imm(&mut b, &mut ctx.module, xregs[T0 as usize], nargs);
            store_reg_imm(&mut b, &mut ctx.module, xregs[A7 as usize], host);
            b.ins().jump(sw2, &[]);
        }

        b.switch_to_block(unknown);
        store_reg_imm(&mut b, &mut ctx.module, xregs[T0 as usize], 1);
        store_reg_imm(&mut b, &mut ctx.module, xregs[A7 as usize], HOST_EXIT);
        store_reg_imm(&mut b, &mut ctx.module, xregs[A0 as usize], 99);
        b.ins().jump(sw2, &[]);

        // second switch: perform the call with the selected argument count
        b.switch_to_block(sw2);
        let n = load_reg(&mut b, &mut ctx.module, xregs[T0 as usize]);
        let mut sw2s = Switch::new();
        let mut arg_cases = Vec::new();
        for _ in 0..5 {
            arg_cases.push(b.create_block());
        }
        for (i, &bb) in arg_cases.iter().enumerate() {
            sw2s.set_entry(i as u128, bb);
        }
        sw2s.emit(&mut b, n, arg_cases[0]);

        for (i, &bb) in arg_cases.iter().enumerate() {
            b.switch_to_block(bb);
            let mut args = vec![load_reg(&mut b, &mut ctx.module, xregs[A7 as usize])];
            for k in 0..i {
                args.push(load_reg(&mut b, &mut ctx.module, xregs[A0 as usize + k]));
            }
            let fref = ctx.module.declare_func_in_func(stubs[i], b.func);
            let call = b.ins().call(fref, &args);
            let ret = b.inst_results(call)[0];
            store_reg(&mut b, &mut ctx.module, xregs[A0 as usize], ret);
            b.ins().jump(exit, &[]);
        }

        b.switch_to_block(exit);
        let r = load_reg(&mut b, &mut ctx.module, xregs[A0 as usize]);
        b.ins().return_(&[r]);

        b.seal_all_blocks();
        b.finalize();
    }

    if let Err(errors) = verify_function(&func, ctx.module.isa()) {
        return Err(TranslationError::Verification {
            func: "rv_syscall".into(),
            detail: errors.to_string(),
        });
    }
    let mut clif_ctx = cranelift_codegen::Context::for_function(func);
    ctx.module.define_function(func_id, &mut clif_ctx)?;
    ctx.rv_syscall = Some(func_id);
    Ok(())
}
