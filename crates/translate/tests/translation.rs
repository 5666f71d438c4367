//! End-to-end translation scenarios over synthesized guest objects.

mod common;

use common::{translate, translate_with, GuestObject};
use object::elf;
use object::{Object as _, ObjectSymbol as _};
use sbt_translate::{Options, RegMode, TranslationError, FIRST_EXT_FUNC_ADDR};

// ---- instruction words used below ----

const RET: u32 = 0x00008067; // jalr zero, 0(ra)
const ECALL: u32 = 0x00000073;

#[test]
fn alu_smoke() {
    // addi t0, zero, 5 ; addi t1, zero, 7 ; add t2, t0, t1 ; ret
    let words = [0x00500293, 0x00700313, 0x006283B3, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("calc", 0, 16)
        .build();
    let t = translate(&bytes).unwrap();

    let info = t.functions().find(|f| f.name == "calc").unwrap();
    assert!(info.translated);
    assert_eq!(info.bb_addrs, vec![0]);
    assert!(info.xreg_writes[5] > 0);
    assert!(info.xreg_writes[6] > 0);
    assert!(info.xreg_writes[7] > 0);
    assert_eq!(info.xreg_writes[0], 0);

    let clif = t.function_ir("calc").unwrap();
    assert!(clif.contains("iadd"));
    assert!(clif.contains("return"));
}

#[test]
fn writes_to_x0_are_discarded() {
    // addi zero, t0, 1 ; ret
    let words = [0x00128013, RET];
    let bytes = GuestObject::new().text(&words).func("zw", 0, 8).build();
    let t = translate(&bytes).unwrap();

    let info = t.functions().next().unwrap();
    assert_eq!(info.xreg_writes[0], 0);
    assert!(info.xreg_reads[5] > 0);
    // no register store at all: the only write targeted x0
    let clif = t.function_ir("zw").unwrap();
    assert!(!clif.contains("store"));
}

#[test]
fn conditional_branch_with_back_edge() {
    // loop: addi t0, t0, -1 ; bne t0, zero, loop ; ret
    let words = [0xFFF28293, 0xFE029EE3, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("count", 0, 12)
        .build();
    let t = translate(&bytes).unwrap();

    let info = t.functions().next().unwrap();
    // one block at the loop head, one fall-through block
    assert_eq!(info.bb_addrs, vec![0, 8]);
    let clif = t.function_ir("count").unwrap();
    assert!(clif.contains("brif"));
}

#[test]
fn backward_branch_into_block_middle_splits_it() {
    // addi t0, zero, 5 ; addi t1, zero, 7 ; bne t0, t1, -4 ; ret
    let words = [0x00500293, 0x00700313, 0xFE629EE3, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("again", 0, 16)
        .build();
    let t = translate(&bytes).unwrap();

    let info = t.functions().next().unwrap();
    assert_eq!(info.bb_addrs, vec![0, 4, 12]);
    // block keys stay strictly increasing and inside the function
    assert!(info.bb_addrs.windows(2).all(|w| w[0] < w[1]));
    assert!(info.bb_addrs.iter().all(|&a| a < 16));
}

#[test]
fn symbolic_call_through_pcrel_pair() {
    // foo: ret
    // main: auipc ra, %hi(foo) ; jalr ra, %lo(foo) ; a0 = 0 ; ret
    let words = [RET, 0x00000097, 0x000080E7, 0x00000513, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("foo", 0, 4)
        .func("main", 4, 16)
        .reloc(4, elf::R_RISCV_CALL, "foo", 0)
        .build();
    let t = translate(&bytes).unwrap();

    assert!(t.functions().all(|f| f.translated));
    // the call is direct: nothing was imported, the icaller is not involved
    assert_eq!(t.imports().count(), 0);
    let clif = t.function_ir("main").unwrap();
    assert!(clif.contains("call fn"));
}

#[test]
fn ecall_routes_through_rv_syscall() {
    // a0 = 1 ; a1 = 100 ; a2 = 3 ; a7 = 64 ; ecall    (write)
    // a0 = 0 ; a7 = 93 ; ecall ; ret                  (exit)
    let words = [
        0x00100513, 0x06400593, 0x00300613, 0x04000893, ECALL, 0x00000513, 0x05D00893, ECALL,
        RET,
    ];
    let bytes = GuestObject::new()
        .text(&words)
        .func("main", 0, 36)
        .build();
    let t = translate(&bytes).unwrap();

    let clif = t.function_ir("main").unwrap();
    // the runtime init call plus one rv_syscall call per ecall
    assert_eq!(clif.matches("call fn").count(), 3);

    let info = t.functions().next().unwrap();
    assert!(info.xreg_reads[17] >= 2, "a7 feeds the syscall number");
    assert!(info.xreg_writes[10] >= 2, "a0 receives the result");
}

#[test]
fn external_call_with_varargs() {
    // a0 = 1 ; a1 = 2 ; a2 = 3 ; call printf ; ret
    let words = [
        0x00100513, 0x00200593, 0x00300613, 0x00000097, 0x000080E7, RET,
    ];
    let bytes = GuestObject::new()
        .text(&words)
        .func("main", 0, 24)
        .external("printf")
        .reloc(12, elf::R_RISCV_CALL, "printf", 0)
        .build();
    let t = translate(&bytes).unwrap();

    let imports: Vec<_> = t.imports().collect();
    assert_eq!(imports, vec![("printf", FIRST_EXT_FUNC_ADDR)]);

    let info = t.functions().next().unwrap();
    // printf marshals five words: a0..a2 are live, a3 was never written and
    // the collection switches to constant zero there
    assert!(info.xreg_reads[10] > 0);
    assert!(info.xreg_reads[11] > 0);
    assert!(info.xreg_reads[12] > 0);
    assert_eq!(info.xreg_reads[13], 0);
}

#[test]
fn indirect_call_goes_through_the_icaller() {
    // helper: ret
    // main: t1 = 0 ; jalr ra, 0(t1) ; ret
    let words = [RET, 0x00000313, 0x000300E7, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("helper", 0, 4)
        .func("main", 4, 16)
        .build();
    let t = translate(&bytes).unwrap();

    let info = t.functions().find(|f| f.name == "main").unwrap();
    // the eight argument words are forwarded from a0..a7
    for r in 10..18 {
        assert!(info.xreg_reads[r] > 0, "x{r} must feed the icaller");
    }

    // the finished module carries the generated dispatcher
    let out = t.finish().unwrap();
    let file = object::File::parse(&*out).unwrap();
    let names: Vec<_> = file.symbols().filter_map(|s| s.name().ok()).collect();
    assert!(names.contains(&"rv32_icaller"));
    assert!(names.contains(&"rv32_isExternal"));
}

#[test]
fn indirect_jump_with_registered_label() {
    // jumper:
    //   auipc t1, %pcrel_hi(jumper+12) ; addi t1, t1, %pcrel_lo
    //   jalr zero, 0(t1)
    //   a0 = 0    <- the label
    //   ret
    let words = [0x00000317, 0x00030313, 0x00030067, 0x00000513, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("jumper", 0, 20)
        .reloc(0, elf::R_RISCV_PCREL_HI20, "jumper", 12)
        .reloc(4, elf::R_RISCV_PCREL_LO12_I, "jumper", 12)
        .build();
    let t = translate(&bytes).unwrap();

    let info = t.functions().next().unwrap();
    assert!(info.bb_addrs.contains(&12), "label block was registered");
}

#[test]
fn indirect_jump_without_targets_is_an_error() {
    // t1 = 16 ; jalr zero, 0(t1) ; ret
    let words = [0x01000313, 0x00030067, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("wild", 0, 12)
        .build();
    match translate(&bytes) {
        Err(TranslationError::EmptyIndirectTargetSet { addr, func }) => {
            assert_eq!(addr, 4);
            assert_eq!(func, "wild");
        }
        other => panic!("expected EmptyIndirectTargetSet, got {other:?}"),
    }
}

#[test]
fn data_relocation_resolves_into_the_shadow_image() {
    // lui a0, %hi(msg) ; addi a0, a0, %lo(msg) ; lw a1, 0(a0) ; ret
    let words = [0x00000537, 0x00050513, 0x00052583, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("reader", 0, 16)
        .data("msg", b"Hi\n\0")
        .reloc(0, elf::R_RISCV_HI20, "msg", 0)
        .reloc(4, elf::R_RISCV_LO12_I, "msg", 0)
        .build();
    let t = translate(&bytes).unwrap();

    let clif = t.function_ir("reader").unwrap();
    // address arithmetic from the image base, masked hi and lo
    assert!(clif.matches("band").count() >= 2);
    assert!(clif.contains("symbol_value") || clif.contains("global_value"));
}

#[test]
fn division_follows_riscv_semantics() {
    // div t2, t0, t1 ; ret
    let words = [0x0262C3B3, RET];
    let bytes = GuestObject::new().text(&words).func("quot", 0, 8).build();
    let t = translate(&bytes).unwrap();

    let clif = t.function_ir("quot").unwrap();
    assert!(clif.contains("sdiv"));
    // the zero-divisor guard branches to helper blocks
    assert!(clif.contains("brif"));
    assert!(clif.contains("select"));
}

#[test]
fn float_arithmetic_translates() {
    // flw fa0, 0(a0) ; fadd.s fa0, fa0, fa0 ; fsw fa0, 0(a0) ; ret
    let words = [0x00052507, 0x00A57553, 0x00A52027, RET];
    let bytes = GuestObject::new().text(&words).func("fsum", 0, 16).build();
    let t = translate(&bytes).unwrap();

    let clif = t.function_ir("fsum").unwrap();
    assert!(clif.contains("fadd"));
    assert!(clif.contains("bitcast"));
}

#[test]
fn trailing_zero_padding_is_consumed() {
    let words = [0x00500293, RET, 0, 0, 0];
    let bytes = GuestObject::new().text(&words).func("padded", 0, 20).build();
    let t = translate(&bytes).unwrap();
    assert!(t.functions().next().unwrap().translated);
}

#[test]
fn nonzero_word_inside_padding_is_an_error() {
    let words = [0x00500293, RET, 0, 0x00500293];
    let bytes = GuestObject::new().text(&words).func("broken", 0, 16).build();
    match translate(&bytes) {
        Err(TranslationError::NonZeroByteInPadding { addr }) => assert_eq!(addr, 12),
        other => panic!("expected NonZeroByteInPadding, got {other:?}"),
    }
}

#[test]
fn unknown_relocation_type_is_an_error() {
    // jal zero, 8 with an unsupported R_RISCV_JAL relocation
    let words = [0x0080006F, RET, RET];
    let bytes = GuestObject::new()
        .text(&words)
        .func("jmp", 0, 12)
        .external("elsewhere")
        .reloc(0, elf::R_RISCV_JAL, "elsewhere", 0)
        .build();
    match translate(&bytes) {
        Err(TranslationError::UnknownRelocationType { rtype, addr }) => {
            assert_eq!(rtype, elf::R_RISCV_JAL);
            assert_eq!(addr, 0);
        }
        other => panic!("expected UnknownRelocationType, got {other:?}"),
    }
}

#[test]
fn local_register_mode_uses_slots() {
    let words = [0x00500293, 0x00700313, 0x006283B3, RET];
    let bytes = GuestObject::new().text(&words).func("calc", 0, 16).build();
    let opts = Options {
        regs: RegMode::Locals,
        ..Options::default()
    };
    let t = translate_with(opts, &bytes).unwrap();

    let clif = t.function_ir("calc").unwrap();
    assert!(clif.contains("stack_store"));
    assert!(clif.contains("stack_load"));
}

#[test]
fn translation_is_idempotent() {
    let words = [0x00500293, 0x00700313, 0x006283B3, RET];
    let bytes = GuestObject::new().text(&words).func("calc", 0, 16).build();
    let a = translate(&bytes).unwrap().finish().unwrap();
    let b = translate(&bytes).unwrap().finish().unwrap();
    assert_eq!(a, b);
}

#[test]
fn emitted_module_inventory() {
    let words = [0x00000513, RET];
    let bytes = GuestObject::new().text(&words).func("main", 0, 8).build();
    let out = translate(&bytes).unwrap().finish().unwrap();

    let file = object::File::parse(&*out).unwrap();
    let names: Vec<String> = file
        .symbols()
        .filter_map(|s| s.name().ok().map(str::to_string))
        .collect();
    for expected in [
        "main",
        "rv_syscall",
        "rv32_icaller",
        "rv32_isExternal",
        "ShadowMemory",
        "Stack",
        "rv_x1",
        "rv_x31",
        "rv_f0",
        "rv_fcsr",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
}

#[test]
fn syscall_handler_module_alone() {
    let t = sbt_translate::Translator::new(Options::default()).unwrap();
    let out = t.finish_syscall_module().unwrap();
    let file = object::File::parse(&*out).unwrap();
    let names: Vec<_> = file.symbols().filter_map(|s| s.name().ok()).collect();
    assert!(names.contains(&"rv_syscall"));
    assert!(!names.contains(&"rv32_icaller"));
}
