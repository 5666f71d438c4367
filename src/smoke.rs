//! The built-in smoke path behind `--test`: synthesize a tiny guest object
//! in memory, translate it, and print the resulting IR.

use std::path::Path;

use object::write::{Object, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

use sbt_translate::{Options, Translator};

/// addi t0, zero, 5 ; addi t1, zero, 7 ; add t2, t0, t1 ;
/// addi a0, zero, 0 ; ret
const SMOKE_TEXT: [u32; 5] = [0x00500293, 0x00700313, 0x006283B3, 0x00000513, 0x00008067];

fn build_guest_object() -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Riscv32, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    let mut bytes = Vec::new();
    for w in SMOKE_TEXT {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    obj.append_section_data(text, &bytes, 4);
    obj.add_symbol(Symbol {
        name: b"main".to_vec(),
        value: 0,
        size: bytes.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    obj.write().expect("smoke object assembly failed")
}

pub fn run(opts: Options) -> anyhow::Result<()> {
    let mut translator = Translator::new(opts)?;
    let bytes = build_guest_object();
    translator.translate_bytes(Path::new("smoke.o"), &bytes)?;

    let ir = translator
        .function_ir("main")
        .expect("smoke main was not translated");
    println!("{ir}");

    let out = translator.finish()?;
    println!("sbt: smoke translation produced a {}-byte host object", out.len());
    Ok(())
}
