//! Helpers to assemble small RV32 guest objects in memory.

use std::collections::HashMap;
use std::path::Path;

use object::write::{Object, Relocation, SectionId, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationKind, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

use sbt_translate::{Options, TranslationResult, Translator};

pub struct GuestObject {
    obj: Object<'static>,
    text: SectionId,
    syms: HashMap<String, SymbolId>,
}

impl GuestObject {
    pub fn new() -> Self {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::Riscv32, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        GuestObject {
            obj,
            text,
            syms: HashMap::new(),
        }
    }

    /// Append instruction words to `.text`.
    pub fn text(&mut self, words: &[u32]) -> &mut Self {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        self.obj.append_section_data(self.text, &bytes, 4);
        self
    }

    /// Define a function symbol in `.text`.
    pub fn func(&mut self, name: &str, value: u64, size: u64) -> &mut Self {
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(self.text),
            flags: SymbolFlags::None,
        });
        self.syms.insert(name.to_string(), id);
        self
    }

    /// Add a `.data` section with contents and one symbol covering it.
    pub fn data(&mut self, name: &str, bytes: &[u8]) -> &mut Self {
        let sec = self
            .obj
            .add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        self.obj.append_section_data(sec, bytes, 4);
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: bytes.len() as u64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(sec),
            flags: SymbolFlags::None,
        });
        self.syms.insert(name.to_string(), id);
        self
    }

    /// Declare an undefined (external) symbol.
    pub fn external(&mut self, name: &str) -> &mut Self {
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Unknown,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.syms.insert(name.to_string(), id);
        self
    }

    /// Attach a `.text` relocation against a previously added symbol.
    pub fn reloc(&mut self, offset: u64, r_type: u32, sym: &str, addend: i64) -> &mut Self {
        let symbol = self.syms[sym];
        self.obj
            .add_relocation(
                self.text,
                Relocation {
                    offset,
                    size: 0,
                    kind: RelocationKind::Elf(r_type),
                    encoding: RelocationEncoding::Generic,
                    symbol,
                    addend,
                },
            )
            .expect("relocation rejected");
        self
    }

    pub fn build(&mut self) -> Vec<u8> {
        self.obj.write().expect("object assembly failed")
    }
}

/// Translate one in-memory object with the given options.
pub fn translate_with(opts: Options, bytes: &[u8]) -> TranslationResult<Translator> {
    let mut t = Translator::new(opts)?;
    t.translate_bytes(Path::new("test.o"), bytes)?;
    Ok(t)
}

/// Translate with default options.
pub fn translate(bytes: &[u8]) -> TranslationResult<Translator> {
    translate_with(Options::default(), bytes)
}
