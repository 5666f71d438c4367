//! Per-function basic-block management.
//!
//! Guest-addressed blocks live in an ordered map; layout order in the IR
//! function follows ascending guest address. Untracked blocks (synthetic
//! helpers for multi-block lowerings of one instruction) hang off the guest
//! address they belong to. A map from guest PC to the first IR instruction
//! it produced makes splitting an already-filled block possible when a
//! backward branch lands in its middle.

use std::collections::{BTreeMap, HashMap};

use cranelift_codegen::cursor::{Cursor, FuncCursor};
use cranelift_codegen::ir::{self, Block, InstBuilder};

use crate::constants::INSTRUCTION_SIZE;

#[derive(Default)]
pub struct BlockMap {
    map: BTreeMap<u32, Block>,
    untracked: BTreeMap<u32, Vec<Block>>,
    inst_at: HashMap<u32, ir::Inst>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guest addresses of all tracked blocks, ascending.
    pub fn addrs(&self) -> Vec<u32> {
        self.map.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn find(&self, addr: u32) -> Option<Block> {
        self.map.get(&addr).copied()
    }

    /// First tracked block whose address is >= `addr`.
    pub fn lower_bound(&self, addr: u32) -> Option<(u32, Block)> {
        self.map.range(addr..).next().map(|(&a, &b)| (a, b))
    }

    /// Last tracked block whose address is <= `addr`.
    pub fn containing(&self, addr: u32) -> Option<(u32, Block)> {
        self.map.range(..=addr).next_back().map(|(&a, &b)| (a, b))
    }

    /// Create a block keyed by `addr`, placed in layout order just before
    /// the next tracked block.
    pub fn new_bb(&mut self, func: &mut ir::Function, addr: u32) -> Block {
        debug_assert!(!self.map.contains_key(&addr), "duplicate BB {addr:#x}");
        let block = func.dfg.make_block();
        match self.lower_bound(addr) {
            Some((_, before)) => func.layout.insert_block(block, before),
            None => func.layout.append_block(block),
        }
        self.map.insert(addr, block);
        block
    }

    /// Create an untracked helper block tied to `addr`, placed before the
    /// next tracked block after it.
    pub fn new_ubb(&mut self, func: &mut ir::Function, addr: u32) -> Block {
        let block = func.dfg.make_block();
        match self.lower_bound(addr + INSTRUCTION_SIZE) {
            Some((_, before)) => func.layout.insert_block(block, before),
            None => func.layout.append_block(block),
        }
        self.untracked.entry(addr).or_default().push(block);
        block
    }

    /// Record the first IR instruction produced for the guest PC `addr`.
    pub fn record_inst(&mut self, addr: u32, inst: ir::Inst) {
        self.inst_at.insert(addr, inst);
    }

    pub fn first_inst(&self, addr: u32) -> Option<ir::Inst> {
        self.inst_at.get(&addr).copied()
    }

    /// Split the block containing `addr` at the instruction mapped from it.
    /// The new block takes `addr` as its key; the old block falls through.
    pub fn split(&mut self, func: &mut ir::Function, addr: u32) -> Block {
        let (key, old) = self
            .containing(addr)
            .expect("split target precedes every tracked BB");
        assert!(key < addr, "split target is already a BB boundary");
        let first = self
            .first_inst(addr)
            .expect("split target has no mapped instruction");
        debug_assert_eq!(
            func.layout.inst_block(first),
            Some(old),
            "instruction map and BB map disagree"
        );

        let block = func.dfg.make_block();
        match self.lower_bound(addr) {
            Some((_, before)) => func.layout.insert_block(block, before),
            None => func.layout.append_block(block),
        }

        let mut tail = vec![first];
        let mut cur = first;
        while let Some(next) = func.layout.next_inst(cur) {
            tail.push(next);
            cur = next;
        }
        for inst in tail {
            func.layout.remove_inst(inst);
            func.layout.append_inst(inst, block);
        }

        // the old block lost its terminator to the new one
        FuncCursor::new(func).at_bottom(old).ins().jump(block, &[]);

        self.map.insert(addr, block);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::Function;

    fn nop_at(func: &mut Function, block: Block) -> ir::Inst {
        let mut cur = FuncCursor::new(func).at_bottom(block);
        cur.ins().nop();
        func.layout.last_inst(block).unwrap()
    }

    #[test]
    fn split_moves_the_tail_and_falls_through() {
        let mut func = Function::new();
        let mut map = BlockMap::new();
        let bb0 = map.new_bb(&mut func, 0);
        for addr in [0u32, 4, 8] {
            let inst = nop_at(&mut func, bb0);
            map.record_inst(addr, inst);
        }

        let bb4 = map.split(&mut func, 4);
        assert_eq!(map.find(4), Some(bb4));
        assert_eq!(map.addrs(), vec![0, 4]);

        // old block keeps one nop plus the fall-through jump
        let old: Vec<_> = func.layout.block_insts(bb0).collect();
        assert_eq!(old.len(), 2);
        assert!(func.dfg.insts[old[1]].opcode().is_terminator());
        // moved instructions keep their identity
        let new: Vec<_> = func.layout.block_insts(bb4).collect();
        assert_eq!(new.len(), 2);
        assert_eq!(map.first_inst(4), Some(new[0]));
        assert_eq!(map.first_inst(8), Some(new[1]));
    }

    #[test]
    fn ordering_queries() {
        let mut func = Function::new();
        let mut map = BlockMap::new();
        let b0 = map.new_bb(&mut func, 0);
        let b8 = map.new_bb(&mut func, 8);
        assert_eq!(map.lower_bound(1), Some((8, b8)));
        assert_eq!(map.containing(7), Some((0, b0)));
        assert_eq!(map.containing(8), Some((8, b8)));
        // layout order follows guest address order
        let b4 = map.new_bb(&mut func, 4);
        let layout: Vec<_> = func.layout.blocks().collect();
        assert_eq!(layout, vec![b0, b4, b8]);
    }
}
