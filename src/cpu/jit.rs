//! Compiled-block cache
//!
//! Blocks are straight-line runs of decoded instructions inside one page,
//! keyed by virtual PC and validated against their physical start on every
//! lookup (a TLB hit in the common case). A native code generator would
//! plug in behind [`Block`]; here a block is replayed through the
//! interpreter, which keeps the accumulate/finalize/invalidate protocol
//! identical.

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use super::decode::{is_control_transfer, Fetched};
use super::mmu::AccessType;
use super::Hart;
use crate::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Longest block the builder will accumulate
pub const MAX_BLOCK_INSTS: usize = 64;

/// Blocks kept before the cache is dropped wholesale
const MAX_CACHED_BLOCKS: usize = 16 * 1024;

/// A compiled block
#[derive(Clone)]
pub struct Block {
    /// Physical address of the first instruction
    pub phys: u64,
    pub insts: Arc<[Fetched]>,
    generation: u64,
}

/// Block cache - generation counter for bulk invalidation
pub struct BlockCache {
    blocks: HashMap<u64, Block>,
    generation: u64,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    pub fn new() -> Self {
        BlockCache {
            blocks: HashMap::with_capacity(1024),
            generation: 1,
        }
    }

    /// Current block starting at virtual `pc`, if any.
    #[inline]
    pub fn lookup(&self, pc: u64) -> Option<&Block> {
        self.blocks.get(&pc).filter(|b| b.generation == self.generation)
    }

    pub fn insert(&mut self, pc: u64, phys: u64, insts: Vec<Fetched>) {
        if self.blocks.len() >= MAX_CACHED_BLOCKS {
            self.blocks.clear();
        }
        let block = Block { phys, insts: insts.into(), generation: self.generation };
        self.blocks.insert(pc, block);
    }

    /// Invalidate all blocks (fence.i, code-page writes, reset)
    pub fn invalidate_all(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.blocks.values().filter(|b| b.generation == self.generation).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accumulation window for the block being built
pub struct BlockBuilder {
    vpc: u64,
    phys: u64,
    /// Where the next instruction must be to extend the block
    next_pc: u64,
    /// Code epoch observed after marking the page
    epoch: u64,
    insts: Vec<Fetched>,
}

impl BlockBuilder {
    fn new(vpc: u64, phys: u64, epoch: u64) -> Self {
        BlockBuilder { vpc, phys, next_pc: vpc, epoch, insts: Vec::with_capacity(16) }
    }

    pub fn next_pc(&self) -> u64 {
        self.next_pc
    }
}

/// Does an instruction of `len` bytes at `pc` straddle a page boundary?
#[inline]
fn crosses_page(pc: u64, len: u8) -> bool {
    (pc & PAGE_MASK) + len as u64 > PAGE_SIZE
}

impl Hart {
    /// May the instruction at `pc` join (or open) a block?
    #[inline]
    pub(crate) fn block_candidate(&self, pc: u64, f: &Fetched) -> bool {
        self.caps.jit && super::decode::is_compilable(f.inst) && !crosses_page(pc, f.len)
    }

    /// Open an accumulation window at `pc`. Only RAM-backed code is compiled.
    pub(crate) fn begin_block(&mut self, pc: u64) {
        let Ok(phys) = self.translate(pc, AccessType::Instruction) else {
            return;
        };
        // One parcel is enough: a block never runs past its page.
        let Some(off) = self.ram.offset_of(phys, 2) else {
            return;
        };
        // Mark first: a write that lands after this bumps the epoch and
        // the finished block is thrown away.
        self.ram.mark_code(off);
        let epoch = self.ram.code_epoch();
        self.builder = Some(BlockBuilder::new(pc, phys, epoch));
    }

    /// Append an executed instruction; closes the block at a control
    /// transfer, the size cap or the end of the page.
    pub(crate) fn extend_block(&mut self, pc: u64, f: Fetched) {
        let Some(builder) = self.builder.as_mut() else {
            return;
        };
        if builder.next_pc != pc {
            self.finalize_block();
            return;
        }
        builder.insts.push(f);
        builder.next_pc = pc.wrapping_add(f.len as u64);
        let page_end = builder.next_pc >> PAGE_SHIFT != builder.vpc >> PAGE_SHIFT;
        if is_control_transfer(f.inst) || builder.insts.len() >= MAX_BLOCK_INSTS || page_end {
            self.finalize_block();
        }
    }

    /// Close the accumulation window and publish what it holds.
    pub(crate) fn finalize_block(&mut self) {
        let Some(builder) = self.builder.take() else {
            return;
        };
        if builder.insts.is_empty() || builder.epoch != self.ram.code_epoch() {
            return;
        }
        trace!(
            "hart {}: block {:#x} ({} insts) at phys {:#x}",
            self.id(),
            builder.vpc,
            builder.insts.len(),
            builder.phys
        );
        self.blocks.insert(builder.vpc, builder.phys, builder.insts);
        self.stats.blocks_compiled += 1;
    }

    /// Run the cached block at `pc`, executing at most `budget`
    /// instructions. Returns false when there is no usable block and the
    /// caller should interpret instead.
    pub(crate) fn run_block(&mut self, budget: u64) -> bool {
        let Some(block) = self.blocks.lookup(self.pc) else {
            return false;
        };
        let (phys, insts) = (block.phys, block.insts.clone());
        // Translation faults are left to the interpreter to raise.
        if self.translate(self.pc, AccessType::Instruction) != Ok(phys) {
            return false;
        }
        if (insts.len() as u64) > budget {
            return false;
        }
        self.finalize_block();
        self.stats.blocks_executed += 1;

        for f in insts.iter() {
            match self.execute(*f) {
                Ok(()) => self.retire(true),
                Err(trap) => {
                    self.trap(trap);
                    self.retire(false);
                    return true;
                }
            }
            // The block wrote to code (its own or another block's page).
            if self.ram.code_epoch() != self.code_epoch {
                break;
            }
        }
        true
    }
}
