//! The translation engine: lookup, translate, install, chain.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use arancini_x86::{DisassemblySyntax, LiftLimits, X86Lifter};

use crate::config::TranslationConfig;
use crate::dbt::cache::TranslationCache;
use crate::dbt::helpers::HelperTable;
use crate::dbt::translation::Translation;
use crate::error::{BackendError, TranslationError};
use crate::exec::GuestMemory;
use crate::output::arm64::Arm64Encoder;
use crate::output::riscv64::Riscv64Encoder;
use crate::output::writer::CodeWriter;
use crate::output::x86::X86Encoder;
use crate::output::{schedule, Encoder, HostArch, TranslationContext};

/// An outgoing edge waiting for its successor to be translated.
#[derive(Debug)]
struct PendingSite {
    from: Arc<Translation>,
    site: usize,
}

/// A chain patch that has been applied, kept so invalidation can revert
/// it.
#[derive(Debug)]
struct AppliedPatch {
    from: Arc<Translation>,
    site: usize,
    target_pc: u64,
}

#[derive(Debug, Default)]
struct ChainState {
    pending: HashMap<u64, Vec<PendingSite>>,
    applied: Vec<AppliedPatch>,
}

/// Shared translation engine: the lifter, the cache, one host encoder
/// and the chain bookkeeping.
///
/// Translation itself is synchronous and runs on the requesting thread;
/// the encoder lock serializes code generation while lookups stay
/// concurrent.
pub struct TranslationEngine {
    lifter: X86Lifter,
    cache: TranslationCache,
    encoder: Mutex<Box<dyn Encoder>>,
    chain: Mutex<ChainState>,
    config: TranslationConfig,
}

impl TranslationEngine {
    /// Engine with the backend for the running host. Hosts without a
    /// backend fall back to the x86-64 encoder; its output can be
    /// inspected but not invoked there.
    pub fn new(config: TranslationConfig) -> Self {
        let helpers = Arc::new(HelperTable::default());
        let encoder: Box<dyn Encoder> = match HostArch::native() {
            Some(HostArch::Arm64) => Box::new(Arm64Encoder::new()),
            Some(HostArch::Riscv64) => Box::new(Riscv64Encoder::new()),
            _ => Box::new(X86Encoder::new(helpers)),
        };

        Self::with_encoder(config, encoder)
    }

    /// Engine over an explicit backend.
    pub fn with_encoder(config: TranslationConfig, encoder: Box<dyn Encoder>) -> Self {
        let syntax = DisassemblySyntax::Intel;
        let lifter = X86Lifter::new(syntax, config.debug_disasm).with_limits(LiftLimits {
            max_packets_per_block: config.max_packets_per_block,
            max_blocks: config.max_blocks_per_chunk,
        });

        Self {
            lifter,
            cache: TranslationCache::new(),
            encoder: Mutex::new(encoder),
            chain: Mutex::new(ChainState::default()),
            config,
        }
    }

    /// The installed translations.
    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    /// Translation for `pc`, translating on a miss.
    pub fn get_translation(&self, pc: u64, memory: &GuestMemory) -> Result<Arc<Translation>, TranslationError> {
        if let Some(t) = self.cache.lookup(pc) {
            return Ok(t);
        }

        self.translate(pc, memory)
    }

    /// Decode, lift and lower the chunk at `pc`, installing every block.
    pub fn translate(&self, pc: u64, memory: &GuestMemory) -> Result<Arc<Translation>, TranslationError> {
        let window = memory
            .window(pc, self.config.max_chunk_bytes)
            .ok_or(TranslationError::PcOutOfBounds { pc })?;

        let chunk = self.lifter.translate_chunk(pc, window, false)?;
        debug_assert!(chunk.validate().is_ok(), "lifter produced ill-formed IR");

        tracing::debug!(
            pc,
            blocks = chunk.blocks().len(),
            packets = chunk.packet_count(),
            "translate"
        );

        let mut encoder = self.encoder.lock();

        for block in chunk.blocks() {
            if self.cache.lookup(block.address()).is_some() {
                continue;
            }

            let translation = self.lower_block(&mut **encoder, block)?;
            let (installed, won) = self.cache.insert(block.address(), translation);
            if won {
                self.wire_chains(&**encoder, &installed);
            }
        }

        self.cache
            .lookup(pc)
            .ok_or(TranslationError::PcOutOfBounds { pc })
    }

    /// Drop the translation for `pc` and unchain every edge pointing at
    /// it. The backing code is freed once in-flight invocations return.
    pub fn invalidate(&self, pc: u64) -> bool {
        let Some(removed) = self.cache.remove(pc) else {
            return false;
        };

        let encoder = self.encoder.lock();
        let mut chain = self.chain.lock();

        chain.applied.retain(|patch| {
            if patch.from.entry_pc() == pc {
                // The patching translation itself is going away.
                return false;
            }
            if patch.target_pc != pc {
                return true;
            }

            // Point the edge back at the dispatcher return.
            let site = &patch.from.chain_sites()[patch.site];
            if let Err(e) = encoder.patch_chain(site, patch.from.buffer(), patch.from.epilogue_addr()) {
                tracing::warn!(pc, error = %e, "failed to unchain");
            }
            false
        });

        for sites in chain.pending.values_mut() {
            sites.retain(|p| p.from.entry_pc() != pc);
        }

        tracing::debug!(pc, size = removed.size(), "invalidated translation");
        true
    }

    fn lower_block(
        &self,
        encoder: &mut dyn Encoder,
        block: &arancini_ir::Block,
    ) -> Result<Translation, TranslationError> {
        // Fail before emitting anything the backend cannot finish.
        for packet in block.packets() {
            for node in packet.nodes() {
                if !encoder.supports(node.kind()) {
                    return Err(BackendError::UnsupportedNode {
                        backend: "host",
                        node: node.to_string(),
                    }
                    .into());
                }
            }
        }

        let mut writer = CodeWriter::with_capacity(self.config.code_buffer_capacity)?;
        encoder.emit_prologue(&mut writer)?;
        let body_offset = writer.pos();

        let mut ctx = TranslationContext::new(encoder, &mut writer);
        ctx.begin_block()?;
        for packet in block.packets() {
            ctx.begin_instruction(packet)?;
            for idx in schedule(packet) {
                ctx.lower(packet, idx)?;
            }
            ctx.end_instruction()?;
        }
        let exit = ctx.end_block()?;

        let buffer = writer.finalise()?;

        Ok(Translation::new(
            buffer,
            block.address(),
            body_offset,
            exit.epilogue_offset,
            exit.chain_sites,
        ))
    }

    /// Chain the new translation's outgoing edges to existing
    /// successors, and resolve pending edges now satisfiable by it.
    fn wire_chains(&self, encoder: &dyn Encoder, installed: &Arc<Translation>) {
        let mut chain = self.chain.lock();

        for (i, site) in installed.chain_sites().iter().enumerate() {
            match self.cache.lookup(site.target_pc) {
                Some(successor) => {
                    Self::apply_patch(encoder, &mut chain, installed.clone(), i, &successor);
                }
                None => {
                    chain.pending.entry(site.target_pc).or_default().push(PendingSite {
                        from: installed.clone(),
                        site: i,
                    });
                }
            }
        }

        if let Some(waiters) = chain.pending.remove(&installed.entry_pc()) {
            for waiter in waiters {
                Self::apply_patch(encoder, &mut chain, waiter.from, waiter.site, installed);
            }
        }
    }

    fn apply_patch(
        encoder: &dyn Encoder,
        chain: &mut ChainState,
        from: Arc<Translation>,
        site_index: usize,
        to: &Arc<Translation>,
    ) {
        let site = &from.chain_sites()[site_index];

        match encoder.patch_chain(site, from.buffer(), to.body_addr()) {
            Ok(()) => {
                tracing::trace!(
                    from = from.entry_pc(),
                    to = to.entry_pc(),
                    offset = site.offset,
                    "chained"
                );
                chain.applied.push(AppliedPatch {
                    from,
                    site: site_index,
                    target_pc: to.entry_pc(),
                });
            }
            // The edge keeps returning to the dispatcher.
            Err(e) => tracing::debug!(
                from = from.entry_pc(),
                to = to.entry_pc(),
                error = %e,
                "chain attempt failed"
            ),
        }
    }
}

impl std::fmt::Debug for TranslationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationEngine")
            .field("cache_len", &self.cache.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
