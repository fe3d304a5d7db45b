//! Runtime parameters.

/// Knobs for the translation engine and execution context.
#[derive(Debug, Clone, Copy)]
pub struct TranslationConfig {
    /// Size of the contiguous guest memory mapping, in bytes.
    pub guest_memory_size: usize,
    /// Decode window handed to the lifter per translation request.
    pub max_chunk_bytes: usize,
    /// Blocks per chunk when the lifter follows direct jumps.
    pub max_blocks_per_chunk: usize,
    /// Packets per block before a synthetic continuation closes it.
    pub max_packets_per_block: usize,
    /// Initial capacity of a translation's code buffer; it grows by
    /// doubling while the writer owns it.
    pub code_buffer_capacity: usize,
    /// Record disassembly strings on packets.
    pub debug_disasm: bool,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            guest_memory_size: 64 * 1024 * 1024,
            max_chunk_bytes: 4096,
            max_blocks_per_chunk: 8,
            max_packets_per_block: 64,
            code_buffer_capacity: 16 * 1024,
            debug_disasm: false,
        }
    }
}
