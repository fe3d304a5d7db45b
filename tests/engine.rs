//! Translation engine, cache and chaining behavior. These tests only
//! generate and patch code; nothing here executes it, so they run on
//! any host.

use std::sync::Arc;

use arancini::dbt::TranslationEngine;
use arancini::exec::GuestMemory;
use arancini::TranslationConfig;

fn small_config() -> TranslationConfig {
    TranslationConfig {
        guest_memory_size: 64 * 1024,
        ..TranslationConfig::default()
    }
}

fn engine_with_image(code: &[u8]) -> (TranslationEngine, GuestMemory) {
    let memory = GuestMemory::new(64 * 1024).unwrap();
    memory.write(0, code).unwrap();
    (TranslationEngine::new(small_config()), memory)
}

#[rstest::rstest]
#[case::single_block(&[0x90, 0xc3], 1)]
#[case::direct_jump(&[0xeb, 0x02, 0x90, 0x90, 0xc3], 2)]
#[case::conditional(&[0x31, 0xc0, 0x74, 0x01, 0x90, 0xc3], 1)]
fn a_chunk_installs_one_translation_per_block(#[case] code: &[u8], #[case] expected: usize) {
    let (engine, memory) = engine_with_image(code);

    engine.get_translation(0, &memory).unwrap();
    assert_eq!(engine.cache().len(), expected);
}

#[test]
fn lookup_miss_translates_and_installs() {
    let (engine, memory) = engine_with_image(&[0x90, 0xc3]);

    assert!(engine.cache().is_empty());
    let t = engine.get_translation(0, &memory).unwrap();

    assert_eq!(t.entry_pc(), 0);
    assert!(t.size() > 0);
    assert_eq!(engine.cache().len(), 1);
}

#[test]
fn second_lookup_reuses_the_translation() {
    let (engine, memory) = engine_with_image(&[0xc3]);

    let a = engine.get_translation(0, &memory).unwrap();
    let b = engine.get_translation(0, &memory).unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(engine.cache().len(), 1);
}

#[test]
fn out_of_bounds_pc_is_rejected() {
    let (engine, memory) = engine_with_image(&[0xc3]);

    let err = engine.get_translation(1 << 40, &memory).unwrap_err();
    assert!(matches!(
        err,
        arancini::TranslationError::PcOutOfBounds { .. }
    ));
}

#[test]
fn failed_translations_are_not_cached() {
    // cpuid is unsupported.
    let (engine, memory) = engine_with_image(&[0x0f, 0xa2]);

    assert!(engine.get_translation(0, &memory).is_err());
    assert!(engine.cache().is_empty());
}

#[test]
fn a_direct_jump_chunk_installs_both_blocks_and_chains() {
    // jmp +2; nop; nop; ret
    let (engine, memory) = engine_with_image(&[0xeb, 0x02, 0x90, 0x90, 0xc3]);

    let first = engine.get_translation(0, &memory).unwrap();
    let second = engine.cache().lookup(4).expect("jump target translated");

    assert_eq!(first.chain_sites().len(), 1);
    let site = first.chain_sites()[0];
    assert_eq!(site.target_pc, 4);

    // The patch site is naturally aligned for a single-store rewrite.
    let site_addr = first.code_ptr() as usize + site.offset;
    assert_eq!(site_addr % 4, 0);

    // The displacement now lands on the successor's body entry.
    let mut field = [0u8; 4];
    // SAFETY: reading finalised read-executable code.
    unsafe {
        std::ptr::copy_nonoverlapping(first.code_ptr().add(site.offset), field.as_mut_ptr(), 4);
    }
    let rel = i32::from_le_bytes(field) as i64;
    assert_eq!((site_addr as i64 + 4) + rel, second.body_addr() as i64);
}

#[test]
fn invalidation_unchains_predecessors() {
    let (engine, memory) = engine_with_image(&[0xeb, 0x02, 0x90, 0x90, 0xc3]);

    let first = engine.get_translation(0, &memory).unwrap();
    let site = first.chain_sites()[0];

    assert!(engine.invalidate(4));
    assert!(engine.cache().lookup(4).is_none());

    // The edge fell back to the dispatcher return.
    let mut field = [0u8; 4];
    // SAFETY: reading finalised read-executable code.
    unsafe {
        std::ptr::copy_nonoverlapping(first.code_ptr().add(site.offset), field.as_mut_ptr(), 4);
    }
    let rel = i32::from_le_bytes(field) as i64;
    let site_addr = first.code_ptr() as usize + site.offset;
    assert_eq!((site_addr as i64 + 4) + rel, first.epilogue_addr() as i64);

    assert!(!engine.invalidate(4));
}

#[test]
fn retranslation_after_invalidation_keeps_old_buffers_alive() {
    let (engine, memory) = engine_with_image(&[0xc3]);

    let old = engine.get_translation(0, &memory).unwrap();
    engine.invalidate(0);

    let new = engine.get_translation(0, &memory).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));

    // The old buffer is still readable through our reference; it dies
    // only when the last holder drops it.
    assert!(old.size() > 0);
}

#[test]
fn concurrent_first_translation_resolves_to_one_winner() {
    let (engine, memory) = engine_with_image(&[0x90, 0x90, 0xc3]);
    let engine = Arc::new(engine);
    let memory = Arc::new(memory);

    let results: Vec<_> = std::thread::scope(|s| {
        (0..4)
            .map(|_| {
                let engine = engine.clone();
                let memory = memory.clone();
                s.spawn(move || engine.get_translation(0, &memory).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    for t in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], t));
    }
    assert_eq!(engine.cache().len(), 1);
}
