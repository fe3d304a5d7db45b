//! Static-mode driver boundary.

use std::fs;

use arancini::output::personality::{OutputEngine, OutputPersonalityKind, StaticOutputEngine};
use arancini::txlat::{TxlatEngine, TxlatError};

#[test]
fn translates_a_flat_image_to_dot() {
    let path = std::env::temp_dir().join(format!("arancini-txlat-{}.bin", std::process::id()));
    // mov rax, 42; ret
    fs::write(&path, [0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xc3]).unwrap();

    let mut out = StaticOutputEngine::new(Vec::new());
    TxlatEngine::new().translate(&path, &mut out).unwrap();
    fs::remove_file(&path).ok();

    assert_eq!(out.kind(), OutputPersonalityKind::Static);
    assert_eq!(out.chunks().len(), 1);

    // Chunks arrive with recorded disassembly and render as dot.
    let packet = &out.chunks()[0].blocks()[0].packets()[0];
    assert_eq!(packet.disassembly(), Some("mov rax,2Ah"));
}

#[test]
fn missing_sources_are_reported() {
    let mut out = StaticOutputEngine::new(Vec::new());
    let err = TxlatEngine::new()
        .translate(std::path::Path::new("/nonexistent/image"), &mut out)
        .unwrap_err();

    assert!(matches!(err, TxlatError::Source { .. }));
}
