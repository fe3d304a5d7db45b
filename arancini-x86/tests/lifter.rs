//! Lifter behavior on known byte sequences.

use arancini_ir::{
    Chunk, Node, NodeIdx, NodeKind, Packet, PacketType, RegisterUseVisitor, Visitor,
};
use arancini_x86::{offsets, DisassemblySyntax, LiftError, X86Lifter};

fn lift(code: &[u8]) -> Chunk {
    X86Lifter::default()
        .translate_chunk(0, code, false)
        .expect("lift failed")
}

fn single_packet(chunk: &Chunk) -> &Packet {
    assert_eq!(chunk.blocks().len(), 1);
    let packets = chunk.blocks()[0].packets();
    assert_eq!(packets.len(), 1);
    &packets[0]
}

fn find_nodes<'a>(packet: &'a Packet, pred: impl Fn(&Node) -> bool + 'a) -> Vec<&'a Node> {
    packet.nodes().iter().filter(|n| pred(n)).collect()
}

#[test]
fn nop_lifts_to_an_empty_packet() {
    let chunk = lift(&[0x90]);
    let packet = single_packet(&chunk);

    assert_eq!(packet.ty(), PacketType::Normal);
    assert_eq!(packet.address(), 0);
    // Exactly the start and end markers, no state effects.
    assert_eq!(packet.nodes().len(), 2);
    assert!(matches!(packet.nodes()[0].kind(), NodeKind::Start));
    assert!(matches!(packet.nodes()[1].kind(), NodeKind::End));
}

#[test]
fn mov_rax_imm_writes_the_constant() {
    // mov rax, 42
    let chunk = lift(&[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00]);
    let packet = single_packet(&chunk);

    assert_eq!(packet.ty(), PacketType::Normal);

    let writes = find_nodes(packet, |n| matches!(n.kind(), NodeKind::WriteReg { .. }));
    assert_eq!(writes.len(), 1);

    let NodeKind::WriteReg { offset, value } = writes[0].kind() else {
        unreachable!()
    };
    assert_eq!(*offset, offsets::RAX);
    assert!(matches!(
        packet.node(value.node()).kind(),
        NodeKind::Constant { value: 42 }
    ));
    assert_eq!(value.ty().width(), 64);
}

#[test]
fn push_rax_decrements_rsp_then_stores() {
    let chunk = lift(&[0x50]);
    let packet = single_packet(&chunk);

    assert_eq!(packet.ty(), PacketType::Normal);

    // rsp - 8 is written back, then the value is stored at the new top.
    let rsp_writes = find_nodes(packet, |n| {
        matches!(n.kind(), NodeKind::WriteReg { offset, .. } if *offset == offsets::RSP)
    });
    assert_eq!(rsp_writes.len(), 1);

    let stores = find_nodes(packet, |n| matches!(n.kind(), NodeKind::WriteMem { .. }));
    assert_eq!(stores.len(), 1);

    let NodeKind::WriteMem { addr, value } = stores[0].kind() else {
        unreachable!()
    };
    assert!(matches!(
        packet.node(addr.node()).kind(),
        NodeKind::BinaryArith { .. }
    ));
    assert!(matches!(
        packet.node(value.node()).kind(),
        NodeKind::ReadReg { offset } if *offset == offsets::RAX
    ));
}

#[test]
fn ret_pops_and_terminates_the_block() {
    let chunk = lift(&[0xc3]);
    let packet = single_packet(&chunk);

    assert_eq!(packet.ty(), PacketType::Return);

    let pc_writes = find_nodes(packet, |n| matches!(n.kind(), NodeKind::WritePc { .. }));
    assert_eq!(pc_writes.len(), 1);

    let NodeKind::WritePc { value } = pc_writes[0].kind() else {
        unreachable!()
    };
    assert!(matches!(
        packet.node(value.node()).kind(),
        NodeKind::ReadMem { .. }
    ));

    // rsp moves up by 8.
    let rsp_writes = find_nodes(packet, |n| {
        matches!(n.kind(), NodeKind::WriteReg { offset, .. } if *offset == offsets::RSP)
    });
    assert_eq!(rsp_writes.len(), 1);
}

#[test]
fn int3_calls_the_interrupt_handler() {
    let chunk = lift(&[0xcc]);
    let packet = single_packet(&chunk);

    assert_eq!(packet.ty(), PacketType::Interrupt);

    let calls = find_nodes(packet, |n| matches!(n.kind(), NodeKind::InternalCall { .. }));
    assert_eq!(calls.len(), 1);

    let NodeKind::InternalCall { func, args } = calls[0].kind() else {
        unreachable!()
    };
    assert_eq!(func.name(), "handle_int");
    assert_eq!(args.len(), 1);
    assert!(matches!(
        packet.node(args[0].node()).kind(),
        NodeKind::Constant { value: 3 }
    ));
}

#[test]
fn direct_jump_produces_a_two_block_chunk() {
    // jmp +2; nop; nop; ret — the decoder follows the jump, skipping
    // the dead nops.
    let chunk = lift(&[0xeb, 0x02, 0x90, 0x90, 0xc3]);

    assert_eq!(chunk.blocks().len(), 2);

    let first = &chunk.blocks()[0];
    assert_eq!(first.address(), 0);
    assert_eq!(first.packets().len(), 1);
    assert_eq!(first.packets()[0].ty(), PacketType::Branch);

    let NodeKind::WritePc { value } = first.packets()[0]
        .nodes()
        .iter()
        .find_map(|n| matches!(n.kind(), NodeKind::WritePc { .. }).then(|| n.kind()))
        .expect("branch packet writes the pc")
    else {
        unreachable!()
    };
    assert!(matches!(
        first.packets()[0].node(value.node()).kind(),
        NodeKind::Constant { value: 4 }
    ));

    let second = chunk.block_at(4).expect("jump target becomes a block");
    assert_eq!(second.packets().len(), 1);
    assert_eq!(second.packets()[0].ty(), PacketType::Return);
}

#[test]
fn syscall_and_hlt_use_their_helpers() {
    let chunk = lift(&[0x0f, 0x05]);
    assert_eq!(single_packet(&chunk).ty(), PacketType::Syscall);

    let chunk = lift(&[0xf4]);
    assert_eq!(single_packet(&chunk).ty(), PacketType::EndOfBlock);
}

#[test]
fn add_updates_the_arithmetic_flags() {
    // add rax, rbx
    let chunk = lift(&[0x48, 0x01, 0xd8]);
    let packet = single_packet(&chunk);

    for flag in [offsets::ZF, offsets::CF, offsets::OF, offsets::SF, offsets::PF] {
        let writes = find_nodes(packet, |n| {
            matches!(n.kind(), NodeKind::WriteReg { offset, .. } if *offset == flag)
        });
        assert_eq!(writes.len(), 1, "flag slot {flag} written once");
    }

    // DF is untouched by arithmetic.
    assert!(find_nodes(packet, |n| {
        matches!(n.kind(), NodeKind::WriteReg { offset, .. } if *offset == offsets::DF)
    })
    .is_empty());
}

#[test]
fn cld_and_std_only_touch_df() {
    for (byte, expected) in [(0xfcu8, 0u64), (0xfd, 1)] {
        let chunk = lift(&[byte]);
        let packet = single_packet(&chunk);

        let writes = find_nodes(packet, |n| matches!(n.kind(), NodeKind::WriteReg { .. }));
        assert_eq!(writes.len(), 1);

        let NodeKind::WriteReg { offset, value } = writes[0].kind() else {
            unreachable!()
        };
        assert_eq!(*offset, offsets::DF);
        assert!(matches!(
            packet.node(value.node()).kind(),
            NodeKind::Constant { value: v } if *v == expected
        ));
    }
}

#[test]
fn fs_override_adds_the_segment_base() {
    // mov rax, fs:[0x10]
    let chunk = lift(&[0x64, 0x48, 0x8b, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00]);
    let packet = single_packet(&chunk);

    let reads = find_nodes(packet, |n| {
        matches!(n.kind(), NodeKind::ReadReg { offset } if *offset == offsets::FS)
    });
    assert_eq!(reads.len(), 1);
}

#[test]
fn unsupported_opcodes_are_reported_with_their_class() {
    // cpuid has no rule.
    let err = X86Lifter::default()
        .translate_chunk(0, &[0x0f, 0xa2], false)
        .unwrap_err();

    assert!(matches!(err, LiftError::UnsupportedInstruction { .. }));
}

#[test]
fn invalid_bytes_fail_to_decode() {
    let err = X86Lifter::default()
        .translate_chunk(0x100, &[0x06], false)
        .unwrap_err();

    assert!(matches!(err, LiftError::InvalidInstruction { address: 0x100 }));
}

#[test]
fn lifting_twice_is_structurally_equal() {
    let code = [0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0x50, 0xc3];
    let lifter = X86Lifter::default();

    let a = lifter.translate_chunk(0, &code, false).unwrap();
    let b = lifter.translate_chunk(0, &code, false).unwrap();

    assert_eq!(a, b);
}

#[rstest::rstest]
#[case::nop(&[0x90])]
#[case::add_rr(&[0x48, 0x01, 0xd8])]
#[case::push_pop(&[0x50, 0x58])]
#[case::jmp_ret(&[0xeb, 0x02, 0x90, 0x90, 0xc3])]
#[case::shl_cl(&[0x48, 0xd3, 0xe0])]
#[case::shr_imm(&[0x48, 0xc1, 0xe8, 0x07])]
#[case::jcc(&[0x74, 0x05])]
#[case::paddd(&[0x66, 0x0f, 0xfe, 0xc1])]
#[case::call(&[0xe8, 0x00, 0x00, 0x00, 0x00])]
fn every_chunk_satisfies_port_typing(#[case] code: &[u8]) {
    let chunk = lift(code);
    chunk.validate().expect("type agreement");
}

#[derive(Default)]
struct CountingVisitor {
    packets: usize,
    nodes: usize,
    addresses: Vec<u64>,
}

impl Visitor for CountingVisitor {
    fn visit_packet_start(&mut self, packet: &Packet) -> bool {
        self.packets += 1;
        self.addresses.push(packet.address());
        true
    }

    fn visit_node(&mut self, _packet: &Packet, _idx: NodeIdx) {
        self.nodes += 1;
    }
}

#[test]
fn a_passive_visitor_sees_every_node_once() {
    let chunk = lift(&[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xc3]);

    let mut counter = CountingVisitor::default();
    chunk.accept(&mut counter);

    let expected_nodes: usize = chunk
        .blocks()
        .iter()
        .flat_map(|b| b.packets())
        .map(|p| p.nodes().len())
        .sum();

    assert_eq!(counter.packets, chunk.packet_count());
    assert_eq!(counter.nodes, expected_nodes);
    assert_eq!(counter.addresses, vec![0, 7]);
}

#[test]
fn register_use_reflects_touched_slots() {
    // push rax
    let chunk = lift(&[0x50]);

    let mut usage = RegisterUseVisitor::new();
    chunk.accept(&mut usage);

    assert!(usage.read().contains(&offsets::RAX));
    assert!(usage.read().contains(&offsets::RSP));
    assert!(usage.written().contains(&offsets::RSP));
    assert!(!usage.written().contains(&offsets::RAX));
}

#[test]
fn disassembly_is_recorded_in_debug_mode() {
    let lifter = X86Lifter::new(DisassemblySyntax::Intel, true);
    let chunk = lifter.translate_chunk(0, &[0x90], false).unwrap();
    let packet = &chunk.blocks()[0].packets()[0];

    assert_eq!(packet.disassembly(), Some("nop"));
}
