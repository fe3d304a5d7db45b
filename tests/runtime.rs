//! End-to-end execution of translated guest code. Host-specific: these
//! run the emitted code, so they need an x86-64 Linux host.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use arancini::dbt::helpers::STATUS_HALT as HALT;
use arancini::exec::ExecutionContext;
use arancini::TranslationConfig;

const STACK_TOP: u64 = 0x1000;

fn context() -> ExecutionContext {
    ExecutionContext::new(TranslationConfig {
        guest_memory_size: 64 * 1024,
        ..TranslationConfig::default()
    })
    .unwrap()
}

#[test]
fn mov_rax_imm_shows_up_in_cpu_state() {
    let ctx = context();
    // mov rax, 42; hlt
    ctx.load_image(0, &[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xf4]).unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP);
    let status = ctx.invoke(&thread).unwrap();

    assert_eq!(status, HALT);
    thread.with_state(|s| {
        assert_eq!(s.rax, 42);
        // The halt packet resumes past itself.
        assert_eq!(s.pc, 8);
    });
    assert_eq!(thread.chain_address(), 8);
}

#[test]
fn push_rax_stores_little_endian_below_rsp() {
    let ctx = context();
    // push rax; hlt
    ctx.load_image(0, &[0x50, 0xf4]).unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP);
    thread.with_state(|s| s.rax = 7);

    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    thread.with_state(|s| assert_eq!(s.rsp, STACK_TOP - 8));

    let mut stored = [0u8; 8];
    ctx.memory().read(STACK_TOP - 8, &mut stored).unwrap();
    assert_eq!(u64::from_le_bytes(stored), 7);
}

#[test]
fn ret_returns_through_the_stack() {
    let ctx = context();
    ctx.load_image(0, &[0xc3]).unwrap();
    // Return target: a lone hlt.
    ctx.load_image(0x4142, &[0xf4]).unwrap();
    ctx.load_image(STACK_TOP - 8, &0x4142u64.to_le_bytes()).unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP - 8);
    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    thread.with_state(|s| {
        assert_eq!(s.rsp, STACK_TOP);
        assert_eq!(s.pc, 0x4143);
    });
}

#[test]
fn call_pushes_the_return_address() {
    let ctx = context();
    // call +0 (to 5); at 5: hlt
    ctx.load_image(0, &[0xe8, 0x00, 0x00, 0x00, 0x00, 0xf4]).unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP);
    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    thread.with_state(|s| assert_eq!(s.rsp, STACK_TOP - 8));

    let mut ret = [0u8; 8];
    ctx.memory().read(STACK_TOP - 8, &mut ret).unwrap();
    assert_eq!(u64::from_le_bytes(ret), 5);
}

#[test]
fn add_sets_zero_and_carry() {
    let ctx = context();
    // mov rax, 1; add rax, -1; hlt
    ctx.load_image(
        0,
        &[0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0x48, 0x83, 0xc0, 0xff, 0xf4],
    )
    .unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP);
    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    thread.with_state(|s| {
        assert_eq!(s.rax, 0);
        assert_eq!(s.zf, 1);
        assert_eq!(s.cf, 1);
        assert_eq!(s.of, 0);
        assert_eq!(s.sf, 0);
        // 0 has even parity.
        assert_eq!(s.pf, 1);
    });
}

#[test]
fn conditional_branch_takes_the_flagged_path() {
    let ctx = context();
    // xor eax, eax (zf=1); je +1 over mov al, 1; hlt
    //   0: 31 c0
    //   2: 74 02
    //   4: b0 01
    //   6: f4
    ctx.load_image(0, &[0x31, 0xc0, 0x74, 0x02, 0xb0, 0x01, 0xf4]).unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP);
    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    // The mov was skipped.
    thread.with_state(|s| {
        assert_eq!(s.rax, 0);
        assert_eq!(s.pc, 7);
    });
}

#[test]
fn shifts_mask_their_amount_and_set_carry() {
    let ctx = context();
    // mov rax, 3; mov cl, 1; shl rax, cl; hlt
    ctx.load_image(
        0,
        &[
            0x48, 0xc7, 0xc0, 0x03, 0x00, 0x00, 0x00, // mov rax, 3
            0xb1, 0x01, // mov cl, 1
            0x48, 0xd3, 0xe0, // shl rax, cl
            0xf4,
        ],
    )
    .unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP);
    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    thread.with_state(|s| {
        assert_eq!(s.rax, 6);
        assert_eq!(s.cf, 0);
        assert_eq!(s.zf, 0);
    });
}

#[test]
fn memory_roundtrip_through_guest_pointers() {
    let ctx = context();
    // mov rax, 0x2000; mov rbx, 0x1122334455667788; mov [rax], rbx;
    // mov rcx, [rax]; hlt
    ctx.load_image(
        0,
        &[
            0x48, 0xc7, 0xc0, 0x00, 0x20, 0x00, 0x00, // mov rax, 0x2000
            0x48, 0xbb, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // movabs rbx
            0x48, 0x89, 0x18, // mov [rax], rbx
            0x48, 0x8b, 0x08, // mov rcx, [rax]
            0xf4,
        ],
    )
    .unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP);
    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    thread.with_state(|s| assert_eq!(s.rcx, 0x1122_3344_5566_7788));

    let mut stored = [0u8; 8];
    ctx.memory().read(0x2000, &mut stored).unwrap();
    assert_eq!(u64::from_le_bytes(stored), 0x1122_3344_5566_7788);
}

#[test]
fn chained_blocks_execute_end_to_end() {
    let ctx = context();
    // jmp +2; (two dead nops); ret — the ret pops 0x2000, where a hlt
    // waits. The jump block chains straight into the ret block.
    ctx.load_image(0, &[0xeb, 0x02, 0x90, 0x90, 0xc3]).unwrap();
    ctx.load_image(0x2000, &[0xf4]).unwrap();
    ctx.load_image(STACK_TOP - 8, &0x2000u64.to_le_bytes()).unwrap();

    let thread = ctx.create_execution_thread(0, STACK_TOP - 8);
    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    thread.with_state(|s| {
        assert_eq!(s.pc, 0x2001);
        assert_eq!(s.rsp, STACK_TOP);
    });

    // Both blocks of the chunk were installed.
    assert!(ctx.engine().cache().lookup(0).is_some());
    assert!(ctx.engine().cache().lookup(4).is_some());
}

#[test]
fn paddd_adds_lanes() {
    let ctx = context();
    // mov rax, 0x2000; movdqu xmm0, [rax]; movdqu xmm1, [rax+16];
    // paddd xmm0, xmm1; movdqu [rax+32], xmm0; hlt
    ctx.load_image(
        0,
        &[
            0x48, 0xc7, 0xc0, 0x00, 0x20, 0x00, 0x00, // mov rax, 0x2000
            0xf3, 0x0f, 0x6f, 0x00, // movdqu xmm0, [rax]
            0xf3, 0x0f, 0x6f, 0x48, 0x10, // movdqu xmm1, [rax+16]
            0x66, 0x0f, 0xfe, 0xc1, // paddd xmm0, xmm1
            0xf3, 0x0f, 0x7f, 0x40, 0x20, // movdqu [rax+32], xmm0
            0xf4,
        ],
    )
    .unwrap();

    let lanes_a: [u32; 4] = [1, 2, 3, 4];
    let lanes_b: [u32; 4] = [10, 20, 30, 40];
    for (i, (a, b)) in lanes_a.iter().zip(&lanes_b).enumerate() {
        ctx.load_image(0x2000 + 4 * i as u64, &a.to_le_bytes()).unwrap();
        ctx.load_image(0x2010 + 4 * i as u64, &b.to_le_bytes()).unwrap();
    }

    let thread = ctx.create_execution_thread(0, STACK_TOP);
    assert_eq!(ctx.invoke(&thread).unwrap(), HALT);

    for i in 0..4u64 {
        let mut lane = [0u8; 4];
        ctx.memory().read(0x2020 + 4 * i, &mut lane).unwrap();
        assert_eq!(u32::from_le_bytes(lane), lanes_a[i as usize] + lanes_b[i as usize]);
    }
}
