//! Frames whose raw instruction stream carries injected code.

mod common;

use common::*;
use graphtrace::host::{Instruction, Opcode, Value};

#[test]
fn test_injected_instruction_breaks_trace() {
    let (ctx, mut vm) = traced();
    let code = add_fn();
    vm.prepare_with_injected(&code, &[(3, Instruction::simple(Opcode::Nop))]);

    let r = vm.run_code(&code, &[Value::int(20), Value::int(22)]).unwrap();
    assert_eq!(r.as_int(), Some(42));
    assert!(ctx.stats().restarts >= 1);

    // The record stops where the injected NOP sits, in original pcs
    let recs = records(&ctx, &vm, &code);
    assert_eq!(recs.len(), 1);
    assert_eq!((recs[0].start_pc, recs[0].end_pc), (0, 3));
    assert_eq!(recs[0].end_stack_depth, 1);

    let r = vm.run_code(&code, &[Value::int(20), Value::int(22)]).unwrap();
    assert_eq!(r.as_int(), Some(42));
    assert_eq!(ctx.stats().cache_hits, 1);
}

#[test]
fn test_reprepare_gets_fresh_frame_id() {
    let (_ctx, mut vm) = traced();
    let code = affine_fn();
    let plain_id = vm.prepare(&code).id();
    let injected_id = vm
        .prepare_with_injected(&code, &[(0, Instruction::simple(Opcode::Nop))])
        .id();

    assert_ne!(plain_id, injected_id);
    assert_eq!(vm.frame_id_of(&code), Some(injected_id));

    let x = tensor(&[2], 0.7);
    let expected = data(&plain().run_code(&code, &[x.clone()]).unwrap());
    assert_eq!(data(&vm.run_code(&code, &[x]).unwrap()), expected);
}
