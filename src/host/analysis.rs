//! Static analyses over original instruction lists.

use std::collections::BTreeSet;

use smallvec::SmallVec;

use super::code::CodeObject;
use super::opcodes::Opcode;

/// Local variables live on entry to `start_pc`: names some path from
/// `start_pc` reads with `LOAD_FAST` before any `STORE_FAST` overwrites them.
///
/// Classic backward dataflow to a fixpoint; jumps are followed, returns end a
/// path.
pub fn livevars_analysis(code: &CodeObject, start_pc: usize) -> BTreeSet<String> {
    let insts = code.instructions();
    let n = insts.len();
    if start_pc >= n {
        return BTreeSet::new();
    }

    let mut live_in: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for pc in (0..n).rev() {
            let mut live: BTreeSet<u32> = successors(code, pc)
                .into_iter()
                .flat_map(|s| live_in[s].iter().copied())
                .collect();
            let inst = insts[pc];
            match inst.opcode {
                Opcode::StoreFast => {
                    live.remove(&inst.arg);
                }
                Opcode::LoadFast => {
                    live.insert(inst.arg);
                }
                _ => {}
            }
            if live != live_in[pc] {
                live_in[pc] = live;
                changed = true;
            }
        }
    }

    live_in[start_pc]
        .iter()
        .filter_map(|&index| code.varname(index).map(str::to_owned))
        .collect()
}

fn successors(code: &CodeObject, pc: usize) -> SmallVec<[usize; 2]> {
    let insts = code.instructions();
    let inst = insts[pc];
    let target = inst.arg as usize;
    let mut out: SmallVec<[usize; 2]> = match inst.opcode {
        Opcode::ReturnValue => SmallVec::new(),
        Opcode::JumpAbsolute => smallvec::smallvec![target],
        Opcode::PopJumpIfFalse => smallvec::smallvec![pc + 1, target],
        _ => smallvec::smallvec![pc + 1],
    };
    out.retain(|s| *s < insts.len());
    out
}
