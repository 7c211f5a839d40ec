use crate::prog::{opcode_index, Inst, InstKind, InstPtr, Program, NUM_OPCODES};
use crate::sparse::{SparseMap, SparseSet};

fn add_to_queue(q: &mut SparseSet, id: InstPtr) {
    if id != 0 && !q.contains(id) {
        q.insert(id);
    }
}

/// The peephole optimizer.
///
/// Two rewrites run over the reachable graph: successor chains through
/// `Nop`s are short-circuited, and `Alt`s of the shape
///
/// ```text
///   ip: Alt -> j | k
///    j: ByteRange [00-ff] -> ip
///    k: Match
/// ```
///
/// (or its mirror image) become `AltMatch`, which the DFA uses to cut `.*`
/// tails short. Running it again is a no-op.
pub fn optimize(prog: &mut Program) {
    // Eliminate nops. Most are avoided during compilation,
    // but a few are hard to avoid.
    let mut q = SparseSet::new(prog.len());
    add_to_queue(&mut q, prog.start);
    let mut i = 0;
    while let Some(id) = q.get(i) {
        i += 1;

        let mut j = prog.insts[id as usize].out;
        while j != 0
            && matches!(prog.insts[j as usize].kind, InstKind::Nop)
        {
            j = prog.insts[j as usize].out;
        }
        prog.insts[id as usize].out = j;
        add_to_queue(&mut q, j);

        if let InstKind::Alt { out1 } = prog.insts[id as usize].kind {
            let mut j = out1;
            while j != 0
                && matches!(prog.insts[j as usize].kind, InstKind::Nop)
            {
                j = prog.insts[j as usize].out;
            }
            prog.insts[id as usize].kind = InstKind::Alt { out1: j };
            add_to_queue(&mut q, j);
        }
    }

    // Insert AltMatch instructions.
    q.clear();
    add_to_queue(&mut q, prog.start);
    let mut i = 0;
    while let Some(id) = q.get(i) {
        i += 1;
        let ip = &prog.insts[id as usize];
        add_to_queue(&mut q, ip.out);
        let out1 = match ip.kind {
            InstKind::Alt { out1 } => {
                add_to_queue(&mut q, out1);
                out1
            }
            _ => continue,
        };

        let out = prog.insts[id as usize].out;
        if is_full_byte_self_loop(prog, out, id) && is_match(prog, out1) {
            prog.insts[id as usize].kind = InstKind::AltMatch { out1 };
            continue;
        }
        if is_match(prog, out) && is_full_byte_self_loop(prog, out1, id) {
            prog.insts[id as usize].kind = InstKind::AltMatch { out1 };
        }
    }
}

fn is_full_byte_self_loop(prog: &Program, id: InstPtr, alt: InstPtr) -> bool {
    match prog.insts[id as usize].kind {
        InstKind::ByteRange { lo, hi, .. } => {
            lo == 0x00 && hi == 0xFF && prog.insts[id as usize].out == alt
        }
        _ => false,
    }
}

/// Is `id` a guaranteed match at the end of the text, perhaps after some
/// capturing?
fn is_match(prog: &Program, mut id: InstPtr) -> bool {
    loop {
        match prog.insts[id as usize].kind {
            InstKind::Alt { .. }
            | InstKind::AltMatch { .. }
            | InstKind::ByteRange { .. }
            | InstKind::EmptyWidth { .. }
            | InstKind::Fail => return false,
            InstKind::Capture { .. } | InstKind::Nop => {
                id = prog.insts[id as usize].out;
            }
            InstKind::Match { .. } => return true,
        }
    }
}

/// Rewrites the instruction graph into a linear, list-structured array.
///
/// A "list" is a consecutive run of instructions that together form one
/// alternative chain: stepping through a list means trying each element in
/// order until one marked `last`. Three passes:
///
/// 1. Mark roots: the `Fail` instruction, both entry points, and every
///    instruction reached as the successor of a byte-consuming (or
///    capturing, or asserting) instruction.
/// 2. Emit one list per root in discovery order. An epsilon edge into a
///    different root becomes a `Nop` bridge so that the program stays
///    linear in the number of instructions rather than exploding
///    quadratically from naive inlining.
/// 3. Remap successors from root ids to flat ids and count instructions by
///    opcode.
///
/// Flattening an already flattened program is a no-op.
pub fn flatten(prog: &mut Program) {
    if prog.did_flatten {
        return;
    }
    prog.did_flatten = true;

    // Scratch structures. It's important that these are reused by
    // emit_list, which runs in a loop and would thrash the heap otherwise.
    let mut q = SparseSet::new(prog.len());
    let mut stk: Vec<InstPtr> = Vec::with_capacity(prog.len());

    // First pass: marks "roots" and builds the mapping from instruction
    // ids to root ids.
    let mut rootmap = SparseMap::new(prog.len());
    mark_roots(prog, &mut rootmap, &mut q, &mut stk);

    // Second pass: emits "lists", remapping outs to root ids, and builds
    // the mapping from root ids to flat ids.
    let roots: Vec<(InstPtr, u32)> = rootmap.iter().copied().collect();
    let mut flatmap = vec![0 as InstPtr; roots.len()];
    let mut flat: Vec<Inst> = Vec::with_capacity(prog.len());
    for &(root, rootid) in &roots {
        flatmap[rootid as usize] = flat.len() as InstPtr;
        emit_list(prog, root, &rootmap, &mut flat, &mut q, &mut stk);
        flat.last_mut().expect("every list emits an instruction").last =
            true;
    }

    // Third pass: remaps outs to flat ids and counts instructions by
    // opcode. AltMatch successors were already emitted as flat ids.
    prog.list_count = flatmap.len();
    prog.inst_counts = [0; NUM_OPCODES];
    for ip in flat.iter_mut() {
        if !matches!(ip.kind, InstKind::AltMatch { .. }) {
            ip.out = flatmap[ip.out as usize];
        }
        prog.inst_counts[opcode_index(&ip.kind)] += 1;
    }

    // Remap start_unanchored and start.
    if prog.start_unanchored == 0 {
        debug_assert_eq!(prog.start, 0);
    } else if prog.start_unanchored == prog.start {
        prog.start_unanchored = flatmap[1];
        prog.start = flatmap[1];
    } else {
        prog.start_unanchored = flatmap[1];
        prog.start = flatmap[2];
    }

    prog.insts = flat;
}

fn mark_roots(
    prog: &Program,
    rootmap: &mut SparseMap,
    q: &mut SparseSet,
    stk: &mut Vec<InstPtr>,
) {
    // Mark the Fail instruction.
    rootmap.insert(0, 0);

    // Mark the start_unanchored and start instructions.
    if !rootmap.contains_key(prog.start_unanchored) {
        let n = rootmap.len() as u32;
        rootmap.insert(prog.start_unanchored, n);
    }
    if !rootmap.contains_key(prog.start) {
        let n = rootmap.len() as u32;
        rootmap.insert(prog.start, n);
    }

    q.clear();
    stk.clear();
    stk.push(prog.start_unanchored);
    while let Some(mut id) = stk.pop() {
        loop {
            if q.contains(id) {
                break;
            }
            q.insert(id);

            let ip = &prog.insts[id as usize];
            match ip.kind {
                InstKind::Alt { out1 } | InstKind::AltMatch { out1 } => {
                    stk.push(out1);
                    id = ip.out;
                }
                InstKind::ByteRange { .. }
                | InstKind::Capture { .. }
                | InstKind::EmptyWidth { .. } => {
                    // Mark the out of this instruction.
                    if !rootmap.contains_key(ip.out) {
                        let n = rootmap.len() as u32;
                        rootmap.insert(ip.out, n);
                    }
                    id = ip.out;
                }
                InstKind::Nop => {
                    id = ip.out;
                }
                InstKind::Match { .. } | InstKind::Fail => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{flatten, optimize};
    use crate::prog::{Inst, InstKind, InstPtr, Program};

    fn inst(out: InstPtr, kind: InstKind) -> Inst {
        Inst { out, last: false, kind }
    }

    /// A hand-assembled `(?s:.)*` graph: Fail, the star Alt, its byte
    /// loop, a stray Nop on the skip branch, and Match.
    fn dotstar_prog() -> Program {
        let mut prog = Program::new();
        prog.insts = vec![
            inst(0, InstKind::Fail),
            inst(2, InstKind::Alt { out1: 3 }),
            inst(1, InstKind::ByteRange { lo: 0x00, hi: 0xFF, foldcase: false }),
            inst(4, InstKind::Nop),
            inst(0, InstKind::Match { id: 0 }),
        ];
        prog.start = 1;
        prog.start_unanchored = 1;
        prog
    }

    #[test]
    fn peephole_is_idempotent() {
        let mut prog = dotstar_prog();
        optimize(&mut prog);
        // The nop was elided and the alt became an altmatch.
        assert_eq!(
            prog.insts[1].kind,
            InstKind::AltMatch { out1: 4 }
        );
        assert_eq!(prog.insts[1].out, 2);

        let once = prog.insts.clone();
        optimize(&mut prog);
        assert_eq!(prog.insts, once);
    }

    #[test]
    fn flatten_is_idempotent() {
        let mut prog = dotstar_prog();
        optimize(&mut prog);
        flatten(&mut prog);
        let once = prog.insts.clone();
        let (start, unanchored) = (prog.start, prog.start_unanchored);
        flatten(&mut prog);
        assert_eq!(prog.insts, once);
        assert_eq!((prog.start, prog.start_unanchored), (start, unanchored));
    }
}

fn emit_list(
    prog: &Program,
    root: InstPtr,
    rootmap: &SparseMap,
    flat: &mut Vec<Inst>,
    q: &mut SparseSet,
    stk: &mut Vec<InstPtr>,
) {
    q.clear();
    stk.clear();
    stk.push(root);
    while let Some(mut id) = stk.pop() {
        loop {
            if q.contains(id) {
                break;
            }
            q.insert(id);

            if id != root && rootmap.contains_key(id) {
                // We reached another "tree" via epsilon transition. Emit a
                // Nop so that the program does not become quadratically
                // larger.
                flat.push(Inst {
                    out: rootmap.get(id).expect("id is a root"),
                    last: false,
                    kind: InstKind::Nop,
                });
                break;
            }

            let ip = &prog.insts[id as usize];
            match ip.kind {
                InstKind::AltMatch { out1 } => {
                    let next = flat.len() as InstPtr + 1;
                    flat.push(Inst {
                        out: next,
                        last: false,
                        kind: InstKind::AltMatch { out1: next + 1 },
                    });
                    stk.push(out1);
                    id = ip.out;
                }
                InstKind::Alt { out1 } => {
                    stk.push(out1);
                    id = ip.out;
                }
                InstKind::ByteRange { .. }
                | InstKind::Capture { .. }
                | InstKind::EmptyWidth { .. } => {
                    flat.push(Inst {
                        out: rootmap
                            .get(ip.out)
                            .expect("successor was marked as a root"),
                        last: false,
                        kind: ip.kind.clone(),
                    });
                    break;
                }
                InstKind::Nop => {
                    id = ip.out;
                }
                InstKind::Match { .. } | InstKind::Fail => {
                    flat.push(Inst {
                        out: 0,
                        last: false,
                        kind: ip.kind.clone(),
                    });
                    break;
                }
            }
        }
    }
}
