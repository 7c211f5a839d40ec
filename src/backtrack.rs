/*!
The bit-state backtracking engine.

This is a backtracking matcher with submatch tracking, artificially
restricted to small programs on small texts. It retains worst case linear
time by keeping track of the states it has visited using a bitmap keyed by
`(instruction index, input position)`: once a pair is visited it is never
visited again, so total work is bounded by `program size * text length`
even though the search is a depth-first walk with real backtracking.

The backtracker beats the other engines on small inputs because it does not
have to keep multiple capture sets alive at once, and unlike the DFA it
produces submatches directly. Its performance does not scale: the bitmap
has to be zeroed for each search, which dominates on large inputs, hence
the size gate in [`should_exec`].

The walk is driven by an explicit job stack rather than recursion on the
text, so deeply nested alternations cannot overflow the call stack.
*/

use std::ops::Range;

use crate::exec::Slot;
use crate::prog::{Anchor, InstKind, InstPtr, MatchKind, Program};

type Bits = u32;

const BIT_SIZE: usize = 32;
const MAX_SIZE_BYTES: usize = 256 * (1 << 10); // 256 KB

/// Returns true iff the given program and input should be executed by this
/// engine with reasonable memory usage.
pub fn should_exec(num_insts: usize, text_len: usize) -> bool {
    // Total memory usage in bytes is determined by:
    //
    //   ((len(insts) * (len(input) + 1) + bits - 1) / bits) * (size of u32)
    //
    // The actual limit picked is pretty much a heuristic.
    let size = ((num_insts * (text_len + 1) + BIT_SIZE - 1) / BIT_SIZE) * 4;
    size <= MAX_SIZE_BYTES
}

/// One unit of pending work: visit instruction `id` at position `at`.
///
/// `arg` distinguishes a first visit (0) from a resume (1); resumes are how
/// `AltMatch` bookkeeping and capture-slot restores get run after the
/// subtree they guard has been fully explored. `old` carries the value a
/// capture restore puts back.
#[derive(Clone, Copy)]
struct Job {
    id: InstPtr,
    at: usize,
    arg: u32,
    old: Slot,
}

/// A bounded backtracking search over one program and one text.
struct BitState<'r, 's, 'm> {
    prog: &'r Program,
    context: &'s [u8],
    text: Range<usize>,
    anchored: bool,
    longest: bool,
    endmatch: bool,
    caps: Vec<Slot>,
    slots: &'m mut [Slot],

    visited: Vec<Bits>,
    jobs: Vec<Job>,
}

/// Runs a bit-state search. The caller is responsible for checking
/// [`should_exec`] first.
///
/// `slots` receives submatch positions on success: slot 0/1 bracket the
/// whole match, slots 2n/2n+1 bracket group n. Pass an empty slice when
/// only a yes/no answer is needed; the search then stops at the first
/// acceptance no matter the requested kind.
pub fn search(
    prog: &Program,
    context: &[u8],
    text: Range<usize>,
    anchor: Anchor,
    kind: MatchKind,
    slots: &mut [Slot],
) -> bool {
    // A full match is an anchored longest match that must use up the whole
    // text, so make sure there is a slot pair to verify that with.
    let fullmatch =
        kind == MatchKind::FullMatch || anchor == Anchor::FullMatch;
    let mut full_slots = [None, None];
    let (anchor, slots) = if fullmatch {
        if slots.is_empty() {
            (Anchor::Anchored, &mut full_slots[..])
        } else {
            (Anchor::Anchored, slots)
        }
    } else {
        (anchor, slots)
    };

    if prog.anchor_start && text.start != 0 {
        return false;
    }
    if prog.anchor_end && text.end != context.len() {
        return false;
    }

    let ncaps = slots.len().max(2);
    let mut b = BitState {
        prog,
        context,
        text: text.clone(),
        anchored: anchor != Anchor::Unanchored || prog.anchor_start,
        longest: kind != MatchKind::FirstMatch || prog.anchor_end,
        endmatch: prog.anchor_end || fullmatch,
        caps: vec![None; ncaps],
        slots,
        visited: Vec::new(),
        jobs: Vec::with_capacity(256),
    };
    for slot in b.slots.iter_mut() {
        *slot = None;
    }

    let nvisited = prog.len() * (text.end - text.start + 1);
    b.visited = vec![0; (nvisited + BIT_SIZE - 1) / BIT_SIZE];

    let matched = b.search();
    if !matched {
        return false;
    }
    // A full match is only a match if it used up the whole text.
    if fullmatch && b.slots[1] != Some(text.end) {
        return false;
    }
    true
}

impl<'r, 's, 'm> BitState<'r, 's, 'm> {
    fn search(&mut self) -> bool {
        if self.anchored {
            self.caps[0] = Some(self.text.start);
            return self.try_search(self.prog.start, self.text.start);
        }

        // Unanchored search, starting from each possible text position.
        // Notice that we have to try the empty string at the end of the
        // text, so the loop includes text.end. This looks like it's
        // quadratic in the size of the text, but we are not clearing
        // visited between attempts, so no work is duplicated and it ends
        // up still being linear.
        let mut at = self.text.start;
        loop {
            // Try to use memchr to find the first byte quickly.
            if let Some(fb) = self.prog.first_byte() {
                if at < self.text.end && self.context[at] != fb {
                    match memchr::memchr(
                        fb,
                        &self.context[at..self.text.end],
                    ) {
                        Some(i) => at += i,
                        None => at = self.text.end,
                    }
                }
            }
            self.caps[0] = Some(at);
            if self.try_search(self.prog.start, at) {
                // Match must be leftmost; done.
                return true;
            }
            if at == self.text.end {
                return false;
            }
            at += 1;
        }
    }

    /// Should the search visit the pair (id, at)? If so, remember that it
    /// was visited so the next time, we don't repeat the visit.
    fn should_visit(&mut self, id: InstPtr, at: usize) -> bool {
        let n = id as usize * (self.text.end - self.text.start + 1)
            + (at - self.text.start);
        if self.visited[n / BIT_SIZE] & (1 << (n & (BIT_SIZE - 1))) != 0 {
            return false;
        }
        self.visited[n / BIT_SIZE] |= 1 << (n & (BIT_SIZE - 1));
        true
    }

    /// Pushes the job (id, at, arg), unless it is a first visit to a pair
    /// we have already seen.
    fn push(&mut self, id: InstPtr, at: usize, arg: u32, old: Slot) {
        if matches!(self.prog.insts[id as usize].kind, InstKind::Fail) {
            return;
        }
        // Only check the visited set on first visits; a resume (arg > 0)
        // continues work that is already in flight.
        if arg == 0 && !self.should_visit(id, at) {
            return;
        }
        self.jobs.push(Job { id, at, arg, old });
    }

    /// Tries a search from instruction `id0` at position `at0`, returning
    /// whether it succeeded.
    fn try_search(&mut self, id0: InstPtr, at0: usize) -> bool {
        let mut matched = false;
        let mut inaltmatch = false;
        let end = self.text.end;
        self.jobs.clear();
        self.push(id0, at0, 0, None);

        'jobs: while let Some(Job { mut id, mut at, arg, old }) = self.jobs.pop()
        {
            // Resumes first: they finish previously started work and then
            // yield back to the stack.
            if arg == 1 {
                match self.prog.insts[id as usize].kind {
                    InstKind::AltMatch { .. } => {
                        inaltmatch = false;
                        continue 'jobs;
                    }
                    InstKind::Capture { slot } => {
                        // Finished exploring out; restore the old value.
                        self.caps[slot as usize] = old;
                        continue 'jobs;
                    }
                    _ => unreachable!("resume on non-resumable opcode"),
                }
            }

            loop {
                // Visit (id, at).
                match self.prog.insts[id as usize].kind {
                    InstKind::Fail => continue 'jobs,
                    InstKind::Alt { .. } => {
                        unreachable!("Alt in flattened program")
                    }

                    InstKind::AltMatch { out1 } => {
                        inaltmatch = true;
                        self.push(id, at, 1, None); // come back when done

                        // One branch is the byte loop; the other leads to
                        // Match (possibly via Nop or Capture).
                        let out = self.prog.insts[id as usize].out;
                        if self.greedy(id) {
                            // out1 is the match.
                            self.push(out1, at, 0, None);
                            id = out1;
                            at = end;
                        } else {
                            // out is the match.
                            self.push(out, end, 0, None);
                            id = out;
                        }
                        if !self.should_visit(id, at) {
                            continue 'jobs;
                        }
                    }

                    InstKind::ByteRange { .. } => {
                        let c = if at < end {
                            Some(self.context[at])
                        } else {
                            None
                        };
                        let ip = &self.prog.insts[id as usize];
                        if !ip.matches_byte(c) {
                            // Next alternative. A failed Match under a
                            // non-greedy AltMatch must not steer us back
                            // onto the byte loop it short-circuits.
                            if ip.last || inaltmatch {
                                continue 'jobs;
                            }
                            id += 1;
                            if !self.should_visit(id, at) {
                                continue 'jobs;
                            }
                            continue;
                        }
                        if !ip.last {
                            self.push(id + 1, at, 0, None);
                        }
                        id = ip.out;
                        at += 1;
                        if !self.should_visit(id, at) {
                            continue 'jobs;
                        }
                    }

                    InstKind::Capture { slot } => {
                        let ip = &self.prog.insts[id as usize];
                        let out = ip.out;
                        let last = ip.last;
                        if !last {
                            self.push(id + 1, at, 0, None);
                        }
                        if (slot as usize) < self.caps.len() {
                            // Capture at to the register, saving the old
                            // value for the resume job.
                            let old = self.caps[slot as usize];
                            self.push(id, at, 1, old);
                            self.caps[slot as usize] = Some(at);
                        }
                        id = out;
                        if !self.should_visit(id, at) {
                            continue 'jobs;
                        }
                    }

                    InstKind::EmptyWidth { look } => {
                        let ip = &self.prog.insts[id as usize];
                        let flags =
                            crate::prog::EmptyFlags::at(self.context, at);
                        if !flags.contains(look) {
                            if ip.last || inaltmatch {
                                continue 'jobs;
                            }
                            id += 1;
                            if !self.should_visit(id, at) {
                                continue 'jobs;
                            }
                            continue;
                        }
                        if !ip.last {
                            self.push(id + 1, at, 0, None);
                        }
                        id = ip.out;
                        if !self.should_visit(id, at) {
                            continue 'jobs;
                        }
                    }

                    InstKind::Nop => {
                        let ip = &self.prog.insts[id as usize];
                        if !ip.last {
                            self.push(id + 1, at, 0, None);
                        }
                        id = ip.out;
                        if !self.should_visit(id, at) {
                            continue 'jobs;
                        }
                    }

                    InstKind::Match { .. } => {
                        if self.endmatch && at != end {
                            let ip = &self.prog.insts[id as usize];
                            if ip.last || inaltmatch {
                                continue 'jobs;
                            }
                            id += 1;
                            if !self.should_visit(id, at) {
                                continue 'jobs;
                            }
                            continue;
                        }

                        // We found a match. If the caller doesn't care
                        // where it is, no point going further.
                        if self.slots.is_empty() {
                            return true;
                        }

                        // Record the best match so far. Only the end point
                        // needs comparing, because this entire call
                        // considers a single start position.
                        matched = true;
                        self.caps[1] = Some(at);
                        let record = self.slots[0].is_none()
                            || (self.longest
                                && self.slots[1]
                                    .map_or(true, |best| at > best));
                        if record {
                            for (s, c) in
                                self.slots.iter_mut().zip(self.caps.iter())
                            {
                                *s = *c;
                            }
                        }

                        // If going for first match, we're done.
                        if !self.longest {
                            return true;
                        }

                        // If we used the entire text, no longer match is
                        // possible.
                        if at == end {
                            return true;
                        }

                        // Otherwise, continue on in hope of a longer match.
                        let ip = &self.prog.insts[id as usize];
                        if ip.last || inaltmatch {
                            continue 'jobs;
                        }
                        id += 1;
                        if !self.should_visit(id, at) {
                            continue 'jobs;
                        }
                    }
                }
            }
        }
        matched
    }

    /// Does this `AltMatch` prefer the byte loop over the match?
    fn greedy(&self, id: InstPtr) -> bool {
        let out = self.prog.insts[id as usize].out;
        matches!(
            self.prog.insts[out as usize].kind,
            InstKind::ByteRange { .. }
        )
    }
}
