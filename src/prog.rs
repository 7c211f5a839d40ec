use std::fmt;
use std::ops::{BitAnd, BitOr, Range};
use std::slice;

use once_cell::sync::OnceCell;

use crate::dfa::{Dfa, DfaResult};
use crate::exec::Slot;
use crate::options::Options;
use crate::sparse::SparseSet;

/// `InstPtr` represents the index of an instruction in a program.
///
/// Instruction 0 is always the `Fail` instruction, so 0 doubles as the null
/// successor: pointing at it can never advance a match.
pub type InstPtr = u32;

/// The imaginary byte consumed at the end of the text. Only the DFA deals
/// in it; it maps to the extra byte class `bytemap_range`.
pub const BYTE_END_TEXT: usize = 256;

/// A bitmask of zero-width assertions.
///
/// An `EmptyWidth` instruction carries the assertions it requires; engines
/// compare that against the assertions that actually hold at the current
/// position, computed by [`EmptyFlags::at`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct EmptyFlags(pub u8);

impl EmptyFlags {
    /// `^` with multi-line: beginning of text or after a newline.
    pub const BEGIN_LINE: EmptyFlags = EmptyFlags(1 << 0);
    /// `$` with multi-line: end of text or before a newline.
    pub const END_LINE: EmptyFlags = EmptyFlags(1 << 1);
    /// `\A`.
    pub const BEGIN_TEXT: EmptyFlags = EmptyFlags(1 << 2);
    /// `\z`.
    pub const END_TEXT: EmptyFlags = EmptyFlags(1 << 3);
    /// `\b` (ASCII).
    pub const WORD_BOUNDARY: EmptyFlags = EmptyFlags(1 << 4);
    /// `\B` (ASCII).
    pub const NOT_WORD_BOUNDARY: EmptyFlags = EmptyFlags(1 << 5);

    /// No assertions.
    pub fn empty() -> EmptyFlags {
        EmptyFlags(0)
    }

    /// Does `self` include every assertion in `other`?
    pub fn contains(self, other: EmptyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Does `self` share any assertion with `other`?
    pub fn intersects(self, other: EmptyFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Is this the empty mask?
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The assertions that hold at position `at` in `context`.
    ///
    /// `at` may be anywhere in `0..=context.len()`; both endpoints are
    /// positions between bytes, not byte indices.
    pub fn at(context: &[u8], at: usize) -> EmptyFlags {
        let mut flags = EmptyFlags::empty();

        // ^ and \A
        if at == 0 {
            flags = flags | EmptyFlags::BEGIN_TEXT | EmptyFlags::BEGIN_LINE;
        } else if context[at - 1] == b'\n' {
            flags = flags | EmptyFlags::BEGIN_LINE;
        }

        // $ and \z
        if at == context.len() {
            flags = flags | EmptyFlags::END_TEXT | EmptyFlags::END_LINE;
        } else if context[at] == b'\n' {
            flags = flags | EmptyFlags::END_LINE;
        }

        // \b and \B
        let word_before = at > 0 && Program::is_word_byte(context[at - 1]);
        let word_after =
            at < context.len() && Program::is_word_byte(context[at]);
        if word_before != word_after {
            flags = flags | EmptyFlags::WORD_BOUNDARY;
        } else {
            flags = flags | EmptyFlags::NOT_WORD_BOUNDARY;
        }

        flags
    }
}

impl BitOr for EmptyFlags {
    type Output = EmptyFlags;
    fn bitor(self, rhs: EmptyFlags) -> EmptyFlags {
        EmptyFlags(self.0 | rhs.0)
    }
}

impl BitAnd for EmptyFlags {
    type Output = EmptyFlags;
    fn bitand(self, rhs: EmptyFlags) -> EmptyFlags {
        EmptyFlags(self.0 & rhs.0)
    }
}

/// What a search should report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MatchKind {
    /// Stop at the first acceptance along the scan (leftmost-first).
    FirstMatch,
    /// Report the longest acceptance from the leftmost start
    /// (leftmost-longest).
    LongestMatch,
    /// The whole text must match.
    FullMatch,
    /// Report the identifiers of every pattern that matches (used for
    /// pattern sets).
    ManyMatch,
}

/// Where a match is allowed to begin and end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Anchor {
    /// A match may begin anywhere.
    Unanchored,
    /// A match must begin at the start of the text.
    Anchored,
    /// A match must span the entire text.
    FullMatch,
}

/// A single instruction in a compiled program.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Inst {
    /// The successor: where execution continues once this instruction has
    /// done its work. `Alt`/`AltMatch` treat this as the preferred branch.
    pub out: InstPtr,
    /// After flattening, marks the final instruction of a list of
    /// alternatives; the instructions of a list are consecutive, so engines
    /// walk forward from a list head until they see `last`.
    pub last: bool,
    /// The opcode and its payload.
    pub kind: InstKind,
}

/// An instruction opcode with its payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstKind {
    /// Try `out` first, then `out1`.
    Alt {
        /// The second branch.
        out1: InstPtr,
    },
    /// An `Alt` where one branch is a `[00-ff]` self loop and the other
    /// leads to `Match`; the DFA uses it as a termination oracle for `.*`
    /// tails.
    AltMatch {
        /// The second branch.
        out1: InstPtr,
    },
    /// Consume one byte in `[lo, hi]`.
    ByteRange {
        /// Low end of the range, inclusive.
        lo: u8,
        /// High end of the range, inclusive.
        hi: u8,
        /// Fold ASCII case: an uppercase input byte is lowercased before
        /// the range test.
        foldcase: bool,
    },
    /// Record the current position in capture slot `slot`. Consumes no
    /// input.
    Capture {
        /// The capture slot: `2n` opens group `n`, `2n+1` closes it.
        slot: u32,
    },
    /// Require the given zero-width assertions. Consumes no input.
    EmptyWidth {
        /// The required assertions.
        look: EmptyFlags,
    },
    /// Accept. In a pattern set, `id` says which pattern matched.
    Match {
        /// The pattern identifier; 0 outside of sets.
        id: u32,
    },
    /// No-op; eliminated by the peephole pass where possible.
    Nop,
    /// Unconditional failure.
    Fail,
}

impl Inst {
    /// Does this `ByteRange` instruction match the byte `c`?
    /// `None` represents the position past the end of the text.
    pub fn matches_byte(&self, c: Option<u8>) -> bool {
        match self.kind {
            InstKind::ByteRange { lo, hi, foldcase } => match c {
                None => false,
                Some(mut c) => {
                    if foldcase && c.is_ascii_uppercase() {
                        c += b'a' - b'A';
                    }
                    lo <= c && c <= hi
                }
            },
            _ => unreachable!("matches_byte on non-ByteRange"),
        }
    }

    fn dump(&self) -> String {
        match self.kind {
            InstKind::Alt { out1 } => {
                format!("alt -> {} | {}", self.out, out1)
            }
            InstKind::AltMatch { out1 } => {
                format!("altmatch -> {} | {}", self.out, out1)
            }
            InstKind::ByteRange { lo, hi, foldcase } => format!(
                "byte{} [{:02x}-{:02x}] -> {}",
                if foldcase { "/i" } else { "" },
                lo,
                hi,
                self.out
            ),
            InstKind::Capture { slot } => {
                format!("capture {} -> {}", slot, self.out)
            }
            InstKind::EmptyWidth { look } => {
                format!("emptywidth {:#x} -> {}", look.0, self.out)
            }
            InstKind::Match { id } => format!("match! {}", id),
            InstKind::Nop => format!("nop -> {}", self.out),
            InstKind::Fail => "fail".to_string(),
        }
    }
}

/// Per-opcode instruction counts, indexed by the order of `InstKind`'s
/// variants. Filled in by the flattener.
pub(crate) const NUM_OPCODES: usize = 8;

pub(crate) fn opcode_index(kind: &InstKind) -> usize {
    match *kind {
        InstKind::Alt { .. } => 0,
        InstKind::AltMatch { .. } => 1,
        InstKind::ByteRange { .. } => 2,
        InstKind::Capture { .. } => 3,
        InstKind::EmptyWidth { .. } => 4,
        InstKind::Match { .. } => 5,
        InstKind::Nop => 6,
        InstKind::Fail => 7,
    }
}

/// A compiled program: a flat array of instructions plus the facts the
/// engines need about it.
///
/// A program is built once by the compiler and is immutable afterwards,
/// except for two lazily initialized caches (the first-byte analysis and
/// the DFAs), both published through a once cell. Multiple threads may
/// search the same program concurrently.
pub struct Program {
    /// The instructions. Instruction 0 is always `Fail`.
    pub insts: Vec<Inst>,
    /// The anchored entry point.
    pub start: InstPtr,
    /// The entry point with an implicit `(?s:.)*?` prefix, used by
    /// unanchored searches.
    pub start_unanchored: InstPtr,
    /// Whether the pattern begins with `\A`.
    pub anchor_start: bool,
    /// Whether the pattern ends with `\z`.
    pub anchor_end: bool,
    /// Whether this program consumes its input right to left.
    pub reversed: bool,
    /// Whether this program was compiled from a pattern set and so has
    /// meaningful `Match` identifiers.
    pub many_match: bool,
    /// The number of patterns compiled into this program (1 outside sets).
    pub npatterns: usize,
    /// The number of capture slots `Capture` instructions may touch.
    pub ncapture_slots: usize,
    /// Maps each byte to its equivalence class. All engines read input
    /// through this table.
    pub bytemap: [u8; 256],
    /// The number of byte classes. The end-of-text sentinel uses the extra
    /// class `bytemap_range`.
    pub bytemap_range: usize,
    /// The parse options this program was compiled under.
    pub options: Options,
    /// Memory remaining for DFA state caches, in bytes.
    pub dfa_mem: usize,
    /// Whether `flatten` has run.
    pub did_flatten: bool,
    /// The number of instruction lists after flattening.
    pub list_count: usize,
    /// Instruction counts by opcode, filled in by the flattener.
    pub inst_counts: [usize; NUM_OPCODES],
    first_byte: OnceCell<Option<u8>>,
    dfa_first: OnceCell<Dfa>,
    dfa_longest: OnceCell<Dfa>,
}

impl Program {
    /// Creates an empty program. Fields are given default values; the
    /// compiler fills them in.
    pub fn new() -> Program {
        Program {
            insts: Vec::new(),
            start: 0,
            start_unanchored: 0,
            anchor_start: false,
            anchor_end: false,
            reversed: false,
            many_match: false,
            npatterns: 1,
            ncapture_slots: 2,
            bytemap: [0; 256],
            bytemap_range: 0,
            options: Options::default(),
            dfa_mem: 0,
            did_flatten: false,
            list_count: 0,
            inst_counts: [0; NUM_OPCODES],
            first_byte: OnceCell::new(),
            dfa_first: OnceCell::new(),
            dfa_longest: OnceCell::new(),
        }
    }

    /// The number of instructions.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Whether the program is empty. (A usable program never is: it has at
    /// least `Fail` and `Match`.)
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// The instruction at `id`.
    pub fn inst(&self, id: InstPtr) -> &Inst {
        &self.insts[id as usize]
    }

    /// The byte class of `b`.
    pub fn bytemap(&self, b: u8) -> usize {
        self.bytemap[b as usize] as usize
    }

    /// ASCII word-character predicate used by `\b` and `\B`.
    pub fn is_word_byte(b: u8) -> bool {
        matches!(b, b'0'..=b'9' | b'A'..=b'Z' | b'_' | b'a'..=b'z')
    }

    /// The single byte every match must start with, if there is one.
    ///
    /// Computed on first use from the flattened program and memoized. This
    /// is a raw byte, not a byte class: it feeds `memchr`, which scans raw
    /// input.
    pub fn first_byte(&self) -> Option<u8> {
        *self.first_byte.get_or_init(|| self.compute_first_byte())
    }

    fn compute_first_byte(&self) -> Option<u8> {
        let mut b: Option<u8> = None;
        let mut q = SparseSet::new(self.len());
        add_to_queue(&mut q, self.start);
        let mut i = 0;
        while let Some(id) = q.get(i) {
            i += 1;
            let ip = self.inst(id);
            match ip.kind {
                // The empty string matches, or a `.*` loop leads the
                // program: no single required byte.
                InstKind::Match { .. } | InstKind::AltMatch { .. } => {
                    return None
                }
                InstKind::ByteRange { lo, hi, foldcase } => {
                    if !ip.last {
                        add_to_queue(&mut q, id + 1);
                    }
                    // Must match exactly one byte.
                    if lo != hi {
                        return None;
                    }
                    if foldcase && lo.is_ascii_lowercase() {
                        return None;
                    }
                    match b {
                        None => b = Some(lo),
                        Some(prev) if prev != lo => return None,
                        Some(_) => {}
                    }
                }
                InstKind::Nop
                | InstKind::Capture { .. }
                | InstKind::EmptyWidth { .. } => {
                    if !ip.last {
                        add_to_queue(&mut q, id + 1);
                    }
                    add_to_queue(&mut q, ip.out);
                }
                InstKind::Fail => {}
                InstKind::Alt { .. } => {
                    // Flattening removed all Alts.
                    unreachable!("Alt in flattened program")
                }
            }
        }
        b
    }

    /// The DFA for the given match kind, building it on first use.
    ///
    /// First-match gets half the budget and longest-match the other half,
    /// except that reverse programs only ever run longest-match searches
    /// and set programs only ever run many-match searches, so each of those
    /// keeps the whole budget.
    pub(crate) fn get_dfa(&self, kind: MatchKind) -> &Dfa {
        match kind {
            MatchKind::FirstMatch => self.dfa_first.get_or_init(|| {
                Dfa::new(self, MatchKind::FirstMatch, self.dfa_mem / 2)
            }),
            MatchKind::ManyMatch => self.dfa_first.get_or_init(|| {
                Dfa::new(self, MatchKind::ManyMatch, self.dfa_mem)
            }),
            MatchKind::LongestMatch | MatchKind::FullMatch => {
                self.dfa_longest.get_or_init(|| {
                    let mem = if self.reversed {
                        self.dfa_mem
                    } else {
                        self.dfa_mem / 2
                    };
                    Dfa::new(self, MatchKind::LongestMatch, mem)
                })
            }
        }
    }

    /// Engine entry point: searches `text` (a subrange of `context`) with
    /// the lazily built DFA of the requested kind.
    ///
    /// `run_forward=false` runs the reverse DFA (the program must have been
    /// reverse compiled) and reports the match start instead of its end;
    /// `want_earliest_match` returns on the first acceptance. A `failed`
    /// result means the DFA ran out of cache memory and the caller should
    /// fall back to the bit-state engine.
    pub fn search_dfa(
        &self,
        context: &[u8],
        text: Range<usize>,
        anchor: Anchor,
        kind: MatchKind,
        want_earliest_match: bool,
        run_forward: bool,
        matches: Option<&mut Vec<usize>>,
    ) -> DfaResult {
        self.get_dfa(kind).search(
            self,
            context,
            text,
            anchor != Anchor::Unanchored,
            want_earliest_match,
            run_forward,
            matches,
        )
    }

    /// Engine entry point: bit-state backtracking search with submatch
    /// extraction. The caller is responsible for checking that the input
    /// is small enough (see `backtrack::should_exec`); `Exec` does this
    /// automatically.
    pub fn search_bitstate(
        &self,
        context: &[u8],
        text: Range<usize>,
        anchor: Anchor,
        kind: MatchKind,
        slots: &mut [Slot],
    ) -> bool {
        crate::backtrack::search(self, context, text, anchor, kind, slots)
    }

    /// Drives the DFA of the given kind over every reachable state and
    /// input class until fixpoint. Returns the number of states, or 0 if
    /// the memory budget was exhausted first. For tests and diagnostics.
    pub fn build_entire_dfa(&self, kind: MatchKind) -> usize {
        self.get_dfa(kind).build_all_states(self)
    }

    /// One line per reachable instruction, in the golden-dump format used
    /// by the compile tests: `<id><. or +> <mnemonic> [payload] -> <out>`.
    /// The `+` marker flags a non-final list element.
    pub fn dump(&self) -> String {
        if self.did_flatten {
            return self.flattened_to_string(self.start);
        }
        let mut q = SparseSet::new(self.len());
        add_to_queue(&mut q, self.start);
        self.prog_to_string(&mut q)
    }

    /// Like [`Program::dump`], but starting from the unanchored entry
    /// point.
    pub fn dump_unanchored(&self) -> String {
        if self.did_flatten {
            return self.flattened_to_string(self.start_unanchored);
        }
        let mut q = SparseSet::new(self.len());
        add_to_queue(&mut q, self.start_unanchored);
        self.prog_to_string(&mut q)
    }

    fn prog_to_string(&self, q: &mut SparseSet) -> String {
        use std::fmt::Write;

        let mut s = String::new();
        let mut i = 0;
        while let Some(id) = q.get(i) {
            i += 1;
            let ip = self.inst(id);
            writeln!(s, "{}. {}", id, ip.dump()).unwrap();
            add_to_queue(q, ip.out);
            match ip.kind {
                InstKind::Alt { out1 } | InstKind::AltMatch { out1 } => {
                    add_to_queue(q, out1)
                }
                _ => {}
            }
        }
        s
    }

    fn flattened_to_string(&self, start: InstPtr) -> String {
        use std::fmt::Write;

        let mut s = String::new();
        for id in start as usize..self.len() {
            let ip = &self.insts[id];
            let marker = if ip.last { '.' } else { '+' };
            writeln!(s, "{}{} {}", id, marker, ip.dump()).unwrap();
        }
        s
    }

    /// Consecutive byte ranges mapped to the same class, one per line:
    /// `[00-09] -> 0`.
    pub fn dump_bytemap(&self) -> String {
        use std::fmt::Write;

        let mut map = String::new();
        let mut c = 0usize;
        while c < 256 {
            let b = self.bytemap[c];
            let lo = c;
            while c < 256 - 1 && self.bytemap[c + 1] == b {
                c += 1;
            }
            writeln!(map, "[{:02x}-{:02x}] -> {}", lo, c, b).unwrap();
            c += 1;
        }
        map
    }
}

fn add_to_queue(q: &mut SparseSet, id: InstPtr) {
    if id != 0 && !q.contains(id) {
        q.insert(id);
    }
}

impl Default for Program {
    fn default() -> Program {
        Program::new()
    }
}

impl std::ops::Deref for Program {
    type Target = [Inst];

    fn deref(&self) -> &[Inst] {
        &self.insts
    }
}

impl<'a> IntoIterator for &'a Program {
    type Item = &'a Inst;
    type IntoIter = slice::Iter<'a, Inst>;

    fn into_iter(self) -> Self::IntoIter {
        self.insts.iter()
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dump())
    }
}

#[cfg(test)]
mod tests {
    use super::{EmptyFlags, Program};

    #[test]
    fn empty_flags_positions() {
        let text = b"a b";
        let at0 = EmptyFlags::at(text, 0);
        assert!(at0.contains(EmptyFlags::BEGIN_TEXT));
        assert!(at0.contains(EmptyFlags::BEGIN_LINE));
        assert!(at0.contains(EmptyFlags::WORD_BOUNDARY));

        let at1 = EmptyFlags::at(text, 1);
        assert!(at1.contains(EmptyFlags::WORD_BOUNDARY));
        let at2 = EmptyFlags::at(text, 2);
        assert!(at2.contains(EmptyFlags::WORD_BOUNDARY));

        let at3 = EmptyFlags::at(text, 3);
        assert!(at3.contains(EmptyFlags::END_TEXT));
        assert!(at3.contains(EmptyFlags::END_LINE));
        assert!(at3.contains(EmptyFlags::WORD_BOUNDARY));
    }

    #[test]
    fn empty_flags_empty_text() {
        // `^$` holds on empty text; `\b` does not.
        let flags = EmptyFlags::at(b"", 0);
        assert!(flags.contains(EmptyFlags::BEGIN_TEXT));
        assert!(flags.contains(EmptyFlags::END_TEXT));
        assert!(flags.contains(EmptyFlags::BEGIN_LINE));
        assert!(flags.contains(EmptyFlags::END_LINE));
        assert!(!flags.contains(EmptyFlags::WORD_BOUNDARY));
        assert!(flags.contains(EmptyFlags::NOT_WORD_BOUNDARY));
    }

    #[test]
    fn empty_flags_newline() {
        let text = b"a\nb";
        let at2 = EmptyFlags::at(text, 2);
        assert!(at2.contains(EmptyFlags::BEGIN_LINE));
        assert!(!at2.contains(EmptyFlags::BEGIN_TEXT));
        let at1 = EmptyFlags::at(text, 1);
        assert!(at1.contains(EmptyFlags::END_LINE));
        assert!(!at1.contains(EmptyFlags::END_TEXT));
    }

    #[test]
    fn word_bytes() {
        assert!(Program::is_word_byte(b'a'));
        assert!(Program::is_word_byte(b'Z'));
        assert!(Program::is_word_byte(b'0'));
        assert!(Program::is_word_byte(b'_'));
        assert!(!Program::is_word_byte(b' '));
        assert!(!Program::is_word_byte(0xFF));
    }
}
