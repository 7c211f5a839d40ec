use std::mem::size_of;

use crate::bytemap::compute_bytemap;
use crate::error::Error;
use crate::optimize::{flatten, optimize};
use crate::options::Options;
use crate::prog::{
    Anchor, EmptyFlags, Inst, InstKind, InstPtr, Program,
};
use crate::repr::Repr;

type Result<T> = std::result::Result<T, Error>;
type ResultOrEmpty = Result<Option<Patch>>;

/// Instruction ids are capped so they fit comfortably in 32 bits with room
/// to spare; several structures index with `2 * len` or `3 * len`.
const MAX_INSTS: usize = 1 << 24;

/// The instruction budget when no size limit is configured.
const DEFAULT_MAX_INSTS: usize = 100_000;

/// The DFA cache floor when no size limit is configured.
const DEFAULT_DFA_MEM: usize = 1 << 20;

#[derive(Debug)]
struct Patch {
    hole: Hole,
    entry: InstPtr,
}

#[derive(Debug)]
enum Hole {
    None,
    One(InstPtr),
    Many(Vec<Hole>),
}

impl Hole {
    fn dup_one(self) -> (Hole, Hole) {
        match self {
            Hole::One(pc) => (Hole::One(pc), Hole::One(pc)),
            Hole::None | Hole::Many(_) => {
                unreachable!("must be called on single hole")
            }
        }
    }
}

#[derive(Clone)]
enum MaybeInst {
    Compiled(Inst),
    Uncompiled(InstHole),
    Split,
    Split1(InstPtr),
    Split2(InstPtr),
}

impl MaybeInst {
    fn fill(&mut self, goto: InstPtr) {
        let filled = match *self {
            MaybeInst::Split => {
                *self = MaybeInst::Split1(goto);
                return;
            }
            MaybeInst::Uncompiled(ref inst) => {
                MaybeInst::Compiled(inst.fill(goto))
            }
            MaybeInst::Split1(goto1) => MaybeInst::Compiled(Inst {
                out: goto1,
                last: false,
                kind: InstKind::Alt { out1: goto },
            }),
            MaybeInst::Split2(goto2) => MaybeInst::Compiled(Inst {
                out: goto,
                last: false,
                kind: InstKind::Alt { out1: goto2 },
            }),
            MaybeInst::Compiled(_) => unreachable!(
                "not all instructions were compiled! \
                 found already compiled instruction"
            ),
        };
        *self = filled;
    }

    fn fill_split(&mut self, goto1: InstPtr, goto2: InstPtr) {
        match *self {
            MaybeInst::Split => {
                *self = MaybeInst::Compiled(Inst {
                    out: goto1,
                    last: false,
                    kind: InstKind::Alt { out1: goto2 },
                });
            }
            _ => unreachable!(
                "must be called on Split instruction"
            ),
        }
    }

    fn half_fill_split_goto1(&mut self, goto1: InstPtr) {
        match *self {
            MaybeInst::Split => *self = MaybeInst::Split1(goto1),
            _ => unreachable!(
                "must be called on Split instruction"
            ),
        }
    }

    fn half_fill_split_goto2(&mut self, goto2: InstPtr) {
        match *self {
            MaybeInst::Split => *self = MaybeInst::Split2(goto2),
            _ => unreachable!(
                "must be called on Split instruction"
            ),
        }
    }

    fn unwrap(self) -> Inst {
        match self {
            MaybeInst::Compiled(inst) => inst,
            _ => unreachable!(
                "not all instructions were compiled! \
                 found uncompiled instruction"
            ),
        }
    }
}

#[derive(Clone)]
enum InstHole {
    ByteRange { lo: u8, hi: u8, foldcase: bool },
    Capture { slot: u32 },
    EmptyWidth { look: EmptyFlags },
}

impl InstHole {
    fn fill(&self, goto: InstPtr) -> Inst {
        let kind = match *self {
            InstHole::ByteRange { lo, hi, foldcase } => {
                InstKind::ByteRange { lo, hi, foldcase }
            }
            InstHole::Capture { slot } => InstKind::Capture { slot },
            InstHole::EmptyWidth { look } => InstKind::EmptyWidth { look },
        };
        Inst { out: goto, last: false, kind }
    }
}

/// A compiler translates an expression tree into a program: a flat sequence
/// of byte-level instructions forming an NFA.
///
/// The compiler works bottom-up over the tree. Each subtree becomes a
/// fragment: an entry instruction plus a list of dangling `Hole`s, the
/// outgoing edges that are not yet patched because the continuation is not
/// known while the subtree is being emitted. Concatenation patches one
/// fragment's holes to the next fragment's entry; alternation chains split
/// instructions and unions the hole lists.
// `Compiler` is only public via the crate root, so avoid deriving `Debug`.
#[allow(missing_debug_implementations)]
pub struct Compiler {
    insts: Vec<MaybeInst>,
    compiled: Program,
    num_exprs: usize,
    reversed: bool,
    latin1: bool,
    anchor: Anchor,
    size_limit: usize,
    max_insts: usize,
    extra_insts: usize,
    suffix_cache: SuffixCache,
    rune_range: RuneRange,
}

/// The in-progress lowering of one character class: the entry of the
/// accumulated alternation plus the dangling holes of every suffix that
/// ends the class.
struct RuneRange {
    entry: Option<InstPtr>,
    holes: Vec<Hole>,
}

impl Compiler {
    /// Create a new compiler with default limits.
    pub fn new() -> Compiler {
        let mut c = Compiler {
            insts: Vec::new(),
            compiled: Program::new(),
            num_exprs: 0,
            reversed: false,
            latin1: false,
            anchor: Anchor::Unanchored,
            size_limit: 0,
            max_insts: DEFAULT_MAX_INSTS,
            extra_insts: 0,
            suffix_cache: SuffixCache::new(1000),
            rune_range: RuneRange { entry: None, holes: Vec::new() },
        };
        // Instruction 0 is always Fail, so an out of 0 can never advance.
        c.push_compiled(Inst { out: 0, last: false, kind: InstKind::Fail });
        c
    }

    /// Apply parse options: encoding and the size limits.
    pub fn options(mut self, options: &Options) -> Compiler {
        self.latin1 = options.latin1;
        self.size_limit = options.size_limit;
        self.max_insts = if options.size_limit == 0 {
            DEFAULT_MAX_INSTS
        } else if options.size_limit <= size_of::<Program>() {
            // No room for anything.
            0
        } else {
            let m =
                (options.size_limit - size_of::<Program>()) / size_of::<Inst>();
            m.min(MAX_INSTS)
        };
        self.compiled.options = options.clone();
        self
    }

    /// When set, the program expects to run over the input backward:
    /// all concatenations are flipped, as is byte order within a rune,
    /// and the recorded anchors trade places.
    pub fn reverse(mut self, yes: bool) -> Compiler {
        self.reversed = yes;
        self
    }

    /// For pattern sets: where every pattern in the set must match.
    pub fn set_anchor(mut self, anchor: Anchor) -> Compiler {
        self.anchor = anchor;
        self
    }

    /// Compile one expression, or several into a set program.
    ///
    /// The compiler is guaranteed to succeed unless the program exceeds the
    /// configured size limit. If the size limit is exceeded, then
    /// compilation stops and returns an error.
    pub fn compile(mut self, exprs: &[Repr]) -> Result<Program> {
        debug_assert!(!exprs.is_empty());
        self.num_exprs = exprs.len();
        if exprs.len() == 1 {
            self.compile_one(&exprs[0])
        } else {
            self.compile_many(exprs)
        }
    }

    fn compile_one(mut self, expr: &Repr) -> Result<Program> {
        let mut expr = expr.clone().simplify();
        self.compiled.ncapture_slots = expr.capture_slots();

        // Record whether the program is anchored, removing the anchors.
        // (They get in the way of other optimizations.)
        let anchor_start = expr.strip_anchor_start();
        let anchor_end = expr.strip_anchor_end();
        if self.reversed {
            self.compiled.anchor_start = anchor_end;
            self.compiled.anchor_end = anchor_start;
        } else {
            self.compiled.anchor_start = anchor_start;
            self.compiled.anchor_end = anchor_end;
        }

        // If the program isn't anchored, give it a second entry point that
        // spins a `(?s:.)*?` loop before the real start, for the engines
        // that cannot bake the loop into their own scanning.
        let mut dotstar_patch = Patch { hole: Hole::None, entry: 0 };
        if !self.compiled.anchor_start {
            dotstar_patch = self.c_dotstar()?;
            self.compiled.start_unanchored = dotstar_patch.entry;
        }

        let patch = self.c(&expr)?.unwrap_or_else(|| self.next_inst());
        if patch.entry == 0 {
            // The whole expression is unmatchable, so both entry points
            // collapse to Fail and anything already emitted is garbage for
            // the flattener to drop.
            self.fill(dotstar_patch.hole, 0);
            self.compiled.start = 0;
            self.compiled.start_unanchored = 0;
            return self.compile_finish();
        }
        self.compiled.start = patch.entry;
        if self.compiled.anchor_start {
            self.compiled.start_unanchored = self.compiled.start;
        } else {
            self.fill(dotstar_patch.hole, patch.entry);
        }
        self.fill_to_next(patch.hole);
        self.push_compiled(Inst {
            out: 0,
            last: false,
            kind: InstKind::Match { id: 0 },
        });
        self.compile_finish()
    }

    fn compile_many(mut self, exprs: &[Repr]) -> Result<Program> {
        debug_assert!(exprs.len() > 1);

        self.compiled.many_match = true;
        self.compiled.npatterns = exprs.len();
        self.compiled.anchor_start = self.anchor != Anchor::Unanchored;
        // End anchoring of sets is expressed with per-pattern `\z`
        // assertions (see Set::add), not with the program-level flag: the
        // many-match engine reports every pattern that fires, and the flag
        // would suppress them all at once.
        self.compiled.anchor_end = false;

        let exprs: Vec<Repr> =
            exprs.iter().map(|e| e.clone().simplify()).collect();

        let mut dotstar_patch = Patch { hole: Hole::None, entry: 0 };
        if !self.compiled.anchor_start {
            dotstar_patch = self.c_dotstar()?;
            self.compiled.start_unanchored = dotstar_patch.entry;
        }
        self.compiled.start = self.insts.len() as InstPtr;
        if self.compiled.anchor_start {
            self.compiled.start_unanchored = self.compiled.start;
        }
        self.fill(dotstar_patch.hole, self.compiled.start);

        let mut prev_hole = Hole::None;
        for (i, expr) in exprs[..exprs.len() - 1].iter().enumerate() {
            self.fill_to_next(prev_hole);
            let split = self.push_split_hole();
            let Patch { hole, entry } =
                self.c(expr)?.unwrap_or_else(|| self.next_inst());
            self.fill_to_next(hole);
            self.push_compiled(Inst {
                out: 0,
                last: false,
                kind: InstKind::Match { id: i as u32 },
            });
            prev_hole = self.fill_split(split, Some(entry), None);
        }
        let i = exprs.len() - 1;
        let Patch { hole, entry } =
            self.c(&exprs[i])?.unwrap_or_else(|| self.next_inst());
        self.fill(prev_hole, entry);
        self.fill_to_next(hole);
        self.push_compiled(Inst {
            out: 0,
            last: false,
            kind: InstKind::Match { id: i as u32 },
        });
        self.compile_finish()
    }

    fn compile_finish(mut self) -> Result<Program> {
        self.check_size()?;
        self.compiled.insts =
            self.insts.into_iter().map(|inst| inst.unwrap()).collect();
        self.compiled.reversed = self.reversed;

        let mut prog = self.compiled;
        optimize(&mut prog);
        flatten(&mut prog);
        compute_bytemap(&mut prog);

        // Whatever memory remains after the program is the DFA's to spend;
        // with no overall limit, the configured cache size applies as is.
        prog.dfa_mem = if self.size_limit == 0 {
            if prog.options.dfa_size_limit == 0 {
                DEFAULT_DFA_MEM
            } else {
                prog.options.dfa_size_limit
            }
        } else {
            let used =
                size_of::<Program>() + prog.len() * size_of::<Inst>();
            self.size_limit.saturating_sub(used)
        };
        Ok(prog)
    }

    /// Compile expr into self.insts, returning a patch on success, or an
    /// error if the program grew past the size limit.
    ///
    /// All of the c_* methods of the compiler share the contract outlined
    /// here.
    ///
    /// The main thing that a c_* method does is mutate `self.insts` to add
    /// a list of mostly compiled instructions required to execute the given
    /// expression. `self.insts` contains MaybeInsts rather than Insts
    /// because there is some backpatching required.
    ///
    /// The `Patch` value returned by each c_* method provides metadata
    /// about the compiled instructions emitted to `self.insts`. The `entry`
    /// member of the patch refers to the first instruction (the entry
    /// point), while the `hole` member contains zero or more offsets to
    /// partial instructions that need to be backpatched. The c_* routine
    /// can't know where its list of instructions are going to jump to after
    /// execution, so it is up to the caller to patch these jumps to point
    /// to the right place. So compiling some expression, e, we would end up
    /// with a situation that looked like:
    ///
    /// ```text
    /// self.insts = [ ..., i1, i2, ..., iexit1, ..., iexitn, ...]
    ///                     ^              ^             ^
    ///                     |                \         /
    ///                   entry                \     /
    ///                                         hole
    /// ```
    ///
    /// To compile two expressions, e1 and e2, concatenated together we
    /// would do:
    ///
    /// ```ignore
    /// let patch1 = self.c(e1);
    /// let patch2 = self.c(e2);
    /// ```
    ///
    /// which leaves us with a situation that looks like
    ///
    /// ```text
    /// self.insts = [ ..., i1, ..., iexit1, ..., i2, ..., iexit2 ]
    ///                     ^        ^            ^        ^
    ///                     |        |            |        |
    ///                entry1        hole1   entry2        hole2
    /// ```
    ///
    /// Then to merge the two patches together into one we would backpatch
    /// hole1 with entry2 and return a new patch that enters at entry1 and
    /// has hole2 for a hole. In fact, if you look at the c_concat method
    /// you will see that it does exactly this, though it handles a list of
    /// expressions rather than just the two that we use for an example.
    ///
    /// Ok(None) is returned when an expression is compiled to no
    /// instruction, and so no patch.entry value makes sense.
    fn c(&mut self, expr: &Repr) -> ResultOrEmpty {
        self.check_size()?;
        match *expr {
            Repr::Empty => self.c_empty(),
            Repr::NoMatch => Ok(Some(Patch { hole: Hole::None, entry: 0 })),
            Repr::Literal(c) => self.c_literal(c),
            Repr::LiteralString(ref chars) => self.c_literal_string(chars),
            Repr::CharClass(ref ranges) => self.c_class(ranges),
            Repr::AnyChar => {
                self.begin_range();
                self.add_rune_range(0x00, 0x10FFFF, false)?;
                Ok(self.end_range())
            }
            Repr::AnyByte => self.c_byte_range(0x00, 0xFF, false),
            Repr::Concat(ref subs) => {
                if self.reversed {
                    self.c_concat(subs.iter().rev())
                } else {
                    self.c_concat(subs.iter())
                }
            }
            Repr::Alternate(ref subs) => self.c_alternate(subs),
            Repr::Star { ref sub, greedy } => {
                self.c_repeat_zero_or_more(sub, greedy)
            }
            Repr::Plus { ref sub, greedy } => {
                self.c_repeat_one_or_more(sub, greedy)
            }
            Repr::Quest { ref sub, greedy } => {
                self.c_repeat_zero_or_one(sub, greedy)
            }
            Repr::Capture { index, ref sub } => {
                self.c_capture(2 * index, sub)
            }
            Repr::BeginLine => self.c_empty_look(if self.reversed {
                EmptyFlags::END_LINE
            } else {
                EmptyFlags::BEGIN_LINE
            }),
            Repr::EndLine => self.c_empty_look(if self.reversed {
                EmptyFlags::BEGIN_LINE
            } else {
                EmptyFlags::END_LINE
            }),
            Repr::BeginText => self.c_empty_look(if self.reversed {
                EmptyFlags::END_TEXT
            } else {
                EmptyFlags::BEGIN_TEXT
            }),
            Repr::EndText => self.c_empty_look(if self.reversed {
                EmptyFlags::BEGIN_TEXT
            } else {
                EmptyFlags::END_TEXT
            }),
            Repr::WordBoundary => {
                self.c_empty_look(EmptyFlags::WORD_BOUNDARY)
            }
            Repr::NoWordBoundary => {
                self.c_empty_look(EmptyFlags::NOT_WORD_BOUNDARY)
            }
            Repr::Repeat { .. } => {
                Err(Error::InvalidTree("Repeat survived simplification"))
            }
        }
    }

    fn c_empty(&mut self) -> ResultOrEmpty {
        // Empty sub-expressions emit no instructions, but still count one
        // virtual instruction against the budget so that a huge repetition
        // of empty sub-expressions cannot spin the compiler for free.
        self.extra_insts += 1;
        Ok(None)
    }

    fn c_dotstar(&mut self) -> Result<Patch> {
        let patch = self
            .c_repeat_zero_or_more(&Repr::AnyByte, false)?
            .expect("dotstar is never empty");
        Ok(patch)
    }

    fn c_capture(&mut self, first_slot: u32, expr: &Repr) -> ResultOrEmpty {
        // Don't ever compile Capture instructions for pattern sets, because
        // sets only report which patterns matched.
        if self.num_exprs > 1 {
            return self.c(expr);
        }
        let entry = self.insts.len() as InstPtr;
        let hole = self.push_hole(InstHole::Capture { slot: first_slot });
        let patch = self.c(expr)?.unwrap_or_else(|| self.next_inst());
        self.fill(hole, patch.entry);
        self.fill_to_next(patch.hole);
        let hole = self.push_hole(InstHole::Capture { slot: first_slot + 1 });
        Ok(Some(Patch { hole, entry }))
    }

    fn c_literal(&mut self, c: char) -> ResultOrEmpty {
        if self.latin1 {
            debug_assert!((c as u32) <= 0xFF);
            return self.c_byte_range(c as u8, c as u8, false);
        }
        if (c as u32) < 0x80 {
            return self.c_byte_range(c as u8, c as u8, false);
        }
        let mut buf = [0u8; 4];
        let n = encode_utf8(c as u32, &mut buf);
        let mut patch: Option<Patch> = None;
        for i in 0..n {
            let i = if self.reversed { n - 1 - i } else { i };
            let p = self
                .c_byte_range(buf[i], buf[i], false)?
                .expect("byte range fragments are never empty");
            patch = Some(match patch {
                None => p,
                Some(prev) => {
                    self.fill(prev.hole, p.entry);
                    Patch { hole: p.hole, entry: prev.entry }
                }
            });
        }
        Ok(patch)
    }

    fn c_literal_string(&mut self, chars: &[char]) -> ResultOrEmpty {
        if chars.is_empty() {
            return self.c_empty();
        }
        let mut patch: Option<Patch> = None;
        for i in 0..chars.len() {
            let i = if self.reversed { chars.len() - 1 - i } else { i };
            let p = match self.c_literal(chars[i])? {
                Some(p) => p,
                None => continue,
            };
            patch = Some(match patch {
                None => p,
                Some(prev) => {
                    self.fill(prev.hole, p.entry);
                    Patch { hole: p.hole, entry: prev.entry }
                }
            });
        }
        Ok(patch)
    }

    fn c_byte_range(
        &mut self,
        lo: u8,
        hi: u8,
        foldcase: bool,
    ) -> ResultOrEmpty {
        let hole = self.push_hole(InstHole::ByteRange { lo, hi, foldcase });
        Ok(Some(Patch { hole, entry: self.insts.len() as InstPtr - 1 }))
    }

    fn c_empty_look(&mut self, look: EmptyFlags) -> ResultOrEmpty {
        let hole = self.push_hole(InstHole::EmptyWidth { look });
        Ok(Some(Patch { hole, entry: self.insts.len() as InstPtr - 1 }))
    }

    fn c_class(&mut self, ranges: &[(char, char)]) -> ResultOrEmpty {
        if ranges.is_empty() {
            // An empty class can't match anything.
            return Ok(Some(Patch { hole: Hole::None, entry: 0 }));
        }

        // ASCII case-folding optimization: if the class behaves the same on
        // A-Z as it does on a-z, discard any ranges wholly contained in A-Z
        // and mark the other ranges as folding. This reduces the size of a
        // program for (?i)abc from 3 instructions per letter to 1.
        let foldascii = folds_ascii(ranges);

        // A character class is just a big alternation of the different
        // rune ranges in the class.
        self.begin_range();
        for &(lo, hi) in ranges {
            if foldascii && 'A' <= lo && hi <= 'Z' {
                continue;
            }
            // If this range contains all of A-Za-z or none of it, the fold
            // flag is unnecessary; don't bother.
            let mut fold = foldascii;
            if (lo <= 'A' && 'z' <= hi) || hi < 'A' || 'z' < lo {
                fold = false;
            }
            self.add_rune_range(lo as u32, hi as u32, fold)?;
        }
        match self.end_range() {
            Some(patch) => Ok(Some(patch)),
            // Everything was discarded: nothing can match.
            None => Ok(Some(Patch { hole: Hole::None, entry: 0 })),
        }
    }

    fn c_concat<'a, I>(&mut self, exprs: I) -> ResultOrEmpty
    where
        I: IntoIterator<Item = &'a Repr>,
    {
        let mut exprs = exprs.into_iter();
        let Patch { mut hole, entry } = loop {
            match exprs.next() {
                None => return Ok(None),
                Some(e) => {
                    if let Some(p) = self.c(e)? {
                        break p;
                    }
                }
            }
        };
        for e in exprs {
            if let Some(p) = self.c(e)? {
                self.fill(hole, p.entry);
                hole = p.hole;
            }
        }
        Ok(Some(Patch { hole, entry }))
    }

    fn c_alternate(&mut self, exprs: &[Repr]) -> ResultOrEmpty {
        debug_assert!(
            exprs.len() >= 2,
            "alternates must have at least 2 exprs"
        );

        // Initial entry point is always the first split.
        let first_split_entry = self.insts.len() as InstPtr;

        // Save up all of the holes from each alternate. They will all get
        // patched to point to the same location.
        let mut holes = Vec::new();

        // true indicates that the hole is a split where we want to fill
        // the second branch.
        let mut prev_hole = (Hole::None, false);
        for e in &exprs[0..exprs.len() - 1] {
            if prev_hole.1 {
                let next = self.insts.len() as InstPtr;
                self.fill_split(prev_hole.0, None, Some(next));
            } else {
                self.fill_to_next(prev_hole.0);
            }
            let split = self.push_split_hole();
            if let Some(Patch { hole, entry }) = self.c(e)? {
                holes.push(hole);
                prev_hole = (self.fill_split(split, Some(entry), None), false);
            } else {
                let (split1, split2) = split.dup_one();
                holes.push(split1);
                prev_hole = (split2, true);
            }
        }
        if let Some(Patch { hole, entry }) = self.c(&exprs[exprs.len() - 1])? {
            holes.push(hole);
            if prev_hole.1 {
                self.fill_split(prev_hole.0, None, Some(entry));
            } else {
                self.fill(prev_hole.0, entry);
            }
        } else {
            // We ignore prev_hole.1. When it's true, it means we have two
            // empty branches both pushing prev_hole.0 into holes, so both
            // branches will go to the same place anyway.
            holes.push(prev_hole.0);
        }
        Ok(Some(Patch { hole: Hole::Many(holes), entry: first_split_entry }))
    }

    fn c_repeat_zero_or_one(
        &mut self,
        expr: &Repr,
        greedy: bool,
    ) -> ResultOrEmpty {
        let split_entry = self.insts.len() as InstPtr;
        let split = self.push_split_hole();
        let Patch { hole: hole_rep, entry: entry_rep } = match self.c(expr)? {
            Some(p) => p,
            None => return self.pop_split_hole(),
        };
        let split_hole = if greedy {
            self.fill_split(split, Some(entry_rep), None)
        } else {
            self.fill_split(split, None, Some(entry_rep))
        };
        let holes = vec![hole_rep, split_hole];
        Ok(Some(Patch { hole: Hole::Many(holes), entry: split_entry }))
    }

    fn c_repeat_zero_or_more(
        &mut self,
        expr: &Repr,
        greedy: bool,
    ) -> ResultOrEmpty {
        let split_entry = self.insts.len() as InstPtr;
        let split = self.push_split_hole();
        let Patch { hole: hole_rep, entry: entry_rep } = match self.c(expr)? {
            Some(p) => p,
            None => return self.pop_split_hole(),
        };

        self.fill(hole_rep, split_entry);
        let split_hole = if greedy {
            self.fill_split(split, Some(entry_rep), None)
        } else {
            self.fill_split(split, None, Some(entry_rep))
        };
        Ok(Some(Patch { hole: split_hole, entry: split_entry }))
    }

    fn c_repeat_one_or_more(
        &mut self,
        expr: &Repr,
        greedy: bool,
    ) -> ResultOrEmpty {
        let Patch { hole: hole_rep, entry: entry_rep } = match self.c(expr)? {
            Some(p) => p,
            None => return Ok(None),
        };
        self.fill_to_next(hole_rep);
        let split = self.push_split_hole();

        let split_hole = if greedy {
            self.fill_split(split, Some(entry_rep), None)
        } else {
            self.fill_split(split, None, Some(entry_rep))
        };
        Ok(Some(Patch { hole: split_hole, entry: entry_rep }))
    }

    // ---- rune range lowering -------------------------------------------

    // Converts rune ranges into fragments that recognize the bytes that
    // would make up those runes in the current encoding (Latin-1 or UTF-8).
    // This lets the machines work byte-by-byte even with multibyte
    // encodings.

    fn begin_range(&mut self) {
        // The cache must not carry entries across classes: instruction
        // identities from a prior class would leak into this one.
        self.suffix_cache.clear();
        self.rune_range.entry = None;
        self.rune_range.holes.clear();
    }

    fn end_range(&mut self) -> Option<Patch> {
        let entry = self.rune_range.entry.take()?;
        let holes = std::mem::take(&mut self.rune_range.holes);
        Some(Patch { hole: Hole::Many(holes), entry })
    }

    fn add_rune_range(
        &mut self,
        lo: u32,
        hi: u32,
        foldcase: bool,
    ) -> Result<()> {
        if self.latin1 {
            self.add_rune_range_latin1(lo, hi, foldcase)
        } else {
            self.add_rune_range_utf8(lo, hi, foldcase)
        }
    }

    fn add_rune_range_latin1(
        &mut self,
        lo: u32,
        hi: u32,
        foldcase: bool,
    ) -> Result<()> {
        // Latin-1 is easy: runes are bytes.
        if lo > hi || lo > 0xFF {
            return Ok(());
        }
        let hi = hi.min(0xFF);
        let ip = self.rune_byte_suffix(lo as u8, hi as u8, foldcase, None)?;
        self.add_suffix(ip)
    }

    fn add_rune_range_utf8(
        &mut self,
        lo: u32,
        hi: u32,
        foldcase: bool,
    ) -> Result<()> {
        if lo > hi {
            return Ok(());
        }

        // Pick off 80-10FFFF as a common special case that can bypass the
        // slow rune cache.
        if lo == 0x80 && hi == 0x10FFFF && !self.reversed {
            return self.add_80_10ffff();
        }

        // Split range into same-length sized ranges.
        for i in 1..4 {
            let max = max_rune(i);
            if lo <= max && max < hi {
                self.add_rune_range_utf8(lo, max, foldcase)?;
                self.add_rune_range_utf8(max + 1, hi, foldcase)?;
                return Ok(());
            }
        }

        // ASCII range is always a special case.
        if hi < 0x80 {
            let ip =
                self.rune_byte_suffix(lo as u8, hi as u8, foldcase, None)?;
            return self.add_suffix(ip);
        }

        // Split range into sections that agree on leading bytes.
        for i in 1..4 {
            let m: u32 = (1 << (6 * i)) - 1; // last i bytes of a sequence
            if (lo & !m) != (hi & !m) {
                if (lo & m) != 0 {
                    self.add_rune_range_utf8(lo, lo | m, foldcase)?;
                    self.add_rune_range_utf8((lo | m) + 1, hi, foldcase)?;
                    return Ok(());
                }
                if (hi & m) != m {
                    self.add_rune_range_utf8(lo, (hi & !m) - 1, foldcase)?;
                    self.add_rune_range_utf8(hi & !m, hi, foldcase)?;
                    return Ok(());
                }
            }
        }

        // Finally. Generate byte matching equivalent for lo-hi.
        let mut ulo = [0u8; 4];
        let mut uhi = [0u8; 4];
        let n = encode_utf8(lo, &mut ulo);
        let m = encode_utf8(hi, &mut uhi);
        debug_assert_eq!(n, m);

        let mut ip: Option<InstPtr> = None;
        if self.reversed {
            for i in 0..n {
                ip = Some(
                    self.rune_byte_suffix(ulo[i], uhi[i], false, ip)?,
                );
            }
        } else {
            for i in (0..n).rev() {
                ip = Some(
                    self.rune_byte_suffix(ulo[i], uhi[i], false, ip)?,
                );
            }
        }
        self.add_suffix(ip.expect("multibyte range emits at least one inst"))
    }

    /// Table describing how to make a UTF-8 matching machine for the rune
    /// range 80-10FFFF. The range happens frequently enough (for example
    /// `.` and `[^a-z]`) and the rune cache is slow enough that it is worth
    /// special handling. The entries marked lead start whole sequences.
    fn add_80_10ffff(&mut self) -> Result<()> {
        // (next, lo, hi); next < 0 ends a chain.
        static PROG_80_10FFFF: &[(i8, u8, u8)] = &[
            // Two-byte
            (-1, 0x80, 0xBF), // 0:  80-BF
            (0, 0xC2, 0xDF),  // 1:  C2-DF 80-BF [lead]
            // Three-byte
            (0, 0xA0, 0xBF), // 2:  A0-BF 80-BF
            (2, 0xE0, 0xE0), // 3:  E0 A0-BF 80-BF [lead]
            (0, 0x80, 0xBF), // 4:  80-BF 80-BF
            (4, 0xE1, 0xEF), // 5:  E1-EF 80-BF 80-BF [lead]
            // Four-byte
            (4, 0x90, 0xBF), // 6:  90-BF 80-BF 80-BF
            (6, 0xF0, 0xF0), // 7:  F0 90-BF 80-BF 80-BF [lead]
            (4, 0x80, 0xBF), // 8:  80-BF 80-BF 80-BF
            (8, 0xF1, 0xF3), // 9:  F1-F3 80-BF 80-BF 80-BF [lead]
            (4, 0x80, 0x8F), // 10: 80-8F 80-BF 80-BF
            (10, 0xF4, 0xF4), // 11: F4 80-8F 80-BF 80-BF [lead]
        ];

        let mut insts = [0 as InstPtr; 12];
        for (i, &(next, lo, hi)) in PROG_80_10FFFF.iter().enumerate() {
            let next_ip =
                if next >= 0 { Some(insts[next as usize]) } else { None };
            insts[i] = self.uncached_rune_byte_suffix(lo, hi, false, next_ip)?;
            if (lo & 0xC0) != 0x80 {
                self.add_suffix(insts[i])?;
            }
        }
        Ok(())
    }

    fn uncached_rune_byte_suffix(
        &mut self,
        lo: u8,
        hi: u8,
        foldcase: bool,
        next: Option<InstPtr>,
    ) -> Result<InstPtr> {
        self.check_size()?;
        let patch = self
            .c_byte_range(lo, hi, foldcase)?
            .expect("byte range fragments are never empty");
        match next {
            Some(next) => self.fill(patch.hole, next),
            None => self.rune_range.holes.push(patch.hole),
        }
        Ok(patch.entry)
    }

    fn rune_byte_suffix(
        &mut self,
        lo: u8,
        hi: u8,
        foldcase: bool,
        next: Option<InstPtr>,
    ) -> Result<InstPtr> {
        // In Latin-1 there's no point in caching; in forward UTF-8 only
        // continuation bytes are worth caching.
        if self.latin1
            || (!self.reversed && !(0x80 <= lo && hi <= 0xBF))
        {
            return self.uncached_rune_byte_suffix(lo, hi, foldcase, next);
        }
        let key = SuffixCacheKey {
            from_inst: next.unwrap_or(0),
            start: lo,
            end: hi,
            foldcase,
        };
        // The lookup speculatively records the instruction we are about to
        // emit; on a hit nothing was emitted yet, so nothing leaks.
        let pc = self.insts.len() as InstPtr;
        if let Some(cached) = self.suffix_cache.get(key, pc) {
            return Ok(cached);
        }
        let ip = self.uncached_rune_byte_suffix(lo, hi, foldcase, next)?;
        debug_assert_eq!(ip, pc);
        Ok(ip)
    }

    fn add_suffix(&mut self, ip: InstPtr) -> Result<()> {
        let entry = match self.rune_range.entry {
            None => {
                self.rune_range.entry = Some(ip);
                return Ok(());
            }
            Some(entry) => entry,
        };

        if !self.latin1 {
            // Factor common prefixes: try to graft the new suffix chain
            // onto the tree accumulated so far rather than alternating
            // whole chains. Any instructions the graft strands become
            // unreachable and are dropped by the flattener.
            let root = self.add_suffix_recursive(entry, ip)?;
            self.rune_range.entry = Some(root);
            return Ok(());
        }

        self.check_size()?;
        let alt = self.insts.len() as InstPtr;
        self.push_compiled(Inst {
            out: entry,
            last: false,
            kind: InstKind::Alt { out1: ip },
        });
        self.rune_range.entry = Some(alt);
        Ok(())
    }

    fn add_suffix_recursive(
        &mut self,
        root: InstPtr,
        id: InstPtr,
    ) -> Result<InstPtr> {
        // The most recently added branch of an alternation is its out1;
        // ranges arrive sorted, so common prefixes cluster there.
        let br = match self.inst_kind(root) {
            SuffixInst::Alt { out1 } => out1,
            SuffixInst::ByteRange { .. } => root,
        };

        if self.byte_range_equal(br, id) {
            let br_out = self.compiled_out(br);
            let id_out = self.compiled_out(id);
            let out = self.add_suffix_recursive(br_out, id_out)?;
            self.set_compiled_out(br, out);
            return Ok(root);
        }

        self.check_size()?;
        let alt = self.insts.len() as InstPtr;
        self.push_compiled(Inst {
            out: root,
            last: false,
            kind: InstKind::Alt { out1: id },
        });
        Ok(alt)
    }

    fn inst_kind(&self, id: InstPtr) -> SuffixInst {
        match self.insts[id as usize] {
            MaybeInst::Compiled(Inst {
                kind: InstKind::Alt { out1 }, ..
            }) => SuffixInst::Alt { out1 },
            MaybeInst::Compiled(Inst {
                kind: InstKind::ByteRange { lo, hi, foldcase },
                ..
            })
            | MaybeInst::Uncompiled(InstHole::ByteRange {
                lo,
                hi,
                foldcase,
            }) => SuffixInst::ByteRange { lo, hi, foldcase },
            _ => unreachable!("rune suffixes are byte ranges or alts"),
        }
    }

    fn byte_range_equal(&self, id1: InstPtr, id2: InstPtr) -> bool {
        match (self.inst_kind(id1), self.inst_kind(id2)) {
            (
                SuffixInst::ByteRange { lo: lo1, hi: hi1, foldcase: f1 },
                SuffixInst::ByteRange { lo: lo2, hi: hi2, foldcase: f2 },
            ) => lo1 == lo2 && hi1 == hi2 && f1 == f2,
            _ => false,
        }
    }

    fn compiled_out(&self, id: InstPtr) -> InstPtr {
        match self.insts[id as usize] {
            MaybeInst::Compiled(ref inst) => inst.out,
            _ => unreachable!("suffix interior instructions are compiled"),
        }
    }

    fn set_compiled_out(&mut self, id: InstPtr, out: InstPtr) {
        match self.insts[id as usize] {
            MaybeInst::Compiled(ref mut inst) => inst.out = out,
            _ => unreachable!("suffix interior instructions are compiled"),
        }
    }

    // ---- plumbing ------------------------------------------------------

    /// Can be used as a default value for the c_* functions when the call
    /// to c_* is followed by inserting at least one instruction that is
    /// always executed after the ones written by the c_* function.
    fn next_inst(&self) -> Patch {
        Patch { hole: Hole::None, entry: self.insts.len() as InstPtr }
    }

    fn fill(&mut self, hole: Hole, goto: InstPtr) {
        match hole {
            Hole::None => {}
            Hole::One(pc) => {
                self.insts[pc as usize].fill(goto);
            }
            Hole::Many(holes) => {
                for hole in holes {
                    self.fill(hole, goto);
                }
            }
        }
    }

    fn fill_to_next(&mut self, hole: Hole) {
        let next = self.insts.len() as InstPtr;
        self.fill(hole, next);
    }

    fn fill_split(
        &mut self,
        hole: Hole,
        goto1: Option<InstPtr>,
        goto2: Option<InstPtr>,
    ) -> Hole {
        match hole {
            Hole::None => Hole::None,
            Hole::One(pc) => match (goto1, goto2) {
                (Some(goto1), Some(goto2)) => {
                    self.insts[pc as usize].fill_split(goto1, goto2);
                    Hole::None
                }
                (Some(goto1), None) => {
                    self.insts[pc as usize].half_fill_split_goto1(goto1);
                    Hole::One(pc)
                }
                (None, Some(goto2)) => {
                    self.insts[pc as usize].half_fill_split_goto2(goto2);
                    Hole::One(pc)
                }
                (None, None) => unreachable!(
                    "at least one of the split holes must be filled"
                ),
            },
            Hole::Many(holes) => {
                let mut new_holes = Vec::new();
                for hole in holes {
                    new_holes.push(self.fill_split(hole, goto1, goto2));
                }
                if new_holes.is_empty() {
                    Hole::None
                } else if new_holes.len() == 1 {
                    new_holes.pop().expect("non-empty")
                } else {
                    Hole::Many(new_holes)
                }
            }
        }
    }

    fn push_compiled(&mut self, inst: Inst) -> InstPtr {
        let pc = self.insts.len() as InstPtr;
        self.insts.push(MaybeInst::Compiled(inst));
        pc
    }

    fn push_hole(&mut self, inst: InstHole) -> Hole {
        let hole = self.insts.len() as InstPtr;
        self.insts.push(MaybeInst::Uncompiled(inst));
        Hole::One(hole)
    }

    fn push_split_hole(&mut self) -> Hole {
        let hole = self.insts.len() as InstPtr;
        self.insts.push(MaybeInst::Split);
        Hole::One(hole)
    }

    fn pop_split_hole(&mut self) -> ResultOrEmpty {
        self.insts.pop();
        Ok(None)
    }

    fn check_size(&self) -> Result<()> {
        if self.insts.len() + self.extra_insts > self.max_insts {
            Err(Error::CompiledTooBig(self.size_limit))
        } else {
            Ok(())
        }
    }
}

impl Default for Compiler {
    fn default() -> Compiler {
        Compiler::new()
    }
}

enum SuffixInst {
    Alt { out1: InstPtr },
    ByteRange { lo: u8, hi: u8, foldcase: bool },
}

/// The maximum rune encoded by a UTF-8 sequence of the given length.
fn max_rune(len: u32) -> u32 {
    let b = if len == 1 { 7 } else { 8 - (len + 1) + 6 * (len - 1) };
    (1 << b) - 1
}

/// Plain arithmetic UTF-8 encoding over `u32`, because range splitting
/// walks through values (like surrogates) that `char` refuses to hold.
fn encode_utf8(r: u32, buf: &mut [u8; 4]) -> usize {
    if r < 0x80 {
        buf[0] = r as u8;
        1
    } else if r < 0x800 {
        buf[0] = 0xC0 | (r >> 6) as u8;
        buf[1] = 0x80 | (r & 0x3F) as u8;
        2
    } else if r < 0x10000 {
        buf[0] = 0xE0 | (r >> 12) as u8;
        buf[1] = 0x80 | ((r >> 6) & 0x3F) as u8;
        buf[2] = 0x80 | (r & 0x3F) as u8;
        3
    } else {
        buf[0] = 0xF0 | (r >> 18) as u8;
        buf[1] = 0x80 | ((r >> 12) & 0x3F) as u8;
        buf[2] = 0x80 | ((r >> 6) & 0x3F) as u8;
        buf[3] = 0x80 | (r & 0x3F) as u8;
        4
    }
}

/// Does the class behave identically on A-Z and a-z?
fn folds_ascii(ranges: &[(char, char)]) -> bool {
    fn contains(ranges: &[(char, char)], c: char) -> bool {
        ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi)
    }
    let mut any = false;
    for c in b'a'..=b'z' {
        let lower = contains(ranges, c as char);
        let upper = contains(ranges, (c - b'a' + b'A') as char);
        if lower != upper {
            return false;
        }
        any = any || lower;
    }
    any
}

/// `SuffixCache` is a simple bounded hash map for caching suffix entries in
/// UTF-8 automata. For example, consider the Unicode range \u{0}-\u{FFFF}.
/// The set of byte ranges looks like this:
///
/// [0-7F]
/// [C2-DF][80-BF]
/// [E0][A0-BF][80-BF]
/// [E1-EC][80-BF][80-BF]
/// [ED][80-9F][80-BF]
/// [EE-EF][80-BF][80-BF]
///
/// Each line above translates to one alternate in the compiled regex
/// program. However, all but one of the alternates end in the same suffix,
/// which is a waste of an instruction. The suffix cache facilitates reusing
/// them across alternates.
///
/// Note that a HashMap could be trivially used for this, but we don't need
/// its overhead. Some small bounded space (LRU style) is more than enough.
/// This uses a similar idea to `SparseSet`, except it uses hashes as
/// original indices and then compares full keys for validation against the
/// `dense` array.
#[derive(Debug)]
struct SuffixCache {
    sparse: Box<[usize]>,
    dense: Vec<SuffixCacheEntry>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct SuffixCacheEntry {
    key: SuffixCacheKey,
    pc: InstPtr,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct SuffixCacheKey {
    from_inst: InstPtr,
    start: u8,
    end: u8,
    foldcase: bool,
}

impl SuffixCache {
    fn new(size: usize) -> SuffixCache {
        SuffixCache {
            sparse: vec![0usize; size].into_boxed_slice(),
            dense: Vec::with_capacity(size),
        }
    }

    fn get(&mut self, key: SuffixCacheKey, pc: InstPtr) -> Option<InstPtr> {
        let hash = self.hash(&key);
        let pos = &mut self.sparse[hash];
        if let Some(entry) = self.dense.get(*pos) {
            if entry.key == key {
                return Some(entry.pc);
            }
        }
        *pos = self.dense.len();
        self.dense.push(SuffixCacheEntry { key, pc });
        None
    }

    fn clear(&mut self) {
        self.dense.clear();
    }

    fn hash(&self, suffix: &SuffixCacheKey) -> usize {
        // Basic FNV-1a hash as described:
        // https://en.wikipedia.org/wiki/Fowler%E2%80%93Noll%E2%80%93Vo_hash_function
        const FNV_PRIME: u64 = 1_099_511_628_211;
        let mut h = 14_695_981_039_346_656_037;
        h = (h ^ (suffix.from_inst as u64)).wrapping_mul(FNV_PRIME);
        h = (h ^ (suffix.start as u64)).wrapping_mul(FNV_PRIME);
        h = (h ^ (suffix.end as u64)).wrapping_mul(FNV_PRIME);
        h = (h ^ (suffix.foldcase as u64)).wrapping_mul(FNV_PRIME);
        (h as usize) % self.sparse.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{encode_utf8, folds_ascii, max_rune};

    #[test]
    fn utf8_length_boundaries() {
        assert_eq!(max_rune(1), 0x7F);
        assert_eq!(max_rune(2), 0x7FF);
        assert_eq!(max_rune(3), 0xFFFF);
        assert_eq!(max_rune(4), 0x1FFFFF);
    }

    #[test]
    fn utf8_encoding_matches_std() {
        for &c in &['a', 'ß', '本', '\u{10348}', '\u{10FFFF}'] {
            let mut ours = [0u8; 4];
            let n = encode_utf8(c as u32, &mut ours);
            let mut theirs = [0u8; 4];
            let s = c.encode_utf8(&mut theirs);
            assert_eq!(&ours[..n], s.as_bytes());
        }
    }

    #[test]
    fn utf8_encodes_surrogates_arithmetically() {
        let mut buf = [0u8; 4];
        let n = encode_utf8(0xD800, &mut buf);
        assert_eq!(&buf[..n], &[0xED, 0xA0, 0x80]);
    }

    #[test]
    fn ascii_fold_detection() {
        assert!(folds_ascii(&[('A', 'A'), ('a', 'a')]));
        assert!(folds_ascii(&[('A', 'Z'), ('a', 'z')]));
        assert!(!folds_ascii(&[('A', 'A')]));
        assert!(!folds_ascii(&[('A', 'Z'), ('a', 'y')]));
        // No letters at all: nothing to fold.
        assert!(!folds_ascii(&[('0', '9')]));
    }
}
