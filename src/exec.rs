use std::ops::Range;

use log::debug;

use crate::backtrack;
use crate::compile::Compiler;
use crate::error::Error;
use crate::literal::{self, LiteralSearcher};
use crate::options::Options;
use crate::prog::{MatchKind, Program};
use crate::repr::Repr;
use crate::translate::parse;

pub use crate::prog::Anchor;

/// A single capture position: a byte offset, or `None` if the slot's group
/// did not participate in the match. Slot `2n` opens group `n`, slot
/// `2n+1` closes it; slots 0 and 1 bracket the whole match.
pub type Slot = Option<usize>;

/// A builder for [`Exec`], separating the parse options from the pattern.
#[derive(Clone, Debug)]
pub struct ExecBuilder {
    pattern: String,
    options: Options,
}

impl ExecBuilder {
    /// Starts building an executor for `pattern` with default options.
    pub fn new(pattern: &str) -> ExecBuilder {
        ExecBuilder { pattern: pattern.to_string(), options: Options::new() }
    }

    /// Replaces the parse options.
    pub fn options(mut self, options: Options) -> ExecBuilder {
        self.options = options;
        self
    }

    /// Parses and compiles the pattern, forward and reverse.
    pub fn build(self) -> Result<Exec, Error> {
        let re = parse(&self.pattern, &self.options)?;
        build_exec(&re, &self.options)
    }
}

fn build_exec(re: &Repr, options: &Options) -> Result<Exec, Error> {
    let prog = Compiler::new()
        .options(options)
        .compile(std::slice::from_ref(re))?;
    let prog_reverse = Compiler::new()
        .options(options)
        .reverse(true)
        .compile(std::slice::from_ref(re))?;
    // One mandatory literal feeds plain substring search; otherwise the
    // per-branch literal heads feed Aho-Corasick.
    let prefixes = match literal::required_prefix_for_accel(re) {
        Some(lit) => LiteralSearcher::single(lit),
        None => LiteralSearcher::prefixes(re),
    };
    // An anchored pattern with a literal head splits into a byte
    // comparison plus an executor for what follows. The recursion
    // terminates immediately: the remainder has no leading `\A`.
    let required = match literal::required_prefix(re) {
        Some((prefix, rest)) => Some(RequiredPrefix {
            prefix,
            rest: Box::new(build_exec(&rest, options)?),
        }),
        None => None,
    };
    Ok(Exec { prog, prog_reverse, prefixes, required })
}

/// `Exec` manages the execution of a compiled regular expression.
///
/// It owns the forward program, the reverse program (used by the DFA to
/// locate match starts), and the literal-prefix accelerator, and picks a
/// matching engine per search: the bit-state backtracker when program and
/// text are small enough for its bitmap, otherwise the DFA, with each
/// falling back to the other when memory or size budgets say so.
#[derive(Debug)]
pub struct Exec {
    prog: Program,
    prog_reverse: Program,
    prefixes: LiteralSearcher,
    required: Option<RequiredPrefix>,
}

/// The literal every match must begin with when the pattern is anchored to
/// the start of text, plus an executor for what follows it. Comparing the
/// bytes up front is cheaper than running any engine over them.
#[derive(Debug)]
struct RequiredPrefix {
    prefix: Vec<u8>,
    rest: Box<Exec>,
}

impl Exec {
    /// Parses and compiles `pattern` with default options.
    pub fn new(pattern: &str) -> Result<Exec, Error> {
        ExecBuilder::new(pattern).build()
    }

    /// The compiled forward program.
    pub fn program(&self) -> &Program {
        &self.prog
    }

    /// The compiled reverse program.
    pub fn reverse_program(&self) -> &Program {
        &self.prog_reverse
    }

    /// Does the pattern match anywhere in `text`?
    pub fn is_match(&self, text: &[u8]) -> Result<bool, Error> {
        self.search(
            text,
            0..text.len(),
            Anchor::Unanchored,
            MatchKind::FirstMatch,
            &mut [],
        )
    }

    /// The bounds of the leftmost-first match in `text`, if any.
    pub fn find(&self, text: &[u8]) -> Result<Option<(usize, usize)>, Error> {
        let mut slots = [None, None];
        let matched = self.search(
            text,
            0..text.len(),
            Anchor::Unanchored,
            MatchKind::FirstMatch,
            &mut slots,
        )?;
        match (matched, slots[0], slots[1]) {
            (true, Some(s), Some(e)) => Ok(Some((s, e))),
            _ => Ok(None),
        }
    }

    /// Searches `text` (a subrange of `context`) and reports whether the
    /// pattern matched, filling any provided capture slots.
    ///
    /// `context` supplies the surroundings for `^`, `$`, `\A`, `\z` and
    /// `\b` at the edges of `text`. Pass `slots` of length 0 for a yes/no
    /// answer, length 2 for the match bounds, or `2 * (groups + 1)` for
    /// full submatch extraction.
    ///
    /// The only error is [`Error::DfaOutOfMemory`], raised when the DFA
    /// exceeded its cache budget and the bit-state engine's bitmap cannot
    /// cover the input either.
    pub fn search(
        &self,
        context: &[u8],
        text: Range<usize>,
        anchor: Anchor,
        kind: MatchKind,
        slots: &mut [Slot],
    ) -> Result<bool, Error> {
        debug_assert!(text.start <= text.end && text.end <= context.len());
        for slot in slots.iter_mut() {
            *slot = None;
        }
        if kind == MatchKind::ManyMatch {
            return Err(Error::InvalidTree(
                "many-match searches go through a pattern Set",
            ));
        }

        // An anchored pattern with a mandatory literal head: compare the
        // bytes directly, then run only the rest of the pattern over what
        // follows them.
        if let Some(ref req) = self.required {
            // The stripped `\A` pins the match to the start of the
            // context, prefix included.
            if text.start != 0
                || !context[..text.end].starts_with(&req.prefix)
            {
                return Ok(false);
            }
            let inner_anchor = if anchor == Anchor::FullMatch
                || kind == MatchKind::FullMatch
            {
                Anchor::FullMatch
            } else {
                Anchor::Anchored
            };
            let matched = req.rest.search(
                context,
                req.prefix.len()..text.end,
                inner_anchor,
                kind,
                slots,
            )?;
            if matched && slots.len() >= 2 {
                slots[0] = Some(text.start);
            }
            return Ok(matched);
        }

        // The backtracker handles everything (captures included) when its
        // bitmap fits, and on inputs that small it tends to win anyway.
        if backtrack::should_exec(self.prog.len(), text.end - text.start) {
            return Ok(backtrack::search(
                &self.prog, context, text, anchor, kind, slots,
            ));
        }

        self.search_dfa(context, text, anchor, kind, slots)
    }

    fn search_dfa(
        &self,
        context: &[u8],
        text: Range<usize>,
        anchor: Anchor,
        kind: MatchKind,
        slots: &mut [Slot],
    ) -> Result<bool, Error> {
        let anchored = anchor != Anchor::Unanchored;
        let want_full =
            anchor == Anchor::FullMatch || kind == MatchKind::FullMatch;

        // Skip ahead to the first place a match could possibly start.
        let mut search_start = text.start;
        if !anchored && !self.prog.anchor_start && !self.prefixes.is_empty()
        {
            match self.prefixes.find(&context[..text.end], search_start) {
                Some(pos) => search_start = pos,
                None => return Ok(false),
            }
        }

        let dfa_kind =
            if kind == MatchKind::FirstMatch && !self.prog.anchor_end {
                MatchKind::FirstMatch
            } else {
                MatchKind::LongestMatch
            };
        // A bare "is there a match" question can stop at the earliest
        // acceptance; anything that needs bounds wants the full scan.
        let earliest = slots.is_empty()
            && !want_full
            && kind == MatchKind::FirstMatch
            && !self.prog.anchor_end;

        let fwd = self.prog.get_dfa(dfa_kind).search(
            &self.prog,
            context,
            search_start..text.end,
            anchored,
            earliest,
            true,
            None,
        );
        if fwd.failed {
            return self.search_fallback(context, text, anchor, kind, slots);
        }
        if !fwd.matched {
            return Ok(false);
        }
        let ep = fwd.ep;
        if want_full && ep != text.end {
            return Ok(false);
        }
        if slots.len() < 2 {
            return Ok(true);
        }

        // Find the start of the match by running the reverse program from
        // the end of the match back to the left.
        let sp = if anchored || self.prog.anchor_start {
            text.start
        } else {
            let rev = self.prog_reverse.get_dfa(MatchKind::LongestMatch).search(
                &self.prog_reverse,
                context,
                search_start..ep,
                true,
                false,
                false,
                None,
            );
            if rev.failed {
                return self
                    .search_fallback(context, text, anchor, kind, slots);
            }
            debug_assert!(rev.matched, "reverse search must find the start");
            if !rev.matched {
                return Ok(false);
            }
            rev.ep
        };

        slots[0] = Some(sp);
        slots[1] = Some(ep);

        // Submatches come from the backtracker, confined to the match.
        if slots.len() > 2 && self.prog.ncapture_slots > 2 {
            let filled = backtrack::should_exec(self.prog.len(), ep - sp)
                && backtrack::search(
                    &self.prog,
                    context,
                    sp..ep,
                    Anchor::FullMatch,
                    MatchKind::FirstMatch,
                    slots,
                );
            if !filled {
                // The bounds stand on their own even when the capture pass
                // cannot run (the backtracker clears the slots first).
                debug!("exec: no capture extraction for this match");
                slots[0] = Some(sp);
                slots[1] = Some(ep);
            }
        }
        Ok(true)
    }

    /// The DFA gave up; retry with the backtracker if its bitmap can cover
    /// the input at all.
    fn search_fallback(
        &self,
        context: &[u8],
        text: Range<usize>,
        anchor: Anchor,
        kind: MatchKind,
        slots: &mut [Slot],
    ) -> Result<bool, Error> {
        debug!("exec: dfa out of memory, falling back to bit-state");
        if !backtrack::should_exec(self.prog.len(), text.end - text.start) {
            return Err(Error::DfaOutOfMemory);
        }
        Ok(backtrack::search(&self.prog, context, text, anchor, kind, slots))
    }
}
