use crate::compile::Compiler;
use crate::dfa::DfaResult;
use crate::error::Error;
use crate::options::Options;
use crate::prog::{Anchor, MatchKind, Program};
use crate::repr::Repr;
use crate::translate::parse;

/// Matches multiple patterns in a single scan, reporting which ones fired.
///
/// Every added pattern is compiled into one combined program whose match
/// instructions carry the pattern's index; the DFA runs in many-match mode
/// and unions the indices of every pattern that matches. The set's anchor
/// mode decides whether matches may start anywhere or only at the beginning
/// of the text (and, for [`Anchor::FullMatch`], must consume all of it).
///
/// ```
/// use reprog::{Anchor, Options, Set};
///
/// let mut set = Set::new(Options::default(), Anchor::Unanchored);
/// set.add("foo").unwrap();
/// set.add("bar").unwrap();
/// set.compile().unwrap();
///
/// let mut ids = Vec::new();
/// assert!(set.matches(b"xbary", &mut ids));
/// assert_eq!(ids, vec![1]);
/// ```
pub struct Set {
    options: Options,
    anchor: Anchor,
    exprs: Vec<Repr>,
    prog: Option<Program>,
}

impl Set {
    /// Creates an empty set. Patterns are parsed as they are added;
    /// nothing is compiled until [`Set::compile`].
    pub fn new(options: Options, anchor: Anchor) -> Set {
        Set { options, anchor, exprs: Vec::new(), prog: None }
    }

    /// Parses and adds one pattern, returning its index in the set.
    pub fn add(&mut self, pattern: &str) -> Result<usize, Error> {
        if self.prog.is_some() {
            return Err(Error::InvalidTree("Set::add after compile"));
        }
        let mut re = parse(pattern, &self.options)?;
        if self.anchor == Anchor::FullMatch {
            // Full-match sets pin every pattern to the end of text with an
            // explicit assertion, since the program-level end anchor cannot
            // speak for patterns individually.
            re = Repr::Concat(vec![re, Repr::EndText]);
        }
        self.exprs.push(re);
        Ok(self.exprs.len() - 1)
    }

    /// Compiles every added pattern into the combined program.
    pub fn compile(&mut self) -> Result<(), Error> {
        if self.prog.is_some() {
            return Err(Error::InvalidTree("Set::compile called twice"));
        }
        if self.exprs.is_empty() {
            return Err(Error::Syntax(
                "cannot compile an empty pattern set".to_string(),
            ));
        }
        let prog = if self.exprs.len() == 1 {
            // A one-pattern set still goes through the set path so match
            // identifiers stay meaningful.
            let doubled = vec![self.exprs[0].clone(), Repr::NoMatch];
            let mut prog = Compiler::new()
                .options(&self.options)
                .set_anchor(self.anchor)
                .compile(&doubled)?;
            prog.npatterns = 1;
            prog
        } else {
            Compiler::new()
                .options(&self.options)
                .set_anchor(self.anchor)
                .compile(&self.exprs)?
        };
        self.prog = Some(prog);
        Ok(())
    }

    /// The number of patterns in the set.
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    /// Whether the set has no patterns.
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Does any pattern in the set match `text`?
    pub fn is_match(&self, text: &[u8]) -> bool {
        let mut ids = Vec::new();
        self.matches(text, &mut ids)
    }

    /// Reports every pattern that matches `text`. Pattern indices are
    /// appended to `ids` in the order the DFA discovers them.
    ///
    /// # Panics
    ///
    /// Panics if the set has not been compiled.
    pub fn matches(&self, text: &[u8], ids: &mut Vec<usize>) -> bool {
        let prog = self
            .prog
            .as_ref()
            .expect("Set::matches called before Set::compile");
        ids.clear();
        let anchored = self.anchor != Anchor::Unanchored;
        let dfa = prog.get_dfa(MatchKind::ManyMatch);
        let result: DfaResult = dfa.search(
            prog,
            text,
            0..text.len(),
            anchored,
            false,
            true,
            Some(ids),
        );
        if result.failed {
            log::debug!("set: dfa gave up; rescanning per pattern");
            return self.matches_fallback(text, ids);
        }
        result.matched && !ids.is_empty()
    }

    /// Memory-starved fallback: checks each pattern separately with the
    /// bit-state engine. Slower, but bounded.
    fn matches_fallback(&self, text: &[u8], ids: &mut Vec<usize>) -> bool {
        let anchor = match self.anchor {
            Anchor::Unanchored => Anchor::Unanchored,
            // End anchoring was baked into the patterns when added.
            Anchor::Anchored | Anchor::FullMatch => Anchor::Anchored,
        };
        ids.clear();
        for (i, expr) in self.exprs.iter().enumerate() {
            let prog = match Compiler::new().options(&self.options).compile(
                std::slice::from_ref(expr),
            ) {
                Ok(prog) => prog,
                Err(_) => continue,
            };
            if !crate::backtrack::should_exec(prog.len(), text.len()) {
                continue;
            }
            let mut slots: [crate::exec::Slot; 0] = [];
            if crate::backtrack::search(
                &prog,
                text,
                0..text.len(),
                anchor,
                MatchKind::LongestMatch,
                &mut slots,
            ) {
                ids.push(i);
            }
        }
        !ids.is_empty()
    }
}
