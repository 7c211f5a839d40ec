use aho_corasick::{AhoCorasick, MatchKind};
use memchr::memmem;

use crate::repr::Repr;

/// A matcher for the literal prefixes a pattern's matches must start with.
///
/// An unanchored scan only has to attempt matches at positions where one of
/// these literals occurs, so the engines use this to skip ahead with
/// substring search instead of stepping states byte by byte. One literal is
/// handled by `memmem`; several by a leftmost-first Aho-Corasick automaton.
#[derive(Debug)]
pub struct LiteralSearcher {
    matcher: Matcher,
}

#[derive(Debug)]
enum Matcher {
    /// No useful prefixes; the searcher matches everywhere.
    Empty,
    /// All matches start with this one literal.
    Single(memmem::Finder<'static>),
    /// All matches start with one of these literals.
    Many(AhoCorasick),
}

impl LiteralSearcher {
    /// A searcher that constrains nothing.
    pub fn empty() -> LiteralSearcher {
        LiteralSearcher { matcher: Matcher::Empty }
    }

    /// A searcher for one mandatory literal, as reported by
    /// [`required_prefix_for_accel`].
    pub fn single(lit: Vec<u8>) -> LiteralSearcher {
        if lit.is_empty() {
            return LiteralSearcher::empty();
        }
        LiteralSearcher {
            matcher: Matcher::Single(memmem::Finder::new(&lit).into_owned()),
        }
    }

    /// Builds a searcher for the prefix literals of `re`, if it has any.
    pub fn prefixes(re: &Repr) -> LiteralSearcher {
        let mut lits = Vec::new();
        if !prefix_literals(re, &mut lits) || lits.is_empty() {
            return LiteralSearcher::empty();
        }
        if lits.iter().any(|lit| lit.is_empty()) {
            // An empty prefix matches everywhere; nothing to accelerate.
            return LiteralSearcher::empty();
        }
        let matcher = if lits.len() == 1 {
            Matcher::Single(memmem::Finder::new(&lits[0]).into_owned())
        } else {
            match AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostFirst)
                .build(&lits)
            {
                Ok(ac) => Matcher::Many(ac),
                Err(_) => return LiteralSearcher::empty(),
            }
        };
        LiteralSearcher { matcher }
    }

    /// Does this searcher constrain match starts at all?
    pub fn is_empty(&self) -> bool {
        matches!(self.matcher, Matcher::Empty)
    }

    /// Finds the first position at or after `at` in `haystack` where a
    /// match could start. Returns `haystack.len()`-relative offsets.
    pub fn find(&self, haystack: &[u8], at: usize) -> Option<usize> {
        match self.matcher {
            Matcher::Empty => Some(at),
            Matcher::Single(ref finder) => {
                finder.find(&haystack[at..]).map(|i| at + i)
            }
            Matcher::Many(ref ac) => {
                ac.find(&haystack[at..]).map(|m| at + m.start())
            }
        }
    }
}

/// The prefix every match must start with when the whole pattern is
/// anchored at the beginning of text, together with the rest of the
/// pattern. Returns None for unanchored patterns.
///
/// This is the submatch-preserving flavor: the returned expression matches
/// exactly what follows the prefix, so the executor can compare the prefix
/// bytes directly and dispatch an engine only for the remainder. The
/// acceleration flavor below gives up the continuation in exchange for
/// working on more shapes.
pub fn required_prefix(re: &Repr) -> Option<(Vec<u8>, Repr)> {
    let subs = match *re {
        Repr::Concat(ref subs) => subs.as_slice(),
        _ => return None,
    };
    let mut it = subs.iter();
    match it.next() {
        Some(&Repr::BeginText) => {}
        _ => return None,
    }
    let mut prefix = Vec::new();
    let mut rest: Vec<Repr> = Vec::new();
    for sub in it {
        if !rest.is_empty() {
            rest.push(sub.clone());
            continue;
        }
        match *sub {
            Repr::Literal(c) => {
                let mut buf = [0u8; 4];
                prefix.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            Repr::LiteralString(ref chars) => {
                let mut buf = [0u8; 4];
                for &c in chars {
                    prefix.extend_from_slice(
                        c.encode_utf8(&mut buf).as_bytes(),
                    );
                }
            }
            ref sub => rest.push(sub.clone()),
        }
    }
    if prefix.is_empty() {
        return None;
    }
    let rest = match rest.len() {
        0 => Repr::Empty,
        1 => rest.pop().expect("len is 1"),
        _ => Repr::Concat(rest),
    };
    Some((prefix, rest))
}

/// The literal prefix usable for scan acceleration, anchored or not.
/// Unlike [`required_prefix`], nothing is said about what follows it; the
/// executor feeds the result to [`LiteralSearcher::single`].
pub fn required_prefix_for_accel(re: &Repr) -> Option<Vec<u8>> {
    let mut lits = Vec::new();
    if !prefix_literals(re, &mut lits) || lits.len() != 1 {
        return None;
    }
    let lit = lits.pop().expect("len is 1");
    if lit.is_empty() {
        None
    } else {
        Some(lit)
    }
}

/// Collects the literal heads of `re` into `lits`, one entry per
/// alternation branch. Returns false when some branch has no literal head,
/// in which case `lits` is not meaningful.
fn prefix_literals(re: &Repr, lits: &mut Vec<Vec<u8>>) -> bool {
    match *re {
        Repr::Literal(c) => {
            let mut buf = [0u8; 4];
            lits.push(c.encode_utf8(&mut buf).as_bytes().to_vec());
            true
        }
        Repr::LiteralString(ref chars) => {
            let mut bytes = Vec::with_capacity(chars.len());
            let mut buf = [0u8; 4];
            for &c in chars {
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            lits.push(bytes);
            true
        }
        Repr::Concat(ref subs) => {
            for sub in subs {
                match *sub {
                    // Anchors ahead of the literal do not affect where it
                    // can occur.
                    Repr::BeginText | Repr::BeginLine => continue,
                    _ => return prefix_literals(sub, lits),
                }
            }
            false
        }
        Repr::Alternate(ref subs) => {
            subs.iter().all(|sub| prefix_literals(sub, lits))
        }
        Repr::Capture { ref sub, .. } => prefix_literals(sub, lits),
        Repr::Plus { ref sub, greedy: _ } => {
            // One occurrence is mandatory.
            prefix_literals(sub, lits)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        required_prefix, required_prefix_for_accel, LiteralSearcher,
    };
    use crate::options::Options;
    use crate::translate::parse;

    fn p(pattern: &str) -> crate::repr::Repr {
        parse(pattern, &Options::new()).unwrap()
    }

    #[test]
    fn required_prefix_needs_anchor() {
        assert!(required_prefix(&p("abc")).is_none());
        let (prefix, rest) = required_prefix(&p(r"\Aabc[0-9]")).unwrap();
        assert_eq!(prefix, b"abc".to_vec());
        assert_ne!(rest, crate::repr::Repr::Empty);
        let (prefix, rest) = required_prefix(&p(r"\Afoo")).unwrap();
        assert_eq!(prefix, b"foo".to_vec());
        assert_eq!(rest, crate::repr::Repr::Empty);
    }

    #[test]
    fn accel_prefix_ignores_anchor() {
        assert_eq!(
            required_prefix_for_accel(&p("abc[0-9]")),
            Some(b"abc".to_vec())
        );
        assert_eq!(
            required_prefix_for_accel(&p(r"\Aabc")),
            Some(b"abc".to_vec())
        );
        assert_eq!(required_prefix_for_accel(&p("[0-9]abc")), None);
        // Two flavors disagree by design: accel has no anchor requirement,
        // the submatch flavor has no alternation support.
        assert_eq!(required_prefix_for_accel(&p("foo|bar")), None);
    }

    #[test]
    fn searcher_single_and_many() {
        let s = LiteralSearcher::prefixes(&p("foo"));
        assert!(!s.is_empty());
        assert_eq!(s.find(b"xxfooyy", 0), Some(2));
        assert_eq!(s.find(b"xxfooyy", 3), None);

        let s = LiteralSearcher::prefixes(&p("foo|bar"));
        assert!(!s.is_empty());
        assert_eq!(s.find(b"xbary", 0), Some(1));
        assert_eq!(s.find(b"nothing", 0), None);

        let s = LiteralSearcher::prefixes(&p("[0-9]+"));
        assert!(s.is_empty());
        assert_eq!(s.find(b"whatever", 3), Some(3));
    }
}
