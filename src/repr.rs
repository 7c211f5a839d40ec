use std::fmt;

/// A parsed regular expression, in the shape the compiler consumes.
///
/// The surface parser is an external collaborator: `translate` builds this
/// tree from `regex-syntax`'s Hir, and callers embedding their own parser can
/// construct it directly. The tree is single-owner (plain `Box`/`Vec`
/// children, no sharing); its depth is bounded by the parser's nest limit,
/// so plain structural recursion over it is fine.
///
/// `Repeat` is the one variant the compiler refuses to see: call
/// [`Repr::simplify`] first, which rewrites counted repetition into
/// concatenations of `Star`/`Plus`/`Quest`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Repr {
    /// Matches the empty string.
    Empty,
    /// Matches one Unicode scalar value.
    Literal(char),
    /// Matches a sequence of scalar values. Equivalent to a concatenation of
    /// `Literal`s, but common enough to keep flat.
    LiteralString(Vec<char>),
    /// Matches any scalar value in one of the closed ranges.
    ///
    /// Ranges are non-empty, non-overlapping and sorted; the translator
    /// guarantees this and the compiler relies on it for the ASCII
    /// case-folding analysis.
    CharClass(Vec<(char, char)>),
    /// Matches any scalar value, newline included.
    AnyChar,
    /// Matches any single byte, even one that is not valid UTF-8.
    AnyByte,
    /// Matches the concatenation of its children, in order.
    Concat(Vec<Repr>),
    /// Matches any one child, preferring earlier children.
    Alternate(Vec<Repr>),
    /// Matches zero or more repetitions of the child.
    Star {
        /// The repeated expression.
        sub: Box<Repr>,
        /// Whether to prefer repeating (true) or moving on (false).
        greedy: bool,
    },
    /// Matches one or more repetitions of the child.
    Plus {
        /// The repeated expression.
        sub: Box<Repr>,
        /// Whether to prefer repeating (true) or moving on (false).
        greedy: bool,
    },
    /// Matches zero or one occurrence of the child.
    Quest {
        /// The optional expression.
        sub: Box<Repr>,
        /// Whether to prefer taking the expression (true) or skipping it.
        greedy: bool,
    },
    /// Counted repetition `sub{min,max}`. Removed by [`Repr::simplify`].
    Repeat {
        /// The repeated expression.
        sub: Box<Repr>,
        /// Minimum number of repetitions.
        min: u32,
        /// Maximum number of repetitions; `None` means unbounded.
        max: Option<u32>,
        /// Whether to prefer more repetitions.
        greedy: bool,
    },
    /// A capturing group. Group 0 is the whole match and is implicit;
    /// explicit groups start at index 1.
    Capture {
        /// The group number as assigned by the parser.
        index: u32,
        /// The grouped expression.
        sub: Box<Repr>,
    },
    /// `^` in multi-line mode: beginning of text or just after a newline.
    BeginLine,
    /// `$` in multi-line mode: end of text or just before a newline.
    EndLine,
    /// `\A`: beginning of text.
    BeginText,
    /// `\z`: end of text.
    EndText,
    /// `\b`: an ASCII word boundary.
    WordBoundary,
    /// `\B`: not an ASCII word boundary.
    NoWordBoundary,
    /// Matches nothing, not even the empty string.
    NoMatch,
}

impl Repr {
    /// Rewrites counted repetition into `Star`/`Plus`/`Quest` so the
    /// compiler never has to deal with `Repeat` nodes.
    ///
    /// `a{2,5}` becomes `aa(a(a(a)?)?)?` rather than `aaa?a?a?`: the nested
    /// form keeps the alternation structure shallow on the left, which the
    /// compiler turns into fewer live split chains.
    pub fn simplify(self) -> Repr {
        use self::Repr::*;
        match self {
            Concat(subs) => {
                Concat(subs.into_iter().map(Repr::simplify).collect())
            }
            Alternate(subs) => {
                Alternate(subs.into_iter().map(Repr::simplify).collect())
            }
            Star { sub, greedy } => {
                Star { sub: Box::new(sub.simplify()), greedy }
            }
            Plus { sub, greedy } => {
                Plus { sub: Box::new(sub.simplify()), greedy }
            }
            Quest { sub, greedy } => {
                Quest { sub: Box::new(sub.simplify()), greedy }
            }
            Capture { index, sub } => {
                Capture { index, sub: Box::new(sub.simplify()) }
            }
            Repeat { sub, min, max, greedy } => {
                simplify_repeat(sub.simplify(), min, max, greedy)
            }
            other => other,
        }
    }

    /// If this expression must match starting at the beginning of text,
    /// removes the leading `\A` and returns true. Handles anchors reachable
    /// through leading concatenation and capture groups, like `(\A(a|b))`;
    /// deliberately approximate for shapes like `\Aa|\Ab`.
    pub fn strip_anchor_start(&mut self) -> bool {
        match *self {
            Repr::BeginText => {
                *self = Repr::Empty;
                true
            }
            Repr::Concat(ref mut subs) => match subs.first_mut() {
                Some(first) => first.strip_anchor_start(),
                None => false,
            },
            Repr::Capture { ref mut sub, .. } => sub.strip_anchor_start(),
            _ => false,
        }
    }

    /// The `\z` analogue of [`Repr::strip_anchor_start`].
    pub fn strip_anchor_end(&mut self) -> bool {
        match *self {
            Repr::EndText => {
                *self = Repr::Empty;
                true
            }
            Repr::Concat(ref mut subs) => match subs.last_mut() {
                Some(last) => last.strip_anchor_end(),
                None => false,
            },
            Repr::Capture { ref mut sub, .. } => sub.strip_anchor_end(),
            _ => false,
        }
    }

    /// The number of capture slots a program for this expression needs:
    /// two per group, including the implicit group 0.
    pub fn capture_slots(&self) -> usize {
        2 * (self.max_capture_index() as usize + 1)
    }

    fn max_capture_index(&self) -> u32 {
        use self::Repr::*;
        match *self {
            Concat(ref subs) | Alternate(ref subs) => {
                subs.iter().map(Repr::max_capture_index).max().unwrap_or(0)
            }
            Star { ref sub, .. }
            | Plus { ref sub, .. }
            | Quest { ref sub, .. }
            | Repeat { ref sub, .. } => sub.max_capture_index(),
            Capture { index, ref sub } => index.max(sub.max_capture_index()),
            _ => 0,
        }
    }
}

fn simplify_repeat(sub: Repr, min: u32, max: Option<u32>, greedy: bool) -> Repr {
    use self::Repr::*;
    match (min, max) {
        (0, None) => Star { sub: Box::new(sub), greedy },
        (1, None) => Plus { sub: Box::new(sub), greedy },
        (0, Some(1)) => Quest { sub: Box::new(sub), greedy },
        (0, Some(0)) => Empty,
        (min, None) => {
            // a{3,} => aaa+
            let mut subs = Vec::with_capacity(min as usize);
            for _ in 0..min - 1 {
                subs.push(sub.clone());
            }
            subs.push(Plus { sub: Box::new(sub), greedy });
            Concat(subs)
        }
        (min, Some(max)) if min == max => {
            // a{3} => aaa
            if min == 1 {
                return sub;
            }
            let subs = vec![sub; min as usize];
            Concat(subs)
        }
        (min, Some(max)) => {
            // a{2,5} => aa(a(a(a)?)?)?
            //
            // The nesting matters: the flat expansion aaa?a?a? produces a
            // chain of splits that every engine has to walk on every step.
            let mut opt = Quest { sub: Box::new(sub.clone()), greedy };
            for _ in 0..max - min - 1 {
                opt = Quest {
                    sub: Box::new(Concat(vec![sub.clone(), opt])),
                    greedy,
                };
            }
            if min == 0 {
                return opt;
            }
            let mut subs = vec![sub; min as usize];
            subs.push(opt);
            Concat(subs)
        }
    }
}

impl fmt::Display for Repr {
    /// A compact structural rendering for diagnostics; not a parsable
    /// pattern.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Repr::*;
        match *self {
            Empty => write!(f, "ε"),
            Literal(c) => write!(f, "{:?}", c),
            LiteralString(ref cs) => {
                write!(f, "\"")?;
                for c in cs {
                    write!(f, "{}", c.escape_debug())?;
                }
                write!(f, "\"")
            }
            CharClass(ref ranges) => {
                write!(f, "[")?;
                for &(lo, hi) in ranges {
                    if lo == hi {
                        write!(f, "{}", lo.escape_debug())?;
                    } else {
                        write!(
                            f,
                            "{}-{}",
                            lo.escape_debug(),
                            hi.escape_debug()
                        )?;
                    }
                }
                write!(f, "]")
            }
            AnyChar => write!(f, "."),
            AnyByte => write!(f, "\\C"),
            Concat(ref subs) => {
                for sub in subs {
                    write!(f, "{}", sub)?;
                }
                Ok(())
            }
            Alternate(ref subs) => {
                for (i, sub) in subs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{}", sub)?;
                }
                Ok(())
            }
            Star { ref sub, greedy } => {
                write!(f, "({})*{}", sub, if greedy { "" } else { "?" })
            }
            Plus { ref sub, greedy } => {
                write!(f, "({})+{}", sub, if greedy { "" } else { "?" })
            }
            Quest { ref sub, greedy } => {
                write!(f, "({})?{}", sub, if greedy { "" } else { "?" })
            }
            Repeat { ref sub, min, max, greedy } => {
                write!(f, "({}){{{},", sub, min)?;
                if let Some(max) = max {
                    write!(f, "{}", max)?;
                }
                write!(f, "}}{}", if greedy { "" } else { "?" })
            }
            Capture { index, ref sub } => write!(f, "({}:{})", index, sub),
            BeginLine => write!(f, "(?m:^)"),
            EndLine => write!(f, "(?m:$)"),
            BeginText => write!(f, "\\A"),
            EndText => write!(f, "\\z"),
            WordBoundary => write!(f, "\\b"),
            NoWordBoundary => write!(f, "\\B"),
            NoMatch => write!(f, "∅"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Repr;

    fn lit(c: char) -> Repr {
        Repr::Literal(c)
    }

    fn repeat(min: u32, max: Option<u32>) -> Repr {
        Repr::Repeat { sub: Box::new(lit('a')), min, max, greedy: true }
    }

    #[test]
    fn simplify_exact() {
        assert_eq!(repeat(1, Some(1)).simplify(), lit('a'));
        assert_eq!(
            repeat(3, Some(3)).simplify(),
            Repr::Concat(vec![lit('a'), lit('a'), lit('a')])
        );
    }

    #[test]
    fn simplify_open_ended() {
        assert_eq!(
            repeat(0, None).simplify(),
            Repr::Star { sub: Box::new(lit('a')), greedy: true }
        );
        assert_eq!(
            repeat(2, None).simplify(),
            Repr::Concat(vec![
                lit('a'),
                Repr::Plus { sub: Box::new(lit('a')), greedy: true },
            ])
        );
    }

    #[test]
    fn simplify_range_nests() {
        // a{1,3} => a(a(a)?)?
        let inner = Repr::Quest { sub: Box::new(lit('a')), greedy: true };
        let outer = Repr::Quest {
            sub: Box::new(Repr::Concat(vec![lit('a'), inner])),
            greedy: true,
        };
        assert_eq!(
            repeat(1, Some(3)).simplify(),
            Repr::Concat(vec![lit('a'), outer])
        );
    }

    #[test]
    fn strip_anchors() {
        let mut re = Repr::Concat(vec![
            Repr::BeginText,
            lit('a'),
            Repr::EndText,
        ]);
        assert!(re.strip_anchor_start());
        assert!(re.strip_anchor_end());
        assert_eq!(
            re,
            Repr::Concat(vec![Repr::Empty, lit('a'), Repr::Empty])
        );

        let mut re = Repr::Alternate(vec![Repr::BeginText, lit('a')]);
        assert!(!re.strip_anchor_start());
    }

    #[test]
    fn capture_slots() {
        let re = Repr::Capture {
            index: 1,
            sub: Box::new(Repr::Capture { index: 2, sub: Box::new(lit('a')) }),
        };
        assert_eq!(re.capture_slots(), 6);
        assert_eq!(super::Repr::Empty.capture_slots(), 2);
    }
}
