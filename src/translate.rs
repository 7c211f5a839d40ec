use regex_syntax::hir::{self, Hir, HirKind};
use regex_syntax::ParserBuilder;

use crate::error::Error;
use crate::options::Options;
use crate::repr::Repr;

/// Parses a pattern into the compiler's expression tree.
///
/// The surface syntax is handled entirely by `regex-syntax`; this module
/// only translates its Hir into [`Repr`]. Constructs the engines do not
/// support (look-behind style assertions, CRLF anchors) are reported as
/// syntax errors here rather than surfacing later as compile failures.
pub fn parse(pattern: &str, options: &Options) -> Result<Repr, Error> {
    let mut parser = ParserBuilder::new();
    parser
        .utf8(false)
        .unicode(!options.latin1)
        .multi_line(options.multi_line)
        .dot_matches_new_line(options.dot_matches_new_line)
        .case_insensitive(options.case_insensitive)
        .swap_greed(options.swap_greed)
        .nest_limit(options.nest_limit);
    let hir = parser
        .build()
        .parse(pattern)
        .map_err(|err| Error::Syntax(err.to_string()))?;
    from_hir(&hir, options)
}

fn from_hir(hir: &Hir, options: &Options) -> Result<Repr, Error> {
    match *hir.kind() {
        HirKind::Empty => Ok(Repr::Empty),
        HirKind::Literal(hir::Literal(ref bytes)) => {
            literal(bytes, options.latin1)
        }
        HirKind::Class(hir::Class::Unicode(ref cls)) => {
            let ranges: Vec<(char, char)> =
                cls.iter().map(|r| (r.start(), r.end())).collect();
            Ok(class(ranges))
        }
        HirKind::Class(hir::Class::Bytes(ref cls)) => {
            let ranges: Vec<(u8, u8)> =
                cls.iter().map(|r| (r.start(), r.end())).collect();
            byte_class(ranges, options.latin1)
        }
        HirKind::Look(look) => match look {
            hir::Look::Start => Ok(Repr::BeginText),
            hir::Look::End => Ok(Repr::EndText),
            hir::Look::StartLF => Ok(Repr::BeginLine),
            hir::Look::EndLF => Ok(Repr::EndLine),
            // \b is an ASCII predicate in this engine, whatever flavor the
            // parser hands us.
            hir::Look::WordAscii | hir::Look::WordUnicode => {
                Ok(Repr::WordBoundary)
            }
            hir::Look::WordAsciiNegate | hir::Look::WordUnicodeNegate => {
                Ok(Repr::NoWordBoundary)
            }
            _ => Err(Error::Syntax(format!(
                "unsupported zero-width assertion: {:?}",
                look
            ))),
        },
        HirKind::Repetition(ref rep) => {
            let sub = Box::new(from_hir(&rep.sub, options)?);
            Ok(match (rep.min, rep.max) {
                (0, None) => Repr::Star { sub, greedy: rep.greedy },
                (1, None) => Repr::Plus { sub, greedy: rep.greedy },
                (0, Some(1)) => Repr::Quest { sub, greedy: rep.greedy },
                (min, max) => {
                    Repr::Repeat { sub, min, max, greedy: rep.greedy }
                }
            })
        }
        HirKind::Capture(ref cap) => Ok(Repr::Capture {
            index: cap.index,
            sub: Box::new(from_hir(&cap.sub, options)?),
        }),
        HirKind::Concat(ref subs) => {
            let subs = subs
                .iter()
                .map(|sub| from_hir(sub, options))
                .collect::<Result<Vec<Repr>, Error>>()?;
            Ok(Repr::Concat(subs))
        }
        HirKind::Alternation(ref subs) => {
            let subs = subs
                .iter()
                .map(|sub| from_hir(sub, options))
                .collect::<Result<Vec<Repr>, Error>>()?;
            Ok(Repr::Alternate(subs))
        }
    }
}

fn literal(bytes: &[u8], latin1: bool) -> Result<Repr, Error> {
    let chars: Vec<char> = if latin1 {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        match std::str::from_utf8(bytes) {
            Ok(s) => s.chars().collect(),
            Err(_) => {
                return Err(Error::Syntax(
                    "literal with invalid UTF-8 in Unicode mode".to_string(),
                ))
            }
        }
    };
    Ok(match chars.len() {
        0 => Repr::Empty,
        1 => Repr::Literal(chars[0]),
        _ => Repr::LiteralString(chars),
    })
}

fn class(ranges: Vec<(char, char)>) -> Repr {
    if ranges.is_empty() {
        return Repr::NoMatch;
    }
    if ranges == [('\0', '\u{10FFFF}')] {
        return Repr::AnyChar;
    }
    Repr::CharClass(ranges)
}

fn byte_class(ranges: Vec<(u8, u8)>, latin1: bool) -> Result<Repr, Error> {
    if ranges.is_empty() {
        return Ok(Repr::NoMatch);
    }
    if ranges == [(0x00, 0xFF)] {
        return Ok(Repr::AnyByte);
    }
    // In Latin-1 mode bytes are runes and the class carries over directly.
    // In Unicode mode, a byte class above 0x7F has no rune spelling, so we
    // refuse it rather than silently re-encode it as UTF-8.
    if !latin1 && ranges.iter().any(|&(_, hi)| hi > 0x7F) {
        return Err(Error::Syntax(
            "non-ASCII byte class in Unicode mode".to_string(),
        ));
    }
    Ok(Repr::CharClass(
        ranges.into_iter().map(|(lo, hi)| (lo as char, hi as char)).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::parse;
    use crate::options::Options;
    use crate::repr::Repr;

    #[test]
    fn literals() {
        let opts = Options::new();
        assert_eq!(parse("a", &opts).unwrap(), Repr::Literal('a'));
        assert_eq!(
            parse("ab", &opts).unwrap(),
            Repr::LiteralString(vec!['a', 'b'])
        );
    }

    #[test]
    fn dot_is_a_class() {
        let opts = Options::new();
        match parse(".", &opts).unwrap() {
            Repr::CharClass(ranges) => {
                assert_eq!(
                    ranges,
                    vec![('\0', '\x09'), ('\x0B', '\u{10FFFF}')]
                );
            }
            re => panic!("expected class, got {:?}", re),
        }
        let opts =
            Options { dot_matches_new_line: true, ..Options::default() };
        assert_eq!(parse(".", &opts).unwrap(), Repr::AnyChar);
    }

    #[test]
    fn latin1_dot() {
        let opts = Options::latin1();
        match parse(".", &opts).unwrap() {
            Repr::CharClass(ranges) => {
                assert_eq!(ranges, vec![('\0', '\x09'), ('\x0B', '\u{FF}')]);
            }
            re => panic!("expected class, got {:?}", re),
        }
    }

    #[test]
    fn any_byte() {
        let opts = Options::latin1();
        let opts = Options { dot_matches_new_line: true, ..opts };
        assert_eq!(parse(".", &opts).unwrap(), Repr::AnyByte);
    }

    #[test]
    fn anchors_and_boundaries() {
        let opts = Options::new();
        assert_eq!(
            parse(r"\Aa\z", &opts).unwrap(),
            Repr::Concat(vec![
                Repr::BeginText,
                Repr::Literal('a'),
                Repr::EndText,
            ])
        );
        assert_eq!(parse(r"\b", &opts).unwrap(), Repr::WordBoundary);
        assert_eq!(parse(r"\B", &opts).unwrap(), Repr::NoWordBoundary);
        // Without the multi-line flag, ^ and $ are text anchors.
        assert_eq!(
            parse("^a$", &opts).unwrap(),
            Repr::Concat(vec![
                Repr::BeginText,
                Repr::Literal('a'),
                Repr::EndText,
            ])
        );
        let opts = Options { multi_line: true, ..Options::default() };
        assert_eq!(
            parse("^a$", &opts).unwrap(),
            Repr::Concat(vec![
                Repr::BeginLine,
                Repr::Literal('a'),
                Repr::EndLine,
            ])
        );
    }

    #[test]
    fn repetitions() {
        let opts = Options::new();
        assert_eq!(
            parse("a*?", &opts).unwrap(),
            Repr::Star { sub: Box::new(Repr::Literal('a')), greedy: false }
        );
        assert_eq!(
            parse("a{2,5}", &opts).unwrap(),
            Repr::Repeat {
                sub: Box::new(Repr::Literal('a')),
                min: 2,
                max: Some(5),
                greedy: true,
            }
        );
    }

    #[test]
    fn case_insensitive_becomes_classes() {
        let opts =
            Options { case_insensitive: true, ..Options::default() };
        match parse("a", &opts).unwrap() {
            Repr::CharClass(ranges) => {
                assert!(ranges.contains(&('A', 'A')));
                assert!(ranges.contains(&('a', 'a')));
            }
            re => panic!("expected class, got {:?}", re),
        }
    }
}
