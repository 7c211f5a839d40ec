// End-to-end behavior of the matching engines: the bit-state backtracker,
// the lazy DFA (forward and reverse), and the dispatch harness gluing them
// together.

use reprog::{
    bitstate_applicable, parse, Anchor, Compiler, Exec, ExecBuilder,
    MatchKind, Options, Program, StreamContext,
};

fn exec(pattern: &str) -> Exec {
    Exec::new(pattern).unwrap()
}

fn exec_with(pattern: &str, options: Options) -> Exec {
    ExecBuilder::new(pattern).options(options).build().unwrap()
}

fn compile_with(pattern: &str, options: &Options) -> Program {
    let re = parse(pattern, options).unwrap();
    Compiler::new()
        .options(options)
        .compile(std::slice::from_ref(&re))
        .unwrap()
}

#[test]
fn leftmost_first_bounds() {
    let re = exec("a|b");
    assert_eq!(re.find(b"b").unwrap(), Some((0, 1)));
    assert_eq!(re.find(b"xbz").unwrap(), Some((1, 2)));
    assert_eq!(re.find(b"zzz").unwrap(), None);
}

#[test]
fn ascii_case_folding() {
    let re = exec("[Aa]");
    assert_eq!(re.find(b"A").unwrap(), Some((0, 1)));
    assert_eq!(re.find(b"a").unwrap(), Some((0, 1)));
    // Folding applies to ASCII letters only; nearby bytes compare exactly.
    let re = exec_with("[Aa]", Options::latin1());
    assert!(!re.is_match(&[0xC1]).unwrap()); // 'A' | 0x80
}

#[test]
fn utf8_dot_spans_whole_runes() {
    let re = exec(".");
    let text = "本".as_bytes(); // E6 9C AC
    assert_eq!(text, &[0xE6, 0x9C, 0xAC]);
    assert_eq!(re.find(text).unwrap(), Some((0, 3)));
    // An invalid UTF-8 byte is not a rune, so the dot rejects it.
    assert!(!re.is_match(&[0xFF]).unwrap());
    // The any-byte form takes anything.
    let re = exec("(?s-u:.)");
    assert!(re.is_match(&[0xFF]).unwrap());
}

#[test]
fn text_anchors() {
    let re = exec("^abc$");
    assert_eq!(re.find(b"abc").unwrap(), Some((0, 3)));
    assert_eq!(re.find(b"aabc").unwrap(), None);
    assert_eq!(re.find(b"abcc").unwrap(), None);
}

#[test]
fn empty_text_boundaries() {
    // `^$` matches empty text; `\b` does not.
    assert!(exec("^$").is_match(b"").unwrap());
    assert!(!exec(r"\b").is_match(b"").unwrap());
}

#[test]
fn multi_line_dollar() {
    let re = exec_with("a$", Options { multi_line: true, ..Options::new() });
    assert_eq!(re.find(b"a\nb").unwrap(), Some((0, 1)));
    let re = exec_with("^b", Options { multi_line: true, ..Options::new() });
    assert_eq!(re.find(b"a\nb").unwrap(), Some((2, 3)));
}

#[test]
fn word_boundaries_with_context() {
    // Two successive unanchored longest matches.
    let re = exec(r"\b(foo|bar)\b");
    let text = b"foo bar";
    let mut slots = [None, None];
    assert!(re
        .search(text, 0..7, Anchor::Unanchored, MatchKind::LongestMatch, &mut slots)
        .unwrap());
    assert_eq!((slots[0], slots[1]), (Some(0), Some(3)));
    // Resume after the first match; the context still covers all of text,
    // so the boundary at position 4 sees the space before it.
    assert!(re
        .search(text, 3..7, Anchor::Unanchored, MatchKind::LongestMatch, &mut slots)
        .unwrap());
    assert_eq!((slots[0], slots[1]), (Some(4), Some(7)));
    // No third match.
    assert!(!re
        .search(text, 7..7, Anchor::Unanchored, MatchKind::LongestMatch, &mut slots)
        .unwrap());
}

#[test]
fn captures() {
    let re = exec("(a+)(b+)");
    let mut slots = [None; 6];
    let text = b"xxaaabbx";
    assert!(re
        .search(
            text,
            0..text.len(),
            Anchor::Unanchored,
            MatchKind::FirstMatch,
            &mut slots
        )
        .unwrap());
    assert_eq!(&slots[..2], &[Some(2), Some(7)]);
    assert_eq!(&slots[2..4], &[Some(2), Some(5)]);
    assert_eq!(&slots[4..6], &[Some(5), Some(7)]);
}

#[test]
fn full_match_anchor() {
    let re = exec("a+");
    assert!(re
        .search(b"aaa", 0..3, Anchor::FullMatch, MatchKind::FullMatch, &mut [])
        .unwrap());
    assert!(!re
        .search(b"aab", 0..3, Anchor::FullMatch, MatchKind::FullMatch, &mut [])
        .unwrap());
}

#[test]
fn dfa_and_bitstate_agree() {
    // For any (pattern, text) where both engines are applicable, they must
    // report the same match bounds.
    let cases: &[(&str, &[u8])] = &[
        ("a|b", b"xbz"),
        ("ab*c", b"zzabbbbcq"),
        ("a?b?c?", b"abc"),
        (r"\bword\b", b"a word here"),
        ("(foo|foobar)", b"xfoobary"),
        ("x(y|z)*w", b"aaxyzyzwbb"),
        ("$", b"abc"),
    ];
    for &(pattern, text) in cases {
        let prog = compile_with(pattern, &Options::new());
        assert!(bitstate_applicable(prog.len(), text.len()));

        let fwd = prog.search_dfa(
            text,
            0..text.len(),
            Anchor::Unanchored,
            MatchKind::FirstMatch,
            false,
            true,
            None,
        );
        assert!(!fwd.failed);

        let mut slots = [None, None];
        let bs = prog.search_bitstate(
            text,
            0..text.len(),
            Anchor::Unanchored,
            MatchKind::FirstMatch,
            &mut slots,
        );

        assert_eq!(fwd.matched, bs, "engines disagree on {:?}", pattern);
        if bs {
            assert_eq!(
                Some(fwd.ep),
                slots[1],
                "match ends disagree on {:?}",
                pattern
            );
        }
    }
}

#[test]
fn reverse_dfa_finds_match_start() {
    let options = Options::new();
    let prog = compile_with("abc", &options);
    let re = parse("abc", &options).unwrap();
    let prog_rev = Compiler::new()
        .options(&options)
        .reverse(true)
        .compile(std::slice::from_ref(&re))
        .unwrap();

    let text = b"xxabcyy";
    let fwd = prog.search_dfa(
        text,
        0..text.len(),
        Anchor::Unanchored,
        MatchKind::FirstMatch,
        false,
        true,
        None,
    );
    assert!(fwd.matched && !fwd.failed);
    assert_eq!(fwd.ep, 5);

    // Running the reverse program over the prefix that ends at the match
    // end yields the match start: forward and reverse compilation agree
    // with start and end swapped.
    let rev = prog_rev.search_dfa(
        text,
        0..fwd.ep,
        Anchor::Anchored,
        MatchKind::LongestMatch,
        false,
        false,
        None,
    );
    assert!(rev.matched && !rev.failed);
    assert_eq!(rev.ep, 2);
}

#[test]
fn dfa_earliest_match_stops_short() {
    let prog = compile_with("a+", &Options::new());
    let text = b"aaaa";
    let earliest = prog.search_dfa(
        text,
        0..4,
        Anchor::Anchored,
        MatchKind::FirstMatch,
        true,
        true,
        None,
    );
    assert!(earliest.matched);
    assert_eq!(earliest.ep, 1);

    let longest = prog.search_dfa(
        text,
        0..4,
        Anchor::Anchored,
        MatchKind::LongestMatch,
        false,
        true,
        None,
    );
    assert!(longest.matched);
    assert_eq!(longest.ep, 4);
}

/// A binary string over {0,1} containing every n-bit sequence as a
/// substring, which forces a distinct DFA state per n-bit history: the
/// standard worst case for lazy DFA memory. Built with the greedy
/// prefer-one rule, so it trails off in zeros.
fn de_bruijn(n: usize) -> Vec<u8> {
    use std::collections::HashSet;

    let mut did: HashSet<Vec<u8>> = HashSet::new();
    let mut s: Vec<u8> = vec![b'0'; n - 1];
    loop {
        let window = s[s.len() - (n - 1)..].to_vec();
        let mut one = window.clone();
        one.push(b'1');
        if did.insert(one) {
            s.push(b'1');
            continue;
        }
        let mut zero = window;
        zero.push(b'0');
        if did.insert(zero) {
            s.push(b'0');
            continue;
        }
        break;
    }
    s
}

#[test]
fn dfa_fails_under_tiny_budget_and_matches_under_default() {
    let n = 18;
    let mut text = de_bruijn(n);
    text.push(b'0');
    let pattern = format!("0[01]{{{}}}$", n);

    // Under the default budget the match is found at the very end.
    let prog = compile_with(&pattern, &Options::new());
    let fwd = prog.search_dfa(
        &text,
        0..text.len(),
        Anchor::Unanchored,
        MatchKind::LongestMatch,
        false,
        true,
        None,
    );
    assert!(!fwd.failed);
    assert!(fwd.matched);
    assert_eq!(fwd.ep, text.len());

    // Under a budget far below the state demand, the DFA must give up
    // rather than exceed its memory bounds; the harness then reports the
    // failure since no other engine covers an input this large.
    let starved =
        Options { dfa_size_limit: 64, ..Options::new() };
    let prog = compile_with(&pattern, &starved);
    let fwd = prog.search_dfa(
        &text,
        0..text.len(),
        Anchor::Unanchored,
        MatchKind::LongestMatch,
        false,
        true,
        None,
    );
    assert!(fwd.failed);

    let re = exec_with(&pattern, starved);
    assert!(re.find(&text).is_err());
}

#[test]
fn dfa_memory_stays_bounded() {
    // (a|b)*a(a|b){8} needs ~2^8 states; building the entire DFA must
    // succeed within the default budget and report them all.
    let prog = compile_with("(?:a|b)*a(?:a|b){8}", &Options::new());
    let nstates = prog.build_entire_dfa(MatchKind::LongestMatch);
    assert!(nstates >= 1 << 8, "only {} states", nstates);

    // The same construction under a starved budget stops at the wall.
    let starved = Options { dfa_size_limit: 64, ..Options::new() };
    let prog = compile_with("(?:a|b)*a(?:a|b){8}", &starved);
    assert_eq!(prog.build_entire_dfa(MatchKind::LongestMatch), 0);
}

#[test]
fn first_byte_acceleration_agrees_with_plain_scan() {
    // Exercise the memchr-accelerated loop variants against a text where
    // the candidate byte is rare.
    let prog = compile_with("zebra", &Options::new());
    assert_eq!(prog.first_byte(), Some(b'z'));
    let mut text = vec![b'x'; 4096];
    text.extend_from_slice(b"zebra");
    text.extend_from_slice(&[b'y'; 64]);
    let fwd = prog.search_dfa(
        &text,
        0..text.len(),
        Anchor::Unanchored,
        MatchKind::FirstMatch,
        false,
        true,
        None,
    );
    assert!(fwd.matched);
    assert_eq!(fwd.ep, 4096 + 5);
}

#[test]
fn prefix_literal_acceleration() {
    // A pattern with several literal prefixes goes through the
    // Aho-Corasick accelerator before the DFA runs. The input is sized
    // past the bit-state bitmap budget so dispatch cannot take the small
    // path.
    let re = exec("(?:alpha|beta)[0-9]");
    let n = 700_000;
    let mut text = vec![b'.'; n];
    text.extend_from_slice(b"beta7");
    assert_eq!(re.find(&text).unwrap(), Some((n, n + 5)));
    assert_eq!(re.find(&vec![b'.'; n]).unwrap(), None);
}

#[test]
fn anchored_required_prefix_split() {
    // An `\A`-anchored pattern with a literal head is split by the
    // executor: the head is byte-compared and only the rest of the
    // pattern is dispatched to an engine.
    let re = exec(r"\Afoo(bar|baz)");
    assert_eq!(re.find(b"foobaz!").unwrap(), Some((0, 6)));
    assert!(!re.is_match(b"xfoobar").unwrap());
    assert!(!re.is_match(b"fo").unwrap());

    // Captures survive the split; the whole-match start is the prefix
    // start, not where the remainder began.
    let mut slots = [None; 4];
    assert!(re
        .search(
            b"foobar",
            0..6,
            Anchor::Unanchored,
            MatchKind::FirstMatch,
            &mut slots
        )
        .unwrap());
    assert_eq!(slots, [Some(0), Some(6), Some(3), Some(6)]);

    // The prefix pins the match to the start of the context, so a search
    // window beginning later can never match.
    assert!(!re
        .search(
            b"zfoobar",
            1..7,
            Anchor::Unanchored,
            MatchKind::FirstMatch,
            &mut []
        )
        .unwrap());
}

#[test]
fn stream_full_match_extends_to_chunk_end() {
    // Once a `(?s:.)*` tail is reached, every further byte is part of the
    // match: the end reported right after a chunk must track the bytes
    // already fed, not the position where the full-match state was
    // entered.
    let prog = compile_with("abc(?s:.)*", &Options::new());
    let mut stream = StreamContext::new();
    stream.search_chunk(&prog, b"xabcyy");
    assert_eq!(stream.last_match_end(), Some(6));
    stream.search_chunk(&prog, b"zz");
    assert_eq!(stream.last_match_end(), Some(8));
    assert_eq!(stream.finish(&prog), Some(8));
}

#[test]
fn stream_search_across_chunks() {
    let prog = compile_with("abc", &Options::new());
    let mut stream = StreamContext::new();
    stream.search_chunk(&prog, b"xxa");
    stream.search_chunk(&prog, b"bc");
    assert_eq!(stream.finish(&prog), Some(5));
    assert!(!stream.failed());

    // A stream with no match reports none, and a chunk that cannot start
    // a match is fully discardable.
    let mut stream = StreamContext::new();
    let safe = stream.search_chunk(&prog, b"xyz");
    assert_eq!(safe, 3);
    assert_eq!(stream.backlog_byte_count(), 0);
    assert_eq!(stream.finish(&prog), None);

    // A trailing partial match is backlog the caller must keep.
    let mut stream = StreamContext::new();
    stream.search_chunk(&prog, b"xxab");
    assert!(stream.backlog_byte_count() > 0);
}

#[test]
fn concurrent_searches_share_one_dfa() {
    use std::sync::Arc;

    let prog = Arc::new(compile_with(r"(?:ab|cd)+x?e{2}", &Options::new()));
    let mut text = Vec::new();
    for _ in 0..2_000 {
        text.extend_from_slice(b"abcdabcd");
    }
    text.extend_from_slice(b"abcdxee");
    let text = Arc::new(text);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let prog = Arc::clone(&prog);
        let text = Arc::clone(&text);
        handles.push(std::thread::spawn(move || {
            let r = prog.search_dfa(
                &text,
                0..text.len(),
                Anchor::Unanchored,
                MatchKind::LongestMatch,
                false,
                true,
                None,
            );
            assert!(!r.failed);
            assert!(r.matched);
            assert_eq!(r.ep, text.len());
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
