// Simple input/output tests checking that patterns compile to the expected
// instruction listings. These are just to sanity check the compiler and the
// flattening passes; the real confidence tests exercise the engines that
// run the compiled programs (see tests/engines.rs).

use reprog::{parse, Compiler, Options, Program, Repr};

fn compile_with(pattern: &str, options: &Options) -> Program {
    let re = parse(pattern, options).unwrap();
    Compiler::new()
        .options(options)
        .compile(std::slice::from_ref(&re))
        .unwrap()
}

fn compile_latin1(pattern: &str) -> Program {
    compile_with(pattern, &Options::latin1())
}

fn compile_utf8(pattern: &str) -> Program {
    compile_with(pattern, &Options::new())
}

fn compile_utf8_reverse(pattern: &str) -> Program {
    let options = Options::new();
    let re = parse(pattern, &options).unwrap();
    Compiler::new()
        .options(&options)
        .reverse(true)
        .compile(std::slice::from_ref(&re))
        .unwrap()
}

#[test]
fn simple_latin1_listings() {
    // The listings start at instruction 3: 0 is the fail instruction and
    // 1-2 hold the unanchored `(?s:.)*?` entry loop.
    let tests: &[(&str, &str)] = &[
        ("a", "3. byte [61-61] -> 4\n4. match! 0\n"),
        (
            "ab",
            "3. byte [61-61] -> 4\n\
             4. byte [62-62] -> 5\n\
             5. match! 0\n",
        ),
        (
            "a|c",
            "3+ byte [61-61] -> 5\n\
             4. byte [63-63] -> 5\n\
             5. match! 0\n",
        ),
        ("[ab]", "3. byte [61-62] -> 4\n4. match! 0\n"),
        (
            "a+",
            "3. byte [61-61] -> 4\n\
             4+ nop -> 3\n\
             5. match! 0\n",
        ),
        (
            "a+?",
            "3. byte [61-61] -> 4\n\
             4+ match! 0\n\
             5. nop -> 3\n",
        ),
        (
            "a*",
            "3+ byte [61-61] -> 3\n\
             4. match! 0\n",
        ),
        (
            "a*?",
            "3+ match! 0\n\
             4. byte [61-61] -> 3\n",
        ),
        (
            "a?",
            "3+ byte [61-61] -> 5\n\
             4. nop -> 5\n\
             5. match! 0\n",
        ),
        (
            "a??",
            "3+ nop -> 5\n\
             4. byte [61-61] -> 5\n\
             5. match! 0\n",
        ),
        (
            "a{4}",
            "3. byte [61-61] -> 4\n\
             4. byte [61-61] -> 5\n\
             5. byte [61-61] -> 6\n\
             6. byte [61-61] -> 7\n\
             7. match! 0\n",
        ),
        (
            "(a)",
            "3. capture 2 -> 4\n\
             4. byte [61-61] -> 5\n\
             5. capture 3 -> 6\n\
             6. match! 0\n",
        ),
        ("(?:a)", "3. byte [61-61] -> 4\n4. match! 0\n"),
        ("", "3. match! 0\n"),
        (
            ".",
            "3+ byte [00-09] -> 5\n\
             4. byte [0b-ff] -> 5\n\
             5. match! 0\n",
        ),
        (
            "[^ab]",
            "3+ byte [00-60] -> 5\n\
             4. byte [63-ff] -> 5\n\
             5. match! 0\n",
        ),
        ("[Aa]", "3. byte/i [61-61] -> 4\n4. match! 0\n"),
        (
            "(?s:.)+",
            "3. byte [00-ff] -> 4\n\
             4+ altmatch -> 5 | 6\n\
             5+ nop -> 3\n\
             6. match! 0\n",
        ),
        (
            "(?s:.)*",
            "3+ altmatch -> 4 | 5\n\
             4+ byte [00-ff] -> 3\n\
             5. match! 0\n",
        ),
        (
            "(?s:.)?",
            "3+ byte [00-ff] -> 5\n\
             4. nop -> 5\n\
             5. match! 0\n",
        ),
        ("[[-`]", "3. byte [5b-60] -> 4\n4. match! 0\n"),
    ];

    for &(pattern, expected) in tests {
        let prog = compile_latin1(pattern);
        assert_eq!(
            prog.dump(),
            expected,
            "incorrect compiled code for {:?}",
            pattern
        );
    }
}

#[test]
fn alternation_of_literals_keeps_branch_order() {
    // The compiler itself never coalesces alternate literal branches;
    // that is the parser's business. Feed the tree in directly.
    let re = Repr::Alternate(vec![Repr::Literal('a'), Repr::Literal('b')]);
    let prog = Compiler::new()
        .options(&Options::latin1())
        .compile(&[re])
        .unwrap();
    assert_eq!(
        prog.dump(),
        "3+ byte [61-61] -> 5\n\
         4. byte [62-62] -> 5\n\
         5. match! 0\n"
    );
}

#[test]
fn unanchored_entry_loop() {
    let prog = compile_latin1("a");
    assert_eq!(
        prog.dump_unanchored(),
        "1+ nop -> 3\n\
         2. byte [00-ff] -> 1\n\
         3. byte [61-61] -> 4\n\
         4. match! 0\n"
    );
    // Anchored pattern: both entry points coincide.
    let prog = compile_latin1("^a");
    assert!(prog.anchor_start);
    assert_eq!(prog.start, prog.start_unanchored);
}

#[test]
fn anchors_are_stripped_into_flags() {
    let prog = compile_latin1("^abc$");
    assert!(prog.anchor_start);
    assert!(prog.anchor_end);
    // No emptywidth instructions remain for the stripped text anchors.
    assert!(!prog.dump().contains("emptywidth"));

    // Multi-line anchors stay as instructions.
    let options = Options { multi_line: true, ..Options::latin1() };
    let prog = compile_with("^a$", &options);
    assert!(!prog.anchor_start);
    assert!(prog.dump().contains("emptywidth"));
}

#[test]
fn latin1_dot_bytemap() {
    // The distinct byte ranges involved in the Latin-1 dot ([^\n]).
    let prog = compile_latin1(".");
    assert_eq!(
        prog.dump_bytemap(),
        "[00-09] -> 0\n\
         [0a-0a] -> 1\n\
         [0b-ff] -> 0\n"
    );
}

#[test]
fn other_bytemap_tables() {
    // "Absent" ranges all map to the same byte class.
    let prog = compile_latin1("[0-9A-Fa-f]+");
    assert_eq!(
        prog.dump_bytemap(),
        "[00-2f] -> 0\n\
         [30-39] -> 1\n\
         [3a-40] -> 0\n\
         [41-46] -> 1\n\
         [47-60] -> 0\n\
         [61-66] -> 1\n\
         [67-ff] -> 0\n"
    );

    // The byte classes for \b: word bytes vs everything else.
    let prog = compile_latin1(r"\b");
    assert_eq!(
        prog.dump_bytemap(),
        "[00-2f] -> 0\n\
         [30-39] -> 1\n\
         [3a-40] -> 0\n\
         [41-5a] -> 1\n\
         [5b-5e] -> 0\n\
         [5f-5f] -> 1\n\
         [60-60] -> 0\n\
         [61-7a] -> 1\n\
         [7b-ff] -> 0\n"
    );

    // The ASCII case-folding optimization must not manufacture extra byte
    // classes: the folded A-Z mark lands in the same batch as the ranges
    // that triggered it.
    let prog = compile_latin1("[^_]");
    assert_eq!(
        prog.dump_bytemap(),
        "[00-5e] -> 0\n\
         [5f-5f] -> 1\n\
         [60-ff] -> 0\n"
    );
}

#[test]
fn utf8_dot_bytemap() {
    // The distinct byte ranges involved in the UTF-8 dot ([^\n]). Once,
    // erroneously split between 0x3f and 0x40 because it is a 6-bit
    // boundary.
    let prog = compile_utf8(".");
    assert_eq!(
        prog.dump_bytemap(),
        "[00-09] -> 0\n\
         [0a-0a] -> 1\n\
         [0b-7f] -> 0\n\
         [80-8f] -> 2\n\
         [90-9f] -> 3\n\
         [a0-bf] -> 4\n\
         [c0-c1] -> 1\n\
         [c2-df] -> 5\n\
         [e0-e0] -> 6\n\
         [e1-ef] -> 7\n\
         [f0-f0] -> 8\n\
         [f1-f3] -> 9\n\
         [f4-f4] -> 10\n\
         [f5-ff] -> 1\n"
    );
    assert!(prog.bytemap_range >= 11);
}

#[test]
fn insufficient_memory() {
    let options = Options { size_limit: 920, ..Options::default() };
    let re = parse(
        r"^(?P<name1>[^\s]+)\s+(?P<name2>[^\s]+)\s+(?P<name3>.+)$",
        &options,
    )
    .unwrap();
    // If the memory budget is exhausted, compilation must fail cleanly
    // instead of emitting a crippled program.
    assert!(Compiler::new()
        .options(&options)
        .compile(std::slice::from_ref(&re))
        .is_err());

    // A budget with no room for even the program header fails immediately.
    let options = Options { size_limit: 1, ..Options::default() };
    let re = parse("a", &options).unwrap();
    assert!(Compiler::new().options(&options).compile(&[re]).is_err());
}

#[test]
fn suffix_sharing_and_prefix_factoring() {
    // Common suffixes must be cached and common prefixes factored, in both
    // compile directions. Without either, Unicode classes explode.
    let (forward, reverse) = (
        compile_utf8(r"[\x{10000}\x{10010}]"),
        compile_utf8_reverse(r"[\x{10000}\x{10010}]"),
    );
    assert_eq!(
        forward.dump(),
        "3. byte [f0-f0] -> 4\n\
         4. byte [90-90] -> 5\n\
         5. byte [80-80] -> 6\n\
         6+ byte [80-80] -> 8\n\
         7. byte [90-90] -> 8\n\
         8. match! 0\n"
    );
    assert_eq!(
        reverse.dump(),
        "3+ byte [80-80] -> 5\n\
         4. byte [90-90] -> 5\n\
         5. byte [80-80] -> 6\n\
         6. byte [90-90] -> 7\n\
         7. byte [f0-f0] -> 8\n\
         8. match! 0\n"
    );

    let (forward, reverse) = (
        compile_utf8(r"[\x{8000}-\x{10FFF}]"),
        compile_utf8_reverse(r"[\x{8000}-\x{10FFF}]"),
    );
    assert_eq!(
        forward.dump(),
        "3+ byte [e8-ef] -> 5\n\
         4. byte [f0-f0] -> 8\n\
         5. byte [80-bf] -> 6\n\
         6. byte [80-bf] -> 7\n\
         7. match! 0\n\
         8. byte [90-90] -> 5\n"
    );
    assert_eq!(
        reverse.dump(),
        "3. byte [80-bf] -> 4\n\
         4. byte [80-bf] -> 5\n\
         5+ byte [e8-ef] -> 7\n\
         6. byte [90-90] -> 8\n\
         7. match! 0\n\
         8. byte [f0-f0] -> 7\n"
    );

    let reverse = compile_utf8_reverse(r"[\x{80}-\x{10FFFF}]");
    assert_eq!(
        reverse.dump(),
        "3. byte [80-bf] -> 4\n\
         4+ byte [c2-df] -> 7\n\
         5+ byte [a0-bf] -> 8\n\
         6. byte [80-bf] -> 9\n\
         7. match! 0\n\
         8. byte [e0-e0] -> 7\n\
         9+ byte [e1-ef] -> 7\n\
         10+ byte [90-bf] -> 13\n\
         11+ byte [80-bf] -> 14\n\
         12. byte [80-8f] -> 15\n\
         13. byte [f0-f0] -> 7\n\
         14. byte [f1-f3] -> 7\n\
         15. byte [f4-f4] -> 7\n"
    );
}

#[test]
fn compilation_is_deterministic() {
    for pattern in [".", r"[\x{80}-\x{10FFFF}]", "(a|b)*c{2,5}", r"\w+@\w+"] {
        let a = compile_utf8(pattern);
        let b = compile_utf8(pattern);
        assert_eq!(a.dump(), b.dump(), "nondeterministic: {:?}", pattern);
        assert_eq!(a.dump_bytemap(), b.dump_bytemap());
    }
}

#[test]
fn reverse_swaps_anchors() {
    let options = Options::latin1();
    let re = parse(r"\Aabc", &options).unwrap();
    let prog = Compiler::new()
        .options(&options)
        .reverse(true)
        .compile(std::slice::from_ref(&re))
        .unwrap();
    assert!(!prog.anchor_start);
    assert!(prog.anchor_end);
    assert!(prog.reversed);
    // Reverse program consumes "abc" right to left.
    assert_eq!(
        prog.dump(),
        "3. byte [63-63] -> 4\n\
         4. byte [62-62] -> 5\n\
         5. byte [61-61] -> 6\n\
         6. match! 0\n"
    );
}

#[test]
fn first_byte_analysis() {
    assert_eq!(compile_latin1("abc").first_byte(), Some(b'a'));
    assert_eq!(compile_latin1("a|ab").first_byte(), Some(b'a'));
    // Multiple possible first bytes.
    assert_eq!(compile_latin1("[ab]c").first_byte(), None);
    // Case folding means two possible bytes.
    assert_eq!(compile_latin1("[Aa]bc").first_byte(), None);
    // The empty string matches: no required byte.
    assert_eq!(compile_latin1("a*").first_byte(), None);
    // Assertions are transparent.
    assert_eq!(compile_latin1(r"\ba").first_byte(), Some(b'a'));
}

#[test]
fn unmatchable_patterns_collapse_to_fail() {
    let re = Repr::Concat(vec![Repr::Literal('a'), Repr::NoMatch]);
    let prog = Compiler::new()
        .options(&Options::latin1())
        .compile(&[re])
        .unwrap();
    assert_eq!(prog.start, 0);
    assert_eq!(prog.start_unanchored, 0);
}
