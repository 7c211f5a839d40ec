/// The set of user configurable options for compiling zero or more regexes.
///
/// Options feed two stages: the parser front end (flags like multi-line or
/// case folding) and the compiler/engines (memory budgets). Both budgets are
/// first-class here rather than ambient defaults; callers that compile many
/// patterns routinely tighten them.
#[derive(Clone, Debug)]
pub struct Options {
    /// When true, runes are bytes: the input is treated as Latin-1 instead
    /// of UTF-8, and character classes compile to single byte ranges.
    pub latin1: bool,
    /// Set the value for the multi-line matching (`m`) flag.
    ///
    /// When enabled, `^` matches the beginning of lines and `$` matches the
    /// end of lines.
    ///
    /// By default, they match beginning/end of the input.
    pub multi_line: bool,
    /// Set the value for the any character (`s`) flag, where in `.` matches
    /// anything when `s` is set and matches anything except for new line when
    /// it is not set (the default).
    pub dot_matches_new_line: bool,
    /// Set the value for the case insensitive (`i`) flag.
    pub case_insensitive: bool,
    /// Set the value for the greedy swap (`U`) flag.
    ///
    /// When enabled, a pattern like `a*` is lazy (tries to find shortest
    /// match) and `a*?` is greedy (tries to find longest match).
    ///
    /// By default, `a*` is greedy and `a*?` is lazy.
    pub swap_greed: bool,
    /// Set the approximate size limit, in bytes, of the compiled program.
    ///
    /// This bounds the instruction count: compilation stops with an error
    /// once the program plus its bookkeeping would exceed this size. What
    /// remains of the budget after emission is handed to the DFA caches.
    ///
    /// Zero means "no configured limit" and picks generous defaults.
    pub size_limit: usize,
    /// Set the approximate size of the cache used by the DFA.
    ///
    /// This roughly corresponds to the number of bytes that the DFA will
    /// use while searching. It does not impact correctness: when the cache
    /// fills, it is wiped and states are re-computed, and a search that
    /// thrashes the cache reports failure so the caller can fall back to
    /// another engine.
    pub dfa_size_limit: usize,
    /// Set the nesting limit enforced by the parser.
    ///
    /// The nesting limit controls how deep the abstract syntax tree is
    /// allowed to be. If the AST exceeds the given limit (e.g., with too
    /// many nested groups), then an error is returned by the parser.
    pub nest_limit: u32,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            latin1: false,
            multi_line: false,
            dot_matches_new_line: false,
            case_insensitive: false,
            swap_greed: false,
            size_limit: 10 * (1 << 20),
            dfa_size_limit: 2 * (1 << 20),
            nest_limit: 250,
        }
    }
}

impl Options {
    /// Options with every flag at its default.
    pub fn new() -> Options {
        Options::default()
    }

    /// Latin-1 options: runes are bytes.
    pub fn latin1() -> Options {
        Options { latin1: true, ..Options::default() }
    }
}
