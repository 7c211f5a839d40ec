use std::fmt;

/// An error that occurred while parsing or compiling a regular expression.
#[derive(Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A syntax error reported by the parser front end.
    Syntax(String),
    /// The compiled program exceeded the configured size limit.
    ///
    /// The argument is the limit, in bytes, that was exceeded. Note that
    /// compilation stops as soon as the limit is crossed, so the finished
    /// program would have been at least this large.
    CompiledTooBig(usize),
    /// The compiler was handed a tree shape it cannot lower, such as a
    /// counted repetition that survived simplification. This indicates a bug
    /// in the caller (or in this crate), not a user error.
    InvalidTree(&'static str),
    /// The DFA exhausted its cache budget and no other engine was able to
    /// take over the search. Raising the DFA size limit or shrinking the
    /// input are the ways out.
    DfaOutOfMemory,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Syntax(ref err) => write!(f, "regex parse error:\n{}", err),
            Error::CompiledTooBig(limit) => write!(
                f,
                "compiled regex exceeds size limit of {} bytes",
                limit
            ),
            Error::InvalidTree(what) => {
                write!(f, "cannot compile expression tree: {}", what)
            }
            Error::DfaOutOfMemory => {
                write!(f, "DFA out of memory and no fallback engine applies")
            }
        }
    }
}

// A custom Debug keeps the syntax error's multi-line message readable in
// test failures, which would otherwise escape every newline.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Syntax(ref err) => {
                let hr: String = core::iter::repeat('~').take(79).collect();
                writeln!(f, "Syntax(")?;
                writeln!(f, "{}", hr)?;
                writeln!(f, "{}", err)?;
                writeln!(f, "{}", hr)?;
                write!(f, ")")
            }
            Error::CompiledTooBig(limit) => {
                f.debug_tuple("CompiledTooBig").field(&limit).finish()
            }
            Error::InvalidTree(what) => {
                f.debug_tuple("InvalidTree").field(&what).finish()
            }
            Error::DfaOutOfMemory => write!(f, "DfaOutOfMemory"),
        }
    }
}
