/*!
A byte-level regular expression program engine.

Patterns are parsed (by `regex-syntax`) into an expression tree, compiled
into a flat array of byte-oriented instructions, and executed by one of two
engines, both guaranteed to run in time linear in the length of the input:

* a DFA built lazily by subset construction over the instruction program,
  with a bounded, shared state cache; and
* a bounded bit-state backtracker that tracks visited
  `(instruction, position)` pairs in a bitmap, used for small programs on
  small inputs because it can also report submatch boundaries cheaply.

The compiled [`Program`] is immutable once built (except for a couple of
lazily initialized caches) and may be searched from many threads at once.
[`Exec`] ties the pieces together: it owns a forward and a reverse program
and dispatches each search to the engine that fits, falling back from one to
the other when size or memory budgets require.

This crate deliberately stops at the engine boundary: there is no
`find_iter`/`replace` surface here, just compilation and the search entry
points described on [`Exec`], [`Program`] and [`Set`].
*/

#![warn(missing_docs)]

mod backtrack;
mod bytemap;
mod compile;
mod dfa;
mod error;
mod exec;
mod literal;
mod optimize;
mod options;
mod prog;
mod repr;
mod set;
mod sparse;
mod translate;

pub use crate::backtrack::should_exec as bitstate_applicable;
pub use crate::compile::Compiler;
pub use crate::dfa::{DfaResult, StreamContext};
pub use crate::error::Error;
pub use crate::exec::{Exec, ExecBuilder, Slot};
pub use crate::options::Options;
pub use crate::prog::{
    Anchor, EmptyFlags, Inst, InstKind, InstPtr, MatchKind, Program,
};
pub use crate::repr::Repr;
pub use crate::set::Set;
pub use crate::translate::parse;
