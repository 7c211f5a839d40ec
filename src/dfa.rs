/*!
The DFA matching engine.

A DFA provides faster matching because the engine is in exactly one state at
any point in time, where the backtracker may have many live alternatives to
juggle. The trade off is space: the number of DFA states can grow
exponentially in the size of the program. To mitigate this, the DFA here is
built *online*: states are constructed by subset construction over the
program only as the input actually reaches them, and cached so they can be
reused. If the cache grows past its budget it is wiped and matching
continues from a saved snapshot of the current state; a search that cannot
fit even that snapshot back into a fresh cache reports failure so the
caller can fall back to another engine.

A single DFA is shared by every thread searching the same program. The
sharing discipline is split across two locks:

* `cache_mutex` (a reader/writer lock) protects the *validity* of `State`
  pointers. Searches hold it shared for their whole duration; the only
  exclusive acquisition is the cache flush, which frees every state. Any
  `State` reference obtained under the shared lock is good until the holder
  releases it.
* `inner` (a plain mutex) protects the allocation side: the state table,
  the memory budget and the scratch work queues used during subset
  construction. A thread that needs a missing transition takes `inner`
  while still holding `cache_mutex` shared, computes the target state and
  publishes it.

Transitions themselves are `AtomicPtr` slots published with release stores
and read with acquire loads, so the hot loop follows cached transitions
without touching `inner` at all.

Because of the lazy construction the inner matching loop is considerably
more complex than one might expect out of a DFA. A number of tricks are
employed to make it fast. Tread carefully.
*/

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::mem::size_of;
use std::ops::Range;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, trace};

use crate::prog::{
    EmptyFlags, InstKind, InstPtr, MatchKind, Program, BYTE_END_TEXT,
};
use crate::sparse::SparseSet;

// State flag word layout. The low byte holds the EmptyFlags satisfied on
// the way into the state; the bits above 16 record which empty flags the
// state's instructions still care about, so a step can tell whether newly
// available assertions are worth an extra closure pass.
const FLAG_EMPTY_MASK: u32 = 0xFF;
const FLAG_MATCH: u32 = 0x0100;
const FLAG_LAST_WORD: u32 = 0x0200;
const FLAG_NEED_SHIFT: u32 = 16;

// Special "first byte" values for a start state.
// (Values >= 0 denote actual bytes.)
const FB_UNKNOWN: i32 = -1; // no analysis has been performed
const FB_MANY: i32 = -2; // many bytes lead out of the start state
const FB_NONE: i32 = -3; // no byte leads out of the start state

// Indices into the start-state table for unanchored searches.
// Add START_ANCHORED for anchored searches.
const START_BEGIN_TEXT: usize = 0;
const START_BEGIN_LINE: usize = 2;
const START_AFTER_WORD_CHAR: usize = 4;
const START_AFTER_NON_WORD_CHAR: usize = 6;
const MAX_START: usize = 8;
const START_ANCHORED: usize = 1;

/// The dead state: no sequence of further input leads to a match.
const DEAD_STATE: *mut State = 1 as *mut State;
/// The full-match state: every continuation of the input matches.
const FULL_MATCH_STATE: *mut State = 2 as *mut State;

fn is_special(s: *mut State) -> bool {
    (s as usize) <= 2
}

/// A single DFA state.
///
/// `insts` is the canonicalized, ordered set of program instructions live
/// in this state; insertion order encodes thread priority. `flags` is the
/// flag word described at the top of the module. `next` has one slot per
/// byte class plus one more for the end-of-text sentinel; a null slot means
/// the transition has not been computed yet.
struct State {
    insts: Box<[InstPtr]>,
    flags: u32,
    next: Box<[AtomicPtr<State>]>,
}

impl State {
    fn is_match(&self) -> bool {
        self.flags & FLAG_MATCH != 0
    }

    fn approximate_size(&self) -> usize {
        size_of::<State>()
            + self.insts.len() * size_of::<InstPtr>()
            + self.next.len() * size_of::<AtomicPtr<State>>()
    }
}

/// Wrapper giving `State` equality and hashing over its identity
/// (instruction set and flag word), ignoring the transition table.
struct CachedState(Box<State>);

impl PartialEq for CachedState {
    fn eq(&self, other: &CachedState) -> bool {
        self.0.flags == other.0.flags && self.0.insts == other.0.insts
    }
}

impl Eq for CachedState {}

impl Hash for CachedState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.flags.hash(state);
        self.0.insts.hash(state);
    }
}

/// The start state for one of the eight search configurations, along with
/// its "first byte" hint. Published with release stores once computed;
/// reset to null/unknown on every cache flush.
struct StartInfo {
    start: AtomicPtr<State>,
    firstbyte: AtomicI32,
}

impl StartInfo {
    fn new() -> StartInfo {
        StartInfo {
            start: AtomicPtr::new(std::ptr::null_mut()),
            firstbyte: AtomicI32::new(FB_UNKNOWN),
        }
    }
}

/// Allocation-side state, guarded by the `inner` mutex.
struct DfaInner {
    /// All states computed so far, keyed by their identity.
    states: HashSet<CachedState>,
    /// Memory remaining for new states, in bytes. Goes negative at the
    /// allocation that busts the budget, which triggers a flush.
    state_budget: isize,
    /// Scratch work queues for subset construction.
    q0: SparseSet,
    q1: SparseSet,
    /// Scratch stack for add_to_queue.
    astack: Vec<InstPtr>,
}

/// A lazily built DFA over a compiled program.
///
/// The DFA holds no reference to its program; every operation takes the
/// program as a parameter, which keeps the two structures free of
/// self-reference while the program owns the DFA behind a once cell.
pub(crate) struct Dfa {
    kind: MatchKind,
    /// Number of byte classes plus one for the end-of-text sentinel; the
    /// width of every state's transition table.
    nnext: usize,
    /// Total budget for the state cache; the per-flush allowance.
    mem_budget: usize,
    /// Construction determined there is not enough memory to do anything.
    init_failed: bool,
    cache_mutex: RwLock<()>,
    inner: Mutex<DfaInner>,
    start: [StartInfo; MAX_START],
}

/// What a single DFA search reported.
#[derive(Clone, Debug, Default)]
pub struct DfaResult {
    /// Whether a match was found.
    pub matched: bool,
    /// The search gave up (out of cache memory); the caller must fall back
    /// to another engine. Other fields are meaningless when set.
    pub failed: bool,
    /// Position of the match in context coordinates: the end for a forward
    /// search, the start for a reverse one.
    pub ep: usize,
}

/// Search parameters threaded through the specialized loops.
struct SearchParams<'a> {
    context: &'a [u8],
    text: Range<usize>,
    anchored: bool,
    want_earliest_match: bool,
    run_forward: bool,
    start: *mut State,
    firstbyte: i32,
    matches: Option<&'a mut Vec<usize>>,
}

/// Holds the cache lock in either mode. Readers keep the shared side for a
/// whole search; a flush upgrades to exclusive and stays there, which is
/// fine because the flush already invalidated everyone else's pointers.
struct RwLocker<'a> {
    lock: &'a RwLock<()>,
    read: Option<RwLockReadGuard<'a, ()>>,
    write: Option<RwLockWriteGuard<'a, ()>>,
}

impl<'a> RwLocker<'a> {
    fn reading(lock: &'a RwLock<()>) -> RwLocker<'a> {
        RwLocker { lock, read: Some(read_lock(lock)), write: None }
    }

    fn lock_for_writing(&mut self) {
        if self.write.is_none() {
            self.read = None;
            self.write = Some(write_lock(self.lock));
        }
    }
}

fn read_lock<'a>(lock: &'a RwLock<()>) -> RwLockReadGuard<'a, ()> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<'a>(lock: &'a RwLock<()>) -> RwLockWriteGuard<'a, ()> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_inner<'a>(mutex: &'a Mutex<DfaInner>) -> MutexGuard<'a, DfaInner> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Preserves a state's identity across a cache flush: pointers die with the
/// flush, contents do not.
struct StateSaver {
    special: Option<*mut State>,
    insts: Vec<InstPtr>,
    flags: u32,
}

impl StateSaver {
    fn save(s: *mut State) -> StateSaver {
        if is_special(s) {
            return StateSaver { special: Some(s), insts: Vec::new(), flags: 0 };
        }
        // Safety: the caller holds the cache lock, so `s` is alive.
        let state = unsafe { &*s };
        StateSaver {
            special: None,
            insts: state.insts.to_vec(),
            flags: state.flags,
        }
    }

    /// Re-resolves the saved identity in the (freshly flushed) cache.
    /// Returns None if even this single state does not fit in memory.
    fn restore(&self, dfa: &Dfa, inner: &mut DfaInner) -> Option<*mut State> {
        if let Some(s) = self.special {
            return Some(s);
        }
        cached_state(
            &mut inner.states,
            &mut inner.state_budget,
            dfa.nnext,
            &self.insts,
            self.flags,
        )
    }
}

impl Dfa {
    pub fn new(prog: &Program, kind: MatchKind, max_mem: usize) -> Dfa {
        let nnext = prog.bytemap_range + 1;
        let nastack = prog.len().max(16);

        // One-time allocations are charged against the budget up front;
        // what remains pays for states.
        let one_time = 2 * prog.len() * size_of::<u32>() * 2
            + nastack * size_of::<InstPtr>();
        let budget = max_mem as isize - one_time as isize;
        let init_failed = budget <= 0;

        Dfa {
            kind,
            nnext,
            mem_budget: budget.max(0) as usize,
            init_failed,
            cache_mutex: RwLock::new(()),
            inner: Mutex::new(DfaInner {
                states: HashSet::new(),
                state_budget: budget.max(0),
                q0: SparseSet::new(prog.len()),
                q1: SparseSet::new(prog.len()),
                astack: Vec::with_capacity(nastack),
            }),
            start: [
                StartInfo::new(),
                StartInfo::new(),
                StartInfo::new(),
                StartInfo::new(),
                StartInfo::new(),
                StartInfo::new(),
                StartInfo::new(),
                StartInfo::new(),
            ],
        }
    }

    /// Searches for the program's pattern in `text`, which is a subrange of
    /// `context`; the surrounding bytes of `context` decide `^`, `$`, `\b`
    /// and friends at the text boundaries.
    ///
    /// If `run_forward` is false, the search consumes text right to left
    /// (the program must have been reverse compiled) and the reported
    /// position is the leftmost end of the match, i.e. the match start.
    ///
    /// If `want_earliest_match` is true, the first acceptance wins even if
    /// a longer match is possible.
    pub fn search(
        &self,
        prog: &Program,
        context: &[u8],
        text: Range<usize>,
        anchored: bool,
        want_earliest_match: bool,
        run_forward: bool,
        matches: Option<&mut Vec<usize>>,
    ) -> DfaResult {
        if self.init_failed {
            return DfaResult { failed: true, ..DfaResult::default() };
        }
        debug_assert!(text.start <= text.end && text.end <= context.len());

        let mut cache_lock = RwLocker::reading(&self.cache_mutex);
        let mut params = SearchParams {
            context,
            text,
            anchored,
            want_earliest_match,
            run_forward,
            start: std::ptr::null_mut(),
            firstbyte: FB_UNKNOWN,
            matches,
        };
        if !self.analyze_search(prog, &mut params, &mut cache_lock) {
            return DfaResult { failed: true, ..DfaResult::default() };
        }
        if params.start == DEAD_STATE {
            return DfaResult::default();
        }
        if params.start == FULL_MATCH_STATE {
            let ep = if run_forward {
                params.text.end
            } else {
                params.text.start
            };
            return DfaResult { matched: true, failed: false, ep };
        }
        self.fast_search_loop(prog, &mut params, &mut cache_lock)
    }

    /// Builds out every reachable state over every input class, for tests
    /// and memory-compliance diagnostics. Returns the number of distinct
    /// states, or 0 if the budget was exhausted before the fixpoint.
    pub fn build_all_states(&self, prog: &Program) -> usize {
        if self.init_failed {
            return 0;
        }
        let mut cache_lock = RwLocker::reading(&self.cache_mutex);
        let mut params = SearchParams {
            context: b"",
            text: 0..0,
            anchored: prog.anchor_start,
            want_earliest_match: false,
            run_forward: true,
            start: std::ptr::null_mut(),
            firstbyte: FB_UNKNOWN,
            matches: None,
        };
        if !self.analyze_search(prog, &mut params, &mut cache_lock) {
            return 0;
        }
        if is_special(params.start) {
            return 0;
        }

        let mut queue: Vec<*mut State> = vec![params.start];
        let mut seen: Vec<*mut State> = vec![params.start];
        let mut i = 0;
        while i < queue.len() {
            let s = queue[i];
            i += 1;
            for c in 0..=255usize {
                match self.run_state_on_byte_unlocked(prog, s, c) {
                    None => return 0,
                    Some(ns) => {
                        if !is_special(ns) && !seen.contains(&ns) {
                            seen.push(ns);
                            queue.push(ns);
                        }
                    }
                }
            }
            if self.run_state_on_byte_unlocked(prog, s, BYTE_END_TEXT).is_none()
            {
                return 0;
            }
        }
        lock_inner(&self.inner).states.len()
    }

    // ---- start-state analysis ------------------------------------------

    /// Fills in `params.start` and `params.firstbyte` from the other search
    /// parameters. Returns false on memory exhaustion.
    fn analyze_search(
        &self,
        prog: &Program,
        params: &mut SearchParams<'_>,
        cache_lock: &mut RwLocker<'_>,
    ) -> bool {
        // Determine where text is within context, in the direction the
        // search runs, and pick the start configuration accordingly.
        let (mut idx, flags) = if params.run_forward {
            let at = params.text.start;
            if at == 0 {
                (
                    START_BEGIN_TEXT,
                    (EmptyFlags::BEGIN_TEXT | EmptyFlags::BEGIN_LINE).0 as u32,
                )
            } else if params.context[at - 1] == b'\n' {
                (START_BEGIN_LINE, EmptyFlags::BEGIN_LINE.0 as u32)
            } else if Program::is_word_byte(params.context[at - 1]) {
                (START_AFTER_WORD_CHAR, FLAG_LAST_WORD)
            } else {
                (START_AFTER_NON_WORD_CHAR, 0)
            }
        } else {
            let at = params.text.end;
            if at == params.context.len() {
                (
                    START_BEGIN_TEXT,
                    (EmptyFlags::BEGIN_TEXT | EmptyFlags::BEGIN_LINE).0 as u32,
                )
            } else if params.context[at] == b'\n' {
                (START_BEGIN_LINE, EmptyFlags::BEGIN_LINE.0 as u32)
            } else if Program::is_word_byte(params.context[at]) {
                (START_AFTER_WORD_CHAR, FLAG_LAST_WORD)
            } else {
                (START_AFTER_NON_WORD_CHAR, 0)
            }
        };
        let anchored = params.anchored || prog.anchor_start;
        if anchored {
            idx |= START_ANCHORED;
        }

        if self.analyze_search_helper(prog, idx, anchored, flags) {
            params.start = self.start[idx].start.load(Ordering::Acquire);
            params.firstbyte = self.start[idx].firstbyte.load(Ordering::Acquire);
            return true;
        }

        // Out of memory computing the start state: flush and try once more.
        debug!("dfa: flushing cache while analyzing start state");
        self.reset_cache(cache_lock);
        if self.analyze_search_helper(prog, idx, anchored, flags) {
            params.start = self.start[idx].start.load(Ordering::Acquire);
            params.firstbyte = self.start[idx].firstbyte.load(Ordering::Acquire);
            return true;
        }
        false
    }

    fn analyze_search_helper(
        &self,
        prog: &Program,
        idx: usize,
        anchored: bool,
        flags: u32,
    ) -> bool {
        let info = &self.start[idx];

        // Quick check: both fields already published.
        if !info.start.load(Ordering::Acquire).is_null()
            && info.firstbyte.load(Ordering::Acquire) != FB_UNKNOWN
        {
            return true;
        }

        let mut inner = lock_inner(&self.inner);
        if !info.start.load(Ordering::Acquire).is_null()
            && info.firstbyte.load(Ordering::Acquire) != FB_UNKNOWN
        {
            return true;
        }

        let start_inst =
            if anchored { prog.start } else { prog.start_unanchored };
        let s = {
            let DfaInner {
                ref mut states,
                ref mut state_budget,
                ref mut q0,
                ref mut astack,
                ..
            } = *inner;
            q0.clear();
            add_to_queue(prog, q0, astack, start_inst, flags);
            match workq_to_cached_state(
                prog,
                self.kind,
                self.nnext,
                states,
                state_budget,
                q0,
                flags,
            ) {
                None => return false,
                Some(s) => s,
            }
        };
        info.start.store(s, Ordering::Release);

        // Compute the "first byte" hint: run the start state on every byte
        // value looking for a single one that leads somewhere new.
        let mut firstbyte = FB_NONE;
        if s == FULL_MATCH_STATE {
            firstbyte = FB_NONE; // any byte works, no scan needed
        } else if !is_special(s) {
            for c in 0..=255usize {
                let ns = match self.run_state_on_byte(prog, &mut inner, s, c)
                {
                    None => return false,
                    Some(ns) => ns,
                };
                if ns == s || ns == DEAD_STATE {
                    continue;
                }
                if firstbyte == FB_NONE {
                    firstbyte = c as i32; // the first byte that leads out
                } else {
                    firstbyte = FB_MANY; // too many bytes lead out
                    break;
                }
            }
        }
        info.firstbyte.store(firstbyte, Ordering::Release);
        true
    }

    // ---- state construction --------------------------------------------

    /// Computes (or re-reads) the transition out of `s` on input class of
    /// byte `c` (`BYTE_END_TEXT` for the sentinel), taking the allocation
    /// mutex. Returns None when the memory budget is exhausted; the caller
    /// decides whether to flush.
    ///
    /// The caller must hold the cache lock (either mode).
    fn run_state_on_byte_unlocked(
        &self,
        prog: &Program,
        s: *mut State,
        c: usize,
    ) -> Option<*mut State> {
        let mut inner = lock_inner(&self.inner);
        self.run_state_on_byte(prog, &mut inner, s, c)
    }

    fn run_state_on_byte(
        &self,
        prog: &Program,
        inner: &mut DfaInner,
        s: *mut State,
        c: usize,
    ) -> Option<*mut State> {
        debug_assert!(!is_special(s));
        // Safety: the caller holds the cache lock, so `s` is alive, and we
        // hold the allocation mutex, so we are the only writer.
        let state = unsafe { &*s };

        let cls = byte_class(prog, c);
        let existing = state.next[cls].load(Ordering::Acquire);
        if !existing.is_null() {
            return Some(existing);
        }

        // Convert state into a work queue.
        let DfaInner {
            ref mut states,
            ref mut state_budget,
            ref mut q0,
            ref mut q1,
            ref mut astack,
        } = *inner;
        q0.clear();
        for &id in state.insts.iter() {
            q0.insert(id);
        }

        // Flags marking the zero-width assertions around this byte. Before
        // the byte we have the flags recorded in the state; after the byte
        // we know at most that a newline starts a new line.
        let oldbeforeflag = state.flags & FLAG_EMPTY_MASK;
        let mut beforeflag = oldbeforeflag;
        let mut afterflag: u32 = 0;

        if c == b'\n' as usize {
            beforeflag |= EmptyFlags::END_LINE.0 as u32;
            afterflag |= EmptyFlags::BEGIN_LINE.0 as u32;
        }
        if c == BYTE_END_TEXT {
            beforeflag |=
                (EmptyFlags::END_TEXT | EmptyFlags::END_LINE).0 as u32;
        }

        let islastword = state.flags & FLAG_LAST_WORD != 0;
        let isword = c != BYTE_END_TEXT && Program::is_word_byte(c as u8);
        if isword == islastword {
            beforeflag |= EmptyFlags::NOT_WORD_BOUNDARY.0 as u32;
        } else {
            beforeflag |= EmptyFlags::WORD_BOUNDARY.0 as u32;
        }

        // Rerun the empty-string closure only if flags the state actually
        // cares about became newly available.
        if beforeflag & !oldbeforeflag & (state.flags >> FLAG_NEED_SHIFT) != 0
        {
            q1.clear();
            for &id in q0.iter() {
                add_to_queue(prog, q1, astack, id, beforeflag);
            }
            std::mem::swap(q0, q1);
        }

        // Now run the byte.
        let mut ismatch = false;
        run_workq_on_byte(
            prog,
            self.kind,
            q0,
            q1,
            astack,
            c,
            afterflag,
            &mut ismatch,
        );

        let mut flag = afterflag;
        if ismatch {
            flag |= FLAG_MATCH;
        }
        if isword {
            flag |= FLAG_LAST_WORD;
        }

        let ns = workq_to_cached_state(
            prog,
            self.kind,
            self.nnext,
            states,
            state_budget,
            q1,
            flag,
        )?;
        trace!(
            "dfa: built transition on byte {:#x} to {} insts",
            c,
            if is_special(ns) { 0 } else { unsafe { &*ns }.insts.len() }
        );
        state.next[cls].store(ns, Ordering::Release);
        Some(ns)
    }

    /// Flushes the entire state cache.
    ///
    /// Upgrades the caller's cache lock to exclusive, which waits out every
    /// concurrent reader; their `State` pointers are all invalid once this
    /// returns. Callers preserve what they need with a `StateSaver`.
    fn reset_cache(&self, cache_lock: &mut RwLocker<'_>) {
        cache_lock.lock_for_writing();
        let mut inner = lock_inner(&self.inner);
        debug!(
            "dfa: cache flush ({} states, budget {})",
            inner.states.len(),
            self.mem_budget
        );
        for info in &self.start {
            info.start.store(std::ptr::null_mut(), Ordering::Release);
            info.firstbyte.store(FB_UNKNOWN, Ordering::Release);
        }
        inner.states.clear();
        inner.state_budget = self.mem_budget as isize;
    }

    // ---- search loops --------------------------------------------------

    /// Dispatches to the specialized loop for this search's shape. The
    /// specialization strips the three per-search conditionals out of the
    /// hot loop entirely.
    fn fast_search_loop(
        &self,
        prog: &Program,
        params: &mut SearchParams<'_>,
        cache_lock: &mut RwLocker<'_>,
    ) -> DfaResult {
        let have_firstbyte = params.firstbyte >= 0;
        match (have_firstbyte, params.want_earliest_match, params.run_forward)
        {
            (false, false, false) => {
                self.search_loop::<false, false, false>(prog, params, cache_lock)
            }
            (false, false, true) => {
                self.search_loop::<false, false, true>(prog, params, cache_lock)
            }
            (false, true, false) => {
                self.search_loop::<false, true, false>(prog, params, cache_lock)
            }
            (false, true, true) => {
                self.search_loop::<false, true, true>(prog, params, cache_lock)
            }
            (true, false, false) => {
                self.search_loop::<true, false, false>(prog, params, cache_lock)
            }
            (true, false, true) => {
                self.search_loop::<true, false, true>(prog, params, cache_lock)
            }
            (true, true, false) => {
                self.search_loop::<true, true, false>(prog, params, cache_lock)
            }
            (true, true, true) => {
                self.search_loop::<true, true, true>(prog, params, cache_lock)
            }
        }
    }

    /// The generic search loop, monomorphized into eight variants.
    ///
    /// A match is noticed one byte late: entering a state whose flag word
    /// has the match bit means the match ended just before the byte that
    /// led here. The loop therefore runs one extra step past the last byte
    /// (on the real following byte, or the end-of-text sentinel) to pick up
    /// matches that end exactly at the boundary.
    #[inline(always)]
    fn search_loop<
        const HAVE_FIRSTBYTE: bool,
        const WANT_EARLIEST: bool,
        const RUN_FORWARD: bool,
    >(
        &self,
        prog: &Program,
        params: &mut SearchParams<'_>,
        cache_lock: &mut RwLocker<'_>,
    ) -> DfaResult {
        let context = params.context;
        let text = params.text.clone();
        let mut start = params.start;
        let mut s = start;
        let mut matched = false;
        let mut lastmatch: Option<usize> = None;

        let mut p = if RUN_FORWARD { text.start } else { text.end };
        let end = if RUN_FORWARD { text.end } else { text.start };

        while p != end {
            if HAVE_FIRSTBYTE && s == start {
                // In the start state the only way forward is through the
                // required first byte, so let memchr skip ahead to it.
                let fb = params.firstbyte as u8;
                if RUN_FORWARD {
                    match memchr::memchr(fb, &context[p..end]) {
                        Some(i) => p += i,
                        None => {
                            p = end;
                            break;
                        }
                    }
                } else {
                    match memchr::memrchr(fb, &context[end..p]) {
                        Some(i) => p = end + i + 1,
                        None => {
                            p = end;
                            break;
                        }
                    }
                }
            }

            let c = if RUN_FORWARD {
                let c = context[p];
                p += 1;
                c
            } else {
                p -= 1;
                context[p]
            };

            // Multiple threads may be consulting this slot simultaneously;
            // it is published with a release store.
            let cls = prog.bytemap(c);
            let mut ns =
                unsafe { &*s }.next[cls].load(Ordering::Acquire);
            if ns.is_null() {
                ns = match self.grow_transition(
                    prog, cache_lock, &mut s, &mut start, c as usize,
                ) {
                    Some(ns) => ns,
                    None => {
                        return DfaResult {
                            failed: true,
                            ..DfaResult::default()
                        }
                    }
                };
            }
            if is_special(ns) {
                if ns == DEAD_STATE {
                    return DfaResult {
                        matched,
                        failed: false,
                        ep: lastmatch.unwrap_or(0),
                    };
                }
                // Full match: everything from here on accepts.
                let ep = if RUN_FORWARD { text.end } else { text.start };
                return DfaResult { matched: true, failed: false, ep };
            }

            s = ns;
            if unsafe { &*s }.is_match() {
                matched = true;
                // The DFA notices the match one byte late.
                let at = if RUN_FORWARD { p - 1 } else { p + 1 };
                lastmatch = Some(at);
                if self.kind == MatchKind::ManyMatch {
                    save_matches(prog, unsafe { &*s }, &mut params.matches);
                }
                if WANT_EARLIEST {
                    return DfaResult { matched: true, failed: false, ep: at };
                }
            }
        }

        // Process one more byte to see if it triggers a match (matches are
        // delayed one byte) and to fire any trailing empty-width
        // assertions.
        let lastbyte = if RUN_FORWARD {
            if text.end == context.len() {
                BYTE_END_TEXT
            } else {
                context[text.end] as usize
            }
        } else if text.start == 0 {
            BYTE_END_TEXT
        } else {
            context[text.start - 1] as usize
        };

        let cls = byte_class(prog, lastbyte);
        let mut ns = unsafe { &*s }.next[cls].load(Ordering::Acquire);
        if ns.is_null() {
            ns = match self.grow_transition(
                prog, cache_lock, &mut s, &mut start, lastbyte,
            ) {
                Some(ns) => ns,
                None => {
                    return DfaResult { failed: true, ..DfaResult::default() }
                }
            };
        }
        if is_special(ns) {
            if ns == DEAD_STATE {
                return DfaResult {
                    matched,
                    failed: false,
                    ep: lastmatch.unwrap_or(0),
                };
            }
            let ep = if RUN_FORWARD { text.end } else { text.start };
            return DfaResult { matched: true, failed: false, ep };
        }
        s = ns;
        if unsafe { &*s }.is_match() {
            matched = true;
            lastmatch = Some(p);
            if self.kind == MatchKind::ManyMatch {
                save_matches(prog, unsafe { &*s }, &mut params.matches);
            }
        }

        DfaResult { matched, failed: false, ep: lastmatch.unwrap_or(0) }
    }

    /// Slow path of the search loop: computes a missing transition,
    /// flushing and restarting from saved states if the cache is full.
    /// `s` and `start` are re-resolved in place when a flush happens.
    #[inline(never)]
    fn grow_transition(
        &self,
        prog: &Program,
        cache_lock: &mut RwLocker<'_>,
        s: &mut *mut State,
        start: &mut *mut State,
        c: usize,
    ) -> Option<*mut State> {
        if let Some(ns) = self.run_state_on_byte_unlocked(prog, *s, c) {
            return Some(ns);
        }

        // The cache is full. Record the current states, flush, and pick up
        // where we left off.
        debug!("dfa: state cache full, flushing mid-search");
        let save_s = StateSaver::save(*s);
        let save_start = StateSaver::save(*start);
        self.reset_cache(cache_lock);
        {
            let mut inner = lock_inner(&self.inner);
            *s = save_s.restore(self, &mut inner)?;
            *start = save_start.restore(self, &mut inner)?;
        }
        self.run_state_on_byte_unlocked(prog, *s, c)
    }
}

fn byte_class(prog: &Program, c: usize) -> usize {
    if c == BYTE_END_TEXT {
        prog.bytemap_range
    } else {
        prog.bytemap(c as u8)
    }
}

fn save_matches(
    prog: &Program,
    s: &State,
    matches: &mut Option<&mut Vec<usize>>,
) {
    if let Some(v) = matches.as_mut() {
        for &id in s.insts.iter() {
            if let InstKind::Match { id: pat } = prog.inst(id).kind {
                let pat = pat as usize;
                if !v.contains(&pat) {
                    v.push(pat);
                }
            }
        }
    }
}

/// Adds `id` to the queue, following epsilon arrows as far as the given
/// flags allow. Byte ranges, matches and pending assertions stay in the
/// queue; captures and nops are invisible to the DFA.
fn add_to_queue(
    prog: &Program,
    q: &mut SparseSet,
    stk: &mut Vec<InstPtr>,
    id: InstPtr,
    flag: u32,
) {
    stk.clear();
    stk.push(id);
    while let Some(mut id) = stk.pop() {
        loop {
            if id == 0 || q.contains(id) {
                break;
            }
            q.insert(id);

            let ip = prog.inst(id);
            match ip.kind {
                InstKind::Fail | InstKind::Alt { .. } => break,
                InstKind::ByteRange { .. }
                | InstKind::Match { .. }
                | InstKind::AltMatch { .. } => {
                    // These stay on the queue.
                    if ip.last {
                        break;
                    }
                    id += 1;
                }
                InstKind::Capture { .. } | InstKind::Nop => {
                    if !ip.last {
                        stk.push(id + 1);
                    }
                    id = ip.out;
                }
                InstKind::EmptyWidth { look } => {
                    if !ip.last {
                        stk.push(id + 1);
                    }
                    // Continue on only with all the right flag bits.
                    if (look.0 as u32) & !flag != 0 {
                        break;
                    }
                    id = ip.out;
                }
            }
        }
    }
}

/// Steps the queue over one input byte (or the end-of-text sentinel),
/// producing the next queue. Sets `ismatch` when a match instruction fires
/// at this step.
fn run_workq_on_byte(
    prog: &Program,
    kind: MatchKind,
    q: &SparseSet,
    nq: &mut SparseSet,
    stk: &mut Vec<InstPtr>,
    c: usize,
    flag: u32,
    ismatch: &mut bool,
) {
    nq.clear();
    for &id in q.iter() {
        let ip = prog.inst(id);
        match ip.kind {
            InstKind::Fail
            | InstKind::Alt { .. }
            | InstKind::AltMatch { .. }
            | InstKind::Capture { .. }
            | InstKind::EmptyWidth { .. }
            | InstKind::Nop => {}
            InstKind::ByteRange { .. } => {
                let byte =
                    if c == BYTE_END_TEXT { None } else { Some(c as u8) };
                if ip.matches_byte(byte) {
                    add_to_queue(prog, nq, stk, ip.out, flag);
                }
            }
            InstKind::Match { .. } => {
                if prog.anchor_end
                    && c != BYTE_END_TEXT
                    && kind != MatchKind::ManyMatch
                {
                    continue;
                }
                *ismatch = true;
                if kind == MatchKind::FirstMatch {
                    // Can stop processing: nothing of lower priority can
                    // improve on this.
                    return;
                }
                if kind == MatchKind::ManyMatch {
                    // Keep the match instruction around so the state can
                    // report which pattern it belongs to.
                    add_to_queue(prog, nq, stk, id, flag);
                }
            }
        }
    }
}

/// Canonicalizes a work queue into a cached state, allocating it if it has
/// not been seen before. Returns None when the budget is exhausted.
fn workq_to_cached_state(
    prog: &Program,
    kind: MatchKind,
    nnext: usize,
    states: &mut HashSet<CachedState>,
    state_budget: &mut isize,
    q: &SparseSet,
    mut flag: u32,
) -> Option<*mut State> {
    // Identify the subset of the queue that matters for future execution:
    // byte ranges, matches and pending assertions. Everything else was
    // already resolved while building the queue.
    let mut insts: Vec<InstPtr> = Vec::with_capacity(q.len());
    let mut needflags: u32 = 0;
    let mut sawmatch = false;
    for &id in q.iter() {
        if sawmatch && kind == MatchKind::FirstMatch {
            // Lower-priority threads can never win in leftmost-first
            // matching once a match is on the queue.
            break;
        }
        let ip = prog.inst(id);
        match ip.kind {
            InstKind::AltMatch { .. } => {
                if kind != MatchKind::ManyMatch {
                    // The state would keep matching all the way to the end
                    // of the string; there is no point continuing.
                    return Some(FULL_MATCH_STATE);
                }
            }
            InstKind::ByteRange { .. } => insts.push(id),
            InstKind::EmptyWidth { look } => {
                insts.push(id);
                needflags |= look.0 as u32;
            }
            InstKind::Match { .. } => {
                insts.push(id);
                if !prog.anchor_end {
                    sawmatch = true;
                }
            }
            _ => {}
        }
    }

    // If no assertions are pending, the empty-width bits can never matter
    // again; dropping them collapses otherwise distinct states.
    if needflags == 0 {
        flag &= FLAG_MATCH | FLAG_LAST_WORD;
    }
    if needflags
        & (EmptyFlags::WORD_BOUNDARY | EmptyFlags::NOT_WORD_BOUNDARY).0 as u32
        == 0
    {
        flag &= !FLAG_LAST_WORD;
    }
    flag |= needflags << FLAG_NEED_SHIFT;

    if insts.is_empty() && flag == 0 {
        return Some(DEAD_STATE);
    }

    cached_state(states, state_budget, nnext, &insts, flag)
}

/// Looks up the state with exactly these contents, allocating and
/// installing it on a miss.
fn cached_state(
    states: &mut HashSet<CachedState>,
    state_budget: &mut isize,
    nnext: usize,
    insts: &[InstPtr],
    flag: u32,
) -> Option<*mut State> {
    let probe = CachedState(Box::new(State {
        insts: insts.to_vec().into_boxed_slice(),
        flags: flag,
        next: Box::new([]),
    }));
    if let Some(existing) = states.get(&probe) {
        return Some(&*existing.0 as *const State as *mut State);
    }

    let mut next = Vec::with_capacity(nnext);
    for _ in 0..nnext {
        next.push(AtomicPtr::new(std::ptr::null_mut()));
    }
    let state = CachedState(Box::new(State {
        insts: probe.0.insts,
        flags: flag,
        next: next.into_boxed_slice(),
    }));
    let mem = state.0.approximate_size() as isize;
    if *state_budget < mem {
        return None;
    }
    *state_budget -= mem;

    let ptr = &*state.0 as *const State as *mut State;
    states.insert(state);
    Some(ptr)
}

/// Stream-search scaffolding: carries a forward DFA search across input
/// chunks.
///
/// The context is the stream itself, so `^`/`\A` hold only at the very
/// first byte and `$`/`\z` fire when [`StreamContext::finish`] is called.
/// Between chunks the current state is kept as contents (not as a pointer),
/// so a cache flush between calls costs a re-resolve, never correctness.
/// Memory stays bounded by the program's DFA budget no matter how much
/// input the stream carries.
pub struct StreamContext {
    saved: StateSaverContents,
    /// Absolute stream offset of the next byte to be consumed.
    offset: usize,
    /// Absolute offset up to which the stream is known to hold no partial
    /// match work; everything after it is backlog the caller must keep
    /// buffered if it wants to recover match text.
    last_clean_offset: usize,
    /// Whether the most recent match ended and at which absolute offset.
    last_match: Option<usize>,
    /// The search can no longer match, no matter what else arrives.
    dead: bool,
    /// The underlying DFA gave up for memory; the stream is unusable.
    failed: bool,
}

impl Default for StreamContext {
    fn default() -> StreamContext {
        StreamContext::new()
    }
}

enum StateSaverContents {
    Start,
    Full,
    State { insts: Vec<InstPtr>, flags: u32 },
}

impl StreamContext {
    /// A fresh context positioned at the start of the stream.
    pub fn new() -> StreamContext {
        StreamContext {
            saved: StateSaverContents::Start,
            offset: 0,
            last_clean_offset: 0,
            last_match: None,
            dead: false,
            failed: false,
        }
    }

    /// Whether the DFA gave up on this stream for lack of memory.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// How many already-fed bytes are still potentially part of a match.
    pub fn backlog_byte_count(&self) -> usize {
        self.offset - self.last_clean_offset
    }

    /// The absolute end offset of the most recent match, if any.
    pub fn last_match_end(&self) -> Option<usize> {
        self.last_match
    }

    /// Feeds one chunk through the DFA. Returns the number of leading
    /// bytes of this chunk that can no longer affect any future match and
    /// so may be discarded by the caller.
    pub fn search_chunk(&mut self, prog: &Program, chunk: &[u8]) -> usize {
        let dfa = prog.get_dfa(MatchKind::LongestMatch);
        if self.dead || self.failed {
            return chunk.len();
        }
        let mut cache_lock = RwLocker::reading(&dfa.cache_mutex);
        let mut s = match self.resolve(dfa, prog, &mut cache_lock) {
            Some(s) => s,
            None => {
                self.failed = true;
                return 0;
            }
        };
        let start_state = s;

        let mut consumed_clean = 0;
        for (i, &b) in chunk.iter().enumerate() {
            if s == FULL_MATCH_STATE {
                // Every continuation accepts, so the match already extends
                // through the end of this chunk.
                self.last_match = Some(self.offset + chunk.len());
                break;
            }
            let cls = prog.bytemap(b);
            let mut ns = unsafe { &*s }.next[cls].load(Ordering::Acquire);
            if ns.is_null() {
                ns = match self.grow(dfa, prog, &mut cache_lock, s, b as usize)
                {
                    Some(ns) => ns,
                    None => {
                        self.failed = true;
                        return 0;
                    }
                };
            }
            if ns == DEAD_STATE {
                self.dead = true;
                self.offset += chunk.len();
                self.last_clean_offset = self.offset;
                return chunk.len();
            }
            if ns == FULL_MATCH_STATE {
                // Same as above: the rest of the chunk is part of the
                // match, not just the byte that got us here.
                self.last_match = Some(self.offset + chunk.len());
            }
            s = ns;
            if !is_special(s) && unsafe { &*s }.is_match() {
                self.last_match = Some(self.offset + i);
            }
            if s == start_state {
                // Back in the start state: nothing pending.
                consumed_clean = i + 1;
            }
        }

        let chunk_clean = self.offset + consumed_clean;
        self.offset += chunk.len();
        if consumed_clean > 0 {
            self.last_clean_offset = chunk_clean;
        }
        self.save(s);
        consumed_clean
    }

    /// Ends the stream: consumes the end-of-text sentinel so trailing
    /// `$`/`\z`/`\b` assertions fire, and reports the final match end (an
    /// absolute stream offset), if any.
    pub fn finish(&mut self, prog: &Program) -> Option<usize> {
        let dfa = prog.get_dfa(MatchKind::LongestMatch);
        if self.dead || self.failed {
            return self.last_match;
        }
        let mut cache_lock = RwLocker::reading(&dfa.cache_mutex);
        let s = self.resolve(dfa, prog, &mut cache_lock)?;
        if s == FULL_MATCH_STATE {
            self.last_match = Some(self.offset);
            return self.last_match;
        }
        let ns = match dfa.run_state_on_byte_unlocked(prog, s, BYTE_END_TEXT) {
            Some(ns) => ns,
            None => {
                self.failed = true;
                return self.last_match;
            }
        };
        if ns == FULL_MATCH_STATE
            || (!is_special(ns) && unsafe { &*ns }.is_match())
        {
            self.last_match = Some(self.offset);
        }
        self.last_match
    }

    fn resolve(
        &mut self,
        dfa: &Dfa,
        prog: &Program,
        cache_lock: &mut RwLocker<'_>,
    ) -> Option<*mut State> {
        match self.saved {
            StateSaverContents::Full => Some(FULL_MATCH_STATE),
            StateSaverContents::Start => {
                let mut params = SearchParams {
                    context: b"",
                    text: 0..0,
                    anchored: prog.anchor_start,
                    want_earliest_match: false,
                    run_forward: true,
                    start: std::ptr::null_mut(),
                    firstbyte: FB_UNKNOWN,
                    matches: None,
                };
                if !dfa.analyze_search(prog, &mut params, cache_lock) {
                    return None;
                }
                Some(params.start)
            }
            StateSaverContents::State { ref insts, flags } => {
                let mut inner = lock_inner(&dfa.inner);
                let DfaInner { ref mut states, ref mut state_budget, .. } =
                    *inner;
                cached_state(states, state_budget, dfa.nnext, insts, flags)
            }
        }
    }

    fn save(&mut self, s: *mut State) {
        if s == FULL_MATCH_STATE {
            self.saved = StateSaverContents::Full;
            return;
        }
        debug_assert!(!is_special(s));
        let state = unsafe { &*s };
        self.saved = StateSaverContents::State {
            insts: state.insts.to_vec(),
            flags: state.flags,
        };
    }

    fn grow(
        &mut self,
        dfa: &Dfa,
        prog: &Program,
        cache_lock: &mut RwLocker<'_>,
        s: *mut State,
        c: usize,
    ) -> Option<*mut State> {
        if let Some(ns) = dfa.run_state_on_byte_unlocked(prog, s, c) {
            return Some(ns);
        }
        let save = StateSaver::save(s);
        dfa.reset_cache(cache_lock);
        let s = {
            let mut inner = lock_inner(&dfa.inner);
            save.restore(dfa, &mut inner)?
        };
        dfa.run_state_on_byte_unlocked(prog, s, c)
    }
}
