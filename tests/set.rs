// Multi-pattern sets: one combined program, one scan, every matching
// pattern reported.

use reprog::{Anchor, Options, Set};

fn set(patterns: &[&str], anchor: Anchor) -> Set {
    let mut set = Set::new(Options::default(), anchor);
    for pattern in patterns {
        set.add(pattern).unwrap();
    }
    set.compile().unwrap();
    set
}

#[test]
fn unanchored_reports_matching_ids() {
    let set = set(&["foo", "bar"], Anchor::Unanchored);
    let mut ids = Vec::new();
    assert!(set.matches(b"xbary", &mut ids));
    assert_eq!(ids, vec![1]);

    assert!(set.matches(b"foobar", &mut ids));
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);

    assert!(!set.matches(b"quux", &mut ids));
    assert!(ids.is_empty());
}

#[test]
fn overlapping_patterns_all_fire() {
    let set = set(
        &[r"[a-z]+@[a-z]+\.com", r"[a-z]+\.com"],
        Anchor::Unanchored,
    );
    let mut ids = Vec::new();
    assert!(set.matches(b"foo@example.com", &mut ids));
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);

    assert!(set.matches(b"example.com", &mut ids));
    assert_eq!(ids, vec![1]);
}

#[test]
fn anchored_set() {
    let set = set(&["fo", "foo", "oo"], Anchor::Anchored);
    let mut ids = Vec::new();
    assert!(set.matches(b"foo!", &mut ids));
    ids.sort_unstable();
    // Both prefixes fire; "oo" does not start at the beginning.
    assert_eq!(ids, vec![0, 1]);
}

#[test]
fn full_match_set() {
    let set = set(&["fo", "foo"], Anchor::FullMatch);
    let mut ids = Vec::new();
    assert!(set.matches(b"foo", &mut ids));
    assert_eq!(ids, vec![1]);
    assert!(!set.matches(b"fooo", &mut ids));
}

#[test]
fn single_pattern_set() {
    let set = set(&["abc"], Anchor::Unanchored);
    assert_eq!(set.len(), 1);
    let mut ids = Vec::new();
    assert!(set.matches(b"zzabczz", &mut ids));
    assert_eq!(ids, vec![0]);
}

#[test]
fn set_lifecycle_errors() {
    let mut empty = Set::new(Options::default(), Anchor::Unanchored);
    assert!(empty.compile().is_err());

    let mut set = Set::new(Options::default(), Anchor::Unanchored);
    set.add("a").unwrap();
    set.compile().unwrap();
    assert!(set.add("b").is_err());
    assert!(set.compile().is_err());

    let mut set = Set::new(Options::default(), Anchor::Unanchored);
    assert!(set.add("a(").is_err());
}