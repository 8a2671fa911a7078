//! Match accumulators, term sets and text-range scope collections used by
//! the query executor.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use memoir_core::{
    MessageOrdinal, ScoredMessageOrdinal, ScoredSemanticRefOrdinal, SemanticRef,
    SemanticRefOrdinal, Term, TextRange,
};

/// One matched value with its accumulated score and hit count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match<T> {
    pub value: T,
    pub score: f32,
    pub hit_count: usize,
}

/// Unordered collection of scored matches. `add` increments the hit count
/// and sums the score for values seen before.
#[derive(Debug, Clone)]
pub struct MatchAccumulator<T: Copy + Eq + Ord + Hash> {
    matches: HashMap<T, Match<T>>,
}

impl<T: Copy + Eq + Ord + Hash> Default for MatchAccumulator<T> {
    fn default() -> Self {
        Self {
            matches: HashMap::new(),
        }
    }
}

impl<T: Copy + Eq + Ord + Hash> MatchAccumulator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn has(&self, value: T) -> bool {
        self.matches.contains_key(&value)
    }

    pub fn get(&self, value: T) -> Option<&Match<T>> {
        self.matches.get(&value)
    }

    pub fn set(&mut self, entry: Match<T>) {
        self.matches.insert(entry.value, entry);
    }

    pub fn add(&mut self, value: T, score: f32) {
        match self.matches.get_mut(&value) {
            Some(existing) => {
                existing.hit_count += 1;
                existing.score += score;
            }
            None => {
                self.matches.insert(
                    value,
                    Match {
                        value,
                        score,
                        hit_count: 1,
                    },
                );
            }
        }
    }

    /// Union in another accumulator: scores sum, hit counts sum.
    pub fn add_union(&mut self, other: Self) {
        for entry in other.matches.into_values() {
            match self.matches.get_mut(&entry.value) {
                Some(existing) => {
                    existing.hit_count += entry.hit_count;
                    existing.score += entry.score;
                }
                None => {
                    self.matches.insert(entry.value, entry);
                }
            }
        }
    }

    /// Values present in both accumulators; scores and hit counts sum.
    pub fn intersect(&self, other: &Self) -> Self {
        let mut result = Self::new();
        for entry in self.matches.values() {
            if let Some(other_entry) = other.matches.get(&entry.value) {
                result.set(Match {
                    value: entry.value,
                    score: entry.score + other_entry.score,
                    hit_count: entry.hit_count + other_entry.hit_count,
                });
            }
        }
        result
    }

    pub fn get_max_hit_count(&self) -> usize {
        self.matches
            .values()
            .map(|m| m.hit_count)
            .max()
            .unwrap_or(0)
    }

    /// Keep only matches with `hit_count >= min_hit_count`.
    pub fn select_with_hit_count(&mut self, min_hit_count: usize) {
        self.matches.retain(|_, m| m.hit_count >= min_hit_count);
    }

    /// Matches sorted descending by score; equal scores order by ascending
    /// value so results are deterministic across backends.
    pub fn get_sorted_by_score(&self, min_hit_count: Option<usize>) -> Vec<Match<T>> {
        let min = min_hit_count.unwrap_or(0);
        let mut sorted: Vec<Match<T>> = self
            .matches
            .values()
            .filter(|m| m.hit_count >= min)
            .copied()
            .collect();
        sorted.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.value.cmp(&b.value))
        });
        sorted
    }

    /// Keep only the top `n` scoring matches.
    pub fn select_top_n(&mut self, n: usize) {
        let keep: HashSet<T> = self
            .get_sorted_by_score(None)
            .into_iter()
            .take(n)
            .map(|m| m.value)
            .collect();
        self.matches.retain(|value, _| keep.contains(value));
    }

    pub fn values(&self) -> impl Iterator<Item = T> + '_ {
        self.matches.keys().copied()
    }

    pub fn matches(&self) -> impl Iterator<Item = &Match<T>> {
        self.matches.values()
    }
}

/// Accumulator over semantic-ref ordinals, remembering which search terms
/// produced matches.
#[derive(Debug, Clone, Default)]
pub struct SemanticRefAccumulator {
    pub matches: MatchAccumulator<SemanticRefOrdinal>,
    pub search_term_matches: BTreeSet<String>,
}

impl SemanticRefAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add term matches: each scored ref contributes `score * weight`,
    /// and the term is recorded as matched. `weight` is the weight of the
    /// term actually looked up (a related term scores with its own
    /// weight, not its owner's).
    pub fn add_term_matches(
        &mut self,
        search_term: &Term,
        scored_refs: &[ScoredSemanticRefOrdinal],
        weight: Option<f32>,
    ) {
        if scored_refs.is_empty() {
            return;
        }
        let weight = weight.unwrap_or(1.0);
        for scored in scored_refs {
            self.matches
                .add(scored.semantic_ref_ordinal, scored.score * weight);
        }
        self.search_term_matches.insert(search_term.text.clone());
    }

    pub fn add_union(&mut self, other: Self) {
        self.matches.add_union(other.matches);
        self.search_term_matches.extend(other.search_term_matches);
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut search_term_matches = self.search_term_matches.clone();
        search_term_matches.extend(other.search_term_matches.iter().cloned());
        Self {
            matches: self.matches.intersect(&other.matches),
            search_term_matches,
        }
    }

    pub fn to_scored_ordinals(&self) -> Vec<ScoredSemanticRefOrdinal> {
        self.matches
            .get_sorted_by_score(None)
            .into_iter()
            .map(|m| ScoredSemanticRefOrdinal::new(m.value, m.score))
            .collect()
    }
}

/// Accumulator over message ordinals.
#[derive(Debug, Clone, Default)]
pub struct MessageAccumulator {
    pub matches: MatchAccumulator<MessageOrdinal>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spread each semref's score over the message ordinals its range
    /// covers.
    pub fn add_semantic_refs(
        &mut self,
        semantic_refs: &[SemanticRef],
        scores: &HashMap<SemanticRefOrdinal, f32>,
    ) {
        for semantic_ref in semantic_refs {
            let score = scores
                .get(&semantic_ref.semantic_ref_ordinal)
                .copied()
                .unwrap_or(1.0);
            for message_ordinal in semantic_ref.range.message_ordinals() {
                self.matches.add(message_ordinal, score);
            }
        }
    }

    pub fn add_union(&mut self, other: Self) {
        self.matches.add_union(other.matches);
    }

    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            matches: self.matches.intersect(&other.matches),
        }
    }

    pub fn to_scored_ordinals(&self) -> Vec<ScoredMessageOrdinal> {
        self.matches
            .get_sorted_by_score(None)
            .into_iter()
            .map(|m| ScoredMessageOrdinal {
                message_ordinal: m.value,
                score: m.score,
            })
            .collect()
    }
}

/// A set of terms keyed by text. `add_or_union` keeps the maximum weight
/// seen for a text.
#[derive(Debug, Clone, Default)]
pub struct TermSet {
    terms: HashMap<String, Term>,
}

impl TermSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn has(&self, term: &Term) -> bool {
        self.terms.contains_key(&term.text)
    }

    /// Add if absent; returns false when the text was already present.
    pub fn add(&mut self, term: Term) -> bool {
        if self.terms.contains_key(&term.text) {
            return false;
        }
        self.terms.insert(term.text.clone(), term);
        true
    }

    /// Add, keeping the maximum weight for a text seen more than once.
    pub fn add_or_union(&mut self, term: &Term) {
        match self.terms.get_mut(&term.text) {
            Some(existing) => {
                let new_weight = term.weight.unwrap_or(0.0);
                if new_weight > existing.weight.unwrap_or(0.0) {
                    existing.weight = Some(new_weight);
                }
            }
            None => {
                self.terms.insert(term.text.clone(), term.clone());
            }
        }
    }

    pub fn get(&self, term: &Term) -> Option<&Term> {
        self.terms.get(&term.text)
    }

    pub fn remove(&mut self, term: &Term) {
        self.terms.remove(&term.text);
    }

    pub fn clear(&mut self) {
        self.terms.clear();
    }
}

/// Matched (property name, value text) pairs, used to keep a property
/// term from contributing twice within one boolean group.
#[derive(Debug, Clone, Default)]
pub struct PropertyTermSet {
    pairs: HashSet<(String, String)>,
}

impl PropertyTermSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, name: &str, value: &str) -> bool {
        self.pairs
            .contains(&(name.to_string(), value.to_string()))
    }

    pub fn add(&mut self, name: &str, value: &str) {
        self.pairs.insert((name.to_string(), value.to_string()));
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

/// Sorted, deduplicated collection of text ranges.
#[derive(Debug, Clone, Default)]
pub struct TextRangeCollection {
    ranges: Vec<TextRange>,
}

impl TextRangeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = TextRange>) -> Self {
        let mut collection = Self::new();
        for range in ranges {
            collection.add_range(range);
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Insert keeping sort order; returns false for duplicates.
    pub fn add_range(&mut self, range: TextRange) -> bool {
        match self.ranges.binary_search(&range) {
            Ok(_) => false,
            Err(at) => {
                self.ranges.insert(at, range);
                true
            }
        }
    }

    /// True when some range in the collection contains `inner`.
    pub fn is_in_range(&self, inner: &TextRange) -> bool {
        if self.ranges.is_empty() {
            return false;
        }
        let from = self.ranges.partition_point(|outer| outer < inner);
        // Scan forward over ranges starting at or after the probe point;
        // candidates further right start past the inner range.
        for outer in &self.ranges[from..] {
            if outer.start > inner.start {
                break;
            }
            if outer.contains(inner) {
                return true;
            }
        }
        // A range starting earlier may still span the inner range.
        for outer in self.ranges[..from].iter().rev() {
            if outer.contains(inner) {
                return true;
            }
            if outer.start.message_ordinal < inner.start.message_ordinal {
                break;
            }
        }
        false
    }
}

/// Scope selected by one or more range selectors. A range is in scope only
/// when every selector's collection accepts it.
#[derive(Debug, Clone, Default)]
pub struct TextRangesInScope {
    collections: Vec<TextRangeCollection>,
}

impl TextRangesInScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_text_ranges(&mut self, ranges: TextRangeCollection) {
        self.collections.push(ranges);
    }

    pub fn is_range_in_scope(&self, inner: &TextRange) -> bool {
        self.collections
            .iter()
            .all(|collection| collection.is_in_range(inner))
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::TextLocation;

    #[test]
    fn add_increments_hits_and_sums_scores() {
        let mut acc: MatchAccumulator<usize> = MatchAccumulator::new();
        acc.add(3, 1.0);
        acc.add(3, 2.0);
        acc.add(5, 4.0);
        let entry = acc.get(3).unwrap();
        assert_eq!(entry.hit_count, 2);
        assert!((entry.score - 3.0).abs() < 1e-6);
        assert_eq!(acc.get(5).unwrap().hit_count, 1);
    }

    #[test]
    fn sorted_by_score_breaks_ties_by_value() {
        let mut acc: MatchAccumulator<usize> = MatchAccumulator::new();
        acc.add(9, 1.0);
        acc.add(2, 1.0);
        acc.add(4, 5.0);
        let sorted = acc.get_sorted_by_score(None);
        let values: Vec<usize> = sorted.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![4, 2, 9]);
    }

    #[test]
    fn union_sums_and_intersect_requires_both() {
        let mut a: MatchAccumulator<usize> = MatchAccumulator::new();
        a.add(1, 1.0);
        a.add(2, 1.0);
        let mut b: MatchAccumulator<usize> = MatchAccumulator::new();
        b.add(2, 2.0);
        b.add(3, 1.0);

        let intersection = a.intersect(&b);
        assert_eq!(intersection.len(), 1);
        let entry = intersection.get(2).unwrap();
        assert!((entry.score - 3.0).abs() < 1e-6);
        assert_eq!(entry.hit_count, 2);

        a.add_union(b);
        assert_eq!(a.len(), 3);
        assert!((a.get(2).unwrap().score - 3.0).abs() < 1e-6);
    }

    #[test]
    fn top_n_keeps_first_of_stable_descending_sort() {
        let mut acc: MatchAccumulator<usize> = MatchAccumulator::new();
        for (value, score) in [(1, 5.0), (2, 3.0), (3, 8.0), (4, 3.0)] {
            acc.add(value, score);
        }
        acc.select_top_n(3);
        let values: Vec<usize> = acc.get_sorted_by_score(None).iter().map(|m| m.value).collect();
        assert_eq!(values, vec![3, 1, 2]);
    }

    #[test]
    fn term_set_keeps_max_weight() {
        let mut set = TermSet::new();
        set.add_or_union(&Term::with_weight("x", 0.5));
        set.add_or_union(&Term::with_weight("x", 0.9));
        set.add_or_union(&Term::with_weight("x", 0.2));
        assert_eq!(set.get(&Term::new("x")).unwrap().weight, Some(0.9));
    }

    fn point(m: usize, c: usize) -> TextRange {
        TextRange::point(TextLocation::new(m, c))
    }

    #[test]
    fn range_collection_finds_containing_range() {
        let mut collection = TextRangeCollection::new();
        collection.add_range(point(1, 0));
        collection.add_range(point(3, 0));
        assert!(collection.is_in_range(&point(1, 0)));
        assert!(!collection.is_in_range(&point(2, 0)));

        let span = TextRange {
            start: TextLocation::new(5, 0),
            end: Some(TextLocation::new(7, 0)),
        };
        collection.add_range(span);
        assert!(collection.is_in_range(&point(6, 0)));
        assert!(!collection.is_in_range(&point(8, 0)));
    }

    #[test]
    fn scope_requires_every_selector_to_accept() {
        let mut scope = TextRangesInScope::new();
        scope.add_text_ranges(TextRangeCollection::from_ranges([point(1, 0), point(2, 0)]));
        scope.add_text_ranges(TextRangeCollection::from_ranges([point(2, 0), point(3, 0)]));
        assert!(scope.is_range_in_scope(&point(2, 0)));
        assert!(!scope.is_range_in_scope(&point(1, 0)));
        assert!(!scope.is_range_in_scope(&point(3, 0)));
    }
}
