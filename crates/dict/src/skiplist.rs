//! Probabilistic ordered index keyed by `(score, member)`.
//!
//! Nodes carry up to [`MAX_LEVEL`] forward pointers plus a backward pointer.
//! Each forward pointer stores a `span` — how many level-0 nodes it jumps
//! over — so rank queries resolve in O(log N) without walking the base
//! chain. Ordering is ascending score, ties broken by ascending member.
//!
//! Nodes live in an index-addressed arena with a free list, which keeps the
//! structure entirely in safe code: links are `u32` slots, [`NIL`] marks the
//! absence of a neighbour, and slot 0 is the head sentinel.
//!
//! Scores are `f64` but never NaN; callers validate scores at the command
//! boundary before they reach the index.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::{smallvec, SmallVec};

/// Maximum tower height.
pub const MAX_LEVEL: usize = 32;

/// Probability of promoting a node one more level.
const P: f64 = 0.25;

/// Absent-neighbour marker.
const NIL: u32 = u32::MAX;

/// Arena slot of the head sentinel.
const HEAD: u32 = 0;

#[derive(Debug, Clone, Copy)]
struct Level {
    forward: u32,
    /// Level-0 nodes this pointer jumps over (including the target).
    span: u32,
}

const EMPTY_LEVEL: Level = Level {
    forward: NIL,
    span: 0,
};

#[derive(Debug)]
struct SkipNode<T> {
    score: f64,
    /// `None` only for the head sentinel.
    member: Option<T>,
    backward: u32,
    levels: SmallVec<[Level; 4]>,
}

/// Ordered multimap over `(score, member)` with O(log N) rank arithmetic.
#[derive(Debug)]
pub struct SkipList<T> {
    nodes: Vec<SkipNode<T>>,
    free: Vec<u32>,
    len: usize,
    /// Highest tower currently in use (≥ 1).
    level: usize,
    tail: u32,
    rng: StdRng,
}

impl<T: Ord + Clone> SkipList<T> {
    /// Create an empty index.
    pub fn new() -> Self {
        let head = SkipNode {
            score: f64::NEG_INFINITY,
            member: None,
            backward: NIL,
            levels: smallvec![EMPTY_LEVEL; MAX_LEVEL],
        };
        SkipList {
            nodes: vec![head],
            free: Vec::new(),
            len: 0,
            level: 1,
            tail: NIL,
            rng: StdRng::from_entropy(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn member_of(&self, idx: u32) -> &T {
        self.nodes[idx as usize]
            .member
            .as_ref()
            .expect("forward pointer led to the head sentinel")
    }

    /// True when the node at `idx` sorts strictly before `(score, member)`.
    fn precedes(&self, idx: u32, score: f64, member: &T) -> bool {
        let node = &self.nodes[idx as usize];
        node.score < score || (node.score == score && self.member_of(idx) < member)
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen::<f64>() < P {
            level += 1;
        }
        level
    }

    fn alloc(&mut self, score: f64, member: T, height: usize) -> u32 {
        let node = SkipNode {
            score,
            member: Some(member),
            backward: NIL,
            levels: smallvec![EMPTY_LEVEL; height],
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    /// Insert `(score, member)`.
    ///
    /// The pair must not already be present; the sorted-set layer enforces
    /// at most one entry per member.
    pub fn insert(&mut self, score: f64, member: T) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0u32; MAX_LEVEL];

        let mut x = HEAD;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            loop {
                let fwd = self.nodes[x as usize].levels[i].forward;
                if fwd == NIL || !self.precedes(fwd, score, &member) {
                    break;
                }
                rank[i] += self.nodes[x as usize].levels[i].span;
                x = fwd;
            }
            update[i] = x;
        }

        let height = self.random_level();
        if height > self.level {
            for i in self.level..height {
                rank[i] = 0;
                update[i] = HEAD;
                self.nodes[HEAD as usize].levels[i].span = self.len as u32;
            }
            self.level = height;
        }

        let idx = self.alloc(score, member, height);
        for i in 0..height {
            let at = update[i] as usize;
            let jumped = rank[0] - rank[i];
            let at_level = self.nodes[at].levels[i];

            self.nodes[idx as usize].levels[i] = Level {
                forward: at_level.forward,
                span: at_level.span - jumped,
            };
            self.nodes[at].levels[i] = Level {
                forward: idx,
                span: jumped + 1,
            };
        }
        // Towers above the new node gained one level-0 node under them.
        for i in height..self.level {
            self.nodes[update[i] as usize].levels[i].span += 1;
        }

        let backward = if update[0] == HEAD { NIL } else { update[0] };
        self.nodes[idx as usize].backward = backward;
        let next = self.nodes[idx as usize].levels[0].forward;
        if next != NIL {
            self.nodes[next as usize].backward = idx;
        } else {
            self.tail = idx;
        }
        self.len += 1;
    }

    /// Remove `(score, member)`; returns whether it was present.
    pub fn delete(&mut self, score: f64, member: &T) -> bool {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.nodes[x as usize].levels[i].forward;
                if fwd == NIL || !self.precedes(fwd, score, member) {
                    break;
                }
                x = fwd;
            }
            update[i] = x;
        }

        let target = self.nodes[x as usize].levels[0].forward;
        if target == NIL {
            return false;
        }
        let node = &self.nodes[target as usize];
        if node.score != score || self.member_of(target) != member {
            return false;
        }

        for i in 0..self.level {
            let at = update[i] as usize;
            if self.nodes[at].levels[i].forward == target {
                let removed = self.nodes[target as usize].levels[i];
                let at_level = &mut self.nodes[at].levels[i];
                at_level.span += removed.span - 1;
                at_level.forward = removed.forward;
            } else {
                self.nodes[at].levels[i].span -= 1;
            }
        }

        let next = self.nodes[target as usize].levels[0].forward;
        let back = self.nodes[target as usize].backward;
        if next != NIL {
            self.nodes[next as usize].backward = back;
        } else {
            self.tail = back;
        }
        while self.level > 1 && self.nodes[HEAD as usize].levels[self.level - 1].forward == NIL {
            self.level -= 1;
        }
        self.len -= 1;

        self.nodes[target as usize].member = None;
        self.free.push(target);
        true
    }

    /// 1-based rank of `(score, member)`, or 0 when absent.
    pub fn rank_of(&self, score: f64, member: &T) -> usize {
        let mut rank = 0usize;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.nodes[x as usize].levels[i].forward;
                if fwd == NIL {
                    break;
                }
                let node = &self.nodes[fwd as usize];
                let ahead = node.score < score
                    || (node.score == score && self.member_of(fwd) <= member);
                if !ahead {
                    break;
                }
                rank += self.nodes[x as usize].levels[i].span as usize;
                x = fwd;
            }
            if x != HEAD
                && self.nodes[x as usize].score == score
                && self.member_of(x) == member
            {
                return rank;
            }
        }
        0
    }

    /// Entry at 1-based `rank`.
    pub fn get_by_rank(&self, rank: usize) -> Option<(f64, &T)> {
        if rank == 0 || rank > self.len {
            return None;
        }
        let mut traversed = 0usize;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.nodes[x as usize].levels[i].forward;
                if fwd == NIL {
                    break;
                }
                let span = self.nodes[x as usize].levels[i].span as usize;
                if traversed + span > rank {
                    break;
                }
                traversed += span;
                x = fwd;
                if traversed == rank {
                    return Some((self.nodes[x as usize].score, self.member_of(x)));
                }
            }
        }
        None
    }

    /// Entries at 1-based ranks `lo..=hi` (clamped to the list).
    pub fn range_by_rank(&self, lo: usize, hi: usize) -> Vec<(f64, T)> {
        let lo = lo.max(1);
        let hi = hi.min(self.len);
        if lo > hi {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(hi - lo + 1);
        let mut x = match self.node_at_rank(lo) {
            Some(idx) => idx,
            None => return out,
        };
        for _ in lo..=hi {
            out.push((self.nodes[x as usize].score, self.member_of(x).clone()));
            x = self.nodes[x as usize].levels[0].forward;
            if x == NIL {
                break;
            }
        }
        out
    }

    fn node_at_rank(&self, rank: usize) -> Option<u32> {
        let mut traversed = 0usize;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.nodes[x as usize].levels[i].forward;
                if fwd == NIL {
                    break;
                }
                let span = self.nodes[x as usize].levels[i].span as usize;
                if traversed + span > rank {
                    break;
                }
                traversed += span;
                x = fwd;
                if traversed == rank {
                    return Some(x);
                }
            }
        }
        None
    }

    /// Entries with score in `[min, max]`, both ends inclusive.
    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<(f64, T)> {
        let mut out = Vec::new();
        // Descend to the last node with score < min.
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.nodes[x as usize].levels[i].forward;
                if fwd == NIL || self.nodes[fwd as usize].score >= min {
                    break;
                }
                x = fwd;
            }
        }
        let mut cursor = self.nodes[x as usize].levels[0].forward;
        while cursor != NIL {
            let node = &self.nodes[cursor as usize];
            if node.score > max {
                break;
            }
            out.push((node.score, self.member_of(cursor).clone()));
            cursor = node.levels[0].forward;
        }
        out
    }

    /// In-order iteration over every `(score, member)`.
    pub fn iter(&self) -> SkipIter<'_, T> {
        SkipIter {
            list: self,
            cursor: self.nodes[HEAD as usize].levels[0].forward,
        }
    }
}

impl<T: Ord + Clone> Default for SkipList<T> {
    fn default() -> Self {
        SkipList::new()
    }
}

/// In-order borrowing iterator.
pub struct SkipIter<'a, T> {
    list: &'a SkipList<T>,
    cursor: u32,
}

impl<'a, T: Ord + Clone> Iterator for SkipIter<'a, T> {
    type Item = (f64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.list.nodes[self.cursor as usize];
        let item = (node.score, self.list.member_of(self.cursor));
        self.cursor = node.levels[0].forward;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn listed(entries: &[(f64, &str)]) -> SkipList<String> {
        let mut list = SkipList::new();
        for (score, member) in entries {
            list.insert(*score, member.to_string());
        }
        list
    }

    #[test]
    fn test_insert_orders_by_score_then_member() {
        let list = listed(&[(3.0, "d"), (1.0, "a"), (2.0, "c"), (2.0, "b")]);
        let collected: Vec<(f64, &String)> = list.iter().collect();
        let members: Vec<&str> = collected.iter().map(|(_, m)| m.as_str()).collect();
        assert_eq!(members, ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_rank_law() {
        let entries = [(1.0, "a"), (2.0, "b"), (2.0, "c"), (3.0, "d"), (9.5, "e")];
        let list = listed(&entries);
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(b.1)));
        for (score, member) in &sorted {
            let rank = list.rank_of(*score, &member.to_string());
            assert!(rank > 0);
            let (got_score, got_member) = list.get_by_rank(rank).unwrap();
            assert_eq!(got_score, *score);
            assert_eq!(got_member, &member.to_string());
        }
    }

    #[test]
    fn test_rank_of_absent_is_zero() {
        let list = listed(&[(1.0, "a")]);
        assert_eq!(list.rank_of(1.0, &"b".to_string()), 0);
        assert_eq!(list.rank_of(2.0, &"a".to_string()), 0);
    }

    #[test]
    fn test_get_by_rank_bounds() {
        let list = listed(&[(1.0, "a"), (2.0, "b")]);
        assert!(list.get_by_rank(0).is_none());
        assert!(list.get_by_rank(3).is_none());
        assert_eq!(list.get_by_rank(1).unwrap().1, "a");
        assert_eq!(list.get_by_rank(2).unwrap().1, "b");
    }

    #[test]
    fn test_range_by_score_inclusive_both_ends() {
        let list = listed(&[(1.0, "a"), (2.0, "b"), (2.0, "c"), (3.0, "d")]);
        let range = list.range_by_score(2.0, 2.0);
        let members: Vec<&str> = range.iter().map(|(_, m)| m.as_str()).collect();
        assert_eq!(members, ["b", "c"]);

        let all = list.range_by_score(f64::NEG_INFINITY, f64::INFINITY);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_range_by_rank_clamps() {
        let list = listed(&[(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        let range = list.range_by_rank(2, 9);
        let members: Vec<&str> = range.iter().map(|(_, m)| m.as_str()).collect();
        assert_eq!(members, ["b", "c"]);
        assert!(list.range_by_rank(4, 9).is_empty());
    }

    #[test]
    fn test_delete_and_reuse() {
        let mut list = listed(&[(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        assert!(list.delete(2.0, &"b".to_string()));
        assert!(!list.delete(2.0, &"b".to_string()));
        assert_eq!(list.len(), 2);

        // Arena slot is recycled for the next insert.
        list.insert(5.0, "e".to_string());
        assert_eq!(list.len(), 3);
        assert_eq!(list.rank_of(5.0, &"e".to_string()), 3);
        assert_eq!(list.get_by_rank(1).unwrap().1, "a");
        assert_eq!(list.get_by_rank(2).unwrap().1, "c");
    }

    #[test]
    fn test_delete_requires_matching_score() {
        let mut list = listed(&[(1.0, "a")]);
        assert!(!list.delete(2.0, &"a".to_string()));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_backward_links_via_tail_deletion() {
        let mut list = listed(&[(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        assert!(list.delete(3.0, &"c".to_string()));
        list.insert(4.0, "d".to_string());
        let members: Vec<String> = list.iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(members, ["a", "b", "d"]);
    }

    proptest! {
        // Invariant 4: get_by_rank(rank_of(s, m)) round-trips for every
        // inserted member.
        #[test]
        fn prop_rank_round_trip(entries in proptest::collection::btree_set(
            (0i32..100, 0u32..1000), 1..80))
        {
            let mut list = SkipList::new();
            let mut by_member: std::collections::HashMap<u32, i32> =
                std::collections::HashMap::new();
            for (score, member) in &entries {
                // One entry per member, like the sorted-set layer enforces.
                if !by_member.contains_key(member) {
                    by_member.insert(*member, *score);
                    list.insert(*score as f64, *member);
                }
            }
            prop_assert_eq!(list.len(), by_member.len());
            for (member, score) in &by_member {
                let rank = list.rank_of(*score as f64, member);
                prop_assert!(rank >= 1);
                let (got_score, got_member) = list.get_by_rank(rank).unwrap();
                prop_assert_eq!(got_score, *score as f64);
                prop_assert_eq!(got_member, member);
            }
        }

        // Invariant 5: range_by_score returns exactly the members in
        // [min, max], ordered by (score, member).
        #[test]
        fn prop_range_by_score_exact(entries in proptest::collection::btree_set(
            (0i32..50, 0u32..500), 0..60),
            min in 0i32..50, span in 0i32..50)
        {
            let max = min + span;
            let mut list = SkipList::new();
            let mut seen = std::collections::HashSet::new();
            let mut reference = BTreeSet::new();
            for (score, member) in &entries {
                if seen.insert(*member) {
                    list.insert(*score as f64, *member);
                    reference.insert((*score, *member));
                }
            }
            let got: Vec<(i32, u32)> = list
                .range_by_score(min as f64, max as f64)
                .into_iter()
                .map(|(s, m)| (s as i32, m))
                .collect();
            let expected: Vec<(i32, u32)> = reference
                .iter()
                .filter(|(s, _)| *s >= min && *s <= max)
                .copied()
                .collect();
            prop_assert_eq!(got, expected);
        }

        // Spans stay consistent through interleaved inserts and deletes.
        #[test]
        fn prop_ranks_sequential_after_churn(ops in proptest::collection::vec(
            (any::<bool>(), 0i32..30, 0u32..60), 0..120))
        {
            let mut list = SkipList::new();
            let mut reference: std::collections::HashMap<u32, i32> =
                std::collections::HashMap::new();
            for (insert, score, member) in ops {
                if insert {
                    if !reference.contains_key(&member) {
                        reference.insert(member, score);
                        list.insert(score as f64, member);
                    }
                } else if let Some(score) = reference.remove(&member) {
                    prop_assert!(list.delete(score as f64, &member));
                }
            }
            prop_assert_eq!(list.len(), reference.len());
            // Every rank from 1..=len resolves, in strictly ascending order.
            let mut previous: Option<(f64, u32)> = None;
            for rank in 1..=list.len() {
                let (score, member) = list.get_by_rank(rank).unwrap();
                if let Some((prev_score, prev_member)) = previous {
                    prop_assert!(
                        prev_score < score || (prev_score == score && prev_member < *member)
                    );
                }
                previous = Some((score, *member));
            }
        }
    }
}
