//! Keyed set comparison
//!
//! Every layer of reconciliation (upstreams of one service, services of a
//! data plane, routes, link addresses, balancer configs) is diffed with the
//! same routine so that only what changed gets touched.
//!
//! Duplicate keys inside one input are resolved last-write-wins: the last
//! occurrence in the slice is the one indexed and reported, earlier ones
//! are ignored entirely.

use std::collections::HashMap;
use std::hash::Hash;

/// Result of comparing two keyed sets
#[derive(Debug)]
pub struct SetDiff<'a, T> {
    /// Only in the new set, in new-set order
    pub added: Vec<&'a T>,
    /// Only in the old set, in old-set order
    pub deleted: Vec<&'a T>,
    /// In both with `equal` false, as `(old, new)`
    pub changed: Vec<(&'a T, &'a T)>,
    /// In both with `equal` true, old side
    pub unchanged: Vec<&'a T>,
}

impl<'a, T> SetDiff<'a, T> {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.deleted.is_empty() || !self.changed.is_empty()
    }
}

fn index<'a, T, K, F>(items: &'a [T], key_of: &F) -> HashMap<K, &'a T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut map = HashMap::with_capacity(items.len());
    for item in items {
        map.insert(key_of(item), item);
    }
    map
}

/// Diff `old` against `new` by `key_of`, using `equal` for items present in both.
pub fn compare<'a, T, K, F, E>(old: &'a [T], new: &'a [T], key_of: F, equal: E) -> SetDiff<'a, T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
    E: Fn(&T, &T) -> bool,
{
    let old_index = index(old, &key_of);
    let new_index = index(new, &key_of);

    let mut diff = SetDiff {
        added: Vec::new(),
        deleted: Vec::new(),
        changed: Vec::new(),
        unchanged: Vec::new(),
    };

    for item in old {
        let key = key_of(item);
        // Skip shadowed duplicates
        if !old_index.get(&key).is_some_and(|winner| std::ptr::eq(*winner, item)) {
            continue;
        }
        match new_index.get(&key) {
            None => diff.deleted.push(item),
            Some(counterpart) if equal(item, counterpart) => diff.unchanged.push(item),
            Some(counterpart) => diff.changed.push((item, *counterpart)),
        }
    }

    for item in new {
        let key = key_of(item);
        if !new_index.get(&key).is_some_and(|winner| std::ptr::eq(*winner, item)) {
            continue;
        }
        if !old_index.contains_key(&key) {
            diff.added.push(item);
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item {
        key: u32,
        value: &'static str,
    }

    fn item(key: u32, value: &'static str) -> Item {
        Item { key, value }
    }

    fn diff<'a>(old: &'a [Item], new: &'a [Item]) -> SetDiff<'a, Item> {
        compare(old, new, |i| i.key, |a, b| a.value == b.value)
    }

    #[test]
    fn test_disjoint_sets() {
        let old = vec![item(1, "a"), item(2, "b")];
        let new = vec![item(3, "c"), item(4, "d")];
        let d = diff(&old, &new);

        assert_eq!(d.added, vec![&new[0], &new[1]]);
        assert_eq!(d.deleted, vec![&old[0], &old[1]]);
        assert!(d.changed.is_empty());
        assert!(d.unchanged.is_empty());
        assert!(d.has_changes());
    }

    #[test]
    fn test_changed_and_unchanged() {
        let old = vec![item(1, "a"), item(2, "b"), item(3, "c")];
        let new = vec![item(3, "c"), item(2, "B"), item(5, "e")];
        let d = diff(&old, &new);

        assert_eq!(d.added, vec![&new[2]]);
        assert_eq!(d.deleted, vec![&old[0]]);
        assert_eq!(d.changed, vec![(&old[1], &new[1])]);
        assert_eq!(d.unchanged, vec![&old[2]]);
    }

    #[test]
    fn test_identical_sets_have_no_changes() {
        let old = vec![item(1, "a"), item(2, "b")];
        let new = vec![item(2, "b"), item(1, "a")];
        let d = diff(&old, &new);
        assert!(!d.has_changes());
        assert_eq!(d.unchanged.len(), 2);

        let empty: Vec<Item> = Vec::new();
        assert!(!diff(&empty, &empty).has_changes());
    }

    #[test]
    fn test_duplicate_keys_last_write_wins() {
        let old = vec![item(1, "first"), item(1, "last")];
        let new = vec![item(1, "last"), item(2, "x"), item(2, "y")];
        let d = diff(&old, &new);

        assert_eq!(d.unchanged, vec![&old[1]]);
        assert!(d.changed.is_empty());
        assert_eq!(d.added, vec![&new[2]]);
        assert!(d.deleted.is_empty());
    }
}
