//! Radix tree over key sequences, and a character-keyed specialisation with
//! case-insensitive and prefix lookup.
//!
//! A tree node is in one of two shapes:
//! - a *shortened branch*: the whole remaining key run stored inline with the
//!   values of the key that ends after that run, and no children;
//! - a *split*: the values of keys ending exactly here plus a map from the
//!   next key element to a child node.
//!
//! Every node tracks how many (key, value) entries live in its subtree, so
//! empty subtrees can be dropped and single-child chains folded back into
//! shortened branches on removal.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Keys shorter than this are always looked up exactly.
pub const DEFAULT_MIN_KEY_LENGTH: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + Hash, V: Serialize + Eq + Hash",
    deserialize = "K: Deserialize<'de> + Eq + Hash, V: Deserialize<'de> + Eq + Hash"
))]
struct TrieNode<K, V> {
    /// Remaining key run when this node is a shortened branch.
    branch: Option<Vec<K>>,
    /// Terminal values: for a branch, the values at the end of the run.
    values: HashSet<V>,
    children: Option<HashMap<K, TrieNode<K, V>>>,
    count: usize,
}

impl<K, V> TrieNode<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    fn empty() -> Self {
        TrieNode {
            branch: None,
            values: HashSet::new(),
            children: None,
            count: 0,
        }
    }

    fn put(&mut self, key: &[K], value: V) -> bool {
        if let Some(run) = &self.branch {
            if run.as_slice() == key {
                let inserted = self.values.insert(value);
                if inserted {
                    self.count += 1;
                }
                return inserted;
            }
            self.split_branch();
        } else if self.children.is_none() && self.values.is_empty() && !key.is_empty() {
            self.branch = Some(key.to_vec());
            self.values.insert(value);
            self.count += 1;
            return true;
        }

        let inserted = match key.split_first() {
            None => self.values.insert(value),
            Some((first, tail)) => self
                .children
                .get_or_insert_with(HashMap::new)
                .entry(first.clone())
                .or_insert_with(TrieNode::empty)
                .put(tail, value),
        };
        if inserted {
            self.count += 1;
        }
        inserted
    }

    /// Turn a shortened branch into a one-element split whose child holds the
    /// rest of the run. Values and entry count move down unchanged.
    fn split_branch(&mut self) {
        let Some(run) = self.branch.take() else {
            return;
        };
        let Some((first, tail)) = run.split_first() else {
            return;
        };

        let mut child = TrieNode::empty();
        child.values = std::mem::take(&mut self.values);
        child.count = self.count;
        if !tail.is_empty() {
            child.branch = Some(tail.to_vec());
        }

        let mut children = HashMap::new();
        children.insert(first.clone(), child);
        self.children = Some(children);
    }

    fn remove(&mut self, key: &[K], value: &V) -> bool {
        let removed = if let Some(run) = &self.branch {
            run.as_slice() == key && self.values.remove(value)
        } else {
            match key.split_first() {
                None => self.values.remove(value),
                Some((first, tail)) => {
                    let Some(children) = self.children.as_mut() else {
                        return false;
                    };
                    let Some(child) = children.get_mut(first) else {
                        return false;
                    };
                    let removed = child.remove(tail, value);
                    if child.count == 0 {
                        children.remove(first);
                    }
                    if children.is_empty() {
                        self.children = None;
                    }
                    removed
                }
            }
        };

        if removed {
            self.count -= 1;
            self.compact();
        }
        removed
    }

    /// Restore minimality after a removal below this node.
    fn compact(&mut self) {
        if self.count == 0 {
            self.branch = None;
            self.children = None;
            self.values.clear();
            return;
        }
        if self.branch.is_some() || !self.values.is_empty() {
            return;
        }

        let mut children = match self.children.take() {
            Some(children) if children.len() == 1 => children,
            other => {
                self.children = other;
                return;
            }
        };
        let Some((first, child)) = children.drain().next() else {
            return;
        };

        if child.children.as_ref().is_some_and(|c| !c.is_empty()) {
            let mut restored = HashMap::new();
            restored.insert(first, child);
            self.children = Some(restored);
            return;
        }

        let mut run = vec![first];
        if let Some(tail) = child.branch {
            run.extend(tail);
        }
        self.branch = Some(run);
        self.values = child.values;
    }

    fn collect<E, A>(&self, key: &[K], exact: bool, eq: &E, alternate: &A, out: &mut HashSet<V>)
    where
        E: Fn(&K, &K) -> bool,
        A: Fn(&K) -> Option<K>,
    {
        if let Some(run) = &self.branch {
            let length_ok = if exact {
                key.len() == run.len()
            } else {
                key.len() <= run.len()
            };
            if length_ok && key.iter().zip(run.iter()).all(|(a, b)| eq(a, b)) {
                out.extend(self.values.iter().cloned());
            }
            return;
        }

        let Some((first, tail)) = key.split_first() else {
            if exact {
                out.extend(self.values.iter().cloned());
            } else {
                self.collect_all(out);
            }
            return;
        };

        let Some(children) = &self.children else {
            return;
        };
        if let Some(child) = children.get(first) {
            child.collect(tail, exact, eq, alternate, out);
        }
        if let Some(alt) = alternate(first) {
            if &alt != first {
                if let Some(child) = children.get(&alt) {
                    child.collect(tail, exact, eq, alternate, out);
                }
            }
        }
    }

    fn collect_all(&self, out: &mut HashSet<V>) {
        out.extend(self.values.iter().cloned());
        if let Some(children) = &self.children {
            for child in children.values() {
                child.collect_all(out);
            }
        }
    }
}

/// Generic radix tree mapping key sequences to sets of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + Hash, V: Serialize + Eq + Hash",
    deserialize = "K: Deserialize<'de> + Eq + Hash, V: Deserialize<'de> + Eq + Hash"
))]
pub struct Trie<K, V> {
    root: TrieNode<K, V>,
}

impl<K, V> Trie<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Trie {
            root: TrieNode::empty(),
        }
    }

    /// Add `value` under `key`. Returns false if it was already present.
    pub fn put(&mut self, key: &[K], value: V) -> bool {
        self.root.put(key, value)
    }

    /// Remove `value` from `key`. Returns false if it was not present.
    pub fn remove(&mut self, key: &[K], value: &V) -> bool {
        self.root.remove(key, value)
    }

    /// Exact or prefix lookup with plain equality.
    pub fn get(&self, key: &[K], exact: bool) -> HashSet<V> {
        self.get_with(key, exact, |a, b| a == b, |_| None)
    }

    /// Lookup with a custom element comparison for shortened branches and an
    /// alternate element to also descend into at every split.
    pub fn get_with<E, A>(&self, key: &[K], exact: bool, eq: E, alternate: A) -> HashSet<V>
    where
        E: Fn(&K, &K) -> bool,
        A: Fn(&K) -> Option<K>,
    {
        let mut out = HashSet::new();
        self.root.collect(key, exact, &eq, &alternate, &mut out);
        out
    }

    /// Number of (key, value) entries.
    pub fn len(&self) -> usize {
        self.root.count
    }

    pub fn is_empty(&self) -> bool {
        self.root.count == 0
    }

    pub fn clear(&mut self) {
        self.root = TrieNode::empty();
    }
}

impl<K, V> Default for Trie<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Character-keyed trie supporting case-insensitive and prefix search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "V: Serialize + Eq + Hash",
    deserialize = "V: Deserialize<'de> + Eq + Hash"
))]
pub struct CharTrie<V> {
    trie: Trie<char, V>,
    min_key_length: usize,
}

impl<V> CharTrie<V>
where
    V: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::with_min_key_length(DEFAULT_MIN_KEY_LENGTH)
    }

    pub fn with_min_key_length(min_key_length: usize) -> Self {
        CharTrie {
            trie: Trie::new(),
            min_key_length,
        }
    }

    pub fn min_key_length(&self) -> usize {
        self.min_key_length
    }

    pub fn set_min_key_length(&mut self, min_key_length: usize) {
        self.min_key_length = min_key_length;
    }

    pub fn put(&mut self, key: &str, value: V) -> bool {
        let chars: Vec<char> = key.chars().collect();
        self.trie.put(&chars, value)
    }

    pub fn remove(&mut self, key: &str, value: &V) -> bool {
        let chars: Vec<char> = key.chars().collect();
        self.trie.remove(&chars, value)
    }

    /// Look up `key`. Keys shorter than the minimum length are matched
    /// exactly whatever `exact` says.
    pub fn get(&self, key: &str, case_sensitive: bool, exact: bool) -> HashSet<V> {
        let chars: Vec<char> = key.chars().collect();
        let exact = exact || chars.len() < self.min_key_length;

        if case_sensitive {
            self.trie.get(&chars, exact)
        } else {
            self.trie.get_with(&chars, exact, chars_equal_ignore_case, opposite_case)
        }
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    pub fn clear(&mut self) {
        self.trie.clear();
    }
}

impl<V> Default for CharTrie<V>
where
    V: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The single-character other-case form of `c`, if it has one.
fn opposite_case(c: &char) -> Option<char> {
    if c.is_uppercase() {
        single(c.to_lowercase())
    } else if c.is_lowercase() {
        single(c.to_uppercase())
    } else {
        None
    }
}

fn single(mut mapped: impl Iterator<Item = char>) -> Option<char> {
    let first = mapped.next()?;
    match mapped.next() {
        Some(_) => None,
        None => Some(first),
    }
}

fn chars_equal_ignore_case(a: &char, b: &char) -> bool {
    a == b || opposite_case(a) == Some(*b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[u32]) -> HashSet<u32> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_exact_and_case_lookup() {
        let mut trie = CharTrie::new();
        trie.put("cat", 1u32);

        assert_eq!(trie.get("cat", true, true), set(&[1]));
        assert_eq!(trie.get("CAT", false, true), set(&[1]));
        assert_eq!(trie.get("CAT", true, true), set(&[]));
        assert_eq!(trie.get("cats", true, true), set(&[]));
    }

    #[test]
    fn test_short_prefix_forced_exact() {
        let mut trie = CharTrie::new();
        trie.put("cat", 1u32);

        // "ca" is below the default minimum, so it is matched exactly
        assert_eq!(trie.get("ca", true, false), set(&[]));

        trie.set_min_key_length(2);
        assert_eq!(trie.get("ca", true, false), set(&[1]));
    }

    #[test]
    fn test_prefix_union_across_split() {
        let mut trie = CharTrie::new();
        trie.put("Mammal", 1u32);
        trie.put("Mammoth", 2);
        trie.put("Mouse", 3);
        trie.put("mammal", 4);

        assert_eq!(trie.get("Mam", true, false), set(&[1, 2]));
        assert_eq!(trie.get("mam", false, false), set(&[1, 2, 4]));
        assert_eq!(trie.get("MAMMAL", false, true), set(&[1, 4]));
        assert_eq!(trie.get("Mammal", true, true), set(&[1]));
        assert_eq!(trie.len(), 4);
    }

    #[test]
    fn test_key_ending_inside_branch() {
        let mut trie = CharTrie::with_min_key_length(0);
        trie.put("cattle", 1u32);
        trie.put("cat", 2);

        assert_eq!(trie.get("cat", true, true), set(&[2]));
        assert_eq!(trie.get("cattle", true, true), set(&[1]));
        assert_eq!(trie.get("cat", true, false), set(&[1, 2]));
        assert_eq!(trie.get("", true, false), set(&[1, 2]));
    }

    #[test]
    fn test_split_preserves_values_and_count() {
        let mut trie: Trie<char, u32> = Trie::new();
        let cat: Vec<char> = "cat".chars().collect();
        let car: Vec<char> = "car".chars().collect();

        assert!(trie.put(&cat, 1));
        assert!(trie.put(&cat, 2));
        assert!(!trie.put(&cat, 2));
        assert_eq!(trie.root.branch.as_deref(), Some(&cat[..]));

        assert!(trie.put(&car, 3));
        assert!(trie.root.branch.is_none());
        assert_eq!(trie.len(), 3);
        assert_eq!(trie.get(&cat, true), set(&[1, 2]));
        assert_eq!(trie.get(&car, true), set(&[3]));
    }

    #[test]
    fn test_removal_recompresses() {
        let mut trie: Trie<char, u32> = Trie::new();
        let cat: Vec<char> = "cat".chars().collect();
        let car: Vec<char> = "car".chars().collect();
        trie.put(&cat, 1);
        trie.put(&car, 2);

        assert!(!trie.remove(&car, &99));
        assert!(trie.remove(&car, &2));
        assert_eq!(trie.root.branch.as_deref(), Some(&cat[..]));
        assert!(trie.root.children.is_none());
        assert_eq!(trie.get(&cat, true), set(&[1]));

        assert!(trie.remove(&cat, &1));
        assert!(trie.is_empty());
        assert!(trie.root.branch.is_none());
        assert!(trie.root.values.is_empty());
    }

    #[test]
    fn test_removing_extension_folds_chain() {
        let mut trie: Trie<char, u32> = Trie::new();
        let ab: Vec<char> = "ab".chars().collect();
        let abc: Vec<char> = "abc".chars().collect();
        trie.put(&ab, 1);
        trie.put(&abc, 2);
        assert!(trie.root.branch.is_none());

        assert!(trie.remove(&abc, &2));
        assert_eq!(trie.root.branch.as_deref(), Some(&ab[..]));
        assert!(trie.root.children.is_none());
        assert_eq!(trie.root.values, set(&[1]));
        assert_eq!(trie.len(), 1);

        assert!(trie.put(&abc, 4));
        assert_eq!(trie.get(&ab, false), set(&[1, 4]));
    }

    #[test]
    fn test_remove_keeps_branching_children() {
        let mut trie = CharTrie::new();
        trie.put("ab", 1u32);
        trie.put("abc", 2);
        trie.put("abd", 3);

        assert!(trie.remove("ab", &1));
        assert_eq!(trie.get("abc", true, true), set(&[2]));
        assert_eq!(trie.get("abd", true, true), set(&[3]));
        assert_eq!(trie.get("ab", true, true), set(&[]));
        assert_eq!(trie.len(), 2);
    }

    #[test]
    fn test_opposite_case() {
        assert_eq!(opposite_case(&'a'), Some('A'));
        assert_eq!(opposite_case(&'Q'), Some('q'));
        assert_eq!(opposite_case(&'7'), None);
        // 'ß' upper-cases to "SS"
        assert_eq!(opposite_case(&'ß'), None);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut trie = CharTrie::new();
        trie.put("Cow", 1u64);
        trie.put("Cowboy", 2);

        let bytes = bincode::serialize(&trie).unwrap();
        let restored: CharTrie<u64> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.get("cow", false, false), trie.get("cow", false, false));
        assert_eq!(restored.len(), 2);
    }
}
