//! A topic trie with one lock pair per node.
//!
//! Children are keyed by the raw level string, so the wildcard levels `+`
//! and `#` of a filter are ordinary children named `"+"` and `"#"`, and the
//! empty level of `"/a"` is the child `""`.
//!
//! Readers clone the child `Arc`s they need and release each lock before
//! descending, so a lookup never holds more than one lock at a time. Writers
//! that create nodes do the same. Pruning locks top-down
//! (`parent.children`, then `child.children`, then `child.value`) and marks
//! the removed node as detached while holding all three; a writer that lands
//! on a detached node restarts from the root.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::HashMap;

/// Payload stored at a trie node.
pub trait NodeValue: Default + Send + Sync {
    /// An empty value lets the node be pruned.
    fn is_empty(&self) -> bool;
}

impl<K, V> NodeValue for HashMap<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    #[inline]
    fn is_empty(&self) -> bool {
        std::collections::HashMap::is_empty(self)
    }
}

impl<V: Send + Sync> NodeValue for Option<V> {
    #[inline]
    fn is_empty(&self) -> bool {
        self.is_none()
    }
}

pub struct Node<V> {
    value: RwLock<V>,
    children: RwLock<HashMap<String, Arc<Node<V>>>>,
    detached: AtomicBool,
}

impl<V: NodeValue> Default for Node<V> {
    fn default() -> Self {
        Node {
            value: RwLock::new(V::default()),
            children: RwLock::new(HashMap::default()),
            detached: AtomicBool::new(false),
        }
    }
}

impl<V: NodeValue> Node<V> {
    #[inline]
    fn child(&self, level: &str) -> Option<Arc<Node<V>>> {
        self.children.read().get(level).cloned()
    }

    #[inline]
    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

#[inline]
fn is_metadata(level: &str) -> bool {
    level.starts_with('$')
}

pub struct Trie<V> {
    root: Arc<Node<V>>,
}

impl<V: NodeValue> Default for Trie<V> {
    fn default() -> Self {
        Trie { root: Arc::new(Node::default()) }
    }
}

impl<V: NodeValue> Trie<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on the value at `path`, creating missing nodes on the way.
    pub fn update<R, F>(&self, path: &str, f: F) -> R
    where
        F: FnOnce(&mut V) -> R,
    {
        'retry: loop {
            let mut node = self.root.clone();
            for level in path.split('/') {
                let next = match node.child(level) {
                    Some(child) => child,
                    None => {
                        let mut children = node.children.write();
                        if node.is_detached() {
                            continue 'retry;
                        }
                        children.entry(level.to_owned()).or_default().clone()
                    }
                };
                node = next;
            }
            let mut value = node.value.write();
            if node.is_detached() {
                continue 'retry;
            }
            return f(&mut value);
        }
    }

    /// Runs `f` on the value at `path` if the node exists, then prunes the
    /// nodes left empty on that path.
    pub fn remove<R, F>(&self, path: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        let levels: Vec<&str> = path.split('/').collect();
        let mut nodes = Vec::with_capacity(levels.len() + 1);
        nodes.push(self.root.clone());
        for level in levels.iter() {
            let next = nodes.last().and_then(|n| n.child(level))?;
            nodes.push(next);
        }
        let res = match nodes.last() {
            Some(target) => f(&mut target.value.write()),
            None => return None,
        };
        self.prune(&levels, &nodes);
        Some(res)
    }

    fn prune(&self, levels: &[&str], nodes: &[Arc<Node<V>>]) {
        for idx in (1..nodes.len()).rev() {
            let parent = &nodes[idx - 1];
            let child = &nodes[idx];
            let key = levels[idx - 1];

            let mut siblings = parent.children.write();
            match siblings.get(key) {
                Some(c) if Arc::ptr_eq(c, child) => {}
                _ => break,
            }
            let grandchildren = child.children.write();
            let value = child.value.read();
            if !grandchildren.is_empty() || !value.is_empty() {
                break;
            }
            child.detached.store(true, Ordering::SeqCst);
            drop(value);
            drop(grandchildren);
            siblings.remove(key);
        }
    }

    /// Visits the value of every filter that matches the concrete `topic`.
    ///
    /// Each matching node is visited once; `#` also matches its parent
    /// level, and root-level `+`/`#` skip topics starting with `$`.
    pub fn match_topic<F>(&self, topic: &str, f: &mut F)
    where
        F: FnMut(&V),
    {
        let levels: Vec<&str> = topic.split('/').collect();
        Self::match_topic_node(&self.root, &levels, 0, f);
    }

    fn match_topic_node<F>(node: &Arc<Node<V>>, levels: &[&str], idx: usize, f: &mut F)
    where
        F: FnMut(&V),
    {
        let (multi, single, literal) = {
            let children = node.children.read();
            let wildcards = !(idx == 0 && levels.first().is_some_and(|l| is_metadata(l)));
            (
                if wildcards { children.get("#").cloned() } else { None },
                if wildcards && idx < levels.len() { children.get("+").cloned() } else { None },
                levels.get(idx).and_then(|l| children.get(*l).cloned()),
            )
        };
        if let Some(multi) = multi {
            f(&multi.value.read());
        }
        if idx == levels.len() {
            f(&node.value.read());
            return;
        }
        if let Some(single) = single {
            Self::match_topic_node(&single, levels, idx + 1, f);
        }
        if let Some(literal) = literal {
            Self::match_topic_node(&literal, levels, idx + 1, f);
        }
    }

    /// Visits the value of every concrete topic matched by `filter`.
    pub fn match_filter<F>(&self, filter: &str, f: &mut F)
    where
        F: FnMut(&V),
    {
        let levels: Vec<&str> = filter.split('/').collect();
        Self::match_filter_node(&self.root, &levels, 0, f);
    }

    fn match_filter_node<F>(node: &Arc<Node<V>>, levels: &[&str], idx: usize, f: &mut F)
    where
        F: FnMut(&V),
    {
        let level = match levels.get(idx) {
            Some(level) => *level,
            None => {
                f(&node.value.read());
                return;
            }
        };
        match level {
            "#" => {
                if idx > 0 {
                    f(&node.value.read());
                }
                for child in Self::wildcard_children(node, idx) {
                    Self::visit_all(&child, f);
                }
            }
            "+" => {
                for child in Self::wildcard_children(node, idx) {
                    Self::match_filter_node(&child, levels, idx + 1, f);
                }
            }
            _ => {
                if let Some(child) = node.child(level) {
                    Self::match_filter_node(&child, levels, idx + 1, f);
                }
            }
        }
    }

    fn wildcard_children(node: &Node<V>, idx: usize) -> Vec<Arc<Node<V>>> {
        node.children
            .read()
            .iter()
            .filter(|(level, _)| !(idx == 0 && is_metadata(level)))
            .map(|(_, child)| child.clone())
            .collect()
    }

    fn visit_all<F>(node: &Arc<Node<V>>, f: &mut F)
    where
        F: FnMut(&V),
    {
        f(&node.value.read());
        let children: Vec<_> = node.children.read().values().cloned().collect();
        for child in children {
            Self::visit_all(&child, f);
        }
    }

    /// Visits every value in the trie.
    pub fn for_each<F>(&self, f: &mut F)
    where
        F: FnMut(&V),
    {
        Self::visit_all(&self.root, f);
    }

    /// True when no node hangs off the root.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.children.read().is_empty()
    }
}
