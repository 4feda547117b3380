//! Point bucket trees: the same node machinery as [`Mesh`](crate::mesh::Mesh), with a list
//! of positioned items per leaf instead of grid data. Leaves split once they hold more than
//! `max_population` items and siblings merge once they hold fewer than `min_population`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use treeamr_geometry::{Rectangle, Split};

use crate::tree::{Node, NodeId, Nodes, TreeError, leaves, merge_node, split_node};

/// An object with a location in space.
pub trait Positioned<const D: usize> {
    fn position(&self) -> [f64; D];
}

impl<const D: usize> Positioned<D> for [f64; D] {
    fn position(&self) -> [f64; D] {
        *self
    }
}

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("point {0:?} lies outside of the domain")]
    OutOfBounds(Vec<f64>),
    #[error("minimum population {min} exceeds maximum population {max}")]
    InvalidSettings { min: usize, max: usize },
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketSettings {
    /// Leaves holding more items than this are split.
    pub max_population: usize,
    /// Siblings holding fewer items than this in total are merged.
    pub min_population: usize,
    pub max_level: usize,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            max_population: 8,
            min_population: 3,
            max_level: 16,
        }
    }
}

impl BucketSettings {
    pub fn validate(&self) -> Result<(), BucketError> {
        if self.max_population == 0 || self.min_population > self.max_population {
            return Err(BucketError::InvalidSettings {
                min: self.min_population,
                max: self.max_population,
            });
        }

        Ok(())
    }
}

/// A tree over `domain` storing items in its leaves.
#[derive(Debug)]
pub struct BucketTree<T, const D: usize> {
    settings: BucketSettings,
    domain: Rectangle<D>,
    root: NodeId,
    nodes: Nodes<Vec<T>, D>,
}

impl<T: Positioned<D>, const D: usize> BucketTree<T, D> {
    pub fn new(domain: Rectangle<D>, settings: BucketSettings) -> Result<Self, BucketError> {
        settings.validate()?;

        let mut nodes = Nodes::with_key();
        let root = nodes.insert(Node::root(Vec::new(), 0, [0; D]));

        Ok(Self {
            settings,
            domain,
            root,
            nodes,
        })
    }

    pub fn settings(&self) -> &BucketSettings {
        &self.settings
    }

    pub fn domain(&self) -> Rectangle<D> {
        self.domain
    }

    /// Adds an item to the leaf containing it. The tree is not rebalanced until the next
    /// call to [`restructure`](Self::restructure).
    pub fn insert(&mut self, item: T) -> Result<(), BucketError> {
        let position = item.position();
        let leaf = self
            .leaf_containing(position)
            .ok_or_else(|| BucketError::OutOfBounds(position.to_vec()))?;

        if let Some(bucket) = self.nodes.get_mut(leaf).and_then(Node::data_mut) {
            bucket.push(item);
        }

        Ok(())
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) -> Result<(), BucketError> {
        for item in items {
            self.insert(item)?;
        }
        Ok(())
    }

    /// Subdivides every leaf until all leaves sit at least on `depth`.
    pub fn set_depth(&mut self, depth: usize) -> Result<(), BucketError> {
        let depth = if depth > self.settings.max_level {
            log::trace!(
                "clamping bucket depth {depth} to level {}",
                self.settings.max_level
            );
            self.settings.max_level
        } else {
            depth
        };

        let mut stack = self.leaves();
        while let Some(id) = stack.pop() {
            let node = self.nodes.get(id).ok_or(TreeError::Stale(id))?;
            if node.level() < depth {
                stack.extend(self.split(id)?);
            }
        }

        Ok(())
    }

    /// Moves items whose position left their leaf, then splits overfull leaves and merges
    /// underfull siblings. Items that left the domain are removed and returned.
    pub fn restructure(&mut self) -> Result<Vec<T>, BucketError> {
        let escaped = self.rebucket();
        let mut splits = 0;
        let mut merges = 0;

        let mut stack = self.leaves();
        while let Some(id) = stack.pop() {
            let node = self.nodes.get(id).ok_or(TreeError::Stale(id))?;
            let population = node.data().map_or(0, Vec::len);

            if population > self.settings.max_population && node.level() < self.settings.max_level
            {
                stack.extend(self.split(id)?);
                splits += 1;
            }
        }

        let mut candidates = Vec::new();
        for id in self.leaves() {
            if let Some(parent) = self.nodes.get(id).and_then(Node::parent) {
                if !candidates.contains(&parent) {
                    candidates.push(parent);
                }
            }
        }

        while let Some(id) = candidates.pop() {
            if !self.is_underfull(id) {
                continue;
            }

            merge_node(&mut self.nodes, id, |buckets: &mut [Vec<T>]| {
                Ok::<_, BucketError>(buckets.iter_mut().flat_map(std::mem::take).collect())
            })?;
            merges += 1;

            if let Some(parent) = self.nodes.get(id).and_then(Node::parent) {
                candidates.push(parent);
            }
        }

        log::debug!(
            "restructured bucket tree: {splits} splits, {merges} merges, {} items escaped",
            escaped.len()
        );

        Ok(escaped)
    }

    /// Reinserts items that moved out of their leaf.
    fn rebucket(&mut self) -> Vec<T> {
        let mut moved = Vec::new();

        for id in self.leaves() {
            let Some(bucket) = self.nodes.get_mut(id).and_then(Node::data_mut) else {
                continue;
            };

            let items = std::mem::take(bucket);
            let mut kept = Vec::with_capacity(items.len());

            for item in items {
                if self.leaf_containing(item.position()) == Some(id) {
                    kept.push(item);
                } else {
                    moved.push(item);
                }
            }

            if let Some(bucket) = self.nodes.get_mut(id).and_then(Node::data_mut) {
                *bucket = kept;
            }
        }

        let mut escaped = Vec::new();
        for item in moved {
            match self.leaf_containing(item.position()) {
                Some(leaf) => {
                    if let Some(bucket) = self.nodes.get_mut(leaf).and_then(Node::data_mut) {
                        bucket.push(item);
                    }
                }
                None => escaped.push(item),
            }
        }

        escaped
    }

    fn split(&mut self, id: NodeId) -> Result<Vec<NodeId>, BucketError> {
        let bounds = self.leaf_bounds(id).ok_or(TreeError::Stale(id))?;

        split_node(&mut self.nodes, id, |items: &mut Vec<T>| {
            let mut buckets = (0..Split::<D>::COUNT)
                .map(|_| Vec::new())
                .collect::<Vec<_>>();

            for item in std::mem::take(items) {
                let split = bounds.split_containing(item.position());
                buckets[split.to_linear()].push(item);
            }

            Ok::<_, BucketError>(buckets)
        })
    }

    fn is_underfull(&self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };

        if node.is_leaf() {
            return false;
        }

        let mut population = 0;
        for &child in node.children() {
            match self.nodes.get(child) {
                Some(child) if child.is_leaf() => {
                    population += child.data().map_or(0, Vec::len);
                }
                _ => return false,
            }
        }

        population < self.settings.min_population
    }

    /// The leaf whose region contains `point`, or `None` outside of the domain.
    pub fn leaf_containing(&self, point: [f64; D]) -> Option<NodeId> {
        if !self.domain.contains(point) {
            return None;
        }

        let mut bounds = self.domain;
        let mut current = self.root;

        loop {
            let node = self.nodes.get(current)?;
            if node.is_leaf() {
                return Some(current);
            }

            let split = bounds.split_containing(point);
            bounds = bounds.split(split);
            current = node.child(split)?;
        }
    }

    /// Region covered by a node.
    pub fn leaf_bounds(&self, id: NodeId) -> Option<Rectangle<D>> {
        let mut path = Vec::new();
        let mut current = self.nodes.get(id)?;

        while let Some(parent) = current.parent() {
            path.push(current.split());
            current = self.nodes.get(parent)?;
        }

        Some(
            path.into_iter()
                .rev()
                .fold(self.domain, |bounds, split| bounds.split(split)),
        )
    }

    /// Items stored in a leaf.
    pub fn bucket(&self, id: NodeId) -> Option<&[T]> {
        self.nodes.get(id)?.data().map(Vec::as_slice)
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        leaves(&self.nodes, self.root)
    }

    pub fn num_leaves(&self) -> usize {
        self.nodes.iter().filter(|(_, node)| node.is_leaf()).count()
    }

    /// Deepest level of any leaf.
    pub fn depth(&self) -> usize {
        self.nodes
            .iter()
            .map(|(_, node)| node.level())
            .max()
            .unwrap_or(0)
    }

    /// Total number of stored items.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.nodes
            .iter()
            .filter_map(|(_, node)| node.data())
            .flatten()
    }

    /// Mutable access to every item. Moved items are rebucketed by the next restructure.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.nodes
            .iter_mut()
            .filter_map(|(_, node)| node.data_mut())
            .flatten()
    }

    /// All items lying inside `region`.
    pub fn query(&self, region: &Rectangle<D>) -> Vec<&T> {
        let mut result = Vec::new();
        let mut stack = vec![(self.root, self.domain)];

        while let Some((id, bounds)) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };

            if !bounds.intersects(region) {
                continue;
            }

            match node.data() {
                Some(items) => result.extend(
                    items
                        .iter()
                        .filter(|item| region.contains(item.position())),
                ),
                None => {
                    for split in Split::<D>::enumerate() {
                        if let Some(child) = node.child(split) {
                            stack.push((child, bounds.split(split)));
                        }
                    }
                }
            }
        }

        result
    }
}
