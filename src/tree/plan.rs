use treeamr_geometry::IndexWindow;

use crate::tree::{Action, Node, NodeId, Nodes};

/// A pending structural change covering a rectangular region of nodes on one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinePlan<const D: usize> {
    pub action: Action,
    pub level: usize,
    /// Lower corner of the footprint in the level's global index space.
    pub position: [usize; D],
    pub size: [usize; D],
    pub nodes: Vec<NodeId>,
    /// Set once this plan has been lifted to its parent level, and on the lifted plan itself,
    /// so no plan is lifted twice.
    pub propagate: bool,
}

impl<const D: usize> RefinePlan<D> {
    /// A plan covering a single node, built from its pending action. Returns `None` if no
    /// action is pending.
    pub fn from_node<P>(id: NodeId, node: &Node<P, D>) -> Option<Self> {
        if node.action == Action::None {
            return None;
        }

        Some(Self {
            action: node.action,
            level: node.level,
            position: node.index,
            size: [1; D],
            nodes: vec![id],
            propagate: false,
        })
    }

    pub fn window(&self) -> IndexWindow<D> {
        IndexWindow::new(self.position, self.size)
    }

    pub fn contains(&self, index: [usize; D]) -> bool {
        self.window().contains(index)
    }

    /// Whether the footprints overlap or share a boundary (corners included).
    pub fn touches(&self, other: &Self) -> bool {
        (0..D).all(|axis| {
            self.position[axis] <= other.position[axis] + other.size[axis]
                && other.position[axis] <= self.position[axis] + self.size[axis]
        })
    }

    /// Absorbs `other` if both plans live on `level`, request the same action and touch.
    /// The footprint becomes the bounding box of the two.
    pub fn merge(&mut self, other: &Self, level: usize) -> bool {
        if self.level != level || other.level != level {
            return false;
        }

        if self.action != other.action || !self.touches(other) {
            return false;
        }

        for axis in 0..D {
            let end = (self.position[axis] + self.size[axis])
                .max(other.position[axis] + other.size[axis]);
            self.position[axis] = self.position[axis].min(other.position[axis]);
            self.size[axis] = end - self.position[axis];
        }

        for &node in &other.nodes {
            if !self.nodes.contains(&node) {
                self.nodes.push(node);
            }
        }

        true
    }

    /// Re-expresses this plan on the parent level: the footprint is halved (rounding
    /// outward) and nodes are replaced by their distinct parents. Returns `None` on level 0.
    pub fn propagate_up<P>(&self, nodes: &Nodes<P, D>) -> Option<Self> {
        if self.level == 0 {
            return None;
        }

        let mut parents = Vec::new();
        for parent in self
            .nodes
            .iter()
            .filter_map(|&id| nodes.get(id))
            .filter_map(|node| node.parent)
        {
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }

        let position: [usize; D] = std::array::from_fn(|axis| self.position[axis] / 2);
        let size = std::array::from_fn(|axis| {
            (self.position[axis] + self.size[axis]).div_ceil(2) - position[axis]
        });

        Some(Self {
            action: self.action,
            level: self.level - 1,
            position,
            size,
            nodes: parents,
            propagate: true,
        })
    }
}

/// Adds `plan` to `plans`, merging it into the first compatible plan. Returns the index of
/// the plan that now holds it.
pub fn insert_plan<const D: usize>(plans: &mut Vec<RefinePlan<D>>, plan: RefinePlan<D>) -> usize {
    let level = plan.level;

    if let Some(index) = plans.iter_mut().position(|p| p.merge(&plan, level)) {
        return index;
    }

    plans.push(plan);
    plans.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::split_node;
    use crate::tree::TreeError;

    fn plan(action: Action, level: usize, position: [usize; 2], size: [usize; 2]) -> RefinePlan<2> {
        RefinePlan {
            action,
            level,
            position,
            size,
            nodes: Vec::new(),
            propagate: false,
        }
    }

    #[test]
    fn merging() {
        let mut a = plan(Action::Refine, 2, [0, 0], [2, 2]);
        let b = plan(Action::Refine, 2, [2, 1], [1, 1]);
        assert!(a.merge(&b, 2));
        assert_eq!(a.position, [0, 0]);
        assert_eq!(a.size, [3, 2]);

        let far = plan(Action::Refine, 2, [5, 5], [1, 1]);
        assert!(!a.merge(&far, 2));

        let coarsen = plan(Action::Coarsen, 2, [1, 1], [1, 1]);
        assert!(!a.merge(&coarsen, 2));

        let other_level = plan(Action::Refine, 1, [1, 1], [1, 1]);
        assert!(!a.merge(&other_level, 1));
        assert!(!a.merge(&b, 1));

        let mut plans = vec![a];
        assert_eq!(insert_plan(&mut plans, far), 1);
        assert_eq!(insert_plan(&mut plans, plan(Action::Refine, 2, [3, 2], [1, 1])), 0);
        assert_eq!(plans[0].size, [4, 3]);
    }

    #[test]
    fn propagation() -> eyre::Result<()> {
        let mut tree = Nodes::<(), 2>::with_key();
        let root = tree.insert(Node::root((), 0, [0, 0]));
        let children = split_node(&mut tree, root, |_| Ok::<_, TreeError>(vec![(); 4]))?;
        let grandchildren = split_node(&mut tree, children[3], |_| Ok::<_, TreeError>(vec![(); 4]))?;

        let mut coarsen = Vec::new();
        for &id in &grandchildren {
            let node = tree.get_mut(id).unwrap();
            node.action = Action::Coarsen;
            let single = RefinePlan::from_node(id, node).unwrap();
            assert_eq!(single.size, [1, 1]);
            insert_plan(&mut coarsen, single);
        }

        assert_eq!(coarsen.len(), 1);
        assert_eq!(coarsen[0].position, [2, 2]);
        assert_eq!(coarsen[0].size, [2, 2]);
        assert_eq!(coarsen[0].nodes.len(), 4);

        let up = coarsen[0].propagate_up(&tree).unwrap();
        assert_eq!(up.level, 1);
        assert_eq!(up.position, [1, 1]);
        assert_eq!(up.size, [1, 1]);
        assert_eq!(up.nodes, vec![children[3]]);
        assert!(up.propagate);

        let odd = plan(Action::Coarsen, 3, [1, 2], [2, 1]);
        let up = odd.propagate_up(&tree).unwrap();
        assert_eq!(up.position, [0, 1]);
        assert_eq!(up.size, [2, 1]);

        assert!(RefinePlan::from_node(root, tree.get(root).unwrap()).is_none());
        assert!(plan(Action::Coarsen, 0, [0, 0], [1, 1]).propagate_up(&tree).is_none());
        Ok(())
    }
}
