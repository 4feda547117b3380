use treeamr_geometry::{Split, faces};

use crate::block::Block;
use crate::tree::{Action, NodeId, RefinePlan, insert_plan, merge_node, split_node};

use super::{Mesh, MeshError};

/// Summary of a restructuring pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestructureReport {
    /// Leaves split into `2^D` children.
    pub refined: usize,
    /// Internal nodes merged back into leaves.
    pub coarsened: usize,
    /// Refinements added to keep the mesh graded.
    pub forced: usize,
    /// Rounds of the grading closure.
    pub iterations: usize,
}

impl<const D: usize> Mesh<D> {
    /// Applies all pending refine and coarsen requests, keeping the mesh graded.
    pub fn restructure(&mut self) -> Result<RestructureReport, MeshError> {
        let seeds = self.leaves();
        self.restructure_leaves(seeds)
    }

    /// Applies the pending requests of a single tree's leaves. Grading may still refine
    /// leaves of neighboring trees.
    pub fn restructure_tree(&mut self, tree: usize) -> Result<RestructureReport, MeshError> {
        let seeds = self.tree_leaves(tree)?;
        self.restructure_leaves(seeds)
    }

    fn restructure_leaves(&mut self, seeds: Vec<NodeId>) -> Result<RestructureReport, MeshError> {
        let mut report = RestructureReport::default();
        let mut plans: Vec<RefinePlan<D>> = Vec::new();
        let mut touched = seeds.clone();

        self.seed_plans(&seeds, &mut plans);
        let result = self.apply_plans(&seeds, &mut plans, &mut touched, &mut report);

        // Every request is consumed by a pass, coarsening in particular must be confirmed
        // again by the next kernel application.
        for &id in &touched {
            if let Some(node) = self.nodes.get_mut(id) {
                node.action = Action::None;
                node.refine_plan.clear();
                node.propagate = false;
            }
        }

        result?;

        debug_assert!(self.is_graded());

        log::debug!(
            "restructured mesh: {} refined, {} coarsened, {} forced in {} grading rounds",
            report.refined,
            report.coarsened,
            report.forced,
            report.iterations
        );

        Ok(report)
    }

    fn apply_plans(
        &mut self,
        seeds: &[NodeId],
        plans: &mut Vec<RefinePlan<D>>,
        touched: &mut Vec<NodeId>,
        report: &mut RestructureReport,
    ) -> Result<(), MeshError> {
        self.grade(seeds, plans, touched, report)?;
        self.apply_refinement(plans, report)?;

        let parents = self.propagate_coarsening(plans, touched);
        self.apply_coarsening(&parents, plans, report)
    }

    /// Clamps requests that cannot be honored and builds the initial plans.
    fn seed_plans(&mut self, seeds: &[NodeId], plans: &mut Vec<RefinePlan<D>>) {
        let max_level = self.settings().max_level;

        for &id in seeds {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };

            match node.action {
                Action::Refine if node.level >= max_level => {
                    log::trace!("ignoring refinement of {id:?}, already at level {max_level}");
                    node.action = Action::None;
                }
                Action::Coarsen if node.level == 0 => {
                    log::trace!("ignoring coarsening of root {id:?}");
                    node.action = Action::None;
                }
                _ => {}
            }

            if let Some(plan) = RefinePlan::from_node(id, node) {
                node.refine_plan.push(insert_plan(plans, plan));
            }
        }
    }

    /// Forces refinement of every leaf that would end up more than one level coarser than
    /// a face neighbor, iterating until no new refinements appear.
    fn grade(
        &mut self,
        seeds: &[NodeId],
        plans: &mut Vec<RefinePlan<D>>,
        touched: &mut Vec<NodeId>,
        report: &mut RestructureReport,
    ) -> Result<(), MeshError> {
        let limit = self.settings().grading_iterations();

        let mut worklist = Vec::new();
        for &id in seeds {
            if let Some(node) = self.nodes.get_mut(id) {
                if node.action == Action::Refine {
                    node.propagate = true;
                    worklist.push(id);
                }
            }
        }

        while !worklist.is_empty() {
            if report.iterations == limit {
                log::error!("grading closure did not converge within {limit} iterations");
                return Err(MeshError::GradingDiverged { iterations: limit });
            }

            report.iterations += 1;

            let mut next = Vec::new();

            for id in worklist {
                let node = self.node(id)?;
                let (level, index) = (node.level(), node.index());

                for face in faces::<D>() {
                    let Some(neighbor) = self.neighbor_index(level, index, face) else {
                        continue;
                    };

                    let Some(cover) = self.locate(level, neighbor) else {
                        continue;
                    };

                    let node = self.node_mut(cover)?;

                    if node.level >= level || node.propagate {
                        continue;
                    }

                    log::trace!(
                        "forcing refinement of {cover:?} on level {} next to {id:?}",
                        node.level
                    );

                    if node.action != Action::Refine {
                        report.forced += 1;
                    }

                    node.action = Action::Refine;
                    node.propagate = true;

                    if let Some(plan) = RefinePlan::from_node(cover, node) {
                        node.refine_plan.push(insert_plan(plans, plan));
                    }

                    touched.push(cover);
                    next.push(cover);
                }
            }

            worklist = next;
        }

        Ok(())
    }

    fn apply_refinement(
        &mut self,
        plans: &[RefinePlan<D>],
        report: &mut RestructureReport,
    ) -> Result<(), MeshError> {
        let mut splitting = Vec::new();

        for plan in plans.iter().filter(|plan| plan.action == Action::Refine) {
            for &id in &plan.nodes {
                let node = self.node(id)?;
                if node.is_leaf() && node.action == Action::Refine {
                    splitting.push(id);
                }
            }
        }

        splitting.sort();
        splitting.dedup();

        // Prolongation reads the halo, which still holds values from before the last kernel.
        self.synchronize_leaves(splitting.clone())?;

        for id in splitting {
            let config = &self.config;
            split_node(&mut self.nodes, id, |block: &mut Block<D>| {
                block.subdivide(config).map_err(MeshError::from)
            })?;

            report.refined += 1;
        }

        Ok(())
    }

    /// Lifts every coarsen plan to the parent level. Lifted plans join `plans`, so parents
    /// of neighboring regions share one footprint, and every parent records the plan that
    /// covers it. Returns the candidate parents, finest first.
    fn propagate_coarsening(
        &mut self,
        plans: &mut Vec<RefinePlan<D>>,
        touched: &mut Vec<NodeId>,
    ) -> Vec<NodeId> {
        let mut lifted = Vec::new();

        for plan in plans.iter_mut() {
            if plan.action != Action::Coarsen || plan.propagate {
                continue;
            }

            plan.propagate = true;
            lifted.extend(plan.propagate_up(&self.nodes));
        }

        let mut parents = Vec::new();

        for up in lifted {
            let nodes = up.nodes.clone();
            let index = insert_plan(plans, up);

            for parent in nodes {
                let Some(node) = self.nodes.get_mut(parent) else {
                    continue;
                };

                node.refine_plan.push(index);
                touched.push(parent);

                if !parents.contains(&parent) {
                    parents.push(parent);
                }
            }
        }

        // Finest first, so a merge never looks at stale children.
        parents.sort_by_key(|&id| std::cmp::Reverse(self.nodes.get(id).map_or(0, |n| n.level())));
        parents
    }

    fn apply_coarsening(
        &mut self,
        parents: &[NodeId],
        plans: &[RefinePlan<D>],
        report: &mut RestructureReport,
    ) -> Result<(), MeshError> {
        for &parent in parents {
            if !self.can_coarsen(parent, plans)? {
                continue;
            }

            let config = &self.config;
            merge_node(&mut self.nodes, parent, |children: &mut [Block<D>]| {
                Block::coarsen(children, config).map_err(MeshError::from)
            })?;

            report.coarsened += 1;
        }

        Ok(())
    }

    /// A node may merge if a lifted coarsen plan covers it, every child is a leaf requesting
    /// coarsening through a plan of this pass, and no same level neighbor has a refined
    /// child on the shared face.
    fn can_coarsen(&self, id: NodeId, plans: &[RefinePlan<D>]) -> Result<bool, MeshError> {
        let node = self.node(id)?;

        let lifted = covered_by_coarsening(node.level(), node.index(), &node.refine_plan, plans);
        if node.is_leaf() || !lifted {
            return Ok(false);
        }

        for &child in node.children() {
            let child = self.node(child)?;
            let planned =
                covered_by_coarsening(child.level(), child.index(), &child.refine_plan, plans);

            if !child.is_leaf() || child.action != Action::Coarsen || !planned {
                return Ok(false);
            }
        }

        for face in faces::<D>() {
            let Some(neighbor) = node.adjacent(face) else {
                continue;
            };

            let neighbor = self.node(neighbor)?;
            if neighbor.is_leaf() {
                continue;
            }

            let shared = face.reversed();
            for split in Split::<D>::enumerate().filter(|split| split.is_outer_face(shared)) {
                let Some(child) = neighbor.child(split) else {
                    continue;
                };

                if !self.node(child)?.is_leaf() {
                    log::trace!("coarsening of {id:?} vetoed by refined neighbor {child:?}");
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

fn covered_by_coarsening<const D: usize>(
    level: usize,
    index: [usize; D],
    covering: &[usize],
    plans: &[RefinePlan<D>],
) -> bool {
    covering.iter().map(|&plan| &plans[plan]).any(|plan| {
        plan.action == Action::Coarsen && plan.level == level && plan.contains(index)
    })
}
