//! Articulation tree: joint arena plus topological order.
//!
//! Joints live in an arena of generational slots and never move once
//! inserted. The traversal order is a separate list of slot indices in
//! pre-order, so every subtree is the contiguous interval
//! `order[pos .. pos + n_subtree]` and a parent always precedes its
//! children. Structural edits touch only the child lists and rebuild the
//! order; joint data stays where it is.
//!
//! Several roots may coexist (a forest). Each root is either floating
//! (its body carries free 6-DOF motion) or grounded (pinned to the world).

use hashbrown::HashMap;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use sim_types::JointId;

use crate::error::{ArticulationError, Result};
use crate::joint::{Joint, JointLink};

/// Stable reference to a joint slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JointHandle {
    index: u32,
    generation: u32,
}

impl JointHandle {
    /// Handle from raw parts.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at the time the handle was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    joint: Option<Joint>,
}

/// Forest of joints of one articulated entity.
#[derive(Debug, Clone, Default)]
pub struct ArticulationTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: Vec<u32>,
    order: Vec<u32>,
    parent_pos: Vec<Option<u32>>,
    ids: HashMap<JointId, JointHandle>,
}

impl ArticulationTree {
    /// Empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of joints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the tree has no joints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Slot indices in pre-order.
    #[must_use]
    pub fn order(&self) -> &[u32] {
        &self.order
    }

    /// Order position of each joint's parent, indexed by order position.
    #[must_use]
    pub fn parent_positions(&self) -> &[Option<u32>] {
        &self.parent_pos
    }

    /// Order position of the parent of the joint at `pos`.
    #[must_use]
    pub fn parent_pos(&self, pos: usize) -> Option<usize> {
        self.parent_pos.get(pos).copied().flatten().map(|p| p as usize)
    }

    /// Handle for a caller id.
    #[must_use]
    pub fn handle_of(&self, id: JointId) -> Option<JointHandle> {
        self.ids.get(&id).copied()
    }

    /// Whether the handle still refers to a live joint.
    #[must_use]
    pub fn contains(&self, handle: JointHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Joint by handle.
    #[must_use]
    pub fn get(&self, handle: JointHandle) -> Option<&Joint> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.joint.as_ref()
    }

    /// Mutable joint by handle.
    pub fn get_mut(&mut self, handle: JointHandle) -> Option<&mut Joint> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.joint.as_mut()
    }

    /// Joint by caller id.
    #[must_use]
    pub fn by_id(&self, id: JointId) -> Option<&Joint> {
        self.handle_of(id).and_then(|h| self.get(h))
    }

    /// Mutable joint by caller id.
    pub fn by_id_mut(&mut self, id: JointId) -> Option<&mut Joint> {
        let handle = self.handle_of(id)?;
        self.get_mut(handle)
    }

    /// Handle of the joint at an order position.
    #[must_use]
    pub fn handle_at(&self, pos: usize) -> Option<JointHandle> {
        let index = *self.order.get(pos)?;
        let slot = self.slots.get(index as usize)?;
        Some(JointHandle::new(index, slot.generation))
    }

    /// Joint at an order position.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= len()`.
    #[must_use]
    pub fn at(&self, pos: usize) -> &Joint {
        match &self.slots[self.order[pos] as usize].joint {
            Some(joint) => joint,
            None => unreachable!("order references an empty slot"),
        }
    }

    /// Mutable joint at an order position.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= len()`.
    pub fn at_mut(&mut self, pos: usize) -> &mut Joint {
        let index = self.order[pos] as usize;
        match &mut self.slots[index].joint {
            Some(joint) => joint,
            None => unreachable!("order references an empty slot"),
        }
    }

    /// Order position of a handle.
    #[must_use]
    pub fn position_of(&self, handle: JointHandle) -> Option<usize> {
        if !self.contains(handle) {
            return None;
        }
        self.order.iter().position(|&i| i == handle.index)
    }

    /// Joints in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &Joint> + '_ {
        (0..self.len()).map(move |pos| self.at(pos))
    }

    /// Mutable joints in arena order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Joint> + '_ {
        self.slots.iter_mut().filter_map(|s| s.joint.as_mut())
    }

    /// Root joints' order positions.
    #[must_use]
    pub fn root_positions(&self) -> Vec<usize> {
        (0..self.len()).filter(|&p| self.parent_pos(p).is_none()).collect()
    }

    /// Insert a joint as the last child of its link's parent, or as a new
    /// root when the link has none.
    pub fn insert(&mut self, joint: Joint) -> Result<JointHandle> {
        if self.ids.contains_key(&joint.id) {
            return Err(ArticulationError::DuplicateJoint(joint.id));
        }
        let parent = match joint.link.parent {
            Some(p) if !self.contains(p) => return Err(ArticulationError::StaleHandle),
            other => other,
        };

        let id = joint.id;
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.joint = Some(joint);
                JointHandle::new(index, slot.generation)
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| ArticulationError::StaleHandle)?;
                self.slots.push(Slot {
                    generation: 0,
                    joint: Some(joint),
                });
                JointHandle::new(index, 0)
            }
        };

        match parent {
            Some(p) => {
                if let Some(parent) = self.get_mut(p) {
                    parent.children.push(handle.index);
                }
            }
            None => self.roots.push(handle.index),
        }
        self.ids.insert(id, handle);
        self.rebuild_order();
        Ok(handle)
    }

    /// Remove a childless joint.
    pub fn remove(&mut self, id: JointId) -> Result<Joint> {
        let handle = self.handle_of(id).ok_or(ArticulationError::UnknownJoint(id))?;
        let joint = self.get(handle).ok_or(ArticulationError::StaleHandle)?;
        if !joint.children.is_empty() {
            return Err(ArticulationError::HasChildren {
                id,
                children: joint.children.len(),
            });
        }
        let parent = joint.link.parent;

        match parent {
            Some(p) => {
                if let Some(parent) = self.get_mut(p) {
                    parent.children.retain(|&mut c| c != handle.index);
                }
            }
            None => self.roots.retain(|&r| r != handle.index),
        }

        let slot = &mut self.slots[handle.index as usize];
        let joint = slot.joint.take().ok_or(ArticulationError::StaleHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.ids.remove(&id);
        self.rebuild_order();
        Ok(joint)
    }

    /// Make `id` the root of its tree.
    ///
    /// Links along the path from `id` to the old root are reversed with
    /// [`JointLink::reversed`]; bodies, ids and scratch stay in their slots.
    /// World poses are unchanged. Grounded trees are rejected.
    pub fn reroot(&mut self, id: JointId) -> Result<()> {
        let handle = self.handle_of(id).ok_or(ArticulationError::UnknownJoint(id))?;

        // Path from the new root up to the old root.
        let mut path = vec![handle];
        let mut cursor = handle;
        while let Some(parent) = self.get(cursor).and_then(|j| j.link.parent) {
            path.push(parent);
            cursor = parent;
        }
        let old_root = self.get(cursor).ok_or(ArticulationError::StaleHandle)?;
        if old_root.link.grounded {
            return Err(ArticulationError::GroundedReroot(id));
        }
        if path.len() == 1 {
            return Ok(());
        }

        // Reversed links, computed before any link is overwritten.
        let mut reversed = Vec::with_capacity(path.len() - 1);
        for pair in path.windows(2) {
            let (child, parent) = (pair[0], pair[1]);
            let child_joint = self.get(child).ok_or(ArticulationError::StaleHandle)?;
            let parent_joint = self.get(parent).ok_or(ArticulationError::StaleHandle)?;
            let parent_rotation = parent_joint.frame_pose().rotation;
            let omega_rel = child_joint.relative_angular_velocity();
            reversed.push(child_joint.link.reversed(child, &parent_rotation, &omega_rel));
        }

        for (pair, link) in path.windows(2).zip(reversed) {
            let (child, parent) = (pair[0], pair[1]);
            if let Some(p) = self.get_mut(parent) {
                p.children.retain(|&mut c| c != child.index);
                p.link = link;
            }
            if let Some(c) = self.get_mut(child) {
                c.children.push(parent.index);
            }
        }
        if let Some(new_root) = self.get_mut(handle) {
            new_root.link = JointLink::floating_root();
        }
        for root in &mut self.roots {
            if *root == cursor.index {
                *root = handle.index;
            }
        }
        self.rebuild_order();
        Ok(())
    }

    /// Detach a joint from its parent and pin it to the world or let it
    /// float. Used when a grounded root is toggled.
    pub fn set_grounded(&mut self, id: JointId, grounded: bool) -> Result<()> {
        let joint = self.by_id_mut(id).ok_or(ArticulationError::UnknownJoint(id))?;
        if !joint.link.is_root() {
            return Err(ArticulationError::unsupported("non-root", "grounding"));
        }
        if joint.link.grounded == grounded {
            return Ok(());
        }
        let frame = joint.frame_pose();
        joint.link = if grounded {
            let pivot = nalgebra::Point3::from(joint.pivot_world);
            JointLink::grounded_root(&frame, &pivot)
        } else {
            JointLink::floating_root()
        };
        joint.link.dq = Vector3::zeros();
        Ok(())
    }

    /// Recompute pre-order, parent positions, levels and subtree sizes
    /// from the root and child lists.
    fn rebuild_order(&mut self) {
        self.order.clear();
        self.parent_pos.clear();
        let mut stack: Vec<(u32, Option<u32>, usize)> = Vec::new();
        for &root in self.roots.iter().rev() {
            stack.push((root, None, 0));
        }
        while let Some((index, parent, level)) = stack.pop() {
            let pos = self.order.len() as u32;
            self.order.push(index);
            self.parent_pos.push(parent);
            if let Some(joint) = self.slots[index as usize].joint.as_mut() {
                joint.level = level;
                joint.n_subtree = 1;
                for &child in joint.children.iter().rev() {
                    stack.push((child, Some(pos), level + 1));
                }
            }
        }
        for pos in (0..self.order.len()).rev() {
            if let Some(parent) = self.parent_pos[pos] {
                let size = self.at(pos).n_subtree;
                self.at_mut(parent as usize).n_subtree += size;
            }
        }
    }

    /// Check that every subtree is a contiguous interval of the order and
    /// that parents precede children. Debug aid and test oracle.
    #[must_use]
    pub fn check_subtree_invariant(&self) -> bool {
        if self.order.len() != self.ids.len() {
            return false;
        }
        for pos in 0..self.len() {
            if let Some(parent) = self.parent_pos(pos) {
                if parent >= pos {
                    return false;
                }
            }
            let joint = self.at(pos);
            let end = pos + joint.n_subtree;
            if end > self.len() {
                return false;
            }
            // Everything in the interval descends from pos, nothing after it does.
            for inner in pos + 1..end {
                if !self.descends_from(inner, pos) {
                    return false;
                }
            }
            if end < self.len() && self.descends_from(end, pos) {
                return false;
            }
            let children = (pos + 1..end)
                .filter(|&p| self.parent_pos(p) == Some(pos))
                .count();
            if children != joint.children.len() {
                return false;
            }
        }
        true
    }

    fn descends_from(&self, mut pos: usize, ancestor: usize) -> bool {
        while let Some(parent) = self.parent_pos(pos) {
            if parent == ancestor {
                return true;
            }
            pos = parent;
        }
        false
    }

    #[cfg(debug_assertions)]
    pub(crate) fn debug_check(&self) {
        debug_assert!(self.check_subtree_invariant(), "articulation order corrupted");
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn debug_check(&self) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use sim_types::{MassProperties, Pose, RigidBody};

    fn body_at(x: f64) -> RigidBody {
        RigidBody::create(
            &Pose::from_position(Point3::new(x, 0.0, 0.0)),
            &MassProperties::sphere(1.0, 0.1),
        )
    }

    fn add(tree: &mut ArticulationTree, id: i32, parent: Option<i32>) -> JointHandle {
        let x = f64::from(id);
        let link = match parent {
            None => JointLink::floating_root(),
            Some(p) => {
                let handle = tree.handle_of(JointId(p)).unwrap();
                let parent_frame = tree.get(handle).unwrap().frame_pose();
                JointLink::child_of(
                    Some(handle),
                    &parent_frame,
                    &Pose::from_position(Point3::new(x, 0.0, 0.0)),
                    &Point3::new(x - 0.5, 0.0, 0.0),
                )
            }
        };
        tree.insert(Joint::new(JointId(id), body_at(x), link)).unwrap()
    }

    #[test]
    fn test_insert_builds_preorder() {
        let mut tree = ArticulationTree::new();
        add(&mut tree, 0, None);
        add(&mut tree, 1, Some(0));
        add(&mut tree, 2, Some(1));
        add(&mut tree, 3, Some(0));

        let ids: Vec<i32> = tree.iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(tree.at(0).n_subtree(), 4);
        assert_eq!(tree.at(1).n_subtree(), 2);
        assert_eq!(tree.at(2).level(), 2);
        assert_eq!(tree.at(0).n_children(), 2);
        assert!(tree.check_subtree_invariant());
    }

    #[test]
    fn test_duplicate_and_stale() {
        let mut tree = ArticulationTree::new();
        add(&mut tree, 0, None);
        let dup = Joint::new(JointId(0), body_at(0.0), JointLink::floating_root());
        assert!(matches!(
            tree.insert(dup),
            Err(ArticulationError::DuplicateJoint(_))
        ));

        let h = add(&mut tree, 5, Some(0));
        tree.remove(JointId(5)).unwrap();
        assert!(tree.get(h).is_none());
        // Slot reuse bumps the generation.
        let h2 = add(&mut tree, 6, Some(0));
        assert_eq!(h2.index(), h.index());
        assert_ne!(h2.generation(), h.generation());
    }

    #[test]
    fn test_remove_rejects_parent() {
        let mut tree = ArticulationTree::new();
        add(&mut tree, 0, None);
        add(&mut tree, 1, Some(0));
        let err = tree.remove(JointId(0)).unwrap_err();
        assert!(matches!(err, ArticulationError::HasChildren { children: 1, .. }));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_reroot_and_back_restores_structure() {
        let mut tree = ArticulationTree::new();
        add(&mut tree, 0, None);
        add(&mut tree, 1, Some(0));
        add(&mut tree, 2, Some(1));
        add(&mut tree, 3, Some(0));

        let before: Vec<_> = [0, 1, 2, 3]
            .iter()
            .map(|&id| {
                let j = tree.by_id(JointId(id)).unwrap();
                (j.link.parent, j.link.pivot_parent, j.link.pivot_child)
            })
            .collect();

        tree.reroot(JointId(2)).unwrap();
        assert!(tree.check_subtree_invariant());
        assert_eq!(tree.at(0).id, JointId(2));
        assert!(tree.by_id(JointId(2)).unwrap().link.is_root());
        let h2 = tree.handle_of(JointId(2)).unwrap();
        assert_eq!(tree.by_id(JointId(1)).unwrap().link.parent, Some(h2));

        tree.reroot(JointId(0)).unwrap();
        assert!(tree.check_subtree_invariant());
        for (k, &id) in [0, 1, 2, 3].iter().enumerate() {
            let j = tree.by_id(JointId(id)).unwrap();
            if id == 0 {
                assert!(j.link.is_root());
                continue;
            }
            assert_eq!(j.link.parent, before[k].0);
            approx::assert_relative_eq!(j.link.pivot_parent, before[k].1, epsilon = 1e-12);
            approx::assert_relative_eq!(j.link.pivot_child, before[k].2, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_reroot_grounded_rejected() {
        let mut tree = ArticulationTree::new();
        add(&mut tree, 0, None);
        add(&mut tree, 1, Some(0));
        tree.set_grounded(JointId(0), true).unwrap();
        assert!(matches!(
            tree.reroot(JointId(1)),
            Err(ArticulationError::GroundedReroot(_))
        ));
    }

    #[test]
    fn test_forest() {
        let mut tree = ArticulationTree::new();
        add(&mut tree, 0, None);
        add(&mut tree, 10, None);
        add(&mut tree, 1, Some(0));
        add(&mut tree, 11, Some(10));
        assert_eq!(tree.root_positions(), vec![0, 2]);
        assert!(tree.check_subtree_invariant());
    }
}
