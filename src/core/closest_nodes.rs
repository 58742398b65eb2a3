use std::vec::IntoIter;

use crate::common::{Id, Node};

#[derive(Debug, Clone)]
/// Nodes sorted by their XOR distance to a target, without duplicate ids.
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    /// Insert a node at its sorted position, ignoring ids already present.
    pub fn add(&mut self, node: Node) {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return;
        }

        let seek = node.id.xor(&self.target);

        let pos = match self
            .nodes
            .binary_search_by(|probe| probe.id.xor(&self.target).cmp(&seek))
        {
            Ok(pos) | Err(pos) => pos,
        };

        self.nodes.insert(pos, node);
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
