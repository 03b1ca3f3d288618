//! Read-only rooted tree with node heights and sample labels.
//!
//! Heights are measured backwards from the most recent sample. A sampled
//! ancestor may be encoded either as a node with a single child (the node
//! itself is the sample) or as a two-child node one of whose children is a
//! zero-length leaf (a direct ancestor).

use crate::error::{BdmmError, Result};

#[derive(Debug, Clone)]
pub struct Node {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub height: f64,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    /// Zero-length leaf whose parent is a sampled ancestor.
    DirectAncestor,
    /// `sample` is the node carrying the sample (this node itself in the
    /// single-child encoding) and `child` the subtree that continues below.
    SampledAncestor { sample: usize, child: usize },
    /// Two descendant lineages; `first` has the smaller node index.
    Birth { first: usize, second: usize },
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    kinds: Vec<NodeKind>,
    root: usize,
    samples: Vec<usize>,
    leaf_count: usize,
    birth_count: usize,
}

impl Tree {
    /// Builds a tree from per-node parent indices (`None` for the root),
    /// heights and optional sample labels.
    pub fn from_parents(
        parents: &[Option<usize>],
        heights: &[f64],
        labels: Vec<Option<String>>,
    ) -> Result<Self> {
        let n = parents.len();
        if n == 0 {
            return Err(invalid("tree has no nodes".to_string()));
        }
        if heights.len() != n || labels.len() != n {
            return Err(invalid(format!(
                "parents ({n}), heights ({}) and labels ({}) must have equal length",
                heights.len(),
                labels.len()
            )));
        }

        let mut nodes: Vec<Node> = heights
            .iter()
            .zip(labels)
            .zip(parents)
            .map(|((&height, label), &parent)| Node {
                parent,
                children: Vec::new(),
                height,
                label,
            })
            .collect();

        let mut root = None;
        for (i, &parent) in parents.iter().enumerate() {
            if !nodes[i].height.is_finite() {
                return Err(invalid(format!("node {i} has non-finite height")));
            }
            match parent {
                None => {
                    if let Some(r) = root {
                        return Err(invalid(format!("nodes {r} and {i} are both roots")));
                    }
                    root = Some(i);
                }
                Some(p) => {
                    if p >= n || p == i {
                        return Err(invalid(format!("node {i} has invalid parent {p}")));
                    }
                    if nodes[p].height < nodes[i].height {
                        return Err(invalid(format!(
                            "node {i} (height {}) is above its parent {p} (height {})",
                            nodes[i].height, nodes[p].height
                        )));
                    }
                    nodes[p].children.push(i);
                }
            }
        }
        let root = root.ok_or_else(|| invalid("tree has no root".to_string()))?;

        for (i, node) in nodes.iter_mut().enumerate() {
            if node.children.len() > 2 {
                return Err(invalid(format!(
                    "node {i} has {} children; only binary trees are supported",
                    node.children.len()
                )));
            }
            node.children.sort_unstable();
        }

        // Every node must reach the root without revisiting itself.
        for start in 0..n {
            let mut current = start;
            let mut steps = 0;
            while let Some(p) = nodes[current].parent {
                current = p;
                steps += 1;
                if steps > n {
                    return Err(invalid(format!("node {start} is part of a cycle")));
                }
            }
        }

        let is_direct_ancestor = |i: usize| -> bool {
            let node = &nodes[i];
            node.children.is_empty()
                && node
                    .parent
                    .map(|p| nodes[p].height == node.height && nodes[p].children.len() == 2)
                    .unwrap_or(false)
        };

        let mut kinds = Vec::with_capacity(n);
        for (i, node) in nodes.iter().enumerate() {
            let kind = match node.children.as_slice() {
                [] if is_direct_ancestor(i) => NodeKind::DirectAncestor,
                [] => NodeKind::Leaf,
                [child] => NodeKind::SampledAncestor {
                    sample: i,
                    child: *child,
                },
                [a, b] => match (is_direct_ancestor(*a), is_direct_ancestor(*b)) {
                    (true, true) => {
                        return Err(invalid(format!(
                            "node {i} has two zero-length leaf children"
                        )));
                    }
                    (true, false) => NodeKind::SampledAncestor {
                        sample: *a,
                        child: *b,
                    },
                    (false, true) => NodeKind::SampledAncestor {
                        sample: *b,
                        child: *a,
                    },
                    (false, false) => NodeKind::Birth {
                        first: *a.min(b),
                        second: *a.max(b),
                    },
                },
                _ => unreachable!("child count checked above"),
            };
            kinds.push(kind);
        }

        let samples: Vec<usize> = (0..n)
            .filter(|&i| match kinds[i] {
                NodeKind::Leaf | NodeKind::DirectAncestor => true,
                NodeKind::SampledAncestor { sample, .. } => sample == i,
                NodeKind::Birth { .. } => false,
            })
            .collect();
        let leaf_count = nodes.iter().filter(|n| n.children.is_empty()).count();
        let birth_count = kinds
            .iter()
            .filter(|k| matches!(k, NodeKind::Birth { .. }))
            .count();

        Ok(Self {
            nodes,
            kinds,
            root,
            samples,
            leaf_count,
            birth_count,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    pub fn kind(&self, i: usize) -> NodeKind {
        self.kinds[i]
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn height(&self, i: usize) -> f64 {
        self.nodes[i].height
    }

    /// Length of the edge above node `i`; zero for the root.
    pub fn edge_length(&self, i: usize) -> f64 {
        match self.nodes[i].parent {
            Some(p) => self.nodes[p].height - self.nodes[i].height,
            None => 0.0,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Nodes that carry a sample: leaves, direct ancestors and single-child
    /// sampled ancestors.
    pub fn samples(&self) -> &[usize] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn birth_count(&self) -> usize {
        self.birth_count
    }

    /// Node indices with every child before its parent.
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            for &child in self.nodes[node].children.iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Total branch length below each node, including the edge above it. The
    /// root's weight excludes its (non-existent) parent edge.
    pub fn subtree_weights(&self) -> Vec<f64> {
        let mut weights = vec![0.0; self.nodes.len()];
        for node in self.post_order() {
            let below: f64 = self.nodes[node].children.iter().map(|&c| weights[c]).sum();
            weights[node] = below + self.edge_length(node);
        }
        weights
    }
}

fn invalid(msg: String) -> BdmmError {
    BdmmError::InvalidTree(msg)
}
