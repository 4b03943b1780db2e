//! Point-region octree of irradiance samples.
//!
//! Nodes are created only on demand along the path implied by a [`NodeId`].
//! The root is not a fixed world box: it grows upward whenever an insert
//! falls outside its cube.
//!
//! The tree is loose. A sample sits in the cell holding its centre, and that
//! cell's edge is at least the diameter of the sample's reuse sphere, so the
//! sphere stays inside the cube grown by half an edge. A lookup only enters
//! cells whose grown cube holds the query point. That is at most two cells
//! per axis on each level, so a query touches O(log(extent / cell)) nodes
//! however the samples fall against the grid.

use std::ops::ControlFlow;

use glam::Vec3;

use crate::block::Block;
use crate::error::{CacheError, CacheResult};
use crate::node_id::{NodeId, MAX_SIZE};

/// Receives candidate blocks during [`Octree::traverse`].
pub trait BlockVisitor {
    /// Inspect one block. Returning `Break` ends the traversal.
    fn visit(&mut self, block: &Block) -> ControlFlow<()>;
}

impl<F> BlockVisitor for F
where
    F: FnMut(&Block) -> ControlFlow<()>,
{
    fn visit(&mut self, block: &Block) -> ControlFlow<()> {
        self(block)
    }
}

/// A cube of space with the samples stored at its resolution.
#[derive(Debug)]
pub struct OctreeNode {
    id: NodeId,
    blocks: Vec<Block>,
    children: [Option<Box<OctreeNode>>; 8],
}

impl OctreeNode {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            blocks: Vec::new(),
            children: Default::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Populated child slots.
    pub fn children(&self) -> impl Iterator<Item = &OctreeNode> {
        self.children.iter().flatten().map(|c| &**c)
    }
}

/// The sample tree.
#[derive(Debug, Default)]
pub struct Octree {
    root: Option<Box<OctreeNode>>,
    node_count: usize,
    block_count: usize,
}

impl Octree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root.as_ref().map(|r| r.id)
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    /// Append `block` to the node `id`, creating the node and any missing
    /// ancestors.
    ///
    /// The tree is only touched once the id has been validated, so a failed
    /// insert leaves it unchanged.
    pub fn insert(&mut self, block: Block, id: NodeId) -> CacheResult<()> {
        if !id.is_valid() {
            return Err(CacheError::InvalidNodeId(id));
        }

        let mut root = match self.root.take() {
            Some(root) => root,
            None => {
                let mut node = OctreeNode::new(id);
                node.blocks.push(block);
                self.root = Some(Box::new(node));
                self.node_count = 1;
                self.block_count = 1;
                return Ok(());
            }
        };

        // Grow until the root cube encloses the target cell.
        while !root.id.contains(&id) {
            if root.id.size >= MAX_SIZE {
                self.root = Some(root);
                return Err(CacheError::InvalidNodeId(id));
            }
            let mut parent = OctreeNode::new(root.id.parent());
            let slot = parent.id.child_index(&root.id);
            parent.children[slot] = Some(root);
            root = Box::new(parent);
            self.node_count += 1;
        }

        let mut created = 0;
        let mut node: &mut OctreeNode = &mut root;
        while node.id.size > id.size {
            let slot = node.id.child_index(&id);
            let child_id = node.id.child(slot);
            node = node.children[slot]
                .get_or_insert_with(|| {
                    created += 1;
                    Box::new(OctreeNode::new(child_id))
                })
                .as_mut();
        }
        node.blocks.push(block);

        self.node_count += created;
        self.block_count += 1;
        self.root = Some(root);
        Ok(())
    }

    /// Visit every block with `bounce_depth <= max_bounce_depth` whose cell
    /// loosely contains `point`.
    ///
    /// Children are visited before their parent, so within a branch the
    /// smallest cells come first.
    pub fn traverse<V>(&self, point: Vec3, max_bounce_depth: u32, visitor: &mut V) -> ControlFlow<()>
    where
        V: BlockVisitor + ?Sized,
    {
        match self.root.as_deref() {
            Some(root) => {
                let leaf = NodeId::from_point(point, 0.0);
                visit_node(root, &leaf, max_bounce_depth, visitor)
            }
            None => ControlFlow::Continue(()),
        }
    }

    /// Nodes in depth-first pre-order.
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes {
            stack: self.root.as_deref().into_iter().collect(),
        }
    }

    /// Every stored block with the id of the node that owns it.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Block)> {
        self.nodes()
            .flat_map(|node| node.blocks.iter().map(move |block| (node.id, block)))
    }

    /// Release every node and block.
    pub fn clear(&mut self) {
        self.root = None;
        self.node_count = 0;
        self.block_count = 0;
    }
}

fn visit_node<V>(node: &OctreeNode, leaf: &NodeId, max_bounce_depth: u32, visitor: &mut V) -> ControlFlow<()>
where
    V: BlockVisitor + ?Sized,
{
    if !node.id.loosely_contains(leaf) {
        return ControlFlow::Continue(());
    }
    for child in node.children() {
        visit_node(child, leaf, max_bounce_depth, visitor)?;
    }
    for block in node.blocks.iter().filter(|b| b.bounce_depth <= max_bounce_depth) {
        visitor.visit(block)?;
    }
    ControlFlow::Continue(())
}

/// Pre-order node iterator returned by [`Octree::nodes`].
pub struct Nodes<'a> {
    stack: Vec<&'a OctreeNode>,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a OctreeNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack
            .extend(node.children.iter().rev().flatten().map(|c| &**c));
        Some(node)
    }
}
