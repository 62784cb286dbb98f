//! Node pool and open list for the polygon search
//!
//! Nodes live in a fixed-capacity arena and are addressed by index, so the
//! open list can refer to them without borrowing the pool.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use super::PolyRef;

/// Node flags for search state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    pub const OPEN: NodeFlags = NodeFlags(0x01);
    pub const CLOSED: NodeFlags = NodeFlags(0x02);

    pub fn contains(&self, flag: NodeFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: NodeFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: NodeFlags) {
        self.0 &= !flag.0;
    }
}

/// Node index type
pub type NodeIndex = u32;

/// Null node index constant
pub const NULL_IDX: NodeIndex = NodeIndex::MAX;

/// Node in the search graph, one per visited polygon
#[derive(Debug, Clone)]
pub struct Node {
    /// Position the search reached the polygon at
    pub pos: [f32; 3],
    /// Cost from the start polygon to this node
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    /// Index of the parent node
    pub parent: NodeIndex,
    pub flags: NodeFlags,
    /// Polygon the node corresponds to
    pub poly: PolyRef,
}

impl Node {
    fn new(poly: PolyRef) -> Self {
        Self {
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            parent: NULL_IDX,
            flags: NodeFlags::default(),
            poly,
        }
    }
}

/// Fixed-capacity node storage keyed by polygon
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    lookup: HashMap<PolyRef, NodeIndex>,
    max_nodes: usize,
}

impl NodePool {
    /// Creates a new node pool
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(max_nodes.min(4096)),
            lookup: HashMap::new(),
            max_nodes,
        }
    }

    /// Clears the pool, keeping its allocations
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
    }

    /// Gets or allocates the node for a polygon
    ///
    /// Returns `None` once the pool is exhausted.
    pub fn get_node(&mut self, poly: PolyRef) -> Option<NodeIndex> {
        if let Some(&idx) = self.lookup.get(&poly) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let idx = self.nodes.len() as NodeIndex;
        self.nodes.push(Node::new(poly));
        self.lookup.insert(poly, idx);
        Some(idx)
    }

    /// Finds the node for a polygon without allocating
    pub fn find_node(&self, poly: PolyRef) -> Option<NodeIndex> {
        self.lookup.get(&poly).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx as usize]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx as usize]
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Polygons from the root to `idx`, root first
    pub fn path_to(&self, idx: NodeIndex) -> Vec<PolyRef> {
        let mut path = Vec::new();
        let mut cur = idx;
        while cur != NULL_IDX {
            let node = self.node(cur);
            path.push(node.poly);
            cur = node.parent;
        }
        path.reverse();
        path
    }
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    total: f32,
    seq: u64,
    node: NodeIndex,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the max-heap pops the cheapest node, oldest first on ties.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .total
            .total_cmp(&self.total)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Open list ordered by total cost
///
/// Re-pushing a node with a lower cost leaves the old entry behind; stale
/// entries are skipped on pop by comparing against the node's current cost.
#[derive(Debug, Default)]
pub struct NodeQueue {
    heap: BinaryHeap<HeapEntry>,
    seq: u64,
}

impl NodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.seq = 0;
    }

    /// Pushes or re-prioritises a node
    pub fn push(&mut self, pool: &NodePool, idx: NodeIndex) {
        self.seq += 1;
        self.heap.push(HeapEntry {
            total: pool.node(idx).total,
            seq: self.seq,
            node: idx,
        });
    }

    /// Pops the cheapest open node
    pub fn pop(&mut self, pool: &NodePool) -> Option<NodeIndex> {
        while let Some(entry) = self.heap.pop() {
            let node = pool.node(entry.node);
            if node.flags.contains(NodeFlags::OPEN) && node.total == entry.total {
                return Some(entry.node);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_pool() {
        let mut pool = NodePool::new(2);

        let a = pool.get_node(PolyRef::new(1)).unwrap();
        assert_eq!(pool.node(a).poly, PolyRef::new(1));
        assert_eq!(pool.get_node(PolyRef::new(1)), Some(a));
        assert_eq!(pool.find_node(PolyRef::new(1)), Some(a));

        let b = pool.get_node(PolyRef::new(2)).unwrap();
        assert_ne!(a, b);

        // Exhausted
        assert!(pool.get_node(PolyRef::new(3)).is_none());
        assert!(pool.find_node(PolyRef::new(3)).is_none());

        pool.clear();
        assert_eq!(pool.node_count(), 0);
        assert!(pool.get_node(PolyRef::new(3)).is_some());
    }

    #[test]
    fn test_path_to() {
        let mut pool = NodePool::new(8);
        let a = pool.get_node(PolyRef::new(1)).unwrap();
        let b = pool.get_node(PolyRef::new(2)).unwrap();
        let c = pool.get_node(PolyRef::new(3)).unwrap();
        pool.node_mut(b).parent = a;
        pool.node_mut(c).parent = b;
        assert_eq!(
            pool.path_to(c),
            vec![PolyRef::new(1), PolyRef::new(2), PolyRef::new(3)]
        );
    }

    #[test]
    fn test_node_queue() {
        let mut pool = NodePool::new(16);
        let mut queue = NodeQueue::new();

        for (id, total) in [(1, 5.0), (2, 3.0), (3, 7.0)] {
            let idx = pool.get_node(PolyRef::new(id)).unwrap();
            let node = pool.node_mut(idx);
            node.total = total;
            node.flags.insert(NodeFlags::OPEN);
            queue.push(&pool, idx);
        }

        // Lower the cost of node 3; its old entry goes stale.
        let idx3 = pool.find_node(PolyRef::new(3)).unwrap();
        pool.node_mut(idx3).total = 1.0;
        queue.push(&pool, idx3);

        let order: Vec<u64> = std::iter::from_fn(|| {
            queue.pop(&pool).map(|idx| {
                pool.node_mut(idx).flags.remove(NodeFlags::OPEN);
                pool.node(idx).poly.id()
            })
        })
        .collect();
        assert_eq!(order, vec![3, 2, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_equal_costs_pop_in_insertion_order() {
        let mut pool = NodePool::new(4);
        let mut queue = NodeQueue::new();
        for id in [4, 2, 9] {
            let idx = pool.get_node(PolyRef::new(id)).unwrap();
            pool.node_mut(idx).total = 2.0;
            pool.node_mut(idx).flags.insert(NodeFlags::OPEN);
            queue.push(&pool, idx);
        }
        let first = queue.pop(&pool).unwrap();
        assert_eq!(pool.node(first).poly, PolyRef::new(4));
    }
}
