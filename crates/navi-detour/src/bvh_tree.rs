//! Bounding volume tree over the polygons of one tile
//!
//! The tree is stored flat in depth-first order. A leaf holds one polygon; an
//! internal node stores the size of its subtree so that a query can skip the
//! whole subtree when the node's bounds miss.

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// Inverted box that any `expand` replaces
    pub fn empty() -> Self {
        Self {
            min: [f32::MAX; 3],
            max: [f32::MIN; 3],
        }
    }

    pub fn expand(&mut self, other: &Aabb) {
        for k in 0..3 {
            self.min[k] = self.min[k].min(other.min[k]);
            self.max[k] = self.max[k].max(other.max[k]);
        }
    }

    /// Touching boxes overlap
    pub fn overlaps(&self, other: &Aabb) -> bool {
        navi_common::overlap_bounds(&self.min, &self.max, &other.min, &other.max)
    }

    fn mid(&self, axis: usize) -> f32 {
        (self.min[axis] + self.max[axis]) * 0.5
    }

    fn longest_axis(&self) -> usize {
        let extent = |k: usize| self.max[k] - self.min[k];
        let (x, y, z) = (extent(0), extent(1), extent(2));
        if x >= y && x >= z {
            0
        } else if y >= z {
            1
        } else {
            2
        }
    }
}

/// Polygon entry used to build a tree
#[derive(Debug, Clone, Copy)]
pub struct BVHItem {
    /// Polygon index inside the tile
    pub poly: usize,
    pub bounds: Aabb,
}

#[derive(Debug, Clone, Copy)]
enum BVNode {
    Leaf { bounds: Aabb, poly: usize },
    /// `escape` counts this node and all nodes below it
    Internal { bounds: Aabb, escape: usize },
}

/// Flattened bounding volume tree
#[derive(Debug, Clone, Default)]
pub struct BVHTree {
    nodes: Vec<BVNode>,
}

impl BVHTree {
    /// Builds the tree by median splits along the longest axis
    pub fn build(mut items: Vec<BVHItem>) -> Self {
        let mut nodes = Vec::with_capacity(items.len() * 2);
        if !items.is_empty() {
            subdivide(&mut items, &mut nodes);
        }
        Self { nodes }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Appends the indices of all polygons whose bounds overlap `query`
    pub fn query_into(&self, query: &Aabb, results: &mut Vec<usize>) {
        let mut i = 0;
        while i < self.nodes.len() {
            match self.nodes[i] {
                BVNode::Leaf { bounds, poly } => {
                    if bounds.overlaps(query) {
                        results.push(poly);
                    }
                    i += 1;
                }
                BVNode::Internal { bounds, escape } => {
                    i += if bounds.overlaps(query) { 1 } else { escape };
                }
            }
        }
    }

    pub fn query(&self, query: &Aabb) -> Vec<usize> {
        let mut results = Vec::new();
        self.query_into(query, &mut results);
        results
    }
}

fn subdivide(items: &mut [BVHItem], nodes: &mut Vec<BVNode>) {
    if let [item] = items {
        nodes.push(BVNode::Leaf {
            bounds: item.bounds,
            poly: item.poly,
        });
        return;
    }

    let mut bounds = Aabb::empty();
    for item in items.iter() {
        bounds.expand(&item.bounds);
    }
    let axis = bounds.longest_axis();
    items.sort_by(|a, b| {
        a.bounds
            .mid(axis)
            .total_cmp(&b.bounds.mid(axis))
            .then(a.poly.cmp(&b.poly))
    });

    let at = nodes.len();
    nodes.push(BVNode::Internal { bounds, escape: 0 });
    let (left, right) = items.split_at_mut(items.len() / 2);
    subdivide(left, nodes);
    subdivide(right, nodes);
    nodes[at] = BVNode::Internal {
        bounds,
        escape: nodes.len() - at,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_items(n: usize) -> Vec<BVHItem> {
        (0..n)
            .map(|i| {
                let x = (i % 8) as f32 * 2.0;
                let z = (i / 8) as f32 * 2.0;
                BVHItem {
                    poly: i,
                    bounds: Aabb::new([x, 0.0, z], [x + 2.0, 0.5, z + 2.0]),
                }
            })
            .collect()
    }

    #[test]
    fn test_touching_boxes_overlap() {
        let a = Aabb::new([0.0; 3], [1.0; 3]);
        assert!(a.overlaps(&Aabb::new([1.0; 3], [2.0; 3])));
        assert!(!a.overlaps(&Aabb::new([2.0; 3], [3.0; 3])));
    }

    #[test]
    fn test_query_matches_brute_force() {
        let items = grid_items(40);
        let tree = BVHTree::build(items.clone());
        assert_eq!(tree.node_count(), 79);

        for query in [
            Aabb::new([3.0, -1.0, 3.0], [6.5, 1.0, 4.5]),
            Aabb::new([-5.0, -1.0, -5.0], [0.5, 1.0, 0.5]),
            Aabb::new([0.0, 2.0, 0.0], [16.0, 3.0, 10.0]),
        ] {
            let mut found = tree.query(&query);
            found.sort_unstable();
            let expected: Vec<usize> = items
                .iter()
                .filter(|item| item.bounds.overlaps(&query))
                .map(|item| item.poly)
                .collect();
            assert_eq!(found, expected);
        }
    }

    #[test]
    fn test_single_and_empty_trees() {
        let tree = BVHTree::build(Vec::new());
        assert!(tree.query(&Aabb::new([0.0; 3], [1.0; 3])).is_empty());

        let tree = BVHTree::build(grid_items(1));
        assert_eq!(tree.node_count(), 1);
        let p = [1.0, 0.25, 1.0];
        assert_eq!(tree.query(&Aabb::new(p, p)), vec![0]);
    }
}
