use std::collections::{BTreeMap, BTreeSet};
use std::ops::Index;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::graph::{Graph, NodeIndex, ValueIndex};

/// Inclusive node range `[from, to]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MergeKey {
    pub from: usize,
    pub to: usize,
}

impl MergeKey {
    pub fn new(from: usize, to: usize) -> MergeKey {
        MergeKey { from, to }
    }

    pub fn contains(&self, node: NodeIndex) -> bool {
        self.from <= node.0 && node.0 <= self.to
    }

    pub fn len(&self) -> usize {
        self.to - self.from + 1
    }
}

crate::new_index_type!(pub, CompositeIndex);

/// A contiguous node range merged into one unit. Values that are produced and consumed only inside
/// the range are not part of its interface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Composite {
    pub id: String,
    pub key: MergeKey,
    pub inputs: BTreeSet<ValueIndex>,
    pub outputs: BTreeSet<ValueIndex>,
    pub params: BTreeSet<ValueIndex>,

    pub param_size: u64,
    pub input_size: u64,
    pub output_size: u64,
    pub flops: u64,
}

impl Composite {
    fn from_node(g: &Graph, i: usize) -> Composite {
        let node = &g[NodeIndex(i)];
        let key = MergeKey::new(i, i);
        Composite::with_values(
            g, key,
            node.inputs.iter().copied().collect(),
            node.outputs.iter().copied().collect(),
            node.params.iter().copied().collect(),
            node.flops
        )
    }

    /// `base` covers `[from, m]` and `next` covers `[m+1, to]`.
    fn combine(g: &Graph, base: &Composite, next: &Composite) -> Composite {
        debug_assert_eq!(base.key.to + 1, next.key.from);
        let key = MergeKey::new(base.key.from, next.key.to);

        let inputs = base.inputs.union(&next.inputs)
            .filter(|&&v| !g.producer(v).map(|p| key.contains(p)).unwrap_or(false))
            .copied().collect();

        // model outputs (no consumers) always stay visible
        let outputs = base.outputs.union(&next.outputs)
            .filter(|&&v| g.consumers(v).is_empty() || g.consumers(v).iter().any(|&c| !key.contains(c)))
            .copied().collect();

        let params = base.params.union(&next.params).copied().collect();

        Composite::with_values(g, key, inputs, outputs, params, base.flops + next.flops)
    }

    fn with_values(g: &Graph, key: MergeKey, inputs: BTreeSet<ValueIndex>, outputs: BTreeSet<ValueIndex>, params: BTreeSet<ValueIndex>, flops: u64) -> Composite {
        Composite {
            id: format!("MERGE_{}_{}", key.from, key.to),
            key,
            param_size: g.total_size(&params),
            input_size: g.total_size(&inputs),
            output_size: g.total_size(&outputs),
            inputs, outputs, params, flops
        }
    }
}

/// Memoized composites of contiguous node ranges. Entry `i` of the arena is always `[i, i]`.
pub struct MergeCache<'g> {
    graph: &'g Graph,
    arena: Vec<Rc<Composite>>,
    index: BTreeMap<MergeKey, CompositeIndex>,
}

impl<'g> Index<CompositeIndex> for MergeCache<'g> {
    type Output = Rc<Composite>;

    fn index(&self, index: CompositeIndex) -> &Self::Output {
        &self.arena[index.0]
    }
}

impl<'g> MergeCache<'g> {
    pub fn new(graph: &'g Graph) -> MergeCache<'g> {
        let arena: Vec<_> = (0..graph.n_nodes()).map(|i| Rc::new(Composite::from_node(graph, i))).collect();
        let index = (0..graph.n_nodes()).map(|i| (MergeKey::new(i, i), CompositeIndex(i))).collect();
        MergeCache { graph, arena, index }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn node(&self, i: usize) -> &Rc<Composite> {
        &self.arena[i]
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, from: usize, to: usize) -> Option<&Rc<Composite>> {
        self.index.get(&MergeKey::new(from, to)).map(|&i| &self[i])
    }

    /// Composite of nodes `from..=to`, extending the longest cached range starting at `from`.
    pub fn merge(&mut self, from: usize, to: usize) -> CompositeIndex {
        assert!(from <= to && to < self.graph.n_nodes(), "merge range [{from}, {to}] outside of {} nodes", self.graph.n_nodes());

        let key = MergeKey::new(from, to);
        if let Some(&i) = self.index.get(&key) {
            return i
        }

        // [from, from] is always present, so this stops
        let mut avail_to = to - 1;
        while !self.index.contains_key(&MergeKey::new(from, avail_to)) {
            avail_to -= 1
        }

        let mut base = self.index[&MergeKey::new(from, avail_to)];
        for i in avail_to+1..=to {
            let merged = Composite::combine(self.graph, &self.arena[base.0], &self.arena[i]);
            trace!("merged {} (in={} out={} param={})", merged.id, merged.input_size, merged.output_size, merged.param_size);

            base = CompositeIndex(self.arena.len());
            self.index.insert(merged.key, base);
            self.arena.push(Rc::new(merged));
        }

        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, Value, ValueKind};

    #[test]
    fn single_node_keeps_metrics() {
        let g = Graph::chain(&[(5, 10, 4), (7, 20, 8), (9, 30, 2)]);
        let mut cache = MergeCache::new(&g);
        for i in 0..3 {
            let c = cache.merge(i, i);
            assert_eq!(cache[c].param_size, g.param_size(NodeIndex(i)));
            assert_eq!(cache[c].input_size, g.input_size(NodeIndex(i)));
            assert_eq!(cache[c].output_size, g.output_size(NodeIndex(i)));
            assert_eq!(cache[c].id, format!("MERGE_{i}_{i}"));
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn prunes_internal_values() {
        let g = Graph::chain(&[(5, 10, 4), (7, 20, 8), (9, 30, 2)]);
        let mut cache = MergeCache::new(&g);
        let c = cache.merge(0, 1);
        assert_eq!(cache[c].param_size, 30);
        assert_eq!(cache[c].input_size, 4); // the model input
        assert_eq!(cache[c].output_size, 8); // act_0 stays inside
        assert_eq!(cache[c].flops, 12);

        let all = cache.merge(0, 2);
        assert_eq!(cache[all].output_size, 2);
        assert_eq!(cache[all].param_size, 60);
    }

    #[test]
    fn extends_cached_prefix() {
        let g = Graph::chain(&[(1, 1, 1); 5]);
        let mut cache = MergeCache::new(&g);
        cache.merge(1, 3);
        assert_eq!(cache.len(), 5 + 2);
        assert!(cache.get(1, 2).is_some());

        cache.merge(1, 4);
        assert_eq!(cache.len(), 5 + 3); // only [1, 4] is new
    }

    #[test]
    fn merge_is_idempotent() {
        let g = Graph::chain(&[(3, 7, 5), (4, 9, 6), (5, 11, 7), (6, 13, 8)]);
        let mut cache = MergeCache::new(&g);
        let a = cache.merge(1, 3);
        let snapshot = Composite::clone(&cache[a]);
        cache.merge(0, 3);
        let b = cache.merge(1, 3);
        assert_eq!(a, b);
        assert_eq!(*cache[b], snapshot);
    }

    #[test]
    fn keeps_values_consumed_outside() {
        // a -> b, a -> c: merging [a, b] must still export a's output for c
        let values = vec![
            Value { name: "x".into(), size: 3, kind: ValueKind::Activation },
            Value { name: "y".into(), size: 5, kind: ValueKind::Activation },
            Value { name: "z".into(), size: 7, kind: ValueKind::Activation },
            Value { name: "w".into(), size: 11, kind: ValueKind::Parameter },
        ];
        let a = Node { name: "a".into(), inputs: smallvec::smallvec![ValueIndex(0)], outputs: smallvec::smallvec![ValueIndex(1)], params: smallvec::smallvec![ValueIndex(3)], flops: 1 };
        let b = Node { name: "b".into(), inputs: smallvec::smallvec![ValueIndex(1)], outputs: smallvec::smallvec![ValueIndex(2)], params: smallvec::smallvec![ValueIndex(3)], flops: 1 };
        let c = Node { name: "c".into(), inputs: smallvec::smallvec![ValueIndex(1), ValueIndex(2)], outputs: smallvec::smallvec![], params: smallvec::smallvec![], flops: 1 };
        let g = Graph::new(vec![a, b, c], values).unwrap();

        let mut cache = MergeCache::new(&g);
        let ab = cache.merge(0, 1);
        assert_eq!(cache[ab].output_size, 5 + 7);
        assert_eq!(cache[ab].param_size, 11); // shared parameter counted once

        let bc = cache.merge(1, 2);
        assert_eq!(cache[bc].input_size, 5);
    }

    #[test]
    #[should_panic]
    fn out_of_range_is_fatal() {
        let g = Graph::chain(&[(1, 1, 1); 2]);
        MergeCache::new(&g).merge(0, 2);
    }
}
