//! Hierarchical density based clustering.
//!
//! The implementation follows the usual steps: core distances, a minimum spanning tree
//! of mutual reachability distances, single linkage, condensation of the hierarchy with
//! the minimum cluster size, stability based selection and labelling. Every point is
//! compared to every other point so memory stays linear but time is quadratic.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::result::Result;
use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::error::{DegenerateClusterError, DependencyMissingError, SortingError, invalid_parameter};
use crate::peaks::NOISE_LABEL;


/// How flat clusters are picked from the condensed tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSelectionMethod {
    /// Excess of mass, clusters with the largest persistence
    #[serde(alias = "eom")]
    ExcessOfMass,
    /// Leaves of the cluster tree
    Leaf,
}

/// Density clustering parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hdbscan {
    /// Smallest group of points considered a cluster
    pub min_cluster_size: usize,
    /// Neighbour count for core distances, defaults to `min_cluster_size`
    pub min_samples: Option<usize>,
    /// Whether the whole data set may be returned as one cluster
    pub allow_single_cluster: bool,
    pub cluster_selection_method: ClusterSelectionMethod,
    /// Clusters born below this distance are merged into their parent
    pub cluster_selection_epsilon: f64,
}

impl Default for Hdbscan {
    fn default() -> Self {
        Hdbscan {
            min_cluster_size: 5,
            min_samples: None,
            allow_single_cluster: false,
            cluster_selection_method: ClusterSelectionMethod::ExcessOfMass,
            cluster_selection_epsilon: 0.,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

/// Condensed hierarchy, nodes below `num_points` are points and clusters are numbered
/// from `num_points` (the root) upwards with children numbered after their parents
struct CondensedTree {
    num_points: usize,
    num_clusters: usize,
    edges: Vec<CondensedEdge>,
}

impl CondensedTree {
    fn root(&self) -> usize {
        self.num_points
    }

    fn cluster_index(&self, cluster: usize) -> usize {
        cluster - self.num_points
    }

    /// Parent of each cluster, `None` for the root
    fn cluster_parents(&self) -> Vec<Option<usize>> {
        let mut parents = vec![None; self.num_clusters];
        for edge in self.edges.iter().filter(|edge| edge.child >= self.num_points) {
            parents[self.cluster_index(edge.child)] = Some(edge.parent);
        }

        parents
    }

    /// Lambda at which each cluster appears, zero for the root
    fn birth_lambdas(&self) -> Vec<f64> {
        let mut births = vec![0.; self.num_clusters];
        for edge in self.edges.iter().filter(|edge| edge.child >= self.num_points) {
            births[self.cluster_index(edge.child)] = edge.lambda;
        }

        births
    }

    fn child_clusters(&self) -> Vec<Vec<usize>> {
        let mut children = vec![Vec::new(); self.num_clusters];
        for edge in self.edges.iter().filter(|edge| edge.child >= self.num_points) {
            children[self.cluster_index(edge.parent)].push(edge.child);
        }

        children
    }

    fn stabilities(&self) -> Vec<f64> {
        let births = self.birth_lambdas();
        let mut stability = vec![0.; self.num_clusters];

        for edge in &self.edges {
            let parent = self.cluster_index(edge.parent);
            stability[parent] += (edge.lambda - births[parent]) * edge.size as f64;
        }

        stability
    }

    /// Clusters strictly below `cluster`
    fn descendants(&self, cluster: usize, children: &[Vec<usize>]) -> Vec<usize> {
        let mut found = Vec::new();
        let mut stack = children[self.cluster_index(cluster)].clone();

        while let Some(node) = stack.pop() {
            found.push(node);
            stack.extend(children[self.cluster_index(node)].iter().copied());
        }

        found
    }
}

fn distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64 - *y as f64).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Distance to the `min_samples`-th nearest neighbour, the point itself included
fn core_distances(data: ArrayView2<f32>, min_samples: usize) -> Vec<f64> {
    let n = data.nrows();

    (0..n).into_par_iter()
        .map(|i| {
            let mut distances: Vec<f64> = (0..n)
                .map(|j| distance(data.row(i), data.row(j)))
                .collect();
            let k = min_samples.clamp(1, n) - 1;
            let (_, kth, _) = distances.select_nth_unstable_by(k, |a, b| a.total_cmp(b));

            *kth
        })
        .collect()
}

/// Prim's algorithm over the complete mutual reachability graph
fn minimum_spanning_tree(data: ArrayView2<f32>, core: &[f64]) -> Vec<(usize, usize, f64)> {
    let n = data.nrows();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut source = vec![0; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut current = 0;
    in_tree[current] = true;

    for _ in 1..n {
        let tree = &in_tree;
        best.par_iter_mut()
            .zip(source.par_iter_mut())
            .enumerate()
            .filter(|(j, _)| !tree[*j])
            .for_each(|(j, (best, source))| {
                let reachability = distance(data.row(current), data.row(j))
                    .max(core[current])
                    .max(core[j]);

                if reachability < *best {
                    *best = reachability;
                    *source = current;
                }
            });

        let mut next = None;
        for j in (0..n).filter(|j| !in_tree[*j]) {
            match next {
                Some(k) if best[k] <= best[j] => {},
                _ => next = Some(j),
            }
        }

        let next = match next {
            Some(next) => next,
            None => break,
        };

        edges.push((source[next], next, best[next]));
        in_tree[next] = true;
        current = next;
    }

    edges
}

/// Merges points along sorted edges, returns `(left, right, distance, size)` rows where
/// the merged node of row `i` is numbered `n + i`
fn single_linkage(n: usize, mut edges: Vec<(usize, usize, f64)>) -> Vec<(usize, usize, f64, usize)> {
    edges.sort_by(|a, b| a.2.total_cmp(&b.2));

    let mut parent: Vec<usize> = (0..2 * n).collect();
    let mut size = vec![1; 2 * n];
    let mut linkage = Vec::with_capacity(edges.len());

    fn find(parent: &mut [usize], mut node: usize) -> usize {
        let mut root = node;
        while parent[root] != root {
            root = parent[root];
        }
        while parent[node] != root {
            let next = parent[node];
            parent[node] = root;
            node = next;
        }

        root
    }

    for (a, b, delta) in edges {
        let left = find(&mut parent, a);
        let right = find(&mut parent, b);
        let merged = n + linkage.len();

        linkage.push((left, right, delta, size[left] + size[right]));
        size[merged] = size[left] + size[right];
        parent[left] = merged;
        parent[right] = merged;
    }

    linkage
}

fn condense_tree(linkage: &[(usize, usize, f64, usize)], n: usize, min_cluster_size: usize) -> CondensedTree {
    let node_size = |node: usize| if node < n { 1 } else { linkage[node - n].3 };

    let leaves_of = |node: usize| {
        let mut leaves = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if current < n {
                leaves.push(current);
            } else {
                let (left, right, _, _) = linkage[current - n];
                stack.push(right);
                stack.push(left);
            }
        }

        leaves
    };

    let top = n + linkage.len() - 1;
    let mut relabel = vec![0; n + linkage.len()];
    relabel[top] = n;
    let mut next_label = n + 1;
    let mut edges = Vec::new();

    let mut queue = VecDeque::from([top]);
    while let Some(node) = queue.pop_front() {
        let (left, right, delta, _) = linkage[node - n];
        let lambda = 1. / delta.max(1e-12);
        let parent = relabel[node];
        let (left_size, right_size) = (node_size(left), node_size(right));

        let fall_out = |child: usize, edges: &mut Vec<CondensedEdge>| {
            for leaf in leaves_of(child) {
                edges.push(CondensedEdge { parent, child: leaf, lambda, size: 1 });
            }
        };

        if left_size >= min_cluster_size && right_size >= min_cluster_size {
            for (child, child_size) in [(left, left_size), (right, right_size)] {
                relabel[child] = next_label;
                edges.push(CondensedEdge { parent, child: next_label, lambda, size: child_size });
                next_label += 1;
                queue.push_back(child);
            }
        } else if left_size < min_cluster_size && right_size < min_cluster_size {
            fall_out(left, &mut edges);
            fall_out(right, &mut edges);
        } else {
            let (small, large) = if left_size < min_cluster_size { (left, right) } else { (right, left) };
            fall_out(small, &mut edges);

            // the larger side keeps the parent's identity
            relabel[large] = parent;
            queue.push_back(large);
        }
    }

    CondensedTree { num_points: n, num_clusters: next_label - n, edges }
}

impl Hdbscan {
    pub fn validate(&self) -> Result<(), SortingError> {
        if self.min_cluster_size < 2 {
            return Err(invalid_parameter("min_cluster_size", "must be at least 2"));
        }
        if self.min_samples == Some(0) {
            return Err(invalid_parameter("min_samples", "must be at least 1"));
        }
        if !(self.cluster_selection_epsilon.is_finite() && self.cluster_selection_epsilon >= 0.) {
            return Err(invalid_parameter("cluster_selection_epsilon", "must be a non negative number"));
        }

        Ok(())
    }

    fn traverse_upwards(
        &self,
        tree: &CondensedTree,
        parents: &[Option<usize>],
        births: &[f64],
        leaf: usize,
    ) -> usize {
        let mut current = leaf;

        loop {
            let parent = match parents[tree.cluster_index(current)] {
                Some(parent) => parent,
                None => return current,
            };

            if parent == tree.root() {
                return if self.allow_single_cluster { parent } else { current };
            }

            if 1. / births[tree.cluster_index(parent)] > self.cluster_selection_epsilon {
                return parent;
            }

            current = parent;
        }
    }

    fn epsilon_search(&self, tree: &CondensedTree, candidates: &BTreeSet<usize>) -> BTreeSet<usize> {
        let parents = tree.cluster_parents();
        let births = tree.birth_lambdas();
        let children = tree.child_clusters();

        let mut selected = BTreeSet::new();
        let mut processed = HashSet::new();

        for &leaf in candidates {
            let leaf_epsilon = 1. / births[tree.cluster_index(leaf)];

            if leaf_epsilon < self.cluster_selection_epsilon {
                if processed.contains(&leaf) {
                    continue;
                }

                let epsilon_child = self.traverse_upwards(tree, &parents, &births, leaf);
                selected.insert(epsilon_child);
                processed.extend(tree.descendants(epsilon_child, &children));
            } else {
                selected.insert(leaf);
            }
        }

        selected
    }

    fn select_clusters(&self, tree: &CondensedTree) -> BTreeSet<usize> {
        let root = tree.root();
        let children = tree.child_clusters();
        let has_children = tree.num_clusters > 1;

        let candidates: BTreeSet<usize> = match self.cluster_selection_method {
            ClusterSelectionMethod::ExcessOfMass => {
                let mut stability = tree.stabilities();
                let mut is_cluster = vec![true; tree.num_clusters];
                if !self.allow_single_cluster {
                    is_cluster[0] = false;
                }

                let last = if self.allow_single_cluster { root } else { root + 1 };
                for cluster in (last..root + tree.num_clusters).rev() {
                    let index = tree.cluster_index(cluster);
                    let subtree_stability: f64 = children[index].iter()
                        .map(|child| stability[tree.cluster_index(*child)])
                        .sum();

                    if subtree_stability > stability[index] {
                        is_cluster[index] = false;
                        stability[index] = subtree_stability;
                    } else {
                        for descendant in tree.descendants(cluster, &children) {
                            is_cluster[tree.cluster_index(descendant)] = false;
                        }
                    }
                }

                (0..tree.num_clusters)
                    .filter(|index| is_cluster[*index])
                    .map(|index| index + root)
                    .collect()
            },
            ClusterSelectionMethod::Leaf => {
                let leaves: BTreeSet<usize> = (root + 1..root + tree.num_clusters)
                    .filter(|cluster| children[tree.cluster_index(*cluster)].is_empty())
                    .collect();

                if leaves.is_empty() {
                    BTreeSet::from([root])
                } else {
                    leaves
                }
            },
        };

        if self.cluster_selection_epsilon > 0. && has_children {
            self.epsilon_search(tree, &candidates)
        } else {
            candidates
        }
    }

    fn label_points(&self, tree: &CondensedTree, selected: &BTreeSet<usize>) -> Vec<i64> {
        let root = tree.root();
        let parents = tree.cluster_parents();

        let mut point_parent = vec![root; tree.num_points];
        let mut point_lambda = vec![0.; tree.num_points];
        for edge in tree.edges.iter().filter(|edge| edge.child < tree.num_points) {
            point_parent[edge.child] = edge.parent;
            point_lambda[edge.child] = edge.lambda;
        }

        let cluster_labels: Vec<Option<i64>> = {
            let mut labels = vec![None; tree.num_clusters];
            for (label, cluster) in selected.iter().enumerate() {
                labels[tree.cluster_index(*cluster)] = Some(label as i64);
            }

            labels
        };

        let root_only = selected.len() == 1 && selected.contains(&root);

        (0..tree.num_points)
            .map(|point| {
                let mut cluster = point_parent[point];
                loop {
                    if let Some(label) = cluster_labels[tree.cluster_index(cluster)] {
                        if cluster != root {
                            return label;
                        }

                        let above_epsilon = self.cluster_selection_epsilon == 0. ||
                            point_lambda[point] >= 1. / self.cluster_selection_epsilon;

                        return if root_only && self.allow_single_cluster && above_epsilon {
                            label
                        } else {
                            NOISE_LABEL
                        };
                    }

                    match parents[tree.cluster_index(cluster)] {
                        Some(parent) => cluster = parent,
                        None => return NOISE_LABEL,
                    }
                }
            })
            .collect()
    }

    /// Labels each row of `data` with a cluster index in `0..k` or `-1` for noise
    ///
    /// Core distances and the spanning tree visit every pair of rows, so time grows with
    /// the square of the row count while memory stays linear in it. Parallel work runs on
    /// the current rayon pool.
    pub fn fit(&self, data: ArrayView2<f32>) -> Result<Vec<i64>, SortingError> {
        if !cfg!(feature = "hdbscan") {
            return Err(DependencyMissingError::DensityClustering.into());
        }
        self.validate()?;

        let n = data.nrows();
        if n == 0 {
            return Ok(Vec::new());
        }
        if data.ncols() == 0 {
            return Err(DegenerateClusterError::NoFeatures.into());
        }
        if data.iter().any(|x| !x.is_finite()) {
            return Err(DegenerateClusterError::NonFiniteFeatures.into());
        }
        if n < self.min_cluster_size {
            return Ok(vec![NOISE_LABEL; n]);
        }

        let min_samples = self.min_samples.unwrap_or(self.min_cluster_size).clamp(1, n);

        let core = core_distances(data, min_samples);
        let mst = minimum_spanning_tree(data, &core);
        let linkage = single_linkage(n, mst);
        let tree = condense_tree(&linkage, n, self.min_cluster_size);
        let selected = self.select_clusters(&tree);

        let labels = self.label_points(&tree, &selected);

        // selected clusters that kept no point would leave a gap in the numbering
        let used: BTreeSet<i64> = labels.iter().copied().filter(|label| *label > NOISE_LABEL).collect();
        let remap: HashMap<i64, i64> = used.iter()
            .enumerate()
            .map(|(new, old)| (*old, new as i64))
            .collect();

        Ok(labels.into_iter()
            .map(|label| remap.get(&label).copied().unwrap_or(NOISE_LABEL))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::{SeedableRng, rngs::StdRng};
    use rand_distr::{Distribution, Normal};

    fn blobs(centers: &[[f32; 2]], per_blob: usize, spread: f32, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0., spread).unwrap();

        Array2::from_shape_fn((centers.len() * per_blob, 2), |(i, j)| {
            centers[i / per_blob][j] + normal.sample(&mut rng)
        })
    }

    #[test]
    fn test_two_blobs() {
        let data = blobs(&[[0., 0.], [50., 50.]], 40, 1., 0);
        let clusterer = Hdbscan { min_cluster_size: 10, ..Hdbscan::default() };

        let labels = clusterer.fit(data.view()).unwrap();

        assert_eq!(labels.iter().filter(|l| **l == NOISE_LABEL).count() < 8, true);
        let first: BTreeSet<i64> = labels[..40].iter().copied().filter(|l| *l >= 0).collect();
        let second: BTreeSet<i64> = labels[40..].iter().copied().filter(|l| *l >= 0).collect();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
    }

    #[test]
    fn test_single_cluster_requires_permission() {
        let data = blobs(&[[0., 0.]], 60, 1., 1);

        let allowed = Hdbscan {
            min_cluster_size: 20, min_samples: Some(1), allow_single_cluster: true, ..Hdbscan::default()
        };
        let labels = allowed.fit(data.view()).unwrap();
        let unique: BTreeSet<i64> = labels.iter().copied().filter(|l| *l >= 0).collect();
        assert!(!unique.is_empty());
        assert!(unique.iter().all(|l| *l < 3));

        let refused = Hdbscan { min_cluster_size: 59, ..Hdbscan::default() };
        let labels = refused.fit(data.view()).unwrap();
        assert!(labels.iter().all(|l| *l == NOISE_LABEL));
    }

    #[test]
    fn test_identical_points_form_one_cluster() {
        let data = Array2::<f32>::ones((30, 3));
        let clusterer = Hdbscan {
            min_cluster_size: 20, min_samples: Some(1), allow_single_cluster: true, ..Hdbscan::default()
        };

        let labels = clusterer.fit(data.view()).unwrap();

        assert!(labels.iter().all(|l| *l == 0));
    }

    #[test]
    fn test_small_and_degenerate_inputs() {
        let clusterer = Hdbscan { min_cluster_size: 20, ..Hdbscan::default() };

        assert!(clusterer.fit(Array2::<f32>::zeros((0, 3)).view()).unwrap().is_empty());
        assert_eq!(clusterer.fit(Array2::<f32>::zeros((5, 3)).view()).unwrap(), vec![-1; 5]);

        let mut data = Array2::<f32>::zeros((30, 2));
        data[[3, 1]] = f32::INFINITY;
        assert!(clusterer.fit(data.view()).is_err());

        let invalid = Hdbscan { min_cluster_size: 1, ..Hdbscan::default() };
        assert!(invalid.fit(data.view()).is_err());
    }

    #[test]
    fn test_leaf_selection_with_epsilon_merges_close_leaves() {
        let data = blobs(&[[0., 0.], [3., 0.], [100., 0.]], 30, 0.3, 2);
        let leaf = Hdbscan {
            min_cluster_size: 10,
            cluster_selection_method: ClusterSelectionMethod::Leaf,
            ..Hdbscan::default()
        };
        let merged = Hdbscan { cluster_selection_epsilon: 10., ..leaf.clone() };

        let leaf_labels: BTreeSet<i64> = leaf.fit(data.view()).unwrap().into_iter().filter(|l| *l >= 0).collect();
        let merged_labels = merged.fit(data.view()).unwrap();

        assert!(leaf_labels.len() >= 3);
        let close: BTreeSet<i64> = merged_labels[..60].iter().copied().filter(|l| *l >= 0).collect();
        assert_eq!(close.len(), 1);
        assert_ne!(merged_labels[70], merged_labels[10]);
    }
}
