use crate::tools::log::{log_info, LogServiceType};

/// Parameters for the density clusterer. `min_samples` defaults to 2 when
/// not given: small same-identity groups must cohere in the
/// mutual-reachability graph before any cross-identity link forms, so that a
/// group below `min_cluster_size` detaches as one unit and lands in noise.
#[derive(Debug, Clone, Copy)]
pub struct DensityParams {
    pub min_cluster_size: usize,
    pub min_samples: Option<usize>,
}

impl Default for DensityParams {
    fn default() -> Self {
        Self { min_cluster_size: 5, min_samples: None }
    }
}

/// Flat clustering of a descriptor batch: one label per input vector
/// (`-1` = noise) plus the stability score of each surviving cluster,
/// indexed by label.
#[derive(Debug, Clone)]
pub struct DensityClustering {
    pub labels: Vec<i64>,
    pub stabilities: Vec<f64>,
}

impl DensityClustering {
    pub fn n_clusters(&self) -> usize {
        self.stabilities.len()
    }

    fn all_noise(n: usize) -> Self {
        Self { labels: vec![-1; n], stabilities: Vec::new() }
    }
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-8 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// 1/distance, the density scale the hierarchy is scored on.
fn lambda_of(distance: f64) -> f64 {
    if distance > 0.0 {
        1.0 / distance
    } else {
        f64::INFINITY
    }
}

/// Difference of two lambdas, treating inf - inf as zero so duplicate
/// points cannot poison stabilities with NaN.
fn lambda_sub(a: f64, b: f64) -> f64 {
    if a.is_infinite() && b.is_infinite() {
        0.0
    } else {
        a - b
    }
}

struct Dendrogram {
    /// Children of internal node `n + i`, roots of previously merged components.
    left: Vec<usize>,
    right: Vec<usize>,
    dist: Vec<f64>,
    size: Vec<usize>,
    n: usize,
}

impl Dendrogram {
    fn node_size(&self, node: usize) -> usize {
        if node < self.n {
            1
        } else {
            self.size[node - self.n]
        }
    }

    /// Original point indices under `node`, ascending.
    fn leaves(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(cur) = stack.pop() {
            if cur < self.n {
                out.push(cur);
            } else {
                stack.push(self.left[cur - self.n]);
                stack.push(self.right[cur - self.n]);
            }
        }
        out.sort_unstable();
        out
    }
}

struct CondensedTree {
    /// Per condensed cluster: parent (None for the root) and birth lambda.
    parent: Vec<Option<usize>>,
    birth: Vec<f64>,
    children: Vec<Vec<usize>>,
    /// Per original point: (attach cluster, lambda at which it fell out).
    point_attach: Vec<usize>,
    point_lambda: Vec<f64>,
}

/// Partition unit-norm descriptor vectors into identity clusters plus noise,
/// per the mutual-reachability / condensed-hierarchy / stability-selection
/// scheme. Deterministic: ties always break by ascending original index.
pub fn cluster_descriptors(descriptors: &[Vec<f32>], params: &DensityParams) -> DensityClustering {
    let n = descriptors.len();
    let min_cluster_size = params.min_cluster_size.max(2);
    if n == 0 {
        return DensityClustering { labels: Vec::new(), stabilities: Vec::new() };
    }
    if n < min_cluster_size {
        return DensityClustering::all_noise(n);
    }
    let min_samples = params.min_samples.unwrap_or(2).clamp(1, n);

    // Pairwise distances; per-job batches stay in the low thousands so the
    // O(n²) table is acceptable.
    let mut dist = vec![0.0f64; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = euclidean(&descriptors[i], &descriptors[j]);
            dist[i * n + j] = d;
            dist[j * n + i] = d;
        }
    }

    // Core distance: distance to the min_samples-th nearest neighbor, the
    // point itself counting as the first.
    let mut core = vec![0.0f64; n];
    let mut row = vec![0.0f64; n - 1];
    for i in 0..n {
        if min_samples < 2 {
            continue;
        }
        let mut k = 0;
        for j in 0..n {
            if j != i {
                row[k] = dist[i * n + j];
                k += 1;
            }
        }
        row.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        core[i] = row[min_samples - 2];
    }

    let mreach = |i: usize, j: usize| -> f64 { dist[i * n + j].max(core[i]).max(core[j]) };

    // Prim MST over the complete mutual-reachability graph, lowest index wins
    // on equal attachment distances.
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut best_from = vec![0usize; n];
    let mut edges: Vec<(f64, usize, usize)> = Vec::with_capacity(n - 1);
    in_tree[0] = true;
    for j in 1..n {
        best[j] = mreach(0, j);
    }
    for _ in 1..n {
        let mut pick = usize::MAX;
        let mut pick_d = f64::INFINITY;
        for j in 0..n {
            if !in_tree[j] && best[j] < pick_d {
                pick_d = best[j];
                pick = j;
            }
        }
        in_tree[pick] = true;
        let (u, v) = if best_from[pick] < pick { (best_from[pick], pick) } else { (pick, best_from[pick]) };
        edges.push((pick_d, u, v));
        for j in 0..n {
            if !in_tree[j] {
                let d = mreach(pick, j);
                if d < best[j] {
                    best[j] = d;
                    best_from[j] = pick;
                }
            }
        }
    }
    edges.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    let dendrogram = single_linkage(n, &edges);
    let condensed = condense(&dendrogram, min_cluster_size);
    let (selected, raw_stability) = select_clusters(&condensed);
    label_points(n, &condensed, &selected, &raw_stability)
}

fn single_linkage(n: usize, edges: &[(f64, usize, usize)]) -> Dendrogram {
    let mut parent: Vec<usize> = (0..(2 * n - 1)).collect();
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    let mut den = Dendrogram {
        left: Vec::with_capacity(n - 1),
        right: Vec::with_capacity(n - 1),
        dist: Vec::with_capacity(n - 1),
        size: Vec::with_capacity(n - 1),
        n,
    };
    for (step, (d, u, v)) in edges.iter().enumerate() {
        let ru = find(&mut parent, *u);
        let rv = find(&mut parent, *v);
        let node = n + step;
        let (a, b) = if ru < rv { (ru, rv) } else { (rv, ru) };
        den.left.push(a);
        den.right.push(b);
        den.dist.push(*d);
        den.size.push(den.node_size(a) + den.node_size(b));
        parent[ru] = node;
        parent[rv] = node;
    }
    den
}

fn condense(den: &Dendrogram, min_cluster_size: usize) -> CondensedTree {
    let n = den.n;
    let root_node = 2 * n - 2;
    let mut tree = CondensedTree {
        // Root cluster is born when the batch first becomes one component,
        // i.e. at the largest mutual-reachability MST edge.
        parent: vec![None],
        birth: vec![lambda_of(den.dist[root_node - n])],
        children: vec![Vec::new()],
        point_attach: vec![0; n],
        point_lambda: vec![0.0; n],
    };

    // Top-down: a split only creates child clusters when both sides are big
    // enough; otherwise the small side's points fall out of the survivor.
    let mut queue: std::collections::VecDeque<(usize, usize)> = std::collections::VecDeque::new();
    queue.push_back((root_node, 0));
    while let Some((node, label)) = queue.pop_front() {
        let idx = node - n;
        let (l, r) = (den.left[idx], den.right[idx]);
        let lam = lambda_of(den.dist[idx]);
        let (ls, rs) = (den.node_size(l), den.node_size(r));
        if ls >= min_cluster_size && rs >= min_cluster_size {
            for child in [l, r] {
                let child_label = tree.parent.len();
                tree.parent.push(Some(label));
                tree.birth.push(lam);
                tree.children.push(Vec::new());
                tree.children[label].push(child_label);
                queue.push_back((child, child_label));
            }
        } else if ls < min_cluster_size && rs < min_cluster_size {
            for p in den.leaves(node) {
                tree.point_attach[p] = label;
                tree.point_lambda[p] = lam;
            }
        } else {
            let (fallen, survivor) = if ls < min_cluster_size { (l, r) } else { (r, l) };
            for p in den.leaves(fallen) {
                tree.point_attach[p] = label;
                tree.point_lambda[p] = lam;
            }
            if survivor >= n {
                queue.push_back((survivor, label));
            } else {
                // single surviving point, only possible with degenerate sizes
                tree.point_attach[survivor] = label;
                tree.point_lambda[survivor] = lam;
            }
        }
    }
    tree
}

/// Excess-of-mass selection: bottom-up, a candidate survives when its own
/// stability beats the sum of its already-selected descendants.
fn select_clusters(tree: &CondensedTree) -> (Vec<bool>, Vec<f64>) {
    let n_clusters = tree.parent.len();
    let mut stability = vec![0.0f64; n_clusters];
    for (p, &attach) in tree.point_attach.iter().enumerate() {
        stability[attach] += lambda_sub(tree.point_lambda[p], tree.birth[attach]);
    }
    // Child clusters carry their whole mass up to the split.
    for c in 1..n_clusters {
        if let Some(parent) = tree.parent[c] {
            let size = subtree_point_count(tree, c);
            stability[parent] += lambda_sub(tree.birth[c], tree.birth[parent]) * size as f64;
        }
    }

    let raw = stability.clone();
    let mut selected = vec![false; n_clusters];
    // Labels were assigned top-down, so reverse order is bottom-up.
    for c in (0..n_clusters).rev() {
        if tree.children[c].is_empty() {
            selected[c] = stability[c] > 0.0;
            continue;
        }
        let descendants_sum: f64 = tree.children[c].iter().map(|&ch| stability[ch]).sum();
        if stability[c] > descendants_sum {
            selected[c] = true;
            deselect_descendants(tree, c, &mut selected);
        } else {
            stability[c] = descendants_sum;
        }
    }
    (selected, raw)
}

fn subtree_point_count(tree: &CondensedTree, cluster: usize) -> usize {
    let mut count = 0;
    let mut stack = vec![cluster];
    while let Some(cur) = stack.pop() {
        count += tree.point_attach.iter().filter(|&&a| a == cur).count();
        stack.extend(tree.children[cur].iter().copied());
    }
    count
}

fn deselect_descendants(tree: &CondensedTree, cluster: usize, selected: &mut [bool]) {
    let mut stack: Vec<usize> = tree.children[cluster].to_vec();
    while let Some(cur) = stack.pop() {
        selected[cur] = false;
        stack.extend(tree.children[cur].iter().copied());
    }
}

fn label_points(
    n: usize,
    tree: &CondensedTree,
    selected: &[bool],
    raw_stability: &[f64],
) -> DensityClustering {
    // A point belongs to the nearest selected ancestor of its attach cluster,
    // provided it outlived that cluster's birth; first-split leavers of the
    // root fall out exactly at its birth lambda and stay noise.
    let mut owner: Vec<Option<usize>> = vec![None; n];
    for p in 0..n {
        let mut cursor = Some(tree.point_attach[p]);
        while let Some(c) = cursor {
            if selected[c] {
                if tree.point_lambda[p] > tree.birth[c] {
                    owner[p] = Some(c);
                }
                break;
            }
            cursor = tree.parent[c];
        }
    }

    // Output ids in order of first member appearance, so identical input
    // yields identical labels.
    let mut labels = vec![-1i64; n];
    let mut relabel: std::collections::HashMap<usize, i64> = std::collections::HashMap::new();
    let mut stabilities = Vec::new();
    for p in 0..n {
        if let Some(c) = owner[p] {
            let next = relabel.len() as i64;
            let label = *relabel.entry(c).or_insert_with(|| {
                stabilities.push(raw_stability[c]);
                next
            });
            labels[p] = label;
        }
    }
    DensityClustering { labels, stabilities }
}

/// Convenience entry point used by the pipeline; logs the outcome.
pub fn cluster_faces(descriptors: &[Vec<f32>], params: &DensityParams) -> DensityClustering {
    let result = cluster_descriptors(descriptors, params);
    let noise = result.labels.iter().filter(|&&l| l < 0).count();
    log_info(
        LogServiceType::Pipeline,
        format!(
            "Clustered {} descriptors into {} clusters ({} noise)",
            descriptors.len(),
            result.n_clusters(),
            noise
        ),
    );
    result
}
