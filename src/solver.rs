//! Single-route tour optimizer: nearest-neighbor construction followed by
//! 2-opt local search.
//!
//! The optimizer works on positions into the caller's stop slice and only
//! needs a distance function between two stops. Distances are looked up at
//! most once per ordered pair per call, so an expensive distance function
//! (road routing) is hit O(n²) times in the worst case, never more.
//!
//! The first stop is the start of the tour and stays first.

/// Tuning for [`optimize`].
#[derive(Debug, Clone)]
pub struct SolveOptions {
    /// Maximum full 2-opt passes. Guards against non-termination on noisy
    /// distances.
    pub max_passes: usize,
    /// A move must shorten the tour by more than this to be applied.
    pub epsilon: f64,
    /// Count the edge from the last stop back to the first.
    pub closed_tour: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_passes: 1000,
            epsilon: 1e-6,
            closed_tour: false,
        }
    }
}

/// Result of [`optimize`]: a visiting order over the input positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Tour {
    /// Input positions in visiting order. Always a permutation of `0..n`.
    pub order: Vec<usize>,
    /// Length of `order`, recomputed from scratch.
    pub total_distance: f64,
    /// Length of the nearest-neighbor tour before refinement.
    pub construction_distance: f64,
    /// 2-opt passes performed.
    pub passes: usize,
}

/// Orders `stops` to minimize total travel distance.
pub fn optimize<S, F>(stops: &[S], distance: F, options: &SolveOptions) -> Tour
where
    F: Fn(&S, &S) -> f64,
{
    let mut costs = CostMatrix::new(stops, distance);

    if stops.len() < 2 {
        return Tour {
            order: (0..stops.len()).collect(),
            total_distance: 0.0,
            construction_distance: 0.0,
            passes: 0,
        };
    }

    let mut order = nearest_neighbor(&mut costs);
    let construction_distance = tour_length(&order, &mut costs, options.closed_tour);
    let passes = two_opt(&mut order, &mut costs, options);
    let total_distance = tour_length(&order, &mut costs, options.closed_tour);

    tracing::debug!(
        stops = stops.len(),
        construction_distance,
        total_distance,
        passes,
        "tour optimized"
    );

    Tour {
        order,
        total_distance,
        construction_distance,
        passes,
    }
}

/// Length of visiting `stops` in the given order.
pub fn route_length<S, F>(stops: &[S], distance: F, closed_tour: bool) -> f64
where
    F: Fn(&S, &S) -> f64,
{
    let order: Vec<usize> = (0..stops.len()).collect();
    tour_length(&order, &mut CostMatrix::new(stops, distance), closed_tour)
}

/// Lazily filled, memoized distance lookup by input position.
struct CostMatrix<'a, S, F> {
    stops: &'a [S],
    distance: F,
    memo: Vec<Option<f64>>,
}

impl<'a, S, F> CostMatrix<'a, S, F>
where
    F: Fn(&S, &S) -> f64,
{
    fn new(stops: &'a [S], distance: F) -> Self {
        Self {
            stops,
            distance,
            memo: vec![None; stops.len() * stops.len()],
        }
    }

    fn get(&mut self, from: usize, to: usize) -> f64 {
        if from == to {
            return 0.0;
        }
        let slot = from * self.stops.len() + to;
        if let Some(cost) = self.memo[slot] {
            return cost;
        }

        let cost = (self.distance)(&self.stops[from], &self.stops[to]);
        // NaN would make every comparison false; treat it as unreachable.
        let cost = if cost.is_nan() { f64::INFINITY } else { cost };
        self.memo[slot] = Some(cost);
        cost
    }
}

/// Greedy construction from position 0. Ties go to the earlier input position.
fn nearest_neighbor<S, F>(costs: &mut CostMatrix<'_, S, F>) -> Vec<usize>
where
    F: Fn(&S, &S) -> f64,
{
    let n = costs.stops.len();
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);

    let mut current = 0;
    visited[current] = true;
    order.push(current);

    for _ in 1..n {
        let mut best: Option<(usize, f64)> = None;
        for candidate in 0..n {
            if visited[candidate] {
                continue;
            }
            let cost = costs.get(current, candidate);
            if best.is_none_or(|(_, best_cost)| cost < best_cost) {
                best = Some((candidate, cost));
            }
        }

        // n - 1 iterations over n - 1 unvisited stops: one is always left.
        let Some((next, _)) = best else { break };
        visited[next] = true;
        order.push(next);
        current = next;
    }

    order
}

/// First-improvement 2-opt. Returns the number of passes performed.
fn two_opt<S, F>(order: &mut [usize], costs: &mut CostMatrix<'_, S, F>, options: &SolveOptions) -> usize
where
    F: Fn(&S, &S) -> f64,
{
    let n = order.len();
    if n < 3 {
        return 0;
    }

    let mut passes = 0;
    let mut converged = false;
    while passes < options.max_passes {
        passes += 1;
        let mut improved = false;

        for i in 0..n - 2 {
            for j in i + 2..n {
                // In a closed tour these two edges share the start stop.
                if options.closed_tour && i == 0 && j == n - 1 {
                    continue;
                }
                let next = successor(j, n, options.closed_tour);

                let a = order[i];
                let b = order[i + 1];
                let c = order[j];
                let mut delta = costs.get(a, c) - costs.get(a, b);
                if let Some(next) = next {
                    let d = order[next];
                    delta += costs.get(b, d) - costs.get(c, d);
                }
                if !(delta < -options.epsilon) {
                    continue;
                }

                // Reversal flips the direction of every inner edge; only
                // symmetric distances make that free.
                for m in i + 1..j {
                    delta += costs.get(order[m + 1], order[m]) - costs.get(order[m], order[m + 1]);
                }
                if delta < -options.epsilon {
                    order[i + 1..=j].reverse();
                    improved = true;
                }
            }
        }

        if !improved {
            converged = true;
            break;
        }
    }

    if !converged {
        tracing::warn!(passes, "2-opt stopped at the pass limit");
    }

    passes
}

fn successor(position: usize, n: usize, closed_tour: bool) -> Option<usize> {
    if position + 1 < n {
        Some(position + 1)
    } else if closed_tour {
        Some(0)
    } else {
        None
    }
}

fn tour_length<S, F>(order: &[usize], costs: &mut CostMatrix<'_, S, F>, closed_tour: bool) -> f64
where
    F: Fn(&S, &S) -> f64,
{
    let mut total: f64 = order
        .windows(2)
        .map(|pair| costs.get(pair[0], pair[1]))
        .sum();
    if closed_tour && order.len() > 1 {
        total += costs.get(order[order.len() - 1], order[0]);
    }
    total
}
