//! Peer scheduling — weighted random choice of whom to offer or push to.

use rand::Rng;

/// Pick up to `count` items without replacement, each draw proportional to
/// the remaining weights. Items with non-positive weight are never picked.
pub fn select_weighted<T, R: Rng + ?Sized>(
    candidates: Vec<(T, f64)>,
    count: usize,
    rng: &mut R,
) -> Vec<T> {
    let mut pool: Vec<(T, f64)> = candidates.into_iter().filter(|(_, w)| *w > 0.0).collect();
    let mut picked = Vec::with_capacity(count.min(pool.len()));

    while picked.len() < count && !pool.is_empty() {
        let total: f64 = pool.iter().map(|(_, w)| *w).sum();
        let mut target = rng.gen::<f64>() * total;
        let mut index = pool.len() - 1;
        for (i, (_, w)) in pool.iter().enumerate() {
            if target < *w {
                index = i;
                break;
            }
            target -= *w;
        }
        picked.push(pool.swap_remove(index).0);
    }
    picked
}
