//! Broad phase: axis sweep over body bounding boxes.

use crate::objects::BodyId;
use crate::shape::Aabb;

/// Returns candidate pairs `(a, b)` with `a < b`, sorted. The sweep runs
/// along x over boxes sorted by `(min.x, id)` so the output is deterministic
/// for identical input geometry.
pub(crate) fn overlapping_pairs(boxes: &[(BodyId, Aabb)]) -> Vec<(BodyId, BodyId)> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&i, &j| {
        boxes[i]
            .1
            .min
            .x
            .partial_cmp(&boxes[j].1.min.x)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(boxes[i].0.cmp(&boxes[j].0))
    });

    let mut pairs = Vec::new();
    for (k, &i) in order.iter().enumerate() {
        let (id_i, ref box_i) = boxes[i];
        for &j in &order[k + 1..] {
            let (id_j, ref box_j) = boxes[j];
            if box_j.min.x > box_i.max.x {
                break;
            }
            if box_i.overlaps(box_j) {
                let (a, b) = if id_i < id_j { (id_i, id_j) } else { (id_j, id_i) };
                pairs.push((a, b));
            }
        }
    }
    pairs.sort_unstable();
    pairs
}
