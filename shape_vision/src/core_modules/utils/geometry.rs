// Polygon helpers for contour post-processing: perimeter, closed
// Douglas-Peucker simplification and axis-aligned bounds.

use crate::core_modules::detection::Point;

/// Length of a polyline; `closed` adds the segment from the last point back to the first.
pub fn arc_length(points: &[Point], closed: bool) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let open: f64 = points.windows(2).map(|w| w[0].distance(&w[1])).sum();
    if closed {
        open + points[points.len() - 1].distance(&points[0])
    } else {
        open
    }
}

/// Distance from `p` to the infinite line through `a` and `b`.
fn line_distance(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = ((b.x - a.x) as f64, (b.y - a.y) as f64);
    let norm = (dx * dx + dy * dy).sqrt();
    if norm == 0.0 {
        return p.distance(&a);
    }
    ((p.x - a.x) as f64 * dy - (p.y - a.y) as f64 * dx).abs() / norm
}

/// Douglas-Peucker on an open chain. Returns the kept points including both ends.
fn simplify_open(chain: &[Point], epsilon: f64) -> Vec<Point> {
    if chain.len() < 3 {
        return chain.to_vec();
    }
    let mut keep = vec![false; chain.len()];
    keep[0] = true;
    keep[chain.len() - 1] = true;

    let mut stack = vec![(0usize, chain.len() - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let mut max_dist = 0.0;
        let mut max_index = start;
        for i in start + 1..end {
            let d = line_distance(chain[i], chain[start], chain[end]);
            if d > max_dist {
                max_dist = d;
                max_index = i;
            }
        }
        if max_dist > epsilon {
            keep[max_index] = true;
            stack.push((start, max_index));
            stack.push((max_index, end));
        }
    }

    chain
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

/// Approximates a closed contour with a polygon whose vertices are a subset of
/// the contour points, none further than `epsilon` from the original outline.
pub fn approximate_closed_polygon(contour: &[Point], epsilon: f64) -> Vec<Point> {
    if contour.len() < 3 {
        return contour.to_vec();
    }

    // Split the ring at the point farthest from the first one, simplify both halves.
    let origin = contour[0];
    let (split, _) = contour
        .iter()
        .enumerate()
        .map(|(i, p)| (i, origin.distance(p)))
        .fold((0, 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });
    if split == 0 {
        return vec![origin];
    }

    let first = simplify_open(&contour[..=split], epsilon);
    let mut second_chain: Vec<Point> = contour[split..].to_vec();
    second_chain.push(origin);
    let second = simplify_open(&second_chain, epsilon);

    let mut polygon = first;
    // `second` starts at the split point and ends at the origin, both already present.
    polygon.extend_from_slice(&second[1..second.len() - 1]);

    remove_collinear(polygon, epsilon)
}

/// Drops vertices lying within `epsilon` of the line through their neighbours.
/// The split point of the ring is arbitrary, so a vertex can land mid-edge.
fn remove_collinear(mut polygon: Vec<Point>, epsilon: f64) -> Vec<Point> {
    let mut changed = true;
    while changed && polygon.len() > 3 {
        changed = false;
        let n = polygon.len();
        for i in 0..n {
            let prev = polygon[(i + n - 1) % n];
            let next = polygon[(i + 1) % n];
            if line_distance(polygon[i], prev, next) <= epsilon {
                polygon.remove(i);
                changed = true;
                break;
            }
        }
    }
    polygon
}

/// Axis-aligned bounds as `(x, y, width, height)`, counting pixels inclusively.
pub fn bounding_rect(points: &[Point]) -> Option<(i32, i32, u32, u32)> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some((
        min_x,
        min_y,
        (max_x - min_x + 1) as u32,
        (max_y - min_y + 1) as u32,
    ))
}
