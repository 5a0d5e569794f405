//! Containment tests in frame pixel coordinates.

use serde::{Deserialize, Serialize};

use crate::detect::{BBox, Detection};

use super::Zone;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(f64::from(x), f64::from(y))
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self::new(x, y)
    }
}

/// One (zone, detection) pair whose bbox intersects the zone.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneMatch {
    pub zone_id: String,
    pub zone_name: String,
    pub detection: Detection,
}

/// Ray casting in the +x direction.
///
/// An edge is crossed when the point's y lies in `(min_y, max_y]` of the edge
/// and the point is left of the edge's x-intercept. Horizontal edges never
/// satisfy the half-open interval, so they contribute no crossing.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n == 0 {
        return false;
    }

    let Point { x, y } = point;
    let mut inside = false;
    let mut p1 = polygon[0];
    for i in 1..=n {
        let p2 = polygon[i % n];
        if y > p1.y.min(p2.y) && y <= p1.y.max(p2.y) && x <= p1.x.max(p2.x) {
            // p1.y != p2.y is guaranteed by the half-open interval above.
            let crosses = if p1.x == p2.x {
                true
            } else {
                let x_intersect = (y - p1.y) * (p2.x - p1.x) / (p2.y - p1.y) + p1.x;
                x <= x_intersect
            };
            if crosses {
                inside = !inside;
            }
        }
        p1 = p2;
    }
    inside
}

/// Heuristic bbox/zone overlap.
///
/// True when the bbox center is inside the zone, any bbox corner is inside the
/// zone, or any zone vertex lies within the bbox (edges inclusive). A zone edge
/// that crosses a bbox side without satisfying any of these is not reported.
pub fn bbox_intersects_zone(bbox: &BBox, zone: &Zone) -> bool {
    let polygon = zone.points.as_slice();

    if point_in_polygon(bbox.center().into(), polygon) {
        return true;
    }

    if bbox
        .corners()
        .into_iter()
        .any(|corner| point_in_polygon(corner.into(), polygon))
    {
        return true;
    }

    let (x1, y1) = (f64::from(bbox.x1), f64::from(bbox.y1));
    let (x2, y2) = (f64::from(bbox.x2), f64::from(bbox.y2));
    polygon
        .iter()
        .any(|p| x1 <= p.x && p.x <= x2 && y1 <= p.y && p.y <= y2)
}

/// Every intersecting (zone, detection) pair, zones in the outer loop.
///
/// No deduplication: one detection may match several zones and one zone may
/// match several detections.
pub fn check_violations(detections: &[Detection], zones: &[Zone]) -> Vec<ZoneMatch> {
    let mut matches = Vec::new();
    for zone in zones {
        for detection in detections {
            if bbox_intersects_zone(&detection.bbox, zone) {
                matches.push(ZoneMatch {
                    zone_id: zone.id.clone(),
                    zone_name: zone.name.clone(),
                    detection: detection.clone(),
                });
            }
        }
    }
    matches
}
