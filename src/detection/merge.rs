// src/detection/merge.rs
use std::cmp::Ordering;

use crate::models::DetectionCandidate;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.4;

/// Min/max extents of an axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extents {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Extents {
    pub fn of(c: &DetectionCandidate) -> Self {
        Self {
            min_x: c.x,
            min_y: c.y,
            max_x: c.x + c.width,
            max_y: c.y + c.height,
        }
    }

    pub fn area(&self) -> f32 {
        (self.max_x - self.min_x).max(0.0) * (self.max_y - self.min_y).max(0.0)
    }

    pub fn intersection(&self, other: &Self) -> f32 {
        let w = (self.max_x.min(other.max_x) - self.min_x.max(other.min_x)).max(0.0);
        let h = (self.max_y.min(other.max_y) - self.min_y.max(other.min_y)).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection(other);
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }
}

pub fn iou(a: &DetectionCandidate, b: &DetectionCandidate) -> f32 {
    Extents::of(a).iou(&Extents::of(b))
}

/// Greedy non-maximum suppression.
///
/// Candidates are ordered by `confidence * class_prob` (stable, so ties keep
/// input order); each kept box suppresses every later box whose IoU with it
/// exceeds `iou_threshold`. Output is in descending score order.
pub fn merge(candidates: Vec<DetectionCandidate>, iou_threshold: f32) -> Vec<DetectionCandidate> {
    let mut ordered = candidates;
    ordered.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(Ordering::Equal));

    let extents: Vec<Extents> = ordered.iter().map(Extents::of).collect();
    let mut suppressed = vec![false; ordered.len()];
    let mut kept = Vec::with_capacity(ordered.len());

    for (i, candidate) in ordered.into_iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..extents.len() {
            if !suppressed[j] && extents[i].iou(&extents[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
        kept.push(candidate);
    }
    kept
}
