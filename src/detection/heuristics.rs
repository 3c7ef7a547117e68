// src/detection/heuristics.rs
//! Multi-scale window scanners for plates and faces.
//!
//! Each window is reduced to a small feature vector (edge strength, intensity
//! spread, vertical/horizontal edge ratio, texture density, colour
//! uniformity, skin and dark-pixel ratios) using summed-area tables, then
//! scored by a fixed weighted rule set (points out of 100). Plate floors are
//! set so that a window without text-like stroke direction never passes at
//! the simple and balanced levels.

use serde::{Deserialize, Serialize};

use crate::detection::merge::Extents;

/// Owned RGB8 tensor, row-major. This is what crosses the worker boundary.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbFrame {
    pub fn from_image(image: &image::RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            data: image.as_raw().clone(),
        }
    }

    fn pixel(&self, x: usize, y: usize) -> [f64; 3] {
        let i = (y * self.width as usize + x) * 3;
        [
            self.data[i] as f64,
            self.data[i + 1] as f64,
            self.data[i + 2] as f64,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggressiveness {
    Simple,
    Balanced,
    Aggressive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlateRules {
    pub widths: &'static [u32],
    /// width / height
    pub aspects: &'static [f64],
    pub min_edge_strength: f64,
    pub min_std_dev: f64,
    pub hv_ratio: (f64, f64),
    pub texture: (f64, f64),
    pub min_uniformity: f64,
    /// Minimum points (out of 100) a window needs.
    pub floor: u32,
}

impl PlateRules {
    pub fn for_level(level: Aggressiveness) -> Self {
        match level {
            Aggressiveness::Simple => Self {
                widths: &[64, 96, 128],
                aspects: &[3.0, 4.0],
                min_edge_strength: 0.15,
                min_std_dev: 0.30,
                hv_ratio: (1.4, 8.0),
                texture: (0.12, 0.70),
                min_uniformity: 0.70,
                floor: 90,
            },
            Aggressiveness::Balanced => Self {
                widths: &[48, 64, 96, 128, 160],
                aspects: &[2.0, 3.0, 4.0],
                min_edge_strength: 0.12,
                min_std_dev: 0.25,
                hv_ratio: (1.3, 10.0),
                texture: (0.10, 0.75),
                min_uniformity: 0.65,
                floor: 80,
            },
            Aggressiveness::Aggressive => Self {
                widths: &[32, 48, 64, 96, 128, 160, 224],
                aspects: &[2.0, 3.0, 4.5, 5.0],
                min_edge_strength: 0.08,
                min_std_dev: 0.20,
                hv_ratio: (1.1, 12.0),
                texture: (0.06, 0.85),
                min_uniformity: 0.50,
                floor: 70,
            },
        }
    }

    pub fn points(&self, f: &WindowFeatures) -> u32 {
        let mut points = 0;
        if f.edge_strength >= self.min_edge_strength {
            points += 30;
        }
        if f.std_dev >= self.min_std_dev {
            points += 20;
        }
        if f.hv_ratio >= self.hv_ratio.0 && f.hv_ratio <= self.hv_ratio.1 {
            points += 25;
        }
        if f.texture >= self.texture.0 && f.texture <= self.texture.1 {
            points += 15;
        }
        if f.color_uniformity >= self.min_uniformity {
            points += 10;
        }
        points
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceRules {
    pub widths: &'static [u32],
    /// height / width
    pub aspects: &'static [f64],
    pub min_skin_ratio: f64,
    pub dark_ratio: (f64, f64),
    pub edge_strength: (f64, f64),
    pub floor: u32,
}

impl Default for FaceRules {
    fn default() -> Self {
        Self {
            widths: &[32, 48, 64, 96, 128],
            aspects: &[1.0, 1.25],
            min_skin_ratio: 0.55,
            dark_ratio: (0.01, 0.25),
            edge_strength: (0.01, 0.35),
            floor: 75,
        }
    }
}

impl FaceRules {
    pub fn points(&self, f: &WindowFeatures) -> u32 {
        let mut points = 0;
        if f.skin_ratio >= self.min_skin_ratio {
            points += 50;
        }
        if f.dark_ratio >= self.dark_ratio.0 && f.dark_ratio <= self.dark_ratio.1 {
            points += 25;
        }
        if f.edge_strength >= self.edge_strength.0 && f.edge_strength <= self.edge_strength.1 {
            points += 25;
        }
        points
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanProfile {
    Plate(PlateRules),
    Face(FaceRules),
}

impl ScanProfile {
    fn windows(&self) -> Vec<(u32, u32)> {
        match self {
            ScanProfile::Plate(rules) => rules
                .widths
                .iter()
                .flat_map(|&w| {
                    rules
                        .aspects
                        .iter()
                        .map(move |&a| (w, ((w as f64) / a).round().max(1.0) as u32))
                })
                .collect(),
            ScanProfile::Face(rules) => rules
                .widths
                .iter()
                .flat_map(|&w| {
                    rules
                        .aspects
                        .iter()
                        .map(move |&a| (w, ((w as f64) * a).round().max(1.0) as u32))
                })
                .collect(),
        }
    }

    fn points(&self, f: &WindowFeatures) -> u32 {
        match self {
            ScanProfile::Plate(rules) => rules.points(f),
            ScanProfile::Face(rules) => rules.points(f),
        }
    }

    fn floor(&self) -> u32 {
        match self {
            ScanProfile::Plate(rules) => rules.floor,
            ScanProfile::Face(rules) => rules.floor,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowFeatures {
    /// Mean |dx| + |dy| over the window, scaled to 0..=2.
    pub edge_strength: f64,
    /// Intensity standard deviation / 128.
    pub std_dev: f64,
    /// Sum |dx| / sum |dy|: strokes of text raise it above 1.
    pub hv_ratio: f64,
    /// Share of pixels that sit on a strong edge.
    pub texture: f64,
    /// 1 - mean chroma / 255.
    pub color_uniformity: f64,
    pub skin_ratio: f64,
    pub dark_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowHit {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub score: f64,
}

impl WindowHit {
    fn extents(&self) -> Extents {
        Extents {
            min_x: self.x as f32,
            min_y: self.y as f32,
            max_x: (self.x + self.width) as f32,
            max_y: (self.y + self.height) as f32,
        }
    }
}

const STRONG_EDGE: f64 = 64.0;
const DARK_LEVEL: f64 = 60.0;
const MAX_HITS: usize = 4_096;

/// Summed-area table with a zero row and column in front.
struct Integral {
    stride: usize,
    data: Vec<f64>,
}

impl Integral {
    fn build(width: usize, height: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let stride = width + 1;
        let mut data = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0.0;
            for x in 0..width {
                row += value(x, y);
                data[(y + 1) * stride + x + 1] = data[y * stride + x + 1] + row;
            }
        }
        Self { stride, data }
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.stride;
        let (x1, y1) = (x + w, y + h);
        self.data[y1 * s + x1] - self.data[y * s + x1] - self.data[y1 * s + x] + self.data[y * s + x]
    }
}

struct FeatureMaps {
    intensity: Integral,
    intensity_sq: Integral,
    grad_x: Integral,
    grad_y: Integral,
    strong_edges: Integral,
    chroma: Integral,
    skin: Integral,
    dark: Integral,
}

fn luma([r, g, b]: [f64; 3]) -> f64 {
    0.299 * r + 0.587 * g + 0.114 * b
}

/// YCbCr skin box.
pub fn is_skin([r, g, b]: [f64; 3]) -> bool {
    let cb = 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b;
    (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

impl FeatureMaps {
    fn build(frame: &RgbFrame) -> Self {
        let (w, h) = (frame.width as usize, frame.height as usize);
        let gray: Vec<f64> = (0..w * h).map(|i| luma(frame.pixel(i % w, i / w))).collect();
        let at = |x: usize, y: usize| gray[y * w + x];
        let gx = |x: usize, y: usize| (at((x + 1).min(w - 1), y) - at(x.saturating_sub(1), y)).abs();
        let gy = |x: usize, y: usize| (at(x, (y + 1).min(h - 1)) - at(x, y.saturating_sub(1))).abs();

        Self {
            intensity: Integral::build(w, h, at),
            intensity_sq: Integral::build(w, h, |x, y| at(x, y).powi(2)),
            grad_x: Integral::build(w, h, gx),
            grad_y: Integral::build(w, h, gy),
            strong_edges: Integral::build(w, h, |x, y| {
                if gx(x, y) + gy(x, y) > STRONG_EDGE { 1.0 } else { 0.0 }
            }),
            chroma: Integral::build(w, h, |x, y| {
                let [r, g, b] = frame.pixel(x, y);
                r.max(g).max(b) - r.min(g).min(b)
            }),
            skin: Integral::build(w, h, |x, y| if is_skin(frame.pixel(x, y)) { 1.0 } else { 0.0 }),
            dark: Integral::build(w, h, |x, y| if at(x, y) < DARK_LEVEL { 1.0 } else { 0.0 }),
        }
    }

    fn features(&self, x: usize, y: usize, w: usize, h: usize) -> WindowFeatures {
        let n = (w * h) as f64;
        let mean = self.intensity.sum(x, y, w, h) / n;
        let variance = (self.intensity_sq.sum(x, y, w, h) / n - mean * mean).max(0.0);
        let sum_gx = self.grad_x.sum(x, y, w, h);
        let sum_gy = self.grad_y.sum(x, y, w, h);
        WindowFeatures {
            edge_strength: (sum_gx + sum_gy) / n / 255.0,
            std_dev: variance.sqrt() / 128.0,
            hv_ratio: sum_gx / sum_gy.max(1.0),
            texture: self.strong_edges.sum(x, y, w, h) / n,
            color_uniformity: 1.0 - self.chroma.sum(x, y, w, h) / n / 255.0,
            skin_ratio: self.skin.sum(x, y, w, h) / n,
            dark_ratio: self.dark.sum(x, y, w, h) / n,
        }
    }
}

/// Scores every window position at every scale and keeps those at or above
/// the profile's floor.
pub fn scan_windows(frame: &RgbFrame, profile: &ScanProfile) -> Vec<WindowHit> {
    if frame.width < 2 || frame.height < 2 {
        return Vec::new();
    }
    let maps = FeatureMaps::build(frame);
    let mut hits = Vec::new();

    for (ww, wh) in profile.windows() {
        if ww > frame.width || wh > frame.height {
            continue;
        }
        let step_x = (ww / 8).max(4);
        let step_y = (wh / 4).max(4);
        let mut y = 0;
        while y + wh <= frame.height {
            let mut x = 0;
            while x + ww <= frame.width {
                let features = maps.features(x as usize, y as usize, ww as usize, wh as usize);
                let points = profile.points(&features);
                if points >= profile.floor() {
                    hits.push(WindowHit {
                        x,
                        y,
                        width: ww,
                        height: wh,
                        score: points as f64 / 100.0,
                    });
                }
                x += step_x;
            }
            y += step_y;
        }
    }

    if hits.len() > MAX_HITS {
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(MAX_HITS);
    }
    hits
}

/// Groups hits whose boxes overlap (transitively) and returns one box per
/// group: the union of its members, scored by its best member.
pub fn cluster_hits(hits: &[WindowHit]) -> Vec<WindowHit> {
    let mut parent: Vec<usize> = (0..hits.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let extents: Vec<Extents> = hits.iter().map(WindowHit::extents).collect();
    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if extents[i].intersection(&extents[j]) > 0.0 {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    let mut groups: Vec<(usize, Extents, f64)> = Vec::new();
    for i in 0..hits.len() {
        let root = find(&mut parent, i);
        let e = extents[i];
        match groups.iter_mut().find(|(r, _, _)| *r == root) {
            Some((_, bounds, score)) => {
                bounds.min_x = bounds.min_x.min(e.min_x);
                bounds.min_y = bounds.min_y.min(e.min_y);
                bounds.max_x = bounds.max_x.max(e.max_x);
                bounds.max_y = bounds.max_y.max(e.max_y);
                *score = score.max(hits[i].score);
            }
            None => groups.push((root, e, hits[i].score)),
        }
    }

    groups
        .into_iter()
        .map(|(_, b, score)| WindowHit {
            x: b.min_x as u32,
            y: b.min_y as u32,
            width: (b.max_x - b.min_x) as u32,
            height: (b.max_y - b.min_y) as u32,
            score,
        })
        .collect()
}
