// src/detection/onnx.rs
use anyhow::{Context, Result};
use image::{RgbImage, imageops};
use log::debug;
use std::path::Path;
use tract_onnx::prelude::{
    Framework, Graph, InferenceModelExt, IntoTensor, SimplePlan, Tensor, TypedFact, TypedOp, tvec,
};

use crate::detection::model::{LocatedObject, ObjectLocator, TextReader, TextReading};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

pub const LOCATOR_INPUT: u32 = 640;
pub const READER_INPUT: (u32, u32) = (128, 32);
pub const PLATE_CHARSET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

const LOCATOR_COLS: usize = 6;

fn load_runnable(path: &Path) -> Result<RunnableModel> {
    anyhow::ensure!(path.exists(), "model file not found: {}", path.display());
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to parse ONNX graph from {}", path.display()))?
        .into_optimized()
        .map_err(|e| anyhow::anyhow!("unable to optimize {}: {e}", path.display()))?
        .into_runnable()
        .map_err(|e| anyhow::anyhow!("unable to make {} runnable: {e}", path.display()))
}

/// NCHW float tensor scaled to 0..1.
fn to_chw_tensor(image: &RgbImage, width: u32, height: u32) -> Result<Tensor> {
    let resized = imageops::resize(image, width, height, imageops::FilterType::Triangle);
    let plane = (width * height) as usize;
    let mut data = vec![0f32; plane * 3];
    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = pixel[c] as f32 / 255.0;
        }
    }
    let shape = [1usize, 3, height as usize, width as usize];
    Tensor::from_shape(&shape, &data).map_err(|e| anyhow::anyhow!("failed to build tensor: {e}"))
}

fn run_single(runnable: &RunnableModel, input: Tensor) -> Result<Tensor> {
    let outputs = runnable
        .run(tvec![input.into()])
        .map_err(|e| anyhow::anyhow!("model execution failed: {e}"))?;
    outputs
        .into_iter()
        .next()
        .map(|value| value.into_tensor())
        .ok_or_else(|| anyhow::anyhow!("model produced no outputs"))
}

/// Plate locator exported with rows of `[cx, cy, w, h, objectness, class_prob]`
/// in input-pixel space.
pub struct OnnxPlateLocator {
    runnable: RunnableModel,
    min_objectness: f32,
}

impl OnnxPlateLocator {
    pub fn load<P: AsRef<Path>>(path: P, min_objectness: f32) -> Result<Self> {
        let runnable = load_runnable(path.as_ref())?;
        debug!("Plate locator loaded from {}", path.as_ref().display());
        Ok(Self {
            runnable,
            min_objectness,
        })
    }
}

impl ObjectLocator for OnnxPlateLocator {
    fn locate(&self, image: &RgbImage) -> Result<Vec<LocatedObject>> {
        let input = to_chw_tensor(image, LOCATOR_INPUT, LOCATOR_INPUT)?;
        let output = run_single(&self.runnable, input)?;
        let slice = output
            .as_slice::<f32>()
            .map_err(|e| anyhow::anyhow!("locator output is not f32: {e}"))?;
        let scale_x = image.width() as f32 / LOCATOR_INPUT as f32;
        let scale_y = image.height() as f32 / LOCATOR_INPUT as f32;
        decode_locator_rows(slice, scale_x, scale_y, self.min_objectness)
    }
}

/// Converts centre-based rows to top-left boxes in image space.
pub fn decode_locator_rows(
    slice: &[f32],
    scale_x: f32,
    scale_y: f32,
    min_objectness: f32,
) -> Result<Vec<LocatedObject>> {
    anyhow::ensure!(
        slice.len() % LOCATOR_COLS == 0,
        "locator output length {} is not a multiple of {}",
        slice.len(),
        LOCATOR_COLS
    );
    Ok(slice
        .chunks_exact(LOCATOR_COLS)
        .filter(|row| row[4] >= min_objectness)
        .map(|row| {
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            LocatedObject {
                x: (cx - w / 2.0) * scale_x,
                y: (cy - h / 2.0) * scale_y,
                width: w * scale_x,
                height: h * scale_y,
                confidence: row[4].clamp(0.0, 1.0),
                class_prob: row[5].clamp(0.0, 1.0),
            }
        })
        .collect())
}

/// CTC text recogniser for plate crops. Output is `[T, C]` or `[1, T, C]`
/// where class 0 is the blank and class `i` maps to `charset[i - 1]`.
pub struct OnnxTextReader {
    runnable: RunnableModel,
    charset: Vec<char>,
}

impl OnnxTextReader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let runnable = load_runnable(path.as_ref())?;
        debug!("Text reader loaded from {}", path.as_ref().display());
        Ok(Self {
            runnable,
            charset: PLATE_CHARSET.chars().collect(),
        })
    }
}

impl TextReader for OnnxTextReader {
    fn read(&self, crop: &RgbImage) -> Result<Option<TextReading>> {
        let input = to_chw_tensor(crop, READER_INPUT.0, READER_INPUT.1)?;
        let output = run_single(&self.runnable, input)?;
        let classes = match output.shape() {
            [_, c] => *c,
            [1, _, c] => *c,
            other => anyhow::bail!("text reader output must be [T, C] or [1, T, C], got {:?}", other),
        };
        let logits = output
            .as_slice::<f32>()
            .map_err(|e| anyhow::anyhow!("text reader output is not f32: {e}"))?;
        Ok(ctc_greedy_decode(logits, classes, &self.charset))
    }
}

/// Best-path decoding: argmax per step, collapse repeats, drop blanks.
/// Confidence is the mean softmax probability of the kept characters.
pub fn ctc_greedy_decode(logits: &[f32], classes: usize, charset: &[char]) -> Option<TextReading> {
    if classes == 0 {
        return None;
    }
    let mut text = String::new();
    let mut probs = Vec::new();
    let mut previous = 0usize;
    for step in logits.chunks_exact(classes) {
        let (best, best_logit) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc });
        if best != 0 && best != previous {
            if let Some(ch) = charset.get(best - 1) {
                let denom: f32 = step.iter().map(|v| (v - best_logit).exp()).sum();
                text.push(*ch);
                probs.push(1.0 / denom);
            }
        }
        previous = best;
    }
    if text.is_empty() {
        return None;
    }
    Some(TextReading {
        confidence: probs.iter().sum::<f32>() / probs.len() as f32,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_rows_become_top_left_boxes() {
        let rows = [
            320.0, 320.0, 64.0, 16.0, 0.9, 0.8, // kept
            10.0, 10.0, 4.0, 4.0, 0.1, 0.9, // below objectness
        ];
        let found = decode_locator_rows(&rows, 2.0, 0.5, 0.25).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].x, 576.0);
        assert_eq!(found[0].y, 156.0);
        assert_eq!((found[0].width, found[0].height), (128.0, 8.0));
        assert_eq!(found[0].class_prob, 0.8);
    }

    #[test]
    fn ragged_locator_output_is_rejected() {
        assert!(decode_locator_rows(&[1.0; 7], 1.0, 1.0, 0.0).is_err());
    }

    fn one_hot(index: usize, classes: usize) -> Vec<f32> {
        (0..classes).map(|i| if i == index { 10.0 } else { 0.0 }).collect()
    }

    #[test]
    fn ctc_collapses_repeats_and_drops_blanks() {
        let charset: Vec<char> = "AB".chars().collect();
        // A A blank A B B -> "AAB"
        let steps = [1, 1, 0, 1, 2, 2];
        let logits: Vec<f32> = steps.iter().flat_map(|&s| one_hot(s, 3)).collect();
        let reading = ctc_greedy_decode(&logits, 3, &charset).unwrap();
        assert_eq!(reading.text, "AAB");
        assert!(reading.confidence > 0.99);
    }

    #[test]
    fn all_blank_reads_nothing() {
        let logits: Vec<f32> = (0..4).flat_map(|_| one_hot(0, 5)).collect();
        assert!(ctc_greedy_decode(&logits, 5, &['X'; 4]).is_none());
    }
}
