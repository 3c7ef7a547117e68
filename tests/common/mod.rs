#![allow(dead_code)]

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::sync::Arc;

use veilpix::AppState;
use veilpix::config::Settings;
use veilpix::detection::scan_worker::ScanWorker;
use veilpix::services::MemoryStore;

pub const BACKGROUND: Rgb<u8> = Rgb([128, 128, 128]);
pub const FACE_AT: (u32, u32) = (40, 40);
pub const PLATE_AT: (u32, u32) = (320, 240);

fn fill(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    for yy in y..y + h {
        for xx in x..x + w {
            img.put_pixel(xx, yy, color);
        }
    }
}

/// 480x320 grey scene with one face and one plate far apart.
pub fn street_scene() -> RgbImage {
    let mut img = RgbImage::from_pixel(480, 320, BACKGROUND);

    let (fx, fy) = FACE_AT;
    fill(&mut img, fx, fy, 64, 64, Rgb([224, 172, 140]));
    fill(&mut img, fx + 14, fy + 20, 10, 6, Rgb([30, 30, 30]));
    fill(&mut img, fx + 40, fy + 20, 10, 6, Rgb([30, 30, 30]));
    fill(&mut img, fx + 20, fy + 44, 24, 4, Rgb([120, 40, 40]));

    let (px, py) = PLATE_AT;
    fill(&mut img, px, py, 96, 24, Rgb([255, 255, 255]));
    for i in 0..11 {
        fill(&mut img, px + 6 + i * 8, py + 5, 3, 14, Rgb([0, 0, 0]));
    }
    img
}

pub fn encode_png(img: RgbImage) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), ImageOutputFormat::Png)
        .unwrap();
    out
}

pub fn app_state(settings: Settings) -> (AppState, ScanWorker) {
    let worker = ScanWorker::spawn(4).unwrap();
    let state = AppState::build(settings, Arc::new(MemoryStore::new()), worker.handle()).unwrap();
    (state, worker)
}
