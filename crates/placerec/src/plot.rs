//! ROC curve rendering.
//!
//! Draws the curve on a plain raster: white background, black axes frame,
//! grey chance diagonal and the curve polyline, with `(0, 0)` at the bottom
//! left and `(1, 1)` at the top right.

use std::path::Path;

use image::{Rgb, RgbImage};

use crate::training::roc::RocCurve;

pub const PLOT_SIZE: u32 = 480;
const MARGIN: u32 = 40;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const FRAME: Rgb<u8> = Rgb([0, 0, 0]);
const CHANCE: Rgb<u8> = Rgb([160, 160, 160]);
const CURVE: Rgb<u8> = Rgb([255, 140, 0]);

/// Render `curve` and save it as a PNG at `path`, creating parent directories.
pub fn draw_roc_curve(curve: &RocCurve, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!("Failed to create plot dir {}: {e}", parent.display())
        })?;
    }
    render_roc_curve(curve)
        .save(path)
        .map_err(|e| anyhow::anyhow!("Failed to write ROC plot {}: {e}", path.display()))?;
    tracing::debug!(path = %path.display(), auc = curve.auc(), "ROC curve written");
    Ok(())
}

pub fn render_roc_curve(curve: &RocCurve) -> RgbImage {
    let mut img = RgbImage::from_pixel(PLOT_SIZE, PLOT_SIZE, BACKGROUND);

    draw_line(&mut img, to_px(0.0, 0.0), to_px(1.0, 1.0), CHANCE, 1);
    let points: Vec<(f64, f64)> = curve
        .fpr
        .iter()
        .zip(&curve.tpr)
        .map(|(&x, &y)| to_px(x, y))
        .collect();
    for pair in points.windows(2) {
        draw_line(&mut img, pair[0], pair[1], CURVE, 2);
    }
    draw_frame(&mut img);
    img
}

/// Map a point of the unit square to pixel coordinates (y grows downwards).
fn to_px(x: f64, y: f64) -> (f64, f64) {
    let span = f64::from(PLOT_SIZE - 2 * MARGIN - 1);
    let x = x.clamp(0.0, 1.0);
    let y = y.clamp(0.0, 1.0);
    (
        f64::from(MARGIN) + x * span,
        f64::from(PLOT_SIZE - MARGIN - 1) - y * span,
    )
}

fn draw_frame(img: &mut RgbImage) {
    let lo = MARGIN;
    let hi = PLOT_SIZE - MARGIN - 1;
    for t in lo..=hi {
        img.put_pixel(t, lo, FRAME);
        img.put_pixel(t, hi, FRAME);
        img.put_pixel(lo, t, FRAME);
        img.put_pixel(hi, t, FRAME);
    }
}

/// Draw a straight segment by sampling one point per pixel of its longer axis.
fn draw_line(img: &mut RgbImage, from: (f64, f64), to: (f64, f64), color: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    let steps = (to.0 - from.0).abs().max((to.1 - from.1).abs()).ceil().max(1.0) as u32;
    let half = thickness as i64 / 2;
    for s in 0..=steps {
        let t = f64::from(s) / f64::from(steps);
        let cx = (from.0 + (to.0 - from.0) * t).round() as i64;
        let cy = (from.1 + (to.1 - from.1) * t).round() as i64;
        for dx in -half..thickness as i64 - half {
            for dy in -half..thickness as i64 - half {
                let (x, y) = (cx + dx, cy + dy);
                if x >= 0 && y >= 0 && (x as u32) < w && (y as u32) < h {
                    img.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
}
