//! Stylized low-fidelity previews for progressive loading.
//!
//! Tessellation parameters are drawn from an injected [`PreviewParams`] so two
//! jobs never produce the same facets, while tests can fix the seed.

use std::sync::Mutex;

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::PreviewMode;

/// Previews are never wider than this.
pub const PREVIEW_WIDTH: u32 = 960;
pub const PREVIEW_QUALITY: u8 = 70;

const BLUR_SIGMA: f32 = 10.0;
const PIXEL_BLOCK: u32 = 24;
const TESSELLATION_PRE_BLUR: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TessellationParams {
    /// Approximate number of grid vertices, 51..=130.
    pub vertex_count: u32,
    /// 0.00..=0.25. Higher keeps the grid more regular.
    pub accuracy: f32,
    /// Seeds the vertex jitter.
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreviewStyle {
    Blur { sigma: f32 },
    Pixelate { block: u32 },
    Tessellate(TessellationParams),
}

/// Source of per-job preview randomness.
#[derive(Debug)]
pub struct PreviewParams {
    rng: Mutex<StdRng>,
}

impl PreviewParams {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn style_for(&self, mode: PreviewMode) -> Option<PreviewStyle> {
        match mode {
            PreviewMode::None => None,
            PreviewMode::Blur => Some(PreviewStyle::Blur { sigma: BLUR_SIGMA }),
            PreviewMode::Pixelate => Some(PreviewStyle::Pixelate { block: PIXEL_BLOCK }),
            PreviewMode::Tessellate => Some(PreviewStyle::Tessellate(self.tessellation())),
        }
    }

    fn tessellation(&self) -> TessellationParams {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        TessellationParams {
            vertex_count: rng.random_range(51..=130),
            accuracy: rng.random_range(0..=25) as f32 / 100.0,
            seed: rng.random(),
        }
    }
}

/// Scales `img` down to the preview width and applies `style`.
pub fn render(img: &DynamicImage, style: &PreviewStyle) -> DynamicImage {
    let width = img.width().min(PREVIEW_WIDTH).max(1);
    let height = scaled_height(img.width(), img.height(), width);
    let scaled = img.resize_exact(width, height, FilterType::Triangle);

    match style {
        PreviewStyle::Blur { sigma } => scaled.blur(*sigma),
        PreviewStyle::Pixelate { block } => pixelate(&scaled, *block),
        PreviewStyle::Tessellate(params) => {
            DynamicImage::ImageRgb8(tessellate(&scaled.to_rgb8(), params))
        }
    }
}

/// Height that keeps the aspect ratio of `width x height` at `target_width`.
pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return height.max(1);
    }
    ((height as u64 * target_width as u64 + width as u64 / 2) / width as u64).max(1) as u32
}

fn pixelate(img: &DynamicImage, block: u32) -> DynamicImage {
    let block = block.max(1);
    let (w, h) = (img.width(), img.height());
    let small = img.resize_exact(w.div_ceil(block), h.div_ceil(block), FilterType::Triangle);
    small.resize_exact(w, h, FilterType::Nearest)
}

/// Flat-shaded low-poly rendering: a jittered vertex grid split into triangles, each
/// filled with the colour under its centroid.
pub fn tessellate(img: &RgbImage, params: &TessellationParams) -> RgbImage {
    let (w, h) = img.dimensions();
    let source = imageops::blur(img, TESSELLATION_PRE_BLUR);
    let mut out = source.clone();
    if w < 2 || h < 2 {
        return out;
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let vertices = params.vertex_count.max(4) as f32;
    let cols = ((vertices * w as f32 / h as f32).sqrt().ceil() as u32).clamp(1, w);
    let rows = ((vertices / cols as f32).ceil() as u32).clamp(1, h);
    let cell_w = w as f32 / cols as f32;
    let cell_h = h as f32 / rows as f32;
    let jitter = (0.5 - params.accuracy).clamp(0.0, 0.5) * 0.8;

    let mut grid = Vec::with_capacity(((cols + 1) * (rows + 1)) as usize);
    for row in 0..=rows {
        for col in 0..=cols {
            let mut x = col as f32 * cell_w;
            let mut y = row as f32 * cell_h;
            if col > 0 && col < cols {
                x += rng.random_range(-jitter..=jitter) * cell_w;
            }
            if row > 0 && row < rows {
                y += rng.random_range(-jitter..=jitter) * cell_h;
            }
            grid.push((x, y));
        }
    }

    let at = |col: u32, row: u32| grid[(row * (cols + 1) + col) as usize];
    for row in 0..rows {
        for col in 0..cols {
            let (a, b, c, d) = (at(col, row), at(col + 1, row), at(col + 1, row + 1), at(col, row + 1));
            let triangles = if rng.random::<bool>() {
                [[a, b, c], [a, c, d]]
            } else {
                [[a, b, d], [b, c, d]]
            };
            for tri in triangles {
                let colour = sample(&source, centroid(&tri));
                fill_triangle(&mut out, &tri, colour);
            }
        }
    }
    out
}

fn centroid(tri: &[(f32, f32); 3]) -> (f32, f32) {
    (
        (tri[0].0 + tri[1].0 + tri[2].0) / 3.0,
        (tri[0].1 + tri[1].1 + tri[2].1) / 3.0,
    )
}

fn sample(img: &RgbImage, (x, y): (f32, f32)) -> Rgb<u8> {
    let x = (x.max(0.0) as u32).min(img.width() - 1);
    let y = (y.max(0.0) as u32).min(img.height() - 1);
    *img.get_pixel(x, y)
}

fn edge(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> f32 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

fn fill_triangle(img: &mut RgbImage, tri: &[(f32, f32); 3], colour: Rgb<u8>) {
    let (w, h) = img.dimensions();
    let min_x = tri.iter().map(|p| p.0).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let min_y = tri.iter().map(|p| p.1).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let max_x = (tri.iter().map(|p| p.0).fold(f32::MIN, f32::max).ceil() as u32).min(w);
    let max_y = (tri.iter().map(|p| p.1).fold(f32::MIN, f32::max).ceil() as u32).min(h);

    for y in min_y..max_y {
        for x in min_x..max_x {
            let p = (x as f32 + 0.5, y as f32 + 0.5);
            let e0 = edge(tri[0], tri[1], p);
            let e1 = edge(tri[1], tri[2], p);
            let e2 = edge(tri[2], tri[0], p);
            let inside = (e0 >= 0.0 && e1 >= 0.0 && e2 >= 0.0) || (e0 <= 0.0 && e1 <= 0.0 && e2 <= 0.0);
            if inside {
                img.put_pixel(x, y, colour);
            }
        }
    }
}
