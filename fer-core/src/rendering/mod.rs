//! rendering: face annotations and emotion-frequency bar charts
//!
//! Both draw with `imageproc` onto `RgbImage` buffers using the DejaVu Sans
//! font embedded in the crate. Charts are written as single-page PDFs.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use ab_glyph::{FontRef, PxScale};
use anyhow::{Context, Result};
use image::{ImageError, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use printpdf::{
    ColorBits, ColorSpace, Image, ImageTransform, ImageXObject, Mm, PdfDocument, Px,
};

use crate::detection::BoundingBox;
use crate::emotion::{EmotionLabel, NUM_EMOTIONS};
use crate::error::DemoError;

static FONT_BYTES: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

/// Box outline color.
pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Caption color.
pub const TEXT_COLOR: Rgb<u8> = Rgb([36, 255, 12]);
/// Box outline thickness in pixels.
const BOX_THICKNESS: u32 = 2;
/// Gap between caption baseline area and the top edge of the box.
const CAPTION_GAP: i32 = 4;

fn load_font() -> Result<FontRef<'static>> {
    FontRef::try_from_slice(FONT_BYTES).context("embedded annotation font is invalid")
}

/// Caption for one face: `"Happiness"` or `"Happiness (87.23%)"`.
pub fn caption(label: EmotionLabel, confidence: Option<f32>) -> String {
    match confidence {
        Some(c) => format!("{label} ({:.2}%)", c * 100.0),
        None => label.to_string(),
    }
}

// ── Annotator ────────────────────────────────────────────────────────────────

/// Draws face boxes and captions onto images or frames.
pub struct Annotator {
    font: FontRef<'static>,
    scale: PxScale,
}

impl Annotator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            font: load_font()?,
            scale: PxScale::from(24.0),
        })
    }

    /// Draw one face: a 2-px box and the caption just above it (or inside
    /// the top edge when the box touches the top of the image).
    pub fn annotate(&self, image: &mut RgbImage, bbox: BoundingBox, text: &str) {
        let (width, height) = image.dimensions();
        for inset in 0..BOX_THICKNESS {
            let w = bbox.w.saturating_sub(2 * inset);
            let h = bbox.h.saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(image, rect, BOX_COLOR);
        }

        if text.is_empty() || width == 0 || height == 0 {
            return;
        }
        let (_tw, th) = text_size(self.scale, &self.font, text);
        let y = (bbox.y as i32 - th as i32 - CAPTION_GAP).max(0);
        draw_text_mut(image, TEXT_COLOR, bbox.x as i32, y, self.scale, &self.font, text);
    }
}

// ── Bar charts ───────────────────────────────────────────────────────────────

/// How bar values are printed above each bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Integer,
    TwoDecimals,
}

impl ValueFormat {
    fn format(self, v: f64) -> String {
        match self {
            ValueFormat::Integer => format!("{}", v.round() as i64),
            ValueFormat::TwoDecimals => format!("{v:.2}"),
        }
    }
}

/// A labeled bar chart: one bar per emotion.
#[derive(Debug, Clone)]
pub struct BarChart {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub values: [f64; NUM_EMOTIONS],
    pub format: ValueFormat,
}

impl BarChart {
    /// Raw per-label counts.
    pub fn frequencies(values: [f64; NUM_EMOTIONS], y_label: &str) -> Self {
        Self {
            title: "Expression frequencies".into(),
            x_label: "Expressions".into(),
            y_label: y_label.into(),
            values,
            format: ValueFormat::Integer,
        }
    }

    /// Counts divided by evaluated frames.
    pub fn mean_frequencies(values: [f64; NUM_EMOTIONS]) -> Self {
        Self {
            title: "Expression mean frequencies".into(),
            x_label: "Expressions".into(),
            y_label: "Mean Frequencies".into(),
            values,
            format: ValueFormat::TwoDecimals,
        }
    }
}

/// Color `i` of an `n`-step rainbow ramp (violet → red).
pub fn rainbow(i: usize, n: usize) -> Rgb<u8> {
    let x = if n <= 1 { 0.0 } else { i as f64 / (n - 1) as f64 };
    let r = (2.0 * x - 1.0).abs();
    let g = (std::f64::consts::PI * x).sin();
    let b = (std::f64::consts::PI * x / 2.0).cos();
    let to_u8 = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}

/// Rasterizes [`BarChart`]s to PNG.
pub struct ChartRenderer {
    font: FontRef<'static>,
    width: u32,
    height: u32,
}

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const INK: Rgb<u8> = Rgb([0, 0, 0]);
const GRID: Rgb<u8> = Rgb([220, 220, 220]);
const MARGIN_LEFT: u32 = 90;
const MARGIN_RIGHT: u32 = 30;
const MARGIN_TOP: u32 = 60;
const MARGIN_BOTTOM: u32 = 90;
const Y_TICKS: u32 = 5;
/// Page resolution of the chart PDF; one raster pixel is 1/96 inch.
const CHART_DPI: f32 = 96.0;

impl ChartRenderer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            font: load_font()?,
            width: 900,
            height: 600,
        })
    }

    pub fn render(&self, chart: &BarChart) -> RgbImage {
        let mut img = RgbImage::from_pixel(self.width, self.height, BACKGROUND);
        let plot_w = self.width - MARGIN_LEFT - MARGIN_RIGHT;
        let plot_h = self.height - MARGIN_TOP - MARGIN_BOTTOM;
        let x0 = MARGIN_LEFT as f32;
        let y0 = (MARGIN_TOP + plot_h) as f32;

        let max = chart.values.iter().cloned().fold(0.0f64, f64::max);
        let y_max = if max > 0.0 { nice_ceiling(max * 1.1) } else { 1.0 };

        // y grid + ticks
        let tick_scale = PxScale::from(14.0);
        for t in 0..=Y_TICKS {
            let v = y_max * t as f64 / Y_TICKS as f64;
            let y = y0 - (v / y_max) as f32 * plot_h as f32;
            if t > 0 {
                draw_line_segment_mut(&mut img, (x0 + 1.0, y), (x0 + plot_w as f32, y), GRID);
            }
            draw_line_segment_mut(&mut img, (x0 - 5.0, y), (x0, y), INK);
            let text = format_tick(v, chart.format);
            let (tw, th) = text_size(tick_scale, &self.font, &text);
            draw_text_mut(
                &mut img,
                INK,
                x0 as i32 - 8 - tw as i32,
                y as i32 - th as i32 / 2,
                tick_scale,
                &self.font,
                &text,
            );
        }

        // bars
        let slot = plot_w as f32 / NUM_EMOTIONS as f32;
        let bar_w = (slot * 0.8).max(1.0);
        let label_scale = PxScale::from(15.0);
        for (i, label) in EmotionLabel::ALL.iter().enumerate() {
            let v = chart.values[i].max(0.0);
            let bar_h = ((v / y_max) * plot_h as f64).round() as u32;
            let left = x0 + slot * i as f32 + (slot - bar_w) / 2.0;
            if bar_h > 0 {
                let rect = Rect::at(left as i32, (y0 as u32 - bar_h) as i32)
                    .of_size(bar_w as u32, bar_h);
                draw_filled_rect_mut(&mut img, rect, rainbow(i, NUM_EMOTIONS));
            }

            let value = chart.format.format(chart.values[i]);
            let (vw, vh) = text_size(label_scale, &self.font, &value);
            let cx = left + bar_w / 2.0;
            draw_text_mut(
                &mut img,
                INK,
                (cx - vw as f32 / 2.0) as i32,
                (y0 as i32 - bar_h as i32 - vh as i32 - 6).max(0),
                label_scale,
                &self.font,
                &value,
            );

            let name = label.as_str();
            let (nw, _) = text_size(label_scale, &self.font, name);
            draw_text_mut(
                &mut img,
                INK,
                (cx - nw as f32 / 2.0) as i32,
                y0 as i32 + 10,
                label_scale,
                &self.font,
                name,
            );
        }

        // axes
        draw_line_segment_mut(&mut img, (x0, MARGIN_TOP as f32), (x0, y0), INK);
        draw_line_segment_mut(&mut img, (x0, y0), (x0 + plot_w as f32, y0), INK);

        // titles
        let title_scale = PxScale::from(24.0);
        let (tw, _) = text_size(title_scale, &self.font, &chart.title);
        draw_text_mut(
            &mut img,
            INK,
            (self.width as i32 - tw as i32) / 2,
            18,
            title_scale,
            &self.font,
            &chart.title,
        );

        let axis_scale = PxScale::from(18.0);
        let (xw, xh) = text_size(axis_scale, &self.font, &chart.x_label);
        draw_text_mut(
            &mut img,
            INK,
            MARGIN_LEFT as i32 + (plot_w as i32 - xw as i32) / 2,
            self.height as i32 - xh as i32 - 20,
            axis_scale,
            &self.font,
            &chart.x_label,
        );
        draw_vertical_text(&mut img, &self.font, axis_scale, 14, MARGIN_TOP + plot_h / 2, &chart.y_label);

        img
    }

    /// Render `chart` and write it as a one-page PDF to `path`.
    pub fn save(&self, chart: &BarChart, path: &Path) -> Result<()> {
        save_pdf(&self.render(chart), &chart.title, path)
    }
}

/// Write `image` as PNG. File-system failures surface as [`DemoError::Io`].
pub fn save_png(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| match e {
            ImageError::IoError(io) => anyhow::Error::new(DemoError::io(path, io)),
            other => anyhow::Error::new(other)
                .context(format!("failed to encode {}", path.display())),
        })
}

/// Write `image` as a single-page PDF whose page is exactly the raster.
pub fn save_pdf(image: &RgbImage, title: &str, path: &Path) -> Result<()> {
    let (w, h) = image.dimensions();
    let page_mm = |px: u32| Mm(px as f32 * 25.4 / CHART_DPI);
    let (doc, page, layer) = PdfDocument::new(title, page_mm(w), page_mm(h), "chart");
    let layer = doc.get_page(page).get_layer(layer);
    Image::from(ImageXObject {
        width: Px(w as usize),
        height: Px(h as usize),
        color_space: ColorSpace::Rgb,
        bits_per_component: ColorBits::Bit8,
        interpolate: false,
        image_data: image.as_raw().clone(),
        image_filter: None,
        smask: None,
        clipping_bbox: None,
    })
    .add_to_layer(
        layer,
        ImageTransform {
            dpi: Some(CHART_DPI),
            ..Default::default()
        },
    );

    let file = File::create(path).map_err(|e| DemoError::io(path, e))?;
    doc.save(&mut BufWriter::new(file)).map_err(|e| match e {
        printpdf::Error::Io(io) => anyhow::Error::new(DemoError::io(path, io)),
        other => anyhow::anyhow!("failed to write {}: {other}", path.display()),
    })
}

/// Draw `text` rotated 90° counter-clockwise, centered vertically on `cy`.
fn draw_vertical_text(
    img: &mut RgbImage,
    font: &FontRef<'static>,
    scale: PxScale,
    x: u32,
    cy: u32,
    text: &str,
) {
    let (tw, th) = text_size(scale, font, text);
    if tw == 0 || th == 0 {
        return;
    }
    let mut strip = RgbImage::from_pixel(tw + 2, th + 4, BACKGROUND);
    draw_text_mut(&mut strip, INK, 1, 0, scale, font, text);
    let rotated = image::imageops::rotate270(&strip);
    let top = cy.saturating_sub(rotated.height() / 2) as i64;
    image::imageops::overlay(img, &rotated, x as i64, top);
}

/// Smallest 1/2/5 × 10^k value at or above `v`.
fn nice_ceiling(v: f64) -> f64 {
    let exp = v.log10().floor();
    let base = 10f64.powf(exp);
    for m in [1.0, 2.0, 5.0, 10.0] {
        if m * base >= v {
            return m * base;
        }
    }
    10.0 * base
}

fn format_tick(v: f64, format: ValueFormat) -> String {
    match format {
        ValueFormat::Integer if (v - v.round()).abs() < 1e-9 => format!("{}", v.round() as i64),
        _ => format!("{v:.2}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captions_match_image_and_video_modes() {
        assert_eq!(caption(EmotionLabel::Happiness, None), "Happiness");
        assert_eq!(
            caption(EmotionLabel::Anger, Some(0.87234)),
            "Anger (87.23%)"
        );
        assert_eq!(caption(EmotionLabel::Neutral, Some(1.0)), "Neutral (100.00%)");
    }

    #[test]
    fn annotate_draws_box_edges_in_green() {
        let annotator = Annotator::new().unwrap();
        let mut img = RgbImage::new(100, 100);
        annotator.annotate(&mut img, BoundingBox::new(40, 40, 30, 30), "Fear");
        assert_eq!(*img.get_pixel(40, 50), BOX_COLOR);
        assert_eq!(*img.get_pixel(41, 50), BOX_COLOR);
        assert_eq!(*img.get_pixel(69, 50), BOX_COLOR);
        assert_eq!(*img.get_pixel(55, 55), Rgb([0, 0, 0]));
    }

    #[test]
    fn caption_is_drawn_above_the_box() {
        let annotator = Annotator::new().unwrap();
        let mut img = RgbImage::new(200, 200);
        annotator.annotate(&mut img, BoundingBox::new(20, 100, 80, 80), "Happiness");
        let above = (20..200)
            .flat_map(|x| (0..100).map(move |y| (x, y)))
            .any(|(x, y)| img.get_pixel(x, y).0 != [0, 0, 0]);
        assert!(above);
    }

    #[test]
    fn caption_at_top_edge_does_not_panic() {
        let annotator = Annotator::new().unwrap();
        let mut img = RgbImage::new(50, 50);
        annotator.annotate(&mut img, BoundingBox::new(0, 0, 50, 50), "Surprise (12.00%)");
    }

    #[test]
    fn rainbow_runs_violet_to_red() {
        assert_eq!(rainbow(0, 7), Rgb([255, 0, 255]));
        assert_eq!(rainbow(6, 7), Rgb([255, 0, 0]));
        let mid = rainbow(3, 7);
        assert_eq!(mid.0[1], 255);
    }

    #[test]
    fn value_formats() {
        assert_eq!(ValueFormat::Integer.format(3.0), "3");
        assert_eq!(ValueFormat::TwoDecimals.format(0.4), "0.40");
    }

    #[test]
    fn nice_ceiling_steps() {
        assert!((nice_ceiling(3.3) - 5.0).abs() < 1e-9);
        assert!((nice_ceiling(0.44) - 0.5).abs() < 1e-9);
        assert!((nice_ceiling(11.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn chart_renders_bars_and_all_zero_charts() {
        let renderer = ChartRenderer::new().unwrap();
        let mut values = [0.0; NUM_EMOTIONS];
        values[3] = 4.0;
        let img = renderer.render(&BarChart::frequencies(values, "Frequency"));
        assert_eq!(img.dimensions(), (900, 600));
        let happiness = rainbow(3, NUM_EMOTIONS);
        assert!(img.pixels().any(|p| *p == happiness));

        let empty = renderer.render(&BarChart::frequencies([0.0; NUM_EMOTIONS], "Frequency"));
        assert!(!empty.pixels().any(|p| *p == happiness));
    }

    #[test]
    fn chart_is_written_as_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chart.pdf");
        let renderer = ChartRenderer::new().unwrap();
        renderer
            .save(&BarChart::mean_frequencies([0.5; NUM_EMOTIONS]), &path)
            .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
        assert!(bytes.windows(8).any(|w| w == b"/XObject"));
    }

    #[test]
    fn pdf_into_missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("chart.pdf");
        let err = save_pdf(&RgbImage::new(4, 4), "t", &path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DemoError>(),
            Some(DemoError::Io { .. })
        ));
    }

    #[test]
    fn unwritable_chart_path_is_an_io_failure() {
        let renderer = ChartRenderer::new().unwrap();
        let err = renderer
            .save(
                &BarChart::frequencies([0.0; NUM_EMOTIONS], "Frequency"),
                Path::new("/nonexistent/dir/chart.png"),
            )
            .unwrap_err();
        assert_eq!(
            crate::error::FailureKind::of(&err),
            crate::error::FailureKind::Io
        );
    }
}
