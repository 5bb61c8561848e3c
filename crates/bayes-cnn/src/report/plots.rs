//! PNG figures drawn with the plotters bitmap backend.
//!
//! Figures are drawn with captions, axis descriptions and legends. If the
//! font backend cannot render text the figure is redrawn without labels and
//! a warning is logged; the numbers behind every legend also go to the run log.

use std::ops::Range;
use std::path::Path;

use patches::Batch;
use plotters::coord::types::RangedCoordf64;
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::report::roc::RocResult;
use crate::uncertainty::McSamples;

const HISTOGRAM_BINS: usize = 40;
const FONT: &str = "sans-serif";
/// Thumbnails are downsampled to at most this many cells per side.
const THUMBNAIL_CELLS: usize = 32;

fn plot_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow::anyhow!("plot error: {e}")
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Run `draw` with labels, falling back to an unlabeled figure when text
/// rendering fails.
fn draw_labeled_or_plain(
    path: &Path,
    draw: impl Fn(bool) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    ensure_parent(path)?;
    match draw(true) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not draw figure text, saving it without labels"
            );
            draw(false)
        }
    }
}

type Chart<'a, DB> = ChartContext<'a, DB, Cartesian2d<RangedCoordf64, RangedCoordf64>>;

/// Light grid lines every fifth of each axis plus a frame.
fn draw_grid<DB: DrawingBackend>(
    chart: &mut Chart<'_, DB>,
    x: Range<f64>,
    y: Range<f64>,
) -> anyhow::Result<()> {
    let style = BLACK.mix(0.1).stroke_width(1);
    for i in 0..=5 {
        let fx = x.start + (x.end - x.start) * i as f64 / 5.0;
        let fy = y.start + (y.end - y.start) * i as f64 / 5.0;
        chart
            .draw_series(LineSeries::new(vec![(fx, y.start), (fx, y.end)], style))
            .map_err(plot_err)?;
        chart
            .draw_series(LineSeries::new(vec![(x.start, fy), (x.end, fy)], style))
            .map_err(plot_err)?;
    }
    chart
        .draw_series(std::iter::once(Rectangle::new(
            [(x.start, y.start), (x.end, y.end)],
            BLACK.stroke_width(1),
        )))
        .map_err(plot_err)?;
    Ok(())
}

/// Build a chart over `x` by `y`, with caption and axis descriptions when
/// `labeled`, otherwise with a plain grid.
fn chart_on<'a, DB: DrawingBackend>(
    area: &'a DrawingArea<DB, Shift>,
    labeled: bool,
    caption: &str,
    (x_desc, y_desc): (&str, &str),
    x: Range<f64>,
    y: Range<f64>,
) -> anyhow::Result<Chart<'a, DB>> {
    let mut builder = ChartBuilder::on(area);
    builder.margin(15);
    if labeled {
        builder
            .caption(caption, (FONT, 22))
            .x_label_area_size(40)
            .y_label_area_size(50);
    }
    let mut chart = builder
        .build_cartesian_2d(x.clone(), y.clone())
        .map_err(plot_err)?;
    if labeled {
        chart
            .configure_mesh()
            .x_desc(x_desc)
            .y_desc(y_desc)
            .draw()
            .map_err(plot_err)?;
    } else {
        draw_grid(&mut chart, x, y)?;
    }
    Ok(chart)
}

/// One ROC panel: a comparison name and one curve per Monte-Carlo count.
#[derive(Debug, Clone)]
pub struct RocPanel {
    pub name: String,
    pub curves: Vec<(usize, RocResult)>,
}

/// Render up to ten ROC panels as a 2x5 grid.
///
/// Each panel is titled with its comparison name and carries a legend of
/// `"{T} mc:{auroc}"` entries. Curve `i` of every panel uses the same
/// palette color, so a Monte-Carlo count keeps its color across panels. The
/// optimal point is marked.
pub fn roc_grid(path: &Path, panels: &[RocPanel]) -> anyhow::Result<()> {
    draw_labeled_or_plain(path, |labeled| draw_roc_grid(path, panels, labeled))
}

fn draw_roc_grid(path: &Path, panels: &[RocPanel], labeled: bool) -> anyhow::Result<()> {
    let root = BitMapBackend::new(path, (2500, 1000)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    for (area, panel) in root.split_evenly((2, 5)).iter().zip(panels) {
        let mut chart = chart_on(area, labeled, &panel.name, ("FPR", "TPR"), 0.0..1.0, 0.0..1.0)?;
        chart
            .draw_series(LineSeries::new(
                vec![(0.0, 0.0), (1.0, 1.0)],
                BLACK.mix(0.3).stroke_width(1),
            ))
            .map_err(plot_err)?;

        for (i, (num_samples, roc)) in panel.curves.iter().enumerate() {
            let color = Palette99::pick(i).to_rgba();
            chart
                .draw_series(LineSeries::new(
                    roc.fpr.iter().copied().zip(roc.tpr.iter().copied()),
                    color.stroke_width(2),
                ))
                .map_err(plot_err)?
                .label(format!("{num_samples} mc:{:.4}", roc.auroc))
                .legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                });
            let (fpr, tpr, _) = roc.optimal;
            chart
                .draw_series(std::iter::once(Circle::new((fpr, tpr), 4, color.filled())))
                .map_err(plot_err)?;
            tracing::debug!(panel = %panel.name, num_samples, auroc = roc.auroc, "ROC curve drawn");
        }

        if labeled && !panel.curves.is_empty() {
            chart
                .configure_series_labels()
                .position(SeriesLabelPosition::LowerRight)
                .background_style(&WHITE.mix(0.8))
                .border_style(&BLACK)
                .label_font((FONT, 14))
                .draw()
                .map_err(plot_err)?;
        }
    }

    root.present().map_err(plot_err)?;
    Ok(())
}

/// Normalized histogram of `values` over `range` as `(bin center, density)`.
pub fn density(values: &[f32], range: &Range<f64>, bins: usize) -> Vec<(f64, f64)> {
    let bins = bins.max(1);
    let width = (range.end - range.start) / bins as f64;
    let mut counts = vec![0usize; bins];
    for &v in values {
        let v = v as f64;
        if v < range.start || v > range.end || width <= 0.0 {
            continue;
        }
        let idx = (((v - range.start) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let norm = values.len().max(1) as f64 * width.max(f64::MIN_POSITIVE);
    counts
        .iter()
        .enumerate()
        .map(|(i, &c)| (range.start + (i as f64 + 0.5) * width, c as f64 / norm))
        .collect()
}

/// Span of every value in `groups`, padded so a constant group still has width.
fn value_range(groups: &[Vec<f32>]) -> Range<f64> {
    let (lo, hi) = groups
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v as f64), hi.max(v as f64))
        });
    if !lo.is_finite() || !hi.is_finite() {
        return 0.0..1.0;
    }
    let pad = ((hi - lo) * 0.05).max(0.5 * f64::max(hi.abs(), 1.0) * 1e-2);
    (lo - pad)..(hi + pad)
}

fn draw_densities<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    labeled: bool,
    title: &str,
    names: &[String],
    groups: &[Vec<f32>],
) -> anyhow::Result<()> {
    let x = value_range(groups);
    let curves: Vec<Vec<(f64, f64)>> = groups
        .iter()
        .map(|values| density(values, &x, HISTOGRAM_BINS))
        .collect();
    let y_max = curves
        .iter()
        .flatten()
        .map(|&(_, d)| d)
        .fold(0.0, f64::max)
        .max(1e-6)
        * 1.1;

    let mut chart = chart_on(area, labeled, title, ("value", "density"), x, 0.0..y_max)?;
    for (i, (curve, name)) in curves.into_iter().zip(names).enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(
                AreaSeries::new(curve, 0.0, color.mix(0.2).filled())
                    .border_style(color.stroke_width(2)),
            )
            .map_err(plot_err)?
            .label(name.as_str())
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 15, y + 5)], color.filled()));
    }
    if labeled && !names.is_empty() {
        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperRight)
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .label_font((FONT, 14))
            .draw()
            .map_err(plot_err)?;
    }
    Ok(())
}

/// Distributions of kernel means (left) and standard deviations (right),
/// one colored density per layer, labeled with the layer name.
pub fn plot_weight_posteriors(
    path: &Path,
    names: &[String],
    means: &[Vec<f32>],
    stds: &[Vec<f32>],
) -> anyhow::Result<()> {
    anyhow::ensure!(
        names.len() == means.len() && names.len() == stds.len(),
        "one mean and one std vector per layer expected"
    );
    draw_labeled_or_plain(path, |labeled| {
        let root = BitMapBackend::new(path, (1200, 500)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let (left, right) = root.split_horizontally(600);
        draw_densities(&left, labeled, "kernel means", names, means)?;
        draw_densities(&right, labeled, "kernel standard deviations", names, stds)?;
        root.present().map_err(plot_err)?;
        Ok(())
    })?;
    tracing::info!(path = %path.display(), layers = ?names, "Saved weight distribution plot");
    Ok(())
}

/// Grayscale cells of example `index`, at most `THUMBNAIL_CELLS` per side,
/// as `(row, col, value)`.
fn thumbnail_cells(batch: &Batch, index: usize) -> (usize, Vec<(usize, usize, f32)>) {
    let size = batch.image_size;
    let cells = size.min(THUMBNAIL_CELLS).max(1);
    let stride = size.div_ceil(cells).max(1);
    let offset = index * size * size;
    let mut out = Vec::with_capacity(cells * cells);
    for row in 0..cells {
        for col in 0..cells {
            let (y, x) = ((row * stride).min(size - 1), (col * stride).min(size - 1));
            let v = batch.pixels.get(offset + y * size + x).copied().unwrap_or(0.0);
            out.push((row, col, v.clamp(0.0, 1.0)));
        }
    }
    (cells, out)
}

fn draw_thumbnail<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    batch: &Batch,
    index: usize,
) -> anyhow::Result<()> {
    let (cells, values) = thumbnail_cells(batch, index);
    let n = cells as f64;
    let mut chart = ChartBuilder::on(area)
        .margin(15)
        .build_cartesian_2d(0.0..n, 0.0..n)
        .map_err(plot_err)?;
    chart
        .draw_series(values.into_iter().map(|(row, col, v)| {
            let g = (v * 255.0).round() as u8;
            let (x, y) = (col as f64, n - row as f64 - 1.0);
            Rectangle::new([(x, y), (x + 1.0, y + 1.0)], RGBColor(g, g, g).filled())
        }))
        .map_err(plot_err)?;
    Ok(())
}

/// Per-example class probabilities across Monte-Carlo samples.
///
/// One row per example (at most `max_examples`): the input patch, then a dot
/// for every sample's probability of each class and a bar for the mean,
/// green on the true class when the model knows it. Bars and predictions
/// are named after `class_names`; batch labels index `true_names`, which
/// differ from `class_names` for unseen camera models.
pub fn plot_held_out(
    path: &Path,
    samples: &McSamples,
    batch: &Batch,
    class_names: &[String],
    true_names: &[String],
    max_examples: usize,
) -> anyhow::Result<()> {
    let rows = samples.batch_size.min(max_examples).min(batch.len());
    anyhow::ensure!(rows > 0, "nothing to plot");
    let names = HeldOutNames {
        classes: class_names,
        truths: true_names,
    };
    draw_labeled_or_plain(path, |labeled| {
        draw_held_out(path, samples, batch, &names, rows, labeled)
    })
}

struct HeldOutNames<'a> {
    classes: &'a [String],
    truths: &'a [String],
}

impl HeldOutNames<'_> {
    /// Model class of the true label, if the model was trained on it.
    fn known_class(&self, truth: usize) -> Option<usize> {
        let name = self.truths.get(truth)?;
        self.classes.iter().position(|c| c == name)
    }
}

fn class_name(class_names: &[String], class: usize) -> String {
    class_names
        .get(class)
        .cloned()
        .unwrap_or_else(|| format!("class {class}"))
}

fn draw_held_out(
    path: &Path,
    samples: &McSamples,
    batch: &Batch,
    names: &HeldOutNames<'_>,
    rows: usize,
    labeled: bool,
) -> anyhow::Result<()> {
    const ROW_HEIGHT: u32 = 200;
    let root = BitMapBackend::new(path, (1100, ROW_HEIGHT * rows as u32)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let num_classes = samples.num_classes;
    let x = -0.5..(num_classes as f64 - 0.5);
    let mean = samples.mean_probs();
    let predicted = samples.predicted_labels();

    for (example, area) in root.split_evenly((rows, 1)).iter().enumerate() {
        let (thumb, bars) = area.split_horizontally(ROW_HEIGHT as i32);
        draw_thumbnail(&thumb, batch, example)?;

        let truth = batch.labels[example];
        let known = names.known_class(truth);
        let caption = format!(
            "true: {}, predicted: {}",
            class_name(names.truths, truth),
            class_name(names.classes, predicted[example])
        );
        let mut chart = chart_on(
            &bars,
            labeled,
            &caption,
            ("class", "probability"),
            x.clone(),
            0.0..1.0,
        )?;

        chart
            .draw_series(mean[example].iter().enumerate().map(|(c, &p)| {
                let color = if Some(c) == known {
                    GREEN.mix(0.6)
                } else {
                    BLUE.mix(0.4)
                };
                let c = c as f64;
                Rectangle::new([(c - 0.3, 0.0), (c + 0.3, p)], color.filled())
            }))
            .map_err(plot_err)?;

        for t in 0..samples.num_samples {
            chart
                .draw_series(
                    samples
                        .sample(t, example)
                        .iter()
                        .enumerate()
                        .map(|(c, &p)| Circle::new((c as f64, p as f64), 2, BLACK.mix(0.5).filled())),
                )
                .map_err(plot_err)?;
        }

        if labeled {
            chart
                .draw_series((0..num_classes).map(|c| {
                    Text::new(
                        class_name(names.classes, c),
                        (c as f64 - 0.3, 0.97),
                        (FONT, 12).into_font(),
                    )
                }))
                .map_err(plot_err)?;
        }
    }

    root.present().map_err(plot_err)?;
    Ok(())
}
