//! # Chart Rendering
//!
//! The visual half of the descriptive reporter: histograms, a correlation
//! heatmap, grouped boxplots, scatterplots with linear trend lines, and the
//! SES-quartile interaction plot, rendered to PNG files with plotters.
//!
//! Every renderer is an independent terminal branch: a failure in one
//! (degenerate data, backend error) is returned to the caller and must not
//! stop the remaining branches. [`render_all`] runs the full set and
//! collects per-artifact outcomes.

use crate::data::{
    ColumnError, DIBEV_A, EDUCP_A, HICOV_A, HYPEV_A, INS_LABEL, LSATIS4_A, ObservationTable,
    PHQCAT_A, PHSTAT_A, PHSTAT_REVERSED, POVRATTC_A, SES_SCORE,
};
use crate::describe::{self, CorrelationMatrix, DescribeError, GroupCell, MissingPolicy};
use crate::stats;
use ndarray::Array1;
use plotters::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Describe(#[from] DescribeError),
    #[error("Rendering '{artifact}' failed: {message}")]
    Backend { artifact: String, message: String },
    #[error("No drawable observations for '{artifact}' (all values missing or degenerate).")]
    NoData { artifact: String },
}

fn backend_error<E: std::fmt::Display>(artifact: &str) -> impl Fn(E) -> PlotError + '_ {
    move |e| PlotError::Backend {
        artifact: artifact.to_string(),
        message: e.to_string(),
    }
}

const CHART_SIZE: (u32, u32) = (1200, 700);

/// A named point cloud for scatter/trend charts.
#[derive(Debug, Clone)]
pub struct ScatterSeries {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

/// Pairwise-complete (x, y) pairs of two columns.
fn paired(x: &Array1<f64>, y: &Array1<f64>) -> Vec<(f64, f64)> {
    x.iter()
        .zip(y.iter())
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
        .collect()
}

/// Least-squares trend line through a point cloud: (intercept, slope).
fn trend_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let xs: Vec<f64> = points.iter().map(|(x, _)| *x).collect();
    let ys: Vec<f64> = points.iter().map(|(_, y)| *y).collect();
    let mean_x = stats::sample_mean(&xs)?;
    let mean_y = stats::sample_mean(&ys)?;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in points {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    if den <= 0.0 {
        return None;
    }
    let slope = num / den;
    Some((mean_y - slope * mean_x, slope))
}

fn histogram_counts(values: &[f64], min: f64, max: f64, bins: usize) -> Vec<(f64, usize)> {
    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for &v in values {
        let mut idx = ((v - min) / width) as usize;
        if idx >= bins {
            idx = bins - 1;
        }
        counts[idx] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| (min + i as f64 * width, c))
        .collect()
}

/// Values of `value` per level of `group`. Discrete groupings use the
/// observed levels; a numeric grouping with many distinct values falls back
/// to quartile bins so the chart stays readable.
fn category_series(
    table: &ObservationTable,
    value: &str,
    group: &str,
) -> Result<Vec<(String, Vec<f64>)>, PlotError> {
    const MAX_DISCRETE_LEVELS: usize = 12;

    let values = table.numeric(value)?;
    let mut by_level: Vec<(String, Vec<f64>)> = Vec::new();
    let mut insert = |level: String, v: f64| {
        match by_level.iter_mut().find(|(l, _)| *l == level) {
            Some((_, bucket)) => bucket.push(v),
            None => by_level.push((level, vec![v])),
        }
    };

    let mut distinct = std::collections::BTreeSet::new();
    for i in 0..table.n_rows() {
        if let Some(level) = describe::level_of(table, group, i)? {
            distinct.insert(level);
        }
    }

    if distinct.len() > MAX_DISCRETE_LEVELS {
        let group_values = table.numeric(group)?;
        let finite = stats::observed(group_values);
        let q25 = stats::quantile(&finite, 0.25);
        let q50 = stats::quantile(&finite, 0.50);
        let q75 = stats::quantile(&finite, 0.75);
        let (Some(q25), Some(q50), Some(q75)) = (q25, q50, q75) else {
            return Err(PlotError::NoData {
                artifact: group.to_string(),
            });
        };
        for i in 0..table.n_rows() {
            let g = group_values[i];
            let v = values[i];
            if !g.is_finite() || !v.is_finite() {
                continue;
            }
            let level = if g < q25 {
                "Q1 (low)"
            } else if g < q50 {
                "Q2"
            } else if g < q75 {
                "Q3"
            } else {
                "Q4 (high)"
            };
            insert(level.to_string(), v);
        }
        let order = ["Q1 (low)", "Q2", "Q3", "Q4 (high)"];
        by_level.sort_by_key(|(l, _)| order.iter().position(|o| o == l).unwrap_or(usize::MAX));
    } else {
        for i in 0..table.n_rows() {
            let v = values[i];
            if !v.is_finite() {
                continue;
            }
            if let Some(level) = describe::level_of(table, group, i)? {
                insert(level, v);
            }
        }
        by_level.sort_by(|(a, _), (b, _)| a.cmp(b));
    }

    if by_level.is_empty() {
        return Err(PlotError::NoData {
            artifact: format!("{value} by {group}"),
        });
    }
    Ok(by_level)
}

/// Scatter series of (x, y) split by the levels of `group`.
fn series_by_level(
    table: &ObservationTable,
    x: &str,
    y: &str,
    group: &str,
) -> Result<Vec<ScatterSeries>, PlotError> {
    let xs = table.numeric(x)?;
    let ys = table.numeric(y)?;
    let mut series: Vec<ScatterSeries> = Vec::new();
    for i in 0..table.n_rows() {
        let (a, b) = (xs[i], ys[i]);
        if !a.is_finite() || !b.is_finite() {
            continue;
        }
        let Some(level) = describe::level_of(table, group, i)? else {
            continue;
        };
        match series.iter_mut().find(|s| s.label == level) {
            Some(s) => s.points.push((a, b)),
            None => series.push(ScatterSeries {
                label: level,
                points: vec![(a, b)],
            }),
        }
    }
    series.sort_by(|a, b| a.label.cmp(&b.label));
    if series.is_empty() {
        return Err(PlotError::NoData {
            artifact: format!("{y} vs {x} by {group}"),
        });
    }
    Ok(series)
}

fn padded_bounds(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for v in values {
        if v.is_finite() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }
    if !lo.is_finite() || !hi.is_finite() {
        return None;
    }
    let pad = if (hi - lo).abs() > 1e-9 {
        0.05 * (hi - lo)
    } else {
        0.5 * hi.abs().max(1.0)
    };
    Some((lo - pad, hi + pad))
}

// --- Renderers ---

/// A grid of per-variable histograms, faceted by variable name.
pub fn render_histogram_grid(
    table: &ObservationTable,
    variables: &[&str],
    path: &Path,
) -> Result<PathBuf, PlotError> {
    let artifact = "variable histograms";
    let cols = 3usize;
    let rows = variables.len().div_ceil(cols);

    let root = BitMapBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(backend_error(artifact))?;
    let cells = root.split_evenly((rows, cols));

    for (cell, name) in cells.iter().zip(variables.iter()) {
        let column = table.numeric(name)?;
        let values = stats::observed(column);
        if values.is_empty() {
            continue;
        }
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let (lo, hi) = if (hi - lo).abs() < 1e-9 {
            (lo - 0.5, hi + 0.5)
        } else {
            (lo, hi)
        };
        let counts = histogram_counts(&values, lo, hi, 15);
        let y_max = counts.iter().map(|(_, c)| *c).max().unwrap_or(1) as f64;
        let width = (hi - lo) / 15.0;

        let mut chart = ChartBuilder::on(cell)
            .caption(*name, ("sans-serif", 16))
            .margin(8)
            .x_label_area_size(22)
            .y_label_area_size(32)
            .build_cartesian_2d(lo..hi, 0.0..(y_max * 1.1))
            .map_err(backend_error(artifact))?;
        chart
            .configure_mesh()
            .disable_mesh()
            .x_labels(5)
            .y_labels(4)
            .draw()
            .map_err(backend_error(artifact))?;
        chart
            .draw_series(counts.iter().map(|&(start, count)| {
                Rectangle::new(
                    [(start, 0.0), (start + width, count as f64)],
                    BLUE.mix(0.6).filled(),
                )
            }))
            .map_err(backend_error(artifact))?;
    }

    root.present().map_err(backend_error(artifact))?;
    Ok(path.to_path_buf())
}

/// A correlation heatmap with cell annotations.
pub fn render_correlation_heatmap(
    corr: &CorrelationMatrix,
    path: &Path,
) -> Result<PathBuf, PlotError> {
    let artifact = "correlation heatmap";
    let k = corr.columns.len();

    let root = BitMapBackend::new(path, (900, 800)).into_drawing_area();
    root.fill(&WHITE).map_err(backend_error(artifact))?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Pairwise correlations", ("sans-serif", 22))
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(100)
        .build_cartesian_2d(-0.5..(k as f64 - 0.5), -0.5..(k as f64 - 0.5))
        .map_err(backend_error(artifact))?;

    let names = corr.columns.clone();
    let names_y = corr.columns.clone();
    chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(k)
        .y_labels(k)
        .x_label_formatter(&move |v| {
            let i = v.round() as usize;
            names.get(i).cloned().unwrap_or_default()
        })
        .y_label_formatter(&move |v| {
            let i = v.round() as usize;
            names_y.get(i).cloned().unwrap_or_default()
        })
        .draw()
        .map_err(backend_error(artifact))?;

    for i in 0..k {
        for j in 0..k {
            let r = corr.values[[i, j]];
            let color = correlation_color(r);
            chart
                .draw_series(std::iter::once(Rectangle::new(
                    [
                        (j as f64 - 0.5, i as f64 - 0.5),
                        (j as f64 + 0.5, i as f64 + 0.5),
                    ],
                    color.filled(),
                )))
                .map_err(backend_error(artifact))?;
            let text = if r.is_finite() {
                format!("{r:.2}")
            } else {
                "-".to_string()
            };
            chart
                .draw_series(std::iter::once(Text::new(
                    text,
                    (j as f64 - 0.1, i as f64),
                    ("sans-serif", 18),
                )))
                .map_err(backend_error(artifact))?;
        }
    }

    root.present().map_err(backend_error(artifact))?;
    Ok(path.to_path_buf())
}

fn correlation_color(r: f64) -> RGBColor {
    if !r.is_finite() {
        return RGBColor(200, 200, 200);
    }
    let strength = (r.abs().clamp(0.0, 1.0) * 200.0) as u8;
    if r >= 0.0 {
        RGBColor(255, 255 - strength, 255 - strength)
    } else {
        RGBColor(255 - strength, 255 - strength, 255)
    }
}

/// Boxplots of `value` per level of `group` (quartile box, 1.5 IQR
/// whiskers, median line).
pub fn render_grouped_boxplots(
    table: &ObservationTable,
    value: &str,
    group: &str,
    caption: &str,
    path: &Path,
) -> Result<PathBuf, PlotError> {
    let artifact = caption;
    let groups = category_series(table, value, group)?;
    let k = groups.len();

    let (y_lo, y_hi) = padded_bounds(groups.iter().flat_map(|(_, v)| v.iter().copied()))
        .ok_or_else(|| PlotError::NoData {
            artifact: artifact.to_string(),
        })?;

    let root = BitMapBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(backend_error(artifact))?;
    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 22))
        .margin(10)
        .x_label_area_size(46)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5..(k as f64 - 0.5), y_lo..y_hi)
        .map_err(backend_error(artifact))?;

    let level_names: Vec<String> = groups.iter().map(|(l, _)| l.clone()).collect();
    chart
        .configure_mesh()
        .x_desc(group)
        .y_desc(value)
        .x_labels(k)
        .x_label_formatter(&move |v| {
            let i = v.round() as usize;
            level_names.get(i).cloned().unwrap_or_default()
        })
        .draw()
        .map_err(backend_error(artifact))?;

    for (idx, (_, values)) in groups.iter().enumerate() {
        if values.len() < 2 {
            continue;
        }
        let x = idx as f64;
        let q1 = stats::quantile(values, 0.25).unwrap_or(f64::NAN);
        let q2 = stats::median(values).unwrap_or(f64::NAN);
        let q3 = stats::quantile(values, 0.75).unwrap_or(f64::NAN);
        let iqr = q3 - q1;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lower = (q1 - 1.5 * iqr).max(min);
        let upper = (q3 + 1.5 * iqr).min(max);

        chart
            .draw_series(std::iter::once(Rectangle::new(
                [(x - 0.3, q1), (x + 0.3, q3)],
                BLUE.mix(0.35).filled(),
            )))
            .map_err(backend_error(artifact))?;
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(x - 0.3, q2), (x + 0.3, q2)],
                RED.stroke_width(2),
            )))
            .map_err(backend_error(artifact))?;
        let whiskers = vec![
            vec![(x, q3), (x, upper)],
            vec![(x, lower), (x, q1)],
            vec![(x - 0.15, upper), (x + 0.15, upper)],
            vec![(x - 0.15, lower), (x + 0.15, lower)],
        ];
        for segment in whiskers {
            chart
                .draw_series(std::iter::once(PathElement::new(
                    segment,
                    BLACK.stroke_width(1),
                )))
                .map_err(backend_error(artifact))?;
        }
    }

    root.present().map_err(backend_error(artifact))?;
    Ok(path.to_path_buf())
}

/// Overlaid translucent histograms of `value`, one color per level of
/// `group`.
pub fn render_overlay_histogram(
    table: &ObservationTable,
    value: &str,
    group: &str,
    caption: &str,
    path: &Path,
) -> Result<PathBuf, PlotError> {
    let artifact = caption;
    let groups = category_series(table, value, group)?;

    let (lo, hi) = padded_bounds(groups.iter().flat_map(|(_, v)| v.iter().copied()))
        .ok_or_else(|| PlotError::NoData {
            artifact: artifact.to_string(),
        })?;
    let bins = 15usize;
    let width = (hi - lo) / bins as f64;
    let y_max = groups
        .iter()
        .map(|(_, values)| {
            histogram_counts(values, lo, hi, bins)
                .into_iter()
                .map(|(_, c)| c)
                .max()
                .unwrap_or(0)
        })
        .max()
        .unwrap_or(1) as f64;

    let root = BitMapBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(backend_error(artifact))?;
    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 22))
        .margin(10)
        .x_label_area_size(46)
        .y_label_area_size(60)
        .build_cartesian_2d(lo..hi, 0.0..(y_max * 1.1))
        .map_err(backend_error(artifact))?;
    chart
        .configure_mesh()
        .x_desc(value)
        .y_desc("count")
        .draw()
        .map_err(backend_error(artifact))?;

    for (idx, (level, values)) in groups.iter().enumerate() {
        let color = Palette99::pick(idx).mix(0.45);
        let counts = histogram_counts(values, lo, hi, bins);
        let legend_color = Palette99::pick(idx).mix(0.45);
        chart
            .draw_series(counts.iter().map(|&(start, count)| {
                Rectangle::new(
                    [(start, 0.0), (start + width, count as f64)],
                    color.filled(),
                )
            }))
            .map_err(backend_error(artifact))?
            .label(level)
            .legend(move |(x, y)| {
                Rectangle::new([(x, y - 5), (x + 12, y + 5)], legend_color.filled())
            });
    }
    chart
        .configure_series_labels()
        .border_style(&BLACK)
        .background_style(&WHITE.mix(0.85))
        .draw()
        .map_err(backend_error(artifact))?;

    root.present().map_err(backend_error(artifact))?;
    Ok(path.to_path_buf())
}

/// Scatter of point-cloud series with one least-squares trend line each.
pub fn render_scatter_with_trends(
    series: &[ScatterSeries],
    caption: &str,
    x_desc: &str,
    y_desc: &str,
    path: &Path,
) -> Result<PathBuf, PlotError> {
    let artifact = caption;
    let (x_lo, x_hi) = padded_bounds(
        series.iter().flat_map(|s| s.points.iter().map(|(x, _)| *x)),
    )
    .ok_or_else(|| PlotError::NoData {
        artifact: artifact.to_string(),
    })?;
    let (y_lo, y_hi) = padded_bounds(
        series.iter().flat_map(|s| s.points.iter().map(|(_, y)| *y)),
    )
    .ok_or_else(|| PlotError::NoData {
        artifact: artifact.to_string(),
    })?;

    let root = BitMapBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(backend_error(artifact))?;
    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 22))
        .margin(10)
        .x_label_area_size(46)
        .y_label_area_size(60)
        .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)
        .map_err(backend_error(artifact))?;
    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .draw()
        .map_err(backend_error(artifact))?;

    for (idx, s) in series.iter().enumerate() {
        let color = Palette99::pick(idx);
        let point_color = color.mix(0.3);
        chart
            .draw_series(
                s.points
                    .iter()
                    .map(|&(x, y)| Circle::new((x, y), 3, point_color.filled())),
            )
            .map_err(backend_error(artifact))?
            .label(&s.label)
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 16, y)], Palette99::pick(idx).stroke_width(3))
            });
        if let Some((intercept, slope)) = trend_line(&s.points) {
            chart
                .draw_series(std::iter::once(PathElement::new(
                    vec![
                        (x_lo, intercept + slope * x_lo),
                        (x_hi, intercept + slope * x_hi),
                    ],
                    color.stroke_width(3),
                )))
                .map_err(backend_error(artifact))?;
        }
    }
    if series.len() > 1 {
        chart
            .configure_series_labels()
            .border_style(&BLACK)
            .background_style(&WHITE.mix(0.85))
            .draw()
            .map_err(backend_error(artifact))?;
    }

    root.present().map_err(backend_error(artifact))?;
    Ok(path.to_path_buf())
}

/// Interaction line plot: group means per SES quartile, one line per
/// series level, with +-1 standard-error bars.
pub fn render_interaction_plot(
    profile: &[GroupCell],
    caption: &str,
    y_desc: &str,
    path: &Path,
) -> Result<PathBuf, PlotError> {
    let artifact = caption;
    if profile.is_empty() {
        return Err(PlotError::NoData {
            artifact: artifact.to_string(),
        });
    }

    let mut groups: Vec<String> = Vec::new();
    let mut levels: Vec<String> = Vec::new();
    for cell in profile {
        if !groups.contains(&cell.group) {
            groups.push(cell.group.clone());
        }
        if !levels.contains(&cell.series) {
            levels.push(cell.series.clone());
        }
    }

    let (y_lo, y_hi) = padded_bounds(profile.iter().flat_map(|c| {
        let se = if c.std_error.is_finite() { c.std_error } else { 0.0 };
        [c.mean - se, c.mean + se]
    }))
    .ok_or_else(|| PlotError::NoData {
        artifact: artifact.to_string(),
    })?;

    let root = BitMapBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(backend_error(artifact))?;
    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 22))
        .margin(10)
        .x_label_area_size(46)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5..(groups.len() as f64 - 0.5), y_lo..y_hi)
        .map_err(backend_error(artifact))?;

    let group_names = groups.clone();
    chart
        .configure_mesh()
        .x_desc("SES quartile")
        .y_desc(y_desc)
        .x_labels(groups.len())
        .x_label_formatter(&move |v| {
            let i = v.round() as usize;
            group_names.get(i).cloned().unwrap_or_default()
        })
        .draw()
        .map_err(backend_error(artifact))?;

    for (idx, level) in levels.iter().enumerate() {
        let color = Palette99::pick(idx);
        let line: Vec<(f64, f64)> = groups
            .iter()
            .enumerate()
            .filter_map(|(g, group)| {
                profile
                    .iter()
                    .find(|c| &c.group == group && &c.series == level)
                    .map(|c| (g as f64, c.mean))
            })
            .collect();

        chart
            .draw_series(LineSeries::new(line.iter().copied(), color.stroke_width(3)))
            .map_err(backend_error(artifact))?
            .label(level)
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 16, y)], Palette99::pick(idx).stroke_width(3))
            });
        chart
            .draw_series(
                line.iter()
                    .map(|&(x, y)| Circle::new((x, y), 4, color.filled())),
            )
            .map_err(backend_error(artifact))?;

        for (g, group) in groups.iter().enumerate() {
            let Some(cell) = profile
                .iter()
                .find(|c| &c.group == group && &c.series == level)
            else {
                continue;
            };
            if !cell.std_error.is_finite() || cell.std_error <= 0.0 {
                continue;
            }
            let x = g as f64;
            let (lo, hi) = (cell.mean - cell.std_error, cell.mean + cell.std_error);
            for segment in [
                vec![(x, lo), (x, hi)],
                vec![(x - 0.06, lo), (x + 0.06, lo)],
                vec![(x - 0.06, hi), (x + 0.06, hi)],
            ] {
                chart
                    .draw_series(std::iter::once(PathElement::new(
                        segment,
                        color.stroke_width(2),
                    )))
                    .map_err(backend_error(artifact))?;
            }
        }
    }

    chart
        .configure_series_labels()
        .border_style(&BLACK)
        .background_style(&WHITE.mix(0.85))
        .draw()
        .map_err(backend_error(artifact))?;

    root.present().map_err(backend_error(artifact))?;
    Ok(path.to_path_buf())
}

// --- Composite health scores for the trend charts ---

fn standardized(values: &Array1<f64>) -> Option<Array1<f64>> {
    let finite = stats::observed(values);
    let mean = stats::sample_mean(&finite)?;
    let sd = stats::sample_sd(&finite)?;
    if sd < 1e-12 {
        return None;
    }
    Some(values.mapv(|v| if v.is_finite() { (v - mean) / sd } else { f64::NAN }))
}

/// Indicator-weighted objective-health composite (diagnosis flags).
fn objective_composite(table: &ObservationTable) -> Result<Array1<f64>, PlotError> {
    let dibev = table.numeric(DIBEV_A)?;
    let hypev = table.numeric(HYPEV_A)?;
    Ok(ndarray::Zip::from(dibev)
        .and(hypev)
        .map_collect(|&d, &h| 0.48 * d + 0.61 * h))
}

/// Perceived-health composite: reversed self-rating plus life satisfaction
/// minus depression, each standardized (higher = better).
fn perceived_composite(table: &ObservationTable) -> Result<Array1<f64>, PlotError> {
    let reversed = standardized(table.numeric(PHSTAT_REVERSED)?);
    let satisfaction = standardized(table.numeric(LSATIS4_A)?);
    let depression = standardized(table.numeric(PHQCAT_A)?);
    let (Some(reversed), Some(satisfaction), Some(depression)) =
        (reversed, satisfaction, depression)
    else {
        return Err(PlotError::NoData {
            artifact: "perceived health composite".to_string(),
        });
    };
    Ok(&reversed + &satisfaction - &depression)
}

// --- The full descriptive fan-out ---

/// Renders every descriptive chart into `out_dir`, one file per branch.
/// Branches are independent: each entry of the returned list carries its
/// own outcome, and a failed branch never stops the others.
pub fn render_all(
    table: &ObservationTable,
    out_dir: &Path,
) -> Vec<(String, Result<PathBuf, PlotError>)> {
    let mut results: Vec<(String, Result<PathBuf, PlotError>)> = Vec::new();

    if let Err(e) = std::fs::create_dir_all(out_dir) {
        results.push((
            "output directory".to_string(),
            Err(PlotError::Backend {
                artifact: out_dir.display().to_string(),
                message: e.to_string(),
            }),
        ));
        return results;
    }

    results.push((
        "variable histograms".to_string(),
        render_histogram_grid(
            table,
            &[
                HICOV_A, EDUCP_A, POVRATTC_A, DIBEV_A, HYPEV_A, PHSTAT_A, PHQCAT_A, LSATIS4_A,
                SES_SCORE,
            ],
            &out_dir.join("variable_histograms.png"),
        ),
    ));

    results.push((
        "perceived-health correlations".to_string(),
        describe::correlation_matrix(
            table,
            &[PHSTAT_A, PHQCAT_A, LSATIS4_A],
            MissingPolicy::Pairwise,
        )
        .map_err(PlotError::from)
        .and_then(|corr| {
            render_correlation_heatmap(&corr, &out_dir.join("perceived_health_correlations.png"))
        }),
    ));

    results.push((
        "health by education boxplot".to_string(),
        render_grouped_boxplots(
            table,
            PHSTAT_A,
            EDUCP_A,
            "Self-rated health by education level",
            &out_dir.join("phstat_by_education_boxplot.png"),
        ),
    ));

    results.push((
        "health by poverty boxplot".to_string(),
        render_grouped_boxplots(
            table,
            PHSTAT_A,
            POVRATTC_A,
            "Self-rated health by poverty ratio",
            &out_dir.join("phstat_by_poverty_boxplot.png"),
        ),
    ));

    results.push((
        "health by insurance histogram".to_string(),
        render_overlay_histogram(
            table,
            PHSTAT_A,
            INS_LABEL,
            "Self-rated health by insurance status",
            &out_dir.join("phstat_by_insurance_hist.png"),
        ),
    ));

    results.push((
        "SES vs health scatter".to_string(),
        series_by_level(table, SES_SCORE, PHSTAT_A, INS_LABEL).and_then(|series| {
            render_scatter_with_trends(
                &series,
                "SES score and self-rated health by insurance status",
                "SES score",
                "PHSTAT_A",
                &out_dir.join("ses_vs_phstat_by_insurance.png"),
            )
        }),
    ));

    results.push((
        "SES quartile interaction".to_string(),
        describe::interaction_profile(table, PHSTAT_A, SES_SCORE, INS_LABEL)
            .map_err(PlotError::from)
            .and_then(|profile| {
                render_interaction_plot(
                    &profile,
                    "Self-rated health by SES quartile and insurance",
                    "mean PHSTAT_A",
                    &out_dir.join("ses_quartile_insurance_interaction.png"),
                )
            }),
    ));

    // Poverty ratio against the composite health scores, with
    // per-education trend lines.
    let objective = objective_composite(table);
    let perceived = perceived_composite(table);

    results.push((
        "poverty vs objective health".to_string(),
        objective.as_ref().map_err(clone_plot_error).and_then(|obj| {
            composite_series_by_education(table, obj).and_then(|series| {
                render_scatter_with_trends(
                    &series,
                    "SES indicators and objective health with regression lines",
                    "Poverty Ratio (POVRATTC_A)",
                    "Objective health (composite)",
                    &out_dir.join("poverty_vs_objective_by_education.png"),
                )
            })
        }),
    ));

    results.push((
        "objective vs perceived health".to_string(),
        match (&objective, &perceived) {
            (Ok(obj), Ok(perc)) => {
                let points = paired(obj, perc);
                render_scatter_with_trends(
                    &[ScatterSeries {
                        label: "all respondents".to_string(),
                        points,
                    }],
                    "Objective health predicting perceived health",
                    "Objective health (composite)",
                    "Perceived health (composite)",
                    &out_dir.join("objective_vs_perceived.png"),
                )
            }
            (Err(e), _) | (_, Err(e)) => Err(clone_plot_error(e)),
        },
    ));

    results.push((
        "poverty vs perceived health".to_string(),
        perceived.as_ref().map_err(clone_plot_error).and_then(|perc| {
            composite_series_by_education(table, perc).and_then(|series| {
                render_scatter_with_trends(
                    &series,
                    "SES indicators and perceived health with regression lines",
                    "Poverty Ratio (POVRATTC_A)",
                    "Perceived health (composite)",
                    &out_dir.join("poverty_vs_perceived_by_education.png"),
                )
            })
        }),
    ));

    results
}

/// Splits a composite against the poverty ratio into one series per
/// education level.
fn composite_series_by_education(
    table: &ObservationTable,
    composite: &Array1<f64>,
) -> Result<Vec<ScatterSeries>, PlotError> {
    let pov = table.numeric(POVRATTC_A)?;
    let educ = table.numeric(EDUCP_A)?;
    let mut series: Vec<ScatterSeries> = Vec::new();
    for i in 0..table.n_rows() {
        let (x, y, e) = (pov[i], composite[i], educ[i]);
        if !x.is_finite() || !y.is_finite() || !e.is_finite() {
            continue;
        }
        let label = format!("education {}", e as i64);
        match series.iter_mut().find(|s| s.label == label) {
            Some(s) => s.points.push((x, y)),
            None => series.push(ScatterSeries {
                label,
                points: vec![(x, y)],
            }),
        }
    }
    series.sort_by(|a, b| a.label.cmp(&b.label));
    if series.is_empty() {
        return Err(PlotError::NoData {
            artifact: "composite by education".to_string(),
        });
    }
    Ok(series)
}

/// `PlotError` is not `Clone` (it wraps source errors); branch fan-out
/// needs an owned copy when one composite feeds several charts.
fn clone_plot_error(e: &PlotError) -> PlotError {
    PlotError::Backend {
        artifact: "composite health score".to_string(),
        message: e.to_string(),
    }
}
