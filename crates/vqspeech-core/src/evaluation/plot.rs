//! PNG rendering of feature matrices and training curves.
//!
//! Plots carry no text so they render without a font backend.

use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;

use crate::error::{Error, Result};
use crate::training::TrainingHistory;

const PANEL_WIDTH: u32 = 1200;
const PANEL_HEIGHT: u32 = 300;

fn plot_err(e: impl std::fmt::Display) -> Error {
    Error::PlotError(e.to_string())
}

/// White to dark blue ramp for `t` in `[0, 1]`.
fn intensity_color(t: f64) -> RGBColor {
    let t = t.clamp(0.0, 1.0);
    let channel = |from: f64, to: f64| (from + (to - from) * t).round() as u8;
    RGBColor(channel(255.0, 8.0), channel(255.0, 48.0), channel(255.0, 107.0))
}

/// Stack one heatmap per matrix vertically, time on the x axis.
///
/// Each matrix is `[time][bin]` and is normalised to its own range.
pub fn save_heatmaps(path: &Path, panels: &[Vec<Vec<f32>>]) -> Result<()> {
    if panels.is_empty() {
        return Err(Error::PlotError("Nothing to plot".to_string()));
    }
    let root = BitMapBackend::new(path, (PANEL_WIDTH, PANEL_HEIGHT * panels.len() as u32))
        .into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let areas = root.split_evenly((panels.len(), 1));
    for (area, panel) in areas.iter().zip(panels) {
        draw_heatmap(area, panel)?;
    }
    root.present().map_err(plot_err)?;
    Ok(())
}

fn draw_heatmap(area: &DrawingArea<BitMapBackend<'_>, Shift>, values: &[Vec<f32>]) -> Result<()> {
    let frames = values.len();
    let bins = values.first().map_or(0, Vec::len);
    if frames == 0 || bins == 0 {
        return Ok(());
    }

    let (lo, hi) = values
        .iter()
        .flatten()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = if hi > lo { (hi - lo) as f64 } else { 1.0 };

    let mut chart = ChartBuilder::on(area)
        .margin(4)
        .build_cartesian_2d(0..frames, 0..bins)
        .map_err(plot_err)?;

    chart
        .draw_series(values.iter().enumerate().flat_map(|(t, row)| {
            row.iter().enumerate().map(move |(bin, &v)| {
                let color = intensity_color((v - lo) as f64 / span);
                Rectangle::new([(t, bin), (t + 1, bin + 1)], color.filled())
            })
        }))
        .map_err(plot_err)?;
    Ok(())
}

/// Total loss (blue) and reconstruction error (red) against the update number.
pub fn save_loss_curve(path: &Path, history: &TrainingHistory) -> Result<()> {
    let root = BitMapBackend::new(path, (PANEL_WIDTH, PANEL_HEIGHT * 2)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let last_step = history.last().map_or(1, |r| r.step.max(1));
    let (lo, hi) = history
        .records
        .iter()
        .flat_map(|r| [r.loss, r.reconstruction_error])
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let (lo, hi) = if lo.is_finite() && hi > lo {
        (lo, hi)
    } else if lo.is_finite() {
        (lo - 0.5, lo + 0.5)
    } else {
        (0.0, 1.0)
    };

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(0f32..last_step as f32, lo..hi)
        .map_err(plot_err)?;

    chart
        .draw_series(LineSeries::new(
            history.records.iter().map(|r| (r.step as f32, r.loss)),
            &BLUE,
        ))
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(
            history
                .records
                .iter()
                .map(|r| (r.step as f32, r.reconstruction_error)),
            &RED,
        ))
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::StepRecord;

    #[test]
    fn test_heatmaps_write_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comparison.png");
        let ramp: Vec<Vec<f32>> = (0..6)
            .map(|t| (0..4).map(|b| (t * b) as f32).collect())
            .collect();
        let constant = vec![vec![1.0f32; 3]; 5];

        save_heatmaps(&path, &[ramp, constant]).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_heatmaps_require_a_panel() {
        let dir = tempfile::tempdir().unwrap();
        let result = save_heatmaps(&dir.path().join("empty.png"), &[]);
        assert!(matches!(result, Err(Error::PlotError(_))));
    }

    #[test]
    fn test_loss_curve_handles_short_histories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loss.png");

        save_loss_curve(&path, &TrainingHistory::default()).unwrap();

        let history = TrainingHistory {
            records: vec![StepRecord {
                step: 1,
                loss: 0.3,
                reconstruction_error: 0.3,
                vq_loss: 0.0,
                perplexity: 1.0,
            }],
        };
        save_loss_curve(&path, &history).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_intensity_ramp_endpoints() {
        assert_eq!(intensity_color(0.0), RGBColor(255, 255, 255));
        assert_eq!(intensity_color(1.0), RGBColor(8, 48, 107));
        assert_eq!(intensity_color(7.0), RGBColor(8, 48, 107));
    }
}
