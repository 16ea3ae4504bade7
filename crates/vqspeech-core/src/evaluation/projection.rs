//! 2-D projection of the codebook for visual inspection.
//!
//! Only available with the `embedding-projection` feature.

use std::path::Path;

use candle_core::Tensor;

use crate::error::Result;

/// Render the codebook as a scatter plot of its two principal components.
#[cfg(feature = "embedding-projection")]
pub fn save_embedding_plot(codebook: &Tensor, path: &Path) -> Result<()> {
    use plotters::prelude::*;

    use crate::error::Error;

    let points = principal_components(codebook)?;
    let (x_lo, x_hi, y_lo, y_hi) = points.iter().fold(
        (f32::INFINITY, f32::NEG_INFINITY, f32::INFINITY, f32::NEG_INFINITY),
        |(x_lo, x_hi, y_lo, y_hi), &(x, y)| (x_lo.min(x), x_hi.max(x), y_lo.min(y), y_hi.max(y)),
    );
    let pad = |lo: f32, hi: f32| {
        let margin = ((hi - lo) * 0.05).max(1e-3);
        (lo - margin)..(hi + margin)
    };

    fn plot_err(e: impl std::fmt::Display) -> Error {
        Error::PlotError(e.to_string())
    }

    let root = BitMapBackend::new(path, (640, 480)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(pad(x_lo, x_hi), pad(y_lo, y_hi))
        .map_err(plot_err)?;
    chart
        .draw_series(
            points
                .iter()
                .map(|&(x, y)| Circle::new((x, y), 3, BLUE.mix(0.3).filled())),
        )
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

#[cfg(not(feature = "embedding-projection"))]
pub fn save_embedding_plot(_codebook: &Tensor, _path: &Path) -> Result<()> {
    Err(crate::error::Error::FeatureUnavailable(
        "Embedding projection support".to_string(),
    ))
}

/// Coordinates of every codebook row along the two leading principal axes.
#[cfg(feature = "embedding-projection")]
pub fn principal_components(codebook: &Tensor) -> Result<Vec<(f32, f32)>> {
    use candle_core::DType;

    let rows = codebook.to_dtype(DType::F32)?.detach();
    let (count, _) = rows.dims2()?;
    let centered = rows.broadcast_sub(&rows.mean_keepdim(0)?)?;
    let covariance = centered
        .t()?
        .matmul(&centered)?
        .affine(1.0 / count.saturating_sub(1).max(1) as f64, 0.0)?;

    let first = leading_eigenvector(&covariance, None)?;
    let second = leading_eigenvector(&covariance, Some(&first))?;

    let projected = centered.matmul(&Tensor::cat(&[first, second], 1)?)?;
    Ok(projected
        .to_vec2::<f32>()?
        .into_iter()
        .map(|row| (row[0], row[1]))
        .collect())
}

/// Power iteration on a symmetric `(D, D)` matrix, restricted to the
/// complement of `exclude` when given. Returns a `(D, 1)` unit vector, or zeros
/// when the matrix has no variance left in that subspace.
#[cfg(feature = "embedding-projection")]
fn leading_eigenvector(matrix: &Tensor, exclude: Option<&Tensor>) -> Result<Tensor> {
    const ITERATIONS: usize = 200;

    let dim = matrix.dims2()?.0;
    let remove_excluded = |v: Tensor| -> Result<Tensor> {
        match exclude {
            Some(axis) => Ok((&v - axis.broadcast_mul(&axis.t()?.matmul(&v)?)?)?),
            None => Ok(v),
        }
    };

    // Alternating signs keep the start off any single axis.
    let start: Vec<f32> = (0..dim)
        .map(|i| if i % 2 == 0 { 1.0 } else { -0.5 })
        .collect();
    let mut vector = remove_excluded(
        Tensor::from_vec(start, (dim, 1), matrix.device())?.to_dtype(matrix.dtype())?,
    )?;
    for _ in 0..ITERATIONS {
        let next = remove_excluded(matrix.matmul(&vector)?)?;
        let norm = next.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        if norm < 1e-6 {
            return Ok(next.zeros_like()?);
        }
        vector = next.affine(1.0 / norm as f64, 0.0)?;
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[cfg(not(feature = "embedding-projection"))]
    #[test]
    fn test_projection_reports_missing_feature() {
        let dir = tempfile::tempdir().unwrap();
        let codebook = Tensor::zeros((4, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = save_embedding_plot(&codebook, &dir.path().join("embedding.png")).unwrap_err();
        assert!(matches!(err, crate::error::Error::FeatureUnavailable(_)));
        assert!(err.to_string().ends_with("not installed"));
    }

    #[cfg(feature = "embedding-projection")]
    #[test]
    fn test_points_on_a_line_have_one_component() -> Result<()> {
        use approx::assert_abs_diff_eq;

        // rows along (1, 2, 2) / 3, spaced by 3
        let codebook = Tensor::new(
            &[[-1f32, -2.0, -2.0], [0.0, 0.0, 0.0], [1.0, 2.0, 2.0], [2.0, 4.0, 4.0]],
            &Device::Cpu,
        )?;
        let points = principal_components(&codebook)?;
        assert_eq!(points.len(), 4);
        let gaps: Vec<f32> = points.windows(2).map(|w| (w[1].0 - w[0].0).abs()).collect();
        for gap in gaps {
            assert_abs_diff_eq!(gap, 3.0, epsilon = 1e-3);
        }
        for (_, y) in points {
            assert_abs_diff_eq!(y, 0.0, epsilon = 1e-3);
        }
        Ok(())
    }

    #[cfg(feature = "embedding-projection")]
    #[test]
    fn test_embedding_plot_writes_png() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedding.png");
        let codebook = Tensor::randn(0f32, 1.0, (16, 5), &Device::Cpu)?;
        save_embedding_plot(&codebook, &path)?;
        assert!(path.exists());
        Ok(())
    }
}
