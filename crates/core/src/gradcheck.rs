//! Finite-difference check of [`SoftSplat::backward`].
//!
//! The scalar under test is `L = sum(forward(input, flow) * output_grad)`.
//! Flows are drawn so every sample position sits well inside a cell, where
//! the splat is smooth in the flow and central differences are exact up to
//! rounding.

use anyhow::{bail, ensure, Result};
use ndarray::{Array4, ArrayView4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use crate::splat::{GradRequest, SoftSplat};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheckOptions {
    /// `[N, C, H, W]` of the random input.
    pub shape: [usize; 4],
    pub seed: u64,
    /// Central-difference step; must stay below 0.2 so perturbed samples
    /// never cross a cell boundary.
    pub step: f32,
    pub tolerance: f32,
}

impl Default for GradCheckOptions {
    fn default() -> Self {
        Self {
            shape: [1, 2, 5, 6],
            seed: 0,
            step: 0.05,
            tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradCheckReport {
    pub shape: [usize; 4],
    pub seed: u64,
    pub tolerance: f32,
    pub input_max_abs_error: f64,
    pub input_max_rel_error: f64,
    pub flow_max_abs_error: f64,
    pub flow_max_rel_error: f64,
    pub passed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ErrorStats {
    max_abs: f64,
    max_rel: f64,
}

impl ErrorStats {
    fn record(&mut self, analytic: f64, numeric: f64) {
        let abs = (analytic - numeric).abs();
        let rel = abs / analytic.abs().max(numeric.abs()).max(1.0);
        self.max_abs = self.max_abs.max(abs);
        self.max_rel = self.max_rel.max(rel);
    }
}

/// Random inputs for a check: `(input, flow, output_grad)`.
pub fn random_problem(shape: [usize; 4], seed: u64) -> (Array4<f32>, Array4<f32>, Array4<f32>) {
    let [batch, channels, height, width] = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let input = Array4::from_shape_simple_fn((batch, channels, height, width), || {
        rng.random_range(-1.0f32..1.0)
    });
    let flow = Array4::from_shape_simple_fn((batch, 2, height, width), || {
        let whole = rng.random_range(-2i32..=2) as f32;
        let fraction = rng.random_range(0.2f32..0.8);
        whole + fraction
    });
    let output_grad = Array4::from_shape_simple_fn((batch, channels, height, width), || {
        rng.random_range(-1.0f32..1.0)
    });
    (input, flow, output_grad)
}

pub fn run(splat: &SoftSplat, options: &GradCheckOptions) -> Result<GradCheckReport> {
    ensure!(
        options.step > 0.0 && options.step < 0.2,
        "gradient check step {} must be in (0, 0.2)",
        options.step
    );
    ensure!(
        options.shape.iter().all(|&extent| extent > 0),
        "gradient check shape {:?} has an empty dimension",
        options.shape
    );

    let (input, flow, output_grad) = random_problem(options.shape, options.seed);
    let gradients = splat.backward(
        input.view(),
        flow.view(),
        output_grad.view(),
        GradRequest::both(),
    )?;
    let (Some(input_grad), Some(flow_grad)) = (gradients.input, gradients.flow) else {
        bail!("backward did not return both gradients");
    };

    let step = options.step;

    let mut input_stats = ErrorStats::default();
    let mut perturbed = input.clone();
    for (index, &analytic) in input_grad.indexed_iter() {
        let original = perturbed[index];
        perturbed[index] = original + step;
        let plus = objective(splat, perturbed.view(), flow.view(), output_grad.view())?;
        perturbed[index] = original - step;
        let minus = objective(splat, perturbed.view(), flow.view(), output_grad.view())?;
        perturbed[index] = original;
        input_stats.record(f64::from(analytic), (plus - minus) / (2.0 * f64::from(step)));
    }

    let mut flow_stats = ErrorStats::default();
    let mut perturbed = flow.clone();
    for (index, &analytic) in flow_grad.indexed_iter() {
        let original = perturbed[index];
        perturbed[index] = original + step;
        let plus = objective(splat, input.view(), perturbed.view(), output_grad.view())?;
        perturbed[index] = original - step;
        let minus = objective(splat, input.view(), perturbed.view(), output_grad.view())?;
        perturbed[index] = original;
        flow_stats.record(f64::from(analytic), (plus - minus) / (2.0 * f64::from(step)));
    }

    let tolerance = f64::from(options.tolerance);
    let report = GradCheckReport {
        shape: options.shape,
        seed: options.seed,
        tolerance: options.tolerance,
        input_max_abs_error: input_stats.max_abs,
        input_max_rel_error: input_stats.max_rel,
        flow_max_abs_error: flow_stats.max_abs,
        flow_max_rel_error: flow_stats.max_rel,
        passed: input_stats.max_rel <= tolerance && flow_stats.max_rel <= tolerance,
    };
    info!(
        passed = report.passed,
        input_rel = report.input_max_rel_error,
        flow_rel = report.flow_max_rel_error,
        "Gradient check finished"
    );
    Ok(report)
}

fn objective(
    splat: &SoftSplat,
    input: ArrayView4<'_, f32>,
    flow: ArrayView4<'_, f32>,
    output_grad: ArrayView4<'_, f32>,
) -> Result<f64> {
    let output = splat.forward(input, flow)?;
    Ok(output
        .iter()
        .zip(output_grad.iter())
        .map(|(&o, &g)| f64::from(o) * f64::from(g))
        .sum())
}
