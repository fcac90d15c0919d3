//! Forward scatter ("splat") of an image along a flow field, its gradients,
//! and the normalizing wrappers around it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayView4, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::device::LaunchArg;
use crate::host::HostDevice;
use crate::kernel_cache::{KernelCache, KernelLauncher};
use crate::kernels::{KernelSource, SOFTSPLAT_FLOWGRAD, SOFTSPLAT_INGRAD, SOFTSPLAT_OUT};
use crate::types::{BindingSet, TensorDescriptor};

pub const DEFAULT_EPSILON: f32 = 1e-7;

/// How the accumulated weight channel is kept away from zero before dividing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpsilonPolicy {
    /// `weight + eps`.
    #[default]
    AddEps,
    /// Exact zeros become one.
    ZeroEps,
    /// `max(weight, eps)`.
    ClipEps,
}

impl EpsilonPolicy {
    pub fn name(self) -> &'static str {
        match self {
            Self::AddEps => "addeps",
            Self::ZeroEps => "zeroeps",
            Self::ClipEps => "clipeps",
        }
    }

    pub fn apply(self, weight: f32, epsilon: f32) -> f32 {
        match self {
            Self::AddEps => weight + epsilon,
            Self::ZeroEps if weight == 0.0 => 1.0,
            Self::ZeroEps => weight,
            Self::ClipEps => weight.max(epsilon),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplatMode {
    /// Raw accumulation.
    Sum,
    /// Divide by the splatted count.
    Avg(EpsilonPolicy),
    /// Weight by the metric, then divide by the splatted metric.
    Linear(EpsilonPolicy),
    /// Weight by `exp(metric)`, then divide by the splatted weight.
    Soft(EpsilonPolicy),
}

impl SplatMode {
    pub fn needs_metric(self) -> bool {
        matches!(self, Self::Linear(_) | Self::Soft(_))
    }

    fn policy(self) -> Option<EpsilonPolicy> {
        match self {
            Self::Sum => None,
            Self::Avg(policy) | Self::Linear(policy) | Self::Soft(policy) => Some(policy),
        }
    }
}

impl FromStr for SplatMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (base, suffix) = match value.split_once('-') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (value, None),
        };
        let policy = match suffix {
            None | Some("addeps") => EpsilonPolicy::AddEps,
            Some("zeroeps") => EpsilonPolicy::ZeroEps,
            Some("clipeps") => EpsilonPolicy::ClipEps,
            Some(other) => bail!("unknown epsilon policy `{other}` in splat mode `{value}`"),
        };
        match base {
            "sum" if suffix.is_none() => Ok(Self::Sum),
            "sum" => bail!("splat mode `sum` takes no epsilon policy"),
            "avg" => Ok(Self::Avg(policy)),
            "linear" => Ok(Self::Linear(policy)),
            "soft" => Ok(Self::Soft(policy)),
            _ => bail!("unknown splat mode `{value}`; expected sum, avg, linear or soft"),
        }
    }
}

impl fmt::Display for SplatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => f.write_str("sum"),
            Self::Avg(policy) => write!(f, "avg-{}", policy.name()),
            Self::Linear(policy) => write!(f, "linear-{}", policy.name()),
            Self::Soft(policy) => write!(f, "soft-{}", policy.name()),
        }
    }
}

/// Which gradients [`SoftSplat::backward`] should produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GradRequest {
    pub input: bool,
    pub flow: bool,
}

impl GradRequest {
    pub fn both() -> Self {
        Self {
            input: true,
            flow: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplatGradients {
    pub input: Option<Array4<f32>>,
    pub flow: Option<Array4<f32>>,
}

/// Forward splat and its gradients, run through a [`KernelLauncher`].
#[derive(Debug, Clone)]
pub struct SoftSplat {
    launcher: KernelLauncher,
    epsilon: f32,
}

impl SoftSplat {
    pub fn new(launcher: KernelLauncher) -> Self {
        Self {
            launcher,
            epsilon: DEFAULT_EPSILON,
        }
    }

    /// Host device with the process-wide cache.
    pub fn host() -> Self {
        Self::new(KernelLauncher::new(
            Arc::new(HostDevice::new()),
            KernelCache::global(),
        ))
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn launcher(&self) -> &KernelLauncher {
        &self.launcher
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Scatter every `input[n, c, y, x]` to the bilinear neighbours of
    /// `(x + flow[n, 0, y, x], y + flow[n, 1, y, x])`.
    ///
    /// Pixels whose destination is not finite contribute nothing; corners
    /// outside the image are dropped.
    pub fn forward(&self, input: ArrayView4<'_, f32>, flow: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        validate_flow(&input, &flow)?;
        let mut output = Array4::<f32>::zeros(input.raw_dim());
        {
            let input_desc = TensorDescriptor::of(&input);
            let flow_desc = TensorDescriptor::of(&flow);
            let output_desc = TensorDescriptor::of_mut(&mut output);
            let n = output_desc.element_count();
            let bindings = BindingSet::new()
                .with_tensor("input", input_desc.clone())
                .with_tensor("flow", flow_desc.clone())
                .with_tensor("output", output_desc.clone());
            self.launch(
                SOFTSPLAT_OUT,
                bindings,
                n,
                &[
                    LaunchArg::Int(n as i64),
                    LaunchArg::Tensor(input_desc),
                    LaunchArg::Tensor(flow_desc),
                    LaunchArg::Tensor(output_desc),
                ],
            )?;
        }
        Ok(output)
    }

    /// Half precision inputs are computed in float32.
    pub fn forward_f16(&self, input: ArrayView4<'_, f16>, flow: ArrayView4<'_, f16>) -> Result<Array4<f32>> {
        let input = upcast_f16(input);
        let flow = upcast_f16(flow);
        self.forward(input.view(), flow.view())
    }

    /// Gradients of `sum(forward(input, flow) * output_grad)`.
    ///
    /// The input gradient gathers `output_grad` with the forward weights;
    /// the flow gradient sums, over channels, `output_grad * input` times
    /// the derivative of each corner weight. Both are zero where the
    /// forward pass skipped the pixel.
    pub fn backward(
        &self,
        input: ArrayView4<'_, f32>,
        flow: ArrayView4<'_, f32>,
        output_grad: ArrayView4<'_, f32>,
        request: GradRequest,
    ) -> Result<SplatGradients> {
        validate_flow(&input, &flow)?;
        ensure!(
            output_grad.shape() == input.shape(),
            "output gradient shape {:?} does not match input shape {:?}",
            output_grad.shape(),
            input.shape()
        );

        let mut gradients = SplatGradients::default();

        if request.input {
            let mut input_grad = Array4::<f32>::zeros(input.raw_dim());
            {
                let input_desc = TensorDescriptor::of(&input);
                let flow_desc = TensorDescriptor::of(&flow);
                let grad_desc = TensorDescriptor::of(&output_grad);
                let input_grad_desc = TensorDescriptor::of_mut(&mut input_grad);
                let n = input_grad_desc.element_count();
                let bindings = BindingSet::new()
                    .with_tensor("input", input_desc.clone())
                    .with_tensor("flow", flow_desc.clone())
                    .with_tensor("output_grad", grad_desc.clone())
                    .with_tensor("input_grad", input_grad_desc.clone());
                self.launch(
                    SOFTSPLAT_INGRAD,
                    bindings,
                    n,
                    &[
                        LaunchArg::Int(n as i64),
                        LaunchArg::Tensor(input_desc),
                        LaunchArg::Tensor(flow_desc),
                        LaunchArg::Tensor(grad_desc),
                        LaunchArg::Tensor(input_grad_desc),
                        LaunchArg::Null,
                    ],
                )?;
            }
            gradients.input = Some(input_grad);
        }

        if request.flow {
            let mut flow_grad = Array4::<f32>::zeros(flow.raw_dim());
            {
                let input_desc = TensorDescriptor::of(&input);
                let flow_desc = TensorDescriptor::of(&flow);
                let grad_desc = TensorDescriptor::of(&output_grad);
                let flow_grad_desc = TensorDescriptor::of_mut(&mut flow_grad);
                let n = flow_grad_desc.element_count();
                let bindings = BindingSet::new()
                    .with_tensor("input", input_desc.clone())
                    .with_tensor("flow", flow_desc.clone())
                    .with_tensor("output_grad", grad_desc.clone())
                    .with_tensor("flow_grad", flow_grad_desc.clone());
                self.launch(
                    SOFTSPLAT_FLOWGRAD,
                    bindings,
                    n,
                    &[
                        LaunchArg::Int(n as i64),
                        LaunchArg::Tensor(input_desc),
                        LaunchArg::Tensor(flow_desc),
                        LaunchArg::Tensor(grad_desc),
                        LaunchArg::Null,
                        LaunchArg::Tensor(flow_grad_desc),
                    ],
                )?;
            }
            gradients.flow = Some(flow_grad);
        }

        Ok(gradients)
    }

    /// Splat with one of the normalizing modes.
    ///
    /// Every mode but `sum` appends a weight channel (ones, the metric or
    /// `exp(metric)`), splats, and divides the image channels by the
    /// splatted weight.
    pub fn splat(
        &self,
        input: ArrayView4<'_, f32>,
        flow: ArrayView4<'_, f32>,
        metric: Option<ArrayView4<'_, f32>>,
        mode: SplatMode,
    ) -> Result<Array4<f32>> {
        match (mode.needs_metric(), &metric) {
            (true, None) => bail!("splat mode `{mode}` needs a metric"),
            (false, Some(_)) => bail!("splat mode `{mode}` does not take a metric"),
            _ => {}
        }
        let Some(policy) = mode.policy() else {
            return self.forward(input, flow);
        };

        let weight = match (mode, metric) {
            (SplatMode::Linear(_), Some(metric)) => {
                validate_metric(&input, &metric)?;
                metric.to_owned()
            }
            (SplatMode::Soft(_), Some(metric)) => {
                validate_metric(&input, &metric)?;
                metric.mapv(f32::exp)
            }
            _ => Array4::<f32>::ones((input.shape()[0], 1, input.shape()[2], input.shape()[3])),
        };

        let augmented = weighted_with_channel(input, weight.view());
        let splatted = self.forward(augmented.view(), flow)?;
        Ok(normalize_by_last_channel(&splatted, policy, self.epsilon))
    }

    fn launch(
        &self,
        kernel: KernelSource,
        bindings: BindingSet<'_>,
        n: usize,
        args: &[LaunchArg<'_>],
    ) -> Result<()> {
        self.launcher
            .launch(kernel.name, kernel.template, bindings, n, args)
    }
}

/// `[input * weight, weight]` along the channel axis; `weight` has one channel.
pub(crate) fn weighted_with_channel(input: ArrayView4<'_, f32>, weight: ArrayView4<'_, f32>) -> Array4<f32> {
    let (batch, channels, height, width) = input.dim();
    let mut augmented = Array4::<f32>::zeros((batch, channels + 1, height, width));
    augmented
        .slice_mut(s![.., 0..channels, .., ..])
        .assign(&(&input * &weight));
    augmented
        .slice_mut(s![.., channels..channels + 1, .., ..])
        .assign(&weight);
    augmented
}

/// Divide every channel but the last by the last, after `policy`.
fn normalize_by_last_channel(splatted: &Array4<f32>, policy: EpsilonPolicy, epsilon: f32) -> Array4<f32> {
    let channels = splatted.len_of(Axis(1)) - 1;
    let weight = splatted
        .slice(s![.., channels..channels + 1, .., ..])
        .mapv(|w| policy.apply(w, epsilon));
    let mut output = splatted.slice(s![.., 0..channels, .., ..]).to_owned();
    output /= &weight;
    output
}

fn validate_flow(input: &ArrayView4<'_, f32>, flow: &ArrayView4<'_, f32>) -> Result<()> {
    let (batch, _, height, width) = input.dim();
    ensure!(
        flow.dim() == (batch, 2, height, width),
        "flow shape {:?} does not match input shape {:?}; expected [{batch}, 2, {height}, {width}]",
        flow.shape(),
        input.shape()
    );
    Ok(())
}

pub(crate) fn validate_metric(input: &ArrayView4<'_, f32>, metric: &ArrayView4<'_, f32>) -> Result<()> {
    let (batch, _, height, width) = input.dim();
    ensure!(
        metric.dim() == (batch, 1, height, width),
        "metric shape {:?} does not match input shape {:?}; expected [{batch}, 1, {height}, {width}]",
        metric.shape(),
        input.shape()
    );
    Ok(())
}

pub fn upcast_f16(array: ArrayView4<'_, f16>) -> Array4<f32> {
    match array.as_slice() {
        Some(values) => {
            let mut converted = vec![0.0f32; values.len()];
            values.convert_to_f32_slice(&mut converted);
            Array4::from_shape_vec(array.raw_dim(), converted)
                .unwrap_or_else(|_| array.mapv(f32::from))
        }
        None => array.mapv(f32::from),
    }
}

/// Largest element-wise absolute difference.
pub fn max_abs_diff(a: ArrayView4<'_, f32>, b: ArrayView4<'_, f32>) -> f32 {
    Zip::from(&a)
        .and(&b)
        .fold(0.0f32, |acc, &x, &y| acc.max((x - y).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    fn splat() -> SoftSplat {
        let device = HostDevice::new().with_identity("host:splat-tests");
        SoftSplat::new(KernelLauncher::new(
            Arc::new(device),
            Arc::new(KernelCache::new()),
        ))
    }

    fn constant_flow(shape: (usize, usize, usize), dx: f32, dy: f32) -> Array4<f32> {
        let (batch, height, width) = shape;
        let mut flow = Array4::<f32>::zeros((batch, 2, height, width));
        flow.slice_mut(s![.., 0, .., ..]).fill(dx);
        flow.slice_mut(s![.., 1, .., ..]).fill(dy);
        flow
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("sum".parse::<SplatMode>().expect("sum"), SplatMode::Sum);
        assert_eq!(
            "avg".parse::<SplatMode>().expect("avg"),
            SplatMode::Avg(EpsilonPolicy::AddEps)
        );
        assert_eq!(
            "linear-zeroeps".parse::<SplatMode>().expect("linear"),
            SplatMode::Linear(EpsilonPolicy::ZeroEps)
        );
        assert_eq!(
            "soft-clipeps".parse::<SplatMode>().expect("soft"),
            SplatMode::Soft(EpsilonPolicy::ClipEps)
        );
        assert!("soft-foo".parse::<SplatMode>().is_err());
        assert!("sum-addeps".parse::<SplatMode>().is_err());
        assert!("max".parse::<SplatMode>().is_err());
        assert_eq!(SplatMode::Soft(EpsilonPolicy::AddEps).to_string(), "soft-addeps");
    }

    #[test]
    fn test_epsilon_policies() {
        assert_eq!(EpsilonPolicy::AddEps.apply(0.0, 1e-7), 1e-7);
        assert_eq!(EpsilonPolicy::ZeroEps.apply(0.0, 1e-7), 1.0);
        assert_eq!(EpsilonPolicy::ZeroEps.apply(0.5, 1e-7), 0.5);
        assert_eq!(EpsilonPolicy::ClipEps.apply(1e-9, 1e-7), 1e-7);
        assert_eq!(EpsilonPolicy::ClipEps.apply(2.0, 1e-7), 2.0);
    }

    #[test]
    fn test_zero_flow_sum_reproduces_input() {
        let input = Array4::<f32>::ones((1, 1, 3, 3));
        let flow = Array4::<f32>::zeros((1, 2, 3, 3));
        let output = splat()
            .splat(input.view(), flow.view(), None, SplatMode::Sum)
            .expect("splat");
        assert_eq!(output, input);
    }

    #[test]
    fn test_half_pixel_shift_sum_and_avg() {
        let input = Array::from_shape_vec((1, 1, 1, 3), vec![1.0f32, 2.0, 3.0]).expect("shape");
        let flow = constant_flow((1, 1, 3), 0.5, 0.0);
        let op = splat();

        let summed = op
            .splat(input.view(), flow.view(), None, SplatMode::Sum)
            .expect("sum");
        assert_eq!(summed, array![[[[0.5f32, 1.5, 2.5]]]]);

        let averaged = op
            .splat(input.view(), flow.view(), None, SplatMode::Avg(EpsilonPolicy::AddEps))
            .expect("avg");
        let expected = [1.0f32, 1.5, 2.5];
        for (x, want) in expected.iter().enumerate() {
            assert!((averaged[[0, 0, 0, x]] - want).abs() < 1e-5, "x={x}: {}", averaged[[0, 0, 0, x]]);
        }
    }

    #[test]
    fn test_metric_rules() {
        let input = Array4::<f32>::ones((1, 1, 2, 2));
        let flow = Array4::<f32>::zeros((1, 2, 2, 2));
        let metric = Array4::<f32>::zeros((1, 1, 2, 2));
        let op = splat();

        assert!(op
            .splat(input.view(), flow.view(), Some(metric.view()), SplatMode::Sum)
            .is_err());
        assert!(op
            .splat(input.view(), flow.view(), None, SplatMode::Soft(EpsilonPolicy::AddEps))
            .is_err());

        let bad_metric = Array4::<f32>::zeros((1, 2, 2, 2));
        assert!(op
            .splat(input.view(), flow.view(), Some(bad_metric.view()), SplatMode::Linear(EpsilonPolicy::AddEps))
            .is_err());
    }

    #[test]
    fn test_soft_mode_prefers_higher_metric() {
        // Two pixels land on the same cell; the one with the larger metric dominates.
        let input = Array::from_shape_vec((1, 1, 1, 2), vec![10.0f32, 20.0]).expect("shape");
        let mut flow = Array4::<f32>::zeros((1, 2, 1, 2));
        flow[[0, 0, 0, 0]] = 1.0;
        let metric = Array::from_shape_vec((1, 1, 1, 2), vec![0.0f32, 5.0]).expect("shape");
        let output = splat()
            .splat(
                input.view(),
                flow.view(),
                Some(metric.view()),
                SplatMode::Soft(EpsilonPolicy::AddEps),
            )
            .expect("soft splat");
        let blended = output[[0, 0, 0, 1]];
        assert!(blended > 19.9 && blended < 20.0, "{blended}");
    }

    #[test]
    fn test_shape_validation_happens_before_launch() {
        let op = splat();
        let input = Array4::<f32>::zeros((1, 3, 4, 4));
        let flow = Array4::<f32>::zeros((1, 3, 4, 4));
        let err = op.forward(input.view(), flow.view()).expect_err("bad flow");
        assert!(err.to_string().contains("flow shape"));
        assert!(op.launcher().cache().is_empty());

        let flow = Array4::<f32>::zeros((1, 2, 4, 4));
        let grad = Array4::<f32>::zeros((1, 2, 4, 4));
        assert!(op
            .backward(input.view(), flow.view(), grad.view(), GradRequest::both())
            .is_err());
    }

    #[test]
    fn test_backward_respects_request() {
        let op = splat();
        let input = Array4::<f32>::ones((1, 2, 3, 3));
        let flow = constant_flow((1, 3, 3), 0.25, 0.0);
        let grad = Array4::<f32>::ones((1, 2, 3, 3));

        let none = op
            .backward(input.view(), flow.view(), grad.view(), GradRequest::default())
            .expect("backward");
        assert!(none.input.is_none() && none.flow.is_none());

        let only_input = op
            .backward(
                input.view(),
                flow.view(),
                grad.view(),
                GradRequest {
                    input: true,
                    flow: false,
                },
            )
            .expect("backward");
        assert!(only_input.flow.is_none());
        let input_grad = only_input.input.expect("input grad");
        // Columns 0 and 1 keep all their mass inside; column 2 loses a quarter.
        assert!((input_grad[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((input_grad[[0, 1, 2, 2]] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_input_gradient_is_adjoint_of_forward() {
        let op = splat();
        let input = Array::from_shape_fn((1, 2, 4, 5), |(_, c, y, x)| (c + 2 * y + 3 * x) as f32 * 0.1);
        let flow = Array::from_shape_fn((1, 2, 4, 5), |(_, c, y, x)| {
            if c == 0 {
                0.3 + 0.1 * y as f32
            } else {
                -0.4 + 0.05 * x as f32
            }
        });
        let grad = Array::from_shape_fn((1, 2, 4, 5), |(_, c, y, x)| ((c + y * x) % 3) as f32 - 1.0);

        let output = op.forward(input.view(), flow.view()).expect("forward");
        let gradients = op
            .backward(input.view(), flow.view(), grad.view(), GradRequest::both())
            .expect("backward");
        let input_grad = gradients.input.expect("input grad");

        let lhs: f32 = (&output * &grad).sum();
        let rhs: f32 = (&input * &input_grad).sum();
        assert!((lhs - rhs).abs() < 1e-4, "{lhs} vs {rhs}");
    }

    #[test]
    fn test_forward_f16_matches_f32() {
        let op = splat();
        let input = Array::from_shape_fn((1, 1, 2, 3), |(_, _, y, x)| (y * 3 + x) as f32);
        let flow = constant_flow((1, 2, 3), 0.5, 0.5);
        let input_h = input.mapv(f16::from_f32);
        let flow_h = flow.mapv(f16::from_f32);

        let full = op.forward(input.view(), flow.view()).expect("f32");
        let half = op.forward_f16(input_h.view(), flow_h.view()).expect("f16");
        assert!(max_abs_diff(full.view(), half.view()) < 1e-6);
    }

    #[test]
    fn test_upcast_handles_non_contiguous_views() {
        let values = Array::from_shape_fn((1, 1, 2, 4), |(_, _, y, x)| f16::from_f32((y * 4 + x) as f32));
        let strided = values.slice(s![.., .., .., ..;2]);
        let upcast = upcast_f16(strided);
        assert_eq!(upcast, array![[[[0.0f32, 2.0], [4.0, 6.0]]]]);
    }
}
