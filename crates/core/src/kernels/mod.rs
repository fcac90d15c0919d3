//! Device templates for the splat and warp kernels, and their host entries.
//!
//! The host entries follow the device code line for line: one index per
//! thread over the same `[N, C, H, W]` domain, the same bilinear corners and
//! the same skip on non-finite sample positions.

use anyhow::Result;

use crate::host::{HostKernelRegistry, HostLaunch};

/// A named device template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSource {
    pub name: &'static str,
    pub template: &'static str,
}

pub const SOFTSPLAT_OUT: KernelSource = KernelSource {
    name: "softsplat_out",
    template: include_str!("../../kernels/softsplat_out.cu"),
};

pub const SOFTSPLAT_INGRAD: KernelSource = KernelSource {
    name: "softsplat_ingrad",
    template: include_str!("../../kernels/softsplat_ingrad.cu"),
};

pub const SOFTSPLAT_FLOWGRAD: KernelSource = KernelSource {
    name: "softsplat_flowgrad",
    template: include_str!("../../kernels/softsplat_flowgrad.cu"),
};

pub const BACKWARP_OUT: KernelSource = KernelSource {
    name: "backwarp_out",
    template: include_str!("../../kernels/backwarp_out.cu"),
};

pub const ALL_KERNELS: [KernelSource; 4] = [
    SOFTSPLAT_OUT,
    SOFTSPLAT_INGRAD,
    SOFTSPLAT_FLOWGRAD,
    BACKWARP_OUT,
];

/// Integer neighbours of a fractional sample position and their weights.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Corners {
    x0: i64,
    y0: i64,
    fx: f32,
    fy: f32,
}

impl Corners {
    /// `None` when the sample position is not finite; such pixels move nothing.
    fn at(x: usize, y: usize, dx: f32, dy: f32) -> Option<Self> {
        let fx = x as f32 + dx;
        let fy = y as f32 + dy;
        if !fx.is_finite() || !fy.is_finite() {
            return None;
        }
        Some(Self {
            x0: fx.floor() as i64,
            y0: fy.floor() as i64,
            fx,
            fy,
        })
    }

    /// `(x, y)` of the north-west, north-east, south-west and south-east corners.
    fn positions(&self) -> [(i64, i64); 4] {
        let (x0, y0) = (self.x0, self.y0);
        [(x0, y0), (x0 + 1, y0), (x0, y0 + 1), (x0 + 1, y0 + 1)]
    }

    fn weights(&self) -> [f32; 4] {
        let (x0, y0) = (self.x0 as f32, self.y0 as f32);
        let (x1, y1) = (x0 + 1.0, y0 + 1.0);
        let (fx, fy) = (self.fx, self.fy);
        [
            (x1 - fx) * (y1 - fy),
            (fx - x0) * (y1 - fy),
            (x1 - fx) * (fy - y0),
            (fx - x0) * (fy - y0),
        ]
    }

    /// Derivatives of [`Corners::weights`] with respect to flow channel
    /// `channel` (0 horizontal, 1 vertical).
    fn weight_derivatives(&self, channel: usize) -> [f32; 4] {
        let (x0, y0) = (self.x0 as f32, self.y0 as f32);
        let (x1, y1) = (x0 + 1.0, y0 + 1.0);
        let (fx, fy) = (self.fx, self.fy);
        match channel {
            0 => [-(y1 - fy), y1 - fy, -(fy - y0), fy - y0],
            1 => [-(x1 - fx), -(fx - x0), x1 - fx, fx - x0],
            _ => [0.0; 4],
        }
    }

    /// Corners inside `width x height`, paired with their index in the
    /// corner arrays.
    fn inside(&self, width: usize, height: usize) -> impl Iterator<Item = (usize, usize, usize)> {
        self.positions()
            .into_iter()
            .enumerate()
            .filter_map(move |(corner, (cx, cy))| {
                let inside = cx >= 0 && cy >= 0 && (cx as usize) < width && (cy as usize) < height;
                inside.then_some((corner, cx as usize, cy as usize))
            })
    }
}

/// `[N, 2, H, W]` flow matching an `[N, C, H, W]` image.
fn flow_shape([batch, _, height, width]: [usize; 4]) -> [usize; 4] {
    [batch, 2, height, width]
}

fn softsplat_out(launch: &HostLaunch<'_, '_>) -> Result<()> {
    let n = launch.count(0)?;
    let input = launch.tensor(1, "input")?;
    let flow = launch.tensor(2, "flow")?;
    let output = launch.tensor_mut(3, "output")?;
    launch.ensure_domain(n, "output", &output)?;
    launch.ensure_shape("input", &input, output.shape())?;
    launch.ensure_shape("flow", &flow, flow_shape(output.shape()))?;

    launch.for_each_index(n, |index| {
        let [b, c, y, x] = output.unravel(index);
        let Some(corners) = Corners::at(x, y, flow.get(b, 0, y, x), flow.get(b, 1, y, x)) else {
            return;
        };
        let value = input.get(b, c, y, x);
        let weights = corners.weights();
        for (corner, cx, cy) in corners.inside(output.width(), output.height()) {
            output.atomic_add(b, c, cy, cx, value * weights[corner]);
        }
    });
    Ok(())
}

fn softsplat_ingrad(launch: &HostLaunch<'_, '_>) -> Result<()> {
    let n = launch.count(0)?;
    let flow = launch.tensor(2, "flow")?;
    let output_grad = launch.tensor(3, "output_grad")?;
    let input_grad = launch.tensor_mut(4, "input_grad")?;
    launch.ensure_domain(n, "input_grad", &input_grad)?;
    launch.ensure_shape("output_grad", &output_grad, input_grad.shape())?;
    launch.ensure_shape("flow", &flow, flow_shape(input_grad.shape()))?;

    launch.for_each_index(n, |index| {
        let [b, c, y, x] = input_grad.unravel(index);
        let mut grad = 0.0f32;
        if let Some(corners) = Corners::at(x, y, flow.get(b, 0, y, x), flow.get(b, 1, y, x)) {
            let weights = corners.weights();
            for (corner, cx, cy) in corners.inside(output_grad.width(), output_grad.height()) {
                grad += output_grad.get(b, c, cy, cx) * weights[corner];
            }
        }
        input_grad.set(b, c, y, x, grad);
    });
    Ok(())
}

fn softsplat_flowgrad(launch: &HostLaunch<'_, '_>) -> Result<()> {
    let n = launch.count(0)?;
    let input = launch.tensor(1, "input")?;
    let flow = launch.tensor(2, "flow")?;
    let output_grad = launch.tensor(3, "output_grad")?;
    let flow_grad = launch.tensor_mut(5, "flow_grad")?;
    launch.ensure_domain(n, "flow_grad", &flow_grad)?;
    launch.ensure_shape("flow", &flow, flow_grad.shape())?;
    launch.ensure_shape("flow_grad", &flow_grad, flow_shape(input.shape()))?;
    launch.ensure_shape("output_grad", &output_grad, input.shape())?;

    launch.for_each_index(n, |index| {
        let [b, c, y, x] = flow_grad.unravel(index);
        let mut grad = 0.0f32;
        if let Some(corners) = Corners::at(x, y, flow.get(b, 0, y, x), flow.get(b, 1, y, x)) {
            let derivatives = corners.weight_derivatives(c);
            for channel in 0..output_grad.channels() {
                let value = input.get(b, channel, y, x);
                for (corner, cx, cy) in corners.inside(output_grad.width(), output_grad.height()) {
                    grad += output_grad.get(b, channel, cy, cx) * value * derivatives[corner];
                }
            }
        }
        flow_grad.set(b, c, y, x, grad);
    });
    Ok(())
}

fn backwarp_out(launch: &HostLaunch<'_, '_>) -> Result<()> {
    let n = launch.count(0)?;
    let input = launch.tensor(1, "input")?;
    let flow = launch.tensor(2, "flow")?;
    let output = launch.tensor_mut(3, "output")?;
    launch.ensure_domain(n, "output", &output)?;
    launch.ensure_shape("input", &input, output.shape())?;
    launch.ensure_shape("flow", &flow, flow_shape(output.shape()))?;

    launch.for_each_index(n, |index| {
        let [b, c, y, x] = output.unravel(index);
        let mut value = 0.0f32;
        if let Some(corners) = Corners::at(x, y, flow.get(b, 0, y, x), flow.get(b, 1, y, x)) {
            let weights = corners.weights();
            for (corner, cx, cy) in corners.inside(input.width(), input.height()) {
                value += input.get(b, c, cy, cx) * weights[corner];
            }
        }
        output.set(b, c, y, x, value);
    });
    Ok(())
}

pub fn register_host_kernels(registry: &mut HostKernelRegistry) {
    registry.register(SOFTSPLAT_OUT.name, softsplat_out);
    registry.register(SOFTSPLAT_INGRAD.name, softsplat_ingrad);
    registry.register(SOFTSPLAT_FLOWGRAD.name, softsplat_flowgrad);
    registry.register(BACKWARP_OUT.name, backwarp_out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LaunchArg;
    use crate::kernel_cache::{KernelCache, KernelLauncher};
    use crate::host::HostDevice;
    use crate::template::KernelTemplate;
    use crate::types::{BindingSet, TensorDescriptor};
    use ndarray::Array4;
    use std::sync::Arc;

    fn launcher() -> KernelLauncher {
        KernelLauncher::new(Arc::new(HostDevice::new()), Arc::new(KernelCache::new()))
    }

    #[test]
    fn test_weights_sum_to_one() {
        let corners = Corners::at(3, 2, 0.25, -0.75).expect("finite");
        assert_eq!(corners.positions()[0], (3, 1));
        let weights = corners.weights();
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((weights[0] - 0.75 * 0.75).abs() < 1e-6);
        assert!((weights[3] - 0.25 * 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_integer_position_puts_all_weight_on_one_corner() {
        let corners = Corners::at(1, 1, 0.0, 0.0).expect("finite");
        assert_eq!(corners.weights(), [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_positions_are_skipped() {
        assert!(Corners::at(0, 0, f32::NAN, 0.0).is_none());
        assert!(Corners::at(0, 0, 0.0, f32::INFINITY).is_none());
        assert!(Corners::at(0, 0, f32::NEG_INFINITY, 0.0).is_none());
    }

    #[test]
    fn test_weight_derivatives_match_finite_differences() {
        let (dx, dy) = (0.3f32, 0.6f32);
        let h = 1e-3f32;
        let base = Corners::at(2, 2, dx, dy).expect("finite");
        for channel in 0..2 {
            let (px, py) = if channel == 0 { (h, 0.0) } else { (0.0, h) };
            let plus = Corners::at(2, 2, dx + px, dy + py).expect("finite").weights();
            let minus = Corners::at(2, 2, dx - px, dy - py).expect("finite").weights();
            let analytic = base.weight_derivatives(channel);
            for corner in 0..4 {
                let numeric = (plus[corner] - minus[corner]) / (2.0 * h);
                assert!(
                    (numeric - analytic[corner]).abs() < 1e-2,
                    "channel {channel} corner {corner}: {numeric} vs {}",
                    analytic[corner]
                );
            }
        }
        assert_eq!(base.weight_derivatives(2), [0.0; 4]);
    }

    #[test]
    fn test_inside_filters_out_of_bounds_corners() {
        let corners = Corners::at(0, 0, -0.5, -0.5).expect("finite");
        let inside: Vec<_> = corners.inside(4, 4).collect();
        assert_eq!(inside, vec![(3, 0, 0)]);
    }

    #[test]
    fn test_templates_parse_and_declare_entry_points() {
        for kernel in ALL_KERNELS {
            let template = KernelTemplate::parse(kernel.name, kernel.template).expect("parse");
            assert!(kernel.template.contains(&format!("{}(", kernel.name)));
            assert!(kernel.template.contains("extern \"C\""));
            let placeholders = template.placeholders();
            assert!(placeholders.contains("type"), "{}", kernel.name);
            assert!(placeholders.contains("block_size"), "{}", kernel.name);
        }
    }

    #[test]
    fn test_softsplat_out_rejects_a_small_input() {
        let input = Array4::<f32>::zeros((1, 1, 1, 1));
        let flow = Array4::<f32>::zeros((1, 2, 4, 4));
        let mut output = Array4::<f32>::zeros((1, 1, 4, 4));
        let input_desc = TensorDescriptor::of(&input);
        let flow_desc = TensorDescriptor::of(&flow);
        let output_desc = TensorDescriptor::of_mut(&mut output);
        let bindings = BindingSet::new()
            .with_tensor("input", input_desc.clone())
            .with_tensor("flow", flow_desc.clone())
            .with_tensor("output", output_desc.clone());
        let error = launcher()
            .launch(
                SOFTSPLAT_OUT.name,
                SOFTSPLAT_OUT.template,
                bindings,
                16,
                &[
                    LaunchArg::Int(16),
                    LaunchArg::Tensor(input_desc),
                    LaunchArg::Tensor(flow_desc),
                    LaunchArg::Tensor(output_desc),
                ],
            )
            .expect_err("input smaller than output");
        let message = format!("{error:#}");
        assert!(message.contains("softsplat_out"), "{message}");
        assert!(message.contains("`input`"), "{message}");
    }

    #[test]
    fn test_softsplat_out_rejects_a_count_past_the_output() {
        let input = Array4::<f32>::zeros((1, 1, 2, 2));
        let flow = Array4::<f32>::zeros((1, 2, 2, 2));
        let mut output = Array4::<f32>::zeros((1, 1, 2, 2));
        let input_desc = TensorDescriptor::of(&input);
        let flow_desc = TensorDescriptor::of(&flow);
        let output_desc = TensorDescriptor::of_mut(&mut output);
        let bindings = BindingSet::new()
            .with_tensor("input", input_desc.clone())
            .with_tensor("flow", flow_desc.clone())
            .with_tensor("output", output_desc.clone());
        let error = launcher()
            .launch(
                SOFTSPLAT_OUT.name,
                SOFTSPLAT_OUT.template,
                bindings,
                16,
                &[
                    LaunchArg::Int(16),
                    LaunchArg::Tensor(input_desc),
                    LaunchArg::Tensor(flow_desc),
                    LaunchArg::Tensor(output_desc),
                ],
            )
            .expect_err("count larger than output");
        assert!(format!("{error:#}").contains("`output` holds 4"));
    }

    #[test]
    fn test_flowgrad_rejects_a_flow_of_the_wrong_size() {
        let input = Array4::<f32>::zeros((1, 1, 3, 3));
        let flow = Array4::<f32>::zeros((1, 2, 2, 2));
        let output_grad = Array4::<f32>::zeros((1, 1, 3, 3));
        let mut flow_grad = Array4::<f32>::zeros((1, 2, 3, 3));
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
        let error = launcher()
            .launch(
                SOFTSPLAT_FLOWGRAD.name,
                SOFTSPLAT_FLOWGRAD.template,
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
            )
            .expect_err("flow smaller than flow_grad");
        let message = format!("{error:#}");
        assert!(message.contains("softsplat_flowgrad"), "{message}");
        assert!(message.contains("`flow`"), "{message}");
    }

    #[test]
    fn test_backwarp_rejects_a_flow_from_another_batch() {
        let input = Array4::<f32>::zeros((2, 1, 2, 2));
        let flow = Array4::<f32>::zeros((1, 2, 2, 2));
        let mut output = Array4::<f32>::zeros((2, 1, 2, 2));
        let input_desc = TensorDescriptor::of(&input);
        let flow_desc = TensorDescriptor::of(&flow);
        let output_desc = TensorDescriptor::of_mut(&mut output);
        let n = output_desc.element_count();
        let bindings = BindingSet::new()
            .with_tensor("input", input_desc.clone())
            .with_tensor("flow", flow_desc.clone())
            .with_tensor("output", output_desc.clone());
        let error = launcher()
            .launch(
                BACKWARP_OUT.name,
                BACKWARP_OUT.template,
                bindings,
                n,
                &[
                    LaunchArg::Int(n as i64),
                    LaunchArg::Tensor(input_desc),
                    LaunchArg::Tensor(flow_desc),
                    LaunchArg::Tensor(output_desc),
                ],
            )
            .expect_err("flow batch differs");
        assert!(format!("{error:#}").contains("backwarp_out"));
    }
}
