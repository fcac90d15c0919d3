//! Backward warping and the occlusion and photometric helpers built on it.

use std::sync::Arc;

use anyhow::{ensure, Result};
use ndarray::{s, Array4, ArrayView4, Axis, Zip};

use crate::device::LaunchArg;
use crate::host::HostDevice;
use crate::kernel_cache::{KernelCache, KernelLauncher};
use crate::kernels::BACKWARP_OUT;
use crate::types::{BindingSet, TensorDescriptor};

pub const CONSISTENCY_ALPHA: f32 = 0.01;
pub const CONSISTENCY_BETA: f32 = 0.5;

/// `[N, 1, H, W]` masks; true where the round trip disagrees.
#[derive(Debug, Clone, PartialEq)]
pub struct OcclusionMasks {
    pub forward: Array4<bool>,
    pub backward: Array4<bool>,
}

/// Bilinear gather at `(x + flow_x, y + flow_y)` in pixel units, zero
/// outside the image.
#[derive(Debug, Clone)]
pub struct BackWarp {
    launcher: KernelLauncher,
}

impl BackWarp {
    pub fn new(launcher: KernelLauncher) -> Self {
        Self { launcher }
    }

    pub fn host() -> Self {
        Self::new(KernelLauncher::new(
            Arc::new(HostDevice::new()),
            KernelCache::global(),
        ))
    }

    pub fn warp(&self, input: ArrayView4<'_, f32>, flow: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (batch, _, height, width) = input.dim();
        ensure!(
            flow.dim() == (batch, 2, height, width),
            "flow shape {:?} does not match input shape {:?}",
            flow.shape(),
            input.shape()
        );

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
            self.launcher.launch(
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
            )?;
        }
        Ok(output)
    }

    /// Forward/backward flow agreement: a pixel is occluded when
    /// `|fwd + warp(bwd, fwd)| > alpha * (|fwd| + |bwd|) + beta`.
    pub fn consistency_check(
        &self,
        forward: ArrayView4<'_, f32>,
        backward: ArrayView4<'_, f32>,
        alpha: f32,
        beta: f32,
    ) -> Result<OcclusionMasks> {
        ensure!(
            forward.shape() == backward.shape() && forward.len_of(Axis(1)) == 2,
            "consistency check needs two [N, 2, H, W] flows, got {:?} and {:?}",
            forward.shape(),
            backward.shape()
        );

        let magnitude = &flow_norm(forward) + &flow_norm(backward);
        let threshold = magnitude.mapv(|m| alpha * m + beta);

        let warped_backward = self.warp(backward, forward)?;
        let warped_forward = self.warp(forward, backward)?;
        let forward_diff = flow_norm((&forward + &warped_backward).view());
        let backward_diff = flow_norm((&backward + &warped_forward).view());

        Ok(OcclusionMasks {
            forward: Zip::from(&forward_diff)
                .and(&threshold)
                .map_collect(|&diff, &limit| diff > limit),
            backward: Zip::from(&backward_diff)
                .and(&threshold)
                .map_collect(|&diff, &limit| diff > limit),
        })
    }

    /// Channel-mean L1 distance between `img0` and `img1` warped back by
    /// `flow01`, shaped `[N, 1, H, W]`.
    pub fn photometric_error(
        &self,
        img0: ArrayView4<'_, f32>,
        img1: ArrayView4<'_, f32>,
        flow01: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>> {
        ensure!(
            img0.shape() == img1.shape(),
            "frame shapes differ: {:?} vs {:?}",
            img0.shape(),
            img1.shape()
        );
        let warped = self.warp(img1, flow01)?;
        let error = (&img0 - &warped).mapv(f32::abs);
        let channels = error.len_of(Axis(1)).max(1) as f32;
        Ok(error.sum_axis(Axis(1)).insert_axis(Axis(1)) / channels)
    }
}

/// Per-pixel Euclidean norm of a `[N, 2, H, W]` field, shaped `[N, 1, H, W]`.
fn flow_norm(flow: ArrayView4<'_, f32>) -> Array4<f32> {
    let dx = flow.slice(s![.., 0..1, .., ..]);
    let dy = flow.slice(s![.., 1..2, .., ..]);
    Zip::from(&dx)
        .and(&dy)
        .map_collect(|&x, &y| (x * x + y * y).sqrt())
}
