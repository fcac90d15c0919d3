//! Combines several metric-weighted splats into one normalized frame and
//! reports the pixels nothing landed on.

use anyhow::{bail, ensure, Context, Result};
use ndarray::{s, Array4, ArrayView4, Zip};
use tracing::debug;

use crate::splat::{validate_metric, weighted_with_channel, SoftSplat};

pub const HOLE_THRESHOLD: f32 = 1e-5;
pub const METRIC_CLIP: f32 = 20.0;

/// Added to each direction's splatted weight.
pub const DIRECTION_EPSILON: f32 = 1e-7;

/// One image pushed along an already time-scaled flow.
#[derive(Debug, Clone)]
pub struct DirectionalSplat<'a> {
    pub image: ArrayView4<'a, f32>,
    pub flow: ArrayView4<'a, f32>,
    /// Per-sample time weight; a single value applies to the whole batch.
    pub time: &'a [f32],
    /// `[N, 1, H, W]` confidence, exponentiated after clipping.
    pub metric: ArrayView4<'a, f32>,
}

impl DirectionalSplat<'_> {
    fn time_for(&self, batch_index: usize) -> f32 {
        if self.time.len() == 1 {
            self.time[0]
        } else {
            self.time[batch_index]
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub frame: Array4<f32>,
    /// `[N, 1, H, W]`; true where the summed weight stayed under the threshold.
    pub holes: Array4<bool>,
    pub denominator: Array4<f32>,
}

impl Composite {
    pub fn hole_count(&self) -> usize {
        self.holes.iter().filter(|&&hole| hole).count()
    }

    /// Overwrite hole pixels with `fallback`, which has the frame's shape.
    pub fn fill_holes(&mut self, fallback: ArrayView4<'_, f32>) -> Result<()> {
        ensure!(
            fallback.shape() == self.frame.shape(),
            "fallback shape {:?} does not match frame shape {:?}",
            fallback.shape(),
            self.frame.shape()
        );
        Zip::from(&mut self.frame)
            .and(&fallback)
            .and_broadcast(&self.holes)
            .for_each(|pixel, &value, &hole| {
                if hole {
                    *pixel = value;
                }
            });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Compositor {
    splat: SoftSplat,
    hole_threshold: f32,
    metric_clip: f32,
}

impl Compositor {
    pub fn new(splat: SoftSplat) -> Self {
        Self {
            splat,
            hole_threshold: HOLE_THRESHOLD,
            metric_clip: METRIC_CLIP,
        }
    }

    pub fn with_hole_threshold(mut self, threshold: f32) -> Self {
        self.hole_threshold = threshold;
        self
    }

    pub fn with_metric_clip(mut self, clip: f32) -> Self {
        self.metric_clip = clip.abs();
        self
    }

    pub fn splat(&self) -> &SoftSplat {
        &self.splat
    }

    /// Splat every direction with weight `time * exp(clip(metric))`, sum
    /// numerators and weights, then divide.
    pub fn composite(&self, directions: &[DirectionalSplat<'_>]) -> Result<Composite> {
        let Some(first) = directions.first() else {
            bail!("compositing needs at least one direction");
        };
        let (batch, channels, height, width) = first.image.dim();

        let mut numerator = Array4::<f32>::zeros((batch, channels, height, width));
        let mut denominator = Array4::<f32>::zeros((batch, 1, height, width));

        for (index, direction) in directions.iter().enumerate() {
            self.accumulate(direction, &mut numerator, &mut denominator)
                .with_context(|| format!("direction {index}"))?;
        }

        let frame = &numerator / &denominator;
        let threshold = self.hole_threshold;
        let holes = denominator.mapv(|weight| weight < threshold);
        let composite = Composite {
            frame,
            holes,
            denominator,
        };
        debug!(
            directions = directions.len(),
            holes = composite.hole_count(),
            "Composited splats"
        );
        Ok(composite)
    }

    fn accumulate(
        &self,
        direction: &DirectionalSplat<'_>,
        numerator: &mut Array4<f32>,
        denominator: &mut Array4<f32>,
    ) -> Result<()> {
        ensure!(
            direction.image.shape() == numerator.shape(),
            "image shape {:?} does not match {:?}",
            direction.image.shape(),
            numerator.shape()
        );
        validate_metric(&direction.image, &direction.metric)?;
        let batch = direction.image.len_of(ndarray::Axis(0));
        ensure!(
            direction.time.len() == 1 || direction.time.len() == batch,
            "time has {} entries for a batch of {batch}",
            direction.time.len()
        );

        let clip = self.metric_clip;
        let weight = Array4::from_shape_fn(direction.metric.raw_dim(), |(n, c, y, x)| {
            direction.time_for(n) * direction.metric[[n, c, y, x]].clamp(-clip, clip).exp()
        });
        let augmented = weighted_with_channel(direction.image, weight.view());
        let splatted = self.splat.forward(augmented.view(), direction.flow)?;

        let channels = numerator.shape()[1];
        *numerator += &splatted.slice(s![.., 0..channels, .., ..]);
        *denominator += &splatted.slice(s![.., channels..channels + 1, .., ..]);
        *denominator += DIRECTION_EPSILON;
        Ok(())
    }

    /// Two-frame interpolation at time `t` in `[0, 1]`.
    ///
    /// `img0` moves along `flow01 * t` weighted by `1 - t`, `img1` along
    /// `flow10 * (1 - t)` weighted by `t`. Holes take the linear blend of
    /// the two inputs.
    #[allow(clippy::too_many_arguments)]
    pub fn interpolate(
        &self,
        img0: ArrayView4<'_, f32>,
        img1: ArrayView4<'_, f32>,
        flow01: ArrayView4<'_, f32>,
        flow10: ArrayView4<'_, f32>,
        metric0: ArrayView4<'_, f32>,
        metric1: ArrayView4<'_, f32>,
        t: f32,
    ) -> Result<Composite> {
        ensure!((0.0..=1.0).contains(&t), "interpolation time {t} is outside [0, 1]");
        ensure!(
            img0.shape() == img1.shape(),
            "frame shapes differ: {:?} vs {:?}",
            img0.shape(),
            img1.shape()
        );

        let forward_flow = &flow01 * t;
        let backward_flow = &flow10 * (1.0 - t);
        let (w0, w1) = ([1.0 - t], [t]);

        let mut composite = self.composite(&[
            DirectionalSplat {
                image: img0,
                flow: forward_flow.view(),
                time: &w0,
                metric: metric0,
            },
            DirectionalSplat {
                image: img1,
                flow: backward_flow.view(),
                time: &w1,
                metric: metric1,
            },
        ])?;

        let blend = &img0 * (1.0 - t) + &img1 * t;
        composite.fill_holes(blend.view())?;
        Ok(composite)
    }
}
