//! kittivox-smooth — isotropic 3D Gaussian densification of occupancy volumes.
//!
//! Kernel is `exp(-(x²+y²+z²) / 2σ²)` over a `(2r+1)³` cube, unnormalised (the centre tap is 1).
//! Output has the input's shape; cells outside the volume count as zero.

use anyhow::Result;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use kittivox_core::{Error, Volume};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Full 3D spatial convolution, the reference.
    Direct,
    /// Three 1D passes.
    Separable,
    #[default]
    Auto,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothConfig {
    /// `None` disables smoothing.
    pub sigma: Option<f32>,
    pub radius: usize,
    pub backend: Backend,
}

impl Default for SmoothConfig {
    fn default() -> Self { Self { sigma: None, radius: 4, backend: Backend::Auto } }
}

pub trait Smoother: Send + Sync {
    fn smooth(&self, volume: &Volume) -> Result<Volume>;
    fn backend(&self) -> Backend;
}

/// 1D taps `g(t) = exp(-t² / 2σ²)` for `t ∈ [-r, r]`.
pub fn kernel_1d(sigma: f32, radius: usize) -> Vec<f32> {
    let r = radius as isize;
    (-r..=r).map(|t| (-((t * t) as f32) / (2.0 * sigma * sigma)).exp()).collect()
}

pub struct DirectSmoother { taps: Vec<f32>, radius: usize }

impl DirectSmoother {
    pub fn new(sigma: f32, radius: usize) -> Self { Self { taps: kernel_1d(sigma, radius), radius } }

    // g(x)g(y)g(z) == exp(-(x²+y²+z²)/2σ²), so the cube is built from the 1D taps.
    fn weight(&self, a: usize, b: usize, c: usize) -> f32 { self.taps[a] * self.taps[b] * self.taps[c] }
}

impl Smoother for DirectSmoother {
    fn smooth(&self, volume: &Volume) -> Result<Volume> {
        let [ox, oy, oz] = volume.shape();
        let r = self.radius as isize;
        let src = volume.as_slice();
        let plane = oy * oz;
        let mut out = vec![0.0f32; src.len()];
        if plane == 0 { return Volume::from_vec(volume.shape(), out); }

        out.par_chunks_mut(plane).enumerate().for_each(|(i, slab)| {
            for j in 0..oy {
                for k in 0..oz {
                    let mut acc = 0.0f32;
                    for di in -r..=r {
                        let si = i as isize + di;
                        if si < 0 || si >= ox as isize { continue; }
                        for dj in -r..=r {
                            let sj = j as isize + dj;
                            if sj < 0 || sj >= oy as isize { continue; }
                            for dk in -r..=r {
                                let sk = k as isize + dk;
                                if sk < 0 || sk >= oz as isize { continue; }
                                let v = src[(si as usize * oy + sj as usize) * oz + sk as usize];
                                if v != 0.0 {
                                    acc += v * self.weight((di + r) as usize, (dj + r) as usize, (dk + r) as usize);
                                }
                            }
                        }
                    }
                    slab[j * oz + k] = acc;
                }
            }
        });
        Volume::from_vec(volume.shape(), out)
    }

    fn backend(&self) -> Backend { Backend::Direct }
}

pub struct SeparableSmoother { taps: Vec<f32> }

impl SeparableSmoother {
    pub fn new(sigma: f32, radius: usize) -> Self { Self { taps: kernel_1d(sigma, radius) } }
}

/// One zero-padded 1D pass along `axis` of a C-order `shape` buffer.
fn convolve_axis(src: &[f32], shape: [usize; 3], axis: usize, taps: &[f32]) -> Vec<f32> {
    let stride = match axis { 0 => shape[1] * shape[2], 1 => shape[2], _ => 1 };
    let n = shape[axis] as isize;
    let r = (taps.len() / 2) as isize;
    let mut dst = vec![0.0f32; src.len()];
    dst.par_iter_mut().enumerate().for_each(|(f, out)| {
        let pos = ((f / stride) % shape[axis]) as isize;
        let mut acc = 0.0f32;
        for (t, &w) in taps.iter().enumerate() {
            let s = pos + t as isize - r;
            if s < 0 || s >= n { continue; }
            let sf = (f as isize + (s - pos) * stride as isize) as usize;
            acc += src[sf] * w;
        }
        *out = acc;
    });
    dst
}

impl Smoother for SeparableSmoother {
    fn smooth(&self, volume: &Volume) -> Result<Volume> {
        let shape = volume.shape();
        let mut buf = volume.as_slice().to_vec();
        for axis in [2, 1, 0] {
            buf = convolve_axis(&buf, shape, axis, &self.taps);
        }
        Volume::from_vec(shape, buf)
    }

    fn backend(&self) -> Backend { Backend::Separable }
}

/// Build the configured smoother, or `None` when smoothing is disabled.
/// `Auto` is decided here: separable unless only one core is available.
pub fn build(cfg: &SmoothConfig) -> Result<Option<Box<dyn Smoother>>> {
    let Some(sigma) = cfg.sigma else { return Ok(None) };
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(Error::Config(format!("smooth.sigma must be positive, got {sigma}")).into());
    }
    let backend = match cfg.backend {
        Backend::Auto => {
            let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            if cores > 1 { Backend::Separable } else { Backend::Direct }
        }
        b => b,
    };
    debug!("smoother: {backend:?} sigma={sigma} radius={}", cfg.radius);
    Ok(Some(match backend {
        Backend::Direct => Box::new(DirectSmoother::new(sigma, cfg.radius)),
        _ => Box::new(SeparableSmoother::new(sigma, cfg.radius)),
    }))
}
