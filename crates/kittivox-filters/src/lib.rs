//! kittivox-filters — pass-through filters over raw sweeps (angular field-of-view window).

use anyhow::Result;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use kittivox_core::{Cloud, Error, Frame};

/// Angular window in degrees, closed at both ends.
/// Horizontal angle is `atan2(y, x)`, vertical is `atan2(z, sqrt(x²+y²))`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FovWindow {
    pub v_fov: (f64, f64),
    pub h_fov: (f64, f64),
}

impl Default for FovWindow {
    /// HDL-64E vertical span, front-facing ±45° horizontally.
    fn default() -> Self { Self { v_fov: (-24.9, 2.0), h_fov: (-45.0, 45.0) } }
}

impl FovWindow {
    /// Validates both ranges; the horizontal one is clamped to [-90, 90] (front half-plane).
    pub fn new(v_fov: (f64, f64), h_fov: (f64, f64)) -> Result<Self> {
        for (name, (lo, hi)) in [("v_fov", v_fov), ("h_fov", h_fov)] {
            if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                return Err(Error::Config(format!("{name} must be an ordered finite range, got ({lo}, {hi})")).into());
            }
        }
        Ok(Self { v_fov, h_fov: (h_fov.0.max(-90.0), h_fov.1.min(90.0)) })
    }

    #[inline]
    pub fn contains(&self, p: [f32; 3]) -> bool {
        let (x, y, z) = (p[0] as f64, p[1] as f64, p[2] as f64);
        let h = y.atan2(x).to_degrees();
        let v = z.atan2(x.hypot(y)).to_degrees();
        h >= self.h_fov.0 && h <= self.h_fov.1 && v >= self.v_fov.0 && v <= self.v_fov.1
    }
}

/// Range at which [`range_color`] saturates.
pub const COLOR_MAX_RANGE: f32 = 70.0;
/// Colour value assigned at [`COLOR_MAX_RANGE`].
pub const COLOR_SPAN: f32 = 120.0;

/// Range-coded colour: `clip(|p|, 0, 70) / 70 * 120`, truncated like a u8 cast.
#[inline]
pub fn range_color(p: [f32; 3]) -> f32 {
    let d = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt().min(COLOR_MAX_RANGE);
    (d / COLOR_MAX_RANGE * COLOR_SPAN).floor()
}

/// Points inside the window plus one colour value per kept point.
#[derive(Clone, Debug)]
pub struct FovFiltered {
    pub cloud: Cloud,
    pub color: Vec<f32>,
}

/// Keep LIDAR points whose horizontal and vertical angles fall inside `fov`. Input order is preserved.
pub fn fov_filter(input: &Cloud, fov: &FovWindow) -> Result<FovFiltered> {
    anyhow::ensure!(input.frame == Frame::Lidar, "fov_filter expects a LIDAR-frame cloud, got {:?}", input.frame);
    let keep: Vec<bool> = (0..input.len())
        .into_par_iter()
        .map(|i| fov.contains(input.point(i)))
        .collect();

    let cloud = input.select(&keep);
    let color = cloud.points().map(range_color).collect();
    debug!("fov_filter: {} -> {} (v={:?}, h={:?})", input.len(), cloud.len(), fov.v_fov, fov.h_fov);
    Ok(FovFiltered { cloud, color })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(pts: &[[f32; 3]]) -> Cloud {
        let mut c = Cloud::new(Frame::Lidar);
        for p in pts { c.push(p[0], p[1], p[2]); }
        c
    }

    #[test]
    fn boundary_angles_are_kept() {
        let fov = FovWindow::new((-24.9, 0.0), (0.0, 45.0)).unwrap();
        // h = 0 and v = 0 exactly: sits on both lower/upper bounds.
        let out = fov_filter(&cloud(&[[10.0, 0.0, 0.0]]), &fov).unwrap();
        assert_eq!(out.cloud.len(), 1);
    }

    #[test]
    fn just_outside_is_dropped() {
        let fov = FovWindow::new((-24.9, 0.0), (0.0, 45.0)).unwrap();
        let t = 0.001f64.to_radians().tan() as f32;
        let pts = [
            [10.0, -10.0 * t, 0.0],  // h = -0.001°
            [10.0, 0.0, 10.0 * t],   // v = +0.001°
            [10.0, 0.0, -10.0 * t],  // v = -0.001°, inside
        ];
        let out = fov_filter(&cloud(&pts), &fov).unwrap();
        assert_eq!(out.cloud.len(), 1);
        assert!(out.cloud.z[0] < 0.0);
    }

    #[test]
    fn just_outside_far_bounds_is_dropped() {
        let fov = FovWindow::new((-24.9, 0.0), (0.0, 45.0)).unwrap();
        let h_out = 45.001f64.to_radians().tan() as f32;
        let h_in = 44.999f64.to_radians().tan() as f32;
        let v_out = 24.901f64.to_radians().tan() as f32;
        let v_in = 24.899f64.to_radians().tan() as f32;
        let pts = [
            [10.0, 10.0 * h_out, 0.0],   // h = 45.001°
            [10.0, 10.0 * h_in, 0.0],    // h = 44.999°, inside
            [10.0, 0.0, -10.0 * v_out],  // v = -24.901°
            [10.0, 0.0, -10.0 * v_in],   // v = -24.899°, inside
        ];
        let out = fov_filter(&cloud(&pts), &fov).unwrap();
        assert_eq!(out.cloud.len(), 2);
        assert!(out.cloud.y[0] > 0.0);
        assert!(out.cloud.z[1] < 0.0);
    }

    #[test]
    fn default_window_rejects_rear_and_steep_points() {
        let pts = [
            [5.0, 1.0, -0.5],   // ahead
            [-5.0, 0.0, 0.0],   // behind
            [5.0, 6.0, 0.0],    // h ≈ 50°
            [5.0, 0.0, 1.0],    // v ≈ 11°
            [5.0, 0.0, -2.0],   // v ≈ -21.8°
            [1.0, 0.0, -1.0],   // v = -45°
        ];
        let out = fov_filter(&cloud(&pts), &FovWindow::default()).unwrap();
        assert_eq!(out.cloud.x, vec![5.0, 5.0]);
        assert_eq!(out.cloud.z, vec![-0.5, -2.0]);
        assert_eq!(out.color.len(), 2);
    }

    #[test]
    fn color_is_range_coded() {
        assert_eq!(range_color([35.0, 0.0, 0.0]), 60.0);
        assert_eq!(range_color([0.0, 0.0, 0.0]), 0.0);
        assert_eq!(range_color([300.0, 0.0, 0.0]), 120.0);
    }

    #[test]
    fn empty_and_wrong_frame() {
        let out = fov_filter(&Cloud::new(Frame::Lidar), &FovWindow::default()).unwrap();
        assert!(out.cloud.is_empty() && out.color.is_empty());
        assert!(fov_filter(&Cloud::new(Frame::Camera), &FovWindow::default()).is_err());
    }

    #[test]
    fn window_validation() {
        assert!(FovWindow::new((2.0, -24.9), (-45.0, 45.0)).is_err());
        assert!(FovWindow::new((-24.9, 2.0), (f64::NAN, 45.0)).is_err());
        let w = FovWindow::new((-24.9, 2.0), (-120.0, 135.0)).unwrap();
        assert_eq!(w.h_fov, (-90.0, 90.0));
    }
}
