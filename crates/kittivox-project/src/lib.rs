//! kittivox-project — LIDAR → camera → image-plane projection, and point rasterisation.

use anyhow::Result;
use image::{Rgb, Rgb32FImage};
use log::debug;
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use kittivox_core::{CalibrationSet, CameraId, Cloud, Frame, Rigid, ValidRegion};
use kittivox_filters::{fov_filter, FovWindow};

/// Camera-frame points with their pixel coordinates, one-to-one.
/// `None` marks a point with zero (or non-finite) projective depth.
#[derive(Clone, Debug)]
pub struct Projected {
    pub camera: Cloud,
    pub pixels: Vec<Option<[f32; 2]>>,
}

impl Projected {
    pub fn len(&self) -> usize { self.pixels.len() }
    pub fn is_empty(&self) -> bool { self.pixels.is_empty() }
    pub fn projectable(&self) -> usize { self.pixels.iter().filter(|p| p.is_some()).count() }
}

/// `p_cam = R·p + T`, then `p_img = P_rect·p_cam / z`.
#[derive(Copy, Clone, Debug)]
pub struct FrameProjector {
    pub velo_to_cam: Rigid,
    pub p_rect: Matrix3<f64>,
}

impl FrameProjector {
    pub fn new(calib: &CalibrationSet, cam: CameraId) -> Self {
        Self { velo_to_cam: calib.velo_to_cam, p_rect: calib.camera(cam).p_rect }
    }

    pub fn lidar_to_camera(&self, input: &Cloud) -> Result<Cloud> {
        anyhow::ensure!(input.frame == Frame::Lidar, "lidar_to_camera expects a LIDAR-frame cloud, got {:?}", input.frame);
        let pts: Vec<[f32; 3]> = (0..input.len())
            .into_par_iter()
            .map(|i| {
                let p = self.velo_to_cam.apply(input.point(i));
                [p.x as f32, p.y as f32, p.z as f32]
            })
            .collect();

        let mut out = Cloud::with_capacity(Frame::Camera, pts.len());
        for p in pts { out.push(p[0], p[1], p[2]); }
        out.scalar = input.scalar.clone();
        Ok(out)
    }

    #[inline]
    pub fn pixel(&self, p_cam: [f32; 3]) -> Option<[f32; 2]> {
        let h = self.p_rect * Vector3::new(p_cam[0] as f64, p_cam[1] as f64, p_cam[2] as f64);
        if h.z == 0.0 { return None; }
        let (u, v) = ((h.x / h.z) as f32, (h.y / h.z) as f32);
        (u.is_finite() && v.is_finite()).then_some([u, v])
    }

    pub fn camera_to_pixels(&self, cam: &Cloud) -> Result<Vec<Option<[f32; 2]>>> {
        anyhow::ensure!(cam.frame == Frame::Camera, "camera_to_pixels expects a camera-frame cloud, got {:?}", cam.frame);
        Ok((0..cam.len()).into_par_iter().map(|i| self.pixel(cam.point(i))).collect())
    }

    pub fn project(&self, input: &Cloud) -> Result<Projected> {
        let camera = self.lidar_to_camera(input)?;
        let pixels = self.camera_to_pixels(&camera)?;
        let out = Projected { camera, pixels };
        debug!("project: {} points, {} projectable", out.len(), out.projectable());
        Ok(out)
    }
}

/// FOV filter followed by projection; returns the projection and the per-point range colour.
pub fn velo_to_image(points: &Cloud, calib: &CalibrationSet, cam: CameraId, fov: &FovWindow) -> Result<(Projected, Vec<f32>)> {
    let filtered = fov_filter(points, fov)?;
    let projected = FrameProjector::new(calib, cam).project(&filtered.cloud)?;
    Ok((projected, filtered.color))
}

/// Write `color[i]` (grey, all three channels) at each pixel that lands in `[0,w)×[0,h)` of
/// an ROI-sized buffer. Later points overwrite earlier ones.
pub fn rasterize(pixels: &[Option<[f32; 2]>], color: &[f32], roi: &ValidRegion) -> Rgb32FImage {
    let mut img = Rgb32FImage::new(roi.w, roi.h);
    let (w, h) = (roi.w as f32, roi.h as f32);
    for (px, &c) in pixels.iter().zip(color) {
        let Some([u, v]) = *px else { continue };
        if (0.0..w).contains(&u) && (0.0..h).contains(&v) {
            img.put_pixel(u as u32, v as u32, Rgb([c, c, c]));
        }
    }
    img
}

/// LIDAR-frame cloud → ROI-sized colour raster through the reference camera.
pub fn points_to_image_space(points: &Cloud, roi: &ValidRegion, calib: &CalibrationSet, cam: CameraId, fov: &FovWindow) -> Result<Rgb32FImage> {
    let (projected, color) = velo_to_image(points, calib, cam, fov)?;
    Ok(rasterize(&projected.pixels, &color, roi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn projector() -> FrameProjector {
        // KITTI-like axes: lidar x fwd/y left/z up → camera z fwd/x right/y down.
        let r = Matrix3::new(0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 1.0, 0.0, 0.0);
        FrameProjector {
            velo_to_cam: Rigid { r, t: Vector3::new(0.0, 0.0, 0.0) },
            p_rect: Matrix3::new(700.0, 0.0, 600.0, 0.0, 700.0, 180.0, 0.0, 0.0, 1.0),
        }
    }

    fn lidar(pts: &[[f32; 3]]) -> Cloud {
        let mut c = Cloud::new(Frame::Lidar);
        for p in pts { c.push(p[0], p[1], p[2]); }
        c
    }

    #[test]
    fn forward_point_hits_principal_point() {
        let out = projector().project(&lidar(&[[10.0, 0.0, 0.0]])).unwrap();
        assert_eq!(out.camera.frame, Frame::Camera);
        assert_eq!(out.camera.point(0), [0.0, 0.0, 10.0]);
        let [u, v] = out.pixels[0].unwrap();
        assert_relative_eq!(u, 600.0);
        assert_relative_eq!(v, 180.0);
    }

    #[test]
    fn left_and_up_move_pixel_left_and_up() {
        let out = projector().project(&lidar(&[[10.0, 1.0, 1.0]])).unwrap();
        let [u, v] = out.pixels[0].unwrap();
        assert_relative_eq!(u, 600.0 - 70.0, epsilon = 1e-3);
        assert_relative_eq!(v, 180.0 - 70.0, epsilon = 1e-3);
    }

    #[test]
    fn zero_depth_is_not_projectable() {
        // lidar x = 0 → camera z = 0
        let out = projector().project(&lidar(&[[0.0, 3.0, 1.0], [5.0, 0.0, 0.0]])).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.pixels[0].is_none());
        assert!(out.pixels[1].is_some());
        assert_eq!(out.projectable(), 1);
    }

    #[test]
    fn frames_are_checked() {
        let p = projector();
        assert!(p.lidar_to_camera(&Cloud::new(Frame::Camera)).is_err());
        assert!(p.camera_to_pixels(&Cloud::new(Frame::Lidar)).is_err());
    }

    #[test]
    fn rasterize_skips_outside_and_last_write_wins() {
        let roi = ValidRegion { x: 3, y: 2, w: 4, h: 3 };
        let pixels = [Some([1.2, 1.9]), Some([1.7, 1.0]), Some([4.0, 0.0]), None, Some([-0.5, 0.0])];
        let color = [10.0, 20.0, 30.0, 40.0, 50.0];
        let img = rasterize(&pixels, &color, &roi);
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(img.get_pixel(1, 1).0, [20.0; 3]);
        assert_eq!(img.pixels().filter(|p| p.0[0] != 0.0).count(), 1);
    }
}
