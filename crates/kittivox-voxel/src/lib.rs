//! kittivox-voxel — occupancy voxelization and its inverse (grid → points → image).
//!
//! Axis remap from camera to grid: `x_g = z_c`, `y_g = x_c`, `z_g = -y_c`.
//! Quantization (half-extents `h`, voxel counts `o`):
//!
//! ```text
//! i = floor(x_g * o_x / 2 / h_x) * 2
//! j = floor(y_g * o_y / 2 / h_y) + o_y / 2
//! k = floor(z_g * o_z / 2 / h_z) + o_z / 2
//! ```
//!
//! with `0 < i < o_x`, `0 < j < o_y`, `0 < k < o_z` (index 0 is never populated).
//! The sampler's inverse uses `x = i * h_x / (o_x / 2)` with no centering, so x does not
//! round-trip: cell `i` samples back to cell `2i`.

use std::ops::AddAssign;

use anyhow::Result;
use hashbrown::{HashMap, HashSet};
use image::Rgb32FImage;
use log::debug;
use rayon::prelude::*;
use kittivox_core::{CalibrationSet, CameraId, Cloud, CloudView, Frame, GridSpec, Mask2D, OccupancyGrid, ValidRegion, Volume};
use kittivox_filters::FovWindow;
use kittivox_project::{points_to_image_space, Projected};

#[inline] pub fn camera_to_grid(p: [f32; 3]) -> [f32; 3] { [p[2], p[0], -p[1]] }
#[inline] pub fn grid_to_camera(g: [f32; 3]) -> [f32; 3] { [g[1], -g[2], g[0]] }

/// Height code of a voxel layer: `trunc(min(255, 255 * max(0, (k - 6) / 9)))`.
#[inline]
pub fn height_code(k: usize) -> u8 {
    let t = ((k as f64 - 6.0) / (15.0 - 6.0)).max(0.0);
    (255.0 * t).min(255.0) as u8
}

/// Per-call diagnostics. Dropped points are the normal outcome, not errors.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VoxelStats {
    pub input: usize,
    pub accepted: usize,
    pub unprojectable: usize,
    pub outside_roi: usize,
    pub outside_grid: usize,
}

impl AddAssign for VoxelStats {
    fn add_assign(&mut self, o: Self) {
        self.input += o.input; self.accepted += o.accepted; self.unprojectable += o.unprojectable;
        self.outside_roi += o.outside_roi; self.outside_grid += o.outside_grid;
    }
}

#[derive(Clone, Debug)]
pub struct Voxelized {
    pub grid: OccupancyGrid,
    pub mask: Mask2D,
    /// Camera-frame points that populated a cell, in input order.
    pub visible: Cloud,
    pub stats: VoxelStats,
}

enum Outcome { Cell([usize; 3]), Unprojectable, OutsideRoi, OutsideGrid }

#[derive(Default)]
struct Partial {
    cells: HashSet<usize>,
    columns: HashMap<usize, u8>,
    visible: Vec<[f32; 3]>,
    stats: VoxelStats,
}

/// Fuses pixel validity (inside the ROI) and grid bounds into one occupancy volume.
#[derive(Copy, Clone, Debug)]
pub struct Voxelizer {
    pub spec: GridSpec,
    pub roi: ValidRegion,
}

impl Voxelizer {
    pub fn new(spec: GridSpec, roi: ValidRegion) -> Self { Self { spec, roi } }

    /// Quantize a grid-frame point; `None` if non-finite or outside the strict bounds.
    pub fn index(&self, g: [f32; 3]) -> Option<[usize; 3]> {
        let [hx, hy, hz] = self.spec.half();
        let [ox, oy, oz] = self.spec.occ();
        let (x, y, z) = (g[0] as f64, g[1] as f64, g[2] as f64);
        if !(x.is_finite() && y.is_finite() && z.is_finite()) { return None; }

        let i = (x * ox as f64 / 2.0 / hx).floor() * 2.0;
        let j = (y * oy as f64 / 2.0 / hy).floor() + (oy / 2) as f64;
        let k = (z * oz as f64 / 2.0 / hz).floor() + (oz / 2) as f64;
        let inside = |v: f64, n: usize| v > 0.0 && v < n as f64;
        (inside(i, ox) && inside(j, oy) && inside(k, oz)).then(|| [i as usize, j as usize, k as usize])
    }

    fn classify(&self, p_cam: [f32; 3], pixel: Option<[f32; 2]>) -> Outcome {
        let Some([u, v]) = pixel else { return Outcome::Unprojectable };
        if !self.roi.contains(u, v) { return Outcome::OutsideRoi; }
        match self.index(camera_to_grid(p_cam)) {
            Some(c) => Outcome::Cell(c),
            None => Outcome::OutsideGrid,
        }
    }

    fn check(&self, projected: &Projected) -> Result<()> {
        anyhow::ensure!(projected.camera.frame == Frame::Camera, "voxelize expects camera-frame points, got {:?}", projected.camera.frame);
        anyhow::ensure!(projected.camera.len() == projected.pixels.len(),
            "points/pixels length mismatch: {} vs {}", projected.camera.len(), projected.pixels.len());
        Ok(())
    }

    /// Serial reference implementation.
    pub fn voxelize(&self, projected: &Projected) -> Result<Voxelized> {
        self.check(projected)?;
        let [ox, oy, oz] = self.spec.occ();
        let mut grid = Volume::zeros([ox, oy, oz]);
        let mut mask = Mask2D::zeros([ox, oy]);
        let mut visible = Cloud::new(Frame::Camera);
        let mut stats = VoxelStats { input: projected.len(), ..Default::default() };

        for (n, px) in projected.pixels.iter().enumerate() {
            let p = projected.camera.point(n);
            match self.classify(p, *px) {
                Outcome::Cell([i, j, k]) => {
                    grid.set(i, j, k, 1.0);
                    mask.raise(i, j, height_code(k));
                    visible.push(p[0], p[1], p[2]);
                    stats.accepted += 1;
                }
                Outcome::Unprojectable => stats.unprojectable += 1,
                Outcome::OutsideRoi => stats.outside_roi += 1,
                Outcome::OutsideGrid => stats.outside_grid += 1,
            }
        }
        debug!("voxelize: {:?}", stats);
        Ok(Voxelized { grid, mask, visible, stats })
    }

    /// Chunked parallel variant. Each chunk scatters into its own sparse buffer; buffers merge
    /// in chunk order (idempotent cell writes, max for the mask), so the result equals `voxelize`.
    pub fn voxelize_par(&self, projected: &Projected, chunk: usize) -> Result<Voxelized> {
        self.check(projected)?;
        let chunk = chunk.max(1);
        let [ox, oy, oz] = self.spec.occ();
        let view = CloudView::from(&projected.camera);

        let parts: Vec<Partial> = projected.pixels
            .par_chunks(chunk)
            .enumerate()
            .map(|(ci, pixels)| {
                let pts = view.slice(ci * chunk, ci * chunk + pixels.len());
                let mut part = Partial::default();
                part.stats.input = pixels.len();
                for (o, px) in pixels.iter().enumerate() {
                    let p = pts.point(o);
                    match self.classify(p, *px) {
                        Outcome::Cell([i, j, k]) => {
                            part.cells.insert((i * oy + j) * oz + k);
                            let col = part.columns.entry(i * oy + j).or_insert(0);
                            *col = (*col).max(height_code(k));
                            part.visible.push(p);
                            part.stats.accepted += 1;
                        }
                        Outcome::Unprojectable => part.stats.unprojectable += 1,
                        Outcome::OutsideRoi => part.stats.outside_roi += 1,
                        Outcome::OutsideGrid => part.stats.outside_grid += 1,
                    }
                }
                part
            })
            .collect();

        let mut grid = Volume::zeros([ox, oy, oz]);
        let mut mask = Mask2D::zeros([ox, oy]);
        let mut visible = Cloud::with_capacity(Frame::Camera, parts.iter().map(|p| p.visible.len()).sum());
        let mut stats = VoxelStats::default();
        let cells = grid.as_mut_slice();
        for part in parts {
            for f in part.cells { cells[f] = 1.0; }
            for (col, v) in part.columns { mask.raise_flat(col, v); }
            for p in part.visible { visible.push(p[0], p[1], p[2]); }
            stats += part.stats;
        }
        debug!("voxelize_par: {:?} (chunk={})", stats, chunk);
        Ok(Voxelized { grid, mask, visible, stats })
    }
}

// ---------- grid → points ----------

/// Lazy walk over every `stride`-th cell along each axis, in (i, j, k) order.
/// Yields the cell's grid-frame coordinate when its value exceeds `threshold`, else `(0,0,0)`.
/// A clone continues from the same position; call [`GridSampler::points`] again to restart.
#[derive(Clone)]
pub struct GridPoints<'a> {
    grid: &'a Volume,
    spec: GridSpec,
    threshold: f32,
    stride: usize,
    cursor: [usize; 3],
    remaining: usize,
}

impl<'a> GridPoints<'a> {
    fn coord(&self, [i, j, k]: [usize; 3]) -> [f32; 3] {
        let [hx, hy, hz] = self.spec.half();
        let [ox, oy, oz] = self.spec.occ().map(|o| o as f64);
        [
            (i as f64 * hx / (ox / 2.0)) as f32,
            ((j as f64 - oy / 2.0) * hy / (oy / 2.0)) as f32,
            ((k as f64 - oz / 2.0) * hz / (oz / 2.0)) as f32,
        ]
    }

    /// Drain into a grid-frame cloud.
    pub fn into_cloud(self) -> Cloud {
        let mut c = Cloud::with_capacity(Frame::Grid, self.remaining);
        for p in self { c.push(p[0], p[1], p[2]); }
        c
    }
}

impl<'a> Iterator for GridPoints<'a> {
    type Item = [f32; 3];

    fn next(&mut self) -> Option<[f32; 3]> {
        if self.remaining == 0 { return None; }
        let ijk = self.cursor;
        let shape = self.grid.shape();
        // advance k fastest, then j, then i
        self.cursor[2] += self.stride;
        if self.cursor[2] >= shape[2] {
            self.cursor[2] = 0;
            self.cursor[1] += self.stride;
            if self.cursor[1] >= shape[1] {
                self.cursor[1] = 0;
                self.cursor[0] += self.stride;
            }
        }
        self.remaining -= 1;
        let [i, j, k] = ijk;
        Some(if self.grid.get(i, j, k) > self.threshold { self.coord(ijk) } else { [0.0; 3] })
    }

    fn size_hint(&self) -> (usize, Option<usize>) { (self.remaining, Some(self.remaining)) }
}

impl<'a> ExactSizeIterator for GridPoints<'a> {}

/// Inverse mappings from an occupancy volume.
#[derive(Copy, Clone, Debug)]
pub struct GridSampler { pub spec: GridSpec }

impl GridSampler {
    pub fn new(spec: GridSpec) -> Self { Self { spec } }

    pub fn points<'a>(&self, grid: &'a Volume, threshold: f32, stride: usize) -> Result<GridPoints<'a>> {
        anyhow::ensure!(stride > 0, "stride must be positive");
        anyhow::ensure!(grid.shape() == self.spec.occ(), "grid shape {:?} does not match spec {:?}", grid.shape(), self.spec.occ());
        let visits = grid.shape().iter().map(|n| n.div_ceil(stride)).product();
        Ok(GridPoints { grid, spec: self.spec, threshold, stride, cursor: [0; 3], remaining: visits })
    }

    /// Every cell (threshold 0, stride 1) rasterised through `cam` into an ROI-sized buffer.
    /// Grid coordinates are deliberately read as LIDAR input, so they pass through the FOV
    /// filter and `R·p + T` before `P_rect`, the same path as a raw sweep. Empty cells emit the origin, which projects wherever the
    /// LIDAR origin lands (dropped if its depth is zero).
    pub fn image_space(&self, grid: &Volume, roi: &ValidRegion, calib: &CalibrationSet, cam: CameraId, fov: &FovWindow) -> Result<Rgb32FImage> {
        let cloud = self.points(grid, 0.0, 1)?.into_cloud().reinterpret(Frame::Lidar);
        points_to_image_space(&cloud, roi, calib, cam, fov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kittivox_core::CalibMap;

    const ROI: ValidRegion = ValidRegion { x: 0, y: 0, w: 1242, h: 375 };

    fn projected(cam_pts: &[[f32; 3]], pixel: Option<[f32; 2]>) -> Projected {
        let mut c = Cloud::new(Frame::Camera);
        for p in cam_pts { c.push(p[0], p[1], p[2]); }
        Projected { pixels: vec![pixel; c.len()], camera: c }
    }

    fn small_spec() -> GridSpec { GridSpec::from_half_extents([8.0, 8.0, 4.0], 2.0).unwrap() }

    #[test]
    fn single_point_scenario() {
        let spec = GridSpec::from_half_extents([200.0, 200.0, 5.0], 4.0).unwrap();
        assert_eq!(spec.occ(), [1600, 1600, 40]);
        let vox = Voxelizer::new(spec, ROI);
        // camera z = 5 → grid (5, 0, 0)
        let out = vox.voxelize(&projected(&[[0.0, 0.0, 5.0]], Some([600.0, 180.0]))).unwrap();
        assert_eq!(vox.index([5.0, 0.0, 0.0]), Some([40, 800, 20]));
        assert_eq!(out.grid.get(40, 800, 20), 1.0);
        assert_eq!(out.grid.count_above(0.0), 1);
        assert_eq!(out.mask.get(40, 800), height_code(20));
        assert_eq!(out.visible.len(), 1);
        assert_eq!(out.visible.frame, Frame::Camera);
    }

    #[test]
    fn empty_input() {
        let out = Voxelizer::new(small_spec(), ROI).voxelize(&projected(&[], None)).unwrap();
        assert_eq!(out.grid.count_above(0.0), 0);
        assert_eq!(out.mask.max(), 0);
        assert!(out.visible.is_empty());
        assert_eq!(out.stats, VoxelStats::default());
    }

    #[test]
    fn height_codes() {
        let got: Vec<u8> = (0..20).map(height_code).collect();
        assert_eq!(&got[..8], &[0, 0, 0, 0, 0, 0, 0, 28]);
        assert_eq!(&got[8..16], &[56, 85, 113, 141, 170, 198, 226, 255]);
        assert!(got[16..].iter().all(|&v| v == 255));
    }

    #[test]
    fn x_index_is_always_even_and_zero_is_excluded() {
        let vox = Voxelizer::new(small_spec(), ROI); // occ (32, 32, 16)
        for n in 0..80 {
            let x = n as f32 * 0.1;
            if let Some([i, _, _]) = vox.index([x, 0.1, 0.1]) { assert_eq!(i % 2, 0, "x={x}"); }
        }
        assert_eq!(vox.index([0.2, 0.0, 0.0]), None);       // i = 0
        assert_eq!(vox.index([1.0, -8.0, 0.0]), None);      // j = 0
        assert_eq!(vox.index([1.0, 0.0, -4.0]), None);      // k = 0
        assert_eq!(vox.index([1.0, -7.4, -3.4]), Some([4, 1, 1]));
        assert_eq!(vox.index([8.0, 0.0, 0.0]), None);       // i = 32
        assert_eq!(vox.index([-1.0, 0.0, 0.0]), None);
        assert_eq!(vox.index([f32::NAN, 0.0, 0.0]), None);
        assert_eq!(vox.index([f32::INFINITY, 0.0, 0.0]), None);
    }

    #[test]
    fn outcomes_are_counted() {
        let vox = Voxelizer::new(small_spec(), ValidRegion { x: 10, y: 10, w: 100, h: 50 });
        let mut p = projected(&[[0.0, 0.0, 2.0]; 4], Some([20.0, 20.0]));
        p.pixels[1] = None;
        p.pixels[2] = Some([5.0, 20.0]);
        p.camera.z[3] = 100.0;
        let out = vox.voxelize(&p).unwrap();
        assert_eq!(out.stats, VoxelStats { input: 4, accepted: 1, unprojectable: 1, outside_roi: 1, outside_grid: 1 });
    }

    fn scattered() -> Projected {
        let mut pts = Vec::new();
        for n in 0..500 {
            let t = n as f32 * 0.37;
            pts.push([t.sin() * 7.5, (t * 1.3).cos() * 3.9, (t * 0.7).sin().abs() * 8.0]);
        }
        pts.push(pts[3]);
        pts.push(pts[7]);
        projected(&pts, Some([100.0, 100.0]))
    }

    #[test]
    fn idempotent_and_parallel_agrees() {
        let vox = Voxelizer::new(small_spec(), ROI);
        let p = scattered();
        let a = vox.voxelize(&p).unwrap();
        let b = vox.voxelize(&p).unwrap();
        assert_eq!(a.grid, b.grid);
        assert!(a.grid.as_slice().iter().all(|&v| v == 0.0 || v == 1.0));
        for chunk in [1, 7, 64, 10_000] {
            let c = vox.voxelize_par(&p, chunk).unwrap();
            assert_eq!(a.grid, c.grid);
            assert_eq!(a.mask, c.mask);
            assert_eq!(a.visible.x, c.visible.x);
            assert_eq!(a.stats, c.stats);
        }
    }

    #[test]
    fn mask_is_order_independent() {
        let vox = Voxelizer::new(small_spec(), ROI);
        let p = scattered();
        let mut rev = Cloud::new(Frame::Camera);
        for n in (0..p.camera.len()).rev() { let q = p.camera.point(n); rev.push(q[0], q[1], q[2]); }
        let r = Projected { pixels: p.pixels.clone(), camera: rev };
        let a = vox.voxelize(&p).unwrap();
        let b = vox.voxelize(&r).unwrap();
        assert_eq!(a.mask, b.mask);
        assert_eq!(a.grid, b.grid);
        assert!(a.mask.max() > 0);
    }

    #[test]
    fn points_visit_stride_and_emit_origin_for_empty_cells() {
        let spec = small_spec();
        let mut grid = Volume::zeros(spec.occ());
        grid.set(10, 16, 8, 1.0);
        let s = GridSampler::new(spec);
        let all: Vec<_> = s.points(&grid, 0.5, 1).unwrap().collect();
        assert_eq!(all.len(), 32 * 32 * 16);
        assert_eq!(all[grid.flat(10, 16, 8)], [5.0, 0.0, 0.0]);
        assert_eq!(all.iter().filter(|p| **p != [0.0; 3]).count(), 1);

        let strided = s.points(&grid, 0.5, 3).unwrap();
        assert_eq!(strided.len(), 11 * 11 * 6);
        assert_eq!(strided.clone().count(), 11 * 11 * 6);
        assert!(strided.into_iter().all(|p| p == [0.0; 3])); // (10,16,8) is not on the stride-3 lattice

        let again: Vec<_> = s.points(&grid, 0.5, 1).unwrap().collect();
        assert_eq!(all, again);
        assert!(s.points(&grid, 0.5, 0).is_err());
        assert!(s.points(&Volume::zeros([2, 2, 2]), 0.5, 1).is_err());
    }

    #[test]
    fn grid_to_points_round_trip() {
        let spec = small_spec(); // occ (32, 32, 16)
        let vox = Voxelizer::new(spec, ROI);
        let mut grid = Volume::zeros(spec.occ());
        for ijk in [[2, 1, 1], [4, 16, 8], [6, 31, 15], [14, 20, 3], [20, 5, 9]] { grid.set(ijk[0], ijk[1], ijk[2], 1.0); }

        let pts: Vec<[f32; 3]> = GridSampler::new(spec).points(&grid, 0.5, 1).unwrap()
            .filter(|p| *p != [0.0; 3])
            .map(grid_to_camera)
            .collect();
        let again = vox.voxelize(&projected(&pts, Some([1.0, 1.0]))).unwrap();

        // y and z come back exactly; x comes back doubled and falls off past occ_x.
        let expect: Vec<usize> = grid.occupied(0.5).into_iter()
            .map(|f| grid.unflat(f))
            .filter(|[i, _, _]| 2 * i < spec.occ()[0])
            .map(|[i, j, k]| grid.flat(2 * i, j, k))
            .collect();
        let mut got = again.grid.occupied(0.5);
        got.sort_unstable();
        let mut expect = expect;
        expect.sort_unstable();
        assert_eq!(got, expect);
        assert_eq!(got.len(), 4);
    }

    fn calib() -> CalibrationSet {
        let mut c2c = CalibMap::new();
        for id in CameraId::ALL {
            let s = id.suffix();
            c2c.insert(format!("S_{s}"), vec![1242.0, 375.0]);
            c2c.insert(format!("K_{s}"), vec![700.0, 0.0, 600.0, 0.0, 700.0, 180.0, 0.0, 0.0, 1.0]);
            c2c.insert(format!("D_{s}"), vec![0.0; 5]);
            c2c.insert(format!("R_{s}"), vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
            c2c.insert(format!("T_{s}"), vec![0.0; 3]);
            c2c.insert(format!("P_rect_{s}"), vec![700.0, 0.0, 600.0, 0.0, 0.0, 700.0, 180.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        }
        let mut rt = CalibMap::new();
        rt.insert("R".into(), vec![0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 1.0, 0.0, 0.0]);
        rt.insert("T".into(), vec![0.0; 3]);
        CalibrationSet::from_maps(c2c, rt.clone(), rt).unwrap()
    }

    #[test]
    fn image_space_rasterises_occupied_cells() {
        let spec = small_spec();
        let mut grid = Volume::zeros(spec.occ());
        grid.set(10, 16, 8, 1.0); // grid-frame (5, 0, 0)
        let img = GridSampler::new(spec)
            .image_space(&grid, &ROI, &calib(), CameraId::Color2, &FovWindow::default())
            .unwrap();
        assert_eq!(img.dimensions(), (ROI.w, ROI.h));
        // (5,0,0) as LIDAR → camera depth 5 → principal point; range colour floor(5/70*120) = 8
        assert_eq!(img.get_pixel(600, 180).0, [8.0; 3]);
        assert_eq!(img.pixels().filter(|p| p.0[0] != 0.0).count(), 1);
    }
}
