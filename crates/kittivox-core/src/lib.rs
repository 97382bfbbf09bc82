//! kittivox-core — core data model shared by every stage: clouds, calibration, grids.

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use std::path::PathBuf;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Fatal error kinds. Library fns return `anyhow::Result` wrapping these,
/// so callers can `downcast_ref::<Error>()` when they need the kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("calibration {file}: key '{key}' {reason}")]
    Calibration { file: String, key: String, reason: String },

    #[error("sample {index}: missing asset {}", .path.display())]
    MissingAsset { index: usize, path: PathBuf },
}

/// Coordinate frame the x/y/z columns of a [`Cloud`] are expressed in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Rotating range sensor.
    Lidar,
    /// Optical center of the reference camera.
    Camera,
    /// Remapped axes used to index the occupancy volume (x fwd, y right, z up).
    Grid,
}

/// Structure-of-Arrays point cloud tagged with its frame.
/// `scalar`, when present, has the same length as x/y/z (intensity, range colour, ...).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cloud {
    pub frame: Frame,
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
    pub scalar: Option<Vec<f32>>,
}

impl Cloud {
    pub fn new(frame: Frame) -> Self { Self { frame, x: Vec::new(), y: Vec::new(), z: Vec::new(), scalar: None } }
    pub fn with_capacity(frame: Frame, n: usize) -> Self {
        let mut c = Self::new(frame); c.reserve(n); c
    }
    pub fn len(&self) -> usize { self.x.len() }
    pub fn is_empty(&self) -> bool { self.x.is_empty() }
    pub fn push(&mut self, px: f32, py: f32, pz: f32) {
        self.x.push(px); self.y.push(py); self.z.push(pz);
    }
    pub fn reserve(&mut self, n: usize) {
        self.x.reserve(n); self.y.reserve(n); self.z.reserve(n);
        if let Some(s) = self.scalar.as_mut() { s.reserve(n); }
    }
    #[inline] pub fn point(&self, i: usize) -> [f32; 3] { [self.x[i], self.y[i], self.z[i]] }
    pub fn points(&self) -> impl ExactSizeIterator<Item = [f32; 3]> + '_ {
        (0..self.len()).map(move |i| self.point(i))
    }

    /// Copy of the points whose `keep` flag is set, in input order. The scalar column follows
    /// only if its length matches.
    pub fn select(&self, keep: &[bool]) -> Cloud {
        debug_assert_eq!(keep.len(), self.len());
        let n = keep.iter().filter(|&&k| k).count();
        let mut out = Cloud::with_capacity(self.frame, n);
        let scalar = self.scalar.as_ref().filter(|s| s.len() == self.len());
        let mut sout = scalar.map(|_| Vec::with_capacity(n));
        for i in 0..self.len() {
            if !keep[i] { continue; }
            out.push(self.x[i], self.y[i], self.z[i]);
            if let (Some(src), Some(dst)) = (scalar, sout.as_mut()) { dst.push(src[i]); }
        }
        out.scalar = sout;
        out
    }

    /// Re-tag the coordinates as `frame` without touching them.
    pub fn reinterpret(mut self, frame: Frame) -> Cloud { self.frame = frame; self }
}

/// Zero-copy view into a Cloud (slice-of-SoA).
#[derive(Copy, Clone)]
pub struct CloudView<'a> {
    pub frame: Frame,
    pub x: &'a [f32],
    pub y: &'a [f32],
    pub z: &'a [f32],
}

impl<'a> CloudView<'a> {
    pub fn len(&self) -> usize { self.x.len() }
    pub fn is_empty(&self) -> bool { self.x.is_empty() }
    #[inline] pub fn point(&self, i: usize) -> [f32; 3] { [self.x[i], self.y[i], self.z[i]] }
    /// Contiguous sub-range `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> CloudView<'a> {
        CloudView { frame: self.frame, x: &self.x[start..end], y: &self.y[start..end], z: &self.z[start..end] }
    }
}

impl<'a> From<&'a Cloud> for CloudView<'a> {
    fn from(c: &'a Cloud) -> Self { Self { frame: c.frame, x: &c.x, y: &c.y, z: &c.z } }
}

// ---------- cameras ----------

/// The four KITTI cameras: two grayscale, two colour.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraId { Gray0, Gray1, Color2, Color3 }

impl CameraId {
    pub const ALL: [CameraId; 4] = [CameraId::Gray0, CameraId::Gray1, CameraId::Color2, CameraId::Color3];
    pub fn index(self) -> usize { self as usize }
    /// Two-digit suffix used in KITTI file and key names (`image_02`, `K_02`).
    pub fn suffix(self) -> &'static str {
        match self { CameraId::Gray0 => "00", CameraId::Gray1 => "01", CameraId::Color2 => "02", CameraId::Color3 => "03" }
    }
}

/// One value per camera, indexed by [`CameraId`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerCamera<T>(pub [T; 4]);

impl<T> PerCamera<T> {
    pub fn from_fn(mut f: impl FnMut(CameraId) -> T) -> Self {
        PerCamera(CameraId::ALL.map(&mut f))
    }
    pub fn try_from_fn<E>(mut f: impl FnMut(CameraId) -> Result<T, E>) -> Result<Self, E> {
        let [a, b, c, d] = CameraId::ALL;
        Ok(PerCamera([f(a)?, f(b)?, f(c)?, f(d)?]))
    }
    pub fn iter(&self) -> impl Iterator<Item = (CameraId, &T)> {
        CameraId::ALL.into_iter().zip(self.0.iter())
    }
    pub fn map<U>(self, mut f: impl FnMut(CameraId, T) -> U) -> PerCamera<U> {
        let [a, b, c, d] = self.0;
        let [ia, ib, ic, id] = CameraId::ALL;
        PerCamera([f(ia, a), f(ib, b), f(ic, c), f(id, d)])
    }
}

impl<T> Index<CameraId> for PerCamera<T> {
    type Output = T;
    fn index(&self, cam: CameraId) -> &T { &self.0[cam.index()] }
}
impl<T> IndexMut<CameraId> for PerCamera<T> {
    fn index_mut(&mut self, cam: CameraId) -> &mut T { &mut self.0[cam.index()] }
}

/// Axis-aligned rectangle of valid (border-free) pixels in an undistorted image.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidRegion { pub x: u32, pub y: u32, pub w: u32, pub h: u32 }

impl ValidRegion {
    pub fn full(w: u32, h: u32) -> Self { Self { x: 0, y: 0, w, h } }
    /// Half-open containment over pixel cells: `x <= u < x+w` and `y <= v < y+h`. The first
    /// row and column belong to the region, the far edges do not.
    pub fn contains(&self, u: f32, v: f32) -> bool {
        let (x0, y0) = (self.x as f32, self.y as f32);
        u >= x0 && u < x0 + self.w as f32 && v >= y0 && v < y0 + self.h as f32
    }
    pub fn area(&self) -> u64 { self.w as u64 * self.h as u64 }
}

// ---------- calibration ----------

/// Parsed `key: v v v` calibration file.
pub type CalibMap = BTreeMap<String, Vec<f64>>;

/// Rigid transform `p' = R·p + T`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rigid { pub r: Matrix3<f64>, pub t: Vector3<f64> }

impl Rigid {
    #[inline] pub fn apply(&self, p: [f32; 3]) -> Vector3<f64> {
        self.r * Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64) + self.t
    }
}

/// Per-camera intrinsics and extrinsics from `calib_cam_to_cam.txt`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraCalib {
    pub id: CameraId,
    /// Sensor resolution (w, h) before rectification.
    pub size: (u32, u32),
    pub k: Matrix3<f64>,
    /// Plumb-bob coefficients k1 k2 p1 p2 k3.
    pub d: [f64; 5],
    pub r: Matrix3<f64>,
    pub t: Vector3<f64>,
    /// Rectified projection, 3×4 `P_rect` with its last column dropped.
    pub p_rect: Matrix3<f64>,
}

/// Typed view over one sequence's three calibration files. Immutable after load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationSet {
    pub velo_to_cam: Rigid,
    pub imu_to_velo: Rigid,
    pub cameras: PerCamera<CameraCalib>,
    pub cam_to_cam_raw: CalibMap,
    pub imu_to_velo_raw: CalibMap,
    pub velo_to_cam_raw: CalibMap,
}

pub const CAM_TO_CAM: &str = "calib_cam_to_cam.txt";
pub const IMU_TO_VELO: &str = "calib_imu_to_velo.txt";
pub const VELO_TO_CAM: &str = "calib_velo_to_cam.txt";

fn field<const N: usize>(map: &CalibMap, file: &str, key: &str) -> anyhow::Result<[f64; N]> {
    let v = map.get(key).ok_or_else(|| Error::Calibration {
        file: file.into(), key: key.into(), reason: "is missing".into(),
    })?;
    <[f64; N]>::try_from(v.as_slice()).map_err(|_| Error::Calibration {
        file: file.into(), key: key.into(), reason: format!("has {} values, expected {}", v.len(), N),
    }.into())
}

fn rigid(map: &CalibMap, file: &str) -> anyhow::Result<Rigid> {
    let r = field::<9>(map, file, "R")?;
    let t = field::<3>(map, file, "T")?;
    Ok(Rigid { r: Matrix3::from_row_slice(&r), t: Vector3::from_row_slice(&t) })
}

impl CalibrationSet {
    /// Reshape the three parsed maps. Any missing or mis-sized field is an [`Error::Calibration`].
    pub fn from_maps(cam_to_cam: CalibMap, imu_to_velo: CalibMap, velo_to_cam: CalibMap) -> anyhow::Result<Self> {
        let cameras = PerCamera::try_from_fn(|id| -> anyhow::Result<CameraCalib> {
            let sfx = id.suffix();
            let s = field::<2>(&cam_to_cam, CAM_TO_CAM, &format!("S_{sfx}"))?;
            let k = field::<9>(&cam_to_cam, CAM_TO_CAM, &format!("K_{sfx}"))?;
            let d = field::<5>(&cam_to_cam, CAM_TO_CAM, &format!("D_{sfx}"))?;
            let r = field::<9>(&cam_to_cam, CAM_TO_CAM, &format!("R_{sfx}"))?;
            let t = field::<3>(&cam_to_cam, CAM_TO_CAM, &format!("T_{sfx}"))?;
            let p = field::<12>(&cam_to_cam, CAM_TO_CAM, &format!("P_rect_{sfx}"))?;
            if !(s[0] >= 1.0 && s[1] >= 1.0) {
                return Err(Error::Calibration {
                    file: CAM_TO_CAM.into(), key: format!("S_{sfx}"), reason: format!("is not a valid size: {s:?}"),
                }.into());
            }
            Ok(CameraCalib {
                id,
                size: (s[0] as u32, s[1] as u32),
                k: Matrix3::from_row_slice(&k),
                d,
                r: Matrix3::from_row_slice(&r),
                t: Vector3::from_row_slice(&t),
                p_rect: Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]),
            })
        })?;
        Ok(Self {
            velo_to_cam: rigid(&velo_to_cam, VELO_TO_CAM)?,
            imu_to_velo: rigid(&imu_to_velo, IMU_TO_VELO)?,
            cameras,
            cam_to_cam_raw: cam_to_cam,
            imu_to_velo_raw: imu_to_velo,
            velo_to_cam_raw: velo_to_cam,
        })
    }

    pub fn camera(&self, id: CameraId) -> &CameraCalib { &self.cameras[id] }
}

// ---------- grids ----------

/// Occupancy-volume geometry.
///
/// `half` are half-extents in cloud units: the grid covers `[0, half.x]` forward (the factor-2
/// x index in the voxelizer compensates) and `[-half, half]` along y and z. `occ` is the voxel
/// count per axis.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridSpec { half: [f64; 3], scale: f64, occ: [usize; 3] }

impl GridSpec {
    /// Full extents, as a `(200, 200, 10)`-style size tuple: `half = floor(size / 2)` and
    /// `occ = trunc(size * scale)`.
    pub fn from_size(size: [f64; 3], scale: f64) -> anyhow::Result<Self> {
        Self::validate(size, scale)?;
        let half = size.map(|s| (s / 2.0).floor());
        let occ = size.map(|s| (s * scale) as usize);
        Self::checked(half, scale, occ)
    }

    /// Half-extents: `occ = floor(half * 2 * scale)`.
    pub fn from_half_extents(half: [f64; 3], scale: f64) -> anyhow::Result<Self> {
        Self::validate(half, scale)?;
        let occ = half.map(|h| (h * 2.0 * scale).floor() as usize);
        Self::checked(half, scale, occ)
    }

    fn validate(ext: [f64; 3], scale: f64) -> anyhow::Result<()> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(Error::Config(format!("grid scale must be positive, got {scale}")).into());
        }
        if ext.iter().any(|e| !(e.is_finite() && *e > 0.0)) {
            return Err(Error::Config(format!("grid extents must be positive, got {ext:?}")).into());
        }
        Ok(())
    }

    fn checked(half: [f64; 3], scale: f64, occ: [usize; 3]) -> anyhow::Result<Self> {
        if half.iter().any(|h| *h <= 0.0) || occ.iter().any(|o| *o == 0) {
            return Err(Error::Config(format!("degenerate grid: half-extents {half:?}, voxels {occ:?}")).into());
        }
        Ok(Self { half, scale, occ })
    }

    pub fn half(&self) -> [f64; 3] { self.half }
    pub fn scale(&self) -> f64 { self.scale }
    pub fn occ(&self) -> [usize; 3] { self.occ }
    pub fn cells(&self) -> usize { self.occ.iter().product() }
    /// Bytes held by one dense f32 volume plus its u8 mask.
    pub fn dense_bytes(&self) -> usize {
        self.cells() * std::mem::size_of::<f32>() + self.occ[0] * self.occ[1]
    }
}

/// Dense 3D f32 volume in C order (`k` fastest). Occupancy grids hold {0.0, 1.0}.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Volume { shape: [usize; 3], data: Vec<f32> }

pub type OccupancyGrid = Volume;

impl Volume {
    pub fn zeros(shape: [usize; 3]) -> Self { Self { shape, data: vec![0.0; shape.iter().product()] } }
    pub fn from_vec(shape: [usize; 3], data: Vec<f32>) -> anyhow::Result<Self> {
        anyhow::ensure!(data.len() == shape.iter().product::<usize>(),
            "volume data has {} cells, shape {:?} needs {}", data.len(), shape, shape.iter().product::<usize>());
        Ok(Self { shape, data })
    }
    pub fn shape(&self) -> [usize; 3] { self.shape }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
    #[inline] pub fn flat(&self, i: usize, j: usize, k: usize) -> usize { (i * self.shape[1] + j) * self.shape[2] + k }
    #[inline] pub fn unflat(&self, f: usize) -> [usize; 3] {
        let k = f % self.shape[2];
        let ij = f / self.shape[2];
        [ij / self.shape[1], ij % self.shape[1], k]
    }
    #[inline] pub fn get(&self, i: usize, j: usize, k: usize) -> f32 { self.data[self.flat(i, j, k)] }
    #[inline] pub fn set(&mut self, i: usize, j: usize, k: usize, v: f32) { let f = self.flat(i, j, k); self.data[f] = v; }
    pub fn as_slice(&self) -> &[f32] { &self.data }
    pub fn as_mut_slice(&mut self) -> &mut [f32] { &mut self.data }
    pub fn count_above(&self, threshold: f32) -> usize { self.data.iter().filter(|&&v| v > threshold).count() }
    /// Flat indices of cells strictly above `threshold`, ascending.
    pub fn occupied(&self, threshold: f32) -> Vec<usize> {
        self.data.iter().enumerate().filter(|(_, &v)| v > threshold).map(|(f, _)| f).collect()
    }
}

/// Dense 2D u8 height-coded mask over the grid's (x, y) columns, row-major (`j` fastest).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask2D { shape: [usize; 2], data: Vec<u8> }

impl Mask2D {
    pub fn zeros(shape: [usize; 2]) -> Self { Self { shape, data: vec![0; shape[0] * shape[1]] } }
    pub fn shape(&self) -> [usize; 2] { self.shape }
    #[inline] pub fn get(&self, i: usize, j: usize) -> u8 { self.data[i * self.shape[1] + j] }
    /// `mask[i,j] = max(mask[i,j], v)`.
    #[inline] pub fn raise(&mut self, i: usize, j: usize, v: u8) {
        let c = &mut self.data[i * self.shape[1] + j];
        if v > *c { *c = v; }
    }
    #[inline] pub fn raise_flat(&mut self, f: usize, v: u8) {
        let c = &mut self.data[f];
        if v > *c { *c = v; }
    }
    pub fn as_slice(&self) -> &[u8] { &self.data }
    pub fn max(&self) -> u8 { self.data.iter().copied().max().unwrap_or(0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cam_to_cam() -> CalibMap {
        let mut m = CalibMap::new();
        for id in CameraId::ALL {
            let s = id.suffix();
            m.insert(format!("S_{s}"), vec![1392.0, 512.0]);
            m.insert(format!("K_{s}"), vec![984.2, 0.0, 690.0, 0.0, 980.8, 233.2, 0.0, 0.0, 1.0]);
            m.insert(format!("D_{s}"), vec![-0.37, 0.20, 0.0, 0.0, -0.07]);
            m.insert(format!("R_{s}"), vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
            m.insert(format!("T_{s}"), vec![0.0, 0.0, 0.0]);
            m.insert(format!("P_rect_{s}"), vec![721.5, 0.0, 609.6, 44.8, 0.0, 721.5, 172.8, 0.2, 0.0, 0.0, 1.0, 0.003]);
        }
        m
    }

    fn rt() -> CalibMap {
        let mut m = CalibMap::new();
        m.insert("R".into(), vec![0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 1.0, 0.0, 0.0]);
        m.insert("T".into(), vec![-0.004, -0.076, -0.27]);
        m
    }

    #[test]
    fn grid_from_half_extents_matches_documented_shape() {
        let g = GridSpec::from_half_extents([200.0, 200.0, 5.0], 4.0).unwrap();
        assert_eq!(g.occ(), [1600, 1600, 40]);
        assert_eq!(g.half(), [200.0, 200.0, 5.0]);
    }

    #[test]
    fn grid_from_size_floors_half_like_the_size_tuple() {
        let g = GridSpec::from_size([150.0, 74.0, 17.0], 1.0).unwrap();
        assert_eq!(g.half(), [75.0, 37.0, 8.0]);
        assert_eq!(g.occ(), [150, 74, 17]);
        let g = GridSpec::from_size([200.0, 200.0, 10.0], 4.0).unwrap();
        assert_eq!(g.occ(), [800, 800, 40]);
    }

    #[test]
    fn degenerate_grid_is_a_config_error() {
        for r in [
            GridSpec::from_half_extents([0.0, 10.0, 10.0], 1.0),
            GridSpec::from_half_extents([10.0, 10.0, 10.0], 0.0),
            GridSpec::from_size([1.0, 10.0, 10.0], 1.0), // half floors to 0
            GridSpec::from_half_extents([10.0, 10.0, 0.1], 1.0), // occ_z floors to 0
            GridSpec::from_size([f64::NAN, 1.0, 1.0], 1.0),
        ] {
            let e = r.unwrap_err();
            assert!(matches!(e.downcast_ref::<Error>(), Some(Error::Config(_))), "{e}");
        }
    }

    #[test]
    fn calibration_reshapes_fields() {
        let set = CalibrationSet::from_maps(cam_to_cam(), rt(), rt()).unwrap();
        let c = set.camera(CameraId::Color2);
        assert_eq!(c.size, (1392, 512));
        assert_relative_eq!(c.k[(0, 2)], 690.0);
        assert_relative_eq!(c.k[(1, 2)], 233.2);
        // last column of P_rect (44.8, 0.2, 0.003) is dropped
        assert_relative_eq!(c.p_rect[(0, 2)], 609.6);
        assert_relative_eq!(c.p_rect[(2, 2)], 1.0);
        assert_relative_eq!(set.velo_to_cam.r[(2, 0)], 1.0);
        assert_relative_eq!(set.velo_to_cam.t.z, -0.27);
    }

    #[test]
    fn calibration_missing_key_is_reported() {
        let mut c2c = cam_to_cam();
        c2c.remove("P_rect_03");
        let e = CalibrationSet::from_maps(c2c, rt(), rt()).unwrap_err();
        match e.downcast_ref::<Error>() {
            Some(Error::Calibration { key, .. }) => assert_eq!(key, "P_rect_03"),
            other => panic!("unexpected {other:?}"),
        }
        let mut bad = rt();
        bad.insert("T".into(), vec![1.0, 2.0]);
        assert!(CalibrationSet::from_maps(cam_to_cam(), rt(), bad).is_err());
    }

    #[test]
    fn rigid_apply() {
        let set = CalibrationSet::from_maps(cam_to_cam(), rt(), rt()).unwrap();
        // lidar forward (x) becomes camera depth (z)
        let p = set.velo_to_cam.apply([2.0, 0.0, 0.0]);
        assert_relative_eq!(p.z, 2.0 - 0.27, epsilon = 1e-12);
        assert_relative_eq!(p.x, -0.004, epsilon = 1e-12);
    }

    #[test]
    fn select_keeps_order_and_scalar() {
        let mut c = Cloud::new(Frame::Lidar);
        for i in 0..5 { c.push(i as f32, 0.0, 0.0); }
        c.scalar = Some(vec![10.0, 11.0, 12.0, 13.0, 14.0]);
        let s = c.select(&[true, false, true, false, true]);
        assert_eq!(s.x, vec![0.0, 2.0, 4.0]);
        assert_eq!(s.scalar.unwrap(), vec![10.0, 12.0, 14.0]);
        assert_eq!(s.frame, Frame::Lidar);
    }

    #[test]
    fn volume_is_c_ordered() {
        let mut v = Volume::zeros([2, 3, 4]);
        v.set(1, 2, 3, 1.0);
        assert_eq!(v.flat(1, 2, 3), 23);
        assert_eq!(v.unflat(23), [1, 2, 3]);
        assert_eq!(v.occupied(0.5), vec![23]);
    }

    #[test]
    fn mask_raise_is_max() {
        let mut m = Mask2D::zeros([2, 2]);
        m.raise(1, 0, 80);
        m.raise(1, 0, 20);
        assert_eq!(m.get(1, 0), 80);
        assert_eq!(m.max(), 80);
    }

    #[test]
    fn valid_region_is_half_open() {
        let r = ValidRegion { x: 10, y: 5, w: 100, h: 50 };
        assert!(r.contains(10.0, 5.0));
        assert!(r.contains(109.9, 54.9));
        assert!(!r.contains(110.0, 20.0));
        assert!(!r.contains(9.99, 20.0));
        assert!(!r.contains(f32::NAN, 20.0));
    }

    #[test]
    fn per_camera_indexing() {
        let p = PerCamera::from_fn(|id| id.suffix().to_string());
        assert_eq!(p[CameraId::Color3], "03");
        let q = p.map(|id, s| format!("image_{s}_{}", id.index()));
        assert_eq!(q[CameraId::Gray1], "image_01_1");
    }
}
