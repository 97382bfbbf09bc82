//! kittivox-dataset — KITTI raw sequence discovery and per-index sample assembly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use image::RgbImage;
use log::{debug, info};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use kittivox_core::{CalibrationSet, CameraId, Cloud, Error, GridSpec, Mask2D, OccupancyGrid, PerCamera, ValidRegion, Volume};
use kittivox_filters::{fov_filter, FovWindow};
use kittivox_io::{crop, load_calibration, read_kitti_bin, read_rgb, rectifier, Rectification, Rectifier, RectifierKind};
use kittivox_project::FrameProjector;
use kittivox_smooth::{SmoothConfig, Smoother};
use kittivox_voxel::{VoxelStats, Voxelizer};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub base_path: PathBuf,
    pub date: String,
    pub drive: String,
    /// Full extents; see [`GridSpec::from_size`].
    pub grid_size: [f64; 3],
    pub scale: f64,
    pub fov: FovWindow,
    pub smooth: SmoothConfig,
    pub reference_camera: CameraId,
    pub rectifier: RectifierKind,
    /// Points per voxelization chunk.
    pub voxel_chunk: usize,
    pub max_workers: Option<usize>,
    pub memory_budget_bytes: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("kitti_raw_mini"),
            date: "2011_09_26".into(),
            drive: "2011_09_26_drive_0001_sync".into(),
            grid_size: [200.0, 200.0, 10.0],
            scale: 4.0,
            fov: FovWindow::default(),
            smooth: SmoothConfig::default(),
            reference_camera: CameraId::Color2,
            rectifier: RectifierKind::PlumbBob,
            voxel_chunk: 1 << 16,
            max_workers: None,
            memory_budget_bytes: None,
        }
    }
}

impl DatasetConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("open {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    pub fn to_yaml(&self) -> Result<String> { Ok(serde_yaml::to_string(self)?) }

    pub fn date_dir(&self) -> PathBuf { self.base_path.join(&self.date) }
    pub fn drive_dir(&self) -> PathBuf { self.date_dir().join(&self.drive) }
}

/// One camera's images and the matrices a consumer needs to relate them to the points.
#[derive(Clone)]
pub struct CameraFrame {
    /// Undistorted and cropped to `roi`.
    pub rectified: RgbImage,
    pub raw: RgbImage,
    pub roi: ValidRegion,
    pub k: Matrix3<f64>,
    /// Intrinsics of the undistorted (pre-crop) image.
    pub new_k: Matrix3<f64>,
    pub r: Matrix3<f64>,
    pub t: Vector3<f64>,
}

#[derive(Clone)]
pub struct Sample {
    pub index: usize,
    pub frame_id: String,
    pub cameras: PerCamera<CameraFrame>,
    pub calib: Arc<CalibrationSet>,
    /// The sweep as read, LIDAR frame, reflectance in `scalar`.
    pub points: Cloud,
    /// FOV-kept points, LIDAR frame, reflectance carried over.
    pub filtered: Cloud,
    /// Range colour, one per `filtered` point.
    pub color: Vec<f32>,
    pub grid: OccupancyGrid,
    pub mask: Mask2D,
    /// Camera-frame points that populated the grid.
    pub visible: Cloud,
    pub smoothed: Option<Volume>,
    pub stats: VoxelStats,
}

pub type Transform = Box<dyn Fn(&mut Sample) + Send + Sync>;

/// `date → [drive]` for every `YYYY_MM_DD/YYYY_MM_DD_drive_NNNN_sync` folder under `base`.
pub fn discover_tree(base: impl AsRef<Path>) -> Result<BTreeMap<String, Vec<String>>> {
    let base = base.as_ref();
    let mut tree = BTreeMap::new();
    for date in subdirs(base)? {
        if date.split('_').count() != 3 { continue; }
        let mut drives: Vec<String> = subdirs(&base.join(&date))?
            .into_iter()
            .filter(|d| d.split('_').count() == 6)
            .collect();
        drives.sort();
        tree.insert(date, drives);
    }
    info!("discover {}: {} dates, {} drives", base.display(), tree.len(), tree.values().map(Vec::len).sum::<usize>());
    Ok(tree)
}

fn subdirs(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for e in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let e = e?;
        if e.file_type()?.is_dir() {
            if let Some(name) = e.file_name().to_str() { out.push(name.to_string()); }
        }
    }
    Ok(out)
}

/// One dataset per discovered drive, each with `template`'s settings.
pub fn open_all(base: impl AsRef<Path>, template: &DatasetConfig) -> Result<Vec<Dataset>> {
    let base = base.as_ref();
    let mut out = Vec::new();
    for (date, drives) in discover_tree(base)? {
        for drive in drives {
            let cfg = DatasetConfig { base_path: base.to_path_buf(), date: date.clone(), drive, ..template.clone() };
            out.push(Dataset::new(cfg)?);
        }
    }
    Ok(out)
}

/// Budget assumed when neither the config nor `/proc/meminfo` gives one.
pub const FALLBACK_MEMORY_BUDGET: u64 = 2 << 30;

/// Half of `MemAvailable`, or [`FALLBACK_MEMORY_BUDGET`] where that cannot be read.
pub fn detected_memory_budget() -> u64 {
    available_memory_bytes().map_or(FALLBACK_MEMORY_BUDGET, |b| b / 2)
}

#[cfg(target_os = "linux")]
fn available_memory_bytes() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

#[cfg(not(target_os = "linux"))]
fn available_memory_bytes() -> Option<u64> { None }

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Workers for [`Dataset::par_map`]: cores, capped by `max_workers` and by how many samples
/// fit in the memory budget. Without a configured budget, [`detected_memory_budget`] applies.
/// Never zero.
pub fn worker_count(max_workers: Option<usize>, memory_budget_bytes: Option<u64>, per_sample_bytes: usize) -> usize {
    let mut n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    if let Some(m) = max_workers { n = n.min(m); }
    let budget = memory_budget_bytes.unwrap_or_else(detected_memory_budget);
    let fit = budget / per_sample_bytes.max(1) as u64;
    n = n.min(usize::try_from(fit).unwrap_or(usize::MAX));
    n.max(1)
}

/// One drive: calibration and rectification prepared once, samples assembled on demand.
pub struct Dataset {
    cfg: DatasetConfig,
    calib: Arc<CalibrationSet>,
    rects: PerCamera<Rectification>,
    rectifier: Box<dyn Rectifier>,
    voxelizer: Voxelizer,
    fov: FovWindow,
    smoother: Option<Box<dyn Smoother>>,
    frames: Vec<String>,
    transforms: Vec<Transform>,
    pool: rayon::ThreadPool,
}

impl Dataset {
    pub fn new(cfg: DatasetConfig) -> Result<Self> {
        let spec = GridSpec::from_size(cfg.grid_size, cfg.scale)?;
        let fov = FovWindow::new(cfg.fov.v_fov, cfg.fov.h_fov)?;
        if cfg.voxel_chunk == 0 {
            return Err(Error::Config("voxel_chunk must be positive".into()).into());
        }
        let calib = Arc::new(load_calibration(cfg.date_dir())?);
        let rectifier = rectifier(cfg.rectifier);
        let rects = PerCamera::try_from_fn(|id| rectifier.prepare(calib.camera(id)))?;
        let smoother = kittivox_smooth::build(&cfg.smooth)?;
        let voxelizer = Voxelizer::new(spec, rects[cfg.reference_camera].roi);

        let list = cfg.drive_dir().join("image_00").join("data");
        let mut frames: Vec<String> = fs::read_dir(&list)
            .with_context(|| format!("list {}", list.display()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let p = e.path();
                if p.extension().and_then(|x| x.to_str()) != Some("png") { return None; }
                p.file_stem()?.to_str().map(str::to_string)
            })
            .collect();
        frames.sort();

        let workers = worker_count(cfg.max_workers, cfg.memory_budget_bytes, per_sample_bytes(&spec, &calib, cfg.smooth.sigma.is_some()));
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
        info!("dataset {}: {} frames, grid {:?}, {} workers", cfg.drive, frames.len(), spec.occ(), workers);

        Ok(Self { cfg, calib, rects, rectifier, voxelizer, fov, smoother, frames, transforms: Vec::new(), pool })
    }

    /// Run `f` on every assembled sample, in registration order.
    pub fn with_transform(mut self, f: impl Fn(&mut Sample) + Send + Sync + 'static) -> Self {
        self.transforms.push(Box::new(f));
        self
    }

    pub fn len(&self) -> usize { self.frames.len() }
    pub fn is_empty(&self) -> bool { self.frames.is_empty() }
    pub fn config(&self) -> &DatasetConfig { &self.cfg }
    pub fn calibration(&self) -> &Arc<CalibrationSet> { &self.calib }
    pub fn rectification(&self, cam: CameraId) -> &Rectification { &self.rects[cam] }
    pub fn voxelizer(&self) -> &Voxelizer { &self.voxelizer }
    pub fn fov(&self) -> &FovWindow { &self.fov }
    pub fn frame_ids(&self) -> &[String] { &self.frames }
    pub fn workers(&self) -> usize { self.pool.current_num_threads() }

    pub fn image_path(&self, cam: CameraId, frame_id: &str) -> PathBuf {
        self.cfg.drive_dir().join(format!("image_{}", cam.suffix())).join("data").join(format!("{frame_id}.png"))
    }

    pub fn points_path(&self, frame_id: &str) -> PathBuf {
        self.cfg.drive_dir().join("velodyne_points").join("data").join(format!("{frame_id}.bin"))
    }

    pub fn get(&self, index: usize) -> Result<Sample> {
        let frame_id = self.frames.get(index)
            .ok_or_else(|| anyhow::anyhow!("index {} out of range (len {})", index, self.len()))?
            .clone();
        let images = PerCamera::from_fn(|cam| self.image_path(cam, &frame_id));
        let bin = self.points_path(&frame_id);
        for (_, p) in images.iter() {
            if !p.is_file() { return Err(Error::MissingAsset { index, path: p.clone() }.into()); }
        }
        if !bin.is_file() { return Err(Error::MissingAsset { index, path: bin }.into()); }

        let t0 = Instant::now();
        let (cameras, cloud) = rayon::join(
            || self.load_cameras(&images),
            || -> Result<_> {
                let points = read_kitti_bin(&bin)?;
                let kept = fov_filter(&points, &self.fov)?;
                let projected = FrameProjector::new(&self.calib, self.cfg.reference_camera).project(&kept.cloud)?;
                let vox = self.voxelizer.voxelize_par(&projected, self.cfg.voxel_chunk)?;
                Ok((points, kept, vox))
            },
        );
        let cameras = cameras?;
        let (points, kept, vox) = cloud?;

        let smoothed = match &self.smoother {
            Some(s) => Some(s.smooth(&vox.grid)?),
            None => None,
        };
        debug!("sample {} ({}): {:?} in {} ms", index, frame_id, vox.stats, t0.elapsed().as_millis());

        let mut sample = Sample {
            index, frame_id, cameras, calib: Arc::clone(&self.calib), points,
            filtered: kept.cloud, color: kept.color,
            grid: vox.grid, mask: vox.mask, visible: vox.visible, smoothed, stats: vox.stats,
        };
        for t in &self.transforms { t(&mut sample); }
        Ok(sample)
    }

    fn load_cameras(&self, paths: &PerCamera<PathBuf>) -> Result<PerCamera<CameraFrame>> {
        let frames: Vec<CameraFrame> = CameraId::ALL
            .par_iter()
            .map(|&cam| -> Result<CameraFrame> {
                let calib = self.calib.camera(cam);
                let rect = &self.rects[cam];
                let raw = read_rgb(&paths[cam])?;
                let undistorted = self.rectifier.undistort(&raw, calib, rect)
                    .with_context(|| format!("rectify {}", paths[cam].display()))?;
                Ok(CameraFrame {
                    rectified: crop(&undistorted, &rect.roi),
                    raw, roi: rect.roi, k: calib.k, new_k: rect.new_k, r: calib.r, t: calib.t,
                })
            })
            .collect::<Result<_>>()?;
        let frames: [CameraFrame; 4] = frames.try_into().map_err(|_| anyhow::anyhow!("expected four camera frames"))?;
        Ok(PerCamera(frames))
    }

    /// Restartable: each call walks from index 0.
    pub fn iter(&self) -> impl Iterator<Item = Result<Sample>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Assemble `indices` on the dataset's bounded pool. Results come back in `indices` order.
    pub fn par_map<T: Send>(&self, indices: &[usize], f: impl Fn(Result<Sample>) -> T + Send + Sync) -> Vec<T> {
        let t0 = Instant::now();
        let out = self.pool.install(|| indices.par_iter().map(|&i| f(self.get(i))).collect());
        info!("par_map: {} samples on {} workers in {} ms", indices.len(), self.workers(), t0.elapsed().as_millis());
        out
    }
}

/// Rough peak footprint of one in-flight sample: the dense grid and mask (twice with smoothing)
/// plus raw and rectified RGB images for all cameras.
fn per_sample_bytes(spec: &GridSpec, calib: &CalibrationSet, smoothing: bool) -> usize {
    let grids = spec.dense_bytes() * if smoothing { 2 } else { 1 };
    let images: usize = calib.cameras.iter().map(|(_, c)| c.size.0 as usize * c.size.1 as usize * 3 * 2).sum();
    grids + images
}
