use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use kittivox_core::CameraId;
use kittivox_dataset::{discover_tree, Dataset, DatasetConfig, Sample};
use kittivox_project::points_to_image_space;
use kittivox_voxel::GridSampler;

// ---------- helpers ----------

fn t0() -> std::time::Instant { std::time::Instant::now() }
fn lap(t: std::time::Instant, label: &str) {
    let ms = t.elapsed().as_secs_f64() * 1000.0;
    println!("[{label}] {ms:.1} ms");
}

fn camera(s: &str) -> Result<CameraId, String> {
    match s {
        "00" | "0" => Ok(CameraId::Gray0),
        "01" | "1" => Ok(CameraId::Gray1),
        "02" | "2" => Ok(CameraId::Color2),
        "03" | "3" => Ok(CameraId::Color3),
        _ => Err(format!("unknown camera '{s}', expected 00..03")),
    }
}

// ---------- CLI ----------

#[derive(Parser)]
#[command(name = "kittivox", version, about = "kittivox — KITTI raw LIDAR/camera fusion into occupancy grids")]
struct Args { #[command(subcommand)] cmd: Cmd }

/// Dataset selection. A `--config` YAML is loaded first; flags override it.
#[derive(clap::Args)]
struct DatasetArgs {
    #[arg(long)] config: Option<PathBuf>,
    #[arg(long)] base: Option<PathBuf>,
    #[arg(long)] date: Option<String>,
    #[arg(long)] drive: Option<String>,
    /// Full grid extents X Y Z
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])] grid_size: Option<Vec<f64>>,
    #[arg(long)] scale: Option<f64>,
    /// Vertical FOV LO HI (degrees)
    #[arg(long, num_args = 2, value_names = ["LO", "HI"], allow_negative_numbers = true)] v_fov: Option<Vec<f64>>,
    /// Horizontal FOV LO HI (degrees)
    #[arg(long, num_args = 2, value_names = ["LO", "HI"], allow_negative_numbers = true)] h_fov: Option<Vec<f64>>,
    /// Enable Gaussian smoothing of the grid with this sigma
    #[arg(long)] sigma: Option<f32>,
    #[arg(long)] workers: Option<usize>,
}

impl DatasetArgs {
    fn to_config(&self) -> Result<DatasetConfig> {
        let mut cfg = match &self.config {
            Some(p) => DatasetConfig::from_yaml_file(p)?,
            None => DatasetConfig::default(),
        };
        if let Some(b) = &self.base { cfg.base_path = b.clone(); }
        if let Some(d) = &self.date { cfg.date = d.clone(); }
        if let Some(d) = &self.drive { cfg.drive = d.clone(); }
        if let Some(g) = &self.grid_size { cfg.grid_size = [g[0], g[1], g[2]]; }
        if let Some(s) = self.scale { cfg.scale = s; }
        if let Some(v) = &self.v_fov { cfg.fov.v_fov = (v[0], v[1]); }
        if let Some(h) = &self.h_fov { cfg.fov.h_fov = (h[0], h[1]); }
        if self.sigma.is_some() { cfg.smooth.sigma = self.sigma; }
        if self.workers.is_some() { cfg.max_workers = self.workers; }
        Ok(cfg)
    }

    fn open(&self) -> Result<Dataset> {
        let t = t0();
        let ds = Dataset::new(self.to_config()?)?;
        lap(t, "open");
        Ok(ds)
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// List date/drive folders under a KITTI raw root
    Tree { base: PathBuf },

    /// Print the default dataset configuration as YAML
    InitConfig {
        #[arg(short, long)] output: Option<PathBuf>,
    },

    /// Print basic info about a point file (KITTI .bin / PLY)
    Info { input: PathBuf },

    /// Assemble one sample and export its pieces
    Sample {
        #[command(flatten)] ds: DatasetArgs,
        #[arg(short, long, default_value_t = 0)] index: usize,
        /// Height-coded mask as 8-bit PNG
        #[arg(long)] mask: Option<PathBuf>,
        /// Camera-visible points as ASCII PLY
        #[arg(long)] visible: Option<PathBuf>,
        /// Rectified images, one PNG per camera
        #[arg(long)] images: Option<PathBuf>,
        /// Voxelization report as JSON
        #[arg(long)] stats: Option<PathBuf>,
    },

    /// Rasterise a sample's grid (or its filtered points) into the reference camera
    ImageSpace {
        #[command(flatten)] ds: DatasetArgs,
        #[arg(short, long, default_value_t = 0)] index: usize,
        output: PathBuf,
        #[arg(long, value_parser = camera)] camera: Option<CameraId>,
        /// Rasterise the FOV-filtered points instead of the grid
        #[arg(long)] points: bool,
    },

    /// Sample a grid back into points and write them as PLY
    GridPoints {
        #[command(flatten)] ds: DatasetArgs,
        #[arg(short, long, default_value_t = 0)] index: usize,
        output: PathBuf,
        #[arg(long, default_value_t = 0.5)] threshold: f32,
        #[arg(long, default_value_t = 1)] stride: usize,
        /// Drop the origin placeholders emitted for empty cells
        #[arg(long)] occupied_only: bool,
    },

    /// Assemble every sample on the worker pool and write one mask PNG per frame
    Batch {
        #[command(flatten)] ds: DatasetArgs,
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match args.cmd {
        Cmd::Tree { base } => cmd_tree(&base),
        Cmd::InitConfig { output } => cmd_init_config(output.as_deref()),
        Cmd::Info { input } => cmd_info(&input),
        Cmd::Sample { ds, index, mask, visible, images, stats } =>
            cmd_sample(&ds, index, mask.as_deref(), visible.as_deref(), images.as_deref(), stats.as_deref()),
        Cmd::ImageSpace { ds, index, output, camera, points } => cmd_image_space(&ds, index, &output, camera, points),
        Cmd::GridPoints { ds, index, output, threshold, stride, occupied_only } =>
            cmd_grid_points(&ds, index, &output, threshold, stride, occupied_only),
        Cmd::Batch { ds, out_dir } => cmd_batch(&ds, &out_dir),
    }
}

// ---------- commands ----------

fn cmd_tree(base: &Path) -> Result<()> {
    for (date, drives) in discover_tree(base)? {
        println!("{date}");
        for d in drives { println!("  {d}"); }
    }
    Ok(())
}

fn cmd_init_config(output: Option<&Path>) -> Result<()> {
    let yaml = DatasetConfig::default().to_yaml()?;
    match output {
        Some(p) => {
            fs::write(p, yaml).with_context(|| format!("write {}", p.display()))?;
            println!("wrote {}", p.display());
        }
        None => print!("{yaml}"),
    }
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let cloud = kittivox_io::read_auto(path)?;
    println!("points: {} ({:?} frame)", cloud.len(), cloud.frame);
    if cloud.is_empty() { return Ok(()); }
    let range = |v: &[f32]| v.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let (xs, ys, zs) = (range(&cloud.x), range(&cloud.y), range(&cloud.z));
    println!("x: [{:.3}, {:.3}]  y: [{:.3}, {:.3}]  z: [{:.3}, {:.3}]", xs.0, xs.1, ys.0, ys.1, zs.0, zs.1);
    if let Some(s) = &cloud.scalar {
        let r = range(s);
        println!("scalar: [{:.3}, {:.3}]", r.0, r.1);
    }
    Ok(())
}

#[derive(Serialize)]
struct Report<'a> {
    index: usize,
    frame_id: &'a str,
    points: usize,
    fov_kept: usize,
    accepted: usize,
    unprojectable: usize,
    outside_roi: usize,
    outside_grid: usize,
    occupied_cells: usize,
    grid_shape: [usize; 3],
    mask_max: u8,
}

impl<'a> Report<'a> {
    fn new(s: &'a Sample) -> Self {
        Self {
            index: s.index,
            frame_id: &s.frame_id,
            points: s.points.len(),
            fov_kept: s.filtered.len(),
            accepted: s.stats.accepted,
            unprojectable: s.stats.unprojectable,
            outside_roi: s.stats.outside_roi,
            outside_grid: s.stats.outside_grid,
            occupied_cells: s.grid.count_above(0.5),
            grid_shape: s.grid.shape(),
            mask_max: s.mask.max(),
        }
    }
}

fn cmd_sample(ds: &DatasetArgs, index: usize, mask: Option<&Path>, visible: Option<&Path>, images: Option<&Path>, stats: Option<&Path>) -> Result<()> {
    let ds = ds.open()?;
    let t = t0();
    let s = ds.get(index)?;
    lap(t, "assemble");

    let report = Report::new(&s);
    println!("{} #{}: {} pts → {} in FOV → {} voxelized, {} cells occupied",
             report.frame_id, index, report.points, report.fov_kept, report.accepted, report.occupied_cells);

    let t = t0();
    if let Some(p) = mask { kittivox_io::write_mask_png(p, &s.mask)?; }
    if let Some(p) = visible { kittivox_io::write_ply_ascii(p, &s.visible)?; }
    if let Some(dir) = images {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        for (cam, f) in s.cameras.iter() {
            let p = dir.join(format!("image_{}_{}.png", cam.suffix(), s.frame_id));
            f.rectified.save(&p).with_context(|| format!("write {}", p.display()))?;
        }
    }
    if let Some(p) = stats {
        serde_json::to_writer_pretty(fs::File::create(p).with_context(|| format!("create {}", p.display()))?, &report)?;
    }
    lap(t, "write");
    Ok(())
}

fn cmd_image_space(ds: &DatasetArgs, index: usize, output: &Path, cam: Option<CameraId>, points: bool) -> Result<()> {
    let ds = ds.open()?;
    let cam = cam.unwrap_or(ds.config().reference_camera);
    let s = ds.get(index)?;
    let roi = ds.rectification(cam).roi;

    let t = t0();
    let img = if points {
        points_to_image_space(&s.filtered, &roi, &s.calib, cam, ds.fov())?
    } else {
        GridSampler::new(ds.voxelizer().spec).image_space(&s.grid, &roi, &s.calib, cam, ds.fov())?
    };
    lap(t, "rasterise");
    kittivox_io::write_raster_png(output, &img)?;
    println!("image-space: {}x{} → {}", img.width(), img.height(), output.display());
    Ok(())
}

fn cmd_grid_points(ds: &DatasetArgs, index: usize, output: &Path, threshold: f32, stride: usize, occupied_only: bool) -> Result<()> {
    let ds = ds.open()?;
    let s = ds.get(index)?;
    let t = t0();
    let mut cloud = GridSampler::new(ds.voxelizer().spec).points(&s.grid, threshold, stride)?.into_cloud();
    if occupied_only {
        let keep: Vec<bool> = cloud.points().map(|p| p != [0.0; 3]).collect();
        cloud = cloud.select(&keep);
    }
    lap(t, "grid-points");
    kittivox_io::write_ply_ascii(output, &cloud)?;
    println!("grid-points: {} → {}", cloud.len(), output.display());
    Ok(())
}

fn cmd_batch(ds: &DatasetArgs, out_dir: &Path) -> Result<()> {
    let ds = ds.open()?;
    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let indices: Vec<usize> = (0..ds.len()).collect();

    let t = t0();
    let results = ds.par_map(&indices, |r| -> Result<(String, usize)> {
        let s = r?;
        kittivox_io::write_mask_png(out_dir.join(format!("{}.png", s.frame_id)), &s.mask)?;
        Ok((s.frame_id, s.stats.accepted))
    });
    lap(t, "batch");

    let mut failed = 0;
    let mut accepted = 0;
    for (i, r) in results.into_iter().enumerate() {
        match r {
            Ok((_, n)) => accepted += n,
            Err(e) => { failed += 1; eprintln!("sample {i}: {e:#}"); }
        }
    }
    info!("batch: {} samples, {} failed, {} points voxelized", indices.len(), failed, accepted);
    anyhow::ensure!(failed == 0, "{} of {} samples failed", failed, indices.len());
    Ok(())
}
