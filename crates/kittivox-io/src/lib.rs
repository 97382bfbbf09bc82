//! kittivox-io — on-disk formats: KITTI velodyne `.bin`, ASCII PLY, calibration text, images,
//! and the lens-undistortion collaborator.

use anyhow::{bail, Context, Result};
use image::{GrayImage, Rgb, Rgb32FImage, RgbImage};
use log::{debug, warn};
use nalgebra::Matrix3;
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Ply, Property};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use kittivox_core::{CalibMap, CalibrationSet, CameraCalib, Cloud, Frame, Mask2D, ValidRegion, CAM_TO_CAM, IMU_TO_VELO, VELO_TO_CAM};

// ---------- point clouds ----------

/// KITTI velodyne sweep: little-endian `f32 × 4` per point (x, y, z, reflectance).
/// Reflectance lands in `scalar`.
pub fn read_kitti_bin(path: impl AsRef<Path>) -> Result<Cloud> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("open {}", path.display()))?;
    if bytes.len() % 16 != 0 {
        bail!("{}: {} bytes is not a whole number of 16-byte points", path.display(), bytes.len());
    }
    let n = bytes.len() / 16;
    let mut c = Cloud::with_capacity(Frame::Lidar, n);
    let mut intensity = Vec::with_capacity(n);
    let f = |b: &[u8]| f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    for rec in bytes.chunks_exact(16) {
        c.push(f(&rec[0..4]), f(&rec[4..8]), f(&rec[8..12]));
        intensity.push(f(&rec[12..16]));
    }
    c.scalar = Some(intensity);
    Ok(c)
}

pub fn write_kitti_bin(path: impl AsRef<Path>, cloud: &Cloud) -> Result<()> {
    let path = path.as_ref();
    let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {}", path.display()))?);
    let scalar = cloud.scalar.as_ref().filter(|s| s.len() == cloud.len());
    for i in 0..cloud.len() {
        let s = scalar.map_or(0.0, |s| s[i]);
        for v in [cloud.x[i], cloud.y[i], cloud.z[i], s] { w.write_all(&v.to_le_bytes())?; }
    }
    w.flush()?;
    Ok(())
}

fn frame_name(f: Frame) -> &'static str {
    match f { Frame::Lidar => "lidar", Frame::Camera => "camera", Frame::Grid => "grid" }
}

fn parse_frame(s: &str) -> Option<Frame> {
    match s { "lidar" => Some(Frame::Lidar), "camera" => Some(Frame::Camera), "grid" => Some(Frame::Grid), _ => None }
}

/// Reads `vertex` x/y/z (+ optional `scalar`). The frame comes from a `comment frame <name>`
/// header line, defaulting to LIDAR.
pub fn read_ply_ascii(path: impl AsRef<Path>) -> Result<Cloud> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(f);
    let parser = Parser::<DefaultElement>::new();
    let ply: Ply<DefaultElement> = parser.read_ply(&mut reader)
        .with_context(|| format!("parse {}", path.display()))?;

    let frame = ply.header.comments.iter()
        .find_map(|c| c.trim().trim_start_matches("comment").trim().strip_prefix("frame").and_then(|n| parse_frame(n.trim())))
        .unwrap_or(Frame::Lidar);
    let vertex = ply.payload.get("vertex")
        .ok_or_else(|| anyhow::anyhow!("{}: PLY missing 'vertex' element", path.display()))?;

    let mut c = Cloud::with_capacity(frame, vertex.len());
    let mut scalar = Vec::new();
    for el in vertex {
        c.push(get_f32(el, "x")?, get_f32(el, "y")?, get_f32(el, "z")?);
        if el.contains_key("scalar") { scalar.push(get_f32(el, "scalar")?); }
    }
    if !scalar.is_empty() {
        anyhow::ensure!(scalar.len() == c.len(), "{}: 'scalar' present on only some vertices", path.display());
        c.scalar = Some(scalar);
    }
    Ok(c)
}

fn get_f32(el: &DefaultElement, key: &str) -> Result<f32> {
    match el.get(key) {
        Some(Property::Float(v)) => Ok(*v),
        Some(Property::Double(v)) => Ok(*v as f32),
        Some(Property::UChar(v)) => Ok(*v as f32),
        Some(Property::Int(v)) => Ok(*v as f32),
        Some(_) => bail!("property '{}' not float-like", key),
        None => bail!("missing property '{}'", key),
    }
}

pub fn write_ply_ascii(path: impl AsRef<Path>, cloud: &Cloud) -> Result<()> {
    let path = path.as_ref();
    let n = cloud.len();
    let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {}", path.display()))?);
    let scalar = cloud.scalar.as_ref().filter(|s| s.len() == n);

    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "comment frame {}", frame_name(cloud.frame))?;
    writeln!(w, "element vertex {}", n)?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    if scalar.is_some() { writeln!(w, "property float scalar")?; }
    writeln!(w, "end_header")?;

    for i in 0..n {
        write!(w, "{} {} {}", cloud.x[i], cloud.y[i], cloud.z[i])?;
        if let Some(s) = scalar { write!(w, " {}", s[i])?; }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

/// Dispatch on extension: `.bin` → KITTI, `.ply` → PLY.
pub fn read_auto(path: impl AsRef<Path>) -> Result<Cloud> {
    let path = path.as_ref();
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("bin") => read_kitti_bin(path),
        Some("ply") => read_ply_ascii(path),
        _ => bail!("unsupported point file {} (expected .bin or .ply)", path.display()),
    }
}

// ---------- calibration ----------

/// Parse `key: v v v` lines. Entries whose value is not a list of numbers (e.g. `calib_time`)
/// are skipped with a warning.
pub fn read_calib_file(path: impl AsRef<Path>) -> Result<CalibMap> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = CalibMap::new();
    for line in BufReader::new(f).lines() {
        let line = line?;
        let Some((key, rest)) = line.split_once(':') else { continue };
        let key = key.trim();
        if key.is_empty() { continue; }
        match rest.split_whitespace().map(str::parse::<f64>).collect::<Result<Vec<_>, _>>() {
            Ok(v) if !v.is_empty() => { out.insert(key.to_string(), v); }
            _ => warn!("{}: skipping non-numeric key '{}'", path.display(), key),
        }
    }
    Ok(out)
}

/// Load the three calibration files from a date folder.
pub fn load_calibration(dir: impl AsRef<Path>) -> Result<CalibrationSet> {
    let dir = dir.as_ref();
    let c2c = read_calib_file(dir.join(CAM_TO_CAM))?;
    let i2v = read_calib_file(dir.join(IMU_TO_VELO))?;
    let v2c = read_calib_file(dir.join(VELO_TO_CAM))?;
    CalibrationSet::from_maps(c2c, i2v, v2c)
}

// ---------- images ----------

pub fn read_rgb(path: impl AsRef<Path>) -> Result<RgbImage> {
    let path = path.as_ref();
    let img = image::open(path).with_context(|| format!("decode {}", path.display()))?;
    Ok(img.to_rgb8())
}

/// `image[y:y+h, x:x+w]`, clipped to the image.
pub fn crop(img: &RgbImage, roi: &ValidRegion) -> RgbImage {
    image::imageops::crop_imm(img, roi.x, roi.y, roi.w, roi.h).to_image()
}

/// Mask rows are grid x, columns grid y.
pub fn mask_to_image(mask: &Mask2D) -> Result<GrayImage> {
    let [rows, cols] = mask.shape();
    GrayImage::from_raw(cols as u32, rows as u32, mask.as_slice().to_vec())
        .ok_or_else(|| anyhow::anyhow!("mask {}x{} does not fit an image buffer", rows, cols))
}

pub fn write_mask_png(path: impl AsRef<Path>, mask: &Mask2D) -> Result<()> {
    let path = path.as_ref();
    mask_to_image(mask)?.save(path).with_context(|| format!("write {}", path.display()))
}

/// Min-max normalise all channels to 0..255. A flat raster becomes black.
pub fn normalize_raster(img: &Rgb32FImage) -> RgbImage {
    let (lo, hi) = img.as_raw().iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = hi - lo;
    let mut out = RgbImage::new(img.width(), img.height());
    if !(span > 0.0) { return out; }
    for (o, p) in out.pixels_mut().zip(img.pixels()) {
        *o = Rgb(p.0.map(|v| ((v - lo) / span * 255.0).round() as u8));
    }
    out
}

pub fn write_raster_png(path: impl AsRef<Path>, img: &Rgb32FImage) -> Result<()> {
    let path = path.as_ref();
    normalize_raster(img).save(path).with_context(|| format!("write {}", path.display()))
}

// ---------- rectification ----------

/// Per-camera undistortion geometry: the intrinsics of the undistorted image and its
/// border-free rectangle.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rectification {
    pub new_k: Matrix3<f64>,
    pub roi: ValidRegion,
}

/// Lens-correction collaborator. `prepare` runs once per camera; `undistort` once per image.
pub trait Rectifier: Send + Sync {
    fn prepare(&self, cam: &CameraCalib) -> Result<Rectification>;
    fn undistort(&self, raw: &RgbImage, cam: &CameraCalib, rect: &Rectification) -> Result<RgbImage>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RectifierKind {
    Passthrough,
    #[default]
    PlumbBob,
}

pub fn rectifier(kind: RectifierKind) -> Box<dyn Rectifier> {
    match kind {
        RectifierKind::Passthrough => Box::new(PassthroughRectifier),
        RectifierKind::PlumbBob => Box::new(PlumbBobRectifier::default()),
    }
}

/// Identity: keeps K and the full frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct PassthroughRectifier;

impl Rectifier for PassthroughRectifier {
    fn prepare(&self, cam: &CameraCalib) -> Result<Rectification> {
        Ok(Rectification { new_k: cam.k, roi: ValidRegion::full(cam.size.0, cam.size.1) })
    }
    fn undistort(&self, raw: &RgbImage, _: &CameraCalib, _: &Rectification) -> Result<RgbImage> {
        Ok(raw.clone())
    }
}

/// Radial-tangential (k1 k2 p1 p2 k3) model. The undistorted image keeps K.
#[derive(Copy, Clone, Debug)]
pub struct PlumbBobRectifier {
    pub iterations: usize,
}

impl Default for PlumbBobRectifier {
    fn default() -> Self { Self { iterations: 20 } }
}

/// Forward distortion of a normalised coordinate.
#[inline]
pub fn distort(d: &[f64; 5], x: f64, y: f64) -> (f64, f64) {
    let [k1, k2, p1, p2, k3] = *d;
    let r2 = x * x + y * y;
    let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
    (
        x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
        y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
    )
}

fn check_k(cam: &CameraCalib) -> Result<(f64, f64, f64, f64)> {
    let (fx, fy, cx, cy) = (cam.k[(0, 0)], cam.k[(1, 1)], cam.k[(0, 2)], cam.k[(1, 2)]);
    anyhow::ensure!(fx != 0.0 && fy != 0.0, "camera {:?}: degenerate intrinsics", cam.id);
    Ok((fx, fy, cx, cy))
}

impl PlumbBobRectifier {
    /// Invert [`distort`] by fixed-point iteration; returns the undistorted pixel.
    pub fn undistort_point(&self, cam: &CameraCalib, u: f64, v: f64) -> Result<(f64, f64)> {
        let (fx, fy, cx, cy) = check_k(cam)?;
        let [k1, k2, p1, p2, k3] = cam.d;
        let (x0, y0) = ((u - cx) / fx, (v - cy) / fy);
        let (mut x, mut y) = (x0, y0);
        for _ in 0..self.iterations {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (x0 - dx) / radial;
            y = (y0 - dy) / radial;
        }
        Ok((x * fx + cx, y * fy + cy))
    }
}

/// Bilinear sample; `None` beyond half a pixel outside the image.
fn sample(img: &RgbImage, u: f64, v: f64) -> Option<[u8; 3]> {
    let (w, h) = (img.width() as f64, img.height() as f64);
    if !(u >= -0.5 && v >= -0.5 && u <= w - 0.5 && v <= h - 0.5) { return None; }
    let (u, v) = (u.clamp(0.0, w - 1.0), v.clamp(0.0, h - 1.0));
    let (x0, y0) = (u.floor() as u32, v.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(img.width() - 1), (y0 + 1).min(img.height() - 1));
    let (fx, fy) = (u - x0 as f64, v - y0 as f64);
    let (a, b, c, d) = (img.get_pixel(x0, y0).0, img.get_pixel(x1, y0).0, img.get_pixel(x0, y1).0, img.get_pixel(x1, y1).0);
    let mut out = [0u8; 3];
    for ch in 0..3 {
        let top = a[ch] as f64 * (1.0 - fx) + b[ch] as f64 * fx;
        let bot = c[ch] as f64 * (1.0 - fx) + d[ch] as f64 * fx;
        out[ch] = (top * (1.0 - fy) + bot * fy).round() as u8;
    }
    Some(out)
}

impl Rectifier for PlumbBobRectifier {
    /// ROI is the largest axis-aligned rectangle inside the undistorted image of the raw border.
    fn prepare(&self, cam: &CameraCalib) -> Result<Rectification> {
        let (w, h) = cam.size;
        anyhow::ensure!(w > 0 && h > 0, "camera {:?}: empty sensor size", cam.id);
        let (wf, hf) = ((w - 1) as f64, (h - 1) as f64);
        let (mut left, mut right, mut top, mut bottom) = (0.0f64, wf, 0.0f64, hf);
        let steps = 64;
        for s in 0..=steps {
            let t = s as f64 / steps as f64;
            left = left.max(self.undistort_point(cam, 0.0, t * hf)?.0);
            right = right.min(self.undistort_point(cam, wf, t * hf)?.0);
            top = top.max(self.undistort_point(cam, t * wf, 0.0)?.1);
            bottom = bottom.min(self.undistort_point(cam, t * wf, hf)?.1);
        }
        // Sub-micropixel slack so an undistorted border that lands on a pixel keeps it.
        const EPS: f64 = 1e-6;
        let (x0, y0) = ((left - EPS).ceil().max(0.0) as u32, (top - EPS).ceil().max(0.0) as u32);
        let (x1, y1) = ((right + EPS).floor().min(wf) as u32, (bottom + EPS).floor().min(hf) as u32);
        if x1 < x0 || y1 < y0 {
            bail!("camera {:?}: distortion leaves no valid region", cam.id);
        }
        let roi = ValidRegion { x: x0, y: y0, w: x1 - x0 + 1, h: y1 - y0 + 1 };
        debug!("rectify {:?}: roi {:?}", cam.id, roi);
        Ok(Rectification { new_k: cam.k, roi })
    }

    /// Inverse map: each output pixel is pushed through the forward model into the raw image.
    /// Pixels that land outside the raw frame are black.
    fn undistort(&self, raw: &RgbImage, cam: &CameraCalib, rect: &Rectification) -> Result<RgbImage> {
        let (fx, fy, cx, cy) = check_k(cam)?;
        let (nfx, nfy, ncx, ncy) = (rect.new_k[(0, 0)], rect.new_k[(1, 1)], rect.new_k[(0, 2)], rect.new_k[(1, 2)]);
        anyhow::ensure!(nfx != 0.0 && nfy != 0.0, "camera {:?}: degenerate rectified intrinsics", cam.id);
        let (w, h) = raw.dimensions();
        let row_len = w as usize * 3;
        let mut buf = vec![0u8; row_len * h as usize];
        if row_len > 0 {
            buf.par_chunks_mut(row_len).enumerate().for_each(|(v, row)| {
                for u in 0..w as usize {
                    let (x, y) = distort(&cam.d, (u as f64 - ncx) / nfx, (v as f64 - ncy) / nfy);
                    if let Some(px) = sample(raw, x * fx + cx, y * fy + cy) {
                        row[u * 3..u * 3 + 3].copy_from_slice(&px);
                    }
                }
            });
        }
        RgbImage::from_raw(w, h, buf).ok_or_else(|| anyhow::anyhow!("undistort: buffer size mismatch"))
    }
}
