//! Meadowlark spatial light modulator driver.
//!
//! The SLM is commanded with a per-pixel wavefront in meters. Each value is
//! wrapped modulo the working wavelength and scaled to panel gray levels
//! using the wavelength calibration table, then the whole frame is pushed
//! through the vendor Blink SDK. Only 1920-wide panels are supported.
//!
//! The SDK surface is the [`BlinkSession`] trait; [`NativeBlink`] reports
//! `DeviceUnavailable` until native bindings are provided behind it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use dm_core::config::DeviceDescriptor;
use dm_core::{DmError, DmResult};

use crate::flats::{parse_flat_file, FlatLibrary};
use crate::{DeformableMirror, StrokeLimits};

/// The only panel width the driver supports.
pub const PANEL_WIDTH: u32 = 1920;

/// Nominal panel height, reported before the session is up.
pub const NOMINAL_HEIGHT: u32 = 1152;

/// Tag under which the wavefront-correction file is registered.
pub const WFC_FLAT_TAG: &str = "wfc";

/// Wavefront commands beyond this magnitude (meters) are rejected rather
/// than silently wrapped dozens of times.
const MAX_WAVEFRONT_M: f64 = 1.0e-4;

/// Model-specific descriptor keys for `meadowlarkSLM`.
#[derive(Debug, Clone, Deserialize)]
pub struct MeadowlarkConfig {
    /// Gamma lookup table uploaded to the panel.
    pub lut_filename: PathBuf,

    /// Factory wavefront-correction map; doubles as the `wfc` flat.
    pub wfc_filename: PathBuf,

    /// Wavelength calibration table (gray levels per 2π versus wavelength).
    pub wl_calibration: PathBuf,

    /// Working wavelength in nanometers.
    pub wavelength_nm: f64,
}

/// Panel geometry as reported by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelGeometry {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
}

impl PanelGeometry {
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn bytes_per_pixel(&self) -> usize {
        (self.bit_depth as usize).div_ceil(8)
    }

    pub fn gray_max(&self) -> u32 {
        (1u32 << self.bit_depth) - 1
    }

    pub fn lut_entries(&self) -> usize {
        1usize << self.bit_depth
    }
}

/// The slice of the Blink SDK this driver uses.
#[async_trait]
pub trait BlinkSession: Send + Sync {
    async fn connect(&self) -> DmResult<PanelGeometry>;

    async fn load_lut(&self, lut: &[u16]) -> DmResult<()>;

    /// Push one full frame, `bytes_per_pixel` bytes per pixel.
    async fn write_image(&self, frame: &[u8]) -> DmResult<()>;

    async fn release(&self) -> DmResult<()>;
}

/// Production session placeholder for the Blink SDK runtime.
pub struct NativeBlink {
    serial_number: String,
}

impl NativeBlink {
    pub fn new(serial_number: String) -> Self {
        NativeBlink { serial_number }
    }
}

#[async_trait]
impl BlinkSession for NativeBlink {
    async fn connect(&self) -> DmResult<PanelGeometry> {
        Err(DmError::DeviceUnavailable(format!(
            "Blink SDK for SLM '{}' requires native bindings behind BlinkSession",
            self.serial_number
        )))
    }

    async fn load_lut(&self, _lut: &[u16]) -> DmResult<()> {
        Err(DmError::NotInitialized)
    }

    async fn write_image(&self, _frame: &[u8]) -> DmResult<()> {
        Err(DmError::NotInitialized)
    }

    async fn release(&self) -> DmResult<()> {
        Ok(())
    }
}

// =============================================================================
// Calibration artifacts
// =============================================================================

/// Parse a LUT file: one entry per line, either `value` or `index value`.
pub fn parse_lut_file(path: &Path) -> DmResult<Vec<u16>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DmError::InvalidCalibration(format!("cannot read {}: {}", path.display(), e))
    })?;
    let mut entries = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let trimmed = line.split('#').next().unwrap_or("").trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = trimmed.split_whitespace().last().unwrap_or(trimmed);
        let entry: u16 = value.parse().map_err(|_| {
            DmError::InvalidCalibration(format!(
                "{}:{}: not a LUT entry: '{}'",
                path.display(),
                line_no + 1,
                trimmed
            ))
        })?;
        entries.push(entry);
    }
    if entries.is_empty() {
        return Err(DmError::InvalidCalibration(format!(
            "{}: empty LUT",
            path.display()
        )));
    }
    Ok(entries)
}

#[derive(Debug, Clone, Deserialize)]
struct WlPoint {
    wavelength_nm: f64,
    gray_per_2pi: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct WlTable {
    points: Vec<WlPoint>,
}

/// Interpolate the gray-per-2π scale at the working wavelength.
pub fn gray_per_2pi_at(path: &Path, wavelength_nm: f64) -> DmResult<f64> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DmError::InvalidCalibration(format!("cannot read {}: {}", path.display(), e))
    })?;
    let mut table: WlTable = toml::from_str(&content)
        .map_err(|e| DmError::InvalidCalibration(format!("{}: {}", path.display(), e)))?;
    if table.points.is_empty() {
        return Err(DmError::InvalidCalibration(format!(
            "{}: no calibration points",
            path.display()
        )));
    }
    table
        .points
        .sort_by(|a, b| a.wavelength_nm.total_cmp(&b.wavelength_nm));

    let first = &table.points[0];
    let last = &table.points[table.points.len() - 1];
    if wavelength_nm < first.wavelength_nm || wavelength_nm > last.wavelength_nm {
        return Err(DmError::InvalidCalibration(format!(
            "{}: wavelength {} nm outside calibrated range [{}, {}] nm",
            path.display(),
            wavelength_nm,
            first.wavelength_nm,
            last.wavelength_nm
        )));
    }
    for pair in table.points.windows(2) {
        if wavelength_nm <= pair[1].wavelength_nm {
            let span = pair[1].wavelength_nm - pair[0].wavelength_nm;
            if span == 0.0 {
                return Ok(pair[0].gray_per_2pi);
            }
            let frac = (wavelength_nm - pair[0].wavelength_nm) / span;
            return Ok(pair[0].gray_per_2pi + frac * (pair[1].gray_per_2pi - pair[0].gray_per_2pi));
        }
    }
    Ok(first.gray_per_2pi)
}

// =============================================================================
// Driver
// =============================================================================

#[derive(Debug)]
struct SlmState {
    panel: Option<PanelGeometry>,
    flats: Option<FlatLibrary>,
    shape: Vec<f64>,
}

pub struct MeadowlarkSlm {
    serial_number: String,
    config: MeadowlarkConfig,
    descriptor: DeviceDescriptor,
    calibration_root: Option<PathBuf>,
    lut: Vec<u16>,
    gray_per_2pi: f64,
    session: Arc<dyn BlinkSession>,
    initialized: AtomicBool,
    pixels: AtomicUsize,
    state: RwLock<SlmState>,
}

impl MeadowlarkSlm {
    /// Parse the wavelength calibration and LUT eagerly; the wavefront
    /// correction map needs the panel geometry and is loaded at
    /// `initialize`.
    pub fn new(
        descriptor: &DeviceDescriptor,
        config: MeadowlarkConfig,
        calibration_root: Option<&Path>,
        session: Arc<dyn BlinkSession>,
    ) -> DmResult<Self> {
        let lut_path = resolve(&config.lut_filename, calibration_root);
        let wl_path = resolve(&config.wl_calibration, calibration_root);
        let lut = parse_lut_file(&lut_path)?;
        let gray_per_2pi = gray_per_2pi_at(&wl_path, config.wavelength_nm)?;
        Ok(MeadowlarkSlm {
            serial_number: descriptor.serial_number.clone(),
            config,
            descriptor: descriptor.clone(),
            calibration_root: calibration_root.map(Path::to_path_buf),
            lut,
            gray_per_2pi,
            session,
            initialized: AtomicBool::new(false),
            pixels: AtomicUsize::new((PANEL_WIDTH * NOMINAL_HEIGHT) as usize),
            state: RwLock::new(SlmState {
                panel: None,
                flats: None,
                shape: Vec::new(),
            }),
        })
    }

    /// Wrap a wavefront value into `[0, wavelength)` and scale to a gray
    /// level.
    fn to_gray(&self, wavefront_m: f64, panel: &PanelGeometry) -> u32 {
        let wavelength_m = self.config.wavelength_nm * 1e-9;
        let wrapped = wavefront_m.rem_euclid(wavelength_m);
        let gray = (wrapped / wavelength_m * self.gray_per_2pi).round() as u32;
        gray.min(panel.gray_max())
    }

    fn build_frame(&self, shape: &[f64], panel: &PanelGeometry) -> Vec<u8> {
        let bytes = panel.bytes_per_pixel();
        let mut frame = Vec::with_capacity(shape.len() * bytes);
        for &value in shape {
            let gray = self.to_gray(value, panel);
            if bytes == 1 {
                frame.push(gray as u8);
            } else {
                frame.extend_from_slice(&(gray as u16).to_le_bytes());
            }
        }
        frame
    }
}

fn resolve(path: &Path, calibration_root: Option<&Path>) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match calibration_root {
        Some(root) => root.join(path),
        None => path.to_path_buf(),
    }
}

#[async_trait]
impl DeformableMirror for MeadowlarkSlm {
    fn model(&self) -> &'static str {
        "meadowlarkSLM"
    }

    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn actuator_count(&self) -> usize {
        self.pixels.load(Ordering::Acquire)
    }

    fn stroke_limits(&self) -> StrokeLimits {
        StrokeLimits::symmetric(MAX_WAVEFRONT_M)
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn initialize(&self) -> DmResult<()> {
        let panel = self.session.connect().await?;
        if panel.width != PANEL_WIDTH {
            self.session.release().await?;
            return Err(DmError::DeviceUnavailable(format!(
                "panel is {} pixels wide, only {}-wide models are supported",
                panel.width, PANEL_WIDTH
            )));
        }
        if self.lut.len() != panel.lut_entries() {
            self.session.release().await?;
            return Err(DmError::InvalidCalibration(format!(
                "LUT has {} entries, {}-bit panel needs {}",
                self.lut.len(),
                panel.bit_depth,
                panel.lut_entries()
            )));
        }
        self.session.load_lut(&self.lut).await?;

        // The wavefront correction map is the panel's natural flat.
        let wfc_path = resolve(&self.config.wfc_filename, self.calibration_root.as_deref());
        let wfc = parse_flat_file(&wfc_path)?;
        if wfc.len() != panel.pixels() {
            return Err(DmError::InvalidCalibration(format!(
                "wavefront correction {} has {} values for {} pixels",
                wfc_path.display(),
                wfc.len(),
                panel.pixels()
            )));
        }
        let mut flats = FlatLibrary::for_descriptor(
            &self.descriptor,
            panel.pixels(),
            self.calibration_root.as_deref(),
        )?;
        flats.insert(WFC_FLAT_TAG.to_string(), wfc);

        let mut state = self.state.write().await;
        state.shape = vec![0.0; panel.pixels()];
        state.panel = Some(panel);
        state.flats = Some(flats);
        self.pixels.store(panel.pixels(), Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            serial = %self.serial_number,
            width = panel.width,
            height = panel.height,
            bit_depth = panel.bit_depth,
            "SLM session open"
        );

        // Start from a blank panel, as the vendor tooling does.
        drop(state);
        let blank = vec![0.0; panel.pixels()];
        self.apply_shape(&blank).await
    }

    async fn apply_shape(&self, shape: &[f64]) -> DmResult<()> {
        let mut state = self.state.write().await;
        let panel = state.panel.ok_or(DmError::NotInitialized)?;
        crate::validate_shape(panel.pixels(), self.stroke_limits(), shape)?;
        let frame = self.build_frame(shape, &panel);
        self.session.write_image(&frame).await?;
        state.shape.clear();
        state.shape.extend_from_slice(shape);
        Ok(())
    }

    async fn shape(&self) -> DmResult<Vec<f64>> {
        let state = self.state.read().await;
        if state.panel.is_none() {
            return Err(DmError::NotInitialized);
        }
        Ok(state.shape.clone())
    }

    async fn apply_flat(&self, tag: &str) -> DmResult<Vec<f64>> {
        let flat = {
            let state = self.state.read().await;
            let flats = state.flats.as_ref().ok_or(DmError::NotInitialized)?;
            flats.resolve(tag)?
        };
        self.apply_shape(&flat).await?;
        Ok(flat.to_vec())
    }

    async fn shutdown(&self) -> DmResult<()> {
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.session.release().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    /// Stand-in for the Blink SDK with a short test panel.
    struct FakeBlink {
        geometry: PanelGeometry,
        frames: Mutex<Vec<Vec<u8>>>,
        lut_loads: Mutex<usize>,
    }

    impl FakeBlink {
        fn new(width: u32, height: u32, bit_depth: u32) -> Self {
            FakeBlink {
                geometry: PanelGeometry {
                    width,
                    height,
                    bit_depth,
                },
                frames: Mutex::new(Vec::new()),
                lut_loads: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl BlinkSession for FakeBlink {
        async fn connect(&self) -> DmResult<PanelGeometry> {
            Ok(self.geometry)
        }

        async fn load_lut(&self, _lut: &[u16]) -> DmResult<()> {
            *self.lut_loads.lock().await += 1;
            Ok(())
        }

        async fn write_image(&self, frame: &[u8]) -> DmResult<()> {
            self.frames.lock().await.push(frame.to_vec());
            Ok(())
        }

        async fn release(&self) -> DmResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        slm: MeadowlarkSlm,
        session: Arc<FakeBlink>,
    }

    fn fixture(width: u32, height: u32) -> Fixture {
        fixture_with_depth(width, height, 8)
    }

    fn fixture_with_depth(width: u32, height: u32, bit_depth: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pixels = (width * height) as usize;

        let lut_path = dir.path().join("slm5951_at635.lut");
        let lut: String = (0..256).map(|i| format!("{i} {i}\n")).collect();
        std::fs::write(&lut_path, lut).unwrap();

        let wfc_path = dir.path().join("slm5951_wfc.txt");
        let wfc: String = (0..pixels).map(|_| "1.0e-7\n").collect();
        std::fs::write(&wfc_path, wfc).unwrap();

        let wl_path = dir.path().join("wl_calibration.toml");
        std::fs::write(
            &wl_path,
            r#"
[[points]]
wavelength_nm = 532.0
gray_per_2pi = 190.0

[[points]]
wavelength_nm = 635.0
gray_per_2pi = 208.0
"#,
        )
        .unwrap();

        let descriptor = DeviceDescriptor {
            name: "labSLM".into(),
            model: "meadowlarkSLM".into(),
            serial_number: "5951".into(),
            default_flat_tag: Some(WFC_FLAT_TAG.into()),
            flats: BTreeMap::new(),
            params: toml::Table::new(),
        };
        let config = MeadowlarkConfig {
            lut_filename: lut_path,
            wfc_filename: wfc_path,
            wl_calibration: wl_path,
            wavelength_nm: 635.0,
        };
        let session = Arc::new(FakeBlink::new(width, height, bit_depth));
        let slm = MeadowlarkSlm::new(&descriptor, config, None, session.clone()).unwrap();
        Fixture {
            _dir: dir,
            slm,
            session,
        }
    }

    #[tokio::test]
    async fn initialize_uploads_lut_and_blanks_panel() {
        let f = fixture(PANEL_WIDTH, 2);
        f.slm.initialize().await.unwrap();
        assert_eq!(*f.session.lut_loads.lock().await, 1);
        assert_eq!(f.slm.actuator_count(), (PANEL_WIDTH * 2) as usize);
        // blank frame written at startup
        let frames = f.session.frames.lock().await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn narrow_panels_are_refused() {
        let f = fixture(1024, 2);
        let err = f.slm.initialize().await.unwrap_err();
        assert_eq!(err.kind(), "DeviceUnavailable");
    }

    #[tokio::test]
    async fn phase_wraps_at_the_working_wavelength() {
        let f = fixture(PANEL_WIDTH, 2);
        f.slm.initialize().await.unwrap();

        let pixels = f.slm.actuator_count();
        // Same expression the driver evaluates, so the wrap is exact.
        let wavelength_m = 635.0 * 1e-9;
        let mut shape = vec![0.0; pixels];
        shape[0] = wavelength_m; // full wave: wraps to zero
        shape[1] = wavelength_m / 2.0; // half wave: half of gray_per_2pi
        f.slm.apply_shape(&shape).await.unwrap();

        let frames = f.session.frames.lock().await;
        let frame = frames.last().unwrap();
        assert_eq!(frame[0], 0);
        assert_eq!(frame[1], 104); // 208 / 2
    }

    #[tokio::test]
    async fn wfc_is_the_default_flat() {
        let f = fixture(PANEL_WIDTH, 2);
        f.slm.initialize().await.unwrap();
        let applied = f.slm.apply_flat(WFC_FLAT_TAG).await.unwrap();
        assert!(applied.iter().all(|&v| (v - 1.0e-7).abs() < 1e-15));
        assert_eq!(f.slm.shape().await.unwrap(), applied);
    }

    #[tokio::test]
    async fn wavelength_outside_calibration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let wl_path = dir.path().join("wl.toml");
        std::fs::write(
            &wl_path,
            "[[points]]\nwavelength_nm = 532.0\ngray_per_2pi = 190.0\n",
        )
        .unwrap();
        let err = gray_per_2pi_at(&wl_path, 635.0).unwrap_err();
        assert_eq!(err.kind(), "InvalidCalibration");
    }

    #[tokio::test]
    async fn lut_entry_count_must_match_bit_depth() {
        // 12-bit panel wants 4096 entries; the fixture LUT has 256.
        let f = fixture_with_depth(PANEL_WIDTH, 2, 12);
        let err = f.slm.initialize().await.unwrap_err();
        assert_eq!(err.kind(), "InvalidCalibration");
    }
}
