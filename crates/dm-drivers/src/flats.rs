//! Named flat-position vectors.
//!
//! Every device carries a built-in `zero` flat (all actuators at rest) plus
//! any tags declared in its descriptor's `flats` table, each pointing at a
//! calibration file with one value per line (`#` starts a comment).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dm_core::config::DeviceDescriptor;
use dm_core::{DmError, DmResult};

/// Tag of the built-in all-zero flat.
pub const ZERO_FLAT_TAG: &str = "zero";

/// The flat positions one device knows about.
#[derive(Debug, Clone)]
pub struct FlatLibrary {
    flats: BTreeMap<String, Arc<Vec<f64>>>,
}

impl FlatLibrary {
    /// A library holding only the built-in `zero` flat.
    pub fn with_zero(n_actuators: usize) -> Self {
        let mut flats = BTreeMap::new();
        flats.insert(
            ZERO_FLAT_TAG.to_string(),
            Arc::new(vec![0.0; n_actuators]),
        );
        FlatLibrary { flats }
    }

    /// Build the library for a descriptor: the `zero` flat plus every file
    /// in the descriptor's `flats` table, resolved against
    /// `calibration_root`. A file that cannot be read, parsed, or whose
    /// length differs from the actuator count is `InvalidCalibration`.
    pub fn for_descriptor(
        descriptor: &DeviceDescriptor,
        n_actuators: usize,
        calibration_root: Option<&Path>,
    ) -> DmResult<Self> {
        let mut library = Self::with_zero(n_actuators);
        for (tag, file) in &descriptor.flats {
            let path = resolve(file, calibration_root);
            let vector = parse_flat_file(&path)?;
            if vector.len() != n_actuators {
                return Err(DmError::InvalidCalibration(format!(
                    "flat '{}' ({}): {} values for {} actuators",
                    tag,
                    path.display(),
                    vector.len(),
                    n_actuators
                )));
            }
            library.insert(tag.clone(), vector);
        }
        Ok(library)
    }

    pub fn insert(&mut self, tag: String, vector: Vec<f64>) {
        self.flats.insert(tag, Arc::new(vector));
    }

    /// Look a tag up, failing with `UnknownFlatTag` when absent.
    pub fn resolve(&self, tag: &str) -> DmResult<Arc<Vec<f64>>> {
        self.flats
            .get(tag)
            .cloned()
            .ok_or_else(|| DmError::UnknownFlatTag(tag.to_string()))
    }

    pub fn tags(&self) -> Vec<String> {
        self.flats.keys().cloned().collect()
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

/// Parse a flat calibration file: one value per line, `#` comments.
pub fn parse_flat_file(path: &Path) -> DmResult<Vec<f64>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DmError::InvalidCalibration(format!("cannot read {}: {}", path.display(), e))
    })?;
    let mut values = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let trimmed = line.split('#').next().unwrap_or("").trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: f64 = trimmed.parse().map_err(|_| {
            DmError::InvalidCalibration(format!(
                "{}:{}: not a number: '{}'",
                path.display(),
                line_no + 1,
                trimmed
            ))
        })?;
        values.push(value);
    }
    Ok(values)
}
