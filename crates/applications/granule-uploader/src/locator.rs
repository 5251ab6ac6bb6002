//! Granule discovery on the shared filesystem
//!
//! For every timestamp assigned to this job, checks the day then the night
//! variant of the expected granule. A data file with its `.md5` sidecar is a
//! complete granule; a data file without one is reported as missing its
//! checksum and never uploaded. Neither variant existing is normal.

use crate::error::{Result, UploaderError};
use crate::naming::{DatasetProduct, GranuleTimestamp, Pass, ProcessingType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A complete granule: data file plus checksum sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranulePair {
    /// Granule start time
    pub timestamp: GranuleTimestamp,
    /// Day or night pass
    pub pass: Pass,
    /// Granule identifier (data filename without `.nc`)
    pub identifier: String,
    /// NetCDF data file
    pub data: PathBuf,
    /// MD5 sidecar
    pub checksum: PathBuf,
}

impl GranulePair {
    /// Both files, data first
    pub fn files(&self) -> [&Path; 2] {
        [&self.data, &self.checksum]
    }
}

/// Result of a locate pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Located {
    /// Complete granules, in timestamp order, day before night
    pub found: Vec<GranulePair>,
    /// Data files without a checksum sidecar
    pub missing: Vec<PathBuf>,
}

impl Located {
    /// Files to upload, data then checksum for each granule
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.found.iter().flat_map(|pair| pair.files())
    }
}

/// Finds processed granules under a data directory
pub struct GranuleLocator {
    data_dir: PathBuf,
    product: &'static DatasetProduct,
    processing: ProcessingType,
}

impl GranuleLocator {
    /// Create a locator
    pub fn new(
        data_dir: impl Into<PathBuf>,
        product: &'static DatasetProduct,
        processing: ProcessingType,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            product,
            processing,
        }
    }

    /// Locate granules for `timestamps`
    pub fn locate(&self, timestamps: &[GranuleTimestamp]) -> Located {
        let mut located = Located::default();

        for timestamp in timestamps {
            for pass in Pass::ALL {
                let paths = self
                    .product
                    .resolve(&self.data_dir, timestamp, self.processing, pass);

                if !paths.data.is_file() {
                    debug!(timestamp = %timestamp, pass = %pass, "No granule for pass");
                    continue;
                }

                if paths.checksum.is_file() {
                    located.found.push(GranulePair {
                        timestamp: *timestamp,
                        pass,
                        identifier: self.product.identifier(timestamp, pass),
                        data: paths.data,
                        checksum: paths.checksum,
                    });
                } else {
                    warn!(path = %paths.data.display(), "Granule is missing its checksum file");
                    located.missing.push(paths.data);
                }
            }
        }

        info!(
            found = located.found.len(),
            missing_checksum = located.missing.len(),
            "Located granules"
        );
        located
    }
}

/// Read the timestamps assigned to `job_index` from the input JSON
///
/// The file maps job index (as a string key) to a list of
/// `YYYYMMDDTHHMMSS` timestamps.
pub fn load_timestamps(input_json: &Path, job_index: i64) -> Result<Vec<GranuleTimestamp>> {
    let content =
        std::fs::read_to_string(input_json).map_err(|e| UploaderError::io(input_json, e))?;
    let jobs: HashMap<String, Vec<String>> = serde_json::from_str(&content)?;

    let raw = jobs
        .get(&job_index.to_string())
        .ok_or_else(|| UploaderError::MissingJob {
            path: input_json.to_path_buf(),
            job_index,
        })?;

    raw.iter().map(|ts| GranuleTimestamp::parse(ts)).collect()
}
