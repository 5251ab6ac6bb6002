//! L2P granule naming schema
//!
//! Maps (dataset, timestamp, processing type) to the directory and filenames
//! the processor writes:
//!
//! ```text
//! <data_dir>/output/<family>/<product>[_REFINED]/<year>/<day_of_year>/
//!     <YYYYMMDDHHMMSS>-JPL-L2P_GHRSST-SSTskin-<SENSOR>-<D|N>-v02.0-fv01.0.nc
//!     <YYYYMMDDHHMMSS>-JPL-L2P_GHRSST-SSTskin-<SENSOR>-<D|N>-v02.0-fv01.0.nc.md5
//! ```
//!
//! Day-of-year directories are not zero padded.

use crate::error::{Result, UploaderError};
use chrono::{Datelike, NaiveDateTime};
use clap::ValueEnum;
use std::fmt;
use std::path::{Path, PathBuf};

/// Extension of granule data files
pub const DATA_EXTENSION: &str = "nc";

/// Extension appended to a data filename for its checksum sidecar
pub const CHECKSUM_EXTENSION: &str = "md5";

/// Static description of one dataset's products
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetProduct {
    /// Dataset name as given on the command line
    pub name: &'static str,
    /// First directory level under `output/`
    pub family_dir: &'static str,
    /// Product directory for quicklook processing
    pub product_dir: &'static str,
    /// Sensor token in filenames
    pub sensor: &'static str,
    /// CMR collection short name
    pub collection: &'static str,
}

/// Known datasets
pub const PRODUCTS: [DatasetProduct; 3] = [
    DatasetProduct {
        name: "aqua",
        family_dir: "MODIS_L2P_CORE_NETCDF",
        product_dir: "MODIS_A",
        sensor: "MODIS_A",
        collection: "MODIS_A-JPL-L2P-v2019.0",
    },
    DatasetProduct {
        name: "terra",
        family_dir: "MODIS_L2P_CORE_NETCDF",
        product_dir: "MODIS_T",
        sensor: "MODIS_T",
        collection: "MODIS_T-JPL-L2P-v2019.0",
    },
    DatasetProduct {
        name: "viirs",
        family_dir: "VIIRS_L2P_CORE_NETCDF",
        product_dir: "VIIRS",
        sensor: "VIIRS_NPP",
        collection: "VIIRS_NPP-JPL-L2P-v2016.2",
    },
];

impl DatasetProduct {
    /// Look up a dataset by name
    pub fn lookup(name: &str) -> Result<&'static DatasetProduct> {
        PRODUCTS
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| UploaderError::config(format!("unknown dataset {name:?}")))
    }

    /// Collection version, e.g. `2019.0` for `MODIS_A-JPL-L2P-v2019.0`
    pub fn data_version(&self) -> &'static str {
        let last = self.collection.rsplit('-').next().unwrap_or(self.collection);
        last.rsplit('v').next().unwrap_or(last)
    }

    /// Directory holding the granules for `timestamp`
    pub fn granule_dir(
        &self,
        data_dir: &Path,
        timestamp: &GranuleTimestamp,
        processing: ProcessingType,
    ) -> PathBuf {
        let product_dir = match processing {
            ProcessingType::Quicklook => self.product_dir.to_string(),
            ProcessingType::Refined => format!("{}_REFINED", self.product_dir),
        };

        data_dir
            .join("output")
            .join(self.family_dir)
            .join(product_dir)
            .join(timestamp.year().to_string())
            .join(timestamp.day_of_year().to_string())
    }

    /// Granule identifier (data filename without extension)
    pub fn identifier(&self, timestamp: &GranuleTimestamp, pass: Pass) -> String {
        format!(
            "{}-JPL-L2P_GHRSST-SSTskin-{}-{}-v02.0-fv01.0",
            timestamp.compact(),
            self.sensor,
            pass.code()
        )
    }

    /// Resolve the data and checksum paths for one pass
    pub fn resolve(
        &self,
        data_dir: &Path,
        timestamp: &GranuleTimestamp,
        processing: ProcessingType,
        pass: Pass,
    ) -> GranulePaths {
        let dir = self.granule_dir(data_dir, timestamp, processing);
        let data = dir.join(format!("{}.{DATA_EXTENSION}", self.identifier(timestamp, pass)));
        let checksum = checksum_path(&data);
        GranulePaths { data, checksum }
    }
}

/// Sidecar path for a data file
pub fn checksum_path(data: &Path) -> PathBuf {
    let mut name = data.as_os_str().to_os_string();
    name.push(".");
    name.push(CHECKSUM_EXTENSION);
    PathBuf::from(name)
}

/// Expected locations of a granule's files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranulePaths {
    /// NetCDF data file
    pub data: PathBuf,
    /// MD5 sidecar
    pub checksum: PathBuf,
}

/// Processing mode of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProcessingType {
    /// Near real-time products
    Quicklook,
    /// Reprocessed products
    Refined,
}

/// Day or night pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Daytime granule
    Day,
    /// Nighttime granule
    Night,
}

impl Pass {
    /// Both passes, day first
    pub const ALL: [Pass; 2] = [Pass::Day, Pass::Night];

    /// Filename token
    pub fn code(self) -> char {
        match self {
            Self::Day => 'D',
            Self::Night => 'N',
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Night => write!(f, "night"),
        }
    }
}

/// Granule start time in `YYYYMMDDTHHMMSS` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GranuleTimestamp(NaiveDateTime);

impl GranuleTimestamp {
    /// Parse `YYYYMMDDTHHMMSS`
    pub fn parse(raw: &str) -> Result<Self> {
        NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S")
            .map(Self)
            .map_err(|_| UploaderError::InvalidTimestamp(raw.to_string()))
    }

    /// Timestamp as used in filenames, `YYYYMMDDHHMMSS`
    pub fn compact(&self) -> String {
        self.0.format("%Y%m%d%H%M%S").to_string()
    }

    /// Calendar year
    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Day of year, 1-based
    pub fn day_of_year(&self) -> u32 {
        self.0.ordinal()
    }
}

impl fmt::Display for GranuleTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%dT%H%M%S"))
    }
}
