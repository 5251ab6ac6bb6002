//! Cloud Notification Mechanism (CNM) messages
//!
//! One message per uploaded granule, describing the data file and its
//! checksum sidecar for downstream ingestion:
//!
//! ```json
//! {
//!   "version": "1.4",
//!   "provider": "NASA/JPL/PO.DAAC",
//!   "collection": "MODIS_A-JPL-L2P-v2019.0",
//!   "submissionTime": "2023-01-01T12:00:00.000000",
//!   "identifier": "20230101120000-JPL-L2P_GHRSST-SSTskin-MODIS_A-D-v02.0-fv01.0",
//!   "product": {
//!     "name": "...",
//!     "files": [{"uri": "...", "checksum": "...", "size": 1, "type": "data", ...}],
//!     "dataVersion": "2019.0"
//!   },
//!   "trace": "<prefix>"
//! }
//! ```

use crate::error::{Result, UploaderError};
use crate::locator::GranulePair;
use crate::naming::DatasetProduct;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// CNM schema version
pub const CNM_VERSION: &str = "1.4";

/// Data provider
pub const PROVIDER: &str = "NASA/JPL/PO.DAAC";

/// Checksum algorithm advertised for every file
pub const CHECKSUM_TYPE: &str = "md5";

/// CNM message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CnmMessage {
    /// Schema version
    pub version: String,
    /// Data provider
    pub provider: String,
    /// Collection short name
    pub collection: String,
    /// UTC submission time with microseconds, no offset
    pub submission_time: String,
    /// Granule identifier
    pub identifier: String,
    /// Granule files
    pub product: CnmProduct,
    /// Environment prefix
    pub trace: String,
}

/// Product section of a CNM message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CnmProduct {
    /// Granule name
    pub name: String,
    /// Data file then checksum file
    pub files: Vec<CnmFile>,
    /// Collection version
    pub data_version: String,
}

/// One file in a CNM product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CnmFile {
    /// Object store URI
    pub uri: String,
    /// Hex MD5 of the file contents
    pub checksum: String,
    /// Size in bytes
    pub size: u64,
    /// File role
    #[serde(rename = "type")]
    pub file_type: CnmFileType,
    /// Filename
    pub name: String,
    /// Always `md5`
    pub checksum_type: String,
}

/// Role of a file in a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CnmFileType {
    /// Granule data
    Data,
    /// Checksum sidecar
    Metadata,
}

impl CnmMessage {
    /// Build the message for an uploaded granule
    ///
    /// `data_uri` is where the data file landed; the checksum file is assumed
    /// to sit next to it with `.md5` appended.
    pub fn for_granule(
        product: &DatasetProduct,
        trace: &str,
        pair: &GranulePair,
        data_uri: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<Self> {
        let files = vec![
            CnmFile::describe(&pair.data, data_uri.to_string(), CnmFileType::Data)?,
            CnmFile::describe(&pair.checksum, format!("{data_uri}.md5"), CnmFileType::Metadata)?,
        ];

        Ok(Self {
            version: CNM_VERSION.to_string(),
            provider: PROVIDER.to_string(),
            collection: product.collection.to_string(),
            submission_time: submitted_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            identifier: pair.identifier.clone(),
            product: CnmProduct {
                name: pair.identifier.clone(),
                files,
                data_version: product.data_version().to_string(),
            },
            trace: trace.to_string(),
        })
    }

    /// Serialize to the JSON message body
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl CnmFile {
    /// Describe a local file that was uploaded to `uri`
    pub fn describe(path: &Path, uri: String, file_type: CnmFileType) -> Result<Self> {
        let size = std::fs::metadata(path)
            .map_err(|e| UploaderError::io(path, e))?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            uri,
            checksum: md5_hex(path)?,
            size,
            file_type,
            name,
            checksum_type: CHECKSUM_TYPE.to_string(),
        })
    }
}

/// Hex MD5 of a file's contents
pub fn md5_hex(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| UploaderError::io(path, e))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| UploaderError::io(path, e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{GranuleTimestamp, Pass, ProcessingType};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn pair_in(dir: &TempDir) -> GranulePair {
        let product = DatasetProduct::lookup("aqua").unwrap();
        let timestamp = GranuleTimestamp::parse("20230101T120000").unwrap();
        let paths = product.resolve(dir.path(), &timestamp, ProcessingType::Quicklook, Pass::Day);
        std::fs::create_dir_all(paths.data.parent().unwrap()).unwrap();
        std::fs::write(&paths.data, b"hello").unwrap();
        std::fs::write(&paths.checksum, b"5d41402abc4b2a76b9719d911017c592").unwrap();

        GranulePair {
            timestamp,
            pass: Pass::Day,
            identifier: product.identifier(&timestamp, Pass::Day),
            data: paths.data,
            checksum: paths.checksum,
        }
    }

    #[test]
    fn test_md5_hex() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(md5_hex(&path).unwrap(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_message_fields() {
        let dir = TempDir::new().unwrap();
        let pair = pair_in(&dir);
        let product = DatasetProduct::lookup("aqua").unwrap();
        let submitted = Utc.with_ymd_and_hms(2023, 1, 1, 12, 30, 0).unwrap();
        let uri = "s3://gen-l2p-granules/20230101120000-JPL-L2P_GHRSST-SSTskin-MODIS_A-D-v02.0-fv01.0.nc";

        let message = CnmMessage::for_granule(product, "gen", &pair, uri, submitted).unwrap();

        assert_eq!(message.version, "1.4");
        assert_eq!(message.collection, "MODIS_A-JPL-L2P-v2019.0");
        assert_eq!(message.submission_time, "2023-01-01T12:30:00.000000");
        assert_eq!(message.product.data_version, "2019.0");
        assert_eq!(message.product.name, message.identifier);
        assert_eq!(message.trace, "gen");

        let [data, checksum] = message.product.files.as_slice() else {
            panic!("expected two files");
        };
        assert_eq!(data.file_type, CnmFileType::Data);
        assert_eq!(data.uri, uri);
        assert_eq!(data.size, 5);
        assert_eq!(data.checksum, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(checksum.file_type, CnmFileType::Metadata);
        assert_eq!(checksum.uri, format!("{uri}.md5"));
        assert_eq!(checksum.size, 32);
        assert!(checksum.name.ends_with(".nc.md5"));
    }

    #[test]
    fn test_json_shape() {
        let dir = TempDir::new().unwrap();
        let pair = pair_in(&dir);
        let product = DatasetProduct::lookup("aqua").unwrap();
        let message = CnmMessage::for_granule(product, "gen", &pair, "s3://b/k.nc", Utc::now()).unwrap();

        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert!(value.get("submissionTime").is_some());
        assert_eq!(value["product"]["dataVersion"], "2019.0");
        assert_eq!(value["product"]["files"][0]["type"], "data");
        assert_eq!(value["product"]["files"][1]["type"], "metadata");
        assert_eq!(value["product"]["files"][1]["checksumType"], "md5");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = CnmFile::describe(&dir.path().join("gone.nc"), "s3://b/gone.nc".into(), CnmFileType::Data);
        assert!(matches!(result, Err(UploaderError::Io { .. })));
    }
}
