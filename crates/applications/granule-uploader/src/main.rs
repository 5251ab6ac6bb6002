//! granule-uploader - L2P granule upload and license return
//!
//! ## Usage
//!
//! ```bash
//! # Upload one batch job's granules, returning licenses on the last job
//! granule-uploader upload --prefix gen-sit --venue sit --job-index -235 \
//!     --last-job-index 9 --unique-id 1700000000 --data-dir /mnt/data \
//!     --input-json /mnt/data/input/jobs.json --processing-type quicklook \
//!     --dataset aqua
//!
//! # Return licenses without uploading
//! granule-uploader return-licenses --prefix gen-sit --dataset aqua --unique-id 1700000000
//!
//! # List what would be uploaded
//! granule-uploader locate --data-dir /mnt/data --input-json jobs.json --job-index 0 \
//!     --processing-type refined --dataset viirs
//! ```
//!
//! Exit status is non-zero whenever the run aborted or a failure report was
//! sent.

use aws_types::region::Region;
use clap::{Args, Parser, Subcommand};
use granule_uploader::{
    config::{is_terminating_job, resolve_job_index, BATCH_INDEX_ENV, DEFAULT_REGION},
    DatasetProduct, Encryption, GranuleLocator, KeyLayout, LicenseKeys, LicenseReturn,
    LicenseSettings, LockSettings, ParameterStore, ProcessingType, Services,
    SsmParameterStore, UploadConfig, UploadRun, UploaderError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upload L2P granules to S3 and return IDL licenses
#[derive(Parser)]
#[command(name = "granule-uploader")]
#[command(about = "Upload L2P granules to S3, notify Cumulus, return IDL licenses", long_about = None)]
struct Cli {
    /// AWS region
    #[arg(long, global = true, default_value = DEFAULT_REGION)]
    region: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload granules, publish CNM messages, return licenses on the last job
    Upload(UploadArgs),

    /// Return a run's licenses to the shared pools
    ReturnLicenses {
        /// Environment prefix
        #[arg(long)]
        prefix: String,

        /// Dataset the licenses were reserved for
        #[arg(long)]
        dataset: String,

        /// Run id the licenses were reserved under
        #[arg(long)]
        unique_id: String,

        #[command(flatten)]
        lock: LockArgs,
    },

    /// List granules that would be uploaded (no AWS calls)
    Locate {
        #[command(flatten)]
        granules: GranuleArgs,
    },
}

#[derive(Args)]
struct GranuleArgs {
    /// Processor data directory
    #[arg(long)]
    data_dir: PathBuf,

    /// Input JSON mapping job index to timestamps
    #[arg(long)]
    input_json: PathBuf,

    /// Job index (-235 reads AWS_BATCH_JOB_ARRAY_INDEX)
    #[arg(long, allow_hyphen_values = true)]
    job_index: i64,

    /// Processing type
    #[arg(long, value_enum)]
    processing_type: ProcessingType,

    /// Dataset (aqua, terra, viirs)
    #[arg(long)]
    dataset: String,
}

#[derive(Args)]
struct LockArgs {
    /// Seconds between polls of the retrieval hold flag
    #[arg(long, default_value_t = 3)]
    lock_poll_secs: u64,

    /// Give up waiting for the hold flag after this many seconds
    #[arg(long)]
    lock_timeout_secs: Option<u64>,
}

impl From<&LockArgs> for LockSettings {
    fn from(args: &LockArgs) -> Self {
        Self {
            poll_secs: args.lock_poll_secs,
            timeout_secs: args.lock_timeout_secs,
        }
    }
}

#[derive(Args)]
struct UploadArgs {
    /// Environment prefix
    #[arg(long)]
    prefix: String,

    /// Venue (sit, uat, ops)
    #[arg(long)]
    venue: String,

    #[command(flatten)]
    granules: GranuleArgs,

    /// Last array job index of the batch (-1 for single jobs)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    last_job_index: i64,

    /// Run id licenses were reserved under (omit to skip license return)
    #[arg(long)]
    unique_id: Option<String>,

    /// Object key layout
    #[arg(long, value_enum, default_value_t = KeyLayout::Bare)]
    key_layout: KeyLayout,

    /// Server-side encryption
    #[arg(long, value_enum, default_value_t = Encryption::Kms)]
    encryption: Encryption,

    /// Substring identifying the alert topic
    #[arg(long, env = "TOPIC")]
    alert_topic: Option<String>,

    #[command(flatten)]
    lock: LockArgs,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let start = Instant::now();
    let result = match cli.command {
        Commands::Upload(args) => upload(cli.region, args).await,
        Commands::ReturnLicenses {
            prefix,
            dataset,
            unique_id,
            lock,
        } => return_licenses(cli.region, prefix, dataset, unique_id, &lock).await,
        Commands::Locate { granules } => locate(granules),
    };

    if let Err(e) = &result {
        error!(error = %e, elapsed = ?start.elapsed(), "{}", exit_message(e));
    }
    result
}

/// Final log line for a failed command
fn exit_message(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<UploaderError>() {
        Some(err) if !err.is_fatal() => "Run completed with failures, report sent.",
        _ => "System exit.",
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "granule_uploader=info,info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn load_aws_config(region: String) -> aws_config::SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(region))
        .load()
        .await
}

fn batch_index() -> Option<String> {
    std::env::var(BATCH_INDEX_ENV).ok()
}

/// Handle the upload command
async fn upload(region: String, args: UploadArgs) -> anyhow::Result<()> {
    let batch_index = batch_index();
    let job_index = resolve_job_index(args.granules.job_index, batch_index.as_deref())?;

    let license = args.unique_id.map(|unique_id| LicenseSettings {
        unique_id,
        terminating: is_terminating_job(args.last_job_index, batch_index.as_deref()),
        lock: LockSettings::from(&args.lock),
    });

    let config = UploadConfig::new(
        args.prefix,
        args.venue,
        region.clone(),
        job_index,
        args.granules.input_json,
        args.granules.data_dir,
        args.granules.processing_type,
        &args.granules.dataset,
    )?
    .with_storage(args.key_layout, args.encryption)
    .with_alert_topic(args.alert_topic)
    .with_license(license);

    info!(
        prefix = %config.prefix,
        dataset = %config.product.name,
        job_index = config.job_index,
        bucket = %config.destination.bucket,
        "Starting upload run"
    );

    let aws_config = load_aws_config(region).await;
    let outcome = UploadRun::new(config, Services::from_config(&aws_config))
        .execute()
        .await?;

    info!(
        granules = outcome.granules,
        files = outcome.uploaded.len(),
        published = outcome.published,
        licenses_returned = outcome.licenses.is_some(),
        "Upload run complete"
    );
    Ok(())
}

/// Handle the return-licenses command
async fn return_licenses(
    region: String,
    prefix: String,
    dataset: String,
    unique_id: String,
    lock: &LockArgs,
) -> anyhow::Result<()> {
    let product = DatasetProduct::lookup(&dataset)?;
    let aws_config = load_aws_config(region).await;
    let store: Arc<dyn ParameterStore> = Arc::new(SsmParameterStore::from_config(&aws_config));

    let update = LicenseReturn::new(store, LicenseKeys::new(prefix, product.name))
        .with_lock_options(LockSettings::from(lock).acquire_options())
        .return_licenses(&unique_id)
        .await?;

    info!(
        dataset_pool = update.dataset_pool,
        floating_pool = update.floating_pool,
        "Licenses returned"
    );
    Ok(())
}

/// Handle the locate command
fn locate(args: GranuleArgs) -> anyhow::Result<()> {
    let job_index = resolve_job_index(args.job_index, batch_index().as_deref())?;
    let product = DatasetProduct::lookup(&args.dataset)?;
    let timestamps = granule_uploader::load_timestamps(&args.input_json, job_index)?;

    let located =
        GranuleLocator::new(&args.data_dir, product, args.processing_type).locate(&timestamps);

    for pair in &located.found {
        println!("found\t{}\t{}", pair.pass, pair.data.display());
    }
    for path in &located.missing {
        println!("missing-checksum\t{}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_message_separates_report_from_abort() {
        let reported = anyhow::Error::from(UploaderError::RunFailed {
            missing_checksum: 1,
            upload: 0,
            publish: 0,
        });
        let aborted = anyhow::Error::from(UploaderError::MissingParameter("gen-cumulus-account".into()));
        let other = anyhow::anyhow!("region not set");

        assert_eq!(exit_message(&reported), "Run completed with failures, report sent.");
        assert_eq!(exit_message(&aborted), "System exit.");
        assert_eq!(exit_message(&other), "System exit.");
    }
}
