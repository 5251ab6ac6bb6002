//! IDL license return
//!
//! A processing run checks licenses out of two shared pools per environment
//! prefix, the dataset pool `{prefix}-idl-{dataset}` and the `floating`
//! pool, and records what it holds under two private counters keyed by the
//! run's unique id. The last job of a batch hands those licenses back:
//!
//! 1. Read both private counters (absent keys are fatal)
//! 2. Take the retrieval hold flag
//! 3. Overwrite the dataset pool with the job's dataset count, add the job's
//!    floating count to the floating pool (which must already exist)
//! 4. Release the hold flag
//! 5. Delete the private counters
//!
//! The dataset pool is overwritten rather than incremented, while the
//! floating pool is additive. Both updates are conditional writes on the
//! version read inside the lock, retried when the store rejects them.
//!
//! The conditional write does not make pool updates safe on its own. SSM
//! only detects a concurrent counter write after ours has landed on top of
//! it ([`WriteOutcome::Raced`]). A raced floating update is re-applied over
//! the value it replaced, which recovers a single interleaved writer. It
//! cannot recover every interleaving, and a raced dataset overwrite stays
//! last-writer-wins. Every raced write is logged at error level, because the
//! pools can drift from the outstanding reservations. The hold flag is what
//! keeps runs from overlapping in the first place.

use crate::error::{Result, UploaderError};
use crate::lock::{AcquireOptions, DistributedLock};
use crate::store::{parse_count, Parameter, ParameterStore, WriteOutcome, WritePrecondition};
use std::sync::Arc;
use tracing::{error, info};

/// Attempts at a conditional counter update before giving up
const MAX_COUNTER_ATTEMPTS: u32 = 5;

/// Parameter names for one prefix and dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseKeys {
    prefix: String,
    dataset: String,
}

impl LicenseKeys {
    /// Keys for `prefix` and `dataset`
    pub fn new(prefix: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            dataset: dataset.into(),
        }
    }

    /// Job's dataset license count
    pub fn reserved_dataset(&self, run_id: &str) -> String {
        format!("{}-idl-{}-{}-lic", self.prefix, self.dataset, run_id)
    }

    /// Job's floating license count
    pub fn reserved_floating(&self, run_id: &str) -> String {
        format!("{}-idl-{}-{}-floating", self.prefix, self.dataset, run_id)
    }

    /// Shared dataset pool
    pub fn dataset_pool(&self) -> String {
        format!("{}-idl-{}", self.prefix, self.dataset)
    }

    /// Shared floating pool
    pub fn floating_pool(&self) -> String {
        format!("{}-idl-floating", self.prefix)
    }

    /// Retrieval hold flag guarding both pools
    pub fn hold_flag(&self) -> String {
        format!("{}-idl-retrieving-license", self.prefix)
    }

    /// Dataset name
    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

/// Licenses held by one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LicenseReservation {
    /// Dataset licenses
    pub dataset: i64,
    /// Floating licenses
    pub floating: i64,
}

/// Pool values after a return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUpdate {
    /// Reservation that was returned
    pub returned: LicenseReservation,
    /// Dataset pool after the write
    pub dataset_pool: i64,
    /// Floating pool after the write
    pub floating_pool: i64,
}

/// Returns a run's licenses to the shared pools
pub struct LicenseReturn {
    store: Arc<dyn ParameterStore>,
    keys: LicenseKeys,
    lock_options: AcquireOptions,
}

impl LicenseReturn {
    /// Create a license return service
    pub fn new(store: Arc<dyn ParameterStore>, keys: LicenseKeys) -> Self {
        Self {
            store,
            keys,
            lock_options: AcquireOptions::default(),
        }
    }

    /// Set hold flag acquisition options
    pub fn with_lock_options(mut self, options: AcquireOptions) -> Self {
        self.lock_options = options;
        self
    }

    /// Read the reservation recorded for `run_id`
    pub async fn reservation(&self, run_id: &str) -> Result<LicenseReservation> {
        let dataset_key = self.keys.reserved_dataset(run_id);
        let floating_key = self.keys.reserved_floating(run_id);

        let dataset = self.store.require(&dataset_key).await?;
        let floating = self.store.require(&floating_key).await?;

        Ok(LicenseReservation {
            dataset: parse_count(&dataset_key, &dataset)?,
            floating: parse_count(&floating_key, &floating)?,
        })
    }

    /// Return the licenses held by `run_id` and delete its reservation
    ///
    /// A second call for the same run fails with
    /// [`UploaderError::MissingParameter`] because the reservation is gone.
    pub async fn return_licenses(&self, run_id: &str) -> Result<PoolUpdate> {
        let returned = self.reservation(run_id).await?;

        let lock = DistributedLock::new(Arc::clone(&self.store), self.keys.hold_flag())
            .with_options(self.lock_options);

        let (dataset_pool, floating_pool) = lock
            .with_lock(|| async {
                let dataset_pool = self
                    .update_pool(&self.keys.dataset_pool(), PoolWrite::Overwrite(returned.dataset))
                    .await?;
                let floating_pool = self
                    .update_pool(&self.keys.floating_pool(), PoolWrite::Add(returned.floating))
                    .await?;
                Ok::<_, UploaderError>((dataset_pool, floating_pool))
            })
            .await?;

        info!(
            dataset = %self.keys.dataset(),
            count = returned.dataset,
            "Wrote {} license(s) to {}.",
            returned.dataset,
            self.keys.dataset()
        );
        info!(
            count = returned.floating,
            "Wrote {} license(s) to floating.", returned.floating
        );

        let reserved = [
            self.keys.reserved_dataset(run_id),
            self.keys.reserved_floating(run_id),
        ];
        self.store.delete(&reserved).await?;
        for key in &reserved {
            info!(key = %key, "Deleted parameter");
        }

        Ok(PoolUpdate {
            returned,
            dataset_pool,
            floating_pool,
        })
    }

    /// Apply `write` to a pool counter with conditional writes
    async fn update_pool(&self, key: &str, write: PoolWrite) -> Result<i64> {
        let mut state = self.read_pool(key, write).await?;

        for _ in 0..MAX_COUNTER_ATTEMPTS {
            let value = write.apply(state.current);
            match self.store.put(key, &value.to_string(), state.precondition).await? {
                WriteOutcome::Written { .. } => return Ok(value),
                WriteOutcome::PreconditionFailed => {
                    state = self.read_pool(key, write).await?;
                }
                WriteOutcome::Raced { version, replaced } => {
                    error!(
                        key = %key,
                        version,
                        replaced = ?replaced,
                        "Concurrent write on license pool was overwritten"
                    );
                    match (write, replaced) {
                        (PoolWrite::Add(_), Some(previous)) => {
                            // Redo our increment on top of the value we clobbered
                            let previous = Parameter {
                                value: previous,
                                version: version - 1,
                            };
                            state = PoolState {
                                current: Some(parse_count(key, &previous)?),
                                precondition: WritePrecondition::MatchesVersion(version),
                            };
                        }
                        (PoolWrite::Add(_), None) => {
                            error!(key = %key, "Replaced value unknown, pool update may be lost");
                            return Ok(value);
                        }
                        (PoolWrite::Overwrite(_), _) => return Ok(value),
                    }
                }
            }
        }

        Err(UploaderError::WriteConflict {
            key: key.to_string(),
            attempts: MAX_COUNTER_ATTEMPTS,
        })
    }

    async fn read_pool(&self, key: &str, write: PoolWrite) -> Result<PoolState> {
        let parameter = match write {
            PoolWrite::Overwrite(_) => self.store.get(key).await?,
            PoolWrite::Add(_) => Some(self.store.require(key).await?),
        };

        Ok(match parameter {
            Some(parameter) => PoolState {
                current: Some(parse_count(key, &parameter)?),
                precondition: WritePrecondition::MatchesVersion(parameter.version),
            },
            None => PoolState {
                current: None,
                precondition: WritePrecondition::DoesNotExist,
            },
        })
    }
}

/// How a returned count is merged into a pool
#[derive(Debug, Clone, Copy)]
enum PoolWrite {
    /// Replace the pool value, creating the counter if absent
    Overwrite(i64),
    /// Add to the existing pool value
    Add(i64),
}

impl PoolWrite {
    fn apply(self, current: Option<i64>) -> i64 {
        match self {
            Self::Overwrite(count) => count,
            Self::Add(count) => current.unwrap_or_default() + count,
        }
    }
}

struct PoolState {
    current: Option<i64>,
    precondition: WritePrecondition,
}
