//! Shared parameter store
//!
//! License counters, the retrieval hold flag and the cross-account id all live
//! in AWS Systems Manager Parameter Store. Reads are versioned and writes can
//! carry a precondition so callers can detect concurrent writers:
//!
//! - `DoesNotExist` maps to `PutParameter` without `Overwrite`, which SSM
//!   rejects atomically with `ParameterAlreadyExists`.
//! - `MatchesVersion` checks the current version, writes, and then verifies
//!   that the write produced exactly the next version. SSM versions grow by
//!   one per write, so a concurrent writer always shows up as a gap.
//!
//! SSM has no compare-and-swap, so the second case only detects a concurrent
//! writer after the fact. By then the write has landed and may have replaced
//! the other writer's value. It is reported as [`WriteOutcome::Raced`] with
//! the value it replaced, read back from the parameter history, and callers
//! must decide what the landed write means for them.
//!
//! [`MemoryParameterStore`] implements the contract atomically and never
//! reports a race.

use crate::error::{Result, UploaderError};
use async_trait::async_trait;
use aws_sdk_ssm::types::ParameterType;
use aws_sdk_ssm::Client as SsmClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A parameter value together with its store version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Parameter value
    pub value: String,
    /// Monotonic version, bumped by every write
    pub version: i64,
}

/// Precondition for conditional writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write unconditionally
    None,
    /// Write only if the parameter does not exist
    DoesNotExist,
    /// Write only if the parameter is still at this version
    MatchesVersion(i64),
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Write landed, returns the new version
    Written {
        /// Version after the write
        version: i64,
    },
    /// Another writer got there first, nothing was written
    PreconditionFailed,
    /// The write landed, but over a version written by someone else after
    /// the precondition was checked
    Raced {
        /// Version after the write
        version: i64,
        /// Value the write replaced, `None` if it could not be read back
        replaced: Option<String>,
    },
}

impl WriteOutcome {
    /// Whether the write landed cleanly
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Strongly consistent key-value store
#[async_trait]
pub trait ParameterStore: Send + Sync + 'static {
    /// Read a parameter, `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<Parameter>>;

    /// Write a parameter subject to a precondition
    async fn put(
        &self,
        key: &str,
        value: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome>;

    /// Delete parameters; keys that do not exist are ignored
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Read a parameter that must exist
    async fn require(&self, key: &str) -> Result<Parameter> {
        self.get(key)
            .await?
            .ok_or_else(|| UploaderError::MissingParameter(key.to_string()))
    }
}

/// Parse a counter parameter
pub fn parse_count(key: &str, parameter: &Parameter) -> Result<i64> {
    parameter
        .value
        .trim()
        .parse()
        .map_err(|_| UploaderError::InvalidCounter {
            key: key.to_string(),
            value: parameter.value.clone(),
        })
}

/// Parameter store backed by AWS SSM
pub struct SsmParameterStore {
    client: SsmClient,
}

impl SsmParameterStore {
    /// Create a store from an SSM client
    pub fn new(client: SsmClient) -> Self {
        Self { client }
    }

    /// Create a store from AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(SsmClient::new(config))
    }

    async fn write(&self, key: &str, value: &str, overwrite: bool) -> Result<Option<i64>> {
        let response = self
            .client
            .put_parameter()
            .name(key)
            .value(value)
            .r#type(ParameterType::String)
            .overwrite(overwrite)
            .send()
            .await;

        match response {
            Ok(output) => Ok(Some(output.version())),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_parameter_already_exists()) =>
            {
                Ok(None)
            }
            Err(e) => Err(UploaderError::from_ssm(e)),
        }
    }

    /// Value a parameter held at `version`, if SSM still keeps it
    async fn value_at(&self, key: &str, version: i64) -> Result<Option<String>> {
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .get_parameter_history()
                .name(key)
                .with_decryption(true)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(UploaderError::from_ssm)?;

            if let Some(entry) = response.parameters().iter().find(|p| p.version() == version) {
                return Ok(entry.value().map(str::to_string));
            }

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get(&self, key: &str) -> Result<Option<Parameter>> {
        let response = self
            .client
            .get_parameter()
            .name(key)
            .with_decryption(true)
            .send()
            .await;

        match response {
            Ok(output) => {
                let Some(parameter) = output.parameter else {
                    return Ok(None);
                };
                Ok(Some(Parameter {
                    value: parameter.value.unwrap_or_default(),
                    version: parameter.version,
                }))
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_parameter_not_found()) => {
                Ok(None)
            }
            Err(e) => Err(UploaderError::from_ssm(e)),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome> {
        match precondition {
            WritePrecondition::None => {
                let version = self.write(key, value, true).await?.unwrap_or_default();
                Ok(WriteOutcome::Written { version })
            }
            WritePrecondition::DoesNotExist => match self.write(key, value, false).await? {
                Some(version) => Ok(WriteOutcome::Written { version }),
                None => Ok(WriteOutcome::PreconditionFailed),
            },
            WritePrecondition::MatchesVersion(expected) => {
                match self.get(key).await? {
                    Some(current) if current.version == expected => {}
                    _ => return Ok(WriteOutcome::PreconditionFailed),
                }

                let version = self.write(key, value, true).await?.unwrap_or_default();
                if version == expected + 1 {
                    return Ok(WriteOutcome::Written { version });
                }

                let replaced = self.value_at(key, version - 1).await?;
                warn!(
                    key = %key,
                    expected = expected + 1,
                    actual = version,
                    replaced = ?replaced,
                    "Concurrent write detected on parameter"
                );
                Ok(WriteOutcome::Raced { version, replaced })
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .delete_parameters()
            .set_names(Some(keys.to_vec()))
            .send()
            .await
            .map_err(UploaderError::from_ssm)?;

        for name in response.invalid_parameters() {
            debug!(key = %name, "Parameter did not exist at delete");
        }

        Ok(())
    }
}

/// In-memory parameter store for testing
///
/// Every operation takes the inner mutex, so conditional writes are atomic.
#[derive(Debug, Default, Clone)]
pub struct MemoryParameterStore {
    parameters: Arc<Mutex<HashMap<String, Parameter>>>,
}

impl MemoryParameterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a parameter
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut parameters = self.lock();
        let key = key.into();
        let version = parameters.get(&key).map_or(1, |p| p.version + 1);
        parameters.insert(
            key,
            Parameter {
                value: value.into(),
                version,
            },
        );
    }

    /// Current value of a parameter
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().get(key).map(|p| p.value.clone())
    }

    /// Whether a parameter exists
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Parameter>> {
        // Poisoning only happens if a test panicked mid-write
        self.parameters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn get(&self, key: &str) -> Result<Option<Parameter>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome> {
        let mut parameters = self.lock();
        let current = parameters.get(key).map(|p| p.version);

        let allowed = match precondition {
            WritePrecondition::None => true,
            WritePrecondition::DoesNotExist => current.is_none(),
            WritePrecondition::MatchesVersion(expected) => current == Some(expected),
        };
        if !allowed {
            return Ok(WriteOutcome::PreconditionFailed);
        }

        let version = current.map_or(1, |v| v + 1);
        parameters.insert(
            key.to_string(),
            Parameter {
                value: value.to_string(),
                version,
            },
        );
        Ok(WriteOutcome::Written { version })
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut parameters = self.lock();
        for key in keys {
            parameters.remove(key);
        }
        Ok(())
    }
}

/// Test stores
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Store whose conditional writes check first and overwrite second, like
    /// [`SsmParameterStore`]
    ///
    /// Writes queued with [`CheckThenWriteStore::interleave`] land between the
    /// check and the overwrite of the next conditional put on that key.
    #[derive(Debug, Default, Clone)]
    pub struct CheckThenWriteStore {
        pub inner: MemoryParameterStore,
        pending: Arc<Mutex<HashMap<String, VecDeque<Vec<String>>>>>,
    }

    impl CheckThenWriteStore {
        pub fn new(inner: MemoryParameterStore) -> Self {
            Self {
                inner,
                pending: Arc::default(),
            }
        }

        /// Queue writes from another client for the next conditional put on `key`
        pub fn interleave(&self, key: &str, values: &[&str]) {
            self.pending
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push_back(values.iter().map(|v| v.to_string()).collect());
        }

        fn rival_writes(&self, key: &str) -> Vec<String> {
            self.pending
                .lock()
                .unwrap()
                .get_mut(key)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ParameterStore for CheckThenWriteStore {
        async fn get(&self, key: &str) -> Result<Option<Parameter>> {
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &str,
            value: &str,
            precondition: WritePrecondition,
        ) -> Result<WriteOutcome> {
            let expected = match precondition {
                WritePrecondition::None => return self.inner.put(key, value, precondition).await,
                WritePrecondition::DoesNotExist => {
                    for rival in self.rival_writes(key) {
                        self.inner.insert(key, rival);
                    }
                    return self.inner.put(key, value, precondition).await;
                }
                WritePrecondition::MatchesVersion(expected) => expected,
            };

            match self.inner.get(key).await? {
                Some(current) if current.version == expected => {}
                _ => return Ok(WriteOutcome::PreconditionFailed),
            }
            for rival in self.rival_writes(key) {
                self.inner.insert(key, rival);
            }

            let replaced = self.inner.value(key);
            let WriteOutcome::Written { version } =
                self.inner.put(key, value, WritePrecondition::None).await?
            else {
                unreachable!("unconditional write");
            };

            if version == expected + 1 {
                Ok(WriteOutcome::Written { version })
            } else {
                Ok(WriteOutcome::Raced { version, replaced })
            }
        }

        async fn delete(&self, keys: &[String]) -> Result<()> {
            self.inner.delete(keys).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_versions_increase_per_write() {
        let store = MemoryParameterStore::new();
        let first = store.put("k", "a", WritePrecondition::None).await.unwrap();
        let second = store.put("k", "b", WritePrecondition::None).await.unwrap();

        assert_eq!(first, WriteOutcome::Written { version: 1 });
        assert_eq!(second, WriteOutcome::Written { version: 2 });
        assert_eq!(store.value("k").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_does_not_exist_precondition() {
        let store = MemoryParameterStore::new();
        assert!(store
            .put("k", "a", WritePrecondition::DoesNotExist)
            .await
            .unwrap()
            .is_written());
        assert_eq!(
            store.put("k", "b", WritePrecondition::DoesNotExist).await.unwrap(),
            WriteOutcome::PreconditionFailed
        );
        assert_eq!(store.value("k").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_matches_version_precondition() {
        let store = MemoryParameterStore::new();
        store.insert("k", "1");
        let current = store.require("k").await.unwrap();

        store.insert("k", "2");
        let stale = store
            .put("k", "3", WritePrecondition::MatchesVersion(current.version))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::PreconditionFailed);

        let fresh = store.require("k").await.unwrap();
        let outcome = store
            .put("k", "3", WritePrecondition::MatchesVersion(fresh.version))
            .await
            .unwrap();
        assert!(outcome.is_written());
        assert_eq!(store.value("k").as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_require_missing_parameter() {
        let store = MemoryParameterStore::new();
        let err = assert_err!(store.require("absent").await);
        assert!(matches!(err, UploaderError::MissingParameter(key) if key == "absent"));
    }

    #[tokio::test]
    async fn test_delete_ignores_missing_keys() {
        let store = MemoryParameterStore::new();
        store.insert("a", "1");
        store
            .delete(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn test_late_detected_write_reports_replaced_value() {
        let store = testing::CheckThenWriteStore::new(MemoryParameterStore::new());
        store.inner.insert("k", "10");
        let read = store.require("k").await.unwrap();
        store.interleave("k", &["12"]);

        let outcome = store
            .put("k", "15", WritePrecondition::MatchesVersion(read.version))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WriteOutcome::Raced {
                version: 3,
                replaced: Some("12".into())
            }
        );
        assert!(!outcome.is_written());
        assert_eq!(store.inner.value("k").as_deref(), Some("15"));
    }

    #[test]
    fn test_parse_count() {
        let ok = Parameter {
            value: " 12 ".into(),
            version: 1,
        };
        assert_eq!(parse_count("k", &ok).unwrap(), 12);

        let bad = Parameter {
            value: "twelve".into(),
            version: 1,
        };
        assert!(matches!(
            parse_count("k", &bad),
            Err(UploaderError::InvalidCounter { .. })
        ));
    }
}
