use crate::config::ConfigDefaults;
use crate::exception::{WardenError, WardenResult};
use crate::metrics::LockMetrics;
use crate::relational::{RelationalStore, StoreTransaction};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use warden_util::Backoff;

/// SQLSTATEs of deadlock and serialization failures, checked against
/// [`WardenError::Database`] codes
const DEADLOCK_SQLSTATES: &[(&str, &str)] = &[
    ("40P01", "PostgreSQL"),
    ("40001", "serialization failure"),
];

/// Whole-word phrases that identify a deadlock in a driver message, with the
/// engine each one comes from. Codes appear with their marker so bare ids never match.
const DEADLOCK_SIGNATURES: &[(&str, &str)] = &[
    ("sqlstate 40p01", "PostgreSQL"),
    ("er_lock_deadlock", "MySQL"),
    ("error 1213", "MySQL"),
    ("ora-00060", "Oracle"),
    ("error 1205", "SQL Server"),
    ("was deadlocked", "SQL Server"),
    ("sqlstate 40001", "serialization failure"),
    ("could not serialize access", "serialization failure"),
    ("deadlock detected", "generic"),
    ("deadlock found", "generic"),
];

const REMEDIATIONS: [&str; 5] = [
    "Acquire locks in a consistent order across transactions (sort resource ids first)",
    "Keep transactions short and avoid user interaction or network calls while holding locks",
    "Consider a lower isolation level where the workload allows it",
    "Use optimistic locking for read-heavy paths instead of holding row locks",
    "Review indexes on filtered columns so lock scans touch fewer rows",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockRetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Randomize each delay to 50-100% of its computed value
    pub jitter: bool,
}

impl Default for DeadlockRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ConfigDefaults for DeadlockRetryConfig {
    fn validate(&self) -> Result<(), String> {
        if self.backoff_multiplier < 1.0 {
            return Err("Backoff multiplier must be >= 1.0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("Max delay must be >= initial delay".to_string());
        }
        Ok(())
    }
}

impl DeadlockRetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(
            Duration::from_millis(self.initial_delay_ms),
            self.backoff_multiplier,
        )
        .with_max(Duration::from_millis(self.max_delay_ms))
    }

    /// Delay before retry `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.jitter {
            self.backoff().jittered_delay(attempt, 0.5)
        } else {
            self.backoff().delay(attempt)
        }
    }
}

/// Lowercase words separated by single spaces, padded so phrases match whole words only
fn normalize(message: &str) -> String {
    let words: Vec<String> = message
        .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

fn matched_signature(message: &str) -> Option<(&'static str, &'static str)> {
    let message = normalize(message);
    DEADLOCK_SIGNATURES
        .iter()
        .find(|(signature, _)| message.contains(&format!(" {signature} ")))
        .copied()
}

/// Signature and engine for errors raised by the store itself. Structured lock,
/// version and lookup errors never classify, whatever ids they carry.
fn classify(error: &WardenError) -> Option<(&'static str, &'static str)> {
    match error {
        WardenError::Database { code, message } => DEADLOCK_SQLSTATES
            .iter()
            .find(|(sqlstate, _)| sqlstate.eq_ignore_ascii_case(code))
            .copied()
            .or_else(|| matched_signature(message)),
        WardenError::Store(message) => matched_signature(message),
        _ => None,
    }
}

/// True when a driver `message` carries a known deadlock signature
pub fn is_deadlock_message(message: &str) -> bool {
    matched_signature(message).is_some()
}

/// True for retryable deadlock errors. An exhausted [`WardenError::Deadlock`] is final.
pub fn is_deadlock_error(error: &WardenError) -> bool {
    classify(error).is_some()
}

/// Diagnostic produced by [`DeadlockRetryPolicy::analyze_deadlock`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadlockAnalysis {
    pub detected: bool,
    pub analysis: String,
    pub suggestions: Vec<String>,
    /// Matched signature, when detected
    pub signature: Option<String>,
}

/// Retries units of work that fail with a deadlock, backing off exponentially
#[derive(Debug, Clone)]
pub struct DeadlockRetryPolicy {
    config: DeadlockRetryConfig,
    metrics: LockMetrics,
}

impl Default for DeadlockRetryPolicy {
    fn default() -> Self {
        Self::new(DeadlockRetryConfig::default())
    }
}

impl DeadlockRetryPolicy {
    pub fn new(config: DeadlockRetryConfig) -> Self {
        Self {
            config,
            metrics: LockMetrics::new("deadlock"),
        }
    }

    pub fn config(&self) -> &DeadlockRetryConfig {
        &self.config
    }

    pub fn is_deadlock_error(&self, error: &WardenError) -> bool {
        is_deadlock_error(error)
    }

    /// Run `operation`, re-invoking it only while it fails with a deadlock.
    /// Gives up with [`WardenError::Deadlock`] after `max_retries + 1` invocations.
    pub async fn retry_on_deadlock<T, F, Fut>(&self, mut operation: F) -> WardenResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if !is_deadlock_error(&error) => return Err(error),
                Err(error) => {
                    self.backoff_or_fail(attempt, error).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Run `work` in a fresh transaction per attempt: commit on success, roll
    /// back on error, retry on deadlock
    pub async fn transaction_with_deadlock_retry<T, F, Fut>(
        &self,
        store: &dyn RelationalStore,
        mut work: F,
    ) -> WardenResult<T>
    where
        F: FnMut(Arc<dyn StoreTransaction>) -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let tx = store.begin().await?;
            let outcome = match work(Arc::clone(&tx)).await {
                Ok(value) => tx.commit().await.map(|_| value),
                Err(error) => {
                    if let Err(e) = tx.rollback().await {
                        debug!("Rollback of {} after failed attempt: {}", tx.id(), e);
                    }
                    Err(error)
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if !is_deadlock_error(&error) => return Err(error),
                Err(error) => {
                    debug!("Transaction {} deadlocked, starting a new one", tx.id());
                    self.backoff_or_fail(attempt, error).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn backoff_or_fail(&self, attempt: u32, error: WardenError) -> WardenResult<()> {
        self.metrics.record_contention();
        if attempt >= self.config.max_retries {
            self.metrics.record_failed();
            warn!(
                "Deadlock persisted after {} attempts: {}",
                attempt + 1,
                error
            );
            return Err(WardenError::Deadlock {
                attempts: attempt + 1,
                source: Box::new(error),
            });
        }

        let delay = self.config.delay_for(attempt);
        warn!(
            "Deadlock detected (attempt {}/{}), retrying in {:?}: {}",
            attempt + 1,
            self.config.max_retries + 1,
            delay,
            error
        );
        self.metrics.record_retry(delay);
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Best-effort diagnosis of a failure, with generic remediation advice
    pub fn analyze_deadlock(&self, error: &WardenError) -> DeadlockAnalysis {
        let (attempts, inner) = match error {
            WardenError::Deadlock { attempts, source } => (Some(*attempts), source.as_ref()),
            other => (None, other),
        };
        let message = inner.to_string();

        let Some((signature, engine)) = classify(inner) else {
            return DeadlockAnalysis {
                detected: false,
                analysis: "Not a deadlock error".to_string(),
                suggestions: Vec::new(),
                signature: None,
            };
        };

        let mut analysis = format!("Deadlock detected ({engine}, matched '{signature}'): {message}");
        if let Some(attempts) = attempts {
            analysis.push_str(&format!(". Persisted across {attempts} attempts"));
        }
        DeadlockAnalysis {
            detected: true,
            analysis,
            suggestions: REMEDIATIONS.iter().map(|s| s.to_string()).collect(),
            signature: Some(signature.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relational::{InMemoryDatabase, LockWait, RowLockMode};
    use serde_json::Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn no_jitter() -> DeadlockRetryPolicy {
        DeadlockRetryPolicy::new(DeadlockRetryConfig {
            jitter: false,
            ..Default::default()
        })
    }

    fn deadlock() -> WardenError {
        WardenError::database("40P01", "deadlock detected")
    }

    #[test]
    fn test_signatures_across_engines() {
        for message in [
            "ERROR: deadlock detected",
            "SQLSTATE 40P01",
            "ER_LOCK_DEADLOCK: Deadlock found when trying to get lock",
            "Error 1213: try restarting transaction",
            "ORA-00060: deadlock detected while waiting for resource",
            "could not serialize access due to concurrent update",
            "Transaction (Process ID 52) was deadlocked on lock resources",
        ] {
            assert!(is_deadlock_message(message), "{message}");
        }
        assert!(!is_deadlock_message("duplicate key value violates unique constraint"));
        assert!(!is_deadlock_message("SQLITE_BUSY: database is locked"));
        assert!(!is_deadlock_message("Failed to fetch orders 40001: pool timed out"));
        assert!(is_deadlock_error(&deadlock()));
        assert!(is_deadlock_error(&WardenError::database("40001", "could not serialize")));
        assert!(!is_deadlock_error(&WardenError::database("23505", "duplicate key")));
        assert!(!is_deadlock_error(&WardenError::Deadlock {
            attempts: 4,
            source: Box::new(deadlock()),
        }));
    }

    #[test]
    fn test_delay_schedule() {
        let config = DeadlockRetryConfig {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(10), Duration::from_secs(5));

        let jittered = DeadlockRetryConfig::default();
        for _ in 0..20 {
            let delay = jittered.delay_for(1);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_deadlock_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: WardenResult<()> = no_jitter()
            .retry_on_deadlock(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(WardenError::store("connection refused")) }
            })
            .await;
        assert!(matches!(result, Err(WardenError::Store(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_errors_with_deadlock_like_ids_are_not_retried() {
        let errors = [
            WardenError::RecordNotFound {
                entity: "students".to_string(),
                id: "40001".to_string(),
            },
            WardenError::OptimisticLock {
                entity: "deadlock".to_string(),
                id: "1213".to_string(),
                expected: 1,
                actual: 2,
            },
            WardenError::lock_unavailable("students:40P01", "deadlock detected elsewhere"),
            WardenError::distributed_lock("error 1205", "held"),
        ];

        for error in errors {
            let expected = error.to_string();
            let slot = Mutex::new(Some(error));
            let calls = AtomicU32::new(0);
            let result: WardenResult<()> = no_jitter()
                .retry_on_deadlock(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let error = slot
                        .lock()
                        .unwrap()
                        .take()
                        .unwrap_or_else(|| WardenError::internal("called twice"));
                    async move { Err(error) }
                })
                .await;
            assert_eq!(result.unwrap_err().to_string(), expected);
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{expected}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_max_retries_deadlocks() {
        let calls = AtomicU32::new(0);
        let result = no_jitter()
            .retry_on_deadlock(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(deadlock())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_deadlocking_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result: WardenResult<()> = no_jitter()
            .retry_on_deadlock(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(deadlock()) }
            })
            .await;

        match result {
            Err(WardenError::Deadlock { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert!(source.to_string().contains("40P01"));
            }
            other => panic!("expected deadlock error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transaction_retry_uses_fresh_transactions() {
        let db = InMemoryDatabase::new();
        db.insert("accounts", "1", Map::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = no_jitter()
            .transaction_with_deadlock_retry(&db, |tx| {
                let seen = Arc::clone(&seen);
                async move {
                    tx.lock_row("accounts", "1", RowLockMode::Exclusive, LockWait::NoWait)
                        .await?;
                    let attempt = {
                        let mut seen = seen.lock().unwrap();
                        seen.push(tx.id().to_string());
                        seen.len()
                    };
                    if attempt == 1 {
                        Err(deadlock())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        let seen = seen.lock().unwrap();
        assert_ne!(seen[0], seen[1]);
        assert!(db.row_lock_holders("accounts", "1").is_empty());
    }

    #[test]
    fn test_analyze_deadlock() {
        let policy = DeadlockRetryPolicy::default();

        let analysis = policy.analyze_deadlock(&deadlock());
        assert!(analysis.detected);
        assert_eq!(analysis.signature.as_deref(), Some("40P01"));
        assert!(analysis.analysis.contains("PostgreSQL"));
        assert_eq!(analysis.suggestions.len(), 5);

        let exhausted = WardenError::Deadlock {
            attempts: 4,
            source: Box::new(deadlock()),
        };
        assert!(policy.analyze_deadlock(&exhausted).analysis.contains("4 attempts"));

        let unrelated = policy.analyze_deadlock(&WardenError::timeout("fetch"));
        assert!(!unrelated.detected);
        assert!(unrelated.suggestions.is_empty());
    }
}
