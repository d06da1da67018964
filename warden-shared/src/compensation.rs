//! Compensating transactions: best-effort undo of completed forward steps
//!
//! Each forward operation that succeeds pushes its compensation. Rollback
//! runs the compensations newest first and keeps going past failures.

use crate::exception::{WardenError, WardenResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A forward action paired with the action that undoes it
#[async_trait]
pub trait CompensableOperation: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self) -> WardenResult<()>;

    async fn compensate(&self) -> WardenResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for CompensationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CompensationState::Active => "active",
            CompensationState::Committed => "committed",
            CompensationState::RolledBack => "rolled back",
        };
        f.write_str(label)
    }
}

/// What a rollback managed to undo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Operation names compensated, in the order compensation ran
    pub compensated: Vec<String>,
    /// Operation names whose compensation failed, with the error text
    pub failed: Vec<(String, String)>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Inner {
    state: CompensationState,
    completed: Vec<Arc<dyn CompensableOperation>>,
}

pub struct CompensatingTransaction {
    id: String,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CompensatingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensatingTransaction")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Default for CompensatingTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl CompensatingTransaction {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(Inner {
                state: CompensationState::Active,
                completed: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn state(&self) -> CompensationState {
        self.inner.lock().await.state
    }

    /// Number of forward operations that would be compensated on rollback
    pub async fn completed_count(&self) -> usize {
        self.inner.lock().await.completed.len()
    }

    fn closed(&self, state: CompensationState) -> WardenError {
        WardenError::TransactionClosed {
            id: self.id.clone(),
            state: state.to_string(),
        }
    }

    /// Run `operation` forward; only successful operations are compensated later.
    /// Operations run one at a time.
    pub async fn execute(&self, operation: Arc<dyn CompensableOperation>) -> WardenResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != CompensationState::Active {
            return Err(self.closed(inner.state));
        }

        operation.execute().await?;
        debug!("{}: executed {}", self.id, operation.name());
        inner.completed.push(operation);
        Ok(())
    }

    pub async fn commit(&self) -> WardenResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != CompensationState::Active {
            return Err(self.closed(inner.state));
        }
        inner.state = CompensationState::Committed;
        inner.completed.clear();
        info!("Compensating transaction {} committed", self.id);
        Ok(())
    }

    /// Compensate every completed operation in reverse order
    pub async fn rollback(&self) -> WardenResult<RollbackReport> {
        let mut inner = self.inner.lock().await;
        if inner.state != CompensationState::Active {
            return Err(self.closed(inner.state));
        }
        inner.state = CompensationState::RolledBack;

        let mut report = RollbackReport::default();
        for operation in inner.completed.drain(..).rev() {
            match operation.compensate().await {
                Ok(()) => {
                    debug!("{}: compensated {}", self.id, operation.name());
                    report.compensated.push(operation.name().to_string());
                }
                Err(e) => {
                    warn!(
                        "{}: compensation of {} failed: {}",
                        self.id,
                        operation.name(),
                        e
                    );
                    report
                        .failed
                        .push((operation.name().to_string(), e.to_string()));
                }
            }
        }

        info!(
            "Compensating transaction {} rolled back ({} compensated, {} failed)",
            self.id,
            report.compensated.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Step {
        name: String,
        journal: Arc<StdMutex<Vec<String>>>,
        fail_forward: bool,
        fail_compensate: bool,
    }

    impl Step {
        fn new(name: &str, journal: &Arc<StdMutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                journal: Arc::clone(journal),
                fail_forward: false,
                fail_compensate: false,
            }
        }
    }

    #[async_trait]
    impl CompensableOperation for Step {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self) -> WardenResult<()> {
            if self.fail_forward {
                return Err(WardenError::internal(format!("{} refused", self.name)));
            }
            self.journal.lock().unwrap().push(format!("do {}", self.name));
            Ok(())
        }

        async fn compensate(&self) -> WardenResult<()> {
            if self.fail_compensate {
                return Err(WardenError::store("undo unavailable"));
            }
            self.journal.lock().unwrap().push(format!("undo {}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rollback_runs_in_reverse_and_survives_failures() {
        let journal = Arc::new(StdMutex::new(Vec::new()));
        let tx = CompensatingTransaction::with_id("enrol-42");

        tx.execute(Arc::new(Step::new("reserve seat", &journal))).await.unwrap();
        tx.execute(Arc::new(Step {
            fail_compensate: true,
            ..Step::new("charge fee", &journal)
        }))
        .await
        .unwrap();
        tx.execute(Arc::new(Step::new("send email", &journal))).await.unwrap();

        let failed_forward = tx
            .execute(Arc::new(Step {
                fail_forward: true,
                ..Step::new("issue badge", &journal)
            }))
            .await;
        assert!(failed_forward.is_err());
        assert_eq!(tx.completed_count().await, 3);

        let report = tx.rollback().await.unwrap();
        assert_eq!(report.compensated, vec!["send email", "reserve seat"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "charge fee");
        assert!(!report.is_clean());

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "do reserve seat",
                "do charge fee",
                "do send email",
                "undo send email",
                "undo reserve seat",
            ]
        );
        assert_eq!(tx.state().await, CompensationState::RolledBack);
    }

    #[tokio::test]
    async fn test_committed_transaction_rejects_more_work() {
        let journal = Arc::new(StdMutex::new(Vec::new()));
        let tx = CompensatingTransaction::new();
        tx.execute(Arc::new(Step::new("reserve seat", &journal))).await.unwrap();
        tx.commit().await.unwrap();

        let err = tx
            .execute(Arc::new(Step::new("late step", &journal)))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::TransactionClosed { .. }));
        assert!(tx.rollback().await.is_err());
        assert!(tx.commit().await.is_err());
        assert_eq!(*journal.lock().unwrap(), vec!["do reserve seat"]);
    }
}
