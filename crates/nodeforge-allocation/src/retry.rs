//! Explicit wrappers around guarded operations: retried isolated
//! transactions and elapsed-time logging.

use std::future::Future;
use std::time::Instant;

use tracing::{debug, warn};

use nodeforge_core::RetryPolicy;
use nodeforge_state::{Persistence, Transaction};

use crate::error::{AllocationError, AllocationResult, StateResultExt};

/// Run `attempt` in a fresh transaction and commit it, retrying from scratch
/// whenever the transaction loses an optimistic conflict.
///
/// `attempt` is synchronous so the transaction never lives across a
/// suspension point; the backoff sleep happens after it has been dropped.
/// Any other error rolls the transaction back and is returned as-is.
pub async fn run_in_transaction<T, F>(
    persistence: &dyn Persistence,
    policy: RetryPolicy,
    operation: &'static str,
    subject: &str,
    mut attempt: F,
) -> AllocationResult<T>
where
    F: FnMut(&mut Transaction) -> AllocationResult<T>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match execute_once(persistence, subject, &mut attempt) {
            Err(e) if e.is_conflict() && attempts < policy.max_attempts => {
                let delay = policy.backoff(attempts);
                debug!(operation, subject, attempts, ?delay, "transaction conflicted, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_conflict() => {
                warn!(operation, subject, attempts, "transaction retries exhausted");
                return Err(AllocationError::RetriesExhausted {
                    operation,
                    node: subject.to_string(),
                    attempts,
                });
            }
            result => return result,
        }
    }
}

fn execute_once<T, F>(persistence: &dyn Persistence, subject: &str, attempt: &mut F) -> AllocationResult<T>
where
    F: FnMut(&mut Transaction) -> AllocationResult<T>,
{
    let mut txn = persistence.begin().for_node(subject)?;
    match attempt(&mut txn) {
        Ok(value) => {
            persistence.commit(txn).for_node(subject)?;
            Ok(value)
        }
        Err(e) => {
            txn.rollback();
            Err(e)
        }
    }
}

/// Await `operation`, logging how long it took.
pub async fn timed<F: Future>(operation: &'static str, subject: &str, future: F) -> F::Output {
    let started = Instant::now();
    let output = future.await;
    debug!(
        operation,
        subject,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "operation finished"
    );
    output
}

#[cfg(test)]
mod tests {
    use nodeforge_state::{ComputerSystem, Health, PowerState, StateStore};

    use super::*;

    fn system(id: &str) -> ComputerSystem {
        ComputerSystem {
            id: id.to_string(),
            service_id: "chassis-1".to_string(),
            name: id.to_string(),
            health: Health::Ok,
            power_state: PowerState::Off,
            owner: None,
        }
    }

    #[tokio::test]
    async fn commits_successful_attempt() {
        let store = StateStore::open_in_memory().unwrap();

        let value = run_in_transaction(&store, RetryPolicy::immediate(3), "test", "sys-1", |txn| {
            txn.put(&system("sys-1")).for_node("sys-1")?;
            Ok(7)
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert!(store.get::<ComputerSystem>("sys-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_attempt_is_rolled_back_without_retry() {
        let store = StateStore::open_in_memory().unwrap();
        let mut calls = 0;

        let err = run_in_transaction(&store, RetryPolicy::immediate(3), "test", "sys-1", |txn| {
            calls += 1;
            txn.put(&system("sys-1")).for_node("sys-1")?;
            Err::<(), _>(AllocationError::NodeNotFound("n-1".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AllocationError::NodeNotFound(_)));
        assert_eq!(calls, 1);
        assert!(store.get::<ComputerSystem>("sys-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn timed_returns_inner_output() {
        assert_eq!(timed("test", "x", async { 5 }).await, 5);
    }
}
