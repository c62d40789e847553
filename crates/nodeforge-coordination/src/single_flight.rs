//! Single-flight execution of keyed work.
//!
//! The first caller for a key becomes the leader and runs the work; callers
//! arriving while it is in flight wait on a watch channel and receive a
//! clone of the leader's result. The entry is removed as soon as the leader
//! finishes or is dropped, so later callers start a fresh execution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::error::CoordinationError;

type Outcome<T, E> = Option<Result<T, E>>;

pub struct TaskCoordinator<T, E> {
    in_flight: Mutex<HashMap<String, watch::Receiver<Outcome<T, E>>>>,
}

impl<T, E> Default for TaskCoordinator<T, E> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<T, E> {
    Leader(watch::Sender<Outcome<T, E>>),
    Joiner(watch::Receiver<Outcome<T, E>>),
}

impl<T, E> TaskCoordinator<T, E>
where
    T: Clone,
    E: Clone + From<CoordinationError>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run `work` under `key`, or join the execution already in flight for
    /// it. Every caller observes the same result or error.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let role = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(key) {
                Some(rx) => Role::Joiner(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Joiner(mut rx) => {
                debug!(key, "joining in-flight task");
                match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome
                        .clone()
                        .unwrap_or_else(|| Err(abandoned(key))),
                    Err(_) => Err(abandoned(key)),
                }
            }
            Role::Leader(tx) => {
                let _entry = RemoveOnDrop {
                    in_flight: &self.in_flight,
                    key,
                };
                let result = work().await;
                tx.send_replace(Some(result.clone()));
                result
            }
        }
    }
}

fn abandoned<E: From<CoordinationError>>(key: &str) -> E {
    E::from(CoordinationError::Abandoned {
        key: key.to_string(),
    })
}

struct RemoveOnDrop<'a, T, E> {
    in_flight: &'a Mutex<HashMap<String, watch::Receiver<Outcome<T, E>>>>,
    key: &'a str,
}

impl<T, E> Drop for RemoveOnDrop<'_, T, E> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
    }
}
