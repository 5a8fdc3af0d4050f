//! At most one in-flight computation per key.
//!
//! The first caller for a key runs its future; callers arriving while it is
//! running wait on the same cell and receive a clone of its result. The
//! entry is removed once the flight completes, so a later call starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

pub struct Singleflight<T> {
    flights: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a flight for the same key is already running,
    /// in which case wait for it and return its output instead.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let flight = {
            let mut map = self.flights.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.to_string()).or_default())
        };

        let output = flight.get_or_init(work).await.clone();
        self.release(key, &flight);
        output
    }

    /// Number of keys with a flight currently registered.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, key: &str, flight: &Arc<OnceCell<T>>) {
        let mut map = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(key) {
            if Arc::ptr_eq(existing, flight) {
                map.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let flights = Arc::new(Singleflight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flights
                    .run("same-key", || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let flights = Singleflight::<u32>::new();
        let a = flights.run("k", || async { 1 }).await;
        let b = flights.run("k", || async { 2 }).await;
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let flights = Singleflight::<&'static str>::new();
        let (a, b) = tokio::join!(
            flights.run("a", || async { "a" }),
            flights.run("b", || async { "b" })
        );
        assert_eq!((a, b), ("a", "b"));
    }
}
