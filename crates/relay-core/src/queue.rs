// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Runs submitted jobs one at a time in submission order.
///
/// Submission order is the order in which `enqueue` futures are first
/// polled. The underlying tokio mutex is fair, so waiters are admitted
/// strictly FIFO.
#[derive(Clone, Default)]
pub struct DispatchQueue {
    slot: Arc<Mutex<()>>,
    waiting: Arc<AtomicUsize>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue<F, T>(&self, job: F) -> T
    where
        F: Future<Output = T>,
    {
        let waiter = Waiter::new(&self.waiting);
        let _guard = self.slot.lock().await;
        drop(waiter);
        job.await
    }

    /// Jobs submitted but not yet started.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Counts one pending `enqueue`, including ones dropped before they start.
struct Waiter<'a>(&'a AtomicUsize);

impl<'a> Waiter<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("waiting", &self.waiting())
            .finish()
    }
}
