// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency task runner.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

/// Runs futures on the tokio runtime with at most `concurrency` of them
/// executing at the same time.
#[derive(Clone)]
pub struct WorkerPool {
    name: String,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            name: name.into(),
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fire-and-forget submission. Returns immediately; the task starts once a
    /// slot is free.
    pub fn submit<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            // The semaphore is never closed, so acquisition only fails on shutdown
            let _permit = semaphore.acquire_owned().await.ok();
            task.await
        })
    }

    /// Submit a batch and wait until every task in it has completed.
    /// Results come back in submission order.
    pub async fn submit_and_wait<I, F>(&self, tasks: I) -> Vec<Result<F::Output, JoinError>>
    where
        I: IntoIterator<Item = F>,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handles: Vec<_> = tasks.into_iter().map(|t| self.submit(t)).collect();
        debug!(
            "Worker pool '{}' waiting for {} task(s), concurrency {}",
            self.name,
            handles.len(),
            self.concurrency
        );
        join_all(handles).await
    }
}
