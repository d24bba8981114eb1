//! Cache Warmer - Proactive Population at Startup
//!
//! Named loaders are registered once and run together by [`CacheWarmer::warm_up`].
//! Each loader runs as its own task, so the warm-up takes as long as the
//! slowest loader and one failing (or panicking) loader never affects the rest.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::traits::CacheBackend;

type Loader = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
struct WarmTask {
    loader: Loader,
    /// Lower runs first
    priority: i32,
    ttl: Option<Duration>,
}

pub struct CacheWarmer {
    cache: Arc<dyn CacheBackend>,
    tasks: Mutex<HashMap<String, WarmTask>>,
}

impl CacheWarmer {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            cache,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the loader for `name`
    ///
    /// A non-null result is stored under `name` with `ttl`. A `Value::Null`
    /// result counts as success and stores nothing.
    pub fn register<F, Fut>(&self, name: &str, priority: i32, ttl: Option<Duration>, loader: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let loader: Loader = Arc::new(move || loader().boxed());
        let replaced = self
            .tasks
            .lock()
            .insert(
                name.to_string(),
                WarmTask {
                    loader,
                    priority,
                    ttl,
                },
            )
            .is_some();
        debug!(task = %name, priority, replaced, "Registered warm-up task");
    }

    /// Returns whether a task with that name existed
    pub fn unregister(&self, name: &str) -> bool {
        self.tasks.lock().remove(name).is_some()
    }

    /// Registered task names in priority order
    pub fn task_names(&self) -> Vec<String> {
        let tasks = self.tasks.lock();
        let mut named: Vec<(&String, i32)> =
            tasks.iter().map(|(name, task)| (name, task.priority)).collect();
        named.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        named.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Run all registered loaders, or only those named in `subset`
    ///
    /// Loaders are started in ascending priority order and run concurrently.
    /// The result maps every selected name to whether its loader succeeded and
    /// its value was stored. Names in `subset` that are not registered map to
    /// `false`.
    pub async fn warm_up(&self, subset: Option<&[&str]>) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        let mut selected: Vec<(String, WarmTask)> = {
            let tasks = self.tasks.lock();
            match subset {
                None => tasks
                    .iter()
                    .map(|(name, task)| (name.clone(), task.clone()))
                    .collect(),
                Some(names) => names
                    .iter()
                    .filter_map(|name| match tasks.get(*name) {
                        Some(task) => Some(((*name).to_string(), task.clone())),
                        None => {
                            warn!(task = %name, "Unknown warm-up task requested");
                            results.insert((*name).to_string(), false);
                            None
                        }
                    })
                    .collect(),
            }
        };
        selected.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then_with(|| a.0.cmp(&b.0)));

        info!(tasks = selected.len(), "Starting cache warm-up");
        let started = Instant::now();

        let mut join_set = JoinSet::new();
        for (name, task) in selected {
            // Pre-seed as failed so a panicking loader still has an entry
            results.insert(name.clone(), false);
            let cache = Arc::clone(&self.cache);
            join_set.spawn(async move {
                let ok = run_task(cache.as_ref(), &name, &task).await;
                (name, ok)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, ok)) => {
                    results.insert(name, ok);
                }
                Err(e) => error!(error = %e, "Warm-up task panicked"),
            }
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        info!(
            succeeded,
            failed = results.len() - succeeded,
            elapsed_ms = started.elapsed().as_millis(),
            "Cache warm-up finished"
        );
        results
    }
}

async fn run_task(cache: &dyn CacheBackend, name: &str, task: &WarmTask) -> bool {
    let value = match (task.loader)().await {
        Ok(value) => value,
        Err(e) => {
            warn!(task = %name, error = %e, "Warm-up loader failed");
            return false;
        }
    };

    if value.is_null() {
        debug!(task = %name, "Warm-up loader returned nothing to store");
        return true;
    }

    match cache.set(name, value, task.ttl).await {
        Ok(true) => {
            debug!(task = %name, "Warmed cache key");
            true
        }
        Ok(false) => {
            warn!(task = %name, "Warm-up value not stored");
            false
        }
        Err(e) => {
            warn!(task = %name, error = %e, "Warm-up store failed");
            false
        }
    }
}
