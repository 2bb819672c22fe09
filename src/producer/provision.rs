//! Node module provisioning.
//!
//! Modules are submitted in batches. Each member of a batch comes back
//! available, failed, or still resolving; the last kind, and any member the
//! response leaves out, is re-queued for a later batch. A lane that re-queued `n` members waits `n * per_item_delay`
//! before its next submission, so polling slows down in proportion to the
//! work still outstanding.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use opentelemetry::KeyValue;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use super::{ModuleCache, ModuleSource, Reporter};
use crate::deployment::MAX_PROVISION_BATCH;
use crate::engine::{Completion, EngineState, Task, WorkQueue};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::model::{Module, ModuleState};
use crate::telemetry::metrics;
use crate::telemetry::task::start_producer_span;

#[derive(Debug, Clone)]
pub struct ProvisionerOptions {
    pub tenant: Option<String>,
    /// Concurrent batch lanes.
    pub lanes: usize,
    /// Modules per submission.
    pub batch_limit: usize,
    /// Backoff per still-resolving module before the next submission.
    pub per_item_delay: Duration,
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self {
            tenant: None,
            lanes: 10,
            batch_limit: 25,
            per_item_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct Tallies {
    queued: VecDeque<Module>,
    available: Vec<Module>,
    failed: Vec<Module>,
}

struct ProvisionRun {
    source: Arc<dyn ModuleSource>,
    options: ProvisionerOptions,
    modules: Vec<Module>,
    cache: ModuleCache,
    queue: WorkQueue,
    reporter: Arc<Reporter<Module>>,
    tallies: Mutex<Tallies>,
    started: AtomicBool,
}

impl ProvisionRun {
    fn tallies(&self) -> MutexGuard<'_, Tallies> {
        self.tallies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_available(&self, module: Module, cached: bool) {
        self.cache.insert(&module);
        self.tallies().available.push(module.clone());
        metrics::modules_provisioned().add(
            1,
            &[KeyValue::new("result", if cached { "cached" } else { "available" })],
        );
        self.reporter.succeeded(module);
    }

    fn on_failed(&self, module: Module) {
        self.tallies().failed.push(module.clone());
        metrics::modules_provisioned().add(1, &[KeyValue::new("result", "failed")]);
        self.reporter.failed(module);
    }
}

/// Provisions a list of modules on a deployment.
#[derive(Clone)]
pub struct ModuleProvisioner {
    run: Arc<ProvisionRun>,
}

impl ModuleProvisioner {
    pub fn new(
        source: Arc<dyn ModuleSource>,
        modules: Vec<Module>,
        cache: ModuleCache,
        options: ProvisionerOptions,
    ) -> Result<Self> {
        for module in &modules {
            module.validate()?;
        }
        if options.batch_limit == 0 || options.batch_limit > MAX_PROVISION_BATCH {
            return Err(Error::Validation(format!(
                "batch_limit must be between 1 and {MAX_PROVISION_BATCH}"
            )));
        }
        if let Some(tenant) = &options.tenant {
            if tenant.is_empty() {
                return Err(Error::Validation("tenant name must not be empty".to_string()));
            }
        }

        let span = start_producer_span("provision", &Uuid::new_v4());
        let reporter = Arc::new(Reporter::new("provision", span));
        let queue =
            WorkQueue::with_observer("provision", options.lanes, Completion::OnDrain, reporter.clone())?;

        Ok(Self {
            run: Arc::new(ProvisionRun {
                source,
                options,
                modules,
                cache,
                queue,
                reporter,
                tallies: Mutex::new(Tallies::default()),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Resolve cached modules, queue the rest and start the batch lanes.
    /// Later calls are no-ops.
    pub fn provision(&self) -> Result<()> {
        let run = &self.run;
        if run.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut cached = 0usize;
        for module in &run.modules {
            if run.cache.contains(module) {
                cached += 1;
                run.on_available(module.clone(), true);
            } else {
                run.tallies().queued.push_back(module.clone());
            }
        }

        run.reporter.span().in_scope(|| {
            info!(
                modules = run.modules.len(),
                cached,
                lanes = run.queue.lanes(),
                "provisioning modules"
            );
        });
        for _ in 0..run.queue.lanes() {
            run.queue.push(batch_task(Arc::clone(run)));
        }
        run.queue.start()
    }

    pub fn pause(&self) -> Result<()> {
        self.run.queue.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.run.queue.resume()
    }

    pub fn state(&self) -> EngineState {
        self.run.queue.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<Module>> {
        self.run.reporter.events().subscribe()
    }

    /// Resolves once every module is available or failed.
    pub async fn wait(&self) {
        self.run.queue.wait().await;
    }

    pub fn available(&self) -> Vec<Module> {
        self.run.tallies().available.clone()
    }

    pub fn failed(&self) -> Vec<Module> {
        self.run.tallies().failed.clone()
    }

    /// Modules waiting for their next batch. Members of a batch currently
    /// being submitted are not included.
    pub fn still_queued(&self) -> Vec<Module> {
        self.run.tallies().queued.iter().cloned().collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.run.reporter.errors()
    }
}

fn batch_task(run: Arc<ProvisionRun>) -> Task {
    let span = run.reporter.span().clone();
    Task::new(
        "provision-batch",
        async move {
            let batch: Vec<Module> = {
                let mut tallies = run.tallies();
                let take = run.options.batch_limit.min(tallies.queued.len());
                tallies.queued.drain(..take).collect()
            };
            // Nothing left for this lane; other lanes own the rest.
            if batch.is_empty() {
                return Ok(());
            }

            let submitted = run
                .source
                .submit_batch(&batch, run.options.tenant.as_deref())
                .await;

            let statuses = match submitted {
                Ok(statuses) => statuses,
                Err(error) => {
                    for module in batch.iter().cloned() {
                        run.on_failed(module);
                    }
                    run.queue.push(batch_task(Arc::clone(&run)));
                    return Err(error).context(format!("provisioning a batch of {}", batch.len()));
                }
            };

            let mut unreported: HashSet<Module> = batch.iter().cloned().collect();
            let mut still_queued = 0u32;
            for status in statuses {
                let module = status.module();
                if !unreported.remove(&module) {
                    warn!(module = %module, "batch response reports an unexpected module");
                    continue;
                }
                match status.state {
                    ModuleState::Available => run.on_available(module, false),
                    ModuleState::Failed => run.on_failed(module),
                    ModuleState::Queued => {
                        still_queued += 1;
                        run.tallies().queued.push_back(module);
                    }
                }
            }

            // Members the response left out are still unresolved.
            if !unreported.is_empty() {
                warn!(unreported = unreported.len(), "batch response does not cover every module");
                for module in batch.iter().filter(|m| unreported.contains(*m)) {
                    still_queued += 1;
                    run.tallies().queued.push_back(module.clone());
                }
            }

            let next = batch_task(Arc::clone(&run));
            if still_queued > 0 {
                let delay = run.options.per_item_delay.saturating_mul(still_queued);
                debug!(still_queued, delay_ms = delay.as_millis() as u64, "batch still resolving");
                run.queue.defer(delay, next);
            } else {
                run.queue.push(next);
            }
            Ok(())
        }
        .instrument(span),
    )
}
