//! Webtask enumeration and download.
//!
//! K listing lanes page through the deployment at a shared offset. Every
//! webtask found becomes its own download (and optional analysis) task on
//! the same queue. The first short page ends pagination for all lanes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use opentelemetry::KeyValue;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, info};
use uuid::Uuid;

use super::{Reporter, WebtaskSource};
use crate::analysis::Analyzer;
use crate::deployment::{DownloadOptions, MAX_LIST_LIMIT};
use crate::engine::{Completion, EngineState, Task, WorkQueue};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::model::WebtaskInfo;
use crate::telemetry::metrics;
use crate::telemetry::task::start_producer_span;

/// Decides whether an enumerated webtask is downloaded.
pub type WebtaskFilter = Arc<dyn Fn(&WebtaskInfo) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Clone)]
pub struct DownloaderOptions {
    /// Restrict enumeration to one tenant.
    pub tenant: Option<String>,
    /// Only enumerate; skip download and analysis.
    pub names_only: bool,
    pub download: DownloadOptions,
    pub analyzer: Option<Arc<dyn Analyzer>>,
    pub filter: Option<WebtaskFilter>,
    /// Concurrent lanes. Usually the dispatcher's `max_concurrent`.
    pub lanes: usize,
    pub page_size: usize,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            tenant: None,
            names_only: false,
            download: DownloadOptions::default(),
            analyzer: None,
            filter: None,
            lanes: 10,
            page_size: MAX_LIST_LIMIT,
        }
    }
}

struct DownloadRun {
    source: Arc<dyn WebtaskSource>,
    options: DownloaderOptions,
    queue: WorkQueue,
    reporter: Arc<Reporter<WebtaskInfo>>,
    webtasks: Mutex<Vec<WebtaskInfo>>,
    next_page: AtomicUsize,
    pagination_done: AtomicBool,
    started: AtomicBool,
}

/// Enumerates webtasks and downloads each one.
#[derive(Clone)]
pub struct WebtaskDownloader {
    run: Arc<DownloadRun>,
}

impl WebtaskDownloader {
    pub fn new(source: Arc<dyn WebtaskSource>, options: DownloaderOptions) -> Result<Self> {
        if options.page_size == 0 || options.page_size > MAX_LIST_LIMIT {
            return Err(Error::Validation(format!(
                "page_size must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }

        let span = start_producer_span("download", &Uuid::new_v4());
        let reporter = Arc::new(Reporter::new("download", span));
        let queue =
            WorkQueue::with_observer("download", options.lanes, Completion::OnDrain, reporter.clone())?;

        Ok(Self {
            run: Arc::new(DownloadRun {
                source,
                options,
                queue,
                reporter,
                webtasks: Mutex::new(Vec::new()),
                next_page: AtomicUsize::new(0),
                pagination_done: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Seed the listing lanes and start. Resumes a paused run; otherwise a
    /// no-op after the first call.
    pub fn download(&self) -> Result<()> {
        let run = &self.run;
        if run.started.swap(true, Ordering::AcqRel) {
            if run.queue.state() == EngineState::Paused {
                return run.queue.resume();
            }
            return Ok(());
        }

        run.reporter.span().in_scope(|| {
            info!(
                tenant = run.options.tenant.as_deref().unwrap_or("*"),
                lanes = run.queue.lanes(),
                names_only = run.options.names_only,
                "enumerating webtasks"
            );
        });
        for _ in 0..run.queue.lanes() {
            run.queue.push(list_task(Arc::clone(run)));
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

    pub fn subscribe(&self) -> broadcast::Receiver<Event<WebtaskInfo>> {
        self.run.reporter.events().subscribe()
    }

    /// Resolves once every page is listed and every download has finished.
    pub async fn wait(&self) {
        self.run.queue.wait().await;
    }

    /// Snapshot of the webtasks processed so far.
    pub fn webtasks(&self) -> Vec<WebtaskInfo> {
        self.run
            .webtasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the errors reported so far.
    pub fn errors(&self) -> Vec<String> {
        self.run.reporter.errors()
    }
}

fn list_task(run: Arc<DownloadRun>) -> Task {
    let span = run.reporter.span().clone();
    Task::new(
        "list-webtasks",
        async move {
            if run.pagination_done.load(Ordering::Acquire) {
                return Ok(());
            }

            let page_size = run.options.page_size;
            let page = run.next_page.fetch_add(1, Ordering::AcqRel);
            let offset = page * page_size;

            let infos = match run
                .source
                .list_page(run.options.tenant.as_deref(), offset, page_size)
                .await
            {
                Ok(infos) => infos,
                Err(error) => {
                    // Listing cannot skip a page safely; stop and report.
                    run.pagination_done.store(true, Ordering::Release);
                    return Err(error).context(format!("listing webtasks at offset {offset}"));
                }
            };

            let last_page = infos.len() < page_size;
            debug!(offset, found = infos.len(), "page listed");

            for info in infos {
                let keep = match &run.options.filter {
                    None => true,
                    Some(filter) => filter(&info).unwrap_or_else(|error| {
                        // Reported, and the webtask is kept.
                        run.reporter.error(format!(
                            "filter failed for {}/{}: {error:#}",
                            info.tenant, info.name
                        ));
                        true
                    }),
                };
                if !keep {
                    metrics::webtasks_enumerated().add(1, &[KeyValue::new("result", "skipped")]);
                    continue;
                }
                run.queue.push(download_task(Arc::clone(&run), info));
            }

            if last_page {
                if !run.pagination_done.swap(true, Ordering::AcqRel) {
                    info!(pages = page + 1, "pagination exhausted");
                }
            } else {
                run.queue.push(list_task(Arc::clone(&run)));
            }
            Ok(())
        }
        .instrument(span),
    )
}

fn download_task(run: Arc<DownloadRun>, mut info: WebtaskInfo) -> Task {
    let span = run.reporter.span().clone();
    Task::new(
        "download-webtask",
        async move {
            if !run.options.names_only {
                let fetched = run
                    .source
                    .fetch_webtask(&info.tenant, &info.name, &run.options.download)
                    .await;
                let webtask = match fetched {
                    Ok(Some(webtask)) => webtask,
                    Ok(None) => {
                        debug!(tenant = %info.tenant, name = %info.name, "webtask gone before download");
                        metrics::webtasks_enumerated().add(1, &[KeyValue::new("result", "skipped")]);
                        return Ok(());
                    }
                    Err(error) => {
                        metrics::webtasks_enumerated().add(1, &[KeyValue::new("result", "error")]);
                        return Err(error.into());
                    }
                };

                if let Some(analyzer) = &run.options.analyzer {
                    let analysis = analyzer
                        .analyze(&webtask)
                        .await
                        .with_context(|| format!("analyzing webtask {}/{}", info.tenant, info.name))?;
                    info.analysis = Some(analysis);
                }
                info.webtask = Some(webtask);
            }

            metrics::webtasks_enumerated().add(1, &[KeyValue::new("result", "downloaded")]);
            run.webtasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(info.clone());
            run.reporter.succeeded(info);
            Ok(())
        }
        .instrument(span),
    )
}
