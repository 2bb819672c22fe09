//! Self-feeding producers built on the work queue.
//!
//! A producer seeds K lanes of work; every task it runs may discover and
//! push more (the next page, items still resolving). The underlying queue
//! declares Done once nothing is pending, in flight or waiting out a delay,
//! and the producer forwards that as its own `Done` notification.
//!
//! Collaborators are reached through [`WebtaskSource`] and [`ModuleSource`];
//! [`Deployment`](crate::deployment::Deployment) implements both.

pub mod cache;
pub mod download;
pub mod provision;

pub use cache::ModuleCache;
pub use download::{DownloaderOptions, WebtaskDownloader, WebtaskFilter};
pub use provision::{ModuleProvisioner, ProvisionerOptions};

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{Span, warn};

use crate::deployment::DownloadOptions;
use crate::engine::QueueObserver;
use crate::error::Result;
use crate::event::{EventBus, EventKind};
use crate::model::{Module, ModuleStatus, Webtask, WebtaskInfo};
use crate::telemetry::task::record_state_transition;

/// Pagination and detail source for webtask enumeration.
#[async_trait]
pub trait WebtaskSource: Send + Sync {
    /// One page of webtasks. A page shorter than `limit` is the last one.
    async fn list_page(
        &self,
        tenant: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<WebtaskInfo>>;

    /// Full webtask, or `None` if it no longer exists.
    async fn fetch_webtask(
        &self,
        tenant: &str,
        name: &str,
        options: &DownloadOptions,
    ) -> Result<Option<Webtask>>;
}

/// Batch submission for module provisioning.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// Submit `modules` and report the state of each.
    async fn submit_batch(
        &self,
        modules: &[Module],
        tenant: Option<&str>,
    ) -> Result<Vec<ModuleStatus>>;
}

/// Notification side of a producer: event fan-out plus the error log.
///
/// Installed as the queue observer, so failed tasks and the drain signal
/// arrive here.
pub(crate) struct Reporter<T> {
    kind: &'static str,
    events: EventBus<T>,
    errors: Mutex<Vec<String>>,
    span: Span,
}

impl<T: Clone> Reporter<T> {
    pub(crate) fn new(kind: &'static str, span: Span) -> Self {
        Self {
            kind,
            events: EventBus::new(),
            errors: Mutex::new(Vec::new()),
            span,
        }
    }

    pub(crate) fn events(&self) -> &EventBus<T> {
        &self.events
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn succeeded(&self, item: T) {
        self.events.emit(EventKind::ItemSucceeded { item });
    }

    pub(crate) fn failed(&self, item: T) {
        self.events.emit(EventKind::ItemFailed { item });
    }

    pub(crate) fn error(&self, message: String) {
        self.span.in_scope(|| warn!(producer = self.kind, %message, "producer error"));
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        self.events.emit(EventKind::Error { message });
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Clone + Send + Sync> QueueObserver for Reporter<T> {
    fn task_failed(&self, _task: &'static str, error: &anyhow::Error) {
        self.error(format!("{error:#}"));
    }

    fn drained(&self) {
        record_state_transition(&self.span, "running", "done");
        self.events.emit(EventKind::Done);
    }
}
