//! Integration tests for the module provisioner against a scripted source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use webtask_migrate::engine::EngineState;
use webtask_migrate::error::{Error, Result};
use webtask_migrate::event::EventKind;
use webtask_migrate::model::{Module, ModuleState, ModuleStatus};
use webtask_migrate::producer::{ModuleCache, ModuleProvisioner, ModuleSource, ProvisionerOptions};

/// Reports a scripted sequence of states per module; the last one repeats.
/// Unscripted modules are available right away. A partial source reports
/// only the first member of each batch.
#[derive(Default)]
struct ScriptedModules {
    partial: bool,
    states: Mutex<HashMap<String, Vec<ModuleState>>>,
    seen: Mutex<HashMap<String, usize>>,
    batches: Mutex<Vec<Vec<Module>>>,
    failing_submissions: Mutex<usize>,
}

impl ScriptedModules {
    fn script(self, name: &str, states: &[ModuleState]) -> Self {
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), states.to_vec());
        self
    }

    fn failing(self, submissions: usize) -> Self {
        *self.failing_submissions.lock().unwrap() = submissions;
        self
    }

    fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    fn batches(&self) -> Vec<Vec<Module>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleSource for ScriptedModules {
    async fn submit_batch(
        &self,
        modules: &[Module],
        _tenant: Option<&str>,
    ) -> Result<Vec<ModuleStatus>> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.batches.lock().unwrap().push(modules.to_vec());

        {
            let mut failing = self.failing_submissions.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(Error::Other("deployment unavailable".to_string()));
            }
        }

        let states = self.states.lock().unwrap();
        let mut seen = self.seen.lock().unwrap();
        let reported = if self.partial { &modules[..1] } else { modules };
        Ok(reported
            .iter()
            .map(|module| {
                let count = seen.entry(module.name.clone()).or_insert(0);
                let state = match states.get(&module.name) {
                    Some(script) => script[(*count).min(script.len() - 1)],
                    None => ModuleState::Available,
                };
                *count += 1;
                ModuleStatus {
                    name: module.name.clone(),
                    version: module.version.clone(),
                    state,
                }
            })
            .collect())
    }
}

fn options(lanes: usize) -> ProvisionerOptions {
    ProvisionerOptions {
        lanes,
        ..ProvisionerOptions::default()
    }
}

fn modules(names: &[&str]) -> Vec<Module> {
    names.iter().map(|name| Module::new(*name, "1.0.0")).collect()
}

// ---------------------------------------------------------------------------
// Batch resubmission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn still_resolving_module_is_resubmitted_with_backoff() {
    let source = Arc::new(ScriptedModules::default().script(
        "lodash",
        &[ModuleState::Queued, ModuleState::Queued, ModuleState::Available],
    ));
    let provisioner = ModuleProvisioner::new(
        source.clone(),
        modules(&["lodash"]),
        ModuleCache::new(),
        options(1),
    )
    .unwrap();
    let started = Instant::now();

    provisioner.provision().unwrap();
    provisioner.wait().await;

    assert_eq!(provisioner.available(), modules(&["lodash"]));
    assert!(provisioner.failed().is_empty());
    assert!(provisioner.still_queued().is_empty());
    assert_eq!(source.batches().len(), 3);
    // Two rounds of one still-resolving module at 100ms each.
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(provisioner.state(), EngineState::Done);
}

#[tokio::test(start_paused = true)]
async fn modules_left_out_of_a_response_are_resubmitted() {
    let source = Arc::new(ScriptedModules::default().partial());
    let provisioner = ModuleProvisioner::new(
        source.clone(),
        modules(&["a", "b", "c"]),
        ModuleCache::new(),
        options(1),
    )
    .unwrap();
    let mut events = provisioner.subscribe();

    provisioner.provision().unwrap();
    tokio::time::sleep(Duration::from_millis(6)).await;
    // After the first response: one module resolved, the other two wait.
    assert_eq!(provisioner.available(), modules(&["a"]));
    assert_eq!(provisioner.still_queued(), modules(&["b", "c"]));

    provisioner.wait().await;

    assert_eq!(provisioner.available(), modules(&["a", "b", "c"]));
    assert!(provisioner.failed().is_empty());
    assert!(provisioner.still_queued().is_empty());
    assert_eq!(
        source.batches(),
        vec![modules(&["a", "b", "c"]), modules(&["b", "c"]), modules(&["c"])]
    );

    let mut succeeded = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event.kind, EventKind::ItemSucceeded { .. }) {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 3);
}

#[tokio::test(start_paused = true)]
async fn huge_per_item_delay_saturates_instead_of_overflowing() {
    let source = Arc::new(
        ScriptedModules::default()
            .script("pending", &[ModuleState::Queued, ModuleState::Available])
            .script("waiting", &[ModuleState::Queued, ModuleState::Available]),
    );
    let provisioner = ModuleProvisioner::new(
        source.clone(),
        modules(&["pending", "waiting", "other"]),
        ModuleCache::new(),
        ProvisionerOptions {
            per_item_delay: Duration::MAX,
            ..options(1)
        },
    )
    .unwrap();

    provisioner.provision().unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(provisioner.state(), EngineState::Running);
    assert!(provisioner.errors().is_empty());
    assert_eq!(provisioner.available(), modules(&["other"]));
    assert_eq!(provisioner.still_queued(), modules(&["pending", "waiting"]));
    assert_eq!(source.batches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn batches_respect_the_batch_limit() {
    let source = Arc::new(ScriptedModules::default());
    let provisioner = ModuleProvisioner::new(
        source.clone(),
        modules(&["a", "b", "c", "d", "e", "f", "g"]),
        ModuleCache::new(),
        ProvisionerOptions {
            batch_limit: 3,
            ..options(1)
        },
    )
    .unwrap();

    provisioner.provision().unwrap();
    provisioner.wait().await;

    let sizes: Vec<usize> = source.batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(provisioner.available().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn lanes_share_the_queued_modules() {
    let source = Arc::new(ScriptedModules::default().script(
        "slow",
        &[ModuleState::Queued, ModuleState::Available],
    ));
    let provisioner = ModuleProvisioner::new(
        source.clone(),
        modules(&["a", "b", "slow", "c", "d"]),
        ModuleCache::new(),
        ProvisionerOptions {
            batch_limit: 2,
            ..options(3)
        },
    )
    .unwrap();

    provisioner.provision().unwrap();
    provisioner.wait().await;

    let mut available = provisioner.available();
    available.sort();
    assert_eq!(available, modules(&["a", "b", "c", "d", "slow"]));

    // Every module submitted once, plus the resubmission of "slow".
    let submitted: usize = source.batches().iter().map(Vec::len).sum();
    assert_eq!(submitted, 6);
}

#[tokio::test(start_paused = true)]
async fn failed_modules_are_reported_as_failed() {
    let source = Arc::new(
        ScriptedModules::default().script("broken", &[ModuleState::Failed]),
    );
    let provisioner = ModuleProvisioner::new(
        source,
        modules(&["broken", "fine"]),
        ModuleCache::new(),
        options(2),
    )
    .unwrap();
    let mut events = provisioner.subscribe();

    provisioner.provision().unwrap();
    provisioner.wait().await;

    assert_eq!(provisioner.failed(), modules(&["broken"]));
    assert_eq!(provisioner.available(), modules(&["fine"]));

    let mut failed = Vec::new();
    let mut done = 0;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            EventKind::ItemFailed { item } => failed.push(item),
            EventKind::Done => done += 1,
            _ => {}
        }
    }
    assert_eq!(failed, modules(&["broken"]));
    assert_eq!(done, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_submission_fails_the_batch_and_reports_an_error() {
    let source = Arc::new(ScriptedModules::default().failing(1));
    let provisioner = ModuleProvisioner::new(
        source.clone(),
        modules(&["a", "b", "c"]),
        ModuleCache::new(),
        ProvisionerOptions {
            batch_limit: 2,
            ..options(1)
        },
    )
    .unwrap();

    provisioner.provision().unwrap();
    provisioner.wait().await;

    assert_eq!(provisioner.failed(), modules(&["a", "b"]));
    assert_eq!(provisioner.available(), modules(&["c"]));
    let errors = provisioner.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("deployment unavailable"), "{errors:?}");
}

// ---------------------------------------------------------------------------
// Module cache
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cached_modules_are_not_submitted() {
    let cache = ModuleCache::new();
    cache.insert(&Module::new("cached", "1.0.0"));
    let source = Arc::new(ScriptedModules::default());
    let provisioner = ModuleProvisioner::new(
        source.clone(),
        modules(&["cached", "fresh"]),
        cache.clone(),
        options(2),
    )
    .unwrap();

    provisioner.provision().unwrap();
    provisioner.wait().await;

    let mut available = provisioner.available();
    available.sort();
    assert_eq!(available, modules(&["cached", "fresh"]));
    assert_eq!(source.batches(), vec![modules(&["fresh"])]);

    // Newly available modules are remembered for later runs.
    assert!(cache.contains(&Module::new("fresh", "1.0.0")));
    assert_eq!(cache.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn fully_cached_run_finishes_without_submissions() {
    let cache = ModuleCache::new();
    cache.insert(&Module::new("a", "1.0.0"));
    let source = Arc::new(ScriptedModules::default());
    let provisioner =
        ModuleProvisioner::new(source.clone(), modules(&["a"]), cache, options(4)).unwrap();
    let mut events = provisioner.subscribe();

    provisioner.provision().unwrap();
    provisioner.wait().await;

    assert!(source.batches().is_empty());
    assert_eq!(provisioner.available(), modules(&["a"]));
    assert!(matches!(
        events.try_recv().unwrap().kind,
        EventKind::ItemSucceeded { .. }
    ));
    assert!(matches!(events.try_recv().unwrap().kind, EventKind::Done));
}

// ---------------------------------------------------------------------------
// Lifecycle and validation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn paused_provisioner_keeps_modules_queued() {
    let source = Arc::new(
        ScriptedModules::default().script("pending", &[ModuleState::Queued, ModuleState::Available]),
    );
    let provisioner = ModuleProvisioner::new(
        source,
        modules(&["pending"]),
        ModuleCache::new(),
        options(1),
    )
    .unwrap();

    provisioner.provision().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    provisioner.pause().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(provisioner.state(), EngineState::Paused);
    assert_eq!(provisioner.still_queued(), modules(&["pending"]));
    assert!(provisioner.available().is_empty());

    provisioner.resume().unwrap();
    provisioner.wait().await;
    assert_eq!(provisioner.available(), modules(&["pending"]));
}

#[tokio::test]
async fn invalid_input_is_rejected_up_front() {
    let source = Arc::new(ScriptedModules::default());

    let nameless = ModuleProvisioner::new(
        source.clone(),
        vec![Module::new("", "1.0.0")],
        ModuleCache::new(),
        options(1),
    );
    assert!(matches!(nameless, Err(Error::Validation(_))));

    let versionless = ModuleProvisioner::new(
        source.clone(),
        vec![Module::new("a", "")],
        ModuleCache::new(),
        options(1),
    );
    assert!(matches!(versionless, Err(Error::Validation(_))));

    for batch_limit in [0, 51] {
        let result = ModuleProvisioner::new(
            source.clone(),
            modules(&["a"]),
            ModuleCache::new(),
            ProvisionerOptions {
                batch_limit,
                ..options(1)
            },
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    let no_lanes = ModuleProvisioner::new(source, modules(&["a"]), ModuleCache::new(), options(0));
    assert!(matches!(no_lanes, Err(Error::Validation(_))));
}

#[test]
fn modules_parse_from_name_at_version() {
    let plain: Module = "lodash@4.17.21".parse().unwrap();
    assert_eq!(plain, Module::new("lodash", "4.17.21"));

    let scoped: Module = "@slack/client@3.5.4".parse().unwrap();
    assert_eq!(scoped, Module::new("@slack/client", "3.5.4"));
    assert_eq!(scoped.to_string(), "@slack/client@3.5.4");

    assert!("lodash".parse::<Module>().is_err());
    assert!("lodash@".parse::<Module>().is_err());
}
