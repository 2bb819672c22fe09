//! Tests for the webtask model, analysis and the HTTP transport's URL joining.

use serde_json::json;
use webtask_migrate::analysis::{Analyzer, DependencyAnalyzer, WarningKind};
use webtask_migrate::error::Error;
use webtask_migrate::model::{Module, ModuleState, ModuleStatus, Storage, Webtask};
use webtask_migrate::producer::ModuleCache;
use webtask_migrate::remote::HttpTransport;

#[test]
fn dependencies_round_through_metadata() {
    let mut webtask = Webtask::new("code");
    assert!(webtask.dependencies().is_empty());

    webtask.add_dependencies(&[Module::new("lodash", "4.17.21"), Module::new("async", "2.6.0")]);
    webtask.add_dependencies(&[Module::new("lodash", "4.17.20")]);
    assert_eq!(
        webtask.dependencies(),
        vec![Module::new("async", "2.6.0"), Module::new("lodash", "4.17.20")]
    );

    webtask.remove_dependencies(&[Module::new("async", "2.6.0")]);
    assert_eq!(webtask.dependencies(), vec![Module::new("lodash", "4.17.20")]);
}

#[test]
fn malformed_dependency_metadata_reads_as_none() {
    let mut webtask = Webtask::new("code");
    webtask
        .meta
        .insert("wt-node-dependencies".to_string(), "not json".to_string());
    assert!(webtask.dependencies().is_empty());
}

#[test]
fn storage_keeps_structured_data_as_text() {
    let structured = Storage::from_value(&json!({"data": {"a": [1, 2]}, "etag": "3"}));
    assert_eq!(structured.data.as_deref(), Some("{\"a\":[1,2]}"));
    assert_eq!(structured.etag.as_deref(), Some("3"));

    let text = Storage::from_value(&json!({"data": "raw"}));
    assert_eq!(text.data.as_deref(), Some("raw"));
    assert_eq!(text.etag, None);

    assert_eq!(Storage::from_value(&json!({})), Storage::default());
}

#[test]
fn module_status_reads_unknown_states_as_queued() {
    let statuses: Vec<ModuleStatus> = serde_json::from_value(json!([
        {"name": "a", "version": "1", "state": "available"},
        {"name": "b", "version": "1", "state": "failed"},
        {"name": "c", "version": "1", "state": "installing"},
    ]))
    .unwrap();

    let states: Vec<ModuleState> = statuses.iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![ModuleState::Available, ModuleState::Failed, ModuleState::Queued]
    );
}

#[test]
fn module_cache_is_append_only_and_shared() {
    let cache = ModuleCache::new();
    let handle = cache.clone();
    assert!(cache.is_empty());

    assert!(cache.insert(&Module::new("a", "1")));
    assert!(!handle.insert(&Module::new("a", "1")));
    assert!(handle.insert(&Module::new("a", "2")));

    assert!(cache.contains(&Module::new("a", "2")));
    assert!(!cache.contains(&Module::new("a", "3")));
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn analyzer_flags_compiler_and_reports_dependencies() {
    let mut webtask = Webtask::new("code");
    webtask
        .meta
        .insert("wt-compiler".to_string(), "webtask-tools/lib/express".to_string());
    webtask.add_dependencies(&[Module::new("express", "4.16.0")]);

    let analysis = DependencyAnalyzer.analyze(&webtask).await.unwrap();

    assert_eq!(analysis.dependencies, vec![Module::new("express", "4.16.0")]);
    assert!(analysis.has_warning(WarningKind::UnknownCompiler));
    assert!(!analysis.has_warning(WarningKind::ActiveCron));
    assert_eq!(
        serde_json::to_value(&analysis.warnings[0]).unwrap()["kind"],
        json!("unknownCompiler")
    );
}

#[test]
fn http_transport_joins_paths() {
    let transport = HttpTransport::new("https://wt.example.com/").unwrap();
    assert_eq!(transport.deployment_url(), "https://wt.example.com");
    assert_eq!(
        transport.url_for("/api/webtask/acme"),
        "https://wt.example.com/api/webtask/acme"
    );
    assert_eq!(transport.url_for(""), "https://wt.example.com");

    assert!(matches!(HttpTransport::new("/"), Err(Error::Validation(_))));
}
