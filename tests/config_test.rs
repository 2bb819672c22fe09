use std::time::Duration;

use secrecy::ExposeSecret;
use webtask_migrate::config::{Config, EngineConfig};
use webtask_migrate::engine::RetryPolicy;

// Environment variables are process-wide, so every env-dependent check lives
// in this one test.
#[test]
fn config_from_env_loads_and_validates() {
    unsafe {
        std::env::remove_var("WT_DEPLOYMENT_URL");
        std::env::remove_var("WT_MAX_CONCURRENT");
        std::env::remove_var("WT_MAX_ATTEMPTS");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("WT_DEPLOYMENT_URL", "https://wt.example.com");
        std::env::set_var("WT_MASTER_TOKEN", "header.payload.sig");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.deployment_url, "https://wt.example.com");
    assert_eq!(
        config.master_token.as_ref().map(|t| t.expose_secret().to_string()),
        Some("header.payload.sig".to_string())
    );
    assert_eq!(config.max_concurrent, 10);
    assert_eq!(config.max_attempts, 10);
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("WT_MAX_CONCURRENT", "4");
        std::env::set_var("WT_MAX_ATTEMPTS", "3");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.max_concurrent, 4);
    assert_eq!(config.max_attempts, 3);

    // File values win over the environment; unset ones fall back to it.
    let engine = EngineConfig::parse("[retry]\nbase_delay_ms = 10\n").unwrap();
    let dispatch = engine.dispatch_config(&config);
    assert_eq!(dispatch.max_concurrent, 4);
    assert_eq!(dispatch.retry.max_attempts, 3);
    assert_eq!(dispatch.retry.base_delay, Duration::from_millis(10));

    unsafe {
        std::env::set_var("WT_MAX_CONCURRENT", "many");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::remove_var("WT_DEPLOYMENT_URL");
        std::env::remove_var("WT_MASTER_TOKEN");
        std::env::remove_var("WT_MAX_CONCURRENT");
        std::env::remove_var("WT_MAX_ATTEMPTS");
    }
}

#[test]
fn engine_config_defaults_match_the_engine() {
    let engine = EngineConfig::parse("").unwrap();

    assert_eq!(engine.max_concurrent, None);
    assert_eq!(RetryPolicy::from(&engine.retry), RetryPolicy::default());
    assert_eq!(engine.provision.batch_limit, 25);
    assert_eq!(engine.provision.per_item_delay_ms, 100);
    assert_eq!(engine.download.page_size, 100);
}

#[test]
fn engine_config_reads_every_section() {
    let engine = EngineConfig::parse(
        r#"
max_concurrent = 2

[retry]
base_delay_ms = 20
growth = 3.0
max_delay_ms = 1000
max_attempts = 5

[provision]
batch_limit = 10
per_item_delay_ms = 250

[download]
page_size = 50
"#,
    )
    .unwrap();

    assert_eq!(engine.max_concurrent, Some(2));
    assert_eq!(
        RetryPolicy::from(&engine.retry),
        RetryPolicy {
            base_delay: Duration::from_millis(20),
            growth: 3.0,
            max_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    );
    assert_eq!(engine.provision.batch_limit, 10);
    assert_eq!(engine.provision.per_item_delay_ms, 250);
    assert_eq!(engine.download.page_size, 50);
}

#[test]
fn engine_config_rejects_bad_toml() {
    assert!(EngineConfig::parse("max_concurrent = \"lots\"").is_err());

    let missing = EngineConfig::load(std::path::Path::new("/nonexistent/engine.toml"));
    assert!(missing.is_err());
}
