mod common;

use common::{Reply, ScriptedTransport};
use lifeguard::{
    BreakerProperty, CallExecutor, CircuitBreakerRegistry, ConfigError, PropertyResolver,
    RegistryError, TomlConfigSource,
};
use std::sync::Arc;
use std::time::Duration;

fn write_config(path: &std::path::Path, timeout_ms: u64, max_concurrent: u64) {
    let doc = format!(
        "[hystrix.command.quotes]\nTimeout = {timeout_ms}\nMaxConcurrentRequests = {max_concurrent}\n"
    );
    std::fs::write(path, doc).unwrap();
}

const REFRESH: &[u8] = br#"{"type":"RefreshRemoteApplicationEvent","timestamp":1494514362123,
    "originService":"config-server:docker:8888","destinationService":"accountservice:**",
    "id":"53e61c71-cbae-4b6d-84bb-d0dcc0aeb4dc"}"#;

#[tokio::test]
async fn toml_settings_drive_executor_and_reload_on_refresh() {
    let path = std::env::temp_dir().join(format!("lifeguard-reload-{}.toml", std::process::id()));
    write_config(&path, 50, 4);

    let source = TomlConfigSource::from_path(&path).unwrap();
    let registry = Arc::new(CircuitBreakerRegistry::from_source(source));
    registry.configure(["quotes"]).unwrap();
    let breaker = registry.breaker("quotes").unwrap();
    assert_eq!(breaker.config().timeout(), Duration::from_millis(50));
    assert_eq!(breaker.config().max_concurrent_requests(), 4);

    let transport =
        Arc::new(ScriptedTransport::always(Reply::Slow(Duration::from_millis(200), 200, "ok")));
    let executor = CallExecutor::new(registry.clone(), transport).with_retries(0);
    let body = executor
        .execute("quotes", "http://quotes", "GET", |err| {
            assert!(err.is_timeout());
            Ok(b"fallback".to_vec())
        })
        .await
        .unwrap();
    assert_eq!(body, b"fallback".to_vec());

    write_config(&path, 1_000, 8);
    assert_eq!(registry.handle_refresh_event(REFRESH, "vipservice"), Ok(false));
    assert_eq!(breaker.config().timeout(), Duration::from_millis(50), "not addressed to us");

    assert_eq!(registry.handle_refresh_event(REFRESH, "accountservice"), Ok(true));
    assert_eq!(breaker.config().timeout(), Duration::from_millis(1_000));
    assert_eq!(breaker.config().max_concurrent_requests(), 8);

    let body = executor
        .execute("quotes", "http://quotes", "GET", |_| Ok(b"fallback".to_vec()))
        .await
        .unwrap();
    assert_eq!(body, b"ok".to_vec());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn broken_file_on_reload_keeps_previous_settings() {
    let path = std::env::temp_dir().join(format!("lifeguard-broken-{}.toml", std::process::id()));
    write_config(&path, 300, 2);
    let registry = CircuitBreakerRegistry::from_source(TomlConfigSource::from_path(&path).unwrap());
    registry.configure(["quotes"]).unwrap();

    std::fs::write(&path, "[hystrix.command.quotes\nTimeout = ").unwrap();
    let err = registry.reload().unwrap_err();
    assert!(matches!(err, RegistryError::Config(ConfigError::Parse(_))));
    assert_eq!(registry.breaker("quotes").unwrap().config().timeout(), Duration::from_millis(300));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn unknown_property_is_fatal_for_startup() {
    let resolver = PropertyResolver::new(TomlConfigSource::from_toml_str("").unwrap());
    let err = resolver.resolve_named("quotes", "RetryBudget").unwrap_err();
    assert_eq!(err, ConfigError::UnknownProperty { property: "RetryBudget".into() });
    assert_eq!(
        resolver.resolve("quotes", BreakerProperty::RequestVolumeThreshold).unwrap(),
        20
    );
}
