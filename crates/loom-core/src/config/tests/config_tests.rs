use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::config::{
    ConfigFormat, KernelConfig, ModuleConfig, PluginSettings, ReloadPolicy, ReloadPolicyKind,
};
use crate::kernel::constants::{
    DEFAULT_DRAIN_TIMEOUT_MS, DEFAULT_INIT_TIMEOUT_MS, TASK_SHUTDOWN_TIMEOUT_MS,
};
use crate::kernel::error::Error;

#[test]
fn test_defaults() {
    let config = KernelConfig::default();
    assert_eq!(config.kernel.init_timeout_ms, DEFAULT_INIT_TIMEOUT_MS);
    assert_eq!(config.kernel.reload_policy, ReloadPolicyKind::Drain);
    let drain = ReloadPolicy::Drain {
        timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
    };
    assert_eq!(config.reload_policy(), drain);
    assert_eq!(
        config.task_shutdown_timeout(),
        Duration::from_millis(TASK_SHUTDOWN_TIMEOUT_MS)
    );
    assert_eq!(config.plugins.dir, PathBuf::from("plugins"));
    assert_eq!(config.plugins.extension, std::env::consts::DLL_EXTENSION);
    assert!(!config.plugins.hot_reload);
    assert!(config.modules.is_empty());
}

#[cfg(all(feature = "yaml-config", feature = "toml-config"))]
#[test]
fn test_format_from_path() {
    let format_of = |path: &str| ConfigFormat::from_path(Path::new(path));
    assert_eq!(format_of("loom.json"), Some(ConfigFormat::Json));
    assert_eq!(format_of("loom.YML"), Some(ConfigFormat::Yaml));
    assert_eq!(format_of("loom.toml"), Some(ConfigFormat::Toml));
    assert_eq!(format_of("loom.ini"), None);
    assert_eq!(format_of("loom"), None);
    assert_eq!(ConfigFormat::Yaml.extension(), "yaml");
}

#[cfg(feature = "toml-config")]
#[test]
fn test_parse_toml() {
    let data = r#"
[kernel]
init_timeout_ms = 1500
reload_policy = "immediate"

[plugins]
dir = "/opt/loom/plugins"
excludes = ["legacy"]
hot_reload = true
admin_token = "t0ken"

[modules.greeter]
greeting = "Howdy"
"#;
    let config = KernelConfig::parse(data, ConfigFormat::Toml).unwrap();
    assert_eq!(config.init_timeout(), Duration::from_millis(1500));
    assert_eq!(config.reload_policy(), ReloadPolicy::Immediate);
    let drain = config.kernel.drain_timeout_ms;
    assert_eq!(drain, DEFAULT_DRAIN_TIMEOUT_MS, "unset keys keep defaults");
    assert_eq!(config.plugins.dir, PathBuf::from("/opt/loom/plugins"));
    assert_eq!(config.plugins.admin_token.as_deref(), Some("t0ken"));
    let greeting = config.module("greeter").get::<String>("greeting");
    assert_eq!(greeting.as_deref(), Some("Howdy"));
}

#[cfg(feature = "yaml-config")]
#[test]
fn test_parse_yaml_and_json_agree() {
    let yaml = "plugins:\n  includes: [greeter]\nmodules:\n  cache:\n    size: 64\n";
    let json = r#"{"plugins":{"includes":["greeter"]},"modules":{"cache":{"size":64}}}"#;
    let from_yaml = KernelConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
    let from_json = KernelConfig::parse(json, ConfigFormat::Json).unwrap();
    assert_eq!(from_yaml, from_json);
    assert_eq!(from_json.module("cache").get_or("size", 0u32), 64);
}

#[cfg(feature = "toml-config")]
#[test]
fn test_parse_errors_are_config_errors() {
    let err = KernelConfig::parse("[kernel\n", ConfigFormat::Toml).unwrap_err();
    assert!(matches!(err, Error::Config { path: None, .. }), "{:?}", err);
    let data = r#"{ "kernel": { "init_timeout_ms": "soon" } }"#;
    assert!(KernelConfig::parse(data, ConfigFormat::Json).is_err());
}

#[cfg(feature = "yaml-config")]
#[tokio::test]
async fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loom.yaml");
    let yaml = "kernel:\n  drain_timeout_ms: 250\n";
    tokio::fs::write(&path, yaml).await.unwrap();

    let config = KernelConfig::load(&path).await.unwrap();
    let drain = ReloadPolicy::Drain {
        timeout: Duration::from_millis(250),
    };
    assert_eq!(config.reload_policy(), drain);

    let broken = dir.path().join("broken.json");
    tokio::fs::write(&broken, "{ nope").await.unwrap();
    match KernelConfig::load(&broken).await {
        Err(Error::Config { path: Some(p), .. }) => assert_eq!(p, broken),
        other => panic!("expected a Config error naming the file, got {:?}", other),
    }

    let missing = dir.path().join("missing.toml");
    assert!(KernelConfig::load(missing).await.is_err());
    let unknown = dir.path().join("loom.ini");
    assert!(KernelConfig::load(unknown).await.is_err());
}

#[derive(Debug, Deserialize, PartialEq)]
struct CacheSettings {
    size: u32,
    #[serde(default)]
    eviction: Option<String>,
}

#[test]
fn test_module_config_access() {
    let mut config = KernelConfig::new();
    config.set_module("cache", json!({ "size": 8, "eviction": "lru" }));

    let cache = config.module("cache");
    assert_eq!(cache.get::<u32>("size"), Some(8));
    let eviction = cache.get::<u32>("eviction");
    assert_eq!(eviction, None, "wrong type reads as absent");
    let expected = CacheSettings {
        size: 8,
        eviction: Some("lru".into()),
    };
    assert_eq!(cache.deserialize::<CacheSettings>().unwrap(), expected);

    let missing = config.module("nobody");
    assert_eq!(missing, ModuleConfig::empty());
    assert_eq!(missing.get_or("size", 16u32), 16);
    assert!(missing.deserialize::<CacheSettings>().is_err());
    assert_eq!(missing.raw(), &json!({}));
}

#[test]
fn test_include_and_exclude_lists() {
    let mut settings = PluginSettings::default();
    assert!(settings.allows_any(&["anything"]));

    settings.excludes = vec!["legacy".into()];
    assert!(!settings.allows_any(&["legacy"]));
    assert!(settings.allows_any(&["greeter"]));

    settings.includes = vec!["greeter".into()];
    assert!(settings.allows_any(&["greeter"]));
    let other = settings.allows_any(&["other"]);
    assert!(!other, "includes win over excludes");
    assert!(settings.allows_any(&["libgreeter", "greeter"]));
}

#[test]
fn test_task_shutdown_timeout_from_json() {
    let data = r#"{ "kernel": { "task_shutdown_timeout_ms": 40 } }"#;
    let config = KernelConfig::parse(data, ConfigFormat::Json).unwrap();
    assert_eq!(config.task_shutdown_timeout(), Duration::from_millis(40));
    assert_eq!(config.kernel.init_timeout_ms, DEFAULT_INIT_TIMEOUT_MS);
}
