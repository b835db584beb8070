//! 配置与模块目录集成测试
//!
//! 测试配置文件加载、校验、合并，以及按配置扫描模块目录

use std::path::Path;
use std::time::Duration;

use chips_runtime::{
    LifecycleState, ModuleIdentity, ModuleRuntime, RuntimeConfig, RuntimeError,
};
use tempfile::TempDir;

fn id(name: &str) -> ModuleIdentity {
    ModuleIdentity::new(name, "1.0.0").unwrap()
}

/// 在 `dir/<name>/module.yaml` 写入模块描述
async fn write_module(dir: &Path, name: &str, body: &str) {
    let module_dir = dir.join(name);
    tokio::fs::create_dir_all(&module_dir).await.unwrap();
    tokio::fs::write(module_dir.join("module.yaml"), body)
        .await
        .unwrap();
}

// ============================================================================
// 配置文件
// ============================================================================

#[tokio::test]
async fn test_load_yaml_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.yaml");
    tokio::fs::write(
        &path,
        r#"
lifecycle:
  hook_timeout_ms: 1500
events:
  listener_queue_size: 32
modules:
  module_dirs:
    - ./modules
  blacklist:
    - legacy
  auto_start: false
logging:
  level: debug
dev_mode: true
"#,
    )
    .await
    .unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();
    assert_eq!(config.lifecycle.hook_timeout(), Duration::from_millis(1500));
    // 未写出的字段取默认值
    assert_eq!(config.lifecycle.shutdown_timeout_ms, 60_000);
    assert_eq!(config.events.listener_queue_size, 32);
    assert_eq!(config.events.handler_timeout_ms, 5_000);
    assert_eq!(config.kernel.command_queue_size, 1024);
    assert!(config.modules.is_blacklisted("legacy"));
    assert!(!config.modules.auto_start);
    assert_eq!(config.logging.level, "debug");
    assert!(config.dev_mode);
    assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
}

#[tokio::test]
async fn test_load_json_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    tokio::fs::write(
        &path,
        r#"{ "lifecycle": { "shutdown_timeout_ms": 250 }, "kernel": { "command_queue_size": 8 } }"#,
    )
    .await
    .unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();
    assert_eq!(config.lifecycle.shutdown_timeout(), Duration::from_millis(250));
    assert_eq!(config.kernel.command_queue_size, 8);
    assert!(config.modules.auto_start);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();

    let zero = temp_dir.path().join("zero.yaml");
    tokio::fs::write(&zero, "events:\n  listener_queue_size: 0\n")
        .await
        .unwrap();
    match RuntimeConfig::from_file(&zero).await {
        Err(RuntimeError::InvalidConfigValue { key, .. }) => {
            assert_eq!(key, "events.listener_queue_size");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let broken = temp_dir.path().join("broken.yaml");
    tokio::fs::write(&broken, "lifecycle: [not, a, map]\n")
        .await
        .unwrap();
    assert!(matches!(
        RuntimeConfig::from_file(&broken).await,
        Err(RuntimeError::Yaml(_))
    ));

    let missing = temp_dir.path().join("missing.yaml");
    assert!(matches!(
        RuntimeConfig::from_file(&missing).await,
        Err(RuntimeError::ConfigLoadFailed(_))
    ));
}

#[test]
fn test_merge_overrides() {
    let mut base = RuntimeConfig::builder()
        .module_dir("/opt/modules")
        .blacklist("legacy")
        .build();
    let overlay = RuntimeConfig::builder()
        .hook_timeout(Duration::from_secs(2))
        .module_dir("/opt/modules")
        .module_dir("/home/user/modules")
        .blacklist("legacy")
        .blacklist("broken")
        .manual_start()
        .build();

    base.merge(overlay);
    assert_eq!(base.lifecycle.hook_timeout_ms, 2_000);
    assert_eq!(base.lifecycle.shutdown_timeout_ms, 60_000);
    assert_eq!(base.modules.module_dirs.len(), 2);
    assert_eq!(base.modules.blacklist, vec!["legacy", "broken"]);
    assert!(!base.modules.auto_start);
}

#[test]
fn test_runtime_rejects_invalid_config() {
    let mut config = RuntimeConfig::default();
    config.kernel.command_queue_size = 0;

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let result = runtime.block_on(async { ModuleRuntime::new(config).map(|_| ()) });
    assert!(matches!(
        result,
        Err(RuntimeError::InvalidConfigValue { .. })
    ));
}

// ============================================================================
// 模块目录
// ============================================================================

#[tokio::test]
async fn test_install_configured_dirs() {
    let temp_dir = TempDir::new().unwrap();
    let modules = temp_dir.path().join("modules");
    write_module(&modules, "core", "name: core\nversion: 1.0.0\n").await;
    write_module(
        &modules,
        "editor",
        "name: editor\nversion: 1.0.0\nrequires:\n  - core@1.0.0\n",
    )
    .await;
    write_module(
        &modules,
        "theme",
        "name: theme\nversion: 1.0.0\nfragment_host: editor@1.0.0\n",
    )
    .await;
    write_module(&modules, "broken", "name: broken\nversion: not-a-version\n").await;
    write_module(&modules, "legacy", "name: legacy\nversion: 1.0.0\n").await;
    // 没有 module.yaml 的目录被忽略
    tokio::fs::create_dir_all(modules.join("assets")).await.unwrap();

    let config = RuntimeConfig::builder()
        .module_dir(&modules)
        .module_dir(temp_dir.path().join("does-not-exist"))
        .blacklist("legacy")
        .build();
    let runtime = ModuleRuntime::new(config).unwrap();

    let mut installed = runtime.install_configured_dirs().await.unwrap();
    installed.sort();
    assert_eq!(installed, vec![id("core"), id("editor"), id("theme")]);

    let theme = runtime.query(&id("theme")).unwrap();
    assert_eq!(theme.state, LifecycleState::Resolved);
    assert_eq!(theme.attached_to, Some(id("editor")));

    let report = runtime.start_all().await.unwrap();
    assert_eq!(report.completed, vec![id("core"), id("editor")]);

    // 位置即模块目录
    let location = modules.join("editor").display().to_string();
    assert_eq!(runtime.uninstall_location(location).await.unwrap(), id("editor"));
    assert_eq!(runtime.state(&id("theme")).unwrap(), LifecycleState::Installed);
    assert_eq!(runtime.state(&id("core")).unwrap(), LifecycleState::Active);

    runtime.shutdown().await.unwrap();
}
