mod common;

use common::*;
use std::{collections::BTreeMap, sync::Arc};
use storlets::{
    errors::StorletError, sandbox::DaemonStatus, sandbox::RunTimeSandbox, GatewayConfig,
    RequestOptions,
};
use tokio::runtime::Runtime;

fn config(root: &std::path::Path, extra: &[(&str, &str)]) -> GatewayConfig {
    let mut conf = BTreeMap::new();
    conf.insert("host_root".to_string(), root.to_string_lossy().into_owned());
    conf.insert("sandbox_ping_interval".to_string(), "0.05".to_string());
    conf.insert("restart_linux_container_timeout".to_string(), "2".to_string());
    for (key, value) in extra {
        conf.insert(key.to_string(), value.to_string());
    }
    GatewayConfig::from_map(&conf).unwrap()
}

#[test]
fn container_spec() {
    let dir = tempfile::tempdir().unwrap();
    let conf = config(dir.path(), &[("docker_repo", "localhost:5001")]);
    let sandbox = RunTimeSandbox::new("abc", &conf, Arc::new(FakeEngine::default()));
    let spec = sandbox.container_spec("abc");
    assert_eq!(spec.name, "tenant_abc");
    assert_eq!(spec.image, "localhost:5001/abc");
    assert_eq!(
        spec.entrypoint,
        "/usr/local/libexec/storlets/storlets-daemon-factory"
    );
    assert_eq!(
        spec.args,
        vec![
            "/mnt/channels/factory_pipe",
            "DEBUG",
            "tenant_abc",
            "--user",
            "swift",
            "--log-relay",
            "logger"
        ]
    );
    assert_eq!(spec.mounts.len(), 4);
    assert_eq!(spec.mounts[0].source, sandbox.paths().host_pipe_dir());
    assert!(!spec.mounts[0].read_only);
    assert!(spec.mounts[1..].iter().all(|mount| mount.read_only));
    assert_eq!(spec.labels["managed_by"], "storlets");
}

#[test]
fn classpath() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = RunTimeSandbox::new(
        "abc",
        &config(dir.path(), &[]),
        Arc::new(FakeEngine::default()),
    );
    assert_eq!(
        sandbox.storlet_classpath("org.Main", "main-1.0.jar", &[]),
        "/home/swift/org.Main/main-1.0.jar"
    );
    assert_eq!(
        sandbox.storlet_classpath("org.Main", "main-1.0.jar", &["a.jar".into(), "b.so".into()]),
        "/home/swift/org.Main/main-1.0.jar:/home/swift/org.Main/a.jar:/home/swift/org.Main/b.so"
    );
}

#[test]
fn restart_falls_back_to_default_image() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let conf = config(dir.path(), &[("default_container_image_name", "fallback")]);
    let pipe_dir = dir.path().join("pipes").join("scopes").join("abc");
    let engine = Arc::new(FakeEngine {
        missing_images: vec!["abc".to_string()],
        factory_dir: Some(pipe_dir.clone()),
        ..FakeEngine::default()
    });
    let sandbox = RunTimeSandbox::new("abc", &conf, engine.clone());

    Runtime::new().unwrap().block_on(async {
        sandbox.restart().await.unwrap();
        assert!(sandbox.ping().await);
    });
    assert_eq!(
        engine.calls(),
        vec!["stop tenant_abc", "run abc", "stop tenant_abc", "run fallback"]
    );
    assert!(pipe_dir.is_dir());
}

#[test]
fn restart_refused_at_container_limit() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let conf = config(dir.path(), &[("max_containers_per_node", "2")]);
    let engine = Arc::new(FakeEngine {
        running: 2,
        ..FakeEngine::default()
    });
    let sandbox = RunTimeSandbox::new("abc", &conf, engine.clone());

    Runtime::new().unwrap().block_on(async {
        match sandbox.restart().await {
            Err(StorletError::Runtime(message)) => {
                assert_eq!(message, "Cannot start a container because of limit")
            }
            other => panic!("unexpected result {:?}", other.err()),
        }
    });
    assert_eq!(
        engine.calls(),
        vec![
            "stop tenant_abc",
            "count managed_by=storlets",
            "stop tenant_abc",
            "count managed_by=storlets"
        ]
    );
}

#[test]
fn restart_timeout_is_not_retried() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let conf = config(dir.path(), &[("restart_linux_container_timeout", "0.3")]);
    // the container "starts" but no factory ever answers
    let engine = Arc::new(FakeEngine::default());
    let sandbox = RunTimeSandbox::new("abc", &conf, engine.clone());

    Runtime::new().unwrap().block_on(async {
        let result = sandbox.restart().await;
        assert!(matches!(result, Err(StorletError::Timeout(_))));
    });
    assert_eq!(engine.calls(), vec!["stop tenant_abc", "run abc"]);
}

#[test]
fn activate_restarts_an_unreachable_sandbox() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let conf = config(dir.path(), &[]);
    let pipe_dir = dir.path().join("pipes").join("scopes").join("abc");
    let engine = Arc::new(FakeEngine {
        factory_dir: Some(pipe_dir.clone()),
        ..FakeEngine::default()
    });
    let sandbox = RunTimeSandbox::new("abc", &conf, engine.clone());
    let options = RequestOptions::new("org.Echo", "Java", shared(FakeFileManager::default()));

    Runtime::new().unwrap().block_on(async {
        assert_eq!(
            sandbox.storlet_daemon_status("org.Echo").await,
            DaemonStatus::Unreachable
        );
        sandbox
            .activate_storlet_daemon("echo-1.0.jar", &options, false)
            .await
            .unwrap();
        assert_eq!(
            sandbox.storlet_daemon_status("org.Echo").await,
            DaemonStatus::Running
        );

        // fresh code means the running daemon is replaced
        sandbox
            .activate_storlet_daemon("echo-1.0.jar", &options, true)
            .await
            .unwrap();
        assert_eq!(
            sandbox.storlet_daemon_status("org.Echo").await,
            DaemonStatus::Running
        );
    });

    let factory = engine.factories.lock().unwrap().pop().unwrap();
    assert_eq!(
        factory.halt(),
        vec![
            "SBUS_CMD_PING",
            "SBUS_CMD_START_DAEMON",
            "SBUS_CMD_DAEMON_STATUS",
            "SBUS_CMD_DAEMON_STATUS",
            "SBUS_CMD_STOP_DAEMON",
            "SBUS_CMD_START_DAEMON",
            "SBUS_CMD_DAEMON_STATUS",
            "SBUS_CMD_HALT"
        ]
    );
    assert_eq!(engine.calls(), vec!["stop tenant_abc", "run abc"]);
}
