mod common;

use common::*;
use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};
use storlets_protocol::{DaemonSpec, Metadata, Params, SBusClient};
use storlets_sand::{errors::SandError, factory::StartupPolicy, launch::Launcher, DaemonFactory};

fn spec(dir: &Path, language: &str, storlet_name: &str) -> DaemonSpec {
    DaemonSpec {
        language: language.to_string(),
        language_version: None,
        storlet_path: dir.to_string_lossy().into_owned(),
        storlet_name: storlet_name.to_string(),
        uds_path: dir.join(storlet_name).to_string_lossy().into_owned(),
        log_level: "DEBUG".to_string(),
        pool_size: 2,
    }
}

#[test]
fn daemon_lifecycle() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut factory, path) = spawn_factory(dir.path());
    let client = SBusClient::new(&path);

    let half = spec(dir.path(), "native", "half");
    let reply = client.start_daemon(&half).unwrap();
    assert!(reply.status, "{}", reply.message);
    assert_eq!(reply.message, "OK");

    let again = client.start_daemon(&half).unwrap();
    assert!(again.status);
    assert_eq!(again.message, "half is already running");
    assert!(client.daemon_status("half").unwrap().status);

    let input = input_file(dir.path(), b"0123456789");
    let mut invocation = execute(
        Path::new(&half.uds_path),
        dir.path(),
        input,
        Metadata::new(),
        Params::new(),
    );
    assert!(invocation.reply.status);
    invocation.read_metadata().unwrap();
    assert_eq!(invocation.read_data(), b"02468");

    let stopped = client.stop_daemon("half").unwrap();
    assert!(stopped.status);
    assert!(stopped.message.starts_with("Storlet half, PID = "));
    let status = client.daemon_status("half").unwrap();
    assert!(!status.status);
    assert_eq!(status.message, "No running storlet daemons for half");
    assert!(!client.stop_daemon("half").unwrap().status);

    assert!(client.halt().unwrap().status);
    assert!(factory.wait().unwrap().success());
}

#[test]
fn bad_start_requests() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut factory, path) = spawn_factory(dir.path());
    let client = SBusClient::new(&path);

    let reply = client.start_daemon(&spec(dir.path(), "cobol", "half")).unwrap();
    assert!(!reply.status);
    assert!(reply.message.contains("cobol"));

    let reply = client.daemon_status("never_started").unwrap();
    assert!(!reply.status);

    let reply = client.cancel("00000000").unwrap();
    assert!(!reply.status);
    assert!(reply.message.contains("not supported"));

    assert!(client.halt().unwrap().status);
    factory.wait().unwrap();
}

#[test]
fn stop_all_daemons() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut factory, path) = spawn_factory(dir.path());
    let client = SBusClient::new(&path);

    for name in &["half", "identity"] {
        assert!(client.start_daemon(&spec(dir.path(), "native", name)).unwrap().status);
    }
    let reply = client.stop_daemons().unwrap();
    assert!(reply.status, "{}", reply.message);
    assert!(!client.daemon_status("half").unwrap().status);
    assert!(!client.daemon_status("identity").unwrap().status);

    // the factory keeps serving after stop_daemons
    assert!(client.ping().unwrap().status);
    client.halt().unwrap();
    factory.wait().unwrap();
}

#[test]
fn halt_with_unreachable_daemon() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut factory, path) = spawn_factory(dir.path());
    let client = SBusClient::new(&path);

    let half = spec(dir.path(), "native", "half");
    let identity = spec(dir.path(), "native", "identity");
    assert!(client.start_daemon(&half).unwrap().status);
    assert!(client.start_daemon(&identity).unwrap().status);
    fs::remove_file(&identity.uds_path).unwrap();

    let reply = client.halt().unwrap();
    assert!(!reply.status);
    assert!(reply.message.contains("identity"));
    assert!(reply.message.contains("half: terminated"));
    assert!(reply.message.contains("identity: terminated"));
    assert!(factory.wait().unwrap().success());

    // the halted daemon removed its own channel on the way out
    assert!(!Path::new(&half.uds_path).exists());
}

#[test]
fn failed_start_is_rolled_back() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    fs::create_dir(&bin).unwrap();

    // one daemon dies during the settle window, the other never binds its channel
    for (name, body) in [("quits", "exit 3"), ("silent", "exec sleep 30")].iter() {
        let program = script(&bin, name, body);
        let mut factory = DaemonFactory::new(Launcher::new("test_container").native_daemon(program))
            .startup_policy(StartupPolicy {
                settle: Duration::from_millis(200),
                ping_attempts: 3,
                ping_interval: Duration::from_millis(100),
            });

        let started = Instant::now();
        let result = factory.start_daemon(&spec(dir.path(), "native", name));
        assert!(
            matches!(result, Err(SandError::DaemonStartFailed(ref failed)) if failed == *name),
            "{}: {:?}",
            name,
            result.map(|response| response.message)
        );
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(!factory.is_running(name).unwrap());
        let status = factory.daemon_status(name).unwrap();
        assert!(!status.status);
        assert_eq!(status.message, format!("No running storlet daemons for {}", name));
        // no pid is left behind to stop
        assert!(!factory.stop_daemon(name).unwrap().status);
    }
}
