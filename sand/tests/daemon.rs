mod common;

use common::*;
use serde_json::json;
use std::{
    fs::File,
    io::{Read, Write},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};
use storlets_protocol::{transport, Command, Metadata, Params, SBusClient};

#[test]
fn ping_and_unsupported_command() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut child, path) = spawn_daemon(dir.path(), "identity", 2);
    let client = SBusClient::new(&path);

    let reply = client
        .request(Command::StopDaemons, Params::new(), None, Vec::new())
        .unwrap();
    assert!(!reply.status);
    assert!(reply.message.contains("not supported"));
    assert!(client.ping().unwrap().status);

    assert!(client.halt().unwrap().status);
    assert!(child.wait().unwrap().success());
}

#[test]
fn half_storlet() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut child, path) = spawn_daemon(dir.path(), "half", 2);

    let input = input_file(dir.path(), b"abcdefghij");
    let mut invocation = execute(&path, dir.path(), input, Metadata::new(), Params::new());
    assert!(invocation.reply.status);
    let task_id = invocation.reply.task_id.clone().unwrap();
    assert_eq!(task_id.len(), 8);

    let metadata = invocation.read_metadata().unwrap();
    assert_eq!(metadata["Content-Type"], json!("application/octet-stream"));
    assert_eq!(invocation.read_data(), b"acegi");
    assert!(invocation.read_log().contains("half INFO: HalfStorlet Invoked"));

    SBusClient::new(&path).halt().unwrap();
    assert!(child.wait().unwrap().success());
}

#[test]
fn ranged_input() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut child, path) = spawn_daemon(dir.path(), "identity", 2);

    let input = input_file(dir.path(), b"0123456789");
    let mut range = Metadata::new();
    range.insert("start".into(), json!("2"));
    range.insert("end".into(), json!("6"));
    let mut invocation = execute(&path, dir.path(), input, range, Params::new());
    assert!(invocation.read_metadata().is_some());
    assert_eq!(invocation.read_data(), b"2345");

    SBusClient::new(&path).halt().unwrap();
    child.wait().unwrap();
}

#[test]
fn print_params() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut child, path) = spawn_daemon(dir.path(), "test", 2);

    let input = input_file(dir.path(), b"");
    let mut invocation = execute(
        &path,
        dir.path(),
        input,
        Metadata::new(),
        params(json!({"op": "print", "color": "blue"})),
    );
    invocation.read_metadata().unwrap();
    let text = String::from_utf8(invocation.read_data()).unwrap();
    assert!(text.contains("color     blue\n"));
    assert!(text.contains("op     print\n"));

    SBusClient::new(&path).halt().unwrap();
    child.wait().unwrap();
}

#[test]
fn crash_is_contained() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut child, path) = spawn_daemon(dir.path(), "test", 2);

    let input = input_file(dir.path(), b"data");
    let mut invocation = execute(
        &path,
        dir.path(),
        input,
        Metadata::new(),
        params(json!({"op": "crash"})),
    );
    assert!(invocation.reply.status);
    assert_eq!(invocation.read_metadata(), None);
    assert!(invocation.read_data().is_empty());
    assert!(invocation.read_log().contains("test ERROR: storlet invocation panicked"));

    let client = SBusClient::new(&path);
    assert!(client.ping().unwrap().status);
    client.halt().unwrap();
    assert!(child.wait().unwrap().success());
}

#[test]
fn cancel_running_task() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut child, path) = spawn_daemon(dir.path(), "test", 2);
    let client = SBusClient::new(&path);

    let input = input_file(dir.path(), b"data");
    let mut invocation = execute(
        &path,
        dir.path(),
        input,
        Metadata::new(),
        params(json!({"op": "hold"})),
    );
    let task_id = invocation.reply.task_id.clone().unwrap();
    invocation.read_metadata().unwrap();

    let reply = client.cancel(&task_id).unwrap();
    assert!(reply.status, "{}", reply.message);
    // the killed worker closes its end of the output pipe
    assert!(invocation.read_data().is_empty());

    let again = client.cancel(&task_id).unwrap();
    assert!(!again.status);
    assert!(again.message.contains("not found"));
    assert!(!client.cancel("ffffffff").unwrap().status);

    client.halt().unwrap();
    assert!(child.wait().unwrap().success());
}

#[test]
fn cancel_reaches_exec_storlet() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin).unwrap();
    script(&bin, "sleeper", "echo started >&2\nexec sleep 20");
    let (mut child, path) = spawn_exec_daemon(dir.path(), "sleeper", &bin);
    let client = SBusClient::new(&path);

    let input = input_file(dir.path(), b"data");
    let mut invocation = execute(&path, dir.path(), input, Metadata::new(), Params::new());
    let task_id = invocation.reply.task_id.clone().unwrap();
    invocation.read_metadata().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !invocation.read_log().contains("started") {
        assert!(Instant::now() < deadline, "storlet program never started");
        thread::sleep(Duration::from_millis(50));
    }

    let reply = client.cancel(&task_id).unwrap();
    assert!(reply.status, "{}", reply.message);

    // the program held the output too, so EOF means it is gone as well
    let (tx, rx) = mpsc::channel();
    let mut data = invocation.data;
    thread::spawn(move || {
        let mut body = Vec::new();
        let _ = tx.send(data.read_to_end(&mut body).map(|_| body));
    });
    let body = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("output never reached EOF after cancel")
        .unwrap();
    assert!(body.is_empty());

    client.halt().unwrap();
    assert!(child.wait().unwrap().success());
}

#[test]
fn full_pool_delays_execute() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut child, path) = spawn_daemon(dir.path(), "identity", 1);

    // the first worker blocks until its input pipe is closed
    let (first_read, first_write) = transport::pipe().unwrap();
    let mut first_writer = File::from(first_write);
    let mut first = execute(&path, dir.path(), first_read, Metadata::new(), Params::new());
    assert!(first.reply.status);
    first.read_metadata().unwrap();
    first_writer.write_all(b"first").unwrap();

    let (tx, rx) = mpsc::channel();
    let second_path = path.clone();
    let second_dir = dir.path().to_path_buf();
    let second_input = input_file(dir.path(), b"second");
    let second = thread::spawn(move || {
        let mut invocation = execute(
            &second_path,
            &second_dir,
            second_input,
            Metadata::new(),
            Params::new(),
        );
        tx.send(Instant::now()).unwrap();
        invocation.read_metadata().unwrap();
        invocation.read_data()
    });

    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    let released = Instant::now();
    drop(first_writer);
    assert_eq!(first.read_data(), b"first");

    let admitted = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(admitted >= released);
    assert_eq!(second.join().unwrap(), b"second");

    SBusClient::new(&path).halt().unwrap();
    child.wait().unwrap();
}

#[test]
fn halt_waits_for_workers() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (mut child, path) = spawn_daemon(dir.path(), "identity", 2);

    let (input_read, input_write) = transport::pipe().unwrap();
    let mut writer = File::from(input_write);
    let mut invocation = execute(&path, dir.path(), input_read, Metadata::new(), Params::new());
    invocation.read_metadata().unwrap();

    assert!(SBusClient::new(&path).halt().unwrap().status);
    thread::sleep(Duration::from_millis(300));
    assert!(child.try_wait().unwrap().is_none());

    writer.write_all(b"late").unwrap();
    drop(writer);
    assert_eq!(invocation.read_data(), b"late");
    assert!(child.wait().unwrap().success());
}
