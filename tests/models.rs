//! The four threading models, accept policy, limits, timeouts, file
//! bodies, and the upgrade escape hatch.

mod common;

use std::fs;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::Client;
use httpd_core::{
    Daemon, DaemonOptions, Dispatch, RequestCtx, RequestHandler, Response, ThreadingModel,
};

fn echo_path(req: &mut RequestCtx<'_>) -> Dispatch {
    let resp = Response::from_buffer(req.url().as_bytes().to_vec());
    req.queue_response(200, resp);
    Dispatch::Continue
}

fn get_ok(addr: std::net::SocketAddr, path: &str) -> Vec<u8> {
    let mut client = Client::connect(addr);
    client.send(format!("GET {path} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").as_bytes());
    let reply = client.read_reply();
    assert_eq!(reply.status(), 200);
    reply.body
}

#[test]
fn thread_pool_serves_concurrent_clients() {
    let mut options = DaemonOptions::default();
    options.threading = ThreadingModel::ThreadPool(3);
    let daemon = Daemon::start(options, echo_path).unwrap();
    let addr = daemon.local_addr();

    let mut joins = Vec::new();
    for i in 0..6 {
        joins.push(thread::spawn(move || {
            let path = format!("/client-{i}");
            assert_eq!(get_ok(addr, &path), path.as_bytes());
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
    daemon.stop();
}

#[test]
fn thread_per_connection_serves() {
    let mut options = DaemonOptions::default();
    options.threading = ThreadingModel::ThreadPerConnection;
    let daemon = Daemon::start(options, echo_path).unwrap();
    let addr = daemon.local_addr();

    let a = thread::spawn(move || get_ok(addr, "/a"));
    let b = thread::spawn(move || get_ok(addr, "/b"));
    assert_eq!(a.join().unwrap(), b"/a");
    assert_eq!(b.join().unwrap(), b"/b");
    daemon.stop();
}

#[test]
fn external_loop_is_pumped_by_the_host() {
    let mut options = DaemonOptions::default();
    options.threading = ThreadingModel::External;
    let mut daemon = Daemon::start(options, echo_path).unwrap();
    let addr = daemon.local_addr();

    let client = thread::spawn(move || get_ok(addr, "/external"));
    // The host owns the loop: pump until the client is done.
    while !client.is_finished() {
        daemon.run_once(Some(Duration::from_millis(20))).unwrap();
        let _ = daemon.get_timeout().unwrap();
    }
    assert_eq!(client.join().unwrap(), b"/external");
    daemon.stop();
}

#[test]
fn run_once_outside_external_model_is_refused() {
    let mut daemon = Daemon::start(DaemonOptions::default(), echo_path).unwrap();
    assert!(daemon.run_once(Some(Duration::ZERO)).is_err());
    assert!(daemon.get_timeout().is_err());
    daemon.stop();
}

#[test]
fn idle_connections_are_evicted_on_timeout() {
    let mut options = DaemonOptions::default();
    options.connection_timeout = Duration::from_millis(300);
    let daemon = Daemon::start(options, echo_path).unwrap();

    let mut client = Client::connect(daemon.local_addr());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(daemon.active_connections(), 1);

    // Send nothing; the daemon must close us.
    client.expect_eof();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(daemon.active_connections(), 0);
    daemon.stop();
}

#[test]
fn accept_policy_can_refuse_connections() {
    let mut options = DaemonOptions::default();
    options.accept_policy = Some(Box::new(|_addr| false));
    let daemon = Daemon::start(options, echo_path).unwrap();

    let mut client = Client::connect(daemon.local_addr());
    client.expect_eof();
    assert_eq!(daemon.active_connections(), 0);
    daemon.stop();
}

#[test]
fn per_ip_limit_is_enforced() {
    let mut options = DaemonOptions::default();
    options.per_ip_connection_limit = 1;
    let daemon = Daemon::start(options, echo_path).unwrap();

    let mut first = Client::connect(daemon.local_addr());
    first.send(b"GET /one HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(first.read_reply().body, b"/one");

    thread::sleep(Duration::from_millis(50));
    let mut second = Client::connect(daemon.local_addr());
    second.expect_eof();
    daemon.stop();
}

struct FileHandler {
    path: std::path::PathBuf,
}

impl RequestHandler for FileHandler {
    fn handle(&self, req: &mut RequestCtx<'_>) -> Dispatch {
        let file = fs::File::open(&self.path).unwrap();
        let size = file.metadata().unwrap().len();
        req.queue_response(200, Response::from_file(file, size));
        Dispatch::Continue
    }
}

#[test]
fn file_backed_response_is_served_whole() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 239) as u8).collect();
    let path = std::env::temp_dir().join("httpd_core_file_body_test.bin");
    fs::write(&path, &payload).unwrap();

    let daemon = Daemon::start(
        DaemonOptions::default(),
        FileHandler { path: path.clone() },
    )
    .unwrap();
    let mut client = Client::connect(daemon.local_addr());
    client.send(b"GET /download HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.content_length(), Some(payload.len()));
    assert_eq!(reply.body, payload);

    daemon.stop();
    let _ = fs::remove_file(&path);
}

struct UpgradeHandler;

impl RequestHandler for UpgradeHandler {
    fn handle(&self, req: &mut RequestCtx<'_>) -> Dispatch {
        let resp = Response::for_upgrade(|mut up| {
            // Echo whatever was read past the headers, then a greeting.
            up.stream.write_all(b"upgraded:").unwrap();
            up.stream.write_all(&up.read_ahead).unwrap();
            let mut buf = [0u8; 64];
            let n = up.stream.read(&mut buf).unwrap();
            up.stream.write_all(&buf[..n]).unwrap();
        });
        resp.add_header("Upgrade", "echo");
        resp.add_header("Connection", "Upgrade");
        req.queue_response(101, resp);
        Dispatch::Continue
    }
}

#[test]
fn upgrade_hands_the_socket_to_the_application() {
    let daemon = Daemon::start(DaemonOptions::default(), UpgradeHandler).unwrap();
    let mut client = Client::connect(daemon.local_addr());

    // "early" is sent with the request; it must surface as read-ahead.
    client.send(
        b"GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\nearly",
    );
    let head = client.read_head();
    assert_eq!(head.status(), 101);
    assert_eq!(head.header("upgrade").as_deref(), Some("echo"));

    client.send(b"-ping");
    let rest = client.read_to_eof();
    assert_eq!(rest, b"upgraded:early-ping");

    thread::sleep(Duration::from_millis(100));
    assert_eq!(daemon.active_connections(), 0);
    daemon.stop();
}

struct CountingHandler {
    hits: Arc<AtomicUsize>,
}

impl RequestHandler for CountingHandler {
    fn handle(&self, req: &mut RequestCtx<'_>) -> Dispatch {
        self.hits.fetch_add(1, Ordering::Relaxed);
        req.queue_response(204, Response::empty());
        Dispatch::Continue
    }
}

#[test]
fn connection_and_completion_callbacks_balance() {
    let started = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let raw_uris = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut options = DaemonOptions::default();
    let (s, c) = (started.clone(), closed.clone());
    options.notify_connection = Some(Box::new(move |_id, event| {
        use httpd_core::ConnectionEvent;
        match event {
            ConnectionEvent::Started => s.fetch_add(1, Ordering::Relaxed),
            ConnectionEvent::Closed => c.fetch_add(1, Ordering::Relaxed),
        };
    }));
    let done = completed.clone();
    options.notify_completed = Some(Box::new(move |_id, reason| {
        use httpd_core::RequestEndReason;
        if reason == RequestEndReason::Completed {
            done.fetch_add(1, Ordering::Relaxed);
        }
    }));
    let uris = raw_uris.clone();
    options.uri_logger = Some(Box::new(move |uri| {
        uris.lock().unwrap().push(uri.to_string());
    }));
    let daemon = Daemon::start(options, CountingHandler { hits: hits.clone() }).unwrap();

    for _ in 0..3 {
        let mut client = Client::connect(daemon.local_addr());
        client.send(b"GET /x?q=%31 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
        let reply = client.read_reply();
        assert_eq!(reply.status(), 204);
        client.expect_eof();
    }
    daemon.stop();

    assert_eq!(hits.load(Ordering::Relaxed), 3);
    assert_eq!(started.load(Ordering::Relaxed), 3);
    assert_eq!(closed.load(Ordering::Relaxed), 3);
    assert_eq!(completed.load(Ordering::Relaxed), 3);
    // The logger sees the URI before unescaping.
    assert_eq!(raw_uris.lock().unwrap()[0], "/x?q=%31");
}
