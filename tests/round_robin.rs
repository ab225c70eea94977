use std::collections::HashSet;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

mod util;

use util::{wait_until, TestServer};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn connections_round_robin_across_workers() {
    const WORKERS: usize = 4;
    const CONNECTIONS: usize = 8;

    // (connection sequence number, worker thread it landed on)
    let placements: Arc<Mutex<Vec<(u64, std::thread::ThreadId)>>> = Arc::default();

    let server = {
        let placements = Arc::clone(&placements);
        TestServer::start(WORKERS, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    let seq = conn
                        .name()
                        .rsplit('#')
                        .next()
                        .and_then(|s| s.parse().ok())
                        .expect("connection name carries a sequence number");
                    placements
                        .lock()
                        .unwrap()
                        .push((seq, std::thread::current().id()));
                }
            });
        })
    };

    let _streams: Vec<TcpStream> = (0..CONNECTIONS)
        .map(|_| TcpStream::connect(server.addr).expect("connect"))
        .collect();

    assert!(wait_until(TIMEOUT, || placements.lock().unwrap().len() == CONNECTIONS));

    let mut placements = placements.lock().unwrap().clone();
    placements.sort_by_key(|(seq, _)| *seq);
    let workers: Vec<ThreadId> = placements.iter().map(|(_, id)| *id).collect();

    // Connection k (1-based) lands on worker (k - 1) mod N.
    for k in 0..CONNECTIONS - WORKERS {
        assert_eq!(workers[k], workers[k + WORKERS], "connection {} wrapped wrong", k + 1);
    }
    let distinct: HashSet<ThreadId> = workers.iter().take(WORKERS).copied().collect();
    assert_eq!(distinct.len(), WORKERS);
}

#[test]
fn thread_init_runs_once_per_worker() {
    const WORKERS: usize = 3;
    let init_threads: Arc<Mutex<Vec<ThreadId>>> = Arc::default();

    let _server = {
        let init_threads = Arc::clone(&init_threads);
        TestServer::start(WORKERS, move |server| {
            server.set_thread_init_callback(move |event_loop| {
                assert!(event_loop.is_in_loop_thread());
                init_threads.lock().unwrap().push(std::thread::current().id());
            });
        })
    };

    // start() returns only after every worker published its loop, and the
    // init callback runs before that.
    let init_threads = init_threads.lock().unwrap();
    assert_eq!(init_threads.len(), WORKERS);
    let distinct: HashSet<ThreadId> = init_threads.iter().copied().collect();
    assert_eq!(distinct.len(), WORKERS);
}

#[test]
fn zero_workers_serve_on_the_base_loop() {
    let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::default();

    let server = {
        let seen = Arc::clone(&seen);
        TestServer::start(0, move |server| {
            server.set_message_callback(move |conn, input, _ts| {
                seen.lock().unwrap().push(std::thread::current().id());
                let data = input.take();
                conn.send(&data);
            });
        })
    };

    use std::io::{Read, Write};
    let mut a = TcpStream::connect(server.addr).expect("connect");
    let mut b = TcpStream::connect(server.addr).expect("connect");
    for stream in [&mut a, &mut b] {
        stream.write_all(b"hi").expect("write");
        let mut buf = [0; 2];
        stream.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"hi");
    }

    // Both connections were served by one thread: the base loop's.
    assert!(wait_until(TIMEOUT, || seen.lock().unwrap().len() == 2));
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], seen[1]);
}
