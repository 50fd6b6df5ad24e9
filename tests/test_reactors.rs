use shoal::config::Tuning;
use shoal::server::{ServeContext, epoll, poll};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type RunFn = fn(TcpListener, Arc<ServeContext>) -> anyhow::Result<()>;

const BACKENDS: [(&str, RunFn); 2] = [
    ("poll", poll::run_with_listener),
    ("epoll", epoll::run_with_listener),
];

fn test_tuning() -> Tuning {
    Tuning {
        max_connections: 32,
        request_buf_size: 512,
        chunk_size: 8192,
        ..Tuning::default()
    }
}

fn start_server(run: RunFn, tuning: Tuning) -> (SocketAddr, Arc<ServeContext>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "0123456789").unwrap();
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("big.bin"), &big).unwrap();

    let root = std::fs::canonicalize(dir.path()).unwrap();
    let ctx = Arc::new(ServeContext::new(root, tuning));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_ctx = Arc::clone(&ctx);
    thread::spawn(move || {
        let _ = run(listener, server_ctx);
    });

    (addr, ctx, dir)
}

fn exchange(addr: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(raw).unwrap();

    let mut resp = Vec::new();
    stream.read_to_end(&mut resp).unwrap();
    resp
}

#[test]
fn test_serves_index_with_exact_body() {
    for (name, run) in BACKENDS {
        let (addr, ctx, _dir) = start_server(run, test_tuning());

        let resp = exchange(addr, b"GET / HTTP/1.1\r\nHost: t\r\n\r\n");
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 200 OK"), "{name}: {text}");
        assert!(text.contains("Content-Length: 10"), "{name}");
        assert!(text.contains("Content-Type: text/html"), "{name}");
        assert!(text.ends_with("0123456789"), "{name}");

        ctx.request_shutdown();
    }
}

#[test]
fn test_traversal_attempt_yields_404() {
    for (name, run) in BACKENDS {
        let (addr, ctx, _dir) = start_server(run, test_tuning());

        let resp = exchange(addr, b"GET /../../../../../../etc/passwd HTTP/1.0\r\n\r\n");
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 404"), "{name}: {text}");
        assert!(!text.contains("root:"), "{name}: leaked file content");

        ctx.request_shutdown();
    }
}

#[test]
fn test_malformed_request_yields_400_and_close() {
    for (name, run) in BACKENDS {
        let (addr, ctx, _dir) = start_server(run, test_tuning());

        // read_to_end returning proves the server closed the connection.
        let resp = exchange(addr, b"BLAH /x\r\n\r\n");
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 400"), "{name}: {text}");
        assert!(text.contains("Connection: close"), "{name}");

        ctx.request_shutdown();
    }
}

#[test]
fn test_oversized_request_yields_413_then_close() {
    for (name, run) in BACKENDS {
        let (addr, ctx, _dir) = start_server(run, test_tuning());

        // Exactly fills the 512-byte request buffer with no terminator.
        let resp = exchange(addr, &[b'A'; 512]);
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 413"), "{name}: {text}");
        assert!(text.contains("Connection: close"), "{name}");

        ctx.request_shutdown();
    }
}

#[test]
fn test_large_file_arrives_byte_exact() {
    for (name, run) in BACKENDS {
        let (addr, ctx, _dir) = start_server(run, test_tuning());

        let resp = exchange(addr, b"GET /big.bin HTTP/1.0\r\n\r\n");
        let header_end = resp.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let body = &resp[header_end..];
        let expected: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        assert_eq!(body.len(), expected.len(), "{name}");
        assert_eq!(body, expected.as_slice(), "{name}");

        ctx.request_shutdown();
    }
}

#[test]
fn test_pool_exhaustion_closes_excess_connection() {
    for (name, run) in BACKENDS {
        let tuning = Tuning {
            max_connections: 2,
            ..test_tuning()
        };
        let (addr, ctx, _dir) = start_server(run, tuning);

        // Two idle clients hold both slots.
        let holders: Vec<TcpStream> = (0..2)
            .map(|_| {
                let s = TcpStream::connect(addr).unwrap();
                s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                s
            })
            .collect();

        // Give the reactor a moment to admit them.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(ctx.stats.snapshot().active, 2, "{name}");

        // The third connection is closed without any protocol exchange.
        let mut rejected = TcpStream::connect(addr).unwrap();
        rejected
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = Vec::new();
        rejected.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty(), "{name}: rejected connection got data");

        // Active count never exceeded the capacity.
        assert!(ctx.stats.snapshot().peak_active <= 2, "{name}");

        drop(holders);
        ctx.request_shutdown();
    }
}

#[test]
fn test_slots_are_reused_across_clients() {
    for (name, run) in BACKENDS {
        let tuning = Tuning {
            max_connections: 2,
            ..test_tuning()
        };
        let (addr, ctx, _dir) = start_server(run, tuning);

        // More sequential clients than slots: each release must recycle.
        for _ in 0..6 {
            let resp = exchange(addr, b"GET / HTTP/1.0\r\n\r\n");
            assert!(
                String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 200"),
                "{name}"
            );
        }

        let snapshot = ctx.stats.snapshot();
        assert!(snapshot.total_connections >= 6, "{name}");
        assert!(snapshot.peak_active <= 2, "{name}");

        ctx.request_shutdown();
    }
}
