//! A minimal hand-rolled HTTP/1.1 exposer for the `/metrics` endpoint.
//!
//! This deliberately does not pull in an async HTTP framework: the
//! contract (bounded accept queue, fixed worker pool, `Connection: close`
//! replies) is a thread-pool-over-raw-sockets pattern, not a service mesh.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

const ACCEPT_BACKLOG: i32 = 64;
const WORK_QUEUE_CAPACITY: usize = 128;
const READ_BUF_SIZE: usize = 1024;

type MetricsHandler = Arc<dyn Fn() -> String + Send + Sync>;

struct Shared {
    running: AtomicBool,
    queue: Mutex<VecDeque<TcpStream>>,
    cv: Condvar,
}

/// Accepts TCP connections and dispatches `GET /metrics` / everything-else
/// to a small fixed worker pool.
pub struct HttpExposer {
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    accept_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl HttpExposer {
    pub fn new() -> Self {
        HttpExposer {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
            }),
            listener: None,
            accept_thread: None,
            workers: Vec::new(),
        }
    }

    pub fn start(
        &mut self,
        port: u16,
        handler: impl Fn() -> String + Send + Sync + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        // `TcpListener::bind` doesn't expose a backlog knob portably; the
        // kernel default is adequate here, ACCEPT_BACKLOG documents intent.
        let _ = ACCEPT_BACKLOG;

        self.shared.running.store(true, Ordering::SeqCst);
        let handler: MetricsHandler = Arc::new(handler);

        let accept_listener = listener.try_clone()?;
        let accept_shared = Arc::clone(&self.shared);
        self.accept_thread = Some(
            std::thread::Builder::new()
                .name("http-accept".to_string())
                .spawn(move || accept_loop(accept_listener, accept_shared))
                .expect("spawn http-accept thread"),
        );

        let worker_count = std::cmp::max(2, num_cpus::get());
        for i in 0..worker_count {
            let shared = Arc::clone(&self.shared);
            let handler = Arc::clone(&handler);
            self.workers.push(
                std::thread::Builder::new()
                    .name(format!("http-worker-{i}"))
                    .spawn(move || worker_loop(shared, handler))
                    .expect("spawn http-worker thread"),
            );
        }

        tracing::info!(port, "metrics HTTP server started");
        self.listener = Some(listener);
        Ok(())
    }

    /// The address actually bound, once [`HttpExposer::start`] has run.
    /// Useful when `start` was called with port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the listener unblocks `accept()` on most platforms; an
        // explicit local connect nudges it loose everywhere else.
        if let Some(listener) = &self.listener {
            if let Ok(addr) = listener.local_addr() {
                let _ = TcpStream::connect(addr);
            }
        }
        self.shared.cv.notify_all();
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
        for t in self.workers.drain(..) {
            let _ = t.join();
        }
        self.listener = None;
        tracing::info!("metrics HTTP server stopped");
    }
}

impl Drop for HttpExposer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let mut queue = shared.queue.lock().unwrap();
                if queue.len() < WORK_QUEUE_CAPACITY {
                    queue.push_back(stream);
                    shared.cv.notify_one();
                } else {
                    drop(stream);
                }
            }
            Err(_) => {
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, handler: MetricsHandler) {
    loop {
        let stream = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if !shared.running.load(Ordering::SeqCst) && queue.is_empty() {
                    return;
                }
                if let Some(stream) = queue.pop_front() {
                    break stream;
                }
                queue = shared.cv.wait(queue).unwrap();
            }
        };
        handle_connection(stream, &handler);
    }
}

fn handle_connection(mut stream: TcpStream, handler: &MetricsHandler) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let n = stream.read(&mut buf).unwrap_or(0);
    let path = if n > 0 {
        parse_path(&buf[..n]).unwrap_or_else(|| "/".to_string())
    } else {
        "/".to_string()
    };

    let body = if path == "/metrics" {
        handler()
    } else {
        "ok\n".to_string()
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

fn parse_path(req: &[u8]) -> Option<String> {
    let line_end = req.iter().position(|&b| b == b'\n').unwrap_or(req.len());
    let line = std::str::from_utf8(&req[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    parts.next()?; // method
    parts.next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_extracts_request_target() {
        assert_eq!(parse_path(b"GET /metrics HTTP/1.1\r\n"), Some("/metrics".to_string()));
        assert_eq!(parse_path(b"GET / HTTP/1.1\r\n"), Some("/".to_string()));
        assert_eq!(parse_path(b"GET /health HTTP/1.1\r\n"), Some("/health".to_string()));
    }

    #[test]
    fn start_stop_and_metrics_round_trip() {
        let mut exposer = HttpExposer::new();
        exposer
            .start(0, || "tasks_total{status=\"submitted\"} 1\n".to_string())
            .unwrap();
        let addr = exposer.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.contains("200 OK"));
        assert!(response.contains("Connection: close"));
        assert!(response.contains("tasks_total{status=\"submitted\"} 1"));

        exposer.stop();
    }

    #[test]
    fn unknown_path_returns_ok() {
        let mut exposer = HttpExposer::new();
        exposer.start(0, || String::new()).unwrap();
        let addr = exposer.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET /health HTTP/1.1\r\n\r\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.ends_with("ok\n"));

        exposer.stop();
    }
}
