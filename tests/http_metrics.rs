use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use taskscheduler::{JobSpec, Scheduler, SchedulerOptions};

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn scrape(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to metrics exposer");
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

/// End-to-end: a scheduler with an HTTP exposer enabled runs a real job and
/// the counters it bumps are observable by scraping `/metrics` over an
/// actual socket, not just by calling `metrics_snapshot()` in-process.
#[test]
fn metrics_endpoint_reflects_a_completed_job() {
    let opts = SchedulerOptions {
        metrics_http_port: 18_453,
        ..SchedulerOptions::default()
    };
    let scheduler = Scheduler::new(opts);
    scheduler.start();

    let id = scheduler.submit(JobSpec {
        cmd: "true".to_string(),
        cpu_cores: 1,
        memory_mb: 16,
        timeout_sec: 5,
        priority: 0,
    });
    assert!(id > 0);

    assert!(wait_until(
        || scheduler.metrics_snapshot().succeeded >= 1,
        Duration::from_secs(5)
    ));

    let response = scrape(18_453, "/metrics");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Connection: close"));
    assert!(response.contains("tasks_total{status=\"submitted\"} 1"));
    assert!(response.contains("tasks_total{status=\"succeeded\"} 1"));
    assert!(response.contains("tasks_running_current 0"));

    scheduler.stop();
}

/// Any path other than `/metrics` gets the fixed `"ok\n"` health body —
/// routing is a strict allowlist of one path, not prefix matching.
#[test]
fn unrelated_paths_get_the_fixed_health_body() {
    let opts = SchedulerOptions {
        metrics_http_port: 18_454,
        ..SchedulerOptions::default()
    };
    let scheduler = Scheduler::new(opts);
    scheduler.start();

    let response = scrape(18_454, "/health");
    assert!(response.ends_with("ok\n"));

    let response = scrape(18_454, "/anything/else");
    assert!(response.ends_with("ok\n"));

    scheduler.stop();
}
