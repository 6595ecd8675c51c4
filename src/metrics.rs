//! Metrics registry and Prometheus text exposition.
//!
//! Counters and histograms are plain atomics; labeled families keep one
//! atomic cell per observed label set behind a read-mostly map. Rendering
//! walks the registry and emits `text/plain; version=0.0.4` by hand.
//!
//! Counters are monotone for the process lifetime. Route labels pass
//! through [`normalize_route`] before recording so id-bearing paths cannot
//! explode cardinality.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Histogram bucket upper bounds, seconds.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Histogram {
    bucket_counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            bucket_counts: (0..DURATION_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    pub fn observe(&self, seconds: f64) {
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum_micros
            .fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, name: &str, labels: &str, out: &mut String) {
        let mut cumulative = 0u64;
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            cumulative += self.bucket_counts[i].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "{}_bucket{{{}le=\"{}\"}} {}",
                name,
                label_prefix(labels),
                bound,
                cumulative
            );
        }
        let total = self.count.load(Ordering::Relaxed);
        let _ = writeln!(
            out,
            "{}_bucket{{{}le=\"+Inf\"}} {}",
            name,
            label_prefix(labels),
            total
        );
        let _ = writeln!(
            out,
            "{}_sum{} {}",
            name,
            braced(labels),
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6
        );
        let _ = writeln!(out, "{}_count{} {}", name, braced(labels), total);
    }
}

/// Counter family keyed by a rendered label set (`status="ok",mode="single"`).
#[derive(Default)]
pub struct LabeledCounter {
    cells: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl LabeledCounter {
    pub fn inc(&self, labels: &str) {
        if let Some(cell) = self.cells.read().get(labels) {
            cell.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut cells = self.cells.write();
        cells
            .entry(labels.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, labels: &str, n: u64) {
        if let Some(cell) = self.cells.read().get(labels) {
            cell.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let mut cells = self.cells.write();
        cells
            .entry(labels.to_string())
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &str) -> u64 {
        self.cells
            .read()
            .get(labels)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let cells = self.cells.read();
        let mut keys: Vec<_> = cells.keys().collect();
        keys.sort();
        for key in keys {
            let value = cells[key].load(Ordering::Relaxed);
            let _ = writeln!(out, "{}{} {}", name, braced(key), value);
        }
    }
}

/// Histogram family keyed by a rendered label set.
#[derive(Default)]
pub struct LabeledHistogram {
    cells: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl LabeledHistogram {
    pub fn observe(&self, labels: &str, seconds: f64) {
        if let Some(cell) = self.cells.read().get(labels) {
            cell.observe(seconds);
            return;
        }
        let cell = {
            let mut cells = self.cells.write();
            cells.entry(labels.to_string()).or_default().clone()
        };
        cell.observe(seconds);
    }

    fn render(&self, name: &str, out: &mut String) {
        let cells = self.cells.read();
        let mut keys: Vec<_> = cells.keys().collect();
        keys.sort();
        for key in keys {
            cells[key].render(name, key, out);
        }
    }
}

pub struct Metrics {
    pub recognition_total: LabeledCounter,
    pub registration_total: LabeledCounter,
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    pub batch_jobs_total: LabeledCounter,
    pub batch_images_total: LabeledCounter,
    pub http_requests_total: LabeledCounter,
    pub index_sync_failures_total: Counter,

    pub recognition_duration: LabeledHistogram,
    pub registration_duration: LabeledHistogram,
    pub hnsw_search_duration: Histogram,
    pub db_query_duration: LabeledHistogramByOperation,
    pub http_request_duration: LabeledHistogram,

    pub hnsw_index_size: Gauge,
    pub active_users: Gauge,
    pub gpu_memory_used_bytes: Gauge,
    pub gpu_memory_total_bytes: Gauge,
    pub gpu_active: Gauge,
}

/// Thin wrapper so call sites pass the bare operation name.
#[derive(Default)]
pub struct LabeledHistogramByOperation(LabeledHistogram);

impl LabeledHistogramByOperation {
    pub fn observe(&self, operation: &str, seconds: f64) {
        self.0
            .observe(&format!("operation=\"{}\"", operation), seconds);
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            recognition_total: LabeledCounter::default(),
            registration_total: LabeledCounter::default(),
            cache_hits_total: Counter::default(),
            cache_misses_total: Counter::default(),
            batch_jobs_total: LabeledCounter::default(),
            batch_images_total: LabeledCounter::default(),
            http_requests_total: LabeledCounter::default(),
            index_sync_failures_total: Counter::default(),
            recognition_duration: LabeledHistogram::default(),
            registration_duration: LabeledHistogram::default(),
            hnsw_search_duration: Histogram::default(),
            db_query_duration: LabeledHistogramByOperation::default(),
            http_request_duration: LabeledHistogram::default(),
            hnsw_index_size: Gauge::default(),
            active_users: Gauge::default(),
            gpu_memory_used_bytes: Gauge::default(),
            gpu_memory_total_bytes: Gauge::default(),
            gpu_active: Gauge::default(),
        }
    }

    pub fn record_recognition(&self, status: &str, mode: &str, seconds: f64) {
        let labels = format!("status=\"{}\",mode=\"{}\"", status, mode);
        self.recognition_total.inc(&labels);
        self.recognition_duration.observe(&labels, seconds);
    }

    pub fn record_registration(&self, status: &str, seconds: f64) {
        let labels = format!("status=\"{}\"", status);
        self.registration_total.inc(&labels);
        self.registration_duration.observe(&labels, seconds);
    }

    pub fn record_http(&self, method: &str, route: &str, status_code: u16, seconds: f64) {
        let route = normalize_route(route);
        self.http_requests_total.inc(&format!(
            "method=\"{}\",route=\"{}\",status_code=\"{}\"",
            method, route, status_code
        ));
        self.http_request_duration.observe(
            &format!("method=\"{}\",route=\"{}\"", method, route),
            seconds,
        );
    }

    /// Render the whole registry in Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(8192);

        out.push_str("# TYPE recognition_total counter\n");
        self.recognition_total.render("recognition_total", &mut out);
        out.push_str("# TYPE registration_total counter\n");
        self.registration_total
            .render("registration_total", &mut out);

        out.push_str("# TYPE cache_hits_total counter\n");
        let _ = writeln!(out, "cache_hits_total {}", self.cache_hits_total.get());
        out.push_str("# TYPE cache_misses_total counter\n");
        let _ = writeln!(out, "cache_misses_total {}", self.cache_misses_total.get());

        out.push_str("# TYPE batch_jobs_total counter\n");
        self.batch_jobs_total.render("batch_jobs_total", &mut out);
        out.push_str("# TYPE batch_images_total counter\n");
        self.batch_images_total
            .render("batch_images_total", &mut out);

        out.push_str("# TYPE http_requests_total counter\n");
        self.http_requests_total
            .render("http_requests_total", &mut out);

        out.push_str("# TYPE index_sync_failures_total counter\n");
        let _ = writeln!(
            out,
            "index_sync_failures_total {}",
            self.index_sync_failures_total.get()
        );

        out.push_str("# TYPE recognition_duration_seconds histogram\n");
        self.recognition_duration
            .render("recognition_duration_seconds", &mut out);
        out.push_str("# TYPE registration_duration_seconds histogram\n");
        self.registration_duration
            .render("registration_duration_seconds", &mut out);
        out.push_str("# TYPE hnsw_search_duration_seconds histogram\n");
        self.hnsw_search_duration
            .render("hnsw_search_duration_seconds", "", &mut out);
        out.push_str("# TYPE db_query_duration_seconds histogram\n");
        self.db_query_duration
            .0
            .render("db_query_duration_seconds", &mut out);
        out.push_str("# TYPE http_request_duration_seconds histogram\n");
        self.http_request_duration
            .render("http_request_duration_seconds", &mut out);

        out.push_str("# TYPE hnsw_index_size gauge\n");
        let _ = writeln!(out, "hnsw_index_size {}", self.hnsw_index_size.get());
        out.push_str("# TYPE active_users gauge\n");
        let _ = writeln!(out, "active_users {}", self.active_users.get());

        out.push_str("# TYPE gpu_memory_used_bytes gauge\n");
        let _ = writeln!(
            out,
            "gpu_memory_used_bytes {}",
            self.gpu_memory_used_bytes.get()
        );
        out.push_str("# TYPE gpu_memory_total_bytes gauge\n");
        let _ = writeln!(
            out,
            "gpu_memory_total_bytes {}",
            self.gpu_memory_total_bytes.get()
        );
        out.push_str("# TYPE tensorflow_gpu_active gauge\n");
        let _ = writeln!(out, "tensorflow_gpu_active {}", self.gpu_active.get());

        out.push_str("# TYPE process_resident_memory_bytes gauge\n");
        let _ = writeln!(
            out,
            "process_resident_memory_bytes {}",
            resident_memory_bytes()
        );
        out.push_str("# TYPE process_threads gauge\n");
        let _ = writeln!(out, "process_threads {}", process_threads());

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn braced(labels: &str) -> String {
    if labels.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", labels)
    }
}

fn label_prefix(labels: &str) -> String {
    if labels.is_empty() {
        String::new()
    } else {
        format!("{},", labels)
    }
}

/// Resident set size from procfs; 0 where unavailable.
fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

fn process_threads() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("Threads:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|n| n.parse::<u64>().ok())
        })
        .unwrap_or(0)
}

/// Collapse id-bearing path segments so the route label space stays small.
///
/// - UUID-shaped segments → `:uuid`
/// - all-digit segments → `:id`
/// - mixed alphanumerics of 6–20 chars (at least one digit) → `:ci`
///
/// The digit requirement keeps literal route words ("recognition",
/// "register") out of the `:ci` bucket.
pub fn normalize_route(path: &str) -> String {
    let normalized: Vec<String> = path
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                return segment.to_string();
            }
            if is_uuid_segment(segment) {
                return ":uuid".to_string();
            }
            if segment.chars().all(|c| c.is_ascii_digit()) {
                return ":id".to_string();
            }
            let len_ok = (6..=20).contains(&segment.len());
            let alnum = segment.chars().all(|c| c.is_ascii_alphanumeric());
            let has_digit = segment.chars().any(|c| c.is_ascii_digit());
            let has_alpha = segment.chars().any(|c| c.is_ascii_alphabetic());
            if len_ok && alnum && has_digit && has_alpha {
                return ":ci".to_string();
            }
            segment.to_string()
        })
        .collect();
    normalized.join("/")
}

fn is_uuid_segment(segment: &str) -> bool {
    if segment.len() != 36 {
        return false;
    }
    segment.chars().enumerate().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit(),
    })
}
