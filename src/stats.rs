use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::info;

use crate::port::Port;
use crate::ring::CachePadded;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn add(&self, n: u64) {
        if n != 0 {
            self.0.fetch_add(n, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ==========================================
// Per-direction counters
// ==========================================

/// Written by the ingress stage of the source port.
#[derive(Debug, Default)]
pub struct IngressCounters {
    pub rx: Counter,
    pub loss_dropped: Counter,
    pub duplicated: Counter,
    pub clone_failed: Counter,
    pub delay_overflow: Counter,
}

/// Written by the delay stage of the source port.
#[derive(Debug, Default)]
pub struct DelayCounters {
    pub released: Counter,
    pub egress_overflow: Counter,
}

/// Written by the egress stage of the destination port.
#[derive(Debug, Default)]
pub struct EgressCounters {
    pub tx: Counter,
    pub tx_bits: Counter,
    pub token_starved: Counter,
    /// Frames the device refused for good.
    pub tx_error: Counter,
}

/// Counters for one direction of a link (`a -> b`), grouped by the stage
/// that writes them so no two cores share a cache line.
pub struct PathStats {
    label: String,
    pub ingress: CachePadded<IngressCounters>,
    pub delay: CachePadded<DelayCounters>,
    pub egress: CachePadded<EgressCounters>,
}

impl PathStats {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            ingress: CachePadded::new(IngressCounters::default()),
            delay: CachePadded::new(DelayCounters::default()),
            egress: CachePadded::new(EgressCounters::default()),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let i = &self.ingress.value;
        let d = &self.delay.value;
        let e = &self.egress.value;
        StatsSnapshot {
            rx: i.rx.get(),
            loss_dropped: i.loss_dropped.get(),
            duplicated: i.duplicated.get(),
            clone_failed: i.clone_failed.get(),
            delay_overflow: i.delay_overflow.get(),
            released: d.released.get(),
            egress_overflow: d.egress_overflow.get(),
            tx: e.tx.get(),
            tx_bits: e.tx_bits.get(),
            token_starved: e.token_starved.get(),
            tx_error: e.tx_error.get(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx: u64,
    pub loss_dropped: u64,
    pub duplicated: u64,
    pub clone_failed: u64,
    pub delay_overflow: u64,
    pub released: u64,
    pub egress_overflow: u64,
    pub tx: u64,
    pub tx_bits: u64,
    pub token_starved: u64,
    pub tx_error: u64,
}

impl StatsSnapshot {
    /// Packets that entered the path, duplicates included.
    pub fn admitted(&self) -> u64 {
        self.rx + self.duplicated
    }

    /// Packets dropped anywhere after capture.
    pub fn dropped(&self) -> u64 {
        self.loss_dropped
            + self.delay_overflow
            + self.egress_overflow
            + self.token_starved
            + self.tx_error
    }

    /// Packets neither transmitted nor dropped yet.
    pub fn in_flight(&self) -> u64 {
        self.admitted().saturating_sub(self.tx + self.dropped())
    }

    pub fn is_conserved(&self, in_flight: u64) -> bool {
        self.admitted() == self.tx + self.dropped() + in_flight
    }

    fn delta(&self, prev: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            rx: self.rx - prev.rx,
            loss_dropped: self.loss_dropped - prev.loss_dropped,
            duplicated: self.duplicated - prev.duplicated,
            clone_failed: self.clone_failed - prev.clone_failed,
            delay_overflow: self.delay_overflow - prev.delay_overflow,
            released: self.released - prev.released,
            egress_overflow: self.egress_overflow - prev.egress_overflow,
            tx: self.tx - prev.tx,
            tx_bits: self.tx_bits - prev.tx_bits,
            token_starved: self.token_starved - prev.token_starved,
            tx_error: self.tx_error - prev.tx_error,
        }
    }
}

// ==========================================
// Periodic report
// ==========================================

/// Capture-side drops of one port, outside any path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CaptureDrops {
    no_buffer: u64,
    truncated: u64,
}

impl CaptureDrops {
    fn read(port: &dyn Port) -> Self {
        Self {
            no_buffer: port.rx_no_buffer(),
            truncated: port.rx_truncated(),
        }
    }
}

pub struct StatsReporter {
    paths: Vec<Arc<PathStats>>,
    last: Vec<StatsSnapshot>,
    ports: Vec<Arc<dyn Port>>,
    last_capture: Vec<CaptureDrops>,
    last_report: Instant,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(paths: Vec<Arc<PathStats>>, interval: Duration) -> Self {
        let last = vec![StatsSnapshot::default(); paths.len()];
        Self {
            paths,
            last,
            ports: Vec::new(),
            last_capture: Vec::new(),
            last_report: Instant::now(),
            interval,
        }
    }

    /// Also report capture drops of `ports`.
    pub fn with_ports(mut self, ports: Vec<Arc<dyn Port>>) -> Self {
        self.last_capture = vec![CaptureDrops::default(); ports.len()];
        self.ports = ports;
        self
    }

    pub fn check_and_report(&mut self) {
        let elapsed = self.last_report.elapsed();
        if elapsed < self.interval {
            return;
        }
        let secs = elapsed.as_secs_f64();
        let now_str = Local::now().format("%H:%M:%S").to_string();
        info!("[{now_str}] link statistics over {secs:.1}s");

        for (path, last) in self.paths.iter().zip(self.last.iter_mut()) {
            let now = path.snapshot();
            let d = now.delta(last);
            let mbps = d.tx_bits as f64 / 1_000_000.0 / secs;
            info!(
                path = path.label(),
                rx_pps = (d.rx as f64 / secs) as u64,
                tx_pps = (d.tx as f64 / secs) as u64,
                mbps = (mbps * 100.0).round() / 100.0,
                lost = d.loss_dropped,
                dup = d.duplicated,
                overflow = d.delay_overflow + d.egress_overflow,
                starved = d.token_starved,
                tx_error = d.tx_error,
                in_flight = now.in_flight(),
                "path"
            );
            *last = now;
        }
        for (port, last) in self.ports.iter().zip(self.last_capture.iter_mut()) {
            let now = CaptureDrops::read(port.as_ref());
            info!(
                port = port.name(),
                rx_no_buffer = now.no_buffer - last.no_buffer,
                rx_truncated = now.truncated - last.truncated,
                "capture"
            );
            *last = now;
        }
        self.last_report = Instant::now();
    }

    pub fn summary(&self) {
        for path in &self.paths {
            let s = path.snapshot();
            info!(
                path = path.label(),
                rx = s.rx,
                tx = s.tx,
                lost = s.loss_dropped,
                duplicated = s.duplicated,
                clone_failed = s.clone_failed,
                delay_overflow = s.delay_overflow,
                egress_overflow = s.egress_overflow,
                token_starved = s.token_starved,
                tx_error = s.tx_error,
                "final statistics"
            );
        }
        for port in &self.ports {
            let drops = CaptureDrops::read(port.as_ref());
            info!(
                port = port.name(),
                rx_no_buffer = drops.no_buffer,
                rx_truncated = drops.truncated,
                "final capture statistics"
            );
        }
    }
}
