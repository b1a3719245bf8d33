use std::io::{stderr, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant};
use trust_dns_proto::op::ResponseCode;

use crate::backend::QueryBackend;

/// Host-side counters, filled in by the answer/timeout callbacks.
#[derive(Default)]
pub struct Metrics {
    pub succeeded: AtomicU64,
    pub noerror_empty: AtomicU64,
    pub nxdomain: AtomicU64,
    pub servfail: AtomicU64,
    pub refused: AtomicU64,
    pub other_rcode: AtomicU64,
    pub timeouts: AtomicU64,
    pub failed: AtomicU64,
    pub completed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn classify(&self, rcode: ResponseCode) {
        match rcode {
            ResponseCode::NoError => {}
            ResponseCode::NXDomain => {
                self.nxdomain.fetch_add(1, Ordering::Relaxed);
            }
            ResponseCode::ServFail => {
                self.servfail.fetch_add(1, Ordering::Relaxed);
            }
            ResponseCode::Refused => {
                self.refused.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_rcode.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn colorize(enabled: bool, code: &str, s: String) -> String {
    if enabled {
        format!("\x1b[{}m{}\x1b[0m", code, s)
    } else {
        s
    }
}

/// Periodic `\r` status line on stderr. Aborted by the caller once the run
/// is over.
pub fn spawn_reporter(
    m: Arc<Metrics>,
    backend: Arc<QueryBackend>,
    interval_secs: u64,
    color: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_sent = 0u64;
        let start = Instant::now();
        let mut tick = interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tick.tick().await;
            let stats = backend.stats(false);
            let sent = stats.sent as u64;
            let recv = stats.received as u64;
            let ok = m.succeeded.load(Ordering::Relaxed);
            let ne = m.noerror_empty.load(Ordering::Relaxed);
            let nx = m.nxdomain.load(Ordering::Relaxed);
            let sf = m.servfail.load(Ordering::Relaxed);
            let rf = m.refused.load(Ordering::Relaxed);
            let to = m.timeouts.load(Ordering::Relaxed);

            let d_sent = sent.saturating_sub(last_sent);
            last_sent = sent;
            let rate = d_sent as f64 / (interval_secs.max(1) as f64);
            let percent = if sent > 0 { (recv as f64 / sent as f64) * 100.0 } else { 0.0 };
            let elapsed = start.elapsed().as_secs();

            let pct = colorize(color, "32", format!("{:>3.0}%", percent));
            let okc = colorize(color, "32", format!("{}", ok));
            let rat = colorize(color, "33", format!("{:.0}", rate));
            let mut err = stderr();
            let _ = write!(
                err,
                "\r[stat] sent={} recv={} ({}) ok={} queue={} rate/s={} empty={} nx={} sf={} rf={} to={} elapsed={}s",
                sent, recv, pct, okc, stats.queue, rat, ne, nx, sf, rf, to, elapsed
            );
            let _ = err.flush();
        }
    })
}
