use anyhow::{Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::net::SocketAddrV6;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use trust_dns_proto::op::Message;
use trust_dns_proto::rr::RecordType;

use crate::backend::QueryBackend;
use crate::cli::BenchArgs;
use crate::endpoint::UdpEndpoint;
use crate::wire::Question;

/// Measure the approximate sustained send rate for a short fixed window by
/// firing queries for random labels under the given domain. The labels are
/// throwaway, so answers (usually NXDOMAIN) only matter for the recv count.
pub async fn run(args: &BenchArgs, resolvers: Vec<SocketAddrV6>) -> Result<()> {
    let mut rng = ChaCha20Rng::from_entropy();
    let questions: Arc<Vec<Question>> = Arc::new(
        (0..args.count.max(1))
            .map(|_| {
                let label: String = (0..8)
                    .map(|_| {
                        let c = rng.gen_range(0u8..36u8);
                        if c < 10 {
                            (b'0' + c) as char
                        } else {
                            (b'a' + c - 10) as char
                        }
                    })
                    .collect();
                Question::new(format!("{}.{}", label, args.domain), RecordType::A)
            })
            .collect(),
    );

    let endpoint = Arc::new(UdpEndpoint::bind(args.common.bind)?);
    let backend = QueryBackend::new(
        resolvers,
        args.common.concurrent,
        args.common.timeout.max(1),
        true,
        endpoint,
    )?;
    let q = questions.clone();
    backend.set_callbacks(
        move |id| q[id as usize].clone(),
        |_msg: &Message, _id| {},
        |_id| {},
    );
    for id in 0..questions.len() as u64 {
        backend.queue(id);
    }

    let start = Instant::now();
    backend.start();
    tokio::time::sleep(Duration::from_secs(args.window.max(1))).await;
    let stats = backend.stats(false);
    {
        let backend = backend.clone();
        tokio::task::spawn_blocking(move || backend.stop_join())
            .await
            .context("joining backend threads")?;
    }

    let secs = start.elapsed().as_secs_f64();
    let pps = if secs > 0.0 { stats.sent as f64 / secs } else { 0.0 };
    eprintln!(
        "bench: window={:.1}s sent={} (~{:.0} pps) recv={} queue={}",
        secs, stats.sent, pps, stats.received, stats.queue
    );
    Ok(())
}
