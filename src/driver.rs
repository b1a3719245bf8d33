use anyhow::{bail, Context, Result};
use log::warn;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trust_dns_proto::op::{Message, ResponseCode};

use crate::backend::QueryBackend;
use crate::endpoint::{Endpoint, UdpEndpoint};
use crate::metrics::{spawn_reporter, Metrics};
use crate::options::Options;
use crate::output::{build_writers, RecordRow};

#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub sent: u32,
    pub received: u32,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
}

/// Run the full query flow against real UDP resolvers.
pub async fn run(opt: Options) -> Result<()> {
    opt.check()?;
    let endpoint = Arc::new(UdpEndpoint::bind(opt.bind)?);
    if !opt.quiet {
        eprintln!(
            "Running with {} resolvers and {} queries.",
            opt.resolvers.len(),
            opt.questions.len()
        );
    }
    let summary = execute(&opt, endpoint).await?;
    if !opt.quiet {
        eprintln!(
            "Done! sent {} queries; got {} answers, {} successful ({} timed out, {} given up).",
            summary.sent, summary.received, summary.succeeded, summary.timeouts, summary.failed
        );
    }
    Ok(())
}

/// Drive the backend over an arbitrary endpoint until every query is
/// answered or given up, or until the sent counter stalls for `timeout + 1`
/// one-second samples. A stall with work still queued means no resolver is
/// responding anymore and is an error.
pub async fn execute(opt: &Options, endpoint: Arc<dyn Endpoint>) -> Result<RunSummary> {
    let writers =
        Arc::new(build_writers(opt.output.clone(), &opt.output_type, opt.output.is_none(), opt.gzip, opt.append)?);
    let metrics = Metrics::new();
    let questions = Arc::new(opt.questions.clone());
    let total = questions.len() as u64;
    let attempts: Arc<Vec<AtomicU32>> =
        Arc::new((0..questions.len()).map(|_| AtomicU32::new(0)).collect());

    let backend = QueryBackend::new(
        opt.resolvers.clone(),
        opt.concurrent,
        opt.timeout,
        opt.keep_capacity,
        endpoint,
    )?;

    let q_questions = questions.clone();
    let a_metrics = metrics.clone();
    let a_writers = writers.clone();
    let t_metrics = metrics.clone();
    let t_backend = Arc::downgrade(&backend);
    let retry = opt.retry;
    backend.set_callbacks(
        move |id| q_questions[id as usize].clone(),
        move |msg: &Message, _id| {
            let rcode = msg.response_code();
            a_metrics.classify(rcode);
            if rcode == ResponseCode::NoError && !msg.answers().is_empty() {
                for rec in msg.answers() {
                    let row = RecordRow::from_record(rec);
                    for w in a_writers.iter() {
                        if let Err(e) = w.write(&row) {
                            warn!("failed to write record for {}: {e}", row.name);
                        }
                    }
                }
                a_metrics.succeeded.fetch_add(1, Ordering::Relaxed);
            } else if rcode == ResponseCode::NoError {
                a_metrics.noerror_empty.fetch_add(1, Ordering::Relaxed);
            }
            a_metrics.completed.fetch_add(1, Ordering::Relaxed);
        },
        move |id| {
            t_metrics.timeouts.fetch_add(1, Ordering::Relaxed);
            let tried = attempts[id as usize].fetch_add(1, Ordering::Relaxed) + 1;
            if retry < 0 || tried <= retry as u32 {
                if let Some(backend) = t_backend.upgrade() {
                    backend.queue(id);
                }
            } else {
                t_metrics.failed.fetch_add(1, Ordering::Relaxed);
                t_metrics.completed.fetch_add(1, Ordering::Relaxed);
            }
        },
    );

    for id in 0..total {
        backend.queue(id);
    }
    backend.start();

    let reporter = (!opt.quiet)
        .then(|| spawn_reporter(metrics.clone(), backend.clone(), opt.progress_interval, opt.color));

    let mut prev_sent = 0u32;
    let mut hang = 0u64;
    let mut stalled_with_queue = false;
    loop {
        if metrics.completed.load(Ordering::Relaxed) >= total {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        if metrics.completed.load(Ordering::Relaxed) >= total {
            break;
        }
        let stats = backend.stats(false);
        if stats.sent == prev_sent {
            hang += 1;
            if hang == opt.timeout + 1 {
                stalled_with_queue = stats.queue > 0;
                break;
            }
        } else {
            hang = 0;
        }
        prev_sent = stats.sent;
    }

    if let Some(reporter) = reporter {
        reporter.abort();
        eprintln!();
    }

    {
        let backend = backend.clone();
        tokio::task::spawn_blocking(move || backend.stop_join())
            .await
            .context("joining backend threads")?;
    }
    for w in writers.iter() {
        if let Err(e) = w.close() {
            warn!("failed to flush output: {e}");
        }
    }

    let stats = backend.stats(false);
    if stalled_with_queue {
        bail!("no resolvers are responding anymore");
    }
    Ok(RunSummary {
        sent: stats.sent,
        received: stats.received,
        succeeded: metrics.succeeded.load(Ordering::Relaxed),
        failed: metrics.failed.load(Ordering::Relaxed),
        timeouts: metrics.timeouts.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::loopback::LoopbackEndpoint;
    use crate::options::{parse_question_list, parse_resolver_list};
    use std::io::{Cursor, Read};
    use trust_dns_proto::op::MessageType;
    use trust_dns_proto::rr::{RData, Record};
    use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable};

    fn base_options(questions: &str, output: Option<std::path::PathBuf>) -> Options {
        Options {
            resolvers: parse_resolver_list(Cursor::new("192.0.2.1\n"), 53).unwrap(),
            questions: parse_question_list(Cursor::new(questions)).unwrap(),
            concurrent: 2,
            timeout: 1,
            retry: 0,
            keep_capacity: false,
            quiet: true,
            output,
            output_type: "txt".into(),
            gzip: false,
            append: false,
            bind: None,
            progress_interval: 1,
            color: false,
        }
    }

    fn echo_answer(query: &[u8]) -> Vec<u8> {
        let q = Message::from_bytes(query).unwrap();
        let mut msg = Message::new();
        msg.set_id(q.id());
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        let query = q.queries()[0].clone();
        let rec = Record::from_rdata(
            query.name().clone(),
            60,
            RData::A(std::net::Ipv4Addr::new(198, 51, 100, 7).into()),
        );
        msg.add_query(query);
        msg.add_answer(rec);
        msg.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn answered_run_completes_and_writes_records() {
        let out = std::env::temp_dir().join("rhammer-driver-run-test.txt");
        let opt = base_options("a.example.com A\nb.example.com A\nc.example.com A\n", Some(out.clone()));
        let endpoint = LoopbackEndpoint::new();
        endpoint.set_responder(Box::new(|query, _addr| {
            Some((echo_answer(query), Duration::ZERO))
        }));

        let summary = execute(&opt, endpoint as Arc<dyn Endpoint>).await.unwrap();
        assert_eq!(summary.sent, 3);
        assert_eq!(summary.received, 3);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);

        let mut contents = String::new();
        std::fs::File::open(&out).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.contains("a.example.com.\t60\tIN\tA\t198.51.100.7"));
        let _ = std::fs::remove_file(&out);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_counts_failure() {
        let opt = base_options("a.example.com A\n", None);
        let endpoint = LoopbackEndpoint::new();
        endpoint.set_responder(Box::new(|_query, _addr| None));

        let summary = execute(&opt, endpoint as Arc<dyn Endpoint>).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.received, 0);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.timeouts, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn stall_with_queued_work_is_an_error() {
        // C=1 and a dead resolver that keeps its capacity down: the first
        // query burns the slot, the second sits in the sender's hand, the
        // third stays queued, so the stall fires with work outstanding
        let mut opt =
            base_options("a.example.com A\nb.example.com A\nc.example.com A\n", None);
        opt.concurrent = 1;
        let endpoint = LoopbackEndpoint::new();
        endpoint.set_responder(Box::new(|_query, _addr| None));

        let err = execute(&opt, endpoint as Arc<dyn Endpoint>).await.unwrap_err();
        assert!(err.to_string().contains("no resolvers are responding"));
    }
}
