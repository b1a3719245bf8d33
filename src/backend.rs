use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::warn;
use rand::Rng;
use trust_dns_proto::op::Message;

use crate::endpoint::{Endpoint, RecvOutcome};
use crate::wire;

/// Opaque id the host assigns to a logical query. The backend never
/// interprets it; the same id may be queued repeatedly (retries).
pub type QueryId = u64;

const IDLE_POLL: Duration = Duration::from_millis(25);
const CAPACITY_RETRY: Duration = Duration::from_millis(10);
const RECV_POLL: Duration = Duration::from_secs(1);
const RECV_BUF_LEN: usize = 4096;
const EXIT_CHECK_SLICE: Duration = Duration::from_millis(50);

pub type QuestionFn = dyn Fn(QueryId) -> wire::Question + Send + Sync;
pub type AnswerFn = dyn Fn(&Message, QueryId) + Send + Sync;
pub type TimeoutFn = dyn Fn(QueryId) + Send + Sync;

/// One upstream resolver and its remaining in-flight capacity.
struct ResolverSlot {
    addr: SocketAddrV6,
    capacity: u32,
    txid_counter: u16,
}

impl ResolverSlot {
    fn new(addr: SocketAddrV6, capacity: u32) -> Self {
        ResolverSlot { addr, capacity, txid_counter: 0 }
    }

    fn acquire_capacity(&mut self) -> bool {
        if self.capacity == 0 {
            return false;
        }
        self.capacity -= 1;
        true
    }

    fn restore_capacity(&mut self) {
        self.capacity += 1;
    }

    fn next_txid(&mut self) -> u16 {
        let txid = self.txid_counter;
        self.txid_counter = self.txid_counter.wrapping_add(1);
        txid
    }
}

struct PendingQuery {
    id: QueryId,
    resolver_idx: usize,
    time_sent: Instant,
}

struct Shared {
    resolvers: Vec<ResolverSlot>,
    // keyed by resolver IP bytes || big-endian txid
    pending: FnvHashMap<[u8; 18], PendingQuery>,
    send_queue: VecDeque<QueryId>,
}

struct Threads {
    send: JoinHandle<()>,
    recv: JoinHandle<()>,
    timeout: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub sent: u32,
    pub queue: u32,
    pub received: u32,
}

/// Asynchronous query pipeline: a send thread drains the queue across the
/// resolvers under their capacity caps, a receive thread matches answers
/// back to pending entries, and a timeout thread evicts entries older than
/// the deadline. One mutex guards the queue, the slots, and the pending
/// table; host callbacks always run outside it.
pub struct QueryBackend {
    shared: Mutex<Shared>,
    endpoint: Arc<dyn Endpoint>,
    timeout: Duration,
    timeout_keep_capacity: bool,

    n_sent: AtomicU32,
    n_recv: AtomicU32,
    n_queue: AtomicU32,
    should_exit: AtomicBool,

    callback_question: Mutex<Option<Arc<QuestionFn>>>,
    callback_answer: Mutex<Option<Arc<AnswerFn>>>,
    callback_timeout: Mutex<Option<Arc<TimeoutFn>>>,

    threads: Mutex<Option<Threads>>,
}

impl QueryBackend {
    pub fn new(
        resolvers: Vec<SocketAddrV6>,
        concurrent: u32,
        timeout_secs: u64,
        timeout_keep_capacity: bool,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Arc<Self>> {
        if resolvers.is_empty() {
            bail!("at least one resolver is required");
        }
        if concurrent == 0 {
            bail!("per-resolver concurrency must be at least 1");
        }
        if timeout_secs == 0 {
            bail!("timeout must be at least one second");
        }
        let slots = resolvers
            .into_iter()
            .map(|addr| ResolverSlot::new(addr, concurrent))
            .collect();
        Ok(Arc::new(QueryBackend {
            shared: Mutex::new(Shared {
                resolvers: slots,
                pending: FnvHashMap::default(),
                send_queue: VecDeque::new(),
            }),
            endpoint,
            timeout: Duration::from_secs(timeout_secs),
            timeout_keep_capacity,
            n_sent: AtomicU32::new(0),
            n_recv: AtomicU32::new(0),
            n_queue: AtomicU32::new(0),
            should_exit: AtomicBool::new(false),
            callback_question: Mutex::new(None),
            callback_answer: Mutex::new(None),
            callback_timeout: Mutex::new(None),
            threads: Mutex::new(None),
        }))
    }

    /// Must be called before `start`. The question callback has to be pure
    /// per id while that id is in flight; it can run again for the same id
    /// if the host re-queues on timeout.
    pub fn set_callbacks<Q, A, T>(&self, question: Q, answer: A, timeout: T)
    where
        Q: Fn(QueryId) -> wire::Question + Send + Sync + 'static,
        A: Fn(&Message, QueryId) + Send + Sync + 'static,
        T: Fn(QueryId) + Send + Sync + 'static,
    {
        *self.callback_question.lock().unwrap() = Some(Arc::new(question));
        *self.callback_answer.lock().unwrap() = Some(Arc::new(answer));
        *self.callback_timeout.lock().unwrap() = Some(Arc::new(timeout));
    }

    /// Append a logical query id; legal before or after `start`.
    pub fn queue(&self, id: QueryId) {
        self.shared.lock().unwrap().send_queue.push_back(id);
    }

    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();
        if threads.is_some() {
            return;
        }
        self.n_sent.store(0, Ordering::Relaxed);
        self.n_recv.store(0, Ordering::Relaxed);
        self.n_queue
            .store(self.shared.lock().unwrap().send_queue.len() as u32, Ordering::Relaxed);
        self.should_exit.store(false, Ordering::Relaxed);

        let me = Arc::clone(self);
        let recv = std::thread::spawn(move || me.recv_loop());
        let me = Arc::clone(self);
        let timeout = std::thread::spawn(move || me.timeout_loop());
        let me = Arc::clone(self);
        let send = std::thread::spawn(move || me.send_loop());
        *threads = Some(Threads { send, recv, timeout });
    }

    /// Counter snapshot; `reset` zeroes sent/received atomically on read.
    pub fn stats(&self, reset: bool) -> Stats {
        let (sent, received) = if reset {
            (self.n_sent.swap(0, Ordering::Relaxed), self.n_recv.swap(0, Ordering::Relaxed))
        } else {
            (self.n_sent.load(Ordering::Relaxed), self.n_recv.load(Ordering::Relaxed))
        };
        Stats { sent, queue: self.n_queue.load(Ordering::Relaxed), received }
    }

    /// Stop the pipeline and join all three threads. Send and timeout exit
    /// on their own polling cadence; the receive thread only exits once the
    /// endpoint is closed, so the endpoint stays open until they are down.
    pub fn stop_join(&self) {
        let threads = self.threads.lock().unwrap().take();
        let Some(threads) = threads else { return };

        self.should_exit.store(true, Ordering::Relaxed);
        let _ = threads.send.join();
        let _ = threads.timeout.join();

        self.endpoint.close();
        let _ = threads.recv.join();
    }

    fn send_loop(&self) {
        let mut cursor = {
            let shared = self.shared.lock().unwrap();
            rand::thread_rng().gen_range(0..shared.resolvers.len())
        };

        loop {
            let popped = {
                let mut shared = self.shared.lock().unwrap();
                let id = shared.send_queue.pop_front();
                self.n_queue.store(shared.send_queue.len() as u32, Ordering::Relaxed);
                id
            };

            if self.should_exit.load(Ordering::Relaxed) {
                break;
            }
            let Some(id) = popped else {
                std::thread::sleep(IDLE_POLL);
                continue;
            };

            // round-robin pick of a resolver with free capacity; the id is
            // held locally across the wait, not returned to the queue
            let (idx, txid, addr) = loop {
                let acquired = {
                    let mut shared = self.shared.lock().unwrap();
                    let n = shared.resolvers.len();
                    let start = cursor;
                    let mut found = None;
                    loop {
                        if shared.resolvers[cursor].acquire_capacity() {
                            let txid = shared.resolvers[cursor].next_txid();
                            let addr = shared.resolvers[cursor].addr;
                            found = Some((cursor, txid, addr));
                            cursor = (cursor + 1) % n;
                            break;
                        }
                        cursor = (cursor + 1) % n;
                        if cursor == start {
                            break;
                        }
                    }
                    found
                };
                match acquired {
                    Some(pick) => break pick,
                    None => {
                        if self.should_exit.load(Ordering::Relaxed) {
                            return;
                        }
                        std::thread::sleep(CAPACITY_RETRY);
                    }
                }
            };

            // the question callback and the send syscall run unlocked
            let question_cb = self.callback_question.lock().unwrap().clone();
            let Some(question_cb) = question_cb else {
                warn!("no question callback configured; dropping query {id}");
                self.restore_slot(idx);
                continue;
            };
            let question = question_cb(id);

            let data = match wire::encode_query(txid, &question) {
                Ok(data) => data,
                Err(e) => {
                    warn!("failed to encode query {id} ({}): {e}", question.name);
                    self.restore_slot(idx);
                    continue;
                }
            };
            if let Err(e) = self.endpoint.send_to(&data, SocketAddr::V6(addr)) {
                warn!("failed to send query {id} to {addr}: {e}");
                self.restore_slot(idx);
                continue;
            }

            let key = wire::pending_key(IpAddr::V6(*addr.ip()), txid);
            {
                let mut shared = self.shared.lock().unwrap();
                let prev = shared.pending.insert(
                    key,
                    PendingQuery { id, resolver_idx: idx, time_sent: Instant::now() },
                );
                if prev.is_some() {
                    warn!("txid {txid:#06x} reused on {addr} while still in flight");
                }
            }
            self.n_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn recv_loop(&self) {
        loop {
            let (data, peer) = match self.endpoint.recv_from(RECV_BUF_LEN, RECV_POLL) {
                Ok(RecvOutcome::Datagram(data, peer)) => (data, peer),
                Ok(RecvOutcome::TimedOut) => continue,
                Ok(RecvOutcome::Closed) => break,
                Err(e) => {
                    warn!("receive failed, stopping receive loop: {e}");
                    break;
                }
            };

            let msg = match wire::decode_response(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("dropping undecodable packet from {peer}: {e}");
                    continue;
                }
            };

            let key = wire::pending_key(peer.ip(), msg.id());
            let id = {
                let mut shared = self.shared.lock().unwrap();
                match shared.pending.remove(&key) {
                    Some(p) => {
                        shared.resolvers[p.resolver_idx].restore_capacity();
                        p.id
                    }
                    None => {
                        drop(shared);
                        warn!("unexpected answer from {peer} (txid {:#06x}, late answer?)", msg.id());
                        continue;
                    }
                }
            };

            let answer_cb = self.callback_answer.lock().unwrap().clone();
            if let Some(cb) = answer_cb {
                cb(&msg, id);
            }
            self.n_recv.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn timeout_loop(&self) {
        loop {
            // evict one victim at a time and restart the scan, so the
            // critical section stays bounded and iteration never crosses
            // a callback
            loop {
                let now = Instant::now();
                let victim = {
                    let mut shared = self.shared.lock().unwrap();
                    let key = shared
                        .pending
                        .iter()
                        .find(|(_, p)| now.duration_since(p.time_sent) >= self.timeout)
                        .map(|(key, _)| *key);
                    key.and_then(|key| shared.pending.remove(&key)).map(|p| {
                        if self.timeout_keep_capacity {
                            shared.resolvers[p.resolver_idx].restore_capacity();
                        }
                        p
                    })
                };
                let Some(victim) = victim else { break };

                let timeout_cb = self.callback_timeout.lock().unwrap().clone();
                if let Some(cb) = timeout_cb {
                    cb(victim.id);
                }
            }

            if self.should_exit.load(Ordering::Relaxed) {
                break;
            }
            self.sleep_observing_exit(self.timeout / 2);
        }
    }

    fn restore_slot(&self, idx: usize) {
        self.shared.lock().unwrap().resolvers[idx].restore_capacity();
    }

    fn sleep_observing_exit(&self, total: Duration) {
        let deadline = Instant::now() + total;
        loop {
            if self.should_exit.load(Ordering::Relaxed) {
                return;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            std::thread::sleep(left.min(EXIT_CHECK_SLICE));
        }
    }
}
