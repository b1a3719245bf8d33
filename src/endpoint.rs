use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Result of one bounded-wait receive attempt.
#[derive(Debug)]
pub enum RecvOutcome {
    Datagram(Vec<u8>, SocketAddr),
    TimedOut,
    Closed,
}

/// Datagram capability consumed by the query backend. Send and receive must
/// be callable concurrently from different threads, and `close` must be safe
/// to call while another thread is blocked in `recv_from`; that thread then
/// observes `Closed` within one `wait` interval.
pub trait Endpoint: Send + Sync {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()>;
    fn recv_from(&self, max_len: usize, wait: Duration) -> Result<RecvOutcome>;
    fn close(&self);
}

/// UDP endpoint over a dual-stack IPv6 socket, so IPv4-mapped resolver
/// addresses reach plain IPv4 resolvers without a second socket.
pub struct UdpEndpoint {
    sock: UdpSocket,
    closed: AtomicBool,
}

impl UdpEndpoint {
    pub fn bind(bind_ip: Option<IpAddr>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .context("creating UDP socket")?;
        socket.set_only_v6(false).context("enabling dual-stack mode")?;
        let local = match bind_ip {
            Some(IpAddr::V4(v4)) => SocketAddrV6::new(v4.to_ipv6_mapped(), 0, 0, 0),
            Some(IpAddr::V6(v6)) => SocketAddrV6::new(v6, 0, 0, 0),
            None => SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0),
        };
        socket
            .bind(&SocketAddr::V6(local).into())
            .with_context(|| format!("binding to {local}"))?;
        Ok(UdpEndpoint { sock: socket.into(), closed: AtomicBool::new(false) })
    }
}

impl Endpoint for UdpEndpoint {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            bail!("endpoint is closed");
        }
        self.sock.send_to(data, addr).with_context(|| format!("sendto {addr}"))?;
        Ok(())
    }

    fn recv_from(&self, max_len: usize, wait: Duration) -> Result<RecvOutcome> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(RecvOutcome::Closed);
        }
        let wait = wait.max(Duration::from_millis(1));
        self.sock.set_read_timeout(Some(wait)).context("setting read timeout")?;
        let mut buf = vec![0u8; max_len];
        match self.sock.recv_from(&mut buf) {
            Ok((n, peer)) => {
                buf.truncate(n);
                Ok(RecvOutcome::Datagram(buf, peer))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if self.closed.load(Ordering::Relaxed) {
                    Ok(RecvOutcome::Closed)
                } else {
                    Ok(RecvOutcome::TimedOut)
                }
            }
            Err(e) => {
                if self.closed.load(Ordering::Relaxed) {
                    Ok(RecvOutcome::Closed)
                } else {
                    Err(e).context("recvfrom")
                }
            }
        }
    }

    // Logical close: the fd stays open until drop, the flag is what the
    // blocked receiver observes after its current read timeout expires.
    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub mod loopback {
    //! In-memory endpoint acting as a fake resolver for backend tests.

    use super::{Endpoint, RecvOutcome};
    use anyhow::Result;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::{Duration, Instant};

    /// Decides what the fake resolver does with an outgoing datagram:
    /// `None` drops it, `Some((reply, delay))` injects `reply` from the
    /// queried address after `delay`.
    pub type Responder =
        Box<dyn Fn(&[u8], SocketAddr) -> Option<(Vec<u8>, Duration)> + Send + Sync>;

    #[derive(Default)]
    struct Inbox {
        queue: VecDeque<(Vec<u8>, SocketAddr)>,
        closed: bool,
    }

    pub struct LoopbackEndpoint {
        inbox: Arc<(Mutex<Inbox>, Condvar)>,
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        responder: Mutex<Option<Responder>>,
    }

    impl LoopbackEndpoint {
        pub fn new() -> Arc<Self> {
            Arc::new(LoopbackEndpoint {
                inbox: Arc::new((Mutex::new(Inbox::default()), Condvar::new())),
                sent: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
            })
        }

        pub fn set_responder(&self, f: Responder) {
            *self.responder.lock().unwrap() = Some(f);
        }

        /// Push a datagram into the receive path, as if `from` had sent it.
        pub fn inject(&self, data: Vec<u8>, from: SocketAddr) {
            let (lock, cv) = &*self.inbox;
            lock.lock().unwrap().queue.push_back((data, from));
            cv.notify_all();
        }

        /// Everything sent so far, in wire order.
        pub fn sent_log(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Endpoint for LoopbackEndpoint {
        fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
            self.sent.lock().unwrap().push((data.to_vec(), addr));
            let reply = self
                .responder
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|r| r(data, addr));
            if let Some((bytes, delay)) = reply {
                let inbox = Arc::clone(&self.inbox);
                if delay.is_zero() {
                    let (lock, cv) = &*inbox;
                    lock.lock().unwrap().queue.push_back((bytes, addr));
                    cv.notify_all();
                } else {
                    std::thread::spawn(move || {
                        std::thread::sleep(delay);
                        let (lock, cv) = &*inbox;
                        lock.lock().unwrap().queue.push_back((bytes, addr));
                        cv.notify_all();
                    });
                }
            }
            Ok(())
        }

        fn recv_from(&self, max_len: usize, wait: Duration) -> Result<RecvOutcome> {
            let deadline = Instant::now() + wait;
            let (lock, cv) = &*self.inbox;
            let mut inbox = lock.lock().unwrap();
            loop {
                if inbox.closed {
                    return Ok(RecvOutcome::Closed);
                }
                if let Some((mut data, from)) = inbox.queue.pop_front() {
                    data.truncate(max_len);
                    return Ok(RecvOutcome::Datagram(data, from));
                }
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(RecvOutcome::TimedOut);
                }
                let (guard, _) = cv.wait_timeout(inbox, left).unwrap();
                inbox = guard;
            }
        }

        fn close(&self) {
            let (lock, cv) = &*self.inbox;
            lock.lock().unwrap().closed = true;
            cv.notify_all();
        }
    }
}
