use crate::miio::{self, MiioCodec, Packet, Reply, Token};
use futures::{SinkExt as _, StreamExt as _};
use std::collections::{BTreeMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::udp::UdpFramed;
use tracing::{debug, error, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("`{0}` did not resolve to any address")]
    NoAddress(String),
    #[error("could not bind a local UDP socket")]
    Bind(#[source] std::io::Error),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not receive data from the device")]
    Receive(#[source] std::io::Error),
    #[error("could not encode the `{1}` request")]
    EncodeRequest(#[source] serde_json::Error, String),
    #[error("the connection worker has stopped")]
    WorkerGone(#[source] Option<Arc<Error>>),
    #[error("`{method}` got no response after {attempts} attempts")]
    Timeout { method: String, attempts: usize },
    #[error("device rejected the request with error {code}: {message}")]
    Device { code: i64, message: String },
}

#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u32, Option<miio::Response>>>,
    change_notify: Notify,
}

impl ResponseTracker {
    pub fn mark_timeout(&self, request_id: u32) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(request_id, None);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub fn add_response(&self, response: miio::Response) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(response.id, Some(response));
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub async fn wait_for(&self, request_id: u32) -> Option<miio::Response> {
        loop {
            // Register interest before looking, otherwise a response landing in between is lost.
            let mut notified = pin::pin!(self.change_notify.notified());
            notified.as_mut().enable();
            {
                let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = guard.remove(&request_id) {
                    return v;
                }
            }
            notified.await;
        }
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Host name or IP address of the air conditioner.
    #[arg(long, env = "ZHIMI_AC_HOST")]
    pub(crate) host: String,

    /// The device token, 32 hexadecimal characters.
    #[arg(long, env = "ZHIMI_AC_TOKEN", hide_env_values = true)]
    pub(crate) token: Token,

    #[arg(long, default_value_t = miio::PORT)]
    pub(crate) port: u16,

    /// If the response isn't received in this amount of time, consider the request failed.
    #[arg(long, default_value = "2s")]
    pub(crate) read_timeout: humantime::Duration,

    /// How many more times to send a request that timed out.
    #[arg(long, default_value = "2")]
    pub(crate) retries: usize,

    /// Redo the handshake with the device after this many requests in a row time out.
    #[arg(long, default_value = "2")]
    pub(crate) rehandshake_after_timeouts: usize,
}

struct Job {
    id: u32,
    payload: Vec<u8>,
}

pub struct Connection {
    request_queue: UnboundedSender<Job>,
    /// Why the worker stopped, if it stopped on an error.
    worker_failure: Arc<OnceLock<Arc<Error>>>,
    response_tracker: Arc<ResponseTracker>,
    request_id_generator: AtomicU32,
    args: Args,
}

impl Connection {
    pub async fn new(args: Args) -> Result<Connection, Error> {
        let host = format!("{}:{}", args.host, args.port);
        info!(message = "resolving...", host);
        let address = tokio::net::lookup_host(&host)
            .await
            .map_err(|e| Error::LookupHost(e, host.clone()))?
            .next()
            .ok_or_else(|| Error::NoAddress(host.clone()))?;
        debug!(message = "resolved", %address);
        let local: SocketAddr = match address {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await.map_err(Error::Bind)?;
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker = Arc::new(ResponseTracker::default());
        let worker_failure = Arc::new(OnceLock::new());
        UdpWorker {
            io: UdpFramed::new(socket, MiioCodec::new(args.token)),
            address,
            read_timeout: *args.read_timeout,
            rehandshake_after_timeouts: args.rehandshake_after_timeouts,
            responses: Arc::clone(&response_tracker),
            inflight: VecDeque::with_capacity(4),
            session: None,
            timeouts_in_a_row: 0,
        }
        .spawn(jobs, Arc::clone(&worker_failure));
        Ok(Self {
            request_queue,
            worker_failure,
            response_tracker,
            request_id_generator: AtomicU32::new(0),
            args,
        })
    }

    pub fn new_request_id(&self) -> u32 {
        self.request_id_generator.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Send a request, returning `None` if it timed out.
    pub async fn send(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<miio::Response>, Error> {
        let id = self.new_request_id();
        let request = miio::Request { id, method: method.to_string(), params };
        let payload =
            serde_json::to_vec(&request).map_err(|e| Error::EncodeRequest(e, method.into()))?;
        trace!(message = "queueing a request", id, method);
        self.request_queue.send(Job { id, payload }).map_err(|_| self.worker_gone())?;
        tokio::select! {
            response = self.response_tracker.wait_for(id) => Ok(response),
            _ = self.request_queue.closed() => Err(self.worker_gone()),
        }
    }

    fn worker_gone(&self) -> Error {
        Error::WorkerGone(self.worker_failure.get().cloned())
    }

    /// [`Self::send`] but retries timeouts.
    pub async fn send_retrying(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<miio::Response, Error> {
        let attempts = self.args.retries + 1;
        for attempt in 1..=attempts {
            if let Some(response) = self.send(method, params.clone()).await? {
                return Ok(response);
            }
            warn!(message = "request timed out", method, attempt, attempts);
        }
        Err(Error::Timeout { method: method.to_string(), attempts })
    }
}

impl crate::device::Rpc for Connection {
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, Error> {
        let response = self.send_retrying(method, params).await?;
        match response.kind {
            miio::ResponseKind::Result(value) => Ok(value),
            miio::ResponseKind::Error(e) => Err(Error::Device { code: e.code, message: e.message }),
        }
    }
}

/// What the device told us during the handshake.
struct Session {
    device_id: u32,
    stamp: u32,
    established: Instant,
}

impl Session {
    /// The device expects the stamp to advance with its own clock.
    fn stamp_now(&self) -> u32 {
        let elapsed = u32::try_from(self.established.elapsed().as_secs()).unwrap_or(u32::MAX);
        self.stamp.wrapping_add(elapsed)
    }
}

struct UdpWorker {
    io: UdpFramed<MiioCodec>,
    address: SocketAddr,
    read_timeout: std::time::Duration,
    rehandshake_after_timeouts: usize,
    responses: Arc<ResponseTracker>,
    /// Outstanding requests and their deadlines, in sending order.
    ///
    /// All requests share the same read timeout, so the deadlines are sorted as well and only the
    /// first one needs a timer.
    inflight: VecDeque<(u32, Instant)>,
    session: Option<Session>,
    timeouts_in_a_row: usize,
}

impl UdpWorker {
    fn spawn(self, mut jobs: UnboundedReceiver<Job>, failure: Arc<OnceLock<Arc<Error>>>) {
        tokio::task::spawn(async move {
            if let Err(e) = self.main_loop(&mut jobs).await {
                error!(message = "connection worker stopped", error = (&e as &dyn std::error::Error));
                let _ = failure.set(Arc::new(e));
            }
            // Only now do the queued requests learn that the worker is gone.
            drop(jobs);
        });
    }

    async fn main_loop(mut self, jobs: &mut UnboundedReceiver<Job>) -> Result<(), Error> {
        let mut recv_time = pin::pin!(tokio::time::sleep_until(Instant::now()));
        loop {
            tokio::select! {
                biased;
                Some(datagram) = self.io.next() => {
                    let (reply, from) = datagram.map_err(Error::Receive)?;
                    if from != self.address {
                        debug!(message = "ignoring a datagram from a stranger", %from);
                        continue;
                    }
                    self.handle_reply(reply, recv_time.as_mut());
                }
                _ = &mut recv_time, if !self.inflight.is_empty() => {
                    self.handle_timeout(recv_time.as_mut());
                }
                job = jobs.recv() => {
                    let Some(job) = job else {
                        return Ok(());
                    };
                    if self.session.is_none() && !self.handshake().await? {
                        self.responses.mark_timeout(job.id);
                        continue;
                    }
                    self.send_job(job, recv_time.as_mut()).await?;
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<bool, Error> {
        info!(message = "handshaking...", address = %self.address);
        self.io.send((Packet::Hello, self.address)).await.map_err(Error::Send)?;
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let Ok(datagram) = tokio::time::timeout_at(deadline, self.io.next()).await else {
                warn!(message = "device did not answer the handshake", address = %self.address);
                return Ok(false);
            };
            let Some(datagram) = datagram else {
                return Ok(false);
            };
            let (reply, from) = datagram.map_err(Error::Receive)?;
            match reply {
                Reply::Hello { device_id, stamp } if from == self.address => {
                    info!(message = "handshake complete", device_id, stamp);
                    self.session = Some(Session { device_id, stamp, established: Instant::now() });
                    return Ok(true);
                }
                _ => debug!(message = "ignoring a datagram while handshaking", %from),
            }
        }
    }

    async fn send_job(
        &mut self,
        job: Job,
        request_timeout: pin::Pin<&mut tokio::time::Sleep>,
    ) -> Result<(), Error> {
        let Some(session) = &self.session else {
            self.responses.mark_timeout(job.id);
            return Ok(());
        };
        let packet = Packet::Message {
            device_id: session.device_id,
            stamp: session.stamp_now(),
            payload: job.payload,
        };
        self.io.send((packet, self.address)).await.map_err(Error::Send)?;
        self.inflight.push_back((job.id, Instant::now() + self.read_timeout));
        if self.inflight.len() == 1 {
            request_timeout.reset(self.inflight[0].1);
        }
        Ok(())
    }

    fn handle_reply(&mut self, reply: Reply, request_timeout: pin::Pin<&mut tokio::time::Sleep>) {
        let payload = match reply {
            Reply::Message { payload, .. } => payload,
            Reply::Hello { .. } => {
                debug!("unexpected handshake reply");
                return;
            }
        };
        let response = match miio::Response::from_payload(&payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    message = "could not parse the response",
                    error = (&e as &dyn std::error::Error),
                    payload = %String::from_utf8_lossy(&payload),
                );
                return;
            }
        };
        trace!(message = "decoded a response", id = response.id);
        let Some(inflight_index) = self.inflight.iter().position(|(id, _)| *id == response.id)
        else {
            debug!(message = "a response we were not expecting", id = response.id);
            return;
        };
        self.inflight.remove(inflight_index);
        self.timeouts_in_a_row = 0;
        self.responses.add_response(response);
        if inflight_index == 0 {
            if let Some((_, timeout)) = self.inflight.front() {
                request_timeout.reset(*timeout);
            }
        }
    }

    fn handle_timeout(&mut self, request_timeout: pin::Pin<&mut tokio::time::Sleep>) {
        let Some((request_id, _)) = self.inflight.pop_front() else {
            return;
        };
        self.timeouts_in_a_row += 1;
        debug!(
            message = "an inflight request timed out",
            request_id,
            timeouts_in_a_row = self.timeouts_in_a_row
        );
        self.responses.mark_timeout(request_id);
        if self.timeouts_in_a_row >= self.rehandshake_after_timeouts {
            info!("too many timeouts, will handshake again");
            self.session = None;
            self.timeouts_in_a_row = 0;
        }
        if let Some((_, timeout)) = self.inflight.front() {
            request_timeout.reset(*timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Rpc as _;
    use serde_json::json;
    use tokio_util::bytes::{BufMut as _, BytesMut};
    use tokio_util::codec::{Decoder as _, Encoder as _};

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    /// Speaks the device side of the protocol: answers the handshake and echoes `get_prop`.
    async fn fake_device(
        socket: UdpSocket,
        answer_after: usize,
        hellos: Arc<std::sync::atomic::AtomicUsize>,
    ) {
        let mut codec = MiioCodec::new(TOKEN.parse().unwrap());
        let mut buf = vec![0; 2048];
        let mut requests_seen = 0;
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if len == 32 {
                hellos.fetch_add(1, Ordering::SeqCst);
                let mut hello = BytesMut::new();
                hello.put_u16(0x2131);
                hello.put_u16(32);
                hello.put_u32(0);
                hello.put_u32(77);
                hello.put_u32(5000);
                hello.put_bytes(0, 16);
                socket.send_to(&hello, peer).await.unwrap();
                continue;
            }
            let mut datagram = BytesMut::from(&buf[..len]);
            let Some(Reply::Message { device_id, payload, .. }) =
                codec.decode(&mut datagram).unwrap()
            else {
                panic!("undecodable request");
            };
            assert_eq!(device_id, 77);
            requests_seen += 1;
            if requests_seen <= answer_after {
                continue;
            }
            let request: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            let reply = match request["method"].as_str() {
                Some("get_prop") => json!({"id": request["id"], "result": ["on"]}),
                _ => json!({"id": request["id"], "error": {"code": -3, "message": "nope"}}),
            };
            let packet = Packet::Message {
                device_id: 77,
                stamp: 5001,
                payload: serde_json::to_vec(&reply).unwrap(),
            };
            let mut out = BytesMut::new();
            codec.encode(packet, &mut out).unwrap();
            socket.send_to(&out, peer).await.unwrap();
        }
    }

    async fn connect_counting_hellos(
        drop_first: usize,
        rehandshake_after_timeouts: usize,
    ) -> (Connection, Arc<std::sync::atomic::AtomicUsize>) {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();
        let hellos = Arc::default();
        tokio::spawn(fake_device(device, drop_first, Arc::clone(&hellos)));
        let connection = Connection::new(Args {
            host: "127.0.0.1".into(),
            token: TOKEN.parse().unwrap(),
            port,
            read_timeout: std::time::Duration::from_millis(200).into(),
            retries: 2,
            rehandshake_after_timeouts,
        })
        .await
        .unwrap();
        (connection, hellos)
    }

    async fn connect(drop_first: usize) -> Connection {
        connect_counting_hellos(drop_first, 5).await.0
    }

    #[tokio::test]
    async fn request_response_over_loopback() {
        let connection = connect(0).await;
        let value = connection.call("get_prop", json!(["power"])).await.unwrap();
        assert_eq!(value, json!(["on"]));
        let error = connection.call("set_power", json!(["on"])).await.unwrap_err();
        assert!(matches!(error, Error::Device { code: -3, .. }));
    }

    #[tokio::test]
    async fn timed_out_requests_are_retried() {
        let connection = connect(1).await;
        let response = connection.send_retrying("get_prop", json!(["mode"])).await.unwrap();
        // The first attempt was dropped by the device, the second one got through.
        assert_eq!(response.id, 2);
        assert_eq!(response.kind, miio::ResponseKind::Result(json!(["on"])));
    }

    #[tokio::test]
    async fn handshakes_again_after_timeouts_in_a_row() {
        let (connection, hellos) = connect_counting_hellos(1, 1).await;
        let response = connection.send_retrying("get_prop", json!(["mode"])).await.unwrap();
        assert_eq!(response.kind, miio::ResponseKind::Result(json!(["on"])));
        assert_eq!(hellos.load(Ordering::SeqCst), 2);

        let (connection, hellos) = connect_counting_hellos(1, 5).await;
        connection.send_retrying("get_prop", json!(["mode"])).await.unwrap();
        assert_eq!(hellos.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_retries() {
        let connection = connect(usize::MAX).await;
        let error = connection.send_retrying("get_prop", json!(["mode"])).await.unwrap_err();
        assert!(matches!(error, Error::Timeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn stopped_worker_reports_its_failure() {
        let connection = connect(0).await;
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        drop(jobs);
        let failure = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let connection = Connection { request_queue, ..connection };
        let _ = connection.worker_failure.set(Arc::new(Error::Receive(failure)));
        let error = connection.send("get_prop", json!(["power"])).await.unwrap_err();
        let Error::WorkerGone(Some(cause)) = error else {
            panic!("expected the worker failure, got {error:?}");
        };
        assert!(matches!(*cause, Error::Receive(_)));
    }

    #[tokio::test]
    async fn tracker_returns_responses_recorded_before_waiting() {
        let tracker = ResponseTracker::default();
        tracker.add_response(miio::Response { id: 4, kind: miio::ResponseKind::Result(json!(1)) });
        tracker.mark_timeout(5);
        assert!(tracker.wait_for(4).await.is_some());
        assert!(tracker.wait_for(5).await.is_none());
    }
}
