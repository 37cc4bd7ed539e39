//! The post office's long-lived connection to the central post office.
//!
//! One blocking TCP socket with a reader and a writer thread, plus a
//! shuttler draining the CPO-bound mailbox into the outbound deque and a
//! connector that retries every half second until the broker answers. The
//! first frame on every fresh socket is the `manage.connect` /
//! `manage.reconnect` handshake, enqueued with `deliver_next` so that a
//! partially-written buffer from the previous socket is re-sent after it,
//! starting the new stream on a clean frame boundary.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::OverflowPolicy;
use crate::crypto::Authenticator;
use crate::message::Message;
use crate::wire::{Deframer, DEFAULT_MAX_MESSAGE_SIZE};

use super::PoCore;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const PING_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const WRITE_IDLE_SLEEP: Duration = Duration::from_millis(5);
const MAX_OUTGOING: usize = 100;
const READ_BUFFER_SIZE: usize = 1024;

pub(crate) struct CpoLink {
    po: Weak<PoCore>,
    host: String,
    port: u16,
    secret: Vec<u8>,
    overflow: OverflowPolicy,

    out: Mutex<OutState>,
    socket: Mutex<Option<TcpStream>>,
    // bumped for every new socket; workers carry the generation they were
    // started for and exit when it moves on
    generation: AtomicU64,
    connected: AtomicBool,
    reconnect_pending: AtomicBool,
    shutdown: AtomicBool,

    ping_interval_ms: AtomicU64,
    time_since_ping_ms: AtomicU64,
    max_message_size: AtomicUsize,

    connects: AtomicU64,
    rx_messages: AtomicU64,
    tx_messages: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    last_connect: Mutex<Option<Instant>>,
}

// Outbound frames. Enqueue at the front, write from the back; the last
// buffer handed to the writer is kept so `deliver_next` can re-send it on a
// fresh socket.
struct OutState {
    queue: VecDeque<Vec<u8>>,
    last_written: Option<Vec<u8>>,
}

impl CpoLink {
    pub(crate) fn start(
        po: Weak<PoCore>,
        host: &str,
        port: u16,
        secret: Vec<u8>,
        overflow: OverflowPolicy,
    ) -> Arc<CpoLink> {
        let link = Arc::new(CpoLink {
            po,
            host: host.to_string(),
            port,
            secret,
            overflow,
            out: Mutex::new(OutState {
                queue: VecDeque::new(),
                last_written: None,
            }),
            socket: Mutex::new(None),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            ping_interval_ms: AtomicU64::new(0),
            time_since_ping_ms: AtomicU64::new(0),
            max_message_size: AtomicUsize::new(DEFAULT_MAX_MESSAGE_SIZE),
            connects: AtomicU64::new(0),
            rx_messages: AtomicU64::new(0),
            tx_messages: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            last_connect: Mutex::new(None),
        });

        spawn_shuttler(&link);
        spawn_ping_sweep(&link);

        let connector = link.clone();
        thread::spawn(move || connect_loop(connector));

        link
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub(crate) fn rx_message_count(&self) -> u64 {
        self.rx_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn tx_message_count(&self) -> u64 {
        self.tx_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn last_connect_time(&self) -> Option<Instant> {
        *self.last_connect.lock().expect("last connect poisoned")
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::Relaxed);
        if let Some(socket) = self.socket.lock().expect("socket lock poisoned").take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// Sever the current socket as a network fault would; the reconnect
    /// machinery takes it from there.
    pub(crate) fn kill_socket(&self) {
        if let Some(socket) = self.socket.lock().expect("socket lock poisoned").as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// Queue a message for transmission to the broker.
    pub(crate) fn deliver(&self, message: &Message) {
        let serialized = message.serialize();
        self.tx_bytes
            .fetch_add(serialized.len() as u64, Ordering::Relaxed);
        self.tx_messages.fetch_add(1, Ordering::Relaxed);

        let mut out = self.out.lock().expect("out queue poisoned");
        if out.queue.len() >= MAX_OUTGOING {
            match self.overflow {
                OverflowPolicy::DropNewest => {
                    tracing::warn!(id = %message.id, "outgoing queue full, dropping message");
                    return;
                }
                OverflowPolicy::DropOldest => {
                    out.queue.pop_back();
                }
            }
        }
        out.queue.push_front(serialized);
    }

    // Queue `message` to be the next buffer written; a possibly
    // partially-written previous buffer is re-queued right behind it.
    fn deliver_next(&self, message: &Message) {
        let serialized = message.serialize();
        self.tx_bytes
            .fetch_add(serialized.len() as u64, Ordering::Relaxed);
        self.tx_messages.fetch_add(1, Ordering::Relaxed);

        let mut out = self.out.lock().expect("out queue poisoned");
        if let Some(last) = out.last_written.take() {
            out.queue.push_back(last);
        }
        out.queue.push_back(serialized);
    }

    fn try_connect(&self) -> std::io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        }))
    }

    fn stale(&self, generation: u64) -> bool {
        self.shutdown.load(Ordering::Relaxed)
            || self.generation.load(Ordering::SeqCst) != generation
    }

    fn apply_connect(
        &self,
        message: &Message,
        is_reconnect: bool,
        deframer: &mut Deframer,
        po: &Arc<PoCore>,
    ) {
        let size = message
            .get("maxMessageSize")
            .and_then(serde_json::Value::as_u64);
        if let Some(size) = size {
            self.max_message_size.store(size as usize, Ordering::Relaxed);
            deframer.resize(size as usize);
        }
        if let Some(interval) = message
            .get("pingIntervalMS")
            .and_then(serde_json::Value::as_u64)
        {
            self.ping_interval_ms.store(interval, Ordering::Relaxed);
        }

        self.time_since_ping_ms.store(0, Ordering::Relaxed);
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::SeqCst);
        *self.last_connect.lock().expect("last connect poisoned") = Some(Instant::now());

        tracing::info!(
            po = %po.name,
            max_message_size = self.max_message_size.load(Ordering::Relaxed),
            ping_interval_ms = self.ping_interval_ms.load(Ordering::Relaxed),
            "connected to broker"
        );

        if !is_reconnect {
            po.handle_subscription_refresh();
        }
    }

    fn handle_ping(&self, po: &Arc<PoCore>) {
        self.time_since_ping_ms.store(0, Ordering::Relaxed);
        match Message::new(
            &format!("{}.po", po.name),
            Some("central.po"),
            Some("manage.pong"),
            &po.next_id(),
            None,
            false,
        ) {
            Ok(pong) => self.deliver(&pong),
            Err(err) => tracing::error!(%err, "failed to build pong"),
        }
    }
}

fn connect_loop(link: Arc<CpoLink>) {
    loop {
        if link.shutdown.load(Ordering::Relaxed) || link.po.upgrade().is_none() {
            return;
        }

        let stream = match link.try_connect() {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, host = %link.host, port = link.port,
                    "broker connection failed, retrying");
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };

        let Some(po) = link.po.upgrade() else {
            return;
        };
        let _ = stream.set_nodelay(true);

        let reader_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                tracing::warn!(%err, "socket clone failed, retrying");
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        let writer_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                tracing::warn!(%err, "socket clone failed, retrying");
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };

        let generation = link.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *link.socket.lock().expect("socket lock poisoned") = Some(stream);

        // handshake first: manage.connect the very first time, then
        // manage.reconnect ever after
        let kind = if link.connects.load(Ordering::Relaxed) == 0 {
            "manage.connect"
        } else {
            "manage.reconnect"
        };
        match Message::new(
            &format!("{}.po", po.name),
            Some("central.po"),
            Some(kind),
            &po.next_id(),
            None,
            false,
        ) {
            Ok(mut connect) => {
                let auth = Authenticator::new(&link.secret, &po.name, &connect.id);
                connect.put("authenticator", auth.to_base64());
                link.deliver_next(&connect);
            }
            Err(err) => tracing::error!(%err, "failed to build handshake"),
        }
        link.reconnect_pending.store(false, Ordering::SeqCst);

        let reader = link.clone();
        thread::spawn(move || reader_loop(reader, generation, reader_stream));
        let writer = link.clone();
        thread::spawn(move || writer_loop(writer, generation, writer_stream));

        tracing::debug!(po = %po.name, "tcp connected to broker");
        return;
    }
}

fn reader_loop(link: Arc<CpoLink>, generation: u64, mut stream: TcpStream) {
    let mut deframer = Deframer::new(link.max_message_size.load(Ordering::Relaxed));
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        if link.stale(generation) {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                handle_problem(&link, generation, "end of stream from broker");
                return;
            }
            Ok(n) => {
                link.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
                let mut offset = 0;
                while offset < n {
                    let pushed = deframer.push(&buf[offset..n]);
                    offset += pushed;
                    let mut extracted = false;
                    while let Some(frame) = deframer.next_frame() {
                        extracted = true;
                        handle_frame(&link, &mut deframer, &frame);
                    }
                    if pushed == 0 && !extracted {
                        tracing::error!("deframer wedged, discarding buffered input");
                        deframer =
                            Deframer::new(link.max_message_size.load(Ordering::Relaxed));
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                handle_problem(&link, generation, &format!("read failed: {err}"));
                return;
            }
        }
    }
}

fn handle_frame(link: &Arc<CpoLink>, deframer: &mut Deframer, frame: &[u8]) {
    let text = String::from_utf8_lossy(frame);
    let mut message = match Message::from_json(&text) {
        Ok(message) => message,
        Err(err) => {
            tracing::error!(%err, "could not decode received message, dropping frame");
            return;
        }
    };
    link.rx_messages.fetch_add(1, Ordering::Relaxed);

    let Some(po) = link.po.upgrade() else {
        return;
    };

    let own_po = format!("{}.po", po.name);
    if message.to.as_deref() == Some(own_po.as_str()) {
        let kind = message.kind.clone();
        match kind.as_deref() {
            Some("manage.connect") => link.apply_connect(&message, false, deframer, &po),
            Some("manage.reconnect") => link.apply_connect(&message, true, deframer, &po),
            Some("manage.ping") => link.handle_ping(&po),
            // subscription management and anything else addressed to the
            // po mailbox routes normally
            _ => po.route(message),
        }
        return;
    }

    if message.is_encrypted() {
        if let Err(err) = message.decrypt(&link.secret) {
            tracing::error!(%err, id = %message.id, "failed to decrypt message, dropping");
            return;
        }
    }
    po.route(message);
}

fn writer_loop(link: Arc<CpoLink>, generation: u64, mut stream: TcpStream) {
    loop {
        let bytes = {
            let mut out = link.out.lock().expect("out queue poisoned");
            if link.stale(generation) {
                return;
            }
            match out.queue.pop_back() {
                Some(bytes) => {
                    out.last_written = Some(bytes.clone());
                    Some(bytes)
                }
                None => None,
            }
        };

        match bytes {
            Some(bytes) => {
                if let Err(err) = stream.write_all(&bytes) {
                    handle_problem(&link, generation, &format!("write failed: {err}"));
                    return;
                }
            }
            None => thread::sleep(WRITE_IDLE_SLEEP),
        }
    }
}

// Any I/O trouble funnels here; the first caller for a given socket
// generation wins and schedules the reconnect.
fn handle_problem(link: &Arc<CpoLink>, generation: u64, context: &str) {
    if link.shutdown.load(Ordering::Relaxed) {
        return;
    }
    if link.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    if link.reconnect_pending.swap(true, Ordering::SeqCst) {
        return;
    }

    tracing::info!(context, "broker link failed, reconnecting in 500 ms");
    link.connected.store(false, Ordering::SeqCst);
    link.generation.fetch_add(1, Ordering::SeqCst);
    if let Some(socket) = link.socket.lock().expect("socket lock poisoned").take() {
        let _ = socket.shutdown(Shutdown::Both);
    }

    let link = link.clone();
    thread::spawn(move || {
        thread::sleep(RECONNECT_DELAY);
        connect_loop(link);
    });
}

fn spawn_shuttler(link: &Arc<CpoLink>) {
    let link = link.clone();
    thread::spawn(move || loop {
        if link.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let Some(po) = link.po.upgrade() else {
            return;
        };
        let mailbox = po.cpo_mailbox().clone();
        drop(po);
        if let Some(message) = mailbox.poll(Duration::from_millis(250)) {
            link.deliver(&message);
        }
    });
}

fn spawn_ping_sweep(link: &Arc<CpoLink>) {
    let link = link.clone();
    thread::spawn(move || loop {
        thread::sleep(PING_SWEEP_INTERVAL);
        if link.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if !link.is_connected() {
            continue;
        }
        let elapsed = link
            .time_since_ping_ms
            .fetch_add(PING_SWEEP_INTERVAL.as_millis() as u64, Ordering::Relaxed)
            + PING_SWEEP_INTERVAL.as_millis() as u64;
        let interval = link.ping_interval_ms.load(Ordering::Relaxed);
        if interval > 0 && elapsed >= interval + interval / 2 {
            let generation = link.generation.load(Ordering::SeqCst);
            handle_problem(&link, generation, "no ping from broker in time");
        }
    });
}
