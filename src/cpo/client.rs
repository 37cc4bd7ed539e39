//! Per-peer state the broker keeps for each configured post office.
//!
//! A `PoClient` outlives any single TCP connection: it holds the shared
//! secret, the manager flag, traffic counters, and the outbound queue of
//! serialized frames. The queue is written by the event loop a partial
//! buffer at a time, so the buffer currently in flight is tracked
//! separately from the queued ones.

use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Instant;

use time::OffsetDateTime;

use crate::config::{decode_secret, ClientEntry, ConfigError, OverflowPolicy};
use crate::message::Message;

use super::connection::PoConnection;

const OUTGOING_QUEUE_SIZE: usize = 100;

pub(crate) struct PoClient {
    pub(crate) name: String,
    pub(crate) secret_base64: String,
    pub(crate) secret: Vec<u8>,
    pub(crate) manager: bool,
    overflow: OverflowPolicy,

    out: Mutex<WriteState>,
    pub(crate) connection: Mutex<Weak<PoConnection>>,

    pub(crate) connects: AtomicU64,
    pub(crate) rx_messages: AtomicU64,
    pub(crate) tx_messages: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) last_connect: Mutex<Option<(Instant, OffsetDateTime)>>,
}

struct WriteState {
    // enqueue at the front, write from the back
    queue: VecDeque<Vec<u8>>,
    current: Option<WriteBuf>,
}

struct WriteBuf {
    bytes: Vec<u8>,
    written: usize,
}

impl PoClient {
    pub(crate) fn new(
        name: &str,
        secret_base64: &str,
        manager: bool,
        overflow: OverflowPolicy,
    ) -> Result<PoClient, ConfigError> {
        let secret = decode_secret(secret_base64)?;
        Ok(PoClient {
            name: name.to_string(),
            secret_base64: secret_base64.to_string(),
            secret,
            manager,
            overflow,
            out: Mutex::new(WriteState {
                queue: VecDeque::new(),
                current: None,
            }),
            connection: Mutex::new(Weak::new()),
            connects: AtomicU64::new(0),
            rx_messages: AtomicU64::new(0),
            tx_messages: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            last_connect: Mutex::new(None),
        })
    }

    pub(crate) fn from_entry(
        entry: &ClientEntry,
        overflow: OverflowPolicy,
    ) -> Result<PoClient, ConfigError> {
        PoClient::new(&entry.name, &entry.secret, entry.manager, overflow)
    }

    pub(crate) fn to_entry(&self) -> ClientEntry {
        ClientEntry {
            name: self.name.clone(),
            secret: self.secret_base64.clone(),
            manager: self.manager,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .expect("connection ref poisoned")
            .upgrade()
            .is_some_and(|connection| connection.is_open())
    }

    /// Queue a message for transmission to this post office.
    pub(crate) fn deliver(&self, message: &Message) {
        let serialized = message.serialize();
        self.tx_bytes
            .fetch_add(serialized.len() as u64, Ordering::Relaxed);
        self.tx_messages.fetch_add(1, Ordering::Relaxed);

        let mut out = self.out.lock().expect("out queue poisoned");
        if out.queue.len() >= OUTGOING_QUEUE_SIZE {
            match self.overflow {
                OverflowPolicy::DropNewest => {
                    tracing::warn!(client = %self.name, id = %message.id,
                        "outgoing queue full, dropping message");
                    return;
                }
                OverflowPolicy::DropOldest => {
                    out.queue.pop_back();
                }
            }
        }
        out.queue.push_front(serialized);
    }

    /// Queue `message` to be the next frame written. A partially-written
    /// buffer is re-queued in full right behind it, so the (re)connected
    /// socket starts at a frame boundary and the interrupted message is
    /// still sent.
    pub(crate) fn deliver_next(&self, message: &Message) {
        let serialized = message.serialize();
        self.tx_bytes
            .fetch_add(serialized.len() as u64, Ordering::Relaxed);
        self.tx_messages.fetch_add(1, Ordering::Relaxed);

        let mut out = self.out.lock().expect("out queue poisoned");
        if let Some(current) = out.current.take() {
            out.queue.push_back(current.bytes);
        }
        out.queue.push_back(serialized);
    }

    pub(crate) fn has_pending(&self) -> bool {
        let out = self.out.lock().expect("out queue poisoned");
        out.current.is_some() || !out.queue.is_empty()
    }

    /// Write as much queued output as the non-blocking socket accepts,
    /// returning the number of bytes it took.
    pub(crate) fn write_to(&self, stream: &TcpStream) -> std::io::Result<usize> {
        let mut out = self.out.lock().expect("out queue poisoned");
        let mut total = 0usize;
        loop {
            if out.current.is_none() {
                out.current = out
                    .queue
                    .pop_back()
                    .map(|bytes| WriteBuf { bytes, written: 0 });
            }
            let Some(current) = out.current.as_mut() else {
                return Ok(total);
            };

            match (&*stream).write(&current.bytes[current.written..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ));
                }
                Ok(n) => {
                    current.written += n;
                    total += n;
                    if current.written == current.bytes.len() {
                        out.current = None;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(total),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    fn client() -> PoClient {
        PoClient::new(
            "alpha",
            &STANDARD.encode(b"secret"),
            false,
            OverflowPolicy::DropNewest,
        )
        .unwrap()
    }

    fn message(id: &str) -> Message {
        Message::new("central.po", Some("alpha.po"), Some("t"), id, None, false).unwrap()
    }

    #[test]
    fn rejects_bad_secret() {
        assert!(PoClient::new("alpha", "%%%", false, OverflowPolicy::DropNewest).is_err());
    }

    #[test]
    fn deliver_next_jumps_the_queue() {
        let client = client();
        client.deliver(&message("1.c"));
        client.deliver(&message("2.c"));
        client.deliver_next(&message("3.c"));

        let mut out = client.out.lock().unwrap();
        let first = out.queue.pop_back().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("3.c"));
        let second = out.queue.pop_back().unwrap();
        assert!(String::from_utf8_lossy(&second).contains("1.c"));
    }

    #[test]
    fn deliver_next_requeues_the_inflight_buffer_behind_it() {
        let client = client();
        let inflight = message("9.c").serialize();
        client.out.lock().unwrap().current = Some(WriteBuf {
            bytes: inflight.clone(),
            written: 3,
        });

        client.deliver_next(&message("10.c"));

        let mut out = client.out.lock().unwrap();
        assert!(out.current.is_none());
        let first = out.queue.pop_back().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("10.c"));
        // the whole interrupted frame, not just its unsent tail
        assert_eq!(out.queue.pop_back().unwrap(), inflight);
    }

    #[test]
    fn overflow_drop_newest_discards_the_arrival() {
        let client = client();
        for i in 0..OUTGOING_QUEUE_SIZE + 5 {
            client.deliver(&message(&format!("{i}.c")));
        }
        let out = client.out.lock().unwrap();
        assert_eq!(out.queue.len(), OUTGOING_QUEUE_SIZE);
        // oldest still at the write end
        assert!(String::from_utf8_lossy(out.queue.back().unwrap()).contains("\"0.c\""));
    }
}
