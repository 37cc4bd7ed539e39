//! Per-socket state for one accepted broker connection.
//!
//! A connection is named by its remote address and starts anonymous; it
//! points at a [`PoClient`](super::client::PoClient) only once the
//! handshake authenticates. The client survives the connection, so both
//! references are weak and cleared on close while the owning maps hold the
//! strong handles.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::wire::Deframer;

use super::client::PoClient;

pub(crate) struct PoConnection {
    pub(crate) name: String,
    pub(crate) stream: TcpStream,
    pub(crate) deframer: Mutex<Deframer>,
    pub(crate) pong_age_ms: AtomicU64,
    pub(crate) client: Mutex<Weak<PoClient>>,
    open: AtomicBool,
}

impl PoConnection {
    pub(crate) fn new(name: String, stream: TcpStream, max_message_size: usize) -> PoConnection {
        PoConnection {
            name,
            stream,
            deframer: Mutex::new(Deframer::new(max_message_size)),
            pong_age_ms: AtomicU64::new(0),
            client: Mutex::new(Weak::new()),
            open: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub(crate) fn client(&self) -> Option<Arc<PoClient>> {
        self.client.lock().expect("client ref poisoned").upgrade()
    }

    /// Close the socket and sever the client association in both
    /// directions. Idempotent.
    pub(crate) fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(client) = self.client() {
                let mut back = client.connection.lock().expect("connection ref poisoned");
                // connection names are unique (one per remote address), so
                // a name match means the back-reference is still ours
                let still_us = back
                    .upgrade()
                    .is_some_and(|connection| connection.name == self.name);
                if still_us {
                    *back = Weak::new();
                }
            }
            *self.client.lock().expect("client ref poisoned") = Weak::new();
            let _ = self.stream.shutdown(Shutdown::Both);
            tracing::debug!(connection = %self.name, "connection closed");
        }
    }
}
