//! The broker's socket multiplexer.
//!
//! One thread owns every socket: it accepts pending connections, reads
//! each readable connection into a fresh buffer, and services writes for
//! every client with queued output. All sockets are non-blocking; a short
//! idle sleep bounds the loop's reaction time to queue changes made by
//! other threads. Raw reads are handed to the rx worker through a bounded
//! queue so deframing and routing never stall the loop.

use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::TrySendError;

use super::connection::PoConnection;
use super::{CpoCore, RxBytes};

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const ACCEPT_ERROR_SLEEP: Duration = Duration::from_millis(25);
// extra room beyond max_message_size for the frame prefix and trailer
const READ_SLACK: usize = 10;

pub(crate) fn run(cpo: Arc<CpoCore>, listener: TcpListener) {
    loop {
        if cpo.shutdown.load(Ordering::Relaxed) {
            return;
        }

        let mut busy = false;
        busy |= accept_pending(&cpo, &listener);
        busy |= service_reads(&cpo);
        busy |= service_writes(&cpo);

        if !busy {
            thread::sleep(IDLE_SLEEP);
        }
    }
}

fn accept_pending(cpo: &Arc<CpoCore>, listener: &TcpListener) -> bool {
    let mut accepted = false;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    tracing::warn!(%err, "failed to configure accepted socket");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                let name = peer.to_string();
                let connection = Arc::new(PoConnection::new(
                    name.clone(),
                    stream,
                    cpo.config.max_message_size,
                ));
                cpo.connections
                    .lock()
                    .expect("connections poisoned")
                    .insert(name.clone(), connection);
                tracing::debug!(connection = %name, "accepted connection");
                accepted = true;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                thread::sleep(ACCEPT_ERROR_SLEEP);
                break;
            }
        }
    }
    accepted
}

fn service_reads(cpo: &Arc<CpoCore>) -> bool {
    let connections = cpo.snapshot_connections();
    let mut busy = false;

    for connection in connections {
        if !connection.is_open() {
            cpo.connections
                .lock()
                .expect("connections poisoned")
                .remove(&connection.name);
            continue;
        }
        match read_connection(cpo, &connection) {
            Ok(read_any) => busy |= read_any,
            Err(err) => {
                tracing::debug!(connection = %connection.name, %err, "read failed, closing");
                cpo.close_connection(&connection);
            }
        }
    }
    busy
}

// Read until the socket runs dry or one buffer fills; hand the bytes to
// the rx worker.
fn read_connection(cpo: &Arc<CpoCore>, connection: &Arc<PoConnection>) -> std::io::Result<bool> {
    use std::io::Read;

    let mut buf = vec![0u8; cpo.config.max_message_size + READ_SLACK];
    let mut filled = 0usize;

    loop {
        if filled == buf.len() {
            break;
        }
        match (&connection.stream).read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                break;
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    if filled == 0 {
        return Ok(false);
    }
    buf.truncate(filled);
    match cpo.rx_tx.try_send(RxBytes {
        connection: connection.clone(),
        bytes: buf,
    }) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            tracing::warn!(connection = %connection.name, "rx queue full, dropping read");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
    Ok(true)
}

fn service_writes(cpo: &Arc<CpoCore>) -> bool {
    let connections = cpo.snapshot_connections();
    let mut busy = false;

    for connection in connections {
        if !connection.is_open() {
            continue;
        }
        let Some(client) = connection.client() else {
            continue;
        };
        if !client.has_pending() {
            continue;
        }
        match client.write_to(&connection.stream) {
            Ok(written) => busy |= written > 0,
            Err(err) => {
                tracing::debug!(connection = %connection.name, %err, "write failed, closing");
                cpo.close_connection(&connection);
            }
        }
    }
    busy
}
