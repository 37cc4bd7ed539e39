//! Central post office: the broker at the hub of the star.
//!
//! The broker accepts one TCP connection per client post office,
//! authenticates it against the configured roster, routes direct messages
//! by destination prefix, fans publishes out to subscriber post offices,
//! and snoops subscribe/unsubscribe traffic to build the routing table it
//! fans out with. Encrypted messages are re-encrypted per hop so each peer
//! only ever sees ciphertext under its own secret.

mod client;
mod connection;
mod event_loop;

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::{ClientEntry, ConfigError, CpoConfig};
use crate::crypto::Authenticator;
use crate::message::{Message, CONNECTION_ATTR};
use crate::monitor;
use crate::subscriptions::{split_key, subscription_key, SubscriptionIndex};

use client::PoClient;
use connection::PoConnection;

/// Address of the broker's own management mailbox.
pub const CPO_ADDRESS: &str = "central.po";

const PONG_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const RX_QUEUE_SIZE: usize = 100;

const CONNECT: &str = "manage.connect";
const RECONNECT: &str = "manage.reconnect";
const PING: &str = "manage.ping";
const PONG: &str = "manage.pong";
const STATUS: &str = "manage.status";
const WRITE: &str = "manage.write";
const ADD: &str = "manage.add";
const DELETE: &str = "manage.delete";
const MONITOR: &str = "manage.monitor";
const CONNECTED: &str = "manage.connected";
const SUBSCRIBE: &str = "manage.subscribe";
const UNSUBSCRIBE: &str = "manage.unsubscribe";

#[derive(Debug, Error)]
pub enum CpoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Handle to a running central post office.
pub struct CentralPostOffice {
    core: Arc<CpoCore>,
}

impl CentralPostOffice {
    /// Bind the listening socket and start every worker. `clients` is the
    /// configured roster; `secrets_path` is where `manage.write` persists
    /// roster changes.
    pub fn start(
        config: CpoConfig,
        clients: Vec<ClientEntry>,
        secrets_path: PathBuf,
    ) -> Result<CentralPostOffice, CpoError> {
        config.validate()?;

        let mut roster = HashMap::new();
        for entry in &clients {
            let client = PoClient::from_entry(entry, config.overflow)?;
            roster.insert(entry.name.clone(), Arc::new(client));
        }

        let addr = format!("{}:{}", config.local_address, config.port);
        let listener = TcpListener::bind(&addr).map_err(|source| CpoError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| CpoError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| CpoError::Bind {
            addr: "local".into(),
            source,
        })?;

        let (rx_tx, rx_rx) = bounded(RX_QUEUE_SIZE);
        let core = Arc::new(CpoCore {
            config,
            secrets_path,
            clients: Mutex::new(roster),
            connections: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionIndex::new(),
            rx_tx,
            next_id: AtomicU64::new(0),
            started_at: Instant::now(),
            started_stamp: OffsetDateTime::now_utc(),
            shutdown: AtomicBool::new(false),
            local_addr,
        });

        let loop_core = core.clone();
        thread::spawn(move || event_loop::run(loop_core, listener));
        spawn_rx_worker(core.clone(), rx_rx);
        spawn_pinger(core.clone());
        spawn_pong_sweep(core.clone());

        tracing::info!(name = %core.config.name, %local_addr, "central post office started");
        Ok(CentralPostOffice { core })
    }

    /// The bound listening address; useful when the port was ephemeral.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    /// True if the named client post office currently has an authenticated
    /// connection.
    pub fn is_client_connected(&self, name: &str) -> bool {
        self.core
            .clients
            .lock()
            .expect("clients poisoned")
            .get(name)
            .is_some_and(|client| client.is_connected())
    }

    /// Stop all workers and close every connection.
    pub fn shutdown(&self) {
        if self.core.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections = self.core.snapshot_connections();
        for connection in connections {
            connection.close();
        }
        tracing::info!(name = %self.core.config.name, "central post office has shut down");
    }
}

impl Drop for CentralPostOffice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) struct CpoCore {
    pub(crate) config: CpoConfig,
    secrets_path: PathBuf,
    pub(crate) clients: Mutex<HashMap<String, Arc<PoClient>>>,
    pub(crate) connections: Mutex<HashMap<String, Arc<PoConnection>>>,
    subscriptions: SubscriptionIndex<()>,
    pub(crate) rx_tx: Sender<RxBytes>,
    next_id: AtomicU64,
    started_at: Instant,
    started_stamp: OffsetDateTime,
    pub(crate) shutdown: AtomicBool,
    local_addr: SocketAddr,
}

pub(crate) struct RxBytes {
    pub(crate) connection: Arc<PoConnection>,
    pub(crate) bytes: Vec<u8>,
}

impl CpoCore {
    fn next_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{}", crate::codec::encode(n), self.config.name)
    }

    fn client(&self, name: &str) -> Option<Arc<PoClient>> {
        self.clients
            .lock()
            .expect("clients poisoned")
            .get(name)
            .cloned()
    }

    pub(crate) fn snapshot_connections(&self) -> Vec<Arc<PoConnection>> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn close_connection(&self, connection: &Arc<PoConnection>) {
        connection.close();
        self.connections
            .lock()
            .expect("connections poisoned")
            .remove(&connection.name);
    }

    // Feed raw socket bytes through the connection's deframer and route
    // every complete message. Runs on the rx worker thread only.
    fn ingest(&self, connection: &Arc<PoConnection>, bytes: &[u8]) {
        if !connection.is_open() {
            return;
        }
        if let Some(client) = connection.client() {
            client
                .rx_bytes
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }

        let mut deframer = connection.deframer.lock().expect("deframer poisoned");
        let mut offset = 0usize;
        while offset < bytes.len() {
            let pushed = deframer.push(&bytes[offset..]);
            offset += pushed;
            let mut extracted = false;
            while let Some(frame) = deframer.next_frame() {
                extracted = true;
                self.handle_frame(connection, &frame);
            }
            if pushed == 0 && !extracted {
                tracing::error!(connection = %connection.name,
                    "deframer wedged, discarding buffered input");
                *deframer = crate::wire::Deframer::new(self.config.max_message_size);
            }
        }
    }

    fn handle_frame(&self, connection: &Arc<PoConnection>, frame: &[u8]) {
        let text = String::from_utf8_lossy(frame);
        let mut message = match Message::from_json(&text) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(connection = %connection.name, %err,
                    "could not decode received message, dropping frame");
                return;
            }
        };
        if let Some(client) = connection.client() {
            client.rx_messages.fetch_add(1, Ordering::Relaxed);
        }

        // let the management handlers correlate with the connection
        if message.to.as_deref() == Some(CPO_ADDRESS) {
            message.put(CONNECTION_ATTR, connection.name.clone());
        }
        self.receive_message(connection.client(), message);
    }

    /// Route one inbound message.
    fn receive_message(&self, source: Option<Arc<PoClient>>, message: Message) {
        if message.is_publish() {
            self.route_publish(source, &message);
            return;
        }

        let to = message.to.clone().unwrap_or_default();

        // snoop subscribe/unsubscribe so publishes can be routed later; the
        // message itself still travels on to the source post office
        let to_po_mailbox = to.split_once('.').is_some_and(|(_, mb)| mb == "po");
        let subscription = matches!(message.kind.as_deref(), Some(SUBSCRIBE) | Some(UNSUBSCRIBE));
        if to_po_mailbox && subscription && !message.is_reply() {
            self.snoop_subscription(&message);
        }

        if to == CPO_ADDRESS {
            match message.kind.as_deref() {
                Some(CONNECT) => self.handle_connect(&message, false),
                Some(RECONNECT) => self.handle_connect(&message, true),
                Some(PONG) => self.handle_pong(&message),
                Some(STATUS) => self.handle_status(&message),
                Some(WRITE) => self.handle_write(&message),
                Some(ADD) => self.handle_add(&message),
                Some(DELETE) => self.handle_delete(&message),
                Some(MONITOR) => self.handle_monitor(&message),
                Some(CONNECTED) => self.handle_connected(&message),
                other => {
                    tracing::error!(kind = ?other, "unknown management message type received");
                }
            }
            return;
        }

        let destination = crate::po::po_name_of(&to).to_string();
        self.deliver_to_po(source.as_ref(), &message, &destination);
    }

    fn route_publish(&self, source: Option<Arc<PoClient>>, message: &Message) {
        let Some(kind) = message.kind.as_deref() else {
            tracing::error!(from = %message.from, "publish message without a type");
            return;
        };
        let targets = self.subscriptions.publish_targets(&message.from, kind);
        if targets.is_empty() {
            tracing::error!(from = %message.from, kind,
                "publish with no known subscribers, dropping");
            return;
        }

        // once per destination post office, however many of its mailboxes
        // subscribed
        let mut delivered: HashSet<String> = HashSet::new();
        for (subscriber, ()) in targets {
            let po = crate::po::po_name_of(&subscriber).to_string();
            if delivered.insert(po.clone()) {
                self.deliver_to_po(source.as_ref(), message, &po);
            }
        }
    }

    fn deliver_to_po(&self, source: Option<&Arc<PoClient>>, message: &Message, po: &str) {
        let Some(client) = self.client(po) else {
            tracing::error!(po, id = %message.id, "cannot route to unknown post office");
            return;
        };

        if message.is_encrypted() {
            let Some(source) = source else {
                tracing::error!(po, id = %message.id,
                    "encrypted message from unauthenticated connection, dropping");
                return;
            };
            // clone so the copy still queued for other recipients keeps the
            // source encryption
            let mut copy = message.clone();
            if let Err(err) = copy.re_encrypt(&source.secret, &client.secret) {
                tracing::error!(po, id = %message.id, %err, "re-encryption failed, dropping");
                return;
            }
            client.deliver(&copy);
        } else {
            client.deliver(message);
        }
    }

    fn snoop_subscription(&self, message: &Message) {
        let (Some(source), Some(kind)) = (message.get_str("source"), message.get_str("type"))
        else {
            tracing::warn!(id = %message.id, "subscription notice without source/type");
            return;
        };
        let Some(requestor) = message.get_str("requestor") else {
            tracing::warn!(id = %message.id, "subscription notice without requestor");
            return;
        };

        let key = subscription_key(source, kind);
        let subscribe = message.kind.as_deref() == Some(SUBSCRIBE);
        if subscribe {
            self.subscriptions.add(&key, requestor, ());
        } else {
            self.subscriptions.remove(&key, requestor);
        }
        tracing::info!(key, requestor, subscribe, "snooped subscription change");
    }

    fn connection_of(&self, message: &Message) -> Option<Arc<PoConnection>> {
        let name = message.get_str(CONNECTION_ATTR)?;
        self.connections
            .lock()
            .expect("connections poisoned")
            .get(name)
            .cloned()
    }

    fn handle_connect(&self, message: &Message, is_reconnect: bool) {
        let po_name = message.from_po().to_string();

        let Some(connection) = self.connection_of(message) else {
            tracing::warn!(po = %po_name, "connect message without a live connection");
            return;
        };

        let Some(client) = self.client(&po_name) else {
            self.close_connection(&connection);
            tracing::warn!(po = %po_name, "connection attempted from unknown post office");
            return;
        };

        let expected = Authenticator::new(&client.secret, &po_name, &message.id);
        let presented = message.get_str("authenticator").unwrap_or_default();
        if !expected.verify(presented) {
            self.close_connection(&connection);
            tracing::error!(po = %po_name, "connection attempted with invalid authenticator");
            return;
        }

        // a client reconnecting from a new socket obsoletes any old one
        let previous = client
            .connection
            .lock()
            .expect("connection ref poisoned")
            .upgrade();
        if let Some(previous) = previous {
            if Arc::ptr_eq(&previous, &connection) {
                tracing::info!(po = %po_name, "connect for an already-connected post office");
                return;
            }
            self.close_connection(&previous);
            tracing::info!(po = %po_name, "closed stale connection for reconnecting client");
        }

        *connection.client.lock().expect("client ref poisoned") = Arc::downgrade(&client);
        *client.connection.lock().expect("connection ref poisoned") = Arc::downgrade(&connection);
        connection.pong_age_ms.store(0, Ordering::Relaxed);
        tracing::info!(po = %po_name, connection = %connection.name, "associated post office");

        let response_kind = if client.connects.load(Ordering::Relaxed) == 0 {
            CONNECT
        } else {
            RECONNECT
        };
        match Message::new(
            CPO_ADDRESS,
            Some(&message.from),
            Some(response_kind),
            &self.next_id(),
            Some(&message.id),
            false,
        ) {
            Ok(mut response) => {
                response.put("maxMessageSize", self.config.max_message_size as u64);
                response.put("pingIntervalMS", self.config.ping_interval_ms);
                client.deliver_next(&response);
            }
            Err(err) => tracing::error!(%err, "failed to build connect response"),
        }
        *client.last_connect.lock().expect("last connect poisoned") =
            Some((Instant::now(), OffsetDateTime::now_utc()));

        // a freshly-started client lost its in-memory subscriptions; replay
        // what we have seen for it
        if !is_reconnect {
            self.subscription_refresh(&client);
        }

        client.connects.fetch_add(1, Ordering::Relaxed);
    }

    // Replay, to the client that just connected, every subscription this
    // broker has snooped whose source is that client.
    fn subscription_refresh(&self, client: &Arc<PoClient>) {
        tracing::info!(po = %client.name, "refreshing subscriptions");
        let prefix = format!("{}.", client.name);

        for (key, subscribers) in self.subscriptions.entries() {
            if !key.starts_with(&prefix) {
                continue;
            }
            let Some((source, kind)) = split_key(&key) else {
                continue;
            };
            let to = format!("{}.po", client.name);
            for subscriber in subscribers {
                let from = format!("{}.po", crate::po::po_name_of(&subscriber));
                match Message::new(&from, Some(&to), Some(SUBSCRIBE), &self.next_id(), None, false)
                {
                    Ok(mut replay) => {
                        replay.put("source", source);
                        replay.put("type", kind);
                        replay.put("requestor", subscriber);
                        client.deliver(&replay);
                    }
                    Err(err) => tracing::error!(%err, "failed to build subscription replay"),
                }
            }
        }
    }

    fn handle_pong(&self, message: &Message) {
        let Some(connection) = self.connection_of(message) else {
            tracing::info!(from = %message.from, "pong without a live connection");
            return;
        };
        connection.pong_age_ms.store(0, Ordering::Relaxed);
    }

    // Only designated managers may inspect or mutate the roster.
    fn manager_for(&self, message: &Message) -> Option<Arc<PoClient>> {
        let client = self.client(message.from_po())?;
        if !client.manager {
            tracing::warn!(from = %message.from, kind = ?message.kind,
                "management request from non-manager, ignoring");
            return None;
        }
        Some(client)
    }

    fn handle_status(&self, message: &Message) {
        let Some(manager) = self.manager_for(message) else {
            return;
        };

        let mut reply = match Message::new(
            CPO_ADDRESS,
            Some(&message.from),
            Some(STATUS),
            &self.next_id(),
            Some(&message.id),
            false,
        ) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(%err, "failed to build status reply");
                return;
            }
        };

        let up_days = self.started_at.elapsed().as_secs_f64() / 86_400.0;
        reply.put("started", format_stamp(self.started_stamp));
        reply.put("upDays", up_days);
        reply.put(
            "numConnections",
            self.connections.lock().expect("connections poisoned").len() as u64,
        );
        reply.put(
            "numClients",
            self.clients.lock().expect("clients poisoned").len() as u64,
        );
        reply.put("maxMessageSize", self.config.max_message_size as u64);
        reply.put("pingIntervalMS", self.config.ping_interval_ms);
        reply.put("name", self.config.name.clone());
        reply.put("port", self.local_addr.port());
        reply.put("localAddress", self.config.local_address.clone());

        let clients = self.clients.lock().expect("clients poisoned");
        for client in clients.values() {
            let prefix = format!("clients.{}.", client.name);
            reply.put_dotted(&format!("{prefix}name"), client.name.clone());
            reply.put_dotted(&format!("{prefix}manager"), client.manager);
            reply.put_dotted(
                &format!("{prefix}connections"),
                client.connects.load(Ordering::Relaxed),
            );
            reply.put_dotted(&format!("{prefix}isConnected"), client.is_connected());
            let last_connect = *client.last_connect.lock().expect("last connect poisoned");
            if let Some((instant, stamp)) = last_connect {
                reply.put_dotted(&format!("{prefix}lastConnected"), format_stamp(stamp));
                reply.put_dotted(
                    &format!("{prefix}upDays"),
                    instant.elapsed().as_secs_f64() / 86_400.0,
                );
            }
            reply.put_dotted(&format!("{prefix}secret"), client.secret_base64.clone());
            reply.put_dotted(
                &format!("{prefix}rxMessages"),
                client.rx_messages.load(Ordering::Relaxed),
            );
            reply.put_dotted(
                &format!("{prefix}rxBytes"),
                client.rx_bytes.load(Ordering::Relaxed),
            );
            reply.put_dotted(
                &format!("{prefix}txMessages"),
                client.tx_messages.load(Ordering::Relaxed),
            );
            reply.put_dotted(
                &format!("{prefix}txBytes"),
                client.tx_bytes.load(Ordering::Relaxed),
            );
        }
        drop(clients);

        // the roster details, secrets included, travel only under the
        // manager's key
        if let Err(err) = reply.encrypt(&manager.secret, &["clients"]) {
            tracing::error!(%err, "failed to encrypt status reply, not sending");
            return;
        }
        manager.deliver(&reply);
        tracing::info!(to = %message.from, "sent status");
    }

    fn handle_write(&self, message: &Message) {
        let Some(manager) = self.manager_for(message) else {
            return;
        };

        let entries: Vec<ClientEntry> = self
            .clients
            .lock()
            .expect("clients poisoned")
            .values()
            .map(|client| client.to_entry())
            .collect();
        match crate::config::write_clients(&self.secrets_path, &entries) {
            Ok(()) => tracing::info!(path = %self.secrets_path.display(), "wrote client roster"),
            Err(err) => tracing::error!(%err, "failed to write client roster"),
        }

        self.ack(&manager, message, WRITE);
    }

    fn handle_add(&self, message: &Message) {
        let Some(manager) = self.manager_for(message) else {
            return;
        };

        let mut message = message.clone();
        if let Err(err) = message.decrypt(&manager.secret) {
            tracing::error!(%err, "could not decrypt add request, ignoring");
            return;
        }

        let name = message.get_str("name").unwrap_or_default().to_string();
        let secret = message.get_str("secret").unwrap_or_default().to_string();
        if !name.is_empty() && !secret.is_empty() {
            match PoClient::new(&name, &secret, false, self.config.overflow) {
                Ok(client) => {
                    self.clients
                        .lock()
                        .expect("clients poisoned")
                        .insert(name.clone(), Arc::new(client));
                    tracing::info!(po = %name, "added post office to configured clients");
                }
                Err(err) => tracing::error!(po = %name, %err, "rejected add request"),
            }
        }

        self.ack(&manager, &message, ADD);
    }

    fn handle_delete(&self, message: &Message) {
        let Some(manager) = self.manager_for(message) else {
            return;
        };

        let mut message = message.clone();
        if let Err(err) = message.decrypt(&manager.secret) {
            tracing::error!(%err, "could not decrypt delete request, ignoring");
            return;
        }

        let name = message.get_str("name").unwrap_or_default().to_string();
        if !name.is_empty() {
            self.clients.lock().expect("clients poisoned").remove(&name);
            tracing::info!(po = %name, "deleted post office from configured clients");
        }

        self.ack(&manager, &message, DELETE);
    }

    fn handle_monitor(&self, message: &Message) {
        let Some(client) = self.client(message.from_po()) else {
            tracing::error!(from = %message.from, "monitor request from unknown post office");
            return;
        };

        let reply = Message::new(
            CPO_ADDRESS,
            Some(&message.from),
            Some(MONITOR),
            &self.next_id(),
            Some(&message.id),
            false,
        );
        let Ok(mut reply) = reply else {
            return;
        };

        // collection shells out and samples the cpu over a second; keep it
        // off the router thread
        thread::spawn(move || {
            monitor::fill_os(&mut reply);
            monitor::fill_process(&mut reply);
            client.deliver(&reply);
        });
    }

    fn handle_connected(&self, message: &Message) {
        let Some(sender) = self.client(message.from_po()) else {
            tracing::error!(from = %message.from, "connected request from unknown post office");
            return;
        };

        let names: Vec<String> = {
            let clients = self.clients.lock().expect("clients poisoned");
            clients
                .values()
                .filter(|client| client.is_connected())
                .map(|client| client.name.clone())
                .collect()
        };

        match Message::new(
            CPO_ADDRESS,
            Some(&message.from),
            Some(CONNECTED),
            &self.next_id(),
            Some(&message.id),
            false,
        ) {
            Ok(mut reply) => {
                reply.put("postOffices", names.join(","));
                sender.deliver(&reply);
            }
            Err(err) => tracing::error!(%err, "failed to build connected reply"),
        }
    }

    fn ack(&self, manager: &Arc<PoClient>, message: &Message, kind: &str) {
        match Message::new(
            CPO_ADDRESS,
            Some(&message.from),
            Some(kind),
            &self.next_id(),
            Some(&message.id),
            false,
        ) {
            Ok(ack) => manager.deliver(&ack),
            Err(err) => tracing::error!(%err, kind, "failed to build ack"),
        }
    }

    fn send_pings(&self) {
        let clients = self.snapshot_clients();
        for client in clients {
            if !client.is_connected() {
                continue;
            }
            let to = format!("{}.po", client.name);
            match Message::new(CPO_ADDRESS, Some(&to), Some(PING), &self.next_id(), None, false) {
                Ok(ping) => client.deliver(&ping),
                Err(err) => tracing::error!(%err, "failed to build ping"),
            }
        }
    }

    fn sweep_pongs(&self) {
        let limit = self.config.ping_interval_ms + self.config.ping_interval_ms / 2;
        for connection in self.snapshot_connections() {
            if !connection.is_open() {
                continue;
            }
            let age = connection
                .pong_age_ms
                .fetch_add(PONG_SWEEP_INTERVAL.as_millis() as u64, Ordering::Relaxed)
                + PONG_SWEEP_INTERVAL.as_millis() as u64;
            if age >= limit {
                tracing::error!(connection = %connection.name,
                    "no pong in time, closing connection");
                self.close_connection(&connection);
            }
        }
    }

    fn snapshot_clients(&self) -> Vec<Arc<PoClient>> {
        self.clients
            .lock()
            .expect("clients poisoned")
            .values()
            .cloned()
            .collect()
    }
}

fn format_stamp(stamp: OffsetDateTime) -> String {
    stamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| stamp.unix_timestamp().to_string())
}

fn spawn_rx_worker(cpo: Arc<CpoCore>, rx: Receiver<RxBytes>) {
    thread::spawn(move || loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(batch) => {
                cpo.ingest(&batch.connection, &batch.bytes);
            }
            Err(RecvTimeoutError::Timeout) => {
                if cpo.shutdown.load(Ordering::Relaxed) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    });
}

fn spawn_pinger(cpo: Arc<CpoCore>) {
    let interval = Duration::from_millis(cpo.config.ping_interval_ms);
    thread::spawn(move || loop {
        thread::sleep(interval);
        if cpo.shutdown.load(Ordering::Relaxed) {
            return;
        }
        cpo.send_pings();
    });
}

fn spawn_pong_sweep(cpo: Arc<CpoCore>) {
    thread::spawn(move || loop {
        thread::sleep(PONG_SWEEP_INTERVAL);
        if cpo.shutdown.load(Ordering::Relaxed) {
            return;
        }
        cpo.sweep_pongs();
    });
}
