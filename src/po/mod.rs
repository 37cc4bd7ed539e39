//! Post office runtime.
//!
//! A post office owns the mailboxes of one process, routes local traffic
//! directly, and forwards foreign traffic to the central post office over
//! its single [`link`]. Subscription management, the retry bookkeeping for
//! foreign subscribe/unsubscribe requests, and the `po` management mailbox
//! all live here.

mod link;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{OverflowPolicy, PoConfig};
use crate::crypto::CryptoError;
use crate::mailbox::Mailbox;
use crate::message::{Message, MessageError};
use crate::subscriptions::{split_key, subscription_key, SubscriptionIndex};

use link::CpoLink;

/// Reserved name of the internal mailbox that feeds the broker link.
pub const CPO_MAILBOX_NAME: &str = "[({CPO})]";

const CPO_MAILBOX_SIZE_MULTIPLIER: usize = 10;
const WAITER_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const WAITER_EXPIRY: Duration = Duration::from_secs(1);
const SUBSCRIBE_KIND: &str = "manage.subscribe";
const UNSUBSCRIBE_KIND: &str = "manage.unsubscribe";

#[derive(Debug, Error)]
pub enum PoError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("invalid mailbox name: {0}")]
    BadMailboxName(String),
    #[error("mailbox name already in use: {0}")]
    DuplicateMailbox(String),
    #[error("post office has shut down")]
    Terminated,
}

/// Handle to a running post office. Cheap to clone; the runtime shuts down
/// when [`PostOffice::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct PostOffice {
    core: Arc<PoCore>,
}

impl PostOffice {
    /// Start a post office with the given configuration. The broker link
    /// comes up in the background and retries until the broker is
    /// reachable; messages sent meanwhile are queued.
    pub fn new(config: PoConfig) -> Result<PostOffice, crate::config::ConfigError> {
        config.validate()?;
        let secret = config.secret_bytes()?;

        let core = Arc::new_cyclic(|weak: &Weak<PoCore>| PoCore {
            name: config.name.clone(),
            prefix: format!("{}.", config.name),
            secret,
            queue_size: config.queue_size,
            overflow: config.overflow,
            weak: weak.clone(),
            mailboxes: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionIndex::new(),
            special_waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            cpo_mailbox: OnceLock::new(),
            link: OnceLock::new(),
            shutdown: AtomicBool::new(false),
        });

        let cpo_mailbox = Arc::new(Mailbox::new(
            core.weak.clone(),
            &core.name,
            CPO_MAILBOX_NAME,
            config.queue_size * CPO_MAILBOX_SIZE_MULTIPLIER,
            config.overflow,
        ));
        core.cpo_mailbox
            .set(cpo_mailbox)
            .map_err(|_| ())
            .expect("cpo mailbox set once");

        let po_mailbox = core
            .create_mailbox("po")
            .expect("reserved po mailbox is always creatable");

        let link = CpoLink::start(
            core.weak.clone(),
            &config.cpo_host,
            config.cpo_port,
            core.secret.clone(),
            config.overflow,
        );
        core.link.set(link).map_err(|_| ()).expect("link set once");

        spawn_po_mailbox_consumer(core.weak.clone(), po_mailbox);
        spawn_waiter_sweep(core.weak.clone());

        Ok(PostOffice { core })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Create a mailbox with the given short name.
    pub fn create_mailbox(&self, name: &str) -> Result<Arc<Mailbox>, PoError> {
        self.core.create_mailbox(name)
    }

    /// Look up an existing mailbox by short name.
    pub fn get_mailbox(&self, name: &str) -> Option<Arc<Mailbox>> {
        self.core
            .mailboxes
            .lock()
            .expect("mailbox registry poisoned")
            .get(name)
            .cloned()
    }

    /// True once the broker link is authenticated and live.
    pub fn is_connected(&self) -> bool {
        self.core.link().is_connected()
    }

    /// Times this post office has (re)connected to the broker.
    pub fn connection_count(&self) -> u64 {
        self.core.link().connection_count()
    }

    /// Messages received over the broker link.
    pub fn rx_messages(&self) -> u64 {
        self.core.link().rx_message_count()
    }

    /// Messages sent over the broker link.
    pub fn tx_messages(&self) -> u64 {
        self.core.link().tx_message_count()
    }

    /// When the broker link last came up.
    pub fn last_connect_time(&self) -> Option<Instant> {
        self.core.link().last_connect_time()
    }

    /// Stop all workers and close the broker link.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Sever the broker socket without shutting down, as a link fault
    /// would. The link reconnects on its own.
    #[doc(hidden)]
    pub fn kill_socket(&self) {
        self.core.link().kill_socket();
    }
}

pub(crate) struct PoCore {
    pub(crate) name: String,
    prefix: String,
    secret: Vec<u8>,
    queue_size: usize,
    overflow: OverflowPolicy,
    weak: Weak<PoCore>,
    mailboxes: Mutex<HashMap<String, Arc<Mailbox>>>,
    subscriptions: SubscriptionIndex<Arc<Mailbox>>,
    special_waiters: Mutex<HashMap<String, SpecialWaiter>>,
    next_id: AtomicU64,
    cpo_mailbox: OnceLock<Arc<Mailbox>>,
    link: OnceLock<Arc<CpoLink>>,
    shutdown: AtomicBool,
}

struct SpecialWaiter {
    message: Message,
    sent_at: Instant,
}

impl PoCore {
    pub(crate) fn next_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{}", crate::codec::encode(n), self.name)
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Qualify a bare mailbox name with the local post office name; an
    /// address that already contains a `.` passes through.
    pub(crate) fn ensure_fq(&self, mailbox: &str) -> String {
        if mailbox.contains('.') {
            mailbox.to_string()
        } else {
            format!("{}.{mailbox}", self.name)
        }
    }

    fn is_foreign(&self, address: &str) -> bool {
        !address.starts_with(&self.prefix)
    }

    pub(crate) fn cpo_mailbox(&self) -> &Arc<Mailbox> {
        self.cpo_mailbox.get().expect("cpo mailbox initialized")
    }

    /// The registry's handle for one of this post office's mailboxes.
    pub(crate) fn arc_of(&self, name: &str) -> Option<Arc<Mailbox>> {
        if name == CPO_MAILBOX_NAME {
            return Some(self.cpo_mailbox().clone());
        }
        self.mailboxes
            .lock()
            .expect("mailbox registry poisoned")
            .get(name)
            .cloned()
    }

    fn link(&self) -> &Arc<CpoLink> {
        self.link.get().expect("link initialized")
    }

    pub(crate) fn create_mailbox(&self, name: &str) -> Result<Arc<Mailbox>, PoError> {
        if name.is_empty() {
            return Err(PoError::BadMailboxName("empty name".into()));
        }
        if name.contains('.') {
            return Err(PoError::BadMailboxName(format!(
                "name may not contain a period: {name}"
            )));
        }
        if name == CPO_MAILBOX_NAME {
            return Err(PoError::BadMailboxName(format!("reserved name: {name}")));
        }

        let mut mailboxes = self.mailboxes.lock().expect("mailbox registry poisoned");
        if mailboxes.contains_key(name) {
            return Err(PoError::DuplicateMailbox(name.into()));
        }
        let mailbox = Arc::new(Mailbox::new(
            self.weak.clone(),
            &self.name,
            name,
            self.queue_size,
            self.overflow,
        ));
        mailboxes.insert(name.to_string(), mailbox.clone());
        Ok(mailbox)
    }

    /// Route a message to its destination: a local mailbox, the broker
    /// link, or the local subscriber set.
    pub(crate) fn route(&self, message: Message) {
        if let Some(to) = message.to.clone() {
            if let Some(short) = to.strip_prefix(&self.prefix) {
                match self
                    .mailboxes
                    .lock()
                    .expect("mailbox registry poisoned")
                    .get(short)
                    .cloned()
                {
                    Some(mailbox) => mailbox.receive(message),
                    // a message can arrive before its destination mailbox
                    // is created; dropping beats erroring out here
                    None => tracing::warn!(to = %to, "destination mailbox does not exist"),
                }
                return;
            }

            // foreign destination: interactive subscribe/unsubscribe gets a
            // retry record until the remote po acknowledges it
            let to_po_mailbox = to.split_once('.').is_some_and(|(_, mb)| mb == "po");
            let special = matches!(
                message.kind.as_deref(),
                Some(SUBSCRIBE_KIND) | Some(UNSUBSCRIBE_KIND)
            );
            if to_po_mailbox && special && !message.is_reply() && message.expects_reply() {
                self.special_waiters
                    .lock()
                    .expect("special waiters poisoned")
                    .insert(
                        message.id.clone(),
                        SpecialWaiter {
                            message: message.clone(),
                            sent_at: Instant::now(),
                        },
                    );
            }
            self.cpo_mailbox().receive(message);
            return;
        }

        // publish: deliver to the union of exact-type and major-type
        // subscribers
        let Some(kind) = message.kind.as_deref() else {
            tracing::error!(from = %message.from, "publish message without a type");
            return;
        };
        let targets = self.subscriptions.publish_targets(&message.from, kind);
        if targets.is_empty() {
            tracing::debug!(from = %message.from, kind, "publish with no subscribers");
            return;
        }
        for (_, mailbox) in targets {
            mailbox.receive(message.clone());
        }
    }

    /// Add or remove a subscription, notifying the source post office when
    /// it is foreign.
    pub(crate) fn man_sub(
        &self,
        subscribe: bool,
        mailbox: &Arc<Mailbox>,
        source: &str,
        kind: &str,
    ) {
        let source_fq = self.ensure_fq(source);
        let key = subscription_key(&source_fq, kind);
        if subscribe {
            self.subscriptions.add(&key, &mailbox.address, mailbox.clone());
        } else {
            self.subscriptions.remove(&key, &mailbox.address);
        }

        if self.is_foreign(&source_fq) {
            let manage_kind = if subscribe {
                SUBSCRIBE_KIND
            } else {
                UNSUBSCRIBE_KIND
            };
            let to = format!("{}.po", po_name_of(&source_fq));
            match Message::new(
                &format!("{}.po", self.name),
                Some(&to),
                Some(manage_kind),
                &self.next_id(),
                None,
                true,
            ) {
                Ok(mut message) => {
                    message.put("source", source_fq.clone());
                    message.put("type", kind);
                    message.put("requestor", mailbox.address.clone());
                    self.route(message);
                }
                Err(err) => tracing::error!(%err, "failed to build subscription notice"),
            }
        }
    }

    /// Re-issue every foreign subscription. Runs once after the first
    /// successful broker connection; these replays are informational and do
    /// not request replies.
    pub(crate) fn handle_subscription_refresh(&self) {
        for (key, subscribers) in self.subscriptions.entries() {
            if key.starts_with(&self.prefix) {
                continue;
            }
            let Some((source, kind)) = split_key(&key) else {
                continue;
            };
            let to = format!("{}.po", po_name_of(source));
            for subscriber in subscribers {
                match Message::new(
                    &format!("{}.po", self.name),
                    Some(&to),
                    Some(SUBSCRIBE_KIND),
                    &self.next_id(),
                    None,
                    false,
                ) {
                    Ok(mut message) => {
                        message.put("source", source);
                        message.put("type", kind);
                        message.put("requestor", subscriber);
                        self.route(message);
                    }
                    Err(err) => tracing::error!(%err, "failed to build refresh notice"),
                }
            }
        }
    }

    // Handles traffic addressed to the reserved `po` mailbox.
    fn handle_po_message(&self, po_mailbox: &Arc<Mailbox>, message: Message) {
        let kind = message.kind.clone();
        match kind.as_deref() {
            Some(SUBSCRIBE_KIND) => self.handle_subscription_message(po_mailbox, message, true),
            Some(UNSUBSCRIBE_KIND) => self.handle_subscription_message(po_mailbox, message, false),
            other => {
                tracing::error!(kind = ?other, "unknown po message type received");
            }
        }
    }

    fn handle_subscription_message(
        &self,
        po_mailbox: &Arc<Mailbox>,
        message: Message,
        subscribe: bool,
    ) {
        // an acknowledgement from the remote side clears the retry record
        if let Some(reply) = message.reply.as_deref() {
            self.special_waiters
                .lock()
                .expect("special waiters poisoned")
                .remove(reply);
            tracing::trace!(reply, "cleared special reply waiter");
            return;
        }

        let source = message.get_str("source").map(str::to_string);
        let kind = message.get_str("type").map(str::to_string);
        if let (Some(source), Some(kind)) = (source, kind) {
            if !source.is_empty() && !kind.is_empty() {
                // the cpo-bound mailbox proxies for the foreign subscriber
                self.man_sub(subscribe, self.cpo_mailbox(), &source, &kind);
            }
        }

        if message.expects_reply() {
            match po_mailbox.create_reply(&message, message.kind.as_deref()) {
                Ok(reply) => po_mailbox.send(reply),
                Err(err) => tracing::error!(%err, "failed to build subscription ack"),
            }
        }
    }

    // Re-send any subscribe/unsubscribe that has waited on an
    // acknowledgement for more than a second.
    fn sweep_special_waiters(&self) {
        let now = Instant::now();
        let expired: Vec<Message> = {
            let mut waiters = self.special_waiters.lock().expect("special waiters poisoned");
            waiters
                .values_mut()
                .filter(|waiter| now.duration_since(waiter.sent_at) >= WAITER_EXPIRY)
                .map(|waiter| {
                    waiter.sent_at = now;
                    waiter.message.clone()
                })
                .collect()
        };
        for message in expired {
            tracing::debug!(id = %message.id, "re-sending unacknowledged subscription notice");
            self.cpo_mailbox().receive(message);
        }
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.link().shutdown();
        tracing::info!(po = %self.name, "post office has shut down");
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

impl Drop for PoCore {
    fn drop(&mut self) {
        if let Some(link) = self.link.get() {
            link.shutdown();
        }
    }
}

/// The post office component of an address.
pub(crate) fn po_name_of(address: &str) -> &str {
    match address.find('.') {
        Some(dot) => &address[..dot],
        None => address,
    }
}

fn spawn_po_mailbox_consumer(po: Weak<PoCore>, po_mailbox: Arc<Mailbox>) {
    thread::spawn(move || loop {
        let Some(core) = po.upgrade() else {
            return;
        };
        if core.is_shutdown() {
            return;
        }
        if let Some(message) = po_mailbox.poll(Duration::from_millis(250)) {
            tracing::trace!(id = %message.id, "po mailbox received");
            core.handle_po_message(&po_mailbox, message);
        }
    });
}

fn spawn_waiter_sweep(po: Weak<PoCore>) {
    thread::spawn(move || loop {
        thread::sleep(WAITER_SWEEP_INTERVAL);
        let Some(core) = po.upgrade() else {
            return;
        };
        if core.is_shutdown() {
            return;
        }
        core.sweep_special_waiters();
    });
}
