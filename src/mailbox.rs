//! Mailboxes, the surface actors interact with.
//!
//! Actors create messages through their mailbox, send them through its post
//! office, and receive both direct and subscribed traffic from its bounded
//! queue. The mailbox also keeps the rendezvous slots used by
//! [`Mailbox::send_and_wait`] so a reply can be handed straight to the
//! waiting caller without ever entering the queue.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use crate::config::OverflowPolicy;
use crate::message::Message;
use crate::po::{PoCore, PoError};

pub struct Mailbox {
    po: Weak<PoCore>,
    /// Short name, unique within the owning post office.
    pub name: String,
    /// Fully qualified address, `<po>.<name>`.
    pub address: String,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    waiters: Mutex<HashMap<String, Sender<Message>>>,
    overflow: OverflowPolicy,
}

impl Mailbox {
    pub(crate) fn new(
        po: Weak<PoCore>,
        po_name: &str,
        name: &str,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> Mailbox {
        let (tx, rx) = bounded(capacity);
        Mailbox {
            po,
            name: name.to_string(),
            address: format!("{po_name}.{name}"),
            tx,
            rx,
            waiters: Mutex::new(HashMap::new()),
            overflow,
        }
    }

    fn po(&self) -> Result<std::sync::Arc<PoCore>, PoError> {
        self.po.upgrade().ok_or(PoError::Terminated)
    }

    /// Create a direct message to `to` (short or fully qualified address).
    pub fn create_direct(
        &self,
        to: &str,
        kind: Option<&str>,
        expect_reply: bool,
    ) -> Result<Message, PoError> {
        let po = self.po()?;
        let to = po.ensure_fq(to);
        Ok(Message::direct(
            &to,
            kind,
            expect_reply,
            &self.address,
            &po.next_id(),
        )?)
    }

    /// Create a reply to `original`; `from` and `to` are derived from it.
    pub fn create_reply(&self, original: &Message, kind: Option<&str>) -> Result<Message, PoError> {
        let po = self.po()?;
        Ok(Message::reply_to(original, kind, &po.next_id())?)
    }

    /// Create a publish message of the given type (`major` or
    /// `major.minor`).
    pub fn create_publish(&self, kind: &str) -> Result<Message, PoError> {
        let po = self.po()?;
        Ok(Message::publish(kind, &self.address, &po.next_id())?)
    }

    /// Send a message, direct or publish, local or foreign. Non-blocking;
    /// there is no delivery acknowledgement.
    pub fn send(&self, message: Message) {
        match self.po.upgrade() {
            Some(po) => po.route(message),
            None => tracing::warn!(mailbox = %self.address, "send after post office shutdown"),
        }
    }

    /// Send a message and wait up to `deadline` for a reply to it. Returns
    /// `None` on timeout. Replies arriving after the timeout fall through
    /// to the receive queue.
    pub fn send_and_wait(&self, message: Message, deadline: Duration) -> Option<Message> {
        let id = message.id.clone();
        let (reply_tx, reply_rx) = bounded(1);
        self.waiters
            .lock()
            .expect("waiter registry poisoned")
            .insert(id.clone(), reply_tx);

        self.send(message);
        let reply = reply_rx.recv_timeout(deadline).ok();

        self.waiters
            .lock()
            .expect("waiter registry poisoned")
            .remove(&id);
        reply
    }

    /// Accept a message into this mailbox. Replies with a registered waiter
    /// go to the waiter and never enter the queue; extra replies to an
    /// already-resolved id are discarded.
    pub(crate) fn receive(&self, message: Message) {
        if let Some(reply) = message.reply.as_deref() {
            let waiters = self.waiters.lock().expect("waiter registry poisoned");
            if let Some(waiter) = waiters.get(reply) {
                let _ = waiter.try_send(message);
                return;
            }
        }
        self.enqueue(message);
    }

    fn enqueue(&self, message: Message) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => match self.overflow {
                OverflowPolicy::DropNewest => {
                    tracing::warn!(
                        mailbox = %self.address,
                        id = %message.id,
                        "receive queue full, dropping message"
                    );
                }
                OverflowPolicy::DropOldest => {
                    let _ = self.rx.try_recv();
                    if let Err(err) = self.tx.try_send(message) {
                        if let TrySendError::Full(message) = err {
                            tracing::warn!(
                                mailbox = %self.address,
                                id = %message.id,
                                "receive queue full, dropping message"
                            );
                        }
                    }
                }
            },
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Remove and return the oldest queued message, blocking until one is
    /// available. Returns `None` only after the mailbox is torn down.
    pub fn take(&self) -> Option<Message> {
        self.rx.recv().ok()
    }

    /// Remove and return the oldest queued message, waiting up to
    /// `timeout`.
    pub fn poll(&self, timeout: Duration) -> Option<Message> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Remove and return the oldest queued message without waiting.
    pub fn try_take(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Subscribe this mailbox to publishes from `source` (short or fully
    /// qualified) with the given type.
    pub fn subscribe(&self, source: &str, kind: &str) -> Result<(), PoError> {
        let po = self.po()?;
        let this = po.arc_of(&self.name).ok_or(PoError::Terminated)?;
        po.man_sub(true, &this, source, kind);
        Ok(())
    }

    /// Undo a matching [`Mailbox::subscribe`].
    pub fn unsubscribe(&self, source: &str, kind: &str) -> Result<(), PoError> {
        let po = self.po()?;
        let this = po.arc_of(&self.name).ok_or(PoError::Terminated)?;
        po.man_sub(false, &this, source, kind);
        Ok(())
    }

    /// Encrypt the named fields of `message` with the post office secret.
    pub fn encrypt(&self, message: &mut Message, fields: &[&str]) -> Result<(), PoError> {
        let po = self.po()?;
        message.encrypt(po.secret(), fields)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bare_mailbox(capacity: usize, overflow: OverflowPolicy) -> Mailbox {
        // a mailbox with no live post office: enough for queue semantics
        Mailbox::new(Weak::new(), "alpha", "io", capacity, overflow)
    }

    fn message(id: &str, reply: Option<&str>) -> Message {
        Message::new("beta.io", Some("alpha.io"), Some("t"), id, reply, false).unwrap()
    }

    #[test]
    fn replies_go_to_waiters_not_the_queue() {
        let mailbox = Arc::new(bare_mailbox(4, OverflowPolicy::DropNewest));
        let (tx, rx) = bounded(1);
        mailbox
            .waiters
            .lock()
            .unwrap()
            .insert("42.alpha".into(), tx);

        mailbox.receive(message("1.beta", Some("42.alpha")));
        assert!(mailbox.is_empty());
        assert_eq!(rx.try_recv().unwrap().id, "1.beta");

        // second reply to the same id is silently discarded
        mailbox.receive(message("2.beta", Some("42.alpha")));
        assert!(mailbox.is_empty());

        // a reply with no waiter falls through to the queue
        mailbox.receive(message("3.beta", Some("99.alpha")));
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn drop_newest_keeps_the_oldest_messages() {
        let mailbox = bare_mailbox(2, OverflowPolicy::DropNewest);
        mailbox.receive(message("1.beta", None));
        mailbox.receive(message("2.beta", None));
        mailbox.receive(message("3.beta", None));

        assert_eq!(mailbox.try_take().unwrap().id, "1.beta");
        assert_eq!(mailbox.try_take().unwrap().id, "2.beta");
        assert!(mailbox.try_take().is_none());
    }

    #[test]
    fn drop_oldest_keeps_the_newest_messages() {
        let mailbox = bare_mailbox(2, OverflowPolicy::DropOldest);
        mailbox.receive(message("1.beta", None));
        mailbox.receive(message("2.beta", None));
        mailbox.receive(message("3.beta", None));

        assert_eq!(mailbox.try_take().unwrap().id, "2.beta");
        assert_eq!(mailbox.try_take().unwrap().id, "3.beta");
    }

    #[test]
    fn poll_times_out_on_an_empty_queue() {
        let mailbox = bare_mailbox(2, OverflowPolicy::DropNewest);
        assert!(mailbox.poll(Duration::from_millis(10)).is_none());
    }
}
