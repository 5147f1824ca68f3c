//! Cross-thread mailbox between the connection worker and the consumer
//!
//! The broker is the only synchronized state in the core. Both sides hold an
//! `Arc<Broker>` injected at construction; critical sections are list
//! appends and never perform I/O under the lock. Each direction carries a
//! control stream and a data stream, with at most one pending wake-up per
//! side at any time.
//!
//! Inbound backpressure ("quench") is computed from the mailbox counters:
//! bursts below the batch size flow freely, sustained delivery is paced to
//! one message per configured delay, and a hard cap on undelivered messages
//! pauses inbound reads entirely until the consumer drains.

use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::Notify;

use kas_wire::ProtocolMessage;

use crate::config::QuenchConfig;
use crate::error::{BrokerError, LinkError};
use crate::server_id::ServerId;

/// Consumer-to-worker control requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    /// Establish a connection to the server
    Connect(ServerId),
    /// Tear the connection down, discarding queued outbound messages
    Disconnect(ServerId),
}

/// Worker-to-consumer control notices
#[derive(Debug)]
pub enum LinkNotice {
    /// Role negotiation completed
    Connected {
        /// Server that connected
        server: ServerId,
        /// Negotiated minor protocol version
        minor_version: u16,
    },
    /// The connection is gone
    Disconnected {
        /// Server that disconnected
        server: ServerId,
        /// Failure cause, absent for requested disconnects
        error: Option<LinkError>,
        /// True when the connection never completed role negotiation;
        /// feeds the reconnect backoff policy
        during_connect: bool,
    },
}

/// Inbound-delivery backpressure state, recomputed on every mailbox pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quench {
    /// Deliver freely
    None,
    /// Pause inbound reads until the deadline
    Until(Instant),
    /// Pause inbound reads until the consumer drains below the hard cap
    Indefinite,
}

/// Everything the worker takes from one mailbox drain
pub struct WorkerIntake {
    /// Pending connect/disconnect requests, in submission order
    pub requests: Vec<LinkRequest>,
    /// Pending outbound messages, in submission order
    pub sends: Vec<(ServerId, ProtocolMessage)>,
    /// Fresh quench state
    pub quench: Quench,
    /// The consumer closed the mailbox; the worker should exit
    pub closed: bool,
}

struct Mailbox {
    to_worker_requests: Vec<LinkRequest>,
    to_worker_sends: Vec<(ServerId, ProtocolMessage)>,
    to_consumer_notices: Vec<LinkNotice>,
    to_consumer_data: Vec<(ServerId, ProtocolMessage)>,
    worker_wake_posted: bool,
    consumer_wake_posted: bool,
    batch_count: u64,
    batch_start: Option<Instant>,
    closed: bool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            to_worker_requests: Vec::new(),
            to_worker_sends: Vec::new(),
            to_consumer_notices: Vec::new(),
            to_consumer_data: Vec::new(),
            worker_wake_posted: false,
            consumer_wake_posted: false,
            batch_count: 0,
            batch_start: None,
            closed: false,
        }
    }

    fn undelivered(&self) -> usize {
        self.to_consumer_notices.len() + self.to_consumer_data.len()
    }

    fn compute_quench(&mut self, limits: &QuenchConfig) -> Quench {
        if self.undelivered() >= limits.hard_cap {
            return Quench::Indefinite;
        }
        if self.batch_count < limits.batch_size {
            return Quench::None;
        }
        let Some(start) = self.batch_start else {
            return Quench::None;
        };
        let count = self.batch_count.min(u32::MAX as u64) as u32;
        let deadline = start + limits.per_message_delay * count;
        if deadline <= Instant::now() {
            self.batch_count = 0;
            self.batch_start = None;
            Quench::None
        } else {
            Quench::Until(deadline)
        }
    }
}

/// The shared mailbox. One per worker, injected into both sides.
pub struct Broker {
    mailbox: Mutex<Mailbox>,
    worker_wake: Notify,
    consumer_wake: Notify,
    limits: QuenchConfig,
}

impl Broker {
    /// Create a mailbox with the given backpressure limits
    pub fn new(limits: QuenchConfig) -> Self {
        Self {
            mailbox: Mutex::new(Mailbox::new()),
            worker_wake: Notify::new(),
            consumer_wake: Notify::new(),
            limits,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Mailbox>, BrokerError> {
        self.mailbox.lock().map_err(|_| BrokerError::Poisoned)
    }

    /// Ask the worker to connect to `server`.
    pub fn request_connect(&self, server: ServerId) -> Result<(), BrokerError> {
        self.push_request(LinkRequest::Connect(server))
    }

    /// Ask the worker to disconnect from `server`.
    pub fn request_disconnect(&self, server: ServerId) -> Result<(), BrokerError> {
        self.push_request(LinkRequest::Disconnect(server))
    }

    fn push_request(&self, request: LinkRequest) -> Result<(), BrokerError> {
        let mut mailbox = self.lock()?;
        mailbox.to_worker_requests.push(request);
        let wake = !mailbox.worker_wake_posted;
        mailbox.worker_wake_posted = true;
        drop(mailbox);
        if wake {
            self.worker_wake.notify_one();
        }
        Ok(())
    }

    /// Queue an outbound message for `server`.
    ///
    /// Silently dropped by the worker if the server is not connected.
    pub fn send_message(
        &self,
        server: ServerId,
        msg: ProtocolMessage,
    ) -> Result<(), BrokerError> {
        let mut mailbox = self.lock()?;
        mailbox.to_worker_sends.push((server, msg));
        let wake = !mailbox.worker_wake_posted;
        mailbox.worker_wake_posted = true;
        drop(mailbox);
        if wake {
            self.worker_wake.notify_one();
        }
        Ok(())
    }

    /// Worker-side: take everything the consumer queued and recompute the
    /// quench state.
    pub fn drain_for_worker(&self) -> Result<WorkerIntake, BrokerError> {
        let mut mailbox = self.lock()?;
        mailbox.worker_wake_posted = false;
        let requests = std::mem::take(&mut mailbox.to_worker_requests);
        let sends = std::mem::take(&mut mailbox.to_worker_sends);
        let quench = mailbox.compute_quench(&self.limits);
        let closed = mailbox.closed;
        Ok(WorkerIntake {
            requests,
            sends,
            quench,
            closed,
        })
    }

    /// Worker-side: hand notices and data to the consumer, waking it at
    /// most once, and return the fresh quench state.
    pub fn deliver_from_worker(
        &self,
        notices: Vec<LinkNotice>,
        data: Vec<(ServerId, ProtocolMessage)>,
    ) -> Result<Quench, BrokerError> {
        let mut mailbox = self.lock()?;
        let delivered = (notices.len() + data.len()) as u64;
        mailbox.to_consumer_notices.extend(notices);
        mailbox.to_consumer_data.extend(data);
        let mut wake = false;
        if delivered > 0 {
            if mailbox.batch_start.is_none() {
                mailbox.batch_start = Some(Instant::now());
            }
            mailbox.batch_count += delivered;
            wake = !mailbox.consumer_wake_posted;
            mailbox.consumer_wake_posted = true;
        }
        let quench = mailbox.compute_quench(&self.limits);
        drop(mailbox);
        if wake {
            self.consumer_wake.notify_one();
        }
        Ok(quench)
    }

    /// Consumer-side: take all pending notices and data.
    ///
    /// Control notices are returned separately from data and should be
    /// processed first; a connection's `Connected` notice never trails its
    /// data. Draining from a mailbox that had hit the hard cap wakes the
    /// worker, since the drain may lift the quench.
    #[allow(clippy::type_complexity)]
    pub fn drain_for_consumer(
        &self,
    ) -> Result<(Vec<LinkNotice>, Vec<(ServerId, ProtocolMessage)>), BrokerError> {
        let mut mailbox = self.lock()?;
        let was_at_cap = mailbox.undelivered() >= self.limits.hard_cap;
        mailbox.consumer_wake_posted = false;
        let notices = std::mem::take(&mut mailbox.to_consumer_notices);
        let data = std::mem::take(&mut mailbox.to_consumer_data);
        let mut wake = false;
        if was_at_cap {
            wake = !mailbox.worker_wake_posted;
            mailbox.worker_wake_posted = true;
        }
        drop(mailbox);
        if wake {
            self.worker_wake.notify_one();
        }
        Ok((notices, data))
    }

    /// Wait for the next worker wake-up.
    pub async fn worker_notified(&self) {
        self.worker_wake.notified().await;
    }

    /// Wait for the next consumer wake-up.
    pub async fn consumer_notified(&self) {
        self.consumer_wake.notified().await;
    }

    /// Close the mailbox: the worker exits cleanly on its next drain.
    pub fn close(&self) -> Result<(), BrokerError> {
        let mut mailbox = self.lock()?;
        mailbox.closed = true;
        drop(mailbox);
        self.worker_wake.notify_one();
        self.consumer_wake.notify_one();
        Ok(())
    }

    #[cfg(test)]
    fn worker_wake_posted(&self) -> bool {
        self.lock().unwrap().worker_wake_posted
    }

    #[cfg(test)]
    fn consumer_wake_posted(&self) -> bool {
        self.lock().unwrap().consumer_wake_posted
    }
}
