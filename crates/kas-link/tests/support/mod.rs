//! Test doubles for the framed-transport collaborator
//!
//! `FakeHub` stands in for the external codec: every tunnel accept produces
//! a scripted in-memory transport the test can feed and observe. The helper
//! executable is replaced by a tiny shell script that dials the tunnel's
//! loopback listener and then idles, exercising the real process contract.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use kas_wire::{FrameTransport, TransportError, TransportFactory, WireMessage};

/// Install a test subscriber once so `RUST_LOG` surfaces worker traces.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write an executable stand-in for the tunnel helper.
///
/// It receives the contract's positional arguments, connects back to the
/// listen address, and idles until the tunnel kills it.
pub fn write_helper_script(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-helper.sh");
    std::fs::write(
        &path,
        "#!/usr/bin/env bash\nexec 3<>\"/dev/tcp/$1/$2\" || exit 1\nsleep 300\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll until `condition` holds, panicking after a few seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[derive(Default)]
struct FakeInner {
    inbound: VecDeque<WireMessage>,
    completed: Option<WireMessage>,
    receiving: bool,
    outgoing: Option<WireMessage>,
    sent: Vec<WireMessage>,
    stall_sends: bool,
    fail_next_pump: bool,
}

/// Shared state of one scripted transport
#[derive(Default)]
pub struct FakeState {
    inner: Mutex<FakeInner>,
    activity: Notify,
}

impl FakeState {
    /// Queue an inbound message and wake the worker's readiness wait.
    pub fn push_inbound(&self, msg: WireMessage) {
        self.inner.lock().unwrap().inbound.push_back(msg);
        self.activity.notify_one();
    }

    /// Everything the worker has transmitted so far, in order.
    pub fn sent(&self) -> Vec<WireMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Messages queued inbound but not yet pumped.
    pub fn inbound_len(&self) -> usize {
        self.inner.lock().unwrap().inbound.len()
    }

    /// Whether an outbound message is stuck in flight.
    pub fn in_flight(&self) -> bool {
        self.inner.lock().unwrap().outgoing.is_some()
    }

    /// Hold started sends in flight instead of completing them.
    pub fn set_stall_sends(&self, stall: bool) {
        self.inner.lock().unwrap().stall_sends = stall;
        self.activity.notify_one();
    }

    /// Make the next pump fail, as a peer reset would.
    pub fn fail_next_pump(&self) {
        self.inner.lock().unwrap().fail_next_pump = true;
        self.activity.notify_one();
    }

    /// Wait until at least `n` messages have been transmitted.
    pub async fn wait_sent(&self, n: usize) {
        wait_until("sent messages", || {
            self.inner.lock().unwrap().sent.len() >= n
        })
        .await;
    }
}

struct FakeTransport {
    state: Arc<FakeState>,
}

#[async_trait]
impl FrameTransport for FakeTransport {
    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        loop {
            let notified = self.state.activity.notified();
            {
                let inner = self.state.inner.lock().unwrap();
                let mut ready = Ready::EMPTY;
                if interest.is_writable() && !(inner.stall_sends && inner.outgoing.is_some()) {
                    ready |= Ready::WRITABLE;
                }
                if interest.is_readable()
                    && (inner.completed.is_some()
                        || !inner.inbound.is_empty()
                        || inner.fail_next_pump)
                {
                    ready |= Ready::READABLE;
                }
                if !ready.is_empty() {
                    return Ok(ready);
                }
            }
            notified.await;
        }
    }

    fn begin_receive(&mut self) {
        self.state.inner.lock().unwrap().receiving = true;
    }

    fn pump_transfer(&mut self) -> Result<(), TransportError> {
        let mut inner = self.state.inner.lock().unwrap();
        if inner.fail_next_pump {
            inner.fail_next_pump = false;
            return Err(TransportError::Closed);
        }
        if !inner.stall_sends {
            if let Some(msg) = inner.outgoing.take() {
                inner.sent.push(msg);
            }
        }
        if inner.receiving && inner.completed.is_none() {
            if let Some(msg) = inner.inbound.pop_front() {
                inner.completed = Some(msg);
                inner.receiving = false;
            }
        }
        Ok(())
    }

    fn send(&mut self, msg: WireMessage) -> Result<(), TransportError> {
        let mut inner = self.state.inner.lock().unwrap();
        if inner.outgoing.is_some() {
            return Err(TransportError::Busy);
        }
        inner.outgoing = Some(msg);
        Ok(())
    }

    fn is_sending(&self) -> bool {
        self.state.inner.lock().unwrap().outgoing.is_some()
    }

    fn is_receiving(&self) -> bool {
        self.state.inner.lock().unwrap().receiving
    }

    fn receive_complete(&self) -> bool {
        self.state.inner.lock().unwrap().completed.is_some()
    }

    fn take_received(&mut self) -> Option<WireMessage> {
        self.state.inner.lock().unwrap().completed.take()
    }
}

/// Hands out scripted transports in tunnel-accept order
#[derive(Default)]
pub struct FakeHub {
    transports: Mutex<Vec<Arc<FakeState>>>,
}

impl FakeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The `index`-th transport the worker opened, waiting for it to exist.
    pub async fn transport(self: &Arc<Self>, index: usize) -> Arc<FakeState> {
        let hub = Arc::clone(self);
        wait_until("transport to open", move || {
            hub.transports.lock().unwrap().len() > index
        })
        .await;
        self.transports.lock().unwrap()[index].clone()
    }
}

impl TransportFactory for FakeHub {
    fn open(&self, _stream: TcpStream) -> Box<dyn FrameTransport> {
        let state = Arc::new(FakeState::default());
        self.transports.lock().unwrap().push(Arc::clone(&state));
        Box::new(FakeTransport { state })
    }
}
