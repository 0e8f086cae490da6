//! In-process broker transport.
//!
//! Several bridges in one process (tests, or daemons sharing a runtime) can
//! talk through a [`MemoryHub`]. Taking the hub offline drops every
//! connection and refuses new ones, which is how partitions are simulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::broker::BrokerCore;
use super::transport::{Publish, RelayConnection, RelayError, RelayTransport};

#[derive(Clone, Default)]
pub struct MemoryHub {
    core: Arc<BrokerCore>,
    offline: Arc<AtomicBool>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { hub: self.clone() }
    }

    /// Going offline drops all current connections.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
        if !online {
            self.core.detach_all();
        }
    }

    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    pub fn core(&self) -> &BrokerCore {
        &self.core
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn connect(&self, will: Option<Publish>) -> Result<Box<dyn RelayConnection>, RelayError> {
        if !self.hub.is_online() {
            return Err(RelayError::Unreachable("memory hub offline".to_string()));
        }
        let (id, rx) = self.hub.core.attach(will);
        Ok(Box::new(MemoryConnection {
            hub: self.hub.clone(),
            id,
            rx,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryConnection {
    hub: MemoryHub,
    id: u64,
    rx: mpsc::Receiver<Publish>,
    closed: bool,
}

impl MemoryConnection {
    fn check(&self) -> Result<(), RelayError> {
        if self.closed || !self.hub.is_online() {
            Err(RelayError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RelayConnection for MemoryConnection {
    async fn subscribe(&mut self, pattern: &str) -> Result<(), RelayError> {
        self.check()?;
        self.hub.core.subscribe(self.id, pattern)
    }

    async fn publish(&mut self, message: Publish) -> Result<(), RelayError> {
        self.check()?;
        self.hub.core.publish(self.id, message)
    }

    async fn ping(&mut self) -> Result<(), RelayError> {
        self.check()?;
        if self.hub.core.is_attached(self.id) {
            Ok(())
        } else {
            Err(RelayError::Closed)
        }
    }

    async fn recv(&mut self) -> Option<Publish> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        self.closed = true;
        self.hub.core.detach(self.id, true);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.hub.core.detach(self.id, false);
        }
    }
}
