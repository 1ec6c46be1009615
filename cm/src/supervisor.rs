//! Supervisor: owns component start/stop order and guarantees
//! reverse-order shutdown. `main.rs` constructs components leaves-first (A
//! Store, B IAM, C Cloud Transport, D SM Channels, E Image Service, F
//! Storage/State Supervisor, G Network Manager, H Reconciler, I Monitor)
//! and registers one stop closure per started component as it goes; a
//! construction failure partway through unwinds whatever was already
//! registered before propagating the error.
//!
//! Explicit, owned stop closures stand in for a global cleanup-manager
//! singleton, so ordering is visible at the call site instead of implicit
//! in registration order on some shared object.

use std::future::Future;
use std::pin::Pin;

use tracing::{error, info};

type StopFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct StopEntry {
    name: String,
    run: Box<dyn FnOnce() -> StopFuture + Send>,
}

#[derive(Default)]
pub struct Supervisor {
    stack: Vec<StopEntry>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`'s stop action. Stop actions run in reverse
    /// registration order, i.e. the last component started is the first
    /// stopped. `name` takes anything `Into<String>` so a
    /// per-SM-channel caller can format a unique label at runtime.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, stop: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stack.push(StopEntry {
            name: name.into(),
            run: Box::new(move || Box::pin(stop())),
        });
    }

    /// Runs every registered stop closure in reverse order. Each closure's
    /// own errors are expected to be logged internally before it returns;
    /// this loop itself never short-circuits.
    pub async fn shutdown(&mut self) {
        while let Some(entry) = self.stack.pop() {
            info!(component = %entry.name, "stopping");
            (entry.run)().await;
        }
    }

    /// Unwinds everything registered so far, used when a later component's
    /// construction fails during startup.
    pub async fn unwind(&mut self) {
        error!("startup failed, unwinding already-started components");
        self.shutdown().await;
    }
}
