//! Background convergence of the worker count
//!
//! The observer sleeps on topology changes rather than polling. Whenever the
//! worker count differs from the target and no rescale is running, it calls
//! `auto_scale`.

use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Dispatcher, Inner, Topology};
use crate::error::{DispatchError, Result};

impl Dispatcher {
    /// Start the worker observer
    ///
    /// Runs until the dispatcher is stopped or dropped. Calling this while an
    /// observer is already active does nothing.
    pub fn start_worker_observer(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        let token = {
            let mut state = self.inner.state.lock();
            if state
                .observer
                .as_ref()
                .is_some_and(|token| !token.is_cancelled())
            {
                return Ok(());
            }
            let token = CancellationToken::new();
            state.observer = Some(token.clone());
            token
        };

        let topology = self.inner.topology.subscribe();
        runtime.spawn(observe(Arc::downgrade(&self.inner), topology, token));
        info!("Worker observer started");
        Ok(())
    }

    /// True while an observer task is active
    pub fn has_worker_observer(&self) -> bool {
        self.inner
            .state
            .lock()
            .observer
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

async fn observe(
    inner: Weak<Inner>,
    mut topology: watch::Receiver<Topology>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }

        let diverged = {
            let current = topology.borrow_and_update();
            !current.scaling && current.workers != current.target
        };

        if diverged {
            let Some(shared) = inner.upgrade() else {
                break;
            };
            Dispatcher { inner: shared }.auto_scale().await;
            continue;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            changed = topology.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Worker observer exited");
}
