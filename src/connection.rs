//! Surface side of a long-lived connection: subscribe on mount, pump
//! notifications into a handler, tear down on every exit path.

use crate::background::BackgroundHandle;
use crate::error::{PauseError, PauseResult};
use crate::transport::{Notification, NotifierEvent};
use scopeguard::guard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Open connection guard. Dropping it closes the connection; `close()`
/// does the same and reports how the pump ended.
pub struct LongLivedConnection {
    surface: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<PauseResult<()>>>,
    closed: Arc<AtomicBool>,
}

impl LongLivedConnection {
    /// Connect `surface` to the background and subscribe it to `events`.
    /// A notification of a type the surface cannot decode ends the pump with
    /// a protocol error.
    pub fn open<F>(
        handle: &BackgroundHandle,
        surface: &str,
        events: &[NotifierEvent],
        mut on_message: F,
    ) -> PauseResult<Self>
    where
        F: FnMut(Notification) + Send + 'static,
    {
        let mut port = handle.subscribe(surface, events)?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let closed = Arc::new(AtomicBool::new(false));

        let closed_flag = closed.clone();
        let name = surface.to_string();
        let task = tokio::spawn(async move {
            let _closed = guard((), |_| {
                closed_flag.store(true, Ordering::Release);
            });
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("[CONNECTION] '{}' closed by surface", name);
                        return Ok(());
                    }
                    envelope = port.recv() => {
                        let envelope = match envelope {
                            Some(envelope) => envelope,
                            None => {
                                info!("[CONNECTION] '{}': background went away", name);
                                return Err(PauseError::Disconnected);
                            }
                        };
                        let notification = Notification::from_envelope(&envelope).map_err(|e| {
                            error!("[CONNECTION] '{}': {}", name, e);
                            e
                        })?;
                        on_message(notification);
                    }
                }
            }
        });

        info!("[CONNECTION] '{}' opened for {:?}", surface, events);
        Ok(Self {
            surface: surface.to_string(),
            shutdown: Some(shutdown_tx),
            task: Some(task),
            closed,
        })
    }

    pub fn surface(&self) -> &str {
        &self.surface
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection and return how the pump ended
    pub async fn close(mut self) -> PauseResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}

impl Drop for LongLivedConnection {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
