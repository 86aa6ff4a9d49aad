//! Background task that fires demonstration timers.
//!
//! The controller itself never sleeps. This task waits until the
//! controller's next deadline and polls it, or wakes early when a handler
//! changed the session and signalled `wake`.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::debug;

use crate::session::SessionController;

/// The current instant on tokio's clock.
///
/// Handlers pass this to the controller so a paused test clock drives the
/// same timeline the driver sleeps on.
#[must_use]
pub fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Spawns the driver loop.
///
/// Callers must use `wake.notify_one()` after every change that can move
/// the deadline. A notification sent while the driver is busy is kept and
/// consumed on its next wait.
pub fn spawn_demo_driver(
    controller: Arc<Mutex<SessionController>>,
    wake: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let deadline = controller.lock().await.next_deadline();
            match deadline {
                Some(due) => {
                    tokio::select! {
                        () = sleep_until(tokio::time::Instant::from_std(due)) => {
                            let events = controller.lock().await.poll(now());
                            debug!(events = events.len(), "Demo timer fired");
                        }
                        () = wake.notified() => {}
                    }
                }
                None => wake.notified().await,
            }
        }
    })
}
