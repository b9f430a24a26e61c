//! Schedule sweep: fires due entries, sleeping until the next trigger or the
//! sweep interval, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::Inner;

pub(super) async fn sweep_loop(inner: Arc<Inner>) {
    let interval = inner.config.sweep_interval();
    loop {
        let changed = inner.schedules_changed.notified();
        inner.fire_due(Utc::now());
        let wait = match inner.scheduler.next_trigger() {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(interval),
            None => interval,
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = changed => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }
    tracing::debug!("schedule sweep stopped");
}
