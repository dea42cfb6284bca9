use super::{ClimateEntity, ClimateState};
use crate::device::Rpc;
use futures::{Stream, StreamExt as _};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tracing::trace;

pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// The entity state after a refresh that changed something the host can see.
#[derive(Clone, Debug, serde::Serialize)]
pub struct StateChange {
    /// Names of the top-level state fields that differ from the previous refresh.
    pub changed: Vec<String>,
    pub state: ClimateState,
}

/// Produces a stream that refreshes the entity every `period` and yields its state whenever it
/// changes. The first refresh happens immediately and is always reported.
pub fn poll<R: Rpc>(
    entity: &mut ClimateEntity<R>,
    period: Duration,
) -> impl Stream<Item = StateChange> + '_ {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(interval);
    async_stream::stream! {
        let mut previous: Option<serde_json::Value> = None;
        while ticks.next().await.is_some() {
            entity.update().await;
            let state = entity.snapshot();
            let current = match serde_json::to_value(&state) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let changed = changed_fields(previous.as_ref(), &current);
            trace!(message = "refreshed", changed = changed.len());
            previous = Some(current);
            if !changed.is_empty() {
                yield StateChange { changed, state };
            }
        }
    }
}

fn changed_fields(previous: Option<&serde_json::Value>, current: &serde_json::Value) -> Vec<String> {
    let Some(current) = current.as_object() else {
        return Vec::new();
    };
    let previous = previous.and_then(serde_json::Value::as_object);
    current
        .iter()
        .filter(|(key, value)| previous.and_then(|p| p.get(*key)) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect()
}
