//! Periodic sweep that fails `running` forecasts whose worker disappeared.
//!
//! Off unless a threshold is configured.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::forecast_store::ForecastStore;

/// Every `interval`, fail records whose lease lapsed more than `stale_after` ago.
///
/// Stops when `shutdown` flips to `true` or its sender is dropped.
pub fn spawn_sweeper(
    store: Arc<dyn ForecastStore>,
    stale_after: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(stale_after_secs = stale_after.as_secs(), "stale forecast sweeper started");
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            match store.sweep_stale_running(stale_after).await {
                Ok(ids) => {
                    for id in ids {
                        warn!(forecast_id = %id, "failed stale running forecast");
                    }
                }
                Err(e) => error!(error = %e, "stale forecast sweep failed"),
            }
        }

        info!("stale forecast sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast_store::InMemoryForecastStore;
    use farmflow_core::GroupId;
    use farmflow_forecast::{ForecastKind, ForecastStatus, LeaseToken, NewForecast};

    #[tokio::test]
    async fn sweeper_fails_abandoned_running_records() {
        let store = InMemoryForecastStore::arc();
        let record = store
            .create(NewForecast {
                group_id: GroupId::new(),
                kind: ForecastKind::EggProduction,
                model_name: "default-model".to_string(),
                input_json: serde_json::json!({ "horizonDays": 30 }),
            })
            .await
            .unwrap();
        store
            .transition_to_running(record.id, &LeaseToken::new("crashed#1"), Duration::ZERO)
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let task = spawn_sweeper(store.clone(), Duration::ZERO, Duration::from_millis(10), rx);

        let mut status = ForecastStatus::Running;
        for _ in 0..100 {
            status = store.get(record.id).await.unwrap().unwrap().status;
            if status == ForecastStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ForecastStatus::Failed);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
