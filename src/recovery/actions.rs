//! Applying mitigation actions
//!
//! Actions run in declared order against the execution's settings
//! handle, the failing lease's browser context, and the pool. They never
//! touch queue state: whether the URL ultimately completes or fails is
//! still decided by the executor's single retry and `ack`.

use std::time::Duration;
use tracing::{info, warn};

use super::rules::ResolvedAction;
use crate::browser::{BrowserContext, BrowserPool};
use crate::executor::SettingsHandle;
use crate::nodes::{CancelToken, NodeError};

/// Apply a solution's actions in order; returns a human-readable log of
/// what was done, for attribution in error messages.
pub async fn apply_actions(
    actions: &[ResolvedAction],
    settings: &SettingsHandle,
    browser: &BrowserContext,
    pool: &BrowserPool,
    cancel: &CancelToken,
) -> Result<Vec<String>, NodeError> {
    let mut applied = Vec::with_capacity(actions.len());

    for action in actions {
        cancel.check()?;
        match action {
            ResolvedAction::Wait { duration_s } => {
                let duration = Duration::from_secs_f64(duration_s.clamp(0.0, 3_600.0));
                info!("recovery: waiting {duration:?} before retry");
                cancel.sleep(duration).await?;
                applied.push(format!("waited {duration_s}s"));
            }
            ResolvedAction::EnableStealth { level } => {
                match browser.apply_stealth(*level).await {
                    Ok(()) => applied.push(format!("enabled stealth {level:?}")),
                    Err(e) => warn!("recovery: stealth injection failed: {e}"),
                }
            }
            ResolvedAction::RotateProxy => match pool.rotate_proxy() {
                Some(proxy) => applied.push(format!("rotated proxy to {proxy}")),
                None => warn!("recovery: rotate_proxy with no proxies configured"),
            },
            ResolvedAction::AdjustTimeout { multiplier } => {
                settings.scale_timeout(*multiplier);
                applied.push(format!("scaled timeouts by {multiplier}"));
            }
            ResolvedAction::ReduceWorkers { count } => {
                settings.set_worker_cap(*count);
                applied.push(format!("reduced workers to {count}"));
            }
            ResolvedAction::AddDelay { ms } => {
                settings.add_rate_delay(*ms);
                applied.push(format!("added {ms}ms request delay"));
            }
            ResolvedAction::PauseExecution => {
                settings.pause();
                applied.push("paused execution".to_string());
            }
            ResolvedAction::ResumeExecution => {
                settings.resume();
                applied.push("resumed execution".to_string());
            }
        }
    }

    Ok(applied)
}
