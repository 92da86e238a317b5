// =============================================================================
// Control plane — shared state snapshot and the command consumer
// =============================================================================
//
// Workers never query the database on the hot path: they read an atomic
// pointer to the latest `ControlState`, refreshed by the command consumer
// after every poll. The consumer claims NEW commands (at-least-once; claiming
// is idempotent through the conditional update), applies their semantic
// effect through the audited config path, and downgrades failures to ERROR.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::db::control::{config_keys, CommandRow};
use crate::db::Database;
use crate::notify::{system_alert, Notifier};
use crate::types::reason;

/// Consolidated view of the mutable control flags, read lock-free by every
/// worker between database refreshes.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub halt_trading: bool,
    pub emergency_exit: bool,
    pub feature_version: i64,
    pub ai_model_impl: Option<String>,
}

impl ControlState {
    pub fn initial(feature_version: i64) -> Self {
        Self {
            halt_trading: false,
            emergency_exit: false,
            feature_version,
            ai_model_impl: None,
        }
    }
}

/// Atomic pointer to the current control state.
pub struct ControlHandle {
    inner: ArcSwap<ControlState>,
    default_feature_version: i64,
}

impl ControlHandle {
    pub fn new(initial: ControlState) -> Arc<Self> {
        let default_feature_version = initial.feature_version;
        Arc::new(Self {
            inner: ArcSwap::from_pointee(initial),
            default_feature_version,
        })
    }

    pub fn load(&self) -> Arc<ControlState> {
        self.inner.load_full()
    }

    pub fn store(&self, state: ControlState) {
        self.inner.store(Arc::new(state));
    }

    /// Re-read the control keys from the database and publish the snapshot.
    pub async fn refresh(&self, db: &Database) -> Result<Arc<ControlState>> {
        let halt_trading = db.get_config_flag(config_keys::HALT_TRADING).await?;
        let emergency_exit = db.get_config_flag(config_keys::EMERGENCY_EXIT).await?;
        let feature_version = db
            .get_config(config_keys::FEATURE_VERSION)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.default_feature_version);
        let ai_model_impl = db.get_config(config_keys::AI_MODEL_IMPL).await?;

        let state = ControlState {
            halt_trading,
            emergency_exit,
            feature_version,
            ai_model_impl,
        };
        self.store(state);
        Ok(self.load())
    }
}

// =============================================================================
// Command consumer
// =============================================================================

pub struct ControlConsumer {
    db: Database,
    handle: Arc<ControlHandle>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl ControlConsumer {
    pub fn new(
        db: Database,
        handle: Arc<ControlHandle>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            handle,
            notifier,
            clock,
            poll_interval,
        }
    }

    /// Poll the command queue forever.
    pub async fn run(self) {
        info!(poll_seconds = self.poll_interval.as_secs(), "control command consumer started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "control poll failed");
            }
        }
    }

    /// Drain NEW commands, then refresh the shared snapshot.
    pub async fn poll_once(&self) -> Result<()> {
        while let Some(cmd) = self.db.claim_next_new_command(self.clock.now_ms()).await? {
            info!(
                id = cmd.id,
                command = %cmd.command,
                actor = %cmd.actor,
                trace_id = %cmd.trace_id,
                "control command claimed"
            );
            if let Err(e) = self.apply(&cmd).await {
                warn!(id = cmd.id, command = %cmd.command, error = %e, "control command failed");
                self.db
                    .mark_command_error(cmd.id, &e.to_string(), self.clock.now_ms())
                    .await?;
            }
        }

        self.handle.refresh(&self.db).await?;
        Ok(())
    }

    async fn apply(&self, cmd: &CommandRow) -> Result<()> {
        let reason_code = cmd.reason_code.as_deref().unwrap_or(reason::MANUAL_CONFIG);
        let cmd_reason = cmd
            .reason
            .clone()
            .unwrap_or_else(|| format!("operator command {}", cmd.command));

        match cmd.command.as_str() {
            "HALT" => {
                self.write_flag(config_keys::HALT_TRADING, "true", cmd, reason_code, &cmd_reason)
                    .await?;
            }
            "RESUME" => {
                self.write_flag(config_keys::HALT_TRADING, "false", cmd, reason_code, &cmd_reason)
                    .await?;
                // A resume also stands down any stale emergency flag.
                self.write_flag(config_keys::EMERGENCY_EXIT, "false", cmd, reason_code, &cmd_reason)
                    .await?;
            }
            "EMERGENCY" | "EMERGENCY_EXIT" => {
                self.write_flag(
                    config_keys::HALT_TRADING,
                    "true",
                    cmd,
                    reason::EMERGENCY_EXIT,
                    &cmd_reason,
                )
                .await?;
                self.write_flag(
                    config_keys::EMERGENCY_EXIT,
                    "true",
                    cmd,
                    reason::EMERGENCY_EXIT,
                    &cmd_reason,
                )
                .await?;
                system_alert(
                    &self.notifier,
                    &self.clock,
                    reason::EMERGENCY_EXIT,
                    &cmd.trace_id,
                    &[("actor", cmd.actor.as_str()), ("halt_trading", "true")],
                )
                .await;
            }
            "CONFIG" => {
                let payload = cmd
                    .payload
                    .as_deref()
                    .context("CONFIG command missing payload")?;
                let parsed: serde_json::Value =
                    serde_json::from_str(payload).context("CONFIG payload is not valid JSON")?;
                let key = parsed
                    .get("key")
                    .and_then(|k| k.as_str())
                    .context("CONFIG payload missing 'key'")?;
                let value = parsed
                    .get("value")
                    .and_then(|v| v.as_str())
                    .context("CONFIG payload missing 'value'")?;
                self.write_flag(key, value, cmd, reason_code, &cmd_reason).await?;
            }
            other => bail!("unknown control command: {other}"),
        }
        Ok(())
    }

    async fn write_flag(
        &self,
        key: &str,
        value: &str,
        cmd: &CommandRow,
        reason_code: &str,
        cmd_reason: &str,
    ) -> Result<()> {
        self.db
            .write_system_config(
                key,
                value,
                &cmd.actor,
                &cmd.trace_id,
                reason_code,
                cmd_reason,
                self.clock.now_ms(),
            )
            .await
    }
}
