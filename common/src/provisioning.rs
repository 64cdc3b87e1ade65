use log::{info, warn};
use thiserror::Error;

use crate::{
    config::{DeviceConfig, NodeSettings},
    portal::{PortalError, PortalEvent, PortalForm, PortalMode, PortalSession},
    store::{ConfigBackend, ConfigStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    PortalActive,
    Committing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningTrigger {
    /// Power-on: a saved network credential may satisfy the session silently.
    Boot,
    /// Button pressed during normal operation.
    Button,
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("provisioning portal timed out after {0} ms")]
    PortalTimeout(u64),
    #[error(transparent)]
    PortalUnavailable(#[from] PortalError),
    #[error("provisioning controller is {0:?}")]
    InvalidState(ProvisioningState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub config: DeviceConfig,
    pub durable: bool,
}

/// Drives one portal session at a time. Polled, never blocks.
pub struct ProvisioningController {
    state: ProvisioningState,
    trigger: Option<ProvisioningTrigger>,
    base: DeviceConfig,
    pending: Option<DeviceConfig>,
    started_ms: u64,
    timeout_ms: u64,
    ap_prefix: String,
    ap_passphrase: String,
    failure: Option<ProvisioningError>,
}

impl ProvisioningController {
    pub fn new(settings: &NodeSettings) -> Self {
        Self {
            state: ProvisioningState::Idle,
            trigger: None,
            base: DeviceConfig::default(),
            pending: None,
            started_ms: 0,
            timeout_ms: settings.portal_timeout_ms,
            ap_prefix: settings.ap_prefix.clone(),
            ap_passphrase: settings.ap_passphrase.clone(),
            failure: None,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn trigger(&self) -> Option<ProvisioningTrigger> {
        self.trigger
    }

    pub fn pending(&self) -> Option<&DeviceConfig> {
        self.pending.as_ref()
    }

    /// `Idle -> PortalActive`. The returned session is what the portal
    /// service should bring up.
    pub fn begin(
        &mut self,
        trigger: ProvisioningTrigger,
        current: &DeviceConfig,
        now_ms: u64,
    ) -> Result<PortalSession, ProvisioningError> {
        if self.state != ProvisioningState::Idle {
            return Err(ProvisioningError::InvalidState(self.state));
        }

        let mode = match trigger {
            ProvisioningTrigger::Boot => PortalMode::AutoConnect,
            ProvisioningTrigger::Button => PortalMode::OnDemand,
        };

        let session = PortalSession {
            ssid: current.access_point_ssid(&self.ap_prefix),
            passphrase: self.ap_passphrase.clone(),
            timeout_ms: self.timeout_ms,
            mode,
            form: PortalForm::from_config(current),
        };

        self.state = ProvisioningState::PortalActive;
        self.trigger = Some(trigger);
        self.base = current.clone();
        self.pending = None;
        self.failure = None;
        self.started_ms = now_ms;

        info!(
            "provisioning started ({trigger:?}) on `{}`, timeout {} s",
            session.ssid,
            self.timeout_ms / 1000
        );
        Ok(session)
    }

    /// Feeds one portal poll result into an active session.
    pub fn handle(&mut self, event: PortalEvent, now_ms: u64) -> ProvisioningState {
        if self.state != ProvisioningState::PortalActive {
            return self.state;
        }

        match event {
            PortalEvent::Submitted(form) => {
                info!("provisioning form submitted");
                self.pending = Some(form.apply_to(&self.base));
                self.state = ProvisioningState::Committing;
            }
            PortalEvent::Connected => {
                info!("joined network with saved credentials");
                let mut config = self.base.clone();
                config.sanitize();
                self.pending = Some(config);
                self.state = ProvisioningState::Committing;
            }
            PortalEvent::Pending => {
                if now_ms.saturating_sub(self.started_ms) >= self.timeout_ms {
                    self.fail(ProvisioningError::PortalTimeout(self.timeout_ms));
                }
            }
        }

        self.state
    }

    /// `PortalActive -> Failed`.
    pub fn fail(&mut self, err: ProvisioningError) {
        if self.state != ProvisioningState::PortalActive {
            return;
        }

        warn!("provisioning failed: {err}");
        self.failure = Some(err);
        self.pending = None;
        self.state = ProvisioningState::Failed;
    }

    /// `Committing -> Idle`. A failed save is logged; the submitted config is
    /// still returned for in-memory use.
    pub fn commit<B: ConfigBackend>(
        &mut self,
        store: &mut ConfigStore<B>,
    ) -> Result<Commit, ProvisioningError> {
        let config = match (self.state, self.pending.take()) {
            (ProvisioningState::Committing, Some(config)) => config,
            (state, pending) => {
                self.pending = pending;
                return Err(ProvisioningError::InvalidState(state));
            }
        };

        let durable = match store.save(&config) {
            Ok(()) => {
                info!("provisioned config saved for `{}`", config.device_id);
                true
            }
            Err(err) => {
                warn!("failed to persist provisioned config: {err:#}");
                false
            }
        };

        self.state = ProvisioningState::Idle;
        Ok(Commit { config, durable })
    }

    /// True when the failed session must end in a device restart.
    pub fn restart_required(&self) -> bool {
        self.state == ProvisioningState::Failed && self.trigger == Some(ProvisioningTrigger::Button)
    }

    pub fn failure(&self) -> Option<&ProvisioningError> {
        self.failure.as_ref()
    }

    /// `Failed -> Idle`, once the restart (or boot-time degradation) has been
    /// handled.
    pub fn recover(&mut self) {
        if self.state == ProvisioningState::Failed {
            self.state = ProvisioningState::Idle;
            self.failure = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryBackend;

    fn controller() -> ProvisioningController {
        ProvisioningController::new(&NodeSettings::default())
    }

    fn current() -> DeviceConfig {
        DeviceConfig {
            device_id: "dev-1".into(),
            server_address: "10.0.0.2".into(),
            server_port: "3000".into(),
            ..Default::default()
        }
    }

    #[test]
    fn begin_builds_session_from_current_config() {
        let mut controller = controller();

        let session = controller
            .begin(ProvisioningTrigger::Button, &current(), 1_000)
            .unwrap();

        assert_eq!(controller.state(), ProvisioningState::PortalActive);
        assert_eq!(session.ssid, "AMV_Device-dev-1");
        assert_eq!(session.passphrase, "12345677");
        assert_eq!(session.timeout_ms, 120_000);
        assert_eq!(session.mode, PortalMode::OnDemand);
        assert_eq!(session.form, PortalForm::from_config(&current()));
    }

    #[test]
    fn boot_sessions_auto_connect() {
        let mut controller = controller();
        let session = controller
            .begin(ProvisioningTrigger::Boot, &DeviceConfig::default(), 0)
            .unwrap();

        assert_eq!(session.mode, PortalMode::AutoConnect);
        assert_eq!(session.ssid, "AMV_Device-");
    }

    #[test]
    fn cannot_begin_twice() {
        let mut controller = controller();
        controller
            .begin(ProvisioningTrigger::Button, &current(), 0)
            .unwrap();

        assert!(matches!(
            controller.begin(ProvisioningTrigger::Button, &current(), 1),
            Err(ProvisioningError::InvalidState(
                ProvisioningState::PortalActive
            ))
        ));
    }

    #[test]
    fn submission_moves_to_committing_then_idle() {
        let mut controller = controller();
        let mut store = ConfigStore::new(MemoryBackend::default());
        controller
            .begin(ProvisioningTrigger::Button, &current(), 0)
            .unwrap();

        let form = PortalForm {
            server_port: Some(" 8080 ".into()),
            ..Default::default()
        };
        assert_eq!(
            controller.handle(PortalEvent::Submitted(form), 10),
            ProvisioningState::Committing
        );

        let commit = controller.commit(&mut store).unwrap();

        assert!(commit.durable);
        assert_eq!(commit.config.server_port, "8080");
        assert_eq!(controller.state(), ProvisioningState::Idle);
        assert_eq!(store.load().unwrap(), commit.config);
    }

    #[test]
    fn silent_join_commits_current_values() {
        let mut controller = controller();
        let mut store = ConfigStore::new(MemoryBackend::default());
        let mut untrimmed = current();
        untrimmed.device_id = " dev-1 ".into();

        controller
            .begin(ProvisioningTrigger::Boot, &untrimmed, 0)
            .unwrap();
        controller.handle(PortalEvent::Connected, 5);
        let commit = controller.commit(&mut store).unwrap();

        assert_eq!(commit.config, current());
    }

    #[test]
    fn times_out_exactly_at_deadline() {
        let mut controller = controller();
        controller
            .begin(ProvisioningTrigger::Button, &current(), 500)
            .unwrap();

        assert_eq!(
            controller.handle(PortalEvent::Pending, 120_499),
            ProvisioningState::PortalActive
        );
        assert_eq!(
            controller.handle(PortalEvent::Pending, 120_500),
            ProvisioningState::Failed
        );
        assert!(matches!(
            controller.failure(),
            Some(ProvisioningError::PortalTimeout(120_000))
        ));
        assert!(controller.restart_required());

        controller.recover();
        assert_eq!(controller.state(), ProvisioningState::Idle);
    }

    #[test]
    fn boot_timeout_does_not_require_restart() {
        let mut controller = controller();
        controller
            .begin(ProvisioningTrigger::Boot, &DeviceConfig::default(), 0)
            .unwrap();

        controller.handle(PortalEvent::Pending, 120_000);

        assert_eq!(controller.state(), ProvisioningState::Failed);
        assert!(!controller.restart_required());
    }

    #[test]
    fn late_events_after_failure_are_ignored() {
        let mut controller = controller();
        controller
            .begin(ProvisioningTrigger::Button, &current(), 0)
            .unwrap();
        controller.handle(PortalEvent::Pending, 200_000);

        let state = controller.handle(PortalEvent::Submitted(PortalForm::default()), 200_001);

        assert_eq!(state, ProvisioningState::Failed);
        assert!(controller.pending().is_none());
    }

    #[test]
    fn commit_outside_committing_is_rejected() {
        let mut controller = controller();
        let mut store = ConfigStore::new(MemoryBackend::default());

        assert!(matches!(
            controller.commit(&mut store),
            Err(ProvisioningError::InvalidState(ProvisioningState::Idle))
        ));
    }

    #[test]
    fn same_submission_twice_persists_identical_bytes() {
        let form = PortalForm {
            device_id: Some(" dev-9 ".into()),
            server_address: Some("192.168.254.150".into()),
            server_port: Some("3000".into()),
            temp_calibration: Some("1.5".into()),
            humid_calibration: Some("-2".into()),
            airqual_calibration: Some("10".into()),
        };
        let mut store = ConfigStore::new(MemoryBackend::default());
        let mut controller = controller();

        let mut persisted = Vec::new();
        for round in 0..2 {
            let current = store.load().unwrap();
            controller
                .begin(ProvisioningTrigger::Button, &current, round)
                .unwrap();
            controller.handle(PortalEvent::Submitted(form.clone()), round + 1);
            controller.commit(&mut store).unwrap();
            persisted.push(store.backend().data.clone().unwrap());
        }

        assert_eq!(persisted[0], persisted[1]);
    }

    #[test]
    fn failed_save_still_returns_config() {
        let mut controller = controller();
        let mut store = ConfigStore::new(MemoryBackend {
            fail_writes: true,
            ..Default::default()
        });
        controller
            .begin(ProvisioningTrigger::Button, &current(), 0)
            .unwrap();
        controller.handle(PortalEvent::Connected, 1);

        let commit = controller.commit(&mut store).unwrap();

        assert!(!commit.durable);
        assert_eq!(commit.config, current());
        assert_eq!(controller.state(), ProvisioningState::Idle);
    }
}
