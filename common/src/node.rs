//! The sample-and-publish loop and the provisioning sessions it runs.
//!
//! Everything here is single threaded. The only waits are the portal poll
//! interval, bounded by the portal timeout, and the inter-cycle delay; both go
//! through [`Board::delay_ms`] so tests can run on a virtual clock.

use log::{info, warn};

use crate::{
    config::{DeviceConfig, NodeSettings},
    portal::PortalService,
    provisioning::{Commit, ProvisioningController, ProvisioningState, ProvisioningTrigger},
    sampler::{AnalogInput, HumitureSensor, SensorSampler},
    store::{ConfigBackend, ConfigStore, StoreError},
    telemetry::{EventTransport, PublishError, TelemetryPublisher},
    types::{SensorReading, TelemetryPacket},
};

/// Pins, timing and reset for the node.
pub trait Board {
    /// Raw button level, true while pressed. Debouncing happens in the node.
    fn trigger_pressed(&mut self) -> bool;

    fn set_status(&mut self, on: bool);

    fn delay_ms(&mut self, ms: u64);

    fn now_ms(&self) -> u64;

    /// Reboots the unit. Returns only on targets that emulate a restart.
    fn restart(&mut self);
}

#[derive(Debug)]
pub enum ProvisioningOutcome {
    Committed(Commit),
    Failed { restart: bool },
}

#[derive(Debug)]
pub enum PublishStatus {
    Sent,
    /// Identity or endpoint missing; nothing was attempted.
    Skipped,
    Failed(PublishError),
}

#[derive(Debug, Default)]
pub struct CycleReport {
    /// `None` when the store could not be mounted and the cycle was aborted.
    pub config: Option<DeviceConfig>,
    pub provisioning: Option<ProvisioningOutcome>,
    pub reading: Option<SensorReading>,
    pub publish: Option<PublishStatus>,
    pub restart: bool,
}

/// Fires once per press, on the released-to-pressed edge.
#[derive(Debug, Default)]
pub struct ButtonEdge {
    was_pressed: bool,
}

impl ButtonEdge {
    pub fn poll<B: Board>(&mut self, board: &mut B, debounce_ms: u64) -> bool {
        let pressed = board.trigger_pressed();
        if !pressed {
            self.was_pressed = false;
            return false;
        }
        if self.was_pressed {
            return false;
        }

        board.delay_ms(debounce_ms);
        if !board.trigger_pressed() {
            return false;
        }

        self.was_pressed = true;
        true
    }
}

pub struct Node<Bd, K, P, T, S, A> {
    board: Bd,
    store: ConfigStore<K>,
    portal: P,
    publisher: TelemetryPublisher<T>,
    sampler: SensorSampler<S, A>,
    provisioning: ProvisioningController,
    button: ButtonEdge,
    settings: NodeSettings,
}

impl<Bd, K, P, T, S, A> Node<Bd, K, P, T, S, A>
where
    Bd: Board,
    K: ConfigBackend,
    P: PortalService,
    T: EventTransport,
    S: HumitureSensor,
    A: AnalogInput,
{
    pub fn new(
        board: Bd,
        backend: K,
        portal: P,
        transport: T,
        sampler: SensorSampler<S, A>,
        mut settings: NodeSettings,
    ) -> Self {
        settings.sanitize();
        Self {
            board,
            store: ConfigStore::new(backend),
            portal,
            publisher: TelemetryPublisher::new(transport),
            sampler,
            provisioning: ProvisioningController::new(&settings),
            button: ButtonEdge::default(),
            settings,
        }
    }

    /// Power-on provisioning in auto-connect mode, then the settle delay.
    pub fn boot(&mut self) -> ProvisioningOutcome {
        let config = match self.store.load() {
            Ok(config) => config,
            Err(err) => {
                warn!("config load at boot failed: {err:#}");
                self.store.fallback()
            }
        };

        let outcome = self.provision(ProvisioningTrigger::Boot, &config);
        let active = match &outcome {
            ProvisioningOutcome::Committed(commit) => commit.config.clone(),
            ProvisioningOutcome::Failed { .. } => config,
        };

        if active.is_provisioned() {
            self.retarget(&active);
        } else {
            warn!("device not provisioned yet; telemetry disabled until setup completes");
        }

        self.board.delay_ms(self.settings.boot_settle_ms);
        outcome
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let mut config = match self.store.load() {
            Ok(config) => config,
            Err(StoreError::Unavailable(err)) => {
                warn!("config store unavailable, skipping cycle: {err}");
                self.board.delay_ms(self.settings.sample_interval_ms);
                return report;
            }
            Err(err) => {
                warn!("config load failed: {err:#}; using last known good");
                self.store.fallback()
            }
        };

        if self.button.poll(&mut self.board, self.settings.debounce_ms) {
            info!("provisioning button pressed");
            let outcome = self.provision(ProvisioningTrigger::Button, &config);
            if let ProvisioningOutcome::Committed(commit) = &outcome {
                config = commit.config.clone();
                self.retarget(&config);
            }

            let restart = matches!(outcome, ProvisioningOutcome::Failed { restart: true });
            report.provisioning = Some(outcome);
            if restart {
                report.config = Some(config);
                report.restart = true;
                return report;
            }
        }

        if config.is_provisioned() && self.publisher.endpoint().is_none() {
            self.retarget(&config);
        }

        let reading = self.sampler.sample(&config);
        let publish = self.publish(&config, &reading);

        info!(
            "[{}] server {}:{} temperature {:.1} humidity {:.1} air quality {} ({})",
            config.device_id,
            config.server_address,
            config.server_port,
            reading.temperature,
            reading.humidity,
            reading.air_quality,
            reading.status.as_str()
        );

        self.pulse_status();
        let pulse_ms = self.settings.status_pulse_ms.saturating_mul(2);
        self.board
            .delay_ms(self.settings.sample_interval_ms.saturating_sub(pulse_ms));

        report.config = Some(config);
        report.reading = Some(reading);
        report.publish = Some(publish);
        report
    }

    /// Cycles until a failed button session demands a restart, then waits the
    /// grace delay and restarts the board.
    pub fn run(&mut self) {
        loop {
            let report = self.run_cycle();
            if report.restart {
                warn!(
                    "provisioning failed; restarting in {} ms",
                    self.settings.restart_grace_ms
                );
                self.board.delay_ms(self.settings.restart_grace_ms);
                self.board.restart();
                self.provisioning.recover();
                return;
            }
        }
    }

    pub fn board(&self) -> &Bd {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut Bd {
        &mut self.board
    }

    pub fn store(&self) -> &ConfigStore<K> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ConfigStore<K> {
        &mut self.store
    }

    pub fn publisher(&self) -> &TelemetryPublisher<T> {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut TelemetryPublisher<T> {
        &mut self.publisher
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    pub fn portal_mut(&mut self) -> &mut P {
        &mut self.portal
    }

    pub fn provisioning_state(&self) -> ProvisioningState {
        self.provisioning.state()
    }

    fn provision(
        &mut self,
        trigger: ProvisioningTrigger,
        current: &DeviceConfig,
    ) -> ProvisioningOutcome {
        self.board.set_status(false);

        let now_ms = self.board.now_ms();
        let session = match self.provisioning.begin(trigger, current, now_ms) {
            Ok(session) => session,
            Err(err) => {
                warn!("cannot start provisioning: {err}");
                return ProvisioningOutcome::Failed { restart: false };
            }
        };

        match self.portal.open(&session) {
            Ok(()) => {
                loop {
                    let event = self.portal.poll();
                    let state = self.provisioning.handle(event, self.board.now_ms());
                    if state != ProvisioningState::PortalActive {
                        break;
                    }
                    self.board.delay_ms(self.settings.portal_poll_interval_ms);
                }
                self.portal.close();
            }
            Err(err) => self.provisioning.fail(err.into()),
        }

        match self.provisioning.state() {
            ProvisioningState::Committing => match self.provisioning.commit(&mut self.store) {
                Ok(commit) => ProvisioningOutcome::Committed(commit),
                Err(err) => {
                    warn!("provisioning commit rejected: {err}");
                    ProvisioningOutcome::Failed { restart: false }
                }
            },
            ProvisioningState::Failed if self.provisioning.restart_required() => {
                ProvisioningOutcome::Failed { restart: true }
            }
            _ => {
                warn!("continuing with the existing config");
                self.provisioning.recover();
                ProvisioningOutcome::Failed { restart: false }
            }
        }
    }

    fn retarget(&mut self, config: &DeviceConfig) {
        if let Err(err) = self
            .publisher
            .configure(&config.server_address, &config.server_port)
        {
            warn!("telemetry endpoint not usable: {err:#}");
        }
    }

    fn publish(&mut self, config: &DeviceConfig, reading: &SensorReading) -> PublishStatus {
        if !config.is_provisioned() {
            warn!("skipping telemetry: device id or server endpoint missing");
            return PublishStatus::Skipped;
        }

        let packet = TelemetryPacket::new(&config.device_id, reading);
        match self.publisher.publish(&packet) {
            Ok(()) => PublishStatus::Sent,
            Err(err) => {
                warn!("telemetry not delivered: {err:#}");
                PublishStatus::Failed(err)
            }
        }
    }

    fn pulse_status(&mut self) {
        self.board.set_status(true);
        self.board.delay_ms(self.settings.status_pulse_ms);
        self.board.set_status(false);
        self.board.delay_ms(self.settings.status_pulse_ms);
    }
}
