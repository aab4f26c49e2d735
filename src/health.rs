//! Liveness supervision
//!
//! The chip can wedge its RF front-end and stop answering while the bus itself stays fine.
//! A cheap CORE_GET_CONFIG probe runs every `interval`; enough consecutive failures pulse VEN
//! and bring the session back up from scratch.
use crate::{
    elapsed,
    nci::{core_oid, gid},
    transport::Transport,
    ConfigurationError, Duration, Instant, Pn7160, State,
};

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::secs(60);
pub const DEFAULT_MAX_FAILED_CHECKS: u8 = 3;
pub const MAX_FAILED_CHECKS_LIMIT: u8 = 10;

/// TOTAL_DURATION, present on every NCI 2.0 controller
const PROBE_PARAMETER: u8 = 0x00;

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HealthSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub max_failed_checks: u8,
    pub auto_reset_on_failure: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_HEALTH_INTERVAL,
            max_failed_checks: DEFAULT_MAX_FAILED_CHECKS,
            auto_reset_on_failure: true,
        }
    }
}

impl HealthSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(1..=MAX_FAILED_CHECKS_LIMIT).contains(&self.max_failed_checks) {
            return Err(ConfigurationError::MaxFailedChecksOutOfRange(
                self.max_failed_checks,
            ));
        }
        if self.enabled && self.interval.ticks() == 0 {
            return Err(ConfigurationError::ZeroInterval);
        }
        Ok(())
    }
}

/// What the supervisor wants done about a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Verdict {
    /// Below the threshold, try again next tick
    Retry,
    /// Threshold reached, pulse VEN and reinitialize
    Reset,
    /// Threshold reached but automatic reset is off
    Exhausted,
}

/// Outcome of one [`Pn7160::health_tick`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HealthReport {
    /// Disabled, not due yet, or nothing to supervise
    Skipped,
    Passed,
    Failed { failures: u8 },
    /// Threshold reached, VEN was pulsed and the session restarts
    Reset,
    /// Threshold reached with automatic reset disabled
    RecoveryExhausted { failures: u8 },
}

#[derive(Clone, Debug)]
pub struct HealthSupervisor {
    settings: HealthSettings,
    consecutive_failures: u8,
    last_check: Option<Instant>,
    healthy: bool,
}

impl HealthSupervisor {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings,
            consecutive_failures: 0,
            last_check: None,
            healthy: true,
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    pub fn consecutive_failures(&self) -> u8 {
        self.consecutive_failures
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Whether a probe is due, the first call only arms the schedule
    pub fn is_due(&mut self, now: Instant) -> bool {
        if !self.settings.enabled {
            return false;
        }
        match self.last_check {
            None => {
                self.last_check = Some(now);
                false
            }
            Some(last) if elapsed(now, last) >= self.settings.interval => {
                self.last_check = Some(now);
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(
                "Health check recovered after {} failures",
                self.consecutive_failures
            );
        }
        self.clear();
    }

    pub fn record_failure(&mut self) -> Verdict {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.settings.max_failed_checks {
            return Verdict::Retry;
        }
        if self.healthy {
            self.healthy = false;
            error!(
                "PN7160 declared unhealthy after {} consecutive failures",
                self.consecutive_failures
            );
        }
        if self.settings.auto_reset_on_failure {
            Verdict::Reset
        } else {
            Verdict::Exhausted
        }
    }

    /// Forget past failures, after a success or a recovery reset
    pub fn clear(&mut self) {
        self.consecutive_failures = 0;
        if !self.healthy {
            self.healthy = true;
            info!("PN7160 health restored");
        }
    }
}

impl<'a, T: Transport, const W: usize, const S: usize> Pn7160<'a, T, W, S> {
    /// Drive the health supervisor, call it periodically from the scheduler
    ///
    /// Probes at most once per configured interval, regardless of how often it's called.
    pub fn health_tick(&mut self, now: Instant) -> HealthReport {
        if self.state == State::Uninitialized || !self.health.is_due(now) {
            return HealthReport::Skipped;
        }

        if self.probe() {
            self.health.record_success();
            if self.state == State::Failed {
                info!("Controller answers again, reinitializing");
                self.state = State::Initializing;
            }
            return HealthReport::Passed;
        }

        let verdict = self.health.record_failure();
        let failures = self.health.consecutive_failures();
        warn!(
            "Health check failed ({}/{})",
            failures,
            self.health.settings().max_failed_checks
        );
        match verdict {
            Verdict::Retry => HealthReport::Failed { failures },
            Verdict::Reset => {
                warn!("Attempting automatic reset...");
                self.abandon_activity();
                self.hard_reset();
                self.state = State::Initializing;
                self.health.clear();
                HealthReport::Reset
            }
            Verdict::Exhausted => {
                error!(
                    "Recovery exhausted, automatic reset disabled ({} failures)",
                    failures
                );
                HealthReport::RecoveryExhausted { failures }
            }
        }
    }

    /// Any CORE_GET_CONFIG_RSP proves the controller is alive
    fn probe(&mut self) -> bool {
        match self.transact(gid::CORE, core_oid::GET_CONFIG, &[1, PROBE_PARAMETER]) {
            Ok(_) => {
                trace!("Health check passed");
                true
            }
            Err(e) => {
                debug!("Health check: no answer to CORE_GET_CONFIG ({:?})", e);
                false
            }
        }
    }
}
