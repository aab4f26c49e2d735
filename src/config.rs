use crate::{emulation::EmulationSettings, health::HealthSettings, ConfigurationError, Duration};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::secs(1);

/// Driver tunables, checked once by [`Config::validate`] before the driver exists
#[derive(Clone, Debug)]
pub struct Config<'a> {
    /// Cadence the scheduler calls `poll` at, also the tag removal timeout
    pub poll_interval: Duration,
    pub health: HealthSettings,
    pub emulation: EmulationSettings<'a>,
}

impl Default for Config<'_> {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            health: HealthSettings::default(),
            emulation: EmulationSettings::default(),
        }
    }
}

impl Config<'_> {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.poll_interval.ticks() == 0 {
            return Err(ConfigurationError::ZeroInterval);
        }
        self.health.validate()?;
        self.emulation.validate()
    }
}
