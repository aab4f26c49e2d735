use heapless::Vec;

use crate::ConfigurationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    TagDetected,
    TagRemoved,
    EmulatedTagScan,
}

/// Raised by the driver, UIDs are in canonical `04-A1-B2-C3` form
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event<'e> {
    TagDetected(&'e str),
    TagRemoved(&'e str),
    EmulatedTagScan,
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TagDetected(_) => EventKind::TagDetected,
            Event::TagRemoved(_) => EventKind::TagRemoved,
            Event::EmulatedTagScan => EventKind::EmulatedTagScan,
        }
    }
}

pub type Callback<'a> = &'a dyn Fn(&Event<'_>);

/// Callbacks registered per event kind, called in registration order
pub struct Subscribers<'a, const N: usize> {
    entries: Vec<(EventKind, Callback<'a>), N>,
}

impl<'a, const N: usize> Default for Subscribers<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> Subscribers<'a, N> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        callback: Callback<'a>,
    ) -> Result<(), ConfigurationError> {
        self.entries
            .push((kind, callback))
            .map_err(|_| ConfigurationError::TooManySubscribers)
    }

    pub fn emit(&self, event: &Event<'_>) {
        let kind = event.kind();
        self.entries
            .iter()
            .filter(|(k, _)| *k == kind)
            .for_each(|(_, cb)| cb(event));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
