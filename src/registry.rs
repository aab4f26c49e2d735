use core::cell::{Cell, RefCell};

use embedded_hal::digital::OutputPin;
use heapless::Vec;

use crate::{
    event::{Callback, Event, EventKind, Subscribers},
    uid::Uid,
    ConfigurationError,
};

/// Something that reflects whether a watched tag is present
pub trait BinarySink {
    fn publish_state(&self, state: bool);
}

impl BinarySink for Cell<bool> {
    fn publish_state(&self, state: bool) {
        self.set(state)
    }
}

/// Drive a GPIO, e.g. an indicator LED
impl<P: OutputPin> BinarySink for RefCell<P> {
    fn publish_state(&self, state: bool) {
        if let Ok(mut pin) = self.try_borrow_mut() {
            let _ = if state { pin.set_high() } else { pin.set_low() };
        }
    }
}

pub struct TagWatcher<'a> {
    expected: Uid,
    output: &'a dyn BinarySink,
}

impl<'a> TagWatcher<'a> {
    /// Watch for a UID given as `xx-xx-xx-xx` or `xx:xx:xx:xx`
    pub fn new(uid: &str, output: &'a dyn BinarySink) -> Result<Self, ConfigurationError> {
        Ok(Self::from_uid(Uid::parse(uid)?, output))
    }

    pub fn from_uid(expected: Uid, output: &'a dyn BinarySink) -> Self {
        Self { expected, output }
    }

    pub fn expected(&self) -> &Uid {
        &self.expected
    }

    fn matches(&self, uid: &Uid) -> bool {
        self.expected.as_bytes() == uid.as_bytes()
    }
}

/// Maps detected UIDs onto watchers and tag events
pub struct TagRegistry<'a, const W: usize, const S: usize> {
    watchers: Vec<TagWatcher<'a>, W>,
    subscribers: Subscribers<'a, S>,
}

impl<'a, const W: usize, const S: usize> Default for TagRegistry<'a, W, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const W: usize, const S: usize> TagRegistry<'a, W, S> {
    pub const fn new() -> Self {
        Self {
            watchers: Vec::new(),
            subscribers: Subscribers::new(),
        }
    }

    pub fn add_watcher(&mut self, watcher: TagWatcher<'a>) -> Result<(), ConfigurationError> {
        self.watchers
            .push(watcher)
            .map_err(|_| ConfigurationError::TooManyWatchers)
    }

    pub fn watchers(&self) -> &[TagWatcher<'a>] {
        &self.watchers
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        callback: Callback<'a>,
    ) -> Result<(), ConfigurationError> {
        self.subscribers.subscribe(kind, callback)
    }

    pub fn on_tag_detected(&self, uid: &Uid) {
        let s = uid.to_uid_string();
        debug!("Found new tag '{}'", s.as_str());
        self.publish(uid, true);
        self.subscribers.emit(&Event::TagDetected(&s));
    }

    pub fn on_tag_removed(&self, uid: &Uid) {
        let s = uid.to_uid_string();
        debug!("Tag removed: '{}'", s.as_str());
        self.publish(uid, false);
        self.subscribers.emit(&Event::TagRemoved(&s));
    }

    fn publish(&self, uid: &Uid, state: bool) {
        self.watchers
            .iter()
            .filter(|w| w.matches(uid))
            .for_each(|w| w.output.publish_state(state));
    }
}
