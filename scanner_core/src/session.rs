//! Stream subscribers.
//!
//! A session is a callback registered with the sensor for as long as it
//! needs samples. The callback returns [`Flow::Stop`] once satisfied; the
//! session then receives nothing more and its owner can release it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::sample::Sample;
use crate::stream::LatencyKey;

/// Loop control returned by a sample callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub type SampleCallback = Box<dyn FnMut(&Sample) -> Flow>;
pub type CompletionCallback = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

struct Subscriber {
    callback: SampleCallback,
    latency: Option<LatencyKey>,
    on_release: Option<CompletionCallback>,
    done: bool,
}

/// What the sensor has to undo when a session goes away.
pub struct Released {
    pub latency: Option<LatencyKey>,
    pub on_release: Option<CompletionCallback>,
}

#[derive(Default)]
pub struct Sessions {
    subs: BTreeMap<SessionId, Subscriber>,
    next: u64,
}

impl std::fmt::Debug for Sessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sessions")
            .field("ids", &self.subs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Sessions {
    pub fn insert(
        &mut self,
        callback: SampleCallback,
        latency: Option<LatencyKey>,
        on_release: Option<CompletionCallback>,
    ) -> SessionId {
        let id = SessionId(self.next);
        self.next += 1;
        self.subs.insert(
            id,
            Subscriber {
                callback,
                latency,
                on_release,
                done: false,
            },
        );
        tracing::trace!(?id, live = self.subs.len(), "session acquired");
        id
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Released> {
        let sub = self.subs.remove(&id)?;
        tracing::trace!(?id, live = self.subs.len(), "session released");
        Some(Released {
            latency: sub.latency,
            on_release: sub.on_release,
        })
    }

    /// Hand `sample` to every session still wanting data, in id order.
    pub fn deliver(&mut self, sample: &Sample) {
        for sub in self.subs.values_mut().filter(|s| !s.done) {
            if (sub.callback)(sample) == Flow::Stop {
                sub.done = true;
            }
        }
    }

    /// True once the session stopped or no longer exists.
    pub fn is_done(&self, id: SessionId) -> bool {
        self.subs.get(&id).is_none_or(|s| s.done)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.subs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

/// Shared sample list filled by a collecting callback.
pub type SampleSink = Rc<RefCell<Vec<Sample>>>;

/// Callback keeping samples taken at or after `min_clock` until `total`
/// have been kept.
pub fn collector(total: usize, min_clock: u64) -> (SampleCallback, SampleSink) {
    let sink: SampleSink = Rc::new(RefCell::new(Vec::with_capacity(total)));
    let inner = Rc::clone(&sink);
    let cb = Box::new(move |s: &Sample| {
        if s.clock < min_clock {
            return Flow::Continue;
        }
        let mut samples = inner.borrow_mut();
        samples.push(*s);
        if samples.len() >= total {
            Flow::Stop
        } else {
            Flow::Continue
        }
    });
    (cb, sink)
}
