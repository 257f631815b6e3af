//! Observer interface for telemetry events.

use sentinel_core::events::{CompletionEvent, SpeakerResult};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::classify::TelemetryEvent;

/// One callback per recognized event shape, plus a catch-all.
///
/// All methods default to no-ops. `observe` routes an event to the matching
/// callback; implementors that want the raw stream override it instead.
pub trait TelemetryObserver: Send {
    fn on_next_speaker_check(&mut self, _result: SpeakerResult) {}

    fn on_agent_complete_task(&mut self, _event: &CompletionEvent) {}

    fn on_agent_finish(&mut self, _event: &CompletionEvent) {}

    fn on_conversation_finished(&mut self, _event: &CompletionEvent) {}

    fn on_other(&mut self, _raw: &Value) {}

    fn observe(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::Completion(completion) => match completion {
                CompletionEvent::NextSpeakerCheck { result } => {
                    self.on_next_speaker_check(*result)
                }
                CompletionEvent::AgentCompleteTask { .. } => {
                    self.on_agent_complete_task(completion)
                }
                CompletionEvent::AgentFinish { .. } => self.on_agent_finish(completion),
                CompletionEvent::ConversationFinished { .. } => {
                    self.on_conversation_finished(completion)
                }
            },
            TelemetryEvent::Other(raw) => self.on_other(raw),
        }
    }
}

/// Adapts a closure that wants every event.
pub struct EventFn<F>(pub F);

impl<F> TelemetryObserver for EventFn<F>
where
    F: FnMut(&TelemetryEvent) + Send,
{
    fn observe(&mut self, event: &TelemetryEvent) {
        (self.0)(event)
    }
}

/// Fires once for the first event that satisfies the predicate, then goes
/// inert until it is detached.
pub struct PredicateObserver<P> {
    predicate: P,
    tx: Option<oneshot::Sender<TelemetryEvent>>,
}

impl<P> PredicateObserver<P>
where
    P: FnMut(&TelemetryEvent) -> bool + Send,
{
    pub fn new(predicate: P) -> (Self, oneshot::Receiver<TelemetryEvent>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                predicate,
                tx: Some(tx),
            },
            rx,
        )
    }
}

impl<P> TelemetryObserver for PredicateObserver<P>
where
    P: FnMut(&TelemetryEvent) -> bool + Send,
{
    fn observe(&mut self, event: &TelemetryEvent) {
        if self.tx.is_none() || !(self.predicate)(event) {
            return;
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(event.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

type Slot = (ObserverId, Box<dyn TelemetryObserver>);

#[derive(Default)]
struct Slots {
    idle: Vec<Slot>,
    /// Ids handed out to a running dispatch.
    in_flight: Vec<ObserverId>,
    /// In-flight ids removed while their dispatch was running.
    detached: Vec<ObserverId>,
}

/// Observers run in subscription order with the registry unlocked, so a
/// callback may subscribe, unsubscribe, clear, or stop the owning detector.
///
/// A dispatch works on the observers registered when it began. Observers
/// added by a callback first see the next event; observers removed by a
/// callback still finish the current one and are dropped afterwards.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    slots: Mutex<Slots>,
}

impl ObserverRegistry {
    pub fn subscribe(&self, observer: Box<dyn TelemetryObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut slots) = self.slots.lock() {
            slots.idle.push((id, observer));
        }
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        if let Some(pos) = slots.idle.iter().position(|(existing, _)| *existing == id) {
            let removed = slots.idle.remove(pos);
            drop(slots);
            drop(removed);
            return true;
        }
        if slots.in_flight.contains(&id) && !slots.detached.contains(&id) {
            slots.detached.push(id);
            return true;
        }
        false
    }

    pub fn dispatch(&self, event: &TelemetryEvent) {
        let mut batch = {
            let Ok(mut slots) = self.slots.lock() else {
                return;
            };
            let batch = std::mem::take(&mut slots.idle);
            slots.in_flight.extend(batch.iter().map(|(id, _)| *id));
            batch
        };

        for (_, observer) in batch.iter_mut() {
            observer.observe(event);
        }

        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        slots
            .in_flight
            .retain(|id| !batch.iter().any(|(ran, _)| ran == id));
        let mut kept = Vec::with_capacity(batch.len());
        let mut dropped = Vec::new();
        for slot in batch {
            match slots.detached.iter().position(|id| *id == slot.0) {
                Some(pos) => {
                    slots.detached.swap_remove(pos);
                    dropped.push(slot);
                }
                None => kept.push(slot),
            }
        }
        kept.append(&mut slots.idle);
        slots.idle = kept;
        drop(slots);
        drop(dropped);
    }

    pub fn clear(&self) {
        let removed = match self.slots.lock() {
            Ok(mut slots) => {
                let in_flight = slots.in_flight.clone();
                slots.detached = in_flight;
                std::mem::take(&mut slots.idle)
            }
            Err(_) => return,
        };
        drop(removed);
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.idle.len() + slots.in_flight.len() - slots.detached.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
