use std::sync::Mutex;

/// Events a mailbox reports to its observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxEvent {
    /// A message entered the index during a scan.
    MessageAdd { ordinal: usize },
    /// Periodic heartbeat during long scans; observers may cancel.
    Progress,
    /// The backing store changed under us (file shrank, rename raced).
    Corrupt,
    /// A message was appended; payload is the starting byte offset in
    /// decimal-string form.
    MessageAppend { offset: String },
    /// A message was removed by expunge. `ordinal` is the pre-expunge
    /// ordinal, `expunged` the number removed before it.
    MessageExpunge { ordinal: usize, expunged: usize },
    /// The owning folder is being destroyed.
    FolderDestroy,
}

impl MailboxEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MailboxEvent::MessageAdd { .. } => EventKind::MESSAGE_ADD,
            MailboxEvent::Progress => EventKind::PROGRESS,
            MailboxEvent::Corrupt => EventKind::CORRUPT,
            MailboxEvent::MessageAppend { .. } => EventKind::MESSAGE_APPEND,
            MailboxEvent::MessageExpunge { .. } => EventKind::MESSAGE_EXPUNGE,
            MailboxEvent::FolderDestroy => EventKind::FOLDER_DESTROY,
        }
    }
}

/// Subscription mask.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EventKind(pub u32);

impl EventKind {
    pub const MESSAGE_ADD: EventKind = EventKind(0x01);
    pub const PROGRESS: EventKind = EventKind(0x02);
    pub const CORRUPT: EventKind = EventKind(0x04);
    pub const MESSAGE_APPEND: EventKind = EventKind(0x08);
    pub const MESSAGE_EXPUNGE: EventKind = EventKind(0x10);
    pub const FOLDER_DESTROY: EventKind = EventKind(0x20);
    pub const ALL: EventKind = EventKind(0x3f);

    pub fn contains(self, other: EventKind) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for EventKind {
    type Output = EventKind;
    fn bitor(self, rhs: EventKind) -> EventKind {
        EventKind(self.0 | rhs.0)
    }
}

/// Observer verdict: keep going or break out of the enclosing iteration
/// (progress cancellation). Stopping is not an error.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObserverAction {
    Continue,
    Stop,
}

pub type Observer = Box<dyn Fn(&MailboxEvent) -> ObserverAction + Send + Sync>;

/// Event hub: subscriptions per event kind, synchronous fan-out.
///
/// Observers are plain closures invoked on the engine's task; a `Stop`
/// verdict from any observer stops both the fan-out and the caller's
/// surrounding loop.
#[derive(Default)]
pub struct Observable {
    subscribers: Mutex<Vec<(EventKind, Observer)>>,
}

impl Observable {
    pub fn new() -> Observable {
        Observable::default()
    }

    pub fn subscribe(&self, mask: EventKind, observer: Observer) {
        self.subscribers.lock().unwrap().push((mask, observer));
    }

    pub fn notify(&self, event: &MailboxEvent) -> ObserverAction {
        let subs = self.subscribers.lock().unwrap();
        for (mask, observer) in subs.iter() {
            if mask.contains(event.kind()) {
                if observer(event) == ObserverAction::Stop {
                    return ObserverAction::Stop;
                }
            }
        }
        ObserverAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn masked_subscription_filters_events() {
        let obs = Observable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        obs.subscribe(
            EventKind::MESSAGE_ADD,
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                ObserverAction::Continue
            }),
        );
        obs.notify(&MailboxEvent::MessageAdd { ordinal: 1 });
        obs.notify(&MailboxEvent::Progress);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_verdict_propagates() {
        let obs = Observable::new();
        obs.subscribe(
            EventKind::PROGRESS,
            Box::new(|_| ObserverAction::Stop),
        );
        assert_eq!(obs.notify(&MailboxEvent::Progress), ObserverAction::Stop);
        assert_eq!(
            obs.notify(&MailboxEvent::MessageAdd { ordinal: 1 }),
            ObserverAction::Continue
        );
    }
}
