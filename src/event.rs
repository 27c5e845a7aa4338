//! Typed event stores
//!
//! Each event type gets one append-only store, kept as a world resource.
//! Readers track their own cursor; events a reader has visited are marked
//! handled. A cleanup system registered by the scheduler discards handled
//! and unhandled events alike at its cleanup stage.

/// Marker trait for event payloads
pub trait Event: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Event for T {}

/// One queued event plus its handled flag
#[derive(Debug, Clone)]
pub struct EventInstance<T> {
    pub event: T,
    pub handled: bool,
}

/// A reader's position in an event store. The epoch detects discards
/// that happened since the reader last looked, so a stale index is
/// rewound instead of silently skipping fresh events.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventCursor {
    epoch: u64,
    index: usize,
}

/// Append-only queue of events of type T
pub struct EventStore<T: Event> {
    events: Vec<EventInstance<T>>,
    epoch: u64,
}

impl<T: Event> EventStore<T> {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            epoch: 0,
        }
    }

    /// Append an event, initially unhandled
    pub fn push(&mut self, event: T) {
        self.events.push(EventInstance {
            event,
            handled: false,
        });
    }

    /// Number of stored events, handled or not
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate event payloads in push order without touching handled flags
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.events.iter().map(|instance| &instance.event)
    }

    /// All stored events with their handled flags, push order
    pub fn events(&self) -> &[EventInstance<T>] {
        &self.events
    }

    /// Yield payloads from `cursor` onward, advancing the cursor past the
    /// end and marking each visited event handled. A cursor from before
    /// the last discard rewinds to the start of the surviving events.
    pub(crate) fn read_from<'a>(
        &'a mut self,
        cursor: &mut EventCursor,
    ) -> impl Iterator<Item = &'a T> {
        self.revalidate(cursor);
        let start = cursor.index.min(self.events.len());
        cursor.index = self.events.len();
        self.events[start..].iter_mut().map(|instance| {
            instance.handled = true;
            &instance.event
        })
    }

    /// Events not yet visited by a reader at `cursor`
    pub(crate) fn pending(&self, cursor: EventCursor) -> usize {
        let index = if cursor.epoch == self.epoch {
            cursor.index.min(self.events.len())
        } else {
            0
        };
        self.events.len() - index
    }

    pub(crate) fn end_cursor(&self) -> EventCursor {
        EventCursor {
            epoch: self.epoch,
            index: self.events.len(),
        }
    }

    fn revalidate(&self, cursor: &mut EventCursor) {
        if cursor.epoch != self.epoch {
            cursor.epoch = self.epoch;
            cursor.index = 0;
        }
    }

    /// Drop every event a reader already visited
    pub fn discard_handled(&mut self) {
        self.events.retain(|instance| !instance.handled);
        self.epoch += 1;
    }

    /// Drop every event no reader visited
    pub fn discard_unhandled(&mut self) {
        self.events.retain(|instance| instance.handled);
        self.epoch += 1;
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.events.clear();
        self.epoch += 1;
    }
}

impl<T: Event> Default for EventStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Damage(u32);

    #[test]
    fn test_push_and_read_marks_handled() {
        let mut store = EventStore::new();
        store.push(Damage(1));
        store.push(Damage(2));

        let mut cursor = EventCursor::default();
        let seen: Vec<Damage> = store.read_from(&mut cursor).cloned().collect();
        assert_eq!(seen, vec![Damage(1), Damage(2)]);
        assert_eq!(store.pending(cursor), 0);
        assert!(store.events().iter().all(|instance| instance.handled));
    }

    #[test]
    fn test_reader_cursor_only_sees_new_events() {
        let mut store = EventStore::new();
        store.push(Damage(1));

        let mut cursor = EventCursor::default();
        assert_eq!(store.read_from(&mut cursor).count(), 1);

        store.push(Damage(2));
        let seen: Vec<Damage> = store.read_from(&mut cursor).cloned().collect();
        assert_eq!(seen, vec![Damage(2)]);
    }

    #[test]
    fn test_discard_handled_and_unhandled() {
        let mut store = EventStore::new();
        store.push(Damage(1));
        store.push(Damage(2));

        // Visit only the first event
        let mut cursor = EventCursor::default();
        {
            let mut iter = store.read_from(&mut cursor);
            iter.next();
        }
        // read_from advanced the cursor but only marked what it yielded
        store.discard_handled();
        assert_eq!(store.len(), 1);
        assert_eq!(store.events()[0].event, Damage(2));

        store.discard_unhandled();
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_cursor_rewinds_after_discard() {
        let mut store = EventStore::new();
        store.push(Damage(1));

        let mut cursor = EventCursor::default();
        assert_eq!(store.read_from(&mut cursor).count(), 1);

        // The store is drained between frames; the reader's old position
        // must not swallow the next frame's events
        store.clear();
        store.push(Damage(2));
        let seen: Vec<Damage> = store.read_from(&mut cursor).cloned().collect();
        assert_eq!(seen, vec![Damage(2)]);
    }
}
