//! Sliding window over the one-byte sequence space.
//!
//! [`SlidingWindow`] keeps 256 optional slots indexed by sequence number and
//! two cursors in mod-256 space:
//!
//! ```text
//!        tail                    head = tail + size - 1
//!         │                        │
//!  ───────┼────────────────────────┼──────────────▶ seq (mod 256)
//!  stale  │<──────── window ──────▶│  future (buffered, not signalled)
//! ```
//!
//! Inserting an item records that it has *arrived*; accepting it records that
//! it may be *released*.  Accepting the tail slides the window over every
//! contiguous accepted slot, emitting [`WindowEvent::Accepted`] for each item in
//! sequence order and [`WindowEvent::Available`] for each pre-filled slot that
//! enters the window at the head.
//!
//! The same structure backs both directions of a connection:
//! - send side: items are queued segments, "available" puts them on the wire
//!   and "accepted" means the peer acknowledged them;
//! - receive side: items are payloads, "accepted" hands them to the
//!   application in order.
//!
//! Every operation runs under one internal lock and the event sink is called
//! with that lock held, so events from concurrent callers never interleave.
//! A sink must not call back into the same window.

use parking_lot::Mutex;

/// Number of distinct sequence numbers.
pub const SEQUENCE_SPACE: usize = 256;

/// Largest usable window: half the sequence space, so a stale sequence
/// number is never mistaken for a future one.
pub const MAX_WINDOW: u8 = 128;

/// Notification produced while inserting or sliding.
#[derive(Debug, PartialEq, Eq)]
pub enum WindowEvent<'a, T> {
    /// A filled slot is inside the window.  The item stays in the window.
    Available { seq: u8, item: &'a T },
    /// The tail slot was released.  Ownership moves to the sink.
    Accepted { seq: u8, item: T },
}

struct Slot<T> {
    item: Option<T>,
    accepted: bool,
}

impl<T> Slot<T> {
    const fn empty() -> Self {
        Self {
            item: None,
            accepted: false,
        }
    }
}

struct WindowState<T> {
    slots: Vec<Slot<T>>,
    tail: u8,
    size: u8,
}

impl<T> WindowState<T> {
    fn head(&self) -> u8 {
        self.tail.wrapping_add(self.size - 1)
    }

    fn offset(&self, seq: u8) -> u8 {
        seq.wrapping_sub(self.tail)
    }

    fn contains(&self, seq: u8) -> bool {
        self.offset(seq) < self.size
    }

    /// Release the tail and advance while the new tail is already accepted.
    fn slide(&mut self, sink: &mut impl FnMut(WindowEvent<'_, T>)) {
        loop {
            let seq = self.tail;
            let slot = std::mem::replace(&mut self.slots[usize::from(seq)], Slot::empty());
            if let Some(item) = slot.item {
                sink(WindowEvent::Accepted { seq, item });
            }

            self.tail = self.tail.wrapping_add(1);
            let head = self.head();
            if let Some(item) = self.slots[usize::from(head)].item.as_ref() {
                sink(WindowEvent::Available { seq: head, item });
            }

            if !self.slots[usize::from(self.tail)].accepted {
                break;
            }
        }
    }
}

/// A self-locking window of `size` slots over a cyclic 0-255 sequence space.
pub struct SlidingWindow<T> {
    state: Mutex<WindowState<T>>,
}

impl<T> SlidingWindow<T> {
    /// Create a window whose tail starts at 0.
    ///
    /// `size` is clamped to `1..=MAX_WINDOW`.
    pub fn new(size: u8) -> Self {
        Self::with_tail(size, 0)
    }

    /// Create a window whose first expected sequence number is `tail`.
    pub fn with_tail(size: u8, tail: u8) -> Self {
        let slots = (0..SEQUENCE_SPACE).map(|_| Slot::empty()).collect();
        Self {
            state: Mutex::new(WindowState {
                slots,
                tail,
                size: size.clamp(1, MAX_WINDOW),
            }),
        }
    }

    pub fn size(&self) -> u8 {
        self.state.lock().size
    }

    /// Oldest sequence number not yet released.
    pub fn tail(&self) -> u8 {
        self.state.lock().tail
    }

    /// Newest sequence number inside the window.
    pub fn head(&self) -> u8 {
        self.state.lock().head()
    }

    /// `true` when `seq` lies in `[tail, head]`.
    pub fn contains(&self, seq: u8) -> bool {
        self.state.lock().contains(seq)
    }

    /// `true` when `seq` lies behind the tail, i.e. was already released.
    pub fn is_stale(&self, seq: u8) -> bool {
        let state = self.state.lock();
        let offset = state.offset(seq);
        offset >= state.size && offset >= MAX_WINDOW
    }

    /// `true` when slot `seq` holds an item.
    pub fn is_filled(&self, seq: u8) -> bool {
        self.state.lock().slots[usize::from(seq)].item.is_some()
    }

    /// Number of filled slots.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.item.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every item and restart the window at `tail`.
    pub fn reset(&self, tail: u8) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            *slot = Slot::empty();
        }
        state.tail = tail;
    }

    /// Drop every item, returning them in slot order.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state
            .slots
            .iter_mut()
            .filter_map(|slot| std::mem::replace(slot, Slot::empty()).item)
            .collect()
    }

    /// Store `item` at `seq`.
    ///
    /// Returns `false` if the slot is occupied.  Emits
    /// [`WindowEvent::Available`] when `seq` is inside the window; items
    /// outside it are kept until the window reaches them.
    pub fn try_insert(&self, seq: u8, item: T, mut sink: impl FnMut(WindowEvent<'_, T>)) -> bool {
        let mut state = self.state.lock();
        let index = usize::from(seq);
        if state.slots[index].item.is_some() {
            return false;
        }
        state.slots[index].item = Some(item);
        if state.contains(seq) {
            if let Some(item) = state.slots[index].item.as_ref() {
                sink(WindowEvent::Available { seq, item });
            }
        }
        true
    }

    /// Mark `seq` as accepted.
    ///
    /// Returns `false` if `seq` is outside `[tail, head]`.  Accepting the tail
    /// slides the window.
    pub fn try_accept(&self, seq: u8, mut sink: impl FnMut(WindowEvent<'_, T>)) -> bool {
        let mut state = self.state.lock();
        if !state.contains(seq) {
            return false;
        }
        state.slots[usize::from(seq)].accepted = true;
        if seq == state.tail {
            state.slide(&mut sink);
        }
        true
    }

    /// Accept every sequence number from the tail up to and including `seq`.
    ///
    /// Returns `false` if `seq` is outside `[tail, head]`.
    pub fn try_accept_through(&self, seq: u8, mut sink: impl FnMut(WindowEvent<'_, T>)) -> bool {
        let mut state = self.state.lock();
        if !state.contains(seq) {
            return false;
        }
        let count = u16::from(state.offset(seq)) + 1;
        let tail = state.tail;
        for step in 0..count {
            let index = usize::from(tail.wrapping_add(step as u8));
            state.slots[index].accepted = true;
        }
        state.slide(&mut sink);
        true
    }

    /// Insert `item` at `seq` and accept it in one step.
    ///
    /// Returns `false` if the slot is occupied.  A slot beyond the head is
    /// stored already accepted and is released as soon as the window reaches
    /// it.
    pub fn try_insert_and_accept(
        &self,
        seq: u8,
        item: T,
        mut sink: impl FnMut(WindowEvent<'_, T>),
    ) -> bool {
        let mut state = self.state.lock();
        let index = usize::from(seq);
        if state.slots[index].item.is_some() {
            return false;
        }
        state.slots[index] = Slot {
            item: Some(item),
            accepted: true,
        };
        if state.contains(seq) {
            if let Some(item) = state.slots[index].item.as_ref() {
                sink(WindowEvent::Available { seq, item });
            }
            if seq == state.tail {
                state.slide(&mut sink);
            }
        }
        true
    }
}

impl<T> std::fmt::Debug for SlidingWindow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SlidingWindow")
            .field("tail", &state.tail)
            .field("head", &state.head())
            .field("size", &state.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Collects events as `(kind, seq)` pairs; `'v'` = available, `'a'` = accepted.
    #[derive(Default)]
    struct Recorder {
        events: Vec<(char, u8)>,
        accepted: Vec<u32>,
    }

    impl Recorder {
        fn sink(&mut self) -> impl FnMut(WindowEvent<'_, u32>) + '_ {
            move |event| match event {
                WindowEvent::Available { seq, .. } => self.events.push(('v', seq)),
                WindowEvent::Accepted { seq, item } => {
                    self.events.push(('a', seq));
                    self.accepted.push(item);
                }
            }
        }
    }

    #[test]
    fn new_window_spans_size_slots() {
        let w: SlidingWindow<u32> = SlidingWindow::new(4);
        assert_eq!(w.tail(), 0);
        assert_eq!(w.head(), 3);
        assert!(w.contains(3));
        assert!(!w.contains(4));
    }

    #[test]
    fn size_is_clamped() {
        assert_eq!(SlidingWindow::<u32>::new(0).size(), 1);
        assert_eq!(SlidingWindow::<u32>::new(255).size(), MAX_WINDOW);
    }

    #[test]
    fn insert_inside_window_is_available() {
        let w = SlidingWindow::new(4);
        let mut rec = Recorder::default();
        assert!(w.try_insert(2, 20, rec.sink()));
        assert_eq!(rec.events, vec![('v', 2)]);
    }

    #[test]
    fn insert_outside_window_is_buffered_silently() {
        let w = SlidingWindow::new(4);
        let mut rec = Recorder::default();
        assert!(w.try_insert(10, 100, rec.sink()));
        assert!(rec.events.is_empty());
        assert!(w.is_filled(10));
    }

    #[test]
    fn occupied_slot_rejects_insert() {
        let w = SlidingWindow::new(4);
        assert!(w.try_insert(1, 1, |_| {}));
        assert!(!w.try_insert(1, 2, |_| {}));
    }

    #[test]
    fn accept_outside_window_fails() {
        let w: SlidingWindow<u32> = SlidingWindow::new(4);
        assert!(!w.try_accept(4, |_| {}));
        assert!(!w.try_accept(255, |_| {}));
    }

    #[test]
    fn out_of_order_accepts_release_in_order() {
        let w = SlidingWindow::new(8);
        let mut rec = Recorder::default();
        for seq in [0u8, 1, 4, 3, 2] {
            assert!(w.try_insert(seq, u32::from(seq), rec.sink()));
            assert!(w.try_accept(seq, rec.sink()));
        }
        assert_eq!(rec.accepted, vec![0, 1, 2, 3, 4]);
        assert_eq!(w.tail(), 5);
    }

    #[test]
    fn slide_signals_prefilled_head() {
        let w = SlidingWindow::new(2);
        let mut rec = Recorder::default();
        w.try_insert(0, 0, rec.sink());
        w.try_insert(2, 2, rec.sink());
        assert_eq!(rec.events, vec![('v', 0)]);

        w.try_accept(0, rec.sink());
        assert_eq!(rec.events, vec![('v', 0), ('a', 0), ('v', 2)]);
    }

    #[test]
    fn filled_but_unaccepted_slot_stops_slide() {
        let w = SlidingWindow::new(4);
        let mut rec = Recorder::default();
        w.try_insert(0, 0, rec.sink());
        w.try_insert(1, 1, rec.sink());
        w.try_accept(0, rec.sink());
        assert_eq!(rec.accepted, vec![0]);
        assert_eq!(w.tail(), 1);
        assert!(w.is_filled(1));
    }

    #[test]
    fn accept_through_is_cumulative() {
        let w = SlidingWindow::new(4);
        let mut rec = Recorder::default();
        for seq in 0..6u8 {
            w.try_insert(seq, u32::from(seq), rec.sink());
        }
        assert!(w.try_accept_through(2, rec.sink()));
        assert_eq!(rec.accepted, vec![0, 1, 2]);
        assert_eq!(w.tail(), 3);
        // 4 and 5 entered the window while sliding.
        assert!(rec.events.contains(&('v', 4)));
        assert!(rec.events.contains(&('v', 5)));
    }

    #[test]
    fn insert_and_accept_pre_accepts_future_slots() {
        let w = SlidingWindow::new(2);
        let mut rec = Recorder::default();
        assert!(w.try_insert_and_accept(3, 3, rec.sink()));
        assert!(w.try_insert_and_accept(1, 1, rec.sink()));
        assert!(w.try_insert_and_accept(2, 2, rec.sink()));
        assert!(rec.accepted.is_empty());

        assert!(w.try_insert_and_accept(0, 0, rec.sink()));
        assert_eq!(rec.accepted, vec![0, 1, 2, 3]);
        assert_eq!(w.tail(), 4);
    }

    #[test]
    fn wraps_around_sequence_space() {
        let w = SlidingWindow::with_tail(4, 254);
        let mut rec = Recorder::default();
        for seq in [1u8, 255, 0, 254] {
            w.try_insert_and_accept(seq, u32::from(seq), rec.sink());
        }
        assert_eq!(rec.accepted, vec![254, 255, 0, 1]);
        assert_eq!(w.tail(), 2);
    }

    #[test]
    fn stale_sequence_numbers_are_detected() {
        let w = SlidingWindow::<u32>::with_tail(8, 10);
        assert!(w.is_stale(9));
        assert!(w.is_stale(10u8.wrapping_sub(100)));
        assert!(!w.is_stale(10));
        assert!(!w.is_stale(20));
    }

    #[test]
    fn reset_clears_slots() {
        let w = SlidingWindow::new(4);
        w.try_insert(1, 1, |_| {});
        w.reset(50);
        assert_eq!(w.tail(), 50);
        assert!(w.is_empty());
    }

    #[test]
    fn drain_returns_items() {
        let w = SlidingWindow::new(4);
        w.try_insert(3, 30, |_| {});
        w.try_insert(1, 10, |_| {});
        assert_eq!(w.drain(), vec![10, 30]);
        assert!(w.is_empty());
    }

    proptest! {
        #[test]
        fn accepted_events_are_strictly_increasing(
            order in Just((0u8..32).collect::<Vec<_>>()).prop_shuffle(),
            tail in any::<u8>(),
        ) {
            let w = SlidingWindow::with_tail(32, tail);
            let mut rec = Recorder::default();
            for offset in &order {
                let seq = tail.wrapping_add(*offset);
                prop_assert!(w.try_insert(seq, u32::from(*offset), rec.sink()));
                prop_assert!(w.try_accept(seq, rec.sink()));
            }
            prop_assert_eq!(rec.accepted, (0u32..32).collect::<Vec<_>>());
        }
    }
}
