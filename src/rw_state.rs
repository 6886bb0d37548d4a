use std::sync::atomic::{AtomicU8, Ordering};

/// Number of per-thread slots a reader-writer lock keeps track of.
pub const MAX_THREADS: usize = 64;

/// What a single thread currently holds of a reader-writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Unlocked = 0,
    ReadHeld = 1,
    WriteHeld = 2,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SlotState::Unlocked,
            1 => SlotState::ReadHeld,
            _ => SlotState::WriteHeld,
        }
    }
}

/// Index into a table with `N` slots. Can only be constructed in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<const N: usize>(usize);

impl<const N: usize> Slot<N> {
    pub const fn new(index: usize) -> Option<Self> {
        if index < N {
            Some(Slot(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// Per-thread hold table of a reader-writer lock.
///
/// Each slot is written only by the thread it belongs to, while any thread may scan the whole table.
/// A scan is not a snapshot: callers which need a consistent answer must make sure no thread acquires
/// or releases concurrently, e.g. because the lock is being destroyed.
#[derive(Debug)]
pub struct RwLockState<const N: usize = MAX_THREADS> {
    slots: [AtomicU8; N],
}

impl<const N: usize> RwLockState<N> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU8::new(SlotState::Unlocked as u8)),
        }
    }

    pub fn get(&self, slot: Slot<N>) -> SlotState {
        SlotState::from_raw(self.slots[slot.0].load(Ordering::Acquire))
    }

    pub fn set(&self, slot: Slot<N>, state: SlotState) {
        self.slots[slot.0].store(state as u8, Ordering::Release);
    }

    /// `true` if no thread holds the lock in any mode. Vacuously `true` for a table without slots.
    pub fn all_unlocked(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.load(Ordering::Acquire) == SlotState::Unlocked as u8)
    }

    /// Slots which are not [`SlotState::Unlocked`], in index order.
    pub fn holders(&self) -> impl Iterator<Item = (Slot<N>, SlotState)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            match SlotState::from_raw(slot.load(Ordering::Acquire)) {
                SlotState::Unlocked => None,
                state => Some((Slot(index), state)),
            }
        })
    }
}

impl<const N: usize> Default for RwLockState<N> {
    fn default() -> Self {
        Self::new()
    }
}
