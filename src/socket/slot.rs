//! Shared slot that owns at most one socket.
//!
//! The server and client sockets are reachable from both the control thread
//! (`stop()`) and the reader thread. Each lives in a [`SocketSlot`]; whoever
//! takes it out first is the one that shuts it down. The descriptor itself is
//! closed when the last `Arc` drops, so it is closed exactly once and its
//! number cannot be recycled while the reader still holds a reference.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Exchange-and-take container for a shared socket.
#[derive(Debug)]
pub struct SocketSlot<T> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T> SocketSlot<T> {
    /// Create an empty slot.
    pub const fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }

    /// Store `value`, returning whatever was there before.
    pub fn put(&self, value: Arc<T>) -> Option<Arc<T>> {
        self.lock().replace(value)
    }

    /// Take the current value, leaving the slot empty.
    pub fn take(&self) -> Option<Arc<T>> {
        self.lock().take()
    }

    /// Take the current value only if it is `value` (pointer identity).
    ///
    /// Lets an owner reclaim its own socket without racing a newer one that
    /// replaced it.
    pub fn take_if_same(&self, value: &Arc<T>) -> Option<Arc<T>> {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some(current) if Arc::ptr_eq(current, value) => guard.take(),
            _ => None,
        }
    }

    /// Whether the slot currently holds a socket.
    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        // The slot holds no invariants a panicking holder could break.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for SocketSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_empties_slot_once() {
        let slot = SocketSlot::new();
        assert!(slot.put(Arc::new(5)).is_none());
        assert!(slot.is_occupied());
        assert_eq!(slot.take().as_deref(), Some(&5));
        assert!(slot.take().is_none());
        assert!(!slot.is_occupied());
    }

    #[test]
    fn test_take_if_same_ignores_other_values() {
        let slot = SocketSlot::new();
        let mine = Arc::new(String::from("client-a"));
        let other = Arc::new(String::from("client-a"));
        slot.put(Arc::clone(&mine));

        assert!(slot.take_if_same(&other).is_none(), "equal value but different socket");
        assert!(slot.is_occupied());
        assert!(slot.take_if_same(&mine).is_some());
        assert!(slot.take_if_same(&mine).is_none());
    }

    #[test]
    fn test_concurrent_takers_get_value_exactly_once() {
        let slot = Arc::new(SocketSlot::new());
        let value = Arc::new(42u32);
        slot.put(Arc::clone(&value));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                let value = Arc::clone(&value);
                std::thread::spawn(move || {
                    usize::from(slot.take().is_some()) + usize::from(slot.take_if_same(&value).is_some())
                })
            })
            .collect();

        let taken: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(taken, 1);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
