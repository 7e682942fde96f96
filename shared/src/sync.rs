//! Hand-off primitives between the game thread and the physics thread

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Single-value slot where the writer replaces the whole value and the reader
/// always sees a complete one.
#[derive(Debug)]
pub struct LatestSlot<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for LatestSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Clone> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, value: T) {
        *lock(&self.inner) = Some(value);
    }

    pub fn get(&self) -> Option<T> {
        lock(&self.inner).clone()
    }

    pub fn take(&self) -> Option<T> {
        lock(&self.inner).take()
    }
}

/// Unbounded queue from one thread to another.
pub struct Handoff<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<T> {
        self.tx.clone()
    }

    pub fn push(&self, value: T) {
        // The receiver lives as long as `self`, so the send cannot fail.
        let _ = self.tx.send(value);
    }

    /// Everything queued so far, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            values.push(value);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_latest_slot_keeps_newest() {
        let slot = LatestSlot::new();
        assert_eq!(slot.get(), None::<u32>);

        slot.publish(1);
        slot.publish(2);
        assert_eq!(slot.get(), Some(2));
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.get(), None);
    }

    #[test]
    fn test_latest_slot_across_threads() {
        let slot = LatestSlot::new();
        let writer = slot.clone();

        thread::spawn(move || {
            for i in 0..100 {
                writer.publish((i, i * 2));
            }
        })
        .join()
        .unwrap();

        let (a, b) = slot.get().unwrap();
        assert_eq!(b, a * 2);
    }

    #[test]
    fn test_handoff_preserves_order() {
        let mut queue = Handoff::new();
        let tx = queue.sender();

        thread::spawn(move || {
            for i in 0..10 {
                tx.send(i).unwrap();
            }
        })
        .join()
        .unwrap();
        queue.push(10);

        assert_eq!(queue.drain(), (0..=10).collect::<Vec<_>>());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(5));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert_eq!(*lock(&mutex), 5);
    }
}
