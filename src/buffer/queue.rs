use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Bounded admission for events that no request has absorbed yet.
///
/// The facade reserves a slot per submitted event and the delivery worker
/// releases it once the event leaves the submission queue. When no slot
/// is free the event is dropped and counted; callers are never blocked.
#[derive(Debug)]
pub struct Admission {
    capacity: AtomicUsize,
    queued: AtomicUsize,
    dropped: AtomicU64,
    peak: AtomicUsize,
}

impl Admission {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity),
            queued: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn try_reserve(&self) -> bool {
        let capacity = self.capacity.load(Ordering::Acquire);
        loop {
            let queued = self.queued.load(Ordering::Acquire);
            if queued >= capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }

            match self.queued.compare_exchange_weak(
                queued,
                queued + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(queued + 1, Ordering::Relaxed);
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    #[inline]
    pub fn release(&self) {
        // Saturate: a release must never wrap the counter.
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Takes effect for the next reservation; already queued events stay.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_drops_beyond_capacity() {
        let admission = Admission::new(2);
        assert!(admission.try_reserve());
        assert!(admission.try_reserve());
        assert!(!admission.try_reserve());
        assert_eq!(admission.dropped(), 1);

        admission.release();
        assert!(admission.try_reserve());
        assert_eq!(admission.queued(), 2);
        assert_eq!(admission.peak(), 2);
    }

    #[test]
    fn test_release_saturates() {
        let admission = Admission::new(1);
        admission.release();
        assert_eq!(admission.queued(), 0);
    }

    #[test]
    fn test_shrinking_capacity() {
        let admission = Admission::new(4);
        for _ in 0..3 {
            assert!(admission.try_reserve());
        }
        admission.set_capacity(2);
        assert!(!admission.try_reserve());
        admission.release();
        admission.release();
        assert!(admission.try_reserve());
        assert!(!admission.try_reserve());
    }

    #[test]
    fn test_concurrent_reservations_respect_capacity() {
        let admission = Arc::new(Admission::new(100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let admission = admission.clone();
                std::thread::spawn(move || (0..50).filter(|_| admission.try_reserve()).count())
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 100);
        assert_eq!(admission.dropped(), 300);
    }
}
