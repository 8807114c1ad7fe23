use alloc::boxed::Box;
use alloc::vec::Vec;

/// One independent `T` per worker (CPU), addressed by worker index.
///
/// The set of workers is fixed at construction. Slots are never shared
/// between workers by this type; any cross-worker access must go through
/// whatever synchronization `T` itself provides.
pub struct PerWorker<T> {
    slots: Box<[T]>,
}

impl<T> PerWorker<T> {
    /// Build `count` slots, initializing slot `i` with `init(i)`.
    pub fn new(count: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let slots: Vec<T> = (0..count).map(&mut init).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot of `worker`, or `None` if the index is out of range.
    #[inline]
    pub fn get(&self, worker: usize) -> Option<&T> {
        self.slots.get(worker)
    }

    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.slots.iter()
    }
}

impl<'a, T> IntoIterator for &'a PerWorker<T> {
    type Item = &'a T;
    type IntoIter = core::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
