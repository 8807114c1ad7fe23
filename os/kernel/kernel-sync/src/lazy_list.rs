use alloc::boxed::Box;
use core::marker::PhantomData;
use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Lock-free multi-producer list with "take everything" consumption.
///
/// Producers only ever [`push`](Self::push); the consumer detaches the whole
/// chain at once with [`take_all`](Self::take_all). There is no single-element
/// pop, so the CAS loop in `push` is not exposed to ABA.
///
/// `push` never blocks and never spins on another thread's progress beyond a
/// failed CAS, which makes it usable from contexts that must not sleep.
///
/// ```
/// use kernel_sync::LazyList;
///
/// let l = LazyList::new();
/// assert!(l.push(1), "first push reports an empty list");
/// assert!(!l.push(2));
/// let mut got: Vec<_> = l.take_all().collect();
/// got.sort_unstable();
/// assert_eq!(got, [1, 2]);
/// assert!(l.is_empty());
/// ```
pub struct LazyList<T> {
    head: AtomicPtr<Node<T>>,
    _owns: PhantomData<Box<Node<T>>>,
}

// Safety: nodes are handed over whole; only T: Send crosses threads.
unsafe impl<T: Send> Send for LazyList<T> {}
unsafe impl<T: Send> Sync for LazyList<T> {}

impl<T> Default for LazyList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LazyList<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
            _owns: PhantomData,
        }
    }

    /// Push `value`; returns `true` if the list was empty before the push.
    ///
    /// The first producer to observe an empty list is the one expected to
    /// schedule the drain.
    pub fn push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not yet published; we are its only owner.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return head.is_null(),
                Err(current) => head = current,
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Detach every queued element, newest first.
    pub fn take_all(&self) -> LazyListDrain<T> {
        let head = self.head.swap(null_mut(), Ordering::Acquire);
        LazyListDrain {
            next: head,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for LazyList<T> {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

/// Owning iterator over a detached [`LazyList`] chain.
pub struct LazyListDrain<T> {
    next: *mut Node<T>,
    _owns: PhantomData<Box<Node<T>>>,
}

// Safety: the drain exclusively owns the detached chain.
unsafe impl<T: Send> Send for LazyListDrain<T> {}

impl<T> Iterator for LazyListDrain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: every node was created by `Box::into_raw` in `push` and the
        // chain was detached atomically, so nobody else can reach it.
        let node = unsafe { Box::from_raw(self.next) };
        let Node { value, next } = *node;
        self.next = next;
        Some(value)
    }
}

impl<T> Drop for LazyListDrain<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
        self.next = ptr::null_mut();
    }
}
