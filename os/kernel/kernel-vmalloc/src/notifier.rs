//! Reclaim notifiers, consulted when the window looks exhausted.
//!
//! A notifier is told how many bytes the failed request needed and answers
//! with how many bytes it released back to the allocator (typically by
//! calling `vfree` on caches it owns). Notifiers run with no allocator lock
//! held and may block.

use alloc::sync::Arc;
use alloc::vec::Vec;

pub type ReclaimFn = dyn Fn(u64) -> u64 + Send + Sync;

/// Handle returned on registration, used to unregister.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NotifierId(u64);

#[derive(Default)]
pub(crate) struct NotifierChain {
    next_id: u64,
    entries: Vec<(NotifierId, Arc<ReclaimFn>)>,
}

impl NotifierChain {
    pub fn register(&mut self, f: Arc<ReclaimFn>) -> NotifierId {
        let id = NotifierId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, f));
        id
    }

    pub fn unregister(&mut self, id: NotifierId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(e, _)| *e != id);
        self.entries.len() != before
    }

    /// Callbacks in registration order, detached from the chain's lock.
    pub fn snapshot(&self) -> Vec<Arc<ReclaimFn>> {
        self.entries.iter().map(|(_, f)| Arc::clone(f)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let mut chain = NotifierChain::default();
        let a = chain.register(Arc::new(|_: u64| 1));
        let b = chain.register(Arc::new(|size: u64| size));
        assert_ne!(a, b);
        let total: u64 = chain.snapshot().iter().map(|f| f(10)).sum();
        assert_eq!(total, 11);

        assert!(chain.unregister(a));
        assert!(!chain.unregister(a));
        assert_eq!(chain.snapshot().len(), 1);
    }
}
