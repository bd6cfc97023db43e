// A poisoned lock means some thread panicked while mutating pool bookkeeping. The counters and
// queues can no longer be trusted to describe which items are in circulation, so we panic too.
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - continued execution \
    is not safe because the pool bookkeeping may no longer match the items in circulation";
