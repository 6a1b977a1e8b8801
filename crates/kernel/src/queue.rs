//! Run-queue bookkeeping.
//!
//! Every kref named by a queued item (send target, result promise, arg
//! slots, notify subject) holds one ref for as long as the item sits on
//! the queue. The enqueue side takes the refs; the delivery side
//! releases them once the item's refs have been re-anchored in the
//! receiving endpoint's c-list.

use crate::state::KernelState;
use ocap_core::{KRef, Message, RunQueueItem};
use ocap_store::StoreError;

/// Every kref a message body names: arg slots plus the result promise.
pub(crate) fn message_krefs(message: &Message) -> Result<Vec<KRef>, StoreError> {
    let mut krefs = Vec::with_capacity(message.args.slots.len() + 1);
    for slot in &message.args.slots {
        let kref = slot
            .parse()
            .map_err(|e: ocap_core::CoreError| StoreError::corrupt("queue.run", e.to_string()))?;
        krefs.push(kref);
    }
    if let Some(kpid) = message.result {
        krefs.push(KRef::Promise(kpid));
    }
    Ok(krefs)
}

/// Every kref a run-queue item holds a ref on.
pub(crate) fn item_krefs(item: &RunQueueItem) -> Result<Vec<KRef>, StoreError> {
    match item {
        RunQueueItem::Send { target, message } => {
            let mut krefs = message_krefs(message)?;
            krefs.push(*target);
            Ok(krefs)
        }
        RunQueueItem::Notify { kpid, .. } => Ok(vec![KRef::Promise(*kpid)]),
        // GC items carry bookkeeping krefs, not live references.
        RunQueueItem::DropExports { .. }
        | RunQueueItem::RetireExports { .. }
        | RunQueueItem::RetireImports { .. }
        | RunQueueItem::BringOutYourDead { .. } => Ok(Vec::new()),
    }
}

impl KernelState {
    /// Enqueues a work item, taking one ref per kref it names.
    pub fn enqueue_run(&mut self, item: RunQueueItem) -> Result<(), StoreError> {
        for kref in item_krefs(&item)? {
            self.inc_slot_ref(kref)?;
        }
        self.store.run_enqueue(&item)
    }

    /// Releases the refs a dequeued item held.
    pub(crate) fn release_item_refs(&mut self, item: &RunQueueItem) -> Result<(), StoreError> {
        for kref in item_krefs(item)? {
            self.dec_slot_ref(kref)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocap_core::{CapData, EndpointId, KPromiseId, VatId};
    use ocap_store::{KernelStore, MemoryKVStore};
    use std::sync::Arc;

    fn state() -> KernelState {
        KernelState::new(KernelStore::open(Arc::new(MemoryKVStore::new())).unwrap())
    }

    #[test]
    fn test_enqueue_send_takes_refs() {
        let mut state = state();
        let v2 = EndpointId::Vat(VatId::new(2));
        let koid = state.store.add_object(v2).unwrap();
        let kpid = state.store.add_promise(None).unwrap();
        let item = RunQueueItem::Send {
            target: KRef::Object(koid),
            message: Message::new("foo", CapData::plain("[]"), Some(kpid)),
        };
        state.enqueue_run(item.clone()).unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((1, 1)));
        assert_eq!(state.store.promise_refcount(kpid).unwrap(), 1);

        let dequeued = state.store.run_dequeue().unwrap().unwrap();
        assert_eq!(dequeued, item);
        state.release_item_refs(&dequeued).unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((0, 0)));
        assert_eq!(state.store.promise_refcount(kpid).unwrap(), 0);
        assert!(state.maybe_free.contains(&KRef::Object(koid)));
    }

    #[test]
    fn test_notify_refs_balance() {
        let mut state = state();
        let kpid = state.store.add_promise(None).unwrap();
        let item = RunQueueItem::Notify {
            endpoint: EndpointId::Vat(VatId::new(1)),
            kpid,
        };
        state.enqueue_run(item.clone()).unwrap();
        assert_eq!(state.store.promise_refcount(kpid).unwrap(), 1);
        state.release_item_refs(&item).unwrap();
        assert_eq!(state.store.promise_refcount(kpid).unwrap(), 0);
    }

    #[test]
    fn test_gc_items_take_no_refs() {
        let mut state = state();
        let v1 = EndpointId::Vat(VatId::new(1));
        let koid = state.store.add_object(v1).unwrap();
        state
            .enqueue_run(RunQueueItem::DropExports {
                endpoint: v1,
                krefs: vec![KRef::Object(koid)],
            })
            .unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((0, 0)));
    }

    #[test]
    fn test_message_krefs_collects_slots_and_result() {
        let message = Message::new(
            "m",
            CapData::new("[]", vec!["ko3".into(), "kp7".into()]),
            Some(KPromiseId::new(9)),
        );
        let krefs = message_krefs(&message).unwrap();
        assert_eq!(krefs.len(), 3);
        assert_eq!(krefs[2], KRef::Promise(KPromiseId::new(9)));
    }
}
