// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// promise.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! The kernel promise state machine.
//!
//! A promise is born unresolved with a decider, a subscriber set and a
//! FIFO queue of pipelined messages. Resolution is terminal: the
//! decider and subscribers are cleared, one notify is fanned out per
//! subscriber, queued messages are flushed to the resolution target,
//! and kernel-internal waiters fire synchronously. A promise that
//! resolves to another promise is accepted verbatim; no chaining
//! happens at this layer.

use crate::error::{CrankResult, VatFatalError};
use crate::queue::message_krefs;
use crate::state::KernelState;
use ocap_core::{
    CapData, EndpointId, KPromiseId, KRef, Message, PromiseState, Resolution, RunQueueItem,
};
use ocap_store::StoreError;
use tracing::{debug, warn};

impl KernelState {
    /// Handles a subscribe: on an unresolved promise the endpoint joins
    /// the subscriber set; on a settled one a notify is enqueued
    /// immediately.
    pub fn subscribe(&mut self, endpoint: EndpointId, kpid: KPromiseId) -> CrankResult<()> {
        match self.store.promise_state(kpid)? {
            None => Err(VatFatalError::invalid_syscall(format!(
                "{endpoint} subscribed to unknown promise {kpid}"
            ))
            .into()),
            Some(PromiseState::Unresolved) => {
                if self.store.add_promise_subscriber(kpid, endpoint)? {
                    self.store.inc_promise_refcount(kpid)?;
                }
                Ok(())
            }
            Some(_) => {
                self.enqueue_notify(endpoint, kpid)?;
                Ok(())
            }
        }
    }

    /// Enqueues a notify for `endpoint`, taking the ref the delivery
    /// will release.
    pub fn enqueue_notify(
        &mut self,
        endpoint: EndpointId,
        kpid: KPromiseId,
    ) -> Result<(), StoreError> {
        self.enqueue_run(RunQueueItem::Notify { endpoint, kpid })
    }

    /// Queues a pipelined message on an unresolved promise.
    ///
    /// The queued-on promise takes one ref per enqueue, and the
    /// message's own krefs each take a queue-slot ref, released again
    /// when the queue flushes.
    pub(crate) fn queue_message_on_promise(
        &mut self,
        kpid: KPromiseId,
        message: &Message,
    ) -> Result<(), StoreError> {
        self.store.inc_promise_refcount(kpid)?;
        for kref in message_krefs(message)? {
            self.inc_slot_ref(kref)?;
        }
        self.store.enqueue_promise_message(kpid, message)
    }

    /// Applies a batch of resolutions on behalf of `decider`.
    ///
    /// The whole batch is validated before any state changes, so a bad
    /// resolution never leaves a half-applied batch behind.
    pub fn resolve_promises(
        &mut self,
        decider: EndpointId,
        resolutions: &[Resolution],
    ) -> CrankResult<()> {
        for resolution in resolutions {
            let kpid = resolution.kpid;
            match self.store.promise_state(kpid)? {
                None => {
                    return Err(VatFatalError::invalid_syscall(format!(
                        "{decider} resolved unknown promise {kpid}"
                    ))
                    .into())
                }
                Some(PromiseState::Unresolved) => {}
                Some(_) => return Err(VatFatalError::AlreadyResolved { kpid }.into()),
            }
            if self.store.promise_decider(kpid)? != Some(decider) {
                return Err(VatFatalError::NotDecider {
                    endpoint: decider,
                    kpid,
                }
                .into());
            }
        }
        for resolution in resolutions {
            self.resolve_promise_internal(
                resolution.kpid,
                resolution.rejected,
                resolution.value.clone(),
            )?;
        }
        Ok(())
    }

    /// Settles one promise, bypassing the decider check.
    ///
    /// Used by [`KernelState::resolve_promises`] after validation and by
    /// the kernel itself (dead-vat rejections, redirected results).
    pub(crate) fn resolve_promise_internal(
        &mut self,
        kpid: KPromiseId,
        rejected: bool,
        value: CapData,
    ) -> Result<(), StoreError> {
        // A settled promise is immutable; kernel-initiated rejections
        // (dead vats, undeliverable sends) may race a resolution that
        // happened while the work sat queued.
        match self.store.promise_state(kpid)? {
            Some(PromiseState::Unresolved) => {}
            other => {
                debug!(%kpid, ?other, "skipping resolution of settled promise");
                return Ok(());
            }
        }
        debug!(%kpid, rejected, "resolving promise");
        let subscribers = self.store.promise_subscribers(kpid)?;

        // The references inside the resolution value outlive it.
        for slot in &value.slots {
            let kref: KRef = slot
                .parse()
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt("resolution", e.to_string()))?;
            self.inc_slot_ref(kref)?;
        }

        self.store.mark_promise_resolved(kpid, rejected, &value)?;

        // Fan out one notify per subscriber, then release the refs the
        // subscriber entries held. Notifies first so the count never
        // dips through zero while the promise is still referenced.
        for subscriber in &subscribers {
            self.enqueue_notify(*subscriber, kpid)?;
        }
        for _ in &subscribers {
            self.store.dec_promise_refcount(kpid)?;
        }

        self.flush_queued_messages(kpid, rejected, &value)?;

        let resolution = Resolution {
            kpid,
            rejected,
            value,
        };
        self.fire_waiters(kpid, &resolution);
        self.note_maybe_free(KRef::Promise(kpid));
        Ok(())
    }

    /// Re-dispatches messages that were pipelined onto `kpid`.
    ///
    /// A fulfillment whose value is exactly one capability redirects
    /// the queued messages at that capability, in their original order.
    /// Anything else (a rejection, or a value that is not a single
    /// capability) cannot receive messages, so each queued message's
    /// result is rejected with the resolution value.
    fn flush_queued_messages(
        &mut self,
        kpid: KPromiseId,
        rejected: bool,
        value: &CapData,
    ) -> Result<(), StoreError> {
        let queued = self.store.drain_promise_messages(kpid)?;
        if queued.is_empty() {
            return Ok(());
        }
        let redirect: Option<KRef> = if !rejected && value.slots.len() == 1 {
            Some(value.slots[0].parse().map_err(
                |e: ocap_core::CoreError| StoreError::corrupt("resolution", e.to_string()),
            )?)
        } else {
            None
        };
        debug!(%kpid, count = queued.len(), ?redirect, "flushing queued messages");
        for message in queued {
            match redirect {
                Some(target) => {
                    self.enqueue_run(RunQueueItem::Send {
                        target,
                        message: message.clone(),
                    })?;
                }
                None => {
                    if let Some(result) = message.result {
                        self.resolve_promise_internal(result, true, value.clone())?;
                    } else {
                        warn!(%kpid, method = %message.method, "dropping queued message with no result");
                    }
                }
            }
            // Release the refs the promise queue held: the message's own
            // krefs (re-taken by enqueue_run when redirected) and the
            // per-enqueue ref on the queued-on promise.
            for kref in message_krefs(&message)? {
                self.dec_slot_ref(kref)?;
            }
            self.store.dec_promise_refcount(kpid)?;
        }
        self.note_maybe_free(KRef::Promise(kpid));
        Ok(())
    }
}
