//! The endpoint delivery contract.
//!
//! Vats and remote peers satisfy the same capability set: the six
//! delivery kinds. The kernel routes by owner endpoint and does not
//! care which kind of endpoint answers.

use crate::error::CrankResult;
use crate::remote::RemoteHandle;
use crate::state::KernelState;
use crate::vat::VatHandle;
use crate::worker::{VatDelivery, VatMessage, VatResolution};
use ocap_core::ERef;

/// A live endpoint: a vat's worker channel or a remote peer.
pub enum EndpointHandle {
    /// A local vat.
    Vat(VatHandle),
    /// A remote peer kernel.
    Remote(RemoteHandle),
}

impl EndpointHandle {
    /// Delivers a message to `target` in the endpoint's namespace.
    pub async fn deliver_message(
        &mut self,
        state: &mut KernelState,
        target: ERef,
        message: VatMessage,
    ) -> CrankResult<()> {
        match self {
            EndpointHandle::Vat(vat) => {
                vat.deliver(state, VatDelivery::Message { target, message })
                    .await
            }
            EndpointHandle::Remote(remote) => remote.deliver_message(target, &message).await,
        }
    }

    /// Delivers promise resolutions the endpoint subscribed to.
    pub async fn deliver_notify(
        &mut self,
        state: &mut KernelState,
        resolutions: Vec<VatResolution>,
    ) -> CrankResult<()> {
        match self {
            EndpointHandle::Vat(vat) => {
                vat.deliver(state, VatDelivery::Notify { resolutions }).await
            }
            EndpointHandle::Remote(remote) => remote.deliver_notify(&resolutions).await,
        }
    }

    /// Tells the endpoint its exports are unreachable everywhere.
    pub async fn deliver_drop_exports(
        &mut self,
        state: &mut KernelState,
        erefs: Vec<ERef>,
    ) -> CrankResult<()> {
        match self {
            EndpointHandle::Vat(vat) => {
                vat.deliver(state, VatDelivery::DropExports { erefs }).await
            }
            EndpointHandle::Remote(remote) => remote.deliver_drop_exports(&erefs).await,
        }
    }

    /// Tells the endpoint its exports are unrecognizable everywhere.
    pub async fn deliver_retire_exports(
        &mut self,
        state: &mut KernelState,
        erefs: Vec<ERef>,
    ) -> CrankResult<()> {
        match self {
            EndpointHandle::Vat(vat) => {
                vat.deliver(state, VatDelivery::RetireExports { erefs })
                    .await
            }
            EndpointHandle::Remote(remote) => remote.deliver_retire_exports(&erefs).await,
        }
    }

    /// Tells the endpoint its imports were retired by their exporter.
    pub async fn deliver_retire_imports(
        &mut self,
        state: &mut KernelState,
        erefs: Vec<ERef>,
    ) -> CrankResult<()> {
        match self {
            EndpointHandle::Vat(vat) => {
                vat.deliver(state, VatDelivery::RetireImports { erefs })
                    .await
            }
            EndpointHandle::Remote(remote) => remote.deliver_retire_imports(&erefs).await,
        }
    }

    /// Runs a cooperative GC poll on the endpoint.
    pub async fn deliver_bring_out_your_dead(
        &mut self,
        state: &mut KernelState,
    ) -> CrankResult<()> {
        match self {
            EndpointHandle::Vat(vat) => vat.deliver(state, VatDelivery::BringOutYourDead).await,
            // A peer kernel reaps on its own schedule.
            EndpointHandle::Remote(_) => Ok(()),
        }
    }
}
