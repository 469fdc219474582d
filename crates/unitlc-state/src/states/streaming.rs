//! Asset dependency streaming.
//!
//! Bundles flagged for on-demand asset streaming are streamed in between
//! mounting and registering, and their AssetStream references are dropped
//! again on the way down.

use unitlc_core::{ErrorKind, UnitState};

use super::{enqueued_bundles, BundleRequest};
use crate::behavior::{StateBehavior, StateContext, StateStep};
use crate::bundles::BundleDepth;
use crate::queue::{BundleEvent, BundleFailure, BundleOp};

/// Stream the unit's asset dependencies.
#[derive(Debug, Default)]
pub struct AssetStreaming {
    started: bool,
    request: BundleRequest,
}

impl StateBehavior for AssetStreaming {
    fn begin_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.started = false;
        self.request.clear();
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if !self.started {
            self.started = true;
            let streams = ctx.props.metadata().asset_stream_bundles().to_vec();
            if ctx.props.is_install_bundle() && !streams.is_empty() {
                let unit = ctx.unit;
                ctx.bundles().add_refs(unit, BundleDepth::AssetStream, &streams);
                let answer = ctx
                    .services()
                    .installer
                    .request_stream(&streams, ctx.bundle_sink());
                match enqueued_bundles(ctx, answer) {
                    Err(error) => return StateStep::fail(UnitState::ErrorAssetDependencyStreaming, error),
                    Ok(enqueued) => self.request.start(enqueued),
                }
            }
        }

        if self.request.is_waiting() {
            return StateStep::Hold;
        }
        if let Some(error) = self.request.take_error() {
            return StateStep::fail(UnitState::ErrorAssetDependencyStreaming, error);
        }
        StateStep::Advance(UnitState::Registering)
    }

    fn end_state(&mut self, ctx: &mut StateContext<'_>) {
        if self.request.is_waiting() {
            ctx.services().installer.cancel_stream(self.request.pending());
        }
        self.request.clear();
    }

    fn try_cancel(&mut self, ctx: &mut StateContext<'_>) {
        if self.request.is_waiting() {
            ctx.services().installer.cancel_stream(self.request.pending());
        }
    }

    fn on_bundle_event(&mut self, ctx: &mut StateContext<'_>, event: &BundleEvent) -> bool {
        let Some(result) = self.request.record(BundleOp::Stream, event) else {
            return false;
        };
        if let Err(failure) = result {
            let kind = match failure {
                BundleFailure::Canceled => ErrorKind::Canceled,
                BundleFailure::Failed(_) => ErrorKind::BundleOperation,
            };
            let error = ctx.error(kind, format!("AssetStream.OnComplete.{}", failure.code()));
            self.request.fail(error);
        }
        !self.request.is_waiting()
    }
}

/// Drop the unit's AssetStream references.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssetStreamOut;

impl StateBehavior for AssetStreamOut {
    fn begin_state(&mut self, ctx: &mut StateContext<'_>) {
        let streams = ctx.props.metadata().asset_stream_bundles().to_vec();
        if !streams.is_empty() {
            let unit = ctx.unit;
            ctx.bundles().release(unit, BundleDepth::AssetStream, &streams);
        }
    }

    fn update_state(&mut self, _ctx: &mut StateContext<'_>) -> StateStep {
        StateStep::Advance(UnitState::Unmounting)
    }
}
