//! CheckingStatus: parse the URL and find out whether the unit's content
//! exists.

use unitlc_core::{ErrorKind, InstallBundleMetadata, Protocol, ProtocolMetadata, UnitState};

use crate::behavior::{StateBehavior, StateContext, StateStep};
use crate::ports::InstallerInitState;

/// Determine availability.
#[derive(Debug, Default)]
pub struct CheckingStatus {
    parsed: bool,
}

impl CheckingStatus {
    fn check_bundles(&mut self, ctx: &mut StateContext<'_>) -> Result<bool, StateStep> {
        let installer = ctx.services().installer;
        match installer.init_state() {
            InstallerInitState::Succeeded => {}
            InstallerInitState::NotInitialized => {
                ctx.defer_update();
                return Err(StateStep::Hold);
            }
            InstallerInitState::Failed => {
                return Err(StateStep::fail(
                    UnitState::ErrorCheckingStatus,
                    ctx.error(ErrorKind::Installer, "Installer_Failed_Init"),
                ));
            }
        }

        let bundles = ctx.props.metadata().bundles().to_vec();
        let info = installer.install_state(&bundles, true).map_err(|error| {
            tracing::warn!(unit = %ctx.unit, error = %error, "installer could not report install state");
            StateStep::fail(
                UnitState::ErrorCheckingStatus,
                ctx.error(ErrorKind::Installer, "Installer_Failed_GetInstallState"),
            )
        })?;

        let available = bundles
            .iter()
            .all(|bundle| info.bundles.iter().any(|(known, _)| known == bundle));
        if available {
            ctx.props.metadata = Some(ProtocolMetadata::InstallBundle(InstallBundleMetadata {
                bundles: info.bundles.into_iter().map(|(bundle, _)| bundle).collect(),
                asset_stream_bundles: info.asset_stream_bundles,
            }));
        }
        Ok(available)
    }
}

impl StateBehavior for CheckingStatus {
    fn begin_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.parsed = false;
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if !self.parsed {
            match ctx.props.identifier.parse() {
                Ok(parsed) => {
                    ctx.props.name = parsed.name;
                    ctx.props.descriptor_path = parsed.descriptor_path;
                    ctx.props.metadata = Some(parsed.metadata);
                    self.parsed = true;
                }
                Err(error) => {
                    tracing::warn!(unit = %ctx.unit, error = %error, "unit URL did not parse");
                    return StateStep::fail(
                        UnitState::ErrorCheckingStatus,
                        ctx.error(ErrorKind::InvalidUrl, "Bad_Url"),
                    );
                }
            }
        }

        let available = match ctx.props.identifier.protocol() {
            Protocol::File => ctx
                .services()
                .mounter
                .descriptor_exists(&ctx.props.descriptor_path),
            Protocol::InstallBundle => match self.check_bundles(ctx) {
                Ok(available) => available,
                Err(step) => return step,
            },
        };
        if !available {
            return StateStep::fail(
                UnitState::ErrorUnavailable,
                ctx.error(ErrorKind::Unavailable, "Unit_Unavailable"),
            );
        }

        let hooks = ctx.services().hooks;
        hooks.on_status_known(ctx.unit, &ctx.props.name);
        StateStep::Advance(UnitState::StatusKnown)
    }
}
