//! CLI command implementations
//!
//! This module contains the implementation of all CLI subcommands.

pub mod check_config;
pub mod probe;
pub mod run;

use relink_core::config::ProbeKind;
use relink_core::error::RelinkError;
use relink_core::vpn::{IpRouteProbe, NetworkManagerProbe, ReachabilityProbe};
use std::sync::Arc;

/// Build the reachability probe selected in the configuration
///
/// Must not be called from async code: the NetworkManager probe talks to
/// D-Bus synchronously while connecting.
pub(crate) fn build_probe(kind: ProbeKind) -> Result<Arc<dyn ReachabilityProbe>, RelinkError> {
    let probe: Arc<dyn ReachabilityProbe> = match kind {
        ProbeKind::IpRoute => Arc::new(IpRouteProbe::new()?),
        ProbeKind::NetworkManager => Arc::new(NetworkManagerProbe::new()?),
    };
    Ok(probe)
}
