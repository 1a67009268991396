//! Backend selection from settings.

use std::sync::Arc;

use tether_settings::{BackendKindSetting, TetherSettings};
use tracing::info;

use crate::backend::AgentBackend;
use crate::exec::ExecBackend;
use crate::server::ServerBackend;

/// Build the backend named by `settings.backend`, seeded with the
/// configured default mode.
pub fn create_backend(settings: &TetherSettings) -> Arc<dyn AgentBackend> {
    let defaults = settings.defaults.to_mode();
    let raw_events = settings.logging.raw_events;
    info!(
        backend = ?settings.backend,
        permission_mode = %defaults.permission_mode,
        "creating agent backend"
    );
    match settings.backend {
        BackendKindSetting::Exec => Arc::new(
            ExecBackend::new(settings.exec.clone(), defaults).with_raw_events(raw_events),
        ),
        BackendKindSetting::Server => Arc::new(
            ServerBackend::new(settings.server.clone(), defaults).with_raw_events(raw_events),
        ),
    }
}
