//! Tracing subscriber setup for binaries embedding Tavern.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a `fmt` subscriber filtered by `RUST_LOG`.
///
/// When `RUST_LOG` is unset, the tavern crates and `binary_name` log at
/// `default_level`. Calling this twice is harmless; the second call keeps
/// the first subscriber.
///
/// ```no_run
/// tavern::logging::init_tracing("tabletop_server", "info");
/// ```
pub fn init_tracing(binary_name: &str, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let crates = [
            "tavern",
            "tavern_transport",
            "tavern_session",
            "tavern_room",
            "tavern_persist",
            binary_name,
        ];
        crates
            .iter()
            .map(|name| format!("{}={default_level}", name.replace('-', "_")))
            .collect::<Vec<_>>()
            .join(",")
            .into()
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
