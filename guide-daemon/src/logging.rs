//! Tracing init, adapted directly from the teacher's `env-tracing-logger`
//! crate: compact formatter, uptime timer, `EnvFilter::from_default_env()`.

use tracing_subscriber::{
    fmt::{self, format, time},
    prelude::*,
    EnvFilter,
};

/// Sets `RUST_LOG` to a sane default if the operator hasn't, then installs
/// the global subscriber. Mirrors `strand-cam`'s `cli_app.rs`, which sets
/// a crate-scoped default before parsing args.
pub fn init() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "guide_daemon=info,warn");
    }

    let evt_fmt = format().with_timer(time::Uptime::default()).compact();
    let fmt_layer = fmt::layer().event_format(evt_fmt);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .init();
}
