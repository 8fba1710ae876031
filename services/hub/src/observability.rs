//! Tracing setup for the hub service.
//!
//! Log filtering comes from `RUST_LOG` and falls back to `info`. Metrics macros in
//! the library crates stay no-ops unless an embedding application installs a recorder.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_observability(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so stdout stays reserved for the history dump.
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    tracing::debug!(service = service_name, "observability initialised");
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    // The binary's own tests start the service more than once per process.
    if subscriber.try_init().is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
