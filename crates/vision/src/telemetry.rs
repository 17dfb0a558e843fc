//! Tracing subscriber and Prometheus recorder setup shared by the binary and tests.

use std::{fs::File, io, path::Path, sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_chrome::{ChromeLayer, ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::{
    Registry,
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the subscriber installed (and the chrome trace flushing) while alive.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<FlushGuard>,
}

/// Install the global metrics recorder once and return its Prometheus handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            warn!("metrics recorder already installed: {err}");
        }

        let upkeep_handle = handle.clone();
        let upkeep = spawn_thread("prometheus-upkeep", move || {
            loop {
                thread::sleep(Duration::from_secs(5));
                upkeep_handle.run_upkeep();
            }
        });
        if let Err(err) = upkeep {
            warn!("failed to spawn prometheus upkeep thread: {err}");
        }

        handle
    })
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the fmt subscriber (plus an optional chrome trace layer) for the
/// current thread. Threads started through [`spawn_thread`] inherit it.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let default_filter = opts.default_filter.as_deref().unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(filter_fn(|meta| meta.is_span()))))
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default());

    TelemetryGuard {
        _default_guard: tracing::subscriber::set_default(subscriber),
        _chrome_guard: chrome_guard,
    }
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(path: &Path) -> io::Result<(ChromeLayer<Registry>, FlushGuard)> {
    let file = File::create(path)?;
    let (layer, guard) = ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_inherit_the_subscriber() {
        let _guard = enter_runtime(&TelemetryOptions::default());
        let inherited = spawn_thread("telemetry-test", || {
            tracing::dispatcher::get_default(|d| {
                d.downcast_ref::<tracing::subscriber::NoSubscriber>().is_none()
            })
        })
        .unwrap()
        .join()
        .unwrap();
        assert!(inherited);
    }

    #[test]
    fn chrome_trace_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        {
            let _guard = enter_runtime(&TelemetryOptions {
                chrome_trace_path: Some(path.clone()),
                default_filter: Some("debug".into()),
            });
            let _span = tracing::info_span!("probe").entered();
        }
        assert!(path.is_file());
    }
}
