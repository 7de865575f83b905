mod collectors;
mod ping;
mod publish;
mod selection;
mod status;

use collectors::BuildInput;
use oxpoll_collector::base::{self, HealthBoard};
use oxpoll_collector::plugin::PluginRegistry;
use oxpoll_collector::probe::{self, ProbeTarget};
use oxpoll_common::config::{Config, Credentials, ExporterConfig, PollerConfig};
use oxpoll_common::remote::Remote;
use oxpoll_exporter::influx::InfluxExporter;
use oxpoll_exporter::prometheus::PromExporter;
use oxpoll_exporter::Exporter;
use oxpoll_matrix::Matrix;
use publish::{Publisher, SdPayload};
use selection::ObjectCollector;
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "oxpoll.yaml";
const DEFAULT_CONF_DIR: &str = "conf";
const POLLER_LOG_SCHEDULE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Unrecoverable startup failures, mapped onto distinct exit codes.
enum Fatal {
    /// Bad config or unusable credentials: exit 1.
    Init(String),
    /// Every requested scrape port failed to bind: exit 2.
    Bind(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let poller_name = args.next();
    let conf_dir = args.next().unwrap_or_else(|| DEFAULT_CONF_DIR.to_string());

    match run(&config_path, poller_name.as_deref(), Path::new(&conf_dir)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Fatal::Init(message)) => {
            eprintln!("oxpoll-poller: {message}");
            ExitCode::from(1)
        }
        Err(Fatal::Bind(message)) => {
            eprintln!("oxpoll-poller: {message}");
            ExitCode::from(2)
        }
    }
}

async fn run(config_path: &str, poller_name: Option<&str>, conf_dir: &Path) -> Result<(), Fatal> {
    let poller_name = poller_name.ok_or_else(|| {
        Fatal::Init("usage: oxpoll-poller <config.yaml> <poller-name> [conf-dir]".to_string())
    })?;
    let config = Config::load(config_path)
        .map_err(|e| Fatal::Init(format!("config {config_path}: {e}")))?;
    let poller = config
        .poller_named(poller_name)
        .map_err(|e| Fatal::Init(e.to_string()))?
        .clone();

    init_logging(&poller);

    if poller.disabled {
        tracing::info!(poller = poller_name, "Poller is disabled, nothing to do");
        return Ok(());
    }
    tracing::info!(poller = poller_name, addr = %poller.addr, "oxpoll-poller starting");

    let credentials =
        Credentials::from_poller(&poller).map_err(|e| Fatal::Init(e.to_string()))?;

    // requested collector classes with their object lists
    let mut requested: Vec<(String, Vec<String>)> = Vec::new();
    for request in &poller.collectors {
        let class = request.class().to_string();
        if class.is_empty() {
            continue;
        }
        let objects = if request.objects().is_empty() {
            match collectors::default_objects(conf_dir, &class) {
                Ok(objects) => objects,
                Err(e) => {
                    tracing::warn!(class = %class, error = %e, "No templates found for class");
                    Vec::new()
                }
            }
        } else {
            request.objects().to_vec()
        };
        requested.push((class, objects));
    }
    if requested.iter().all(|(_, objects)| objects.is_empty()) {
        return Err(Fatal::Init("no collectors requested".to_string()));
    }

    // capability probe, only when an ONTAP class is requested
    let classes: Vec<String> = requested.iter().map(|(class, _)| class.clone()).collect();
    let target = ProbeTarget {
        addr: poller.addr.clone(),
        credentials: credentials.clone(),
        client_timeout: poller.client_timeout,
        use_insecure_tls: poller.use_insecure_tls,
    };
    let remote = selection::negotiate_remote(&classes, || async move {
        match probe::gather_cluster_info(&target).await {
            Ok(remote) => (remote, None),
            Err(e) => (Remote::default(), Some(e)),
        }
    })
    .await;
    if !remote.is_zero() {
        tracing::info!(
            version = %remote.version,
            model = %remote.model,
            zapis_exist = remote.zapis_exist,
            disaggregated = remote.is_disaggregated,
            "Remote capabilities"
        );
    }

    // upgrade and elect one collector per object
    let mut object_map: HashMap<String, Vec<ObjectCollector>> = HashMap::new();
    for (class, objects) in &requested {
        let preferred = selection::apply_zapi_preference(class, &remote, poller.prefer_zapi);
        let upgraded = selection::upgrade_collector(&preferred, &remote);
        if upgraded != *class {
            tracing::info!(from = %class, to = %upgraded, "Collector upgraded");
        }
        for object in objects {
            object_map
                .entry(object.clone())
                .or_default()
                .push(ObjectCollector::new(upgraded.clone(), object.clone()));
        }
    }
    let elected = selection::uniquify_object_collectors(object_map);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // exporters: Prometheus binds a scrape socket, Influx pushes
    let mut exporters: Vec<Arc<dyn Exporter>> = Vec::new();
    let mut prom_requested = false;
    let mut prom_bound: Option<u16> = None;
    for name in &poller.exporters {
        let Some(exporter_config) = config.exporters.get(name) else {
            continue;
        };
        match exporter_config {
            ExporterConfig::Prometheus(prom) => {
                prom_requested = true;
                let exporter = PromExporter::new(name, prom)
                    .map_err(|e| Fatal::Init(format!("exporter {name}: {e}")))?;
                match PromExporter::allocate_listener(prom, poller.prom_port) {
                    Ok((listener, port)) => {
                        let exporter = Arc::new(exporter);
                        prom_bound.get_or_insert(port);
                        tracing::info!(exporter = %name, port, "Scrape endpoint bound");
                        tokio::spawn(exporter.clone().serve(listener, shutdown_rx.clone()));
                        exporters.push(exporter);
                    }
                    Err(e) => {
                        tracing::error!(exporter = %name, error = %e, "Failed to bind scrape port");
                    }
                }
            }
            ExporterConfig::Influx(influx) => {
                let exporter = InfluxExporter::new(name, influx, poller.client_timeout)
                    .map_err(|e| Fatal::Init(format!("exporter {name}: {e}")))?;
                exporters.push(Arc::new(exporter));
            }
        }
    }
    if prom_requested && prom_bound.is_none() {
        return Err(Fatal::Bind(
            "all requested scrape ports failed to bind".to_string(),
        ));
    }

    // build and start collectors; a failing one is disabled, not fatal
    let registry = PluginRegistry::default();
    let input = BuildInput {
        poller_name,
        poller: &poller,
        credentials: &credentials,
        conf_dir,
        registry: &registry,
    };
    let health = HealthBoard::new();
    let mut workers = Vec::new();
    for oc in &elected {
        let built = collectors::build_collector(&oc.class, &oc.object, &input);
        match built {
            Ok(mut collector) => match collector.init().await {
                Ok(()) => {
                    tracing::info!(class = %oc.class, object = %oc.object, "Collector started");
                    workers.push(tokio::spawn(base::run(
                        collector,
                        exporters.clone(),
                        health.clone(),
                        shutdown_rx.clone(),
                    )));
                }
                Err(e) => {
                    tracing::error!(class = %oc.class, object = %oc.object, error = %e, "Collector init failed, disabled");
                }
            },
            Err(e) => {
                tracing::error!(class = %oc.class, object = %oc.object, error = %e, "Collector build failed, disabled");
            }
        }
    }
    if workers.is_empty() {
        return Err(Fatal::Init(
            "no collectors could be initialized".to_string(),
        ));
    }

    // service-discovery registration and heartbeat
    if let (Some(httpsd), Some(port)) = (&config.admin.httpsd, prom_bound) {
        let payload = SdPayload {
            name: poller_name.to_string(),
            port,
            tls: false,
            tags: poller
                .global_labels()
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
        };
        tokio::spawn(Publisher::new(httpsd, payload).run(shutdown_rx.clone()));
    }

    tokio::spawn(run_ping_task(
        poller_name.to_string(),
        poller.addr.clone(),
        exporters.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(status::run_status_logger(
        health.clone(),
        POLLER_LOG_SCHEDULE,
        shutdown_rx.clone(),
    ));

    tracing::info!(
        collectors = workers.len(),
        exporters = exporters.len(),
        "Poller started"
    );

    wait_for_termination().await;
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("Workers did not stop within the grace window, abandoning");
    }
    tracing::info!("Poller stopped");
    Ok(())
}

/// Default the oxpoll targets to info; classes listed in the poller's
/// `log` field get debug on their collector module.
fn init_logging(poller: &PollerConfig) {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["oxpoll=info", "oxpoll_poller=info"] {
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }
    for class in &poller.log {
        let directive = format!("oxpoll_collector::{}=debug", class.to_lowercase());
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Periodic reachability gauge: average ping round-trip in ms plus an
/// up/down flag, published through the same exporters as collector data.
async fn run_ping_task(
    poller_name: String,
    addr: String,
    exporters: Vec<Arc<dyn Exporter>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut matrix = Matrix::new(format!("{poller_name}.poller"), "poller");
    if let Ok(instance) = matrix.new_instance("host") {
        instance.set_label("addr", addr.clone());
        instance.set_label("poller", poller_name);
    }
    let ping_ok = matrix.new_metric_float64("ping").is_ok()
        && matrix.new_metric_float64("status").is_ok();
    if ping_ok {
        if let Some(metric) = matrix.get_metric_mut("ping") {
            metric.set_unit("ms");
        }
    }

    let mut tick = tokio::time::interval(PING_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }
        let (avg_ms, ok) = ping::ping_remote(&addr, Duration::from_secs(5)).await;
        let _ = matrix.set_value("ping", "host", avg_ms);
        let _ = matrix.set_value("status", "host", if ok { 1.0 } else { 0.0 });
        for exporter in &exporters {
            if let Err(e) = exporter.export(std::slice::from_ref(&matrix)).await {
                tracing::debug!(exporter = exporter.name(), error = %e, "Ping export failed");
            }
        }
    }
}
