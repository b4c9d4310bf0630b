use chrono::{DateTime, Utc};
use clap::Parser;
use crew_core::{Resource, StatusThresholds};
use crew_sync::{parse_bool_flag, HttpRemote, SyncConfig, SyncEngine, SyncHandle, SyncView};
use serde_json::{json, Value};
use std::error::Error;
use std::io;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crew-watch")]
struct Args {
    #[arg(long, env = "CREW_API_URL", default_value = "")]
    api_url: String,
    #[arg(long, env = "CREW_STREAM_URL", default_value = "")]
    stream_url: String,
    #[arg(long, env = "CREW_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,
    /// Seconds between forced refreshes; 0 disables them.
    #[arg(long, env = "CREW_WATCH_REFRESH_SECS", default_value_t = 0)]
    refresh_secs: u64,
    /// Print one summary after the first full sync and exit.
    #[arg(long, default_value_t = false)]
    once: bool,
    #[arg(long, default_value_t = 15)]
    once_timeout_secs: u64,
    /// Emit JSON lines instead of status text.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.json);
    let config = load_config(&args)?;

    let remote = HttpRemote::new(&config)?;
    let engine = SyncEngine::spawn(config, remote)?;
    let handle = engine.handle();

    let result = if args.once {
        run_once(&handle, &args).await
    } else {
        run_watch(&handle, &args).await
    };
    engine.shutdown().await;
    result
}

fn load_config(args: &Args) -> Result<SyncConfig, Box<dyn Error>> {
    let mut config = SyncConfig::from_env()?;
    if !args.api_url.trim().is_empty() {
        config.set_api_url(&args.api_url)?;
    }
    if !args.stream_url.trim().is_empty() {
        config.set_stream_url(&args.stream_url)?;
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }
    config.validate()?;
    Ok(config)
}

async fn run_once(handle: &SyncHandle, args: &Args) -> Result<(), Box<dyn Error>> {
    let mut rx = handle.subscribe();
    let settled = tokio::time::timeout(Duration::from_secs(args.once_timeout_secs), async {
        rx.wait_for(|view| !view.config_loading && (!view.configured || view.fully_synced()))
            .await
            .is_ok()
    })
    .await;
    match settled {
        Ok(true) => {}
        Ok(false) => return Err("sync engine stopped".into()),
        Err(_) => warn!(
            timeout_secs = args.once_timeout_secs,
            "watch_once_timeout: printing partial state"
        ),
    }
    let view = handle.view();
    println!("{}", render(&view, Utc::now(), args.json)?);
    Ok(())
}

async fn run_watch(handle: &SyncHandle, args: &Args) -> Result<(), Box<dyn Error>> {
    let mut rx = handle.subscribe();
    let mut ticker = refresh_ticker(args.refresh_secs);
    let mut refreshing: Option<JoinHandle<()>> = None;
    let mut last_output = String::new();

    let result = loop {
        let view = rx.borrow_and_update().clone();
        let output = match render(&view, Utc::now(), args.json) {
            Ok(output) => output,
            Err(err) => break Err(err.into()),
        };
        if output != last_output {
            println!("{output}");
            last_output = output;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            _ = next_tick(&mut ticker) => {
                start_refresh(handle, &mut refreshing);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("watch_shutdown");
                break Ok(());
            }
        }
    };
    if let Some(task) = refreshing {
        task.abort();
    }
    result
}

/// Run a refresh in the background so output and Ctrl-C stay responsive.
/// Returns false while the previous refresh is still running.
fn start_refresh(handle: &SyncHandle, running: &mut Option<JoinHandle<()>>) -> bool {
    if running.as_ref().is_some_and(|task| !task.is_finished()) {
        debug!("watch_refresh_in_flight");
        return false;
    }
    let handle = handle.clone();
    *running = Some(tokio::spawn(async move {
        if let Err(err) = handle.refresh().await {
            warn!("watch_refresh_error: {err}");
        }
    }));
    true
}

fn refresh_ticker(secs: u64) -> Option<Interval> {
    if secs == 0 {
        return None;
    }
    let period = Duration::from_secs(secs);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn render(view: &SyncView, now: DateTime<Utc>, as_json: bool) -> serde_json::Result<String> {
    if as_json {
        Ok(summary_json(view, now)?.to_string())
    } else {
        Ok(status_line(view, now))
    }
}

fn status_line(view: &SyncView, now: DateTime<Utc>) -> String {
    if view.config_loading && !view.configured {
        return "[checking] waiting for configuration".to_string();
    }
    let counts = view.agent_status_counts(now, &StatusThresholds::default());
    let transports = Resource::ALL
        .iter()
        .map(|resource| format!("{resource}:{}", view.phase(*resource)))
        .collect::<Vec<_>>()
        .join(" ");
    let host = view.api_host.as_deref().unwrap_or("-");
    let mut line = format!(
        "[{}] host={host} agents={} ({} active, {} idle, {} offline) channels={} messages={} | {transports}",
        view.status_label(),
        view.agents.len(),
        counts.active,
        counts.idle,
        counts.offline,
        view.channels.len(),
        view.messages.len(),
    );
    if view.refreshing {
        line.push_str(" | refreshing");
    }
    line
}

fn summary_json(view: &SyncView, now: DateTime<Utc>) -> serde_json::Result<Value> {
    let mut resources = serde_json::Map::new();
    for resource in Resource::ALL {
        let entry = view.resource(resource);
        let mut value = serde_json::to_value(entry)?;
        if let Value::Object(fields) = &mut value {
            fields.insert("phase".to_string(), serde_json::to_value(entry.state.phase())?);
            fields.insert("connected".to_string(), Value::Bool(entry.state.connected()));
            fields.insert("count".to_string(), json!(view.len(resource)));
        }
        resources.insert(resource.to_string(), value);
    }
    Ok(json!({
        "mode": view.mode(),
        "status": view.status_label(),
        "configured": view.configured,
        "configLoading": view.config_loading,
        "apiHost": view.api_host,
        "refreshing": view.refreshing,
        "agentStatus": view.agent_status_counts(now, &StatusThresholds::default()),
        "resources": resources,
    }))
}

fn init_logging(json_output: bool) {
    let env_filter = EnvFilter::try_from_default_env().ok();
    let stdout_enabled = std::env::var("CREW_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false);

    if json_output && env_filter.is_none() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("info"))
            .with_writer(io::sink)
            .try_init();
        return;
    }
    let filter = env_filter.unwrap_or_else(|| EnvFilter::new("info"));
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    }
}
