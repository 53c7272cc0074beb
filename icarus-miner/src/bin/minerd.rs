//! Daemon: drives one Icarus-protocol device on benchmark work.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use icarus_miner::api::{self, AppState};
use icarus_miner::config::{DeviceConfig, DeviceOptions, DeviceVariant};
use icarus_miner::host::{ChannelHost, DeviceEvent};
use icarus_miner::icarus::job::{Job, HEADER_LEN};
use icarus_miner::icarus::session::Session;
use icarus_miner::serial::SerialOpener;
use icarus_miner::thread::IcarusThread;
use icarus_miner::tracing::{self, prelude::*};
use icarus_miner::types::HashRate;

const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";

// Bitcoin genesis block header; ntime is rolled to make fresh work.
const BENCHMARK_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
const NTIME: std::ops::Range<usize> = 68..72;

const RATE_INTERVAL: Duration = Duration::from_secs(60);

fn device_config() -> Result<DeviceConfig> {
    let mut config = match env::var("ICARUS_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading device config {path}"))?;
            DeviceOptions::from_json(&text)
                .with_context(|| format!("parsing device config {path}"))?
                .into_config()?
        }
        Err(_) => {
            let variant = match env::var("ICARUS_VARIANT") {
                Ok(v) => v
                    .parse::<DeviceVariant>()
                    .with_context(|| format!("unknown device variant '{v}'"))?,
                Err(_) => DeviceVariant::Icarus,
            };
            DeviceConfig::new(variant)
        }
    };

    if let Ok(list) = env::var("ICARUS_OPTIONS") {
        config.apply_option_list(&list)?;
    }
    if let Ok(timing) = env::var("ICARUS_TIMING") {
        config.apply_option("timing", &timing)?;
    }
    Ok(config)
}

fn benchmark_template() -> Result<[u8; HEADER_LEN]> {
    let bytes = hex::decode(BENCHMARK_HEADER)?;
    match bytes.try_into() {
        Ok(header) => Ok(header),
        Err(_) => bail!("benchmark header is not {HEADER_LEN} bytes"),
    }
}

// Hand out jobs one at a time, bumping ntime for each.
async fn feed_benchmark(jobs: mpsc::Sender<Arc<Job>>, template: [u8; HEADER_LEN]) {
    let mut header = template;
    let mut ntime = u32::from_le_bytes([header[68], header[69], header[70], header[71]]);
    for id in 0u64.. {
        header[NTIME].copy_from_slice(&ntime.to_le_bytes());
        let job = Job::from_header(id, header, [0xff; 32]);
        if jobs.send(Arc::new(job)).await.is_err() {
            break;
        }
        ntime = ntime.wrapping_add(1);
    }
}

async fn log_events(mut events: mpsc::Receiver<DeviceEvent>, running: CancellationToken) {
    let mut since = Instant::now();
    let mut hashes = 0u64;
    let mut report = time::interval(RATE_INTERVAL);
    report.tick().await;

    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            _ = report.tick() => {
                let rate = HashRate::from_hashes(hashes, since.elapsed());
                info!(%rate, "Effective hash rate.");
                since = Instant::now();
                hashes = 0;
            }
            event = events.recv() => match event {
                Some(DeviceEvent::Candidate { device, job_id, nonce }) => {
                    info!(%device, job_id, nonce = %format_args!("{nonce:08x}"), "Candidate found.");
                }
                Some(DeviceEvent::HardwareError { device, nonce, .. }) => {
                    warn!(%device, nonce = %format_args!("{nonce:08x}"), "Hardware error.");
                }
                Some(DeviceEvent::HashesDone { hashes: done, .. }) => hashes += done,
                Some(DeviceEvent::CommsError { device, reason }) => {
                    warn!(%device, %reason, "Communication error.");
                }
                None => break,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let path = env::var("ICARUS_DEVICE").unwrap_or_else(|_| DEFAULT_DEVICE.to_string());
    let listen: SocketAddr = env::var("ICARUS_API_LISTEN")
        .unwrap_or_else(|_| api::DEFAULT_LISTEN.to_string())
        .parse()
        .context("parsing ICARUS_API_LISTEN")?;
    let config = device_config()?;
    let name = path.rsplit('/').next().unwrap_or(&path).to_string();

    let variant = config.variant;
    let session = Session::open(name.clone(), config, Arc::new(SerialOpener::new(&path)))
        .await
        .with_context(|| format!("no {variant} device on {path}"))?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (job_tx, job_rx) = mpsc::channel(1);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (thread, handle) = IcarusThread::new(
        session,
        ChannelHost::new(name, job_rx, event_tx),
        running.clone(),
    );
    let state = AppState::new();
    state.register_device(handle).await;

    tracker.spawn(thread.run());
    tracker.spawn(feed_benchmark(job_tx, benchmark_template()?));
    tracker.spawn(log_events(event_rx, running.clone()));
    {
        let running = running.clone();
        tracker.spawn(async move {
            if let Err(e) = api::serve(listen, state, running).await {
                error!(error = %e, "API server failed.");
            }
        });
    }
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
