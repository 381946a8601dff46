use decktune::blackbox::BlackBox;
use decktune::cli;
use decktune::dynamic::config::FanControlConfig;
use decktune::dynamic::{DynamicConfig, DynamicController};
use decktune::events::{EventSink, LogSink};
use decktune::fan::service::FanControlService;
use decktune::game::{GameOnlyModeController, GameStateMonitor};
use decktune::platform::PlatformCapabilities;
use decktune::power::PowerAdjustInvoker;
use decktune::safety::recovery::ProgressiveRecovery;
use decktune::safety::SafetyPolicy;
use decktune::session::crash::CrashMetricsStore;
use decktune::session::SessionHistory;
use decktune::settings::SettingsManager;
use decktune::stream::StatusStream;
use decktune::telemetry::TelemetryBuffer;
use decktune::tuning::{BinningConfig, BinningEngine, CommandDriver};
use decktune::watchdog::{Watchdog, HEARTBEAT_INTERVAL};

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[clap(name = "decktuned", version, about = "DeckTune undervolting daemon")]
struct Opts {
    /// Logging verbosity (-v, -vv, ...)
    #[clap(short, long, parse(from_occurrences))]
    verbose: i32,
    /// Settings directory (defaults to ~/homebrew/settings/decktune)
    #[clap(long)]
    settings_dir: Option<PathBuf>,
    /// Data directory for caches, crash recordings, and session archives
    #[clap(long)]
    data_dir: Option<PathBuf>,
    /// Path to the ryzenadj binary
    #[clap(long, default_value = "/usr/bin/ryzenadj")]
    ryzenadj_path: PathBuf,
    /// Path to the gymdeck3 adaptive controller binary
    #[clap(long, default_value = "/usr/local/bin/gymdeck3")]
    gymdeck3_path: PathBuf,
    /// Start dynamic mode immediately
    #[clap(long)]
    dynamic: bool,
    /// Hand fan control to the adaptive controller using the active curve
    #[clap(long)]
    fan_control: bool,
    /// Enable game-only mode
    #[clap(long)]
    game_only: bool,
    /// Run a binning session and exit
    #[clap(long)]
    binning: bool,
    /// Stress command for binning; `{duration}` expands to seconds
    #[clap(long, default_value = "stress-ng --cpu 0 --timeout {duration}")]
    stress_cmd: String,
    /// Binning start value in millivolts
    #[clap(long, default_value_t = -10, allow_hyphen_values = true)]
    binning_start: i32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts: Opts = Opts::parse();
    let _ = cli::init_logging(opts.verbose);

    let settings_dir = opts
        .settings_dir
        .clone()
        .unwrap_or_else(SettingsManager::default_dir);
    let data_dir = opts.data_dir.clone().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".config").join("decktune")
    });

    let settings = Arc::new(SettingsManager::new(&settings_dir));
    let events: Arc<dyn EventSink> = Arc::new(LogSink);

    let capabilities = PlatformCapabilities::new(data_dir.join("platform"));
    let platform = capabilities.detect();
    log::info!(
        "Platform: {} ({}), safe limit {} mV",
        platform.model,
        platform.variant,
        platform.safe_limit
    );

    let invoker = Arc::new(PowerAdjustInvoker::new(
        &opts.ryzenadj_path,
        Arc::clone(&events),
    ));
    let crash_metrics = Arc::new(CrashMetricsStore::new(Arc::clone(&settings)));
    let safety = Arc::new(
        SafetyPolicy::new(Arc::clone(&settings), platform, invoker.clone())
            .with_crash_metrics(Arc::clone(&crash_metrics)),
    );

    if safety.check_boot_recovery().await {
        log::warn!("Boot recovery was performed");
    }

    let blackbox = Arc::new(BlackBox::new(data_dir.join("blackbox")));
    let stream = Arc::new(StatusStream::new());
    let telemetry = Arc::new(TelemetryBuffer::new());
    let sessions = Arc::new(SessionHistory::new(Arc::clone(&settings), &data_dir));

    if opts.binning {
        let driver = {
            let mut parts = opts.stress_cmd.split_whitespace();
            let program = parts.next().unwrap_or("stress-ng").to_string();
            let args: Vec<String> = parts.map(|s| s.to_string()).collect();
            Arc::new(CommandDriver::new(&program, &args))
        };

        let engine = BinningEngine::new(
            invoker.clone(),
            driver,
            Arc::clone(&safety),
            Arc::clone(&events),
        );

        let config = BinningConfig {
            start_value: opts.binning_start,
            ..BinningConfig::default()
        };

        let result = engine.start(config).await?;
        println!(
            "max_stable={} recommended={} iterations={} aborted={}",
            result.max_stable, result.recommended, result.iterations, result.aborted
        );
        return Ok(());
    }

    let recovery = Arc::new(ProgressiveRecovery::new(Arc::clone(&safety)));
    let watchdog = Arc::new(
        Watchdog::new(Arc::clone(&safety))
            .with_recovery(Arc::clone(&recovery))
            .with_blackbox(Arc::clone(&blackbox)),
    );
    watchdog.start().await;

    // The daemon's liveness proof: a wedged process stops producing
    // heartbeats and the monitor takes over.
    let heartbeat_writer = {
        let watchdog = Arc::clone(&watchdog);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                watchdog.write_heartbeat().await;
            }
        })
    };

    let controller = Arc::new(DynamicController::new(
        &opts.ryzenadj_path,
        &opts.gymdeck3_path,
        Arc::clone(&events),
        Arc::clone(&stream),
        Arc::clone(&blackbox),
        Arc::clone(&telemetry),
        Arc::clone(&sessions),
    ));

    if opts.dynamic {
        let mut config = DynamicConfig::default();

        if opts.fan_control {
            let fan_service = FanControlService::new(data_dir.join("fan_config.json"));
            let curve = fan_service.active_curve();
            config.fan = FanControlConfig {
                enabled: true,
                mode: "custom".to_string(),
                hysteresis_temp: 3,
                zero_rpm_enabled: false,
                curve: curve.points.iter().map(|p| (p.temp, p.speed)).collect(),
            };
        }

        if let Err(error) = controller.start(config).await {
            log::error!("Failed to start dynamic mode: {}", error);
        }
    }

    let game_controller = Arc::new(GameOnlyModeController::new(
        Arc::clone(&safety),
        Arc::clone(&events),
    ));
    let monitor = GameStateMonitor::new(game_controller.clone());

    if opts.game_only {
        game_controller.enable(&monitor).await;
    }

    log::info!("decktuned running");
    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");

    if game_controller.is_enabled() {
        game_controller.disable(&monitor).await;
    }
    controller.stop().await;
    heartbeat_writer.abort();
    watchdog.stop().await;
    stream.close();

    // Give any in-flight rollback a moment to finish.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
