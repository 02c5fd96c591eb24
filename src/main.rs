//! inkgate entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;

use inkgate::config::{self, Settings};
use inkgate::logging::{self, LogConfig, LogFormat, LogOutput};
use inkgate::runtime::{
    sync_handler, ActionError, Element, MainElement, RegisteredAction, Runtime,
};
use inkgate::server::ApiCoordinator;

#[derive(Parser, Debug)]
#[command(name = "inkgate")]
#[command(about = "REST and WebSocket API server for inkBoard dashboards", long_about = None)]
#[command(version)]
struct Args {
    /// Settings file to load instead of the discovered one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Port to serve on, overriding the settings file
    #[arg(long)]
    port: Option<u16>,

    /// Bind mode (loopback, lan, auto, all, or an address), overriding the settings file
    #[arg(long)]
    bind: Option<String>,

    /// Log level, overriding the settings file
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut settings = load_settings(&args);
    if let Some(port) = args.port {
        settings.api.port = port;
    }
    if let Some(bind) = &args.bind {
        settings.api.bind = bind.clone();
    }
    if let Some(level) = &args.log_level {
        settings.log.level = level.clone();
    }

    init_logging(&settings)?;

    let runtime = build_runtime();
    let coordinator = Arc::new(ApiCoordinator::new(runtime.clone(), &settings.api));

    info!(
        "inkgate {} starting (bind {}, port {})",
        env!("CARGO_PKG_VERSION"),
        settings.api.bind,
        settings.api.port
    );

    let clock = runtime.elements().get("clock")?;
    let clock_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let time = Utc::now().format("%H:%M:%S").to_string();
            clock.set_property("time", Value::String(time));
        }
    });

    let listen_task = tokio::spawn(coordinator.clone().listen());

    let reason = await_shutdown_trigger().await;
    info!("Shutdown signal received ({})", reason);

    listen_task.abort();
    clock_task.abort();
    coordinator.stop().await;
    info!("inkgate stopped");
    Ok(())
}

fn load_settings(args: &Args) -> Settings {
    let loaded = match &args.config {
        Some(path) => config::load_settings_from(path),
        None => config::load_settings(),
    };
    match loaded {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("could not load settings ({err}), continuing with defaults");
            Settings::default()
        }
    }
}

fn init_logging(settings: &Settings) -> Result<(), logging::LoggingError> {
    let format = if settings.log.format.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Plaintext
    };
    logging::init_logging(LogConfig {
        format,
        output: LogOutput::Stdout,
        default_level: logging::parse_level(&settings.log.level),
    })
}

/// Builds the simulated dashboard this binary serves: a tabbed main element,
/// a clock, two popups, and a small action surface.
fn build_runtime() -> Arc<Runtime> {
    let runtime = Arc::new(Runtime::simulated("inkgate").with_integration("api"));

    runtime.screen().set_main_element(MainElement {
        id: "main-tabs".to_string(),
        type_name: "TabPages".to_string(),
        tabs: Some(vec!["home".to_string(), "climate".to_string()]),
        current_tab: Some("home".to_string()),
    });
    runtime.screen().register_popup("settings");
    runtime.screen().register_popup("notifications");

    runtime.elements().register(Element::new(
        "clock",
        "DigitalClock",
        [("time".to_string(), json!("00:00:00"))],
    ));
    runtime.elements().register(Element::new(
        "status-bar",
        "StatusBar",
        [
            ("message".to_string(), json!("ready")),
            ("visible".to_string(), json!(true)),
        ],
    ));

    runtime.actions().register(RegisteredAction::new(
        "ping",
        sync_handler(|_| Ok(Value::Null)),
    ));
    runtime.actions().register(
        RegisteredAction::new("echo", sync_handler(|kwargs| Ok(Value::Object(kwargs))))
            .accepting_any(),
    );
    runtime.actions().register(
        RegisteredAction::new(
            "set-status",
            sync_handler(|kwargs| Ok(kwargs.get("message").cloned().unwrap_or(Value::Null))),
        )
        .with_required(&["message"]),
    );

    let handle = runtime.clone();
    runtime.actions().register_group(
        "popup",
        Arc::new(move |action, options| {
            let popup = options.get("popup")?.as_str()?.to_string();
            let target = handle.clone();
            match action {
                "show" => Some(RegisteredAction::new(
                    "popup:show",
                    sync_handler(move |_| {
                        target
                            .screen()
                            .show_popup(&popup)
                            .map_err(|err| ActionError::Failed(err.to_string()))?;
                        Ok(Value::Null)
                    }),
                )),
                "close" => Some(RegisteredAction::new(
                    "popup:close",
                    sync_handler(move |_| {
                        target.screen().close_popup(&popup);
                        Ok(Value::Null)
                    }),
                )),
                _ => None,
            }
        }),
    );

    runtime
}

/// Resolves once a shutdown signal arrives, naming the signal that fired.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::warn;

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        panic!("failed to install Ctrl+C handler: {err}");
                    }
                    "ctrl-c"
                }
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(err) => {
            warn!("could not install SIGTERM handler ({}), using Ctrl+C only", err);
            if let Err(err) = tokio::signal::ctrl_c().await {
                panic!("failed to install Ctrl+C handler: {err}");
            }
            "ctrl-c"
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        panic!("failed to install Ctrl+C handler: {err}");
    }
    "ctrl-c"
}
