mod adapter;
mod central;
mod coordinator;
mod debug_server;
mod derived_state;
mod framer;
mod ftms_protocol;
mod peripheral;
mod state;
mod vendor_codec;

use std::process::ExitCode;
use std::sync::Arc;

use adapter::{AdapterControl, BluerAdapterControl, NoopAdapterControl};
use state::Shared;

const DEFAULT_VENDOR_DEVICE_NAME: &str = "I_TL";
const DEFAULT_PERIPHERAL_NAME: &str = "I_TL Bridge";
const DEFAULT_DEBUG_PORT: u16 = 8826;

struct Config {
    device_name: String,
    peripheral_name: String,
    debug_port: u16,
    verbose: bool,
    mock: bool,
    platform_pi: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_VENDOR_DEVICE_NAME.to_string(),
            peripheral_name: DEFAULT_PERIPHERAL_NAME.to_string(),
            debug_port: DEFAULT_DEBUG_PORT,
            verbose: false,
            mock: false,
            platform_pi: false,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = parse_args();

    if config.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::init();
    }

    log::info!(
        "itl-ftms-bridge starting, device-name: {}, peripheral-name: {}, debug-port: {}, mock: {}",
        config.device_name, config.peripheral_name, config.debug_port, config.mock,
    );

    let shared = Arc::new(Shared::new());

    let session = match bluer::Session::new().await {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to open BlueZ session: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let adapter = match session.default_adapter().await {
        Ok(a) => a,
        Err(e) => {
            log::error!("no BLE adapter available: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = adapter.set_powered(true).await {
        log::error!("failed to power on adapter: {}", e);
        return ExitCode::FAILURE;
    }

    let adapter_control: Arc<dyn AdapterControl> = if config.platform_pi {
        Arc::new(BluerAdapterControl::new(adapter.clone()))
    } else {
        Arc::new(NoopAdapterControl)
    };

    let central_shared = shared.clone();
    let central_control = adapter_control.clone();
    let central_device_name = config.device_name.clone();

    let peripheral_shared = shared.clone();
    let peripheral_adapter = adapter.clone();
    let peripheral_name = config.peripheral_name.clone();

    let coordinator_shared = shared.clone();
    let coordinator_control = adapter_control.clone();

    let debug_shared = shared.clone();
    let debug_port = config.debug_port;

    let central_task = async {
        if config.mock {
            log::info!("mock mode: central session disabled, drive telemetry via the debug server's 'mock' command");
            std::future::pending::<()>().await;
            Ok(())
        } else {
            central::run(central_shared, central_control, central_device_name).await
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal");
        }
        result = central_task => {
            if let Err(e) = result {
                log::error!("central session exited with error: {}", e);
            }
        }
        result = peripheral::run(peripheral_shared, peripheral_adapter, peripheral_name) => {
            if let Err(e) = result {
                log::error!("peripheral server exited with error: {}", e);
            }
        }
        _ = coordinator::run(coordinator_shared, coordinator_control) => {}
        result = debug_server::run(debug_shared, debug_port) => {
            if let Err(e) = result {
                log::error!("debug server exited with error: {}", e);
            }
        }
    }

    log::info!("itl-ftms-bridge shutting down");
    ExitCode::SUCCESS
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--device-name" => {
                if let Some(v) = args.get(i + 1) {
                    config.device_name = v.clone();
                    i += 1;
                }
            }
            "--peripheral-name" => {
                if let Some(v) = args.get(i + 1) {
                    config.peripheral_name = v.clone();
                    i += 1;
                }
            }
            "--debug-port" => {
                if let Some(v) = args.get(i + 1) {
                    config.debug_port = v.parse().unwrap_or(DEFAULT_DEBUG_PORT);
                    i += 1;
                }
            }
            "--verbose" => config.verbose = true,
            "--mock" => config.mock = true,
            "--platform-pi" => config.platform_pi = true,
            _ => {}
        }
        i += 1;
    }
    config
}
