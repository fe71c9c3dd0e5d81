use anyhow::{anyhow, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::prelude::*;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::mdns::EspMdns;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, BlockingWifi, ClientConfiguration, Configuration,
    EspWifi,
};
use log::{info, warn};
use sumobridge_command_lib::ModeController;

mod bot_uart;
mod config;
mod controls;
mod leds;
mod server;
#[cfg(feature = "tls")]
mod tls;

use bot_uart::{BotUart, EspBotModeSetup};
use config::Config;
use leds::StatusLeds;

/// Connection attempts before falling back to our own access point
const STA_CONNECT_ATTEMPTS: u32 = 5;

const STA_RETRY_DELAY_MS: u32 = 2000;

/// Announce `<hostname>.local` and the command listener
fn setup_mdns(hostname: &str, port: u16) -> Option<EspMdns> {
    match EspMdns::take() {
        Ok(mut m) => {
            let _ = m.set_hostname(hostname);
            let _ = m.set_instance_name("SumoBridge");
            let _ = m.add_service(None, "_http", "_tcp", port, &[]);
            info!("mDNS started: {hostname}.local");
            Some(m)
        }
        Err(e) => {
            warn!("Failed to start mDNS: {e:?}");
            None
        }
    }
}

fn try_connect_sta(wifi: &mut BlockingWifi<EspWifi<'static>>, config: &Config) -> Result<()> {
    let password = config.wifi.password.clone().unwrap_or_default();
    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi
            .ssid
            .as_str()
            .try_into()
            .map_err(|()| anyhow!("SSID too long: {}", config.wifi.ssid))?,
        password: password
            .as_str()
            .try_into()
            .map_err(|()| anyhow!("WiFi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;

    for attempt in 1..=STA_CONNECT_ATTEMPTS {
        info!(
            "Connecting to '{}' (attempt {attempt}/{STA_CONNECT_ATTEMPTS})...",
            config.wifi.ssid
        );
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
                info!("WiFi connected, IP {}", ip_info.ip);
                return Ok(());
            }
            Err(e) => {
                warn!("WiFi connection failed: {e}");
                let _ = wifi.disconnect();
                FreeRtos::delay_ms(STA_RETRY_DELAY_MS);
            }
        }
    }

    wifi.stop()?;
    Err(anyhow!("could not join '{}'", config.wifi.ssid))
}

fn start_ap(wifi: &mut BlockingWifi<EspWifi<'static>>, ap_ssid: &str) -> Result<()> {
    info!("Starting access point '{ap_ssid}'");
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ap_ssid
            .try_into()
            .map_err(|()| anyhow!("AP SSID too long: {ap_ssid}"))?,
        auth_method: AuthMethod::None,
        channel: 0,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;

    let ip_info = wifi.wifi().ap_netif().get_ip_info()?;
    info!("AP started - connect to '{ap_ssid}', commands go to {}", ip_info.ip);
    Ok(())
}

/// Join the configured network, or host an access point if there is none
/// or joining fails.
fn start_wifi(wifi: &mut BlockingWifi<EspWifi<'static>>, config: &Config) -> Result<()> {
    if config.wifi.ssid.is_empty() {
        info!("No WiFi network configured");
        return start_ap(wifi, &config.ap_ssid);
    }

    match try_connect_sta(wifi, config) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("{e}, falling back to access point");
            start_ap(wifi, &config.ap_ssid)
        }
    }
}

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Starting sumobridge firmware {}...", env!("GIT_VERSION"));

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Initialize NVS for config storage
    config::init_nvs(nvs.clone())?;
    let config = Config::load_or_default();

    // Apply configured log level
    let level = config.log_level.as_level_filter();
    if let Err(e) = esp_idf_svc::log::set_target_level("*", level) {
        warn!("Failed to set log level: {e}");
    } else {
        info!("Log level set to {:?}", config.log_level);
    }

    let mut leds = StatusLeds::new(config.leds.primary_pin, config.leds.secondary_pin)?;
    leds.boot_animation();

    info!("Initializing WiFi...");
    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    start_wifi(&mut wifi, &config)?;

    let _mdns = setup_mdns(&config.hostname, config.listen_port);

    let mut controller = ModeController::<BotUart>::new();
    let (activate_tx, activate_rx) = oneshot::channel();
    controls::start_button_task(config.button_pin, controller.handle(), activate_tx)?;

    let mut setup = EspBotModeSetup::new(
        peripherals.uart0,
        config.uart.clone(),
        config.settle_ms,
        leds,
    );

    info!("Ready in {} mode", controller.mode());
    server::run(&config, &mut controller, &mut setup, activate_rx)
}
