use anyhow::{anyhow, Result};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_svc::sys::{esp_mac_type_t_ESP_MAC_WIFI_STA, esp_read_mac};
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sumobridge_command_lib::ScanLimits;

const AP_SSID_PREFIX: &str = "SumoBridge-";

/// Read WiFi STA MAC address from eFuse (available before WiFi driver init)
fn get_wifi_sta_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    // SAFETY: esp_read_mac just reads from eFuse, no driver needed
    unsafe {
        esp_read_mac(mac.as_mut_ptr(), esp_mac_type_t_ESP_MAC_WIFI_STA);
    }
    mac
}

/// Generate default AP SSID from WiFi MAC address
pub fn default_ap_ssid() -> String {
    let mac = get_wifi_sta_mac();
    format!("{AP_SSID_PREFIX}{:02X}{:02X}", mac[4], mac[5])
}

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

const NVS_NAMESPACE: &str = "sumobridge";
const NVS_CONFIG_KEY: &str = "config";

// Global NVS handle - initialized once in main
static NVS: Mutex<Option<EspNvs<NvsDefault>>> = Mutex::new(None);

pub fn init_nvs(nvs_partition: EspNvsPartition<NvsDefault>) -> Result<()> {
    debug!("Initializing NVS namespace: {NVS_NAMESPACE}");
    let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;
    *NVS.lock().unwrap() = Some(nvs);
    info!("NVS initialized");
    Ok(())
}

/// Network to join. An empty SSID makes the bridge start its own access point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: option_env!("SUMOBRIDGE_WIFI_SSID").unwrap_or_default().to_string(),
            password: option_env!("SUMOBRIDGE_WIFI_PASSWORD").map(str::to_string),
        }
    }
}

/// TLS settings for the command listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Server certificate, PEM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    /// Private key for `cert_pem`, PEM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
}

/// Pins used by the bot UART once bot mode is active
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UartConfig {
    #[serde(default = "default_uart_tx_pin")]
    pub tx_pin: u8,
    #[serde(default = "default_uart_rx_pin")]
    pub rx_pin: u8,
}

// UART0 default pins on the ESP32 (shared with the console)
const fn default_uart_tx_pin() -> u8 {
    1
}

const fn default_uart_rx_pin() -> u8 {
    3
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            tx_pin: default_uart_tx_pin(),
            rx_pin: default_uart_rx_pin(),
        }
    }
}

/// Indicator LEDs (active high)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedConfig {
    /// Blinks at boot and shows bot mode
    #[serde(default = "default_primary_led_pin")]
    pub primary_pin: u8,
    /// Blinks at boot, alternating with the primary LED
    #[serde(default = "default_secondary_led_pin")]
    pub secondary_pin: u8,
}

const fn default_primary_led_pin() -> u8 {
    4
}

const fn default_secondary_led_pin() -> u8 {
    5
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            primary_pin: default_primary_led_pin(),
            secondary_pin: default_secondary_led_pin(),
        }
    }
}

/// Request scanning caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    #[serde(default = "default_max_body_lines")]
    pub max_body_lines: usize,
}

fn default_max_line_len() -> usize {
    ScanLimits::default().max_line_len
}

fn default_max_body_lines() -> usize {
    ScanLimits::default().max_body_lines
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_line_len: default_max_line_len(),
            max_body_lines: default_max_body_lines(),
        }
    }
}

impl ScanConfig {
    pub fn limits(&self) -> ScanLimits {
        ScanLimits {
            max_line_len: self.max_line_len,
            max_body_lines: self.max_body_lines,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub wifi: WifiConfig,
    /// AP SSID when no network is configured (defaults to "SumoBridge-XXXX")
    #[serde(default = "default_ap_ssid")]
    pub ap_ssid: String,
    /// mDNS hostname, announced as `<hostname>.local`
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub uart: UartConfig,
    /// Bot mode button, pulled up, active low
    #[serde(default = "default_button_pin")]
    pub button_pin: u8,
    #[serde(default)]
    pub leds: LedConfig,
    /// Delay around the console handover when entering bot mode (ms)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u32,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_hostname() -> String {
    "sumobridge".to_string()
}

const fn default_listen_port() -> u16 {
    8443
}

const fn default_button_pin() -> u8 {
    2
}

const fn default_settle_ms() -> u32 {
    1000
}

/// Longest settle delay accepted from config
pub const MAX_SETTLE_MS: u32 = 5000;

impl Default for Config {
    fn default() -> Self {
        Self {
            wifi: WifiConfig::default(),
            ap_ssid: default_ap_ssid(),
            hostname: default_hostname(),
            listen_port: default_listen_port(),
            tls: TlsConfig::default(),
            uart: UartConfig::default(),
            button_pin: default_button_pin(),
            leds: LedConfig::default(),
            settle_ms: default_settle_ms(),
            scan: ScanConfig::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        if self.ap_ssid.is_empty() {
            warn!("AP SSID is empty, resetting to default");
            self.ap_ssid = default_ap_ssid();
        }
        if self.hostname.is_empty() {
            warn!("Hostname is empty, resetting to default");
            self.hostname = default_hostname();
        }
        if self.listen_port == 0 {
            warn!("Listen port is 0, resetting to {}", default_listen_port());
            self.listen_port = default_listen_port();
        }
        if self.settle_ms > MAX_SETTLE_MS {
            warn!("Clamping settle_ms from {} to {MAX_SETTLE_MS}", self.settle_ms);
            self.settle_ms = MAX_SETTLE_MS;
        }
        let limits = self.scan.limits();
        let clamped = limits.clamped();
        if clamped != limits {
            warn!("Clamping scan limits from {limits:?} to {clamped:?}");
            self.scan = ScanConfig {
                max_line_len: clamped.max_line_len,
                max_body_lines: clamped.max_body_lines,
            };
        }
        if self.tls.enabled && (self.tls.cert_pem.is_none() || self.tls.key_pem.is_none()) {
            warn!("TLS enabled without certificate and key, serving plain TCP");
            self.tls.enabled = false;
        }
    }

    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(mut config) => {
                info!("Loaded config from NVS");
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config from NVS: {e}, using defaults");
                let config = Self::default();
                // Persist so the blob exists for later editing
                if let Err(e) = config.save() {
                    warn!("Failed to save default config: {e}");
                }
                config
            }
        }
    }

    pub fn load() -> Result<Self> {
        debug!("Loading config from NVS");
        let nvs_guard = NVS.lock().unwrap();
        let nvs = nvs_guard.as_ref().ok_or_else(|| anyhow!("NVS not initialized"))?;

        // Get the blob length first
        let len = nvs.blob_len(NVS_CONFIG_KEY)?;
        if let Some(len) = len {
            debug!("Config blob size: {len} bytes");
            let mut buf = vec![0u8; len];
            nvs.get_blob(NVS_CONFIG_KEY, &mut buf)?;
            let config: Config = serde_json::from_slice(&buf)?;
            debug!(
                "Config parsed: wifi.ssid={:?}, listen_port={}, log_level={:?}",
                config.wifi.ssid, config.listen_port, config.log_level
            );
            Ok(config)
        } else {
            Err(anyhow!("No config found in NVS"))
        }
    }

    pub fn save(&self) -> Result<()> {
        debug!("Saving config to NVS");
        let mut nvs_guard = NVS.lock().unwrap();
        let nvs = nvs_guard.as_mut().ok_or_else(|| anyhow!("NVS not initialized"))?;

        let json = serde_json::to_vec(self)?;
        debug!("Config JSON size: {} bytes", json.len());
        nvs.set_blob(NVS_CONFIG_KEY, &json)?;
        info!("Config saved to NVS");
        Ok(())
    }
}
