//! Console-to-bot UART handover
//!
//! On the ESP32 the diagnostic console lives on UART0. Entering bot mode
//! silences every log output on that line and then installs a 9600 8N1
//! driver on the same peripheral for the motor controller.

use std::io;

use esp_idf_hal::delay::{FreeRtos, BLOCK};
use esp_idf_hal::gpio::AnyIOPin;
use esp_idf_hal::prelude::*;
use esp_idf_hal::uart::config::{Config as UartDriverConfig, DataBits, StopBits};
use esp_idf_hal::uart::{UartDriver, UART0};
use esp_idf_svc::sys::{esp_log_level_set, esp_log_level_t_ESP_LOG_NONE};
use log::{info, warn, LevelFilter};
use sumobridge_command_lib::BotModeSetup;

use crate::config::UartConfig;
use crate::leds::StatusLeds;

/// Baud rate the motor controller listens on
pub const BOT_BAUD_RATE: u32 = 9600;

/// UART driver owned by the forwarder once bot mode is active
pub struct BotUart(UartDriver<'static>);

impl io::Write for BotUart {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.wait_tx_done(BLOCK).map_err(io::Error::other)
    }
}

/// ESP32 side of the NORMAL -> BOT transition
pub struct EspBotModeSetup {
    /// Taken when the bot UART is built
    uart: Option<UART0>,
    pins: UartConfig,
    settle_ms: u32,
    leds: StatusLeds,
}

impl EspBotModeSetup {
    pub fn new(uart: UART0, pins: UartConfig, settle_ms: u32, leds: StatusLeds) -> Self {
        Self {
            uart: Some(uart),
            pins,
            settle_ms,
            leds,
        }
    }
}

impl BotModeSetup for EspBotModeSetup {
    type Serial = BotUart;

    /// Silences the `log` crate and the ESP-IDF log. The stdout VFS stays on
    /// UART0, so anything printed with `println!` after this reaches the bot.
    fn release_console(&mut self) {
        self.leds.set_primary(true);
        info!("BOT MODE {BOT_BAUD_RATE}bps");
        // Let the announcement drain before the console goes quiet
        FreeRtos::delay_ms(self.settle_ms);
        self.leds.set_primary(false);

        if let Err(e) = esp_idf_svc::log::set_target_level("*", LevelFilter::Off) {
            warn!("Failed to silence log targets: {e}");
        }
        log::set_max_level(LevelFilter::Off);
        // SAFETY: static NUL-terminated tag, ESP-IDF copies what it needs
        unsafe { esp_log_level_set(c"*".as_ptr(), esp_log_level_t_ESP_LOG_NONE) };
    }

    fn settle(&mut self) {
        FreeRtos::delay_ms(self.settle_ms);
    }

    fn open_serial(&mut self) -> io::Result<BotUart> {
        let uart = self.uart.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "UART0 already claimed")
        })?;

        // SAFETY: We trust the user-configured GPIO pin numbers are valid for this board
        let tx = unsafe { AnyIOPin::new(i32::from(self.pins.tx_pin)) };
        let rx = unsafe { AnyIOPin::new(i32::from(self.pins.rx_pin)) };

        let config = UartDriverConfig::new()
            .baudrate(Hertz(BOT_BAUD_RATE))
            .data_bits(DataBits::DataBits8)
            .parity_none()
            .stop_bits(StopBits::STOP1);

        let driver = UartDriver::new(
            uart,
            tx,
            rx,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &config,
        )
        .map_err(io::Error::other)?;

        self.leds.set_primary(true);
        Ok(BotUart(driver))
    }
}
