//! Two plain indicator LEDs
//!
//! At boot both LEDs flash in turn. During the switch to bot mode the primary
//! LED is lit while the mode is announced, goes dark while the console is
//! handed over, and stays lit once the bot UART is up.

use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{AnyIOPin, Output, PinDriver};
use log::{debug, warn};

/// How long an LED stays lit per boot flash
const FLASH_ON_MS: u32 = 20;

/// Dark time after each boot flash
const FLASH_OFF_MS: u32 = 80;

/// Flashes per LED in the boot pattern
const BOOT_FLASHES: usize = 3;

pub struct StatusLeds {
    primary: PinDriver<'static, AnyIOPin, Output>,
    secondary: PinDriver<'static, AnyIOPin, Output>,
}

impl StatusLeds {
    pub fn new(primary_pin: u8, secondary_pin: u8) -> Result<Self> {
        debug!("Creating status LEDs on GPIO {primary_pin} and {secondary_pin}");
        // SAFETY: We trust the user-configured GPIO pin numbers are valid for this board
        let primary = PinDriver::output(unsafe { AnyIOPin::new(i32::from(primary_pin)) })?;
        let secondary = PinDriver::output(unsafe { AnyIOPin::new(i32::from(secondary_pin)) })?;

        let mut leds = Self { primary, secondary };
        leds.set_primary(false);
        leds.set_secondary(false);
        Ok(leds)
    }

    pub fn set_primary(&mut self, on: bool) {
        if let Err(e) = set_level(&mut self.primary, on) {
            warn!("Failed to set primary LED: {e:?}");
        }
    }

    pub fn set_secondary(&mut self, on: bool) {
        if let Err(e) = set_level(&mut self.secondary, on) {
            warn!("Failed to set secondary LED: {e:?}");
        }
    }

    /// Flash primary, secondary, primary, ... as a boot indicator
    pub fn boot_animation(&mut self) {
        for _ in 0..BOOT_FLASHES {
            self.set_primary(true);
            FreeRtos::delay_ms(FLASH_ON_MS);
            self.set_primary(false);
            FreeRtos::delay_ms(FLASH_OFF_MS);

            self.set_secondary(true);
            FreeRtos::delay_ms(FLASH_ON_MS);
            self.set_secondary(false);
            FreeRtos::delay_ms(FLASH_OFF_MS);
        }
    }
}

fn set_level(
    pin: &mut PinDriver<'static, AnyIOPin, Output>,
    on: bool,
) -> Result<(), esp_idf_hal::sys::EspError> {
    if on {
        pin.set_high()
    } else {
        pin.set_low()
    }
}
