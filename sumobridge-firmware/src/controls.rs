//! Bot mode button task
//!
//! The GPIO interrupt only notifies this task. The task debounces the press
//! and posts a single activation request to the accept loop, which runs the
//! actual mode switch between connections.
//!
//! The task runs under the task watchdog (TWDT) as user `bot_button` and
//! wakes at least once per [`POLL_INTERVAL`] to feed it.
//!
//! ## Hardware wiring
//!
//! The internal pull-up is enabled. The button connects the GPIO pin to GND
//! when pressed (falling edge).

use core::num::NonZero;
use std::ffi::CStr;
use std::time::{Duration, Instant};

use anyhow::Result;
use esp_idf_hal::delay::TickType;
use esp_idf_hal::gpio::{AnyIOPin, Input, InterruptType, PinDriver, Pull};
use esp_idf_hal::task::notification::Notification;
use esp_idf_hal::task::thread::ThreadSpawnConfiguration;
use esp_idf_sys::{
    esp, esp_task_wdt_add_user, esp_task_wdt_delete_user, esp_task_wdt_reset_user,
    esp_task_wdt_user_handle_t, EspError,
};
use log::{debug, error, info, warn};
use sumobridge_command_lib::ModeHandle;

/// FreeRTOS task name, also the watchdog user name
const TASK_NAME: &CStr = c"bot_button";

/// Minimum time between button presses (debounce)
const BUTTON_DEBOUNCE: Duration = Duration::from_millis(200);

/// Longest wait for a press before feeding the watchdog again
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Initialize the bot mode button with interrupt support.
///
/// Returns the button driver and the notification its interrupt signals.
fn init_button(button_pin: u8) -> Option<(PinDriver<'static, AnyIOPin, Input>, Notification)> {
    // SAFETY: We trust the user-configured GPIO pin number is valid
    let pin = unsafe { AnyIOPin::new(i32::from(button_pin)) };

    let mut button = match PinDriver::input(pin) {
        Ok(b) => b,
        Err(e) => {
            warn!("Failed to initialize button on GPIO {button_pin}: {e:?}");
            return None;
        }
    };

    if let Err(e) = button.set_pull(Pull::Up) {
        warn!("Failed to set button pull-up: {e:?}");
        return None;
    }

    if let Err(e) = button.set_interrupt_type(InterruptType::NegEdge) {
        warn!("Failed to set button interrupt type: {e:?}");
        return None;
    }

    Some((button, Notification::new()))
}

/// Watchdog subscription of the button task, dropped with the task
struct TaskWatchdog(esp_task_wdt_user_handle_t);

impl TaskWatchdog {
    fn subscribe() -> Result<Self, EspError> {
        let mut handle: esp_task_wdt_user_handle_t = std::ptr::null_mut();
        // SAFETY: TASK_NAME is static and NUL-terminated, handle is a valid out pointer
        esp!(unsafe { esp_task_wdt_add_user(TASK_NAME.as_ptr(), &mut handle) })?;
        debug!("Watchdog: subscribed {TASK_NAME:?}");
        Ok(Self(handle))
    }

    fn feed(&self) {
        // SAFETY: handle came from a successful esp_task_wdt_add_user
        if let Err(e) = esp!(unsafe { esp_task_wdt_reset_user(self.0) }) {
            error!("Watchdog: failed to feed {TASK_NAME:?}: {e}");
        }
    }
}

impl Drop for TaskWatchdog {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful esp_task_wdt_add_user
        if let Err(e) = esp!(unsafe { esp_task_wdt_delete_user(self.0) }) {
            error!("Watchdog: failed to unsubscribe {TASK_NAME:?}: {e}");
        }
    }
}

/// Start the button task.
///
/// `activate_tx` is consumed by the first accepted press; later presses only
/// log. The FreeRTOS task name is set through `ThreadSpawnConfiguration`,
/// since `std::thread::Builder::name` only renames the pthread after the task
/// already exists.
pub fn start_button_task(
    button_pin: u8,
    mode: ModeHandle,
    activate_tx: oneshot::Sender<()>,
) -> Result<()> {
    let prev_conf = ThreadSpawnConfiguration::get();
    ThreadSpawnConfiguration {
        name: Some(TASK_NAME.to_bytes_with_nul()),
        ..Default::default()
    }
    .set()?;

    let spawned = std::thread::Builder::new().spawn(move || {
        button_task(button_pin, &mode, activate_tx);
    });

    if let Some(prev) = prev_conf {
        prev.set()?;
    }
    spawned?;
    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // sender is intentionally moved into this task
fn button_task(button_pin: u8, mode: &ModeHandle, activate_tx: oneshot::Sender<()>) {
    info!("Initializing bot mode button on GPIO {button_pin}...");
    let Some((mut button, notification)) = init_button(button_pin) else {
        warn!("Bot mode button unavailable, device stays in {} mode", mode.current());
        return;
    };

    let watchdog = match TaskWatchdog::subscribe() {
        Ok(watchdog) => Some(watchdog),
        Err(e) => {
            warn!("Watchdog unavailable for button task: {e}");
            None
        }
    };
    info!("Bot mode button task started");

    let mut activate_tx = Some(activate_tx);
    let mut last_press = Instant::now()
        .checked_sub(BUTTON_DEBOUNCE)
        .unwrap_or_else(Instant::now);
    let poll_ticks = TickType::from(POLL_INTERVAL).ticks();

    loop {
        if let Some(watchdog) = &watchdog {
            watchdog.feed();
        }

        // Re-register the interrupt callback and enable it
        // SAFETY: The callback only notifies, no unsafe operations
        let waker = notification.notifier();
        let subscribe_ok = unsafe {
            button.subscribe_nonstatic(move || {
                waker.notify(NonZero::new(1).unwrap());
            })
        }
        .is_ok();

        if subscribe_ok {
            let _ = button.enable_interrupt();
        }

        // Returns Some if notified before timeout
        if notification.wait(poll_ticks).is_none() {
            continue;
        }
        if last_press.elapsed() < BUTTON_DEBOUNCE {
            debug!("Button bounce ignored");
            continue;
        }
        last_press = Instant::now();

        match activate_tx.take() {
            Some(tx) => {
                info!("Button: requesting bot mode");
                if tx.send(()).is_err() {
                    warn!("Button: accept loop is gone, bot mode request lost");
                }
            }
            None if mode.is_bot() => debug!("Button: bot mode already active"),
            None => debug!("Button: bot mode already requested"),
        }
    }
}
