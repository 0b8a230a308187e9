//! Owns the single worker's state: the USB handle, FTDI/MPSSE configuration,
//! and the reusable shift buffers. One `Session` is threaded explicitly
//! through the connection loop — no globals, no locking, matching the
//! single-client model.

use std::time::Duration;

use eyre::Result;
use xvcd_io::{Stats, usb};

/// Delay between successive `-g` GPIO steps, per spec §6.
const GPIO_STEP_DELAY: Duration = Duration::from_millis(100);

/// FTDI low-byte GPIO pin bits (TCK/TDI/TDO/TMS share the chip's low byte
/// with the JTAG lines; `-g` steps only ever touch the upper nibble).
const PIN_TCK: u8 = 0x1;
const PIN_TDI: u8 = 0x2;
const PIN_TMS: u8 = 0x8;
const TMS_DIR_MASK: u8 = PIN_TMS | PIN_TDI | PIN_TCK;

#[derive(Clone, Debug)]
pub struct Config {
    /// Max shift bits per request is `buffer_capacity * 8`; reported in
    /// `getinfo:`.
    pub buffer_capacity: usize,
    pub loopback: bool,
    pub runt_diagnostics: bool,
    pub locked_clock_hz: Option<u32>,
    pub statistics: bool,
    /// `-g` GPIO init sequence: `(direction, value)` pairs applied to the
    /// FTDI low byte, one every [`GPIO_STEP_DELAY`].
    pub gpio: Vec<(u8, u8)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_capacity: 2048,
            loopback: false,
            runt_diagnostics: false,
            locked_clock_hz: None,
            statistics: false,
            gpio: Vec::new(),
        }
    }
}

pub struct Session {
    pub usb: usb::Device,
    pub config: Config,
    pub tms: Vec<u8>,
    pub tdi: Vec<u8>,
    pub tdo: Vec<u8>,
    pub stats: Stats,
}

impl Session {
    pub fn new(mut usb: usb::Device, config: Config) -> Self {
        let cap = config.buffer_capacity;
        usb.runt_diagnostics = config.runt_diagnostics;
        Self {
            usb,
            config,
            tms: vec![0u8; cap],
            tdi: vec![0u8; cap],
            tdo: vec![0u8; cap],
            stats: Stats::default(),
        }
    }

    /// Applies the startup MPSSE state: disable loopback (unless `-L`),
    /// disable 3-phase clocking, the locked or default 10MHz clock, and
    /// drive TMS/TDI/TCK low with TMS held high.
    pub async fn apply_startup_state(&mut self) -> Result<()> {
        const DEFAULT_CLOCK_HZ: u32 = 10_000_000;
        let mut cmd = Vec::new();

        if self.config.loopback {
            xvcd_io::mpsse::enable_loopback(&mut cmd);
        } else {
            xvcd_io::mpsse::disable_loopback(&mut cmd);
        }
        xvcd_io::mpsse::disable_3phase(&mut cmd);

        let freq = self.config.locked_clock_hz.unwrap_or(DEFAULT_CLOCK_HZ);
        let (divisor, actual) = xvcd_io::clock::divisor_for_frequency(freq);
        warn_if_off_target(freq, actual);
        tracing::debug!(requested = freq, actual, divisor = %xvcd_io::Hex(divisor), "startup clock");
        xvcd_io::mpsse::disable_prescaler(&mut cmd);
        xvcd_io::mpsse::set_clock_divisor(&mut cmd, divisor);

        // TMS=1 held, TCK/TDI/TMS driven as outputs.
        xvcd_io::mpsse::set_low_byte(&mut cmd, PIN_TMS, TMS_DIR_MASK);

        self.usb.write(&cmd).await?;
        self.apply_gpio_sequence().await
    }

    /// Drives each `-g` step onto the FTDI low GPIO byte in turn, 100ms
    /// apart, per spec §6. Each step's low nibble becomes the value driven
    /// on the chip's upper GPIO bits (alongside a forced-high TMS) and its
    /// high nibble becomes their direction (alongside TMS/TDI/TCK, always
    /// outputs), matching the original `ftdiGPIO`. A no-op when `-g` wasn't
    /// given.
    async fn apply_gpio_sequence(&mut self) -> Result<()> {
        let steps = self.config.gpio.clone();
        let mut steps = steps.into_iter();
        let Some(first) = steps.next() else {
            return Ok(());
        };
        self.write_gpio_step(first).await?;
        for step in steps {
            smol::Timer::after(GPIO_STEP_DELAY).await;
            self.write_gpio_step(step).await?;
        }
        Ok(())
    }

    async fn write_gpio_step(&mut self, (direction, value): (u8, u8)) -> Result<()> {
        let mut cmd = Vec::new();
        xvcd_io::mpsse::set_low_byte(&mut cmd, (value << 4) | PIN_TMS, (direction << 4) | TMS_DIR_MASK);
        self.usb.write(&cmd).await
    }
}

fn warn_if_off_target(requested: u32, actual: u32) {
    let diff = requested.abs_diff(actual);
    if diff * 1000 > requested {
        tracing::warn!(requested, actual, "TCK frequency off by more than 0.1%");
    }
    if actual < 500_000 {
        tracing::warn!(actual, "TCK frequency below 500kHz");
    }
}
