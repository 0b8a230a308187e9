//! Command-line surface: flags map 1:1 onto the original tool's one-letter
//! options so existing invocations keep working.

use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
    str::FromStr,
};

use color_eyre::eyre::{OptionExt, eyre};

#[derive(clap::Parser)]
#[command(version, about = "XVC-to-FTDI/MPSSE JTAG gateway")]
pub struct Args {
    /// Bind address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    pub addr: IpAddr,

    /// TCP port
    #[arg(short = 'p', long, default_value_t = 2542)]
    pub port: u16,

    /// USB vendor:product[:serial], hex vendor/product, optional serial filter
    #[arg(short = 'd', long)]
    pub device: Option<UsbFilter>,

    /// GPIO init sequence, dir_val pairs in hex, colon-separated, 100ms apart
    #[arg(short = 'g', long)]
    pub gpio: Option<GpioSequence>,

    /// Lock the TCK frequency (accepts a `k`/`M` suffix), ignoring client settck
    #[arg(short = 'c', long)]
    pub clock: Option<Frequency>,

    /// Quiet: suppress informational logging
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Enable MPSSE loopback self-test mode
    #[arg(short = 'L', long)]
    pub loopback: bool,

    /// Emit runt-packet diagnostics
    #[arg(short = 'R', long)]
    pub runt_diagnostics: bool,

    /// Print traffic statistics when a connection tears down
    #[arg(short = 'S', long)]
    pub statistics: bool,

    /// Log USB traffic
    #[arg(short = 'U', long, alias = "u")]
    pub log_usb: bool,

    /// Log XVC traffic
    #[arg(short = 'X', long, alias = "x")]
    pub log_xvc: bool,

    /// Use the second MPSSE interface on a multi-interface FTDI chip
    #[arg(short = 'B', long)]
    pub second_interface: bool,
}

/// `vendor:product[:serial]`, hex vendor/product IDs with an optional
/// serial-number substring filter.
#[derive(Debug, Clone)]
pub struct UsbFilter {
    pub vendor: u16,
    pub product: u16,
    pub serial: Option<String>,
}

impl FromStr for UsbFilter {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let vendor = parts.next().ok_or_eyre("missing vendor id")?;
        let product = parts.next().ok_or_eyre("missing ':product' in -d argument")?;
        let serial = parts.next().filter(|s| !s.is_empty()).map(str::to_owned);
        let vendor = u16::from_str_radix(vendor, 16)?;
        let product = u16::from_str_radix(product, 16)?;
        Ok(Self {
            vendor,
            product,
            serial,
        })
    }
}

impl Display for UsbFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)?;
        if let Some(serial) = &self.serial {
            write!(f, ":{serial}")?;
        }
        Ok(())
    }
}

/// `dir_val[:dir_val...]`: each step is a single hex byte whose high nibble
/// is the direction for the chip's upper GPIO nibble (bits 4..7 of the FTDI
/// low byte) and whose low nibble is the value to drive on them, matching
/// the original tool's `ftdiGPIO` (`direction = value >> 4; value &= 0xF`).
#[derive(Debug, Clone)]
pub struct GpioSequence(pub Vec<(u8, u8)>);

impl FromStr for GpioSequence {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let steps = s
            .split(':')
            .map(|step| {
                let byte = u8::from_str_radix(step, 16)?;
                Ok((byte >> 4, byte & 0xF))
            })
            .collect::<Result<Vec<_>, color_eyre::eyre::Error>>()?;
        if steps.is_empty() {
            return Err(eyre!("GPIO sequence must have at least one step"));
        }
        Ok(Self(steps))
    }
}

/// A requested TCK frequency, accepting an optional `k` (kHz) or `M` (MHz)
/// suffix as the original tool's `-c` flag does.
#[derive(Debug, Clone, Copy)]
pub struct Frequency(pub u32);

impl FromStr for Frequency {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (digits, multiplier) = match s.chars().last() {
            Some('k') | Some('K') => (&s[..s.len() - 1], 1_000),
            Some('M') => (&s[..s.len() - 1], 1_000_000),
            _ => (s, 1),
        };
        let value: u32 = digits.parse()?;
        Ok(Self(value.checked_mul(multiplier).ok_or_eyre("frequency overflow")?))
    }
}
