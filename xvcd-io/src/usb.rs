//! Async USB transport to an FT2232H/FT232H MPSSE interface.
//!
//! Speaks libftdi's vendor control-request set directly over `nusb` rather
//! than linking libftdi: the only things this gateway ever needs from the
//! chip are a handful of control requests at setup time and a bulk pipe
//! carrying MPSSE command bytes out and status-prefixed response bytes in.

use std::time::Duration;

use eyre::{Result, eyre};
use nusb::transfer::{ControlOut, ControlType, Recipient};

use crate::SpaceHex;

/// Default FTDI vendor ID; `-d` overrides the product ID.
pub const DEFAULT_VENDOR: u16 = 0x0403;
/// Product IDs accepted when `-d` doesn't name one: FT2232H, FT4232H, FT232H.
pub const DEFAULT_PRODUCTS: [u16; 3] = [0x6010, 0x6011, 0x6014];

/// Which MPSSE-capable interface of a multi-interface chip to claim.
/// `ftdiJTAGindex` in the original tooling: interface A by default, B when
/// `-B` selects the second interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interface {
    A,
    B,
}

impl Interface {
    const fn number(self) -> u8 {
        match self {
            Interface::A => 0,
            Interface::B => 1,
        }
    }

    /// Bulk endpoint addresses, per FTDI's fixed interface-to-endpoint map.
    const fn endpoints(self) -> (u8, u8) {
        match self {
            Interface::A => (0x02, 0x81),
            Interface::B => (0x04, 0x83),
        }
    }
}

mod requests {
    pub const RESET: u8 = 0;
    pub const SET_LATENCY_TIMER: u8 = 0x09;
    pub const SET_BITMODE: u8 = 0x0B;
}

mod reset_arg {
    pub const RESET_SIO: u16 = 0x00;
    pub const PURGE_RX: u16 = 0x01;
    pub const PURGE_TX: u16 = 0x02;
}

/// `SET_BITMODE` wValue: high byte selects MPSSE mode, low byte is the
/// direction mask for the chip's low GPIO byte — bit 0 TCK, bit 1 TDI, bit 3
/// TMS must be outputs for the gateway to drive the JTAG bus at all.
const BITMODE_MPSSE: u16 = 0x02_0B;
const LATENCY_TIMER_MS: u16 = 2;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Every bulk-in packet from the chip begins with 2 modem-status bytes.
const STATUS_PREFIX_LEN: usize = 2;
const FALLBACK_PACKET_SIZE: usize = 64;

/// Bulk transport to one claimed MPSSE interface.
pub struct Device {
    iface: nusb::Interface,
    interface_number: u8,
    out_ep: u8,
    in_ep: u8,
    max_packet_size: usize,
    /// `-R`: log every runt (status-only) packet seen on the read side.
    pub runt_diagnostics: bool,
}

impl Device {
    /// Opens `handle`, claims `interface`, and runs the required FTDI init
    /// control-transfer sequence: RESET(RESET), SET_BITMODE(MPSSE with
    /// TCK|TDI|TMS as outputs), SET_LATENCY(2ms), RESET(PURGE_TX),
    /// RESET(PURGE_RX).
    #[tracing::instrument(skip(handle))]
    pub async fn open(handle: nusb::Device, interface: Interface) -> Result<Self> {
        let _ = handle.detach_kernel_driver(interface.number());
        let iface = handle.claim_interface(interface.number()).await?;
        let max_packet_size = determine_max_packet_size(&iface);
        let (out_ep, in_ep) = interface.endpoints();

        let dev = Self {
            iface,
            interface_number: interface.number(),
            out_ep,
            in_ep,
            max_packet_size,
            runt_diagnostics: false,
        };
        dev.init().await?;
        Ok(dev)
    }

    async fn init(&self) -> Result<()> {
        self.control(requests::RESET, reset_arg::RESET_SIO).await?;
        self.control(requests::SET_BITMODE, BITMODE_MPSSE).await?;
        self.control(requests::SET_LATENCY_TIMER, LATENCY_TIMER_MS)
            .await?;
        self.control(requests::RESET, reset_arg::PURGE_TX).await?;
        self.control(requests::RESET, reset_arg::PURGE_RX).await?;
        Ok(())
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Bulk-writes `data` to the MPSSE command pipe.
    #[tracing::instrument(skip_all, fields(len = data.len()))]
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        use futures_lite::AsyncWriteExt;
        tracing::trace!(buf = %SpaceHex(data), "usb write");
        let mut writer = self
            .iface
            .endpoint::<nusb::transfer::Bulk, nusb::transfer::Out>(self.out_ep)?
            .writer(data.len().max(1))
            .with_write_timeout(WRITE_TIMEOUT);
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Bulk-reads until `buf` is filled, stripping the 2-byte status prefix
    /// from every underlying packet. A packet carrying only status bytes is
    /// benign and simply retried.
    #[tracing::instrument(skip_all, fields(want = buf.len()))]
    pub async fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<()> {
        use futures_lite::AsyncReadExt;

        let original_len = buf.len();
        let runt_diagnostics = self.runt_diagnostics;
        let mut reader = self
            .iface
            .endpoint::<nusb::transfer::Bulk, nusb::transfer::In>(self.in_ep)?
            .reader(self.max_packet_size)
            .with_read_timeout(READ_TIMEOUT);

        let mut scratch = vec![0u8; self.max_packet_size];
        let mut filled = 0;
        while filled < original_len {
            let bytes_read = reader.read(&mut scratch).await?;
            if bytes_read <= STATUS_PREFIX_LEN {
                log_runt(runt_diagnostics, original_len, original_len - filled, &scratch[..bytes_read]);
                continue;
            }
            for packet in scratch[..bytes_read].chunks(self.max_packet_size) {
                if packet.len() <= STATUS_PREFIX_LEN {
                    log_runt(runt_diagnostics, original_len, original_len - filled, packet);
                    continue;
                }
                let payload = &packet[STATUS_PREFIX_LEN..];
                let take = payload.len().min(buf.len());
                buf[..take].copy_from_slice(&payload[..take]);
                buf = &mut buf[take..];
                filled += take;
            }
        }
        tracing::trace!(read = filled, "usb read");
        Ok(())
    }

    async fn control(&self, request: u8, value: u16) -> Result<()> {
        let out = ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index: u16::from(self.interface_number) + 1,
            data: &[],
        };
        self.iface
            .control_out(out, CONTROL_TIMEOUT)
            .await
            .map_err(|e| eyre!("USB control request 0x{request:02x} failed: {e}"))?;
        Ok(())
    }
}

/// `-R`: log a runt (status-only) bulk-in packet. Matches the original
/// tool's `runtFlag` diagnostic, which prints the request size and whatever
/// status bytes came back whenever a read yields nothing but status.
fn log_runt(enabled: bool, wanted: usize, want: usize, packet: &[u8]) {
    if enabled {
        tracing::debug!(wanted, want, status = %crate::SpaceHex(packet), "runt packet");
    }
}

fn determine_max_packet_size(iface: &nusb::Interface) -> usize {
    if let Some(desc) = iface.descriptor()
        && let Some(ep) = desc.endpoints().next()
    {
        ep.max_packet_size()
    } else {
        FALLBACK_PACKET_SIZE
    }
}

/// Finds a connected FTDI device matching `vendor` and any of `products`
/// (and, if given, a serial number substring). `-d` with an explicit
/// product narrows this to a single-element slice; unset `-d` passes
/// [`DEFAULT_PRODUCTS`] so FT2232H/FT4232H/FT232H boards are all found.
pub async fn find(vendor: u16, products: &[u16], serial: Option<&str>) -> Result<nusb::Device> {
    let info = nusb::list_devices()?
        .find(|d| {
            d.vendor_id() == vendor
                && products.contains(&d.product_id())
                && serial.is_none_or(|want| d.serial_number().is_some_and(|got| got.contains(want)))
        })
        .ok_or_else(|| eyre!("no USB device matching vendor {vendor:04x}, product in {products:04x?} found"))?;
    Ok(info.open().await?)
}
