//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError};
use nusb::{Device, Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{DeviceFilter, TransferOutcome, TransportError, UsbBackend, UsbTransport};
use crate::protocol::{ACCESSORY_INTERFACE, DEFAULT_ENDPOINT_IN, DEFAULT_ENDPOINT_OUT, UsbId};
use crate::state::{ClaimState, TeardownStep};

/// Enumerates and opens devices through nusb.
///
/// nusb keeps no global context, so this value is the whole USB context.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl NusbBackend {
    pub fn new() -> Self {
        Self
    }
}

impl UsbBackend for NusbBackend {
    type Device = NusbDevice;

    fn candidates(&self, filter: &DeviceFilter) -> Result<Vec<UsbId>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        Ok(devices
            .map(|d| (UsbId::new(d.vendor_id(), d.product_id()), d.class()))
            .filter(|&(id, class)| filter.accepts(id, class))
            .map(|(id, _)| id)
            .collect())
    }

    #[instrument(level = "debug", skip(self), fields(id = %id))]
    fn open(&self, id: UsbId) -> Result<NusbDevice, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .find(|d| d.vendor_id() == id.vendor && d.product_id() == id.product)
            .ok_or(TransportError::DeviceNotFound {
                vid: id.vendor,
                pid: id.product,
            })?;

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        debug!(
            vendor_id = %format!("{:04X}", id.vendor),
            product_id = %format!("{:04X}", id.product),
            "Opened device"
        );

        Ok(NusbDevice {
            id,
            device: Some(device),
            interface: None,
            bulk_in: None,
            bulk_out: None,
            state: ClaimState::Opened {
                driver_detached: false,
            },
        })
    }
}

/// One open device. Bulk endpoints are opened lazily on first use, since a
/// device that is not yet in accessory mode may not expose them.
pub struct NusbDevice {
    id: UsbId,
    device: Option<Device>,
    interface: Option<Interface>,
    bulk_in: Option<Endpoint<Bulk, In>>,
    bulk_out: Option<Endpoint<Bulk, Out>>,
    state: ClaimState,
}

impl NusbDevice {
    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotClaimed)
    }

    /// Bulk endpoint addresses of interface 0, falling back to the AOA defaults.
    fn endpoint_addresses(&self) -> (u8, u8) {
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        if let Some(device) = &self.device {
            for config in device.configurations() {
                for iface in config.interfaces() {
                    if iface.interface_number() != ACCESSORY_INTERFACE {
                        continue;
                    }
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            in_endpoint = DEFAULT_ENDPOINT_IN;
        }
        if out_endpoint == 0 {
            out_endpoint = DEFAULT_ENDPOINT_OUT;
        }
        (in_endpoint, out_endpoint)
    }

    fn bulk_in(&mut self) -> Result<&mut Endpoint<Bulk, In>, TransportError> {
        if self.bulk_in.is_none() {
            let (address, _) = self.endpoint_addresses();
            let ep = self
                .interface()?
                .endpoint::<Bulk, In>(address)
                .map_err(|e| TransportError::EndpointUnavailable {
                    address,
                    message: e.to_string(),
                })?;
            info!(in_ep = %format!("0x{:02X}", address), "Bulk IN endpoint opened");
            self.bulk_in = Some(ep);
        }
        self.bulk_in.as_mut().ok_or(TransportError::NotClaimed)
    }

    fn bulk_out(&mut self) -> Result<&mut Endpoint<Bulk, Out>, TransportError> {
        if self.bulk_out.is_none() {
            let (_, address) = self.endpoint_addresses();
            let ep = self
                .interface()?
                .endpoint::<Bulk, Out>(address)
                .map_err(|e| TransportError::EndpointUnavailable {
                    address,
                    message: e.to_string(),
                })?;
            info!(out_ep = %format!("0x{:02X}", address), "Bulk OUT endpoint opened");
            self.bulk_out = Some(ep);
        }
        self.bulk_out.as_mut().ok_or(TransportError::NotClaimed)
    }

    #[cfg(target_os = "linux")]
    fn detach_kernel_driver(&mut self) {
        let Some(device) = &self.device else {
            return;
        };
        // nusb has no "driver active" query. A detach error means nothing was
        // bound; if something was, the claim below fails with Busy instead.
        match device.detach_kernel_driver(ACCESSORY_INTERFACE) {
            Ok(()) => {
                debug!("Kernel driver detached from interface 0");
                self.state = self.state.detached();
            }
            Err(e) => debug!(error = %e, "No kernel driver detached"),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn detach_kernel_driver(&mut self) {}

    #[cfg(target_os = "linux")]
    fn reattach_kernel_driver(&self) {
        let Some(device) = &self.device else {
            return;
        };
        if let Err(e) = device.attach_kernel_driver(ACCESSORY_INTERFACE) {
            warn!(error = %e, "Failed to reattach kernel driver");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn reattach_kernel_driver(&self) {}
}

fn transfer_outcome(status: Result<(), TransferError>, actual_len: usize) -> TransferOutcome {
    match status {
        Ok(()) => TransferOutcome::Complete(actual_len),
        // transfer_blocking cancels on timeout.
        Err(TransferError::Cancelled) => TransferOutcome::Timeout(actual_len),
        Err(TransferError::Disconnected) => TransferOutcome::DeviceGone,
        Err(e) => TransferOutcome::IoError(e.to_string()),
    }
}

fn control_error(request: u8, e: TransferError) -> TransportError {
    match e {
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::ControlFailed {
            request,
            message: other.to_string(),
        },
    }
}

impl UsbTransport for NusbDevice {
    fn id(&self) -> UsbId {
        self.id
    }

    fn claim_state(&self) -> ClaimState {
        self.state
    }

    #[instrument(level = "debug", skip(self), fields(id = %self.id))]
    fn claim_interface(&mut self) -> Result<(), TransportError> {
        if self.state.is_claimed() {
            return Ok(());
        }
        self.detach_kernel_driver();

        let device = self.device.as_ref().ok_or(TransportError::Disconnected)?;
        let interface = device
            .claim_interface(ACCESSORY_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: ACCESSORY_INTERFACE,
                message: e.to_string(),
            })?;

        self.interface = Some(interface);
        self.state = self.state.claimed();
        Ok(())
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.interface()?
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(|e| control_error(request, e))
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.interface()?
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| control_error(request, e))?;
        Ok(data.len())
    }

    fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> TransferOutcome {
        let requested = buf.len();
        let ep = match self.bulk_in() {
            Ok(ep) => ep,
            Err(e) => return e.into(),
        };

        let completion = ep.transfer_blocking(Buffer::new(requested), timeout);
        let data = completion.buffer.into_vec();
        let n = completion.actual_len.min(requested).min(data.len());
        buf[..n].copy_from_slice(&data[..n]);

        transfer_outcome(completion.status, n).discard_spurious(requested)
    }

    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> TransferOutcome {
        let ep = match self.bulk_out() {
            Ok(ep) => ep,
            Err(e) => return e.into(),
        };

        let mut transfer_buf = Buffer::new(data.len());
        transfer_buf.extend_from_slice(data);
        let completion = ep.transfer_blocking(transfer_buf, timeout);

        transfer_outcome(completion.status, completion.actual_len.min(data.len()))
    }

    fn release(&mut self) {
        for step in self.state.teardown_steps() {
            match step {
                TeardownStep::ReleaseInterface => {
                    // Endpoints hold the interface; drop them first.
                    self.bulk_in = None;
                    self.bulk_out = None;
                    self.interface = None;
                }
                TeardownStep::ReattachKernelDriver => self.reattach_kernel_driver(),
                TeardownStep::CloseHandle => self.device = None,
            }
        }
        if self.state.is_live() {
            debug!(id = %self.id, "Device released");
            self.state = ClaimState::Released;
        }
    }
}

impl Drop for NusbDevice {
    fn drop(&mut self) {
        self.release();
    }
}
