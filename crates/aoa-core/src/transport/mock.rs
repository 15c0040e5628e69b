//! Mock USB backend for testing.
//!
//! A `MockUsb` is a simulated bus. Clones share state, so a test can hand one
//! clone to the code under test and inspect the bus through another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{DeviceFilter, TransferOutcome, TransportError, UsbBackend, UsbTransport};
use crate::protocol::{ACCESSORY_GET_PROTOCOL, ACCESSORY_START, UsbId};
use crate::state::{ClaimState, TeardownStep};

/// An attached simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDeviceSpec {
    pub id: UsbId,
    pub class: u8,
    /// Whether a kernel driver is bound to interface 0.
    pub kernel_driver: bool,
}

/// Scripted result of one bulk IN attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    Data(Vec<u8>),
    Timeout,
    /// Timeout reporting the whole buffer as transferred.
    SpuriousFull,
    /// Timed out after delivering fewer bytes than requested.
    PartialTimeout(Vec<u8>),
    /// The device is unplugged from the bus.
    Gone,
    Error,
}

/// Scripted result of one bulk OUT attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockWrite {
    Accept,
    Partial(usize),
    Stall,
    Fail,
    Gone,
}

/// One captured control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Bus {
    attached: Vec<MockDeviceSpec>,
    protocol_version: u16,
    failing_controls: Vec<(u8, Option<u16>)>,
    switch_to: Option<(UsbId, usize)>,
    pending: Option<(MockDeviceSpec, usize)>,
    claim_fails: Vec<UsbId>,
    detach_fails: bool,
    enumeration_failures: usize,
    open_log: Vec<UsbId>,
    control_log: Vec<ControlRecord>,
    reads: VecDeque<MockRead>,
    writes: VecDeque<MockWrite>,
    written: Vec<Vec<u8>>,
    write_attempts: usize,
    live_claims: usize,
    total_claims: usize,
    teardown_log: Vec<(UsbId, TeardownStep)>,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            attached: Vec::new(),
            protocol_version: 2,
            failing_controls: Vec::new(),
            switch_to: None,
            pending: None,
            claim_fails: Vec::new(),
            detach_fails: false,
            enumeration_failures: 0,
            open_log: Vec::new(),
            control_log: Vec::new(),
            reads: VecDeque::new(),
            writes: VecDeque::new(),
            written: Vec::new(),
            write_attempts: 0,
            live_claims: 0,
            total_claims: 0,
            teardown_log: Vec::new(),
        }
    }
}

/// Simulated USB bus.
#[derive(Debug, Clone, Default)]
pub struct MockUsb {
    bus: Arc<Mutex<Bus>>,
}

impl MockUsb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device with no kernel driver bound.
    pub fn attach(&self, id: UsbId, class: u8) {
        self.attach_spec(MockDeviceSpec {
            id,
            class,
            kernel_driver: false,
        });
    }

    pub fn attach_spec(&self, spec: MockDeviceSpec) {
        self.bus.lock().unwrap().attached.push(spec);
    }

    /// Unplug every device with this identity.
    pub fn unplug(&self, id: UsbId) {
        self.bus.lock().unwrap().attached.retain(|d| d.id != id);
    }

    /// Version answered to GET_PROTOCOL.
    pub fn set_protocol_version(&self, version: u16) {
        self.bus.lock().unwrap().protocol_version = version;
    }

    /// Make a control request fail, optionally only for one `index`.
    pub fn fail_control(&self, request: u8, index: Option<u16>) {
        self.bus
            .lock()
            .unwrap()
            .failing_controls
            .push((request, index));
    }

    /// After START, re-enumerate as `id`, visible from the open attempt that
    /// follows `after_opens` failed ones.
    pub fn switch_on_start(&self, id: UsbId, after_opens: usize) {
        self.bus.lock().unwrap().switch_to = Some((id, after_opens));
    }

    pub fn fail_claim(&self, id: UsbId) {
        self.bus.lock().unwrap().claim_fails.push(id);
    }

    pub fn fail_detach(&self) {
        self.bus.lock().unwrap().detach_fails = true;
    }

    /// Make the next `count` enumerations fail.
    pub fn fail_enumerations(&self, count: usize) {
        self.bus.lock().unwrap().enumeration_failures = count;
    }

    pub fn queue_reads(&self, reads: impl IntoIterator<Item = MockRead>) {
        self.bus.lock().unwrap().reads.extend(reads);
    }

    pub fn script_writes(&self, writes: impl IntoIterator<Item = MockWrite>) {
        self.bus.lock().unwrap().writes.extend(writes);
    }

    /// Identities passed to `open`, in order.
    pub fn open_log(&self) -> Vec<UsbId> {
        self.bus.lock().unwrap().open_log.clone()
    }

    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.bus.lock().unwrap().control_log.clone()
    }

    /// Payloads accepted on bulk OUT, one entry per transfer.
    pub fn bulk_writes(&self) -> Vec<Vec<u8>> {
        self.bus.lock().unwrap().written.clone()
    }

    pub fn bulk_write_attempts(&self) -> usize {
        self.bus.lock().unwrap().write_attempts
    }

    pub fn pending_reads(&self) -> usize {
        self.bus.lock().unwrap().reads.len()
    }

    /// Interface claims not yet released.
    pub fn live_claims(&self) -> usize {
        self.bus.lock().unwrap().live_claims
    }

    pub fn total_claims(&self) -> usize {
        self.bus.lock().unwrap().total_claims
    }

    pub fn teardown_log(&self) -> Vec<(UsbId, TeardownStep)> {
        self.bus.lock().unwrap().teardown_log.clone()
    }
}

impl UsbBackend for MockUsb {
    type Device = MockDevice;

    fn candidates(&self, filter: &DeviceFilter) -> Result<Vec<UsbId>, TransportError> {
        let mut bus = self.bus.lock().unwrap();
        if bus.enumeration_failures > 0 {
            bus.enumeration_failures -= 1;
            return Err(TransportError::EnumerationFailed("simulated bus error".into()));
        }
        Ok(bus
            .attached
            .iter()
            .filter(|d| filter.accepts(d.id, d.class))
            .map(|d| d.id)
            .collect())
    }

    fn open(&self, id: UsbId) -> Result<MockDevice, TransportError> {
        let mut bus = self.bus.lock().unwrap();
        bus.open_log.push(id);

        if let Some((spec, remaining)) = bus.pending.take() {
            if remaining == 0 {
                bus.attached.push(spec);
            } else {
                bus.pending = Some((spec, remaining - 1));
            }
        }

        let spec = bus
            .attached
            .iter()
            .find(|d| d.id == id)
            .copied()
            .ok_or(TransportError::DeviceNotFound {
                vid: id.vendor,
                pid: id.product,
            })?;

        Ok(MockDevice {
            bus: Arc::clone(&self.bus),
            spec,
            state: ClaimState::Opened {
                driver_detached: false,
            },
        })
    }
}

/// Handle to a simulated device.
#[derive(Debug)]
pub struct MockDevice {
    bus: Arc<Mutex<Bus>>,
    spec: MockDeviceSpec,
    state: ClaimState,
}

impl MockDevice {
    fn check_failure(&self, bus: &Bus, request: u8, index: u16) -> Result<(), TransportError> {
        let fails = bus
            .failing_controls
            .iter()
            .any(|&(r, i)| r == request && i.is_none_or(|i| i == index));
        if fails {
            return Err(TransportError::ControlFailed {
                request,
                message: "simulated failure".into(),
            });
        }
        Ok(())
    }
}

impl UsbTransport for MockDevice {
    fn id(&self) -> UsbId {
        self.spec.id
    }

    fn claim_state(&self) -> ClaimState {
        self.state
    }

    fn claim_interface(&mut self) -> Result<(), TransportError> {
        let mut bus = self.bus.lock().unwrap();
        if self.spec.kernel_driver {
            if bus.detach_fails {
                return Err(TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: "kernel driver detach failed".into(),
                });
            }
            self.state = self.state.detached();
        }
        if bus.claim_fails.contains(&self.spec.id) {
            return Err(TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: "resource busy".into(),
            });
        }
        self.state = self.state.claimed();
        bus.live_claims += 1;
        bus.total_claims += 1;
        Ok(())
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.state.is_claimed() {
            return Err(TransportError::NotClaimed);
        }
        let mut bus = self.bus.lock().unwrap();
        bus.control_log.push(ControlRecord {
            request,
            value,
            index,
            data: Vec::new(),
        });
        self.check_failure(&bus, request, index)?;

        let mut response = if request == ACCESSORY_GET_PROTOCOL {
            bus.protocol_version.to_le_bytes().to_vec()
        } else {
            Vec::new()
        };
        response.truncate(length as usize);
        Ok(response)
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if !self.state.is_claimed() {
            return Err(TransportError::NotClaimed);
        }
        let mut bus = self.bus.lock().unwrap();
        bus.control_log.push(ControlRecord {
            request,
            value,
            index,
            data: data.to_vec(),
        });

        if request == ACCESSORY_START {
            // The switch happens whether or not the reply is an error.
            if let Some((target, after_opens)) = bus.switch_to {
                let id = self.spec.id;
                bus.attached.retain(|d| d.id != id);
                bus.pending = Some((
                    MockDeviceSpec {
                        id: target,
                        class: self.spec.class,
                        kernel_driver: false,
                    },
                    after_opens,
                ));
            }
        }

        self.check_failure(&bus, request, index)?;
        Ok(data.len())
    }

    fn bulk_read(&mut self, buf: &mut [u8], _timeout: Duration) -> TransferOutcome {
        if !self.state.is_claimed() {
            return TransferOutcome::IoError("interface not claimed".into());
        }
        let next = self.bus.lock().unwrap().reads.pop_front();
        match next {
            None | Some(MockRead::Timeout) => TransferOutcome::Timeout(0),
            Some(MockRead::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                TransferOutcome::Complete(n)
            }
            Some(MockRead::PartialTimeout(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                TransferOutcome::Timeout(n).discard_spurious(buf.len())
            }
            Some(MockRead::SpuriousFull) => {
                buf.fill(0xEE);
                TransferOutcome::Timeout(buf.len()).discard_spurious(buf.len())
            }
            Some(MockRead::Gone) => {
                let id = self.spec.id;
                self.bus.lock().unwrap().attached.retain(|d| d.id != id);
                TransferOutcome::DeviceGone
            }
            Some(MockRead::Error) => TransferOutcome::IoError("simulated read error".into()),
        }
    }

    fn bulk_write(&mut self, data: &[u8], _timeout: Duration) -> TransferOutcome {
        if !self.state.is_claimed() {
            return TransferOutcome::IoError("interface not claimed".into());
        }
        let mut bus = self.bus.lock().unwrap();
        bus.write_attempts += 1;
        match bus.writes.pop_front().unwrap_or(MockWrite::Accept) {
            MockWrite::Accept => {
                bus.written.push(data.to_vec());
                TransferOutcome::Complete(data.len())
            }
            MockWrite::Partial(n) => {
                let n = n.min(data.len());
                bus.written.push(data[..n].to_vec());
                TransferOutcome::Timeout(n)
            }
            MockWrite::Stall => TransferOutcome::Timeout(0),
            MockWrite::Fail => TransferOutcome::IoError("simulated write error".into()),
            MockWrite::Gone => TransferOutcome::DeviceGone,
        }
    }

    fn release(&mut self) {
        let steps = self.state.teardown_steps();
        if steps.is_empty() {
            return;
        }
        let mut bus = self.bus.lock().unwrap();
        for step in steps {
            if step == TeardownStep::ReleaseInterface {
                bus.live_claims -= 1;
            }
            bus.teardown_log.push((self.spec.id, step));
        }
        self.state = ClaimState::Released;
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ACCESSORY_DATA, AOA_VENDOR_ID};

    const PHONE: UsbId = UsbId::new(0x04E8, 0x6860);

    #[test]
    fn test_open_missing_device() {
        let mock = MockUsb::new();
        assert!(matches!(
            mock.open(PHONE),
            Err(TransportError::DeviceNotFound { .. })
        ));
        assert_eq!(mock.open_log(), vec![PHONE]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        let mut dev = mock.open(PHONE).unwrap();
        dev.claim_interface().unwrap();
        assert_eq!(mock.live_claims(), 1);

        dev.release();
        dev.release();
        drop(dev);

        assert_eq!(mock.live_claims(), 0);
        assert_eq!(
            mock.teardown_log(),
            vec![
                (PHONE, TeardownStep::ReleaseInterface),
                (PHONE, TeardownStep::CloseHandle)
            ]
        );
    }

    #[test]
    fn test_start_reenumerates_after_opens() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        mock.switch_on_start(ACCESSORY_DATA, 1);
        let mut dev = mock.open(PHONE).unwrap();
        dev.claim_interface().unwrap();
        dev.control_out(ACCESSORY_START, 0, 0, &[], Duration::ZERO)
            .unwrap();
        drop(dev);

        assert!(mock.open(ACCESSORY_DATA).is_err());
        let dev = mock.open(ACCESSORY_DATA).unwrap();
        assert_eq!(dev.id().vendor, AOA_VENDOR_ID);
        assert!(mock.open(PHONE).is_err());
    }

    #[test]
    fn test_kernel_driver_detach_recorded() {
        let mock = MockUsb::new();
        mock.attach_spec(MockDeviceSpec {
            id: PHONE,
            class: 0,
            kernel_driver: true,
        });
        let mut dev = mock.open(PHONE).unwrap();
        dev.claim_interface().unwrap();
        assert_eq!(
            dev.claim_state(),
            ClaimState::Claimed {
                driver_detached: true
            }
        );
        drop(dev);
        let steps: Vec<_> = mock.teardown_log().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            steps,
            vec![
                TeardownStep::ReleaseInterface,
                TeardownStep::ReattachKernelDriver,
                TeardownStep::CloseHandle
            ]
        );
    }

    #[test]
    fn test_unclaimed_control_rejected() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        let mut dev = mock.open(PHONE).unwrap();
        assert!(matches!(
            dev.control_in(ACCESSORY_GET_PROTOCOL, 0, 0, 2, Duration::ZERO),
            Err(TransportError::NotClaimed)
        ));
    }
}
