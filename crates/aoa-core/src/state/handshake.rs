//! Accessory handshake driver.
//!
//! Takes one candidate device from "just plugged in" to "open and claimed in
//! accessory mode", or reports why it could not.

use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use super::machine::HandshakeState;
use crate::events::{BridgeEvent, BridgeObserver};
use crate::protocol::constants::{
    ACCESSORY_GET_PROTOCOL, ACCESSORY_IDENTITIES, ACCESSORY_SEND_STRING, ACCESSORY_START,
    PROTOCOL_VERSION_LEN, WILDCARD_ID,
};
use crate::protocol::{AccessoryStrings, UsbId};
use crate::retry::{RetryPolicy, retry};
use crate::shutdown::ShutdownSignal;
use crate::transport::{DeviceFilter, TransportError, UsbBackend, UsbTransport};

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("No candidate device found")]
    DeviceNotFound,

    #[error("Failed to claim {id}: {message}")]
    ClaimFailed { id: UsbId, message: String },

    #[error("{step} failed: {source}")]
    Control {
        step: HandshakeState,
        source: TransportError,
    },

    #[error("Accessory did not re-enumerate after {attempts} attempts")]
    ProtocolTimeout { attempts: u32 },

    #[error("Handshake cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for HandshakeError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeviceNotFound { .. } => HandshakeError::DeviceNotFound,
            other => HandshakeError::Transport(other),
        }
    }
}

/// Handshake parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Vendor id to look for. `0xFFFF` together with a wildcard product means any.
    pub vendor_id: u16,
    pub product_id: u16,
    pub strings: AccessoryStrings,
    /// Poll for the re-enumerated accessory.
    pub reconnect: RetryPolicy,
    pub control_timeout_ms: u64,
    /// Pause between GET_PROTOCOL and the first SEND_STRING.
    pub settle_delay_ms: u64,
    /// Pause between closing the native handle and the first reconnect attempt.
    pub reenumerate_delay_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            vendor_id: WILDCARD_ID,
            product_id: WILDCARD_ID,
            strings: AccessoryStrings::default(),
            reconnect: RetryPolicy::default(),
            control_timeout_ms: 1000,
            settle_delay_ms: 1,
            reenumerate_delay_ms: 1,
        }
    }
}

impl HandshakeConfig {
    pub fn filter(&self) -> DeviceFilter {
        DeviceFilter::from_ids(self.vendor_id, self.product_id)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn reenumerate_delay(&self) -> Duration {
        Duration::from_millis(self.reenumerate_delay_ms)
    }
}

/// A device open and claimed in accessory mode.
pub struct AccessoryDevice<T: UsbTransport> {
    transport: T,
    /// Identity the device had before the mode switch.
    pub native: UsbId,
    /// Identity it answered to in accessory mode.
    pub accessory: UsbId,
    /// Version from GET_PROTOCOL, 0 when the device was already in accessory mode.
    pub aoa_version: u16,
}

impl<T: UsbTransport> AccessoryDevice<T> {
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Release the claim and close the handle.
    pub fn release(&mut self) {
        self.transport.release();
    }
}

/// Drives the handshake against one backend.
pub struct AccessoryHandshake<'a, B: UsbBackend, O: BridgeObserver + ?Sized> {
    backend: &'a B,
    config: &'a HandshakeConfig,
    observer: &'a O,
    shutdown: Option<&'a ShutdownSignal>,
    state: HandshakeState,
}

impl<'a, B: UsbBackend, O: BridgeObserver + ?Sized> AccessoryHandshake<'a, B, O> {
    pub fn new(backend: &'a B, config: &'a HandshakeConfig, observer: &'a O) -> Self {
        Self {
            backend,
            config,
            observer,
            shutdown: None,
            state: HandshakeState::Discovering,
        }
    }

    /// Stop polling for the re-enumerated accessory once `signal` fires.
    pub fn with_shutdown(mut self, signal: &'a ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn transition(&mut self, to: HandshakeState) {
        let from = self.state;
        self.state = to;
        debug!(from = %from, to = %to, "Handshake transition");
        self.observer
            .on_event(&BridgeEvent::HandshakeStep { from, to });
    }

    /// Try every candidate in enumeration order; the first to reach a
    /// terminal success wins. Failed candidates are released before moving on.
    pub fn acquire(&mut self) -> Result<AccessoryDevice<B::Device>, HandshakeError> {
        let candidates = self.backend.candidates(&self.config.filter())?;
        if candidates.is_empty() {
            return Err(HandshakeError::DeviceNotFound);
        }
        trace!(count = candidates.len(), "Handshake candidates");

        let mut last_error = HandshakeError::DeviceNotFound;
        for id in candidates {
            match self.handshake(id) {
                Ok(device) => return Ok(device),
                Err(HandshakeError::Cancelled) => return Err(HandshakeError::Cancelled),
                Err(e) => {
                    warn!(device = %id, error = %e, "Candidate rejected");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Run the handshake against one device identity.
    #[instrument(skip(self), fields(vid = format!("{:04X}", id.vendor), pid = format!("{:04X}", id.product)))]
    pub fn handshake(&mut self, id: UsbId) -> Result<AccessoryDevice<B::Device>, HandshakeError> {
        self.state = HandshakeState::Discovering;
        let result = self.drive(id);
        if result.is_err() {
            self.transition(HandshakeState::Failed);
        }
        result
    }

    fn drive(&mut self, id: UsbId) -> Result<AccessoryDevice<B::Device>, HandshakeError> {
        let mut device = self.backend.open(id)?;
        claim(&mut device)?;

        if id.is_accessory() {
            info!("Device already in accessory mode");
            self.transition(HandshakeState::AlreadyInAccessoryMode);
            return Ok(AccessoryDevice {
                transport: device,
                native: id,
                accessory: id,
                aoa_version: 0,
            });
        }

        self.transition(HandshakeState::Probing);
        let aoa_version = self.query_protocol(&mut device)?;
        info!(aoa_version, "Device supports accessory protocol");
        thread::sleep(self.config.settle_delay());

        self.transition(HandshakeState::StringsSent);
        self.send_strings(&mut device)?;

        self.transition(HandshakeState::ModeSwitchRequested);
        self.request_mode_switch(&mut device);
        device.release();
        drop(device);
        thread::sleep(self.config.reenumerate_delay());

        self.transition(HandshakeState::Reconnecting);
        let mut accessory = self.reconnect()?;
        claim(&mut accessory)?;
        let accessory_id = accessory.id();

        self.transition(HandshakeState::Ready);
        info!(accessory = %accessory_id, "Accessory mode ready");
        Ok(AccessoryDevice {
            transport: accessory,
            native: id,
            accessory: accessory_id,
            aoa_version,
        })
    }

    fn query_protocol(&mut self, device: &mut B::Device) -> Result<u16, HandshakeError> {
        let reply = device
            .control_in(
                ACCESSORY_GET_PROTOCOL,
                0,
                0,
                PROTOCOL_VERSION_LEN,
                self.config.control_timeout(),
            )
            .map_err(|source| self.control_error(source))?;

        reply
            .as_slice()
            .read_u16::<LittleEndian>()
            .map_err(|e| {
                self.control_error(TransportError::ControlFailed {
                    request: ACCESSORY_GET_PROTOCOL,
                    message: format!("short reply ({} bytes): {}", reply.len(), e),
                })
            })
    }

    fn send_strings(&mut self, device: &mut B::Device) -> Result<(), HandshakeError> {
        for (index, payload) in self.config.strings.payloads() {
            trace!(index = index.value(), name = %index, len = payload.len(), "SEND_STRING");
            device
                .control_out(
                    ACCESSORY_SEND_STRING,
                    0,
                    index.value(),
                    &payload,
                    self.config.control_timeout(),
                )
                .map_err(|source| self.control_error(source))?;
        }
        Ok(())
    }

    /// Some firmware answers START with an error and switches anyway, so the
    /// outcome is only judged by re-enumeration.
    fn request_mode_switch(&mut self, device: &mut B::Device) {
        match device.control_out(ACCESSORY_START, 0, 0, &[], self.config.control_timeout()) {
            Ok(_) => debug!("START accepted"),
            Err(e) => debug!(error = %e, "START reply ignored"),
        }
    }

    fn reconnect(&mut self) -> Result<B::Device, HandshakeError> {
        let backend = self.backend;
        let shutdown = self.shutdown;
        let found = retry(&self.config.reconnect, |attempt| {
            if shutdown.is_some_and(ShutdownSignal::is_triggered) {
                return Some(None);
            }
            ACCESSORY_IDENTITIES
                .iter()
                .enumerate()
                .find_map(|(i, &id)| {
                    if i > 0 {
                        thread::sleep(attempt.timeout);
                    }
                    match backend.open(id) {
                        Ok(device) => Some(device),
                        Err(e) => {
                            trace!(attempt = attempt.number, identity = %id, error = %e, "Accessory not present yet");
                            None
                        }
                    }
                })
                .map(Some)
        })
        .map_err(|e| HandshakeError::ProtocolTimeout {
            attempts: e.attempts,
        })?;
        found.ok_or_else(|| {
            info!("Reconnect abandoned on shutdown");
            HandshakeError::Cancelled
        })
    }

    fn control_error(&self, source: TransportError) -> HandshakeError {
        HandshakeError::Control {
            step: self.state,
            source,
        }
    }
}

fn claim<T: UsbTransport>(device: &mut T) -> Result<(), HandshakeError> {
    device
        .claim_interface()
        .map_err(|e| HandshakeError::ClaimFailed {
            id: device.id(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingObserver;
    use crate::protocol::constants::{ACCESSORY_ADB, ACCESSORY_DATA};
    use crate::transport::mock::MockDeviceSpec;
    use crate::transport::MockUsb;

    const PHONE: UsbId = UsbId::new(0x04E8, 0x6860);
    const TABLET: UsbId = UsbId::new(0x2717, 0xFF48);
    const FTDI: UsbId = UsbId::new(0x0403, 0x6001);

    fn fast_config() -> HandshakeConfig {
        HandshakeConfig {
            reconnect: RetryPolicy {
                max_attempts: 15,
                attempt_timeout_ms: 0,
                backoff_ms: 0,
            },
            settle_delay_ms: 0,
            reenumerate_delay_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip_reaches_ready() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        mock.switch_on_start(ACCESSORY_DATA, 4);
        let config = fast_config();
        let observer = CollectingObserver::new();

        let mut hs = AccessoryHandshake::new(&mock, &config, &observer);
        let device = hs.acquire().unwrap();

        assert_eq!(hs.state(), HandshakeState::Ready);
        assert_eq!(device.native, PHONE);
        assert_eq!(device.accessory, ACCESSORY_DATA);
        assert_eq!(device.aoa_version, 2);
        assert!(device.transport().claim_state().is_claimed());
        // native open plus three poll iterations, the last one hitting on DATA
        assert_eq!(mock.open_log().len(), 6);
        assert_eq!(
            observer.handshake_states(),
            vec![
                HandshakeState::Probing,
                HandshakeState::StringsSent,
                HandshakeState::ModeSwitchRequested,
                HandshakeState::Reconnecting,
                HandshakeState::Ready,
            ]
        );
    }

    #[test]
    fn test_control_sequence_on_the_wire() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        mock.switch_on_start(ACCESSORY_DATA, 0);
        let config = fast_config();

        AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver)
            .acquire()
            .unwrap();

        let log = mock.control_log();
        assert_eq!(log.len(), 8);
        assert_eq!(log[0].request, ACCESSORY_GET_PROTOCOL);
        for (i, record) in log[1..7].iter().enumerate() {
            assert_eq!(record.request, ACCESSORY_SEND_STRING);
            assert_eq!(record.index, i as u16);
        }
        assert_eq!(log[1].data, b"SHINE");
        assert_eq!(log[2].data, b"Android Accessory Emulator\0");
        assert_eq!(log[7].request, ACCESSORY_START);
        assert!(log[7].data.is_empty());
    }

    #[test]
    fn test_protocol_query_failure_fails_candidate() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        mock.fail_control(ACCESSORY_GET_PROTOCOL, None);
        let config = fast_config();
        let observer = CollectingObserver::new();

        let mut hs = AccessoryHandshake::new(&mock, &config, &observer);
        let err = hs.acquire().err().unwrap();

        assert!(matches!(
            err,
            HandshakeError::Control {
                step: HandshakeState::Probing,
                ..
            }
        ));
        assert_eq!(hs.state(), HandshakeState::Failed);
        assert!(!observer.handshake_states().contains(&HandshakeState::Ready));
        assert_eq!(mock.live_claims(), 0);
    }

    #[test]
    fn test_string_failure_stops_before_start() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        mock.fail_control(ACCESSORY_SEND_STRING, Some(3));
        let config = fast_config();

        let mut hs = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver);
        let err = hs.acquire().err().unwrap();

        assert!(matches!(
            err,
            HandshakeError::Control {
                step: HandshakeState::StringsSent,
                ..
            }
        ));
        let log = mock.control_log();
        assert!(log.iter().all(|r| r.request != ACCESSORY_START));
        assert_eq!(log.last().map(|r| r.index), Some(3));
        assert_eq!(mock.live_claims(), 0);
    }

    #[test]
    fn test_start_failure_is_tolerated() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        mock.fail_control(ACCESSORY_START, None);
        mock.switch_on_start(ACCESSORY_DATA, 1);
        let config = fast_config();
        let observer = CollectingObserver::new();

        let device = AccessoryHandshake::new(&mock, &config, &observer)
            .acquire()
            .unwrap();

        assert_eq!(device.accessory, ACCESSORY_DATA);
        let states = observer.handshake_states();
        assert!(states.contains(&HandshakeState::Reconnecting));
        assert_eq!(states.last(), Some(&HandshakeState::Ready));
    }

    #[test]
    fn test_already_in_accessory_mode() {
        let mock = MockUsb::new();
        mock.attach(ACCESSORY_ADB, 0);
        let config = fast_config();

        let mut hs = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver);
        let device = hs.acquire().unwrap();

        assert_eq!(hs.state(), HandshakeState::AlreadyInAccessoryMode);
        assert_eq!(device.aoa_version, 0);
        assert_eq!(device.accessory, ACCESSORY_ADB);
        assert!(mock.control_log().is_empty());
    }

    #[test]
    fn test_reconnect_bound_tries_both_identities() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        let config = fast_config();

        let err = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver)
            .acquire()
            .err()
            .unwrap();

        assert!(matches!(err, HandshakeError::ProtocolTimeout { attempts: 15 }));
        let opens = mock.open_log();
        assert_eq!(opens.len(), 1 + 30);
        for pair in opens[1..].chunks(2) {
            assert_eq!(pair, &ACCESSORY_IDENTITIES);
        }
    }

    #[test]
    fn test_shutdown_cancels_reconnect() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        let config = fast_config();
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let err = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver)
            .with_shutdown(&shutdown)
            .acquire()
            .err()
            .unwrap();

        assert!(matches!(err, HandshakeError::Cancelled));
        assert_eq!(mock.open_log(), vec![PHONE]);
        assert_eq!(mock.live_claims(), 0);
    }

    #[test]
    fn test_adb_identity_accepted() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        mock.switch_on_start(ACCESSORY_ADB, 0);
        let config = fast_config();

        let device = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver)
            .acquire()
            .unwrap();

        assert_eq!(device.accessory, ACCESSORY_ADB);
        assert_eq!(mock.open_log(), vec![PHONE, ACCESSORY_DATA, ACCESSORY_ADB]);
    }

    #[test]
    fn test_wildcard_skips_unclaimable_candidate() {
        let mock = MockUsb::new();
        mock.attach(FTDI, 0);
        mock.attach(PHONE, 0);
        mock.attach(TABLET, 0);
        mock.fail_claim(PHONE);
        mock.switch_on_start(ACCESSORY_DATA, 0);
        let config = fast_config();

        let device = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver)
            .acquire()
            .unwrap();

        assert_eq!(device.native, TABLET);
        assert!(!mock.open_log().contains(&FTDI));
        assert_eq!(mock.live_claims(), 1);
    }

    #[test]
    fn test_claim_failure_reported() {
        let mock = MockUsb::new();
        mock.attach(PHONE, 0);
        mock.fail_claim(PHONE);
        let config = HandshakeConfig {
            vendor_id: PHONE.vendor,
            product_id: PHONE.product,
            ..fast_config()
        };

        let err = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver)
            .acquire()
            .err()
            .unwrap();

        assert!(matches!(err, HandshakeError::ClaimFailed { id, .. } if id == PHONE));
    }

    #[test]
    fn test_failed_detach_leaves_driver_alone() {
        let mock = MockUsb::new();
        mock.attach_spec(MockDeviceSpec {
            id: PHONE,
            class: 0,
            kernel_driver: true,
        });
        mock.fail_detach();
        let config = fast_config();

        let err = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver)
            .acquire()
            .err()
            .unwrap();

        assert!(matches!(err, HandshakeError::ClaimFailed { .. }));
        let steps: Vec<_> = mock.teardown_log().into_iter().map(|(_, s)| s).collect();
        assert_eq!(steps, vec![crate::state::TeardownStep::CloseHandle]);
    }

    #[test]
    fn test_no_candidates() {
        let mock = MockUsb::new();
        mock.attach(FTDI, 0);
        let config = fast_config();

        let err = AccessoryHandshake::new(&mock, &config, &crate::events::NullObserver)
            .acquire()
            .err()
            .unwrap();
        assert!(matches!(err, HandshakeError::DeviceNotFound));
    }

    #[test]
    fn test_config_toml_round_trip() {
        let config = HandshakeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: HandshakeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.filter(), DeviceFilter::Any);
    }
}
