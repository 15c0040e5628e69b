//! Bridge session - high-level orchestrator for discovery, handshake and pump.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, trace, warn};

use crate::bridge::{BridgeLoop, PumpConfig, PumpExit};
use crate::events::{BridgeEvent, BridgeObserver, BridgePhase, TracingObserver};
use crate::retry::{RetryPolicy, retry};
use crate::serial::{SerialError, SerialLink, SerialSession, SerialSettings};
use crate::shutdown::ShutdownSignal;
use crate::state::{AccessoryDevice, AccessoryHandshake, HandshakeConfig, HandshakeError};
use crate::transport::{NusbBackend, UsbBackend};

/// Configuration for a bridge session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub handshake: HandshakeConfig,
    pub serial: SerialSettings,
    pub pump: PumpConfig,
    /// Discovery cycles. `backoff_ms` is the pause between failed cycles.
    pub discovery: RetryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            serial: SerialSettings::default(),
            pump: PumpConfig::default(),
            discovery: RetryPolicy {
                max_attempts: u32::MAX,
                attempt_timeout_ms: 0,
                backoff_ms: 500,
            },
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        self.discovery.backoff()
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Serial port unavailable: {0}")]
    SerialOpenFailed(#[source] SerialError),

    #[error("No accessory found after {attempts} discovery cycles")]
    DiscoveryExhausted { attempts: u32 },
}

/// Bridge session - owns the USB backend, the serial line and the observer.
pub struct BridgeSession<B: UsbBackend, S: SerialLink, O: BridgeObserver + ?Sized> {
    config: BridgeConfig,
    backend: B,
    serial: S,
    observer: Arc<O>,
    shutdown: ShutdownSignal,
    phase: BridgePhase,
}

impl BridgeSession<NusbBackend, SerialSession, TracingObserver> {
    /// Create a session on the system USB stack with the tracing observer.
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: BridgeObserver + ?Sized> BridgeSession<NusbBackend, SerialSession, O> {
    /// Create a session on the system USB stack with a custom observer.
    pub fn with_observer(config: BridgeConfig, observer: Arc<O>) -> Self {
        let serial = SerialSession::new(config.serial.clone());
        Self::with_parts(config, NusbBackend::new(), serial, observer)
    }
}

impl<B: UsbBackend, S: SerialLink, O: BridgeObserver + ?Sized> BridgeSession<B, S, O> {
    pub fn with_parts(config: BridgeConfig, backend: B, serial: S, observer: Arc<O>) -> Self {
        Self {
            config,
            backend,
            serial,
            observer,
            shutdown: ShutdownSignal::new(),
            phase: BridgePhase::WaitingForDevice,
        }
    }

    /// Handle that stops the session from another thread.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn phase(&self) -> BridgePhase {
        self.phase
    }

    fn set_phase(&mut self, to: BridgePhase) {
        let from = self.phase;
        self.phase = to;
        self.observer.on_event(&BridgeEvent::PhaseChanged { from, to });
    }

    /// Run discovery, handshake and pump until shutdown.
    ///
    /// A disconnect releases everything and starts discovery over. Only a
    /// serial port that cannot be opened, or a bounded discovery running
    /// out, ends the session with an error.
    #[instrument(skip(self), fields(serial = %self.config.serial.path))]
    pub fn run(&mut self) -> Result<(), SessionError> {
        let result = self.cycle();
        self.set_phase(BridgePhase::ShuttingDown);
        self.serial.close();
        info!("Bridge session ended");
        result
    }

    fn cycle(&mut self) -> Result<(), SessionError> {
        loop {
            if self.phase != BridgePhase::WaitingForDevice {
                self.set_phase(BridgePhase::WaitingForDevice);
            }

            let Some(mut device) = self.discover()? else {
                return Ok(());
            };
            self.observer.on_event(&BridgeEvent::DeviceConnected {
                native: device.native,
                accessory: device.accessory,
                aoa_version: device.aoa_version,
            });

            if self.config.pump.closed_loop {
                info!("Closed-loop mode, serial port not used");
            } else if let Err(e) = self.serial.open() {
                error!(error = %e, "Cannot open serial port");
                device.release();
                return Err(SessionError::SerialOpenFailed(e));
            }

            self.set_phase(BridgePhase::Bridging);
            let exit = BridgeLoop::new(
                device.transport_mut(),
                &mut self.serial,
                &*self.observer,
                &self.config.pump,
            )
            .run(&self.shutdown);

            device.release();
            self.serial.close();

            match exit {
                PumpExit::Shutdown => return Ok(()),
                PumpExit::Disconnected => {
                    self.observer.on_event(&BridgeEvent::DeviceDisconnected);
                    self.set_phase(BridgePhase::Disconnected);
                }
            }
        }
    }

    /// `Ok(None)` when shutdown was requested before a device was ready.
    fn discover(&mut self) -> Result<Option<AccessoryDevice<B::Device>>, SessionError> {
        info!("Waiting for device...");
        let backend = &self.backend;
        let handshake = &self.config.handshake;
        let observer = &*self.observer;
        let shutdown = &self.shutdown;

        retry(&self.config.discovery, |attempt| {
            if shutdown.is_triggered() {
                return Some(None);
            }
            match AccessoryHandshake::new(backend, handshake, observer)
                .with_shutdown(shutdown)
                .acquire()
            {
                Ok(device) => {
                    info!(
                        vid = format!("{:04X}", device.accessory.vendor),
                        pid = format!("{:04X}", device.accessory.product),
                        "Device ready after {} cycles",
                        attempt.number
                    );
                    Some(Some(device))
                }
                Err(HandshakeError::Cancelled) => Some(None),
                Err(HandshakeError::DeviceNotFound) => {
                    trace!(cycle = attempt.number, "No candidate device");
                    None
                }
                Err(e) => {
                    warn!(cycle = attempt.number, error = %e, "Handshake failed");
                    None
                }
            }
        })
        .map_err(|e| SessionError::DiscoveryExhausted {
            attempts: e.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingObserver;
    use crate::protocol::ACCESSORY_DATA;
    use crate::serial::MockSerial;
    use crate::transport::MockUsb;
    use crate::transport::mock::MockRead;

    fn bounded() -> BridgeConfig {
        BridgeConfig {
            pump: PumpConfig {
                idle_ms: 0,
                ..Default::default()
            },
            discovery: RetryPolicy {
                max_attempts: 2,
                attempt_timeout_ms: 0,
                backoff_ms: 0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.discovery_interval(), Duration::from_millis(500));
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.pump.buffer_size, 1024);
        assert!(!config.pump.closed_loop);
    }

    #[test]
    fn test_config_file_round_trip() {
        let path = std::env::temp_dir().join(format!("aoa-bridge-{}.toml", std::process::id()));
        let mut config = BridgeConfig::default();
        config.serial.path = "/dev/ttyS3".into();
        config.pump.closed_loop = true;
        config.handshake.strings.model = "Bench Rig".into();

        config.save_to_file(&path).unwrap();
        let loaded = BridgeConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let config: BridgeConfig = toml::from_str("[serial]\npath = \"/dev/ttyAMA0\"\n").unwrap();
        assert_eq!(config.serial.path, "/dev/ttyAMA0");
        assert_eq!(config.handshake, HandshakeConfig::default());
    }

    #[test]
    fn test_serial_open_failure_is_fatal() {
        let mock = MockUsb::new();
        mock.attach(ACCESSORY_DATA, 0);
        let serial = MockSerial::new();
        serial.fail_open();

        let mut session = BridgeSession::with_parts(
            bounded(),
            mock.clone(),
            serial,
            Arc::new(CollectingObserver::new()),
        );
        let err = session.run().err().unwrap();

        assert!(matches!(err, SessionError::SerialOpenFailed(_)));
        assert_eq!(mock.live_claims(), 0);
        assert_eq!(session.phase(), BridgePhase::ShuttingDown);
    }

    #[test]
    fn test_discovery_bound() {
        let mock = MockUsb::new();
        let serial = MockSerial::new();

        let mut session =
            BridgeSession::with_parts(bounded(), mock, serial.clone(), Arc::new(CollectingObserver::new()));

        assert!(matches!(
            session.run(),
            Err(SessionError::DiscoveryExhausted { attempts: 2 })
        ));
        assert_eq!(serial.open_count(), 0);
    }

    #[test]
    fn test_shutdown_before_discovery() {
        let mock = MockUsb::new();
        mock.attach(ACCESSORY_DATA, 0);
        let mut session = BridgeSession::with_parts(
            bounded(),
            mock.clone(),
            MockSerial::new(),
            Arc::new(CollectingObserver::new()),
        );
        session.shutdown_signal().trigger();

        assert!(session.run().is_ok());
        assert!(mock.open_log().is_empty());
    }

    #[test]
    fn test_disconnect_reports_and_releases() {
        let mock = MockUsb::new();
        mock.attach(ACCESSORY_DATA, 0);
        mock.queue_reads([MockRead::Data(b"abc".to_vec()), MockRead::Gone]);
        let serial = MockSerial::new();
        let observer = Arc::new(CollectingObserver::new());

        let mut session =
            BridgeSession::with_parts(bounded(), mock.clone(), serial.clone(), observer.clone());
        let result = session.run();

        assert!(matches!(result, Err(SessionError::DiscoveryExhausted { .. })));
        assert_eq!(serial.written(), b"abc");
        assert_eq!(serial.open_count(), 1);
        assert_eq!(serial.close_count(), 1);
        assert_eq!(mock.live_claims(), 0);
        assert!(observer.events().contains(&BridgeEvent::DeviceDisconnected));
    }

    #[test]
    fn test_closed_loop_runs_without_serial_port() {
        let mock = MockUsb::new();
        mock.attach(ACCESSORY_DATA, 0);
        mock.queue_reads([MockRead::Data(b"loop".to_vec()), MockRead::Gone]);
        let serial = MockSerial::new();
        serial.fail_open();
        let mut config = bounded();
        config.pump.closed_loop = true;

        let mut session = BridgeSession::with_parts(
            config,
            mock.clone(),
            serial.clone(),
            Arc::new(CollectingObserver::new()),
        );
        let result = session.run();

        assert!(matches!(result, Err(SessionError::DiscoveryExhausted { .. })));
        assert_eq!(mock.bulk_writes(), vec![b"loop".to_vec()]);
        assert_eq!(serial.open_count(), 0);
        assert_eq!(mock.live_claims(), 0);
    }

    #[test]
    fn test_enumeration_failure_does_not_end_discovery() {
        let mock = MockUsb::new();
        mock.attach(ACCESSORY_DATA, 0);
        mock.fail_enumerations(1);
        mock.queue_reads([MockRead::Gone]);
        let serial = MockSerial::new();
        let mut config = bounded();
        config.discovery.max_attempts = 3;

        let mut session = BridgeSession::with_parts(
            config,
            mock.clone(),
            serial.clone(),
            Arc::new(CollectingObserver::new()),
        );
        let _ = session.run();

        assert_eq!(mock.total_claims(), 1);
        assert_eq!(serial.open_count(), 1);
    }
}
