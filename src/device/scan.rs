use log::{debug, info, warn};
use tokio::time::Instant;

use crate::device::backend::BleBackend;
use crate::device::machine::MachineEvent;
use crate::device::types::{PeripheralIdentity, ScanFailure};

/// The one running scan and the platform handle that stops it.
pub struct ScanSession<S> {
    handle: S,
    started_at: Instant,
}

/// Runs discovery sweeps and reports advertisements of the target to the state machine.
pub struct ScanManager<S> {
    target: PeripheralIdentity,
    session: Option<ScanSession<S>>,
}

impl<S: Send + 'static> ScanManager<S> {
    pub fn new(target: PeripheralIdentity) -> Self {
        ScanManager {
            target,
            session: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    /// Starts an unfiltered sweep, stopping the running one first. A failure is returned as the
    /// machine event it has to be handled as.
    pub async fn start_scan<B>(&mut self, backend: &B) -> Result<(), MachineEvent>
    where
        B: BleBackend<Scan = S>,
    {
        self.stop_scan(backend).await;

        info!("Scanning for {}...", self.target);
        match backend.start_scan().await {
            Ok(handle) => {
                self.session = Some(ScanSession { handle, started_at: Instant::now() });
                Ok(())
            },
            Err(failure) => {
                warn!("Starting scan failed: {:?}", failure);
                Err(MachineEvent::ScanFailed(failure))
            },
        }
    }

    pub async fn stop_scan<B>(&mut self, backend: &B)
    where
        B: BleBackend<Scan = S>,
    {
        if let Some(session) = self.session.take() {
            info!(
                "Stopping scan after {}",
                humantime::format_duration(session.started_at.elapsed()),
            );
            backend.stop_scan(session.handle).await;
        }
    }

    /// Returns the match event when `address` is the target. Advertisements outside a session are
    /// leftovers from a stopped scan and are ignored.
    pub fn on_advertisement(&self, address: &str, name: Option<&str>) -> Option<MachineEvent> {
        if self.session.is_none() {
            return None;
        }

        if self.target.matches(address) {
            info!("Found {} ({})", address, name.unwrap_or("NONE"));
            Some(MachineEvent::TargetFound)
        } else {
            debug!("Ignoring advertisement of {} ({})", address, name.unwrap_or("NONE"));
            None
        }
    }

    /// The platform ended the session by itself.
    pub fn on_scan_failed(&mut self, code: i32) -> Option<MachineEvent> {
        let session = self.session.take()?;
        warn!(
            "Scan failed with code {} after {}",
            code,
            humantime::format_duration(session.started_at.elapsed()),
        );
        Some(MachineEvent::ScanFailed(ScanFailure::Code(code)))
    }
}
