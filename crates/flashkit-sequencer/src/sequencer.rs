//! Node update state machine

use flashkit_config::SequencerConfig;
use flashkit_system::{BusKind, DeviceRegistry, FlashJob, FlashloaderKind, SystemDefinition};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::hex::HexImage;
use crate::node::{DeviceDetails, DeviceInfo, NodeDevice, NodeFailure, NodeSlot, NodeStatus};
use crate::progress::{
    AbortSignal, NoProgress, Phase, PhaseProgress, ProgressObserver, ProgressReport, Step,
    StepResult,
};
use crate::protocol::{
    FlashBlock, Fingerprint, LegacyProtocol, ModernFeatures, ModernProtocol, NoDriver, NodeAddress,
};
use crate::{Result, SequenceError};

/// Coarse state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Uninitialized,
    FlashloaderActivation,
    DeviceInfoRead,
    SystemUpdate,
    SystemReset,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
    pub activated: Vec<usize>,
    pub failed: Vec<(usize, NodeFailure)>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceInfoReport {
    pub devices: Vec<DeviceInfo>,
    pub failed: Vec<(usize, NodeFailure)>,
    /// Policy violations such as unexpected device names
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub updated: Vec<usize>,
    pub failed: Vec<(usize, NodeFailure)>,
    /// Nodes in the order that failed in an earlier phase
    pub skipped: Vec<usize>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResetReport {
    pub reset: Vec<usize>,
    pub failed: Vec<(usize, NodeFailure)>,
}

/// Outcome of a protocol step on one node
enum StepError {
    Failed(NodeFailure),
    Aborted,
}

impl From<NodeFailure> for StepError {
    fn from(failure: NodeFailure) -> Self {
        StepError::Failed(failure)
    }
}

type StepResultOf<T> = std::result::Result<T, StepError>;

/// Application content of one file
enum Payload {
    Hex { path: PathBuf, image: HexImage },
    File { name: String, data: Vec<u8> },
}

impl Payload {
    fn size(&self) -> u64 {
        match self {
            Payload::Hex { image, .. } => image.total_size() as u64,
            Payload::File { data, .. } => data.len() as u64,
        }
    }
}

/// Flash job with all files read and parsed
struct PreparedJob<'j> {
    job: &'j FlashJob,
    applications: Vec<Payload>,
    nvm: Vec<HexImage>,
    pem: Option<Vec<u8>>,
}

// Share of a node's progress unit taken by each update step, in permille
const CHECK_MEMORY_AT: u64 = 20;
const FINGERPRINT_AT: u64 = 40;
const TRANSFER_FROM: u64 = 50;
const TRANSFER_TO: u64 = 900;
const NVM_AT: u64 = 900;
const PEM_AT: u64 = 940;
const SECURITY_AT: u64 = 960;
const DEBUGGER_AT: u64 = 980;
const NODE_DONE: u64 = 1000;

/// Drives one update run on one bus
pub struct Sequencer<'a> {
    system: &'a SystemDefinition,
    devices: &'a DeviceRegistry,
    active_bus: usize,
    config: SequencerConfig,
    modern: Box<dyn ModernProtocol + 'a>,
    legacy: Box<dyn LegacyProtocol + 'a>,
    observer: Box<dyn ProgressObserver + 'a>,
    abort: AbortSignal,
    state: SequencerState,
    slots: Vec<Option<NodeSlot>>,
    progress: Arc<Mutex<Option<ProgressReport>>>,
    last_percent: u8,
}

impl<'a> Sequencer<'a> {
    /// Bind a run to a system, its active bus and the nodes to update
    ///
    /// Every active node needs a flashloader, a known device type and a route
    /// from the active bus.
    pub fn new(
        system: &'a SystemDefinition,
        devices: &'a DeviceRegistry,
        active_bus: usize,
        active_nodes: &[bool],
        config: SequencerConfig,
    ) -> Result<Self> {
        if active_nodes.len() != system.node_count() {
            return Err(SequenceError::Config(format!(
                "got {} active flags for {} nodes",
                active_nodes.len(),
                system.node_count()
            )));
        }
        if system.bus(active_bus).is_none() {
            return Err(SequenceError::Config(format!(
                "active bus index {} out of range",
                active_bus
            )));
        }
        system.validate()?;

        let mut slots = Vec::with_capacity(active_nodes.len());
        for (index, node) in system.nodes.iter().enumerate() {
            if !active_nodes[index] {
                slots.push(None);
                continue;
            }

            if devices.find(&node.device_type).is_none() {
                return Err(SequenceError::Config(format!(
                    "node {} uses unknown device type {}",
                    node.name, node.device_type
                )));
            }

            let route = system.route_to(index, active_bus)?;
            let address = node_address(system, index, route.target_bus).ok_or_else(|| {
                SequenceError::Config(format!("node {} has no interface on its route", node.name))
            })?;

            let device = match node.flashloader {
                FlashloaderKind::Modern => NodeDevice::modern(address),
                FlashloaderKind::Legacy => NodeDevice::legacy(address),
                FlashloaderKind::None => {
                    return Err(SequenceError::Config(format!(
                        "node {} has no flashloader",
                        node.name
                    )));
                }
            };

            slots.push(Some(NodeSlot {
                device,
                route,
                status: NodeStatus::Idle,
                in_flashloader: false,
            }));
        }

        Ok(Self {
            system,
            devices,
            active_bus,
            config,
            modern: Box::new(NoDriver),
            legacy: Box::new(NoDriver),
            observer: Box::new(NoProgress),
            abort: AbortSignal::new(),
            state: SequencerState::Uninitialized,
            slots,
            progress: Arc::new(Mutex::new(None)),
            last_percent: 0,
        })
    }

    pub fn with_modern_driver(mut self, driver: impl ModernProtocol + 'a) -> Self {
        self.modern = Box::new(driver);
        self
    }

    pub fn with_legacy_driver(mut self, driver: impl LegacyProtocol + 'a) -> Self {
        self.legacy = Box::new(driver);
        self
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'a) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    /// Handle for cancelling the run from another thread
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Status of the node at `index`; `None` for inactive nodes
    pub fn node_status(&self, index: usize) -> Option<&NodeStatus> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .map(|slot| &slot.status)
    }

    pub fn node_device(&self, index: usize) -> Option<&NodeDevice> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .map(|slot| &slot.device)
    }

    /// Most recent progress report
    pub fn progress(&self) -> Option<ProgressReport> {
        self.progress.lock().ok().and_then(|p| p.clone())
    }

    /// Put every active node into its flashloader
    pub fn activate_flashloader(&mut self, fail_on_first_error: bool) -> Result<ActivationReport> {
        self.expect_state("activate_flashloader", &[SequencerState::Uninitialized])?;
        self.state = SequencerState::FlashloaderActivation;
        info!("Activating flashloaders on bus {}", self.active_bus);

        let phase = Phase::FlashloaderActivation;
        let mut report = ActivationReport::default();
        let active = self.active_indices();
        let mut progress = PhaseProgress::new(active.len() + 1);

        let is_direct_modern = |slot: &NodeSlot| {
            slot.route.is_direct() && matches!(slot.device, NodeDevice::Modern(_))
        };
        let direct_modern: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| self.slot(i).is_some_and(is_direct_modern))
            .collect();
        let direct_legacy: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| {
                self.slot(i).is_some_and(|s| {
                    s.route.is_direct() && matches!(s.device, NodeDevice::Legacy(_))
                })
            })
            .collect();
        let mut routed: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| self.slot(i).is_some_and(|s| !s.route.is_direct()))
            .collect();
        routed.sort_by_key(|&i| self.slot(i).map_or(0, |s| s.route.hops.len()));

        // Reset and catch the direct modern nodes
        if !direct_modern.is_empty() {
            let result = if self.modern.supports_broadcast() {
                self.report(
                    phase,
                    Step::Broadcast,
                    None,
                    StepResult::Started,
                    progress.percent(),
                    "Broadcast reset and enter pre-programming",
                );
                self.broadcast_activation()
            } else {
                self.request_programming(&direct_modern, &mut report)
            };
            match result {
                Ok(()) => {}
                Err(StepError::Aborted) => return Err(self.aborted(phase)),
                Err(StepError::Failed(failure)) => {
                    warn!("Broadcast activation failed: {}", failure);
                    report.warnings.push(format!("Broadcast activation failed: {}", failure));
                }
            }
        }
        progress.advance();

        for index in direct_modern {
            if self.is_failed(index) {
                progress.advance();
                continue;
            }
            let address = self.address(index);
            self.report(
                phase,
                Step::EnterFlashloader,
                Some(index),
                StepResult::Started,
                progress.percent(),
                "Enter pre-programming session",
            );
            let result = self
                .check_abort()
                .and_then(|_| {
                    self.modern
                        .enter_pre_programming_session(&address)
                        .map_err(|e| {
                            NodeFailure::protocol("enter pre-programming session", e).into()
                        })
                });
            self.finish_activation(index, result, fail_on_first_error, &mut report, &progress)?;
            progress.advance();
        }

        for index in direct_legacy {
            let address = self.address(index);
            self.report(
                phase,
                Step::EnterFlashloader,
                Some(index),
                StepResult::Started,
                progress.percent(),
                "Flash request and wake-up",
            );
            let result = self.check_abort().and_then(|_| self.wake_legacy(&address));
            self.finish_activation(index, result, fail_on_first_error, &mut report, &progress)?;
            progress.advance();
        }

        let mut waited = BTreeSet::new();
        for index in routed {
            self.report(
                phase,
                Step::EnterFlashloader,
                Some(index),
                StepResult::Started,
                progress.percent(),
                "Activate routed node",
            );
            let result = self.activate_routed(index, &mut waited);
            self.finish_activation(index, result, fail_on_first_error, &mut report, &progress)?;
            progress.advance();
        }

        let message = format!(
            "{} nodes activated, {} failed",
            report.activated.len(),
            report.failed.len()
        );
        info!("{}", message);
        self.report(phase, Step::Finished, None, StepResult::Succeeded, 100, message);
        Ok(report)
    }

    /// Read identity and capabilities of every activated node
    pub fn read_device_information(
        &mut self,
        fail_on_first_error: bool,
    ) -> Result<DeviceInfoReport> {
        self.expect_state(
            "read_device_information",
            &[SequencerState::FlashloaderActivation],
        )?;
        self.state = SequencerState::DeviceInfoRead;

        let phase = Phase::DeviceInfoRead;
        let mut report = DeviceInfoReport::default();
        let active = self.active_indices();
        let mut progress = PhaseProgress::new(active.len());

        for index in active {
            if self.is_failed(index) {
                progress.advance();
                continue;
            }

            self.report(
                phase,
                Step::ReadDeviceName,
                Some(index),
                StepResult::Started,
                progress.percent(),
                "Read device information",
            );
            match self.read_node_info(index) {
                Ok(info) => {
                    if let Some(warning) = self.name_policy_warning(index, &info.device_name) {
                        warn!("{}", warning);
                        self.report(
                            phase,
                            Step::ReadDeviceName,
                            Some(index),
                            StepResult::Warning,
                            progress.percent(),
                            warning.clone(),
                        );
                        report.warnings.push(warning);
                    }
                    self.set_status(index, NodeStatus::Identified);
                    report.devices.push(info);
                }
                Err(StepError::Aborted) => return Err(self.aborted(phase)),
                Err(StepError::Failed(failure)) => {
                    let name = self.node_name(index);
                    self.fail_node(phase, index, failure.clone());
                    if fail_on_first_error {
                        self.state = SequencerState::Aborted;
                        return Err(SequenceError::DeviceInfo { node: name, failure });
                    }
                    report.failed.push((index, failure));
                }
            }
            progress.advance();
        }

        self.report(
            phase,
            Step::Finished,
            None,
            StepResult::Succeeded,
            100,
            format!("{} devices read", report.devices.len()),
        );
        Ok(report)
    }

    /// Update the nodes in `order` with their jobs
    ///
    /// `jobs` holds one entry per node of the system definition. The whole job
    /// set is checked and every file is read before the first write.
    pub fn update_system(&mut self, jobs: &[FlashJob], order: &[usize]) -> Result<UpdateReport> {
        self.expect_state("update_system", &[SequencerState::DeviceInfoRead])?;
        let prepared = self.prepare_jobs(jobs, order)?;
        self.state = SequencerState::SystemUpdate;

        let phase = Phase::SystemUpdate;
        let mut report = UpdateReport::default();
        let mut progress = PhaseProgress::new(order.len());

        for (position, &index) in order.iter().enumerate() {
            if self.is_failed(index) {
                let message =
                    format!("Node {} skipped after earlier failure", self.node_name(index));
                warn!("{}", message);
                self.report(
                    phase,
                    Step::Finished,
                    Some(index),
                    StepResult::Warning,
                    progress.percent(),
                    message.clone(),
                );
                report.warnings.push(message);
                report.skipped.push(index);
                progress.advance();
                continue;
            }

            let result = match self.router_failure(index) {
                Some(failure) => Err(StepError::Failed(failure)),
                None => self.update_node(index, &prepared[position], &progress),
            };

            match result {
                Ok(()) => {
                    self.set_status(index, NodeStatus::Updated);
                    self.report(
                        phase,
                        Step::Finished,
                        Some(index),
                        StepResult::Succeeded,
                        progress.percent_within(NODE_DONE, NODE_DONE),
                        "Node updated",
                    );
                    report.updated.push(index);
                }
                Err(StepError::Aborted) => return Err(self.aborted(phase)),
                Err(StepError::Failed(failure)) => {
                    self.fail_node(phase, index, failure.clone());
                    report.failed.push((index, failure));
                }
            }
            progress.advance();
        }

        info!(
            "Update finished: {} updated, {} failed, {} skipped",
            report.updated.len(),
            report.failed.len(),
            report.skipped.len()
        );
        self.report(
            phase,
            Step::Finished,
            None,
            StepResult::Succeeded,
            100,
            "System update finished",
        );
        Ok(report)
    }

    /// Reset every node that entered its flashloader
    ///
    /// Per node failures are recorded and the remaining nodes are still reset.
    /// Allowed after an abort so nodes do not stay in their flashloaders.
    pub fn reset_system(&mut self) -> Result<ResetReport> {
        self.expect_state(
            "reset_system",
            &[
                SequencerState::FlashloaderActivation,
                SequencerState::DeviceInfoRead,
                SequencerState::SystemUpdate,
                SequencerState::Aborted,
            ],
        )?;
        self.state = SequencerState::SystemReset;

        let phase = Phase::SystemReset;
        let mut report = ResetReport::default();

        let mut targets: Vec<usize> = self
            .active_indices()
            .into_iter()
            .filter(|&i| self.slot(i).is_some_and(|s| s.in_flashloader))
            .collect();
        // Nodes behind routers first so the routers stay reachable
        targets.sort_by_key(|&i| std::cmp::Reverse(self.slot(i).map_or(0, |s| s.route.hops.len())));
        let mut progress = PhaseProgress::new(targets.len());

        let use_broadcast = self.modern.supports_broadcast();
        let mut broadcast_nodes = Vec::new();
        let mut wait = Duration::ZERO;

        for index in targets {
            let Some(slot) = self.slot(index) else {
                continue;
            };
            let address = *slot.device.address();
            let direct = slot.route.is_direct();
            let modern = matches!(slot.device, NodeDevice::Modern(_));
            let fundamental = slot.status == NodeStatus::Updated;

            if direct && modern && use_broadcast {
                broadcast_nodes.push((index, fundamental));
                continue;
            }

            self.report(
                phase,
                Step::Reset,
                Some(index),
                StepResult::Started,
                progress.percent(),
                "Reset node",
            );
            let result = self.open_route(phase, index).and_then(|_| {
                let sent = if modern {
                    self.modern.ecu_reset(&address)
                } else {
                    self.legacy.reset(&address)
                };
                sent.map_err(|e| NodeFailure::protocol("reset", e).into())
            });
            match result {
                Ok(()) => {
                    wait = wait.max(self.reset_wait(index, fundamental));
                    self.mark_reset(index, &mut report);
                }
                Err(StepError::Failed(failure)) => {
                    self.reset_failed(index, failure, &mut report);
                }
                // open_route does not poll the abort signal
                Err(StepError::Aborted) => {}
            }
            progress.advance();
        }

        if !broadcast_nodes.is_empty() {
            self.report(
                phase,
                Step::Broadcast,
                None,
                StepResult::Started,
                progress.percent(),
                "Broadcast reset",
            );
            let bus_id = self.active_bus_id();
            match self.modern.broadcast_ecu_reset(bus_id) {
                Ok(()) => {
                    for (index, fundamental) in broadcast_nodes {
                        wait = wait.max(self.reset_wait(index, fundamental));
                        self.mark_reset(index, &mut report);
                        progress.advance();
                    }
                }
                Err(e) => {
                    for (index, _) in broadcast_nodes {
                        let failure = NodeFailure::protocol("broadcast reset", e.clone());
                        self.reset_failed(index, failure, &mut report);
                        progress.advance();
                    }
                }
            }
        }

        if !wait.is_zero() {
            self.report(
                phase,
                Step::WaitAfterReset,
                None,
                StepResult::Running,
                progress.percent(),
                format!("Waiting {} ms for nodes to restart", wait.as_millis()),
            );
            std::thread::sleep(wait);
        }

        self.state = SequencerState::Done;
        self.report(
            phase,
            Step::Finished,
            None,
            StepResult::Succeeded,
            100,
            format!("{} nodes reset, {} failed", report.reset.len(), report.failed.len()),
        );
        Ok(report)
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SequencerState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SequenceError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn slot(&self, index: usize) -> Option<&NodeSlot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, index: usize) -> Option<&mut NodeSlot> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    fn active_indices(&self) -> Vec<usize> {
        (0..self.slots.len()).filter(|&i| self.slots[i].is_some()).collect()
    }

    fn address(&self, index: usize) -> NodeAddress {
        self.slot(index)
            .map(|s| *s.device.address())
            .unwrap_or_else(|| NodeAddress::new(0, 0))
    }

    fn node_name(&self, index: usize) -> String {
        self.system
            .node(index)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| index.to_string())
    }

    fn active_bus_id(&self) -> u8 {
        self.system.bus(self.active_bus).map_or(0, |b| b.bus_id)
    }

    fn is_failed(&self, index: usize) -> bool {
        self.slot(index).is_some_and(|s| s.status.is_failed())
    }

    fn set_status(&mut self, index: usize, status: NodeStatus) {
        if let Some(slot) = self.slot_mut(index) {
            slot.status = status;
        }
    }

    fn fail_node(&mut self, phase: Phase, index: usize, failure: NodeFailure) {
        let message = format!("Node {} failed: {}", self.node_name(index), failure);
        warn!("{}", message);
        self.set_status(index, NodeStatus::Failed(failure));
        let percent = self.last_percent;
        self.report(phase, Step::Finished, Some(index), StepResult::Failed, percent, message);
    }

    fn finish_activation(
        &mut self,
        index: usize,
        result: StepResultOf<()>,
        fail_on_first_error: bool,
        report: &mut ActivationReport,
        progress: &PhaseProgress,
    ) -> Result<()> {
        let phase = Phase::FlashloaderActivation;
        match result {
            Ok(()) => {
                if let Some(slot) = self.slot_mut(index) {
                    slot.status = NodeStatus::Activated;
                    slot.in_flashloader = true;
                }
                debug!("Node {} is in its flashloader", self.node_name(index));
                self.report(
                    phase,
                    Step::EnterFlashloader,
                    Some(index),
                    StepResult::Succeeded,
                    progress.percent_within(1, 1),
                    "Flashloader active",
                );
                report.activated.push(index);
                Ok(())
            }
            Err(StepError::Aborted) => Err(self.aborted(phase)),
            Err(StepError::Failed(failure)) => {
                let name = self.node_name(index);
                self.fail_node(phase, index, failure.clone());
                if fail_on_first_error {
                    self.state = SequencerState::Aborted;
                    return Err(SequenceError::Activation {
                        node: name,
                        failure,
                    });
                }
                report.failed.push((index, failure));
                Ok(())
            }
        }
    }

    fn aborted(&mut self, phase: Phase) -> SequenceError {
        warn!("Run aborted during {:?}", phase);
        self.state = SequencerState::Aborted;
        let percent = self.last_percent;
        self.report(phase, Step::Finished, None, StepResult::Aborted, percent, "Aborted by user");
        SequenceError::Aborted
    }

    fn report(
        &mut self,
        phase: Phase,
        step: Step,
        node: Option<usize>,
        result: StepResult,
        progress: u8,
        message: impl Into<String>,
    ) {
        let report = ProgressReport {
            phase,
            step,
            node,
            result,
            progress: progress.min(100),
            message: message.into(),
        };
        debug!("{:?}/{:?} {}% {}", report.phase, report.step, report.progress, report.message);

        self.last_percent = report.progress;
        self.observer.report(&report);
        if let Ok(mut last) = self.progress.lock() {
            *last = Some(report);
        }
    }

    fn check_abort(&self) -> StepResultOf<()> {
        if self.abort.is_aborted() {
            Err(StepError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, polling the abort signal
    fn wait(&self, duration: Duration) -> StepResultOf<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_abort()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(self.config.abort_poll_interval()));
        }
    }

    fn reset_wait(&self, index: usize, fundamental: bool) -> Duration {
        let kind = self
            .slot(index)
            .and_then(|s| self.system.bus(s.route.target_bus))
            .map_or(BusKind::Can, |b| b.kind);
        self.system
            .node(index)
            .and_then(|n| self.devices.find(&n.device_type))
            .map(|entry| entry.definition.reset_wait.for_bus(kind, fundamental))
            .unwrap_or_else(|| self.config.default_reset_wait())
    }

    /// Reset broadcast followed by enter-pre-programming broadcasts for the activation window
    fn broadcast_activation(&mut self) -> StepResultOf<()> {
        let bus_id = self.active_bus_id();
        self.modern
            .broadcast_ecu_reset(bus_id)
            .map_err(|e| NodeFailure::protocol("broadcast reset", e))?;

        let deadline = Instant::now() + self.config.activation_window();
        loop {
            self.check_abort()?;
            self.modern
                .broadcast_enter_pre_programming(bus_id)
                .map_err(|e| NodeFailure::protocol("broadcast enter pre-programming", e))?;
            if Instant::now() >= deadline {
                return Ok(());
            }
            self.wait(self.config.broadcast_interval())?;
        }
    }

    /// Per node request-programming and reset when broadcasts are not available
    fn request_programming(
        &mut self,
        nodes: &[usize],
        report: &mut ActivationReport,
    ) -> StepResultOf<()> {
        let mut wait = Duration::ZERO;
        for &index in nodes {
            self.check_abort()?;
            let address = self.address(index);
            let result = self
                .modern
                .request_programming(&address)
                .and_then(|_| self.modern.ecu_reset(&address));
            match result {
                Ok(()) => wait = wait.max(self.reset_wait(index, false)),
                Err(e) => {
                    let message = format!("Reset of node {} failed: {}", self.node_name(index), e);
                    warn!("{}", message);
                    report.warnings.push(message);
                }
            }
        }
        self.wait(wait)
    }

    fn wake_legacy(&mut self, address: &NodeAddress) -> StepResultOf<()> {
        // A node already waiting in its flashloader ignores the request
        if let Err(e) = self.legacy.send_flash_request(address) {
            debug!("Flash request to {} not answered: {}", address, e);
        }
        self.check_abort()?;
        self.legacy
            .wake_up(address)
            .map_err(|e| NodeFailure::protocol("wake-up", e).into())
    }

    fn activate_routed(&mut self, index: usize, waited: &mut BTreeSet<usize>) -> StepResultOf<()> {
        if let Some(failure) = self.router_failure(index) {
            return Err(failure.into());
        }

        let routers: Vec<usize> = self
            .slot(index)
            .map(|s| s.route.routers().collect())
            .unwrap_or_default();
        for router in routers {
            if waited.insert(router) {
                self.report(
                    Phase::FlashloaderActivation,
                    Step::WaitAfterReset,
                    Some(router),
                    StepResult::Running,
                    self.last_percent,
                    "Waiting for router restart",
                );
                self.wait(self.reset_wait(router, false))?;
            }
        }

        self.open_route(Phase::FlashloaderActivation, index)?;
        let address = self.address(index);

        let modern = self
            .slot(index)
            .is_some_and(|s| matches!(s.device, NodeDevice::Modern(_)));
        if modern {
            self.modern
                .request_programming(&address)
                .and_then(|_| self.modern.ecu_reset(&address))
                .map_err(|e| NodeFailure::protocol("request programming", e))?;
            self.wait(self.reset_wait(index, false))?;
            self.check_abort()?;
            self.modern
                .enter_pre_programming_session(&address)
                .map_err(|e| NodeFailure::protocol("enter pre-programming session", e).into())
        } else {
            self.wake_legacy(&address)
        }
    }

    /// First failed active router on the way to `index`
    fn router_failure(&self, index: usize) -> Option<NodeFailure> {
        let slot = self.slot(index)?;
        slot.route
            .routers()
            .find(|&router| self.is_failed(router))
            .map(|router| NodeFailure::RouterUnavailable {
                router: self.node_name(router),
            })
    }

    /// Activate routing on every hop towards `index`
    fn open_route(&mut self, phase: Phase, index: usize) -> StepResultOf<()> {
        let hops = match self.slot(index) {
            Some(slot) if !slot.route.is_direct() => slot.route.hops.clone(),
            _ => return Ok(()),
        };

        for hop in hops {
            let router = node_address(self.system, hop.router, hop.in_bus).ok_or_else(|| {
                NodeFailure::RouterUnavailable {
                    router: self.node_name(hop.router),
                }
            })?;
            let out_bus_id = self.system.bus(hop.out_bus).map_or(0, |b| b.bus_id);

            debug!("Routing via {} to bus {}", self.node_name(hop.router), out_bus_id);
            self.report(
                phase,
                Step::ActivateRouting,
                Some(hop.router),
                StepResult::Running,
                self.last_percent,
                format!("Activate routing to bus {}", out_bus_id),
            );
            self.modern
                .activate_routing(&router, out_bus_id)
                .map_err(|_| NodeFailure::RouterUnavailable {
                    router: self.node_name(hop.router),
                })?;
        }
        Ok(())
    }

    fn read_node_info(&mut self, index: usize) -> StepResultOf<DeviceInfo> {
        if let Some(failure) = self.router_failure(index) {
            return Err(failure.into());
        }
        self.open_route(Phase::DeviceInfoRead, index)?;

        let Some(device) = self.slot(index).map(|s| s.device.clone()) else {
            return Err(NodeFailure::FeatureUnsupported("node is not active".into()).into());
        };

        let (device, info) = match device {
            NodeDevice::Modern(mut node) => {
                let address = node.address;
                self.check_abort()?;
                let name = self
                    .modern
                    .read_device_name(&address)
                    .map_err(|e| NodeFailure::protocol("read device name", e))?;
                self.check_abort()?;
                self.report_info_step(index, Step::ReadFlashloaderInfo, "Read flashloader info");
                let flashloader = self
                    .modern
                    .read_flashloader_info(&address)
                    .map_err(|e| NodeFailure::protocol("read flashloader information", e))?;
                self.check_abort()?;
                self.report_info_step(index, Step::ReadFlashBlocks, "Read flash blocks");
                let flash_blocks = self
                    .modern
                    .read_flash_blocks(&address)
                    .map_err(|e| NodeFailure::protocol("read flash blocks", e))?;

                debug!(
                    "Node {}: {} flashloader {} with {} flash blocks",
                    self.node_name(index),
                    name,
                    flashloader.version,
                    flash_blocks.len()
                );
                node.device_name = Some(name.clone());
                node.flashloader = Some(flashloader.clone());
                node.flash_blocks = flash_blocks.clone();
                (
                    NodeDevice::Modern(node),
                    DeviceInfo {
                        node: index,
                        device_name: name,
                        details: DeviceDetails::Modern {
                            flashloader,
                            flash_blocks,
                        },
                    },
                )
            }
            NodeDevice::Legacy(mut node) => {
                let address = node.address;
                self.check_abort()?;
                self.legacy
                    .wake_up(&address)
                    .map_err(|e| NodeFailure::protocol("wake-up", e))?;
                self.check_abort()?;
                let name = self
                    .legacy
                    .read_device_name(&address)
                    .map_err(|e| NodeFailure::protocol("read device name", e))?;
                self.check_abort()?;
                self.report_info_step(index, Step::ReadLegacyDeviceInfo, "Read device info");
                let info = self
                    .legacy
                    .read_device_info(&address)
                    .map_err(|e| NodeFailure::protocol("read device information", e))?;
                self.check_abort()?;
                let checksum = self
                    .legacy
                    .read_checksum(&address)
                    .map_err(|e| NodeFailure::protocol("read checksum", e))?;

                node.device_name = Some(name.clone());
                node.info = Some(info.clone());
                node.checksum = Some(checksum);
                (
                    NodeDevice::Legacy(node),
                    DeviceInfo {
                        node: index,
                        device_name: name,
                        details: DeviceDetails::Legacy { info, checksum },
                    },
                )
            }
        };

        if let Some(slot) = self.slot_mut(index) {
            slot.device = device;
        }
        Ok(info)
    }

    fn report_info_step(&mut self, index: usize, step: Step, message: &str) {
        let percent = self.last_percent;
        self.report(
            Phase::DeviceInfoRead,
            step,
            Some(index),
            StepResult::Running,
            percent,
            message,
        );
    }

    fn name_policy_warning(&self, index: usize, reported: &str) -> Option<String> {
        let node = self.system.node(index)?;
        let accepted = reported == node.device_type
            || self
                .devices
                .find(&node.device_type)
                .is_some_and(|entry| entry.definition.accepts_name(reported));
        (!accepted).then(|| {
            format!(
                "Node {} reports device name {}, expected {}",
                node.name, reported, node.device_type
            )
        })
    }

    /// Check the job set and read every file
    fn prepare_jobs<'j>(
        &self,
        jobs: &'j [FlashJob],
        order: &[usize],
    ) -> Result<Vec<PreparedJob<'j>>> {
        if jobs.len() != self.system.node_count() {
            return Err(SequenceError::Config(format!(
                "got {} flash jobs for {} nodes",
                jobs.len(),
                self.system.node_count()
            )));
        }
        if order.is_empty() {
            return Err(SequenceError::Config("update order is empty".into()));
        }

        let mut seen = BTreeSet::new();
        let mut prepared = Vec::with_capacity(order.len());
        for &index in order {
            let name = self.node_name(index);
            if index >= jobs.len() {
                return Err(SequenceError::Config(format!(
                    "update order refers to unknown node {}",
                    index
                )));
            }
            if !seen.insert(index) {
                return Err(SequenceError::Config(format!(
                    "node {} appears twice in the update order",
                    name
                )));
            }
            if self.slot(index).is_none() {
                return Err(SequenceError::Config(format!("node {} is not active", name)));
            }

            let job = &jobs[index];
            if !job.has_content() {
                return Err(SequenceError::Config(format!(
                    "node {} has nothing to update",
                    name
                )));
            }
            for file in job.files() {
                if !file.is_file() {
                    return Err(SequenceError::Config(format!(
                        "file {} of node {} not found",
                        file.display(),
                        name
                    )));
                }
            }

            let file_based = self.file_based_transfer(index);
            let applications = job
                .application_files
                .iter()
                .map(|path| -> Result<Payload> {
                    if file_based {
                        Ok(Payload::File {
                            name: file_name(path),
                            data: fs::read(path)?,
                        })
                    } else {
                        Ok(Payload::Hex {
                            path: path.clone(),
                            image: load_hex(path)?,
                        })
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            let nvm = job
                .nvm_files
                .iter()
                .map(|path| load_hex(path))
                .collect::<Result<Vec<_>>>()?;
            let pem = job.pem_file.as_ref().map(fs::read).transpose()?;

            prepared.push(PreparedJob {
                job,
                applications,
                nvm,
                pem,
            });
        }

        Ok(prepared)
    }

    fn file_based_transfer(&self, index: usize) -> bool {
        let modern = self
            .slot(index)
            .is_some_and(|s| matches!(s.device, NodeDevice::Modern(_)));
        modern
            && self
                .system
                .node(index)
                .and_then(|n| self.devices.find(&n.device_type))
                .is_some_and(|entry| entry.definition.file_based_transfer)
    }

    /// Report an update sub-step of one node
    fn node_step(
        &mut self,
        progress: &PhaseProgress,
        permille: u64,
        step: Step,
        index: usize,
        message: impl Into<String>,
    ) {
        let percent = progress.percent_within(permille, NODE_DONE);
        self.report(Phase::SystemUpdate, step, Some(index), StepResult::Running, percent, message);
    }

    fn update_node(
        &mut self,
        index: usize,
        prepared: &PreparedJob<'_>,
        progress: &PhaseProgress,
    ) -> StepResultOf<()> {
        let name = self.node_name(index);
        info!("Updating node {}", name);
        self.check_abort()?;
        self.open_route(Phase::SystemUpdate, index)?;

        let Some(device) = self.slot(index).map(|s| s.device.clone()) else {
            return Err(NodeFailure::FeatureUnsupported("node is not active".into()).into());
        };

        self.node_step(progress, 0, Step::CheckName, index, "Check device name");
        self.check_name(index, &device, prepared.job)?;

        self.node_step(
            progress,
            CHECK_MEMORY_AT,
            Step::CheckMemory,
            index,
            "Check memory and features",
        );
        check_memory(&device, prepared)?;

        match device {
            NodeDevice::Modern(node) => {
                let features = node
                    .flashloader
                    .as_ref()
                    .map(|f| f.features)
                    .unwrap_or_default();
                self.update_modern(index, &node.address, features, prepared, progress)
            }
            NodeDevice::Legacy(node) => {
                self.update_legacy(index, &node.address, prepared, progress)
            }
        }
    }

    fn check_name(&self, index: usize, device: &NodeDevice, job: &FlashJob) -> StepResultOf<()> {
        let expected = self
            .system
            .node(index)
            .map(|n| n.device_type.clone())
            .unwrap_or_default();
        let reported = device.device_name().unwrap_or_default();

        let accepted = job.accepts_device_name(&expected, reported)
            || self
                .devices
                .find(&expected)
                .is_some_and(|entry| entry.definition.accepts_name(reported));
        if accepted {
            Ok(())
        } else {
            Err(NodeFailure::DeviceMismatch {
                expected,
                reported: reported.to_string(),
            }
            .into())
        }
    }

    fn update_modern(
        &mut self,
        index: usize,
        address: &NodeAddress,
        features: ModernFeatures,
        prepared: &PreparedJob<'_>,
        progress: &PhaseProgress,
    ) -> StepResultOf<()> {
        self.check_abort()?;
        self.modern
            .enter_programming_session(address)
            .map_err(|e| NodeFailure::protocol("enter programming session", e))?;

        if self.config.write_fingerprint
            && features.fingerprint
            && !prepared.applications.is_empty()
        {
            self.node_step(progress, FINGERPRINT_AT, Step::Fingerprint, index, "Write fingerprint");
            let fingerprint = Fingerprint::now(&self.config.resolved_fingerprint_user());
            self.check_abort()?;
            self.modern
                .write_fingerprint(address, &fingerprint)
                .map_err(|e| NodeFailure::protocol("write fingerprint", e))?;
        }

        let block_limit = features
            .max_block_size
            .map_or(self.config.max_block_size, |max| max.min(self.config.max_block_size));
        let total: u64 = prepared.applications.iter().map(Payload::size).sum();
        let mut sent: u64 = 0;

        if !prepared.applications.is_empty() {
            self.set_status(index, NodeStatus::Incomplete);
        }

        for payload in &prepared.applications {
            match payload {
                Payload::Hex { path, image } => {
                    debug!("Transferring {} ({} areas)", path.display(), image.areas.len());
                    for area in &image.areas {
                        self.check_abort()?;
                        let len = transfer_len(area.len())?;
                        let accepted = self
                            .modern
                            .request_download(address, area.address, len)
                            .map_err(|e| NodeFailure::protocol("request download", e))?;
                        let block = accepted.min(block_limit).max(1) as usize;
                        self.transfer_blocks(
                            index, address, &area.data, block, total, &mut sent, progress,
                        )?;
                        self.modern
                            .request_transfer_exit(address)
                            .map_err(|e| NodeFailure::protocol("request transfer exit", e))?;
                    }
                }
                Payload::File { name, data } => {
                    self.check_abort()?;
                    let len = transfer_len(data.len())?;
                    let accepted = self
                        .modern
                        .request_file_transfer(address, name, len)
                        .map_err(|e| NodeFailure::protocol("request file transfer", e))?;
                    let block = accepted.min(block_limit).max(1) as usize;
                    self.transfer_blocks(index, address, data, block, total, &mut sent, progress)?;
                    self.modern
                        .request_transfer_exit(address)
                        .map_err(|e| NodeFailure::protocol("request transfer exit", e))?;
                }
            }
        }

        if !prepared.nvm.is_empty() {
            self.node_step(progress, NVM_AT, Step::WriteNvm, index, "Write NVM parameters");
            for image in &prepared.nvm {
                for area in &image.areas {
                    self.check_abort()?;
                    self.modern
                        .write_nvm(address, area.address, &area.data)
                        .map_err(|e| NodeFailure::protocol("write NVM", e))?;
                }
            }
        }

        if let Some(pem) = &prepared.pem {
            self.node_step(progress, PEM_AT, Step::WritePem, index, "Write PEM file");
            self.check_abort()?;
            self.modern
                .write_pem(address, pem)
                .map_err(|e| NodeFailure::protocol("write PEM", e))?;
        }

        let job = prepared.job;
        if job.send_security_state {
            self.node_step(
                progress,
                SECURITY_AT,
                Step::WriteSecurityState,
                index,
                "Write security state",
            );
            self.check_abort()?;
            self.modern
                .write_security_state(address, job.security_enabled)
                .map_err(|e| NodeFailure::protocol("write security state", e))?;
        }

        if job.send_debugger_state {
            self.node_step(
                progress,
                DEBUGGER_AT,
                Step::WriteDebuggerState,
                index,
                "Write debugger state",
            );
            self.check_abort()?;
            self.modern
                .write_debugger_state(address, job.debugger_enabled)
                .map_err(|e| NodeFailure::protocol("write debugger state", e))?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer_blocks(
        &mut self,
        index: usize,
        address: &NodeAddress,
        data: &[u8],
        block: usize,
        total: u64,
        sent: &mut u64,
        progress: &PhaseProgress,
    ) -> StepResultOf<()> {
        let mut sequence: u8 = 1;
        for chunk in data.chunks(block) {
            self.check_abort()?;
            self.modern
                .transfer_data(address, sequence, chunk)
                .map_err(|e| NodeFailure::protocol("transfer data", e))?;
            sequence = sequence.wrapping_add(1);
            *sent += chunk.len() as u64;

            let permille = transfer_permille(*sent, total);
            self.node_step(
                progress,
                permille,
                Step::TransferFiles,
                index,
                format!("{} of {} bytes", sent, total),
            );
        }
        Ok(())
    }

    fn update_legacy(
        &mut self,
        index: usize,
        address: &NodeAddress,
        prepared: &PreparedJob<'_>,
        progress: &PhaseProgress,
    ) -> StepResultOf<()> {
        let chunk_size = self.config.legacy_program_chunk.max(1) as usize;
        let total: u64 = prepared.applications.iter().map(Payload::size).sum();
        let mut sent: u64 = 0;

        self.set_status(index, NodeStatus::Incomplete);
        for payload in &prepared.applications {
            let Payload::Hex { image, .. } = payload else {
                return Err(NodeFailure::FeatureUnsupported("file based transfer".into()).into());
            };

            for area in &image.areas {
                self.check_abort()?;
                let len = transfer_len(area.len())?;
                self.legacy
                    .erase(address, area.address, len)
                    .map_err(|e| NodeFailure::protocol("erase", e))?;

                let mut target = area.address;
                for chunk in area.data.chunks(chunk_size) {
                    self.check_abort()?;
                    self.legacy
                        .program(address, target, chunk)
                        .map_err(|e| NodeFailure::protocol("program", e))?;
                    target = target.wrapping_add(chunk.len() as u32);
                    sent += chunk.len() as u64;

                    let permille = transfer_permille(sent, total);
                    self.node_step(
                        progress,
                        permille,
                        Step::TransferFiles,
                        index,
                        format!("{} of {} bytes", sent, total),
                    );
                }
            }
        }

        self.check_abort()?;
        self.legacy
            .finish(address)
            .map_err(|e| NodeFailure::protocol("finish programming", e))?;
        let checksum = self
            .legacy
            .read_checksum(address)
            .map_err(|e| NodeFailure::protocol("read checksum", e))?;

        if let Some(NodeSlot {
            device: NodeDevice::Legacy(node),
            ..
        }) = self.slot_mut(index)
        {
            node.checksum = Some(checksum);
        }
        let percent = progress.percent_within(TRANSFER_TO, NODE_DONE);
        self.report(
            Phase::SystemUpdate,
            Step::ReadChecksum,
            Some(index),
            StepResult::Succeeded,
            percent,
            format!("Checksum 0x{:08X}", checksum),
        );
        Ok(())
    }

    fn mark_reset(&mut self, index: usize, report: &mut ResetReport) {
        if let Some(slot) = self.slot_mut(index) {
            slot.in_flashloader = false;
            if !slot.status.is_failed() {
                slot.status = NodeStatus::Reset;
            }
        }
        report.reset.push(index);
    }

    fn reset_failed(&mut self, index: usize, failure: NodeFailure, report: &mut ResetReport) {
        let message = format!("Reset of node {} failed: {}", self.node_name(index), failure);
        warn!("{}", message);
        let percent = self.last_percent;
        self.report(
            Phase::SystemReset,
            Step::Reset,
            Some(index),
            StepResult::Warning,
            percent,
            message,
        );
        report.failed.push((index, failure));
    }
}

/// Address of node `index` on bus `bus_index`
fn node_address(system: &SystemDefinition, index: usize, bus_index: usize) -> Option<NodeAddress> {
    let interface = system.node(index)?.interface_on(bus_index)?;
    let bus = system.bus(bus_index)?;
    Some(NodeAddress {
        bus_id: bus.bus_id,
        node_id: interface.node_id,
        ip_address: interface.ip_address,
    })
}

fn load_hex(path: &Path) -> Result<HexImage> {
    HexImage::load(path).map_err(|source| SequenceError::Hex {
        path: path.to_path_buf(),
        source,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn transfer_permille(sent: u64, total: u64) -> u64 {
    if total == 0 {
        return TRANSFER_TO;
    }
    TRANSFER_FROM + (TRANSFER_TO - TRANSFER_FROM) * sent.min(total) / total
}

fn inside(blocks: &[FlashBlock], address: u32, len: usize) -> bool {
    blocks.iter().any(|block| block.contains(address, len))
}

/// Memory layout and feature checks before anything is written
fn check_memory(
    device: &NodeDevice,
    prepared: &PreparedJob<'_>,
) -> std::result::Result<(), NodeFailure> {
    let job = prepared.job;
    match device {
        NodeDevice::Modern(node) => {
            let features = node
                .flashloader
                .as_ref()
                .map(|f| f.features)
                .unwrap_or_default();

            for payload in &prepared.applications {
                match payload {
                    Payload::Hex { path, image } => {
                        for area in &image.areas {
                            if !inside(&node.flash_blocks, area.address, area.len()) {
                                return Err(NodeFailure::FeatureUnsupported(format!(
                                    "{}: area 0x{:08X}..0x{:08X} is outside the flash blocks",
                                    path.display(),
                                    area.address,
                                    area.end()
                                )));
                            }
                        }
                    }
                    Payload::File { .. } if !features.file_based_transfer => {
                        return Err(NodeFailure::FeatureUnsupported("file based transfer".into()));
                    }
                    Payload::File { .. } => {}
                }
            }

            let required = [
                (!prepared.nvm.is_empty(), features.nvm_write, "NVM write"),
                (prepared.pem.is_some(), features.pem_write, "PEM write"),
                (job.send_security_state, features.security_state, "security state"),
                (job.send_debugger_state, features.debugger_state, "debugger state"),
            ];
            match required.iter().find(|(needed, supported, _)| *needed && !*supported) {
                Some((_, _, what)) => Err(NodeFailure::FeatureUnsupported(what.to_string())),
                None => Ok(()),
            }
        }
        NodeDevice::Legacy(node) => {
            if !prepared.nvm.is_empty() || prepared.pem.is_some() {
                return Err(NodeFailure::FeatureUnsupported(
                    "NVM and PEM files on a legacy flashloader".into(),
                ));
            }
            if job.send_security_state || job.send_debugger_state {
                return Err(NodeFailure::FeatureUnsupported(
                    "security or debugger state on a legacy flashloader".into(),
                ));
            }

            let sectors = node
                .info
                .as_ref()
                .map(|info| info.sectors.as_slice())
                .unwrap_or_default();
            for payload in &prepared.applications {
                if let Payload::Hex { path, image } = payload {
                    if let Some(area) = image
                        .areas
                        .iter()
                        .find(|area| !covered(sectors, area.address, area.len()))
                    {
                        return Err(NodeFailure::FeatureUnsupported(format!(
                            "{}: area 0x{:08X}..0x{:08X} is not covered by flash sectors",
                            path.display(),
                            area.address,
                            area.end()
                        )));
                    }
                }
            }
            Ok(())
        }
    }
}

/// Length field of a transfer request; the protocols carry 32 bits
fn transfer_len(len: usize) -> std::result::Result<u32, NodeFailure> {
    u32::try_from(len)
        .map_err(|_| NodeFailure::FeatureUnsupported(format!("transfer of {} bytes", len)))
}

/// Whether contiguous sectors cover `address..address + len`
fn covered(sectors: &[FlashBlock], address: u32, len: usize) -> bool {
    let end = u64::from(address) + len as u64;
    let mut position = u64::from(address);
    while position < end {
        let next = sectors.iter().find(|s| {
            u64::from(s.address) <= position && position < u64::from(s.address) + u64::from(s.size)
        });
        match next {
            Some(sector) => position = u64::from(sector.address) + u64::from(sector.size),
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_permille_bounds() {
        assert_eq!(transfer_permille(0, 100), TRANSFER_FROM);
        assert_eq!(transfer_permille(100, 100), TRANSFER_TO);
        assert_eq!(transfer_permille(500, 100), TRANSFER_TO);
        assert_eq!(transfer_permille(0, 0), TRANSFER_TO);
        assert!(transfer_permille(50, 100) > TRANSFER_FROM);
    }

    #[test]
    fn test_transfer_len_limit() {
        assert_eq!(transfer_len(0x100), Ok(0x100));
        assert_eq!(transfer_len(u32::MAX as usize), Ok(u32::MAX));
        if let Some(len) = (u32::MAX as usize).checked_add(1) {
            assert!(matches!(
                transfer_len(len),
                Err(NodeFailure::FeatureUnsupported(message)) if message.contains("bytes")
            ));
        }
    }

    #[test]
    fn test_sectors_cover_area() {
        let sectors = [
            FlashBlock {
                address: 0x0000,
                size: 0x1000,
            },
            FlashBlock {
                address: 0x1000,
                size: 0x1000,
            },
            FlashBlock {
                address: 0x4000,
                size: 0x1000,
            },
        ];
        assert!(covered(&sectors, 0x0800, 0x1000));
        assert!(covered(&sectors, 0x4000, 0x1000));
        assert!(!covered(&sectors, 0x1800, 0x1000));
        assert!(!covered(&[], 0, 1));
        assert!(covered(&sectors, 0x2000, 0));
    }

    #[test]
    fn test_single_block_check() {
        let blocks = [FlashBlock {
            address: 0x8000,
            size: 0x100,
        }];
        assert!(inside(&blocks, 0x8000, 0x100));
        assert!(!inside(&blocks, 0x8080, 0x100));
    }
}
