//! Capture controller - binds an input device callback to a data sink

use crate::audio::{negotiate_format, AudioFormat, CaptureBuffer};
use crate::device::{CaptureDevice, DeviceCallback, InputBackend, Rejected};
use crate::error::{CaptureError, Result};
use crate::sink::SharedSink;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    Idle = 0,
    Opening = 1,
    Running = 2,
    Stopping = 3,
    Closed = 4,
    Failed = 5,
}

impl ControllerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ControllerState::Idle,
            1 => ControllerState::Opening,
            2 => ControllerState::Running,
            3 => ControllerState::Stopping,
            4 => ControllerState::Closed,
            _ => ControllerState::Failed,
        }
    }

    /// No transition leaves a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Closed | ControllerState::Failed)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Opening => "opening",
            ControllerState::Running => "running",
            ControllerState::Stopping => "stopping",
            ControllerState::Closed => "closed",
            ControllerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to do with samples still held by the device when capture stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualPolicy {
    /// Deliver them to the sink before the end-of-stream notification
    Flush,
    /// Drop them
    Discard,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Input device index passed to the backend
    pub device_index: u32,
    /// Number of capture buffers kept queued on the device
    pub buffer_count: usize,
    pub residual: ResidualPolicy,
    /// How long stop waits for the device's close notification
    pub close_timeout: Duration,
    /// Sleep between polls while waiting for an in-flight callback
    pub poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            buffer_count: 3,
            residual: ResidualPolicy::Flush,
            close_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// State shared between the caller and the device callback thread
struct Shared {
    state: AtomicU8,
    /// Set while a callback is inside the data path
    processing: AtomicBool,
    sink: Mutex<Option<SharedSink>>,
    /// Buffers returned by callbacks while not running
    parked: Mutex<Vec<CaptureBuffer>>,
    /// First error raised on the callback thread
    fault: Mutex<Option<CaptureError>>,
    faulted: AtomicBool,
    block_align: AtomicUsize,
    bytes_delivered: AtomicU64,
    /// Whether the close notification should end the sink's stream
    notify_on_close: AtomicBool,
    stopped_delivered: AtomicBool,
    close_tx: Sender<()>,
    close_rx: Receiver<()>,
}

impl Shared {
    fn new() -> Self {
        let (close_tx, close_rx) = bounded(1);
        Self {
            state: AtomicU8::new(ControllerState::Idle as u8),
            processing: AtomicBool::new(false),
            sink: Mutex::new(None),
            parked: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
            faulted: AtomicBool::new(false),
            block_align: AtomicUsize::new(1),
            bytes_delivered: AtomicU64::new(0),
            notify_on_close: AtomicBool::new(false),
            stopped_delivered: AtomicBool::new(false),
            close_tx,
            close_rx,
        }
    }

    fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ControllerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: ControllerState, to: ControllerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn latch_fault(&self, err: CaptureError) {
        error!("Capture callback failed: {}", err);
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(err);
        }
        self.faulted.store(true, Ordering::Release);
    }

    /// Forward the whole frames of `buffer` to the sink
    fn deliver(&self, buffer: &CaptureBuffer) {
        let align = self.block_align.load(Ordering::Relaxed).max(1);
        let recorded = buffer.recorded();
        let len = recorded.len() - recorded.len() % align;
        if len == 0 {
            return;
        }

        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            if let Err(e) = sink.lock().on_new_data(&recorded[..len]) {
                warn!("Sink rejected {} bytes: {}", len, e);
            }
        }
        self.bytes_delivered.fetch_add(len as u64, Ordering::Relaxed);
        trace!("Delivered buffer {} ({} bytes)", buffer.id(), len);
    }

    /// End the sink's stream, at most once
    fn deliver_stopped(&self) {
        if self.stopped_delivered.swap(true, Ordering::AcqRel) {
            return;
        }
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            if let Err(e) = sink.lock().on_stopped() {
                warn!("Sink failed to finish: {}", e);
            }
        }
    }

    fn park(&self, buffer: CaptureBuffer) {
        self.parked.lock().push(buffer);
    }

    /// Hand a delivered buffer back to the device
    fn requeue(
        &self,
        device: &dyn CaptureDevice,
        mut buffer: CaptureBuffer,
    ) -> std::result::Result<(), (CaptureError, CaptureBuffer)> {
        buffer.clear();
        if !buffer.is_prepared() {
            if let Err(e) = device.prepare(&mut buffer) {
                return Err((CaptureError::BufferPrepareFailed(e), buffer));
            }
        }
        device
            .enqueue(buffer)
            .map_err(|Rejected { error, buffer }| (CaptureError::EnqueueFailed(error), buffer))
    }
}

impl DeviceCallback for Shared {
    fn on_data(&self, device: &dyn CaptureDevice, buffer: CaptureBuffer) {
        // Mark before checking state: either stop() sees the mark or we
        // see Stopping.
        self.processing.store(true, Ordering::SeqCst);

        if self.state() != ControllerState::Running {
            trace!("Buffer {} returned while not running", buffer.id());
            self.park(buffer);
            self.processing.store(false, Ordering::SeqCst);
            return;
        }

        self.deliver(&buffer);

        if let Err((err, buffer)) = self.requeue(device, buffer) {
            self.latch_fault(err);
            self.transition(ControllerState::Running, ControllerState::Failed);
            self.park(buffer);
        }

        self.processing.store(false, Ordering::SeqCst);
    }

    fn on_close(&self) {
        debug!("Device close acknowledged");
        if self.notify_on_close.load(Ordering::Acquire) {
            self.deliver_stopped();
        }
        let _ = self.close_tx.try_send(());
    }
}

/// Records from one input device into a sink
///
/// `start` opens the device and queues the buffer pool; the device then
/// calls back on its own thread with each filled buffer, which is passed
/// to the sink and re-queued. `stop` waits out any in-flight callback,
/// drains and closes the device, and ends the sink's stream.
///
/// The first failure is latched: [`failed`](Self::failed) stays true for
/// the controller's lifetime.
pub struct CaptureController {
    backend: Arc<dyn InputBackend>,
    config: ControllerConfig,
    shared: Arc<Shared>,
    device: Option<Arc<dyn CaptureDevice>>,
    /// Buffers currently owned by the controller rather than the device
    idle: Vec<CaptureBuffer>,
    format: Option<AudioFormat>,
    error: Option<CaptureError>,
    start_position: u64,
}

impl CaptureController {
    pub fn new(backend: Arc<dyn InputBackend>, config: ControllerConfig) -> Self {
        Self {
            backend,
            config,
            shared: Arc::new(Shared::new()),
            device: None,
            idle: Vec::new(),
            format: None,
            error: None,
            start_position: 0,
        }
    }

    /// Controller on this platform's default input backend
    pub fn with_default_backend(config: ControllerConfig) -> Self {
        Self::new(crate::device::default_backend(), config)
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    /// Attach the sink that receives captured data
    ///
    /// Must happen before `start`; replacing the sink of a running
    /// controller is refused.
    pub fn set_sink(&mut self, sink: SharedSink) -> Result<()> {
        let state = self.state();
        if matches!(state, ControllerState::Running | ControllerState::Stopping) {
            return Err(CaptureError::InvalidState {
                operation: "replace the sink",
                state,
            });
        }
        *self.shared.sink.lock() = Some(sink);
        Ok(())
    }

    /// Whether any operation or callback has failed
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.shared.faulted.load(Ordering::Acquire)
    }

    /// First latched error
    pub fn error(&self) -> Option<CaptureError> {
        self.error
            .clone()
            .or_else(|| self.shared.fault.lock().clone())
    }

    /// Human-readable text of the first latched error
    pub fn error_message(&self) -> Option<String> {
        self.error().map(|e| e.to_string())
    }

    /// Format negotiated by the last successful `start`
    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Bytes handed to the sink so far
    pub fn bytes_delivered(&self) -> u64 {
        self.shared.bytes_delivered.load(Ordering::Relaxed)
    }

    /// Samples captured since `start`
    pub fn position(&self) -> Result<u64> {
        let state = self.state();
        let device = match (&self.device, state) {
            (Some(device), ControllerState::Running) => device,
            _ => {
                return Err(CaptureError::InvalidState {
                    operation: "query position",
                    state,
                })
            }
        };
        let position = device
            .position()
            .map_err(CaptureError::PositionQueryFailed)?;
        Ok(position.saturating_sub(self.start_position))
    }

    fn latch(&mut self, err: CaptureError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Open the device and begin capturing
    pub fn start(&mut self) -> Result<()> {
        if !self
            .shared
            .transition(ControllerState::Idle, ControllerState::Opening)
        {
            return Err(CaptureError::InvalidState {
                operation: "start",
                state: self.state(),
            });
        }

        info!("Opening input device {}", self.config.device_index);

        match self.open_and_arm() {
            Ok(()) => {
                info!("Recording started");
                Ok(())
            }
            Err(err) => {
                error!("Failed to start capture: {}", err);
                self.shared.set_state(ControllerState::Failed);
                self.shared.notify_on_close.store(false, Ordering::Release);
                self.latch(err.clone());
                self.release_partial();
                Err(err)
            }
        }
    }

    fn open_and_arm(&mut self) -> Result<()> {
        if self.backend.device_count() == 0 {
            return Err(CaptureError::NoInputDevice);
        }

        let caps = self
            .backend
            .capabilities(self.config.device_index)
            .map_err(CaptureError::CapabilityQueryFailed)?;
        debug!("Device capabilities: {:?}", caps);

        let format = negotiate_format(&caps);
        self.format = Some(format);
        self.shared
            .block_align
            .store(format.block_align() as usize, Ordering::Relaxed);
        info!("Capture format: {}", format);

        let callback: Arc<dyn DeviceCallback> = self.shared.clone();
        let device = self
            .backend
            .open(self.config.device_index, &format, callback)
            .map_err(CaptureError::OpenFailed)?;
        self.device = Some(device.clone());
        debug!("Opened '{}'", caps.name);

        let capacity = CaptureBuffer::aligned_capacity(format.block_align() as usize);
        let count = self.config.buffer_count.max(1);
        debug!(
            "Queueing {} buffers of {} bytes ({} ms each)",
            count,
            capacity,
            format.bytes_to_ms(capacity)
        );

        for id in 0..count {
            let mut buffer = CaptureBuffer::new(id, capacity);
            if let Err(e) = device.prepare(&mut buffer) {
                self.idle.push(buffer);
                return Err(CaptureError::BufferPrepareFailed(e));
            }
            if let Err(Rejected { error, buffer }) = device.enqueue(buffer) {
                self.idle.push(buffer);
                return Err(CaptureError::EnqueueFailed(error));
            }
        }

        self.start_position = device
            .position()
            .map_err(CaptureError::PositionQueryFailed)?;

        // Buffers can complete as soon as the device starts
        self.shared.notify_on_close.store(true, Ordering::Release);
        self.shared.set_state(ControllerState::Running);
        device.start().map_err(CaptureError::StartFailed)?;

        Ok(())
    }

    /// Undo a partial start in reverse order of acquisition
    fn release_partial(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };

        let mut first_error = None;
        self.reclaim(device.as_ref(), &mut first_error);
        self.close_device(device, &mut first_error);
    }

    /// Stop capturing and release the device
    ///
    /// Blocks until any callback in progress has returned. After this
    /// returns the sink receives no further data and has been told the
    /// stream ended.
    pub fn stop(&mut self) -> Result<()> {
        let state = self.state();
        let faulted_running = state == ControllerState::Failed && self.device.is_some();
        if !faulted_running
            && !self
                .shared
                .transition(ControllerState::Running, ControllerState::Stopping)
        {
            if state == ControllerState::Failed {
                if let Some(err) = self.error() {
                    return Err(err);
                }
            }
            return Err(CaptureError::InvalidState {
                operation: "stop",
                state,
            });
        }

        info!("Stopping recording");
        self.wait_for_callback();

        let result = self.teardown();

        match result {
            Ok(()) if !self.failed() => {
                self.shared.set_state(ControllerState::Closed);
                info!(
                    "Recording stopped ({} bytes delivered)",
                    self.bytes_delivered()
                );
                Ok(())
            }
            Ok(()) => {
                self.shared.set_state(ControllerState::Failed);
                Err(self.error().unwrap_or(CaptureError::InvalidState {
                    operation: "stop",
                    state: ControllerState::Failed,
                }))
            }
            Err(err) => {
                error!("Failed to stop cleanly: {}", err);
                self.shared.set_state(ControllerState::Failed);
                self.latch(err.clone());
                Err(err)
            }
        }
    }

    /// Drain, release and close the device, recording the first failure
    fn teardown(&mut self) -> Result<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        let mut first_error: Option<CaptureError> = None;

        let returned = match device.reset() {
            Ok(returned) => returned,
            Err(e) => {
                note(&mut first_error, CaptureError::ResetFailed(e));
                Vec::new()
            }
        };

        // Callbacks racing the reset park their buffers
        self.wait_for_callback();
        let mut residual = std::mem::take(&mut *self.shared.parked.lock());
        residual.extend(returned);

        if self.config.residual == ResidualPolicy::Flush {
            let pending: usize = residual.iter().map(|b| b.bytes_recorded()).sum();
            if pending > 0 {
                debug!("Flushing {} residual bytes", pending);
            }
            for buffer in &residual {
                self.shared.deliver(buffer);
            }
        } else {
            let dropped: usize = residual.iter().map(|b| b.bytes_recorded()).sum();
            if dropped > 0 {
                debug!("Discarding {} residual bytes", dropped);
            }
        }

        self.idle.append(&mut residual);
        self.unprepare_idle(device.as_ref(), &mut first_error);
        self.close_device(device, &mut first_error);

        // Without a close notification the sink still needs its end of stream
        if self.shared.notify_on_close.load(Ordering::Acquire) {
            self.shared.deliver_stopped();
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop the device and take back every buffer it still holds
    ///
    /// Samples in buffers recovered here are dropped.
    fn reclaim(&mut self, device: &dyn CaptureDevice, first_error: &mut Option<CaptureError>) {
        match device.reset() {
            Ok(returned) => self.idle.extend(returned),
            Err(e) => note(first_error, CaptureError::ResetFailed(e)),
        }
        self.wait_for_callback();
        self.idle.append(&mut self.shared.parked.lock());

        let dropped: usize = self.idle.iter().map(|b| b.bytes_recorded()).sum();
        if dropped > 0 {
            debug!("Dropping {} bytes recovered during cleanup", dropped);
        }
        self.unprepare_idle(device, first_error);
    }

    fn unprepare_idle(
        &mut self,
        device: &dyn CaptureDevice,
        first_error: &mut Option<CaptureError>,
    ) {
        for buffer in self.idle.iter_mut().filter(|b| b.is_prepared()) {
            if let Err(e) = device.unprepare(buffer) {
                note(first_error, CaptureError::UnprepareFailed(e));
            }
        }
        self.idle.clear();
    }

    /// Close the device, draining it once more if buffers keep it busy
    ///
    /// A device that still refuses to close is kept so a later `stop`
    /// or drop can try again.
    fn close_device(
        &mut self,
        device: Arc<dyn CaptureDevice>,
        first_error: &mut Option<CaptureError>,
    ) {
        if let Err(e) = device.close() {
            note(first_error, CaptureError::CloseFailed(e));
            self.reclaim(device.as_ref(), first_error);
            if let Err(e) = device.close() {
                error!("Device still open after retry: {}", e);
                self.device = Some(device);
                return;
            }
        }
        self.wait_for_close_ack();
    }

    /// Spin until no callback is inside the data path
    fn wait_for_callback(&self) {
        let started = Instant::now();
        let mut warned = false;
        while self.shared.processing.load(Ordering::SeqCst) {
            if !warned && started.elapsed() > Duration::from_secs(1) {
                warn!("Still waiting for capture callback to finish");
                warned = true;
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn wait_for_close_ack(&self) {
        if self
            .shared
            .close_rx
            .recv_timeout(self.config.close_timeout)
            .is_err()
        {
            warn!(
                "No close notification within {:?}",
                self.config.close_timeout
            );
        }
    }
}

/// Keep the first error of a multi-step release
fn note(first_error: &mut Option<CaptureError>, err: CaptureError) {
    warn!("{}", err);
    first_error.get_or_insert(err);
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if self.device.is_some() {
            if let Err(e) = self.stop() {
                warn!("Stop on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{DeviceCaps, FormatFlags, DATABLOCK_SIZE};
    use crate::device::{FaultPoint, SimulatedBackend};
    use crate::error::{OsError, SinkError};
    use crate::sink::{self, DataSink, MemorySink, RawFileSink};
    use crossbeam_channel::unbounded;

    fn stereo_backend() -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::with_device(DeviceCaps::new(
            "Stereo Mic",
            FormatFlags::F4S16 | FormatFlags::F2S16,
            2,
        )))
    }

    fn mono_backend() -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::with_device(DeviceCaps::new(
            "Mono Headset",
            FormatFlags::F2M16 | FormatFlags::F1M16,
            1,
        )))
    }

    fn controller(backend: &Arc<SimulatedBackend>, buffer_count: usize) -> CaptureController {
        CaptureController::new(
            backend.clone(),
            ControllerConfig {
                buffer_count,
                close_timeout: Duration::from_millis(500),
                ..ControllerConfig::default()
            },
        )
    }

    fn block(label: u8) -> Vec<u8> {
        vec![label; DATABLOCK_SIZE]
    }

    #[test]
    fn test_happy_cd_stereo_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.raw");
        let backend = stereo_backend();
        let file = sink::shared(RawFileSink::create(&path).unwrap());

        let mut controller = controller(&backend, 1);
        controller.set_sink(file.clone()).unwrap();
        controller.start().unwrap();
        assert_eq!(controller.state(), ControllerState::Running);
        assert_eq!(controller.format(), Some(AudioFormat::pcm16(44_100, 2)));

        for label in [b'A', b'B', b'C'] {
            backend.feed(block(label));
        }
        backend.settle();
        assert_eq!(controller.position().unwrap(), 3 * 8_192);

        controller.stop().unwrap();
        assert_eq!(controller.state(), ControllerState::Closed);
        assert!(!controller.failed());

        let mut expected = block(b'A');
        expected.extend(block(b'B'));
        expected.extend(block(b'C'));
        assert_eq!(std::fs::read(&path).unwrap(), expected);
        assert!(file.lock().is_closed());
        assert!(!backend.is_open());
    }

    #[test]
    fn test_events_in_order_then_one_stop() {
        let backend = stereo_backend();
        let memory = sink::shared(MemorySink::new());

        let mut controller = controller(&backend, 3);
        controller.set_sink(memory.clone()).unwrap();
        controller.start().unwrap();

        for label in [b'A', b'B', b'C'] {
            backend.feed(block(label));
        }
        backend.settle();
        controller.stop().unwrap();

        let memory = memory.lock();
        assert_eq!(memory.chunks(), &[DATABLOCK_SIZE; 3]);
        assert_eq!(&memory.data()[..DATABLOCK_SIZE], block(b'A').as_slice());
        assert_eq!(&memory.data()[2 * DATABLOCK_SIZE..], block(b'C').as_slice());
        assert_eq!(memory.stop_count(), 1);
        assert!(!memory.saw_data_after_stop());
    }

    #[test]
    fn test_fallback_mono_flushes_partial_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.raw");
        let backend = mono_backend();
        let file = sink::shared(RawFileSink::create(&path).unwrap());

        let mut controller = controller(&backend, 1);
        controller.set_sink(file.clone()).unwrap();
        controller.start().unwrap();
        assert_eq!(controller.format(), Some(AudioFormat::pcm16(22_050, 1)));

        backend.feed(vec![0x5a; 16_000]);
        backend.settle();
        controller.stop().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16_000);
        assert_eq!(controller.bytes_delivered(), 16_000);
    }

    #[test]
    fn test_discard_policy_drops_partial_buffer() {
        let backend = mono_backend();
        let memory = sink::shared(MemorySink::new());

        let mut controller = CaptureController::new(
            backend.clone(),
            ControllerConfig {
                buffer_count: 1,
                residual: ResidualPolicy::Discard,
                ..ControllerConfig::default()
            },
        );
        controller.set_sink(memory.clone()).unwrap();
        controller.start().unwrap();

        backend.feed(vec![1u8; DATABLOCK_SIZE + 100]);
        backend.settle();
        controller.stop().unwrap();

        let memory = memory.lock();
        assert_eq!(memory.data().len(), DATABLOCK_SIZE);
        assert_eq!(memory.stop_count(), 1);
    }

    #[test]
    fn test_no_device() {
        let backend = Arc::new(SimulatedBackend::new(Vec::new()));
        let memory = sink::shared(MemorySink::new());

        let mut controller = controller(&backend, 1);
        controller.set_sink(memory.clone()).unwrap();

        let err = controller.start().unwrap_err();
        assert_eq!(err, CaptureError::NoInputDevice);
        assert!(controller.failed());
        assert_eq!(controller.state(), ControllerState::Failed);
        assert!(controller.error_message().unwrap().contains("input device"));
        assert_eq!(memory.lock().stop_count(), 0);
    }

    #[test]
    fn test_open_failure_leaves_no_device_open() {
        let backend = stereo_backend();
        backend.inject_fault(FaultPoint::Open);

        let mut first = controller(&backend, 1);
        assert!(matches!(first.start(), Err(CaptureError::OpenFailed(_))));
        assert!(first.failed());
        assert!(first
            .error_message()
            .unwrap()
            .starts_with("device open failed: "));
        assert!(!backend.is_open());

        let mut second = controller(&backend, 1);
        second.start().unwrap();
        second.stop().unwrap();
    }

    #[test]
    fn test_failure_after_open_is_cleaned_up() {
        for fault in [FaultPoint::Prepare, FaultPoint::Enqueue, FaultPoint::Start] {
            let backend = stereo_backend();
            let memory = sink::shared(MemorySink::new());
            backend.inject_fault(fault);

            let mut first = controller(&backend, 3);
            first.set_sink(memory.clone()).unwrap();
            assert!(first.start().is_err(), "{:?} should fail start", fault);
            assert_eq!(first.state(), ControllerState::Failed);
            assert!(!backend.is_open(), "{:?} leaked the device", fault);
            assert_eq!(memory.lock().stop_count(), 0);

            let mut second = controller(&backend, 3);
            second.start().unwrap();
            second.stop().unwrap();
        }
    }

    /// Sink that blocks inside on_new_data until released
    struct GateSink {
        entered: Sender<()>,
        release: Receiver<()>,
        inner: MemorySink,
    }

    impl DataSink for GateSink {
        fn on_new_data(&mut self, data: &[u8]) -> std::result::Result<(), SinkError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            self.inner.on_new_data(data)
        }

        fn on_stopped(&mut self) -> std::result::Result<(), SinkError> {
            self.inner.on_stopped()
        }
    }

    #[test]
    fn test_stop_waits_for_in_flight_callback() {
        let backend = stereo_backend();
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let gate = sink::shared(GateSink {
            entered: entered_tx,
            release: release_rx,
            inner: MemorySink::new(),
        });

        let mut controller = controller(&backend, 1);
        controller.set_sink(gate.clone()).unwrap();
        controller.start().unwrap();

        backend.feed(block(1));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stopper = thread::spawn(move || {
            let result = controller.stop();
            (controller, result)
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!stopper.is_finished(), "stop returned during a callback");

        release_tx.send(()).unwrap();
        let (controller, result) = stopper.join().unwrap();
        result.unwrap();
        assert_eq!(controller.state(), ControllerState::Closed);

        // Samples arriving after stop go nowhere
        backend.feed(block(2));
        backend.settle();

        let gate = gate.lock();
        assert_eq!(gate.inner.chunks(), &[DATABLOCK_SIZE]);
        assert_eq!(gate.inner.stop_count(), 1);
        assert!(!gate.inner.saw_data_after_stop());
    }

    #[test]
    fn test_every_delivery_is_frame_aligned() {
        let backend = Arc::new(SimulatedBackend::with_device(DeviceCaps::new(
            "Surround",
            FormatFlags::F2M16,
            6,
        )));
        let memory = sink::shared(MemorySink::new());

        let mut controller = controller(&backend, 2);
        controller.set_sink(memory.clone()).unwrap();
        controller.start().unwrap();
        let align = controller.format().unwrap().block_align() as usize;
        assert_eq!(align, 12);

        // Uneven feed sizes, ending mid-frame
        for size in [10_000usize, 40_001, 7, 33_333] {
            backend.feed(vec![3u8; size]);
        }
        backend.settle();
        controller.stop().unwrap();

        let memory = memory.lock();
        assert!(memory.chunks().iter().all(|n| n % align == 0));
        let total = 10_000 + 40_001 + 7 + 33_333;
        assert_eq!(memory.data().len(), total - total % align);
    }

    #[test]
    fn test_requeue_failure_latches_and_still_releases() {
        let backend = stereo_backend();
        let memory = sink::shared(MemorySink::new());

        let mut controller = controller(&backend, 1);
        controller.set_sink(memory.clone()).unwrap();
        controller.start().unwrap();

        backend.inject_fault(FaultPoint::Enqueue);
        backend.feed(block(1));
        backend.feed(block(2));
        backend.settle();

        assert!(controller.failed());
        assert_eq!(controller.state(), ControllerState::Failed);
        assert!(matches!(
            controller.error(),
            Some(CaptureError::EnqueueFailed(_))
        ));

        assert!(controller.stop().is_err());
        assert!(!backend.is_open());
        assert!(controller.failed());

        let memory = memory.lock();
        assert_eq!(memory.chunks(), &[DATABLOCK_SIZE]);
        assert_eq!(memory.stop_count(), 1);
    }

    #[test]
    fn test_teardown_failure_is_latched() {
        let backend = stereo_backend();
        let memory = sink::shared(MemorySink::new());

        let mut controller = controller(&backend, 1);
        controller.set_sink(memory.clone()).unwrap();
        controller.start().unwrap();

        backend.inject_fault(FaultPoint::Unprepare);
        let err = controller.stop().unwrap_err();
        assert!(matches!(err, CaptureError::UnprepareFailed(_)));
        assert_eq!(controller.state(), ControllerState::Failed);
        assert!(!backend.is_open());
        assert_eq!(memory.lock().stop_count(), 1);
        assert_eq!(controller.error(), Some(err));
    }

    #[test]
    fn test_failed_reset_still_releases_device() {
        let backend = stereo_backend();
        let memory = sink::shared(MemorySink::new());

        let mut first = controller(&backend, 3);
        first.set_sink(memory.clone()).unwrap();
        first.start().unwrap();
        backend.feed(block(b'A'));
        backend.settle();

        backend.inject_fault(FaultPoint::Reset);
        let err = first.stop().unwrap_err();
        assert!(matches!(err, CaptureError::ResetFailed(_)));
        assert_eq!(first.state(), ControllerState::Failed);
        assert!(!backend.is_open());
        assert_eq!(memory.lock().stop_count(), 1);

        let mut second = controller(&backend, 3);
        second.start().unwrap();
        second.stop().unwrap();
    }

    #[test]
    fn test_failed_close_is_retried() {
        let backend = stereo_backend();
        let memory = sink::shared(MemorySink::new());

        let mut first = controller(&backend, 2);
        first.set_sink(memory.clone()).unwrap();
        first.start().unwrap();

        backend.inject_fault(FaultPoint::Close);
        let err = first.stop().unwrap_err();
        assert!(matches!(err, CaptureError::CloseFailed(_)));
        assert_eq!(first.state(), ControllerState::Failed);
        assert!(!backend.is_open());
        assert_eq!(memory.lock().stop_count(), 1);

        let mut second = controller(&backend, 2);
        second.start().unwrap();
        second.stop().unwrap();
    }

    #[test]
    fn test_requeue_keeps_buffer_registered() {
        let backend = stereo_backend();
        let memory = sink::shared(MemorySink::new());

        // One buffer cycles through every block; a second registration
        // of it would be refused by the device
        let mut controller = controller(&backend, 1);
        controller.set_sink(memory.clone()).unwrap();
        controller.start().unwrap();
        for label in 0..5u8 {
            backend.feed(block(label));
        }
        backend.settle();
        controller.stop().unwrap();

        assert!(!controller.failed());
        assert_eq!(memory.lock().chunks(), &[DATABLOCK_SIZE; 5]);
        assert_eq!(backend.dropped_bytes(), 0);
    }

    /// Device that completes a buffer from its own thread while start()
    /// is still running
    struct EagerStartBackend {
        inner: Arc<SimulatedBackend>,
        first: Vec<u8>,
    }

    struct EagerStartDevice {
        device: Arc<dyn CaptureDevice>,
        backend: Arc<SimulatedBackend>,
        first: Vec<u8>,
    }

    impl InputBackend for EagerStartBackend {
        fn device_count(&self) -> u32 {
            self.inner.device_count()
        }

        fn capabilities(&self, index: u32) -> std::result::Result<DeviceCaps, OsError> {
            self.inner.capabilities(index)
        }

        fn open(
            &self,
            index: u32,
            format: &AudioFormat,
            callback: Arc<dyn DeviceCallback>,
        ) -> std::result::Result<Arc<dyn CaptureDevice>, OsError> {
            let device = self.inner.open(index, format, callback)?;
            Ok(Arc::new(EagerStartDevice {
                device,
                backend: self.inner.clone(),
                first: self.first.clone(),
            }))
        }

        fn error_text(&self, code: u32) -> String {
            self.inner.error_text(code)
        }
    }

    impl CaptureDevice for EagerStartDevice {
        fn prepare(&self, buffer: &mut CaptureBuffer) -> std::result::Result<(), OsError> {
            self.device.prepare(buffer)
        }

        fn enqueue(&self, buffer: CaptureBuffer) -> std::result::Result<(), Rejected> {
            self.device.enqueue(buffer)
        }

        fn start(&self) -> std::result::Result<(), OsError> {
            self.device.start()?;
            self.backend.feed(self.first.clone());
            self.backend.settle();
            Ok(())
        }

        fn position(&self) -> std::result::Result<u64, OsError> {
            self.device.position()
        }

        fn reset(&self) -> std::result::Result<Vec<CaptureBuffer>, OsError> {
            self.device.reset()
        }

        fn unprepare(&self, buffer: &mut CaptureBuffer) -> std::result::Result<(), OsError> {
            self.device.unprepare(buffer)
        }

        fn close(&self) -> std::result::Result<(), OsError> {
            self.device.close()
        }
    }

    #[test]
    fn test_buffer_completed_during_start_is_delivered_in_order() {
        let inner = stereo_backend();
        let backend = Arc::new(EagerStartBackend {
            inner: inner.clone(),
            first: block(b'A'),
        });
        let memory = sink::shared(MemorySink::new());

        let mut controller = CaptureController::new(
            backend,
            ControllerConfig {
                buffer_count: 1,
                close_timeout: Duration::from_millis(500),
                ..ControllerConfig::default()
            },
        );
        controller.set_sink(memory.clone()).unwrap();
        controller.start().unwrap();

        for label in [b'B', b'C', b'D', b'E'] {
            inner.feed(block(label));
        }
        inner.settle();
        controller.stop().unwrap();

        let order: Vec<u8> = memory
            .lock()
            .data()
            .chunks(DATABLOCK_SIZE)
            .map(|chunk| chunk[0])
            .collect();
        assert_eq!(order, b"ABCDE");
        assert_eq!(inner.dropped_bytes(), 0);
    }

    #[test]
    fn test_lifecycle_misuse_is_not_latched() {
        let backend = stereo_backend();
        let mut controller = controller(&backend, 1);

        assert!(controller.stop().unwrap_err().is_misuse());
        assert!(!controller.failed());

        controller.start().unwrap();
        assert!(controller.start().unwrap_err().is_misuse());
        let replacement = sink::shared(MemorySink::new());
        assert!(controller.set_sink(replacement).unwrap_err().is_misuse());

        controller.stop().unwrap();
        assert!(controller.start().unwrap_err().is_misuse());
        assert!(!controller.failed());
        assert_eq!(controller.state(), ControllerState::Closed);
    }

    #[test]
    fn test_drop_stops_running_controller() {
        let backend = stereo_backend();
        let memory = sink::shared(MemorySink::new());
        {
            let mut controller = controller(&backend, 2);
            controller.set_sink(memory.clone()).unwrap();
            controller.start().unwrap();
            backend.feed(block(9));
            backend.settle();
        }
        assert!(!backend.is_open());
        assert_eq!(memory.lock().stop_count(), 1);
    }

    #[test]
    fn test_drop_after_failed_release_still_closes() {
        let backend = stereo_backend();
        let memory = sink::shared(MemorySink::new());
        {
            let mut controller = controller(&backend, 2);
            controller.set_sink(memory.clone()).unwrap();
            controller.start().unwrap();
            backend.inject_fault(FaultPoint::Unprepare);
        }
        assert!(!backend.is_open());
        assert_eq!(memory.lock().stop_count(), 1);
    }
}
