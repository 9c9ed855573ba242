//! In-process input device
//!
//! Behaves like a waveIn device: buffers are filled in queue order on a
//! dedicated callback thread, reset returns whatever is still queued and
//! close is acknowledged asynchronously. Samples come from [`SimulatedBackend::feed`].
//! Each OS operation can be made to fail once with [`SimulatedBackend::inject_fault`].

use crate::audio::{AudioFormat, CaptureBuffer, DeviceCaps};
use crate::device::{mmsys, CaptureDevice, DeviceCallback, InputBackend, Rejected};
use crate::error::OsError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// OS operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Capabilities,
    Open,
    Prepare,
    Enqueue,
    Start,
    Position,
    Reset,
    Unprepare,
    Close,
}

impl FaultPoint {
    /// Result code the real API returns for a typical failure of this call
    fn code(self) -> u32 {
        match self {
            FaultPoint::Capabilities => mmsys::BADDEVICEID,
            FaultPoint::Open => mmsys::WAVERR_BADFORMAT,
            FaultPoint::Prepare => mmsys::NOMEM,
            FaultPoint::Enqueue => mmsys::WAVERR_UNPREPARED,
            FaultPoint::Start => mmsys::ERROR,
            FaultPoint::Position | FaultPoint::Reset => mmsys::INVALHANDLE,
            FaultPoint::Unprepare | FaultPoint::Close => mmsys::WAVERR_STILLPLAYING,
        }
    }
}

/// Work for the callback thread
enum Command {
    Feed(Vec<u8>),
    Closed(Arc<dyn DeviceCallback>),
    Settle(Sender<()>),
    Shutdown,
}

struct SimShared {
    devices: Vec<DeviceCaps>,
    faults: Mutex<Vec<FaultPoint>>,
    open: Mutex<Option<Arc<SimDevice>>>,
    dropped_bytes: AtomicU64,
}

impl SimShared {
    /// Fail if a fault is armed for `point`, disarming it
    fn trip(&self, point: FaultPoint) -> Result<(), OsError> {
        let mut faults = self.faults.lock();
        match faults.iter().position(|f| *f == point) {
            Some(i) => {
                faults.remove(i);
                let code = point.code();
                debug!("Injected fault at {:?}", point);
                Err(OsError::new(code, mmsys::error_text(code)))
            }
            None => Ok(()),
        }
    }

    fn drop_bytes(&self, count: usize) {
        if count > 0 {
            self.dropped_bytes.fetch_add(count as u64, Ordering::Relaxed);
            trace!("Dropped {} bytes with no buffer queued", count);
        }
    }

    /// Distribute fed samples over the queued buffers
    fn capture(&self, mut input: &[u8]) {
        let device = match self.open.lock().clone() {
            Some(device) if device.started.load(Ordering::Acquire) => device,
            _ => {
                self.drop_bytes(input.len());
                return;
            }
        };

        while !input.is_empty() {
            let filled = {
                let mut queue = device.queue.lock();
                match queue.front_mut() {
                    Some(head) => {
                        let n = head.fill_from(input);
                        input = &input[n..];
                        device.captured.fetch_add(n as u64, Ordering::Relaxed);
                        if head.is_full() {
                            Some(queue.pop_front())
                        } else {
                            Some(None)
                        }
                    }
                    None => None,
                }
            };

            match filled {
                Some(Some(buffer)) => device.callback.on_data(&*device, buffer),
                Some(None) => {}
                None => {
                    warn!("Capture overrun: no buffer queued");
                    self.drop_bytes(input.len());
                    return;
                }
            }
        }
    }
}

fn run_worker(shared: Arc<SimShared>, rx: Receiver<Command>) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Feed(bytes) => shared.capture(&bytes),
            Command::Closed(callback) => callback.on_close(),
            Command::Settle(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }
    debug!("Simulated device thread exiting");
}

/// Simulated input backend
pub struct SimulatedBackend {
    shared: Arc<SimShared>,
    tx: Sender<Command>,
}

impl SimulatedBackend {
    /// Create a backend exposing `devices`, index 0 first
    pub fn new(devices: Vec<DeviceCaps>) -> Self {
        let shared = Arc::new(SimShared {
            devices,
            faults: Mutex::new(Vec::new()),
            open: Mutex::new(None),
            dropped_bytes: AtomicU64::new(0),
        });
        let (tx, rx) = unbounded();

        let worker_shared = shared.clone();
        thread::spawn(move || run_worker(worker_shared, rx));

        Self { shared, tx }
    }

    /// Backend with a single device
    pub fn with_device(caps: DeviceCaps) -> Self {
        Self::new(vec![caps])
    }

    /// Make the next call of `point` fail
    pub fn inject_fault(&self, point: FaultPoint) {
        self.shared.faults.lock().push(point);
    }

    /// Disarm every pending fault
    pub fn clear_faults(&self) {
        self.shared.faults.lock().clear();
    }

    /// Hand samples to the open device as if captured from the microphone
    pub fn feed(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.tx.send(Command::Feed(bytes.into()));
    }

    /// Block until the callback thread has processed everything sent so far
    pub fn settle(&self) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Command::Settle(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Whether a device is currently open
    pub fn is_open(&self) -> bool {
        self.shared.open.lock().is_some()
    }

    /// Bytes fed while no buffer was available
    pub fn dropped_bytes(&self) -> u64 {
        self.shared.dropped_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.shared.open.lock().take();
        let _ = self.tx.send(Command::Shutdown);
    }
}

impl InputBackend for SimulatedBackend {
    fn device_count(&self) -> u32 {
        self.shared.devices.len() as u32
    }

    fn capabilities(&self, index: u32) -> Result<DeviceCaps, OsError> {
        self.shared.trip(FaultPoint::Capabilities)?;
        self.shared
            .devices
            .get(index as usize)
            .cloned()
            .ok_or_else(|| OsError::new(mmsys::BADDEVICEID, mmsys::error_text(mmsys::BADDEVICEID)))
    }

    fn open(
        &self,
        index: u32,
        format: &AudioFormat,
        callback: Arc<dyn DeviceCallback>,
    ) -> Result<Arc<dyn CaptureDevice>, OsError> {
        self.shared.trip(FaultPoint::Open)?;

        if index as usize >= self.shared.devices.len() {
            return Err(OsError::new(mmsys::BADDEVICEID, self.error_text(mmsys::BADDEVICEID)));
        }
        if format.block_align() == 0 {
            return Err(OsError::new(
                mmsys::WAVERR_BADFORMAT,
                self.error_text(mmsys::WAVERR_BADFORMAT),
            ));
        }

        let mut open = self.shared.open.lock();
        if open.is_some() {
            return Err(OsError::new(mmsys::ALLOCATED, self.error_text(mmsys::ALLOCATED)));
        }

        let device = Arc::new(SimDevice {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
            callback,
            queue: Mutex::new(VecDeque::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            captured: AtomicU64::new(0),
            block_align: format.block_align() as u64,
        });
        *open = Some(device.clone());

        debug!("Simulated device {} opened as {}", index, format);
        Ok(device)
    }

    fn error_text(&self, code: u32) -> String {
        mmsys::error_text(code)
    }
}

struct SimDevice {
    shared: Arc<SimShared>,
    tx: Sender<Command>,
    callback: Arc<dyn DeviceCallback>,
    queue: Mutex<VecDeque<CaptureBuffer>>,
    started: AtomicBool,
    closed: AtomicBool,
    captured: AtomicU64,
    block_align: u64,
}

impl SimDevice {
    fn ensure_open(&self) -> Result<(), OsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OsError::new(mmsys::INVALHANDLE, mmsys::error_text(mmsys::INVALHANDLE)));
        }
        Ok(())
    }
}

impl CaptureDevice for SimDevice {
    fn prepare(&self, buffer: &mut CaptureBuffer) -> Result<(), OsError> {
        self.ensure_open()?;
        self.shared.trip(FaultPoint::Prepare)?;
        if buffer.is_prepared() {
            return Err(OsError::new(mmsys::INVALPARAM, mmsys::error_text(mmsys::INVALPARAM)));
        }
        buffer.set_prepared(true);
        Ok(())
    }

    fn enqueue(&self, mut buffer: CaptureBuffer) -> Result<(), Rejected> {
        let checked = self
            .ensure_open()
            .and_then(|_| self.shared.trip(FaultPoint::Enqueue))
            .and_then(|_| {
                if buffer.is_prepared() {
                    Ok(())
                } else {
                    Err(OsError::new(
                        mmsys::WAVERR_UNPREPARED,
                        mmsys::error_text(mmsys::WAVERR_UNPREPARED),
                    ))
                }
            });

        match checked {
            Ok(()) => {
                buffer.clear();
                self.queue.lock().push_back(buffer);
                Ok(())
            }
            Err(error) => Err(Rejected { error, buffer }),
        }
    }

    fn start(&self) -> Result<(), OsError> {
        self.ensure_open()?;
        self.shared.trip(FaultPoint::Start)?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn position(&self) -> Result<u64, OsError> {
        self.ensure_open()?;
        self.shared.trip(FaultPoint::Position)?;
        Ok(self.captured.load(Ordering::Relaxed) / self.block_align)
    }

    fn reset(&self) -> Result<Vec<CaptureBuffer>, OsError> {
        self.ensure_open()?;
        self.shared.trip(FaultPoint::Reset)?;
        self.started.store(false, Ordering::Release);
        let returned: Vec<_> = self.queue.lock().drain(..).collect();
        debug!("Simulated reset returned {} buffers", returned.len());
        Ok(returned)
    }

    fn unprepare(&self, buffer: &mut CaptureBuffer) -> Result<(), OsError> {
        self.ensure_open()?;
        self.shared.trip(FaultPoint::Unprepare)?;
        buffer.set_prepared(false);
        Ok(())
    }

    fn close(&self) -> Result<(), OsError> {
        self.ensure_open()?;
        self.shared.trip(FaultPoint::Close)?;
        if !self.queue.lock().is_empty() {
            return Err(OsError::new(
                mmsys::WAVERR_STILLPLAYING,
                mmsys::error_text(mmsys::WAVERR_STILLPLAYING),
            ));
        }

        self.closed.store(true, Ordering::Release);
        self.started.store(false, Ordering::Release);
        self.shared.open.lock().take();
        let _ = self.tx.send(Command::Closed(self.callback.clone()));
        debug!("Simulated device closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FormatFlags;

    struct NullCallback;

    impl DeviceCallback for NullCallback {
        fn on_data(&self, _device: &dyn CaptureDevice, _buffer: CaptureBuffer) {}
        fn on_close(&self) {}
    }

    fn backend() -> SimulatedBackend {
        SimulatedBackend::with_device(DeviceCaps::new("Sim", FormatFlags::F4S16, 2))
    }

    #[test]
    fn test_open_is_exclusive() {
        let backend = backend();
        let format = AudioFormat::pcm16(44_100, 2);

        let first = backend.open(0, &format, Arc::new(NullCallback)).unwrap();
        let second = backend.open(0, &format, Arc::new(NullCallback));
        assert_eq!(second.err().map(|e| e.code), Some(mmsys::ALLOCATED));

        first.close().unwrap();
        assert!(!backend.is_open());
        assert!(backend.open(0, &format, Arc::new(NullCallback)).is_ok());
    }

    #[test]
    fn test_bad_index() {
        let backend = backend();
        assert_eq!(backend.capabilities(3).unwrap_err().code, mmsys::BADDEVICEID);
    }

    #[test]
    fn test_fault_fires_once() {
        let backend = backend();
        backend.inject_fault(FaultPoint::Capabilities);
        assert!(backend.capabilities(0).is_err());
        assert!(backend.capabilities(0).is_ok());
    }

    #[test]
    fn test_feed_without_device_is_dropped() {
        let backend = backend();
        backend.feed(vec![0u8; 64]);
        backend.settle();
        assert_eq!(backend.dropped_bytes(), 64);
    }

    #[test]
    fn test_unprepared_buffer_rejected() {
        let backend = backend();
        let device = backend
            .open(0, &AudioFormat::pcm16(44_100, 2), Arc::new(NullCallback))
            .unwrap();

        let rejected = device.enqueue(CaptureBuffer::new(7, 16)).unwrap_err();
        assert_eq!(rejected.error.code, mmsys::WAVERR_UNPREPARED);
        assert_eq!(rejected.buffer.id(), 7);
    }

    #[test]
    fn test_prepare_twice_rejected() {
        let backend = backend();
        let device = backend
            .open(0, &AudioFormat::pcm16(44_100, 2), Arc::new(NullCallback))
            .unwrap();

        let mut buffer = CaptureBuffer::new(0, 32);
        device.prepare(&mut buffer).unwrap();
        assert_eq!(device.prepare(&mut buffer).unwrap_err().code, mmsys::INVALPARAM);

        device.unprepare(&mut buffer).unwrap();
        device.prepare(&mut buffer).unwrap();
    }

    #[test]
    fn test_reset_returns_partial_buffer() {
        let backend = backend();
        let device = backend
            .open(0, &AudioFormat::pcm16(44_100, 2), Arc::new(NullCallback))
            .unwrap();

        let mut buffer = CaptureBuffer::new(0, 32);
        device.prepare(&mut buffer).unwrap();
        device.enqueue(buffer).unwrap();
        device.start().unwrap();

        backend.feed(vec![9u8; 12]);
        backend.settle();
        assert_eq!(device.position().unwrap(), 3);

        let returned = device.reset().unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].recorded(), &[9u8; 12]);

        // Close refuses while buffers would still be queued; here none are
        device.close().unwrap();
    }
}
