//! waveIn input backend (winmm)

use crate::audio::{AudioFormat, CaptureBuffer, DeviceCaps, FORMAT_TAG_PCM};
use crate::device::{mmsys, CaptureDevice, DeviceCallback, InputBackend, Rejected};
use crate::error::OsError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem::size_of;
use std::sync::Arc;
use tracing::{debug, info, trace};
use windows::{
    core::PSTR,
    Win32::Media::{
        Audio::{
            waveInAddBuffer, waveInClose, waveInGetDevCapsW, waveInGetErrorTextW,
            waveInGetNumDevs, waveInGetPosition, waveInOpen, waveInPrepareHeader, waveInReset,
            waveInStart, waveInUnprepareHeader, CALLBACK_FUNCTION, HWAVEIN, WAVEFORMATEX,
            WAVEHDR, WAVEINCAPSW,
        },
        MMTIME, TIME_SAMPLES,
    },
};

// waveIn callback messages
const WIM_OPEN: u32 = 0x3BE;
const WIM_CLOSE: u32 = 0x3BF;
const WIM_DATA: u32 = 0x3C0;

const ERROR_TEXT_LEN: usize = 256;

/// Backend over the winmm waveIn API
pub struct WaveInBackend;

impl WaveInBackend {
    pub fn new() -> Self {
        Self
    }

    fn check(&self, result: u32) -> Result<(), OsError> {
        if result == mmsys::NOERROR {
            Ok(())
        } else {
            Err(OsError::new(result, self.error_text(result)))
        }
    }
}

impl Default for WaveInBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBackend for WaveInBackend {
    fn device_count(&self) -> u32 {
        unsafe { waveInGetNumDevs() }
    }

    fn capabilities(&self, index: u32) -> Result<DeviceCaps, OsError> {
        let mut caps = WAVEINCAPSW::default();
        let result =
            unsafe { waveInGetDevCapsW(index as usize, &mut caps, size_of::<WAVEINCAPSW>() as u32) };
        self.check(result)?;

        // WAVEINCAPSW is packed; copy the name out before borrowing it
        let pname = caps.szPname;
        let name = from_wide(&pname);

        Ok(DeviceCaps::new(name, caps.dwFormats, caps.wChannels))
    }

    fn open(
        &self,
        index: u32,
        format: &AudioFormat,
        callback: Arc<dyn DeviceCallback>,
    ) -> Result<Arc<dyn CaptureDevice>, OsError> {
        let wave_format = WAVEFORMATEX {
            wFormatTag: FORMAT_TAG_PCM,
            nChannels: format.channels,
            nSamplesPerSec: format.sample_rate,
            nAvgBytesPerSec: format.bytes_per_second(),
            nBlockAlign: format.block_align(),
            wBitsPerSample: format.bits_per_sample,
            cbSize: 0,
        };

        let device = Arc::new(WaveInDevice {
            handle: Mutex::new(HWAVEIN::default()),
            slots: Mutex::new(HashMap::new()),
            callback,
        });

        // The instance slot carries the device; it stays alive in the
        // controller until the close notification arrives.
        let instance = Arc::as_ptr(&device) as usize;
        let mut handle = HWAVEIN::default();
        let result = unsafe {
            waveInOpen(
                Some(&mut handle as *mut HWAVEIN),
                index,
                &wave_format,
                wave_in_proc as usize,
                instance,
                CALLBACK_FUNCTION,
            )
        };
        self.check(result)?;

        *device.handle.lock() = handle;
        info!("Opened waveIn device {} as {}", index, format);
        Ok(device)
    }

    fn error_text(&self, code: u32) -> String {
        let mut text = [0u16; ERROR_TEXT_LEN];
        let result = unsafe { waveInGetErrorTextW(code, &mut text) };
        if result != mmsys::NOERROR {
            return mmsys::error_text(code);
        }
        from_wide(&text)
    }
}

/// Decode a NUL-terminated UTF-16 buffer
fn from_wide(raw: &[u16]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..len])
}

/// Header registered with the driver plus the buffer it points into
struct Slot {
    header: Box<WAVEHDR>,
    /// Present while the buffer is queued on the device
    queued: Option<CaptureBuffer>,
}

struct WaveInDevice {
    handle: Mutex<HWAVEIN>,
    slots: Mutex<HashMap<usize, Slot>>,
    callback: Arc<dyn DeviceCallback>,
}

// SAFETY: HWAVEIN is a process-wide handle usable from any thread, and the
// raw header pointers are only touched under the slots lock or by the
// driver while the buffer is queued.
unsafe impl Send for WaveInDevice {}
unsafe impl Sync for WaveInDevice {}

impl WaveInDevice {
    fn hwi(&self) -> HWAVEIN {
        *self.handle.lock()
    }

    fn check(result: u32) -> Result<(), OsError> {
        if result == mmsys::NOERROR {
            Ok(())
        } else {
            Err(OsError::new(result, wave_in_error_text(result)))
        }
    }

    /// Take back a buffer the driver has finished with
    fn take_done(&self, id: usize) -> Option<CaptureBuffer> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&id)?;
        let mut buffer = slot.queued.take()?;
        buffer.set_bytes_recorded(slot.header.dwBytesRecorded as usize);
        Some(buffer)
    }
}

fn wave_in_error_text(code: u32) -> String {
    WaveInBackend.error_text(code)
}

impl CaptureDevice for WaveInDevice {
    fn prepare(&self, buffer: &mut CaptureBuffer) -> Result<(), OsError> {
        let hwi = self.hwi();
        let mut slots = self.slots.lock();
        if buffer.is_prepared() && slots.contains_key(&buffer.id()) {
            return Ok(());
        }
        let slot = slots.entry(buffer.id()).or_insert_with(|| Slot {
            header: Box::default(),
            queued: None,
        });

        let storage = buffer.storage_mut();
        slot.header.lpData = PSTR(storage.as_mut_ptr());
        slot.header.dwBufferLength = storage.len() as u32;
        slot.header.dwBytesRecorded = 0;
        slot.header.dwUser = buffer.id();
        slot.header.dwFlags = 0;

        let result =
            unsafe { waveInPrepareHeader(hwi, &mut *slot.header, size_of::<WAVEHDR>() as u32) };
        Self::check(result)?;
        buffer.set_prepared(true);
        Ok(())
    }

    fn enqueue(&self, buffer: CaptureBuffer) -> Result<(), Rejected> {
        let hwi = self.hwi();
        let id = buffer.id();
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&id) else {
            return Err(Rejected {
                error: OsError::new(
                    mmsys::WAVERR_UNPREPARED,
                    wave_in_error_text(mmsys::WAVERR_UNPREPARED),
                ),
                buffer,
            });
        };

        // Park the buffer before handing the header over; the driver may
        // complete it on the callback thread as soon as it is queued.
        slot.queued = Some(buffer);
        let header: *mut WAVEHDR = &mut *slot.header;
        drop(slots);

        let result = unsafe { waveInAddBuffer(hwi, header, size_of::<WAVEHDR>() as u32) };
        if result == mmsys::NOERROR {
            trace!("Queued buffer {}", id);
            return Ok(());
        }

        let buffer = self
            .slots
            .lock()
            .get_mut(&id)
            .and_then(|slot| slot.queued.take());
        match buffer {
            Some(buffer) => Err(Rejected {
                error: OsError::new(result, wave_in_error_text(result)),
                buffer,
            }),
            // A completion raced the failure report; the callback owns it now
            None => Ok(()),
        }
    }

    fn start(&self) -> Result<(), OsError> {
        Self::check(unsafe { waveInStart(self.hwi()) })
    }

    fn position(&self) -> Result<u64, OsError> {
        let mut time = MMTIME {
            wType: TIME_SAMPLES,
            ..Default::default()
        };
        let result =
            unsafe { waveInGetPosition(self.hwi(), &mut time, size_of::<MMTIME>() as u32) };
        Self::check(result)?;
        Ok(unsafe { time.u.sample } as u64)
    }

    fn reset(&self) -> Result<Vec<CaptureBuffer>, OsError> {
        // Must not hold the slots lock: the driver completes queued
        // headers through the callback while resetting.
        Self::check(unsafe { waveInReset(self.hwi()) })?;

        let mut ids: Vec<usize> = self.slots.lock().keys().copied().collect();
        ids.sort_unstable();
        let returned: Vec<_> = ids.into_iter().filter_map(|id| self.take_done(id)).collect();
        debug!("waveInReset returned {} buffers", returned.len());
        Ok(returned)
    }

    fn unprepare(&self, buffer: &mut CaptureBuffer) -> Result<(), OsError> {
        let hwi = self.hwi();
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&buffer.id()) else {
            buffer.set_prepared(false);
            return Ok(());
        };

        let result =
            unsafe { waveInUnprepareHeader(hwi, &mut *slot.header, size_of::<WAVEHDR>() as u32) };
        Self::check(result)?;
        buffer.set_prepared(false);
        Ok(())
    }

    fn close(&self) -> Result<(), OsError> {
        Self::check(unsafe { waveInClose(self.hwi()) })?;
        self.slots.lock().clear();
        debug!("waveIn device closed");
        Ok(())
    }
}

/// Driver callback; `instance` is the `WaveInDevice` registered at open
unsafe extern "system" fn wave_in_proc(
    _hwi: HWAVEIN,
    msg: u32,
    instance: usize,
    param1: usize,
    _param2: usize,
) {
    if instance == 0 {
        return;
    }
    let device = &*(instance as *const WaveInDevice);

    match msg {
        WIM_DATA => {
            let header = &*(param1 as *const WAVEHDR);
            if let Some(buffer) = device.take_done(header.dwUser) {
                device.callback.on_data(device, buffer);
            }
        }
        WIM_CLOSE => device.callback.on_close(),
        WIM_OPEN => {}
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wide_stops_at_nul() {
        let mut raw = [0u16; 32];
        for (slot, c) in raw.iter_mut().zip("Microphone".encode_utf16()) {
            *slot = c;
        }
        raw[20] = b'x' as u16;
        assert_eq!(from_wide(&raw), "Microphone");
    }

    #[test]
    fn test_from_wide_without_nul() {
        let raw: Vec<u16> = "Line In".encode_utf16().collect();
        assert_eq!(from_wide(&raw), "Line In");
    }

    #[test]
    fn test_capabilities_bad_index() {
        let backend = WaveInBackend::new();
        assert!(backend.capabilities(backend.device_count() + 16).is_err());
    }
}
