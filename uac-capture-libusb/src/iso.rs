//! Isochronous IN transport on libusb's asynchronous transfer API.
//!
//! Each pool slot owns one `libusb_transfer` whose buffer points into the
//! slot's [`TransferDescriptor`]. The completion callback only raises the
//! slot's flag; packet results are copied out on the acquisition thread
//! after `libusb_handle_events_timeout_completed` returns, so the descriptor
//! is never touched from inside libusb.

use std::os::raw::{c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rusb::ffi;
use rusb::ffi::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_TIMEOUT, LIBUSB_TRANSFER_CANCELLED,
    LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE, LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
};
use rusb::{Context, UsbContext};

use uac_capture_core::models::error::TransportError;
use uac_capture_core::traits::usb_transport::{IsochronousTransport, PacketStatus, TransferDescriptor};

use crate::device::{BackendOptions, SharedHandle};
use crate::error::transport_error_from_code;
use crate::priority;

/// How long `release` keeps handling events for transfers still owned by libusb.
const RELEASE_GRACE: Duration = Duration::from_millis(250);

struct NativeTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    /// Raised by the completion callback. Boxed so `user_data` stays valid
    /// while the transfer list grows.
    done: Box<AtomicBool>,
    in_flight: bool,
}

impl NativeTransfer {
    fn completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Isochronous transport for one streaming endpoint.
pub struct LibusbIsoTransport {
    context: Context,
    /// Keeps `raw_handle` open.
    _handle: SharedHandle,
    raw_handle: *mut ffi::libusb_device_handle,
    endpoint: u8,
    ceiling: usize,
    realtime_priority: bool,
    transfers: Vec<NativeTransfer>,
}

// SAFETY: the raw transfer and handle pointers are only dereferenced by the
// thread that owns this value. `_handle` keeps the device handle open for as
// long as `raw_handle` is used, and libusb itself is thread-safe.
unsafe impl Send for LibusbIsoTransport {}

impl LibusbIsoTransport {
    pub(crate) fn new(context: Context, handle: SharedHandle, endpoint: u8, options: &BackendOptions) -> Self {
        let raw_handle = handle.lock().as_raw();
        Self {
            context,
            _handle: handle,
            raw_handle,
            endpoint,
            ceiling: options.transfer_ceiling,
            realtime_priority: options.realtime_priority,
            transfers: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Run one round of libusb event handling.
    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as _,
            tv_usec: timeout.subsec_micros() as _,
        };
        // SAFETY: the context outlives the call; a null completion flag makes
        // libusb return after the first batch of events.
        let rc = unsafe { ffi::libusb_handle_events_timeout_completed(self.context.as_raw(), &tv, ptr::null_mut()) };
        match rc {
            0 | LIBUSB_ERROR_INTERRUPTED | LIBUSB_ERROR_TIMEOUT => Ok(()),
            code => Err(transport_error_from_code("libusb_handle_events", code)),
        }
    }

    /// Cancel whatever libusb still owns and wait for the callbacks.
    fn reclaim_outstanding(&mut self) {
        for native in self.transfers.iter().filter(|t| t.in_flight && !t.completed()) {
            // SAFETY: the transfer is submitted; cancelling twice is harmless.
            unsafe {
                ffi::libusb_cancel_transfer(native.raw.as_ptr());
            }
        }

        let deadline = Instant::now() + RELEASE_GRACE;
        while self.transfers.iter().any(|t| t.in_flight && !t.completed()) {
            if Instant::now() >= deadline {
                break;
            }
            if let Err(e) = self.handle_events(Duration::from_millis(20)) {
                log::warn!("event handling failed while releasing transfers: {}", e);
                break;
            }
        }
    }

    fn free_transfers(&mut self) {
        if self.transfers.iter().any(|t| t.in_flight && !t.completed()) {
            self.reclaim_outstanding();
        }

        let mut leaked = 0;
        for native in self.transfers.drain(..) {
            if native.in_flight && !native.completed() {
                // libusb may still call back into the flag.
                std::mem::forget(native.done);
                leaked += 1;
                continue;
            }
            // SAFETY: not submitted, so libusb holds no reference to it.
            unsafe { ffi::libusb_free_transfer(native.raw.as_ptr()) };
        }
        if leaked > 0 {
            log::error!("{} isochronous transfers never completed; leaking them", leaked);
        }
    }
}

impl IsochronousTransport for LibusbIsoTransport {
    fn transfer_ceiling(&self) -> usize {
        self.ceiling
    }

    fn allocate(&mut self, pool: &mut [TransferDescriptor]) -> Result<(), TransportError> {
        if !self.transfers.is_empty() {
            return Err(TransportError::Other("transfers already allocated".into()));
        }

        for descriptor in pool.iter() {
            // SAFETY: plain allocation, freed in `release` or on drop.
            let raw = unsafe { ffi::libusb_alloc_transfer(descriptor.packets.len() as c_int) };
            let Some(raw) = NonNull::new(raw) else {
                self.free_transfers();
                return Err(TransportError::Other("libusb_alloc_transfer failed".into()));
            };
            self.transfers.push(NativeTransfer {
                raw,
                done: Box::new(AtomicBool::new(false)),
                in_flight: false,
            });
        }

        log::debug!(
            "allocated {} isochronous transfers on endpoint {:#04x}",
            self.transfers.len(),
            self.endpoint
        );
        Ok(())
    }

    fn submit(&mut self, descriptor: &mut TransferDescriptor) -> Result<(), TransportError> {
        let raw_handle = self.raw_handle;
        let endpoint = self.endpoint;
        let native = self
            .transfers
            .get_mut(descriptor.slot)
            .ok_or_else(|| TransportError::Other(format!("slot {} not allocated", descriptor.slot)))?;

        native.done.store(false, Ordering::Release);
        let transfer = native.raw.as_ptr();
        let flag: *const AtomicBool = &*native.done;

        // SAFETY: the transfer was allocated with one packet descriptor per
        // descriptor packet and is not in flight. The buffer is boxed inside
        // the pool; `release` leaves descriptors libusb still holds in flight
        // and the engine leaks their buffers instead of freeing them.
        let rc = unsafe {
            (*transfer).dev_handle = raw_handle;
            (*transfer).flags = 0;
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
            (*transfer).timeout = 0;
            (*transfer).buffer = descriptor.buffer.as_mut_ptr();
            (*transfer).length = descriptor.buffer.len() as c_int;
            (*transfer).num_iso_packets = descriptor.packets.len() as c_int;
            (*transfer).callback = transfer_complete;
            (*transfer).user_data = flag.cast_mut().cast::<c_void>();

            let packets = iso_packets(transfer);
            for (i, packet) in descriptor.packets.iter().enumerate() {
                let desc = &mut *packets.add(i);
                desc.length = packet.requested as c_uint;
                desc.actual_length = 0;
                desc.status = 0;
            }
            ffi::libusb_submit_transfer(transfer)
        };

        if rc != 0 {
            return Err(transport_error_from_code("libusb_submit_transfer", rc));
        }
        native.in_flight = true;
        Ok(())
    }

    fn wait_for_completions(
        &mut self,
        pool: &mut [TransferDescriptor],
        completed: &mut Vec<usize>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.handle_events(timeout)?;

        for (slot, native) in self.transfers.iter_mut().enumerate() {
            if !native.in_flight || !native.completed() {
                continue;
            }
            native.in_flight = false;
            let Some(descriptor) = pool.get_mut(slot) else {
                continue;
            };
            // SAFETY: the callback has run, so libusb no longer uses the transfer.
            let status = unsafe { copy_packet_results(native.raw.as_ptr(), descriptor) };
            if status == LIBUSB_TRANSFER_NO_DEVICE {
                log::debug!("transfer {} completed without a device", slot);
            }
            completed.push(slot);
        }
        Ok(())
    }

    fn cancel(&mut self, descriptor: &TransferDescriptor) -> Result<(), TransportError> {
        let Some(native) = self.transfers.get(descriptor.slot) else {
            return Ok(());
        };
        if !native.in_flight || native.completed() {
            return Ok(());
        }
        // SAFETY: the transfer is submitted and still allocated.
        match unsafe { ffi::libusb_cancel_transfer(native.raw.as_ptr()) } {
            0 | LIBUSB_ERROR_NOT_FOUND => Ok(()),
            code => Err(transport_error_from_code("libusb_cancel_transfer", code)),
        }
    }

    fn release(&mut self, pool: &mut [TransferDescriptor]) {
        if self.transfers.iter().any(|t| t.in_flight && !t.completed()) {
            self.reclaim_outstanding();
        }
        // Anything libusb still holds stays in flight so its buffer is never freed
        for (native, descriptor) in self.transfers.iter().zip(pool.iter_mut()) {
            if !(native.in_flight && !native.completed()) {
                descriptor.mark_ready();
            }
        }
        self.free_transfers();
    }

    fn prepare_acquisition_thread(&mut self) {
        if self.realtime_priority {
            priority::elevate_current_thread();
        }
    }
}

impl Drop for LibusbIsoTransport {
    fn drop(&mut self) {
        if !self.transfers.is_empty() {
            self.free_transfers();
        }
    }
}

extern "system" fn transfer_complete(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data was set to the slot's flag at submission and the flag
    // outlives the transfer.
    unsafe {
        let flag = (*transfer).user_data as *const AtomicBool;
        if let Some(flag) = flag.as_ref() {
            flag.store(true, Ordering::Release);
        }
    }
}

/// Pointer to the packet descriptors trailing the transfer struct.
///
/// # Safety
/// `transfer` must point to a transfer allocated by `libusb_alloc_transfer`.
unsafe fn iso_packets(transfer: *mut ffi::libusb_transfer) -> *mut ffi::libusb_iso_packet_descriptor {
    unsafe { ptr::addr_of_mut!((*transfer).iso_packet_desc).cast::<ffi::libusb_iso_packet_descriptor>() }
}

/// Copy per-packet lengths and statuses into `descriptor`. Returns the
/// transfer status.
///
/// # Safety
/// The transfer must have completed and not been resubmitted.
unsafe fn copy_packet_results(transfer: *mut ffi::libusb_transfer, descriptor: &mut TransferDescriptor) -> c_int {
    unsafe {
        let status = (*transfer).status;
        let packets = iso_packets(transfer);
        let count = ((*transfer).num_iso_packets.max(0) as usize).min(descriptor.packets.len());
        for (i, packet) in descriptor.packets.iter_mut().enumerate().take(count) {
            let desc = &*packets.add(i);
            packet.actual = desc.actual_length as usize;
            packet.status = packet_status(desc.status, status);
        }
        status
    }
}

fn packet_status(packet: c_int, transfer: c_int) -> PacketStatus {
    match packet {
        LIBUSB_TRANSFER_COMPLETED => PacketStatus::Completed,
        LIBUSB_TRANSFER_OVERFLOW => PacketStatus::Overflow,
        _ if transfer == LIBUSB_TRANSFER_CANCELLED => PacketStatus::Pending,
        _ => PacketStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusb::ffi::constants::{LIBUSB_TRANSFER_ERROR, LIBUSB_TRANSFER_STALL};

    #[test]
    fn packet_status_follows_libusb_codes() {
        assert_eq!(
            packet_status(LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_COMPLETED),
            PacketStatus::Completed
        );
        assert_eq!(
            packet_status(LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_COMPLETED),
            PacketStatus::Overflow
        );
        assert_eq!(
            packet_status(LIBUSB_TRANSFER_ERROR, LIBUSB_TRANSFER_COMPLETED),
            PacketStatus::Error
        );
        assert_eq!(packet_status(LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_ERROR), PacketStatus::Error);
    }

    #[test]
    fn unserviced_packets_of_cancelled_transfer_are_pending() {
        assert_eq!(
            packet_status(LIBUSB_TRANSFER_ERROR, LIBUSB_TRANSFER_CANCELLED),
            PacketStatus::Pending
        );
        // Packets that did complete before the cancel keep their data.
        assert_eq!(
            packet_status(LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_CANCELLED),
            PacketStatus::Completed
        );
    }
}
