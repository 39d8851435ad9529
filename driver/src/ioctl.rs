//! The device object and its I/O-control dispatch.
//!
//! Three buffered control codes drive the whole lifecycle: `ENABLE` brings
//! the core into VMX root operation, `LAUNCH` runs one guest image to
//! completion, `SHUTDOWN` tears the lifecycle down. A spin lock serializes
//! the full launch sequence; VMX root state is per-core and a guest owns
//! the core while it runs, so one coarse lock is the whole story.

use {
    crate::HYPERVISOR,
    core::sync::atomic::{AtomicBool, Ordering},
    hypervisor::{intel::paging::GUEST_IMAGE_SIZE, Hypervisor},
    wdk_sys::{
        ntddk::{
            IoCreateDevice, IoCreateSymbolicLink, IoDeleteDevice, IoDeleteSymbolicLink,
            IofCompleteRequest,
        },
        DEVICE_OBJECT, DRIVER_OBJECT, FILE_DEVICE_UNKNOWN, IO_NO_INCREMENT, IO_STACK_LOCATION,
        IRP, NTSTATUS, NT_SUCCESS, PDEVICE_OBJECT, STATUS_BUFFER_TOO_SMALL,
        STATUS_DEVICE_NOT_READY, STATUS_INVALID_DEVICE_REQUEST, STATUS_INVALID_PARAMETER,
        STATUS_SUCCESS, STATUS_UNSUCCESSFUL, UNICODE_STRING,
    },
};

/// Enters VMX root operation; no input.
pub const IOCTL_ENABLE: u32 = 0x22e000;
/// Runs a guest image; input is the flat image copied into guest memory.
pub const IOCTL_LAUNCH: u32 = 0x22e004;
/// Tears the lifecycle down; no input.
pub const IOCTL_SHUTDOWN: u32 = 0x22e008;

static DEVICE_NAME: &[u16] = obfstr::wide!("\\Device\\minivisor\0");
static SYMLINK_NAME: &[u16] = obfstr::wide!("\\??\\minivisor\0");

static mut DEVICE: PDEVICE_OBJECT = core::ptr::null_mut();

/// Serializes control-structure setup, field initialization, image copy-in
/// and the guest run against concurrent callers.
static LAUNCH_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

struct LaunchLock;

impl LaunchLock {
    fn acquire() -> Self {
        while LAUNCH_IN_PROGRESS
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        Self
    }
}

impl Drop for LaunchLock {
    fn drop(&mut self) {
        LAUNCH_IN_PROGRESS.store(false, Ordering::Release);
    }
}

fn unicode_string(s: &'static [u16]) -> UNICODE_STRING {
    let len = s.len();

    let n = if len > 0 && s[len - 1] == 0 {
        len - 1
    } else {
        len
    };

    UNICODE_STRING {
        Length: (n * 2) as u16,
        MaximumLength: (len * 2) as u16,
        Buffer: s.as_ptr() as _,
    }
}

/// Creates the control device and its win32 symbolic link.
pub fn create_device(driver: &mut DRIVER_OBJECT) -> Result<(), NTSTATUS> {
    let mut device_name = unicode_string(DEVICE_NAME);
    let mut device: PDEVICE_OBJECT = core::ptr::null_mut();

    let status = unsafe {
        IoCreateDevice(
            driver,
            0,
            &mut device_name,
            FILE_DEVICE_UNKNOWN,
            0,
            0,
            &mut device,
        )
    };
    if !NT_SUCCESS(status) {
        return Err(status);
    }

    let mut symlink_name = unicode_string(SYMLINK_NAME);
    let status = unsafe { IoCreateSymbolicLink(&mut symlink_name, &mut device_name) };
    if !NT_SUCCESS(status) {
        unsafe { IoDeleteDevice(device) };
        return Err(status);
    }

    unsafe { DEVICE = device };

    Ok(())
}

/// Deletes the symbolic link and the control device.
pub fn delete_device() {
    let mut symlink_name = unicode_string(SYMLINK_NAME);
    unsafe {
        IoDeleteSymbolicLink(&mut symlink_name);
        if !DEVICE.is_null() {
            IoDeleteDevice(DEVICE);
            DEVICE = core::ptr::null_mut();
        }
    }
}

/// Completes open/close requests; nothing to track per handle.
pub unsafe extern "C" fn dispatch_create_close(
    _device: *mut DEVICE_OBJECT,
    irp: *mut IRP,
) -> NTSTATUS {
    complete_request(irp, STATUS_SUCCESS)
}

/// Dispatches the control codes.
pub unsafe extern "C" fn dispatch_device_control(
    _device: *mut DEVICE_OBJECT,
    irp: *mut IRP,
) -> NTSTATUS {
    let stack_location = current_stack_location(irp);
    let control_code = (*stack_location).Parameters.DeviceIoControl.IoControlCode;

    let status = match control_code {
        IOCTL_ENABLE => handle_enable(),
        IOCTL_LAUNCH => handle_launch(irp, stack_location),
        IOCTL_SHUTDOWN => handle_shutdown(),
        _ => STATUS_INVALID_DEVICE_REQUEST,
    };

    complete_request(irp, status)
}

fn handle_enable() -> NTSTATUS {
    if unsafe { HYPERVISOR.is_some() } {
        log::info!("Virtualization is already enabled");
        return STATUS_SUCCESS;
    }

    let mut hypervisor = match Hypervisor::new() {
        Ok(hypervisor) => hypervisor,
        Err(error) => {
            log::error!("Failed to create hypervisor: {}", error);
            return STATUS_UNSUCCESSFUL;
        }
    };

    if let Err(error) = hypervisor.enable() {
        log::error!("Failed to enter VMX root operation: {}", error);
        return STATUS_UNSUCCESSFUL;
    }

    unsafe { HYPERVISOR = Some(hypervisor) };
    log::info!("VMX root operation entered");

    STATUS_SUCCESS
}

unsafe fn handle_launch(irp: *mut IRP, stack_location: *mut IO_STACK_LOCATION) -> NTSTATUS {
    let input_length = (*stack_location).Parameters.DeviceIoControl.InputBufferLength as usize;
    if input_length < GUEST_IMAGE_SIZE {
        log::error!("Guest image must be {:#x} bytes, got {:#x}", GUEST_IMAGE_SIZE, input_length);
        return STATUS_BUFFER_TOO_SMALL;
    }

    let buffer = (*irp).AssociatedIrp.SystemBuffer as *const u8;
    if buffer.is_null() {
        return STATUS_INVALID_PARAMETER;
    }
    let image = &*(buffer as *const [u8; GUEST_IMAGE_SIZE]);

    let _lock = LaunchLock::acquire();

    let Some(hypervisor) = HYPERVISOR.as_mut() else {
        log::error!("Launch requested before virtualization was enabled");
        return STATUS_DEVICE_NOT_READY;
    };

    match hypervisor.launch(image) {
        Ok(()) => {
            log::info!("Guest ran to completion");
            STATUS_SUCCESS
        }
        Err(error) => {
            log::error!("Guest launch failed: {}", error);
            STATUS_UNSUCCESSFUL
        }
    }
}

fn handle_shutdown() -> NTSTATUS {
    let _lock = LaunchLock::acquire();

    let Some(hypervisor) = (unsafe { HYPERVISOR.as_mut() }) else {
        log::error!("Shutdown requested before virtualization was enabled");
        return STATUS_DEVICE_NOT_READY;
    };

    match hypervisor.shutdown() {
        Ok(()) => STATUS_SUCCESS,
        Err(error) => {
            log::error!("Shutdown failed: {}", error);
            STATUS_UNSUCCESSFUL
        }
    }
}

fn current_stack_location(irp: *mut IRP) -> *mut IO_STACK_LOCATION {
    unsafe {
        (*irp)
            .Tail
            .Overlay
            .__bindgen_anon_2
            .__bindgen_anon_1
            .CurrentStackLocation
    }
}

fn complete_request(irp: *mut IRP, status: NTSTATUS) -> NTSTATUS {
    unsafe {
        (*irp).IoStatus.__bindgen_anon_1.Status = status;
        (*irp).IoStatus.Information = 0;
        IofCompleteRequest(irp, IO_NO_INCREMENT as _);
    }
    status
}
