//! The minivisor kernel driver.
//!
//! The control surface over the hypervisor crate: a device object whose
//! I/O-control interface enables virtualization, launches a guest image
//! and tears the virtualization lifecycle down again.

#![no_std]

// Set up a panic handler for non-test configurations.
#[cfg(not(test))]
extern crate wdk_panic;

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: hypervisor::utils::alloc::KernelAlloc = hypervisor::utils::alloc::KernelAlloc;

pub mod ioctl;

use {
    hypervisor::Hypervisor,
    log::LevelFilter,
    wdk_sys::{DRIVER_OBJECT, IRP_MJ_CLOSE, IRP_MJ_CREATE, IRP_MJ_DEVICE_CONTROL, NTSTATUS, PUNICODE_STRING, STATUS_SUCCESS, STATUS_UNSUCCESSFUL},
};

/// The hypervisor context for the current lifecycle.
///
/// Created by `IOCTL_ENABLE`, destroyed (after teardown) at unload.
static mut HYPERVISOR: Option<Hypervisor> = None;

/// The main entry point for the driver.
///
/// Sets up logging, wires the dispatch table and creates the control
/// device. Virtualization itself is not touched until `IOCTL_ENABLE`.
///
/// Reference: WDF expects a symbol with the name DriverEntry.
#[export_name = "DriverEntry"]
pub unsafe extern "system" fn driver_entry(
    driver: &mut DRIVER_OBJECT,
    _registry_path: PUNICODE_STRING,
) -> NTSTATUS {
    // The in-box kernel logger is unusable once a guest has launched, so
    // everything goes out over the COM2 serial port instead.
    com_logger::builder()
        .base(0x2f8)
        .filter(LevelFilter::Info)
        .setup();

    log::info!("Driver entry called");

    driver.DriverUnload = Some(driver_unload);
    driver.MajorFunction[IRP_MJ_CREATE as usize] = Some(ioctl::dispatch_create_close);
    driver.MajorFunction[IRP_MJ_CLOSE as usize] = Some(ioctl::dispatch_create_close);
    driver.MajorFunction[IRP_MJ_DEVICE_CONTROL as usize] = Some(ioctl::dispatch_device_control);

    if ioctl::create_device(driver).is_err() {
        log::error!("Failed to create the control device");
        return STATUS_UNSUCCESSFUL;
    }

    STATUS_SUCCESS
}

/// The unload callback for the driver.
///
/// Dropping the hypervisor context runs the (idempotent) teardown even if
/// `IOCTL_SHUTDOWN` already did.
pub extern "C" fn driver_unload(_driver: *mut DRIVER_OBJECT) {
    log::info!("Unloading the driver");

    if let Some(hypervisor) = unsafe { HYPERVISOR.take() } {
        core::mem::drop(hypervisor);
    }

    ioctl::delete_device();

    log::info!("Driver unloaded");
}
