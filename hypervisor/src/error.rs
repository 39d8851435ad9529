use thiserror_no_std::Error;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Intel CPU not found")]
    CPUUnsupported,
    #[error("VMX is not supported")]
    VMXUnsupported,
    #[error("VMX locked off in BIOS")]
    VMXBIOSLock,
    #[error("Failed to allocate {0}")]
    MemoryAllocationFailed(&'static str),
    #[error("Failed to convert from virtual address to physical address")]
    VirtualToPhysicalAddressFailed,
    #[error("Failed to execute VMXON")]
    VMXONFailed,
    #[error("Failed to execute VMXOFF")]
    VMXOFFFailed,
    #[error("Failed to execute VMCLEAR")]
    VMCLEARFailed,
    #[error("Failed to execute VMPTRLD")]
    VMPTRLDFailed,
    #[error("Failed to write VMCS field {0:#x}")]
    VMWRITEFailed(u32),
    #[error("Failed to execute VMLAUNCH")]
    VMLAUNCHFailed,
    #[error("Failed to resume the guest after a VM-exit")]
    FatalExit,
    #[error("Failed to switch execution to processor {0}")]
    ProcessorSwitchFailed(u32),
}
