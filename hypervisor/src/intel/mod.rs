pub mod controls;
pub mod ept;
pub mod paging;
pub mod registers;
pub mod segmentation;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmexit;
pub mod vmlaunch;
pub mod vmxon;
