pub mod boot;
pub mod logging;
pub mod panic;
pub mod smp;
