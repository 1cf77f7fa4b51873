pub mod bringup;
pub mod percpu;
