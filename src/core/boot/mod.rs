pub mod entry;
pub mod handoff;
