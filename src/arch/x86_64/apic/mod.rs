//! Interrupt controllers locais (um LAPIC por core).

pub mod lapic;
