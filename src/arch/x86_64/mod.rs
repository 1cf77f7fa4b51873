//! HAL x86-64: CPU, portas de I/O, GDT/TSS, IDT e APIC local.

pub mod apic;
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod ports;
