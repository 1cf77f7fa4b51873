//! Brasa Kernel Library.
//!
//! Ponto central de exportação dos módulos do Kernel.
//! Define a estrutura hierárquica do sistema operacional.
//!
//! Diferente de um microkernel, o Brasa é monolítico: gerência de memória,
//! scheduler e VFS vivem todos no mesmo espaço de endereçamento, e a
//! fronteira entre os módulos é puramente de organização de código.

#![no_std]
#![feature(alloc_error_handler)]
#![allow(clippy::missing_safety_doc)]

// Habilitar alocação dinâmica (necessário para Vec/Box/Arc)
extern crate alloc;

// --- Módulos de Baixo Nível (Hardware) ---
pub mod arch; // HAL x86-64 (CPU, GDT, IDT, APIC)
pub mod drivers; // Drivers mínimos do core (Serial, PIT)

// --- Módulos Centrais (Lógica do Kernel) ---
pub mod core; // Boot, Handoff, Logging, Panic, SMP
pub mod klib; // Utilitários Internos (Align, Test Framework)
pub mod mm; // Gerenciamento de Memória (PMM, Slab, VMM, Mmap)
pub mod sync; // Primitivas de Sincronização (Spinlock, RawLock)

// --- Subsistemas ---
pub mod fs; // Contrato de Resource (backing de mmap não-anônimo)
pub mod sched; // Scheduler, Threads e Processos

// Re-exportar BootInfo para acesso fácil no binário
pub use crate::core::boot::handoff::BootInfo;

/// Roda as suítes de self-test in-kernel. Chamado no boot, com só a BSP
/// online, para que os testes de fila não acordem outras CPUs.
#[cfg(feature = "self_test")]
pub fn run_self_tests() {
    mm::test::run_all();
    sched::test::run_all();
}
