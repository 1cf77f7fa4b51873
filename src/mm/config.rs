//! Constantes de layout de memória do kernel.

/// Tamanho de página (só 4 KiB; páginas grandes ficam de fora por enquanto)
pub const PAGE_SIZE: u64 = 0x1000;

/// Base do mapeamento direto da memória física (HHDM).
/// O bootloader garante RAM inteira mapeada a partir daqui.
pub const HIGHER_HALF: u64 = 0xFFFF_8000_0000_0000;

/// Stack de kernel de cada thread, em páginas (64 KiB)
pub const KERNEL_STACK_PAGES: u64 = 16;

/// Stack dedicada de page fault de cada thread, em páginas (16 KiB)
pub const PF_STACK_PAGES: u64 = 4;

/// Stacks de IST das CPUs (double fault, abort), em páginas
pub const INTERRUPT_STACK_PAGES: u64 = 4;

/// Stack de usuário de threads ring-3, em páginas (256 KiB)
pub const USER_STACK_PAGES: u64 = 64;
