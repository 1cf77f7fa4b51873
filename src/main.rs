//! Kernel Brasa — Binário Principal.
//!
//! Responsabilidade:
//! 1. Configurar o ambiente de execução "naked" (Assembly).
//! 2. Inicializar a Stack de boot do BSP.
//! 3. Habilitar SSE.
//! 4. Saltar para `core::boot::entry::kernel_main` (da biblioteca `brasa`).
//!
//! O bootloader (protocolo estilo Limine) já nos entrega em long mode,
//! com a metade alta mapeada (HHDM) e um ponteiro para o `BootInfo` em RDI.

#![no_std]
#![no_main]

use brasa::core as kernel_core;

extern crate alloc;

// Stack de boot do BSP (64 KB). As stacks definitivas das threads vêm do
// PMM depois que o scheduler sobe; esta só vive até o primeiro switch.
#[repr(align(16))]
struct BootStack([u8; 64 * 1024]);

#[no_mangle]
static BOOT_STACK: BootStack = BootStack([0; 64 * 1024]);

/// Ponto de entrada Naked.
/// Configura o Stack Pointer (RSP), habilita SSE e chama kernel_main.
#[unsafe(naked)]
#[no_mangle]
#[link_section = ".text._start"]
pub unsafe extern "C" fn _start(boot_info_addr: u64) -> ! {
    ::core::arch::naked_asm!(
        // ============================================================
        // 1. Salvar argumento (boot_info) em R15 (Callee-saved)
        // ============================================================
        "mov r15, rdi",
        // ============================================================
        // 2. Configurar Stack Pointer (RSP)
        // ============================================================
        "lea rax, [rip + {stack}]",
        "lea rsp, [rax + {stack_size}]",
        // 3. Zerar RBP (Frame Pointer)
        "xor rbp, rbp",
        // ============================================================
        // 4. Habilitar SSE (necessário para código Rust)
        // ============================================================
        "mov rax, cr0",
        "and ax, 0xFFFB", // Limpar CR0.EM (bit 2)
        "or ax, 0x2",     // Setar CR0.MP (bit 1)
        "mov cr0, rax",
        "mov rax, cr4",
        "or rax, 0x600",  // CR4.OSFXSR | CR4.OSXMMEXCPT
        "mov cr4, rax",
        // ============================================================
        // 5. Chamar kernel_main(boot_info) — nunca retorna
        // ============================================================
        "mov rdi, r15",
        "call {kmain}",
        "2:",
        "cli",
        "hlt",
        "jmp 2b",
        stack = sym BOOT_STACK,
        stack_size = const 64 * 1024,
        kmain = sym trampoline
    );
}

/// Converte o ponteiro cru do bootloader na referência tipada do kernel.
unsafe extern "C" fn trampoline(boot_info_addr: u64) -> ! {
    let boot_info = &*(boot_info_addr as *const brasa::BootInfo);
    kernel_core::boot::entry::kernel_main(boot_info)
}
