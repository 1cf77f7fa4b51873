//! Ponto de entrada do kernel

use crate::core::boot::handoff::BootInfo;

/// Ponto de entrada principal do kernel.
///
/// Chamado pelo `_start` em main.rs após setup inicial.
///
/// # Ordem de Inicialização
///
/// 1. Serial/Logging
/// 2. IDT (precisamos de handlers antes de mexer em memória)
/// 3. Memória (PMM → Heap → VMM)
/// 4. BSP como CPU 0 (GDT, TSS, per-CPU, LAPIC)
/// 5. Scheduler
/// 6. Self-tests (antes das APs acordarem)
/// 7. SMP
/// 8. Thread inicial + entrar na espera do scheduler
pub fn kernel_main(boot_info: &'static BootInfo) -> ! {
    // 1. Logging primeiro: tudo abaixo reporta pela serial
    crate::drivers::serial::init();
    crate::kinfo!("Brasa kernel inicializando...");
    crate::kinfo!("(Boot) HHDM offset: {:#x}", boot_info.hhdm_offset);
    crate::kinfo!("(Boot) CPUs detectadas: {}", boot_info.smp.cpu_count);

    // 2. Interrupções: instala os 256 gates e carrega a IDT na BSP
    unsafe {
        crate::arch::x86_64::idt::idt_init();
        crate::arch::x86_64::idt::idt_reload();
    }

    // 3. Memória física, heap e mapeamentos do kernel
    crate::mm::pmm::pmm_init(boot_info);
    crate::mm::vmm::vmm_init(boot_info);

    // 4. BSP vira a CPU 0 do ponto de vista do resto do kernel
    crate::core::smp::bringup::bsp_init(boot_info);
    crate::core::panic::mark_ipi_ready();

    // 5. Scheduler (aloca o vetor de preempção, registra o ISR)
    crate::sched::scheduler::scheduler_init();

    // 6. Self-tests rodam com só a BSP online: os testes de fila do
    //    scheduler não podem acordar APs no meio da verificação.
    #[cfg(feature = "self_test")]
    crate::run_self_tests();

    // 7. Acordar as outras CPUs
    crate::core::smp::bringup::smp_init(boot_info);

    // 8. Primeira thread de kernel; ela mantém o heartbeat vivo
    crate::sched::scheduler::spawn_kernel_thread(kernel_idle_main, 0);

    crate::kinfo!("(Boot) Inicialização completa, entrando no scheduler");
    crate::sched::scheduler::scheduler_await();
}

/// Corpo da primeira thread de kernel. Por enquanto só existe para que a
/// fila de execução nunca fique vazia com zero eventos pendentes.
extern "C" fn kernel_idle_main(_arg: u64) -> ! {
    loop {
        crate::sched::scheduler::scheduler_yield(true);
    }
}
