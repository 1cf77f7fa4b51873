//! Panic Handler.
//!
//! Quando o Rust detecta um estado irrecuperável, esta função é chamada.
//!
//! # Comportamento
//! 1. Desabilita interrupções (evita loop de panics).
//! 2. Manda IPI de abort para as outras CPUs (elas param onde estão).
//! 3. Loga o erro na Serial (para o desenvolvedor).
//! 4. Trava a CPU (hlt loop).

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::apic::lapic;
use crate::arch::x86_64::cpu::Cpu;
use crate::arch::x86_64::idt::{self, CpuStatus, ABORT_VECTOR};

/// Só broadcastamos o IPI de abort depois que o LAPIC do BSP está de pé.
static IPI_READY: AtomicBool = AtomicBool::new(false);

/// Chamado pelo boot depois de `lapic::enable()` no BSP.
pub fn mark_ipi_ready() {
    idt::register_handler(ABORT_VECTOR, abort_handler);
    IPI_READY.store(true, Ordering::Release);
}

/// Handler do vetor de abort: a CPU que recebe marca-se morta e para.
fn abort_handler(_vector: u32, _status: &mut CpuStatus) {
    Cpu::disable_interrupts();
    crate::core::smp::percpu::cpu_get_current()
        .aborted
        .store(true, core::sync::atomic::Ordering::Release);
    Cpu::hang();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // 1. Segurança imediata: parar interrupções
    Cpu::disable_interrupts();

    // 2. Parar as outras CPUs antes que pisem no estado quebrado
    if IPI_READY.load(Ordering::Acquire) {
        lapic::send_ipi_all_but_self(ABORT_VECTOR);
    }

    // 3. Log estruturado, usando a rota que ignora o lock da serial:
    // quem estava segurando o lock pode ser exatamente quem panicou.
    use crate::core::logging::log_line_force as out;
    use crate::core::logging::P_ERROR;

    out(P_ERROR, format_args!("================ KERNEL PANIC ================"));

    if let Some(location) = info.location() {
        out(
            P_ERROR,
            format_args!("Location: {}:{}", location.file(), location.line()),
        );
    } else {
        out(P_ERROR, format_args!("Location: Unknown"));
    }

    out(P_ERROR, format_args!("Reason:   {}", info.message()));
    out(P_ERROR, format_args!("=============================================="));

    // 4. Morrer com dignidade
    Cpu::hang();
}
