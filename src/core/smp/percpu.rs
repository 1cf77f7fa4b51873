/// Arquivo: core/smp/percpu.rs
///
/// Propósito: Estado por-CPU acessado via segmento GS.
///
/// Detalhes de Implementação:
/// - Cada CPU recebe um `LocalCpu` estático; o endereço dele vai para
///   GS.base (MSR) durante o `cpu_init`.
/// - O campo `self_ptr` fica no offset 0 para que `mov reg, gs:[0]`
///   recupere o ponteiro do próprio `LocalCpu`.
/// - O ponteiro da thread atual fica no offset 8 (`gs:[8]`), lido e escrito
///   diretamente pelo assembly do scheduler.
use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::arch::x86_64::cpu::Cpu;
use crate::arch::x86_64::gdt::{Gdt, Tss};
use crate::core::boot::handoff::MAX_CPUS;
use crate::sched::thread::Thread;

/// Estado local de uma CPU.
///
/// O layout dos dois primeiros campos é contrato com o assembly do
/// scheduler e não pode mudar.
#[repr(C)]
pub struct LocalCpu {
    /// gs:[0] — ponteiro para esta própria estrutura
    pub self_ptr: *mut LocalCpu,
    /// gs:[8] — thread atualmente executando nesta CPU (nulo fora do scheduler)
    pub current_thread: *mut Thread,

    /// Índice lógico da CPU (0 = BSP)
    pub cpu_number: u64,
    /// LAPIC ID informado pelo bootloader
    pub lapic_id: u32,

    /// CPU terminou o `cpu_init`
    pub online: AtomicBool,
    /// CPU está em `scheduler_await` sem thread para rodar
    pub is_idle: AtomicBool,
    /// CPU foi derrubada pelo IPI de abort do panic
    pub aborted: AtomicBool,

    /// Cursor da busca circular na fila de execução
    pub last_run_queue_index: AtomicUsize,

    /// Frequência calibrada do timer LAPIC (ticks por segundo)
    pub timer_freq: AtomicU64,

    /// Topo da stack que a CPU usa quando não tem thread (o scheduler
    /// salta para ela antes de entrar na espera)
    pub idle_stack_top: u64,

    pub tss: Tss,
    pub gdt: Gdt,
}

const _: () = assert!(offset_of!(LocalCpu, self_ptr) == 0);
const _: () = assert!(offset_of!(LocalCpu, current_thread) == 8);

impl LocalCpu {
    const fn new() -> Self {
        Self {
            self_ptr: core::ptr::null_mut(),
            current_thread: core::ptr::null_mut(),
            cpu_number: 0,
            lapic_id: 0,
            online: AtomicBool::new(false),
            is_idle: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            last_run_queue_index: AtomicUsize::new(0),
            timer_freq: AtomicU64::new(0),
            idle_stack_top: 0,
            tss: Tss::new(),
            gdt: Gdt::new(),
        }
    }
}

struct CpuSlots(UnsafeCell<[LocalCpu; MAX_CPUS]>);

// Cada slot só é inicializado uma vez (pela própria CPU durante o cpu_init)
// e depois acessado via GS pela CPU dona.
unsafe impl Sync for CpuSlots {}

static CPU_SLOTS: CpuSlots = CpuSlots(UnsafeCell::new(
    [const { LocalCpu::new() }; MAX_CPUS],
));

/// Quantas CPUs já completaram o `cpu_init`.
pub static ONLINE_CPUS: AtomicU64 = AtomicU64::new(0);

/// Slot cru de uma CPU pelo índice lógico.
///
/// # Safety
///
/// Antes do `online`, só a CPU dona (ou a BSP durante o bring-up) pode
/// tocar o slot.
pub unsafe fn slot(cpu_number: usize) -> *mut LocalCpu {
    debug_assert!(cpu_number < MAX_CPUS);
    (CPU_SLOTS.0.get() as *mut LocalCpu).add(cpu_number)
}

/// `LocalCpu` da CPU atual, via GS.base.
///
/// Interrupções PRECISAM estar desabilitadas: com elas ligadas, o ISR do
/// scheduler pode nos migrar de CPU entre o `rdgsbase` e o uso do ponteiro.
pub fn cpu_get_current() -> &'static mut LocalCpu {
    assert!(
        !Cpu::interrupts_enabled(),
        "cpu_get_current com interrupcoes habilitadas"
    );
    let ptr = unsafe { Cpu::get_gs_base() } as *mut LocalCpu;
    debug_assert!(!ptr.is_null());
    unsafe { &mut *ptr }
}

/// Thread atual desta CPU (gs:[8]).
pub fn current_thread() -> *mut Thread {
    let ptr: *mut Thread;
    unsafe {
        core::arch::asm!(
            "mov {}, gs:[8]",
            out(reg) ptr,
            options(nostack, preserves_flags)
        );
    }
    ptr
}

/// Atualiza gs:[8].
pub fn set_current_thread(thread: *mut Thread) {
    unsafe {
        core::arch::asm!(
            "mov gs:[8], {}",
            in(reg) thread,
            options(nostack, preserves_flags)
        );
    }
}

/// Itera os slots de CPUs online.
pub fn online_cpus() -> impl Iterator<Item = &'static LocalCpu> {
    let count = ONLINE_CPUS.load(Ordering::Acquire) as usize;
    (0..count.min(MAX_CPUS)).filter_map(|i| {
        let cpu = unsafe { &*slot(i) };
        cpu.online.load(Ordering::Acquire).then_some(cpu)
    })
}
