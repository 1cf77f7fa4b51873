//! Threads de kernel e de usuário.
//!
//! Uma thread carrega tudo que o context switch precisa: o register file
//! salvo (`CpuStatus`), CR3, bases de FS/GS, a área de FPU e as stacks.
//! O `lock` embutido é o teste de posse do scheduler: a CPU que o segura é
//! a única autorizada a mutar o estado salvo.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch::x86_64::cpu;
use crate::arch::x86_64::gdt::{KERNEL_CODE_SEL, KERNEL_DATA_SEL, USER_CODE_SEL, USER_DATA_SEL};
use crate::arch::x86_64::idt::CpuStatus;
use crate::mm::addr::phys_to_virt;
use crate::mm::config::{KERNEL_STACK_PAGES, PAGE_SIZE, PF_STACK_PAGES};
use crate::mm::pmm;
use crate::mm::slab;
use crate::sched::process::Process;
use crate::sync::spinlock::RawLock;

/// Timeslice default, em microssegundos.
pub const DEFAULT_TIMESLICE_US: u64 = 5000;

/// Sem afinidade: a thread não está rodando em CPU nenhuma.
pub const NO_CPU: u64 = u64::MAX;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

pub struct Thread {
    /// Posse do scheduler (ver doc do módulo)
    pub lock: RawLock,
    /// Tomado durante um yield síncrono; o ISR solta depois de salvar o
    /// contexto, sinalizando que a thread pode ser re-enfileirada
    pub yield_await: RawLock,

    pub tid: u64,
    /// Evita inserção dupla na fila de execução
    pub is_in_queue: AtomicBool,
    /// Último enqueue veio de entrega de sinal
    pub enqueued_by_signal: AtomicBool,
    /// CPU que está executando a thread agora (`NO_CPU` = nenhuma)
    pub cpuid: AtomicU64,

    pub status: CpuStatus,
    pub cr3: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    /// Microssegundos até a próxima preempção
    pub timeslice_us: u64,

    /// Área de save de FPU (tamanho de `cpu::fpu_storage_size()`, align 64)
    pub fpu_storage: *mut u8,

    /// Base FÍSICA e topo virtual da stack de kernel
    kernel_stack_phys: u64,
    pub kernel_stack_top: u64,
    /// Stack dedicada de page fault (vai para a IST3 do TSS)
    pf_stack_phys: u64,
    pub pf_stack_top: u64,

    /// Processo dono (nulo para threads puras de kernel)
    pub process: *mut Process,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

fn alloc_stack(pages: u64) -> (u64, u64) {
    let phys = pmm::pmm_alloc(pages);
    (phys, phys_to_virt(phys) + pages * PAGE_SIZE)
}

fn alloc_fpu_storage() -> *mut u8 {
    let size = cpu::fpu_storage_size() as u64;
    let ptr = slab::alloc(size, 64);
    unsafe { core::ptr::write_bytes(ptr, 0, size as usize) };
    ptr
}

/// Área de FPU de thread de usuário: x87 com as exceções mascaradas e
/// precisão estendida (FCW 0x33f), SSE com as exceções mascaradas
/// (MXCSR 0x1f80). Uma área zerada deixaria todas desmascaradas e a
/// primeira instrução de FP em ring 3 levantaria #MF/#XM.
fn alloc_user_fpu_storage() -> *mut u8 {
    let ptr = alloc_fpu_storage();
    unsafe {
        // Layout legacy do FXSAVE: FCW no offset 0, MXCSR no 24
        (ptr as *mut u16).write(0x33f);
        (ptr.add(24) as *mut u32).write(0x1f80);
        if cpu::fpu_uses_xsave() {
            // XSTATE_BV no header: x87 e SSE vêm da área, não do init
            (ptr.add(512) as *mut u64).write(0b11);
        }
    }
    ptr
}

impl Thread {
    /// Thread de kernel pronta para enfileirar: executa `entry(arg)` sobre
    /// o pagemap do kernel, em ring 0.
    pub fn new_kernel(entry: extern "C" fn(u64) -> !, arg: u64) -> *mut Thread {
        let (kstack_phys, kstack_top) = alloc_stack(KERNEL_STACK_PAGES);
        let (pf_phys, pf_top) = alloc_stack(PF_STACK_PAGES);

        let mut status = CpuStatus::zeroed();
        status.rip = entry as usize as u64;
        status.rdi = arg;
        status.rsp = kstack_top;
        status.cs = KERNEL_CODE_SEL.0 as u64;
        status.ss = KERNEL_DATA_SEL.0 as u64;
        status.rflags = 0x202; // IF

        Box::into_raw(Box::new(Thread {
            lock: RawLock::new(),
            yield_await: RawLock::new(),
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            is_in_queue: AtomicBool::new(false),
            enqueued_by_signal: AtomicBool::new(false),
            cpuid: AtomicU64::new(NO_CPU),
            status,
            cr3: crate::mm::vmm::kernel_pagemap().top_level,
            fs_base: 0,
            gs_base: 0,
            timeslice_us: DEFAULT_TIMESLICE_US,
            fpu_storage: alloc_fpu_storage(),
            kernel_stack_phys: kstack_phys,
            kernel_stack_top: kstack_top,
            pf_stack_phys: pf_phys,
            pf_stack_top: pf_top,
            process: core::ptr::null_mut(),
        }))
    }

    /// Thread de usuário: executa `entry(arg)` em ring 3 sobre o pagemap de
    /// `process`, com `user_stack_top` já mapeado pelo chamador.
    pub fn new_user(
        process: *mut Process,
        entry: u64,
        arg: u64,
        user_stack_top: u64,
    ) -> *mut Thread {
        debug_assert!(!process.is_null());
        let (kstack_phys, kstack_top) = alloc_stack(KERNEL_STACK_PAGES);
        let (pf_phys, pf_top) = alloc_stack(PF_STACK_PAGES);

        let mut status = CpuStatus::zeroed();
        status.rip = entry;
        status.rdi = arg;
        status.rsp = user_stack_top;
        status.cs = USER_CODE_SEL.0 as u64;
        status.ss = USER_DATA_SEL.0 as u64;
        status.rflags = 0x202;

        let cr3 = unsafe { (*process).pagemap.top_level };

        Box::into_raw(Box::new(Thread {
            lock: RawLock::new(),
            yield_await: RawLock::new(),
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            is_in_queue: AtomicBool::new(false),
            enqueued_by_signal: AtomicBool::new(false),
            cpuid: AtomicU64::new(NO_CPU),
            status,
            cr3,
            fs_base: 0,
            gs_base: 0,
            timeslice_us: DEFAULT_TIMESLICE_US,
            fpu_storage: alloc_user_fpu_storage(),
            kernel_stack_phys: kstack_phys,
            kernel_stack_top: kstack_top,
            pf_stack_phys: pf_phys,
            pf_stack_top: pf_top,
            process,
        }))
    }

    /// Devolve stacks e área de FPU. A struct em si é liberada pelo
    /// `Box::from_raw` de quem chamar.
    ///
    /// # Safety
    ///
    /// A thread não pode estar na fila nem rodando em CPU alguma.
    pub unsafe fn free_resources(&mut self) {
        pmm::pmm_free(self.kernel_stack_phys, KERNEL_STACK_PAGES);
        pmm::pmm_free(self.pf_stack_phys, PF_STACK_PAGES);
        slab::free(self.fpu_storage);
        self.fpu_storage = core::ptr::null_mut();
    }
}
