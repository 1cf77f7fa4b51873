//! O coração do scheduler.
//!
//! Fila de execução global: um array fixo de ponteiros atômicos. Inserir é
//! um CAS no primeiro slot nulo; pegar trabalho é uma varredura circular a
//! partir do cursor por-CPU. Uma thread é "conquistada" quando a CPU vence
//! o `test_and_acquire` do lock dela (ou quando já é a dona — afinidade
//! pelo campo `cpuid`).
//!
//! A preempção é o timer LAPIC em one-shot: cada troca de thread rearma o
//! timer com o timeslice dela. CPU sem trabalho rearma um poll lento e
//! dorme em `hlt` dentro de `scheduler_await`.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use spin::Once;

use alloc::boxed::Box;

use crate::arch::x86_64::apic::lapic;
use crate::arch::x86_64::cpu::{self, Cpu};
use crate::arch::x86_64::gdt::{KERNEL_CODE_SEL, KERNEL_DATA_SEL};
use crate::arch::x86_64::idt::{self, restore_cpu_status, CpuStatus};
use crate::core::smp::percpu::{self, LocalCpu};
use crate::sched::event;
use crate::sched::thread::{Thread, NO_CPU};

pub const MAX_THREADS: usize = 512;

/// Período do poll de uma CPU ociosa, em microssegundos (20 ms).
const IDLE_POLL_US: u64 = 20_000;

static RUN_QUEUE: [AtomicPtr<Thread>; MAX_THREADS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NULL: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());
    [NULL; MAX_THREADS]
};

static SCHEDULER_VECTOR: Once<u8> = Once::new();

/// CPUs executando uma thread neste momento (ociosas não contam).
pub static WORKING_CPUS: AtomicU64 = AtomicU64::new(0);

/// Aloca o vetor de preempção e registra o ISR. Roda uma vez, na BSP.
pub fn scheduler_init() {
    let vector = idt::allocate_vector();
    idt::register_handler(vector, scheduler_isr);
    SCHEDULER_VECTOR.call_once(|| vector);
    crate::kinfo!("(Sched) Vetor de preempcao: {}", vector);
}

#[inline]
fn sched_vector() -> u8 {
    *SCHEDULER_VECTOR.get().expect("scheduler_init nao rodou")
}

#[inline]
fn timer_freq(cpu: &LocalCpu) -> u64 {
    cpu.timer_freq.load(Ordering::Relaxed)
}

/// Marca a CPU atual como trabalhando/ociosa, mantendo `WORKING_CPUS`.
fn set_idle(cpu: &LocalCpu, idle: bool) {
    if cpu.is_idle.swap(idle, Ordering::AcqRel) != idle {
        if idle {
            WORKING_CPUS.fetch_sub(1, Ordering::AcqRel);
        } else {
            WORKING_CPUS.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Chamado pelo `cpu_init`: até entrar pela primeira vez no
/// `scheduler_await`, a CPU conta como trabalhando.
pub fn scheduler_cpu_online() {
    WORKING_CPUS.fetch_add(1, Ordering::AcqRel);
}

/// Insere a thread na fila de execução.
///
/// Idempotente: enfileirar quem já está na fila é um no-op que devolve
/// `false`. Depois de inserir, acorda uma CPU ociosa por IPI (se houver).
/// `by_signal` só anota a origem do despertar para quem consome sinais.
pub fn enqueue_thread(thread: *mut Thread, by_signal: bool) -> bool {
    let t = unsafe { &*thread };
    t.enqueued_by_signal.store(by_signal, Ordering::Release);
    if t.is_in_queue.swap(true, Ordering::AcqRel) {
        return false;
    }

    for slot in RUN_QUEUE.iter() {
        if slot
            .compare_exchange(
                core::ptr::null_mut(),
                thread,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            for cpu in percpu::online_cpus() {
                if cpu.is_idle.load(Ordering::Acquire) {
                    lapic::send_ipi(cpu.lapic_id, sched_vector());
                    break;
                }
            }
            return true;
        }
    }

    t.is_in_queue.store(false, Ordering::Release);
    panic!("run queue esgotada ({} threads)", MAX_THREADS);
}

/// Remove a thread da fila (não mexe em quem já está executando).
pub fn dequeue_thread(thread: *mut Thread) {
    for slot in RUN_QUEUE.iter() {
        if slot
            .compare_exchange(
                thread,
                core::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            break;
        }
    }
    unsafe { (*thread).is_in_queue.store(false, Ordering::Release) };
}

/// Quantas vezes `thread` aparece na fila (usado pelos self-tests).
#[cfg(feature = "self_test")]
pub fn queue_occurrences(thread: *mut Thread) -> usize {
    RUN_QUEUE
        .iter()
        .filter(|slot| slot.load(Ordering::Acquire) == thread)
        .count()
}

/// Executa o caminho do ISR de preempção sobre um frame sintético (usado
/// pelos self-tests, com interrupções desabilitadas).
#[cfg(feature = "self_test")]
pub fn preemption_tick(status: &mut CpuStatus) {
    scheduler_isr(0, status);
}

/// Desfaz a marca de ociosidade deixada por um tick sem trabalho e desarma
/// o timer (usado pelos self-tests).
#[cfg(feature = "self_test")]
pub fn mark_cpu_working() {
    lapic::timer_stop();
    set_idle(percpu::cpu_get_current(), false);
}

fn queue_is_empty() -> bool {
    RUN_QUEUE
        .iter()
        .all(|slot| slot.load(Ordering::Acquire).is_null())
}

/// Varredura circular a partir do cursor da CPU.
///
/// Devolve a primeira thread conquistável: ou o lock dela saiu no
/// `test_and_acquire`, ou ela já pertence a esta CPU (caso "continuar
/// rodando a atual"). Nulo = nada elegível.
fn get_next_thread(cpu: &LocalCpu) -> *mut Thread {
    let mut index = cpu.last_run_queue_index.load(Ordering::Relaxed) + 1;

    for _ in 0..=MAX_THREADS {
        if index >= MAX_THREADS {
            index = 0;
        }

        let thread = RUN_QUEUE[index].load(Ordering::Acquire);
        if !thread.is_null() {
            let t = unsafe { &*thread };
            if t.cpuid.load(Ordering::Acquire) == cpu.cpu_number || t.lock.test_and_acquire() {
                cpu.last_run_queue_index.store(index, Ordering::Relaxed);
                return thread;
            }
        }

        index += 1;
    }

    core::ptr::null_mut()
}

/// Salva o contexto de `current` a partir do frame de interrupção e larga a
/// posse dela: depois disto qualquer CPU pode conquistá-la de novo.
fn park_current(current: *mut Thread, status: &CpuStatus) {
    let cur = unsafe { &mut *current };
    cur.status = *status;
    cur.cr3 = Cpu::read_cr3();
    unsafe {
        cur.fs_base = Cpu::get_fs_base();
        if cur.status.cs & 3 == 3 {
            // O swapgs da entrada deixou o GS do usuário no MSR kernel
            cur.gs_base = Cpu::get_kernel_gs_base();
        }
        cpu::fpu_save(cur.fpu_storage);
    }
    cur.cpuid.store(NO_CPU, Ordering::Release);
    // Contexto salvo: um yield síncrono pode prosseguir
    cur.yield_await.release();
    cur.lock.release();
}

/// ISR de preempção. Corre com interrupções desabilitadas, no vetor
/// alocado pelo `scheduler_init`, disparado por timer ou por IPI de wake.
fn scheduler_isr(_vector: u32, status: &mut CpuStatus) {
    lapic::timer_stop();

    let cpu = percpu::cpu_get_current();
    let current = percpu::current_thread();
    let next = get_next_thread(cpu);

    if next.is_null() {
        lapic::eoi();
        if current.is_null() {
            // Segue ociosa; o iretq volta para o hlt do scheduler_await
            set_idle(cpu, true);
            lapic::timer_oneshot(timer_freq(cpu), sched_vector(), IDLE_POLL_US);
        } else if unsafe { &*current }.is_in_queue.load(Ordering::Acquire) {
            // Ninguém elegível: a atual continua. Um yield pendente é
            // resolvido aqui — não há para quem ceder.
            let t = unsafe { &*current };
            t.yield_await.release();
            lapic::timer_oneshot(timer_freq(cpu), sched_vector(), t.timeslice_us);
        } else {
            // A atual tirou a si mesma da fila (bloqueou). Ela só pode
            // voltar a rodar por re-seleção depois de um enqueue: guardar
            // o contexto e desviar o retorno da interrupção para o loop
            // ocioso em vez de voltar para ela.
            park_current(current, status);
            percpu::set_current_thread(core::ptr::null_mut());

            *status = CpuStatus::zeroed();
            status.rip = scheduler_await as usize as u64;
            status.rsp = cpu.idle_stack_top;
            status.cs = KERNEL_CODE_SEL.0 as u64;
            status.ss = KERNEL_DATA_SEL.0 as u64;
            status.rflags = 1 << 1; // IF desligado; o await religa

            set_idle(cpu, true);
            lapic::timer_oneshot(timer_freq(cpu), sched_vector(), IDLE_POLL_US);
        }
        return;
    }

    if next == current {
        lapic::eoi();
        let t = unsafe { &*current };
        t.yield_await.release();
        lapic::timer_oneshot(timer_freq(cpu), sched_vector(), t.timeslice_us);
        return;
    }

    // Guardar o contexto da thread que sai
    if !current.is_null() {
        park_current(current, status);
    }

    // Instalar a que entra
    let t = unsafe { &mut *next };
    t.cpuid.store(cpu.cpu_number, Ordering::Release);
    percpu::set_current_thread(next);
    set_idle(cpu, false);

    // Page faults desta thread caem na stack dela (IST3)
    cpu.tss.ist[2] = t.pf_stack_top;

    unsafe {
        if Cpu::read_cr3() != t.cr3 {
            Cpu::write_cr3(t.cr3);
        }
        cpu::fpu_restore(t.fpu_storage);
        Cpu::set_fs_base(t.fs_base);
        if t.status.cs & 3 == 3 {
            Cpu::set_kernel_gs_base(t.gs_base);
        }
    }

    lapic::eoi();
    lapic::timer_oneshot(timer_freq(cpu), sched_vector(), t.timeslice_us);

    unsafe { restore_cpu_status(&t.status) };
}

/// Loop de espera de uma CPU sem thread. Nunca retorna.
///
/// Troca para a stack ociosa da CPU antes de entrar no loop: quem chama
/// pode estar numa stack prestes a morrer (boot, AP, thread em destruição).
pub fn scheduler_await() -> ! {
    Cpu::disable_interrupts();
    let cpu = percpu::cpu_get_current();
    let stack_top = cpu.idle_stack_top;
    debug_assert!(stack_top != 0);

    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "xor rbp, rbp",
            "jmp {body}",
            stack = in(reg) stack_top,
            body = sym await_body,
            options(noreturn)
        );
    }
}

unsafe extern "C" fn await_body() -> ! {
    let cpu = percpu::cpu_get_current();
    percpu::set_current_thread(core::ptr::null_mut());
    set_idle(cpu, true);
    lapic::timer_oneshot(timer_freq(cpu), sched_vector(), IDLE_POLL_US);

    loop {
        Cpu::enable_interrupts();
        Cpu::halt();
        Cpu::disable_interrupts();

        // Batimento cardíaco: todo mundo ocioso, fila vazia e zero eventos
        // pendentes significa que o sistema nunca mais progride.
        if WORKING_CPUS.load(Ordering::Acquire) == 0
            && event::waiting_count() == 0
            && queue_is_empty()
        {
            panic!("event heartbeat has flatlined");
        }
    }
}

/// Cede a CPU voluntariamente.
///
/// `save_context = true`: o yield-lock da thread é tomado e só é solto pelo
/// ISR — ao salvar o contexto dela numa troca, ou ao concluir que não há
/// para quem ceder. A chamada retorna quando o lock abrir de novo, ou seja,
/// quando a thread voltar a ser a escolhida. `false`: viagem só de ida
/// (caminho de morte), nada é salvo.
pub fn scheduler_yield(save_context: bool) {
    Cpu::disable_interrupts();
    lapic::timer_stop();

    let current = percpu::current_thread();
    if save_context {
        debug_assert!(!current.is_null());
        let t = unsafe { &*current };
        t.yield_await.acquire();

        lapic::send_self_ipi(sched_vector());
        Cpu::enable_interrupts();

        while t.yield_await.is_locked() {
            Cpu::halt();
        }
        return;
    }

    percpu::set_current_thread(core::ptr::null_mut());
    if !current.is_null() {
        unsafe {
            (*current).cpuid.store(NO_CPU, Ordering::Release);
            (*current).lock.release();
        }
    }

    lapic::send_self_ipi(sched_vector());
    Cpu::enable_interrupts();

    loop {
        Cpu::halt();
    }
}

/// Cria e enfileira uma thread de kernel.
pub fn spawn_kernel_thread(entry: extern "C" fn(u64) -> !, arg: u64) -> *mut Thread {
    let thread = Thread::new_kernel(entry, arg);
    enqueue_thread(thread, false);
    thread
}

/// Morte da thread atual: sai da fila, libera os recursos e devolve a CPU
/// ao scheduler. Nunca retorna.
pub fn scheduler_dequeue_and_die() -> ! {
    Cpu::disable_interrupts();
    lapic::timer_stop();

    let current = percpu::current_thread();
    debug_assert!(!current.is_null());
    dequeue_thread(current);

    // A stack de kernel desta thread será liberada; terminar a morte na
    // stack ociosa da CPU.
    let cpu = percpu::cpu_get_current();
    let stack_top = cpu.idle_stack_top;

    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "xor rbp, rbp",
            "mov rdi, {thread}",
            "jmp {body}",
            stack = in(reg) stack_top,
            thread = in(reg) current,
            body = sym die_body,
            options(noreturn)
        );
    }
}

unsafe extern "C" fn die_body(thread: *mut Thread) -> ! {
    percpu::set_current_thread(core::ptr::null_mut());
    (*thread).free_resources();
    drop(Box::from_raw(thread));

    // Direto para o await: o lock da thread morreu com ela
    scheduler_await();
}
