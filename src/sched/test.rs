//! Testes do scheduler que não exigem outra CPU: rodam na BSP antes do SMP,
//! com a fila de execução ainda vazia. Threads criadas aqui nunca executam;
//! entram e saem da fila e morrem por `free_resources`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::Ordering;

use crate::arch::x86_64::gdt::{KERNEL_CODE_SEL, KERNEL_DATA_SEL};
use crate::arch::x86_64::idt::CpuStatus;
use crate::core::smp::percpu;
use crate::fs::resource::MemResource;
use crate::klib::test_framework::{run_test_suite, TestCase, TestResult};
use crate::mm::config::{PAGE_SIZE, USER_STACK_PAGES};
use crate::mm::mmap::{addr2range, munmap, MmapProt};
use crate::mm::vmm::{Pagemap, VmmError};
use crate::sched::event;
use crate::sched::process::{
    process_by_pid, process_destroy, scheduler_new_process, MMAP_ANON_BASE, THREAD_STACK_TOP_BASE,
};
use crate::sched::scheduler::{
    dequeue_thread, enqueue_thread, mark_cpu_working, preemption_tick, queue_occurrences,
    scheduler_await, scheduler_yield,
};
use crate::sched::thread::{Thread, NO_CPU};
use crate::sync::spinlock::RawLock;

pub fn run_all() {
    run_test_suite("Scheduler", SCHED_TESTS);
}

pub const SCHED_TESTS: &[TestCase] = &[
    TestCase::new("sched_enqueue_idempotent", test_enqueue_idempotent),
    TestCase::new("sched_distinct_slots", test_distinct_slots),
    TestCase::new("sched_signal_flag", test_signal_flag),
    TestCase::new("sched_rawlock_exclusive", test_rawlock_exclusive),
    TestCase::new("sched_event_counter_balance", test_event_counter_balance),
    TestCase::new("sched_keep_running_when_queued", test_keep_running_when_queued),
    TestCase::new("sched_dequeued_thread_blocks", test_dequeued_thread_blocks),
    TestCase::new("sched_process_fork_lifecycle", test_process_fork_lifecycle),
];

extern "C" fn queue_looper_main(_: u64) -> ! {
    loop {
        scheduler_yield(true);
    }
}

fn destroy_test_thread(thread: *mut Thread) {
    unsafe {
        (*thread).free_resources();
        drop(Box::from_raw(thread));
    }
}

/// Enfileirar duas vezes deixa UMA referência na fila; a segunda chamada é
/// um no-op que devolve false.
fn test_enqueue_idempotent() -> TestResult {
    let t = Thread::new_kernel(queue_looper_main, 0);

    let mut ok = enqueue_thread(t, false);
    ok &= !enqueue_thread(t, false);
    ok &= queue_occurrences(t) == 1;

    dequeue_thread(t);
    ok &= queue_occurrences(t) == 0;

    // Depois de sair, entra de novo normalmente
    ok &= enqueue_thread(t, false);
    ok &= queue_occurrences(t) == 1;
    dequeue_thread(t);

    destroy_test_thread(t);
    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(Sched) enqueue repetido duplicou a thread na fila");
        TestResult::Failed
    }
}

/// Threads diferentes ocupam slots diferentes e saem sem afetar as demais.
fn test_distinct_slots() -> TestResult {
    let a = Thread::new_kernel(queue_looper_main, 0);
    let b = Thread::new_kernel(queue_looper_main, 1);
    let c = Thread::new_kernel(queue_looper_main, 2);

    let mut ok = enqueue_thread(a, false) && enqueue_thread(b, false) && enqueue_thread(c, false);
    ok &= queue_occurrences(a) == 1 && queue_occurrences(b) == 1 && queue_occurrences(c) == 1;

    dequeue_thread(b);
    ok &= queue_occurrences(a) == 1 && queue_occurrences(b) == 0 && queue_occurrences(c) == 1;

    dequeue_thread(a);
    dequeue_thread(c);
    ok &= queue_occurrences(a) == 0 && queue_occurrences(c) == 0;

    destroy_test_thread(a);
    destroy_test_thread(b);
    destroy_test_thread(c);
    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(Sched) slots da fila nao ficaram independentes");
        TestResult::Failed
    }
}

/// `by_signal` anota a origem do despertar e é reescrito a cada enqueue.
fn test_signal_flag() -> TestResult {
    let t = Thread::new_kernel(queue_looper_main, 0);

    enqueue_thread(t, true);
    let mut ok = unsafe { (*t).enqueued_by_signal.load(Ordering::Acquire) };
    dequeue_thread(t);

    enqueue_thread(t, false);
    ok &= !unsafe { (*t).enqueued_by_signal.load(Ordering::Acquire) };
    dequeue_thread(t);

    destroy_test_thread(t);
    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(Sched) enqueued_by_signal nao acompanhou o enqueue");
        TestResult::Failed
    }
}

/// O contador de dormidores sobe e desce em pares.
fn test_event_counter_balance() -> TestResult {
    let before = event::waiting_count();

    event::waiter_arrive();
    event::waiter_arrive();
    let mut ok = event::waiting_count() == before + 2;

    event::waiter_depart();
    event::waiter_depart();
    ok &= event::waiting_count() == before;

    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(Sched) contador de eventos desbalanceado");
        TestResult::Failed
    }
}

/// Monta o estado de uma thread "corrente" desta CPU com um yield síncrono
/// pendente, como o ISR a encontraria.
fn install_as_current(t: *mut Thread) -> CpuStatus {
    let cpu = percpu::cpu_get_current();
    unsafe {
        (*t).lock.acquire();
        (*t).yield_await.acquire();
        (*t).cpuid.store(cpu.cpu_number, Ordering::Release);
    }
    percpu::set_current_thread(t);

    let mut frame = CpuStatus::zeroed();
    frame.rip = 0xdead_beef;
    frame.rsp = 0xcafe_0000;
    frame.cs = KERNEL_CODE_SEL.0 as u64;
    frame.ss = KERNEL_DATA_SEL.0 as u64;
    frame.rflags = 0x202;
    frame
}

/// Sem mais ninguém elegível, uma corrente AINDA enfileirada continua
/// rodando: o frame volta intacto e o yield pendente é resolvido na hora.
fn test_keep_running_when_queued() -> TestResult {
    let t = Thread::new_kernel(queue_looper_main, 0);
    enqueue_thread(t, false);
    let mut frame = install_as_current(t);

    preemption_tick(&mut frame);

    let mut ok = percpu::current_thread() == t;
    ok &= frame.rip == 0xdead_beef;
    ok &= queue_occurrences(t) == 1;
    unsafe { ok &= !(*t).yield_await.is_locked() };

    percpu::set_current_thread(core::ptr::null_mut());
    unsafe { (*t).lock.release() };
    dequeue_thread(t);
    mark_cpu_working();
    destroy_test_thread(t);
    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(Sched) corrente enfileirada nao continuou rodando");
        TestResult::Failed
    }
}

/// Uma corrente que tirou a si mesma da fila NÃO volta a rodar num tick sem
/// trabalho: o contexto é salvo, a posse é largada e o retorno da
/// interrupção é desviado para o loop ocioso.
fn test_dequeued_thread_blocks() -> TestResult {
    let t = Thread::new_kernel(queue_looper_main, 0);
    let cpu = percpu::cpu_get_current();
    let mut frame = install_as_current(t);

    preemption_tick(&mut frame);

    let mut ok = percpu::current_thread().is_null();
    ok &= frame.rip == scheduler_await as usize as u64;
    ok &= frame.rsp == cpu.idle_stack_top;
    ok &= frame.rflags & 0x200 == 0;
    unsafe {
        ok &= (*t).status.rip == 0xdead_beef;
        ok &= (*t).status.rsp == 0xcafe_0000;
        ok &= !(*t).yield_await.is_locked();
        ok &= !(*t).lock.is_locked();
        ok &= (*t).cpuid.load(Ordering::Acquire) == NO_CPU;
    }

    mark_cpu_working();
    destroy_test_thread(t);
    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(Sched) corrente bloqueada voltou a rodar num tick vazio");
        TestResult::Failed
    }
}

/// Ciclo de vida de processo: criação com pagemap adotado, stack de usuário
/// pelo cursor do processo, thread ring-3 com FPU default, fds, mmap
/// anônimo, fork com espaço de endereçamento copiado e destruição.
fn test_process_fork_lifecycle() -> TestResult {
    // Processo de kernel adota o pagemap que o chamador fornece
    let adopted = Pagemap::new_user();
    let adopted_top = adopted.top_level;
    let parent = match scheduler_new_process(None, Some(adopted)) {
        Ok(p) => p,
        Err(e) => {
            crate::kerror!("(Sched) criacao de processo falhou: {:?}", e);
            return TestResult::Failed;
        }
    };
    let parent_ref = unsafe { &*parent };
    let mut ok = process_by_pid(parent_ref.pid) == Some(parent);
    ok &= parent_ref.pagemap.top_level == adopted_top;

    // Stack de usuário via o cursor do processo
    let stack_top = match parent_ref.new_thread_stack() {
        Ok(t) => t,
        Err(_) => {
            unsafe { process_destroy(parent) };
            return TestResult::Failed;
        }
    };
    ok &= stack_top == THREAD_STACK_TOP_BASE;
    let stack_base = stack_top - USER_STACK_PAGES * PAGE_SIZE;

    let thread = Thread::new_user(parent, 0x40_0000, 0, stack_top);
    parent_ref.threads.lock().push(thread);
    ok &= unsafe { (*thread).cr3 } == parent_ref.pagemap.top_level;

    // Ring 3 nasce com FCW 0x33f e MXCSR 0x1f80 (exceções mascaradas)
    unsafe {
        let fpu = (*thread).fpu_storage;
        ok &= (fpu as *const u16).read() == 0x33f;
        ok &= (fpu.add(24) as *const u32).read() == 0x1f80;
    }

    // fd aberto no pai e mmap anônimo sem endereço fixo
    let fd = parent_ref.fd_open(Arc::new(MemResource::new(vec![7u8; 16])));
    let anon = match parent_ref.mmap_anonymous(PAGE_SIZE, MmapProt::READ | MmapProt::WRITE) {
        Ok(a) => a,
        Err(_) => {
            unsafe { process_destroy(parent) };
            return TestResult::Failed;
        }
    };
    ok &= anon >= MMAP_ANON_BASE;

    let child = match scheduler_new_process(Some(parent_ref), None) {
        Ok(c) => c,
        Err(e) => {
            crate::kerror!("(Sched) fork falhou: {:?}", e);
            unsafe { process_destroy(parent) };
            return TestResult::Failed;
        }
    };
    let child_ref = unsafe { &*child };
    ok &= child_ref.ppid == parent_ref.pid;

    // Os locais do filho apontam para o pagemap DELE, já na posição
    // definitiva no heap
    match addr2range(&child_ref.pagemap, stack_base) {
        Some(local) => {
            ok &= unsafe { (*local).pagemap } == &child_ref.pagemap as *const Pagemap;
        }
        None => ok = false,
    }

    // A stack do pai existe no filho, em frames próprios
    let in_parent = parent_ref.pagemap.virt2phys(stack_base);
    let in_child = child_ref.pagemap.virt2phys(stack_base);
    ok &= in_parent.is_ok() && in_child.is_ok() && in_parent != in_child;

    // fds, cwd e cursores herdados
    ok &= child_ref.fd_get(fd).is_some();
    ok &= *child_ref.cwd.lock() == *parent_ref.cwd.lock();
    ok &= child_ref.thread_stack_top.load(Ordering::Acquire)
        == parent_ref.thread_stack_top.load(Ordering::Acquire);
    ok &= child_ref.mmap_anon_non_fixed_base.load(Ordering::Acquire)
        == parent_ref.mmap_anon_non_fixed_base.load(Ordering::Acquire);

    // munmap no filho percorre o pagemap do filho sem tocar o do pai
    ok &= munmap(&child_ref.pagemap, anon, PAGE_SIZE).is_ok();
    ok &= child_ref.pagemap.virt2phys(anon) == Err(VmmError::NotMapped);
    ok &= parent_ref.pagemap.virt2phys(anon).is_ok();

    parent_ref.threads.lock().clear();
    unsafe {
        (*thread).free_resources();
        drop(Box::from_raw(thread));
        process_destroy(child);
        process_destroy(parent);
    }

    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(Sched) ciclo de processo/fork inconsistente");
        TestResult::Failed
    }
}

/// O lock de afinidade é exclusivo: só um dono por vez, e liberar devolve a
/// vez ao próximo test_and_acquire.
fn test_rawlock_exclusive() -> TestResult {
    let lock = RawLock::new();

    let mut ok = lock.test_and_acquire();
    ok &= lock.is_locked();
    ok &= !lock.test_and_acquire();

    lock.release();
    ok &= !lock.is_locked();
    ok &= lock.test_and_acquire();
    lock.release();

    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(Sched) RawLock aceitou dois donos simultaneos");
        TestResult::Failed
    }
}
