//! Processos: um pagemap, um PID, threads, fds e cursores de endereçamento.
//!
//! A tabela de processos é um array fixo de ponteiros atômicos; o índice do
//! slot É o PID, e a alocação é um CAS de null para o processo novo.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::fs::resource::Resource;
use crate::klib::align::align_up;
use crate::mm::config::{PAGE_SIZE, USER_STACK_PAGES};
use crate::mm::mmap::{self, MmapError, MmapFlags, MmapProt};
use crate::mm::vmm::Pagemap;
use crate::sched::thread::Thread;
use crate::sync::spinlock::Spinlock;

pub const MAX_PROCESSES: usize = 256;

/// Topo inicial das stacks de threads de usuário; cada stack nova desce a
/// partir daqui.
pub const THREAD_STACK_TOP_BASE: u64 = 0x7FFF_FFFF_F000;

/// Primeira base dos mmaps anônimos sem endereço fixo.
pub const MMAP_ANON_BASE: u64 = 0x1000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    TableFull,
    ForkFailed,
}

pub struct Process {
    pub pid: u64,
    pub ppid: u64,
    pub pagemap: Pagemap,
    pub threads: Spinlock<Vec<*mut Thread>>,
    /// Tabela de file descriptors; o índice do slot é o fd
    pub fds: Spinlock<Vec<Option<Arc<dyn Resource>>>>,
    pub cwd: Spinlock<String>,
    /// Topo da próxima stack de thread de usuário (desce)
    pub thread_stack_top: AtomicU64,
    /// Base do próximo mmap anônimo sem FIXED (sobe)
    pub mmap_anon_non_fixed_base: AtomicU64,
}

unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    /// Reserva e mapeia uma stack de usuário nova abaixo do cursor
    /// `thread_stack_top`, com uma página de guarda entre stacks vizinhas.
    /// Devolve o topo virtual da stack.
    pub fn new_thread_stack(&self) -> Result<u64, MmapError> {
        let size = USER_STACK_PAGES * PAGE_SIZE;
        let top = self
            .thread_stack_top
            .fetch_sub(size + PAGE_SIZE, Ordering::AcqRel);
        mmap::mmap_map_range(
            &self.pagemap,
            top - size,
            size,
            MmapProt::READ | MmapProt::WRITE,
            MmapFlags::PRIVATE | MmapFlags::ANONYMOUS | MmapFlags::FIXED,
            None,
            0,
        )?;
        Ok(top)
    }

    /// Mapeia um range anônimo privado sem endereço fixo, avançando a base
    /// de alocação do processo.
    pub fn mmap_anonymous(&self, length: u64, prot: MmapProt) -> Result<u64, MmapError> {
        let length = align_up(length, PAGE_SIZE);
        let base = self
            .mmap_anon_non_fixed_base
            .fetch_add(length, Ordering::AcqRel);
        mmap::mmap_map_range(
            &self.pagemap,
            base,
            length,
            prot,
            MmapFlags::PRIVATE | MmapFlags::ANONYMOUS,
            None,
            0,
        )
    }

    /// Registra o resource no primeiro fd livre e o devolve.
    pub fn fd_open(&self, resource: Arc<dyn Resource>) -> u64 {
        let mut fds = self.fds.lock();
        for (fd, slot) in fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(resource);
                return fd as u64;
            }
        }
        fds.push(Some(resource));
        (fds.len() - 1) as u64
    }

    pub fn fd_get(&self, fd: u64) -> Option<Arc<dyn Resource>> {
        self.fds.lock().get(fd as usize).and_then(|s| s.clone())
    }

    /// Fecha o fd. `false` se ele não estava aberto.
    pub fn fd_close(&self, fd: u64) -> bool {
        let mut fds = self.fds.lock();
        match fds.get_mut(fd as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

static PROCESSES: [AtomicPtr<Process>; MAX_PROCESSES] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NULL: AtomicPtr<Process> = AtomicPtr::new(core::ptr::null_mut());
    [NULL; MAX_PROCESSES]
};

/// Cria um processo novo.
///
/// Com `fork_of`, o espaço de endereçamento do pai é duplicado segundo as
/// regras de `mmap_fork_pagemap`, junto com a tabela de fds, o cwd e os
/// cursores de stack e de mmap. Com `pagemap`, o processo (de kernel) adota
/// o pagemap fornecido em vez de ganhar um vazio.
///
/// O PID devolvido é o índice do slot conquistado na tabela (PID 0 não
/// existe; é o kernel).
pub fn scheduler_new_process(
    fork_of: Option<&Process>,
    pagemap: Option<Pagemap>,
) -> Result<*mut Process, ProcessError> {
    debug_assert!(fork_of.is_none() || pagemap.is_none());

    // O pagemap nasce já no endereço definitivo: cada local criado pelo
    // fork guarda um ponteiro para ele, então ele não pode se mover depois.
    let proc = Box::into_raw(Box::new(Process {
        pid: 0,
        ppid: 0,
        pagemap: pagemap.unwrap_or_else(Pagemap::new_user),
        threads: Spinlock::new(Vec::new()),
        fds: Spinlock::new(Vec::new()),
        cwd: Spinlock::new(String::from("/")),
        thread_stack_top: AtomicU64::new(THREAD_STACK_TOP_BASE),
        mmap_anon_non_fixed_base: AtomicU64::new(MMAP_ANON_BASE),
    }));

    if let Some(parent) = fork_of {
        if mmap::mmap_fork_pagemap(&parent.pagemap, unsafe { &(*proc).pagemap }).is_err() {
            unsafe {
                mmap::mmap_cleanup_pagemap(&(*proc).pagemap);
                (*proc).pagemap.destroy_tables();
                drop(Box::from_raw(proc));
            }
            return Err(ProcessError::ForkFailed);
        }

        let p = unsafe { &mut *proc };
        p.ppid = parent.pid;
        *p.fds.lock() = parent.fds.lock().clone();
        *p.cwd.lock() = parent.cwd.lock().clone();
        p.thread_stack_top.store(
            parent.thread_stack_top.load(Ordering::Acquire),
            Ordering::Release,
        );
        p.mmap_anon_non_fixed_base.store(
            parent.mmap_anon_non_fixed_base.load(Ordering::Acquire),
            Ordering::Release,
        );
    }

    for pid in 1..MAX_PROCESSES {
        unsafe { (*proc).pid = pid as u64 };
        if PROCESSES[pid]
            .compare_exchange(
                core::ptr::null_mut(),
                proc,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return Ok(proc);
        }
    }

    // Tabela cheia: desfazer tudo
    unsafe {
        mmap::mmap_cleanup_pagemap(&(*proc).pagemap);
        (*proc).pagemap.destroy_tables();
        drop(Box::from_raw(proc));
    }
    Err(ProcessError::TableFull)
}

/// Processo registrado com este PID, se existir.
pub fn process_by_pid(pid: u64) -> Option<*mut Process> {
    if pid == 0 || pid as usize >= MAX_PROCESSES {
        return None;
    }
    let ptr = PROCESSES[pid as usize].load(Ordering::Acquire);
    (!ptr.is_null()).then_some(ptr)
}

/// Remove o processo da tabela e libera pagemap e ranges.
///
/// # Safety
///
/// Nenhuma thread do processo pode estar na fila ou rodando.
pub unsafe fn process_destroy(proc: *mut Process) {
    let pid = (*proc).pid as usize;
    PROCESSES[pid].store(core::ptr::null_mut(), Ordering::Release);

    mmap::mmap_cleanup_pagemap(&(*proc).pagemap);
    (*proc).pagemap.destroy_tables();
    drop(Box::from_raw(proc));
}
