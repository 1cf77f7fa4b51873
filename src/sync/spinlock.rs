//! Spinlock - bloqueio com busy-wait e heurística de deadlock.
//!
//! A detecção de "deadlock" é um limite fixo de iterações de spin, não um
//! detector real de ciclos. Estourou o limite, o kernel entra em panic com
//! o endereço do lock — melhor um diagnóstico grosseiro do que travar em
//! silêncio.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::cpu::Cpu;

/// Limite de iterações de spin antes de declarar deadlock.
const DEADLOCK_SPIN_LIMIT: u64 = 50_000_000;

/// Spinlock - usa busy-wait, NÃO pode dormir
///
/// # Quando usar
///
/// - Seções críticas MUITO curtas
/// - Dentro de handlers de interrupção
/// - Quando não pode chamar scheduler
pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Spinlock protege acesso com lock atômico
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Cria novo spinlock
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Adquire o lock.
    ///
    /// Desabilita interrupções enquanto o guard viver. Spin limitado: se o
    /// lock não sair em `DEADLOCK_SPIN_LIMIT` iterações, panic.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let interrupts_enabled = Cpu::interrupts_enabled();
        Cpu::disable_interrupts();

        let mut spins: u64 = 0;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
            spins += 1;
            if spins >= DEADLOCK_SPIN_LIMIT {
                crate::kerror!("(Sync) Lock address: {:p}", self as *const _);
                panic!("Deadlock detected");
            }
        }

        SpinlockGuard {
            lock: self,
            interrupts_were_enabled: interrupts_enabled,
        }
    }

    /// Tenta adquirir sem bloquear
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let interrupts_enabled = Cpu::interrupts_enabled();
        Cpu::disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard {
                lock: self,
                interrupts_were_enabled: interrupts_enabled,
            })
        } else {
            // Não conseguiu, restaurar interrupções
            if interrupts_enabled {
                Cpu::enable_interrupts();
            }
            None
        }
    }

    /// Força o desbloqueio do spinlock.
    ///
    /// # Safety
    ///
    /// Só deve ser usado quando o dono original não tem mais como soltar o
    /// guard (ex.: teardown no panic handler).
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Guard do spinlock - libera ao sair do escopo
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    interrupts_were_enabled: bool,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Lock está adquirido
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Lock está adquirido
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);

        if self.interrupts_were_enabled {
            Cpu::enable_interrupts();
        }
    }
}

/// Lock cru, sem guard e sem dado embutido.
///
/// O scheduler sobrecarrega este lock como teste de posse: a CPU que
/// conseguir `test_and_acquire` numa thread é a única que pode mutar o
/// estado salvo dela. Também implementa o `yield_await` (yield síncrono).
pub struct RawLock {
    locked: AtomicBool,
}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Adquire com spin limitado; estourar o limite é deadlock fatal.
    pub fn acquire(&self) {
        let mut spins: u64 = 0;
        while !self.test_and_acquire() {
            core::hint::spin_loop();
            spins += 1;
            if spins >= DEADLOCK_SPIN_LIMIT {
                crate::kerror!("(Sync) RawLock address: {:p}", self as *const _);
                panic!("Deadlock detected");
            }
        }
    }

    /// Test-and-set: true se ESTA chamada obteve o lock.
    #[inline]
    pub fn test_and_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// O lock está tomado neste instante? (apenas diagnóstico)
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}
