//! Primitivas de sincronização do kernel.
//!
//! Duas famílias:
//! - [`Spinlock`]: lock com guard RAII que desabilita interrupções, para
//!   dados compartilhados comuns (PMM, slab, listas de ranges).
//! - [`RawLock`]: lock cru sem guard, com `test_and_acquire`, usado pelo
//!   scheduler como flag "esta thread está rodando em alguma CPU".

pub mod spinlock;

pub use spinlock::{RawLock, Spinlock, SpinlockGuard};
