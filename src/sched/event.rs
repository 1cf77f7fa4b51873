//! Contagem de eventos pendentes.
//!
//! O scheduler usa este contador como batimento cardíaco do sistema: se
//! nenhuma CPU está trabalhando E ninguém espera evento nenhum, o kernel
//! não tem mais como progredir e é derrubado com diagnóstico em vez de
//! ficar dormindo para sempre.

use core::sync::atomic::{AtomicU64, Ordering};

/// Threads bloqueadas esperando algum evento futuro.
pub static WAITING_EVENT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Registra um dormidor antes de sair da fila de execução.
pub fn waiter_arrive() {
    WAITING_EVENT_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// O dormidor acordou (ou desistiu).
pub fn waiter_depart() {
    let old = WAITING_EVENT_COUNT.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(old > 0, "contagem de eventos negativa");
}

pub fn waiting_count() -> u64 {
    WAITING_EVENT_COUNT.load(Ordering::Acquire)
}
