//! Scheduler preemptivo por CPU.
//!
//! Fila de execução global de tamanho fixo; cada CPU pega trabalho de lá
//! no seu próprio tick de timer (LAPIC one-shot). Threads são a unidade de
//! escalonamento; processos agrupam pagemap, threads, fds e cwd.

pub mod event;
pub mod process;
pub mod scheduler;
pub mod thread;

#[cfg(feature = "self_test")]
pub mod test;
