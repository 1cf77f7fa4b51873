//! Utilitários internos do kernel.

pub mod align;
pub mod test_framework;
