//! Gerenciamento de Memória.
//!
//! Camadas, de baixo para cima:
//! - `pmm`: frames físicos (bitmap next-fit)
//! - `slab`/`heap`: alocação de kernel (`GlobalAlloc`)
//! - `vmm`: page tables de 4 níveis
//! - `mmap`: ranges de memória virtual por processo (anon e com resource)

pub mod addr;
pub mod config;
pub mod heap;
pub mod mmap;
pub mod pmm;
pub mod slab;
pub mod vmm;

#[cfg(feature = "self_test")]
pub mod test;
