//! Self-tests dos subsistemas de memória.
//!
//! Rodam na BSP, antes do SMP e do scheduler: interrupções ainda seguem o
//! fluxo normal de boot e nenhuma outra CPU toca o PMM enquanto os testes
//! medem contadores de páginas livres.

pub mod pmm_test;
pub mod slab_test;
pub mod vmm_test;

use crate::klib::test_framework::run_test_suite;

pub fn run_all() {
    run_test_suite("PMM", pmm_test::PMM_TESTS);
    run_test_suite("Slab", slab_test::SLAB_TESTS);
    run_test_suite("VMM", vmm_test::VMM_TESTS);
    run_test_suite("Mmap", mmap_test::MMAP_TESTS);
}
