//! Testes do alocador de slab e do caminho grande (multi-página).

use alloc::vec::Vec;

use crate::klib::test_framework::{TestCase, TestResult};
use crate::mm::config::PAGE_SIZE;
use crate::mm::slab;

pub const SLAB_TESTS: &[TestCase] = &[
    TestCase::new("slab_class_rounding", test_class_rounding),
    TestCase::new("slab_reuse_after_free", test_reuse_after_free),
    TestCase::new("slab_big_alloc", test_big_alloc),
    TestCase::new("slab_realloc_preserves", test_realloc_preserves),
    TestCase::new("heap_global_alloc", test_heap_global_alloc),
];

/// Cada pedido cai na menor classe que o comporta e respeita o alinhamento.
fn test_class_rounding() -> TestResult {
    let cases: &[(u64, u64, u64)] = &[
        (1, 1, 8),
        (8, 8, 8),
        (9, 1, 16),
        (24, 8, 24),
        (100, 4, 128),
        (1024, 64, 1024),
    ];

    for &(size, align, expected) in cases {
        let ptr = slab::alloc(size, align);
        let usable = slab::usable_size(ptr);
        let misaligned = ptr as u64 % align != 0;
        slab::free(ptr);

        if usable != expected || misaligned {
            crate::kerror!(
                "(Slab) alloc({}, {}) deu classe {} em {:p}",
                size,
                align,
                usable,
                ptr
            );
            return TestResult::Failed;
        }
    }
    TestResult::Passed
}

/// Liberar uma célula a devolve à free list da classe: o próximo pedido da
/// mesma classe a reusa.
fn test_reuse_after_free() -> TestResult {
    let a = slab::alloc(64, 8);
    slab::free(a);
    let b = slab::alloc(64, 8);
    let reused = a == b;
    slab::free(b);

    if !reused {
        crate::kerror!("(Slab) celula liberada nao foi reusada ({:p} vs {:p})", a, b);
        return TestResult::Failed;
    }
    TestResult::Passed
}

/// Pedidos acima da maior classe saem do PMM, alinhados a página, com o
/// tamanho pedido rastreado para o `free`.
fn test_big_alloc() -> TestResult {
    let size = 3 * PAGE_SIZE;
    let ptr = slab::alloc(size, 8);

    if ptr as u64 % PAGE_SIZE != 0 {
        crate::kerror!("(Slab) alocacao grande nao veio alinhada a pagina");
        slab::free(ptr);
        return TestResult::Failed;
    }
    if slab::usable_size(ptr) < size {
        crate::kerror!("(Slab) usable_size da alocacao grande menor que o pedido");
        slab::free(ptr);
        return TestResult::Failed;
    }

    unsafe { core::ptr::write_bytes(ptr, 0x5A, size as usize) };
    slab::free(ptr);
    TestResult::Passed
}

/// `realloc` muda de classe mantendo o conteúdo, inclusive cruzando a
/// fronteira slab ↔ alocação grande.
fn test_realloc_preserves() -> TestResult {
    let ptr = slab::alloc(32, 8);
    for i in 0..32 {
        unsafe { *ptr.add(i) = i as u8 };
    }

    // 32 → 2 páginas (caminho grande) → 64 (volta ao slab)
    let big = slab::realloc(ptr, 2 * PAGE_SIZE, 8);
    let back = slab::realloc(big, 64, 8);

    for i in 0..32 {
        if unsafe { *back.add(i) } != i as u8 {
            crate::kerror!("(Slab) realloc perdeu o byte {}", i);
            slab::free(back);
            return TestResult::Failed;
        }
    }
    slab::free(back);
    TestResult::Passed
}

/// O heap do kernel (Box/Vec) funciona por cima do slab.
fn test_heap_global_alloc() -> TestResult {
    let mut v: Vec<u64> = Vec::new();
    for i in 0..1000 {
        v.push(i);
    }
    for (i, &x) in v.iter().enumerate() {
        if x != i as u64 {
            crate::kerror!("(Slab) Vec corrompido no indice {}", i);
            return TestResult::Failed;
        }
    }
    TestResult::Passed
}
