//! Testes do alocador físico.

use crate::klib::test_framework::{TestCase, TestResult};
use crate::mm::addr::phys_to_virt;
use crate::mm::config::PAGE_SIZE;
use crate::mm::pmm;

pub const PMM_TESTS: &[TestCase] = &[
    TestCase::new("pmm_alloc_free_balance", test_alloc_free_balance),
    TestCase::new("pmm_no_overlap", test_no_overlap),
    TestCase::new("pmm_zero_fill", test_zero_fill),
    TestCase::new("pmm_contiguous_run", test_contiguous_run),
    TestCase::new("pmm_next_fit_wraparound", test_next_fit_wraparound),
];

/// Alocar e devolver deixa o contador de páginas livres onde estava.
fn test_alloc_free_balance() -> TestResult {
    let before = pmm::pmm_free_pages();

    let a = pmm::pmm_alloc(1);
    let b = pmm::pmm_alloc(4);
    if pmm::pmm_free_pages() != before - 5 {
        crate::kerror!("(PMM) contador nao caiu em 5 apos alocar 5 paginas");
        return TestResult::Failed;
    }

    pmm::pmm_free(a, 1);
    pmm::pmm_free(b, 4);
    if pmm::pmm_free_pages() != before {
        crate::kerror!("(PMM) contador nao voltou ao valor original");
        return TestResult::Failed;
    }
    TestResult::Passed
}

/// Alocações vivas nunca se sobrepõem.
fn test_no_overlap() -> TestResult {
    const SLOTS: usize = 8;
    let mut allocs = [(0u64, 0u64); SLOTS];

    for (i, slot) in allocs.iter_mut().enumerate() {
        let count = if i % 3 == 0 { 2 } else { 1 };
        *slot = (pmm::pmm_alloc(count), count);
    }

    let mut ok = true;
    for i in 0..SLOTS {
        let (start_i, count_i) = allocs[i];
        if start_i % PAGE_SIZE != 0 {
            crate::kerror!("(PMM) alocacao {:#x} desalinhada", start_i);
            ok = false;
        }
        for (start_j, count_j) in allocs.iter().skip(i + 1) {
            let end_i = start_i + count_i * PAGE_SIZE;
            let end_j = start_j + count_j * PAGE_SIZE;
            if start_i < end_j && *start_j < end_i {
                crate::kerror!(
                    "(PMM) sobreposicao: {:#x}+{} com {:#x}+{}",
                    start_i,
                    count_i,
                    start_j,
                    count_j
                );
                ok = false;
            }
        }
    }

    for (start, count) in allocs {
        pmm::pmm_free(start, count);
    }
    if ok {
        TestResult::Passed
    } else {
        TestResult::Failed
    }
}

/// `pmm_alloc` devolve páginas zeradas mesmo quando o frame foi sujado
/// por um dono anterior.
fn test_zero_fill() -> TestResult {
    let phys = pmm::pmm_alloc(1);
    let page = phys_to_virt(phys) as *mut u8;
    unsafe { core::ptr::write_bytes(page, 0xAA, PAGE_SIZE as usize) };
    pmm::pmm_free(phys, 1);

    // O cursor next-fit avança, então esta alocação pode ou não reusar o
    // mesmo frame; zerada ela tem que vir de qualquer jeito.
    let phys = pmm::pmm_alloc(1);
    let page = phys_to_virt(phys) as *const u8;
    for i in 0..PAGE_SIZE as usize {
        if unsafe { *page.add(i) } != 0 {
            crate::kerror!("(PMM) byte {} de {:#x} nao zerado", i, phys);
            pmm::pmm_free(phys, 1);
            return TestResult::Failed;
        }
    }
    pmm::pmm_free(phys, 1);
    TestResult::Passed
}

/// Alocações multi-página são fisicamente contíguas e escrevíveis de ponta
/// a ponta pelo HHDM.
fn test_contiguous_run() -> TestResult {
    const PAGES: u64 = 8;
    let phys = pmm::pmm_alloc(PAGES);
    let base = phys_to_virt(phys) as *mut u64;

    let words = (PAGES * PAGE_SIZE / 8) as usize;
    for i in 0..words {
        unsafe { *base.add(i) = i as u64 };
    }
    for i in 0..words {
        if unsafe { *base.add(i) } != i as u64 {
            crate::kerror!("(PMM) palavra {} corrompida no run de {} paginas", i, PAGES);
            pmm::pmm_free(phys, PAGES);
            return TestResult::Failed;
        }
    }

    pmm::pmm_free(phys, PAGES);
    TestResult::Passed
}

/// Com o cursor no fim do bitmap, alocar dá a volta e recomeça a varredura
/// do zero em vez de declarar OOM.
fn test_next_fit_wraparound() -> TestResult {
    let free_before = pmm::pmm_free_pages();
    let limit = pmm::pmm_cursor_to_end();

    let a = pmm::pmm_alloc(1);
    let b = pmm::pmm_alloc(2);

    let mut ok = pmm::pmm_cursor() < limit;
    ok &= a % PAGE_SIZE == 0 && b % PAGE_SIZE == 0;
    ok &= pmm::pmm_free_pages() == free_before - 3;

    pmm::pmm_free(a, 1);
    pmm::pmm_free(b, 2);
    ok &= pmm::pmm_free_pages() == free_before;

    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(PMM) wraparound do cursor nao reaproveitou o inicio do bitmap");
        TestResult::Failed
    }
}
