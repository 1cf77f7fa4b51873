//! Testes de page tables: walks, erros e a transação de mapeamento em lote.
//!
//! Todos os pagemaps criados aqui ficam fora do CR3, então nada disto mexe
//! no TLB da BSP.

use crate::arch::x86_64::cpu::{Cpu, MSR_EFER};
use crate::klib::test_framework::{TestCase, TestResult};
use crate::mm::addr::phys_to_virt;
use crate::mm::config::PAGE_SIZE;
use crate::mm::pmm;
use crate::mm::vmm::{
    kernel_pagemap, Pagemap, VmmError, PTE_ADDR_MASK, PTE_LARGE, PTE_NX, PTE_PRESENT,
    PTE_WRITABLE,
};

pub const VMM_TESTS: &[TestCase] = &[
    TestCase::new("vmm_map_roundtrip", test_map_roundtrip),
    TestCase::new("vmm_not_mapped", test_not_mapped),
    TestCase::new("vmm_kernel_half_shared", test_kernel_half_shared),
    TestCase::new("vmm_flag_page_keeps_frame", test_flag_page_keeps_frame),
    TestCase::new("vmm_huge_page_collision", test_huge_page_collision),
    TestCase::new("vmm_batch_rollback", test_batch_rollback),
    TestCase::new("vmm_nx_enabled", test_nx_enabled),
];

/// Entrada PML2 (no HHDM) que cobre `virt`, assumindo que o caminho até lá
/// já existe. Usada para plantar colisões de página grande.
unsafe fn pml2_entry(pagemap: &Pagemap, virt: u64) -> *mut u64 {
    let idx = |shift: u32| ((virt >> shift) & 0x1FF) as usize;

    let top = phys_to_virt(pagemap.top_level) as *const u64;
    let pml3 = unsafe { *top.add(idx(39)) } & PTE_ADDR_MASK;
    let pml3 = phys_to_virt(pml3) as *const u64;
    let pml2 = unsafe { *pml3.add(idx(30)) } & PTE_ADDR_MASK;
    (phys_to_virt(pml2) as *mut u64).wrapping_add(idx(21))
}

/// map_page → virt2pte devolve frame e flags intactos; virt2phys preserva o
/// offset dentro da página; unmap_page apaga a entrada.
fn test_map_roundtrip() -> TestResult {
    let pm = Pagemap::new_user();
    let frame = pmm::pmm_alloc(1);
    let virt = 0x40_0000u64;
    let flags = PTE_PRESENT | PTE_WRITABLE | PTE_NX;

    let mut ok = true;

    if pm.map_page(virt, frame, flags).is_err() {
        crate::kerror!("(VMM) map_page falhou num pagemap vazio");
        ok = false;
    }

    match pm.virt2pte(virt, false) {
        Ok(pte) => {
            let entry = unsafe { *pte };
            if entry & PTE_ADDR_MASK != frame || entry & flags != flags {
                crate::kerror!("(VMM) PTE {:#x} nao bate com frame {:#x}", entry, frame);
                ok = false;
            }
        }
        Err(e) => {
            crate::kerror!("(VMM) virt2pte falhou apos map_page: {:?}", e);
            ok = false;
        }
    }

    if pm.virt2phys(virt + 0x123) != Ok(frame + 0x123) {
        crate::kerror!("(VMM) virt2phys nao preservou o offset na pagina");
        ok = false;
    }

    if pm.unmap_page(virt).is_err() || pm.virt2phys(virt) != Err(VmmError::NotMapped) {
        crate::kerror!("(VMM) unmap_page nao apagou o mapeamento");
        ok = false;
    }

    pmm::pmm_free(frame, 1);
    pm.destroy_tables();
    if ok {
        TestResult::Passed
    } else {
        TestResult::Failed
    }
}

/// Walk sem `allocate` num pagemap vazio devolve NotMapped e não cria
/// tabela nenhuma.
fn test_not_mapped() -> TestResult {
    let pm = Pagemap::new_user();
    let free_before = pmm::pmm_free_pages();

    let ok = pm.virt2pte(0x7000_0000, false) == Err(VmmError::NotMapped)
        && pm.unmap_page(0x7000_0000) == Err(VmmError::NotMapped)
        && pm.virt2phys(0x7000_0000) == Err(VmmError::NotMapped)
        && pmm::pmm_free_pages() == free_before;

    pm.destroy_tables();
    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(VMM) walk sem allocate vazou tabelas ou nao deu NotMapped");
        TestResult::Failed
    }
}

/// A metade alta do PML4 do kernel está inteira pré-populada e todo pagemap
/// novo herda exatamente as mesmas 256 entradas.
fn test_kernel_half_shared() -> TestResult {
    let pm = Pagemap::new_user();
    let kernel_top = phys_to_virt(kernel_pagemap().top_level) as *const u64;
    let new_top = phys_to_virt(pm.top_level) as *const u64;

    let mut ok = true;
    for i in 256..512 {
        let entry = unsafe { *kernel_top.add(i) };
        if entry & PTE_PRESENT == 0 {
            crate::kerror!("(VMM) entrada {} da metade alta nao foi pre-populada", i);
            ok = false;
        }
        if entry != unsafe { *new_top.add(i) } {
            crate::kerror!("(VMM) entrada {} do PML4 nao foi herdada", i);
            ok = false;
        }
    }

    pm.destroy_tables();
    if ok {
        TestResult::Passed
    } else {
        TestResult::Failed
    }
}

/// `flag_page` troca as permissões sem tocar no frame; em endereço não
/// mapeado devolve NotMapped.
fn test_flag_page_keeps_frame() -> TestResult {
    let pm = Pagemap::new_user();
    let frame = pmm::pmm_alloc(1);
    let virt = 0x50_0000u64;

    let mut ok = pm
        .map_page(virt, frame, PTE_PRESENT | PTE_WRITABLE | PTE_NX)
        .is_ok();

    // Rebaixar para read-only
    ok &= pm.flag_page(virt, PTE_PRESENT | PTE_NX).is_ok();
    match pm.virt2pte(virt, false) {
        Ok(pte) => {
            let entry = unsafe { *pte };
            ok &= entry & PTE_ADDR_MASK == frame;
            ok &= entry & PTE_WRITABLE == 0;
        }
        Err(_) => ok = false,
    }

    ok &= pm.flag_page(0x51_0000, PTE_PRESENT) == Err(VmmError::NotMapped);

    let _ = pm.unmap_page(virt);
    pmm::pmm_free(frame, 1);
    pm.destroy_tables();
    if ok {
        TestResult::Passed
    } else {
        crate::kerror!("(VMM) flag_page mexeu no frame ou aceitou pagina ausente");
        TestResult::Failed
    }
}

/// Uma entrada de página grande no caminho do walk é erro, não corrupção.
fn test_huge_page_collision() -> TestResult {
    let pm = Pagemap::new_user();
    let frame = pmm::pmm_alloc(1);
    let virt = 0x60_0000u64;

    if pm.map_page(virt, frame, PTE_PRESENT | PTE_WRITABLE).is_err() {
        pmm::pmm_free(frame, 1);
        pm.destroy_tables();
        return TestResult::Failed;
    }

    let entry = unsafe { pml2_entry(&pm, virt) };
    unsafe { *entry |= PTE_LARGE };
    let collided = pm.virt2pte(virt, false) == Err(VmmError::HugePageCollision)
        && pm.map_page(virt, frame, PTE_PRESENT) == Err(VmmError::HugePageCollision);
    unsafe { *entry &= !PTE_LARGE };

    let _ = pm.unmap_page(virt);
    pmm::pmm_free(frame, 1);
    pm.destroy_tables();

    if collided {
        TestResult::Passed
    } else {
        crate::kerror!("(VMM) walk atravessou uma entrada de pagina grande");
        TestResult::Failed
    }
}

/// `map_contiguous_pages` é transacional: uma falha no meio desfaz as
/// páginas já mapeadas na mesma chamada.
fn test_batch_rollback() -> TestResult {
    let pm = Pagemap::new_user();
    let frames = pmm::pmm_alloc(2);

    // Monta o caminho até a PML2 do segundo 2 MiB e planta uma entrada de
    // página grande nele; a primeira página do lote fica no 2 MiB anterior
    let virt = 0x20_0000u64;
    if pm.map_page(virt, frames, PTE_PRESENT).is_err() || pm.unmap_page(virt).is_err() {
        pmm::pmm_free(frames, 2);
        pm.destroy_tables();
        return TestResult::Failed;
    }
    let entry = unsafe { pml2_entry(&pm, virt) };
    unsafe { *entry |= PTE_LARGE };

    let base = virt - PAGE_SIZE;
    let result = pm.map_contiguous_pages(base, frames, 2, PTE_PRESENT | PTE_WRITABLE);

    let mut ok = result == Err(VmmError::HugePageCollision);

    // A primeira página tinha sido mapeada e deve ter sido desfeita
    match pm.virt2pte(base, false) {
        Ok(pte) => {
            if unsafe { *pte } & PTE_PRESENT != 0 {
                crate::kerror!("(VMM) rollback deixou a primeira pagina mapeada");
                ok = false;
            }
        }
        Err(_) => {}
    }

    unsafe { *entry &= !PTE_LARGE };
    pmm::pmm_free(frames, 2);
    pm.destroy_tables();

    if ok {
        TestResult::Passed
    } else {
        TestResult::Failed
    }
}

/// PTE_NX só tem efeito com EFER.NXE aceso; o cpu_init precisa ter ligado
/// o bit em vez de herdar o que o bootloader deixou.
fn test_nx_enabled() -> TestResult {
    let efer = unsafe { Cpu::read_msr(MSR_EFER) };
    if efer & (1 << 11) != 0 {
        TestResult::Passed
    } else {
        crate::kerror!("(VMM) EFER.NXE desligado: mapeamentos NX nao valem");
        TestResult::Failed
    }
}
