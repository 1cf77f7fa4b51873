//! Physical Memory Manager.
//!
//! Bitmap de frames com alocação next-fit: um bit por página de 4 KiB,
//! cursor (`last_used_index`) que continua de onde a última alocação parou
//! e faz uma volta completa antes de declarar OOM.
//!
//! O próprio bitmap mora na primeira região `Usable` grande o bastante,
//! acessado pelo mapeamento direto (HHDM). Exaustão de memória física é
//! irrecuperável no kernel: `pmm_alloc` dá panic em vez de devolver erro.

use crate::core::boot::handoff::{BootInfo, MemoryType};
use crate::klib::align::div_roundup;
use crate::mm::addr::phys_to_virt;
use crate::mm::config::PAGE_SIZE;
use crate::sync::spinlock::Spinlock;

pub struct BitmapAllocator {
    bitmap: *mut u8,
    /// Número de páginas cobertas pelo bitmap
    highest_page: u64,
    /// Cursor next-fit: índice da próxima página candidata
    last_used_index: u64,
    used_pages: u64,
    usable_pages: u64,
}

unsafe impl Send for BitmapAllocator {}

static PMM: Spinlock<BitmapAllocator> = Spinlock::new(BitmapAllocator {
    bitmap: core::ptr::null_mut(),
    highest_page: 0,
    last_used_index: 0,
    used_pages: 0,
    usable_pages: 0,
});

impl BitmapAllocator {
    #[inline]
    fn bit_test(&self, index: u64) -> bool {
        unsafe { (*self.bitmap.add((index / 8) as usize) >> (index % 8)) & 1 != 0 }
    }

    #[inline]
    fn bit_set(&mut self, index: u64) {
        unsafe { *self.bitmap.add((index / 8) as usize) |= 1 << (index % 8) };
    }

    #[inline]
    fn bit_clear(&mut self, index: u64) {
        unsafe { *self.bitmap.add((index / 8) as usize) &= !(1 << (index % 8)) };
    }

    /// Procura `count` páginas contíguas no intervalo `[last_used_index, limit)`.
    ///
    /// Marca EXATAMENTE as páginas devolvidas como ocupadas e deixa o cursor
    /// logo depois delas. `None` = nada encontrado até `limit`.
    fn inner_alloc(&mut self, count: u64, limit: u64) -> Option<u64> {
        let mut run: u64 = 0;

        while self.last_used_index < limit {
            if self.bit_test(self.last_used_index) {
                self.last_used_index += 1;
                run = 0;
                continue;
            }

            self.last_used_index += 1;
            run += 1;

            if run == count {
                let page = self.last_used_index - count;
                for i in page..self.last_used_index {
                    self.bit_set(i);
                }
                return Some(page * PAGE_SIZE);
            }
        }

        None
    }
}

/// Inicializa o PMM a partir do mapa de memória do bootloader.
pub fn pmm_init(boot_info: &BootInfo) {
    let mut pmm = PMM.lock();

    // Cópia local do mapa: vamos encolher a região que hospeda o bitmap
    let mut regions = boot_info.memory_map.regions;
    let count = boot_info.memory_map.count;

    // 1. Página mais alta endereçável por alguma região Usable
    let mut highest_addr: u64 = 0;
    for region in &regions[..count] {
        if region.kind == MemoryType::Usable {
            highest_addr = highest_addr.max(region.start + region.size);
        }
    }
    assert!(highest_addr > 0, "mapa de memoria sem regioes Usable");

    pmm.highest_page = highest_addr / PAGE_SIZE;
    let bitmap_bytes = div_roundup(pmm.highest_page, 8);
    let bitmap_pages = div_roundup(bitmap_bytes, PAGE_SIZE);
    let bitmap_size = bitmap_pages * PAGE_SIZE;

    // 2. Hospedar o bitmap na primeira região Usable que caiba nele,
    //    recortando essas páginas da própria região
    let mut hosted = false;
    for region in regions[..count].iter_mut() {
        if region.kind == MemoryType::Usable && region.size >= bitmap_size {
            pmm.bitmap = phys_to_virt(region.start) as *mut u8;
            region.start += bitmap_size;
            region.size -= bitmap_size;
            hosted = true;
            break;
        }
    }
    assert!(hosted, "nenhuma regiao Usable comporta o bitmap do PMM");

    // 3. Tudo começa ocupado; só o que é Usable vira livre
    unsafe { core::ptr::write_bytes(pmm.bitmap, 0xFF, bitmap_size as usize) };

    let mut usable: u64 = 0;
    for region in &regions[..count] {
        if region.kind != MemoryType::Usable {
            continue;
        }
        let first = div_roundup(region.start, PAGE_SIZE);
        let last = (region.start + region.size) / PAGE_SIZE;
        for page in first..last {
            pmm.bit_clear(page);
            usable += 1;
        }
    }

    pmm.usable_pages = usable;
    pmm.used_pages = 0;

    crate::kinfo!(
        "(PMM) {} MiB utilizaveis, bitmap de {} KiB cobrindo {} paginas",
        usable * PAGE_SIZE / (1024 * 1024),
        bitmap_size / 1024,
        pmm.highest_page
    );
}

/// Aloca `count` páginas físicas contíguas SEM zerar.
///
/// Nunca devolve erro: esgotar memória física derruba o kernel.
pub fn pmm_alloc_nozero(count: u64) -> u64 {
    debug_assert!(count > 0);
    let mut pmm = PMM.lock();

    let cursor = pmm.last_used_index;
    let limit = pmm.highest_page;

    let page = pmm.inner_alloc(count, limit).or_else(|| {
        // Uma volta: recomeçar do zero até onde o cursor estava
        pmm.last_used_index = 0;
        pmm.inner_alloc(count, cursor)
    });

    match page {
        Some(phys) => {
            pmm.used_pages += count;
            phys
        }
        None => panic!("Kernel OOM"),
    }
}

/// Aloca `count` páginas físicas contíguas, zeradas.
pub fn pmm_alloc(count: u64) -> u64 {
    let phys = pmm_alloc_nozero(count);
    unsafe {
        core::ptr::write_bytes(
            phys_to_virt(phys) as *mut u8,
            0,
            (count * PAGE_SIZE) as usize,
        );
    }
    phys
}

/// Devolve `count` páginas a partir do endereço físico `phys`.
pub fn pmm_free(phys: u64, count: u64) {
    debug_assert!(phys % PAGE_SIZE == 0);
    let mut pmm = PMM.lock();

    let page = phys / PAGE_SIZE;
    for i in page..page + count {
        debug_assert!(pmm.bit_test(i), "double free de frame fisico");
        pmm.bit_clear(i);
    }
    pmm.used_pages -= count;
}

/// Páginas atualmente livres (instantâneo, só para diagnóstico e testes).
pub fn pmm_free_pages() -> u64 {
    let pmm = PMM.lock();
    pmm.usable_pages - pmm.used_pages
}

/// Empurra o cursor next-fit para o fim do bitmap e devolve o índice limite
/// (usado pelos self-tests de wraparound).
#[cfg(feature = "self_test")]
pub fn pmm_cursor_to_end() -> u64 {
    let mut pmm = PMM.lock();
    pmm.last_used_index = pmm.highest_page;
    pmm.highest_page
}

/// Posição atual do cursor next-fit (usado pelos self-tests).
#[cfg(feature = "self_test")]
pub fn pmm_cursor() -> u64 {
    PMM.lock().last_used_index
}
