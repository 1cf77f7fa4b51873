//! Slab allocator do kernel.
//!
//! Dez classes de tamanho fixo (8 a 1024 bytes). Cada página de slab começa
//! com um cabeçalho de 8 bytes contendo o índice da classe; as células
//! livres formam uma lista encadeada escrita dentro das próprias células.
//! A partir do cabeçalho, `free` recupera a classe de qualquer ponteiro sem
//! precisar do tamanho.
//!
//! Alocações maiores que a última classe vão direto ao PMM: `pages + 1`
//! páginas, com a primeira guardando `(pages, size)` como metadado e o
//! ponteiro devolvido apontando para a página seguinte. Por isso um ponteiro
//! alinhado a página é sempre do caminho grande.

use crate::klib::align::{align_down, div_roundup};
use crate::mm::addr::{phys_to_virt, virt_to_phys};
use crate::mm::config::PAGE_SIZE;
use crate::mm::pmm;
use crate::sync::spinlock::Spinlock;

/// Classes de tamanho, em bytes. Ordenadas; a busca é linear.
pub const SLAB_SIZES: [u64; 10] = [8, 16, 24, 32, 48, 64, 128, 256, 512, 1024];

struct Slab {
    entry_size: u64,
    /// Endereço virtual da primeira célula livre (0 = preciso crescer)
    first_free: u64,
}

struct SlabPool {
    slabs: [Slab; SLAB_SIZES.len()],
}

static POOL: Spinlock<SlabPool> = Spinlock::new(SlabPool {
    slabs: [
        Slab { entry_size: 8, first_free: 0 },
        Slab { entry_size: 16, first_free: 0 },
        Slab { entry_size: 24, first_free: 0 },
        Slab { entry_size: 32, first_free: 0 },
        Slab { entry_size: 48, first_free: 0 },
        Slab { entry_size: 64, first_free: 0 },
        Slab { entry_size: 128, first_free: 0 },
        Slab { entry_size: 256, first_free: 0 },
        Slab { entry_size: 512, first_free: 0 },
        Slab { entry_size: 1024, first_free: 0 },
    ],
});

impl Slab {
    /// Adiciona uma página nova a esta classe e encadeia as células.
    fn grow(&mut self, class_index: usize) {
        let page_virt = phys_to_virt(pmm::pmm_alloc(1));

        // Cabeçalho de 8 bytes no início da página; as células começam no
        // primeiro múltiplo de entry_size depois dele, que é a própria
        // entry_size (toda classe tem pelo menos 8 bytes)
        unsafe { *(page_virt as *mut u64) = class_index as u64 };
        let offset = self.entry_size;

        let count = (PAGE_SIZE - offset) / self.entry_size;
        let base = page_virt + offset;
        for i in 0..count {
            let cell = base + i * self.entry_size;
            let next = if i + 1 < count { cell + self.entry_size } else { 0 };
            unsafe { *(cell as *mut u64) = next };
        }

        self.first_free = base;
    }
}

/// Menor classe que serve `size` bytes com alinhamento `align`.
fn class_for(size: u64, align: u64) -> Option<usize> {
    SLAB_SIZES
        .iter()
        .position(|&s| s >= size && s % align == 0)
}

/// Aloca `size` bytes com alinhamento `align` (potência de 2, <= 4096).
pub fn alloc(size: u64, align: u64) -> *mut u8 {
    debug_assert!(align.is_power_of_two() && align <= PAGE_SIZE);

    match class_for(size, align) {
        Some(index) => {
            let mut pool = POOL.lock();
            let slab = &mut pool.slabs[index];

            if slab.first_free == 0 {
                slab.grow(index);
            }

            let cell = slab.first_free;
            slab.first_free = unsafe { *(cell as *const u64) };
            cell as *mut u8
        }
        None => big_alloc(size),
    }
}

/// Caminho grande: `pages + 1` páginas do PMM, metadado na primeira.
fn big_alloc(size: u64) -> *mut u8 {
    let pages = div_roundup(size, PAGE_SIZE);
    let virt = phys_to_virt(pmm::pmm_alloc(pages + 1));

    unsafe {
        let meta = virt as *mut u64;
        *meta = pages;
        *meta.add(1) = size;
    }

    (virt + PAGE_SIZE) as *mut u8
}

/// Libera um ponteiro vindo de `alloc`.
pub fn free(ptr: *mut u8) {
    let addr = ptr as u64;
    if addr == 0 {
        return;
    }

    if addr % PAGE_SIZE == 0 {
        // Caminho grande: metadado na página anterior
        let meta_virt = addr - PAGE_SIZE;
        let pages = unsafe { *(meta_virt as *const u64) };
        pmm::pmm_free(virt_to_phys(meta_virt), pages + 1);
        return;
    }

    let header = align_down(addr, PAGE_SIZE);
    let index = unsafe { *(header as *const u64) } as usize;
    debug_assert!(index < SLAB_SIZES.len(), "cabecalho de slab corrompido");

    let mut pool = POOL.lock();
    let slab = &mut pool.slabs[index];
    unsafe { *(addr as *mut u64) = slab.first_free };
    slab.first_free = addr;
}

/// Tamanho utilizável do bloco apontado por `ptr`.
pub fn usable_size(ptr: *mut u8) -> u64 {
    let addr = ptr as u64;
    if addr % PAGE_SIZE == 0 {
        let meta_virt = addr - PAGE_SIZE;
        unsafe { *((meta_virt + 8) as *const u64) }
    } else {
        let header = align_down(addr, PAGE_SIZE);
        let index = unsafe { *(header as *const u64) } as usize;
        SLAB_SIZES[index]
    }
}

/// Realoca `ptr` para `new_size` bytes, preservando o conteúdo.
pub fn realloc(ptr: *mut u8, new_size: u64, align: u64) -> *mut u8 {
    if ptr.is_null() {
        return alloc(new_size, align);
    }

    let old_size = usable_size(ptr);

    // Caminho grande crescendo/encolhendo dentro das mesmas páginas
    if (ptr as u64) % PAGE_SIZE == 0 {
        let meta_virt = ptr as u64 - PAGE_SIZE;
        let pages = unsafe { *(meta_virt as *const u64) };
        if div_roundup(new_size, PAGE_SIZE) == pages {
            unsafe { *((meta_virt + 8) as *mut u64) = new_size };
            return ptr;
        }
    } else if new_size <= old_size {
        return ptr;
    }

    let new_ptr = alloc(new_size, align);
    unsafe {
        core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size) as usize);
    }
    free(ptr);
    new_ptr
}
