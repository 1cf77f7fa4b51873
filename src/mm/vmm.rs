//! Virtual Memory Manager: page tables de 4 níveis (PML4).
//!
//! Todo `Pagemap` compartilha a metade alta com o kernel: as entradas
//! 256..512 do PML4 são copiadas do pagemap do kernel na criação, então um
//! mapeamento de kernel feito depois do boot aparece em todos os espaços de
//! endereçamento automaticamente (as tabelas de nível inferior são as mesmas).
//!
//! Só páginas de 4 KiB; encontrar uma entrada de página grande no caminho
//! de um walk é erro do chamador.

use alloc::vec::Vec;

use spin::Once;

use crate::arch::x86_64::cpu::Cpu;
use crate::core::boot::handoff::{BootInfo, MemoryType};
use crate::klib::align::{align_down, div_roundup};
use crate::mm::addr::phys_to_virt;
use crate::mm::config::PAGE_SIZE;
use crate::mm::mmap::MmapRangeLocal;
use crate::mm::pmm;
use crate::sync::spinlock::Spinlock;

// --- Bits de entrada de page table ---
pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITABLE: u64 = 1 << 1;
pub const PTE_USER: u64 = 1 << 2;
pub const PTE_LARGE: u64 = 1 << 7;
pub const PTE_NX: u64 = 1 << 63;
pub const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
pub const PTE_FLAGS_MASK: u64 = !PTE_ADDR_MASK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// O walk encontrou uma entrada de página grande no meio do caminho
    HugePageCollision,
    /// Nenhum mapeamento existe para o endereço
    NotMapped,
}

/// Um espaço de endereçamento.
pub struct Pagemap {
    /// Endereço físico do PML4
    pub top_level: u64,
    /// Ranges de mmap deste espaço (donos: ver `mm::mmap`)
    pub mmap_ranges: Spinlock<Vec<*mut MmapRangeLocal>>,
}

unsafe impl Send for Pagemap {}
unsafe impl Sync for Pagemap {}

static KERNEL_PAGEMAP: Once<Pagemap> = Once::new();

/// Pagemap do kernel, disponível depois do `vmm_init`.
pub fn kernel_pagemap() -> &'static Pagemap {
    KERNEL_PAGEMAP.get().expect("vmm_init nao rodou")
}

#[inline]
fn pml_index(virt: u64, shift: u32) -> usize {
    ((virt >> shift) & 0x1FF) as usize
}

impl Pagemap {
    /// Pagemap vazio (só a metade alta do kernel copiada).
    pub fn new_user() -> Self {
        let top_level = pmm::pmm_alloc(1);

        let kernel_top = phys_to_virt(kernel_pagemap().top_level) as *const u64;
        let new_top = phys_to_virt(top_level) as *mut u64;
        for i in 256..512 {
            unsafe { *new_top.add(i) = *kernel_top.add(i) };
        }

        Self {
            top_level,
            mmap_ranges: Spinlock::new(Vec::new()),
        }
    }

    /// Desce um nível da árvore, alocando a tabela seguinte se pedido.
    /// Devolve o endereço FÍSICO do próximo nível.
    fn get_next_level(
        &self,
        current_phys: u64,
        index: usize,
        allocate: bool,
    ) -> Result<u64, VmmError> {
        let entry_ptr = (phys_to_virt(current_phys) as *mut u64).wrapping_add(index);
        let entry = unsafe { *entry_ptr };

        if entry & PTE_PRESENT != 0 {
            if entry & PTE_LARGE != 0 {
                return Err(VmmError::HugePageCollision);
            }
            return Ok(entry & PTE_ADDR_MASK);
        }

        if !allocate {
            return Err(VmmError::NotMapped);
        }

        // Níveis intermediários ficam com o máximo de permissão; a word
        // final (PTE) é quem restringe
        let table = pmm::pmm_alloc(1);
        unsafe { *entry_ptr = table | PTE_PRESENT | PTE_WRITABLE | PTE_USER };
        Ok(table)
    }

    /// Ponteiro (no HHDM) para a PTE de `virt`.
    pub fn virt2pte(&self, virt: u64, allocate: bool) -> Result<*mut u64, VmmError> {
        let pml3 = self.get_next_level(self.top_level, pml_index(virt, 39), allocate)?;
        let pml2 = self.get_next_level(pml3, pml_index(virt, 30), allocate)?;
        let pml1 = self.get_next_level(pml2, pml_index(virt, 21), allocate)?;

        let pte = (phys_to_virt(pml1) as *mut u64).wrapping_add(pml_index(virt, 12));
        Ok(pte)
    }

    /// Mapeia `virt` → `phys` com `flags`. Sobrescreve mapeamento existente.
    pub fn map_page(&self, virt: u64, phys: u64, flags: u64) -> Result<(), VmmError> {
        debug_assert!(virt % PAGE_SIZE == 0 && phys % PAGE_SIZE == 0);

        let pte = self.virt2pte(virt, true)?;
        unsafe { *pte = phys | flags };

        if self.is_active() {
            unsafe { Cpu::invlpg(virt) };
        }
        Ok(())
    }

    /// Mapeia `count` páginas contíguas. Transacional: se alguma página
    /// falhar, as já mapeadas nesta chamada são desfeitas antes do erro
    /// ser devolvido.
    pub fn map_contiguous_pages(
        &self,
        virt: u64,
        phys: u64,
        count: u64,
        flags: u64,
    ) -> Result<(), VmmError> {
        for i in 0..count {
            if let Err(err) = self.map_page(virt + i * PAGE_SIZE, phys + i * PAGE_SIZE, flags) {
                for j in 0..i {
                    let _ = self.unmap_page(virt + j * PAGE_SIZE);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Remove o mapeamento de `virt`. Não libera a página física.
    pub fn unmap_page(&self, virt: u64) -> Result<(), VmmError> {
        let pte = self.virt2pte(virt, false)?;
        unsafe { *pte = 0 };

        if self.is_active() {
            unsafe { Cpu::invlpg(virt) };
        }
        Ok(())
    }

    /// Troca só os flags de um mapeamento existente, mantendo o frame.
    pub fn flag_page(&self, virt: u64, flags: u64) -> Result<(), VmmError> {
        let pte = self.virt2pte(virt, false)?;
        unsafe {
            let entry = *pte;
            if entry & PTE_PRESENT == 0 {
                return Err(VmmError::NotMapped);
            }
            *pte = (entry & PTE_ADDR_MASK) | flags;
        }

        if self.is_active() {
            unsafe { Cpu::invlpg(virt) };
        }
        Ok(())
    }

    /// Endereço físico mapeado em `virt`, se houver.
    pub fn virt2phys(&self, virt: u64) -> Result<u64, VmmError> {
        let pte = self.virt2pte(align_down(virt, PAGE_SIZE), false)?;
        let entry = unsafe { *pte };
        if entry & PTE_PRESENT == 0 {
            return Err(VmmError::NotMapped);
        }
        Ok((entry & PTE_ADDR_MASK) | (virt % PAGE_SIZE))
    }

    /// Carrega este pagemap no CR3 da CPU atual.
    pub fn switch_to(&self) {
        unsafe { Cpu::write_cr3(self.top_level) };
    }

    /// Este pagemap é o ativo na CPU atual?
    #[inline]
    pub fn is_active(&self) -> bool {
        Cpu::read_cr3() & PTE_ADDR_MASK == self.top_level
    }

    /// Libera as page tables da metade baixa deste pagemap.
    ///
    /// As páginas FOLHA não são tocadas: elas pertencem aos ranges de mmap
    /// (via shadow pagemap) ou a outros donos. A metade alta é compartilhada
    /// com o kernel e nunca é liberada.
    pub fn destroy_tables(&self) {
        fn destroy_level(table_phys: u64, level: u8) {
            // level 1 = PML1: as entradas são folhas, nada a recursar
            if level > 1 {
                let table = phys_to_virt(table_phys) as *const u64;
                for i in 0..512 {
                    let entry = unsafe { *table.add(i) };
                    if entry & PTE_PRESENT != 0 && entry & PTE_LARGE == 0 {
                        destroy_level(entry & PTE_ADDR_MASK, level - 1);
                    }
                }
            }
            pmm::pmm_free(table_phys, 1);
        }

        let top = phys_to_virt(self.top_level) as *const u64;
        for i in 0..256 {
            let entry = unsafe { *top.add(i) };
            if entry & PTE_PRESENT != 0 {
                destroy_level(entry & PTE_ADDR_MASK, 3);
            }
        }
        pmm::pmm_free(self.top_level, 1);
    }
}

/// Monta o pagemap do kernel e o ativa na BSP.
///
/// Mapeia no HHDM todas as regiões do mapa de memória (menos BadMemory),
/// o binário do kernel na janela alta e a página de MMIO do LAPIC.
pub fn vmm_init(boot_info: &BootInfo) {
    let pagemap = KERNEL_PAGEMAP.call_once(|| Pagemap {
        top_level: pmm::pmm_alloc(1),
        mmap_ranges: Spinlock::new(Vec::new()),
    });

    // Metade alta pré-populada por inteiro: `new_user` copia estas entradas
    // do PML4, então todas as 256 precisam existir antes do primeiro
    // pagemap filho para que mapeamentos de kernel feitos depois apareçam
    // em todos os espaços de endereçamento.
    for index in 256..512 {
        pagemap
            .get_next_level(pagemap.top_level, index, true)
            .expect("pre-populacao da metade alta do PML4");
    }

    let mut mapped_pages: u64 = 0;
    for region in boot_info.memory_map.iter() {
        if region.kind == MemoryType::BadMemory {
            continue;
        }

        let first = align_down(region.start, PAGE_SIZE);
        let last = region.start + region.size;
        let count = div_roundup(last - first, PAGE_SIZE);

        // No HHDM tudo é dado: o código do kernel executa pela janela alta
        pagemap
            .map_contiguous_pages(
                phys_to_virt(first),
                first,
                count,
                PTE_PRESENT | PTE_WRITABLE | PTE_NX,
            )
            .expect("falha mapeando regiao no HHDM");
        mapped_pages += count;
    }

    // Binário do kernel na janela em que o linker o colocou
    let kernel_pages = div_roundup(
        boot_info
            .memory_map
            .iter()
            .filter(|r| r.kind == MemoryType::KernelAndModules)
            .map(|r| r.size)
            .sum::<u64>()
            .max(PAGE_SIZE),
        PAGE_SIZE,
    );
    pagemap
        .map_contiguous_pages(
            boot_info.kernel_virt_base,
            boot_info.kernel_phys_base,
            kernel_pages,
            PTE_PRESENT | PTE_WRITABLE,
        )
        .expect("falha mapeando o kernel");

    // MMIO do LAPIC (fica fora do mapa de memória)
    let lapic_phys = crate::arch::x86_64::apic::lapic::mmio_phys_base();
    pagemap
        .map_page(phys_to_virt(lapic_phys), lapic_phys, PTE_PRESENT | PTE_WRITABLE | PTE_NX)
        .expect("falha mapeando o LAPIC");

    pagemap.switch_to();

    crate::kinfo!(
        "(VMM) Pagemap do kernel ativo, {} paginas no HHDM",
        mapped_pages
    );
}
