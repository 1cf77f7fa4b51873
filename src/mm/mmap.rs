//! Ranges de memória mapeada por processo.
//!
//! Modelo de duas camadas:
//! - `MmapRangeGlobal` é o dono das páginas físicas. Ele registra cada
//!   página num *shadow pagemap* (nunca carregado em CR3, serve só de
//!   índice frame-por-página) e mantém a lista de ranges locais que o
//!   compartilham. Quando o último local morre, o `Drop` devolve todos os
//!   frames ao PMM e desmonta as tabelas do shadow.
//! - `MmapRangeLocal` é a visão de UM pagemap sobre um pedaço do global:
//!   base, tamanho, offset, proteção. `munmap` opera sobre locais; o
//!   global só morre por contagem de referência (`Arc`).
//!
//! Mapeamentos são ansiosos: `mmap_map_range` aloca e mapeia todas as
//! páginas na hora, lendo do resource quando o range não é anônimo.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::fs::resource::Resource;
use crate::klib::align::{align_down, align_up};
use crate::mm::addr::phys_to_virt;
use crate::mm::config::PAGE_SIZE;
use crate::mm::pmm;
use crate::mm::vmm::{Pagemap, PTE_ADDR_MASK, PTE_NX, PTE_PRESENT, PTE_USER, PTE_WRITABLE};
use crate::sync::spinlock::Spinlock;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        const PRIVATE = 1 << 0;
        const SHARED = 1 << 1;
        const FIXED = 1 << 2;
        const ANONYMOUS = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    InvalidArgs,
    NoSuchRange,
    MapFailure,
}

/// Lado compartilhado de um mapeamento. Dono das páginas físicas.
pub struct MmapRangeGlobal {
    /// Índice frame-por-página; nunca vai para CR3
    pub shadow: Pagemap,
    /// Locais vivos apontando para este global
    pub locals: Spinlock<Vec<*mut MmapRangeLocal>>,
    pub resource: Option<Arc<dyn Resource>>,
    /// Span virtual coberto (o shadow indexa por estes endereços)
    pub base: u64,
    pub length: u64,
    pub offset: u64,
}

unsafe impl Send for MmapRangeGlobal {}
unsafe impl Sync for MmapRangeGlobal {}

/// Visão de um pagemap sobre (parte de) um global.
pub struct MmapRangeLocal {
    pub pagemap: *const Pagemap,
    pub global: Arc<MmapRangeGlobal>,
    pub base: u64,
    pub length: u64,
    pub offset: u64,
    pub prot: MmapProt,
    pub flags: MmapFlags,
}

impl Drop for MmapRangeGlobal {
    /// Devolve ao PMM cada frame registrado no shadow e desmonta as
    /// tabelas. Roda quando o último `Arc` (último local) morre.
    fn drop(&mut self) {
        let mut page = self.base;
        while page < self.base + self.length {
            if let Ok(phys) = self.shadow.virt2phys(page) {
                pmm::pmm_free(align_down(phys, PAGE_SIZE), 1);
            }
            page += PAGE_SIZE;
        }
        self.shadow.destroy_tables();
    }
}

fn pte_flags_for(prot: MmapProt) -> u64 {
    let mut flags = PTE_PRESENT | PTE_USER;
    if prot.contains(MmapProt::WRITE) {
        flags |= PTE_WRITABLE;
    }
    if !prot.contains(MmapProt::EXEC) {
        flags |= PTE_NX;
    }
    flags
}

/// Registra `phys` como a página de `virt` no global e a mapeia em todos
/// os pagemaps que têm um local cobrindo `virt`.
pub fn mmap_map_page_in_range(
    global: &MmapRangeGlobal,
    virt: u64,
    phys: u64,
    prot: MmapProt,
) -> Result<(), MmapError> {
    let flags = pte_flags_for(prot);

    global
        .shadow
        .map_page(virt, phys, flags)
        .map_err(|_| MmapError::MapFailure)?;

    let locals = global.locals.lock();
    for &local in locals.iter() {
        let local = unsafe { &*local };
        if virt < local.base || virt >= local.base + local.length {
            continue;
        }
        let pagemap = unsafe { &*local.pagemap };
        pagemap
            .map_page(virt, phys, flags)
            .map_err(|_| MmapError::MapFailure)?;
    }
    Ok(())
}

/// Cria um range novo em `pagemap`, com todas as páginas alocadas e
/// mapeadas imediatamente.
///
/// `virt`/`length` são alinhados a página para fora. Para ranges não
/// anônimos o conteúdo inicial vem de `resource` a partir de `offset`.
pub fn mmap_map_range(
    pagemap: &Pagemap,
    virt: u64,
    length: u64,
    prot: MmapProt,
    flags: MmapFlags,
    resource: Option<Arc<dyn Resource>>,
    offset: u64,
) -> Result<u64, MmapError> {
    if length == 0 {
        return Err(MmapError::InvalidArgs);
    }
    if !flags.contains(MmapFlags::ANONYMOUS) && resource.is_none() {
        return Err(MmapError::InvalidArgs);
    }

    let base = align_down(virt, PAGE_SIZE);
    let length = align_up(virt + length, PAGE_SIZE) - base;

    let global = Arc::new(MmapRangeGlobal {
        shadow: Pagemap::new_user(),
        locals: Spinlock::new(Vec::new()),
        resource: resource.clone(),
        base,
        length,
        offset,
    });

    let local = Box::into_raw(Box::new(MmapRangeLocal {
        pagemap: pagemap as *const Pagemap,
        global: global.clone(),
        base,
        length,
        offset,
        prot,
        flags,
    }));

    global.locals.lock().push(local);
    pagemap.mmap_ranges.lock().push(local);

    // População ansiosa, página a página
    let mut page = base;
    while page < base + length {
        let phys = pmm::pmm_alloc(1);

        if let Some(res) = resource.as_ref() {
            let buf = unsafe {
                core::slice::from_raw_parts_mut(phys_to_virt(phys) as *mut u8, PAGE_SIZE as usize)
            };
            let file_off = offset + (page - base);
            if res.read(buf, file_off) < 0 {
                pmm::pmm_free(phys, 1);
                let _ = munmap(pagemap, base, length);
                return Err(MmapError::MapFailure);
            }
        }

        if mmap_map_page_in_range(&global, page, phys, prot).is_err() {
            pmm::pmm_free(phys, 1);
            let _ = munmap(pagemap, base, length);
            return Err(MmapError::MapFailure);
        }
        page += PAGE_SIZE;
    }

    Ok(base)
}

/// Local de `pagemap` que contém `addr`, se existir.
pub fn addr2range(pagemap: &Pagemap, addr: u64) -> Option<*mut MmapRangeLocal> {
    let ranges = pagemap.mmap_ranges.lock();
    for &local in ranges.iter() {
        let r = unsafe { &*local };
        if addr >= r.base && addr < r.base + r.length {
            return Some(local);
        }
    }
    None
}

fn remove_from_list(list: &Spinlock<Vec<*mut MmapRangeLocal>>, local: *mut MmapRangeLocal) {
    let mut list = list.lock();
    if let Some(pos) = list.iter().position(|&p| p == local) {
        list.swap_remove(pos);
    }
}

/// Remove `[addr, addr + length)` do pagemap.
///
/// Um local atingido pode ser destruído por inteiro, aparado numa borda ou
/// partido em dois (o pedaço de cima vira um local novo apontando para o
/// MESMO global). Os frames físicos só voltam ao PMM quando o global
/// inteiro morre.
pub fn munmap(pagemap: &Pagemap, addr: u64, length: u64) -> Result<(), MmapError> {
    if length == 0 {
        return Err(MmapError::InvalidArgs);
    }

    let start = align_down(addr, PAGE_SIZE);
    let end = align_up(addr + length, PAGE_SIZE);

    // O lock da lista fica preso durante a cirurgia inteira: fork e
    // populate leem base/length dos locais sob o mesmo lock, então aparar
    // ou partir um local fora dele seria uma corrida. Ordem de aquisição:
    // sempre mmap_ranges antes de global.locals.
    let mut ranges = pagemap.mmap_ranges.lock();

    let mut page = start;
    while page < end {
        let Some(pos) = ranges.iter().position(|&p| {
            let r = unsafe { &*p };
            page >= r.base && page < r.base + r.length
        }) else {
            page += PAGE_SIZE;
            continue;
        };
        let local_ptr = ranges[pos];
        let local = unsafe { &mut *local_ptr };

        // Interseção do pedido com este local
        let snip_start = page.max(local.base);
        let snip_end = end.min(local.base + local.length);

        // Desfazer os mapeamentos deste pagemap primeiro
        let mut p = snip_start;
        while p < snip_end {
            let _ = unsafe { &*local.pagemap }.unmap_page(p);
            p += PAGE_SIZE;
        }

        let cuts_head = snip_start == local.base;
        let cuts_tail = snip_end == local.base + local.length;

        match (cuts_head, cuts_tail) {
            (true, true) => {
                // Cobriu o local inteiro
                ranges.swap_remove(pos);
                remove_from_list(&local.global.locals, local_ptr);
                drop(unsafe { Box::from_raw(local_ptr) });
            }
            (true, false) => {
                let delta = snip_end - local.base;
                local.base = snip_end;
                local.offset += delta;
                local.length -= delta;
            }
            (false, true) => {
                local.length = snip_start - local.base;
            }
            (false, false) => {
                // Buraco no meio: o pedaço de cima vira local novo
                let upper = Box::into_raw(Box::new(MmapRangeLocal {
                    pagemap: local.pagemap,
                    global: local.global.clone(),
                    base: snip_end,
                    length: local.base + local.length - snip_end,
                    offset: local.offset + (snip_end - local.base),
                    prot: local.prot,
                    flags: local.flags,
                }));
                local.global.locals.lock().push(upper);
                ranges.push(upper);

                local.length = snip_start - local.base;
            }
        }

        page = snip_end;
    }

    Ok(())
}

/// Duplica os ranges de `old` em `new` durante um fork.
///
/// - `SHARED`: o filho entra na lista de locais do MESMO global e as PTEs
///   são copiadas literalmente (mesmos frames).
/// - `PRIVATE | ANONYMOUS`: cópia ansiosa — global novo, frames novos, o
///   conteúdo presente é duplicado página a página.
/// - `PRIVATE` com resource ainda não tem semântica definida aqui.
pub fn mmap_fork_pagemap(old: &Pagemap, new: &Pagemap) -> Result<(), MmapError> {
    let old_ranges = old.mmap_ranges.lock();

    for &old_local_ptr in old_ranges.iter() {
        let old_local = unsafe { &*old_local_ptr };

        if old_local.flags.contains(MmapFlags::SHARED) {
            let child = Box::into_raw(Box::new(MmapRangeLocal {
                pagemap: new as *const Pagemap,
                global: old_local.global.clone(),
                base: old_local.base,
                length: old_local.length,
                offset: old_local.offset,
                prot: old_local.prot,
                flags: old_local.flags,
            }));
            old_local.global.locals.lock().push(child);
            new.mmap_ranges.lock().push(child);

            // Mesmos frames: PTE copiada palavra por palavra
            let mut page = old_local.base;
            while page < old_local.base + old_local.length {
                if let Ok(pte) = old.virt2pte(page, false) {
                    let entry = unsafe { *pte };
                    if entry & PTE_PRESENT != 0 {
                        let dest = new
                            .virt2pte(page, true)
                            .map_err(|_| MmapError::MapFailure)?;
                        unsafe { *dest = entry };
                    }
                }
                page += PAGE_SIZE;
            }
        } else if old_local.flags.contains(MmapFlags::ANONYMOUS) {
            let global = Arc::new(MmapRangeGlobal {
                shadow: Pagemap::new_user(),
                locals: Spinlock::new(Vec::new()),
                resource: None,
                base: old_local.base,
                length: old_local.length,
                offset: old_local.offset,
            });

            let child = Box::into_raw(Box::new(MmapRangeLocal {
                pagemap: new as *const Pagemap,
                global: global.clone(),
                base: old_local.base,
                length: old_local.length,
                offset: old_local.offset,
                prot: old_local.prot,
                flags: old_local.flags,
            }));
            global.locals.lock().push(child);
            new.mmap_ranges.lock().push(child);

            // Cópia ansiosa do conteúdo presente
            let mut page = old_local.base;
            while page < old_local.base + old_local.length {
                if let Ok(pte) = old.virt2pte(page, false) {
                    let entry = unsafe { *pte };
                    if entry & PTE_PRESENT != 0 {
                        let new_phys = pmm::pmm_alloc(1);
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                phys_to_virt(entry & PTE_ADDR_MASK) as *const u8,
                                phys_to_virt(new_phys) as *mut u8,
                                PAGE_SIZE as usize,
                            );
                        }
                        mmap_map_page_in_range(&global, page, new_phys, old_local.prot)?;
                    }
                }
                page += PAGE_SIZE;
            }
        } else {
            panic!("fork de mapeamento privado com resource nao suportado");
        }
    }

    Ok(())
}

/// Destrói todos os ranges de um pagemap (morte de processo).
pub fn mmap_cleanup_pagemap(pagemap: &Pagemap) {
    loop {
        let local_ptr = {
            let ranges = pagemap.mmap_ranges.lock();
            match ranges.first() {
                Some(&p) => p,
                None => break,
            }
        };
        let (base, length) = {
            let local = unsafe { &*local_ptr };
            (local.base, local.length)
        };
        let _ = munmap(pagemap, base, length);
    }
}
