//! Conversões entre endereços físicos e o mapeamento direto (HHDM).

use crate::mm::config::HIGHER_HALF;

/// Endereço virtual (no mapeamento direto) de um endereço físico.
#[inline]
pub const fn phys_to_virt(phys: u64) -> u64 {
    phys + HIGHER_HALF
}

/// Inverso de `phys_to_virt`. Só vale para endereços dentro do HHDM.
#[inline]
pub const fn virt_to_phys(virt: u64) -> u64 {
    debug_assert!(is_higher_half(virt));
    virt - HIGHER_HALF
}

/// Endereço está na metade alta (kernel)?
#[inline]
pub const fn is_higher_half(virt: u64) -> bool {
    virt >= HIGHER_HALF
}
