//! Aritmética de alinhamento usada por PMM/VMM/Mmap.
//!
//! Todas assumem `align` potência de dois (páginas, tamanhos de slab).

/// Arredonda `value` para cima até o próximo múltiplo de `align`.
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Arredonda `value` para baixo até o múltiplo anterior de `align`.
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Divisão com arredondamento para cima.
#[inline]
pub const fn div_roundup(value: u64, div: u64) -> u64 {
    (value + div - 1) / div
}
