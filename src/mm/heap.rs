//! `GlobalAlloc` do kernel sobre o slab allocator.
//!
//! Disponível assim que o PMM sobe; não há região de heap separada, tudo
//! sai do slab (e do PMM no caminho grande).

use core::alloc::{GlobalAlloc, Layout};

use crate::mm::slab;

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        slab::alloc(layout.size() as u64, layout.align() as u64)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        slab::free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        slab::realloc(ptr, new_size as u64, layout.align() as u64)
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("alocacao de kernel falhou: {:?}", layout);
}
