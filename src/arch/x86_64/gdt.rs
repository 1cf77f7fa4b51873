//! Global Descriptor Table e Task State Segment.
//!
//! Cada CPU carrega sua própria GDT porque o descritor de TSS aponta para o
//! TSS daquela CPU (stacks de interrupção dedicadas, RSP0 da thread atual).
//! O layout de seletores é fixo e compartilhado:
//!
//! - Index 0: Null
//! - Index 1: Kernel Code
//! - Index 2: Kernel Data
//! - Index 3: User Data  ← SYSRET requer Data antes de Code!
//! - Index 4: User Code  ← SYSRET: CS = Base+16, SS = Base+8
//! - Index 5-6: TSS (descritor de sistema ocupa 2 slots em 64-bit)

use core::mem::size_of;

/// Seletor de segmento
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentSelector(pub u16);

impl SegmentSelector {
    pub const fn new(index: u16, rpl: u8) -> Self {
        Self((index << 3) | (rpl as u16))
    }
}

pub const KERNEL_CODE_SEL: SegmentSelector = SegmentSelector::new(1, 0);
pub const KERNEL_DATA_SEL: SegmentSelector = SegmentSelector::new(2, 0);
pub const USER_DATA_SEL: SegmentSelector = SegmentSelector::new(3, 3);
pub const USER_CODE_SEL: SegmentSelector = SegmentSelector::new(4, 3);
pub const TSS_SEL: SegmentSelector = SegmentSelector::new(5, 0);

/// Task State Segment (64-bit).
///
/// `ist[2]` (IST3) é a stack de page fault da thread atual; `ist[3]` (IST4)
/// é a stack dedicada do vetor de abort usado pelo panic para derrubar as
/// CPUs irmãs mesmo com a stack normal corrompida.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed(4))]
pub struct Tss {
    _reserved0: u32,
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    _reserved1: u64,
    pub ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    pub iopb_offset: u16,
}

impl Tss {
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Tss>() as u16,
        }
    }
}

/// GDT de uma CPU: 5 descritores de segmento + descritor de TSS (2 slots).
#[repr(C, align(16))]
pub struct Gdt {
    entries: [u64; 7],
}

impl Gdt {
    pub const fn new() -> Self {
        Self {
            entries: [
                0,                      // Null
                0x00AF_9B00_0000_FFFF,  // Kernel Code: Present, Ring 0, Exec, Long
                0x00AF_9300_0000_FFFF,  // Kernel Data: Present, Ring 0, Writable
                0x00AF_F300_0000_FFFF,  // User Data: Present, Ring 3, Writable
                0x00AF_FB00_0000_FFFF,  // User Code: Present, Ring 3, Exec, Long
                0,                      // TSS low (preenchido por set_tss)
                0,                      // TSS high
            ],
        }
    }

    /// Instala o descritor do TSS desta CPU nos slots 5/6.
    pub fn set_tss(&mut self, tss: &Tss) {
        let base = tss as *const Tss as u64;
        let limit = (size_of::<Tss>() - 1) as u64;

        let mut low: u64 = 0;
        low |= limit & 0xFFFF;
        low |= (base & 0xFF_FFFF) << 16;
        low |= 0x89 << 40; // Present, tipo "64-bit TSS available"
        low |= ((limit >> 16) & 0xF) << 48;
        low |= ((base >> 24) & 0xFF) << 56;

        self.entries[5] = low;
        self.entries[6] = base >> 32;
    }

    /// Carrega esta GDT (lgdt) e recarrega os registradores de segmento.
    ///
    /// # Safety
    ///
    /// A GDT precisa viver enquanto a CPU a usar (no Brasa ela mora dentro
    /// do `LocalCpu`, que nunca é liberado).
    pub unsafe fn load(&self) {
        let descriptor = GdtDescriptor {
            limit: (size_of::<Gdt>() - 1) as u16,
            base: self as *const Gdt as u64,
        };

        core::arch::asm!(
            "lgdt [{desc}]",
            // Recarregar CS via far return
            "lea {tmp}, [rip + 2f]",
            "push {cs}",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov fs, {ds:x}",
            "mov gs, {ds:x}",
            "mov ss, {ds:x}",
            desc = in(reg) &descriptor,
            tmp = lateout(reg) _,
            cs = in(reg) KERNEL_CODE_SEL.0 as u64,
            ds = in(reg) KERNEL_DATA_SEL.0 as u32,
        );
    }

    /// Carrega o registrador de task (ltr) apontando para o TSS instalado.
    ///
    /// # Safety
    ///
    /// `set_tss` deve ter sido chamado antes, e a GDT já carregada.
    pub unsafe fn load_tss(&self) {
        core::arch::asm!(
            "ltr {sel:x}",
            sel = in(reg) TSS_SEL.0,
            options(nostack, preserves_flags)
        );
    }
}

/// Descritor para LGDT
#[repr(C, packed)]
struct GdtDescriptor {
    limit: u16,
    base: u64,
}
