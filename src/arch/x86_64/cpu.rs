//! Primitivas de CPU x86-64.
//!
//! Interrupções, MSRs, CPUID, bases de segmento (FS/GS), CR3/TLB e o
//! contexto de FPU. Tudo aqui é camada fina sobre instruções privilegiadas;
//! política fica nos módulos de cima (smp, sched, mm).

use core::arch::asm;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// --- MSRs usados pelo kernel ---
pub const MSR_EFER: u32 = 0xC000_0080;
pub const MSR_STAR: u32 = 0xC000_0081;
pub const MSR_LSTAR: u32 = 0xC000_0082;
pub const MSR_SFMASK: u32 = 0xC000_0084;
pub const MSR_FS_BASE: u32 = 0xC000_0100;
pub const MSR_GS_BASE: u32 = 0xC000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xC000_0102;
pub const MSR_APIC_BASE: u32 = 0x1B;

// --- Bits de CPUID (leaf 1 ECX / leaf 7 EBX) ---
pub const CPUID_XSAVE: u32 = 1 << 26;
pub const CPUID_AVX: u32 = 1 << 28;
pub const CPUID_AVX512: u32 = 1 << 16;

pub struct Cpu;

impl Cpu {
    #[inline]
    pub fn interrupts_enabled() -> bool {
        let rflags: u64;
        unsafe {
            asm!("pushfq; pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        (rflags & (1 << 9)) != 0
    }

    #[inline]
    pub fn enable_interrupts() {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    #[inline]
    pub fn disable_interrupts() {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    /// Espera a próxima interrupção.
    #[inline]
    pub fn halt() {
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }

    /// Trava esta CPU para sempre (interrupções desabilitadas).
    pub fn hang() -> ! {
        loop {
            unsafe { asm!("cli; hlt", options(nomem, nostack)) };
        }
    }

    #[inline]
    pub unsafe fn read_msr(msr: u32) -> u64 {
        let lo: u32;
        let hi: u32;
        asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags)
        );
        ((hi as u64) << 32) | lo as u64
    }

    #[inline]
    pub unsafe fn write_msr(msr: u32, value: u64) {
        let lo = value as u32;
        let hi = (value >> 32) as u32;
        asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") lo,
            in("edx") hi,
            options(nomem, nostack, preserves_flags)
        );
    }

    /// CPUID com checagem do leaf máximo suportado.
    /// Devolve `None` se o leaf pedido não existe nesta CPU.
    pub fn cpu_id(leaf: u32, subleaf: u32) -> Option<(u32, u32, u32, u32)> {
        let max_leaf: u32;
        unsafe {
            asm!(
                "push rbx",
                "cpuid",
                "pop rbx",
                inout("eax") (leaf & 0x8000_0000) => max_leaf,
                out("ecx") _,
                out("edx") _,
                options(nomem)
            );
        }
        if leaf > max_leaf {
            return None;
        }

        let (a, b, c, d): (u32, u32, u32, u32);
        unsafe {
            asm!(
                "push rbx",
                "cpuid",
                "mov {b:e}, ebx",
                "pop rbx",
                b = out(reg) b,
                inout("eax") leaf => a,
                inout("ecx") subleaf => c,
                out("edx") d,
                options(nomem)
            );
        }
        Some((a, b, c, d))
    }

    // --- Bases de segmento: o scheduler salva/restaura via MSR ---

    #[inline]
    pub unsafe fn set_gs_base(ptr: u64) {
        Self::write_msr(MSR_GS_BASE, ptr);
    }

    #[inline]
    pub unsafe fn get_gs_base() -> u64 {
        Self::read_msr(MSR_GS_BASE)
    }

    #[inline]
    pub unsafe fn set_kernel_gs_base(ptr: u64) {
        Self::write_msr(MSR_KERNEL_GS_BASE, ptr);
    }

    #[inline]
    pub unsafe fn get_kernel_gs_base() -> u64 {
        Self::read_msr(MSR_KERNEL_GS_BASE)
    }

    #[inline]
    pub unsafe fn set_fs_base(ptr: u64) {
        Self::write_msr(MSR_FS_BASE, ptr);
    }

    #[inline]
    pub unsafe fn get_fs_base() -> u64 {
        Self::read_msr(MSR_FS_BASE)
    }

    // --- Registradores de controle ---

    #[inline]
    pub fn read_cr0() -> u64 {
        let cr0: u64;
        unsafe {
            asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        cr0
    }

    #[inline]
    pub unsafe fn write_cr0(value: u64) {
        asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags));
    }

    // --- CR3 / TLB ---

    #[inline]
    pub fn read_cr3() -> u64 {
        let cr3: u64;
        unsafe {
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        cr3
    }

    #[inline]
    pub unsafe fn write_cr3(value: u64) {
        asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
    }

    /// Invalida a entrada de TLB de um endereço virtual nesta CPU.
    #[inline]
    pub unsafe fn invlpg(virt: u64) {
        asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
    }

    #[inline]
    pub fn read_cr4() -> u64 {
        let cr4: u64;
        unsafe {
            asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        cr4
    }

    #[inline]
    pub unsafe fn write_cr4(value: u64) {
        asm!("mov cr4, {}", in(reg) value, options(nostack, preserves_flags));
    }

    /// Escreve um registrador de controle estendido (XCR0).
    #[inline]
    pub unsafe fn wrxcr(reg: u32, value: u64) {
        let lo = value as u32;
        let hi = (value >> 32) as u32;
        asm!(
            "xsetbv",
            in("ecx") reg,
            in("eax") lo,
            in("edx") hi,
            options(nomem, nostack, preserves_flags)
        );
    }

    #[inline]
    pub fn pause() {
        unsafe { asm!("pause", options(nomem, nostack, preserves_flags)) };
    }
}

// ============================================================================
// CONTEXTO DE FPU
// ============================================================================
//
// `cpu_init` detecta XSAVE/AVX e escolhe o mecanismo uma única vez; depois
// disso o scheduler só chama `fpu_save`/`fpu_restore`. O tamanho da área de
// save vem do CPUID (leaf 0xD) no caminho XSAVE, ou 512 bytes no FXSAVE.

static FPU_USE_XSAVE: AtomicBool = AtomicBool::new(false);
static FPU_STORAGE_SIZE: AtomicUsize = AtomicUsize::new(512);

/// Registra o mecanismo de FPU escolhido pelo `cpu_init` do BSP.
pub fn fpu_set_mechanism(use_xsave: bool, storage_size: usize) {
    FPU_USE_XSAVE.store(use_xsave, Ordering::Relaxed);
    FPU_STORAGE_SIZE.store(storage_size, Ordering::Relaxed);
}

/// Tamanho em bytes da área de save de FPU de cada thread.
pub fn fpu_storage_size() -> usize {
    FPU_STORAGE_SIZE.load(Ordering::Relaxed)
}

/// O mecanismo de save escolhido foi XSAVE?
pub fn fpu_uses_xsave() -> bool {
    FPU_USE_XSAVE.load(Ordering::Relaxed)
}

/// Salva o estado de FPU/SSE/AVX da CPU atual em `region`.
///
/// # Safety
///
/// `region` deve ter `fpu_storage_size()` bytes, alinhado a 64.
pub unsafe fn fpu_save(region: *mut u8) {
    if FPU_USE_XSAVE.load(Ordering::Relaxed) {
        asm!(
            "xsave [{}]",
            in(reg) region,
            in("eax") u32::MAX,
            in("edx") u32::MAX,
            options(nostack)
        );
    } else {
        asm!("fxsave [{}]", in(reg) region, options(nostack));
    }
}

/// Restaura o estado de FPU/SSE/AVX a partir de `region`.
///
/// # Safety
///
/// `region` deve ter sido preenchido por `fpu_save` (ou pelos defaults de
/// thread nova) e ter o alinhamento de 64 bytes.
pub unsafe fn fpu_restore(region: *const u8) {
    if FPU_USE_XSAVE.load(Ordering::Relaxed) {
        asm!(
            "xrstor [{}]",
            in(reg) region,
            in("eax") u32::MAX,
            in("edx") u32::MAX,
            options(nostack)
        );
    } else {
        asm!("fxrstor [{}]", in(reg) region, options(nostack));
    }
}
