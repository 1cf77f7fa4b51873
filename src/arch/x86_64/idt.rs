//! Interrupt Descriptor Table e despacho de interrupções.
//!
//! Três responsabilidades:
//! - A IDT propriamente dita (256 gates apontando para stubs assembly).
//! - A tabela plana de 256 handlers registráveis em runtime.
//! - A alocação de vetores: um contador corrido a partir de 32; os vetores
//!   0-31 são exceções de CPU e os 16 do topo (>= 0xF0) ficam reservados
//!   para uso interno do kernel (abort IPI, spurious).
//!
//! Os stubs são gerados por `.rept` em `global_asm!`: cada um empurra o
//! número do vetor (e um error code falso quando a CPU não empurra um),
//! salva o register file no formato [`CpuStatus`] e chama o dispatcher.

use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::x86_64::gdt::KERNEL_CODE_SEL;

/// Primeiro vetor alocável (0-31 são exceções).
const FIRST_FREE_VECTOR: usize = 32;
/// Vetores >= este valor são reservados para o kernel.
const RESERVED_VECTOR_BASE: usize = 0xF0;

/// Vetor do abort IPI: panic usa para travar as CPUs irmãs.
pub const ABORT_VECTOR: u8 = 0xF0;
/// Vetor de interrupção espúria do LAPIC.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Register file salvo pelos stubs de interrupção.
///
/// O layout espelha EXATAMENTE a ordem de pushes em `int_common` mais o
/// frame que a CPU empurra no `iretq`; o scheduler troca de thread
/// apontando RSP para uma dessas estruturas e executando o caminho de
/// restauração.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuStatus {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl CpuStatus {
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Dump de registradores para o log (usado em exceções fatais).
    pub fn dump(&self) {
        crate::kerror!(
            "(IDT) RIP={:#018x} CS={:#06x} RFLAGS={:#010x}",
            self.rip,
            self.cs,
            self.rflags
        );
        crate::kerror!(
            "(IDT) RSP={:#018x} SS={:#06x} ERR={:#x} VEC={}",
            self.rsp,
            self.ss,
            self.error_code,
            self.vector
        );
        crate::kerror!(
            "(IDT) RAX={:#018x} RBX={:#018x} RCX={:#018x}",
            self.rax,
            self.rbx,
            self.rcx
        );
        crate::kerror!(
            "(IDT) RDX={:#018x} RSI={:#018x} RDI={:#018x}",
            self.rdx,
            self.rsi,
            self.rdi
        );
        crate::kerror!(
            "(IDT) RBP={:#018x} R8 ={:#018x} R9 ={:#018x}",
            self.rbp,
            self.r8,
            self.r9
        );
        crate::kerror!(
            "(IDT) R10={:#018x} R11={:#018x} R12={:#018x}",
            self.r10,
            self.r11,
            self.r12
        );
        crate::kerror!(
            "(IDT) R13={:#018x} R14={:#018x} R15={:#018x}",
            self.r13,
            self.r14,
            self.r15
        );
    }
}

/// Handler registrado para um vetor.
pub type InterruptHandler = fn(u32, &mut CpuStatus);

/// Entrada da IDT (16 bytes em 64-bit)
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist_reserved: u8, // Bits 0-2: IST
    type_attr: u8,    // Gate Type, DPL, Present
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist_reserved: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    /// Cria uma entrada presente apontando para um stub.
    ///
    /// `ist`: Index da Interrupt Stack Table (1-7) no TSS. 0 para não usar.
    pub fn new(stub: u64, ist: u8) -> Self {
        Self {
            offset_low: (stub & 0xFFFF) as u16,
            selector: KERNEL_CODE_SEL.0,
            ist_reserved: ist & 0x7,
            type_attr: 0x8E, // Present, DPL 0, Interrupt Gate
            offset_mid: ((stub >> 16) & 0xFFFF) as u16,
            offset_high: (stub >> 32) as u32,
            reserved: 0,
        }
    }
}

/// A Tabela IDT propriamente dita
#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Idt {
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::missing(); 256],
        }
    }

    /// Carrega a IDT na CPU (lidt)
    ///
    /// # Safety
    ///
    /// A tabela deve ter tempo de vida 'static.
    pub unsafe fn load(&'static self) {
        let descriptor = IdtDescriptor {
            limit: (size_of::<Self>() - 1) as u16,
            base: (self as *const Self) as u64,
        };
        core::arch::asm!(
            "lidt [{}]",
            in(reg) &descriptor,
            options(readonly, nostack, preserves_flags)
        );
    }
}

/// Descritor para LIDT
#[repr(C, packed)]
struct IdtDescriptor {
    limit: u16,
    base: u64,
}

// Global IDT (estática, mutável apenas na init do BSP)
static mut IDT: Idt = Idt::new();

// Tabela plana de handlers. Ponteiros de fn guardados como usize para
// permitir registro/consulta atômica sem lock (ISRs não podem travar).
static INTERRUPT_TABLE: [AtomicUsize; 256] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicUsize = AtomicUsize::new(0);
    [ZERO; 256]
};

// Contador corrido de alocação de vetores.
static NEXT_VECTOR: AtomicUsize = AtomicUsize::new(FIRST_FREE_VECTOR);

extern "C" {
    // Tabela de ponteiros para os 256 stubs, montada no global_asm! abaixo.
    static INT_STUB_TABLE: [u64; 256];
}

/// Monta as 256 entradas da IDT a partir dos stubs e a carrega no BSP.
/// As APs só precisam de `idt_reload`.
pub unsafe fn idt_init() {
    let idt = &mut *core::ptr::addr_of_mut!(IDT);
    for (vector, entry) in idt.entries.iter_mut().enumerate() {
        // Page fault usa IST3 (stack própria da thread); double fault IST1;
        // abort IST4 — panic precisa funcionar com a stack normal podre.
        let ist = match vector {
            8 => 1,
            14 => 3,
            v if v == ABORT_VECTOR as usize => 4,
            _ => 0,
        };
        *entry = IdtEntry::new(INT_STUB_TABLE[vector], ist);
    }
    idt_reload();
    crate::kinfo!("(IDT) 256 gates instalados");
}

/// Recarrega a IDT global nesta CPU.
pub unsafe fn idt_reload() {
    (*core::ptr::addr_of!(IDT)).load();
}

/// Aloca o próximo vetor livre do contador corrido.
///
/// Esgotar os vetores é erro de programação do kernel: panic.
pub fn allocate_vector() -> u8 {
    let vector = NEXT_VECTOR.fetch_add(1, Ordering::Relaxed);
    if vector >= RESERVED_VECTOR_BASE {
        panic!("out of interrupt vectors");
    }
    vector as u8
}

/// Registra o handler de um vetor na tabela plana.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    INTERRUPT_TABLE[vector as usize].store(handler as usize, Ordering::Release);
}

/// Dispatcher chamado pelo stub assembly com o frame salvo.
#[no_mangle]
unsafe extern "C" fn interrupt_dispatch(status: *mut CpuStatus) {
    let status = &mut *status;
    let vector = status.vector as u32;

    let handler = INTERRUPT_TABLE[status.vector as usize].load(Ordering::Acquire);
    if handler != 0 {
        let handler: InterruptHandler = core::mem::transmute(handler);
        handler(vector, status);
        return;
    }

    if vector < 32 {
        status.dump();
        panic!("unhandled CPU exception {}", vector);
    }

    // Interrupção sem handler (provável espúria): só ack.
    crate::kwarn!("(IDT) Vetor {} sem handler registrado", vector);
    crate::arch::x86_64::apic::lapic::eoi();
}

/// Restaura um register file completo e retorna com `iretq`.
///
/// É o rabo do context switch: o scheduler chama isto com o `CpuStatus`
/// salvo da próxima thread e nunca mais volta.
///
/// # Safety
///
/// `status` deve apontar para um frame válido (incluindo RIP/CS/RFLAGS/
/// RSP/SS coerentes) que permaneça intacto até o `iretq` concluir.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_cpu_status(status: *const CpuStatus) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16", // vector + error code
        // Voltando para ring 3? Então devolver o GS do usuário.
        "cmp qword ptr [rsp + 8], 0x08",
        "je 2f",
        "swapgs",
        "2:",
        "iretq"
    );
}

// ============================================================================
// STUBS DE INTERRUPÇÃO (gerados por .rept)
// ============================================================================
//
// Exceções 8/10/11/12/13/14/17/21/29/30 já recebem error code da CPU; para
// as demais empurramos um zero para manter o frame uniforme.

core::arch::global_asm!(
    r#"
.altmacro

.section .text

.macro gen_int_stub num
int_stub_\num:
    .if (\num != 8) && (\num != 10) && (\num != 11) && (\num != 12) && (\num != 13) && (\num != 14) && (\num != 17) && (\num != 21) && (\num != 29) && (\num != 30)
    push 0
    .endif
    push \num
    jmp int_common
.endm

.set vec, 0
.rept 256
    gen_int_stub %vec
    .set vec, vec+1
.endr

int_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    // Viemos de ring 3? Então trocar para o GS do kernel (per-CPU).
    cmp qword ptr [rsp + 144], 0x08
    je 3f
    swapgs
3:
    mov rdi, rsp
    cld
    call interrupt_dispatch
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    cmp qword ptr [rsp + 8], 0x08
    je 4f
    swapgs
4:
    iretq

.macro gen_stub_addr num
    .quad int_stub_\num
.endm

.section .rodata
.global INT_STUB_TABLE
.balign 8
INT_STUB_TABLE:
.set vec, 0
.rept 256
    gen_stub_addr %vec
    .set vec, vec+1
.endr
"#
);
