/// Arquivo: core/smp/bringup.rs
///
/// Propósito: Inicialização das CPUs — a BSP durante o boot e as APs via
/// protocolo de handoff do bootloader.
///
/// Detalhes de Implementação:
/// - Bring-up sequencial: a BSP escreve o `goto_address` de uma AP e fica em
///   busy-wait no flag `online` dela antes de acordar a próxima. Simples e
///   determinístico; o boot não é caminho quente.
/// - `cpu_init` é idêntico para BSP e APs: GDT/TSS próprios, IDT, pagemap do
///   kernel, GS base, FPU e LAPIC.
use core::sync::atomic::Ordering;

use crate::arch::x86_64::apic::lapic;
use crate::arch::x86_64::cpu::{
    Cpu, CPUID_AVX, CPUID_AVX512, CPUID_XSAVE, MSR_EFER, MSR_LSTAR, MSR_SFMASK, MSR_STAR,
};
use crate::arch::x86_64::gdt::{KERNEL_CODE_SEL, USER_DATA_SEL};
use crate::arch::x86_64::idt;
use crate::core::boot::handoff::{ApEntryFn, BootInfo, SmpCpuInfo};
use crate::core::smp::percpu::{self, LocalCpu, ONLINE_CPUS};
use crate::mm::addr::phys_to_virt;
use crate::mm::config::{INTERRUPT_STACK_PAGES, PAGE_SIZE};
use crate::mm::pmm;

/// Inicializa a BSP como CPU lógica 0.
pub fn bsp_init(boot_info: &BootInfo) {
    unsafe { cpu_init(0, boot_info.smp.bsp_lapic_id) };
    crate::kinfo!("(SMP) BSP online (LAPIC ID {})", boot_info.smp.bsp_lapic_id);
}

/// Acorda as APs uma a uma.
///
/// Cada descritor recebe um índice lógico sequencial em `extra_argument` e o
/// endereço de `ap_entry` em `goto_address`; a BSP só passa para a próxima
/// AP quando a atual marca `online`.
pub fn smp_init(boot_info: &BootInfo) {
    let bsp_lapic_id = boot_info.smp.bsp_lapic_id;
    let entry: ApEntryFn = ap_entry;
    let mut next_cpu: usize = 1;

    for info in boot_info.smp.iter() {
        if info.lapic_id == bsp_lapic_id {
            continue;
        }

        let cpu_number = next_cpu;
        next_cpu += 1;

        info.extra_argument.store(cpu_number as u64, Ordering::Release);
        info.goto_address.store(entry as usize as u64, Ordering::Release);

        let slot = unsafe { &*percpu::slot(cpu_number) };
        while !slot.online.load(Ordering::Acquire) {
            Cpu::pause();
        }
    }

    crate::kinfo!("(SMP) {} CPUs online", ONLINE_CPUS.load(Ordering::Acquire));
}

/// Primeira função executada por uma AP, ainda na stack do bootloader.
unsafe extern "C" fn ap_entry(info: *const SmpCpuInfo) -> ! {
    let info = &*info;
    let cpu_number = info.extra_argument.load(Ordering::Acquire) as usize;

    cpu_init(cpu_number, info.lapic_id);
    crate::kinfo!("(SMP) CPU {} online (LAPIC ID {})", cpu_number, info.lapic_id);

    crate::sched::scheduler::scheduler_await();
}

/// Configura a CPU atual como a CPU lógica `cpu_number`.
///
/// # Safety
///
/// Deve rodar exatamente uma vez por CPU, na própria CPU, com o slot ainda
/// não inicializado.
unsafe fn cpu_init(cpu_number: usize, lapic_id: u32) {
    Cpu::disable_interrupts();

    let cpu = &mut *percpu::slot(cpu_number);
    cpu.self_ptr = cpu as *mut LocalCpu;
    cpu.cpu_number = cpu_number as u64;
    cpu.lapic_id = lapic_id;

    // Stacks de interrupção dedicadas. IST3 será trocada pela stack de page
    // fault da thread em execução; até lá usa uma estática da CPU.
    cpu.tss.ist[0] = alloc_interrupt_stack(); // IST1: double fault
    cpu.tss.ist[2] = alloc_interrupt_stack(); // IST3: page fault
    cpu.tss.ist[3] = alloc_interrupt_stack(); // IST4: abort (panic remoto)

    cpu.gdt.set_tss(&cpu.tss);
    cpu.gdt.load();
    cpu.gdt.load_tss();
    idt::idt_reload();

    // Todo mundo roda sobre o pagemap do kernel até o scheduler trocar
    crate::mm::vmm::kernel_pagemap().switch_to();

    // gs:[0] passa a apontar para este LocalCpu. KERNEL_GS_BASE recebe o
    // mesmo valor: o swapgs de entrada/saída de ring 3 troca os dois.
    Cpu::set_gs_base(cpu as *mut LocalCpu as u64);
    Cpu::set_kernel_gs_base(cpu as *mut LocalCpu as u64);

    syscall_init();
    fpu_init(cpu_number == 0);

    cpu.idle_stack_top = alloc_interrupt_stack();
    crate::sched::scheduler::scheduler_cpu_online();

    lapic::enable();
    let freq = lapic::timer_calibrate();
    cpu.timer_freq.store(freq, Ordering::Relaxed);
    crate::kdebug!("(SMP) CPU {} LAPIC timer: {} Hz", cpu_number, freq);

    cpu.online.store(true, Ordering::Release);
    ONLINE_CPUS.fetch_add(1, Ordering::AcqRel);
}

/// Aloca uma stack de interrupção e devolve o topo (cresce para baixo).
fn alloc_interrupt_stack() -> u64 {
    let phys = pmm::pmm_alloc(INTERRUPT_STACK_PAGES);
    phys_to_virt(phys) + (INTERRUPT_STACK_PAGES as u64 * PAGE_SIZE)
}

/// Habilita SYSCALL/SYSRET nesta CPU.
///
/// Ainda não existe caminho de userspace real; o entry aponta para um stub
/// que derruba o kernel com diagnóstico em vez de corromper estado.
unsafe fn syscall_init() {
    // EFER: SCE para syscall/sysret e NXE para o bit NX das PTEs valer em
    // vez de depender do estado que o bootloader deixou
    let efer = Cpu::read_msr(MSR_EFER);
    Cpu::write_msr(MSR_EFER, efer | (1 << 0) | (1 << 11));

    // STAR: seletores de kernel (syscall) e de user (sysret).
    // SYSRET carrega SS = STAR[63:48]+8 e CS = STAR[63:48]+16, por isso o
    // seletor gravado é o de User Data - 8 == selector do slot 3 com RPL 3.
    let star = ((KERNEL_CODE_SEL.0 as u64) << 32) | (((USER_DATA_SEL.0 - 8) as u64) << 48);
    Cpu::write_msr(MSR_STAR, star);
    Cpu::write_msr(MSR_LSTAR, syscall_entry_stub as usize as u64);
    // Mascarar IF e TF na entrada
    Cpu::write_msr(MSR_SFMASK, 0x300);
}

#[unsafe(naked)]
unsafe extern "C" fn syscall_entry_stub() -> ! {
    core::arch::naked_asm!(
        "swapgs",
        "call {unsupported}",
        unsupported = sym syscall_unsupported
    );
}

extern "C" fn syscall_unsupported() -> ! {
    panic!("syscall recebida sem handler instalado");
}

/// Liga SSE e, quando disponível, XSAVE/AVX nesta CPU.
///
/// A BSP decide o mecanismo global de save de FPU; as APs só replicam a
/// configuração de registradores de controle.
unsafe fn fpu_init(is_bsp: bool) {
    // SSE sempre: limpar CR0.EM, setar CR0.MP, CR4.OSFXSR | CR4.OSXMMEXCPT
    let cr0 = Cpu::read_cr0();
    Cpu::write_cr0((cr0 & !(1 << 2)) | (1 << 1));
    let mut cr4 = Cpu::read_cr4() | (1 << 9) | (1 << 10);

    let leaf1 = Cpu::cpu_id(1, 0);
    let has_xsave = matches!(leaf1, Some((_, _, c, _)) if c & CPUID_XSAVE != 0);

    if has_xsave {
        cr4 |= 1 << 18; // CR4.OSXSAVE
        Cpu::write_cr4(cr4);

        let mut xcr0: u64 = 0b11; // x87 + SSE
        if matches!(leaf1, Some((_, _, c, _)) if c & CPUID_AVX != 0) {
            xcr0 |= 1 << 2;
            if matches!(Cpu::cpu_id(7, 0), Some((_, b, _, _)) if b & CPUID_AVX512 != 0) {
                xcr0 |= 0b111 << 5; // opmask + ZMM alto/baixo
            }
        }
        Cpu::wrxcr(0, xcr0);

        if is_bsp {
            // Leaf 0xD subleaf 0: ECX = tamanho da área XSAVE para o XCR0 atual
            // Mínimo de 576: região legacy (512) + header XSAVE (64)
            let size = Cpu::cpu_id(0xD, 0).map(|(_, _, c, _)| c as usize).unwrap_or(576);
            crate::arch::x86_64::cpu::fpu_set_mechanism(true, size);
            crate::kdebug!("(SMP) FPU via XSAVE, area de {} bytes", size);
        }
    } else {
        Cpu::write_cr4(cr4);
        if is_bsp {
            crate::arch::x86_64::cpu::fpu_set_mechanism(false, 512);
            crate::kdebug!("(SMP) FPU via FXSAVE (512 bytes)");
        }
    }
}
