//! Driver do Local APIC (LAPIC).
//!
//! Cada core da CPU possui seu próprio LAPIC. Funções principais:
//! - Gerar a interrupção de timer one-shot que aciona o scheduler.
//! - Gerar IPIs (acordar CPU ociosa, abort no panic).
//! - Sinalizar End of Interrupt (EOI).
//!
//! Detalhes de Implementação:
//! - Usa MSR `IA32_APIC_BASE` para habilitar globalmente e achar o MMIO.
//! - Registradores acessados via HHDM (endereço físico + higher half).
//! - O timer é calibrado contra o PIT uma vez por CPU no `cpu_init`.

use crate::arch::x86_64::cpu::{Cpu, MSR_APIC_BASE};
use crate::arch::x86_64::idt::SPURIOUS_VECTOR;
use crate::drivers::pit;
use crate::mm::addr::phys_to_virt;

// Offsets MMIO
const REG_ID: usize = 0x020;
const REG_EOI: usize = 0x0B0;
const REG_SVR: usize = 0x0F0; // Spurious Interrupt Vector
const REG_ESR: usize = 0x280; // Error Status Register
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TICR: usize = 0x380; // Timer Initial Count
const REG_TCCR: usize = 0x390; // Timer Current Count
const REG_TDCR: usize = 0x3E0; // Timer Divide Config

// Bits e Flags
const APIC_ENABLE_BIT: u64 = 1 << 11; // MSR Enable
const SVR_SOFT_ENABLE: u32 = 1 << 8; // Software Enable no registro SVR
const LVT_MASKED: u32 = 1 << 16;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_DEST_SELF: u32 = 0b01 << 18;
const ICR_DEST_ALL_BUT_SELF: u32 = 0b11 << 18;

// Divide por 16 (TDCR = 0b0011)
const TIMER_DIVIDER_CONF: u32 = 0b0011;
const TIMER_DIVIDER: u64 = 16;

/// Janela de calibração contra o PIT, em milissegundos.
const CALIBRATION_MS: u64 = 10;

/// Base física do MMIO do LAPIC (o VMM precisa dela para mapear a página).
#[inline]
pub fn mmio_phys_base() -> u64 {
    (unsafe { Cpu::read_msr(MSR_APIC_BASE) }) & 0xF_FFFF_F000
}

#[inline]
fn mmio_base() -> u64 {
    phys_to_virt(mmio_phys_base())
}

#[inline]
fn read(offset: usize) -> u32 {
    unsafe { core::ptr::read_volatile((mmio_base() + offset as u64) as *const u32) }
}

#[inline]
fn write(offset: usize, value: u32) {
    unsafe { core::ptr::write_volatile((mmio_base() + offset as u64) as *mut u32, value) };
}

/// Habilita o LAPIC do core atual.
///
/// # Safety
///
/// Ring 0, HHDM já mapeado. Chamar uma vez por core, no `cpu_init`.
pub unsafe fn enable() {
    // 1. Habilitar LAPIC globalmente via MSR
    let msr_info = Cpu::read_msr(MSR_APIC_BASE);
    if (msr_info & APIC_ENABLE_BIT) == 0 {
        Cpu::write_msr(MSR_APIC_BASE, msr_info | APIC_ENABLE_BIT);
    }

    // 2. Spurious Interrupt Vector e Software Enable (Bit 8)
    write(REG_SVR, SVR_SOFT_ENABLE | SPURIOUS_VECTOR as u32);

    // 3. Mascarar LVT Timer até a calibração
    write(REG_LVT_TIMER, LVT_MASKED);

    // 4. Limpar Error Status Register (2x em hardware antigo)
    write(REG_ESR, 0);
    write(REG_ESR, 0);

    // 5. EOI para limpar estado pendente anterior
    write(REG_EOI, 0);
}

/// Sinaliza End of Interrupt.
#[inline]
pub fn eoi() {
    write(REG_EOI, 0);
}

/// ID do LAPIC atual (bits 24-31 do registrador ID).
#[inline]
pub fn id() -> u32 {
    read(REG_ID) >> 24
}

fn wait_icr_idle() {
    while (read(REG_ICR_LOW) & ICR_DELIVERY_PENDING) != 0 {
        Cpu::pause();
    }
}

/// Envia uma IPI para o LAPIC de destino.
pub fn send_ipi(lapic_id: u32, vector: u8) {
    wait_icr_idle();
    write(REG_ICR_HIGH, lapic_id << 24);
    write(REG_ICR_LOW, vector as u32);
}

/// IPI para si mesmo (usada pelo yield).
pub fn send_self_ipi(vector: u8) {
    wait_icr_idle();
    write(REG_ICR_LOW, ICR_DEST_SELF | vector as u32);
}

/// Broadcast para todas as CPUs menos a atual (abort no panic).
pub fn send_ipi_all_but_self(vector: u8) {
    wait_icr_idle();
    write(REG_ICR_LOW, ICR_DEST_ALL_BUT_SELF | vector as u32);
}

/// Para o timer do LAPIC desta CPU.
pub fn timer_stop() {
    write(REG_TICR, 0);
    write(REG_LVT_TIMER, LVT_MASKED);
}

/// Arma o timer em modo one-shot para daqui a `us` microssegundos.
///
/// `freq` é a frequência calibrada desta CPU (ticks/segundo com o divisor
/// configurado), vinda do `LocalCpu`.
pub fn timer_oneshot(freq: u64, vector: u8, us: u64) {
    let ticks = (freq * us) / 1_000_000;
    write(REG_TDCR, TIMER_DIVIDER_CONF);
    write(REG_LVT_TIMER, vector as u32); // one-shot, desmascarado
    write(REG_TICR, ticks.max(1) as u32);
}

/// Calibra o timer do LAPIC contra o PIT.
///
/// Conta quantos ticks de LAPIC cabem em `CALIBRATION_MS` e extrapola para
/// ticks/segundo. Roda uma vez por CPU; o resultado vive no `LocalCpu`.
pub fn timer_calibrate() -> u64 {
    write(REG_TDCR, TIMER_DIVIDER_CONF);
    write(REG_LVT_TIMER, LVT_MASKED);
    write(REG_TICR, u32::MAX);

    pit::spin_ms(CALIBRATION_MS);

    let remaining = read(REG_TCCR) as u64;
    write(REG_TICR, 0);

    let elapsed = u32::MAX as u64 - remaining;
    let freq = elapsed * (1000 / CALIBRATION_MS);

    crate::kdebug!(
        "(LAPIC) Timer calibrado: {} ticks/s (divisor {})",
        freq,
        TIMER_DIVIDER
    );
    freq
}
