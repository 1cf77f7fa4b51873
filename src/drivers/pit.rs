//! PIT (8253/8254) — usado só como referência de tempo na calibração do
//! LAPIC timer. Nenhuma interrupção: programamos o canal 2 em one-shot e
//! fazemos polling do gate de saída.

use crate::arch::x86_64::ports::{inb, outb};

/// Frequência base do PIT em Hz.
const PIT_FREQ: u64 = 1_193_182;

const PIT_CH2_DATA: u16 = 0x42;
const PIT_COMMAND: u16 = 0x43;
const PORT_SYSTEM_CONTROL: u16 = 0x61;

/// Espera ocupada de `ms` milissegundos usando o canal 2 do PIT.
///
/// Limite prático: o contador é de 16 bits, então `ms` deve ser <= 54.
pub fn spin_ms(ms: u64) {
    let count = (PIT_FREQ * ms) / 1000;
    debug_assert!(count <= u16::MAX as u64);

    unsafe {
        // Gate do canal 2 ligado, speaker desligado
        let ctrl = inb(PORT_SYSTEM_CONTROL);
        outb(PORT_SYSTEM_CONTROL, (ctrl & !0x02) | 0x01);

        // Canal 2, lobyte/hibyte, modo 0 (interrupt on terminal count)
        outb(PIT_COMMAND, 0xB0);
        outb(PIT_CH2_DATA, (count & 0xFF) as u8);
        outb(PIT_CH2_DATA, ((count >> 8) & 0xFF) as u8);

        // Bit 5 de 0x61 sobe quando o contador zera
        while (inb(PORT_SYSTEM_CONTROL) & 0x20) == 0 {
            core::hint::spin_loop();
        }

        outb(PORT_SYSTEM_CONTROL, ctrl);
    }
}
