//! Driver Serial (COM1)
//!
//! Driver básico para portas seriais 16550 UART.
//! Usado para debug e output do kernel (sink das macros de log).

use core::fmt;

use spin::Mutex;

use crate::arch::x86_64::ports::{inb, outb};

/// Porta serial COM1 (0x3F8)
const COM1: u16 = 0x3F8;

/// Driver da porta serial
pub struct SerialPort {
    port: u16,
}

impl SerialPort {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// Inicializa a porta serial
    pub fn init(&mut self) {
        unsafe {
            // Desabilita interrupções da UART
            outb(self.port + 1, 0x00);
            // Habilita DLAB (set baud rate divisor)
            outb(self.port + 3, 0x80);
            // Divisor 3 (38400 baud)
            outb(self.port, 0x03);
            outb(self.port + 1, 0x00);
            // 8 bits, sem paridade, um stop bit
            outb(self.port + 3, 0x03);
            // FIFO habilitado e limpo, threshold de 14 bytes
            outb(self.port + 2, 0xC7);
            // RTS/DSR
            outb(self.port + 4, 0x0B);
        }
    }

    /// Escreve um byte na porta serial
    pub fn write_byte(&mut self, byte: u8) {
        unsafe {
            // Aguarda a porta estar pronta
            while (inb(self.port + 5) & 0x20) == 0 {}
            outb(self.port, byte);
        }
    }

    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str(s);
        Ok(())
    }
}

/// Porta serial global para output do kernel
static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

/// Inicializa a porta serial global
pub fn init() {
    SERIAL.lock().init();
}

/// Escreve uma string na porta serial global
pub fn write_str(s: &str) {
    SERIAL.lock().write_str(s);
}

/// Escreve `format_args!` na porta serial global.
///
/// Usa `try_lock` em contexto de panic para não travar se o dono do lock
/// foi exatamente quem entrou em panic.
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SERIAL.lock().write_fmt(args);
}

/// Variante do panic handler: nunca bloqueia.
pub fn write_fmt_force(args: fmt::Arguments) {
    use fmt::Write;
    // SAFETY: no panic as outras CPUs já foram abortadas; pior caso é
    // output intercalado.
    unsafe { SERIAL.force_unlock() };
    if let Some(mut guard) = SERIAL.try_lock() {
        let _ = guard.write_fmt(args);
    }
}
