//! Drivers mínimos que o core do kernel precisa.
//!
//! Serial (sink do klog) e PIT (referência de calibração do LAPIC timer).
//! Qualquer outro dispositivo fica fora do core e fala com o kernel pelo
//! contrato de `fs::resource`.

pub mod pit;
pub mod serial;
