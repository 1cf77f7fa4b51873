// =============================================================================
// LOGGING DO KERNEL
// =============================================================================
//
// Todos os macros escrevem na serial (COM1). O filtro de nível é feito em
// tempo de compilação via features do Cargo:
//
// - no_logs:   Remove 100% dos logs do binário
// - log_error: Apenas ERROR
// - log_info:  ERROR, WARN, INFO
// - log_debug: ERROR, WARN, INFO, DEBUG
// - log_trace: Todos os níveis (padrão)
//
// Uso:
//   kinfo!("(PMM) {} páginas livres", free);
//   kdebug!("(VMM) map virt={:#x} phys={:#x}", virt, phys);
//
// =============================================================================

// Prefixos com cores ANSI (QEMU serial console entende)
pub const P_ERROR: &str = "\x1b[1;31m[ERRO]\x1b[0m ";
pub const P_WARN: &str = "\x1b[1;33m[WARN]\x1b[0m ";
pub const P_INFO: &str = "\x1b[32m[INFO]\x1b[0m ";
pub const P_DEBUG: &str = "\x1b[36m[DEBG]\x1b[0m ";
pub const P_TRACE: &str = "\x1b[35m[TRAC]\x1b[0m ";

#[doc(hidden)]
pub fn log_line(prefix: &str, args: core::fmt::Arguments) {
    crate::drivers::serial::write_str(prefix);
    crate::drivers::serial::write_fmt(args);
    crate::drivers::serial::write_str("\r\n");
}

/// Variante para o caminho de pânico: nunca bloqueia no lock da serial.
#[doc(hidden)]
pub fn log_line_force(prefix: &str, args: core::fmt::Arguments) {
    crate::drivers::serial::write_fmt_force(format_args!("{}", prefix));
    crate::drivers::serial::write_fmt_force(args);
    crate::drivers::serial::write_fmt_force(format_args!("\r\n"));
}

// =============================================================================
// MACROS DE LOG
// =============================================================================

#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::core::logging::log_line(
            $crate::core::logging::P_ERROR,
            core::format_args!($($arg)*),
        );
    }};
}

#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! kerror {
    ($($t:tt)*) => {{}};
}

#[cfg(not(any(feature = "no_logs", feature = "log_error")))]
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::core::logging::log_line(
            $crate::core::logging::P_WARN,
            core::format_args!($($arg)*),
        );
    }};
}

#[cfg(any(feature = "no_logs", feature = "log_error"))]
#[macro_export]
macro_rules! kwarn {
    ($($t:tt)*) => {{}};
}

#[cfg(not(any(feature = "no_logs", feature = "log_error")))]
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::core::logging::log_line(
            $crate::core::logging::P_INFO,
            core::format_args!($($arg)*),
        );
    }};
}

#[cfg(any(feature = "no_logs", feature = "log_error"))]
#[macro_export]
macro_rules! kinfo {
    ($($t:tt)*) => {{}};
}

#[cfg(any(feature = "log_debug", feature = "log_trace"))]
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::core::logging::log_line(
            $crate::core::logging::P_DEBUG,
            core::format_args!($($arg)*),
        );
    }};
}

#[cfg(not(any(feature = "log_debug", feature = "log_trace")))]
#[macro_export]
macro_rules! kdebug {
    ($($t:tt)*) => {{}};
}

#[cfg(feature = "log_trace")]
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::core::logging::log_line(
            $crate::core::logging::P_TRACE,
            core::format_args!($($arg)*),
        );
    }};
}

#[cfg(not(feature = "log_trace"))]
#[macro_export]
macro_rules! ktrace {
    ($($t:tt)*) => {{}};
}
