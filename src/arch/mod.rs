//! Camada de arquitetura (HAL).
//!
//! O Brasa só suporta x86-64; mantemos o nível extra de módulo para que a
//! estrutura não precise mudar caso um segundo alvo apareça.

pub mod x86_64;
