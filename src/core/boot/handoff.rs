/// Arquivo: core/boot/handoff.rs
///
/// Propósito: Definição das estruturas de dados passadas do Bootloader para o Kernel.
/// Contém o mapa de memória, offset do mapeamento higher-half e descritores SMP.
///
/// Detalhes de Implementação:
/// - Estruturas `repr(C)` para garantir layout binário compatível.
/// - Deve coincidir exatamente com o que o bootloader preenche.
/// - Os slots `goto_address`/`extra_argument` dos descritores SMP são atômicos
///   porque as APs fazem polling deles enquanto a BSP escreve.
use core::sync::atomic::AtomicU64;

// Handoff Data (Bootloader -> Kernel)

pub const MAX_MEMORY_REGIONS: usize = 128;
pub const MAX_CPUS: usize = 64;

#[repr(C)]
pub struct BootInfo {
    /// Versão da estrutura de boot info (para compatibilidade)
    pub version: u64,

    /// Offset do mapeamento direto da memória física (higher half).
    /// virt = phys + hhdm_offset para toda a RAM.
    pub hhdm_offset: u64,

    /// Base física onde o kernel foi carregado
    pub kernel_phys_base: u64,
    /// Base virtual onde o kernel foi mapeado
    pub kernel_virt_base: u64,

    /// O Mapa de Memória do sistema
    pub memory_map: MemoryMap,

    /// Descritores das CPUs encontradas pelo bootloader
    pub smp: SmpInfo,

    /// Endereço físico da tabela RSDP (ACPI). Se 0, não encontrado.
    pub rsdp_addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MemoryMap {
    pub regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    pub count: usize,
}

impl MemoryMap {
    /// Iterador sobre as regiões válidas do mapa.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions[..self.count].iter()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    BadMemory = 5,
    BootloaderReclaimable = 6,
    KernelAndModules = 7,
    Framebuffer = 8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
    pub kind: MemoryType,
}

#[repr(C)]
pub struct SmpInfo {
    /// LAPIC ID da CPU que está executando o kernel_main (BSP)
    pub bsp_lapic_id: u32,
    pub _pad: u32,
    pub cpu_count: usize,
    pub cpus: [SmpCpuInfo; MAX_CPUS],
}

impl SmpInfo {
    pub fn iter(&self) -> impl Iterator<Item = &SmpCpuInfo> {
        self.cpus[..self.cpu_count].iter()
    }
}

/// Descritor de uma CPU, preenchido pelo bootloader.
///
/// A AP correspondente fica em loop no trampolim do bootloader fazendo
/// polling de `goto_address`. Quando a BSP escreve um endereço não nulo,
/// a AP salta para ele com um ponteiro para o próprio descritor em `rdi`.
#[repr(C)]
pub struct SmpCpuInfo {
    pub processor_id: u32,
    pub lapic_id: u32,
    /// Destino do salto da AP. 0 = continuar em espera.
    pub goto_address: AtomicU64,
    /// Argumento livre para o kernel; lido pela AP depois do salto.
    pub extra_argument: AtomicU64,
}

pub type ApEntryFn = unsafe extern "C" fn(info: *const SmpCpuInfo) -> !;
