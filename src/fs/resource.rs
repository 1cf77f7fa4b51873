//! Contrato de resource: qualquer coisa que saiba ler e escrever bytes em
//! offsets. É o backing de mapeamentos não anônimos; o VFS de verdade vem
//! depois, por cima deste trait.

use alloc::vec::Vec;

use crate::sync::spinlock::Spinlock;

/// Convenção de retorno: bytes transferidos, ou negativo em erro.
pub trait Resource: Send + Sync {
    fn read(&self, buf: &mut [u8], offset: u64) -> isize;
    fn write(&self, buf: &[u8], offset: u64) -> isize;
}

/// Resource em memória. Usado pelos self-tests e como backing trivial
/// enquanto não existe filesystem real.
pub struct MemResource {
    data: Spinlock<Vec<u8>>,
}

impl MemResource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Spinlock::new(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Resource for MemResource {
    fn read(&self, buf: &mut [u8], offset: u64) -> isize {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            // Ler além do fim devolve zeros (páginas de mmap parcialmente
            // cobertas pelo arquivo ficam zeradas)
            buf.fill(0);
            return buf.len() as isize;
        }
        let avail = data.len() - offset;
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        buf[n..].fill(0);
        buf.len() as isize
    }

    fn write(&self, buf: &[u8], offset: u64) -> isize {
        let mut data = self.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        buf.len() as isize
    }
}
