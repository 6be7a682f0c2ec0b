use std::sync::Arc;

use thiserror::Error;

use crate::zest::{BoardError, ZestBoard};

/// Register/mmio window: per-byte addressed via control transfers.
pub const REG_BASE: u64 = 0x0000_0000;
pub const REG_LIMIT: u64 = 0x0001_0000;

/// Stream window: block transfers via the bulk endpoints.
pub const STREAM_BASE: u64 = 0x0001_0000_0000_0000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error("address 0x{0:x} is outside the register and stream windows")]
    AddressRange(u64),
    #[error("simulated fault: {0}")]
    Simulated(String),
}

/// Address-routed access to the board. `UsbTransport` is the hardware
/// implementation; `sim::SimTransport` backs the test suite.
pub trait Transport: Send + Sync {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, TransportError>;
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransportError>;
}

/// Stateless router on top of a claimed board: register-window accesses are
/// broken into per-byte control transfers, stream-window accesses become a
/// single bulk transfer.
pub struct UsbTransport {
    board: Arc<ZestBoard>,
}

impl UsbTransport {
    pub fn new(board: Arc<ZestBoard>) -> Self {
        UsbTransport { board }
    }

    pub fn board(&self) -> &Arc<ZestBoard> {
        &self.board
    }
}

impl Transport for UsbTransport {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, TransportError> {
        if addr < REG_LIMIT {
            Ok(self.board.read_register((addr - REG_BASE) as u16, size)?)
        } else if addr >= STREAM_BASE {
            Ok(self.board.read_data(size)?)
        } else {
            Err(TransportError::AddressRange(addr))
        }
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        if addr < REG_LIMIT {
            Ok(self.board.write_register((addr - REG_BASE) as u16, data)?)
        } else if addr >= STREAM_BASE {
            Ok(self.board.write_data(data)?)
        } else {
            Err(TransportError::AddressRange(addr))
        }
    }
}
