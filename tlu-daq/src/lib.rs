//! Host-side control and data acquisition for the TLU (trigger logic unit)
//! used in beam tests: USB transport to the ZestSC1 carrier, a typed
//! register model, the threaded stream-FIFO readout, run data persistence
//! and the online-monitor / run-control integrations.

pub mod config;
pub mod device;
pub mod eudaq;
pub mod logging;
pub mod monitor;
pub mod readout;
pub mod run;
pub mod sim;
pub mod sink;
pub mod transport;
pub mod zest;

pub use config::RunConfig;
pub use device::{Tlu, TriggerRecord};
pub use readout::{DataChunk, FifoReadout};
pub use transport::{Transport, UsbTransport};
pub use zest::{Bitfile, ZestBoard};
