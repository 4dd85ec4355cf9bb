pub mod channel_ipc;
pub mod config;
pub mod paths;
pub mod request;
pub mod slots;

pub use request::{decode_batch, encode_batch, RequestBatch, RequestRecord, TabPlacement};
pub use slots::{ServerIdentity, SlotKind, SlotName};
