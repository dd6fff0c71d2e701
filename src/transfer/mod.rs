//! Upload, download and host-to-host relay over pooled sessions.

mod copy;
mod service;
mod task;

pub use service::TransferService;
pub use task::{Endpoint, TransferKind, TransferReport, TransferTask};
