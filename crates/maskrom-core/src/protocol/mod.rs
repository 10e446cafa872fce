//! Protocol module - maskrom wire protocol definitions.

pub mod command;
pub mod constants;
pub mod frame;
pub mod reply;

pub use command::{Opcode, Operation, ReplyKind};
pub use constants::*;
pub use frame::{
    Direction, OperationDescriptor, ProtocolError, RequestFrame, ResponseFrame, REQUEST_SIZE,
    RESPONSE_SIZE, STATUS_FAIL, STATUS_OK,
};
pub use reply::{Capability, ChipInfo, FlashId, FlashInfo, Reply, pretty_size};
