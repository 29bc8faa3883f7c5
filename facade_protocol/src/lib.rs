#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_import_braces,
    unused_qualifications
)]

mod network_message;

pub mod messages;
pub use network_message::ClientBound;

/// Storage type of blocks.
pub type BlockId = u16;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum MessageType {
    BlockChange,
    BlockUpdates,
    BlockDestructionStage,
    SpawnBlockEntity,
    RemoveBlockEntity,
    BlockBreakEffect,
    Bundle,
    // XXX: Always keep this at the bottom, occupies the highest discriminant spot, so that when
    // you deserialize a MessageType, you can know that only values below 'MessageType::MAX as u8'
    // are valid.
    MAX,
}
