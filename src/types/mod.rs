//! 类型模块：定义出站消息、分段与附件等核心数据类型。
//!
//! # Types Module
//!
//! Core data types shared between the chunker, the streaming accumulator and
//! the collaborator traits.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Recipient`] | Downstream destination (chat plus optional thread) |
//! | [`MessageHandle`] | Identifier of a message already delivered to the channel |
//! | [`OutboundMessage`] | Text plus formatting, reply anchor and navigation |
//! | [`Segment`] | One size-bounded unit of chunked output |
//! | [`CodeAsset`] | Code promoted out of inline text into an attachment |
//! | [`Attachment`] | Inbound upload buffered by the burst debouncer |
//!
//! ## Submodules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`message`] | Channel-facing message types |
//! | [`segment`] | Chunker output types |
//! | [`attachment`] | Inbound upload types |

pub mod attachment;
pub mod message;
pub mod segment;

pub use attachment::Attachment;
pub use message::{
    EditStatus, MessageHandle, NavButton, NavTarget, Navigation, OutboundMessage, Recipient,
    TextFormat,
};
pub use segment::{AssetMetadata, CodeAsset, Segment};
