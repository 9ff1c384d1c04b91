//! # openplant-protocol
//!
//! Wire protocol implementation for the OpenPlant real-time database.
//!
//! This crate provides:
//! - Frame codec with heartbeat detection and LZ4 block/frame compression
//! - MessagePack-style primitive codec
//! - Typed values, the conversion lattice and Slice/Map/Structure compounds
//! - Schema-driven row codec (fixed prefix, set bitmap, variable cells)
//! - Request/response message bodies and the login handshake
//!
//! Everything here is synchronous and performs no I/O.

pub mod compress;
pub mod error;
pub mod filter;
pub mod frame;
pub mod hash;
pub mod index;
pub mod login;
pub mod map;
pub mod message;
pub mod msgpack;
pub mod props;
pub mod row;
pub mod slice;
pub mod structure;
pub mod table;
pub mod types;
pub mod v3;
pub mod value;

pub use compress::{CompressMode, Compressor};
pub use error::{ErrorKind, ProtocolError};
pub use filter::{Filter, FilterOp, FilterValue, Filters, RawFilter, Relation};
pub use frame::{DecodedFrame, FrameDecoder, FrameEncoder, FrameHeader, DEFAULT_PAGE_SIZE, HEAD_SIZE};
pub use hash::make_uuid;
pub use index::{IndexKeys, Indexes};
pub use login::{LoginReply, ServerHello};
pub use map::OpMap;
pub use message::{ColumnDesc, DecodedRequest, MessageHead, PageHeader, Request, Response, ResponseHead};
pub use msgpack::MsgValue;
pub use props::{Action, Props};
pub use row::{Record, Row, RowView};
pub use slice::OpSlice;
pub use structure::{OpStructure, StructureBuilder};
pub use table::{Column, Table};
pub use types::VarType;
pub use value::Value;

/// Default port of an OpenPlant server.
pub const DEFAULT_PORT: u16 = 8200;
