//! Protocol module - wire format, walk frames, and stream readers.
//!
//! This module implements the binary protocol spoken over the helper's
//! standard input and output:
//! - 3-byte request header and fixed-size stat/head responses
//! - Walk frames (entry, entry failure, terminal error)
//! - Header-first async readers for both modes

mod frame;
mod reader;
mod wire_format;

pub use frame::{
    build_entry_frame, build_terminal_frame, path_fits, DirEntry, EntryHeader, WalkFrame,
    ENTRY_HEADER_SIZE, PATH_LEN_SIZE, TERMINAL_HEADER_SIZE,
};
pub use reader::{read_head_response, read_request, read_stat_response, read_walk_frame};
pub use wire_format::{
    check_path_len, HeadResponse, PathRequest, RequestHeader, RequestKind, StatRecord,
    StatResponse, HEAD_RESPONSE_SIZE, MAX_PATH_LEN, REQUEST_HEADER_SIZE, STAT_RESPONSE_SIZE,
};

pub(crate) use frame::path_from_bytes;
