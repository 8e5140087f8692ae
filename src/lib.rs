#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::too_many_lines,
)]

mod connection;
mod flags;
mod frame;
mod headers;
mod hpack;
mod line;
mod request;
mod response;
mod serve;
mod stream;
mod types;

pub use bytes::Bytes;
pub use connection::{Connection, Event};
pub use frame::{Frame, Priority};
pub use headers::Headers;
pub use hpack::HeaderCodec;
pub use request::Method;
pub use response::ResponseHandle;
pub use serve::{serve, serve_tls, ServerRequest, ServerResponse, Service};
pub use types::{
    default_settings, Config, ErrorType, FrameError, FrameType, HttpVersion, Settings,
    SettingsParameter, StreamId, UnknownStream, CONNECTION_PREFACE, MAX_LINE_LENGTH,
};
