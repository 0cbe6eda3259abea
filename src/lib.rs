#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod error;
pub mod file_transfer;
pub mod mailbox;
pub mod message;
pub mod network;
pub mod peer;
pub mod registry;
pub mod reply;

pub use config::Config;
pub use error::PeerError;
pub use message::Message;
pub use peer::{PeerHandle, PeerId};
