#![allow(dead_code)]

pub mod harness;
pub mod http_utils;
pub mod net;
pub mod origin;
pub mod proxy_client;

pub use harness::*;
pub use http_utils::*;
pub use origin::*;
pub use proxy_client::*;
