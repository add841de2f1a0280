pub mod body;
pub mod headers;
pub(crate) mod line;
pub mod playlist;
pub mod request;
pub mod response;

pub use body::BodyTooLarge;
pub use headers::Headers;
pub use request::RequestHead;
pub use response::ResponseHead;
