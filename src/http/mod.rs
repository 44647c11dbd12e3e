// mod http では HTTP/1.1 のワイヤ形式 (パースと書き出し) を扱う
pub mod header;
pub mod request;
pub mod response;
pub mod writer;

pub use header::{Headers, supports_keep_alive};
pub use request::{CapturedGroups, Request, RequestParser};
pub use response::{Body, Encoder, Response};
pub use writer::write_response;
