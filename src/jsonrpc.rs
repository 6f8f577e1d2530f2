pub mod request;
pub mod response;

pub use request::{bind_upstream, JsonRpcBody, JsonRpcRequest, RequestContext};
pub use response::{JsonRpcError, JsonRpcResponse};
