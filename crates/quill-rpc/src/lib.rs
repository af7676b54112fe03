//! JSON-RPC surface over the orchestrator: capability discovery exposed as
//! callable tools, task invocation, and readable status/log resources.

mod framing;
mod server;

pub use framing::{
    error_frame, read_content_length_frame, request_frame, result_frame,
    write_content_length_frame, JSONRPC_VERSION,
};
pub use server::{
    serve_jsonrpc_reader, RpcDispatchError, RpcServeReport, RpcServerState, RPC_ERROR_INVALID_PARAMS,
    RPC_ERROR_INVALID_REQUEST, RPC_ERROR_METHOD_NOT_FOUND, RPC_ERROR_PARSE, RPC_PROTOCOL_VERSION,
};
