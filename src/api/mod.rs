mod handler;
mod rpc;

pub use handler::ApiHandler;
pub use rpc::{
    ApiClient, ApiServer, LearnedRoute, PeerSpec, PeerSummary, RouteSpec, Statistics,
};

use std::net::SocketAddr;

use jsonrpsee::http_server::{HttpServerBuilder, HttpServerHandle};

use crate::agent::ApiTx;

/// Start the JSON-RPC control API. The returned handle stops the
/// server when dropped.
pub async fn serve(
    addr: SocketAddr,
    tx: ApiTx,
) -> Result<HttpServerHandle, jsonrpsee::core::Error> {
    let server = HttpServerBuilder::default().build(addr).await?;
    server.start(ApiHandler::new(tx).into_rpc())
}
