use async_trait::async_trait;
use jsonrpsee::core::{Error, RpcResult};
use tokio::sync::oneshot;

use super::rpc::{ApiServer, LearnedRoute, PeerSpec, PeerSummary, RouteSpec, Statistics};
use crate::agent::{ApiRequest, ApiTx};

/// Bridges the RPC server onto the agent's command channel; every call
/// is a request plus a oneshot reply
pub struct ApiHandler {
    tx: ApiTx,
}

impl ApiHandler {
    pub fn new(tx: ApiTx) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ApiRequest,
    ) -> RpcResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| Error::Custom("Agent is not running".to_string()))?;
        response
            .await
            .map_err(|_| Error::Custom("Agent dropped the request".to_string()))
    }
}

#[async_trait]
impl ApiServer for ApiHandler {
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>> {
        self.request(ApiRequest::ShowPeers).await
    }

    async fn show_rib(&self) -> RpcResult<Vec<LearnedRoute>> {
        self.request(ApiRequest::ShowRib).await
    }

    async fn show_routes_learned(&self) -> RpcResult<Vec<LearnedRoute>> {
        self.request(ApiRequest::ShowRoutesLearned).await
    }

    async fn show_routes_advertised(&self) -> RpcResult<Vec<LearnedRoute>> {
        self.request(ApiRequest::ShowRoutesAdvertised).await
    }

    async fn advertise_route(&self, route: RouteSpec) -> RpcResult<bool> {
        self.request(|reply| ApiRequest::AdvertiseRoute { spec: route, reply })
            .await
    }

    async fn withdraw_route(&self, prefix: String) -> RpcResult<bool> {
        self.request(|reply| ApiRequest::WithdrawRoute { prefix, reply })
            .await
    }

    async fn add_peer(&self, peer: PeerSpec) -> RpcResult<bool> {
        self.request(|reply| ApiRequest::AddPeer { spec: peer, reply })
            .await
    }

    async fn remove_peer(&self, key: String) -> RpcResult<bool> {
        self.request(|reply| ApiRequest::RemovePeer { key, reply })
            .await
    }

    async fn start_peer(&self, key: String) -> RpcResult<bool> {
        self.request(|reply| ApiRequest::StartPeer { key, reply })
            .await
    }

    async fn stop_peer(&self, key: String) -> RpcResult<bool> {
        self.request(|reply| ApiRequest::StopPeer { key, reply })
            .await
    }

    async fn statistics(&self) -> RpcResult<Statistics> {
        self.request(ApiRequest::Statistics).await
    }
}
