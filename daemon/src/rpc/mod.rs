mod methods;

use std::sync::Arc;

use actix_web::{
    dev::ServerHandle,
    web::{self, Data},
    App, HttpResponse, HttpServer, Responder,
};
use log::{info, warn};
use serde_json::json;

use synod_common::rpc::{
    server::{json_rpc, RPCServerHandler},
    RPCHandler,
};

use crate::core::{consensus::ConsensusEngine, storage::Storage};

// Shared context every RPC method receives
pub struct RpcContext<S: Storage> {
    pub engine: Arc<ConsensusEngine<S>>,
}

impl<S: Storage> Clone for RpcContext<S> {
    fn clone(&self) -> Self {
        RpcContext {
            engine: self.engine.clone(),
        }
    }
}

pub struct DaemonRpcServer<S: Storage> {
    handler: RPCHandler<RpcContext<S>>,
}

impl<S: Storage> RPCServerHandler<RpcContext<S>> for DaemonRpcServer<S> {
    fn get_rpc_handler(&self) -> &RPCHandler<RpcContext<S>> {
        &self.handler
    }
}

// Readiness: not-ready once the executor failure streak crosses the
// configured threshold
async fn health<S: Storage>(server: Data<DaemonRpcServer<S>>) -> impl Responder {
    let health = server.handler.get_data().engine.health().clone();
    if health.is_healthy() {
        HttpResponse::Ok().json(json!({ "status": "ok" }))
    } else {
        HttpResponse::ServiceUnavailable().json(json!({
            "status": "unhealthy",
            "consecutive_failures": health.failure_count(),
        }))
    }
}

// Start the JSON-RPC server on the configured bind address; the returned
// handle stops it gracefully at shutdown
pub fn start_rpc_server<S: Storage>(
    bind_address: &str,
    engine: Arc<ConsensusEngine<S>>,
) -> std::io::Result<ServerHandle> {
    if bind_address.starts_with("0.0.0.0") {
        warn!("RPC server bound to all interfaces; administrative methods are unauthenticated");
    }

    let mut handler = RPCHandler::new(RpcContext { engine });
    methods::register_methods(&mut handler);
    info!(
        "starting RPC server on {} ({} methods)",
        bind_address,
        handler.count_methods()
    );

    let server = Arc::new(DaemonRpcServer { handler });
    let http_server = HttpServer::new(move || {
        let server = Arc::clone(&server);
        App::new()
            .app_data(Data::from(server))
            .route(
                "/api",
                web::post().to(json_rpc::<RpcContext<S>, DaemonRpcServer<S>>),
            )
            .route(
                "/json_rpc",
                web::post().to(json_rpc::<RpcContext<S>, DaemonRpcServer<S>>),
            )
            .route("/health", web::get().to(health::<S>))
    })
    .disable_signals()
    .bind(bind_address)?
    .run();

    let handle = http_server.handle();
    tokio::spawn(http_server);
    Ok(handle)
}
