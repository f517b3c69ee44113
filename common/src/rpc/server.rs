// actix-web glue for the JSON-RPC handler.

use actix_web::{
    web::{self, Data},
    HttpResponse, Responder, ResponseError,
};

use super::{RPCHandler, RpcResponseError};

impl ResponseError for RpcResponseError {
    // JSON-RPC errors travel in a 200 body, not an HTTP error status
    fn error_response(&self) -> HttpResponse {
        HttpResponse::Ok().json(self.to_json())
    }
}

// Lets a route reach the JSON-RPC handler of whatever server owns it
pub trait RPCServerHandler<T: Clone + Send + Sync + 'static> {
    fn get_rpc_handler(&self) -> &RPCHandler<T>;
}

// POST endpoint: dispatch a JSON-RPC body and answer with 200 either way
pub async fn json_rpc<T, H>(
    server: Data<H>,
    body: web::Bytes,
) -> Result<impl Responder, RpcResponseError>
where
    T: Clone + Send + Sync + 'static,
    H: RPCServerHandler<T>,
{
    let result = server.get_rpc_handler().handle_request(&body).await?;
    Ok(HttpResponse::Ok().json(result))
}
