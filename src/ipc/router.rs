use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use tracing::debug;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::auth::try_handle,
    handlers::branches::try_handle,
    handlers::users::try_handle,
    handlers::courses::try_handle,
    handlers::batches::try_handle,
    handlers::trainers::try_handle,
    handlers::students::try_handle,
    handlers::leads::try_handle,
    handlers::admissions::try_handle,
    handlers::attendance::try_handle,
    handlers::reports::try_handle,
    handlers::dashboard::try_handle,
    handlers::maintenance::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    debug!(id = %req.id, method = %req.method, "request");
    for try_handle in FAMILIES {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
