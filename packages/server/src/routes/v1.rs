use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::AppConfig;
use crate::handlers;
use crate::state::AppState;

pub fn routes(config: &AppConfig) -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .nest("/receipts", receipt_routes(config))
        .nest("/files", file_routes())
}

fn receipt_routes(config: &AppConfig) -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(
            handlers::receipt::list_receipts,
            handlers::receipt::upload_receipt
        ))
        .routes(routes!(
            handlers::receipt::get_receipt,
            handlers::receipt::delete_receipt
        ))
        .routes(routes!(handlers::receipt::get_download_url))
        .routes(routes!(handlers::receipt::cancel_receipt))
        .layer(handlers::receipt::upload_body_limit(
            config.storage.max_blob_size,
        ))
}

fn file_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(handlers::file::download_file))
}
