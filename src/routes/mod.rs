pub mod files;
pub mod health;
pub mod index;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index::index))
        .route("/health", web::get().to(health::health_check))
        .route("/upload", web::post().to(files::upload_file))
        .route("/f/{id}", web::get().to(files::get_file));
}
