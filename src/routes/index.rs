use crate::config::Config;
use actix_web::{HttpResponse, web};

const INDEX_HTML: &str = include_str!("../../templates/index.html");

fn describe_retention(secs: u64) -> String {
    match secs {
        s if s >= 86_400 && s % 86_400 == 0 => plural(s / 86_400, "day"),
        s if s >= 3_600 && s % 3_600 == 0 => plural(s / 3_600, "hour"),
        s => plural(s, "second"),
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 { format!("1 {unit}") } else { format!("{n} {unit}s") }
}

pub fn render(cfg: &Config) -> String {
    INDEX_HTML
        .replace("{{max_size_mib}}", &(cfg.max_upload_size / (1024 * 1024)).to_string())
        .replace("{{retention}}", &describe_retention(cfg.retention_secs))
        .replace("{{public_url}}", cfg.public_url.trim_end_matches('/'))
}

pub async fn index(cfg: web::Data<Config>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render(&cfg))
}
