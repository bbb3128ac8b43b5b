use crate::{errors::ApiError, lifecycle::Lifecycle};
use actix_files::NamedFile;
use actix_multipart::Multipart;
use actix_web::http::header::{
    self, Charset, ContentDisposition, DispositionParam, DispositionType, ExtendedValue, HeaderValue,
};
use actix_web::{HttpRequest, HttpResponse, web};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt as _;

#[derive(serde::Serialize)]
pub struct UploadResp {
    pub id: String,
    pub url: String,
    pub expires: DateTime<Utc>,
}

pub async fn upload_file(
    lifecycle: web::Data<Lifecycle>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|_| ApiError::BadRequest("invalid multipart".into()))?
    {
        if field.name() != Some("file") {
            while field
                .try_next()
                .await
                .map_err(|_| ApiError::BadRequest("invalid multipart".into()))?
                .is_some()
            {}
            continue;
        }
        let original = field
            .content_disposition()
            .and_then(|cd| cd.get_filename().map(|s| s.to_string()))
            .unwrap_or_else(|| "upload.bin".into());

        let saved = lifecycle.upload(&original, field).await?;
        return Ok(HttpResponse::Ok().json(UploadResp {
            id: saved.id,
            url: saved.url,
            expires: saved.expires_at,
        }));
    }
    Err(ApiError::BadRequest("no file part".into()))
}

/// `Content-Disposition` carrying the original name. Non-ASCII names get an
/// RFC 5987 `filename*` next to a plain fallback.
fn disposition(inline: bool, original: &str) -> ContentDisposition {
    let fallback: String = original
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect();
    let mut parameters = vec![DispositionParam::Filename(fallback)];
    if !original.is_ascii() {
        parameters.push(DispositionParam::FilenameExt(ExtendedValue {
            charset: Charset::Ext(String::from("UTF-8")),
            language_tag: None,
            value: original.as_bytes().to_vec(),
        }));
    }
    ContentDisposition {
        disposition: if inline { DispositionType::Inline } else { DispositionType::Attachment },
        parameters,
    }
}

pub async fn get_file(
    lifecycle: web::Data<Lifecycle>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let download = lifecycle.download(&id).await?;

    let mime: mime::Mime = download
        .mime_type()
        .parse()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);
    let cd = disposition(download.inline, &download.entry.filename);
    let max_age = download.max_age_secs();

    let named = NamedFile::from_file(download.blob.file, &download.blob.path)
        .map_err(|e| {
            log::error!("cannot serve {id}: {e:?}");
            ApiError::Internal
        })?
        .use_last_modified(true)
        .set_content_type(mime)
        .set_content_disposition(cd);

    let mut resp = named.into_response(&req);
    if let Ok(val) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
        resp.headers_mut().insert(header::CACHE_CONTROL, val);
    }
    resp.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(resp)
}
