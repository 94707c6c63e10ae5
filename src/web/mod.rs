pub mod form;
pub mod rejection;

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Write;
use std::sync::Arc;

use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use warp::http::{Response, StatusCode};
use warp::{reject, Filter, Rejection, Reply};

use crate::captcha::VerifyOutcome;
use crate::error::Error;
use crate::service::Service;
use rejection::{handle_rejection, ServiceError};

const ID_FIELD: &str = "captchouli-id";
const COLOR_FIELD: &str = "captchouli-color";
const BACKGROUND_FIELD: &str = "captchouli-background";

fn with_service(
    service: Arc<Service>,
) -> impl Filter<Extract = (Arc<Service>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// The 3-route surface: `GET /` issues a fresh captcha, `POST /`
/// verifies a submitted grid (returning the next challenge on failure),
/// `POST /status` answers whether a solved id is still valid for a
/// protected action to consume.
pub fn routes(
    service: Arc<Service>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let get_form = warp::path::end()
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_service(service.clone()))
        .and_then(get_captcha);

    let post_verify = warp::path::end()
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(with_service(service.clone()))
        .and_then(post_captcha);

    let post_status = warp::path("status")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(with_service(service))
        .and_then(post_status_handler);

    get_form
        .or(post_verify)
        .unify()
        .or(post_status)
        .unify()
        .recover(handle_rejection)
}

/// Wraps an HTML/text body in the fixed header set every response carries
/// (no-store cache control, permissive CORS, gzip encoding) and
/// gzip-compresses the body.
fn gzip_response(body: String, status: StatusCode, content_type: &'static str) -> Response<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body.as_bytes())
        .expect("in-memory gzip write cannot fail");
    let compressed = encoder.finish().expect("in-memory gzip finish cannot fail");

    Response::builder()
        .status(status)
        .header("Cache-Control", "no-store, private")
        .header("Access-Control-Allow-Origin", "*")
        .header("Content-Encoding", "gzip")
        .header("Content-Type", content_type)
        .body(compressed)
        .expect("response with a fixed, valid header set cannot fail to build")
}

async fn get_captcha(
    query: HashMap<String, String>,
    service: Arc<Service>,
) -> Result<Response<Vec<u8>>, Rejection> {
    let color = query.get(COLOR_FIELD).map(String::as_str);
    let background = query.get(BACKGROUND_FIELD).map(String::as_str);
    render_new_captcha(&service, color, background)
        .await
        .map_err(|e| reject::custom(ServiceError(e)))
}

async fn post_captcha(
    fields: HashMap<String, String>,
    service: Arc<Service>,
) -> Result<Response<Vec<u8>>, Rejection> {
    handle_post(&service, &fields)
        .await
        .map_err(|e| reject::custom(ServiceError(e)))
}

async fn post_status_handler(
    fields: HashMap<String, String>,
    service: Arc<Service>,
) -> Result<Response<Vec<u8>>, Rejection> {
    handle_status(&service, &fields)
        .await
        .map_err(|e| reject::custom(ServiceError(e)))
}

async fn render_new_captcha(
    service: &Service,
    color: Option<&str>,
    background: Option<&str>,
) -> Result<Response<Vec<u8>>, Error> {
    let tags = service.tags.snapshot().await;
    let generated = service
        .engine
        .generate_captcha(&service.config, &tags, &service.scheduler)
        .await?;
    let id_b64 = base64::engine::general_purpose::STANDARD.encode(generated.id);
    let html = form::render_form(&generated.tag, &generated.images, &id_b64, color, background);
    Ok(gzip_response(html, StatusCode::OK, "text/html"))
}

async fn handle_post(
    service: &Service,
    fields: &HashMap<String, String>,
) -> Result<Response<Vec<u8>>, Error> {
    let id = decode_id(fields)?;
    let selection: Vec<usize> = (0..9)
        .filter(|i| {
            fields
                .get(&format!("captchouli-{i}"))
                .map(|v| v == "on")
                .unwrap_or(false)
        })
        .collect();

    match service.engine.check_solution(&id, &selection).await? {
        VerifyOutcome::Solved => {
            let id_b64 = base64::engine::general_purpose::STANDARD.encode(id);
            Ok(gzip_response(id_b64, StatusCode::OK, "text/html"))
        }
        VerifyOutcome::WrongSolution => {
            let color = fields.get(COLOR_FIELD).map(String::as_str);
            let background = fields.get(BACKGROUND_FIELD).map(String::as_str);
            render_new_captcha(service, color, background).await
        }
        VerifyOutcome::Expired => Err(Error::InvalidId),
    }
}

async fn handle_status(
    service: &Service,
    fields: &HashMap<String, String>,
) -> Result<Response<Vec<u8>>, Error> {
    let id = decode_id(fields)?;
    let solved = service.engine.consume_solved(&id).await?;
    Ok(gzip_response(solved.to_string(), StatusCode::OK, "text/html"))
}

fn decode_id(fields: &HashMap<String, String>) -> Result<[u8; 64], Error> {
    let raw = fields.get(ID_FIELD).ok_or(Error::InvalidId)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| Error::InvalidId)?;
    bytes.try_into().map_err(|_| Error::InvalidId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_id_rejects_missing_field() {
        let fields = HashMap::new();
        assert!(matches!(decode_id(&fields), Err(Error::InvalidId)));
    }

    #[test]
    fn decode_id_rejects_wrong_length() {
        let mut fields = HashMap::new();
        fields.insert(
            ID_FIELD.to_string(),
            base64::engine::general_purpose::STANDARD.encode(b"too-short"),
        );
        assert!(matches!(decode_id(&fields), Err(Error::InvalidId)));
    }

    #[test]
    fn decode_id_accepts_64_bytes() {
        let mut fields = HashMap::new();
        fields.insert(
            ID_FIELD.to_string(),
            base64::engine::general_purpose::STANDARD.encode([7u8; 64]),
        );
        assert_eq!(decode_id(&fields).unwrap(), [7u8; 64]);
    }
}
