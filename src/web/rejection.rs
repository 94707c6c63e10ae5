use std::convert::Infallible;

use warp::http::StatusCode;
use warp::{reject, Rejection, Reply};

use crate::error::Error;

/// Wraps a service-layer [`Error`] so it can travel through warp's
/// rejection machinery when a handler needs to bail out before it has a
/// response body to build.
#[derive(Debug)]
pub struct ServiceError(pub Error);

impl reject::Reject for ServiceError {}

/// Maps a service [`Error`] to the status code it should be reported as:
/// `InvalidId` (malformed or unknown captcha id) is the caller's fault,
/// everything else is a server-side condition.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidId | Error::InvalidSolution => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Catch-all for rejections warp itself generates (missing route, bad
/// form body) before a handler ever runs; mirrors
/// `warp_helpers::handle_rejection`'s structure but returns the plain-text
/// bodies the rest of this surface uses rather than JSON.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(ServiceError(e)) = err.find::<ServiceError>() {
        (status_for(e), e.to_string())
    } else if err.find::<warp::body::BodyDeserializeError>().is_some() {
        (StatusCode::BAD_REQUEST, "malformed request body".to_string())
    } else {
        log::error!("captchouli: unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    let reply = warp::reply::with_status(message, code);
    let reply = warp::reply::with_header(reply, "Cache-Control", "no-store, private");
    let reply = warp::reply::with_header(reply, "Access-Control-Allow-Origin", "*");
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_maps_to_bad_request() {
        assert_eq!(status_for(&Error::InvalidId), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn insufficient_pool_maps_to_server_error() {
        assert_eq!(
            status_for(&Error::InsufficientPool),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
