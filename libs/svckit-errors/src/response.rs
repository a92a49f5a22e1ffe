//! HTTP rendering of classified errors.

use axum::response::{IntoResponse, Response};
use http::{header, HeaderValue, StatusCode};

use crate::error::Error;
use crate::kind::Kind;

pub fn status_for(kind: Kind) -> StatusCode {
    match kind {
        Kind::Validation => StatusCode::BAD_REQUEST,
        Kind::NotFound => StatusCode::NOT_FOUND,
        Kind::Precondition => StatusCode::PRECONDITION_FAILED,
        Kind::Permission => StatusCode::FORBIDDEN,
        Kind::Internal | Kind::Rpc | Kind::Custom => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut res = (status_for(self.kind), self.to_string()).into_response();
        res.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        let res = Error::new(Kind::NotFound).into_response();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            res.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(status_for(Kind::Custom), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
