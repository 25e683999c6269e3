//! Small `http_body_util` helpers shared by the CONNECT and forward
//! handlers so both can return the same boxed body type from a single
//! `service_fn`.

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Empty;
use http_body_util::Full;
use hyper::Response;
use hyper::StatusCode;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

pub fn denied_body(request_id: Option<&str>) -> BoxBody {
    let message = match request_id {
        Some(id) => format!("Denied by sandbox (request {id})"),
        None => "Denied by sandbox".to_string(),
    };
    Full::new(Bytes::from(message))
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

pub fn response_with(status: StatusCode, body: BoxBody) -> Response<BoxBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
