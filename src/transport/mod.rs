mod http_transport;

pub use http_transport::{sanitize_upstream_error, BodyStream, HttpTransport};
