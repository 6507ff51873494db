use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};

pub fn body_full(content: impl Into<Bytes>) -> BoxBody<Bytes, anyhow::Error> {
    Full::new(content.into())
        .map_err(anyhow::Error::new)
        .boxed()
}
