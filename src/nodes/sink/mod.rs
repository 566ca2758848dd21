mod endpoint;

pub(crate) use endpoint::Endpoint;
