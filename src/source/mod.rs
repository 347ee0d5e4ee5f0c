// Upstream collaborators — paged content API, image transport, offline fallback.

pub mod http_source;
pub mod store;
pub mod traits;
