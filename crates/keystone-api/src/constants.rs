//! API constants

/// Prefix of every versioned route.
pub const API_PREFIX: &str = "/api/v1";

/// Where the OpenAPI document is served.
pub const OPENAPI_PATH: &str = "/api/openapi.json";
