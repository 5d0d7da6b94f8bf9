use std::collections::HashMap;

use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};

use crate::config::CseConfig;
use crate::error::ZeroError;

pub fn hashmap_to_header_map(raw_map: &HashMap<String, String>) -> Result<HeaderMap, ZeroError> {
    let mut hdrs = HeaderMap::new();
    for (name_str, value_str) in raw_map {
        let name = HeaderName::from_bytes(name_str.as_bytes())
            .map_err(|e| ZeroError::Header(format!("{}: {}", name_str, e)))?;
        let value = HeaderValue::from_str(value_str)
            .map_err(|e| ZeroError::Header(format!("{}: {}", name_str, e)))?;
        hdrs.insert(name, value);
    }
    Ok(hdrs)
}

/// Headers sent with every oneM2M request: the configured extras plus
/// originator, request id, release version and `Accept: application/json`.
pub fn m2m_headers(cse: &CseConfig) -> Result<HeaderMap, ZeroError> {
    let mut hdrs = hashmap_to_header_map(&cse.headers)?;
    let fixed = [
        ("x-m2m-origin", cse.originator.as_str()),
        ("x-m2m-ri", cse.request_id.as_str()),
        ("x-m2m-rvi", cse.release.as_str()),
    ];
    for (name, value) in fixed {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ZeroError::Header(format!("{}: {}", name, e)))?;
        hdrs.insert(HeaderName::from_static(name), value);
    }
    hdrs.insert(ACCEPT, HeaderValue::from_static("application/json"));
    Ok(hdrs)
}
