use crate::config::IceServerConfig;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Prefix the URL with a scheme derived from the server type when it has none
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    let url = config.url.trim();
    if url.starts_with("turn:") || url.starts_with("turns:") || url.starts_with("stun:") {
        url.to_string()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, url)
    }
}
