//! Protocol utilities for WebSocket request parsing
//!
//! Room routing comes from the request path; everything after the first
//! segment is ignored so clients are free to append query parameters.

/// Room used when the request path carries no usable name.
pub const DEFAULT_ROOM: &str = "default";

/// Parse the room name from a request URI.
///
/// The room is the first path segment, percent-decoded. `/`, an empty
/// segment, or an undecodable one all map to the default room.
pub fn parse_room_from_uri(uri: &str) -> String {
    let path = uri.split('?').next().unwrap_or("");
    let segment = path.trim_start_matches('/').split('/').next().unwrap_or("");
    if segment.is_empty() {
        return DEFAULT_ROOM.to_string();
    }
    match percent_encoding::percent_decode_str(segment).decode_utf8() {
        Ok(decoded) if !decoded.is_empty() => decoded.into_owned(),
        _ => DEFAULT_ROOM.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_room() {
        assert_eq!(parse_room_from_uri("/my-doc"), "my-doc");
        assert_eq!(parse_room_from_uri("/my-doc/extra/path"), "my-doc");
        assert_eq!(parse_room_from_uri("/my-doc?token=abc"), "my-doc");
        assert_eq!(parse_room_from_uri("/"), DEFAULT_ROOM);
        assert_eq!(parse_room_from_uri(""), DEFAULT_ROOM);
        assert_eq!(parse_room_from_uri("/?token=abc"), DEFAULT_ROOM);
    }

    #[test]
    fn test_parse_room_percent_decoding() {
        assert_eq!(parse_room_from_uri("/design%20notes"), "design notes");
        assert_eq!(parse_room_from_uri("/caf%C3%A9"), "café");
        // Undecodable sequences fall back rather than failing the handshake
        assert_eq!(parse_room_from_uri("/%ff%fe"), DEFAULT_ROOM);
    }
}
