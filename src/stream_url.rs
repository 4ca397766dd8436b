use crate::error::ConsoleError;

/// Port the media server exposes its HLS playlists on.
pub const DEFAULT_HLS_PORT: u16 = 1935;

/// Rewrites an ingest URL (`rtmp://host/app/stream`) into its HLS delivery URL
/// (`http://host:1935/app/stream/playlist.m3u8`).
pub fn derive_playback_url(ingest_url: &str) -> Result<String, ConsoleError> {
    derive_playback_url_with_port(ingest_url, DEFAULT_HLS_PORT)
}

pub fn derive_playback_url_with_port(ingest_url: &str, port: u16) -> Result<String, ConsoleError> {
    let parts: Vec<&str> = ingest_url.trim().split('/').collect();
    if parts.len() < 4 {
        return Err(ConsoleError::InvalidStreamUrl(ingest_url.to_string()));
    }

    let host = strip_port(parts[2]);
    if host.is_empty() {
        return Err(ConsoleError::InvalidStreamUrl(ingest_url.to_string()));
    }
    let stream_path = parts[3..].join("/");

    Ok(format!("http://{host}:{port}/{stream_path}/playlist.m3u8"))
}

// The ingest port (1935 for RTMP) would otherwise end up doubled in front of
// the HLS port. Bracketed IPv6 literals keep their colons.
fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty()
                && !authority.ends_with(']')
                && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            host
        }
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_playback_url() {
        assert_eq!(
            derive_playback_url("rtmp://203.0.113.5/live/cam1").unwrap(),
            "http://203.0.113.5:1935/live/cam1/playlist.m3u8"
        );
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = derive_playback_url("rtmp://cams.example/live/a/b").unwrap();
        let b = derive_playback_url("rtmp://cams.example/live/a/b").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "http://cams.example:1935/live/a/b/playlist.m3u8");
    }

    #[test]
    fn test_ingest_port_is_replaced() {
        assert_eq!(
            derive_playback_url("rtmp://203.0.113.5:1935/live/cam1").unwrap(),
            "http://203.0.113.5:1935/live/cam1/playlist.m3u8"
        );
        assert_eq!(
            derive_playback_url_with_port("rtmp://[2001:db8::1]/live/x", 8080).unwrap(),
            "http://[2001:db8::1]:8080/live/x/playlist.m3u8"
        );
    }

    #[test]
    fn test_too_few_segments_fails() {
        for bad in ["", "rtmp://host", "rtmp:/host", "203.0.113.5/live"] {
            let err = derive_playback_url(bad).unwrap_err();
            assert_eq!(err.as_label(), "invalid_stream_url", "input {bad:?}");
        }
    }

    #[test]
    fn test_empty_host_fails() {
        assert!(derive_playback_url("rtmp:///live/cam1").is_err());
    }
}
