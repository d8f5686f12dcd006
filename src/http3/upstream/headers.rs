// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Request validation and response header rewriting.

use std::net::SocketAddr;

use quiche::h3;
use quiche::h3::NameValue;

use crate::downstream::RequestHead;
use crate::downstream::ResponseHead;
use crate::settings::ProxySettings;

/// Why a request head was rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestError {
    /// Header count or byte limits exceeded; answer 431 and stop reading.
    HeaderLimits,
    /// Malformed request (bad method, bad `:protocol`, ...); answer 400.
    BadRequest,
    /// Neither `:authority` nor `host` on a non-CONNECT request in
    /// forward-proxy mode; close the stream with
    /// `H3_GENERAL_PROTOCOL_ERROR`, no reply.
    MissingAuthority,
}

/// Validates a received header section and condenses it into a
/// [`RequestHead`].
pub(crate) fn parse_request(
    headers: Vec<h3::Header>, has_body: bool, peer_addr: SocketAddr,
    settings: &ProxySettings,
) -> Result<RequestHead, RequestError> {
    check_header_limits(&headers, settings)?;

    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut protocol = None;
    let mut host = None;
    let mut content_length = None;
    let mut fields = Vec::with_capacity(headers.len());

    for header in headers {
        match header.name() {
            b":method" => method = Some(header.value().to_vec()),
            b":scheme" => scheme = Some(header.value().to_vec()),
            b":authority" => authority = Some(header.value().to_vec()),
            b":path" => path = Some(header.value().to_vec()),
            b":protocol" => protocol = Some(header.value().to_vec()),
            name if name.starts_with(b":") =>
                return Err(RequestError::BadRequest),
            b"host" => {
                host = Some(header.value().to_vec());
                fields.push(header);
            },
            b"content-length" => {
                content_length = std::str::from_utf8(header.value())
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok());
                if content_length.is_none() {
                    return Err(RequestError::BadRequest);
                }
                fields.push(header);
            },
            _ => fields.push(header),
        }
    }

    let method = method.ok_or(RequestError::BadRequest)?;
    if method.is_empty() || !method.iter().all(|b| is_token_char(*b)) {
        return Err(RequestError::BadRequest);
    }

    let is_connect = method == b"CONNECT";

    // `:protocol` is only meaningful on Extended CONNECT, and the only
    // tunnelled protocol this proxy speaks is websocket.
    let connect_protocol = match protocol.as_deref() {
        None => false,
        Some(b"websocket") if is_connect => true,
        Some(_) => return Err(RequestError::BadRequest),
    };

    let authority = authority.or(host);
    if authority.is_none() && !is_connect && settings.forward_proxy {
        return Err(RequestError::MissingAuthority);
    }

    let path = match path {
        Some(path) => rewrite_request_path(path, &method, settings),
        // Plain CONNECT has no path; Extended CONNECT must carry one.
        None if is_connect && !connect_protocol => Vec::new(),
        None => return Err(RequestError::BadRequest),
    };

    let expect_body = has_body;
    if !expect_body {
        content_length = Some(content_length.unwrap_or(0));
    }

    Ok(RequestHead {
        method,
        scheme,
        authority,
        path,
        headers: fields,
        content_length,
        connect_protocol,
        expect_body,
        peer_addr,
    })
}

fn check_header_limits(
    headers: &[h3::Header], settings: &ProxySettings,
) -> Result<(), RequestError> {
    if headers.len() > settings.max_request_header_fields {
        return Err(RequestError::HeaderLimits);
    }

    let total: usize = headers
        .iter()
        .map(|h| h.name().len() + h.value().len())
        .sum();
    if total > settings.request_header_field_buffer {
        return Err(RequestError::HeaderLimits);
    }

    Ok(())
}

/// Applies the request header limits to a trailer section.
///
/// Unlike the request section, where exceeding a limit fails the whole
/// request with 431, a trailer field past either cap is dropped on its own
/// and the fields before it survive.
pub(crate) fn clip_trailers(
    trailers: Vec<h3::Header>, settings: &ProxySettings,
) -> Vec<h3::Header> {
    let mut total_bytes = 0;
    let mut kept = Vec::with_capacity(trailers.len());

    for trailer in trailers {
        let field_bytes = trailer.name().len() + trailer.value().len();

        if kept.len() == settings.max_request_header_fields ||
            total_bytes + field_bytes > settings.request_header_field_buffer
        {
            continue;
        }

        total_bytes += field_bytes;
        kept.push(trailer);
    }

    kept
}

fn is_token_char(b: u8) -> bool {
    // tchar from RFC 9110
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' |
        b'.' | b'^' | b'_' | b'`' | b'|' | b'~' |
        b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// Applies the configured path policy to a request path.
///
/// Forward-proxy requests keep the raw path; `*` stays intact for OPTIONS;
/// everything else has its dot segments resolved.
pub(crate) fn rewrite_request_path(
    path: Vec<u8>, method: &[u8], settings: &ProxySettings,
) -> Vec<u8> {
    if settings.forward_proxy {
        return path;
    }

    if method == b"OPTIONS" && path == b"*" {
        return path;
    }

    clean_path(&path)
}

/// Resolves `.` and `..` segments per RFC 3986, leaving the query string
/// untouched.
pub(crate) fn clean_path(path: &[u8]) -> Vec<u8> {
    let (path, query) = match path.iter().position(|b| *b == b'?') {
        Some(pos) => (&path[..pos], Some(&path[pos..])),
        None => (path, None),
    };

    let mut segments: Vec<&[u8]> = Vec::new();
    // Whether the cleaned path ends in a slash (directory form).
    let mut trailing_slash = path.ends_with(b"/");

    for segment in path.split(|b| *b == b'/') {
        match segment {
            b"" | b"." => {},
            b".." => {
                segments.pop();
                trailing_slash = true;
            },
            _ => {
                segments.push(segment);
                trailing_slash = path.ends_with(b"/");
            },
        }
    }

    let mut out = Vec::with_capacity(path.len());
    if segments.is_empty() {
        out.push(b'/');
    } else {
        for segment in &segments {
            out.push(b'/');
            out.extend_from_slice(segment);
        }
        if trailing_slash {
            out.push(b'/');
        }
    }

    if let Some(query) = query {
        out.extend_from_slice(query);
    }

    out
}

/// Headers that must not travel beyond one hop.
fn is_hop_by_hop(name: &[u8]) -> bool {
    matches!(
        name,
        b"connection" |
            b"keep-alive" |
            b"proxy-connection" |
            b"transfer-encoding" |
            b"upgrade" |
            b"te"
    )
}

/// Builds the HTTP/3 response header section for a backend response.
///
/// Applies all configured transformations: status rewriting for tunnelled
/// websockets, the synthetic `server` header, the appended `via` hop, the
/// affinity cookie and any static additions.
pub(crate) fn build_response_headers(
    head: &ResponseHead, connect_protocol: bool,
    affinity_token: Option<&str>, settings: &ProxySettings,
) -> Vec<h3::Header> {
    // A backend 101 on a tunnelled websocket becomes a 200 on HTTP/3, and
    // the handshake confirmation header disappears with the upgrade
    // semantics (RFC 9220).
    let rewrite_upgrade = connect_protocol && head.status == 101;
    let status = if rewrite_upgrade { 200 } else { head.status };

    let mut out = Vec::with_capacity(head.headers.len() + 4);
    out.push(h3::Header::new(b":status", status.to_string().as_bytes()));

    let mut via_value: Option<Vec<u8>> = None;

    for header in &head.headers {
        let name = header.name();

        if is_hop_by_hop(name) {
            continue;
        }

        match name {
            b"via" => via_value = Some(header.value().to_vec()),
            b"server" if !settings.no_server_rewrite => {},
            b"sec-websocket-accept" if rewrite_upgrade => {},
            _ if settings.strip_response_headers_except_via => {},
            _ => out.push(header.clone()),
        }
    }

    if !settings.no_server_rewrite {
        out.push(h3::Header::new(
            b"server",
            settings.server_name.as_bytes(),
        ));
    }

    if !settings.no_via {
        let mut via = via_value.unwrap_or_default();
        if !via.is_empty() {
            via.extend_from_slice(b", ");
        }
        via.extend_from_slice(b"3 ");
        via.extend_from_slice(settings.server_name.as_bytes());
        out.push(h3::Header::new(b"via", &via));
    } else if let Some(via) = via_value {
        out.push(h3::Header::new(b"via", &via));
    }

    if let Some(token) = affinity_token {
        if let Some(name) = &settings.affinity_cookie_name {
            let mut cookie = format!("{name}={token}");
            if let Some(path) = &settings.affinity_cookie_path {
                cookie.push_str("; Path=");
                cookie.push_str(path);
            }
            if settings.affinity_cookie_secure {
                cookie.push_str("; Secure");
            }
            out.push(h3::Header::new(b"set-cookie", cookie.as_bytes()));
        }
    }

    for (name, value) in &settings.add_response_headers {
        out.push(h3::Header::new(name.as_bytes(), value.as_bytes()));
    }

    out
}

/// Builds the header section for a locally synthesized reply.
pub(crate) fn local_reply_headers(
    status: u16, settings: &ProxySettings, location: Option<&[u8]>,
) -> Vec<h3::Header> {
    let mut out = vec![
        h3::Header::new(b":status", status.to_string().as_bytes()),
        h3::Header::new(b"content-length", b"0"),
    ];

    if !settings.no_server_rewrite {
        out.push(h3::Header::new(
            b"server",
            settings.server_name.as_bytes(),
        ));
    }

    if let Some(location) = location {
        out.push(h3::Header::new(b"location", location));
    }

    out
}

/// The `location` value for a 308 HTTPS redirect of this request.
pub(crate) fn https_redirect_location(request: &RequestHead) -> Option<Vec<u8>> {
    let authority = request.authority.as_ref()?;

    let mut location = b"https://".to_vec();
    location.extend_from_slice(authority);
    location.extend_from_slice(&request.path);
    Some(location)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProxySettings {
        serde_json::from_str("{}").unwrap()
    }

    fn peer() -> SocketAddr {
        "192.0.2.9:4433".parse().unwrap()
    }

    fn get_request(extra: &[(&[u8], &[u8])]) -> Vec<h3::Header> {
        let mut headers = vec![
            h3::Header::new(b":method", b"GET"),
            h3::Header::new(b":scheme", b"https"),
            h3::Header::new(b":authority", b"example.org"),
            h3::Header::new(b":path", b"/"),
        ];
        for (name, value) in extra {
            headers.push(h3::Header::new(name, value));
        }
        headers
    }

    #[test]
    fn parses_a_plain_get() {
        let head =
            parse_request(get_request(&[]), false, peer(), &settings()).unwrap();

        assert_eq!(head.method, b"GET");
        assert_eq!(head.authority.as_deref(), Some(&b"example.org"[..]));
        assert_eq!(head.path, b"/");
        assert!(!head.expect_body);
        // Bodyless requests get an explicit zero length.
        assert_eq!(head.content_length, Some(0));
    }

    #[test]
    fn field_count_limit_yields_431() {
        let mut s = settings();
        s.max_request_header_fields = 4;

        let headers = get_request(&[(b"x-a", b"1")]);
        assert_eq!(
            parse_request(headers, false, peer(), &s),
            Err(RequestError::HeaderLimits)
        );
    }

    #[test]
    fn field_bytes_limit_yields_431() {
        let mut s = settings();
        s.request_header_field_buffer = 64;

        let headers = get_request(&[(b"x-padding", &[b'a'; 64])]);
        assert_eq!(
            parse_request(headers, false, peer(), &s),
            Err(RequestError::HeaderLimits)
        );
    }

    #[test]
    fn trailer_fields_over_the_count_cap_are_dropped() {
        let mut s = settings();
        s.max_request_header_fields = 2;

        let trailers = vec![
            h3::Header::new(b"x-checksum", b"abc"),
            h3::Header::new(b"x-status", b"ok"),
            h3::Header::new(b"x-overflow", b"nope"),
        ];

        let kept = clip_trailers(trailers, &s);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].name(), b"x-checksum");
        assert_eq!(kept[1].name(), b"x-status");
    }

    #[test]
    fn trailer_fields_over_the_byte_cap_are_dropped() {
        let mut s = settings();
        s.request_header_field_buffer = 32;

        let trailers = vec![
            h3::Header::new(b"x-a", b"1"),
            h3::Header::new(b"x-padding", &[b'a'; 64]),
            h3::Header::new(b"x-b", b"2"),
        ];

        // Only the oversized field disappears; its neighbors survive.
        let kept = clip_trailers(trailers, &s);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].name(), b"x-a");
        assert_eq!(kept[1].name(), b"x-b");
    }

    #[test]
    fn trailers_within_the_limits_are_untouched() {
        let trailers = vec![
            h3::Header::new(b"x-checksum", b"abc"),
            h3::Header::new(b"x-status", b"ok"),
        ];

        let kept = clip_trailers(trailers.clone(), &settings());
        assert_eq!(kept, trailers);
    }

    #[test]
    fn bad_method_is_rejected() {
        let headers = vec![
            h3::Header::new(b":method", b"GE T"),
            h3::Header::new(b":scheme", b"https"),
            h3::Header::new(b":authority", b"example.org"),
            h3::Header::new(b":path", b"/"),
        ];
        assert_eq!(
            parse_request(headers, false, peer(), &settings()),
            Err(RequestError::BadRequest)
        );
    }

    #[test]
    fn websocket_extended_connect_is_recognized() {
        let headers = vec![
            h3::Header::new(b":method", b"CONNECT"),
            h3::Header::new(b":scheme", b"https"),
            h3::Header::new(b":authority", b"example.org"),
            h3::Header::new(b":path", b"/chat"),
            h3::Header::new(b":protocol", b"websocket"),
        ];
        let head =
            parse_request(headers, true, peer(), &settings()).unwrap();
        assert!(head.connect_protocol);
    }

    #[test]
    fn unknown_connect_protocol_is_a_bad_request() {
        let headers = vec![
            h3::Header::new(b":method", b"CONNECT"),
            h3::Header::new(b":scheme", b"https"),
            h3::Header::new(b":authority", b"example.org"),
            h3::Header::new(b":path", b"/x"),
            h3::Header::new(b":protocol", b"webtransport"),
        ];
        assert_eq!(
            parse_request(headers, true, peer(), &settings()),
            Err(RequestError::BadRequest)
        );
    }

    #[test]
    fn missing_authority_in_forward_mode_closes_the_stream() {
        let mut s = settings();
        s.forward_proxy = true;

        let headers = vec![
            h3::Header::new(b":method", b"GET"),
            h3::Header::new(b":scheme", b"https"),
            h3::Header::new(b":path", b"/"),
        ];
        assert_eq!(
            parse_request(headers, false, peer(), &s),
            Err(RequestError::MissingAuthority)
        );
    }

    #[test]
    fn host_header_backfills_authority() {
        let headers = vec![
            h3::Header::new(b":method", b"GET"),
            h3::Header::new(b":scheme", b"https"),
            h3::Header::new(b":path", b"/"),
            h3::Header::new(b"host", b"fallback.example"),
        ];
        let head =
            parse_request(headers, false, peer(), &settings()).unwrap();
        assert_eq!(head.authority.as_deref(), Some(&b"fallback.example"[..]));
    }

    #[test]
    fn options_asterisk_is_preserved() {
        let headers = vec![
            h3::Header::new(b":method", b"OPTIONS"),
            h3::Header::new(b":scheme", b"https"),
            h3::Header::new(b":authority", b"example.org"),
            h3::Header::new(b":path", b"*"),
        ];
        let head =
            parse_request(headers, false, peer(), &settings()).unwrap();
        assert_eq!(head.path, b"*");
    }

    #[test]
    fn forward_proxy_leaves_the_path_raw() {
        let mut s = settings();
        s.forward_proxy = true;
        s.connections_per_host = 8;

        let headers = vec![
            h3::Header::new(b":method", b"GET"),
            h3::Header::new(b":scheme", b"http"),
            h3::Header::new(b":authority", b"example.org"),
            h3::Header::new(b":path", b"/a/../b"),
        ];
        let head = parse_request(headers, false, peer(), &s).unwrap();
        assert_eq!(head.path, b"/a/../b");
    }

    #[test]
    fn clean_path_resolves_dot_segments() {
        assert_eq!(clean_path(b"/a/b/../c"), b"/a/c");
        assert_eq!(clean_path(b"/a/./b/"), b"/a/b/");
        assert_eq!(clean_path(b"/../.."), b"/");
        assert_eq!(clean_path(b"/a//b"), b"/a/b");
        assert_eq!(clean_path(b"/a/b/../../../x"), b"/x");
        assert_eq!(clean_path(b"/a/../b?q=/../x"), b"/b?q=/../x");
        assert_eq!(clean_path(b"/"), b"/");
    }

    fn response(status: u16, headers: Vec<h3::Header>) -> ResponseHead {
        ResponseHead {
            status,
            headers,
            content_length: None,
            has_body: true,
        }
    }

    #[test]
    fn websocket_101_becomes_200_without_accept_header() {
        let head = response(101, vec![
            h3::Header::new(b"sec-websocket-accept", b"abc"),
            h3::Header::new(b"upgrade", b"websocket"),
        ]);

        let out = build_response_headers(&head, true, None, &settings());

        assert_eq!(out[0].value(), b"200");
        assert!(!out.iter().any(|h| h.name() == b"sec-websocket-accept"));
        assert!(!out.iter().any(|h| h.name() == b"upgrade"));
    }

    #[test]
    fn server_header_is_rewritten_and_via_appended() {
        let head = response(200, vec![
            h3::Header::new(b"server", b"backend/9"),
            h3::Header::new(b"via", b"1.1 edge"),
            h3::Header::new(b"x-upstream", b"ok"),
        ]);

        let out = build_response_headers(&head, false, None, &settings());

        let server: Vec<_> =
            out.iter().filter(|h| h.name() == b"server").collect();
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].value(), b"h3-ingress");

        let via = out.iter().find(|h| h.name() == b"via").unwrap();
        assert_eq!(via.value(), b"1.1 edge, 3 h3-ingress");

        assert!(out.iter().any(|h| h.name() == b"x-upstream"));
    }

    #[test]
    fn strip_all_except_via_keeps_only_via() {
        let mut s = settings();
        s.strip_response_headers_except_via = true;
        s.no_server_rewrite = true;

        let head = response(204, vec![
            h3::Header::new(b"via", b"1.1 edge"),
            h3::Header::new(b"x-secret", b"nope"),
        ]);

        let out = build_response_headers(&head, false, None, &s);
        assert!(out.iter().any(|h| h.name() == b"via"));
        assert!(!out.iter().any(|h| h.name() == b"x-secret"));
    }

    #[test]
    fn affinity_cookie_reflects_the_token() {
        let mut s = settings();
        s.affinity_cookie_name = Some("srv".into());
        s.affinity_cookie_path = Some("/".into());
        s.affinity_cookie_secure = true;

        let head = response(200, Vec::new());
        let out = build_response_headers(&head, false, Some("node7"), &s);

        let cookie = out.iter().find(|h| h.name() == b"set-cookie").unwrap();
        assert_eq!(cookie.value(), b"srv=node7; Path=/; Secure");
    }

    #[test]
    fn https_redirect_points_at_the_request_target() {
        let head = RequestHead {
            method: b"GET".to_vec(),
            scheme: Some(b"http".to_vec()),
            authority: Some(b"example.org".to_vec()),
            path: b"/login?next=/".to_vec(),
            headers: Vec::new(),
            content_length: Some(0),
            connect_protocol: false,
            expect_body: false,
            peer_addr: "127.0.0.1:1".parse().unwrap(),
        };

        assert_eq!(
            https_redirect_location(&head).unwrap(),
            b"https://example.org/login?next=/"
        );
    }
}
