//! HTTP request construction for the ingestion endpoint
//!
//! Two request shapes:
//! - telemetry travels as a GET with every field in the query string
//! - images travel as a `multipart/form-data` POST whose raw header the hub
//!   writes itself, because the modem's own POST only supports url-encoded
//!   bodies
//!
//! The multipart body is never assembled in memory: the header, the body
//! head and the body tail are built here, and the image bytes are streamed
//! between them straight out of the reassembly buffer.

use core::fmt::Write as _;

use heapless::String;

use super::UplinkError;
use crate::telemetry::TelemetryRecord;

/// Capacity of a request URL
pub const URL_CAP: usize = 256;
/// Capacity of the raw POST request header
pub const HEADER_CAP: usize = 384;
/// Capacity of each multipart delimiter block
pub const PART_CAP: usize = 192;

/// Multipart boundary shared by every upload
pub const BOUNDARY: &str = "----FieldHubBoundary7MA4YWxkTrZu0gW";

/// Form field the backend reads the upload from
pub const FILE_FIELD: &str = "image";
pub const FILE_NAME: &str = "cam_capture.jpg";
pub const FILE_TYPE: &str = "image/jpeg";

pub type Url = String<URL_CAP>;

/// Components of an `http(s)://host[:port][/path]` URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlParts<'a> {
    pub secure: bool,
    /// Host, including an explicit port if one was given
    pub host: &'a str,
    /// Path without its trailing slash; empty for the root
    pub path: &'a str,
}

/// Split an absolute http/https URL; `None` for anything else
pub fn parse_url(url: &str) -> Option<UrlParts<'_>> {
    let (secure, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        return None;
    };

    let (host, path) = match rest.find(['/', '?']) {
        Some(at) => rest.split_at(at),
        None => (rest, ""),
    };
    if host.is_empty() || host.contains(|c: char| c.is_ascii_whitespace() || c == '@') {
        return None;
    }
    if path.contains(['?', '#']) || path.contains(|c: char| c.is_ascii_whitespace()) {
        return None;
    }

    Some(UrlParts {
        secure,
        host,
        path: path.trim_end_matches('/'),
    })
}

/// Append `value` percent-encoded, keeping the RFC 3986 unreserved set
pub fn percent_encode<const N: usize>(out: &mut String<N>, value: &str) -> Result<(), UplinkError> {
    for byte in value.bytes() {
        let unreserved = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~');
        if unreserved {
            out.push(byte as char).map_err(|_| UplinkError::Overflow)?;
        } else {
            write!(out, "%{:02X}", byte).map_err(|_| UplinkError::Overflow)?;
        }
    }
    Ok(())
}

fn write_base(out: &mut Url, url: &UrlParts<'_>) -> Result<(), UplinkError> {
    let scheme = if url.secure { "https" } else { "http" };
    write!(out, "{}://{}{}/", scheme, url.host, url.path).map_err(|_| UplinkError::Overflow)
}

/// GET target carrying one telemetry record
///
/// `{base}/?device_id=<id>&pct=<pct>&bat=<volts, 1 dp>&token=<token>`
pub fn telemetry_url(
    url: &UrlParts<'_>,
    token: &str,
    record: &TelemetryRecord,
) -> Result<Url, UplinkError> {
    let mut out = Url::new();
    write_base(&mut out, url)?;
    write!(
        out,
        "?device_id={}&pct={}&bat={:.1}&token=",
        record.node_id, record.moisture_pct, record.battery_volts
    )
    .map_err(|_| UplinkError::Overflow)?;
    percent_encode(&mut out, token)?;
    Ok(out)
}

/// URL handed to the modem ahead of a raw-header POST
///
/// Only used for DNS and the connection; the request line comes from
/// [`ImagePost::header`].
pub fn connect_url(url: &UrlParts<'_>) -> Result<Url, UplinkError> {
    let mut out = Url::new();
    write_base(&mut out, url)?;
    Ok(out)
}

/// Framing around one streamed image upload
#[derive(Debug, Clone)]
pub struct ImagePost {
    /// Raw HTTP request header, blank line included
    pub header: String<HEADER_CAP>,
    /// Multipart delimiter and part headers preceding the image bytes
    pub head: String<PART_CAP>,
    /// Closing multipart delimiter following the image bytes
    pub tail: String<PART_CAP>,
    pub image_len: usize,
}

impl ImagePost {
    pub fn new(url: &UrlParts<'_>, token: &str, image_len: usize) -> Result<Self, UplinkError> {
        let mut head: String<PART_CAP> = String::new();
        write!(
            head,
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            BOUNDARY, FILE_FIELD, FILE_NAME, FILE_TYPE
        )
        .map_err(|_| UplinkError::Overflow)?;

        let mut tail: String<PART_CAP> = String::new();
        write!(tail, "\r\n--{}--\r\n", BOUNDARY).map_err(|_| UplinkError::Overflow)?;

        let content_length = head.len() + image_len + tail.len();

        let mut header: String<HEADER_CAP> = String::new();
        write!(header, "POST {}/?token=", url.path).map_err(|_| UplinkError::Overflow)?;
        percent_encode(&mut header, token)?;
        write!(
            header,
            " HTTP/1.1\r\nHost: {}\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
            url.host, BOUNDARY, content_length
        )
        .map_err(|_| UplinkError::Overflow)?;

        Ok(Self {
            header,
            head,
            tail,
            image_len,
        })
    }

    /// Length of the multipart body
    pub fn content_length(&self) -> usize {
        self.head.len() + self.image_len + self.tail.len()
    }

    /// Bytes the modem must receive after `CONNECT`
    pub fn total_len(&self) -> usize {
        self.header.len() + self.content_length()
    }
}

/// Parse `<err>,<status>[,...]` after a `+QHTTPGET:`/`+QHTTPPOST:` prefix
pub fn parse_result(line: &str, prefix: &str) -> Option<(u16, u16)> {
    let rest = line.strip_prefix(prefix)?.trim();
    let mut fields = rest.split(',').map(str::trim);
    let err = fields.next()?.parse().ok()?;
    let status = match fields.next() {
        Some(status) => status.parse().ok()?,
        None => 0,
    };
    Some((err, status))
}
